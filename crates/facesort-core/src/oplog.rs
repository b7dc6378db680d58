//! JSON Lines audit trail of every placement attempt.

use crate::mover::MoveOutcome;
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum OpLogError {
    #[error("cannot open operation log {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Copy,
    Move,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    Success,
    Failed,
}

/// One line of the operation log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationRecord {
    pub timestamp: DateTime<Local>,
    pub operation: Operation,
    pub source: PathBuf,
    pub destination: Option<PathBuf>,
    pub person: String,
    pub distance: Option<f32>,
    pub size: Option<u64>,
    pub checksum: Option<String>,
    pub status: OperationStatus,
    pub error: Option<String>,
}

impl OperationRecord {
    pub fn from_outcome(outcome: &MoveOutcome, person: &str, distance: Option<f32>, moved: bool, size: Option<u64>) -> Self {
        Self {
            timestamp: Local::now(),
            operation: if moved { Operation::Move } else { Operation::Copy },
            source: outcome.source_path.clone(),
            destination: outcome.destination_path.clone(),
            person: person.to_string(),
            distance,
            size,
            checksum: outcome.checksum.clone(),
            status: if outcome.is_success() {
                OperationStatus::Success
            } else {
                OperationStatus::Failed
            },
            error: outcome.error.clone(),
        }
    }
}

pub struct OperationLog {
    path: PathBuf,
    writer: Mutex<BufWriter<File>>,
}

impl OperationLog {
    /// Create `file-operations-<YYYYMMDD_HHMMSS>.jsonl` in `dir`.
    pub fn create(dir: &Path) -> Result<Self, OpLogError> {
        let name = format!("file-operations-{}.jsonl", Local::now().format("%Y%m%d_%H%M%S"));
        let path = dir.join(name);
        let open_err = |source| OpLogError::Open {
            path: path.clone(),
            source,
        };
        std::fs::create_dir_all(dir).map_err(open_err)?;
        let file = File::options()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(open_err)?;
        tracing::info!(path = %path.display(), "operation log opened");
        Ok(Self {
            path,
            writer: Mutex::new(BufWriter::new(file)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one record. Audit failures are logged, never fatal to the image.
    pub fn record(&self, record: &OperationRecord) {
        let mut writer = self.writer.lock().unwrap_or_else(|e| e.into_inner());
        let result = serde_json::to_writer(&mut *writer, record)
            .map_err(std::io::Error::from)
            .and_then(|()| writer.write_all(b"\n"));
        if let Err(e) = result {
            tracing::warn!(path = %self.path.display(), error = %e, "operation log write failed");
        }
    }

    pub fn flush(&self) {
        let mut writer = self.writer.lock().unwrap_or_else(|e| e.into_inner());
        if let Err(e) = writer.flush() {
            tracing::warn!(path = %self.path.display(), error = %e, "operation log flush failed");
        }
    }
}

impl Drop for OperationLog {
    fn drop(&mut self) {
        self.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mover::SafeMover;

    #[test]
    fn test_records_are_json_lines() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("a.jpg");
        std::fs::write(&source, b"bytes").unwrap();
        let dest_dir = dir.path().join("ana");
        std::fs::create_dir_all(&dest_dir).unwrap();
        let outcome = SafeMover::new().place(&source, &dest_dir, true);

        let log = OperationLog::create(&dir.path().join("logs")).unwrap();
        log.record(&OperationRecord::from_outcome(&outcome, "ana", Some(0.31), true, Some(5)));
        let mut failed = outcome.clone();
        failed.error = Some("copy failed: disk full".into());
        log.record(&OperationRecord::from_outcome(&failed, "ana", None, false, None));
        log.flush();

        let text = std::fs::read_to_string(log.path()).unwrap();
        let records: Vec<OperationRecord> = text
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].operation, Operation::Move);
        assert_eq!(records[0].status, OperationStatus::Success);
        assert!(records[0].checksum.is_some());
        assert_eq!(records[1].status, OperationStatus::Failed);
        assert!(log
            .path()
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with("file-operations-"));
    }
}
