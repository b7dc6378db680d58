//! Placing images into person directories without ever losing a copy.
//!
//! Move mode runs a verified protocol: checksum the source, copy, confirm
//! the destination exists with the same size and checksum, and only then
//! delete the source. Any failure removes the partial destination and
//! leaves the source untouched.

use crate::fingerprint::sha256_file;
use serde::{Deserialize, Serialize};
use std::ffi::OsStr;
use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

/// Numbered-suffix attempts before falling back to a timestamp.
const MAX_SUFFIX_ATTEMPTS: u32 = 10_000;
/// Retries when a chosen destination is claimed by a concurrent writer.
const RESERVE_ATTEMPTS: usize = 16;

/// The steps of a verified move, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MoveStep {
    SourceChecksum,
    Copy,
    VerifyExists,
    VerifySize,
    DestinationChecksum,
    CompareChecksums,
    RemoveSource,
}

impl std::fmt::Display for MoveStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            MoveStep::SourceChecksum => "source checksum",
            MoveStep::Copy => "copy",
            MoveStep::VerifyExists => "destination existence check",
            MoveStep::VerifySize => "size verification",
            MoveStep::DestinationChecksum => "destination checksum",
            MoveStep::CompareChecksums => "checksum comparison",
            MoveStep::RemoveSource => "source removal",
        };
        f.write_str(name)
    }
}

#[derive(Error, Debug)]
pub enum MoveError {
    #[error("{step} failed: {reason}")]
    Step { step: MoveStep, reason: String },
    #[error("destination directory {path} is not writable: {source}")]
    Unwritable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl MoveError {
    fn at(step: MoveStep, reason: impl ToString) -> Self {
        MoveError::Step {
            step,
            reason: reason.to_string(),
        }
    }

    pub fn step(&self) -> Option<MoveStep> {
        match self {
            MoveError::Step { step, .. } => Some(*step),
            MoveError::Unwritable { .. } => None,
        }
    }
}

/// Result of one placement attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MoveOutcome {
    pub source_path: PathBuf,
    /// Destination chosen for the attempt. On failure the file there has been removed.
    pub destination_path: Option<PathBuf>,
    pub verified: bool,
    pub error: Option<String>,
    pub failed_step: Option<MoveStep>,
    /// Source checksum (move mode only).
    pub checksum: Option<String>,
    /// Copy skipped because the destination already held identical content.
    pub already_present: bool,
    pub moved: bool,
}

impl MoveOutcome {
    fn new(source: &Path) -> Self {
        Self {
            source_path: source.to_path_buf(),
            destination_path: None,
            verified: false,
            error: None,
            failed_step: None,
            checksum: None,
            already_present: false,
            moved: false,
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// Filesystem primitives used by the mover.
pub trait FileOps: Send + Sync {
    fn checksum(&self, path: &Path) -> io::Result<String>;
    /// Copy into a destination that must not exist yet (`AlreadyExists` otherwise).
    fn copy(&self, from: &Path, to: &Path) -> io::Result<u64>;
    fn exists(&self, path: &Path) -> bool;
    fn size(&self, path: &Path) -> io::Result<u64>;
    fn remove(&self, path: &Path) -> io::Result<()>;
}

pub struct StdFileOps;

impl FileOps for StdFileOps {
    fn checksum(&self, path: &Path) -> io::Result<String> {
        sha256_file(path)
    }

    fn copy(&self, from: &Path, to: &Path) -> io::Result<u64> {
        let mut reader = File::open(from)?;
        let mut writer = OpenOptions::new().write(true).create_new(true).open(to)?;
        let bytes = io::copy(&mut reader, &mut writer)?;
        writer.sync_all()?;
        if let Ok(modified) = reader.metadata().and_then(|m| m.modified()) {
            let _ = writer.set_modified(modified);
        }
        Ok(bytes)
    }

    fn exists(&self, path: &Path) -> bool {
        path.is_file()
    }

    fn size(&self, path: &Path) -> io::Result<u64> {
        Ok(std::fs::metadata(path)?.len())
    }

    fn remove(&self, path: &Path) -> io::Result<()> {
        std::fs::remove_file(path)
    }
}

#[derive(Clone)]
pub struct SafeMover {
    ops: Arc<dyn FileOps>,
}

impl Default for SafeMover {
    fn default() -> Self {
        Self::new()
    }
}

impl SafeMover {
    pub fn new() -> Self {
        Self::with_ops(Arc::new(StdFileOps))
    }

    pub fn with_ops(ops: Arc<dyn FileOps>) -> Self {
        Self { ops }
    }

    /// Copy or move `source` into `dest_dir` under a name that does not
    /// collide with an existing file.
    pub fn place(&self, source: &Path, dest_dir: &Path, move_file: bool) -> MoveOutcome {
        let mut outcome = MoveOutcome::new(source);
        let result = if move_file {
            self.move_verified(source, dest_dir, &mut outcome)
        } else {
            self.copy_checked(source, dest_dir, &mut outcome)
        };

        if let Err(e) = result {
            tracing::error!(
                source = %source.display(),
                dest_dir = %dest_dir.display(),
                error = %e,
                "placement failed; source preserved"
            );
            outcome.failed_step = e.step();
            outcome.error = Some(e.to_string());
            outcome.verified = false;
        }
        outcome
    }

    fn copy_checked(&self, source: &Path, dest_dir: &Path, outcome: &mut MoveOutcome) -> Result<(), MoveError> {
        let file_name = file_name(source)?;
        if let Some(existing) = self.existing_copy(source, dest_dir, file_name) {
            tracing::debug!(dest = %existing.display(), "identical file already present; copy skipped");
            outcome.destination_path = Some(existing);
            outcome.already_present = true;
            outcome.verified = true;
            return Ok(());
        }

        let source_size = self.ops.size(source).map_err(|e| MoveError::at(MoveStep::Copy, e))?;
        let dest = self.copy_into(source, dest_dir, file_name)?;
        outcome.destination_path = Some(dest.clone());

        if !self.ops.exists(&dest) {
            self.discard(&dest);
            return Err(MoveError::at(MoveStep::VerifyExists, "destination missing after copy"));
        }
        match self.ops.size(&dest) {
            Ok(size) if size == source_size => {}
            Ok(size) => {
                self.discard(&dest);
                return Err(MoveError::at(
                    MoveStep::VerifySize,
                    format!("expected {source_size} bytes, found {size}"),
                ));
            }
            Err(e) => {
                self.discard(&dest);
                return Err(MoveError::at(MoveStep::VerifySize, e));
            }
        }
        outcome.verified = true;
        Ok(())
    }

    fn move_verified(&self, source: &Path, dest_dir: &Path, outcome: &mut MoveOutcome) -> Result<(), MoveError> {
        let file_name = file_name(source)?;

        // 1
        let source_size = self
            .ops
            .size(source)
            .map_err(|e| MoveError::at(MoveStep::SourceChecksum, e))?;
        let source_sum = self
            .ops
            .checksum(source)
            .map_err(|e| MoveError::at(MoveStep::SourceChecksum, e))?;
        outcome.checksum = Some(source_sum.clone());

        // 2
        let dest = self.copy_into(source, dest_dir, file_name)?;
        outcome.destination_path = Some(dest.clone());

        // 3..6
        if let Err(e) = self.verify_copy(&dest, source_size, &source_sum) {
            self.discard(&dest);
            return Err(e);
        }
        outcome.verified = true;
        tracing::debug!(source = %source.display(), dest = %dest.display(), "copy verified");

        // 7
        if let Err(e) = self.ops.remove(source) {
            if self.ops.exists(source) {
                self.discard(&dest);
                outcome.verified = false;
                return Err(MoveError::at(MoveStep::RemoveSource, e));
            }
            tracing::warn!(source = %source.display(), error = %e, "source removal reported an error but the source is gone");
        }
        outcome.moved = true;
        Ok(())
    }

    fn verify_copy(&self, dest: &Path, source_size: u64, source_sum: &str) -> Result<(), MoveError> {
        if !self.ops.exists(dest) {
            return Err(MoveError::at(MoveStep::VerifyExists, "destination missing after copy"));
        }
        let dest_size = self
            .ops
            .size(dest)
            .map_err(|e| MoveError::at(MoveStep::VerifySize, e))?;
        if dest_size != source_size {
            return Err(MoveError::at(
                MoveStep::VerifySize,
                format!("expected {source_size} bytes, found {dest_size}"),
            ));
        }
        let dest_sum = self
            .ops
            .checksum(dest)
            .map_err(|e| MoveError::at(MoveStep::DestinationChecksum, e))?;
        if dest_sum != source_sum {
            return Err(MoveError::at(
                MoveStep::CompareChecksums,
                format!("source {source_sum} != destination {dest_sum}"),
            ));
        }
        Ok(())
    }

    /// Copy to a fresh name, retrying if another writer claims it first.
    fn copy_into(&self, source: &Path, dest_dir: &Path, file_name: &OsStr) -> Result<PathBuf, MoveError> {
        for _ in 0..RESERVE_ATTEMPTS {
            let dest = unique_destination(dest_dir, file_name);
            match self.ops.copy(source, &dest) {
                Ok(_) => return Ok(dest),
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
                Err(e) => {
                    self.discard(&dest);
                    return Err(MoveError::at(MoveStep::Copy, e));
                }
            }
        }
        Err(MoveError::at(
            MoveStep::Copy,
            format!("no free destination name in {}", dest_dir.display()),
        ))
    }

    /// A file in `dest_dir` with the same bytes as `source`, looked up among
    /// the names `unique_destination` hands out for `file_name`.
    fn existing_copy(&self, source: &Path, dest_dir: &Path, file_name: &OsStr) -> Option<PathBuf> {
        let source_size = self.ops.size(source).ok()?;
        let mut source_sum = None;
        let name = SuffixedName::parse(file_name);
        let series = std::iter::once(dest_dir.join(file_name))
            .chain((name.start..name.start.saturating_add(MAX_SUFFIX_ATTEMPTS)).map(|n| name.path(dest_dir, n)));

        for candidate in series {
            if !self.ops.exists(&candidate) {
                break;
            }
            if self.ops.size(&candidate).ok() != Some(source_size) {
                continue;
            }
            if source_sum.is_none() {
                source_sum = Some(self.ops.checksum(source).ok()?);
            }
            if self.ops.checksum(&candidate).ok() == source_sum {
                return Some(candidate);
            }
        }
        None
    }

    fn discard(&self, dest: &Path) {
        match self.ops.remove(dest) {
            Ok(()) => tracing::debug!(dest = %dest.display(), "partial destination removed"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => tracing::error!(dest = %dest.display(), error = %e, "failed to remove partial destination"),
        }
    }
}

fn file_name(source: &Path) -> Result<&OsStr, MoveError> {
    source
        .file_name()
        .ok_or_else(|| MoveError::at(MoveStep::Copy, "source has no file name"))
}

/// A file name split for numbered suffixing: `base_N.ext`, starting at `start`.
struct SuffixedName {
    base: String,
    ext: String,
    start: u32,
}

impl SuffixedName {
    /// `img_3.jpg` continues at 4. Zero-padded counters such as camera
    /// sequence numbers (`IMG_0001`) belong to the stem.
    fn parse(file_name: &OsStr) -> Self {
        let as_path = Path::new(file_name);
        let stem = as_path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let ext = as_path
            .extension()
            .map(|e| format!(".{}", e.to_string_lossy()))
            .unwrap_or_default();

        let continued = stem
            .rsplit_once('_')
            .filter(|(base, n)| !base.is_empty() && is_suffix_counter(n))
            .map(|(base, n)| (base.to_string(), n.parse::<u32>().map(|n| n.saturating_add(1)).unwrap_or(1)));
        let (base, start) = continued.unwrap_or((stem, 1));
        Self { base, ext, start }
    }

    fn path(&self, dir: &Path, counter: u32) -> PathBuf {
        dir.join(format!("{}_{counter}{}", self.base, self.ext))
    }
}

fn is_suffix_counter(n: &str) -> bool {
    !n.is_empty() && n.bytes().all(|b| b.is_ascii_digit()) && !(n.len() > 1 && n.starts_with('0'))
}

/// First free name for `file_name` in `dir`: the name itself, then
/// `stem_1.ext`, `stem_2.ext`, ... An existing numeric suffix is continued
/// (`img_3.jpg` → `img_4.jpg`).
pub fn unique_destination(dir: &Path, file_name: &OsStr) -> PathBuf {
    let preferred = dir.join(file_name);
    if !preferred.exists() {
        return preferred;
    }

    let name = SuffixedName::parse(file_name);
    for counter in name.start..name.start.saturating_add(MAX_SUFFIX_ATTEMPTS) {
        let candidate = name.path(dir, counter);
        if !candidate.exists() {
            return candidate;
        }
    }

    let stamp = chrono::Local::now().format("%Y%m%d_%H%M%S_%f");
    dir.join(format!("{}_{stamp}{}", name.base, name.ext))
}

/// Create `dir` if needed and prove a file can be written in it.
pub fn ensure_writable(dir: &Path) -> Result<(), MoveError> {
    let unwritable = |source| MoveError::Unwritable {
        path: dir.to_path_buf(),
        source,
    };
    std::fs::create_dir_all(dir).map_err(unwritable)?;
    tempfile::Builder::new()
        .prefix(".facesort-write-check")
        .tempfile_in(dir)
        .map_err(unwritable)?;
    Ok(())
}
