//! Persistent fingerprint-keyed cache of reference encodings and match decisions.
//!
//! On disk the cache is a JSON Lines file: one record per line, later lines
//! win, malformed lines are dropped on load. It is read fully at startup and
//! rewritten atomically (temp file + rename) by [`FingerprintCache::flush`].
//! A disabled cache never answers a lookup and never writes.

use crate::config::Backend;
use crate::fingerprint::{FileStamp, Fingerprint};
use crate::types::{Encoding, MatchDecision};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::File;
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("cache I/O on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("cache serialization: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("cache persist: {0}")]
    Persist(#[from] tempfile::PersistError),
}

/// What a fingerprint maps to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CachePayload {
    /// Encoding of a single-face reference photo, valid only under the same
    /// `context` (detection settings). Records without one never match.
    Encoding {
        encoding: Encoding,
        #[serde(default)]
        context: String,
    },
    /// Match outcome of an input image, valid only under the same `context`
    /// (registry digest, tolerance and detection settings).
    Decision {
        decision: MatchDecision,
        context: String,
    },
}

impl CachePayload {
    fn is_well_formed(&self) -> bool {
        match self {
            CachePayload::Encoding { encoding, .. } => {
                encoding.dim() > 0 && encoding.values.iter().all(|v| v.is_finite())
            }
            CachePayload::Decision { context, .. } => !context.is_empty(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum CacheRecord {
    Entry {
        fingerprint: String,
        payload: CachePayload,
        created_at: DateTime<Utc>,
    },
    File {
        path: PathBuf,
        size: u64,
        mtime_ns: u64,
        digest: String,
    },
}

#[derive(Debug, Clone)]
struct StoredEntry {
    payload: CachePayload,
    created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct FileRecord {
    stamp: FileStamp,
    digest: String,
}

/// Counters reported by [`FingerprintCache::stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub entries: usize,
    pub indexed_files: usize,
    pub hits: u64,
    pub misses: u64,
}

/// Fingerprint cache shared by reference across worker threads.
pub struct FingerprintCache {
    /// `None` when the cache is disabled.
    path: Option<PathBuf>,
    entries: RwLock<HashMap<String, StoredEntry>>,
    files: RwLock<HashMap<PathBuf, FileRecord>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl FingerprintCache {
    /// Cache file location for a backend inside `cache_dir`.
    pub fn path_for(cache_dir: &Path, backend: Backend) -> PathBuf {
        cache_dir.join(format!("facesort-{}.jsonl", backend.as_str()))
    }

    /// A cache that is bypassed on read and never written.
    pub fn disabled() -> Self {
        Self::with_state(None, HashMap::new(), HashMap::new())
    }

    /// Load the cache at `path`. A missing, unreadable or partially corrupt
    /// file never fails startup: unusable content is skipped.
    pub fn open(path: PathBuf) -> Self {
        let (entries, files) = match File::open(&path) {
            Ok(file) => load_records(BufReader::new(file), &path),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "no cache file yet");
                (HashMap::new(), HashMap::new())
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "cache unreadable; starting empty");
                (HashMap::new(), HashMap::new())
            }
        };
        tracing::info!(
            path = %path.display(),
            entries = entries.len(),
            indexed_files = files.len(),
            "fingerprint cache loaded"
        );
        Self::with_state(Some(path), entries, files)
    }

    fn with_state(
        path: Option<PathBuf>,
        entries: HashMap<String, StoredEntry>,
        files: HashMap<PathBuf, FileRecord>,
    ) -> Self {
        Self {
            path,
            entries: RwLock::new(entries),
            files: RwLock::new(files),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.path.is_some()
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Fingerprint `path`, reusing the indexed digest only when both size
    /// and mtime are unchanged since it was recorded. Any difference forces
    /// a full content hash.
    pub fn fingerprint(&self, path: &Path) -> io::Result<Fingerprint> {
        if !self.is_enabled() {
            return Fingerprint::compute(path);
        }
        let stamp = FileStamp::read(path)?;
        if let Some(record) = read_lock(&self.files).get(path) {
            if record.stamp == stamp {
                return Ok(Fingerprint {
                    digest: record.digest.clone(),
                    size: stamp.size,
                });
            }
        }

        let fingerprint = Fingerprint::compute(path)?;
        self.index(path, stamp, &fingerprint, FileStamp::read(path)?);
        Ok(fingerprint)
    }

    /// Remember `fingerprint` for `path` under the stamp read before hashing,
    /// unless the file changed while it was being hashed.
    fn index(&self, path: &Path, before: FileStamp, fingerprint: &Fingerprint, after: FileStamp) {
        if before != after || before.size != fingerprint.size {
            tracing::debug!(path = %path.display(), "file changed while hashing; not indexed");
            return;
        }
        write_lock(&self.files).insert(
            path.to_path_buf(),
            FileRecord {
                stamp: before,
                digest: fingerprint.digest.clone(),
            },
        );
    }

    pub fn lookup(&self, fingerprint: &Fingerprint) -> Option<CachePayload> {
        if !self.is_enabled() {
            return None;
        }
        let found = read_lock(&self.entries)
            .get(&fingerprint.key())
            .map(|entry| entry.payload.clone());
        let counter = if found.is_some() { &self.hits } else { &self.misses };
        counter.fetch_add(1, Ordering::Relaxed);
        found
    }

    /// Cached decision for `fingerprint`, if computed under the same `context`.
    pub fn lookup_decision(&self, fingerprint: &Fingerprint, context: &str) -> Option<MatchDecision> {
        match self.lookup(fingerprint)? {
            CachePayload::Decision {
                decision,
                context: stored,
            } if stored == context => Some(decision),
            _ => None,
        }
    }

    /// Cached reference encoding for `fingerprint`, if computed under the same `context`.
    pub fn lookup_encoding(&self, fingerprint: &Fingerprint, context: &str) -> Option<Encoding> {
        match self.lookup(fingerprint)? {
            CachePayload::Encoding {
                encoding,
                context: stored,
            } if stored == context => Some(encoding),
            _ => None,
        }
    }

    /// Insert or replace the entry for `fingerprint`. Last writer wins.
    pub fn store(&self, fingerprint: &Fingerprint, payload: CachePayload) {
        if !self.is_enabled() {
            return;
        }
        write_lock(&self.entries).insert(
            fingerprint.key(),
            StoredEntry {
                payload,
                created_at: Utc::now(),
            },
        );
    }

    /// Drop the entry for `fingerprint`; returns whether one existed.
    pub fn invalidate(&self, fingerprint: &Fingerprint) -> bool {
        if !self.is_enabled() {
            return false;
        }
        write_lock(&self.entries).remove(&fingerprint.key()).is_some()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: read_lock(&self.entries).len(),
            indexed_files: read_lock(&self.files).len(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }

    /// Atomically replace the cache file with the current in-memory state.
    pub fn flush(&self) -> Result<(), CacheError> {
        let Some(path) = self.path.as_deref() else {
            return Ok(());
        };
        let dir = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        std::fs::create_dir_all(&dir).map_err(|source| CacheError::Io {
            path: dir.clone(),
            source,
        })?;

        let io_err = |source| CacheError::Io {
            path: path.to_path_buf(),
            source,
        };

        let tmp = tempfile::NamedTempFile::new_in(&dir).map_err(io_err)?;
        let written = {
            let mut writer = BufWriter::new(tmp.as_file());
            let count = self.write_records(&mut writer)?;
            writer.flush().map_err(io_err)?;
            count
        };
        tmp.as_file().sync_all().map_err(io_err)?;
        tmp.persist(path)?;

        tracing::info!(path = %path.display(), records = written, "fingerprint cache flushed");
        Ok(())
    }

    fn write_records(&self, writer: &mut impl Write) -> Result<usize, CacheError> {
        let path = self.path.as_deref().unwrap_or(Path::new(""));
        let io_err = |source| CacheError::Io {
            path: path.to_path_buf(),
            source,
        };

        let mut records: Vec<CacheRecord> = Vec::new();
        {
            let files = read_lock(&self.files);
            let mut paths: Vec<&PathBuf> = files.keys().collect();
            paths.sort();
            for p in paths {
                let record = &files[p];
                records.push(CacheRecord::File {
                    path: p.clone(),
                    size: record.stamp.size,
                    mtime_ns: record.stamp.mtime_ns,
                    digest: record.digest.clone(),
                });
            }
        }
        {
            let entries = read_lock(&self.entries);
            let mut keys: Vec<&String> = entries.keys().collect();
            keys.sort();
            for key in keys {
                let entry = &entries[key];
                records.push(CacheRecord::Entry {
                    fingerprint: key.clone(),
                    payload: entry.payload.clone(),
                    created_at: entry.created_at,
                });
            }
        }

        for record in &records {
            serde_json::to_writer(&mut *writer, record)?;
            writer.write_all(b"\n").map_err(io_err)?;
        }
        Ok(records.len())
    }
}

fn load_records(
    reader: impl BufRead,
    path: &Path,
) -> (HashMap<String, StoredEntry>, HashMap<PathBuf, FileRecord>) {
    let mut entries = HashMap::new();
    let mut files = HashMap::new();
    let mut dropped = 0usize;

    for line in reader.lines() {
        let Ok(line) = line else {
            dropped += 1;
            break;
        };
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<CacheRecord>(&line) {
            Ok(CacheRecord::Entry {
                fingerprint,
                payload,
                created_at,
            }) if Fingerprint::from_key(&fingerprint).is_some() && payload.is_well_formed() => {
                entries.insert(fingerprint, StoredEntry { payload, created_at });
            }
            Ok(CacheRecord::File {
                path,
                size,
                mtime_ns,
                digest,
            }) if Fingerprint::from_key(&format!("{digest}:{size}")).is_some() => {
                files.insert(
                    path,
                    FileRecord {
                        stamp: FileStamp { size, mtime_ns },
                        digest,
                    },
                );
            }
            _ => dropped += 1,
        }
    }

    if dropped > 0 {
        tracing::debug!(path = %path.display(), dropped, "dropped malformed cache records");
    }
    (entries, files)
}

// A poisoned lock still guards a structurally valid map: inserts and removes
// are single HashMap calls.
fn read_lock<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|e| e.into_inner())
}

fn write_lock<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|e| e.into_inner())
}
