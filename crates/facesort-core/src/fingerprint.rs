//! Content fingerprints and full-file checksums.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;
use std::time::UNIX_EPOCH;

const READ_BLOCK_SIZE: usize = 64 * 1024;

/// Stable identity of a file's content: SHA-256 digest plus byte length.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Fingerprint {
    pub digest: String,
    pub size: u64,
}

impl Fingerprint {
    /// Hash the full content of `path`.
    pub fn compute(path: &Path) -> io::Result<Self> {
        let size = std::fs::metadata(path)?.len();
        let digest = sha256_file(path)?;
        Ok(Self { digest, size })
    }

    /// Cache key: `"<digest>:<size>"`.
    pub fn key(&self) -> String {
        format!("{}:{}", self.digest, self.size)
    }

    /// Parse a key produced by [`key`](Self::key).
    pub fn from_key(key: &str) -> Option<Self> {
        let (digest, size) = key.rsplit_once(':')?;
        let valid_digest = digest.len() == 64 && digest.bytes().all(|b| b.is_ascii_hexdigit());
        if !valid_digest {
            return None;
        }
        Some(Self {
            digest: digest.to_string(),
            size: size.parse().ok()?,
        })
    }
}

/// Size and modification time, the cheap pre-check before a full hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileStamp {
    pub size: u64,
    pub mtime_ns: u64,
}

impl FileStamp {
    pub fn read(path: &Path) -> io::Result<Self> {
        let metadata = std::fs::metadata(path)?;
        let mtime_ns = metadata
            .modified()?
            .duration_since(UNIX_EPOCH)
            .map(|d| u64::try_from(d.as_nanos()).unwrap_or(u64::MAX))
            .unwrap_or(0);
        Ok(Self {
            size: metadata.len(),
            mtime_ns,
        })
    }
}

/// Hex-encoded SHA-256 of a file, read in 64 KiB blocks.
pub fn sha256_file(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; READ_BLOCK_SIZE];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(to_hex(&hasher.finalize()))
}

pub(crate) fn to_hex(bytes: &[u8]) -> String {
    use std::fmt::Write;
    bytes.iter().fold(String::with_capacity(bytes.len() * 2), |mut out, b| {
        let _ = write!(out, "{b:02x}");
        out
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sha256_known_vector() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("abc.txt");
        std::fs::write(&path, b"abc").unwrap();
        assert_eq!(
            sha256_file(&path).unwrap(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_fingerprint_changes_with_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.bin");
        std::fs::write(&path, b"first").unwrap();
        let before = Fingerprint::compute(&path).unwrap();
        std::fs::write(&path, b"other").unwrap();
        let after = Fingerprint::compute(&path).unwrap();
        assert_eq!(before.size, after.size);
        assert_ne!(before, after);
    }

    #[test]
    fn test_key_parses_back() {
        let fp = Fingerprint {
            digest: "a".repeat(64),
            size: 1234,
        };
        assert_eq!(Fingerprint::from_key(&fp.key()), Some(fp));
    }

    #[test]
    fn test_from_key_rejects_garbage() {
        assert_eq!(Fingerprint::from_key("not-a-key"), None);
        assert_eq!(Fingerprint::from_key(&format!("{}:xyz", "a".repeat(64))), None);
        assert_eq!(Fingerprint::from_key("abc:12"), None);
    }

    #[test]
    fn test_sha256_missing_file_is_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(sha256_file(&dir.path().join("missing")).is_err());
    }
}
