use std::io;
use std::io::Write;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::debug;

/// Cache identity for a request: lowercase hex SHA-256 of `method + "+" + url`.
///
/// The URL must be the canonical client-form rendering (scheme, authority,
/// path, raw query). Headers never participate.
pub fn fingerprint(method: &str, url: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(method.as_bytes());
    hasher.update(b"+");
    hasher.update(url.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("failed to create cache directory {path}: {source}")]
    CreateRoot { path: String, source: io::Error },
    #[error("failed to read cached object {fingerprint}: {source}")]
    Read {
        fingerprint: String,
        source: io::Error,
    },
    #[error("failed to write cached object {fingerprint}: {source}")]
    Write {
        fingerprint: String,
        source: io::Error,
    },
}

/// Filesystem-backed byte store, one object per fingerprint.
///
/// Objects hold the full HTTP/1.1 response in wire form and are immutable in
/// effect: same-key writes carry equivalent content, so replacement is
/// permitted. Writes land in a sibling temp file and rename into place, so a
/// concurrent reader never observes a partial object.
#[derive(Debug, Clone)]
pub struct ResponseCache {
    root: PathBuf,
}

impl ResponseCache {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, CacheError> {
        let root = root.into();
        std::fs::create_dir_all(&root).map_err(|source| CacheError::CreateRoot {
            path: root.display().to_string(),
            source,
        })?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The empty fingerprint is never present; callers use it to opt a
    /// request out of caching entirely.
    pub fn exists(&self, fingerprint: &str) -> bool {
        if fingerprint.is_empty() {
            return false;
        }
        self.root.join(fingerprint).is_file()
    }

    pub fn read(&self, fingerprint: &str) -> Result<Vec<u8>, CacheError> {
        let bytes = std::fs::read(self.root.join(fingerprint)).map_err(|source| {
            CacheError::Read {
                fingerprint: fingerprint.to_string(),
                source,
            }
        })?;
        debug!(fingerprint, bytes = bytes.len(), "serving cached object");
        Ok(bytes)
    }

    pub fn write(&self, fingerprint: &str, bytes: &[u8]) -> Result<(), CacheError> {
        let write_err = |source| CacheError::Write {
            fingerprint: fingerprint.to_string(),
            source,
        };

        let mut staged = tempfile::NamedTempFile::new_in(&self.root).map_err(write_err)?;
        staged.write_all(bytes).map_err(write_err)?;
        staged
            .persist(self.root.join(fingerprint))
            .map_err(|error| write_err(error.error))?;
        debug!(fingerprint, bytes = bytes.len(), "wrote cached object");
        Ok(())
    }
}
