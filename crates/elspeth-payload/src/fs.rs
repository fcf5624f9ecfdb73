// crates/elspeth-payload/src/fs.rs
// ============================================================================
// Module: Filesystem Payload Store
// Description: Content-addressed store over a fan-out directory.
// Purpose: Durable payload persistence for resumable runs.
// Dependencies: elspeth-core
// ============================================================================

//! ## Overview
//! Payloads are written to `<root>/<hh>/<hash>` where `hh` is the first two
//! hex characters of the content hash. Writes go through a temporary file
//! and an atomic rename so a crash never leaves a partial payload under its
//! final name.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::fs;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;

use elspeth_core::PayloadError;
use elspeth_core::PayloadHash;
use elspeth_core::PayloadStore;

use crate::payload_hash_of;

// ============================================================================
// SECTION: Store
// ============================================================================

/// Filesystem content-addressed payload store.
///
/// # Invariants
/// - Append-only: existing payload files are never rewritten.
/// - A payload file is visible under its final name only when complete.
#[derive(Debug, Clone)]
pub struct FsPayloadStore {
    /// Root directory of the store.
    root: PathBuf,
}

impl FsPayloadStore {
    /// Opens (creating if needed) a payload store rooted at `root`.
    ///
    /// # Errors
    ///
    /// Returns [`PayloadError::Io`] when the root cannot be created.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, PayloadError> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|err| PayloadError::Io(err.to_string()))?;
        Ok(Self {
            root,
        })
    }

    /// Returns the store's root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Returns the final path for a content hash.
    fn path_for(&self, hash: &PayloadHash) -> Result<PathBuf, PayloadError> {
        let hex = hash.as_str();
        if hex.len() < 3 || !hex.bytes().all(|byte| byte.is_ascii_hexdigit()) {
            return Err(PayloadError::Invalid(format!("malformed payload hash: {hex}")));
        }
        Ok(self.root.join(&hex[.. 2]).join(hex))
    }
}

impl PayloadStore for FsPayloadStore {
    fn store(&self, bytes: &[u8]) -> Result<PayloadHash, PayloadError> {
        let hash = payload_hash_of(bytes);
        let path = self.path_for(&hash)?;
        if path.exists() {
            return Ok(hash);
        }
        let Some(parent) = path.parent() else {
            return Err(PayloadError::Invalid("payload path has no parent".to_string()));
        };
        fs::create_dir_all(parent).map_err(|err| PayloadError::Io(err.to_string()))?;
        let tmp = parent.join(format!(".{}.tmp", hash.as_str()));
        {
            let mut file =
                fs::File::create(&tmp).map_err(|err| PayloadError::Io(err.to_string()))?;
            file.write_all(bytes).map_err(|err| PayloadError::Io(err.to_string()))?;
            file.sync_all().map_err(|err| PayloadError::Io(err.to_string()))?;
        }
        fs::rename(&tmp, &path).map_err(|err| PayloadError::Io(err.to_string()))?;
        Ok(hash)
    }

    fn retrieve(&self, hash: &PayloadHash) -> Result<Vec<u8>, PayloadError> {
        let path = self.path_for(hash)?;
        if !path.exists() {
            return Err(PayloadError::Purged(hash.as_str().to_string()));
        }
        let bytes = fs::read(&path).map_err(|err| PayloadError::Io(err.to_string()))?;
        let actual = payload_hash_of(&bytes);
        if actual != *hash {
            return Err(PayloadError::Invalid(format!(
                "payload content mismatch for {}",
                hash.as_str()
            )));
        }
        Ok(bytes)
    }
}
