//! Requested plugin artifacts.

use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

use crate::{Error, Result};

/// A plugin artifact requested for loading.
///
/// Carries the on-disk path, the SHA-256 of the file content, and an
/// optional detached signature read from a sibling `.asc` file.
#[derive(Debug, Clone)]
pub struct RequestedPlugin {
    path: PathBuf,
    checksum: [u8; 32],
    signature: Option<Vec<u8>>,
}

impl RequestedPlugin {
    /// Create a request from a file on disk, hashing its content.
    pub fn from_path(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let checksum = hash_file(&path)?;
        Ok(Self {
            path,
            checksum,
            signature: None,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn checksum(&self) -> &[u8; 32] {
        &self.checksum
    }

    pub fn signature(&self) -> Option<&[u8]> {
        self.signature.as_deref()
    }

    pub fn set_signature(&mut self, data: Vec<u8>) {
        self.signature = Some(data);
    }

    /// Read a detached signature file and attach it.
    pub fn read_signature_file(&mut self, path: &Path) -> Result<()> {
        self.signature = Some(std::fs::read(path)?);
        Ok(())
    }

    /// Re-hash the file and compare against an externally supplied
    /// checksum. The upload path computes the digest over the wire and
    /// requires equality with the digest of what landed on disk.
    pub fn verify_checksum(&self, expected: &[u8; 32]) -> Result<()> {
        let current = hash_file(&self.path)?;
        if &current != expected || expected != &self.checksum {
            return Err(Error::Integrity);
        }
        Ok(())
    }

    /// Re-hash the file and compare against the checksum captured when
    /// the request was built.
    pub fn revalidate(&self) -> Result<()> {
        if hash_file(&self.path)? != self.checksum {
            return Err(Error::Integrity);
        }
        Ok(())
    }
}

/// SHA-256 of a file's content.
pub fn hash_file(path: &Path) -> Result<[u8; 32]> {
    let bytes = std::fs::read(path)?;
    Ok(hash_bytes(&bytes))
}

/// SHA-256 of a byte slice.
pub fn hash_bytes(bytes: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hasher.finalize().into()
}
