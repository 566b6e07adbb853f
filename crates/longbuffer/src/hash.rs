//! StreamHash: the SHA-256 digest of every byte written to a stream.
//!
//! The digest is accumulated in write order, so it does not depend on how the
//! bytes were split into writes or segments. Once the stream is closed its hex
//! form doubles as the HTTP entity tag.

use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// A SHA-256 content hash (32 bytes, 64 hex chars).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamHash([u8; 32]);

/// Errors that can occur when parsing a hash from text.
#[derive(Debug, Error)]
pub enum HashError {
    #[error("invalid hash length: expected 64 hex chars, got {0}")]
    InvalidLength(usize),

    #[error("invalid hex character in hash")]
    InvalidHex,
}

impl StreamHash {
    /// Hash data in one shot.
    pub fn of(data: &[u8]) -> Self {
        Self(Sha256::digest(data).into())
    }

    /// Snapshot a running hasher without consuming it.
    pub(crate) fn snapshot(hasher: &Sha256) -> Self {
        Self(hasher.clone().finalize().into())
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Lowercase hex rendering.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for StreamHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl FromStr for StreamHash {
    type Err = HashError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != 64 {
            return Err(HashError::InvalidLength(s.len()));
        }
        let mut bytes = [0u8; 32];
        hex::decode_to_slice(s, &mut bytes).map_err(|_| HashError::InvalidHex)?;
        Ok(Self(bytes))
    }
}

impl AsRef<[u8]> for StreamHash {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}
