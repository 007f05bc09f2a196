//! Strong block digest
//!
//! Collision-resistant fixed-width hash used to confirm weak-checksum
//! candidates. The default is SHA-1 (20 bytes); the `fnv-hash` feature
//! swaps in FNV-1a-64 (8 bytes), which is considerably faster but only
//! appropriate for non-adversarial content.

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Width of the strong digest in bytes.
#[cfg(feature = "fnv-hash")]
pub const STRONG_HASH_LEN: usize = 8;
/// Width of the strong digest in bytes.
#[cfg(not(feature = "fnv-hash"))]
pub const STRONG_HASH_LEN: usize = 20;

/// Fixed-width strong digest of a block's contents.
///
/// Equality is bytewise. The wire form is a lowercase hex string of
/// exactly `2 * STRONG_HASH_LEN` characters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct StrongHash([u8; STRONG_HASH_LEN]);

impl StrongHash {
    /// Digest `data`.
    #[cfg(not(feature = "fnv-hash"))]
    pub fn of(data: &[u8]) -> Self {
        use sha1::{Digest, Sha1};
        let mut hasher = Sha1::new();
        hasher.update(data);
        Self(hasher.finalize().into())
    }

    /// Digest `data`.
    #[cfg(feature = "fnv-hash")]
    pub fn of(data: &[u8]) -> Self {
        use std::hash::Hasher;
        let mut hasher = fnv::FnvHasher::default();
        hasher.write(data);
        Self(hasher.finish().to_be_bytes())
    }

    /// Raw digest bytes.
    pub fn as_bytes(&self) -> &[u8; STRONG_HASH_LEN] {
        &self.0
    }

    /// Lowercase hex rendering of the digest.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse the hex wire form, rejecting anything but exactly
    /// `2 * STRONG_HASH_LEN` hex characters.
    pub fn from_hex(text: &str) -> crate::Result<Self> {
        if text.len() != STRONG_HASH_LEN * 2 {
            return Err(Error::manifest(format!(
                "strong hash must be {} hex characters, got {}",
                STRONG_HASH_LEN * 2,
                text.len()
            )));
        }
        let mut bytes = [0u8; STRONG_HASH_LEN];
        hex::decode_to_slice(text, &mut bytes)
            .map_err(|e| Error::manifest(format!("invalid strong hash hex: {}", e)))?;
        Ok(Self(bytes))
    }
}

impl TryFrom<String> for StrongHash {
    type Error = Error;

    fn try_from(value: String) -> crate::Result<Self> {
        Self::from_hex(&value)
    }
}

impl From<StrongHash> for String {
    fn from(hash: StrongHash) -> Self {
        hash.to_hex()
    }
}
