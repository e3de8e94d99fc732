//! Content fingerprints
//!
//! A fingerprint is the SHA-256 digest of an object. The last eight digest
//! bytes, read big-endian, form the shard key used to partition the exchange.

use std::fmt;
use std::hash::{BuildHasher, Hash, Hasher};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::FabricError;

/// Fingerprint length in bytes
pub const FINGERPRINT_BYTES: usize = 32;

/// 32-byte content hash
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[repr(transparent)]
pub struct Fingerprint([u8; FINGERPRINT_BYTES]);

impl Fingerprint {
    /// Wrap raw digest bytes
    #[inline]
    pub const fn from_bytes(bytes: [u8; FINGERPRINT_BYTES]) -> Self {
        Self(bytes)
    }

    /// SHA-256 of `data`
    pub fn of(data: &[u8]) -> Self {
        let digest = Sha256::digest(data);
        let mut bytes = [0u8; FINGERPRINT_BYTES];
        bytes.copy_from_slice(&digest);
        Self(bytes)
    }

    /// Parse 64 hex digits
    pub fn from_hex(text: &str) -> Result<Self, FabricError> {
        let mut bytes = [0u8; FINGERPRINT_BYTES];
        hex::decode_to_slice(text, &mut bytes)
            .map_err(|e| FabricError::InvalidFingerprint(format!("{text}: {e}")))?;
        Ok(Self(bytes))
    }

    /// Raw bytes
    #[inline]
    pub fn as_bytes(&self) -> &[u8; FINGERPRINT_BYTES] {
        &self.0
    }

    /// Least significant 64 bits (big-endian tail), the sharding key
    #[inline]
    pub fn low_u64(&self) -> u64 {
        let mut tail = [0u8; 8];
        tail.copy_from_slice(&self.0[FINGERPRINT_BYTES - 8..]);
        u64::from_be_bytes(tail)
    }

    /// Lowercase hex rendering
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl Hash for Fingerprint {
    // The digest is already uniform; hashing only the shard key keeps
    // map lookups at one word.
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u64(self.low_u64());
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({})", &self.to_hex()[..16])
    }
}

/// Pass-through hasher for fingerprint-keyed maps
#[derive(Debug, Default, Clone, Copy)]
pub struct FingerprintHasher(u64);

impl Hasher for FingerprintHasher {
    #[inline]
    fn finish(&self) -> u64 {
        self.0
    }

    #[inline]
    fn write(&mut self, bytes: &[u8]) {
        for chunk in bytes.chunks(8) {
            let mut word = [0u8; 8];
            word[..chunk.len()].copy_from_slice(chunk);
            self.0 = self.0.rotate_left(5) ^ u64::from_le_bytes(word);
        }
    }

    #[inline]
    fn write_u64(&mut self, value: u64) {
        self.0 ^= value;
    }
}

/// `BuildHasher` for [`FingerprintHasher`]
#[derive(Debug, Default, Clone, Copy)]
pub struct FingerprintBuildHasher;

impl BuildHasher for FingerprintBuildHasher {
    type Hasher = FingerprintHasher;

    #[inline]
    fn build_hasher(&self) -> FingerprintHasher {
        FingerprintHasher::default()
    }
}
