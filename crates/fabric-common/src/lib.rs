//! Fabric Common - Shared types for the RDMA compute fabric
//!
//! This crate provides the primitives every fabric component agrees on:
//! - Content fingerprints (the key of the inventory and the exchange)
//! - Table sizing and runtime configuration
//! - Error classification
//! - Tracing bootstrap
//!
//! # Layering
//!
//! ```text
//! fabric-exchange ──► fabric-channel ──► fabric-memory ──► fabric-structures
//!        │                  │                  │                   │
//!        └──────────────────┴──────────────────┴───────────────────┴──► fabric-common
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod error;
pub mod fingerprint;
pub mod telemetry;

pub use config::{FabricConfig, TableConfig};
pub use error::*;
pub use fingerprint::{Fingerprint, FingerprintBuildHasher, FINGERPRINT_BYTES};

use std::sync::atomic::{AtomicU64, Ordering};

/// Nanosecond wall-clock timestamp
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct Timestamp(u64);

impl Timestamp {
    /// Current time (nanoseconds since the Unix epoch)
    #[inline(always)]
    pub fn now() -> Self {
        use std::time::{SystemTime, UNIX_EPOCH};
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or_default();
        Self(nanos)
    }

    /// Raw nanoseconds
    #[inline(always)]
    pub fn as_nanos(&self) -> u64 {
        self.0
    }

    /// Microseconds elapsed since this timestamp (saturating)
    #[inline(always)]
    pub fn elapsed_micros(&self) -> u64 {
        Self::now().0.saturating_sub(self.0) / 1000
    }
}

/// Relaxed atomic counter used for cheap bookkeeping on shared entries
#[derive(Debug, Default)]
pub struct AtomicCounter(AtomicU64);

impl AtomicCounter {
    /// Create new counter
    pub const fn new(value: u64) -> Self {
        Self(AtomicU64::new(value))
    }

    /// Increment and return previous value
    #[inline(always)]
    pub fn inc(&self) -> u64 {
        self.0.fetch_add(1, Ordering::Relaxed)
    }

    /// Add `n`
    #[inline(always)]
    pub fn add(&self, n: u64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }

    /// Current value
    #[inline(always)]
    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}
