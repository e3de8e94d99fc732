//! Fabric Memory - Chunk pools for registered buffers
//!
//! A [`Mempool`] hands out contiguous chunk ranges from one address space
//! with best-fit placement and coalescing release. [`Memory`] owns the
//! system pool (backed by a [`HostRegion`]) and any device pools, and retries
//! exhausted reservations on backup pools.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod memory;
pub mod mempool;
pub mod region;

pub use memory::Memory;
pub use mempool::{MemRange, Mempool, MemoryError, PoolId, Reservation};
pub use region::HostRegion;
