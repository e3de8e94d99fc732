//! Process-wide memory: one system pool plus one pool per device
//!
//! Each pool sits behind its own lock, so reserve/release on one pool never
//! waits on another.

use std::collections::BTreeMap;

use fabric_common::config::MemoryConfig;
use parking_lot::Mutex;

use crate::mempool::{Mempool, MemoryError, PoolId, Reservation};
use crate::region::HostRegion;

/// All pools of a node
pub struct Memory {
    system: Mutex<Mempool>,
    system_region: HostRegion,
    devices: BTreeMap<u32, Mutex<Mempool>>,
    max_backup_pools: usize,
}

impl Memory {
    /// Build pools from configuration
    pub fn new(config: &MemoryConfig) -> Result<Self, MemoryError> {
        let system_bytes = config
            .system_num_chunks
            .checked_mul(config.chunk_size)
            .and_then(|b| usize::try_from(b).ok())
            .ok_or_else(|| MemoryError::InvalidOp("system pool size overflows".into()))?;
        let system_region = HostRegion::new(system_bytes)?;

        let system = Mempool::new(
            PoolId::System,
            system_region.addr(),
            config.system_num_chunks,
            config.chunk_size,
            config.range_list_capacity,
        )?;

        let mut devices = BTreeMap::new();
        for dev in &config.devices {
            // Device memory is addressed by offset from the device base.
            let pool = Mempool::new(
                PoolId::Device(dev.device_id),
                0,
                dev.num_chunks,
                dev.chunk_size,
                config.range_list_capacity,
            )?;
            if devices.insert(dev.device_id, Mutex::new(pool)).is_some() {
                return Err(MemoryError::InvalidOp(format!(
                    "device {} configured twice",
                    dev.device_id
                )));
            }
        }

        tracing::info!(
            system_chunks = config.system_num_chunks,
            chunk_size = config.chunk_size,
            devices = devices.len(),
            "memory pools ready"
        );

        Ok(Self {
            system: Mutex::new(system),
            system_region,
            devices,
            max_backup_pools: config.max_backup_pools,
        })
    }

    /// Host memory backing the system pool
    pub fn system_region(&self) -> &HostRegion {
        &self.system_region
    }

    /// Every pool id, system first
    pub fn pool_ids(&self) -> Vec<PoolId> {
        std::iter::once(PoolId::System)
            .chain(self.devices.keys().map(|&id| PoolId::Device(id)))
            .collect()
    }

    /// Reserve `size_bytes` from `pool`
    pub fn reserve_memory(&self, pool: PoolId, size_bytes: u64) -> Result<Reservation, MemoryError> {
        self.pool(pool)?.lock().reserve(size_bytes)
    }

    /// Return a reservation to the pool that granted it
    pub fn release_memory(&self, reservation: &Reservation) -> Result<(), MemoryError> {
        self.pool(reservation.pool_id)?.lock().release(reservation)
    }

    /// Reserve from `preferred`, falling back to `backups` in order while
    /// the failure is out-of-memory.
    ///
    /// At most `max_backup_pools` backups are tried; the last OOM is
    /// returned if every pool is exhausted.
    pub fn reserve_with_backup(
        &self,
        preferred: PoolId,
        backups: &[PoolId],
        size_bytes: u64,
    ) -> Result<Reservation, MemoryError> {
        let mut last = match self.reserve_memory(preferred, size_bytes) {
            Ok(r) => return Ok(r),
            Err(e @ MemoryError::PoolOom { .. }) => e,
            Err(e) => return Err(e),
        };

        for &pool in backups.iter().take(self.max_backup_pools) {
            match self.reserve_memory(pool, size_bytes) {
                Ok(r) => {
                    tracing::debug!(%preferred, backup = %pool, size_bytes, "reserved from backup pool");
                    return Ok(r);
                }
                Err(e @ MemoryError::PoolOom { .. }) => last = e,
                Err(e) => return Err(e),
            }
        }

        tracing::warn!(%preferred, size_bytes, tried = backups.len().min(self.max_backup_pools) + 1, "all pools exhausted");
        Err(last)
    }

    /// Free chunks of `pool`
    pub fn free_chunks(&self, pool: PoolId) -> Result<u64, MemoryError> {
        Ok(self.pool(pool)?.lock().free_chunks())
    }

    /// Run `f` with exclusive access to `pool`
    pub fn with_pool<R>(&self, pool: PoolId, f: impl FnOnce(&mut Mempool) -> R) -> Result<R, MemoryError> {
        Ok(f(&mut self.pool(pool)?.lock()))
    }

    fn pool(&self, pool: PoolId) -> Result<&Mutex<Mempool>, MemoryError> {
        match pool {
            PoolId::System => Ok(&self.system),
            PoolId::Device(id) => self.devices.get(&id).ok_or(MemoryError::UnknownPool(pool)),
        }
    }
}
