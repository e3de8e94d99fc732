//! Fabric configuration
//!
//! Every section carries defaults, so an empty (or missing) TOML file yields
//! a working single-node setup.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{FabricError, FabricResult};

/// Largest payload a single RDMA message may carry
pub const PATH_MTU: u32 = 4096;

/// Maximum offer locations carried by one match notification
pub const MAX_FINGERPRINT_MATCH_LOCATIONS: usize = 24;

/// Upper bound on pools tried after an out-of-memory reservation
pub const MEMORY_MAX_BACKUP_POOLS: usize = 16;

/// Packet and transfer ids are 24-bit wire fields
pub const PACKET_ID_SPACE: u32 = 1 << 24;

/// Sizing policy of one resizable hash table.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TableConfig {
    /// Initial and minimum slot count
    pub min_size: u64,
    /// Slot count never exceeded by growth
    pub max_size: u64,
    /// Grow once `count > size * load_factor`
    pub load_factor: f64,
    /// Shrink once `count < size * shrink_factor`
    pub shrink_factor: f64,
}

impl TableConfig {
    /// Build a config without validation
    pub const fn new(min_size: u64, max_size: u64, load_factor: f64, shrink_factor: f64) -> Self {
        Self {
            min_size,
            max_size,
            load_factor,
            shrink_factor,
        }
    }

    /// Fixed-size table that never resizes
    pub const fn fixed(size: u64) -> Self {
        Self::new(size, size, 1.0, 0.0)
    }

    /// Root level of a fast tree (high 32 key bits)
    pub const fn tree_32() -> Self {
        Self::new(2, 1 << 32, 0.5, 0.25)
    }

    /// Middle level of a fast tree (16 key bits)
    pub const fn tree_16() -> Self {
        Self::new(2, 1 << 16, 0.5, 0.25)
    }

    /// Byte-indexed levels (8 key bits)
    pub const fn tree_8() -> Self {
        Self::new(2, 1 << 8, 0.5, 0.25)
    }

    /// Endpoint index of a mempool with `num_chunks` chunks
    pub fn mempool_endpoints(num_chunks: u64) -> Self {
        Self::new(256.min(num_chunks.max(1)), num_chunks.max(1), 0.5, 0.25)
    }

    /// Reject configurations the table cannot honour
    pub fn validate(&self) -> FabricResult<()> {
        if self.min_size == 0 {
            return Err(FabricError::InvalidConfig("table min_size must be > 0".into()));
        }
        if self.min_size > self.max_size {
            return Err(FabricError::InvalidConfig(format!(
                "table min_size {} exceeds max_size {}",
                self.min_size, self.max_size
            )));
        }
        if !(self.load_factor > 0.0 && self.load_factor <= 1.0) {
            return Err(FabricError::InvalidConfig(format!(
                "table load_factor {} outside (0, 1]",
                self.load_factor
            )));
        }
        if !(self.shrink_factor >= 0.0 && self.shrink_factor < 1.0) {
            return Err(FabricError::InvalidConfig(format!(
                "table shrink_factor {} outside [0, 1)",
                self.shrink_factor
            )));
        }
        if self.shrink_factor >= self.load_factor {
            return Err(FabricError::InvalidConfig(
                "table shrink_factor must be below load_factor".into(),
            ));
        }
        Ok(())
    }
}

impl Default for TableConfig {
    fn default() -> Self {
        Self::new(1 << 10, 1 << 20, 0.5, 0.1)
    }
}

/// Root configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FabricConfig {
    /// Logging
    pub log: LogConfig,
    /// Memory pools
    pub memory: MemoryConfig,
    /// Control message channels
    pub channel: ChannelConfig,
    /// Packetised transfers
    pub data_channel: DataChannelConfig,
    /// Exchange shard
    pub exchange: ExchangeConfig,
    /// Completion polling
    pub poller: PollerConfig,
}

impl FabricConfig {
    /// Parse from TOML text and validate
    pub fn from_toml_str(text: &str) -> FabricResult<Self> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a file; a missing file yields defaults
    pub fn load(path: impl AsRef<Path>) -> FabricResult<Self> {
        let path = path.as_ref();
        if !path.exists() {
            tracing::warn!(path = %path.display(), "config not found, using defaults");
            return Ok(Self::default());
        }
        let text = fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// Cross-field checks
    pub fn validate(&self) -> FabricResult<()> {
        self.memory.validate()?;
        self.channel.validate()?;
        self.data_channel.validate()?;
        self.exchange.validate()?;
        Ok(())
    }
}

/// Logging section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is unset
    pub filter: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            filter: "info".into(),
        }
    }
}

/// One device memory pool
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DevicePoolConfig {
    /// Device ordinal
    pub device_id: u32,
    /// Number of chunks managed
    pub num_chunks: u64,
    /// Chunk size in bytes
    pub chunk_size: u64,
}

/// Memory section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// System pool chunk size in bytes
    pub chunk_size: u64,
    /// System pool chunk count
    pub system_num_chunks: u64,
    /// Device pools
    pub devices: Vec<DevicePoolConfig>,
    /// Pools tried after an out-of-memory reservation
    pub max_backup_pools: usize,
    /// Node buffer reserved for each size bucket list
    pub range_list_capacity: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            chunk_size: 4096,
            system_num_chunks: 1 << 14,
            devices: Vec::new(),
            max_backup_pools: MEMORY_MAX_BACKUP_POOLS,
            range_list_capacity: 1,
        }
    }
}

impl MemoryConfig {
    fn validate(&self) -> FabricResult<()> {
        if self.chunk_size == 0 || self.system_num_chunks == 0 {
            return Err(FabricError::InvalidConfig(
                "memory chunk_size and system_num_chunks must be > 0".into(),
            ));
        }
        for dev in &self.devices {
            if dev.chunk_size == 0 || dev.num_chunks == 0 {
                return Err(FabricError::InvalidConfig(format!(
                    "device {} pool must have chunks",
                    dev.device_id
                )));
            }
        }
        Ok(())
    }
}

/// Control channel section
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// Ring slots (and outstanding work requests) per channel
    pub capacity: u32,
    /// Bytes per ring slot
    pub message_size: u32,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            capacity: 256,
            message_size: PATH_MTU,
        }
    }
}

impl ChannelConfig {
    fn validate(&self) -> FabricResult<()> {
        if self.capacity == 0 || self.message_size == 0 {
            return Err(FabricError::InvalidConfig(
                "channel capacity and message_size must be > 0".into(),
            ));
        }
        Ok(())
    }
}

/// Data channel section
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DataChannelConfig {
    /// Payload bytes per packet (16-bit wire field)
    pub packet_max_bytes: u32,
    /// Packet ids wrap at this value
    pub max_packet_id: u32,
    /// Packet table upper bound
    pub max_packets: u64,
    /// Transfer table upper bound
    pub max_transfers: u64,
}

impl Default for DataChannelConfig {
    fn default() -> Self {
        Self {
            packet_max_bytes: PATH_MTU,
            max_packet_id: PACKET_ID_SPACE,
            max_packets: 1 << 16,
            max_transfers: 1 << 12,
        }
    }
}

impl DataChannelConfig {
    fn validate(&self) -> FabricResult<()> {
        if self.packet_max_bytes == 0 || self.packet_max_bytes > u16::MAX as u32 {
            return Err(FabricError::InvalidConfig(format!(
                "packet_max_bytes {} must be in 1..=65535",
                self.packet_max_bytes
            )));
        }
        if self.max_packet_id == 0 || self.max_packet_id > PACKET_ID_SPACE {
            return Err(FabricError::InvalidConfig(format!(
                "max_packet_id {} must be in 1..=2^24",
                self.max_packet_id
            )));
        }
        if self.max_packets < 1 || self.max_transfers < 1 {
            return Err(FabricError::InvalidConfig(
                "data channel tables must hold at least one entry".into(),
            ));
        }
        Ok(())
    }

    /// Packet table sizing
    pub fn packet_table(&self) -> TableConfig {
        TableConfig::new((1 << 10).min(self.max_packets), self.max_packets, 0.5, 0.1)
    }

    /// Transfer table sizing
    pub fn transfer_table(&self) -> TableConfig {
        TableConfig::new((1 << 10).min(self.max_transfers), self.max_transfers, 0.5, 0.1)
    }
}

/// Exchange shard section
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExchangeConfig {
    /// First shard key owned (inclusive)
    pub start_val: u64,
    /// Last shard key owned (inclusive)
    pub end_val: u64,
    /// Bid entries kept
    pub max_bids: u64,
    /// Offer entries kept
    pub max_offers: u64,
    /// Future entries kept
    pub max_futures: u64,
    /// Offer locations per bid match notification
    pub max_match_locations: usize,
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self {
            start_val: 0,
            end_val: u64::MAX,
            max_bids: 1 << 20,
            max_offers: 1 << 30,
            max_futures: 1 << 20,
            max_match_locations: MAX_FINGERPRINT_MATCH_LOCATIONS,
        }
    }
}

impl ExchangeConfig {
    fn validate(&self) -> FabricResult<()> {
        if self.start_val > self.end_val {
            return Err(FabricError::InvalidConfig(format!(
                "exchange start_val {:#x} above end_val {:#x}",
                self.start_val, self.end_val
            )));
        }
        if self.max_match_locations == 0 || self.max_match_locations > MAX_FINGERPRINT_MATCH_LOCATIONS {
            return Err(FabricError::InvalidConfig(format!(
                "max_match_locations must be in 1..={MAX_FINGERPRINT_MATCH_LOCATIONS}"
            )));
        }
        Ok(())
    }
}

/// Completion poll strategy selector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PollStrategyKind {
    /// Spin with a CPU pause hint
    #[default]
    BusySpin,
    /// Yield the thread between empty polls
    Yield,
    /// Sleep `park_micros` between empty polls
    Park,
}

/// Completion poller section
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollerConfig {
    /// Behaviour on an empty poll
    pub strategy: PollStrategyKind,
    /// Sleep used by `park`
    pub park_micros: u64,
    /// Completions drained per poll call
    pub max_poll_entries: usize,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            strategy: PollStrategyKind::BusySpin,
            park_micros: 50,
            max_poll_entries: 64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_defaults_validate() {
        let config = FabricConfig::default();
        config.validate().unwrap();
        assert_eq!(config.channel.message_size, PATH_MTU);
        assert_eq!(config.exchange.max_match_locations, 24);
    }

    #[test]
    fn test_partial_toml() {
        let text = r#"
            [memory]
            chunk_size = 8192

            [[memory.devices]]
            device_id = 0
            num_chunks = 1024
            chunk_size = 65536

            [poller]
            strategy = "park"
            park_micros = 10
        "#;

        let config = FabricConfig::from_toml_str(text).unwrap();
        assert_eq!(config.memory.chunk_size, 8192);
        assert_eq!(config.memory.system_num_chunks, 1 << 14);
        assert_eq!(config.memory.devices.len(), 1);
        assert_eq!(config.poller.strategy, PollStrategyKind::Park);
        assert_eq!(config.channel, ChannelConfig::default());
    }

    #[test]
    fn test_rejects_wide_packets() {
        let text = "[data_channel]\npacket_max_bytes = 70000\n";
        assert!(matches!(
            FabricConfig::from_toml_str(text),
            Err(FabricError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_table_config_validation() {
        assert!(TableConfig::tree_32().validate().is_ok());
        assert!(TableConfig::new(0, 8, 0.5, 0.25).validate().is_err());
        assert!(TableConfig::new(16, 8, 0.5, 0.25).validate().is_err());
        assert!(TableConfig::new(2, 8, 1.5, 0.25).validate().is_err());
        assert!(TableConfig::new(2, 8, 0.5, 0.75).validate().is_err());
        assert!(TableConfig::fixed(64).validate().is_ok());
    }

    #[test]
    fn test_missing_file_is_default() {
        let config = FabricConfig::load("/nonexistent/fabric.toml").unwrap();
        assert_eq!(config, FabricConfig::default());
    }

    proptest! {
        #[test]
        fn prop_table_config_bounds(
            min_size in 0u64..64,
            max_size in 0u64..64,
            load_factor in -0.5f64..1.5,
            shrink_factor in -0.5f64..1.5,
        ) {
            let config = TableConfig::new(min_size, max_size, load_factor, shrink_factor);
            let expected = min_size > 0
                && min_size <= max_size
                && load_factor > 0.0
                && load_factor <= 1.0
                && shrink_factor >= 0.0
                && shrink_factor < load_factor;
            prop_assert_eq!(config.validate().is_ok(), expected);
        }

        #[test]
        fn prop_mempool_endpoint_tables_validate(num_chunks in any::<u64>()) {
            let config = TableConfig::mempool_endpoints(num_chunks);
            prop_assert!(config.validate().is_ok());
            prop_assert!(config.min_size <= 256);
        }
    }
}
