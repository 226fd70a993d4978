//! Configuration types for StripeStore
//!
//! The storage configuration is built once at startup and shared by
//! reference with the disk registry and the block I/O engine.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// How container ids are turned into disk locations
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AddressingMode {
    /// Disk and LBA are derived from the container id
    #[default]
    Direct,
    /// Space is searched in the disk bitmap from a write cursor
    FreeList,
}

/// Storage engine configuration
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Block size in bytes (default: 4 KB)
    pub block_size: u64,
    /// Blocks making up one container, trailer included
    pub blocks_per_container: u64,
    /// Blocks at the end of each container reserved for metadata
    pub reserved_blocks_per_container: u64,
    /// Worker threads used to fan out stripe I/O
    pub num_threads: usize,
    /// Number of disks participating in direct mapping
    pub num_disks: u32,
    /// Addressing mode, fixed for the lifetime of the engine
    pub addressing: AddressingMode,
    /// Open disks with O_DIRECT (Linux) / F_NOCACHE (macOS)
    pub direct_io: bool,
    /// Device block size used to scale offsets in I/O trace records
    pub trace_block_size: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            block_size: 4096,
            blocks_per_container: 256, // 1 MB containers
            reserved_blocks_per_container: 1,
            num_threads: 1,
            num_disks: 4,
            addressing: AddressingMode::Direct,
            direct_io: true,
            trace_block_size: 4096,
        }
    }
}

impl StorageConfig {
    /// Size of a whole container in bytes
    #[must_use]
    pub const fn container_size(&self) -> u64 {
        self.blocks_per_container * self.block_size
    }

    /// Size of the reserved trailer in bytes
    #[must_use]
    pub const fn container_reserved_size(&self) -> u64 {
        self.reserved_blocks_per_container * self.block_size
    }

    /// Size of the payload part of a container in bytes
    #[must_use]
    pub const fn container_data_size(&self) -> u64 {
        self.container_size() - self.container_reserved_size()
    }

    /// Check the configuration for values the engine cannot work with
    pub fn validate(&self) -> Result<()> {
        if self.block_size == 0 || !self.block_size.is_power_of_two() {
            return Err(Error::configuration(format!(
                "block size {} must be a non-zero power of two",
                self.block_size
            )));
        }
        if self.blocks_per_container == 0 {
            return Err(Error::configuration("blocks per container must be positive"));
        }
        if self.reserved_blocks_per_container >= self.blocks_per_container {
            return Err(Error::configuration(format!(
                "reserved blocks {} must be fewer than blocks per container {}",
                self.reserved_blocks_per_container, self.blocks_per_container
            )));
        }
        if self.num_threads == 0 {
            return Err(Error::configuration("at least one worker thread is required"));
        }
        if self.num_disks == 0 {
            return Err(Error::configuration("at least one disk is required"));
        }
        if self.trace_block_size == 0 {
            return Err(Error::configuration("trace block size must be positive"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = StorageConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.container_size(), 1024 * 1024);
        assert_eq!(config.container_reserved_size(), 4096);
        assert_eq!(config.container_data_size(), 1024 * 1024 - 4096);
        assert_eq!(config.addressing, AddressingMode::Direct);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let bad_block = StorageConfig {
            block_size: 1000,
            ..StorageConfig::default()
        };
        assert!(matches!(bad_block.validate(), Err(Error::Configuration(_))));

        let all_reserved = StorageConfig {
            blocks_per_container: 4,
            reserved_blocks_per_container: 4,
            ..StorageConfig::default()
        };
        assert!(all_reserved.validate().is_err());

        let no_threads = StorageConfig {
            num_threads: 0,
            ..StorageConfig::default()
        };
        assert!(no_threads.validate().is_err());

        let no_disks = StorageConfig {
            num_disks: 0,
            ..StorageConfig::default()
        };
        assert!(no_disks.validate().is_err());
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: StorageConfig = toml::from_str(
            r#"
            block_size = 512
            addressing = "free_list"
            "#,
        )
        .unwrap();
        assert_eq!(config.block_size, 512);
        assert_eq!(config.addressing, AddressingMode::FreeList);
        assert_eq!(config.blocks_per_container, 256);
        assert!(config.direct_io);
    }
}
