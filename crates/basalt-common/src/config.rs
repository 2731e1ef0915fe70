//! Configuration structures for the Basalt store.
//!
//! A configuration is taken as a snapshot when a store starts. Changing it
//! afterwards has no effect on a running store.

use crate::error::{BasaltError, Result};
use crate::page::{validate_page_size, DEFAULT_PAGE_SIZE};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Page storage region configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory for partition files. `None` keeps every page in memory.
    pub data_dir: Option<PathBuf>,
    /// Page size in bytes (power of two, 1 KB to 32 KB).
    pub page_size: usize,
    /// Region size in number of page frames.
    pub region_pages: usize,
    /// Frame replacement policy for clean pages.
    pub eviction: EvictionPolicy,
    /// Buffer size used when streaming checkpoint pages to disk.
    pub write_buffer_size: usize,
    /// Background checkpoint settings.
    pub checkpoint: CheckpointConfig,
    /// Enable fsync for durability.
    pub fsync_enabled: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            page_size: DEFAULT_PAGE_SIZE,
            region_pages: 8192,             // 128 MB with 16 KB pages
            eviction: EvictionPolicy::Clock,
            write_buffer_size: 4 * 1024 * 1024, // 4 MB
            checkpoint: CheckpointConfig::default(),
            fsync_enabled: true,
        }
    }
}

impl StorageConfig {
    /// Returns an in-memory configuration with the given region size.
    pub fn in_memory(page_size: usize, region_pages: usize) -> Self {
        Self {
            page_size,
            region_pages,
            ..Self::default()
        }
    }

    /// Returns a file-backed configuration rooted at `data_dir`.
    pub fn persistent(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: Some(data_dir.into()),
            ..Self::default()
        }
    }

    /// Returns the total region size in bytes.
    pub fn region_size_bytes(&self) -> usize {
        self.region_pages * self.page_size
    }

    /// Returns true when pages are backed by files.
    pub fn is_persistent(&self) -> bool {
        self.data_dir.is_some()
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<()> {
        validate_page_size(self.page_size)?;
        if self.region_pages < 16 {
            return Err(BasaltError::ConfigError(format!(
                "region must hold at least 16 pages, got {}",
                self.region_pages
            )));
        }
        if self.write_buffer_size < self.page_size {
            return Err(BasaltError::ConfigError(format!(
                "write buffer ({} bytes) is smaller than a page ({} bytes)",
                self.write_buffer_size, self.page_size
            )));
        }
        self.checkpoint.validate()
    }
}

/// Frame replacement policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum EvictionPolicy {
    /// Second-chance clock sweep.
    #[default]
    Clock,
    /// Least recently used.
    Lru,
}

/// Background checkpoint configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointConfig {
    /// Interval between checkpoints in milliseconds (0 = only on demand).
    pub interval_ms: u64,
    /// Fraction of dirty frames that triggers an early checkpoint.
    pub dirty_ratio: f64,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            interval_ms: 30_000,
            dirty_ratio: 0.75,
        }
    }
}

impl CheckpointConfig {
    /// Validates the checkpoint settings.
    pub fn validate(&self) -> Result<()> {
        if !(self.dirty_ratio > 0.0 && self.dirty_ratio <= 1.0) {
            return Err(BasaltError::InvalidParameter {
                name: "checkpoint.dirty_ratio".to_string(),
                value: self.dirty_ratio.to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_config_defaults() {
        let config = StorageConfig::default();
        assert!(config.data_dir.is_none());
        assert_eq!(config.page_size, 16384);
        assert_eq!(config.region_pages, 8192);
        assert_eq!(config.eviction, EvictionPolicy::Clock);
        assert_eq!(config.checkpoint.interval_ms, 30_000);
        assert!(config.fsync_enabled);
        assert!(!config.is_persistent());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_region_size_bytes() {
        let config = StorageConfig::in_memory(4096, 256);
        assert_eq!(config.region_size_bytes(), 1024 * 1024);
    }

    #[test]
    fn test_persistent_config() {
        let config = StorageConfig::persistent("/var/lib/basalt");
        assert_eq!(config.data_dir, Some(PathBuf::from("/var/lib/basalt")));
        assert!(config.is_persistent());
    }

    #[test]
    fn test_validate_rejects_bad_page_size() {
        let config = StorageConfig::in_memory(3000, 64);
        assert!(matches!(
            config.validate(),
            Err(BasaltError::InvalidParameter { .. })
        ));
    }

    #[test]
    fn test_validate_rejects_tiny_region() {
        let config = StorageConfig::in_memory(4096, 4);
        assert!(matches!(config.validate(), Err(BasaltError::ConfigError(_))));
    }

    #[test]
    fn test_validate_rejects_small_write_buffer() {
        let mut config = StorageConfig::in_memory(16384, 64);
        config.write_buffer_size = 1024;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_bad_dirty_ratio() {
        let mut config = StorageConfig::default();
        config.checkpoint.dirty_ratio = 0.0;
        assert!(config.validate().is_err());
        config.checkpoint.dirty_ratio = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_storage_config_serde_roundtrip() {
        let mut original = StorageConfig::persistent("/tmp/basalt");
        original.eviction = EvictionPolicy::Lru;
        original.page_size = 8192;

        let serialized = serde_json::to_string(&original).unwrap();
        let deserialized: StorageConfig = serde_json::from_str(&serialized).unwrap();

        assert_eq!(original.data_dir, deserialized.data_dir);
        assert_eq!(original.page_size, deserialized.page_size);
        assert_eq!(original.eviction, deserialized.eviction);
        assert_eq!(
            original.checkpoint.dirty_ratio,
            deserialized.checkpoint.dirty_ratio
        );
    }
}
