//! Basalt common types, errors, and configuration.
//!
//! This crate provides shared definitions used across all Basalt components.

pub mod config;
pub mod error;
pub mod page;
pub mod timestamp;
pub mod types;

pub use config::{CheckpointConfig, EvictionPolicy, StorageConfig};
pub use error::{BasaltError, Result};
pub use page::{PageHeader, PageId, PageType, DEFAULT_PAGE_SIZE, PAGE_FORMAT_VERSION};
pub use timestamp::{HybridClock, HybridTimestamp};
pub use types::ColumnType;
