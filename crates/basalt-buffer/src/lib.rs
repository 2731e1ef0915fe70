//! Page frame management for Basalt.
//!
//! This crate provides the in-memory region backing the page store:
//! - Fixed-size frame pool with a runtime page size
//! - Clock and LRU replacement for clean pages
//! - Pin counting and per-frame latches
//! - Dirty tracking with modification generations for checkpoints

mod frame;
mod page_table;
mod pool;
mod replacer;

pub use frame::{Frame, FrameId, FrameReadGuard, FrameWriteGuard};
pub use page_table::PageTable;
pub use pool::{FramePool, FramePoolConfig, FramePoolStats};
pub use replacer::{replacer_for, ClockReplacer, LruReplacer, Replacer};
