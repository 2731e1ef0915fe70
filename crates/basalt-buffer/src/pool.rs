//! Frame pool manager.

use crate::frame::{Frame, FrameId};
use crate::page_table::PageTable;
use crate::replacer::{replacer_for, Replacer};
use basalt_common::config::{EvictionPolicy, StorageConfig};
use basalt_common::page::PageId;
use basalt_common::{BasaltError, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use sysinfo::System;

/// Configuration for the frame pool.
#[derive(Debug, Clone)]
pub struct FramePoolConfig {
    /// Number of frames in the pool.
    pub num_frames: usize,
    /// Size of every frame in bytes.
    pub page_size: usize,
    /// Replacement policy for clean pages.
    pub eviction: EvictionPolicy,
}

impl Default for FramePoolConfig {
    fn default() -> Self {
        Self {
            num_frames: 1024,
            page_size: basalt_common::DEFAULT_PAGE_SIZE,
            eviction: EvictionPolicy::Clock,
        }
    }
}

impl From<&StorageConfig> for FramePoolConfig {
    fn from(config: &StorageConfig) -> Self {
        Self {
            num_frames: config.region_pages,
            page_size: config.page_size,
            eviction: config.eviction,
        }
    }
}

/// Frame pool.
///
/// Manages a fixed-size region of page frames with:
/// - Page ID to frame ID mapping
/// - Free frame list for new pages
/// - Pluggable replacement for eviction of clean, unpinned pages
/// - Pin counting and dirty tracking
///
/// Dirty frames are never evicted. They become evictable once a checkpoint
/// has written them out, so the region can run out of frames when too
/// many pages are dirty at once.
pub struct FramePool {
    /// Configuration.
    config: FramePoolConfig,
    /// Array of frames.
    frames: Vec<Frame>,
    /// Page ID to frame ID mapping.
    page_table: PageTable,
    /// List of free frame IDs.
    free_list: Mutex<Vec<FrameId>>,
    /// Page replacement policy.
    replacer: Box<dyn Replacer>,
    /// Number of dirty frames.
    dirty_frames: AtomicUsize,
}

impl FramePool {
    /// Creates a new frame pool.
    pub fn new(config: FramePoolConfig) -> Self {
        let num_frames = config.num_frames;

        let frames: Vec<_> = (0..num_frames)
            .map(|i| Frame::new(FrameId(i as u32), config.page_size))
            .collect();

        // All frames start in free list, popped from the low end first
        let free_list: Vec<_> = (0..num_frames).rev().map(|i| FrameId(i as u32)).collect();

        Self {
            replacer: replacer_for(config.eviction, num_frames),
            frames,
            page_table: PageTable::new(num_frames),
            free_list: Mutex::new(free_list),
            dirty_frames: AtomicUsize::new(0),
            config,
        }
    }

    /// Creates a frame pool sized to 25% of available system RAM.
    ///
    /// Minimum 1,000 frames to ensure useful caching on low-memory systems.
    pub fn auto_sized(page_size: usize, eviction: EvictionPolicy) -> Self {
        let mut sys = System::new_all();
        sys.refresh_memory();

        let available_bytes = sys.available_memory() as usize;
        let target_bytes = available_bytes / 4;
        let num_frames = (target_bytes / page_size).max(1_000);

        tracing::info!(num_frames, page_size, "sizing frame pool from available memory");
        Self::new(FramePoolConfig {
            num_frames,
            page_size,
            eviction,
        })
    }

    /// Returns the number of frames in the pool.
    pub fn num_frames(&self) -> usize {
        self.config.num_frames
    }

    /// Returns the frame size in bytes.
    pub fn page_size(&self) -> usize {
        self.config.page_size
    }

    /// Returns the number of free frames.
    pub fn free_count(&self) -> usize {
        self.free_list.lock().len()
    }

    /// Returns the number of pages currently in the pool.
    pub fn page_count(&self) -> usize {
        self.page_table.len()
    }

    /// Returns the number of dirty frames.
    pub fn dirty_count(&self) -> usize {
        self.dirty_frames.load(Ordering::Acquire)
    }

    /// Checks if a page is in the pool.
    pub fn contains(&self, page_id: PageId) -> bool {
        self.page_table.contains(page_id)
    }

    /// Returns the frame with the given ID.
    #[inline]
    pub fn frame(&self, frame_id: FrameId) -> &Frame {
        &self.frames[frame_id.0 as usize]
    }

    /// Returns the resident pages of one partition.
    pub fn resident_pages(&self, partition: u32) -> Vec<(PageId, FrameId)> {
        self.page_table.pages_of(partition)
    }

    /// Pins a resident page.
    ///
    /// Returns None if the page is not in the pool.
    #[inline]
    pub fn fetch_page(&self, page_id: PageId) -> Option<FrameId> {
        let table = self.page_table.read();
        let frame_id = *table.get(&page_id)?;
        self.frames[frame_id.0 as usize].pin();
        drop(table);
        self.replacer.record_access(frame_id);
        Some(frame_id)
    }

    /// Pins a page, bringing it into the pool with `load` if it is not resident.
    ///
    /// `load` receives the zeroed frame buffer. If it fails the frame is
    /// returned to the free list and the error is propagated.
    pub fn fetch_or_load<F>(&self, page_id: PageId, load: F) -> Result<FrameId>
    where
        F: FnOnce(&mut [u8]) -> Result<()>,
    {
        if let Some(frame_id) = self.fetch_page(page_id) {
            return Ok(frame_id);
        }

        let mut table = self.page_table.write();
        if let Some(&frame_id) = table.get(&page_id) {
            self.frames[frame_id.0 as usize].pin();
            drop(table);
            self.replacer.record_access(frame_id);
            return Ok(frame_id);
        }

        let frame_id = self.allocate_frame(&mut table)?;
        let frame = &self.frames[frame_id.0 as usize];
        frame.reset();

        let loaded = {
            let mut data = frame.write();
            load(&mut data[..])
        };
        if let Err(e) = loaded {
            self.free_list.lock().push(frame_id);
            return Err(e);
        }

        frame.set_page_id(Some(page_id));
        frame.pin();
        table.insert(page_id, frame_id);
        drop(table);

        self.replacer.record_access(frame_id);
        Ok(frame_id)
    }

    /// Takes a frame from the free list or evicts a clean, unpinned page.
    fn allocate_frame(&self, table: &mut HashMap<PageId, FrameId>) -> Result<FrameId> {
        if let Some(frame_id) = self.free_list.lock().pop() {
            return Ok(frame_id);
        }

        let frames = &self.frames;
        let victim = self.replacer.evict(&mut |fid: FrameId| {
            let frame = &frames[fid.0 as usize];
            frame.pin_count() == 0 && !frame.is_dirty()
        });

        match victim {
            Some(frame_id) => {
                if let Some(old_page_id) = self.frames[frame_id.0 as usize].page_id() {
                    table.remove(&old_page_id);
                    tracing::trace!(page = %old_page_id, frame = %frame_id, "evicted page");
                }
                Ok(frame_id)
            }
            None => Err(BasaltError::OutOfMemory {
                used: table.len(),
                capacity: self.config.num_frames,
            }),
        }
    }

    /// Unpins a frame.
    #[inline]
    pub fn unpin(&self, frame_id: FrameId) {
        self.frames[frame_id.0 as usize].unpin();
    }

    /// Marks a pinned frame dirty.
    #[inline]
    pub fn mark_dirty(&self, frame_id: FrameId) {
        if self.frames[frame_id.0 as usize].mark_dirty() {
            self.dirty_frames.fetch_add(1, Ordering::AcqRel);
        }
    }

    /// Clears the dirty flag of a frame written out by a checkpoint, unless
    /// the page was modified again after `generation` was captured.
    ///
    /// Waits for any writer currently latching the page.
    pub fn clear_dirty(&self, frame_id: FrameId, generation: u64) -> bool {
        let frame = &self.frames[frame_id.0 as usize];
        let _latch = frame.read();
        let cleared = frame.clear_dirty_if(generation);
        if cleared {
            self.dirty_frames.fetch_sub(1, Ordering::AcqRel);
        }
        cleared
    }

    /// Drops a page from the pool without writing it anywhere.
    ///
    /// Returns false if the page is pinned or not in the pool.
    pub fn discard_page(&self, page_id: PageId) -> bool {
        let mut table = self.page_table.write();
        let Some(&frame_id) = table.get(&page_id) else {
            return false;
        };
        let frame = &self.frames[frame_id.0 as usize];
        if frame.is_pinned() {
            return false;
        }

        table.remove(&page_id);
        drop(table);

        self.replacer.remove(frame_id);
        if frame.is_dirty() {
            self.dirty_frames.fetch_sub(1, Ordering::AcqRel);
        }
        frame.reset();
        self.free_list.lock().push(frame_id);
        true
    }

    /// Returns statistics about the pool.
    pub fn stats(&self) -> FramePoolStats {
        let table = self.page_table.read();
        let mut pinned_frames = 0;
        let mut dirty_frames = 0;
        for frame_id in table.values() {
            let frame = &self.frames[frame_id.0 as usize];
            if frame.is_pinned() {
                pinned_frames += 1;
            }
            if frame.is_dirty() {
                dirty_frames += 1;
            }
        }

        FramePoolStats {
            total_frames: self.config.num_frames,
            free_frames: self.free_count(),
            used_frames: table.len(),
            pinned_frames,
            dirty_frames,
        }
    }
}

/// Statistics about the frame pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FramePoolStats {
    /// Total number of frames.
    pub total_frames: usize,
    /// Number of free frames.
    pub free_frames: usize,
    /// Number of frames with pages.
    pub used_frames: usize,
    /// Number of pinned frames.
    pub pinned_frames: usize,
    /// Number of dirty frames.
    pub dirty_frames: usize,
}
