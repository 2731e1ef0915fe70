//! Page table mapping resident pages to frames.

use crate::frame::FrameId;
use basalt_common::page::PageId;
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::collections::HashMap;

/// Map from PageId to FrameId.
///
/// Pinning happens while the table is read-locked and eviction happens while
/// it is write-locked, so a frame can never be recycled between lookup and pin.
pub struct PageTable {
    map: RwLock<HashMap<PageId, FrameId>>,
}

impl PageTable {
    /// Creates a table sized for the given number of frames.
    pub fn new(capacity: usize) -> Self {
        Self {
            map: RwLock::new(HashMap::with_capacity(capacity)),
        }
    }

    /// Looks up a page ID and returns its frame ID if present.
    #[inline]
    pub fn get(&self, page_id: PageId) -> Option<FrameId> {
        self.map.read().get(&page_id).copied()
    }

    /// Returns true if the page is resident.
    pub fn contains(&self, page_id: PageId) -> bool {
        self.map.read().contains_key(&page_id)
    }

    /// Returns the number of resident pages.
    pub fn len(&self) -> usize {
        self.map.read().len()
    }

    /// Returns true if no page is resident.
    pub fn is_empty(&self) -> bool {
        self.map.read().is_empty()
    }

    /// Returns the resident pages of one partition.
    pub fn pages_of(&self, partition: u32) -> Vec<(PageId, FrameId)> {
        self.map
            .read()
            .iter()
            .filter(|(page_id, _)| page_id.partition == partition)
            .map(|(page_id, frame_id)| (*page_id, *frame_id))
            .collect()
    }

    /// Locks the table for lookups that must pin atomically.
    pub(crate) fn read(&self) -> RwLockReadGuard<'_, HashMap<PageId, FrameId>> {
        self.map.read()
    }

    /// Locks the table for insertion and eviction.
    pub(crate) fn write(&self) -> RwLockWriteGuard<'_, HashMap<PageId, FrameId>> {
        self.map.write()
    }
}
