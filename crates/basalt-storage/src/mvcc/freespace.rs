//! Free space map of a partition's data pages.
//!
//! Each data page is tracked by one category byte (0-255) that quantizes
//! the record size it can still take. The map lives in memory only; it is
//! rebuilt from the data pages when a partition is opened.

use super::page::{category_to_min_space, space_to_category};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap};

#[derive(Default)]
struct FsmState {
    /// Category of every tracked page.
    categories: HashMap<u32, u8>,
    /// Pages grouped by category.
    buckets: BTreeMap<u8, BTreeSet<u32>>,
}

impl FsmState {
    fn remove(&mut self, page_idx: u32) -> Option<u8> {
        let category = self.categories.remove(&page_idx)?;
        if let Some(bucket) = self.buckets.get_mut(&category) {
            bucket.remove(&page_idx);
            if bucket.is_empty() {
                self.buckets.remove(&category);
            }
        }
        Some(category)
    }
}

/// Tracks how much space every data page of a partition has left.
pub struct FreeSpaceMap {
    page_size: usize,
    state: Mutex<FsmState>,
}

impl FreeSpaceMap {
    /// Creates an empty map for pages of the given size.
    pub fn new(page_size: usize) -> Self {
        Self {
            page_size,
            state: Mutex::new(FsmState::default()),
        }
    }

    /// Records the insertable space of a page.
    pub fn update(&self, page_idx: u32, free_space: usize) {
        let category = space_to_category(free_space, self.page_size);
        let mut state = self.state.lock();
        if state.categories.get(&page_idx) == Some(&category) {
            return;
        }
        state.remove(page_idx);
        state.categories.insert(page_idx, category);
        state.buckets.entry(category).or_default().insert(page_idx);
    }

    /// Stops tracking a page.
    pub fn remove(&self, page_idx: u32) {
        self.state.lock().remove(page_idx);
    }

    /// Returns a page that can take a record of `size` bytes.
    ///
    /// Prefers the fullest page that fits, so partly used pages fill up
    /// before empty ones are touched.
    pub fn find(&self, size: usize) -> Option<u32> {
        let state = self.state.lock();
        let min_category = (0..=255u8).find(|c| category_to_min_space(*c, self.page_size) >= size)?;
        state
            .buckets
            .range(min_category..)
            .find_map(|(_, pages)| pages.iter().next().copied())
    }

    /// Number of tracked pages.
    pub fn page_count(&self) -> usize {
        self.state.lock().categories.len()
    }

    /// Forgets every page.
    pub fn clear(&self) {
        *self.state.lock() = FsmState::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mvcc::page::DataPage;

    const PAGE: usize = 1024;

    #[test]
    fn test_find_prefers_fullest_fitting_page() {
        let fsm = FreeSpaceMap::new(PAGE);
        fsm.update(1, 100);
        fsm.update(2, 500);
        fsm.update(3, DataPage::max_record_size(PAGE));

        assert_eq!(fsm.find(50), Some(1));
        assert_eq!(fsm.find(300), Some(2));
        assert_eq!(fsm.find(600), Some(3));
        assert_eq!(fsm.find(DataPage::max_record_size(PAGE) + 1), None);
    }

    #[test]
    fn test_update_moves_page_between_buckets() {
        let fsm = FreeSpaceMap::new(PAGE);
        fsm.update(7, 900);
        assert_eq!(fsm.find(800), Some(7));

        fsm.update(7, 10);
        assert_eq!(fsm.find(800), None);
        assert_eq!(fsm.page_count(), 1);

        fsm.remove(7);
        assert_eq!(fsm.find(1), None);
        assert_eq!(fsm.page_count(), 0);
    }

    #[test]
    fn test_found_page_really_fits() {
        let fsm = FreeSpaceMap::new(PAGE);
        for free in [3usize, 17, 128, 333, 700] {
            fsm.update(free as u32, free);
        }
        for need in [1usize, 16, 100, 300, 650] {
            let page = fsm.find(need).unwrap();
            assert!(page as usize >= need);
        }
    }
}
