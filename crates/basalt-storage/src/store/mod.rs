//! Page store.
//!
//! The page store hands out pages of a configured size, addressed by
//! `(partition, page index)`. Pages live in frames of the shared
//! [`FramePool`]; with a data directory configured they are backed by one
//! file per partition and written out by checkpoints.
//!
//! Access goes through pinned handles:
//! - [`PageHandle`] keeps the page resident until dropped
//! - [`PageRead`] adds a shared latch
//! - [`PageWrite`] adds an exclusive latch and marks the page dirty on drop
//!
//! Every [`PageWrite`] holds the shared side of the checkpoint lock, so a
//! checkpoint that owns the exclusive side sees no page mid-modification.

mod checkpoint;
mod header;

pub use checkpoint::{CheckpointStats, Checkpointer, DOUBLE_WRITE_FILE};
pub use header::{PartitionHeader, PARTITION_MAGIC};

use crate::disk::{DiskManager, DiskManagerConfig};
use basalt_buffer::{FrameId, FramePool, FramePoolConfig, FrameReadGuard, FrameWriteGuard};
use basalt_common::page::{validate_page_size, PageHeader, PageId, PageType};
use basalt_common::{BasaltError, Result, StorageConfig};
use header::{next_free_of, write_free_page};
use parking_lot::{Mutex, RwLock, RwLockReadGuard};
use std::collections::{HashMap, HashSet};
use std::ops::{Deref, DerefMut};

/// Allocation state of one open partition.
#[derive(Debug, Default)]
struct PartitionSpace {
    /// First page index never handed out.
    next_page_idx: u32,
    /// Reuse list, top of the stack is the persistent list head.
    free: Vec<u32>,
}

/// Page allocation, residency and checkpointing for all partitions of a node.
pub struct PageStore {
    config: StorageConfig,
    pool: FramePool,
    disk: Option<DiskManager>,
    spaces: Mutex<HashMap<u32, PartitionSpace>>,
    /// Pages modified since the last checkpoint snapshot.
    dirty: Mutex<HashSet<PageId>>,
    /// Shared: page mutation. Exclusive: checkpoint snapshot.
    checkpoint_lock: RwLock<()>,
    /// Serializes checkpoint I/O with partition destruction.
    io_lock: Mutex<()>,
}

impl PageStore {
    /// Opens a store with the given configuration.
    ///
    /// For a persistent store, an interrupted checkpoint left in the
    /// double-write file is applied to the partition files first.
    pub fn open(config: StorageConfig) -> Result<Self> {
        config.validate()?;
        validate_page_size(config.page_size)?;

        let disk = match &config.data_dir {
            Some(dir) => {
                let disk = DiskManager::new(DiskManagerConfig {
                    data_dir: dir.clone(),
                    page_size: config.page_size,
                    fsync_enabled: config.fsync_enabled,
                })?;
                let restored = checkpoint::recover_double_write(&disk)?;
                if restored > 0 {
                    tracing::info!(pages = restored, "re-applied interrupted checkpoint");
                }
                Some(disk)
            }
            None => None,
        };

        tracing::debug!(
            page_size = config.page_size,
            region_pages = config.region_pages,
            persistent = disk.is_some(),
            "opening page store"
        );

        Ok(Self {
            pool: FramePool::new(FramePoolConfig::from(&config)),
            disk,
            spaces: Mutex::new(HashMap::new()),
            dirty: Mutex::new(HashSet::new()),
            checkpoint_lock: RwLock::new(()),
            io_lock: Mutex::new(()),
            config,
        })
    }

    /// Opens a volatile store. Nothing is ever written to disk.
    pub fn in_memory(page_size: usize, region_pages: usize) -> Result<Self> {
        Self::open(StorageConfig::in_memory(page_size, region_pages))
    }

    /// Returns the store configuration.
    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    /// Returns the page size in bytes.
    #[inline]
    pub fn page_size(&self) -> usize {
        self.config.page_size
    }

    /// Returns true if pages are backed by partition files.
    pub fn is_persistent(&self) -> bool {
        self.disk.is_some()
    }

    /// Returns the frame pool backing this store.
    pub fn pool(&self) -> &FramePool {
        &self.pool
    }

    /// Returns the number of pages waiting for the next checkpoint.
    pub fn dirty_page_count(&self) -> usize {
        self.dirty.lock().len()
    }

    /// Lists the partitions that have files in the data directory.
    pub fn stored_partitions(&self) -> Result<Vec<u32>> {
        match &self.disk {
            Some(disk) => disk.list_partitions(),
            None => Ok(Vec::new()),
        }
    }

    /// Takes the shared side of the checkpoint lock.
    ///
    /// Holding it across a multi-page change keeps the change out of any
    /// checkpoint snapshot until it is complete. Reentrant.
    pub fn mutation_guard(&self) -> RwLockReadGuard<'_, ()> {
        self.checkpoint_lock.read_recursive()
    }

    // =========================================================================
    // Partitions
    // =========================================================================

    /// Opens a partition, creating it if it does not exist.
    ///
    /// Returns true when the partition was created.
    pub fn open_partition(&self, partition: u32) -> Result<bool> {
        let _guard = self.mutation_guard();
        let mut spaces = self.spaces.lock();
        if spaces.contains_key(&partition) {
            return Ok(false);
        }

        // Format and page size are checked before any page is read at the
        // configured size
        let on_disk = match &self.disk {
            Some(disk) if disk.partition_exists(partition) => {
                match disk.read_prefix(partition, PartitionHeader::ENCODED_LEN)? {
                    Some(prefix) => {
                        PartitionHeader::read_from(&prefix, self.page_size())?;
                        true
                    }
                    None => false,
                }
            }
            _ => false,
        };

        if on_disk {
            let header = {
                let page = self.read(PageId::header(partition))?;
                PartitionHeader::read_from(&page, self.page_size())?
            };
            let free = self.load_reuse_list(partition, &header)?;
            tracing::info!(
                partition,
                pages = header.next_page_idx,
                free_pages = free.len(),
                "opened partition"
            );
            spaces.insert(
                partition,
                PartitionSpace {
                    next_page_idx: header.next_page_idx,
                    free,
                },
            );
            return Ok(false);
        }

        let header_id = PageId::header(partition);
        let frame_id = self.pool.fetch_or_load(header_id, |_| Ok(()))?;
        let mut page = PageHandle {
            store: self,
            page_id: header_id,
            frame_id,
        }
        .write();
        PartitionHeader::new(self.page_size()).write_to(&mut page, partition);
        drop(page);

        spaces.insert(
            partition,
            PartitionSpace {
                next_page_idx: 1,
                free: Vec::new(),
            },
        );
        tracing::info!(partition, "created partition");
        Ok(true)
    }

    /// Walks the persistent reuse list of a partition.
    fn load_reuse_list(&self, partition: u32, header: &PartitionHeader) -> Result<Vec<u32>> {
        let mut chain = Vec::new();
        let mut idx = header.free_head;
        while idx != 0 {
            if idx >= header.next_page_idx || chain.len() >= header.next_page_idx as usize {
                return Err(BasaltError::PageCorrupted {
                    page_id: PageId::header(partition).as_u64(),
                    reason: format!("reuse list broken at page {}", idx),
                });
            }
            chain.push(idx);
            let page_id = PageId::new(partition, idx);
            let page = self.read(page_id)?;
            idx = next_free_of(&page, page_id)?;
        }
        // Stack order: the list head is popped first
        chain.reverse();
        Ok(chain)
    }

    /// Returns true if the partition is open.
    pub fn is_open(&self, partition: u32) -> bool {
        self.spaces.lock().contains_key(&partition)
    }

    /// Returns the root slot of a partition header (0 when unset).
    pub fn partition_root(&self, partition: u32) -> Result<u32> {
        let page = self.read(PageId::header(partition))?;
        Ok(PartitionHeader::root_of(&page))
    }

    /// Sets the root slot of a partition header.
    pub fn set_partition_root(&self, partition: u32, root: u32) -> Result<()> {
        let mut page = self.write(PageId::header(partition))?;
        PartitionHeader::set_root(&mut page, root);
        Ok(())
    }

    /// Returns the number of page indexes handed out so far, header included.
    pub fn partition_page_count(&self, partition: u32) -> Result<u32> {
        let spaces = self.spaces.lock();
        let space = spaces
            .get(&partition)
            .ok_or_else(|| not_open(partition))?;
        Ok(space.next_page_idx)
    }

    /// Returns the number of pages on the reuse list of a partition.
    pub fn free_page_count(&self, partition: u32) -> Result<usize> {
        let spaces = self.spaces.lock();
        let space = spaces
            .get(&partition)
            .ok_or_else(|| not_open(partition))?;
        Ok(space.free.len())
    }

    /// Returns the ids of all pages of a partition with the given type.
    ///
    /// Reads every page of the partition, so it is only meant for recovery.
    pub fn pages_of_type(&self, partition: u32, page_type: PageType) -> Result<Vec<PageId>> {
        let count = self.partition_page_count(partition)?;
        let mut pages = Vec::new();
        for idx in 1..count {
            let page_id = PageId::new(partition, idx);
            let page = self.read(page_id)?;
            if PageHeader::type_tag(&page) == page_type as u8 {
                pages.push(page_id);
            }
        }
        Ok(pages)
    }

    /// Drops a partition: its frames, its allocation state and its file.
    ///
    /// Fails if any of its pages is still pinned.
    pub fn destroy_partition(&self, partition: u32) -> Result<()> {
        let _io = self.io_lock.lock();
        let _exclusive = self.checkpoint_lock.write();

        for (page_id, _) in self.pool.resident_pages(partition) {
            if !self.pool.discard_page(page_id) {
                return Err(BasaltError::Internal(format!(
                    "cannot destroy partition {}: page {} is pinned",
                    partition, page_id
                )));
            }
        }
        self.dirty.lock().retain(|page_id| page_id.partition != partition);
        self.spaces.lock().remove(&partition);
        if let Some(disk) = &self.disk {
            disk.delete_file(partition)?;
        }

        tracing::info!(partition, "destroyed partition");
        Ok(())
    }

    // =========================================================================
    // Pages
    // =========================================================================

    /// Allocates a page in a partition and formats it with the given type.
    ///
    /// Reuses the most recently freed page when there is one. Fails with
    /// `OutOfMemory` when no frame can hold the page; the partition is left
    /// unchanged in that case.
    pub fn allocate(&self, partition: u32, page_type: PageType) -> Result<PageId> {
        let _guard = self.mutation_guard();
        let mut spaces = self.spaces.lock();
        let space = spaces
            .get_mut(&partition)
            .ok_or_else(|| not_open(partition))?;

        let reused = space.free.last().copied();
        let page_idx = reused.unwrap_or(space.next_page_idx);
        let page_id = PageId::new(partition, page_idx);

        let frame_id = self.pool.fetch_or_load(page_id, |_| Ok(()))?;
        let mut page = PageHandle {
            store: self,
            page_id,
            frame_id,
        }
        .write();
        page.fill(0);
        PageHeader::init(&mut page, page_id, page_type);
        drop(page);

        match reused {
            Some(_) => {
                space.free.pop();
            }
            None => space.next_page_idx += 1,
        }
        let next_page_idx = space.next_page_idx;
        let free_head = space.free.last().copied().unwrap_or(0);

        let mut header = self.write(PageId::header(partition))?;
        PartitionHeader::set_space(&mut header, next_page_idx, free_head);

        tracing::trace!(page = %page_id, ?page_type, reused = reused.is_some(), "allocated page");
        Ok(page_id)
    }

    /// Returns a page to the reuse list of its partition.
    pub fn free(&self, page_id: PageId) -> Result<()> {
        let _guard = self.mutation_guard();
        let mut spaces = self.spaces.lock();
        let space = spaces
            .get_mut(&page_id.partition)
            .ok_or_else(|| not_open(page_id.partition))?;

        if page_id.page_idx == 0
            || page_id.page_idx >= space.next_page_idx
            || space.free.contains(&page_id.page_idx)
        {
            return Err(BasaltError::InvalidParameter {
                name: "page_id".to_string(),
                value: page_id.to_string(),
            });
        }

        let next_free = space.free.last().copied().unwrap_or(0);
        {
            let mut page = self.write(page_id)?;
            write_free_page(&mut page, page_id, next_free);
        }
        space.free.push(page_id.page_idx);

        let next_page_idx = space.next_page_idx;
        let mut header = self.write(PageId::header(page_id.partition))?;
        PartitionHeader::set_space(&mut header, next_page_idx, page_id.page_idx);

        tracing::trace!(page = %page_id, "freed page");
        Ok(())
    }

    /// Pins a page, loading it from the partition file if it is not resident.
    pub fn acquire(&self, page_id: PageId) -> Result<PageHandle<'_>> {
        let frame_id = self.pool.fetch_or_load(page_id, |buf| match &self.disk {
            Some(disk) => disk.read_page(page_id, buf),
            None => Err(BasaltError::PageNotFound {
                page_id: page_id.as_u64(),
            }),
        })?;
        Ok(PageHandle {
            store: self,
            page_id,
            frame_id,
        })
    }

    /// Pins a page and takes its shared latch.
    pub fn read(&self, page_id: PageId) -> Result<PageRead<'_>> {
        Ok(self.acquire(page_id)?.read())
    }

    /// Pins a page and takes its exclusive latch.
    pub fn write(&self, page_id: PageId) -> Result<PageWrite<'_>> {
        Ok(self.acquire(page_id)?.write())
    }

    /// Records a page for the next checkpoint.
    fn track_dirty(&self, page_id: PageId, frame_id: FrameId) {
        self.pool.mark_dirty(frame_id);
        if self.disk.is_some() {
            self.dirty.lock().insert(page_id);
        }
    }
}

fn not_open(partition: u32) -> BasaltError {
    BasaltError::InvalidParameter {
        name: "partition".to_string(),
        value: format!("{} is not open", partition),
    }
}

/// A pinned page. Dropping the handle releases the pin.
pub struct PageHandle<'a> {
    store: &'a PageStore,
    page_id: PageId,
    frame_id: FrameId,
}

impl<'a> PageHandle<'a> {
    /// Returns the id of the pinned page.
    #[inline]
    pub fn page_id(&self) -> PageId {
        self.page_id
    }

    /// Marks the page dirty so the next checkpoint writes it out.
    pub fn mark_dirty(&self) {
        self.store.track_dirty(self.page_id, self.frame_id);
    }

    /// Takes the shared latch.
    pub fn read(self) -> PageRead<'a> {
        let guard = self.store.pool.frame(self.frame_id).read_arc();
        PageRead {
            guard,
            handle: self,
        }
    }

    /// Takes the exclusive latch.
    pub fn write(self) -> PageWrite<'a> {
        let checkpoint = self.store.checkpoint_lock.read_recursive();
        let guard = self.store.pool.frame(self.frame_id).write_arc();
        PageWrite {
            guard,
            handle: self,
            _checkpoint: checkpoint,
        }
    }
}

impl Drop for PageHandle<'_> {
    fn drop(&mut self) {
        self.store.pool.unpin(self.frame_id);
    }
}

/// A pinned page under its shared latch.
pub struct PageRead<'a> {
    guard: FrameReadGuard,
    handle: PageHandle<'a>,
}

impl PageRead<'_> {
    /// Returns the id of the latched page.
    #[inline]
    pub fn page_id(&self) -> PageId {
        self.handle.page_id
    }
}

impl Deref for PageRead<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.guard
    }
}

/// A pinned page under its exclusive latch.
///
/// The page is marked dirty when the latch is released.
pub struct PageWrite<'a> {
    // Field order is drop order: latch, then pin, then checkpoint lock
    guard: FrameWriteGuard,
    handle: PageHandle<'a>,
    _checkpoint: RwLockReadGuard<'a, ()>,
}

impl PageWrite<'_> {
    /// Returns the id of the latched page.
    #[inline]
    pub fn page_id(&self) -> PageId {
        self.handle.page_id
    }
}

impl Deref for PageWrite<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.guard
    }
}

impl DerefMut for PageWrite<'_> {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.guard
    }
}

impl Drop for PageWrite<'_> {
    fn drop(&mut self) {
        self.handle.mark_dirty();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const PAGE: usize = 1024;

    fn persistent_config(dir: &std::path::Path) -> StorageConfig {
        StorageConfig {
            page_size: PAGE,
            region_pages: 64,
            write_buffer_size: PAGE * 4,
            ..StorageConfig::persistent(dir)
        }
    }

    #[test]
    fn test_allocate_sequential_pages() {
        let store = PageStore::in_memory(PAGE, 32).unwrap();
        assert!(store.open_partition(3).unwrap());
        assert!(!store.open_partition(3).unwrap());

        let a = store.allocate(3, PageType::Data).unwrap();
        let b = store.allocate(3, PageType::TreeLeaf).unwrap();
        assert_eq!(a, PageId::new(3, 1));
        assert_eq!(b, PageId::new(3, 2));
        assert_eq!(store.partition_page_count(3).unwrap(), 3);

        let page = store.read(b).unwrap();
        assert_eq!(PageHeader::type_tag(&page), PageType::TreeLeaf as u8);
    }

    #[test]
    fn test_allocate_requires_open_partition() {
        let store = PageStore::in_memory(PAGE, 16).unwrap();
        assert!(store.allocate(1, PageType::Data).is_err());
    }

    #[test]
    fn test_free_and_reuse() {
        let store = PageStore::in_memory(PAGE, 32).unwrap();
        store.open_partition(0).unwrap();
        let pages: Vec<_> = (0..4)
            .map(|_| store.allocate(0, PageType::Data).unwrap())
            .collect();

        store.free(pages[1]).unwrap();
        store.free(pages[3]).unwrap();
        assert_eq!(store.free_page_count(0).unwrap(), 2);

        // Last freed is reused first
        assert_eq!(store.allocate(0, PageType::Data).unwrap(), pages[3]);
        assert_eq!(store.allocate(0, PageType::Data).unwrap(), pages[1]);
        assert_eq!(store.allocate(0, PageType::Data).unwrap(), PageId::new(0, 5));
        assert_eq!(store.free_page_count(0).unwrap(), 0);
    }

    #[test]
    fn test_reused_page_is_zeroed() {
        let store = PageStore::in_memory(PAGE, 16).unwrap();
        store.open_partition(0).unwrap();
        let page_id = store.allocate(0, PageType::Data).unwrap();
        store.write(page_id).unwrap()[500] = 0xAB;
        store.free(page_id).unwrap();

        let again = store.allocate(0, PageType::Data).unwrap();
        assert_eq!(again, page_id);
        assert_eq!(store.read(again).unwrap()[500], 0);
    }

    #[test]
    fn test_double_free_rejected() {
        let store = PageStore::in_memory(PAGE, 16).unwrap();
        store.open_partition(0).unwrap();
        let page_id = store.allocate(0, PageType::Data).unwrap();
        store.free(page_id).unwrap();
        assert!(store.free(page_id).is_err());
        assert!(store.free(PageId::header(0)).is_err());
        assert!(store.free(PageId::new(0, 99)).is_err());
    }

    #[test]
    fn test_in_memory_region_exhaustion() {
        let store = PageStore::in_memory(PAGE, 16).unwrap();
        store.open_partition(0).unwrap();
        let mut allocated = 0;
        let err = loop {
            match store.allocate(0, PageType::Data) {
                Ok(_) => allocated += 1,
                Err(e) => break e,
            }
        };
        // Header page plus every allocated page occupy the region
        assert_eq!(allocated, 15);
        assert!(matches!(err, BasaltError::OutOfMemory { .. }));
        assert!(err.is_retryable());
        assert_eq!(store.partition_page_count(0).unwrap(), 16);
    }

    #[test]
    fn test_write_latch_marks_dirty() {
        let dir = tempdir().unwrap();
        let store = PageStore::open(persistent_config(dir.path())).unwrap();
        store.open_partition(0).unwrap();
        let page_id = store.allocate(0, PageType::Data).unwrap();
        assert_eq!(store.dirty_page_count(), 2);

        store.checkpoint().unwrap();
        assert_eq!(store.dirty_page_count(), 0);

        {
            let page = store.read(page_id).unwrap();
            assert_eq!(page.page_id(), page_id);
        }
        assert_eq!(store.dirty_page_count(), 0);

        store.write(page_id).unwrap()[100] = 1;
        assert_eq!(store.dirty_page_count(), 1);
    }

    #[test]
    fn test_pin_released_on_drop() {
        let store = PageStore::in_memory(PAGE, 16).unwrap();
        store.open_partition(0).unwrap();
        let page_id = store.allocate(0, PageType::Data).unwrap();
        {
            let _a = store.acquire(page_id).unwrap();
            let _b = store.read(page_id).unwrap();
            assert_eq!(store.pool().stats().pinned_frames, 1);
        }
        assert_eq!(store.pool().stats().pinned_frames, 0);
    }

    #[test]
    fn test_partition_root_slot() {
        let store = PageStore::in_memory(PAGE, 16).unwrap();
        store.open_partition(4).unwrap();
        assert_eq!(store.partition_root(4).unwrap(), 0);
        store.set_partition_root(4, 7).unwrap();
        assert_eq!(store.partition_root(4).unwrap(), 7);
    }

    #[test]
    fn test_pages_of_type() {
        let store = PageStore::in_memory(PAGE, 16).unwrap();
        store.open_partition(0).unwrap();
        let data = store.allocate(0, PageType::Data).unwrap();
        store.allocate(0, PageType::TreeLeaf).unwrap();
        let data2 = store.allocate(0, PageType::Data).unwrap();
        assert_eq!(store.pages_of_type(0, PageType::Data).unwrap(), vec![data, data2]);
    }

    #[test]
    fn test_persistent_reopen_keeps_space() {
        let dir = tempdir().unwrap();
        let freed;
        {
            let store = PageStore::open(persistent_config(dir.path())).unwrap();
            store.open_partition(2).unwrap();
            let pages: Vec<_> = (0..5)
                .map(|_| store.allocate(2, PageType::Data).unwrap())
                .collect();
            store.write(pages[0]).unwrap()[200] = 0x5A;
            store.free(pages[2]).unwrap();
            store.set_partition_root(2, pages[4].page_idx).unwrap();
            freed = pages[2];
            store.checkpoint().unwrap();
        }

        let store = PageStore::open(persistent_config(dir.path())).unwrap();
        assert_eq!(store.stored_partitions().unwrap(), vec![2]);
        assert!(!store.open_partition(2).unwrap());
        assert_eq!(store.partition_page_count(2).unwrap(), 6);
        assert_eq!(store.free_page_count(2).unwrap(), 1);
        assert_eq!(store.partition_root(2).unwrap(), 5);
        assert_eq!(store.read(PageId::new(2, 1)).unwrap()[200], 0x5A);
        assert_eq!(store.allocate(2, PageType::Data).unwrap(), freed);
    }

    #[test]
    fn test_reopen_with_other_page_size_fails() {
        let dir = tempdir().unwrap();
        {
            let store = PageStore::open(persistent_config(dir.path())).unwrap();
            store.open_partition(0).unwrap();
            store.checkpoint().unwrap();
        }
        let config = StorageConfig {
            page_size: PAGE * 2,
            ..persistent_config(dir.path())
        };
        let store = PageStore::open(config).unwrap();
        let err = store.open_partition(0).unwrap_err();
        assert!(matches!(
            err,
            BasaltError::PageSizeMismatch {
                expected: 2048,
                actual: 1024
            }
        ));
    }

    #[test]
    fn test_destroy_partition() {
        let dir = tempdir().unwrap();
        let store = PageStore::open(persistent_config(dir.path())).unwrap();
        store.open_partition(1).unwrap();
        store.allocate(1, PageType::Data).unwrap();
        store.checkpoint().unwrap();
        store.allocate(1, PageType::Data).unwrap();

        store.destroy_partition(1).unwrap();
        assert!(!store.is_open(1));
        assert_eq!(store.dirty_page_count(), 0);
        assert!(store.stored_partitions().unwrap().is_empty());
        assert!(store.open_partition(1).unwrap());
        assert_eq!(store.partition_page_count(1).unwrap(), 1);
    }

    #[test]
    fn test_destroy_refuses_pinned_pages() {
        let store = PageStore::in_memory(PAGE, 16).unwrap();
        store.open_partition(1).unwrap();
        let page_id = store.allocate(1, PageType::Data).unwrap();
        let handle = store.acquire(page_id).unwrap();
        assert!(store.destroy_partition(1).is_err());
        drop(handle);
    }
}
