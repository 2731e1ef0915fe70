//! Row version chains.
//!
//! Every row key maps, through the primary tree, to the newest version of
//! the row. Versions link to the next older one, so a chain reads newest
//! first with strictly decreasing timestamps.
//!
//! A version is stored as one or more fragments in data pages:
//! ```text
//! head:         [timestamp 8][flags 1][next version 6][total size 4][next fragment 6][bytes...]
//! continuation: [next fragment 6][bytes...]
//! ```
//! Values too large for one page continue in further fragments until
//! `total size` bytes have been read.

use super::freespace::FreeSpaceMap;
use super::link::Link;
use super::page::DataPage;
use crate::btree::{BplusTree, Cursor, PrimaryEntry, PrimaryTree};
use crate::store::PageStore;
use basalt_common::page::{PageId, PageType};
use basalt_common::{BasaltError, HybridTimestamp, Result};
use bytes::{Bytes, BytesMut};
use parking_lot::{Mutex, RwLock, RwLockReadGuard};
use std::ops::Bound;
use std::sync::Arc;
use std::time::Duration;

/// Chains truncated per walk of the primary tree during garbage collection.
const GC_BATCH: usize = 64;

/// How long garbage collection waits for readers before giving up a pass.
const GC_LATCH_WAIT: Duration = Duration::from_millis(50);

/// Header of the first fragment of a version.
///
/// Layout (25 bytes):
/// - timestamp: 8 bytes
/// - flags: 1 byte (bit 0 = tombstone)
/// - next: 6 bytes (next older version)
/// - total_size: 4 bytes (value size over all fragments)
/// - next_fragment: 6 bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VersionHeader {
    pub timestamp: HybridTimestamp,
    pub tombstone: bool,
    pub next: Link,
    pub total_size: u32,
    pub next_fragment: Link,
}

impl VersionHeader {
    pub const SIZE: usize = 25;

    const FLAG_TOMBSTONE: u8 = 0x01;

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0..8].copy_from_slice(&self.timestamp.to_bytes());
        buf[8] = if self.tombstone { Self::FLAG_TOMBSTONE } else { 0 };
        buf[9..15].copy_from_slice(&self.next.to_bytes());
        buf[15..19].copy_from_slice(&self.total_size.to_le_bytes());
        buf[19..25].copy_from_slice(&self.next_fragment.to_bytes());
        buf
    }

    pub fn from_bytes(buf: &[u8]) -> Self {
        Self {
            timestamp: HybridTimestamp::from_bytes(&buf[0..8]),
            tombstone: buf[8] & Self::FLAG_TOMBSTONE != 0,
            next: Link::from_bytes(&buf[9..15]),
            total_size: u32::from_le_bytes([buf[15], buf[16], buf[17], buf[18]]),
            next_fragment: Link::from_bytes(&buf[19..25]),
        }
    }
}

/// Size of the continuation fragment header.
const CONTINUATION_HEADER_SIZE: usize = Link::SIZE;

/// One row version. `value` is None for a tombstone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Version {
    pub timestamp: HybridTimestamp,
    pub value: Option<Bytes>,
}

impl Version {
    pub fn is_tombstone(&self) -> bool {
        self.value.is_none()
    }
}

/// Result of a point read at a timestamp.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadResult {
    /// The row existed with this value.
    Found(Bytes),
    /// The row was deleted.
    Deleted,
    /// The row did not exist yet, or was garbage collected.
    NotFound,
}

impl ReadResult {
    /// Returns the value, if the row was found.
    pub fn into_value(self) -> Option<Bytes> {
        match self {
            ReadResult::Found(value) => Some(value),
            _ => None,
        }
    }
}

/// Counters of one garbage collection pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GcStats {
    /// Chains looked at.
    pub chains_visited: usize,
    /// Versions unlinked and freed.
    pub versions_removed: usize,
    /// Rows whose whole chain was removed.
    pub rows_removed: usize,
    /// True when an open reader stopped the pass early.
    pub deferred: bool,
}

/// Version chains of one partition, with the primary tree and the data
/// pages behind them.
///
/// Writes (`add_version`, `gc`) are serialized internally. Readers may run
/// concurrently with writes; garbage collection waits for them by skipping
/// its pass while any read is in progress.
pub struct VersionChain {
    store: Arc<PageStore>,
    partition: u32,
    primary: BplusTree<PrimaryTree>,
    space: FreeSpaceMap,
    writer: Mutex<()>,
    /// Shared by readers, exclusive while freeing versions.
    gc_latch: RwLock<()>,
    /// Replaced heads that could not be freed while readers were active.
    pending_free: Mutex<Vec<Link>>,
}

impl VersionChain {
    /// Creates empty chains in a partition.
    pub fn create(store: Arc<PageStore>, partition: u32) -> Result<Self> {
        let primary = BplusTree::create(store.clone(), partition)?;
        Ok(Self::with_primary(store, partition, primary))
    }

    /// Opens the chains of a partition by the primary tree meta page and
    /// rebuilds the free space map from its data pages.
    pub fn open(store: Arc<PageStore>, primary_meta: PageId) -> Result<Self> {
        let partition = primary_meta.partition;
        let primary = BplusTree::open(store.clone(), primary_meta)?;
        let chain = Self::with_primary(store, partition, primary);

        for page_id in chain.store.pages_of_type(partition, PageType::Data)? {
            let page = chain.store.read(page_id)?;
            DataPage::validate(&page, page_id)?;
            chain.space.update(page_id.page_idx, DataPage::insertable_space(&page));
        }
        tracing::debug!(
            partition,
            data_pages = chain.space.page_count(),
            "opened version chains"
        );
        Ok(chain)
    }

    fn with_primary(store: Arc<PageStore>, partition: u32, primary: BplusTree<PrimaryTree>) -> Self {
        let page_size = store.page_size();
        Self {
            store,
            partition,
            primary,
            space: FreeSpaceMap::new(page_size),
            writer: Mutex::new(()),
            gc_latch: RwLock::new(()),
            pending_free: Mutex::new(Vec::new()),
        }
    }

    pub fn partition(&self) -> u32 {
        self.partition
    }

    /// The primary tree mapping row keys to chain heads.
    pub fn primary(&self) -> &BplusTree<PrimaryTree> {
        &self.primary
    }

    /// Number of data pages holding versions.
    pub fn data_page_count(&self) -> usize {
        self.space.page_count()
    }

    fn page_id(&self, link: Link) -> PageId {
        PageId::new(self.partition, link.page_idx)
    }

    fn dangling(&self, link: Link) -> BasaltError {
        BasaltError::PageCorrupted {
            page_id: self.page_id(link).as_u64(),
            reason: format!("version link {} points at no record", link),
        }
    }

    // =========================================================================
    // Fragments
    // =========================================================================

    /// Runs `f` over the record a link points at.
    fn with_record<T>(&self, link: Link, f: impl FnOnce(&[u8]) -> Result<T>) -> Result<T> {
        if link.is_null() {
            return Err(BasaltError::Internal("read through a null version link".to_string()));
        }
        let page_id = self.page_id(link);
        let page = self.store.read(page_id)?;
        DataPage::validate(&page, page_id)?;
        let record = DataPage::get(&page, link.slot).ok_or_else(|| self.dangling(link))?;
        f(record)
    }

    fn read_header(&self, link: Link) -> Result<VersionHeader> {
        self.with_record(link, |record| {
            if record.len() < VersionHeader::SIZE {
                return Err(self.dangling(link));
            }
            Ok(VersionHeader::from_bytes(record))
        })
    }

    /// Stores one record in a page with room for it.
    fn place(&self, record: &[u8]) -> Result<Link> {
        if let Some(page_idx) = self.space.find(record.len()) {
            let page_id = PageId::new(self.partition, page_idx);
            let mut page = self.store.write(page_id)?;
            DataPage::validate(&page, page_id)?;
            let slot = DataPage::insert(&mut page, record);
            self.space.update(page_idx, DataPage::insertable_space(&page));
            if let Some(slot) = slot {
                return Ok(Link::new(page_idx, slot));
            }
        }

        let page_id = self.store.allocate(self.partition, PageType::Data)?;
        let mut page = self.store.write(page_id)?;
        DataPage::init(&mut page, page_id);
        let slot = DataPage::insert(&mut page, record).ok_or_else(|| {
            BasaltError::Internal(format!(
                "record of {} bytes does not fit an empty data page",
                record.len()
            ))
        })?;
        self.space.update(page_id.page_idx, DataPage::insertable_space(&page));
        Ok(Link::new(page_id.page_idx, slot))
    }

    /// Deletes one record. Pages left empty go back to the page store.
    fn release(&self, link: Link) -> Result<()> {
        let page_id = self.page_id(link);
        let mut page = self.store.write(page_id)?;
        DataPage::validate(&page, page_id)?;
        if !DataPage::delete(&mut page, link.slot) {
            return Err(self.dangling(link));
        }
        if DataPage::record_count(&page) == 0 {
            drop(page);
            self.space.remove(link.page_idx);
            self.store.free(page_id)?;
        } else {
            self.space.update(link.page_idx, DataPage::insertable_space(&page));
        }
        Ok(())
    }

    /// Writes a version, tail fragments first, and returns its head link.
    fn write_version(&self, header: VersionHeader, value: &[u8]) -> Result<Link> {
        let max_record = DataPage::max_record_size(self.store.page_size());
        let head_capacity = max_record - VersionHeader::SIZE;
        let chunk_capacity = max_record - CONTINUATION_HEADER_SIZE;

        let head_len = value.len().min(head_capacity);
        let (head_bytes, rest) = value.split_at(head_len);
        let chunks: Vec<&[u8]> = rest.chunks(chunk_capacity).collect();

        let mut written = Vec::with_capacity(chunks.len() + 1);
        let result = (|| {
            let mut next_fragment = Link::NULL;
            for chunk in chunks.iter().rev() {
                let mut record = Vec::with_capacity(CONTINUATION_HEADER_SIZE + chunk.len());
                record.extend_from_slice(&next_fragment.to_bytes());
                record.extend_from_slice(chunk);
                next_fragment = self.place(&record)?;
                written.push(next_fragment);
            }

            let header = VersionHeader {
                total_size: value.len() as u32,
                next_fragment,
                ..header
            };
            let mut record = Vec::with_capacity(VersionHeader::SIZE + head_bytes.len());
            record.extend_from_slice(&header.to_bytes());
            record.extend_from_slice(head_bytes);
            self.place(&record)
        })();

        if result.is_err() {
            for link in written {
                if let Err(e) = self.release(link) {
                    tracing::warn!(partition = self.partition, %link, error = %e, "failed to release fragment");
                }
            }
        }
        result
    }

    /// Frees every fragment of one version.
    fn free_version(&self, head: Link) -> Result<()> {
        let mut fragment = self.read_header(head)?.next_fragment;
        self.release(head)?;
        while let Some(link) = fragment.non_null() {
            fragment = self.with_record(link, |record| {
                if record.len() < CONTINUATION_HEADER_SIZE {
                    return Err(self.dangling(link));
                }
                Ok(Link::from_bytes(record))
            })?;
            self.release(link)?;
        }
        Ok(())
    }

    /// Restartable sequence of the value chunks of a version.
    pub fn fragments(&self, head: Link) -> Fragments<'_> {
        Fragments {
            chain: self,
            head,
            next: Link::NULL,
            remaining: 0,
            started: false,
        }
    }

    fn read_version(&self, head: Link, header: &VersionHeader) -> Result<Version> {
        if header.tombstone {
            return Ok(Version {
                timestamp: header.timestamp,
                value: None,
            });
        }
        let mut value = BytesMut::with_capacity(header.total_size as usize);
        for chunk in self.fragments(head) {
            value.extend_from_slice(&chunk?);
        }
        Ok(Version {
            timestamp: header.timestamp,
            value: Some(value.freeze()),
        })
    }

    // =========================================================================
    // Chain operations
    // =========================================================================

    /// Returns the newest version of a row.
    pub fn head(&self, key: &[u8]) -> Result<Option<Version>> {
        let _latch = self.gc_latch.read_recursive();
        match self.primary.find(key)? {
            Some(entry) => {
                let header = self.read_header(entry.head)?;
                Ok(Some(self.read_version(entry.head, &header)?))
            }
            None => Ok(None),
        }
    }

    /// Fails with `KeyTooLarge` if a row key can not be stored.
    pub fn check_key(&self, key: &[u8]) -> Result<()> {
        self.primary.check_row(&PrimaryEntry::new(Bytes::copy_from_slice(key), Link::NULL))
    }

    /// Prepends a version to a row's chain. `None` writes a tombstone.
    ///
    /// A timestamp equal to the head's replaces the head, so replaying a
    /// write is harmless. An older timestamp fails with `StaleTimestamp`.
    pub fn add_version(&self, key: &[u8], timestamp: HybridTimestamp, value: Option<&[u8]>) -> Result<Link> {
        self.check_key(key)?;
        let _writer = self.writer.lock();

        let (next, replaced) = match self.primary.find(key)? {
            Some(entry) => {
                let head = self.read_header(entry.head)?;
                if timestamp < head.timestamp {
                    return Err(BasaltError::StaleTimestamp {
                        timestamp: timestamp.as_u64(),
                        head: head.timestamp.as_u64(),
                    });
                }
                if timestamp == head.timestamp {
                    (head.next, Some(entry.head))
                } else {
                    (entry.head, None)
                }
            }
            None => (Link::NULL, None),
        };

        let header = VersionHeader {
            timestamp,
            tombstone: value.is_none(),
            next,
            total_size: 0,
            next_fragment: Link::NULL,
        };
        let link = self.write_version(header, value.unwrap_or_default())?;
        if let Err(e) = self.primary.insert(&PrimaryEntry::new(Bytes::copy_from_slice(key), link)) {
            if let Err(release) = self.free_version(link) {
                tracing::warn!(partition = self.partition, %link, error = %release, "failed to release version");
            }
            return Err(e);
        }

        if let Some(old) = replaced {
            match self.gc_latch.try_write() {
                Some(_exclusive) => self.free_version(old)?,
                None => self.pending_free.lock().push(old),
            }
        }
        Ok(link)
    }

    /// Walks a chain from `head` to the version visible at `timestamp`.
    fn visible_from(&self, head: Link, timestamp: HybridTimestamp) -> Result<ReadResult> {
        let mut link = head;
        while let Some(current) = link.non_null() {
            let header = self.read_header(current)?;
            if header.timestamp <= timestamp {
                return Ok(match self.read_version(current, &header)?.value {
                    Some(value) => ReadResult::Found(value),
                    None => ReadResult::Deleted,
                });
            }
            link = header.next;
        }
        Ok(ReadResult::NotFound)
    }

    /// Reads a row as of a timestamp: the newest version at or before it.
    pub fn read_at(&self, key: &[u8], timestamp: HybridTimestamp) -> Result<ReadResult> {
        let _latch = self.gc_latch.read_recursive();
        match self.primary.find(key)? {
            Some(entry) => self.visible_from(entry.head, timestamp),
            None => Ok(ReadResult::NotFound),
        }
    }

    /// Lazily iterates the versions of a row, newest first.
    ///
    /// Garbage collection is held off until the iterator is dropped.
    pub fn scan_chain(&self, key: &[u8]) -> ChainIter<'_> {
        ChainIter {
            chain: self,
            _latch: self.gc_latch.read_recursive(),
            key: key.to_vec(),
            position: ChainPosition::Start,
        }
    }

    /// Lazily iterates every row visible at a timestamp in key order,
    /// yielding `(row key, value)`.
    pub fn scan_at(&self, timestamp: HybridTimestamp) -> VisibleRows<'_> {
        VisibleRows {
            chain: self,
            _latch: self.gc_latch.read_recursive(),
            cursor: self.primary.iter(),
            timestamp,
        }
    }

    // =========================================================================
    // Garbage collection
    // =========================================================================

    /// Removes versions no reader at or above `watermark` can observe.
    ///
    /// Per chain, the newest version at or before the watermark is kept and
    /// everything older is freed. When that version is a deleted head, the
    /// whole row goes.
    ///
    /// The exclusive latch is taken for one chain at a time, so point reads
    /// interleave with the pass. If an open scan keeps the latch for longer
    /// than `GC_LATCH_WAIT`, the pass stops there and reports `deferred`.
    pub fn gc(&self, watermark: HybridTimestamp) -> Result<GcStats> {
        let _writer = self.writer.lock();
        let mut stats = GcStats::default();

        {
            let Some(_exclusive) = self.gc_latch.try_write_for(GC_LATCH_WAIT) else {
                return Ok(self.gc_deferred(stats));
            };
            let pending = std::mem::take(&mut *self.pending_free.lock());
            for link in pending {
                self.free_version(link)?;
                stats.versions_removed += 1;
            }
        }

        // The writer lock keeps the primary tree still between batches.
        let mut after: Option<Bytes> = None;
        loop {
            let lower = match after.as_deref() {
                Some(key) => Bound::Excluded(key),
                None => Bound::Unbounded,
            };
            let batch = self
                .primary
                .range(lower, Bound::Unbounded)
                .take(GC_BATCH)
                .collect::<Result<Vec<_>>>()?;
            let Some(last) = batch.last() else {
                break;
            };
            after = Some(last.key.clone());

            for entry in batch {
                let Some(_exclusive) = self.gc_latch.try_write_for(GC_LATCH_WAIT) else {
                    return Ok(self.gc_deferred(stats));
                };
                stats.chains_visited += 1;
                self.gc_chain(&entry, watermark, &mut stats)?;
            }
        }

        if stats.versions_removed > 0 {
            tracing::debug!(
                partition = self.partition,
                watermark = watermark.as_u64(),
                chains = stats.chains_visited,
                versions = stats.versions_removed,
                rows = stats.rows_removed,
                "gc pass"
            );
        }
        Ok(stats)
    }

    fn gc_deferred(&self, stats: GcStats) -> GcStats {
        tracing::debug!(
            partition = self.partition,
            chains = stats.chains_visited,
            versions = stats.versions_removed,
            "gc deferred by open readers"
        );
        GcStats {
            deferred: true,
            ..stats
        }
    }

    /// Truncates one chain. The caller holds the exclusive latch.
    fn gc_chain(&self, entry: &PrimaryEntry, watermark: HybridTimestamp, stats: &mut GcStats) -> Result<()> {
        let mut link = entry.head;
        let mut kept = None;
        while let Some(current) = link.non_null() {
            let header = self.read_header(current)?;
            if header.timestamp <= watermark {
                kept = Some((current, header));
                break;
            }
            link = header.next;
        }
        let Some((kept_link, kept_header)) = kept else {
            return Ok(());
        };

        if kept_header.tombstone && kept_link == entry.head {
            self.primary.remove(&entry.key)?;
            self.free_chain(kept_link, stats)?;
            stats.rows_removed += 1;
        } else if let Some(older) = kept_header.next.non_null() {
            self.unlink_older(kept_link)?;
            self.free_chain(older, stats)?;
        }
        Ok(())
    }

    /// Clears the next-version link of a version.
    fn unlink_older(&self, link: Link) -> Result<()> {
        let page_id = self.page_id(link);
        let mut page = self.store.write(page_id)?;
        DataPage::validate(&page, page_id)?;
        let record = DataPage::get_mut(&mut page, link.slot).ok_or_else(|| self.dangling(link))?;
        if record.len() < VersionHeader::SIZE {
            return Err(self.dangling(link));
        }
        let mut header = VersionHeader::from_bytes(record);
        header.next = Link::NULL;
        record[..VersionHeader::SIZE].copy_from_slice(&header.to_bytes());
        Ok(())
    }

    /// Frees a version and all older ones.
    fn free_chain(&self, from: Link, stats: &mut GcStats) -> Result<()> {
        let mut link = from;
        while let Some(current) = link.non_null() {
            link = self.read_header(current)?.next;
            self.free_version(current)?;
            stats.versions_removed += 1;
        }
        Ok(())
    }
}

/// Value chunks of one version, in order.
///
/// Finite: stops once the declared total size has been read. `rewind`
/// restarts from the first chunk.
pub struct Fragments<'a> {
    chain: &'a VersionChain,
    head: Link,
    next: Link,
    remaining: usize,
    started: bool,
}

impl Fragments<'_> {
    pub fn rewind(&mut self) {
        self.started = false;
        self.remaining = 0;
        self.next = Link::NULL;
    }

    fn first(&mut self) -> Result<Option<Bytes>> {
        let head = self.head;
        let (header, chunk) = self.chain.with_record(head, |record| {
            if record.len() < VersionHeader::SIZE {
                return Err(self.chain.dangling(head));
            }
            Ok((
                VersionHeader::from_bytes(record),
                Bytes::copy_from_slice(&record[VersionHeader::SIZE..]),
            ))
        })?;
        self.started = true;
        if chunk.len() > header.total_size as usize {
            return Err(self.chain.dangling(head));
        }
        self.remaining = header.total_size as usize - chunk.len();
        self.next = header.next_fragment;
        Ok((!chunk.is_empty()).then_some(chunk))
    }

    fn continuation(&mut self) -> Result<Bytes> {
        let Some(link) = self.next.non_null() else {
            return Err(BasaltError::PageCorrupted {
                page_id: self.chain.page_id(self.head).as_u64(),
                reason: format!("version {} ends {} bytes short", self.head, self.remaining),
            });
        };
        let (next, chunk) = self.chain.with_record(link, |record| {
            if record.len() < CONTINUATION_HEADER_SIZE {
                return Err(self.chain.dangling(link));
            }
            Ok((
                Link::from_bytes(record),
                Bytes::copy_from_slice(&record[CONTINUATION_HEADER_SIZE..]),
            ))
        })?;
        if chunk.is_empty() || chunk.len() > self.remaining {
            return Err(self.chain.dangling(link));
        }
        self.remaining -= chunk.len();
        self.next = next;
        Ok(chunk)
    }
}

impl Iterator for Fragments<'_> {
    type Item = Result<Bytes>;

    fn next(&mut self) -> Option<Self::Item> {
        if !self.started {
            match self.first() {
                Ok(Some(chunk)) => return Some(Ok(chunk)),
                Ok(None) => {}
                Err(e) => {
                    self.remaining = 0;
                    return Some(Err(e));
                }
            }
        }
        if self.remaining == 0 {
            return None;
        }
        let chunk = self.continuation();
        if chunk.is_err() {
            self.remaining = 0;
        }
        Some(chunk)
    }
}

enum ChainPosition {
    Start,
    At(Link),
    Done,
}

/// Versions of one row, newest first.
pub struct ChainIter<'a> {
    chain: &'a VersionChain,
    _latch: RwLockReadGuard<'a, ()>,
    key: Vec<u8>,
    position: ChainPosition,
}

impl ChainIter<'_> {
    /// Restarts from the current head.
    pub fn rewind(&mut self) {
        self.position = ChainPosition::Start;
    }

    fn step(&mut self) -> Result<Option<Version>> {
        let link = match self.position {
            ChainPosition::Start => match self.chain.primary.find(&self.key)? {
                Some(entry) => entry.head,
                None => Link::NULL,
            },
            ChainPosition::At(link) => link,
            ChainPosition::Done => return Ok(None),
        };
        if link.is_null() {
            self.position = ChainPosition::Done;
            return Ok(None);
        }
        let header = self.chain.read_header(link)?;
        let version = self.chain.read_version(link, &header)?;
        self.position = ChainPosition::At(header.next);
        Ok(Some(version))
    }
}

impl Iterator for ChainIter<'_> {
    type Item = Result<Version>;

    fn next(&mut self) -> Option<Self::Item> {
        let step = self.step();
        if step.is_err() {
            self.position = ChainPosition::Done;
        }
        step.transpose()
    }
}

/// Rows visible at one timestamp, in row key order.
pub struct VisibleRows<'a> {
    chain: &'a VersionChain,
    _latch: RwLockReadGuard<'a, ()>,
    cursor: Cursor<'a, PrimaryTree>,
    timestamp: HybridTimestamp,
}

impl VisibleRows<'_> {
    pub fn rewind(&mut self) {
        self.cursor.rewind();
    }
}

impl Iterator for VisibleRows<'_> {
    type Item = Result<(Bytes, Bytes)>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let entry = match self.cursor.next()? {
                Ok(entry) => entry,
                Err(e) => return Some(Err(e)),
            };
            match self.chain.visible_from(entry.head, self.timestamp) {
                Ok(ReadResult::Found(value)) => return Some(Ok((entry.key, value))),
                Ok(_) => continue,
                Err(e) => return Some(Err(e)),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: usize = 1024;

    fn chain() -> VersionChain {
        let store = Arc::new(PageStore::in_memory(PAGE, 512).unwrap());
        store.open_partition(1).unwrap();
        VersionChain::create(store, 1).unwrap()
    }

    fn ts(value: u64) -> HybridTimestamp {
        HybridTimestamp::from_u64(value)
    }

    fn found(value: &[u8]) -> ReadResult {
        ReadResult::Found(Bytes::copy_from_slice(value))
    }

    #[test]
    fn test_header_layout() {
        let header = VersionHeader {
            timestamp: ts(42),
            tombstone: true,
            next: Link::new(3, 1),
            total_size: 77,
            next_fragment: Link::new(9, 2),
        };
        let bytes = header.to_bytes();
        assert_eq!(bytes[8], 1);
        assert_eq!(VersionHeader::from_bytes(&bytes), header);
    }

    #[test]
    fn test_read_at_timestamps() {
        let chain = chain();
        chain.add_version(b"k", ts(100), Some(b"v100")).unwrap();
        chain.add_version(b"k", ts(200), None).unwrap();
        chain.add_version(b"k", ts(300), Some(b"v300")).unwrap();

        assert_eq!(chain.read_at(b"k", ts(99)).unwrap(), ReadResult::NotFound);
        assert_eq!(chain.read_at(b"k", ts(100)).unwrap(), found(b"v100"));
        assert_eq!(chain.read_at(b"k", ts(150)).unwrap(), found(b"v100"));
        assert_eq!(chain.read_at(b"k", ts(250)).unwrap(), ReadResult::Deleted);
        assert_eq!(chain.read_at(b"k", HybridTimestamp::MAX).unwrap(), found(b"v300"));
        assert_eq!(chain.read_at(b"other", ts(300)).unwrap(), ReadResult::NotFound);
    }

    #[test]
    fn test_stale_and_equal_timestamps() {
        let chain = chain();
        chain.add_version(b"k", ts(10), Some(b"a")).unwrap();
        chain.add_version(b"k", ts(20), Some(b"b")).unwrap();

        let err = chain.add_version(b"k", ts(15), Some(b"c")).unwrap_err();
        assert!(matches!(err, BasaltError::StaleTimestamp { timestamp: 15, head: 20 }));

        chain.add_version(b"k", ts(20), Some(b"b2")).unwrap();
        let versions: Vec<_> = chain.scan_chain(b"k").map(|v| v.unwrap()).collect();
        assert_eq!(versions.len(), 2);
        assert_eq!(versions[0].value.as_deref(), Some(&b"b2"[..]));
        assert_eq!(versions[1].timestamp, ts(10));
    }

    #[test]
    fn test_scan_chain_is_restartable() {
        let chain = chain();
        for t in 1..=5u64 {
            chain.add_version(b"row", ts(t), Some(&t.to_le_bytes())).unwrap();
        }
        let mut scan = chain.scan_chain(b"row");
        let first: Vec<_> = scan.by_ref().take(2).map(|v| v.unwrap().timestamp).collect();
        assert_eq!(first, vec![ts(5), ts(4)]);
        scan.rewind();
        let all: Vec<_> = scan.map(|v| v.unwrap().timestamp.as_u64()).collect();
        assert_eq!(all, vec![5, 4, 3, 2, 1]);
        assert_eq!(chain.scan_chain(b"missing").count(), 0);
    }

    #[test]
    fn test_large_value_fragments() {
        let chain = chain();
        let value: Vec<u8> = (0..5000u32).map(|i| (i % 251) as u8).collect();
        let head = chain.add_version(b"big", ts(1), Some(&value)).unwrap();

        let chunks: Vec<_> = chain.fragments(head).map(|c| c.unwrap()).collect();
        assert!(chunks.len() > 4);
        assert_eq!(chunks.iter().map(Bytes::len).sum::<usize>(), value.len());
        assert_eq!(chain.read_at(b"big", ts(1)).unwrap(), found(&value));

        let mut fragments = chain.fragments(head);
        fragments.next().unwrap().unwrap();
        fragments.rewind();
        assert_eq!(fragments.count(), chunks.len());
    }

    #[test]
    fn test_empty_value_is_not_a_tombstone() {
        let chain = chain();
        chain.add_version(b"k", ts(1), Some(b"")).unwrap();
        assert_eq!(chain.read_at(b"k", ts(1)).unwrap(), found(b""));
    }

    #[test]
    fn test_gc_truncates_old_versions() {
        let chain = chain();
        for t in 1..=4u64 {
            chain.add_version(b"k", ts(t * 10), Some(&[t as u8; 300])).unwrap();
        }
        let stats = chain.gc(ts(25)).unwrap();
        assert_eq!(stats.versions_removed, 1);
        assert!(!stats.deferred);

        let left: Vec<_> = chain.scan_chain(b"k").map(|v| v.unwrap().timestamp.as_u64()).collect();
        assert_eq!(left, vec![40, 30, 20]);
        assert_eq!(chain.read_at(b"k", ts(25)).unwrap(), found(&[2u8; 300]));
    }

    #[test]
    fn test_gc_removes_deleted_rows() {
        let chain = chain();
        chain.add_version(b"gone", ts(10), Some(b"x")).unwrap();
        chain.add_version(b"gone", ts(20), None).unwrap();
        chain.add_version(b"kept", ts(10), Some(b"y")).unwrap();

        let stats = chain.gc(ts(30)).unwrap();
        assert_eq!(stats.rows_removed, 1);
        assert_eq!(stats.versions_removed, 2);
        assert_eq!(chain.primary().find(b"gone").unwrap(), None);
        assert_eq!(chain.read_at(b"kept", ts(30)).unwrap(), found(b"y"));
    }

    #[test]
    fn test_gc_waits_for_scans() {
        let chain = chain();
        chain.add_version(b"k", ts(1), Some(b"a")).unwrap();
        chain.add_version(b"k", ts(2), Some(b"b")).unwrap();

        let scan = chain.scan_chain(b"k");
        assert!(chain.gc(ts(5)).unwrap().deferred);
        drop(scan);
        assert_eq!(chain.gc(ts(5)).unwrap().versions_removed, 1);
    }

    #[test]
    fn test_point_reads_run_during_gc() {
        use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

        let store = Arc::new(PageStore::in_memory(PAGE, 4096).unwrap());
        store.open_partition(1).unwrap();
        let chain = VersionChain::create(store, 1).unwrap();
        let rows = 2000u32;
        for t in 1..=3u64 {
            for row in 0..rows {
                chain
                    .add_version(&row.to_be_bytes(), ts(t), Some(&[t as u8; 40]))
                    .unwrap();
            }
        }

        let gc_running = AtomicBool::new(false);
        let gc_done = AtomicBool::new(false);
        let reads_during_gc = AtomicUsize::new(0);
        let started = std::sync::Barrier::new(2);
        let stats = std::thread::scope(|scope| {
            let reader = scope.spawn(|| {
                started.wait();
                let mut row = 0u32;
                while !gc_done.load(Ordering::Acquire) {
                    let result = chain.read_at(&(row % rows).to_be_bytes(), ts(3)).unwrap();
                    assert_eq!(result, found(&[3u8; 40]));
                    if gc_running.load(Ordering::Acquire) && !gc_done.load(Ordering::Acquire) {
                        reads_during_gc.fetch_add(1, Ordering::Relaxed);
                    }
                    row += 1;
                }
            });

            started.wait();
            gc_running.store(true, Ordering::Release);
            let stats = chain.gc(ts(3)).unwrap();
            gc_done.store(true, Ordering::Release);
            reader.join().unwrap();
            stats
        });

        assert!(!stats.deferred);
        assert_eq!(stats.chains_visited, rows as usize);
        assert_eq!(stats.versions_removed, 2 * rows as usize);
        assert!(reads_during_gc.load(Ordering::Relaxed) > 0);
        assert_eq!(chain.scan_chain(&7u32.to_be_bytes()).count(), 1);
    }

    #[test]
    fn test_gc_resumes_after_scan_closes() {
        let chain = chain();
        for row in 0..10u8 {
            chain.add_version(&[row], ts(1), Some(b"a")).unwrap();
            chain.add_version(&[row], ts(2), Some(b"b")).unwrap();
        }
        let scan = chain.scan_at(ts(2));
        let stats = chain.gc(ts(5)).unwrap();
        assert!(stats.deferred);
        assert_eq!(stats.versions_removed, 0);
        drop(scan);

        let stats = chain.gc(ts(5)).unwrap();
        assert!(!stats.deferred);
        assert_eq!(stats.chains_visited, 10);
        assert_eq!(stats.versions_removed, 10);
    }

    #[test]
    fn test_replaced_head_freed_after_scan() {
        let chain = chain();
        chain.add_version(b"k", ts(1), Some(&[1u8; 900])).unwrap();
        let pages = chain.data_page_count();

        let scan = chain.scan_chain(b"k");
        chain.add_version(b"k", ts(1), Some(&[2u8; 900])).unwrap();
        drop(scan);
        assert_eq!(chain.data_page_count(), pages + 1);

        let stats = chain.gc(ts(0)).unwrap();
        assert_eq!(stats.versions_removed, 1);
        assert_eq!(chain.data_page_count(), pages);
        assert_eq!(chain.read_at(b"k", ts(1)).unwrap(), found(&[2u8; 900]));
    }

    #[test]
    fn test_scan_at_skips_invisible_rows() {
        let chain = chain();
        chain.add_version(b"a", ts(10), Some(b"1")).unwrap();
        chain.add_version(b"b", ts(30), Some(b"2")).unwrap();
        chain.add_version(b"c", ts(10), Some(b"3")).unwrap();
        chain.add_version(b"c", ts(20), None).unwrap();

        let rows: Vec<_> = chain.scan_at(ts(25)).map(|r| r.unwrap()).collect();
        assert_eq!(
            rows,
            vec![(Bytes::from_static(b"a"), Bytes::from_static(b"1"))]
        );
        assert_eq!(chain.scan_at(HybridTimestamp::MAX).count(), 2);
    }

    #[test]
    fn test_reopen_rebuilds_free_space() {
        let store = Arc::new(PageStore::in_memory(PAGE, 512).unwrap());
        store.open_partition(1).unwrap();
        let chain = VersionChain::create(store.clone(), 1).unwrap();
        chain.add_version(b"k", ts(1), Some(&[5u8; 2000])).unwrap();
        let meta = chain.primary().meta_page();
        let pages = chain.data_page_count();
        drop(chain);

        let chain = VersionChain::open(store, meta).unwrap();
        assert_eq!(chain.data_page_count(), pages);
        assert_eq!(chain.read_at(b"k", ts(1)).unwrap(), found(&[5u8; 2000]));
    }

    #[test]
    fn test_oversized_key_rejected_before_write() {
        let chain = chain();
        let key = vec![0u8; PAGE];
        let err = chain.add_version(&key, ts(1), Some(b"v")).unwrap_err();
        assert!(matches!(err, BasaltError::KeyTooLarge { .. }));
        assert_eq!(chain.data_page_count(), 0);
    }
}
