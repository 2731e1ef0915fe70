//! Data pages holding version fragments.
//!
//! Slotted page format:
//! ```text
//! +------------------+ 0
//! | Page Header (32) |
//! +------------------+ 32
//! | Data Header (8)  |
//! +------------------+ 40 (DATA_START)
//! | Slot Array       |  <- grows forward
//! | (4 bytes/slot)   |
//! +------------------+ free_space_start
//! | Free Space       |
//! +------------------+ free_space_end
//! | Record Data      |  <- grows backward from the page end
//! +------------------+ page_size
//! ```
//!
//! A slot with length 0 is empty and is reused by the next insert, so links
//! to live records stay valid across deletes and compaction.

use basalt_common::page::{PageHeader, PageId, PageType};
use basalt_common::{BasaltError, Result};

/// Size of one slot entry.
pub const SLOT_SIZE: usize = 4;

/// Data page header, stored after the [`PageHeader`].
///
/// Layout (8 bytes):
/// - slot_count: 2 bytes
/// - free_space_start: 2 bytes (end of slot array)
/// - free_space_end: 2 bytes (start of record data)
/// - reserved: 2 bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataPageHeader {
    pub slot_count: u16,
    pub free_space_start: u16,
    pub free_space_end: u16,
    pub reserved: u16,
}

impl DataPageHeader {
    pub const SIZE: usize = 8;
    pub const OFFSET: usize = PageHeader::SIZE;

    fn new(page_size: usize) -> Self {
        Self {
            slot_count: 0,
            free_space_start: DataPage::DATA_START as u16,
            free_space_end: page_size as u16,
            reserved: 0,
        }
    }

    /// Contiguous free bytes.
    pub fn free_space(&self) -> usize {
        (self.free_space_end as usize).saturating_sub(self.free_space_start as usize)
    }

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0..2].copy_from_slice(&self.slot_count.to_le_bytes());
        buf[2..4].copy_from_slice(&self.free_space_start.to_le_bytes());
        buf[4..6].copy_from_slice(&self.free_space_end.to_le_bytes());
        buf[6..8].copy_from_slice(&self.reserved.to_le_bytes());
        buf
    }

    pub fn from_bytes(buf: &[u8]) -> Self {
        Self {
            slot_count: u16::from_le_bytes([buf[0], buf[1]]),
            free_space_start: u16::from_le_bytes([buf[2], buf[3]]),
            free_space_end: u16::from_le_bytes([buf[4], buf[5]]),
            reserved: u16::from_le_bytes([buf[6], buf[7]]),
        }
    }
}

/// Namespace for data page operations on raw page slices.
pub struct DataPage;

impl DataPage {
    /// Offset where the slot array begins.
    pub const DATA_START: usize = PageHeader::SIZE + DataPageHeader::SIZE;

    /// Largest record a page of the given size can hold.
    pub fn max_record_size(page_size: usize) -> usize {
        page_size - Self::DATA_START - SLOT_SIZE
    }

    /// Formats a freshly allocated page as an empty data page.
    pub fn init(buf: &mut [u8], page_id: PageId) {
        let page_size = buf.len();
        buf[PageHeader::SIZE..].fill(0);
        PageHeader::init(buf, page_id, PageType::Data);
        Self::set_header(buf, DataPageHeader::new(page_size));
    }

    #[inline]
    pub fn header(buf: &[u8]) -> DataPageHeader {
        let at = DataPageHeader::OFFSET;
        DataPageHeader::from_bytes(&buf[at..at + DataPageHeader::SIZE])
    }

    #[inline]
    fn set_header(buf: &mut [u8], header: DataPageHeader) {
        let at = DataPageHeader::OFFSET;
        buf[at..at + DataPageHeader::SIZE].copy_from_slice(&header.to_bytes());
        PageHeader::set_item_count(buf, header.slot_count);
    }

    /// Checks the page type and header bounds.
    pub fn validate(buf: &[u8], page_id: PageId) -> Result<()> {
        let corrupt = |reason: String| {
            Err(BasaltError::PageCorrupted {
                page_id: page_id.as_u64(),
                reason,
            })
        };
        if PageHeader::type_tag(buf) != PageType::Data as u8 {
            return corrupt(format!("page type tag {} is not a data page", PageHeader::type_tag(buf)));
        }
        let header = Self::header(buf);
        let slots_end = Self::DATA_START + header.slot_count as usize * SLOT_SIZE;
        if header.free_space_start as usize != slots_end
            || (header.free_space_end as usize) < slots_end
            || header.free_space_end as usize > buf.len()
        {
            return corrupt(format!("data page header out of range: {:?}", header));
        }
        Ok(())
    }

    fn slot(buf: &[u8], slot: u16) -> (usize, usize) {
        let at = Self::DATA_START + slot as usize * SLOT_SIZE;
        (
            u16::from_le_bytes([buf[at], buf[at + 1]]) as usize,
            u16::from_le_bytes([buf[at + 2], buf[at + 3]]) as usize,
        )
    }

    fn set_slot(buf: &mut [u8], slot: u16, offset: usize, len: usize) {
        let at = Self::DATA_START + slot as usize * SLOT_SIZE;
        buf[at..at + 2].copy_from_slice(&(offset as u16).to_le_bytes());
        buf[at + 2..at + 4].copy_from_slice(&(len as u16).to_le_bytes());
    }

    /// Returns the record in a slot, or None for an empty or unknown slot.
    pub fn get(buf: &[u8], slot: u16) -> Option<&[u8]> {
        if slot >= Self::header(buf).slot_count {
            return None;
        }
        let (offset, len) = Self::slot(buf, slot);
        if len == 0 || offset + len > buf.len() {
            return None;
        }
        Some(&buf[offset..offset + len])
    }

    /// Returns a writable view of the record in a slot.
    pub fn get_mut(buf: &mut [u8], slot: u16) -> Option<&mut [u8]> {
        if slot >= Self::header(buf).slot_count {
            return None;
        }
        let (offset, len) = Self::slot(buf, slot);
        if len == 0 || offset + len > buf.len() {
            return None;
        }
        Some(&mut buf[offset..offset + len])
    }

    fn empty_slot(buf: &[u8]) -> Option<u16> {
        (0..Self::header(buf).slot_count).find(|&slot| Self::slot(buf, slot).1 == 0)
    }

    /// Bytes taken by live records.
    fn used_record_space(buf: &[u8]) -> usize {
        (0..Self::header(buf).slot_count)
            .map(|slot| Self::slot(buf, slot).1)
            .sum()
    }

    /// Free bytes after compaction, slot array excluded.
    pub fn reclaimable_space(buf: &[u8]) -> usize {
        let header = Self::header(buf);
        buf.len() - header.free_space_start as usize - Self::used_record_space(buf)
    }

    /// Largest record an insert can take right now, counting compaction and
    /// slot reuse.
    pub fn insertable_space(buf: &[u8]) -> usize {
        let space = Self::reclaimable_space(buf);
        if Self::empty_slot(buf).is_some() {
            space
        } else {
            space.saturating_sub(SLOT_SIZE)
        }
    }

    /// Number of live records.
    pub fn record_count(buf: &[u8]) -> usize {
        (0..Self::header(buf).slot_count)
            .filter(|&slot| Self::slot(buf, slot).1 != 0)
            .count()
    }

    /// Stores a record and returns its slot, or None when it does not fit.
    pub fn insert(buf: &mut [u8], record: &[u8]) -> Option<u16> {
        if record.is_empty() || Self::insertable_space(buf) < record.len() {
            return None;
        }
        let reuse = Self::empty_slot(buf);
        let needed = record.len() + if reuse.is_some() { 0 } else { SLOT_SIZE };
        if Self::header(buf).free_space() < needed {
            Self::compact(buf);
        }

        let mut header = Self::header(buf);
        header.free_space_end -= record.len() as u16;
        let offset = header.free_space_end as usize;
        buf[offset..offset + record.len()].copy_from_slice(record);

        let slot = match reuse {
            Some(slot) => slot,
            None => {
                let slot = header.slot_count;
                header.slot_count += 1;
                header.free_space_start += SLOT_SIZE as u16;
                slot
            }
        };
        Self::set_slot(buf, slot, offset, record.len());
        Self::set_header(buf, header);
        Some(slot)
    }

    /// Empties a slot. Trailing empty slots are dropped from the slot array.
    /// Returns false if the slot held no record.
    pub fn delete(buf: &mut [u8], slot: u16) -> bool {
        if Self::get(buf, slot).is_none() {
            return false;
        }
        Self::set_slot(buf, slot, 0, 0);

        let mut header = Self::header(buf);
        while header.slot_count > 0 && Self::slot(buf, header.slot_count - 1).1 == 0 {
            header.slot_count -= 1;
            header.free_space_start -= SLOT_SIZE as u16;
        }
        if header.slot_count == 0 {
            header.free_space_end = buf.len() as u16;
        }
        Self::set_header(buf, header);
        true
    }

    /// Moves all records to the end of the page, closing holes. Slot
    /// numbers are unchanged.
    pub fn compact(buf: &mut [u8]) {
        let mut header = Self::header(buf);
        let mut records: Vec<(u16, Vec<u8>)> = (0..header.slot_count)
            .filter_map(|slot| Self::get(buf, slot).map(|r| (slot, r.to_vec())))
            .collect();
        // Keep the physical order stable.
        records.sort_by_key(|(slot, _)| std::cmp::Reverse(Self::slot(buf, *slot).0));

        let mut end = buf.len();
        for (slot, record) in &records {
            end -= record.len();
            buf[end..end + record.len()].copy_from_slice(record);
            Self::set_slot(buf, *slot, end, record.len());
        }
        header.free_space_end = end as u16;
        Self::set_header(buf, header);
    }
}

/// Converts free bytes to a free-space category (0-255) for a page size.
///
/// Category 0 means no space, 255 means an empty page.
pub fn space_to_category(free_space: usize, page_size: usize) -> u8 {
    let max_space = DataPage::max_record_size(page_size);
    if free_space >= max_space {
        255
    } else {
        ((free_space * 255) / max_space) as u8
    }
}

/// Converts a category back to the free bytes it guarantees.
pub fn category_to_min_space(category: u8, page_size: usize) -> usize {
    let max_space = DataPage::max_record_size(page_size);
    (category as usize * max_space) / 255
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: usize = 1024;

    fn page() -> Vec<u8> {
        let mut buf = vec![0u8; PAGE];
        DataPage::init(&mut buf, PageId::new(1, 5));
        buf
    }

    #[test]
    fn test_header_roundtrip() {
        let header = DataPageHeader {
            slot_count: 3,
            free_space_start: 52,
            free_space_end: 900,
            reserved: 0,
        };
        assert_eq!(DataPageHeader::from_bytes(&header.to_bytes()), header);
        assert_eq!(header.free_space(), 848);
    }

    #[test]
    fn test_insert_get() {
        let mut buf = page();
        let a = DataPage::insert(&mut buf, b"first").unwrap();
        let b = DataPage::insert(&mut buf, b"second").unwrap();
        assert_eq!((a, b), (0, 1));
        assert_eq!(DataPage::get(&buf, a), Some(&b"first"[..]));
        assert_eq!(DataPage::get(&buf, b), Some(&b"second"[..]));
        assert_eq!(DataPage::get(&buf, 2), None);
        assert_eq!(DataPage::record_count(&buf), 2);
        DataPage::validate(&buf, PageId::new(1, 5)).unwrap();
    }

    #[test]
    fn test_delete_reuses_slot() {
        let mut buf = page();
        let a = DataPage::insert(&mut buf, b"aaaa").unwrap();
        let b = DataPage::insert(&mut buf, b"bbbb").unwrap();
        assert!(DataPage::delete(&mut buf, a));
        assert!(!DataPage::delete(&mut buf, a));
        assert_eq!(DataPage::get(&buf, a), None);

        let c = DataPage::insert(&mut buf, b"cccc").unwrap();
        assert_eq!(c, a);
        assert_eq!(DataPage::get(&buf, b), Some(&b"bbbb"[..]));
    }

    #[test]
    fn test_delete_all_resets_page() {
        let mut buf = page();
        let a = DataPage::insert(&mut buf, b"aaaa").unwrap();
        let b = DataPage::insert(&mut buf, b"bbbb").unwrap();
        DataPage::delete(&mut buf, b);
        DataPage::delete(&mut buf, a);
        assert_eq!(DataPage::header(&buf).slot_count, 0);
        assert_eq!(DataPage::insertable_space(&buf), DataPage::max_record_size(PAGE));
    }

    #[test]
    fn test_compaction_on_fragmented_page() {
        let mut buf = page();
        let record = [7u8; 200];
        let slots: Vec<_> = std::iter::from_fn(|| DataPage::insert(&mut buf, &record)).collect();
        assert_eq!(slots.len(), 4);

        DataPage::delete(&mut buf, slots[1]);
        DataPage::delete(&mut buf, slots[2]);
        let big = [9u8; 380];
        let slot = DataPage::insert(&mut buf, &big).unwrap();
        assert_eq!(DataPage::get(&buf, slot), Some(&big[..]));
        assert_eq!(DataPage::get(&buf, slots[0]), Some(&record[..]));
        assert_eq!(DataPage::get(&buf, slots[3]), Some(&record[..]));
        DataPage::validate(&buf, PageId::new(1, 5)).unwrap();
    }

    #[test]
    fn test_max_record() {
        let mut buf = page();
        let max = DataPage::max_record_size(PAGE);
        assert!(DataPage::insert(&mut buf, &vec![1u8; max + 1]).is_none());
        assert!(DataPage::insert(&mut buf, &vec![1u8; max]).is_some());
        assert_eq!(DataPage::insertable_space(&buf), 0);
    }

    #[test]
    fn test_validate_rejects_other_pages() {
        let mut buf = vec![0u8; PAGE];
        PageHeader::init(&mut buf, PageId::new(1, 5), PageType::TreeLeaf);
        assert!(matches!(
            DataPage::validate(&buf, PageId::new(1, 5)),
            Err(BasaltError::PageCorrupted { .. })
        ));
    }

    #[test]
    fn test_space_categories() {
        let max = DataPage::max_record_size(PAGE);
        assert_eq!(space_to_category(0, PAGE), 0);
        assert_eq!(space_to_category(max, PAGE), 255);
        for free in [10, 100, 500, 900] {
            let category = space_to_category(free, PAGE);
            assert!(category_to_min_space(category, PAGE) <= free);
        }
    }
}
