//! Page addressing and the common page header.

use crate::error::{BasaltError, Result};
use serde::{Deserialize, Serialize};

/// Default page size in bytes (16 KB).
pub const DEFAULT_PAGE_SIZE: usize = 16 * 1024;

/// Smallest supported page size.
pub const MIN_PAGE_SIZE: usize = 1024;

/// Largest supported page size. Slot offsets are stored as u16.
pub const MAX_PAGE_SIZE: usize = 32 * 1024;

/// On-disk page layout version. Bumped on any layout change and checked
/// when a partition is recovered.
pub const PAGE_FORMAT_VERSION: u8 = 1;

/// Index of the partition header page. No other structure may live there,
/// which lets a zero page index double as the null link.
pub const HEADER_PAGE_IDX: u32 = 0;

/// Checks that a page size is a supported power of two.
pub fn validate_page_size(page_size: usize) -> Result<()> {
    if !page_size.is_power_of_two() || !(MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&page_size) {
        return Err(BasaltError::InvalidParameter {
            name: "page_size".to_string(),
            value: page_size.to_string(),
        });
    }
    Ok(())
}

/// Unique identifier for a page.
///
/// A page is addressed by its partition and its index within that partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PageId {
    /// Partition that owns the page.
    pub partition: u32,
    /// Page index within the partition (0 = partition header).
    pub page_idx: u32,
}

impl PageId {
    /// Creates a new PageId.
    pub fn new(partition: u32, page_idx: u32) -> Self {
        Self {
            partition,
            page_idx,
        }
    }

    /// Returns the header page of a partition.
    pub fn header(partition: u32) -> Self {
        Self::new(partition, HEADER_PAGE_IDX)
    }

    /// Returns the PageId as a single u64 for compact storage.
    pub fn as_u64(&self) -> u64 {
        ((self.partition as u64) << 32) | (self.page_idx as u64)
    }

    /// Creates a PageId from a u64 representation.
    pub fn from_u64(value: u64) -> Self {
        Self {
            partition: (value >> 32) as u32,
            page_idx: value as u32,
        }
    }
}

impl std::fmt::Display for PageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.partition, self.page_idx)
    }
}

/// Page types stored in the header of every page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum PageType {
    /// Page sitting on a partition reuse list.
    Free = 0,
    /// Partition header (always page 0).
    PartitionMeta = 1,
    /// Root pointer and height of one B+ tree.
    TreeMeta = 2,
    /// B+ tree inner node.
    TreeInner = 3,
    /// B+ tree leaf node.
    TreeLeaf = 4,
    /// Row version fragments.
    Data = 5,
    /// Partition storage state (tree roots, applied index).
    StorageMeta = 6,
}

impl PageType {
    /// Decodes a page type tag.
    pub fn from_u8(tag: u8) -> Option<Self> {
        Some(match tag {
            0 => PageType::Free,
            1 => PageType::PartitionMeta,
            2 => PageType::TreeMeta,
            3 => PageType::TreeInner,
            4 => PageType::TreeLeaf,
            5 => PageType::Data,
            6 => PageType::StorageMeta,
            _ => return None,
        })
    }
}

/// Header structure at the beginning of every page.
///
/// Layout (32 bytes total):
/// - partition: 4 bytes
/// - page_idx: 4 bytes
/// - page_type: 1 byte
/// - format_version: 1 byte
/// - item_count: 2 bytes
/// - checksum: 4 bytes (CRC32 of the page with this field zeroed)
/// - reserved: 16 bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageHeader {
    /// Unique page identifier.
    pub page_id: PageId,
    /// Type of this page.
    pub page_type: PageType,
    /// Layout version the page was written with.
    pub format_version: u8,
    /// Number of items on this page (meaning depends on the page type).
    pub item_count: u16,
    /// Checksum stamped when the page is written out.
    pub checksum: u32,
}

impl PageHeader {
    /// Size of the page header in bytes.
    pub const SIZE: usize = 32;

    /// Offset of the page type tag.
    pub const TYPE_OFFSET: usize = 8;

    /// Offset of the format version byte.
    pub const VERSION_OFFSET: usize = 9;

    /// Offset of the item count.
    pub const ITEM_COUNT_OFFSET: usize = 10;

    /// Offset of the checksum field.
    pub const CHECKSUM_OFFSET: usize = 12;

    /// Creates a new page header at the current format version.
    pub fn new(page_id: PageId, page_type: PageType) -> Self {
        Self {
            page_id,
            page_type,
            format_version: PAGE_FORMAT_VERSION,
            item_count: 0,
            checksum: 0,
        }
    }

    /// Serializes the header to bytes.
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0..4].copy_from_slice(&self.page_id.partition.to_le_bytes());
        buf[4..8].copy_from_slice(&self.page_id.page_idx.to_le_bytes());
        buf[8] = self.page_type as u8;
        buf[9] = self.format_version;
        buf[10..12].copy_from_slice(&self.item_count.to_le_bytes());
        buf[12..16].copy_from_slice(&self.checksum.to_le_bytes());
        // bytes 16-31 are reserved (already zeroed)
        buf
    }

    /// Deserializes the header from bytes.
    ///
    /// Fails with `PageCorrupted` on an unknown page type tag.
    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        if buf.len() < Self::SIZE {
            return Err(BasaltError::PageCorrupted {
                page_id: 0,
                reason: format!("header truncated to {} bytes", buf.len()),
            });
        }
        let partition = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
        let page_idx = u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]);
        let page_id = PageId::new(partition, page_idx);
        let page_type =
            PageType::from_u8(buf[8]).ok_or_else(|| BasaltError::PageCorrupted {
                page_id: page_id.as_u64(),
                reason: format!("unknown page type {}", buf[8]),
            })?;

        Ok(Self {
            page_id,
            page_type,
            format_version: buf[9],
            item_count: u16::from_le_bytes([buf[10], buf[11]]),
            checksum: u32::from_le_bytes([buf[12], buf[13], buf[14], buf[15]]),
        })
    }

    /// Writes a fresh header of the given type into a page buffer.
    pub fn init(buf: &mut [u8], page_id: PageId, page_type: PageType) {
        buf[..Self::SIZE].copy_from_slice(&Self::new(page_id, page_type).to_bytes());
    }

    /// Reads the raw page type tag from a page buffer.
    #[inline]
    pub fn type_tag(buf: &[u8]) -> u8 {
        buf[Self::TYPE_OFFSET]
    }

    /// Reads the item count from a page buffer.
    #[inline]
    pub fn item_count_of(buf: &[u8]) -> u16 {
        u16::from_le_bytes([buf[Self::ITEM_COUNT_OFFSET], buf[Self::ITEM_COUNT_OFFSET + 1]])
    }

    /// Writes the item count into a page buffer.
    #[inline]
    pub fn set_item_count(buf: &mut [u8], count: u16) {
        buf[Self::ITEM_COUNT_OFFSET..Self::ITEM_COUNT_OFFSET + 2]
            .copy_from_slice(&count.to_le_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_page_size() {
        assert_eq!(DEFAULT_PAGE_SIZE, 16384);
        assert!(validate_page_size(DEFAULT_PAGE_SIZE).is_ok());
    }

    #[test]
    fn test_validate_page_size() {
        for size in [1024, 2048, 4096, 8192, 16384, 32768] {
            assert!(validate_page_size(size).is_ok(), "size {size}");
        }
        for size in [0, 512, 3000, 65536] {
            assert!(validate_page_size(size).is_err(), "size {size}");
        }
    }

    #[test]
    fn test_page_id_roundtrip_edge_cases() {
        for page_id in [
            PageId::new(0, 0),
            PageId::new(u32::MAX, u32::MAX),
            PageId::new(0, u32::MAX),
            PageId::new(u32::MAX, 0),
            PageId::new(42, 1000),
        ] {
            assert_eq!(page_id, PageId::from_u64(page_id.as_u64()));
        }
    }

    #[test]
    fn test_page_id_bit_layout() {
        let page_id = PageId::new(1, 2);
        assert_eq!(page_id.as_u64(), (1u64 << 32) | 2);
        assert_eq!(PageId::header(9), PageId::new(9, 0));
    }

    #[test]
    fn test_page_id_display() {
        assert_eq!(PageId::new(5, 123).to_string(), "5:123");
    }

    #[test]
    fn test_page_type_tags() {
        for page_type in [
            PageType::Free,
            PageType::PartitionMeta,
            PageType::TreeMeta,
            PageType::TreeInner,
            PageType::TreeLeaf,
            PageType::Data,
            PageType::StorageMeta,
        ] {
            assert_eq!(PageType::from_u8(page_type as u8), Some(page_type));
        }
        assert_eq!(PageType::from_u8(200), None);
    }

    #[test]
    fn test_page_header_roundtrip() {
        let mut header = PageHeader::new(PageId::new(3, 999), PageType::TreeLeaf);
        header.item_count = 50;
        header.checksum = 0xDEADBEEF;

        let bytes = header.to_bytes();
        assert_eq!(bytes.len(), PageHeader::SIZE);
        assert_eq!(PageHeader::from_bytes(&bytes).unwrap(), header);
        assert_eq!(PageHeader::type_tag(&bytes), PageType::TreeLeaf as u8);
        assert_eq!(PageHeader::item_count_of(&bytes), 50);
    }

    #[test]
    fn test_page_header_rejects_unknown_type() {
        let mut bytes = PageHeader::new(PageId::new(1, 1), PageType::Data).to_bytes();
        bytes[PageHeader::TYPE_OFFSET] = 77;
        let err = PageHeader::from_bytes(&bytes).unwrap_err();
        assert!(matches!(err, BasaltError::PageCorrupted { .. }));
    }

    #[test]
    fn test_page_header_init_sets_version() {
        let mut page = vec![0u8; MIN_PAGE_SIZE];
        PageHeader::init(&mut page, PageId::new(2, 7), PageType::Data);
        let header = PageHeader::from_bytes(&page).unwrap();
        assert_eq!(header.format_version, PAGE_FORMAT_VERSION);
        assert_eq!(header.page_id, PageId::new(2, 7));

        PageHeader::set_item_count(&mut page, 12);
        assert_eq!(PageHeader::item_count_of(&page), 12);
    }

    #[test]
    fn test_page_id_serde_roundtrip() {
        let original = PageId::new(10, 500);
        let serialized = serde_json::to_string(&original).unwrap();
        let deserialized: PageId = serde_json::from_str(&serialized).unwrap();
        assert_eq!(original, deserialized);
    }
}
