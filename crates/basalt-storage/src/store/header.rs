//! Partition header page.
//!
//! Page 0 of every partition describes the partition file itself.
//!
//! Layout (after the 32 byte page header):
//! ```text
//! +---------------------+
//! | magic (4)           |
//! | format version (4)  |
//! | page size (4)       |
//! | next page idx (4)   |  <- first never-allocated page index
//! | free head (4)       |  <- top of the reuse list, 0 = empty
//! | root (4)            |  <- storage meta page of the partition, 0 = none
//! +---------------------+
//! ```

use basalt_common::page::{PageHeader, PageId, PageType, PAGE_FORMAT_VERSION};
use basalt_common::{BasaltError, Result};

/// Magic number identifying a partition file ("BSLT").
pub const PARTITION_MAGIC: u32 = 0x4253_4C54;

/// Decoded contents of a partition header page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionHeader {
    /// Page size the partition was created with.
    pub page_size: u32,
    /// First page index that was never handed out.
    pub next_page_idx: u32,
    /// Most recently freed page, 0 when the reuse list is empty.
    pub free_head: u32,
    /// Page index registered by the layer above, 0 when unset.
    pub root: u32,
}

impl PartitionHeader {
    const MAGIC_OFFSET: usize = PageHeader::SIZE;
    const VERSION_OFFSET: usize = PageHeader::SIZE + 4;
    const PAGE_SIZE_OFFSET: usize = PageHeader::SIZE + 8;
    const NEXT_PAGE_OFFSET: usize = PageHeader::SIZE + 12;
    const FREE_HEAD_OFFSET: usize = PageHeader::SIZE + 16;
    const ROOT_OFFSET: usize = PageHeader::SIZE + 20;

    /// Bytes of page 0 covered by the header, page header included.
    pub const ENCODED_LEN: usize = PageHeader::SIZE + 24;

    /// Header of a freshly created partition. Only page 0 is in use.
    pub fn new(page_size: usize) -> Self {
        Self {
            page_size: page_size as u32,
            next_page_idx: 1,
            free_head: 0,
            root: 0,
        }
    }

    /// Writes the header into page 0 of `partition`.
    pub fn write_to(&self, buf: &mut [u8], partition: u32) {
        PageHeader::init(buf, PageId::header(partition), PageType::PartitionMeta);
        put_u32(buf, Self::MAGIC_OFFSET, PARTITION_MAGIC);
        put_u32(buf, Self::VERSION_OFFSET, PAGE_FORMAT_VERSION as u32);
        put_u32(buf, Self::PAGE_SIZE_OFFSET, self.page_size);
        put_u32(buf, Self::NEXT_PAGE_OFFSET, self.next_page_idx);
        put_u32(buf, Self::FREE_HEAD_OFFSET, self.free_head);
        put_u32(buf, Self::ROOT_OFFSET, self.root);
    }

    /// Reads and validates a header page.
    ///
    /// Fails with `UnsupportedFormat` on a foreign magic or a different
    /// format version, and with `PageSizeMismatch` when the partition was
    /// written with another page size.
    pub fn read_from(buf: &[u8], expected_page_size: usize) -> Result<Self> {
        let magic = get_u32(buf, Self::MAGIC_OFFSET);
        let version = get_u32(buf, Self::VERSION_OFFSET);
        if magic != PARTITION_MAGIC || version != PAGE_FORMAT_VERSION as u32 {
            return Err(BasaltError::UnsupportedFormat {
                found: version,
                supported: PAGE_FORMAT_VERSION as u32,
            });
        }
        if PageHeader::type_tag(buf) != PageType::PartitionMeta as u8 {
            return Err(BasaltError::PageCorrupted {
                page_id: 0,
                reason: format!("page 0 has type tag {}", PageHeader::type_tag(buf)),
            });
        }

        let page_size = get_u32(buf, Self::PAGE_SIZE_OFFSET);
        if page_size as usize != expected_page_size {
            return Err(BasaltError::PageSizeMismatch {
                expected: expected_page_size,
                actual: page_size as usize,
            });
        }

        Ok(Self {
            page_size,
            next_page_idx: get_u32(buf, Self::NEXT_PAGE_OFFSET),
            free_head: get_u32(buf, Self::FREE_HEAD_OFFSET),
            root: get_u32(buf, Self::ROOT_OFFSET),
        })
    }

    /// Updates the allocation fields in place.
    pub fn set_space(buf: &mut [u8], next_page_idx: u32, free_head: u32) {
        put_u32(buf, Self::NEXT_PAGE_OFFSET, next_page_idx);
        put_u32(buf, Self::FREE_HEAD_OFFSET, free_head);
    }

    /// Updates the root slot in place.
    pub fn set_root(buf: &mut [u8], root: u32) {
        put_u32(buf, Self::ROOT_OFFSET, root);
    }

    /// Reads the root slot.
    pub fn root_of(buf: &[u8]) -> u32 {
        get_u32(buf, Self::ROOT_OFFSET)
    }
}

/// Offset of the reuse-list link inside a `Free` page.
pub(crate) const NEXT_FREE_OFFSET: usize = PageHeader::SIZE;

/// Formats a page as a reuse-list entry pointing at `next_free`.
pub(crate) fn write_free_page(buf: &mut [u8], page_id: PageId, next_free: u32) {
    buf.fill(0);
    PageHeader::init(buf, page_id, PageType::Free);
    put_u32(buf, NEXT_FREE_OFFSET, next_free);
}

/// Reads the reuse-list link of a `Free` page.
pub(crate) fn next_free_of(buf: &[u8], page_id: PageId) -> Result<u32> {
    if PageHeader::type_tag(buf) != PageType::Free as u8 {
        return Err(BasaltError::PageCorrupted {
            page_id: page_id.as_u64(),
            reason: "reuse list points at a page that is not free".to_string(),
        });
    }
    Ok(get_u32(buf, NEXT_FREE_OFFSET))
}

#[inline]
fn put_u32(buf: &mut [u8], offset: usize, value: u32) {
    buf[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

#[inline]
fn get_u32(buf: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([buf[offset], buf[offset + 1], buf[offset + 2], buf[offset + 3]])
}
