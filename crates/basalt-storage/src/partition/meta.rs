//! Partition storage meta page.
//!
//! Registered as the root of the partition header, it locates the trees of
//! the partition and records how far the replication log has been applied.
//!
//! Layout after the page header:
//! ```text
//! +------------------------+ 32
//! | primary tree meta  u32 |
//! | index meta tree    u32 |
//! | schema meta tree   u32 |
//! | last applied index u64 |
//! | last applied ts    u64 |
//! | flags               u8 |
//! +------------------------+ 61
//! ```

use basalt_common::page::{PageHeader, PageId, PageType, PAGE_FORMAT_VERSION};
use basalt_common::{BasaltError, HybridTimestamp, Result};

/// Decoded storage meta page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StorageMeta {
    pub primary_meta: u32,
    pub index_meta: u32,
    pub schema_meta: u32,
    pub last_applied_index: u64,
    pub last_applied_ts: HybridTimestamp,
    /// Set while index maintenance of a command is in progress.
    pub index_rebuild_pending: bool,
}

impl StorageMeta {
    const OFFSET: usize = PageHeader::SIZE;
    pub const SIZE: usize = 29;

    const FLAG_REBUILD_PENDING: u8 = 0x01;

    pub fn new(primary_meta: u32, index_meta: u32, schema_meta: u32) -> Self {
        Self {
            primary_meta,
            index_meta,
            schema_meta,
            last_applied_index: 0,
            last_applied_ts: HybridTimestamp::MIN,
            index_rebuild_pending: false,
        }
    }

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0..4].copy_from_slice(&self.primary_meta.to_le_bytes());
        buf[4..8].copy_from_slice(&self.index_meta.to_le_bytes());
        buf[8..12].copy_from_slice(&self.schema_meta.to_le_bytes());
        buf[12..20].copy_from_slice(&self.last_applied_index.to_le_bytes());
        buf[20..28].copy_from_slice(&self.last_applied_ts.to_bytes());
        buf[28] = if self.index_rebuild_pending {
            Self::FLAG_REBUILD_PENDING
        } else {
            0
        };
        buf
    }

    pub fn from_bytes(buf: &[u8]) -> Self {
        Self {
            primary_meta: u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]),
            index_meta: u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]),
            schema_meta: u32::from_le_bytes([buf[8], buf[9], buf[10], buf[11]]),
            last_applied_index: u64::from_le_bytes([
                buf[12], buf[13], buf[14], buf[15], buf[16], buf[17], buf[18], buf[19],
            ]),
            last_applied_ts: HybridTimestamp::from_bytes(&buf[20..28]),
            index_rebuild_pending: buf[28] & Self::FLAG_REBUILD_PENDING != 0,
        }
    }

    /// Formats a storage meta page.
    pub fn init(&self, buf: &mut [u8], page_id: PageId) {
        PageHeader::init(buf, page_id, PageType::StorageMeta);
        self.write_to(buf);
    }

    pub fn write_to(&self, buf: &mut [u8]) {
        buf[Self::OFFSET..Self::OFFSET + Self::SIZE].copy_from_slice(&self.to_bytes());
    }

    /// Reads and checks a storage meta page.
    pub fn read_from(buf: &[u8], page_id: PageId) -> Result<Self> {
        let header = PageHeader::from_bytes(buf)?;
        if header.page_type != PageType::StorageMeta || header.format_version != PAGE_FORMAT_VERSION {
            return Err(BasaltError::PageCorrupted {
                page_id: page_id.as_u64(),
                reason: format!(
                    "expected a storage meta page, found {:?} version {}",
                    header.page_type, header.format_version
                ),
            });
        }
        let meta = Self::from_bytes(&buf[Self::OFFSET..Self::OFFSET + Self::SIZE]);
        if meta.primary_meta == 0 || meta.index_meta == 0 || meta.schema_meta == 0 {
            return Err(BasaltError::PageCorrupted {
                page_id: page_id.as_u64(),
                reason: "storage meta page without tree roots".to_string(),
            });
        }
        Ok(meta)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_meta_page() {
        let id = PageId::new(4, 1);
        let mut buf = vec![0u8; 1024];
        let mut meta = StorageMeta::new(2, 5, 9);
        meta.init(&mut buf, id);
        assert_eq!(StorageMeta::read_from(&buf, id).unwrap(), meta);

        meta.last_applied_index = 17;
        meta.last_applied_ts = HybridTimestamp::new(1000, 3);
        meta.index_rebuild_pending = true;
        meta.write_to(&mut buf);
        assert_eq!(StorageMeta::read_from(&buf, id).unwrap(), meta);
    }

    #[test]
    fn test_rejects_missing_tree_roots() {
        let id = PageId::new(4, 1);
        let mut buf = vec![0u8; 1024];
        StorageMeta::new(2, 5, 0).init(&mut buf, id);
        assert!(matches!(
            StorageMeta::read_from(&buf, id),
            Err(BasaltError::PageCorrupted { .. })
        ));
    }

    #[test]
    fn test_rejects_other_pages() {
        let id = PageId::new(4, 1);
        let mut buf = vec![0u8; 1024];
        PageHeader::init(&mut buf, id, PageType::Data);
        assert!(matches!(
            StorageMeta::read_from(&buf, id),
            Err(BasaltError::PageCorrupted { .. })
        ));
    }
}
