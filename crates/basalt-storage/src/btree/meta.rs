//! Registry trees of a partition: index id to index tree, and schema
//! version to schema descriptor.

use super::node::{max_item_size, ITEM_OVERHEAD};
use super::spec::{kinds, TreeSpec};
use basalt_common::{BasaltError, Result};
use bytes::Bytes;

/// Registry entry of one secondary index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexMetaEntry {
    pub index_id: u32,
    /// Meta page index of the index tree.
    pub meta_page: u32,
    /// Encoded index descriptor.
    pub descriptor: Bytes,
}

/// Maps index ids to the meta pages of their trees.
pub struct IndexMetaTree;

impl IndexMetaTree {
    /// Search key of an index id.
    pub fn key(index_id: u32) -> [u8; 4] {
        index_id.to_be_bytes()
    }
}

impl TreeSpec for IndexMetaTree {
    type Row = IndexMetaEntry;
    const KIND: u8 = kinds::INDEX_META;
    const NAME: &'static str = "index-meta";

    fn encode(row: &IndexMetaEntry) -> (Vec<u8>, Vec<u8>) {
        let mut payload = Vec::with_capacity(4 + row.descriptor.len());
        payload.extend_from_slice(&row.meta_page.to_le_bytes());
        payload.extend_from_slice(&row.descriptor);
        (Self::key(row.index_id).to_vec(), payload)
    }

    fn decode(key: &[u8], payload: &[u8]) -> Result<IndexMetaEntry> {
        match (key, payload) {
            ([a, b, c, d], [p0, p1, p2, p3, descriptor @ ..]) => Ok(IndexMetaEntry {
                index_id: u32::from_be_bytes([*a, *b, *c, *d]),
                meta_page: u32::from_le_bytes([*p0, *p1, *p2, *p3]),
                descriptor: Bytes::copy_from_slice(descriptor),
            }),
            _ => Err(BasaltError::Internal(format!(
                "index meta entry of {}+{} bytes",
                key.len(),
                payload.len()
            ))),
        }
    }
}

/// One chunk of a stored schema descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaMetaEntry {
    pub version: u16,
    /// Position of the chunk within the descriptor.
    pub chunk: u16,
    pub bytes: Bytes,
}

/// Maps schema versions to their descriptors.
///
/// A descriptor larger than one item is split into consecutive chunks keyed
/// by `(version, chunk)`, so the chunks of a version are adjacent in key
/// order.
pub struct SchemaMetaTree;

impl SchemaMetaTree {
    pub const KEY_SIZE: usize = 4;

    pub fn key(version: u16, chunk: u16) -> [u8; 4] {
        let [v0, v1] = version.to_be_bytes();
        let [c0, c1] = chunk.to_be_bytes();
        [v0, v1, c0, c1]
    }

    /// Largest chunk that fits one item at a page size.
    pub fn chunk_size(page_size: usize) -> usize {
        max_item_size(page_size) - ITEM_OVERHEAD - Self::KEY_SIZE
    }
}

impl TreeSpec for SchemaMetaTree {
    type Row = SchemaMetaEntry;
    const KIND: u8 = kinds::SCHEMA_META;
    const NAME: &'static str = "schema-meta";

    fn encode(row: &SchemaMetaEntry) -> (Vec<u8>, Vec<u8>) {
        (Self::key(row.version, row.chunk).to_vec(), row.bytes.to_vec())
    }

    fn decode(key: &[u8], payload: &[u8]) -> Result<SchemaMetaEntry> {
        match key {
            [v0, v1, c0, c1] => Ok(SchemaMetaEntry {
                version: u16::from_be_bytes([*v0, *v1]),
                chunk: u16::from_be_bytes([*c0, *c1]),
                bytes: Bytes::copy_from_slice(payload),
            }),
            _ => Err(BasaltError::Internal(format!(
                "schema meta key of {} bytes",
                key.len()
            ))),
        }
    }
}
