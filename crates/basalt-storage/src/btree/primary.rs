//! Primary tree: row key to version chain head.

use super::spec::{kinds, TreeSpec};
use crate::mvcc::Link;
use basalt_common::{BasaltError, Result};
use bytes::Bytes;

/// Leaf entry of the primary tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrimaryEntry {
    /// Encoded row key.
    pub key: Bytes,
    /// Newest version of the row.
    pub head: Link,
}

impl PrimaryEntry {
    pub fn new(key: impl Into<Bytes>, head: Link) -> Self {
        Self {
            key: key.into(),
            head,
        }
    }
}

/// Unique row keys, each mapped to the head of its version chain.
pub struct PrimaryTree;

impl TreeSpec for PrimaryTree {
    type Row = PrimaryEntry;
    const KIND: u8 = kinds::PRIMARY;
    const NAME: &'static str = "primary";

    fn encode(row: &PrimaryEntry) -> (Vec<u8>, Vec<u8>) {
        (row.key.to_vec(), row.head.to_bytes().to_vec())
    }

    fn decode(key: &[u8], payload: &[u8]) -> Result<PrimaryEntry> {
        if payload.len() != Link::SIZE {
            return Err(BasaltError::Internal(format!(
                "primary entry payload of {} bytes",
                payload.len()
            )));
        }
        Ok(PrimaryEntry {
            key: Bytes::copy_from_slice(key),
            head: Link::from_bytes(payload),
        })
    }
}
