//! Secondary index trees.
//!
//! Both index kinds append the primary row key to the indexed tuple, so
//! entries of a non-unique index never collide and entries sharing a tuple
//! sort by row key. The payload carries the tuple length to split the key
//! back apart.

use super::spec::{kinds, TreeSpec};
use basalt_common::{BasaltError, Result};
use bytes::Bytes;

/// Hash of an encoded index tuple. Stable across processes and versions, as
/// it is part of the stored key order.
pub fn hash_tuple(tuple: &[u8]) -> u32 {
    crc32fast::hash(tuple)
}

fn tuple_len(payload: &[u8]) -> Result<usize> {
    match payload {
        [lo, hi] => Ok(u16::from_le_bytes([*lo, *hi]) as usize),
        _ => Err(BasaltError::Internal(format!(
            "index entry payload of {} bytes",
            payload.len()
        ))),
    }
}

fn malformed(key: &[u8]) -> BasaltError {
    BasaltError::Internal(format!("index entry key of {} bytes is malformed", key.len()))
}

/// Entry of a hash index: `(hash, tuple, row key)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HashIndexEntry {
    pub hash: u32,
    /// Encoded indexed columns.
    pub tuple: Bytes,
    /// Encoded primary row key.
    pub row_key: Bytes,
}

impl HashIndexEntry {
    pub fn new(tuple: impl Into<Bytes>, row_key: impl Into<Bytes>) -> Self {
        let tuple = tuple.into();
        Self {
            hash: hash_tuple(&tuple),
            tuple,
            row_key: row_key.into(),
        }
    }

    /// Key prefix shared by every entry of one indexed tuple.
    pub fn lookup_prefix(tuple: &[u8]) -> Vec<u8> {
        let mut prefix = Vec::with_capacity(4 + tuple.len());
        prefix.extend_from_slice(&hash_tuple(tuple).to_be_bytes());
        prefix.extend_from_slice(tuple);
        prefix
    }
}

/// Hash index: point lookups by indexed tuple. Buckets are ordered by hash,
/// so key order across different tuples is meaningless.
pub struct HashIndexTree;

impl TreeSpec for HashIndexTree {
    type Row = HashIndexEntry;
    const KIND: u8 = kinds::HASH_INDEX;
    const NAME: &'static str = "hash-index";

    fn encode(row: &HashIndexEntry) -> (Vec<u8>, Vec<u8>) {
        let mut key = Vec::with_capacity(4 + row.tuple.len() + row.row_key.len());
        key.extend_from_slice(&row.hash.to_be_bytes());
        key.extend_from_slice(&row.tuple);
        key.extend_from_slice(&row.row_key);
        (key, (row.tuple.len() as u16).to_le_bytes().to_vec())
    }

    fn decode(key: &[u8], payload: &[u8]) -> Result<HashIndexEntry> {
        let len = tuple_len(payload)?;
        if key.len() < 4 + len {
            return Err(malformed(key));
        }
        Ok(HashIndexEntry {
            hash: u32::from_be_bytes([key[0], key[1], key[2], key[3]]),
            tuple: Bytes::copy_from_slice(&key[4..4 + len]),
            row_key: Bytes::copy_from_slice(&key[4 + len..]),
        })
    }
}

/// Entry of a sorted index: `(collated tuple, row key)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortedIndexEntry {
    /// Indexed columns encoded with the index collations.
    pub tuple: Bytes,
    /// Encoded primary row key.
    pub row_key: Bytes,
}

impl SortedIndexEntry {
    pub fn new(tuple: impl Into<Bytes>, row_key: impl Into<Bytes>) -> Self {
        Self {
            tuple: tuple.into(),
            row_key: row_key.into(),
        }
    }
}

/// Sorted index: range and prefix scans in collation order.
pub struct SortedIndexTree;

impl TreeSpec for SortedIndexTree {
    type Row = SortedIndexEntry;
    const KIND: u8 = kinds::SORTED_INDEX;
    const NAME: &'static str = "sorted-index";

    fn encode(row: &SortedIndexEntry) -> (Vec<u8>, Vec<u8>) {
        let mut key = Vec::with_capacity(row.tuple.len() + row.row_key.len());
        key.extend_from_slice(&row.tuple);
        key.extend_from_slice(&row.row_key);
        (key, (row.tuple.len() as u16).to_le_bytes().to_vec())
    }

    fn decode(key: &[u8], payload: &[u8]) -> Result<SortedIndexEntry> {
        let len = tuple_len(payload)?;
        if key.len() < len {
            return Err(malformed(key));
        }
        Ok(SortedIndexEntry {
            tuple: Bytes::copy_from_slice(&key[..len]),
            row_key: Bytes::copy_from_slice(&key[len..]),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::btree::BplusTree;
    use crate::store::PageStore;
    use std::ops::Bound;
    use std::sync::Arc;

    fn store() -> Arc<PageStore> {
        let store = Arc::new(PageStore::in_memory(1024, 256).unwrap());
        store.open_partition(2).unwrap();
        store
    }

    #[test]
    fn test_hash_entry_layout() {
        let entry = HashIndexEntry::new(&b"\x01abc\x00\x00"[..], &b"\x01k"[..]);
        let (key, payload) = HashIndexTree::encode(&entry);
        assert!(key.starts_with(&HashIndexEntry::lookup_prefix(&entry.tuple)));
        assert_eq!(HashIndexTree::decode(&key, &payload).unwrap(), entry);
        assert!(HashIndexTree::decode(&key[..3], &payload).is_err());
    }

    #[test]
    fn test_hash_lookup_groups_duplicates() {
        let tree = BplusTree::<HashIndexTree>::create(store(), 2).unwrap();
        for (tuple, row_key) in [("red", "k3"), ("blue", "k1"), ("red", "k1"), ("green", "k2")] {
            tree.insert(&HashIndexEntry::new(tuple.as_bytes().to_vec(), row_key.as_bytes().to_vec()))
                .unwrap();
        }

        let red: Vec<_> = tree
            .prefix(&HashIndexEntry::lookup_prefix(b"red"))
            .map(|e| e.unwrap().row_key)
            .collect();
        assert_eq!(red, vec![Bytes::from_static(b"k1"), Bytes::from_static(b"k3")]);
        assert_eq!(tree.prefix(&HashIndexEntry::lookup_prefix(b"pink")).count(), 0);
    }

    #[test]
    fn test_sorted_range_with_duplicates() {
        let tree = BplusTree::<SortedIndexTree>::create(store(), 2).unwrap();
        for (tuple, row_key) in [(3u8, 1u8), (1, 9), (3, 0), (2, 5), (5, 5)] {
            tree.insert(&SortedIndexEntry::new(vec![tuple], vec![row_key])).unwrap();
        }
        let scan: Vec<_> = tree
            .range(Bound::Included(&[2u8][..]), Bound::Excluded(&[4u8][..]))
            .map(|e| {
                let e = e.unwrap();
                (e.tuple[0], e.row_key[0])
            })
            .collect();
        assert_eq!(scan, vec![(2, 5), (3, 0), (3, 1)]);
    }
}
