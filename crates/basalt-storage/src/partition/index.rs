//! Secondary indexes of a partition.
//!
//! An index is described by an [`IndexDescriptor`] from the catalog and
//! stored in its own tree. Index trees hold one entry per live row: the
//! indexed tuple of the row's newest version plus its row key.

use crate::btree::{
    prefix_end, BplusTree, HashIndexEntry, HashIndexTree, SortedIndexEntry,
    SortedIndexTree, TreeSpec,
};
use crate::store::PageStore;
use crate::tuple::{encode, BinaryRow, BinaryTupleSchema, Collation, SchemaDescriptor, TupleReader, Value};
use basalt_common::page::PageId;
use basalt_common::{BasaltError, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::ops::Bound;
use std::sync::Arc;

/// Kind of a secondary index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum IndexKind {
    /// Point lookups only.
    Hash,
    /// Ordered, with one collation per indexed column.
    Sorted(Vec<Collation>),
}

/// Catalog description of a secondary index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexDescriptor {
    pub id: u32,
    pub name: String,
    pub kind: IndexKind,
    /// Indexed column names, in index order.
    pub columns: Vec<String>,
    /// Rejects two live rows with equal non-null indexed values.
    pub unique: bool,
}

impl IndexDescriptor {
    const KIND_HASH: u8 = 1;
    const KIND_SORTED: u8 = 2;

    const COLLATION_DESCENDING: u8 = 0x01;
    const COLLATION_NULLS_FIRST: u8 = 0x02;

    /// Creates a non-unique hash index descriptor.
    pub fn hash<S: Into<String>>(id: u32, name: impl Into<String>, columns: impl IntoIterator<Item = S>) -> Self {
        Self {
            id,
            name: name.into(),
            kind: IndexKind::Hash,
            columns: columns.into_iter().map(Into::into).collect(),
            unique: false,
        }
    }

    /// Creates a non-unique sorted index descriptor.
    pub fn sorted<S: Into<String>>(
        id: u32,
        name: impl Into<String>,
        columns: impl IntoIterator<Item = (S, Collation)>,
    ) -> Self {
        let (columns, collations): (Vec<String>, Vec<Collation>) =
            columns.into_iter().map(|(c, collation)| (c.into(), collation)).unzip();
        Self {
            id,
            name: name.into(),
            kind: IndexKind::Sorted(collations),
            columns,
            unique: false,
        }
    }

    /// Returns the descriptor with the unique flag set.
    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    /// Schema of the indexed tuple under a schema version.
    pub fn projection(&self, schema: &SchemaDescriptor) -> Result<BinaryTupleSchema> {
        let projection = schema.projection_by_name(&self.columns)?;
        match &self.kind {
            IndexKind::Hash => Ok(projection),
            IndexKind::Sorted(collations) => projection.with_collations(collations),
        }
    }

    /// Serializes the descriptor for the index meta tree.
    ///
    /// Layout: kind u8, unique u8, name, column count u16, then per column
    /// its name and, for sorted indexes, a collation byte. Names are a u16
    /// length followed by UTF-8 bytes. The id is the meta tree key.
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::new();
        match &self.kind {
            IndexKind::Hash => buf.put_u8(Self::KIND_HASH),
            IndexKind::Sorted(_) => buf.put_u8(Self::KIND_SORTED),
        }
        buf.put_u8(self.unique as u8);
        put_str(&mut buf, &self.name);
        buf.put_u16_le(self.columns.len() as u16);
        for (i, column) in self.columns.iter().enumerate() {
            put_str(&mut buf, column);
            if let IndexKind::Sorted(collations) = &self.kind {
                let collation = collations.get(i).copied().unwrap_or_default();
                let mut flags = 0;
                if collation.descending {
                    flags |= Self::COLLATION_DESCENDING;
                }
                if collation.nulls_first {
                    flags |= Self::COLLATION_NULLS_FIRST;
                }
                buf.put_u8(flags);
            }
        }
        buf.freeze()
    }

    /// Deserializes a descriptor stored under `id`.
    pub fn from_bytes(id: u32, mut data: &[u8]) -> Result<Self> {
        let malformed = |what: &str| BasaltError::Internal(format!("index descriptor {}: {}", id, what));

        if data.remaining() < 2 {
            return Err(malformed("truncated header"));
        }
        let kind = data.get_u8();
        let unique = data.get_u8() != 0;
        let name = get_str(&mut data).ok_or_else(|| malformed("bad name"))?;
        if data.remaining() < 2 {
            return Err(malformed("truncated column count"));
        }
        let count = data.get_u16_le() as usize;

        let mut columns = Vec::with_capacity(count);
        let mut collations = Vec::new();
        for _ in 0..count {
            columns.push(get_str(&mut data).ok_or_else(|| malformed("bad column name"))?);
            if kind == Self::KIND_SORTED {
                if !data.has_remaining() {
                    return Err(malformed("truncated collation"));
                }
                let flags = data.get_u8();
                collations.push(Collation {
                    descending: flags & Self::COLLATION_DESCENDING != 0,
                    nulls_first: flags & Self::COLLATION_NULLS_FIRST != 0,
                });
            }
        }
        let kind = match kind {
            Self::KIND_HASH => IndexKind::Hash,
            Self::KIND_SORTED => IndexKind::Sorted(collations),
            other => return Err(malformed(&format!("unknown kind {}", other))),
        };
        Ok(Self {
            id,
            name,
            kind,
            columns,
            unique,
        })
    }
}

fn put_str(buf: &mut BytesMut, s: &str) {
    buf.put_u16_le(s.len() as u16);
    buf.put_slice(s.as_bytes());
}

fn get_str(data: &mut &[u8]) -> Option<String> {
    if data.remaining() < 2 {
        return None;
    }
    let len = data.get_u16_le() as usize;
    if data.remaining() < len {
        return None;
    }
    let s = String::from_utf8(data[..len].to_vec()).ok()?;
    data.advance(len);
    Some(s)
}

/// Tree behind an index.
enum IndexTree {
    Hash(BplusTree<HashIndexTree>),
    Sorted(BplusTree<SortedIndexTree>),
}

/// Number of entries fetched per tree descent by index scans.
const SCAN_BATCH: usize = 64;

/// An open secondary index.
pub struct SecondaryIndex {
    descriptor: IndexDescriptor,
    tree: IndexTree,
}

impl SecondaryIndex {
    /// Creates an empty index tree.
    pub fn create(store: Arc<PageStore>, partition: u32, descriptor: IndexDescriptor) -> Result<Self> {
        let tree = match descriptor.kind {
            IndexKind::Hash => IndexTree::Hash(BplusTree::create(store, partition)?),
            IndexKind::Sorted(_) => IndexTree::Sorted(BplusTree::create(store, partition)?),
        };
        Ok(Self { descriptor, tree })
    }

    /// Opens an index tree by its meta page.
    pub fn open(store: Arc<PageStore>, meta: PageId, descriptor: IndexDescriptor) -> Result<Self> {
        let tree = match descriptor.kind {
            IndexKind::Hash => IndexTree::Hash(BplusTree::open(store, meta)?),
            IndexKind::Sorted(_) => IndexTree::Sorted(BplusTree::open(store, meta)?),
        };
        Ok(Self { descriptor, tree })
    }

    pub fn descriptor(&self) -> &IndexDescriptor {
        &self.descriptor
    }

    pub fn meta_page(&self) -> PageId {
        match &self.tree {
            IndexTree::Hash(tree) => tree.meta_page(),
            IndexTree::Sorted(tree) => tree.meta_page(),
        }
    }

    /// Indexed tuple of a row.
    pub fn tuple_of(&self, schema: &SchemaDescriptor, row: &BinaryRow) -> Result<Vec<u8>> {
        row.project(schema, &self.descriptor.projection(schema)?)
    }

    /// Returns true if any indexed value of the tuple is null.
    pub fn has_null(&self, schema: &SchemaDescriptor, tuple: &[u8]) -> Result<bool> {
        let projection = self.descriptor.projection(schema)?;
        let values = TupleReader::new(&projection, tuple).values()?;
        Ok(values.iter().any(Value::is_null))
    }

    /// Encodes search values, which may cover a leading subset of the
    /// indexed columns.
    pub fn encode_search(&self, schema: &SchemaDescriptor, values: &[Value]) -> Result<Vec<u8>> {
        let projection = self.descriptor.projection(schema)?;
        if values.len() > projection.element_count() {
            return Err(BasaltError::OutOfBounds {
                index: values.len(),
                count: projection.element_count(),
            });
        }
        let prefix = BinaryTupleSchema::new(projection.elements()[..values.len()].to_vec());
        encode(&prefix, values)
    }

    fn check<S: TreeSpec>(tree: &BplusTree<S>, row: &S::Row) -> Result<()> {
        tree.check_row(row)
    }

    /// Fails with `KeyTooLarge` if the entry can not be stored.
    pub fn check_entry(&self, tuple: &[u8], row_key: &[u8]) -> Result<()> {
        match &self.tree {
            IndexTree::Hash(tree) => Self::check(tree, &HashIndexEntry::new(tuple.to_vec(), row_key.to_vec())),
            IndexTree::Sorted(tree) => Self::check(tree, &SortedIndexEntry::new(tuple.to_vec(), row_key.to_vec())),
        }
    }

    pub fn insert(&self, tuple: &[u8], row_key: &[u8]) -> Result<()> {
        match &self.tree {
            IndexTree::Hash(tree) => tree
                .insert(&HashIndexEntry::new(tuple.to_vec(), row_key.to_vec()))
                .map(|_| ()),
            IndexTree::Sorted(tree) => tree
                .insert(&SortedIndexEntry::new(tuple.to_vec(), row_key.to_vec()))
                .map(|_| ()),
        }
    }

    /// Removes an entry. Returns false if it was not there.
    pub fn remove(&self, tuple: &[u8], row_key: &[u8]) -> Result<bool> {
        match &self.tree {
            IndexTree::Hash(tree) => {
                let (key, _) = HashIndexTree::encode(&HashIndexEntry::new(tuple.to_vec(), row_key.to_vec()));
                Ok(tree.remove(&key)?.is_some())
            }
            IndexTree::Sorted(tree) => {
                let (key, _) = SortedIndexTree::encode(&SortedIndexEntry::new(tuple.to_vec(), row_key.to_vec()));
                Ok(tree.remove(&key)?.is_some())
            }
        }
    }

    /// Row keys of all entries with exactly this tuple.
    pub fn row_keys_of(&self, tuple: &[u8]) -> Result<Vec<Bytes>> {
        match &self.tree {
            IndexTree::Hash(tree) => tree
                .prefix(&HashIndexEntry::lookup_prefix(tuple))
                .filter_map(|entry| match entry {
                    Ok(entry) if entry.tuple == tuple => Some(Ok(entry.row_key)),
                    Ok(_) => None,
                    Err(e) => Some(Err(e)),
                })
                .collect(),
            IndexTree::Sorted(tree) => tree
                .prefix(tuple)
                .filter_map(|entry| match entry {
                    Ok(entry) if entry.tuple == tuple => Some(Ok(entry.row_key)),
                    Ok(_) => None,
                    Err(e) => Some(Err(e)),
                })
                .collect(),
        }
    }

    /// Up to `SCAN_BATCH` entries with tree keys in the bounds, as
    /// `(tree key, tuple, row key)`.
    fn batch(&self, lower: Bound<&[u8]>, upper: Bound<&[u8]>) -> Result<Vec<(Vec<u8>, Bytes, Bytes)>> {
        match &self.tree {
            IndexTree::Hash(tree) => tree
                .range(lower, upper)
                .take(SCAN_BATCH)
                .map(|entry| {
                    let entry = entry?;
                    let (key, _) = HashIndexTree::encode(&entry);
                    Ok((key, entry.tuple, entry.row_key))
                })
                .collect(),
            IndexTree::Sorted(tree) => tree
                .range(lower, upper)
                .take(SCAN_BATCH)
                .map(|entry| {
                    let entry = entry?;
                    let (key, _) = SortedIndexTree::encode(&entry);
                    Ok((key, entry.tuple, entry.row_key))
                })
                .collect(),
        }
    }

    /// Removes every entry.
    pub fn clear(&self) -> Result<usize> {
        let mut removed = 0;
        loop {
            let batch = self.batch(Bound::Unbounded, Bound::Unbounded)?;
            if batch.is_empty() {
                return Ok(removed);
            }
            for (key, _, _) in batch {
                let gone = match &self.tree {
                    IndexTree::Hash(tree) => tree.remove(&key)?.is_some(),
                    IndexTree::Sorted(tree) => tree.remove(&key)?.is_some(),
                };
                removed += gone as usize;
            }
        }
    }

    /// Number of entries, by full scan.
    pub fn len(&self) -> Result<usize> {
        match &self.tree {
            IndexTree::Hash(tree) => tree.len(),
            IndexTree::Sorted(tree) => tree.len(),
        }
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Frees every page of the index tree.
    pub fn destroy(self) -> Result<()> {
        match self.tree {
            IndexTree::Hash(tree) => tree.destroy(),
            IndexTree::Sorted(tree) => tree.destroy(),
        }
    }

    /// Checks the tree structure.
    pub fn verify(&self) -> Result<usize> {
        match &self.tree {
            IndexTree::Hash(tree) => tree.verify(),
            IndexTree::Sorted(tree) => tree.verify(),
        }
    }
}

/// Bounds of an index scan over encoded tuple prefixes.
#[derive(Debug, Clone)]
pub struct ScanBounds {
    lower: Bound<Vec<u8>>,
    upper: Bound<Vec<u8>>,
}

impl ScanBounds {
    /// Bounds covering every entry whose tuple starts with `prefix`.
    pub fn prefix(prefix: Vec<u8>) -> Self {
        let upper = match prefix_end(&prefix) {
            Some(end) => Bound::Excluded(end),
            None => Bound::Unbounded,
        };
        Self {
            lower: Bound::Included(prefix),
            upper,
        }
    }

    /// Bounds from encoded tuple prefixes. An included bound takes every
    /// entry whose tuple starts with it.
    pub fn range(lower: Bound<Vec<u8>>, upper: Bound<Vec<u8>>) -> Self {
        let lower = match lower {
            Bound::Included(prefix) => Bound::Included(prefix),
            Bound::Excluded(prefix) => match prefix_end(&prefix) {
                Some(end) => Bound::Included(end),
                None => return Self::empty(),
            },
            Bound::Unbounded => Bound::Unbounded,
        };
        let upper = match upper {
            Bound::Included(prefix) => match prefix_end(&prefix) {
                Some(end) => Bound::Excluded(end),
                None => Bound::Unbounded,
            },
            Bound::Excluded(prefix) => Bound::Excluded(prefix),
            Bound::Unbounded => Bound::Unbounded,
        };
        Self { lower, upper }
    }

    fn empty() -> Self {
        Self {
            lower: Bound::Excluded(Vec::new()),
            upper: Bound::Excluded(Vec::new()),
        }
    }
}

/// Lazy walk over index entries in tree order, yielding
/// `(tuple, row key)`.
///
/// Entries are fetched in batches, each by a fresh descent from the last
/// key seen, so no latch or pin is held between calls.
pub struct IndexEntries {
    index: Arc<SecondaryIndex>,
    bounds: ScanBounds,
    /// Tree key of the last entry returned.
    last: Option<Vec<u8>>,
    buffer: std::collections::VecDeque<(Vec<u8>, Bytes, Bytes)>,
    done: bool,
}

impl IndexEntries {
    pub fn new(index: Arc<SecondaryIndex>, bounds: ScanBounds) -> Self {
        Self {
            index,
            bounds,
            last: None,
            buffer: Default::default(),
            done: false,
        }
    }

    /// Restarts from the lower bound.
    pub fn rewind(&mut self) {
        self.last = None;
        self.buffer.clear();
        self.done = false;
    }

    fn refill(&mut self) -> Result<()> {
        let lower = match &self.last {
            Some(last) => Bound::Excluded(last.as_slice()),
            None => self.bounds.lower.as_ref().map(Vec::as_slice),
        };
        let upper = self.bounds.upper.as_ref().map(Vec::as_slice);
        let batch = self.index.batch(lower, upper)?;
        if batch.len() < SCAN_BATCH {
            self.done = true;
        }
        self.buffer.extend(batch);
        Ok(())
    }
}

impl Iterator for IndexEntries {
    type Item = Result<(Bytes, Bytes)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buffer.is_empty() && !self.done {
            if let Err(e) = self.refill() {
                self.done = true;
                return Some(Err(e));
            }
        }
        let (key, tuple, row_key) = self.buffer.pop_front()?;
        self.last = Some(key);
        Some(Ok((tuple, row_key)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use basalt_common::types::ColumnType;
    use crate::tuple::ColumnDescriptor;

    fn schema() -> SchemaDescriptor {
        SchemaDescriptor::new(
            1,
            vec![
                ColumnDescriptor::new("id", ColumnType::Int64, false),
                ColumnDescriptor::new("city", ColumnType::String, true),
                ColumnDescriptor::new("age", ColumnType::Int32, true),
            ],
            1,
        )
        .unwrap()
    }

    fn store() -> Arc<PageStore> {
        let store = Arc::new(PageStore::in_memory(1024, 256).unwrap());
        store.open_partition(1).unwrap();
        store
    }

    #[test]
    fn test_descriptor_bytes() {
        let hash = IndexDescriptor::hash(3, "by_city", ["city"]).unique();
        assert_eq!(IndexDescriptor::from_bytes(3, &hash.to_bytes()).unwrap(), hash);

        let sorted = IndexDescriptor::sorted(4, "by_age", [("age", Collation::DESC), ("city", Collation::ASC)]);
        assert_eq!(IndexDescriptor::from_bytes(4, &sorted.to_bytes()).unwrap(), sorted);

        let bytes = sorted.to_bytes();
        assert!(IndexDescriptor::from_bytes(4, &bytes[..bytes.len() - 1]).is_err());
        assert!(IndexDescriptor::from_bytes(4, &[9, 0, 0, 0, 0, 0]).is_err());
    }

    #[test]
    fn test_projection_resolves_names() {
        let schema = schema();
        let index = IndexDescriptor::hash(1, "bad", ["zip"]);
        assert!(matches!(
            index.projection(&schema),
            Err(BasaltError::ColumnNotFound(name)) if name == "zip"
        ));
    }

    #[test]
    fn test_entries_in_batches() {
        let schema = schema();
        let index = Arc::new(
            SecondaryIndex::create(store(), 1, IndexDescriptor::sorted(1, "by_age", [("age", Collation::ASC)]))
                .unwrap(),
        );
        for id in 0..200i64 {
            let row = BinaryRow::encode(
                &schema,
                &[Value::Int64(id), Value::Null, Value::Int32((id % 10) as i32)],
            )
            .unwrap();
            let key = row.key_bytes(&schema).unwrap();
            index.insert(&index.tuple_of(&schema, &row).unwrap(), &key).unwrap();
        }
        assert_eq!(index.len().unwrap(), 200);

        let three = index.encode_search(&schema, &[Value::Int32(3)]).unwrap();
        let mut entries = IndexEntries::new(index.clone(), ScanBounds::prefix(three.clone()));
        assert_eq!(entries.by_ref().count(), 20);
        entries.rewind();
        assert!(entries.all(|e| e.unwrap().0 == three));

        let five = index.encode_search(&schema, &[Value::Int32(5)]).unwrap();
        let scan = IndexEntries::new(
            index.clone(),
            ScanBounds::range(Bound::Excluded(three), Bound::Included(five)),
        );
        assert_eq!(scan.count(), 40);

        assert_eq!(index.clear().unwrap(), 200);
        assert!(index.is_empty().unwrap());
    }

    #[test]
    fn test_row_keys_of_tuple() {
        let schema = schema();
        let index = SecondaryIndex::create(store(), 1, IndexDescriptor::hash(2, "by_city", ["city"])).unwrap();
        for (id, city) in [(1i64, "Oslo"), (2, "Rome"), (3, "Oslo")] {
            let row = BinaryRow::encode(&schema, &[Value::Int64(id), city.into(), Value::Null]).unwrap();
            let tuple = index.tuple_of(&schema, &row).unwrap();
            index.insert(&tuple, &row.key_bytes(&schema).unwrap()).unwrap();
        }
        let oslo = index.encode_search(&schema, &[Value::from("Oslo")]).unwrap();
        assert_eq!(index.row_keys_of(&oslo).unwrap().len(), 2);
        assert!(!index.has_null(&schema, &oslo).unwrap());

        let row = BinaryRow::encode(&schema, &[Value::Int64(1), Value::from("Oslo"), Value::Null]).unwrap();
        assert!(index.remove(&oslo, &row.key_bytes(&schema).unwrap()).unwrap());
        assert!(!index.remove(&oslo, &row.key_bytes(&schema).unwrap()).unwrap());
        assert_eq!(index.row_keys_of(&oslo).unwrap().len(), 1);
    }
}
