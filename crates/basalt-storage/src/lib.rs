//! Storage engine for Basalt partitions.
//!
//! This crate provides:
//! - Page store over the shared frame pool, with partition files and
//!   double-write checkpoints
//! - Binary tuple codec for rows and index keys
//! - Generic B+ tree with primary, hash index, sorted index and registry
//!   specializations
//! - Multi-version row chains with garbage collection
//! - Partition storage applying replicated write commands

mod btree;
mod disk;
mod mvcc;
mod partition;
mod store;
mod tuple;

pub use btree::{
    check_entry_size, hash_tuple, kinds, max_item_size, prefix_end, BplusTree, Cursor,
    HashIndexEntry, HashIndexTree, IndexMetaEntry, IndexMetaTree, PrimaryEntry, PrimaryTree,
    SchemaMetaEntry, SchemaMetaTree, SortedIndexEntry, SortedIndexTree, TreeSpec, MIN_FILL_FACTOR,
};
pub use disk::{page_checksum, DiskManager, DiskManagerConfig};
pub use mvcc::{
    category_to_min_space, space_to_category, ChainIter, DataPage, DataPageHeader, Fragments,
    FreeSpaceMap, GcStats, Link, ReadResult, Version, VersionChain, VersionHeader, VisibleRows,
};
pub use partition::{
    CommandEnvelope, CommandOutcome, IndexDescriptor, IndexEntries, IndexKind, IndexScan,
    MvPartitionStorage, PartitionSnapshot, RowScan, ScanBounds, SecondaryIndex, SnapshotRow,
    SnapshotVersion, StorageMeta, TxId, WriteCommand,
};
pub use store::{
    CheckpointStats, Checkpointer, PageHandle, PageRead, PageStore, PageWrite, PartitionHeader,
    DOUBLE_WRITE_FILE, PARTITION_MAGIC,
};
pub use tuple::{
    decode, encode, encode_into, encode_key, BinaryRow, BinaryTupleSchema, Collation,
    ColumnDescriptor, Decimal, Element, SchemaDescriptor, SchemaShape, TupleReader, Value,
};
