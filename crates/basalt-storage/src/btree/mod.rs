//! B+ tree engine.
//!
//! One generic page-resident tree, [`BplusTree`], parameterized by a
//! [`TreeSpec`]. Keys are compared as bytes; every key a tree stores is
//! produced by an order-preserving encoding, so byte order is row order.
//!
//! Specializations:
//! - [`PrimaryTree`]: row key to version chain head
//! - [`HashIndexTree`]: hash index entries
//! - [`SortedIndexTree`]: sorted index entries
//! - [`IndexMetaTree`]: index id to index tree meta page
//! - [`SchemaMetaTree`]: schema version to schema descriptor

mod index;
mod meta;
mod node;
mod primary;
mod spec;
mod tree;

pub use index::{hash_tuple, HashIndexEntry, HashIndexTree, SortedIndexEntry, SortedIndexTree};
pub use meta::{IndexMetaEntry, IndexMetaTree, SchemaMetaEntry, SchemaMetaTree};
pub use node::{max_item_size, MIN_FILL_FACTOR};
pub use primary::{PrimaryEntry, PrimaryTree};
pub use spec::{kinds, TreeSpec};
pub use tree::{check_entry_size, prefix_end, BplusTree, Cursor};
