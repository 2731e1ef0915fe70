//! Capability trait the generic tree is parameterized by.

use basalt_common::Result;
use std::cmp::Ordering;

/// Describes the rows one kind of tree stores.
///
/// A row is split into a search key and a payload. Keys are unique within a
/// tree; inserting a row whose key compares equal replaces the stored row.
pub trait TreeSpec: Send + Sync + 'static {
    /// Row type stored in leaves.
    type Row: Clone + std::fmt::Debug;

    /// Tag stamped into every node and the meta page of trees of this kind.
    const KIND: u8;

    /// Name used in logs.
    const NAME: &'static str;

    /// Splits a row into its search key and payload.
    fn encode(row: &Self::Row) -> (Vec<u8>, Vec<u8>);

    /// Rebuilds a row from a stored key and payload.
    fn decode(key: &[u8], payload: &[u8]) -> Result<Self::Row>;

    /// Orders a stored key against a search key.
    fn compare(stored: &[u8], search: &[u8]) -> Ordering {
        stored.cmp(search)
    }
}

/// Tree kind tags.
pub mod kinds {
    pub const PRIMARY: u8 = 1;
    pub const HASH_INDEX: u8 = 2;
    pub const SORTED_INDEX: u8 = 3;
    pub const INDEX_META: u8 = 4;
    pub const SCHEMA_META: u8 = 5;
}
