//! Multi-version row storage.
//!
//! Row versions live in slotted data pages and form newest-first chains
//! whose heads are found through the primary tree.

mod chain;
mod freespace;
mod link;
mod page;

pub use chain::{ChainIter, Fragments, GcStats, ReadResult, Version, VersionChain, VersionHeader, VisibleRows};
pub use freespace::FreeSpaceMap;
pub use link::Link;
pub use page::{category_to_min_space, space_to_category, DataPage, DataPageHeader};
