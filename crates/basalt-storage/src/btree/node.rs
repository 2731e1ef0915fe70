//! Slotted B+ tree node pages.
//!
//! Inner and leaf nodes share one layout. Every item is a `(key, payload)`
//! pair; a leaf payload is the row payload of the tree, an inner payload is
//! the 4-byte page index of the child holding keys `>= key`.
//!
//! ```text
//! +------------------------+ 0
//! | Page Header (32 bytes) |
//! +------------------------+ 32
//! | Node Header (16 bytes) |
//! +------------------------+ 48 (SLOT_ARRAY_START)
//! | Slot Array             |
//! | [offset:2, len:2] * n  |  <- grows forward
//! +------------------------+ 48 + 4*n
//! |      Free Space        |
//! +------------------------+ data_end
//! | Item Data              |
//! | key_len:2 key payload  |  <- grows backward from the page end
//! +------------------------+ page_size
//! ```
//!
//! All functions work on raw page slices so they can run directly against a
//! latched frame.

use basalt_common::page::{PageHeader, PageId, PageType, PAGE_FORMAT_VERSION};
use basalt_common::{BasaltError, Result};

/// Offset of the node header.
pub const NODE_HEADER_OFFSET: usize = PageHeader::SIZE;

/// Size of the node header.
pub const NODE_HEADER_SIZE: usize = 16;

/// Start of the slot array.
pub const SLOT_ARRAY_START: usize = NODE_HEADER_OFFSET + NODE_HEADER_SIZE;

/// Size of one slot entry.
pub const SLOT_SIZE: usize = 4;

/// Per-item overhead: slot entry plus the key length prefix.
pub const ITEM_OVERHEAD: usize = SLOT_SIZE + 2;

/// Size of an inner node payload (child page index).
pub const CHILD_SIZE: usize = 4;

/// Nodes whose used bytes fall below this fraction of the usable space are
/// rebalanced with a sibling.
pub const MIN_FILL_FACTOR: f64 = 0.5;

// Node header field offsets.
const KIND_OFFSET: usize = NODE_HEADER_OFFSET;
const LEVEL_OFFSET: usize = NODE_HEADER_OFFSET + 1;
const NUM_SLOTS_OFFSET: usize = NODE_HEADER_OFFSET + 2;
const DATA_END_OFFSET: usize = NODE_HEADER_OFFSET + 4;
const LINK_OFFSET: usize = NODE_HEADER_OFFSET + 8;

/// Bytes available for slots and items.
pub fn usable_space(page_size: usize) -> usize {
    page_size - SLOT_ARRAY_START
}

/// Largest item (overhead included) a node accepts. At least four items
/// always fit on one page, which keeps every split half non-empty.
pub fn max_item_size(page_size: usize) -> usize {
    usable_space(page_size) / 4
}

/// Bytes one item takes, slot included.
#[inline]
pub fn item_size(key_len: usize, payload_len: usize) -> usize {
    ITEM_OVERHEAD + key_len + payload_len
}

/// An owned node item, used while splitting and rebalancing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeItem {
    pub key: Vec<u8>,
    pub payload: Vec<u8>,
}

impl NodeItem {
    pub fn new(key: Vec<u8>, payload: Vec<u8>) -> Self {
        Self { key, payload }
    }

    /// Builds an inner item pointing at a child page.
    pub fn child(key: Vec<u8>, child: u32) -> Self {
        Self {
            key,
            payload: child.to_le_bytes().to_vec(),
        }
    }

    /// Bytes this item takes on a page.
    pub fn size(&self) -> usize {
        item_size(self.key.len(), self.payload.len())
    }

    /// Child page index of an inner item.
    pub fn child_idx(&self) -> u32 {
        child_from(&self.payload)
    }
}

fn child_from(payload: &[u8]) -> u32 {
    let mut raw = [0u8; CHILD_SIZE];
    raw.copy_from_slice(&payload[..CHILD_SIZE]);
    u32::from_le_bytes(raw)
}

#[inline]
fn read_u16(buf: &[u8], offset: usize) -> usize {
    u16::from_le_bytes([buf[offset], buf[offset + 1]]) as usize
}

#[inline]
fn write_u16(buf: &mut [u8], offset: usize, value: usize) {
    buf[offset..offset + 2].copy_from_slice(&(value as u16).to_le_bytes());
}

/// Namespace for node page operations.
pub struct Node;

impl Node {
    /// Formats a freshly allocated page as an empty node.
    ///
    /// `level` 0 is a leaf. The link is the next leaf for leaves and the
    /// leftmost child for inner nodes; 0 means none.
    pub fn init(buf: &mut [u8], page_id: PageId, kind: u8, level: u8, link: u32) {
        let page_type = if level == 0 {
            PageType::TreeLeaf
        } else {
            PageType::TreeInner
        };
        let page_size = buf.len();
        buf[PageHeader::SIZE..].fill(0);
        PageHeader::init(buf, page_id, page_type);
        buf[KIND_OFFSET] = kind;
        buf[LEVEL_OFFSET] = level;
        write_u16(buf, NUM_SLOTS_OFFSET, 0);
        Self::set_data_end(buf, page_size);
        Self::set_link(buf, link);
    }

    /// Checks that a page is a well-formed node of the given tree kind.
    pub fn validate(buf: &[u8], page_id: PageId, kind: u8) -> Result<()> {
        let corrupt = |reason: String| Err(BasaltError::corrupted_tree(page_id.as_u64(), reason));

        let tag = PageHeader::type_tag(buf);
        let expected_type = match PageType::from_u8(tag) {
            Some(PageType::TreeLeaf) => PageType::TreeLeaf,
            Some(PageType::TreeInner) => PageType::TreeInner,
            _ => return corrupt(format!("unexpected page type tag {}", tag)),
        };
        let version = buf[PageHeader::VERSION_OFFSET];
        if version != PAGE_FORMAT_VERSION {
            return corrupt(format!("unknown page format version {}", version));
        }
        if buf[KIND_OFFSET] != kind {
            return corrupt(format!(
                "node of tree kind {} where kind {} was expected",
                buf[KIND_OFFSET], kind
            ));
        }
        if (Self::level(buf) == 0) != (expected_type == PageType::TreeLeaf) {
            return corrupt(format!(
                "level {} does not match page type {:?}",
                Self::level(buf),
                expected_type
            ));
        }

        let n = Self::num_slots(buf);
        let data_end = Self::data_end(buf);
        let slots_end = SLOT_ARRAY_START + n * SLOT_SIZE;
        if slots_end > data_end || data_end > buf.len() {
            return corrupt(format!("{} slots overlap item data at {}", n, data_end));
        }
        for i in 0..n {
            let (offset, len) = Self::slot(buf, i);
            if offset < data_end || offset + len > buf.len() || len < 2 {
                return corrupt(format!("slot {} out of range ({}+{})", i, offset, len));
            }
            if 2 + read_u16(buf, offset) > len {
                return corrupt(format!("slot {} key exceeds item", i));
            }
            if expected_type == PageType::TreeInner && len - 2 - read_u16(buf, offset) != CHILD_SIZE
            {
                return corrupt(format!("inner slot {} has no child", i));
            }
        }
        Ok(())
    }

    /// Tree kind tag the node belongs to.
    pub fn kind(buf: &[u8]) -> u8 {
        buf[KIND_OFFSET]
    }

    /// Distance from the leaf level.
    pub fn level(buf: &[u8]) -> u8 {
        buf[LEVEL_OFFSET]
    }

    pub fn is_leaf(buf: &[u8]) -> bool {
        Self::level(buf) == 0
    }

    /// Number of items.
    pub fn num_slots(buf: &[u8]) -> usize {
        read_u16(buf, NUM_SLOTS_OFFSET)
    }

    fn set_num_slots(buf: &mut [u8], n: usize) {
        write_u16(buf, NUM_SLOTS_OFFSET, n);
        PageHeader::set_item_count(buf, n as u16);
    }

    fn data_end(buf: &[u8]) -> usize {
        read_u16(buf, DATA_END_OFFSET)
    }

    fn set_data_end(buf: &mut [u8], end: usize) {
        write_u16(buf, DATA_END_OFFSET, end);
    }

    /// Next leaf for leaves, leftmost child for inner nodes. 0 means none.
    pub fn link(buf: &[u8]) -> u32 {
        u32::from_le_bytes([
            buf[LINK_OFFSET],
            buf[LINK_OFFSET + 1],
            buf[LINK_OFFSET + 2],
            buf[LINK_OFFSET + 3],
        ])
    }

    pub fn set_link(buf: &mut [u8], link: u32) {
        buf[LINK_OFFSET..LINK_OFFSET + 4].copy_from_slice(&link.to_le_bytes());
    }

    fn slot(buf: &[u8], i: usize) -> (usize, usize) {
        let at = SLOT_ARRAY_START + i * SLOT_SIZE;
        (read_u16(buf, at), read_u16(buf, at + 2))
    }

    fn set_slot(buf: &mut [u8], i: usize, offset: usize, len: usize) {
        let at = SLOT_ARRAY_START + i * SLOT_SIZE;
        write_u16(buf, at, offset);
        write_u16(buf, at + 2, len);
    }

    /// Key of item `i`.
    pub fn key_at(buf: &[u8], i: usize) -> &[u8] {
        let (offset, _) = Self::slot(buf, i);
        let key_len = read_u16(buf, offset);
        &buf[offset + 2..offset + 2 + key_len]
    }

    /// Payload of item `i`.
    pub fn payload_at(buf: &[u8], i: usize) -> &[u8] {
        let (offset, len) = Self::slot(buf, i);
        let key_len = read_u16(buf, offset);
        &buf[offset + 2 + key_len..offset + len]
    }

    /// Child `i` of an inner node, for `i` in `0..=num_slots`. Child 0 is the
    /// leftmost child, child `i` is the child of item `i - 1`.
    pub fn child_at(buf: &[u8], i: usize) -> u32 {
        if i == 0 {
            Self::link(buf)
        } else {
            child_from(Self::payload_at(buf, i - 1))
        }
    }

    /// Binary search by key. `Ok(i)` when item `i` has the key, otherwise
    /// `Err(i)` with the insertion position.
    pub fn search_by<F>(buf: &[u8], mut compare: F) -> std::result::Result<usize, usize>
    where
        F: FnMut(&[u8]) -> std::cmp::Ordering,
    {
        let mut lo = 0;
        let mut hi = Self::num_slots(buf);
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            match compare(Self::key_at(buf, mid)) {
                std::cmp::Ordering::Less => lo = mid + 1,
                std::cmp::Ordering::Greater => hi = mid,
                std::cmp::Ordering::Equal => return Ok(mid),
            }
        }
        Err(lo)
    }

    /// Index of the child covering a key, given the key's search result.
    #[inline]
    pub fn child_index(search: std::result::Result<usize, usize>) -> usize {
        match search {
            Ok(i) => i + 1,
            Err(i) => i,
        }
    }

    /// Bytes item `i` takes, slot included.
    pub fn size_at(buf: &[u8], i: usize) -> usize {
        Self::slot(buf, i).1 + SLOT_SIZE
    }

    /// Bytes taken by slots and items.
    pub fn used_space(buf: &[u8]) -> usize {
        (0..Self::num_slots(buf))
            .map(|i| Self::slot(buf, i).1 + SLOT_SIZE)
            .sum()
    }

    /// Contiguous free bytes between the slot array and the item data.
    pub fn free_space(buf: &[u8]) -> usize {
        Self::data_end(buf) - (SLOT_ARRAY_START + Self::num_slots(buf) * SLOT_SIZE)
    }

    /// Free bytes after compaction.
    pub fn reclaimable_space(buf: &[u8]) -> usize {
        usable_space(buf.len()) - Self::used_space(buf)
    }

    /// Returns true if the node is below the minimum fill factor.
    pub fn is_underfull(buf: &[u8]) -> bool {
        (Self::used_space(buf) as f64) < usable_space(buf.len()) as f64 * MIN_FILL_FACTOR
    }

    /// Inserts an item at position `i`, compacting first if needed.
    /// Returns false, leaving the node unchanged, when it does not fit.
    pub fn insert_at(buf: &mut [u8], i: usize, key: &[u8], payload: &[u8]) -> bool {
        let size = item_size(key.len(), payload.len());
        if Self::reclaimable_space(buf) < size {
            return false;
        }
        if Self::free_space(buf) < size {
            Self::compact(buf);
        }

        let n = Self::num_slots(buf);
        let len = size - SLOT_SIZE;
        let offset = Self::data_end(buf) - len;
        write_u16(buf, offset, key.len());
        buf[offset + 2..offset + 2 + key.len()].copy_from_slice(key);
        buf[offset + 2 + key.len()..offset + len].copy_from_slice(payload);
        Self::set_data_end(buf, offset);

        let start = SLOT_ARRAY_START + i * SLOT_SIZE;
        let end = SLOT_ARRAY_START + n * SLOT_SIZE;
        buf.copy_within(start..end, start + SLOT_SIZE);
        Self::set_slot(buf, i, offset, len);
        Self::set_num_slots(buf, n + 1);
        true
    }

    /// Removes item `i`. Its bytes are reclaimed by the next compaction.
    pub fn remove_at(buf: &mut [u8], i: usize) {
        let n = Self::num_slots(buf);
        let start = SLOT_ARRAY_START + (i + 1) * SLOT_SIZE;
        let end = SLOT_ARRAY_START + n * SLOT_SIZE;
        buf.copy_within(start..end, start - SLOT_SIZE);
        Self::set_num_slots(buf, n - 1);
        if n == 1 {
            let page_size = buf.len();
            Self::set_data_end(buf, page_size);
        }
    }

    /// Replaces item `i` with a new key and payload. Returns false when the
    /// new item does not fit, leaving the node unchanged.
    pub fn replace_at(buf: &mut [u8], i: usize, key: &[u8], payload: &[u8]) -> bool {
        let (offset, len) = Self::slot(buf, i);
        if Self::key_at(buf, i) == key && len == 2 + key.len() + payload.len() {
            buf[offset + 2 + key.len()..offset + len].copy_from_slice(payload);
            return true;
        }
        if Self::reclaimable_space(buf) + Self::size_at(buf, i) < item_size(key.len(), payload.len()) {
            return false;
        }
        Self::remove_at(buf, i);
        Self::insert_at(buf, i, key, payload)
    }

    /// Rewrites the item data contiguously at the end of the page.
    pub fn compact(buf: &mut [u8]) {
        let items = Self::items(buf);
        Self::write_items(buf, &items);
    }

    /// Copies out all items in order.
    pub fn items(buf: &[u8]) -> Vec<NodeItem> {
        (0..Self::num_slots(buf))
            .map(|i| NodeItem::new(Self::key_at(buf, i).to_vec(), Self::payload_at(buf, i).to_vec()))
            .collect()
    }

    /// Replaces all items of the node. The caller guarantees they fit.
    pub fn write_items(buf: &mut [u8], items: &[NodeItem]) {
        let mut end = buf.len();
        for (i, item) in items.iter().enumerate() {
            let len = item.size() - SLOT_SIZE;
            end -= len;
            write_u16(buf, end, item.key.len());
            buf[end + 2..end + 2 + item.key.len()].copy_from_slice(&item.key);
            buf[end + 2 + item.key.len()..end + len].copy_from_slice(&item.payload);
            Self::set_slot(buf, i, end, len);
        }
        Self::set_data_end(buf, end);
        Self::set_num_slots(buf, items.len());
    }
}

/// Total page bytes a list of items takes.
pub fn items_size(items: &[NodeItem]) -> usize {
    items.iter().map(NodeItem::size).sum()
}

/// Picks the split position for a list of items so that both halves carry
/// about the same number of bytes. The result is in `1..items.len()` for
/// lists of two or more items.
pub fn split_point(items: &[NodeItem]) -> usize {
    let total = items_size(items);
    let mut acc = 0;
    for (i, item) in items.iter().enumerate() {
        acc += item.size();
        if acc * 2 >= total {
            // The heavier middle item goes to whichever side stays smaller.
            let split = if acc * 2 - total > item.size() { i } else { i + 1 };
            return split.clamp(1, items.len().saturating_sub(1).max(1));
        }
    }
    items.len() / 2
}
