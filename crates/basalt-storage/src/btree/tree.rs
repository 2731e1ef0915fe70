//! Generic page-resident B+ tree.
//!
//! Latching protocol:
//! - Readers couple shared latches from the meta page down to a leaf,
//!   holding at most a parent and a child at any time.
//! - Writers of one tree are serialized. A writer first latches only the
//!   target leaf exclusively (optimistic). When the leaf would split or
//!   underflow it restarts with exclusive crabbing from the meta page and
//!   releases every ancestor once a node is safe (pessimistic).
//! - Every pessimistic pass bumps the modification epoch before and after,
//!   so the epoch is odd while a structure modification is in flight. A
//!   cursor only follows a leaf link when the epoch is unchanged since it
//!   read the previous leaf; otherwise it re-descends from its last key.
//!
//! All pages a split can need are reserved before the first page changes,
//! so an `OutOfMemory` never leaves a half-split tree behind.

use super::node::{
    item_size, items_size, max_item_size, split_point, usable_space, Node, NodeItem, CHILD_SIZE,
    ITEM_OVERHEAD, MIN_FILL_FACTOR,
};
use super::spec::TreeSpec;
use crate::store::{PageRead, PageStore, PageWrite};
use basalt_common::page::{PageHeader, PageId, PageType, PAGE_FORMAT_VERSION};
use basalt_common::{BasaltError, Result};
use parking_lot::Mutex;
use std::cmp::Ordering as CmpOrdering;
use std::collections::VecDeque;
use std::marker::PhantomData;
use std::ops::Bound;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Root pointer and height of one tree.
///
/// Layout after the page header:
/// - kind: 1 byte
/// - reserved: 3 bytes
/// - root: 4 bytes (page index)
/// - height: 4 bytes (1 when the root is a leaf)
pub struct TreeMetaPage;

impl TreeMetaPage {
    const KIND_OFFSET: usize = PageHeader::SIZE;
    const ROOT_OFFSET: usize = PageHeader::SIZE + 4;
    const HEIGHT_OFFSET: usize = PageHeader::SIZE + 8;

    fn init(buf: &mut [u8], kind: u8, root: u32, height: u32) {
        buf[Self::KIND_OFFSET] = kind;
        Self::set(buf, root, height);
    }

    fn set(buf: &mut [u8], root: u32, height: u32) {
        buf[Self::ROOT_OFFSET..Self::ROOT_OFFSET + 4].copy_from_slice(&root.to_le_bytes());
        buf[Self::HEIGHT_OFFSET..Self::HEIGHT_OFFSET + 4].copy_from_slice(&height.to_le_bytes());
    }

    /// Validates the page and returns `(root, height)`.
    fn read(buf: &[u8], page_id: PageId, kind: u8) -> Result<(u32, u32)> {
        let corrupt = |reason: String| Err(BasaltError::corrupted_tree(page_id.as_u64(), reason));
        if PageHeader::type_tag(buf) != PageType::TreeMeta as u8 {
            return corrupt(format!("page type tag {} is not a tree meta page", PageHeader::type_tag(buf)));
        }
        if buf[PageHeader::VERSION_OFFSET] != PAGE_FORMAT_VERSION {
            return corrupt(format!(
                "unknown page format version {}",
                buf[PageHeader::VERSION_OFFSET]
            ));
        }
        if buf[Self::KIND_OFFSET] != kind {
            return corrupt(format!("meta page of tree kind {}", buf[Self::KIND_OFFSET]));
        }
        let word = |at: usize| u32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]]);
        let root = word(Self::ROOT_OFFSET);
        let height = word(Self::HEIGHT_OFFSET);
        if root == 0 || height == 0 || height > u8::MAX as u32 {
            return corrupt(format!("invalid root {} at height {}", root, height));
        }
        Ok((root, height))
    }
}

/// Checks that an entry fits the item size limit of a page size.
///
/// Keys are also copied into inner nodes as separators, so the key must fit
/// next to a child pointer as well.
pub fn check_entry_size(page_size: usize, key_len: usize, payload_len: usize) -> Result<()> {
    let max = max_item_size(page_size);
    if item_size(key_len, payload_len.max(CHILD_SIZE)) > max {
        return Err(BasaltError::KeyTooLarge {
            size: key_len + payload_len,
            max: max - ITEM_OVERHEAD,
        });
    }
    Ok(())
}

/// Returns the smallest key greater than every key starting with `prefix`,
/// or None when no such key exists.
pub fn prefix_end(prefix: &[u8]) -> Option<Vec<u8>> {
    let mut end = prefix.to_vec();
    while let Some(last) = end.pop() {
        if last < u8::MAX {
            end.push(last + 1);
            return Some(end);
        }
    }
    None
}

/// Odd-epoch guard of a structure modification.
struct Modification<'a>(&'a AtomicU64);

impl Drop for Modification<'_> {
    fn drop(&mut self) {
        self.0.fetch_add(1, Ordering::AcqRel);
    }
}

/// A B+ tree stored in the pages of one partition.
pub struct BplusTree<S: TreeSpec> {
    store: Arc<PageStore>,
    meta: PageId,
    /// Serializes writers.
    writer: Mutex<()>,
    /// Odd while a structure modification is in flight.
    epoch: AtomicU64,
    _spec: PhantomData<fn() -> S>,
}

impl<S: TreeSpec> BplusTree<S> {
    /// Creates an empty tree in a partition.
    pub fn create(store: Arc<PageStore>, partition: u32) -> Result<Self> {
        let meta = store.allocate(partition, PageType::TreeMeta)?;
        let root = match store.allocate(partition, PageType::TreeLeaf) {
            Ok(root) => root,
            Err(e) => {
                store.free(meta)?;
                return Err(e);
            }
        };
        Node::init(&mut store.write(root)?, root, S::KIND, 0, 0);
        TreeMetaPage::init(&mut store.write(meta)?, S::KIND, root.page_idx, 1);

        tracing::debug!(tree = S::NAME, meta = %meta, root = %root, "created tree");
        Ok(Self::with_meta(store, meta))
    }

    /// Opens an existing tree by its meta page.
    pub fn open(store: Arc<PageStore>, meta: PageId) -> Result<Self> {
        {
            let page = store.read(meta)?;
            TreeMetaPage::read(&page, meta, S::KIND)?;
        }
        Ok(Self::with_meta(store, meta))
    }

    fn with_meta(store: Arc<PageStore>, meta: PageId) -> Self {
        Self {
            store,
            meta,
            writer: Mutex::new(()),
            epoch: AtomicU64::new(0),
            _spec: PhantomData,
        }
    }

    /// Meta page holding the root pointer.
    pub fn meta_page(&self) -> PageId {
        self.meta
    }

    pub fn partition(&self) -> u32 {
        self.meta.partition
    }

    /// Current root page.
    pub fn root(&self) -> Result<PageId> {
        Ok(self.node_id(self.root_and_height()?.0))
    }

    /// Number of node levels; 1 when the root is a leaf.
    pub fn height(&self) -> Result<u32> {
        Ok(self.root_and_height()?.1)
    }

    /// Checks a row against the item size limit without touching the tree.
    pub fn check_row(&self, row: &S::Row) -> Result<()> {
        let (key, payload) = S::encode(row);
        check_entry_size(self.store.page_size(), key.len(), payload.len())
    }

    fn root_and_height(&self) -> Result<(u32, u32)> {
        let page = self.store.read(self.meta)?;
        TreeMetaPage::read(&page, self.meta, S::KIND)
    }

    fn node_id(&self, page_idx: u32) -> PageId {
        PageId::new(self.meta.partition, page_idx)
    }

    fn read_node(&self, page_idx: u32) -> Result<PageRead<'_>> {
        let id = self.node_id(page_idx);
        let page = self.store.read(id)?;
        Node::validate(&page, id, S::KIND)?;
        Ok(page)
    }

    fn write_node(&self, page_idx: u32) -> Result<PageWrite<'_>> {
        let id = self.node_id(page_idx);
        let page = self.store.write(id)?;
        Node::validate(&page, id, S::KIND)?;
        Ok(page)
    }

    fn expect_level(page_id: PageId, page: &[u8], level: u32) -> Result<()> {
        if Node::level(page) as u32 != level {
            return Err(BasaltError::corrupted_tree(
                page_id.as_u64(),
                format!("node at level {} where level {} was expected", Node::level(page), level),
            ));
        }
        Ok(())
    }

    fn search(page: &[u8], key: &[u8]) -> std::result::Result<usize, usize> {
        Node::search_by(page, |stored| S::compare(stored, key))
    }

    /// Child index to follow for a key; None follows the leftmost child.
    fn route(page: &[u8], key: Option<&[u8]>) -> usize {
        key.map_or(0, |key| Node::child_index(Self::search(page, key)))
    }

    fn begin_modification(&self) -> Modification<'_> {
        self.epoch.fetch_add(1, Ordering::AcqRel);
        Modification(&self.epoch)
    }

    /// Waits out an in-flight structure modification and returns the epoch.
    fn stable_epoch(&self) -> u64 {
        loop {
            let epoch = self.epoch.load(Ordering::Acquire);
            if epoch % 2 == 0 {
                return epoch;
            }
            std::thread::yield_now();
        }
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Descends with shared latch coupling to the leaf covering `key`.
    fn descend_read(&self, key: Option<&[u8]>) -> Result<PageRead<'_>> {
        let meta = self.store.read(self.meta)?;
        let (root, height) = TreeMetaPage::read(&meta, self.meta, S::KIND)?;
        let mut page = self.read_node(root)?;
        drop(meta);
        Self::expect_level(page.page_id(), &page, height - 1)?;

        while !Node::is_leaf(&page) {
            let level = Node::level(&page) as u32;
            let child = self.read_node(Node::child_at(&page, Self::route(&page, key)))?;
            Self::expect_level(child.page_id(), &child, level - 1)?;
            page = child;
        }
        Ok(page)
    }

    /// Returns the row stored under a key.
    pub fn find(&self, key: &[u8]) -> Result<Option<S::Row>> {
        let leaf = self.descend_read(Some(key))?;
        match Self::search(&leaf, key) {
            Ok(i) => Ok(Some(S::decode(Node::key_at(&leaf, i), Node::payload_at(&leaf, i))?)),
            Err(_) => Ok(None),
        }
    }

    /// Lazily iterates rows with keys between two bounds, in key order.
    pub fn range(&self, lower: Bound<&[u8]>, upper: Bound<&[u8]>) -> Cursor<'_, S> {
        Cursor::new(self, lower.map(<[u8]>::to_vec), upper.map(<[u8]>::to_vec))
    }

    /// Lazily iterates rows whose key starts with `prefix`.
    pub fn prefix(&self, prefix: &[u8]) -> Cursor<'_, S> {
        let upper = match prefix_end(prefix) {
            Some(end) => Bound::Excluded(end),
            None => Bound::Unbounded,
        };
        Cursor::new(self, Bound::Included(prefix.to_vec()), upper)
    }

    /// Lazily iterates all rows.
    pub fn iter(&self) -> Cursor<'_, S> {
        Cursor::new(self, Bound::Unbounded, Bound::Unbounded)
    }

    /// Counts rows with a full scan.
    pub fn len(&self) -> Result<usize> {
        self.iter().try_fold(0, |n, row| row.map(|_| n + 1))
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.iter().next().transpose()?.is_none())
    }

    // =========================================================================
    // Insert
    // =========================================================================

    /// Stores a row, replacing the row with an equal key. Returns the
    /// replaced row.
    pub fn insert(&self, row: &S::Row) -> Result<Option<S::Row>> {
        let (key, payload) = S::encode(row);
        check_entry_size(self.store.page_size(), key.len(), payload.len())?;
        let _writer = self.writer.lock();

        {
            let (mut leaf, _) = self.descend_write_leaf(&key)?;
            match Self::search(&leaf, &key) {
                Ok(i) => {
                    let old = S::decode(Node::key_at(&leaf, i), Node::payload_at(&leaf, i))?;
                    if Node::replace_at(&mut leaf, i, &key, &payload) {
                        return Ok(Some(old));
                    }
                }
                Err(i) => {
                    if Node::insert_at(&mut leaf, i, &key, &payload) {
                        return Ok(None);
                    }
                }
            }
        }
        self.insert_pessimistic(key, payload)
    }

    /// Descends with shared latches and takes the leaf exclusively. Returns
    /// the leaf and whether it is the root.
    fn descend_write_leaf(&self, key: &[u8]) -> Result<(PageWrite<'_>, bool)> {
        let meta = self.store.read(self.meta)?;
        let (root, height) = TreeMetaPage::read(&meta, self.meta, S::KIND)?;
        if height == 1 {
            let leaf = self.write_node(root)?;
            Self::expect_level(leaf.page_id(), &leaf, 0)?;
            return Ok((leaf, true));
        }

        let mut page = self.read_node(root)?;
        drop(meta);
        Self::expect_level(page.page_id(), &page, height - 1)?;
        loop {
            let level = Node::level(&page) as u32;
            let child = Node::child_at(&page, Self::route(&page, Some(key)));
            if level == 1 {
                let leaf = self.write_node(child)?;
                Self::expect_level(leaf.page_id(), &leaf, 0)?;
                return Ok((leaf, false));
            }
            let next = self.read_node(child)?;
            Self::expect_level(next.page_id(), &next, level - 1)?;
            page = next;
        }
    }

    fn insert_pessimistic(&self, key: Vec<u8>, payload: Vec<u8>) -> Result<Option<S::Row>> {
        let _modification = self.begin_modification();
        let page_size = self.store.page_size();
        let entry_size = item_size(key.len(), payload.len());

        let (old, reserved) = {
            let meta_page = self.store.write(self.meta)?;
            let (root, height) = TreeMetaPage::read(&meta_page, self.meta, S::KIND)?;
            let mut meta = Some(meta_page);
            let mut path: Vec<(PageWrite<'_>, usize)> = Vec::new();

            let mut page_idx = root;
            let mut level = height - 1;
            let mut leaf = loop {
                let node = self.write_node(page_idx)?;
                Self::expect_level(node.page_id(), &node, level)?;
                let needed = if Node::is_leaf(&node) {
                    entry_size
                } else {
                    max_item_size(page_size)
                };
                if Node::reclaimable_space(&node) >= needed {
                    path.clear();
                    meta = None;
                }
                if Node::is_leaf(&node) {
                    break node;
                }
                let child = Self::route(&node, Some(&key));
                page_idx = Node::child_at(&node, child);
                level -= 1;
                path.push((node, child));
            };

            let position = Self::search(&leaf, &key);
            let old = match position {
                Ok(i) => Some(S::decode(Node::key_at(&leaf, i), Node::payload_at(&leaf, i))?),
                Err(_) => None,
            };
            let fits = match position {
                Ok(i) => Node::replace_at(&mut leaf, i, &key, &payload),
                Err(i) => Node::insert_at(&mut leaf, i, &key, &payload),
            };
            if fits {
                return Ok(old);
            }

            let mut reserved = self.reserve(path.len() + 1 + usize::from(meta.is_some()))?;

            // Split the leaf.
            let mut items = Node::items(&leaf);
            let entry = NodeItem::new(key, payload);
            match position {
                Ok(i) => items[i] = entry,
                Err(i) => items.insert(i, entry),
            }
            let split = split_point(&items);
            let right_items = items.split_off(split);
            let right_id = take_reserved(&mut reserved)?;
            {
                let mut right = self.store.write(right_id)?;
                Node::init(&mut right, right_id, S::KIND, 0, Node::link(&leaf));
                Node::write_items(&mut right, &right_items);
            }
            Node::write_items(&mut leaf, &items);
            Node::set_link(&mut leaf, right_id.page_idx);
            let mut pending = NodeItem::child(right_items[0].key.clone(), right_id.page_idx);
            let mut split_idx = leaf.page_id().page_idx;
            drop(leaf);

            // Push separators up until one fits.
            loop {
                match path.pop() {
                    Some((mut parent, child)) => {
                        if Node::insert_at(&mut parent, child, &pending.key, &pending.payload) {
                            break;
                        }
                        let mut items = Node::items(&parent);
                        items.insert(child, pending);
                        let split = split_point(&items);
                        let mut right_items = items.split_off(split);
                        let middle = right_items.remove(0);
                        let right_id = take_reserved(&mut reserved)?;
                        {
                            let mut right = self.store.write(right_id)?;
                            Node::init(
                                &mut right,
                                right_id,
                                S::KIND,
                                Node::level(&parent),
                                middle.child_idx(),
                            );
                            Node::write_items(&mut right, &right_items);
                        }
                        Node::write_items(&mut parent, &items);
                        pending = NodeItem::child(middle.key, right_id.page_idx);
                        split_idx = parent.page_id().page_idx;
                    }
                    None => {
                        let meta_page = match meta.as_mut() {
                            Some(meta_page) if split_idx == root => meta_page,
                            _ => {
                                return Err(BasaltError::Internal(format!(
                                    "split of page {} reached a released ancestor",
                                    split_idx
                                )))
                            }
                        };
                        let root_id = take_reserved(&mut reserved)?;
                        let mut new_root = self.store.write(root_id)?;
                        Node::init(&mut new_root, root_id, S::KIND, height as u8, root);
                        Node::insert_at(&mut new_root, 0, &pending.key, &pending.payload);
                        TreeMetaPage::set(meta_page, root_id.page_idx, height + 1);
                        tracing::debug!(
                            tree = S::NAME,
                            root = %root_id,
                            height = height + 1,
                            "tree grew"
                        );
                        break;
                    }
                }
            }
            (old, reserved)
        };

        for page_id in reserved {
            self.store.free(page_id)?;
        }
        Ok(old)
    }

    /// Allocates pages for a split up front.
    fn reserve(&self, count: usize) -> Result<Vec<PageId>> {
        let mut pages = Vec::with_capacity(count);
        for _ in 0..count {
            match self.store.allocate(self.meta.partition, PageType::TreeLeaf) {
                Ok(page_id) => pages.push(page_id),
                Err(e) => {
                    for page_id in pages {
                        self.store.free(page_id)?;
                    }
                    return Err(e);
                }
            }
        }
        Ok(pages)
    }

    // =========================================================================
    // Remove
    // =========================================================================

    /// Removes the row stored under a key and returns it.
    pub fn remove(&self, key: &[u8]) -> Result<Option<S::Row>> {
        let _writer = self.writer.lock();
        {
            let (mut leaf, is_root) = self.descend_write_leaf(key)?;
            let i = match Self::search(&leaf, key) {
                Ok(i) => i,
                Err(_) => return Ok(None),
            };
            let remaining = Node::used_space(&leaf) - Node::size_at(&leaf, i);
            if is_root || !below_fill(remaining, leaf.len()) {
                let old = S::decode(Node::key_at(&leaf, i), Node::payload_at(&leaf, i))?;
                Node::remove_at(&mut leaf, i);
                return Ok(Some(old));
            }
        }
        self.remove_pessimistic(key)
    }

    /// Returns true if removing one item below this node cannot propagate
    /// to its parent.
    fn remove_safe(node: &[u8], is_root: bool) -> bool {
        match (is_root, Node::is_leaf(node)) {
            (true, true) => true,
            (true, false) => Node::num_slots(node) >= 2,
            (false, _) => {
                let used = Node::used_space(node);
                let max = max_item_size(node.len());
                used >= max && !below_fill(used - max, node.len())
            }
        }
    }

    fn remove_pessimistic(&self, key: &[u8]) -> Result<Option<S::Row>> {
        let _modification = self.begin_modification();
        let mut released = Vec::new();

        let old = {
            let meta_page = self.store.write(self.meta)?;
            let (root, height) = TreeMetaPage::read(&meta_page, self.meta, S::KIND)?;
            let mut meta = Some(meta_page);
            let mut path: Vec<(PageWrite<'_>, usize)> = Vec::new();

            let mut page_idx = root;
            let mut level = height - 1;
            let mut leaf = loop {
                let node = self.write_node(page_idx)?;
                Self::expect_level(node.page_id(), &node, level)?;
                if Self::remove_safe(&node, page_idx == root) {
                    path.clear();
                    meta = None;
                }
                if Node::is_leaf(&node) {
                    break node;
                }
                let child = Self::route(&node, Some(key));
                page_idx = Node::child_at(&node, child);
                level -= 1;
                path.push((node, child));
            };

            let i = match Self::search(&leaf, key) {
                Ok(i) => i,
                Err(_) => return Ok(None),
            };
            let old = S::decode(Node::key_at(&leaf, i), Node::payload_at(&leaf, i))?;
            Node::remove_at(&mut leaf, i);

            let mut node = leaf;
            while let Some((mut parent, child)) = path.pop() {
                if !Node::is_underfull(&node) {
                    break;
                }
                self.rebalance(&mut parent, child, node, &mut released)?;
                node = parent;
            }

            if let Some(meta_page) = meta.as_mut() {
                if node.page_id().page_idx == root
                    && !Node::is_leaf(&node)
                    && Node::num_slots(&node) == 0
                {
                    TreeMetaPage::set(meta_page, Node::link(&node), height - 1);
                    released.push(node.page_id());
                    tracing::debug!(tree = S::NAME, height = height - 1, "tree shrank");
                }
            }
            old
        };

        for page_id in released {
            self.store.free(page_id)?;
        }
        Ok(Some(old))
    }

    /// Merges an underfull child with a sibling, or moves items over from
    /// the sibling when both do not fit one page. A borrow whose new
    /// separator does not fit the parent is skipped; the child then stays
    /// underfull.
    fn rebalance(
        &self,
        parent: &mut [u8],
        child: usize,
        node: PageWrite<'_>,
        released: &mut Vec<PageId>,
    ) -> Result<()> {
        if Node::num_slots(parent) == 0 {
            return Ok(());
        }
        let sibling_child = if child > 0 { child - 1 } else { 1 };
        let sibling = self.write_node(Node::child_at(parent, sibling_child))?;
        Self::expect_level(sibling.page_id(), &sibling, Node::level(&node) as u32)?;
        let (mut left, mut right, separator) = if child > 0 {
            (sibling, node, child - 1)
        } else {
            (node, sibling, 0)
        };

        let leaf = Node::is_leaf(&left);
        let mut items = Node::items(&left);
        if !leaf {
            items.push(NodeItem::child(
                Node::key_at(parent, separator).to_vec(),
                Node::link(&right),
            ));
        }
        items.extend(Node::items(&right));

        if items_size(&items) <= usable_space(left.len()) {
            Node::write_items(&mut left, &items);
            if leaf {
                Node::set_link(&mut left, Node::link(&right));
            }
            Node::remove_at(parent, separator);
            released.push(right.page_id());
            tracing::trace!(tree = S::NAME, into = %left.page_id(), from = %right.page_id(), "merged nodes");
            return Ok(());
        }

        let split = split_point(&items);
        let mut right_items = items.split_off(split);
        let (new_separator, right_link) = if leaf {
            (right_items[0].key.clone(), Node::link(&right))
        } else {
            let middle = right_items.remove(0);
            let link = middle.child_idx();
            (middle.key, link)
        };
        let payload = Node::payload_at(parent, separator).to_vec();
        if !Node::replace_at(parent, separator, &new_separator, &payload) {
            return Ok(());
        }
        Node::write_items(&mut left, &items);
        Node::write_items(&mut right, &right_items);
        Node::set_link(&mut right, right_link);
        Ok(())
    }

    // =========================================================================
    // Maintenance
    // =========================================================================

    /// Frees every page of the tree, meta page included.
    pub fn destroy(self) -> Result<()> {
        let pages = {
            let _writer = self.writer.lock();
            let _modification = self.begin_modification();
            let (root, _) = self.root_and_height()?;
            let mut pages = Vec::new();
            let mut stack = vec![root];
            while let Some(page_idx) = stack.pop() {
                let page = self.read_node(page_idx)?;
                if !Node::is_leaf(&page) {
                    stack.extend((0..=Node::num_slots(&page)).map(|i| Node::child_at(&page, i)));
                }
                pages.push(page.page_id());
            }
            pages.push(self.meta);
            pages
        };
        for page_id in &pages {
            self.store.free(*page_id)?;
        }
        tracing::debug!(tree = S::NAME, meta = %self.meta, pages = pages.len(), "destroyed tree");
        Ok(())
    }

    /// Checks key order within and across nodes, node levels and the leaf
    /// chain. Returns the number of rows. Intended for a quiescent tree.
    pub fn verify(&self) -> Result<usize> {
        let (root, height) = self.root_and_height()?;
        let mut leaves = Vec::new();
        self.verify_node(root, height - 1, None, None, &mut leaves)?;

        let mut rows = 0;
        for (i, &(page_idx, count, link)) in leaves.iter().enumerate() {
            let expected = leaves.get(i + 1).map_or(0, |next| next.0);
            if link != expected {
                return Err(BasaltError::corrupted_tree(
                    self.node_id(page_idx).as_u64(),
                    format!("leaf links to {} instead of {}", link, expected),
                ));
            }
            rows += count;
        }
        Ok(rows)
    }

    fn verify_node(
        &self,
        page_idx: u32,
        level: u32,
        lower: Option<&[u8]>,
        upper: Option<&[u8]>,
        leaves: &mut Vec<(u32, usize, u32)>,
    ) -> Result<()> {
        let page = self.read_node(page_idx)?;
        Self::expect_level(page.page_id(), &page, level)?;
        let n = Node::num_slots(&page);
        for i in 0..n {
            let key = Node::key_at(&page, i);
            let ordered = i == 0 || S::compare(Node::key_at(&page, i - 1), key) == CmpOrdering::Less;
            let above = lower.map_or(true, |lower| S::compare(key, lower) != CmpOrdering::Less);
            let below = upper.map_or(true, |upper| S::compare(key, upper) == CmpOrdering::Less);
            if !(ordered && above && below) {
                return Err(BasaltError::corrupted_tree(
                    page.page_id().as_u64(),
                    format!("key {} out of order", i),
                ));
            }
        }
        if Node::is_leaf(&page) {
            leaves.push((page_idx, n, Node::link(&page)));
            return Ok(());
        }

        let children: Vec<(u32, Option<Vec<u8>>, Option<Vec<u8>>)> = (0..=n)
            .map(|i| {
                let low = match i {
                    0 => lower.map(<[u8]>::to_vec),
                    _ => Some(Node::key_at(&page, i - 1).to_vec()),
                };
                let high = if i == n {
                    upper.map(<[u8]>::to_vec)
                } else {
                    Some(Node::key_at(&page, i).to_vec())
                };
                (Node::child_at(&page, i), low, high)
            })
            .collect();
        drop(page);
        for (child, low, high) in children {
            self.verify_node(child, level - 1, low.as_deref(), high.as_deref(), leaves)?;
        }
        Ok(())
    }
}

fn below_fill(used: usize, page_size: usize) -> bool {
    (used as f64) < usable_space(page_size) as f64 * MIN_FILL_FACTOR
}

fn take_reserved(reserved: &mut Vec<PageId>) -> Result<PageId> {
    reserved
        .pop()
        .ok_or_else(|| BasaltError::Internal("split needs more pages than reserved".to_string()))
}

// =============================================================================
// Cursor
// =============================================================================

/// Lazy iterator over a key range.
///
/// The cursor buffers the qualifying items of one leaf at a time and holds
/// no latch between calls, so it can be dropped at any point. Moving to the
/// next leaf is validated against the tree's modification epoch; after a
/// concurrent split or merge the cursor re-descends from the last key it
/// returned.
pub struct Cursor<'a, S: TreeSpec> {
    tree: &'a BplusTree<S>,
    lower: Bound<Vec<u8>>,
    upper: Bound<Vec<u8>>,
    buffer: VecDeque<NodeItem>,
    next_leaf: u32,
    epoch: u64,
    last_key: Option<Vec<u8>>,
    started: bool,
    done: bool,
}

impl<'a, S: TreeSpec> Cursor<'a, S> {
    fn new(tree: &'a BplusTree<S>, lower: Bound<Vec<u8>>, upper: Bound<Vec<u8>>) -> Self {
        Self {
            tree,
            lower,
            upper,
            buffer: VecDeque::new(),
            next_leaf: 0,
            epoch: 0,
            last_key: None,
            started: false,
            done: false,
        }
    }

    /// Restarts the cursor at its lower bound.
    pub fn rewind(&mut self) {
        self.buffer.clear();
        self.next_leaf = 0;
        self.last_key = None;
        self.started = false;
        self.done = false;
    }

    fn finish(&mut self) {
        self.buffer.clear();
        self.done = true;
    }

    fn after_start(&self, key: &[u8]) -> bool {
        if let Some(last) = &self.last_key {
            return S::compare(key, last) == CmpOrdering::Greater;
        }
        match &self.lower {
            Bound::Included(lower) => S::compare(key, lower) != CmpOrdering::Less,
            Bound::Excluded(lower) => S::compare(key, lower) == CmpOrdering::Greater,
            Bound::Unbounded => true,
        }
    }

    fn before_end(&self, key: &[u8]) -> bool {
        match &self.upper {
            Bound::Included(upper) => S::compare(key, upper) != CmpOrdering::Greater,
            Bound::Excluded(upper) => S::compare(key, upper) == CmpOrdering::Less,
            Bound::Unbounded => true,
        }
    }

    fn load(&mut self, leaf: &[u8]) {
        self.buffer = Node::items(leaf)
            .into_iter()
            .filter(|item| self.after_start(&item.key))
            .collect();
        self.next_leaf = Node::link(leaf);
    }

    /// Descends to the leaf holding the next key to return.
    fn seek(&mut self) -> Result<()> {
        self.started = true;
        self.epoch = self.tree.stable_epoch();
        let start = match (&self.last_key, &self.lower) {
            (Some(last), _) => Some(last.clone()),
            (None, Bound::Included(lower) | Bound::Excluded(lower)) => Some(lower.clone()),
            (None, Bound::Unbounded) => None,
        };
        let leaf = self.tree.descend_read(start.as_deref())?;
        self.load(&leaf);
        Ok(())
    }

    /// Follows the leaf link, or re-descends if the tree changed shape.
    fn advance(&mut self) -> Result<()> {
        let page = self.tree.store.read(self.tree.node_id(self.next_leaf))?;
        if self.tree.epoch.load(Ordering::Acquire) != self.epoch {
            drop(page);
            return self.seek();
        }
        Node::validate(&page, page.page_id(), S::KIND)?;
        BplusTree::<S>::expect_level(page.page_id(), &page, 0)?;
        self.load(&page);
        Ok(())
    }
}

impl<S: TreeSpec> Iterator for Cursor<'_, S> {
    type Item = Result<S::Row>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.done {
                return None;
            }
            if let Some(item) = self.buffer.pop_front() {
                if !self.before_end(&item.key) {
                    self.finish();
                    return None;
                }
                let row = S::decode(&item.key, &item.payload);
                self.last_key = Some(item.key);
                if row.is_err() {
                    self.finish();
                }
                return Some(row);
            }
            let step = if !self.started {
                self.seek()
            } else if self.next_leaf == 0 {
                self.finish();
                return None;
            } else {
                self.advance()
            };
            if let Err(e) = step {
                self.finish();
                return Some(Err(e));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::seq::SliceRandom;
    use rand::{Rng, SeedableRng};
    use std::collections::BTreeMap;

    /// Test rows: a key and an arbitrary value.
    struct BytesTree;

    impl TreeSpec for BytesTree {
        type Row = (Vec<u8>, Vec<u8>);
        const KIND: u8 = 0x7E;
        const NAME: &'static str = "test";

        fn encode(row: &Self::Row) -> (Vec<u8>, Vec<u8>) {
            row.clone()
        }

        fn decode(key: &[u8], payload: &[u8]) -> Result<Self::Row> {
            Ok((key.to_vec(), payload.to_vec()))
        }
    }

    const PAGE: usize = 1024;

    fn create_tree(frames: usize) -> BplusTree<BytesTree> {
        let store = Arc::new(PageStore::in_memory(PAGE, frames).unwrap());
        store.open_partition(1).unwrap();
        BplusTree::create(store, 1).unwrap()
    }

    fn key(n: u32) -> Vec<u8> {
        n.to_be_bytes().to_vec()
    }

    fn row(n: u32) -> (Vec<u8>, Vec<u8>) {
        (key(n), format!("value-{:06}", n).into_bytes())
    }

    fn keys_of(cursor: Cursor<'_, BytesTree>) -> Vec<u32> {
        cursor
            .map(|row| {
                let (k, _) = row.unwrap();
                u32::from_be_bytes([k[0], k[1], k[2], k[3]])
            })
            .collect()
    }

    #[test]
    fn test_empty_tree() {
        let tree = create_tree(64);
        assert_eq!(tree.height().unwrap(), 1);
        assert!(tree.is_empty().unwrap());
        assert_eq!(tree.find(&key(1)).unwrap(), None);
        assert_eq!(tree.remove(&key(1)).unwrap(), None);
        assert_eq!(tree.iter().count(), 0);
    }

    #[test]
    fn test_insert_find_replace() {
        let tree = create_tree(64);
        assert_eq!(tree.insert(&row(5)).unwrap(), None);
        assert_eq!(tree.find(&key(5)).unwrap(), Some(row(5)));

        let replacement = (key(5), b"other".to_vec());
        assert_eq!(tree.insert(&replacement).unwrap(), Some(row(5)));
        assert_eq!(tree.find(&key(5)).unwrap(), Some(replacement));
        assert_eq!(tree.len().unwrap(), 1);
    }

    #[test]
    fn test_sequential_inserts_split() {
        let tree = create_tree(512);
        for n in 0..2000 {
            tree.insert(&row(n)).unwrap();
        }
        assert!(tree.height().unwrap() >= 3);
        assert_eq!(tree.verify().unwrap(), 2000);
        assert_eq!(keys_of(tree.iter()), (0..2000).collect::<Vec<_>>());
        for n in (0..2000).step_by(97) {
            assert_eq!(tree.find(&key(n)).unwrap(), Some(row(n)));
        }
    }

    #[test]
    fn test_range_bounds() {
        let tree = create_tree(256);
        for n in 0..500 {
            tree.insert(&row(n * 2)).unwrap();
        }
        let k = |n: u32| key(n);

        let inclusive = keys_of(tree.range(Bound::Included(&k(100)), Bound::Included(&k(110))));
        assert_eq!(inclusive, vec![100, 102, 104, 106, 108, 110]);

        let exclusive = keys_of(tree.range(Bound::Excluded(&k(100)), Bound::Excluded(&k(110))));
        assert_eq!(exclusive, vec![102, 104, 106, 108]);

        let between = keys_of(tree.range(Bound::Included(&k(101)), Bound::Excluded(&k(105))));
        assert_eq!(between, vec![102, 104]);

        let tail = keys_of(tree.range(Bound::Excluded(&k(994)), Bound::Unbounded));
        assert_eq!(tail, vec![996, 998]);

        assert!(keys_of(tree.range(Bound::Included(&k(2000)), Bound::Unbounded)).is_empty());
    }

    #[test]
    fn test_prefix_scan() {
        let tree = create_tree(64);
        for (k, v) in [("apple", "1"), ("apricot", "2"), ("banana", "3"), ("ap", "4")] {
            tree.insert(&(k.as_bytes().to_vec(), v.as_bytes().to_vec())).unwrap();
        }
        let found: Vec<_> = tree.prefix(b"ap").map(|r| r.unwrap().0).collect();
        assert_eq!(found, vec![b"ap".to_vec(), b"apple".to_vec(), b"apricot".to_vec()]);
        assert_eq!(prefix_end(b"ap"), Some(b"aq".to_vec()));
        assert_eq!(prefix_end(&[1, 0xFF]), Some(vec![2]));
        assert_eq!(prefix_end(&[0xFF, 0xFF]), None);
    }

    #[test]
    fn test_cursor_rewind() {
        let tree = create_tree(64);
        for n in 0..10 {
            tree.insert(&row(n)).unwrap();
        }
        let mut cursor = tree.iter();
        assert_eq!(cursor.by_ref().take(3).count(), 3);
        cursor.rewind();
        assert_eq!(cursor.count(), 10);
    }

    #[test]
    fn test_remove_merges_and_shrinks() {
        let tree = create_tree(512);
        for n in 0..2000 {
            tree.insert(&row(n)).unwrap();
        }
        let pages_before = tree.store.partition_page_count(1).unwrap();
        for n in 0..2000 {
            if n % 10 != 0 {
                assert_eq!(tree.remove(&key(n)).unwrap(), Some(row(n)));
            }
        }
        assert_eq!(tree.verify().unwrap(), 200);
        assert_eq!(keys_of(tree.iter()), (0..2000).step_by(10).collect::<Vec<_>>());
        assert!(tree.store.free_page_count(1).unwrap() > 0);

        for n in (0..2000).step_by(10) {
            tree.remove(&key(n)).unwrap();
        }
        assert!(tree.is_empty().unwrap());
        assert_eq!(tree.height().unwrap(), 1);
        assert_eq!(tree.verify().unwrap(), 0);
        // Everything but the meta page and the root leaf went back for reuse.
        assert_eq!(
            tree.store.free_page_count(1).unwrap() as u32,
            pages_before - 3
        );
    }

    #[test]
    fn test_randomized_against_btreemap() {
        let tree = create_tree(1024);
        let mut model = BTreeMap::new();
        let mut rng = rand::rngs::StdRng::seed_from_u64(0x5EED);

        for _ in 0..6000 {
            let n = rng.random_range(0..1500u32);
            if rng.random_bool(0.6) {
                let value = vec![rng.random::<u8>(); rng.random_range(0..40)];
                let previous = tree.insert(&(key(n), value.clone())).unwrap();
                assert_eq!(previous.map(|r| r.1), model.insert(key(n), value));
            } else {
                let removed = tree.remove(&key(n)).unwrap();
                assert_eq!(removed.map(|r| r.1), model.remove(&key(n)));
            }
        }

        assert_eq!(tree.verify().unwrap(), model.len());
        let scanned: Vec<_> = tree.iter().map(|r| r.unwrap()).collect();
        let expected: Vec<_> = model.into_iter().collect();
        assert_eq!(scanned, expected);
    }

    #[test]
    fn test_random_order_inserts() {
        let tree = create_tree(512);
        let mut keys: Vec<u32> = (0..1500).collect();
        keys.shuffle(&mut rand::rngs::StdRng::seed_from_u64(7));
        for &n in &keys {
            tree.insert(&row(n)).unwrap();
        }
        assert_eq!(tree.verify().unwrap(), 1500);
        assert_eq!(keys_of(tree.iter()), (0..1500).collect::<Vec<_>>());
    }

    #[test]
    fn test_key_too_large() {
        let tree = create_tree(64);
        let big = (vec![1u8; PAGE / 2], Vec::new());
        assert!(matches!(
            tree.insert(&big),
            Err(BasaltError::KeyTooLarge { .. })
        ));
        assert!(tree.check_row(&big).is_err());
        assert!(tree.is_empty().unwrap());
    }

    #[test]
    fn test_out_of_memory_leaves_tree_intact() {
        let tree = create_tree(16);
        let mut inserted = 0;
        let err = loop {
            match tree.insert(&row(inserted)) {
                Ok(_) => inserted += 1,
                Err(e) => break e,
            }
        };
        assert!(matches!(err, BasaltError::OutOfMemory { .. }));
        assert!(err.is_retryable());
        assert_eq!(tree.verify().unwrap(), inserted as usize);
        assert_eq!(tree.find(&key(inserted)).unwrap(), None);
    }

    #[test]
    fn test_reopen_by_meta_page() {
        let tree = create_tree(256);
        for n in 0..300 {
            tree.insert(&row(n)).unwrap();
        }
        let store = Arc::clone(&tree.store);
        let meta = tree.meta_page();
        drop(tree);

        let reopened = BplusTree::<BytesTree>::open(Arc::clone(&store), meta).unwrap();
        assert_eq!(reopened.len().unwrap(), 300);

        // A tree of another kind refuses the same pages.
        struct OtherTree;
        impl TreeSpec for OtherTree {
            type Row = ();
            const KIND: u8 = 0x7F;
            const NAME: &'static str = "other";
            fn encode(_: &()) -> (Vec<u8>, Vec<u8>) {
                (Vec::new(), Vec::new())
            }
            fn decode(_: &[u8], _: &[u8]) -> Result<()> {
                Ok(())
            }
        }
        assert!(matches!(
            BplusTree::<OtherTree>::open(store, meta),
            Err(BasaltError::CorruptedTree { .. })
        ));
    }

    #[test]
    fn test_corrupted_node_detected() {
        let tree = create_tree(64);
        tree.insert(&row(1)).unwrap();
        let root = tree.root().unwrap();
        {
            let mut page = tree.store.write(root).unwrap();
            page[PageHeader::VERSION_OFFSET] = PAGE_FORMAT_VERSION + 1;
        }
        let err = tree.find(&key(1)).unwrap_err();
        assert!(matches!(err, BasaltError::CorruptedTree { .. }));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_destroy_frees_pages() {
        let tree = create_tree(512);
        for n in 0..1000 {
            tree.insert(&row(n)).unwrap();
        }
        let store = Arc::clone(&tree.store);
        let total = store.partition_page_count(1).unwrap();
        tree.destroy().unwrap();
        // Only the partition header page stays in use.
        assert_eq!(store.free_page_count(1).unwrap() as u32, total - 1);
    }

    #[test]
    fn test_concurrent_readers_during_writes() {
        let tree = Arc::new(create_tree(2048));
        for n in (0..4000).step_by(2) {
            tree.insert(&row(n)).unwrap();
        }

        std::thread::scope(|scope| {
            for _ in 0..4 {
                let tree = Arc::clone(&tree);
                scope.spawn(move || {
                    for _ in 0..5 {
                        let keys = keys_of(tree.iter());
                        assert!(keys.windows(2).all(|w| w[0] < w[1]));
                        // Even keys are never removed.
                        let evens = keys.iter().filter(|k| *k % 2 == 0).count();
                        assert_eq!(evens, 2000);
                    }
                });
            }
            let writer = Arc::clone(&tree);
            scope.spawn(move || {
                for n in (1..4000).step_by(2) {
                    writer.insert(&row(n)).unwrap();
                }
                for n in (1..4000).step_by(2) {
                    writer.remove(&key(n)).unwrap();
                }
            });
        });

        assert_eq!(tree.verify().unwrap(), 2000);
    }
}
