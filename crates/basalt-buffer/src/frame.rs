//! Page frames.

use basalt_common::page::PageId;
use parking_lot::lock_api::{ArcRwLockReadGuard, ArcRwLockWriteGuard};
use parking_lot::{RawRwLock, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

/// Sentinel value indicating no page is loaded in the frame.
const NO_PAGE: u64 = u64::MAX;

/// Owned shared latch on a frame's page bytes.
pub type FrameReadGuard = ArcRwLockReadGuard<RawRwLock, Box<[u8]>>;

/// Owned exclusive latch on a frame's page bytes.
pub type FrameWriteGuard = ArcRwLockWriteGuard<RawRwLock, Box<[u8]>>;

/// Unique identifier for a frame in the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FrameId(pub u32);

impl std::fmt::Display for FrameId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "frame:{}", self.0)
    }
}

/// A frame holding a single page.
///
/// The page bytes sit behind a reader-writer lock that doubles as the page
/// latch. A frame may only be recycled while it is unpinned and clean.
pub struct Frame {
    /// Frame identifier.
    frame_id: FrameId,
    /// The page currently stored in this frame (packed, NO_PAGE = none).
    page_id: AtomicU64,
    /// Page bytes and latch.
    data: Arc<RwLock<Box<[u8]>>>,
    /// Number of handles currently holding this page.
    pin_count: AtomicU32,
    /// Whether the page has changes not yet checkpointed.
    dirty: AtomicBool,
    /// Bumped on every modification; lets a checkpoint tell whether the
    /// page changed again after its snapshot was taken.
    dirty_gen: AtomicU64,
}

impl Frame {
    /// Creates a new empty frame.
    pub fn new(frame_id: FrameId, page_size: usize) -> Self {
        Self {
            frame_id,
            page_id: AtomicU64::new(NO_PAGE),
            data: Arc::new(RwLock::new(vec![0u8; page_size].into_boxed_slice())),
            pin_count: AtomicU32::new(0),
            dirty: AtomicBool::new(false),
            dirty_gen: AtomicU64::new(0),
        }
    }

    /// Returns the frame ID.
    #[inline]
    pub fn frame_id(&self) -> FrameId {
        self.frame_id
    }

    /// Returns the page ID currently stored in this frame.
    #[inline]
    pub fn page_id(&self) -> Option<PageId> {
        let packed = self.page_id.load(Ordering::Acquire);
        if packed == NO_PAGE {
            None
        } else {
            Some(PageId::from_u64(packed))
        }
    }

    /// Sets the page ID for this frame.
    #[inline]
    pub fn set_page_id(&self, page_id: Option<PageId>) {
        let packed = page_id.map(|p| p.as_u64()).unwrap_or(NO_PAGE);
        self.page_id.store(packed, Ordering::Release);
    }

    /// Returns the current pin count.
    #[inline]
    pub fn pin_count(&self) -> u32 {
        self.pin_count.load(Ordering::Acquire)
    }

    /// Increments the pin count and returns the previous pin count.
    #[inline]
    pub fn pin(&self) -> u32 {
        self.pin_count.fetch_add(1, Ordering::AcqRel)
    }

    /// Decrements the pin count and returns the new pin count.
    #[inline]
    pub fn unpin(&self) -> u32 {
        let prev = self.pin_count.fetch_sub(1, Ordering::AcqRel);
        if prev == 0 {
            // Underflow protection: restore to 0
            self.pin_count.store(0, Ordering::Release);
            return 0;
        }
        prev - 1
    }

    /// Returns true if this frame is pinned.
    #[inline]
    pub fn is_pinned(&self) -> bool {
        self.pin_count() > 0
    }

    /// Returns true if this frame is dirty.
    #[inline]
    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    /// Marks the frame dirty. Returns true if it was clean before.
    #[inline]
    pub fn mark_dirty(&self) -> bool {
        self.dirty_gen.fetch_add(1, Ordering::AcqRel);
        !self.dirty.swap(true, Ordering::AcqRel)
    }

    /// Returns the modification generation.
    #[inline]
    pub fn dirty_generation(&self) -> u64 {
        self.dirty_gen.load(Ordering::Acquire)
    }

    /// Clears the dirty flag if the page was not modified since `generation`
    /// was read. Returns true if the flag was cleared.
    #[inline]
    pub fn clear_dirty_if(&self, generation: u64) -> bool {
        if self.dirty_gen.load(Ordering::Acquire) != generation {
            return false;
        }
        self.dirty.swap(false, Ordering::AcqRel)
    }

    /// Returns true if this frame is empty (no page loaded).
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.page_id.load(Ordering::Acquire) == NO_PAGE
    }

    /// Takes a shared latch borrowing the frame.
    #[inline]
    pub fn read(&self) -> RwLockReadGuard<'_, Box<[u8]>> {
        self.data.read()
    }

    /// Takes an exclusive latch borrowing the frame.
    #[inline]
    pub fn write(&self) -> RwLockWriteGuard<'_, Box<[u8]>> {
        self.data.write()
    }

    /// Takes an owned shared latch.
    #[inline]
    pub fn read_arc(&self) -> FrameReadGuard {
        self.data.read_arc()
    }

    /// Takes an owned exclusive latch.
    #[inline]
    pub fn write_arc(&self) -> FrameWriteGuard {
        self.data.write_arc()
    }

    /// Resets the frame to empty state.
    pub fn reset(&self) {
        self.page_id.store(NO_PAGE, Ordering::Release);
        self.pin_count.store(0, Ordering::Release);
        self.dirty.store(false, Ordering::Release);
        self.data.write().fill(0);
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("frame_id", &self.frame_id)
            .field("page_id", &self.page_id())
            .field("pin_count", &self.pin_count())
            .field("dirty", &self.is_dirty())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_new() {
        let frame = Frame::new(FrameId(3), 4096);
        assert_eq!(frame.frame_id(), FrameId(3));
        assert!(frame.is_empty());
        assert!(frame.page_id().is_none());
        assert!(!frame.is_pinned());
        assert!(!frame.is_dirty());
        assert_eq!(frame.read().len(), 4096);
    }

    #[test]
    fn test_frame_page_id() {
        let frame = Frame::new(FrameId(0), 1024);
        frame.set_page_id(Some(PageId::new(4, 9)));
        assert_eq!(frame.page_id(), Some(PageId::new(4, 9)));
        frame.set_page_id(None);
        assert!(frame.is_empty());
    }

    #[test]
    fn test_pin_unpin() {
        let frame = Frame::new(FrameId(0), 1024);
        assert_eq!(frame.pin(), 0);
        assert_eq!(frame.pin(), 1);
        assert_eq!(frame.unpin(), 1);
        assert_eq!(frame.unpin(), 0);
        // Underflow is clamped
        assert_eq!(frame.unpin(), 0);
        assert_eq!(frame.pin_count(), 0);
    }

    #[test]
    fn test_dirty_generation() {
        let frame = Frame::new(FrameId(0), 1024);
        assert!(frame.mark_dirty());
        assert!(!frame.mark_dirty());
        let generation = frame.dirty_generation();

        // Modified again after the snapshot: must stay dirty
        frame.mark_dirty();
        assert!(!frame.clear_dirty_if(generation));
        assert!(frame.is_dirty());

        let generation = frame.dirty_generation();
        assert!(frame.clear_dirty_if(generation));
        assert!(!frame.is_dirty());
    }

    #[test]
    fn test_owned_latches() {
        let frame = Frame::new(FrameId(0), 1024);
        {
            let mut guard = frame.write_arc();
            guard[0] = 0xAB;
        }
        let a = frame.read_arc();
        let b = frame.read_arc();
        assert_eq!(a[0], 0xAB);
        assert_eq!(b[0], 0xAB);
    }

    #[test]
    fn test_reset() {
        let frame = Frame::new(FrameId(1), 1024);
        frame.set_page_id(Some(PageId::new(1, 1)));
        frame.pin();
        frame.mark_dirty();
        frame.write()[10] = 7;

        frame.reset();
        assert!(frame.is_empty());
        assert!(!frame.is_pinned());
        assert!(!frame.is_dirty());
        assert_eq!(frame.read()[10], 0);
    }
}
