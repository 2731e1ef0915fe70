//! Page replacement policies for the frame pool.

use crate::frame::FrameId;
use basalt_common::config::EvictionPolicy;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};

/// Trait for page replacement algorithms.
///
/// A replacer tracks frames that hold a page. The pool decides whether a
/// candidate can actually be recycled (unpinned and clean) through the
/// predicate passed to `evict`.
pub trait Replacer: Send + Sync {
    /// Records that the given frame was accessed, tracking it if new.
    fn record_access(&self, frame_id: FrameId);

    /// Selects and stops tracking a victim accepted by `can_evict`.
    ///
    /// Returns None if no tracked frame is accepted.
    fn evict(&self, can_evict: &mut dyn FnMut(FrameId) -> bool) -> Option<FrameId>;

    /// Stops tracking a frame.
    fn remove(&self, frame_id: FrameId);

    /// Returns the number of tracked frames.
    fn size(&self) -> usize;
}

/// Builds the replacer for a policy.
pub fn replacer_for(policy: EvictionPolicy, num_frames: usize) -> Box<dyn Replacer> {
    match policy {
        EvictionPolicy::Clock => Box::new(ClockReplacer::new(num_frames)),
        EvictionPolicy::Lru => Box::new(LruReplacer::new()),
    }
}

/// Clock replacement algorithm implementation.
///
/// The clock hand sweeps tracked frames. A frame with its reference bit set
/// gets a second chance: the bit is cleared and the hand moves on. Frames
/// rejected by the predicate are skipped without losing their place.
pub struct ClockReplacer {
    /// Internal state protected by mutex.
    inner: Mutex<ClockReplacerInner>,
}

struct ClockReplacerInner {
    /// Reference bit per frame, None when the frame is not tracked.
    slots: Vec<Option<bool>>,
    /// Number of tracked frames.
    tracked: usize,
    /// Current clock hand position.
    clock_hand: usize,
}

impl ClockReplacer {
    /// Creates a new clock replacer with the given number of frames.
    pub fn new(num_frames: usize) -> Self {
        Self {
            inner: Mutex::new(ClockReplacerInner {
                slots: vec![None; num_frames],
                tracked: 0,
                clock_hand: 0,
            }),
        }
    }

    /// Returns the total capacity.
    pub fn capacity(&self) -> usize {
        self.inner.lock().slots.len()
    }
}

impl Replacer for ClockReplacer {
    fn record_access(&self, frame_id: FrameId) {
        let mut inner = self.inner.lock();
        let idx = frame_id.0 as usize;
        if idx >= inner.slots.len() {
            return;
        }
        if inner.slots[idx].is_none() {
            inner.tracked += 1;
        }
        inner.slots[idx] = Some(true);
    }

    fn evict(&self, can_evict: &mut dyn FnMut(FrameId) -> bool) -> Option<FrameId> {
        let mut inner = self.inner.lock();
        let num_frames = inner.slots.len();
        if inner.tracked == 0 || num_frames == 0 {
            return None;
        }

        // Two full rotations: the first may only clear reference bits
        for _ in 0..(2 * num_frames) {
            let hand = inner.clock_hand;
            inner.clock_hand = (hand + 1) % num_frames;

            match inner.slots[hand] {
                Some(true) => inner.slots[hand] = Some(false),
                Some(false) => {
                    let frame_id = FrameId(hand as u32);
                    if can_evict(frame_id) {
                        inner.slots[hand] = None;
                        inner.tracked -= 1;
                        return Some(frame_id);
                    }
                }
                None => {}
            }
        }
        None
    }

    fn remove(&self, frame_id: FrameId) {
        let mut inner = self.inner.lock();
        let idx = frame_id.0 as usize;
        if idx < inner.slots.len() && inner.slots[idx].take().is_some() {
            inner.tracked -= 1;
        }
    }

    fn size(&self) -> usize {
        self.inner.lock().tracked
    }
}

/// Least-recently-used replacement.
///
/// Every access stamps the frame with a monotonically increasing tick; the
/// victim is the accepted frame with the oldest stamp.
pub struct LruReplacer {
    inner: Mutex<LruReplacerInner>,
}

#[derive(Default)]
struct LruReplacerInner {
    tick: u64,
    last_access: HashMap<FrameId, u64>,
    order: BTreeMap<u64, FrameId>,
}

impl LruReplacer {
    /// Creates an empty LRU replacer.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(LruReplacerInner::default()),
        }
    }
}

impl Default for LruReplacer {
    fn default() -> Self {
        Self::new()
    }
}

impl Replacer for LruReplacer {
    fn record_access(&self, frame_id: FrameId) {
        let mut inner = self.inner.lock();
        inner.tick += 1;
        let tick = inner.tick;
        if let Some(old) = inner.last_access.insert(frame_id, tick) {
            inner.order.remove(&old);
        }
        inner.order.insert(tick, frame_id);
    }

    fn evict(&self, can_evict: &mut dyn FnMut(FrameId) -> bool) -> Option<FrameId> {
        let mut inner = self.inner.lock();
        let victim = inner
            .order
            .iter()
            .find(|(_, frame_id)| can_evict(**frame_id))
            .map(|(tick, frame_id)| (*tick, *frame_id));

        let (tick, frame_id) = victim?;
        inner.order.remove(&tick);
        inner.last_access.remove(&frame_id);
        Some(frame_id)
    }

    fn remove(&self, frame_id: FrameId) {
        let mut inner = self.inner.lock();
        if let Some(tick) = inner.last_access.remove(&frame_id) {
            inner.order.remove(&tick);
        }
    }

    fn size(&self) -> usize {
        self.inner.lock().last_access.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn any(_: FrameId) -> bool {
        true
    }

    #[test]
    fn test_clock_replacer_new() {
        let replacer = ClockReplacer::new(10);
        assert_eq!(replacer.capacity(), 10);
        assert_eq!(replacer.size(), 0);
        assert!(replacer.evict(&mut any).is_none());
    }

    #[test]
    fn test_clock_replacer_evict_single() {
        let replacer = ClockReplacer::new(10);
        replacer.record_access(FrameId(5));
        assert_eq!(replacer.size(), 1);

        assert_eq!(replacer.evict(&mut any), Some(FrameId(5)));
        assert_eq!(replacer.size(), 0);
    }

    #[test]
    fn test_clock_replacer_second_chance() {
        let replacer = ClockReplacer::new(3);
        for i in 0..3 {
            replacer.record_access(FrameId(i));
        }
        // First sweep clears all bits, frame 0 is the first with a clear bit
        assert_eq!(replacer.evict(&mut any), Some(FrameId(0)));

        // Frame 1 is touched again and gets another chance
        replacer.record_access(FrameId(1));
        assert_eq!(replacer.evict(&mut any), Some(FrameId(2)));
        assert_eq!(replacer.evict(&mut any), Some(FrameId(1)));
    }

    #[test]
    fn test_clock_replacer_skips_rejected() {
        let replacer = ClockReplacer::new(4);
        for i in 0..4 {
            replacer.record_access(FrameId(i));
        }
        let victim = replacer.evict(&mut |f: FrameId| f == FrameId(2));
        assert_eq!(victim, Some(FrameId(2)));
        assert_eq!(replacer.size(), 3);

        // Nothing acceptable
        assert!(replacer.evict(&mut |_| false).is_none());
        assert_eq!(replacer.size(), 3);
    }

    #[test]
    fn test_clock_replacer_remove() {
        let replacer = ClockReplacer::new(10);
        replacer.record_access(FrameId(0));
        replacer.record_access(FrameId(1));
        replacer.remove(FrameId(0));
        replacer.remove(FrameId(0));
        assert_eq!(replacer.size(), 1);
        assert_eq!(replacer.evict(&mut any), Some(FrameId(1)));
    }

    #[test]
    fn test_clock_replacer_out_of_bounds() {
        let replacer = ClockReplacer::new(5);
        replacer.record_access(FrameId(100));
        replacer.remove(FrameId(100));
        assert_eq!(replacer.size(), 0);
    }

    #[test]
    fn test_lru_evicts_oldest() {
        let replacer = LruReplacer::new();
        for i in 0..4 {
            replacer.record_access(FrameId(i));
        }
        replacer.record_access(FrameId(0));

        assert_eq!(replacer.evict(&mut any), Some(FrameId(1)));
        assert_eq!(replacer.evict(&mut any), Some(FrameId(2)));
        assert_eq!(replacer.size(), 2);
    }

    #[test]
    fn test_lru_skips_rejected() {
        let replacer = LruReplacer::new();
        for i in 0..3 {
            replacer.record_access(FrameId(i));
        }
        let victim = replacer.evict(&mut |f: FrameId| f != FrameId(0));
        assert_eq!(victim, Some(FrameId(1)));

        replacer.remove(FrameId(2));
        assert_eq!(replacer.size(), 1);
        assert!(replacer.evict(&mut |_| false).is_none());
    }

    /// Drives a replacer with random accesses, removals and evictions under
    /// a random pin set, checking it against a list of tracked frames in
    /// access order.
    fn run_random_workload(replacer: &dyn Replacer, frames: u32, seed: u64, exact_lru: bool) {
        use rand::{Rng, SeedableRng};

        let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
        let mut tracked: Vec<FrameId> = Vec::new();
        for _ in 0..5000 {
            let frame = FrameId(rng.random_range(0..frames));
            match rng.random_range(0..10) {
                0..=5 => {
                    replacer.record_access(frame);
                    tracked.retain(|f| *f != frame);
                    tracked.push(frame);
                }
                6 => {
                    replacer.remove(frame);
                    tracked.retain(|f| *f != frame);
                }
                _ => {
                    let pinned: Vec<bool> = (0..frames).map(|_| rng.random_bool(0.3)).collect();
                    let victim = replacer.evict(&mut |f: FrameId| !pinned[f.0 as usize]);
                    let candidates: Vec<FrameId> =
                        tracked.iter().copied().filter(|f| !pinned[f.0 as usize]).collect();
                    match victim {
                        Some(victim) => {
                            assert!(candidates.contains(&victim), "evicted {:?}", victim);
                            if exact_lru {
                                assert_eq!(victim, candidates[0]);
                            }
                            tracked.retain(|f| *f != victim);
                        }
                        None => assert!(candidates.is_empty()),
                    }
                }
            }
            assert_eq!(replacer.size(), tracked.len());
        }
    }

    #[test]
    fn test_clock_replacer_random_workload() {
        for seed in [1, 2, 3] {
            run_random_workload(&ClockReplacer::new(32), 32, seed, false);
        }
    }

    #[test]
    fn test_lru_replacer_random_workload() {
        for seed in [1, 2, 3] {
            run_random_workload(&LruReplacer::new(), 32, seed, true);
        }
    }

    #[test]
    fn test_replacer_for_policy() {
        let clock = replacer_for(EvictionPolicy::Clock, 8);
        let lru = replacer_for(EvictionPolicy::Lru, 8);
        clock.record_access(FrameId(1));
        lru.record_access(FrameId(1));
        assert_eq!(clock.size(), 1);
        assert_eq!(lru.size(), 1);
    }
}
