//! Hybrid logical timestamps.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Number of low bits holding the logical counter.
const LOGICAL_BITS: u32 = 16;
const LOGICAL_MASK: u64 = (1 << LOGICAL_BITS) - 1;

/// A totally ordered timestamp made of wall-clock milliseconds and a
/// logical counter.
///
/// Packed as `physical << 16 | logical`, so comparing the packed value
/// compares physical time first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct HybridTimestamp(u64);

impl HybridTimestamp {
    /// Smallest timestamp.
    pub const MIN: HybridTimestamp = HybridTimestamp(0);

    /// Largest timestamp. Reading at MAX observes the latest committed state.
    pub const MAX: HybridTimestamp = HybridTimestamp(u64::MAX);

    /// Encoded size in bytes.
    pub const SIZE: usize = 8;

    /// Creates a timestamp from its physical and logical parts.
    pub fn new(physical_ms: u64, logical: u16) -> Self {
        Self((physical_ms << LOGICAL_BITS) | logical as u64)
    }

    /// Wraps a packed value.
    pub const fn from_u64(value: u64) -> Self {
        Self(value)
    }

    /// Returns the packed value.
    pub const fn as_u64(&self) -> u64 {
        self.0
    }

    /// Returns wall-clock milliseconds.
    pub fn physical(&self) -> u64 {
        self.0 >> LOGICAL_BITS
    }

    /// Returns the logical counter.
    pub fn logical(&self) -> u16 {
        (self.0 & LOGICAL_MASK) as u16
    }

    /// Returns the next timestamp in the total order.
    pub fn tick(&self) -> Self {
        Self(self.0.saturating_add(1))
    }

    /// Big-endian encoding, which sorts the same as the timestamp.
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        self.0.to_be_bytes()
    }

    /// Decodes a big-endian timestamp.
    pub fn from_bytes(buf: &[u8]) -> Self {
        let mut raw = [0u8; Self::SIZE];
        raw.copy_from_slice(&buf[..Self::SIZE]);
        Self(u64::from_be_bytes(raw))
    }
}

impl std::fmt::Display for HybridTimestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.physical(), self.logical())
    }
}

/// Issues strictly increasing hybrid timestamps.
#[derive(Debug, Default)]
pub struct HybridClock {
    last: AtomicU64,
}

impl HybridClock {
    /// Creates a clock.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a timestamp greater than every timestamp issued or observed so far.
    pub fn now(&self) -> HybridTimestamp {
        let wall = HybridTimestamp::new(wall_clock_ms(), 0).as_u64();
        let mut prev = self.last.load(Ordering::Acquire);
        loop {
            let next = wall.max(prev.saturating_add(1));
            match self
                .last
                .compare_exchange_weak(prev, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return HybridTimestamp(next),
                Err(actual) => prev = actual,
            }
        }
    }

    /// Advances the clock past a timestamp received from another node.
    pub fn update(&self, observed: HybridTimestamp) {
        self.last.fetch_max(observed.as_u64(), Ordering::AcqRel);
    }
}

fn wall_clock_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parts() {
        let ts = HybridTimestamp::new(1_700_000_000_000, 42);
        assert_eq!(ts.physical(), 1_700_000_000_000);
        assert_eq!(ts.logical(), 42);
        assert_eq!(ts.to_string(), "1700000000000.42");
    }

    #[test]
    fn test_ordering_physical_first() {
        let a = HybridTimestamp::new(10, u16::MAX);
        let b = HybridTimestamp::new(11, 0);
        assert!(a < b);
        assert!(HybridTimestamp::MIN < a);
        assert!(b < HybridTimestamp::MAX);
    }

    #[test]
    fn test_bytes_sort_like_timestamps() {
        let a = HybridTimestamp::new(5, 1);
        let b = HybridTimestamp::new(5, 2);
        assert!(a.to_bytes() < b.to_bytes());
        assert_eq!(HybridTimestamp::from_bytes(&b.to_bytes()), b);
    }

    #[test]
    fn test_clock_is_strictly_increasing() {
        let clock = HybridClock::new();
        let mut prev = clock.now();
        for _ in 0..1000 {
            let next = clock.now();
            assert!(next > prev);
            prev = next;
        }
    }

    #[test]
    fn test_clock_update_moves_forward() {
        let clock = HybridClock::new();
        let far = HybridTimestamp::new(wall_clock_ms() + 60_000, 7);
        clock.update(far);
        assert!(clock.now() > far);
    }
}
