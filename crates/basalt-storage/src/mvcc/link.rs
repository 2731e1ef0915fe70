//! Partition-relative links to data page slots.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Locator of one version fragment: a data page index and a slot within it.
/// The partition is implied by the structure holding the link.
///
/// Page 0 is always the partition header, so the all-zero link never points
/// at data and serves as NULL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct Link {
    pub page_idx: u32,
    pub slot: u16,
}

impl Link {
    /// Encoded size in bytes.
    pub const SIZE: usize = 6;

    /// The null link.
    pub const NULL: Link = Link {
        page_idx: 0,
        slot: 0,
    };

    pub fn new(page_idx: u32, slot: u16) -> Self {
        Self { page_idx, slot }
    }

    pub fn is_null(&self) -> bool {
        self.page_idx == 0
    }

    /// Serializes to bytes (little-endian).
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0..4].copy_from_slice(&self.page_idx.to_le_bytes());
        buf[4..6].copy_from_slice(&self.slot.to_le_bytes());
        buf
    }

    /// Deserializes from the first [`Link::SIZE`] bytes of `buf`.
    pub fn from_bytes(buf: &[u8]) -> Self {
        Self {
            page_idx: u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]),
            slot: u16::from_le_bytes([buf[4], buf[5]]),
        }
    }

    /// Returns the link, or None for NULL.
    pub fn non_null(self) -> Option<Self> {
        (!self.is_null()).then_some(self)
    }
}

impl fmt::Display for Link {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            write!(f, "null")
        } else {
            write!(f, "{}#{}", self.page_idx, self.slot)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_link_bytes() {
        let link = Link::new(0x0102_0304, 7);
        let bytes = link.to_bytes();
        assert_eq!(bytes, [4, 3, 2, 1, 7, 0]);
        assert_eq!(Link::from_bytes(&bytes), link);
    }

    #[test]
    fn test_null_link() {
        assert!(Link::NULL.is_null());
        assert_eq!(Link::from_bytes(&[0; 6]), Link::NULL);
        assert_eq!(Link::NULL.non_null(), None);
        assert_eq!(Link::new(3, 0).non_null(), Some(Link::new(3, 0)));
        assert_eq!(Link::NULL.to_string(), "null");
        assert_eq!(Link::new(3, 2).to_string(), "3#2");
    }
}
