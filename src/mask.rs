//! Window identifiers and bitsets
//!
//! Hardware windows are addressed by a small integer index. A set of windows
//! fits in a single machine word, so every allocator operation is a handful of
//! bit tricks on a `u32`.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{BitAnd, BitAndAssign, BitOr, BitOrAssign, Not, Sub};

/// Largest pool the allocator can address (one bit per window in a `u32`)
pub const MAX_WINDOWS: u8 = 32;

/// Index of a hardware window inside the pool
pub type WindowId = u8;

/// A set of hardware windows
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WindowMask(u32);

impl WindowMask {
    /// The empty set
    pub const EMPTY: WindowMask = WindowMask(0);

    /// Wraps raw bits
    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    /// Every window of a pool with `count` windows
    pub fn full(count: u8) -> Self {
        debug_assert!(count <= MAX_WINDOWS);
        if count >= MAX_WINDOWS {
            Self(u32::MAX)
        } else {
            Self((1u32 << count) - 1)
        }
    }

    /// Set containing a single window
    pub fn single(id: WindowId) -> Self {
        debug_assert!(id < MAX_WINDOWS);
        Self(1u32 << id)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Number of windows in the set
    pub const fn count(self) -> u32 {
        self.0.count_ones()
    }

    pub const fn contains(self, id: WindowId) -> bool {
        id < MAX_WINDOWS && self.0 & (1u32 << id) != 0
    }

    pub const fn is_disjoint(self, other: WindowMask) -> bool {
        self.0 & other.0 == 0
    }

    pub const fn is_subset(self, other: WindowMask) -> bool {
        self.0 & !other.0 == 0
    }

    /// Lowest window in the set
    pub fn lowest(self) -> Option<WindowId> {
        if self.0 == 0 {
            None
        } else {
            Some(self.0.trailing_zeros() as WindowId)
        }
    }

    /// Picks `count` windows scanning from the lowest set bit upward.
    ///
    /// Returns the picked windows, or `None` when the set holds fewer than
    /// `count` windows. The selection is deterministic: the same input always
    /// yields the same windows.
    pub fn take_lowest(self, count: u32) -> Option<WindowMask> {
        if self.count() < count {
            return None;
        }

        let mut remaining = self.0;
        let mut picked = 0u32;
        for _ in 0..count {
            let bit = remaining & remaining.wrapping_neg();
            picked |= bit;
            remaining &= !bit;
        }
        Some(Self(picked))
    }

    /// Iterates window ids in ascending order
    pub fn iter(self) -> WindowIter {
        WindowIter(self.0)
    }
}

/// Ascending iterator over the windows of a [`WindowMask`]
#[derive(Debug, Clone)]
pub struct WindowIter(u32);

impl Iterator for WindowIter {
    type Item = WindowId;

    fn next(&mut self) -> Option<WindowId> {
        if self.0 == 0 {
            return None;
        }
        let id = self.0.trailing_zeros() as WindowId;
        self.0 &= self.0 - 1;
        Some(id)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let n = self.0.count_ones() as usize;
        (n, Some(n))
    }
}

impl ExactSizeIterator for WindowIter {}

impl IntoIterator for WindowMask {
    type Item = WindowId;
    type IntoIter = WindowIter;

    fn into_iter(self) -> WindowIter {
        self.iter()
    }
}

impl FromIterator<WindowId> for WindowMask {
    fn from_iter<I: IntoIterator<Item = WindowId>>(iter: I) -> Self {
        iter.into_iter()
            .fold(WindowMask::EMPTY, |mask, id| mask | WindowMask::single(id))
    }
}

impl BitOr for WindowMask {
    type Output = WindowMask;

    fn bitor(self, rhs: WindowMask) -> WindowMask {
        WindowMask(self.0 | rhs.0)
    }
}

impl BitOrAssign for WindowMask {
    fn bitor_assign(&mut self, rhs: WindowMask) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for WindowMask {
    type Output = WindowMask;

    fn bitand(self, rhs: WindowMask) -> WindowMask {
        WindowMask(self.0 & rhs.0)
    }
}

impl BitAndAssign for WindowMask {
    fn bitand_assign(&mut self, rhs: WindowMask) {
        self.0 &= rhs.0;
    }
}

impl Not for WindowMask {
    type Output = WindowMask;

    fn not(self) -> WindowMask {
        WindowMask(!self.0)
    }
}

/// Set difference
impl Sub for WindowMask {
    type Output = WindowMask;

    fn sub(self, rhs: WindowMask) -> WindowMask {
        WindowMask(self.0 & !rhs.0)
    }
}

impl fmt::Display for WindowMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010b}", self.0)
    }
}
