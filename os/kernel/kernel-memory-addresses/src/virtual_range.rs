use crate::{VirtualAddress, VirtualPages, page_align_up};
use core::fmt;

/// Half-open range of virtual memory, `[start, start + len)`.
///
/// The end is computed with saturation, so a range never wraps around the
/// top of the address space.
///
/// ### Examples
/// ```rust
/// # use kernel_memory_addresses::*;
/// let a = VirtualRange::new(VirtualAddress::new(0x1000), 0x1000);
/// let b = VirtualRange::new(VirtualAddress::new(0x2000), 0x800);
/// assert!(a.is_adjacent_to(&b));
/// assert!(!a.overlaps(&b));
/// ```
#[derive(Copy, Clone, Default, Eq, PartialEq, Hash)]
pub struct VirtualRange {
    start: VirtualAddress,
    len: u64,
}

impl VirtualRange {
    #[inline]
    #[must_use]
    pub const fn new(start: VirtualAddress, len: u64) -> Self {
        Self { start, len }
    }

    /// Range covering `[start, end)`; empty if `end <= start`.
    #[inline]
    #[must_use]
    pub const fn from_bounds(start: VirtualAddress, end: VirtualAddress) -> Self {
        Self::new(start, end.saturating_distance_from(start))
    }

    #[inline]
    #[must_use]
    pub const fn start(&self) -> VirtualAddress {
        self.start
    }

    #[inline]
    #[must_use]
    pub const fn len(&self) -> u64 {
        self.len
    }

    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Exclusive end address.
    #[inline]
    #[must_use]
    pub const fn end(&self) -> VirtualAddress {
        VirtualAddress::new(self.start.as_u64().saturating_add(self.len))
    }

    #[inline]
    #[must_use]
    pub const fn contains(&self, va: VirtualAddress) -> bool {
        self.start.as_u64() <= va.as_u64() && va.as_u64() < self.end().as_u64()
    }

    /// `true` if every byte of `other` lies inside `self`.
    #[inline]
    #[must_use]
    pub const fn contains_range(&self, other: &Self) -> bool {
        self.start.as_u64() <= other.start.as_u64()
            && other.end().as_u64() <= self.end().as_u64()
    }

    #[inline]
    #[must_use]
    pub const fn overlaps(&self, other: &Self) -> bool {
        !self.is_empty()
            && !other.is_empty()
            && self.start.as_u64() < other.end().as_u64()
            && other.start.as_u64() < self.end().as_u64()
    }

    /// `true` if the two ranges touch without overlapping, in either order.
    #[inline]
    #[must_use]
    pub const fn is_adjacent_to(&self, other: &Self) -> bool {
        self.end().as_u64() == other.start.as_u64() || other.end().as_u64() == self.start.as_u64()
    }

    /// Split into `[start, at)` and `[at, end)`. `None` unless `at` lies strictly inside.
    #[must_use]
    pub const fn split_at(&self, at: VirtualAddress) -> Option<(Self, Self)> {
        if at.as_u64() <= self.start.as_u64() || at.as_u64() >= self.end().as_u64() {
            return None;
        }
        let left = at.as_u64() - self.start.as_u64();
        Some((
            Self::new(self.start, left),
            Self::new(at, self.len - left),
        ))
    }

    /// Every page that holds at least one byte of the range.
    #[must_use]
    pub const fn pages(&self) -> VirtualPages {
        let end = if self.is_empty() {
            self.start.page().base().as_u64()
        } else {
            page_align_up(self.end().as_u64())
        };
        VirtualPages::new(self.start.page(), end)
    }
}

impl fmt::Debug for VirtualRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VirtualRange({}..{})", self.start, self.end())
    }
}

impl fmt::Display for VirtualRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} - {} ({:#x})", self.start, self.end(), self.len)
    }
}
