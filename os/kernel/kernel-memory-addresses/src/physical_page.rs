use crate::{PAGE_SHIFT, PAGE_SIZE};
use core::fmt;

/// Physical 4 KiB page frame.
///
/// This is the handle the frame allocator hands out; whoever holds one in a
/// mapping owns one counted reference to it.
///
/// ### Examples
/// ```rust
/// # use kernel_memory_addresses::*;
/// let pp = PhysicalPage::from_index(3);
/// assert_eq!(pp.base(), 3 * PAGE_SIZE);
/// ```
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PhysicalPage(u64);

impl PhysicalPage {
    /// Frame number `index`, i.e. the frame at physical address `index * PAGE_SIZE`.
    #[inline]
    #[must_use]
    pub const fn from_index(index: u64) -> Self {
        Self(index)
    }

    /// Frame that contains the physical address `pa`.
    #[inline]
    #[must_use]
    pub const fn containing(pa: u64) -> Self {
        Self(pa >> PAGE_SHIFT)
    }

    #[inline]
    #[must_use]
    pub const fn index(self) -> u64 {
        self.0
    }

    /// Physical base address of the frame.
    #[inline]
    #[must_use]
    pub const fn base(self) -> u64 {
        self.0 * PAGE_SIZE
    }
}

impl fmt::Display for PhysicalPage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08X}/4K", self.base())
    }
}

impl fmt::Debug for PhysicalPage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PhysicalPage(#{})", self.0)
    }
}
