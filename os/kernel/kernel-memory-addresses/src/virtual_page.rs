use crate::{PAGE_SIZE, VirtualAddress, page_align_down};
use core::fmt;

/// Virtual page base (4 KiB).
///
/// ### Invariants
/// - The low 12 bits of the base are always zero.
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct VirtualPage(u64);

impl VirtualPage {
    /// Page that contains `addr` (aligns down to page boundary).
    #[inline]
    #[must_use]
    pub const fn containing_address(addr: VirtualAddress) -> Self {
        Self(page_align_down(addr.as_u64()))
    }

    #[inline]
    #[must_use]
    pub const fn base(self) -> VirtualAddress {
        VirtualAddress::new(self.0)
    }

    /// The page directly above this one.
    #[inline]
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + PAGE_SIZE)
    }
}

impl fmt::Display for VirtualPage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08X}/4K", self.0)
    }
}

impl fmt::Debug for VirtualPage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VirtualPage(0x{:08X})", self.0)
    }
}

impl TryFrom<VirtualAddress> for VirtualPage {
    type Error = ();

    #[inline]
    fn try_from(va: VirtualAddress) -> Result<Self, ()> {
        if va.is_page_aligned() {
            Ok(va.page())
        } else {
            Err(())
        }
    }
}

/// Iterator over consecutive pages, produced by [`VirtualRange::pages`](crate::VirtualRange::pages).
#[derive(Clone, Debug)]
pub struct VirtualPages {
    next: u64,
    end: u64,
}

impl VirtualPages {
    /// Pages `[first, end)`; `end` must be page aligned.
    #[must_use]
    pub const fn new(first: VirtualPage, end: u64) -> Self {
        Self {
            next: first.0,
            end,
        }
    }
}

impl Iterator for VirtualPages {
    type Item = VirtualPage;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next >= self.end {
            return None;
        }
        let page = VirtualPage(self.next);
        self.next = self.next.saturating_add(PAGE_SIZE);
        Some(page)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let n = usize::try_from(self.end.saturating_sub(self.next) / PAGE_SIZE).unwrap_or(usize::MAX);
        (n, Some(n))
    }
}

impl ExactSizeIterator for VirtualPages {}
