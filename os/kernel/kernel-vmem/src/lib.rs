//! # Virtual Memory Support
//!
//! The seams between the environment core and the machine's memory
//! hardware:
//!
//! - [`PageFlags`]: permission bits of a page mapping and of a region.
//! - [`FrameAlloc`]: the physical frame allocator with per-frame reference
//!   counts.
//! - [`AddressSpace`](address_space::AddressSpace): one environment's page
//!   table (map, unmap, lookup, protect, invalidate).
//! - [`PageMap`](page_map::PageMap): a software page table implementing
//!   `AddressSpace`, used on hosts and in tests.
//!
//! ## Reference counting contract
//!
//! ```text
//!   allocate()  ──► frame, count 0
//!   map()       ──► count + 1   (the mapping owns one reference)
//!   unmap()     ──► count - 1   (reclaimed by the allocator at 0)
//! ```
//!
//! A frame mapped into two address spaces (fork, shared memory) therefore has
//! a count of two, which is exactly what the copy-on-write fault path inspects.

#![cfg_attr(not(any(test, doctest)), no_std)]

extern crate alloc;

pub mod address_space;
pub mod page_map;

pub use crate::address_space::{AddressSpace, MapError, Mapping};
pub use crate::page_map::PageMap;
pub use kernel_memory_addresses::{PAGE_SIZE, PhysicalPage, VirtualAddress, VirtualPage};

use core::fmt;

bitflags::bitflags! {
    /// Access permissions of a page mapping or a memory region.
    ///
    /// `USER` marks memory accessible from user mode; the region manager
    /// sets it on every region it creates.
    #[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
    pub struct PageFlags: u8 {
        /// Page may be read.
        const READ  = 1 << 0;
        /// Page may be written. Cleared on copy-on-write sharing.
        const WRITE = 1 << 1;
        /// Page may be executed.
        const EXEC  = 1 << 2;
        /// Page is accessible from user mode.
        const USER  = 1 << 3;
    }
}

impl PageFlags {
    /// Read + write, the usual permissions for data regions.
    pub const RW: Self = Self::READ.union(Self::WRITE);

    #[inline]
    #[must_use]
    pub const fn is_writable(self) -> bool {
        self.contains(Self::WRITE)
    }

    /// The same permissions with write access removed.
    #[inline]
    #[must_use]
    pub const fn read_only(self) -> Self {
        self.difference(Self::WRITE)
    }
}

impl fmt::Display for PageFlags {
    /// `RWEU`-style rendering, dashes for absent bits.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bit = |flag, c| if self.contains(flag) { c } else { '-' };
        write!(
            f,
            "{}{}{}{}",
            bit(Self::READ, 'R'),
            bit(Self::WRITE, 'W'),
            bit(Self::EXEC, 'E'),
            bit(Self::USER, 'U')
        )
    }
}

/// Initial contents of a freshly allocated frame.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum FrameFill {
    /// Zero-filled.
    Zeroed,
    /// Whatever the frame held before; the caller overwrites it.
    Uninit,
}

/// Physical frame allocator with per-frame reference counts.
///
/// Frames come back from [`allocate`](Self::allocate) with a count of zero;
/// each owner (usually a page mapping) takes a reference with
/// [`retain`](Self::retain) and gives it back with [`release`](Self::release).
pub trait FrameAlloc {
    /// Allocate one 4 KiB frame. Returns `None` on out-of-memory.
    fn allocate(&mut self, fill: FrameFill) -> Option<PhysicalPage>;

    /// Take one more reference to `frame`.
    fn retain(&mut self, frame: PhysicalPage);

    /// Drop one reference to `frame`. The frame is reclaimed once no
    /// references remain; releasing a frame whose count is already zero
    /// (allocated but never retained) reclaims it too.
    fn release(&mut self, frame: PhysicalPage);

    /// Current number of references to `frame`.
    fn ref_count(&self, frame: PhysicalPage) -> usize;

    /// The frame's contents.
    fn bytes(&self, frame: PhysicalPage) -> &[u8];

    /// The frame's contents, writable.
    fn bytes_mut(&mut self, frame: PhysicalPage) -> &mut [u8];

    /// Copy the full contents of `src` into `dst`.
    #[allow(clippy::cast_possible_truncation)]
    fn copy_frame(&mut self, src: PhysicalPage, dst: PhysicalPage) {
        let mut buf = [0u8; PAGE_SIZE as usize];
        buf.copy_from_slice(&self.bytes(src)[..PAGE_SIZE as usize]);
        self.bytes_mut(dst)[..PAGE_SIZE as usize].copy_from_slice(&buf);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_render_like_permission_strings() {
        assert_eq!(PageFlags::RW.to_string(), "RW--");
        assert_eq!((PageFlags::READ | PageFlags::EXEC | PageFlags::USER).to_string(), "R-EU");
        assert_eq!(PageFlags::empty().to_string(), "----");
    }

    #[test]
    fn read_only_strips_write_only() {
        let f = PageFlags::RW | PageFlags::USER;
        assert_eq!(f.read_only(), PageFlags::READ | PageFlags::USER);
        assert!(!f.read_only().is_writable());
    }
}
