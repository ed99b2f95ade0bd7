//! # Virtual and Physical Memory Address Types
//!
//! Strongly typed wrappers for the addresses, pages and ranges the
//! environment core passes around.
//!
//! ## Overview
//!
//! | Type | Meaning |
//! |------|---------|
//! | [`VirtualAddress`] | A byte address in an environment's address space. |
//! | [`VirtualPage`] | The 4 KiB aligned page base that contains a virtual address. |
//! | [`VirtualRange`] | A half-open byte range `[start, start + len)` of virtual memory. |
//! | [`PhysicalPage`] | A 4 KiB physical frame, used as the frame handle by the allocator. |
//!
//! Only the 4 KiB base page size is modelled; the core never maps huge pages.
//!
//! ## Typical Usage
//!
//! ```rust
//! # use kernel_memory_addresses::*;
//! let range = VirtualRange::new(VirtualAddress::new(0x0080_0000), 2 * PAGE_SIZE);
//! assert!(range.contains(VirtualAddress::new(0x0080_1FFF)));
//! assert_eq!(range.pages().count(), 2);
//!
//! let (left, right) = range.split_at(VirtualAddress::new(0x0080_1000)).unwrap();
//! assert!(left.is_adjacent_to(&right));
//! ```
//!
//! ## Design Notes
//!
//! - The types are `#[repr(transparent)]` and implement `Copy`, `Eq`, `Ord`,
//!   and `Hash`.
//! - Alignment helpers are `const fn`.

#![cfg_attr(not(any(test, doctest)), no_std)]

mod physical_page;
mod virtual_address;
mod virtual_page;
mod virtual_range;

pub use physical_page::PhysicalPage;
pub use virtual_address::VirtualAddress;
pub use virtual_page::{VirtualPage, VirtualPages};
pub use virtual_range::VirtualRange;

/// Size of the base page in bytes.
pub const PAGE_SIZE: u64 = 4096;

/// log2 of [`PAGE_SIZE`].
pub const PAGE_SHIFT: u32 = 12;

/// Round `x` down to a multiple of [`PAGE_SIZE`].
#[inline]
#[must_use]
pub const fn page_align_down(x: u64) -> u64 {
    x & !(PAGE_SIZE - 1)
}

/// Round `x` up to a multiple of [`PAGE_SIZE`], saturating at the last page.
#[inline]
#[must_use]
pub const fn page_align_up(x: u64) -> u64 {
    match x.checked_add(PAGE_SIZE - 1) {
        Some(v) => v & !(PAGE_SIZE - 1),
        None => page_align_down(u64::MAX),
    }
}
