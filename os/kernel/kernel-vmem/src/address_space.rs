//! # Address Space
//!
//! The per-environment page table seen through the operations the
//! environment core needs. Implementations own the translation structures;
//! frames are reference counted through the [`FrameAlloc`] passed into each
//! mutating call.
//!
//! ## Invalidation
//!
//! [`AddressSpace::protect`] only rewrites the entry. Callers that downgrade
//! or upgrade permissions of a live mapping must follow up with
//! [`AddressSpace::invalidate`]; `map` and `unmap` invalidate on their own
//! when they replace or remove an existing entry.

use crate::{FrameAlloc, PageFlags};
use kernel_memory_addresses::{PhysicalPage, VirtualPage};

/// A leaf mapping: which frame backs a page, and with what permissions.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct Mapping {
    pub frame: PhysicalPage,
    pub flags: PageFlags,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, thiserror::Error)]
pub enum MapError {
    /// No memory left for translation structures.
    #[error("out of memory for page tables")]
    OutOfMemory,
}

/// One environment's page table.
pub trait AddressSpace {
    /// Map `page → frame` with `flags`, taking one reference to `frame`.
    ///
    /// If `page` was mapped to a different frame, that mapping is removed
    /// first (its frame released, its translation invalidated). Re-mapping the
    /// same frame only updates the permissions.
    ///
    /// # Errors
    /// [`MapError::OutOfMemory`] if translation structures cannot be allocated;
    /// the address space is left unchanged.
    fn map<A: FrameAlloc>(
        &mut self,
        frames: &mut A,
        page: VirtualPage,
        frame: PhysicalPage,
        flags: PageFlags,
    ) -> Result<(), MapError>;

    /// Remove the mapping of `page`, releasing its frame reference.
    /// Returns the removed mapping, if there was one.
    fn unmap<A: FrameAlloc>(&mut self, frames: &mut A, page: VirtualPage) -> Option<Mapping>;

    /// The mapping of `page`, if any.
    fn lookup(&self, page: VirtualPage) -> Option<Mapping>;

    /// Replace the permissions of an existing mapping. Returns `false` if
    /// `page` is not mapped.
    fn protect(&mut self, page: VirtualPage, flags: PageFlags) -> bool;

    /// Drop any cached translation of `page`.
    fn invalidate(&mut self, page: VirtualPage);

    /// All pages currently mapped, in ascending order.
    fn mapped_pages(&self) -> impl Iterator<Item = (VirtualPage, Mapping)> + '_;

    /// Unmap everything, releasing every frame reference.
    fn clear<A: FrameAlloc>(&mut self, frames: &mut A) {
        let pages: alloc::vec::Vec<VirtualPage> = self.mapped_pages().map(|(p, _)| p).collect();
        for page in pages {
            self.unmap(frames, page);
        }
    }
}
