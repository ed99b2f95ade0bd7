//! # Software Page Map
//!
//! A page table kept as an ordered map from virtual page to [`Mapping`].
//! It implements [`AddressSpace`] without touching hardware, which is what a
//! hosted kernel (and every test in this workspace) runs on.
//!
//! Besides translations it records which pages were invalidated so callers
//! can check that TLB maintenance happened where it had to. The record holds
//! each page at most once.

use crate::address_space::{AddressSpace, MapError, Mapping};
use crate::{FrameAlloc, PageFlags};
use alloc::collections::{BTreeMap, BTreeSet};
use kernel_memory_addresses::{PhysicalPage, VirtualPage};
use log::trace;

#[derive(Debug, Default)]
pub struct PageMap {
    entries: BTreeMap<VirtualPage, Mapping>,
    invalidated: BTreeSet<VirtualPage>,
    /// Maximum number of leaf entries; models running out of page-table memory.
    limit: Option<usize>,
}

impl PageMap {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
            invalidated: BTreeSet::new(),
            limit: None,
        }
    }

    /// A page map that refuses to hold more than `limit` mappings.
    #[must_use]
    pub const fn with_limit(limit: usize) -> Self {
        Self {
            entries: BTreeMap::new(),
            invalidated: BTreeSet::new(),
            limit: Some(limit),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether `page` was invalidated since the last [`clear_invalidations`](Self::clear_invalidations).
    #[must_use]
    pub fn was_invalidated(&self, page: VirtualPage) -> bool {
        self.invalidated.contains(&page)
    }

    /// Number of distinct pages invalidated since the last clear.
    #[must_use]
    pub fn invalidation_count(&self) -> usize {
        self.invalidated.len()
    }

    pub fn clear_invalidations(&mut self) {
        self.invalidated.clear();
    }
}

impl AddressSpace for PageMap {
    fn map<A: FrameAlloc>(
        &mut self,
        frames: &mut A,
        page: VirtualPage,
        frame: PhysicalPage,
        flags: PageFlags,
    ) -> Result<(), MapError> {
        match self.entries.get(&page).copied() {
            Some(existing) if existing.frame == frame => {
                trace!("remap {page} -> {frame} [{flags}]");
                self.entries.insert(page, Mapping { frame, flags });
                self.invalidate(page);
                return Ok(());
            }
            Some(_) => {
                self.unmap(frames, page);
            }
            None => {
                if self.limit.is_some_and(|limit| self.entries.len() >= limit) {
                    return Err(MapError::OutOfMemory);
                }
            }
        }

        trace!("map {page} -> {frame} [{flags}]");
        frames.retain(frame);
        self.entries.insert(page, Mapping { frame, flags });
        Ok(())
    }

    fn unmap<A: FrameAlloc>(&mut self, frames: &mut A, page: VirtualPage) -> Option<Mapping> {
        let mapping = self.entries.remove(&page)?;
        trace!("unmap {page} (was {})", mapping.frame);
        frames.release(mapping.frame);
        self.invalidate(page);
        Some(mapping)
    }

    fn lookup(&self, page: VirtualPage) -> Option<Mapping> {
        self.entries.get(&page).copied()
    }

    fn protect(&mut self, page: VirtualPage, flags: PageFlags) -> bool {
        match self.entries.get_mut(&page) {
            Some(mapping) => {
                mapping.flags = flags;
                true
            }
            None => false,
        }
    }

    fn invalidate(&mut self, page: VirtualPage) {
        self.invalidated.insert(page);
    }

    fn mapped_pages(&self) -> impl Iterator<Item = (VirtualPage, Mapping)> + '_ {
        self.entries.iter().map(|(p, m)| (*p, *m))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{FrameFill, PAGE_SIZE, VirtualAddress};
    use std::collections::HashMap;

    /// Hands out increasing frame numbers and keeps plain reference counts.
    #[derive(Default)]
    struct CountingAlloc {
        next: u64,
        counts: HashMap<PhysicalPage, usize>,
        reclaimed: Vec<PhysicalPage>,
        scratch: Vec<u8>,
    }

    impl FrameAlloc for CountingAlloc {
        fn allocate(&mut self, _fill: FrameFill) -> Option<PhysicalPage> {
            let frame = PhysicalPage::from_index(self.next);
            self.next += 1;
            self.counts.insert(frame, 0);
            Some(frame)
        }

        fn retain(&mut self, frame: PhysicalPage) {
            *self.counts.entry(frame).or_default() += 1;
        }

        fn release(&mut self, frame: PhysicalPage) {
            let count = self.counts.entry(frame).or_default();
            *count = count.saturating_sub(1);
            if *count == 0 {
                self.counts.remove(&frame);
                self.reclaimed.push(frame);
            }
        }

        fn ref_count(&self, frame: PhysicalPage) -> usize {
            self.counts.get(&frame).copied().unwrap_or(0)
        }

        fn bytes(&self, _frame: PhysicalPage) -> &[u8] {
            &self.scratch
        }

        fn bytes_mut(&mut self, _frame: PhysicalPage) -> &mut [u8] {
            &mut self.scratch
        }
    }

    fn page(n: u64) -> VirtualPage {
        VirtualAddress::new(0x0080_0000 + n * PAGE_SIZE).page()
    }

    #[test]
    fn map_takes_a_reference_and_unmap_gives_it_back() {
        let mut frames = CountingAlloc::default();
        let mut pm = PageMap::new();
        let f = frames.allocate(FrameFill::Zeroed).unwrap();

        pm.map(&mut frames, page(0), f, PageFlags::RW).unwrap();
        assert_eq!(frames.ref_count(f), 1);
        assert_eq!(pm.lookup(page(0)), Some(Mapping { frame: f, flags: PageFlags::RW }));

        let removed = pm.unmap(&mut frames, page(0)).unwrap();
        assert_eq!(removed.frame, f);
        assert_eq!(frames.ref_count(f), 0);
        assert!(frames.reclaimed.contains(&f));
        assert!(pm.was_invalidated(page(0)));
        assert!(pm.unmap(&mut frames, page(0)).is_none());
    }

    #[test]
    fn mapping_over_an_existing_frame_releases_the_old_one() {
        let mut frames = CountingAlloc::default();
        let mut pm = PageMap::new();
        let a = frames.allocate(FrameFill::Zeroed).unwrap();
        let b = frames.allocate(FrameFill::Zeroed).unwrap();

        pm.map(&mut frames, page(1), a, PageFlags::READ).unwrap();
        pm.map(&mut frames, page(1), b, PageFlags::RW).unwrap();
        assert_eq!(frames.ref_count(a), 0);
        assert_eq!(frames.ref_count(b), 1);
        assert!(pm.was_invalidated(page(1)));
    }

    #[test]
    fn remapping_the_same_frame_keeps_one_reference() {
        let mut frames = CountingAlloc::default();
        let mut pm = PageMap::new();
        let a = frames.allocate(FrameFill::Zeroed).unwrap();

        pm.map(&mut frames, page(2), a, PageFlags::READ).unwrap();
        pm.map(&mut frames, page(2), a, PageFlags::RW).unwrap();
        assert_eq!(frames.ref_count(a), 1);
        assert_eq!(pm.lookup(page(2)).unwrap().flags, PageFlags::RW);
    }

    #[test]
    fn protect_rewrites_flags_only_when_mapped() {
        let mut frames = CountingAlloc::default();
        let mut pm = PageMap::new();
        let a = frames.allocate(FrameFill::Zeroed).unwrap();
        assert!(!pm.protect(page(3), PageFlags::READ));

        pm.map(&mut frames, page(3), a, PageFlags::RW).unwrap();
        assert!(pm.protect(page(3), PageFlags::READ));
        assert_eq!(pm.lookup(page(3)).unwrap().flags, PageFlags::READ);
    }

    #[test]
    fn limit_rejects_new_entries() {
        let mut frames = CountingAlloc::default();
        let mut pm = PageMap::with_limit(1);
        let a = frames.allocate(FrameFill::Zeroed).unwrap();
        let b = frames.allocate(FrameFill::Zeroed).unwrap();

        pm.map(&mut frames, page(0), a, PageFlags::RW).unwrap();
        assert_eq!(pm.map(&mut frames, page(1), b, PageFlags::RW), Err(MapError::OutOfMemory));
        assert_eq!(frames.ref_count(b), 0);
        assert_eq!(pm.len(), 1);
    }

    #[test]
    fn repeated_invalidation_of_one_page_is_recorded_once() {
        let mut frames = CountingAlloc::default();
        let mut pm = PageMap::new();
        let a = frames.allocate(FrameFill::Zeroed).unwrap();
        pm.map(&mut frames, page(0), a, PageFlags::RW).unwrap();

        for _ in 0..10_000 {
            pm.protect(page(0), PageFlags::READ);
            pm.invalidate(page(0));
        }
        assert_eq!(pm.invalidation_count(), 1);
        assert!(pm.was_invalidated(page(0)));

        pm.clear_invalidations();
        assert_eq!(pm.invalidation_count(), 0);
        assert!(!pm.was_invalidated(page(0)));
    }

    #[test]
    fn clear_releases_everything() {
        let mut frames = CountingAlloc::default();
        let mut pm = PageMap::new();
        for n in 0..4 {
            let f = frames.allocate(FrameFill::Zeroed).unwrap();
            pm.map(&mut frames, page(n), f, PageFlags::RW).unwrap();
        }
        pm.clear(&mut frames);
        assert!(pm.is_empty());
        assert_eq!(frames.reclaimed.len(), 4);
    }
}
