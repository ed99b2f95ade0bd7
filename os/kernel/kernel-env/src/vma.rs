//! # Virtual Memory Areas
//!
//! Each environment describes its user address space as a fixed table of
//! regions. A region is a contiguous range with one kind and one set of
//! permissions; pages inside it are materialized lazily by the fault
//! resolver.
//!
//! ```text
//!   slot:   0        1        2        3   ...  127
//!         ┌────────┬────────┬────────┬────────┬─────┐
//!         │ Anon   │ Unused │ Backed │ Anon   │ ... │
//!         │ RW-U   │        │ R-EU   │ RW-U   │     │
//!         │ key 0  │        │ key 0  │ key 42 │     │
//!         └────────┴────────┴────────┴────────┴─────┘
//! ```
//!
//! Slots are unordered and may be sparse. Live regions never overlap.
//!
//! This module only keeps the books. Unmapping the pages of a removed range
//! is done by [`EnvMemory`](crate::memory::EnvMemory), which owns both the
//! table and the page table.

use crate::error::RegionError;
use crate::image::ImageSegment;
use core::fmt;
use kernel_info::memory::{REGION_TABLE_CAPACITY, USER_BASE, USER_CEILING};
use kernel_memory_addresses::{VirtualAddress, VirtualRange, page_align_up};
use kernel_vmem::PageFlags;
use log::debug;

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
pub enum RegionKind {
    #[default]
    Unused,
    /// Zero-filled on first touch.
    Anonymous,
    /// Initialized from a program image segment.
    Backed,
}

/// How eagerly adjacent compatible regions are merged after an insertion.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
pub enum MergePolicy {
    /// Never merge.
    Disabled,
    /// One pass over all pairs; a merge that creates new adjacency is not
    /// followed up.
    #[default]
    SinglePass,
    /// Repeat passes until nothing merges.
    FixedPoint,
}

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct Region {
    pub kind: RegionKind,
    pub range: VirtualRange,
    pub perm: PageFlags,
    pub backing: Option<ImageSegment>,
    /// Shared memory key; 0 means private.
    pub shared_key: u32,
}

impl Region {
    const UNUSED: Self = Self {
        kind: RegionKind::Unused,
        range: VirtualRange::new(VirtualAddress::zero(), 0),
        perm: PageFlags::empty(),
        backing: None,
        shared_key: 0,
    };

    #[inline]
    #[must_use]
    pub fn is_live(&self) -> bool {
        self.kind != RegionKind::Unused
    }

    #[inline]
    #[must_use]
    pub const fn is_shared(&self) -> bool {
        self.shared_key != 0
    }

    /// Same kind, permissions, key and backing.
    fn is_compatible_with(&self, other: &Self) -> bool {
        self.kind == other.kind
            && self.perm == other.perm
            && self.shared_key == other.shared_key
            && self.backing == other.backing
    }
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.kind {
            RegionKind::Unused => "----",
            RegionKind::Anonymous => "ANON",
            RegionKind::Backed => "BIN ",
        };
        write!(f, "{kind} | {} | {}", self.perm, self.range)?;
        if self.is_shared() {
            write!(f, " key {:#x}", self.shared_key)?;
        }
        Ok(())
    }
}

/// Fixed-capacity region table of one environment.
#[derive(Clone, Debug)]
pub struct RegionTable {
    slots: [Region; REGION_TABLE_CAPACITY],
    policy: MergePolicy,
}

impl Default for RegionTable {
    fn default() -> Self {
        Self::new(MergePolicy::default())
    }
}

impl RegionTable {
    pub const CAPACITY: usize = REGION_TABLE_CAPACITY;

    #[must_use]
    pub const fn new(policy: MergePolicy) -> Self {
        Self {
            slots: [Region::UNUSED; REGION_TABLE_CAPACITY],
            policy,
        }
    }

    #[must_use]
    pub const fn policy(&self) -> MergePolicy {
        self.policy
    }

    pub const fn set_policy(&mut self, policy: MergePolicy) {
        self.policy = policy;
    }

    /// The live region in `slot`.
    #[must_use]
    pub fn get(&self, slot: usize) -> Option<&Region> {
        self.slots.get(slot).filter(|r| r.is_live())
    }

    /// Live regions with their slot numbers.
    pub fn iter(&self) -> impl Iterator<Item = (usize, &Region)> + '_ {
        self.slots.iter().enumerate().filter(|(_, r)| r.is_live())
    }

    /// Number of live regions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.iter().count()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Insert an anonymous (`backing == None`) or image-backed region.
    ///
    /// `USER` is added to `perm`. Returns the slot that holds `range.start()`
    /// afterwards, which is a merge survivor if the new region was merged
    /// into a neighbor.
    ///
    /// # Errors
    /// - [`RegionError::EmptyRange`] if `range` is empty.
    /// - [`RegionError::TableFull`] if no slot is free.
    /// - [`RegionError::Overlap`] if `range` overlaps a live region.
    pub fn create(
        &mut self,
        range: VirtualRange,
        perm: PageFlags,
        backing: Option<ImageSegment>,
    ) -> Result<usize, RegionError> {
        let kind = if backing.is_some() {
            RegionKind::Backed
        } else {
            RegionKind::Anonymous
        };
        self.insert(Region {
            kind,
            range,
            perm,
            backing,
            shared_key: 0,
        })
    }

    /// Insert an anonymous region tagged with a shared memory `key`.
    ///
    /// # Errors
    /// As [`create`](Self::create).
    pub fn create_shared(
        &mut self,
        range: VirtualRange,
        perm: PageFlags,
        key: u32,
    ) -> Result<usize, RegionError> {
        self.insert(Region {
            kind: RegionKind::Anonymous,
            range,
            perm,
            backing: None,
            shared_key: key,
        })
    }

    fn insert(&mut self, region: Region) -> Result<usize, RegionError> {
        if region.range.is_empty() {
            return Err(RegionError::EmptyRange);
        }
        let slot = self.free_slot().ok_or(RegionError::TableFull)?;
        if self.iter().any(|(_, r)| r.range.overlaps(&region.range)) {
            return Err(RegionError::Overlap(region.range));
        }

        self.slots[slot] = Region {
            perm: region.perm | PageFlags::USER,
            ..region
        };
        debug!("vma: new [{slot:03}] {}", self.slots[slot]);

        match self.policy {
            MergePolicy::Disabled => {}
            MergePolicy::SinglePass => {
                self.merge();
            }
            MergePolicy::FixedPoint => {
                self.merge_to_fixed_point();
            }
        }

        Ok(self.find_containing(region.range.start()).unwrap_or(slot))
    }

    fn free_slot(&self) -> Option<usize> {
        self.slots.iter().position(|r| !r.is_live())
    }

    /// Remove `range` from the region that contains it.
    ///
    /// Depending on where `range` sits in the region, the region is dropped
    /// (exact match), shrunk from the left or right, or split in two around
    /// an interior hole. Page mappings are not touched.
    ///
    /// # Errors
    /// - [`RegionError::EmptyRange`] if `range` is empty.
    /// - [`RegionError::NotFound`] if no region contains `range.start()`.
    /// - [`RegionError::OutOfBounds`] if `range` extends past that region.
    /// - [`RegionError::TableFull`] if an interior split needs a slot and
    ///   none is free; the table is left unchanged.
    pub fn remove(&mut self, range: VirtualRange) -> Result<(), RegionError> {
        if range.is_empty() {
            return Err(RegionError::EmptyRange);
        }
        let slot = self
            .find_containing(range.start())
            .ok_or(RegionError::NotFound(range.start()))?;
        let region = self.slots[slot];
        if !region.range.contains_range(&range) {
            return Err(RegionError::OutOfBounds(range));
        }

        let left = VirtualRange::from_bounds(region.range.start(), range.start());
        let right = VirtualRange::from_bounds(range.end(), region.range.end());
        match (left.is_empty(), right.is_empty()) {
            (true, true) => self.slots[slot] = Region::UNUSED,
            (true, false) => self.slots[slot].range = right,
            (false, true) => self.slots[slot].range = left,
            (false, false) => {
                let spare = self.free_slot().ok_or(RegionError::TableFull)?;
                self.slots[slot].range = left;
                self.slots[spare] = Region {
                    range: right,
                    ..region
                };
                debug!("vma: split [{slot:03}] -> [{spare:03}] {}", self.slots[spare]);
            }
        }
        debug!("vma: removed {range:?} from [{slot:03}]");
        Ok(())
    }

    /// One merge pass over all pairs of live regions.
    ///
    /// Two regions merge when one ends where the other starts and they are
    /// compatible (same kind, permissions, key and backing). The survivor is
    /// extended and the donor slot freed. Each region absorbs at most one
    /// neighbor per pass. Returns the number of merges.
    pub fn merge(&mut self) -> usize {
        let mut merged = 0;
        for outer in 0..Self::CAPACITY {
            if !self.slots[outer].is_live() {
                continue;
            }
            for inner in 0..Self::CAPACITY {
                let (o, i) = (self.slots[outer], self.slots[inner]);
                if inner == outer || !i.is_live() || !o.is_compatible_with(&i) {
                    continue;
                }

                let (survivor, donor) = if o.range.end() == i.range.start() {
                    (outer, inner)
                } else if i.range.end() == o.range.start() {
                    (inner, outer)
                } else {
                    continue;
                };

                let (s, d) = (self.slots[survivor].range, self.slots[donor].range);
                self.slots[survivor].range = VirtualRange::from_bounds(s.start(), d.end());
                self.slots[donor] = Region::UNUSED;
                debug!("vma: merged [{donor:03}] into [{survivor:03}]");
                merged += 1;
                break;
            }
        }
        merged
    }

    /// Merge until no compatible adjacent pair is left. Returns the number of
    /// merges.
    pub fn merge_to_fixed_point(&mut self) -> usize {
        let mut total = 0;
        loop {
            match self.merge() {
                0 => return total,
                n => total += n,
            }
        }
    }

    /// Slot of the live region containing `va`.
    #[must_use]
    pub fn find_containing(&self, va: VirtualAddress) -> Option<usize> {
        self.iter()
            .find(|(_, r)| r.range.contains(va))
            .map(|(slot, _)| slot)
    }

    /// The live region carrying shared memory `key`.
    #[must_use]
    pub fn find_shared(&self, key: u32) -> Option<&Region> {
        if key == 0 {
            return None;
        }
        self.iter().map(|(_, r)| r).find(|r| r.shared_key == key)
    }

    /// Lowest page-aligned address in `[USER_BASE, USER_CEILING)` with `len`
    /// bytes (rounded up to whole pages) free of any region.
    #[must_use]
    pub fn find_free_range(&self, len: u64) -> Option<VirtualAddress> {
        if len == 0 {
            return None;
        }
        let len = page_align_up(len);
        let mut candidate = USER_BASE;
        loop {
            if candidate.checked_add(len)? > USER_CEILING {
                return None;
            }
            let want = VirtualRange::new(VirtualAddress::new(candidate), len);
            let blocked_until = self
                .iter()
                .filter(|(_, r)| r.range.overlaps(&want))
                .map(|(_, r)| page_align_up(r.range.end().as_u64()))
                .max();
            match blocked_until {
                None => return Some(want.start()),
                Some(end) => candidate = end,
            }
        }
    }

    /// Log the table, one line per live slot, like a debugger would.
    pub fn dump(&self, owner: impl fmt::Display) {
        debug!(">> ------------------------------------------------");
        for (slot, region) in self.iter() {
            debug!(">> {owner} [{slot:03}]: {region}");
        }
        let used = self.len();
        debug!(">> Summary: {used} used, {} vacant.", Self::CAPACITY - used);
        debug!(">> ------------------------------------------------");
    }
}
