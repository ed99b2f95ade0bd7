//! # Environment Memory
//!
//! [`EnvMemory`] bundles what an allocated environment owns of memory: its
//! region table, its page table and the frame the region table is accounted
//! against. The region table says what *may* be mapped; the page table says
//! what *is* mapped.
//!
//! Removing a range from the table unmaps only the pages no live region
//! covers anymore. A page shared between a shrunk region and its remaining
//! neighbor stays mapped.

use crate::env::EnvId;
use crate::error::{EnvError, RegionError};
use crate::kernel::Kernel;
use crate::vma::RegionTable;
use bitflags::bitflags;
use kernel_memory_addresses::{PAGE_SIZE, PhysicalPage, VirtualAddress, VirtualRange};
use kernel_vmem::{AddressSpace, FrameAlloc, FrameFill, PageFlags};
use log::{debug, warn};

bitflags! {
    /// Options of [`Kernel::region_create`].
    #[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
    pub struct RegionFlags: u32 {
        /// Back every page with a zeroed frame right away instead of on first
        /// touch.
        const POPULATE = 1 << 0;
    }
}

#[derive(Debug)]
pub struct EnvMemory<A> {
    pub(crate) regions: RegionTable,
    pub(crate) aspace: A,
    pub(crate) table_frame: PhysicalPage,
    /// Stack frame of a kernel service.
    pub(crate) kernel_stack: Option<PhysicalPage>,
}

impl<A> EnvMemory<A> {
    pub(crate) const fn new(regions: RegionTable, aspace: A, table_frame: PhysicalPage) -> Self {
        Self {
            regions,
            aspace,
            table_frame,
            kernel_stack: None,
        }
    }

    #[must_use]
    pub const fn regions(&self) -> &RegionTable {
        &self.regions
    }

    #[must_use]
    pub const fn address_space(&self) -> &A {
        &self.aspace
    }

    /// Frame backing the region table.
    #[must_use]
    pub const fn table_frame(&self) -> PhysicalPage {
        self.table_frame
    }

    /// Frame holding a kernel service's stack.
    #[must_use]
    pub const fn kernel_stack(&self) -> Option<PhysicalPage> {
        self.kernel_stack
    }
}

impl<A: AddressSpace> EnvMemory<A> {
    /// Remove `range` from the region table and unmap the pages it freed.
    pub(crate) fn remove<F: FrameAlloc>(
        &mut self,
        frames: &mut F,
        range: VirtualRange,
    ) -> Result<(), EnvError> {
        self.regions.remove(range)?;
        self.release_uncovered(frames, range);
        Ok(())
    }

    /// Unmap every page of `range` that no live region touches.
    pub(crate) fn release_uncovered<F: FrameAlloc>(&mut self, frames: &mut F, range: VirtualRange) {
        for page in range.pages() {
            let bounds = VirtualRange::new(page.base(), PAGE_SIZE);
            if self.regions.iter().any(|(_, r)| r.range.overlaps(&bounds)) {
                continue;
            }
            self.aspace.unmap(frames, page);
        }
    }

    /// Back every not yet mapped page of `range` with a zeroed frame.
    pub(crate) fn populate<F: FrameAlloc>(
        &mut self,
        frames: &mut F,
        range: VirtualRange,
        perm: PageFlags,
    ) -> Result<(), EnvError> {
        for page in range.pages() {
            if self.aspace.lookup(page).is_some() {
                continue;
            }
            let frame = frames.allocate(FrameFill::Zeroed).ok_or(EnvError::OutOfMemory)?;
            if let Err(e) = self.aspace.map(frames, page, frame, perm) {
                frames.release(frame);
                return Err(e.into());
            }
        }
        Ok(())
    }

    /// Unmap everything and give back the region table and stack frames.
    pub(crate) fn teardown<F: FrameAlloc>(&mut self, frames: &mut F) {
        self.aspace.clear(frames);
        frames.release(self.table_frame);
        if let Some(stack) = self.kernel_stack.take() {
            frames.release(stack);
        }
    }
}

impl<F, A> Kernel<F, A>
where
    F: FrameAlloc,
    A: AddressSpace + Default,
{
    /// Create an anonymous region of `len` bytes at the lowest free address
    /// of environment `id`.
    ///
    /// With [`RegionFlags::POPULATE`] every page is backed right away; if
    /// that runs out of memory the region is removed again.
    ///
    /// # Errors
    /// [`EnvError::BadEnv`], region errors ([`RegionError::NoFreeRange`],
    /// [`RegionError::TableFull`]) and [`EnvError::OutOfMemory`] while
    /// populating.
    pub fn region_create(
        &mut self,
        id: EnvId,
        len: u64,
        perm: PageFlags,
        flags: RegionFlags,
    ) -> Result<VirtualAddress, EnvError> {
        let index = self.live_index(id)?;
        let memory = self.envs[index]
            .memory
            .as_mut()
            .ok_or(EnvError::BadEnv(id))?;

        let va = memory
            .regions
            .find_free_range(len)
            .ok_or(RegionError::NoFreeRange(len))?;
        let range = VirtualRange::new(va, len);
        let slot = memory.regions.create(range, perm, None)?;

        if flags.contains(RegionFlags::POPULATE) {
            let perm = memory.regions.get(slot).map_or(perm, |r| r.perm);
            if let Err(e) = memory.populate(&mut self.frames, range, perm) {
                warn!("[{id}] populating {range:?} failed: {e}");
                memory.remove(&mut self.frames, range)?;
                return Err(e);
            }
        }

        debug!("[{id}] region_create {range:?} [{perm}]");
        Ok(va)
    }

    /// Remove `[va, va + len)` from environment `id` and unmap the pages no
    /// other region covers.
    ///
    /// # Errors
    /// [`EnvError::BadEnv`] or the region error of
    /// [`RegionTable::remove`].
    pub fn region_destroy(&mut self, id: EnvId, va: VirtualAddress, len: u64) -> Result<(), EnvError> {
        let index = self.live_index(id)?;
        let memory = self.envs[index]
            .memory
            .as_mut()
            .ok_or(EnvError::BadEnv(id))?;
        memory.remove(&mut self.frames, VirtualRange::new(va, len))?;
        debug!("[{id}] region_destroy {va} +{len:#x}");
        Ok(())
    }
}
