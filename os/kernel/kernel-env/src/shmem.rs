//! Keyed shared memory.
//!
//! A shared region is an anonymous region tagged with a non-zero key. Its
//! creator backs it with frames right away; every environment that attaches
//! the key gets a region with the same range and permissions, mapped to the
//! creator's frames. Keys are unique across the system.

use crate::env::EnvId;
use crate::error::{EnvError, RegionError, ShmError};
use crate::kernel::Kernel;
use crate::vma::Region;
use alloc::vec::Vec;
use kernel_memory_addresses::{VirtualAddress, VirtualRange};
use kernel_vmem::{AddressSpace, FrameAlloc, Mapping, PageFlags, VirtualPage};
use log::{info, warn};

impl<F, A> Kernel<F, A>
where
    F: FrameAlloc,
    A: AddressSpace + Default,
{
    /// The live region carrying `key` in any environment, with the slot of
    /// its environment. Environments are searched in table order.
    fn find_shared_anywhere(&self, key: u32) -> Option<(usize, Region)> {
        self.envs.iter().enumerate().find_map(|(index, env)| {
            let region = env.regions()?.find_shared(key)?;
            Some((index, *region))
        })
    }

    /// Create a shared region of `len` bytes under `key` in environment `id`
    /// and back all of its pages.
    ///
    /// # Errors
    /// - [`ShmError::ZeroKey`] for key 0.
    /// - [`ShmError::KeyInUse`] if any environment already carries `key`.
    /// - [`EnvError::BadEnv`], region errors, and [`EnvError::OutOfMemory`]
    ///   while backing the pages; the region is removed again in that case.
    pub fn shared_create(
        &mut self,
        id: EnvId,
        len: u64,
        perm: PageFlags,
        key: u32,
    ) -> Result<VirtualAddress, ShmError> {
        if key == 0 {
            return Err(ShmError::ZeroKey);
        }
        if self.find_shared_anywhere(key).is_some() {
            warn!("[{id}] shared key {key:#x} already in use");
            return Err(ShmError::KeyInUse(key));
        }

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
        let slot = memory.regions.create_shared(range, perm, key)?;
        let perm = memory.regions.get(slot).map_or(perm, |r| r.perm);

        if let Err(e) = memory.populate(&mut self.frames, range, perm) {
            memory.remove(&mut self.frames, range)?;
            return Err(e.into());
        }

        info!("[{id}] shared {key:#x} created at {range}");
        Ok(va)
    }

    /// Attach the shared region `key` to environment `id`.
    ///
    /// If `id` already carries the key, its address is returned. Otherwise
    /// the first environment in table order that carries the key is the
    /// source: its range and permissions are copied, and each page it has
    /// mapped is mapped into `id` to the same frame with the same
    /// permissions.
    ///
    /// # Errors
    /// - [`ShmError::NotFound`] if no environment carries `key`.
    /// - [`ShmError::RangeOccupied`] if the range overlaps a region of `id`.
    /// - [`EnvError::BadEnv`], [`RegionError::TableFull`], and
    ///   [`EnvError::OutOfMemory`]; nothing is left attached on error.
    pub fn shared_attach(&mut self, id: EnvId, key: u32) -> Result<VirtualAddress, ShmError> {
        if key == 0 {
            return Err(ShmError::ZeroKey);
        }
        let index = self.live_index(id)?;
        if let Some(own) = self.envs[index].regions().and_then(|r| r.find_shared(key)) {
            return Ok(own.range.start());
        }

        let (owner_index, region) = self
            .find_shared_anywhere(key)
            .ok_or(ShmError::NotFound(key))?;

        let [caller, owner] = self
            .envs
            .get_disjoint_mut([index, owner_index])
            .map_err(|_| EnvError::BadEnv(id))?;
        let (Some(to), Some(from)) = (caller.memory.as_mut(), owner.memory.as_ref()) else {
            return Err(EnvError::BadEnv(id).into());
        };

        let range = region.range;
        match to.regions.create_shared(range, region.perm, key) {
            Err(RegionError::Overlap(_)) => return Err(ShmError::RangeOccupied(range)),
            other => other?,
        };

        let pages: Vec<(VirtualPage, Mapping)> = from
            .aspace
            .mapped_pages()
            .filter(|(page, _)| range.contains(page.base()))
            .collect();
        for (page, mapping) in pages {
            if let Err(e) = to.aspace.map(&mut self.frames, page, mapping.frame, mapping.flags) {
                warn!("[{id}] attaching {key:#x} failed at {page}");
                to.remove(&mut self.frames, range)?;
                return Err(EnvError::from(e).into());
            }
        }

        info!("[{id}] shared {key:#x} attached at {range}");
        Ok(range.start())
    }
}
