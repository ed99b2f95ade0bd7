//! Copy-on-write fork.
//!
//! The child gets a verbatim copy of the parent's region table. Every page
//! the parent has mapped inside a live region is mapped into the child to
//! the same frame, and both sides lose write access to it. The first write
//! on either side faults and is resolved by [`fault`](crate::fault): a
//! private copy while the frame is still shared, write access in place once
//! only one mapping remains.

use crate::cpu::CpuId;
use crate::env::EnvId;
use crate::error::EnvError;
use crate::kernel::Kernel;
use alloc::vec::Vec;
use kernel_vmem::{AddressSpace, FrameAlloc, Mapping, VirtualPage};
use log::info;

impl<F, A> Kernel<F, A>
where
    F: FrameAlloc,
    A: AddressSpace + Default,
{
    /// Fork the environment running on `cpu`.
    ///
    /// # Errors
    /// [`EnvError::BadEnv`] if no environment is current on `cpu`, otherwise
    /// as [`fork_env`](Self::fork_env).
    pub fn fork(&mut self, cpu: CpuId) -> Result<EnvId, EnvError> {
        let parent = self.current(cpu).ok_or(EnvError::BadEnv(EnvId::new()))?;
        self.fork_env(parent)
    }

    /// Create a copy-on-write child of `parent`.
    ///
    /// The child's trap frame is the parent's with a zero return value, so
    /// the child sees `fork` return 0 while the parent gets the child's id.
    ///
    /// # Errors
    /// - [`EnvError::BadEnv`] if `parent` is not live.
    /// - [`EnvError::NoFreeEnv`] or [`EnvError::OutOfMemory`] from allocation.
    /// - [`EnvError::OutOfMemory`] if the child's page table cannot grow; the
    ///   child is destroyed again. Pages already shared stay read-only in the
    ///   parent and are upgraded on its next write fault.
    pub fn fork_env(&mut self, parent: EnvId) -> Result<EnvId, EnvError> {
        let parent_index = self.live_index(parent)?;
        let kind = self.envs[parent_index].kind;
        let child = self.alloc_env(Some(parent), kind)?;
        let child_index = child.slot();

        if let Err(e) = self.share_memory(parent_index, child_index) {
            self.free_env(child_index);
            return Err(e);
        }

        let mut frame = self.envs[parent_index].frame;
        frame.rax = 0;
        self.envs[child_index].frame = frame;

        info!("[{parent}] fork -> {child}");
        Ok(child)
    }

    fn share_memory(&mut self, parent_index: usize, child_index: usize) -> Result<(), EnvError> {
        let child_id = self.envs[child_index].id;
        let [parent, child] = self
            .envs
            .get_disjoint_mut([parent_index, child_index])
            .map_err(|_| EnvError::BadEnv(child_id))?;
        let parent_id = parent.id;
        let (Some(from), Some(to)) = (parent.memory.as_mut(), child.memory.as_mut()) else {
            return Err(EnvError::BadEnv(parent_id));
        };

        to.regions.clone_from(&from.regions);

        // Pages inside live regions, with the permissions each side keeps.
        let shared: Vec<(VirtualPage, Mapping, _)> = from
            .aspace
            .mapped_pages()
            .filter_map(|(page, mapping)| {
                let slot = from.regions.find_containing(page.base())?;
                let region = from.regions.get(slot)?;
                Some((page, mapping, region.perm.read_only()))
            })
            .collect();

        for (page, mapping, perm) in shared {
            to.aspace.map(&mut self.frames, page, mapping.frame, perm)?;
            if mapping.flags.is_writable() {
                from.aspace.protect(page, mapping.flags.read_only());
                from.aspace.invalidate(page);
            }
        }
        Ok(())
    }
}
