//! # Environments
//!
//! Environment control blocks and their lifecycle: allocation from the free
//! list, creation from a program image, id resolution and destruction.
//!
//! ## Identifiers
//!
//! ```text
//! +1+---------------21-----------------+--------10--------+
//! |0|          Generation              |   Table index    |
//! +-+----------------------------------+------------------+
//! ```
//!
//! The generation of a slot changes every time the slot is freed, so ids of
//! destroyed environments never resolve to a later occupant. Generations
//! start at 1, which keeps every real id non-zero; in system calls id 0
//! stands for the caller.

use crate::cpu::CpuId;
use crate::error::EnvError;
use crate::image::{ImageSegment, ProgramImage};
use crate::kernel::Kernel;
use crate::memory::EnvMemory;
use crate::trap::TrapFrame;
use crate::vma::RegionTable;
use bitfield_struct::bitfield;
use core::fmt;
use kernel_info::memory::{HHDM_BASE, USER_STACK_SIZE, USER_STACK_TOP};
use kernel_memory_addresses::{PAGE_SIZE, VirtualAddress, VirtualRange};
use kernel_vmem::{AddressSpace, FrameAlloc, FrameFill, PageFlags};
use log::{debug, info};

const GENERATION_BITS: u32 = 21;

#[bitfield(u32)]
#[derive(PartialEq, Eq, Hash)]
pub struct EnvId {
    /// Slot in the environment table.
    #[bits(10)]
    pub index: u16,
    /// Uniqueifier, never 0 for a real environment.
    #[bits(21)]
    pub generation: u32,
    /// Sign bit; real ids are positive.
    #[bits(1)]
    __: u8,
}

const _: () = assert!(kernel_info::env::LOG2_MAX_ENVS == 10);

impl EnvId {
    /// Id of a slot that was never handed out.
    pub(crate) const fn vacant(index: u16) -> Self {
        Self::new().with_index(index).with_generation(1)
    }

    /// Table slot of this id.
    #[inline]
    #[must_use]
    pub const fn slot(self) -> usize {
        self.index() as usize
    }

    /// The id the same slot gets after this one is freed.
    #[must_use]
    pub const fn next_generation(self) -> Self {
        let generation = (self.generation() + 1) & ((1 << GENERATION_BITS) - 1);
        self.with_generation(if generation == 0 { 1 } else { generation })
    }
}

impl fmt::Display for EnvId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08x}", self.into_bits())
    }
}

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
pub enum EnvStatus {
    /// Slot is unallocated.
    #[default]
    Free,
    Runnable,
    /// Executing on the CPU recorded in [`Env::cpu`].
    Running,
    /// Reserved for voluntary descheduling by the embedding kernel; no
    /// operation here enters this state.
    NotRunnable,
    /// Destroyed while running on another CPU; freed by that CPU.
    Dying,
}

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
pub enum EnvKind {
    #[default]
    User,
    /// Runs in ring 0 without a program image; scheduled like any other.
    KernelService,
}

/// Environment control block.
#[derive(Debug)]
pub struct Env<A> {
    pub(crate) id: EnvId,
    pub(crate) parent: Option<EnvId>,
    pub(crate) kind: EnvKind,
    pub(crate) status: EnvStatus,
    pub(crate) runs: u32,
    pub(crate) cpu: Option<CpuId>,
    pub(crate) time_slice: u64,
    pub(crate) wait_target: Option<EnvId>,
    pub(crate) frame: TrapFrame,
    pub(crate) memory: Option<EnvMemory<A>>,
}

impl<A> Env<A> {
    pub(crate) const fn vacant(index: u16) -> Self {
        Self {
            id: EnvId::vacant(index),
            parent: None,
            kind: EnvKind::User,
            status: EnvStatus::Free,
            runs: 0,
            cpu: None,
            time_slice: 0,
            wait_target: None,
            frame: TrapFrame::kernel(VirtualAddress::zero(), VirtualAddress::zero()),
            memory: None,
        }
    }

    #[must_use]
    pub const fn id(&self) -> EnvId {
        self.id
    }

    #[must_use]
    pub const fn parent(&self) -> Option<EnvId> {
        self.parent
    }

    #[must_use]
    pub const fn kind(&self) -> EnvKind {
        self.kind
    }

    #[must_use]
    pub const fn status(&self) -> EnvStatus {
        self.status
    }

    /// Number of times the environment was dispatched.
    #[must_use]
    pub const fn runs(&self) -> u32 {
        self.runs
    }

    #[must_use]
    pub const fn cpu(&self) -> Option<CpuId> {
        self.cpu
    }

    /// Remaining execution budget in clock ticks.
    #[must_use]
    pub const fn time_slice(&self) -> u64 {
        self.time_slice
    }

    #[must_use]
    pub const fn wait_target(&self) -> Option<EnvId> {
        self.wait_target
    }

    #[must_use]
    pub const fn frame(&self) -> &TrapFrame {
        &self.frame
    }

    pub const fn frame_mut(&mut self) -> &mut TrapFrame {
        &mut self.frame
    }

    #[must_use]
    pub const fn memory(&self) -> Option<&EnvMemory<A>> {
        self.memory.as_ref()
    }

    #[must_use]
    pub fn regions(&self) -> Option<&RegionTable> {
        self.memory.as_ref().map(EnvMemory::regions)
    }

    #[must_use]
    pub fn address_space(&self) -> Option<&A> {
        self.memory.as_ref().map(EnvMemory::address_space)
    }

    #[must_use]
    pub const fn is_free(&self) -> bool {
        matches!(self.status, EnvStatus::Free)
    }

    /// Runnable or running, i.e. not yet done.
    #[must_use]
    pub const fn is_active(&self) -> bool {
        matches!(self.status, EnvStatus::Runnable | EnvStatus::Running)
    }
}

impl<F, A> Kernel<F, A>
where
    F: FrameAlloc,
    A: AddressSpace + Default,
{
    /// Take a slot off the free list and set it up as a fresh, runnable
    /// environment with an empty region table and address space.
    ///
    /// The region table is accounted as one zero-filled frame.
    ///
    /// # Errors
    /// - [`EnvError::NoFreeEnv`] if every slot is taken.
    /// - [`EnvError::OutOfMemory`] if no frame is left for the region table;
    ///   the slot stays free.
    pub fn alloc_env(&mut self, parent: Option<EnvId>, kind: EnvKind) -> Result<EnvId, EnvError> {
        let index = *self.free.last().ok_or(EnvError::NoFreeEnv)?;
        let table_frame = self
            .frames
            .allocate(FrameFill::Zeroed)
            .ok_or(EnvError::OutOfMemory)?;
        self.frames.retain(table_frame);
        self.free.pop();

        let time_slice = self.config.time_slice;
        let regions = RegionTable::new(self.config.merge_policy);
        let env = &mut self.envs[usize::from(index)];
        env.parent = parent;
        env.kind = kind;
        env.status = EnvStatus::Runnable;
        env.runs = 0;
        env.cpu = None;
        env.time_slice = time_slice;
        env.wait_target = None;
        env.frame = TrapFrame::default();
        env.memory = Some(EnvMemory::new(regions, A::default(), table_frame));

        info!("[{}] new env {}", parent.unwrap_or_default(), env.id);
        Ok(env.id)
    }

    /// Create a runnable environment from `image`.
    ///
    /// A user environment gets one backed region per image segment, loaded
    /// eagerly, and a one-page anonymous stack right below
    /// [`USER_STACK_TOP`]. A kernel service gets its entry point and a
    /// zeroed stack frame, addressed through the direct map.
    ///
    /// # Errors
    /// Anything [`alloc_env`](Self::alloc_env) reports, region errors for
    /// overlapping or empty segments, [`EnvError::BadImage`] for segments
    /// pointing outside `image.data`, and [`EnvError::OutOfMemory`]. On error
    /// the half-built environment is freed again.
    pub fn create_env(&mut self, kind: EnvKind, image: &ProgramImage<'_>) -> Result<EnvId, EnvError> {
        let id = self.alloc_env(None, kind)?;
        let index = id.slot();

        let loaded = match kind {
            EnvKind::User => self.load_image(index, image),
            EnvKind::KernelService => {
                if !image.segments.is_empty() {
                    debug!("[{id}] kernel service: ignoring {} segments", image.segments.len());
                }
                self.attach_kernel_stack(index, image.entry)
            }
        };

        if let Err(e) = loaded {
            self.free_env(index);
            return Err(e);
        }
        Ok(id)
    }

    fn load_image(&mut self, index: usize, image: &ProgramImage<'_>) -> Result<(), EnvError> {
        let env = &mut self.envs[index];
        let memory = env.memory.as_mut().ok_or(EnvError::BadEnv(env.id))?;

        for segment in image.segments {
            memory.regions.create(segment.range(), segment.perm, Some(*segment))?;
            load_segment(memory, &mut self.frames, segment, image.data)?;
        }

        let stack = VirtualRange::new(
            VirtualAddress::new(USER_STACK_TOP - USER_STACK_SIZE),
            USER_STACK_SIZE,
        );
        memory.regions.create(stack, PageFlags::RW, None)?;

        env.frame = TrapFrame::user(image.entry, VirtualAddress::new(USER_STACK_TOP));
        Ok(())
    }

    fn attach_kernel_stack(&mut self, index: usize, entry: VirtualAddress) -> Result<(), EnvError> {
        let env = &mut self.envs[index];
        let memory = env.memory.as_mut().ok_or(EnvError::BadEnv(env.id))?;
        let stack = self
            .frames
            .allocate(FrameFill::Zeroed)
            .ok_or(EnvError::OutOfMemory)?;
        self.frames.retain(stack);
        memory.kernel_stack = Some(stack);

        let top = VirtualAddress::new(HHDM_BASE + stack.base() + PAGE_SIZE);
        env.frame = TrapFrame::kernel(entry, top);
        Ok(())
    }

    /// Resolve `id` on behalf of the environment running on `cpu`.
    ///
    /// Id 0 means the caller itself. With `check_parent`, the target must be
    /// the caller or one of its direct children.
    ///
    /// # Errors
    /// [`EnvError::BadEnv`] if the id is stale, free, or not permitted.
    pub fn resolve(&self, cpu: CpuId, id: EnvId, check_parent: bool) -> Result<EnvId, EnvError> {
        let caller = self.current(cpu);
        if id.into_bits() == 0 {
            return caller.ok_or(EnvError::BadEnv(id));
        }

        let env = self.env(id).ok_or(EnvError::BadEnv(id))?;
        if check_parent && caller != Some(id) && (caller.is_none() || env.parent != caller) {
            return Err(EnvError::BadEnv(id));
        }
        Ok(id)
    }

    /// Destroy environment `id` on behalf of `cpu`.
    ///
    /// An environment running on another CPU is only marked
    /// [`Dying`](EnvStatus::Dying); that CPU frees it at its next scheduling
    /// decision. Otherwise every page is unmapped, the region table frame is
    /// released and the slot goes back to the free list under a new
    /// generation.
    ///
    /// # Errors
    /// [`EnvError::BadEnv`] if `id` does not name a live environment.
    pub fn destroy_env(&mut self, cpu: CpuId, id: EnvId) -> Result<(), EnvError> {
        let index = self.live_index(id)?;
        let on_this_cpu = self.current(cpu) == Some(id);
        let env = &mut self.envs[index];
        if env.status == EnvStatus::Running && !on_this_cpu {
            info!("[{id}] marked dying, running on CPU {:?}", env.cpu);
            env.status = EnvStatus::Dying;
            return Ok(());
        }
        self.free_env(index);
        Ok(())
    }

    /// Release everything slot `index` owns and put it on the free list.
    pub(crate) fn free_env(&mut self, index: usize) {
        let env = &mut self.envs[index];
        let id = env.id;
        if let Some(mut memory) = env.memory.take() {
            memory.teardown(&mut self.frames);
        }

        env.status = EnvStatus::Free;
        env.cpu = None;
        env.wait_target = None;
        env.id = id.next_generation();
        self.free.push(id.index());

        for cpu in &mut self.cpus {
            if cpu.current == Some(id) {
                cpu.current = None;
            }
        }
        info!("[{id}] free env {id}");
    }
}

/// Map every page of `segment` and copy its file bytes in.
#[allow(clippy::cast_possible_truncation)]
fn load_segment<A, F>(
    memory: &mut EnvMemory<A>,
    frames: &mut F,
    segment: &ImageSegment,
    data: &[u8],
) -> Result<(), EnvError>
where
    A: AddressSpace,
    F: FrameAlloc,
{
    let bytes = segment.file_bytes(data).ok_or(EnvError::BadImage)?;
    let start = segment.vaddr.as_u64();

    for page in segment.range().pages() {
        let frame = frames.allocate(FrameFill::Zeroed).ok_or(EnvError::OutOfMemory)?;
        if let Err(e) = memory.aspace.map(frames, page, frame, segment.perm | PageFlags::USER) {
            frames.release(frame);
            return Err(e.into());
        }

        // Slice of the file bytes that lands in this page.
        let base = page.base().as_u64();
        let lo = base.max(start);
        let hi = (base + PAGE_SIZE).min(start + bytes.len() as u64);
        if lo >= hi {
            continue;
        }
        let (src_lo, src_hi) = ((lo - start) as usize, (hi - start) as usize);
        let (dst_lo, dst_hi) = ((lo - base) as usize, (hi - base) as usize);
        frames.bytes_mut(frame)[dst_lo..dst_hi].copy_from_slice(&bytes[src_lo..src_hi]);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_pack_index_and_generation() {
        let id = EnvId::vacant(5);
        assert_eq!(id.slot(), 5);
        assert_eq!(id.generation(), 1);
        assert_eq!(id.into_bits(), (1 << 10) | 5);
        assert_eq!(id.to_string(), "00000405");
    }

    #[test]
    fn generation_wraps_past_zero() {
        let id = EnvId::vacant(3).with_generation((1 << GENERATION_BITS) - 1);
        let next = id.next_generation();
        assert_eq!(next.generation(), 1);
        assert_eq!(next.slot(), 3);
        assert!(next.into_bits() < 1 << 31);
    }

    #[test]
    fn next_generation_changes_the_id() {
        let id = EnvId::vacant(0);
        assert_ne!(id, id.next_generation());
    }
}
