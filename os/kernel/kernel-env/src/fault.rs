//! # Page Fault Resolution
//!
//! A user page fault is checked against the faulting environment's region
//! table and then either resolved or ends the environment:
//!
//! | access | region          | mapping        | outcome                         |
//! |--------|-----------------|----------------|---------------------------------|
//! | any    | none            | -              | destroy ([`NoRegion`])          |
//! | write  | writable        | refcount 1     | grant write in place            |
//! | write  | writable        | refcount > 1   | copy frame, map copy writable   |
//! | write  | writable        | none           | zero-filled frame               |
//! | write  | read-only       | -              | destroy ([`WriteToReadOnly`])   |
//! | read   | backed          | none           | destroy ([`BackedPageUnsupported`]) |
//! | read   | anonymous       | none           | zero-filled frame               |
//! | other  |                 |                | destroy ([`Unexpected`])        |
//!
//! The refcount-1 case is what makes copy-on-write cheap: the last sharer of
//! a frame simply gets its write permission back.
//!
//! Kernel-mode page faults are kernel bugs and panic.
//!
//! [`NoRegion`]: FaultViolation::NoRegion
//! [`WriteToReadOnly`]: FaultViolation::WriteToReadOnly
//! [`BackedPageUnsupported`]: FaultViolation::BackedPageUnsupported
//! [`Unexpected`]: FaultViolation::Unexpected

use crate::cpu::CpuId;
use crate::env::EnvId;
use crate::error::FaultViolation;
use crate::kernel::Kernel;
use crate::memory::EnvMemory;
use crate::vma::RegionKind;
use bitfield_struct::bitfield;
use kernel_memory_addresses::{VirtualAddress, VirtualPage};
use kernel_vmem::{AddressSpace, FrameAlloc, FrameFill, PageFlags};
use log::{trace, warn};

/// The error code the CPU pushes for a page fault (low seven bits used).
#[bitfield(u64)]
#[derive(PartialEq, Eq)]
pub struct FaultCode {
    /// The translation was present; the access violated its protection.
    pub present: bool,
    /// The access was a write.
    pub write: bool,
    /// The access came from ring 3.
    pub user: bool,
    pub reserved_bit: bool,
    /// The access was an instruction fetch.
    pub instruction_fetch: bool,
    pub protection_key: bool,
    pub shadow_stack: bool,
    #[bits(57)]
    __: u64,
}

impl FaultCode {
    /// Error code of a user-mode access to a page that is not mapped.
    #[must_use]
    pub const fn user_access(write: bool) -> Self {
        Self::new().with_user(true).with_write(write)
    }

    /// Error code of a user-mode write to a present, write-protected page.
    #[must_use]
    pub const fn user_protection_write() -> Self {
        Self::user_access(true).with_present(true)
    }

    #[must_use]
    pub const fn explain(&self) -> &'static str {
        if !self.present() {
            "Non-present page (page not mapped or swapped out)"
        } else if self.instruction_fetch() {
            if self.user() {
                "User-mode instruction fetch on protected page (likely NX or SMEP)"
            } else {
                "Kernel instruction fetch on protected page"
            }
        } else if self.write() {
            "Write access to protected page"
        } else {
            "Read access to protected page"
        }
    }
}

/// A page fault as delivered by the trap handler.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct PageFault {
    /// Faulting address (CR2).
    pub addr: VirtualAddress,
    pub code: FaultCode,
}

impl PageFault {
    #[must_use]
    pub const fn new(addr: VirtualAddress, code: FaultCode) -> Self {
        Self { addr, code }
    }
}

/// How a fault was resolved.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Resolution {
    /// A zero-filled frame was mapped.
    Materialized,
    /// The sole owner of a copy-on-write frame got write access back.
    GrantedWrite,
    /// A shared frame was copied into a private, writable one.
    Copied,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum FaultOutcome {
    /// Retry the faulting instruction.
    Resolved(Resolution),
    /// The faulting environment was destroyed; reschedule.
    Destroyed(FaultViolation),
}

impl<F, A> Kernel<F, A>
where
    F: FrameAlloc,
    A: AddressSpace + Default,
{
    /// Resolve a page fault of the environment running on `cpu`.
    ///
    /// # Panics
    /// On a kernel-mode fault, or a user fault with no environment current on
    /// `cpu`; both are kernel bugs.
    pub fn handle_page_fault(&mut self, cpu: CpuId, fault: PageFault) -> FaultOutcome {
        assert!(
            fault.code.user(),
            "kernel page fault at {}: {}",
            fault.addr,
            fault.code.explain()
        );
        let Some(id) = self.current(cpu) else {
            panic!("user page fault at {} without an environment on CPU {cpu}", fault.addr);
        };

        match self.resolve_fault(id, fault) {
            Ok(resolution) => {
                trace!("[{id}] fault at {} resolved: {resolution:?}", fault.addr);
                FaultOutcome::Resolved(resolution)
            }
            Err(violation) => {
                let ip = self.env(id).map_or(0, |e| e.frame.rip);
                warn!(
                    "[{id}] user fault va {} ip {ip:#010x}: {violation} ({})",
                    fault.addr,
                    fault.code.explain()
                );
                if let Some(regions) = self.env(id).and_then(|e| e.regions()) {
                    regions.dump(id);
                }
                if let Err(e) = self.destroy_env(cpu, id) {
                    warn!("[{id}] destroy after fault failed: {e}");
                }
                FaultOutcome::Destroyed(violation)
            }
        }
    }

    fn resolve_fault(&mut self, id: EnvId, fault: PageFault) -> Result<Resolution, FaultViolation> {
        let memory = self.envs[id.slot()]
            .memory
            .as_mut()
            .ok_or(FaultViolation::Unexpected)?;
        let frames = &mut self.frames;

        let region = memory
            .regions
            .find_containing(fault.addr)
            .and_then(|slot| memory.regions.get(slot))
            .copied()
            .ok_or(FaultViolation::NoRegion)?;
        let page = fault.addr.page();
        let mapping = memory.aspace.lookup(page);

        if fault.code.write() {
            if !region.perm.is_writable() {
                return Err(FaultViolation::WriteToReadOnly);
            }
            let Some(mapping) = mapping else {
                return materialize(memory, frames, page, region.perm);
            };

            if frames.ref_count(mapping.frame) == 1 {
                memory.aspace.protect(page, mapping.flags | PageFlags::WRITE);
                memory.aspace.invalidate(page);
                return Ok(Resolution::GrantedWrite);
            }

            let copy = frames
                .allocate(FrameFill::Uninit)
                .ok_or(FaultViolation::OutOfFrames)?;
            frames.copy_frame(mapping.frame, copy);
            if memory.aspace.map(frames, page, copy, region.perm).is_err() {
                frames.release(copy);
                return Err(FaultViolation::OutOfFrames);
            }
            memory.aspace.invalidate(page);
            return Ok(Resolution::Copied);
        }

        match (region.kind, mapping) {
            (RegionKind::Backed, None) => Err(FaultViolation::BackedPageUnsupported),
            (RegionKind::Anonymous, None) => materialize(memory, frames, page, region.perm),
            _ => Err(FaultViolation::Unexpected),
        }
    }
}

fn materialize<A, F>(
    memory: &mut EnvMemory<A>,
    frames: &mut F,
    page: VirtualPage,
    perm: PageFlags,
) -> Result<Resolution, FaultViolation>
where
    A: AddressSpace,
    F: FrameAlloc,
{
    let frame = frames
        .allocate(FrameFill::Zeroed)
        .ok_or(FaultViolation::OutOfFrames)?;
    if memory.aspace.map(frames, page, frame, perm).is_err() {
        frames.release(frame);
        return Err(FaultViolation::OutOfFrames);
    }
    Ok(Resolution::Materialized)
}
