#![allow(dead_code)]

use kernel_alloc::frame_alloc::FramePool;
use kernel_env::fault::{FaultCode, FaultOutcome, PageFault};
use kernel_env::image::ProgramImage;
use kernel_env::{CpuId, EnvId, EnvKind, Kernel, KernelConfig};
use kernel_vmem::{AddressSpace, FrameAlloc, PageMap, VirtualAddress};

pub type HostKernel = Kernel<FramePool, PageMap>;

pub const SLICE: u64 = 1_000;

pub fn kernel(max_envs: usize, frames: usize) -> HostKernel {
    Kernel::new(
        KernelConfig::default()
            .with_max_envs(max_envs)
            .with_cpus(2)
            .with_time_slice(SLICE),
        FramePool::new(frames),
    )
}

pub fn spawn(k: &mut HostKernel) -> EnvId {
    k.create_env(EnvKind::User, &ProgramImage::entry_only(VirtualAddress::new(0x80_0000)))
        .unwrap()
}

/// Byte access by the environment running on `cpu`, the way the MMU would
/// do it: a missing or write-protected translation raises a page fault and
/// the access is retried once the fault is resolved.
///
/// Returns `None` if the fault destroyed the environment.
pub fn access(k: &mut HostKernel, cpu: CpuId, va: VirtualAddress, write: Option<u8>) -> Option<u8> {
    let id = k.current(cpu).expect("nothing runs on this CPU");
    let offset = usize::try_from(va.page_offset()).unwrap();
    for _ in 0..2 {
        let mapping = k.env(id)?.address_space()?.lookup(va.page());
        match mapping {
            Some(m) if write.is_none() => {
                return Some(k.frames().bytes(m.frame)[offset]);
            }
            Some(m) if m.flags.is_writable() => {
                let value = write?;
                k.frames_mut().bytes_mut(m.frame)[offset] = value;
                return Some(value);
            }
            _ => {}
        }

        let code = if mapping.is_some() {
            FaultCode::user_protection_write()
        } else {
            FaultCode::user_access(write.is_some())
        };
        if let FaultOutcome::Destroyed(_) = k.handle_page_fault(cpu, PageFault::new(va, code)) {
            return None;
        }
    }
    panic!("fault at {va} resolved but access still faults");
}

pub fn read(k: &mut HostKernel, cpu: CpuId, va: VirtualAddress) -> Option<u8> {
    access(k, cpu, va, None)
}

pub fn write(k: &mut HostKernel, cpu: CpuId, va: VirtualAddress, value: u8) -> Option<u8> {
    access(k, cpu, va, Some(value))
}
