//! # System Calls
//!
//! Typed entry points (`sys_*`) for every call an environment can make, and
//! the raw register ABI on top of them.
//!
//! ## Register ABI
//!
//! The call number is in `rax`, up to six arguments in `rdi`, `rsi`, `rdx`,
//! `r10`, `r8` and `r9`. The result goes back into `rax`:
//!
//! | call                     | success        | failure           |
//! |--------------------------|----------------|-------------------|
//! | `fork`, `region_create`  | id / address   | `-1`              |
//! | `shared_alloc`, `_attach`| address        | `0`               |
//! | everything else          | `0` or a value | negative [`Errno`]|
//!
//! Numbers 0 and 1 are the console calls of the embedding kernel and are not
//! served here.

use crate::cpu::CpuId;
use crate::env::EnvId;
use crate::error::{EnvError, SyscallError};
use crate::kernel::Kernel;
use crate::memory::RegionFlags;
use crate::sched::{Clock, Dispatch};
use kernel_memory_addresses::VirtualAddress;
use kernel_vmem::{AddressSpace, FrameAlloc, PageFlags};
use log::{debug, info, warn};

/// System call numbers.
#[repr(u64)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum Sysno {
    GetEnvId = 2,
    EnvDestroy = 3,
    RegionCreate = 4,
    RegionDestroy = 5,
    Yield = 6,
    Wait = 7,
    Fork = 8,
    IpcRecv = 9,
    IpcSend = 10,
    SharedAlloc = 11,
    SharedAttach = 12,
}

impl TryFrom<u64> for Sysno {
    type Error = u64;

    fn try_from(value: u64) -> Result<Self, Self::Error> {
        Ok(match value {
            2 => Self::GetEnvId,
            3 => Self::EnvDestroy,
            4 => Self::RegionCreate,
            5 => Self::RegionDestroy,
            6 => Self::Yield,
            7 => Self::Wait,
            8 => Self::Fork,
            9 => Self::IpcRecv,
            10 => Self::IpcSend,
            11 => Self::SharedAlloc,
            12 => Self::SharedAttach,
            other => return Err(other),
        })
    }
}

/// Error numbers; user space sees them negated.
#[repr(i64)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum Errno {
    Unspecified = 1,
    BadEnv = 2,
    Inval = 3,
    NoMem = 4,
    NoFreeEnv = 5,
    Fault = 6,
    NoSys = 7,
}

impl Errno {
    /// The value placed in the return register.
    #[must_use]
    pub const fn as_return(self) -> u64 {
        (self as i64).wrapping_neg().cast_unsigned()
    }
}

/// What the trap handler does after a raw system call.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SyscallAction {
    /// Return to the caller.
    Resume,
    /// Call the scheduler; the caller may not continue.
    Reschedule { force: bool },
}

/// Return value of the address-returning calls on failure.
const FAILED: u64 = u64::MAX;
const NULL: u64 = 0;

impl<F, A> Kernel<F, A>
where
    F: FrameAlloc,
    A: AddressSpace + Default,
{
    fn caller(&self, cpu: CpuId) -> Result<EnvId, SyscallError> {
        self.current(cpu).ok_or(SyscallError::NoCurrentEnv(cpu))
    }

    /// # Errors
    /// [`SyscallError::NoCurrentEnv`] if nothing runs on `cpu`.
    pub fn sys_getenvid(&self, cpu: CpuId) -> Result<EnvId, SyscallError> {
        self.caller(cpu)
    }

    /// Destroy the caller or one of its children.
    ///
    /// # Errors
    /// [`EnvError::BadEnv`] if `id` is neither.
    pub fn sys_env_destroy(&mut self, cpu: CpuId, id: EnvId) -> Result<(), SyscallError> {
        let caller = self.caller(cpu)?;
        let target = self.resolve(cpu, id, true)?;
        if target == caller {
            info!("[{caller}] exiting gracefully");
        } else {
            info!("[{caller}] destroying {target}");
        }
        self.destroy_env(cpu, target)?;
        Ok(())
    }

    /// Give up the CPU.
    pub fn sys_yield(&mut self, cpu: CpuId, clock: &impl Clock) -> Dispatch {
        self.schedule(cpu, true, clock)
    }

    /// Make the caller wait until `id` is no longer runnable.
    ///
    /// Only records the dependency; the caller yields next.
    ///
    /// # Errors
    /// [`EnvError::BadEnv`] if `id` does not resolve or names the caller.
    pub fn sys_wait(&mut self, cpu: CpuId, id: EnvId) -> Result<(), SyscallError> {
        let caller = self.caller(cpu)?;
        let target = self.resolve(cpu, id, false)?;
        if target == caller {
            return Err(EnvError::BadEnv(id).into());
        }
        debug!("[{caller}] waits on {target}");
        let index = self.live_index(caller)?;
        self.envs[index].wait_target = Some(target);
        Ok(())
    }

    /// # Errors
    /// As [`Kernel::fork_env`].
    pub fn sys_fork(&mut self, cpu: CpuId) -> Result<EnvId, SyscallError> {
        let caller = self.caller(cpu)?;
        Ok(self.fork_env(caller)?)
    }

    /// Create an anonymous region; a non-zero `key` makes it shared.
    ///
    /// # Errors
    /// As [`Kernel::region_create`] or [`Kernel::shared_create`].
    pub fn sys_region_create(
        &mut self,
        cpu: CpuId,
        len: u64,
        perm: PageFlags,
        flags: RegionFlags,
        key: u32,
    ) -> Result<VirtualAddress, SyscallError> {
        let caller = self.caller(cpu)?;
        if key != 0 {
            return Ok(self.shared_create(caller, len, perm, key)?);
        }
        Ok(self.region_create(caller, len, perm, flags)?)
    }

    /// # Errors
    /// As [`Kernel::region_destroy`].
    pub fn sys_region_destroy(
        &mut self,
        cpu: CpuId,
        va: VirtualAddress,
        len: u64,
    ) -> Result<(), SyscallError> {
        let caller = self.caller(cpu)?;
        Ok(self.region_destroy(caller, va, len)?)
    }

    /// Create shared memory under `key`, readable and writable.
    ///
    /// # Errors
    /// As [`Kernel::shared_create`].
    pub fn sys_shared_alloc(
        &mut self,
        cpu: CpuId,
        len: u64,
        key: u32,
    ) -> Result<VirtualAddress, SyscallError> {
        let caller = self.caller(cpu)?;
        Ok(self.shared_create(caller, len, PageFlags::RW, key)?)
    }

    /// # Errors
    /// As [`Kernel::shared_attach`].
    pub fn sys_shared_attach(&mut self, cpu: CpuId, key: u32) -> Result<VirtualAddress, SyscallError> {
        let caller = self.caller(cpu)?;
        Ok(self.shared_attach(caller, key)?)
    }

    /// Message passing is not implemented.
    ///
    /// # Errors
    /// Always [`SyscallError::NotImplemented`].
    pub fn sys_ipc_send(
        &mut self,
        cpu: CpuId,
        target: EnvId,
        buf: VirtualAddress,
        len: u64,
    ) -> Result<(), SyscallError> {
        let caller = self.caller(cpu)?;
        warn!("[{caller}] ipc_send to {target} ({buf} +{len:#x}): not implemented");
        Err(SyscallError::NotImplemented)
    }

    /// Message passing is not implemented.
    ///
    /// # Errors
    /// Always [`SyscallError::NotImplemented`].
    pub fn sys_ipc_recv(
        &mut self,
        cpu: CpuId,
        buf: VirtualAddress,
        len: u64,
    ) -> Result<EnvId, SyscallError> {
        let caller = self.caller(cpu)?;
        warn!("[{caller}] ipc_recv ({buf} +{len:#x}): not implemented");
        Err(SyscallError::NotImplemented)
    }

    /// Serve the system call in the trap frame of the environment running on
    /// `cpu` and store the result in its `rax`.
    ///
    /// # Errors
    /// [`SyscallError::NoCurrentEnv`] if nothing runs on `cpu`. Failures of
    /// the call itself are reported to the environment, not here.
    pub fn syscall(&mut self, cpu: CpuId) -> Result<SyscallAction, SyscallError> {
        let caller = self.caller(cpu)?;
        let frame = *self.envs[caller.slot()].frame();
        let [a1, a2, a3, a4, ..] = frame.syscall_args();
        let id = |raw: u64| narrow(raw).map(EnvId::from_bits);
        let errno = |r: Result<(), SyscallError>| r.map_or_else(|e| e.errno().as_return(), |()| 0);

        let Ok(sysno) = Sysno::try_from(frame.rax) else {
            warn!("[{caller}] unknown system call {}", frame.rax);
            self.set_return(caller, Errno::NoSys.as_return());
            return Ok(SyscallAction::Resume);
        };

        let mut action = SyscallAction::Resume;
        let ret = match sysno {
            Sysno::GetEnvId => u64::from(caller.into_bits()),
            Sysno::EnvDestroy => {
                let ret = errno(id(a1).and_then(|target| self.sys_env_destroy(cpu, target)));
                if self.current(cpu) != Some(caller) {
                    action = SyscallAction::Reschedule { force: true };
                }
                ret
            }
            Sysno::RegionCreate => region_args(a2, a3, a4)
                .and_then(|(perm, flags, key)| self.sys_region_create(cpu, a1, perm, flags, key))
                .map_or(FAILED, VirtualAddress::as_u64),
            Sysno::RegionDestroy => {
                errno(self.sys_region_destroy(cpu, VirtualAddress::new(a1), a2))
            }
            Sysno::Yield => {
                action = SyscallAction::Reschedule { force: true };
                0
            }
            Sysno::Wait => errno(id(a1).and_then(|target| self.sys_wait(cpu, target))),
            Sysno::Fork => self
                .sys_fork(cpu)
                .map_or(FAILED, |child| u64::from(child.into_bits())),
            Sysno::IpcRecv => self
                .sys_ipc_recv(cpu, VirtualAddress::new(a1), a2)
                .map_or_else(|e| e.errno().as_return(), |from| u64::from(from.into_bits())),
            Sysno::IpcSend => errno(
                id(a1).and_then(|target| self.sys_ipc_send(cpu, target, VirtualAddress::new(a2), a3)),
            ),
            Sysno::SharedAlloc => narrow(a2)
                .and_then(|key| self.sys_shared_alloc(cpu, a1, key))
                .map_or(NULL, VirtualAddress::as_u64),
            Sysno::SharedAttach => narrow(a1)
                .and_then(|key| self.sys_shared_attach(cpu, key))
                .map_or(NULL, VirtualAddress::as_u64),
        };

        self.set_return(caller, ret);
        Ok(action)
    }

    /// Write `value` into `id`'s return register unless `id` is gone.
    fn set_return(&mut self, id: EnvId, value: u64) {
        if let Some(env) = self.env_mut(id) {
            env.frame.rax = value;
        }
    }
}

/// A 32-bit argument (key or environment id) from a 64-bit register.
fn narrow(raw: u64) -> Result<u32, SyscallError> {
    u32::try_from(raw).map_err(|_| SyscallError::BadArgument(raw))
}

/// Permission, flags and key of a raw `region_create`.
fn region_args(perm: u64, flags: u64, key: u64) -> Result<(PageFlags, RegionFlags, u32), SyscallError> {
    let perm = u8::try_from(perm).map_err(|_| SyscallError::BadArgument(perm))?;
    Ok((
        PageFlags::from_bits_truncate(perm),
        RegionFlags::from_bits_truncate(narrow(flags)?),
        narrow(key)?,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn call_numbers_round_trip_and_reject_console_calls() {
        assert_eq!(Sysno::try_from(8u64), Ok(Sysno::Fork));
        assert_eq!(Sysno::try_from(12u64), Ok(Sysno::SharedAttach));
        assert_eq!(Sysno::try_from(0u64), Err(0));
        assert_eq!(Sysno::try_from(13u64), Err(13));
    }

    #[test]
    fn wide_arguments_are_rejected_not_truncated() {
        assert_eq!(narrow(0x42), Ok(0x42));
        assert_eq!(narrow(0x1_0000_0042), Err(SyscallError::BadArgument(0x1_0000_0042)));
        assert!(region_args(0x100, 0, 0).is_err());
        assert!(region_args(3, 0, 1 << 32).is_err());
        assert_eq!(
            SyscallError::BadArgument(1 << 32).errno(),
            Errno::Inval
        );
    }

    #[test]
    fn errno_is_returned_negated() {
        assert_eq!(Errno::NoSys.as_return(), (-7i64).cast_unsigned());
        assert_eq!(Errno::BadEnv.as_return().cast_signed(), -2);
    }
}
