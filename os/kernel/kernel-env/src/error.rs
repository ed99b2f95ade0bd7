//! Error types of the environment core.
//!
//! Resource exhaustion and invalid references are returned to the caller.
//! Policy violations by a faulting environment are not errors of any call;
//! they end up in [`FaultOutcome::Destroyed`](crate::fault::FaultOutcome).

use crate::cpu::CpuId;
use crate::env::EnvId;
use crate::syscall::Errno;
use kernel_memory_addresses::{VirtualAddress, VirtualRange};
use kernel_vmem::MapError;

#[derive(Debug, Clone, Copy, Eq, PartialEq, thiserror::Error)]
pub enum RegionError {
    #[error("region length must be non-zero")]
    EmptyRange,
    #[error("region table is full")]
    TableFull,
    #[error("{0:?} overlaps an existing region")]
    Overlap(VirtualRange),
    #[error("no region contains {0}")]
    NotFound(VirtualAddress),
    #[error("{0:?} exceeds the bounds of its region")]
    OutOfBounds(VirtualRange),
    #[error("no free virtual range of {0:#x} bytes")]
    NoFreeRange(u64),
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, thiserror::Error)]
pub enum EnvError {
    #[error("no free environment slot")]
    NoFreeEnv,
    #[error("bad environment {0}")]
    BadEnv(EnvId),
    #[error("out of physical memory")]
    OutOfMemory,
    #[error("segment data lies outside the program image")]
    BadImage,
    #[error(transparent)]
    Region(#[from] RegionError),
}

impl From<MapError> for EnvError {
    fn from(_: MapError) -> Self {
        Self::OutOfMemory
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, thiserror::Error)]
pub enum ShmError {
    #[error("shared memory key 0 is reserved")]
    ZeroKey,
    #[error("shared memory key {0:#x} is already in use")]
    KeyInUse(u32),
    #[error("no shared memory with key {0:#x}")]
    NotFound(u32),
    #[error("{0:?} is already occupied in the caller")]
    RangeOccupied(VirtualRange),
    #[error(transparent)]
    Env(#[from] EnvError),
}

impl From<RegionError> for ShmError {
    fn from(e: RegionError) -> Self {
        Self::Env(EnvError::Region(e))
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, thiserror::Error)]
pub enum SyscallError {
    #[error("no environment is running on CPU {0}")]
    NoCurrentEnv(CpuId),
    #[error("not implemented")]
    NotImplemented,
    /// A register argument does not fit the parameter it encodes.
    #[error("argument {0:#x} out of range")]
    BadArgument(u64),
    #[error(transparent)]
    Env(#[from] EnvError),
    #[error(transparent)]
    Shm(#[from] ShmError),
}

impl From<RegionError> for SyscallError {
    fn from(e: RegionError) -> Self {
        Self::Env(EnvError::Region(e))
    }
}

impl SyscallError {
    /// The error number reported to user space.
    #[must_use]
    pub const fn errno(&self) -> Errno {
        match self {
            Self::NoCurrentEnv(_)
            | Self::Env(EnvError::BadEnv(_))
            | Self::Shm(ShmError::Env(EnvError::BadEnv(_))) => Errno::BadEnv,
            Self::NotImplemented => Errno::NoSys,
            Self::Env(EnvError::NoFreeEnv) => Errno::NoFreeEnv,
            Self::Env(
                EnvError::OutOfMemory
                | EnvError::Region(RegionError::TableFull | RegionError::NoFreeRange(_)),
            )
            | Self::Shm(ShmError::Env(EnvError::OutOfMemory)) => Errno::NoMem,
            Self::BadArgument(_)
            | Self::Env(EnvError::BadImage | EnvError::Region(_))
            | Self::Shm(_) => Errno::Inval,
        }
    }
}

/// Why a faulting environment was destroyed.
#[derive(Debug, Clone, Copy, Eq, PartialEq, thiserror::Error)]
pub enum FaultViolation {
    #[error("no region covers the address")]
    NoRegion,
    #[error("write to a read-only region")]
    WriteToReadOnly,
    #[error("transfer of image-backed pages is not supported")]
    BackedPageUnsupported,
    #[error("out of physical memory")]
    OutOfFrames,
    #[error("unexpected fault for this region")]
    Unexpected,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_classifies_exhaustion_and_bad_references() {
        assert_eq!(SyscallError::from(EnvError::NoFreeEnv).errno(), Errno::NoFreeEnv);
        assert_eq!(SyscallError::from(RegionError::TableFull).errno(), Errno::NoMem);
        assert_eq!(SyscallError::NotImplemented.errno(), Errno::NoSys);
        assert_eq!(
            SyscallError::from(ShmError::NotFound(0x42)).errno(),
            Errno::Inval
        );
        assert_eq!(
            SyscallError::from(EnvError::BadEnv(EnvId::new())).errno(),
            Errno::BadEnv
        );
        assert_eq!(
            SyscallError::from(ShmError::Env(EnvError::BadEnv(EnvId::new()))).errno(),
            Errno::BadEnv
        );
        assert_eq!(SyscallError::BadArgument(u64::MAX).errno(), Errno::Inval);
    }
}
