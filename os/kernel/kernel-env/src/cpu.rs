//! Per-CPU scheduling state.

use crate::env::EnvId;

/// Index of a CPU; also the holder id recorded by the kernel lock.
pub type CpuId = usize;

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum CpuStatus {
    #[default]
    Started,
    /// Idle until the next timer interrupt.
    Halted,
}

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct Cpu {
    pub(crate) status: CpuStatus,
    /// Environment this CPU is running.
    pub(crate) current: Option<EnvId>,
    /// Table index of the environment this CPU ran last; the round-robin scan
    /// starts right after it.
    pub(crate) last_index: Option<usize>,
}

impl Cpu {
    #[must_use]
    pub const fn status(&self) -> CpuStatus {
        self.status
    }

    #[must_use]
    pub const fn current(&self) -> Option<EnvId> {
        self.current
    }
}
