//! Runtime configuration of the environment core.

use crate::vma::MergePolicy;
use kernel_info::env::{MAX_CPUS, MAX_ENVS, TIME_SLICE};

/// Sizing and policy knobs of a [`Kernel`](crate::Kernel).
///
/// The defaults come from `kernel_info`. Table sizes are clamped to what an
/// environment id can address when the kernel is built.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct KernelConfig {
    /// Number of environment slots, `1..=MAX_ENVS`.
    pub max_envs: usize,
    /// Number of CPUs, `1..=MAX_CPUS`.
    pub cpus: usize,
    /// Scheduling quantum in clock ticks.
    pub time_slice: u64,
    /// Merge behavior of newly created region tables.
    pub merge_policy: MergePolicy,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            max_envs: MAX_ENVS,
            cpus: 1,
            time_slice: TIME_SLICE,
            merge_policy: MergePolicy::default(),
        }
    }
}

impl KernelConfig {
    #[must_use]
    pub const fn with_max_envs(mut self, max_envs: usize) -> Self {
        self.max_envs = max_envs;
        self
    }

    #[must_use]
    pub const fn with_cpus(mut self, cpus: usize) -> Self {
        self.cpus = cpus;
        self
    }

    #[must_use]
    pub const fn with_time_slice(mut self, time_slice: u64) -> Self {
        self.time_slice = time_slice;
        self
    }

    #[must_use]
    pub const fn with_merge_policy(mut self, merge_policy: MergePolicy) -> Self {
        self.merge_policy = merge_policy;
        self
    }

    /// The same configuration with table sizes clamped into range.
    #[must_use]
    pub fn clamped(self) -> Self {
        Self {
            max_envs: self.max_envs.clamp(1, MAX_ENVS),
            cpus: self.cpus.clamp(1, MAX_CPUS),
            ..self
        }
    }
}
