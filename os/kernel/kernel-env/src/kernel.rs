use crate::config::KernelConfig;
use crate::cpu::{Cpu, CpuId};
use crate::env::{Env, EnvId, EnvStatus};
use crate::error::EnvError;
use alloc::vec::Vec;
use kernel_vmem::{AddressSpace, FrameAlloc};
use log::info;

/// All kernel state reachable by the environment core.
///
/// `F` is the frame allocator, `A` the page table type of one environment.
/// The table of environments is allocated once and never grows; free slots
/// are kept on a LIFO free list so a freed slot is the first to be reused.
pub struct Kernel<F, A> {
    pub(crate) config: KernelConfig,
    pub(crate) frames: F,
    pub(crate) envs: Vec<Env<A>>,
    /// Free slot indices; the next slot to hand out is on top.
    pub(crate) free: Vec<u16>,
    pub(crate) cpus: Vec<Cpu>,
    /// Clock reading at the last scheduling decision that measured time.
    pub(crate) last_measure: Option<u64>,
}

impl<F, A> Kernel<F, A>
where
    F: FrameAlloc,
    A: AddressSpace + Default,
{
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn new(config: KernelConfig, frames: F) -> Self {
        let config = config.clamped();
        let envs = (0..config.max_envs)
            .map(|index| Env::vacant(index as u16))
            .collect();
        let free = (0..config.max_envs as u16).rev().collect();
        info!(
            "kernel: {} environment slots, {} CPUs, time slice {}",
            config.max_envs, config.cpus, config.time_slice
        );
        Self {
            config,
            frames,
            envs,
            free,
            cpus: alloc::vec![Cpu::default(); config.cpus],
            last_measure: None,
        }
    }
}

impl<F, A> Kernel<F, A> {
    #[must_use]
    pub const fn config(&self) -> &KernelConfig {
        &self.config
    }

    #[must_use]
    pub const fn frames(&self) -> &F {
        &self.frames
    }

    pub const fn frames_mut(&mut self) -> &mut F {
        &mut self.frames
    }

    /// The live environment named exactly by `id`.
    #[must_use]
    pub fn env(&self, id: EnvId) -> Option<&Env<A>> {
        self.envs
            .get(id.slot())
            .filter(|e| e.status != EnvStatus::Free && e.id == id)
    }

    pub fn env_mut(&mut self, id: EnvId) -> Option<&mut Env<A>> {
        self.envs
            .get_mut(id.slot())
            .filter(|e| e.status != EnvStatus::Free && e.id == id)
    }

    /// All allocated environments in table order.
    pub fn envs(&self) -> impl Iterator<Item = &Env<A>> + '_ {
        self.envs.iter().filter(|e| !e.is_free())
    }

    /// Number of free environment slots.
    #[must_use]
    pub fn free_slots(&self) -> usize {
        self.free.len()
    }

    /// # Panics
    /// If `cpu` is not a configured CPU.
    #[must_use]
    pub fn cpu(&self, cpu: CpuId) -> &Cpu {
        assert!(cpu < self.cpus.len(), "no CPU {cpu}");
        &self.cpus[cpu]
    }

    pub(crate) fn cpu_mut(&mut self, cpu: CpuId) -> &mut Cpu {
        assert!(cpu < self.cpus.len(), "no CPU {cpu}");
        &mut self.cpus[cpu]
    }

    /// The environment `cpu` is running.
    #[must_use]
    pub fn current(&self, cpu: CpuId) -> Option<EnvId> {
        self.cpu(cpu).current
    }

    /// Slot index of the live environment `id`.
    pub(crate) fn live_index(&self, id: EnvId) -> Result<usize, EnvError> {
        self.env(id).map(|e| e.id.slot()).ok_or(EnvError::BadEnv(id))
    }
}
