//! # Scheduler
//!
//! Round-robin over the environment table with time slices and wait
//! dependencies.
//!
//! A CPU keeps running its current environment until the environment's
//! slice is used up or it yields. The successor is the first
//! [`Runnable`](EnvStatus::Runnable) environment after the current one in
//! table order, wrapping around; the current environment itself comes last.
//! An environment with a [`wait_target`](crate::Env::wait_target) is skipped
//! while its target is still runnable or running; once the target is gone or
//! blocked, the wait is cleared and the environment gets a fresh slice.
//!
//! Every decision ends in exactly one [`Dispatch`]. On a multi-CPU system the
//! decision is made under the kernel lock, and [`reschedule`] gives the lock
//! up before the CPU acts on it.

use crate::cpu::{CpuId, CpuStatus};
use crate::env::{EnvId, EnvStatus};
use crate::error::EnvError;
use crate::kernel::Kernel;
use core::cell::Cell;
use kernel_sync::KernelLockGuard;
use kernel_vmem::{AddressSpace, FrameAlloc};
use log::{debug, info, trace};

/// Monotonic time source, e.g. the time stamp counter.
pub trait Clock {
    fn now(&self) -> u64;
}

/// A [`Clock`] that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: Cell<u64>,
}

impl ManualClock {
    #[must_use]
    pub const fn new(now: u64) -> Self {
        Self { now: Cell::new(now) }
    }

    pub fn set(&self, now: u64) {
        self.now.set(now);
    }

    pub fn advance(&self, ticks: u64) {
        self.now.set(self.now.get().wrapping_add(ticks));
    }
}

impl Clock for ManualClock {
    fn now(&self) -> u64 {
        self.now.get()
    }
}

/// What a CPU does when it leaves the kernel.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Dispatch {
    /// Resume the environment with its saved trap frame.
    Run(EnvId),
    /// Idle until the next timer interrupt.
    Halt,
    /// Nothing in the whole system can run; enter the kernel monitor.
    Monitor,
}

impl<F, A> Kernel<F, A>
where
    F: FrameAlloc,
    A: AddressSpace + Default,
{
    /// Decide what `cpu` runs next.
    ///
    /// With `force` the current environment gives up the rest of its slice,
    /// as on an explicit yield.
    pub fn schedule(&mut self, cpu: CpuId, force: bool, clock: &impl Clock) -> Dispatch {
        if let Some(id) = self.current(cpu) {
            let index = id.slot();
            if self.envs[index].status == EnvStatus::Dying {
                debug!("[{id}] dying env reaped on CPU {cpu}");
                self.free_env(index);
            }
        }

        let current = self
            .current(cpu)
            .filter(|id| self.envs[id.slot()].status == EnvStatus::Running);

        let Some(id) = current else {
            let start = self.cpu(cpu).last_index.map_or(0, |i| i + 1);
            return match self.pick(start) {
                Some(next) => self.run(cpu, next),
                None => self.halt(cpu),
            };
        };

        let elapsed = self.measure(clock);
        let quantum = self.config.time_slice;
        let env = &mut self.envs[id.slot()];
        if !force && elapsed < env.time_slice {
            env.time_slice -= elapsed;
            trace!("[{id}] keeps CPU {cpu}, {} left", env.time_slice);
            return Dispatch::Run(id);
        }
        env.time_slice = quantum;
        env.status = EnvStatus::Runnable;

        let index = id.slot();
        let after = (index + 1) % self.envs.len();
        let next = &self.envs[after];
        if next.status == EnvStatus::Runnable && next.wait_target.is_none() {
            let next = next.id;
            return self.run(cpu, next);
        }

        match self.pick(after) {
            Some(next) => self.run(cpu, next),
            None => self.halt(cpu),
        }
    }

    /// Ticks since the previous measurement. The first measurement reads 0;
    /// a clock that went backwards (wrapped) counts from zero.
    fn measure(&mut self, clock: &impl Clock) -> u64 {
        let now = clock.now();
        let elapsed = match self.last_measure {
            None => 0,
            Some(last) if now < last => now,
            Some(last) => now - last,
        };
        self.last_measure = Some(now);
        elapsed
    }

    /// First acceptable environment in circular order from slot `start`.
    fn pick(&mut self, start: usize) -> Option<EnvId> {
        let n = self.envs.len();
        for offset in 0..n {
            let index = (start + offset) % n;
            if self.envs[index].status != EnvStatus::Runnable {
                continue;
            }
            if let Some(target) = self.envs[index].wait_target {
                let blocked = self
                    .env(target)
                    .is_some_and(|t| matches!(t.status, EnvStatus::Runnable | EnvStatus::Running));
                if blocked {
                    continue;
                }
                let quantum = self.config.time_slice;
                let waiter = &mut self.envs[index];
                trace!("[{}] wait on {target} satisfied", waiter.id);
                waiter.wait_target = None;
                waiter.time_slice = quantum;
            }
            return Some(self.envs[index].id);
        }
        None
    }

    /// Make `id` the environment running on `cpu`.
    pub(crate) fn run(&mut self, cpu: CpuId, id: EnvId) -> Dispatch {
        if let Some(previous) = self.current(cpu).filter(|p| *p != id) {
            let previous = &mut self.envs[previous.slot()];
            if previous.status == EnvStatus::Running {
                previous.status = EnvStatus::Runnable;
            }
        }

        let env = &mut self.envs[id.slot()];
        env.status = EnvStatus::Running;
        env.runs = env.runs.saturating_add(1);
        env.cpu = Some(cpu);

        let state = self.cpu_mut(cpu);
        state.current = Some(id);
        state.last_index = Some(id.slot());
        state.status = CpuStatus::Started;
        trace!("[{id}] runs on CPU {cpu}");
        Dispatch::Run(id)
    }

    fn halt(&mut self, cpu: CpuId) -> Dispatch {
        let alive = self.envs.iter().any(|e| {
            matches!(
                e.status,
                EnvStatus::Runnable | EnvStatus::Running | EnvStatus::Dying
            )
        });
        let state = self.cpu_mut(cpu);
        state.current = None;
        if !alive {
            info!("no runnable environments in the system");
            return Dispatch::Monitor;
        }
        state.status = CpuStatus::Halted;
        trace!("CPU {cpu} halted");
        Dispatch::Halt
    }

    /// Run `id` on `cpu` right away, bypassing the round-robin order; this is
    /// how the first environment is started.
    ///
    /// # Errors
    /// [`EnvError::BadEnv`] if `id` is not live or already running on
    /// another CPU.
    pub fn dispatch(&mut self, cpu: CpuId, id: EnvId) -> Result<Dispatch, EnvError> {
        let env = self.env(id).ok_or(EnvError::BadEnv(id))?;
        let elsewhere = env.status == EnvStatus::Running && env.cpu != Some(cpu);
        if elsewhere || !matches!(env.status, EnvStatus::Runnable | EnvStatus::Running) {
            return Err(EnvError::BadEnv(id));
        }
        Ok(self.run(cpu, id))
    }

    /// Timer tick on `cpu`. Returns `true` if the CPU was halted and must
    /// now take the kernel lock and schedule.
    pub fn wake(&mut self, cpu: CpuId) -> bool {
        let state = self.cpu_mut(cpu);
        let halted = state.status == CpuStatus::Halted;
        state.status = CpuStatus::Started;
        halted
    }
}

/// Schedule on the guard's CPU and release the kernel lock.
///
/// The guard is consumed, so the lock is never held while the CPU runs an
/// environment or sits halted.
pub fn reschedule<F, A>(
    mut guard: KernelLockGuard<'_, Kernel<F, A>>,
    force: bool,
    clock: &impl Clock,
) -> Dispatch
where
    F: FrameAlloc,
    A: AddressSpace + Default,
{
    let cpu = guard.cpu();
    let dispatch = guard.schedule(cpu, force, clock);
    drop(guard);
    dispatch
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::KernelConfig;
    use crate::env::EnvKind;
    use kernel_alloc::frame_alloc::FramePool;
    use kernel_vmem::PageMap;

    const SLICE: u64 = 100;

    fn kernel(envs: usize) -> Kernel<FramePool, PageMap> {
        Kernel::new(
            KernelConfig::default()
                .with_max_envs(envs)
                .with_cpus(2)
                .with_time_slice(SLICE),
            FramePool::new(64),
        )
    }

    fn spawn(k: &mut Kernel<FramePool, PageMap>) -> EnvId {
        k.alloc_env(None, EnvKind::User).unwrap()
    }

    #[test]
    fn clock_measurement_handles_first_reading_and_wraparound() {
        let mut k = kernel(2);
        let clock = ManualClock::new(1_000);
        assert_eq!(k.measure(&clock), 0);
        clock.advance(40);
        assert_eq!(k.measure(&clock), 40);
        clock.set(7);
        assert_eq!(k.measure(&clock), 7);
    }

    #[test]
    fn current_env_keeps_the_cpu_within_its_slice() {
        let mut k = kernel(4);
        let a = spawn(&mut k);
        let _b = spawn(&mut k);
        let clock = ManualClock::new(0);

        assert_eq!(k.schedule(0, false, &clock), Dispatch::Run(a));
        assert_eq!(k.schedule(0, false, &clock), Dispatch::Run(a));
        clock.advance(30);
        assert_eq!(k.schedule(0, false, &clock), Dispatch::Run(a));
        assert_eq!(k.env(a).unwrap().time_slice(), SLICE - 30);
        assert_eq!(k.env(a).unwrap().runs(), 1);
    }

    #[test]
    fn expired_slice_moves_to_the_next_slot() {
        let mut k = kernel(4);
        let a = spawn(&mut k);
        let b = spawn(&mut k);
        let clock = ManualClock::new(0);

        assert_eq!(k.schedule(0, false, &clock), Dispatch::Run(a));
        k.schedule(0, false, &clock);
        clock.advance(SLICE);
        assert_eq!(k.schedule(0, false, &clock), Dispatch::Run(b));
        assert_eq!(k.env(a).unwrap().status(), EnvStatus::Runnable);
        assert_eq!(k.env(a).unwrap().time_slice(), SLICE);
    }

    #[test]
    fn forced_yield_with_nobody_else_reruns_the_caller() {
        let mut k = kernel(4);
        let a = spawn(&mut k);
        let clock = ManualClock::new(0);
        k.schedule(0, false, &clock);
        assert_eq!(k.schedule(0, true, &clock), Dispatch::Run(a));
        assert_eq!(k.env(a).unwrap().runs(), 2);
    }

    #[test]
    fn waiter_is_skipped_until_its_target_is_gone() {
        let mut k = kernel(4);
        let a = spawn(&mut k);
        let b = spawn(&mut k);
        let clock = ManualClock::new(0);

        k.envs[a.slot()].wait_target = Some(b);
        assert_eq!(k.schedule(0, false, &clock), Dispatch::Run(b));
        assert_eq!(k.schedule(0, true, &clock), Dispatch::Run(b));

        k.destroy_env(0, b).unwrap();
        assert_eq!(k.schedule(0, false, &clock), Dispatch::Run(a));
        assert_eq!(k.env(a).unwrap().wait_target(), None);
    }

    #[test]
    fn nothing_runnable_halts_or_falls_back_to_the_monitor() {
        let mut k = kernel(4);
        let clock = ManualClock::new(0);
        assert_eq!(k.schedule(0, false, &clock), Dispatch::Monitor);

        let a = spawn(&mut k);
        assert_eq!(k.schedule(1, false, &clock), Dispatch::Run(a));
        assert_eq!(k.schedule(0, false, &clock), Dispatch::Halt);
        assert_eq!(k.cpu(0).status(), CpuStatus::Halted);
        assert_eq!(k.current(0), None);

        assert!(k.wake(0));
        assert!(!k.wake(0));
        assert_eq!(k.cpu(0).status(), CpuStatus::Started);
    }

    #[test]
    fn dispatch_refuses_an_env_running_elsewhere() {
        let mut k = kernel(4);
        let a = spawn(&mut k);
        assert_eq!(k.dispatch(0, a), Ok(Dispatch::Run(a)));
        assert_eq!(k.dispatch(1, a), Err(EnvError::BadEnv(a)));
    }
}
