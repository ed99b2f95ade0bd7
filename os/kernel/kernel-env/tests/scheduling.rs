mod common;

use common::{SLICE, kernel, spawn};
use kernel_env::sched::{ManualClock, reschedule};
use kernel_env::{CpuStatus, Dispatch, EnvStatus};
use kernel_sync::KernelLock;

#[test]
fn timer_ticks_rotate_through_every_runnable_env() {
    let mut k = kernel(8, 32);
    let envs = [spawn(&mut k), spawn(&mut k), spawn(&mut k)];
    let clock = ManualClock::new(10);

    let mut order = Vec::new();
    for _ in 0..7 {
        match k.schedule(0, false, &clock) {
            Dispatch::Run(id) => order.push(id),
            other => panic!("unexpected {other:?}"),
        }
        clock.advance(SLICE + 1);
    }

    // The first two decisions run envs[0]: one to start it, one to take the
    // clock's first reading.
    assert_eq!(
        order,
        [envs[0], envs[0], envs[1], envs[2], envs[0], envs[1], envs[2]]
    );
    for id in envs {
        assert!(k.env(id).unwrap().runs() >= 2);
    }
}

#[test]
fn waiter_resumes_after_its_target_exits() {
    let mut k = kernel(8, 32);
    let waiter = spawn(&mut k);
    let worker = spawn(&mut k);
    let clock = ManualClock::new(0);

    assert_eq!(k.schedule(0, false, &clock), Dispatch::Run(waiter));
    k.sys_wait(0, worker).unwrap();
    assert_eq!(k.env(waiter).unwrap().wait_target(), Some(worker));

    assert_eq!(k.sys_yield(0, &clock), Dispatch::Run(worker));
    // Still blocked: the worker keeps the CPU even on yield.
    assert_eq!(k.sys_yield(0, &clock), Dispatch::Run(worker));

    k.sys_env_destroy(0, worker).unwrap();
    assert_eq!(k.schedule(0, false, &clock), Dispatch::Run(waiter));
    let env = k.env(waiter).unwrap();
    assert_eq!(env.wait_target(), None);
    assert_eq!(env.time_slice(), SLICE);
}

#[test]
fn waiting_on_oneself_or_a_stale_id_is_rejected() {
    let mut k = kernel(8, 32);
    let a = spawn(&mut k);
    let b = spawn(&mut k);
    k.dispatch(0, a).unwrap();

    assert!(k.sys_wait(0, a).is_err());
    k.destroy_env(0, b).unwrap();
    assert!(k.sys_wait(0, b).is_err());
    assert_eq!(k.env(a).unwrap().wait_target(), None);
}

#[test]
fn destroying_an_env_running_on_another_cpu_defers_to_that_cpu() {
    let mut k = kernel(8, 32);
    let parent = spawn(&mut k);
    k.dispatch(0, parent).unwrap();
    let child = k.fork(0).unwrap();
    k.dispatch(1, child).unwrap();
    let free_frames = k.frames().free_count();

    k.sys_env_destroy(0, child).unwrap();
    assert_eq!(k.env(child).unwrap().status(), EnvStatus::Dying);
    assert_eq!(k.frames().free_count(), free_frames);

    let clock = ManualClock::new(0);
    assert_eq!(k.schedule(1, false, &clock), Dispatch::Halt);
    assert!(k.env(child).is_none());
    assert_eq!(k.frames().free_count(), free_frames + 1);
    assert_eq!(k.cpu(1).status(), CpuStatus::Halted);
}

#[test]
fn reschedule_releases_the_kernel_lock() {
    let mut k = kernel(4, 16);
    let id = spawn(&mut k);
    let lock = KernelLock::new(k);
    let clock = ManualClock::new(0);

    let guard = lock.lock(1);
    assert_eq!(lock.holder(), Some(1));
    assert_eq!(reschedule(guard, false, &clock), Dispatch::Run(id));
    assert!(!lock.is_locked());

    let guard = lock.lock(0);
    assert_eq!(reschedule(guard, false, &clock), Dispatch::Halt);
    assert!(!lock.is_locked());
    assert_eq!(lock.into_inner().current(1), Some(id));
}
