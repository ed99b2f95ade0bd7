mod common;

use common::{kernel, spawn, write};
use kernel_env::image::ProgramImage;
use kernel_env::memory::RegionFlags;
use kernel_env::trap::{KERNEL_CS, USER_CS};
use kernel_env::{EnvError, EnvKind, EnvStatus};
use kernel_info::memory::HHDM_BASE;
use kernel_vmem::{PAGE_SIZE, PageFlags, VirtualAddress};

#[test]
fn slots_are_handed_out_lowest_first_then_most_recently_freed() {
    let mut k = kernel(4, 32);
    let a = spawn(&mut k);
    let b = spawn(&mut k);
    let c = spawn(&mut k);
    assert_eq!([a.slot(), b.slot(), c.slot()], [0, 1, 2]);

    k.destroy_env(0, b).unwrap();
    k.destroy_env(0, a).unwrap();
    assert_eq!(spawn(&mut k).slot(), 0);
    assert_eq!(spawn(&mut k).slot(), 1);
}

#[test]
fn a_reused_slot_does_not_answer_to_the_old_id() {
    let mut k = kernel(2, 32);
    let old = spawn(&mut k);
    k.destroy_env(0, old).unwrap();
    let new = spawn(&mut k);

    assert_eq!(new.slot(), old.slot());
    assert_ne!(new, old);
    assert!(k.env(old).is_none());
    assert_eq!(k.destroy_env(0, old), Err(EnvError::BadEnv(old)));
    assert_eq!(k.resolve(0, old, false), Err(EnvError::BadEnv(old)));
    assert!(k.env(new).is_some());
}

#[test]
fn table_exhaustion_reports_no_free_env() {
    let mut k = kernel(2, 32);
    spawn(&mut k);
    spawn(&mut k);
    let image = ProgramImage::entry_only(VirtualAddress::zero());
    assert_eq!(k.create_env(EnvKind::User, &image), Err(EnvError::NoFreeEnv));
}

#[test]
fn destroy_returns_every_frame_to_the_pool() {
    let mut k = kernel(4, 32);
    let total = k.frames().free_count();
    let id = spawn(&mut k);
    k.dispatch(0, id).unwrap();
    let va = k
        .region_create(id, 3 * PAGE_SIZE, PageFlags::RW, RegionFlags::POPULATE)
        .unwrap();
    write(&mut k, 0, va, 1);
    let child = k.fork(0).unwrap();
    assert!(k.frames().free_count() < total);

    k.destroy_env(0, child).unwrap();
    k.destroy_env(0, id).unwrap();
    assert_eq!(k.frames().free_count(), total);
    assert_eq!(k.free_slots(), 4);
}

#[test]
fn region_destroy_unmaps_only_uncovered_pages() {
    let mut k = kernel(4, 32);
    let id = spawn(&mut k);
    let va = k
        .region_create(id, 3 * PAGE_SIZE, PageFlags::RW, RegionFlags::POPULATE)
        .unwrap();
    let before = k.frames().free_count();

    let middle = VirtualAddress::new(va.as_u64() + PAGE_SIZE);
    k.region_destroy(id, middle, PAGE_SIZE).unwrap();
    assert_eq!(k.frames().free_count(), before + 1);
    assert_eq!(k.env(id).unwrap().regions().unwrap().len(), 3);
}

#[test]
fn kernel_services_start_in_ring_zero() {
    let mut k = kernel(4, 32);
    let user = spawn(&mut k);
    let service = k
        .create_env(
            EnvKind::KernelService,
            &ProgramImage::entry_only(VirtualAddress::new(0xffff_8000_0000_1000)),
        )
        .unwrap();

    assert_eq!(k.env(user).unwrap().frame().cs, USER_CS);
    let env = k.env(service).unwrap();
    assert_eq!(env.kind(), EnvKind::KernelService);
    assert_eq!(env.frame().cs, KERNEL_CS);
    assert_eq!(env.status(), EnvStatus::Runnable);
    assert!(env.regions().unwrap().is_empty());
}

#[test]
fn kernel_services_run_on_their_own_stack_frame() {
    let mut k = kernel(4, 32);
    let before = k.frames().free_count();
    let service = k
        .create_env(
            EnvKind::KernelService,
            &ProgramImage::entry_only(VirtualAddress::new(0xdead_0000)),
        )
        .unwrap();

    // Region table plus stack.
    assert_eq!(k.frames().free_count(), before - 2);
    let env = k.env(service).unwrap();
    let stack = env.memory().unwrap().kernel_stack().unwrap();
    assert!(k.frames().is_allocated(stack));
    assert_ne!(env.frame().rsp, 0);
    assert_eq!(env.frame().rsp, HHDM_BASE + stack.base() + PAGE_SIZE);

    k.destroy_env(0, service).unwrap();
    assert_eq!(k.frames().free_count(), before);
    assert!(!k.frames().is_allocated(stack));
}

#[test]
fn user_environments_have_no_kernel_stack() {
    let mut k = kernel(4, 32);
    let user = spawn(&mut k);
    assert_eq!(k.env(user).unwrap().memory().unwrap().kernel_stack(), None);
}
