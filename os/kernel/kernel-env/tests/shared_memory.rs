mod common;

use common::{kernel, read, spawn, write};
use kernel_env::ShmError;
use kernel_vmem::PAGE_SIZE;

#[test]
fn writes_through_a_shared_region_are_visible_on_both_sides() {
    let mut k = kernel(8, 32);
    let owner = spawn(&mut k);
    let peer = spawn(&mut k);
    k.dispatch(0, owner).unwrap();
    k.dispatch(1, peer).unwrap();

    let va = k.sys_shared_alloc(0, 500, 0x42).unwrap();
    assert_eq!(k.sys_shared_attach(1, 0x42), Ok(va));

    assert_eq!(write(&mut k, 0, va, 0xAB), Some(0xAB));
    assert_eq!(read(&mut k, 1, va), Some(0xAB));
    assert_eq!(write(&mut k, 1, va, 0xCD), Some(0xCD));
    assert_eq!(read(&mut k, 0, va), Some(0xCD));
}

#[test]
fn attach_with_an_unused_key_finds_nothing() {
    let mut k = kernel(8, 32);
    let id = spawn(&mut k);
    k.dispatch(0, id).unwrap();
    assert!(k.sys_shared_attach(0, 0x42).is_err());
    assert!(k.sys_shared_alloc(0, 100, 0).is_err());
}

#[test]
fn shared_frames_outlive_the_creator() {
    let mut k = kernel(8, 32);
    let owner = spawn(&mut k);
    let peer = spawn(&mut k);
    k.dispatch(0, owner).unwrap();
    k.dispatch(1, peer).unwrap();

    let va = k.sys_shared_alloc(0, 2 * PAGE_SIZE, 7).unwrap();
    k.sys_shared_attach(1, 7).unwrap();
    write(&mut k, 1, va, 5);

    let before = k.frames().free_count();
    k.sys_env_destroy(0, owner).unwrap();
    // Only the creator's region table frame comes back.
    assert_eq!(k.frames().free_count(), before + 1);
    assert_eq!(read(&mut k, 1, va), Some(5));

    // The key moved with the surviving region.
    let third = spawn(&mut k);
    assert_eq!(k.shared_attach(third, 7), Ok(va));
    assert_eq!(k.shared_create(third, 10, kernel_vmem::PageFlags::RW, 7), Err(ShmError::KeyInUse(7)));
}
