//! # Memory Layout

use kernel_memory_addresses::PAGE_SIZE;

/// Lowest address the region manager hands out.
pub const USER_BASE: u64 = 0x0080_0000;

/// Exclusive upper bound of user-allocatable memory.
pub const USER_CEILING: u64 = 0xEEBF_E000;

/// Top of the initial user stack of a freshly created environment.
pub const USER_STACK_TOP: u64 = USER_CEILING;

/// Size of the initial user stack.
pub const USER_STACK_SIZE: u64 = PAGE_SIZE;

/// Base of the direct map: physical address `pa` is visible to the kernel at
/// `HHDM_BASE + pa`.
pub const HHDM_BASE: u64 = 0xffff_8880_0000_0000;

/// Number of region slots in one environment's table.
pub const REGION_TABLE_CAPACITY: usize = 128;

const _: () = {
    assert!(USER_BASE.is_multiple_of(PAGE_SIZE));
    assert!(USER_CEILING.is_multiple_of(PAGE_SIZE));
    assert!(USER_BASE < USER_CEILING);
    assert!(USER_STACK_TOP - USER_STACK_SIZE >= USER_BASE);
};
