//! # Kernel synchronization primitives
//!
//! One lock guards all kernel state: [`KernelLock`]. It is taken on every
//! kernel entry and released when the CPU leaves the kernel again, either by
//! dispatching an environment or by halting.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

mod kernel_lock;

pub use kernel_lock::{KernelLock, KernelLockGuard};
