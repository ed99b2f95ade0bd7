//! # Kernel Physical Frame Allocation
//!
//! The frame allocator collaborator of the environment core: a fixed pool of
//! 4 KiB frames with per-frame reference counts, implementing
//! [`kernel_vmem::FrameAlloc`].
//!
//! ```text
//!   ┌──────────────┐  allocate / retain / release   ┌──────────────┐
//!   │  kernel-env  │ ─────────────────────────────► │  FramePool   │
//!   │  (faults,    │                                │  refcounts,  │
//!   │   fork, shm) │ ◄───────────────────────────── │  free stack  │
//!   └──────────────┘     PhysicalPage handles       └──────────────┘
//! ```
//!
//! ## Usage
//! ```rust
//! use kernel_alloc::frame_alloc::FramePool;
//! use kernel_vmem::{FrameAlloc, FrameFill};
//!
//! let mut pool = FramePool::new(16);
//! let frame = pool.allocate(FrameFill::Zeroed).unwrap();
//! pool.retain(frame);
//! assert_eq!(pool.ref_count(frame), 1);
//! pool.release(frame);
//! assert_eq!(pool.free_count(), 16);
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]

extern crate alloc;

pub mod frame_alloc;
