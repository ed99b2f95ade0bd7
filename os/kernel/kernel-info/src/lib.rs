//! # Kernel Layout and Sizing Constants
//!
//! The authoritative compile-time configuration shared by the memory and
//! environment crates. Runtime knobs (CPU count, time quantum overrides,
//! merge policy) live in `kernel_env::KernelConfig`, which takes its defaults
//! from here.
//!
//! ## User Address Space Layout
//!
//! ```text
//! 0x0000_0000 ┌─────────────────────────────────┐
//!             │    Unmapped (null guard)        │
//! USER_BASE   ├─────────────────────────────────┤ 0x0080_0000
//!             │   Program image, regions,       │
//!             │   shared memory (searched       │
//!             │   upward by the region manager) │
//! USER_STACK  ├─────────────────────────────────┤ 0xEEBF_D000
//!             │   Initial user stack (1 page)   │
//! USER_CEILING├─────────────────────────────────┤ 0xEEBF_E000
//!             │   Kernel-owned                  │
//! 0xFFFF_FFFF └─────────────────────────────────┘
//! ```
//!
//! ## Tables
//!
//! * [`env::MAX_ENVS`]: environment table size; also the width of the index
//!   field packed into an environment id.
//! * [`memory::REGION_TABLE_CAPACITY`]: region slots per environment.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![deny(unsafe_code)]

pub mod env;
pub mod memory;
