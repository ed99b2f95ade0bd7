//! # Environments and Their Address Spaces
//!
//! The process core of the kernel. An *environment* is the unit of execution;
//! each one owns a table of virtual memory regions and a page table. On top of
//! that this crate implements:
//!
//! - the region manager ([`vma`]): allocation, splitting, merging, lookup;
//! - the page-fault resolver ([`fault`]), including copy-on-write;
//! - environment lifecycle ([`env`]) and [`fork`];
//! - the round-robin scheduler with wait dependencies ([`sched`]);
//! - keyed shared memory ([`shmem`]);
//! - the system-call surface ([`syscall`]).
//!
//! ## Ownership
//!
//! All state lives in one [`Kernel`] value: the environment table, the frame
//! allocator, per-CPU state and the scheduler's time reference. Multiple CPUs
//! share it through a [`kernel_sync::KernelLock`], taken on kernel entry and
//! released by [`sched::reschedule`] when the CPU leaves the kernel.
//!
//! ```text
//!   trap / syscall ──► KernelLock::lock(cpu)
//!                           │
//!                           ▼
//!          ┌──────────── Kernel<F, A> ─────────────┐
//!          │ envs[]   ─ Env ─ EnvMemory            │
//!          │                  ├─ RegionTable       │
//!          │                  └─ A: AddressSpace   │
//!          │ frames   ─ F: FrameAlloc (refcounted) │
//!          │ cpus[]   ─ current env, halted?       │
//!          └───────────────────────────────────────┘
//!                           │
//!                           ▼
//!            reschedule(guard) ──► Dispatch::{Run, Halt, Monitor}
//! ```
//!
//! The frame allocator and the page table are collaborators behind the
//! [`kernel_vmem::FrameAlloc`] and [`kernel_vmem::AddressSpace`] traits.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![deny(unsafe_code)]

extern crate alloc;

pub mod config;
pub mod cpu;
pub mod env;
pub mod error;
pub mod fault;
pub mod fork;
pub mod image;
mod kernel;
pub mod memory;
pub mod sched;
pub mod shmem;
pub mod syscall;
pub mod trap;
pub mod vma;

pub use crate::config::KernelConfig;
pub use crate::cpu::{Cpu, CpuId, CpuStatus};
pub use crate::env::{Env, EnvId, EnvKind, EnvStatus};
pub use crate::error::{EnvError, FaultViolation, RegionError, ShmError, SyscallError};
pub use crate::kernel::Kernel;
pub use crate::sched::{Clock, Dispatch};
