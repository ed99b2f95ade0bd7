//! Saved register file of an environment.

use kernel_memory_addresses::VirtualAddress;

/// Ring-0 code segment selector.
pub const KERNEL_CS: u64 = 0x08;
/// Ring-0 data segment selector.
pub const KERNEL_DS: u64 = 0x10;
/// Ring-3 data segment selector.
pub const USER_DS: u64 = 0x1B;
/// Ring-3 code segment selector.
pub const USER_CS: u64 = 0x23;

/// Interrupt enable flag in RFLAGS.
pub const RFLAGS_IF: u64 = 1 << 9;
/// RFLAGS bit 1 is reserved and always set.
const RFLAGS_RESERVED: u64 = 1 << 1;

/// Registers saved on kernel entry and restored on dispatch.
///
/// The core only looks at `rax` (system-call number in, return value out),
/// the argument registers of a system call, `rip` for diagnostics, and `cs`
/// to tell user from kernel frames. Everything else is copied wholesale.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
#[repr(C)]
pub struct TrapFrame {
    // Pushed by the CPU on interrupt gate entry (x86_64):
    pub rip: u64,
    pub cs: u64,
    pub rflags: u64,
    pub rsp: u64,
    pub ss: u64,
    // Pushed by the entry stub:
    pub rax: u64,
    pub rbx: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub rbp: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
}

impl TrapFrame {
    /// Initial frame of a user environment: ring 3, interrupts enabled.
    #[must_use]
    pub const fn user(entry: VirtualAddress, stack_top: VirtualAddress) -> Self {
        Self {
            rip: entry.as_u64(),
            cs: USER_CS,
            rflags: RFLAGS_RESERVED | RFLAGS_IF,
            rsp: stack_top.as_u64(),
            ss: USER_DS,
            ..Self::zeroed()
        }
    }

    /// Initial frame of a kernel service: ring 0, interrupts disabled.
    #[must_use]
    pub const fn kernel(entry: VirtualAddress, stack_top: VirtualAddress) -> Self {
        Self {
            rip: entry.as_u64(),
            cs: KERNEL_CS,
            rflags: RFLAGS_RESERVED,
            rsp: stack_top.as_u64(),
            ss: KERNEL_DS,
            ..Self::zeroed()
        }
    }

    const fn zeroed() -> Self {
        Self {
            rip: 0,
            cs: 0,
            rflags: 0,
            rsp: 0,
            ss: 0,
            rax: 0,
            rbx: 0,
            rcx: 0,
            rdx: 0,
            rsi: 0,
            rdi: 0,
            rbp: 0,
            r8: 0,
            r9: 0,
            r10: 0,
            r11: 0,
            r12: 0,
            r13: 0,
            r14: 0,
            r15: 0,
        }
    }

    /// Whether the frame was saved from ring 3.
    #[must_use]
    pub const fn is_user(&self) -> bool {
        self.cs & 3 == 3
    }

    /// System-call arguments in ABI order (`rdi, rsi, rdx, r10, r8, r9`).
    #[must_use]
    pub const fn syscall_args(&self) -> [u64; 6] {
        [self.rdi, self.rsi, self.rdx, self.r10, self.r8, self.r9]
    }
}
