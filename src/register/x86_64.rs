//! x86_64 symbolic register names.
//!
//! These cover the general-purpose, instruction-pointer/flags, control, and
//! segment registers needed to bring a vCPU from reset into 64-bit long
//! mode (see [`crate::arch::x86_64::set_long_mode_with_selectors`]) and to
//! read back CPUID/halt state after an exit. Model-specific registers are
//! deliberately not part of this enum: MSR access goes through the
//! exit-time `MsrPolicy` (§4.5 of the design), not the bulk register bank,
//! because the platform's MSR list is open-ended and rarely needs to be
//! read back by VMM logic.

/// A single x86_64 register name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum X86Register {
    Rax,
    Rbx,
    Rcx,
    Rdx,
    Rsi,
    Rdi,
    Rsp,
    Rbp,
    R8,
    R9,
    R10,
    R11,
    R12,
    R13,
    R14,
    R15,
    Rip,
    Rflags,
    Cr0,
    Cr2,
    Cr3,
    Cr4,
    Cr8,
    Efer,
    Cs,
    Ds,
    Es,
    Fs,
    Gs,
    Ss,
    Tr,
}

/// The complete set of general-purpose registers, in the order most
/// platform APIs group them.
pub const GP_REGISTERS: &[X86Register] = &[
    X86Register::Rax,
    X86Register::Rbx,
    X86Register::Rcx,
    X86Register::Rdx,
    X86Register::Rsi,
    X86Register::Rdi,
    X86Register::Rsp,
    X86Register::Rbp,
    X86Register::R8,
    X86Register::R9,
    X86Register::R10,
    X86Register::R11,
    X86Register::R12,
    X86Register::R13,
    X86Register::R14,
    X86Register::R15,
    X86Register::Rip,
    X86Register::Rflags,
];

/// The control/segment registers a backend typically fetches with one
/// "special registers" call.
pub const SPECIAL_REGISTERS: &[X86Register] = &[
    X86Register::Cr0,
    X86Register::Cr2,
    X86Register::Cr3,
    X86Register::Cr4,
    X86Register::Cr8,
    X86Register::Efer,
    X86Register::Cs,
    X86Register::Ds,
    X86Register::Es,
    X86Register::Fs,
    X86Register::Gs,
    X86Register::Ss,
    X86Register::Tr,
];

impl X86Register {
    /// True for the registers batched under a platform's "general purpose
    /// registers" call (as opposed to its "special registers" call).
    pub fn is_general_purpose(self) -> bool {
        GP_REGISTERS.contains(&self)
    }
}

/// The full register set a snapshot captures and restores, in a fixed
/// order that doubles as the snapshot wire format's `reg_id` table (see
/// `crate::register::Register::wire_id`). Reordering this array changes
/// the meaning of every `reg_id` already written to disk.
pub const ALL_REGISTERS: &[X86Register] = &[
    X86Register::Rax,
    X86Register::Rbx,
    X86Register::Rcx,
    X86Register::Rdx,
    X86Register::Rsi,
    X86Register::Rdi,
    X86Register::Rsp,
    X86Register::Rbp,
    X86Register::R8,
    X86Register::R9,
    X86Register::R10,
    X86Register::R11,
    X86Register::R12,
    X86Register::R13,
    X86Register::R14,
    X86Register::R15,
    X86Register::Rip,
    X86Register::Rflags,
    X86Register::Cr0,
    X86Register::Cr2,
    X86Register::Cr3,
    X86Register::Cr4,
    X86Register::Cr8,
    X86Register::Efer,
    X86Register::Cs,
    X86Register::Ds,
    X86Register::Es,
    X86Register::Fs,
    X86Register::Gs,
    X86Register::Ss,
    X86Register::Tr,
];
