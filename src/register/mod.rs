//! Architecture-tagged register names and the value sum carried with them.
//!
//! A [`Register`] is a compile-time-constant symbolic name drawn from one of
//! two disjoint namespaces (x86_64 or ARM64). It never carries state; it is
//! only ever used as a key into a register map passed to
//! [`crate::vcpu::VcpuExecutor::get_registers`] /
//! [`crate::vcpu::VcpuExecutor::set_registers`]. Each backend (see
//! `crate::platform`) owns the table mapping a `Register` to whatever native
//! identifier its host API expects; the core never hardcodes that mapping.

pub mod arm64;
pub mod x86_64;

pub use arm64::Arm64Register;
pub use x86_64::X86Register;

use crate::platform::Architecture;

/// A symbolic register name, tagged by architecture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Register {
    /// An x86_64 register.
    X86(X86Register),
    /// An ARM64 (AArch64) register.
    Arm64(Arm64Register),
    /// Sentinel for "no register" — never valid as an operation's target.
    Invalid,
}

impl From<X86Register> for Register {
    fn from(r: X86Register) -> Self {
        Register::X86(r)
    }
}

impl From<Arm64Register> for Register {
    fn from(r: Arm64Register) -> Self {
        Register::Arm64(r)
    }
}

impl Register {
    /// Stable numeric id for the snapshot wire format's `reg_id` field
    /// (§6.2). Indexes into `x86_64::ALL_REGISTERS` on x86_64; on ARM64,
    /// `X0..=X30` map to `0..=30`, then `Sp`=31, `Pc`=32, `Pstate`=33.
    pub fn wire_id(self) -> u32 {
        match self {
            Register::X86(r) => x86_64::ALL_REGISTERS
                .iter()
                .position(|&candidate| candidate == r)
                .expect("ALL_REGISTERS is exhaustive over X86Register") as u32,
            Register::Arm64(Arm64Register::X(n)) => n as u32,
            Register::Arm64(Arm64Register::Sp) => 31,
            Register::Arm64(Arm64Register::Pc) => 32,
            Register::Arm64(Arm64Register::Pstate) => 33,
            Register::Invalid => unreachable!("Invalid is never a snapshot target"),
        }
    }

    /// Inverse of [`Register::wire_id`] for `arch`. Returns `None` for an
    /// id with no meaning on that architecture.
    pub fn from_wire_id(arch: Architecture, id: u32) -> Option<Register> {
        match arch {
            Architecture::X86_64 => x86_64::ALL_REGISTERS
                .get(id as usize)
                .map(|&r| Register::X86(r)),
            Architecture::Arm64 => match id {
                0..=30 => Some(Register::Arm64(Arm64Register::X(id as u8))),
                31 => Some(Register::Arm64(Arm64Register::Sp)),
                32 => Some(Register::Arm64(Arm64Register::Pc)),
                33 => Some(Register::Arm64(Arm64Register::Pstate)),
                _ => None,
            },
        }
    }

    /// The full register set a snapshot captures and restores for `arch`.
    pub fn canonical_set(arch: Architecture) -> Vec<Register> {
        match arch {
            Architecture::X86_64 => x86_64::ALL_REGISTERS.iter().map(|&r| Register::X86(r)).collect(),
            Architecture::Arm64 => arm64::all_registers().into_iter().map(Register::Arm64).collect(),
        }
    }
}

/// A value read from or written to a register.
///
/// This is a closed sum today (one 64-bit integer variant), but the type is
/// threaded through every register operation precisely so it can grow new
/// variants (128-bit SIMD, segment descriptors, table registers) without
/// breaking the `get_registers`/`set_registers` contract: callers that only
/// ever construct `U64` are unaffected by the enum growing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterValue {
    /// A 64-bit integer value (general-purpose, control, segment-as-u64, ...).
    U64(u64),
}

impl RegisterValue {
    /// Returns the value as a `u64`, if this variant carries one.
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            RegisterValue::U64(v) => Some(*v),
        }
    }
}

impl From<u64> for RegisterValue {
    fn from(v: u64) -> Self {
        RegisterValue::U64(v)
    }
}
