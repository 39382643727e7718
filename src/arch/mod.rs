//! Per-architecture CPU bring-up and exit dispatch.
//!
//! The two architectures genuinely dispatch differently, not just in
//! which `PlatformExit` variants they match: x86_64 resolves port I/O and
//! MMIO inline through an [`crate::platform::ExitHandler`] passed into
//! [`crate::platform::Vcpu::run`] (the platform's own instruction emulator
//! already decoded the access), while ARM64 receives a raw data-abort
//! syndrome and round-trips the faulting instruction's target register
//! through the register bank by hand. `dispatch_exit` on each submodule
//! reflects that rather than forcing one shape on both.

pub mod arm64;
pub mod x86_64;

/// Outcome of dispatching one classified exit, common to both
/// architectures.
pub enum DispatchOutcome {
    /// The vCPU should re-enter the guest.
    Continue,
    /// Clean guest shutdown (x86_64 `HLT`, ARM64 PSCI power-off).
    Halted,
    /// The guest requested a reboot (ARM64 PSCI reset with reboot type).
    Rebooted,
}

/// Per-VM architecture-specific state, tagged by which platform backend
/// created the partition.
pub enum ArchState {
    X86_64(x86_64::X86ArchState),
    Arm64(arm64::Arm64ArchState),
}

impl ArchState {
    pub fn as_x86_64(&mut self) -> Option<&mut x86_64::X86ArchState> {
        match self {
            ArchState::X86_64(state) => Some(state),
            ArchState::Arm64(_) => None,
        }
    }

    pub fn as_arm64(&self) -> Option<&arm64::Arm64ArchState> {
        match self {
            ArchState::Arm64(state) => Some(state),
            ArchState::X86_64(_) => None,
        }
    }

    /// Architecture-specific snapshot extras, per §4.7: empty on x86_64,
    /// the GIC distributor's asserted-interrupt map on ARM64.
    pub fn capture_extras(&self) -> ArchExtras {
        match self {
            ArchState::X86_64(_) => ArchExtras::X86_64,
            ArchState::Arm64(state) => ArchExtras::Arm64 {
                asserted_interrupts: state.asserted_interrupts(),
            },
        }
    }

    /// Restores extras captured by [`ArchState::capture_extras`].
    /// Mismatched variants are a no-op: `crate::snapshot`'s architecture
    /// tag check rejects that case before this is ever called.
    pub fn restore_extras(&self, extras: &ArchExtras) {
        if let (ArchState::Arm64(state), ArchExtras::Arm64 { asserted_interrupts }) = (self, extras) {
            state.restore_asserted_interrupts(asserted_interrupts);
        }
    }
}

/// Architecture-specific snapshot payload, captured and restored as a unit
/// alongside registers, RAM, and per-device state.
#[derive(Debug, Clone, Default)]
pub enum ArchExtras {
    #[default]
    X86_64,
    Arm64 {
        asserted_interrupts: Vec<(u32, bool)>,
    },
}
