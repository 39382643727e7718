//! x86_64 exit handling and CPU bring-up.
//!
//! The paging/segment setup in [`set_long_mode_with_selectors`] is ported
//! from the teacher's `boot::paging::{setup_page_tables, setup_cpu_regs}`,
//! generalized from a hardcoded Linux-boot-specific routine into a
//! reusable utility parameterized by paging base, RAM size, and selectors.

use std::collections::HashMap;

use tracing::{debug, warn};

use crate::chipset::Chipset;
use crate::config::MsrPolicy;
use crate::error::{Result, VmmError};
use crate::exit::ExitContext;
use crate::memory::MemoryRegion;
use crate::platform::{ExitHandler, PlatformExit, Vcpu};
use crate::register::{Register, RegisterValue, X86Register};

use super::DispatchOutcome;

/// Page table and GDT flags, ported from the teacher's boot protocol
/// module (kept private: these are an implementation detail of
/// [`set_long_mode_with_selectors`]).
mod flags {
    pub const PRESENT_RW: u64 = 0x03;
    pub const PRESENT_RW_PS: u64 = 0x83;
    pub const X86_CR0_PE: u64 = 0x1;
    pub const X86_CR0_PG: u64 = 0x8000_0000;
    pub const X86_CR4_PAE: u64 = 0x20;
    pub const EFER_LME: u64 = 0x100;
    pub const EFER_LMA: u64 = 0x400;
}

/// Writes identity-mapped page tables for the first `num_gib` gibibytes of
/// guest RAM starting at `paging_base`, then switches the vCPU into
/// 64-bit long mode with `cs`/`ds` as flat-model code/data selectors.
///
/// Layout (per gibibyte covered): one PML4 entry, one PDPT per GiB, one
/// PD per GiB filled with 2 MiB pages. `paging_base` must leave room for
/// `0x1000 + num_gib * 0x1000` bytes of page tables.
pub fn set_long_mode_with_selectors<V: Vcpu>(
    vcpu: &V,
    memory: &MemoryRegion,
    paging_base: u64,
    num_gib: u32,
    cs: u16,
    ds: u16,
) -> Result<()> {
    let pml4 = paging_base;
    let pdpt = paging_base + 0x1000;
    let pd_start = paging_base + 0x2000;

    memory.write_at(pml4, &(pdpt | flags::PRESENT_RW).to_le_bytes())?;

    for gib in 0..num_gib as u64 {
        let pd = pd_start + gib * 0x1000;
        memory.write_at(pdpt + gib * 8, &(pd | flags::PRESENT_RW).to_le_bytes())?;

        let mut pd_table = [0u8; 4096];
        for i in 0..512u64 {
            let phys = (gib * 512 + i) << 21;
            let entry = phys | flags::PRESENT_RW_PS;
            pd_table[(i as usize) * 8..(i as usize) * 8 + 8].copy_from_slice(&entry.to_le_bytes());
        }
        memory.write_at(pd, &pd_table)?;
    }

    let mut values = HashMap::new();
    values.insert(Register::X86(X86Register::Cr3), RegisterValue::U64(pml4));
    values.insert(
        Register::X86(X86Register::Cr0),
        RegisterValue::U64(flags::X86_CR0_PE | flags::X86_CR0_PG),
    );
    values.insert(Register::X86(X86Register::Cr4), RegisterValue::U64(flags::X86_CR4_PAE));
    values.insert(
        Register::X86(X86Register::Efer),
        RegisterValue::U64(flags::EFER_LME | flags::EFER_LMA),
    );
    values.insert(Register::X86(X86Register::Cs), RegisterValue::U64(cs as u64));
    values.insert(Register::X86(X86Register::Ds), RegisterValue::U64(ds as u64));
    values.insert(Register::X86(X86Register::Es), RegisterValue::U64(ds as u64));
    values.insert(Register::X86(X86Register::Fs), RegisterValue::U64(ds as u64));
    values.insert(Register::X86(X86Register::Gs), RegisterValue::U64(ds as u64));
    values.insert(Register::X86(X86Register::Ss), RegisterValue::U64(ds as u64));
    vcpu.set_registers(&values)
}

/// IOAPIC and HPET are core reference integrations (unlike the example
/// `Device` impls in `crate::devices`), reachable directly from exit
/// dispatch rather than only through the chipset's generic PIO/MMIO
/// tables.
pub struct X86ArchState {
    pub ioapic: IoApic,
    pub hpet: Option<Hpet>,
    pub msr_policy: MsrPolicy,
}

impl X86ArchState {
    pub fn new(msr_policy: MsrPolicy) -> Self {
        Self {
            ioapic: IoApic::new(),
            hpet: None,
            msr_policy,
        }
    }
}

/// A minimal IOAPIC: tracks which vector each of 24 redirection entries
/// currently has in-service, enough to satisfy the EOI routing contract.
pub struct IoApic {
    in_service: [Option<u8>; 24],
}

impl IoApic {
    pub fn new() -> Self {
        Self { in_service: [None; 24] }
    }

    /// Marks redirection entry `line` as having delivered `vector`.
    pub fn assert_line(&mut self, line: usize, vector: u8) {
        if let Some(slot) = self.in_service.get_mut(line) {
            *slot = Some(vector);
        }
    }

    /// Clears whichever redirection entries are in-service for `vector`.
    pub fn handle_eoi(&mut self, vector: u8) {
        for slot in self.in_service.iter_mut() {
            if *slot == Some(vector) {
                *slot = None;
            }
        }
    }
}

impl Default for IoApic {
    fn default() -> Self {
        Self::new()
    }
}

/// A minimal HPET: a free-running counter and per-comparator config,
/// exposed as MMIO registers by callers that want one.
pub struct Hpet {
    pub counter: u64,
    pub enabled: bool,
}

impl Hpet {
    pub fn new() -> Self {
        Self {
            counter: 0,
            enabled: false,
        }
    }
}

impl Default for Hpet {
    fn default() -> Self {
        Self::new()
    }
}

/// Bridges a classified port I/O or MMIO access to the chipset and RAM,
/// while the platform backend's `data: &mut [u8]` reference into its own
/// exit buffer is still live. Constructed fresh by the executor for each
/// call to [`Vcpu::run`].
///
/// MMIO addresses inside the RAM region are satisfied directly against
/// `memory` rather than dispatched through the chipset, mirroring the
/// direct-RAM fast path the teacher's `run_with_io` callers take before
/// ever consulting the MMIO bus.
pub struct X86ExitHandler<'a> {
    pub chipset: &'a mut Chipset,
    pub memory: &'a MemoryRegion,
    pub exit_ctx: &'a mut ExitContext,
    /// Per-vCPU slot a dispatch error is stashed into rather than returned
    /// directly, per §7: the platform's own `KVM_RUN` emulation loop has no
    /// channel for a rich error, so `run_once` checks this after `Vcpu::run`
    /// returns instead.
    pub pending_error: &'a mut Option<VmmError>,
}

impl<'a> ExitHandler for X86ExitHandler<'a> {
    fn handle_pio(&mut self, port: u16, is_write: bool, data: &mut [u8]) -> Result<()> {
        debug!(port, is_write, len = data.len(), "x86_64 exit: io port");
        if let Err(e) = self.chipset.handle_pio(self.exit_ctx, port, data, is_write) {
            *self.pending_error = Some(e);
        }
        Ok(())
    }

    fn handle_mmio(&mut self, gpa: u64, is_write: bool, data: &mut [u8]) -> Result<()> {
        debug!(gpa, is_write, len = data.len(), "x86_64 exit: mmio");
        if self.memory.contains(gpa, data.len()) {
            if is_write {
                self.memory.write_at(gpa, data)
            } else {
                self.memory.read_at(gpa, data)
            }
        } else {
            // PC advancement for MMIO on x86_64 is owned entirely by the
            // platform's own instruction emulator; the device's advance/skip
            // signal is meaningful only to the ARM64 dispatcher.
            if let Err(e) = self.chipset.handle_mmio(self.exit_ctx, gpa, data, is_write) {
                *self.pending_error = Some(e);
            }
            Ok(())
        }
    }
}

/// Dispatches one classified x86_64 exit per §4.5. Port I/O and MMIO are
/// not matched here: they were already resolved inline by
/// [`X86ExitHandler`] before `exit` was produced, and arrive as
/// `PlatformExit::IoHandled`.
pub fn dispatch_exit<V: Vcpu>(
    vcpu: &V,
    arch_state: &mut X86ArchState,
    exit: PlatformExit,
) -> Result<DispatchOutcome> {
    match exit {
        PlatformExit::Halt => {
            debug!("x86_64 exit: halt");
            Ok(DispatchOutcome::Halted)
        }
        PlatformExit::IoHandled => Ok(DispatchOutcome::Continue),
        PlatformExit::Cpuid => {
            debug!("x86_64 exit: cpuid (passthrough default result)");
            advance_rip(vcpu, 2)?;
            Ok(DispatchOutcome::Continue)
        }
        PlatformExit::MsrAccess { index, is_write, value } => {
            match arch_state.msr_policy {
                MsrPolicy::Passthrough => {
                    debug!(index, is_write, "x86_64 exit: msr (passthrough)");
                }
                MsrPolicy::ZeroReadDropWrite => {
                    if is_write {
                        warn!(index, value, "dropping MSR write under ZeroReadDropWrite policy");
                    } else {
                        debug!(index, "zeroing MSR read under ZeroReadDropWrite policy");
                    }
                }
                MsrPolicy::Trap => {
                    return Err(VmmError::UnsupportedExit(format!(
                        "MSR access to {index:#x} (write={is_write}) trapped by policy"
                    )));
                }
            }
            advance_rip(vcpu, 2)?;
            Ok(DispatchOutcome::Continue)
        }
        PlatformExit::ApicEoi { vector } => {
            debug!(vector, "x86_64 exit: apic eoi");
            arch_state.ioapic.handle_eoi(vector);
            Ok(DispatchOutcome::Continue)
        }
        PlatformExit::Canceled => Err(VmmError::CanceledWithoutReason),
        PlatformExit::InternalError => Err(VmmError::GuestFault),
        PlatformExit::FailEntry { reason } => {
            Err(VmmError::UnsupportedExit(format!("fail entry: {reason:#x}")))
        }
        PlatformExit::Reset { reset_type } => Err(VmmError::UnsupportedResetType(reset_type)),
        PlatformExit::UnmappedGpa { .. } => {
            Err(VmmError::UnsupportedExit("unmapped gpa exit on x86_64".to_string()))
        }
        PlatformExit::Unknown(reason) => Err(VmmError::UnsupportedExit(reason.to_string())),
    }
}

fn advance_rip<V: Vcpu>(vcpu: &V, by: u64) -> Result<()> {
    if by == 0 {
        return Ok(());
    }
    let mut regs = HashMap::new();
    regs.insert(Register::X86(X86Register::Rip), RegisterValue::U64(0));
    vcpu.get_registers(&mut regs)?;
    if let Some(RegisterValue::U64(rip)) = regs.get(&Register::X86(X86Register::Rip)).copied() {
        let mut write = HashMap::new();
        write.insert(Register::X86(X86Register::Rip), RegisterValue::U64(rip + by));
        vcpu.set_registers(&write)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ioapic_eoi_clears_matching_in_service_vector() {
        let mut ioapic = IoApic::new();
        ioapic.assert_line(4, 0x30);
        ioapic.handle_eoi(0x30);
        assert_eq!(ioapic.in_service[4], None);
    }

    #[test]
    fn ioapic_eoi_ignores_non_matching_vector() {
        let mut ioapic = IoApic::new();
        ioapic.assert_line(4, 0x30);
        ioapic.handle_eoi(0x99);
        assert_eq!(ioapic.in_service[4], Some(0x30));
    }
}
