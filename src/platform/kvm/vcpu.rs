//! KVM vCPU wrapper: register translation and the exit classifier.
//!
//! The `run_with_io` shape here is the teacher's `kvm::vcpu::VcpuFd`
//! almost unchanged: real KVM already returns decoded `IoIn`/`IoOut`/
//! `MmioRead`/`MmioWrite` exits, so the spec's "instruction-emulator
//! callback pack" collapses into a direct match rather than a callback
//! dance (see `DESIGN.md`).

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use kvm_bindings::{kvm_fpu, kvm_regs, kvm_sregs};
use kvm_ioctls::VcpuExit as KvmVcpuExit;

use super::{wrap, KvmBackendError};
use crate::error::{Result, VmmError};
use crate::platform::{Architecture, ExitHandler, PlatformExit, Vcpu};
use crate::register::{Register, RegisterValue};

#[cfg(target_arch = "x86_64")]
use crate::register::X86Register;

#[cfg(target_arch = "aarch64")]
use crate::register::Arm64Register;

/// Signal used to interrupt a blocked `KVM_RUN` ioctl for cancellation.
/// Its handler is a no-op; the only effect wanted is `EINTR`.
const CANCEL_SIGNAL: i32 = libc::SIGUSR1;

extern "C" fn cancel_signal_handler(_: i32) {}

fn ensure_cancel_handler_installed() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| unsafe {
        libc::signal(CANCEL_SIGNAL, cancel_signal_handler as libc::sighandler_t);
    });
}

pub struct KvmVcpu {
    vcpu: kvm_ioctls::VcpuFd,
    #[allow(dead_code)]
    arch: Architecture,
    thread_id: Mutex<Option<libc::pthread_t>>,
    #[cfg(target_arch = "aarch64")]
    vm: Option<Arc<kvm_ioctls::VmFd>>,
}

impl KvmVcpu {
    pub(super) fn new(
        vcpu: kvm_ioctls::VcpuFd,
        arch: Architecture,
        #[cfg_attr(not(target_arch = "aarch64"), allow(unused_variables))] vm: Arc<kvm_ioctls::VmFd>,
    ) -> Self {
        Self {
            vcpu,
            arch,
            thread_id: Mutex::new(None),
            #[cfg(target_arch = "aarch64")]
            vm: Some(vm),
        }
    }

    fn remember_current_thread(&self) {
        let mut guard = self.thread_id.lock().unwrap();
        if guard.is_none() {
            ensure_cancel_handler_installed();
            *guard = Some(unsafe { libc::pthread_self() });
        }
    }

    #[cfg(target_arch = "x86_64")]
    fn get_regs_raw(&self) -> Result<kvm_regs> {
        self.vcpu.get_regs().map_err(|e| wrap(KvmBackendError::GetRegisters(e)))
    }

    #[cfg(target_arch = "x86_64")]
    fn get_sregs_raw(&self) -> Result<kvm_sregs> {
        self.vcpu.get_sregs().map_err(|e| wrap(KvmBackendError::GetRegisters(e)))
    }

    #[cfg(target_arch = "aarch64")]
    fn one_reg_id(reg: Arm64Register) -> u64 {
        const KVM_REG_ARM64: u64 = 0x6000_0000_0000_0000;
        const KVM_REG_SIZE_U64: u64 = 0x0030_0000_0000_0000;
        const KVM_REG_ARM_CORE: u64 = 0x0010_0000;
        // Offsets within `kvm_regs.regs` (a `user_pt_regs`), in u32 words,
        // matching the kernel's `KVM_REG_ARM_CORE_REG` macro convention.
        let word_offset: u64 = match reg {
            Arm64Register::X(n) => (n as u64) * 2,
            Arm64Register::Sp => 31 * 2,
            Arm64Register::Pc => 33 * 2,
            Arm64Register::Pstate => 34 * 2,
        };
        KVM_REG_ARM64 | KVM_REG_SIZE_U64 | KVM_REG_ARM_CORE | word_offset
    }
}

impl Vcpu for KvmVcpu {
    #[cfg(target_arch = "x86_64")]
    fn get_registers(&self, out: &mut HashMap<Register, RegisterValue>) -> Result<()> {
        let needs_gp = out.keys().any(|r| matches!(r, Register::X86(x) if x.is_general_purpose()));
        let needs_special = out.keys().any(|r| matches!(r, Register::X86(x) if !x.is_general_purpose()));

        let regs = if needs_gp { Some(self.get_regs_raw()?) } else { None };
        let sregs = if needs_special { Some(self.get_sregs_raw()?) } else { None };

        for (reg, value) in out.iter_mut() {
            let Register::X86(x) = reg else {
                return Err(VmmError::UnsupportedRegister(*reg));
            };
            let raw = match (x, &regs, &sregs) {
                (X86Register::Rax, Some(r), _) => r.rax,
                (X86Register::Rbx, Some(r), _) => r.rbx,
                (X86Register::Rcx, Some(r), _) => r.rcx,
                (X86Register::Rdx, Some(r), _) => r.rdx,
                (X86Register::Rsi, Some(r), _) => r.rsi,
                (X86Register::Rdi, Some(r), _) => r.rdi,
                (X86Register::Rsp, Some(r), _) => r.rsp,
                (X86Register::Rbp, Some(r), _) => r.rbp,
                (X86Register::R8, Some(r), _) => r.r8,
                (X86Register::R9, Some(r), _) => r.r9,
                (X86Register::R10, Some(r), _) => r.r10,
                (X86Register::R11, Some(r), _) => r.r11,
                (X86Register::R12, Some(r), _) => r.r12,
                (X86Register::R13, Some(r), _) => r.r13,
                (X86Register::R14, Some(r), _) => r.r14,
                (X86Register::R15, Some(r), _) => r.r15,
                (X86Register::Rip, Some(r), _) => r.rip,
                (X86Register::Rflags, Some(r), _) => r.rflags,
                (X86Register::Cr0, _, Some(s)) => s.cr0,
                (X86Register::Cr2, _, Some(s)) => s.cr2,
                (X86Register::Cr3, _, Some(s)) => s.cr3,
                (X86Register::Cr4, _, Some(s)) => s.cr4,
                (X86Register::Cr8, _, Some(s)) => s.cr8,
                (X86Register::Efer, _, Some(s)) => s.efer,
                (X86Register::Cs, _, Some(s)) => s.cs.selector as u64,
                (X86Register::Ds, _, Some(s)) => s.ds.selector as u64,
                (X86Register::Es, _, Some(s)) => s.es.selector as u64,
                (X86Register::Fs, _, Some(s)) => s.fs.selector as u64,
                (X86Register::Gs, _, Some(s)) => s.gs.selector as u64,
                (X86Register::Ss, _, Some(s)) => s.ss.selector as u64,
                (X86Register::Tr, _, Some(s)) => s.tr.selector as u64,
                _ => return Err(VmmError::UnsupportedRegister(*reg)),
            };
            match value {
                RegisterValue::U64(_) => *value = RegisterValue::U64(raw),
            }
        }
        Ok(())
    }

    #[cfg(target_arch = "x86_64")]
    fn set_registers(&self, values: &HashMap<Register, RegisterValue>) -> Result<()> {
        let needs_gp = values.keys().any(|r| matches!(r, Register::X86(x) if x.is_general_purpose()));
        let needs_special = values.keys().any(|r| matches!(r, Register::X86(x) if !x.is_general_purpose()));

        let mut regs = if needs_gp { self.get_regs_raw()? } else { kvm_regs::default() };
        let mut sregs = if needs_special { self.get_sregs_raw()? } else { kvm_sregs::default() };

        for (reg, value) in values {
            let Register::X86(x) = reg else {
                return Err(VmmError::UnsupportedRegister(*reg));
            };
            let Some(raw) = value.as_u64() else {
                return Err(VmmError::RegisterValueTypeMismatch(*reg));
            };
            match x {
                X86Register::Rax => regs.rax = raw,
                X86Register::Rbx => regs.rbx = raw,
                X86Register::Rcx => regs.rcx = raw,
                X86Register::Rdx => regs.rdx = raw,
                X86Register::Rsi => regs.rsi = raw,
                X86Register::Rdi => regs.rdi = raw,
                X86Register::Rsp => regs.rsp = raw,
                X86Register::Rbp => regs.rbp = raw,
                X86Register::R8 => regs.r8 = raw,
                X86Register::R9 => regs.r9 = raw,
                X86Register::R10 => regs.r10 = raw,
                X86Register::R11 => regs.r11 = raw,
                X86Register::R12 => regs.r12 = raw,
                X86Register::R13 => regs.r13 = raw,
                X86Register::R14 => regs.r14 = raw,
                X86Register::R15 => regs.r15 = raw,
                X86Register::Rip => regs.rip = raw,
                X86Register::Rflags => regs.rflags = raw,
                X86Register::Cr0 => sregs.cr0 = raw,
                X86Register::Cr2 => sregs.cr2 = raw,
                X86Register::Cr3 => sregs.cr3 = raw,
                X86Register::Cr4 => sregs.cr4 = raw,
                X86Register::Cr8 => sregs.cr8 = raw,
                X86Register::Efer => sregs.efer = raw,
                X86Register::Cs => sregs.cs.selector = raw as u16,
                X86Register::Ds => sregs.ds.selector = raw as u16,
                X86Register::Es => sregs.es.selector = raw as u16,
                X86Register::Fs => sregs.fs.selector = raw as u16,
                X86Register::Gs => sregs.gs.selector = raw as u16,
                X86Register::Ss => sregs.ss.selector = raw as u16,
                X86Register::Tr => sregs.tr.selector = raw as u16,
            }
        }

        if needs_gp {
            self.vcpu.set_regs(&regs).map_err(|e| wrap(KvmBackendError::SetRegisters(e)))?;
        }
        if needs_special {
            self.vcpu.set_sregs(&sregs).map_err(|e| wrap(KvmBackendError::SetRegisters(e)))?;
        }
        Ok(())
    }

    #[cfg(target_arch = "aarch64")]
    fn get_registers(&self, out: &mut HashMap<Register, RegisterValue>) -> Result<()> {
        for (reg, value) in out.iter_mut() {
            let Register::Arm64(a) = reg else {
                return Err(VmmError::UnsupportedRegister(*reg));
            };
            let mut buf = [0u8; 8];
            self.vcpu
                .get_one_reg(Self::one_reg_id(*a), &mut buf)
                .map_err(|e| wrap(KvmBackendError::OneReg(e)))?;
            *value = RegisterValue::U64(u64::from_le_bytes(buf));
        }
        Ok(())
    }

    #[cfg(target_arch = "aarch64")]
    fn set_registers(&self, values: &HashMap<Register, RegisterValue>) -> Result<()> {
        for (reg, value) in values {
            let Register::Arm64(a) = reg else {
                return Err(VmmError::UnsupportedRegister(*reg));
            };
            let Some(raw) = value.as_u64() else {
                return Err(VmmError::RegisterValueTypeMismatch(*reg));
            };
            self.vcpu
                .set_one_reg(Self::one_reg_id(*a), &raw.to_le_bytes())
                .map_err(|e| wrap(KvmBackendError::OneReg(e)))?;
        }
        Ok(())
    }

    fn run(&self, handler: &mut dyn ExitHandler) -> Result<PlatformExit> {
        self.remember_current_thread();
        self.vcpu.set_kvm_immediate_exit(0);

        match self.vcpu.run() {
            Ok(exit) => translate_exit(exit, handler),
            Err(e) if e.errno() == libc::EINTR => Ok(PlatformExit::Canceled),
            Err(e) => Err(wrap(KvmBackendError::Run(e))),
        }
    }

    fn cancel(&self) {
        self.vcpu.set_kvm_immediate_exit(1);
        if let Some(tid) = *self.thread_id.lock().unwrap() {
            unsafe {
                libc::pthread_kill(tid, CANCEL_SIGNAL);
            }
        }
    }

    #[cfg(target_arch = "aarch64")]
    fn request_interrupt(&self, intid: u32) -> Result<()> {
        let Some(vm) = &self.vm else {
            return Ok(());
        };
        // KVM_IRQ_LINE's ARM encoding packs an interrupt type and number
        // into the `irq` field; INTID >= 32 (SPI) is passed through
        // directly here since the type/vcpu-index packing is done by the
        // GIC emulation for SPIs.
        vm.set_irq_line(intid, true)
            .map_err(|e| wrap(KvmBackendError::OneReg(e)))
    }
}

/// Classifies one raw KVM exit, resolving port I/O and MMIO inline
/// through `handler` while their `data: &mut [u8]` slices are still
/// valid references into `kvm_run`'s shared memory.
fn translate_exit(exit: KvmVcpuExit, handler: &mut dyn ExitHandler) -> Result<PlatformExit> {
    match exit {
        KvmVcpuExit::IoIn(port, data) => {
            handler.handle_pio(port, false, data)?;
            Ok(PlatformExit::IoHandled)
        }
        KvmVcpuExit::IoOut(port, data) => {
            handler.handle_pio(port, true, data)?;
            Ok(PlatformExit::IoHandled)
        }
        KvmVcpuExit::MmioRead(addr, data) => {
            handler.handle_mmio(addr, false, data)?;
            Ok(PlatformExit::IoHandled)
        }
        KvmVcpuExit::MmioWrite(addr, data) => {
            handler.handle_mmio(addr, true, data)?;
            Ok(PlatformExit::IoHandled)
        }
        // ARM64 only: the kernel could not decode the faulting instruction
        // (ISV=0 in the ESR) and hands back the raw syndrome instead of a
        // pre-decoded MmioRead/MmioWrite. `crate::arch::arm64` re-derives
        // size/direction/target-register from `esr_iss`.
        #[cfg(target_arch = "aarch64")]
        KvmVcpuExit::ArmNisv(fault_ipa, esr_iss) => Ok(PlatformExit::UnmappedGpa {
            esr: esr_iss,
            fault_gpa: fault_ipa,
        }),
        KvmVcpuExit::Hlt => Ok(PlatformExit::Halt),
        KvmVcpuExit::Shutdown => Ok(PlatformExit::Reset { reset_type: 0 }),
        KvmVcpuExit::SystemEvent(event, _) => Ok(PlatformExit::Reset { reset_type: event }),
        KvmVcpuExit::InternalError => Ok(PlatformExit::InternalError),
        KvmVcpuExit::FailEntry(reason, _) => Ok(PlatformExit::FailEntry { reason }),
        KvmVcpuExit::Hypercall(_) => Ok(PlatformExit::Unknown("Hypercall")),
        KvmVcpuExit::Debug(_) => Ok(PlatformExit::Unknown("Debug")),
        KvmVcpuExit::Exception => Ok(PlatformExit::Unknown("Exception")),
        KvmVcpuExit::IrqWindowOpen => Ok(PlatformExit::Unknown("IrqWindowOpen")),
        KvmVcpuExit::Watchdog => Ok(PlatformExit::Unknown("Watchdog")),
        _ => Ok(PlatformExit::Unknown("Other")),
    }
}
