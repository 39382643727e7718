//! Linux KVM reference backend.
//!
//! Ported from the teacher's `kvm::{create_vm, VmFd, VcpuFd}` trio, kept
//! behind the `Platform` trait boundary (`crate::platform`) instead of
//! being named directly by the core. Mechanical glue; not part of the
//! core's line budget, but kept in-tree as the reference integration the
//! run loop and chipset are validated against.

mod vcpu;
mod vm;

pub use vcpu::KvmVcpu;
pub use vm::KvmPartition;

use kvm_bindings::KVM_MAX_CPUID_ENTRIES;
use kvm_ioctls::Kvm;
use thiserror::Error;

use crate::error::{Result, VmmError};
use crate::platform::{Architecture, Hypervisor};

/// Errors from the KVM ioctl layer, attached as a `#[source]` of
/// `VmmError::PartitionSetup` rather than surfaced directly to callers.
#[derive(Error, Debug)]
pub enum KvmBackendError {
    #[error("failed to open /dev/kvm: {0}")]
    OpenKvm(#[source] kvm_ioctls::Error),
    #[error("failed to create VM: {0}")]
    CreateVm(#[source] kvm_ioctls::Error),
    #[error("failed to create vCPU: {0}")]
    CreateVcpu(#[source] kvm_ioctls::Error),
    #[error("failed to set user memory region: {0}")]
    SetMemoryRegion(#[source] kvm_ioctls::Error),
    #[error("failed to set registers: {0}")]
    SetRegisters(#[source] kvm_ioctls::Error),
    #[error("failed to get registers: {0}")]
    GetRegisters(#[source] kvm_ioctls::Error),
    #[error("failed to run vCPU: {0}")]
    Run(#[source] kvm_ioctls::Error),
    #[error("failed to set TSS address: {0}")]
    SetTssAddress(#[source] kvm_ioctls::Error),
    #[error("failed to create IRQ chip: {0}")]
    CreateIrqChip(#[source] kvm_ioctls::Error),
    #[error("failed to create PIT2: {0}")]
    CreatePit2(#[source] kvm_ioctls::Error),
    #[error("failed to get supported CPUID: {0}")]
    GetSupportedCpuid(#[source] kvm_ioctls::Error),
    #[error("failed to set CPUID: {0}")]
    SetCpuid(#[source] kvm_ioctls::Error),
    #[error("failed to set MSRs: {0}")]
    SetMsrs(#[source] kvm_ioctls::Error),
    #[error("failed to create GIC device: {0}")]
    CreateGic(#[source] kvm_ioctls::Error),
    #[error("failed to access one_reg: {0}")]
    OneReg(#[source] kvm_ioctls::Error),
}

fn wrap(e: KvmBackendError) -> VmmError {
    VmmError::PartitionSetup(Box::new(e))
}

/// Process-wide KVM factory.
pub struct KvmHypervisor;

impl Hypervisor for KvmHypervisor {
    type Partition = KvmPartition;

    fn probe_capability() -> Result<Architecture> {
        Kvm::new().map_err(|e| wrap(KvmBackendError::OpenKvm(e)))?;
        #[cfg(target_arch = "x86_64")]
        {
            Ok(Architecture::X86_64)
        }
        #[cfg(target_arch = "aarch64")]
        {
            Ok(Architecture::Arm64)
        }
        #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
        {
            Err(VmmError::HypervisorUnavailable)
        }
    }

    fn create_partition(arch: Architecture) -> Result<KvmPartition> {
        let kvm = Kvm::new().map_err(|e| wrap(KvmBackendError::OpenKvm(e)))?;
        let supported_cpuid = kvm
            .get_supported_cpuid(KVM_MAX_CPUID_ENTRIES)
            .map_err(|e| wrap(KvmBackendError::GetSupportedCpuid(e)))?;
        let vm = kvm
            .create_vm()
            .map_err(|e| wrap(KvmBackendError::CreateVm(e)))?;
        KvmPartition::new(vm, supported_cpuid, arch)
    }
}
