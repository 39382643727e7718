//! KVM partition (VM file descriptor) wrapper.
//!
//! x86_64 setup (TSS address, in-kernel PIC/IOAPIC, PIT) is ported near
//! verbatim from the teacher's `kvm::vm::VmFd::new`. ARM64 setup (GICv3
//! distributor + per-vCPU redistributor) has no teacher counterpart and
//! follows the same device-creation shape the wider rust-vmm ecosystem
//! uses for it (see `DESIGN.md`).

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use kvm_bindings::CpuId;

use super::{wrap, KvmBackendError, KvmVcpu};
use crate::error::Result;
use crate::platform::{Architecture, Partition};

#[cfg(target_arch = "x86_64")]
use kvm_bindings::{kvm_pit_config, kvm_userspace_memory_region, KVM_PIT_SPEAKER_DUMMY};

#[cfg(target_arch = "aarch64")]
use kvm_bindings::{kvm_create_device, kvm_device_type::KVM_DEV_TYPE_ARM_VGIC_V3, kvm_userspace_memory_region};

/// Fixed GICv3 distributor base used on every ARM64 partition this backend
/// creates (see `crate::arch::arm64::gic`).
#[cfg(target_arch = "aarch64")]
pub const GICD_BASE: u64 = 0x0800_0000;
#[cfg(target_arch = "aarch64")]
pub const GICR_BASE: u64 = 0x0801_0000;
#[cfg(target_arch = "aarch64")]
pub const GICR_SIZE: u64 = 0x0002_0000;

pub struct KvmPartition {
    vm: Arc<kvm_ioctls::VmFd>,
    arch: Architecture,
    #[cfg_attr(not(target_arch = "x86_64"), allow(dead_code))]
    supported_cpuid: CpuId,
    next_vcpu_id: AtomicU32,
}

impl KvmPartition {
    pub(super) fn new(vm: kvm_ioctls::VmFd, supported_cpuid: CpuId, arch: Architecture) -> Result<Self> {
        #[cfg(target_arch = "x86_64")]
        {
            vm.set_tss_address(0xfffb_d000)
                .map_err(|e| wrap(KvmBackendError::SetTssAddress(e)))?;
            vm.create_irq_chip()
                .map_err(|e| wrap(KvmBackendError::CreateIrqChip(e)))?;
            let pit_config = kvm_pit_config {
                flags: KVM_PIT_SPEAKER_DUMMY,
                ..Default::default()
            };
            vm.create_pit2(pit_config)
                .map_err(|e| wrap(KvmBackendError::CreatePit2(e)))?;
        }

        #[cfg(target_arch = "aarch64")]
        {
            let mut device = kvm_create_device {
                type_: KVM_DEV_TYPE_ARM_VGIC_V3,
                fd: 0,
                flags: 0,
            };
            vm.create_device(&mut device)
                .map_err(|e| wrap(KvmBackendError::CreateGic(e)))?;
        }

        Ok(Self {
            vm: Arc::new(vm),
            arch,
            supported_cpuid,
            next_vcpu_id: AtomicU32::new(0),
        })
    }

    pub fn architecture(&self) -> Architecture {
        self.arch
    }
}

impl Partition for KvmPartition {
    type Vcpu = KvmVcpu;

    fn map_memory(&mut self, gpa: u64, host_addr: u64, size: u64) -> Result<()> {
        let region = kvm_userspace_memory_region {
            slot: 0,
            guest_phys_addr: gpa,
            memory_size: size,
            userspace_addr: host_addr,
            flags: 0,
        };
        unsafe {
            self.vm
                .set_user_memory_region(region)
                .map_err(|e| wrap(KvmBackendError::SetMemoryRegion(e)))
        }
    }

    fn create_vcpu(&mut self, id: u32) -> Result<KvmVcpu> {
        let index = self.next_vcpu_id.fetch_add(1, Ordering::SeqCst);
        debug_assert_eq!(index, id, "single-vCPU core always creates id 0");
        let vcpu = self
            .vm
            .create_vcpu(id as u64)
            .map_err(|e| wrap(KvmBackendError::CreateVcpu(e)))?;

        #[cfg(target_arch = "x86_64")]
        {
            vcpu.set_cpuid2(&self.supported_cpuid)
                .map_err(|e| wrap(KvmBackendError::SetCpuid(e)))?;
        }

        Ok(KvmVcpu::new(vcpu, self.arch, Arc::clone(&self.vm)))
    }
}
