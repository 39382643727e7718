//! Process-wide entry point: probes host virtualization capability and
//! starts building VMs from a [`VmConfig`].
//!
//! A thin adapter over `crate::platform::Hypervisor`; the actual bring-up
//! work (memory allocation, partition creation, chipset freeze, vCPU
//! spawn) lives in `crate::vm::VirtualMachineBuilder`, which this module
//! hands back so a caller can register devices before the guest ever runs.

use std::marker::PhantomData;

use crate::config::VmConfig;
use crate::error::Result;
use crate::memory::MemoryRegion;
use crate::platform::{Architecture, Hypervisor};
use crate::vm::VirtualMachineBuilder;

/// Binds a concrete platform backend (e.g. `crate::platform::kvm::KvmHypervisor`)
/// to the VM-construction entry point.
pub struct VmHypervisor<H: Hypervisor> {
    _backend: PhantomData<H>,
}

impl<H: Hypervisor> VmHypervisor<H> {
    /// Fails with `HypervisorUnavailable` if the host reports no
    /// virtualization support.
    pub fn probe() -> Result<Architecture> {
        H::probe_capability()
    }

    /// Creates a partition and maps its RAM per `config`, returning a
    /// builder ready to accept devices. `config.arch` pins the target
    /// architecture; `None` asks the host what it supports.
    pub fn build(config: &VmConfig) -> Result<VirtualMachineBuilder<H::Partition>> {
        let architecture = match config.arch {
            Some(configured) => configured.into(),
            None => H::probe_capability()?,
        };
        let partition = H::create_partition(architecture)?;
        let memory = MemoryRegion::allocate(0, config.memory_size.bytes())?;
        VirtualMachineBuilder::new(partition, memory, architecture, config.msr_policy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MsrPolicy;
    use crate::error::VmmError;
    use crate::platform::{ExitHandler, Partition, PlatformExit, Vcpu};
    use std::collections::HashMap;

    struct FakeVcpu;
    impl Vcpu for FakeVcpu {
        fn get_registers(&self, _out: &mut HashMap<crate::register::Register, crate::register::RegisterValue>) -> Result<()> {
            Ok(())
        }
        fn set_registers(&self, _values: &HashMap<crate::register::Register, crate::register::RegisterValue>) -> Result<()> {
            Ok(())
        }
        fn run(&self, _handler: &mut dyn ExitHandler) -> Result<PlatformExit> {
            Ok(PlatformExit::Halt)
        }
        fn cancel(&self) {}
    }

    struct FakePartition;
    impl Partition for FakePartition {
        type Vcpu = FakeVcpu;
        fn map_memory(&mut self, _gpa: u64, _host_addr: u64, _size: u64) -> Result<()> {
            Ok(())
        }
        fn create_vcpu(&mut self, _id: u32) -> Result<FakeVcpu> {
            Ok(FakeVcpu)
        }
    }

    struct FakeHypervisor;
    impl Hypervisor for FakeHypervisor {
        type Partition = FakePartition;
        fn probe_capability() -> Result<Architecture> {
            Ok(Architecture::X86_64)
        }
        fn create_partition(_arch: Architecture) -> Result<FakePartition> {
            Ok(FakePartition)
        }
    }

    #[test]
    fn probe_reports_the_backend_architecture() {
        assert_eq!(VmHypervisor::<FakeHypervisor>::probe().unwrap(), Architecture::X86_64);
    }

    #[test]
    fn build_rejects_unavailable_hypervisors() {
        struct UnavailableHypervisor;
        impl Hypervisor for UnavailableHypervisor {
            type Partition = FakePartition;
            fn probe_capability() -> Result<Architecture> {
                Err(VmmError::HypervisorUnavailable)
            }
            fn create_partition(_arch: Architecture) -> Result<FakePartition> {
                Ok(FakePartition)
            }
        }
        let config = VmConfig {
            memory_size: crate::config::MemorySize::mib(16),
            arch: None,
            msr_policy: MsrPolicy::default(),
        };
        assert!(matches!(
            VmHypervisor::<UnavailableHypervisor>::build(&config),
            Err(VmmError::HypervisorUnavailable)
        ));
    }

    #[test]
    fn build_defaults_to_the_probed_architecture() {
        let config = VmConfig {
            memory_size: crate::config::MemorySize::mib(16),
            arch: None,
            msr_policy: MsrPolicy::default(),
        };
        let builder = VmHypervisor::<FakeHypervisor>::build(&config).unwrap();
        let vm = builder.build().unwrap();
        assert_eq!(vm.architecture(), Architecture::X86_64);
    }
}
