//! The virtual machine: one guest partition, its memory, its single vCPU
//! executor, and the chipset of devices attached to it.
//!
//! Construction is a two-phase builder, mirroring the teacher's
//! `Vm::new` (partition + memory bring-up) followed by device attachment:
//! [`VirtualMachineBuilder`] collects devices and registers them with the
//! chipset, then [`VirtualMachineBuilder::build`] freezes the chipset and
//! hands the vCPU its resources once, before the guest ever runs. Freezing
//! eagerly here (rather than lazily on first dispatch, as an earlier
//! revision of this core did) is a deliberate simplification — see
//! `DESIGN.md`.

use std::sync::RwLock;

use crate::arch::{ArchState, DispatchOutcome};
use crate::chipset::Chipset;
use crate::config::MsrPolicy;
use crate::device::Device;
use crate::error::Result;
use crate::memory::{GuestPhysicalAddress, MemoryRegion};
use crate::platform::{Architecture, Partition};
use crate::vcpu::{terminal_result, VcpuExecutor};

/// The single vCPU id this core ever creates, per the single-vCPU
/// non-goal. Visible to `crate::snapshot`, which tags the one register
/// bank it captures/restores with this id.
pub(crate) const VCPU_ID: u32 = 0;

/// Collects devices before the chipset is frozen and the vCPU executor
/// spawned. Once [`VirtualMachineBuilder::build`] runs, no more devices can
/// be attached.
pub struct VirtualMachineBuilder<P: Partition> {
    partition: P,
    memory: MemoryRegion,
    architecture: Architecture,
    chipset: Chipset,
    msr_policy: MsrPolicy,
}

impl<P: Partition> VirtualMachineBuilder<P> {
    /// Maps `memory` into `partition` at guest physical address 0 and
    /// returns a builder ready to accept devices.
    pub fn new(mut partition: P, memory: MemoryRegion, architecture: Architecture, msr_policy: MsrPolicy) -> Result<Self> {
        let (host_addr, size) = memory.as_raw_parts();
        partition.map_memory(memory.guest_base(), host_addr, size)?;
        Ok(Self {
            partition,
            memory,
            architecture,
            chipset: Chipset::new(),
            msr_policy,
        })
    }

    /// Registers `device` with the chipset. Fails with `RegionConflict` if
    /// its claimed ports/regions overlap an already-registered device.
    pub fn add_device(&mut self, device: Box<dyn Device>) -> Result<()> {
        self.chipset.register(device)
    }

    /// Freezes the chipset, creates vCPU 0, and spawns its executor.
    pub fn build(mut self) -> Result<VirtualMachine<P>> {
        if self.architecture == Architecture::Arm64 {
            self.chipset
                .register(Box::new(crate::devices::TimesliceMarkerDevice::new()))?;
        }
        self.chipset.freeze();

        let arch_state = match self.architecture {
            Architecture::X86_64 => ArchState::X86_64(crate::arch::x86_64::X86ArchState::new(self.msr_policy)),
            Architecture::Arm64 => ArchState::Arm64(crate::arch::arm64::Arm64ArchState::new()),
        };

        let vcpu = self.partition.create_vcpu(VCPU_ID)?;
        let executor = VcpuExecutor::spawn(VCPU_ID as usize, vcpu, self.memory.clone(), self.chipset, arch_state);

        Ok(VirtualMachine {
            partition: self.partition,
            memory: self.memory,
            architecture: self.architecture,
            executor,
            mem_mutex: RwLock::new(()),
        })
    }
}

/// A running virtual machine: one partition, its RAM, and its vCPU
/// executor.
///
/// `mem_mutex` arbitrates between ordinary guest memory access (shared:
/// many concurrent readers/writers of disjoint or overlapping bytes are
/// each individually safe, `vm-memory` guarantees byte-level atomicity for
/// a single `read_slice`/`write_slice` call) and snapshot capture/restore
/// (exclusive: the whole region, plus every device and the vCPU's
/// registers, must be observed as one consistent point in time).
pub struct VirtualMachine<P: Partition> {
    #[allow(dead_code)]
    partition: P,
    memory: MemoryRegion,
    architecture: Architecture,
    executor: VcpuExecutor<P::Vcpu>,
    mem_mutex: RwLock<()>,
}

impl<P: Partition> VirtualMachine<P> {
    pub fn architecture(&self) -> Architecture {
        self.architecture
    }

    /// Reads `data.len()` bytes of guest RAM starting at `gpa`.
    pub fn read_memory(&self, gpa: GuestPhysicalAddress, data: &mut [u8]) -> Result<()> {
        let _guard = self.mem_mutex.read().expect("vm memory lock poisoned");
        self.memory.read_at(gpa, data)
    }

    /// Writes `data` into guest RAM starting at `gpa`.
    pub fn write_memory(&self, gpa: GuestPhysicalAddress, data: &[u8]) -> Result<()> {
        let _guard = self.mem_mutex.read().expect("vm memory lock poisoned");
        self.memory.write_at(gpa, data)
    }

    /// The vCPU executor, for callers (the snapshot engine, device
    /// completion callbacks wanting `set_irq`) that need direct access.
    pub fn executor(&self) -> &VcpuExecutor<P::Vcpu> {
        &self.executor
    }

    /// Guest RAM, for the snapshot engine's byte-exact capture/restore.
    pub(crate) fn memory(&self) -> &MemoryRegion {
        &self.memory
    }

    /// The lock snapshot capture/restore takes exclusively; shared memory
    /// access takes it for read.
    pub(crate) fn mem_mutex(&self) -> &RwLock<()> {
        &self.mem_mutex
    }

    /// Runs the guest until it halts, requests a reboot, is canceled, or a
    /// device reports an error. `Ok(())` is never returned: every
    /// termination is represented as an `Err` variant (`VmHalted`,
    /// `GuestRequestedReboot`, `CanceledWithoutReason`, or a propagated
    /// device error), per §4.4.
    pub fn run(&self) -> Result<()> {
        loop {
            let outcome = self.executor.run_once()?;
            if let DispatchOutcome::Continue = outcome {
                continue;
            }
            return terminal_result(outcome);
        }
    }

    /// Requests the running guest stop at the next exit boundary with
    /// `VmmError::CanceledWithoutReason`.
    pub fn cancel(&self) {
        self.executor.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::VmmError;
    use crate::platform::{ExitHandler, PlatformExit, Vcpu};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct FakePartition {
        mapped: Vec<(u64, u64, u64)>,
    }

    struct FakeVcpu {
        regs: Mutex<HashMap<crate::register::Register, crate::register::RegisterValue>>,
        calls: AtomicUsize,
    }

    impl Vcpu for FakeVcpu {
        fn get_registers(&self, out: &mut HashMap<crate::register::Register, crate::register::RegisterValue>) -> Result<()> {
            let regs = self.regs.lock().unwrap();
            for (reg, value) in out.iter_mut() {
                if let Some(&found) = regs.get(reg) {
                    *value = found;
                }
            }
            Ok(())
        }
        fn set_registers(&self, values: &HashMap<crate::register::Register, crate::register::RegisterValue>) -> Result<()> {
            self.regs.lock().unwrap().extend(values.iter().map(|(&k, &v)| (k, v)));
            Ok(())
        }
        fn run(&self, _handler: &mut dyn ExitHandler) -> Result<PlatformExit> {
            // Halts immediately the first call, and every call after.
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(PlatformExit::Halt)
        }
        fn cancel(&self) {}
    }

    impl Partition for FakePartition {
        type Vcpu = FakeVcpu;

        fn map_memory(&mut self, gpa: u64, host_addr: u64, size: u64) -> Result<()> {
            self.mapped.push((gpa, host_addr, size));
            Ok(())
        }

        fn create_vcpu(&mut self, _id: u32) -> Result<FakeVcpu> {
            Ok(FakeVcpu {
                regs: Mutex::new(HashMap::new()),
                calls: AtomicUsize::new(0),
            })
        }
    }

    fn build_vm() -> VirtualMachine<FakePartition> {
        let memory = MemoryRegion::allocate(0, 4096).unwrap();
        let partition = FakePartition { mapped: Vec::new() };
        let builder =
            VirtualMachineBuilder::new(partition, memory, Architecture::X86_64, MsrPolicy::default()).unwrap();
        builder.build().unwrap()
    }

    #[test]
    fn memory_maps_during_builder_construction() {
        let memory = MemoryRegion::allocate(0, 4096).unwrap();
        let partition = FakePartition { mapped: Vec::new() };
        let builder =
            VirtualMachineBuilder::new(partition, memory, Architecture::X86_64, MsrPolicy::default()).unwrap();
        assert_eq!(builder.partition.mapped.len(), 1);
    }

    #[test]
    fn run_halts_immediately_on_a_fake_vcpu() {
        let vm = build_vm();
        let err = vm.run().unwrap_err();
        assert!(matches!(err, VmmError::VmHalted));
    }

    #[test]
    fn memory_read_write_roundtrips_through_the_vm() {
        let vm = build_vm();
        vm.write_memory(0x10, &[1, 2, 3]).unwrap();
        let mut buf = [0u8; 3];
        vm.read_memory(0x10, &mut buf).unwrap();
        assert_eq!(buf, [1, 2, 3]);
    }

    #[test]
    fn adding_a_device_after_build_is_impossible_once_frozen() {
        // `build()` consumes the builder, so device registration after
        // freezing is a compile-time impossibility rather than a runtime
        // `ChipsetFrozen` error; this test documents that shape.
        let memory = MemoryRegion::allocate(0, 4096).unwrap();
        let partition = FakePartition { mapped: Vec::new() };
        let mut builder =
            VirtualMachineBuilder::new(partition, memory, Architecture::X86_64, MsrPolicy::default()).unwrap();
        struct NullDevice;
        impl Device for NullDevice {
            fn device_id(&self) -> &str {
                "null"
            }
        }
        assert!(builder.add_device(Box::new(NullDevice)).is_ok());
        let _vm = builder.build().unwrap();
    }
}
