//! End-to-end scenarios exercising the public API: build a VM, attach
//! devices, drive it through fake `Partition`/`Vcpu` backends, and check
//! what comes out the other side of dispatch, snapshot, and chipset
//! registration.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use carbon::config::MsrPolicy;
use carbon::device::{Device, DeviceResult, PcAdvance};
use carbon::exit::ExitContext;
use carbon::memory::MemoryRegion;
use carbon::platform::{Architecture, ExitHandler, Partition, PlatformExit, Vcpu};
use carbon::register::{Arm64Register, Register, RegisterValue, X86Register};
use carbon::vm::{VirtualMachine, VirtualMachineBuilder};
use carbon::{Result, VmmError};

/// A register bank shared between the test and a fake vCPU's worker thread.
struct RegisterBank(Mutex<HashMap<Register, RegisterValue>>);

impl RegisterBank {
    fn new() -> Self {
        Self(Mutex::new(HashMap::new()))
    }

    fn get(&self, out: &mut HashMap<Register, RegisterValue>) {
        let regs = self.0.lock().unwrap();
        for (reg, value) in out.iter_mut() {
            if let Some(&found) = regs.get(reg) {
                *value = found;
            }
        }
    }

    fn set(&self, values: &HashMap<Register, RegisterValue>) {
        self.0.lock().unwrap().extend(values.iter().map(|(&k, &v)| (k, v)));
    }
}

struct FakePartition<V> {
    make_vcpu: Box<dyn Fn() -> V + Send>,
}

impl<V: Vcpu + Send + Sync + 'static> Partition for FakePartition<V> {
    type Vcpu = V;

    fn map_memory(&mut self, _gpa: u64, _host_addr: u64, _size: u64) -> Result<()> {
        Ok(())
    }

    fn create_vcpu(&mut self, _id: u32) -> Result<V> {
        Ok((self.make_vcpu)())
    }
}

fn build_vm<V: Vcpu + Send + Sync + 'static>(
    architecture: Architecture,
    memory_size: u64,
    make_vcpu: impl Fn() -> V + Send + 'static,
) -> VirtualMachineBuilder<FakePartition<V>> {
    let memory = MemoryRegion::allocate(0, memory_size).unwrap();
    let partition = FakePartition {
        make_vcpu: Box::new(make_vcpu),
    };
    VirtualMachineBuilder::new(partition, memory, architecture, MsrPolicy::default()).unwrap()
}

// --- Scenario 1: trivial x86_64 HLT boot ------------------------------

struct HaltingVcpu {
    regs: RegisterBank,
}

impl Vcpu for HaltingVcpu {
    fn get_registers(&self, out: &mut HashMap<Register, RegisterValue>) -> Result<()> {
        self.regs.get(out);
        Ok(())
    }
    fn set_registers(&self, values: &HashMap<Register, RegisterValue>) -> Result<()> {
        self.regs.set(values);
        Ok(())
    }
    fn run(&self, _handler: &mut dyn ExitHandler) -> Result<PlatformExit> {
        Ok(PlatformExit::Halt)
    }
    fn cancel(&self) {}
}

#[test]
fn booting_a_hlt_payload_halts_cleanly() {
    let builder = build_vm(Architecture::X86_64, 0x10000, || HaltingVcpu { regs: RegisterBank::new() });
    let vm = builder.build().unwrap();
    vm.write_memory(0x1000, &[0xF4]).unwrap();

    let mut regs = HashMap::new();
    regs.insert(Register::X86(X86Register::Rip), RegisterValue::U64(0x1000));
    vm.executor().set_registers(regs).unwrap();

    let err = vm.run().unwrap_err();
    assert!(matches!(err, VmmError::VmHalted));
}

// --- Scenario 2: ARM64 MMIO readback -----------------------------------

struct ConstantMmioDevice {
    value: u8,
}

impl Device for ConstantMmioDevice {
    fn device_id(&self) -> &str {
        "const_mmio"
    }
    fn mmio_regions(&self) -> &[(u64, u64)] {
        &[(0x0900_0000, 0x1000)]
    }
    fn read_mmio(&mut self, _ctx: &mut ExitContext, _gpa: u64, data: &mut [u8]) -> DeviceResult<PcAdvance> {
        data.fill(self.value);
        Ok(PcAdvance::Advance)
    }
}

struct UnmappedGpaOnceVcpu {
    regs: RegisterBank,
    calls: AtomicUsize,
    esr: u64,
    fault_gpa: u64,
}

impl Vcpu for UnmappedGpaOnceVcpu {
    fn get_registers(&self, out: &mut HashMap<Register, RegisterValue>) -> Result<()> {
        self.regs.get(out);
        Ok(())
    }
    fn set_registers(&self, values: &HashMap<Register, RegisterValue>) -> Result<()> {
        self.regs.set(values);
        Ok(())
    }
    fn run(&self, _handler: &mut dyn ExitHandler) -> Result<PlatformExit> {
        match self.calls.fetch_add(1, Ordering::SeqCst) {
            0 => Ok(PlatformExit::UnmappedGpa { esr: self.esr, fault_gpa: self.fault_gpa }),
            _ => Ok(PlatformExit::Reset { reset_type: 0 }),
        }
    }
    fn cancel(&self) {}
}

#[test]
fn arm64_mmio_read_lands_in_the_target_register_and_advances_pc() {
    // ISV=1, SAS=0 (1 byte), SRT=0 (X0), WnR=0 (read).
    let esr = (1u64 << 24) | (0 << 22) | (0 << 16);
    let mut builder = build_vm(Architecture::Arm64, 0x1000, move || UnmappedGpaOnceVcpu {
        regs: RegisterBank::new(),
        calls: AtomicUsize::new(0),
        esr,
        fault_gpa: 0x0900_0000,
    });
    builder.add_device(Box::new(ConstantMmioDevice { value: 0xAB })).unwrap();
    let vm = builder.build().unwrap();

    let err = vm.run().unwrap_err();
    assert!(matches!(err, VmmError::VmHalted));

    let mut request = HashMap::new();
    request.insert(Register::Arm64(Arm64Register::X(0)), RegisterValue::U64(0));
    request.insert(Register::Arm64(Arm64Register::Pc), RegisterValue::U64(0));
    let result = vm.executor().get_registers(request).unwrap();
    assert_eq!(result[&Register::Arm64(Arm64Register::X(0))].as_u64(), Some(0xAB));
    assert_eq!(result[&Register::Arm64(Arm64Register::Pc)].as_u64(), Some(4));
}

// --- Scenario 3 & 4: x86_64 PIO round trip, then snapshot round trip ---

struct StoredPortDevice {
    value: u8,
}

impl Device for StoredPortDevice {
    fn device_id(&self) -> &str {
        "stored_port"
    }
    fn io_ports(&self) -> &[u16] {
        &[0x3F8]
    }
    fn write_io_port(&mut self, _ctx: &mut ExitContext, _port: u16, data: &[u8]) -> DeviceResult<()> {
        self.value = data[0];
        Ok(())
    }
    fn read_io_port(&mut self, _ctx: &mut ExitContext, _port: u16, data: &mut [u8]) -> DeviceResult<()> {
        data[0] = self.value;
        Ok(())
    }
    fn capture_snapshot(&mut self) -> Option<Vec<u8>> {
        Some(vec![self.value])
    }
    fn restore_snapshot(&mut self, data: &[u8]) {
        self.value = data[0];
    }
}

/// Drives two PIO exits (a write then a read) through the real
/// `X86ExitHandler`, then halts.
struct PioRoundTripVcpu {
    regs: RegisterBank,
    calls: AtomicUsize,
    last_read: Mutex<Option<u8>>,
}

impl PioRoundTripVcpu {
    fn new() -> Self {
        Self {
            regs: RegisterBank::new(),
            calls: AtomicUsize::new(0),
            last_read: Mutex::new(None),
        }
    }
}

impl Vcpu for PioRoundTripVcpu {
    fn get_registers(&self, out: &mut HashMap<Register, RegisterValue>) -> Result<()> {
        self.regs.get(out);
        Ok(())
    }
    fn set_registers(&self, values: &HashMap<Register, RegisterValue>) -> Result<()> {
        self.regs.set(values);
        Ok(())
    }
    fn run(&self, handler: &mut dyn ExitHandler) -> Result<PlatformExit> {
        match self.calls.fetch_add(1, Ordering::SeqCst) {
            0 => {
                let mut data = [0x42u8];
                handler.handle_pio(0x3F8, true, &mut data)?;
                Ok(PlatformExit::IoHandled)
            }
            1 => {
                let mut data = [0u8];
                handler.handle_pio(0x3F8, false, &mut data)?;
                *self.last_read.lock().unwrap() = Some(data[0]);
                Ok(PlatformExit::IoHandled)
            }
            _ => Ok(PlatformExit::Halt),
        }
    }
    fn cancel(&self) {}
}

fn build_pio_vm() -> VirtualMachine<FakePartition<PioRoundTripVcpu>> {
    let mut builder = build_vm(Architecture::X86_64, 0x1000, PioRoundTripVcpu::new);
    builder.add_device(Box::new(StoredPortDevice { value: 0 })).unwrap();
    builder.build().unwrap()
}

#[test]
fn x86_64_pio_write_then_read_round_trips_through_the_device() {
    let vm = build_pio_vm();
    let err = vm.run().unwrap_err();
    assert!(matches!(err, VmmError::VmHalted));
    assert_eq!(*vm.executor().vcpu().last_read.lock().unwrap(), Some(0x42));
}

#[test]
fn snapshot_round_trip_preserves_device_state() {
    let vm = build_pio_vm();
    vm.run().unwrap_err();

    let snapshot = vm.capture_snapshot().unwrap();
    assert_eq!(snapshot.architecture(), Architecture::X86_64);

    let fresh = build_pio_vm();
    fresh.restore_snapshot(&snapshot).unwrap();

    let mut request = HashMap::new();
    request.insert(Register::X86(X86Register::Rip), RegisterValue::U64(0));
    let regs = fresh.executor().get_registers(request).unwrap();
    let source_rip = vm
        .executor()
        .get_registers({
            let mut r = HashMap::new();
            r.insert(Register::X86(X86Register::Rip), RegisterValue::U64(0));
            r
        })
        .unwrap();
    assert_eq!(
        regs[&Register::X86(X86Register::Rip)],
        source_rip[&Register::X86(X86Register::Rip)]
    );
}

// --- Scenario 7: device error surfaces through the pending-error slot --

struct FailingPortDevice;

impl Device for FailingPortDevice {
    fn device_id(&self) -> &str {
        "failing_port"
    }
    fn io_ports(&self) -> &[u16] {
        &[0x3F8]
    }
    fn write_io_port(&mut self, _ctx: &mut ExitContext, _port: u16, _data: &[u8]) -> DeviceResult<()> {
        Err("write rejected by failing_port".into())
    }
}

struct PioWriteOnceVcpu {
    regs: RegisterBank,
    calls: AtomicUsize,
}

impl Vcpu for PioWriteOnceVcpu {
    fn get_registers(&self, out: &mut HashMap<Register, RegisterValue>) -> Result<()> {
        self.regs.get(out);
        Ok(())
    }
    fn set_registers(&self, values: &HashMap<Register, RegisterValue>) -> Result<()> {
        self.regs.set(values);
        Ok(())
    }
    fn run(&self, handler: &mut dyn ExitHandler) -> Result<PlatformExit> {
        match self.calls.fetch_add(1, Ordering::SeqCst) {
            0 => {
                let mut data = [0x42u8];
                handler.handle_pio(0x3F8, true, &mut data)?;
                Ok(PlatformExit::IoHandled)
            }
            _ => Ok(PlatformExit::Halt),
        }
    }
    fn cancel(&self) {}
}

#[test]
fn a_device_write_error_surfaces_as_a_device_error_instead_of_continuing() {
    let mut builder = build_vm(Architecture::X86_64, 0x1000, || PioWriteOnceVcpu {
        regs: RegisterBank::new(),
        calls: AtomicUsize::new(0),
    });
    builder.add_device(Box::new(FailingPortDevice)).unwrap();
    let vm = builder.build().unwrap();

    let err = vm.run().unwrap_err();
    assert!(matches!(err, VmmError::DeviceError(_)));
}

// --- Scenario 6: dispatch conflict at registration time ----------------

#[test]
fn overlapping_mmio_regions_are_rejected_at_build_time() {
    struct ClaimsRegion {
        id: &'static str,
        region: (u64, u64),
    }
    impl Device for ClaimsRegion {
        fn device_id(&self) -> &str {
            self.id
        }
        fn mmio_regions(&self) -> &[(u64, u64)] {
            std::slice::from_ref(&self.region)
        }
    }

    let mut builder = build_vm(Architecture::X86_64, 0x1000, || HaltingVcpu { regs: RegisterBank::new() });
    builder
        .add_device(Box::new(ClaimsRegion { id: "a", region: (0x1000, 0x1000) }))
        .unwrap();
    let err = builder
        .add_device(Box::new(ClaimsRegion { id: "b", region: (0x1800, 0x1000) }))
        .unwrap_err();
    assert!(matches!(err, VmmError::RegionConflict(_)));
}
