//! Binary snapshot codec (§6.2): captures and restores full VM state —
//! register banks, guest RAM, opaque per-device state, and
//! architecture-specific extras — across host processes.
//!
//! Capture and restore both take the VM's memory lock exclusively
//! (`VirtualMachine::mem_mutex`) for the whole operation: registers,
//! memory, device state, and arch extras must all be observed, or
//! overwritten, as one consistent point in time. Compression uses
//! `flate2`, matching the teacher's choice of crate for the one spot its
//! own memory snapshots needed gzip.

use std::collections::HashMap;
use std::io::{Cursor, Read, Write};
use std::path::Path;

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;

use crate::arch::ArchExtras;
use crate::platform::{Architecture, Partition};
use crate::register::{Register, RegisterValue};
use crate::error::{Result, VmmError};
use crate::vm::{VirtualMachine, VCPU_ID};

const MAGIC: u32 = 0xC0FF_EE01;
const VERSION: u32 = 1;

/// A captured VM state, opaque to callers beyond what [`Snapshot::architecture`]
/// exposes. Round-trips through [`encode`]/[`decode`] to the §6.2 wire format.
#[derive(Debug, Clone)]
pub struct Snapshot {
    architecture: Architecture,
    vcpu_registers: Vec<(u32, Vec<(Register, RegisterValue)>)>,
    memory: Vec<u8>,
    devices: Vec<(String, Vec<u8>)>,
    arch_extras: ArchExtras,
}

impl Snapshot {
    pub fn architecture(&self) -> Architecture {
        self.architecture
    }
}

impl<P: Partition> VirtualMachine<P> {
    /// Captures this VM's full state under the memory lock's write side.
    pub fn capture_snapshot(&self) -> Result<Snapshot> {
        let _guard = self.mem_mutex().write().expect("vm memory lock poisoned");

        let request: HashMap<Register, RegisterValue> = Register::canonical_set(self.architecture())
            .into_iter()
            .map(|reg| (reg, RegisterValue::U64(0)))
            .collect();
        let registers = self.executor().get_registers(request)?;
        let regs: Vec<(Register, RegisterValue)> = registers.into_iter().collect();
        let memory = self.memory().snapshot_bytes();
        let devices = self.executor().capture_devices();
        let arch_extras = self.executor().capture_extras();

        Ok(Snapshot {
            architecture: self.architecture(),
            vcpu_registers: vec![(VCPU_ID, regs)],
            memory,
            devices,
            arch_extras,
        })
    }

    /// Restores `snapshot` into this VM under the memory lock's write
    /// side. Fails without mutating anything observable if the
    /// architecture tag or memory length does not match.
    pub fn restore_snapshot(&self, snapshot: &Snapshot) -> Result<()> {
        let _guard = self.mem_mutex().write().expect("vm memory lock poisoned");

        if snapshot.architecture != self.architecture() {
            return Err(VmmError::ArchitectureMismatch);
        }
        if snapshot.memory.len() as u64 != self.memory().size() {
            return Err(VmmError::SnapshotSizeMismatch);
        }

        self.memory().restore_bytes(&snapshot.memory)?;

        for (_cpu_id, regs) in &snapshot.vcpu_registers {
            let values: HashMap<Register, RegisterValue> = regs.iter().copied().collect();
            self.executor().set_registers(values)?;
        }

        self.executor().restore_devices(snapshot.devices.clone())?;
        self.executor().restore_extras(snapshot.arch_extras.clone());

        Ok(())
    }
}

/// Writes `snapshot` to `path` in the §6.2 binary format.
pub fn save_to(path: &Path, snapshot: &Snapshot) -> Result<()> {
    std::fs::write(path, encode(snapshot))?;
    Ok(())
}

/// Reads a snapshot previously written by [`save_to`].
pub fn load_from(path: &Path) -> Result<Snapshot> {
    let bytes = std::fs::read(path)?;
    decode(&bytes)
}

fn encode(snapshot: &Snapshot) -> Vec<u8> {
    let mut buf = Vec::new();

    buf.extend_from_slice(&MAGIC.to_le_bytes());
    buf.extend_from_slice(&VERSION.to_le_bytes());
    let arch_tag: u32 = match snapshot.architecture {
        Architecture::X86_64 => 0,
        Architecture::Arm64 => 1,
    };
    buf.extend_from_slice(&arch_tag.to_le_bytes());
    buf.extend_from_slice(&0u32.to_le_bytes()); // flags, reserved

    let mut vcpus = snapshot.vcpu_registers.clone();
    vcpus.sort_by_key(|(cpu_id, _)| *cpu_id);
    buf.extend_from_slice(&(vcpus.len() as u32).to_le_bytes());
    for (cpu_id, regs) in &vcpus {
        buf.extend_from_slice(&cpu_id.to_le_bytes());
        let mut regs = regs.clone();
        regs.sort_by_key(|(reg, _)| reg.wire_id());
        buf.extend_from_slice(&(regs.len() as u32).to_le_bytes());
        for (reg, value) in &regs {
            buf.extend_from_slice(&reg.wire_id().to_le_bytes());
            let v = value.as_u64().expect("RegisterValue::U64 is the only wire-encodable variant");
            buf.extend_from_slice(&v.to_le_bytes());
        }
    }

    let mut gzip_bytes = Vec::new();
    {
        let mut encoder = GzEncoder::new(&mut gzip_bytes, Compression::default());
        encoder.write_all(&snapshot.memory).expect("writing to an in-memory buffer cannot fail");
        encoder.finish().expect("finishing an in-memory gzip stream cannot fail");
    }
    buf.extend_from_slice(&(snapshot.memory.len() as u64).to_le_bytes());
    buf.extend_from_slice(&(gzip_bytes.len() as u64).to_le_bytes());
    buf.extend_from_slice(&gzip_bytes);

    let mut devices = snapshot.devices.clone();
    devices.sort_by(|a, b| a.0.cmp(&b.0));
    buf.extend_from_slice(&(devices.len() as u32).to_le_bytes());
    for (id, data) in &devices {
        let id_bytes = id.as_bytes();
        buf.extend_from_slice(&(id_bytes.len() as u32).to_le_bytes());
        buf.extend_from_slice(id_bytes);
        buf.extend_from_slice(&(data.len() as u32).to_le_bytes());
        buf.extend_from_slice(data);
    }

    match &snapshot.arch_extras {
        ArchExtras::X86_64 => buf.push(0),
        ArchExtras::Arm64 { asserted_interrupts } => {
            buf.push(1);
            let mut data = Vec::new();
            data.extend_from_slice(&(asserted_interrupts.len() as u32).to_le_bytes());
            for (intid, asserted) in asserted_interrupts {
                data.extend_from_slice(&intid.to_le_bytes());
                data.push(u8::from(*asserted));
            }
            buf.extend_from_slice(&(data.len() as u32).to_le_bytes());
            buf.extend_from_slice(&data);
        }
    }

    buf
}

fn decode(bytes: &[u8]) -> Result<Snapshot> {
    let mut cursor = Cursor::new(bytes);

    let magic = read_u32(&mut cursor)?;
    if magic != MAGIC {
        return Err(VmmError::MalformedSnapshot(format!("bad magic {magic:#010x}")));
    }
    let version = read_u32(&mut cursor)?;
    if version != VERSION {
        return Err(VmmError::MalformedSnapshot(format!("unsupported version {version}")));
    }
    let arch_tag = read_u32(&mut cursor)?;
    let architecture = match arch_tag {
        0 => Architecture::X86_64,
        1 => Architecture::Arm64,
        other => return Err(VmmError::MalformedSnapshot(format!("unknown architecture tag {other}"))),
    };
    let _flags = read_u32(&mut cursor)?;

    let vcpu_count = read_u32(&mut cursor)?;
    let mut vcpu_registers = Vec::with_capacity(vcpu_count as usize);
    for _ in 0..vcpu_count {
        let cpu_id = read_u32(&mut cursor)?;
        let reg_count = read_u32(&mut cursor)?;
        let mut regs = Vec::with_capacity(reg_count as usize);
        for _ in 0..reg_count {
            let reg_id = read_u32(&mut cursor)?;
            let value = read_u64(&mut cursor)?;
            let reg = Register::from_wire_id(architecture, reg_id)
                .ok_or_else(|| VmmError::MalformedSnapshot(format!("unknown register id {reg_id}")))?;
            regs.push((reg, RegisterValue::U64(value)));
        }
        vcpu_registers.push((cpu_id, regs));
    }

    let uncompressed_size = read_u64(&mut cursor)?;
    let compressed_size = read_u64(&mut cursor)?;
    let start = cursor.position() as usize;
    let end = start
        .checked_add(compressed_size as usize)
        .filter(|&end| end <= bytes.len())
        .ok_or_else(|| VmmError::MalformedSnapshot("truncated memory section".to_string()))?;
    let mut memory = Vec::with_capacity(uncompressed_size as usize);
    GzDecoder::new(&bytes[start..end])
        .read_to_end(&mut memory)
        .map_err(|e| VmmError::MalformedSnapshot(format!("invalid gzip stream: {e}")))?;
    if memory.len() as u64 != uncompressed_size {
        return Err(VmmError::MalformedSnapshot("memory section length mismatch".to_string()));
    }
    cursor.set_position(end as u64);

    let device_count = read_u32(&mut cursor)?;
    let mut devices = Vec::with_capacity(device_count as usize);
    for _ in 0..device_count {
        let id_len = read_u32(&mut cursor)? as usize;
        let id = read_string(&mut cursor, id_len)?;
        let data_len = read_u32(&mut cursor)? as usize;
        let data = read_bytes(&mut cursor, data_len)?;
        devices.push((id, data));
    }

    let present = read_u8(&mut cursor)?;
    let arch_extras = if present == 0 {
        ArchExtras::default()
    } else {
        match architecture {
            Architecture::Arm64 => {
                let data_len = read_u32(&mut cursor)? as usize;
                let data = read_bytes(&mut cursor, data_len)?;
                let mut extras_cursor = Cursor::new(data.as_slice());
                let count = read_u32(&mut extras_cursor)?;
                let mut asserted_interrupts = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    let intid = read_u32(&mut extras_cursor)?;
                    let asserted = read_u8(&mut extras_cursor)? != 0;
                    asserted_interrupts.push((intid, asserted));
                }
                ArchExtras::Arm64 { asserted_interrupts }
            }
            Architecture::X86_64 => {
                return Err(VmmError::MalformedSnapshot(
                    "arch_extras present on an x86_64 snapshot".to_string(),
                ))
            }
        }
    };

    Ok(Snapshot {
        architecture,
        vcpu_registers,
        memory,
        devices,
        arch_extras,
    })
}

fn read_exact_array<const N: usize>(cursor: &mut Cursor<&[u8]>) -> Result<[u8; N]> {
    let mut buf = [0u8; N];
    cursor
        .read_exact(&mut buf)
        .map_err(|e| VmmError::MalformedSnapshot(format!("unexpected end of snapshot: {e}")))?;
    Ok(buf)
}

fn read_u8(cursor: &mut Cursor<&[u8]>) -> Result<u8> {
    Ok(read_exact_array::<1>(cursor)?[0])
}

fn read_u32(cursor: &mut Cursor<&[u8]>) -> Result<u32> {
    Ok(u32::from_le_bytes(read_exact_array(cursor)?))
}

fn read_u64(cursor: &mut Cursor<&[u8]>) -> Result<u64> {
    Ok(u64::from_le_bytes(read_exact_array(cursor)?))
}

fn read_bytes(cursor: &mut Cursor<&[u8]>, len: usize) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; len];
    cursor
        .read_exact(&mut buf)
        .map_err(|e| VmmError::MalformedSnapshot(format!("unexpected end of snapshot: {e}")))?;
    Ok(buf)
}

fn read_string(cursor: &mut Cursor<&[u8]>, len: usize) -> Result<String> {
    String::from_utf8(read_bytes(cursor, len)?)
        .map_err(|e| VmmError::MalformedSnapshot(format!("invalid utf-8 device id: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MsrPolicy;
    use crate::device::Device;
    use crate::memory::MemoryRegion;
    use crate::platform::{ExitHandler, PlatformExit, Vcpu};
    use crate::vm::VirtualMachineBuilder;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct FakePartition;
    struct FakeVcpu {
        regs: Mutex<HashMap<Register, RegisterValue>>,
        calls: AtomicUsize,
    }

    impl Vcpu for FakeVcpu {
        fn get_registers(&self, out: &mut HashMap<Register, RegisterValue>) -> Result<()> {
            let regs = self.regs.lock().unwrap();
            for (reg, value) in out.iter_mut() {
                if let Some(&found) = regs.get(reg) {
                    *value = found;
                }
            }
            Ok(())
        }
        fn set_registers(&self, values: &HashMap<Register, RegisterValue>) -> Result<()> {
            self.regs.lock().unwrap().extend(values.iter().map(|(&k, &v)| (k, v)));
            Ok(())
        }
        fn run(&self, _handler: &mut dyn ExitHandler) -> Result<PlatformExit> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(PlatformExit::Halt)
        }
        fn cancel(&self) {}
    }

    impl Partition for FakePartition {
        type Vcpu = FakeVcpu;
        fn map_memory(&mut self, _gpa: u64, _host_addr: u64, _size: u64) -> Result<()> {
            Ok(())
        }
        fn create_vcpu(&mut self, _id: u32) -> Result<FakeVcpu> {
            let mut regs = HashMap::new();
            regs.insert(Register::from(crate::register::X86Register::Rip), RegisterValue::U64(0x1000));
            Ok(FakeVcpu {
                regs: Mutex::new(regs),
                calls: AtomicUsize::new(0),
            })
        }
    }

    struct StatefulDevice {
        value: u8,
    }
    impl Device for StatefulDevice {
        fn device_id(&self) -> &str {
            "stateful"
        }
        fn capture_snapshot(&mut self) -> Option<Vec<u8>> {
            Some(vec![self.value])
        }
        fn restore_snapshot(&mut self, data: &[u8]) {
            self.value = data[0];
        }
    }

    fn build_vm() -> VirtualMachine<FakePartition> {
        let memory = MemoryRegion::allocate(0, 4096).unwrap();
        let mut builder =
            VirtualMachineBuilder::new(FakePartition, memory, Architecture::X86_64, MsrPolicy::default()).unwrap();
        builder.add_device(Box::new(StatefulDevice { value: 0x42 })).unwrap();
        builder.build().unwrap()
    }

    #[test]
    fn capture_then_restore_preserves_memory_registers_and_devices() {
        let vm = build_vm();
        vm.write_memory(0x10, &[9, 9, 9]).unwrap();

        let snapshot = vm.capture_snapshot().unwrap();
        assert_eq!(snapshot.architecture(), Architecture::X86_64);

        vm.write_memory(0x10, &[0, 0, 0]).unwrap();
        vm.restore_snapshot(&snapshot).unwrap();

        let mut buf = [0u8; 3];
        vm.read_memory(0x10, &mut buf).unwrap();
        assert_eq!(buf, [9, 9, 9]);
    }

    #[test]
    fn wire_format_roundtrips_through_encode_and_decode() {
        let vm = build_vm();
        vm.write_memory(0x10, &[1, 2, 3, 4]).unwrap();
        let snapshot = vm.capture_snapshot().unwrap();

        let bytes = encode(&snapshot);
        let decoded = decode(&bytes).unwrap();

        assert_eq!(decoded.architecture, snapshot.architecture);
        assert_eq!(decoded.memory, snapshot.memory);
        assert_eq!(decoded.devices, snapshot.devices);
    }

    #[test]
    fn capturing_twice_without_execution_is_byte_identical() {
        let vm = build_vm();
        let a = encode(&vm.capture_snapshot().unwrap());
        let b = encode(&vm.capture_snapshot().unwrap());
        assert_eq!(a, b);
    }

    #[test]
    fn restore_rejects_architecture_mismatch() {
        let vm = build_vm();
        let mut snapshot = vm.capture_snapshot().unwrap();
        snapshot.architecture = Architecture::Arm64;
        assert!(matches!(vm.restore_snapshot(&snapshot), Err(VmmError::ArchitectureMismatch)));
    }

    #[test]
    fn restore_rejects_memory_size_mismatch() {
        let vm = build_vm();
        let mut snapshot = vm.capture_snapshot().unwrap();
        snapshot.memory.pop();
        assert!(matches!(vm.restore_snapshot(&snapshot), Err(VmmError::SnapshotSizeMismatch)));
    }

    #[test]
    fn decode_rejects_bad_magic() {
        let vm = build_vm();
        let mut bytes = encode(&vm.capture_snapshot().unwrap());
        bytes[0] ^= 0xFF;
        assert!(matches!(decode(&bytes), Err(VmmError::MalformedSnapshot(_))));
    }

    #[test]
    fn save_and_load_round_trip_through_a_file() {
        let vm = build_vm();
        vm.write_memory(0x20, &[7, 7]).unwrap();
        let snapshot = vm.capture_snapshot().unwrap();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vm.snapshot");
        save_to(&path, &snapshot).unwrap();
        let loaded = load_from(&path).unwrap();

        assert_eq!(loaded.memory, snapshot.memory);
    }
}
