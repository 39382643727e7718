//! Exit-dispatch registry: resolves port-I/O and MMIO accesses to the
//! device that owns them.
//!
//! Grounded on the teacher's `devices::mmio::MmioBus` (linear-scan,
//! sorted-by-base dispatch with a single capability), generalized to:
//! both PIO and MMIO tables, registration-time overlap rejection, binary
//! search over the frozen MMIO table, and an explicit build/freeze step
//! instead of building lazily on first dispatch.

use std::collections::HashMap;

use tracing::warn;

use crate::device::{Device, PcAdvance};
use crate::error::{Result, VmmError};
use crate::exit::ExitContext;

struct MmioSlot {
    base: u64,
    end: u64,
    device_index: usize,
}

/// Build-time registry for devices; becomes an immutable dispatch table
/// once [`Chipset::freeze`] is called.
pub struct Chipset {
    devices: Vec<Box<dyn Device>>,
    port_table: HashMap<u16, usize>,
    mmio_table: Vec<MmioSlot>,
    frozen: bool,
}

impl Chipset {
    /// An empty, unfrozen registry.
    pub fn new() -> Self {
        Self {
            devices: Vec::new(),
            port_table: HashMap::new(),
            mmio_table: Vec::new(),
            frozen: false,
        }
    }

    /// Registers `device`, validating its claimed ports/regions against
    /// what is already registered.
    ///
    /// Exact-duplicate MMIO regions (same `(base, size)` as an
    /// already-registered device) are silently skipped rather than
    /// rejected, matching legacy adapters that alias the same window
    /// twice; this is logged at `warn` level so the skip is observable.
    /// Overlapping-but-not-identical regions, and any port overlap, fail
    /// with `RegionConflict`.
    pub fn register(&mut self, device: Box<dyn Device>) -> Result<()> {
        if self.frozen {
            return Err(VmmError::ChipsetFrozen(device.device_id().to_string()));
        }

        for &port in device.io_ports() {
            if self.port_table.contains_key(&port) {
                return Err(VmmError::RegionConflict(format!(
                    "port {port:#x} claimed by {:?} already registered",
                    device.device_id()
                )));
            }
        }

        for &(base, size) in device.mmio_regions() {
            let end = base + size;
            for slot in &self.mmio_table {
                let exact_duplicate = slot.base == base && slot.end == end;
                let overlaps = base < slot.end && slot.base < end;
                if exact_duplicate {
                    warn!(
                        device = device.device_id(),
                        base, size, "skipping exact-duplicate MMIO registration"
                    );
                    return Ok(());
                }
                if overlaps {
                    return Err(VmmError::RegionConflict(format!(
                        "MMIO region {base:#x}..{end:#x} claimed by {:?} overlaps an existing device",
                        device.device_id()
                    )));
                }
            }
        }

        let index = self.devices.len();
        for &port in device.io_ports() {
            self.port_table.insert(port, index);
        }
        for &(base, size) in device.mmio_regions() {
            self.mmio_table.push(MmioSlot {
                base,
                end: base + size,
                device_index: index,
            });
        }
        self.devices.push(device);
        Ok(())
    }

    /// Freezes the registry: sorts the MMIO table for binary search and
    /// rejects further registration with `ChipsetFrozen`.
    pub fn freeze(&mut self) {
        self.mmio_table.sort_by_key(|s| s.base);
        self.frozen = true;
    }

    /// Dispatches a port-I/O access. `data.len()` must be 1, 2, or 4;
    /// anything else fails with `InvalidAccessWidth` before a device is
    /// ever consulted.
    pub fn handle_pio(
        &mut self,
        ctx: &mut ExitContext,
        port: u16,
        data: &mut [u8],
        is_write: bool,
    ) -> Result<()> {
        if !matches!(data.len(), 1 | 2 | 4) {
            return Err(VmmError::InvalidAccessWidth { len: data.len() });
        }
        let Some(&index) = self.port_table.get(&port) else {
            return Err(VmmError::UnhandledPio { port });
        };
        let device = &mut self.devices[index];
        let result = if is_write {
            device.write_io_port(ctx, port, data)
        } else {
            device.read_io_port(ctx, port, data)
        };
        result.map_err(VmmError::DeviceError)
    }

    /// Dispatches an MMIO access. `data.len()` must be 1, 2, 4, or 8;
    /// anything else fails with `InvalidAccessWidth` before a device is
    /// ever consulted. Returns whether the caller should advance PC past
    /// the faulting instruction (relevant to ARM64 callers only; see
    /// [`PcAdvance`]).
    pub fn handle_mmio(
        &mut self,
        ctx: &mut ExitContext,
        gpa: u64,
        data: &mut [u8],
        is_write: bool,
    ) -> Result<PcAdvance> {
        if !matches!(data.len(), 1 | 2 | 4 | 8) {
            return Err(VmmError::InvalidAccessWidth { len: data.len() });
        }
        let len = data.len() as u64;
        let slot_index = self
            .mmio_table
            .binary_search_by(|slot| {
                if gpa < slot.base {
                    std::cmp::Ordering::Greater
                } else if gpa >= slot.end {
                    std::cmp::Ordering::Less
                } else {
                    std::cmp::Ordering::Equal
                }
            })
            .ok()
            .filter(|&i| gpa + len <= self.mmio_table[i].end);
        let Some(slot_index) = slot_index else {
            return Err(VmmError::UnhandledMmio { gpa });
        };
        let slot = &self.mmio_table[slot_index];
        let offset_gpa = slot.base + (gpa - slot.base);
        let device = &mut self.devices[slot.device_index];
        let result = if is_write {
            device.write_mmio(ctx, offset_gpa, data)
        } else {
            device.read_mmio(ctx, offset_gpa, data)
        };
        result.map_err(VmmError::DeviceError)
    }

    /// Iterates devices for snapshot capture/restore, in registration
    /// order (which, since ids are required unique, is a valid
    /// deterministic order for the snapshot codec to re-sort by id).
    pub fn devices_mut(&mut self) -> impl Iterator<Item = &mut Box<dyn Device>> {
        self.devices.iter_mut()
    }
}

impl Default for Chipset {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct TestDevice {
        id: String,
        ports: Vec<u16>,
        regions: Vec<(u64, u64)>,
        last_write: Option<Vec<u8>>,
    }

    impl TestDevice {
        fn new(id: &str, ports: Vec<u16>, regions: Vec<(u64, u64)>) -> Self {
            Self {
                id: id.to_string(),
                ports,
                regions,
                last_write: None,
            }
        }
    }

    impl Device for TestDevice {
        fn device_id(&self) -> &str {
            &self.id
        }
        fn io_ports(&self) -> &[u16] {
            &self.ports
        }
        fn mmio_regions(&self) -> &[(u64, u64)] {
            &self.regions
        }
        fn read_io_port(&mut self, _ctx: &mut ExitContext, _port: u16, data: &mut [u8]) -> crate::device::DeviceResult<()> {
            data.fill(0xAB);
            Ok(())
        }
        fn write_io_port(&mut self, _ctx: &mut ExitContext, _port: u16, data: &[u8]) -> crate::device::DeviceResult<()> {
            self.last_write = Some(data.to_vec());
            Ok(())
        }
        fn read_mmio(&mut self, _ctx: &mut ExitContext, _gpa: u64, data: &mut [u8]) -> crate::device::DeviceResult<PcAdvance> {
            data.fill(0xCD);
            Ok(PcAdvance::Advance)
        }
        fn write_mmio(&mut self, _ctx: &mut ExitContext, _gpa: u64, data: &[u8]) -> crate::device::DeviceResult<PcAdvance> {
            self.last_write = Some(data.to_vec());
            Ok(PcAdvance::Advance)
        }
    }

    #[test]
    fn pio_dispatches_to_owning_device() {
        let mut chipset = Chipset::new();
        chipset
            .register(Box::new(TestDevice::new("uart", vec![0x3f8], vec![])))
            .unwrap();
        chipset.freeze();

        let mut ctx = ExitContext::new();
        let mut data = [0u8; 1];
        chipset.handle_pio(&mut ctx, 0x3f8, &mut data, false).unwrap();
        assert_eq!(data, [0xAB]);
    }

    #[test]
    fn unclaimed_pio_fails() {
        let mut chipset = Chipset::new();
        chipset.freeze();
        let mut ctx = ExitContext::new();
        let mut data = [0u8; 1];
        assert!(matches!(
            chipset.handle_pio(&mut ctx, 0x3f8, &mut data, false),
            Err(VmmError::UnhandledPio { port: 0x3f8 })
        ));
    }

    #[test]
    fn mmio_binary_search_finds_region() {
        let mut chipset = Chipset::new();
        chipset
            .register(Box::new(TestDevice::new("a", vec![], vec![(0x1000, 0x1000)])))
            .unwrap();
        chipset
            .register(Box::new(TestDevice::new("b", vec![], vec![(0x5000, 0x1000)])))
            .unwrap();
        chipset.freeze();

        let mut ctx = ExitContext::new();
        let mut data = [0u8; 4];
        chipset.handle_mmio(&mut ctx, 0x5004, &mut data, false).unwrap();
        assert_eq!(data, [0xCD; 4]);
    }

    #[test]
    fn overlapping_regions_are_rejected() {
        let mut chipset = Chipset::new();
        chipset
            .register(Box::new(TestDevice::new("a", vec![], vec![(0x1000, 0x1000)])))
            .unwrap();
        let err = chipset
            .register(Box::new(TestDevice::new("b", vec![], vec![(0x1800, 0x1000)])))
            .unwrap_err();
        assert!(matches!(err, VmmError::RegionConflict(_)));
    }

    #[test]
    fn exact_duplicate_region_is_skipped_not_rejected() {
        let mut chipset = Chipset::new();
        chipset
            .register(Box::new(TestDevice::new("a", vec![], vec![(0x1000, 0x1000)])))
            .unwrap();
        chipset
            .register(Box::new(TestDevice::new("a-alias", vec![], vec![(0x1000, 0x1000)])))
            .unwrap();
        assert_eq!(chipset.devices.len(), 1);
    }

    #[test]
    fn registering_after_freeze_fails() {
        let mut chipset = Chipset::new();
        chipset.freeze();
        let err = chipset
            .register(Box::new(TestDevice::new("late", vec![0x80], vec![])))
            .unwrap_err();
        assert!(matches!(err, VmmError::ChipsetFrozen(_)));
    }

    #[test]
    fn pio_width_three_is_rejected_before_dispatch() {
        let mut chipset = Chipset::new();
        chipset
            .register(Box::new(TestDevice::new("uart", vec![0x3f8], vec![])))
            .unwrap();
        chipset.freeze();

        let mut ctx = ExitContext::new();
        let mut data = [0u8; 3];
        assert!(matches!(
            chipset.handle_pio(&mut ctx, 0x3f8, &mut data, false),
            Err(VmmError::InvalidAccessWidth { len: 3 })
        ));
    }

    #[test]
    fn mmio_width_three_is_rejected_before_dispatch() {
        let mut chipset = Chipset::new();
        chipset
            .register(Box::new(TestDevice::new("a", vec![], vec![(0x1000, 0x1000)])))
            .unwrap();
        chipset.freeze();

        let mut ctx = ExitContext::new();
        let mut data = [0u8; 3];
        assert!(matches!(
            chipset.handle_mmio(&mut ctx, 0x1000, &mut data, false),
            Err(VmmError::InvalidAccessWidth { len: 3 })
        ));
    }

    #[test]
    fn port_overlap_is_rejected() {
        let mut chipset = Chipset::new();
        chipset
            .register(Box::new(TestDevice::new("a", vec![0x60], vec![])))
            .unwrap();
        let err = chipset
            .register(Box::new(TestDevice::new("b", vec![0x60], vec![])))
            .unwrap_err();
        assert!(matches!(err, VmmError::RegionConflict(_)));
    }
}
