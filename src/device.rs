//! Device capability traits.
//!
//! A device opts into any subset of port-I/O, MMIO, and snapshot support by
//! implementing the corresponding trait; [`Device`] ties the subset together
//! under one stable id so the chipset registry (`crate::chipset`) can look
//! device descriptors up generically. This is the same "small trait per
//! capability, one struct implements several" shape as the teacher's
//! `MmioDevice`, generalized to also cover port I/O and snapshotting.

use std::error::Error;

use crate::exit::ExitContext;

/// Access width in bytes, as seen on the wire between a device and the
/// instruction emulator (x86_64) or data-abort decode (ARM64).
pub type AccessWidth = usize;

/// A device handler's result. Devices raise their own errors as a boxed
/// `std::error::Error` rather than `crate::error::VmmError` so that a
/// `Device` implementor does not need a dependency on the crate's own
/// error taxonomy; the chipset wraps whatever comes back into
/// `VmmError::DeviceError` at the dispatch boundary (`crate::chipset`).
pub type DeviceResult<T> = Result<T, Box<dyn Error + Send + Sync>>;

/// A device attached to a [`crate::vm::VirtualMachine`].
///
/// `device_id` must be unique within a VM; it is the key snapshot state is
/// stored and restored under.
pub trait Device: Send {
    /// Stable identifier, unique within the owning VM.
    fn device_id(&self) -> &str;

    /// Called once, synchronously, when the device is attached to a VM.
    /// The default implementation does nothing.
    fn init(&mut self) {}

    /// 16-bit I/O ports this device claims. Empty if the device does not
    /// respond to port I/O.
    fn io_ports(&self) -> &[u16] {
        &[]
    }

    /// `(base, size)` MMIO regions this device claims. Empty if the device
    /// does not respond to MMIO.
    fn mmio_regions(&self) -> &[(u64, u64)] {
        &[]
    }

    /// Handle a port-I/O read. `data.len()` is 1, 2, or 4.
    fn read_io_port(&mut self, _ctx: &mut ExitContext, _port: u16, _data: &mut [u8]) -> DeviceResult<()> {
        Ok(())
    }

    /// Handle a port-I/O write. `data.len()` is 1, 2, or 4.
    fn write_io_port(&mut self, _ctx: &mut ExitContext, _port: u16, _data: &[u8]) -> DeviceResult<()> {
        Ok(())
    }

    /// Handle an MMIO read at `gpa`. `data.len()` is 1, 2, 4, or 8. The
    /// return value tells an ARM64 caller whether to advance PC past the
    /// faulting instruction; x86_64 callers ignore it (the platform's own
    /// instruction emulator already advanced PC before returning this exit).
    fn read_mmio(&mut self, _ctx: &mut ExitContext, _gpa: u64, _data: &mut [u8]) -> DeviceResult<PcAdvance> {
        Ok(PcAdvance::Advance)
    }

    /// Handle an MMIO write at `gpa`. `data.len()` is 1, 2, 4, or 8. See
    /// [`Device::read_mmio`] for the return value's meaning.
    fn write_mmio(&mut self, _ctx: &mut ExitContext, _gpa: u64, _data: &[u8]) -> DeviceResult<PcAdvance> {
        Ok(PcAdvance::Advance)
    }

    /// Opaque snapshot state, if this device participates in snapshotting.
    /// `None` means the device has no state to preserve.
    fn capture_snapshot(&mut self) -> Option<Vec<u8>> {
        None
    }

    /// Restore opaque snapshot state previously returned by
    /// `capture_snapshot`. Only called for devices that returned `Some` at
    /// capture time.
    fn restore_snapshot(&mut self, _data: &[u8]) {}
}

/// Whether a dispatched MMIO/PIO handler expects the run loop to advance
/// the program counter past the faulting instruction.
///
/// Every handler advances PC by default; the ARM64 time-slice marker
/// fast-path (`crate::devices::timeslice_marker`) is the one documented
/// exception, preserved from the source behavior rather than silently
/// changed (see `DESIGN.md`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PcAdvance {
    Advance,
    SkipPcAdvance,
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullDevice;
    impl Device for NullDevice {
        fn device_id(&self) -> &str {
            "null"
        }
    }

    #[test]
    fn default_device_claims_nothing() {
        let d = NullDevice;
        assert!(d.io_ports().is_empty());
        assert!(d.mmio_regions().is_empty());
    }

    #[test]
    fn default_device_has_no_snapshot_state() {
        let mut d = NullDevice;
        assert!(d.capture_snapshot().is_none());
    }
}
