//! ARM64 time-slice marker pseudo-device.
//!
//! Registered like any other chipset device rather than intercepted ahead
//! of the MMIO lookup, per the decision recorded in `DESIGN.md`: a write
//! to its region stashes the low 32 bits of the source data as the
//! current exit's time-slice id and signals the run loop to skip the
//! usual post-MMIO PC advance, preserving the pre-existing contract on
//! this one path instead of silently changing it.

use crate::device::{Device, DeviceResult, PcAdvance};
use crate::exit::ExitContext;

/// Fixed, reserved GPA the marker claims on every ARM64 VM.
pub const TIMESLICE_MARKER_BASE: u64 = 0x0903_0000;
pub const TIMESLICE_MARKER_SIZE: u64 = 0x1000;

pub struct TimesliceMarkerDevice {
    regions: [(u64, u64); 1],
}

impl TimesliceMarkerDevice {
    pub fn new() -> Self {
        Self {
            regions: [(TIMESLICE_MARKER_BASE, TIMESLICE_MARKER_SIZE)],
        }
    }
}

impl Default for TimesliceMarkerDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl Device for TimesliceMarkerDevice {
    fn device_id(&self) -> &str {
        "timeslice-marker"
    }

    fn mmio_regions(&self) -> &[(u64, u64)] {
        &self.regions
    }

    fn write_mmio(&mut self, ctx: &mut ExitContext, _gpa: u64, data: &[u8]) -> DeviceResult<PcAdvance> {
        let mut buf = [0u8; 4];
        let n = data.len().min(4);
        buf[..n].copy_from_slice(&data[..n]);
        ctx.set_exit_timeslice(u32::from_le_bytes(buf) as u64);
        Ok(PcAdvance::SkipPcAdvance)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_records_slice_id_and_skips_pc_advance() {
        let mut device = TimesliceMarkerDevice::new();
        let mut ctx = ExitContext::new();
        let outcome = device.write_mmio(&mut ctx, TIMESLICE_MARKER_BASE, &7u32.to_le_bytes()).unwrap();
        assert_eq!(outcome, PcAdvance::SkipPcAdvance);
        assert_eq!(ctx.pending_timeslice_id(), Some(7));
    }

    #[test]
    fn read_uses_default_advance() {
        let mut device = TimesliceMarkerDevice::new();
        let mut ctx = ExitContext::new();
        let mut data = [0u8; 4];
        let outcome = device.read_mmio(&mut ctx, TIMESLICE_MARKER_BASE, &mut data).unwrap();
        assert_eq!(outcome, PcAdvance::Advance);
    }
}
