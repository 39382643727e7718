//! Virtio block device (virtio-blk over virtio-mmio).
//!
//! # Protocol
//!
//! The guest communicates via descriptor chains:
//!
//! 1. **Request header** (16 bytes, device-readable): type (4, IN=0/OUT=1/FLUSH=4),
//!    reserved (4), sector (8).
//! 2. **Data buffer** (device-writable for reads, device-readable for writes).
//! 3. **Status** (1 byte, device-writable): 0=OK, 1=IOERR, 2=UNSUPP.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;

use tracing::{debug, warn};

use crate::device::{Device, DeviceResult, PcAdvance};
use crate::exit::ExitContext;
use crate::memory::MemoryRegion;

use super::{
    VirtqDesc, Virtqueue, MAX_QUEUE_SIZE, MMIO_DEVICE_FEATURES, MMIO_DEVICE_FEATURES_SEL, MMIO_DEVICE_ID,
    MMIO_DRIVER_FEATURES, MMIO_DRIVER_FEATURES_SEL, MMIO_INTERRUPT_ACK, MMIO_INTERRUPT_STATUS, MMIO_MAGIC_VALUE,
    MMIO_QUEUE_DESC_HIGH, MMIO_QUEUE_DESC_LOW, MMIO_QUEUE_DEVICE_HIGH, MMIO_QUEUE_DEVICE_LOW, MMIO_QUEUE_DRIVER_HIGH,
    MMIO_QUEUE_DRIVER_LOW, MMIO_QUEUE_NOTIFY, MMIO_QUEUE_NUM, MMIO_QUEUE_NUM_MAX, MMIO_QUEUE_READY, MMIO_QUEUE_SEL,
    MMIO_STATUS, MMIO_VENDOR_ID, MMIO_VERSION, STATUS_ACKNOWLEDGE, STATUS_DRIVER, STATUS_DRIVER_OK, STATUS_FEATURES_OK,
    VIRTIO_MMIO_MAGIC, VIRTIO_MMIO_VERSION, VIRTIO_VENDOR_ID, VIRTQ_DESC_F_NEXT, VIRTQ_DESC_F_WRITE,
};

/// Fixed GPA the device claims, matching `virtio_mmio.device=4K@<base>:<irq>`
/// on the kernel command line.
pub const VIRTIO_BLK_MMIO_BASE: u64 = 0x0d00_0000;
pub const VIRTIO_BLK_MMIO_SIZE: u64 = 0x1000;

/// Virtio device ID for block devices.
const VIRTIO_BLK_DEVICE_ID: u32 = 2;

/// Sector size in bytes.
const SECTOR_SIZE: u64 = 512;

/// Block size (logical block size reported to guest).
const BLK_SIZE: u32 = 512;

// Feature bits (from virtio spec)
const VIRTIO_BLK_F_SIZE_MAX: u32 = 1 << 1;
const VIRTIO_BLK_F_SEG_MAX: u32 = 1 << 2;
const VIRTIO_BLK_F_BLK_SIZE: u32 = 1 << 6;
const VIRTIO_BLK_F_FLUSH: u32 = 1 << 9;

/// VIRTIO_F_VERSION_1, required for virtio-mmio v2 devices. Bit 32 overall,
/// so bit 0 of the high features word.
const VIRTIO_F_VERSION_1: u32 = 1 << 0;

/// Maximum segment size we support (1MB).
const SIZE_MAX: u32 = 1024 * 1024;
/// Maximum segments per request.
const SEG_MAX: u32 = 128;

// Block request types
const VIRTIO_BLK_T_IN: u32 = 0;
const VIRTIO_BLK_T_OUT: u32 = 1;
const VIRTIO_BLK_T_FLUSH: u32 = 4;

// Block status codes
const VIRTIO_BLK_S_OK: u8 = 0;
const VIRTIO_BLK_S_IOERR: u8 = 1;
const VIRTIO_BLK_S_UNSUPP: u8 = 2;

// Config space offsets (relative to MMIO_CONFIG = 0x100)
const CONFIG_CAPACITY: u64 = 0x100; // 8 bytes
const CONFIG_SIZE_MAX: u64 = 0x108; // 4 bytes
const CONFIG_SEG_MAX: u64 = 0x10c; // 4 bytes
const CONFIG_BLK_SIZE: u64 = 0x114; // 4 bytes (after geometry)

/// Virtio block device, backed by a raw disk image file.
pub struct VirtioBlk {
    disk: File,
    capacity: u64,

    device_features_lo: u32,
    device_features_hi: u32,
    driver_features_lo: u32,
    driver_features_hi: u32,
    features_sel: u32,

    status: u32,
    interrupt_status: u32,

    queue_sel: u32,
    queue: Virtqueue,

    /// Guest memory, needed to walk the virtqueue once the guest notifies
    /// us; set via [`VirtioBlk::set_memory`] before the device is attached.
    memory: Option<MemoryRegion>,

    request_count: u64,
}

impl VirtioBlk {
    /// Opens `disk_path` as the device's backing store.
    pub fn new(disk_path: &str) -> std::io::Result<Self> {
        let disk = OpenOptions::new().read(true).write(true).open(disk_path)?;

        let metadata = disk.metadata()?;
        let capacity = metadata.len() / SECTOR_SIZE;

        debug!(disk_path, sectors = capacity, bytes = metadata.len(), "virtio-blk: opened disk");

        let device_features_lo =
            VIRTIO_BLK_F_SIZE_MAX | VIRTIO_BLK_F_SEG_MAX | VIRTIO_BLK_F_BLK_SIZE | VIRTIO_BLK_F_FLUSH;
        let device_features_hi = VIRTIO_F_VERSION_1;

        Ok(Self {
            disk,
            capacity,
            device_features_lo,
            device_features_hi,
            driver_features_lo: 0,
            driver_features_hi: 0,
            features_sel: 0,
            status: 0,
            interrupt_status: 0,
            queue_sel: 0,
            queue: Virtqueue::new(),
            memory: None,
            request_count: 0,
        })
    }

    /// Gives the device the guest memory handle it needs to walk the
    /// virtqueue. Must be called before the device is registered with a
    /// chipset; a device notified before this is set silently drops the
    /// notification.
    pub fn set_memory(&mut self, memory: MemoryRegion) {
        self.memory = Some(memory);
    }

    fn process_queue(&mut self) {
        let Some(memory) = self.memory.clone() else {
            warn!("virtio-blk: queue notified before guest memory was attached");
            return;
        };

        while self.queue.has_pending(&memory) {
            if let Some(desc_idx) = self.queue.pop_avail(&memory) {
                let len = self.process_request(&memory, desc_idx);
                if self.queue.push_used(&memory, desc_idx, len).is_err() {
                    warn!("virtio-blk: failed to push to used ring");
                }
                self.request_count += 1;
                self.interrupt_status |= 1; // USED_BUFFER interrupt
            }
        }
    }

    /// Processes one request chain starting at `head_idx`, returning the
    /// number of bytes written to device-writable buffers.
    fn process_request(&mut self, memory: &MemoryRegion, head_idx: u16) -> u32 {
        let mut desc_idx = head_idx;
        let mut descs = Vec::new();

        loop {
            let Some(desc) = self.queue.read_desc(memory, desc_idx) else {
                warn!(desc_idx, "virtio-blk: failed to read descriptor");
                return 0;
            };
            descs.push(desc);

            if desc.flags & VIRTQ_DESC_F_NEXT == 0 {
                break;
            }
            desc_idx = desc.next;
        }

        if descs.len() < 2 {
            warn!(count = descs.len(), "virtio-blk: request too short");
            return 0;
        }

        let header_desc = &descs[0];
        let mut header_buf = [0u8; 16];
        if memory.read_at(header_desc.addr, &mut header_buf).is_err() {
            warn!("virtio-blk: failed to read request header");
            return 0;
        }

        let req_type = u32::from_le_bytes([header_buf[0], header_buf[1], header_buf[2], header_buf[3]]);
        let sector = u64::from_le_bytes([
            header_buf[8],
            header_buf[9],
            header_buf[10],
            header_buf[11],
            header_buf[12],
            header_buf[13],
            header_buf[14],
            header_buf[15],
        ]);

        let status_desc = &descs[descs.len() - 1];
        if status_desc.flags & VIRTQ_DESC_F_WRITE == 0 {
            warn!("virtio-blk: status descriptor not writable");
            return 0;
        }

        let data_descs = &descs[1..descs.len() - 1];
        let mut total_written = 0u32;

        let status = match req_type {
            VIRTIO_BLK_T_IN => self.handle_read(memory, sector, data_descs, &mut total_written),
            VIRTIO_BLK_T_OUT => self.handle_write(memory, sector, data_descs),
            VIRTIO_BLK_T_FLUSH => self.handle_flush(),
            other => {
                warn!(req_type = other, "virtio-blk: unsupported request type");
                VIRTIO_BLK_S_UNSUPP
            }
        };

        if memory.write_at(status_desc.addr, &[status]).is_err() {
            warn!("virtio-blk: failed to write status");
        }
        total_written += 1;

        debug!(
            request = self.request_count,
            req_type,
            sector,
            status,
            written = total_written,
            "virtio-blk: processed request"
        );

        total_written
    }

    fn handle_read(&self, memory: &MemoryRegion, mut sector: u64, data_descs: &[VirtqDesc], total_written: &mut u32) -> u8 {
        for desc in data_descs {
            if desc.flags & VIRTQ_DESC_F_WRITE == 0 {
                continue;
            }

            let offset = sector * SECTOR_SIZE;
            let len = desc.len as usize;

            let mut buf = vec![0u8; len];
            if let Err(e) = self.disk.read_at(&mut buf, offset) {
                warn!(offset, error = %e, "virtio-blk: read error");
                return VIRTIO_BLK_S_IOERR;
            }

            if memory.write_at(desc.addr, &buf).is_err() {
                warn!("virtio-blk: failed to write to guest memory");
                return VIRTIO_BLK_S_IOERR;
            }

            *total_written += len as u32;
            sector += (len as u64) / SECTOR_SIZE;
        }

        VIRTIO_BLK_S_OK
    }

    fn handle_write(&self, memory: &MemoryRegion, mut sector: u64, data_descs: &[VirtqDesc]) -> u8 {
        for desc in data_descs {
            if desc.flags & VIRTQ_DESC_F_WRITE != 0 {
                continue;
            }

            let offset = sector * SECTOR_SIZE;
            let len = desc.len as usize;

            let mut buf = vec![0u8; len];
            if memory.read_at(desc.addr, &mut buf).is_err() {
                warn!("virtio-blk: failed to read from guest memory");
                return VIRTIO_BLK_S_IOERR;
            }

            if let Err(e) = self.disk.write_at(&buf, offset) {
                warn!(offset, error = %e, "virtio-blk: write error");
                return VIRTIO_BLK_S_IOERR;
            }

            sector += (len as u64) / SECTOR_SIZE;
        }

        VIRTIO_BLK_S_OK
    }

    fn handle_flush(&self) -> u8 {
        match self.disk.sync_all() {
            Ok(()) => VIRTIO_BLK_S_OK,
            Err(e) => {
                warn!(error = %e, "virtio-blk: flush error");
                VIRTIO_BLK_S_IOERR
            }
        }
    }

    fn read_register(&mut self, offset: u64) -> u32 {
        match offset {
            MMIO_MAGIC_VALUE => VIRTIO_MMIO_MAGIC,
            MMIO_VERSION => VIRTIO_MMIO_VERSION,
            MMIO_DEVICE_ID => VIRTIO_BLK_DEVICE_ID,
            MMIO_VENDOR_ID => VIRTIO_VENDOR_ID,
            MMIO_DEVICE_FEATURES => {
                if self.features_sel == 0 {
                    self.device_features_lo
                } else {
                    self.device_features_hi
                }
            }
            MMIO_QUEUE_NUM_MAX => MAX_QUEUE_SIZE as u32,
            MMIO_QUEUE_READY => u32::from(self.queue.ready),
            MMIO_INTERRUPT_STATUS => self.interrupt_status,
            MMIO_STATUS => self.status,

            // Config space (virtio spec 5.2.4)
            CONFIG_CAPACITY => (self.capacity & 0xFFFF_FFFF) as u32,
            0x104 => (self.capacity >> 32) as u32,
            CONFIG_SIZE_MAX => SIZE_MAX,
            CONFIG_SEG_MAX => SEG_MAX,
            CONFIG_BLK_SIZE => BLK_SIZE,

            _ => {
                if self.request_count < 100 {
                    warn!(offset = format!("{offset:#x}"), "virtio-blk: unknown register read");
                }
                0
            }
        }
    }

    fn write_register(&mut self, offset: u64, value: u32) {
        match offset {
            MMIO_DEVICE_FEATURES_SEL => self.features_sel = value,
            MMIO_DRIVER_FEATURES => {
                if self.features_sel == 0 {
                    self.driver_features_lo = value;
                } else {
                    self.driver_features_hi = value;
                }
            }
            MMIO_DRIVER_FEATURES_SEL => self.features_sel = value,
            MMIO_QUEUE_SEL => self.queue_sel = value,
            MMIO_QUEUE_NUM => {
                if value <= MAX_QUEUE_SIZE as u32 {
                    self.queue.size = value as u16;
                }
            }
            MMIO_QUEUE_READY => {
                self.queue.ready = value != 0;
                if self.queue.ready {
                    debug!(
                        queue = self.queue_sel,
                        desc = format!("{:#x}", self.queue.desc_table),
                        avail = format!("{:#x}", self.queue.avail_ring),
                        used = format!("{:#x}", self.queue.used_ring),
                        "virtio-blk: queue ready"
                    );
                }
            }
            MMIO_QUEUE_NOTIFY => self.process_queue(),
            MMIO_INTERRUPT_ACK => self.interrupt_status &= !value,
            MMIO_STATUS => {
                self.status = value;
                if value == 0 {
                    self.queue = Virtqueue::new();
                    self.interrupt_status = 0;
                    debug!("virtio-blk: device reset");
                } else {
                    let mut flags = Vec::new();
                    if value & STATUS_ACKNOWLEDGE != 0 {
                        flags.push("ACK");
                    }
                    if value & STATUS_DRIVER != 0 {
                        flags.push("DRIVER");
                    }
                    if value & STATUS_FEATURES_OK != 0 {
                        flags.push("FEATURES_OK");
                    }
                    if value & STATUS_DRIVER_OK != 0 {
                        flags.push("DRIVER_OK");
                    }
                    debug!(status = flags.join("|"), raw = format!("{value:#x}"), "virtio-blk: status transition");
                }
            }
            MMIO_QUEUE_DESC_LOW => {
                self.queue.desc_table = (self.queue.desc_table & 0xFFFF_FFFF_0000_0000) | value as u64;
            }
            MMIO_QUEUE_DESC_HIGH => {
                self.queue.desc_table = (self.queue.desc_table & 0x0000_0000_FFFF_FFFF) | ((value as u64) << 32);
            }
            MMIO_QUEUE_DRIVER_LOW => {
                self.queue.avail_ring = (self.queue.avail_ring & 0xFFFF_FFFF_0000_0000) | value as u64;
            }
            MMIO_QUEUE_DRIVER_HIGH => {
                self.queue.avail_ring = (self.queue.avail_ring & 0x0000_0000_FFFF_FFFF) | ((value as u64) << 32);
            }
            MMIO_QUEUE_DEVICE_LOW => {
                self.queue.used_ring = (self.queue.used_ring & 0xFFFF_FFFF_0000_0000) | value as u64;
            }
            MMIO_QUEUE_DEVICE_HIGH => {
                self.queue.used_ring = (self.queue.used_ring & 0x0000_0000_FFFF_FFFF) | ((value as u64) << 32);
            }
            _ => {
                if self.request_count < 100 {
                    warn!(offset = format!("{offset:#x}"), value = format!("{value:#x}"), "virtio-blk: unknown register write");
                }
            }
        }
    }
}

const VIRTIO_BLK_REGIONS: [(u64, u64); 1] = [(VIRTIO_BLK_MMIO_BASE, VIRTIO_BLK_MMIO_SIZE)];

impl Device for VirtioBlk {
    fn device_id(&self) -> &str {
        "virtio-blk0"
    }

    fn mmio_regions(&self) -> &[(u64, u64)] {
        &VIRTIO_BLK_REGIONS
    }

    fn read_mmio(&mut self, _ctx: &mut ExitContext, gpa: u64, data: &mut [u8]) -> DeviceResult<PcAdvance> {
        let offset = (gpa - VIRTIO_BLK_MMIO_BASE) & !0x3;
        let value = self.read_register(offset);
        let bytes = value.to_le_bytes();

        let start = ((gpa - VIRTIO_BLK_MMIO_BASE) & 0x3) as usize;
        let len = data.len().min(4 - start);
        data[..len].copy_from_slice(&bytes[start..start + len]);
        Ok(PcAdvance::Advance)
    }

    fn write_mmio(&mut self, _ctx: &mut ExitContext, gpa: u64, data: &[u8]) -> DeviceResult<PcAdvance> {
        let offset = gpa - VIRTIO_BLK_MMIO_BASE;
        if data.len() != 4 || offset & 0x3 != 0 {
            warn!(offset = format!("{offset:#x}"), len = data.len(), "virtio-blk: non-aligned write");
            return Ok(PcAdvance::Advance);
        }

        let value = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);
        self.write_register(offset, value);
        Ok(PcAdvance::Advance)
    }
}
