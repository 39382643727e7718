//! Crate-wide error taxonomy.
//!
//! Carbon funnels every failure mode — platform bring-up, dispatch misses,
//! snapshot validation, device errors — through one `thiserror` enum rather
//! than a cluster of per-module error types. This mirrors the rest of the
//! VMM's "one flat error enum" shape (see the old `KvmError`, now a `#[source]`
//! of `PartitionSetup`/`RegisterAccess`) instead of introducing a new style.

use thiserror::Error;

use crate::register::Register;

/// Errors surfaced by the virtual-machine runtime, chipset, and snapshot engine.
#[derive(Error, Debug)]
pub enum VmmError {
    /// The platform capability probe reports no virtualization support.
    #[error("hypervisor unavailable on this host")]
    HypervisorUnavailable,

    /// A platform call during VM bring-up (partition create/setup, memory
    /// mapping, vCPU creation) failed.
    #[error("partition setup failed: {0}")]
    PartitionSetup(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// Two devices claimed overlapping ports or MMIO ranges and the regions
    /// were not exact duplicates.
    #[error("device region conflict: {0}")]
    RegionConflict(String),

    /// A device was registered after the chipset had already been built.
    #[error("chipset already frozen, cannot register device {0:?}")]
    ChipsetFrozen(String),

    /// A register name has no mapping to the host platform's native
    /// register identifier.
    #[error("register {0:?} is not supported by this platform")]
    UnsupportedRegister(Register),

    /// A register read/write requested a `RegisterValue` variant the
    /// register does not support.
    #[error("register {0:?} does not support the requested value type")]
    RegisterValueTypeMismatch(Register),

    /// A memory access fell outside the guest RAM region.
    #[error("address {gpa:#x} (len {len}) is out of bounds for this region")]
    AddressOutOfBounds { gpa: u64, len: usize },

    /// No device claims the given I/O port.
    #[error("no device claims I/O port {port:#x}")]
    UnhandledPio { port: u16 },

    /// No device claims the given guest physical address.
    #[error("no device claims MMIO address {gpa:#x}")]
    UnhandledMmio { gpa: u64 },

    /// A PIO or MMIO access arrived with a width the chipset does not
    /// support (PIO: 1/2/4 bytes; MMIO: 1/2/4/8 bytes). Rejected before
    /// dispatch, so no device ever observes it.
    #[error("unsupported access width: {len} bytes")]
    InvalidAccessWidth { len: usize },

    /// An ARM64 data-abort syndrome could not be decoded (ISV=0, or an
    /// unsupported SAS/SRT encoding).
    #[error("undecodable data abort: {0}")]
    UndecodableDataAbort(String),

    /// An ARM64 reset exit carried a sub-type other than power-off/reboot.
    #[error("unsupported reset type: {0}")]
    UnsupportedResetType(u32),

    /// The platform reported an exit reason the run loop does not classify.
    #[error("unsupported exit reason: {0}")]
    UnsupportedExit(String),

    /// Clean guest shutdown (HLT on x86_64, PowerOff reset on ARM64).
    ///
    /// This is a normal termination signal, not a fault; it unwinds the
    /// run loop the same way an error would.
    #[error("guest halted")]
    VmHalted,

    /// The guest issued a reboot request (ARM64 reset with sub-type Reboot).
    #[error("guest requested reboot")]
    GuestRequestedReboot,

    /// The platform reported a `Canceled` exit (a concurrent call to
    /// `VcpuExecutor::cancel` interrupted a blocked guest entry).
    #[error("run was canceled for an unknown reason")]
    CanceledWithoutReason,

    /// The guest raised an exception the platform cannot recover from.
    #[error("unrecoverable guest fault")]
    GuestFault,

    /// A snapshot's architecture tag does not match the VM being restored into.
    #[error("snapshot architecture does not match this VM")]
    ArchitectureMismatch,

    /// A snapshot's memory section length does not match the VM's current
    /// memory size.
    #[error("snapshot memory size does not match VM memory size")]
    SnapshotSizeMismatch,

    /// Snapshot restore referenced a device id the VM does not have.
    #[error("snapshot references unknown device {0:?}")]
    SnapshotDeviceMissing(String),

    /// The snapshot file's magic or version did not match what this build
    /// of the codec produces.
    #[error("malformed snapshot: {0}")]
    MalformedSnapshot(String),

    /// A device handler returned an error while servicing a PIO/MMIO access.
    #[error("device error: {0}")]
    DeviceError(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// I/O error reading or writing a snapshot file.
    #[error("snapshot I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, VmmError>;
