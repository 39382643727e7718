//! The narrow interface the core consumes from a host virtualization
//! platform.
//!
//! Only one concrete backend ships in this tree ([`kvm`]), but the core
//! (`crate::vm`, `crate::vcpu`, `crate::arch`) is written against this
//! trait boundary rather than against `kvm-ioctls` directly, so it never
//! names an ioctl or a `kvm_bindings` type outside this module.

pub mod kvm;

use std::collections::HashMap;

use crate::error::Result;
use crate::register::{Register, RegisterValue};

/// Guest CPU architecture a partition was created for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Architecture {
    X86_64,
    Arm64,
}

/// Classified reason a vCPU returned control to the VMM.
///
/// This enum deliberately mingles x86_64 and ARM64 concepts: each backend
/// only ever produces the subset that matches the partition's
/// architecture, and the corresponding `crate::arch` module only matches
/// the variants relevant to it.
#[derive(Debug)]
pub enum PlatformExit {
    /// x86_64 `HLT`.
    Halt,
    /// A decoded port I/O or MMIO access was resolved inline by the
    /// [`ExitHandler`] passed to [`Vcpu::run`] before this exit was
    /// returned; there is nothing left for the caller to dispatch. This
    /// mirrors the teacher's `VcpuExit::Io` sentinel: the backend already
    /// exchanged data with the handler while the guest-facing buffer was
    /// still live, so splitting read/write direction out into an owned
    /// copy (and losing the write-back path) is unnecessary.
    IoHandled,
    /// x86_64 `CPUID` exit; the platform has already computed the default
    /// result and expects it copied into RAX/RBX/RCX/RDX.
    Cpuid,
    /// x86_64 MSR read or write, governed by `crate::config::MsrPolicy`.
    MsrAccess { index: u32, is_write: bool, value: u64 },
    /// x86_64 local APIC end-of-interrupt for `vector`.
    ApicEoi { vector: u8 },
    /// ARM64 data abort to an address not backed by RAM. `esr` is the raw
    /// exception syndrome register value; `fault_gpa` is the faulting
    /// guest physical address.
    UnmappedGpa { esr: u64, fault_gpa: u64 },
    /// ARM64 `PSCI` reset request, sub-type `reset_type` (platform-defined
    /// encoding; 0=power off, 1=reboot by convention of the reference
    /// backend).
    Reset { reset_type: u32 },
    /// The run call was canceled via [`Vcpu::cancel`].
    Canceled,
    /// The platform could not enter the guest at all.
    FailEntry { reason: u64 },
    /// An unrecoverable internal error reported by the platform.
    InternalError,
    /// Any other exit reason, carrying a short platform-specific label.
    Unknown(&'static str),
}

/// Resolves a port I/O or MMIO access while the platform backend's
/// exit-specific buffer is still borrowed.
///
/// The KVM backend's `IoIn`/`MmioRead` exits carry `data: &mut [u8]`
/// slices that reference kernel-shared memory valid only for the
/// lifetime of that exit value; a read result must be written into
/// `data` before the backend lets that value drop. Passing a handler
/// into [`Vcpu::run`] (rather than returning an owned exit and
/// dispatching afterward) keeps that borrow alive across the callback,
/// matching the teacher's `run_with_io<H: IoHandler + MmioHandler>`.
pub trait ExitHandler {
    fn handle_pio(&mut self, port: u16, is_write: bool, data: &mut [u8]) -> Result<()>;
    fn handle_mmio(&mut self, gpa: u64, is_write: bool, data: &mut [u8]) -> Result<()>;
}

/// One virtual processor, as exposed by a platform backend.
pub trait Vcpu {
    /// Bulk register read. The caller pre-populates `out` with the
    /// registers it wants, tagged with a placeholder value of the
    /// expected type; the implementation fills each entry in place.
    fn get_registers(&self, out: &mut HashMap<Register, RegisterValue>) -> Result<()>;

    /// Bulk register write.
    fn set_registers(&self, values: &HashMap<Register, RegisterValue>) -> Result<()>;

    /// Blocks until the guest exits for any reason. Port I/O and MMIO
    /// accesses are resolved inline through `handler` and reported back
    /// as `PlatformExit::IoHandled`; every other exit reason is returned
    /// for the caller to dispatch.
    ///
    /// Takes `&self`, not `&mut self`: the underlying ioctl is safe to call
    /// from any thread holding a reference to the same vCPU fd, which is
    /// exactly what lets [`Vcpu::cancel`] interrupt a concurrently blocked
    /// `run` from a second thread without synchronizing on the same
    /// exclusive borrow.
    fn run(&self, handler: &mut dyn ExitHandler) -> Result<PlatformExit>;

    /// Requests that a concurrently blocked [`Vcpu::run`] return with
    /// `PlatformExit::Canceled` as soon as possible. Safe to call from
    /// any thread.
    fn cancel(&self);

    /// ARM64 only: raises `intid` at the vCPU's redistributor. Backends
    /// for architectures without a GIC return `Ok(())` without effect.
    fn request_interrupt(&self, _intid: u32) -> Result<()> {
        Ok(())
    }
}

/// One guest partition, as exposed by a platform backend.
pub trait Partition {
    /// `Send + Sync + 'static` so a vCPU can be moved onto its own
    /// [`crate::vcpu::VcpuExecutor`] thread and shared, via `Arc`, with the
    /// thread that owns the `Partition`.
    type Vcpu: Vcpu + Send + Sync + 'static;

    /// Maps `size` bytes of host memory at `host_addr` into the guest's
    /// physical address space at `gpa`, with read/write/execute
    /// permission for the guest.
    fn map_memory(&mut self, gpa: u64, host_addr: u64, size: u64) -> Result<()>;

    /// Creates vCPU `id` (always `0` under the single-vCPU non-goal).
    fn create_vcpu(&mut self, id: u32) -> Result<Self::Vcpu>;
}

/// Process-wide entry point: probes host capability and creates
/// partitions.
pub trait Hypervisor {
    type Partition: Partition;

    /// Fails with `HypervisorUnavailable` if the host reports no
    /// virtualization support.
    fn probe_capability() -> Result<Architecture>;

    /// Creates a new partition for the given architecture.
    fn create_partition(arch: Architecture) -> Result<Self::Partition>;
}
