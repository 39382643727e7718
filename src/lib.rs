//! Carbon - a user-space virtual-machine monitor core.
//!
//! Boots a single-vCPU guest (x86_64 or ARM64) inside a KVM partition,
//! dispatches its port-I/O and MMIO exits to a small chipset of
//! in-process devices, and can capture/restore the whole VM as a binary
//! snapshot. See `crate::vm::VirtualMachine` for the main entry point and
//! `crate::hypervisor::VmHypervisor` for how to build one.

pub mod arch;
pub mod chipset;
pub mod config;
pub mod device;
pub mod devices;
pub mod error;
pub mod exit;
pub mod hypervisor;
pub mod memory;
pub mod platform;
pub mod register;
pub mod snapshot;
pub mod timeslice;
pub mod vcpu;
pub mod vm;

pub use error::{Result, VmmError};
