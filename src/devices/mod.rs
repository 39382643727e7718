//! Example device emulation attached to a [`crate::vm::VirtualMachine`].
//!
//! These are ordinary [`crate::device::Device`] implementors; nothing in
//! the core (`crate::vm`, `crate::vcpu`, `crate::chipset`) knows about any
//! of them by name. They exist to give the demonstration binary and the
//! integration tests something concrete to attach.

mod cmos;
mod serial;
pub mod timeslice_marker;
pub mod virtio;

pub use cmos::{Cmos, CMOS_PORT_DATA, CMOS_PORT_INDEX};
pub use serial::{Serial, SERIAL_PORTS};
pub use timeslice_marker::TimesliceMarkerDevice;
pub use virtio::blk::VirtioBlk;
