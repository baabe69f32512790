//! Device-facing engine: MPSSE wire protocol, online QA, and the mixing
//! pool that downstream consumers draw entropy from.
//!
//! Everything in this crate is reachable without a real USB device or a
//! privileged host: [`usb::UsbTransport`] is the one external seam, and
//! a fake implementation of it lives behind `#[cfg(test)]` in [`usb`].

pub mod device;
pub mod error;
pub mod fold;
pub mod ftdi;
pub mod group;
pub mod health;
pub mod pool;
pub mod usb;
pub mod worker;

pub use device::{DeviceDescriptor, DeviceId};
pub use error::CoreError;
pub use ftdi::FtdiDriver;
pub use group::Group;
pub use health::HealthMonitor;
pub use pool::Pool;
pub use usb::{UsbFault, UsbTransport};
pub use worker::{SharedHealthMonitor, Worker, WorkerConfig, WorkerHandle};
