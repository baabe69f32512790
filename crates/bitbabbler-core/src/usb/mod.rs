//! USB host-side abstraction.
//!
//! Enumeration, bulk transfer and hotplug are explicitly out of the
//! engine's scope; this module defines the narrow [`UsbTransport`] trait
//! the FTDI driver consumes, so the wire protocol and QA pipeline can be
//! exercised against a fake transport in tests without real hardware.

#[cfg(feature = "rusb")]
pub mod rusb_backend;

use std::fmt;
use std::time::Duration;

use thiserror::Error;

/// Errors the driver can recover from by reclaiming or soft-resetting the
/// device and looping; never terminates the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransientKind {
    /// `LIBUSB_ERROR_PIPE`: a stalled endpoint.
    Pipe,
    /// `LIBUSB_ERROR_TIMEOUT`.
    Timeout,
    /// Any other transfer error not known to be fatal.
    Other,
}

/// Errors that mean the device is gone or inaccessible; the worker that
/// owns the session exits and the source is removed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FatalKind {
    NotFound,
    Permission,
    Other(String),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum UsbFault {
    #[error("transient USB error: {0:?}")]
    Transient(TransientKind),
    #[error("fatal USB error: {0:?}")]
    Fatal(FatalKind),
}

impl UsbFault {
    pub fn is_fatal(&self) -> bool {
        matches!(self, UsbFault::Fatal(_))
    }
}

/// Bulk endpoint direction, from the host's perspective.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dir {
    In,
    Out,
}

impl fmt::Display for Dir {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dir::In => write!(f, "IN"),
            Dir::Out => write!(f, "OUT"),
        }
    }
}

/// The minimal operation set the FTDI driver needs from a USB host-side
/// library: claim/release, control transfers (for the FTDI vendor
/// requests) and bulk transfers. One device handle, one owner.
pub trait UsbTransport: Send {
    fn is_claimed(&self) -> bool;

    /// Returns `true` if this call newly claimed the interface, `false` if
    /// it was already claimed. Never reference counted: the first
    /// `release` drops the claim no matter how many times `claim` was
    /// called.
    fn claim(&mut self) -> Result<bool, UsbFault>;

    fn release(&mut self);

    fn control_transfer_out(
        &mut self,
        request: u8,
        value: u16,
        index: u16,
        timeout: Duration,
    ) -> Result<(), UsbFault>;

    fn control_transfer_in(
        &mut self,
        request: u8,
        value: u16,
        index: u16,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, UsbFault>;

    fn bulk_write(&mut self, endpoint: u8, data: &[u8], timeout: Duration) -> Result<usize, UsbFault>;

    fn bulk_read(&mut self, endpoint: u8, buf: &mut [u8], timeout: Duration) -> Result<usize, UsbFault>;

    fn clear_halt(&mut self, endpoint: u8) -> Result<(), UsbFault>;

    /// Soft reset: on `PIPE` the caller releases and re-claims; on
    /// `TIMEOUT`/`OTHER` the caller soft-resets, releases, then retries
    /// the claim.
    fn soft_reset(&mut self) -> Result<(), UsbFault>;

    fn max_packet_size(&self) -> u16;
}

/// A fake transport for exercising the FTDI driver and worker loop
/// without real hardware; records every call for assertions.
#[cfg(test)]
pub mod fake {
    use super::*;
    use std::collections::VecDeque;

    pub struct FakeTransport {
        pub claimed: bool,
        pub max_packet: u16,
        /// Queue of responses to return from successive `bulk_read` calls.
        pub read_queue: VecDeque<Result<Vec<u8>, UsbFault>>,
        pub writes: Vec<Vec<u8>>,
        pub control_out: Vec<(u8, u16, u16)>,
        pub soft_resets: usize,
    }

    impl FakeTransport {
        pub fn new(max_packet: u16) -> Self {
            Self {
                claimed: false,
                max_packet,
                read_queue: VecDeque::new(),
                writes: Vec::new(),
                control_out: Vec::new(),
                soft_resets: 0,
            }
        }

        pub fn push_read(&mut self, data: Vec<u8>) {
            self.read_queue.push_back(Ok(data));
        }
    }

    impl UsbTransport for FakeTransport {
        fn is_claimed(&self) -> bool {
            self.claimed
        }

        fn claim(&mut self) -> Result<bool, UsbFault> {
            let was = self.claimed;
            self.claimed = true;
            Ok(!was)
        }

        fn release(&mut self) {
            self.claimed = false;
        }

        fn control_transfer_out(
            &mut self,
            request: u8,
            value: u16,
            index: u16,
            _timeout: Duration,
        ) -> Result<(), UsbFault> {
            self.control_out.push((request, value, index));
            Ok(())
        }

        fn control_transfer_in(
            &mut self,
            _request: u8,
            _value: u16,
            _index: u16,
            buf: &mut [u8],
            _timeout: Duration,
        ) -> Result<usize, UsbFault> {
            if buf.len() >= 2 {
                buf[0] = 0;
                buf[1] = 0;
            }
            Ok(buf.len().min(2))
        }

        fn bulk_write(&mut self, _endpoint: u8, data: &[u8], _timeout: Duration) -> Result<usize, UsbFault> {
            self.writes.push(data.to_vec());
            Ok(data.len())
        }

        fn bulk_read(&mut self, _endpoint: u8, buf: &mut [u8], _timeout: Duration) -> Result<usize, UsbFault> {
            match self.read_queue.pop_front() {
                Some(Ok(data)) => {
                    let n = data.len().min(buf.len());
                    buf[..n].copy_from_slice(&data[..n]);
                    Ok(n)
                }
                Some(Err(e)) => Err(e),
                None => Ok(0),
            }
        }

        fn clear_halt(&mut self, _endpoint: u8) -> Result<(), UsbFault> {
            Ok(())
        }

        fn soft_reset(&mut self) -> Result<(), UsbFault> {
            self.soft_resets += 1;
            Ok(())
        }

        fn max_packet_size(&self) -> u16 {
            self.max_packet
        }
    }
}
