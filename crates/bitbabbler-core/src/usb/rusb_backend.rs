//! [`UsbTransport`] implementation backed by the `rusb` crate (libusb
//! bindings), the direct counterpart of the original C++ driver's libusb
//! usage.

use std::time::Duration;

use rusb::{Direction, Recipient, RequestType, UsbContext};

use super::{FatalKind, TransientKind, UsbFault, UsbTransport};

pub struct RusbTransport<T: UsbContext> {
    device: rusb::Device<T>,
    handle: Option<rusb::DeviceHandle<T>>,
    config: u8,
    interface: u8,
    alt_setting: u8,
    ep_in: u8,
    ep_out: u8,
    max_packet: u16,
}

impl<T: UsbContext> RusbTransport<T> {
    pub fn new(
        device: rusb::Device<T>,
        config: u8,
        interface: u8,
        alt_setting: u8,
        ep_in: u8,
        ep_out: u8,
        max_packet: u16,
    ) -> Self {
        Self { device, handle: None, config, interface, alt_setting, ep_in, ep_out, max_packet }
    }

    fn handle(&mut self) -> Result<&mut rusb::DeviceHandle<T>, UsbFault> {
        self.handle.as_mut().ok_or(UsbFault::Fatal(FatalKind::Other("not claimed".into())))
    }
}

fn map_err(e: rusb::Error) -> UsbFault {
    match e {
        rusb::Error::Pipe => UsbFault::Transient(TransientKind::Pipe),
        rusb::Error::Timeout => UsbFault::Transient(TransientKind::Timeout),
        rusb::Error::NoDevice | rusb::Error::NotFound => UsbFault::Fatal(FatalKind::NotFound),
        rusb::Error::Access => UsbFault::Fatal(FatalKind::Permission),
        other => {
            tracing::debug!(error = %other, "unmapped libusb error, treating as transient");
            UsbFault::Transient(TransientKind::Other)
        }
    }
}

impl<T: UsbContext> UsbTransport for RusbTransport<T> {
    fn is_claimed(&self) -> bool {
        self.handle.is_some()
    }

    fn claim(&mut self) -> Result<bool, UsbFault> {
        if self.handle.is_some() {
            return Ok(false);
        }

        let mut handle = self.device.open().map_err(map_err)?;
        handle.set_active_configuration(self.config).map_err(map_err)?;
        handle.claim_interface(self.interface).map_err(map_err)?;
        if self.alt_setting != 0 {
            handle.set_alternate_setting(self.interface, self.alt_setting).map_err(map_err)?;
        }
        self.handle = Some(handle);
        Ok(true)
    }

    fn release(&mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = handle.release_interface(self.interface);
        }
    }

    fn control_transfer_out(
        &mut self,
        request: u8,
        value: u16,
        index: u16,
        timeout: Duration,
    ) -> Result<(), UsbFault> {
        let handle = self.handle()?;
        let req_type = rusb::request_type(Direction::Out, RequestType::Vendor, Recipient::Device);
        handle
            .write_control(req_type, request, value, index, &[], timeout)
            .map_err(map_err)?;
        Ok(())
    }

    fn control_transfer_in(
        &mut self,
        request: u8,
        value: u16,
        index: u16,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, UsbFault> {
        let handle = self.handle()?;
        let req_type = rusb::request_type(Direction::In, RequestType::Vendor, Recipient::Device);
        handle.read_control(req_type, request, value, index, buf, timeout).map_err(map_err)
    }

    fn bulk_write(&mut self, endpoint: u8, data: &[u8], timeout: Duration) -> Result<usize, UsbFault> {
        debug_assert_eq!(endpoint, self.ep_out);
        let handle = self.handle()?;
        handle.write_bulk(endpoint, data, timeout).map_err(map_err)
    }

    fn bulk_read(&mut self, endpoint: u8, buf: &mut [u8], timeout: Duration) -> Result<usize, UsbFault> {
        debug_assert_eq!(endpoint, self.ep_in);
        let handle = self.handle()?;
        handle.read_bulk(endpoint, buf, timeout).map_err(map_err)
    }

    fn clear_halt(&mut self, endpoint: u8) -> Result<(), UsbFault> {
        let handle = self.handle()?;
        handle.clear_halt(endpoint).map_err(map_err)
    }

    fn soft_reset(&mut self) -> Result<(), UsbFault> {
        if let Some(handle) = self.handle.as_mut() {
            handle.reset().map_err(map_err)?;
        } else {
            self.device.open().map_err(map_err)?.reset().map_err(map_err)?;
        }
        Ok(())
    }

    fn max_packet_size(&self) -> u16 {
        self.max_packet
    }
}
