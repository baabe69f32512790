//! USB enumeration: out of `bitbabbler-core`'s scope by design, so this
//! is where `rusb::Device`s get matched against configured
//! [`bitbabbler_core::DeviceId`]s and turned into `FtdiDriver`s.

use bitbabbler_core::device::{AltSetting, Configuration, DeviceDescriptor, Direction, Endpoint, Interface};
use bitbabbler_core::usb::rusb_backend::RusbTransport;
use bitbabbler_core::{DeviceId, FtdiDriver};
use rusb::UsbContext;
use thiserror::Error;

/// FTDI's USB-IF vendor id. BitBabbler units ship under FTDI's FT232H
/// product id; a from-scratch FTDI device (blank EEPROM) enumerates under
/// FTDI's own default product id instead.
const FTDI_VENDOR_ID: u16 = 0x0403;
const FT232H_PRODUCT_ID: u16 = 0x6014;

const MPSSE_CONFIG: u8 = 1;
const MPSSE_INTERFACE: u8 = 0;
const MPSSE_ALT_SETTING: u8 = 0;

#[derive(Debug, Error)]
pub enum EnumerationError {
    #[error("libusb error: {0}")]
    Usb(#[from] rusb::Error),
    #[error("device {0} not found")]
    NotFound(DeviceId),
    #[error("device {0} descriptor mismatch: {1}")]
    BadDescriptor(DeviceId, #[source] bitbabbler_core::device::DescriptorError),
    #[error("initializing device driver: {0}")]
    Init(#[source] bitbabbler_core::ftdi::FtdiError),
}

fn matches(device: &rusb::Device<rusb::Context>, id: &DeviceId) -> bool {
    match id {
        DeviceId::BusDevnum { bus, devnum } => {
            bus.map(|b| b == device.bus_number()).unwrap_or(true) && *devnum == device.address()
        }
        DeviceId::Path { bus, ports } => device.bus_number() == *bus && device.port_numbers().unwrap_or_default() == *ports,
        DeviceId::Serial(serial) => {
            let Ok(handle) = device.open() else { return false };
            let Ok(desc) = device.device_descriptor() else { return false };
            let Some(idx) = desc.serial_number_string_index() else { return false };
            handle.read_string_descriptor_ascii(idx).map(|s| &s == serial).unwrap_or(false)
        }
    }
}

fn build_descriptor(device: &rusb::Device<rusb::Context>) -> Result<DeviceDescriptor, rusb::Error> {
    let desc = device.device_descriptor()?;
    let mut configurations = Vec::new();
    for cfg_idx in 0..desc.num_configurations() {
        let cfg = device.config_descriptor(cfg_idx)?;
        let mut interfaces = Vec::new();
        for iface in cfg.interfaces() {
            let mut alt_settings = Vec::new();
            for alt in iface.descriptors() {
                let endpoints = alt
                    .endpoint_descriptors()
                    .map(|ep| Endpoint {
                        address: ep.address(),
                        max_packet_size: ep.max_packet_size(),
                        direction: match ep.direction() {
                            rusb::Direction::In => Direction::In,
                            rusb::Direction::Out => Direction::Out,
                        },
                    })
                    .collect();
                alt_settings.push(AltSetting { endpoints });
            }
            interfaces.push(Interface { alt_settings });
        }
        configurations.push(Configuration { value: cfg.number(), interfaces });
    }
    Ok(DeviceDescriptor { vendor_id: desc.vendor_id(), product_id: desc.product_id(), configurations })
}

/// Find the first FTDI-class device matching `id`, build its driver and
/// claim ownership of the MPSSE interface/endpoint pair.
pub fn open_driver(context: &rusb::Context, id: &DeviceId, latency_ms: u8) -> Result<FtdiDriver, EnumerationError> {
    let devices = context.devices()?;
    let device = devices
        .iter()
        .filter(|d| {
            d.device_descriptor()
                .map(|desc| desc.vendor_id() == FTDI_VENDOR_ID)
                .unwrap_or(false)
        })
        .find(|d| matches(d, id))
        .ok_or_else(|| EnumerationError::NotFound(id.clone()))?;

    let descriptor = build_descriptor(&device).map_err(EnumerationError::Usb)?;
    let (ep_in, ep_out) = descriptor
        .mpsse_endpoints(MPSSE_CONFIG, MPSSE_INTERFACE, MPSSE_ALT_SETTING)
        .map_err(|e| EnumerationError::BadDescriptor(id.clone(), e))?;

    let transport = RusbTransport::new(
        device,
        MPSSE_CONFIG,
        MPSSE_INTERFACE,
        MPSSE_ALT_SETTING,
        ep_in.address,
        ep_out.address,
        ep_in.max_packet_size,
    );

    FtdiDriver::new(Box::new(transport), ep_in.address, ep_out.address, ep_in.max_packet_size, latency_ms)
        .map_err(EnumerationError::Init)
}

/// For completeness-default setups with no explicit device list: match any
/// FTDI device carrying the FT232H product id.
pub fn is_default_bitbabbler_product(product_id: u16) -> bool {
    product_id == FT232H_PRODUCT_ID
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_product_id_matches_ft232h() {
        assert!(is_default_bitbabbler_product(0x6014));
        assert!(!is_default_bitbabbler_product(0x0001));
    }
}
