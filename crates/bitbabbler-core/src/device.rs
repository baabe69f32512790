//! Device identity and the cached descriptor tree used to locate the
//! MPSSE bulk endpoints on an FTDI device.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

/// How a device was addressed on the command line / config file.
///
/// Identity fields are immutable once parsed; nothing here ever changes
/// after enumeration matches a physical device to one of these.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceId {
    /// A serial string of at least 4 characters containing neither `-` nor `:`.
    Serial(String),
    /// `bus:devnum`, with `bus` optional (`None` matches any bus).
    BusDevnum { bus: Option<u8>, devnum: u8 },
    /// `bus-port[.port]*` physical topology path.
    Path { bus: u8, ports: Vec<u8> },
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("invalid device identity {0:?}")]
pub struct ParseDeviceIdError(String);

impl FromStr for DeviceId {
    type Err = ParseDeviceIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some((bus, rest)) = s.split_once('-') {
            let bus: u8 = bus.parse().map_err(|_| ParseDeviceIdError(s.to_owned()))?;
            let ports = rest
                .split('.')
                .map(|p| p.parse::<u8>())
                .collect::<Result<Vec<_>, _>>()
                .map_err(|_| ParseDeviceIdError(s.to_owned()))?;
            if ports.is_empty() {
                return Err(ParseDeviceIdError(s.to_owned()));
            }
            return Ok(DeviceId::Path { bus, ports });
        }

        if let Some((bus, devnum)) = s.split_once(':') {
            let devnum: u8 = devnum.parse().map_err(|_| ParseDeviceIdError(s.to_owned()))?;
            let bus = if bus.is_empty() {
                None
            } else {
                Some(bus.parse::<u8>().map_err(|_| ParseDeviceIdError(s.to_owned()))?)
            };
            return Ok(DeviceId::BusDevnum { bus, devnum });
        }

        if s.len() >= 4 {
            return Ok(DeviceId::Serial(s.to_owned()));
        }

        Err(ParseDeviceIdError(s.to_owned()))
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceId::Serial(s) => write!(f, "{s}"),
            DeviceId::BusDevnum { bus: Some(b), devnum } => write!(f, "{b}:{devnum}"),
            DeviceId::BusDevnum { bus: None, devnum } => write!(f, ":{devnum}"),
            DeviceId::Path { bus, ports } => {
                write!(f, "{bus}")?;
                for p in ports {
                    write!(f, "-{p}")?;
                }
                Ok(())
            }
        }
    }
}

/// Direction of a bulk endpoint, named from the host's perspective.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Endpoint 0: device -> host.
    In,
    /// Endpoint 1: host -> device.
    Out,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Endpoint {
    pub address: u8,
    pub max_packet_size: u16,
    pub direction: Direction,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AltSetting {
    pub endpoints: Vec<Endpoint>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Interface {
    pub alt_settings: Vec<AltSetting>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Configuration {
    pub value: u8,
    pub interfaces: Vec<Interface>,
}

/// The cached vendor/product/config/interface/alt-setting/endpoint tree
/// for one physical device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceDescriptor {
    pub vendor_id: u16,
    pub product_id: u16,
    pub configurations: Vec<Configuration>,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DescriptorError {
    #[error("configuration {0} not present")]
    NoSuchConfiguration(u8),
    #[error("interface {0} not present")]
    NoSuchInterface(u8),
    #[error("alt-setting {0} not present")]
    NoSuchAltSetting(u8),
    #[error("configuration {config}, interface {interface}, alt-setting {alt} has {found} endpoints, expecting 2")]
    WrongEndpointCount { config: u8, interface: u8, alt: u8, found: usize },
    #[error("endpoint[0] direction is not IN")]
    Endpoint0NotIn,
    #[error("endpoint[1] direction is not OUT")]
    Endpoint1NotOut,
}

impl DeviceDescriptor {
    /// Select the bulk IN/OUT endpoint pair used for MPSSE transfers, by
    /// *index* within the alt-setting (not by endpoint address).
    ///
    /// Invariant: exactly two bulk endpoints with opposite directions;
    /// endpoint index 0 is device->host, index 1 is host->device.
    pub fn mpsse_endpoints(
        &self,
        config: u8,
        interface: u8,
        alt_setting: u8,
    ) -> Result<(Endpoint, Endpoint), DescriptorError> {
        let cfg = self
            .configurations
            .iter()
            .find(|c| c.value == config)
            .ok_or(DescriptorError::NoSuchConfiguration(config))?;
        let iface = cfg
            .interfaces
            .get(interface as usize)
            .ok_or(DescriptorError::NoSuchInterface(interface))?;
        let alt = iface
            .alt_settings
            .get(alt_setting as usize)
            .ok_or(DescriptorError::NoSuchAltSetting(alt_setting))?;

        if alt.endpoints.len() != 2 {
            return Err(DescriptorError::WrongEndpointCount {
                config,
                interface,
                alt: alt_setting,
                found: alt.endpoints.len(),
            });
        }

        let ep_in = alt.endpoints[0];
        let ep_out = alt.endpoints[1];

        if ep_in.direction != Direction::In {
            return Err(DescriptorError::Endpoint0NotIn);
        }
        if ep_out.direction != Direction::Out {
            return Err(DescriptorError::Endpoint1NotOut);
        }

        Ok((ep_in, ep_out))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_serial() {
        assert_eq!(
            "AB1234CD".parse::<DeviceId>().unwrap(),
            DeviceId::Serial("AB1234CD".to_owned())
        );
    }

    #[test]
    fn rejects_short_serial() {
        assert!("abc".parse::<DeviceId>().is_err());
    }

    #[test]
    fn parses_bus_devnum() {
        assert_eq!(
            "1:42".parse::<DeviceId>().unwrap(),
            DeviceId::BusDevnum { bus: Some(1), devnum: 42 }
        );
        assert_eq!(
            ":42".parse::<DeviceId>().unwrap(),
            DeviceId::BusDevnum { bus: None, devnum: 42 }
        );
    }

    #[test]
    fn parses_physical_path() {
        assert_eq!(
            "2-1.3".parse::<DeviceId>().unwrap(),
            DeviceId::Path { bus: 2, ports: vec![1, 3] }
        );
    }

    #[test]
    fn descriptor_rejects_wrong_endpoint_count() {
        let desc = DeviceDescriptor {
            vendor_id: 0x0403,
            product_id: 0x6014,
            configurations: vec![Configuration {
                value: 1,
                interfaces: vec![Interface {
                    alt_settings: vec![AltSetting { endpoints: vec![] }],
                }],
            }],
        };
        assert!(matches!(
            desc.mpsse_endpoints(1, 0, 0),
            Err(DescriptorError::WrongEndpointCount { .. })
        ));
    }

    #[test]
    fn descriptor_selects_endpoints_by_index() {
        let desc = DeviceDescriptor {
            vendor_id: 0x0403,
            product_id: 0x6014,
            configurations: vec![Configuration {
                value: 1,
                interfaces: vec![Interface {
                    alt_settings: vec![AltSetting {
                        endpoints: vec![
                            Endpoint { address: 0x81, max_packet_size: 64, direction: Direction::In },
                            Endpoint { address: 0x02, max_packet_size: 64, direction: Direction::Out },
                        ],
                    }],
                }],
            }],
        };
        let (ep_in, ep_out) = desc.mpsse_endpoints(1, 0, 0).unwrap();
        assert_eq!(ep_in.address, 0x81);
        assert_eq!(ep_out.address, 0x02);
    }
}
