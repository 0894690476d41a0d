use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use serde::Deserialize;
use tracing::{debug, warn};

use crate::{
    DeviceError,
    usbmuxd::{Connection, UsbmuxdDevice},
};

fn malformed(what: &str) -> DeviceError {
    DeviceError::ProtocolError(format!("usbmuxd device record: {what}"))
}

fn ipv6_at(addr: &[u8], start: usize) -> Ipv6Addr {
    let mut segments = [0u16; 8];
    for (i, seg) in segments.iter_mut().enumerate() {
        let at = start + i * 2;
        *seg = u16::from_be_bytes([addr[at], addr[at + 1]]);
    }
    Ipv6Addr::from(segments)
}

#[derive(Deserialize)]
pub struct ListDevicesResponse {
    #[serde(rename = "DeviceList")]
    pub device_list: Vec<DeviceListResponse>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct DeviceListResponse {
    #[serde(rename = "DeviceID")]
    pub device_id: u32,
    #[serde(rename = "Properties")]
    pub properties: DevicePropertiesResponse,
}

#[derive(Clone, Debug, Deserialize)]
pub struct DevicePropertiesResponse {
    #[serde(rename = "ConnectionType")]
    pub connection_type: String,
    #[serde(rename = "NetworkAddress")]
    pub network_address: Option<plist::Data>,
    #[serde(rename = "SerialNumber")]
    pub serial_number: String,
}

impl DeviceListResponse {
    pub fn into_usbmuxd_dev(self) -> Result<UsbmuxdDevice, DeviceError> {
        self.try_into()
    }
}

/// Decodes the `sockaddr` bytes usbmuxd reports for network devices
fn network_connection(addr: &[u8]) -> Result<Connection, DeviceError> {
    if addr.len() < 8 {
        warn!("Device address bytes len < 8");
        return Err(malformed("short network address"));
    }
    let connection = match (addr[0], addr[1]) {
        (0x02, _) => Connection::Network(IpAddr::V4(Ipv4Addr::new(
            addr[4], addr[5], addr[6], addr[7],
        ))),
        (0x1E, _) if addr.len() >= 24 => Connection::Network(IpAddr::V6(ipv6_at(addr, 8))),
        (0x1C, 0x1E) if addr.len() >= 28 => Connection::Network(IpAddr::V6(ipv6_at(addr, 8))),
        (0x1E, _) | (0x1C, 0x1E) => {
            warn!("IPv6 address data too short (len {})", addr.len());
            return Err(malformed("short IPv6 address"));
        }
        (family, _) => {
            warn!("Unknown IP address family: {family:02X}");
            Connection::Unknown(format!("Network {family:02X}"))
        }
    };
    Ok(connection)
}

impl TryFrom<DeviceListResponse> for UsbmuxdDevice {
    type Error = DeviceError;

    fn try_from(dev: DeviceListResponse) -> Result<Self, Self::Error> {
        let connection_type = match dev.properties.connection_type.as_str() {
            "USB" => Connection::Usb,
            "Network" => match dev.properties.network_address {
                Some(addr) => network_connection(&Into::<Vec<u8>>::into(addr))?,
                None => {
                    warn!("Device is network attached, but has no network info");
                    return Err(malformed("network device without address"));
                }
            },
            _ => Connection::Unknown(dev.properties.connection_type),
        };
        debug!("Connection type: {connection_type:?}");
        Ok(UsbmuxdDevice {
            connection_type,
            udid: dev.properties.serial_number,
            device_id: dev.device_id,
        })
    }
}
