//! Host-side pairing record
//!
//! The record is produced when the host and device were paired and is kept by
//! usbmuxd (or supplied by the caller). This crate only reads it: the host
//! identifiers open a lockdown session and the certificate material secures
//! the session socket.

use std::path::Path;

use plist::Data;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::DeviceError;

/// A parsed pairing record
#[derive(Clone, Debug)]
pub struct PairRecord {
    /// Device certificate, PEM encoded
    pub device_certificate: Vec<u8>,
    /// Host private key, PEM encoded
    pub host_private_key: Vec<u8>,
    /// Host certificate, PEM encoded
    pub host_certificate: Vec<u8>,
    /// Root certificate, PEM encoded
    pub root_certificate: Vec<u8>,
    /// System Build Unique Identifier of the host
    pub system_buid: String,
    /// Host identifier presented in StartSession
    pub host_id: String,
    /// Escrow bag allowing access while the device is locked
    pub escrow_bag: Option<Vec<u8>>,
    pub wifi_mac_address: Option<String>,
    pub udid: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "PascalCase")]
struct RawPairRecord {
    device_certificate: Data,
    host_private_key: Data,
    host_certificate: Data,
    root_certificate: Data,
    #[serde(rename = "SystemBUID")]
    system_buid: String,
    #[serde(rename = "HostID")]
    host_id: String,
    escrow_bag: Option<Data>,
    #[serde(rename = "WiFiMACAddress")]
    wifi_mac_address: Option<String>,
    #[serde(rename = "UDID")]
    udid: Option<String>,
}

impl PairRecord {
    /// Reads a pairing record plist from disk
    pub fn read_from_file(path: impl AsRef<Path>) -> Result<Self, DeviceError> {
        let f = std::fs::read(path)?;
        Self::from_bytes(&f)
    }

    /// Parses a pairing record from XML or binary plist bytes
    ///
    /// # Errors
    /// `PairingRequired` if the bytes do not hold a usable record
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, DeviceError> {
        match plist::from_bytes::<RawPairRecord>(bytes) {
            Ok(r) => Ok(r.into()),
            Err(e) => {
                warn!("Unable to parse pairing record: {e:?}");
                Err(DeviceError::PairingRequired(
                    "pairing record is malformed".into(),
                ))
            }
        }
    }

    /// Serializes the record back to an XML plist
    pub fn serialize(self) -> Result<Vec<u8>, DeviceError> {
        let raw = RawPairRecord::from(self);
        let mut buf = Vec::new();
        plist::to_writer_xml(&mut buf, &raw)?;
        Ok(buf)
    }
}

impl From<RawPairRecord> for PairRecord {
    fn from(value: RawPairRecord) -> Self {
        Self {
            device_certificate: value.device_certificate.into(),
            host_private_key: value.host_private_key.into(),
            host_certificate: value.host_certificate.into(),
            root_certificate: value.root_certificate.into(),
            system_buid: value.system_buid,
            host_id: value.host_id,
            escrow_bag: value.escrow_bag.map(Into::into),
            wifi_mac_address: value.wifi_mac_address,
            udid: value.udid,
        }
    }
}

impl From<PairRecord> for RawPairRecord {
    fn from(value: PairRecord) -> Self {
        Self {
            device_certificate: Data::new(value.device_certificate),
            host_private_key: Data::new(value.host_private_key),
            host_certificate: Data::new(value.host_certificate),
            root_certificate: Data::new(value.root_certificate),
            system_buid: value.system_buid,
            host_id: value.host_id,
            escrow_bag: value.escrow_bag.map(Data::new),
            wifi_mac_address: value.wifi_mac_address,
            udid: value.udid,
        }
    }
}
