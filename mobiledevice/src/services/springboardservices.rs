//! SpringBoard services
//!
//! Home screen layout and application icons.

use plist::Value;
use plist_macro::plist;

use crate::{DeviceError, ServiceClient, ServiceConnection, services};

#[derive(Debug)]
pub struct SpringBoardServicesClient {
    connection: ServiceConnection,
}

impl ServiceClient for SpringBoardServicesClient {
    fn service_name() -> &'static str {
        services::SPRINGBOARD_SERVICES
    }

    async fn from_connection(connection: ServiceConnection) -> Result<Self, DeviceError> {
        Ok(Self::new(connection))
    }
}

impl SpringBoardServicesClient {
    pub fn new(connection: ServiceConnection) -> Self {
        Self { connection }
    }

    pub fn last_error(&self) -> Option<&DeviceError> {
        self.connection.last_error()
    }

    /// PNG data of an application's home screen icon
    pub async fn icon_png_data(&mut self, bundle_id: &str) -> Result<Vec<u8>, DeviceError> {
        let res = async {
            self.connection
                .send_plist(plist!({
                    "command": "getIconPNGData",
                    "bundleId": bundle_id,
                }))
                .await?;

            let mut res = self.connection.read_plist().await?;
            match res.remove("pngData") {
                Some(Value::Data(res)) => Ok(res),
                _ => Err(DeviceError::ProtocolError("reply without pngData".into())),
            }
        }
        .await;
        self.connection.record(res)
    }

    /// Home screen layout: pages of icons and folders
    ///
    /// # Arguments
    /// * `format_version` - Layout format to ask for, `"2"` on current devices
    pub async fn icon_state(&mut self, format_version: Option<&str>) -> Result<Value, DeviceError> {
        let res = async {
            let mut req = plist::Dictionary::new();
            req.insert("command".into(), "getIconState".into());
            if let Some(version) = format_version {
                req.insert("formatVersion".into(), version.into());
            }
            self.connection.send_plist(req.into()).await?;
            self.connection.read_plist_value().await
        }
        .await;
        self.connection.record(res)
    }
}
