//! Lockdown service client
//!
//! lockdownd listens on a fixed port and is the gatekeeper for everything else
//! on the device: it answers key/value queries, authenticates the host with
//! its pairing record and hands out ports for named services.

use plist::Value;
use plist_macro::plist;
use tracing::{debug, error, warn};

use crate::{DeviceConnector, DeviceError, ServiceConnection, pair_record::PairRecord};

/// Client for the lockdown protocol
#[derive(Debug)]
pub struct LockdownClient {
    connection: ServiceConnection,
    session_active: bool,
}

impl LockdownClient {
    /// The port lockdownd listens on
    pub const LOCKDOWND_PORT: u16 = 62078;

    pub fn new(connection: ServiceConnection) -> Self {
        Self {
            connection,
            session_active: false,
        }
    }

    /// Opens a connection to lockdownd through a connector
    pub async fn connect(connector: &dyn DeviceConnector) -> Result<Self, DeviceError> {
        let connection = connector.connect(Self::LOCKDOWND_PORT).await?;
        Ok(Self::new(connection))
    }

    pub fn last_error(&self) -> Option<&DeviceError> {
        self.connection.last_error()
    }

    pub fn is_open(&self) -> bool {
        self.connection.is_open()
    }

    /// Whether a TLS session has been established
    pub fn session_active(&self) -> bool {
        self.session_active
    }

    /// Asks the daemon to identify itself, `com.apple.mobile.lockdown` for lockdownd
    pub async fn query_type(&mut self) -> Result<String, DeviceError> {
        let res = async {
            let label = self.connection.label().to_string();
            self.connection
                .send_plist(plist!({
                    "Label": label,
                    "Request": "QueryType",
                }))
                .await?;
            let res = self.connection.read_plist().await?;
            res.get("Type")
                .and_then(|t| t.as_string())
                .map(str::to_string)
                .ok_or_else(|| DeviceError::ProtocolError("QueryType reply without Type".into()))
        }
        .await;
        self.connection.record(res)
    }

    /// Retrieves a value, or a whole domain when `key` is `None`
    ///
    /// # Arguments
    /// * `key` - The name of the value to retrieve (e.g., "DeviceName")
    /// * `domain` - The domain to look in, `None` for the root domain
    ///
    /// # Errors
    /// `KeyNotFound` if the device has no such value
    pub async fn get_value(
        &mut self,
        key: Option<&str>,
        domain: Option<&str>,
    ) -> Result<Value, DeviceError> {
        let res = async {
            let mut req = plist::Dictionary::new();
            req.insert("Label".into(), self.connection.label().into());
            req.insert("Request".into(), "GetValue".into());
            if let Some(key) = key {
                req.insert("Key".into(), key.into());
            }
            if let Some(domain) = domain {
                req.insert("Domain".into(), domain.into());
            }
            self.connection.send_plist(req.into()).await?;

            let mut message = self.connection.read_plist().await?;
            match message.remove("Value") {
                Some(v) => Ok(v),
                None => Err(DeviceError::KeyNotFound(
                    key.or(domain).unwrap_or("<root>").to_string(),
                )),
            }
        }
        .await;
        self.connection.record(res)
    }

    /// Authenticates with the pairing record and switches to TLS when asked to
    ///
    /// # Errors
    /// `PairingRequired` if the device does not know the host
    pub async fn start_session(
        &mut self,
        pair_record: &PairRecord,
        connector: &dyn DeviceConnector,
    ) -> Result<(), DeviceError> {
        let res = async {
            let label = self.connection.label().to_string();
            self.connection
                .send_plist(plist!({
                    "Label": label,
                    "Request": "StartSession",
                    "HostID": pair_record.host_id.clone(),
                    "SystemBUID": pair_record.system_buid.clone(),
                }))
                .await?;

            let response = self.connection.read_plist().await?;
            match response.get("EnableSessionSSL") {
                Some(Value::Boolean(true)) => {
                    self.connection.start_tls(connector, pair_record).await?;
                }
                Some(Value::Boolean(false)) => {
                    warn!("Device started a session without TLS");
                }
                _ => {
                    return Err(DeviceError::ProtocolError(
                        "StartSession reply without EnableSessionSSL".into(),
                    ));
                }
            }
            debug!("Lockdown session started");
            self.session_active = true;
            Ok(())
        }
        .await;
        self.connection.record(res)
    }

    /// Requests to start a service on the device
    ///
    /// # Returns
    /// The port the service listens on and whether it expects TLS
    ///
    /// # Errors
    /// `ServiceUnavailable` if the device does not offer `name`
    pub async fn start_service(&mut self, name: &str) -> Result<(u16, bool), DeviceError> {
        let res = async {
            let label = self.connection.label().to_string();
            self.connection
                .send_plist(plist!({
                    "Label": label,
                    "Request": "StartService",
                    "Service": name,
                }))
                .await?;
            let response = self.connection.read_plist().await.map_err(|e| match e {
                DeviceError::ServiceUnavailable(_) => DeviceError::ServiceUnavailable(name.into()),
                e => e,
            })?;

            // over USB, this option won't exist
            let ssl = matches!(response.get("EnableServiceSSL"), Some(Value::Boolean(true)));

            match response
                .get("Port")
                .and_then(|p| p.as_unsigned_integer())
                .and_then(|p| u16::try_from(p).ok())
            {
                Some(port) => Ok((port, ssl)),
                None => {
                    error!("Response didn't contain a valid port");
                    Err(DeviceError::ProtocolError(
                        "StartService reply without Port".into(),
                    ))
                }
            }
        }
        .await;
        self.connection.record(res)
    }

    pub async fn close(&mut self) -> Result<(), DeviceError> {
        self.session_active = false;
        self.connection.close().await
    }
}
