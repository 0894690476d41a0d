//! MobileSync, the SyncAgent behind `com.apple.mobilesync`
//!
//! Messages are DeviceLink arrays: a message tag followed by its arguments.
//! Only a slow sync that pulls every record of a data class is supported.

use std::time::SystemTime;

use chrono::{DateTime, Utc};
use plist::{Dictionary, Value};
use tracing::{debug, warn};

use crate::{DeviceError, ServiceClient, ServiceConnection, services};

/// Data class holding the address book
pub const CONTACTS: &str = "com.apple.Contacts";

/// DeviceLink protocol version announced to the device
const DEVICE_LINK_VERSION: u64 = 300;
/// SyncAgent protocol version announced when a session starts
const SYNC_PROTOCOL_VERSION: u64 = 106;
/// Device anchor that asks for a slow sync
const SLOW_SYNC_ANCHOR: &str = "---";
const EMPTY_PARAMETER: &str = "___EmptyParameterString___";

#[derive(Debug)]
pub struct MobileSyncClient {
    connection: ServiceConnection,
}

impl ServiceClient for MobileSyncClient {
    fn service_name() -> &'static str {
        services::MOBILE_SYNC
    }

    async fn from_connection(connection: ServiceConnection) -> Result<Self, DeviceError> {
        let mut client = Self::new(connection);
        client.version_exchange().await?;
        Ok(client)
    }
}

fn tag_of(message: &[Value]) -> &str {
    message.first().and_then(Value::as_string).unwrap_or("")
}

/// Reason string a device attaches to a refusal, if any
fn reason_of(message: &[Value]) -> String {
    message
        .iter()
        .skip(2)
        .find_map(Value::as_string)
        .unwrap_or("no reason given")
        .to_string()
}

impl MobileSyncClient {
    /// Wraps a connection on which the DeviceLink handshake is already done
    pub fn new(connection: ServiceConnection) -> Self {
        Self { connection }
    }

    pub fn last_error(&self) -> Option<&DeviceError> {
        self.connection.last_error()
    }

    async fn send_message(&mut self, message: Vec<Value>) -> Result<(), DeviceError> {
        self.connection.send_bplist(Value::Array(message)).await
    }

    async fn receive_message(&mut self) -> Result<Vec<Value>, DeviceError> {
        match self.connection.read_plist_value().await? {
            Value::Array(message) if !tag_of(&message).is_empty() => Ok(message),
            other => Err(DeviceError::ProtocolError(format!(
                "expected a DeviceLink message, got {other:?}"
            ))),
        }
    }

    async fn expect_message(&mut self, tag: &str) -> Result<Vec<Value>, DeviceError> {
        let message = self.receive_message().await?;
        if tag_of(&message) != tag {
            warn!("Expected {tag}, got {}", tag_of(&message));
            return Err(DeviceError::ProtocolError(format!(
                "expected {tag}, got {}",
                tag_of(&message)
            )));
        }
        Ok(message)
    }

    /// The device announces its DeviceLink version, the host accepts it, the
    /// device reports ready
    async fn version_exchange(&mut self) -> Result<(), DeviceError> {
        let res = async {
            debug!("Starting DeviceLink version exchange");
            let offer = self.expect_message("DLMessageVersionExchange").await?;
            let major = offer.get(1).and_then(Value::as_unsigned_integer);
            debug!("SyncAgent speaks DeviceLink {major:?}");

            self.send_message(vec![
                "DLMessageVersionExchange".into(),
                "DLVersionsOk".into(),
                DEVICE_LINK_VERSION.into(),
            ])
            .await?;
            self.expect_message("DLMessageDeviceReady").await?;
            Ok(())
        }
        .await;
        self.connection.record(res)
    }

    /// Every contact in the address book
    ///
    /// # Returns
    /// Records keyed by their record identifier, merged from every batch the
    /// device sends
    ///
    /// # Errors
    /// `OperationFailed` if the device refuses to sync or cancels the session
    pub async fn contact_data(&mut self) -> Result<Dictionary, DeviceError> {
        self.all_records(CONTACTS).await
    }

    /// Every record of `data_class`, pulled with a slow sync
    pub async fn all_records(&mut self, data_class: &str) -> Result<Dictionary, DeviceError> {
        let res = async {
            self.start_sync(data_class).await?;
            self.send_message(vec![
                "SDMessageGetAllRecordsFromDevice".into(),
                data_class.into(),
            ])
            .await?;

            let mut records = Dictionary::new();
            loop {
                let mut batch = self.receive_message().await?;
                match tag_of(&batch) {
                    "SDMessageProcessChanges" => {}
                    "SDMessageCancelSession" => {
                        return Err(DeviceError::OperationFailed(format!(
                            "device cancelled the sync: {}",
                            reason_of(&batch)
                        )));
                    }
                    other => {
                        return Err(DeviceError::ProtocolError(format!(
                            "unexpected {other} while receiving records"
                        )));
                    }
                }
                let last = batch.get(3).and_then(Value::as_boolean).unwrap_or(true);
                let entities = match batch.get_mut(2) {
                    Some(Value::Dictionary(entities)) => std::mem::take(entities),
                    _ => Dictionary::new(),
                };
                debug!("Received {} records of {data_class}", entities.len());
                for (id, record) in entities {
                    records.insert(id, record);
                }
                self.send_message(vec![
                    "SDMessageAcknowledgeChangesFromDevice".into(),
                    data_class.into(),
                ])
                .await?;
                if last {
                    break;
                }
            }

            self.finish_sync(data_class).await?;
            Ok(records)
        }
        .await;
        self.connection.record(res)
    }

    async fn start_sync(&mut self, data_class: &str) -> Result<(), DeviceError> {
        let now: DateTime<Utc> = SystemTime::now().into();
        let host_anchor = now.format("%Y-%m-%d %H:%M:%S %z").to_string();
        self.send_message(vec![
            "SDMessageSyncDataClassWithDevice".into(),
            data_class.into(),
            SLOW_SYNC_ANCHOR.into(),
            host_anchor.into(),
            SYNC_PROTOCOL_VERSION.into(),
            EMPTY_PARAMETER.into(),
        ])
        .await?;

        let reply = self.receive_message().await?;
        match tag_of(&reply) {
            "SDMessageSyncDataClassWithComputer" => {
                debug!("Sync of {data_class} started");
                Ok(())
            }
            "SDMessageRefuseToSyncDataClassWithComputer" | "SDMessageCancelSession" => {
                Err(DeviceError::OperationFailed(format!(
                    "device refused to sync {data_class}: {}",
                    reason_of(&reply)
                )))
            }
            other => Err(DeviceError::ProtocolError(format!(
                "unexpected {other} when starting a sync"
            ))),
        }
    }

    async fn finish_sync(&mut self, data_class: &str) -> Result<(), DeviceError> {
        self.send_message(vec![
            "SDMessageFinishSessionOnDevice".into(),
            data_class.into(),
        ])
        .await?;
        self.expect_message("SDMessageDeviceFinishedSession").await?;
        Ok(())
    }

    /// Says goodbye to SyncAgent and closes the connection
    pub async fn disconnect(&mut self) -> Result<(), DeviceError> {
        let res = async {
            self.send_message(vec!["DLMessageDisconnect".into(), EMPTY_PARAMETER.into()])
                .await?;
            self.connection.close().await
        }
        .await;
        self.connection.record(res)
    }
}
