#![doc = include_str!("../README.md")]
// The mobiledevice authors

pub mod application;
pub mod connector;
pub mod device;
pub mod pair_record;
pub mod registry;
pub mod services;
#[cfg(feature = "rustls")]
mod tls;
#[cfg(feature = "usbmuxd")]
pub mod usbmuxd;
mod util;

pub use services::*;

pub use application::Application;
pub use connector::DeviceConnector;
pub use device::{Device, DeviceIdentity, DeviceState};
pub use registry::{AttachedDevice, DeviceEvent, DeviceListener, DeviceRegistry, DeviceWatcher};
pub use util::{pretty_print_dictionary, pretty_print_plist};

use std::{io, sync::Arc};

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, trace, warn};

use crate::{pair_record::PairRecord, services::afc::errors::AfcError};

/// Client version announced to usbmuxd and used as the default label
pub const CLIENT_VERSION: &str = concat!("mobiledevice-", env!("CARGO_PKG_VERSION"));

/// Largest plist frame accepted from a device or from usbmuxd
pub const MAX_PLIST_LEN: u32 = 16 * 1024 * 1024;

/// A trait combining all required characteristics for a device communication socket
///
/// Tokio's TcpStream, UnixStream and DuplexStream implement this trait.
pub trait ReadWrite: AsyncRead + AsyncWrite + Unpin + Send + Sync + std::fmt::Debug {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send + Sync + std::fmt::Debug> ReadWrite for T {}

/// Type alias for boxed service sockets
pub type ServiceSocket = Box<dyn ReadWrite>;

/// A protocol client that is built on top of one started service
///
/// The session hands out a bare [`ServiceConnection`]; implementors know the
/// application protocol that runs over it.
pub trait ServiceClient: Sized {
    /// Returns the service name as advertised by lockdownd
    fn service_name() -> &'static str;

    /// Wraps a connection that was started for [`ServiceClient::service_name`]
    fn from_connection(
        connection: ServiceConnection,
    ) -> impl std::future::Future<Output = Result<Self, DeviceError>> + Send;
}

/// One live socket bound to a named service on a device
///
/// Owns the last-error state of every client that wraps it. Once closed, or
/// once the socket fails, every subsequent call fails.
#[derive(Debug)]
pub struct ServiceConnection {
    socket: Option<ServiceSocket>,
    label: String,
    service: String,
    last_error: Option<DeviceError>,
}

impl ServiceConnection {
    /// Creates a connection handle around an established socket
    ///
    /// # Arguments
    /// * `socket` - The connected socket
    /// * `label` - Label sent to the device with lockdown requests
    pub fn new(socket: ServiceSocket, label: impl Into<String>) -> Self {
        Self {
            socket: Some(socket),
            label: label.into(),
            service: String::new(),
            last_error: None,
        }
    }

    /// Tags the connection with the name of the service it was started for
    pub fn with_service(mut self, service: impl Into<String>) -> Self {
        self.service = service.into();
        self
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// The service this connection was started for, empty for lockdownd itself
    pub fn service_name(&self) -> &str {
        &self.service
    }

    pub fn is_open(&self) -> bool {
        self.socket.is_some()
    }

    /// The error of the most recent operation, `None` if it succeeded
    pub fn last_error(&self) -> Option<&DeviceError> {
        self.last_error.as_ref()
    }

    /// Stores the outcome of an operation as the last error and passes it through
    pub fn record<T>(&mut self, res: Result<T, DeviceError>) -> Result<T, DeviceError> {
        match &res {
            Ok(_) => self.last_error = None,
            Err(e) => self.last_error = Some(e.clone()),
        }
        res
    }

    fn socket_mut(&mut self) -> Result<&mut ServiceSocket, DeviceError> {
        self.socket.as_mut().ok_or(DeviceError::NotConnected)
    }

    /// A failed socket is dropped so that nothing keeps using a half-read stream
    fn check_io<T>(&mut self, res: io::Result<T>) -> Result<T, DeviceError> {
        res.map_err(|e| {
            warn!("Socket for `{}` failed: {e}", self.service);
            self.socket = None;
            DeviceError::from(e)
        })
    }

    /// Sends a length-prefixed XML plist
    ///
    /// # Errors
    /// Returns `DeviceError` if serialization or transmission fails
    pub async fn send_plist(&mut self, message: plist::Value) -> Result<(), DeviceError> {
        debug!("Sending plist: {}", pretty_print_plist(&message));

        let mut buf = Vec::new();
        message.to_writer_xml(&mut buf)?;
        self.send_framed(&buf).await
    }

    /// Sends a length-prefixed binary plist
    pub async fn send_bplist(&mut self, message: plist::Value) -> Result<(), DeviceError> {
        debug!("Sending bplist: {}", pretty_print_plist(&message));

        let mut buf = Vec::new();
        message.to_writer_binary(&mut buf)?;
        self.send_framed(&buf).await
    }

    async fn send_framed(&mut self, message: &[u8]) -> Result<(), DeviceError> {
        let len = u32::try_from(message.len())
            .map_err(|_| DeviceError::InvalidArgument("plist message too large".into()))?;
        let socket = self.socket_mut()?;
        let res = async {
            socket.write_all(&len.to_be_bytes()).await?;
            socket.write_all(message).await?;
            socket.flush().await
        }
        .await;
        self.check_io(res)
    }

    async fn read_frame(&mut self) -> Result<Vec<u8>, DeviceError> {
        let socket = self.socket_mut()?;
        let res = async {
            let mut buf = [0u8; 4];
            socket.read_exact(&mut buf).await?;
            Ok(u32::from_be_bytes(buf))
        }
        .await;
        let len = self.check_io(res)?;
        if len > MAX_PLIST_LEN {
            // the rest of the stream cannot be trusted
            self.socket = None;
            return Err(DeviceError::ProtocolError(format!(
                "plist frame of {len} bytes exceeds the {MAX_PLIST_LEN} byte limit"
            )));
        }

        let socket = self.socket_mut()?;
        let mut buf = vec![0; len as usize];
        let res = socket.read_exact(&mut buf).await;
        self.check_io(res)?;
        Ok(buf)
    }

    /// Reads a length-prefixed plist without interpreting it
    pub async fn read_plist_raw(&mut self) -> Result<plist::Dictionary, DeviceError> {
        let buf = self.read_frame().await?;
        let res: plist::Dictionary = plist::from_bytes(&buf)?;
        debug!("Received plist: {}", pretty_print_dictionary(&res));
        Ok(res)
    }

    /// Reads a length-prefixed plist whose root is not necessarily a dictionary
    pub async fn read_plist_value(&mut self) -> Result<plist::Value, DeviceError> {
        let buf = self.read_frame().await?;
        let res: plist::Value = plist::from_bytes(&buf)?;
        debug!("Received plist: {}", pretty_print_plist(&res));
        Ok(res)
    }

    /// Reads a length-prefixed plist, turning an `Error` entry into a typed error
    ///
    /// # Errors
    /// Returns `DeviceError` if reading or parsing fails, or the device reports an error
    pub async fn read_plist(&mut self) -> Result<plist::Dictionary, DeviceError> {
        let res = self.read_plist_raw().await?;
        if let Some(e) = res.get("Error").and_then(|e| e.as_string()) {
            return Err(DeviceError::from_device_error(e, &res));
        }
        Ok(res)
    }

    /// Sends raw bytes
    pub async fn send_raw(&mut self, message: &[u8]) -> Result<(), DeviceError> {
        let socket = self.socket_mut()?;
        trace!("Writing {} raw bytes", message.len());
        let res = async {
            socket.write_all(message).await?;
            socket.flush().await
        }
        .await;
        self.check_io(res)
    }

    /// Reads exactly `len` bytes
    ///
    /// # Errors
    /// Returns `ConnectionFailed` if the stream ends early
    pub async fn read_raw(&mut self, len: usize) -> Result<Vec<u8>, DeviceError> {
        let socket = self.socket_mut()?;
        let mut buf = vec![0; len];
        let res = socket.read_exact(&mut buf).await;
        self.check_io(res)?;
        Ok(buf)
    }

    /// Reads up to `max_size` bytes. An empty result means end of stream.
    pub async fn read_any(&mut self, max_size: usize) -> Result<Vec<u8>, DeviceError> {
        let socket = self.socket_mut()?;
        let mut buf = vec![0; max_size];
        let res = socket.read(&mut buf).await;
        let len = self.check_io(res)?;
        buf.truncate(len);
        Ok(buf)
    }

    /// Wraps the socket in TLS using the host's pairing record
    ///
    /// # Errors
    /// Returns `DeviceError` if the handshake fails
    pub async fn start_tls(
        &mut self,
        connector: &dyn DeviceConnector,
        pair_record: &PairRecord,
    ) -> Result<(), DeviceError> {
        let socket = self.socket.take().ok_or(DeviceError::NotConnected)?;
        let socket = connector.secure(socket, pair_record).await?;
        self.socket = Some(socket);
        Ok(())
    }

    /// Shuts the socket down. The connection cannot be used afterwards.
    pub async fn close(&mut self) -> Result<(), DeviceError> {
        match self.socket.take() {
            Some(mut socket) => {
                debug!("Closing connection to `{}`", self.service);
                socket.shutdown().await?;
                Ok(())
            }
            None => Ok(()),
        }
    }
}

/// Failures reported by the device file relay while it stages an export
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum StagingError {
    #[error("fileset contains no files to transfer")]
    Empty,
    #[error("failed to create the staging directory on the device")]
    CreateStagingPath,
    #[error("failed to create the archive copier on the device")]
    CopierCreation,
    #[error("failed to populate the archive on the device")]
    Population,
    #[error("the archive is registered on the device but its file is missing")]
    ArchiveMissing,
}

/// Comprehensive error type for all device communication failures
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum DeviceError {
    #[error("connection failed: {0}")]
    ConnectionFailed(Arc<io::Error>),
    #[error("no established connection")]
    NotConnected,
    #[error("pairing required: {0}")]
    PairingRequired(String),
    #[error("unable to subscribe to device notifications: {0}")]
    SubscriptionError(String),
    #[error("service `{0}` is not available on this device")]
    ServiceUnavailable(String),
    #[error("key not found: {0}")]
    KeyNotFound(String),
    #[error("path not found: {0}")]
    PathNotFound(String),
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("this service instance has already been used")]
    AlreadyUsed,
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("unexpected response from device: {0}")]
    ProtocolError(String),
    #[error("staging failed: {0}")]
    StagingFailed(StagingError),
    #[error("device not found")]
    DeviceNotFound,
    #[error("file handle is not open")]
    InvalidHandle,
    #[error("afc error: {0}")]
    Afc(AfcError),
    #[error("operation failed: {0}")]
    OperationFailed(String),
    #[error("device is locked")]
    DeviceLocked,
    #[error("unknown error `{0}` returned from device")]
    DeviceReported(String),
    #[error("plist error: {0}")]
    Plist(Arc<plist::Error>),
    #[error("tls error: {0}")]
    Tls(String),
}

impl From<io::Error> for DeviceError {
    fn from(value: io::Error) -> Self {
        Self::ConnectionFailed(Arc::new(value))
    }
}

impl From<plist::Error> for DeviceError {
    fn from(value: plist::Error) -> Self {
        Self::Plist(Arc::new(value))
    }
}

impl DeviceError {
    /// Converts a device-reported error string to a typed error
    ///
    /// # Arguments
    /// * `e` - The `Error` value from the reply
    /// * `context` - Full reply, used for the key, service or description it names
    pub fn from_device_error(e: &str, context: &plist::Dictionary) -> Self {
        let context_string = |key: &str| {
            context
                .get(key)
                .and_then(|v| v.as_string())
                .unwrap_or(e)
                .to_string()
        };
        match e {
            "InvalidHostID" | "PairingDialogResponsePending" | "UserDeniedPairing"
            | "PasswordProtected" => Self::PairingRequired(e.to_string()),
            "MissingValue" => Self::KeyNotFound(context_string("Key")),
            "InvalidService" | "ServiceProhibited" | "ServiceLimit" => {
                Self::ServiceUnavailable(context_string("Service"))
            }
            "GetProhibited" | "SetProhibited" | "PermissionDenied" => {
                Self::PermissionDenied(e.to_string())
            }
            "DeviceLocked" => Self::DeviceLocked,
            "InvalidSource" => Self::InvalidArgument("invalid fileset name".into()),
            "StagingEmpty" => Self::StagingFailed(StagingError::Empty),
            "CreateStagingPathFailed" => Self::StagingFailed(StagingError::CreateStagingPath),
            "CopierCreationFailed" => Self::StagingFailed(StagingError::CopierCreation),
            "PopulationFailed" => Self::StagingFailed(StagingError::Population),
            _ => match context.get("ErrorDescription").and_then(|d| d.as_string()) {
                Some(desc) => Self::OperationFailed(format!("{e}: {desc}")),
                None => Self::DeviceReported(e.to_string()),
            },
        }
    }

    /// Stable numeric code for each failure kind
    pub fn code(&self) -> i32 {
        match self {
            DeviceError::ConnectionFailed(_) => -1,
            DeviceError::NotConnected => -2,
            DeviceError::PairingRequired(_) => -3,
            DeviceError::SubscriptionError(_) => -4,
            DeviceError::ServiceUnavailable(_) => -5,
            DeviceError::KeyNotFound(_) => -6,
            DeviceError::PathNotFound(_) => -7,
            DeviceError::PermissionDenied(_) => -8,
            DeviceError::AlreadyUsed => -9,
            DeviceError::InvalidArgument(_) => -10,
            DeviceError::ProtocolError(_) => -11,
            DeviceError::StagingFailed(_) => -12,
            DeviceError::DeviceNotFound => -13,
            DeviceError::InvalidHandle => -14,
            DeviceError::Afc(_) => -15,
            DeviceError::OperationFailed(_) => -16,
            DeviceError::DeviceLocked => -17,
            DeviceError::DeviceReported(_) => -18,
            DeviceError::Plist(_) => -19,
            DeviceError::Tls(_) => -20,
        }
    }
}
