//! USB Multiplexing Daemon (usbmuxd) client
//!
//! usbmuxd owns the USB (and Wi-Fi) links to devices. It lists and announces
//! devices, tunnels TCP connections to device ports and stores the host's
//! pairing records.

use std::{
    net::{AddrParseError, IpAddr, SocketAddr},
    str::FromStr,
};

#[cfg(not(unix))]
use std::net::{Ipv4Addr, SocketAddrV4};

use futures::{Stream, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, warn};

use crate::{
    DeviceConnector, DeviceError, ServiceConnection, ServiceSocket,
    connector::ConnectorFuture,
    pair_record::PairRecord,
    registry::{AttachedDevice, DeviceEvent, DeviceEventStream, DeviceWatcher},
};

mod des;

/// How a device is attached
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Connection {
    Usb,
    Network(IpAddr),
    Unknown(String),
}

/// A device as usbmuxd reports it
#[derive(Debug, Clone)]
pub struct UsbmuxdDevice {
    pub connection_type: Connection,
    /// Unique Device Identifier
    pub udid: String,
    /// usbmuxd-assigned device ID
    pub device_id: u32,
}

/// Events of a `Listen` connection
#[derive(Debug, Clone)]
pub enum UsbmuxdListenEvent {
    Connected(UsbmuxdDevice),
    /// The mux ID
    Disconnected(u32),
}

/// Address of the usbmuxd service
#[derive(Clone, Debug)]
pub enum UsbmuxdAddr {
    /// Unix domain socket path (Unix systems only)
    #[cfg(unix)]
    UnixSocket(String),
    TcpSocket(SocketAddr),
}

impl UsbmuxdAddr {
    /// Default TCP port for usbmuxd
    pub const DEFAULT_PORT: u16 = 27015;
    /// Default Unix socket path for usbmuxd
    pub const SOCKET_FILE: &'static str = "/var/run/usbmuxd";

    pub async fn to_socket(&self) -> Result<ServiceSocket, DeviceError> {
        Ok(match self {
            #[cfg(unix)]
            Self::UnixSocket(addr) => Box::new(tokio::net::UnixStream::connect(addr).await?),
            Self::TcpSocket(addr) => Box::new(tokio::net::TcpStream::connect(addr).await?),
        })
    }

    pub async fn connect(&self, tag: u32) -> Result<UsbmuxdConnection, DeviceError> {
        let socket = self.to_socket().await?;
        Ok(UsbmuxdConnection::new(socket, tag))
    }

    /// Reads `USBMUXD_SOCKET_ADDRESS`, falling back to the platform default
    ///
    /// A value containing `:` is a TCP address, anything else a socket path.
    pub fn from_env_var() -> Result<Self, AddrParseError> {
        Ok(match std::env::var("USBMUXD_SOCKET_ADDRESS") {
            Ok(var) => {
                #[cfg(unix)]
                if var.contains(':') {
                    Self::TcpSocket(SocketAddr::from_str(&var)?)
                } else {
                    Self::UnixSocket(var)
                }
                #[cfg(not(unix))]
                Self::TcpSocket(SocketAddr::from_str(&var)?)
            }
            Err(_) => Self::default(),
        })
    }
}

impl Default for UsbmuxdAddr {
    fn default() -> Self {
        #[cfg(not(unix))]
        {
            Self::TcpSocket(SocketAddr::V4(SocketAddrV4::new(
                Ipv4Addr::new(127, 0, 0, 1),
                Self::DEFAULT_PORT,
            )))
        }
        #[cfg(unix)]
        Self::UnixSocket(Self::SOCKET_FILE.to_string())
    }
}

/// One connection to usbmuxd
///
/// Every request uses its own connection: `Connect` turns the socket into a
/// tunnel and `Listen` turns it into an event stream.
pub struct UsbmuxdConnection {
    socket: ServiceSocket,
    tag: u32,
}

impl std::fmt::Debug for UsbmuxdConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UsbmuxdConnection")
            .field("tag", &self.tag)
            .finish()
    }
}

impl UsbmuxdConnection {
    /// XML PLIST protocol version
    pub const XML_PLIST_VERSION: u32 = 1;
    /// PLIST message type
    pub const PLIST_MESSAGE_TYPE: u32 = 8;
    const HEADER_LEN: u32 = 16;

    pub fn new(socket: ServiceSocket, tag: u32) -> Self {
        Self { socket, tag }
    }

    /// Lists all attached devices
    pub async fn get_devices(&mut self) -> Result<Vec<UsbmuxdDevice>, DeviceError> {
        let mut req = plist::Dictionary::new();
        req.insert("MessageType".into(), "ListDevices".into());
        req.insert("ClientVersionString".into(), crate::CLIENT_VERSION.into());
        req.insert("kLibUSBMuxVersion".into(), 3.into());
        self.write_plist(req).await?;
        let res = self.read_plist().await?;
        let res = plist::from_value::<des::ListDevicesResponse>(&plist::Value::Dictionary(res))?;

        Ok(res
            .device_list
            .into_iter()
            .filter_map(|x| match x.into_usbmuxd_dev() {
                Ok(dev) => Some(dev),
                Err(e) => {
                    warn!("Skipping device: {e}");
                    None
                }
            })
            .collect())
    }

    /// Fetches the host's pairing record for a device
    ///
    /// # Errors
    /// `PairingRequired` if usbmuxd has no record for `udid`
    pub async fn get_pair_record(&mut self, udid: &str) -> Result<PairRecord, DeviceError> {
        debug!("Getting pair record for {udid}");
        let mut req = plist::Dictionary::new();
        req.insert("MessageType".into(), "ReadPairRecord".into());
        req.insert("PairRecordID".into(), udid.into());
        self.write_plist(req).await?;
        let res = self.read_plist().await?;

        match res.get("PairRecordData") {
            Some(plist::Value::Data(d)) => PairRecord::from_bytes(d),
            _ => Err(DeviceError::PairingRequired(format!(
                "no pairing record for {udid}"
            ))),
        }
    }

    /// Tunnels the socket to a port on the device
    pub async fn connect_to_device(
        mut self,
        device_id: u32,
        port: u16,
        label: &str,
    ) -> Result<ServiceConnection, DeviceError> {
        debug!("Connecting to device {device_id} on port {port}");

        let mut req = plist::Dictionary::new();
        req.insert("MessageType".into(), "Connect".into());
        req.insert("DeviceID".into(), device_id.into());
        // usbmuxd wants the port in network byte order
        req.insert("PortNumber".into(), port.to_be().into());
        self.write_plist(req).await?;
        match self
            .read_plist()
            .await?
            .get("Number")
            .and_then(|n| n.as_unsigned_integer())
        {
            Some(0) => Ok(ServiceConnection::new(self.socket, label)),
            Some(2) => Err(DeviceError::DeviceNotFound),
            Some(3) => Err(DeviceError::ConnectionFailed(std::sync::Arc::new(
                std::io::ErrorKind::ConnectionRefused.into(),
            ))),
            other => Err(DeviceError::ProtocolError(format!(
                "usbmuxd Connect result {other:?}"
            ))),
        }
    }

    /// Turns the connection into a stream of attach and detach events
    ///
    /// Devices already attached are announced first.
    pub async fn listen(
        mut self,
    ) -> Result<impl Stream<Item = Result<UsbmuxdListenEvent, DeviceError>> + Send, DeviceError>
    {
        let mut req = plist::Dictionary::new();
        req.insert("MessageType".into(), "Listen".into());
        req.insert("ClientVersionString".into(), crate::CLIENT_VERSION.into());
        self.write_plist(req).await?;

        let res = self.read_plist().await?;
        if res.get("Number").and_then(|x| x.as_unsigned_integer()) != Some(0) {
            return Err(DeviceError::SubscriptionError(
                "usbmuxd refused the Listen request".into(),
            ));
        }

        Ok(futures::stream::try_unfold(self, |mut conn| async move {
            loop {
                let msg = conn.read_plist().await?;
                let event = match msg.get("MessageType").and_then(|m| m.as_string()) {
                    Some("Attached") => {
                        match plist::from_value::<des::DeviceListResponse>(
                            &plist::Value::Dictionary(msg),
                        )
                        .map_err(DeviceError::from)
                        .and_then(|props| props.into_usbmuxd_dev())
                        {
                            Ok(dev) => UsbmuxdListenEvent::Connected(dev),
                            Err(e) => {
                                warn!("Ignoring malformed Attached message: {e}");
                                continue;
                            }
                        }
                    }
                    Some("Detached") => {
                        match msg
                            .get("DeviceID")
                            .and_then(|v| v.as_unsigned_integer())
                            .and_then(|id| u32::try_from(id).ok())
                        {
                            Some(id) => UsbmuxdListenEvent::Disconnected(id),
                            None => {
                                debug!("Device detached (unknown ID)");
                                continue;
                            }
                        }
                    }
                    other => {
                        warn!("Received unexpected message type during listen: {other:?}");
                        continue;
                    }
                };
                return Ok(Some((event, conn)));
            }
        }))
    }

    async fn write_plist(&mut self, req: plist::Dictionary) -> Result<(), DeviceError> {
        let mut body = Vec::new();
        plist::Value::Dictionary(req).to_writer_xml(&mut body)?;
        let len = u32::try_from(body.len())
            .ok()
            .and_then(|l| l.checked_add(Self::HEADER_LEN))
            .ok_or_else(|| DeviceError::InvalidArgument("usbmuxd request too large".into()))?;

        let mut packet = Vec::with_capacity(len as usize);
        packet.extend_from_slice(&len.to_le_bytes());
        packet.extend_from_slice(&Self::XML_PLIST_VERSION.to_le_bytes());
        packet.extend_from_slice(&Self::PLIST_MESSAGE_TYPE.to_le_bytes());
        packet.extend_from_slice(&self.tag.to_le_bytes());
        packet.extend_from_slice(&body);

        self.socket.write_all(&packet).await?;
        self.socket.flush().await?;
        Ok(())
    }

    async fn read_plist(&mut self) -> Result<plist::Dictionary, DeviceError> {
        let mut header = [0u8; 16];
        self.socket.read_exact(&mut header).await?;

        let packet_size = u32::from_le_bytes([header[0], header[1], header[2], header[3]])
            .checked_sub(Self::HEADER_LEN)
            .ok_or_else(|| DeviceError::ProtocolError("usbmuxd packet shorter than header".into()))?;
        if packet_size > crate::MAX_PLIST_LEN {
            return Err(DeviceError::ProtocolError(format!(
                "usbmuxd packet of {packet_size} bytes is too large"
            )));
        }
        debug!("Reading {packet_size} bytes from muxer");

        let mut body = vec![0; packet_size as usize];
        self.socket.read_exact(&mut body).await?;

        let res = plist::from_bytes(&body)?;
        debug!("Read from muxer: {}", crate::pretty_print_dictionary(&res));
        Ok(res)
    }
}

/// Reaches one device through usbmuxd
#[derive(Debug, Clone)]
pub struct UsbmuxdConnector {
    pub addr: UsbmuxdAddr,
    pub udid: String,
    pub device_id: u32,
    pub label: String,
}

impl UsbmuxdConnector {
    pub fn new(addr: UsbmuxdAddr, device: &UsbmuxdDevice, label: impl Into<String>) -> Self {
        Self {
            addr,
            udid: device.udid.clone(),
            device_id: device.device_id,
            label: label.into(),
        }
    }
}

impl DeviceConnector for UsbmuxdConnector {
    fn connect(&self, port: u16) -> ConnectorFuture<'_, ServiceConnection> {
        Box::pin(async move {
            let usbmuxd = self.addr.connect(self.device_id).await?;
            usbmuxd
                .connect_to_device(self.device_id, port, &self.label)
                .await
        })
    }

    fn label(&self) -> &str {
        &self.label
    }

    fn pair_record(&self) -> ConnectorFuture<'_, PairRecord> {
        Box::pin(async move {
            let mut usbmuxd = self.addr.connect(self.device_id).await?;
            usbmuxd.get_pair_record(&self.udid).await
        })
    }
}

/// Watches usbmuxd for devices, producing registry events
#[derive(Debug, Clone)]
pub struct UsbmuxdWatcher {
    addr: UsbmuxdAddr,
    label: String,
}

impl UsbmuxdWatcher {
    pub fn new(addr: UsbmuxdAddr, label: impl Into<String>) -> Self {
        Self {
            addr,
            label: label.into(),
        }
    }

    /// Watches the usbmuxd named by the environment
    pub fn from_env(label: impl Into<String>) -> Result<Self, DeviceError> {
        let addr = UsbmuxdAddr::from_env_var().map_err(|e| {
            DeviceError::InvalidArgument(format!("USBMUXD_SOCKET_ADDRESS: {e}"))
        })?;
        Ok(Self::new(addr, label))
    }
}

impl DeviceWatcher for UsbmuxdWatcher {
    fn subscribe(&self) -> ConnectorFuture<'_, DeviceEventStream> {
        Box::pin(async move {
            let conn = self
                .addr
                .connect(0)
                .await
                .map_err(|e| DeviceError::SubscriptionError(e.to_string()))?;
            let events = conn.listen().await?;

            let addr = self.addr.clone();
            let label = self.label.clone();
            let events = events.map(move |event| {
                event.map(|event| match event {
                    UsbmuxdListenEvent::Connected(dev) => DeviceEvent::Attached(AttachedDevice {
                        udid: dev.udid.clone(),
                        device_id: dev.device_id,
                        connector: std::sync::Arc::new(UsbmuxdConnector::new(
                            addr.clone(),
                            &dev,
                            label.clone(),
                        )),
                    }),
                    UsbmuxdListenEvent::Disconnected(id) => DeviceEvent::Detached(id),
                })
            });
            Ok(Box::pin(events) as DeviceEventStream)
        })
    }
}
