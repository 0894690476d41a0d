//! How to reach one device
//!
//! A connector knows the transport to a single device: it opens sockets to
//! device ports, supplies the host's pairing record and wraps sockets in TLS.
//! The device session drives lockdownd through it and never touches the
//! transport directly.

use std::{fmt::Debug, future::Future, pin::Pin};

#[cfg(feature = "tcp")]
use std::net::{IpAddr, SocketAddr};

use crate::{DeviceError, ServiceConnection, ServiceSocket, pair_record::PairRecord};

/// Boxed future returned by connector methods
pub type ConnectorFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, DeviceError>> + Send + 'a>>;

/// A transport to one device
pub trait DeviceConnector: Send + Sync + Debug {
    /// Opens a plain socket to a port on the device
    fn connect(&self, port: u16) -> ConnectorFuture<'_, ServiceConnection>;

    /// Label sent along with lockdown requests
    fn label(&self) -> &str;

    /// The host's pairing record for this device
    ///
    /// # Errors
    /// `PairingRequired` if the host has never been paired with the device
    fn pair_record(&self) -> ConnectorFuture<'_, PairRecord>;

    /// Wraps a connected socket in TLS using the pairing record
    fn secure<'a>(
        &'a self,
        socket: ServiceSocket,
        pair_record: &'a PairRecord,
    ) -> ConnectorFuture<'a, ServiceSocket> {
        Box::pin(async move {
            #[cfg(feature = "rustls")]
            {
                crate::tls::upgrade(socket, pair_record).await
            }
            #[cfg(not(feature = "rustls"))]
            {
                let _ = (socket, pair_record);
                Err(DeviceError::Tls("built without a TLS backend".into()))
            }
        })
    }
}

/// Reaches a device over the network with a pairing record supplied by the caller
#[cfg(feature = "tcp")]
#[derive(Debug)]
pub struct TcpConnector {
    pub addr: IpAddr,
    pub pair_record: PairRecord,
    pub label: String,
}

#[cfg(feature = "tcp")]
impl TcpConnector {
    pub fn new(addr: IpAddr, pair_record: PairRecord, label: impl Into<String>) -> Self {
        Self {
            addr,
            pair_record,
            label: label.into(),
        }
    }
}

#[cfg(feature = "tcp")]
impl DeviceConnector for TcpConnector {
    fn connect(&self, port: u16) -> ConnectorFuture<'_, ServiceConnection> {
        let addr = SocketAddr::new(self.addr, port);
        Box::pin(async move {
            let stream = tokio::net::TcpStream::connect(addr).await?;
            Ok(ServiceConnection::new(Box::new(stream), self.label.clone()))
        })
    }

    fn label(&self) -> &str {
        &self.label
    }

    fn pair_record(&self) -> ConnectorFuture<'_, PairRecord> {
        let pair_record = self.pair_record.clone();
        Box::pin(async move { Ok(pair_record) })
    }
}
