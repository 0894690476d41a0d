//! Syslog relay
//!
//! Once started, the service streams the device log forever. There is no end
//! of stream message; the stream stops when the connection is closed.

use std::sync::Arc;

use bytes::{Buf, BytesMut};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::{DeviceError, ServiceClient, ServiceConnection, services};

const READ_SIZE: usize = 4096;
const RECORD_END: &[u8] = b"\n\0";

/// Client for the syslog relay service
#[derive(Debug)]
pub struct SyslogRelayClient {
    connection: ServiceConnection,
    buffer: BytesMut,
}

impl ServiceClient for SyslogRelayClient {
    fn service_name() -> &'static str {
        services::SYSLOG_RELAY
    }

    async fn from_connection(connection: ServiceConnection) -> Result<Self, DeviceError> {
        Ok(Self::new(connection))
    }
}

impl SyslogRelayClient {
    pub fn new(connection: ServiceConnection) -> Self {
        Self {
            connection,
            buffer: BytesMut::with_capacity(READ_SIZE),
        }
    }

    pub fn last_error(&self) -> Option<&DeviceError> {
        self.connection.last_error()
    }

    /// Splits off the next record. Records end with `\n\0` and may span lines.
    fn take_line(&mut self) -> Option<String> {
        loop {
            let end = self
                .buffer
                .windows(RECORD_END.len())
                .position(|w| w == RECORD_END)?;
            let line = self.buffer.split_to(end);
            self.buffer.advance(RECORD_END.len());
            let line = String::from_utf8_lossy(&line);
            let line = line.trim_start_matches('\0');
            if !line.is_empty() {
                return Some(line.to_string());
            }
        }
    }

    /// Waits for the next log record, without its terminator
    ///
    /// # Errors
    /// `ConnectionFailed` once the device closes the stream
    pub async fn next_line(&mut self) -> Result<String, DeviceError> {
        let res = async {
            loop {
                if let Some(line) = self.take_line() {
                    return Ok(line);
                }
                let bytes = self.connection.read_any(READ_SIZE).await?;
                if bytes.is_empty() {
                    return Err(DeviceError::ConnectionFailed(Arc::new(
                        std::io::ErrorKind::UnexpectedEof.into(),
                    )));
                }
                self.buffer.extend_from_slice(&bytes);
            }
        }
        .await;
        self.connection.record(res)
    }

    pub async fn close(&mut self) -> Result<(), DeviceError> {
        self.buffer.clear();
        self.connection.close().await
    }
}

/// Receives lines from a running relay
///
/// Called from the relay's own task, never from the caller's stack.
pub trait SyslogListener: Send + Sync {
    fn log_line(&self, line: &str);

    /// Called once when the stream stops on its own, with the reason
    fn relay_ended(&self, _error: &DeviceError) {}
}

impl<F> SyslogListener for F
where
    F: Fn(&str) + Send + Sync,
{
    fn log_line(&self, line: &str) {
        self(line)
    }
}

/// A relay that pushes every line to a listener from a background task
#[derive(Debug)]
pub struct SyslogRelay {
    task: JoinHandle<()>,
}

impl SyslogRelay {
    /// Starts delivering lines from `client` to `listener` in emission order
    pub fn spawn(mut client: SyslogRelayClient, listener: Arc<dyn SyslogListener>) -> Self {
        let task = tokio::spawn(async move {
            loop {
                match client.next_line().await {
                    Ok(line) => listener.log_line(&line),
                    Err(e) => {
                        debug!("Syslog relay stopped: {e}");
                        listener.relay_ended(&e);
                        break;
                    }
                }
            }
            if let Err(e) = client.close().await {
                warn!("Failed to close syslog relay: {e}");
            }
        });
        Self { task }
    }

    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    /// Stops the relay, dropping its connection
    pub fn close(self) {
        self.task.abort();
    }
}
