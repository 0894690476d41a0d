//! Notification proxy
//!
//! Posts notifications into the device's notification center and relays the
//! ones the host observes back over the same connection.
//!
//! Notifications that can be posted:
//!   - `com.apple.itunes-mobdev.syncWillStart`
//!   - `com.apple.itunes-mobdev.syncDidStart`
//!   - `com.apple.itunes-mobdev.syncDidFinish`
//!   - `com.apple.itunes-mobdev.syncLockRequest`
//!
//! Some that can be observed:
//!   - `com.apple.itunes-client.syncCancelRequest`
//!   - `com.apple.mobile.lockdown.device_name_changed`
//!   - `com.apple.mobile.lockdown.host_attached`
//!   - `com.apple.mobile.lockdown.host_detached`
//!   - `com.apple.mobile.application_installed`
//!   - `com.apple.mobile.application_uninstalled`

use std::{collections::HashMap, sync::Arc};

use plist_macro::plist;
use tracing::{debug, warn};

use crate::{DeviceError, ServiceClient, ServiceConnection, services};

/// Receives notifications relayed from the device
pub trait NotificationObserver: Send + Sync {
    fn notification_received(&self, name: &str);
}

impl<F> NotificationObserver for F
where
    F: Fn(&str) + Send + Sync,
{
    fn notification_received(&self, name: &str) {
        self(name)
    }
}

fn same_observer(a: &Arc<dyn NotificationObserver>, b: &Arc<dyn NotificationObserver>) -> bool {
    std::ptr::eq(Arc::as_ptr(a) as *const (), Arc::as_ptr(b) as *const ())
}

/// Client for the notification proxy service
pub struct NotificationProxyClient {
    connection: ServiceConnection,
    observers: HashMap<String, Vec<Arc<dyn NotificationObserver>>>,
}

impl std::fmt::Debug for NotificationProxyClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotificationProxyClient")
            .field("connection", &self.connection)
            .field("observed", &self.observers.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl ServiceClient for NotificationProxyClient {
    fn service_name() -> &'static str {
        services::NOTIFICATION_PROXY
    }

    async fn from_connection(connection: ServiceConnection) -> Result<Self, DeviceError> {
        Ok(Self::new(connection))
    }
}

impl NotificationProxyClient {
    pub fn new(connection: ServiceConnection) -> Self {
        Self {
            connection,
            observers: HashMap::new(),
        }
    }

    pub fn last_error(&self) -> Option<&DeviceError> {
        self.connection.last_error()
    }

    /// Posts a notification on the device. Nothing is sent back.
    pub async fn post_notification(&mut self, name: &str) -> Result<(), DeviceError> {
        let res = self
            .connection
            .send_plist(plist!({
                "Command": "PostNotification",
                "Name": name,
            }))
            .await;
        self.connection.record(res)
    }

    /// Registers an observer for one notification name
    ///
    /// The device is only asked to relay a name the first time it gets an
    /// observer.
    pub async fn add_observer(
        &mut self,
        name: &str,
        observer: Arc<dyn NotificationObserver>,
    ) -> Result<(), DeviceError> {
        if !self.observers.contains_key(name) {
            let res = self
                .connection
                .send_plist(plist!({
                    "Command": "ObserveNotification",
                    "Name": name,
                }))
                .await;
            self.connection.record(res)?;
        }
        self.observers
            .entry(name.to_string())
            .or_default()
            .push(observer);
        Ok(())
    }

    /// Removes an observer from one name, or from every name when `name` is `None`
    ///
    /// Returns how many registrations were removed.
    pub fn remove_observer(
        &mut self,
        observer: &Arc<dyn NotificationObserver>,
        name: Option<&str>,
    ) -> usize {
        let mut removed = 0;
        for (observed, list) in self.observers.iter_mut() {
            if name.is_some_and(|n| n != observed) {
                continue;
            }
            let before = list.len();
            list.retain(|o| !same_observer(o, observer));
            removed += before - list.len();
        }
        // the device keeps relaying these, they are just dropped on arrival
        self.observers.retain(|_, list| !list.is_empty());
        removed
    }

    /// Number of observers registered for `name`
    pub fn observer_count(&self, name: &str) -> usize {
        self.observers.get(name).map_or(0, Vec::len)
    }

    /// Waits for the next message and hands it to the observers of its name
    ///
    /// # Returns
    /// The name that was relayed, or `None` once the proxy has shut down
    pub async fn dispatch_next(&mut self) -> Result<Option<String>, DeviceError> {
        let res = self.connection.read_plist().await;
        let response = self.connection.record(res)?;

        match response.get("Command").and_then(|c| c.as_string()) {
            Some("RelayNotification") => {
                let name = match response.get("Name").and_then(|n| n.as_string()) {
                    Some(name) => name.to_string(),
                    None => {
                        let res = Err(DeviceError::ProtocolError(
                            "RelayNotification without Name".into(),
                        ));
                        return self.connection.record(res);
                    }
                };
                match self.observers.get(&name) {
                    Some(list) => {
                        for observer in list {
                            observer.notification_received(&name);
                        }
                    }
                    None => debug!("Dropping unobserved notification {name}"),
                }
                Ok(Some(name))
            }
            Some("ProxyDeath") => {
                debug!("Notification proxy shut down");
                Ok(None)
            }
            other => {
                warn!("Unexpected notification proxy command {other:?}");
                let res = Err(DeviceError::ProtocolError(format!(
                    "unexpected command {other:?}"
                )));
                self.connection.record(res)
            }
        }
    }

    /// Dispatches notifications until the proxy shuts down or the connection fails
    pub async fn run(&mut self) -> Result<(), DeviceError> {
        while self.dispatch_next().await?.is_some() {}
        Ok(())
    }

    /// Asks the proxy to shut down and waits for its acknowledgement
    ///
    /// Notifications the device relays before acknowledging still reach
    /// their observers.
    pub async fn shutdown(&mut self) -> Result<(), DeviceError> {
        let res = self
            .connection
            .send_plist(plist!({
                "Command": "Shutdown",
            }))
            .await;
        self.connection.record(res)?;
        loop {
            match self.dispatch_next().await {
                Ok(Some(name)) => debug!("Relayed {name} while shutting down"),
                Ok(None) => break,
                Err(e) => {
                    warn!("Notification proxy stopped without acknowledging shutdown: {e}");
                    break;
                }
            }
        }
        self.observers.clear();
        let res = self.connection.close().await;
        self.connection.record(res)
    }
}
