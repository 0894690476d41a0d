//! Process-wide registry of attached devices
//!
//! The registry subscribes to a [`DeviceWatcher`] (usbmuxd by default) the
//! first time it is needed and keeps the list of attached devices current.
//! Attach and detach events are passed to at most one [`DeviceListener`].

use std::{
    fmt::Debug,
    pin::Pin,
    sync::{
        Arc, Mutex, OnceLock, Weak,
        atomic::{AtomicBool, Ordering},
    },
};

use futures::{Stream, StreamExt};
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::{Device, DeviceConnector, DeviceError, connector::ConnectorFuture};

/// A device that just appeared
#[derive(Debug, Clone)]
pub struct AttachedDevice {
    pub udid: String,
    /// Identifier the watcher uses for this attachment
    pub device_id: u32,
    pub connector: Arc<dyn DeviceConnector>,
}

#[derive(Debug, Clone)]
pub enum DeviceEvent {
    Attached(AttachedDevice),
    /// The `device_id` of the attachment that went away
    Detached(u32),
}

pub type DeviceEventStream = Pin<Box<dyn Stream<Item = Result<DeviceEvent, DeviceError>> + Send>>;

/// Source of attach and detach events
pub trait DeviceWatcher: Send + Sync + Debug {
    /// Starts watching. Devices already attached are reported first.
    fn subscribe(&self) -> ConnectorFuture<'_, DeviceEventStream>;
}

/// Receives attach and detach events
///
/// Callbacks run on the registry's event task, not on the caller's stack.
/// The device list may change again right after a callback returns.
pub trait DeviceListener: Send + Sync {
    fn device_connected(&self, _device: &Device) {}
    fn device_disconnected(&self, _device: &Device) {}
}

#[cfg(not(feature = "usbmuxd"))]
#[derive(Debug)]
struct NoWatcher;

#[cfg(not(feature = "usbmuxd"))]
impl DeviceWatcher for NoWatcher {
    fn subscribe(&self) -> ConnectorFuture<'_, DeviceEventStream> {
        Box::pin(async {
            Err(DeviceError::SubscriptionError(
                "built without a device watcher".into(),
            ))
        })
    }
}

struct RegistryInner {
    watcher: Arc<dyn DeviceWatcher>,
    devices: Mutex<Vec<Device>>,
    listener: Mutex<Option<Arc<dyn DeviceListener>>>,
    subscribing: tokio::sync::Mutex<()>,
    watching: AtomicBool,
    last_error: Mutex<Option<DeviceError>>,
    attached: Notify,
}

/// The list of attached devices
#[derive(Clone)]
pub struct DeviceRegistry {
    inner: Arc<RegistryInner>,
}

impl Debug for DeviceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceRegistry")
            .field("watcher", &self.inner.watcher)
            .field("devices", &self.devices())
            .finish()
    }
}

static SHARED: OnceLock<DeviceRegistry> = OnceLock::new();

impl DeviceRegistry {
    /// The process-wide registry, watching usbmuxd
    ///
    /// Created on first use and never torn down. Tests should build their own
    /// with [`DeviceRegistry::new`] instead.
    pub fn shared() -> DeviceRegistry {
        SHARED.get_or_init(|| Self::new(default_watcher())).clone()
    }

    /// A registry fed by `watcher`
    pub fn new(watcher: Arc<dyn DeviceWatcher>) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                watcher,
                devices: Mutex::new(Vec::new()),
                listener: Mutex::new(None),
                subscribing: tokio::sync::Mutex::new(()),
                watching: AtomicBool::new(false),
                last_error: Mutex::new(None),
                attached: Notify::new(),
            }),
        }
    }

    /// Version string this library announces to usbmuxd
    pub fn client_version() -> &'static str {
        crate::CLIENT_VERSION
    }

    /// Error of the last subscription attempt or of the event stream
    pub fn last_error(&self) -> Option<DeviceError> {
        lock(&self.inner.last_error).clone()
    }

    fn record<T>(&self, res: Result<T, DeviceError>) -> Result<T, DeviceError> {
        *lock(&self.inner.last_error) = res.as_ref().err().cloned();
        res
    }

    /// Replaces the listener and makes sure events are flowing
    ///
    /// Passing `None` only removes the listener. Events that arrive while no
    /// listener is set are not replayed later.
    ///
    /// # Errors
    /// `SubscriptionError` if the watcher cannot be subscribed to
    pub async fn set_listener(
        &self,
        listener: Option<Arc<dyn DeviceListener>>,
    ) -> Result<(), DeviceError> {
        let subscribe = listener.is_some();
        *lock(&self.inner.listener) = listener;
        if subscribe {
            self.start().await
        } else {
            Ok(())
        }
    }

    /// Subscribes to the watcher unless already subscribed
    pub async fn start(&self) -> Result<(), DeviceError> {
        let _guard = self.inner.subscribing.lock().await;
        if self.is_watching() {
            return Ok(());
        }

        let res = match self.inner.watcher.subscribe().await {
            Ok(events) => {
                debug!("Subscribed to device events");
                self.inner.watching.store(true, Ordering::Release);
                tokio::spawn(run_events(Arc::downgrade(&self.inner), events));
                Ok(())
            }
            Err(e @ DeviceError::SubscriptionError(_)) => Err(e),
            Err(e) => Err(DeviceError::SubscriptionError(e.to_string())),
        };
        self.record(res)
    }

    /// Snapshot of the attached devices in discovery order
    pub fn devices(&self) -> Vec<Device> {
        lock(&self.inner.devices).clone()
    }

    /// Finds an attached device
    ///
    /// # Errors
    /// `DeviceNotFound` if no attached device has that udid
    pub fn device_with_udid(&self, udid: &str) -> Result<Device, DeviceError> {
        lock(&self.inner.devices)
            .iter()
            .find(|d| d.udid() == udid)
            .cloned()
            .ok_or(DeviceError::DeviceNotFound)
    }

    /// Forgets a device without touching its physical connection
    ///
    /// The device object refuses new requests afterwards.
    pub fn detach_device(&self, device: &Device) {
        lock(&self.inner.devices).retain(|d| !d.same_attachment(device));
        device.mark_detached();
    }

    /// Waits until at least one device is attached and returns the first
    pub async fn wait_for_connection(&self) -> Result<Device, DeviceError> {
        self.start().await?;
        loop {
            let attached = self.inner.attached.notified();
            if let Some(device) = lock(&self.inner.devices).first().cloned() {
                return Ok(device);
            }
            if !self.is_watching() {
                return Err(self.last_error().unwrap_or_else(|| {
                    DeviceError::SubscriptionError("device events ended".into())
                }));
            }
            attached.await;
        }
    }

    /// Whether device events are currently flowing
    pub fn is_watching(&self) -> bool {
        self.inner.watching.load(Ordering::Acquire)
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(feature = "usbmuxd")]
fn default_watcher() -> Arc<dyn DeviceWatcher> {
    use crate::usbmuxd::{UsbmuxdAddr, UsbmuxdWatcher};
    match UsbmuxdWatcher::from_env(crate::CLIENT_VERSION) {
        Ok(w) => Arc::new(w),
        Err(e) => {
            warn!("{e}, using the default usbmuxd address");
            Arc::new(UsbmuxdWatcher::new(
                UsbmuxdAddr::default(),
                crate::CLIENT_VERSION,
            ))
        }
    }
}

#[cfg(not(feature = "usbmuxd"))]
fn default_watcher() -> Arc<dyn DeviceWatcher> {
    Arc::new(NoWatcher)
}

/// Marks the registry as no longer watching when the event task ends,
/// including when a listener callback panics
struct WatchingGuard(Weak<RegistryInner>);

impl Drop for WatchingGuard {
    fn drop(&mut self) {
        if let Some(inner) = self.0.upgrade() {
            inner.watching.store(false, Ordering::Release);
            inner.attached.notify_waiters();
        }
    }
}

async fn run_events(registry: Weak<RegistryInner>, mut events: DeviceEventStream) {
    let _watching = WatchingGuard(registry.clone());
    while let Some(event) = events.next().await {
        let Some(inner) = registry.upgrade() else {
            debug!("Registry dropped, stopping device events");
            return;
        };
        let listener = lock(&inner.listener).clone();

        match event {
            Ok(DeviceEvent::Attached(attached)) => {
                let device = {
                    let mut devices = lock(&inner.devices);
                    if devices.iter().any(|d| d.device_id() == attached.device_id) {
                        debug!("Device {} already known", attached.udid);
                        continue;
                    }
                    let device = Device::new(attached.udid, attached.device_id, attached.connector);
                    devices.push(device.clone());
                    device
                };
                info!("Device attached: {}", device.udid());
                inner.attached.notify_waiters();
                if let Some(listener) = listener {
                    listener.device_connected(&device);
                }
            }
            Ok(DeviceEvent::Detached(device_id)) => {
                let device = lock(&inner.devices)
                    .iter()
                    .find(|d| d.device_id() == device_id)
                    .cloned();
                let Some(device) = device else {
                    debug!("Detach for unknown device {device_id}");
                    continue;
                };
                info!("Device detached: {}", device.udid());
                if let Some(listener) = listener {
                    listener.device_disconnected(&device);
                }
                lock(&inner.devices).retain(|d| !d.same_attachment(&device));
                device.mark_detached();
            }
            Err(e) => {
                warn!("Device event stream failed: {e}");
                *lock(&inner.last_error) = Some(e);
                break;
            }
        }
    }
}
