//! One attached device and its lockdown session
//!
//! A [`Device`] is a cheap handle: clones share the same session. The
//! session to lockdownd is opened lazily on the first request and reused for
//! key/value queries and for starting services.

use std::{
    fmt::Debug,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
};

use plist::{Dictionary, Value};
use tracing::{debug, warn};

use crate::{
    Application, DeviceConnector, DeviceError, ServiceClient, ServiceConnection,
    pair_record::PairRecord,
    services::{
        self, AfcClient, AfcScope, FileRelayClient, HouseArrestClient, InstallationProxyClient,
        InstallationProxyListener, LockdownClient, MobileSyncClient, NotificationProxyClient,
        SpringBoardServicesClient, SyslogListener, SyslogRelay, SyslogRelayClient,
    },
};

/// Where the session with a device stands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    /// No lockdown connection yet, or the last one failed
    Disconnected,
    /// Connected to lockdownd without an authenticated session
    Connected,
    /// Authenticated session, services can be started
    InSession,
    /// Removed from the registry
    Detached,
}

/// Identifying values read from the root lockdown domain
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceIdentity {
    pub udid: String,
    pub device_name: String,
    pub product_type: String,
    pub device_class: String,
    pub serial_number: String,
    pub product_version: String,
}

impl DeviceIdentity {
    fn from_values(udid: &str, values: &Dictionary) -> Self {
        let get = |key: &str| {
            values
                .get(key)
                .and_then(|v| v.as_string())
                .unwrap_or_default()
                .to_string()
        };
        let reported = get("UniqueDeviceID");
        Self {
            udid: if reported.is_empty() {
                udid.to_string()
            } else {
                reported
            },
            device_name: get("DeviceName"),
            product_type: get("ProductType"),
            device_class: get("DeviceClass"),
            serial_number: get("SerialNumber"),
            product_version: get("ProductVersion"),
        }
    }
}

#[derive(Default)]
struct Session {
    lockdown: Option<LockdownClient>,
    pair_record: Option<PairRecord>,
    identity: Option<DeviceIdentity>,
}

struct DeviceInner {
    udid: String,
    device_id: u32,
    connector: Arc<dyn DeviceConnector>,
    session: tokio::sync::Mutex<Session>,
    last_error: Mutex<Option<DeviceError>>,
    detached: AtomicBool,
}

/// Handle to an attached device
#[derive(Clone)]
pub struct Device {
    inner: Arc<DeviceInner>,
}

impl Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("udid", &self.inner.udid)
            .field("device_id", &self.inner.device_id)
            .field("connector", &self.inner.connector)
            .field("detached", &self.is_detached())
            .finish()
    }
}

impl Device {
    /// Wraps a device reachable through `connector`
    ///
    /// The registry creates these from attach events. Build one directly to
    /// talk to a device the registry does not know about, such as a network
    /// device reached through a [`crate::connector::TcpConnector`].
    pub fn new(udid: impl Into<String>, device_id: u32, connector: Arc<dyn DeviceConnector>) -> Self {
        Self {
            inner: Arc::new(DeviceInner {
                udid: udid.into(),
                device_id,
                connector,
                session: tokio::sync::Mutex::new(Session::default()),
                last_error: Mutex::new(None),
                detached: AtomicBool::new(false),
            }),
        }
    }

    /// The udid reported when the device attached
    pub fn udid(&self) -> &str {
        &self.inner.udid
    }

    pub fn device_id(&self) -> u32 {
        self.inner.device_id
    }

    pub fn connector(&self) -> &Arc<dyn DeviceConnector> {
        &self.inner.connector
    }

    pub fn is_detached(&self) -> bool {
        self.inner.detached.load(Ordering::Acquire)
    }

    pub(crate) fn mark_detached(&self) {
        self.inner.detached.store(true, Ordering::Release);
    }

    pub(crate) fn same_attachment(&self, other: &Device) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner) || self.inner.device_id == other.inner.device_id
    }

    /// The error of the most recent request made through this handle
    pub fn last_error(&self) -> Option<DeviceError> {
        lock(&self.inner.last_error).clone()
    }

    fn record<T>(&self, res: Result<T, DeviceError>) -> Result<T, DeviceError> {
        *lock(&self.inner.last_error) = res.as_ref().err().cloned();
        res
    }

    pub async fn state(&self) -> DeviceState {
        if self.is_detached() {
            return DeviceState::Detached;
        }
        let session = self.inner.session.lock().await;
        match &session.lockdown {
            Some(l) if l.session_active() => DeviceState::InSession,
            Some(l) if l.is_open() => DeviceState::Connected,
            _ => DeviceState::Disconnected,
        }
    }

    /// Opens the lockdown session if it is not open yet
    ///
    /// # Errors
    /// * `DeviceNotFound` if the device was detached
    /// * `PairingRequired` if the host is not paired with the device
    pub async fn connect(&self) -> Result<(), DeviceError> {
        let res = async {
            let mut session = self.inner.session.lock().await;
            self.ensure_session(&mut session).await.map(|_| ())
        }
        .await;
        self.record(res)
    }

    async fn ensure_session<'a>(
        &self,
        session: &'a mut Session,
    ) -> Result<&'a mut LockdownClient, DeviceError> {
        if self.is_detached() {
            return Err(DeviceError::DeviceNotFound);
        }
        let alive = session
            .lockdown
            .as_ref()
            .is_some_and(|l| l.session_active() && l.is_open());
        if !alive {
            // a connection whose session was refused is kept for the next attempt
            if !session.lockdown.as_ref().is_some_and(LockdownClient::is_open) {
                session.lockdown = None;
            }
            let connector = self.inner.connector.as_ref();
            let pair_record = match &session.pair_record {
                Some(p) => p.clone(),
                None => {
                    let p = connector.pair_record().await?;
                    session.pair_record = Some(p.clone());
                    p
                }
            };

            if session.lockdown.is_none() {
                let mut lockdown = LockdownClient::connect(connector).await?;
                let kind = lockdown.query_type().await?;
                if kind != "com.apple.mobile.lockdown" {
                    warn!("Unexpected lockdown type `{kind}`");
                }
                session.lockdown = Some(lockdown);
            }
            let lockdown = session
                .lockdown
                .as_mut()
                .ok_or(DeviceError::NotConnected)?;
            lockdown.start_session(&pair_record, connector).await?;
            debug!("Session open with {}", self.inner.udid);
        }
        session
            .lockdown
            .as_mut()
            .ok_or(DeviceError::NotConnected)
    }

    /// Drops the lockdown session if the failure means it is unusable
    fn forget_broken_session(session: &mut Session, res: &Result<impl Sized, DeviceError>) {
        if matches!(
            res,
            Err(DeviceError::ConnectionFailed(_) | DeviceError::NotConnected)
        ) {
            session.lockdown = None;
        }
    }

    /// Reads one lockdown value
    ///
    /// # Arguments
    /// * `key` - e.g. "DeviceName" or "ProductVersion"
    /// * `domain` - `None` for the root domain
    ///
    /// # Errors
    /// `KeyNotFound` if the device has no such value
    pub async fn value_for_key(
        &self,
        key: &str,
        domain: Option<&str>,
    ) -> Result<Value, DeviceError> {
        let res = async {
            let mut session = self.inner.session.lock().await;
            let res = match self.ensure_session(&mut session).await {
                Ok(lockdown) => lockdown.get_value(Some(key), domain).await,
                Err(e) => Err(e),
            };
            Self::forget_broken_session(&mut session, &res);
            res
        }
        .await;
        self.record(res)
    }

    /// Reads every value of a domain
    pub async fn all_values(&self, domain: Option<&str>) -> Result<Dictionary, DeviceError> {
        let res = async {
            let mut session = self.inner.session.lock().await;
            let res = match self.ensure_session(&mut session).await {
                Ok(lockdown) => lockdown.get_value(None, domain).await,
                Err(e) => Err(e),
            };
            Self::forget_broken_session(&mut session, &res);
            match res? {
                Value::Dictionary(d) => Ok(d),
                _ => Err(DeviceError::ProtocolError(
                    "GetValue for a domain did not return a dictionary".into(),
                )),
            }
        }
        .await;
        self.record(res)
    }

    /// Identifying values, read once and cached for the session's lifetime
    pub async fn identity(&self) -> Result<DeviceIdentity, DeviceError> {
        if let Some(identity) = self.inner.session.lock().await.identity.clone() {
            return Ok(identity);
        }
        let values = self.all_values(None).await?;
        let identity = DeviceIdentity::from_values(&self.inner.udid, &values);
        self.inner.session.lock().await.identity = Some(identity.clone());
        Ok(identity)
    }

    pub async fn device_name(&self) -> Result<String, DeviceError> {
        Ok(self.identity().await?.device_name)
    }

    pub async fn product_type(&self) -> Result<String, DeviceError> {
        Ok(self.identity().await?.product_type)
    }

    pub async fn device_class(&self) -> Result<String, DeviceError> {
        Ok(self.identity().await?.device_class)
    }

    pub async fn serial_number(&self) -> Result<String, DeviceError> {
        Ok(self.identity().await?.serial_number)
    }

    pub async fn product_version(&self) -> Result<String, DeviceError> {
        Ok(self.identity().await?.product_version)
    }

    /// Starts a named service and connects to it
    ///
    /// The returned connection is already wrapped in TLS when the device
    /// asked for it.
    ///
    /// # Errors
    /// `ServiceUnavailable` if the device does not offer `name`
    pub async fn start_service(&self, name: &str) -> Result<ServiceConnection, DeviceError> {
        let res = async {
            let mut session = self.inner.session.lock().await;
            let res = match self.ensure_session(&mut session).await {
                Ok(lockdown) => lockdown.start_service(name).await,
                Err(e) => Err(e),
            };
            Self::forget_broken_session(&mut session, &res);
            let (port, ssl) = res?;
            debug!("Service {name} started on port {port}, ssl: {ssl}");

            let connector = self.inner.connector.as_ref();
            let mut connection = connector.connect(port).await?.with_service(name);
            if ssl {
                let pair_record = session
                    .pair_record
                    .as_ref()
                    .ok_or(DeviceError::NotConnected)?;
                connection.start_tls(connector, pair_record).await?;
            }
            Ok(connection)
        }
        .await;
        self.record(res)
    }

    /// Starts the service a client type speaks and wraps the connection
    pub async fn start_client<T: ServiceClient>(&self) -> Result<T, DeviceError> {
        let connection = self.start_service(T::service_name()).await?;
        let res = T::from_connection(connection).await;
        self.record(res)
    }

    /// File access rooted at the media directory
    pub async fn afc_media_directory(&self) -> Result<AfcClient, DeviceError> {
        self.afc(AfcScope::Media).await
    }

    /// File access rooted at the crash log directory
    pub async fn afc_crash_log_directory(&self) -> Result<AfcClient, DeviceError> {
        self.afc(AfcScope::CrashLogs).await
    }

    /// File access to the whole filesystem, only offered by jailbroken devices
    pub async fn afc_root_directory(&self) -> Result<AfcClient, DeviceError> {
        self.afc(AfcScope::Root).await
    }

    async fn afc(&self, scope: AfcScope) -> Result<AfcClient, DeviceError> {
        let connection = self.start_service(scope.service_name()).await?;
        Ok(AfcClient::new(connection, scope))
    }

    /// File access rooted at an app's container
    ///
    /// # Errors
    /// `InvalidArgument` if no app with that bundle id is installed
    pub async fn afc_application_directory(
        &self,
        bundle_id: &str,
    ) -> Result<AfcClient, DeviceError> {
        let connection = self.start_service(services::HOUSE_ARREST).await?;
        let res = HouseArrestClient::new(connection)
            .vend_container(bundle_id)
            .await;
        self.record(res)
    }

    pub async fn notification_proxy(&self) -> Result<NotificationProxyClient, DeviceError> {
        self.start_client().await
    }

    pub async fn springboard_services(&self) -> Result<SpringBoardServicesClient, DeviceError> {
        self.start_client().await
    }

    /// A SyncAgent client that has finished the DeviceLink handshake
    pub async fn mobile_sync(&self) -> Result<MobileSyncClient, DeviceError> {
        self.start_client().await
    }

    /// A file relay client. Each one serves a single request.
    pub async fn file_relay(&self) -> Result<FileRelayClient, DeviceError> {
        self.start_client().await
    }

    pub async fn installation_proxy(
        &self,
        listener: Option<Arc<dyn InstallationProxyListener>>,
    ) -> Result<InstallationProxyClient, DeviceError> {
        let connection = self.start_service(services::INSTALLATION_PROXY).await?;
        Ok(InstallationProxyClient::new(connection, listener))
    }

    /// Starts relaying the system log to `listener`
    pub async fn syslog_relay(
        &self,
        listener: Arc<dyn SyslogListener>,
    ) -> Result<SyslogRelay, DeviceError> {
        let client: SyslogRelayClient = self.start_client().await?;
        Ok(SyslogRelay::spawn(client, listener))
    }

    /// User-installed applications
    pub async fn installed_applications(&self) -> Result<Vec<Application>, DeviceError> {
        let mut proxy = self.installation_proxy(None).await?;
        let res = proxy.browse(Some("User")).await;
        let res = self.record(res);
        if let Err(e) = proxy.close().await {
            debug!("Failed to close installation proxy: {e}");
        }
        res
    }

    /// Finds an installed application of any type by bundle id
    pub async fn installed_application_with_id(
        &self,
        bundle_id: &str,
    ) -> Result<Option<Application>, DeviceError> {
        let mut proxy = self.installation_proxy(None).await?;
        let res = proxy
            .browse_filtered(|app| app.bundle_id() == bundle_id)
            .await
            .map(|apps| apps.into_iter().next());
        let res = self.record(res);
        if let Err(e) = proxy.close().await {
            debug!("Failed to close installation proxy: {e}");
        }
        res
    }

    /// Ends the lockdown session. The next request opens a new one.
    pub async fn disconnect(&self) -> Result<(), DeviceError> {
        let mut session = self.inner.session.lock().await;
        match session.lockdown.take() {
            Some(mut lockdown) => lockdown.close().await,
            None => Ok(()),
        }
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
