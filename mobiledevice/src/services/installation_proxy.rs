//! Installation proxy
//!
//! Queries the device's application registry and drives long running
//! installation operations. Every long operation streams status replies until
//! a final `Complete`; this client turns them into listener callbacks.
//!
//! The daemon treats a connection as one-shot: after a long running operation
//! the client refuses further requests, open a new one instead.

use std::{collections::HashMap, sync::Arc};

use plist::{Dictionary, Value};
use plist_macro::plist;
use tracing::{debug, warn};

use crate::{
    Application, DeviceError, ServiceClient, ServiceConnection, StagingError, services,
};

/// Where a long running operation is
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OperationState {
    Started,
    Continuing,
    /// Finished, successfully or not
    Completed(bool),
}

/// One progress report of a long running operation
#[derive(Clone, Debug)]
pub struct OperationProgress {
    /// The command, e.g. `Archive`
    pub command: String,
    pub state: OperationState,
    /// The device's status string, e.g. `CreatingStagingDirectory`
    pub status: Option<String>,
    pub percent: Option<u64>,
    pub error: Option<String>,
}

/// Receives progress of long running operations
///
/// Every method has an empty default so listeners implement only what they need.
pub trait InstallationProxyListener: Send + Sync {
    fn operation_started(&self, _progress: &OperationProgress) {}
    fn operation_continuing(&self, _progress: &OperationProgress) {}
    fn operation_completed(&self, _progress: &OperationProgress) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProxyState {
    Fresh,
    InUse,
    Used,
}

/// Client for the installation proxy service
pub struct InstallationProxyClient {
    connection: ServiceConnection,
    listener: Option<Arc<dyn InstallationProxyListener>>,
    state: ProxyState,
}

impl std::fmt::Debug for InstallationProxyClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstallationProxyClient")
            .field("connection", &self.connection)
            .field("state", &self.state)
            .field("has_listener", &self.listener.is_some())
            .finish()
    }
}

impl ServiceClient for InstallationProxyClient {
    fn service_name() -> &'static str {
        services::INSTALLATION_PROXY
    }

    async fn from_connection(connection: ServiceConnection) -> Result<Self, DeviceError> {
        Ok(Self::new(connection, None))
    }
}

fn archive_type(container: bool, payload: bool) -> Result<&'static str, DeviceError> {
    match (container, payload) {
        (true, true) => Ok("All"),
        (false, true) => Ok("ApplicationOnly"),
        (true, false) => Ok("DocumentsOnly"),
        (false, false) => Err(DeviceError::InvalidArgument(
            "an archive needs the container, the payload or both".into(),
        )),
    }
}

/// Error code and description installd reports when an archive is still
/// registered but its zip was deleted behind the daemon's back
const MISSING_ARCHIVE: (&str, &str) = ("APIInternalError", "Archive file does not exist");

fn is_missing_archive(e: &DeviceError) -> bool {
    let DeviceError::OperationFailed(s) = e else {
        return false;
    };
    s.split_once(": ")
        .is_some_and(|(code, desc)| (code, desc) == MISSING_ARCHIVE)
}

impl InstallationProxyClient {
    /// # Arguments
    /// * `connection` - A connection started for the installation proxy
    /// * `listener` - Receives progress of long running operations, if any
    pub fn new(
        connection: ServiceConnection,
        listener: Option<Arc<dyn InstallationProxyListener>>,
    ) -> Self {
        Self {
            connection,
            listener,
            state: ProxyState::Fresh,
        }
    }

    pub fn set_listener(&mut self, listener: Option<Arc<dyn InstallationProxyListener>>) {
        self.listener = listener;
    }

    pub fn last_error(&self) -> Option<&DeviceError> {
        self.connection.last_error()
    }

    fn ensure_fresh(&mut self) -> Result<(), DeviceError> {
        match self.state {
            ProxyState::Fresh => Ok(()),
            _ => self.connection.record(Err(DeviceError::AlreadyUsed)),
        }
    }

    /// Lists installed applications
    ///
    /// # Arguments
    /// * `application_type` - `User`, `System` or `Internal`; `None` for all of them
    pub async fn browse(
        &mut self,
        application_type: Option<&str>,
    ) -> Result<Vec<Application>, DeviceError> {
        self.ensure_fresh()?;
        let res = self.browse_inner(application_type).await;
        self.connection.record(res)
    }

    /// Lists every application and keeps those `predicate` accepts
    ///
    /// The predicate runs on the host, the device always returns the full list.
    pub async fn browse_filtered<P>(&mut self, predicate: P) -> Result<Vec<Application>, DeviceError>
    where
        P: Fn(&Application) -> bool,
    {
        self.ensure_fresh()?;
        let res = self
            .browse_inner(None)
            .await
            .map(|apps| apps.into_iter().filter(|app| predicate(app)).collect());
        self.connection.record(res)
    }

    async fn browse_inner(
        &mut self,
        application_type: Option<&str>,
    ) -> Result<Vec<Application>, DeviceError> {
        let mut options = Dictionary::new();
        if let Some(t) = application_type {
            options.insert("ApplicationType".into(), t.into());
        }
        self.connection
            .send_plist(plist!({
                "Command": "Browse",
                "ClientOptions": options,
            }))
            .await?;

        let mut apps = Vec::new();
        loop {
            let mut res = self.connection.read_plist().await?;

            if let Some(list) = res.remove("CurrentList").and_then(|x| x.into_array()) {
                apps.extend(
                    list.into_iter()
                        .filter_map(|v| v.into_dictionary())
                        .filter_map(Application::from_dictionary),
                );
            }

            match res.get("Status").and_then(|x| x.as_string()) {
                Some("Complete") => break,
                Some(_) => {}
                None => {
                    warn!("Browse reply without status");
                    return Err(DeviceError::ProtocolError("browse reply without Status".into()));
                }
            }
        }
        debug!("Browse returned {} applications", apps.len());
        Ok(apps)
    }

    /// Looks up applications of a type, keyed by bundle id
    ///
    /// With `attribute`, only applications whose Info.plist has that key are kept.
    pub async fn lookup_type(
        &mut self,
        application_type: &str,
        attribute: Option<&str>,
    ) -> Result<HashMap<String, Application>, DeviceError> {
        self.ensure_fresh()?;
        let res = async {
            let mut options = Dictionary::new();
            options.insert("ApplicationType".into(), application_type.into());
            if let Some(attribute) = attribute {
                options.insert("Attribute".into(), attribute.into());
            }
            self.connection
                .send_plist(plist!({
                    "Command": "Lookup",
                    "ClientOptions": options,
                }))
                .await?;
            let mut res = self.connection.read_plist().await?;
            let result = match res.remove("LookupResult") {
                Some(Value::Dictionary(d)) => d,
                _ => {
                    return Err(DeviceError::ProtocolError(
                        "Lookup reply without LookupResult".into(),
                    ));
                }
            };
            Ok(result
                .into_iter()
                .filter_map(|(id, v)| {
                    let app = Application::from_dictionary(v.into_dictionary()?)?;
                    match attribute {
                        Some(a) if !app.has_attribute(a) => None,
                        _ => Some((id, app)),
                    }
                })
                .collect())
        }
        .await;
        self.connection.record(res)
    }

    async fn lookup_archives(&mut self) -> Result<Dictionary, DeviceError> {
        self.connection
            .send_plist(plist!({
                "Command": "LookupArchives",
            }))
            .await?;
        let mut res = self.connection.read_plist().await?;
        match res.remove("LookupResult") {
            Some(Value::Dictionary(d)) => Ok(d),
            _ => Err(DeviceError::ProtocolError(
                "LookupArchives reply without LookupResult".into(),
            )),
        }
    }

    /// Bundle ids of the archives the daemon knows about
    pub async fn archived_app_bundle_ids(&mut self) -> Result<Vec<String>, DeviceError> {
        self.ensure_fresh()?;
        let res = self
            .lookup_archives()
            .await
            .map(|d| d.keys().cloned().collect());
        self.connection.record(res)
    }

    /// Archive metadata keyed by bundle id
    pub async fn archived_app_info(&mut self) -> Result<Dictionary, DeviceError> {
        self.ensure_fresh()?;
        let res = self.lookup_archives().await;
        self.connection.record(res)
    }

    /// Archives an application into `Media/ApplicationArchives`
    ///
    /// # Arguments
    /// * `container` - Include the documents and data
    /// * `payload` - Include the application itself
    /// * `uninstall` - Uninstall the application once archived
    pub async fn archive(
        &mut self,
        bundle_id: &str,
        container: bool,
        payload: bool,
        uninstall: bool,
    ) -> Result<(), DeviceError> {
        let kind = match archive_type(container, payload) {
            Ok(kind) => kind,
            Err(e) => return self.connection.record(Err(e)),
        };
        let request = plist!({
            "Command": "Archive",
            "ApplicationIdentifier": bundle_id,
            "ClientOptions": {
                "ArchiveType": kind,
                "SkipUninstall": !uninstall,
            },
        });
        self.run_operation("Archive", request).await
    }

    /// Restores a previously archived application
    pub async fn restore(&mut self, bundle_id: &str) -> Result<(), DeviceError> {
        let request = plist!({
            "Command": "Restore",
            "ApplicationIdentifier": bundle_id,
        });
        self.run_operation("Restore", request).await
    }

    /// Removes an archive from the daemon's registry and from disk
    ///
    /// # Errors
    /// `StagingFailed(ArchiveMissing)` if the daemon still lists the archive
    /// but its file has been removed
    pub async fn remove_archive(&mut self, bundle_id: &str) -> Result<(), DeviceError> {
        let request = plist!({
            "Command": "RemoveArchive",
            "ApplicationIdentifier": bundle_id,
        });
        let res = match self.run_operation("RemoveArchive", request).await {
            Err(e) if is_missing_archive(&e) => {
                Err(DeviceError::StagingFailed(StagingError::ArchiveMissing))
            }
            res => res,
        };
        self.connection.record(res)
    }

    /// Installs an expanded application from a directory below the media partition
    pub async fn install(&mut self, package_path: &str) -> Result<(), DeviceError> {
        let request = plist!({
            "Command": "Install",
            "PackagePath": package_path,
            "ClientOptions": {},
        });
        self.run_operation("Install", request).await
    }

    /// Replaces an installed application with the one at `package_path`
    pub async fn upgrade(&mut self, bundle_id: &str, package_path: &str) -> Result<(), DeviceError> {
        let request = plist!({
            "Command": "Upgrade",
            "PackagePath": package_path,
            "ClientOptions": {
                "CFBundleIdentifier": bundle_id,
            },
        });
        self.run_operation("Upgrade", request).await
    }

    pub async fn uninstall(&mut self, bundle_id: &str) -> Result<(), DeviceError> {
        let request = plist!({
            "Command": "Uninstall",
            "ApplicationIdentifier": bundle_id,
            "ClientOptions": {},
        });
        self.run_operation("Uninstall", request).await
    }

    pub async fn close(&mut self) -> Result<(), DeviceError> {
        self.connection.close().await
    }

    fn notify(&self, progress: &OperationProgress) {
        let Some(listener) = &self.listener else {
            return;
        };
        match progress.state {
            OperationState::Started => listener.operation_started(progress),
            OperationState::Continuing => listener.operation_continuing(progress),
            OperationState::Completed(_) => listener.operation_completed(progress),
        }
    }

    async fn run_operation(&mut self, command: &str, request: Value) -> Result<(), DeviceError> {
        self.ensure_fresh()?;
        self.state = ProxyState::InUse;

        let progress = |state: OperationState,
                        status: Option<String>,
                        percent: Option<u64>,
                        error: Option<String>| OperationProgress {
            command: command.to_string(),
            state,
            status,
            percent,
            error,
        };

        let res = match self.connection.send_plist(request).await {
            Ok(()) => {
                self.notify(&progress(OperationState::Started, None, None, None));
                self.watch_completion(command).await
            }
            Err(e) => Err(e),
        };
        self.state = ProxyState::Used;

        let error = res.as_ref().err().map(|e| e.to_string());
        self.notify(&progress(
            OperationState::Completed(res.is_ok()),
            None,
            Some(if res.is_ok() { 100 } else { 0 }),
            error,
        ));
        self.connection.record(res)
    }

    async fn watch_completion(&mut self, command: &str) -> Result<(), DeviceError> {
        loop {
            let mut res = self.connection.read_plist().await?;

            let status = res.remove("Status").and_then(|x| x.into_string());
            if status.as_deref() == Some("Complete") {
                debug!("{command} complete");
                return Ok(());
            }
            let percent = res
                .remove("PercentComplete")
                .and_then(|x| x.as_unsigned_integer());
            if status.is_none() && percent.is_none() {
                warn!("{command} reply without status: {res:?}");
                return Err(DeviceError::ProtocolError(format!(
                    "{command} reply without Status"
                )));
            }
            self.notify(&OperationProgress {
                command: command.to_string(),
                state: OperationState::Continuing,
                status,
                percent,
                error: None,
            });
        }
    }
}
