//! File relay
//!
//! Exports predefined groups of device files ("filesets") as one compressed
//! CPIO archive. The daemon stages the archive, acknowledges the request and
//! then streams the archive until it closes the connection, so a client can
//! only ever make a single request.

use std::{fmt, str::FromStr};

use plist::Value;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

use crate::{DeviceError, ServiceClient, ServiceConnection, services};

const READ_SIZE: usize = 64 * 1024;

/// The filesets the device knows how to stage
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FileSet {
    AppleSupport,
    Caches,
    CrashReporter,
    MobileWirelessSync,
    Lockdown,
    MobileInstallation,
    SafeHarbor,
    Network,
    SystemConfiguration,
    UserDatabases,
    Vpn,
    WiFi,
    Tmp,
    /// Every other set combined
    All,
}

impl FileSet {
    pub const EVERY: [FileSet; 14] = [
        FileSet::AppleSupport,
        FileSet::Caches,
        FileSet::CrashReporter,
        FileSet::MobileWirelessSync,
        FileSet::Lockdown,
        FileSet::MobileInstallation,
        FileSet::SafeHarbor,
        FileSet::Network,
        FileSet::SystemConfiguration,
        FileSet::UserDatabases,
        FileSet::Vpn,
        FileSet::WiFi,
        FileSet::Tmp,
        FileSet::All,
    ];

    /// Name used on the wire
    pub fn name(self) -> &'static str {
        match self {
            FileSet::AppleSupport => "AppleSupport",
            FileSet::Caches => "Caches",
            FileSet::CrashReporter => "CrashReporter",
            FileSet::MobileWirelessSync => "MobileWirelessSync",
            FileSet::Lockdown => "Lockdown",
            FileSet::MobileInstallation => "MobileInstallation",
            FileSet::SafeHarbor => "SafeHarbor",
            FileSet::Network => "Network",
            FileSet::SystemConfiguration => "SystemConfiguration",
            FileSet::UserDatabases => "UserDatabases",
            FileSet::Vpn => "VPN",
            FileSet::WiFi => "WiFi",
            FileSet::Tmp => "tmp",
            FileSet::All => "All",
        }
    }

    /// On-device paths the set stages
    pub fn paths(self) -> Vec<&'static str> {
        match self {
            FileSet::AppleSupport => vec!["/private/var/logs/AppleSupport"],
            FileSet::Caches => vec!["/private/var/mobile/Library/Caches"],
            FileSet::CrashReporter => vec![
                "/Library/Logs/CrashReporter",
                "/private/var/mobile/Library/Logs/CrashReporter",
            ],
            FileSet::MobileWirelessSync => {
                vec!["/private/var/mobile/Library/Logs/MobileWirelessSync"]
            }
            FileSet::Lockdown => vec![
                "/private/var/root/Library/Lockdown/activation_records",
                "/private/var/root/Library/Lockdown/data_ark.plist",
                "/private/var/root/Library/Lockdown/pair_records",
                "/Library/Logs/lockdownd.log",
            ],
            FileSet::MobileInstallation => vec![
                "/var/mobile/Library/Logs/MobileInstallation",
                "/var/mobile/Library/Caches/com.apple.mobile.installation.plist",
                "/var/mobile/Library/MobileInstallation/ArchivedApplications.plist",
                "/var/mobile/Library/MobileInstallation/ApplicationAttributes.plist",
                "/var/mobile/Library/MobileInstallation/SafeHarbor.plist",
            ],
            FileSet::SafeHarbor => vec!["/var/mobile/Library/SafeHarbor"],
            FileSet::Network => vec![
                "/private/var/log/ppp",
                "/private/var/log/racoon.log",
                "/var/log/eapolclient.en0.log",
            ],
            FileSet::SystemConfiguration => vec!["/Library/Preferences/SystemConfiguration"],
            FileSet::UserDatabases => vec![
                "/private/var/mobile/Library/AddressBook",
                "/private/var/mobile/Library/Calendar",
                "/private/var/mobile/Library/CallHistory",
                "/private/var/mobile/Library/Mail/Envelope Index",
                "/private/var/mobile/Library/SMS",
            ],
            FileSet::Vpn => vec!["/private/var/log/racoon.log"],
            FileSet::WiFi => vec![
                "/var/log/wifimanager.log",
                "/var/log/eapolclient.en0.log",
            ],
            FileSet::Tmp => vec!["/private/var/tmp"],
            FileSet::All => {
                let mut all: Vec<&'static str> = Self::EVERY
                    .iter()
                    .filter(|s| **s != FileSet::All)
                    .flat_map(|s| s.paths())
                    .collect();
                all.sort_unstable();
                all.dedup();
                all
            }
        }
    }
}

impl fmt::Display for FileSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for FileSet {
    type Err = DeviceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::EVERY
            .into_iter()
            .find(|set| set.name() == s)
            .ok_or_else(|| DeviceError::InvalidArgument(format!("unknown fileset {s}")))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RelayState {
    Fresh,
    InUse,
    Used,
}

/// Client for the file relay service. Good for exactly one request.
#[derive(Debug)]
pub struct FileRelayClient {
    connection: ServiceConnection,
    state: RelayState,
}

impl ServiceClient for FileRelayClient {
    fn service_name() -> &'static str {
        services::FILE_RELAY
    }

    async fn from_connection(connection: ServiceConnection) -> Result<Self, DeviceError> {
        Ok(Self::new(connection))
    }
}

impl FileRelayClient {
    pub fn new(connection: ServiceConnection) -> Self {
        Self {
            connection,
            state: RelayState::Fresh,
        }
    }

    pub fn last_error(&self) -> Option<&DeviceError> {
        self.connection.last_error()
    }

    /// Whether the single request has been made
    pub fn is_used(&self) -> bool {
        self.state != RelayState::Fresh
    }

    /// Stages the named sets on the device and streams the archive into `output`
    ///
    /// # Returns
    /// Number of archive bytes written
    ///
    /// # Errors
    /// - `AlreadyUsed` on every call after the first, without contacting the device
    /// - `InvalidArgument` if the device does not know a set name
    /// - `StagingFailed` with the stage that failed on the device
    pub async fn get_file_sets<W>(
        &mut self,
        names: &[&str],
        output: &mut W,
    ) -> Result<u64, DeviceError>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        if self.state != RelayState::Fresh {
            return self.connection.record(Err(DeviceError::AlreadyUsed));
        }
        self.state = RelayState::InUse;

        let res = self.relay(names, output).await;
        self.state = RelayState::Used;
        if let Err(e) = self.connection.close().await {
            warn!("Failed to close file relay: {e}");
        }
        self.connection.record(res)
    }

    /// Convenience for a single set
    pub async fn get_file_set<W>(&mut self, set: FileSet, output: &mut W) -> Result<u64, DeviceError>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        self.get_file_sets(&[set.name()], output).await
    }

    async fn relay<W>(&mut self, names: &[&str], output: &mut W) -> Result<u64, DeviceError>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        if names.is_empty() {
            return Err(DeviceError::InvalidArgument("no fileset requested".into()));
        }
        let sources = names.iter().map(|n| Value::from(*n)).collect::<Vec<_>>();
        let mut req = plist::Dictionary::new();
        req.insert("Sources".into(), Value::Array(sources));
        self.connection.send_plist(req.into()).await?;

        let res = self.connection.read_plist().await?;
        match res.get("Status").and_then(|s| s.as_string()) {
            Some("Acknowledged") => {}
            other => {
                warn!("File relay replied with status {other:?}");
                return Err(DeviceError::ProtocolError(format!(
                    "file relay status {other:?}"
                )));
            }
        }
        debug!("File relay acknowledged {names:?}, streaming archive");

        let mut written = 0u64;
        loop {
            let chunk = self.connection.read_any(READ_SIZE).await?;
            if chunk.is_empty() {
                break;
            }
            output.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        output.flush().await?;
        Ok(written)
    }
}
