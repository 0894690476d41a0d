//! Service clients and the catalog of service names lockdownd knows about

pub mod afc;
pub mod file_relay;
pub mod house_arrest;
pub mod installation_proxy;
pub mod lockdown;
pub mod mobilesync;
pub mod notification_proxy;
pub mod springboardservices;
pub mod syslog_relay;

/// File conduit rooted at the media partition
pub const AFC: &str = "com.apple.afc";
/// File conduit rooted at `/`, only present on jailbroken devices
pub const AFC2: &str = "com.apple.afc2";
/// File conduit rooted at the crash report directory
pub const CRASH_REPORT_COPY: &str = "com.apple.crashreportcopymobile";
/// Vends application containers over the file conduit
pub const HOUSE_ARREST: &str = "com.apple.mobile.house_arrest";
pub const INSTALLATION_PROXY: &str = "com.apple.mobile.installation_proxy";
pub const SYSLOG_RELAY: &str = "com.apple.syslog_relay";
pub const NOTIFICATION_PROXY: &str = "com.apple.mobile.notification_proxy";
pub const FILE_RELAY: &str = "com.apple.mobile.file_relay";
/// SyncAgent, address book and other data class sync
pub const MOBILE_SYNC: &str = "com.apple.mobilesync";
pub const SPRINGBOARD_SERVICES: &str = "com.apple.springboardservices";

pub use afc::{AfcClient, AfcScope};
pub use file_relay::{FileRelayClient, FileSet};
pub use house_arrest::HouseArrestClient;
pub use installation_proxy::{
    InstallationProxyClient, InstallationProxyListener, OperationProgress, OperationState,
};
pub use lockdown::LockdownClient;
pub use mobilesync::MobileSyncClient;
pub use notification_proxy::{NotificationObserver, NotificationProxyClient};
pub use springboardservices::SpringBoardServicesClient;
pub use syslog_relay::{SyslogListener, SyslogRelay, SyslogRelayClient};
