//! AFC (Apple File Conduit) client
//!
//! One client drives one AFC connection. The same protocol is served by
//! several daemons on the device which only differ in the directory the paths
//! are resolved against, see [`AfcScope`].

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use errors::AfcError;
use file::FileTable;
use opcode::{AfcOpcode, LinkType};
use packet::AfcPacket;
use tracing::{debug, warn};

use crate::{DeviceError, ServiceClient, ServiceConnection, services};

mod copy;
pub mod errors;
pub mod file;
pub mod opcode;
pub mod packet;

pub use file::FileHandle;
pub use opcode::AfcFopenMode;

/// The magic number used in AFC protocol communications
pub const MAGIC: u64 = 0x4141504c36414643;

/// Largest chunk moved in a single read or write packet (64KB)
pub const MAX_TRANSFER: usize = 64 * 1024;

/// The directory an AFC connection is rooted at
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AfcScope {
    /// `/var/mobile/Media`
    Media,
    /// The crash report directory
    CrashLogs,
    /// The whole filesystem, only on jailbroken devices
    Root,
    /// An application's sandbox, vended through house arrest
    Application(String),
}

impl AfcScope {
    /// Name of the service that serves this scope
    pub fn service_name(&self) -> &'static str {
        match self {
            AfcScope::Media => services::AFC,
            AfcScope::CrashLogs => services::CRASH_REPORT_COPY,
            AfcScope::Root => services::AFC2,
            AfcScope::Application(_) => services::HOUSE_ARREST,
        }
    }
}

/// Client for the file protocol
#[derive(Debug)]
pub struct AfcClient {
    connection: ServiceConnection,
    packet_num: u64,
    scope: AfcScope,
    files: FileTable,
}

/// Kind of filesystem object
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FileType {
    Regular,
    Directory,
    CharDevice,
    BlockDevice,
    Symlink,
    Fifo,
    Socket,
    Other(String),
}

impl From<&str> for FileType {
    fn from(value: &str) -> Self {
        match value {
            "S_IFREG" => Self::Regular,
            "S_IFDIR" => Self::Directory,
            "S_IFCHR" => Self::CharDevice,
            "S_IFBLK" => Self::BlockDevice,
            "S_IFLNK" => Self::Symlink,
            "S_IFIFO" => Self::Fifo,
            "S_IFSOCK" => Self::Socket,
            other => Self::Other(other.to_string()),
        }
    }
}

/// Information about a file on the device
#[derive(Clone, Debug)]
pub struct FileInfo {
    pub file_type: FileType,
    /// Size of the file in bytes
    pub size: u64,
    /// Number of blocks allocated for the file
    pub blocks: u64,
    /// Number of hard links to the file
    pub nlink: u64,
    /// Target path if this is a symbolic link
    pub link_target: Option<String>,
    pub modified: Option<DateTime<Utc>>,
    pub birth: Option<DateTime<Utc>>,
}

impl FileInfo {
    pub fn is_dir(&self) -> bool {
        self.file_type == FileType::Directory
    }

    pub fn is_symlink(&self) -> bool {
        self.file_type == FileType::Symlink
    }
}

/// Information about the device's filesystem
#[derive(Clone, Debug)]
pub struct DeviceInfo {
    /// Device model identifier
    pub model: String,
    /// Total storage capacity in bytes
    pub total_bytes: u64,
    /// Free storage space in bytes
    pub free_bytes: u64,
    /// Filesystem block size in bytes
    pub block_size: u64,
}

impl ServiceClient for AfcClient {
    fn service_name() -> &'static str {
        services::AFC
    }

    async fn from_connection(connection: ServiceConnection) -> Result<Self, DeviceError> {
        Ok(Self::new(connection, AfcScope::Media))
    }
}

/// Joins a directory and an entry name with exactly one separator
pub(crate) fn join_path(dir: &str, name: &str) -> String {
    if dir.ends_with('/') {
        format!("{dir}{name}")
    } else {
        format!("{dir}/{name}")
    }
}

fn key_values(strings: Vec<String>) -> HashMap<String, String> {
    let mut chunks = strings.chunks_exact(2);
    let kvs = chunks
        .by_ref()
        .map(|chunk| (chunk[0].clone(), chunk[1].clone()))
        .collect();
    if !chunks.remainder().is_empty() {
        warn!("Dangling afc key: {:?}", chunks.remainder());
    }
    kvs
}

fn required_number(kvs: &mut HashMap<String, String>, key: &str) -> Result<u64, DeviceError> {
    kvs.remove(key)
        .and_then(|x| x.parse::<u64>().ok())
        .ok_or_else(|| DeviceError::ProtocolError(format!("missing afc attribute {key}")))
}

fn timestamp(kvs: &mut HashMap<String, String>, key: &str) -> Option<DateTime<Utc>> {
    kvs.remove(key)
        .and_then(|x| x.parse::<i64>().ok())
        .map(DateTime::from_timestamp_nanos)
}

impl AfcClient {
    /// Wraps a connection to an AFC daemon
    ///
    /// # Arguments
    /// * `connection` - A connection started for the scope's service
    /// * `scope` - Which directory the daemon serves
    pub fn new(connection: ServiceConnection, scope: AfcScope) -> Self {
        Self {
            connection,
            packet_num: 0,
            scope,
            files: FileTable::default(),
        }
    }

    pub fn scope(&self) -> &AfcScope {
        &self.scope
    }

    /// The error of the most recent operation on this client
    pub fn last_error(&self) -> Option<&DeviceError> {
        self.connection.last_error()
    }

    pub fn is_open(&self) -> bool {
        self.connection.is_open()
    }

    /// Sends one request and waits for its reply
    ///
    /// Status replies carrying an error are turned into `DeviceError`, with
    /// `path` naming the object the request was about.
    pub(crate) async fn request(
        &mut self,
        operation: AfcOpcode,
        header_payload: Vec<u8>,
        payload: Vec<u8>,
        path: &str,
    ) -> Result<AfcPacket, DeviceError> {
        let packet = AfcPacket::new(operation, self.packet_num, header_payload, payload);
        self.packet_num += 1;
        packet.write(&mut self.connection).await?;

        let res = AfcPacket::read(&mut self.connection).await?;
        if res.header.operation != AfcOpcode::Status {
            return Ok(res);
        }
        let e = AfcError::from(res.header_u64()?);
        match e {
            AfcError::Success => Ok(res),
            AfcError::ObjectNotFound => Err(DeviceError::PathNotFound(path.to_string())),
            AfcError::PermDenied => Err(DeviceError::PermissionDenied(path.to_string())),
            AfcError::InvalidArg => Err(DeviceError::InvalidArgument(format!(
                "{operation:?} rejected for {path}"
            ))),
            e => {
                debug!("{operation:?} on {path} failed with {e}");
                Err(DeviceError::Afc(e))
            }
        }
    }

    async fn path_request(
        &mut self,
        operation: AfcOpcode,
        path: &str,
    ) -> Result<AfcPacket, DeviceError> {
        self.request(operation, path.as_bytes().to_vec(), Vec::new(), path)
            .await
    }

    async fn list(&mut self, path: &str) -> Result<Vec<String>, DeviceError> {
        let res = self.path_request(AfcOpcode::ReadDir, path).await?;
        Ok(res
            .payload_strings()
            .into_iter()
            .filter(|s| s != "." && s != "..")
            .collect())
    }

    /// Lists the immediate children of a directory, without `.` and `..`
    pub async fn directory_contents(&mut self, path: &str) -> Result<Vec<String>, DeviceError> {
        let res = self.list(path).await;
        self.connection.record(res)
    }

    /// Lists every entry below a directory as full paths
    ///
    /// Directory entries end with `/`. Symbolic links are listed but never
    /// followed, and no directory is visited twice, so link cycles terminate.
    /// The first failing listing or stat aborts the walk.
    pub async fn recursive_directory_contents(
        &mut self,
        path: &str,
    ) -> Result<Vec<String>, DeviceError> {
        let res = self.walk(path).await;
        self.connection.record(res)
    }

    async fn walk(&mut self, path: &str) -> Result<Vec<String>, DeviceError> {
        let mut found = Vec::new();
        let mut visited = HashSet::new();
        let mut pending = vec![path.to_string()];

        while let Some(dir) = pending.pop() {
            if !visited.insert(dir.trim_end_matches('/').to_string()) {
                debug!("Skipping already visited {dir}");
                continue;
            }
            for name in self.list(&dir).await? {
                let full = join_path(&dir, &name);
                let info = self.stat(&full).await?;
                if info.is_dir() {
                    found.push(format!("{full}/"));
                    pending.push(full);
                } else {
                    found.push(full);
                }
            }
        }
        Ok(found)
    }

    /// Creates a directory
    pub async fn mkdir(&mut self, path: &str) -> Result<(), DeviceError> {
        let res = self.path_request(AfcOpcode::MakeDir, path).await.map(|_| ());
        self.connection.record(res)
    }

    /// Removes a file or an empty directory
    pub async fn unlink(&mut self, path: &str) -> Result<(), DeviceError> {
        let res = self
            .path_request(AfcOpcode::RemovePath, path)
            .await
            .map(|_| ());
        self.connection.record(res)
    }

    /// Removes a path and everything below it
    pub async fn remove_all(&mut self, path: &str) -> Result<(), DeviceError> {
        let res = self
            .path_request(AfcOpcode::RemovePathAndContents, path)
            .await
            .map(|_| ());
        self.connection.record(res)
    }

    /// Renames a file or directory
    pub async fn rename(&mut self, from: &str, to: &str) -> Result<(), DeviceError> {
        let mut header_payload = from.as_bytes().to_vec();
        header_payload.push(0);
        header_payload.extend(to.as_bytes());
        header_payload.push(0);

        let res = self
            .request(AfcOpcode::RenamePath, header_payload, Vec::new(), from)
            .await
            .map(|_| ());
        self.connection.record(res)
    }

    async fn make_link(
        &mut self,
        kind: LinkType,
        link_name: &str,
        target: &str,
    ) -> Result<(), DeviceError> {
        let mut header_payload = (kind as u64).to_le_bytes().to_vec();
        header_payload.extend(target.as_bytes());
        header_payload.push(0);
        header_payload.extend(link_name.as_bytes());
        header_payload.push(0);

        let res = self
            .request(AfcOpcode::MakeLink, header_payload, Vec::new(), link_name)
            .await
            .map(|_| ());
        self.connection.record(res)
    }

    /// Creates a hard link at `link_name` pointing to `target`
    pub async fn link(&mut self, link_name: &str, target: &str) -> Result<(), DeviceError> {
        self.make_link(LinkType::Hardlink, link_name, target).await
    }

    /// Creates a symbolic link at `link_name` pointing to `target`
    pub async fn symlink(&mut self, link_name: &str, target: &str) -> Result<(), DeviceError> {
        self.make_link(LinkType::Symlink, link_name, target).await
    }

    async fn stat(&mut self, path: &str) -> Result<FileInfo, DeviceError> {
        let res = self.path_request(AfcOpcode::GetFileInfo, path).await?;
        let mut kvs = key_values(res.payload_strings());

        let file_type = kvs
            .remove("st_ifmt")
            .map(|t| FileType::from(t.as_str()))
            .ok_or_else(|| DeviceError::ProtocolError("missing afc attribute st_ifmt".into()))?;
        let size = required_number(&mut kvs, "st_size")?;
        let blocks = required_number(&mut kvs, "st_blocks")?;
        let nlink = required_number(&mut kvs, "st_nlink")?;
        let link_target = kvs
            .remove("st_link_target")
            .or_else(|| kvs.remove("LinkTarget"));
        let modified = timestamp(&mut kvs, "st_mtime");
        let birth = timestamp(&mut kvs, "st_birthtime");

        if !kvs.is_empty() {
            debug!("Unused file info keys: {kvs:?}");
        }

        Ok(FileInfo {
            file_type,
            size,
            blocks,
            nlink,
            link_target,
            modified,
            birth,
        })
    }

    /// Retrieves type, size, block and link counts of a path
    ///
    /// # Errors
    /// `PathNotFound` if nothing exists at `path`
    pub async fn get_file_info(&mut self, path: &str) -> Result<FileInfo, DeviceError> {
        let res = self.stat(path).await;
        self.connection.record(res)
    }

    /// Checks whether something exists at `path`
    ///
    /// A missing path is a normal `false`, any other failure is an error.
    pub async fn file_exists(&mut self, path: &str) -> Result<bool, DeviceError> {
        let res = match self.stat(path).await {
            Ok(_) => Ok(true),
            Err(DeviceError::PathNotFound(_)) => Ok(false),
            Err(e) => Err(e),
        };
        self.connection.record(res)
    }

    /// Retrieves information about the device's filesystem
    pub async fn device_info(&mut self) -> Result<DeviceInfo, DeviceError> {
        let res = async {
            let res = self
                .request(AfcOpcode::GetDevInfo, Vec::new(), Vec::new(), "")
                .await?;
            let mut kvs = key_values(res.payload_strings());
            let model = kvs
                .remove("Model")
                .ok_or_else(|| DeviceError::ProtocolError("missing afc attribute Model".into()))?;
            Ok(DeviceInfo {
                model,
                total_bytes: required_number(&mut kvs, "FSTotalBytes")?,
                free_bytes: required_number(&mut kvs, "FSFreeBytes")?,
                block_size: required_number(&mut kvs, "FSBlockSize")?,
            })
        }
        .await;
        self.connection.record(res)
    }

    /// Closes the connection. Every open handle becomes invalid.
    pub async fn close(&mut self) -> Result<(), DeviceError> {
        let dropped = self.files.clear();
        if dropped > 0 {
            debug!("Closing afc connection with {dropped} open handles");
        }
        let res = self.connection.close().await;
        self.connection.record(res)
    }
}
