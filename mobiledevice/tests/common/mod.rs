//! In-process stand-ins for the daemons of a device
//!
//! Every fake talks over one end of a `tokio::io::duplex` pipe and the client
//! under test gets the other end, so the real wire code runs on both sides.

#![allow(dead_code)]

use std::{
    collections::{BTreeMap, HashMap},
    fmt,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
};

use mobiledevice::{
    DeviceConnector, DeviceError, ServiceConnection, ServiceSocket,
    connector::ConnectorFuture,
    pair_record::PairRecord,
    services::afc::{
        AfcClient, AfcScope,
        errors::AfcError,
        opcode::{AfcFopenMode, AfcOpcode},
        packet::AfcPacket,
    },
};
use plist::{Dictionary, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

const PIPE_SIZE: usize = 1024 * 1024;

pub fn pipe() -> (ServiceConnection, DuplexStream) {
    let (client, server) = tokio::io::duplex(PIPE_SIZE);
    (ServiceConnection::new(Box::new(client), "tests"), server)
}

pub fn dict(pairs: &[(&str, Value)]) -> Dictionary {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

// ---------------------------------------------------------------------------
// afcd

#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    File(Vec<u8>),
    Dir,
    Symlink(String),
}

#[derive(Debug, Clone, PartialEq)]
enum Entry {
    /// Inode number; hard links share one
    File(u64),
    Dir,
    Symlink(String),
}

/// A flat map from absolute path to entry, with file contents kept per inode
#[derive(Debug)]
pub struct FakeFs {
    entries: BTreeMap<String, Entry>,
    inodes: HashMap<u64, Vec<u8>>,
    next_inode: u64,
}

pub type SharedFs = Arc<Mutex<FakeFs>>;

impl Default for FakeFs {
    fn default() -> Self {
        let mut entries = BTreeMap::new();
        entries.insert("/".to_string(), Entry::Dir);
        Self {
            entries,
            inodes: HashMap::new(),
            next_inode: 0,
        }
    }
}

pub fn normalize(path: &str) -> String {
    let parts: Vec<&str> = path
        .split('/')
        .filter(|p| !p.is_empty() && *p != ".")
        .collect();
    format!("/{}", parts.join("/"))
}

fn parent(path: &str) -> String {
    match path.rsplit_once('/') {
        Some(("", _)) | None => "/".to_string(),
        Some((p, _)) => p.to_string(),
    }
}

fn is_below(path: &str, dir: &str) -> bool {
    (dir == "/" && path != "/") || path.starts_with(&format!("{dir}/"))
}

impl FakeFs {
    pub fn shared() -> SharedFs {
        Arc::new(Mutex::new(Self::default()))
    }

    pub fn insert(&mut self, path: &str, node: Node) {
        let entry = match node {
            Node::File(data) => Entry::File(self.new_inode(data)),
            Node::Dir => Entry::Dir,
            Node::Symlink(target) => Entry::Symlink(target),
        };
        self.entries.insert(normalize(path), entry);
    }

    pub fn get(&self, path: &str) -> Option<Node> {
        Some(match self.entries.get(&normalize(path))? {
            Entry::File(inode) => Node::File(self.inodes.get(inode).cloned().unwrap_or_default()),
            Entry::Dir => Node::Dir,
            Entry::Symlink(target) => Node::Symlink(target.clone()),
        })
    }

    fn new_inode(&mut self, data: Vec<u8>) -> u64 {
        self.next_inode += 1;
        self.inodes.insert(self.next_inode, data);
        self.next_inode
    }

    fn link_count(&self, inode: u64) -> usize {
        self.entries
            .values()
            .filter(|e| **e == Entry::File(inode))
            .count()
    }

    fn is_dir(&self, path: &str) -> bool {
        matches!(self.entries.get(path), Some(Entry::Dir))
    }

    fn children(&self, dir: &str) -> Vec<String> {
        self.entries
            .keys()
            .filter(|k| k.as_str() != dir && parent(k) == dir)
            .filter_map(|k| k.rsplit('/').next().map(str::to_string))
            .collect()
    }

    fn parent_is_dir(&self, path: &str) -> bool {
        self.is_dir(&parent(path))
    }
}

/// Open descriptors refer to the inode, so they survive renames and unlinks
struct OpenFile {
    inode: u64,
    pos: u64,
}

struct Afcd {
    fs: SharedFs,
    fds: HashMap<u64, OpenFile>,
    next_fd: u64,
}

type Reply = Result<(AfcOpcode, Vec<u8>, Vec<u8>), AfcError>;

fn ok() -> Reply {
    Ok((AfcOpcode::Status, 0u64.to_le_bytes().to_vec(), Vec::new()))
}

fn field(bytes: &[u8], i: usize) -> u64 {
    u64::from_le_bytes(bytes[i * 8..i * 8 + 8].try_into().unwrap())
}

fn strings(bytes: &[u8]) -> Vec<String> {
    bytes
        .split(|b| *b == 0)
        .filter(|s| !s.is_empty())
        .map(|s| String::from_utf8_lossy(s).into_owned())
        .collect()
}

fn path_arg(bytes: &[u8]) -> String {
    normalize(strings(bytes).first().map(String::as_str).unwrap_or("/"))
}

fn key_values(pairs: &[(&str, String)]) -> Vec<u8> {
    let mut out = Vec::new();
    for (k, v) in pairs {
        out.extend(k.as_bytes());
        out.push(0);
        out.extend(v.as_bytes());
        out.push(0);
    }
    out
}

impl Afcd {
    fn handle(&mut self, req: &AfcPacket) -> Reply {
        let hp = &req.header_payload;
        let mut fs = self.fs.lock().unwrap();
        match req.header.operation {
            AfcOpcode::ReadDir => {
                let path = path_arg(hp);
                if !fs.is_dir(&path) {
                    return Err(AfcError::ObjectNotFound);
                }
                let mut payload = b".\0..\0".to_vec();
                for name in fs.children(&path) {
                    payload.extend(name.as_bytes());
                    payload.push(0);
                }
                Ok((AfcOpcode::Data, Vec::new(), payload))
            }
            AfcOpcode::GetFileInfo => {
                let path = path_arg(hp);
                let kvs = match fs.entries.get(&path).ok_or(AfcError::ObjectNotFound)? {
                    Entry::File(inode) => {
                        let len = fs.inodes.get(inode).map_or(0, Vec::len);
                        vec![
                            ("st_size", len.to_string()),
                            ("st_blocks", len.div_ceil(512).to_string()),
                            ("st_nlink", fs.link_count(*inode).to_string()),
                            ("st_ifmt", "S_IFREG".to_string()),
                            ("st_mtime", "1700000000000000000".to_string()),
                            ("st_birthtime", "1690000000000000000".to_string()),
                        ]
                    }
                    Entry::Dir => vec![
                        ("st_size", "64".to_string()),
                        ("st_blocks", "0".to_string()),
                        ("st_nlink", "2".to_string()),
                        ("st_ifmt", "S_IFDIR".to_string()),
                    ],
                    Entry::Symlink(target) => vec![
                        ("st_size", target.len().to_string()),
                        ("st_blocks", "0".to_string()),
                        ("st_nlink", "1".to_string()),
                        ("st_ifmt", "S_IFLNK".to_string()),
                        ("st_link_target", target.clone()),
                    ],
                };
                Ok((AfcOpcode::Data, Vec::new(), key_values(&kvs)))
            }
            AfcOpcode::GetDevInfo => Ok((
                AfcOpcode::Data,
                Vec::new(),
                key_values(&[
                    ("Model", "iPhone10,3".to_string()),
                    ("FSTotalBytes", "64000000000".to_string()),
                    ("FSFreeBytes", "32000000000".to_string()),
                    ("FSBlockSize", "4096".to_string()),
                ]),
            )),
            AfcOpcode::MakeDir => {
                let path = path_arg(hp);
                if fs.entries.contains_key(&path) {
                    return Err(AfcError::ObjectExists);
                }
                if !fs.parent_is_dir(&path) {
                    return Err(AfcError::ObjectNotFound);
                }
                fs.entries.insert(path, Entry::Dir);
                ok()
            }
            AfcOpcode::RemovePath => {
                let path = path_arg(hp);
                if !fs.entries.contains_key(&path) {
                    return Err(AfcError::ObjectNotFound);
                }
                if !fs.children(&path).is_empty() {
                    return Err(AfcError::DirNotEmpty);
                }
                fs.entries.remove(&path);
                ok()
            }
            AfcOpcode::RemovePathAndContents => {
                let path = path_arg(hp);
                if !fs.entries.contains_key(&path) {
                    return Err(AfcError::ObjectNotFound);
                }
                fs.entries.retain(|k, _| k != &path && !is_below(k, &path));
                ok()
            }
            AfcOpcode::RenamePath => {
                let args = strings(hp);
                let (from, to) = (normalize(&args[0]), normalize(&args[1]));
                if !fs.entries.contains_key(&from) {
                    return Err(AfcError::ObjectNotFound);
                }
                let moved: Vec<String> = fs
                    .entries
                    .keys()
                    .filter(|k| **k == from || is_below(k, &from))
                    .cloned()
                    .collect();
                for old in moved {
                    let entry = fs.entries.remove(&old).unwrap();
                    let new = format!("{to}{}", &old[from.len()..]);
                    fs.entries.insert(new, entry);
                }
                ok()
            }
            AfcOpcode::MakeLink => {
                let kind = field(hp, 0);
                let args = strings(&hp[8..]);
                let (target, link) = (args[0].clone(), normalize(&args[1]));
                if fs.entries.contains_key(&link) {
                    return Err(AfcError::ObjectExists);
                }
                let entry = if kind == 2 {
                    Entry::Symlink(target)
                } else {
                    match fs.entries.get(&normalize(&target)) {
                        Some(Entry::File(inode)) => Entry::File(*inode),
                        _ => return Err(AfcError::ObjectNotFound),
                    }
                };
                fs.entries.insert(link, entry);
                ok()
            }
            AfcOpcode::FileOpen => {
                let mode = AfcFopenMode::try_from(field(hp, 0)).map_err(|_| AfcError::InvalidArg)?;
                let path = path_arg(&hp[8..]);
                let inode = match (fs.entries.get(&path).cloned(), mode) {
                    (Some(Entry::Dir), _) => return Err(AfcError::ObjectIsDir),
                    (Some(Entry::Symlink(_)), _) => return Err(AfcError::ObjectNotFound),
                    (Some(Entry::File(inode)), AfcFopenMode::WrOnly | AfcFopenMode::Wr) => {
                        fs.inodes.insert(inode, Vec::new());
                        inode
                    }
                    (Some(Entry::File(inode)), _) => inode,
                    (None, AfcFopenMode::RdOnly) => return Err(AfcError::ObjectNotFound),
                    (None, _) => {
                        if !fs.parent_is_dir(&path) {
                            return Err(AfcError::ObjectNotFound);
                        }
                        let inode = fs.new_inode(Vec::new());
                        fs.entries.insert(path, Entry::File(inode));
                        inode
                    }
                };
                self.next_fd += 1;
                self.fds.insert(self.next_fd, OpenFile { inode, pos: 0 });
                Ok((
                    AfcOpcode::FileOpenRes,
                    self.next_fd.to_le_bytes().to_vec(),
                    Vec::new(),
                ))
            }
            AfcOpcode::Read => {
                let file = self.fds.get_mut(&field(hp, 0)).ok_or(AfcError::InvalidArg)?;
                let data = fs.inodes.get(&file.inode).ok_or(AfcError::ObjectNotFound)?;
                let start = (file.pos as usize).min(data.len());
                let end = (start + field(hp, 1) as usize).min(data.len());
                file.pos = end as u64;
                Ok((AfcOpcode::Data, Vec::new(), data[start..end].to_vec()))
            }
            AfcOpcode::Write => {
                let file = self.fds.get_mut(&field(hp, 0)).ok_or(AfcError::InvalidArg)?;
                let data = fs
                    .inodes
                    .get_mut(&file.inode)
                    .ok_or(AfcError::ObjectNotFound)?;
                let start = file.pos as usize;
                let end = start + req.payload.len();
                if data.len() < end {
                    data.resize(end, 0);
                }
                data[start..end].copy_from_slice(&req.payload);
                file.pos = end as u64;
                ok()
            }
            AfcOpcode::FileSeek => {
                let file = self.fds.get_mut(&field(hp, 0)).ok_or(AfcError::InvalidArg)?;
                let len = fs.inodes.get(&file.inode).map_or(0, Vec::len) as i64;
                let offset = field(hp, 2) as i64;
                let base = match field(hp, 1) {
                    0 => 0,
                    1 => file.pos as i64,
                    _ => len,
                };
                let pos = base + offset;
                if pos < 0 {
                    return Err(AfcError::InvalidArg);
                }
                file.pos = pos as u64;
                ok()
            }
            AfcOpcode::FileTell => {
                let file = self.fds.get(&field(hp, 0)).ok_or(AfcError::InvalidArg)?;
                Ok((
                    AfcOpcode::FileTellRes,
                    file.pos.to_le_bytes().to_vec(),
                    Vec::new(),
                ))
            }
            AfcOpcode::FileSetSize => {
                let file = self.fds.get(&field(hp, 0)).ok_or(AfcError::InvalidArg)?;
                let data = fs
                    .inodes
                    .get_mut(&file.inode)
                    .ok_or(AfcError::ObjectNotFound)?;
                data.resize(field(hp, 1) as usize, 0);
                ok()
            }
            AfcOpcode::FileClose => {
                self.fds.remove(&field(hp, 0)).ok_or(AfcError::InvalidArg)?;
                ok()
            }
            _ => Err(AfcError::UnknownPacketType),
        }
    }
}

/// Serves the AFC protocol over `socket` until the client hangs up
pub fn spawn_afcd(socket: DuplexStream, fs: SharedFs) {
    tokio::spawn(async move {
        let mut conn = ServiceConnection::new(Box::new(socket), "afcd");
        let mut afcd = Afcd {
            fs,
            fds: HashMap::new(),
            next_fd: 2,
        };
        while let Ok(req) = AfcPacket::read(&mut conn).await {
            let reply = match afcd.handle(&req) {
                Ok((op, header_payload, payload)) => {
                    AfcPacket::new(op, req.header.packet_num, header_payload, payload)
                }
                Err(e) => AfcPacket::new(
                    AfcOpcode::Status,
                    req.header.packet_num,
                    e.code().to_le_bytes().to_vec(),
                    Vec::new(),
                ),
            };
            if reply.write(&mut conn).await.is_err() {
                return;
            }
        }
    });
}

pub fn afc_client(fs: &SharedFs) -> AfcClient {
    let (client, server) = pipe();
    spawn_afcd(server, fs.clone());
    AfcClient::new(client, AfcScope::Media)
}

/// house_arrest that vends `bundle_id` and then serves AFC on the same socket
pub fn spawn_house_arrest(mut socket: DuplexStream, fs: SharedFs, bundle_id: &'static str) {
    tokio::spawn(async move {
        let mut len = [0u8; 4];
        if socket.read_exact(&mut len).await.is_err() {
            return;
        }
        let mut body = vec![0u8; u32::from_be_bytes(len) as usize];
        if socket.read_exact(&mut body).await.is_err() {
            return;
        }
        let req: Dictionary = plist::from_bytes(&body).unwrap();
        let vended = req.get("Identifier").and_then(|i| i.as_string()) == Some(bundle_id);
        let reply = if vended {
            dict(&[("Status", "Complete".into())])
        } else {
            dict(&[("Error", "ApplicationLookupFailed".into())])
        };
        let mut out = Vec::new();
        Value::Dictionary(reply).to_writer_xml(&mut out).unwrap();
        let mut frame = (out.len() as u32).to_be_bytes().to_vec();
        frame.extend(out);
        if socket.write_all(&frame).await.is_err() || !vended {
            return;
        }
        spawn_afcd(socket, fs);
    });
}

// ---------------------------------------------------------------------------
// plist daemons

/// Reads plist requests and answers each with whatever `respond` returns
///
/// `respond` gets the connection so it may send several replies or raw bytes.
pub fn spawn_plist_daemon<F>(socket: DuplexStream, mut respond: F)
where
    F: FnMut(Dictionary, &mut Vec<Outgoing>) + Send + 'static,
{
    tokio::spawn(async move {
        let mut conn = ServiceConnection::new(Box::new(socket), "daemon");
        while let Ok(req) = conn.read_plist_raw().await {
            let mut out = Vec::new();
            respond(req, &mut out);
            for msg in out {
                let sent = match msg {
                    Outgoing::Plist(d) => conn.send_plist(Value::Dictionary(d)).await,
                    Outgoing::Raw(bytes) => conn.send_raw(&bytes).await,
                    Outgoing::Hangup => {
                        let _ = conn.close().await;
                        return;
                    }
                };
                if sent.is_err() {
                    return;
                }
            }
        }
    });
}

pub enum Outgoing {
    Plist(Dictionary),
    Raw(Vec<u8>),
    Hangup,
}

pub fn app(bundle_id: &str, name: &str, kind: &str) -> Value {
    Value::Dictionary(dict(&[
        ("CFBundleIdentifier", bundle_id.into()),
        ("CFBundleDisplayName", name.into()),
        ("ApplicationType", kind.into()),
        ("Path", format!("/private/var/containers/Bundle/{name}.app").into()),
        ("CFBundleShortVersionString", "1.0".into()),
    ]))
}

pub fn installed_apps() -> Vec<Value> {
    vec![
        app("com.example.notes", "Notes", "User"),
        app("com.example.maps", "Maps", "User"),
        app("com.example.camera", "Camera", "User"),
        app("com.apple.Preferences", "Settings", "System"),
    ]
}

/// installation_proxy with a fixed set of installed applications
pub fn spawn_installation_proxy(socket: DuplexStream) {
    spawn_plist_daemon(socket, |req, out| {
        let command = req.get("Command").and_then(|c| c.as_string()).unwrap_or("");
        let options = req
            .get("ClientOptions")
            .and_then(|o| o.as_dictionary())
            .cloned()
            .unwrap_or_default();
        let kind = options
            .get("ApplicationType")
            .and_then(|t| t.as_string())
            .map(str::to_string);
        let matching: Vec<Value> = installed_apps()
            .into_iter()
            .filter(|a| {
                kind.as_deref().is_none_or(|k| {
                    a.as_dictionary()
                        .and_then(|d| d.get("ApplicationType"))
                        .and_then(|t| t.as_string())
                        == Some(k)
                })
            })
            .collect();

        match command {
            "Browse" => {
                let (first, second) = matching.split_at(matching.len() / 2);
                for page in [first, second] {
                    out.push(Outgoing::Plist(dict(&[
                        ("Status", "BrowsingApplications".into()),
                        ("CurrentList", Value::Array(page.to_vec())),
                    ])));
                }
                out.push(Outgoing::Plist(dict(&[("Status", "Complete".into())])));
            }
            "Lookup" => {
                let result = matching
                    .into_iter()
                    .filter_map(|a| {
                        let id = a
                            .as_dictionary()?
                            .get("CFBundleIdentifier")?
                            .as_string()?
                            .to_string();
                        Some((id, a))
                    })
                    .collect::<Dictionary>();
                out.push(Outgoing::Plist(dict(&[(
                    "LookupResult",
                    Value::Dictionary(result),
                )])));
            }
            "LookupArchives" => {
                out.push(Outgoing::Plist(dict(&[(
                    "LookupResult",
                    Value::Dictionary(dict(&[(
                        "com.example.notes",
                        Value::Dictionary(dict(&[("ArchiveType", "All".into())])),
                    )])),
                )])));
            }
            "Install" | "Upgrade" | "Archive" | "Restore" | "Uninstall" => {
                for (status, percent) in [("CreatingStagingDirectory", 5u64), ("InstallingApplication", 60)] {
                    out.push(Outgoing::Plist(dict(&[
                        ("Status", status.into()),
                        ("PercentComplete", percent.into()),
                    ])));
                }
                out.push(Outgoing::Plist(dict(&[("Status", "Complete".into())])));
            }
            "RemoveArchive" => {
                out.push(Outgoing::Plist(dict(&[
                    ("Error", "APIInternalError".into()),
                    ("ErrorDescription", "Archive file does not exist".into()),
                ])));
            }
            _ => out.push(Outgoing::Plist(dict(&[("Error", "UnknownCommand".into())]))),
        }
    });
}

pub const FAKE_ARCHIVE: &[u8] = b"\x1f\x8b\x08\x00fake cpio archive";

/// file_relay that stages everything except CrashReporter, which comes up empty
pub fn spawn_file_relay(socket: DuplexStream) {
    spawn_plist_daemon(socket, |req, out| {
        let sources: Vec<String> = req
            .get("Sources")
            .and_then(|s| s.as_array())
            .map(|a| {
                a.iter()
                    .filter_map(|v| v.as_string().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();
        if sources.iter().any(|s| s.parse::<mobiledevice::FileSet>().is_err()) {
            out.push(Outgoing::Plist(dict(&[("Error", "InvalidSource".into())])));
        } else if sources.iter().any(|s| s == "CrashReporter") {
            out.push(Outgoing::Plist(dict(&[("Error", "StagingEmpty".into())])));
        } else {
            out.push(Outgoing::Plist(dict(&[("Status", "Acknowledged".into())])));
            out.push(Outgoing::Raw(FAKE_ARCHIVE.to_vec()));
        }
        out.push(Outgoing::Hangup);
    });
}

/// notification_proxy that relays back every posted name it was asked to observe
pub fn spawn_notification_proxy(socket: DuplexStream) {
    let mut observed = Vec::<String>::new();
    spawn_plist_daemon(socket, move |req, out| {
        let name = req
            .get("Name")
            .and_then(|n| n.as_string())
            .unwrap_or_default()
            .to_string();
        match req.get("Command").and_then(|c| c.as_string()) {
            Some("ObserveNotification") => observed.push(name),
            Some("PostNotification") if observed.contains(&name) => {
                out.push(Outgoing::Plist(dict(&[
                    ("Command", "RelayNotification".into()),
                    ("Name", name.into()),
                ])));
            }
            Some("Shutdown") => {
                out.push(Outgoing::Plist(dict(&[("Command", "ProxyDeath".into())])));
                out.push(Outgoing::Hangup);
            }
            _ => {}
        }
    });
}

/// Contacts the fake SyncAgent holds, sent in two batches
pub const FAKE_CONTACTS: &[(&str, &str)] = &[("1", "Ada"), ("2", "Grace"), ("3", "Barbara")];

/// SyncAgent speaking DeviceLink arrays; `refuse` makes it decline every sync
pub fn spawn_sync_agent(socket: DuplexStream, refuse: bool) {
    tokio::spawn(async move {
        let mut conn = ServiceConnection::new(Box::new(socket), "SyncAgent");
        let message = |items: Vec<Value>| Value::Array(items);
        let batch = |contacts: &[(&str, &str)], last: bool| {
            let entities = contacts
                .iter()
                .map(|(id, name)| {
                    (
                        id.to_string(),
                        Value::Dictionary(dict(&[
                            ("com.apple.syncservices.RecordEntityName", "com.apple.contacts.Contact".into()),
                            ("first name", (*name).into()),
                        ])),
                    )
                })
                .collect::<Dictionary>();
            message(vec![
                "SDMessageProcessChanges".into(),
                "com.apple.Contacts".into(),
                Value::Dictionary(entities),
                last.into(),
                Value::Dictionary(Dictionary::new()),
            ])
        };

        let offer = message(vec!["DLMessageVersionExchange".into(), 300u64.into(), 100u64.into()]);
        if conn.send_bplist(offer).await.is_err() {
            return;
        }
        let mut pending = Vec::new();
        while let Ok(Value::Array(req)) = conn.read_plist_value().await {
            let tag = req.first().and_then(|t| t.as_string()).unwrap_or("");
            let class = req.get(1).cloned().unwrap_or_else(|| "".into());
            let reply = match tag {
                "DLMessageVersionExchange" => vec![message(vec!["DLMessageDeviceReady".into()])],
                "SDMessageSyncDataClassWithDevice" if refuse => vec![message(vec![
                    "SDMessageRefuseToSyncDataClassWithComputer".into(),
                    class,
                    "Sync is disabled on this device".into(),
                ])],
                "SDMessageSyncDataClassWithDevice" => vec![message(vec![
                    "SDMessageSyncDataClassWithComputer".into(),
                    class,
                    "device-anchor".into(),
                ])],
                "SDMessageGetAllRecordsFromDevice" => {
                    pending.push(batch(&FAKE_CONTACTS[2..], true));
                    vec![batch(&FAKE_CONTACTS[..2], false)]
                }
                "SDMessageAcknowledgeChangesFromDevice" => pending.pop().into_iter().collect(),
                "SDMessageFinishSessionOnDevice" => vec![message(vec![
                    "SDMessageDeviceFinishedSession".into(),
                    class,
                ])],
                "DLMessageDisconnect" => return,
                _ => vec![message(vec!["SDMessageCancelSession".into(), class, "unexpected".into()])],
            };
            for msg in reply {
                if conn.send_bplist(msg).await.is_err() {
                    return;
                }
            }
        }
    });
}

pub const FAKE_ICON: &[u8] = b"\x89PNG\r\n\x1a\nicon";

/// springboardservices with a two page home screen
pub fn spawn_springboard(socket: DuplexStream) {
    spawn_plist_daemon(socket, |req, out| {
        match req.get("command").and_then(|c| c.as_string()) {
            Some("getIconPNGData") => {
                out.push(Outgoing::Plist(dict(&[("pngData", Value::Data(FAKE_ICON.to_vec()))])));
            }
            Some("getIconState") => {
                let page = |ids: &[&str]| {
                    Value::Array(
                        ids.iter()
                            .map(|id| Value::Dictionary(dict(&[("bundleIdentifier", (*id).into())])))
                            .collect(),
                    )
                };
                let state = Value::Array(vec![
                    page(&["com.apple.Preferences"]),
                    page(&["com.example.notes", "com.example.maps"]),
                ]);
                // not a dictionary, so it goes out as a raw frame
                let mut buf = Vec::new();
                state.to_writer_xml(&mut buf).unwrap();
                let mut framed = (buf.len() as u32).to_be_bytes().to_vec();
                framed.extend(buf);
                out.push(Outgoing::Raw(framed));
            }
            _ => out.push(Outgoing::Hangup),
        }
    });
}

/// syslog_relay that emits `lines` and hangs up
pub fn spawn_syslog(mut socket: DuplexStream, lines: &'static [&'static str]) {
    tokio::spawn(async move {
        for line in lines {
            let mut bytes = line.as_bytes().to_vec();
            bytes.extend(b"\n\0");
            if socket.write_all(&bytes).await.is_err() {
                return;
            }
        }
        let _ = socket.shutdown().await;
    });
}

// ---------------------------------------------------------------------------
// lockdownd and the connector

pub const LOCKDOWN_PORT: u16 = 62078;

type ServiceFactory = Arc<dyn Fn(DuplexStream) + Send + Sync>;

#[derive(Default)]
struct FakeDeviceState {
    paired: bool,
    /// Set when the device no longer accepts the host's pairing record
    untrusted: AtomicBool,
    root: Dictionary,
    domains: HashMap<String, Dictionary>,
    services: Mutex<Vec<(String, ServiceFactory)>>,
    lockdown_connections: AtomicUsize,
    tls_upgrades: AtomicUsize,
}

/// A connector to a device that lives entirely in this process
#[derive(Clone)]
pub struct FakeDevice {
    state: Arc<FakeDeviceState>,
}

impl fmt::Debug for FakeDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FakeDevice")
            .field("paired", &self.state.paired)
            .finish()
    }
}

pub const UDID: &str = "00008030-001A2B3C4D5E6F70";

impl FakeDevice {
    pub fn new(paired: bool) -> Self {
        let root = dict(&[
            ("UniqueDeviceID", UDID.into()),
            ("DeviceName", "Test iPhone".into()),
            ("ProductType", "iPhone12,1".into()),
            ("DeviceClass", "iPhone".into()),
            ("SerialNumber", "F2LXXXXXXXXX".into()),
            ("ProductVersion", "17.4".into()),
        ]);
        let mut domains = HashMap::new();
        domains.insert(
            "com.apple.disk_usage".to_string(),
            dict(&[("TotalDiskCapacity", 64_000_000_000u64.into())]),
        );
        Self {
            state: Arc::new(FakeDeviceState {
                paired,
                root,
                domains,
                ..Default::default()
            }),
        }
    }

    /// Makes `name` startable; `serve` runs for each connection to it
    pub fn with_service(self, name: &str, serve: impl Fn(DuplexStream) + Send + Sync + 'static) -> Self {
        self.state
            .services
            .lock()
            .unwrap()
            .push((name.to_string(), Arc::new(serve)));
        self
    }

    /// Makes lockdownd accept or refuse the pairing record the host holds
    pub fn set_trusted(&self, trusted: bool) {
        self.state.untrusted.store(!trusted, Ordering::SeqCst);
    }

    pub fn lockdown_connections(&self) -> usize {
        self.state.lockdown_connections.load(Ordering::SeqCst)
    }

    pub fn tls_upgrades(&self) -> usize {
        self.state.tls_upgrades.load(Ordering::SeqCst)
    }

    fn port_of(&self, name: &str) -> Option<u16> {
        self.state
            .services
            .lock()
            .unwrap()
            .iter()
            .position(|(n, _)| n == name)
            .map(|i| 49152 + i as u16)
    }

    fn factory_for(&self, port: u16) -> Option<ServiceFactory> {
        let index = usize::from(port.checked_sub(49152)?);
        self.state
            .services
            .lock()
            .unwrap()
            .get(index)
            .map(|(_, f)| f.clone())
    }

    fn lockdown_reply(&self, req: &Dictionary) -> Dictionary {
        let string = |k: &str| req.get(k).and_then(|v| v.as_string()).map(str::to_string);
        match string("Request").as_deref() {
            Some("QueryType") => dict(&[("Type", "com.apple.mobile.lockdown".into())]),
            Some("GetValue") => {
                let values = match string("Domain") {
                    Some(d) => match self.state.domains.get(&d) {
                        Some(values) => values.clone(),
                        None => return dict(&[("Error", "MissingValue".into())]),
                    },
                    None => self.state.root.clone(),
                };
                match string("Key") {
                    Some(key) => match values.get(&key) {
                        Some(v) => dict(&[("Key", key.clone().into()), ("Value", v.clone())]),
                        None => dict(&[("Error", "MissingValue".into()), ("Key", key.into())]),
                    },
                    None => dict(&[("Value", Value::Dictionary(values))]),
                }
            }
            Some("StartSession")
                if !self.state.paired || self.state.untrusted.load(Ordering::SeqCst) =>
            {
                dict(&[("Error", "InvalidHostID".into())])
            }
            Some("StartSession") => dict(&[
                ("SessionID", "fake-session".into()),
                ("EnableSessionSSL", true.into()),
            ]),
            Some("StartService") => {
                let name = string("Service").unwrap_or_default();
                match self.port_of(&name) {
                    Some(port) => dict(&[("Service", name.into()), ("Port", u64::from(port).into())]),
                    None => dict(&[("Error", "InvalidService".into()), ("Service", name.into())]),
                }
            }
            _ => dict(&[("Error", "InvalidRequest".into())]),
        }
    }
}

pub fn pair_record() -> PairRecord {
    PairRecord {
        device_certificate: Vec::new(),
        host_private_key: Vec::new(),
        host_certificate: Vec::new(),
        root_certificate: Vec::new(),
        system_buid: "30B6B0D4-0000-0000-0000-000000000000".into(),
        host_id: "5D1D3A8E-0000-0000-0000-000000000000".into(),
        escrow_bag: None,
        wifi_mac_address: None,
        udid: Some(UDID.into()),
    }
}

impl DeviceConnector for FakeDevice {
    fn connect(&self, port: u16) -> ConnectorFuture<'_, ServiceConnection> {
        Box::pin(async move {
            let (client, server) = pipe();
            if port == LOCKDOWN_PORT {
                self.state.lockdown_connections.fetch_add(1, Ordering::SeqCst);
                let device = self.clone();
                spawn_plist_daemon(server, move |req, out| {
                    out.push(Outgoing::Plist(device.lockdown_reply(&req)));
                });
                return Ok(client);
            }
            match self.factory_for(port) {
                Some(serve) => {
                    serve(server);
                    Ok(client)
                }
                None => Err(DeviceError::ConnectionFailed(Arc::new(
                    std::io::ErrorKind::ConnectionRefused.into(),
                ))),
            }
        })
    }

    fn label(&self) -> &str {
        "tests"
    }

    fn pair_record(&self) -> ConnectorFuture<'_, PairRecord> {
        Box::pin(async move {
            if self.state.paired {
                Ok(pair_record())
            } else {
                Err(DeviceError::PairingRequired("no pairing record".into()))
            }
        })
    }

    fn secure<'a>(
        &'a self,
        socket: ServiceSocket,
        _pair_record: &'a PairRecord,
    ) -> ConnectorFuture<'a, ServiceSocket> {
        Box::pin(async move {
            self.state.tls_upgrades.fetch_add(1, Ordering::SeqCst);
            Ok(socket)
        })
    }
}

/// A paired fake device offering every service these tests use
pub fn full_device(fs: &SharedFs) -> FakeDevice {
    let media = fs.clone();
    let container = fs.clone();
    FakeDevice::new(true)
        .with_service(mobiledevice::services::AFC, move |s| spawn_afcd(s, media.clone()))
        .with_service(mobiledevice::services::HOUSE_ARREST, move |s| {
            spawn_house_arrest(s, container.clone(), "com.example.notes")
        })
        .with_service(
            mobiledevice::services::INSTALLATION_PROXY,
            spawn_installation_proxy,
        )
        .with_service(mobiledevice::services::FILE_RELAY, spawn_file_relay)
        .with_service(
            mobiledevice::services::NOTIFICATION_PROXY,
            spawn_notification_proxy,
        )
        .with_service(mobiledevice::services::SPRINGBOARD_SERVICES, spawn_springboard)
        .with_service(mobiledevice::services::MOBILE_SYNC, |s| spawn_sync_agent(s, false))
        .with_service(mobiledevice::services::SYSLOG_RELAY, |s| {
            spawn_syslog(s, &["kernel[0] <Notice>: boot", "SpringBoard[57] <Notice>: ready"])
        })
}
