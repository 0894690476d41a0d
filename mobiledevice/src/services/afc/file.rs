//! Open file handles
//!
//! The device hands out raw descriptors. The client never exposes them: every
//! open file gets an opaque [`FileHandle`] in a table owned by the client, and
//! closing the file or the connection removes it from that table.

use std::{collections::HashMap, io::SeekFrom};

use tracing::debug;

use crate::DeviceError;

use super::{AfcClient, MAX_TRANSFER, opcode::AfcFopenMode, opcode::AfcOpcode};

/// Opaque reference to a file opened through one [`AfcClient`]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct FileHandle(u64);

#[derive(Debug)]
struct OpenFile {
    fd: u64,
    mode: AfcFopenMode,
    path: String,
}

#[derive(Debug, Default)]
pub(crate) struct FileTable {
    next_id: u64,
    open: HashMap<FileHandle, OpenFile>,
}

impl FileTable {
    fn insert(&mut self, file: OpenFile) -> FileHandle {
        self.next_id += 1;
        let handle = FileHandle(self.next_id);
        self.open.insert(handle, file);
        handle
    }

    fn get(&self, handle: FileHandle) -> Result<&OpenFile, DeviceError> {
        self.open.get(&handle).ok_or(DeviceError::InvalidHandle)
    }

    /// Drops every handle, returning how many were open
    pub(crate) fn clear(&mut self) -> usize {
        let n = self.open.len();
        self.open.clear();
        n
    }
}

impl AfcClient {
    /// Opens a file with an explicit mode
    ///
    /// # Errors
    /// `PathNotFound` or `PermissionDenied` as reported by the device
    pub async fn open(&mut self, path: &str, mode: AfcFopenMode) -> Result<FileHandle, DeviceError> {
        let res = async {
            let mut header_payload = (mode as u64).to_le_bytes().to_vec();
            header_payload.extend(path.as_bytes());
            let res = self
                .request(AfcOpcode::FileOpen, header_payload, Vec::new(), path)
                .await?;
            let fd = res.header_u64()?;
            debug!("Opened {path} as fd {fd}");
            Ok(self.files.insert(OpenFile {
                fd,
                mode,
                path: path.to_string(),
            }))
        }
        .await;
        self.connection.record(res)
    }

    pub async fn open_for_read(&mut self, path: &str) -> Result<FileHandle, DeviceError> {
        self.open(path, AfcFopenMode::RdOnly).await
    }

    /// Opens a file for writing, creating or truncating it
    pub async fn open_for_write(&mut self, path: &str) -> Result<FileHandle, DeviceError> {
        self.open(path, AfcFopenMode::WrOnly).await
    }

    /// Opens an existing file for reading and writing
    pub async fn open_for_read_write(&mut self, path: &str) -> Result<FileHandle, DeviceError> {
        self.open(path, AfcFopenMode::Rw).await
    }

    fn readable(&self, handle: FileHandle) -> Result<u64, DeviceError> {
        let file = self.files.get(handle)?;
        if !file.mode.can_read() {
            return Err(DeviceError::PermissionDenied(format!(
                "{} is not open for reading",
                file.path
            )));
        }
        Ok(file.fd)
    }

    fn writable(&self, handle: FileHandle) -> Result<u64, DeviceError> {
        let file = self.files.get(handle)?;
        if !file.mode.can_write() {
            return Err(DeviceError::PermissionDenied(format!(
                "{} is not open for writing",
                file.path
            )));
        }
        Ok(file.fd)
    }

    fn path_of(&self, handle: FileHandle) -> String {
        self.files
            .get(handle)
            .map(|f| f.path.clone())
            .unwrap_or_default()
    }

    async fn read_inner(&mut self, handle: FileHandle, n: usize) -> Result<Vec<u8>, DeviceError> {
        let fd = self.readable(handle)?;
        let path = self.path_of(handle);
        let mut collected = Vec::with_capacity(n.min(MAX_TRANSFER));

        while collected.len() < n {
            let chunk = (n - collected.len()).min(MAX_TRANSFER);
            let header_payload = [fd.to_le_bytes(), (chunk as u64).to_le_bytes()].concat();
            let res = self
                .request(AfcOpcode::Read, header_payload, Vec::new(), &path)
                .await?;
            let got = res.payload.len();
            collected.extend(res.payload);
            if got < chunk {
                break;
            }
        }
        Ok(collected)
    }

    /// Reads up to `n` bytes from the current position
    ///
    /// Fewer bytes are returned at end of file, and none past it.
    pub async fn read_n(&mut self, handle: FileHandle, n: usize) -> Result<Vec<u8>, DeviceError> {
        let res = self.read_inner(handle, n).await;
        self.connection.record(res)
    }

    /// Reads from the current position to the end of the file
    pub async fn read_to_end(&mut self, handle: FileHandle) -> Result<Vec<u8>, DeviceError> {
        let res = async {
            let mut collected = Vec::new();
            loop {
                let bytes = self.read_inner(handle, MAX_TRANSFER).await?;
                if bytes.is_empty() {
                    return Ok(collected);
                }
                collected.extend(bytes);
            }
        }
        .await;
        self.connection.record(res)
    }

    /// Writes all of `bytes` at the current position
    ///
    /// Either every byte is accepted or the call fails.
    pub async fn write_n(&mut self, handle: FileHandle, bytes: &[u8]) -> Result<(), DeviceError> {
        let res = async {
            let fd = self.writable(handle)?;
            let path = self.path_of(handle);
            for chunk in bytes.chunks(MAX_TRANSFER) {
                self.request(
                    AfcOpcode::Write,
                    fd.to_le_bytes().to_vec(),
                    chunk.to_vec(),
                    &path,
                )
                .await?;
            }
            Ok(())
        }
        .await;
        self.connection.record(res)
    }

    async fn tell_inner(&mut self, handle: FileHandle) -> Result<u64, DeviceError> {
        let file = self.files.get(handle)?;
        let (fd, path) = (file.fd, file.path.clone());
        let res = self
            .request(AfcOpcode::FileTell, fd.to_le_bytes().to_vec(), Vec::new(), &path)
            .await?;
        res.header_u64()
    }

    /// Returns the current position
    pub async fn tell(&mut self, handle: FileHandle) -> Result<u64, DeviceError> {
        let res = self.tell_inner(handle).await;
        self.connection.record(res)
    }

    async fn send_seek(
        &mut self,
        fd: u64,
        whence: u64,
        offset: i64,
        path: &str,
    ) -> Result<(), DeviceError> {
        let header_payload = [
            fd.to_le_bytes(),
            whence.to_le_bytes(),
            offset.to_le_bytes(),
        ]
        .concat();
        self.request(AfcOpcode::FileSeek, header_payload, Vec::new(), path)
            .await
            .map(|_| ())
    }

    /// Size of the open file, measured through its descriptor
    ///
    /// The path may have been renamed or unlinked since the file was opened.
    /// The position is left where it was.
    async fn size_of_open(&mut self, handle: FileHandle) -> Result<u64, DeviceError> {
        let file = self.files.get(handle)?;
        let (fd, path) = (file.fd, file.path.clone());
        let here = self.tell_inner(handle).await?;
        self.send_seek(fd, 2, 0, &path).await?;
        let size = self.tell_inner(handle).await;
        let back = i64::try_from(here)
            .map_err(|_| DeviceError::ProtocolError("file position out of range".into()));
        let restored = match back {
            Ok(back) => self.send_seek(fd, 0, back, &path).await,
            Err(e) => Err(e),
        };
        let size = size?;
        restored?;
        Ok(size)
    }

    async fn seek_inner(&mut self, handle: FileHandle, pos: SeekFrom) -> Result<u64, DeviceError> {
        let file = self.files.get(handle)?;
        let (fd, path) = (file.fd, file.path.clone());

        let base = match pos {
            SeekFrom::Start(_) => 0,
            SeekFrom::Current(off) if off < 0 => self.tell_inner(handle).await?,
            SeekFrom::End(off) if off < 0 => self.size_of_open(handle).await?,
            _ => 0,
        };
        let (offset, whence) = match pos {
            SeekFrom::Start(off) => (
                i64::try_from(off)
                    .map_err(|_| DeviceError::InvalidArgument("seek offset too large".into()))?,
                0u64,
            ),
            SeekFrom::Current(off) => (off, 1),
            SeekFrom::End(off) => (off, 2),
        };
        if offset < 0 && base < offset.unsigned_abs() {
            return Err(DeviceError::InvalidArgument(format!(
                "seek before the start of {path}"
            )));
        }

        self.send_seek(fd, whence, offset, &path).await?;
        self.tell_inner(handle).await
    }

    /// Moves the position and returns the new one
    ///
    /// # Errors
    /// `InvalidArgument` if the position would end up negative
    pub async fn seek(&mut self, handle: FileHandle, pos: SeekFrom) -> Result<u64, DeviceError> {
        let res = self.seek_inner(handle, pos).await;
        self.connection.record(res)
    }

    /// Truncates or extends the file. The device zero fills any extension.
    pub async fn set_file_size(&mut self, handle: FileHandle, size: u64) -> Result<(), DeviceError> {
        let res = async {
            let fd = self.writable(handle)?;
            let path = self.path_of(handle);
            let header_payload = [fd.to_le_bytes(), size.to_le_bytes()].concat();
            self.request(AfcOpcode::FileSetSize, header_payload, Vec::new(), &path)
                .await
                .map(|_| ())
        }
        .await;
        self.connection.record(res)
    }

    /// Closes a file
    ///
    /// The handle is gone afterwards even when the device reports a failure.
    pub async fn close_file(&mut self, handle: FileHandle) -> Result<(), DeviceError> {
        let res = match self.files.open.remove(&handle) {
            Some(file) => self
                .request(
                    AfcOpcode::FileClose,
                    file.fd.to_le_bytes().to_vec(),
                    Vec::new(),
                    &file.path,
                )
                .await
                .map(|_| ()),
            None => Err(DeviceError::InvalidHandle),
        };
        self.connection.record(res)
    }

    /// Reads a whole file
    pub async fn read_file(&mut self, path: &str) -> Result<Vec<u8>, DeviceError> {
        let handle = self.open_for_read(path).await?;
        let res = self.read_to_end(handle).await;
        let closed = self.close_file(handle).await;
        let res = res.and_then(|bytes| closed.map(|_| bytes));
        self.connection.record(res)
    }

    /// Replaces a file's contents
    pub async fn write_file(&mut self, path: &str, bytes: &[u8]) -> Result<(), DeviceError> {
        let handle = self.open_for_write(path).await?;
        let res = self.write_n(handle, bytes).await;
        let closed = self.close_file(handle).await;
        let res = res.and(closed);
        self.connection.record(res)
    }
}
