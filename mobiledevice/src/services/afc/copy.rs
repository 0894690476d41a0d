//! Copies between the host filesystem and the device

use std::path::Path;

use async_recursion::async_recursion;
use tracing::debug;

use crate::DeviceError;

use super::{AfcClient, MAX_TRANSFER, join_path};

fn local_err(path: &Path, e: std::io::Error) -> DeviceError {
    match e.kind() {
        std::io::ErrorKind::NotFound => DeviceError::PathNotFound(path.display().to_string()),
        std::io::ErrorKind::PermissionDenied => {
            DeviceError::PermissionDenied(path.display().to_string())
        }
        _ => DeviceError::InvalidArgument(format!("{}: {e}", path.display())),
    }
}

fn file_name(path: &Path) -> Result<String, DeviceError> {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| DeviceError::InvalidArgument(format!("{} has no name", path.display())))
}

impl AfcClient {
    /// Uploads one local file to a device path
    pub async fn copy_local_file(&mut self, from: &Path, to: &str) -> Result<(), DeviceError> {
        let res = self.upload_file(from, to).await;
        self.connection.record(res)
    }

    /// Copies a local file or directory into a device directory
    ///
    /// Directories are copied recursively. Symbolic links are recreated as
    /// links instead of being followed. The first failure stops the copy and
    /// whatever was copied before it stays on the device.
    pub async fn copy_local_to_remote_dir(
        &mut self,
        from: &Path,
        to_dir: &str,
    ) -> Result<(), DeviceError> {
        let res = async {
            let target = join_path(to_dir, &file_name(from)?);
            self.upload_tree(from, &target).await
        }
        .await;
        self.connection.record(res)
    }

    /// Downloads one device file to a local path
    pub async fn copy_remote_file(&mut self, from: &str, to: &Path) -> Result<(), DeviceError> {
        let res = async {
            let handle = self.open_for_read(from).await?;
            let mut out = tokio::fs::File::create(to)
                .await
                .map_err(|e| local_err(to, e))?;
            let copied = self.drain_into(handle, &mut out, to).await;
            let closed = self.close_file(handle).await;
            copied.and(closed)
        }
        .await;
        self.connection.record(res)
    }

    async fn drain_into(
        &mut self,
        handle: super::FileHandle,
        out: &mut tokio::fs::File,
        to: &Path,
    ) -> Result<(), DeviceError> {
        use tokio::io::AsyncWriteExt;
        loop {
            let bytes = self.read_n(handle, MAX_TRANSFER).await?;
            if bytes.is_empty() {
                break;
            }
            out.write_all(&bytes).await.map_err(|e| local_err(to, e))?;
        }
        out.flush().await.map_err(|e| local_err(to, e))
    }

    async fn upload_file(&mut self, from: &Path, to: &str) -> Result<(), DeviceError> {
        let bytes = tokio::fs::read(from).await.map_err(|e| local_err(from, e))?;
        debug!("Uploading {} ({} bytes) to {to}", from.display(), bytes.len());
        self.write_file(to, &bytes).await
    }

    #[async_recursion]
    async fn upload_tree(&mut self, from: &Path, to: &str) -> Result<(), DeviceError> {
        let meta = tokio::fs::symlink_metadata(from)
            .await
            .map_err(|e| local_err(from, e))?;

        if meta.file_type().is_symlink() {
            let target = tokio::fs::read_link(from)
                .await
                .map_err(|e| local_err(from, e))?;
            return self.symlink(to, &target.to_string_lossy()).await;
        }
        if !meta.is_dir() {
            return self.upload_file(from, to).await;
        }

        self.mkdir(to).await?;
        let mut entries = tokio::fs::read_dir(from)
            .await
            .map_err(|e| local_err(from, e))?;
        while let Some(entry) = entries.next_entry().await.map_err(|e| local_err(from, e))? {
            let child = join_path(to, &entry.file_name().to_string_lossy());
            self.upload_tree(&entry.path(), &child).await?;
        }
        Ok(())
    }
}
