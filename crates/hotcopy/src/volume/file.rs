use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;

use super::{
    checked_range, BlockDevice, IoKind, IoStats, IoStatsSnapshot, TrackedWrite, WriteFlags,
    WriteHooks,
};
use crate::VolumeError;

/// Raw image file.
///
/// Seek and transfer run under an async mutex; raw images have no native cluster size and
/// report every byte as allocated.
pub struct FileVolume {
    id: String,
    path: PathBuf,
    len: u64,
    file: Mutex<File>,
    hooks: WriteHooks,
    stats: IoStats,
}

impl FileVolume {
    /// Open an existing image for reading and writing.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, VolumeError> {
        let path = path.as_ref();
        let file = OpenOptions::new().read(true).write(true).open(path).await?;
        let len = file.metadata().await?.len();
        Ok(Self::from_file(path, file, len))
    }

    /// Create (or truncate) an image of `len` bytes.
    pub async fn create(path: impl AsRef<Path>, len: u64) -> Result<Self, VolumeError> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .await?;
        file.set_len(len).await?;
        Ok(Self::from_file(path, file, len))
    }

    fn from_file(path: &Path, file: File, len: u64) -> Self {
        Self {
            id: path.display().to_string(),
            path: path.to_path_buf(),
            len,
            file: Mutex::new(file),
            hooks: WriteHooks::new(),
            stats: IoStats::default(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn stats(&self) -> IoStatsSnapshot {
        self.stats.snapshot()
    }

    /// Guest write: runs the before-write hooks, then writes `data`.
    pub async fn guest_write(&self, offset: u64, data: &[u8]) -> Result<(), VolumeError> {
        let bytes = data.len() as u64;
        checked_range(offset, bytes, self.len)?;
        if let Err(err) = self.hooks.notify(TrackedWrite { offset, bytes }).await {
            tracing::debug!(volume = %self.id, offset, bytes, error = %err, "before-write hook failed");
        }
        self.pwrite(offset, data).await
    }

    async fn pwrite(&self, offset: u64, data: &[u8]) -> Result<(), VolumeError> {
        let bytes = data.len() as u64;
        let cookie = self.stats.start(IoKind::Write, bytes);
        {
            let mut file = self.file.lock().await;
            file.seek(SeekFrom::Start(offset)).await?;
            file.write_all(data).await?;
            // tokio's File buffers the write in a background task until flushed.
            file.flush().await?;
        }
        self.stats.record_write_extent(offset, bytes);
        self.stats.done(cookie);
        Ok(())
    }
}

#[async_trait]
impl BlockDevice for FileVolume {
    fn id(&self) -> &str {
        &self.id
    }

    async fn length(&self) -> Result<u64, VolumeError> {
        Ok(self.len)
    }

    async fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<(), VolumeError> {
        checked_range(offset, buf.len() as u64, self.len)?;
        let cookie = self.stats.start(IoKind::Read, buf.len() as u64);
        {
            let mut file = self.file.lock().await;
            file.seek(SeekFrom::Start(offset)).await?;
            file.read_exact(buf).await?;
        }
        self.stats.done(cookie);
        Ok(())
    }

    async fn write_at(
        &self,
        offset: u64,
        data: &[u8],
        flags: WriteFlags,
    ) -> Result<(), VolumeError> {
        checked_range(offset, data.len() as u64, self.len)?;
        if flags.contains(WriteFlags::COMPRESSED) {
            return Err(VolumeError::NotSupported("compressed writes".to_string()));
        }
        self.pwrite(offset, data).await
    }

    async fn flush(&self) -> Result<(), VolumeError> {
        let cookie = self.stats.start(IoKind::Flush, 0);
        self.file.lock().await.sync_all().await?;
        self.stats.done(cookie);
        Ok(())
    }

    fn write_hooks(&self) -> &WriteHooks {
        &self.hooks
    }
}
