//! Block device capabilities consumed by the backup engine, plus two concrete volumes.
//!
//! The engine only talks to [`BlockDevice`]. [`MemVolume`] and [`FileVolume`] are complete
//! implementations used by tests and by the `hotcopy` CLI respectively.

mod accounting;
mod file;
mod hooks;
mod mem;

use async_trait::async_trait;
use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use crate::VolumeError;

pub use accounting::{IoCookie, IoKind, IoStats, IoStatsSnapshot};
pub use file::FileVolume;
pub use hooks::{BeforeWriteHook, WriteHookRegistration, WriteHooks};
pub use mem::{MemVolume, WriteRecord};

bitflags! {
    /// Flags attached to writes issued by the copy engine.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
    pub struct WriteFlags: u32 {
        /// The write must not overlap with any concurrent request on the target.
        const SERIALISING = 1 << 0;
        /// Store the data compressed.
        const COMPRESSED = 1 << 1;
    }
}

/// Operations a device may veto.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BlockOp {
    BackupSource,
    BackupTarget,
}

/// Allocation state of a byte run in the top-most layer of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockStatus {
    pub allocated: bool,
    /// Length of the run starting at the queried offset that shares `allocated`. Zero only at or
    /// past the end of the device.
    pub bytes: u64,
}

/// An in-flight write against a source volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackedWrite {
    pub offset: u64,
    pub bytes: u64,
}

#[async_trait]
pub trait BlockDevice: Send + Sync {
    /// Stable identifier, unique among the devices of one process.
    fn id(&self) -> &str;

    fn is_inserted(&self) -> bool {
        true
    }

    async fn length(&self) -> Result<u64, VolumeError>;

    async fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<(), VolumeError>;

    async fn write_at(&self, offset: u64, data: &[u8], flags: WriteFlags)
        -> Result<(), VolumeError>;

    async fn flush(&self) -> Result<(), VolumeError> {
        Ok(())
    }

    /// Cluster size of the underlying image format.
    async fn native_cluster_size(&self) -> Result<u64, VolumeError> {
        Err(VolumeError::NotSupported("cluster size".to_string()))
    }

    fn has_backing(&self) -> bool {
        false
    }

    /// Whether the device with `id` is reachable through this device's backing chain.
    fn backing_chain_contains(&self, _id: &str) -> bool {
        false
    }

    fn supports_compression(&self) -> bool {
        false
    }

    /// Reason `op` is currently blocked on this device, if it is.
    fn op_blocker(&self, _op: BlockOp) -> Option<String> {
        None
    }

    /// Allocation status of the top layer at `offset`, looking at most `bytes` ahead.
    async fn block_status(&self, offset: u64, bytes: u64) -> Result<BlockStatus, VolumeError> {
        let len = self.length().await?;
        Ok(BlockStatus {
            allocated: true,
            bytes: len.saturating_sub(offset).min(bytes),
        })
    }

    /// Hooks run before every guest write to this device.
    fn write_hooks(&self) -> &WriteHooks;
}

pub(crate) fn checked_range(offset: u64, len: u64, capacity: u64) -> Result<(), VolumeError> {
    let end = offset.checked_add(len).ok_or(VolumeError::OffsetOverflow)?;
    if end > capacity {
        return Err(VolumeError::OutOfBounds {
            offset,
            len,
            capacity,
        });
    }
    Ok(())
}
