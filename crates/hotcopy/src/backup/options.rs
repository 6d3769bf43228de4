use hotcopy_bitmap::DirtyBitmap;
use serde::{Deserialize, Serialize};

use crate::job::{JobFlags, OnError};

/// Minimum backup cluster size in bytes.
pub const BACKUP_CLUSTER_SIZE_DEFAULT: u64 = 1 << 16;

/// Which clusters the job copies on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SyncMode {
    /// The whole device.
    #[default]
    Full,
    /// Only clusters allocated in the source's top layer.
    Top,
    /// Nothing; clusters are copied only when a guest write is about to overwrite them.
    None,
    /// Clusters marked in the sync bitmap.
    Bitmap,
}

/// When the sync bitmap is cleared of the clusters this job backed up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BitmapSyncPolicy {
    Always,
    Never,
    #[default]
    OnSuccess,
}

#[derive(Debug, Clone)]
pub struct BackupOptions {
    pub job_id: String,
    /// Throughput limit in bytes per second; zero is unlimited.
    pub speed: u64,
    pub sync_mode: SyncMode,
    pub sync_bitmap: Option<DirtyBitmap>,
    pub bitmap_policy: BitmapSyncPolicy,
    pub compress: bool,
    pub on_source_error: OnError,
    pub on_target_error: OnError,
    pub flags: JobFlags,
}

impl Default for BackupOptions {
    fn default() -> Self {
        Self {
            job_id: "backup0".to_string(),
            speed: 0,
            sync_mode: SyncMode::default(),
            sync_bitmap: None,
            bitmap_policy: BitmapSyncPolicy::default(),
            compress: false,
            on_source_error: OnError::default(),
            on_target_error: OnError::default(),
            flags: JobFlags::empty(),
        }
    }
}
