//! Live point-in-time backup of block devices.
//!
//! - [`BackupJob`]: validates a backup request and runs it as a job
//! - [`BlockCopyState`]: the cluster copy engine shared by the background loop and the
//!   before-write interceptor
//! - [`volume`]: the [`BlockDevice`] capability trait plus in-memory and raw-file volumes
//! - [`job`]: a small job runner (run / commit / abort / clean, cancellation, rate limiting)

pub mod backup;
pub mod copy;
mod error;
pub mod job;
pub mod ratelimit;
pub mod volume;

pub use backup::{
    sync_bitmap_action, BackupHandle, BackupJob, BackupOptions, BitmapAction, BitmapSyncPolicy,
    SyncMode, BACKUP_CLUSTER_SIZE_DEFAULT,
};
pub use copy::{BlockCopyState, CopyProgress, CopyTelemetrySnapshot};
pub use error::{BackupError, CopyError, JobError, VolumeError};
pub use job::{
    ErrorAction, ErrorEvent, Job, JobContext, JobDriver, JobFlags, JobHandle, JobOutcome,
    JobProgress, JobStatus, OnError,
};
pub use ratelimit::RateLimit;
pub use volume::{BlockDevice, FileVolume, MemVolume, WriteFlags};

pub use hotcopy_bitmap::{ClusterBitmap, DirtyBitmap};
