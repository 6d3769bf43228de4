use hotcopy_bitmap::BitmapError;
use thiserror::Error;

use crate::job::ErrorAction;
use crate::volume::BlockOp;

/// Failure reported by a [`crate::BlockDevice`].
///
/// [`VolumeError::Io`] stores a message rather than `std::io::Error` so the error stays `Clone`
/// and can be handed to every waiter of a shared operation.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum VolumeError {
    #[error("out of bounds: offset={offset} len={len} capacity={capacity}")]
    OutOfBounds { offset: u64, len: u64, capacity: u64 },

    #[error("integer overflow while computing byte offsets")]
    OffsetOverflow,

    #[error("operation not supported: {0}")]
    NotSupported(String),

    #[error("no space left on device")]
    NoSpace,

    #[error("device is not inserted")]
    NotInserted,

    #[error("io error: {0}")]
    Io(String),
}

impl From<std::io::Error> for VolumeError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value.to_string())
    }
}

/// Failure of a single cluster transfer. Read and write sides are routed through separate
/// error policies.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CopyError {
    #[error("read from source failed at offset {offset}: {source}")]
    Read {
        offset: u64,
        #[source]
        source: VolumeError,
    },

    #[error("write to target failed at offset {offset}: {source}")]
    Write {
        offset: u64,
        #[source]
        source: VolumeError,
    },
}

impl CopyError {
    pub fn is_read(&self) -> bool {
        matches!(self, CopyError::Read { .. })
    }

    pub fn offset(&self) -> u64 {
        match self {
            CopyError::Read { offset, .. } | CopyError::Write { offset, .. } => *offset,
        }
    }

    pub fn volume_error(&self) -> &VolumeError {
        match self {
            CopyError::Read { source, .. } | CopyError::Write { source, .. } => source,
        }
    }
}

/// Validation failure while creating a backup job. No job exists afterwards.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BackupError {
    #[error("source and target cannot be the same")]
    SameDevice,

    #[error("device is not inserted: {device}")]
    NotInserted { device: String },

    #[error("compression is not supported for this drive {device}")]
    CompressionUnsupported { device: String },

    #[error("operation {op:?} is blocked on {device}: {reason}")]
    OpBlocked {
        device: String,
        op: BlockOp,
        reason: String,
    },

    #[error("sync mode 'bitmap' requires a sync bitmap")]
    MissingSyncBitmap,

    #[error("unable to get length for '{device}': {source}")]
    Length {
        device: String,
        #[source]
        source: VolumeError,
    },

    #[error(
        "couldn't determine the cluster size of the target image '{device}', which has no backing file: {source}"
    )]
    ClusterSize {
        device: String,
        #[source]
        source: VolumeError,
    },

    #[error("the backup job only supports checkpoints in sync=none mode")]
    CheckpointUnsupported,

    #[error("bitmap error: {0}")]
    Bitmap(#[from] BitmapError),
}

/// Terminal failure of a running job.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum JobError {
    #[error("{source} (action: {action})")]
    Copy {
        action: ErrorAction,
        #[source]
        source: CopyError,
    },

    #[error("job cancelled")]
    Cancelled,

    #[error("bitmap error: {0}")]
    Bitmap(#[from] BitmapError),

    #[error("invalid job state: {0}")]
    InvalidState(&'static str),

    #[error("job task failed: {0}")]
    Internal(String),
}
