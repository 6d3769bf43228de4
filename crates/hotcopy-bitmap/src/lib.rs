//! Cluster-granularity dirty bitmaps used by the `hotcopy` backup engine.
//!
//! - [`ClusterBitmap`]: one bit per cluster over a volume's byte address space
//! - [`DirtyBitmap`]: a named, shareable bitmap with the successor protocol
//!   (create-successor / abdicate / reclaim) used for incremental backups
//!
//! All offsets and lengths are in bytes. A cluster is "dirty" when its bit is set.

mod cluster;
mod dirty;
mod error;
mod range;
mod util;

pub use cluster::{ClusterBitmap, DirtyClusters, DirtyRanges};
pub use dirty::DirtyBitmap;
pub use error::{BitmapError, Result};
pub use range::ByteRange;
pub use util::{align_down_u64, align_up_u64};

#[cfg(test)]
mod proptests;
