//! Cluster copy engine shared by the background loop and the write interceptor.
//!
//! The copy bitmap has one bit per cluster; a set bit means the cluster is not yet on the target.
//! A cluster is claimed by clearing its bit under the state lock before any I/O is issued, so two
//! callers can never transfer the same cluster. A failed transfer sets the bit again.
//!
//! Every [`BlockCopyState::copy_range`] call registers its aligned range as in flight and first
//! waits for any overlapping in-flight range to finish. A caller therefore never returns while a
//! cluster in its range is still being copied by someone else.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use hotcopy_bitmap::{align_down_u64, align_up_u64, BitmapError, ByteRange, ClusterBitmap};
use tokio::sync::oneshot;

use crate::volume::{BlockDevice, WriteFlags};
use crate::{CopyError, VolumeError};

/// Progress callbacks fired by the copy engine.
pub trait CopyProgress: Send + Sync {
    /// A cluster of `bytes` bytes reached the target.
    fn bytes_copied(&self, bytes: u64);

    /// Clusters were dropped from the copy bitmap without copying; `remaining` is the new
    /// number of bytes still to copy.
    fn remaining_reset(&self, remaining: u64);
}

#[derive(Debug, Default)]
struct CopyTelemetry {
    loop_copies: AtomicU64,
    notifier_copies: AtomicU64,
    clusters_skipped: AtomicU64,
    read_errors: AtomicU64,
    write_errors: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CopyTelemetrySnapshot {
    /// Clusters copied by direct callers (the background loop).
    pub loop_copies: u64,
    /// Clusters copied on behalf of an intercepted guest write.
    pub notifier_copies: u64,
    /// Clusters cleared because they were unallocated in the source's top layer.
    pub clusters_skipped: u64,
    pub read_errors: u64,
    pub write_errors: u64,
}

impl CopyTelemetry {
    fn snapshot(&self) -> CopyTelemetrySnapshot {
        CopyTelemetrySnapshot {
            loop_copies: self.loop_copies.load(Ordering::Relaxed),
            notifier_copies: self.notifier_copies.load(Ordering::Relaxed),
            clusters_skipped: self.clusters_skipped.load(Ordering::Relaxed),
            read_errors: self.read_errors.load(Ordering::Relaxed),
            write_errors: self.write_errors.load(Ordering::Relaxed),
        }
    }
}

struct InFlightCopy {
    id: u64,
    range: ByteRange,
    waiters: Vec<oneshot::Sender<()>>,
}

struct CopyState {
    copy_bitmap: ClusterBitmap,
    in_flight: Vec<InFlightCopy>,
    next_id: u64,
}

pub struct BlockCopyState {
    source: Arc<dyn BlockDevice>,
    target: Arc<dyn BlockDevice>,
    len: u64,
    cluster_size: u64,
    write_flags: WriteFlags,
    skip_unallocated: AtomicBool,
    state: Mutex<CopyState>,
    progress: Option<Arc<dyn CopyProgress>>,
    telemetry: CopyTelemetry,
}

impl std::fmt::Debug for BlockCopyState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockCopyState")
            .field("source", &self.source.id())
            .field("target", &self.target.id())
            .field("len", &self.len)
            .field("cluster_size", &self.cluster_size)
            .field("write_flags", &self.write_flags)
            .finish_non_exhaustive()
    }
}

impl BlockCopyState {
    /// Create an engine with an all-clear copy bitmap.
    pub fn new(
        source: Arc<dyn BlockDevice>,
        target: Arc<dyn BlockDevice>,
        len: u64,
        cluster_size: u64,
        write_flags: WriteFlags,
    ) -> Result<Self, BitmapError> {
        let copy_bitmap = ClusterBitmap::new(len, cluster_size)?;
        Ok(Self {
            source,
            target,
            len,
            cluster_size,
            write_flags,
            skip_unallocated: AtomicBool::new(false),
            state: Mutex::new(CopyState {
                copy_bitmap,
                in_flight: Vec::new(),
                next_id: 0,
            }),
            progress: None,
            telemetry: CopyTelemetry::default(),
        })
    }

    pub fn with_progress(mut self, progress: Arc<dyn CopyProgress>) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn cluster_size(&self) -> u64 {
        self.cluster_size
    }

    pub fn write_flags(&self) -> WriteFlags {
        self.write_flags
    }

    pub fn skip_unallocated(&self) -> bool {
        self.skip_unallocated.load(Ordering::SeqCst)
    }

    pub fn set_skip_unallocated(&self, skip: bool) {
        self.skip_unallocated.store(skip, Ordering::SeqCst);
    }

    pub fn set_all(&self) {
        self.lock().copy_bitmap.set_all();
    }

    pub fn set_dirty(&self, offset: u64, bytes: u64) {
        self.lock().copy_bitmap.set_range(offset, bytes);
    }

    pub fn merge_bitmap(&self, other: &ClusterBitmap) -> Result<(), BitmapError> {
        self.lock().copy_bitmap.merge_from(other)
    }

    /// Start offset of the first cluster still to copy at or after `offset`.
    pub fn next_dirty(&self, offset: u64) -> Option<u64> {
        self.lock().copy_bitmap.next_dirty(offset)
    }

    /// Bytes still to copy.
    pub fn dirty_count(&self) -> u64 {
        self.lock().copy_bitmap.dirty_count()
    }

    pub fn snapshot_bitmap(&self) -> ClusterBitmap {
        self.lock().copy_bitmap.clone()
    }

    pub fn telemetry(&self) -> CopyTelemetrySnapshot {
        self.telemetry.snapshot()
    }

    /// Copy every not-yet-copied cluster touched by `[offset, offset + bytes)`.
    ///
    /// The range is widened to cluster boundaries. Clusters already copied (or in the process of
    /// being copied by an overlapping caller, once that caller finishes) are skipped. The first
    /// failing cluster stops the call; its bit is set again.
    pub async fn copy_range(
        &self,
        offset: u64,
        bytes: u64,
        is_write_notifier: bool,
    ) -> Result<(), CopyError> {
        let overflow = |_| CopyError::Read {
            offset,
            source: VolumeError::OffsetOverflow,
        };
        let start = align_down_u64(offset, self.cluster_size);
        let end = offset
            .checked_add(bytes)
            .ok_or(BitmapError::OffsetOverflow)
            .and_then(|end| align_up_u64(end, self.cluster_size))
            .map_err(overflow)?;
        let end = end.min(self.len);
        if start >= end {
            return Ok(());
        }

        let _in_flight = self.begin_in_flight(ByteRange::new(start, end)).await;

        let mut pos = start;
        while pos < end {
            let Some(claim) = self.claim_cluster(pos) else {
                tracing::trace!(offset = pos, "cluster already copied");
                pos += self.cluster_size;
                continue;
            };

            if self.skip_unallocated() {
                let (allocated, run) = self.cluster_allocation(pos).await?;
                if !allocated {
                    let skip = run.min(end - pos);
                    // The claimed cluster's bit is already clear; count it by hand.
                    let (cleared, remaining) = {
                        let mut state = self.lock();
                        let cleared = state.copy_bitmap.reset_range(pos, skip);
                        (cleared + 1, state.copy_bitmap.dirty_count())
                    };
                    claim.commit();
                    self.telemetry
                        .clusters_skipped
                        .fetch_add(cleared, Ordering::Relaxed);
                    if let Some(progress) = &self.progress {
                        progress.remaining_reset(remaining);
                    }
                    tracing::trace!(offset = pos, bytes = skip, "skipping unallocated clusters");
                    pos += skip;
                    continue;
                }
            }

            let nbytes = self.cluster_size.min(self.len - pos);
            self.transfer(pos, nbytes).await?;
            claim.commit();

            let counter = if is_write_notifier {
                &self.telemetry.notifier_copies
            } else {
                &self.telemetry.loop_copies
            };
            counter.fetch_add(1, Ordering::Relaxed);
            if let Some(progress) = &self.progress {
                progress.bytes_copied(nbytes);
            }
            pos += self.cluster_size;
        }
        Ok(())
    }

    /// Clear the bits of the unallocated run starting at the cluster-aligned `offset`.
    ///
    /// Returns how many bytes the caller may advance by: the run length rounded to whole
    /// clusters when unallocated, or the allocated run length rounded up when allocated. The
    /// result is at least one cluster while `offset < len`.
    pub async fn reset_unallocated(&self, offset: u64) -> Result<u64, CopyError> {
        let (allocated, bytes) = self.cluster_allocation(offset).await?;
        if !allocated {
            let (cleared, remaining) = {
                let mut state = self.lock();
                let cleared = state.copy_bitmap.reset_range(offset, bytes);
                (cleared, state.copy_bitmap.dirty_count())
            };
            self.telemetry
                .clusters_skipped
                .fetch_add(cleared, Ordering::Relaxed);
            if let Some(progress) = &self.progress {
                progress.remaining_reset(remaining);
            }
        }
        Ok(bytes)
    }

    /// Allocation status of the run of whole clusters starting at `offset`.
    ///
    /// A cluster counts as allocated when any part of it is. An unallocated run that reaches the
    /// end of the device counts as whole clusters.
    async fn cluster_allocation(&self, offset: u64) -> Result<(bool, u64), CopyError> {
        let read_err = |source| CopyError::Read { offset, source };
        let mut total = 0u64;
        let mut pos = offset;
        let mut bytes = self.len.saturating_sub(offset);
        loop {
            let status = self.source.block_status(pos, bytes).await.map_err(read_err)?;
            total += status.bytes;
            if status.allocated || status.bytes == 0 {
                let clusters = total.div_ceil(self.cluster_size);
                return Ok((status.allocated, clusters * self.cluster_size));
            }
            if total >= self.cluster_size {
                let clusters = total / self.cluster_size;
                return Ok((false, clusters * self.cluster_size));
            }
            pos += status.bytes;
            bytes -= status.bytes;
        }
    }

    async fn transfer(&self, offset: u64, nbytes: u64) -> Result<(), CopyError> {
        let len = usize::try_from(nbytes).map_err(|_| CopyError::Read {
            offset,
            source: VolumeError::OffsetOverflow,
        })?;
        let mut buf = vec![0u8; len];

        if let Err(source) = self.source.read_at(offset, &mut buf).await {
            self.telemetry.read_errors.fetch_add(1, Ordering::Relaxed);
            return Err(CopyError::Read { offset, source });
        }
        if let Err(source) = self.target.write_at(offset, &buf, self.write_flags).await {
            self.telemetry.write_errors.fetch_add(1, Ordering::Relaxed);
            return Err(CopyError::Write { offset, source });
        }
        tracing::trace!(offset, bytes = nbytes, "cluster copied");
        Ok(())
    }

    /// Test-and-clear the bit of the cluster at `offset`.
    fn claim_cluster(&self, offset: u64) -> Option<ClusterClaim<'_>> {
        let mut state = self.lock();
        if !state.copy_bitmap.is_dirty(offset) {
            return None;
        }
        state.copy_bitmap.reset_range(offset, self.cluster_size);
        Some(ClusterClaim {
            bcs: self,
            offset,
            committed: false,
        })
    }

    async fn begin_in_flight(&self, range: ByteRange) -> InFlightGuard<'_> {
        loop {
            let wait = {
                let mut state = self.lock();
                match state.in_flight.iter().position(|req| req.range.overlaps(&range)) {
                    Some(idx) => {
                        let (tx, rx) = oneshot::channel();
                        state.in_flight[idx].waiters.push(tx);
                        rx
                    }
                    None => {
                        let id = state.next_id;
                        state.next_id += 1;
                        state.in_flight.push(InFlightCopy {
                            id,
                            range,
                            waiters: Vec::new(),
                        });
                        return InFlightGuard { bcs: self, id };
                    }
                }
            };
            // A dropped sender still means the overlapping request is gone.
            let _ = wait.await;
        }
    }

    fn lock(&self) -> MutexGuard<'_, CopyState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A claimed cluster; the bit is set again on drop unless committed.
struct ClusterClaim<'a> {
    bcs: &'a BlockCopyState,
    offset: u64,
    committed: bool,
}

impl ClusterClaim<'_> {
    fn commit(mut self) {
        self.committed = true;
    }
}

impl Drop for ClusterClaim<'_> {
    fn drop(&mut self) {
        if !self.committed {
            self.bcs
                .lock()
                .copy_bitmap
                .set_range(self.offset, self.bcs.cluster_size);
        }
    }
}

struct InFlightGuard<'a> {
    bcs: &'a BlockCopyState,
    id: u64,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        let waiters = {
            let mut state = self.bcs.lock();
            match state.in_flight.iter().position(|req| req.id == self.id) {
                Some(idx) => state.in_flight.swap_remove(idx).waiters,
                None => Vec::new(),
            }
        };
        for tx in waiters {
            let _ = tx.send(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::volume::MemVolume;

    const CLUSTER: u64 = 64 * 1024;
    const LEN: u64 = 16 * CLUSTER;

    struct Progress {
        copied: AtomicU64,
        remaining: AtomicU64,
    }

    impl CopyProgress for Progress {
        fn bytes_copied(&self, bytes: u64) {
            self.copied.fetch_add(bytes, Ordering::SeqCst);
        }

        fn remaining_reset(&self, remaining: u64) {
            self.remaining.store(remaining, Ordering::SeqCst);
        }
    }

    fn engine(source: Arc<MemVolume>, target: Arc<MemVolume>) -> BlockCopyState {
        let bcs = BlockCopyState::new(source, target, LEN, CLUSTER, WriteFlags::empty()).unwrap();
        bcs.set_all();
        bcs
    }

    #[tokio::test]
    async fn copy_range_widens_to_cluster_boundaries() {
        let source = Arc::new(MemVolume::new("src", LEN).unwrap());
        source.guest_write(CLUSTER, &[0xab; 16]).await.unwrap();
        let target = Arc::new(MemVolume::new("dst", LEN).unwrap());
        let bcs = engine(source, target.clone());

        bcs.copy_range(CLUSTER + 4096, 512, false).await.unwrap();

        let log = target.write_log();
        assert_eq!(log.len(), 1);
        assert_eq!((log[0].offset, log[0].len), (CLUSTER, CLUSTER));
        assert!(!bcs.snapshot_bitmap().is_dirty(CLUSTER));
        assert_eq!(bcs.dirty_count(), LEN - CLUSTER);
        assert_eq!(target.peek(CLUSTER, 16).unwrap(), vec![0xab; 16]);
    }

    #[tokio::test]
    async fn straddling_range_copies_both_clusters_once() {
        let source = Arc::new(MemVolume::new("src", LEN).unwrap());
        let target = Arc::new(MemVolume::new("dst", LEN).unwrap());
        let bcs = engine(source, target.clone());

        bcs.copy_range(CLUSTER - 1, 2, true).await.unwrap();
        bcs.copy_range(0, 2 * CLUSTER, false).await.unwrap();

        let offsets: Vec<_> = target.write_log().iter().map(|w| w.offset).collect();
        assert_eq!(offsets, vec![0, CLUSTER]);
        let telemetry = bcs.telemetry();
        assert_eq!(telemetry.notifier_copies, 2);
        assert_eq!(telemetry.loop_copies, 0);
    }

    #[tokio::test]
    async fn failed_write_restores_bit_and_reports_write_side() {
        let source = Arc::new(MemVolume::new("src", LEN).unwrap());
        let target = Arc::new(MemVolume::new("dst", LEN).unwrap());
        target.fail_writes(2 * CLUSTER, 1, VolumeError::NoSpace);
        let bcs = engine(source, target);

        let err = bcs.copy_range(2 * CLUSTER, CLUSTER, false).await.unwrap_err();
        assert!(!err.is_read());
        assert_eq!(err.offset(), 2 * CLUSTER);
        assert_eq!(err.volume_error(), &VolumeError::NoSpace);
        assert!(bcs.snapshot_bitmap().is_dirty(2 * CLUSTER));
        assert_eq!(bcs.telemetry().write_errors, 1);
    }

    #[tokio::test]
    async fn failed_read_is_classified_as_read() {
        let source = Arc::new(MemVolume::new("src", LEN).unwrap());
        source.fail_reads(0, 1, VolumeError::Io("media".into()));
        let target = Arc::new(MemVolume::new("dst", LEN).unwrap());
        let bcs = engine(source, target.clone());

        let err = bcs.copy_range(0, 1, false).await.unwrap_err();
        assert!(err.is_read());
        assert!(target.write_log().is_empty());
        assert!(bcs.snapshot_bitmap().is_dirty(0));
    }

    #[tokio::test]
    async fn progress_callback_sees_every_copied_byte() {
        let source = Arc::new(MemVolume::new("src", LEN).unwrap());
        let target = Arc::new(MemVolume::new("dst", LEN).unwrap());
        let progress = Arc::new(Progress {
            copied: AtomicU64::new(0),
            remaining: AtomicU64::new(0),
        });
        let bcs = engine(source, target).with_progress(progress.clone());

        bcs.copy_range(0, LEN, false).await.unwrap();
        assert_eq!(progress.copied.load(Ordering::SeqCst), LEN);
        assert_eq!(bcs.dirty_count(), 0);
    }

    #[tokio::test]
    async fn reset_unallocated_skips_whole_unallocated_runs() {
        let source = Arc::new(MemVolume::new("src", LEN).unwrap());
        source.discard(8 * CLUSTER, 8 * CLUSTER).unwrap();
        let target = Arc::new(MemVolume::new("dst", LEN).unwrap());
        let progress = Arc::new(Progress {
            copied: AtomicU64::new(0),
            remaining: AtomicU64::new(u64::MAX),
        });
        let bcs = engine(source, target).with_progress(progress.clone());

        assert_eq!(bcs.reset_unallocated(0).await.unwrap(), 8 * CLUSTER);
        assert_eq!(bcs.dirty_count(), LEN);

        assert_eq!(bcs.reset_unallocated(8 * CLUSTER).await.unwrap(), 8 * CLUSTER);
        assert_eq!(bcs.dirty_count(), 8 * CLUSTER);
        assert_eq!(progress.remaining.load(Ordering::SeqCst), 8 * CLUSTER);
        assert_eq!(bcs.telemetry().clusters_skipped, 8);
    }

    #[tokio::test]
    async fn partially_allocated_cluster_counts_as_allocated() {
        let source = Arc::new(MemVolume::sparse("src", LEN).unwrap());
        source.guest_write(CLUSTER + 512, &[1u8; 512]).await.unwrap();
        let target = Arc::new(MemVolume::new("dst", LEN).unwrap());
        let bcs = engine(source, target);

        // Cluster 0 is unallocated; cluster 1 is partially allocated.
        assert_eq!(bcs.reset_unallocated(0).await.unwrap(), CLUSTER);
        assert!(!bcs.snapshot_bitmap().is_dirty(0));
        assert_eq!(bcs.reset_unallocated(CLUSTER).await.unwrap(), CLUSTER);
        assert!(bcs.snapshot_bitmap().is_dirty(CLUSTER));
    }

    #[tokio::test]
    async fn skip_unallocated_clears_without_copying() {
        let source = Arc::new(MemVolume::sparse("src", LEN).unwrap());
        let target = Arc::new(MemVolume::new("dst", LEN).unwrap());
        let bcs = engine(source.clone(), target.clone());
        bcs.set_skip_unallocated(true);

        bcs.copy_range(3 * CLUSTER, 512, true).await.unwrap();
        assert!(target.write_log().is_empty());
        assert!(!bcs.snapshot_bitmap().is_dirty(3 * CLUSTER));

        source.guest_write(4 * CLUSTER, &[9u8; 512]).await.unwrap();
        bcs.copy_range(4 * CLUSTER, 512, true).await.unwrap();
        assert_eq!(target.write_log().len(), 1);
    }

    #[tokio::test]
    async fn skipped_clusters_count_only_bits_cleared() {
        let source = Arc::new(MemVolume::sparse("src", LEN).unwrap());
        let target = Arc::new(MemVolume::new("dst", LEN).unwrap());
        let bcs = engine(source, target.clone());
        bcs.set_skip_unallocated(true);

        bcs.copy_range(CLUSTER, 2 * CLUSTER, true).await.unwrap();
        assert_eq!(bcs.telemetry().clusters_skipped, 2);

        // Clusters 1 and 2 are already clear; only 0 and 3 change.
        bcs.copy_range(0, 4 * CLUSTER, false).await.unwrap();
        assert_eq!(bcs.telemetry().clusters_skipped, 4);
        assert_eq!(bcs.dirty_count(), LEN - 4 * CLUSTER);

        assert_eq!(bcs.reset_unallocated(0).await.unwrap(), LEN);
        assert_eq!(bcs.telemetry().clusters_skipped, 16);
        assert_eq!(bcs.dirty_count(), 0);
        assert!(target.write_log().is_empty());
    }

    #[tokio::test]
    async fn overlapping_caller_waits_for_in_flight_copy() {
        let source = Arc::new(MemVolume::new("src", LEN).unwrap());
        source.set_read_delay(Some(std::time::Duration::from_millis(50)));
        let target = Arc::new(MemVolume::new("dst", LEN).unwrap());
        let bcs = Arc::new(engine(source, target.clone()));

        let first = {
            let bcs = bcs.clone();
            tokio::spawn(async move { bcs.copy_range(0, CLUSTER, false).await })
        };
        tokio::task::yield_now().await;

        // Returns only after the first caller's transfer landed on the target.
        bcs.copy_range(0, 512, true).await.unwrap();
        assert_eq!(target.write_log().len(), 1);
        first.await.unwrap().unwrap();
        assert_eq!(target.write_log().len(), 1);
    }
}
