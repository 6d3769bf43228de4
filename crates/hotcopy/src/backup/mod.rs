//! Point-in-time backup of a live block device.
//!
//! A [`BackupJob`] copies its source to a target while the source keeps receiving guest writes.
//! The job installs a before-write hook on the source that copies every not-yet-copied cluster a
//! guest write touches before the write is applied, so the target ends up holding the source as
//! it was when the job started.
//!
//! Per sync mode the job then:
//!
//! - `Full` / `Bitmap`: walks the copy bitmap in ascending order, copying one cluster at a time
//! - `Top`: first drops clusters unallocated in the source's top layer, then walks like `Full`
//! - `None`: copies nothing itself and runs until cancelled
//!
//! Shutdown waits for every in-flight interceptor copy (the drain barrier) before the sync bitmap
//! is abdicated or reclaimed.

mod bitmap;
mod interceptor;
mod options;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use hotcopy_bitmap::{BitmapError, ClusterBitmap, DirtyBitmap};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::copy::{BlockCopyState, CopyProgress, CopyTelemetrySnapshot};
use crate::job::{
    ErrorAction, ErrorEvent, Job, JobContext, JobDriver, JobHandle, JobOutcome, JobProgress,
    JobStatus, OnError,
};
use crate::volume::{BlockDevice, BlockOp, WriteFlags};
use crate::{BackupError, CopyError, JobError, VolumeError};

pub use bitmap::{sync_bitmap_action, BitmapAction};
pub use options::{BackupOptions, BitmapSyncPolicy, SyncMode, BACKUP_CLUSTER_SIZE_DEFAULT};

use interceptor::BackupInterceptor;

/// Forwards copy engine progress to the job and counts bytes for the rate limiter.
struct BackupProgress {
    ctx: JobContext,
    bytes_read: AtomicU64,
}

impl BackupProgress {
    fn take_bytes_read(&self) -> u64 {
        self.bytes_read.swap(0, Ordering::Relaxed)
    }
}

impl CopyProgress for BackupProgress {
    fn bytes_copied(&self, bytes: u64) {
        self.bytes_read.fetch_add(bytes, Ordering::Relaxed);
        self.ctx.progress_update(bytes);
    }

    fn remaining_reset(&self, remaining: u64) {
        self.ctx.progress_set_remaining(remaining);
    }
}

pub(crate) struct BackupShared {
    ctx: JobContext,
    source: Arc<dyn BlockDevice>,
    sync_mode: SyncMode,
    sync_bitmap: Option<DirtyBitmap>,
    bitmap_policy: BitmapSyncPolicy,
    on_source_error: OnError,
    on_target_error: OnError,
    /// Held shared by every copy, taken exclusively once at shutdown to drain them.
    flush_lock: RwLock<()>,
    /// Set before the drain; interceptions that start afterwards copy nothing.
    closing: AtomicBool,
    len: u64,
    cluster_size: u64,
    progress: Arc<BackupProgress>,
    bcs: Mutex<Option<Arc<BlockCopyState>>>,
    released: Mutex<Option<(ClusterBitmap, CopyTelemetrySnapshot)>>,
    failure: Mutex<Option<JobError>>,
    failure_signal: CancellationToken,
    bitmap_resolved: AtomicBool,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl BackupShared {
    fn copy_state(&self) -> Option<Arc<BlockCopyState>> {
        lock(&self.bcs).clone()
    }

    fn error_action(&self, err: &CopyError) -> ErrorAction {
        let policy = if err.is_read() {
            self.on_source_error
        } else {
            self.on_target_error
        };
        self.ctx.error_action(policy, err)
    }

    /// Record a failed interception. Anything but `Ignore` fails the job.
    fn interceptor_failed(&self, err: &CopyError) -> ErrorAction {
        let action = self.error_action(err);
        if action == ErrorAction::Ignore {
            return action;
        }
        lock(&self.failure).get_or_insert_with(|| JobError::Copy {
            action,
            source: err.clone(),
        });
        self.failure_signal.cancel();
        action
    }

    fn should_stop(&self) -> bool {
        self.ctx.is_cancelled() || self.failure_signal.is_cancelled()
    }

    /// Throttle, then report whether the job must stop. Always yields at least once.
    async fn yield_and_check(&self) -> bool {
        if self.should_stop() {
            return true;
        }
        let delay = self.ctx.ratelimit_delay(self.progress.take_bytes_read());
        self.ctx.sleep(delay, &self.failure_signal).await;
        self.should_stop()
    }

    async fn do_cow(&self, bcs: &BlockCopyState, offset: u64, bytes: u64) -> Result<(), CopyError> {
        let _drain = self.flush_lock.read().await;
        tracing::debug!(job = %self.ctx.id(), offset, bytes, "copy cluster");
        bcs.copy_range(offset, bytes, false).await
    }

    fn init_copy_bitmap(&self, bcs: &BlockCopyState) -> Result<(), JobError> {
        match self.sync_mode {
            SyncMode::Bitmap => {
                let bitmap = self
                    .sync_bitmap
                    .as_ref()
                    .ok_or(JobError::InvalidState("bitmap sync without a sync bitmap"))?;
                bcs.merge_bitmap(&bitmap.snapshot())?;
            }
            SyncMode::Top => {
                bcs.set_skip_unallocated(true);
                bcs.set_all();
            }
            SyncMode::Full | SyncMode::None => bcs.set_all(),
        }
        self.ctx.progress_set_remaining(bcs.dirty_count());
        Ok(())
    }

    async fn run(self: &Arc<Self>) -> Result<(), JobError> {
        let bcs = self
            .copy_state()
            .ok_or(JobError::InvalidState("copy state already released"))?;
        self.init_copy_bitmap(&bcs)?;

        let registration = self
            .source
            .write_hooks()
            .subscribe(Arc::new(BackupInterceptor {
                shared: Arc::clone(self),
            }));

        let result = match self.sync_mode {
            SyncMode::None => {
                tokio::select! {
                    _ = self.ctx.cancelled() => {}
                    _ = self.failure_signal.cancelled() => {}
                }
                Ok(())
            }
            SyncMode::Top => match self.skip_unallocated_pass(&bcs).await {
                Ok(()) => self.backup_loop(&bcs).await,
                Err(err) => Err(err),
            },
            SyncMode::Full | SyncMode::Bitmap => self.backup_loop(&bcs).await,
        };

        drop(registration);
        self.closing.store(true, Ordering::SeqCst);
        drop(self.flush_lock.write().await);

        if result.is_ok() && self.sync_mode != SyncMode::None && !self.should_stop() {
            let uncopied = bcs.dirty_count();
            if uncopied > 0 {
                tracing::warn!(job = %self.ctx.id(), bytes = uncopied, "clusters left uncopied after ignored errors");
            }
        }

        let failure = lock(&self.failure).take();
        match (result, failure) {
            (Ok(()) | Err(JobError::Cancelled), Some(failure)) => Err(failure),
            (result, _) => result,
        }
    }

    /// Clear every cluster unallocated in the source's top layer.
    async fn skip_unallocated_pass(&self, bcs: &BlockCopyState) -> Result<(), JobError> {
        let mut offset = 0;
        while offset < self.len {
            if self.yield_and_check().await {
                return Err(JobError::Cancelled);
            }
            let count = bcs
                .reset_unallocated(offset)
                .await
                .map_err(|source| JobError::Copy {
                    action: ErrorAction::Report,
                    source,
                })?;
            offset += count.max(self.cluster_size);
        }
        bcs.set_skip_unallocated(false);
        tracing::debug!(job = %self.ctx.id(), remaining = bcs.dirty_count(), "top layer scanned");
        Ok(())
    }

    /// Copy every marked cluster in ascending order until none remain.
    ///
    /// Bits set again behind the cursor (a failed interceptor copy) are picked up by restarting
    /// from the beginning once the end is reached.
    async fn backup_loop(&self, bcs: &BlockCopyState) -> Result<(), JobError> {
        let mut offset = 0;
        loop {
            let Some(cluster) = bcs.next_dirty(offset).or_else(|| bcs.next_dirty(0)) else {
                return Ok(());
            };
            loop {
                if self.yield_and_check().await {
                    return Ok(());
                }
                match self.do_cow(bcs, cluster, self.cluster_size).await {
                    Ok(()) => break,
                    Err(err) => match self.error_action(&err) {
                        ErrorAction::Ignore => continue,
                        action @ (ErrorAction::Report | ErrorAction::Stop) => {
                            return Err(JobError::Copy {
                                action,
                                source: err,
                            });
                        }
                    },
                }
            }
            offset = cluster + self.cluster_size;
        }
    }

    fn cleanup_sync_bitmap(&self, success: bool) {
        let Some(sync_bitmap) = &self.sync_bitmap else {
            return;
        };
        let uncopied = self.copy_state().map(|bcs| bcs.snapshot_bitmap());
        match bitmap::cleanup_sync_bitmap(
            sync_bitmap,
            self.bitmap_policy,
            success,
            uncopied.as_ref(),
        ) {
            Ok(action) => tracing::info!(
                job = %self.ctx.id(),
                bitmap = sync_bitmap.name(),
                ?action,
                dirty = sync_bitmap.dirty_count(),
                "sync bitmap resolved"
            ),
            Err(err) => tracing::error!(
                job = %self.ctx.id(),
                bitmap = sync_bitmap.name(),
                error = %err,
                "failed to resolve sync bitmap"
            ),
        }
        self.bitmap_resolved.store(true, Ordering::SeqCst);
    }

    fn release_copy_state(&self) {
        if let Some(bcs) = lock(&self.bcs).take() {
            *lock(&self.released) = Some((bcs.snapshot_bitmap(), bcs.telemetry()));
        }
    }
}

impl Drop for BackupShared {
    fn drop(&mut self) {
        // A job that never ran still froze the sync bitmap.
        if self.bitmap_resolved.load(Ordering::SeqCst) {
            return;
        }
        if let Some(sync_bitmap) = &self.sync_bitmap {
            if sync_bitmap.is_frozen() {
                if let Err(err) = sync_bitmap.reclaim() {
                    tracing::warn!(bitmap = sync_bitmap.name(), error = %err, "failed to reclaim sync bitmap");
                }
            }
        }
    }
}

/// A validated backup job that has not started yet.
pub struct BackupJob {
    shared: Arc<BackupShared>,
}

impl std::fmt::Debug for BackupJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackupJob")
            .field("id", &self.shared.ctx.id())
            .field("sync_mode", &self.shared.sync_mode)
            .field("len", &self.shared.len)
            .field("cluster_size", &self.shared.cluster_size)
            .finish_non_exhaustive()
    }
}

impl BackupJob {
    /// Validate the request and prepare a job.
    ///
    /// On error nothing persists: a successor created for the sync bitmap is reclaimed.
    pub async fn create(
        source: Arc<dyn BlockDevice>,
        target: Arc<dyn BlockDevice>,
        options: BackupOptions,
    ) -> Result<Self, BackupError> {
        if options.sync_mode == SyncMode::Bitmap && options.sync_bitmap.is_none() {
            return Err(BackupError::MissingSyncBitmap);
        }
        if source.id() == target.id() {
            return Err(BackupError::SameDevice);
        }
        for device in [&source, &target] {
            if !device.is_inserted() {
                return Err(BackupError::NotInserted {
                    device: device.id().to_string(),
                });
            }
        }
        if options.compress && !target.supports_compression() {
            return Err(BackupError::CompressionUnsupported {
                device: target.id().to_string(),
            });
        }
        for (device, op) in [
            (&source, BlockOp::BackupSource),
            (&target, BlockOp::BackupTarget),
        ] {
            if let Some(reason) = device.op_blocker(op) {
                return Err(BackupError::OpBlocked {
                    device: device.id().to_string(),
                    op,
                    reason,
                });
            }
        }

        if let Some(sync_bitmap) = &options.sync_bitmap {
            if options.bitmap_policy != BitmapSyncPolicy::Never {
                sync_bitmap.check_writable()?;
            }
            sync_bitmap.create_successor()?;
        }

        let sync_bitmap = options.sync_bitmap.clone();
        match Self::build(source, target, options).await {
            Ok(job) => Ok(job),
            Err(err) => {
                if let Some(sync_bitmap) = sync_bitmap {
                    if let Err(reclaim) = sync_bitmap.reclaim() {
                        tracing::warn!(bitmap = sync_bitmap.name(), error = %reclaim, "failed to reclaim sync bitmap");
                    }
                }
                Err(err)
            }
        }
    }

    async fn build(
        source: Arc<dyn BlockDevice>,
        target: Arc<dyn BlockDevice>,
        options: BackupOptions,
    ) -> Result<Self, BackupError> {
        let len = source.length().await.map_err(|source_err| BackupError::Length {
            device: source.id().to_string(),
            source: source_err,
        })?;
        if let Some(sync_bitmap) = &options.sync_bitmap {
            if sync_bitmap.len() != len {
                return Err(BitmapError::SizeMismatch {
                    left: sync_bitmap.len(),
                    right: len,
                }
                .into());
            }
        }

        let cluster_size = calculate_cluster_size(target.as_ref()).await?;

        // A target backed by the source is read by third parties during the job; its writes must
        // not interleave with their reads.
        let mut write_flags = WriteFlags::empty();
        if target.backing_chain_contains(source.id()) {
            write_flags |= WriteFlags::SERIALISING;
        }
        if options.compress {
            write_flags |= WriteFlags::COMPRESSED;
        }

        let ctx = JobContext::new(options.job_id, options.speed, options.flags);
        let progress = Arc::new(BackupProgress {
            ctx: ctx.clone(),
            bytes_read: AtomicU64::new(0),
        });
        let bcs = BlockCopyState::new(
            Arc::clone(&source),
            Arc::clone(&target),
            len,
            cluster_size,
            write_flags,
        )?
        .with_progress(progress.clone());

        tracing::info!(
            job = %ctx.id(),
            source_device = source.id(),
            target_device = target.id(),
            sync_mode = ?options.sync_mode,
            len,
            cluster_size,
            ?write_flags,
            "backup job created"
        );

        Ok(Self {
            shared: Arc::new(BackupShared {
                ctx,
                source,
                sync_mode: options.sync_mode,
                sync_bitmap: options.sync_bitmap,
                bitmap_policy: options.bitmap_policy,
                on_source_error: options.on_source_error,
                on_target_error: options.on_target_error,
                flush_lock: RwLock::new(()),
                closing: AtomicBool::new(false),
                len,
                cluster_size,
                progress,
                bcs: Mutex::new(Some(Arc::new(bcs))),
                released: Mutex::new(None),
                failure: Mutex::new(None),
                failure_signal: CancellationToken::new(),
                bitmap_resolved: AtomicBool::new(false),
            }),
        })
    }

    pub fn id(&self) -> &str {
        self.shared.ctx.id()
    }

    pub fn len(&self) -> u64 {
        self.shared.len
    }

    pub fn is_empty(&self) -> bool {
        self.shared.len == 0
    }

    pub fn cluster_size(&self) -> u64 {
        self.shared.cluster_size
    }

    pub fn write_flags(&self) -> WriteFlags {
        self.shared
            .copy_state()
            .map(|bcs| bcs.write_flags())
            .unwrap_or_default()
    }

    /// Spawn the job on the current tokio runtime.
    pub fn start(self) -> BackupHandle {
        let shared = Arc::clone(&self.shared);
        let job = Job::spawn(shared.ctx.clone(), Arc::new(self));
        BackupHandle { job, shared }
    }
}

#[async_trait]
impl JobDriver for BackupJob {
    fn job_type(&self) -> &'static str {
        "backup"
    }

    async fn run(&self, _ctx: &JobContext) -> Result<(), JobError> {
        self.shared.run().await
    }

    fn commit(&self, _ctx: &JobContext) {
        self.shared.cleanup_sync_bitmap(true);
    }

    fn abort(&self, _ctx: &JobContext) {
        self.shared.cleanup_sync_bitmap(false);
    }

    fn clean(&self, _ctx: &JobContext) {
        self.shared.release_copy_state();
    }
}

/// Effective cluster size for copies to `target`.
async fn calculate_cluster_size(target: &dyn BlockDevice) -> Result<u64, BackupError> {
    match target.native_cluster_size().await {
        Ok(native) => native
            .max(BACKUP_CLUSTER_SIZE_DEFAULT)
            .checked_next_power_of_two()
            .ok_or_else(|| BackupError::ClusterSize {
                device: target.id().to_string(),
                source: VolumeError::OffsetOverflow,
            }),
        Err(VolumeError::NotSupported(_)) if !target.has_backing() => {
            tracing::warn!(
                device = target.id(),
                default = BACKUP_CLUSTER_SIZE_DEFAULT,
                "target reports no cluster size and has no backing file; using the default, \
                 the backup may be unusable if the real cluster size is larger"
            );
            Ok(BACKUP_CLUSTER_SIZE_DEFAULT)
        }
        Err(source) if !target.has_backing() => Err(BackupError::ClusterSize {
            device: target.id().to_string(),
            source,
        }),
        Err(err) => {
            tracing::debug!(device = target.id(), error = %err, "cluster size probe failed; using the default");
            Ok(BACKUP_CLUSTER_SIZE_DEFAULT)
        }
    }
}

/// Handle to a running backup job.
pub struct BackupHandle {
    job: JobHandle,
    shared: Arc<BackupShared>,
}

impl BackupHandle {
    pub fn id(&self) -> &str {
        self.job.id()
    }

    pub fn status(&self) -> JobStatus {
        self.job.status()
    }

    pub fn progress(&self) -> JobProgress {
        self.job.progress()
    }

    pub fn set_speed(&self, speed: u64) {
        self.job.set_speed(speed);
    }

    pub fn cancel(&self) {
        self.job.cancel();
    }

    pub async fn wait(&mut self) -> JobOutcome {
        self.job.wait().await
    }

    pub fn dismiss(&self) -> Result<(), JobError> {
        self.job.dismiss()
    }

    pub fn cluster_size(&self) -> u64 {
        self.shared.cluster_size
    }

    pub fn len(&self) -> u64 {
        self.shared.len
    }

    pub fn is_empty(&self) -> bool {
        self.shared.len == 0
    }

    /// Mark every cluster as needing a copy again, so the next write to each cluster is
    /// captured. Only valid in [`SyncMode::None`].
    pub fn checkpoint(&self) -> Result<(), BackupError> {
        if self.shared.sync_mode != SyncMode::None {
            return Err(BackupError::CheckpointUnsupported);
        }
        if let Some(bcs) = self.shared.copy_state() {
            bcs.set_dirty(0, self.shared.len);
            tracing::debug!(job = %self.id(), "checkpoint");
        }
        Ok(())
    }

    /// Clusters not yet on the target. After the job ends this is the state at release.
    pub fn remaining_bitmap(&self) -> Option<ClusterBitmap> {
        match self.shared.copy_state() {
            Some(bcs) => Some(bcs.snapshot_bitmap()),
            None => lock(&self.shared.released).as_ref().map(|(bm, _)| bm.clone()),
        }
    }

    pub fn telemetry(&self) -> CopyTelemetrySnapshot {
        match self.shared.copy_state() {
            Some(bcs) => bcs.telemetry(),
            None => lock(&self.shared.released)
                .as_ref()
                .map(|(_, telemetry)| *telemetry)
                .unwrap_or_default(),
        }
    }

    pub fn error_events(&self) -> Vec<ErrorEvent> {
        self.job.context().error_events()
    }
}
