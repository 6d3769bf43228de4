use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use hotcopy_bitmap::{ByteRange, ClusterBitmap, DirtyBitmap};

use super::{
    checked_range, BlockDevice, BlockOp, BlockStatus, IoKind, IoStats, IoStatsSnapshot,
    TrackedWrite, WriteFlags, WriteHooks,
};
use crate::VolumeError;

/// Allocation is tracked per 512-byte sector.
const ALLOCATION_GRANULARITY: u64 = 512;

/// One write applied through [`BlockDevice::write_at`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteRecord {
    pub offset: u64,
    pub len: u64,
    pub flags: WriteFlags,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FaultKind {
    Read,
    Write,
}

#[derive(Debug)]
struct FaultRule {
    kind: FaultKind,
    range: ByteRange,
    /// `None` fails forever.
    remaining: Option<u32>,
    error: VolumeError,
}

struct MemState {
    data: Vec<u8>,
    allocated: ClusterBitmap,
    bitmaps: Vec<DirtyBitmap>,
    faults: Vec<FaultRule>,
    write_log: Vec<WriteRecord>,
}

/// In-memory volume.
///
/// Guest I/O goes through [`MemVolume::guest_write`], which runs the before-write hooks and
/// updates the allocation map and attached dirty bitmaps. [`BlockDevice::write_at`] is the path
/// used by the copy engine when this volume is a backup target.
pub struct MemVolume {
    id: String,
    len: u64,
    cluster_size: Result<u64, VolumeError>,
    backing_chain: Vec<String>,
    compression: bool,
    blockers: HashMap<BlockOp, String>,
    inserted: AtomicBool,
    read_delay: Mutex<Option<Duration>>,
    state: Mutex<MemState>,
    hooks: WriteHooks,
    stats: IoStats,
}

impl MemVolume {
    /// A zero-filled volume whose every sector is allocated.
    pub fn new(id: impl Into<String>, len: u64) -> Result<Self, VolumeError> {
        let volume = Self::sparse(id, len)?;
        volume.lock().allocated.set_all();
        Ok(volume)
    }

    /// A zero-filled volume with nothing allocated in its top layer.
    pub fn sparse(id: impl Into<String>, len: u64) -> Result<Self, VolumeError> {
        let bytes = usize::try_from(len).map_err(|_| VolumeError::OffsetOverflow)?;
        let allocated = ClusterBitmap::new(len, ALLOCATION_GRANULARITY)
            .map_err(|_| VolumeError::OffsetOverflow)?;
        Ok(Self {
            id: id.into(),
            len,
            cluster_size: Err(VolumeError::NotSupported("cluster size".to_string())),
            backing_chain: Vec::new(),
            compression: false,
            blockers: HashMap::new(),
            inserted: AtomicBool::new(true),
            read_delay: Mutex::new(None),
            state: Mutex::new(MemState {
                data: vec![0; bytes],
                allocated,
                bitmaps: Vec::new(),
                faults: Vec::new(),
                write_log: Vec::new(),
            }),
            hooks: WriteHooks::new(),
            stats: IoStats::default(),
        })
    }

    pub fn with_native_cluster_size(mut self, cluster_size: u64) -> Self {
        self.cluster_size = Ok(cluster_size);
        self
    }

    /// Make the native cluster size probe fail with `error`.
    pub fn with_cluster_size_error(mut self, error: VolumeError) -> Self {
        self.cluster_size = Err(error);
        self
    }

    /// Ids of the devices reachable through this volume's backing chain, nearest first.
    pub fn with_backing<I, S>(mut self, chain: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.backing_chain = chain.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_compression(mut self) -> Self {
        self.compression = true;
        self
    }

    pub fn block_op(mut self, op: BlockOp, reason: impl Into<String>) -> Self {
        self.blockers.insert(op, reason.into());
        self
    }

    pub fn set_inserted(&self, inserted: bool) {
        self.inserted.store(inserted, Ordering::SeqCst);
    }

    /// Delay every engine-side read by `delay`.
    pub fn set_read_delay(&self, delay: Option<Duration>) {
        *self.read_delay.lock().unwrap_or_else(PoisonError::into_inner) = delay;
    }

    /// Track guest writes to this volume in `bitmap`.
    pub fn attach_dirty_bitmap(&self, bitmap: DirtyBitmap) {
        self.lock().bitmaps.push(bitmap);
    }

    /// Guest write: runs the before-write hooks, then applies `data`.
    ///
    /// A failing hook is logged and does not stop the write.
    pub async fn guest_write(&self, offset: u64, data: &[u8]) -> Result<(), VolumeError> {
        let bytes = data.len() as u64;
        checked_range(offset, bytes, self.len)?;
        if let Err(err) = self.hooks.notify(TrackedWrite { offset, bytes }).await {
            tracing::debug!(volume = %self.id, offset, bytes, error = %err, "before-write hook failed");
        }
        let cookie = self.stats.start(IoKind::Write, bytes);
        self.apply(offset, data, None);
        self.stats.record_write_extent(offset, bytes);
        self.stats.done(cookie);
        Ok(())
    }

    /// Zero `[offset, offset + bytes)` and mark it unallocated.
    pub fn discard(&self, offset: u64, bytes: u64) -> Result<(), VolumeError> {
        checked_range(offset, bytes, self.len)?;
        let mut state = self.lock();
        let (start, end) = (offset as usize, (offset + bytes) as usize);
        state.data[start..end].fill(0);
        state.allocated.reset_range(offset, bytes);
        Ok(())
    }

    /// Fail every engine read overlapping `[offset, offset + bytes)`.
    pub fn fail_reads(&self, offset: u64, bytes: u64, error: VolumeError) {
        self.add_fault(FaultKind::Read, offset, bytes, None, error);
    }

    /// Fail every engine write overlapping `[offset, offset + bytes)`.
    pub fn fail_writes(&self, offset: u64, bytes: u64, error: VolumeError) {
        self.add_fault(FaultKind::Write, offset, bytes, None, error);
    }

    /// Fail the next `times` engine writes overlapping `[offset, offset + bytes)`.
    pub fn fail_writes_times(&self, offset: u64, bytes: u64, times: u32, error: VolumeError) {
        self.add_fault(FaultKind::Write, offset, bytes, Some(times), error);
    }

    pub fn clear_faults(&self) {
        self.lock().faults.clear();
    }

    /// Copy of `[offset, offset + len)` bypassing faults, delays and accounting.
    pub fn peek(&self, offset: u64, len: usize) -> Result<Vec<u8>, VolumeError> {
        checked_range(offset, len as u64, self.len)?;
        let state = self.lock();
        let start = offset as usize;
        Ok(state.data[start..start + len].to_vec())
    }

    /// Writes applied through [`BlockDevice::write_at`], in order.
    pub fn write_log(&self) -> Vec<WriteRecord> {
        self.lock().write_log.clone()
    }

    pub fn is_allocated(&self, offset: u64) -> bool {
        self.lock().allocated.is_dirty(offset)
    }

    pub fn stats(&self) -> IoStatsSnapshot {
        self.stats.snapshot()
    }

    fn add_fault(
        &self,
        kind: FaultKind,
        offset: u64,
        bytes: u64,
        remaining: Option<u32>,
        error: VolumeError,
    ) {
        self.lock().faults.push(FaultRule {
            kind,
            range: ByteRange::new(offset, offset.saturating_add(bytes)),
            remaining,
            error,
        });
    }

    fn check_fault(&self, kind: FaultKind, offset: u64, bytes: u64) -> Result<(), VolumeError> {
        let request = ByteRange::new(offset, offset.saturating_add(bytes));
        let mut state = self.lock();
        let hit = state
            .faults
            .iter_mut()
            .find(|rule| rule.kind == kind && rule.range.overlaps(&request) && rule.remaining != Some(0));
        let Some(rule) = hit else {
            return Ok(());
        };
        if let Some(remaining) = rule.remaining.as_mut() {
            *remaining -= 1;
        }
        Err(rule.error.clone())
    }

    fn apply(&self, offset: u64, data: &[u8], flags: Option<WriteFlags>) {
        let bytes = data.len() as u64;
        let mut state = self.lock();
        let start = offset as usize;
        state.data[start..start + data.len()].copy_from_slice(data);
        state.allocated.set_range(offset, bytes);
        for bitmap in &state.bitmaps {
            bitmap.mark_dirty(offset, bytes);
        }
        if let Some(flags) = flags {
            state.write_log.push(WriteRecord {
                offset,
                len: bytes,
                flags,
            });
        }
    }

    fn lock(&self) -> MutexGuard<'_, MemState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl BlockDevice for MemVolume {
    fn id(&self) -> &str {
        &self.id
    }

    fn is_inserted(&self) -> bool {
        self.inserted.load(Ordering::SeqCst)
    }

    async fn length(&self) -> Result<u64, VolumeError> {
        Ok(self.len)
    }

    async fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<(), VolumeError> {
        let bytes = buf.len() as u64;
        checked_range(offset, bytes, self.len)?;
        let delay = *self.read_delay.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let cookie = self.stats.start(IoKind::Read, bytes);
        self.check_fault(FaultKind::Read, offset, bytes)?;
        {
            let state = self.lock();
            let start = offset as usize;
            buf.copy_from_slice(&state.data[start..start + buf.len()]);
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
        let bytes = data.len() as u64;
        checked_range(offset, bytes, self.len)?;
        let cookie = self.stats.start(IoKind::Write, bytes);
        self.check_fault(FaultKind::Write, offset, bytes)?;
        self.apply(offset, data, Some(flags));
        self.stats.record_write_extent(offset, bytes);
        self.stats.done(cookie);
        Ok(())
    }

    async fn flush(&self) -> Result<(), VolumeError> {
        self.stats.done(self.stats.start(IoKind::Flush, 0));
        Ok(())
    }

    async fn native_cluster_size(&self) -> Result<u64, VolumeError> {
        self.cluster_size.clone()
    }

    fn has_backing(&self) -> bool {
        !self.backing_chain.is_empty()
    }

    fn backing_chain_contains(&self, id: &str) -> bool {
        self.backing_chain.iter().any(|b| b == id)
    }

    fn supports_compression(&self) -> bool {
        self.compression
    }

    fn op_blocker(&self, op: BlockOp) -> Option<String> {
        self.blockers.get(&op).cloned()
    }

    async fn block_status(&self, offset: u64, bytes: u64) -> Result<BlockStatus, VolumeError> {
        let end = offset.saturating_add(bytes).min(self.len);
        if offset >= end {
            return Ok(BlockStatus {
                allocated: false,
                bytes: 0,
            });
        }
        let state = self.lock();
        let allocated = state.allocated.is_dirty(offset);
        let run_end = if allocated {
            state.allocated.next_clean(offset)
        } else {
            state.allocated.next_dirty(offset)
        }
        .unwrap_or(self.len)
        .min(end);
        Ok(BlockStatus {
            allocated,
            bytes: run_end - offset,
        })
    }

    fn write_hooks(&self) -> &WriteHooks {
        &self.hooks
    }
}
