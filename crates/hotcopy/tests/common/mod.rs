#![allow(dead_code)]

use std::ops::Range;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use hotcopy::volume::{BlockStatus, WriteHooks};
use hotcopy::{BlockDevice, MemVolume, VolumeError, WriteFlags};
use tokio::sync::Semaphore;

pub const CLUSTER: u64 = 64 * 1024;
pub const CLUSTERS: u64 = 16;
pub const LEN: u64 = CLUSTERS * CLUSTER;

/// A volume whose cluster `i` is filled with byte `i + 1`.
pub async fn patterned(id: &str) -> MemVolume {
    let vol = MemVolume::new(id, LEN).unwrap();
    for idx in 0..CLUSTERS {
        vol.guest_write(idx * CLUSTER, &vec![idx as u8 + 1; CLUSTER as usize])
            .await
            .unwrap();
    }
    vol
}

pub fn target(id: &str) -> Arc<MemVolume> {
    Arc::new(MemVolume::new(id, LEN).unwrap())
}

/// Cluster indices of the target writes, in order.
pub fn written_clusters(target: &MemVolume) -> Vec<u64> {
    target
        .write_log()
        .iter()
        .map(|w| w.offset / CLUSTER)
        .collect()
}

pub fn cluster_indices(bitmap: &hotcopy::ClusterBitmap) -> Vec<u64> {
    bitmap
        .iter_dirty()
        .map(|off| off / bitmap.granularity())
        .collect()
}

/// Resolves once a before-write hook is installed on `device`.
pub async fn wait_for_hook(device: &dyn BlockDevice) {
    while device.write_hooks().is_empty() {
        tokio::task::yield_now().await;
    }
}

pub async fn wait_until(mut cond: impl FnMut() -> bool) {
    while !cond() {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
}

/// Wraps a [`MemVolume`] and holds every engine read until a permit is released.
pub struct GatedVolume {
    pub inner: MemVolume,
    pub gate: Semaphore,
    pub reads_started: AtomicU64,
}

impl GatedVolume {
    pub fn new(inner: MemVolume) -> Self {
        Self {
            inner,
            gate: Semaphore::new(0),
            reads_started: AtomicU64::new(0),
        }
    }

    pub fn release(&self, reads: usize) {
        self.gate.add_permits(reads);
    }

    pub fn reads_started(&self) -> u64 {
        self.reads_started.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BlockDevice for GatedVolume {
    fn id(&self) -> &str {
        self.inner.id()
    }

    async fn length(&self) -> Result<u64, VolumeError> {
        self.inner.length().await
    }

    async fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<(), VolumeError> {
        self.reads_started.fetch_add(1, Ordering::SeqCst);
        let permit = self
            .gate
            .acquire()
            .await
            .map_err(|_| VolumeError::Io("gate closed".to_string()))?;
        permit.forget();
        self.inner.read_at(offset, buf).await
    }

    async fn write_at(
        &self,
        offset: u64,
        data: &[u8],
        flags: WriteFlags,
    ) -> Result<(), VolumeError> {
        self.inner.write_at(offset, data, flags).await
    }

    async fn block_status(&self, offset: u64, bytes: u64) -> Result<BlockStatus, VolumeError> {
        self.inner.block_status(offset, bytes).await
    }

    fn write_hooks(&self) -> &WriteHooks {
        self.inner.write_hooks()
    }
}

/// Wraps a [`MemVolume`] and holds allocation queries in `gated` until a permit is released.
/// Reads and writes pass straight through.
pub struct StatusGatedVolume {
    pub inner: MemVolume,
    pub gate: Semaphore,
    gated: Range<u64>,
    status_calls: AtomicU64,
    status_error: Mutex<Option<VolumeError>>,
}

impl StatusGatedVolume {
    /// Holds every query starting inside `gated`.
    pub fn new(inner: MemVolume, gated: Range<u64>) -> Self {
        Self {
            inner,
            gate: Semaphore::new(0),
            gated,
            status_calls: AtomicU64::new(0),
            status_error: Mutex::new(None),
        }
    }

    pub fn gate_all(inner: MemVolume) -> Self {
        Self::new(inner, 0..u64::MAX)
    }

    pub fn ungated(inner: MemVolume) -> Self {
        Self::new(inner, 0..0)
    }

    /// Make every later query fail with `error`.
    pub fn fail_status(&self, error: VolumeError) {
        *self.status_error.lock().unwrap() = Some(error);
    }

    pub fn release(&self, queries: usize) {
        self.gate.add_permits(queries);
    }

    pub fn status_calls(&self) -> u64 {
        self.status_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BlockDevice for StatusGatedVolume {
    fn id(&self) -> &str {
        self.inner.id()
    }

    async fn length(&self) -> Result<u64, VolumeError> {
        self.inner.length().await
    }

    async fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<(), VolumeError> {
        self.inner.read_at(offset, buf).await
    }

    async fn write_at(
        &self,
        offset: u64,
        data: &[u8],
        flags: WriteFlags,
    ) -> Result<(), VolumeError> {
        self.inner.write_at(offset, data, flags).await
    }

    async fn block_status(&self, offset: u64, bytes: u64) -> Result<BlockStatus, VolumeError> {
        self.status_calls.fetch_add(1, Ordering::SeqCst);
        if self.gated.contains(&offset) {
            let permit = self
                .gate
                .acquire()
                .await
                .map_err(|_| VolumeError::Io("gate closed".to_string()))?;
            permit.forget();
        }
        let error = self.status_error.lock().unwrap().clone();
        match error {
            Some(error) => Err(error),
            None => self.inner.block_status(offset, bytes).await,
        }
    }

    fn write_hooks(&self) -> &WriteHooks {
        self.inner.write_hooks()
    }
}
