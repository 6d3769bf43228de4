//! Minimal job runner: drives a [`JobDriver`] through run, commit or abort, then clean.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::ratelimit::RateLimit;
use crate::{CopyError, JobError, VolumeError};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
    pub struct JobFlags: u32 {
        /// Keep the job in [`JobStatus::Concluded`] until [`JobHandle::dismiss`] is called.
        const MANUAL_DISMISS = 1 << 0;
    }
}

/// Per-device reaction to an I/O error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OnError {
    #[default]
    Report,
    Ignore,
    /// Stop on out-of-space errors, report everything else.
    Enospc,
    Stop,
}

impl OnError {
    pub fn action(self, error: &VolumeError) -> ErrorAction {
        match self {
            OnError::Report => ErrorAction::Report,
            OnError::Ignore => ErrorAction::Ignore,
            OnError::Stop => ErrorAction::Stop,
            OnError::Enospc if *error == VolumeError::NoSpace => ErrorAction::Stop,
            OnError::Enospc => ErrorAction::Report,
        }
    }
}

/// Decision taken for one failed I/O.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorAction {
    Report,
    Ignore,
    Stop,
}

impl std::fmt::Display for ErrorAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            ErrorAction::Report => "report",
            ErrorAction::Ignore => "ignore",
            ErrorAction::Stop => "stop",
        })
    }
}

/// Record of one routed I/O error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorEvent {
    pub action: ErrorAction,
    pub is_read: bool,
    pub offset: u64,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobStatus {
    Created,
    Running,
    Aborting,
    Concluded,
    /// Dismissed; the job no longer exists.
    Null,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Completed,
    Cancelled,
    Failed(JobError),
}

impl JobOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, JobOutcome::Completed)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JobProgress {
    pub current: u64,
    pub total: u64,
}

/// Job-specific behaviour plugged into the runner.
#[async_trait]
pub trait JobDriver: Send + Sync + 'static {
    fn job_type(&self) -> &'static str;

    async fn run(&self, ctx: &JobContext) -> Result<(), JobError>;

    /// Called after `run` completed successfully.
    fn commit(&self, _ctx: &JobContext) {}

    /// Called after `run` failed or was cancelled.
    fn abort(&self, _ctx: &JobContext) {}

    /// Called last, on every path.
    fn clean(&self, _ctx: &JobContext) {}
}

struct ContextInner {
    id: String,
    flags: JobFlags,
    cancel: CancellationToken,
    progress_current: AtomicU64,
    progress_total: AtomicU64,
    speed: AtomicU64,
    limit: Mutex<RateLimit>,
    status: watch::Sender<JobStatus>,
    errors: Mutex<Vec<ErrorEvent>>,
}

/// State shared between a running job and its handle.
#[derive(Clone)]
pub struct JobContext {
    inner: Arc<ContextInner>,
}

impl std::fmt::Debug for JobContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobContext")
            .field("id", &self.inner.id)
            .field("flags", &self.inner.flags)
            .field("status", &self.status())
            .field("progress", &self.progress())
            .finish_non_exhaustive()
    }
}

impl JobContext {
    pub fn new(id: impl Into<String>, speed: u64, flags: JobFlags) -> Self {
        let mut limit = RateLimit::new();
        limit.set_speed(speed);
        let (status, _) = watch::channel(JobStatus::Created);
        Self {
            inner: Arc::new(ContextInner {
                id: id.into(),
                flags,
                cancel: CancellationToken::new(),
                progress_current: AtomicU64::new(0),
                progress_total: AtomicU64::new(0),
                speed: AtomicU64::new(speed),
                limit: Mutex::new(limit),
                status,
                errors: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn flags(&self) -> JobFlags {
        self.inner.flags
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    pub fn cancel(&self) {
        self.inner.cancel.cancel();
    }

    /// Resolves once the job is cancelled.
    pub async fn cancelled(&self) {
        self.inner.cancel.cancelled().await;
    }

    /// Sleep for `delay`, returning early when the job or `interrupt` is cancelled. A zero delay
    /// still yields.
    pub async fn sleep(&self, delay: Duration, interrupt: &CancellationToken) {
        if delay.is_zero() {
            tokio::task::yield_now().await;
            return;
        }
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = self.inner.cancel.cancelled() => {}
            _ = interrupt.cancelled() => {}
        }
    }

    /// Delay owed after dispatching `bytes`; zero when the job is unthrottled.
    pub fn ratelimit_delay(&self, bytes: u64) -> Duration {
        let mut limit = lock(&self.inner.limit);
        if !limit.is_enabled() {
            return Duration::ZERO;
        }
        limit.calculate_delay(bytes, tokio::time::Instant::now())
    }

    pub fn speed(&self) -> u64 {
        self.inner.speed.load(Ordering::Relaxed)
    }

    /// Change the throughput limit in bytes per second; zero removes it.
    pub fn set_speed(&self, speed: u64) {
        lock(&self.inner.limit).set_speed(speed);
        self.inner.speed.store(speed, Ordering::Relaxed);
        tracing::debug!(job = %self.inner.id, speed, "job speed changed");
    }

    pub fn progress_update(&self, bytes: u64) {
        self.inner.progress_current.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Set the estimate of remaining work; the total becomes done + remaining.
    pub fn progress_set_remaining(&self, remaining: u64) {
        let current = self.inner.progress_current.load(Ordering::Relaxed);
        self.inner
            .progress_total
            .store(current.saturating_add(remaining), Ordering::Relaxed);
    }

    pub fn progress(&self) -> JobProgress {
        JobProgress {
            current: self.inner.progress_current.load(Ordering::Relaxed),
            total: self.inner.progress_total.load(Ordering::Relaxed),
        }
    }

    /// Route a copy failure through `policy`, recording the decision.
    pub fn error_action(&self, policy: OnError, error: &CopyError) -> ErrorAction {
        let action = policy.action(error.volume_error());
        let event = ErrorEvent {
            action,
            is_read: error.is_read(),
            offset: error.offset(),
            message: error.to_string(),
        };
        match action {
            ErrorAction::Ignore => tracing::warn!(
                job = %self.inner.id,
                offset = event.offset,
                is_read = event.is_read,
                %action,
                error = %error,
                "ignoring I/O error"
            ),
            ErrorAction::Report | ErrorAction::Stop => tracing::error!(
                job = %self.inner.id,
                offset = event.offset,
                is_read = event.is_read,
                %action,
                error = %error,
                "I/O error"
            ),
        }
        lock(&self.inner.errors).push(event);
        action
    }

    pub fn error_events(&self) -> Vec<ErrorEvent> {
        lock(&self.inner.errors).clone()
    }

    pub fn status(&self) -> JobStatus {
        *self.inner.status.borrow()
    }

    fn set_status(&self, status: JobStatus) {
        self.inner.status.send_replace(status);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct Job;

impl Job {
    /// Run `driver` on a new tokio task.
    pub fn spawn(ctx: JobContext, driver: Arc<dyn JobDriver>) -> JobHandle {
        let task_ctx = ctx.clone();
        let task = tokio::spawn(async move { drive(task_ctx, driver).await });
        JobHandle {
            ctx,
            task: Some(task),
            outcome: None,
        }
    }
}

async fn drive(ctx: JobContext, driver: Arc<dyn JobDriver>) -> JobOutcome {
    ctx.set_status(JobStatus::Running);
    tracing::info!(job = %ctx.id(), job_type = driver.job_type(), "job started");

    let outcome = match driver.run(&ctx).await {
        Ok(()) if ctx.is_cancelled() => JobOutcome::Cancelled,
        Ok(()) => JobOutcome::Completed,
        Err(JobError::Cancelled) => JobOutcome::Cancelled,
        Err(err) => JobOutcome::Failed(err),
    };

    if outcome.is_completed() {
        driver.commit(&ctx);
    } else {
        ctx.set_status(JobStatus::Aborting);
        driver.abort(&ctx);
    }
    driver.clean(&ctx);

    match &outcome {
        JobOutcome::Completed => tracing::info!(job = %ctx.id(), "job completed"),
        JobOutcome::Cancelled => tracing::info!(job = %ctx.id(), "job cancelled"),
        JobOutcome::Failed(err) => tracing::error!(job = %ctx.id(), error = %err, "job failed"),
    }

    ctx.set_status(JobStatus::Concluded);
    if !ctx.flags().contains(JobFlags::MANUAL_DISMISS) {
        ctx.set_status(JobStatus::Null);
    }
    outcome
}

/// Handle to a spawned job. Dropping it before the job finished cancels the job.
pub struct JobHandle {
    ctx: JobContext,
    task: Option<JoinHandle<JobOutcome>>,
    outcome: Option<JobOutcome>,
}

impl JobHandle {
    pub fn id(&self) -> &str {
        self.ctx.id()
    }

    pub fn context(&self) -> &JobContext {
        &self.ctx
    }

    pub fn status(&self) -> JobStatus {
        self.ctx.status()
    }

    pub fn progress(&self) -> JobProgress {
        self.ctx.progress()
    }

    pub fn set_speed(&self, speed: u64) {
        self.ctx.set_speed(speed);
    }

    pub fn cancel(&self) {
        tracing::info!(job = %self.ctx.id(), "job cancel requested");
        self.ctx.cancel();
    }

    /// Wait for the job to conclude. Later calls return the same outcome.
    pub async fn wait(&mut self) -> JobOutcome {
        if let Some(outcome) = &self.outcome {
            return outcome.clone();
        }
        // Cancel-safe: the task handle is only released once it has resolved.
        let outcome = match self.task.as_mut() {
            Some(task) => match task.await {
                Ok(outcome) => outcome,
                Err(err) => JobOutcome::Failed(JobError::Internal(err.to_string())),
            },
            None => JobOutcome::Failed(JobError::InvalidState("job task already consumed")),
        };
        self.task = None;
        self.outcome = Some(outcome.clone());
        outcome
    }

    /// Remove a concluded job created with [`JobFlags::MANUAL_DISMISS`].
    pub fn dismiss(&self) -> Result<(), JobError> {
        if !self.ctx.flags().contains(JobFlags::MANUAL_DISMISS) {
            return Err(JobError::InvalidState("job is dismissed automatically"));
        }
        if self.ctx.status() != JobStatus::Concluded {
            return Err(JobError::InvalidState("job has not concluded"));
        }
        self.ctx.set_status(JobStatus::Null);
        Ok(())
    }
}

impl Drop for JobHandle {
    fn drop(&mut self) {
        if let Some(task) = &self.task {
            if !task.is_finished() {
                self.ctx.cancel();
            }
        }
    }
}
