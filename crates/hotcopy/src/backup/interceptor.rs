use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use super::BackupShared;
use crate::job::ErrorAction;
use crate::volume::{BeforeWriteHook, TrackedWrite};
use crate::CopyError;

/// Pause between attempts at copying a cluster whose failure was ignored.
const IGNORED_FAILURE_RETRY_DELAY: Duration = Duration::from_millis(10);

/// Copies the clusters a guest write is about to overwrite before the write lands.
pub(crate) struct BackupInterceptor {
    pub(crate) shared: Arc<BackupShared>,
}

#[async_trait]
impl BeforeWriteHook for BackupInterceptor {
    async fn before_write(&self, req: TrackedWrite) -> Result<(), CopyError> {
        let shared = &self.shared;
        let _drain = shared.flush_lock.read().await;
        if shared.closing.load(Ordering::SeqCst) {
            return Ok(());
        }
        let Some(bcs) = shared.copy_state() else {
            return Ok(());
        };

        tracing::debug!(job = %shared.ctx.id(), offset = req.offset, bytes = req.bytes, "copy before write");
        // Ignored failures are retried until the old data is on the target.
        loop {
            let err = match bcs.copy_range(req.offset, req.bytes, true).await {
                Ok(()) => return Ok(()),
                Err(err) => err,
            };
            if shared.interceptor_failed(&err) != ErrorAction::Ignore || shared.should_stop() {
                return Err(err);
            }
            shared
                .ctx
                .sleep(IGNORED_FAILURE_RETRY_DELAY, &shared.failure_signal)
                .await;
            if shared.should_stop() {
                return Err(err);
            }
        }
    }
}
