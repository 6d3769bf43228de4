use std::sync::{Arc, Mutex, PoisonError, Weak};

use async_trait::async_trait;

use super::TrackedWrite;
use crate::CopyError;

/// Callback run before a guest write to a source volume is applied.
#[async_trait]
pub trait BeforeWriteHook: Send + Sync {
    async fn before_write(&self, req: TrackedWrite) -> Result<(), CopyError>;
}

/// Registry of [`BeforeWriteHook`]s owned by a volume.
#[derive(Default)]
pub struct WriteHooks {
    inner: Arc<Mutex<HookList>>,
}

#[derive(Default)]
struct HookList {
    next_id: u64,
    hooks: Vec<(u64, Arc<dyn BeforeWriteHook>)>,
}

impl WriteHooks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install `hook` until the returned registration is dropped.
    #[must_use = "the hook is removed when the registration is dropped"]
    pub fn subscribe(&self, hook: Arc<dyn BeforeWriteHook>) -> WriteHookRegistration {
        let mut list = self.lock();
        let id = list.next_id;
        list.next_id += 1;
        list.hooks.push((id, hook));
        WriteHookRegistration {
            list: Arc::downgrade(&self.inner),
            id,
        }
    }

    pub fn len(&self) -> usize {
        self.lock().hooks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run every installed hook for `req`, returning the first failure.
    ///
    /// All hooks run even when an earlier one fails.
    pub async fn notify(&self, req: TrackedWrite) -> Result<(), CopyError> {
        let hooks: Vec<_> = self.lock().hooks.iter().map(|(_, h)| h.clone()).collect();
        let mut result = Ok(());
        for hook in hooks {
            if let Err(err) = hook.before_write(req).await {
                if result.is_ok() {
                    result = Err(err);
                }
            }
        }
        result
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HookList> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Scope of one [`WriteHooks::subscribe`] call.
pub struct WriteHookRegistration {
    list: Weak<Mutex<HookList>>,
    id: u64,
}

impl Drop for WriteHookRegistration {
    fn drop(&mut self) {
        if let Some(list) = self.list.upgrade() {
            let mut list = list.lock().unwrap_or_else(PoisonError::into_inner);
            list.hooks.retain(|(id, _)| *id != self.id);
        }
    }
}
