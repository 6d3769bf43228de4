use std::sync::{Arc, Mutex, MutexGuard};

use crate::{BitmapError, ClusterBitmap, Result};

/// A named dirty bitmap shared between a volume's write path and backup jobs.
///
/// While a successor exists the bitmap is *frozen*: the primary keeps the state it had when the
/// successor was created and new writes are recorded in the successor only. The job that created
/// the successor ends the freeze with exactly one of [`DirtyBitmap::abdicate`] or
/// [`DirtyBitmap::reclaim`].
#[derive(Clone)]
pub struct DirtyBitmap {
    name: Arc<str>,
    inner: Arc<Mutex<DirtyBitmapState>>,
}

struct DirtyBitmapState {
    primary: ClusterBitmap,
    successor: Option<ClusterBitmap>,
    readonly: bool,
}

impl std::fmt::Debug for DirtyBitmap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state();
        f.debug_struct("DirtyBitmap")
            .field("name", &self.name)
            .field("len", &state.primary.len())
            .field("granularity", &state.primary.granularity())
            .field("dirty_clusters", &state.primary.dirty_clusters())
            .field("frozen", &state.successor.is_some())
            .field("readonly", &state.readonly)
            .finish()
    }
}

impl DirtyBitmap {
    pub fn new(name: impl Into<Arc<str>>, len: u64, granularity: u64) -> Result<Self> {
        Ok(Self::from_bitmap(name, ClusterBitmap::new(len, granularity)?))
    }

    pub fn from_bitmap(name: impl Into<Arc<str>>, primary: ClusterBitmap) -> Self {
        Self {
            name: name.into(),
            inner: Arc::new(Mutex::new(DirtyBitmapState {
                primary,
                successor: None,
                readonly: false,
            })),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> u64 {
        self.state().primary.len()
    }

    pub fn granularity(&self) -> u64 {
        self.state().primary.granularity()
    }

    /// Record a write to `[offset, offset + bytes)`.
    pub fn mark_dirty(&self, offset: u64, bytes: u64) {
        let mut state = self.state();
        match state.successor.as_mut() {
            Some(successor) => successor.set_range(offset, bytes),
            None => state.primary.set_range(offset, bytes),
        };
    }

    pub fn is_frozen(&self) -> bool {
        self.state().successor.is_some()
    }

    pub fn is_readonly(&self) -> bool {
        self.state().readonly
    }

    pub fn set_readonly(&self, readonly: bool) {
        self.state().readonly = readonly;
    }

    /// Fails when the bitmap cannot be modified by a new user.
    pub fn check_writable(&self) -> Result<()> {
        let state = self.state();
        if state.successor.is_some() {
            return Err(BitmapError::Busy {
                name: self.name.to_string(),
            });
        }
        if state.readonly {
            return Err(BitmapError::ReadOnly {
                name: self.name.to_string(),
            });
        }
        Ok(())
    }

    /// Freeze the primary and start recording new writes in a fresh successor.
    pub fn create_successor(&self) -> Result<()> {
        let mut state = self.state();
        if state.successor.is_some() {
            return Err(BitmapError::Busy {
                name: self.name.to_string(),
            });
        }
        let successor = ClusterBitmap::new(state.primary.len(), state.primary.granularity())?;
        state.successor = Some(successor);
        Ok(())
    }

    /// Drop the frozen primary and promote the successor.
    pub fn abdicate(&self) -> Result<()> {
        let mut state = self.state();
        let successor = state.successor.take().ok_or_else(|| BitmapError::NoSuccessor {
            name: self.name.to_string(),
        })?;
        state.primary = successor;
        Ok(())
    }

    /// Merge the successor back into the primary, which stays primary.
    pub fn reclaim(&self) -> Result<()> {
        let mut state = self.state();
        let successor = state.successor.take().ok_or_else(|| BitmapError::NoSuccessor {
            name: self.name.to_string(),
        })?;
        state.primary.merge_from(&successor)
    }

    /// OR `other` into the primary.
    pub fn merge_into_primary(&self, other: &ClusterBitmap) -> Result<()> {
        self.state().primary.merge_from(other)
    }

    /// Copy of the primary. While frozen this is the state at successor creation.
    pub fn snapshot(&self) -> ClusterBitmap {
        self.state().primary.clone()
    }

    pub fn dirty_count(&self) -> u64 {
        self.state().primary.dirty_count()
    }

    fn state(&self) -> MutexGuard<'_, DirtyBitmapState> {
        // Every mutation is a single bitmap operation; a poisoned state is still consistent.
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}
