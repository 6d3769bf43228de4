use hotcopy_bitmap::{BitmapError, ClusterBitmap, DirtyBitmap};

use super::BitmapSyncPolicy;

/// What happens to a frozen sync bitmap when the job ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BitmapAction {
    /// Drop the frozen bitmap and promote its successor.
    Abdicate,
    /// Merge the successor back into the frozen bitmap.
    Reclaim,
}

pub fn sync_bitmap_action(success: bool, policy: BitmapSyncPolicy) -> BitmapAction {
    let sync = (success || policy == BitmapSyncPolicy::Always) && policy != BitmapSyncPolicy::Never;
    if sync {
        BitmapAction::Abdicate
    } else {
        BitmapAction::Reclaim
    }
}

/// Resolve the successor of `bitmap`.
///
/// A failed job under [`BitmapSyncPolicy::Always`] also merges `uncopied` into the result so it
/// still names every cluster the job did not copy.
pub(crate) fn cleanup_sync_bitmap(
    bitmap: &DirtyBitmap,
    policy: BitmapSyncPolicy,
    success: bool,
    uncopied: Option<&ClusterBitmap>,
) -> Result<BitmapAction, BitmapError> {
    let action = sync_bitmap_action(success, policy);
    match action {
        BitmapAction::Abdicate => bitmap.abdicate()?,
        BitmapAction::Reclaim => bitmap.reclaim()?,
    }
    if !success && policy == BitmapSyncPolicy::Always {
        if let Some(uncopied) = uncopied {
            bitmap.merge_into_primary(uncopied)?;
        }
    }
    Ok(action)
}

#[cfg(test)]
mod tests {
    use super::*;

    const CLUSTER: u64 = 1 << 16;
    const LEN: u64 = 16 * CLUSTER;

    fn clusters(bitmap: &ClusterBitmap) -> Vec<u64> {
        bitmap.iter_dirty().map(|off| off / CLUSTER).collect()
    }

    fn frozen() -> DirtyBitmap {
        let bitmap = DirtyBitmap::new("b0", LEN, CLUSTER).unwrap();
        bitmap.mark_dirty(3 * CLUSTER, 1);
        bitmap.create_successor().unwrap();
        bitmap.mark_dirty(9 * CLUSTER, 1);
        bitmap
    }

    #[test]
    fn action_table() {
        use BitmapAction::*;
        use BitmapSyncPolicy::*;
        assert_eq!(sync_bitmap_action(true, OnSuccess), Abdicate);
        assert_eq!(sync_bitmap_action(true, Always), Abdicate);
        assert_eq!(sync_bitmap_action(true, Never), Reclaim);
        assert_eq!(sync_bitmap_action(false, OnSuccess), Reclaim);
        assert_eq!(sync_bitmap_action(false, Always), Abdicate);
        assert_eq!(sync_bitmap_action(false, Never), Reclaim);
    }

    #[test]
    fn failure_with_always_keeps_uncopied_clusters() {
        let bitmap = frozen();
        let mut uncopied = ClusterBitmap::new(LEN, CLUSTER).unwrap();
        uncopied.set_range(5 * CLUSTER, 2 * CLUSTER);

        let action =
            cleanup_sync_bitmap(&bitmap, BitmapSyncPolicy::Always, false, Some(&uncopied)).unwrap();
        assert_eq!(action, BitmapAction::Abdicate);
        assert!(!bitmap.is_frozen());
        assert_eq!(clusters(&bitmap.snapshot()), vec![5, 6, 9]);
    }

    #[test]
    fn failure_on_success_policy_reclaims() {
        let bitmap = frozen();
        let uncopied = ClusterBitmap::new(LEN, CLUSTER).unwrap();

        let action =
            cleanup_sync_bitmap(&bitmap, BitmapSyncPolicy::OnSuccess, false, Some(&uncopied))
                .unwrap();
        assert_eq!(action, BitmapAction::Reclaim);
        assert_eq!(clusters(&bitmap.snapshot()), vec![3, 9]);
    }

    #[test]
    fn cleanup_without_successor_fails() {
        let bitmap = DirtyBitmap::new("b1", LEN, CLUSTER).unwrap();
        assert!(matches!(
            cleanup_sync_bitmap(&bitmap, BitmapSyncPolicy::Never, true, None),
            Err(BitmapError::NoSuccessor { .. })
        ));
    }
}
