#![cfg(not(target_arch = "wasm32"))]

mod common;

use std::sync::Arc;

use common::*;
use hotcopy::{
    BackupJob, BackupOptions, BitmapSyncPolicy, BlockDevice, CopyError, DirtyBitmap, ErrorAction,
    JobError, JobOutcome, OnError, SyncMode, VolumeError,
};

#[tokio::test]
async fn full_sync_without_writer_copies_every_cluster_in_order() {
    let source = Arc::new(patterned("src").await);
    let target = target("dst");

    let job = BackupJob::create(source.clone(), target.clone(), BackupOptions::default())
        .await
        .unwrap();
    assert_eq!(job.cluster_size(), CLUSTER);
    let mut handle = job.start();

    assert_eq!(handle.wait().await, JobOutcome::Completed);
    assert_eq!(written_clusters(&target), (0..CLUSTERS).collect::<Vec<_>>());
    assert_eq!(
        target.peek(0, LEN as usize).unwrap(),
        source.peek(0, LEN as usize).unwrap()
    );
    assert!(handle.remaining_bitmap().unwrap().is_clean());

    let progress = handle.progress();
    assert_eq!(progress.current, LEN);
    assert_eq!(progress.total, LEN);
    assert_eq!(handle.telemetry().loop_copies, CLUSTERS);
    assert!(source.write_hooks().is_empty());
}

#[tokio::test]
async fn none_mode_copies_only_what_the_guest_overwrites() {
    let source = Arc::new(patterned("src").await);
    let target = target("dst");
    let options = BackupOptions {
        sync_mode: SyncMode::None,
        ..Default::default()
    };
    let mut handle = BackupJob::create(source.clone(), target.clone(), options)
        .await
        .unwrap()
        .start();
    wait_for_hook(source.as_ref()).await;

    source.guest_write(4096, &[0x5a; 512]).await.unwrap();

    // Cluster 0 reached the target with its pre-write contents; the write itself went through.
    assert_eq!(written_clusters(&target), vec![0]);
    assert_eq!(target.peek(4096, 512).unwrap(), vec![1; 512]);
    assert_eq!(source.peek(4096, 512).unwrap(), vec![0x5a; 512]);

    handle.cancel();
    assert_eq!(handle.wait().await, JobOutcome::Cancelled);

    let remaining = handle.remaining_bitmap().unwrap();
    assert_eq!(cluster_indices(&remaining), (1..CLUSTERS).collect::<Vec<_>>());
    assert_eq!(handle.telemetry().notifier_copies, 1);
    assert!(source.write_hooks().is_empty());
}

#[tokio::test]
async fn bitmap_mode_copies_marked_clusters_and_abdicates() {
    let source = Arc::new(patterned("src").await);
    let target = target("dst");
    let bitmap = DirtyBitmap::new("incr0", LEN, CLUSTER).unwrap();
    for idx in [3, 7, 12] {
        bitmap.mark_dirty(idx * CLUSTER, CLUSTER);
    }
    source.attach_dirty_bitmap(bitmap.clone());

    let options = BackupOptions {
        sync_mode: SyncMode::Bitmap,
        sync_bitmap: Some(bitmap.clone()),
        bitmap_policy: BitmapSyncPolicy::Always,
        ..Default::default()
    };
    let mut handle = BackupJob::create(source.clone(), target.clone(), options)
        .await
        .unwrap()
        .start();
    assert!(bitmap.is_frozen());
    wait_for_hook(source.as_ref()).await;

    // Lands in the successor while the job runs.
    source.guest_write(CLUSTER, &[0xee; 512]).await.unwrap();

    assert_eq!(handle.wait().await, JobOutcome::Completed);
    assert_eq!(written_clusters(&target), vec![3, 7, 12]);
    assert_eq!(handle.progress().current, 3 * CLUSTER);

    assert!(!bitmap.is_frozen());
    assert_eq!(cluster_indices(&bitmap.snapshot()), vec![1]);
}

#[tokio::test]
async fn target_write_failure_with_stop_keeps_uncopied_clusters_in_bitmap() {
    let source = Arc::new(patterned("src").await);
    let target = target("dst");
    target.fail_writes(5 * CLUSTER, 1, VolumeError::Io("target gone".into()));
    let bitmap = DirtyBitmap::new("incr0", LEN, CLUSTER).unwrap();
    bitmap.mark_dirty(0, LEN);

    let options = BackupOptions {
        sync_mode: SyncMode::Full,
        sync_bitmap: Some(bitmap.clone()),
        bitmap_policy: BitmapSyncPolicy::Always,
        on_target_error: OnError::Stop,
        ..Default::default()
    };
    let mut handle = BackupJob::create(source.clone(), target.clone(), options)
        .await
        .unwrap()
        .start();

    let outcome = handle.wait().await;
    assert_eq!(
        outcome,
        JobOutcome::Failed(JobError::Copy {
            action: ErrorAction::Stop,
            source: CopyError::Write {
                offset: 5 * CLUSTER,
                source: VolumeError::Io("target gone".into()),
            },
        })
    );
    assert_eq!(written_clusters(&target), vec![0, 1, 2, 3, 4]);
    assert!(!bitmap.is_frozen());
    assert_eq!(cluster_indices(&bitmap.snapshot()), (5..CLUSTERS).collect::<Vec<_>>());

    let events = handle.error_events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].action, ErrorAction::Stop);
    assert!(!events[0].is_read);
}

#[tokio::test]
async fn top_mode_skips_unallocated_clusters() {
    let source = patterned("src").await;
    source.discard(8 * CLUSTER, 8 * CLUSTER).unwrap();
    let source = Arc::new(source);
    let target = target("dst");

    let options = BackupOptions {
        sync_mode: SyncMode::Top,
        ..Default::default()
    };
    let mut handle = BackupJob::create(source.clone(), target.clone(), options)
        .await
        .unwrap()
        .start();

    assert_eq!(handle.wait().await, JobOutcome::Completed);
    assert_eq!(written_clusters(&target), (0..8).collect::<Vec<_>>());
    assert!(handle.remaining_bitmap().unwrap().is_clean());

    let telemetry = handle.telemetry();
    assert_eq!(telemetry.clusters_skipped, 8);
    assert_eq!(telemetry.loop_copies, 8);
    let progress = handle.progress();
    assert_eq!(progress.current, 8 * CLUSTER);
    assert_eq!(progress.total, 8 * CLUSTER);
}

#[tokio::test]
async fn failure_with_on_success_policy_reclaims() {
    let source = Arc::new(patterned("src").await);
    let target = target("dst");
    target.fail_writes(2 * CLUSTER, 1, VolumeError::NoSpace);
    let bitmap = DirtyBitmap::new("incr0", LEN, CLUSTER).unwrap();
    for idx in [1, 2, 9] {
        bitmap.mark_dirty(idx * CLUSTER, 1);
    }

    let options = BackupOptions {
        sync_mode: SyncMode::Bitmap,
        sync_bitmap: Some(bitmap.clone()),
        on_target_error: OnError::Enospc,
        ..Default::default()
    };
    let mut handle = BackupJob::create(source.clone(), target.clone(), options)
        .await
        .unwrap()
        .start();

    assert!(matches!(
        handle.wait().await,
        JobOutcome::Failed(JobError::Copy {
            action: ErrorAction::Stop,
            ..
        })
    ));
    // Nothing is dropped from the original bitmap, not even the copied cluster 1.
    assert_eq!(cluster_indices(&bitmap.snapshot()), vec![1, 2, 9]);
}
