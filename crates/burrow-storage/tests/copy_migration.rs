//! Copy engine and migration stream behaviour, plus the concurrency
//! contracts around mounts and image creation.

mod common;

use burrow_storage::{FramedTransport, MockZfsEngine, PoolConfig, StorageError, ZfsEngine};
use common::{harness, Harness, RecordingHooks};
use std::time::Duration;

#[tokio::test]
async fn test_sparse_copy_preserves_content() {
    let h = harness("pc1", "poolc1");

    h.driver.container_create("src", false).await.unwrap();
    h.zfs.write_file("poolc1/containers/src", "root/data", "payload");

    h.driver
        .container_copy("dst", "src", "pc1", false, true)
        .await
        .unwrap();

    assert_eq!(
        h.zfs.contents_of("poolc1/containers/dst"),
        h.zfs.contents_of("poolc1/containers/src")
    );
    // The ephemeral snapshot stays behind as the clone's origin.
    let origin = h.zfs.origin_of("poolc1/containers/dst").unwrap();
    assert!(origin.starts_with("poolc1/containers/src@copy-"));
    assert_eq!(h.hooks.template_count("dst", "copy"), 1);
}

#[tokio::test]
async fn test_full_copy_when_clone_copy_disabled() {
    let pool = PoolConfig::new("pc2")
        .with("zfs.pool_name", "poolc2")
        .with("zfs.clone_copy", "false");
    let h = Harness::new(pool);

    h.driver.container_create("src", false).await.unwrap();
    h.zfs.write_file("poolc2/containers/src", "root/data", "payload");

    h.driver
        .container_copy("dst", "src", "pc2", false, true)
        .await
        .unwrap();

    assert_eq!(
        h.zfs.read_file("poolc2/containers/dst", "root/data").unwrap(),
        "payload"
    );
    // A full copy is independent: no origin, and the bridging snapshot is
    // gone on both ends.
    assert!(h.zfs.origin_of("poolc2/containers/dst").is_none());
    assert!(h.zfs.snapshot_labels("poolc2/containers/dst").is_empty());
    assert!(h.zfs.snapshot_labels("poolc2/containers/src").is_empty());
    assert_eq!(
        h.zfs.property("poolc2/containers/dst", "canmount").unwrap(),
        "noauto"
    );
    assert_eq!(
        h.zfs.property("poolc2/containers/dst", "mountpoint").unwrap(),
        h.driver
            .layout()
            .container_mount_point("dst")
            .display()
            .to_string()
    );
}

#[tokio::test]
async fn test_copy_with_history_replays_snapshot_chain() {
    let h = harness("pc3", "poolc3");

    h.driver.container_create("src", false).await.unwrap();
    h.zfs.write_file("poolc3/containers/src", "root/data", "v1");
    h.driver.snapshot_create("src", "s1").await.unwrap();
    h.zfs.write_file("poolc3/containers/src", "root/data", "v2");
    h.driver.snapshot_create("src", "s2").await.unwrap();
    h.zfs.write_file("poolc3/containers/src", "root/data", "v3");

    h.hooks.set_snapshots("src", &["s1", "s2"]);

    h.driver
        .container_copy("dst", "src", "pc3", false, false)
        .await
        .unwrap();

    assert_eq!(
        h.zfs.snapshot_labels("poolc3/containers/dst"),
        vec!["snapshot-s1".to_string(), "snapshot-s2".to_string()]
    );
    assert_eq!(
        h.zfs.read_file("poolc3/containers/dst", "root/data").unwrap(),
        "v3"
    );
    // No copy-send bridge snapshots linger on either end.
    assert_eq!(
        h.zfs.snapshot_labels("poolc3/containers/src"),
        vec!["snapshot-s1".to_string(), "snapshot-s2".to_string()]
    );
}

#[tokio::test]
async fn test_cross_pool_copy_is_rejected() {
    let h = harness("pc4", "poolc4");
    h.driver.container_create("src", false).await.unwrap();

    let err = h
        .driver
        .container_copy("dst", "src", "other-pool", false, true)
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::PoolMismatch { .. }));
}

#[tokio::test]
async fn test_copy_without_source_dataset_falls_back_to_rsync() {
    let h = harness("pc5", "poolc5");

    h.driver
        .container_copy("dst", "ghost", "pc5", false, true)
        .await
        .unwrap();

    // The target was built empty and filled over rsync.
    assert!(h.zfs.has_dataset("poolc5/containers/dst"));
    assert_eq!(h.hooks.rsync_calls.lock().unwrap().len(), 1);
    assert_eq!(h.hooks.template_count("dst", "copy"), 1);
}

#[tokio::test]
async fn test_live_migration_round_trip() {
    let source = harness("pm-src", "poolmsrc");
    let sink = harness("pm-snk", "poolmsnk");

    source.driver.container_create("ct", false).await.unwrap();
    source
        .zfs
        .write_file("poolmsrc/containers/ct", "root/data", "v1");
    source.driver.snapshot_create("ct", "s1").await.unwrap();
    source
        .zfs
        .write_file("poolmsrc/containers/ct", "root/data", "v2");
    source.driver.snapshot_create("ct", "s2").await.unwrap();
    source
        .zfs
        .write_file("poolmsrc/containers/ct", "root/data", "v3");

    let mut migration = source.driver.migration_source("ct", false).await.unwrap();
    assert_eq!(
        migration.snapshots(),
        &["snapshot-s1".to_string(), "snapshot-s2".to_string()]
    );

    let (near, far) = tokio::io::duplex(1 << 16);
    let sink_driver = sink.driver.clone();
    let sink_task = tokio::spawn(async move {
        let mut transport = FramedTransport::new(far);
        sink_driver
            .migration_sink(
                true,
                "ct",
                &["s1".to_string(), "s2".to_string()],
                &mut transport,
                None,
                false,
            )
            .await
    });

    let mut transport = FramedTransport::new(near);
    migration
        .send_while_running(&mut transport, None, false)
        .await
        .unwrap();

    // Simulate the delta written between checkpoint and final sync.
    source
        .zfs
        .write_file("poolmsrc/containers/ct", "root/data", "v4");
    migration.send_after_checkpoint(&mut transport).await.unwrap();

    sink_task.await.unwrap().unwrap();
    migration.cleanup().await;

    // The sink ends with exactly the user snapshots and the final bytes.
    assert_eq!(
        sink.zfs.snapshot_labels("poolmsnk/containers/ct"),
        vec!["snapshot-s1".to_string(), "snapshot-s2".to_string()]
    );
    assert_eq!(
        sink.zfs.read_file("poolmsnk/containers/ct", "root/data").unwrap(),
        "v4"
    );
    assert!(sink.zfs.is_mounted("poolmsnk/containers/ct"));
    assert_eq!(
        sink.hooks.snapshot_records.lock().unwrap()["ct"],
        vec!["s1".to_string(), "s2".to_string()]
    );

    // The source keeps only its user snapshots after cleanup.
    assert_eq!(
        source.zfs.snapshot_labels("poolmsrc/containers/ct"),
        vec!["snapshot-s1".to_string(), "snapshot-s2".to_string()]
    );
}

#[tokio::test]
async fn test_sink_with_no_expected_snapshots_purges_everything() {
    let source = harness("pm2-src", "poolm2src");
    let sink = harness("pm2-snk", "poolm2snk");

    source.driver.container_create("ct", false).await.unwrap();
    source
        .zfs
        .write_file("poolm2src/containers/ct", "root/data", "live");

    let mut migration = source.driver.migration_source("ct", true).await.unwrap();
    assert!(migration.snapshots().is_empty());

    let (near, far) = tokio::io::duplex(1 << 16);
    let sink_driver = sink.driver.clone();
    let sink_task = tokio::spawn(async move {
        let mut transport = FramedTransport::new(far);
        sink_driver
            .migration_sink(false, "ct", &[], &mut transport, None, true)
            .await
    });

    let mut transport = FramedTransport::new(near);
    migration
        .send_while_running(&mut transport, None, true)
        .await
        .unwrap();
    sink_task.await.unwrap().unwrap();
    migration.cleanup().await;

    assert_eq!(
        sink.zfs.read_file("poolm2snk/containers/ct", "root/data").unwrap(),
        "live"
    );
    // Zero real snapshots expected, so every received snapshot goes.
    assert!(sink.zfs.snapshot_labels("poolm2snk/containers/ct").is_empty());
    assert!(source.zfs.snapshot_labels("poolm2src/containers/ct").is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_concurrent_mounts_invoke_zfs_once() {
    let pool = PoolConfig::new("pc6").with("zfs.pool_name", "poolc6");
    let h = Harness::with_engine(
        pool,
        MockZfsEngine::new().with_mount_delay(Duration::from_millis(250)),
    );
    h.zfs
        .create(
            "poolc6/containers/ct",
            &[("mountpoint", "none"), ("canmount", "noauto")],
        )
        .await
        .unwrap();

    let mut tasks = Vec::new();
    for _ in 0..100 {
        let driver = h.driver.clone();
        tasks.push(tokio::spawn(
            async move { driver.container_mount("ct", false).await },
        ));
    }

    let mut ours = 0;
    for task in tasks {
        if task.await.unwrap().unwrap() {
            ours += 1;
        }
    }

    assert_eq!(ours, 1, "exactly one caller performs the mount");
    assert_eq!(h.zfs.mount_call_count("poolc6/containers/ct"), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_concurrent_image_creates_unpack_once() {
    let pool = PoolConfig::new("pc7").with("zfs.pool_name", "poolc7");
    let hooks = RecordingHooks::new("pc7").with_unpack_delay(Duration::from_millis(200));
    let h = Harness::with_hooks(pool, hooks);

    let mut tasks = Vec::new();
    for i in 0..5 {
        let driver = h.driver.clone();
        tasks.push(tokio::spawn(async move {
            driver
                .container_create_from_image(&format!("ct{}", i), true, "abc123")
                .await
        }));
    }
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    assert_eq!(
        h.hooks.unpack_calls.load(std::sync::atomic::Ordering::SeqCst),
        1
    );
    for i in 0..5 {
        assert_eq!(
            h.zfs
                .origin_of(&format!("poolc7/containers/ct{}", i))
                .unwrap(),
            "poolc7/images/abc123@readonly"
        );
    }
}
