//! Lifecycle behaviour of container, snapshot, image, and custom volumes
//! over the in-memory engine.

mod common;

use burrow_storage::{PoolConfig, StorageError, VolumeConfig};
use common::{harness, Harness};
use std::fs;

#[tokio::test]
async fn test_create_then_delete_returns_to_clean_state() {
    let h = harness("p1", "pool1");

    h.driver.container_create("ct1", false).await.unwrap();

    let mount_point = h.driver.layout().container_mount_point("ct1");
    assert!(h.zfs.has_dataset("pool1/containers/ct1"));
    assert_eq!(
        h.zfs.property("pool1/containers/ct1", "mountpoint").unwrap(),
        mount_point.display().to_string()
    );
    assert_eq!(
        h.zfs.property("pool1/containers/ct1", "canmount").unwrap(),
        "noauto"
    );
    assert_eq!(
        fs::read_link(h.driver.layout().container_symlink("ct1")).unwrap(),
        mount_point
    );
    assert_eq!(h.hooks.template_count("ct1", "create"), 1);

    h.driver.container_delete("ct1").await.unwrap();

    assert!(!h.zfs.has_dataset("pool1/containers/ct1"));
    assert!(!mount_point.exists());
    assert!(fs::read_link(h.driver.layout().container_symlink("ct1")).is_err());
    assert!(h
        .zfs
        .datasets_with_prefix("pool1/deleted/containers/")
        .is_empty());
}

#[tokio::test]
async fn test_storage_ready_tracks_dataset() {
    let h = harness("p2", "pool2");

    assert!(!h.driver.container_storage_ready("ct1").await);
    h.driver.container_create("ct1", false).await.unwrap();
    assert!(h.driver.container_storage_ready("ct1").await);
}

#[tokio::test]
async fn test_create_from_image_clones_readonly_snapshot() {
    let h = harness("p3", "pool3");

    h.driver.image_create("abc123").await.unwrap();
    assert_eq!(
        h.zfs.snapshot_labels("pool3/images/abc123"),
        vec!["readonly".to_string()]
    );
    assert_eq!(h.zfs.property("pool3/images/abc123", "readonly").unwrap(), "on");
    assert_eq!(
        h.zfs.property("pool3/images/abc123", "mountpoint").unwrap(),
        "none"
    );
    assert_eq!(
        h.hooks.unpack_calls.load(std::sync::atomic::Ordering::SeqCst),
        1
    );

    h.driver
        .container_create_from_image("ct2", true, "abc123")
        .await
        .unwrap();
    assert_eq!(
        h.zfs.origin_of("pool3/containers/ct2").unwrap(),
        "pool3/images/abc123@readonly"
    );
    // Privileged containers skip the id shift.
    assert!(h.hooks.shift_calls.lock().unwrap().is_empty());

    h.driver.container_delete("ct2").await.unwrap();
    h.driver.image_delete("abc123").await.unwrap();

    assert!(!h.zfs.has_dataset("pool3/images/abc123"));
    assert!(h.zfs.datasets_with_prefix("pool3/deleted/images/").is_empty());
}

#[tokio::test]
async fn test_unprivileged_clone_shifts_rootfs() {
    let h = harness("p4", "pool4");

    h.driver.image_create("abc123").await.unwrap();
    h.driver
        .container_create_from_image("ct1", false, "abc123")
        .await
        .unwrap();
    assert_eq!(*h.hooks.shift_calls.lock().unwrap(), vec!["ct1".to_string()]);
}

#[tokio::test]
async fn test_pinned_image_is_tombstoned_then_adopted_back() {
    let h = harness("p5", "pool5");

    h.driver.image_create("abc123").await.unwrap();
    h.driver
        .container_create_from_image("ct1", true, "abc123")
        .await
        .unwrap();

    // The clone pins the readonly snapshot, so delete tombstones.
    h.driver.image_delete("abc123").await.unwrap();
    assert!(!h.zfs.has_dataset("pool5/images/abc123"));
    assert!(h.zfs.has_dataset("pool5/deleted/images/abc123"));

    // Re-creating the image adopts the tombstone without re-unpacking.
    h.driver.image_create("abc123").await.unwrap();
    assert!(h.zfs.has_dataset("pool5/images/abc123"));
    assert!(!h.zfs.has_dataset("pool5/deleted/images/abc123"));
    assert_eq!(
        h.hooks.unpack_calls.load(std::sync::atomic::Ordering::SeqCst),
        1
    );
}

#[tokio::test]
async fn test_snapshot_pinned_delete_drains_tombstones() {
    let h = harness("p6", "pool6");

    h.driver.container_create("ct3", false).await.unwrap();
    h.driver.snapshot_create("ct3", "s1").await.unwrap();

    // Sparse copy from the snapshot pins it.
    h.driver
        .container_copy("ct4", "ct3/s1", "p6", false, false)
        .await
        .unwrap();
    assert_eq!(
        h.zfs.origin_of("pool6/containers/ct4").unwrap(),
        "pool6/containers/ct3@snapshot-s1"
    );

    // ct3 cannot be destroyed while the clone exists: it tombstones.
    h.driver.container_delete("ct3").await.unwrap();
    assert!(!h.zfs.has_dataset("pool6/containers/ct3"));
    assert_eq!(
        h.zfs.datasets_with_prefix("pool6/deleted/containers/").len(),
        1
    );

    // Destroying the clone unpins the tombstone and drains deleted/.
    h.driver.container_delete("ct4").await.unwrap();
    assert!(h
        .zfs
        .datasets_with_prefix("pool6/deleted/containers/")
        .is_empty());
}

#[tokio::test]
async fn test_restore_refuses_unless_remove_snapshots() {
    let h = harness("p7", "pool7");

    h.driver.container_create("ct5", false).await.unwrap();
    h.zfs.write_file("pool7/containers/ct5", "etc/hostname", "one");
    h.driver.snapshot_create("ct5", "s1").await.unwrap();
    h.zfs.write_file("pool7/containers/ct5", "etc/hostname", "two");
    h.driver.snapshot_create("ct5", "s2").await.unwrap();

    let plain = VolumeConfig::new("ct5");
    let err = h
        .driver
        .container_restore("ct5", "s1", &plain)
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::SnapshotNotLatest { .. }));
    assert!(h
        .driver
        .container_can_restore("ct5", "s1", &plain)
        .await
        .is_err());
    assert!(h
        .driver
        .container_can_restore("ct5", "s2", &plain)
        .await
        .is_ok());

    let permissive = VolumeConfig::new("ct5").with("zfs.remove_snapshots", "true");
    h.driver
        .container_restore("ct5", "s1", &permissive)
        .await
        .unwrap();

    assert_eq!(
        h.zfs.snapshot_labels("pool7/containers/ct5"),
        vec!["snapshot-s1".to_string()]
    );
    assert_eq!(
        h.zfs.read_file("pool7/containers/ct5", "etc/hostname").unwrap(),
        "one"
    );
}

#[tokio::test]
async fn test_rename_round_trip_restores_state() {
    let h = harness("p8", "pool8");

    h.driver.container_create("ct6", false).await.unwrap();
    let original_mount = h.driver.layout().container_mount_point("ct6");

    h.driver.container_rename("ct6", "ct7").await.unwrap();
    assert!(!h.zfs.has_dataset("pool8/containers/ct6"));
    assert!(h.zfs.has_dataset("pool8/containers/ct7"));
    assert_eq!(
        h.zfs.property("pool8/containers/ct7", "mountpoint").unwrap(),
        h.driver
            .layout()
            .container_mount_point("ct7")
            .display()
            .to_string()
    );
    assert!(fs::read_link(h.driver.layout().container_symlink("ct6")).is_err());
    assert_eq!(
        fs::read_link(h.driver.layout().container_symlink("ct7")).unwrap(),
        h.driver.layout().container_mount_point("ct7")
    );

    h.driver.container_rename("ct7", "ct6").await.unwrap();
    assert!(h.zfs.has_dataset("pool8/containers/ct6"));
    assert!(!h.zfs.has_dataset("pool8/containers/ct7"));
    assert_eq!(
        h.zfs.property("pool8/containers/ct6", "mountpoint").unwrap(),
        original_mount.display().to_string()
    );
    assert_eq!(
        fs::read_link(h.driver.layout().container_symlink("ct6")).unwrap(),
        original_mount
    );
    assert!(original_mount.is_dir());
}

#[tokio::test]
async fn test_quota_property_selection() {
    let h = harness("p9", "pool9");
    h.driver.container_create("ct1", false).await.unwrap();

    let plain = VolumeConfig::new("ct1");
    h.driver
        .container_set_quota("ct1", 1_000_000, &plain)
        .await
        .unwrap();
    assert_eq!(
        h.zfs.property("pool9/containers/ct1", "quota").unwrap(),
        "1000000"
    );

    let refquota = VolumeConfig::new("ct1").with("zfs.use_refquota", "true");
    h.driver
        .container_set_quota("ct1", 2_000_000, &refquota)
        .await
        .unwrap();
    assert_eq!(
        h.zfs.property("pool9/containers/ct1", "refquota").unwrap(),
        "2000000"
    );

    // Zero clears the quota.
    h.driver.container_set_quota("ct1", 0, &plain).await.unwrap();
    assert_eq!(h.zfs.property("pool9/containers/ct1", "quota").unwrap(), "none");

    h.zfs.write_file("pool9/containers/ct1", "root/blob", "12345");
    assert_eq!(h.driver.container_get_usage("ct1", &plain).await.unwrap(), 5);
    assert_eq!(
        h.driver.container_get_usage("ct1", &refquota).await.unwrap(),
        5
    );
}

#[tokio::test]
async fn test_snapshot_lifecycle_and_aggregate_symlink() {
    let h = harness("p10", "pool10");
    h.driver.container_create("ct1", false).await.unwrap();

    h.driver.snapshot_create("ct1", "s1").await.unwrap();
    assert_eq!(
        h.zfs.snapshot_labels("pool10/containers/ct1"),
        vec!["snapshot-s1".to_string()]
    );
    assert!(h.driver.layout().snapshot_mount_point("ct1", "s1").is_dir());
    assert_eq!(
        fs::read_link(h.driver.layout().snapshot_symlink("ct1")).unwrap(),
        h.driver.layout().snapshots_dir("ct1")
    );

    h.driver.snapshot_rename("ct1", "s1", "s2").await.unwrap();
    assert_eq!(
        h.zfs.snapshot_labels("pool10/containers/ct1"),
        vec!["snapshot-s2".to_string()]
    );
    assert!(!h.driver.layout().snapshot_mount_point("ct1", "s1").exists());
    assert!(h.driver.layout().snapshot_mount_point("ct1", "s2").is_dir());

    // Deleting the last snapshot removes the aggregate dir and symlink.
    h.driver.snapshot_delete("ct1", "s2").await.unwrap();
    assert!(h.zfs.snapshot_labels("pool10/containers/ct1").is_empty());
    assert!(!h.driver.layout().snapshots_dir("ct1").exists());
    assert!(fs::read_link(h.driver.layout().snapshot_symlink("ct1")).is_err());
}

#[tokio::test]
async fn test_snapshot_start_stop() {
    let h = harness("p11", "pool11");
    h.driver.container_create("ct1", false).await.unwrap();
    h.zfs.write_file("pool11/containers/ct1", "root/data", "v1");
    h.driver.snapshot_create("ct1", "s1").await.unwrap();

    assert!(h.driver.snapshot_start("ct1", "s1").await.unwrap());
    assert!(h.zfs.has_dataset("pool11/snapshots/ct1/s1"));
    assert_eq!(
        h.zfs.origin_of("pool11/snapshots/ct1/s1").unwrap(),
        "pool11/containers/ct1@snapshot-s1"
    );
    assert!(h.zfs.is_mounted("pool11/snapshots/ct1/s1"));
    assert_eq!(
        h.zfs.read_file("pool11/snapshots/ct1/s1", "root/data").unwrap(),
        "v1"
    );

    assert!(h.driver.snapshot_stop("ct1", "s1").await.unwrap());
    assert!(!h.zfs.has_dataset("pool11/snapshots/ct1/s1"));
}

#[tokio::test]
async fn test_pinned_snapshot_delete_parks_it() {
    let h = harness("p12", "pool12");
    h.driver.container_create("ct1", false).await.unwrap();
    h.driver.snapshot_create("ct1", "s1").await.unwrap();
    h.driver
        .container_copy("ct2", "ct1/s1", "p12", false, false)
        .await
        .unwrap();

    // The clone pins snapshot-s1; delete renames it out of the way so
    // the container itself stays deletable.
    h.driver.snapshot_delete("ct1", "s1").await.unwrap();
    let labels = h.zfs.snapshot_labels("pool12/containers/ct1");
    assert_eq!(labels.len(), 1);
    assert!(labels[0].starts_with("copy-"));
}

#[tokio::test]
async fn test_custom_volume_lifecycle() {
    let h = harness("p13", "pool13");

    h.driver.custom_create("vol1").await.unwrap();
    assert!(h.zfs.has_dataset("pool13/custom/vol1"));
    assert_eq!(
        h.zfs.property("pool13/custom/vol1", "mountpoint").unwrap(),
        h.driver
            .layout()
            .custom_mount_point("vol1")
            .display()
            .to_string()
    );
    assert!(h.driver.layout().custom_mount_point("vol1").is_dir());

    h.driver.custom_delete("vol1").await.unwrap();
    assert!(!h.zfs.has_dataset("pool13/custom/vol1"));
    assert!(!h.driver.layout().custom_mount_point("vol1").exists());
}

#[tokio::test]
async fn test_pool_bootstrap() {
    let pool = PoolConfig::new("p14")
        .with("zfs.pool_name", "pool14")
        .with("source", "/var/lib/burrow/disks/p14.img");
    let h = Harness::new(pool);

    assert_eq!(h.driver.init().await.unwrap(), "2.1.99-mock");

    h.driver.pool_create().await.unwrap();
    assert_eq!(*h.hooks.provisioned_pools.lock().unwrap(), vec!["p14".to_string()]);
    assert!(h.driver.layout().pool_mount_point().is_dir());
    // The dataset was absent and the source is a path, so check imported.
    assert_eq!(h.zfs.imported_pools(), vec!["pool14".to_string()]);

    assert!(h.driver.pool_mount().await.unwrap());
    assert!(h.driver.pool_umount().await.unwrap());

    h.driver.pool_delete().await.unwrap();
    assert!(!h.zfs.has_dataset("pool14"));
    assert!(!h.driver.layout().pool_mount_point().exists());
}

#[tokio::test]
async fn test_pool_and_volume_update_validation() {
    let h = harness("p15", "pool15");

    assert!(h.driver.pool_update(&["rsync.bwlimit".to_string()]).is_ok());
    assert!(h.driver.pool_update(&["size".to_string()]).is_err());
    assert!(h.driver.pool_update(&["zfs.pool_name".to_string()]).is_err());
    assert!(h
        .driver
        .volume_update("vol1", &["block.filesystem".to_string()])
        .is_err());
    assert!(h
        .driver
        .volume_update("vol1", &["zfs.use_refquota".to_string()])
        .is_ok());
}
