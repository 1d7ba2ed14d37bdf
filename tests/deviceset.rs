// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

// Full device-set scenarios over the simulated kernel and filesystem
// backends.

use std::{
    fs,
    path::{Path, PathBuf},
};

use assert_matches::assert_matches;
use tempfile::TempDir;

use thinset::{
    engine::sim::{SimDm, SimFs},
    DeviceSet, DeviceSetConfig, ErrorEnum, ThinsetError, ThinsetResult,
};

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn config(options: &[&str]) -> DeviceSetConfig {
    let options = options.iter().map(|s| (*s).to_owned()).collect::<Vec<_>>();
    DeviceSetConfig::parse(&options).unwrap()
}

fn build(
    root: &Path,
    do_init: bool,
    dm: &SimDm,
    fs: &SimFs,
    config: DeviceSetConfig,
) -> ThinsetResult<DeviceSet> {
    DeviceSet::with_backends(root, do_init, config, Box::new(dm.clone()), Box::new(fs.clone()))
}

/// The name stem shared by every device of a set, recovered from the
/// reported pool name.
fn prefix_of(pool_name: &str) -> &str {
    pool_name
        .strip_suffix("-pool")
        .expect("pool names end in -pool")
}

fn dev_name(prefix: &str, hash: &str) -> String {
    let hash = if hash.is_empty() { "base" } else { hash };
    format!("{}-{}", prefix, hash)
}

fn dev_node(prefix: &str, hash: &str) -> PathBuf {
    PathBuf::from(format!("/dev/mapper/{}", dev_name(prefix, hash)))
}

fn kind(result: &ThinsetResult<()>) -> Option<ErrorEnum> {
    match result {
        Err(ThinsetError::Engine(kind, _)) => Some(*kind),
        _ => None,
    }
}

#[test]
fn test_cold_start_pool_creation() {
    init_logger();
    let dir = TempDir::new().unwrap();
    let root = dir.path().join("root");
    let dm = SimDm::new();
    let fs = SimFs::new();

    let set = build(&root, true, &dm, &fs, config(&[])).unwrap();

    let status = set.status();
    let pool = status.pool_name.clone();
    let prefix = prefix_of(&pool).to_owned();

    assert!(dm.is_active(&pool));
    assert_eq!(status.data_loopback, Some(root.join("devicemapper").join("data")));
    assert_eq!(
        status.metadata_loopback,
        Some(root.join("devicemapper").join("metadata"))
    );
    assert_eq!(
        fs::metadata(root.join("devicemapper").join("data")).unwrap().len(),
        100 * 1024 * 1024 * 1024
    );
    assert_eq!(
        fs::metadata(root.join("devicemapper").join("metadata")).unwrap().len(),
        2 * 1024 * 1024 * 1024
    );

    // The first allocation after the cursor starts at 0 is id 1, and it
    // was committed as pool transaction 1.
    assert_eq!(dm.pool_transaction_id(&pool), 1);
    assert_eq!(dm.thin_ids(&pool), vec![1]);
    let base = set.get_device_status("").unwrap();
    assert_eq!(base.device_id, 1);
    assert_eq!(base.transaction_id, 1);
    assert_eq!(base.size, 10 * 1024 * 1024 * 1024);

    // The base volume was formatted with the default filesystem and the
    // record persisted as initialized.
    assert_eq!(fs.formatted(&dev_node(&prefix, "")).as_deref(), Some("ext4"));
    let record = fs::read_to_string(root.join("metadata").join("base")).unwrap();
    assert!(record.contains("\"initialized\":true"));

    assert!(root.join("metadata").join("deviceset-metadata").exists());
}

#[test]
fn test_snapshot_chain() {
    init_logger();
    let dir = TempDir::new().unwrap();
    let root = dir.path().join("root");
    let dm = SimDm::new();
    let fs = SimFs::new();

    let set = build(&root, true, &dm, &fs, config(&[])).unwrap();
    let pool = set.status().pool_name;
    let prefix = prefix_of(&pool).to_owned();

    set.add_device("A", "").unwrap();
    // Snapshotting a snapshot does not require its origin to be active.
    assert!(!dm.is_active(&dev_name(&prefix, "A")));
    set.add_device("B", "A").unwrap();

    // AddDevice never activates the new snapshot.
    assert!(!dm.is_active(&dev_name(&prefix, "B")));

    assert_eq!(dm.thin_ids(&pool), vec![1, 2, 3]);
    assert_eq!(dm.pool_transaction_id(&pool), 3);
    assert_eq!(set.get_device_status("A").unwrap().device_id, 2);
    assert_eq!(set.get_device_status("B").unwrap().device_id, 3);
    assert!(set.has_device("A"));
    assert!(set.has_device("B"));

    let err = set.add_device("A", "").unwrap_err();
    assert_matches!(err, ThinsetError::Engine(ErrorEnum::DeviceExists, _));
}

#[test]
fn test_crash_during_create_rolls_back() {
    init_logger();
    let dir = TempDir::new().unwrap();
    let root = dir.path().join("root");
    let dm = SimDm::new();
    let fs = SimFs::new();

    let set = build(&root, true, &dm, &fs, config(&[])).unwrap();
    let pool = set.status().pool_name;
    set.add_device("A", "").unwrap();
    set.add_device("B", "A").unwrap();
    assert_eq!(dm.pool_transaction_id(&pool), 3);

    // Crash: the process dies after writing the pending-transaction
    // record for "C" (id 5), before the kernel create went through.
    drop(set);
    fs::write(
        root.join("metadata").join("transaction-metadata"),
        serde_json::json!({
            "open_transaction_id": 4,
            "device_hash": "C",
            "device_id": 5
        })
        .to_string(),
    )
    .unwrap();

    let set = build(&root, true, &dm, &fs, config(&[])).unwrap();

    // The transaction was rolled back: pool id unchanged, no "C" record,
    // pending record gone.
    assert_eq!(dm.pool_transaction_id(&pool), 3);
    assert_eq!(dm.thin_ids(&pool), vec![1, 2, 3]);
    assert!(!set.has_device("C"));
    assert!(!root.join("metadata").join("transaction-metadata").exists());

    let mut hashes = set.list();
    hashes.sort();
    assert_eq!(hashes, vec!["".to_owned(), "A".to_owned(), "B".to_owned()]);

    // Id 5 is free again; the cursor hands out 4 next.
    set.add_device("D", "").unwrap();
    assert_eq!(set.get_device_status("D").unwrap().device_id, 4);
    assert_eq!(dm.pool_transaction_id(&pool), 4);
}

#[test]
fn test_unparseable_pending_transaction_is_ignored() {
    init_logger();
    let dir = TempDir::new().unwrap();
    let root = dir.path().join("root");
    let dm = SimDm::new();
    let fs = SimFs::new();

    let set = build(&root, true, &dm, &fs, config(&[])).unwrap();
    let pool = set.status().pool_name;
    drop(set);

    fs::write(
        root.join("metadata").join("transaction-metadata"),
        "{ this is not json",
    )
    .unwrap();

    let set = build(&root, true, &dm, &fs, config(&[])).unwrap();
    assert_eq!(dm.pool_transaction_id(&pool), 1);
    assert!(set.has_device(""));
}

#[test]
fn test_mount_refcounting_same_path() {
    init_logger();
    let dir = TempDir::new().unwrap();
    let root = dir.path().join("root");
    let dm = SimDm::new();
    let fs = SimFs::new();

    let set = build(&root, true, &dm, &fs, config(&[])).unwrap();
    let prefix = prefix_of(&set.status().pool_name).to_owned();
    set.add_device("A", "").unwrap();

    let target = dir.path().join("mnt").join("a");
    set.mount_device("A", &target, "").unwrap();
    set.mount_device("A", &target, "").unwrap();

    // One kernel mount despite two references.
    assert_eq!(fs.mount_count(), 1);
    assert!(dm.is_active(&dev_name(&prefix, "A")));

    set.unmount_device("A").unwrap();
    assert!(fs.is_mounted(&target));
    assert!(dm.is_active(&dev_name(&prefix, "A")));

    set.unmount_device("A").unwrap();
    assert!(!fs.is_mounted(&target));
    assert!(!dm.is_active(&dev_name(&prefix, "A")));

    let result = set.unmount_device("A");
    assert_eq!(kind(&result), Some(ErrorEnum::NotMounted));
}

#[test]
fn test_mount_conflict_other_path() {
    init_logger();
    let dir = TempDir::new().unwrap();
    let root = dir.path().join("root");
    let dm = SimDm::new();
    let fs = SimFs::new();

    let set = build(&root, true, &dm, &fs, config(&[])).unwrap();
    set.add_device("A", "").unwrap();

    let first = dir.path().join("mnt").join("x");
    let second = dir.path().join("mnt").join("y");
    set.mount_device("A", &first, "").unwrap();

    let result = set.mount_device("A", &second, "");
    assert_eq!(kind(&result), Some(ErrorEnum::AlreadyMountedElsewhere));

    // The first mount is intact and still the only reference.
    assert!(fs.is_mounted(&first));
    assert!(!fs.is_mounted(&second));
    set.unmount_device("A").unwrap();
    assert!(!fs.is_mounted(&first));
}

#[test]
fn test_mount_retries_without_discard() {
    init_logger();
    let dir = TempDir::new().unwrap();
    let root = dir.path().join("root");
    let dm = SimDm::new();
    let fs = SimFs::new();

    let set = build(&root, true, &dm, &fs, config(&[])).unwrap();
    set.add_device("A", "").unwrap();

    fs.reject_discard();
    let target = dir.path().join("mnt").join("a");
    set.mount_device("A", &target, "").unwrap();

    assert_eq!(fs.discard_rejections(), 1);
    assert!(fs.is_mounted(&target));
}

#[test]
fn test_resize_refuses_shrink() {
    init_logger();
    let dir = TempDir::new().unwrap();
    let root = dir.path().join("root");
    let dm = SimDm::new();
    let fs = SimFs::new();

    let set = build(&root, true, &dm, &fs, config(&[])).unwrap();
    let data_file = root.join("devicemapper").join("data");
    let before = fs::metadata(&data_file).unwrap().len();

    let result = set.resize_pool(50 * 1024 * 1024 * 1024);
    assert_eq!(kind(&result), Some(ErrorEnum::ShrinkNotAllowed));
    assert_eq!(fs::metadata(&data_file).unwrap().len(), before);

    // Growing works and ripples into the pool's reported size.
    set.resize_pool(200 * 1024 * 1024 * 1024).unwrap();
    assert_eq!(
        fs::metadata(&data_file).unwrap().len(),
        200 * 1024 * 1024 * 1024
    );
}

#[test]
fn test_busy_deactivation_retries() {
    init_logger();
    let dir = TempDir::new().unwrap();
    let root = dir.path().join("root");
    let dm = SimDm::new();
    let fs = SimFs::new();

    let set = build(&root, true, &dm, &fs, config(&[])).unwrap();
    let prefix = prefix_of(&set.status().pool_name).to_owned();
    set.add_device("A", "").unwrap();

    let target = dir.path().join("mnt").join("a");
    set.mount_device("A", &target, "").unwrap();

    // The kernel reports EBUSY a few times before letting go.
    dm.inject_remove_busy(&dev_name(&prefix, "A"), 3);
    set.unmount_device("A").unwrap();
    assert!(!dm.is_active(&dev_name(&prefix, "A")));
}

#[test]
fn test_delete_device() {
    init_logger();
    let dir = TempDir::new().unwrap();
    let root = dir.path().join("root");
    let dm = SimDm::new();
    let fs = SimFs::new();

    let set = build(&root, true, &dm, &fs, config(&[])).unwrap();
    let pool = set.status().pool_name;
    set.add_device("A", "").unwrap();
    assert_eq!(dm.pool_transaction_id(&pool), 2);

    set.delete_device("A").unwrap();
    assert!(!set.has_device("A"));
    assert!(!root.join("metadata").join("A").exists());
    assert_eq!(dm.thin_ids(&pool), vec![1]);
    assert_eq!(dm.pool_transaction_id(&pool), 3);

    let result = set.delete_device("A");
    assert_eq!(kind(&result), Some(ErrorEnum::UnknownDevice));
}

#[test]
fn test_legacy_metadata_migration() {
    init_logger();
    let dir = TempDir::new().unwrap();
    let root = dir.path().join("root");
    let dm = SimDm::new();
    let fs = SimFs::new();

    // A root left behind by the old format: loopback files plus one
    // aggregate metadata file.
    let loopback_dir = root.join("devicemapper");
    fs::create_dir_all(&loopback_dir).unwrap();
    fs::write(loopback_dir.join("data"), vec![0u8; 1024 * 1024]).unwrap();
    fs::write(loopback_dir.join("metadata"), vec![0u8; 1024 * 1024]).unwrap();
    fs::write(
        loopback_dir.join("json"),
        serde_json::json!({
            "Devices": {
                "": {"device_id": 1, "size": 1024, "transaction_id": 0, "initialized": true},
                "abc": {"device_id": 2, "size": 1024, "transaction_id": 0, "initialized": false},
            }
        })
        .to_string(),
    )
    .unwrap();

    let set = build(&root, true, &dm, &fs, config(&[])).unwrap();

    assert!(!loopback_dir.join("json").exists());
    assert!(loopback_dir.join("json.migrated").exists());
    assert!(root.join("metadata").join("base").exists());
    assert!(root.join("metadata").join("abc").exists());
    assert!(set.has_device("abc"));
}

#[test]
fn test_external_pool_adoption() {
    init_logger();
    let dm = SimDm::new();
    let fs = SimFs::new();

    // A pool with used data blocks is refused.
    {
        let dir = TempDir::new().unwrap();
        dm.add_external_pool("extpool", 0, 10);
        let result = build(
            &dir.path().join("root"),
            true,
            &dm,
            &fs,
            config(&["thinpooldev=/dev/mapper/extpool"]),
        );
        assert!(result.is_err());
    }

    // So is one with transaction history.
    {
        let dir = TempDir::new().unwrap();
        let dm = SimDm::new();
        dm.add_external_pool("extpool", 7, 0);
        let result = build(
            &dir.path().join("root"),
            true,
            &dm,
            &fs,
            config(&["thinpooldev=/dev/mapper/extpool"]),
        );
        assert!(result.is_err());
    }

    // A pristine external pool is adopted and the base image built in it.
    {
        let dir = TempDir::new().unwrap();
        let dm = SimDm::new();
        dm.add_external_pool("extpool", 0, 0);
        let set = build(
            &dir.path().join("root"),
            true,
            &dm,
            &fs,
            config(&["thinpooldev=/dev/mapper/extpool"]),
        )
        .unwrap();
        assert_eq!(set.status().pool_name, "extpool");
        assert_eq!(dm.pool_transaction_id("extpool"), 1);
        assert_eq!(dm.thin_ids("extpool"), vec![1]);
    }
}

#[test]
fn test_restart_preserves_registry_and_bitmap() {
    init_logger();
    let dir = TempDir::new().unwrap();
    let root = dir.path().join("root");
    let dm = SimDm::new();
    let fs = SimFs::new();

    let set = build(&root, true, &dm, &fs, config(&[])).unwrap();
    let pool = set.status().pool_name;
    set.add_device("A", "").unwrap();
    set.add_device("B", "A").unwrap();
    set.shutdown().unwrap();
    assert!(!dm.is_active(&pool));
    drop(set);

    let set = build(&root, true, &dm, &fs, config(&[])).unwrap();
    assert!(set.has_device("A"));
    assert!(set.has_device("B"));
    assert_eq!(dm.pool_transaction_id(&pool), 3);

    // The restored bitmap and cursor skip the ids already in use.
    set.add_device("C", "B").unwrap();
    assert_eq!(set.get_device_status("C").unwrap().device_id, 4);
}

#[test]
fn test_shutdown_unmounts_everything() {
    init_logger();
    let dir = TempDir::new().unwrap();
    let root = dir.path().join("root");
    let dm = SimDm::new();
    let fs = SimFs::new();

    let set = build(&root, true, &dm, &fs, config(&[])).unwrap();
    let pool = set.status().pool_name;
    let prefix = prefix_of(&pool).to_owned();
    set.add_device("A", "").unwrap();
    set.mount_device("A", &dir.path().join("mnt").join("a"), "").unwrap();

    set.shutdown().unwrap();

    assert_eq!(fs.mount_count(), 0);
    assert!(!dm.is_active(&dev_name(&prefix, "A")));
    assert!(!dm.is_active(&dev_name(&prefix, "")));
    assert!(!dm.is_active(&pool));
    assert!(root.join("metadata").join("deviceset-metadata").exists());
}

#[test]
fn test_concurrent_mount_unmount() {
    init_logger();
    let dir = TempDir::new().unwrap();
    let root = dir.path().join("root");
    let dm = SimDm::new();
    let fs = SimFs::new();

    let set = std::sync::Arc::new(build(&root, true, &dm, &fs, config(&[])).unwrap());
    set.add_device("A", "").unwrap();
    set.add_device("B", "").unwrap();

    let mut handles = Vec::new();
    for &hash in &["A", "B"] {
        let set = std::sync::Arc::clone(&set);
        let target = dir.path().join("mnt").join(hash);
        handles.push(std::thread::spawn(move || {
            for _ in 0..20 {
                set.mount_device(hash, &target, "").unwrap();
                set.unmount_device(hash).unwrap();
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    // Matched mount/unmount pairs leave nothing mounted and every device
    // deactivated.
    assert_eq!(fs.mount_count(), 0);
}

#[test]
fn test_unknown_options_fail() {
    let result = DeviceSetConfig::parse(&["frobnicate=1".to_owned()]);
    assert!(result.is_err());
}

#[test]
fn test_status_reports_usage() {
    init_logger();
    let dir = TempDir::new().unwrap();
    let root = dir.path().join("root");
    let dm = SimDm::new();
    let fs = SimFs::new();

    let set = build(&root, true, &dm, &fs, config(&[])).unwrap();
    let status = set.status();

    assert!(status.udev_sync_supported);
    assert!(status.data.total > 0);
    assert_eq!(status.data.used, 0);
    assert!(status.metadata.total > 0);
    // The sim pool uses the default 64 KiB block size.
    assert_eq!(status.sector_size, 128 * 512);
}
