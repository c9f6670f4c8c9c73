// Storage integration tests
//
// Exercises the artifact store invariants: durability, atomicity, garbage
// collection retention, deletion and self-healing after external damage.

mod common;

use std::fs;
use std::time::Duration;

use charthouse::storage::{file_checksum, Storage};
use common::{create_test_storage, package_test_chart};
use tempfile::tempdir;

#[test]
fn stored_artifact_is_durable_and_checksummed() {
    let tmp = tempdir().unwrap();
    let storage = create_test_storage(tmp.path());
    let chart = package_test_chart(tmp.path(), "podinfo", "6.2.0");

    let mut artifact =
        storage.artifact_for("HelmChart", "default", "app", "6.2.0", "podinfo-6.2.0.tgz");
    storage.copy_from_path(&mut artifact, &chart).unwrap();

    // Invariant: the file exists and its checksum matches the status.
    assert!(storage.artifact_exists(&artifact));
    let on_disk = file_checksum(&storage.local_path(&artifact)).unwrap();
    assert_eq!(artifact.checksum.as_deref(), Some(on_disk.as_str()));
    assert!(artifact.url.ends_with("/helmchart/default/app/podinfo-6.2.0.tgz"));
}

#[test]
fn identical_rewrite_produces_identical_checksum() {
    let tmp = tempdir().unwrap();
    let storage = create_test_storage(tmp.path());
    let chart = package_test_chart(tmp.path(), "podinfo", "6.2.0");

    let mut first =
        storage.artifact_for("HelmChart", "default", "app", "6.2.0", "podinfo-6.2.0.tgz");
    storage.copy_from_path(&mut first, &chart).unwrap();

    let mut second =
        storage.artifact_for("HelmChart", "default", "app", "6.2.0", "podinfo-6.2.0.tgz");
    storage.copy_from_path(&mut second, &chart).unwrap();

    assert_eq!(first.checksum, second.checksum);
    assert_eq!(first.path, second.path);
}

#[test]
fn new_revision_keeps_previous_file_within_retention() {
    let tmp = tempdir().unwrap();
    let storage = create_test_storage(tmp.path());

    let old_chart = package_test_chart(tmp.path(), "podinfo", "6.1.3");
    let mut old =
        storage.artifact_for("HelmChart", "default", "app", "6.1.3", "podinfo-6.1.3.tgz");
    storage.copy_from_path(&mut old, &old_chart).unwrap();

    let new_chart = package_test_chart(tmp.path(), "podinfo", "6.2.0");
    let mut new =
        storage.artifact_for("HelmChart", "default", "app", "6.2.0", "podinfo-6.2.0.tgz");
    storage.copy_from_path(&mut new, &new_chart).unwrap();

    // Within TTL and record count: the previous revision survives GC.
    let deleted = storage.garbage_collect(&new, Duration::from_secs(5)).unwrap();
    assert!(deleted.is_empty());
    assert!(storage.artifact_exists(&old));
    assert!(storage.artifact_exists(&new));
}

#[test]
fn gc_past_thresholds_removes_old_revisions() {
    let tmp = tempdir().unwrap();
    // Zero TTL and zero retained records: everything but current goes.
    let storage = Storage::new(tmp.path(), "storage.test.local", Duration::ZERO, 0).unwrap();

    let old_chart = package_test_chart(tmp.path(), "podinfo", "6.1.3");
    let mut old =
        storage.artifact_for("HelmChart", "default", "app", "6.1.3", "podinfo-6.1.3.tgz");
    storage.copy_from_path(&mut old, &old_chart).unwrap();

    let new_chart = package_test_chart(tmp.path(), "podinfo", "6.2.0");
    let mut new =
        storage.artifact_for("HelmChart", "default", "app", "6.2.0", "podinfo-6.2.0.tgz");
    storage.copy_from_path(&mut new, &new_chart).unwrap();

    let deleted = storage.garbage_collect(&new, Duration::from_secs(5)).unwrap();
    assert_eq!(deleted.len(), 1);
    assert!(!storage.artifact_exists(&old));
    assert!(storage.artifact_exists(&new));
}

#[test]
fn deletion_empties_the_whole_subtree() {
    let tmp = tempdir().unwrap();
    let storage = create_test_storage(tmp.path());
    let chart = package_test_chart(tmp.path(), "podinfo", "6.2.0");

    let mut artifact =
        storage.artifact_for("HelmChart", "default", "app", "6.2.0", "podinfo-6.2.0.tgz");
    storage.copy_from_path(&mut artifact, &chart).unwrap();
    storage.symlink(&artifact, "latest.tar.gz").unwrap();

    let probe = storage.artifact_for("HelmChart", "default", "app", "", "*");
    let deleted = storage.remove_all(&probe).unwrap();
    assert!(deleted.is_some());

    // The object's directory is gone entirely, symlink included.
    assert!(!tmp.path().join("helmchart/default/app").exists());
}

#[test]
fn externally_deleted_artifact_is_detected() {
    let tmp = tempdir().unwrap();
    let storage = create_test_storage(tmp.path());
    let chart = package_test_chart(tmp.path(), "podinfo", "6.2.0");

    let mut artifact =
        storage.artifact_for("HelmChart", "default", "app", "6.2.0", "podinfo-6.2.0.tgz");
    storage.copy_from_path(&mut artifact, &chart).unwrap();

    // Wipe the file behind the controller's back.
    fs::remove_file(storage.local_path(&artifact)).unwrap();
    assert!(!storage.artifact_exists(&artifact));

    // A rebuild lands on the same path and heals the store.
    storage.copy_from_path(&mut artifact, &chart).unwrap();
    assert!(storage.artifact_exists(&artifact));
    assert!(storage.verify_artifact(&artifact).unwrap());
}

#[test]
fn disk_wipe_of_object_directory_is_recoverable() {
    let tmp = tempdir().unwrap();
    let storage = create_test_storage(tmp.path());
    let chart = package_test_chart(tmp.path(), "podinfo", "6.2.0");

    let mut artifact =
        storage.artifact_for("HelmChart", "default", "app", "6.2.0", "podinfo-6.2.0.tgz");
    storage.copy_from_path(&mut artifact, &chart).unwrap();

    fs::remove_dir_all(tmp.path().join("helmchart/default/app")).unwrap();
    assert!(!storage.artifact_exists(&artifact));

    let mut rebuilt =
        storage.artifact_for("HelmChart", "default", "app", "6.2.0", "podinfo-6.2.0.tgz");
    storage.copy_from_path(&mut rebuilt, &chart).unwrap();
    let url = storage.symlink(&rebuilt, "latest.tar.gz").unwrap();

    assert!(storage.artifact_exists(&rebuilt));
    assert_eq!(url, "http://storage.test.local/helmchart/default/app/latest.tar.gz");
}

#[test]
fn concurrent_writers_serialize_on_the_object_lock() {
    let tmp = tempdir().unwrap();
    let storage = std::sync::Arc::new(create_test_storage(tmp.path()));
    let chart = package_test_chart(tmp.path(), "podinfo", "6.2.0");

    let artifact =
        storage.artifact_for("HelmChart", "default", "app", "6.2.0", "podinfo-6.2.0.tgz");

    let in_critical = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
    let max_seen = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));

    let mut handles = Vec::new();
    for _ in 0..4 {
        let storage = std::sync::Arc::clone(&storage);
        let artifact = artifact.clone();
        let chart = chart.clone();
        let in_critical = std::sync::Arc::clone(&in_critical);
        let max_seen = std::sync::Arc::clone(&max_seen);
        handles.push(std::thread::spawn(move || {
            let _lock = storage.lock(&artifact, Duration::from_secs(10)).unwrap();
            let current = in_critical.fetch_add(1, std::sync::atomic::Ordering::SeqCst) + 1;
            max_seen.fetch_max(current, std::sync::atomic::Ordering::SeqCst);

            let mut artifact = artifact.clone();
            storage.copy_from_path(&mut artifact, &chart).unwrap();
            std::thread::sleep(Duration::from_millis(10));

            in_critical.fetch_sub(1, std::sync::atomic::Ordering::SeqCst);
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    // At most one writer held the lock at any instant.
    assert_eq!(max_seen.load(std::sync::atomic::Ordering::SeqCst), 1);
}
