#![cfg(unix)]

mod common;

use common::Harness;
use vmhub::utils::VmMetadata;
use vmhub::vm::{BackendKind, ErrorKind, Owner, VmConfig, VmState};

#[tokio::test]
async fn create_start_stop_round() {
    let h = Harness::new();

    // No ISO on disk for the ubuntu template: the VM boots from its disk.
    let mut config = VmConfig::new("test1");
    config.os_type = "ubuntu".to_string();
    config.ram = "2G".to_string();
    config.cpus = 2;
    config.disk_size = "20G".to_string();
    assert_eq!(h.manager.create(config).await.unwrap(), BackendKind::Qemu);
    assert_eq!(h.manager.state("test1").await.unwrap(), VmState::Stopped);

    assert_eq!(h.manager.start("test1", false).await.unwrap(), BackendKind::Qemu);
    assert_eq!(h.manager.state("test1").await.unwrap(), VmState::Running);

    let info = h.manager.info("test1").await.unwrap();
    assert_eq!(info.backend, "qemu");
    assert_eq!(info.ram.as_deref(), Some("2G"));
    assert!(info.last_started.is_some());

    h.manager.stop("test1", false).await.unwrap();
    assert_eq!(h.manager.state("test1").await.unwrap(), VmState::Stopped);

    let listed = h.manager.list().await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].name, "test1");
    assert_eq!(listed[0].state, VmState::Stopped);
}

#[tokio::test]
async fn start_and_stop_are_idempotent() {
    let h = Harness::new();
    h.create("idem").await;

    h.manager.stop("idem", false).await.unwrap();
    h.manager.start("idem", false).await.unwrap();
    h.manager.start("idem", false).await.unwrap();
    assert_eq!(h.tools.launches(), 1);

    h.manager.stop("idem", false).await.unwrap();
    h.manager.stop("idem", true).await.unwrap();
    assert_eq!(h.manager.state("idem").await.unwrap(), VmState::Stopped);
}

#[tokio::test]
async fn duplicate_create_is_a_conflict() {
    let h = Harness::new();
    h.create("dup").await;

    let err = h.manager.create(h.config("dup")).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);
}

#[tokio::test]
async fn second_delete_reports_not_found() {
    let h = Harness::new();
    h.create("gone").await;

    assert_eq!(
        h.manager.delete("gone", false).await.unwrap(),
        Owner::Backend(BackendKind::Qemu)
    );
    assert!(!h.vm_dir("gone").exists());

    let err = h.manager.delete("gone", false).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
    assert_eq!(h.manager.state("gone").await.unwrap_err().kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn kept_disk_is_readopted_by_create() {
    let h = Harness::new();
    h.create("keep").await;
    let disk = h.vm_dir("keep").join("keep.qcow2");
    assert!(disk.is_file());

    h.manager.delete("keep", true).await.unwrap();
    assert!(disk.is_file());
    assert!(h.manager.list().await.unwrap().is_empty());
    assert_eq!(h.manager.state("keep").await.unwrap_err().kind(), ErrorKind::NotFound);

    let creates_before = h.tools.calls().iter().filter(|c| c.starts_with("qemu-img create")).count();
    let mut config = h.config("keep");
    config.iso = None;
    h.manager.create(config).await.unwrap();
    let creates_after = h.tools.calls().iter().filter(|c| c.starts_with("qemu-img create")).count();
    assert_eq!(creates_before, creates_after);
    assert_eq!(h.manager.state("keep").await.unwrap(), VmState::Stopped);
}

#[tokio::test]
async fn orphan_disk_is_removed_by_full_delete() {
    let h = Harness::new();
    h.create("orphan").await;
    h.manager.delete("orphan", true).await.unwrap();

    assert_eq!(h.manager.delete("orphan", false).await.unwrap(), Owner::Filesystem);
    assert!(!h.vm_dir("orphan").exists());
}

#[tokio::test]
async fn snapshot_lifecycle_on_a_stopped_vm() {
    let h = Harness::new();
    h.create("snap").await;

    h.manager
        .create_snapshot("snap", "base", Some("clean install".to_string()))
        .await
        .unwrap();
    let err = h.manager.create_snapshot("snap", "base", None).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);

    let snaps = h.manager.list_snapshots("snap").await.unwrap();
    assert_eq!(snaps.len(), 1);
    assert_eq!(snaps[0].name, "base");
    assert_eq!(snaps[0].description.as_deref(), Some("clean install"));

    h.manager.revert_snapshot("snap", "base").await.unwrap();
    let err = h.manager.revert_snapshot("snap", "missing").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);

    h.manager.delete_snapshot("snap", "base").await.unwrap();
    assert!(h.manager.list_snapshots("snap").await.unwrap().is_empty());
}

#[tokio::test]
async fn revert_refuses_a_running_vm() {
    let h = Harness::new();
    h.create("live").await;
    h.manager.create_snapshot("live", "s1", None).await.unwrap();
    h.manager.start("live", false).await.unwrap();

    let err = h.manager.revert_snapshot("live", "s1").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PreconditionFailed);
    assert!(!h.tools.calls().iter().any(|c| c.starts_with("qemu-img snapshot -a")));

    h.manager.stop("live", true).await.unwrap();
}

#[tokio::test]
async fn concurrent_start_and_delete_leave_a_consistent_result() {
    let h = Harness::new();
    h.create("race").await;

    let (started, deleted) = tokio::join!(h.manager.start("race", false), h.manager.delete("race", false));
    deleted.unwrap();
    if let Err(e) = started {
        assert_eq!(e.kind(), ErrorKind::NotFound);
    }

    assert_eq!(h.manager.state("race").await.unwrap_err().kind(), ErrorKind::NotFound);
    assert!(!h.vm_dir("race").exists());
}

#[tokio::test]
async fn vm_of_an_uninstalled_backend_reports_unknown() {
    let h = Harness::new();
    let dir = h.vm_dir("stray");
    std::fs::create_dir_all(&dir).unwrap();
    VmMetadata::new(BackendKind::Libvirt, VmConfig::new("stray"))
        .save(&dir)
        .unwrap();

    assert_eq!(h.manager.state("stray").await.unwrap(), VmState::Unknown);
    let listed = h.manager.list().await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].state, VmState::Unknown);

    let err = h.manager.create(h.config("stray")).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);
}

#[tokio::test]
async fn invalid_names_never_reach_a_driver() {
    let h = Harness::new();
    let err = h.manager.start("../etc", false).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidInput);
    assert!(h.tools.calls().is_empty());
}

#[tokio::test]
async fn backend_report_marks_qemu_preferred() {
    let h = Harness::new();
    let report = h.manager.backends(true).await;
    let names: Vec<_> = report.iter().map(|b| b.name).collect();
    assert_eq!(names, ["libvirt", "qemu", "virtualbox"]);

    let qemu = report.iter().find(|b| b.name == "qemu").unwrap();
    assert!(qemu.available && qemu.preferred);
    assert_eq!(qemu.version.as_deref(), Some("QEMU emulator version 8.2.0"));
    assert!(!report.iter().find(|b| b.name == "libvirt").unwrap().available);
}
