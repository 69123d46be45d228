//! Integration-style tests for VMM Core against an in-memory
//! `ContainerRuntime` double, keeping unit tests colocated with modules and
//! broader scenarios in a top-level `tests/` directory (spec §4.6 "Test
//! tooling").

mod common;

use common::test_vmm;
use cvd_fleet::domain::{CreateVmRequest, DeviceStatus};
use cvd_fleet::error::CoreError;

fn create_request(name: &str) -> CreateVmRequest {
    CreateVmRequest {
        name: name.to_string(),
        device_type: "phone".to_string(),
        cpu: 4,
        ram: 4096,
        system_image: "aosp.zip".to_string(),
        cvd_image: "cvd.tar.gz".to_string(),
        kernel_image: None,
        cmdline: None,
    }
}

#[tokio::test]
async fn create_then_list_reports_the_new_device() {
    let dir = tempfile::tempdir().unwrap();
    let vmm = test_vmm(dir.path()).await;

    let created = vmm.create(create_request("pixel6")).await.unwrap();
    assert_eq!(created.cf_instance, 1);
    assert_eq!(created.status, DeviceStatus::Running);

    let items = vmm.list().await.unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].name, "pixel6");
}

#[tokio::test]
async fn duplicate_create_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let vmm = test_vmm(dir.path()).await;

    vmm.create(create_request("pixel6")).await.unwrap();
    let err = vmm.create(create_request("pixel6")).await.unwrap_err();
    assert!(matches!(err, CoreError::Duplicate(_)));
}

#[tokio::test]
async fn create_rejects_invalid_device_name() {
    let dir = tempfile::tempdir().unwrap();
    let vmm = test_vmm(dir.path()).await;

    let err = vmm
        .create(create_request("not a valid name!"))
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::InvalidInput(_)));
}

#[tokio::test]
async fn create_reports_progress_steps_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let vmm = test_vmm(dir.path()).await;

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let created = vmm
        .create_with_progress(create_request("pixel6"), Some(tx))
        .await
        .unwrap();
    assert_eq!(created.status, DeviceStatus::Running);

    let mut steps = Vec::new();
    while let Ok(step) = rx.try_recv() {
        steps.push(step);
    }
    assert_eq!(
        steps,
        vec![
            cvd_fleet::domain::ProvisionStep::AllocatingIndex,
            cvd_fleet::domain::ProvisionStep::CreatingContainer,
            cvd_fleet::domain::ProvisionStep::StartingContainer,
            cvd_fleet::domain::ProvisionStep::InstallingBridge,
            cvd_fleet::domain::ProvisionStep::LoadingSystemImage,
            cvd_fleet::domain::ProvisionStep::UnzippingSystemImage,
            cvd_fleet::domain::ProvisionStep::LoadingCvdImage,
            cvd_fleet::domain::ProvisionStep::UnzippingCvdImage,
            cvd_fleet::domain::ProvisionStep::Booting,
            cvd_fleet::domain::ProvisionStep::Done,
        ]
    );
}

#[tokio::test]
async fn create_with_kernel_image_reports_loading_kernel() {
    let dir = tempfile::tempdir().unwrap();
    let vmm = test_vmm(dir.path()).await;

    tokio::fs::write(dir.path().join("kernel-seed"), b"k").await.unwrap();
    let storage = cvd_fleet::storage::ArtefactStorage::new(dir.path());
    tokio::fs::create_dir_all(
        storage
            .image_path(cvd_fleet::domain::ImageKind::System, "x")
            .parent()
            .unwrap(),
    )
    .await
    .unwrap();
    tokio::fs::write(
        storage.image_path(cvd_fleet::domain::ImageKind::System, "kernel.zip"),
        b"kern",
    )
    .await
    .unwrap();

    let mut req = create_request("pixel6");
    req.kernel_image = Some("kernel.zip".to_string());

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    vmm.create_with_progress(req, Some(tx)).await.unwrap();

    let mut steps = Vec::new();
    while let Ok(step) = rx.try_recv() {
        steps.push(step);
    }
    assert!(steps.contains(&cvd_fleet::domain::ProvisionStep::LoadingKernel));
}

#[tokio::test]
async fn start_waits_for_boot_sentinel() {
    let dir = tempfile::tempdir().unwrap();
    let vmm = test_vmm(dir.path()).await;

    vmm.create(create_request("pixel6")).await.unwrap();
    vmm.start("pixel6").await.unwrap();
}

#[tokio::test]
async fn preboot_setup_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let vmm = test_vmm(dir.path()).await;

    vmm.create(create_request("pixel6")).await.unwrap();
    vmm.preboot_setup("pixel6").await.unwrap();
    vmm.preboot_setup("pixel6").await.unwrap();
}

#[tokio::test]
async fn list_reports_running_status_via_launch_cvd_probe() {
    let dir = tempfile::tempdir().unwrap();
    let vmm = test_vmm(dir.path()).await;

    vmm.create(create_request("pixel6")).await.unwrap();
    let items = vmm.list().await.unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].status, DeviceStatus::Running);
}

#[tokio::test]
async fn start_reports_not_found_for_unknown_device() {
    let dir = tempfile::tempdir().unwrap();
    let vmm = test_vmm(dir.path()).await;

    let err = vmm.start("ghost").await.unwrap_err();
    assert!(matches!(err, CoreError::NotFound(_)));
}

#[tokio::test]
async fn stop_checks_sentinel_in_stdout() {
    let dir = tempfile::tempdir().unwrap();
    let vmm = test_vmm(dir.path()).await;

    vmm.create(create_request("pixel6")).await.unwrap();
    vmm.stop("pixel6").await.unwrap();
}

#[tokio::test]
async fn remove_releases_the_instance_index_for_reuse() {
    let dir = tempfile::tempdir().unwrap();
    let vmm = test_vmm(dir.path()).await;

    let created = vmm.create(create_request("pixel6")).await.unwrap();
    vmm.remove("pixel6").await.unwrap();

    let recreated = vmm.create(create_request("pixel7")).await.unwrap();
    assert_eq!(recreated.cf_instance, created.cf_instance);

    let items = vmm.list().await.unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].name, "pixel7");
}

#[tokio::test]
async fn remove_unknown_device_is_not_found() {
    let dir = tempfile::tempdir().unwrap();
    let vmm = test_vmm(dir.path()).await;

    let err = vmm.remove("ghost").await.unwrap_err();
    assert!(matches!(err, CoreError::NotFound(_)));
}

#[tokio::test]
async fn create_rejects_missing_system_image() {
    let dir = tempfile::tempdir().unwrap();
    let vmm = test_vmm(dir.path()).await;

    let mut req = create_request("pixel6");
    req.system_image = "does-not-exist.zip".to_string();
    let err = vmm.create(req).await.unwrap_err();
    assert!(matches!(err, CoreError::InvalidInput(_)));
}

#[tokio::test]
async fn create_rejects_missing_cvd_image() {
    let dir = tempfile::tempdir().unwrap();
    let vmm = test_vmm(dir.path()).await;

    let mut req = create_request("pixel6");
    req.cvd_image = "does-not-exist.tar.gz".to_string();
    let err = vmm.create(req).await.unwrap_err();
    assert!(matches!(err, CoreError::InvalidInput(_)));
}

#[tokio::test]
async fn index_exhaustion_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    unsafe {
        std::env::set_var("CF_INDEX_MAX", "1");
    }
    let vmm = test_vmm(dir.path()).await;
    unsafe {
        std::env::remove_var("CF_INDEX_MAX");
    }

    vmm.create(create_request("pixel6")).await.unwrap();
    let err = vmm.create(create_request("pixel7")).await.unwrap_err();
    assert!(matches!(err, CoreError::IndexExhausted));
}

#[tokio::test]
async fn reconcile_indices_reserves_indices_for_existing_containers() {
    let dir = tempfile::tempdir().unwrap();
    let vmm = test_vmm(dir.path()).await;
    vmm.create(create_request("pixel6")).await.unwrap();

    // Re-running reconcile against the same live runtime must not disturb
    // the index already held by "pixel6" nor let a second device steal it.
    vmm.reconcile_indices().await.unwrap();

    let second = vmm.create(create_request("pixel7")).await.unwrap();
    assert_eq!(second.cf_instance, 2);
}
