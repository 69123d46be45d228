//! Virtual Machine Manager core (spec §4.3): the orchestration that turns a
//! `CreateVmRequest` into a running cuttlefish container, and back down
//! again.

use crate::config::Config;
use crate::cra::{ContainerRuntime, CreateContainerSpec, MountSpec, RuntimeContainerStatus};
use crate::domain::{ContainerConfig, CreateVmRequest, DeviceStatus, ProvisionStep, VmItem};
use crate::error::CoreError;
use crate::kvs::{Kvs, KvsMiss};
use crate::storage::ArtefactStorage;
use crate::utils::validation::is_valid_device_name;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

const CONFIG_BUCKET: &str = "devices";
const CUTTLEFISH_IMAGE: &str = "cuttlefish-orchestration:latest";

/// Guards cuttlefish instance index allocation (spec §4.3.2, §5): at most
/// one `VMCreate` may claim an index at a time, and indices are reused only
/// after their owning device is fully removed.
struct IndexAllocator {
    max: u32,
    taken: Mutex<HashMap<u32, String>>,
}

impl IndexAllocator {
    fn new(max: u32) -> Self {
        IndexAllocator {
            max,
            taken: Mutex::new(HashMap::new()),
        }
    }

    async fn allocate(&self, owner: &str) -> Result<u32, CoreError> {
        let mut taken = self.taken.lock().await;
        for idx in 1..=self.max {
            if !taken.contains_key(&idx) {
                taken.insert(idx, owner.to_string());
                return Ok(idx);
            }
        }
        Err(CoreError::IndexExhausted)
    }

    async fn release(&self, owner: &str) {
        let mut taken = self.taken.lock().await;
        taken.retain(|_, held_by| held_by != owner);
    }

    async fn reserve(&self, idx: u32, owner: &str) {
        let mut taken = self.taken.lock().await;
        taken.insert(idx, owner.to_string());
    }
}

pub struct Vmm {
    runtime: Arc<dyn ContainerRuntime>,
    kvs: Arc<dyn Kvs>,
    storage: ArtefactStorage,
    config: Arc<Config>,
    indices: IndexAllocator,
}

impl Vmm {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        kvs: Arc<dyn Kvs>,
        storage: ArtefactStorage,
        config: Arc<Config>,
    ) -> Self {
        let indices = IndexAllocator::new(config.cf_index_max);
        Vmm {
            runtime,
            kvs,
            storage,
            config,
            indices,
        }
    }

    /// Restores in-memory index bookkeeping from existing containers at
    /// startup, since `IndexAllocator` itself is not persisted.
    pub async fn reconcile_indices(&self) -> Result<(), CoreError> {
        let items = self.list().await?;
        for item in items {
            self.indices.reserve(item.cf_instance, &item.name).await;
        }
        Ok(())
    }

    fn container_name(&self, device_name: &str) -> String {
        self.config.container_name(device_name)
    }

    /// The full provisioning pipeline (spec §4.4.3) without progress
    /// reporting, for callers that only want the final result.
    pub async fn create(&self, req: CreateVmRequest) -> Result<VmItem, CoreError> {
        self.create_with_progress(req, None).await
    }

    /// Drives `VMCreate` → `VMPreBootSetup` → `VMLoadFile`(system) →
    /// `VMUnzipImage` → `VMLoadFile`(cvd) → `VMStart` as one coordinated
    /// sequence (spec §4.4.3 "progress-reporting provisioning pipeline"),
    /// reporting each `ProvisionStep` to `progress` as it starts. Any
    /// failure after index allocation releases the index and removes the
    /// partially-created container so retries see a clean slate.
    #[tracing::instrument(skip(self, progress), fields(device = %req.name))]
    pub async fn create_with_progress(
        &self,
        req: CreateVmRequest,
        progress: Option<tokio::sync::mpsc::UnboundedSender<ProvisionStep>>,
    ) -> Result<VmItem, CoreError> {
        if !is_valid_device_name(&req.name) {
            return Err(CoreError::InvalidInput(format!(
                "invalid device name: {}",
                req.name
            )));
        }
        let container_name = self.container_name(&req.name);
        if self.runtime.inspect(&container_name).await.is_ok() {
            return Err(CoreError::Duplicate(format!(
                "device {} already exists",
                req.name
            )));
        }
        if !self.storage.image_exists(crate::domain::ImageKind::System, &req.system_image).await {
            return Err(CoreError::InvalidInput(format!(
                "system image not found: {}",
                req.system_image
            )));
        }
        if !self.storage.image_exists(crate::domain::ImageKind::Cvd, &req.cvd_image).await {
            return Err(CoreError::InvalidInput(format!(
                "cvd image not found: {}",
                req.cvd_image
            )));
        }

        report(&progress, ProvisionStep::AllocatingIndex);
        let cf_instance = self.indices.allocate(&req.name).await?;

        let result = self
            .create_inner(&req, &container_name, cf_instance, &progress)
            .await;
        if let Err(err) = &result {
            tracing::warn!(device = %req.name, error = %err, "rolling back failed VMCreate");
            self.indices.release(&req.name).await;
            let _ = self.runtime.remove(&container_name).await;
            let _ = self.kvs.remove_container(&container_name).await;
        } else {
            tracing::info!(device = %req.name, cf_instance, "device provisioned");
            report(&progress, ProvisionStep::Done);
        }
        result
    }

    async fn create_inner(
        &self,
        req: &CreateVmRequest,
        container_name: &str,
        cf_instance: u32,
        progress: &Option<tokio::sync::mpsc::UnboundedSender<ProvisionStep>>,
    ) -> Result<VmItem, CoreError> {
        let port_bindings = vec![
            (self.bridge_listen_port(cf_instance), 6080),
            (self.vnc_target_port(cf_instance), 6444),
            (self.config.adb_port_base + (cf_instance as u16 - 1), 6520),
        ];

        self.storage.ensure_device_dir(&req.name).await.map_err(|e| {
            CoreError::InternalInvariant(format!("failed to create device directory: {e}"))
        })?;

        report(progress, ProvisionStep::CreatingContainer);
        self.runtime
            .create(CreateContainerSpec {
                name: container_name.to_string(),
                image: CUTTLEFISH_IMAGE.to_string(),
                privileged: true,
                port_bindings,
                env: vec![
                    "HOME=/home/vsoc-01".to_string(),
                    format!("CUTTLEFISH_INSTANCE={cf_instance}"),
                ],
                labels: container_labels(cf_instance, &req.system_image),
                mounts: vec![MountSpec {
                    host_path: "/sys/fs/cgroup".to_string(),
                    container_path: "/sys/fs/cgroup".to_string(),
                    read_only: true,
                }],
            })
            .await?;

        report(progress, ProvisionStep::StartingContainer);
        self.runtime.start(container_name).await?;
        let summary = self.runtime.inspect(container_name).await?;

        let cfg = ContainerConfig {
            cpu: req.cpu,
            ram: req.ram,
            os_version: req.system_image.clone(),
            cmdline: req.cmdline.clone().unwrap_or_default(),
            cf_instance,
        };
        self.persist_config(container_name, &cfg).await?;

        report(progress, ProvisionStep::InstallingBridge);
        self.install_bridge(container_name, cf_instance).await?;

        report(progress, ProvisionStep::LoadingSystemImage);
        self.load_file(
            container_name,
            &self.storage.image_path(crate::domain::ImageKind::System, &req.system_image),
            "/home/vsoc-01/system.zip",
        )
        .await?;
        report(progress, ProvisionStep::UnzippingSystemImage);
        self.unzip_image(container_name, "/home/vsoc-01/system.zip", "/home/vsoc-01")
            .await?;

        report(progress, ProvisionStep::LoadingCvdImage);
        self.load_file(
            container_name,
            &self.storage.image_path(crate::domain::ImageKind::Cvd, &req.cvd_image),
            "/home/vsoc-01/cvd-host.tar.gz",
        )
        .await?;
        report(progress, ProvisionStep::UnzippingCvdImage);
        self.unzip_image(container_name, "/home/vsoc-01/cvd-host.tar.gz", "/home/vsoc-01")
            .await?;

        if let Some(kernel) = &req.kernel_image {
            report(progress, ProvisionStep::LoadingKernel);
            self.load_file(
                container_name,
                &self.storage.image_path(crate::domain::ImageKind::System, kernel),
                "/home/vsoc-01/kernel",
            )
            .await?;
        }

        report(progress, ProvisionStep::Booting);
        self.launch(container_name, &cfg, None).await?;

        Ok(VmItem {
            id: container_name.to_string(),
            name: req.name.clone(),
            created: chrono::Utc::now(),
            os_version: cfg.os_version,
            cpu: cfg.cpu,
            ram: cfg.ram,
            cmdline: cfg.cmdline,
            ip: summary.ip,
            cf_instance,
            status: DeviceStatus::Running,
            tags: summary.labels,
        })
    }

    async fn persist_config(
        &self,
        container_name: &str,
        cfg: &ContainerConfig,
    ) -> Result<(), CoreError> {
        let bytes = serde_json::to_vec(cfg)
            .map_err(|e| CoreError::InternalInvariant(format!("config serialize: {e}")))?;
        self.kvs.put_container(container_name, "config", &bytes).await
    }

    fn bridge_listen_port(&self, cf_instance: u32) -> u16 {
        self.config.bridge_port_base + (cf_instance as u16 - 1)
    }

    fn vnc_target_port(&self, cf_instance: u32) -> u16 {
        self.config.vnc_port_base + (cf_instance as u16 - 1)
    }

    /// `VMPreBootSetup` (spec §4.3.2): installs and starts the in-container
    /// websocket-to-RFB bridge that the web UI's VNC viewer connects through,
    /// listening on `0.0.0.0:<bridge_port>` and forwarding to the cuttlefish
    /// VNC server on `127.0.0.1:<vnc_port>`. Idempotent: a no-op if the
    /// bridge process is already running.
    pub async fn preboot_setup(&self, device_name: &str) -> Result<(), CoreError> {
        let container_name = self.container_name(device_name);
        self.ensure_exists(&container_name).await?;
        let cfg = self.persisted_config(&container_name).await?;
        self.install_bridge(&container_name, cfg.cf_instance).await
    }

    async fn install_bridge(&self, container_name: &str, cf_instance: u32) -> Result<(), CoreError> {
        let listen_port = self.bridge_listen_port(cf_instance);
        let target_port = self.vnc_target_port(cf_instance);

        if self.bridge_running(container_name, listen_port).await? {
            return Ok(());
        }

        let (exit, _stdout, stderr) = self
            .runtime
            .exec_detached(
                container_name,
                vec![
                    "apt-get".to_string(),
                    "install".to_string(),
                    "-y".to_string(),
                    "websockify".to_string(),
                ],
            )
            .await?;
        if exit != 0 {
            return Err(CoreError::BridgeInstallFailed(stderr));
        }

        self.runtime
            .exec_detached(
                container_name,
                vec![
                    "websockify".to_string(),
                    "-D".to_string(),
                    format!("0.0.0.0:{listen_port}"),
                    format!("127.0.0.1:{target_port}"),
                ],
            )
            .await?;

        if !self.bridge_running(container_name, listen_port).await? {
            return Err(CoreError::BridgePortInUse(format!(
                "vnc bridge did not come up listening on {listen_port}"
            )));
        }
        Ok(())
    }

    async fn bridge_running(&self, container_name: &str, listen_port: u16) -> Result<bool, CoreError> {
        let (exit, stdout, _stderr) = self
            .runtime
            .exec_detached(
                container_name,
                vec![
                    "sh".to_string(),
                    "-c".to_string(),
                    format!("ps aux | grep -E '[w]ebsockify.*{listen_port}'"),
                ],
            )
            .await?;
        Ok(exit == 0 && !stdout.trim().is_empty())
    }

    /// Looks up the cuttlefish instance index persisted at `VMCreate` time,
    /// for callers outside `Vmm` that need to address the device's
    /// index-suffixed runtime directory (e.g. log tailing, spec §4.4.2).
    pub async fn cf_instance(&self, device_name: &str) -> Result<u32, CoreError> {
        let container_name = self.container_name(device_name);
        self.ensure_exists(&container_name).await?;
        let cfg = self.persisted_config(&container_name).await?;
        Ok(cfg.cf_instance)
    }

    async fn persisted_config(&self, container_name: &str) -> Result<ContainerConfig, CoreError> {
        let bytes = self
            .kvs
            .get_container(container_name, "config")
            .await?
            .map_err(|miss| match miss {
                KvsMiss::Bucket => {
                    CoreError::NotFound(format!("no kvs bucket for container {container_name}"))
                }
                KvsMiss::Key => {
                    CoreError::NotFound(format!("no persisted config for {container_name}"))
                }
            })?;
        serde_json::from_slice(&bytes)
            .map_err(|e| CoreError::InternalInvariant(format!("corrupt persisted config: {e}")))
    }

    /// `VMLoadFile` (spec §4.3.4): tars a single host file and copies it
    /// into the container at `dest_path`.
    async fn load_file(
        &self,
        container_name: &str,
        host_path: &std::path::Path,
        dest_path: &str,
    ) -> Result<(), CoreError> {
        let tar_bytes = tar_single_file(host_path)
            .await
            .map_err(|e| CoreError::CopyFailed(e.to_string()))?;
        self.runtime.copy_in(container_name, dest_path, tar_bytes).await
    }

    /// `VMUnzipImage` (spec §4.3.5): extracts an archive already copied into
    /// the container, in place.
    async fn unzip_image(
        &self,
        container_name: &str,
        archive_path: &str,
        dest_dir: &str,
    ) -> Result<(), CoreError> {
        let cmd = if archive_path.ends_with(".zip") {
            vec!["unzip".to_string(), "-o".to_string(), archive_path.to_string(), "-d".to_string(), dest_dir.to_string()]
        } else {
            vec!["tar".to_string(), "xzf".to_string(), archive_path.to_string(), "-C".to_string(), dest_dir.to_string()]
        };
        let (exit, _stdout, stderr) = self.runtime.exec_detached(container_name, cmd).await?;
        if exit != 0 {
            return Err(CoreError::ExecFailed { exit, stderr });
        }
        Ok(())
    }

    /// `VMStart` (spec §4.3.6): reads the persisted command-line from KVS,
    /// appends the caller's additions, launches `launch_cvd` and waits for
    /// the boot sentinel to appear in its output, up to
    /// `timeout_vm_start_secs`. Requires `VMPreBootSetup` to have already
    /// succeeded for this device — checked via the bridge process's
    /// presence rather than any separate flag, so it holds across restarts.
    #[tracing::instrument(skip(self), fields(device = %device_name))]
    pub async fn start(&self, device_name: &str) -> Result<(), CoreError> {
        let container_name = self.container_name(device_name);
        self.ensure_exists(&container_name).await?;
        let cfg = self.persisted_config(&container_name).await?;
        self.launch(&container_name, &cfg, None).await?;
        tracing::info!(device = %device_name, "device booted");
        Ok(())
    }

    async fn launch(
        &self,
        container_name: &str,
        cfg: &ContainerConfig,
        extra_cmdline: Option<&str>,
    ) -> Result<(), CoreError> {
        if !self
            .bridge_running(container_name, self.bridge_listen_port(cfg.cf_instance))
            .await?
        {
            return Err(CoreError::BridgeMissing);
        }

        let mut cmd = vec![
            "launch_cvd".to_string(),
            "-daemon".to_string(),
            "-report_anonymous_usage_stats=n".to_string(),
        ];
        if !cfg.cmdline.is_empty() {
            cmd.extend(cfg.cmdline.split_whitespace().map(str::to_string));
        }
        if let Some(extra) = extra_cmdline {
            cmd.extend(extra.split_whitespace().map(str::to_string));
        }

        let attached = self.runtime.exec_attached(container_name, cmd).await?;
        wait_for_sentinel(
            attached.output,
            &self.config.boot_sentinel,
            std::time::Duration::from_secs(self.config.timeout_vm_start_secs),
        )
        .await
    }

    /// `VMStop` (spec §4.3.7): runs `stop_cvd` and waits for its success
    /// sentinel.
    #[tracing::instrument(skip(self), fields(device = %device_name))]
    pub async fn stop(&self, device_name: &str) -> Result<(), CoreError> {
        let container_name = self.container_name(device_name);
        self.ensure_exists(&container_name).await?;

        let (exit, stdout, stderr) = self
            .runtime
            .exec_detached(&container_name, vec!["stop_cvd".to_string()])
            .await?;
        if exit != 0 || !stdout.contains(&self.config.stop_cvd_sentinel) {
            return Err(CoreError::StopFailed(if stderr.is_empty() {
                stdout
            } else {
                stderr
            }));
        }
        tracing::info!(device = %device_name, "device stopped");
        Ok(())
    }

    /// `VMRemove` (spec §4.3.7): signals `launch_cvd`, then removes the
    /// container, device directory, and KVS state, releasing the
    /// cuttlefish instance index. Container removal is authoritative: once
    /// it succeeds the call reports success even if directory or KVS
    /// cleanup subsequently fails, since neither leaves anything a future
    /// `VMCreate` of the same name can't simply overwrite.
    #[tracing::instrument(skip(self), fields(device = %device_name))]
    pub async fn remove(&self, device_name: &str) -> Result<(), CoreError> {
        let container_name = self.container_name(device_name);
        self.ensure_exists(&container_name).await?;

        if let Err(err) = self
            .runtime
            .kill_by_command_signature(&container_name, "launch_cvd")
            .await
        {
            tracing::warn!(device = %device_name, error = %err, "failed to signal launch_cvd before removal");
        }
        self.runtime.remove(&container_name).await?;

        if let Err(err) = self.storage.remove_device_dir(device_name).await {
            tracing::warn!(device = %device_name, error = %err, "failed to remove device directory after container removal");
        }
        if let Err(err) = self.kvs.remove_container(&container_name).await {
            tracing::warn!(device = %device_name, error = %err, "failed to clear kvs state after container removal");
        }
        self.indices.release(device_name).await;
        Ok(())
    }

    /// `VMList` (spec §4.3.8): enumerates containers with the configured
    /// prefix, joining each with its persisted configuration. Per-item
    /// inspection/config-read failures are logged and the item skipped
    /// rather than failing the whole list.
    pub async fn list(&self) -> Result<Vec<VmItem>, CoreError> {
        let summaries = self.runtime.list(&self.config.container_prefix).await?;
        let mut out = Vec::with_capacity(summaries.len());

        for summary in summaries {
            let device_name = summary
                .name
                .strip_prefix(&self.config.container_prefix)
                .unwrap_or(&summary.name)
                .to_string();

            let cfg_bytes = match self.kvs.get_container(&summary.name, "config").await {
                Ok(Ok(bytes)) => bytes,
                Ok(Err(KvsMiss::Bucket)) => {
                    tracing::warn!(device = %device_name, "no kvs bucket for container, skipping");
                    continue;
                }
                Ok(Err(KvsMiss::Key)) => {
                    tracing::warn!(device = %device_name, "no persisted config for container, skipping");
                    continue;
                }
                Err(err) => {
                    tracing::warn!(device = %device_name, error = %err, "kvs read failed, skipping");
                    continue;
                }
            };
            let cfg: ContainerConfig = match serde_json::from_slice(&cfg_bytes) {
                Ok(c) => c,
                Err(err) => {
                    tracing::warn!(device = %device_name, error = %err, "corrupt config, skipping");
                    continue;
                }
            };

            let status = match summary.status {
                RuntimeContainerStatus::Running => {
                    self.probe_emulator_status(&summary.name, &device_name).await
                }
                RuntimeContainerStatus::Exited => DeviceStatus::ContainerReady,
                RuntimeContainerStatus::Other(_) => DeviceStatus::ContainerError,
            };

            out.push(VmItem {
                id: summary.id,
                name: device_name,
                created: summary.created,
                os_version: cfg.os_version,
                cpu: cfg.cpu,
                ram: cfg.ram,
                cmdline: cfg.cmdline,
                ip: summary.ip,
                cf_instance: cfg.cf_instance,
                status,
                tags: summary.labels,
            });
        }
        Ok(out)
    }

    /// Device Status (spec §3, §4.3.9) is never stored; a `Running`
    /// container still needs an in-container `ps aux` probe for `launch_cvd`
    /// to tell "container up, emulator absent" from "emulator running".
    async fn probe_emulator_status(&self, container_name: &str, device_name: &str) -> DeviceStatus {
        let probe = self
            .runtime
            .exec_detached(
                container_name,
                vec![
                    "sh".to_string(),
                    "-c".to_string(),
                    "ps aux | grep '[l]aunch_cvd'".to_string(),
                ],
            )
            .await;
        match probe {
            Ok((0, stdout, _)) if !stdout.trim().is_empty() => DeviceStatus::Running,
            Ok(_) => DeviceStatus::ContainerReady,
            Err(err) => {
                tracing::warn!(device = %device_name, error = %err, "launch_cvd status probe failed");
                DeviceStatus::ContainerError
            }
        }
    }

    async fn ensure_exists(&self, container_name: &str) -> Result<(), CoreError> {
        self.runtime
            .inspect(container_name)
            .await
            .map(|_| ())
            .map_err(|_| CoreError::NotFound(format!("no such device container: {container_name}")))
    }
}

async fn tar_single_file(path: &std::path::Path) -> std::io::Result<Vec<u8>> {
    let bytes = tokio::fs::read(path).await?;
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "payload".to_string());

    tokio::task::spawn_blocking(move || -> std::io::Result<Vec<u8>> {
        let mut builder = tar::Builder::new(Vec::new());
        let mut header = tar::Header::new_gnu();
        header.set_size(bytes.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, &file_name, bytes.as_slice())?;
        builder.into_inner()
    })
    .await
    .map_err(|e| std::io::Error::other(e.to_string()))?
}

/// Compatibility-marker labels set at `Create` time (spec §4.3.1 effect 3,
/// §6 "Container labels").
fn container_labels(cf_instance: u32, os_version: &str) -> HashMap<String, String> {
    HashMap::from([
        ("cf_instance".to_string(), cf_instance.to_string()),
        ("n_cf_instances".to_string(), "1".to_string()),
        ("vsock_guest_cid".to_string(), "false".to_string()),
        ("matrisea_instance".to_string(), cf_instance.to_string()),
        ("matrisea_device_template".to_string(), os_version.to_string()),
    ])
}

/// Best-effort progress notification: the receiver may have been dropped
/// (e.g. the control-socket client disconnected mid-provision), in which
/// case the send is silently ignored since `VMCreate` itself must still run
/// to completion.
fn report(
    progress: &Option<tokio::sync::mpsc::UnboundedSender<ProvisionStep>>,
    step: ProvisionStep,
) {
    if let Some(tx) = progress {
        let _ = tx.send(step);
    }
}

async fn wait_for_sentinel(
    mut output: crate::cra::ExecStream,
    sentinel: &str,
    timeout: std::time::Duration,
) -> Result<(), CoreError> {
    use futures::StreamExt;

    let deadline = tokio::time::sleep(timeout);
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            chunk = output.next() => {
                match chunk {
                    Some(Ok(crate::cra::ExecChunk::Stdout(bytes))) | Some(Ok(crate::cra::ExecChunk::Stderr(bytes))) => {
                        if String::from_utf8_lossy(&bytes).contains(sentinel) {
                            return Ok(());
                        }
                    }
                    Some(Err(err)) => return Err(err),
                    None => return Err(CoreError::BootEof),
                }
            }
            _ = &mut deadline => {
                return Err(CoreError::BootTimeout);
            }
        }
    }
}
