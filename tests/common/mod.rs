//! Shared test fixtures: an in-memory `ContainerRuntime` double and
//! `AppState`/`Vmm` builders, used by both the VMM lifecycle tests and the
//! Control API router tests so neither has to stand up a real Docker daemon.

use async_trait::async_trait;
use cvd_fleet::config::Config;
use cvd_fleet::cra::{
    AttachedExec, ContainerRuntime, ContainerSummary, CreateContainerSpec, ExecChunk,
    RuntimeContainerStatus,
};
use cvd_fleet::domain::ImageKind;
use cvd_fleet::error::CoreError;
use cvd_fleet::kvs::{Kvs, SledKvs};
use cvd_fleet::service::vmm::Vmm;
use cvd_fleet::storage::ArtefactStorage;
use cvd_fleet::utils::cli::Args;
use cvd_fleet::utils::state::AppState;
use futures::stream;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

#[derive(Default)]
pub struct FakeRuntimeInner {
    pub containers: HashMap<String, ContainerSummary>,
    /// Tracks whether the vnc bridge "process" is up per container, so the
    /// double can answer `preboot_setup`'s idempotency check and `start`'s
    /// `BridgeMissing` precondition the same way a real container would.
    pub bridges: HashMap<String, bool>,
    /// Tracks whether `launch_cvd` is "running" per container, for the
    /// `ps aux` status probe and the boot/stop lifecycle.
    pub launch_cvd: HashMap<String, bool>,
}

pub struct FakeRuntime {
    pub inner: Mutex<FakeRuntimeInner>,
    pub boot_sentinel: String,
    pub stop_sentinel: String,
}

impl FakeRuntime {
    pub fn new(boot_sentinel: &str, stop_sentinel: &str) -> Self {
        FakeRuntime {
            inner: Mutex::new(FakeRuntimeInner::default()),
            boot_sentinel: boot_sentinel.to_string(),
            stop_sentinel: stop_sentinel.to_string(),
        }
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn create(&self, spec: CreateContainerSpec) -> Result<String, CoreError> {
        let mut inner = self.inner.lock().await;
        inner.containers.insert(
            spec.name.clone(),
            ContainerSummary {
                id: spec.name.clone(),
                name: spec.name.clone(),
                status: RuntimeContainerStatus::Exited,
                created: chrono::Utc::now(),
                labels: spec.labels,
                ip: Some("172.17.0.2".to_string()),
            },
        );
        Ok(spec.name)
    }

    async fn start(&self, container_id_or_name: &str) -> Result<(), CoreError> {
        let mut inner = self.inner.lock().await;
        if let Some(c) = inner.containers.get_mut(container_id_or_name) {
            c.status = RuntimeContainerStatus::Running;
        }
        Ok(())
    }

    async fn stop(&self, container_id_or_name: &str) -> Result<(), CoreError> {
        let mut inner = self.inner.lock().await;
        if let Some(c) = inner.containers.get_mut(container_id_or_name) {
            c.status = RuntimeContainerStatus::Exited;
        }
        Ok(())
    }

    async fn remove(&self, container_id_or_name: &str) -> Result<(), CoreError> {
        let mut inner = self.inner.lock().await;
        inner.containers.remove(container_id_or_name);
        Ok(())
    }

    async fn list(&self, name_prefix: &str) -> Result<Vec<ContainerSummary>, CoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .containers
            .values()
            .filter(|c| c.name.starts_with(name_prefix))
            .cloned()
            .collect())
    }

    async fn inspect(&self, container_id_or_name: &str) -> Result<ContainerSummary, CoreError> {
        let inner = self.inner.lock().await;
        inner
            .containers
            .get(container_id_or_name)
            .cloned()
            .ok_or_else(|| CoreError::NotFound(container_id_or_name.to_string()))
    }

    async fn copy_in(
        &self,
        _container_id_or_name: &str,
        _dest_path: &str,
        _tar_bytes: Vec<u8>,
    ) -> Result<(), CoreError> {
        Ok(())
    }

    async fn exec_detached(
        &self,
        container_id_or_name: &str,
        cmd: Vec<String>,
    ) -> Result<(i64, String, String), CoreError> {
        let mut inner = self.inner.lock().await;
        let joined = cmd.join(" ");
        match cmd.first().map(String::as_str) {
            Some("stop_cvd") => {
                inner.launch_cvd.insert(container_id_or_name.to_string(), false);
                Ok((0, self.stop_sentinel.clone(), String::new()))
            }
            Some("apt-get") => Ok((0, String::new(), String::new())),
            Some("websockify") => {
                inner.bridges.insert(container_id_or_name.to_string(), true);
                Ok((0, String::new(), String::new()))
            }
            Some("sh") if joined.contains("websockify") => {
                let running = inner.bridges.get(container_id_or_name).copied().unwrap_or(false);
                if running {
                    Ok((0, "fakeuser 1 0.0 websockify".to_string(), String::new()))
                } else {
                    Ok((1, String::new(), String::new()))
                }
            }
            Some("sh") if joined.contains("launch_cvd") => {
                let running = inner.launch_cvd.get(container_id_or_name).copied().unwrap_or(false);
                if running {
                    Ok((0, "fakeuser 1 0.0 launch_cvd".to_string(), String::new()))
                } else {
                    Ok((1, String::new(), String::new()))
                }
            }
            _ => Ok((0, String::new(), String::new())),
        }
    }

    async fn exec_attached_tty(
        &self,
        _container_id_or_name: &str,
        _cmd: Vec<String>,
    ) -> Result<AttachedExec, CoreError> {
        let output = stream::iter(Vec::<Result<ExecChunk, CoreError>>::new());
        Ok(AttachedExec {
            exec_id: "fake-exec-tty".to_string(),
            output: Box::pin(output),
            input: Box::pin(tokio::io::sink()),
        })
    }

    async fn exec_attached(
        &self,
        container_id_or_name: &str,
        cmd: Vec<String>,
    ) -> Result<AttachedExec, CoreError> {
        if cmd.first().map(String::as_str) == Some("launch_cvd") {
            let mut inner = self.inner.lock().await;
            inner.launch_cvd.insert(container_id_or_name.to_string(), true);
        }
        let chunk = ExecChunk::Stdout(self.boot_sentinel.clone().into_bytes());
        let output = stream::iter(vec![Ok(chunk)]);
        Ok(AttachedExec {
            exec_id: "fake-exec".to_string(),
            output: Box::pin(output),
            input: Box::pin(tokio::io::sink()),
        })
    }

    async fn resize_tty(&self, _exec_id: &str, _cols: u16, _rows: u16) -> Result<(), CoreError> {
        Ok(())
    }

    async fn kill_by_command_signature(
        &self,
        container_id_or_name: &str,
        _pattern: &str,
    ) -> Result<(), CoreError> {
        let mut inner = self.inner.lock().await;
        inner.launch_cvd.insert(container_id_or_name.to_string(), false);
        Ok(())
    }
}

async fn seed_images(storage: &ArtefactStorage) {
    tokio::fs::create_dir_all(storage.image_path(ImageKind::System, "x").parent().unwrap())
        .await
        .unwrap();
    tokio::fs::write(storage.image_path(ImageKind::System, "aosp.zip"), b"sys")
        .await
        .unwrap();
    tokio::fs::create_dir_all(storage.image_path(ImageKind::Cvd, "x").parent().unwrap())
        .await
        .unwrap();
    tokio::fs::write(storage.image_path(ImageKind::Cvd, "cvd.tar.gz"), b"cvd")
        .await
        .unwrap();
}

fn test_args(data_dir: &std::path::Path) -> Args {
    Args {
        host: "127.0.0.1".to_string(),
        port: 0,
        data_dir: Some(data_dir.to_string_lossy().into_owned()),
    }
}

pub async fn test_vmm(data_dir: &std::path::Path) -> Vmm {
    let config = Arc::new(Config::load(&test_args(data_dir)));
    let kvs: Arc<dyn Kvs> = Arc::new(SledKvs::open(config.kvs_path()).unwrap());
    let runtime: Arc<dyn ContainerRuntime> =
        Arc::new(FakeRuntime::new(&config.boot_sentinel, &config.stop_cvd_sentinel));
    let storage = ArtefactStorage::new(&config.data_dir);
    seed_images(&storage).await;
    Vmm::new(runtime, kvs, storage, config)
}

/// Builds an `AppState` wired to the same in-memory double, for exercising
/// the Control API router end to end without a real container engine.
pub async fn test_app_state(data_dir: &std::path::Path) -> AppState {
    let config = Arc::new(Config::load(&test_args(data_dir)));
    let kvs: Arc<dyn Kvs> = Arc::new(SledKvs::open(config.kvs_path()).unwrap());
    let runtime: Arc<dyn ContainerRuntime> =
        Arc::new(FakeRuntime::new(&config.boot_sentinel, &config.stop_cvd_sentinel));
    let state = AppState::new(runtime, kvs, config);
    seed_images(&state.storage).await;
    state
}
