//! Container Runtime Adapter (spec §4.2): a typed facade over the host's
//! container engine.
//!
//! `bollard::Docker` opened once against the local Unix socket,
//! `create_exec`/`start_exec` with `StartExecResults::Attached` demuxed by
//! `bollard::container::LogOutput`.

use crate::error::{CoreError, InternalError};
use async_trait::async_trait;
use bollard::Docker;
use bollard::container::{
    Config as ContainerCreateConfig, LogOutput, RemoveContainerOptions,
};
use bollard::exec::{CreateExecOptions, ResizeExecOptions, StartExecResults};
use bollard::models::ContainerStateStatusEnum;
use bollard::query_parameters::{
    CreateContainerOptionsBuilder, InspectContainerOptionsBuilder, ListContainersOptionsBuilder,
    RemoveContainerOptionsBuilder, StartContainerOptionsBuilder, StopContainerOptionsBuilder,
    UploadToContainerOptionsBuilder,
};
use futures::{Stream, StreamExt};
use std::collections::HashMap;
use std::pin::Pin;

/// One chunk of demultiplexed exec/attach output.
#[derive(Debug)]
pub enum ExecChunk {
    Stdout(Vec<u8>),
    Stderr(Vec<u8>),
}

pub type ExecStream = Pin<Box<dyn Stream<Item = Result<ExecChunk, CoreError>> + Send>>;

/// A handle to an interactively attached exec session (spec §4.4.1
/// "interactive terminal").
pub struct AttachedExec {
    pub exec_id: String,
    pub output: ExecStream,
    pub input: Pin<Box<dyn tokio::io::AsyncWrite + Send>>,
}

/// A bind mount required at container creation, e.g. the mandatory
/// `/sys/fs/cgroup` RO bind cuttlefish needs (spec §4.2 Create, §4.3.1
/// effect 3).
#[derive(Debug, Clone)]
pub struct MountSpec {
    pub host_path: String,
    pub container_path: String,
    pub read_only: bool,
}

#[derive(Debug, Clone)]
pub struct CreateContainerSpec {
    pub name: String,
    pub image: String,
    pub privileged: bool,
    pub port_bindings: Vec<(u16, u16)>,
    pub env: Vec<String>,
    /// Compatibility-marker labels (spec §6 "Container labels"):
    /// `cf_instance`, `n_cf_instances`, `vsock_guest_cid`,
    /// `matrisea_instance`, `matrisea_device_template`.
    pub labels: HashMap<String, String>,
    pub mounts: Vec<MountSpec>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuntimeContainerStatus {
    Running,
    Exited,
    Other(String),
}

#[derive(Debug, Clone)]
pub struct ContainerSummary {
    pub id: String,
    pub name: String,
    pub status: RuntimeContainerStatus,
    pub created: chrono::DateTime<chrono::Utc>,
    /// Labels as set at `Create` time (spec §4.2 Inspect/List contract).
    pub labels: HashMap<String, String>,
    /// First-interface IPv4 on the default bridge, if the container has one.
    pub ip: Option<String>,
}

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn create(&self, spec: CreateContainerSpec) -> Result<String, CoreError>;
    async fn start(&self, container_id_or_name: &str) -> Result<(), CoreError>;
    async fn stop(&self, container_id_or_name: &str) -> Result<(), CoreError>;
    async fn remove(&self, container_id_or_name: &str) -> Result<(), CoreError>;
    async fn list(&self, name_prefix: &str) -> Result<Vec<ContainerSummary>, CoreError>;
    async fn inspect(&self, container_id_or_name: &str) -> Result<ContainerSummary, CoreError>;

    /// Copies a tar archive's contents into `dest_path` inside the container.
    async fn copy_in(
        &self,
        container_id_or_name: &str,
        dest_path: &str,
        tar_bytes: Vec<u8>,
    ) -> Result<(), CoreError>;

    /// Runs `cmd` and returns once it exits, collecting stdout/stderr and the
    /// exit code. Used for provisioning steps (spec §4.4.3).
    async fn exec_detached(
        &self,
        container_id_or_name: &str,
        cmd: Vec<String>,
    ) -> Result<(i64, String, String), CoreError>;

    /// Starts `cmd` attached with a TTY and returns a live handle for
    /// bidirectional streaming (spec §4.4.1 interactive terminal).
    async fn exec_attached_tty(
        &self,
        container_id_or_name: &str,
        cmd: Vec<String>,
    ) -> Result<AttachedExec, CoreError>;

    /// Starts `cmd` attached without a TTY (used by the log tailer, spec
    /// §4.4.2, where stdout/stderr framing must stay demultiplexed).
    async fn exec_attached(
        &self,
        container_id_or_name: &str,
        cmd: Vec<String>,
    ) -> Result<AttachedExec, CoreError>;

    async fn resize_tty(&self, exec_id: &str, cols: u16, rows: u16) -> Result<(), CoreError>;

    /// Sends SIGTERM to every process inside the container whose command
    /// line matches `pattern`, i.e. `pkill -f <pattern>`.
    async fn kill_by_command_signature(
        &self,
        container_id_or_name: &str,
        pattern: &str,
    ) -> Result<(), CoreError>;
}

pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    pub fn connect() -> Result<Self, InternalError> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(InternalError::Docker)?;
        tracing::debug!("connected to container engine over the local unix socket");
        Ok(DockerRuntime { docker })
    }

    fn map_docker_err(err: bollard::errors::Error) -> CoreError {
        CoreError::RuntimeError(err.to_string())
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn create(&self, spec: CreateContainerSpec) -> Result<String, CoreError> {
        tracing::debug!(container = %spec.name, image = %spec.image, "creating container");
        let mut port_bindings = HashMap::new();
        let mut exposed_ports = HashMap::new();
        for (host_port, container_port) in &spec.port_bindings {
            let key = format!("{container_port}/tcp");
            exposed_ports.insert(key.clone(), HashMap::new());
            port_bindings.insert(
                key,
                Some(vec![bollard::models::PortBinding {
                    host_ip: Some("0.0.0.0".to_string()),
                    host_port: Some(host_port.to_string()),
                }]),
            );
        }

        let binds = spec
            .mounts
            .iter()
            .map(|m| {
                let mode = if m.read_only { "ro" } else { "rw" };
                format!("{}:{}:{mode}", m.host_path, m.container_path)
            })
            .collect();

        let host_config = bollard::models::HostConfig {
            privileged: Some(spec.privileged),
            port_bindings: Some(port_bindings),
            binds: Some(binds),
            ..Default::default()
        };

        let config = ContainerCreateConfig {
            image: Some(spec.image),
            env: Some(spec.env),
            exposed_ports: Some(exposed_ports),
            host_config: Some(host_config),
            labels: Some(spec.labels),
            tty: Some(true),
            ..Default::default()
        };

        let options = CreateContainerOptionsBuilder::new().name(&spec.name).build();
        let response = self
            .docker
            .create_container(Some(options), config)
            .await
            .map_err(Self::map_docker_err)?;
        Ok(response.id)
    }

    async fn start(&self, container_id_or_name: &str) -> Result<(), CoreError> {
        tracing::debug!(container = %container_id_or_name, "starting container");
        self.docker
            .start_container(container_id_or_name, None::<StartContainerOptionsBuilder>)
            .await
            .map_err(Self::map_docker_err)
    }

    async fn stop(&self, container_id_or_name: &str) -> Result<(), CoreError> {
        tracing::debug!(container = %container_id_or_name, "stopping container");
        let options = StopContainerOptionsBuilder::new().t(10).build();
        self.docker
            .stop_container(container_id_or_name, Some(options))
            .await
            .map_err(Self::map_docker_err)
    }

    async fn remove(&self, container_id_or_name: &str) -> Result<(), CoreError> {
        tracing::debug!(container = %container_id_or_name, "removing container");
        let options = RemoveContainerOptionsBuilder::new().force(true).v(true).build();
        self.docker
            .remove_container(container_id_or_name, Some(options))
            .await
            .map_err(Self::map_docker_err)
    }

    async fn list(&self, name_prefix: &str) -> Result<Vec<ContainerSummary>, CoreError> {
        let options = ListContainersOptionsBuilder::new().all(true).build();
        let containers = self
            .docker
            .list_containers(Some(options))
            .await
            .map_err(Self::map_docker_err)?;

        let mut out = Vec::new();
        for c in containers {
            let name = c
                .names
                .as_ref()
                .and_then(|names| names.first())
                .map(|n| n.trim_start_matches('/').to_string())
                .unwrap_or_default();
            if !name.starts_with(name_prefix) {
                continue;
            }
            let status = match c.state.as_deref() {
                Some("running") => RuntimeContainerStatus::Running,
                Some("exited") => RuntimeContainerStatus::Exited,
                other => RuntimeContainerStatus::Other(other.unwrap_or("unknown").to_string()),
            };
            let created = c
                .created
                .and_then(|ts| chrono::DateTime::from_timestamp(ts, 0))
                .unwrap_or_else(chrono::Utc::now);
            let ip = c
                .network_settings
                .as_ref()
                .and_then(|ns| ns.networks.as_ref())
                .and_then(|networks| networks.values().next())
                .and_then(|endpoint| endpoint.ip_address.clone())
                .filter(|ip| !ip.is_empty());
            out.push(ContainerSummary {
                id: c.id.unwrap_or_default(),
                name,
                status,
                created,
                labels: c.labels.unwrap_or_default(),
                ip,
            });
        }
        Ok(out)
    }

    async fn inspect(&self, container_id_or_name: &str) -> Result<ContainerSummary, CoreError> {
        let options = InspectContainerOptionsBuilder::new().build();
        let info = self
            .docker
            .inspect_container(container_id_or_name, Some(options))
            .await
            .map_err(|e| CoreError::NotFound(format!("container {container_id_or_name}: {e}")))?;

        let status = match info
            .state
            .as_ref()
            .and_then(|s| s.status)
        {
            Some(ContainerStateStatusEnum::RUNNING) => RuntimeContainerStatus::Running,
            Some(ContainerStateStatusEnum::EXITED) => RuntimeContainerStatus::Exited,
            Some(other) => RuntimeContainerStatus::Other(other.to_string()),
            None => RuntimeContainerStatus::Other("unknown".to_string()),
        };
        let created = info
            .created
            .as_deref()
            .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&chrono::Utc))
            .unwrap_or_else(chrono::Utc::now);
        let labels = info
            .config
            .as_ref()
            .and_then(|c| c.labels.clone())
            .unwrap_or_default();
        let ip = info
            .network_settings
            .as_ref()
            .and_then(|ns| ns.networks.as_ref())
            .and_then(|networks| networks.values().next())
            .and_then(|endpoint| endpoint.ip_address.clone())
            .filter(|ip| !ip.is_empty());

        Ok(ContainerSummary {
            id: info.id.unwrap_or_default(),
            name: info
                .name
                .unwrap_or_default()
                .trim_start_matches('/')
                .to_string(),
            status,
            created,
            labels,
            ip,
        })
    }

    async fn copy_in(
        &self,
        container_id_or_name: &str,
        dest_path: &str,
        tar_bytes: Vec<u8>,
    ) -> Result<(), CoreError> {
        let options = UploadToContainerOptionsBuilder::new().path(dest_path).build();
        self.docker
            .upload_to_container(container_id_or_name, Some(options), tar_bytes.into())
            .await
            .map_err(|e| CoreError::CopyFailed(e.to_string()))
    }

    async fn exec_detached(
        &self,
        container_id_or_name: &str,
        cmd: Vec<String>,
    ) -> Result<(i64, String, String), CoreError> {
        let exec = self
            .docker
            .create_exec(
                container_id_or_name,
                CreateExecOptions {
                    cmd: Some(cmd),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    ..Default::default()
                },
            )
            .await
            .map_err(Self::map_docker_err)?;

        let result = self
            .docker
            .start_exec(&exec.id, None)
            .await
            .map_err(Self::map_docker_err)?;

        let (mut stdout, mut stderr) = (Vec::new(), Vec::new());
        if let StartExecResults::Attached { mut output, .. } = result {
            while let Some(chunk) = output.next().await {
                match chunk.map_err(Self::map_docker_err)? {
                    LogOutput::StdOut { message } => stdout.extend_from_slice(&message),
                    LogOutput::StdErr { message } => stderr.extend_from_slice(&message),
                    _ => {}
                }
            }
        }

        let inspected = self
            .docker
            .inspect_exec(&exec.id)
            .await
            .map_err(Self::map_docker_err)?;
        let exit_code = inspected.exit_code.unwrap_or(-1);

        Ok((
            exit_code,
            String::from_utf8_lossy(&stdout).into_owned(),
            String::from_utf8_lossy(&stderr).into_owned(),
        ))
    }

    async fn exec_attached_tty(
        &self,
        container_id_or_name: &str,
        cmd: Vec<String>,
    ) -> Result<AttachedExec, CoreError> {
        start_attached(&self.docker, container_id_or_name, cmd, true).await
    }

    async fn exec_attached(
        &self,
        container_id_or_name: &str,
        cmd: Vec<String>,
    ) -> Result<AttachedExec, CoreError> {
        start_attached(&self.docker, container_id_or_name, cmd, false).await
    }

    async fn resize_tty(&self, exec_id: &str, cols: u16, rows: u16) -> Result<(), CoreError> {
        self.docker
            .resize_exec(
                exec_id,
                ResizeExecOptions {
                    height: rows,
                    width: cols,
                },
            )
            .await
            .map_err(Self::map_docker_err)
    }

    async fn kill_by_command_signature(
        &self,
        container_id_or_name: &str,
        pattern: &str,
    ) -> Result<(), CoreError> {
        let (exit_code, _stdout, stderr) = self
            .exec_detached(
                container_id_or_name,
                vec!["pkill".to_string(), "-f".to_string(), pattern.to_string()],
            )
            .await?;
        // pkill exits 1 when no process matched, which is not an error here.
        if exit_code != 0 && exit_code != 1 {
            return Err(CoreError::ExecFailed {
                exit: exit_code,
                stderr,
            });
        }
        Ok(())
    }
}

async fn start_attached(
    docker: &Docker,
    container_id_or_name: &str,
    cmd: Vec<String>,
    tty: bool,
) -> Result<AttachedExec, CoreError> {
    let exec = docker
        .create_exec(
            container_id_or_name,
            CreateExecOptions {
                cmd: Some(cmd),
                attach_stdout: Some(true),
                attach_stderr: Some(true),
                attach_stdin: Some(true),
                tty: Some(tty),
                ..Default::default()
            },
        )
        .await
        .map_err(DockerRuntime::map_docker_err)?;

    let result = docker
        .start_exec(&exec.id, None)
        .await
        .map_err(DockerRuntime::map_docker_err)?;

    let StartExecResults::Attached { output, input } = result else {
        return Err(CoreError::RuntimeError(
            "container engine returned a detached exec for an attach request".to_string(),
        ));
    };

    let stream = output.map(|item| {
        item.map(|chunk| match chunk {
            LogOutput::StdOut { message } => ExecChunk::Stdout(message.to_vec()),
            LogOutput::StdErr { message } => ExecChunk::Stderr(message.to_vec()),
            LogOutput::Console { message } => ExecChunk::Stdout(message.to_vec()),
            LogOutput::StdIn { message } => ExecChunk::Stdout(message.to_vec()),
        })
        .map_err(DockerRuntime::map_docker_err)
    });

    Ok(AttachedExec {
        exec_id: exec.id,
        output: Box::pin(stream),
        input: Box::pin(input),
    })
}
