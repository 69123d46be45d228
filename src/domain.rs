//! Core data types shared across KVS, CRA, VMM and the Control API.
//!
//! Grounded on `distribution/src/domain/repo_model.rs` (plain serde structs
//! next to the thing that builds them) but this control plane has no
//! database-backed repository layer, so these are plain value types rather
//! than an ORM-adjacent model.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A derived, never-stored device status (spec §3 "Device Status").
///
/// Serializes as the small integer used on the wire
/// (`0=ContainerReady, 1=Running, 2=ContainerError`) rather than the
/// variant name, to match the `status:1` literal control-socket clients
/// expect (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DeviceStatus {
    ContainerReady = 0,
    Running = 1,
    ContainerError = 2,
}

impl DeviceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceStatus::ContainerReady => "container_ready",
            DeviceStatus::Running => "running",
            DeviceStatus::ContainerError => "container_error",
        }
    }
}

impl std::fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for DeviceStatus {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_u8(*self as u8)
    }
}

impl<'de> Deserialize<'de> for DeviceStatus {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        match u8::deserialize(deserializer)? {
            0 => Ok(DeviceStatus::ContainerReady),
            1 => Ok(DeviceStatus::Running),
            2 => Ok(DeviceStatus::ContainerError),
            other => Err(serde::de::Error::custom(format!(
                "invalid device status: {other}"
            ))),
        }
    }
}

/// One row of `VMList` (spec §4.3.8).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmItem {
    pub id: String,
    pub name: String,
    pub created: chrono::DateTime<chrono::Utc>,
    pub os_version: String,
    pub cpu: u32,
    pub ram: u32,
    pub cmdline: String,
    pub ip: Option<String>,
    pub cf_instance: u32,
    pub status: DeviceStatus,
    pub tags: HashMap<String, String>,
}

/// A file living under the shared upload area (`GET /files/system`, `/files/cvd`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ImageKind {
    System,
    Cvd,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadedFile {
    pub name: String,
    pub size: u64,
    pub kind: ImageKind,
}

/// One uploaded APK for a given device (`GET /vms/:name/apks`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApkEntry {
    pub name: String,
    pub size: u64,
    pub uploaded_at: chrono::DateTime<chrono::Utc>,
}

/// Log source accepted by the log-tailer session (spec §4.4.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogSource {
    Launcher,
    Kernel,
    Logcat,
}

impl LogSource {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "launcher" => Some(LogSource::Launcher),
            "kernel" => Some(LogSource::Kernel),
            "logcat" => Some(LogSource::Logcat),
            _ => None,
        }
    }

    /// File name under `cuttlefish_runtime.<idx>/` for this source.
    pub fn file_name(&self) -> &'static str {
        match self {
            LogSource::Launcher => "launcher.log",
            LogSource::Kernel => "kernel.log",
            LogSource::Logcat => "logcat",
        }
    }
}

/// Persisted per-container configuration (spec §4.1 / §3 "Per-Container Configuration").
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContainerConfig {
    pub cpu: u32,
    pub ram: u32,
    pub os_version: String,
    pub cmdline: String,
    pub cf_instance: u32,
}

/// One step of the provisioning pipeline `VMCreate` drives (spec §4.4.3
/// "progress-reporting provisioning pipeline"), reported to `CREATE_VM`
/// control-socket clients as it happens rather than only on completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProvisionStep {
    AllocatingIndex,
    CreatingContainer,
    StartingContainer,
    InstallingBridge,
    LoadingSystemImage,
    UnzippingSystemImage,
    LoadingCvdImage,
    UnzippingCvdImage,
    LoadingKernel,
    Booting,
    Done,
}

impl ProvisionStep {
    /// Collapses the granular server-side steps onto the six-stage
    /// `VMCreate → PreBootSetup → LoadFile(system) → UnzipImage →
    /// LoadFile(cvd) → Start` pipeline the control socket exposes as
    /// acknowledgement-style `{step: 0..5, has_error, error?}` messages
    /// (spec §4.4.3).
    pub fn wire_step(&self) -> u8 {
        match self {
            ProvisionStep::AllocatingIndex
            | ProvisionStep::CreatingContainer
            | ProvisionStep::StartingContainer => 0,
            ProvisionStep::InstallingBridge => 1,
            ProvisionStep::LoadingSystemImage => 2,
            ProvisionStep::UnzippingSystemImage => 3,
            ProvisionStep::LoadingCvdImage
            | ProvisionStep::UnzippingCvdImage
            | ProvisionStep::LoadingKernel => 4,
            ProvisionStep::Booting | ProvisionStep::Done => 5,
        }
    }
}

/// Request body for `CREATE_VM` (spec §6).
#[derive(Debug, Clone, Deserialize)]
pub struct CreateVmRequest {
    pub name: String,
    #[serde(rename = "type")]
    pub device_type: String,
    pub cpu: u32,
    pub ram: u32,
    pub system_image: String,
    pub cvd_image: String,
    #[serde(default)]
    pub kernel_image: Option<String>,
    #[serde(default)]
    pub cmdline: Option<String>,
}
