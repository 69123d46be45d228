//! Environment-driven configuration (spec §4.6 "Ambient stack / Configuration").
//!
//! Grounded on `distribution/src/config.rs` (a plain `Config` struct built
//! once at startup) and `utils/cli.rs` (`clap::Parser` for the handful of
//! overrides worth exposing as flags). Everything else is env-var only,
//! with the defaults spec.md's design notes call out.

use crate::utils::cli::Args;

#[derive(Clone, Debug)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub data_dir: String,
    pub cf_index_max: u32,
    pub timeout_vm_start_secs: u64,
    pub bridge_port_base: u16,
    pub vnc_port_base: u16,
    pub adb_port_base: u16,
    pub container_prefix: String,
    pub stop_cvd_sentinel: String,
    pub boot_sentinel: String,
    pub log_tail_flush_bytes: usize,
    pub log_tail_flush_millis: u64,
    pub ws_ping_interval_secs: u64,
    pub ws_pong_timeout_secs: u64,
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl Config {
    /// Builds configuration from environment variables, letting CLI flags
    /// from `Args` override `host`/`port`/`data_dir`.
    pub fn load(args: &Args) -> Self {
        Config {
            host: args.host.clone(),
            port: args.port,
            data_dir: args.data_dir.clone().unwrap_or_else(|| {
                std::env::var("DATA_DIR").unwrap_or_else(|_| "/data".to_string())
            }),
            cf_index_max: env_or("CF_INDEX_MAX", 10),
            timeout_vm_start_secs: env_or("TIMEOUT_VM_START_SECS", 120),
            bridge_port_base: env_or("BRIDGE_PORT_BASE", 6080),
            vnc_port_base: env_or("VNC_PORT_BASE", 6444),
            adb_port_base: env_or("ADB_PORT_BASE", 6520),
            container_prefix: std::env::var("CONTAINER_PREFIX")
                .unwrap_or_else(|_| "matrisea-cvd-".to_string()),
            stop_cvd_sentinel: std::env::var("STOP_CVD_SENTINEL")
                .unwrap_or_else(|_| "Successful".to_string()),
            boot_sentinel: std::env::var("BOOT_SENTINEL")
                .unwrap_or_else(|_| "VIRTUAL_DEVICE_BOOT_COMPLETED".to_string()),
            log_tail_flush_bytes: env_or("LOG_TAIL_FLUSH_BYTES", 131072),
            log_tail_flush_millis: env_or("LOG_TAIL_FLUSH_MILLIS", 2000),
            ws_ping_interval_secs: env_or("WS_PING_INTERVAL_SECS", 9),
            ws_pong_timeout_secs: env_or("WS_PONG_TIMEOUT_SECS", 10),
        }
    }

    pub fn kvs_path(&self) -> std::path::PathBuf {
        std::path::Path::new(&self.data_dir).join("db").join("bolt.db")
    }

    pub fn container_name(&self, device_name: &str) -> String {
        format!("{}{}", self.container_prefix, device_name)
    }
}
