//! Control API router (spec §4.5). Grounded on `distribution/src/api/mod.rs`'s
//! `create_router` composed from small per-area nested routers, minus the
//! auth middleware layers this control plane explicitly does not need.

pub mod files;
pub mod vms;
pub mod ws;

use crate::utils::state::AppState;
use axum::Router;
use axum::routing::{delete, get, post};
use std::sync::Arc;

pub fn create_router(state: Arc<AppState>) -> Router<()> {
    Router::new()
        .nest("/api/v1", api_v1_router())
        .with_state(state)
}

fn api_v1_router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/ws", get(ws::control_ws))
        .nest("/vms", vms_router())
        .nest("/files", files_router())
}

fn vms_router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/{name}/start", post(vms::start_vm))
        .route("/{name}/stop", post(vms::stop_vm))
        .route("/{name}", delete(vms::remove_vm))
        .route("/{name}/ws", get(ws::terminal_ws))
        .route("/{name}/log/{source}", get(ws::log_ws))
        .route("/{name}/upload", post(vms::upload_apk))
        .route("/{name}/apks", get(vms::list_apks))
}

fn files_router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/system", get(files::list_system_images))
        .route("/cvd", get(files::list_cvd_images))
        .route("/upload", post(files::upload_file))
}
