//! REST handlers under `/vms` (spec §6): start/stop/remove a device and list
//! its uploaded APKs. Grounded on `distribution/src/api/v2.rs`'s handler
//! shape (`State<Arc<AppState>>` + path extractors returning
//! `Result<_, AppError>`).

use crate::domain::ApkEntry;
use crate::error::{AppError, AppResult, CoreError};
use crate::utils::state::AppState;
use crate::utils::validation::is_valid_apk_filename;
use axum::Json;
use axum::extract::{Multipart, Path, State};
use axum::http::StatusCode;
use futures::TryStreamExt;
use std::sync::Arc;

pub async fn start_vm(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> AppResult<StatusCode> {
    state.vmm.start(&name).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn stop_vm(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> AppResult<StatusCode> {
    state.vmm.stop(&name).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn remove_vm(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> AppResult<StatusCode> {
    state.sessions.close_device_sessions(&name).await;
    state.vmm.remove(&name).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn list_apks(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> AppResult<Json<Vec<ApkEntry>>> {
    let apks = state
        .storage
        .list_apks(&name)
        .await
        .map_err(AppError::from)?;
    Ok(Json(apks))
}

/// `INSTALL_APK` over HTTP: a multipart upload streamed straight to disk
/// under the device's APK directory (spec §4.5 "no buffering the whole file
/// in memory").
pub async fn upload_apk(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    mut multipart: Multipart,
) -> AppResult<StatusCode> {
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| CoreError::InvalidInput(e.to_string()))?
    {
        let Some(file_name) = field.file_name().map(str::to_string) else {
            continue;
        };
        if !is_valid_apk_filename(&file_name) {
            return Err(CoreError::InvalidInput(format!("not an apk: {file_name}")).into());
        }
        let stream = field.into_stream().map_err(std::io::Error::other);
        state
            .storage
            .save_apk(&name, &file_name, stream)
            .await
            .map_err(AppError::from)?;
        return Ok(StatusCode::CREATED);
    }
    Err(CoreError::InvalidInput("multipart body had no file field".to_string()).into())
}
