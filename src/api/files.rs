//! REST handlers under `/files` (spec §6): the shared system/cvd image
//! upload area, independent of any single device.

use crate::domain::{ImageKind, UploadedFile};
use crate::error::{AppError, AppResult, CoreError};
use crate::utils::state::AppState;
use crate::utils::validation::{is_valid_cvd_image_filename, is_valid_system_image_filename};
use axum::Json;
use axum::extract::{Multipart, State};
use axum::http::StatusCode;
use futures::TryStreamExt;
use std::sync::Arc;

/// The upload route (spec §6 `POST /api/v1/files/upload`) takes no kind
/// parameter; the kind is inferred from the uploaded file's own extension.
fn infer_kind(file_name: &str) -> AppResult<ImageKind> {
    if is_valid_system_image_filename(file_name) {
        Ok(ImageKind::System)
    } else if is_valid_cvd_image_filename(file_name) {
        Ok(ImageKind::Cvd)
    } else {
        Err(CoreError::InvalidInput(format!("unrecognized image filename: {file_name}")).into())
    }
}

pub async fn list_system_images(
    State(state): State<Arc<AppState>>,
) -> AppResult<Json<Vec<UploadedFile>>> {
    let files = state
        .storage
        .list_images(ImageKind::System)
        .await
        .map_err(AppError::from)?;
    Ok(Json(files))
}

pub async fn list_cvd_images(
    State(state): State<Arc<AppState>>,
) -> AppResult<Json<Vec<UploadedFile>>> {
    let files = state
        .storage
        .list_images(ImageKind::Cvd)
        .await
        .map_err(AppError::from)?;
    Ok(Json(files))
}

pub async fn upload_file(
    State(state): State<Arc<AppState>>,
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
        let kind = infer_kind(&file_name)?;

        let stream = field.into_stream().map_err(std::io::Error::other);
        state
            .storage
            .save_image_stream(kind, &file_name, stream)
            .await
            .map_err(AppError::from)?;
        return Ok(StatusCode::CREATED);
    }
    Err(CoreError::InvalidInput("multipart body had no file field".to_string()).into())
}
