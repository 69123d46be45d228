//! Typed error hierarchy for the control plane (spec §7 "Error Handling Design").
//!
//! Grounded on `distribution/src/error.rs`'s `OciError`/`InternalError`/`AppError`
//! split: a domain taxonomy with one variant per named error kind, an
//! `InternalError` that wraps infrastructure failures (I/O, the container
//! engine client, the KVS), and a top-level `AppError` that implements
//! `IntoResponse` and decides 4xx vs 5xx. Deep helpers (CRA, KVS) return
//! `CoreError` directly; VMM Core wraps each with the step name before
//! surfacing it, per spec §7's propagation policy.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use thiserror::Error;

/// The error-kind taxonomy named in spec §7, one variant per kind.
#[derive(Error, Debug)]
pub enum CoreError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("duplicate: {0}")]
    Duplicate(String),

    #[error("no free cuttlefish instance index available")]
    IndexExhausted,

    #[error("container runtime unavailable: {0}")]
    RuntimeUnavailable(String),

    #[error("container runtime error: {0}")]
    RuntimeError(String),

    #[error("copy failed: {0}")]
    CopyFailed(String),

    #[error("exec failed (exit {exit}): {stderr}")]
    ExecFailed { exit: i64, stderr: String },

    #[error("boot stream closed before completion sentinel")]
    BootEof,

    #[error("boot timed out waiting for completion sentinel")]
    BootTimeout,

    #[error("stop_cvd failed: {0}")]
    StopFailed(String),

    #[error("kvs error: {0}")]
    KvsError(String),

    #[error("internal invariant violated: {0}")]
    InternalInvariant(String),

    #[error("failed to install vnc bridge: {0}")]
    BridgeInstallFailed(String),

    #[error("vnc bridge port already in use: {0}")]
    BridgePortInUse(String),

    #[error("preboot setup has not run for this device yet")]
    BridgeMissing,
}

impl CoreError {
    fn status(&self) -> StatusCode {
        match self {
            CoreError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            CoreError::NotFound(_) => StatusCode::NOT_FOUND,
            CoreError::Duplicate(_) => StatusCode::CONFLICT,
            CoreError::IndexExhausted => StatusCode::SERVICE_UNAVAILABLE,
            CoreError::RuntimeUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            CoreError::RuntimeError(_) => StatusCode::INTERNAL_SERVER_ERROR,
            CoreError::CopyFailed(_) => StatusCode::INTERNAL_SERVER_ERROR,
            CoreError::ExecFailed { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            CoreError::BootEof => StatusCode::GATEWAY_TIMEOUT,
            CoreError::BootTimeout => StatusCode::GATEWAY_TIMEOUT,
            CoreError::StopFailed(_) => StatusCode::INTERNAL_SERVER_ERROR,
            CoreError::KvsError(_) => StatusCode::INTERNAL_SERVER_ERROR,
            CoreError::InternalInvariant(_) => StatusCode::INTERNAL_SERVER_ERROR,
            CoreError::BridgeInstallFailed(_) => StatusCode::INTERNAL_SERVER_ERROR,
            CoreError::BridgePortInUse(_) => StatusCode::CONFLICT,
            CoreError::BridgeMissing => StatusCode::PRECONDITION_FAILED,
        }
    }

    /// `"error: <reason>"` text used verbatim by websocket handlers (spec §7).
    pub fn as_ws_text(&self) -> String {
        format!("error: {self}")
    }
}

/// Infrastructure failures that do not fit the named taxonomy: these are
/// always surfaced as 500s and logged at `error`.
#[derive(Error, Debug)]
pub enum InternalError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("container engine client error: {0}")]
    Docker(#[from] bollard::errors::Error),

    #[error("kvs backend error: {0}")]
    Sled(#[from] sled::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

#[derive(Error, Debug)]
pub enum AppError {
    #[error(transparent)]
    Core(#[from] CoreError),

    #[error(transparent)]
    Internal(#[from] InternalError),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            AppError::Core(e) => {
                tracing::debug!("request failed: {e}");
                (e.status(), e.to_string())
            }
            AppError::Internal(e) => {
                tracing::error!("internal error: {e:?}");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "an internal server error occurred".to_string(),
                )
            }
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

pub type CoreResult<T> = Result<T, CoreError>;
pub type AppResult<T> = Result<T, AppError>;
