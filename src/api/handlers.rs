use axum::{
    Json,
    extract::{Path, State},
};
use axum_macros::debug_handler;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::{ApiResponse, AppError, AppState};
use crate::client::StatusResponse;
use crate::types::{AggregateState, FileDescriptor, HistoryEntry};

/// Request to enqueue a batch of files
#[derive(Debug, Deserialize)]
pub struct EnqueueRequest {
    pub files: Vec<FileDescriptor>,
    /// Optional id-to-source-ref map for files whose descriptor does not
    /// carry the ref inline.
    #[serde(default)]
    pub source_refs: HashMap<String, String>,
}

/// Response for enqueue
#[derive(Debug, Serialize)]
pub struct EnqueueResponse {
    pub enqueued: usize,
}

/// Response for clear-completed
#[derive(Debug, Serialize)]
pub struct ClearCompletedResponse {
    pub removed: usize,
}

/// Liveness probe
pub async fn health_check() -> Json<ApiResponse<&'static str>> {
    ApiResponse::ok("ok")
}

/// Enqueue a batch of descriptors
#[debug_handler]
pub async fn enqueue(
    State(state): State<AppState>,
    Json(request): Json<EnqueueRequest>,
) -> Result<Json<ApiResponse<EnqueueResponse>>, AppError> {
    let count = request.files.len();
    tracing::info!(target: "api", count, "Enqueue request");

    // Hosts may omit the item id; it only has to be opaque and stable.
    let mut files = request.files;
    for file in &mut files {
        if file.id.is_empty() {
            file.id = uuid::Uuid::new_v4().to_string();
        }
    }

    let refs = (!request.source_refs.is_empty()).then_some(request.source_refs);
    state.coordinator.enqueue(files, refs).await?;
    Ok(ApiResponse::ok(EnqueueResponse { enqueued: count }))
}

/// Current aggregate upload state
pub async fn get_state(State(state): State<AppState>) -> Json<ApiResponse<AggregateState>> {
    ApiResponse::ok(state.coordinator.aggregate_state().await)
}

/// Completed-upload history, newest first
pub async fn get_history(State(state): State<AppState>) -> Json<ApiResponse<Vec<HistoryEntry>>> {
    ApiResponse::ok(state.coordinator.history().await)
}

pub async fn pause_upload(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ApiResponse<()>>, AppError> {
    tracing::info!(target: "api", id = %id, "Pause request");
    if state.coordinator.pause(&id).await {
        Ok(ApiResponse::ok(()))
    } else {
        Err(AppError::UnknownUpload(id))
    }
}

pub async fn resume_upload(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ApiResponse<()>>, AppError> {
    tracing::info!(target: "api", id = %id, "Resume request");
    if state.coordinator.resume(&id).await {
        Ok(ApiResponse::ok(()))
    } else {
        Err(AppError::UnknownUpload(id))
    }
}

pub async fn cancel_upload(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ApiResponse<()>>, AppError> {
    tracing::info!(target: "api", id = %id, "Cancel request");
    if state.coordinator.cancel(&id).await {
        Ok(ApiResponse::ok(()))
    } else {
        Err(AppError::UnknownUpload(id))
    }
}

pub async fn retry_upload(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ApiResponse<()>>, AppError> {
    tracing::info!(target: "api", id = %id, "Retry request");
    if state.coordinator.retry(&id).await {
        Ok(ApiResponse::ok(()))
    } else {
        Err(AppError::UnknownUpload(id))
    }
}

/// Ask the backend for its view of an in-flight upload
pub async fn remote_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ApiResponse<StatusResponse>>, AppError> {
    match state.coordinator.remote_status(&id).await {
        Some(Ok(status)) => Ok(ApiResponse::ok(status)),
        Some(Err(err)) => Err(err.into()),
        None => Err(AppError::UnknownUpload(id)),
    }
}

/// Remove all completed items
pub async fn clear_completed(
    State(state): State<AppState>,
) -> Json<ApiResponse<ClearCompletedResponse>> {
    let removed = state.coordinator.clear_completed().await;
    ApiResponse::ok(ClearCompletedResponse { removed })
}

/// Host shell came to the foreground
pub async fn foreground(State(state): State<AppState>) -> Json<ApiResponse<()>> {
    state.coordinator.on_foreground().await;
    ApiResponse::ok(())
}

/// Host shell went to the background
pub async fn background(State(state): State<AppState>) -> Json<ApiResponse<()>> {
    state.coordinator.on_background().await;
    ApiResponse::ok(())
}
