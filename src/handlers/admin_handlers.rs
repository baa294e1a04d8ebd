//! Maintenance endpoints for the garbage collector and the WAL.

use crate::{
    errors::AppError,
    services::{
        gc::{GcStats, GcStatus},
        storage_service::StorageService,
    },
};
use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use serde::Serialize;

#[derive(Debug, Serialize)]
pub struct CheckpointResponse {
    pub ran: bool,
    pub busy: bool,
    pub log_frames: i64,
    pub checkpointed_frames: i64,
    pub wal_size: u64,
}

/// `GET /_admin/gc`
pub async fn gc_status(State(service): State<StorageService>) -> Json<GcStatus> {
    Json(service.gc().status())
}

/// `POST /_admin/gc/run` runs one iteration inline and reports what it
/// removed. Suspension is ignored for manual runs.
pub async fn gc_run(State(service): State<StorageService>) -> Result<Json<GcStats>, AppError> {
    let stats = service.gc().process().await?;
    Ok(Json(stats))
}

/// `POST /_admin/gc/suspend`
pub async fn gc_suspend(State(service): State<StorageService>) -> impl IntoResponse {
    service.gc().suspend();
    StatusCode::NO_CONTENT
}

/// `POST /_admin/gc/resume`
pub async fn gc_resume(State(service): State<StorageService>) -> impl IntoResponse {
    service.gc().resume();
    StatusCode::NO_CONTENT
}

/// `POST /_admin/wal/checkpoint`
pub async fn wal_checkpoint(State(service): State<StorageService>) -> Json<CheckpointResponse> {
    let wal = service.store().wal();
    let result = wal.checkpoint().await;
    Json(CheckpointResponse {
        ran: result.is_some(),
        busy: result.is_some_and(|r| r.busy != 0),
        log_frames: result.map_or(0, |r| r.log),
        checkpointed_frames: result.map_or(0, |r| r.checkpointed),
        wal_size: wal.wal_size().await,
    })
}
