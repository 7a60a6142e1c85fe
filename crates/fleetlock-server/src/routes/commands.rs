//! Command queue routes: `/v1/kiosks/{kiosk_id}/commands/*`
//!
//! `enqueue` is a staff-initiated action (remote open, block, config push);
//! `poll` and `ack` are the kiosk-facing surface a kiosk's poller hits every
//! `command_poll_interval_ms`.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use fleetlock_storage::types::{CommandPayload, CommandRecord, CommandStatus};

use crate::error::AppError;
use crate::middleware::StaffContext;
use crate::state::AppState;

/// Build the kiosk-facing subset of the `/v1/kiosks/{kiosk_id}/commands`
/// router (poll/claim/complete/fail — no staff identity required).
pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/poll", get(poll))
        .route("/{command_id}/claim", post(claim))
        .route("/{command_id}/complete", post(complete))
        .route("/{command_id}/fail", post(fail))
}

/// Build the staff-only subset (enqueue/cancel/clear) of the same router.
/// The caller is responsible for layering `middleware::require_staff` onto
/// this before merging it with [`router`].
pub fn staff_router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", post(enqueue))
        .route("/{command_id}/cancel", post(cancel))
        .route("/clear", post(clear_pending))
}

#[derive(Debug, Deserialize)]
pub struct EnqueueRequest {
    pub payload: CommandPayload,
}

#[derive(Debug, Serialize)]
pub struct EnqueueResponse {
    pub command_id: Uuid,
}

async fn enqueue(
    State(state): State<Arc<AppState>>,
    Extension(_staff): Extension<StaffContext>,
    Path(kiosk_id): Path<String>,
    Json(body): Json<EnqueueRequest>,
) -> Result<Json<EnqueueResponse>, AppError> {
    let command_id = state.queue.enqueue(&kiosk_id, body.payload).await?;
    Ok(Json(EnqueueResponse { command_id }))
}

#[derive(Debug, Deserialize)]
pub struct PollQuery {
    #[serde(default = "default_poll_limit")]
    pub limit: u32,
}

fn default_poll_limit() -> u32 {
    10
}

async fn poll(
    State(state): State<Arc<AppState>>,
    Path(kiosk_id): Path<String>,
    Query(query): Query<PollQuery>,
) -> Result<Json<Vec<CommandRecord>>, AppError> {
    let commands = state.queue.fetch_pending(&kiosk_id, query.limit).await?;
    Ok(Json(commands))
}

#[derive(Debug, Serialize)]
pub struct ClaimResponse {
    pub claimed: bool,
}

async fn claim(
    State(state): State<Arc<AppState>>,
    Path((_kiosk_id, command_id)): Path<(String, Uuid)>,
) -> Result<Json<ClaimResponse>, AppError> {
    let claimed = state.queue.claim(command_id).await?;
    Ok(Json(ClaimResponse { claimed }))
}

async fn complete(
    State(state): State<Arc<AppState>>,
    Path((_kiosk_id, command_id)): Path<(String, Uuid)>,
) -> Result<(), AppError> {
    state.queue.mark_completed(command_id).await?;
    Ok(())
}

#[derive(Debug, Deserialize)]
pub struct FailRequest {
    pub error: String,
}

async fn fail(
    State(state): State<Arc<AppState>>,
    Path((_kiosk_id, command_id)): Path<(String, Uuid)>,
    Json(body): Json<FailRequest>,
) -> Result<(), AppError> {
    let command = state.queue.get(command_id).await?;
    if command.status != CommandStatus::Executing {
        return Err(AppError::Validation(format!("command {command_id} not in executing state")));
    }
    state.queue.mark_failed(&command, &body.error).await?;
    Ok(())
}

async fn cancel(
    State(state): State<Arc<AppState>>,
    Extension(_staff): Extension<StaffContext>,
    Path((_kiosk_id, command_id)): Path<(String, Uuid)>,
) -> Result<(), AppError> {
    state.queue.cancel(command_id).await?;
    Ok(())
}

#[derive(Debug, Serialize)]
pub struct ClearResponse {
    pub cleared: u64,
}

async fn clear_pending(
    State(state): State<Arc<AppState>>,
    Extension(_staff): Extension<StaffContext>,
    Path(kiosk_id): Path<String>,
) -> Result<Json<ClearResponse>, AppError> {
    let cleared = state.queue.clear_pending(&kiosk_id).await?;
    Ok(Json(ClearResponse { cleared }))
}
