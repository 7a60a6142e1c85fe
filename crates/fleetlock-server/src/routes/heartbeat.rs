//! Heartbeat routes: `/v1/kiosks/{kiosk_id}/heartbeat`
//!
//! Kiosk-facing — a kiosk posts its liveness on a fixed interval
//! (`heartbeat_interval_ms`). No staff identity required; gated by the
//! global per-IP rate limit like the rest of the kiosk-facing surface.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;

use fleetlock_storage::types::{HeartbeatRecord, KioskStatus};

use crate::error::AppError;
use crate::state::AppState;

/// Build the `/v1/kiosks/{kiosk_id}/heartbeat` router.
pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/", post(post_heartbeat).get(get_heartbeat))
}

#[derive(Debug, Deserialize)]
pub struct HeartbeatRequest {
    pub zone: String,
    pub version: i64,
    #[serde(default = "default_status")]
    pub status: KioskStatus,
    pub hardware_id: Option<String>,
    pub config_hash: Option<String>,
}

fn default_status() -> KioskStatus {
    KioskStatus::Online
}

async fn post_heartbeat(
    State(state): State<Arc<AppState>>,
    Path(kiosk_id): Path<String>,
    Json(body): Json<HeartbeatRequest>,
) -> Result<(), AppError> {
    state
        .heartbeat
        .heartbeat(HeartbeatRecord {
            kiosk_id,
            zone: body.zone,
            version: body.version,
            status: body.status,
            last_seen: chrono::Utc::now(),
            hardware_id: body.hardware_id,
            config_hash: body.config_hash,
        })
        .await?;
    Ok(())
}

async fn get_heartbeat(
    State(state): State<Arc<AppState>>,
    Path(kiosk_id): Path<String>,
) -> Result<Json<Option<HeartbeatRecord>>, AppError> {
    let row = state.heartbeat.get(&kiosk_id).await?;
    Ok(Json(row))
}

/// `GET /v1/kiosks?status=offline` — list kiosks by liveness status.
pub fn list_router() -> Router<Arc<AppState>> {
    Router::new().route("/", get(list_by_status))
}

#[derive(Debug, Deserialize)]
pub struct StatusQuery {
    pub status: KioskStatus,
}

async fn list_by_status(
    State(state): State<Arc<AppState>>,
    axum::extract::Query(query): axum::extract::Query<StatusQuery>,
) -> Result<Json<Vec<HeartbeatRecord>>, AppError> {
    let rows = state.heartbeat.list_by_status(query.status).await?;
    Ok(Json(rows))
}
