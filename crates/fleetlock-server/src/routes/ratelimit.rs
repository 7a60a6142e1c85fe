//! Rate limit inspection route: `/v1/rate-limit/check`
//!
//! `check_rate_limit` is mostly invoked internally as part of the other
//! handlers' preconditions, but is exposed directly for collaborator tools
//! (the staff CLI, monitoring scripts) that want to probe a dimension/key
//! pair without driving the side effect it gates.

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use serde::{Deserialize, Serialize};

use fleetlock_storage::types::NewEventRecord;

use fleetlock_core::ratelimit::Dimension;

use crate::middleware::StaffContext;
use crate::state::AppState;

/// Build the read-only subset of the `/v1/rate-limit` router.
pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/check", get(check_rate_limit))
}

/// Build the staff-only subset (administrative reset) of the same router.
/// The caller is responsible for layering `middleware::require_staff` onto
/// this before merging it with [`router`].
pub fn staff_router() -> Router<Arc<AppState>> {
    Router::new().route("/reset", post(reset_rate_limit))
}

#[derive(Debug, Deserialize)]
pub struct CheckQuery {
    pub dimension: Dimension,
    pub key: String,
}

#[derive(Debug, Serialize)]
pub struct CheckResponse {
    pub allowed: bool,
    pub retry_after_secs: Option<u64>,
}

async fn check_rate_limit(
    State(state): State<Arc<AppState>>,
    Query(query): Query<CheckQuery>,
) -> Json<CheckResponse> {
    match state.rate_limiter.check(query.dimension, &query.key) {
        Ok(()) => Json(CheckResponse { allowed: true, retry_after_secs: None }),
        Err(fleetlock_core::error::RateLimitError::Exceeded { retry_after_ms, .. }) => {
            Json(CheckResponse { allowed: false, retry_after_secs: Some(retry_after_ms.div_ceil(1000)) })
        }
        Err(fleetlock_core::error::RateLimitError::Blocked { blocked_until, .. }) => Json(CheckResponse {
            allowed: false,
            retry_after_secs: Some((blocked_until - chrono::Utc::now()).num_seconds().max(0) as u64),
        }),
    }
}

#[derive(Debug, Deserialize)]
pub struct ResetRequest {
    pub dimension: Dimension,
    pub key: String,
}

async fn reset_rate_limit(
    State(state): State<Arc<AppState>>,
    Extension(staff): Extension<StaffContext>,
    Json(body): Json<ResetRequest>,
) {
    state.rate_limiter.reset(body.dimension, &body.key);

    state
        .events
        .record(NewEventRecord {
            timestamp: chrono::Utc::now(),
            kiosk_id: None,
            locker_id: None,
            event_type: "admin_reset".to_owned(),
            rfid_card: None,
            device_id: None,
            staff_user: Some(staff.staff_user),
            ip_address: None,
            user_agent: None,
            device_hash: None,
            details: serde_json::to_value(fleetlock_core::events::EventPayload::AdminReset {
                scope: format!("rate_limit:{}:{}", body.dimension.as_str(), body.key),
            })
            .unwrap_or_default(),
        })
        .await;
}
