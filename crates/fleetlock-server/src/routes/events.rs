//! Event log routes: `/v1/events`
//!
//! A staff-only audit query API over the append-only event log. Every
//! filter field is optional; an empty filter returns the most recent
//! `limit` events across the whole fleet.

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::routing::get;
use axum::{Extension, Json, Router};
use serde::Deserialize;

use fleetlock_storage::types::EventRecord;
use fleetlock_storage::EventFilter;

use crate::error::AppError;
use crate::middleware::StaffContext;
use crate::state::AppState;

/// Build the `/v1/events` router.
pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/", get(query_events))
}

#[derive(Debug, Deserialize)]
pub struct EventQuery {
    pub kiosk_id: Option<String>,
    pub locker_id: Option<i32>,
    pub event_type: Option<String>,
    pub since: Option<chrono::DateTime<chrono::Utc>>,
    pub until: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(default = "default_limit")]
    pub limit: u32,
}

fn default_limit() -> u32 {
    100
}

async fn query_events(
    State(state): State<Arc<AppState>>,
    Extension(_staff): Extension<StaffContext>,
    Query(query): Query<EventQuery>,
) -> Result<Json<Vec<EventRecord>>, AppError> {
    let events = state
        .events
        .query(EventFilter {
            kiosk_id: query.kiosk_id,
            locker_id: query.locker_id,
            event_type: query.event_type,
            since: query.since,
            until: query.until,
            limit: query.limit,
        })
        .await?;
    Ok(Json(events))
}
