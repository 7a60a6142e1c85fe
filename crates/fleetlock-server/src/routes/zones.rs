//! Zone routes: `/v1/zones/*`
//!
//! Read-only hardware mapping resolution is open to any caller (the kiosk
//! firmware itself resolves a locker id to a relay channel this way); the
//! extend/rebalance operations that mutate the shared zone inventory
//! require a staff identity.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use serde::{Deserialize, Serialize};

use fleetlock_core::zones::{self, RelayCard, ZoneConfig};
use fleetlock_storage::types::NewEventRecord;

use crate::error::AppError;
use crate::middleware::StaffContext;
use crate::state::AppState;

/// Build the read-only subset of the `/v1/zones` router.
pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(get_zones))
        .route("/map/{locker_id}", get(map_locker))
}

/// Build the staff-only subset (hardware reconciliation) of the same
/// router. The caller is responsible for layering `middleware::require_staff`
/// onto this before merging it with [`router`].
pub fn staff_router() -> Router<Arc<AppState>> {
    Router::new().route("/extend", post(extend_zone))
}

#[derive(Debug, Serialize)]
pub struct ZonesResponse {
    pub zones: ZoneConfig,
    pub warnings: Vec<String>,
}

async fn get_zones(State(state): State<Arc<AppState>>) -> Result<Json<ZonesResponse>, AppError> {
    let zones = state.zones.read().await.clone();
    let hardware = state.hardware.read().await.clone();
    let warnings = zones::validate(&zones, &hardware)?;
    Ok(Json(ZonesResponse { zones, warnings }))
}

#[derive(Debug, Serialize)]
pub struct MapResponse {
    pub slave_address: u32,
    pub coil: u32,
    pub zone_id: Option<String>,
}

async fn map_locker(
    State(state): State<Arc<AppState>>,
    Path(locker_id): Path<i32>,
) -> Result<Json<MapResponse>, AppError> {
    if !state.zones_enabled {
        let (slave_address, coil) = zones::map_locker_legacy(locker_id);
        return Ok(Json(MapResponse { slave_address, coil, zone_id: None }));
    }

    let config = state.zones.read().await;
    let (slave_address, coil, zone_id) = zones::map_locker(&config, locker_id)?;
    Ok(Json(MapResponse { slave_address, coil, zone_id: Some(zone_id) }))
}

#[derive(Debug, Deserialize)]
pub struct ExtendRequest {
    /// Newly observed relay cards to add to the hardware inventory before
    /// reconciling (an empty list just re-runs reconciliation against the
    /// cards already on record).
    #[serde(default)]
    pub new_cards: Vec<RelayCard>,
}

/// Report newly-wired relay cards and reconcile the zone inventory against
/// the updated hardware (spec §4.4's rebalance-then-extend algorithm).
async fn extend_zone(
    State(state): State<Arc<AppState>>,
    Extension(staff): Extension<StaffContext>,
    Json(body): Json<ExtendRequest>,
) -> Result<Json<ZonesResponse>, AppError> {
    let mut hardware_guard = state.hardware.write().await;
    hardware_guard.extend(body.new_cards);
    let hardware = hardware_guard.clone();
    drop(hardware_guard);

    let mut zones_guard = state.zones.write().await;
    let (updated, diff) = zones::reconcile(zones_guard.clone(), &hardware);
    let warnings = zones::validate(&updated, &hardware)?;
    *zones_guard = updated.clone();
    drop(zones_guard);

    if let Some(diff) = diff {
        state
            .events
            .record(NewEventRecord {
                timestamp: chrono::Utc::now(),
                kiosk_id: None,
                locker_id: None,
                event_type: "zone_extended".to_owned(),
                rfid_card: None,
                device_id: None,
                staff_user: Some(staff.staff_user),
                ip_address: None,
                user_agent: None,
                device_hash: None,
                details: serde_json::to_value(fleetlock_core::events::EventPayload::ZoneExtended {
                    zone: diff.zone_id,
                    lockers_added: diff.new_range.len(),
                })
                .unwrap_or_default(),
            })
            .await;
    }

    Ok(Json(ZonesResponse { zones: updated, warnings }))
}
