//! Locker routes: `/v1/kiosks/{kiosk_id}/lockers/*`
//!
//! RFID-driven assign/confirm/release are the unauthenticated kiosk-facing
//! surface (gated by the per-card rate limit dimension); force-transition,
//! block, and unblock require a staff identity.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use serde::{Deserialize, Serialize};

use fleetlock_core::locker::ReleaseMethod;
use fleetlock_storage::types::{LockerRecord, LockerStatus, NewEventRecord, OwnerType};

use crate::error::AppError;
use crate::middleware::StaffContext;
use crate::state::AppState;

/// Build the kiosk-facing subset of the `/v1/kiosks/{kiosk_id}/lockers` router
/// (no staff identity required).
pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(list_lockers))
        .route("/{locker_id}", get(get_locker))
        .route("/{locker_id}/assign", post(assign))
        .route("/{locker_id}/qr-assign", post(qr_assign))
        .route("/{locker_id}/confirm", post(confirm))
        .route("/{locker_id}/release", post(release))
}

/// Build the staff-only subset of the same router. The caller is responsible
/// for layering `middleware::require_staff` onto this before merging it with
/// [`router`].
pub fn staff_router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/{locker_id}/force-transition", post(force_transition))
        .route("/{locker_id}/block", post(block))
        .route("/{locker_id}/unblock", post(unblock))
}

#[derive(Debug, Serialize)]
pub struct LockerResponse {
    pub kiosk_id: String,
    pub locker_id: i32,
    pub status: LockerStatus,
    pub owner_type: Option<fleetlock_storage::types::OwnerType>,
    pub owner_key: Option<String>,
    pub is_vip: bool,
    pub display_name: Option<String>,
    pub version: i64,
}

impl From<LockerRecord> for LockerResponse {
    fn from(r: LockerRecord) -> Self {
        Self {
            kiosk_id: r.kiosk_id,
            locker_id: r.locker_id,
            status: r.status,
            owner_type: r.owner_type,
            owner_key: r.owner_key,
            is_vip: r.is_vip,
            display_name: r.display_name,
            version: r.version,
        }
    }
}

async fn list_lockers(
    State(state): State<Arc<AppState>>,
    Path(kiosk_id): Path<String>,
) -> Result<Json<Vec<LockerResponse>>, AppError> {
    let lockers = state.locker.list_by_kiosk(&kiosk_id).await?;
    Ok(Json(lockers.into_iter().map(LockerResponse::from).collect()))
}

async fn get_locker(
    State(state): State<Arc<AppState>>,
    Path((kiosk_id, locker_id)): Path<(String, i32)>,
) -> Result<Json<LockerResponse>, AppError> {
    let locker = state.locker.get(&kiosk_id, locker_id).await?;
    Ok(Json(locker.into()))
}

#[derive(Debug, Deserialize)]
pub struct AssignRequest {
    pub rfid_card: String,
}

async fn assign(
    State(state): State<Arc<AppState>>,
    Path((kiosk_id, locker_id)): Path<(String, i32)>,
    Json(body): Json<AssignRequest>,
) -> Result<Json<LockerResponse>, AppError> {
    if let Err(err) = state.rate_limiter.check(fleetlock_core::ratelimit::Dimension::RfidCard, &body.rfid_card) {
        if matches!(err, fleetlock_core::error::RateLimitError::Blocked { .. }) {
            state
                .events
                .record(NewEventRecord {
                    timestamp: chrono::Utc::now(),
                    kiosk_id: Some(kiosk_id.clone()),
                    locker_id: Some(locker_id),
                    event_type: "rate_limit_blocked".to_owned(),
                    rfid_card: Some(body.rfid_card.clone()),
                    device_id: None,
                    staff_user: None,
                    ip_address: None,
                    user_agent: None,
                    device_hash: None,
                    details: serde_json::to_value(fleetlock_core::events::EventPayload::RateLimitBlocked {
                        dimension: fleetlock_core::ratelimit::Dimension::RfidCard.as_str().to_owned(),
                    })
                    .unwrap_or_default(),
                })
                .await;
        }
        return Err(err.into());
    }

    let locker = state.locker.assign(&kiosk_id, locker_id, OwnerType::Rfid, &body.rfid_card).await?;
    Ok(Json(locker.into()))
}

#[derive(Debug, Deserialize)]
pub struct QrAssignRequest {
    pub device_id: String,
}

/// QR-code device-fingerprint assign. Gated by the composite `ip` → `locker`
/// → `qr_device` rate-limit chain (spec §4.5), rather than the single
/// `rfid_card` dimension the RFID path uses — the caller's IP is the one
/// signal this in-process check has for a QR scan, since there's no card to
/// key on.
async fn qr_assign(
    State(state): State<Arc<AppState>>,
    Path((kiosk_id, locker_id)): Path<(String, i32)>,
    axum::extract::ConnectInfo(peer): axum::extract::ConnectInfo<std::net::SocketAddr>,
    Json(body): Json<QrAssignRequest>,
) -> Result<Json<LockerResponse>, AppError> {
    let locker_key = format!("{kiosk_id}:{locker_id}");
    if let Err(err) = state.rate_limiter.check_qr_gate(&peer.ip().to_string(), &locker_key, &body.device_id) {
        if matches!(err, fleetlock_core::error::RateLimitError::Blocked { .. }) {
            state
                .events
                .record(NewEventRecord {
                    timestamp: chrono::Utc::now(),
                    kiosk_id: Some(kiosk_id.clone()),
                    locker_id: Some(locker_id),
                    event_type: "rate_limit_blocked".to_owned(),
                    rfid_card: None,
                    device_id: Some(body.device_id.clone()),
                    staff_user: None,
                    ip_address: Some(peer.ip().to_string()),
                    user_agent: None,
                    device_hash: None,
                    details: serde_json::to_value(fleetlock_core::events::EventPayload::RateLimitBlocked {
                        dimension: fleetlock_core::ratelimit::Dimension::QrDevice.as_str().to_owned(),
                    })
                    .unwrap_or_default(),
                })
                .await;
        }
        return Err(err.into());
    }

    let locker = state.locker.assign(&kiosk_id, locker_id, OwnerType::QrDevice, &body.device_id).await?;
    Ok(Json(locker.into()))
}

async fn confirm(
    State(state): State<Arc<AppState>>,
    Path((kiosk_id, locker_id)): Path<(String, i32)>,
) -> Result<Json<LockerResponse>, AppError> {
    let locker = state.locker.confirm(&kiosk_id, locker_id).await?;
    Ok(Json(locker.into()))
}

#[derive(Debug, Deserialize)]
pub struct ReleaseRequest {
    pub release_method: ReleaseMethod,
}

async fn release(
    State(state): State<Arc<AppState>>,
    Path((kiosk_id, locker_id)): Path<(String, i32)>,
    Json(body): Json<ReleaseRequest>,
) -> Result<Json<LockerResponse>, AppError> {
    let locker = state.locker.release(&kiosk_id, locker_id, body.release_method).await?;
    Ok(Json(locker.into()))
}

#[derive(Debug, Deserialize)]
pub struct ForceTransitionRequest {
    pub target: LockerStatus,
    pub reason: String,
}

async fn force_transition(
    State(state): State<Arc<AppState>>,
    Extension(staff): Extension<StaffContext>,
    Path((kiosk_id, locker_id)): Path<(String, i32)>,
    Json(body): Json<ForceTransitionRequest>,
) -> Result<Json<LockerResponse>, AppError> {
    let locker = state
        .locker
        .force_transition(&kiosk_id, locker_id, body.target, &staff.staff_user, &body.reason)
        .await?;
    Ok(Json(locker.into()))
}

async fn block(
    State(state): State<Arc<AppState>>,
    Extension(_staff): Extension<StaffContext>,
    Path((kiosk_id, locker_id)): Path<(String, i32)>,
) -> Result<Json<LockerResponse>, AppError> {
    let locker = state.locker.block(&kiosk_id, locker_id).await?;
    Ok(Json(locker.into()))
}

async fn unblock(
    State(state): State<Arc<AppState>>,
    Extension(_staff): Extension<StaffContext>,
    Path((kiosk_id, locker_id)): Path<(String, i32)>,
) -> Result<Json<LockerResponse>, AppError> {
    let locker = state.locker.unblock(&kiosk_id, locker_id).await?;
    Ok(Json(locker.into()))
}

