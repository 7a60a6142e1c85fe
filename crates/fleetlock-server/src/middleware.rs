//! Staff-identity middleware for `FleetLock`.
//!
//! Extracts the `X-Staff-User` header and injects it into request
//! extensions for handlers that require a staff identity (force-transition,
//! block/unblock, admin reset, zone extension). This is intentionally
//! minimal — there is no session store, no token issuance, no expiry. A
//! caller asserts who it is and the server trusts the header, the same way
//! an internal operator tool trusts a reverse proxy to have already
//! authenticated the caller. Full auth/session management is out of scope.

use axum::extract::{ConnectInfo, Request, State};
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use std::net::SocketAddr;
use std::sync::Arc;

use fleetlock_core::ratelimit::Dimension;

use crate::error::AppError;
use crate::state::AppState;

/// Staff identity asserted for this request.
#[derive(Debug, Clone)]
pub struct StaffContext {
    pub staff_user: String,
}

/// Require an `X-Staff-User` header on staff-only routes.
///
/// Rejects with `401` when the header is missing or empty.
pub async fn require_staff(
    State(_state): State<Arc<AppState>>,
    mut req: Request,
    next: Next,
) -> Response {
    let staff_user = req
        .headers()
        .get("X-Staff-User")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_owned);

    let Some(staff_user) = staff_user else {
        return (
            StatusCode::UNAUTHORIZED,
            axum::Json(serde_json::json!({
                "error": "unauthorized",
                "message": "missing X-Staff-User header",
            })),
        )
            .into_response();
    };

    req.extensions_mut().insert(StaffContext { staff_user });
    next.run(req).await
}

/// Gate every request through the `ip` rate-limit dimension (spec §2: "the
/// rate limiter gates every external call"). A `X-Forwarded-For` header
/// (first hop) takes precedence over the socket's peer address, since this
/// server is typically fronted by a reverse proxy terminating TLS.
pub async fn rate_limit_ip(
    State(state): State<Arc<AppState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    req: Request,
    next: Next,
) -> Response {
    let ip = req
        .headers()
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map_or_else(|| peer.ip().to_string(), str::to_owned);

    if let Err(err) = state.rate_limiter.check(Dimension::IpAddress, &ip) {
        return AppError::from(err).into_response();
    }

    next.run(req).await
}
