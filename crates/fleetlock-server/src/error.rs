//! HTTP error types for the `FleetLock` server.
//!
//! Maps every domain error out of `fleetlock-core` onto the five-category
//! taxonomy from spec §7 (`Conflict | Validation | Throttled | Transient |
//! Fatal`) and from there onto an HTTP status and the user-visible message
//! §7 specifies for each category. Handlers never match on a concrete
//! domain error type themselves — they propagate with `?` and let the
//! blanket `From` impls below do the mapping.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

use fleetlock_core::error::{
    ErrorCategory, EventError, FleetError, HeartbeatError, LockerError, QueueError, RateLimitError,
    ZoneError,
};

/// Application-level error returned from HTTP handlers.
#[derive(Debug)]
pub enum AppError {
    /// A concurrent writer won — optimistic version mismatch or a lost
    /// claim race. Spec §7: "locker unavailable, try again."
    Conflict(String),
    /// The request is malformed or violates a precondition. Spec §7:
    /// "invalid input."
    Validation(String),
    /// A rate limit or block is in effect. Spec §7: "too many requests."
    Throttled { message: String, retry_after_secs: u64 },
    /// A storage/infrastructure hiccup. Spec §7: "temporary system error."
    Transient(String),
    /// An unrecoverable invariant violation.
    Fatal(String),
}

/// JSON error response body.
#[derive(Serialize)]
struct ErrorBody {
    error: &'static str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    retry_after_secs: Option<u64>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        // Conflict/Transient/Fatal carry a fixed, safe-to-show message per
        // spec §7; the diagnostic detail is logged here rather than leaked
        // to the caller. Validation and Throttled surface their own detail.
        let (status, error_type, message, retry_after_secs) = match self {
            Self::Conflict(detail) => {
                tracing::debug!(detail, "conflict");
                (StatusCode::CONFLICT, "conflict", "locker unavailable, try again".to_owned(), None)
            }
            Self::Validation(message) => (StatusCode::BAD_REQUEST, "validation", message, None),
            Self::Throttled { message, retry_after_secs } => {
                (StatusCode::TOO_MANY_REQUESTS, "throttled", message, Some(retry_after_secs))
            }
            Self::Transient(detail) => {
                tracing::warn!(detail, "transient error");
                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    "transient",
                    "temporary system error".to_owned(),
                    None,
                )
            }
            Self::Fatal(detail) => {
                tracing::error!(detail, "fatal error");
                (StatusCode::INTERNAL_SERVER_ERROR, "fatal", "internal error".to_owned(), None)
            }
        };
        let body = ErrorBody { error: error_type, message, retry_after_secs };
        (status, axum::Json(body)).into_response()
    }
}

fn from_category(category: ErrorCategory, detail: String) -> AppError {
    match category {
        ErrorCategory::Conflict => AppError::Conflict(detail),
        ErrorCategory::Validation => AppError::Validation(detail),
        ErrorCategory::Throttled => AppError::Throttled { message: detail, retry_after_secs: 0 },
        ErrorCategory::Transient => AppError::Transient(detail),
        ErrorCategory::Fatal => AppError::Fatal(detail),
    }
}

impl From<LockerError> for AppError {
    fn from(err: LockerError) -> Self {
        from_category(err.category(), err.to_string())
    }
}

impl From<QueueError> for AppError {
    fn from(err: QueueError) -> Self {
        from_category(err.category(), err.to_string())
    }
}

impl From<HeartbeatError> for AppError {
    fn from(err: HeartbeatError) -> Self {
        from_category(err.category(), err.to_string())
    }
}

impl From<ZoneError> for AppError {
    fn from(err: ZoneError) -> Self {
        from_category(err.category(), err.to_string())
    }
}

impl From<EventError> for AppError {
    fn from(err: EventError) -> Self {
        from_category(err.category(), err.to_string())
    }
}

impl From<RateLimitError> for AppError {
    fn from(err: RateLimitError) -> Self {
        let retry_after_secs = match &err {
            RateLimitError::Exceeded { retry_after_ms, .. } => retry_after_ms.div_ceil(1000),
            RateLimitError::Blocked { blocked_until, .. } => {
                (*blocked_until - chrono::Utc::now()).num_seconds().max(0) as u64
            }
        };
        AppError::Throttled { message: "too many requests".to_owned(), retry_after_secs }
    }
}
