//! Error types for `fleetlock-core`.
//!
//! Each error variant carries enough context to diagnose the problem without
//! a debugger. Every top-level error implements [`FleetError::category`],
//! mapping it onto one of five response categories a caller (typically the
//! HTTP layer) uses to decide status code and retry behavior.

use fleetlock_storage::StorageError;

/// The five-way error taxonomy every component error maps onto.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// A concurrent writer won — the caller's view was stale. Safe to retry
    /// after re-reading current state.
    Conflict,
    /// The request itself is malformed or violates a precondition. Retrying
    /// unchanged will never succeed.
    Validation,
    /// A rate limit or capacity bound was hit. Retry after a cooldown.
    Throttled,
    /// An infrastructure hiccup (storage, network). Safe to retry as-is.
    Transient,
    /// An unexpected internal failure. Not meaningfully retryable by the caller.
    Fatal,
}

/// Something every domain error in this crate can answer.
pub trait FleetError {
    /// Which of the five response categories this error falls into.
    fn category(&self) -> ErrorCategory;
}

/// Errors from the locker state machine.
#[derive(Debug, thiserror::Error)]
pub enum LockerError {
    /// No locker row for this `(kiosk_id, locker_id)`.
    #[error("locker not found: {kiosk_id}/{locker_id}")]
    NotFound { kiosk_id: String, locker_id: i32 },

    /// The requested transition is not legal from the locker's current state.
    #[error("illegal transition for {kiosk_id}/{locker_id}: {from:?} -> {attempted}")]
    IllegalTransition {
        kiosk_id: String,
        locker_id: i32,
        from: fleetlock_storage::types::LockerStatus,
        attempted: &'static str,
    },

    /// A concurrent writer updated the row between read and write.
    #[error("version conflict on {kiosk_id}/{locker_id}")]
    VersionConflict { kiosk_id: String, locker_id: i32 },

    /// The same owner already holds a different locker at this kiosk.
    #[error("owner {owner_key} already holds locker {existing_locker_id} at {kiosk_id}")]
    OwnerAlreadyHolding {
        kiosk_id: String,
        owner_key: String,
        existing_locker_id: i32,
    },

    /// VIP lockers are assigned through the out-of-core VIP contract module,
    /// never through the normal reservation flow, regardless of status.
    #[error("locker {kiosk_id}/{locker_id} is VIP and cannot be assigned through the normal flow")]
    VipLocker { kiosk_id: String, locker_id: i32 },

    /// The storage backend returned an error.
    #[error("locker storage error: {0}")]
    Storage(#[from] StorageError),
}

impl FleetError for LockerError {
    fn category(&self) -> ErrorCategory {
        match self {
            LockerError::NotFound { .. } => ErrorCategory::Validation,
            LockerError::IllegalTransition { .. } => ErrorCategory::Validation,
            LockerError::VersionConflict { .. } => ErrorCategory::Conflict,
            LockerError::OwnerAlreadyHolding { .. } => ErrorCategory::Conflict,
            LockerError::VipLocker { .. } => ErrorCategory::Validation,
            LockerError::Storage(_) => ErrorCategory::Transient,
        }
    }
}

/// Errors from the command queue.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    /// The command was not found.
    #[error("command not found: {command_id}")]
    NotFound { command_id: uuid::Uuid },

    /// The command has already reached a terminal state.
    #[error("command {command_id} is already terminal")]
    AlreadyTerminal { command_id: uuid::Uuid },

    /// Retry budget exhausted.
    #[error("command {command_id} exceeded max retries ({max_retries})")]
    RetriesExhausted { command_id: uuid::Uuid, max_retries: i32 },

    /// The storage backend returned an error.
    #[error("queue storage error: {0}")]
    Storage(#[from] StorageError),
}

impl FleetError for QueueError {
    fn category(&self) -> ErrorCategory {
        match self {
            QueueError::NotFound { .. } => ErrorCategory::Validation,
            QueueError::AlreadyTerminal { .. } => ErrorCategory::Validation,
            QueueError::RetriesExhausted { .. } => ErrorCategory::Fatal,
            QueueError::Storage(_) => ErrorCategory::Transient,
        }
    }
}

/// Errors from the heartbeat manager.
#[derive(Debug, thiserror::Error)]
pub enum HeartbeatError {
    /// The kiosk has never sent a heartbeat.
    #[error("unknown kiosk: {kiosk_id}")]
    UnknownKiosk { kiosk_id: String },

    /// The storage backend returned an error.
    #[error("heartbeat storage error: {0}")]
    Storage(#[from] StorageError),
}

impl FleetError for HeartbeatError {
    fn category(&self) -> ErrorCategory {
        match self {
            HeartbeatError::UnknownKiosk { .. } => ErrorCategory::Validation,
            HeartbeatError::Storage(_) => ErrorCategory::Transient,
        }
    }
}

/// Errors from the zone extension engine.
#[derive(Debug, thiserror::Error)]
pub enum ZoneError {
    /// The physical relay-card inventory cannot satisfy the configured
    /// logical locker range.
    #[error("zone '{zone}' needs {needed} relay channels but only {available} are wired")]
    InsufficientHardware { zone: String, needed: u32, available: u32 },

    /// Two enabled zones claim overlapping locker-id ranges.
    #[error("zones '{a}' and '{b}' overlap on locker range")]
    OverlappingRanges { a: String, b: String },

    /// A locker id referenced by a command falls outside every enabled zone.
    #[error("locker {locker_id} maps to no configured zone")]
    UnmappedLocker { locker_id: i32 },

    /// A zone references a relay card slave address not present in hardware.
    #[error("zone '{zone}' references relay card {slave_address} which is not wired")]
    UnknownRelayCard { zone: String, slave_address: u32 },

    /// A zone id is empty, duplicated, or uses characters outside `[A-Za-z0-9_-]`.
    #[error("zone id '{zone}' is invalid: {reason}")]
    InvalidZoneId { zone: String, reason: &'static str },
}

impl FleetError for ZoneError {
    fn category(&self) -> ErrorCategory {
        match self {
            ZoneError::InsufficientHardware { .. }
            | ZoneError::OverlappingRanges { .. }
            | ZoneError::UnmappedLocker { .. }
            | ZoneError::UnknownRelayCard { .. }
            | ZoneError::InvalidZoneId { .. } => ErrorCategory::Validation,
        }
    }
}

/// Errors from the rate limiter.
#[derive(Debug, thiserror::Error)]
pub enum RateLimitError {
    /// The caller exceeded the bucket's capacity for this dimension.
    #[error("rate limit exceeded for {dimension} '{key}', retry after {retry_after_ms}ms")]
    Exceeded {
        dimension: &'static str,
        key: String,
        retry_after_ms: u64,
    },

    /// The key is temporarily blocked from repeated violations.
    #[error("{dimension} '{key}' is blocked until {blocked_until}")]
    Blocked {
        dimension: &'static str,
        key: String,
        blocked_until: chrono::DateTime<chrono::Utc>,
    },
}

impl FleetError for RateLimitError {
    fn category(&self) -> ErrorCategory {
        ErrorCategory::Throttled
    }
}

/// Errors from the event log.
#[derive(Debug, thiserror::Error)]
pub enum EventError {
    /// An event of this type requires fields that were not supplied.
    #[error("event '{event_type}' missing required field: {field}")]
    MissingField { event_type: &'static str, field: &'static str },

    /// `details` did not deserialize into any known [`crate::events::EventPayload`]
    /// variant for the declared `event_type`.
    #[error("event '{event_type}' has invalid details: {reason}")]
    Validation { event_type: String, reason: String },

    /// The storage backend returned an error.
    #[error("event storage error: {0}")]
    Storage(#[from] StorageError),
}

impl FleetError for EventError {
    fn category(&self) -> ErrorCategory {
        match self {
            EventError::MissingField { .. } | EventError::Validation { .. } => ErrorCategory::Validation,
            EventError::Storage(_) => ErrorCategory::Transient,
        }
    }
}
