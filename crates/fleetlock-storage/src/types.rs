//! Row types shared by every [`crate`] backend.
//!
//! These mirror spec §3's data model directly — one struct per table, plus
//! the small `Field<T>` patch helper that lets a conditional update leave a
//! column untouched, set it, or clear it without three overloaded methods
//! per store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A locker's lifecycle state. See spec §4.1 for the full transition table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockerStatus {
    Free,
    Reserved,
    Owned,
    Blocked,
    Error,
}

/// Identifies the kind of credential that owns a locker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OwnerType {
    Rfid,
    QrDevice,
}

/// A single row of the `lockers` table, addressed by `(kiosk_id, locker_id)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockerRecord {
    pub kiosk_id: String,
    pub locker_id: i32,
    pub status: LockerStatus,
    pub owner_type: Option<OwnerType>,
    pub owner_key: Option<String>,
    pub reserved_at: Option<DateTime<Utc>>,
    pub owned_at: Option<DateTime<Utc>>,
    pub is_vip: bool,
    pub display_name: Option<String>,
    pub version: i64,
    pub updated_at: DateTime<Utc>,
}

/// A column value in a conditional update: leave it alone, set it, or clear it.
///
/// Using a three-state patch field (rather than `Option<T>` alone) lets a
/// transition distinguish "don't touch `owner_key`" from "set `owner_key` to
/// `None`" without a second bespoke method per transition.
#[derive(Debug, Clone, Default)]
pub enum Field<T> {
    #[default]
    Unchanged,
    Set(T),
    Clear,
}

impl<T: Clone> Field<T> {
    /// Apply this patch field to an existing `Option<T>` column value.
    #[must_use]
    pub fn apply(&self, current: Option<T>) -> Option<T> {
        match self {
            Field::Unchanged => current,
            Field::Set(v) => Some(v.clone()),
            Field::Clear => None,
        }
    }
}

/// Describes the new state a locker row should move to under a conditional
/// update. The caller (the locker state machine) has already validated
/// preconditions; the store only needs to apply the patch atomically.
#[derive(Debug, Clone)]
pub struct LockerPatch {
    pub status: LockerStatus,
    pub owner_type: Field<OwnerType>,
    pub owner_key: Field<String>,
    pub reserved_at: Field<DateTime<Utc>>,
    pub owned_at: Field<DateTime<Utc>>,
}

/// Result of a version-guarded conditional update.
#[derive(Debug, Clone)]
pub enum CasOutcome<T> {
    /// The row matched the expected version and was updated; carries the
    /// post-update row (with its incremented version).
    Updated(T),
    /// No row matched `(key, expected_version)` — a concurrent writer won,
    /// or the expected version was already stale. Never retried internally.
    Conflict,
}

/// A command queued for a kiosk. See spec §4.2.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandStatus {
    Pending,
    Executing,
    Completed,
    Failed,
    Cancelled,
}

/// The structured payload of a queued command. The variant name doubles as
/// the wire-level `command_type` — storage never needs to know the shape,
/// only `fleetlock-core` interprets it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command_type", rename_all = "snake_case")]
pub enum CommandPayload {
    OpenLocker { locker_id: i32 },
    BulkOpen { locker_ids: Vec<i32> },
    Block { locker_id: i32, reason: String },
    Unblock { locker_id: i32 },
    ConfigApply { config_hash: String, data: serde_json::Value },
    ClearQueue,
}

impl CommandPayload {
    /// The `command_type` discriminant, for logging and queries.
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        match self {
            CommandPayload::OpenLocker { .. } => "open_locker",
            CommandPayload::BulkOpen { .. } => "bulk_open",
            CommandPayload::Block { .. } => "block",
            CommandPayload::Unblock { .. } => "unblock",
            CommandPayload::ConfigApply { .. } => "config_apply",
            CommandPayload::ClearQueue => "clear_queue",
        }
    }
}

/// A single row of the `command_queue` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandRecord {
    pub command_id: uuid::Uuid,
    pub kiosk_id: String,
    pub payload: CommandPayload,
    pub status: CommandStatus,
    pub retry_count: i32,
    pub max_retries: i32,
    pub next_attempt_at: DateTime<Utc>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub executed_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// An immutable row of the `events` table. `details` has already passed
/// per-type schema validation and redaction in `fleetlock-core::events`
/// before it reaches the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRecord {
    pub id: i64,
    pub timestamp: DateTime<Utc>,
    pub kiosk_id: Option<String>,
    pub locker_id: Option<i32>,
    pub event_type: String,
    pub rfid_card: Option<String>,
    pub device_id: Option<String>,
    pub staff_user: Option<String>,
    /// Caller IP, already redacted to a deterministic hash by
    /// `fleetlock-core::events` before the row reaches the store.
    pub ip_address: Option<String>,
    /// Caller `User-Agent`, truncated by `fleetlock-core::events` if over
    /// 100 characters.
    pub user_agent: Option<String>,
    pub details: serde_json::Value,
}

/// An event record prior to ID/insert-time assignment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewEventRecord {
    pub timestamp: DateTime<Utc>,
    pub kiosk_id: Option<String>,
    pub locker_id: Option<i32>,
    pub event_type: String,
    pub rfid_card: Option<String>,
    pub device_id: Option<String>,
    pub staff_user: Option<String>,
    /// Raw caller IP, if known. Redacted to a deterministic hash by
    /// `fleetlock-core::events` before storage; never persisted as-is.
    pub ip_address: Option<String>,
    /// Raw caller `User-Agent`, if known. Truncated to 100 characters by
    /// `fleetlock-core::events` before storage.
    pub user_agent: Option<String>,
    /// A pre-hashed device identifier the caller wants recorded in place of
    /// `device_id`. Transient: consumed during write-time redaction and
    /// never itself persisted, so it has no column on [`EventRecord`].
    pub device_hash: Option<String>,
    pub details: serde_json::Value,
}

/// Liveness state of a kiosk. See spec §4.3.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KioskStatus {
    Online,
    Offline,
    Maintenance,
    Error,
}

/// A single row of the `kiosk_heartbeat` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatRecord {
    pub kiosk_id: String,
    pub zone: String,
    pub version: i64,
    pub status: KioskStatus,
    pub last_seen: DateTime<Utc>,
    pub hardware_id: Option<String>,
    pub config_hash: Option<String>,
}
