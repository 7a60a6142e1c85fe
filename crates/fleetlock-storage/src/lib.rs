//! Persistence adapter for `FleetLock`.
//!
//! This crate defines four narrow storage traits — one per owned row family
//! in spec §3 — instead of a single generic key/value interface. Each trait
//! exposes the exact conditional-update primitives the domain layer needs
//! (`cas_update`, `claim`, batched expiry sweeps) so the concurrency
//! contract lives in a type signature, not a convention.
//!
//! Two implementations are provided:
//!
//! - [`PostgresStore`] — production default, backed by PostgreSQL via `sqlx`
//!   (feature `postgres-backend`, default-on).
//! - [`MemoryStore`] — in-process, for tests and local/dev runs.

mod error;
#[cfg(feature = "postgres-backend")]
mod postgres;
mod memory;
pub mod types;

pub use error::StorageError;
#[cfg(feature = "postgres-backend")]
pub use postgres::PostgresStore;
pub use memory::MemoryStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use types::{
    CasOutcome, CommandRecord, EventRecord, HeartbeatRecord, KioskStatus, LockerPatch,
    LockerRecord, NewEventRecord, OwnerType,
};

/// Storage for the `lockers` table — owned exclusively by the locker state
/// machine (`fleetlock-core::locker`).
#[async_trait]
pub trait LockerStore: Send + Sync + 'static {
    /// Read a single locker row.
    async fn get(&self, kiosk_id: &str, locker_id: i32) -> Result<Option<LockerRecord>, StorageError>;

    /// List every locker row belonging to a kiosk.
    async fn list_by_kiosk(&self, kiosk_id: &str) -> Result<Vec<LockerRecord>, StorageError>;

    /// Find lockers currently held (`Reserved` or `Owned`) by an owner key
    /// within one kiosk — backs the one-card-one-locker scan in spec §4.1.
    async fn find_held_by_owner(
        &self,
        kiosk_id: &str,
        owner_type: OwnerType,
        owner_key: &str,
    ) -> Result<Vec<LockerRecord>, StorageError>;

    /// Idempotently insert a locker row if it does not already exist —
    /// used by inventory provisioning, not by the state machine directly.
    async fn provision(&self, row: LockerRecord) -> Result<(), StorageError>;

    /// The state machine's sole mutation primitive.
    ///
    /// Concurrency contract: `UPDATE lockers SET status = $patch.status,
    /// owner_type = ..., version = version + 1, updated_at = now() WHERE
    /// kiosk_id = $1 AND locker_id = $2 AND version = $expected_version`.
    /// A zero-row update yields [`CasOutcome::Conflict`] — never retried
    /// internally (spec §4.1 "Failure semantics").
    async fn cas_update(
        &self,
        kiosk_id: &str,
        locker_id: i32,
        expected_version: i64,
        patch: LockerPatch,
    ) -> Result<CasOutcome<LockerRecord>, StorageError>;

    /// The cleanup loop's batched conditional update: every `Reserved` row
    /// with `reserved_at < cutoff` moves to `Free` in one statement.
    ///
    /// Concurrency contract: `UPDATE lockers SET status = 'free', owner_type
    /// = NULL, owner_key = NULL, reserved_at = NULL, version = version + 1
    /// WHERE status = 'reserved' AND reserved_at < $cutoff RETURNING *`.
    async fn batch_expire_reservations(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<LockerRecord>, StorageError>;
}

/// Storage for the `command_queue` table — owned exclusively by
/// `fleetlock-core::queue`.
#[async_trait]
pub trait CommandQueueStore: Send + Sync + 'static {
    /// Persist a brand-new command with `status = pending`.
    async fn enqueue(&self, command: CommandRecord) -> Result<(), StorageError>;

    /// Read pending, due commands for a kiosk, oldest first. Read-only.
    async fn fetch_pending(&self, kiosk_id: &str, limit: u32) -> Result<Vec<CommandRecord>, StorageError>;

    /// Look up a single command by id, in any status. Used by callers that
    /// need the row's retry bookkeeping (e.g. to report a failure) without
    /// re-deriving it from the `pending`-only fetch above.
    async fn get(&self, command_id: uuid::Uuid) -> Result<Option<CommandRecord>, StorageError>;

    /// The claim primitive: `UPDATE command_queue SET status = 'executing',
    /// executed_at = now() WHERE command_id = $1 AND status = 'pending'`.
    /// Returns `true` only for the single caller whose update affected a row.
    async fn claim(&self, command_id: uuid::Uuid) -> Result<bool, StorageError>;

    async fn mark_completed(&self, command_id: uuid::Uuid) -> Result<(), StorageError>;

    /// Apply the retry policy's outcome: either back to `pending` with a
    /// new `next_attempt_at`, or terminal `failed`.
    async fn mark_failed_and_reschedule(
        &self,
        command_id: uuid::Uuid,
        error: &str,
        reschedule: Option<DateTime<Utc>>,
    ) -> Result<(), StorageError>;

    async fn cancel(&self, command_id: uuid::Uuid) -> Result<(), StorageError>;

    /// Cancel every pending/executing command for a kiosk — invoked on
    /// restart detection. Returns the number of rows affected.
    async fn clear_pending(&self, kiosk_id: &str) -> Result<u64, StorageError>;

    /// Rows stuck in `executing` past the stale threshold.
    async fn find_stale_executing(&self, threshold: DateTime<Utc>) -> Result<Vec<CommandRecord>, StorageError>;

    /// GC: delete terminal rows older than `cutoff`. Returns rows deleted.
    async fn delete_terminal_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, StorageError>;
}

/// Storage for the append-only `events` table.
#[async_trait]
pub trait EventStore: Send + Sync + 'static {
    /// Append an already-validated, already-redacted event.
    async fn append(&self, event: NewEventRecord) -> Result<EventRecord, StorageError>;

    /// Query events, most recent first, for the audit reporting API.
    async fn query(&self, filter: EventFilter) -> Result<Vec<EventRecord>, StorageError>;

    /// Delete events older than `cutoff`. When `event_types` is `Some`, only
    /// rows whose `event_type` is in the list are eligible — this lets
    /// callers run separate retention windows for audit (staff-attributed)
    /// and non-audit events per spec §4.6.
    async fn delete_older_than(
        &self,
        cutoff: DateTime<Utc>,
        event_types: Option<&[String]>,
    ) -> Result<u64, StorageError>;

    /// Anonymize `device_id` / `rfid_card` / `ip_address`-bearing fields in
    /// events older than `cutoff`. Idempotent — already-anonymized rows are
    /// left untouched by the implementation's own `anon_` prefix check.
    async fn anonymize_older_than(&self, cutoff: DateTime<Utc>, salt: &str) -> Result<u64, StorageError>;
}

/// A query filter over the event log.
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    pub kiosk_id: Option<String>,
    pub locker_id: Option<i32>,
    pub event_type: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub limit: u32,
}

/// Storage for the `kiosk_heartbeat` table.
#[async_trait]
pub trait HeartbeatStore: Send + Sync + 'static {
    /// Upsert last-seen/version/config for a kiosk, returning the row as it
    /// was *before* this write (so the caller can detect online/offline and
    /// version/hardware transitions).
    async fn upsert(&self, row: HeartbeatRecord) -> Result<Option<HeartbeatRecord>, StorageError>;

    async fn get(&self, kiosk_id: &str) -> Result<Option<HeartbeatRecord>, StorageError>;

    async fn list_by_status(&self, status: KioskStatus) -> Result<Vec<HeartbeatRecord>, StorageError>;

    /// Cleanup's batched transition: every `online` kiosk with `last_seen <
    /// cutoff` moves to `offline`. Returns the affected rows (pre-transition
    /// `last_seen` is preserved on the returned rows so callers can compute
    /// `offline_duration_ms`).
    async fn transition_offline_batch(&self, cutoff: DateTime<Utc>) -> Result<Vec<HeartbeatRecord>, StorageError>;
}
