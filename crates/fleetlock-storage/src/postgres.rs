//! PostgreSQL storage backend.
//!
//! Four tables, one per trait: `lockers`, `command_queue`, `events`,
//! `kiosk_heartbeat`. Feature-gated behind `postgres-backend` (default-on).
//! Uses `sqlx` with the Tokio runtime — no `spawn_blocking` needed.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};

use crate::types::{
    CasOutcome, CommandPayload, CommandRecord, CommandStatus, EventRecord, HeartbeatRecord,
    KioskStatus, LockerPatch, LockerRecord, LockerStatus, NewEventRecord, OwnerType,
};
use crate::{CommandQueueStore, EventFilter, EventStore, HeartbeatStore, LockerStore, StorageError};

/// A storage backend backed by PostgreSQL.
///
/// Thread-safe via `PgPool`. All operations are fully async.
///
/// # Examples
///
/// ```no_run
/// # use fleetlock_storage::PostgresStore;
/// # #[tokio::main]
/// # async fn main() {
/// let store = PostgresStore::connect("postgres://localhost/fleetlock").await.unwrap();
/// # }
/// ```
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl std::fmt::Debug for PostgresStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresStore")
            .field("pool", &"[PgPool]")
            .finish_non_exhaustive()
    }
}

impl PostgresStore {
    /// Connect to PostgreSQL and run the initial migration.
    ///
    /// Creates the four tables this crate owns if they do not already exist.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Open`] if the connection or migration fails.
    pub async fn connect(database_url: &str) -> Result<Self, StorageError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await
            .map_err(|e| StorageError::Open { reason: e.to_string() })?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS lockers (
                kiosk_id     TEXT NOT NULL,
                locker_id    INTEGER NOT NULL,
                status       TEXT NOT NULL,
                owner_type   TEXT,
                owner_key    TEXT,
                reserved_at  TIMESTAMPTZ,
                owned_at     TIMESTAMPTZ,
                is_vip       BOOLEAN NOT NULL DEFAULT FALSE,
                display_name TEXT,
                version      BIGINT NOT NULL DEFAULT 1,
                updated_at   TIMESTAMPTZ NOT NULL DEFAULT now(),
                PRIMARY KEY (kiosk_id, locker_id)
            )",
        )
        .execute(&pool)
        .await
        .map_err(|e| StorageError::Open { reason: format!("lockers migration failed: {e}") })?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS command_queue (
                command_id      UUID PRIMARY KEY,
                kiosk_id        TEXT NOT NULL,
                payload         JSONB NOT NULL,
                status          TEXT NOT NULL,
                retry_count     INTEGER NOT NULL DEFAULT 0,
                max_retries     INTEGER NOT NULL,
                next_attempt_at TIMESTAMPTZ NOT NULL,
                last_error      TEXT,
                created_at      TIMESTAMPTZ NOT NULL DEFAULT now(),
                executed_at     TIMESTAMPTZ,
                completed_at    TIMESTAMPTZ
            )",
        )
        .execute(&pool)
        .await
        .map_err(|e| StorageError::Open { reason: format!("command_queue migration failed: {e}") })?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_command_queue_pending \
             ON command_queue (kiosk_id, next_attempt_at) WHERE status = 'pending'",
        )
        .execute(&pool)
        .await
        .map_err(|e| StorageError::Open { reason: format!("command_queue index failed: {e}") })?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS events (
                id         BIGSERIAL PRIMARY KEY,
                timestamp  TIMESTAMPTZ NOT NULL,
                kiosk_id   TEXT,
                locker_id  INTEGER,
                event_type TEXT NOT NULL,
                rfid_card  TEXT,
                device_id  TEXT,
                staff_user TEXT,
                ip_address TEXT,
                user_agent TEXT,
                details    JSONB NOT NULL
            )",
        )
        .execute(&pool)
        .await
        .map_err(|e| StorageError::Open { reason: format!("events migration failed: {e}") })?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_events_timestamp ON events (timestamp DESC)",
        )
        .execute(&pool)
        .await
        .map_err(|e| StorageError::Open { reason: format!("events index failed: {e}") })?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS kiosk_heartbeat (
                kiosk_id    TEXT PRIMARY KEY,
                zone        TEXT NOT NULL,
                version     BIGINT NOT NULL DEFAULT 0,
                status      TEXT NOT NULL,
                last_seen   TIMESTAMPTZ NOT NULL,
                hardware_id TEXT,
                config_hash TEXT
            )",
        )
        .execute(&pool)
        .await
        .map_err(|e| StorageError::Open { reason: format!("kiosk_heartbeat migration failed: {e}") })?;

        Ok(Self { pool })
    }

    /// Return a reference to the underlying connection pool.
    #[must_use]
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn locker_status_str(status: LockerStatus) -> &'static str {
    match status {
        LockerStatus::Free => "free",
        LockerStatus::Reserved => "reserved",
        LockerStatus::Owned => "owned",
        LockerStatus::Blocked => "blocked",
        LockerStatus::Error => "error",
    }
}

fn parse_locker_status(s: &str) -> LockerStatus {
    match s {
        "reserved" => LockerStatus::Reserved,
        "owned" => LockerStatus::Owned,
        "blocked" => LockerStatus::Blocked,
        "error" => LockerStatus::Error,
        _ => LockerStatus::Free,
    }
}

fn owner_type_str(owner_type: OwnerType) -> &'static str {
    match owner_type {
        OwnerType::Rfid => "rfid",
        OwnerType::QrDevice => "qr_device",
    }
}

fn parse_owner_type(s: &str) -> OwnerType {
    match s {
        "qr_device" => OwnerType::QrDevice,
        _ => OwnerType::Rfid,
    }
}

fn row_to_locker(row: &sqlx::postgres::PgRow) -> Result<LockerRecord, StorageError> {
    let status: String = row.try_get("status").map_err(read_err("lockers"))?;
    let owner_type: Option<String> = row.try_get("owner_type").map_err(read_err("lockers"))?;
    Ok(LockerRecord {
        kiosk_id: row.try_get("kiosk_id").map_err(read_err("lockers"))?,
        locker_id: row.try_get("locker_id").map_err(read_err("lockers"))?,
        status: parse_locker_status(&status),
        owner_type: owner_type.as_deref().map(parse_owner_type),
        owner_key: row.try_get("owner_key").map_err(read_err("lockers"))?,
        reserved_at: row.try_get("reserved_at").map_err(read_err("lockers"))?,
        owned_at: row.try_get("owned_at").map_err(read_err("lockers"))?,
        is_vip: row.try_get("is_vip").map_err(read_err("lockers"))?,
        display_name: row.try_get("display_name").map_err(read_err("lockers"))?,
        version: row.try_get("version").map_err(read_err("lockers"))?,
        updated_at: row.try_get("updated_at").map_err(read_err("lockers"))?,
    })
}

fn read_err(table: &'static str) -> impl Fn(sqlx::Error) -> StorageError {
    move |e| StorageError::Read { table: table.to_owned(), reason: e.to_string() }
}

fn write_err(table: &'static str) -> impl Fn(sqlx::Error) -> StorageError {
    move |e| StorageError::Write { table: table.to_owned(), reason: e.to_string() }
}

fn delete_err(table: &'static str) -> impl Fn(sqlx::Error) -> StorageError {
    move |e| StorageError::Delete { table: table.to_owned(), reason: e.to_string() }
}

#[async_trait]
impl LockerStore for PostgresStore {
    async fn get(&self, kiosk_id: &str, locker_id: i32) -> Result<Option<LockerRecord>, StorageError> {
        let row = sqlx::query("SELECT * FROM lockers WHERE kiosk_id = $1 AND locker_id = $2")
            .bind(kiosk_id)
            .bind(locker_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(read_err("lockers"))?;
        row.as_ref().map(row_to_locker).transpose()
    }

    async fn list_by_kiosk(&self, kiosk_id: &str) -> Result<Vec<LockerRecord>, StorageError> {
        let rows = sqlx::query("SELECT * FROM lockers WHERE kiosk_id = $1 ORDER BY locker_id")
            .bind(kiosk_id)
            .fetch_all(&self.pool)
            .await
            .map_err(read_err("lockers"))?;
        rows.iter().map(row_to_locker).collect()
    }

    async fn find_held_by_owner(
        &self,
        kiosk_id: &str,
        owner_type: OwnerType,
        owner_key: &str,
    ) -> Result<Vec<LockerRecord>, StorageError> {
        let rows = sqlx::query(
            "SELECT * FROM lockers WHERE kiosk_id = $1 AND owner_type = $2 AND owner_key = $3 \
             AND status IN ('reserved', 'owned')",
        )
        .bind(kiosk_id)
        .bind(owner_type_str(owner_type))
        .bind(owner_key)
        .fetch_all(&self.pool)
        .await
        .map_err(read_err("lockers"))?;
        rows.iter().map(row_to_locker).collect()
    }

    async fn provision(&self, row: LockerRecord) -> Result<(), StorageError> {
        sqlx::query(
            "INSERT INTO lockers (kiosk_id, locker_id, status, is_vip, display_name, version, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7) \
             ON CONFLICT (kiosk_id, locker_id) DO NOTHING",
        )
        .bind(&row.kiosk_id)
        .bind(row.locker_id)
        .bind(locker_status_str(row.status))
        .bind(row.is_vip)
        .bind(&row.display_name)
        .bind(row.version)
        .bind(row.updated_at)
        .execute(&self.pool)
        .await
        .map_err(write_err("lockers"))?;
        Ok(())
    }

    async fn cas_update(
        &self,
        kiosk_id: &str,
        locker_id: i32,
        expected_version: i64,
        patch: LockerPatch,
    ) -> Result<CasOutcome<LockerRecord>, StorageError> {
        let current = self.get(kiosk_id, locker_id).await?;
        let Some(current) = current else {
            return Ok(CasOutcome::Conflict);
        };
        let owner_type = patch.owner_type.apply(current.owner_type);
        let owner_key = patch.owner_key.apply(current.owner_key);
        let reserved_at = patch.reserved_at.apply(current.reserved_at);
        let owned_at = patch.owned_at.apply(current.owned_at);

        let row = sqlx::query(
            "UPDATE lockers SET status = $1, owner_type = $2, owner_key = $3, reserved_at = $4, \
             owned_at = $5, version = version + 1, updated_at = now() \
             WHERE kiosk_id = $6 AND locker_id = $7 AND version = $8 \
             RETURNING *",
        )
        .bind(locker_status_str(patch.status))
        .bind(owner_type.map(owner_type_str))
        .bind(&owner_key)
        .bind(reserved_at)
        .bind(owned_at)
        .bind(kiosk_id)
        .bind(locker_id)
        .bind(expected_version)
        .fetch_optional(&self.pool)
        .await
        .map_err(write_err("lockers"))?;

        match row {
            Some(r) => Ok(CasOutcome::Updated(row_to_locker(&r)?)),
            None => Ok(CasOutcome::Conflict),
        }
    }

    async fn batch_expire_reservations(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<LockerRecord>, StorageError> {
        let rows = sqlx::query(
            "UPDATE lockers SET status = 'free', owner_type = NULL, owner_key = NULL, \
             reserved_at = NULL, version = version + 1, updated_at = now() \
             WHERE status = 'reserved' AND reserved_at < $1 \
             RETURNING *",
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await
        .map_err(write_err("lockers"))?;
        rows.iter().map(row_to_locker).collect()
    }
}

fn command_status_str(status: CommandStatus) -> &'static str {
    match status {
        CommandStatus::Pending => "pending",
        CommandStatus::Executing => "executing",
        CommandStatus::Completed => "completed",
        CommandStatus::Failed => "failed",
        CommandStatus::Cancelled => "cancelled",
    }
}

fn parse_command_status(s: &str) -> CommandStatus {
    match s {
        "executing" => CommandStatus::Executing,
        "completed" => CommandStatus::Completed,
        "failed" => CommandStatus::Failed,
        "cancelled" => CommandStatus::Cancelled,
        _ => CommandStatus::Pending,
    }
}

fn row_to_command(row: &sqlx::postgres::PgRow) -> Result<CommandRecord, StorageError> {
    let status: String = row.try_get("status").map_err(read_err("command_queue"))?;
    let payload: serde_json::Value = row.try_get("payload").map_err(read_err("command_queue"))?;
    let payload: CommandPayload = serde_json::from_value(payload)
        .map_err(|e| StorageError::Read { table: "command_queue".to_owned(), reason: e.to_string() })?;
    Ok(CommandRecord {
        command_id: row.try_get("command_id").map_err(read_err("command_queue"))?,
        kiosk_id: row.try_get("kiosk_id").map_err(read_err("command_queue"))?,
        payload,
        status: parse_command_status(&status),
        retry_count: row.try_get("retry_count").map_err(read_err("command_queue"))?,
        max_retries: row.try_get("max_retries").map_err(read_err("command_queue"))?,
        next_attempt_at: row.try_get("next_attempt_at").map_err(read_err("command_queue"))?,
        last_error: row.try_get("last_error").map_err(read_err("command_queue"))?,
        created_at: row.try_get("created_at").map_err(read_err("command_queue"))?,
        executed_at: row.try_get("executed_at").map_err(read_err("command_queue"))?,
        completed_at: row.try_get("completed_at").map_err(read_err("command_queue"))?,
    })
}

#[async_trait]
impl CommandQueueStore for PostgresStore {
    async fn enqueue(&self, command: CommandRecord) -> Result<(), StorageError> {
        let payload = serde_json::to_value(&command.payload)
            .map_err(|e| StorageError::Write { table: "command_queue".to_owned(), reason: e.to_string() })?;
        sqlx::query(
            "INSERT INTO command_queue (command_id, kiosk_id, payload, status, retry_count, \
             max_retries, next_attempt_at, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
        )
        .bind(command.command_id)
        .bind(&command.kiosk_id)
        .bind(payload)
        .bind(command_status_str(command.status))
        .bind(command.retry_count)
        .bind(command.max_retries)
        .bind(command.next_attempt_at)
        .bind(command.created_at)
        .execute(&self.pool)
        .await
        .map_err(write_err("command_queue"))?;
        Ok(())
    }

    async fn fetch_pending(&self, kiosk_id: &str, limit: u32) -> Result<Vec<CommandRecord>, StorageError> {
        let rows = sqlx::query(
            "SELECT * FROM command_queue WHERE kiosk_id = $1 AND status = 'pending' \
             AND next_attempt_at <= now() ORDER BY created_at LIMIT $2",
        )
        .bind(kiosk_id)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await
        .map_err(read_err("command_queue"))?;
        rows.iter().map(row_to_command).collect()
    }

    async fn get(&self, command_id: uuid::Uuid) -> Result<Option<CommandRecord>, StorageError> {
        let row = sqlx::query("SELECT * FROM command_queue WHERE command_id = $1")
            .bind(command_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(read_err("command_queue"))?;
        row.as_ref().map(row_to_command).transpose()
    }

    async fn claim(&self, command_id: uuid::Uuid) -> Result<bool, StorageError> {
        let result = sqlx::query(
            "UPDATE command_queue SET status = 'executing', executed_at = now() \
             WHERE command_id = $1 AND status = 'pending'",
        )
        .bind(command_id)
        .execute(&self.pool)
        .await
        .map_err(write_err("command_queue"))?;
        Ok(result.rows_affected() == 1)
    }

    async fn mark_completed(&self, command_id: uuid::Uuid) -> Result<(), StorageError> {
        sqlx::query("UPDATE command_queue SET status = 'completed', completed_at = now() WHERE command_id = $1")
            .bind(command_id)
            .execute(&self.pool)
            .await
            .map_err(write_err("command_queue"))?;
        Ok(())
    }

    async fn mark_failed_and_reschedule(
        &self,
        command_id: uuid::Uuid,
        error: &str,
        reschedule: Option<DateTime<Utc>>,
    ) -> Result<(), StorageError> {
        match reschedule {
            Some(next_attempt_at) => {
                sqlx::query(
                    "UPDATE command_queue SET status = 'pending', retry_count = retry_count + 1, \
                     next_attempt_at = $1, last_error = $2, executed_at = NULL WHERE command_id = $3",
                )
                .bind(next_attempt_at)
                .bind(error)
                .bind(command_id)
                .execute(&self.pool)
                .await
                .map_err(write_err("command_queue"))?;
            }
            None => {
                sqlx::query(
                    "UPDATE command_queue SET status = 'failed', last_error = $1, completed_at = now() \
                     WHERE command_id = $2",
                )
                .bind(error)
                .bind(command_id)
                .execute(&self.pool)
                .await
                .map_err(write_err("command_queue"))?;
            }
        }
        Ok(())
    }

    async fn cancel(&self, command_id: uuid::Uuid) -> Result<(), StorageError> {
        sqlx::query("UPDATE command_queue SET status = 'cancelled', completed_at = now() WHERE command_id = $1")
            .bind(command_id)
            .execute(&self.pool)
            .await
            .map_err(write_err("command_queue"))?;
        Ok(())
    }

    async fn clear_pending(&self, kiosk_id: &str) -> Result<u64, StorageError> {
        let result = sqlx::query(
            "UPDATE command_queue SET status = 'cancelled', completed_at = now() \
             WHERE kiosk_id = $1 AND status IN ('pending', 'executing')",
        )
        .bind(kiosk_id)
        .execute(&self.pool)
        .await
        .map_err(write_err("command_queue"))?;
        Ok(result.rows_affected())
    }

    async fn find_stale_executing(&self, threshold: DateTime<Utc>) -> Result<Vec<CommandRecord>, StorageError> {
        let rows = sqlx::query("SELECT * FROM command_queue WHERE status = 'executing' AND executed_at < $1")
            .bind(threshold)
            .fetch_all(&self.pool)
            .await
            .map_err(read_err("command_queue"))?;
        rows.iter().map(row_to_command).collect()
    }

    async fn delete_terminal_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, StorageError> {
        let result = sqlx::query(
            "DELETE FROM command_queue WHERE status IN ('completed', 'failed', 'cancelled') \
             AND completed_at < $1",
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await
        .map_err(delete_err("command_queue"))?;
        Ok(result.rows_affected())
    }
}

fn row_to_event(row: &sqlx::postgres::PgRow) -> Result<EventRecord, StorageError> {
    Ok(EventRecord {
        id: row.try_get("id").map_err(read_err("events"))?,
        timestamp: row.try_get("timestamp").map_err(read_err("events"))?,
        kiosk_id: row.try_get("kiosk_id").map_err(read_err("events"))?,
        locker_id: row.try_get("locker_id").map_err(read_err("events"))?,
        event_type: row.try_get("event_type").map_err(read_err("events"))?,
        rfid_card: row.try_get("rfid_card").map_err(read_err("events"))?,
        device_id: row.try_get("device_id").map_err(read_err("events"))?,
        staff_user: row.try_get("staff_user").map_err(read_err("events"))?,
        ip_address: row.try_get("ip_address").map_err(read_err("events"))?,
        user_agent: row.try_get("user_agent").map_err(read_err("events"))?,
        details: row.try_get("details").map_err(read_err("events"))?,
    })
}

#[async_trait]
impl EventStore for PostgresStore {
    async fn append(&self, event: NewEventRecord) -> Result<EventRecord, StorageError> {
        let row = sqlx::query(
            "INSERT INTO events (timestamp, kiosk_id, locker_id, event_type, rfid_card, device_id, \
             staff_user, ip_address, user_agent, details) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10) \
             RETURNING *",
        )
        .bind(event.timestamp)
        .bind(&event.kiosk_id)
        .bind(event.locker_id)
        .bind(&event.event_type)
        .bind(&event.rfid_card)
        .bind(&event.device_id)
        .bind(&event.staff_user)
        .bind(&event.ip_address)
        .bind(&event.user_agent)
        .bind(&event.details)
        .fetch_one(&self.pool)
        .await
        .map_err(write_err("events"))?;
        row_to_event(&row)
    }

    async fn query(&self, filter: EventFilter) -> Result<Vec<EventRecord>, StorageError> {
        let limit = if filter.limit == 0 { 100 } else { i64::from(filter.limit) };
        let rows = sqlx::query(
            "SELECT * FROM events WHERE \
             ($1::TEXT IS NULL OR kiosk_id = $1) AND \
             ($2::INTEGER IS NULL OR locker_id = $2) AND \
             ($3::TEXT IS NULL OR event_type = $3) AND \
             ($4::TIMESTAMPTZ IS NULL OR timestamp >= $4) AND \
             ($5::TIMESTAMPTZ IS NULL OR timestamp <= $5) \
             ORDER BY timestamp DESC LIMIT $6",
        )
        .bind(filter.kiosk_id)
        .bind(filter.locker_id)
        .bind(filter.event_type)
        .bind(filter.since)
        .bind(filter.until)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(read_err("events"))?;
        rows.iter().map(row_to_event).collect()
    }

    async fn delete_older_than(
        &self,
        cutoff: DateTime<Utc>,
        event_types: Option<&[String]>,
    ) -> Result<u64, StorageError> {
        let result = match event_types {
            None => {
                sqlx::query("DELETE FROM events WHERE timestamp < $1")
                    .bind(cutoff)
                    .execute(&self.pool)
                    .await
            }
            Some(types) => {
                sqlx::query("DELETE FROM events WHERE timestamp < $1 AND event_type = ANY($2)")
                    .bind(cutoff)
                    .bind(types)
                    .execute(&self.pool)
                    .await
            }
        }
        .map_err(delete_err("events"))?;
        Ok(result.rows_affected())
    }

    async fn anonymize_older_than(&self, cutoff: DateTime<Utc>, salt: &str) -> Result<u64, StorageError> {
        let rows = sqlx::query(
            "SELECT id, rfid_card, device_id, ip_address FROM events WHERE timestamp < $1 \
             AND (rfid_card IS NOT NULL OR device_id IS NOT NULL OR ip_address IS NOT NULL) \
             AND NOT ( \
                 COALESCE(rfid_card, 'anon_') LIKE 'anon_%' AND \
                 COALESCE(device_id, 'anon_') LIKE 'anon_%' AND \
                 COALESCE(ip_address, 'anon_') LIKE 'anon_%' \
             )",
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await
        .map_err(read_err("events"))?;

        let mut count = 0u64;
        for row in rows {
            let id: i64 = row.try_get("id").map_err(read_err("events"))?;
            let rfid_card: Option<String> = row.try_get("rfid_card").map_err(read_err("events"))?;
            let device_id: Option<String> = row.try_get("device_id").map_err(read_err("events"))?;
            let ip_address: Option<String> = row.try_get("ip_address").map_err(read_err("events"))?;
            let rfid_card = rfid_card.map(|v| crate::memory::anonymize_value(&v, salt));
            let device_id = device_id.map(|v| crate::memory::anonymize_value(&v, salt));
            let ip_address = ip_address.map(|v| crate::memory::anonymize_value(&v, salt));
            sqlx::query("UPDATE events SET rfid_card = $1, device_id = $2, ip_address = $3 WHERE id = $4")
                .bind(rfid_card)
                .bind(device_id)
                .bind(ip_address)
                .bind(id)
                .execute(&self.pool)
                .await
                .map_err(write_err("events"))?;
            count += 1;
        }
        Ok(count)
    }
}

fn kiosk_status_str(status: KioskStatus) -> &'static str {
    match status {
        KioskStatus::Online => "online",
        KioskStatus::Offline => "offline",
        KioskStatus::Maintenance => "maintenance",
        KioskStatus::Error => "error",
    }
}

fn parse_kiosk_status(s: &str) -> KioskStatus {
    match s {
        "offline" => KioskStatus::Offline,
        "maintenance" => KioskStatus::Maintenance,
        "error" => KioskStatus::Error,
        _ => KioskStatus::Online,
    }
}

fn row_to_heartbeat(row: &sqlx::postgres::PgRow) -> Result<HeartbeatRecord, StorageError> {
    let status: String = row.try_get("status").map_err(read_err("kiosk_heartbeat"))?;
    Ok(HeartbeatRecord {
        kiosk_id: row.try_get("kiosk_id").map_err(read_err("kiosk_heartbeat"))?,
        zone: row.try_get("zone").map_err(read_err("kiosk_heartbeat"))?,
        version: row.try_get("version").map_err(read_err("kiosk_heartbeat"))?,
        status: parse_kiosk_status(&status),
        last_seen: row.try_get("last_seen").map_err(read_err("kiosk_heartbeat"))?,
        hardware_id: row.try_get("hardware_id").map_err(read_err("kiosk_heartbeat"))?,
        config_hash: row.try_get("config_hash").map_err(read_err("kiosk_heartbeat"))?,
    })
}

#[async_trait]
impl HeartbeatStore for PostgresStore {
    async fn upsert(&self, row: HeartbeatRecord) -> Result<Option<HeartbeatRecord>, StorageError> {
        let previous = self.get(&row.kiosk_id).await?;
        sqlx::query(
            "INSERT INTO kiosk_heartbeat (kiosk_id, zone, version, status, last_seen, hardware_id, config_hash) \
             VALUES ($1, $2, $3, $4, $5, $6, $7) \
             ON CONFLICT (kiosk_id) DO UPDATE SET \
             zone = EXCLUDED.zone, version = EXCLUDED.version, status = EXCLUDED.status, \
             last_seen = EXCLUDED.last_seen, hardware_id = EXCLUDED.hardware_id, \
             config_hash = EXCLUDED.config_hash",
        )
        .bind(&row.kiosk_id)
        .bind(&row.zone)
        .bind(row.version)
        .bind(kiosk_status_str(row.status))
        .bind(row.last_seen)
        .bind(&row.hardware_id)
        .bind(&row.config_hash)
        .execute(&self.pool)
        .await
        .map_err(write_err("kiosk_heartbeat"))?;
        Ok(previous)
    }

    async fn get(&self, kiosk_id: &str) -> Result<Option<HeartbeatRecord>, StorageError> {
        let row = sqlx::query("SELECT * FROM kiosk_heartbeat WHERE kiosk_id = $1")
            .bind(kiosk_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(read_err("kiosk_heartbeat"))?;
        row.as_ref().map(row_to_heartbeat).transpose()
    }

    async fn list_by_status(&self, status: KioskStatus) -> Result<Vec<HeartbeatRecord>, StorageError> {
        let rows = sqlx::query("SELECT * FROM kiosk_heartbeat WHERE status = $1")
            .bind(kiosk_status_str(status))
            .fetch_all(&self.pool)
            .await
            .map_err(read_err("kiosk_heartbeat"))?;
        rows.iter().map(row_to_heartbeat).collect()
    }

    async fn transition_offline_batch(&self, cutoff: DateTime<Utc>) -> Result<Vec<HeartbeatRecord>, StorageError> {
        let stale = sqlx::query("SELECT * FROM kiosk_heartbeat WHERE status = 'online' AND last_seen < $1")
            .bind(cutoff)
            .fetch_all(&self.pool)
            .await
            .map_err(read_err("kiosk_heartbeat"))?;
        let pre_transition: Vec<HeartbeatRecord> = stale.iter().map(row_to_heartbeat).collect::<Result<_, _>>()?;

        sqlx::query("UPDATE kiosk_heartbeat SET status = 'offline' WHERE status = 'online' AND last_seen < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await
            .map_err(write_err("kiosk_heartbeat"))?;

        Ok(pre_transition)
    }
}
