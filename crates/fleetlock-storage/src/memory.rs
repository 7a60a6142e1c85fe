//! In-memory storage backend for tests and local/dev runs.
//!
//! All four traits are backed by a single `RwLock`-guarded struct per table.
//! Not persistent — data is lost when the process exits.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::types::{
    CasOutcome, CommandRecord, CommandStatus, EventRecord, HeartbeatRecord, KioskStatus,
    LockerPatch, LockerRecord, NewEventRecord, OwnerType,
};
use crate::{CommandQueueStore, EventFilter, EventStore, HeartbeatStore, LockerStore, StorageError};

/// An in-memory implementation of every `fleetlock-storage` trait.
///
/// Thread-safe and async-compatible (`Clone` shares state via `Arc`).
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    lockers: Arc<RwLock<HashMap<(String, i32), LockerRecord>>>,
    commands: Arc<RwLock<HashMap<uuid::Uuid, CommandRecord>>>,
    events: Arc<RwLock<Vec<EventRecord>>>,
    next_event_id: Arc<RwLock<i64>>,
    heartbeats: Arc<RwLock<HashMap<String, HeartbeatRecord>>>,
}

impl MemoryStore {
    /// Create a new, empty in-memory store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LockerStore for MemoryStore {
    async fn get(&self, kiosk_id: &str, locker_id: i32) -> Result<Option<LockerRecord>, StorageError> {
        let lockers = self.lockers.read().await;
        Ok(lockers.get(&(kiosk_id.to_owned(), locker_id)).cloned())
    }

    async fn list_by_kiosk(&self, kiosk_id: &str) -> Result<Vec<LockerRecord>, StorageError> {
        let lockers = self.lockers.read().await;
        let mut rows: Vec<LockerRecord> = lockers
            .values()
            .filter(|r| r.kiosk_id == kiosk_id)
            .cloned()
            .collect();
        rows.sort_by_key(|r| r.locker_id);
        Ok(rows)
    }

    async fn find_held_by_owner(
        &self,
        kiosk_id: &str,
        owner_type: OwnerType,
        owner_key: &str,
    ) -> Result<Vec<LockerRecord>, StorageError> {
        use crate::types::LockerStatus;
        let lockers = self.lockers.read().await;
        Ok(lockers
            .values()
            .filter(|r| {
                r.kiosk_id == kiosk_id
                    && matches!(r.status, LockerStatus::Reserved | LockerStatus::Owned)
                    && r.owner_type == Some(owner_type)
                    && r.owner_key.as_deref() == Some(owner_key)
            })
            .cloned()
            .collect())
    }

    async fn provision(&self, row: LockerRecord) -> Result<(), StorageError> {
        let mut lockers = self.lockers.write().await;
        lockers
            .entry((row.kiosk_id.clone(), row.locker_id))
            .or_insert(row);
        Ok(())
    }

    async fn cas_update(
        &self,
        kiosk_id: &str,
        locker_id: i32,
        expected_version: i64,
        patch: LockerPatch,
    ) -> Result<CasOutcome<LockerRecord>, StorageError> {
        let mut lockers = self.lockers.write().await;
        let key = (kiosk_id.to_owned(), locker_id);
        let Some(row) = lockers.get_mut(&key) else {
            return Ok(CasOutcome::Conflict);
        };
        if row.version != expected_version {
            return Ok(CasOutcome::Conflict);
        }
        row.status = patch.status;
        row.owner_type = patch.owner_type.apply(row.owner_type);
        row.owner_key = patch.owner_key.apply(row.owner_key.clone());
        row.reserved_at = patch.reserved_at.apply(row.reserved_at);
        row.owned_at = patch.owned_at.apply(row.owned_at);
        row.version += 1;
        row.updated_at = now();
        Ok(CasOutcome::Updated(row.clone()))
    }

    async fn batch_expire_reservations(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<LockerRecord>, StorageError> {
        use crate::types::{Field, LockerStatus};
        let mut lockers = self.lockers.write().await;
        let mut expired = Vec::new();
        for row in lockers.values_mut() {
            if row.status == LockerStatus::Reserved
                && row.reserved_at.is_some_and(|ts| ts < cutoff)
            {
                row.status = LockerStatus::Free;
                row.owner_type = Field::<OwnerType>::Clear.apply(row.owner_type);
                row.owner_key = Field::<String>::Clear.apply(row.owner_key.clone());
                row.reserved_at = Field::<DateTime<Utc>>::Clear.apply(row.reserved_at);
                row.version += 1;
                row.updated_at = now();
                expired.push(row.clone());
            }
        }
        Ok(expired)
    }
}

#[async_trait]
impl CommandQueueStore for MemoryStore {
    async fn enqueue(&self, command: CommandRecord) -> Result<(), StorageError> {
        let mut commands = self.commands.write().await;
        commands.insert(command.command_id, command);
        Ok(())
    }

    async fn fetch_pending(&self, kiosk_id: &str, limit: u32) -> Result<Vec<CommandRecord>, StorageError> {
        let commands = self.commands.read().await;
        let now = now();
        let mut rows: Vec<CommandRecord> = commands
            .values()
            .filter(|c| {
                c.kiosk_id == kiosk_id
                    && c.status == CommandStatus::Pending
                    && c.next_attempt_at <= now
            })
            .cloned()
            .collect();
        rows.sort_by_key(|c| c.created_at);
        rows.truncate(limit as usize);
        Ok(rows)
    }

    async fn get(&self, command_id: uuid::Uuid) -> Result<Option<CommandRecord>, StorageError> {
        Ok(self.commands.read().await.get(&command_id).cloned())
    }

    async fn claim(&self, command_id: uuid::Uuid) -> Result<bool, StorageError> {
        let mut commands = self.commands.write().await;
        match commands.get_mut(&command_id) {
            Some(c) if c.status == CommandStatus::Pending => {
                c.status = CommandStatus::Executing;
                c.executed_at = Some(now());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn mark_completed(&self, command_id: uuid::Uuid) -> Result<(), StorageError> {
        let mut commands = self.commands.write().await;
        if let Some(c) = commands.get_mut(&command_id) {
            c.status = CommandStatus::Completed;
            c.completed_at = Some(now());
        }
        Ok(())
    }

    async fn mark_failed_and_reschedule(
        &self,
        command_id: uuid::Uuid,
        error: &str,
        reschedule: Option<DateTime<Utc>>,
    ) -> Result<(), StorageError> {
        let mut commands = self.commands.write().await;
        if let Some(c) = commands.get_mut(&command_id) {
            c.last_error = Some(error.to_owned());
            match reschedule {
                Some(next_attempt_at) => {
                    c.status = CommandStatus::Pending;
                    c.retry_count += 1;
                    c.next_attempt_at = next_attempt_at;
                    c.executed_at = None;
                }
                None => {
                    c.status = CommandStatus::Failed;
                    c.completed_at = Some(now());
                }
            }
        }
        Ok(())
    }

    async fn cancel(&self, command_id: uuid::Uuid) -> Result<(), StorageError> {
        let mut commands = self.commands.write().await;
        if let Some(c) = commands.get_mut(&command_id) {
            c.status = CommandStatus::Cancelled;
            c.completed_at = Some(now());
        }
        Ok(())
    }

    async fn clear_pending(&self, kiosk_id: &str) -> Result<u64, StorageError> {
        let mut commands = self.commands.write().await;
        let mut count = 0u64;
        for c in commands.values_mut() {
            if c.kiosk_id == kiosk_id
                && matches!(c.status, CommandStatus::Pending | CommandStatus::Executing)
            {
                c.status = CommandStatus::Cancelled;
                c.completed_at = Some(now());
                count += 1;
            }
        }
        Ok(count)
    }

    async fn find_stale_executing(&self, threshold: DateTime<Utc>) -> Result<Vec<CommandRecord>, StorageError> {
        let commands = self.commands.read().await;
        Ok(commands
            .values()
            .filter(|c| {
                c.status == CommandStatus::Executing
                    && c.executed_at.is_some_and(|ts| ts < threshold)
            })
            .cloned()
            .collect())
    }

    async fn delete_terminal_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, StorageError> {
        let mut commands = self.commands.write().await;
        let before = commands.len();
        commands.retain(|_, c| {
            let terminal = matches!(
                c.status,
                CommandStatus::Completed | CommandStatus::Failed | CommandStatus::Cancelled
            );
            !(terminal && c.completed_at.is_some_and(|ts| ts < cutoff))
        });
        #[allow(clippy::cast_possible_truncation)]
        Ok((before - commands.len()) as u64)
    }
}

#[async_trait]
impl EventStore for MemoryStore {
    async fn append(&self, event: NewEventRecord) -> Result<EventRecord, StorageError> {
        let mut id_guard = self.next_event_id.write().await;
        *id_guard += 1;
        let record = EventRecord {
            id: *id_guard,
            timestamp: event.timestamp,
            kiosk_id: event.kiosk_id,
            locker_id: event.locker_id,
            event_type: event.event_type,
            rfid_card: event.rfid_card,
            device_id: event.device_id,
            staff_user: event.staff_user,
            ip_address: event.ip_address,
            user_agent: event.user_agent,
            details: event.details,
        };
        self.events.write().await.push(record.clone());
        Ok(record)
    }

    async fn query(&self, filter: EventFilter) -> Result<Vec<EventRecord>, StorageError> {
        let events = self.events.read().await;
        let mut rows: Vec<EventRecord> = events
            .iter()
            .filter(|e| {
                filter.kiosk_id.as_deref().is_none_or(|k| e.kiosk_id.as_deref() == Some(k))
                    && filter.locker_id.is_none_or(|l| e.locker_id == Some(l))
                    && filter.event_type.as_deref().is_none_or(|t| e.event_type == t)
                    && filter.since.is_none_or(|s| e.timestamp >= s)
                    && filter.until.is_none_or(|u| e.timestamp <= u)
            })
            .cloned()
            .collect();
        rows.sort_by_key(|e| std::cmp::Reverse(e.timestamp));
        if filter.limit > 0 {
            rows.truncate(filter.limit as usize);
        }
        Ok(rows)
    }

    async fn delete_older_than(
        &self,
        cutoff: DateTime<Utc>,
        event_types: Option<&[String]>,
    ) -> Result<u64, StorageError> {
        let mut events = self.events.write().await;
        let before = events.len();
        events.retain(|e| {
            e.timestamp >= cutoff || event_types.is_some_and(|types| !types.contains(&e.event_type))
        });
        #[allow(clippy::cast_possible_truncation)]
        Ok((before - events.len()) as u64)
    }

    async fn anonymize_older_than(&self, cutoff: DateTime<Utc>, salt: &str) -> Result<u64, StorageError> {
        let mut events = self.events.write().await;
        let mut count = 0u64;
        for e in events.iter_mut().filter(|e| e.timestamp < cutoff) {
            let mut touched = false;
            if let Some(card) = e.rfid_card.take() {
                e.rfid_card = Some(anonymize_value(&card, salt));
                touched = true;
            }
            if let Some(device) = e.device_id.take() {
                e.device_id = Some(anonymize_value(&device, salt));
                touched = true;
            }
            if let Some(ip) = e.ip_address.take() {
                e.ip_address = Some(anonymize_value(&ip, salt));
                touched = true;
            }
            if touched {
                count += 1;
            }
        }
        Ok(count)
    }
}

/// Salted-hash anonymization, idempotent by checking the `anon_` prefix.
pub fn anonymize_value(value: &str, salt: &str) -> String {
    if value.starts_with("anon_") {
        return value.to_owned();
    }
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(value.as_bytes());
    let digest = hasher.finalize();
    format!("anon_{}", hex::encode(&digest[..8]))
}

#[async_trait]
impl HeartbeatStore for MemoryStore {
    async fn upsert(&self, row: HeartbeatRecord) -> Result<Option<HeartbeatRecord>, StorageError> {
        let mut heartbeats = self.heartbeats.write().await;
        Ok(heartbeats.insert(row.kiosk_id.clone(), row))
    }

    async fn get(&self, kiosk_id: &str) -> Result<Option<HeartbeatRecord>, StorageError> {
        let heartbeats = self.heartbeats.read().await;
        Ok(heartbeats.get(kiosk_id).cloned())
    }

    async fn list_by_status(&self, status: KioskStatus) -> Result<Vec<HeartbeatRecord>, StorageError> {
        let heartbeats = self.heartbeats.read().await;
        Ok(heartbeats.values().filter(|h| h.status == status).cloned().collect())
    }

    async fn transition_offline_batch(&self, cutoff: DateTime<Utc>) -> Result<Vec<HeartbeatRecord>, StorageError> {
        let mut heartbeats = self.heartbeats.write().await;
        let mut transitioned = Vec::new();
        for h in heartbeats.values_mut() {
            if h.status == KioskStatus::Online && h.last_seen < cutoff {
                let pre = h.clone();
                h.status = KioskStatus::Offline;
                transitioned.push(pre);
            }
        }
        Ok(transitioned)
    }
}

fn now() -> DateTime<Utc> {
    Utc::now()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::types::{CommandStatus, Field, LockerStatus};

    fn locker(kiosk: &str, id: i32) -> LockerRecord {
        LockerRecord {
            kiosk_id: kiosk.to_owned(),
            locker_id: id,
            status: LockerStatus::Free,
            owner_type: None,
            owner_key: None,
            reserved_at: None,
            owned_at: None,
            is_vip: false,
            display_name: None,
            version: 1,
            updated_at: now(),
        }
    }

    #[tokio::test]
    async fn provision_then_get_roundtrip() {
        let store = MemoryStore::new();
        store.provision(locker("K1", 5)).await.unwrap();
        let row = store.get("K1", 5).await.unwrap().unwrap();
        assert_eq!(row.status, LockerStatus::Free);
    }

    #[tokio::test]
    async fn cas_update_rejects_stale_version() {
        let store = MemoryStore::new();
        store.provision(locker("K1", 5)).await.unwrap();
        let patch = LockerPatch {
            status: LockerStatus::Reserved,
            owner_type: Field::Set(OwnerType::Rfid),
            owner_key: Field::Set("AABB".to_owned()),
            reserved_at: Field::Set(now()),
            owned_at: Field::Unchanged,
        };
        let outcome = store.cas_update("K1", 5, 999, patch).await.unwrap();
        assert!(matches!(outcome, CasOutcome::Conflict));
    }

    #[tokio::test]
    async fn cas_update_succeeds_and_bumps_version() {
        let store = MemoryStore::new();
        store.provision(locker("K1", 5)).await.unwrap();
        let patch = LockerPatch {
            status: LockerStatus::Reserved,
            owner_type: Field::Set(OwnerType::Rfid),
            owner_key: Field::Set("AABB".to_owned()),
            reserved_at: Field::Set(now()),
            owned_at: Field::Unchanged,
        };
        let outcome = store.cas_update("K1", 5, 1, patch).await.unwrap();
        let CasOutcome::Updated(row) = outcome else {
            unreachable!("expected update");
        };
        assert_eq!(row.version, 2);
        assert_eq!(row.status, LockerStatus::Reserved);
    }

    #[tokio::test]
    async fn claim_only_succeeds_once() {
        let store = MemoryStore::new();
        let id = uuid::Uuid::new_v4();
        store
            .enqueue(CommandRecord {
                command_id: id,
                kiosk_id: "K1".to_owned(),
                payload: crate::types::CommandPayload::ClearQueue,
                status: CommandStatus::Pending,
                retry_count: 0,
                max_retries: 2,
                next_attempt_at: now(),
                last_error: None,
                created_at: now(),
                executed_at: None,
                completed_at: None,
            })
            .await
            .unwrap();

        assert!(store.claim(id).await.unwrap());
        assert!(!store.claim(id).await.unwrap());
    }

    #[tokio::test]
    async fn anonymize_is_idempotent() {
        let value = anonymize_value("AABB1122", "pepper");
        let twice = anonymize_value(&value, "pepper");
        assert_eq!(value, twice);
    }
}
