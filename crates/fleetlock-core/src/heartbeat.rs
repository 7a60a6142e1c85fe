//! Heartbeat manager.
//!
//! Kiosks post a heartbeat on a fixed interval; this tracks per-kiosk
//! liveness and detects two kinds of transition a heartbeat alone can't tell
//! apart without history: going offline (no heartbeat within the threshold)
//! and restarting (heartbeat `version` resets or jumps backward), the latter
//! of which invalidates any command still queued from before the restart.

use std::sync::Arc;

use chrono::{Duration, Utc};
use fleetlock_storage::types::{HeartbeatRecord, KioskStatus, NewEventRecord};
use fleetlock_storage::{CommandQueueStore, HeartbeatStore};
use tracing::{info, warn};

use crate::error::HeartbeatError;
use crate::events::{EventLog, EventPayload};

/// Tunables for the heartbeat manager.
#[derive(Debug, Clone)]
pub struct HeartbeatConfig {
    /// A kiosk with no heartbeat within this window is marked `Offline` on
    /// the next cleanup tick.
    pub offline_threshold: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self { offline_threshold: Duration::seconds(30) }
    }
}

/// Tracks kiosk liveness and reacts to restarts.
pub struct HeartbeatManager {
    store: Arc<dyn HeartbeatStore>,
    queue_store: Arc<dyn CommandQueueStore>,
    events: Arc<EventLog>,
    config: HeartbeatConfig,
}

impl HeartbeatManager {
    #[must_use]
    pub fn new(
        store: Arc<dyn HeartbeatStore>,
        queue_store: Arc<dyn CommandQueueStore>,
        events: Arc<EventLog>,
        config: HeartbeatConfig,
    ) -> Self {
        Self { store, queue_store, events, config }
    }

    /// Record a heartbeat from a kiosk.
    ///
    /// If the kiosk was previously `Offline`, emits `kiosk_online`. If the
    /// posted `version` or `hardware_id` differs from what's on record,
    /// treats it as a restart: clears any pending commands, since firmware
    /// that restarted never received them.
    ///
    /// # Errors
    ///
    /// Returns [`HeartbeatError::Storage`] if the upsert or follow-up writes
    /// fail.
    pub async fn heartbeat(&self, row: HeartbeatRecord) -> Result<(), HeartbeatError> {
        let previous = self.store.upsert(row.clone()).await?;

        match previous {
            None => {
                info!(kiosk_id = %row.kiosk_id, "kiosk seen for the first time");
            }
            Some(prev) => {
                // Restart detection runs before the online transition is
                // emitted: a kiosk that comes back with a new version or
                // hardware id never received whatever was queued for its
                // previous incarnation.
                if row.version != prev.version || row.hardware_id != prev.hardware_id {
                    warn!(
                        kiosk_id = %row.kiosk_id,
                        prev_version = prev.version,
                        new_version = row.version,
                        "kiosk restart detected"
                    );
                    let cleared = self.queue_store.clear_pending(&row.kiosk_id).await?;
                    self.events
                        .record(NewEventRecord {
                            timestamp: Utc::now(),
                            kiosk_id: Some(row.kiosk_id.clone()),
                            locker_id: None,
                            event_type: "system_restarted".to_owned(),
                            rfid_card: None,
                            device_id: None,
                            staff_user: None,
                            ip_address: None,
                            user_agent: None,
                            device_hash: None,
                            details: serde_json::to_value(EventPayload::SystemRestarted {
                                cleared_commands: cleared,
                            })
                            .unwrap_or_default(),
                        })
                        .await;
                }

                if prev.status == KioskStatus::Offline && row.status == KioskStatus::Online {
                    self.events
                        .record(NewEventRecord {
                            timestamp: Utc::now(),
                            kiosk_id: Some(row.kiosk_id.clone()),
                            locker_id: None,
                            event_type: "kiosk_online".to_owned(),
                            rfid_card: None,
                            device_id: None,
                            staff_user: None,
                            ip_address: None,
                            user_agent: None,
                            device_hash: None,
                            details: serde_json::to_value(EventPayload::KioskOnline {
                                previous_status: "offline".to_owned(),
                            })
                            .unwrap_or_default(),
                        })
                        .await;
                    info!(kiosk_id = %row.kiosk_id, "kiosk back online");
                }
            }
        }

        Ok(())
    }

    /// Current heartbeat row for a kiosk, if one has ever been received.
    ///
    /// # Errors
    ///
    /// Returns [`HeartbeatError::Storage`] if the read fails.
    pub async fn get(&self, kiosk_id: &str) -> Result<Option<HeartbeatRecord>, HeartbeatError> {
        Ok(self.store.get(kiosk_id).await?)
    }

    /// Every kiosk currently in the given status.
    ///
    /// # Errors
    ///
    /// Returns [`HeartbeatError::Storage`] if the read fails.
    pub async fn list_by_status(&self, status: KioskStatus) -> Result<Vec<HeartbeatRecord>, HeartbeatError> {
        Ok(self.store.list_by_status(status).await?)
    }

    /// Transition every kiosk whose last heartbeat is older than the
    /// offline threshold, emitting `kiosk_offline` for each. Driven by the
    /// server's background cleanup loop.
    ///
    /// # Errors
    ///
    /// Returns [`HeartbeatError::Storage`] if the batch transition fails.
    pub async fn cleanup_tick(&self) -> Result<u64, HeartbeatError> {
        let cutoff = Utc::now() - self.config.offline_threshold;
        let transitioned = self.store.transition_offline_batch(cutoff).await?;
        let count = transitioned.len() as u64;

        for kiosk in transitioned {
            let offline_duration_ms = (Utc::now() - kiosk.last_seen).num_milliseconds();
            self.events
                .record(NewEventRecord {
                    timestamp: Utc::now(),
                    kiosk_id: Some(kiosk.kiosk_id.clone()),
                    locker_id: None,
                    event_type: "kiosk_offline".to_owned(),
                    rfid_card: None,
                    device_id: None,
                    staff_user: None,
                    ip_address: None,
                    user_agent: None,
                    device_hash: None,
                    details: serde_json::to_value(EventPayload::KioskOffline { offline_duration_ms })
                        .unwrap_or_default(),
                })
                .await;
            warn!(kiosk_id = %kiosk.kiosk_id, offline_duration_ms, "kiosk marked offline");
        }

        Ok(count)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use fleetlock_storage::types::CommandPayload;
    use fleetlock_storage::MemoryStore;

    fn manager() -> (HeartbeatManager, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let events = Arc::new(EventLog::new(store.clone(), crate::events::EventConfig::default()));
        let manager =
            HeartbeatManager::new(store.clone(), store.clone(), events, HeartbeatConfig::default());
        (manager, store)
    }

    fn row(kiosk_id: &str, version: i64, status: KioskStatus) -> HeartbeatRecord {
        HeartbeatRecord {
            kiosk_id: kiosk_id.to_owned(),
            zone: "zone-a".to_owned(),
            version,
            status,
            last_seen: Utc::now(),
            hardware_id: None,
            config_hash: None,
        }
    }

    #[tokio::test]
    async fn restart_detection_clears_pending_commands() {
        use fleetlock_storage::CommandQueueStore;
        let (manager, store) = manager();
        manager.heartbeat(row("K1", 5, KioskStatus::Online)).await.unwrap();

        store
            .enqueue(fleetlock_storage::types::CommandRecord {
                command_id: uuid::Uuid::new_v4(),
                kiosk_id: "K1".to_owned(),
                payload: CommandPayload::ClearQueue,
                status: fleetlock_storage::types::CommandStatus::Pending,
                retry_count: 0,
                max_retries: 1,
                next_attempt_at: Utc::now(),
                last_error: None,
                created_at: Utc::now(),
                executed_at: None,
                completed_at: None,
            })
            .await
            .unwrap();

        // Posted version is lower than stored version: restart.
        manager.heartbeat(row("K1", 1, KioskStatus::Online)).await.unwrap();

        assert_eq!(store.fetch_pending("K1", 10).await.unwrap().len(), 0);
    }

    #[tokio::test]
    async fn hardware_id_change_alone_triggers_restart_detection() {
        use fleetlock_storage::CommandQueueStore;
        let (manager, store) = manager();
        let mut first = row("K1", 5, KioskStatus::Online);
        first.hardware_id = Some("board-A".to_owned());
        manager.heartbeat(first).await.unwrap();

        store
            .enqueue(fleetlock_storage::types::CommandRecord {
                command_id: uuid::Uuid::new_v4(),
                kiosk_id: "K1".to_owned(),
                payload: CommandPayload::ClearQueue,
                status: fleetlock_storage::types::CommandStatus::Pending,
                retry_count: 0,
                max_retries: 1,
                next_attempt_at: Utc::now(),
                last_error: None,
                created_at: Utc::now(),
                executed_at: None,
                completed_at: None,
            })
            .await
            .unwrap();

        // Same version, different hardware_id: a board swap, still a restart.
        let mut second = row("K1", 5, KioskStatus::Online);
        second.hardware_id = Some("board-B".to_owned());
        manager.heartbeat(second).await.unwrap();

        assert_eq!(store.fetch_pending("K1", 10).await.unwrap().len(), 0);
    }

    #[tokio::test]
    async fn cleanup_tick_marks_stale_kiosks_offline() {
        let (manager, store) = manager();
        let mut stale = row("K1", 1, KioskStatus::Online);
        stale.last_seen = Utc::now() - Duration::hours(1);
        store.upsert(stale).await.unwrap();

        let count = manager.cleanup_tick().await.unwrap();
        assert_eq!(count, 1);
        let after = manager.get("K1").await.unwrap().unwrap();
        assert_eq!(after.status, KioskStatus::Offline);
    }
}
