//! Locker state machine.
//!
//! Every locker transition goes through [`LockerStateMachine`], which reads
//! the current row, checks the transition is legal, and writes back through
//! [`LockerStore::cas_update`] guarded by the version it read. A zero-row
//! update means a concurrent writer won; this layer never retries
//! internally — the caller (kiosk firmware, staff app, command executor)
//! decides whether to re-read and try again.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use fleetlock_storage::types::{
    CasOutcome, Field, LockerPatch, LockerRecord, LockerStatus, NewEventRecord, OwnerType,
};
use fleetlock_storage::LockerStore;
use tracing::{info, warn};

use crate::error::LockerError;
use crate::events::{EventLog, EventPayload};
use crate::notify::{LockerUpdate, NotificationBroadcaster};

/// Tunables for the locker state machine.
#[derive(Debug, Clone)]
pub struct LockerConfig {
    /// How long a `Reserved` locker may sit unconfirmed before the cleanup
    /// tick releases it back to `Free`.
    pub reserve_ttl: Duration,
}

impl Default for LockerConfig {
    fn default() -> Self {
        Self { reserve_ttl: Duration::seconds(90) }
    }
}

/// Coordinates locker ownership across kiosk firmware, RFID scans, the staff
/// app, and background cleanup.
pub struct LockerStateMachine {
    store: Arc<dyn LockerStore>,
    events: Arc<EventLog>,
    notify: Arc<NotificationBroadcaster>,
    config: LockerConfig,
}

impl LockerStateMachine {
    #[must_use]
    pub fn new(
        store: Arc<dyn LockerStore>,
        events: Arc<EventLog>,
        notify: Arc<NotificationBroadcaster>,
        config: LockerConfig,
    ) -> Self {
        Self { store, events, notify, config }
    }

    /// Reserve a free locker for an RFID card.
    ///
    /// Scans for any locker already held by this card at the kiosk first
    /// (one-card-one-locker); the scan-then-write is not atomic, so a
    /// concurrent assign for the same card can still race here — the
    /// cleanup tick reconciles any resulting double-hold.
    ///
    /// `owner_type` distinguishes an RFID card from a QR-code device
    /// fingerprint; both credential kinds share this one assignment path
    /// per spec §3's data model (`owner_type` ∈ {rfid, qr_device}).
    ///
    /// # Errors
    ///
    /// - [`LockerError::NotFound`] if the locker doesn't exist.
    /// - [`LockerError::OwnerAlreadyHolding`] if this owner already holds
    ///   another locker at the kiosk.
    /// - [`LockerError::IllegalTransition`] if the locker isn't `Free`.
    /// - [`LockerError::VersionConflict`] if a concurrent writer won.
    pub async fn assign(
        &self,
        kiosk_id: &str,
        locker_id: i32,
        owner_type: OwnerType,
        owner_key: &str,
    ) -> Result<LockerRecord, LockerError> {
        let held = self.store.find_held_by_owner(kiosk_id, owner_type, owner_key).await?;
        if let Some(existing) = held.into_iter().find(|r| r.locker_id != locker_id) {
            return Err(LockerError::OwnerAlreadyHolding {
                kiosk_id: kiosk_id.to_owned(),
                owner_key: owner_key.to_owned(),
                existing_locker_id: existing.locker_id,
            });
        }

        let current = self.get_or_not_found(kiosk_id, locker_id).await?;
        if current.is_vip {
            return Err(LockerError::VipLocker { kiosk_id: kiosk_id.to_owned(), locker_id });
        }
        if current.status != LockerStatus::Free {
            return Err(LockerError::IllegalTransition {
                kiosk_id: kiosk_id.to_owned(),
                locker_id,
                from: current.status,
                attempted: "assign",
            });
        }

        let patch = LockerPatch {
            status: LockerStatus::Reserved,
            owner_type: Field::Set(owner_type),
            owner_key: Field::Set(owner_key.to_owned()),
            reserved_at: Field::Set(Utc::now()),
            owned_at: Field::Unchanged,
        };

        let updated = self.apply_cas(kiosk_id, locker_id, current.version, patch).await?;

        let (event_type, rfid_card, device_id, details) = match owner_type {
            OwnerType::Rfid => (
                "rfid_assign",
                Some(owner_key.to_owned()),
                None,
                EventPayload::RfidAssign,
            ),
            OwnerType::QrDevice => (
                "qr_assign",
                None,
                Some(owner_key.to_owned()),
                EventPayload::QrAssign,
            ),
        };
        self.events
            .record(NewEventRecord {
                timestamp: Utc::now(),
                kiosk_id: Some(kiosk_id.to_owned()),
                locker_id: Some(locker_id),
                event_type: event_type.to_owned(),
                rfid_card,
                device_id,
                staff_user: None,
                ip_address: None,
                user_agent: None,
                device_hash: None,
                details: serde_json::to_value(details).unwrap_or_default(),
            })
            .await;
        self.publish(kiosk_id, &updated);

        info!(kiosk_id, locker_id, ?owner_type, "locker reserved");
        Ok(updated)
    }

    /// Confirm a reservation into ownership (door closed / session started).
    ///
    /// # Errors
    ///
    /// - [`LockerError::NotFound`] if the locker doesn't exist.
    /// - [`LockerError::IllegalTransition`] if not currently `Reserved`.
    /// - [`LockerError::VersionConflict`] if a concurrent writer won.
    pub async fn confirm(&self, kiosk_id: &str, locker_id: i32) -> Result<LockerRecord, LockerError> {
        let current = self.get_or_not_found(kiosk_id, locker_id).await?;
        if current.status != LockerStatus::Reserved {
            return Err(LockerError::IllegalTransition {
                kiosk_id: kiosk_id.to_owned(),
                locker_id,
                from: current.status,
                attempted: "confirm",
            });
        }

        let patch = LockerPatch {
            status: LockerStatus::Owned,
            owner_type: Field::Unchanged,
            owner_key: Field::Unchanged,
            reserved_at: Field::Unchanged,
            owned_at: Field::Set(Utc::now()),
        };

        let updated = self.apply_cas(kiosk_id, locker_id, current.version, patch).await?;
        self.publish(kiosk_id, &updated);
        info!(kiosk_id, locker_id, "locker owned");
        Ok(updated)
    }

    /// Release a locker back to `Free`, by RFID tap-out or staff/admin action.
    ///
    /// Releasing an already-`Free` locker is a no-op that returns the current
    /// row unchanged rather than an error — `release` is idempotent, so a
    /// retried tap-out after a dropped response can't fail.
    ///
    /// # Errors
    ///
    /// - [`LockerError::NotFound`] if the locker doesn't exist.
    /// - [`LockerError::IllegalTransition`] if `Blocked` or `Error`.
    /// - [`LockerError::VersionConflict`] if a concurrent writer won.
    pub async fn release(
        &self,
        kiosk_id: &str,
        locker_id: i32,
        release_method: ReleaseMethod,
    ) -> Result<LockerRecord, LockerError> {
        let current = self.get_or_not_found(kiosk_id, locker_id).await?;
        if current.status == LockerStatus::Free {
            return Ok(current);
        }
        if !matches!(current.status, LockerStatus::Reserved | LockerStatus::Owned) {
            return Err(LockerError::IllegalTransition {
                kiosk_id: kiosk_id.to_owned(),
                locker_id,
                from: current.status,
                attempted: "release",
            });
        }

        let patch = LockerPatch {
            status: LockerStatus::Free,
            owner_type: Field::Clear,
            owner_key: Field::Clear,
            reserved_at: Field::Clear,
            owned_at: Field::Clear,
        };

        let updated = self.apply_cas(kiosk_id, locker_id, current.version, patch).await?;

        let (event_type, rfid_card, device_id, details) = match current.owner_type {
            Some(OwnerType::QrDevice) => (
                "qr_release",
                None,
                current.owner_key.clone(),
                EventPayload::QrRelease { release_method },
            ),
            _ => (
                "rfid_release",
                current.owner_key.clone(),
                None,
                EventPayload::RfidRelease { release_method },
            ),
        };
        self.events
            .record(NewEventRecord {
                timestamp: Utc::now(),
                kiosk_id: Some(kiosk_id.to_owned()),
                locker_id: Some(locker_id),
                event_type: event_type.to_owned(),
                rfid_card,
                device_id,
                staff_user: None,
                ip_address: None,
                user_agent: None,
                device_hash: None,
                details: serde_json::to_value(details).unwrap_or_default(),
            })
            .await;
        self.publish(kiosk_id, &updated);

        info!(kiosk_id, locker_id, ?release_method, "locker released");
        Ok(updated)
    }

    /// Staff-initiated forced transition, bypassing the normal precondition
    /// (e.g. force-opening an `Owned` locker for a lost card).
    ///
    /// # Errors
    ///
    /// - [`LockerError::NotFound`] if the locker doesn't exist.
    /// - [`LockerError::VersionConflict`] if a concurrent writer won.
    pub async fn force_transition(
        &self,
        kiosk_id: &str,
        locker_id: i32,
        target: LockerStatus,
        staff_user: &str,
        reason: &str,
    ) -> Result<LockerRecord, LockerError> {
        let current = self.get_or_not_found(kiosk_id, locker_id).await?;

        let patch = LockerPatch {
            status: target,
            owner_type: if target == LockerStatus::Free { Field::Clear } else { Field::Unchanged },
            owner_key: if target == LockerStatus::Free { Field::Clear } else { Field::Unchanged },
            reserved_at: if target == LockerStatus::Free { Field::Clear } else { Field::Unchanged },
            owned_at: Field::Unchanged,
        };

        let updated = self.apply_cas(kiosk_id, locker_id, current.version, patch).await?;

        self.events
            .record(NewEventRecord {
                timestamp: Utc::now(),
                kiosk_id: Some(kiosk_id.to_owned()),
                locker_id: Some(locker_id),
                event_type: "staff_force_transition".to_owned(),
                rfid_card: None,
                device_id: None,
                staff_user: Some(staff_user.to_owned()),
                ip_address: None,
                user_agent: None,
                device_hash: None,
                details: serde_json::to_value(EventPayload::StaffForceTransition {
                    reason: reason.to_owned(),
                    forced: true,
                })
                .unwrap_or_default(),
            })
            .await;
        self.publish(kiosk_id, &updated);

        warn!(kiosk_id, locker_id, staff_user, reason, "locker force-transitioned by staff");
        Ok(updated)
    }

    /// Block a locker from further assignment (maintenance / hardware fault).
    ///
    /// # Errors
    ///
    /// - [`LockerError::NotFound`] if the locker doesn't exist.
    /// - [`LockerError::VersionConflict`] if a concurrent writer won.
    pub async fn block(&self, kiosk_id: &str, locker_id: i32) -> Result<LockerRecord, LockerError> {
        let current = self.get_or_not_found(kiosk_id, locker_id).await?;
        let patch = LockerPatch {
            status: LockerStatus::Blocked,
            owner_type: Field::Unchanged,
            owner_key: Field::Unchanged,
            reserved_at: Field::Unchanged,
            owned_at: Field::Unchanged,
        };
        let updated = self.apply_cas(kiosk_id, locker_id, current.version, patch).await?;
        self.publish(kiosk_id, &updated);
        Ok(updated)
    }

    /// Unblock a locker back to `Free`.
    ///
    /// # Errors
    ///
    /// - [`LockerError::NotFound`] if the locker doesn't exist.
    /// - [`LockerError::VersionConflict`] if a concurrent writer won.
    pub async fn unblock(&self, kiosk_id: &str, locker_id: i32) -> Result<LockerRecord, LockerError> {
        let current = self.get_or_not_found(kiosk_id, locker_id).await?;
        if current.status != LockerStatus::Blocked {
            return Err(LockerError::IllegalTransition {
                kiosk_id: kiosk_id.to_owned(),
                locker_id,
                from: current.status,
                attempted: "unblock",
            });
        }
        let patch = LockerPatch {
            status: LockerStatus::Free,
            owner_type: Field::Clear,
            owner_key: Field::Clear,
            reserved_at: Field::Clear,
            owned_at: Field::Clear,
        };
        let updated = self.apply_cas(kiosk_id, locker_id, current.version, patch).await?;
        self.publish(kiosk_id, &updated);
        Ok(updated)
    }

    /// Release every `Reserved` locker whose TTL has elapsed. Driven by the
    /// server's background cleanup loop, not by a per-locker timer.
    ///
    /// # Errors
    ///
    /// Returns [`LockerError::Storage`] if the batch update fails.
    pub async fn cleanup_expired_reservations(&self) -> Result<Vec<LockerRecord>, LockerError> {
        let cutoff = Utc::now() - self.config.reserve_ttl;
        let expired = self.store.batch_expire_reservations(cutoff).await?;
        for row in &expired {
            self.publish(&row.kiosk_id, row);
        }
        if !expired.is_empty() {
            info!(count = expired.len(), "expired reservations released");
        }
        Ok(expired)
    }

    /// Restore the one-card-one-locker invariant (spec §4.1, §8 invariant 2)
    /// for a kiosk. The assign scan-then-CAS isn't atomic, so a concurrent
    /// double-assign by the same card can leave it holding two lockers; this
    /// keeps the earliest hold and releases every later one. Driven by the
    /// same cleanup cadence as [`LockerStateMachine::cleanup_expired_reservations`],
    /// not its own timer.
    ///
    /// # Errors
    ///
    /// Returns [`LockerError::Storage`] if the listing read fails.
    pub async fn reconcile_owner_uniqueness(&self, kiosk_id: &str) -> Result<Vec<LockerRecord>, LockerError> {
        let lockers = self.store.list_by_kiosk(kiosk_id).await?;

        let mut held: HashMap<(OwnerType, String), Vec<LockerRecord>> = HashMap::new();
        for row in lockers.into_iter().filter(|r| matches!(r.status, LockerStatus::Reserved | LockerStatus::Owned)) {
            if let (Some(owner_type), Some(owner_key)) = (row.owner_type, row.owner_key.clone()) {
                held.entry((owner_type, owner_key)).or_default().push(row);
            }
        }

        let mut released = Vec::new();
        for (_, mut group) in held {
            if group.len() <= 1 {
                continue;
            }
            group.sort_by_key(|r| r.reserved_at.or(r.owned_at).unwrap_or(DateTime::<Utc>::MIN_UTC));
            for duplicate in group.into_iter().skip(1) {
                match self.release(kiosk_id, duplicate.locker_id, ReleaseMethod::AdminReset).await {
                    Ok(row) => released.push(row),
                    Err(LockerError::VersionConflict { .. }) => {
                        // Raced with something else that already moved it; next pass retries.
                    }
                    Err(e) => warn!(kiosk_id, locker_id = duplicate.locker_id, error = %e, "reconciliation release failed"),
                }
            }
        }

        if !released.is_empty() {
            warn!(kiosk_id, count = released.len(), "released duplicate-owner lockers during reconciliation");
        }
        Ok(released)
    }

    /// Look up a single locker's current state.
    ///
    /// # Errors
    ///
    /// Returns [`LockerError::Storage`] if the read fails, or
    /// [`LockerError::NotFound`] if the locker doesn't exist.
    pub async fn get(&self, kiosk_id: &str, locker_id: i32) -> Result<LockerRecord, LockerError> {
        self.get_or_not_found(kiosk_id, locker_id).await
    }

    /// List every locker provisioned for a kiosk.
    ///
    /// # Errors
    ///
    /// Returns [`LockerError::Storage`] if the read fails.
    pub async fn list_by_kiosk(&self, kiosk_id: &str) -> Result<Vec<LockerRecord>, LockerError> {
        Ok(self.store.list_by_kiosk(kiosk_id).await?)
    }

    async fn get_or_not_found(&self, kiosk_id: &str, locker_id: i32) -> Result<LockerRecord, LockerError> {
        self.store
            .get(kiosk_id, locker_id)
            .await?
            .ok_or_else(|| LockerError::NotFound { kiosk_id: kiosk_id.to_owned(), locker_id })
    }

    async fn apply_cas(
        &self,
        kiosk_id: &str,
        locker_id: i32,
        expected_version: i64,
        patch: LockerPatch,
    ) -> Result<LockerRecord, LockerError> {
        match self.store.cas_update(kiosk_id, locker_id, expected_version, patch).await? {
            CasOutcome::Updated(row) => Ok(row),
            CasOutcome::Conflict => {
                Err(LockerError::VersionConflict { kiosk_id: kiosk_id.to_owned(), locker_id })
            }
        }
    }

    fn publish(&self, kiosk_id: &str, row: &LockerRecord) {
        self.notify.publish(LockerUpdate {
            kiosk_id: kiosk_id.to_owned(),
            locker_id: row.locker_id,
            status: row.status,
            version: row.version,
        });
    }
}

/// How a locker came to be released, carried into the event log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReleaseMethod {
    RfidTapOut,
    StaffOverride,
    AdminReset,
    ReservationExpired,
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use fleetlock_storage::MemoryStore;

    fn machine() -> (LockerStateMachine, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let events = Arc::new(EventLog::new(store.clone(), crate::events::EventConfig::default()));
        let notify = Arc::new(NotificationBroadcaster::new(Default::default()));
        let machine = LockerStateMachine::new(store.clone(), events, notify, LockerConfig::default());
        (machine, store)
    }

    async fn provisioned(store: &MemoryStore, kiosk: &str, id: i32) {
        store
            .provision(LockerRecord {
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
                updated_at: Utc::now(),
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn assign_then_confirm_then_release() {
        let (machine, store) = machine();
        provisioned(&store, "K1", 1).await;

        let reserved = machine.assign("K1", 1, OwnerType::Rfid, "CARD-A").await.unwrap();
        assert_eq!(reserved.status, LockerStatus::Reserved);

        let owned = machine.confirm("K1", 1).await.unwrap();
        assert_eq!(owned.status, LockerStatus::Owned);

        let freed = machine.release("K1", 1, ReleaseMethod::RfidTapOut).await.unwrap();
        assert_eq!(freed.status, LockerStatus::Free);
        assert!(freed.owner_key.is_none());
    }

    #[tokio::test]
    async fn qr_device_assign_then_release_emits_qr_events() {
        let (machine, store) = machine();
        provisioned(&store, "K1", 1).await;

        let reserved = machine.assign("K1", 1, OwnerType::QrDevice, "DEVICE-HASH-1").await.unwrap();
        assert_eq!(reserved.owner_type, Some(OwnerType::QrDevice));
        assert_eq!(reserved.owner_key.as_deref(), Some("DEVICE-HASH-1"));

        let freed = machine.release("K1", 1, ReleaseMethod::RfidTapOut).await.unwrap();
        assert_eq!(freed.status, LockerStatus::Free);
    }

    #[tokio::test]
    async fn release_on_free_locker_is_idempotent_noop() {
        let (machine, store) = machine();
        provisioned(&store, "K1", 1).await;

        let first = machine.release("K1", 1, ReleaseMethod::RfidTapOut).await.unwrap();
        assert_eq!(first.status, LockerStatus::Free);
        assert_eq!(first.version, 1);

        let second = machine.release("K1", 1, ReleaseMethod::RfidTapOut).await.unwrap();
        assert_eq!(second.version, first.version);
    }

    #[tokio::test]
    async fn assign_rejects_double_hold_by_same_card() {
        let (machine, store) = machine();
        provisioned(&store, "K1", 1).await;
        provisioned(&store, "K1", 2).await;

        machine.assign("K1", 1, OwnerType::Rfid, "CARD-A").await.unwrap();
        let err = machine.assign("K1", 2, OwnerType::Rfid, "CARD-A").await.unwrap_err();
        assert!(matches!(err, LockerError::OwnerAlreadyHolding { .. }));
    }

    #[tokio::test]
    async fn assign_rejects_vip_locker_regardless_of_status() {
        let (machine, store) = machine();
        store
            .provision(LockerRecord {
                kiosk_id: "K1".to_owned(),
                locker_id: 9,
                status: LockerStatus::Free,
                owner_type: None,
                owner_key: None,
                reserved_at: None,
                owned_at: None,
                is_vip: true,
                display_name: None,
                version: 1,
                updated_at: Utc::now(),
            })
            .await
            .unwrap();

        let err = machine.assign("K1", 9, OwnerType::Rfid, "CARD-A").await.unwrap_err();
        assert!(matches!(err, LockerError::VipLocker { .. }));
    }

    #[tokio::test]
    async fn confirm_rejects_non_reserved_locker() {
        let (machine, store) = machine();
        provisioned(&store, "K1", 1).await;
        let err = machine.confirm("K1", 1).await.unwrap_err();
        assert!(matches!(err, LockerError::IllegalTransition { .. }));
    }

    #[tokio::test]
    async fn cleanup_releases_expired_reservations() {
        let (machine, store) = machine();
        provisioned(&store, "K1", 1).await;
        machine.assign("K1", 1, OwnerType::Rfid, "CARD-A").await.unwrap();

        // Force the reservation to look stale by constructing a machine with
        // a zero TTL — anything already reserved is immediately expired.
        let zero_ttl = LockerStateMachine::new(
            store.clone(),
            Arc::new(EventLog::new(store.clone(), crate::events::EventConfig::default())),
            Arc::new(NotificationBroadcaster::new(Default::default())),
            LockerConfig { reserve_ttl: Duration::seconds(-1) },
        );
        let expired = zero_ttl.cleanup_expired_reservations().await.unwrap();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].status, LockerStatus::Free);
    }

    #[tokio::test]
    async fn reconcile_releases_all_but_earliest_duplicate_hold() {
        let (machine, store) = machine();

        // Simulate the scan-then-CAS race producing two simultaneous holds
        // for the same card — something `assign` alone prevents, but which
        // can still happen across two concurrent callers (spec §4.1).
        store
            .provision(LockerRecord {
                kiosk_id: "K1".to_owned(),
                locker_id: 1,
                status: LockerStatus::Reserved,
                owner_type: Some(OwnerType::Rfid),
                owner_key: Some("CARD-A".to_owned()),
                reserved_at: Some(Utc::now() - Duration::seconds(10)),
                owned_at: None,
                is_vip: false,
                display_name: None,
                version: 1,
                updated_at: Utc::now(),
            })
            .await
            .unwrap();
        store
            .provision(LockerRecord {
                kiosk_id: "K1".to_owned(),
                locker_id: 2,
                status: LockerStatus::Reserved,
                owner_type: Some(OwnerType::Rfid),
                owner_key: Some("CARD-A".to_owned()),
                reserved_at: Some(Utc::now()),
                owned_at: None,
                is_vip: false,
                display_name: None,
                version: 1,
                updated_at: Utc::now(),
            })
            .await
            .unwrap();

        let released = machine.reconcile_owner_uniqueness("K1").await.unwrap();
        assert_eq!(released.len(), 1);
        assert_eq!(released[0].locker_id, 2);

        let held = store.find_held_by_owner("K1", OwnerType::Rfid, "CARD-A").await.unwrap();
        assert_eq!(held.len(), 1);
        assert_eq!(held[0].locker_id, 1);
    }
}
