//! Event log.
//!
//! Every notable fleet action — RFID taps, staff overrides, kiosk
//! online/offline transitions, rate-limit blocks, zone changes, admin resets
//! — is appended here as an immutable row. The payload is a tagged enum
//! rather than a free-form JSON blob: adding a new event type means adding a
//! variant, and validation is exhaustive pattern matching instead of a
//! runtime schema registry.
//!
//! PII fields (`rfid_card`, `device_id`, `ip_address`) are salted-hashed once
//! they age past the retention window, via [`EventLog::apply_retention`].
//! `ip_address` and `user_agent` are additionally redacted at write time,
//! before the row ever reaches storage — see [`redact`].

use std::sync::Arc;

use chrono::{Duration, Utc};
use fleetlock_storage::types::{EventRecord, NewEventRecord};
use fleetlock_storage::{EventFilter, EventStore};
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::error::EventError;
use crate::locker::ReleaseMethod;

/// The structured body of an event row. The variant name is the event's
/// `event_type` discriminant stored alongside it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum EventPayload {
    RfidAssign,
    RfidRelease { release_method: ReleaseMethod },
    QrAssign,
    QrRelease { release_method: ReleaseMethod },
    StaffForceTransition { reason: String, forced: bool },
    KioskOnline { previous_status: String },
    KioskOffline { offline_duration_ms: i64 },
    SystemRestarted { cleared_commands: u64 },
    RateLimitBlocked { dimension: String },
    ZoneExtended { zone: String, lockers_added: u32 },
    AdminReset { scope: String },
}

impl EventPayload {
    /// Whether this event type requires a `staff_user` to be present —
    /// enforced at validation time, not by the storage layer.
    #[must_use]
    pub fn requires_staff_user(&self) -> bool {
        matches!(self, EventPayload::StaffForceTransition { .. } | EventPayload::AdminReset { .. })
    }

    /// Staff-attributed event types are retained under the longer
    /// `audit_retention_days` window (spec §4.6); everything else falls
    /// under the shorter `event_retention_days` window.
    #[must_use]
    pub fn is_audit(&self) -> bool {
        self.requires_staff_user()
    }

    /// The `event_type` discriminant for the variants of this payload, in
    /// the same `snake_case` form serialized onto the stored row.
    #[must_use]
    pub fn all_type_names() -> &'static [&'static str] {
        &[
            "rfid_assign",
            "rfid_release",
            "qr_assign",
            "qr_release",
            "staff_force_transition",
            "kiosk_online",
            "kiosk_offline",
            "system_restarted",
            "rate_limit_blocked",
            "zone_extended",
            "admin_reset",
        ]
    }

    /// Names of the audit (staff-attributed) event types.
    #[must_use]
    pub fn audit_type_names() -> &'static [&'static str] {
        &["staff_force_transition", "admin_reset"]
    }
}

/// Retention and redaction tunables.
#[derive(Debug, Clone)]
pub struct EventConfig {
    /// Non-audit events older than this are deleted outright (spec
    /// `event_retention_days`, default 30).
    pub event_retention: Duration,
    /// Staff-attributed audit events older than this are deleted outright
    /// (spec `audit_retention_days`, default 90).
    pub audit_retention: Duration,
    /// Events older than this (shorter than either retention window) are
    /// hashed in place rather than deleted, so an audit trail survives
    /// without its PII.
    pub anonymize_after: Duration,
    /// Salt mixed into the anonymization hash. Not a secret key — just
    /// prevents trivial rainbow-table correlation across deployments.
    pub anonymize_salt: String,
}

impl Default for EventConfig {
    fn default() -> Self {
        Self {
            event_retention: Duration::days(30),
            audit_retention: Duration::days(90),
            anonymize_after: Duration::days(7),
            anonymize_salt: "fleetlock-default-salt".to_owned(),
        }
    }
}

/// Append-only log of fleet activity.
pub struct EventLog {
    store: Arc<dyn EventStore>,
    config: EventConfig,
}

impl EventLog {
    #[must_use]
    pub fn new(store: Arc<dyn EventStore>, config: EventConfig) -> Self {
        Self { store, config }
    }

    /// Validate and append an event.
    ///
    /// Best-effort: a logging failure here must never block the caller's
    /// primary operation (locker transition, queue dispatch, etc.), so this
    /// returns nothing and logs a warning on error rather than propagating.
    /// Use [`EventLog::try_record`] where the caller genuinely needs to know.
    pub async fn record(&self, event: NewEventRecord) {
        if let Err(e) = self.try_record(event).await {
            error!(error = %e, "failed to append event");
        }
    }

    /// Validate and append an event, surfacing failures to the caller.
    ///
    /// # Errors
    ///
    /// - [`EventError::Validation`] if `details` doesn't deserialize into a
    ///   known [`EventPayload`] variant.
    /// - [`EventError::MissingField`] if a staff-attributed event type is
    ///   missing `staff_user`.
    /// - [`EventError::Storage`] if the append fails.
    pub async fn try_record(&self, event: NewEventRecord) -> Result<EventRecord, EventError> {
        let payload: EventPayload =
            serde_json::from_value(event.details.clone()).map_err(|e| EventError::Validation {
                event_type: event.event_type.clone(),
                reason: e.to_string(),
            })?;

        if payload.requires_staff_user() && event.staff_user.is_none() {
            return Err(EventError::MissingField {
                event_type: "staff_attributed",
                field: "staff_user",
            });
        }

        let event = redact(event);
        let record = self.store.append(event).await?;
        info!(event_type = %record.event_type, id = record.id, "event recorded");
        Ok(record)
    }

    /// Query events for the audit reporting API.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::Storage`] if the query fails.
    pub async fn query(&self, filter: EventFilter) -> Result<Vec<EventRecord>, EventError> {
        Ok(self.store.query(filter).await?)
    }

    /// Anonymize events older than the configured window, then delete
    /// non-audit events older than `event_retention` and audit events older
    /// than the (longer) `audit_retention`. Driven by the server's
    /// background retention loop.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::Storage`] if any pass fails.
    pub async fn apply_retention(&self) -> Result<(u64, u64), EventError> {
        let anonymize_cutoff = Utc::now() - self.config.anonymize_after;
        let anonymized = self
            .store
            .anonymize_older_than(anonymize_cutoff, &self.config.anonymize_salt)
            .await?;

        let audit_types: Vec<String> =
            EventPayload::audit_type_names().iter().map(|s| (*s).to_owned()).collect();
        let non_audit_types: Vec<String> = EventPayload::all_type_names()
            .iter()
            .filter(|t| !audit_types.iter().any(|a| a == *t))
            .map(|s| (*s).to_owned())
            .collect();

        let deleted_non_audit = self
            .store
            .delete_older_than(Utc::now() - self.config.event_retention, Some(&non_audit_types))
            .await?;
        let deleted_audit = self
            .store
            .delete_older_than(Utc::now() - self.config.audit_retention, Some(&audit_types))
            .await?;
        let deleted = deleted_non_audit + deleted_audit;

        if anonymized > 0 || deleted > 0 {
            info!(anonymized, deleted, "event retention pass complete");
        }
        Ok((anonymized, deleted))
    }
}

/// Write-time PII redaction, applied before a row reaches storage (spec
/// §4.6). Distinct from [`EventLog::apply_retention`]'s salted anonymization
/// of aged rows: this runs on every write, unconditionally, and uses an
/// unsalted hash for `ip_address` so it never needs the retention salt.
fn redact(mut event: NewEventRecord) -> NewEventRecord {
    if let Some(hash) = event.device_hash.take() {
        event.device_id = Some(hash);
    }

    event.ip_address = event.ip_address.as_deref().map(hash_ip);

    const MAX_USER_AGENT_LEN: usize = 100;
    event.user_agent = event.user_agent.take().map(|ua| {
        if ua.chars().count() > MAX_USER_AGENT_LEN {
            let truncated: String = ua.chars().take(MAX_USER_AGENT_LEN).collect();
            format!("{truncated}...")
        } else {
            ua
        }
    });

    event
}

/// Deterministic, unsalted SHA-256 hash of a raw IP. Unsalted (unlike the
/// retention-time `anon_`-prefixed hash in `fleetlock-storage::memory`) so
/// the same IP always redacts to the same value without needing the
/// anonymization salt at write time; the `iphash_` prefix keeps the two
/// schemes visually distinct in stored rows.
fn hash_ip(ip: &str) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(ip.as_bytes());
    let digest = hasher.finalize();
    format!("iphash_{}", hex::encode(&digest[..8]))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use fleetlock_storage::MemoryStore;

    fn log() -> EventLog {
        EventLog::new(Arc::new(MemoryStore::new()), EventConfig::default())
    }

    #[tokio::test]
    async fn staff_event_without_staff_user_is_rejected() {
        let log = log();
        let err = log
            .try_record(NewEventRecord {
                timestamp: Utc::now(),
                kiosk_id: Some("K1".to_owned()),
                locker_id: Some(1),
                event_type: "staff_force_transition".to_owned(),
                rfid_card: None,
                device_id: None,
                staff_user: None,
                ip_address: None,
                user_agent: None,
                device_hash: None,
                details: serde_json::to_value(EventPayload::StaffForceTransition {
                    reason: "lost card".to_owned(),
                    forced: true,
                })
                .unwrap(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, EventError::MissingField { .. }));
    }

    #[tokio::test]
    async fn staff_event_with_staff_user_is_accepted() {
        let log = log();
        let record = log
            .try_record(NewEventRecord {
                timestamp: Utc::now(),
                kiosk_id: Some("K1".to_owned()),
                locker_id: Some(1),
                event_type: "staff_force_transition".to_owned(),
                rfid_card: None,
                device_id: None,
                staff_user: Some("alice".to_owned()),
                ip_address: None,
                user_agent: None,
                device_hash: None,
                details: serde_json::to_value(EventPayload::StaffForceTransition {
                    reason: "lost card".to_owned(),
                    forced: true,
                })
                .unwrap(),
            })
            .await
            .unwrap();
        assert_eq!(record.event_type, "staff_force_transition");
    }

    #[tokio::test]
    async fn query_filters_by_kiosk() {
        let log = log();
        log.record(NewEventRecord {
            timestamp: Utc::now(),
            kiosk_id: Some("K1".to_owned()),
            locker_id: Some(1),
            event_type: "rfid_assign".to_owned(),
            rfid_card: Some("AABB".to_owned()),
            device_id: None,
            staff_user: None,
            ip_address: None,
            user_agent: None,
            device_hash: None,
            details: serde_json::to_value(EventPayload::RfidAssign).unwrap(),
        })
        .await;
        log.record(NewEventRecord {
            timestamp: Utc::now(),
            kiosk_id: Some("K2".to_owned()),
            locker_id: Some(1),
            event_type: "rfid_assign".to_owned(),
            rfid_card: Some("CCDD".to_owned()),
            device_id: None,
            staff_user: None,
            ip_address: None,
            user_agent: None,
            device_hash: None,
            details: serde_json::to_value(EventPayload::RfidAssign).unwrap(),
        })
        .await;

        let filter = EventFilter { kiosk_id: Some("K1".to_owned()), ..Default::default() };
        let rows = log.query(filter).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].kiosk_id.as_deref(), Some("K1"));
    }

    #[tokio::test]
    async fn invalid_details_are_rejected_not_coerced() {
        let log = log();
        let err = log
            .try_record(NewEventRecord {
                timestamp: Utc::now(),
                kiosk_id: Some("K1".to_owned()),
                locker_id: Some(1),
                event_type: "rfid_assign".to_owned(),
                rfid_card: Some("AABB".to_owned()),
                device_id: None,
                staff_user: None,
                ip_address: None,
                user_agent: None,
                device_hash: None,
                details: serde_json::json!({"not_a_real_event_type": true}),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, EventError::Validation { .. }));
    }

    #[tokio::test]
    async fn write_path_redacts_ip_user_agent_and_device_hash() {
        let log = log();
        let record = log
            .try_record(NewEventRecord {
                timestamp: Utc::now(),
                kiosk_id: Some("K1".to_owned()),
                locker_id: Some(1),
                event_type: "qr_assign".to_owned(),
                rfid_card: None,
                device_id: Some("raw-device-id".to_owned()),
                staff_user: None,
                ip_address: Some("203.0.113.42".to_owned()),
                user_agent: Some("x".repeat(150)),
                device_hash: Some("hashed-device-id".to_owned()),
                details: serde_json::to_value(EventPayload::QrAssign).unwrap(),
            })
            .await
            .unwrap();

        assert_eq!(record.device_id.as_deref(), Some("hashed-device-id"));
        let ip = record.ip_address.expect("ip_address redacted");
        assert_ne!(ip, "203.0.113.42");
        assert!(ip.starts_with("iphash_"));
        let ua = record.user_agent.expect("user_agent redacted");
        assert_eq!(ua.chars().count(), 103);
        assert!(ua.ends_with("..."));
    }
}
