//! Server configuration for `FleetLock`.
//!
//! Loads configuration from environment variables with the defaults spec'd
//! for each component. Every setting can be overridden via a `FLEETLOCK_*`
//! environment variable; unset variables fall back to the component
//! defaults defined alongside the component itself in `fleetlock-core`.

use std::collections::HashMap;
use std::net::SocketAddr;

use chrono::Duration;
use fleetlock_core::config::FleetConfig;
use fleetlock_core::heartbeat::HeartbeatConfig;
use fleetlock_core::locker::LockerConfig;
use fleetlock_core::events::EventConfig;
use fleetlock_core::queue::QueueConfig;
use fleetlock_core::ratelimit::{BucketPolicy, Dimension};
use fleetlock_core::zones::{self, RelayCard, ZoneConfig};
use tracing::warn;

/// Top-level server configuration: bind address, storage backend, and the
/// bundled [`FleetConfig`] handed to every `fleetlock-core` component.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind the HTTP listener to.
    pub bind_addr: SocketAddr,
    /// Storage backend selection.
    pub storage_backend: StorageBackendType,
    /// Log level filter (e.g., `info`, `debug`, `warn`).
    pub log_level: String,
    /// Component configuration for `fleetlock-core`.
    pub fleet: FleetConfig,
    /// Interval between heartbeat cleanup ticks (kiosk offline detection and
    /// stale-executor recovery share this cadence).
    pub heartbeat_interval: Duration,
    /// Interval between command queue poll/GC ticks.
    pub command_poll_interval: Duration,
    /// Whether the zone extension engine is active for this deployment.
    pub zones_enabled: bool,
}

/// Supported storage backend types.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageBackendType {
    /// In-memory (development and tests only, data lost on restart).
    Memory,
    /// PostgreSQL persistent storage.
    Postgres { url: String },
}

fn env_duration_ms(var: &str, default_ms: i64) -> Duration {
    std::env::var(var)
        .ok()
        .and_then(|v| v.parse::<i64>().ok())
        .map_or_else(|| Duration::milliseconds(default_ms), Duration::milliseconds)
}

fn env_duration_secs(var: &str, default_secs: i64) -> Duration {
    std::env::var(var)
        .ok()
        .and_then(|v| v.parse::<i64>().ok())
        .map_or_else(|| Duration::seconds(default_secs), Duration::seconds)
}

fn env_duration_days(var: &str, default_days: i64) -> Duration {
    std::env::var(var)
        .ok()
        .and_then(|v| v.parse::<i64>().ok())
        .map_or_else(|| Duration::days(default_days), Duration::days)
}

fn env_bool(var: &str, default: bool) -> bool {
    std::env::var(var).map_or(default, |v| v != "false" && v != "0")
}

fn env_f64(var: &str, default: f64) -> f64 {
    std::env::var(var).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_u32(var: &str, default: u32) -> u32 {
    std::env::var(var).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

/// Load the observed relay-card inventory from `FLEETLOCK_HARDWARE_JSON`, a
/// JSON array of [`RelayCard`]. Falls back to empty (no cards wired) and
/// logs a warning if the variable is unset or unparseable.
fn load_hardware() -> Vec<RelayCard> {
    let Ok(raw) = std::env::var("FLEETLOCK_HARDWARE_JSON") else {
        return Vec::new();
    };

    match serde_json::from_str::<Vec<RelayCard>>(&raw) {
        Ok(cards) => cards,
        Err(err) => {
            warn!(error = %err, "FLEETLOCK_HARDWARE_JSON is not a valid relay card list, ignoring");
            Vec::new()
        }
    }
}

/// Load the zone inventory from `FLEETLOCK_ZONES_JSON`, a JSON document
/// deserializing straight into [`ZoneConfig`]. Falls back to the empty
/// default (zones disabled in effect) and logs a warning if the variable is
/// unset, unparseable, or fails validation against `hardware` — a malformed
/// zone inventory should never keep the rest of the server from booting.
fn load_zone_config(hardware: &[RelayCard]) -> ZoneConfig {
    let Ok(raw) = std::env::var("FLEETLOCK_ZONES_JSON") else {
        return ZoneConfig::default();
    };

    let config = match serde_json::from_str::<ZoneConfig>(&raw) {
        Ok(config) => config,
        Err(err) => {
            warn!(error = %err, "FLEETLOCK_ZONES_JSON is not valid zone config JSON, ignoring");
            return ZoneConfig::default();
        }
    };

    if let Err(err) = zones::validate(&config, hardware) {
        warn!(error = %err, "FLEETLOCK_ZONES_JSON failed validation, ignoring");
        return ZoneConfig::default();
    }

    config
}

/// Load one dimension's bucket policy from its `FLEETLOCK_RATE_LIMIT_<DIM>_*`
/// variables, falling back to `default` for anything unset.
fn rate_limit_policy(prefix: &str, default: BucketPolicy) -> BucketPolicy {
    BucketPolicy {
        capacity: env_u32(&format!("FLEETLOCK_RATE_LIMIT_{prefix}_CAPACITY"), default.capacity),
        refill_per_second: env_f64(
            &format!("FLEETLOCK_RATE_LIMIT_{prefix}_REFILL_PER_SECOND"),
            default.refill_per_second,
        ),
        violations_to_block: env_u32(
            &format!("FLEETLOCK_RATE_LIMIT_{prefix}_VIOLATIONS_TO_BLOCK"),
            default.violations_to_block,
        ),
        violation_window: env_duration_secs(
            &format!("FLEETLOCK_RATE_LIMIT_{prefix}_VIOLATION_WINDOW_SECONDS"),
            default.violation_window.num_seconds(),
        ),
        block_duration: env_duration_secs(
            &format!("FLEETLOCK_RATE_LIMIT_{prefix}_BLOCK_DURATION_SECONDS"),
            default.block_duration.num_seconds(),
        ),
    }
}

impl ServerConfig {
    /// Load configuration from environment variables.
    ///
    /// Environment variables:
    /// - `PORT` — port to bind on (binds to `0.0.0.0`)
    /// - `FLEETLOCK_BIND_ADDR` — full bind address (overrides `PORT`, default: `127.0.0.1:8080`)
    /// - `FLEETLOCK_STORAGE` — `memory` or `postgres` (default: `memory`)
    /// - `DATABASE_URL` — PostgreSQL connection string (required when `FLEETLOCK_STORAGE=postgres`)
    /// - `FLEETLOCK_LOG_LEVEL` — log filter (default: `info`)
    /// - `FLEETLOCK_RESERVE_TTL_SECONDS` — reservation hold before auto-release (default: `90`)
    /// - `FLEETLOCK_OFFLINE_THRESHOLD_MS` — silence before a kiosk is marked offline (default: `30000`)
    /// - `FLEETLOCK_HEARTBEAT_INTERVAL_MS` — cleanup tick cadence (default: `10000`)
    /// - `FLEETLOCK_COMMAND_POLL_INTERVAL_MS` — queue GC tick cadence (default: `2000`)
    /// - `FLEETLOCK_STALE_COMMAND_THRESHOLD_MS` — executing-claim timeout before reclaim (default: `120000`)
    /// - `FLEETLOCK_EVENT_RETENTION_DAYS` / `FLEETLOCK_AUDIT_RETENTION_DAYS` — event log retention (default: `30` / `90`)
    /// - `FLEETLOCK_RATE_LIMIT_{IP,CARD,LOCKER,DEVICE}_*` — per-dimension token bucket policy
    /// - `FLEETLOCK_ZONES_ENABLED` — enable the zone extension engine (default: `false`)
    /// - `FLEETLOCK_HARDWARE_JSON` — observed relay-card inventory as a JSON array of
    ///   [`RelayCard`] (default: empty, no cards wired)
    /// - `FLEETLOCK_ZONES_JSON` — zone inventory as JSON, deserialized into
    ///   [`ZoneConfig`] and validated against the hardware inventory at startup
    ///   (default: empty, no zones configured)
    #[must_use]
    pub fn from_env() -> Self {
        // Priority: FLEETLOCK_BIND_ADDR > PORT > default 127.0.0.1:8080
        let bind_addr = if let Ok(addr) = std::env::var("FLEETLOCK_BIND_ADDR") {
            addr.parse().unwrap_or_else(|_| SocketAddr::from(([127, 0, 0, 1], 8080)))
        } else if let Ok(port_str) = std::env::var("PORT") {
            let port: u16 = port_str.parse().unwrap_or(8080);
            SocketAddr::from(([0, 0, 0, 0], port))
        } else {
            SocketAddr::from(([127, 0, 0, 1], 8080))
        };

        let storage_backend = match std::env::var("FLEETLOCK_STORAGE")
            .unwrap_or_else(|_| "memory".to_owned())
            .to_lowercase()
            .as_str()
        {
            "postgres" | "postgresql" => {
                let url = std::env::var("DATABASE_URL")
                    .unwrap_or_else(|_| "postgres://localhost/fleetlock".to_owned());
                StorageBackendType::Postgres { url }
            }
            _ => StorageBackendType::Memory,
        };

        let log_level = std::env::var("FLEETLOCK_LOG_LEVEL").unwrap_or_else(|_| "info".to_owned());

        let locker = LockerConfig {
            reserve_ttl: env_duration_secs("FLEETLOCK_RESERVE_TTL_SECONDS", 90),
        };

        let heartbeat = HeartbeatConfig {
            offline_threshold: env_duration_ms("FLEETLOCK_OFFLINE_THRESHOLD_MS", 30_000),
        };

        let queue_defaults = QueueConfig::default();
        let queue = QueueConfig {
            stale_threshold: env_duration_ms(
                "FLEETLOCK_STALE_COMMAND_THRESHOLD_MS",
                queue_defaults.stale_threshold.num_milliseconds(),
            ),
            ..queue_defaults
        };

        let event_defaults = EventConfig::default();
        let events = EventConfig {
            event_retention: env_duration_days("FLEETLOCK_EVENT_RETENTION_DAYS", 30),
            audit_retention: env_duration_days("FLEETLOCK_AUDIT_RETENTION_DAYS", 90),
            ..event_defaults
        };

        // Defaults straight from spec §4.5's table: capacity and
        // refill-per-second per dimension, each overridable independently.
        let mut rate_limit_policies = HashMap::new();
        rate_limit_policies.insert(
            Dimension::IpAddress,
            rate_limit_policy(
                "IP",
                BucketPolicy { capacity: 30, refill_per_second: 30.0 / 60.0, ..BucketPolicy::default() },
            ),
        );
        rate_limit_policies.insert(
            Dimension::RfidCard,
            rate_limit_policy(
                "CARD",
                BucketPolicy { capacity: 60, refill_per_second: 60.0 / 60.0, ..BucketPolicy::default() },
            ),
        );
        rate_limit_policies.insert(
            Dimension::Locker,
            rate_limit_policy(
                "LOCKER",
                BucketPolicy { capacity: 6, refill_per_second: 6.0 / 60.0, ..BucketPolicy::default() },
            ),
        );
        rate_limit_policies.insert(
            Dimension::QrDevice,
            rate_limit_policy(
                "DEVICE",
                BucketPolicy { capacity: 1, refill_per_second: 1.0 / 20.0, ..BucketPolicy::default() },
            ),
        );

        let zones_enabled = env_bool("FLEETLOCK_ZONES_ENABLED", false);
        let hardware = load_hardware();
        let zones = load_zone_config(&hardware);

        let fleet = FleetConfig {
            locker,
            queue,
            heartbeat,
            events,
            rate_limit_policies,
            zones,
            hardware,
            ..FleetConfig::default()
        };

        Self {
            bind_addr,
            storage_backend,
            log_level,
            fleet,
            heartbeat_interval: env_duration_ms("FLEETLOCK_HEARTBEAT_INTERVAL_MS", 10_000),
            command_poll_interval: env_duration_ms("FLEETLOCK_COMMAND_POLL_INTERVAL_MS", 2_000),
            zones_enabled,
        }
    }
}
