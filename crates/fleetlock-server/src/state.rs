//! Shared application state for the `FleetLock` server.
//!
//! A single [`AppState`] is constructed at startup and shared across all
//! Axum handlers and background workers via `Arc`. It holds the
//! `fleetlock-core` components wired to one storage backend, plus the
//! mutable zone inventory (the only piece of fleet configuration that can
//! change at runtime via the staff API).

use std::sync::Arc;

use tokio::sync::RwLock;

use fleetlock_core::events::EventLog;
use fleetlock_core::heartbeat::HeartbeatManager;
use fleetlock_core::locker::LockerStateMachine;
use fleetlock_core::notify::NotificationBroadcaster;
use fleetlock_core::queue::CommandQueue;
use fleetlock_core::ratelimit::RateLimiter;
use fleetlock_core::zones::{RelayCard, ZoneConfig};

/// Shared application state passed to all HTTP handlers.
pub struct AppState {
    /// Locker state machine (assign/confirm/release/block/unblock).
    pub locker: Arc<LockerStateMachine>,
    /// Per-kiosk durable command queue.
    pub queue: Arc<CommandQueue>,
    /// Kiosk liveness tracking.
    pub heartbeat: Arc<HeartbeatManager>,
    /// Token-bucket rate limiter, shared across request dimensions.
    pub rate_limiter: Arc<RateLimiter>,
    /// Append-only event log.
    pub events: Arc<EventLog>,
    /// Broadcaster for SSE subscribers watching locker deltas.
    pub notify: Arc<NotificationBroadcaster>,
    /// Zone/relay-card inventory. Mutable at runtime: a staff operator can
    /// push an updated wiring map without a process restart, which is why
    /// this is the one component config behind a lock rather than baked
    /// into the components above at construction time.
    pub zones: RwLock<ZoneConfig>,
    /// Observed relay-card inventory the zone engine reconciles against.
    /// Mutable for the same reason `zones` is: a staff operator can report
    /// newly-wired hardware without a restart.
    pub hardware: RwLock<Vec<RelayCard>>,
    /// Whether the zone extension engine is active for this deployment.
    pub zones_enabled: bool,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState").finish_non_exhaustive()
    }
}

impl AppState {
    #[must_use]
    pub fn new(
        locker: Arc<LockerStateMachine>,
        queue: Arc<CommandQueue>,
        heartbeat: Arc<HeartbeatManager>,
        rate_limiter: Arc<RateLimiter>,
        events: Arc<EventLog>,
        notify: Arc<NotificationBroadcaster>,
        zones: ZoneConfig,
        hardware: Vec<RelayCard>,
        zones_enabled: bool,
    ) -> Self {
        Self {
            locker,
            queue,
            heartbeat,
            rate_limiter,
            events,
            notify,
            zones: RwLock::new(zones),
            hardware: RwLock::new(hardware),
            zones_enabled,
        }
    }
}
