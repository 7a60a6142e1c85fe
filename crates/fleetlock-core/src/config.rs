//! Narrow per-component configuration, assembled once at startup rather
//! than threaded through a global. Each background component (locker
//! cleanup, heartbeat, queue GC, rate-limiter GC, event retention) only
//! holds the knobs it needs.

use std::collections::HashMap;

use crate::events::EventConfig;
use crate::heartbeat::HeartbeatConfig;
use crate::locker::LockerConfig;
use crate::notify::NotifyConfig;
use crate::queue::QueueConfig;
use crate::ratelimit::{BucketPolicy, Dimension, RateLimiter};
use crate::zones::{RelayCard, ZoneConfig};

/// Every component config plus the zone inventory, bundled for convenient
/// construction from environment at process startup.
#[derive(Debug, Clone)]
pub struct FleetConfig {
    pub locker: LockerConfig,
    pub queue: QueueConfig,
    pub heartbeat: HeartbeatConfig,
    pub notify: NotifyConfig,
    pub events: EventConfig,
    pub rate_limit_policies: HashMap<Dimension, BucketPolicy>,
    pub zones: ZoneConfig,
    /// Observed relay-card inventory (the zone engine's physical-capacity input).
    pub hardware: Vec<RelayCard>,
}

impl Default for FleetConfig {
    fn default() -> Self {
        // Defaults straight from spec §4.5's table: capacity and
        // refill-per-second per dimension.
        let mut rate_limit_policies = HashMap::new();
        rate_limit_policies.insert(
            Dimension::IpAddress,
            BucketPolicy { capacity: 30, refill_per_second: 30.0 / 60.0, ..BucketPolicy::default() },
        );
        rate_limit_policies.insert(
            Dimension::RfidCard,
            BucketPolicy { capacity: 60, refill_per_second: 60.0 / 60.0, ..BucketPolicy::default() },
        );
        rate_limit_policies.insert(
            Dimension::Locker,
            BucketPolicy { capacity: 6, refill_per_second: 6.0 / 60.0, ..BucketPolicy::default() },
        );
        rate_limit_policies.insert(
            Dimension::QrDevice,
            BucketPolicy { capacity: 1, refill_per_second: 1.0 / 20.0, ..BucketPolicy::default() },
        );

        Self {
            locker: LockerConfig::default(),
            queue: QueueConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            notify: NotifyConfig::default(),
            events: EventConfig::default(),
            rate_limit_policies,
            zones: ZoneConfig::default(),
            hardware: Vec::new(),
        }
    }
}

impl FleetConfig {
    /// Build a [`RateLimiter`] from this config's policies.
    #[must_use]
    pub fn build_rate_limiter(&self) -> RateLimiter {
        RateLimiter::new(self.rate_limit_policies.clone())
    }
}
