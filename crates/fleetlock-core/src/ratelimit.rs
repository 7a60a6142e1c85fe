//! Multi-dimensional rate limiter.
//!
//! Each dimension (per-card, per-kiosk, per-IP, ...) gets its own token
//! bucket keyed by the dimension value. Repeated violations escalate into a
//! temporary block, tracked separately from the bucket itself so a blocked
//! key doesn't keep refilling tokens it can't use anyway.

use std::collections::HashMap;
use std::sync::RwLock;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::RateLimitError;

/// Which axis a rate-limit check applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Dimension {
    RfidCard,
    Locker,
    IpAddress,
    QrDevice,
}

impl Dimension {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Dimension::RfidCard => "rfid_card",
            Dimension::Locker => "locker",
            Dimension::IpAddress => "ip_address",
            Dimension::QrDevice => "qr_device",
        }
    }
}

/// One dimension's bucket policy.
#[derive(Debug, Clone, Copy)]
pub struct BucketPolicy {
    pub capacity: u32,
    pub refill_per_second: f64,
    /// Consecutive violations within this window before a key is blocked.
    pub violations_to_block: u32,
    pub violation_window: Duration,
    pub block_duration: Duration,
}

impl Default for BucketPolicy {
    fn default() -> Self {
        Self {
            capacity: 10,
            refill_per_second: 1.0,
            violations_to_block: 3,
            violation_window: Duration::minutes(1),
            block_duration: Duration::minutes(5),
        }
    }
}

#[derive(Debug, Clone)]
struct TokenBucket {
    tokens: f64,
    capacity: f64,
    refill_per_second: f64,
    last_refill: DateTime<Utc>,
}

impl TokenBucket {
    fn new(policy: &BucketPolicy) -> Self {
        Self {
            tokens: f64::from(policy.capacity),
            capacity: f64::from(policy.capacity),
            refill_per_second: policy.refill_per_second,
            last_refill: Utc::now(),
        }
    }

    fn refill(&mut self) {
        let now = Utc::now();
        let elapsed = (now - self.last_refill).num_milliseconds().max(0) as f64 / 1000.0;
        self.tokens = (self.tokens + elapsed * self.refill_per_second).min(self.capacity);
        self.last_refill = now;
    }

    fn has_token(&self) -> bool {
        self.tokens >= 1.0
    }

    fn consume(&mut self) {
        self.tokens -= 1.0;
    }
}

#[derive(Debug, Clone)]
struct ViolationState {
    count: u32,
    first_violation_at: DateTime<Utc>,
    blocked_until: Option<DateTime<Utc>>,
}

/// Tracks token buckets and violation escalation across every dimension.
pub struct RateLimiter {
    policies: HashMap<Dimension, BucketPolicy>,
    buckets: RwLock<HashMap<(Dimension, String), TokenBucket>>,
    violations: RwLock<HashMap<(Dimension, String), ViolationState>>,
}

impl RateLimiter {
    #[must_use]
    pub fn new(policies: HashMap<Dimension, BucketPolicy>) -> Self {
        Self { policies, buckets: RwLock::new(HashMap::new()), violations: RwLock::new(HashMap::new()) }
    }

    /// Check and consume one token for `(dimension, key)`.
    ///
    /// # Errors
    ///
    /// - [`RateLimitError::Blocked`] if the key is currently blocked from
    ///   escalated violations.
    /// - [`RateLimitError::Exceeded`] if the bucket has no tokens left; this
    ///   also counts as a violation toward blocking.
    pub fn check(&self, dimension: Dimension, key: &str) -> Result<(), RateLimitError> {
        let composite_key = (dimension, key.to_owned());

        if let Some(blocked_until) = self.blocked_until(&composite_key) {
            return Err(RateLimitError::Blocked {
                dimension: dimension.as_str(),
                key: key.to_owned(),
                blocked_until,
            });
        }

        let (allowed, tokens_after, policy) = self.peek(dimension, key);
        if allowed {
            self.consume(dimension, key);
            return Ok(());
        }

        self.record_violation(&composite_key, &policy);
        let retry_after_ms = retry_after_ms(tokens_after, policy.refill_per_second);
        Err(RateLimitError::Exceeded { dimension: dimension.as_str(), key: key.to_owned(), retry_after_ms })
    }

    /// The composite gate a QR-code locker access must pass: `ip`, then
    /// `locker`, then `qr_device` (spec §4.5). Every dimension is checked for
    /// availability before any of them are consumed, so a failure on a later
    /// dimension never spends tokens on an earlier one that already passed.
    ///
    /// # Errors
    ///
    /// Returns the first failing dimension's error, checked in `ip`, `locker`,
    /// `qr_device` order.
    pub fn check_qr_gate(&self, ip_key: &str, locker_key: &str, device_key: &str) -> Result<(), RateLimitError> {
        let gate = [(Dimension::IpAddress, ip_key), (Dimension::Locker, locker_key), (Dimension::QrDevice, device_key)];

        for (dimension, key) in gate {
            if let Some(blocked_until) = self.blocked_until(&(dimension, key.to_owned())) {
                return Err(RateLimitError::Blocked { dimension: dimension.as_str(), key: key.to_owned(), blocked_until });
            }
        }

        let peeked = gate.map(|(dimension, key)| {
            let (allowed, tokens_after, policy) = self.peek(dimension, key);
            (dimension, key, allowed, tokens_after, policy)
        });

        if let Some(&(dimension, key, _, tokens_after, policy)) =
            peeked.iter().find(|(_, _, allowed, _, _)| !allowed)
        {
            self.record_violation(&(dimension, key.to_owned()), &policy);
            let retry_after_ms = retry_after_ms(tokens_after, policy.refill_per_second);
            return Err(RateLimitError::Exceeded { dimension: dimension.as_str(), key: key.to_owned(), retry_after_ms });
        }

        for (dimension, key, ..) in peeked {
            self.consume(dimension, key);
        }
        Ok(())
    }

    /// Refill `(dimension, key)`'s bucket and report whether it currently has
    /// a token available, without consuming one.
    fn peek(&self, dimension: Dimension, key: &str) -> (bool, f64, BucketPolicy) {
        let policy = self.policies.get(&dimension).copied().unwrap_or_default();
        let mut buckets = self.buckets.write().unwrap_or_else(|e| e.into_inner());
        let bucket = buckets.entry((dimension, key.to_owned())).or_insert_with(|| TokenBucket::new(&policy));
        bucket.refill();
        (bucket.has_token(), bucket.tokens, policy)
    }

    /// Consume one token from `(dimension, key)`'s bucket. Must only be
    /// called after [`Self::peek`] confirmed a token was available; the
    /// bucket is assumed already refilled.
    fn consume(&self, dimension: Dimension, key: &str) {
        let mut buckets = self.buckets.write().unwrap_or_else(|e| e.into_inner());
        if let Some(bucket) = buckets.get_mut(&(dimension, key.to_owned())) {
            bucket.consume();
        }
    }

    fn blocked_until(&self, key: &(Dimension, String)) -> Option<DateTime<Utc>> {
        let violations = self.violations.read().unwrap_or_else(|e| e.into_inner());
        let state = violations.get(key)?;
        let until = state.blocked_until?;
        if until > Utc::now() {
            Some(until)
        } else {
            None
        }
    }

    fn record_violation(&self, key: &(Dimension, String), policy: &BucketPolicy) {
        let mut violations = self.violations.write().unwrap_or_else(|e| e.into_inner());
        let now = Utc::now();
        let state = violations.entry(key.clone()).or_insert_with(|| ViolationState {
            count: 0,
            first_violation_at: now,
            blocked_until: None,
        });

        if now - state.first_violation_at > policy.violation_window {
            state.count = 0;
            state.first_violation_at = now;
        }

        state.count += 1;

        if state.count >= policy.violations_to_block {
            state.blocked_until = Some(now + policy.block_duration);
            warn!(dimension = %key.0.as_str(), key = %key.1, "key blocked from repeated rate-limit violations");
        }
    }

    /// Clear the bucket and violation state for `(dimension, key)` — an
    /// administrative override for a key wrongly blocked or throttled.
    /// Callers are responsible for auditing who triggered this; the limiter
    /// itself has no notion of a caller identity.
    pub fn reset(&self, dimension: Dimension, key: &str) {
        let composite_key = (dimension, key.to_owned());
        self.buckets.write().unwrap_or_else(|e| e.into_inner()).remove(&composite_key);
        self.violations.write().unwrap_or_else(|e| e.into_inner()).remove(&composite_key);
    }

    /// Garbage-collect buckets and violation entries untouched long enough
    /// that they'd just be recreated at full capacity anyway. Driven by the
    /// server's own ticker, independent of the other background loops.
    pub fn gc(&self, idle_threshold: Duration) {
        let cutoff = Utc::now() - idle_threshold;
        let mut buckets = self.buckets.write().unwrap_or_else(|e| e.into_inner());
        buckets.retain(|_, b| b.last_refill > cutoff);

        let mut violations = self.violations.write().unwrap_or_else(|e| e.into_inner());
        violations.retain(|_, v| v.blocked_until.is_none_or(|until| until > cutoff));
    }
}

/// `⌈(1 − tokens) / refill_rate⌉` in milliseconds: the time until the bucket
/// accrues the fractional token it's still short, not a full token's worth
/// regardless of how close to ready it already is (spec §4.5).
fn retry_after_ms(tokens: f64, refill_per_second: f64) -> u64 {
    let deficit = (1.0 - tokens).max(0.0);
    let seconds = deficit / refill_per_second.max(0.001);
    (seconds * 1000.0).ceil().max(0.0) as u64
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter").finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn limiter_with_capacity(capacity: u32) -> RateLimiter {
        let mut policies = HashMap::new();
        policies.insert(
            Dimension::RfidCard,
            BucketPolicy { capacity, refill_per_second: 0.0, ..BucketPolicy::default() },
        );
        RateLimiter::new(policies)
    }

    #[test]
    fn allows_up_to_capacity_then_rejects() {
        let limiter = limiter_with_capacity(2);
        assert!(limiter.check(Dimension::RfidCard, "CARD-A").is_ok());
        assert!(limiter.check(Dimension::RfidCard, "CARD-A").is_ok());
        let err = limiter.check(Dimension::RfidCard, "CARD-A").unwrap_err();
        assert!(matches!(err, RateLimitError::Exceeded { .. }));
    }

    #[test]
    fn independent_keys_have_independent_buckets() {
        let limiter = limiter_with_capacity(1);
        assert!(limiter.check(Dimension::RfidCard, "CARD-A").is_ok());
        assert!(limiter.check(Dimension::RfidCard, "CARD-B").is_ok());
    }

    #[test]
    fn reset_clears_block_and_restores_capacity() {
        let limiter = limiter_with_capacity(1);
        assert!(limiter.check(Dimension::RfidCard, "CARD-A").is_ok());
        assert!(limiter.check(Dimension::RfidCard, "CARD-A").is_err());

        limiter.reset(Dimension::RfidCard, "CARD-A");
        assert!(limiter.check(Dimension::RfidCard, "CARD-A").is_ok());
    }

    #[test]
    fn qr_gate_consumes_all_three_dimensions_on_success() {
        let mut policies = HashMap::new();
        policies.insert(Dimension::IpAddress, BucketPolicy { capacity: 2, refill_per_second: 0.0, ..BucketPolicy::default() });
        policies.insert(Dimension::Locker, BucketPolicy { capacity: 2, refill_per_second: 0.0, ..BucketPolicy::default() });
        policies.insert(Dimension::QrDevice, BucketPolicy { capacity: 1, refill_per_second: 0.0, ..BucketPolicy::default() });
        let limiter = RateLimiter::new(policies);

        assert!(limiter.check_qr_gate("10.0.0.1", "K1:5", "DEVICE-1").is_ok());
        // qr_device bucket (capacity 1) is now empty; a second attempt from
        // the same device fails even though ip/locker still have budget.
        let err = limiter.check_qr_gate("10.0.0.1", "K1:5", "DEVICE-1").unwrap_err();
        assert!(matches!(err, RateLimitError::Exceeded { dimension: "qr_device", .. }));
    }

    #[test]
    fn qr_gate_failure_does_not_consume_earlier_dimensions() {
        let mut policies = HashMap::new();
        policies.insert(Dimension::IpAddress, BucketPolicy { capacity: 1, refill_per_second: 0.0, ..BucketPolicy::default() });
        policies.insert(Dimension::Locker, BucketPolicy { capacity: 1, refill_per_second: 0.0, ..BucketPolicy::default() });
        policies.insert(Dimension::QrDevice, BucketPolicy { capacity: 0, refill_per_second: 0.0, ..BucketPolicy::default() });
        let limiter = RateLimiter::new(policies);

        // qr_device has zero capacity: the gate fails on the last dimension
        // every time, but ip/locker must still have their single token left.
        let err = limiter.check_qr_gate("10.0.0.1", "K1:5", "DEVICE-1").unwrap_err();
        assert!(matches!(err, RateLimitError::Exceeded { dimension: "qr_device", .. }));

        assert!(limiter.check(Dimension::IpAddress, "10.0.0.1").is_ok());
        assert!(limiter.check(Dimension::Locker, "K1:5").is_ok());
    }

    #[test]
    fn retry_after_reflects_residual_tokens() {
        let mut policies = HashMap::new();
        policies.insert(
            Dimension::RfidCard,
            BucketPolicy { capacity: 1, refill_per_second: 2.0, ..BucketPolicy::default() },
        );
        let limiter = RateLimiter::new(policies);

        assert!(limiter.check(Dimension::RfidCard, "CARD-A").is_ok());
        // Bucket just went to 0 tokens at refill_per_second = 2.0: a full
        // token needs 500ms, not the 0ms a "bucket already empty" formula
        // would report for a bucket that still had most of a token left.
        let err = limiter.check(Dimension::RfidCard, "CARD-A").unwrap_err();
        match err {
            RateLimitError::Exceeded { retry_after_ms, .. } => {
                assert!(retry_after_ms > 0 && retry_after_ms <= 500, "got {retry_after_ms}");
            }
            other => panic!("expected Exceeded, got {other:?}"),
        }
    }

    #[test]
    fn repeated_violations_escalate_to_block() {
        let mut policies = HashMap::new();
        policies.insert(
            Dimension::RfidCard,
            BucketPolicy {
                capacity: 0,
                refill_per_second: 0.0,
                violations_to_block: 2,
                violation_window: Duration::minutes(1),
                block_duration: Duration::minutes(5),
            },
        );
        let limiter = RateLimiter::new(policies);

        let _ = limiter.check(Dimension::RfidCard, "CARD-A");
        let _ = limiter.check(Dimension::RfidCard, "CARD-A");
        let err = limiter.check(Dimension::RfidCard, "CARD-A").unwrap_err();
        assert!(matches!(err, RateLimitError::Blocked { .. }));
    }
}
