//! Background reconciliation workers.
//!
//! One driver per independent concern, each on its own `tokio::time::interval`
//! and sharing a single shutdown signal. Mirrors the lease-expiry worker
//! pattern: exponential backoff on a failing tick, with a consecutive-failure
//! counter that escalates the log level so operators notice a storage outage
//! without being paged on a single transient blip.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use tokio::sync::watch;
use tracing::{info, warn};

use crate::state::AppState;

/// Maximum retries per tick before a worker gives up and waits for the next one.
const TICK_MAX_RETRIES: u32 = 3;

/// Spawn every background worker, returning their join handles so the caller
/// can wait for them to drain during graceful shutdown.
pub fn spawn_all(
    state: Arc<AppState>,
    shutdown_rx: &watch::Receiver<bool>,
    heartbeat_interval: StdDuration,
    command_poll_interval: StdDuration,
) -> Vec<tokio::task::JoinHandle<()>> {
    vec![
        tokio::spawn(locker_cleanup_worker(Arc::clone(&state), shutdown_rx.clone(), heartbeat_interval)),
        tokio::spawn(heartbeat_worker(Arc::clone(&state), shutdown_rx.clone(), heartbeat_interval)),
        tokio::spawn(queue_gc_worker(Arc::clone(&state), shutdown_rx.clone(), command_poll_interval)),
        tokio::spawn(rate_limit_gc_worker(Arc::clone(&state), shutdown_rx.clone())),
        tokio::spawn(event_retention_worker(Arc::clone(&state), shutdown_rx.clone())),
    ]
}

/// Expires timed-out reservations and reconciles any double-held locker
/// left behind by a non-atomic assign race, once per tick.
async fn locker_cleanup_worker(state: Arc<AppState>, mut shutdown: watch::Receiver<bool>, interval: StdDuration) {
    let mut ticker = tokio::time::interval(interval);
    let mut consecutive_failures: u32 = 0;
    info!(interval_ms = interval.as_millis() as u64, "locker cleanup worker started");

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match run_with_retry(&mut shutdown, || async {
                    let expired = state.locker.cleanup_expired_reservations().await?;
                    Ok::<_, fleetlock_core::error::LockerError>(expired.len())
                }).await {
                    Ok(None) => { info!("locker cleanup worker shutting down"); return; }
                    Ok(Some(count)) => {
                        consecutive_failures = 0;
                        if count > 0 {
                            info!(expired = count, "locker cleanup tick released expired reservations");
                        }
                    }
                    Err(last_err) => log_tick_failure("locker cleanup", &mut consecutive_failures, &last_err),
                }
            }
            _ = shutdown.changed() => {
                info!("locker cleanup worker shutting down");
                return;
            }
        }
    }
}

/// Marks silent kiosks offline and reclaims their stale `executing` commands
/// on the same cadence — one background driver per process per spec §4.3,
/// which runs stale-executor recovery off the heartbeat manager's own
/// cleanup tick rather than giving it a second timer.
async fn heartbeat_worker(state: Arc<AppState>, mut shutdown: watch::Receiver<bool>, interval: StdDuration) {
    let mut ticker = tokio::time::interval(interval);
    let mut consecutive_failures: u32 = 0;
    info!(interval_ms = interval.as_millis() as u64, "heartbeat worker started");

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match run_with_retry(&mut shutdown, || async {
                    let marked_offline = state.heartbeat.cleanup_tick().await.map_err(|e| e.to_string())?;
                    let reclaimed =
                        state.queue.recover_stale_executing().await.map_err(|e| e.to_string())?;
                    Ok::<_, String>((marked_offline, reclaimed))
                }).await {
                    Ok(None) => { info!("heartbeat worker shutting down"); return; }
                    Ok(Some((marked_offline, reclaimed))) => {
                        consecutive_failures = 0;
                        if marked_offline > 0 || reclaimed > 0 {
                            info!(marked_offline, reclaimed, "heartbeat tick complete");
                        }
                    }
                    Err(last_err) => log_tick_failure("heartbeat", &mut consecutive_failures, &last_err),
                }
            }
            _ = shutdown.changed() => {
                info!("heartbeat worker shutting down");
                return;
            }
        }
    }
}

/// Garbage-collects terminal (`completed`/`failed`/`cancelled`) command rows
/// past their retention window.
async fn queue_gc_worker(state: Arc<AppState>, mut shutdown: watch::Receiver<bool>, interval: StdDuration) {
    let mut ticker = tokio::time::interval(interval);
    let mut consecutive_failures: u32 = 0;
    info!(interval_ms = interval.as_millis() as u64, "queue gc worker started");

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match run_with_retry(&mut shutdown, || async {
                    state.queue.gc_terminal().await
                }).await {
                    Ok(None) => { info!("queue gc worker shutting down"); return; }
                    Ok(Some(removed)) => {
                        consecutive_failures = 0;
                        if removed > 0 {
                            info!(removed, "queue gc tick removed terminal commands");
                        }
                    }
                    Err(last_err) => log_tick_failure("queue gc", &mut consecutive_failures, &last_err),
                }
            }
            _ = shutdown.changed() => {
                info!("queue gc worker shutting down");
                return;
            }
        }
    }
}

/// Sweeps idle rate-limit buckets and violation entries. In-memory and
/// synchronous, so this never fails — it still runs on its own ticker to
/// keep its cadence independent of the other workers.
async fn rate_limit_gc_worker(state: Arc<AppState>, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(StdDuration::from_secs(300));
    info!("rate limit gc worker started");

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                state.rate_limiter.gc(chrono::Duration::hours(1));
            }
            _ = shutdown.changed() => {
                info!("rate limit gc worker shutting down");
                return;
            }
        }
    }
}

/// Applies the event log's dual-window retention: hard-deletes events past
/// `event_retention`, anonymizes identity fields on events past
/// `anonymize_after` but still inside `audit_retention`.
async fn event_retention_worker(state: Arc<AppState>, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(StdDuration::from_secs(3600));
    let mut consecutive_failures: u32 = 0;
    info!("event retention worker started");

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match run_with_retry(&mut shutdown, || async {
                    state.events.apply_retention().await
                }).await {
                    Ok(None) => { info!("event retention worker shutting down"); return; }
                    Ok(Some((anonymized, deleted))) => {
                        consecutive_failures = 0;
                        if deleted > 0 || anonymized > 0 {
                            info!(deleted, anonymized, "event retention tick complete");
                        }
                    }
                    Err(last_err) => log_tick_failure("event retention", &mut consecutive_failures, &last_err),
                }
            }
            _ = shutdown.changed() => {
                info!("event retention worker shutting down");
                return;
            }
        }
    }
}

fn log_tick_failure(worker: &str, consecutive_failures: &mut u32, last_err: &str) {
    *consecutive_failures = consecutive_failures.saturating_add(1);
    if *consecutive_failures >= 5 {
        tracing::error!(worker, error = %last_err, consecutive_failures = *consecutive_failures, "tick persistently failing — storage may be down");
    } else {
        warn!(worker, error = %last_err, consecutive_failures = *consecutive_failures, retries = TICK_MAX_RETRIES, "tick failed after retries, will retry next interval");
    }
}

/// Run `f` with exponential backoff (1s, 2s, 4s) on failure. Returns:
/// - `Ok(Some(value))` on success
/// - `Ok(None)` if shutdown was signalled mid-retry
/// - `Err(last_error)` if all retries were exhausted
async fn run_with_retry<T, E, F, Fut>(shutdown: &mut watch::Receiver<bool>, mut f: F) -> Result<Option<T>, String>
where
    E: std::fmt::Display,
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
{
    let mut last_err = String::new();

    for attempt in 0..=TICK_MAX_RETRIES {
        match f().await {
            Ok(value) => return Ok(Some(value)),
            Err(e) => {
                last_err = e.to_string();

                if attempt == TICK_MAX_RETRIES {
                    break;
                }

                let backoff = StdDuration::from_secs(1u64 << attempt);
                tracing::debug!(
                    attempt = attempt.saturating_add(1),
                    max = TICK_MAX_RETRIES.saturating_add(1),
                    backoff_ms = backoff.as_millis() as u64,
                    error = %e,
                    "tick failed, retrying"
                );

                tokio::select! {
                    () = tokio::time::sleep(backoff) => {}
                    _ = shutdown.changed() => {
                        return Ok(None);
                    }
                }
            }
        }
    }

    Err(last_err)
}
