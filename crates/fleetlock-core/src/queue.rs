//! Persistent per-kiosk command queue.
//!
//! Commands (open a locker, block a locker, apply a config) are queued
//! durably and dispatched to kiosk firmware at-most-once per attempt: a
//! command can only move `pending -> executing` for one caller
//! ([`CommandQueueStore::claim`] is the single-winner primitive), and a
//! firmware ack/nak moves it to a terminal state or reschedules it with
//! exponential backoff.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use fleetlock_storage::types::{CommandPayload, CommandRecord, CommandStatus};
use fleetlock_storage::CommandQueueStore;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::QueueError;

/// Tunables for the command queue.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Default retry budget for a command that doesn't specify its own.
    pub default_max_retries: i32,
    /// Base used in the exponential backoff formula
    /// `base * 2^(retry_count + 1)`.
    pub retry_base: Duration,
    /// A command stuck in `executing` longer than this is presumed lost and
    /// reclaimed by the next cleanup tick.
    pub stale_threshold: Duration,
    /// Terminal commands older than this are garbage-collected.
    pub retention: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            default_max_retries: 5,
            retry_base: Duration::seconds(30),
            stale_threshold: Duration::seconds(120),
            retention: Duration::days(30),
        }
    }
}

/// Per-kiosk durable command queue.
pub struct CommandQueue {
    store: Arc<dyn CommandQueueStore>,
    config: QueueConfig,
}

impl CommandQueue {
    #[must_use]
    pub fn new(store: Arc<dyn CommandQueueStore>, config: QueueConfig) -> Self {
        Self { store, config }
    }

    /// Enqueue a new command for a kiosk, due immediately.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Storage`] if the write fails.
    pub async fn enqueue(&self, kiosk_id: &str, payload: CommandPayload) -> Result<Uuid, QueueError> {
        let command_id = Uuid::new_v4();
        let command = CommandRecord {
            command_id,
            kiosk_id: kiosk_id.to_owned(),
            payload,
            status: CommandStatus::Pending,
            retry_count: 0,
            max_retries: self.config.default_max_retries,
            next_attempt_at: Utc::now(),
            last_error: None,
            created_at: Utc::now(),
            executed_at: None,
            completed_at: None,
        };
        self.store.enqueue(command).await?;
        info!(kiosk_id, %command_id, "command enqueued");
        Ok(command_id)
    }

    /// Look up a single command by id, in any status.
    ///
    /// # Errors
    ///
    /// - [`QueueError::NotFound`] if no such command exists.
    /// - [`QueueError::Storage`] if the read fails.
    pub async fn get(&self, command_id: Uuid) -> Result<CommandRecord, QueueError> {
        self.store.get(command_id).await?.ok_or(QueueError::NotFound { command_id })
    }

    /// Fetch due, pending commands for dispatch. Read-only — callers must
    /// still [`CommandQueue::claim`] before executing.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Storage`] if the read fails.
    pub async fn fetch_pending(&self, kiosk_id: &str, limit: u32) -> Result<Vec<CommandRecord>, QueueError> {
        Ok(self.store.fetch_pending(kiosk_id, limit).await?)
    }

    /// Claim a command for execution. Returns `false` if another caller
    /// already claimed it (or it's no longer pending) — the at-most-once
    /// guarantee lives here, not in the caller's own bookkeeping.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Storage`] if the claim attempt fails.
    pub async fn claim(&self, command_id: Uuid) -> Result<bool, QueueError> {
        Ok(self.store.claim(command_id).await?)
    }

    /// Mark a claimed command as successfully executed.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Storage`] if the write fails.
    pub async fn mark_completed(&self, command_id: Uuid) -> Result<(), QueueError> {
        self.store.mark_completed(command_id).await?;
        info!(%command_id, "command completed");
        Ok(())
    }

    /// Report execution failure. Reschedules with exponential backoff
    /// (`retry_base * 2^(retry_count + 1)`) unless the command's retry
    /// budget is exhausted, in which case it moves to `Failed` and this
    /// returns [`QueueError::RetriesExhausted`] for visibility — the command
    /// itself is still marked terminal either way.
    ///
    /// # Errors
    ///
    /// - [`QueueError::RetriesExhausted`] if the retry budget is spent (the
    ///   command is still persisted as `Failed`).
    /// - [`QueueError::Storage`] if the write fails.
    pub async fn mark_failed(&self, command: &CommandRecord, error: &str) -> Result<(), QueueError> {
        if command.retry_count + 1 >= command.max_retries {
            self.store.mark_failed_and_reschedule(command.command_id, error, None).await?;
            warn!(command_id = %command.command_id, retries = command.retry_count, "command exhausted retries");
            return Err(QueueError::RetriesExhausted {
                command_id: command.command_id,
                max_retries: command.max_retries,
            });
        }

        let backoff = self.config.retry_base * 2i32.pow((command.retry_count + 1).max(0) as u32);
        let next_attempt_at = Utc::now() + backoff;
        self.store
            .mark_failed_and_reschedule(command.command_id, error, Some(next_attempt_at))
            .await?;
        warn!(
            command_id = %command.command_id,
            retry_count = command.retry_count + 1,
            next_attempt_at = %next_attempt_at,
            "command failed, rescheduled"
        );
        Ok(())
    }

    /// Cancel a single pending/executing command.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Storage`] if the write fails.
    pub async fn cancel(&self, command_id: Uuid) -> Result<(), QueueError> {
        self.store.cancel(command_id).await?;
        Ok(())
    }

    /// Cancel every pending/executing command for a kiosk — invoked when a
    /// kiosk restart is detected, since any in-flight command from before
    /// the restart may never have executed.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Storage`] if the write fails.
    pub async fn clear_pending(&self, kiosk_id: &str) -> Result<u64, QueueError> {
        let count = self.store.clear_pending(kiosk_id).await?;
        if count > 0 {
            info!(kiosk_id, count, "cleared pending commands on kiosk restart");
        }
        Ok(count)
    }

    /// Recover commands stuck in `executing` past the stale threshold by
    /// rescheduling them as if they had failed. Driven by the heartbeat
    /// manager's cleanup tick, not its own timer.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Storage`] if the scan or any write fails.
    pub async fn recover_stale_executing(&self) -> Result<u64, QueueError> {
        let threshold = Utc::now() - self.config.stale_threshold;
        let stale = self.store.find_stale_executing(threshold).await?;
        let count = stale.len() as u64;
        for command in stale {
            let _ = self.mark_failed(&command, "stale executing command reclaimed").await;
        }
        if count > 0 {
            warn!(count, "reclaimed stale executing commands");
        }
        Ok(count)
    }

    /// Garbage-collect terminal commands older than the retention window.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Storage`] if the delete fails.
    pub async fn gc_terminal(&self) -> Result<u64, QueueError> {
        let cutoff = Utc::now() - self.config.retention;
        Ok(self.store.delete_terminal_older_than(cutoff).await?)
    }
}

/// Compute the next retry timestamp for a given retry count, exposed for
/// callers (and tests) that need the value without mutating state.
#[must_use]
pub fn backoff_for(base: Duration, retry_count: i32) -> DateTime<Utc> {
    let backoff = base * 2i32.pow((retry_count + 1).max(0) as u32);
    Utc::now() + backoff
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use fleetlock_storage::MemoryStore;

    fn queue() -> CommandQueue {
        CommandQueue::new(Arc::new(MemoryStore::new()), QueueConfig::default())
    }

    #[tokio::test]
    async fn enqueue_then_claim_succeeds_once() {
        let queue = queue();
        let id = queue.enqueue("K1", CommandPayload::ClearQueue).await.unwrap();
        assert!(queue.claim(id).await.unwrap());
        assert!(!queue.claim(id).await.unwrap());
    }

    #[tokio::test]
    async fn fetch_pending_excludes_claimed_commands() {
        let queue = queue();
        let id = queue.enqueue("K1", CommandPayload::ClearQueue).await.unwrap();
        assert_eq!(queue.fetch_pending("K1", 10).await.unwrap().len(), 1);
        queue.claim(id).await.unwrap();
        assert_eq!(queue.fetch_pending("K1", 10).await.unwrap().len(), 0);
    }

    #[tokio::test]
    async fn mark_failed_reschedules_until_retries_exhausted() {
        let queue = CommandQueue::new(
            Arc::new(MemoryStore::new()),
            QueueConfig { default_max_retries: 2, ..QueueConfig::default() },
        );
        let id = queue.enqueue("K1", CommandPayload::ClearQueue).await.unwrap();
        queue.claim(id).await.unwrap();

        let command = CommandRecord {
            command_id: id,
            kiosk_id: "K1".to_owned(),
            payload: CommandPayload::ClearQueue,
            status: CommandStatus::Executing,
            retry_count: 0,
            max_retries: 2,
            next_attempt_at: Utc::now(),
            last_error: None,
            created_at: Utc::now(),
            executed_at: Some(Utc::now()),
            completed_at: None,
        };
        queue.mark_failed(&command, "nak from kiosk").await.unwrap();

        let retried = CommandRecord { retry_count: 1, ..command };
        let err = queue.mark_failed(&retried, "nak again").await.unwrap_err();
        assert!(matches!(err, QueueError::RetriesExhausted { .. }));
    }

    #[tokio::test]
    async fn mark_failed_is_permanent_on_first_failure_when_max_retries_is_zero() {
        let queue = CommandQueue::new(
            Arc::new(MemoryStore::new()),
            QueueConfig { default_max_retries: 0, ..QueueConfig::default() },
        );
        let id = queue.enqueue("K1", CommandPayload::ClearQueue).await.unwrap();
        queue.claim(id).await.unwrap();
        let command = CommandRecord {
            command_id: id,
            kiosk_id: "K1".to_owned(),
            payload: CommandPayload::ClearQueue,
            status: CommandStatus::Executing,
            retry_count: 0,
            max_retries: 0,
            next_attempt_at: Utc::now(),
            last_error: None,
            created_at: Utc::now(),
            executed_at: Some(Utc::now()),
            completed_at: None,
        };
        let err = queue.mark_failed(&command, "nak from kiosk").await.unwrap_err();
        assert!(matches!(err, QueueError::RetriesExhausted { .. }));
    }

    #[tokio::test]
    async fn clear_pending_cancels_all_in_flight_commands() {
        let queue = queue();
        queue.enqueue("K1", CommandPayload::ClearQueue).await.unwrap();
        queue.enqueue("K1", CommandPayload::OpenLocker { locker_id: 2 }).await.unwrap();
        let count = queue.clear_pending("K1").await.unwrap();
        assert_eq!(count, 2);
        assert_eq!(queue.fetch_pending("K1", 10).await.unwrap().len(), 0);
    }
}
