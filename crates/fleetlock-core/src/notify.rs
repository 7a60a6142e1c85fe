//! Notification broadcaster.
//!
//! Fans out locker-state changes to subscribers (SSE connections, typically
//! one per staff dashboard session) over bounded channels. A slow or
//! disconnected subscriber must never back-pressure the locker state
//! machine: `try_send` either succeeds or the update is dropped for that
//! subscriber, and a closed channel gets the subscriber removed on the next
//! publish.

use std::sync::RwLock;

use fleetlock_storage::types::LockerStatus;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

/// A locker-state change pushed to subscribers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockerUpdate {
    pub kiosk_id: String,
    pub locker_id: i32,
    pub status: LockerStatus,
    pub version: i64,
}

/// Tunables for the broadcaster.
#[derive(Debug, Clone)]
pub struct NotifyConfig {
    /// Per-subscriber channel capacity. Once full, the update being
    /// published is dropped for that subscriber rather than blocking the
    /// publisher or growing the buffer — SSE consumers re-sync from a full
    /// locker list on reconnect, so losing an intermediate update is
    /// harmless.
    pub channel_capacity: usize,
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self { channel_capacity: 64 }
    }
}

struct Subscriber {
    id: Uuid,
    sender: mpsc::Sender<LockerUpdate>,
}

/// Broadcasts locker updates to any number of live subscribers.
pub struct NotificationBroadcaster {
    subscribers: RwLock<Vec<Subscriber>>,
    config: NotifyConfig,
}

impl NotificationBroadcaster {
    #[must_use]
    pub fn new(config: NotifyConfig) -> Self {
        Self { subscribers: RwLock::new(Vec::new()), config }
    }

    /// Register a new subscriber and return its receiver.
    #[must_use]
    pub fn subscribe(&self) -> mpsc::Receiver<LockerUpdate> {
        let (tx, rx) = mpsc::channel(self.config.channel_capacity);
        let id = Uuid::new_v4();
        if let Ok(mut subs) = self.subscribers.write() {
            subs.push(Subscriber { id, sender: tx });
        }
        rx
    }

    /// Push an update to every live subscriber. A subscriber whose channel
    /// is full has this update dropped rather than the publisher blocking on
    /// it — a slow consumer re-syncs from a full locker list on reconnect,
    /// so losing one intermediate update is harmless. A subscriber whose
    /// channel is closed is removed.
    pub fn publish(&self, update: LockerUpdate) {
        let Ok(mut subs) = self.subscribers.write() else { return };
        subs.retain(|sub| match sub.sender.try_send(update.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                debug!(subscriber = %sub.id, "notification dropped, subscriber channel full");
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(subscriber = %sub.id, "removing closed subscriber");
                false
            }
        });
    }

    /// Number of currently registered subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().map(|s| s.len()).unwrap_or(0)
    }
}

impl std::fmt::Debug for NotificationBroadcaster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotificationBroadcaster")
            .field("subscriber_count", &self.subscriber_count())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn update() -> LockerUpdate {
        LockerUpdate { kiosk_id: "K1".to_owned(), locker_id: 1, status: LockerStatus::Free, version: 1 }
    }

    #[tokio::test]
    async fn subscriber_receives_published_update() {
        let broadcaster = NotificationBroadcaster::new(NotifyConfig::default());
        let mut rx = broadcaster.subscribe();
        broadcaster.publish(update());
        let received = rx.recv().await.unwrap();
        assert_eq!(received.kiosk_id, "K1");
    }

    #[tokio::test]
    async fn dropped_receiver_is_removed_on_next_publish() {
        let broadcaster = NotificationBroadcaster::new(NotifyConfig::default());
        let rx = broadcaster.subscribe();
        assert_eq!(broadcaster.subscriber_count(), 1);
        drop(rx);
        broadcaster.publish(update());
        assert_eq!(broadcaster.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn full_channel_drops_update_without_blocking() {
        let broadcaster = NotificationBroadcaster::new(NotifyConfig { channel_capacity: 1 });
        let mut rx = broadcaster.subscribe();
        broadcaster.publish(update());
        broadcaster.publish(update());
        assert_eq!(broadcaster.subscriber_count(), 1);
        let _ = rx.recv().await.unwrap();
    }
}
