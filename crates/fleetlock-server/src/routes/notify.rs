//! Notification routes: `/v1/notify/stream`
//!
//! Server-Sent Events feed of locker state deltas. A subscriber reconnects
//! and re-syncs from a full locker list (via `routes::lockers::list_lockers`)
//! rather than expecting gap-free delivery — the broadcaster drops updates
//! to a full or closed subscriber channel rather than blocking publishers.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::routing::get;
use axum::Router;
use futures::stream::Stream;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;

use crate::state::AppState;

/// Build the `/v1/notify` router.
pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/stream", get(stream))
}

async fn stream(
    State(state): State<Arc<AppState>>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let rx = state.notify.subscribe();
    let events = ReceiverStream::new(rx).map(|update| {
        let event = Event::default()
            .event("locker_update")
            .json_data(update)
            .unwrap_or_else(|_| Event::default().event("locker_update").data("{}"));
        Ok(event)
    });

    Sse::new(events).keep_alive(KeepAlive::new().interval(Duration::from_secs(15)))
}
