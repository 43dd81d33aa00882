//! `GET /api/events`: `connected` once, then one `refresh` per signal.

use axum::{
    extract::State,
    response::sse::{Event, KeepAlive, Sse},
};
use futures::stream::{self, Stream, StreamExt};
use std::convert::Infallible;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::AppState;
use crate::events::EventBroadcaster;
use crate::metrics::ServerMetrics;

/// Deregisters the subscriber when the response stream is dropped.
struct StreamGuard {
    events: Arc<EventBroadcaster>,
    metrics: Arc<ServerMetrics>,
    id: u64,
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        self.events.unsubscribe(self.id);
        self.metrics.event_stream_closed();
    }
}

pub async fn events_handler(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let subscription = state.events.subscribe();
    state.metrics.event_stream_opened();
    let guard = StreamGuard {
        events: state.events.clone(),
        metrics: state.metrics.clone(),
        id: subscription.id,
    };

    let connected =
        stream::once(async { Ok::<_, Infallible>(Event::default().event("connected").data("{}")) });

    let refreshes = stream::unfold(
        (subscription.receiver, guard),
        |(mut rx, guard): (mpsc::Receiver<()>, StreamGuard)| async move {
            rx.recv().await?;
            Some((
                Ok(Event::default().event("refresh").data("{}")),
                (rx, guard),
            ))
        },
    );

    Sse::new(connected.chain(refreshes)).keep_alive(KeepAlive::default())
}
