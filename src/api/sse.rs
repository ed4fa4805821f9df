//! Server-Sent Events stream of upload activity.

use axum::extract::State;
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use futures::stream::Stream;
use std::convert::Infallible;
use std::time::Duration;
use tokio::sync::broadcast;

use super::AppState;
use crate::events::Event;

const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(15);

/// Push upload events to the client as they happen.
///
/// Each SSE message names the event variant in its `event` field and carries
/// the JSON payload as data. A subscriber that falls behind the broadcast
/// buffer skips the missed messages and continues from the current position;
/// the skip count is logged, not surfaced.
pub async fn sse_handler(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<SseEvent, Infallible>>> {
    tracing::debug!(target: "api::sse", "Event subscriber connected");
    let receiver = state.events.subscribe();

    let stream = futures::stream::unfold(receiver, |mut receiver| async move {
        loop {
            match receiver.recv().await {
                Ok(event) => {
                    let Some(message) = to_sse_message(&event) else {
                        continue;
                    };
                    return Some((Ok(message), receiver));
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(
                        target: "api::sse",
                        skipped,
                        "Subscriber fell behind the event buffer"
                    );
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    });

    Sse::new(stream).keep_alive(KeepAlive::new().interval(KEEP_ALIVE_INTERVAL))
}

fn to_sse_message(event: &Event) -> Option<SseEvent> {
    let payload = match serde_json::to_string(event) {
        Ok(payload) => payload,
        Err(err) => {
            tracing::error!(target: "api::sse", error = %err, "Failed to serialize event");
            return None;
        }
    };
    Some(SseEvent::default().event(event.kind()).data(payload))
}
