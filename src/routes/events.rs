use std::convert::Infallible;

use axum::extract::State;
use axum::response::sse::{Event, KeepAlive, Sse};
use futures::stream::Stream;
use tokio::sync::broadcast::error::RecvError;

use crate::services::progress::ProgressPublisher;

/// GET /events - SSE stream of progress events. Best-effort: a subscriber
/// that lags past the channel capacity skips ahead instead of blocking
/// publishers.
pub async fn events_stream(
    State(publisher): State<ProgressPublisher>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let mut rx = publisher.subscribe();

    let stream = async_stream::stream! {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    let json = serde_json::to_string(&event).unwrap_or_default();
                    yield Ok(Event::default().data(json));
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "event subscriber lagged");
                    continue;
                }
                Err(RecvError::Closed) => break,
            }
        }
    };

    Sse::new(stream).keep_alive(KeepAlive::default())
}
