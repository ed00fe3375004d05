use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse,
    },
};
use futures::stream::{self, Stream};
use std::convert::Infallible;
use std::sync::Arc;
use tokio::sync::broadcast;

use super::live::attached;
use crate::metrics::SSE_CONNECTIONS_ACTIVE;
use crate::models::timer::LiveEvent;
use crate::services::AppState;

/// SSE endpoint for session views, countdown ticks and timer firings
/// GET /api/v1/live/sessions/{id}/stream
pub async fn session_stream(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let handle = attached(&state, &session_id).await?;
    tracing::info!("Client connected to SSE stream: session={}", session_id);

    let initial = LiveEvent::SessionView(Box::new(handle.view()));
    let stream = create_live_stream(session_id, initial, handle.events());

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

struct StreamState {
    session_id: String,
    initial: Option<LiveEvent>,
    events: broadcast::Receiver<LiveEvent>,
    _guard: ConnectionGuard,
}

struct ConnectionGuard;

impl ConnectionGuard {
    fn new() -> Self {
        SSE_CONNECTIONS_ACTIVE.inc();
        Self
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        SSE_CONNECTIONS_ACTIVE.dec();
    }
}

fn to_event(event: &LiveEvent) -> Event {
    Event::default()
        .event(event.event_name())
        .data(event.to_sse_data())
}

/// Current view first, then every live event until the session detaches.
fn create_live_stream(
    session_id: String,
    initial: LiveEvent,
    events: broadcast::Receiver<LiveEvent>,
) -> impl Stream<Item = Result<Event, Infallible>> {
    let state = StreamState {
        session_id,
        initial: Some(initial),
        events,
        _guard: ConnectionGuard::new(),
    };

    stream::unfold(state, |mut state| async move {
        if let Some(initial) = state.initial.take() {
            let event = to_event(&initial);
            return Some((Ok(event), state));
        }

        loop {
            match state.events.recv().await {
                Ok(live) => {
                    let event = to_event(&live);
                    return Some((Ok(event), state));
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(
                        "SSE client for session {} lagged by {} events",
                        state.session_id,
                        skipped
                    );
                }
                Err(broadcast::error::RecvError::Closed) => {
                    tracing::info!("SSE stream closed: session={}", state.session_id);
                    return None;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::timer::CountdownTick;
    use chrono::Utc;
    use futures::StreamExt;

    fn tick(remaining: u8) -> LiveEvent {
        LiveEvent::CountdownTick(CountdownTick {
            session_id: "s-1".to_string(),
            remaining,
            timestamp: Utc::now(),
        })
    }

    #[tokio::test]
    async fn stream_ends_when_the_session_detaches() {
        let (tx, rx) = broadcast::channel(8);
        let stream = create_live_stream("s-1".to_string(), tick(3), rx);
        tx.send(tick(2)).unwrap();
        drop(tx);

        let events: Vec<_> = stream.collect().await;
        assert_eq!(events.len(), 2);
    }
}
