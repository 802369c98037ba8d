//! Server-sent event stream of job events

use crate::events::{EventBus, EventSeq, Replay};
use crate::AppState;
use async_stream::stream;
use axum::{
    extract::{Query, State},
    http::HeaderMap,
    response::sse::{Event, KeepAlive, Sse},
};
use futures_util::Stream;
use serde::Deserialize;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

const HEADER_LAST_EVENT_ID: &str = "last-event-id";
const KEEP_ALIVE_SECS: u64 = 15;

#[derive(Debug, Default, Deserialize)]
pub struct EventsQuery {
    /// Replay the in-memory ring before live events
    #[serde(default)]
    pub replay: bool,
}

/// `Last-Event-ID` wins over `?replay`.
fn replay_mode(last_id: Option<EventSeq>, replay_all: bool) -> Replay {
    match (last_id, replay_all) {
        (Some(seq), _) => Replay::Since(seq),
        (None, true) => Replay::All,
        (None, false) => Replay::None,
    }
}

pub async fn stream_events(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<EventsQuery>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>> + Send> {
    let last_id = headers
        .get(HEADER_LAST_EVENT_ID)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<EventSeq>().ok());

    let replay = replay_mode(last_id, query.replay);
    debug!(?replay, "event subscriber attached");

    Sse::new(event_stream(&state.bus, replay)).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(KEEP_ALIVE_SECS))
            .text("keep-alive"),
    )
}

fn event_stream(
    bus: &EventBus,
    replay: Replay,
) -> impl Stream<Item = Result<Event, Infallible>> + Send {
    let mut events = bus.subscribe_with(replay);
    stream! {
        while let Some(envelope) = events.next().await {
            match Event::default()
                .id(envelope.seq.to_string())
                .json_data(&envelope.event)
            {
                Ok(event) => yield Ok(event),
                Err(e) => warn!(seq = envelope.seq, "failed to encode event: {}", e),
            }
        }
    }
}
