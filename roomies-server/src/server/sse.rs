//! Server-Sent Events transport. Each open stream is one broker subscription fed by a
//! bounded channel; a slow reader loses events instead of slowing the broadcaster.

use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use futures::{Stream, StreamExt};
use roomies_shared::api::ServerEvent;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{info, warn};
use uuid::Uuid;

use super::{AppError, AppState};
use crate::engine::EventBroker;

/// Unsubscribes when the response stream is dropped (client gone or shutdown).
struct SubscriptionGuard {
    broker: EventBroker,
    household_id: String,
    connection_id: String,
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        if self.broker.unsubscribe(&self.household_id, &self.connection_id) {
            info!(
                household_id = %self.household_id,
                connection_id = %self.connection_id,
                "sse: stream closed"
            );
        }
    }
}

fn to_sse(event: &ServerEvent) -> Event {
    match serde_json::to_string(event) {
        Ok(json) => Event::default().event(event.name()).data(json),
        Err(e) => {
            warn!(error = %e, event = event.name(), "sse: failed to encode event");
            Event::default().comment("encode error")
        }
    }
}

pub(super) async fn household_events(
    State(state): State<AppState>,
    Path(household_id): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, AppError> {
    if !state.engine.household_exists(&household_id).await? {
        return Err(AppError::not_found(format!(
            "household not found: {}",
            household_id
        )));
    }

    let (tx, rx) = mpsc::channel::<Arc<ServerEvent>>(state.config.event_buffer());
    let connection_id = Uuid::new_v4().to_string();
    let broker = state.engine.broker.clone();
    broker.subscribe(&household_id, &connection_id, Arc::new(tx));
    info!(household_id = %household_id, connection_id = %connection_id, "sse: stream opened");

    let guard = SubscriptionGuard {
        broker,
        household_id,
        connection_id,
    };
    let stream = ReceiverStream::new(rx)
        .map(move |event| {
            let _subscription = &guard;
            Ok::<_, Infallible>(to_sse(&event))
        })
        .take_until(state.shutdown_token().cancelled_owned());

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}
