//! Status stream: a server-sent-events feed of whether a
//! rebalance or settlement job is currently in flight, so a UI can show a
//! spinner without polling `/health` in a loop.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::response::sse::{Event, KeepAlive, Sse};
use futures::stream::{self, Stream};
use tracing::warn;

use crate::models::StatusEvent;
use crate::state::AppState;

#[utoipa::path(
    get,
    path = "/status/stream",
    tag = "status",
    responses((status = 200, description = "SSE stream of processing-state transitions")),
)]
pub async fn status_stream(
    State(state): State<Arc<AppState>>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let interval = state.status_poll_interval;
    let stream = stream::unfold((state, None::<bool>), move |(state, last)| async move {
        let mut last = last;
        loop {
            let current = match state.queue.is_processing(None).await {
                Ok(v) => v,
                Err(e) => {
                    warn!(error = %e, "status stream failed to read queue state");
                    tokio::time::sleep(interval).await;
                    continue;
                }
            };

            if last != Some(current) {
                last = Some(current);
                let event = Event::default().json_data(StatusEvent { is_processing: current }).unwrap_or_else(|_| Event::default().data("{}"));
                return Some((Ok(event), (state, last)));
            }

            tokio::time::sleep(interval).await;
        }
    });

    Sse::new(stream).keep_alive(KeepAlive::new().interval(Duration::from_secs(15)))
}
