use axum::{
    extract::{Path, State},
    response::sse::{Event, KeepAlive, Sse},
    routing::get,
    Router,
};
use futures_util::{Stream, StreamExt};
use std::convert::Infallible;
use tiermatrix_shared::ServiceId;
use tokio_stream::wrappers::BroadcastStream;
use tracing::debug;
use uuid::Uuid;

use crate::error::AppError;
use crate::state::AppState;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/v1/services/{service_id}/stream", get(service_stream))
        .route("/v1/sessions/{session_id}/stream", get(session_stream))
}

/// Flush summaries of every session editing one service.
async fn service_stream(
    State(state): State<AppState>,
    Path(service_id): Path<ServiceId>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    debug!("Flush stream opened for service {}", service_id);
    let rx = state.flush_tx.subscribe();

    let stream = BroadcastStream::new(rx).filter_map(move |result| async move {
        match result {
            Ok(event) if event.service_id == service_id => Event::default()
                .event("matrix_flushed")
                .json_data(&event)
                .ok()
                .map(Ok::<_, Infallible>),
            // lagged receivers skip what they missed
            _ => None,
        }
    });

    Sse::new(stream).keep_alive(KeepAlive::default())
}

/// Outcomes of the debounced price edits of one session.
async fn session_stream(
    State(state): State<AppState>,
    Path(session_id): Path<Uuid>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, AppError> {
    let handle = state.session(session_id).await?;
    let rx = handle.editor.subscribe();

    let stream = BroadcastStream::new(rx).filter_map(|result| async move {
        let event = result.ok()?;
        Event::default()
            .event("price_edit")
            .json_data(&event)
            .ok()
            .map(Ok::<_, Infallible>)
    });

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}
