//! Chat handlers: plain request/response plus the SSE streaming variant.
//!
//! The stream relays run events (`node_entered`, `tool_invoked`,
//! `tool_returned`, `token`, `final`) in executor-completion order, each frame
//! enveloped with the request id and a sequence number.

use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    extract::State,
    response::sse::{Event, KeepAlive, Sse},
    response::{IntoResponse, Response},
    Json,
};
use futures_util::Stream;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_stream::StreamExt;
use tracing::warn;

use foundry::adapter::{ChatAdapter, ChatRequest};
use run_event::{EnvelopeState, RunEvent};

use super::app::{exec_error_response, AppState};

pub(crate) async fn chat(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ChatRequest>,
) -> Response {
    let envelope = ChatAdapter::ingress(request);
    let (ctx, result) = state.instance().handle(envelope).await;
    match result {
        Ok(final_state) => {
            Json(ChatAdapter::egress(&final_state, ctx.request_id())).into_response()
        }
        Err(err) => exec_error_response(ctx.request_id(), &err),
    }
}

pub(crate) async fn chat_stream(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ChatRequest>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let envelope = ChatAdapter::ingress(request);
    let request_id = envelope.request_id.as_str().to_string();
    let (_ctx, mut events, run) = state.instance().handle_streaming(envelope);

    let (frame_tx, frame_rx) = mpsc::unbounded_channel::<serde_json::Value>();
    tokio::spawn(async move {
        let mut envelope_state = EnvelopeState::new(request_id);
        while let Some(event) = events.recv().await {
            if let Some(frame) = ChatAdapter::frame(&event, &mut envelope_state) {
                if frame_tx.send(frame).is_err() {
                    // Client went away; the run itself keeps going.
                    return;
                }
            }
        }
        // The event channel closed: surface a terminal error frame if the run
        // failed before emitting `final`.
        match run.await {
            Ok(Ok(_)) => {}
            Ok(Err(err)) => {
                let event = RunEvent::ErrorEvent {
                    error_kind: err.kind().as_str().to_string(),
                    message: err.to_string(),
                };
                if let Some(frame) = ChatAdapter::frame(&event, &mut envelope_state) {
                    let _ = frame_tx.send(frame);
                }
            }
            Err(join_err) => warn!(error = %join_err, "chat run task failed"),
        }
    });

    let stream = UnboundedReceiverStream::new(frame_rx)
        .map(|frame| Ok(Event::default().data(frame.to_string())));
    Sse::new(stream).keep_alive(KeepAlive::default())
}
