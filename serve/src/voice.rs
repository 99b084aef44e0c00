//! Voice channel: WebSocket control + turn exchange.
//!
//! The first client frame is a control message `{tenant, actor, session_id}`;
//! every following text frame is a turn `{audio_handle}`. The server answers
//! each turn with a synthesized [`VoiceTurn`] or an error object. Audio byte
//! transport itself belongs to the voice collaborator; only handles cross this
//! socket.

use std::sync::Arc;

use axum::{
    extract::ws::{Message, WebSocket, WebSocketUpgrade},
    extract::State,
    response::Response,
};
use serde::Deserialize;
use tracing::{debug, warn};

use foundry::adapter::{VoiceAdapter, VoiceControl};
use foundry::RuntimeInstance;

use super::app::AppState;

#[derive(Deserialize)]
struct TurnFrame {
    audio_handle: String,
}

pub(crate) async fn voice_ws(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> Response {
    let instance = state.instance().clone();
    ws.on_upgrade(move |socket| handle_socket(socket, instance))
}

async fn handle_socket(mut socket: WebSocket, instance: Arc<RuntimeInstance>) {
    // Control message first; anything else closes the session.
    let control: VoiceControl = loop {
        match socket.recv().await {
            Some(Ok(Message::Text(text))) => match serde_json::from_str(&text) {
                Ok(control) => break control,
                Err(e) => {
                    let _ = socket
                        .send(Message::Text(
                            serde_json::json!({"error": format!("bad control message: {e}")})
                                .to_string(),
                        ))
                        .await;
                    return;
                }
            },
            Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
            _ => return,
        }
    };
    debug!(tenant = %control.tenant, session = %control.session_id, "voice session opened");

    while let Some(frame) = socket.recv().await {
        let text = match frame {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => continue,
        };
        let turn: TurnFrame = match serde_json::from_str(&text) {
            Ok(turn) => turn,
            Err(e) => {
                let _ = socket
                    .send(Message::Text(
                        serde_json::json!({"error": format!("bad turn frame: {e}")}).to_string(),
                    ))
                    .await;
                continue;
            }
        };

        let envelope = VoiceAdapter::ingress(&control, turn.audio_handle);
        let (ctx, result) = instance.handle(envelope).await;
        let reply = match result {
            Ok(final_state) => match VoiceAdapter::egress(&final_state, &ctx).await {
                Ok(turn) => serde_json::to_value(turn).unwrap_or_default(),
                Err(err) => serde_json::to_value(foundry::ErrorResponse::new(
                    err.kind(),
                    err.to_string(),
                    ctx.request_id(),
                ))
                .unwrap_or_default(),
            },
            Err(err) => serde_json::to_value(RuntimeInstance::error_response(
                ctx.request_id(),
                &err,
            ))
            .unwrap_or_default(),
        };
        if socket.send(Message::Text(reply.to_string())).await.is_err() {
            warn!("voice client dropped mid-reply");
            break;
        }
    }
    debug!(session = %control.session_id, "voice session closed");
}
