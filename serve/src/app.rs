//! Axum app: shared state, router, and the non-streaming handlers.

use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;

use foundry::adapter::{ApiAdapter, ApiRequest};
use foundry::audit::AuditQuery;
use foundry::{ErrorKind, ExecError, RuntimeInstance};

use super::chat::{chat, chat_stream};
use super::voice::voice_ws;

pub struct AppState {
    instance: Arc<RuntimeInstance>,
}

impl AppState {
    pub fn new(instance: RuntimeInstance) -> Self {
        Self {
            instance: Arc::new(instance),
        }
    }

    pub fn instance(&self) -> &Arc<RuntimeInstance> {
        &self.instance
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v1/chat", post(chat))
        .route("/v1/chat/stream", post(chat_stream))
        .route("/v1/api", post(api))
        .route("/v1/voice", get(voice_ws))
        .route("/v1/secrets/status", get(secret_status))
        .route("/v1/audit", get(audit_query))
        .route("/healthz", get(|| async { "ok" }))
        .with_state(state)
}

/// Maps an execution failure to a transport status + `{error_kind, message,
/// request_id}` body.
pub(crate) fn exec_error_response(request_id: &str, err: &ExecError) -> Response {
    let body = match err.kind() {
        // Denials render opaquely; nothing about the check leaks.
        ErrorKind::Unauthorized => foundry::ErrorResponse::unauthorized(request_id),
        _ => RuntimeInstance::error_response(request_id, err),
    };
    let status = match body.error_kind {
        ErrorKind::Unauthorized => StatusCode::FORBIDDEN,
        ErrorKind::DeadlineExceeded => StatusCode::GATEWAY_TIMEOUT,
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(body)).into_response()
}

async fn api(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ApiRequest>,
) -> Response {
    let envelope = ApiAdapter::ingress(request);
    let (ctx, result) = state.instance.handle(envelope).await;
    match result {
        Ok(final_state) => Json(ApiAdapter::egress(&final_state, ctx.request_id())).into_response(),
        Err(err) => exec_error_response(ctx.request_id(), &err),
    }
}

#[derive(Deserialize)]
struct SecretStatusParams {
    tenant: String,
    #[serde(default)]
    domain: Option<String>,
    name: String,
    actor: String,
}

/// Blind surface: configuration status only, never the value.
async fn secret_status(
    State(state): State<Arc<AppState>>,
    Query(params): Query<SecretStatusParams>,
) -> Response {
    let request_id = foundry::RequestId::generate();
    let result = state
        .instance
        .resources()
        .secrets
        .status(
            request_id.as_str(),
            &params.actor,
            &params.tenant,
            params.domain.as_deref(),
            &params.name,
        )
        .await;
    match result {
        Ok(status) => Json(serde_json::json!({
            "request_id": request_id.as_str(),
            "configured": status.configured,
            "last_rotated": status.last_rotated,
        }))
        .into_response(),
        Err(err) => (
            StatusCode::BAD_GATEWAY,
            Json(foundry::ErrorResponse::new(
                err.kind(),
                err.to_string(),
                request_id.as_str(),
            )),
        )
            .into_response(),
    }
}

#[derive(Deserialize)]
struct AuditQueryParams {
    #[serde(default)]
    tenant: Option<String>,
    #[serde(default)]
    actor: Option<String>,
    #[serde(default)]
    action_prefix: Option<String>,
    #[serde(default)]
    offset: usize,
    #[serde(default)]
    limit: usize,
}

/// Filtered, paginated audit read with query-time redaction.
async fn audit_query(
    State(state): State<Arc<AppState>>,
    Query(params): Query<AuditQueryParams>,
) -> Response {
    let query = AuditQuery {
        tenant: params.tenant,
        actor: params.actor,
        action_prefix: params.action_prefix,
        from: None,
        to: None,
        offset: params.offset,
        limit: params.limit,
    };
    match state.instance.resources().audit.query(query).await {
        Ok(page) => Json(serde_json::json!({
            "entries": page.entries,
            "next_offset": page.next_offset,
        }))
        .into_response(),
        Err(err) => (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response(),
    }
}
