//! HTTP/WebSocket surface for one Foundry runtime instance.
//!
//! Routes: `POST /v1/chat`, `POST /v1/chat/stream` (SSE), `POST /v1/api`,
//! `GET /v1/voice` (WebSocket), `GET /v1/secrets/status`, `GET /v1/audit`.
//!
//! **Public API**: [`boot`], [`run_serve`], [`run_serve_on_listener`],
//! [`exit_code`].

mod app;
mod boot;
mod chat;
mod voice;

pub use app::{router, AppState};
pub use boot::{boot, exit_code, BootError};

use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::info;

use foundry::RuntimeInstance;

const DEFAULT_ADDR: &str = "127.0.0.1:8080";

/// Serves the instance on `FOUNDRY_LISTEN` (default `127.0.0.1:8080`) until
/// SIGINT/SIGTERM, then drains background tasks.
pub async fn run_serve(
    instance: RuntimeInstance,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let addr = std::env::var("FOUNDRY_LISTEN").unwrap_or_else(|_| DEFAULT_ADDR.to_string());
    let listener = TcpListener::bind(&addr).await?;
    run_serve_on_listener(listener, instance).await
}

/// Serves on an existing listener. Tests bind `127.0.0.1:0` and pass it in.
pub async fn run_serve_on_listener(
    listener: TcpListener,
    instance: RuntimeInstance,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let addr = listener.local_addr()?;
    info!("foundry-serve listening on http://{addr}");

    let state = Arc::new(AppState::new(instance));
    let app = router(state.clone());

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Drain the audit flusher and draft sweeper within the grace period.
    state.instance().shutdown().await;
    info!("foundry-serve stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
