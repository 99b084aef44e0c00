//! foundry-serve: boot one runtime instance from the environment and serve it.
//!
//! Exit codes: 0 normal shutdown, 64 manifest/bundle error, 65 configuration
//! error, 70 unrecoverable internal error.

use tracing::error;
use tracing_subscriber::EnvFilter;

use foundry::bundle::WorkerRegistry;

#[tokio::main]
async fn main() {
    let _ = config::load_and_apply("foundry", None);
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let instance = match serve::boot(WorkerRegistry::new()).await {
        Ok(instance) => instance,
        Err(err) => {
            error!(error = %err, "boot failed; refusing to serve traffic");
            std::process::exit(serve::exit_code(&err));
        }
    };

    if let Err(err) = serve::run_serve(instance).await {
        error!(error = %err, "server error");
        std::process::exit(70);
    }
}
