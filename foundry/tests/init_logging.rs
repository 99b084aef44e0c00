//! Test-only: installs a tracing subscriber from `RUST_LOG` on first use.
//!
//! Include `mod init_logging;` in an integration test file and call
//! `init_logging::init()` from its fixtures so library tracing shows up under
//! `cargo test -- --nocapture`.

use std::sync::Once;

use tracing_subscriber::EnvFilter;

static INIT: Once = Once::new();

pub fn init() {
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}
