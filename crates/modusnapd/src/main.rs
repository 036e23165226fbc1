//! Daemon entrypoint: tracing, configuration, server.

use anyhow::Result;
use modusnapd::config::DaemonConfig;
use modusnapd::server::{self, AppState};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "modusnapd=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = DaemonConfig::from_env();
    info!(
        "modusnapd {} starting (engine: {})",
        env!("CARGO_PKG_VERSION"),
        config.engine_url
    );

    let state = AppState::new(config);
    match state.locator.resolve() {
        Ok(location) => info!("backend: {}", location.backend_dir.display()),
        Err(err) => warn!(
            "no backend located yet; operations will fail until one appears: {}",
            err
        ),
    }

    server::run(state).await
}
