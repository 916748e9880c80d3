//! Atlas daemon entrypoint
//!
//! Usage: `atlas [config-path]`. Exits zero on clean shutdown and
//! nonzero when startup fails (bad configuration, unreachable storage).

use std::path::PathBuf;
use std::sync::Arc;

use eyre::{Context, Result};
use tracing_subscriber::EnvFilter;

use atlas::config::{self, Config};
use atlas::daemon::Daemon;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config_path: Option<PathBuf> = std::env::args().nth(1).map(PathBuf::from);
    let config = Config::load(config_path.as_ref()).context("Invalid configuration")?;

    let sources = config::load_sources(&config.storage.sources_file)
        .context("Failed to load sources")?;
    if sources.is_empty() {
        tracing::warn!("No sources configured, the daemon will only idle");
    }

    let daemon = Arc::new(Daemon::build(config, sources).await.context("Startup failed")?);
    daemon.run().await
}
