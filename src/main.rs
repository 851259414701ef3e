use std::sync::Arc;

use color_eyre::eyre::Result;
use tracing::info;
use tracing_subscriber::EnvFilter;

use ignis::collab::{HttpFetcher, LogNotifier, MemoryStore, MemoryVideoSink};
use ignis::engine::StubEngine;
use ignis::server::{self, AppState};
use ignis::{Config, DetectionEngine};

/// Bound on remote video downloads.
const MAX_FETCH_BYTES: u64 = 512 * 1024 * 1024;

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| "ignis=debug,info".into()),
        )
        .with_timer(tracing_subscriber::fmt::time::uptime())
        .init();

    let config = load_config()?;
    ignis::CONFIG.store(Arc::new(config.clone()));
    info!(bind = %config.server.bind_addr, "starting");

    let state = AppState {
        config: Arc::new(config),
        // Scripted engine until a real model backend is wired in; swap the
        // factory to change what every new session runs.
        engine_factory: Arc::new(|| Box::new(StubEngine::new()) as Box<dyn DetectionEngine>),
        store: Arc::new(MemoryStore::new()),
        fetcher: Arc::new(HttpFetcher::new(MAX_FETCH_BYTES)),
        notifier: Arc::new(LogNotifier),
        registry: Arc::new(MemoryVideoSink::new()),
    };

    server::serve(state, shutdown_signal()).await?;
    info!("stopped");
    Ok(())
}

/// Defaults, overridden by `ignis.toml`, overridden by `IGNIS__*` env vars.
fn load_config() -> Result<Config> {
    let defaults = config::Config::try_from(&Config::default())?;
    let settings = config::Config::builder()
        .add_source(defaults)
        .add_source(config::File::with_name("ignis").required(false))
        .add_source(config::Environment::with_prefix("IGNIS").separator("__"))
        .build()?;
    Ok(settings.try_deserialize()?)
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown requested");
}
