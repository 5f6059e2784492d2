//! Alert Engine - Main Entry Point

use anyhow::Context;
use api::{init_logging, run_server};
use delivery::{ChannelAdapter, LogChannel};
use pipeline::EngineConfig;
use std::sync::Arc;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging();

    info!("=== Alert Engine v{} ===", env!("CARGO_PKG_VERSION"));

    let config_path = std::env::args().nth(1);
    let config = EngineConfig::load(config_path.as_deref())
        .context("failed to load engine configuration")?;

    let adapters: Vec<Arc<dyn ChannelAdapter>> = vec![Arc::new(LogChannel)];

    let addr = std::env::var("ENGINE_LISTEN").unwrap_or_else(|_| "0.0.0.0:8080".to_string());
    run_server(&addr, config, adapters).await?;

    Ok(())
}
