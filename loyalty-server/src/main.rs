use std::sync::Arc;

use anyhow::Context;
use tracing::info;

use loyalty_core::logging::init_tracing;
use loyalty_core::SystemClock;
use loyalty_server::{api, storage, LoyaltyServices, ServerConfig, ServerMetrics};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = ServerConfig::load().context("failed to load server configuration")?;
    init_tracing(&config.logging);

    info!("Starting loyalty server v{}", env!("CARGO_PKG_VERSION"));

    // ========================================================================
    // 1. Storage backend (PostgreSQL with migrations, or in-memory)
    // ========================================================================
    let storage = storage::init_storage(&config.storage, config.rules.store_retry_attempts)
        .await
        .context("failed to initialize storage")?;

    // ========================================================================
    // 2. Optional demo catalog
    // ========================================================================
    if config.seed_data {
        storage::seed_data::seed_all(&storage)
            .await
            .context("failed to seed demo data")?;
    }

    // ========================================================================
    // 3. Services + HTTP API
    // ========================================================================
    let services = LoyaltyServices::new(
        storage,
        Arc::new(SystemClock),
        config.rules.clone(),
        ServerMetrics::new(),
    )
    .context("invalid rules configuration")?;

    api::start_api_server(api::ApiState::new(services), config.api_port)
        .await
        .map_err(|e| anyhow::anyhow!(e))
        .context("API server failed")?;

    Ok(())
}
