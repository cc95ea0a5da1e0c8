//! Clock Runtime - periodic tick driver
//!
//! Opens the SQLite store, then invokes the clock engine on a fixed interval
//! with the current time. Ticks inside an already processed hour are no-ops,
//! so the interval may be much shorter than an hour.
//!
//! Usage:
//!   cargo run --release --bin clock_runtime
//!
//! Environment variables:
//!   VAULTFLOW_DB_PATH - SQLite database path (default: vaultflow.db)
//!   VAULT_DATA_URL - Vault data API base URL (default: http://127.0.0.1:8080)
//!   VAULT_DATA_TIMEOUT_MS - API request timeout (default: 10000)
//!   CLOCK_TICK_INTERVAL_MS - Tick interval (default: 60000)

use dotenv::dotenv;
use log::{error, info};
use std::sync::Arc;
use vaultflow::pipeline::{
    config::EngineConfig,
    db,
    engine::ClockEngine,
    source::HttpVaultDataSource,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize environment and logging
    dotenv().ok();
    env_logger::init();

    info!("🚀 Clock Runtime");

    let config = EngineConfig::from_env();
    info!("   ├─ Database: {}", config.db_path);
    info!("   ├─ Vault data API: {}", config.vault_data_url);
    info!("   ├─ API timeout: {}ms", config.vault_data_timeout_ms);
    info!("   └─ Tick interval: {}ms", config.tick_interval_ms);

    info!("🔧 Initializing database...");
    let conn = db::open(&config.db_path)?;
    info!("✅ Database initialized");

    let source = HttpVaultDataSource::new(config.vault_data_url.clone(), config.vault_data_timeout())?;
    let mut engine = ClockEngine::new(conn, Arc::new(source));

    let mut interval = tokio::time::interval(config.tick_interval());
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    info!("🔄 Press CTRL+C to shutdown gracefully");

    loop {
        tokio::select! {
            _ = interval.tick() => {
                let now = chrono::Utc::now().timestamp();
                if let Err(e) = engine.on_tick(now).await {
                    error!("❌ Tick {} failed: {}", now, e);
                }
            }
            result = tokio::signal::ctrl_c() => {
                match result {
                    Ok(()) => info!("⚠️  Received CTRL+C, shutting down..."),
                    Err(err) => error!("❌ Failed to listen for CTRL+C: {}", err),
                }
                break;
            }
        }
    }

    info!("✅ Clock runtime stopped");
    Ok(())
}
