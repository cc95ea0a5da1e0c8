//! Engine configuration from environment variables

use std::env;
use std::time::Duration;

/// Configuration for the clock runtime
///
/// Loaded from environment variables with sensible defaults.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Path to SQLite database file
    pub db_path: String,

    /// Base URL of the vault data API
    pub vault_data_url: String,

    /// Per-request timeout for the vault data API in milliseconds
    pub vault_data_timeout_ms: u64,

    /// Interval between clock ticks in milliseconds
    pub tick_interval_ms: u64,
}

impl EngineConfig {
    /// Load configuration from environment variables
    ///
    /// Environment variables:
    /// - `VAULTFLOW_DB_PATH` (default: vaultflow.db)
    /// - `VAULT_DATA_URL` (default: http://127.0.0.1:8080)
    /// - `VAULT_DATA_TIMEOUT_MS` (default: 10000)
    /// - `CLOCK_TICK_INTERVAL_MS` (default: 60000)
    pub fn from_env() -> Self {
        Self {
            db_path: env::var("VAULTFLOW_DB_PATH").unwrap_or_else(|_| "vaultflow.db".to_string()),

            vault_data_url: env::var("VAULT_DATA_URL")
                .unwrap_or_else(|_| "http://127.0.0.1:8080".to_string()),

            vault_data_timeout_ms: env::var("VAULT_DATA_TIMEOUT_MS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(10_000),

            tick_interval_ms: env::var("CLOCK_TICK_INTERVAL_MS")
                .ok()
                .and_then(|s| s.parse().ok())
                .filter(|ms| *ms > 0)
                .unwrap_or(60_000),
        }
    }

    pub fn vault_data_timeout(&self) -> Duration {
        Duration::from_millis(self.vault_data_timeout_ms)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const VARS: [&str; 4] = [
        "VAULTFLOW_DB_PATH",
        "VAULT_DATA_URL",
        "VAULT_DATA_TIMEOUT_MS",
        "CLOCK_TICK_INTERVAL_MS",
    ];

    // Both scenarios share process env, so they run in one test
    #[test]
    fn test_config_from_env() {
        // Defaults when nothing is set
        for var in VARS {
            env::remove_var(var);
        }

        let config = EngineConfig::from_env();
        assert_eq!(config.db_path, "vaultflow.db");
        assert_eq!(config.vault_data_url, "http://127.0.0.1:8080");
        assert_eq!(config.vault_data_timeout(), Duration::from_secs(10));
        assert_eq!(config.tick_interval(), Duration::from_secs(60));

        // Custom values, with an unparseable and a zero interval falling back
        env::set_var("VAULTFLOW_DB_PATH", "/tmp/vaults.db");
        env::set_var("VAULT_DATA_URL", "http://data:9000");
        env::set_var("VAULT_DATA_TIMEOUT_MS", "not-a-number");
        env::set_var("CLOCK_TICK_INTERVAL_MS", "0");

        let config = EngineConfig::from_env();
        assert_eq!(config.db_path, "/tmp/vaults.db");
        assert_eq!(config.vault_data_url, "http://data:9000");
        assert_eq!(config.vault_data_timeout_ms, 10_000);
        assert_eq!(config.tick_interval_ms, 60_000);

        env::set_var("CLOCK_TICK_INTERVAL_MS", "1500");
        assert_eq!(EngineConfig::from_env().tick_interval_ms, 1_500);

        // Cleanup
        for var in VARS {
            env::remove_var(var);
        }
    }
}
