// Configuration surface, environment-backed per spec §6.
//
// Shaped like the teacher's `forest_cli_shared::cli::Config`: a single
// `#[serde(default)]` aggregate of independently-defaulted sub-configs. The
// difference from the teacher is the source — we read environment variables
// rather than a TOML file, since a config file format is part of the CLI
// surface this spec places out of scope.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{ObservatoryError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NetworkType {
    Mainnet,
    Testnet,
}

impl std::str::FromStr for NetworkType {
    type Err = ObservatoryError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "mainnet" => Ok(Self::Mainnet),
            "testnet" => Ok(Self::Testnet),
            other => Err(ObservatoryError::config(format!(
                "NETWORK_TYPE must be \"mainnet\" or \"testnet\", got {other:?}"
            ))),
        }
    }
}

/// `url` carries DB credentials; `Debug` is hand-rolled via `educe` so a
/// stray `{config:?}` in a log line never leaks them.
#[derive(Clone, Serialize, Deserialize, educe::Educe)]
#[educe(Debug)]
#[serde(default)]
pub struct DatabaseConfig {
    #[educe(Debug(ignore))]
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub connect_timeout: Duration,
    pub idle_timeout: Duration,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            max_connections: 20,
            min_connections: 2,
            connect_timeout: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Clone, Serialize, Deserialize, Default, educe::Educe)]
#[educe(Debug)]
#[serde(default)]
pub struct CacheConfig {
    /// `None` degrades the Mapping Cache to process-local-only (spec §4.2).
    /// May carry credentials, so it is redacted from `Debug` like
    /// [`DatabaseConfig::url`].
    #[educe(Debug(ignore))]
    pub redis_url: Option<String>,
    pub ttl: Option<Duration>,
}

impl CacheConfig {
    pub fn ttl_or_default(&self) -> Duration {
        self.ttl.unwrap_or(Duration::from_secs(2 * 60 * 60))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChainClientConfig {
    pub sdk_url: Option<Url>,
    pub network: NetworkType,
}

impl Default for ChainClientConfig {
    fn default() -> Self {
        Self {
            sdk_url: None,
            network: NetworkType::Mainnet,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub start_block: u64,
    pub concurrency: usize,
    pub rate_limit: u32,
    pub rate_limit_window: Duration,
    pub min_sync_interval: Duration,
    pub max_sync_interval: Duration,
    pub regular_sync_interval: Duration,
    pub base_poll_interval: Duration,
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub batch_size_floor: u32,
    pub batch_size_ceiling: u32,
    pub batch_size_initial: u32,
    pub window_target: Duration,
    pub provider_max_window: u32,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            start_block: 0,
            concurrency: 5,
            rate_limit: 10,
            rate_limit_window: Duration::from_secs(1),
            min_sync_interval: Duration::from_secs(30),
            max_sync_interval: Duration::from_secs(5 * 60),
            regular_sync_interval: Duration::from_secs(5 * 60),
            base_poll_interval: Duration::from_secs(50),
            max_retries: 3,
            retry_delay: Duration::from_secs(1),
            batch_size_floor: 10,
            batch_size_ceiling: 50,
            batch_size_initial: 10,
            window_target: Duration::from_secs(5),
            provider_max_window: 50,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UptimeConfig {
    pub round_span: u64,
    pub calculation_interval: Duration,
    pub concurrency_limit: usize,
}

impl Default for UptimeConfig {
    fn default() -> Self {
        Self {
            round_span: 500,
            calculation_interval: Duration::from_secs(5 * 60),
            concurrency_limit: 8,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ObservatoryConfig {
    pub database: DatabaseConfig,
    pub cache: CacheConfig,
    pub chain_client: ChainClientConfig,
    pub sync: SyncConfig,
    pub uptime: UptimeConfig,
}

impl ObservatoryConfig {
    /// Loads configuration from the process environment, enumerated in
    /// spec §6. Missing `DATABASE_URL`/`CHAIN_SDK_URL` or a malformed
    /// `NETWORK_TYPE` are `ConfigError`s raised at startup, never patched
    /// with a silent default.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        config.database.url = require_env("DATABASE_URL")?;

        config.cache.redis_url = optional_env("REDIS_URL");

        let sdk_url = require_env("CHAIN_SDK_URL")?;
        config.chain_client.sdk_url = Some(Url::parse(&sdk_url).map_err(|e| {
            ObservatoryError::config(format!("CHAIN_SDK_URL is not a valid URL: {e}"))
        })?);
        if let Some(network) = optional_env("NETWORK_TYPE") {
            config.chain_client.network = network.parse()?;
        }

        if let Some(v) = optional_env("SYNC_START_BLOCK") {
            config.sync.start_block = parse_env("SYNC_START_BLOCK", &v)?;
        }
        if let Some(v) = optional_env("RATE_LIMIT") {
            config.sync.rate_limit = parse_env("RATE_LIMIT", &v)?;
        }
        if let Some(v) = optional_env("RATE_LIMIT_WINDOW") {
            config.sync.rate_limit_window = Duration::from_secs(parse_env("RATE_LIMIT_WINDOW", &v)?);
        }

        if let Some(v) = optional_env("UPTIME_CALCULATION_ROUND_SPAN") {
            config.uptime.round_span = parse_env("UPTIME_CALCULATION_ROUND_SPAN", &v)?;
        }
        if let Some(v) = optional_env("UPTIME_CALCULATION_INTERVAL") {
            config.uptime.calculation_interval =
                Duration::from_secs(parse_env("UPTIME_CALCULATION_INTERVAL", &v)?);
        }
        if let Some(v) = optional_env("PERFORMANCE_CONCURRENCY_LIMIT") {
            config.uptime.concurrency_limit = parse_env("PERFORMANCE_CONCURRENCY_LIMIT", &v)?;
        }

        Ok(config)
    }
}

fn require_env(key: &str) -> Result<String> {
    std::env::var(key)
        .map_err(|_| ObservatoryError::config(format!("missing required environment variable {key}")))
}

fn optional_env(key: &str) -> Option<String> {
    std::env::var(key).ok()
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| ObservatoryError::config(format!("invalid value for {key}: {value:?}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn clear_env() {
        for key in [
            "DATABASE_URL",
            "REDIS_URL",
            "CHAIN_SDK_URL",
            "NETWORK_TYPE",
            "SYNC_START_BLOCK",
            "RATE_LIMIT",
            "RATE_LIMIT_WINDOW",
            "UPTIME_CALCULATION_ROUND_SPAN",
            "UPTIME_CALCULATION_INTERVAL",
            "PERFORMANCE_CONCURRENCY_LIMIT",
        ] {
            std::env::remove_var(key);
        }
    }

    #[test]
    #[serial]
    fn missing_database_url_is_config_error() {
        clear_env();
        std::env::set_var("CHAIN_SDK_URL", "https://example.test");
        let err = ObservatoryConfig::from_env().unwrap_err();
        assert!(matches!(err, ObservatoryError::ConfigError { .. }));
        clear_env();
    }

    #[test]
    #[serial]
    fn invalid_network_type_is_config_error() {
        clear_env();
        std::env::set_var("DATABASE_URL", "postgres://localhost/db");
        std::env::set_var("CHAIN_SDK_URL", "https://example.test");
        std::env::set_var("NETWORK_TYPE", "devnet");
        let err = ObservatoryConfig::from_env().unwrap_err();
        assert!(matches!(err, ObservatoryError::ConfigError { .. }));
        clear_env();
    }

    #[test]
    #[serial]
    fn defaults_applied_when_optional_vars_absent() {
        clear_env();
        std::env::set_var("DATABASE_URL", "postgres://localhost/db");
        std::env::set_var("CHAIN_SDK_URL", "https://example.test");
        let config = ObservatoryConfig::from_env().unwrap();
        assert_eq!(config.sync.rate_limit, 10);
        assert_eq!(config.sync.start_block, 0);
        assert!(config.cache.redis_url.is_none());
        clear_env();
    }
}
