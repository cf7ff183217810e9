//! Validator-performance observatory core: mirrors a BFT DAG-based PoS
//! chain's blocks, committee participation, and signature participation into
//! Postgres, and derives per-validator uptime over it.

pub mod chain_client;
pub mod config;
pub mod decoder;
pub mod error;
pub mod event_bus;
pub mod logging;
pub mod mapping_cache;
pub mod rate_limiter;
pub mod range_fetcher;
pub mod store;
pub mod sync_controller;
pub mod uptime;

use std::sync::Arc;

use sqlx::PgPool;

use crate::chain_client::{ChainClient, HttpChainClient};
use crate::config::ObservatoryConfig;
use crate::decoder::{BlockDecoder, DigestSignatureRecovery};
use crate::error::{ObservatoryError, Result};
use crate::event_bus::EventBus;
use crate::mapping_cache::MappingCache;
use crate::range_fetcher::RangeFetcher;
use crate::rate_limiter::RateLimiter;
use crate::sync_controller::SyncController;
use crate::uptime::UptimeCalculator;

/// Assembles every pipeline component (C1-C9) from a loaded config and a
/// connected pool. The binary entrypoint is the only intended caller;
/// everything here is public so integration tests can wire a subset with
/// fakes substituted for `chain_client`.
pub struct Observatory {
    pub sync_controller: Arc<SyncController>,
    pub uptime_calculator: Arc<UptimeCalculator>,
    pub event_bus: Arc<EventBus>,
}

impl Observatory {
    pub async fn build(config: ObservatoryConfig, pool: PgPool) -> Result<Self> {
        let sdk_url = config
            .chain_client
            .sdk_url
            .clone()
            .ok_or_else(|| ObservatoryError::config("CHAIN_SDK_URL must be set"))?;
        let chain_client: Arc<dyn ChainClient> = Arc::new(HttpChainClient::new(sdk_url));

        let mapping_cache = build_mapping_cache(chain_client.clone(), &config).await?;
        let rate_limiter = Arc::new(RateLimiter::new(
            config.sync.rate_limit,
            config.sync.rate_limit_window,
        ));
        let range_fetcher = RangeFetcher::new(chain_client.clone(), rate_limiter, &config.sync);
        let decoder = BlockDecoder::new(mapping_cache, Arc::new(DigestSignatureRecovery));
        let event_bus = EventBus::new();

        let sync_controller = Arc::new(SyncController::new(
            chain_client,
            range_fetcher,
            decoder,
            pool.clone(),
            event_bus.clone(),
            config.sync,
        ));
        let uptime_calculator = Arc::new(UptimeCalculator::new(pool, &config.uptime));

        Ok(Self {
            sync_controller,
            uptime_calculator,
            event_bus,
        })
    }
}

#[cfg(feature = "redis-cache")]
async fn build_mapping_cache(
    chain_client: Arc<dyn ChainClient>,
    config: &ObservatoryConfig,
) -> Result<Arc<MappingCache>> {
    let ttl = config.cache.ttl_or_default();
    match &config.cache.redis_url {
        Some(url) => {
            let cache = MappingCache::with_redis(chain_client, ttl, url)
                .await
                .map_err(|e| ObservatoryError::config(format!("failed to connect to REDIS_URL: {e}")))?;
            Ok(Arc::new(cache))
        }
        None => Ok(Arc::new(MappingCache::new(chain_client, ttl))),
    }
}

#[cfg(not(feature = "redis-cache"))]
async fn build_mapping_cache(
    chain_client: Arc<dyn ChainClient>,
    config: &ObservatoryConfig,
) -> Result<Arc<MappingCache>> {
    Ok(Arc::new(MappingCache::new(chain_client, config.cache.ttl_or_default())))
}
