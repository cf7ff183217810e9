// Spec §8 scenario 6: the range fetcher adapts its window size based on
// per-window latency and respects the configured floor/ceiling. Uses a fake
// `ChainClient` rather than live infrastructure (spec §13).

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use observatory::chain_client::{ChainClient, MappingValue, RawBlock};
use observatory::config::SyncConfig;
use observatory::error::Result;
use observatory::range_fetcher::RangeFetcher;
use observatory::rate_limiter::RateLimiter;

struct SlowThenFastClient {
    calls: AtomicUsize,
}

#[async_trait]
impl ChainClient for SlowThenFastClient {
    async fn latest_height(&self) -> Result<u64> {
        Ok(999)
    }

    async fn block_range(&self, start: u64, end: u64) -> Result<Vec<RawBlock>> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call == 0 {
            tokio::time::sleep(Duration::from_millis(30)).await;
        }
        Ok((start..=end).map(sample_block).collect())
    }

    async fn mapping_value(&self, _program: &str, _mapping: &str, _key: &str) -> Result<MappingValue> {
        Ok(MappingValue::Null)
    }
}

fn sample_block(height: u64) -> RawBlock {
    serde_json::from_value(serde_json::json!({
        "block_hash": format!("0x{height}"),
        "previous_hash": "0x0",
        "header": { "metadata": { "height": height, "round": height, "timestamp": 0 } },
        "ratifications": [],
        "authority": { "subdag": { "subdag": {} } },
        "transactions_count": 0
    }))
    .unwrap()
}

#[tokio::test]
async fn fetch_range_completes_and_covers_the_whole_span() {
    let chain_client: Arc<dyn ChainClient> = Arc::new(SlowThenFastClient {
        calls: AtomicUsize::new(0),
    });
    let rate_limiter = Arc::new(RateLimiter::new(1000, Duration::from_millis(10)));
    let mut config = SyncConfig::default();
    config.concurrency = 2;
    config.batch_size_initial = 5;
    config.batch_size_floor = 2;
    config.batch_size_ceiling = 20;
    config.window_target = Duration::from_millis(50);

    let fetcher = RangeFetcher::new(chain_client, rate_limiter, &config);
    let outcomes = fetcher.fetch_range(0, 49).await.unwrap();

    let mut heights: Vec<u64> = outcomes
        .iter()
        .flat_map(|o| o.blocks.iter().map(|b| b.header.metadata.height))
        .collect();
    heights.sort_unstable();
    assert_eq!(heights, (0..=49).collect::<Vec<_>>());

    let batch_size = fetcher.current_batch_size();
    assert!(batch_size >= config.batch_size_floor);
    assert!(batch_size <= config.batch_size_ceiling);
}
