//! On-chain oracle feed.
//!
//! The actual contract read goes through the exchange adapter's node
//! access, behind the [`OracleReader`] seam. The feed polls the reader in a
//! background task so `peek` stays synchronous like every other feed.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::errors::FeedError;
use crate::feed::{PriceFeed, PriceReading, SharedSlot};
use crate::infra::logging::targets;

/// Reads a price from an on-chain value contract. Implemented by the
/// venue/chain integration, not by the core.
#[async_trait]
pub trait OracleReader: Send + Sync {
    async fn read_price(&self) -> Result<f64, FeedError>;

    /// Name used in logs and feed labels.
    fn name(&self) -> String {
        "oracle".to_string()
    }
}

const ORACLE_WARN_THRESHOLD: u32 = 5;

/// Polls an [`OracleReader`] and caches the latest reading.
pub struct OraclePriceFeed {
    name: String,
    slot: SharedSlot,
    producer: tokio::task::JoinHandle<()>,
}

impl OraclePriceFeed {
    pub fn spawn(reader: Arc<dyn OracleReader>, poll_interval: Duration) -> Self {
        let name = reader.name();
        let slot = SharedSlot::new();
        let producer = tokio::spawn(run_oracle_producer(reader, poll_interval, slot.clone()));
        Self {
            name,
            slot,
            producer,
        }
    }
}

impl Drop for OraclePriceFeed {
    fn drop(&mut self) {
        self.producer.abort();
    }
}

impl PriceFeed for OraclePriceFeed {
    fn peek(&self) -> Option<PriceReading> {
        self.slot.load()
    }

    fn label(&self) -> String {
        format!("oracle:{}", self.name)
    }
}

async fn run_oracle_producer(
    reader: Arc<dyn OracleReader>,
    poll_interval: Duration,
    slot: SharedSlot,
) {
    let mut failures: u32 = 0;
    loop {
        match reader.read_price().await {
            Ok(price) if price.is_finite() && price > 0.0 => {
                slot.store(PriceReading::now(price));
                failures = 0;
            }
            Ok(price) => {
                failures += 1;
                debug!(
                    target: targets::FEED,
                    oracle = %reader.name(),
                    price,
                    "oracle returned a non-positive price"
                );
            }
            Err(err) => {
                failures += 1;
                if failures >= ORACLE_WARN_THRESHOLD {
                    warn!(
                        target: targets::FEED,
                        oracle = %reader.name(),
                        failures,
                        error = %err,
                        "oracle reads keep failing"
                    );
                } else {
                    debug!(
                        target: targets::FEED,
                        oracle = %reader.name(),
                        error = %err,
                        "oracle read failed"
                    );
                }
            }
        }
        tokio::time::sleep(poll_interval).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StaticOracle(f64);

    #[async_trait]
    impl OracleReader for StaticOracle {
        async fn read_price(&self) -> Result<f64, FeedError> {
            Ok(self.0)
        }
    }

    #[tokio::test]
    async fn test_oracle_feed_publishes_reads() {
        let feed = OraclePriceFeed::spawn(Arc::new(StaticOracle(321.0)), Duration::from_millis(20));
        for _ in 0..50 {
            if feed.peek().is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!((feed.peek().unwrap().price - 321.0).abs() < 1e-9);
    }
}
