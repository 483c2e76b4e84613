//! Feed combinators: expiry wrapper, ordered failover, inverse, average.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{info, warn};

use crate::feed::{PriceFeed, PriceReading};
use crate::infra::logging::targets;

/// Reports the inner feed as unavailable once its reading is older than
/// `max_age`. Availability transitions are logged once each way.
pub struct ExpiringFeed {
    inner: Arc<dyn PriceFeed>,
    max_age: Duration,
    expired: Mutex<bool>,
}

impl ExpiringFeed {
    pub fn new(inner: Arc<dyn PriceFeed>, max_age: Duration) -> Self {
        Self {
            inner,
            max_age,
            expired: Mutex::new(false),
        }
    }

    fn note_expired(&self, expired_now: bool) {
        let mut expired = self.expired.lock().unwrap();
        if expired_now && !*expired {
            warn!(
                target: targets::FEED,
                feed = %self.inner.label(),
                max_age = ?self.max_age,
                "price feed expired"
            );
        } else if !expired_now && *expired {
            info!(
                target: targets::FEED,
                feed = %self.inner.label(),
                "price feed became available"
            );
        }
        *expired = expired_now;
    }
}

impl PriceFeed for ExpiringFeed {
    fn peek(&self) -> Option<PriceReading> {
        match self.inner.peek() {
            Some(reading) if reading.age() <= self.max_age => {
                self.note_expired(false);
                Some(reading)
            }
            _ => {
                self.note_expired(true);
                None
            }
        }
    }

    fn label(&self) -> String {
        format!("expiring({}, {:?})", self.inner.label(), self.max_age)
    }
}

/// Returns the first available reading of an ordered feed list. All inner
/// feeds keep their producers warm regardless of which one answers.
pub struct FailoverFeed {
    feeds: Vec<Arc<dyn PriceFeed>>,
}

impl FailoverFeed {
    pub fn new(feeds: Vec<Arc<dyn PriceFeed>>) -> Self {
        Self { feeds }
    }
}

impl PriceFeed for FailoverFeed {
    fn peek(&self) -> Option<PriceReading> {
        self.feeds.iter().find_map(|feed| feed.peek())
    }

    fn label(&self) -> String {
        let labels: Vec<String> = self.feeds.iter().map(|feed| feed.label()).collect();
        format!("failover({})", labels.join(", "))
    }
}

/// Yields `1 / price` of the inner feed; unavailability propagates.
pub struct InverseFeed {
    inner: Arc<dyn PriceFeed>,
}

impl InverseFeed {
    pub fn new(inner: Arc<dyn PriceFeed>) -> Self {
        Self { inner }
    }
}

impl PriceFeed for InverseFeed {
    fn peek(&self) -> Option<PriceReading> {
        let reading = self.inner.peek()?;
        if reading.price <= 0.0 {
            return None;
        }
        Some(PriceReading {
            price: 1.0 / reading.price,
            at: reading.at,
        })
    }

    fn label(&self) -> String {
        format!("inverse({})", self.inner.label())
    }
}

/// Mean of the currently available inner readings; unavailable when none
/// answers. The acquisition instant is the oldest one that contributed.
pub struct AveragePriceFeed {
    feeds: Vec<Arc<dyn PriceFeed>>,
}

impl AveragePriceFeed {
    pub fn new(feeds: Vec<Arc<dyn PriceFeed>>) -> Self {
        Self { feeds }
    }
}

impl PriceFeed for AveragePriceFeed {
    fn peek(&self) -> Option<PriceReading> {
        let readings: Vec<PriceReading> =
            self.feeds.iter().filter_map(|feed| feed.peek()).collect();
        if readings.is_empty() {
            return None;
        }
        let sum: f64 = readings.iter().map(|reading| reading.price).sum();
        let oldest = readings
            .iter()
            .map(|reading| reading.at)
            .min()
            .expect("nonempty readings");
        Some(PriceReading {
            price: sum / readings.len() as f64,
            at: oldest,
        })
    }

    fn label(&self) -> String {
        let labels: Vec<String> = self.feeds.iter().map(|feed| feed.label()).collect();
        format!("average({})", labels.join(", "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    /// Feed stub with a controllable reading.
    struct StubFeed {
        reading: Mutex<Option<PriceReading>>,
    }

    impl StubFeed {
        fn available(price: f64) -> Arc<Self> {
            Arc::new(Self {
                reading: Mutex::new(Some(PriceReading::now(price))),
            })
        }

        fn unavailable() -> Arc<Self> {
            Arc::new(Self {
                reading: Mutex::new(None),
            })
        }

        fn aged(price: f64, age: Duration) -> Arc<Self> {
            Arc::new(Self {
                reading: Mutex::new(Some(PriceReading {
                    price,
                    at: Instant::now().checked_sub(age).unwrap(),
                })),
            })
        }
    }

    impl PriceFeed for StubFeed {
        fn peek(&self) -> Option<PriceReading> {
            *self.reading.lock().unwrap()
        }

        fn label(&self) -> String {
            "stub".to_string()
        }
    }

    #[test]
    fn test_expiring_passes_fresh_readings() {
        let feed = ExpiringFeed::new(StubFeed::available(100.0), Duration::from_secs(120));
        assert!((feed.peek().unwrap().price - 100.0).abs() < 1e-9);
    }

    #[test]
    fn test_expiring_drops_stale_readings() {
        let feed = ExpiringFeed::new(
            StubFeed::aged(100.0, Duration::from_secs(300)),
            Duration::from_secs(120),
        );
        assert!(feed.peek().is_none());
    }

    #[test]
    fn test_failover_returns_first_available() {
        let feed = FailoverFeed::new(vec![
            StubFeed::unavailable(),
            StubFeed::available(42.0),
            StubFeed::available(99.0),
        ]);
        assert!((feed.peek().unwrap().price - 42.0).abs() < 1e-9);
    }

    #[test]
    fn test_failover_unavailable_when_all_fail() {
        let feed = FailoverFeed::new(vec![StubFeed::unavailable(), StubFeed::unavailable()]);
        assert!(feed.peek().is_none());
    }

    #[test]
    fn test_inverse_inverts_and_propagates_unavailability() {
        let feed = InverseFeed::new(StubFeed::available(4.0));
        assert!((feed.peek().unwrap().price - 0.25).abs() < 1e-12);

        let feed = InverseFeed::new(StubFeed::unavailable());
        assert!(feed.peek().is_none());
    }

    #[test]
    fn test_inverse_round_trip() {
        let base = StubFeed::available(1234.567);
        let double = InverseFeed::new(Arc::new(InverseFeed::new(base.clone())));
        let original = base.peek().unwrap().price;
        let round_tripped = double.peek().unwrap().price;
        assert!((original - round_tripped).abs() < 1e-9);
    }

    #[test]
    fn test_average_of_available_feeds() {
        let feed = AveragePriceFeed::new(vec![
            StubFeed::available(100.0),
            StubFeed::unavailable(),
            StubFeed::available(110.0),
        ]);
        assert!((feed.peek().unwrap().price - 105.0).abs() < 1e-9);
    }

    #[test]
    fn test_average_unavailable_when_empty() {
        let feed = AveragePriceFeed::new(vec![StubFeed::unavailable()]);
        assert!(feed.peek().is_none());
    }
}
