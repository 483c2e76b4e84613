//! WebSocket price feed.
//!
//! Maintains a persistent connection in a producer task, stores the last
//! price message in a shared slot, and reconnects with jittered exponential
//! backoff when the connection drops.

use std::time::Duration;

use futures_util::StreamExt;
use rand::Rng;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::feed::{PriceFeed, PriceReading, SharedSlot};
use crate::infra::logging::targets;

/// Reconnect behavior of the producer task.
#[derive(Debug, Clone)]
pub struct WsFeedConfig {
    /// Delay before the first reconnection attempt.
    pub initial_reconnect_delay: Duration,
    /// Ceiling for the exponential backoff.
    pub max_reconnect_delay: Duration,
    /// Backoff multiplier per consecutive failure.
    pub backoff_multiplier: f64,
    /// Jitter factor applied to each delay (0.2 = ±20%).
    pub jitter_factor: f64,
}

impl Default for WsFeedConfig {
    fn default() -> Self {
        Self {
            initial_reconnect_delay: Duration::from_secs(1),
            max_reconnect_delay: Duration::from_secs(60),
            backoff_multiplier: 2.0,
            jitter_factor: 0.2,
        }
    }
}

/// Price feed over a `ws://` or `wss://` endpoint pushing JSON messages
/// with a `price` (or `buyPrice`/`sellPrice`) field.
pub struct WebSocketPriceFeed {
    url: String,
    slot: SharedSlot,
    producer: tokio::task::JoinHandle<()>,
}

impl WebSocketPriceFeed {
    pub fn spawn(url: impl Into<String>, config: WsFeedConfig) -> Self {
        let url = url.into();
        let slot = SharedSlot::new();
        let producer = tokio::spawn(run_connection_loop(url.clone(), config, slot.clone()));
        Self {
            url,
            slot,
            producer,
        }
    }
}

impl Drop for WebSocketPriceFeed {
    fn drop(&mut self) {
        self.producer.abort();
    }
}

impl PriceFeed for WebSocketPriceFeed {
    fn peek(&self) -> Option<PriceReading> {
        self.slot.load()
    }

    fn label(&self) -> String {
        self.url.clone()
    }
}

async fn run_connection_loop(url: String, config: WsFeedConfig, slot: SharedSlot) {
    let mut delay = config.initial_reconnect_delay;
    loop {
        match connect_async(url.as_str()).await {
            Ok((mut stream, _)) => {
                info!(target: targets::FEED, url = %url, "price websocket connected");
                delay = config.initial_reconnect_delay;

                while let Some(frame) = stream.next().await {
                    match frame {
                        Ok(Message::Text(text)) => match parse_price_message(&text) {
                            Some(price) => slot.store(PriceReading::now(price)),
                            None => debug!(
                                target: targets::FEED,
                                url = %url,
                                message = %text,
                                "price websocket message without a usable price"
                            ),
                        },
                        Ok(Message::Close(_)) => break,
                        Ok(_) => {}
                        Err(err) => {
                            warn!(target: targets::FEED, url = %url, error = %err, "price websocket read error");
                            break;
                        }
                    }
                }
                info!(target: targets::FEED, url = %url, "price websocket disconnected");
            }
            Err(err) => {
                warn!(target: targets::FEED, url = %url, error = %err, "price websocket connect failed");
            }
        }

        tokio::time::sleep(with_jitter(delay, config.jitter_factor)).await;
        delay = Duration::from_secs_f64(
            (delay.as_secs_f64() * config.backoff_multiplier)
                .min(config.max_reconnect_delay.as_secs_f64()),
        );
    }
}

fn with_jitter(delay: Duration, jitter_factor: f64) -> Duration {
    if jitter_factor <= 0.0 {
        return delay;
    }
    let factor = rand::thread_rng().gen_range(1.0 - jitter_factor..1.0 + jitter_factor);
    Duration::from_secs_f64((delay.as_secs_f64() * factor).max(0.0))
}

/// Extract a price from a pushed JSON message. A `price` field wins; a
/// `buyPrice`/`sellPrice` pair is collapsed to its midpoint.
fn parse_price_message(text: &str) -> Option<f64> {
    let value: serde_json::Value = serde_json::from_str(text).ok()?;
    let as_price = |v: &serde_json::Value| -> Option<f64> {
        let price = v.as_f64().or_else(|| v.as_str()?.parse().ok())?;
        (price.is_finite() && price > 0.0).then_some(price)
    };

    if let Some(price) = value.get("price").and_then(|v| as_price(v)) {
        return Some(price);
    }
    match (
        value.get("buyPrice").and_then(|v| as_price(v)),
        value.get("sellPrice").and_then(|v| as_price(v)),
    ) {
        (Some(buy), Some(sell)) => Some((buy + sell) / 2.0),
        (Some(single), None) | (None, Some(single)) => Some(single),
        (None, None) => None,
    }
}
