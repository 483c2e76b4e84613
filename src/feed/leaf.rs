//! Synchronous and polled leaf feeds: fixed price, JSON file, shell command.

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::feed::{PriceFeed, PriceReading, SharedSlot};
use crate::infra::logging::targets;

/// Always returns the same price, never stale.
#[derive(Debug, Clone, Copy)]
pub struct FixedPriceFeed {
    price: f64,
}

impl FixedPriceFeed {
    pub fn new(price: f64) -> Self {
        info!(target: targets::FEED, price, "using fixed price feed");
        Self { price }
    }
}

impl PriceFeed for FixedPriceFeed {
    fn peek(&self) -> Option<PriceReading> {
        Some(PriceReading::now(self.price))
    }

    fn label(&self) -> String {
        format!("fixed:{}", self.price)
    }
}

#[derive(Debug, Deserialize)]
struct PriceDocument {
    price: f64,
}

/// Re-reads a small JSON document containing a `price` field on each query.
#[derive(Debug, Clone)]
pub struct FilePriceFeed {
    path: PathBuf,
}

impl FilePriceFeed {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl PriceFeed for FilePriceFeed {
    fn peek(&self) -> Option<PriceReading> {
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(err) => {
                debug!(
                    target: targets::FEED,
                    path = %self.path.display(),
                    error = %err,
                    "price file unreadable"
                );
                return None;
            }
        };
        match serde_json::from_str::<PriceDocument>(&raw) {
            Ok(doc) if doc.price.is_finite() && doc.price > 0.0 => {
                Some(PriceReading::now(doc.price))
            }
            Ok(doc) => {
                debug!(
                    target: targets::FEED,
                    path = %self.path.display(),
                    price = doc.price,
                    "price file holds a non-positive price"
                );
                None
            }
            Err(err) => {
                debug!(
                    target: targets::FEED,
                    path = %self.path.display(),
                    error = %err,
                    "price file malformed"
                );
                None
            }
        }
    }

    fn label(&self) -> String {
        format!("file:{}", self.path.display())
    }
}

/// Consecutive failures after which the shell feed starts complaining loudly.
const SHELL_RETRY_WARN_THRESHOLD: u32 = 10;

/// Invokes an external command (setzer style) on a poll interval and caches
/// the last good reading. The command must print a decimal price on stdout.
pub struct ShellPriceFeed {
    command: Vec<String>,
    slot: SharedSlot,
    producer: tokio::task::JoinHandle<()>,
}

impl ShellPriceFeed {
    pub fn spawn(command: Vec<String>, poll_interval: Duration) -> Self {
        assert!(!command.is_empty(), "shell feed needs a command");
        let slot = SharedSlot::new();
        let producer = tokio::spawn(run_shell_producer(
            command.clone(),
            poll_interval,
            slot.clone(),
        ));
        Self {
            command,
            slot,
            producer,
        }
    }
}

impl Drop for ShellPriceFeed {
    fn drop(&mut self) {
        self.producer.abort();
    }
}

impl PriceFeed for ShellPriceFeed {
    fn peek(&self) -> Option<PriceReading> {
        self.slot.load()
    }

    fn label(&self) -> String {
        format!("shell:{}", self.command.join(" "))
    }
}

async fn run_shell_producer(command: Vec<String>, poll_interval: Duration, slot: SharedSlot) {
    let mut retries: u32 = 0;
    loop {
        match fetch_shell_price(&command).await {
            Ok(price) => {
                slot.store(PriceReading::now(price));
                if retries >= SHELL_RETRY_WARN_THRESHOLD {
                    info!(
                        target: targets::FEED,
                        command = %command.join(" "),
                        "shell price feed recovered"
                    );
                }
                retries = 0;
            }
            Err(err) => {
                retries += 1;
                if retries > SHELL_RETRY_WARN_THRESHOLD {
                    warn!(
                        target: targets::FEED,
                        command = %command.join(" "),
                        retries,
                        error = %err,
                        "shell price feed keeps failing, check the command is installed"
                    );
                } else {
                    debug!(
                        target: targets::FEED,
                        command = %command.join(" "),
                        error = %err,
                        "shell price fetch failed"
                    );
                }
            }
        }
        tokio::time::sleep(poll_interval).await;
    }
}

async fn fetch_shell_price(command: &[String]) -> Result<f64, String> {
    let output = Command::new(&command[0])
        .args(&command[1..])
        .output()
        .await
        .map_err(|e| e.to_string())?;
    if !output.status.success() {
        return Err(format!("exit status {}", output.status));
    }
    let stdout = String::from_utf8_lossy(&output.stdout);
    let price: f64 = stdout
        .trim()
        .parse()
        .map_err(|_| format!("non-numeric output {:?}", stdout.trim()))?;
    if !price.is_finite() || price <= 0.0 {
        return Err(format!("non-positive price {price}"));
    }
    Ok(price)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_fixed_feed_is_always_fresh() {
        let feed = FixedPriceFeed::new(250.5);
        let reading = feed.peek().unwrap();
        assert!((reading.price - 250.5).abs() < 1e-9);
        assert!(reading.age() < Duration::from_secs(1));
    }

    #[test]
    fn test_file_feed_reads_price_document() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"price": 123.25}}"#).unwrap();
        file.flush().unwrap();

        let feed = FilePriceFeed::new(file.path());
        let reading = feed.peek().unwrap();
        assert!((reading.price - 123.25).abs() < 1e-9);
    }

    #[test]
    fn test_file_feed_unavailable_on_malformed_document() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "not json").unwrap();
        file.flush().unwrap();

        assert!(FilePriceFeed::new(file.path()).peek().is_none());
        assert!(FilePriceFeed::new("/nonexistent/price.json").peek().is_none());
    }

    #[test]
    fn test_file_feed_rejects_non_positive_price() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"price": -3.0}}"#).unwrap();
        file.flush().unwrap();

        assert!(FilePriceFeed::new(file.path()).peek().is_none());
    }

    #[tokio::test]
    async fn test_shell_feed_caches_command_output() {
        let feed = ShellPriceFeed::spawn(
            vec!["echo".to_string(), "101.5".to_string()],
            Duration::from_millis(50),
        );
        // Give the producer a moment to run the command once.
        for _ in 0..50 {
            if feed.peek().is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let reading = feed.peek().expect("producer never published");
        assert!((reading.price - 101.5).abs() < 1e-9);
    }
}
