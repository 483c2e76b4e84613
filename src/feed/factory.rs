//! Price-feed URI grammar.
//!
//! A feed argument is a comma-separated priority list; each element becomes
//! an expiring-wrapped leaf and the list folds into an ordered failover.
//! Leaf forms: `fixed:<decimal>`, `file:<path>`, `ws://…`/`wss://…`, and
//! named pair tags (`eth_dai`, `dai_eth`, …) with `-setzer` (shell command)
//! and `-tub` (on-chain oracle) variants.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::errors::ConfigError;
use crate::feed::combinators::{AveragePriceFeed, ExpiringFeed, FailoverFeed, InverseFeed};
use crate::feed::leaf::{FilePriceFeed, FixedPriceFeed, ShellPriceFeed};
use crate::feed::oracle::{OraclePriceFeed, OracleReader};
use crate::feed::ws::{WebSocketPriceFeed, WsFeedConfig};
use crate::feed::PriceFeed;

const SETZER_POLL_INTERVAL: Duration = Duration::from_secs(60);
const ORACLE_POLL_INTERVAL: Duration = Duration::from_secs(10);

/// Builds feed trees from CLI feed arguments.
pub struct FeedFactory {
    expiry: Duration,
    named: HashMap<String, Arc<dyn PriceFeed>>,
    setzer_sources: HashMap<String, Vec<String>>,
    setzer_command: String,
    oracle: Option<Arc<dyn OracleReader>>,
}

impl FeedFactory {
    /// `expiry` is the shared maximum age applied to every leaf.
    pub fn new(expiry: Duration) -> Self {
        let mut setzer_sources = HashMap::new();
        setzer_sources.insert(
            "eth_dai".to_string(),
            vec!["kraken".to_string(), "gemini".to_string()],
        );
        Self {
            expiry,
            named: HashMap::new(),
            setzer_sources,
            setzer_command: "setzer".to_string(),
            oracle: None,
        }
    }

    /// Register an implementation-provided feed for a named pair tag.
    pub fn register_named(&mut self, tag: impl Into<String>, feed: Arc<dyn PriceFeed>) {
        self.named.insert(tag.into(), feed);
    }

    /// Register the on-chain oracle backing `-tub` tags.
    pub fn register_oracle(&mut self, reader: Arc<dyn OracleReader>) {
        self.oracle = Some(reader);
    }

    /// Override the shell command used for `-setzer` tags (mostly tests).
    pub fn set_setzer_command(&mut self, command: impl Into<String>) {
        self.setzer_command = command.into();
    }

    /// Parse a comma-separated feed list into a failover of expiring
    /// wrappers in listed priority.
    pub fn create(&self, argument: &str) -> Result<Arc<dyn PriceFeed>, ConfigError> {
        let mut feeds: Vec<Arc<dyn PriceFeed>> = Vec::new();
        for tag in argument
            .split(',')
            .map(str::trim)
            .filter(|tag| !tag.is_empty())
        {
            let leaf = self.create_leaf(tag)?;
            feeds.push(Arc::new(ExpiringFeed::new(leaf, self.expiry)));
        }
        match feeds.len() {
            0 => Err(ConfigError::Validation("empty price feed list".to_string())),
            1 => Ok(feeds.remove(0)),
            _ => Ok(Arc::new(FailoverFeed::new(feeds))),
        }
    }

    fn create_leaf(&self, tag: &str) -> Result<Arc<dyn PriceFeed>, ConfigError> {
        if let Some(raw) = tag.strip_prefix("fixed:") {
            let price: f64 = raw.parse().map_err(|_| {
                ConfigError::Validation(format!("bad fixed price {raw:?}"))
            })?;
            if !price.is_finite() || price <= 0.0 {
                return Err(ConfigError::Validation(format!(
                    "fixed price must be positive, got {price}"
                )));
            }
            return Ok(Arc::new(FixedPriceFeed::new(price)));
        }

        if let Some(path) = tag.strip_prefix("file:") {
            return Ok(Arc::new(FilePriceFeed::new(path)));
        }

        if tag.starts_with("ws://") || tag.starts_with("wss://") {
            return Ok(Arc::new(WebSocketPriceFeed::spawn(
                tag,
                WsFeedConfig::default(),
            )));
        }

        if let Some(feed) = self.named.get(tag) {
            return Ok(feed.clone());
        }

        if tag.strip_suffix("-tub").is_some() {
            let reader = self.oracle.clone().ok_or_else(|| {
                ConfigError::Validation(format!(
                    "price feed {tag:?} needs on-chain access this keeper does not have"
                ))
            })?;
            return Ok(Arc::new(OraclePriceFeed::spawn(
                reader,
                ORACLE_POLL_INTERVAL,
            )));
        }

        if let Some(pair) = tag.strip_suffix("-setzer") {
            if let Some(sources) = self.setzer_sources.get(pair) {
                return Ok(self.setzer_average(sources));
            }
            if let Some(flipped) = invert_pair(pair) {
                if let Some(sources) = self.setzer_sources.get(&flipped) {
                    return Ok(Arc::new(InverseFeed::new(self.setzer_average(sources))));
                }
            }
            return Err(ConfigError::Validation(format!(
                "no setzer sources known for pair {pair:?}"
            )));
        }

        // An unknown pair tag whose flipped form is registered resolves to
        // the inverse feed (dai_eth from eth_dai and the like).
        if let Some(flipped) = invert_pair(tag) {
            if let Some(feed) = self.named.get(&flipped) {
                return Ok(Arc::new(InverseFeed::new(feed.clone())));
            }
        }

        Err(ConfigError::Validation(format!(
            "price feed {tag:?} unknown"
        )))
    }

    fn setzer_average(&self, sources: &[String]) -> Arc<dyn PriceFeed> {
        let feeds: Vec<Arc<dyn PriceFeed>> = sources
            .iter()
            .map(|source| {
                Arc::new(ShellPriceFeed::spawn(
                    vec![
                        self.setzer_command.clone(),
                        "price".to_string(),
                        source.clone(),
                    ],
                    SETZER_POLL_INTERVAL,
                )) as Arc<dyn PriceFeed>
            })
            .collect();
        Arc::new(AveragePriceFeed::new(feeds))
    }
}

/// `base_quote` → `quote_base`, for resolving inverse pair tags.
fn invert_pair(tag: &str) -> Option<String> {
    let (base, quote) = tag.split_once('_')?;
    if base.is_empty() || quote.is_empty() || quote.contains('_') {
        return None;
    }
    Some(format!("{quote}_{base}"))
}
