#![deny(unreachable_pub)]

//! Band-based market-making keeper.
//!
//! A keeper maintains resting buy and sell orders around a reference price
//! on one trading pair of one venue. The crate provides the band engine,
//! the price feed tree, the hot-reloaded bands configuration, and the
//! control loop; venue adapters implement [`keeper::ExchangeAdapter`].

// Core modules
mod errors;

// Feature modules
pub mod feed;
pub mod infra;
pub mod keeper;

// Re-exports
pub use errors::{ConfigError, ExchangeError, FeedError, KeeperError};
pub use feed::{PriceFeed, PriceReading};
pub use infra::logging::{init_logging, targets as log_targets, LogConfig, LogFormat};
pub use keeper::{
    Balances, Band, BandEngine, Bands, BandsReceiver, BookReport, Clock, CyclePlan, EngineInputs,
    ExchangeAdapter, IdleReason, Keeper, KeeperConfig, KeeperState, LimitRule, Limits, MinAmounts,
    Order, OrderBookView, OrderHistoryReporter, OrderId, Pair, PaperExchange, PlaceIntent,
    PlacementHistory, ReloadableConfig, Side, SystemClock, TemplateEngine,
};

/// Tolerance for floating-point amount comparisons.
pub const EPSILON: f64 = 1e-9;
