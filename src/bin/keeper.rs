//! Band keeper CLI.
//!
//! Wires the bands configuration, the price feed tree, and the control loop
//! against the built-in paper exchange, so the keeper can be exercised end
//! to end without venue credentials. Real venues plug in by implementing
//! `ExchangeAdapter` and swapping it in here.
//!
//! ```bash
//! # Paper-trade one buy/sell band set against a fixed reference price
//! keeper --config bands.json --price-feed fixed:250
//!
//! # Failover feed list with a 2 minute freshness bound
//! keeper --config bands.json \
//!     --price-feed ws://feeds.example/eth_dai,fixed:250 --price-feed-expiry 120
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use market_keeper::feed::factory::FeedFactory;
use market_keeper::keeper::config::spawn_watcher;
use market_keeper::{
    init_logging, Balances, Keeper, KeeperConfig, KeeperError, LogConfig, LogFormat, MinAmounts,
    OrderHistoryReporter, Pair, PaperExchange, ReloadableConfig,
};

// ============================================================================
// CLI Arguments
// ============================================================================

#[derive(Parser)]
#[command(name = "keeper")]
#[command(version, about = "Band-based market-making keeper", long_about = None)]
struct Cli {
    /// Path to the bands configuration file (JSON)
    #[arg(short, long, default_value = "bands.json")]
    config: PathBuf,

    /// Price feed list (comma-separated failover priority)
    #[arg(long, default_value = "fixed:100")]
    price_feed: String,

    /// Maximum age of a price reading (in seconds)
    #[arg(long, default_value_t = 120)]
    price_feed_expiry: u64,

    /// Bands file poll interval (in seconds)
    #[arg(long, default_value_t = 5)]
    config_poll_interval: u64,

    /// Optional TOML app config with keeper/paper/logging sections
    #[arg(long)]
    app_config: Option<PathBuf>,

    /// Override cycle cadence (in seconds)
    #[arg(long)]
    refresh_frequency: Option<u64>,

    /// Buy-token balance floor; breaching it drains the keeper
    #[arg(long)]
    balance_floor_buy: Option<f64>,

    /// Sell-token balance floor; breaching it drains the keeper
    #[arg(long)]
    balance_floor_sell: Option<f64>,

    /// Abort after the feed has been unavailable this long (in seconds)
    #[arg(long)]
    fail_closed_after: Option<u64>,

    /// Endpoint to report active orders to
    #[arg(long)]
    order_history: Option<String>,

    /// Frequency of order-history reporting (in seconds)
    #[arg(long, default_value_t = 30)]
    order_history_every: u64,

    /// Leave resting orders in place when shutting down
    #[arg(long)]
    no_cancel_on_shutdown: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "KEEPER_LOG")]
    log_level: Option<String>,

    /// Output format (pretty, json, compact)
    #[arg(long)]
    log_format: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate a sample app config file
    GenerateConfig {
        /// Output file path
        #[arg(short, long, default_value = "keeper.toml")]
        output: PathBuf,
    },
    /// Validate the bands file without running
    ValidateConfig,
    /// Run the keeper (default)
    Run,
}

// ============================================================================
// App configuration
// ============================================================================

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
struct AppConfig {
    #[serde(default)]
    keeper: KeeperSection,
    #[serde(default)]
    paper: PaperSection,
    #[serde(default)]
    logging: LogConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
struct KeeperSection {
    /// Cycle cadence in seconds
    #[serde(default = "default_refresh")]
    refresh_frequency: u64,
    /// Bounded dispatch concurrency per cycle
    #[serde(default = "default_concurrency")]
    dispatch_concurrency: usize,
    /// Per-call exchange timeout in seconds
    #[serde(default = "default_timeout")]
    exchange_timeout: u64,
    /// Consecutive wholly-failed cycles before giving up
    #[serde(default = "default_max_failed")]
    max_failed_cycles: u32,
    #[serde(default = "default_true")]
    cancel_on_shutdown: bool,
    #[serde(default)]
    withdraw_on_shutdown: bool,
}

fn default_refresh() -> u64 {
    10
}

fn default_concurrency() -> usize {
    8
}

fn default_timeout() -> u64 {
    30
}

fn default_max_failed() -> u32 {
    25
}

fn default_true() -> bool {
    true
}

impl Default for KeeperSection {
    fn default() -> Self {
        Self {
            refresh_frequency: default_refresh(),
            dispatch_concurrency: default_concurrency(),
            exchange_timeout: default_timeout(),
            max_failed_cycles: default_max_failed(),
            cancel_on_shutdown: true,
            withdraw_on_shutdown: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
struct PaperSection {
    #[serde(default = "default_base")]
    base: String,
    #[serde(default = "default_quote")]
    quote: String,
    #[serde(default = "default_buy_balance")]
    buy_balance: f64,
    #[serde(default = "default_sell_balance")]
    sell_balance: f64,
    #[serde(default)]
    min_buy_amount: f64,
    #[serde(default)]
    min_sell_amount: f64,
}

fn default_base() -> String {
    "ETH".to_string()
}

fn default_quote() -> String {
    "DAI".to_string()
}

fn default_buy_balance() -> f64 {
    10_000.0
}

fn default_sell_balance() -> f64 {
    100.0
}

impl Default for PaperSection {
    fn default() -> Self {
        Self {
            base: default_base(),
            quote: default_quote(),
            buy_balance: default_buy_balance(),
            sell_balance: default_sell_balance(),
            min_buy_amount: 0.0,
            min_sell_amount: 0.0,
        }
    }
}

fn load_app_config(path: Option<&Path>) -> Result<AppConfig, Box<dyn std::error::Error>> {
    match path {
        Some(path) => {
            let content = std::fs::read_to_string(path)?;
            Ok(toml::from_str(&content)?)
        }
        None => Ok(AppConfig::default()),
    }
}

// ============================================================================
// Entry point
// ============================================================================

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    match cli.command {
        Some(Commands::GenerateConfig { ref output }) => {
            let sample = AppConfig::default();
            let content = toml::to_string_pretty(&sample).expect("serialize sample config");
            if let Err(err) = std::fs::write(output, content) {
                eprintln!("failed to write {}: {err}", output.display());
                std::process::exit(1);
            }
            println!("wrote sample config to {}", output.display());
        }
        Some(Commands::ValidateConfig) => {
            let mut config = ReloadableConfig::new(&cli.config);
            match config.poll() {
                Ok(_) => println!("{}: ok", cli.config.display()),
                Err(err) => {
                    eprintln!("{}: {err}", cli.config.display());
                    std::process::exit(1);
                }
            }
        }
        Some(Commands::Run) | None => {
            let code = run_keeper(cli).await;
            std::process::exit(code);
        }
    }
}

async fn run_keeper(cli: Cli) -> i32 {
    let app = match load_app_config(cli.app_config.as_deref()) {
        Ok(app) => app,
        Err(err) => {
            eprintln!("failed to load app config: {err}");
            return 1;
        }
    };

    let mut log_config = app.logging.clone();
    if let Some(ref format) = cli.log_format {
        log_config.format = match format.as_str() {
            "json" => LogFormat::Json,
            "compact" => LogFormat::Compact,
            _ => LogFormat::Pretty,
        };
    }
    let _guards = match init_logging(&log_config, cli.log_level.as_deref()) {
        Ok(guards) => guards,
        Err(err) => {
            eprintln!("failed to initialize logging: {err}");
            return 1;
        }
    };

    // Bands config: the initial content must be valid to start at all.
    let mut bands_config = ReloadableConfig::new(&cli.config);
    if let Err(err) = bands_config.poll() {
        let err = KeeperError::from(err);
        error!(error = %err, "startup failed");
        return err.exit_code();
    }

    // Cooperative shutdown: SIGINT flips the flag, the control task finishes
    // the cycle and drains.
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, draining");
            let _ = shutdown_tx.send(true);
        }
    });

    let (bands_rx, watcher) = spawn_watcher(
        bands_config,
        Duration::from_secs(cli.config_poll_interval),
        shutdown_rx.clone(),
    );

    let factory = FeedFactory::new(Duration::from_secs(cli.price_feed_expiry));
    let feed = match factory.create(&cli.price_feed) {
        Ok(feed) => feed,
        Err(err) => {
            let err = KeeperError::from(err);
            error!(error = %err, "startup failed");
            return err.exit_code();
        }
    };

    let adapter = Arc::new(PaperExchange::new(
        Pair::new(app.paper.base.clone(), app.paper.quote.clone()),
        Balances::new(app.paper.buy_balance, app.paper.sell_balance),
        MinAmounts {
            buy: app.paper.min_buy_amount,
            sell: app.paper.min_sell_amount,
        },
    ));

    let keeper_config = KeeperConfig {
        refresh_interval: Duration::from_secs(
            cli.refresh_frequency.unwrap_or(app.keeper.refresh_frequency),
        ),
        dispatch_concurrency: app.keeper.dispatch_concurrency,
        call_timeout: Duration::from_secs(app.keeper.exchange_timeout),
        max_failed_cycles: app.keeper.max_failed_cycles,
        balance_floor: Balances::new(
            cli.balance_floor_buy.unwrap_or(0.0),
            cli.balance_floor_sell.unwrap_or(0.0),
        ),
        cancel_on_shutdown: app.keeper.cancel_on_shutdown && !cli.no_cancel_on_shutdown,
        withdraw_on_shutdown: app.keeper.withdraw_on_shutdown,
        fail_closed_after: cli.fail_closed_after.map(Duration::from_secs),
        ..Default::default()
    };

    let mut keeper = Keeper::new(keeper_config, adapter, feed, bands_rx, shutdown_rx);
    if let Some(endpoint) = cli.order_history.clone() {
        keeper = keeper.with_reporter(OrderHistoryReporter::spawn(
            endpoint,
            Duration::from_secs(cli.order_history_every),
        ));
    }

    let result = keeper.run().await;
    watcher.abort();

    match result {
        Ok(()) => {
            info!("clean drain");
            0
        }
        Err(err) => {
            error!(error = %err, "keeper exited");
            err.exit_code()
        }
    }
}
