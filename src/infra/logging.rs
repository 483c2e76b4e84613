//! Structured logging bootstrap.
//!
//! Components log through per-component targets so operators can filter
//! with `RUST_LOG`:
//!
//! | Target | Description |
//! |--------|-------------|
//! | `keeper::core` | Control loop lifecycle and state transitions |
//! | `keeper::engine` | Band engine decisions and idle transitions |
//! | `keeper::feed` | Price feed availability and reconnects |
//! | `keeper::book` | Order book refresh and in-flight reconciliation |
//! | `keeper::execution` | Order placement/cancellation dispatch |
//! | `keeper::config` | Bands configuration loading and reloads |

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Log output format.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    /// Human-readable format (default for development)
    #[default]
    Pretty,
    /// JSON format (best for log aggregation)
    Json,
    /// Compact single-line format
    Compact,
}

/// Logging configuration for the keeper.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct LogConfig {
    /// Format for stdout logging
    #[serde(default)]
    pub format: LogFormat,

    /// Optional directory for a daily-rolling JSON log file
    #[serde(default)]
    pub log_dir: Option<PathBuf>,
}

/// Initialize logging. The returned guard must be kept alive for the
/// duration of the program when a log file is configured.
pub fn init_logging(
    config: &LogConfig,
    env_filter_override: Option<&str>,
) -> Result<Vec<WorkerGuard>, Box<dyn std::error::Error>> {
    let mut guards = Vec::new();

    let base_filter = if let Some(filter) = env_filter_override {
        EnvFilter::new(filter)
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("info")
                .add_directive("hyper=warn".parse().unwrap())
                .add_directive("reqwest=warn".parse().unwrap())
                .add_directive("tokio_tungstenite=warn".parse().unwrap())
                .add_directive("tungstenite=warn".parse().unwrap())
        })
    };

    if let Some(ref log_dir) = config.log_dir {
        std::fs::create_dir_all(log_dir)?;
        let appender = RollingFileAppender::new(Rotation::DAILY, log_dir, "keeper.log");
        let (writer, guard) = tracing_appender::non_blocking(appender);
        guards.push(guard);

        let file_layer = fmt::layer().with_writer(writer).with_ansi(false).json();

        match config.format {
            LogFormat::Json => {
                tracing_subscriber::registry()
                    .with(base_filter)
                    .with(file_layer)
                    .with(fmt::layer().json())
                    .init();
            }
            LogFormat::Compact => {
                tracing_subscriber::registry()
                    .with(base_filter)
                    .with(file_layer)
                    .with(fmt::layer().compact())
                    .init();
            }
            LogFormat::Pretty => {
                tracing_subscriber::registry()
                    .with(base_filter)
                    .with(file_layer)
                    .with(fmt::layer().with_target(false))
                    .init();
            }
        }
    } else {
        match config.format {
            LogFormat::Json => {
                tracing_subscriber::fmt()
                    .with_env_filter(base_filter)
                    .json()
                    .init();
            }
            LogFormat::Compact => {
                tracing_subscriber::fmt()
                    .with_env_filter(base_filter)
                    .compact()
                    .init();
            }
            LogFormat::Pretty => {
                tracing_subscriber::fmt()
                    .with_env_filter(base_filter)
                    .with_target(false)
                    .init();
            }
        }
    }

    Ok(guards)
}

/// Log target constants for component-specific logging.
pub mod targets {
    /// Control loop lifecycle and state transitions
    pub const CORE: &str = "keeper::core";
    /// Band engine decisions
    pub const ENGINE: &str = "keeper::engine";
    /// Price feed availability
    pub const FEED: &str = "keeper::feed";
    /// Order book view
    pub const BOOK: &str = "keeper::book";
    /// Order dispatch
    pub const EXECUTION: &str = "keeper::execution";
    /// Bands configuration
    pub const CONFIG: &str = "keeper::config";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_config_defaults() {
        let config = LogConfig::default();
        assert_eq!(config.format, LogFormat::Pretty);
        assert!(config.log_dir.is_none());
    }

    #[test]
    fn test_log_format_serde() {
        let json = serde_json::to_string(&LogFormat::Json).unwrap();
        assert_eq!(json, "\"json\"");

        let parsed: LogFormat = serde_json::from_str("\"compact\"").unwrap();
        assert_eq!(parsed, LogFormat::Compact);
    }
}
