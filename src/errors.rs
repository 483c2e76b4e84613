use thiserror::Error;

/// Configuration loading and validation errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("config read error: {0}")]
    Io(#[from] std::io::Error),
    #[error("config parse error: {0}")]
    Parse(String),
    #[error("template expansion error: {0}")]
    Template(String),
    #[error("invalid configuration: {0}")]
    Validation(String),
}

/// Price feed errors.
#[derive(Error, Debug, Clone)]
pub enum FeedError {
    #[error("price unavailable")]
    Unavailable,
    #[error("malformed price message: {0}")]
    Malformed(String),
    #[error("oracle read error: {0}")]
    Oracle(String),
}

/// Exchange adapter call errors.
///
/// The transient/permanent split drives the control loop's retry policy:
/// transient failures are retried on the next cycle, permanent failures
/// drain the keeper.
#[derive(Error, Debug, Clone)]
pub enum ExchangeError {
    #[error("transient exchange error: {0}")]
    Transient(String),
    #[error("permanent exchange error: {0}")]
    Permanent(String),
    #[error("exchange call timed out")]
    Timeout,
}

impl ExchangeError {
    pub fn is_permanent(&self) -> bool {
        matches!(self, ExchangeError::Permanent(_))
    }

    /// Create a transient error.
    pub fn transient(msg: impl Into<String>) -> Self {
        ExchangeError::Transient(msg.into())
    }

    /// Create a permanent error.
    pub fn permanent(msg: impl Into<String>) -> Self {
        ExchangeError::Permanent(msg.into())
    }
}

/// Top-level keeper errors.
#[derive(Error, Debug)]
pub enum KeeperError {
    /// Pre-start balance below the configured floor.
    #[error("unsafe to start: {0}")]
    UnsafeToStart(String),

    /// Bands configuration could not be loaded at startup.
    #[error("invalid config: {0}")]
    InvalidConfig(#[from] ConfigError),

    /// The exchange reported a permanent failure.
    #[error("exchange failure: {0}")]
    Exchange(#[from] ExchangeError),

    /// The feed tree stayed unavailable past the fail-closed deadline.
    #[error("price feed unavailable for {0:?} (fail-closed)")]
    FeedFailed(std::time::Duration),

    /// Too many consecutive cycles failed to dispatch any order.
    #[error("dispatch stalled for {cycles} consecutive cycles")]
    DispatchStalled { cycles: u32 },
}

impl KeeperError {
    /// Process exit code for the binary.
    pub fn exit_code(&self) -> i32 {
        match self {
            KeeperError::UnsafeToStart(_)
            | KeeperError::InvalidConfig(_)
            | KeeperError::Exchange(_) => 1,
            KeeperError::DispatchStalled { .. } => 2,
            KeeperError::FeedFailed(_) => 3,
        }
    }
}
