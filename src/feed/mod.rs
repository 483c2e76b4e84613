//! Price feed tree.
//!
//! A feed yields the latest [`PriceReading`] or nothing. Leaf feeds either
//! answer synchronously (fixed, file) or run a background producer that
//! keeps a shared slot warm (websocket, shell command, oracle). Combinators
//! wrap feeds into expiry, failover, inverse, and averaging nodes; the
//! factory builds the whole tree from the CLI feed grammar.

pub mod combinators;
pub mod factory;
pub mod leaf;
pub mod oracle;
pub mod ws;

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// A decimal price plus the monotonic instant it was acquired.
#[derive(Debug, Clone, Copy)]
pub struct PriceReading {
    pub price: f64,
    pub at: Instant,
}

impl PriceReading {
    /// A reading acquired right now.
    pub fn now(price: f64) -> Self {
        Self {
            price,
            at: Instant::now(),
        }
    }

    pub fn age(&self) -> Duration {
        self.at.elapsed()
    }
}

/// A source of reference prices. `peek` never blocks on I/O beyond a local
/// file read; feeds that produce prices out-of-band run their own tasks.
pub trait PriceFeed: Send + Sync {
    /// Latest reading, or `None` when the source is unavailable.
    fn peek(&self) -> Option<PriceReading>;

    /// Human-readable description for logs.
    fn label(&self) -> String;
}

impl std::fmt::Debug for dyn PriceFeed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PriceFeed").field("label", &self.label()).finish()
    }
}

/// Last-writer-wins slot shared between a producer task and readers.
#[derive(Debug, Clone, Default)]
pub(crate) struct SharedSlot {
    inner: Arc<Mutex<Option<PriceReading>>>,
}

impl SharedSlot {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn store(&self, reading: PriceReading) {
        *self.inner.lock().unwrap() = Some(reading);
    }

    pub(crate) fn load(&self) -> Option<PriceReading> {
        *self.inner.lock().unwrap()
    }
}
