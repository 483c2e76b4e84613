//! Exchange adapter contract consumed by the keeper core.
//!
//! Adapters are external collaborators: the core is indifferent to how
//! orders physically reach the venue. Everything the band engine and the
//! control loop need from an exchange is captured by [`ExchangeAdapter`].

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::errors::ExchangeError;

/// Side of an order (buy or sell).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn opposite(self) -> Self {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Side::Buy => "buy",
            Side::Sell => "sell",
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Opaque exchange-assigned order identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OrderId(pub String);

impl OrderId {
    pub fn new(id: impl Into<String>) -> Self {
        OrderId(id.into())
    }

    /// Identifier for an order whose placement call timed out before the
    /// venue returned an id. Never matches a snapshot id, so the entry ages
    /// out of the in-flight set after the bounded number of cycles.
    pub fn tentative(seq: u64) -> Self {
        OrderId(format!("tentative-{seq}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OrderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for OrderId {
    fn from(s: &str) -> Self {
        OrderId(s.to_string())
    }
}

/// A resting order owned by this keeper.
///
/// `price` is quote per base in the venue's convention. `sell_amount` is the
/// remaining amount the order pays out (quote for a buy order, base for a
/// sell order); `buy_amount` is the remaining amount it acquires. Band
/// amounts are denominated in the pay-out token, so [`Order::amount`] is the
/// quantity the band algebra sums.
#[derive(Debug, Clone)]
pub struct Order {
    pub id: OrderId,
    pub side: Side,
    pub price: f64,
    pub buy_amount: f64,
    pub sell_amount: f64,
    pub created_at: Option<DateTime<Utc>>,
}

impl Order {
    pub fn new(id: OrderId, side: Side, price: f64, buy_amount: f64, sell_amount: f64) -> Self {
        Self {
            id,
            side,
            price,
            buy_amount,
            sell_amount,
            created_at: None,
        }
    }

    /// Remaining pay-side amount, in the denomination of this side's bands.
    pub fn amount(&self) -> f64 {
        self.sell_amount
    }
}

/// Free balances per side: `buy` is the buy-token (quote) balance backing
/// buy orders, `sell` the sell-token (base) balance backing sell orders.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Balances {
    pub buy: f64,
    pub sell: f64,
}

impl Balances {
    pub fn new(buy: f64, sell: f64) -> Self {
        Self { buy, sell }
    }

    pub fn side(&self, side: Side) -> f64 {
        match side {
            Side::Buy => self.buy,
            Side::Sell => self.sell,
        }
    }
}

/// Exchange-side minimum order amounts per side.
#[derive(Debug, Clone, Copy, Default)]
pub struct MinAmounts {
    pub buy: f64,
    pub sell: f64,
}

impl MinAmounts {
    pub fn side(&self, side: Side) -> f64 {
        match side {
            Side::Buy => self.buy,
            Side::Sell => self.sell,
        }
    }
}

/// Which token is base and which is quote on this venue.
#[derive(Debug, Clone)]
pub struct Pair {
    pub base: String,
    pub quote: String,
}

impl Pair {
    pub fn new(base: impl Into<String>, quote: impl Into<String>) -> Self {
        Self {
            base: base.into(),
            quote: quote.into(),
        }
    }
}

impl fmt::Display for Pair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.base, self.quote)
    }
}

/// Contract every venue adapter implements for the keeper core.
///
/// `place_order` takes the pay-side amount in the band denomination and
/// renders the venue's native (buyAmount, sellAmount, price) triple itself.
/// Call-level timeouts are enforced by the control loop, not by adapters.
#[async_trait]
pub trait ExchangeAdapter: Send + Sync {
    /// Snapshot of the keeper's currently resting orders.
    async fn get_orders(&self) -> Result<Vec<Order>, ExchangeError>;

    /// Place an order; returns the exchange-assigned id.
    async fn place_order(
        &self,
        side: Side,
        price: f64,
        amount: f64,
    ) -> Result<OrderId, ExchangeError>;

    /// Cancel a resting order.
    async fn cancel_order(&self, id: &OrderId) -> Result<(), ExchangeError>;

    /// Current free balances.
    async fn balances(&self) -> Result<Balances, ExchangeError>;

    /// Exchange-side lower bounds on order amounts.
    fn min_amounts(&self) -> MinAmounts;

    /// Base/quote convention of the traded pair.
    fn pair(&self) -> &Pair;

    /// Whether the drain sequence should cancel all orders.
    fn supports_cancel_all_on_shutdown(&self) -> bool {
        true
    }

    /// Whether the drain sequence should withdraw deposits.
    fn supports_withdraw_on_shutdown(&self) -> bool {
        false
    }

    /// Withdraw all deposits. Only called when
    /// [`supports_withdraw_on_shutdown`](Self::supports_withdraw_on_shutdown)
    /// returns true.
    async fn withdraw_all(&self) -> Result<(), ExchangeError> {
        Ok(())
    }
}
