//! Optional order-history reporting.
//!
//! When configured, the control loop offers the effective book after each
//! cycle and a background task POSTs the latest snapshot to an opaque HTTP
//! endpoint on its own interval. Reporting failures never touch the loop.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, warn};

use crate::infra::logging::targets;
use crate::keeper::exchange::{Order, Pair, Side};

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportedOrder {
    pub id: String,
    pub price: f64,
    pub amount: f64,
}

impl From<&Order> for ReportedOrder {
    fn from(order: &Order) -> Self {
        Self {
            id: order.id.to_string(),
            price: order.price,
            amount: order.amount(),
        }
    }
}

/// Payload POSTed to the reporting endpoint.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BookReport {
    pub timestamp: DateTime<Utc>,
    pub pair: String,
    pub buy_orders: Vec<ReportedOrder>,
    pub sell_orders: Vec<ReportedOrder>,
}

impl BookReport {
    pub fn new(pair: &Pair, orders: &[Order]) -> Self {
        let side_orders = |side: Side| {
            orders
                .iter()
                .filter(|order| order.side == side)
                .map(ReportedOrder::from)
                .collect()
        };
        Self {
            timestamp: Utc::now(),
            pair: pair.to_string(),
            buy_orders: side_orders(Side::Buy),
            sell_orders: side_orders(Side::Sell),
        }
    }
}

/// Latest-wins hand-off between the control loop and the posting task.
#[derive(Debug, Clone, Default)]
struct ReportSlot {
    inner: Arc<Mutex<Option<BookReport>>>,
}

impl ReportSlot {
    fn offer(&self, report: BookReport) {
        *self.inner.lock().unwrap() = Some(report);
    }

    fn take(&self) -> Option<BookReport> {
        self.inner.lock().unwrap().take()
    }
}

/// Posts the effective book to a reporting endpoint.
pub struct OrderHistoryReporter {
    slot: ReportSlot,
    poster: tokio::task::JoinHandle<()>,
}

impl OrderHistoryReporter {
    pub fn spawn(endpoint: String, every: Duration) -> Self {
        let slot = ReportSlot::default();
        let poster = tokio::spawn(run_poster(endpoint, every, slot.clone()));
        Self { slot, poster }
    }

    /// Hand the latest effective book to the posting task.
    pub fn offer(&self, report: BookReport) {
        self.slot.offer(report);
    }
}

impl Drop for OrderHistoryReporter {
    fn drop(&mut self) {
        self.poster.abort();
    }
}

async fn run_poster(endpoint: String, every: Duration, slot: ReportSlot) {
    let client = reqwest::Client::new();
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let Some(report) = slot.take() else {
            continue;
        };
        match client.post(&endpoint).json(&report).send().await {
            Ok(response) if response.status().is_success() => {
                debug!(target: targets::CORE, endpoint = %endpoint, "order history reported");
            }
            Ok(response) => {
                warn!(
                    target: targets::CORE,
                    endpoint = %endpoint,
                    status = %response.status(),
                    "order history endpoint rejected report"
                );
            }
            Err(err) => {
                warn!(
                    target: targets::CORE,
                    endpoint = %endpoint,
                    error = %err,
                    "order history report failed"
                );
            }
        }
    }
}
