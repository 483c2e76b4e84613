//! Keeper-side view of its own resting orders.
//!
//! Exchange snapshots are eventually consistent: an order just placed may
//! not appear yet, an order just cancelled may linger. The view papers over
//! the gap with two short-lived in-flight sets and ages their entries out
//! after a bounded number of cycles so a lost API call can never
//! desynchronize the book permanently.

use std::collections::HashMap;

use tracing::debug;

use crate::infra::logging::targets;
use crate::keeper::exchange::{Order, OrderId};

/// Cycles an unconfirmed in-flight entry survives before it is discarded.
pub const MAX_INFLIGHT_AGE_CYCLES: u32 = 10;

#[derive(Debug)]
struct InFlightOrder {
    order: Order,
    age_cycles: u32,
}

/// Snapshot of resting orders augmented with in-flight placements and
/// cancellations.
///
/// Invariant: no id is in both in-flight sets at once.
#[derive(Debug, Default)]
pub struct OrderBookView {
    resting: Vec<Order>,
    in_flight_placed: HashMap<OrderId, InFlightOrder>,
    in_flight_cancelled: HashMap<OrderId, u32>,
}

impl OrderBookView {
    pub fn new() -> Self {
        Self::default()
    }

    /// Absorb a freshly fetched exchange snapshot.
    ///
    /// Placed entries whose id now shows up in the snapshot are confirmed
    /// and dropped; cancelled entries whose id no longer shows up are done.
    /// Everything else ages by one cycle and is evicted past the bound.
    pub fn apply_snapshot(&mut self, snapshot: Vec<Order>) {
        self.in_flight_placed.retain(|id, entry| {
            if snapshot.iter().any(|order| &order.id == id) {
                return false;
            }
            entry.age_cycles += 1;
            entry.age_cycles < MAX_INFLIGHT_AGE_CYCLES
        });

        self.in_flight_cancelled.retain(|id, age| {
            if !snapshot.iter().any(|order| &order.id == id) {
                return false;
            }
            *age += 1;
            *age < MAX_INFLIGHT_AGE_CYCLES
        });

        self.resting = snapshot;
        debug!(
            target: targets::BOOK,
            resting = self.resting.len(),
            in_flight_placed = self.in_flight_placed.len(),
            in_flight_cancelled = self.in_flight_cancelled.len(),
            "order book refreshed"
        );
    }

    /// Register an order whose placement request was just issued.
    pub fn note_placed(&mut self, order: Order) {
        self.in_flight_cancelled.remove(&order.id);
        self.in_flight_placed.insert(
            order.id.clone(),
            InFlightOrder {
                order,
                age_cycles: 0,
            },
        );
    }

    /// Register an id whose cancel request was just issued.
    pub fn note_cancelled(&mut self, id: &OrderId) {
        // A cancel may target a not-yet-confirmed placement; the order can
        // still surface in a snapshot once, so the cancel is tracked either
        // way and the placed entry dropped to keep the sets disjoint.
        self.in_flight_placed.remove(id);
        self.in_flight_cancelled.insert(id.clone(), 0);
    }

    /// The book the band engine sees:
    /// (snapshot ∪ in-flight placed) \ in-flight cancelled.
    pub fn effective_orders(&self) -> Vec<Order> {
        let mut orders: Vec<Order> = self
            .resting
            .iter()
            .filter(|order| !self.in_flight_cancelled.contains_key(&order.id))
            .cloned()
            .collect();
        orders.extend(
            self.in_flight_placed
                .values()
                .map(|entry| entry.order.clone()),
        );
        orders
    }

    /// True once both in-flight sets have drained.
    pub fn is_reconciled(&self) -> bool {
        self.in_flight_placed.is_empty() && self.in_flight_cancelled.is_empty()
    }

    pub fn resting_len(&self) -> usize {
        self.resting.len()
    }
}
