//! In-memory exchange adapter.
//!
//! Lets the keeper run end to end without venue credentials: orders rest in
//! a map, balances are debited and refunded, nothing ever fills. Used by
//! the demo binary and by the control-loop tests.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;

use crate::errors::ExchangeError;
use crate::keeper::exchange::{
    Balances, ExchangeAdapter, MinAmounts, Order, OrderId, Pair, Side,
};

#[derive(Debug)]
struct PaperState {
    next_id: u64,
    orders: HashMap<OrderId, Order>,
    balances: Balances,
}

/// Exchange adapter backed by process memory.
pub struct PaperExchange {
    pair: Pair,
    mins: MinAmounts,
    state: Mutex<PaperState>,
}

impl PaperExchange {
    pub fn new(pair: Pair, balances: Balances, mins: MinAmounts) -> Self {
        Self {
            pair,
            mins,
            state: Mutex::new(PaperState {
                next_id: 1,
                orders: HashMap::new(),
                balances,
            }),
        }
    }

    /// Number of currently resting orders.
    pub fn open_orders(&self) -> usize {
        self.state.lock().unwrap().orders.len()
    }
}

#[async_trait]
impl ExchangeAdapter for PaperExchange {
    async fn get_orders(&self) -> Result<Vec<Order>, ExchangeError> {
        let state = self.state.lock().unwrap();
        Ok(state.orders.values().cloned().collect())
    }

    async fn place_order(
        &self,
        side: Side,
        price: f64,
        amount: f64,
    ) -> Result<OrderId, ExchangeError> {
        if price <= 0.0 || amount <= 0.0 {
            return Err(ExchangeError::transient("non-positive order"));
        }
        if amount < self.mins.side(side) {
            return Err(ExchangeError::transient(format!(
                "amount {amount} below exchange minimum"
            )));
        }

        let mut state = self.state.lock().unwrap();
        let free = match side {
            Side::Buy => &mut state.balances.buy,
            Side::Sell => &mut state.balances.sell,
        };
        if *free < amount {
            return Err(ExchangeError::transient("insufficient balance"));
        }
        *free -= amount;

        let id = OrderId::new(format!("paper-{}", state.next_id));
        state.next_id += 1;

        // Render the venue triple from the pay-side amount.
        let (buy_amount, sell_amount) = match side {
            Side::Buy => (amount / price, amount),
            Side::Sell => (amount * price, amount),
        };
        let mut order = Order::new(id.clone(), side, price, buy_amount, sell_amount);
        order.created_at = Some(Utc::now());
        state.orders.insert(id.clone(), order);
        Ok(id)
    }

    async fn cancel_order(&self, id: &OrderId) -> Result<(), ExchangeError> {
        let mut state = self.state.lock().unwrap();
        let order = state
            .orders
            .remove(id)
            .ok_or_else(|| ExchangeError::transient(format!("unknown order {id}")))?;
        match order.side {
            Side::Buy => state.balances.buy += order.sell_amount,
            Side::Sell => state.balances.sell += order.sell_amount,
        }
        Ok(())
    }

    async fn balances(&self) -> Result<Balances, ExchangeError> {
        Ok(self.state.lock().unwrap().balances)
    }

    fn min_amounts(&self) -> MinAmounts {
        self.mins
    }

    fn pair(&self) -> &Pair {
        &self.pair
    }
}
