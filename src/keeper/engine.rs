//! Per-cycle cancel/place decision making.
//!
//! The engine composes the validated band set, the effective order book,
//! balances, and rate-limit allowances into one [`CyclePlan`]. It holds no
//! exchange state of its own; the only thing it remembers between cycles is
//! why it last went idle, so each idle transition is logged exactly once.

use std::collections::HashSet;

use tracing::{info, warn};

use crate::infra::logging::targets;
use crate::keeper::bands::{Bands, PlaceIntent, SideAllowance};
use crate::keeper::exchange::{Balances, MinAmounts, Order, OrderId};

/// Why the engine refuses to act this cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdleReason {
    /// The feed tree produced no fresh reading.
    StalePrice,
    /// No valid band set is available (startup before first valid config).
    NoConfig,
}

impl IdleReason {
    fn describe(self) -> &'static str {
        match self {
            IdleReason::StalePrice => "reference price unavailable or stale",
            IdleReason::NoConfig => "no valid bands configuration",
        }
    }
}

/// Inputs of one evaluation cycle.
#[derive(Debug)]
pub struct EngineInputs<'a> {
    /// Fresh reference price, if the feed tree has one.
    pub price: Option<f64>,
    /// Current valid band set, if one exists.
    pub bands: Option<&'a Bands>,
    /// Effective order book (snapshot plus in-flight adjustments).
    pub book: &'a [Order],
    /// Free balances per side.
    pub balances: Balances,
    /// Remaining rate-limit allowance per side.
    pub allowance: SideAllowance,
    /// Exchange-side minimum order amounts.
    pub mins: MinAmounts,
}

/// The engine's output for one cycle. All cancels are dispatched before any
/// place to avoid self-crossing.
#[derive(Debug, Default)]
pub struct CyclePlan {
    pub cancels: Vec<Order>,
    pub places: Vec<PlaceIntent>,
}

impl CyclePlan {
    pub fn is_empty(&self) -> bool {
        self.cancels.is_empty() && self.places.is_empty()
    }
}

/// Stateless order synthesis plus the idle-reason latch.
#[derive(Debug, Default)]
pub struct BandEngine {
    idle: Option<IdleReason>,
}

impl BandEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn idle_reason(&self) -> Option<IdleReason> {
        self.idle
    }

    /// Evaluate one cycle. An unavailable price or missing band set idles
    /// the engine: no cancels, no places, until the cause clears.
    pub fn plan(&mut self, inputs: EngineInputs<'_>) -> CyclePlan {
        let bands = match inputs.bands {
            Some(bands) => bands,
            None => {
                self.enter_idle(IdleReason::NoConfig);
                return CyclePlan::default();
            }
        };
        let price = match inputs.price {
            Some(price) if price > 0.0 => price,
            _ => {
                self.enter_idle(IdleReason::StalePrice);
                return CyclePlan::default();
            }
        };
        self.leave_idle();

        let cancels = bands.cancellable_orders(inputs.book, price);

        let cancelled_ids: HashSet<&OrderId> = cancels.iter().map(|order| &order.id).collect();
        let remaining: Vec<Order> = inputs
            .book
            .iter()
            .filter(|order| !cancelled_ids.contains(&order.id))
            .cloned()
            .collect();

        let places = bands.new_orders(
            &remaining,
            inputs.balances,
            inputs.allowance,
            &inputs.mins,
            price,
        );

        CyclePlan { cancels, places }
    }

    fn enter_idle(&mut self, reason: IdleReason) {
        if self.idle != Some(reason) {
            warn!(
                target: targets::ENGINE,
                reason = reason.describe(),
                "engine idle, leaving order book untouched"
            );
            self.idle = Some(reason);
        }
    }

    fn leave_idle(&mut self) {
        if let Some(reason) = self.idle.take() {
            info!(
                target: targets::ENGINE,
                cleared = reason.describe(),
                "engine resuming"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keeper::bands::BandsDocument;
    use crate::keeper::exchange::{OrderId, Side};

    fn bands_json(json: &str) -> Bands {
        let doc: BandsDocument = serde_json::from_str(json).unwrap();
        Bands::from_document(&doc).unwrap()
    }

    fn sell_order(id: &str, price: f64, amount: f64) -> Order {
        Order::new(OrderId::from(id), Side::Sell, price, amount * price, amount)
    }

    fn buy_order(id: &str, price: f64, amount: f64) -> Order {
        Order::new(OrderId::from(id), Side::Buy, price, amount / price, amount)
    }

    fn inputs<'a>(price: Option<f64>, bands: Option<&'a Bands>, book: &'a [Order]) -> EngineInputs<'a> {
        EngineInputs {
            price,
            bands,
            book,
            balances: Balances::new(1000.0, 1000.0),
            allowance: SideAllowance::unlimited(),
            mins: MinAmounts::default(),
        }
    }

    const SELL_BANDS: &str = r#"{
        "sellBands": [{"minMargin": 0.005, "avgMargin": 0.01, "maxMargin": 0.03,
                       "minAmount": 10, "avgAmount": 20, "maxAmount": 30, "dustCutoff": 0}]
    }"#;

    #[test]
    fn test_stale_price_emits_nothing() {
        let bands = bands_json(SELL_BANDS);
        let book = vec![sell_order("1", 103.0, 15.0)];
        let mut engine = BandEngine::new();

        let plan = engine.plan(inputs(None, Some(&bands), &book));
        assert!(plan.is_empty());
        assert_eq!(engine.idle_reason(), Some(IdleReason::StalePrice));
    }

    #[test]
    fn test_missing_config_emits_nothing() {
        let book = vec![sell_order("1", 103.0, 15.0)];
        let mut engine = BandEngine::new();

        let plan = engine.plan(inputs(Some(100.0), None, &book));
        assert!(plan.is_empty());
        assert_eq!(engine.idle_reason(), Some(IdleReason::NoConfig));
    }

    #[test]
    fn test_idle_clears_when_price_returns() {
        let bands = bands_json(SELL_BANDS);
        let mut engine = BandEngine::new();

        engine.plan(inputs(None, Some(&bands), &[]));
        assert!(engine.idle_reason().is_some());

        let plan = engine.plan(inputs(Some(100.0), Some(&bands), &[]));
        assert!(engine.idle_reason().is_none());
        assert_eq!(plan.places.len(), 1);
    }

    #[test]
    fn test_price_move_cancels_and_refills_in_one_cycle() {
        // Sell resting at 103 is inside the band at reference 100. When the
        // reference drops to 99 the margin becomes ~+0.0404: cancel it and
        // refill the now-empty band, cancels ahead of places.
        let bands = bands_json(SELL_BANDS);
        let book = vec![sell_order("1", 103.0, 15.0)];
        let mut engine = BandEngine::new();

        let plan = engine.plan(inputs(Some(99.0), Some(&bands), &book));
        assert_eq!(plan.cancels.len(), 1);
        assert_eq!(plan.cancels[0].id.as_str(), "1");
        assert_eq!(plan.places.len(), 1);
        assert_eq!(plan.places[0].side, Side::Sell);
        assert!((plan.places[0].price - 99.0 * 1.01).abs() < 1e-9);
        assert!((plan.places[0].amount - 20.0).abs() < 1e-9);
    }

    #[test]
    fn test_no_excessive_order_survives_plan() {
        // Property: applying the plan to the book leaves no order outside
        // its side's bands.
        let bands = bands_json(SELL_BANDS);
        let book = vec![
            sell_order("in", 101.0, 12.0),
            sell_order("out-low", 100.2, 5.0),
            sell_order("out-high", 105.0, 5.0),
        ];
        let mut engine = BandEngine::new();
        let plan = engine.plan(inputs(Some(100.0), Some(&bands), &book));

        let cancelled: Vec<&str> = plan.cancels.iter().map(|o| o.id.as_str()).collect();
        assert!(cancelled.contains(&"out-low"));
        assert!(cancelled.contains(&"out-high"));

        for order in book.iter().filter(|o| !cancelled.contains(&o.id.as_str())) {
            assert!(!bands.excessive(order, 100.0));
        }
    }

    #[test]
    fn test_boundary_order_feeds_adjacent_band_only() {
        // A resting buy at margin exactly 0.02 belongs to the wider band.
        // The narrow band is satisfied, so the only action is topping up the
        // wider band around the existing order; nothing is cancelled.
        let bands = bands_json(
            r#"{
                "buyBands": [
                    {"minMargin": 0.005, "avgMargin": 0.01, "maxMargin": 0.02,
                     "minAmount": 20, "avgAmount": 30, "maxAmount": 40, "dustCutoff": 0},
                    {"minMargin": 0.02, "avgMargin": 0.025, "maxMargin": 0.03,
                     "minAmount": 20, "avgAmount": 30, "maxAmount": 40, "dustCutoff": 0}
                ]
            }"#,
        );
        let book = vec![buy_order("near", 99.0, 25.0), buy_order("edge", 98.0, 10.0)];
        let mut engine = BandEngine::new();

        let plan = engine.plan(inputs(Some(100.0), Some(&bands), &book));
        assert!(plan.cancels.is_empty());
        assert_eq!(plan.places.len(), 1);
        assert!((plan.places[0].price - 97.5).abs() < 1e-9);
        assert!((plan.places[0].amount - 20.0).abs() < 1e-9);
    }

    #[test]
    fn test_rate_limited_shortfall_is_clamped() {
        // An hourly cap with 45 already used allows only 5 of the requested
        // 30; the engine places exactly the remainder.
        let bands = bands_json(
            r#"{
                "buyBands": [{"minMargin": 0.005, "avgMargin": 0.01, "maxMargin": 0.02,
                              "minAmount": 20, "avgAmount": 30, "maxAmount": 40, "dustCutoff": 0}],
                "buyLimits": [{"period": "1h", "amount": 50}]
            }"#,
        );
        let mut engine = BandEngine::new();
        let plan = engine.plan(EngineInputs {
            price: Some(100.0),
            bands: Some(&bands),
            book: &[],
            balances: Balances::new(1000.0, 0.0),
            allowance: SideAllowance {
                buy: 5.0,
                sell: f64::INFINITY,
            },
            mins: MinAmounts::default(),
        });
        assert_eq!(plan.places.len(), 1);
        assert!((plan.places[0].amount - 5.0).abs() < 1e-9);
    }

    #[test]
    fn test_insufficient_balance_skips_band_silently() {
        let bands = bands_json(SELL_BANDS);
        let mut engine = BandEngine::new();
        let plan = engine.plan(EngineInputs {
            price: Some(100.0),
            bands: Some(&bands),
            book: &[],
            balances: Balances::new(0.0, 0.0),
            allowance: SideAllowance::unlimited(),
            mins: MinAmounts::default(),
        });
        assert!(plan.is_empty());
        assert!(engine.idle_reason().is_none());
    }
}
