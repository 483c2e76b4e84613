//! Buy/sell band algebra: the price/amount policy that decides which
//! resting orders to cancel and which gaps to fill.
//!
//! A band covers a margin interval on one side of the reference price and
//! carries a target amount range. Amounts are denominated in the pay-out
//! token of the side: quote for buy bands, base for sell bands, which is
//! exactly what [`Order::amount`] returns.

use serde::Deserialize;

use crate::errors::ConfigError;
use crate::keeper::exchange::{Balances, MinAmounts, Order, Side};
use crate::keeper::limits::Limits;

/// Raw band record as it appears in the configuration document.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BandDocument {
    pub min_margin: f64,
    pub avg_margin: f64,
    pub max_margin: f64,
    pub min_amount: f64,
    pub avg_amount: f64,
    pub max_amount: f64,
    pub dust_cutoff: f64,
}

/// The whole bands document. Unknown top-level keys (the `_`-prefixed
/// documentation anchors among them) are tolerated and ignored.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BandsDocument {
    #[serde(default)]
    pub buy_bands: Vec<BandDocument>,
    #[serde(default)]
    pub sell_bands: Vec<BandDocument>,
    #[serde(default)]
    pub buy_limits: Limits,
    #[serde(default)]
    pub sell_limits: Limits,
}

/// A validated band on one side of the market.
#[derive(Debug, Clone)]
pub struct Band {
    pub side: Side,
    pub min_margin: f64,
    pub avg_margin: f64,
    pub max_margin: f64,
    pub min_amount: f64,
    pub avg_amount: f64,
    pub max_amount: f64,
    pub dust_cutoff: f64,
}

impl Band {
    fn from_document(side: Side, doc: &BandDocument) -> Result<Self, ConfigError> {
        let band = Band {
            side,
            min_margin: doc.min_margin,
            avg_margin: doc.avg_margin,
            max_margin: doc.max_margin,
            min_amount: doc.min_amount,
            avg_amount: doc.avg_amount,
            max_amount: doc.max_amount,
            dust_cutoff: doc.dust_cutoff,
        };
        band.validate()?;
        Ok(band)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let fields = [
            self.min_margin,
            self.avg_margin,
            self.max_margin,
            self.min_amount,
            self.avg_amount,
            self.max_amount,
            self.dust_cutoff,
        ];
        if fields.iter().any(|v| !v.is_finite() || *v < 0.0) {
            return Err(ConfigError::Validation(format!(
                "{} band has a negative or non-finite field",
                self.side
            )));
        }
        if !(self.min_margin <= self.avg_margin && self.avg_margin <= self.max_margin) {
            return Err(ConfigError::Validation(format!(
                "{} band margins are not monotone: {} / {} / {}",
                self.side, self.min_margin, self.avg_margin, self.max_margin
            )));
        }
        if self.min_margin >= self.max_margin {
            return Err(ConfigError::Validation(format!(
                "{} band margin interval is empty: [{}, {}]",
                self.side, self.min_margin, self.max_margin
            )));
        }
        if !(self.min_amount <= self.avg_amount && self.avg_amount <= self.max_amount) {
            return Err(ConfigError::Validation(format!(
                "{} band amounts are not monotone: {} / {} / {}",
                self.side, self.min_amount, self.avg_amount, self.max_amount
            )));
        }
        Ok(())
    }

    /// Price interval covered by this band at the given reference price,
    /// as `(lower, upper)` with membership `lower < price <= upper`.
    ///
    /// The half-open convention keeps an order sitting exactly on a shared
    /// boundary in exactly one band, stably across evaluations.
    fn price_range(&self, reference: f64) -> (f64, f64) {
        match self.side {
            Side::Buy => (
                reference * (1.0 - self.max_margin),
                reference * (1.0 - self.min_margin),
            ),
            Side::Sell => (
                reference * (1.0 + self.min_margin),
                reference * (1.0 + self.max_margin),
            ),
        }
    }

    /// Whether the order's price falls inside this band.
    pub fn includes(&self, order: &Order, reference: f64) -> bool {
        let (lower, upper) = self.price_range(reference);
        order.price > lower && order.price <= upper
    }

    /// Price at which this band places new orders: the reference shifted by
    /// the average margin.
    pub fn avg_price(&self, reference: f64) -> f64 {
        match self.side {
            Side::Buy => reference * (1.0 - self.avg_margin),
            Side::Sell => reference * (1.0 + self.avg_margin),
        }
    }

    /// Orders to cancel so the band total drops from above `max_amount`
    /// back to at most `avg_amount`. Greedy: the order whose price sits
    /// farthest from the band's average price goes first.
    pub fn excessive_orders(&self, orders: &[Order], reference: f64) -> Vec<Order> {
        let mut in_band: Vec<&Order> = orders
            .iter()
            .filter(|order| order.side == self.side && self.includes(order, reference))
            .collect();
        let mut total: f64 = in_band.iter().map(|order| order.amount()).sum();
        if total <= self.max_amount {
            return Vec::new();
        }

        let anchor = self.avg_price(reference);
        in_band.sort_by(|a, b| {
            let da = (a.price - anchor).abs();
            let db = (b.price - anchor).abs();
            db.partial_cmp(&da)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.id.as_str().cmp(b.id.as_str()))
        });

        let mut cancels = Vec::new();
        for order in in_band {
            if total <= self.avg_amount {
                break;
            }
            total -= order.amount();
            cancels.push(order.clone());
        }
        cancels
    }
}

/// A new order the band engine wants placed. `amount` is the pay-side
/// amount in the band's denomination; the adapter renders the venue triple.
#[derive(Debug, Clone, PartialEq)]
pub struct PlaceIntent {
    pub side: Side,
    pub price: f64,
    pub amount: f64,
}

/// Validated band set for both sides plus the per-side rate-limit rules.
#[derive(Debug, Clone, Default)]
pub struct Bands {
    pub buy_bands: Vec<Band>,
    pub sell_bands: Vec<Band>,
    pub buy_limits: Limits,
    pub sell_limits: Limits,
}

impl Bands {
    /// Parse and validate a JSON bands document.
    pub fn parse_json(raw: &str) -> Result<Self, ConfigError> {
        let doc: BandsDocument =
            serde_json::from_str(raw).map_err(|e| ConfigError::Parse(e.to_string()))?;
        Self::from_document(&doc)
    }

    /// Validate a parsed document. Any broken invariant rejects the whole
    /// snapshot; the caller keeps operating on the previous valid one.
    pub fn from_document(doc: &BandsDocument) -> Result<Self, ConfigError> {
        let buy_bands = doc
            .buy_bands
            .iter()
            .map(|band| Band::from_document(Side::Buy, band))
            .collect::<Result<Vec<_>, _>>()?;
        let sell_bands = doc
            .sell_bands
            .iter()
            .map(|band| Band::from_document(Side::Sell, band))
            .collect::<Result<Vec<_>, _>>()?;

        Self::check_overlap(&buy_bands)?;
        Self::check_overlap(&sell_bands)?;

        Ok(Bands {
            buy_bands,
            sell_bands,
            buy_limits: doc.buy_limits.clone(),
            sell_limits: doc.sell_limits.clone(),
        })
    }

    /// Margin intervals of one side must not overlap. Touching boundaries
    /// are fine; the half-open membership rule disambiguates them.
    fn check_overlap(bands: &[Band]) -> Result<(), ConfigError> {
        for (i, a) in bands.iter().enumerate() {
            for b in bands.iter().skip(i + 1) {
                if a.min_margin < b.max_margin && b.min_margin < a.max_margin {
                    return Err(ConfigError::Validation(format!(
                        "{} bands overlap: [{}, {}] and [{}, {}]",
                        a.side, a.min_margin, a.max_margin, b.min_margin, b.max_margin
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn bands(&self, side: Side) -> &[Band] {
        match side {
            Side::Buy => &self.buy_bands,
            Side::Sell => &self.sell_bands,
        }
    }

    pub fn limits(&self, side: Side) -> &Limits {
        match side {
            Side::Buy => &self.buy_limits,
            Side::Sell => &self.sell_limits,
        }
    }

    /// True iff the order's margin from the reference lies outside every
    /// band of its side.
    pub fn excessive(&self, order: &Order, reference: f64) -> bool {
        !self
            .bands(order.side)
            .iter()
            .any(|band| band.includes(order, reference))
    }

    /// The unique band containing the order, if any.
    pub fn assign_band(&self, order: &Order, reference: f64) -> Option<&Band> {
        self.bands(order.side)
            .iter()
            .find(|band| band.includes(order, reference))
    }

    /// Sum of the pay-side amounts of the given orders.
    pub fn total_amount<'a>(orders: impl IntoIterator<Item = &'a Order>) -> f64 {
        orders.into_iter().map(|order| order.amount()).sum()
    }

    /// All orders the engine should cancel this cycle: orders outside every
    /// band of their side, plus the per-band overfill trims.
    pub fn cancellable_orders(&self, book: &[Order], reference: f64) -> Vec<Order> {
        let mut cancels: Vec<Order> = book
            .iter()
            .filter(|order| self.excessive(order, reference))
            .cloned()
            .collect();

        for band in self.buy_bands.iter().chain(self.sell_bands.iter()) {
            cancels.extend(band.excessive_orders(book, reference));
        }
        cancels
    }

    /// Synthesize new orders for every band whose total sits strictly below
    /// its minimum, clamping by balance and the side's rate-limit allowance
    /// as it goes.
    pub fn new_orders(
        &self,
        book: &[Order],
        balances: Balances,
        limit_available: SideAllowance,
        mins: &MinAmounts,
        reference: f64,
    ) -> Vec<PlaceIntent> {
        let mut intents = Vec::new();
        self.fill_side(
            Side::Buy,
            book,
            balances.buy,
            limit_available.buy,
            mins,
            reference,
            &mut intents,
        );
        self.fill_side(
            Side::Sell,
            book,
            balances.sell,
            limit_available.sell,
            mins,
            reference,
            &mut intents,
        );
        intents
    }

    #[allow(clippy::too_many_arguments)]
    fn fill_side(
        &self,
        side: Side,
        book: &[Order],
        mut balance: f64,
        mut limit: f64,
        mins: &MinAmounts,
        reference: f64,
        intents: &mut Vec<PlaceIntent>,
    ) {
        for band in self.bands(side) {
            let total = Self::total_amount(
                book.iter()
                    .filter(|order| order.side == side && band.includes(order, reference)),
            );
            if total >= band.min_amount {
                continue;
            }

            let amount = (band.avg_amount - total).min(balance).min(limit);
            if amount < band.dust_cutoff || amount < mins.side(side) || amount <= 0.0 {
                // Underfunded or sub-dust this cycle; retried next cycle.
                continue;
            }

            balance -= amount;
            limit -= amount;
            intents.push(PlaceIntent {
                side,
                price: band.avg_price(reference),
                amount,
            });
        }
    }
}

/// Remaining rate-limit allowance per side, computed by the control task
/// from the placement history at the top of the cycle.
#[derive(Debug, Clone, Copy)]
pub struct SideAllowance {
    pub buy: f64,
    pub sell: f64,
}

impl SideAllowance {
    pub fn unlimited() -> Self {
        Self {
            buy: f64::INFINITY,
            sell: f64::INFINITY,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keeper::exchange::OrderId;

    fn buy_order(id: &str, price: f64, amount: f64) -> Order {
        Order::new(OrderId::from(id), Side::Buy, price, amount / price, amount)
    }

    fn sell_order(id: &str, price: f64, amount: f64) -> Order {
        Order::new(OrderId::from(id), Side::Sell, price, amount * price, amount)
    }

    fn band_doc(margins: (f64, f64, f64), amounts: (f64, f64, f64)) -> BandDocument {
        BandDocument {
            min_margin: margins.0,
            avg_margin: margins.1,
            max_margin: margins.2,
            min_amount: amounts.0,
            avg_amount: amounts.1,
            max_amount: amounts.2,
            dust_cutoff: 0.0,
        }
    }

    fn one_buy_band() -> Bands {
        Bands::from_document(&BandsDocument {
            buy_bands: vec![band_doc((0.005, 0.01, 0.02), (20.0, 30.0, 40.0))],
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn test_parse_tolerates_documentation_anchors() {
        let bands = Bands::parse_json(
            r#"{
                "_comment": "margins are fractions of the reference price",
                "buyBands": [{
                    "minMargin": 0.005, "avgMargin": 0.01, "maxMargin": 0.02,
                    "minAmount": 20, "avgAmount": 30, "maxAmount": 40,
                    "dustCutoff": 0.1
                }],
                "sellBands": [],
                "buyLimits": [{"period": "1h", "amount": 50}]
            }"#,
        )
        .unwrap();
        assert_eq!(bands.buy_bands.len(), 1);
        assert!(!bands.buy_limits.is_unlimited());
        assert!(bands.sell_limits.is_unlimited());
    }

    #[test]
    fn test_rejects_non_monotone_margins() {
        let err = Bands::from_document(&BandsDocument {
            sell_bands: vec![band_doc((0.02, 0.01, 0.03), (1.0, 2.0, 3.0))],
            ..Default::default()
        })
        .unwrap_err();
        assert!(matches!(err, ConfigError::Validation(_)));
    }

    #[test]
    fn test_rejects_non_monotone_amounts() {
        let err = Bands::from_document(&BandsDocument {
            buy_bands: vec![band_doc((0.005, 0.01, 0.02), (30.0, 20.0, 40.0))],
            ..Default::default()
        })
        .unwrap_err();
        assert!(matches!(err, ConfigError::Validation(_)));
    }

    #[test]
    fn test_rejects_overlapping_bands() {
        let err = Bands::from_document(&BandsDocument {
            sell_bands: vec![
                band_doc((0.005, 0.01, 0.02), (1.0, 2.0, 3.0)),
                band_doc((0.015, 0.02, 0.03), (1.0, 2.0, 3.0)),
            ],
            ..Default::default()
        })
        .unwrap_err();
        assert!(matches!(err, ConfigError::Validation(_)));
    }

    #[test]
    fn test_touching_bands_are_allowed() {
        let bands = Bands::from_document(&BandsDocument {
            buy_bands: vec![
                band_doc((0.005, 0.01, 0.02), (20.0, 30.0, 40.0)),
                band_doc((0.02, 0.025, 0.03), (20.0, 30.0, 40.0)),
            ],
            ..Default::default()
        })
        .unwrap();
        assert_eq!(bands.buy_bands.len(), 2);
    }

    #[test]
    fn test_boundary_order_belongs_to_one_band() {
        let bands = Bands::from_document(&BandsDocument {
            buy_bands: vec![
                band_doc((0.005, 0.01, 0.02), (20.0, 30.0, 40.0)),
                band_doc((0.02, 0.025, 0.03), (20.0, 30.0, 40.0)),
            ],
            ..Default::default()
        })
        .unwrap();

        // Margin exactly 0.02 at reference 100: price 98 sits on the shared
        // boundary and lands in the wider-margin band only.
        let order = buy_order("1", 98.0, 25.0);
        let assigned = bands.assign_band(&order, 100.0).unwrap();
        assert!((assigned.min_margin - 0.02).abs() < 1e-12);
        assert!(!bands.excessive(&order, 100.0));
    }

    #[test]
    fn test_excessive_outside_all_bands() {
        let bands = one_buy_band();
        // margin 0.04 at reference 100 is past maxMargin 0.02
        assert!(bands.excessive(&buy_order("1", 96.0, 10.0), 100.0));
        // margin 0.001 is inside no band either (below minMargin)
        assert!(bands.excessive(&buy_order("2", 99.9, 10.0), 100.0));
        assert!(!bands.excessive(&buy_order("3", 99.0, 10.0), 100.0));
    }

    #[test]
    fn test_fresh_start_places_avg_amount() {
        // One buy band, empty book, reference 100: a single buy order of the
        // average amount at the average-margin price.
        let bands = one_buy_band();
        let intents = bands.new_orders(
            &[],
            Balances::new(1000.0, 1000.0),
            SideAllowance::unlimited(),
            &MinAmounts::default(),
            100.0,
        );
        assert_eq!(intents.len(), 1);
        assert_eq!(intents[0].side, Side::Buy);
        assert!((intents[0].price - 99.0).abs() < 1e-9);
        assert!((intents[0].amount - 30.0).abs() < 1e-9);
    }

    #[test]
    fn test_shortfall_tops_up_to_avg() {
        let bands = one_buy_band();
        let book = vec![buy_order("1", 99.2, 12.0)];
        let intents = bands.new_orders(
            &book,
            Balances::new(1000.0, 1000.0),
            SideAllowance::unlimited(),
            &MinAmounts::default(),
            100.0,
        );
        assert_eq!(intents.len(), 1);
        assert!((intents[0].amount - 18.0).abs() < 1e-9);
    }

    #[test]
    fn test_band_above_min_is_left_alone() {
        let bands = one_buy_band();
        let book = vec![buy_order("1", 99.2, 25.0)];
        let intents = bands.new_orders(
            &book,
            Balances::new(1000.0, 1000.0),
            SideAllowance::unlimited(),
            &MinAmounts::default(),
            100.0,
        );
        assert!(intents.is_empty());
    }

    #[test]
    fn test_balance_clamps_placement() {
        let bands = one_buy_band();
        let intents = bands.new_orders(
            &[],
            Balances::new(7.5, 0.0),
            SideAllowance::unlimited(),
            &MinAmounts::default(),
            100.0,
        );
        assert_eq!(intents.len(), 1);
        assert!((intents[0].amount - 7.5).abs() < 1e-9);
    }

    #[test]
    fn test_limit_allowance_clamps_placement() {
        let bands = one_buy_band();
        let intents = bands.new_orders(
            &[],
            Balances::new(1000.0, 0.0),
            SideAllowance {
                buy: 5.0,
                sell: f64::INFINITY,
            },
            &MinAmounts::default(),
            100.0,
        );
        assert_eq!(intents.len(), 1);
        assert!((intents[0].amount - 5.0).abs() < 1e-9);
    }

    #[test]
    fn test_dust_cutoff_suppresses_placement() {
        let mut doc = band_doc((0.005, 0.01, 0.02), (20.0, 30.0, 40.0));
        doc.dust_cutoff = 10.0;
        let bands = Bands::from_document(&BandsDocument {
            buy_bands: vec![doc],
            ..Default::default()
        })
        .unwrap();

        let book = vec![buy_order("1", 99.0, 25.0)];
        // Gap to avg is 5, below the dust cutoff of 10.
        let intents = bands.new_orders(
            &book,
            Balances::new(1000.0, 0.0),
            SideAllowance::unlimited(),
            &MinAmounts::default(),
            100.0,
        );
        assert!(intents.is_empty());
    }

    #[test]
    fn test_exchange_minimum_suppresses_placement() {
        let bands = one_buy_band();
        let book = vec![buy_order("1", 99.0, 28.0)];
        let intents = bands.new_orders(
            &book,
            Balances::new(1000.0, 0.0),
            SideAllowance::unlimited(),
            &MinAmounts {
                buy: 5.0,
                sell: 0.0,
            },
            100.0,
        );
        assert!(intents.is_empty());
    }

    #[test]
    fn test_overfill_trims_farthest_from_avg_first() {
        let bands = one_buy_band();
        let band = &bands.buy_bands[0];
        // avg price at reference 100 is 99.0
        let book = vec![
            buy_order("near", 99.1, 20.0),
            buy_order("mid", 98.8, 15.0),
            buy_order("far", 98.1, 15.0),
        ];
        let cancels = band.excessive_orders(&book, 100.0);
        // Total 50 > max 40; trimming to <= avg 30 needs to drop "far"
        // (farthest from 99.0) and then "mid".
        assert_eq!(cancels.len(), 2);
        assert_eq!(cancels[0].id.as_str(), "far");
        assert_eq!(cancels[1].id.as_str(), "mid");
    }

    #[test]
    fn test_overfill_within_max_is_untouched() {
        let bands = one_buy_band();
        let band = &bands.buy_bands[0];
        let book = vec![buy_order("1", 99.0, 20.0), buy_order("2", 98.5, 18.0)];
        assert!(band.excessive_orders(&book, 100.0).is_empty());
    }

    #[test]
    fn test_cancellable_combines_outside_and_overfill() {
        let bands = one_buy_band();
        let book = vec![
            buy_order("outside", 95.0, 10.0),
            buy_order("a", 99.0, 30.0),
            buy_order("b", 98.2, 25.0),
        ];
        let cancels = bands.cancellable_orders(&book, 100.0);
        let ids: Vec<&str> = cancels.iter().map(|o| o.id.as_str()).collect();
        assert!(ids.contains(&"outside"));
        // 55 > max 40, trim to <= 30 drops the farther in-band order
        assert!(ids.contains(&"b"));
        assert!(!ids.contains(&"a"));
    }

    #[test]
    fn test_sell_side_mirrors_buy_math() {
        let bands = Bands::from_document(&BandsDocument {
            sell_bands: vec![band_doc((0.005, 0.01, 0.03), (10.0, 20.0, 30.0))],
            ..Default::default()
        })
        .unwrap();

        // Sell at 103 with reference 100 (margin +0.03, boundary) is inside.
        assert!(!bands.excessive(&sell_order("1", 103.0, 5.0), 100.0));
        // Reference drops to 99: margin becomes ~+0.0404, outside.
        assert!(bands.excessive(&sell_order("1", 103.0, 5.0), 99.0));

        let intents = bands.new_orders(
            &[],
            Balances::new(0.0, 100.0),
            SideAllowance::unlimited(),
            &MinAmounts::default(),
            100.0,
        );
        assert_eq!(intents.len(), 1);
        assert_eq!(intents[0].side, Side::Sell);
        assert!((intents[0].price - 101.0).abs() < 1e-9);
        assert!((intents[0].amount - 20.0).abs() < 1e-9);
    }
}
