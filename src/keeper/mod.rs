//! Keeper orchestrator.
//!
//! The control task drives evaluation cycles sequentially: refresh exchange
//! state, read the feed and the config snapshot, run the band engine, then
//! dispatch cancels and places through the adapter with bounded
//! concurrency. All cancels of a cycle are issued before any place of the
//! same cycle to avoid self-crossing. Mutable state (in-flight sets,
//! placement history) is owned here; feeds and the config watcher publish
//! immutable snapshots.

pub mod bands;
pub mod clock;
pub mod config;
pub mod engine;
pub mod exchange;
pub mod limits;
pub mod order_book;
pub mod paper;
pub mod reporter;

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::stream::{self, StreamExt};
use tokio::sync::watch;
use tokio::time::error::Elapsed;
use tracing::{debug, info, warn};

use crate::errors::{ExchangeError, KeeperError};
use crate::feed::PriceFeed;
use crate::infra::logging::targets;

pub use bands::{Band, BandDocument, Bands, BandsDocument, PlaceIntent, SideAllowance};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{BandsReceiver, IdentityTemplate, ReloadableConfig, TemplateEngine};
pub use engine::{BandEngine, CyclePlan, EngineInputs, IdleReason};
pub use exchange::{Balances, ExchangeAdapter, MinAmounts, Order, OrderId, Pair, Side};
pub use limits::{LimitRule, Limits, PlacementHistory, SideHistory};
pub use order_book::{OrderBookView, MAX_INFLIGHT_AGE_CYCLES};
pub use paper::PaperExchange;
pub use reporter::{BookReport, OrderHistoryReporter};

/// Control loop configuration.
#[derive(Debug, Clone)]
pub struct KeeperConfig {
    /// Cycle cadence.
    pub refresh_interval: Duration,
    /// Bounded concurrency for order dispatch per cycle.
    pub dispatch_concurrency: usize,
    /// Per-call timeout on every exchange adapter call.
    pub call_timeout: Duration,
    /// Consecutive wholly-failed cycles before the keeper gives up.
    pub max_failed_cycles: u32,
    /// Balance floor per side; breaching it drains the keeper. A floor of
    /// zero disables the check.
    pub balance_floor: Balances,
    /// Cancel all resting orders while draining.
    pub cancel_on_shutdown: bool,
    /// Withdraw deposits while draining (if the adapter supports it).
    pub withdraw_on_shutdown: bool,
    /// Abort once the feed tree has been unavailable this long. `None`
    /// keeps the keeper running idle through outages (fail-open).
    pub fail_closed_after: Option<Duration>,
    /// How long startup waits for the first feed reading.
    pub feed_warmup_timeout: Duration,
    /// Snapshot/cancel rounds attempted while draining.
    pub cancel_all_attempts: u32,
}

impl Default for KeeperConfig {
    fn default() -> Self {
        Self {
            refresh_interval: Duration::from_secs(10),
            dispatch_concurrency: 8,
            call_timeout: Duration::from_secs(30),
            max_failed_cycles: 25,
            balance_floor: Balances::new(0.0, 0.0),
            cancel_on_shutdown: true,
            withdraw_on_shutdown: false,
            fail_closed_after: None,
            feed_warmup_timeout: Duration::from_secs(60),
            cancel_all_attempts: 5,
        }
    }
}

/// Lifecycle state of the control loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeeperState {
    Starting,
    Running,
    Draining,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CycleOutcome {
    Continue,
    Drain,
}

#[derive(Debug, Default)]
struct DispatchStats {
    attempted: usize,
    succeeded: usize,
    permanent: Option<ExchangeError>,
}

/// The keeper: one agent maintaining bands on one pair of one venue.
pub struct Keeper {
    config: KeeperConfig,
    adapter: Arc<dyn ExchangeAdapter>,
    feed: Arc<dyn PriceFeed>,
    bands_rx: BandsReceiver,
    clock: Arc<dyn Clock>,
    engine: BandEngine,
    book: OrderBookView,
    history: PlacementHistory,
    state: KeeperState,
    shutdown: watch::Receiver<bool>,
    reporter: Option<OrderHistoryReporter>,
    failed_cycles: u32,
    feed_lost_at: Option<Instant>,
    tentative_seq: u64,
}

impl Keeper {
    pub fn new(
        config: KeeperConfig,
        adapter: Arc<dyn ExchangeAdapter>,
        feed: Arc<dyn PriceFeed>,
        bands_rx: BandsReceiver,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            config,
            adapter,
            feed,
            bands_rx,
            clock: Arc::new(SystemClock),
            engine: BandEngine::new(),
            book: OrderBookView::new(),
            history: PlacementHistory::default(),
            state: KeeperState::Starting,
            shutdown,
            reporter: None,
            failed_cycles: 0,
            feed_lost_at: None,
            tentative_seq: 0,
        }
    }

    /// Inject a clock (tests).
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Enable order-history reporting.
    pub fn with_reporter(mut self, reporter: OrderHistoryReporter) -> Self {
        self.reporter = Some(reporter);
        self
    }

    pub fn state(&self) -> KeeperState {
        self.state
    }

    /// Run until shutdown, a balance-floor breach, or a structural failure.
    /// The drain sequence runs in every case; the returned error (if any)
    /// is what the process should exit on.
    pub async fn run(&mut self) -> Result<(), KeeperError> {
        if let Err(err) = self.start().await {
            self.state = KeeperState::Stopped;
            return Err(err);
        }
        let outcome = self.run_cycles().await;
        self.drain().await;
        outcome
    }

    /// Startup synchronization: balances above the floor, an initial order
    /// book snapshot, and a first feed reading.
    async fn start(&mut self) -> Result<(), KeeperError> {
        info!(
            target: targets::CORE,
            pair = %self.adapter.pair(),
            feed = %self.feed.label(),
            "keeper starting"
        );

        let balances = self.call(self.adapter.balances()).await?;
        if balances.buy < self.config.balance_floor.buy
            || balances.sell < self.config.balance_floor.sell
        {
            return Err(KeeperError::UnsafeToStart(format!(
                "balances {:?} below floor {:?}",
                balances, self.config.balance_floor
            )));
        }

        let snapshot = self.call(self.adapter.get_orders()).await?;
        info!(
            target: targets::CORE,
            resting = snapshot.len(),
            "initial order book fetched"
        );
        self.book.apply_snapshot(snapshot);

        let warmup_deadline = Instant::now() + self.config.feed_warmup_timeout;
        while self.feed.peek().is_none() {
            if *self.shutdown.borrow() {
                return Ok(());
            }
            if Instant::now() >= warmup_deadline {
                if self.config.fail_closed_after.is_some() {
                    return Err(KeeperError::FeedFailed(self.config.feed_warmup_timeout));
                }
                warn!(
                    target: targets::CORE,
                    feed = %self.feed.label(),
                    "no feed reading after warmup, starting idle (fail-open)"
                );
                break;
            }
            tokio::time::sleep(Duration::from_millis(500)).await;
        }

        self.state = KeeperState::Running;
        info!(target: targets::CORE, "keeper running");
        Ok(())
    }

    async fn run_cycles(&mut self) -> Result<(), KeeperError> {
        let mut ticker = tokio::time::interval(self.config.refresh_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        info!(target: targets::CORE, "shutdown signal received");
                        return Ok(());
                    }
                    continue;
                }
            }
            if *self.shutdown.borrow() {
                info!(target: targets::CORE, "shutdown signal received");
                return Ok(());
            }
            match self.cycle().await? {
                CycleOutcome::Continue => {}
                CycleOutcome::Drain => return Ok(()),
            }
        }
    }

    /// One evaluation cycle.
    async fn cycle(&mut self) -> Result<CycleOutcome, KeeperError> {
        // Exchange state first: the snapshot both feeds the engine and
        // confirms in-flight orders from previous cycles.
        match self.call(self.adapter.get_orders()).await {
            Ok(snapshot) => self.book.apply_snapshot(snapshot),
            Err(err) if err.is_permanent() => return Err(err.into()),
            Err(err) => {
                warn!(target: targets::CORE, error = %err, "order book refresh failed, retrying next cycle");
                self.note_failed_cycle()?;
                return Ok(CycleOutcome::Continue);
            }
        }

        let balances = match self.call(self.adapter.balances()).await {
            Ok(balances) => balances,
            Err(err) if err.is_permanent() => return Err(err.into()),
            Err(err) => {
                warn!(target: targets::CORE, error = %err, "balance read failed, retrying next cycle");
                self.note_failed_cycle()?;
                return Ok(CycleOutcome::Continue);
            }
        };
        if balances.buy < self.config.balance_floor.buy
            || balances.sell < self.config.balance_floor.sell
        {
            warn!(
                target: targets::CORE,
                buy = balances.buy,
                sell = balances.sell,
                "balance floor breached, draining"
            );
            return Ok(CycleOutcome::Drain);
        }

        // Config and feed snapshots; a cycle sees each one atomically.
        let bands = self.bands_rx.borrow().clone();
        let price = self.feed.peek().map(|reading| reading.price);
        self.track_feed_outage(price.is_some())?;

        let now = self.clock.now();
        self.history.buy.prune(bands.buy_limits.horizon(), now);
        self.history.sell.prune(bands.sell_limits.horizon(), now);
        let allowance = SideAllowance {
            buy: bands.buy_limits.available(&self.history.buy, now),
            sell: bands.sell_limits.available(&self.history.sell, now),
        };

        let effective = self.book.effective_orders();
        let plan = self.engine.plan(EngineInputs {
            price,
            bands: Some(&bands),
            book: &effective,
            balances,
            allowance,
            mins: self.adapter.min_amounts(),
        });

        let stats = self.dispatch(plan).await;
        if let Some(err) = stats.permanent {
            return Err(err.into());
        }
        if stats.attempted > 0 && stats.succeeded == 0 {
            self.note_failed_cycle()?;
        } else {
            self.failed_cycles = 0;
        }

        if let Some(reporter) = &self.reporter {
            reporter.offer(BookReport::new(
                self.adapter.pair(),
                &self.book.effective_orders(),
            ));
        }
        Ok(CycleOutcome::Continue)
    }

    /// Dispatch the cycle's plan: every cancel is awaited before the first
    /// place goes out, each with bounded concurrency and per-call timeouts.
    async fn dispatch(&mut self, plan: CyclePlan) -> DispatchStats {
        let mut stats = DispatchStats {
            attempted: plan.cancels.len() + plan.places.len(),
            ..Default::default()
        };
        if stats.attempted == 0 {
            return stats;
        }

        let adapter = Arc::clone(&self.adapter);
        let timeout = self.config.call_timeout;
        let concurrency = self.config.dispatch_concurrency.max(1);

        let cancel_results: Vec<(Order, Result<Result<(), ExchangeError>, Elapsed>)> =
            stream::iter(plan.cancels.into_iter().map(|order| {
                let adapter = Arc::clone(&adapter);
                async move {
                    let result = tokio::time::timeout(timeout, adapter.cancel_order(&order.id)).await;
                    (order, result)
                }
            }))
            .buffer_unordered(concurrency)
            .collect()
            .await;

        for (order, result) in cancel_results {
            match result {
                Ok(Ok(())) => {
                    info!(
                        target: targets::EXECUTION,
                        id = %order.id,
                        side = %order.side,
                        price = order.price,
                        "cancelled order"
                    );
                    self.book.note_cancelled(&order.id);
                    stats.succeeded += 1;
                }
                Ok(Err(err)) if err.is_permanent() => {
                    stats.permanent = Some(err);
                }
                Ok(Err(err)) => {
                    warn!(
                        target: targets::EXECUTION,
                        id = %order.id,
                        error = %err,
                        "cancel failed, retrying next cycle"
                    );
                }
                Err(_) => {
                    // The venue may have processed it; treat as issued and
                    // reconcile from the next snapshot.
                    warn!(
                        target: targets::EXECUTION,
                        id = %order.id,
                        "cancel timed out, tracking as in-flight"
                    );
                    self.book.note_cancelled(&order.id);
                }
            }
        }

        let place_results: Vec<(PlaceIntent, Result<Result<OrderId, ExchangeError>, Elapsed>)> =
            stream::iter(plan.places.into_iter().map(|intent| {
                let adapter = Arc::clone(&adapter);
                async move {
                    let result = tokio::time::timeout(
                        timeout,
                        adapter.place_order(intent.side, intent.price, intent.amount),
                    )
                    .await;
                    (intent, result)
                }
            }))
            .buffer_unordered(concurrency)
            .collect()
            .await;

        let now = self.clock.now();
        for (intent, result) in place_results {
            match result {
                Ok(Ok(id)) => {
                    info!(
                        target: targets::EXECUTION,
                        id = %id,
                        side = %intent.side,
                        price = intent.price,
                        amount = intent.amount,
                        "placed order"
                    );
                    self.book.note_placed(render_order(id, &intent));
                    self.history.side_mut(intent.side).record(now, intent.amount);
                    stats.succeeded += 1;
                }
                Ok(Err(err)) if err.is_permanent() => {
                    stats.permanent = Some(err);
                }
                Ok(Err(err)) => {
                    warn!(
                        target: targets::EXECUTION,
                        side = %intent.side,
                        amount = intent.amount,
                        error = %err,
                        "placement failed, retrying next cycle"
                    );
                }
                Err(_) => {
                    // The order may be live on the venue. Track a tentative
                    // entry and charge the rate limit conservatively; both
                    // resolve from snapshots within a bounded number of
                    // cycles.
                    self.tentative_seq += 1;
                    let id = OrderId::tentative(self.tentative_seq);
                    warn!(
                        target: targets::EXECUTION,
                        id = %id,
                        side = %intent.side,
                        "placement timed out, tracking as in-flight"
                    );
                    self.book.note_placed(render_order(id, &intent));
                    self.history.side_mut(intent.side).record(now, intent.amount);
                }
            }
        }

        stats
    }

    /// Book-keeping for the fail-closed policy.
    fn track_feed_outage(&mut self, available: bool) -> Result<(), KeeperError> {
        if available {
            self.feed_lost_at = None;
            return Ok(());
        }
        let since = *self.feed_lost_at.get_or_insert_with(|| self.clock.now());
        if let Some(limit) = self.config.fail_closed_after {
            let outage = self.clock.now().saturating_duration_since(since);
            if outage >= limit {
                return Err(KeeperError::FeedFailed(outage));
            }
        }
        Ok(())
    }

    fn note_failed_cycle(&mut self) -> Result<(), KeeperError> {
        self.failed_cycles += 1;
        if self.failed_cycles >= self.config.max_failed_cycles {
            return Err(KeeperError::DispatchStalled {
                cycles: self.failed_cycles,
            });
        }
        Ok(())
    }

    /// Drain sequence: optionally cancel everything, optionally withdraw,
    /// then stop. Best effort throughout.
    async fn drain(&mut self) {
        if self.state == KeeperState::Stopped {
            return;
        }
        self.state = KeeperState::Draining;
        info!(target: targets::CORE, "keeper draining");

        if self.config.cancel_on_shutdown && self.adapter.supports_cancel_all_on_shutdown() {
            self.cancel_all().await;
        }
        if self.config.withdraw_on_shutdown && self.adapter.supports_withdraw_on_shutdown() {
            match self.call(self.adapter.withdraw_all()).await {
                Ok(()) => info!(target: targets::CORE, "deposits withdrawn"),
                Err(err) => warn!(target: targets::CORE, error = %err, "withdraw failed"),
            }
        }

        self.state = KeeperState::Stopped;
        info!(target: targets::CORE, "keeper stopped");
    }

    /// Cancel everything, re-checking the snapshot until it comes back
    /// empty or attempts run out.
    async fn cancel_all(&mut self) {
        let adapter = Arc::clone(&self.adapter);
        let timeout = self.config.call_timeout;
        let concurrency = self.config.dispatch_concurrency.max(1);

        for attempt in 1..=self.config.cancel_all_attempts {
            let orders = match self.call(self.adapter.get_orders()).await {
                Ok(orders) => orders,
                Err(err) => {
                    warn!(target: targets::CORE, error = %err, attempt, "drain snapshot failed");
                    tokio::time::sleep(Duration::from_millis(500)).await;
                    continue;
                }
            };
            if orders.is_empty() {
                info!(target: targets::CORE, attempt, "no open orders left");
                return;
            }

            info!(
                target: targets::CORE,
                count = orders.len(),
                attempt,
                "cancelling open orders"
            );
            let results: Vec<(OrderId, Result<Result<(), ExchangeError>, Elapsed>)> =
                stream::iter(orders.into_iter().map(|order| {
                    let adapter = Arc::clone(&adapter);
                    async move {
                        let result =
                            tokio::time::timeout(timeout, adapter.cancel_order(&order.id)).await;
                        (order.id, result)
                    }
                }))
                .buffer_unordered(concurrency)
                .collect()
                .await;
            for (id, result) in results {
                match result {
                    Ok(Ok(())) => debug!(target: targets::CORE, id = %id, "drain cancel done"),
                    Ok(Err(err)) => {
                        warn!(target: targets::CORE, id = %id, error = %err, "drain cancel failed")
                    }
                    Err(_) => {
                        warn!(target: targets::CORE, id = %id, "drain cancel timed out")
                    }
                }
            }
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
        warn!(
            target: targets::CORE,
            "orders may still be resting after drain attempts"
        );
    }

    async fn call<T>(
        &self,
        fut: impl std::future::Future<Output = Result<T, ExchangeError>>,
    ) -> Result<T, ExchangeError> {
        match tokio::time::timeout(self.config.call_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(ExchangeError::Timeout),
        }
    }
}

/// Render a placement intent into the order the in-flight set tracks, using
/// the same pay-side convention adapters use.
fn render_order(id: OrderId, intent: &PlaceIntent) -> Order {
    let (buy_amount, sell_amount) = match intent.side {
        Side::Buy => (intent.amount / intent.price, intent.amount),
        Side::Sell => (intent.amount * intent.price, intent.amount),
    };
    Order::new(id, intent.side, intent.price, buy_amount, sell_amount)
}
