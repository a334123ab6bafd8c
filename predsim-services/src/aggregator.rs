//! Market Data Aggregator
//!
//! Owns the live state of every loaded market, applies bus events to it and
//! broadcasts [`MarketUpdate`]s to interested consumers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use chrono::{DateTime, TimeDelta, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Serialize;
use tokio::runtime::Handle;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use predsim_core::{
    clamp_price, BookSide, EventKind, FlashDirection, MarketEvent, MarketState, OrderBook,
    PriceLevel, PricePoint, SimError, SimResult, Trade, MAX_PRICE, MIN_PRICE,
};

use crate::catalog::MarketSource;
use crate::config::AggregatorConfig;
use crate::event_bus::{EventBus, Subscription};

/// Levels generated on each side of a synthetic book
const GENERATED_DEPTH: i64 = 5;

/// Price increment between generated levels
const GENERATED_TICK: Decimal = dec!(0.01);

/// Generated history starts this far below the base price (plus up to 0.05)
const HISTORY_START_OFFSET: Decimal = dec!(0.1);

/// Share of the gap to the base price closed on each history step
const HISTORY_DRIFT: Decimal = dec!(0.1);

/// Decimal places kept on generated history points
const HISTORY_SCALE: u32 = 4;

/// History spacing used when the configured one is out of range (seconds)
const FALLBACK_HISTORY_SPACING_SECS: i64 = 3600;

/// Change notifications for consumers of the aggregator
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MarketUpdate {
    /// A market's state was created
    Loaded { market_id: String },
    /// The YES price moved
    Price {
        market_id: String,
        yes_price: Decimal,
        no_price: Decimal,
        liquidity: Decimal,
        flash: FlashDirection,
    },
    /// The flash set by the last price move expired
    FlashCleared { market_id: String },
    /// One order book level changed
    OrderBook {
        market_id: String,
        side: BookSide,
        level: PriceLevel,
    },
    /// A trade was recorded
    Trade { market_id: String, trade: Trade },
    /// The last subscription was released and the state dropped
    Discarded { market_id: String },
}

impl MarketUpdate {
    pub fn market_id(&self) -> &str {
        match self {
            Self::Loaded { market_id }
            | Self::Price { market_id, .. }
            | Self::FlashCleared { market_id }
            | Self::OrderBook { market_id, .. }
            | Self::Trade { market_id, .. }
            | Self::Discarded { market_id } => market_id,
        }
    }
}

struct MarketEntry {
    state: MarketState,
    subscribers: usize,
    /// Bus handlers feeding this market, installed for the first subscriber
    handlers: Vec<Subscription>,
    /// Bumped on every price move so a stale timer never clears a newer flash
    flash_generation: u64,
    flash_task: Option<JoinHandle<()>>,
}

impl MarketEntry {
    fn cancel_flash_timer(&mut self) {
        if let Some(task) = self.flash_task.take() {
            task.abort();
        }
    }

    fn teardown(&mut self) {
        for handler in self.handlers.drain(..) {
            handler.unsubscribe();
        }
        self.cancel_flash_timer();
    }
}

struct AggregatorInner {
    config: AggregatorConfig,
    source: Arc<dyn MarketSource>,
    bus: EventBus,
    markets: DashMap<String, MarketEntry>,
    updates: broadcast::Sender<MarketUpdate>,
    rng: Mutex<StdRng>,
}

impl AggregatorInner {
    fn notify(&self, update: MarketUpdate) {
        // No receivers is fine
        let _ = self.updates.send(update);
    }

    fn load(&self, market_id: &str) -> SimResult<MarketState> {
        if let Some(entry) = self.markets.get(market_id) {
            return Ok(entry.state.clone());
        }

        let info = self
            .source
            .market(market_id)
            .ok_or_else(|| SimError::market_not_found(market_id))?;
        let yes_price = clamp_price(info.yes_price);

        let (order_book, price_history) = {
            let mut rng = self.rng.lock();
            let order_book = if info.has_depth() {
                OrderBook::with_levels(market_id, info.bids.clone(), info.asks.clone())?
            } else {
                generate_order_book(market_id, yes_price, &mut *rng)
            };
            let history = generate_price_history(
                yes_price,
                self.config.history_points,
                self.config.history_interval_secs,
                Utc::now(),
                &mut *rng,
            );
            (order_book, history)
        };

        let state = MarketState::new(&info, order_book, price_history);

        match self.markets.entry(market_id.to_string()) {
            Entry::Occupied(existing) => Ok(existing.get().state.clone()),
            Entry::Vacant(slot) => {
                slot.insert(MarketEntry {
                    state: state.clone(),
                    subscribers: 0,
                    handlers: Vec::new(),
                    flash_generation: 0,
                    flash_task: None,
                });
                info!(
                    "[Aggregator] Loaded {} at {} ({} bids, {} asks, {} history points)",
                    market_id,
                    state.yes_price,
                    state.order_book.bids.len(),
                    state.order_book.asks.len(),
                    state.price_history.len()
                );
                self.notify(MarketUpdate::Loaded {
                    market_id: market_id.to_string(),
                });
                Ok(state)
            }
        }
    }

    fn apply_price_update(self: &Arc<Self>, market_id: &str, delta: Decimal) -> SimResult<FlashDirection> {
        let (direction, update) = {
            let mut entry = self
                .markets
                .get_mut(market_id)
                .ok_or_else(|| SimError::market_not_found(market_id))?;

            let target = entry.state.yes_price.checked_add(delta).unwrap_or(
                if delta.is_sign_negative() { MIN_PRICE } else { MAX_PRICE },
            );
            let direction = entry.state.set_yes_price(target);

            entry.flash_generation += 1;
            entry.cancel_flash_timer();
            if direction != FlashDirection::None {
                let generation = entry.flash_generation;
                entry.flash_task = self.spawn_flash_timer(market_id, generation);
            }

            debug!(
                "[Aggregator] {} price {} ({:?}, delta {})",
                market_id, entry.state.yes_price, direction, delta
            );

            let update = MarketUpdate::Price {
                market_id: market_id.to_string(),
                yes_price: entry.state.yes_price,
                no_price: entry.state.no_price,
                liquidity: entry.state.liquidity,
                flash: direction,
            };
            (direction, update)
        };

        self.notify(update);
        Ok(direction)
    }

    fn spawn_flash_timer(self: &Arc<Self>, market_id: &str, generation: u64) -> Option<JoinHandle<()>> {
        let Ok(runtime) = Handle::try_current() else {
            warn!("[Aggregator] No runtime, flash for {} will not clear", market_id);
            return None;
        };

        let aggregator = Arc::downgrade(self);
        let market_id = market_id.to_string();
        let delay = self.config.flash_duration();

        Some(runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(aggregator) = aggregator.upgrade() {
                aggregator.clear_flash(&market_id, generation);
            }
        }))
    }

    fn clear_flash(&self, market_id: &str, generation: u64) {
        let cleared = match self.markets.get_mut(market_id) {
            Some(mut entry) if entry.flash_generation == generation => {
                entry.state.flash = FlashDirection::None;
                entry.flash_task = None;
                true
            }
            _ => false,
        };

        if cleared {
            self.notify(MarketUpdate::FlashCleared {
                market_id: market_id.to_string(),
            });
        }
    }

    fn apply_order_book_update(&self, market_id: &str, side: BookSide, level: PriceLevel) -> SimResult<()> {
        {
            let mut entry = self
                .markets
                .get_mut(market_id)
                .ok_or_else(|| SimError::market_not_found(market_id))?;

            if let Err(e) = entry.state.order_book.apply_level(side, level) {
                warn!("[Aggregator] Rejected {:?} level for {}: {}", side, market_id, e);
                return Err(e);
            }
            entry.state.updated_at = Utc::now();
        }

        debug!(
            "[Aggregator] {} {:?} {} x{}",
            market_id, side, level.price, level.quantity
        );
        self.notify(MarketUpdate::OrderBook {
            market_id: market_id.to_string(),
            side,
            level,
        });
        Ok(())
    }

    fn apply_trade(&self, market_id: &str, trade: Trade) -> SimResult<()> {
        if trade.price <= Decimal::ZERO || trade.price >= Decimal::ONE {
            warn!("[Aggregator] Rejected trade for {} at {}", market_id, trade.price);
            return Err(SimError::PriceOutOfBounds(trade.price));
        }

        {
            let mut entry = self
                .markets
                .get_mut(market_id)
                .ok_or_else(|| SimError::market_not_found(market_id))?;
            let limit = self.config.recent_trades;
            entry.state.record_trade(trade.clone(), limit);
        }

        debug!(
            "[Aggregator] {} trade {:?} {} x{} @ {}",
            market_id, trade.side, trade.outcome, trade.quantity, trade.price
        );
        self.notify(MarketUpdate::Trade {
            market_id: market_id.to_string(),
            trade,
        });
        Ok(())
    }

    fn apply_event(self: &Arc<Self>, event: &MarketEvent) -> SimResult<()> {
        match event {
            MarketEvent::PriceUpdate { market_id, delta, .. } => {
                self.apply_price_update(market_id, *delta).map(|_| ())
            }
            MarketEvent::OrderBookUpdate {
                market_id,
                side,
                level,
                ..
            } => self.apply_order_book_update(market_id, *side, *level),
            MarketEvent::TradeExecuted {
                market_id,
                outcome,
                side,
                price,
                quantity,
                ..
            } => self.apply_trade(
                market_id,
                Trade {
                    id: format!("t_{}", Uuid::new_v4().simple()),
                    market_id: market_id.clone(),
                    outcome: *outcome,
                    side: *side,
                    price: *price,
                    quantity: *quantity,
                    timestamp: event.datetime(),
                },
            ),
        }
    }

    /// Drop one subscriber, discarding the market when none remain
    fn release(&self, market_id: &str) {
        match self.markets.get_mut(market_id) {
            Some(mut entry) => entry.subscribers = entry.subscribers.saturating_sub(1),
            None => return,
        }

        if let Some((_, mut entry)) = self.markets.remove_if(market_id, |_, e| e.subscribers == 0) {
            entry.teardown();
            info!("[Aggregator] Discarded {} (no subscribers left)", market_id);
            self.notify(MarketUpdate::Discarded {
                market_id: market_id.to_string(),
            });
        }
    }
}

impl Drop for AggregatorInner {
    fn drop(&mut self) {
        for mut entry in self.markets.iter_mut() {
            entry.teardown();
        }
    }
}

/// Handle to a market subscription
///
/// Subscriptions to the same market share one set of bus handlers; the last
/// [`MarketSubscription::unsubscribe`] removes them and discards the market.
/// Dropping the handle does not unsubscribe.
#[must_use = "a market subscription must be kept to be able to unsubscribe"]
pub struct MarketSubscription {
    market_id: String,
    aggregator: Weak<AggregatorInner>,
    active: AtomicBool,
}

impl MarketSubscription {
    pub fn market_id(&self) -> &str {
        &self.market_id
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Stop applying bus events for this market. Idempotent.
    pub fn unsubscribe(&self) {
        if !self.active.swap(false, Ordering::SeqCst) {
            return;
        }

        if let Some(aggregator) = self.aggregator.upgrade() {
            aggregator.release(&self.market_id);
        }
        debug!("[Aggregator] Unsubscribed from {}", self.market_id);
    }
}

impl std::fmt::Debug for MarketSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MarketSubscription")
            .field("market_id", &self.market_id)
            .field("active", &self.is_active())
            .finish()
    }
}

/// Authoritative live view of every loaded market
#[derive(Clone)]
pub struct MarketAggregator {
    inner: Arc<AggregatorInner>,
}

impl MarketAggregator {
    pub fn new(config: AggregatorConfig, source: Arc<dyn MarketSource>, bus: EventBus) -> Self {
        Self::with_rng(config, source, bus, StdRng::from_os_rng())
    }

    /// Create an aggregator whose synthetic books and histories come from `rng`
    pub fn with_rng(
        config: AggregatorConfig,
        source: Arc<dyn MarketSource>,
        bus: EventBus,
        rng: StdRng,
    ) -> Self {
        let (updates, _) = broadcast::channel(config.update_capacity.max(1));
        Self {
            inner: Arc::new(AggregatorInner {
                config,
                source,
                bus,
                markets: DashMap::new(),
                updates,
                rng: Mutex::new(rng),
            }),
        }
    }

    pub fn bus(&self) -> &EventBus {
        &self.inner.bus
    }

    /// Return the market's state, creating it from the source on first use
    pub fn load(&self, market_id: &str) -> SimResult<MarketState> {
        self.inner.load(market_id)
    }

    /// Move the YES price by `delta`, clamped to `[0.01, 0.99]`
    pub fn apply_price_update(&self, market_id: &str, delta: Decimal) -> SimResult<FlashDirection> {
        self.inner.apply_price_update(market_id, delta)
    }

    /// Insert, replace or remove one book level. Crossing updates are rejected.
    pub fn apply_order_book_update(&self, market_id: &str, side: BookSide, level: PriceLevel) -> SimResult<()> {
        self.inner.apply_order_book_update(market_id, side, level)
    }

    pub fn apply_trade(&self, market_id: &str, trade: Trade) -> SimResult<()> {
        self.inner.apply_trade(market_id, trade)
    }

    /// Apply any bus event to its market
    pub fn apply_event(&self, event: &MarketEvent) -> SimResult<()> {
        self.inner.apply_event(event)
    }

    /// Load the market and apply bus events for it until unsubscribed
    pub fn subscribe(&self, market_id: &str) -> SimResult<MarketSubscription> {
        self.inner.load(market_id)?;

        {
            let Some(mut entry) = self.inner.markets.get_mut(market_id) else {
                return Err(SimError::internal(format!(
                    "{} was discarded while subscribing",
                    market_id
                )));
            };
            entry.subscribers += 1;
            if entry.handlers.is_empty() {
                entry.handlers = self.install_handlers(market_id);
            }
            info!(
                "[Aggregator] Subscribed to {} ({} subscribers)",
                market_id, entry.subscribers
            );
        }

        Ok(MarketSubscription {
            market_id: market_id.to_string(),
            aggregator: Arc::downgrade(&self.inner),
            active: AtomicBool::new(true),
        })
    }

    fn install_handlers(&self, market_id: &str) -> Vec<Subscription> {
        EventKind::ALL
            .iter()
            .map(|&kind| {
                let aggregator = Arc::downgrade(&self.inner);
                let market_id = market_id.to_string();
                self.inner.bus.subscribe(kind, move |event| {
                    if event.market_id() != market_id {
                        return Ok(());
                    }
                    let Some(aggregator) = aggregator.upgrade() else {
                        return Ok(());
                    };
                    match aggregator.apply_event(event) {
                        Ok(()) => Ok(()),
                        // Already logged and rejected at the mutation boundary
                        Err(e) if e.is_invariant_violation() => Ok(()),
                        Err(e) => Err(e.into()),
                    }
                })
            })
            .collect()
    }

    /// Current state of a loaded market
    pub fn snapshot(&self, market_id: &str) -> Option<MarketState> {
        self.inner.markets.get(market_id).map(|entry| entry.state.clone())
    }

    /// Receive every market update from now on
    pub fn updates(&self) -> broadcast::Receiver<MarketUpdate> {
        self.inner.updates.subscribe()
    }

    pub fn loaded_markets(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.inner.markets.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    pub fn subscriber_count(&self, market_id: &str) -> usize {
        self.inner
            .markets
            .get(market_id)
            .map(|entry| entry.subscribers)
            .unwrap_or(0)
    }
}

/// Generate a presentation book around `price`
///
/// Five levels per side at 0.01 increments, asks strictly above and bids
/// strictly below the price. Levels outside `[0.01, 0.99]` are skipped.
pub fn generate_order_book<R: Rng + ?Sized>(market_id: &str, price: Decimal, rng: &mut R) -> OrderBook {
    let mut book = OrderBook::new(market_id);

    for step in 1..=GENERATED_DEPTH {
        let offset = GENERATED_TICK * Decimal::from(step);

        let bid = price - offset;
        if bid >= MIN_PRICE {
            book.bids.push(PriceLevel::new(bid, rng.random_range(1000..51000)));
        }

        let ask = price + offset;
        if ask <= MAX_PRICE {
            book.asks.push(PriceLevel::new(ask, rng.random_range(1000..51000)));
        }
    }

    book
}

/// Generate `points` hourly-style history points ending exactly at `base`
///
/// The walk starts 0.05 to 0.1 below the base price, closes 10% of the gap
/// each step and adds up to ±0.02 of noise. Every point stays in
/// `[0.01, 0.99]`.
pub fn generate_price_history<R: Rng + ?Sized>(
    base: Decimal,
    points: usize,
    interval_secs: u64,
    now: DateTime<Utc>,
    rng: &mut R,
) -> Vec<PricePoint> {
    let base = clamp_price(base);
    let points = points.max(1);
    let spacing = i64::try_from(interval_secs)
        .ok()
        .and_then(TimeDelta::try_seconds)
        .unwrap_or_else(|| TimeDelta::seconds(FALLBACK_HISTORY_SPACING_SECS));

    let start_jitter = Decimal::new(rng.random_range(0..=500), HISTORY_SCALE);
    let mut current = clamp_price(base - HISTORY_START_OFFSET + start_jitter);

    let mut history = Vec::with_capacity(points);
    for remaining in (0..points).rev() {
        let drift = (base - current) * HISTORY_DRIFT;
        let noise = Decimal::new(rng.random_range(-200..=200), HISTORY_SCALE);
        current = clamp_price((current + drift + noise).round_dp(HISTORY_SCALE));

        let timestamp = i32::try_from(remaining)
            .ok()
            .and_then(|steps| spacing.checked_mul(steps))
            .and_then(|offset| now.checked_sub_signed(offset))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);

        history.push(PricePoint {
            timestamp,
            value: current,
        });
    }

    if let Some(last) = history.last_mut() {
        last.value = base;
    }
    history
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::MockMarketCatalog;
    use predsim_core::{MarketInfo, Outcome, TradeSide};
    use std::time::Duration;

    fn market(id: &str, yes_price: Decimal) -> MarketInfo {
        MarketInfo {
            id: id.to_string(),
            title: format!("Test market {}", id),
            category: None,
            yes_price,
            volume: dec!(1000),
            liquidity: dec!(5000),
            bids: Vec::new(),
            asks: Vec::new(),
        }
    }

    fn aggregator_with(markets: Vec<MarketInfo>) -> MarketAggregator {
        MarketAggregator::with_rng(
            AggregatorConfig::default(),
            Arc::new(MockMarketCatalog::with_markets(markets)),
            EventBus::new(),
            StdRng::seed_from_u64(42),
        )
    }

    fn demo_aggregator() -> MarketAggregator {
        MarketAggregator::with_rng(
            AggregatorConfig::default(),
            Arc::new(MockMarketCatalog::new()),
            EventBus::new(),
            StdRng::seed_from_u64(42),
        )
    }

    fn trade(market_id: &str, n: u64) -> Trade {
        Trade {
            id: format!("t_{}", n),
            market_id: market_id.to_string(),
            outcome: Outcome::Yes,
            side: TradeSide::Buy,
            price: dec!(0.5),
            quantity: n,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_load_static_market() {
        let aggregator = demo_aggregator();
        let state = aggregator.load("btc-100k-2026").unwrap();

        assert_eq!(state.yes_price, dec!(0.72));
        assert_eq!(state.no_price, dec!(0.28));
        assert_eq!(state.order_book.best_bid(), Some(dec!(0.71)));
        assert_eq!(state.order_book.best_ask(), Some(dec!(0.73)));
        assert_eq!(state.price_history.len(), 50);
        assert_eq!(state.price_history.last().unwrap().value, dec!(0.72));
        assert_eq!(aggregator.loaded_markets(), vec!["btc-100k-2026"]);

        // Second load returns the live state, not a fresh one
        aggregator.apply_price_update("btc-100k-2026", dec!(0.01)).unwrap();
        assert_eq!(aggregator.load("btc-100k-2026").unwrap().yes_price, dec!(0.73));
    }

    #[test]
    fn test_load_unknown_market() {
        let aggregator = demo_aggregator();
        assert_eq!(
            aggregator.load("nope").unwrap_err(),
            SimError::market_not_found("nope")
        );
        assert!(aggregator.loaded_markets().is_empty());
    }

    #[test]
    fn test_load_generates_book_without_depth() {
        let aggregator = demo_aggregator();
        let state = aggregator.load("spacex-mars-2026").unwrap();
        let book = &state.order_book;

        assert_eq!(book.bids.len(), 5);
        assert_eq!(book.asks.len(), 5);
        assert!(book.bids.iter().all(|l| l.price < state.yes_price));
        assert!(book.asks.iter().all(|l| l.price > state.yes_price));
        assert!(!book.is_crossed());
    }

    #[test]
    fn test_generated_book_respects_bounds() {
        let mut rng = StdRng::seed_from_u64(1);
        let book = generate_order_book("edge", dec!(0.03), &mut rng);
        assert_eq!(book.bids.len(), 2);
        assert_eq!(book.asks.len(), 5);
        assert_eq!(book.best_bid(), Some(dec!(0.02)));
        assert_eq!(book.best_ask(), Some(dec!(0.04)));
        assert!(book
            .bids
            .iter()
            .chain(book.asks.iter())
            .all(|l| (1000..51000).contains(&l.quantity)));
    }

    #[test]
    fn test_price_history_walk() {
        let mut rng = StdRng::seed_from_u64(9);
        let now = Utc::now();
        for base in [dec!(0.01), dec!(0.05), dec!(0.5), dec!(0.97), dec!(0.99)] {
            let history = generate_price_history(base, 50, 3600, now, &mut rng);
            assert_eq!(history.len(), 50);
            assert_eq!(history.last().unwrap().value, base);
            assert_eq!(history.last().unwrap().timestamp, now);
            assert!(history.iter().all(|p| p.value >= MIN_PRICE && p.value <= MAX_PRICE));
            assert!(history.windows(2).all(|w| w[0].timestamp < w[1].timestamp));
        }

        let single = generate_price_history(dec!(0.4), 0, 3600, now, &mut rng);
        assert_eq!(single.len(), 1);
        assert_eq!(single[0].value, dec!(0.4));
    }

    #[test]
    fn test_price_history_with_extreme_spacing() {
        let mut rng = StdRng::seed_from_u64(3);
        let now = Utc::now();

        // Not representable: falls back to hourly spacing
        let history = generate_price_history(dec!(0.5), 3, u64::MAX, now, &mut rng);
        assert_eq!(history[1].timestamp, now - TimeDelta::hours(1));
        assert_eq!(history[2].timestamp, now);

        // Representable spacing that runs past the calendar
        let history = generate_price_history(dec!(0.5), 50, 1_000_000_000_000, now, &mut rng);
        assert_eq!(history.len(), 50);
        assert_eq!(history[0].timestamp, DateTime::<Utc>::MIN_UTC);
        assert_eq!(history.last().unwrap().timestamp, now);
    }

    #[tokio::test(start_paused = true)]
    async fn test_price_update_clamps_and_flashes() {
        let aggregator = aggregator_with(vec![market("m", dec!(0.95))]);
        aggregator.load("m").unwrap();

        let direction = aggregator.apply_price_update("m", dec!(0.10)).unwrap();
        assert_eq!(direction, FlashDirection::Up);

        let state = aggregator.snapshot("m").unwrap();
        assert_eq!(state.yes_price, dec!(0.99));
        assert_eq!(state.no_price, dec!(0.01));
        assert_eq!(state.flash, FlashDirection::Up);

        tokio::time::sleep(Duration::from_millis(501)).await;
        assert_eq!(aggregator.snapshot("m").unwrap().flash, FlashDirection::None);

        // Already at the ceiling: no move, no flash
        assert_eq!(
            aggregator.apply_price_update("m", dec!(0.05)).unwrap(),
            FlashDirection::None
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_flash_timer_does_not_clear_newer_flash() {
        let aggregator = aggregator_with(vec![market("m", dec!(0.50))]);
        aggregator.load("m").unwrap();

        aggregator.apply_price_update("m", dec!(0.02)).unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        aggregator.apply_price_update("m", dec!(-0.05)).unwrap();

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(aggregator.snapshot("m").unwrap().flash, FlashDirection::Down);

        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(aggregator.snapshot("m").unwrap().flash, FlashDirection::None);
    }

    #[test]
    fn test_crossing_update_leaves_book_untouched() {
        let aggregator = demo_aggregator();
        let before = aggregator.load("fed-rate-cut-q1").unwrap().order_book;

        let err = aggregator
            .apply_order_book_update("fed-rate-cut-q1", BookSide::Bid, PriceLevel::new(dec!(0.47), 100))
            .unwrap_err();
        assert!(err.is_invariant_violation());

        let err = aggregator
            .apply_order_book_update("fed-rate-cut-q1", BookSide::Ask, PriceLevel::new(dec!(1.2), 100))
            .unwrap_err();
        assert_eq!(err, SimError::PriceOutOfBounds(dec!(1.2)));

        let after = aggregator.snapshot("fed-rate-cut-q1").unwrap().order_book;
        assert_eq!(after.bids, before.bids);
        assert_eq!(after.asks, before.asks);

        aggregator
            .apply_order_book_update("fed-rate-cut-q1", BookSide::Bid, PriceLevel::new(dec!(0.45), 100))
            .unwrap();
        let book = aggregator.snapshot("fed-rate-cut-q1").unwrap().order_book;
        assert_eq!(book.best_bid(), Some(dec!(0.45)));
        assert!(!book.is_crossed());
    }

    #[test]
    fn test_recent_trades_are_capped() {
        let aggregator = aggregator_with(vec![market("m", dec!(0.5))]);
        aggregator.load("m").unwrap();

        for n in 1..=60 {
            aggregator.apply_trade("m", trade("m", n)).unwrap();
        }

        let trades = aggregator.snapshot("m").unwrap().recent_trades;
        assert_eq!(trades.len(), 50);
        assert_eq!(trades.front().unwrap().quantity, 60);
        assert_eq!(trades.back().unwrap().quantity, 11);

        assert!(aggregator.apply_trade("unknown", trade("unknown", 1)).is_err());
    }

    #[test]
    fn test_subscription_filters_by_market_and_discards_on_release() {
        let aggregator = aggregator_with(vec![market("a", dec!(0.5)), market("b", dec!(0.5))]);
        let bus = aggregator.bus().clone();

        let sub_a = aggregator.subscribe("a").unwrap();
        let second_a = aggregator.subscribe("a").unwrap();
        assert_eq!(aggregator.subscriber_count("a"), 2);
        assert_eq!(bus.subscriber_count(EventKind::PriceUpdate), 1);

        bus.publish(MarketEvent::PriceUpdate {
            market_id: "a".to_string(),
            delta: dec!(0.1),
            timestamp: 1,
        });
        bus.publish(MarketEvent::PriceUpdate {
            market_id: "b".to_string(),
            delta: dec!(0.1),
            timestamp: 2,
        });

        // Applied once, however many subscriptions share the market
        assert_eq!(aggregator.snapshot("a").unwrap().yes_price, dec!(0.6));
        assert!(aggregator.snapshot("b").is_none());

        sub_a.unsubscribe();
        sub_a.unsubscribe();
        assert_eq!(aggregator.subscriber_count("a"), 1);
        assert_eq!(bus.subscriber_count(EventKind::PriceUpdate), 1);

        second_a.unsubscribe();
        assert!(aggregator.snapshot("a").is_none());
        assert_eq!(bus.subscriber_count(EventKind::PriceUpdate), 0);

        bus.publish(MarketEvent::PriceUpdate {
            market_id: "a".to_string(),
            delta: dec!(0.1),
            timestamp: 3,
        });
        assert!(aggregator.loaded_markets().is_empty());
    }

    #[test]
    fn test_crossed_event_is_not_a_handler_failure() {
        let aggregator = demo_aggregator();
        let bus = aggregator.bus().clone();
        let _sub = aggregator.subscribe("btc-100k-2026").unwrap();

        bus.publish(MarketEvent::OrderBookUpdate {
            market_id: "btc-100k-2026".to_string(),
            side: BookSide::Ask,
            level: PriceLevel::new(dec!(0.70), 500),
            timestamp: 1,
        });

        assert_eq!(bus.stats().failed, 0);
        assert!(!aggregator.snapshot("btc-100k-2026").unwrap().order_book.is_crossed());
    }

    #[test]
    fn test_updates_are_broadcast() {
        let aggregator = aggregator_with(vec![market("m", dec!(0.4))]);
        let mut updates = aggregator.updates();

        aggregator.load("m").unwrap();
        aggregator.apply_price_update("m", dec!(-0.1)).unwrap();

        assert_eq!(
            updates.try_recv().unwrap(),
            MarketUpdate::Loaded {
                market_id: "m".to_string()
            }
        );
        match updates.try_recv().unwrap() {
            MarketUpdate::Price { yes_price, no_price, flash, .. } => {
                assert_eq!(yes_price, dec!(0.3));
                assert_eq!(no_price, dec!(0.7));
                assert_eq!(flash, FlashDirection::Down);
            }
            other => panic!("unexpected update {:?}", other),
        }
    }
}
