//! Event producers
//!
//! An [`EventProducer`] manufactures one kind of [`MarketEvent`] each time
//! the bus ticks it. The synthetic producers here stand in for a live feed;
//! a real market-data adapter can implement the same trait.

use std::sync::Arc;

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use predsim_core::{
    clamp_price, BookSide, EventKind, MarketEvent, Outcome, PriceLevel, TradeSide,
};

use crate::catalog::MarketSource;
use crate::config::{BusConfig, IntervalRange};

/// Anchor price for markets the source does not know
const FALLBACK_ANCHOR: Decimal = dec!(0.50);

/// Source of one kind of market event
pub trait EventProducer: Send + Sync {
    /// Kind of event this producer emits
    fn kind(&self) -> EventKind;

    /// Range the delay before each tick is drawn from
    fn interval(&self) -> IntervalRange;

    /// Build the next event, stamped with `timestamp`.
    ///
    /// Returning `None` skips the tick. Runs while the bus holds the queue
    /// for this kind, so it must not publish.
    fn produce(&self, timestamp: i64) -> Option<MarketEvent>;
}

/// A market the synthetic producers emit for, with the price they quote around
#[derive(Debug, Clone, PartialEq)]
pub struct MarketAnchor {
    pub market_id: String,
    pub yes_price: Decimal,
}

impl MarketAnchor {
    pub fn new(market_id: impl Into<String>, yes_price: Decimal) -> Self {
        Self {
            market_id: market_id.into(),
            yes_price: clamp_price(yes_price),
        }
    }
}

/// Build anchors for the configured markets, priced from the source
pub fn anchors_for(config: &BusConfig, source: &dyn MarketSource) -> Vec<MarketAnchor> {
    config
        .markets
        .iter()
        .map(|id| {
            let price = source
                .market(id)
                .map(|m| m.yes_price)
                .unwrap_or(FALLBACK_ANCHOR);
            MarketAnchor::new(id.clone(), price)
        })
        .collect()
}

/// The three synthetic producers for the configured markets
pub fn synthetic_producers(
    config: &BusConfig,
    source: &dyn MarketSource,
) -> Vec<Arc<dyn EventProducer>> {
    let anchors = anchors_for(config, source);
    vec![
        Arc::new(SyntheticPriceProducer::new(anchors.clone(), config.price_interval)),
        Arc::new(SyntheticOrderBookProducer::new(anchors.clone(), config.order_book_interval)),
        Arc::new(SyntheticTradeProducer::new(anchors, config.trade_interval)),
    ]
}

fn pick<'a, R: Rng>(rng: &mut R, anchors: &'a [MarketAnchor]) -> Option<&'a MarketAnchor> {
    if anchors.is_empty() {
        return None;
    }
    Some(&anchors[rng.random_range(0..anchors.len())])
}

/// Random YES-price moves of up to ±0.02
pub struct SyntheticPriceProducer {
    anchors: Vec<MarketAnchor>,
    interval: IntervalRange,
    rng: Mutex<StdRng>,
}

impl SyntheticPriceProducer {
    pub fn new(anchors: Vec<MarketAnchor>, interval: IntervalRange) -> Self {
        Self::with_rng(anchors, interval, StdRng::from_os_rng())
    }

    pub fn with_rng(anchors: Vec<MarketAnchor>, interval: IntervalRange, rng: StdRng) -> Self {
        Self {
            anchors,
            interval,
            rng: Mutex::new(rng),
        }
    }
}

impl EventProducer for SyntheticPriceProducer {
    fn kind(&self) -> EventKind {
        EventKind::PriceUpdate
    }

    fn interval(&self) -> IntervalRange {
        self.interval
    }

    fn produce(&self, timestamp: i64) -> Option<MarketEvent> {
        let mut rng = self.rng.lock();
        let anchor = pick(&mut *rng, &self.anchors)?;

        // Basis points, so the delta is an exact decimal
        let delta = Decimal::new(rng.random_range(-200..=200), 4);

        Some(MarketEvent::PriceUpdate {
            market_id: anchor.market_id.clone(),
            delta,
            timestamp,
        })
    }
}

/// Single-level book refreshes within five ticks of the anchor price
pub struct SyntheticOrderBookProducer {
    anchors: Vec<MarketAnchor>,
    interval: IntervalRange,
    rng: Mutex<StdRng>,
}

impl SyntheticOrderBookProducer {
    pub fn new(anchors: Vec<MarketAnchor>, interval: IntervalRange) -> Self {
        Self::with_rng(anchors, interval, StdRng::from_os_rng())
    }

    pub fn with_rng(anchors: Vec<MarketAnchor>, interval: IntervalRange, rng: StdRng) -> Self {
        Self {
            anchors,
            interval,
            rng: Mutex::new(rng),
        }
    }
}

impl EventProducer for SyntheticOrderBookProducer {
    fn kind(&self) -> EventKind {
        EventKind::OrderBookUpdate
    }

    fn interval(&self) -> IntervalRange {
        self.interval
    }

    fn produce(&self, timestamp: i64) -> Option<MarketEvent> {
        let mut rng = self.rng.lock();
        let anchor = pick(&mut *rng, &self.anchors)?;

        let side = if rng.random_bool(0.5) { BookSide::Bid } else { BookSide::Ask };
        let ticks = Decimal::new(rng.random_range(1..=5), 2);
        let base = anchor.yes_price.round_dp(2);
        let price = clamp_price(match side {
            BookSide::Bid => base - ticks,
            BookSide::Ask => base + ticks,
        });

        Some(MarketEvent::OrderBookUpdate {
            market_id: anchor.market_id.clone(),
            side,
            level: PriceLevel::new(price, rng.random_range(1000..6000)),
            timestamp,
        })
    }
}

/// Trade prints near the anchor price
pub struct SyntheticTradeProducer {
    anchors: Vec<MarketAnchor>,
    interval: IntervalRange,
    rng: Mutex<StdRng>,
}

impl SyntheticTradeProducer {
    pub fn new(anchors: Vec<MarketAnchor>, interval: IntervalRange) -> Self {
        Self::with_rng(anchors, interval, StdRng::from_os_rng())
    }

    pub fn with_rng(anchors: Vec<MarketAnchor>, interval: IntervalRange, rng: StdRng) -> Self {
        Self {
            anchors,
            interval,
            rng: Mutex::new(rng),
        }
    }
}

impl EventProducer for SyntheticTradeProducer {
    fn kind(&self) -> EventKind {
        EventKind::TradeExecuted
    }

    fn interval(&self) -> IntervalRange {
        self.interval
    }

    fn produce(&self, timestamp: i64) -> Option<MarketEvent> {
        let mut rng = self.rng.lock();
        let anchor = pick(&mut *rng, &self.anchors)?;

        let outcome = if rng.random_bool(0.5) { Outcome::Yes } else { Outcome::No };
        let side = if rng.random_bool(0.5) { TradeSide::Buy } else { TradeSide::Sell };
        let offset = Decimal::new(rng.random_range(-500..=500), 4);
        let yes_price = clamp_price(anchor.yes_price + offset);

        Some(MarketEvent::TradeExecuted {
            market_id: anchor.market_id.clone(),
            outcome,
            side,
            price: clamp_price(outcome.price_from_yes(yes_price)),
            quantity: rng.random_range(100..1100),
            timestamp,
        })
    }
}
