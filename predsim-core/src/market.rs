//! Market data structures for the simulated prediction markets

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use crate::error::{SimError, SimResult};

/// Lowest price a market outcome may trade at
pub const MIN_PRICE: Decimal = dec!(0.01);

/// Highest price a market outcome may trade at
pub const MAX_PRICE: Decimal = dec!(0.99);

/// Clamp a price into `[MIN_PRICE, MAX_PRICE]`
pub fn clamp_price(price: Decimal) -> Decimal {
    price.clamp(MIN_PRICE, MAX_PRICE)
}

/// Outcome of a binary market (the side a trader takes)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    #[default]
    Yes,
    No,
}

impl Outcome {
    /// The complementary outcome
    pub fn opposite(&self) -> Self {
        match self {
            Outcome::Yes => Outcome::No,
            Outcome::No => Outcome::Yes,
        }
    }

    /// Price of this outcome given the YES price (`no = 1 - yes`)
    pub fn price_from_yes(&self, yes_price: Decimal) -> Decimal {
        match self {
            Outcome::Yes => yes_price,
            Outcome::No => Decimal::ONE - yes_price,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Yes => "yes",
            Outcome::No => "no",
        }
    }
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Side of a trade (from the taker's perspective)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradeSide {
    /// Buying the outcome
    Buy,
    /// Selling the outcome
    Sell,
}

/// Side of the order book a level rests on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BookSide {
    Bid,
    Ask,
}

/// Direction of the most recent price tick, used as a transient UI hint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlashDirection {
    Up,
    Down,
    #[default]
    None,
}

impl FlashDirection {
    /// Direction of a move from `old` to `new`
    pub fn between(old: Decimal, new: Decimal) -> Self {
        match new.cmp(&old) {
            std::cmp::Ordering::Greater => FlashDirection::Up,
            std::cmp::Ordering::Less => FlashDirection::Down,
            std::cmp::Ordering::Equal => FlashDirection::None,
        }
    }
}

// ============================================================================
// Order Book Types
// ============================================================================

/// A single price level in an order book
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceLevel {
    /// Price (strictly between 0 and 1)
    pub price: Decimal,
    /// Resting quantity in shares
    pub quantity: u64,
}

impl PriceLevel {
    pub fn new(price: Decimal, quantity: u64) -> Self {
        Self { price, quantity }
    }
}

/// Order book snapshot for a market
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderBook {
    /// Market identifier
    pub market_id: String,
    /// Bids (sorted by price descending - best bid first)
    pub bids: Vec<PriceLevel>,
    /// Asks (sorted by price ascending - best ask first)
    pub asks: Vec<PriceLevel>,
    /// Time of the last change
    pub timestamp: DateTime<Utc>,
}

impl OrderBook {
    /// Create an empty order book
    pub fn new(market_id: impl Into<String>) -> Self {
        Self {
            market_id: market_id.into(),
            bids: Vec::new(),
            asks: Vec::new(),
            timestamp: Utc::now(),
        }
    }

    /// Build a book from unsorted levels, rejecting crossed or out-of-range input
    pub fn with_levels(
        market_id: impl Into<String>,
        bids: Vec<PriceLevel>,
        asks: Vec<PriceLevel>,
    ) -> SimResult<Self> {
        let mut book = Self::new(market_id);
        for level in bids {
            book.apply_level(BookSide::Bid, level)?;
        }
        for level in asks {
            book.apply_level(BookSide::Ask, level)?;
        }
        Ok(book)
    }

    /// Get the best bid price
    pub fn best_bid(&self) -> Option<Decimal> {
        self.bids.first().map(|l| l.price)
    }

    /// Get the best ask price
    pub fn best_ask(&self) -> Option<Decimal> {
        self.asks.first().map(|l| l.price)
    }

    /// Calculate the spread (best ask - best bid)
    pub fn spread(&self) -> Option<Decimal> {
        match (self.best_bid(), self.best_ask()) {
            (Some(bid), Some(ask)) => Some(ask - bid),
            _ => None,
        }
    }

    /// Calculate the mid price
    pub fn mid_price(&self) -> Option<Decimal> {
        match (self.best_bid(), self.best_ask()) {
            (Some(bid), Some(ask)) => Some((bid + ask) / Decimal::TWO),
            _ => None,
        }
    }

    /// Total resting quantity on one side
    pub fn depth(&self, side: BookSide) -> u64 {
        self.levels(side).iter().map(|l| l.quantity).sum()
    }

    /// Levels on one side, best first
    pub fn levels(&self, side: BookSide) -> &[PriceLevel] {
        match side {
            BookSide::Bid => &self.bids,
            BookSide::Ask => &self.asks,
        }
    }

    /// Whether any bid is at or above any ask
    pub fn is_crossed(&self) -> bool {
        matches!((self.best_bid(), self.best_ask()), (Some(bid), Some(ask)) if bid >= ask)
    }

    /// Insert, replace or (with zero quantity) remove a level.
    ///
    /// The update is checked against the opposite side first; an update that
    /// would cross the book is rejected and the book is left untouched.
    pub fn apply_level(&mut self, side: BookSide, level: PriceLevel) -> SimResult<()> {
        if level.price <= Decimal::ZERO || level.price >= Decimal::ONE {
            return Err(SimError::PriceOutOfBounds(level.price));
        }

        if level.quantity > 0 {
            match side {
                BookSide::Bid => {
                    if let Some(ask) = self.best_ask() {
                        if level.price >= ask {
                            return Err(SimError::crossed(level.price, ask));
                        }
                    }
                }
                BookSide::Ask => {
                    if let Some(bid) = self.best_bid() {
                        if bid >= level.price {
                            return Err(SimError::crossed(bid, level.price));
                        }
                    }
                }
            }
        }

        let levels = match side {
            BookSide::Bid => &mut self.bids,
            BookSide::Ask => &mut self.asks,
        };

        levels.retain(|l| l.price != level.price);
        if level.quantity > 0 {
            // Bids descend, asks ascend
            let idx = match side {
                BookSide::Bid => levels.partition_point(|l| l.price > level.price),
                BookSide::Ask => levels.partition_point(|l| l.price < level.price),
            };
            levels.insert(idx, level);
        }

        self.timestamp = Utc::now();
        Ok(())
    }
}

// ============================================================================
// Trade Types
// ============================================================================

/// A single trade printed on a market
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    /// Trade identifier
    pub id: String,
    /// Market identifier
    pub market_id: String,
    /// Which outcome was traded
    pub outcome: Outcome,
    /// Trade side from the taker's perspective
    pub side: TradeSide,
    /// Price at which the trade occurred
    pub price: Decimal,
    /// Quantity traded
    pub quantity: u64,
    /// Timestamp of the trade
    pub timestamp: DateTime<Utc>,
}

/// A point on a market's price chart
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PricePoint {
    pub timestamp: DateTime<Utc>,
    pub value: Decimal,
}

// ============================================================================
// Market Types
// ============================================================================

/// Static description of a market, as returned by a market source
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketInfo {
    /// Unique market identifier
    pub id: String,
    /// Human-readable question
    pub title: String,
    /// Category (e.g., "crypto", "economics")
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    /// Current YES price
    pub yes_price: Decimal,
    /// Total traded volume
    pub volume: Decimal,
    /// Available liquidity
    pub liquidity: Decimal,
    /// Known resting bids (may be empty)
    #[serde(default)]
    pub bids: Vec<PriceLevel>,
    /// Known resting asks (may be empty)
    #[serde(default)]
    pub asks: Vec<PriceLevel>,
}

impl MarketInfo {
    /// Whether the source supplied live depth for this market
    pub fn has_depth(&self) -> bool {
        !self.bids.is_empty() || !self.asks.is_empty()
    }
}

/// Live state of a single market
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketState {
    pub market_id: String,
    pub title: String,
    /// Current YES price, always in `[0.01, 0.99]`
    pub yes_price: Decimal,
    /// Current NO price, always `1 - yes_price`
    pub no_price: Decimal,
    pub liquidity: Decimal,
    pub volume: Decimal,
    pub order_book: OrderBook,
    /// Price history, oldest first
    pub price_history: Vec<PricePoint>,
    /// Most recent trades, newest first
    pub recent_trades: VecDeque<Trade>,
    /// Direction of the last price tick (cleared shortly after it is set)
    pub flash: FlashDirection,
    pub updated_at: DateTime<Utc>,
}

impl MarketState {
    /// Create a market state at the given YES price
    pub fn new(info: &MarketInfo, order_book: OrderBook, price_history: Vec<PricePoint>) -> Self {
        let yes_price = clamp_price(info.yes_price);
        Self {
            market_id: info.id.clone(),
            title: info.title.clone(),
            yes_price,
            no_price: Decimal::ONE - yes_price,
            liquidity: info.liquidity,
            volume: info.volume,
            order_book,
            price_history,
            recent_trades: VecDeque::new(),
            flash: FlashDirection::None,
            updated_at: Utc::now(),
        }
    }

    /// Price of the given outcome
    pub fn price_for(&self, outcome: Outcome) -> Decimal {
        match outcome {
            Outcome::Yes => self.yes_price,
            Outcome::No => self.no_price,
        }
    }

    /// Move the YES price, clamping it and keeping `yes + no == 1`.
    ///
    /// Returns the direction of the move and records it as the flash.
    pub fn set_yes_price(&mut self, price: Decimal) -> FlashDirection {
        let new_price = clamp_price(price);
        let direction = FlashDirection::between(self.yes_price, new_price);
        self.yes_price = new_price;
        self.no_price = Decimal::ONE - new_price;
        self.flash = direction;
        self.updated_at = Utc::now();
        direction
    }

    /// Record a trade, keeping at most `limit` of the newest
    pub fn record_trade(&mut self, trade: Trade, limit: usize) {
        self.recent_trades.push_front(trade);
        self.recent_trades.truncate(limit);
        self.updated_at = Utc::now();
    }
}
