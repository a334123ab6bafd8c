//! Core types for the prediction market feed simulator
//!
//! This crate defines the shared data structures used across the simulator,
//! including market state, order books, bus events and order results.

pub mod error;
pub mod event;
pub mod market;
pub mod order;

pub use error::{SimError, SimResult};
pub use event::{EventKind, MarketEvent};
pub use market::{
    clamp_price, BookSide, FlashDirection, MarketInfo, MarketState, OrderBook, Outcome,
    PriceLevel, PricePoint, Trade, TradeSide, MAX_PRICE, MIN_PRICE,
};
pub use order::{OrderResult, TradeProjection};
