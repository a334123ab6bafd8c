//! Services for the prediction market feed simulator
//!
//! This crate provides the event bus and its synthetic producers, the pricing
//! engine, the market aggregator and the trade session that sit on top of
//! the core types.

pub mod aggregator;
pub mod catalog;
pub mod config;
pub mod event_bus;
pub mod format;
pub mod notifier;
pub mod pricing;
pub mod producer;
pub mod trade_session;

pub use aggregator::{
    generate_order_book, generate_price_history, MarketAggregator, MarketSubscription,
    MarketUpdate,
};
pub use catalog::{MarketSource, MockMarketCatalog};
pub use config::{AggregatorConfig, BusConfig, ConfigError, IntervalRange, SessionConfig, SimConfig};
pub use event_bus::{BusStats, EventBus, Handler, Subscription};
pub use notifier::{execution_message, LogNotifier, TradeNotifier};
pub use producer::{
    synthetic_producers, EventProducer, MarketAnchor, SyntheticOrderBookProducer,
    SyntheticPriceProducer, SyntheticTradeProducer,
};
pub use trade_session::{
    MarketTracker, SessionPhase, SessionSnapshot, TradeSession, INVALID_AMOUNT, NO_MARKET_PRICE,
};
