//! Market sources
//!
//! The aggregator builds market state from a [`MarketSource`]. The bundled
//! [`MockMarketCatalog`] serves a fixed set of demo markets from memory.

use std::collections::HashMap;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use predsim_core::{MarketInfo, PriceLevel};

/// Source of static market descriptions
pub trait MarketSource: Send + Sync {
    /// Look up a market by ID
    fn market(&self, market_id: &str) -> Option<MarketInfo>;

    /// IDs of every market the source knows about
    fn market_ids(&self) -> Vec<String>;
}

/// In-memory catalogue of demo markets
#[derive(Debug, Clone)]
pub struct MockMarketCatalog {
    markets: HashMap<String, MarketInfo>,
}

impl MockMarketCatalog {
    /// Create the catalogue with the default demo markets
    pub fn new() -> Self {
        Self::with_markets(vec![btc_100k(), fed_rate_cut(), spacex_mars()])
    }

    /// Create a catalogue from arbitrary markets
    pub fn with_markets(markets: Vec<MarketInfo>) -> Self {
        Self {
            markets: markets.into_iter().map(|m| (m.id.clone(), m)).collect(),
        }
    }
}

impl Default for MockMarketCatalog {
    fn default() -> Self {
        Self::new()
    }
}

impl MarketSource for MockMarketCatalog {
    fn market(&self, market_id: &str) -> Option<MarketInfo> {
        self.markets.get(market_id).cloned()
    }

    fn market_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.markets.keys().cloned().collect();
        ids.sort();
        ids
    }
}

fn levels(raw: &[(Decimal, u64)]) -> Vec<PriceLevel> {
    raw.iter().map(|&(price, quantity)| PriceLevel::new(price, quantity)).collect()
}

fn btc_100k() -> MarketInfo {
    MarketInfo {
        id: "btc-100k-2026".to_string(),
        title: "Bitcoin to reach $100K by end of 2026?".to_string(),
        category: Some("crypto".to_string()),
        yes_price: dec!(0.72),
        volume: dec!(2847592),
        liquidity: dec!(458920),
        bids: levels(&[
            (dec!(0.71), 12500),
            (dec!(0.70), 8900),
            (dec!(0.69), 15200),
            (dec!(0.68), 22400),
            (dec!(0.67), 18700),
            (dec!(0.66), 9800),
            (dec!(0.65), 31200),
        ]),
        asks: levels(&[
            (dec!(0.73), 11200),
            (dec!(0.74), 9400),
            (dec!(0.75), 18900),
            (dec!(0.76), 14500),
            (dec!(0.77), 21300),
            (dec!(0.78), 8900),
            (dec!(0.79), 25600),
        ]),
    }
}

fn fed_rate_cut() -> MarketInfo {
    MarketInfo {
        id: "fed-rate-cut-q1".to_string(),
        title: "Fed to cut rates in Q1 2026?".to_string(),
        category: Some("economics".to_string()),
        yes_price: dec!(0.45),
        volume: dec!(1523847),
        liquidity: dec!(312450),
        bids: levels(&[
            (dec!(0.44), 8900),
            (dec!(0.43), 12400),
            (dec!(0.42), 18700),
            (dec!(0.41), 9200),
            (dec!(0.40), 25800),
        ]),
        asks: levels(&[
            (dec!(0.46), 7800),
            (dec!(0.47), 11200),
            (dec!(0.48), 15600),
            (dec!(0.49), 8900),
            (dec!(0.50), 22100),
        ]),
    }
}

// No resting depth; the aggregator generates a book for it
fn spacex_mars() -> MarketInfo {
    MarketInfo {
        id: "spacex-mars-2026".to_string(),
        title: "SpaceX to launch a Starship to Mars in 2026?".to_string(),
        category: Some("science".to_string()),
        yes_price: dec!(0.18),
        volume: dec!(684210),
        liquidity: dec!(95400),
        bids: Vec::new(),
        asks: Vec::new(),
    }
}
