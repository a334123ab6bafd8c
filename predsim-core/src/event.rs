//! Market event types carried by the event bus
//!
//! These types define the messages the synthetic feed publishes and the
//! aggregator consumes.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::SimError;
use crate::market::{BookSide, Outcome, PriceLevel, TradeSide};

/// Discriminant of a [`MarketEvent`], used as the subscription key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    PriceUpdate,
    OrderBookUpdate,
    TradeExecuted,
}

impl EventKind {
    /// All event kinds, in producer start order
    pub const ALL: [EventKind; 3] = [
        EventKind::PriceUpdate,
        EventKind::OrderBookUpdate,
        EventKind::TradeExecuted,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::PriceUpdate => "price_update",
            EventKind::OrderBookUpdate => "order_book_update",
            EventKind::TradeExecuted => "trade_executed",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for EventKind {
    type Err = SimError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "price_update" | "PRICE_UPDATE" => Ok(EventKind::PriceUpdate),
            "order_book_update" | "ORDERBOOK_UPDATE" => Ok(EventKind::OrderBookUpdate),
            "trade_executed" | "TRADE_EXECUTED" => Ok(EventKind::TradeExecuted),
            _ => Err(SimError::unknown_event_kind(s)),
        }
    }
}

/// Events published on the bus
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MarketEvent {
    /// The YES price moved by `delta`
    PriceUpdate {
        market_id: String,
        delta: Decimal,
        /// Milliseconds since the Unix epoch
        timestamp: i64,
    },
    /// One order book level was inserted, replaced or removed
    OrderBookUpdate {
        market_id: String,
        side: BookSide,
        level: PriceLevel,
        timestamp: i64,
    },
    /// A trade printed on the market
    TradeExecuted {
        market_id: String,
        outcome: Outcome,
        side: TradeSide,
        price: Decimal,
        quantity: u64,
        timestamp: i64,
    },
}

impl MarketEvent {
    /// Get the kind of this event
    pub fn kind(&self) -> EventKind {
        match self {
            Self::PriceUpdate { .. } => EventKind::PriceUpdate,
            Self::OrderBookUpdate { .. } => EventKind::OrderBookUpdate,
            Self::TradeExecuted { .. } => EventKind::TradeExecuted,
        }
    }

    /// Get the market ID for this event
    pub fn market_id(&self) -> &str {
        match self {
            Self::PriceUpdate { market_id, .. } => market_id,
            Self::OrderBookUpdate { market_id, .. } => market_id,
            Self::TradeExecuted { market_id, .. } => market_id,
        }
    }

    /// Emission timestamp in milliseconds since the Unix epoch
    pub fn timestamp(&self) -> i64 {
        match self {
            Self::PriceUpdate { timestamp, .. } => *timestamp,
            Self::OrderBookUpdate { timestamp, .. } => *timestamp,
            Self::TradeExecuted { timestamp, .. } => *timestamp,
        }
    }

    /// Emission timestamp as a UTC datetime
    pub fn datetime(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(self.timestamp()).unwrap_or_else(Utc::now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_event_kind_parsing() {
        assert_eq!("price_update".parse::<EventKind>(), Ok(EventKind::PriceUpdate));
        assert_eq!("ORDERBOOK_UPDATE".parse::<EventKind>(), Ok(EventKind::OrderBookUpdate));
        assert_eq!("trade_executed".parse::<EventKind>(), Ok(EventKind::TradeExecuted));
        assert_eq!(
            "POSITION_UPDATE".parse::<EventKind>(),
            Err(SimError::unknown_event_kind("POSITION_UPDATE"))
        );
    }

    #[test]
    fn test_event_accessors() {
        let event = MarketEvent::OrderBookUpdate {
            market_id: "btc-100k-2026".to_string(),
            side: BookSide::Bid,
            level: PriceLevel::new(dec!(0.70), 1500),
            timestamp: 1_700_000_000_000,
        };
        assert_eq!(event.kind(), EventKind::OrderBookUpdate);
        assert_eq!(event.market_id(), "btc-100k-2026");
        assert_eq!(event.datetime().timestamp(), 1_700_000_000);
    }

    #[test]
    fn test_event_json_is_tagged() {
        let event = MarketEvent::PriceUpdate {
            market_id: "fed-rate-cut-q1".to_string(),
            delta: dec!(-0.013),
            timestamp: 42,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "price_update");
        assert_eq!(json["market_id"], "fed-rate-cut-q1");

        let back: MarketEvent = serde_json::from_value(json).unwrap();
        assert_eq!(back, event);
    }
}
