//! Error types for the simulator

use rust_decimal::Decimal;
use thiserror::Error;

/// Simulator-wide error type
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SimError {
    #[error("Unknown event kind: {0}")]
    UnknownEventKind(String),

    #[error("Market not found: {0}")]
    MarketNotFound(String),

    #[error("Crossed book: bid {bid} >= ask {ask}")]
    CrossedBook { bid: Decimal, ask: Decimal },

    #[error("Price out of bounds: {0}")]
    PriceOutOfBounds(Decimal),

    #[error("A submission is already in flight for this session")]
    SubmitInProgress,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl SimError {
    pub fn unknown_event_kind(kind: impl Into<String>) -> Self {
        SimError::UnknownEventKind(kind.into())
    }

    pub fn market_not_found(market_id: impl Into<String>) -> Self {
        SimError::MarketNotFound(market_id.into())
    }

    pub fn crossed(bid: Decimal, ask: Decimal) -> Self {
        SimError::CrossedBook { bid, ask }
    }

    pub fn config(msg: impl Into<String>) -> Self {
        SimError::Config(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        SimError::Internal(msg.into())
    }

    /// Whether this error is an invariant violation rejected at a mutation boundary
    pub fn is_invariant_violation(&self) -> bool {
        matches!(
            self,
            SimError::CrossedBook { .. } | SimError::PriceOutOfBounds(_)
        )
    }
}

/// Result type alias for simulator operations
pub type SimResult<T> = Result<T, SimError>;
