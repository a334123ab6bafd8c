//! Order outcomes and trade projections

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Outcome of a single order submission
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub order_id: Option<String>,
    /// Whole shares filled
    pub shares: u64,
    /// Cash spent on the filled shares
    pub total_cost: Decimal,
    /// Execution price per share
    pub avg_price: Decimal,
    /// Slippage applied, in percent
    pub slippage_percent: Decimal,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl OrderResult {
    /// A filled order
    pub fn filled(
        order_id: impl Into<String>,
        shares: u64,
        total_cost: Decimal,
        avg_price: Decimal,
        slippage_percent: Decimal,
    ) -> Self {
        Self {
            success: true,
            order_id: Some(order_id.into()),
            shares,
            total_cost,
            avg_price,
            slippage_percent,
            error: None,
        }
    }

    /// A rejected order carrying only an error message
    pub fn rejected(error: impl Into<String>) -> Self {
        Self {
            success: false,
            order_id: None,
            shares: 0,
            total_cost: Decimal::ZERO,
            avg_price: Decimal::ZERO,
            slippage_percent: Decimal::ZERO,
            error: Some(error.into()),
        }
    }
}

/// Quantities derived from an amount at a price, shown before submission
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TradeProjection {
    pub shares: u64,
    pub payout: Decimal,
    pub profit: Decimal,
    pub return_percent: Decimal,
    /// Estimated slippage in percent, in `[0, 5]`
    pub estimated_slippage: Decimal,
}
