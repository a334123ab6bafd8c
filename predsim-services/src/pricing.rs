//! Pricing & Execution Engine
//!
//! Pure functions that turn a cash amount into shares, payout, profit and a
//! slippage estimate. All arithmetic is done on `Decimal`; divisions are
//! truncated toward zero so a trader is never credited a fractional share.

use chrono::Utc;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use rust_decimal_macros::dec;
use tracing::debug;
use uuid::Uuid;

use predsim_core::{clamp_price, OrderResult, Outcome, TradeProjection, TradeSide};

/// Decimal places kept after a division
const DIVISION_SCALE: u32 = 20;

/// A winning share redeems for exactly one unit of currency
const PAYOUT_PER_SHARE: Decimal = Decimal::ONE;

/// Cap on the estimated slippage shown before submission (percent)
pub const MAX_ESTIMATED_SLIPPAGE: Decimal = dec!(5);

/// Slippage every execution pays (fraction of price)
const BASE_EXECUTION_SLIPPAGE: Decimal = dec!(0.005);

/// Cap on execution slippage (fraction of price)
const MAX_EXECUTION_SLIPPAGE: Decimal = dec!(0.02);

/// Order size at which execution slippage grows by `SIZE_SLIPPAGE_STEP`
const SIZE_SLIPPAGE_NOTIONAL: Decimal = dec!(100000);
const SIZE_SLIPPAGE_STEP: Decimal = dec!(0.01);

/// Error message for an execution that would fill zero shares
pub const ORDER_TOO_SMALL: &str = "order too small";

/// Divide, truncating toward zero. `None` on division by zero or overflow.
fn div_trunc(numerator: Decimal, denominator: Decimal) -> Option<Decimal> {
    numerator
        .checked_div(denominator)
        .map(|q| q.round_dp_with_strategy(DIVISION_SCALE, RoundingStrategy::ToZero))
}

/// Whole shares purchasable for `amount` at `price`: `floor(amount / price)`.
///
/// Returns 0 for a non-positive price or amount and saturates at `u64::MAX`.
/// The result always satisfies `shares * price <= amount`.
pub fn shares(amount: Decimal, price: Decimal) -> u64 {
    if price <= Decimal::ZERO || amount <= Decimal::ZERO {
        return 0;
    }

    // Both inputs are positive, so a failed division is an overflow
    let Some(quotient) = div_trunc(amount, price) else {
        return u64::MAX;
    };
    let mut shares = quotient.floor().to_u64().unwrap_or(u64::MAX);

    // The division itself rounds at 28 digits; never let that round up into a whole share
    if let Some(cost) = Decimal::from(shares).checked_mul(price) {
        if cost > amount && shares > 0 {
            shares -= 1;
        }
    }

    shares
}

/// Payout if the position wins
pub fn payout(shares: u64) -> Decimal {
    Decimal::from(shares) * PAYOUT_PER_SHARE
}

/// Profit if the position wins (payout - cost)
pub fn profit(shares: u64, cost: Decimal) -> Decimal {
    payout(shares) - cost
}

/// Return as a percentage of cost; 0 when cost is 0
pub fn return_percent(profit: Decimal, cost: Decimal) -> Decimal {
    if cost.is_zero() {
        return Decimal::ZERO;
    }

    div_trunc(profit, cost)
        .and_then(|ratio| ratio.checked_mul(Decimal::ONE_HUNDRED))
        .unwrap_or(Decimal::ZERO)
}

/// Linear price-impact proxy: `min(5, amount / liquidity * 100)` percent.
///
/// Not a depth walk. Always in `[0, 5]`.
pub fn estimated_slippage(amount: Decimal, liquidity: Decimal) -> Decimal {
    if amount <= Decimal::ZERO {
        return Decimal::ZERO;
    }
    if liquidity <= Decimal::ZERO {
        return MAX_ESTIMATED_SLIPPAGE;
    }

    div_trunc(amount, liquidity)
        .and_then(|ratio| ratio.checked_mul(Decimal::ONE_HUNDRED))
        .map(|percent| percent.min(MAX_ESTIMATED_SLIPPAGE))
        .unwrap_or(MAX_ESTIMATED_SLIPPAGE)
}

/// All quantities shown for an amount at a side-adjusted price
pub fn project(amount: Decimal, price: Decimal, liquidity: Decimal) -> TradeProjection {
    let amount = amount.max(Decimal::ZERO);
    let shares = shares(amount, price);
    let profit = profit(shares, amount);

    TradeProjection {
        shares,
        payout: payout(shares),
        profit,
        return_percent: return_percent(profit, amount),
        estimated_slippage: estimated_slippage(amount, liquidity),
    }
}

/// Execution slippage as a fraction of price: `min(2%, 0.5% + amount / 100000 * 1%)`
pub fn execution_slippage(amount: Decimal) -> Decimal {
    let size_component = div_trunc(amount.max(Decimal::ZERO), SIZE_SLIPPAGE_NOTIONAL)
        .and_then(|ratio| ratio.checked_mul(SIZE_SLIPPAGE_STEP))
        .unwrap_or(MAX_EXECUTION_SLIPPAGE);

    (BASE_EXECUTION_SLIPPAGE + size_component.min(MAX_EXECUTION_SLIPPAGE)).min(MAX_EXECUTION_SLIPPAGE)
}

/// Generate an order ID (`ord_<millis>_<9 chars>`)
pub fn generate_order_id() -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("ord_{}_{}", Utc::now().timestamp_millis(), &suffix[..9])
}

/// Simulate filling an order against the current price.
///
/// Slippage moves the price against the trader (up for buys, down for
/// sells) and the execution price is clamped to `[0.01, 0.99]`. This is a
/// closed-form approximation: `liquidity` is reported but the book is not
/// walked. The only failure is an order too small to buy one share; funds
/// are assumed to be validated by the caller.
pub fn simulate_execution(
    outcome: Outcome,
    side: TradeSide,
    amount: Decimal,
    current_price: Decimal,
    liquidity: Decimal,
) -> OrderResult {
    let slippage_fraction = execution_slippage(amount);
    let slippage = current_price * slippage_fraction;

    let execution_price = clamp_price(match side {
        TradeSide::Buy => current_price + slippage,
        TradeSide::Sell => current_price - slippage,
    });

    let filled = shares(amount, execution_price);
    if filled == 0 {
        debug!(
            "Rejected {:?} {} order of {} at {}: {}",
            side, outcome, amount, current_price, ORDER_TOO_SMALL
        );
        return OrderResult::rejected(ORDER_TOO_SMALL);
    }

    let total_cost = Decimal::from(filled) * execution_price;
    debug!(
        "Filled {:?} {} x{} at {} (quoted {}, slippage {}, liquidity {})",
        side, outcome, filled, execution_price, current_price, slippage_fraction, liquidity
    );

    OrderResult::filled(
        generate_order_id(),
        filled,
        total_cost,
        execution_price,
        slippage_fraction * Decimal::ONE_HUNDRED,
    )
}
