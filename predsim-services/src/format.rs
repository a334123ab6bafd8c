//! Display formatting for prices, amounts and share counts

use rust_decimal::{Decimal, RoundingStrategy};
use rust_decimal_macros::dec;

fn round(value: Decimal, dp: u32) -> Decimal {
    value.round_dp_with_strategy(dp, RoundingStrategy::MidpointAwayFromZero)
}

/// Insert `,` every three digits of an unsigned integer string
fn group_thousands(digits: &str) -> String {
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, ch) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(ch);
    }
    out
}

/// Price in cents with one decimal, e.g. `65.0¢`
pub fn format_price(price: Decimal) -> String {
    format!("{:.1}¢", round(price * Decimal::ONE_HUNDRED, 1))
}

/// Whole-cent price, e.g. `65¢`
pub fn format_cents(price: Decimal) -> String {
    format!("{:.0}¢", round(price * Decimal::ONE_HUNDRED, 0))
}

/// Price as an implied probability, e.g. `72%`
pub fn format_probability(price: Decimal) -> String {
    format!("{:.0}%", round(price * Decimal::ONE_HUNDRED, 0))
}

/// US dollar amount with two decimals and thousands separators, e.g. `$1,234.50`
pub fn format_currency(amount: Decimal) -> String {
    let rounded = round(amount, 2);
    let sign = if rounded.is_sign_negative() && !rounded.is_zero() { "-" } else { "" };
    let text = format!("{:.2}", rounded.abs());
    let (whole, cents) = text.split_once('.').unwrap_or((text.as_str(), "00"));
    format!("{}${}.{}", sign, group_thousands(whole), cents)
}

/// Compact volume, e.g. `$2.8M`, `$459K`, `$950`
pub fn format_volume(volume: Decimal) -> String {
    if volume >= dec!(1000000) {
        format!("${:.1}M", round(volume / dec!(1000000), 1))
    } else if volume >= dec!(1000) {
        format!("${:.0}K", round(volume / dec!(1000), 0))
    } else {
        format!("${}", volume.normalize())
    }
}

/// Share count with thousands separators, e.g. `12,500`
pub fn format_shares(shares: u64) -> String {
    group_thousands(&shares.to_string())
}
