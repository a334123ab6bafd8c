//! Trade notifications
//!
//! A [`TradeNotifier`] observes submission outcomes; presentation is entirely
//! up to the implementation. [`LogNotifier`] writes them to the log.

use std::sync::atomic::{AtomicU64, Ordering};

use tracing::{info, warn};

use predsim_core::{OrderResult, Outcome};

use crate::format::{format_cents, format_currency, format_shares};

/// Observer of trade submission outcomes
pub trait TradeNotifier: Send + Sync {
    fn name(&self) -> &str;

    /// A submission filled
    fn trade_executed(&self, _outcome: Outcome, _result: &OrderResult) {}

    /// A submission was rejected
    fn trade_failed(&self, _error: &str) {}
}

/// Confirmation line for a filled order, e.g. `Bought 153 YES shares @ 65¢`
pub fn execution_message(outcome: Outcome, result: &OrderResult) -> String {
    format!(
        "Bought {} {} shares @ {}",
        format_shares(result.shares),
        outcome.as_str().to_uppercase(),
        format_cents(result.avg_price)
    )
}

/// Notifier that logs through `tracing` and counts what it saw
#[derive(Debug, Default)]
pub struct LogNotifier {
    executed: AtomicU64,
    failed: AtomicU64,
}

impl LogNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn executed_count(&self) -> u64 {
        self.executed.load(Ordering::Relaxed)
    }

    pub fn failed_count(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }
}

impl TradeNotifier for LogNotifier {
    fn name(&self) -> &str {
        "LogNotifier"
    }

    fn trade_executed(&self, outcome: Outcome, result: &OrderResult) {
        self.executed.fetch_add(1, Ordering::Relaxed);
        info!(
            "[Notifier] Order placed: {} for {} ({})",
            execution_message(outcome, result),
            format_currency(result.total_cost),
            result.order_id.as_deref().unwrap_or("-")
        );
    }

    fn trade_failed(&self, error: &str) {
        self.failed.fetch_add(1, Ordering::Relaxed);
        warn!("[Notifier] Order failed: {}", error);
    }
}
