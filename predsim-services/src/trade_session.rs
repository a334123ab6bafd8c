//! Trade Session
//!
//! Holds one trader's in-progress order (side, amount, locked price) and keeps
//! the derived projection in step with every mutation. A session is
//! single-writer: all state sits behind one lock that is never held across an
//! `.await`.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde::Serialize;
use tokio::runtime::Handle;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use predsim_core::{
    clamp_price, OrderResult, Outcome, SimError, SimResult, TradeProjection, TradeSide,
};

use crate::aggregator::{MarketAggregator, MarketUpdate};
use crate::config::SessionConfig;
use crate::notifier::TradeNotifier;
use crate::pricing;

/// Failure message for a submission without a positive amount
pub const INVALID_AMOUNT: &str = "Invalid amount";

/// Failure message for a submission before any market price is known
pub const NO_MARKET_PRICE: &str = "No market price";

/// Where the session is in its order lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionPhase {
    /// No amount entered
    Idle,
    /// Amount entered, projection populated
    Valid,
    /// Price frozen for execution
    Locked,
    /// Submission in flight
    Submitting,
}

/// Read-only view of a session
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSnapshot {
    pub selected_side: Outcome,
    /// Amount text as entered
    pub amount_entered: String,
    pub is_submitting: bool,
    pub price_locked: bool,
    pub locked_price: Option<Decimal>,
    pub yes_price: Decimal,
    pub no_price: Decimal,
    pub liquidity: Decimal,
    pub projection: TradeProjection,
    pub phase: SessionPhase,
}

#[derive(Default)]
struct SessionState {
    selected_side: Outcome,
    amount_entered: String,
    /// `amount_entered` parsed, 0 when empty or invalid
    amount: Decimal,
    is_submitting: bool,
    price_locked: bool,
    locked_price: Option<Decimal>,
    lock_generation: u64,
    lock_task: Option<JoinHandle<()>>,
    yes_price: Decimal,
    no_price: Decimal,
    liquidity: Decimal,
    projection: TradeProjection,
}

impl SessionState {
    fn side_price(&self) -> Decimal {
        match self.selected_side {
            Outcome::Yes => self.yes_price,
            Outcome::No => self.no_price,
        }
    }

    fn recompute(&mut self) {
        let price = self.side_price();
        self.projection = if price > Decimal::ZERO {
            pricing::project(self.amount, price, self.liquidity)
        } else {
            // Nothing to quote against yet
            TradeProjection::default()
        };
    }

    fn phase(&self) -> SessionPhase {
        if self.is_submitting {
            SessionPhase::Submitting
        } else if self.price_locked {
            SessionPhase::Locked
        } else if self.amount > Decimal::ZERO {
            SessionPhase::Valid
        } else {
            SessionPhase::Idle
        }
    }

    fn clear_lock(&mut self) {
        if let Some(task) = self.lock_task.take() {
            task.abort();
        }
        self.lock_generation += 1;
        self.price_locked = false;
        self.locked_price = None;
    }

    fn clear_order(&mut self) {
        self.amount_entered.clear();
        self.amount = Decimal::ZERO;
        self.clear_lock();
        self.recompute();
    }

    fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            selected_side: self.selected_side,
            amount_entered: self.amount_entered.clone(),
            is_submitting: self.is_submitting,
            price_locked: self.price_locked,
            locked_price: self.locked_price,
            yes_price: self.yes_price,
            no_price: self.no_price,
            liquidity: self.liquidity,
            projection: self.projection,
            phase: self.phase(),
        }
    }
}

/// Parse entered text into an amount; anything unusable becomes 0
pub fn parse_amount(text: &str) -> Decimal {
    match text.trim().parse::<Decimal>() {
        Ok(amount) if amount > Decimal::ZERO => amount,
        _ => Decimal::ZERO,
    }
}

struct SessionInner {
    config: SessionConfig,
    state: Mutex<SessionState>,
    notifier: Option<Arc<dyn TradeNotifier>>,
}

impl SessionInner {
    /// Freeze the side-adjusted price and (re)arm the expiry timer
    fn lock_state(self: &Arc<Self>, state: &mut SessionState) -> Decimal {
        state.clear_lock();

        let price = state.side_price();
        state.price_locked = true;
        state.locked_price = Some(price);
        state.lock_task = self.spawn_lock_timer(state.lock_generation);

        debug!("[TradeSession] Locked {} at {}", state.selected_side, price);
        price
    }

    fn spawn_lock_timer(self: &Arc<Self>, generation: u64) -> Option<JoinHandle<()>> {
        let Ok(runtime) = Handle::try_current() else {
            warn!("[TradeSession] No runtime, price lock will not expire");
            return None;
        };

        let session = Arc::downgrade(self);
        let duration = self.config.lock_duration();

        Some(runtime.spawn(async move {
            tokio::time::sleep(duration).await;
            if let Some(session) = session.upgrade() {
                session.expire_lock(generation);
            }
        }))
    }

    fn expire_lock(&self, generation: u64) {
        let mut state = self.state.lock();
        if state.lock_generation == generation && state.price_locked {
            // Running inside the lock task itself; don't abort it
            state.lock_task = None;
            state.clear_lock();
            debug!("[TradeSession] Price lock expired");
        }
    }

    fn finish_submit(&self) {
        let mut state = self.state.lock();
        state.is_submitting = false;
        state.clear_order();
    }
}

impl Drop for SessionInner {
    fn drop(&mut self) {
        self.state.get_mut().clear_lock();
    }
}

/// Resets the session when a submission completes or its future is dropped
struct SubmitGuard<'a> {
    session: &'a SessionInner,
}

impl Drop for SubmitGuard<'_> {
    fn drop(&mut self) {
        self.session.finish_submit();
    }
}

/// One trader's order entry surface
#[derive(Clone)]
pub struct TradeSession {
    inner: Arc<SessionInner>,
}

impl TradeSession {
    pub fn new(config: SessionConfig) -> Self {
        Self::build(config, None)
    }

    /// Create a session that reports submission outcomes to `notifier`
    pub fn with_notifier(config: SessionConfig, notifier: Arc<dyn TradeNotifier>) -> Self {
        Self::build(config, Some(notifier))
    }

    fn build(config: SessionConfig, notifier: Option<Arc<dyn TradeNotifier>>) -> Self {
        Self {
            inner: Arc::new(SessionInner {
                config,
                state: Mutex::new(SessionState::default()),
                notifier,
            }),
        }
    }

    pub fn set_side(&self, side: Outcome) {
        let mut state = self.inner.state.lock();
        state.selected_side = side;
        state.recompute();
    }

    /// Set the amount text. Empty, unparseable or negative input counts as 0.
    pub fn set_amount(&self, text: &str) {
        let mut state = self.inner.state.lock();
        state.amount_entered = text.to_string();
        state.amount = parse_amount(text);
        state.recompute();
    }

    /// Update the live market prices the projection is computed against
    pub fn set_market_context(&self, yes_price: Decimal, no_price: Decimal, liquidity: Decimal) {
        let yes = clamp_price(yes_price);
        let no = if yes_price + no_price == Decimal::ONE && yes == yes_price {
            no_price
        } else {
            warn!(
                "[TradeSession] Inconsistent market context yes={} no={}, using no={}",
                yes_price,
                no_price,
                Decimal::ONE - yes
            );
            Decimal::ONE - yes
        };

        let mut state = self.inner.state.lock();
        state.yes_price = yes;
        state.no_price = no;
        state.liquidity = liquidity.max(Decimal::ZERO);
        state.recompute();
    }

    /// Freeze the current side-adjusted price for the lock duration
    pub fn lock_price(&self) -> Decimal {
        let mut state = self.inner.state.lock();
        self.inner.lock_state(&mut state)
    }

    pub fn unlock_price(&self) {
        self.inner.state.lock().clear_lock();
    }

    /// Execute the entered order.
    ///
    /// A missing amount or market price is reported as a failed `OrderResult`
    /// without touching the session. A second call while one is in flight is
    /// an error. Otherwise the session is reset once execution finishes,
    /// whatever the outcome.
    pub async fn submit(&self) -> SimResult<OrderResult> {
        let prepared = {
            let mut state = self.inner.state.lock();

            if state.is_submitting {
                return Err(SimError::SubmitInProgress);
            }

            if state.amount <= Decimal::ZERO {
                Err(INVALID_AMOUNT)
            } else if state.side_price() <= Decimal::ZERO {
                Err(NO_MARKET_PRICE)
            } else {
                let price = match state.locked_price {
                    Some(price) if state.price_locked => price,
                    _ => self.inner.lock_state(&mut state),
                };
                state.is_submitting = true;
                Ok((state.selected_side, state.amount, price, state.liquidity))
            }
        };

        let (outcome, amount, price, liquidity) = match prepared {
            Ok(order) => order,
            Err(reason) => {
                debug!("[TradeSession] Rejected submit: {}", reason);
                if let Some(notifier) = &self.inner.notifier {
                    notifier.trade_failed(reason);
                }
                return Ok(OrderResult::rejected(reason));
            }
        };

        let _guard = SubmitGuard {
            session: &self.inner,
        };

        info!(
            "[TradeSession] Submitting {} {} at {}",
            outcome, amount, price
        );
        tokio::time::sleep(self.inner.config.execution_latency()).await;

        let result = pricing::simulate_execution(outcome, TradeSide::Buy, amount, price, liquidity);

        if let Some(notifier) = &self.inner.notifier {
            match &result.error {
                None => notifier.trade_executed(outcome, &result),
                Some(error) => notifier.trade_failed(error),
            }
        }

        Ok(result)
    }

    /// Clear the amount, projection and price lock
    pub fn reset(&self) {
        self.inner.state.lock().clear_order();
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.inner.state.lock().snapshot()
    }

    pub fn phase(&self) -> SessionPhase {
        self.inner.state.lock().phase()
    }

    pub fn projection(&self) -> TradeProjection {
        self.inner.state.lock().projection
    }

    /// Follow a market's price through the aggregator.
    ///
    /// Seeds the market context from the current state, then forwards every
    /// price move for the market until the tracker is stopped or dropped.
    pub fn track_market(&self, aggregator: &MarketAggregator, market_id: &str) -> SimResult<MarketTracker> {
        let runtime = Handle::try_current()
            .map_err(|e| SimError::internal(format!("market tracking needs a tokio runtime: {}", e)))?;

        // Subscribe before reading so no move between the two is lost
        let mut updates = aggregator.updates();
        let state = aggregator.load(market_id)?;
        self.set_market_context(state.yes_price, state.no_price, state.liquidity);

        let session: Weak<SessionInner> = Arc::downgrade(&self.inner);
        let aggregator = aggregator.clone();
        let id = market_id.to_string();

        let task = runtime.spawn(async move {
            loop {
                let update = updates.recv().await;

                let Some(inner) = session.upgrade() else {
                    break;
                };
                let tracked = TradeSession { inner };

                match update {
                    Ok(MarketUpdate::Price {
                        market_id,
                        yes_price,
                        no_price,
                        liquidity,
                        ..
                    }) if market_id == id => {
                        tracked.set_market_context(yes_price, no_price, liquidity);
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(missed)) => {
                        warn!("[TradeSession] Missed {} updates for {}, resyncing", missed, id);
                        if let Some(state) = aggregator.snapshot(&id) {
                            tracked.set_market_context(state.yes_price, state.no_price, state.liquidity);
                        }
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });

        info!("[TradeSession] Tracking {}", market_id);
        Ok(MarketTracker {
            market_id: market_id.to_string(),
            task,
        })
    }
}

/// Forwards aggregator price moves into a session until stopped or dropped
#[must_use = "dropping a MarketTracker stops it"]
pub struct MarketTracker {
    market_id: String,
    task: JoinHandle<()>,
}

impl MarketTracker {
    pub fn market_id(&self) -> &str {
        &self.market_id
    }

    pub fn stop(&self) {
        self.task.abort();
    }

    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }
}

impl Drop for MarketTracker {
    fn drop(&mut self) {
        self.task.abort();
    }
}
