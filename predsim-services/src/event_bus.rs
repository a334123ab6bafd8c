//! Event Bus
//!
//! In-process publish/subscribe channel for [`MarketEvent`]s. Handlers are
//! invoked synchronously, in registration order, on the publishing thread.
//! Registered [`EventProducer`]s run as independent tokio tasks once the bus
//! is started.
//!
//! Each event kind has a FIFO queue and at most one thread draining it. A
//! publish that finds the kind already being drained (by another thread, or
//! by an outer dispatch on this one) enqueues and returns; the drainer
//! delivers it in order. No lock is held while handlers run.

use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use chrono::Utc;
use dashmap::DashMap;
use parking_lot::{Mutex, MutexGuard};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::Serialize;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use predsim_core::{EventKind, MarketEvent, SimError, SimResult};

use crate::producer::EventProducer;

/// Callback invoked for every event of the subscribed kind
pub type Handler = Arc<dyn Fn(&MarketEvent) -> anyhow::Result<()> + Send + Sync>;

#[derive(Clone)]
struct HandlerEntry {
    id: u64,
    active: Arc<AtomicBool>,
    handler: Handler,
}

/// Delivery counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BusStats {
    /// Events published
    pub published: u64,
    /// Successful handler invocations
    pub delivered: u64,
    /// Handler invocations that returned an error or panicked
    pub failed: u64,
}

/// Pending events of one kind
#[derive(Default)]
struct DispatchQueue {
    pending: VecDeque<MarketEvent>,
    /// Set while some thread is delivering this kind
    draining: bool,
}

struct BusInner {
    handlers: DashMap<EventKind, Vec<HandlerEntry>>,
    /// One queue per kind so every subscriber sees the same emission order
    queues: [Mutex<DispatchQueue>; 3],
    producers: Mutex<Vec<Arc<dyn EventProducer>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    next_handler_id: AtomicU64,
    last_timestamp: AtomicI64,
    published: AtomicU64,
    delivered: AtomicU64,
    failed: AtomicU64,
}

impl BusInner {
    fn queue(&self, kind: EventKind) -> &Mutex<DispatchQueue> {
        let idx = match kind {
            EventKind::PriceUpdate => 0,
            EventKind::OrderBookUpdate => 1,
            EventKind::TradeExecuted => 2,
        };
        &self.queues[idx]
    }

    /// Millisecond timestamp that never repeats or goes backwards
    fn next_timestamp(&self) -> i64 {
        let now = Utc::now().timestamp_millis();
        let mut last = self.last_timestamp.load(Ordering::SeqCst);
        loop {
            let next = now.max(last + 1);
            match self.last_timestamp.compare_exchange_weak(
                last,
                next,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return next,
                Err(actual) => last = actual,
            }
        }
    }

    fn publish(&self, event: MarketEvent) {
        let kind = event.kind();
        let queue = self.queue(kind).lock();
        self.enqueue(kind, queue, event);
    }

    /// Queue `event` and deliver the queue unless another dispatch already is
    fn enqueue(&self, kind: EventKind, mut queue: MutexGuard<'_, DispatchQueue>, event: MarketEvent) {
        queue.pending.push_back(event);
        if queue.draining {
            return;
        }
        queue.draining = true;
        drop(queue);

        self.drain(kind);
    }

    /// Deliver queued events of `kind` until the queue is empty.
    ///
    /// Only called by the thread that set `draining`.
    fn drain(&self, kind: EventKind) {
        loop {
            let event = {
                let mut queue = self.queue(kind).lock();
                match queue.pending.pop_front() {
                    Some(event) => event,
                    None => {
                        queue.draining = false;
                        return;
                    }
                }
            };
            self.deliver(&event);
        }
    }

    fn deliver(&self, event: &MarketEvent) {
        let kind = event.kind();

        // Snapshot so handlers can (un)subscribe while we dispatch
        let entries: Vec<HandlerEntry> = self
            .handlers
            .get(&kind)
            .map(|list| list.value().clone())
            .unwrap_or_default();

        self.published.fetch_add(1, Ordering::Relaxed);

        for entry in entries {
            if !entry.active.load(Ordering::SeqCst) {
                continue;
            }

            match catch_unwind(AssertUnwindSafe(|| (entry.handler)(event))) {
                Ok(Ok(())) => {
                    self.delivered.fetch_add(1, Ordering::Relaxed);
                }
                Ok(Err(e)) => {
                    self.failed.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        "[EventBus] Handler {} failed on {} for {}: {}",
                        entry.id,
                        kind,
                        event.market_id(),
                        e
                    );
                }
                Err(panic) => {
                    self.failed.fetch_add(1, Ordering::Relaxed);
                    error!(
                        "[EventBus] Handler {} panicked on {} for {}: {}",
                        entry.id,
                        kind,
                        event.market_id(),
                        panic_message(panic.as_ref())
                    );
                }
            }
        }
    }

    fn emit(&self, producer: &dyn EventProducer) -> Option<MarketEvent> {
        let kind = producer.kind();

        // Stamp and enqueue under the queue lock so queue order is timestamp order
        let queue = self.queue(kind).lock();
        let event = producer.produce(self.next_timestamp())?;
        if event.kind() != kind {
            warn!(
                "[EventBus] Producer for {} emitted a {} event, dropping it",
                kind,
                event.kind()
            );
            return None;
        }

        self.enqueue(kind, queue, event.clone());
        Some(event)
    }

    fn remove_handler(&self, kind: EventKind, id: u64) {
        if let Some(mut list) = self.handlers.get_mut(&kind) {
            list.retain(|entry| entry.id != id);
        }
    }

    fn abort_tasks(&self) -> usize {
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for task in &tasks {
            task.abort();
        }
        tasks.len()
    }
}

impl Drop for BusInner {
    fn drop(&mut self) {
        self.abort_tasks();
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        msg.to_string()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Handle to a registered handler
///
/// Calling [`Subscription::unsubscribe`] removes exactly that handler.
/// Dropping the handle does not unsubscribe.
#[must_use = "a subscription must be kept to be able to unsubscribe"]
pub struct Subscription {
    kind: EventKind,
    id: u64,
    active: Arc<AtomicBool>,
    bus: Weak<BusInner>,
}

impl Subscription {
    /// Remove the handler. Calling this more than once is a no-op.
    ///
    /// Once this returns the handler is never invoked again, although an
    /// invocation already running on another thread is allowed to finish.
    pub fn unsubscribe(&self) {
        if !self.active.swap(false, Ordering::SeqCst) {
            return;
        }

        if let Some(bus) = self.bus.upgrade() {
            bus.remove_handler(self.kind, self.id);
        }
        debug!("[EventBus] Handler {} unsubscribed from {}", self.id, self.kind);
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub fn kind(&self) -> EventKind {
        self.kind
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("kind", &self.kind)
            .field("id", &self.id)
            .field("active", &self.is_active())
            .finish()
    }
}

/// Cloneable handle to an event bus
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    /// Create a bus with no producers
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BusInner {
                handlers: DashMap::new(),
                queues: Default::default(),
                producers: Mutex::new(Vec::new()),
                tasks: Mutex::new(Vec::new()),
                next_handler_id: AtomicU64::new(1),
                last_timestamp: AtomicI64::new(0),
                published: AtomicU64::new(0),
                delivered: AtomicU64::new(0),
                failed: AtomicU64::new(0),
            }),
        }
    }

    /// Create a bus with the given producers registered
    pub fn with_producers(producers: Vec<Arc<dyn EventProducer>>) -> Self {
        let bus = Self::new();
        for producer in producers {
            bus.register_producer(producer);
        }
        bus
    }

    /// Register a producer. Takes effect on the next `start()`.
    pub fn register_producer(&self, producer: Arc<dyn EventProducer>) {
        debug!(
            "[EventBus] Registered {} producer ({})",
            producer.kind(),
            producer.interval()
        );
        self.inner.producers.lock().push(producer);
    }

    /// Register a handler for one event kind
    pub fn subscribe<F>(&self, kind: EventKind, handler: F) -> Subscription
    where
        F: Fn(&MarketEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let id = self.inner.next_handler_id.fetch_add(1, Ordering::SeqCst);
        let active = Arc::new(AtomicBool::new(true));

        self.inner.handlers.entry(kind).or_default().push(HandlerEntry {
            id,
            active: Arc::clone(&active),
            handler: Arc::new(handler),
        });

        debug!("[EventBus] Handler {} subscribed to {}", id, kind);

        Subscription {
            kind,
            id,
            active,
            bus: Arc::downgrade(&self.inner),
        }
    }

    /// Register a handler by event kind name (e.g. `"price_update"`)
    pub fn subscribe_named<F>(&self, kind: &str, handler: F) -> SimResult<Subscription>
    where
        F: Fn(&MarketEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let kind: EventKind = kind.parse()?;
        Ok(self.subscribe(kind, handler))
    }

    /// Deliver an event to every handler of its kind, in registration order
    ///
    /// Delivery completes before this returns unless the kind is already being
    /// dispatched, in which case the event is queued behind that dispatch.
    pub fn publish(&self, event: MarketEvent) {
        self.inner.publish(event);
    }

    /// Ask a producer for one event, stamp it from the bus clock and publish it
    pub fn emit(&self, producer: &dyn EventProducer) -> Option<MarketEvent> {
        self.inner.emit(producer)
    }

    /// Start one task per registered producer. No-op if already running.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&self) -> SimResult<()> {
        let runtime = Handle::try_current()
            .map_err(|e| SimError::internal(format!("event bus needs a tokio runtime: {}", e)))?;

        let mut tasks = self.inner.tasks.lock();
        if !tasks.is_empty() {
            debug!("[EventBus] Already running");
            return Ok(());
        }

        let producers = self.inner.producers.lock().clone();
        for producer in producers {
            let bus = Arc::downgrade(&self.inner);
            tasks.push(runtime.spawn(run_producer(bus, producer)));
        }

        info!("[EventBus] Started {} producers", tasks.len());
        Ok(())
    }

    /// Cancel every producer task. No-op if not running.
    pub fn stop(&self) {
        let stopped = self.inner.abort_tasks();
        if stopped > 0 {
            info!("[EventBus] Stopped {} producers", stopped);
        }
    }

    pub fn is_running(&self) -> bool {
        !self.inner.tasks.lock().is_empty()
    }

    /// Number of handlers registered for a kind
    pub fn subscriber_count(&self, kind: EventKind) -> usize {
        self.inner.handlers.get(&kind).map(|list| list.len()).unwrap_or(0)
    }

    pub fn stats(&self) -> BusStats {
        BusStats {
            published: self.inner.published.load(Ordering::Relaxed),
            delivered: self.inner.delivered.load(Ordering::Relaxed),
            failed: self.inner.failed.load(Ordering::Relaxed),
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

async fn run_producer(bus: Weak<BusInner>, producer: Arc<dyn EventProducer>) {
    let mut rng = StdRng::from_os_rng();
    let interval = producer.interval();

    loop {
        tokio::time::sleep(interval.sample(&mut rng)).await;

        let Some(bus) = bus.upgrade() else {
            break;
        };
        if let Some(event) = bus.emit(producer.as_ref()) {
            debug!("[EventBus] Emitted {} for {}", event.kind(), event.market_id());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IntervalRange;
    use rust_decimal_macros::dec;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn price_event(market_id: &str, timestamp: i64) -> MarketEvent {
        MarketEvent::PriceUpdate {
            market_id: market_id.to_string(),
            delta: dec!(0.01),
            timestamp,
        }
    }

    fn trade_event(market_id: &str) -> MarketEvent {
        MarketEvent::TradeExecuted {
            market_id: market_id.to_string(),
            outcome: predsim_core::Outcome::Yes,
            side: predsim_core::TradeSide::Buy,
            price: dec!(0.5),
            quantity: 10,
            timestamp: 1,
        }
    }

    struct FixedProducer {
        market_id: &'static str,
    }

    impl EventProducer for FixedProducer {
        fn kind(&self) -> EventKind {
            EventKind::PriceUpdate
        }

        fn interval(&self) -> IntervalRange {
            IntervalRange::new(100, 100).unwrap()
        }

        fn produce(&self, timestamp: i64) -> Option<MarketEvent> {
            Some(price_event(self.market_id, timestamp))
        }
    }

    #[test]
    fn test_publish_in_registration_order() {
        let bus = EventBus::new();
        let calls = Arc::new(Mutex::new(Vec::new()));

        let mut subs = Vec::new();
        for n in 0..3 {
            let calls = Arc::clone(&calls);
            subs.push(bus.subscribe(EventKind::PriceUpdate, move |_| {
                calls.lock().push(n);
                Ok(())
            }));
        }

        bus.publish(price_event("m", 1));
        assert_eq!(*calls.lock(), vec![0, 1, 2]);
        assert_eq!(bus.subscriber_count(EventKind::PriceUpdate), 3);
        assert_eq!(bus.subscriber_count(EventKind::TradeExecuted), 0);
    }

    #[test]
    fn test_unsubscribe_stops_delivery() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&count);
        let sub = bus.subscribe(EventKind::PriceUpdate, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        bus.publish(price_event("m", 1));
        assert_eq!(count.load(Ordering::SeqCst), 1);

        sub.unsubscribe();
        sub.unsubscribe();
        assert!(!sub.is_active());

        for ts in 2..52 {
            bus.publish(price_event("m", ts));
        }
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(bus.subscriber_count(EventKind::PriceUpdate), 0);
    }

    #[test]
    fn test_unsubscribe_during_dispatch() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        let slot: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));

        // The first handler removes the second before it runs
        let victim = Arc::clone(&slot);
        let _first = bus.subscribe(EventKind::PriceUpdate, move |_| {
            if let Some(sub) = victim.lock().as_ref() {
                sub.unsubscribe();
            }
            Ok(())
        });

        let counter = Arc::clone(&count);
        *slot.lock() = Some(bus.subscribe(EventKind::PriceUpdate, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }));

        bus.publish(price_event("m", 1));
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_failing_handlers_are_isolated() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));

        let _erroring = bus.subscribe(EventKind::PriceUpdate, |_| anyhow::bail!("boom"));
        let _panicking = bus.subscribe(EventKind::PriceUpdate, |_| panic!("handler panic"));
        let counter = Arc::clone(&count);
        let _healthy = bus.subscribe(EventKind::PriceUpdate, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        bus.publish(price_event("m", 1));
        bus.publish(price_event("m", 2));

        assert_eq!(count.load(Ordering::SeqCst), 2);
        assert_eq!(
            bus.stats(),
            BusStats {
                published: 2,
                delivered: 2,
                failed: 4
            }
        );
    }

    #[test]
    fn test_handler_may_publish_and_subscribe() {
        let bus = EventBus::new();
        let trades = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&trades);
        let _trade_sub = bus.subscribe(EventKind::TradeExecuted, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        let inner_bus = bus.clone();
        let _price_sub = bus.subscribe(EventKind::PriceUpdate, move |event| {
            inner_bus.publish(MarketEvent::TradeExecuted {
                market_id: event.market_id().to_string(),
                outcome: predsim_core::Outcome::Yes,
                side: predsim_core::TradeSide::Buy,
                price: dec!(0.5),
                quantity: 10,
                timestamp: event.timestamp(),
            });
            let _late = inner_bus.subscribe(EventKind::OrderBookUpdate, |_| Ok(()));
            Ok(())
        });

        bus.publish(price_event("m", 1));
        assert_eq!(trades.load(Ordering::SeqCst), 1);
        assert_eq!(bus.subscriber_count(EventKind::OrderBookUpdate), 1);
    }

    #[test]
    fn test_subscribe_named() {
        let bus = EventBus::new();
        let sub = bus.subscribe_named("TRADE_EXECUTED", |_| Ok(())).unwrap();
        assert_eq!(sub.kind(), EventKind::TradeExecuted);

        let err = bus.subscribe_named("position_update", |_| Ok(())).unwrap_err();
        assert_eq!(err, SimError::unknown_event_kind("position_update"));
    }

    #[test]
    fn test_emit_timestamps_are_strictly_increasing() {
        let bus = EventBus::new();
        let producer = FixedProducer { market_id: "m" };

        let mut last = 0;
        for _ in 0..100 {
            let ts = bus.emit(&producer).unwrap().timestamp();
            assert!(ts > last);
            last = ts;
        }
    }

    #[test]
    fn test_nested_same_kind_publish_is_queued() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let inner_bus = bus.clone();
        let log = Arc::clone(&seen);
        let _first = bus.subscribe(EventKind::PriceUpdate, move |event| {
            log.lock().push(format!("first:{}", event.market_id()));
            if event.market_id() == "outer" {
                inner_bus.publish(price_event("inner", 2));
            }
            Ok(())
        });
        let log = Arc::clone(&seen);
        let _second = bus.subscribe(EventKind::PriceUpdate, move |event| {
            log.lock().push(format!("second:{}", event.market_id()));
            Ok(())
        });

        bus.publish(price_event("outer", 1));
        assert_eq!(
            *seen.lock(),
            vec!["first:outer", "second:outer", "first:inner", "second:inner"]
        );
        assert_eq!(bus.stats().published, 2);
    }

    #[test]
    fn test_cross_kind_publish_from_two_threads() {
        use std::sync::mpsc;
        use std::sync::Barrier;

        let bus = EventBus::new();
        let barrier = Arc::new(Barrier::new(2));
        let prices = Arc::new(AtomicUsize::new(0));
        let trades = Arc::new(AtomicUsize::new(0));

        // Each handler waits until the other thread is mid-dispatch, then
        // publishes the kind the other thread is delivering
        let (inner_bus, gate, counter) = (bus.clone(), Arc::clone(&barrier), Arc::clone(&prices));
        let _prices = bus.subscribe(EventKind::PriceUpdate, move |event| {
            counter.fetch_add(1, Ordering::SeqCst);
            if event.market_id() == "a" {
                gate.wait();
                inner_bus.publish(trade_event("nested"));
            }
            Ok(())
        });
        let (inner_bus, gate, counter) = (bus.clone(), Arc::clone(&barrier), Arc::clone(&trades));
        let _trades = bus.subscribe(EventKind::TradeExecuted, move |event| {
            counter.fetch_add(1, Ordering::SeqCst);
            if event.market_id() == "b" {
                gate.wait();
                inner_bus.publish(price_event("nested", 2));
            }
            Ok(())
        });

        let (done_tx, done_rx) = mpsc::channel();
        let (bus_a, tx_a) = (bus.clone(), done_tx.clone());
        std::thread::spawn(move || {
            bus_a.publish(price_event("a", 1));
            let _ = tx_a.send("a");
        });
        let (bus_b, tx_b) = (bus.clone(), done_tx);
        std::thread::spawn(move || {
            bus_b.publish(trade_event("b"));
            let _ = tx_b.send("b");
        });

        for _ in 0..2 {
            assert!(done_rx.recv_timeout(Duration::from_secs(5)).is_ok());
        }
        assert_eq!(prices.load(Ordering::SeqCst), 2);
        assert_eq!(trades.load(Ordering::SeqCst), 2);
        assert_eq!(bus.stats().failed, 0);
    }

    #[test]
    fn test_start_requires_runtime() {
        let bus = EventBus::new();
        assert!(matches!(bus.start(), Err(SimError::Internal(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_producers_run_until_stopped() {
        let bus = EventBus::with_producers(vec![Arc::new(FixedProducer { market_id: "m" })]);
        let count = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&count);
        let _sub = bus.subscribe(EventKind::PriceUpdate, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        bus.start().unwrap();
        bus.start().unwrap();
        assert!(bus.is_running());

        tokio::time::sleep(Duration::from_millis(350)).await;
        assert_eq!(count.load(Ordering::SeqCst), 3);

        bus.stop();
        bus.stop();
        assert!(!bus.is_running());

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }
}
