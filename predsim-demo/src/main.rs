//! Prediction Market Feed Simulator
//!
//! Runs the synthetic feed, keeps every configured market up to date and
//! places a demo order against the first one at a fixed cadence.

use std::sync::Arc;
use std::time::Duration;

use predsim_core::Outcome;
use predsim_services::format::{format_currency, format_price, format_probability};
use predsim_services::{
    synthetic_producers, EventBus, LogNotifier, MarketAggregator, MarketSource, MarketUpdate,
    MockMarketCatalog, SimConfig, TradeSession,
};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Cash committed by each demo order
const DEMO_ORDER_AMOUNT: &str = "100";

/// Time between demo orders
const DEMO_ORDER_INTERVAL: Duration = Duration::from_secs(15);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env.local file
    if let Err(e) = dotenvy::from_filename(".env.local") {
        // Not an error if the file doesn't exist
        if !matches!(e, dotenvy::Error::Io(_)) {
            eprintln!("Warning: Failed to load .env.local: {}", e);
        }
    }

    // Initialize logging
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,predsim_demo=debug")),
        )
        .init();

    info!("Starting prediction market feed simulator");

    let config = SimConfig::from_env()?;
    info!(
        "Markets: {} | price every {} | book every {} | trades every {}",
        config.bus.markets.join(", "),
        config.bus.price_interval,
        config.bus.order_book_interval,
        config.bus.trade_interval,
    );

    let catalog = Arc::new(MockMarketCatalog::new());
    let bus = EventBus::with_producers(synthetic_producers(&config.bus, catalog.as_ref()));
    let aggregator = MarketAggregator::new(config.aggregator.clone(), catalog.clone(), bus.clone());

    // Subscribe to every configured market the catalogue knows
    let available = catalog.market_ids();
    let mut subscriptions = Vec::new();
    for market_id in &config.bus.markets {
        if !available.contains(market_id) {
            warn!(
                "Market {} is not in the catalogue ({}), its events will be ignored",
                market_id,
                available.join(", ")
            );
            continue;
        }
        let subscription = aggregator.subscribe(market_id)?;
        if let Some(state) = aggregator.snapshot(market_id) {
            info!(
                "{}: {} YES {} ({})",
                market_id,
                state.title,
                format_price(state.yes_price),
                format_probability(state.yes_price)
            );
        }
        subscriptions.push(subscription);
    }

    let Some(primary) = subscriptions.first().map(|s| s.market_id().to_string()) else {
        anyhow::bail!("None of the configured markets exist");
    };

    // Log price moves as they happen
    let mut updates = aggregator.updates();
    let update_logger = tokio::spawn(async move {
        loop {
            match updates.recv().await {
                Ok(MarketUpdate::Price {
                    market_id,
                    yes_price,
                    flash,
                    ..
                }) => {
                    debug!("{} -> {} ({:?})", market_id, format_price(yes_price), flash);
                }
                Ok(_) => {}
                Err(RecvError::Lagged(missed)) => warn!("Update logger lagged by {}", missed),
                Err(RecvError::Closed) => break,
            }
        }
    });

    let notifier = Arc::new(LogNotifier::new());
    let session = TradeSession::with_notifier(config.session.clone(), notifier.clone());
    let tracker = session.track_market(&aggregator, &primary)?;

    bus.start()?;

    let mut order_timer = tokio::time::interval(DEMO_ORDER_INTERVAL);
    order_timer.tick().await;
    let mut side = Outcome::Yes;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received");
                break;
            }
            _ = order_timer.tick() => {
                session.set_side(side);
                session.set_amount(DEMO_ORDER_AMOUNT);

                let projection = session.projection();
                info!(
                    "Quote {} {} on {}: {} shares, payout {}, profit {} ({}%), est. slippage {}%",
                    DEMO_ORDER_AMOUNT,
                    side,
                    primary,
                    projection.shares,
                    format_currency(projection.payout),
                    format_currency(projection.profit),
                    projection.return_percent.round_dp(2),
                    projection.estimated_slippage.round_dp(3),
                );

                match session.submit().await {
                    Ok(result) if result.success => debug!("Order result: {:?}", result),
                    Ok(result) => debug!("Order rejected: {:?}", result.error),
                    Err(e) => warn!("Submit failed: {}", e),
                }
                side = side.opposite();
            }
        }
    }

    bus.stop();
    tracker.stop();
    for subscription in &subscriptions {
        subscription.unsubscribe();
    }
    update_logger.abort();

    let stats = bus.stats();
    info!(
        "Published {} events ({} deliveries, {} handler failures); {} orders filled, {} failed",
        stats.published,
        stats.delivered,
        stats.failed,
        notifier.executed_count(),
        notifier.failed_count()
    );

    Ok(())
}
