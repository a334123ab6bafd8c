//! Simulator configuration

use std::env;
use std::str::FromStr;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Markets the synthetic feed emits for when nothing else is configured
pub const DEFAULT_MARKETS: [&str; 3] = ["btc-100k-2026", "fed-rate-cut-q1", "spacex-mars-2026"];

/// Inclusive range of milliseconds a producer waits between ticks
///
/// Always non-empty with a positive lower bound; deserialization goes
/// through the same check as [`IntervalRange::new`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "IntervalBounds")]
pub struct IntervalRange {
    min_ms: u64,
    max_ms: u64,
}

/// Unchecked wire form of an [`IntervalRange`]
#[derive(Deserialize)]
struct IntervalBounds {
    min_ms: u64,
    max_ms: u64,
}

impl TryFrom<IntervalBounds> for IntervalRange {
    type Error = ConfigError;

    fn try_from(bounds: IntervalBounds) -> Result<Self, Self::Error> {
        Self::new(bounds.min_ms, bounds.max_ms)
    }
}

impl IntervalRange {
    pub fn new(min_ms: u64, max_ms: u64) -> Result<Self, ConfigError> {
        if min_ms == 0 || min_ms > max_ms {
            return Err(ConfigError::InvalidRange { min_ms, max_ms });
        }
        Ok(Self { min_ms, max_ms })
    }

    pub fn min_ms(&self) -> u64 {
        self.min_ms
    }

    pub fn max_ms(&self) -> u64 {
        self.max_ms
    }

    /// Draw a delay uniformly from the range
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> Duration {
        Duration::from_millis(rng.random_range(self.min_ms..=self.max_ms))
    }
}

impl std::fmt::Display for IntervalRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}ms", self.min_ms, self.max_ms)
    }
}

impl FromStr for IntervalRange {
    type Err = ConfigError;

    /// Parse `"2000-5000"` or a single fixed value `"2000"`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ConfigError::InvalidValue {
            field: "interval".to_string(),
            value: s.to_string(),
        };

        let (min, max) = match s.split_once('-') {
            Some((min, max)) => (min.trim(), max.trim()),
            None => (s.trim(), s.trim()),
        };
        let min_ms = min.parse().map_err(|_| invalid())?;
        let max_ms = max.parse().map_err(|_| invalid())?;
        Self::new(min_ms, max_ms)
    }
}

/// Event bus configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    /// Markets the synthetic producers emit events for
    #[serde(default = "default_markets")]
    pub markets: Vec<String>,
    #[serde(default = "default_price_interval")]
    pub price_interval: IntervalRange,
    #[serde(default = "default_order_book_interval")]
    pub order_book_interval: IntervalRange,
    #[serde(default = "default_trade_interval")]
    pub trade_interval: IntervalRange,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            markets: default_markets(),
            price_interval: default_price_interval(),
            order_book_interval: default_order_book_interval(),
            trade_interval: default_trade_interval(),
        }
    }
}

/// Market aggregator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregatorConfig {
    /// How long a price flash stays set (in milliseconds)
    #[serde(default = "default_flash_ms")]
    pub flash_ms: u64,
    /// Number of points in a generated price history
    #[serde(default = "default_history_points")]
    pub history_points: usize,
    /// Spacing of generated price history points (in seconds)
    #[serde(default = "default_history_interval_secs")]
    pub history_interval_secs: u64,
    /// Number of recent trades kept per market
    #[serde(default = "default_recent_trades")]
    pub recent_trades: usize,
    /// Capacity of the market update broadcast channel
    #[serde(default = "default_update_capacity")]
    pub update_capacity: usize,
}

impl AggregatorConfig {
    pub fn flash_duration(&self) -> Duration {
        Duration::from_millis(self.flash_ms)
    }
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            flash_ms: default_flash_ms(),
            history_points: default_history_points(),
            history_interval_secs: default_history_interval_secs(),
            recent_trades: default_recent_trades(),
            update_capacity: default_update_capacity(),
        }
    }
}

/// Trade session configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// How long a locked price stays valid (in milliseconds)
    #[serde(default = "default_lock_ms")]
    pub lock_ms: u64,
    /// Simulated execution latency of a submission (in milliseconds)
    #[serde(default = "default_execution_latency_ms")]
    pub execution_latency_ms: u64,
}

impl SessionConfig {
    pub fn lock_duration(&self) -> Duration {
        Duration::from_millis(self.lock_ms)
    }

    pub fn execution_latency(&self) -> Duration {
        Duration::from_millis(self.execution_latency_ms)
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            lock_ms: default_lock_ms(),
            execution_latency_ms: default_execution_latency_ms(),
        }
    }
}

/// Top-level simulator configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SimConfig {
    #[serde(default)]
    pub bus: BusConfig,
    #[serde(default)]
    pub aggregator: AggregatorConfig,
    #[serde(default)]
    pub session: SessionConfig,
}

impl SimConfig {
    /// Load configuration from environment variables
    ///
    /// Every variable is optional:
    /// - PREDSIM_MARKETS: comma-separated market IDs
    /// - PREDSIM_PRICE_INTERVAL_MS / PREDSIM_BOOK_INTERVAL_MS / PREDSIM_TRADE_INTERVAL_MS: `min-max`
    /// - PREDSIM_FLASH_MS, PREDSIM_HISTORY_POINTS
    /// - PREDSIM_LOCK_MS, PREDSIM_EXECUTION_LATENCY_MS
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(markets) = lookup("PREDSIM_MARKETS") {
            let markets: Vec<String> = markets
                .split(',')
                .map(str::trim)
                .filter(|m| !m.is_empty())
                .map(String::from)
                .collect();
            if markets.is_empty() {
                return Err(ConfigError::EmptyMarketList);
            }
            config.bus.markets = markets;
        }

        if let Some(range) = parse_var(&lookup, "PREDSIM_PRICE_INTERVAL_MS")? {
            config.bus.price_interval = range;
        }
        if let Some(range) = parse_var(&lookup, "PREDSIM_BOOK_INTERVAL_MS")? {
            config.bus.order_book_interval = range;
        }
        if let Some(range) = parse_var(&lookup, "PREDSIM_TRADE_INTERVAL_MS")? {
            config.bus.trade_interval = range;
        }
        if let Some(flash_ms) = parse_var(&lookup, "PREDSIM_FLASH_MS")? {
            config.aggregator.flash_ms = flash_ms;
        }
        if let Some(points) = parse_var::<usize, _>(&lookup, "PREDSIM_HISTORY_POINTS")? {
            if points == 0 {
                return Err(ConfigError::InvalidValue {
                    field: "PREDSIM_HISTORY_POINTS".to_string(),
                    value: "0".to_string(),
                });
            }
            config.aggregator.history_points = points;
        }
        if let Some(lock_ms) = parse_var(&lookup, "PREDSIM_LOCK_MS")? {
            config.session.lock_ms = lock_ms;
        }
        if let Some(latency_ms) = parse_var(&lookup, "PREDSIM_EXECUTION_LATENCY_MS")? {
            config.session.execution_latency_ms = latency_ms;
        }

        Ok(config)
    }
}

fn parse_var<T, F>(lookup: &F, key: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue {
                field: key.to_string(),
                value,
            }),
    }
}

fn default_markets() -> Vec<String> {
    DEFAULT_MARKETS.iter().map(|m| m.to_string()).collect()
}

fn default_price_interval() -> IntervalRange {
    IntervalRange { min_ms: 2000, max_ms: 5000 }
}

fn default_order_book_interval() -> IntervalRange {
    IntervalRange { min_ms: 1000, max_ms: 3000 }
}

fn default_trade_interval() -> IntervalRange {
    IntervalRange { min_ms: 3000, max_ms: 8000 }
}

fn default_flash_ms() -> u64 {
    500
}

fn default_history_points() -> usize {
    50
}

fn default_history_interval_secs() -> u64 {
    3600 // 1 hour
}

fn default_recent_trades() -> usize {
    50
}

fn default_update_capacity() -> usize {
    256
}

fn default_lock_ms() -> u64 {
    3000
}

fn default_execution_latency_ms() -> u64 {
    800
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for {field}: {value}")]
    InvalidValue { field: String, value: String },

    #[error("Invalid interval range {min_ms}-{max_ms}ms")]
    InvalidRange { min_ms: u64, max_ms: u64 },

    #[error("PREDSIM_MARKETS cannot be empty")]
    EmptyMarketList,
}

impl From<ConfigError> for predsim_core::SimError {
    fn from(e: ConfigError) -> Self {
        predsim_core::SimError::config(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = SimConfig::from_lookup(lookup_from(&[])).unwrap();
        assert_eq!(config.bus.markets.len(), 3);
        assert_eq!(config.bus.price_interval, IntervalRange { min_ms: 2000, max_ms: 5000 });
        assert_eq!(config.bus.trade_interval, IntervalRange { min_ms: 3000, max_ms: 8000 });
        assert_eq!(config.aggregator.flash_duration(), Duration::from_millis(500));
        assert_eq!(config.session.lock_duration(), Duration::from_secs(3));
        assert_eq!(config.session.execution_latency(), Duration::from_millis(800));
    }

    #[test]
    fn test_overrides() {
        let config = SimConfig::from_lookup(lookup_from(&[
            ("PREDSIM_MARKETS", "a, b ,,c"),
            ("PREDSIM_PRICE_INTERVAL_MS", "10-20"),
            ("PREDSIM_LOCK_MS", "1500"),
            ("PREDSIM_HISTORY_POINTS", "12"),
        ]))
        .unwrap();

        assert_eq!(config.bus.markets, vec!["a", "b", "c"]);
        assert_eq!(config.bus.price_interval, IntervalRange { min_ms: 10, max_ms: 20 });
        assert_eq!(config.session.lock_ms, 1500);
        assert_eq!(config.aggregator.history_points, 12);
    }

    #[test]
    fn test_invalid_values() {
        assert!(matches!(
            SimConfig::from_lookup(lookup_from(&[("PREDSIM_LOCK_MS", "soon")])),
            Err(ConfigError::InvalidValue { .. })
        ));
        assert!(matches!(
            SimConfig::from_lookup(lookup_from(&[("PREDSIM_TRADE_INTERVAL_MS", "900-100")])),
            Err(ConfigError::InvalidRange { .. })
        ));
        assert!(matches!(
            SimConfig::from_lookup(lookup_from(&[("PREDSIM_MARKETS", " , ")])),
            Err(ConfigError::EmptyMarketList)
        ));
        assert!(SimConfig::from_lookup(lookup_from(&[("PREDSIM_HISTORY_POINTS", "0")])).is_err());
    }

    #[test]
    fn test_interval_parsing_and_sampling() {
        let fixed: IntervalRange = "250".parse().unwrap();
        assert_eq!(fixed, IntervalRange { min_ms: 250, max_ms: 250 });
        assert_eq!(fixed.sample(&mut rand::rng()), Duration::from_millis(250));

        let range: IntervalRange = "100-200".parse().unwrap();
        let mut rng = rand::rng();
        for _ in 0..100 {
            let delay = range.sample(&mut rng);
            assert!(delay >= Duration::from_millis(100) && delay <= Duration::from_millis(200));
        }
    }

    #[test]
    fn test_parse_from_json() {
        let json = r#"{ "session": { "lock_ms": 1000 } }"#;
        let config: SimConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.session.lock_ms, 1000);
        assert_eq!(config.session.execution_latency_ms, 800);
        assert_eq!(config.aggregator.history_points, 50);
    }

    #[test]
    fn test_json_intervals_are_validated() {
        let json = r#"{ "bus": { "price_interval": { "min_ms": 900, "max_ms": 100 } } }"#;
        assert!(serde_json::from_str::<SimConfig>(json).is_err());

        let json = r#"{ "bus": { "trade_interval": { "min_ms": 0, "max_ms": 0 } } }"#;
        assert!(serde_json::from_str::<SimConfig>(json).is_err());

        let json = r#"{ "bus": { "price_interval": { "min_ms": 100, "max_ms": 900 } } }"#;
        let config: SimConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.bus.price_interval, IntervalRange::new(100, 900).unwrap());
        assert_eq!(config.bus.price_interval.to_string(), "100-900ms");

        let back = serde_json::to_value(config.bus.price_interval).unwrap();
        assert_eq!(back["min_ms"], 100);
        assert_eq!(back["max_ms"], 900);
    }
}
