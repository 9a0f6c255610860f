//! Scanner Configuration
//!
//! One immutable `ScanConfig` per scan. Layering (lowest to highest):
//! built-in defaults, optional config file (TOML, or JSON when the path ends
//! in `.json`), environment / CLI overrides applied by the binary.

use anyhow::{Context, Result};
use chrono::NaiveTime;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::time::Duration;

use crate::error::ScanError;
use crate::models::{Exchange, Granularity, ScanMode};

const SESSION_TIME_FORMAT: &str = "%H:%M";

/// UTC time-of-day window, half-open `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionRange {
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl SessionRange {
    pub fn new(start: NaiveTime, end: NaiveTime) -> Result<Self, ScanError> {
        if start >= end {
            return Err(ScanError::Config(format!(
                "session start {} must be before session end {}",
                start.format(SESSION_TIME_FORMAT),
                end.format(SESSION_TIME_FORMAT)
            )));
        }
        Ok(Self { start, end })
    }

    /// Parse `"HH:MM"` pairs.
    pub fn parse(start: &str, end: &str) -> Result<Self, ScanError> {
        Self::new(parse_time_of_day(start)?, parse_time_of_day(end)?)
    }
}

impl Default for SessionRange {
    /// 00:00 to 08:00 UTC
    fn default() -> Self {
        Self {
            start: NaiveTime::MIN,
            end: NaiveTime::from_hms_opt(8, 0, 0).unwrap_or(NaiveTime::MIN),
        }
    }
}

pub fn parse_time_of_day(raw: &str) -> Result<NaiveTime, ScanError> {
    NaiveTime::parse_from_str(raw.trim(), SESSION_TIME_FORMAT)
        .map_err(|e| ScanError::Config(format!("invalid time of day '{}': {}", raw, e)))
}

#[derive(Serialize, Deserialize)]
struct SessionRangeRepr {
    start: String,
    end: String,
}

impl Serialize for SessionRange {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        SessionRangeRepr {
            start: self.start.format(SESSION_TIME_FORMAT).to_string(),
            end: self.end.format(SESSION_TIME_FORMAT).to_string(),
        }
        .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for SessionRange {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let repr = SessionRangeRepr::deserialize(deserializer)?;
        SessionRange::parse(&repr.start, &repr.end).map_err(serde::de::Error::custom)
    }
}

/// How the symbol universe is chosen when an exchange has no explicit list.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "snake_case")]
pub enum Discovery {
    /// Highest 24h volume tickers on each exchange
    #[default]
    Volume,
    /// CoinGecko market-cap ranking, mapped to each exchange's symbols
    #[value(name = "market-cap", alias = "market_cap")]
    MarketCap,
}

/// Main configuration for one scan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    /// Exchanges to scan
    pub enabled_exchanges: BTreeSet<Exchange>,

    /// Explicit symbols per exchange; an exchange without an entry is discovered from its tickers
    pub symbols: BTreeMap<Exchange, Vec<String>>,

    /// Minimum 24h base volume
    pub min_volume: f64,

    /// Minimum last price
    pub min_price: f64,

    /// Asian session window (UTC)
    pub asian_session: SessionRange,

    /// Signals only, or every evaluated symbol
    pub mode: ScanMode,

    /// Candle interval for the session and the post-session touch scan
    pub intraday_granularity: Granularity,

    /// Days of daily history for the all-time range; unset = everything the exchange keeps
    pub history_days: Option<u32>,

    /// Symbol discovery strategy
    pub discovery: Discovery,

    /// Coins read from the market-cap ranking (market-cap discovery only)
    pub market_cap_top: usize,

    /// Prepend CoinGecko daily prices older than the exchange's first daily candle
    pub coingecko_history: bool,

    /// Cap on discovered symbols per exchange
    pub max_symbols_per_exchange: usize,

    /// Symbols evaluated concurrently across all exchanges
    pub max_concurrency: usize,

    /// Whole-scan deadline; unfinished symbols are dropped
    pub scan_timeout_secs: u64,

    /// Per-request HTTP timeout
    pub request_timeout_secs: u64,

    /// Attempts per request (first try included)
    pub max_retries: u32,

    /// Minimum spacing between requests to one exchange
    pub min_request_interval_ms: u64,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            enabled_exchanges: Exchange::ALL.into_iter().collect(),
            symbols: BTreeMap::new(),
            min_volume: 1000.0,
            min_price: 0.00001,
            asian_session: SessionRange::default(),
            mode: ScanMode::SignalsOnly,
            intraday_granularity: Granularity::FifteenMinutes,
            history_days: None,
            discovery: Discovery::Volume,
            market_cap_top: 100,
            coingecko_history: false,
            max_symbols_per_exchange: 50,
            max_concurrency: 8,
            scan_timeout_secs: 300,
            request_timeout_secs: 20,
            max_retries: 3,
            min_request_interval_ms: 120,
        }
    }
}

impl ScanConfig {
    /// Load from a TOML or JSON file; missing keys keep their defaults.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;

        let is_json = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));

        let config: ScanConfig = if is_json {
            serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse JSON config {}", path.display()))?
        } else {
            toml::from_str(&content)
                .with_context(|| format!("Failed to parse TOML config {}", path.display()))?
        };

        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ScanError> {
        if self.enabled_exchanges.is_empty() {
            return Err(ScanError::Config("no exchange enabled".to_string()));
        }
        if !(self.min_volume.is_finite() && self.min_volume >= 0.0) {
            return Err(ScanError::Config(format!(
                "min_volume must be >= 0, got {}",
                self.min_volume
            )));
        }
        if !(self.min_price.is_finite() && self.min_price >= 0.0) {
            return Err(ScanError::Config(format!(
                "min_price must be >= 0, got {}",
                self.min_price
            )));
        }
        if self.asian_session.start >= self.asian_session.end {
            return Err(ScanError::Config(
                "asian_session start must be before end".to_string(),
            ));
        }
        if self.intraday_granularity == Granularity::OneDay {
            return Err(ScanError::Config(
                "intraday_granularity must be shorter than a day".to_string(),
            ));
        }
        if self.history_days.is_some_and(|d| d < 2) {
            return Err(ScanError::Config("history_days must be >= 2".to_string()));
        }
        if self.discovery == Discovery::MarketCap && self.market_cap_top == 0 {
            return Err(ScanError::Config("market_cap_top must be >= 1".to_string()));
        }
        if self.max_concurrency == 0 {
            return Err(ScanError::Config("max_concurrency must be >= 1".to_string()));
        }
        if self.max_retries == 0 {
            return Err(ScanError::Config("max_retries must be >= 1".to_string()));
        }
        Ok(())
    }

    pub fn symbols_for(&self, exchange: Exchange) -> &[String] {
        self.symbols
            .get(&exchange)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn passes_filters(&self, price: f64, volume: f64) -> bool {
        volume >= self.min_volume && price >= self.min_price
    }

    pub fn scan_timeout(&self) -> Duration {
        Duration::from_secs(self.scan_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn min_request_interval(&self) -> Duration {
        Duration::from_millis(self.min_request_interval_ms)
    }
}
