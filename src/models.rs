use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Supported exchanges
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "snake_case")]
pub enum Exchange {
    Binance,
    Coinbase,
    Kraken,
}

impl Exchange {
    pub const ALL: [Exchange; 3] = [Exchange::Binance, Exchange::Coinbase, Exchange::Kraken];

    pub fn as_str(&self) -> &'static str {
        match self {
            Exchange::Binance => "binance",
            Exchange::Coinbase => "coinbase",
            Exchange::Kraken => "kraken",
        }
    }
}

impl std::fmt::Display for Exchange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Exchange {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "binance" => Ok(Exchange::Binance),
            "coinbase" => Ok(Exchange::Coinbase),
            "kraken" => Ok(Exchange::Kraken),
            other => Err(format!(
                "unsupported exchange '{}', expected one of binance, coinbase, kraken",
                other
            )),
        }
    }
}

/// Candle interval
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Granularity {
    #[serde(rename = "1m")]
    OneMinute,
    #[serde(rename = "5m")]
    FiveMinutes,
    #[serde(rename = "15m")]
    FifteenMinutes,
    #[serde(rename = "1h")]
    OneHour,
    #[serde(rename = "4h")]
    FourHours,
    #[serde(rename = "1d")]
    OneDay,
}

impl Granularity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Granularity::OneMinute => "1m",
            Granularity::FiveMinutes => "5m",
            Granularity::FifteenMinutes => "15m",
            Granularity::OneHour => "1h",
            Granularity::FourHours => "4h",
            Granularity::OneDay => "1d",
        }
    }

    pub fn seconds(&self) -> i64 {
        match self {
            Granularity::OneMinute => 60,
            Granularity::FiveMinutes => 300,
            Granularity::FifteenMinutes => 900,
            Granularity::OneHour => 3_600,
            Granularity::FourHours => 14_400,
            Granularity::OneDay => 86_400,
        }
    }

    pub fn duration(&self) -> Duration {
        Duration::seconds(self.seconds())
    }
}

impl std::fmt::Display for Granularity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Granularity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "1m" => Ok(Granularity::OneMinute),
            "5m" => Ok(Granularity::FiveMinutes),
            "15m" => Ok(Granularity::FifteenMinutes),
            "1h" => Ok(Granularity::OneHour),
            "4h" => Ok(Granularity::FourHours),
            "1d" => Ok(Granularity::OneDay),
            other => Err(format!("unsupported granularity '{}'", other)),
        }
    }
}

/// OHLCV candle. Sequences handed to the signal code are sorted by `open_time`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub open_time: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Candle {
    /// Rows with non-finite prices or an inverted range are dropped by the parsers.
    pub fn is_valid(&self) -> bool {
        [self.open, self.high, self.low, self.close, self.volume]
            .iter()
            .all(|v| v.is_finite())
            && self.low <= self.high
    }
}

/// Sort ascending by open time and drop duplicate open times (page overlaps).
pub fn normalize_candles(mut candles: Vec<Candle>) -> Vec<Candle> {
    candles.retain(Candle::is_valid);
    candles.sort_by_key(|c| c.open_time);
    candles.dedup_by_key(|c| c.open_time);
    candles
}

/// High/low of the Friday Asian session.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SessionWindow {
    pub date: NaiveDate,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub high: f64,
    pub low: f64,
}

impl SessionWindow {
    pub fn midline(&self) -> f64 {
        (self.high + self.low) / 2.0
    }
}

/// All-time range over the available daily history.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ExtremumRange {
    pub all_time_high: f64,
    pub all_time_low: f64,
    pub fib50: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LevelName {
    Midline,
    Fib50,
}

impl LevelName {
    pub fn as_str(&self) -> &'static str {
        match self {
            LevelName::Midline => "midline",
            LevelName::Fib50 => "fib50",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TouchResult {
    pub level_name: LevelName,
    pub level_price: f64,
    pub touched: bool,
    pub touch_time: Option<DateTime<Utc>>,
}

/// Last price and 24h base volume for a symbol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ticker {
    pub symbol: String,
    pub price: f64,
    pub volume: f64,
}

/// One fully evaluated symbol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanRecord {
    pub exchange: Exchange,
    pub symbol: String,
    pub price: f64,
    pub volume: f64,
    pub session: SessionWindow,
    pub range: ExtremumRange,
    pub midline_touch: TouchResult,
    pub fib50_touch: TouchResult,
}

impl ScanRecord {
    pub fn has_signal(&self) -> bool {
        self.midline_touch.touched || self.fib50_touch.touched
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "snake_case")]
pub enum ScanMode {
    /// Only symbols with at least one touched level
    #[default]
    #[serde(alias = "signals")]
    #[value(name = "signals", alias = "signals-only")]
    SignalsOnly,
    /// Every symbol that passed the filters and was fully evaluated
    Full,
}

impl ScanMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScanMode::SignalsOnly => "signals_only",
            ScanMode::Full => "full",
        }
    }
}

/// Outcome of scanning one exchange.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExchangeScanResult {
    pub exchange: Exchange,
    pub success: bool,
    pub error: Option<String>,
    pub duration_secs: f64,
    pub symbols_evaluated: usize,
    pub symbols_skipped: usize,
    pub records: Vec<ScanRecord>,
}

impl ExchangeScanResult {
    pub fn new(exchange: Exchange) -> Self {
        Self {
            exchange,
            success: true,
            error: None,
            duration_secs: 0.0,
            symbols_evaluated: 0,
            symbols_skipped: 0,
            records: Vec::new(),
        }
    }

    pub fn failed(exchange: Exchange, error: String) -> Self {
        Self {
            success: false,
            error: Some(error),
            ..Self::new(exchange)
        }
    }
}

/// Everything one scan produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanReport {
    pub timestamp: DateTime<Utc>,
    pub mode: ScanMode,
    pub exchanges: Vec<ExchangeScanResult>,
}

impl ScanReport {
    /// Group loose records into per-exchange blocks, ordered by exchange.
    pub fn from_records(timestamp: DateTime<Utc>, mode: ScanMode, records: Vec<ScanRecord>) -> Self {
        let mut exchanges: Vec<ExchangeScanResult> = Vec::new();
        for record in records {
            match exchanges.iter_mut().find(|r| r.exchange == record.exchange) {
                Some(block) => {
                    block.symbols_evaluated += 1;
                    block.records.push(record);
                }
                None => {
                    let mut block = ExchangeScanResult::new(record.exchange);
                    block.symbols_evaluated = 1;
                    block.records.push(record);
                    exchanges.push(block);
                }
            }
        }
        exchanges.sort_by_key(|r| r.exchange);
        Self {
            timestamp,
            mode,
            exchanges,
        }
    }

    pub fn records(&self) -> impl Iterator<Item = &ScanRecord> {
        self.exchanges.iter().flat_map(|e| e.records.iter())
    }

    pub fn total_records(&self) -> usize {
        self.exchanges.iter().map(|e| e.records.len()).sum()
    }
}
