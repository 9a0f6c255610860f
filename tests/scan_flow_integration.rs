//! End-to-end scan flow against in-memory candle sources.

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use trade_scanner::{
    write_report, Candle, CandleSource, Exchange, Granularity, OutputFormat, ScanConfig,
    ScanError, ScanMode, ScanReport, ScanResult, Scanner, Ticker,
};

// =============================================================================
// FAKE SOURCE
// =============================================================================

struct ScriptedSource {
    exchange: Exchange,
    tickers: Vec<Ticker>,
    intraday: HashMap<String, Vec<Candle>>,
    daily: HashMap<String, Vec<Candle>>,
    failing: HashSet<String>,
    offline: bool,
    delay: Option<std::time::Duration>,
}

impl ScriptedSource {
    fn new(exchange: Exchange) -> Self {
        Self {
            exchange,
            tickers: Vec::new(),
            intraday: HashMap::new(),
            daily: HashMap::new(),
            failing: HashSet::new(),
            offline: false,
            delay: None,
        }
    }

    fn symbol(mut self, symbol: &str, volume: f64, intraday: Vec<Candle>, daily: Vec<Candle>) -> Self {
        let price = intraday.last().map(|c| c.close).unwrap_or(1.0);
        self.tickers.push(Ticker {
            symbol: symbol.to_string(),
            price,
            volume,
        });
        self.intraday.insert(symbol.to_string(), intraday);
        self.daily.insert(symbol.to_string(), daily);
        self
    }

    fn failing(mut self, symbol: &str) -> Self {
        self.tickers.push(Ticker {
            symbol: symbol.to_string(),
            price: 10.0,
            volume: 1_000_000.0,
        });
        self.failing.insert(symbol.to_string());
        self
    }

    fn offline(mut self) -> Self {
        self.offline = true;
        self
    }

    fn slow(mut self, delay: std::time::Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    fn check_online(&self) -> ScanResult<()> {
        if self.offline {
            return Err(ScanError::Network(format!("{} unreachable", self.exchange)));
        }
        Ok(())
    }
}

#[async_trait]
impl CandleSource for ScriptedSource {
    fn exchange(&self) -> Exchange {
        self.exchange
    }

    async fn fetch_candles(
        &self,
        symbol: &str,
        granularity: Granularity,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> ScanResult<Vec<Candle>> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.check_online()?;
        if self.failing.contains(symbol) {
            return Err(ScanError::Network("connection reset by peer".to_string()));
        }

        let table = if granularity == Granularity::OneDay {
            &self.daily
        } else {
            &self.intraday
        };
        let candles = table.get(symbol).ok_or_else(|| ScanError::SymbolNotFound {
            exchange: self.exchange,
            symbol: symbol.to_string(),
        })?;
        Ok(candles
            .iter()
            .filter(|c| c.open_time >= start && c.open_time < end)
            .copied()
            .collect())
    }

    async fn fetch_ticker(&self, symbol: &str) -> ScanResult<Ticker> {
        self.check_online()?;
        self.tickers
            .iter()
            .find(|t| t.symbol == symbol)
            .cloned()
            .ok_or_else(|| ScanError::SymbolNotFound {
                exchange: self.exchange,
                symbol: symbol.to_string(),
            })
    }

    async fn fetch_tickers(&self) -> ScanResult<Vec<Ticker>> {
        self.check_online()?;
        Ok(self.tickers.clone())
    }
}

// =============================================================================
// MARKET FIXTURES
// =============================================================================

/// Saturday after the Friday 2024-01-05 session.
fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 6, 12, 0, 0).unwrap()
}

fn friday(hour: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 5, hour, 0, 0).unwrap()
}

fn candle(open_time: DateTime<Utc>, low: f64, high: f64) -> Candle {
    Candle {
        open_time,
        open: low,
        high,
        low,
        close: high,
        volume: 10.0,
    }
}

/// Hourly session candles (00:00-07:00) reaching exactly `high` and `low`,
/// followed by hourly candles from 08:00 with the given ranges.
fn intraday(high: f64, low: f64, after: &[(f64, f64)]) -> Vec<Candle> {
    let mid = (high + low) / 2.0;
    let mut out: Vec<Candle> = (0..8)
        .map(|h| match h {
            2 => candle(friday(h), mid, high),
            5 => candle(friday(h), low, mid),
            _ => candle(friday(h), mid - 0.1, mid + 0.1),
        })
        .collect();
    for (i, &(lo, hi)) in after.iter().enumerate() {
        out.push(candle(friday(8) + Duration::hours(i as i64), lo, hi));
    }
    out
}

/// Daily history reaching exactly `low` and `high`.
fn daily(low: f64, high: f64) -> Vec<Candle> {
    let first = Utc.with_ymd_and_hms(2023, 12, 15, 0, 0, 0).unwrap();
    let mid = (high + low) / 2.0;
    (0..20)
        .map(|d| {
            let t = first + Duration::days(d);
            match d {
                3 => candle(t, low, mid),
                11 => candle(t, mid, high),
                _ => candle(t, mid - 1.0, mid + 1.0),
            }
        })
        .collect()
}

fn config(exchanges: &[Exchange], mode: ScanMode) -> ScanConfig {
    ScanConfig {
        enabled_exchanges: exchanges.iter().copied().collect(),
        mode,
        intraday_granularity: Granularity::OneHour,
        history_days: Some(30),
        ..ScanConfig::default()
    }
}

/// Kraken market used by most tests:
/// - MID: midline 95 touched by the second post-session candle
/// - FIB: fib50 150 touched by the second post-session candle
/// - THIN: touches both levels but trades below the volume filter
/// - FLAT: touches nothing
/// - DOWN: every candle request fails
fn kraken_market() -> ScriptedSource {
    ScriptedSource::new(Exchange::Kraken)
        .symbol("MID", 5_000.0, intraday(100.0, 90.0, &[(97.0, 99.0), (94.0, 96.0)]), daily(100.0, 200.0))
        .symbol("FIB", 8_000.0, intraday(170.0, 160.0, &[(158.0, 162.0), (149.0, 152.0)]), daily(100.0, 200.0))
        .symbol("THIN", 10.0, intraday(100.0, 90.0, &[(94.0, 96.0)]), daily(80.0, 110.0))
        .symbol("FLAT", 3_000.0, intraday(100.0, 90.0, &[(101.0, 103.0)]), daily(100.0, 200.0))
        .failing("DOWN")
}

fn symbols(report: &ScanReport) -> Vec<&str> {
    let mut out: Vec<&str> = report.records().map(|r| r.symbol.as_str()).collect();
    out.sort();
    out
}

// =============================================================================
// SCENARIOS
// =============================================================================

#[tokio::test]
async fn test_midline_touch_after_session() {
    let scanner = Scanner::new(
        config(&[Exchange::Kraken], ScanMode::SignalsOnly),
        vec![Arc::new(kraken_market())],
    )
    .unwrap();
    let report = scanner.run_at(now()).await.unwrap();

    let record = report.records().find(|r| r.symbol == "MID").unwrap();
    assert_eq!(record.session.high, 100.0);
    assert_eq!(record.session.low, 90.0);
    assert_eq!(record.session.midline(), 95.0);
    assert!(record.midline_touch.touched);
    assert_eq!(record.midline_touch.touch_time, Some(friday(9)));
    assert_eq!(record.range.fib50, 150.0);
    assert!(!record.fib50_touch.touched);
}

#[tokio::test]
async fn test_fib50_touch_after_session() {
    let scanner = Scanner::new(
        config(&[Exchange::Kraken], ScanMode::SignalsOnly),
        vec![Arc::new(kraken_market())],
    )
    .unwrap();
    let report = scanner.run_at(now()).await.unwrap();

    let record = report.records().find(|r| r.symbol == "FIB").unwrap();
    assert_eq!(record.range.all_time_high, 200.0);
    assert_eq!(record.range.all_time_low, 100.0);
    assert_eq!(record.range.fib50, 150.0);
    assert!(record.fib50_touch.touched);
    assert_eq!(record.fib50_touch.touch_time, Some(friday(9)));
    assert!(!record.midline_touch.touched);
}

#[tokio::test]
async fn test_low_volume_symbol_excluded_even_when_touched() {
    // Discovery drops THIN before any candle is fetched...
    let discovered = Scanner::new(
        config(&[Exchange::Kraken], ScanMode::SignalsOnly),
        vec![Arc::new(kraken_market())],
    )
    .unwrap()
    .run_at(now())
    .await
    .unwrap();
    assert!(!symbols(&discovered).contains(&"THIN"));

    // ...and so does the per-symbol filter when it is requested explicitly.
    let mut cfg = config(&[Exchange::Kraken], ScanMode::Full);
    cfg.symbols
        .insert(Exchange::Kraken, vec!["THIN".to_string(), "MID".to_string()]);
    let explicit = Scanner::new(cfg, vec![Arc::new(kraken_market())])
        .unwrap()
        .run_at(now())
        .await
        .unwrap();
    assert_eq!(symbols(&explicit), vec!["MID"]);
    assert_eq!(explicit.exchanges[0].symbols_skipped, 1);
}

#[tokio::test]
async fn test_failed_symbol_omitted_and_rest_written() {
    let scanner = Scanner::new(
        config(&[Exchange::Kraken], ScanMode::SignalsOnly),
        vec![Arc::new(kraken_market())],
    )
    .unwrap();
    let report = scanner.run_at(now()).await.unwrap();
    assert_eq!(symbols(&report), vec!["FIB", "MID"]);

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("out/results.json");
    write_report(&report, &path, OutputFormat::Json).unwrap();

    let doc: Value = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
    let kraken = &doc["results"][0];
    assert_eq!(kraken["exchange"], "kraken");
    assert_eq!(kraken["success"], true);
    let written: Vec<&str> = kraken["records"]
        .as_array()
        .unwrap()
        .iter()
        .map(|r| r["symbol"].as_str().unwrap())
        .collect();
    assert_eq!(written, vec!["FIB", "MID"]);
}

// =============================================================================
// MODES, FAILURES, TIMEOUTS
// =============================================================================

#[tokio::test]
async fn test_full_mode_keeps_untouched_symbols() {
    let scanner = Scanner::new(
        config(&[Exchange::Kraken], ScanMode::Full),
        vec![Arc::new(kraken_market())],
    )
    .unwrap();
    let report = scanner.run_at(now()).await.unwrap();

    assert_eq!(symbols(&report), vec!["FIB", "FLAT", "MID"]);
    let flat = report.records().find(|r| r.symbol == "FLAT").unwrap();
    assert!(!flat.midline_touch.touched);
    assert!(!flat.fib50_touch.touched);
    assert_eq!(flat.midline_touch.touch_time, None);
}

#[tokio::test]
async fn test_insufficient_history_omits_symbol() {
    let source = ScriptedSource::new(Exchange::Binance)
        .symbol("NEWUSDT", 50_000.0, intraday(10.0, 9.0, &[(9.0, 10.0)]), daily(9.0, 10.0)[..1].to_vec())
        .symbol("OLDUSDT", 50_000.0, intraday(10.0, 9.0, &[(9.0, 10.0)]), daily(9.0, 10.0));
    let scanner = Scanner::new(
        config(&[Exchange::Binance], ScanMode::Full),
        vec![Arc::new(source)],
    )
    .unwrap();
    let report = scanner.run_at(now()).await.unwrap();

    assert_eq!(symbols(&report), vec!["OLDUSDT"]);
    assert_eq!(report.exchanges[0].symbols_evaluated, 1);
    assert_eq!(report.exchanges[0].symbols_skipped, 1);
}

#[tokio::test]
async fn test_unreachable_exchange_does_not_abort_scan() {
    let scanner = Scanner::new(
        config(&[Exchange::Binance, Exchange::Kraken], ScanMode::SignalsOnly),
        vec![
            Arc::new(ScriptedSource::new(Exchange::Binance).offline()),
            Arc::new(kraken_market()),
        ],
    )
    .unwrap();
    let report = scanner.run_at(now()).await.unwrap();

    assert_eq!(report.exchanges.len(), 2);
    let binance = &report.exchanges[0];
    assert_eq!(binance.exchange, Exchange::Binance);
    assert!(!binance.success);
    assert!(binance.error.as_deref().unwrap().contains("unreachable"));
    assert!(report.exchanges[1].success);
    assert_eq!(symbols(&report), vec!["FIB", "MID"]);
}

#[tokio::test]
async fn test_all_exchanges_unreachable_is_fatal() {
    let mut cfg = config(&[Exchange::Coinbase, Exchange::Kraken], ScanMode::SignalsOnly);
    // Explicit symbols skip discovery; every fetch then fails at the transport level.
    cfg.symbols.insert(Exchange::Kraken, vec!["MID".to_string()]);

    let scanner = Scanner::new(
        cfg,
        vec![
            Arc::new(ScriptedSource::new(Exchange::Coinbase).offline()),
            Arc::new(kraken_market().offline()),
        ],
    )
    .unwrap();

    match scanner.run_at(now()).await {
        Err(ScanError::AllExchangesFailed(errors)) => assert_eq!(errors.len(), 2),
        other => panic!("expected AllExchangesFailed, got {:?}", other.map(|r| r.total_records())),
    }
}

#[tokio::test]
async fn test_scan_timeout_drops_unfinished_symbols() {
    let mut cfg = config(&[Exchange::Coinbase, Exchange::Kraken], ScanMode::SignalsOnly);
    cfg.scan_timeout_secs = 1;
    cfg.symbols
        .insert(Exchange::Coinbase, vec!["SLOW-USD".to_string()]);

    let slow = ScriptedSource::new(Exchange::Coinbase)
        .symbol("SLOW-USD", 9_000.0, intraday(100.0, 90.0, &[(94.0, 96.0)]), daily(100.0, 200.0))
        .slow(std::time::Duration::from_secs(10));

    let scanner = Scanner::new(cfg, vec![Arc::new(slow), Arc::new(kraken_market())]).unwrap();
    let started = std::time::Instant::now();
    let report = scanner.run_at(now()).await.unwrap();

    assert!(started.elapsed() < std::time::Duration::from_secs(5));
    assert_eq!(symbols(&report), vec!["FIB", "MID"]);
    let coinbase = &report.exchanges[0];
    assert_eq!(coinbase.exchange, Exchange::Coinbase);
    assert!(coinbase.records.is_empty());
    assert_eq!(coinbase.symbols_skipped, 1);
}

#[tokio::test]
async fn test_exchange_durations_are_tracked_separately() {
    let mut cfg = config(&[Exchange::Coinbase, Exchange::Kraken], ScanMode::SignalsOnly);
    cfg.symbols
        .insert(Exchange::Coinbase, vec!["SLOW-USD".to_string()]);

    let slow = ScriptedSource::new(Exchange::Coinbase)
        .symbol("SLOW-USD", 9_000.0, intraday(100.0, 90.0, &[(94.0, 96.0)]), daily(100.0, 200.0))
        .slow(std::time::Duration::from_millis(600));

    let scanner = Scanner::new(cfg, vec![Arc::new(slow), Arc::new(kraken_market())]).unwrap();
    let report = scanner.run_at(now()).await.unwrap();

    let coinbase = &report.exchanges[0];
    let kraken = &report.exchanges[1];
    assert_eq!(coinbase.records.len(), 1);
    assert!(coinbase.duration_secs >= 0.5, "coinbase took {}s", coinbase.duration_secs);
    assert!(kraken.duration_secs < 0.3, "kraken took {}s", kraken.duration_secs);
}

#[tokio::test]
async fn test_empty_scan_still_writes_csv() {
    let source = ScriptedSource::new(Exchange::Kraken).symbol(
        "FLAT",
        3_000.0,
        intraday(100.0, 90.0, &[(101.0, 103.0)]),
        daily(100.0, 200.0),
    );
    let scanner = Scanner::new(
        config(&[Exchange::Kraken], ScanMode::SignalsOnly),
        vec![Arc::new(source)],
    )
    .unwrap();
    let report = scanner.run_at(now()).await.unwrap();
    assert_eq!(report.total_records(), 0);

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("results.csv");
    write_report(&report, &path, OutputFormat::Csv).unwrap();
    let csv = std::fs::read_to_string(&path).unwrap();
    assert_eq!(csv.lines().count(), 1);
}
