//! Kraken public market data.
//!
//! Kraken answers HTTP 200 with an `error` array on failures, and keeps only
//! the most recent 720 OHLC rows per interval; older history is not reachable.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::{debug, info};

use super::rest::{value_f64, value_i64, RestClient, RestSettings};
use super::{clip_candles, CandleSource};
use crate::error::{ScanError, ScanResult};
use crate::models::{Candle, Exchange, Granularity, Ticker};

const KRAKEN_API_BASE: &str = "https://api.kraken.com";
const OHLC_PAGE_LIMIT: usize = 720;
const MAX_PAGES: usize = 20;
/// 2013-09-01. Older requests are answered with the newest 720 rows anyway.
const HISTORY_FLOOR_SECS: i64 = 1_377_993_600;

#[derive(Debug, Deserialize)]
struct KrakenEnvelope<T> {
    #[serde(default)]
    error: Vec<String>,
    result: Option<T>,
}

/// Ticker entry: `c` = [last price, lot volume], `v` = [today, last 24h].
#[derive(Debug, Deserialize)]
struct KrakenTicker {
    c: Vec<Value>,
    v: Vec<Value>,
}

impl KrakenTicker {
    fn into_ticker(self, pair: String) -> Option<Ticker> {
        Some(Ticker {
            symbol: pair,
            price: value_f64(self.c.first()?)?,
            volume: value_f64(self.v.get(1)?)?,
        })
    }
}

pub struct KrakenClient {
    rest: RestClient,
}

impl KrakenClient {
    pub fn new(settings: RestSettings) -> ScanResult<Self> {
        Ok(Self {
            rest: RestClient::new(Exchange::Kraken.as_str(), KRAKEN_API_BASE, settings)?,
        })
    }

    /// OHLC interval in minutes.
    fn interval_minutes(granularity: Granularity) -> i64 {
        granularity.seconds() / 60
    }

    async fn public<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
        symbol: Option<&str>,
    ) -> ScanResult<T> {
        let body = self.rest.get_text(path, query).await?;
        let envelope: KrakenEnvelope<T> = serde_json::from_str(&body)?;
        unwrap_envelope(envelope, symbol)
    }
}

fn unwrap_envelope<T>(envelope: KrakenEnvelope<T>, symbol: Option<&str>) -> ScanResult<T> {
    if let Some(first) = envelope.error.first() {
        if first.contains("Unknown asset pair") {
            return Err(ScanError::SymbolNotFound {
                exchange: Exchange::Kraken,
                symbol: symbol.unwrap_or_default().to_string(),
            });
        }
        return Err(ScanError::Network(format!(
            "kraken error: {}",
            envelope.error.join(", ")
        )));
    }
    envelope
        .result
        .ok_or_else(|| ScanError::Network("kraken response without result".to_string()))
}

/// OHLC result: `{ "<PAIR>": [[time, open, high, low, close, vwap, volume, count], ...], "last": n }`.
pub(crate) fn parse_ohlc(result: &Map<String, Value>) -> Vec<Candle> {
    let Some(rows) = result
        .iter()
        .find(|(key, value)| key.as_str() != "last" && value.is_array())
        .and_then(|(_, value)| value.as_array())
    else {
        return Vec::new();
    };

    rows.iter()
        .filter_map(|row| {
            let row = row.as_array()?;
            let secs = value_i64(row.first()?)?;
            Some(Candle {
                open_time: Utc.timestamp_opt(secs, 0).single()?,
                open: value_f64(row.get(1)?)?,
                high: value_f64(row.get(2)?)?,
                low: value_f64(row.get(3)?)?,
                close: value_f64(row.get(4)?)?,
                volume: value_f64(row.get(6)?)?,
            })
        })
        .collect()
}

#[async_trait]
impl CandleSource for KrakenClient {
    fn exchange(&self) -> Exchange {
        Exchange::Kraken
    }

    async fn fetch_candles(
        &self,
        symbol: &str,
        granularity: Granularity,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> ScanResult<Vec<Candle>> {
        let interval = Self::interval_minutes(granularity);
        let end_secs = end.timestamp();
        // `since` is exclusive; step back one interval so `start` itself is included.
        let mut since = (start.timestamp() - granularity.seconds()).max(0);
        let mut candles: Vec<Candle> = Vec::new();

        for _page in 0..MAX_PAGES {
            let query = [
                ("pair", symbol.to_string()),
                ("interval", interval.to_string()),
                ("since", since.to_string()),
            ];
            let result: Map<String, Value> =
                self.public("/0/public/OHLC", &query, Some(symbol)).await?;
            let page = parse_ohlc(&result);
            let page_len = page.len();

            let Some(last_open) = page.last().map(|c| c.open_time.timestamp()) else {
                break;
            };
            candles.extend(page);

            if page_len < OHLC_PAGE_LIMIT || last_open >= end_secs || last_open <= since {
                break;
            }
            since = last_open;
        }

        debug!(symbol, %granularity, count = candles.len(), "Kraken OHLC fetched");
        Ok(clip_candles(candles, start, end))
    }

    async fn fetch_ticker(&self, symbol: &str) -> ScanResult<Ticker> {
        let result: Map<String, Value> = self
            .public("/0/public/Ticker", &[("pair", symbol.to_string())], Some(symbol))
            .await?;

        // Kraken may answer under its canonical pair name (XBTUSD -> XXBTZUSD).
        let entry = result
            .into_iter()
            .next()
            .ok_or_else(|| ScanError::SymbolNotFound {
                exchange: Exchange::Kraken,
                symbol: symbol.to_string(),
            })?;
        let raw: KrakenTicker = serde_json::from_value(entry.1)?;
        raw.into_ticker(symbol.to_string())
            .ok_or_else(|| ScanError::Network(format!("kraken ticker for {} is malformed", symbol)))
    }

    async fn fetch_tickers(&self) -> ScanResult<Vec<Ticker>> {
        let result: Map<String, Value> = self.public("/0/public/Ticker", &[], None).await?;
        let tickers: Vec<Ticker> = result
            .into_iter()
            .filter_map(|(pair, value)| {
                serde_json::from_value::<KrakenTicker>(value)
                    .ok()?
                    .into_ticker(pair)
            })
            .collect();

        info!("Fetched {} tickers from Kraken", tickers.len());
        Ok(tickers)
    }

    fn history_floor(&self) -> DateTime<Utc> {
        Utc.timestamp_opt(HISTORY_FLOOR_SECS, 0)
            .single()
            .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_ohlc_skips_last_key() {
        let result: Map<String, Value> = serde_json::from_value(json!({
            "XXBTZUSD": [
                [1704412800, "95.0", "100.0", "90.0", "97.0", "96.1", "12.5", 42],
                [1704413700, "97.0", "98.0", "96.5", "97.5", "97.2", "3.0", 7]
            ],
            "last": 1704413700
        }))
        .unwrap();

        let candles = parse_ohlc(&result);
        assert_eq!(candles.len(), 2);
        assert_eq!(candles[0].high, 100.0);
        assert_eq!(candles[0].low, 90.0);
        assert_eq!(candles[0].volume, 12.5);
    }

    #[test]
    fn test_unknown_pair_is_symbol_not_found() {
        let envelope: KrakenEnvelope<Map<String, Value>> = serde_json::from_value(json!({
            "error": ["EQuery:Unknown asset pair"]
        }))
        .unwrap();
        assert!(matches!(
            unwrap_envelope(envelope, Some("FOOUSD")),
            Err(ScanError::SymbolNotFound { .. })
        ));
    }

    #[test]
    fn test_other_errors_are_network() {
        let envelope: KrakenEnvelope<Map<String, Value>> = serde_json::from_value(json!({
            "error": ["EService:Unavailable"]
        }))
        .unwrap();
        assert!(unwrap_envelope(envelope, None).unwrap_err().is_network());
    }

    #[test]
    fn test_ticker_fields() {
        let raw: KrakenTicker = serde_json::from_value(json!({
            "a": ["43001.0", "1", "1.000"],
            "c": ["43000.5", "0.01"],
            "v": ["120.5", "980.25"]
        }))
        .unwrap();
        let ticker = raw.into_ticker("XXBTZUSD".to_string()).unwrap();
        assert_eq!(ticker.price, 43000.5);
        assert_eq!(ticker.volume, 980.25);
    }

    #[test]
    fn test_interval_minutes() {
        assert_eq!(KrakenClient::interval_minutes(Granularity::FifteenMinutes), 15);
        assert_eq!(KrakenClient::interval_minutes(Granularity::OneDay), 1440);
    }
}
