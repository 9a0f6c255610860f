//! Binance USDT-M Futures public market data.
//!
//! `/fapi/v1/klines` returns at most 1500 rows per call; ranges are paged by
//! advancing one millisecond past the last open time.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info};

use super::rest::{de_string_f64, value_f64, value_i64, RestClient, RestError, RestSettings};
use super::{clip_candles, CandleSource};
use crate::error::{ScanError, ScanResult};
use crate::models::{Candle, Exchange, Granularity, Ticker};

const BINANCE_FAPI_BASE: &str = "https://fapi.binance.com";
const KLINES_PAGE_LIMIT: usize = 1500;
const MAX_PAGES: usize = 100;
const INVALID_SYMBOL_CODE: i64 = -1121;
/// 2019-09-01, just before USDT-M futures went live.
const HISTORY_FLOOR_SECS: i64 = 1_567_296_000;

#[derive(Debug, Deserialize)]
struct Ticker24h {
    symbol: String,
    #[serde(rename = "lastPrice", deserialize_with = "de_string_f64")]
    last_price: f64,
    #[serde(deserialize_with = "de_string_f64")]
    volume: f64,
}

impl From<Ticker24h> for Ticker {
    fn from(t: Ticker24h) -> Self {
        Ticker {
            symbol: t.symbol,
            price: t.last_price,
            volume: t.volume,
        }
    }
}

#[derive(Debug, Deserialize)]
struct BinanceApiError {
    code: i64,
    #[serde(default)]
    msg: String,
}

pub struct BinanceClient {
    rest: RestClient,
}

impl BinanceClient {
    pub fn new(settings: RestSettings) -> ScanResult<Self> {
        Ok(Self {
            rest: RestClient::new(Exchange::Binance.as_str(), BINANCE_FAPI_BASE, settings)?,
        })
    }

    fn interval(granularity: Granularity) -> &'static str {
        // Binance interval names match ours one to one.
        granularity.as_str()
    }

    fn classify(err: RestError, symbol: &str) -> ScanError {
        if let RestError::Status { status, body } = &err {
            if *status == StatusCode::BAD_REQUEST {
                if let Ok(api_err) = serde_json::from_str::<BinanceApiError>(body) {
                    if api_err.code == INVALID_SYMBOL_CODE {
                        debug!(symbol, msg = %api_err.msg, "Binance rejected symbol");
                        return ScanError::SymbolNotFound {
                            exchange: Exchange::Binance,
                            symbol: symbol.to_string(),
                        };
                    }
                }
            }
        }
        err.into()
    }
}

/// Kline rows: `[openTime, "open", "high", "low", "close", "volume", closeTime, ...]`.
pub(crate) fn parse_klines(rows: &[Vec<Value>]) -> Vec<Candle> {
    rows.iter()
        .filter_map(|row| {
            let open_ms = value_i64(row.first()?)?;
            Some(Candle {
                open_time: Utc.timestamp_millis_opt(open_ms).single()?,
                open: value_f64(row.get(1)?)?,
                high: value_f64(row.get(2)?)?,
                low: value_f64(row.get(3)?)?,
                close: value_f64(row.get(4)?)?,
                volume: value_f64(row.get(5)?)?,
            })
        })
        .collect()
}

#[async_trait]
impl CandleSource for BinanceClient {
    fn exchange(&self) -> Exchange {
        Exchange::Binance
    }

    async fn fetch_candles(
        &self,
        symbol: &str,
        granularity: Granularity,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> ScanResult<Vec<Candle>> {
        let end_ms = end.timestamp_millis();
        let mut cursor = start.timestamp_millis();
        let mut candles = Vec::new();

        for _page in 0..MAX_PAGES {
            if cursor >= end_ms {
                break;
            }

            let query = [
                ("symbol", symbol.to_string()),
                ("interval", Self::interval(granularity).to_string()),
                ("startTime", cursor.to_string()),
                ("endTime", end_ms.to_string()),
                ("limit", KLINES_PAGE_LIMIT.to_string()),
            ];
            let body = self
                .rest
                .get_text("/fapi/v1/klines", &query)
                .await
                .map_err(|e| Self::classify(e, symbol))?;
            let rows: Vec<Vec<Value>> = serde_json::from_str(&body)?;

            let Some(last_open) = rows.last().and_then(|r| r.first()).and_then(value_i64) else {
                break;
            };
            candles.extend(parse_klines(&rows));

            if rows.len() < KLINES_PAGE_LIMIT {
                break;
            }
            cursor = last_open + 1;
        }

        debug!(symbol, %granularity, count = candles.len(), "Binance klines fetched");
        Ok(clip_candles(candles, start, end))
    }

    async fn fetch_ticker(&self, symbol: &str) -> ScanResult<Ticker> {
        let body = self
            .rest
            .get_text("/fapi/v1/ticker/24hr", &[("symbol", symbol.to_string())])
            .await
            .map_err(|e| Self::classify(e, symbol))?;
        let ticker: Ticker24h = serde_json::from_str(&body)?;
        Ok(ticker.into())
    }

    async fn fetch_tickers(&self) -> ScanResult<Vec<Ticker>> {
        let body = self.rest.get_text("/fapi/v1/ticker/24hr", &[]).await?;
        let raw: Vec<Value> = serde_json::from_str(&body)?;
        let tickers: Vec<Ticker> = raw
            .into_iter()
            .filter_map(|v| serde_json::from_value::<Ticker24h>(v).ok())
            .map(Ticker::from)
            .collect();

        info!("Fetched {} tickers from Binance", tickers.len());
        Ok(tickers)
    }

    fn history_floor(&self) -> DateTime<Utc> {
        Utc.timestamp_opt(HISTORY_FLOOR_SECS, 0)
            .single()
            .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
    }
}
