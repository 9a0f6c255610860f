//! Coinbase Exchange public market data.
//!
//! Candles come back newest first as `[time, low, high, open, close, volume]`
//! with at most 300 rows per request, so ranges are requested in chunks of
//! 300 intervals. There is no bulk ticker endpoint: discovery lists online
//! products and fetches 24h stats for each.

use async_trait::async_trait;
use chrono::{DateTime, Duration, SecondsFormat, TimeZone, Utc};
use futures_util::stream::{self, StreamExt};
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info};

use super::rest::{de_string_f64, value_f64, value_i64, RestClient, RestError, RestSettings};
use super::{clip_candles, CandleSource};
use crate::error::{ScanError, ScanResult};
use crate::models::{Candle, Exchange, Granularity, Ticker};

const COINBASE_API_BASE: &str = "https://api.exchange.coinbase.com";
const CANDLES_PER_REQUEST: i64 = 300;
const DISCOVERY_QUOTES: [&str; 3] = ["USD", "USDT", "USDC"];
const STATS_CONCURRENCY: usize = 4;
/// 2014-12-01; the exchange has no candles before its launch.
const HISTORY_FLOOR_SECS: i64 = 1_417_392_000;

#[derive(Debug, Deserialize)]
struct ProductStats {
    #[serde(deserialize_with = "de_string_f64")]
    last: f64,
    #[serde(deserialize_with = "de_string_f64")]
    volume: f64,
}

#[derive(Debug, Deserialize)]
struct Product {
    id: String,
    quote_currency: String,
    #[serde(default)]
    status: String,
    #[serde(default)]
    trading_disabled: bool,
}

impl Product {
    fn is_scannable(&self) -> bool {
        self.status.eq_ignore_ascii_case("online")
            && !self.trading_disabled
            && DISCOVERY_QUOTES
                .iter()
                .any(|q| self.quote_currency.eq_ignore_ascii_case(q))
    }
}

pub struct CoinbaseClient {
    rest: RestClient,
}

impl CoinbaseClient {
    pub fn new(settings: RestSettings) -> ScanResult<Self> {
        Ok(Self {
            rest: RestClient::new(Exchange::Coinbase.as_str(), COINBASE_API_BASE, settings)?,
        })
    }

    /// Granularity in seconds; Coinbase has no 4h candles.
    fn granularity_secs(granularity: Granularity) -> ScanResult<i64> {
        match granularity {
            Granularity::FourHours => Err(ScanError::Config(
                "coinbase does not support 4h candles".to_string(),
            )),
            g => Ok(g.seconds()),
        }
    }

    fn classify(err: RestError, symbol: &str) -> ScanError {
        match &err {
            RestError::Status { status, .. } if *status == StatusCode::NOT_FOUND => {
                ScanError::SymbolNotFound {
                    exchange: Exchange::Coinbase,
                    symbol: symbol.to_string(),
                }
            }
            _ => err.into(),
        }
    }

    async fn stats(&self, product_id: &str) -> ScanResult<Ticker> {
        let path = format!("/products/{}/stats", product_id);
        let body = self
            .rest
            .get_text(&path, &[])
            .await
            .map_err(|e| Self::classify(e, product_id))?;
        let stats: ProductStats = serde_json::from_str(&body)?;
        Ok(Ticker {
            symbol: product_id.to_string(),
            price: stats.last,
            volume: stats.volume,
        })
    }
}

/// Candle rows: `[time, low, high, open, close, volume]`, time in seconds.
pub(crate) fn parse_candles(rows: &[Vec<Value>]) -> Vec<Candle> {
    rows.iter()
        .filter_map(|row| {
            let secs = value_i64(row.first()?)?;
            Some(Candle {
                open_time: Utc.timestamp_opt(secs, 0).single()?,
                low: value_f64(row.get(1)?)?,
                high: value_f64(row.get(2)?)?,
                open: value_f64(row.get(3)?)?,
                close: value_f64(row.get(4)?)?,
                volume: value_f64(row.get(5)?)?,
            })
        })
        .collect()
}

#[async_trait]
impl CandleSource for CoinbaseClient {
    fn exchange(&self) -> Exchange {
        Exchange::Coinbase
    }

    async fn fetch_candles(
        &self,
        symbol: &str,
        granularity: Granularity,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> ScanResult<Vec<Candle>> {
        let secs = Self::granularity_secs(granularity)?;
        let chunk = Duration::seconds(secs * CANDLES_PER_REQUEST);
        let path = format!("/products/{}/candles", symbol);

        let mut candles = Vec::new();
        let mut cursor = start;
        while cursor < end {
            let chunk_end = (cursor + chunk).min(end);
            let query = [
                ("granularity", secs.to_string()),
                ("start", cursor.to_rfc3339_opts(SecondsFormat::Secs, true)),
                ("end", chunk_end.to_rfc3339_opts(SecondsFormat::Secs, true)),
            ];
            let body = self
                .rest
                .get_text(&path, &query)
                .await
                .map_err(|e| Self::classify(e, symbol))?;
            let rows: Vec<Vec<Value>> = serde_json::from_str(&body)?;
            candles.extend(parse_candles(&rows));
            cursor = chunk_end;
        }

        debug!(symbol, %granularity, count = candles.len(), "Coinbase candles fetched");
        Ok(clip_candles(candles, start, end))
    }

    async fn fetch_ticker(&self, symbol: &str) -> ScanResult<Ticker> {
        self.stats(symbol).await
    }

    async fn fetch_tickers(&self) -> ScanResult<Vec<Ticker>> {
        let body = self.rest.get_text("/products", &[]).await?;
        let products: Vec<Product> = serde_json::from_str(&body)?;
        let ids: Vec<String> = products
            .into_iter()
            .filter(Product::is_scannable)
            .map(|p| p.id)
            .collect();

        let results: Vec<(String, ScanResult<Ticker>)> = stream::iter(ids)
            .map(|id| async move {
                let res = self.stats(&id).await;
                (id, res)
            })
            .buffer_unordered(STATS_CONCURRENCY)
            .collect()
            .await;

        let mut tickers = Vec::with_capacity(results.len());
        for (id, res) in results {
            match res {
                Ok(t) => tickers.push(t),
                Err(e) => debug!(product = %id, error = %e, "Coinbase stats unavailable"),
            }
        }

        info!("Fetched {} tickers from Coinbase", tickers.len());
        Ok(tickers)
    }

    fn history_floor(&self) -> DateTime<Utc> {
        Utc.timestamp_opt(HISTORY_FLOOR_SECS, 0)
            .single()
            .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
    }
}
