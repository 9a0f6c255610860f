//! CoinGecko public API: market-cap ranking and long daily price history.
//!
//! CoinGecko is not a trading venue. It ranks coins for discovery, and its
//! `market_chart/range` series can extend an exchange's daily history back
//! past what the exchange still serves.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, DurationRound, TimeZone, Utc};
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, info};

use super::rest::{value_f64, value_i64, RestClient, RestSettings};
use super::{CoinMarket, CoinUniverse};
use crate::error::ScanResult;
use crate::models::{normalize_candles, Candle};

const COINGECKO_API_BASE: &str = "https://api.coingecko.com/api/v3";
const VS_CURRENCY: &str = "usd";
const MARKETS_PER_PAGE: usize = 250;
/// Free tier allows roughly 30 calls per minute.
const MIN_REQUEST_INTERVAL: Duration = Duration::from_millis(2_000);
const QUOTES: [&str; 3] = ["USDT", "USDC", "USD"];

#[derive(Debug, Deserialize)]
struct MarketChart {
    #[serde(default)]
    prices: Vec<Vec<Value>>,
}

pub struct CoinGeckoClient {
    rest: RestClient,
}

impl CoinGeckoClient {
    pub fn new(settings: RestSettings) -> ScanResult<Self> {
        Self::with_base_url(COINGECKO_API_BASE, settings)
    }

    pub fn with_base_url(base_url: &str, settings: RestSettings) -> ScanResult<Self> {
        let settings = RestSettings {
            min_request_interval: settings.min_request_interval.max(MIN_REQUEST_INTERVAL),
            ..settings
        };
        Ok(Self {
            rest: RestClient::new("coingecko", base_url, settings)?,
        })
    }

    /// One page of `/coins/markets`, ordered by market cap descending.
    pub async fn coins_markets(&self, page: usize, per_page: usize) -> ScanResult<Vec<CoinMarket>> {
        let query = [
            ("vs_currency", VS_CURRENCY.to_string()),
            ("order", "market_cap_desc".to_string()),
            ("per_page", per_page.to_string()),
            ("page", page.to_string()),
            ("sparkline", "false".to_string()),
        ];
        let body = self.rest.get_text("/coins/markets", &query).await?;
        let markets: Vec<CoinMarket> = serde_json::from_str(&body)?;
        Ok(markets)
    }

    /// Raw `[ms, price]` points between `from` and `to`, aggregated into UTC daily candles.
    pub async fn market_chart_range(
        &self,
        coin_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> ScanResult<Vec<Candle>> {
        let path = format!("/coins/{}/market_chart/range", coin_id);
        let query = [
            ("vs_currency", VS_CURRENCY.to_string()),
            ("from", from.timestamp().to_string()),
            ("to", to.timestamp().to_string()),
        ];
        let body = self.rest.get_text(&path, &query).await?;
        let chart: MarketChart = serde_json::from_str(&body)?;
        let candles = daily_candles(&chart.prices);

        debug!(coin_id, points = chart.prices.len(), days = candles.len(), "CoinGecko chart fetched");
        Ok(candles)
    }
}

#[async_trait]
impl CoinUniverse for CoinGeckoClient {
    async fn top_coins(&self, limit: usize) -> ScanResult<Vec<CoinMarket>> {
        let mut coins = Vec::with_capacity(limit);
        let mut page = 1;
        while coins.len() < limit {
            let batch = self.coins_markets(page, MARKETS_PER_PAGE).await?;
            let exhausted = batch.len() < MARKETS_PER_PAGE;
            coins.extend(batch);
            if exhausted {
                break;
            }
            page += 1;
        }
        coins.truncate(limit);

        info!("Fetched {} coins by market cap from CoinGecko", coins.len());
        Ok(coins)
    }

    async fn daily_history(
        &self,
        coin_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> ScanResult<Vec<Candle>> {
        self.market_chart_range(coin_id, start, end).await
    }
}

/// Fold price points into one candle per UTC day. Volume is not per-candle
/// on CoinGecko and is left at zero.
pub(crate) fn daily_candles(points: &[Vec<Value>]) -> Vec<Candle> {
    let mut candles: Vec<Candle> = Vec::new();
    let mut parsed: Vec<(DateTime<Utc>, f64)> = points
        .iter()
        .filter_map(|p| {
            let ms = value_i64(p.first()?)?;
            let price = value_f64(p.get(1)?)?;
            Some((Utc.timestamp_millis_opt(ms).single()?, price))
        })
        .collect();
    parsed.sort_by_key(|(t, _)| *t);

    for (time, price) in parsed {
        let Ok(day) = time.duration_trunc(ChronoDuration::days(1)) else {
            continue;
        };
        match candles.last_mut() {
            Some(c) if c.open_time == day => {
                c.high = c.high.max(price);
                c.low = c.low.min(price);
                c.close = price;
            }
            _ => candles.push(Candle {
                open_time: day,
                open: price,
                high: price,
                low: price,
                close: price,
                volume: 0.0,
            }),
        }
    }
    normalize_candles(candles)
}

/// Exchange symbols quoting `coin` in a USD stable, best quote first, de-duplicated.
///
/// Accepts `BTCUSDT`, `BTC-USD`, `BTC/USD` and Kraken's `XXBTZUSD` / `XBTUSD`
/// spellings; `ETHFIUSDT` does not match `ETH`.
pub fn map_coin_to_symbols(coin: &str, symbols: &[String]) -> Vec<String> {
    let coin = coin.to_uppercase();
    let mut bases = vec![coin.clone(), format!("X{}", coin)];
    if coin == "BTC" {
        bases.extend(["XBT".to_string(), "XXBT".to_string()]);
    }

    let mut matches: Vec<(usize, &String)> = symbols
        .iter()
        .filter_map(|symbol| {
            let compact: String = symbol
                .to_uppercase()
                .chars()
                .filter(|c| *c != '-' && *c != '/')
                .collect();
            bases.iter().find_map(|base| {
                let rest = compact.strip_prefix(base.as_str())?;
                let quote = rest.strip_prefix('Z').filter(|q| q.starts_with("USD")).unwrap_or(rest);
                QUOTES.iter().position(|q| *q == quote).map(|rank| (rank, symbol))
            })
        })
        .collect();
    matches.sort_by_key(|(rank, _)| *rank);

    let mut out: Vec<String> = Vec::new();
    for (_, symbol) in matches {
        if !out.contains(symbol) {
            out.push(symbol.clone());
        }
    }
    out
}
