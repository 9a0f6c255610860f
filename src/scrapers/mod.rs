//! Candle sources: one public-REST client per exchange behind a shared trait,
//! plus the CoinGecko market-cap universe.

pub mod binance;
pub mod coinbase;
pub mod coingecko;
pub mod kraken;
pub mod rest;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::config::{Discovery, ScanConfig};
use crate::error::ScanResult;
use crate::models::{normalize_candles, Candle, Exchange, Granularity, Ticker};

pub use binance::BinanceClient;
pub use coinbase::CoinbaseClient;
pub use coingecko::{map_coin_to_symbols, CoinGeckoClient};
pub use kraken::KrakenClient;
pub use rest::{RateLimiter, RestClient, RestError, RestSettings};

/// Market data capability shared by every exchange client.
#[async_trait]
pub trait CandleSource: Send + Sync {
    fn exchange(&self) -> Exchange;

    /// Candles with `start <= open_time < end`, sorted ascending, de-duplicated.
    /// Fails with `ScanError::Network` or `ScanError::SymbolNotFound`.
    async fn fetch_candles(
        &self,
        symbol: &str,
        granularity: Granularity,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> ScanResult<Vec<Candle>>;

    /// Last price and 24h volume for one symbol.
    async fn fetch_ticker(&self, symbol: &str) -> ScanResult<Ticker>;

    /// Every ticker the exchange lists; used when no symbols are configured.
    async fn fetch_tickers(&self) -> ScanResult<Vec<Ticker>>;

    /// Earliest instant worth requesting when the full history is wanted.
    fn history_floor(&self) -> DateTime<Utc> {
        DateTime::<Utc>::UNIX_EPOCH
    }
}

/// One row of a market-cap ranking.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoinMarket {
    pub id: String,
    /// Lower-case ticker, e.g. `btc`.
    pub symbol: String,
    #[serde(default)]
    pub name: String,
    pub current_price: Option<f64>,
    pub market_cap: Option<f64>,
    pub market_cap_rank: Option<u32>,
}

/// Coin ranking used for market-cap discovery and the long-history fallback.
#[async_trait]
pub trait CoinUniverse: Send + Sync {
    /// Up to `limit` coins, largest market cap first.
    async fn top_coins(&self, limit: usize) -> ScanResult<Vec<CoinMarket>>;

    /// Daily USD candles for `coin_id` in `[start, end)`.
    async fn daily_history(
        &self,
        coin_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> ScanResult<Vec<Candle>>;
}

/// Normalize a raw fetch and keep `[start, end)`.
pub(crate) fn clip_candles(
    candles: Vec<Candle>,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> Vec<Candle> {
    let mut candles = normalize_candles(candles);
    candles.retain(|c| c.open_time >= start && c.open_time < end);
    candles
}

pub fn build_source(exchange: Exchange, settings: RestSettings) -> ScanResult<Arc<dyn CandleSource>> {
    let source: Arc<dyn CandleSource> = match exchange {
        Exchange::Binance => Arc::new(BinanceClient::new(settings)?),
        Exchange::Coinbase => Arc::new(CoinbaseClient::new(settings)?),
        Exchange::Kraken => Arc::new(KrakenClient::new(settings)?),
    };
    Ok(source)
}

/// CoinGecko client when the config asks for market-cap discovery or its history.
pub fn build_coin_universe(config: &ScanConfig) -> ScanResult<Option<Arc<dyn CoinUniverse>>> {
    if config.discovery != Discovery::MarketCap && !config.coingecko_history {
        return Ok(None);
    }
    let client = CoinGeckoClient::new(RestSettings::from_config(config))?;
    Ok(Some(Arc::new(client)))
}

/// One live client per enabled exchange.
pub fn build_sources(config: &ScanConfig) -> ScanResult<Vec<Arc<dyn CandleSource>>> {
    let settings = RestSettings::from_config(config);
    config
        .enabled_exchanges
        .iter()
        .map(|&exchange| build_source(exchange, settings))
        .collect()
}
