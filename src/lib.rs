//! Trade Scanner Library
//!
//! Friday Asian-session midline and all-time fib50 touch scanner over
//! Binance, Coinbase and Kraken public market data.

pub mod config;
pub mod error;
pub mod models;
pub mod output;
pub mod scanner;
pub mod scrapers;
pub mod signals;

pub use config::{Discovery, ScanConfig, SessionRange};
pub use error::{ScanError, ScanResult};
pub use models::{
    Candle, Exchange, ExchangeScanResult, ExtremumRange, Granularity, LevelName, ScanMode,
    ScanRecord, ScanReport, SessionWindow, Ticker, TouchResult,
};
pub use output::{write_records, write_report, OutputFormat};
pub use scanner::Scanner;
pub use scrapers::{
    build_coin_universe, build_source, build_sources, CandleSource, CoinMarket, CoinUniverse,
};
