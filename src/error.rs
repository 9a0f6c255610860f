//! Scan error taxonomy.
//!
//! Per-symbol errors (`DataUnavailable`, `InsufficientHistory`, `Network`,
//! `SymbolNotFound`) are absorbed by the scanner and turn into "symbol
//! omitted". Only `Config` and `AllExchangesFailed` reach the binary.

use crate::models::Exchange;

#[derive(Debug, Clone, PartialEq)]
pub enum ScanError {
    /// No candles fell inside a required window.
    DataUnavailable(String),
    /// Too little daily history to compute the all-time range.
    InsufficientHistory { candles: usize },
    /// Transport failure, non-success status, or an unparseable payload.
    Network(String),
    /// The exchange does not know the symbol (delisted or invalid).
    SymbolNotFound { exchange: Exchange, symbol: String },
    /// Invalid configuration or an unsupported request shape.
    Config(String),
    /// Not a single enabled exchange could be reached.
    AllExchangesFailed(Vec<String>),
}

impl ScanError {
    /// Whether this error means the exchange itself could not be reached.
    pub fn is_network(&self) -> bool {
        matches!(self, Self::Network(_))
    }

    /// Short machine-readable tag, used as a structured log field.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::DataUnavailable(_) => "data_unavailable",
            Self::InsufficientHistory { .. } => "insufficient_history",
            Self::Network(_) => "network",
            Self::SymbolNotFound { .. } => "symbol_not_found",
            Self::Config(_) => "config",
            Self::AllExchangesFailed(_) => "all_exchanges_failed",
        }
    }
}

impl std::fmt::Display for ScanError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DataUnavailable(what) => write!(f, "Data unavailable: {}", what),
            Self::InsufficientHistory { candles } => write!(
                f,
                "Insufficient history: {} daily candle(s), need at least 2",
                candles
            ),
            Self::Network(e) => write!(f, "Network error: {}", e),
            Self::SymbolNotFound { exchange, symbol } => {
                write!(f, "Symbol not found on {}: {}", exchange, symbol)
            }
            Self::Config(e) => write!(f, "Configuration error: {}", e),
            Self::AllExchangesFailed(errors) => {
                write!(f, "No exchange could be reached: {}", errors.join("; "))
            }
        }
    }
}

impl std::error::Error for ScanError {}

impl From<reqwest::Error> for ScanError {
    fn from(e: reqwest::Error) -> Self {
        Self::Network(e.to_string())
    }
}

impl From<serde_json::Error> for ScanError {
    fn from(e: serde_json::Error) -> Self {
        Self::Network(format!("malformed response: {}", e))
    }
}

pub type ScanResult<T> = std::result::Result<T, ScanError>;
