//! All-time range and the 50% retracement level.

use crate::error::{ScanError, ScanResult};
use crate::models::{Candle, ExtremumRange};

const MIN_DAILY_CANDLES: usize = 2;

/// Midpoint of a range. Direction independent.
#[inline]
pub fn fib50(low: f64, high: f64) -> f64 {
    low + (high - low) * 0.5
}

impl ExtremumRange {
    /// Highest high and lowest low over the whole daily history.
    pub fn from_daily(candles: &[Candle]) -> ScanResult<Self> {
        if candles.len() < MIN_DAILY_CANDLES {
            return Err(ScanError::InsufficientHistory {
                candles: candles.len(),
            });
        }

        let (all_time_high, all_time_low) = candles
            .iter()
            .fold((f64::NEG_INFINITY, f64::INFINITY), |(hi, lo), c| {
                (hi.max(c.high), lo.min(c.low))
            });

        Ok(Self {
            all_time_high,
            all_time_low,
            fib50: fib50(all_time_low, all_time_high),
        })
    }
}
