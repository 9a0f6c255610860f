//! Touch Evaluator
//!
//! A candle touches a level when `low <= level <= high`. Both bounds are
//! inclusive: round-number levels often sit exactly on a wick.

use chrono::{DateTime, Utc};

use crate::models::{Candle, LevelName, TouchResult};

#[inline]
pub fn touches(candle: &Candle, level: f64) -> bool {
    candle.low <= level && level <= candle.high
}

/// Candles opening at or after `end_time`, i.e. lying entirely after a window
/// that closes at `end_time`. `candles` must be sorted by open time.
pub fn candles_after(candles: &[Candle], end_time: DateTime<Utc>) -> &[Candle] {
    let idx = candles.partition_point(|c| c.open_time < end_time);
    &candles[idx..]
}

/// First candle (chronologically) whose range contains `level_price`.
pub fn evaluate_touch(level_name: LevelName, level_price: f64, candles: &[Candle]) -> TouchResult {
    let touch_time = candles
        .iter()
        .find(|c| touches(c, level_price))
        .map(|c| c.open_time);

    TouchResult {
        level_name,
        level_price,
        touched: touch_time.is_some(),
        touch_time,
    }
}
