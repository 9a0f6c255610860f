//! Friday Asian Session
//!
//! The session is a fixed UTC time-of-day window `[start, end)`. Only the
//! most recent Friday whose session has fully closed is used. Candles belong
//! to the session when `start <= open_time < end`.

use chrono::{DateTime, Datelike, Duration, NaiveDate, TimeZone, Utc, Weekday};

use crate::config::SessionRange;
use crate::error::{ScanError, ScanResult};
use crate::models::{Candle, SessionWindow};

/// UTC start/end instants of the session on `date`.
pub fn session_bounds(date: NaiveDate, range: &SessionRange) -> (DateTime<Utc>, DateTime<Utc>) {
    (
        Utc.from_utc_datetime(&date.and_time(range.start)),
        Utc.from_utc_datetime(&date.and_time(range.end)),
    )
}

/// Latest Friday whose session ended at or before `now`.
///
/// On a Friday before the session has closed this is the previous Friday.
pub fn most_recent_friday(now: DateTime<Utc>, range: &SessionRange) -> NaiveDate {
    let today = now.date_naive();
    let days_back = (today.weekday().num_days_from_monday() + 7
        - Weekday::Fri.num_days_from_monday())
        % 7;
    let friday = today - Duration::days(i64::from(days_back));

    let (_, end) = session_bounds(friday, range);
    if end > now {
        friday - Duration::days(7)
    } else {
        friday
    }
}

/// Session high/low for the most recent closed Friday session at `now`.
pub fn extract_session(
    candles: &[Candle],
    range: &SessionRange,
    now: DateTime<Utc>,
) -> ScanResult<SessionWindow> {
    extract_session_on(candles, most_recent_friday(now, range), range)
}

/// Session high/low on an explicit date. `candles` must be sorted by open time.
pub fn extract_session_on(
    candles: &[Candle],
    date: NaiveDate,
    range: &SessionRange,
) -> ScanResult<SessionWindow> {
    debug_assert!(candles.windows(2).all(|w| w[0].open_time <= w[1].open_time));

    let (start_time, end_time) = session_bounds(date, range);
    let first = candles.partition_point(|c| c.open_time < start_time);
    let last = candles.partition_point(|c| c.open_time < end_time);
    let in_session = &candles[first..last.max(first)];

    if in_session.is_empty() {
        return Err(ScanError::DataUnavailable(format!(
            "no candles in Asian session {} {}..{}",
            date,
            start_time.format("%H:%M"),
            end_time.format("%H:%M")
        )));
    }

    let (high, low) = in_session
        .iter()
        .fold((f64::NEG_INFINITY, f64::INFINITY), |(hi, lo), c| {
            (hi.max(c.high), lo.min(c.low))
        });

    Ok(SessionWindow {
        date,
        start_time,
        end_time,
        high,
        low,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveTime;

    fn range() -> SessionRange {
        SessionRange::parse("00:00", "08:00").unwrap()
    }

    fn at(day: u32, hour: u32, minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, day, hour, minute, 0).unwrap()
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

    // 2024-01-05 is a Friday.
    fn friday() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, 5).unwrap()
    }

    #[test]
    fn test_most_recent_friday_from_weekend() {
        assert_eq!(most_recent_friday(at(6, 12, 0), &range()), friday());
        assert_eq!(most_recent_friday(at(7, 23, 59), &range()), friday());
    }

    #[test]
    fn test_most_recent_friday_mid_week() {
        // Wednesday 2024-01-10
        assert_eq!(most_recent_friday(at(10, 3, 0), &range()), friday());
        // Thursday 2024-01-11
        assert_eq!(most_recent_friday(at(11, 23, 0), &range()), friday());
    }

    #[test]
    fn test_friday_before_session_close_uses_previous_week() {
        let previous = NaiveDate::from_ymd_opt(2023, 12, 29).unwrap();
        assert_eq!(most_recent_friday(at(5, 7, 59), &range()), previous);
        assert_eq!(most_recent_friday(at(5, 8, 0), &range()), friday());
    }

    #[test]
    fn test_session_bounds() {
        let r = SessionRange::new(
            NaiveTime::from_hms_opt(1, 30, 0).unwrap(),
            NaiveTime::from_hms_opt(9, 0, 0).unwrap(),
        )
        .unwrap();
        let (start, end) = session_bounds(friday(), &r);
        assert_eq!(start, at(5, 1, 30));
        assert_eq!(end, at(5, 9, 0));
    }

    #[test]
    fn test_extract_high_low_and_midline() {
        let candles = vec![
            candle(at(4, 23, 0), 50.0, 500.0), // Thursday, ignored
            candle(at(5, 0, 0), 92.0, 97.0),
            candle(at(5, 4, 0), 90.0, 95.0),
            candle(at(5, 7, 0), 93.0, 100.0),
            candle(at(5, 8, 0), 10.0, 1000.0), // session end is exclusive
        ];
        let window = extract_session(&candles, &range(), at(6, 0, 0)).unwrap();
        assert_eq!(window.date, friday());
        assert_eq!(window.high, 100.0);
        assert_eq!(window.low, 90.0);
        assert_eq!(window.midline(), 95.0);
        assert_eq!(window.start_time, at(5, 0, 0));
        assert_eq!(window.end_time, at(5, 8, 0));
    }

    #[test]
    fn test_midline_between_low_and_high() {
        let candles: Vec<Candle> = (0..8)
            .map(|h| {
                let base = 1.0 + f64::from(h) * 0.37;
                candle(at(5, h, 0), base, base * 1.9)
            })
            .collect();
        let window = extract_session_on(&candles, friday(), &range()).unwrap();
        let mid = window.midline();
        assert!(window.low <= mid && mid <= window.high);
    }

    #[test]
    fn test_no_candles_in_window_is_data_unavailable() {
        let candles = vec![candle(at(5, 9, 0), 1.0, 2.0), candle(at(5, 10, 0), 1.0, 2.0)];
        let err = extract_session_on(&candles, friday(), &range()).unwrap_err();
        assert!(matches!(err, ScanError::DataUnavailable(_)));

        let err = extract_session_on(&[], friday(), &range()).unwrap_err();
        assert!(matches!(err, ScanError::DataUnavailable(_)));
    }
}
