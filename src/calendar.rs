//! Exchange calendar helpers.
//!
//! Session dates are `YYYY-MM-DD` in US/Eastern; timestamps are UTC. The
//! Eastern offset follows the post-2007 US daylight-saving rule (second Sunday
//! of March to first Sunday of November, switching at 02:00 local). Windows
//! are counted in trading days, which here means weekdays.

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveDateTime, Timelike, Utc, Weekday};

use crate::error::ValidationError;
use crate::types::DateRange;

/// Minutes from midnight ET to the cash open.
pub const SESSION_OPEN_MINUTE_ET: i64 = 9 * 60 + 30;

/// Parses a `YYYY-MM-DD` date, tolerating a trailing time component.
pub fn parse_date(value: &str) -> Result<NaiveDate, ValidationError> {
    let trimmed = value.trim();
    let head = trimmed.get(..10).unwrap_or(trimmed);
    NaiveDate::parse_from_str(head, "%Y-%m-%d")
        .map_err(|_| ValidationError::MalformedDate(value.to_string()))
}

pub fn parse_range(from: &str, to: &str) -> Result<DateRange, ValidationError> {
    DateRange::new(parse_date(from)?, parse_date(to)?)
}

fn nth_sunday(year: i32, month: u32, n: u32) -> Option<NaiveDate> {
    let first = NaiveDate::from_ymd_opt(year, month, 1)?;
    let offset = (7 - first.weekday().num_days_from_sunday()) % 7;
    first.checked_add_signed(Duration::days((offset + 7 * (n - 1)) as i64))
}

/// Whether US Eastern daylight time is in effect at `instant`.
pub fn is_us_eastern_dst(instant: DateTime<Utc>) -> bool {
    let year = instant.year();
    let (Some(start), Some(end)) = (nth_sunday(year, 3, 2), nth_sunday(year, 11, 1)) else {
        return false;
    };
    // 02:00 EST = 07:00 UTC, 02:00 EDT = 06:00 UTC
    let dst_start = start.and_hms_opt(7, 0, 0).map(|t| t.and_utc());
    let dst_end = end.and_hms_opt(6, 0, 0).map(|t| t.and_utc());
    match (dst_start, dst_end) {
        (Some(s), Some(e)) => instant >= s && instant < e,
        _ => false,
    }
}

pub fn to_eastern(instant: DateTime<Utc>) -> NaiveDateTime {
    let offset_hours = if is_us_eastern_dst(instant) { -4 } else { -5 };
    instant.naive_utc() + Duration::hours(offset_hours)
}

/// Session date (ET) an instant belongs to.
pub fn eastern_date(instant: DateTime<Utc>) -> NaiveDate {
    to_eastern(instant).date()
}

/// Minutes elapsed since the 09:30 ET open, floored at zero.
pub fn session_minute(instant: DateTime<Utc>) -> i64 {
    let et = to_eastern(instant);
    let minute_of_day = (et.hour() * 60 + et.minute()) as i64;
    (minute_of_day - SESSION_OPEN_MINUTE_ET).max(0)
}

pub fn is_trading_day(date: NaiveDate) -> bool {
    !matches!(date.weekday(), Weekday::Sat | Weekday::Sun)
}

/// Latest trading day on or before `date`.
pub fn roll_back_to_trading_day(date: NaiveDate) -> NaiveDate {
    let mut current = date;
    while !is_trading_day(current) {
        current = current.pred_opt().unwrap_or(current);
    }
    current
}

/// Moves `days` trading days forward (positive) or backward (negative).
pub fn shift_trading_days(date: NaiveDate, days: i64) -> NaiveDate {
    let step = if days >= 0 { 1 } else { -1 };
    let mut remaining = days.abs();
    let mut current = date;
    while remaining > 0 {
        current = current + Duration::days(step);
        if is_trading_day(current) {
            remaining -= 1;
        }
    }
    current
}

/// First date of a window of `days` trading days ending at `to`.
pub fn window_start(to: NaiveDate, days: u32) -> NaiveDate {
    let end = roll_back_to_trading_day(to);
    shift_trading_days(end, -((days.max(1) as i64) - 1))
}

/// Trading day immediately before `date`.
pub fn previous_trading_day(date: NaiveDate) -> NaiveDate {
    shift_trading_days(date, -1)
}

/// Default optimizer range: `history_days` trading days ending yesterday (ET).
pub fn default_scan_range(now: DateTime<Utc>, history_days: u32) -> DateRange {
    let to = roll_back_to_trading_day(eastern_date(now) - Duration::days(1));
    let from = window_start(to, history_days);
    DateRange { from, to }
}
