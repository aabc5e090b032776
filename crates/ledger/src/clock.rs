//! Time source and calendar helpers
//!
//! Services read "now" through [`Clock`] so batch cutoffs and commission
//! windows can be exercised deterministically.

use std::sync::{Arc, Mutex};

use time::{Date, Duration, Month, OffsetDateTime};

pub trait Clock: Send + Sync {
    fn now(&self) -> OffsetDateTime;
}

/// Wall clock (UTC)
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> OffsetDateTime {
        OffsetDateTime::now_utc()
    }
}

/// Manually advanced clock for tests and replays
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<Mutex<OffsetDateTime>>,
}

impl ManualClock {
    pub fn new(start: OffsetDateTime) -> Self {
        Self {
            now: Arc::new(Mutex::new(start)),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now += by;
    }

    pub fn set(&self, to: OffsetDateTime) {
        *self.now.lock().unwrap_or_else(|e| e.into_inner()) = to;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> OffsetDateTime {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// `YYYY-MM` key of the month containing `at`
pub fn month_key(at: OffsetDateTime) -> String {
    format!("{:04}-{:02}", at.year(), u8::from(at.month()))
}

/// `YYYY-MM` key of the month before the one containing `at`
pub fn previous_month_key(at: OffsetDateTime) -> String {
    let (year, month) = shift_month(at.year(), at.month(), -1);
    format!("{:04}-{:02}", year, u8::from(month))
}

/// `YYYY-MM` key following `key`, or `None` when `key` is malformed
pub fn next_month_key(key: &str) -> Option<String> {
    let (year, month) = parse_month_key(key)?;
    let (year, month) = shift_month(year, month, 1);
    Some(format!("{:04}-{:02}", year, u8::from(month)))
}

pub fn parse_month_key(key: &str) -> Option<(i32, Month)> {
    let (year, month) = key.split_once('-')?;
    if year.len() != 4 || month.len() != 2 {
        return None;
    }
    let year: i32 = year.parse().ok()?;
    let month: u8 = month.parse().ok()?;
    Some((year, Month::try_from(month).ok()?))
}

/// Add calendar months, clamping the day to the end of the target month
pub fn add_months(at: OffsetDateTime, months: u32) -> OffsetDateTime {
    let (year, month) = shift_month(at.year(), at.month(), months as i32);
    let day = at.day().min(time::util::days_in_year_month(year, month));
    match Date::from_calendar_date(year, month, day) {
        Ok(date) => at.replace_date(date),
        // Only reachable past the supported year range
        Err(_) => at + Duration::days(30 * i64::from(months)),
    }
}

fn shift_month(year: i32, month: Month, delta: i32) -> (i32, Month) {
    let zero_based = year * 12 + (u8::from(month) as i32 - 1) + delta;
    let year = zero_based.div_euclid(12);
    let month = (zero_based.rem_euclid(12) + 1) as u8;
    (year, Month::try_from(month).unwrap_or(Month::January))
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn test_month_keys() {
        let at = datetime!(2026-01-15 10:00 UTC);
        assert_eq!(month_key(at), "2026-01");
        assert_eq!(previous_month_key(at), "2025-12");
        assert_eq!(next_month_key("2025-12").as_deref(), Some("2026-01"));
        assert_eq!(next_month_key("2026-13"), None);
        assert_eq!(next_month_key("garbage"), None);
    }

    #[test]
    fn test_add_months_clamps_day() {
        let at = datetime!(2026-08-31 12:00 UTC);
        assert_eq!(add_months(at, 6), datetime!(2027-02-28 12:00 UTC));
        assert_eq!(add_months(at, 1), datetime!(2026-09-30 12:00 UTC));
    }

    #[test]
    fn test_manual_clock_advances() {
        let clock = ManualClock::new(datetime!(2026-03-01 00:00 UTC));
        clock.advance(Duration::days(8));
        assert_eq!(clock.now(), datetime!(2026-03-09 00:00 UTC));
    }
}
