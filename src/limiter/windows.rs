//! Time Window Math
//!
//! Four windows govern admission. The burst window slides relative to
//! "now"; the daily, weekly, and monthly windows are calendar-anchored in
//! local time (midnight, Monday 00:00, 1st-of-month 00:00). Each window
//! carries the reset instant a blocked caller can retry at.

use chrono::{
    DateTime, Datelike, Duration, Local, LocalResult, NaiveDate, NaiveDateTime, NaiveTime,
    TimeZone, Utc,
};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Which limit a window belongs to. Checks run in this order, so the first
/// violated kind is the one reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitKind {
    Burst,
    Daily,
    Weekly,
    Monthly,
}

impl LimitKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Burst => "burst",
            Self::Daily => "daily",
            Self::Weekly => "weekly",
            Self::Monthly => "monthly",
        }
    }

    /// All kinds in check order.
    pub const ALL: [LimitKind; 4] = [Self::Burst, Self::Daily, Self::Weekly, Self::Monthly];
}

impl fmt::Display for LimitKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Inclusive window start and the instant the window next resets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowBounds {
    pub start: DateTime<Utc>,
    pub reset: DateTime<Utc>,
}

/// Sliding burst window: `[now - minutes, now]`, resetting one full window
/// after "now".
pub fn burst_bounds(now: DateTime<Utc>, window_minutes: u32) -> WindowBounds {
    let span = Duration::minutes(i64::from(window_minutes));
    WindowBounds {
        start: now - span,
        reset: now + span,
    }
}

/// Calendar day anchored at local midnight.
pub fn daily_bounds(now: DateTime<Utc>) -> WindowBounds {
    let today = now.with_timezone(&Local).date_naive();
    WindowBounds {
        start: local_midnight(today),
        reset: local_midnight(today.succ_opt().unwrap_or(today)),
    }
}

/// Calendar week anchored at the most recent Monday, local midnight.
pub fn weekly_bounds(now: DateTime<Utc>) -> WindowBounds {
    let today = now.with_timezone(&Local).date_naive();
    let monday = today - Duration::days(i64::from(today.weekday().num_days_from_monday()));
    WindowBounds {
        start: local_midnight(monday),
        reset: local_midnight(monday + Duration::days(7)),
    }
}

/// Calendar month anchored at the 1st, local midnight.
pub fn monthly_bounds(now: DateTime<Utc>) -> WindowBounds {
    let today = now.with_timezone(&Local).date_naive();
    let first = NaiveDate::from_ymd_opt(today.year(), today.month(), 1).unwrap_or(today);
    let next_first = if today.month() == 12 {
        NaiveDate::from_ymd_opt(today.year() + 1, 1, 1)
    } else {
        NaiveDate::from_ymd_opt(today.year(), today.month() + 1, 1)
    }
    .unwrap_or(first);
    WindowBounds {
        start: local_midnight(first),
        reset: local_midnight(next_first),
    }
}

/// Bounds for any kind at the given instant.
pub fn bounds_for(kind: LimitKind, now: DateTime<Utc>, burst_window_minutes: u32) -> WindowBounds {
    match kind {
        LimitKind::Burst => burst_bounds(now, burst_window_minutes),
        LimitKind::Daily => daily_bounds(now),
        LimitKind::Weekly => weekly_bounds(now),
        LimitKind::Monthly => monthly_bounds(now),
    }
}

fn local_midnight(date: NaiveDate) -> DateTime<Utc> {
    resolve_local(date.and_time(NaiveTime::MIN))
}

/// Map a naive local time to UTC. DST makes some local times ambiguous
/// (take the earlier) or nonexistent (slide forward an hour).
fn resolve_local(naive: NaiveDateTime) -> DateTime<Utc> {
    match Local.from_local_datetime(&naive) {
        LocalResult::Single(dt) | LocalResult::Ambiguous(dt, _) => dt.with_timezone(&Utc),
        LocalResult::None => match Local.from_local_datetime(&(naive + Duration::hours(1))) {
            LocalResult::Single(dt) | LocalResult::Ambiguous(dt, _) => dt.with_timezone(&Utc),
            LocalResult::None => Utc.from_utc_datetime(&naive),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Build an instant from local wall-clock fields so assertions hold in
    /// any host timezone. Mid-January dates keep clear of DST transitions.
    fn local_dt(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
        Local
            .with_ymd_and_hms(y, mo, d, h, mi, s)
            .single()
            .unwrap()
            .with_timezone(&Utc)
    }

    #[test]
    fn test_burst_window_slides() {
        let now = local_dt(2025, 1, 15, 12, 30, 0);
        let b = burst_bounds(now, 10);
        assert_eq!(b.start, now - Duration::minutes(10));
        assert_eq!(b.reset, now + Duration::minutes(10));
    }

    #[test]
    fn test_daily_anchored_at_midnight() {
        let now = local_dt(2025, 1, 15, 23, 59, 0);
        let b = daily_bounds(now);
        assert_eq!(b.start, local_dt(2025, 1, 15, 0, 0, 0));
        assert_eq!(b.reset, local_dt(2025, 1, 16, 0, 0, 0));
    }

    #[test]
    fn test_daily_just_after_midnight() {
        let now = local_dt(2025, 1, 16, 0, 0, 1);
        let b = daily_bounds(now);
        assert_eq!(b.start, local_dt(2025, 1, 16, 0, 0, 0));
        assert_eq!(b.reset, local_dt(2025, 1, 17, 0, 0, 0));
    }

    #[test]
    fn test_weekly_anchored_at_monday() {
        // 2025-01-15 is a Wednesday; the week began Monday the 13th.
        let now = local_dt(2025, 1, 15, 12, 0, 0);
        let b = weekly_bounds(now);
        assert_eq!(b.start, local_dt(2025, 1, 13, 0, 0, 0));
        assert_eq!(b.reset, local_dt(2025, 1, 20, 0, 0, 0));
    }

    #[test]
    fn test_weekly_on_monday_starts_today() {
        let now = local_dt(2025, 1, 13, 0, 0, 1);
        let b = weekly_bounds(now);
        assert_eq!(b.start, local_dt(2025, 1, 13, 0, 0, 0));
        assert_eq!(b.reset, local_dt(2025, 1, 20, 0, 0, 0));
    }

    #[test]
    fn test_monthly_anchored_at_first() {
        let now = local_dt(2025, 1, 15, 12, 0, 0);
        let b = monthly_bounds(now);
        assert_eq!(b.start, local_dt(2025, 1, 1, 0, 0, 0));
        assert_eq!(b.reset, local_dt(2025, 2, 1, 0, 0, 0));
    }

    #[test]
    fn test_monthly_december_wraps_year() {
        let now = local_dt(2024, 12, 31, 23, 0, 0);
        let b = monthly_bounds(now);
        assert_eq!(b.start, local_dt(2024, 12, 1, 0, 0, 0));
        assert_eq!(b.reset, local_dt(2025, 1, 1, 0, 0, 0));
    }

    #[test]
    fn test_limit_kind_strings() {
        assert_eq!(LimitKind::Burst.to_string(), "burst");
        assert_eq!(LimitKind::Monthly.as_str(), "monthly");
        assert_eq!(LimitKind::ALL.len(), 4);
    }
}
