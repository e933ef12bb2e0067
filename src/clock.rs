//! Injected clock for deterministic time handling.
//!
//! Every evaluation reads the clock exactly once, so an event straddling a
//! period boundary is attributed consistently to one period.

use chrono::{DateTime, Datelike, TimeZone, Utc};

/// Source of "now" for the engine.
pub trait Clock: Send + Sync {
    /// Current Unix timestamp in seconds.
    fn now_ts(&self) -> i64;
}

/// Wall-clock implementation.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ts(&self) -> i64 {
        Utc::now().timestamp()
    }
}

/// Fixed clock for tests and replay.
#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub i64);

impl Clock for FixedClock {
    fn now_ts(&self) -> i64 {
        self.0
    }
}

/// `YYYY-MM` period tag for monthly-scoped counters.
#[must_use]
pub fn monthly_tag(ts: i64) -> String {
    let dt: DateTime<Utc> = Utc
        .timestamp_opt(ts, 0)
        .single()
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH);
    format!("{:04}-{:02}", dt.year(), dt.month())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn monthly_tag_formats_year_and_month() {
        // 2026-08-28T00:00:00Z
        assert_eq!(monthly_tag(1_787_875_200), "2026-08");
        assert_eq!(monthly_tag(0), "1970-01");
    }

    #[test]
    fn fixed_clock_returns_configured_instant() {
        let clock = FixedClock(42);
        assert_eq!(clock.now_ts(), 42);
        assert_eq!(clock.now_ts(), 42);
    }

    #[test]
    fn system_clock_is_positive() {
        assert!(SystemClock.now_ts() > 0);
    }
}
