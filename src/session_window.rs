//! The 24-hour customer service window.
//!
//! WhatsApp permits free-form business replies only within 24 hours of the
//! customer's last inbound message; outside it, only pre-approved templates
//! may be sent. Nothing here is persisted: the window is recomputed from the
//! conversation's stored `last_incoming_at` on every poll.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

pub const SESSION_WINDOW_HOURS: i64 = 24;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionWindow {
    pub expired: bool,
    pub hours_left: i64,
    pub minutes_left: i64,
    pub percent_elapsed: f64,
}

impl SessionWindow {
    fn expired_window() -> SessionWindow {
        SessionWindow {
            expired: true,
            hours_left: 0,
            minutes_left: 0,
            percent_elapsed: 100.0,
        }
    }
}

pub fn remaining(last_incoming: DateTime<Utc>, now: DateTime<Utc>) -> SessionWindow {
    let window = Duration::hours(SESSION_WINDOW_HOURS);
    let elapsed = now - last_incoming;
    let expired = elapsed > window;

    let (hours_left, minutes_left) = if expired {
        (0, 0)
    } else {
        let left = window - elapsed.max(Duration::zero());
        (left.num_hours(), left.num_minutes() % 60)
    };

    let percent_elapsed = if elapsed <= Duration::zero() {
        0.0
    } else {
        let ratio =
            elapsed.num_milliseconds() as f64 / window.num_milliseconds() as f64 * 100.0;
        ratio.min(100.0)
    };

    SessionWindow {
        expired,
        hours_left,
        minutes_left,
        percent_elapsed,
    }
}

/// Window for a stored RFC 3339 timestamp. A conversation that never saw an
/// inbound message (empty or unparsable timestamp) has no open window.
pub fn window_for_timestamp(raw: &str, now: DateTime<Utc>) -> SessionWindow {
    match DateTime::parse_from_rfc3339(raw) {
        Ok(ts) => remaining(ts.with_timezone(&Utc), now),
        Err(_) => SessionWindow::expired_window(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn fresh_window_is_open_with_full_budget() {
        let w = remaining(at(0), at(0));
        assert!(!w.expired);
        assert_eq!(w.hours_left, 24);
        assert_eq!(w.minutes_left, 0);
        assert_eq!(w.percent_elapsed, 0.0);
    }

    #[test]
    fn open_just_before_the_boundary() {
        let w = remaining(at(0), at(23 * 3600 + 59 * 60));
        assert!(!w.expired);
        assert_eq!(w.hours_left, 0);
        assert_eq!(w.minutes_left, 1);
    }

    #[test]
    fn exactly_24h_is_not_yet_expired() {
        let w = remaining(at(0), at(24 * 3600));
        assert!(!w.expired);
        assert_eq!(w.hours_left, 0);
        assert_eq!(w.minutes_left, 0);
        assert_eq!(w.percent_elapsed, 100.0);
    }

    #[test]
    fn expired_one_second_past_the_boundary() {
        let w = remaining(at(0), at(24 * 3600 + 1));
        assert!(w.expired);
        assert_eq!(w.hours_left, 0);
        assert_eq!(w.minutes_left, 0);
        assert_eq!(w.percent_elapsed, 100.0);
    }

    #[test]
    fn percent_elapsed_is_monotone_and_clamped() {
        let mut previous = -1.0;
        for hours in 0..=30 {
            let w = remaining(at(0), at(hours * 3600));
            assert!(w.percent_elapsed >= previous);
            assert!(w.percent_elapsed <= 100.0);
            previous = w.percent_elapsed;
        }
        assert_eq!(remaining(at(0), at(12 * 3600)).percent_elapsed, 50.0);
    }

    #[test]
    fn future_timestamp_reports_zero_elapsed() {
        let w = remaining(at(60), at(0));
        assert!(!w.expired);
        assert_eq!(w.percent_elapsed, 0.0);
    }

    #[test]
    fn stored_timestamp_roundtrip() {
        let now = at(3600);
        let w = window_for_timestamp(&at(0).to_rfc3339(), now);
        assert!(!w.expired);
        assert_eq!(w.hours_left, 23);
    }

    #[test]
    fn missing_timestamp_means_no_window() {
        let w = window_for_timestamp("", at(0));
        assert!(w.expired);
        assert_eq!(w.percent_elapsed, 100.0);
    }
}
