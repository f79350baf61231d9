//! Same-day clock windows for withdrawals and returns.

use chrono::{NaiveTime, Timelike};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Format used for clock times in policy documents.
pub const CLOCK_FORMAT: &str = "%H:%M";

/// An inclusive `[start, end]` interval within a single day.
///
/// Windows never cross midnight: `start <= end` is checked on construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindow {
    start: NaiveTime,
    end: NaiveTime,
}

impl TimeWindow {
    /// Build a window, or `None` if it would start after it ends.
    pub fn new(start: NaiveTime, end: NaiveTime) -> Option<Self> {
        (start <= end).then_some(Self { start, end })
    }

    /// Caller guarantees `start <= end`.
    pub(crate) const fn from_ordered(start: NaiveTime, end: NaiveTime) -> Self {
        Self { start, end }
    }

    pub fn start(&self) -> NaiveTime {
        self.start
    }

    pub fn end(&self) -> NaiveTime {
        self.end
    }

    /// Whether a local clock time falls inside the window.
    pub fn contains(&self, time: NaiveTime) -> bool {
        self.start <= time && time <= self.end
    }
}

impl fmt::Display for TimeWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}-{}",
            self.start.format(CLOCK_FORMAT),
            self.end.format(CLOCK_FORMAT)
        )
    }
}

/// Parse an `HH:MM` clock string.
pub fn parse_clock(value: &str) -> Option<NaiveTime> {
    let (hours, minutes) = value.trim().split_once(':')?;
    if hours.is_empty() || hours.len() > 2 || minutes.len() != 2 {
        return None;
    }
    NaiveTime::from_hms_opt(digits(hours)?, digits(minutes)?, 0)
}

/// Unsigned decimal of ASCII digits only, without a sign.
pub(crate) fn digits(value: &str) -> Option<u32> {
    if value.is_empty() || !value.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    value.parse().ok()
}

/// Render a clock time back to `HH:MM`.
pub fn format_clock(time: NaiveTime) -> String {
    format!("{:02}:{:02}", time.hour(), time.minute())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(h: u32, m: u32, s: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, s).unwrap()
    }

    #[test]
    fn test_parse_clock() {
        assert_eq!(parse_clock("07:00"), Some(t(7, 0, 0)));
        assert_eq!(parse_clock(" 22:30 "), Some(t(22, 30, 0)));
        assert_eq!(parse_clock("7:05"), Some(t(7, 5, 0)));
        assert_eq!(parse_clock("24:00"), None);
        assert_eq!(parse_clock("12:60"), None);
        assert_eq!(parse_clock("1200"), None);
        assert_eq!(parse_clock("12:00:00"), None);
        assert_eq!(parse_clock(""), None);
        assert_eq!(parse_clock("07:+5"), None);
        assert_eq!(parse_clock("+7:05"), None);
        assert_eq!(parse_clock("-1:00"), None);
    }

    #[test]
    fn test_window_bounds_are_inclusive() {
        let window = TimeWindow::new(t(7, 0, 0), t(22, 0, 0)).unwrap();

        assert!(window.contains(t(7, 0, 0)));
        assert!(window.contains(t(22, 0, 0)));
        assert!(!window.contains(t(6, 59, 59)));
        assert!(!window.contains(t(22, 0, 1)));
        assert!(!window.contains(t(23, 0, 0)));
    }

    #[test]
    fn test_inverted_window_rejected() {
        assert!(TimeWindow::new(t(22, 0, 0), t(7, 0, 0)).is_none());
        assert!(TimeWindow::new(t(8, 0, 0), t(8, 0, 0)).is_some());
    }

    #[test]
    fn test_display() {
        let window = TimeWindow::new(t(7, 0, 0), t(22, 0, 0)).unwrap();
        assert_eq!(window.to_string(), "07:00-22:00");
        assert_eq!(format_clock(t(7, 5, 0)), "07:05");
    }
}
