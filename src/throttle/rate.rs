//! Quota parsing: `"<count>/<unit>"` strings such as `"60/m"`.

use std::fmt;
use std::time::Duration;

use crate::error::{Result, SlidegateError};

/// Length of a throttle window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimeWindow {
    /// Per-second throttling
    Second,
    /// Per-minute throttling
    Minute,
    /// Per-hour throttling
    Hour,
    /// Per-day throttling
    Day,
}

impl TimeWindow {
    /// Get the duration of this time window.
    pub fn duration(&self) -> Duration {
        Duration::from_secs(self.seconds())
    }

    /// Number of seconds in this window.
    pub fn seconds(&self) -> u64 {
        match self {
            TimeWindow::Second => 1,
            TimeWindow::Minute => 60,
            TimeWindow::Hour => 3600,
            TimeWindow::Day => 86400,
        }
    }

    /// Map a unit token to a window. Only the first character counts, so
    /// `"m"`, `"min"` and `"minute"` all mean one minute.
    pub fn from_unit(unit: &str) -> Option<Self> {
        match unit.chars().next()? {
            's' => Some(TimeWindow::Second),
            'm' => Some(TimeWindow::Minute),
            'h' => Some(TimeWindow::Hour),
            'd' => Some(TimeWindow::Day),
            _ => None,
        }
    }

    fn unit_char(&self) -> char {
        match self {
            TimeWindow::Second => 's',
            TimeWindow::Minute => 'm',
            TimeWindow::Hour => 'h',
            TimeWindow::Day => 'd',
        }
    }
}

/// A parsed quota: at most `count` requests per `window`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateSpec {
    count: u64,
    window: TimeWindow,
}

impl RateSpec {
    /// Create a quota directly. `count` must be at least one.
    pub fn new(count: u64, window: TimeWindow) -> Result<Self> {
        if count == 0 {
            return Err(SlidegateError::malformed(
                &format!("{}/{}", count, window.unit_char()),
                "request count must be at least 1",
            ));
        }
        Ok(Self { count, window })
    }

    /// Parse an optional rate string.
    ///
    /// `None` is the "unthrottled" signal and parses to `Ok(None)`; it is not
    /// an error.
    pub fn parse(rate: Option<&str>) -> Result<Option<Self>> {
        rate.map(Self::parse_str).transpose()
    }

    /// Parse a `"<count>/<unit>"` string.
    pub fn parse_str(rate: &str) -> Result<Self> {
        let (num, period) = rate
            .split_once('/')
            .ok_or_else(|| SlidegateError::malformed(rate, "expected <count>/<unit>"))?;
        if period.contains('/') {
            return Err(SlidegateError::malformed(rate, "expected exactly one '/'"));
        }

        let count: u64 = num
            .trim()
            .parse()
            .map_err(|e| SlidegateError::malformed(rate, format!("invalid count: {}", e)))?;

        let window = TimeWindow::from_unit(period.trim()).ok_or_else(|| {
            SlidegateError::malformed(rate, "unit must start with one of s, m, h, d")
        })?;

        if count == 0 {
            return Err(SlidegateError::malformed(rate, "request count must be at least 1"));
        }
        Ok(Self { count, window })
    }

    /// Maximum number of requests admitted per window.
    pub fn count(&self) -> u64 {
        self.count
    }

    /// The window unit.
    pub fn window(&self) -> TimeWindow {
        self.window
    }

    /// Window length in seconds, as used for timestamp arithmetic.
    pub fn window_secs(&self) -> f64 {
        self.window.seconds() as f64
    }
}

impl fmt::Display for RateSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.count, self.window.unit_char())
    }
}
