//! Traffic query filters.
//!
//! Filters are applied in a fixed order: time range, URL substring, method,
//! exact status, status class, content type. Every filter is an AND; a
//! status code outside the requested class simply matches nothing.

use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::traffic::TrafficRecord;

/// Default page size.
pub const DEFAULT_LIMIT: usize = 50;

/// Largest page a caller may request.
pub const MAX_LIMIT: usize = 500;

/// Errors produced while parsing query input.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum QueryError {
    /// Status class is not one of `1xx`..`5xx`.
    #[error("invalid status range: {0} (expected 1xx-5xx)")]
    InvalidStatusRange(String),

    /// Time window is not `<n>s|m|h|d`.
    #[error("invalid time window: {0} (expected e.g. 30s, 5m, 1h, 1d)")]
    InvalidTimeWindow(String),

    /// Timestamp is neither RFC 3339 nor epoch milliseconds.
    #[error("invalid timestamp: {0}")]
    InvalidTimestamp(String),
}

/// Result type for query parsing.
pub type Result<T> = std::result::Result<T, QueryError>;

/// Status class such as `4xx`, covering `[400, 499]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct StatusRange {
    class: u16,
}

impl StatusRange {
    /// Creates the range for a leading digit in `1..=5`.
    pub fn new(class: u16) -> Option<Self> {
        (1..=5).contains(&class).then_some(Self { class })
    }

    /// Lowest status in the class.
    pub fn min(&self) -> u16 {
        self.class * 100
    }

    /// Highest status in the class.
    pub fn max(&self) -> u16 {
        self.class * 100 + 99
    }

    /// Returns true if `status` falls in the class.
    pub fn contains(&self, status: u16) -> bool {
        (self.min()..=self.max()).contains(&status)
    }
}

impl FromStr for StatusRange {
    type Err = QueryError;

    fn from_str(s: &str) -> Result<Self> {
        let lower = s.trim().to_ascii_lowercase();
        let mut chars = lower.chars();
        match (chars.next(), chars.as_str()) {
            (Some(digit), "xx") => digit
                .to_digit(10)
                .and_then(|d| StatusRange::new(d as u16))
                .ok_or_else(|| QueryError::InvalidStatusRange(s.to_string())),
            _ => Err(QueryError::InvalidStatusRange(s.to_string())),
        }
    }
}

impl TryFrom<String> for StatusRange {
    type Error = QueryError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<StatusRange> for String {
    fn from(range: StatusRange) -> Self {
        range.to_string()
    }
}

impl std::fmt::Display for StatusRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}xx", self.class)
    }
}

/// Parses a relative window such as `30s`, `5m`, `1h` or `2d`.
pub fn parse_time_window(s: &str) -> Result<Duration> {
    let trimmed = s.trim();
    let invalid = || QueryError::InvalidTimeWindow(s.to_string());
    let split = trimmed.len().checked_sub(1).ok_or_else(invalid)?;
    if !trimmed.is_char_boundary(split) {
        return Err(invalid());
    }
    let (digits, unit) = trimmed.split_at(split);
    let n: u64 = digits.parse().map_err(|_| invalid())?;
    let secs = match unit {
        "s" => n,
        "m" => n.checked_mul(60).ok_or_else(invalid)?,
        "h" => n.checked_mul(3_600).ok_or_else(invalid)?,
        "d" => n.checked_mul(86_400).ok_or_else(invalid)?,
        _ => return Err(invalid()),
    };
    Ok(Duration::from_secs(secs))
}

/// Parses an RFC 3339 timestamp or an epoch-millisecond integer.
pub fn parse_timestamp_ms(s: &str) -> Result<i64> {
    let trimmed = s.trim();
    if let Ok(ms) = trimmed.parse::<i64>() {
        return Ok(ms);
    }
    DateTime::parse_from_rfc3339(trimmed)
        .map(|dt| dt.with_timezone(&Utc).timestamp_millis())
        .map_err(|_| QueryError::InvalidTimestamp(s.to_string()))
}

/// Current wall-clock time in epoch milliseconds.
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Filter and page selection for a traffic query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrafficQuery {
    pub start_time_ms: Option<i64>,
    pub end_time_ms: Option<i64>,
    pub url_pattern: Option<String>,
    pub method: Option<String>,
    pub status_code: Option<u16>,
    pub status_range: Option<StatusRange>,
    pub content_type: Option<String>,
    pub limit: usize,
    pub offset: usize,
    pub include_body: bool,
}

impl Default for TrafficQuery {
    fn default() -> Self {
        Self {
            start_time_ms: None,
            end_time_ms: None,
            url_pattern: None,
            method: None,
            status_code: None,
            status_range: None,
            content_type: None,
            limit: DEFAULT_LIMIT,
            offset: 0,
            include_body: false,
        }
    }
}

impl TrafficQuery {
    /// Creates an unfiltered query with the default page.
    pub fn new() -> Self {
        Self::default()
    }

    /// Restricts the query to `[now - window, now]`.
    pub fn with_window(mut self, window: Duration, now_ms: i64) -> Self {
        let window_ms = i64::try_from(window.as_millis()).unwrap_or(i64::MAX);
        self.start_time_ms = Some(now_ms.saturating_sub(window_ms));
        self.end_time_ms = Some(now_ms);
        self
    }

    /// Restricts the query to an inclusive time range.
    pub fn with_range(mut self, start_ms: Option<i64>, end_ms: Option<i64>) -> Self {
        self.start_time_ms = start_ms;
        self.end_time_ms = end_ms;
        self
    }

    /// Sets the page, clamping `limit` to [`MAX_LIMIT`].
    pub fn with_page(mut self, limit: usize, offset: usize) -> Self {
        self.limit = limit.min(MAX_LIMIT);
        self.offset = offset;
        self
    }

    /// Lower-cased URL pattern, computed once per query.
    fn url_needle(&self) -> Option<String> {
        self.url_pattern.as_ref().map(|p| p.to_lowercase())
    }

    fn content_type_needle(&self) -> Option<String> {
        self.content_type.as_ref().map(|c| c.to_lowercase())
    }

    /// Returns a matcher closure with the lower-cased needles precomputed.
    pub fn matcher(&self) -> impl Fn(&TrafficRecord) -> bool + '_ {
        let url_needle = self.url_needle();
        let content_type_needle = self.content_type_needle();
        move |record: &TrafficRecord| {
            if let Some(start) = self.start_time_ms {
                if record.timestamp_ms < start {
                    return false;
                }
            }
            if let Some(end) = self.end_time_ms {
                if record.timestamp_ms > end {
                    return false;
                }
            }
            if let Some(ref needle) = url_needle {
                if !record.request.url.to_lowercase().contains(needle.as_str()) {
                    return false;
                }
            }
            if let Some(ref method) = self.method {
                if !record.request.method.eq_ignore_ascii_case(method) {
                    return false;
                }
            }
            if let Some(code) = self.status_code {
                if record.response.status != code {
                    return false;
                }
            }
            if let Some(range) = self.status_range {
                if !range.contains(record.response.status) {
                    return false;
                }
            }
            if let Some(ref needle) = content_type_needle {
                if !record
                    .response
                    .content_type
                    .to_lowercase()
                    .contains(needle.as_str())
                {
                    return false;
                }
            }
            true
        }
    }

    /// Returns true if `record` passes every filter.
    pub fn matches(&self, record: &TrafficRecord) -> bool {
        (self.matcher())(record)
    }
}
