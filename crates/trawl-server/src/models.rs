//! API request and response models.

use serde::{Deserialize, Serialize};

use trawl_core::query::{parse_time_window, parse_timestamp_ms, QueryError, DEFAULT_LIMIT};
use trawl_core::{StatusRange, TrafficQuery, TrafficSummary};
use trawl_storage::{ClearOutcome, QueryPage};

/// Request body for POST /api/sessions/{id}/proxy/start.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartRequest {
    /// Listening port; picked from the configured range when absent.
    pub port: Option<u16>,
    /// Bind address; the configured listen host when absent.
    pub listen_host: Option<String>,
}

/// Request body for POST /api/sessions/{id}/proxy/stop.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StopRequest {
    /// Keep the capture directory (default: true).
    pub keep_data: Option<bool>,
}

/// Query parameters for GET /api/sessions/{id}/traffic.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrafficParams {
    /// Relative window such as `5m`. Takes precedence over the range.
    pub time_window: Option<String>,
    pub start_time: Option<String>,
    pub end_time: Option<String>,
    pub url_pattern: Option<String>,
    pub method: Option<String>,
    pub status_code: Option<u16>,
    pub status_range: Option<String>,
    pub content_type: Option<String>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
    pub include_body: Option<bool>,
}

impl TrafficParams {
    /// Builds a query, resolving relative times against `now_ms`.
    pub fn into_query(self, now_ms: i64) -> Result<TrafficQuery, QueryError> {
        let mut query = TrafficQuery::new();

        if let Some(window) = self.time_window.as_deref().filter(|w| !w.is_empty()) {
            query = query.with_window(parse_time_window(window)?, now_ms);
        } else {
            let start = self
                .start_time
                .as_deref()
                .map(parse_timestamp_ms)
                .transpose()?;
            let end = self.end_time.as_deref().map(parse_timestamp_ms).transpose()?;
            query = query.with_range(start, end);
        }

        query.url_pattern = self.url_pattern.filter(|p| !p.is_empty());
        query.method = self.method.filter(|m| !m.is_empty());
        query.status_code = self.status_code;
        query.status_range = self
            .status_range
            .as_deref()
            .map(str::parse::<StatusRange>)
            .transpose()?;
        query.content_type = self.content_type.filter(|c| !c.is_empty());
        query.include_body = self.include_body.unwrap_or(false);

        Ok(query.with_page(
            self.limit.unwrap_or(DEFAULT_LIMIT),
            self.offset.unwrap_or(0),
        ))
    }
}

/// Response body for GET /api/sessions/{id}/traffic.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrafficResponse {
    pub session_id: String,
    pub total_matches: usize,
    pub limit: usize,
    pub offset: usize,
    pub entries: Vec<TrafficSummary>,
}

impl TrafficResponse {
    /// Wraps a query page.
    pub fn new(session_id: impl Into<String>, query: &TrafficQuery, page: QueryPage) -> Self {
        Self {
            session_id: session_id.into(),
            total_matches: page.total_matches,
            limit: query.limit,
            offset: query.offset,
            entries: page.entries,
        }
    }
}

/// Query parameters for DELETE /api/sessions/{id}/traffic.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClearParams {
    /// RFC 3339 or epoch-millisecond threshold.
    pub before_time: Option<String>,
    /// Age threshold in seconds.
    pub older_than_seconds: Option<u64>,
}

impl ClearParams {
    /// Resolves the threshold. `None` clears everything.
    ///
    /// `beforeTime` wins when both are given.
    pub fn threshold_ms(&self, now_ms: i64) -> Result<Option<i64>, QueryError> {
        if let Some(before) = self.before_time.as_deref().filter(|b| !b.is_empty()) {
            return parse_timestamp_ms(before).map(Some);
        }
        Ok(self.older_than_seconds.map(|secs| {
            let age_ms = i64::try_from(secs.saturating_mul(1000)).unwrap_or(i64::MAX);
            now_ms.saturating_sub(age_ms)
        }))
    }
}

/// Response body for DELETE /api/sessions/{id}/traffic.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClearResponse {
    pub entries_cleared: usize,
    pub entries_remaining: usize,
}

impl From<ClearOutcome> for ClearResponse {
    fn from(outcome: ClearOutcome) -> Self {
        Self {
            entries_cleared: outcome.removed,
            entries_remaining: outcome.remaining,
        }
    }
}

/// Response body for GET /api/health.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub active_sessions: usize,
}
