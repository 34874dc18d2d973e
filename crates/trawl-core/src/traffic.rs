//! Captured traffic records.
//!
//! The field names mirror what the capture agent writes, one JSON object per
//! line. There is no schema negotiation: a line either deserializes into a
//! [`TrafficRecord`] or is skipped by the reader.

use serde::{Deserialize, Serialize};

/// Length of the trailing window counted by [`TrafficStats::recent_count`].
pub const RECENT_WINDOW_MS: i64 = 60_000;

/// One `name: value` pair. Order is preserved and duplicates are allowed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NameValue {
    pub name: String,
    pub value: String,
}

/// Request half of an exchange.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestData {
    pub method: String,
    pub url: String,
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub http_version: String,
    #[serde(default)]
    pub headers: Vec<NameValue>,
    #[serde(default)]
    pub query_string: Vec<NameValue>,
    #[serde(default)]
    pub body_size: u64,
    #[serde(default)]
    pub body: Option<String>,
}

/// Response half of an exchange. `status` is 0 when no response was seen.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseData {
    pub status: u16,
    #[serde(default)]
    pub status_text: String,
    #[serde(default)]
    pub http_version: String,
    #[serde(default)]
    pub headers: Vec<NameValue>,
    #[serde(default)]
    pub content_type: String,
    #[serde(default)]
    pub body_size: u64,
    #[serde(default)]
    pub body: Option<String>,
}

/// Timing breakdown in milliseconds. Negative values mean "not applicable".
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Timings {
    pub blocked: f64,
    pub dns: f64,
    pub connect: f64,
    pub ssl: f64,
    pub send: f64,
    pub wait: f64,
    pub receive: f64,
}

impl Timings {
    /// Sum of all applicable phases.
    pub fn total(&self) -> f64 {
        [
            self.blocked,
            self.dns,
            self.connect,
            self.ssl,
            self.send,
            self.wait,
            self.receive,
        ]
        .iter()
        .filter(|v| **v > 0.0)
        .sum()
    }
}

/// One captured request/response exchange.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrafficRecord {
    pub id: String,
    #[serde(default)]
    pub timestamp: String,
    pub timestamp_ms: i64,
    pub request: RequestData,
    pub response: ResponseData,
    #[serde(default)]
    pub timings: Timings,
    #[serde(default, rename = "serverIPAddress")]
    pub server_ip_address: String,
}

impl TrafficRecord {
    /// Projects the record into a body-less summary.
    pub fn summary(&self) -> TrafficSummary {
        TrafficSummary {
            id: self.id.clone(),
            timestamp: self.timestamp.clone(),
            timestamp_ms: self.timestamp_ms,
            method: self.request.method.clone(),
            url: self.request.url.clone(),
            host: self.request.host.clone(),
            path: self.request.path.clone(),
            status: self.response.status,
            status_text: self.response.status_text.clone(),
            content_type: self.response.content_type.clone(),
            request_body_size: self.request.body_size,
            response_body_size: self.response.body_size,
            duration_ms: self.timings.total(),
            request_body: None,
            response_body: None,
        }
    }

    /// Projects the record into a summary carrying inline bodies.
    pub fn summary_with_bodies(&self) -> TrafficSummary {
        TrafficSummary {
            request_body: self.request.body.clone(),
            response_body: self.response.body.clone(),
            ..self.summary()
        }
    }
}

/// List view of a record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrafficSummary {
    pub id: String,
    pub timestamp: String,
    pub timestamp_ms: i64,
    pub method: String,
    pub url: String,
    pub host: String,
    pub path: String,
    pub status: u16,
    pub status_text: String,
    pub content_type: String,
    pub request_body_size: u64,
    pub response_body_size: u64,
    pub duration_ms: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_body: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_body: Option<String>,
}

/// Aggregate numbers over a traffic log. Derived, never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrafficStats {
    pub count: usize,
    pub request_bytes: u64,
    pub response_bytes: u64,
    pub recent_count: usize,
}

impl TrafficStats {
    /// Computes stats over `records` relative to `now_ms`.
    pub fn compute<'a, I>(records: I, now_ms: i64) -> Self
    where
        I: IntoIterator<Item = &'a TrafficRecord>,
    {
        let cutoff = now_ms - RECENT_WINDOW_MS;
        records
            .into_iter()
            .fold(Self::default(), |mut stats, record| {
                stats.count += 1;
                stats.request_bytes += record.request.body_size;
                stats.response_bytes += record.response.body_size;
                if record.timestamp_ms >= cutoff {
                    stats.recent_count += 1;
                }
                stats
            })
    }
}
