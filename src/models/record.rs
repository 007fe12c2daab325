use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Append-only usage event for one forwarded request
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct RequestRecord {
    pub upstream_id: i64,
    pub timestamp: DateTime<Utc>,
    pub success: bool,
    pub response_time_ms: i32,
    pub status_code: Option<i32>,
}

/// Outcome of a single forwarding attempt, as reported to the usage tracker
#[derive(Debug, Clone)]
pub struct RequestOutcome {
    pub success: bool,
    pub latency_ms: i32,
    pub status_code: Option<i32>,
    pub error: Option<String>,
}

impl RequestOutcome {
    pub fn ok(latency_ms: i32, status_code: Option<i32>) -> Self {
        Self {
            success: true,
            latency_ms,
            status_code,
            error: None,
        }
    }

    pub fn failed(latency_ms: i32, error: impl Into<String>) -> Self {
        Self {
            success: false,
            latency_ms,
            status_code: None,
            error: Some(error.into()),
        }
    }

    /// Record as stored in the request log
    pub fn to_record(&self, upstream_id: i64) -> RequestRecord {
        RequestRecord {
            upstream_id,
            timestamp: Utc::now(),
            success: self.success,
            response_time_ms: self.latency_ms,
            status_code: self.status_code,
        }
    }
}
