//! Usage tracking for forwarded requests
//!
//! Every outcome lands in two places: the append-only request log that the
//! rate-limited selector queries, and the lifetime counters on the upstream
//! row. Recording is fire-and-forget from the forwarding engine; a store
//! hiccup never fails the client response.

use std::sync::Arc;

use tracing::warn;

use crate::error::Result;
use crate::models::RequestOutcome;
use crate::repository::{RequestLogStore, UpstreamStore};

pub struct UsageTracker {
    upstreams: Arc<dyn UpstreamStore>,
    request_log: Arc<dyn RequestLogStore>,
}

impl UsageTracker {
    pub fn new(upstreams: Arc<dyn UpstreamStore>, request_log: Arc<dyn RequestLogStore>) -> Self {
        Self {
            upstreams,
            request_log,
        }
    }

    /// Record one request outcome against an upstream
    pub async fn record(&self, upstream_id: i64, outcome: &RequestOutcome) -> Result<()> {
        self.request_log
            .append(&outcome.to_record(upstream_id))
            .await?;

        self.upstreams
            .record_outcome(
                upstream_id,
                outcome.success,
                outcome.latency_ms,
                outcome.error.as_deref(),
            )
            .await?;

        Ok(())
    }

    /// Record without awaiting the stores; errors are logged and dropped
    pub fn record_detached(self: &Arc<Self>, upstream_id: i64, outcome: RequestOutcome) {
        let tracker = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = tracker.record(upstream_id, &outcome).await {
                warn!(upstream_id, error = %e, "failed to record request outcome");
            }
        });
    }
}
