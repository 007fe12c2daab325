//! Persistence contracts and their Postgres implementations
//!
//! The rotation core and the usage tracker consume these traits; selectors
//! stay testable without a database.

mod request_log;
mod settings;
mod upstream;

pub use request_log::RequestLogRepository;
pub use settings::SettingsRepository;
pub use upstream::UpstreamRepository;

use std::collections::HashMap;

use async_trait::async_trait;

use crate::error::Result;
use crate::models::{RequestRecord, Settings, Upstream, UpstreamStatus};

/// Upstream inventory and per-upstream counters
#[async_trait]
pub trait UpstreamStore: Send + Sync {
    /// All upstreams eligible for rotation, ordered by address for
    /// deterministic candidate sets. Failed upstreams are included only when
    /// `include_failed` is set.
    async fn list_selectable(&self, include_failed: bool) -> Result<Vec<Upstream>>;

    /// Atomically apply one request outcome to the lifetime counters
    async fn record_outcome(
        &self,
        id: i64,
        success: bool,
        latency_ms: i32,
        error: Option<&str>,
    ) -> Result<()>;

    /// Set upstream status; used by the external health subsystem
    async fn set_status(&self, id: i64, status: UpstreamStatus, last_error: Option<&str>)
        -> Result<()>;
}

/// Append-only time series of request outcomes
#[async_trait]
pub trait RequestLogStore: Send + Sync {
    async fn append(&self, record: &RequestRecord) -> Result<()>;

    /// Count events per upstream over the trailing window, restricted to the
    /// given ids. Upstreams without qualifying events are absent from the map.
    async fn count_by_upstream(
        &self,
        ids: &[i64],
        window_secs: i64,
        success_only: bool,
    ) -> Result<HashMap<i64, i64>>;
}

/// Versioned runtime settings record
#[async_trait]
pub trait SettingsStore: Send + Sync {
    async fn load(&self) -> Result<Settings>;
    async fn save(&self, settings: &Settings) -> Result<()>;
}
