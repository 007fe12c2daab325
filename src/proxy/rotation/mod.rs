//! Upstream rotation strategies
//!
//! Selectors pull their candidate set from the upstream store, applying the
//! rotation filters on every refresh, and hand out one upstream per call.

mod least_used;
mod random;
mod rate_limited;
mod round_robin;
mod swap;
mod time_slot;

pub use least_used::LeastUsedSelector;
pub use random::RandomSelector;
pub use rate_limited::RateLimitedSelector;
pub use round_robin::RoundRobinSelector;
pub use swap::SwappableSelector;
pub use time_slot::TimeSlotSelector;

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::error::{GyreError, Result};
use crate::models::{RotationSettings, Upstream};
use crate::repository::{RequestLogStore, UpstreamStore};

/// Rotation strategy identifiers, with the aliases accepted in settings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RotationMethod {
    #[default]
    Random,
    RoundRobin,
    LeastUsed,
    TimeSlot,
    RateLimited,
}

impl RotationMethod {
    /// Parse a settings value; unknown methods fall back to random
    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "round-robin" | "roundrobin" | "round_robin" => Self::RoundRobin,
            "least-conn" | "least_conn" | "least_connections" => Self::LeastUsed,
            "time-based" | "time_based" => Self::TimeSlot,
            "rate-limited" | "rate_limited" => Self::RateLimited,
            _ => Self::Random,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Random => "random",
            Self::RoundRobin => "round-robin",
            Self::LeastUsed => "least-conn",
            Self::TimeSlot => "time-based",
            Self::RateLimited => "rate-limited",
        }
    }
}

impl std::fmt::Display for RotationMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Contract implemented by every rotation strategy
#[async_trait]
pub trait UpstreamSelector: Send + Sync {
    /// Select one upstream from the current candidate set
    ///
    /// Fails with `NoUpstreams` when the set is empty and `AllRateLimited`
    /// when every candidate is at its window limit. Safe under concurrent
    /// callers.
    async fn select(&self) -> Result<Arc<Upstream>>;

    /// Reload the candidate set from the upstream store, applying the
    /// rotation filters. Cursors and caches are reset as needed; a selector
    /// that previously reported `NoUpstreams` becomes usable again once a
    /// refresh yields candidates.
    async fn refresh(&self) -> Result<()>;

    /// Size of the current candidate set
    fn candidate_count(&self) -> usize;

    /// Strategy identifier, for logs and the health endpoint
    fn method(&self) -> RotationMethod;
}

/// Load and filter the candidate set for a selector
///
/// Status filtering happens in the store query (failed upstreams are only
/// listed when `remove_unhealthy` is off); the remaining filters are applied
/// here.
pub(crate) async fn load_candidates(
    store: &dyn UpstreamStore,
    settings: &RotationSettings,
) -> Result<Vec<Arc<Upstream>>> {
    let include_failed = !settings.remove_unhealthy;
    let upstreams = store
        .list_selectable(include_failed)
        .await
        .map_err(|e| GyreError::SelectorLoad(e.to_string()))?;

    Ok(upstreams
        .into_iter()
        .filter(|u| u.passes_filters(settings))
        .map(Arc::new)
        .collect())
}

/// Shared state for selectors without per-call bookkeeping beyond a cursor
pub(crate) struct SelectorCore {
    store: Arc<dyn UpstreamStore>,
    settings: RotationSettings,
    candidates: RwLock<Vec<Arc<Upstream>>>,
}

impl SelectorCore {
    pub(crate) fn new(store: Arc<dyn UpstreamStore>, settings: RotationSettings) -> Self {
        Self {
            store,
            settings,
            candidates: RwLock::new(Vec::new()),
        }
    }

    pub(crate) async fn reload(&self) -> Result<usize> {
        let candidates = load_candidates(self.store.as_ref(), &self.settings).await?;
        let len = candidates.len();
        *self.candidates.write() = candidates;
        Ok(len)
    }

    pub(crate) fn snapshot(&self) -> Vec<Arc<Upstream>> {
        self.candidates.read().clone()
    }

    pub(crate) fn len(&self) -> usize {
        self.candidates.read().len()
    }
}

/// Build a selector for the configured rotation method
///
/// Per-method parameters fall back to their documented defaults when the
/// stored settings carry zero or negative values.
pub fn build_selector(
    store: Arc<dyn UpstreamStore>,
    request_log: Arc<dyn RequestLogStore>,
    settings: &RotationSettings,
) -> Arc<dyn UpstreamSelector> {
    let method = RotationMethod::parse(&settings.method);
    match method {
        RotationMethod::Random => Arc::new(RandomSelector::new(store, settings.clone())),
        RotationMethod::RoundRobin => Arc::new(RoundRobinSelector::new(store, settings.clone())),
        RotationMethod::LeastUsed => Arc::new(LeastUsedSelector::new(store, settings.clone())),
        RotationMethod::TimeSlot => {
            let mut interval = settings.time_based.interval;
            if interval <= 0 {
                interval = 120;
            }
            Arc::new(TimeSlotSelector::new(store, settings.clone(), interval))
        }
        RotationMethod::RateLimited => {
            let mut max_requests = settings.rate_limited.max_requests_per_minute;
            if max_requests <= 0 {
                max_requests = 30;
            }
            let mut window_secs = settings.rate_limited.window_seconds;
            if window_secs <= 0 {
                window_secs = 60;
            }
            Arc::new(RateLimitedSelector::new(
                store,
                request_log,
                settings.clone(),
                max_requests,
                window_secs,
            ))
        }
    }
}
