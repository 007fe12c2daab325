//! Rate-limited upstream selection
//!
//! Excludes any upstream whose recent successful-request count has reached
//! the configured cap, then round-robins among the remainder. Availability
//! is computed from the request log with one grouped query and cached
//! briefly to amortise store load.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::time::timeout;
use tracing::warn;

use super::{load_candidates, RotationMethod, UpstreamSelector};
use crate::error::{GyreError, Result};
use crate::models::{RotationSettings, Upstream};
use crate::repository::{RequestLogStore, UpstreamStore};

/// Upper bound on availability-query time, so selection cannot eat the whole
/// request deadline
const USAGE_QUERY_BUDGET: Duration = Duration::from_secs(10);

/// All selection state lives under one lock: candidate snapshot, round-robin
/// cursor, and the availability cache with its expiry.
struct RateState {
    candidates: Vec<Arc<Upstream>>,
    cursor: usize,
    cache: Vec<Arc<Upstream>>,
    cache_expiry: Option<Instant>,
}

pub struct RateLimitedSelector {
    store: Arc<dyn UpstreamStore>,
    request_log: Arc<dyn RequestLogStore>,
    settings: RotationSettings,
    max_requests: i64,
    window_secs: i64,
    cache_ttl: Duration,
    state: RwLock<RateState>,
}

impl RateLimitedSelector {
    /// `max_requests` and `window_secs` must be at least 1; the factory
    /// substitutes the defaults before construction.
    pub fn new(
        store: Arc<dyn UpstreamStore>,
        request_log: Arc<dyn RequestLogStore>,
        settings: RotationSettings,
        max_requests: i64,
        window_secs: i64,
    ) -> Self {
        debug_assert!(max_requests >= 1 && window_secs >= 1);

        // One fifth of the window, capped at two seconds. Short windows get a
        // zero TTL and query on every select.
        let cache_ttl = Duration::from_secs((window_secs / 5).clamp(0, 2) as u64);

        Self {
            store,
            request_log,
            settings,
            max_requests,
            window_secs,
            cache_ttl,
            state: RwLock::new(RateState {
                candidates: Vec::new(),
                cursor: 0,
                cache: Vec::new(),
                cache_expiry: None,
            }),
        }
    }

    pub fn cache_ttl(&self) -> Duration {
        self.cache_ttl
    }

    /// Candidates whose successful-request count over the window is still
    /// below the cap. One grouped query; upstreams absent from the result
    /// have zero qualifying events and stay available.
    async fn under_limit(&self, candidates: &[Arc<Upstream>]) -> Result<Vec<Arc<Upstream>>> {
        let ids: Vec<i64> = candidates.iter().map(|u| u.id).collect();

        let counts = timeout(
            USAGE_QUERY_BUDGET,
            self.request_log
                .count_by_upstream(&ids, self.window_secs, true),
        )
        .await
        .map_err(|_| GyreError::Timeout)??;

        Ok(candidates
            .iter()
            .filter(|u| counts.get(&u.id).copied().unwrap_or(0) < self.max_requests)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl UpstreamSelector for RateLimitedSelector {
    async fn select(&self) -> Result<Arc<Upstream>> {
        let (candidates, cached) = {
            let state = self.state.read();
            let cache_valid = !state.cache.is_empty()
                && state
                    .cache_expiry
                    .is_some_and(|expiry| Instant::now() < expiry);
            (
                state.candidates.clone(),
                cache_valid.then(|| state.cache.clone()),
            )
        };

        if candidates.is_empty() {
            return Err(GyreError::NoUpstreams);
        }

        let available = match cached {
            Some(cache) => cache,
            None => {
                let available = match self.under_limit(&candidates).await {
                    Ok(available) => available,
                    Err(e) => {
                        // Degrade open: availability over accuracy when the
                        // store cannot answer.
                        warn!(error = %e, "usage query failed, serving with the full candidate set");
                        candidates.clone()
                    }
                };

                let mut state = self.state.write();
                state.cache = available.clone();
                state.cache_expiry = Some(Instant::now() + self.cache_ttl);
                available
            }
        };

        if available.is_empty() {
            return Err(GyreError::AllRateLimited {
                max_requests: self.max_requests,
                window_secs: self.window_secs,
            });
        }

        let mut state = self.state.write();
        let picked = available[state.cursor % available.len()].clone();
        state.cursor = (state.cursor + 1) % available.len();
        Ok(picked)
    }

    async fn refresh(&self) -> Result<()> {
        let candidates = load_candidates(self.store.as_ref(), &self.settings).await?;

        let mut state = self.state.write();
        if state.cursor >= candidates.len() {
            state.cursor = 0;
        }
        state.candidates = candidates;
        state.cache.clear();
        state.cache_expiry = None;
        Ok(())
    }

    fn candidate_count(&self) -> usize {
        self.state.read().candidates.len()
    }

    fn method(&self) -> RotationMethod {
        RotationMethod::RateLimited
    }
}
