//! Round-robin upstream selection

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;

use super::{RotationMethod, SelectorCore, UpstreamSelector};
use crate::error::{GyreError, Result};
use crate::models::{RotationSettings, Upstream};
use crate::repository::UpstreamStore;

/// Hands out candidates in address order, one full cycle at a time
///
/// The cursor advances atomically, so concurrent callers each observe every
/// candidate exactly once per cycle as long as no refresh replaces the set.
pub struct RoundRobinSelector {
    core: SelectorCore,
    cursor: AtomicUsize,
}

impl RoundRobinSelector {
    pub fn new(store: Arc<dyn UpstreamStore>, settings: RotationSettings) -> Self {
        Self {
            core: SelectorCore::new(store, settings),
            cursor: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl UpstreamSelector for RoundRobinSelector {
    async fn select(&self) -> Result<Arc<Upstream>> {
        let candidates = self.core.snapshot();
        if candidates.is_empty() {
            return Err(GyreError::NoUpstreams);
        }

        let idx = self.cursor.fetch_add(1, Ordering::Relaxed) % candidates.len();
        candidates.get(idx).cloned().ok_or(GyreError::NoUpstreams)
    }

    async fn refresh(&self) -> Result<()> {
        let len = self.core.reload().await?;
        // The cursor restarts whenever the set changes size underneath it.
        if self.cursor.load(Ordering::Relaxed) >= len.max(1) {
            self.cursor.store(0, Ordering::Relaxed);
        }
        Ok(())
    }

    fn candidate_count(&self) -> usize {
        self.core.len()
    }

    fn method(&self) -> RotationMethod {
        RotationMethod::RoundRobin
    }
}
