//! Least-used upstream selection

use std::sync::Arc;

use async_trait::async_trait;

use super::{RotationMethod, SelectorCore, UpstreamSelector};
use crate::error::{GyreError, Result};
use crate::models::{RotationSettings, Upstream};
use crate::repository::UpstreamStore;

/// Picks the candidate with the fewest lifetime requests
///
/// Counters come from the snapshot taken at refresh; the selector itself
/// never mutates them, so ties keep breaking toward the first occurrence
/// until the next refresh.
pub struct LeastUsedSelector {
    core: SelectorCore,
}

impl LeastUsedSelector {
    pub fn new(store: Arc<dyn UpstreamStore>, settings: RotationSettings) -> Self {
        Self {
            core: SelectorCore::new(store, settings),
        }
    }
}

#[async_trait]
impl UpstreamSelector for LeastUsedSelector {
    async fn select(&self) -> Result<Arc<Upstream>> {
        let candidates = self.core.snapshot();

        let mut best: Option<&Arc<Upstream>> = None;
        for candidate in &candidates {
            match best {
                Some(current) if candidate.requests >= current.requests => {}
                _ => best = Some(candidate),
            }
        }

        best.cloned().ok_or(GyreError::NoUpstreams)
    }

    async fn refresh(&self) -> Result<()> {
        self.core.reload().await?;
        Ok(())
    }

    fn candidate_count(&self) -> usize {
        self.core.len()
    }

    fn method(&self) -> RotationMethod {
        RotationMethod::LeastUsed
    }
}
