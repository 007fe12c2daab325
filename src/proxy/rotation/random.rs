//! Uniform random upstream selection

use std::sync::Arc;

use async_trait::async_trait;
use rand::seq::SliceRandom;

use super::{RotationMethod, SelectorCore, UpstreamSelector};
use crate::error::{GyreError, Result};
use crate::models::{RotationSettings, Upstream};
use crate::repository::UpstreamStore;

/// Picks uniformly at random over the candidate set
///
/// `thread_rng` is an OS-seeded CSPRNG, so the rotation order is not
/// predictable from outside.
pub struct RandomSelector {
    core: SelectorCore,
}

impl RandomSelector {
    pub fn new(store: Arc<dyn UpstreamStore>, settings: RotationSettings) -> Self {
        Self {
            core: SelectorCore::new(store, settings),
        }
    }
}

#[async_trait]
impl UpstreamSelector for RandomSelector {
    async fn select(&self) -> Result<Arc<Upstream>> {
        let candidates = self.core.snapshot();

        candidates
            .choose(&mut rand::thread_rng())
            .cloned()
            .ok_or(GyreError::NoUpstreams)
    }

    async fn refresh(&self) -> Result<()> {
        self.core.reload().await?;
        Ok(())
    }

    fn candidate_count(&self) -> usize {
        self.core.len()
    }

    fn method(&self) -> RotationMethod {
        RotationMethod::Random
    }
}
