//! Time-slot upstream selection

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;

use super::{RotationMethod, SelectorCore, UpstreamSelector};
use crate::error::{GyreError, Result};
use crate::models::{RotationSettings, Upstream};
use crate::repository::UpstreamStore;

/// Maps wall-clock slots onto the candidate list
///
/// All concurrent callers in the same slot get the same upstream; the pool
/// advances by one every `interval_secs`.
pub struct TimeSlotSelector {
    core: SelectorCore,
    interval_secs: i64,
}

impl TimeSlotSelector {
    /// `interval_secs` must be positive; the factory substitutes the default
    /// before construction.
    pub fn new(store: Arc<dyn UpstreamStore>, settings: RotationSettings, interval_secs: i64) -> Self {
        debug_assert!(interval_secs > 0);
        Self {
            core: SelectorCore::new(store, settings),
            interval_secs,
        }
    }
}

/// Index of the slot owner for the given time
fn slot_index(unix_seconds: i64, interval_secs: i64, len: usize) -> usize {
    ((unix_seconds / interval_secs) % len as i64) as usize
}

#[async_trait]
impl UpstreamSelector for TimeSlotSelector {
    async fn select(&self) -> Result<Arc<Upstream>> {
        let candidates = self.core.snapshot();
        if candidates.is_empty() {
            return Err(GyreError::NoUpstreams);
        }

        let idx = slot_index(Utc::now().timestamp(), self.interval_secs, candidates.len());
        candidates.get(idx).cloned().ok_or(GyreError::NoUpstreams)
    }

    async fn refresh(&self) -> Result<()> {
        self.core.reload().await?;
        Ok(())
    }

    fn candidate_count(&self) -> usize {
        self.core.len()
    }

    fn method(&self) -> RotationMethod {
        RotationMethod::TimeSlot
    }
}
