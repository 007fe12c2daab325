//! Atomic selector replacement for settings reload

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;

use super::{RotationMethod, UpstreamSelector};
use crate::error::Result;
use crate::models::Upstream;

/// Wraps the active selector so the forwarding engine never holds a
/// long-lived reference to a particular strategy
///
/// Settings reload builds and refreshes a replacement off to the side, then
/// swaps it in with a single pointer store; in-flight selects finish against
/// whichever selector they started with.
pub struct SwappableSelector {
    inner: RwLock<Arc<dyn UpstreamSelector>>,
}

impl SwappableSelector {
    pub fn new(initial: Arc<dyn UpstreamSelector>) -> Self {
        Self {
            inner: RwLock::new(initial),
        }
    }

    /// Replace the active selector
    pub fn replace(&self, next: Arc<dyn UpstreamSelector>) {
        *self.inner.write() = next;
    }

    fn current(&self) -> Arc<dyn UpstreamSelector> {
        self.inner.read().clone()
    }
}

#[async_trait]
impl UpstreamSelector for SwappableSelector {
    async fn select(&self) -> Result<Arc<Upstream>> {
        self.current().select().await
    }

    async fn refresh(&self) -> Result<()> {
        self.current().refresh().await
    }

    fn candidate_count(&self) -> usize {
        self.current().candidate_count()
    }

    fn method(&self) -> RotationMethod {
        self.current().method()
    }
}
