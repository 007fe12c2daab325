//! Per-client rate limiting for the proxy listener
//!
//! One governor token bucket per client IP, allowing `max_requests` per
//! `interval` seconds. The server's background sweep evicts idle buckets so
//! the map never grows without bound.

use std::num::NonZeroU32;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter as GovRateLimiter};
use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::error::{GyreError, Result};
use crate::models::RateLimitSettings;

type DirectLimiter = GovRateLimiter<NotKeyed, InMemoryState, DefaultClock>;

struct ClientBucket {
    limiter: Arc<DirectLimiter>,
    last_seen_ms: AtomicU64,
}

#[derive(Clone, Copy)]
struct LimiterParams {
    enabled: bool,
    interval: Duration,
    max_requests: NonZeroU32,
}

impl LimiterParams {
    fn from_settings(settings: &RateLimitSettings) -> Self {
        Self {
            enabled: settings.enabled,
            interval: Duration::from_secs(settings.interval.max(1) as u64),
            max_requests: NonZeroU32::new(settings.max_requests.max(1)).unwrap(),
        }
    }

    fn quota(&self) -> Quota {
        // Tokens refill evenly across the window; the burst is the full
        // window budget.
        let period = self.interval / self.max_requests.get();
        Quota::with_period(period.max(Duration::from_millis(1)))
            .unwrap()
            .allow_burst(self.max_requests)
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Per-client request limiter, keyed by IP address
pub struct ClientRateLimiter {
    params: RwLock<LimiterParams>,
    buckets: DashMap<String, ClientBucket>,
    /// How long to keep a client's bucket without activity
    max_idle: Duration,
}

impl ClientRateLimiter {
    pub fn new(settings: &RateLimitSettings) -> Self {
        Self {
            params: RwLock::new(LimiterParams::from_settings(settings)),
            buckets: DashMap::new(),
            max_idle: Duration::from_secs(10 * 60),
        }
    }

    pub fn disabled() -> Self {
        Self::new(&RateLimitSettings::default())
    }

    pub fn is_enabled(&self) -> bool {
        self.params.read().enabled
    }

    /// Swap in new settings during reload; existing buckets are discarded so
    /// the new quota applies immediately.
    pub fn update_settings(&self, settings: &RateLimitSettings) {
        *self.params.write() = LimiterParams::from_settings(settings);
        self.buckets.clear();
    }

    /// Check whether a request from this client is allowed
    pub fn check(&self, client_ip: &str) -> Result<()> {
        let params = *self.params.read();
        if !params.enabled {
            return Ok(());
        }

        let now = now_ms();
        let bucket = self
            .buckets
            .entry(client_ip.to_string())
            .or_insert_with(|| ClientBucket {
                limiter: Arc::new(GovRateLimiter::direct(params.quota())),
                last_seen_ms: AtomicU64::new(now),
            });
        bucket.last_seen_ms.store(now, Ordering::Relaxed);
        let limiter = bucket.limiter.clone();
        drop(bucket);

        match limiter.check() {
            Ok(_) => {
                debug!(client_ip, "rate limit check passed");
                Ok(())
            }
            Err(_) => {
                warn!(client_ip, "rate limit exceeded");
                Err(GyreError::RateLimitExceeded {
                    client_ip: client_ip.to_string(),
                })
            }
        }
    }

    /// Evict buckets with no recent activity; invoked by the background sweep
    pub fn cleanup(&self) {
        let now = now_ms();
        let max_idle_ms = self.max_idle.as_millis() as u64;

        self.buckets.retain(|_, bucket| {
            let last_seen = bucket.last_seen_ms.load(Ordering::Relaxed);
            now.saturating_sub(last_seen) <= max_idle_ms
        });
    }

    /// Number of tracked clients
    pub fn client_count(&self) -> usize {
        self.buckets.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(max_requests: u32, interval: i64) -> ClientRateLimiter {
        ClientRateLimiter::new(&RateLimitSettings {
            enabled: true,
            interval,
            max_requests,
        })
    }

    #[test]
    fn test_disabled_always_allows() {
        let limiter = ClientRateLimiter::disabled();
        for _ in 0..100 {
            assert!(limiter.check("192.168.1.1").is_ok());
        }
    }

    #[test]
    fn test_allows_up_to_window_budget() {
        let limiter = limiter(10, 60);
        for i in 0..10 {
            assert!(limiter.check("192.168.1.1").is_ok(), "request {}", i);
        }
    }

    #[test]
    fn test_blocks_over_budget() {
        let limiter = limiter(2, 60);

        assert!(limiter.check("192.168.1.1").is_ok());
        assert!(limiter.check("192.168.1.1").is_ok());
        assert!(matches!(
            limiter.check("192.168.1.1"),
            Err(GyreError::RateLimitExceeded { .. })
        ));
    }

    #[test]
    fn test_budget_is_per_client() {
        let limiter = limiter(1, 60);

        assert!(limiter.check("192.168.1.1").is_ok());
        assert!(limiter.check("192.168.1.2").is_ok());
        assert!(limiter.check("192.168.1.3").is_ok());
        assert!(matches!(
            limiter.check("192.168.1.1"),
            Err(GyreError::RateLimitExceeded { .. })
        ));
    }

    #[test]
    fn test_cleanup_evicts_only_idle_buckets() {
        let limiter = limiter(10, 60);
        limiter.check("192.168.1.1").ok();
        limiter.check("192.168.1.2").ok();
        assert_eq!(limiter.client_count(), 2);

        // Backdate one bucket past the idle horizon.
        limiter
            .buckets
            .get("192.168.1.1")
            .unwrap()
            .last_seen_ms
            .store(0, Ordering::Relaxed);

        limiter.cleanup();
        assert_eq!(limiter.client_count(), 1);
        assert!(limiter.buckets.contains_key("192.168.1.2"));
    }

    #[test]
    fn test_update_settings_resets_buckets() {
        let limiter = limiter(1, 60);
        assert!(limiter.check("192.168.1.1").is_ok());
        assert!(limiter.check("192.168.1.1").is_err());

        limiter.update_settings(&RateLimitSettings {
            enabled: true,
            interval: 60,
            max_requests: 5,
        });

        // Fresh bucket under the new quota.
        assert_eq!(limiter.client_count(), 0);
        for _ in 0..5 {
            assert!(limiter.check("192.168.1.1").is_ok());
        }
        assert!(limiter.check("192.168.1.1").is_err());
    }

    #[test]
    fn test_update_settings_can_disable() {
        let limiter = limiter(1, 60);
        assert!(limiter.check("192.168.1.1").is_ok());
        assert!(limiter.check("192.168.1.1").is_err());

        limiter.update_settings(&RateLimitSettings {
            enabled: false,
            ..RateLimitSettings::default()
        });
        assert!(!limiter.is_enabled());
        for _ in 0..10 {
            assert!(limiter.check("192.168.1.1").is_ok());
        }
    }
}
