//! Short-lived cache for per-tenant feature toggles.

use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::time::Duration;

use lru::LruCache;
use tokio::time::Instant;
use tracing::warn;

use crate::services::TenantSettings;

/// Configuration for the toggle cache.
#[derive(Debug, Clone)]
pub struct ToggleCacheConfig {
    /// Time a looked-up value stays valid. Every hit extends it.
    pub ttl: Duration,
    pub max_entries: usize,
    /// Bound on one settings lookup. A timeout counts as a failed lookup.
    pub lookup_timeout: Duration,
}

impl Default for ToggleCacheConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(600),
            max_entries: 1024,
            lookup_timeout: Duration::from_secs(2),
        }
    }
}

struct ToggleEntry {
    expires_at: Instant,
    value: bool,
}

/// TTL + LRU cache in front of [`TenantSettings::get_toggle`].
pub struct ToggleCache {
    entries: Mutex<LruCache<(String, String), ToggleEntry>>,
    ttl: Duration,
    lookup_timeout: Duration,
}

impl ToggleCache {
    pub fn new(config: ToggleCacheConfig) -> Self {
        let capacity = NonZeroUsize::new(config.max_entries.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            ttl: config.ttl,
            lookup_timeout: config.lookup_timeout,
        }
    }

    fn cached(&self, key: &(String, String)) -> Option<bool> {
        let now = Instant::now();
        let mut entries = self
            .entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let entry = entries.get_mut(key)?;
        if entry.expires_at <= now {
            entries.pop(key);
            return None;
        }
        entry.expires_at = now + self.ttl;
        Some(entry.value)
    }

    fn store(&self, key: (String, String), value: bool) {
        let expires_at = Instant::now() + self.ttl;
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .put(key, ToggleEntry { expires_at, value });
    }

    /// Cached toggle value, looked up through `settings` on a miss.
    /// Lookup failures and timeouts return `default` and are not cached.
    pub async fn get(
        &self,
        settings: &dyn TenantSettings,
        tenant_id: &str,
        name: &str,
        default: bool,
    ) -> bool {
        let key = (tenant_id.to_string(), name.to_string());
        if let Some(value) = self.cached(&key) {
            return value;
        }
        match tokio::time::timeout(self.lookup_timeout, settings.get_toggle(tenant_id, name)).await {
            Ok(Ok(value)) => {
                self.store(key, value);
                value
            }
            Ok(Err(e)) => {
                warn!(tenant = %tenant_id, toggle = %name, "Toggle lookup failed: {}", e);
                default
            }
            Err(_) => {
                warn!(tenant = %tenant_id, toggle = %name, "Toggle lookup timed out");
                default
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::{ScanPolicy, ServiceError};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingSettings {
        calls: AtomicUsize,
        value: bool,
        fail: bool,
        delay: Duration,
    }

    #[async_trait]
    impl TenantSettings for CountingSettings {
        async fn get_toggle(&self, _: &str, _: &str) -> Result<bool, ServiceError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            if self.fail {
                Err(ServiceError::Unavailable)
            } else {
                Ok(self.value)
            }
        }

        async fn scan_policy(&self, _: &str) -> Result<ScanPolicy, ServiceError> {
            Ok(ScanPolicy::default())
        }
    }

    fn settings(value: bool, fail: bool) -> CountingSettings {
        CountingSettings {
            calls: AtomicUsize::new(0),
            value,
            fail,
            delay: Duration::ZERO,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_lookups_are_cached_until_ttl() {
        let cache = ToggleCache::new(ToggleCacheConfig {
            ttl: Duration::from_secs(600),
            max_entries: 16,
            ..Default::default()
        });
        let backend = settings(false, false);

        assert!(!cache.get(&backend, "g1", "check-tenor-gifs", true).await);
        assert!(!cache.get(&backend, "g1", "check-tenor-gifs", true).await);
        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);

        tokio::time::advance(Duration::from_secs(601)).await;
        assert!(!cache.get(&backend, "g1", "check-tenor-gifs", true).await);
        assert_eq!(backend.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_failures_use_default_and_are_not_cached() {
        let cache = ToggleCache::new(ToggleCacheConfig::default());
        let backend = settings(false, true);

        assert!(cache.get(&backend, "g1", "t", true).await);
        assert!(cache.get(&backend, "g1", "t", true).await);
        assert_eq!(backend.calls.load(Ordering::SeqCst), 2);
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_bounded_size() {
        let cache = ToggleCache::new(ToggleCacheConfig {
            ttl: Duration::from_secs(600),
            max_entries: 2,
            ..Default::default()
        });
        let backend = settings(true, false);
        for tenant in ["a", "b", "c"] {
            cache.get(&backend, tenant, "t", false).await;
        }
        assert_eq!(cache.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_lookup_times_out_to_default() {
        let cache = ToggleCache::new(ToggleCacheConfig {
            lookup_timeout: Duration::from_secs(2),
            ..Default::default()
        });
        let backend = CountingSettings {
            delay: Duration::from_secs(3600),
            ..settings(false, false)
        };

        let started = Instant::now();
        assert!(cache.get(&backend, "g1", "check-tenor-gifs", true).await);
        assert!(started.elapsed() < Duration::from_secs(3));
        assert!(cache.is_empty());

        // Not cached, so the next call asks again
        assert!(cache.get(&backend, "g1", "check-tenor-gifs", true).await);
        assert_eq!(backend.calls.load(Ordering::SeqCst), 2);
    }
}
