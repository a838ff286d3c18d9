//! Per-tenant concurrency limiting.
//!
//! Semaphores are created lazily per `(tenant, resource)` pair and sized from
//! the tenant's plan, so a burst from one tenant only queues behind its own
//! permits.

use std::sync::{Arc, Mutex};

use lru::LruCache;
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

use super::PlanLimits;

/// Tenants x resources tracked before idle semaphores are dropped.
pub const DEFAULT_POOL_ENTRIES: usize = 4096;

#[derive(Debug, Error)]
pub enum LimitError {
    #[error("{} budget is closed", .0.as_str())]
    Closed(Resource),
}

/// Resource kinds bounded per tenant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Resource {
    Download,
    FrameDecode,
    ClassifierCall,
    VideoWorker,
}

impl Resource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Resource::Download => "download",
            Resource::FrameDecode => "frame_decode",
            Resource::ClassifierCall => "classifier_call",
            Resource::VideoWorker => "video_worker",
        }
    }
}

/// Held for as long as the bounded work runs. Dropping it returns the permit.
#[derive(Debug)]
pub struct ResourcePermit {
    _permit: OwnedSemaphorePermit,
}

struct PoolEntry {
    semaphore: Arc<Semaphore>,
    limit: usize,
}

impl PoolEntry {
    fn is_idle(&self) -> bool {
        self.semaphore.available_permits() >= self.limit
    }
}

/// Lazily built, keyed semaphores, least recently used first out.
pub struct ConcurrencyPool {
    semaphores: Mutex<LruCache<(String, Resource), PoolEntry>>,
    max_entries: usize,
}

impl Default for ConcurrencyPool {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_POOL_ENTRIES)
    }
}

impl ConcurrencyPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pool that drops idle semaphores once more than `max_entries` are held.
    /// Semaphores with permits out are kept, so a tenant never gets a second,
    /// fresh budget while its old one is still in use.
    pub fn with_capacity(max_entries: usize) -> Self {
        Self {
            semaphores: Mutex::new(LruCache::unbounded()),
            max_entries: max_entries.max(1),
        }
    }

    /// Drops the least recently used idle entries past capacity, never `keep`.
    fn prune(
        &self,
        semaphores: &mut LruCache<(String, Resource), PoolEntry>,
        keep: &(String, Resource),
    ) {
        let excess = semaphores.len().saturating_sub(self.max_entries);
        if excess == 0 {
            return;
        }
        let victims: Vec<(String, Resource)> = semaphores
            .iter()
            .rev()
            .filter(|(key, entry)| *key != keep && entry.is_idle())
            .take(excess)
            .map(|(key, _)| key.clone())
            .collect();
        if victims.len() < excess {
            debug!(entries = semaphores.len(), "Concurrency pool over capacity, entries busy");
        }
        for key in victims {
            semaphores.pop(&key);
        }
    }

    /// Returns the semaphore for `(tenant, resource)`, replacing it when the
    /// tenant's plan changed since it was created. Holders of permits from a
    /// replaced semaphore keep them until they finish.
    fn semaphore(&self, tenant: &str, resource: Resource, limit: usize) -> Arc<Semaphore> {
        let limit = limit.max(1);
        let mut semaphores = self
            .semaphores
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let key = (tenant.to_string(), resource);
        if let Some(entry) = semaphores.get(&key) {
            if entry.limit == limit {
                return entry.semaphore.clone();
            }
        }
        let semaphore = Arc::new(Semaphore::new(limit));
        semaphores.put(
            key.clone(),
            PoolEntry {
                semaphore: semaphore.clone(),
                limit,
            },
        );
        self.prune(&mut semaphores, &key);
        semaphore
    }

    /// Waits for a permit for `resource` under the tenant's plan budget.
    pub async fn acquire(
        &self,
        tenant: &str,
        resource: Resource,
        limits: &PlanLimits,
    ) -> Result<ResourcePermit, LimitError> {
        let semaphore = self.semaphore(tenant, resource, limits.budget(resource));
        let permit = semaphore
            .acquire_owned()
            .await
            .map_err(|_| LimitError::Closed(resource))?;
        Ok(ResourcePermit { _permit: permit })
    }

    /// Number of `(tenant, resource)` semaphores currently held.
    pub fn len(&self) -> usize {
        self.semaphores
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Permits currently available, for diagnostics and tests.
    pub fn available(&self, tenant: &str, resource: Resource, limits: &PlanLimits) -> usize {
        self.semaphore(tenant, resource, limits.budget(resource))
            .available_permits()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::limits::PlanTier;
    use std::time::Duration;

    #[tokio::test]
    async fn test_permits_are_bounded_per_tenant() {
        let pool = ConcurrencyPool::new();
        let limits = PlanTier::Free.limits();

        let mut held = Vec::new();
        for _ in 0..limits.max_concurrent_downloads {
            held.push(pool.acquire("guild-a", Resource::Download, limits).await.unwrap());
        }
        assert_eq!(pool.available("guild-a", Resource::Download, limits), 0);

        // Another permit for the same tenant must wait
        let blocked = tokio::time::timeout(
            Duration::from_millis(50),
            pool.acquire("guild-a", Resource::Download, limits),
        )
        .await;
        assert!(blocked.is_err());

        // A different tenant is unaffected
        let other = tokio::time::timeout(
            Duration::from_millis(50),
            pool.acquire("guild-b", Resource::Download, limits),
        )
        .await;
        assert!(other.is_ok());

        held.pop();
        assert_eq!(pool.available("guild-a", Resource::Download, limits), 1);
    }

    #[tokio::test]
    async fn test_plan_change_resizes_semaphore() {
        let pool = ConcurrencyPool::new();
        let free = PlanTier::Free.limits();
        let pro = PlanTier::Pro.limits();

        assert_eq!(
            pool.available("guild", Resource::ClassifierCall, free),
            free.max_concurrent_classifier_calls
        );
        assert_eq!(
            pool.available("guild", Resource::ClassifierCall, pro),
            pro.max_concurrent_classifier_calls
        );
    }

    #[tokio::test]
    async fn test_idle_semaphores_are_evicted_past_capacity() {
        let pool = ConcurrencyPool::with_capacity(2);
        let limits = PlanTier::Free.limits();

        let busy = pool.acquire("guild-a", Resource::Download, limits).await.unwrap();
        for tenant in ["guild-b", "guild-c", "guild-d"] {
            drop(pool.acquire(tenant, Resource::Download, limits).await.unwrap());
        }
        // guild-a is the oldest entry but holds a permit, so idle ones go first
        assert_eq!(pool.len(), 2);
        assert_eq!(
            pool.available("guild-a", Resource::Download, limits),
            limits.max_concurrent_downloads - 1
        );

        drop(busy);
        for tenant in ["guild-e", "guild-f"] {
            drop(pool.acquire(tenant, Resource::Download, limits).await.unwrap());
        }
        assert_eq!(pool.len(), 2);
    }
}
