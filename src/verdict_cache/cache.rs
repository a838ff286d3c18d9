//! Single-flight verdict cache with TTL and LRU eviction.
//!
//! Settled verdicts live in an LRU map; in-flight computations live in a
//! separate map keyed the same way. A key is in at most one of the two.
//! All state sits behind one `std::sync::Mutex` that is only held for map
//! operations, never across an await point.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use lru::LruCache;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::models::{CacheError, Verdict};
use crate::metrics;

type Outcome = Option<Result<Verdict, CacheError>>;

/// Cache sizing.
#[derive(Debug, Clone)]
pub struct VerdictCacheConfig {
    /// Maximum number of settled entries.
    pub capacity: usize,
    /// Age after which a settled entry is treated as absent. Reads do not
    /// extend it.
    pub ttl: Duration,
}

impl Default for VerdictCacheConfig {
    fn default() -> Self {
        Self {
            capacity: 512,
            ttl: Duration::from_secs(15 * 60),
        }
    }
}

struct CacheEntry {
    timestamp: Instant,
    verdict: Verdict,
}

struct InFlight {
    token_id: u64,
    tx: watch::Sender<Outcome>,
}

struct CacheState {
    entries: LruCache<String, CacheEntry>,
    inflight: HashMap<String, InFlight>,
    next_token_id: u64,
}

impl CacheState {
    /// Drops every entry older than `ttl`. Entries are stored in recency
    /// order, not insertion order, so this is a full scan.
    fn prune_expired(&mut self, ttl: Duration, now: Instant) {
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, entry)| now.duration_since(entry.timestamp) >= ttl)
            .map(|(key, _)| key.clone())
            .collect();
        for key in expired {
            self.entries.pop(&key);
        }
    }
}

struct Inner {
    config: VerdictCacheConfig,
    state: Mutex<CacheState>,
}

/// Process-wide verdict cache. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct VerdictCache {
    inner: Arc<Inner>,
}

/// Result of [`VerdictCache::claim`].
pub enum Reservation {
    /// A settled, unexpired verdict.
    Ready(Verdict),
    /// Another caller owns the computation; await its outcome.
    Pending(VerdictWaiter),
    /// The caller owns the computation and must resolve or fail it.
    Owner(ClaimToken),
}

impl std::fmt::Debug for Reservation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Reservation::Ready(v) => f.debug_tuple("Ready").field(v).finish(),
            Reservation::Pending(w) => f.debug_tuple("Pending").field(&w.key).finish(),
            Reservation::Owner(t) => f.debug_tuple("Owner").field(&t.key).finish(),
        }
    }
}

/// Read-only handle on someone else's in-flight computation.
pub struct VerdictWaiter {
    key: String,
    rx: watch::Receiver<Outcome>,
}

impl VerdictWaiter {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Waits for the owner's outcome.
    pub async fn wait(mut self) -> Result<Verdict, CacheError> {
        match self.rx.wait_for(|outcome| outcome.is_some()).await {
            Ok(outcome) => outcome.clone().unwrap_or(Err(CacheError::Abandoned)),
            Err(_) => Err(CacheError::Abandoned),
        }
    }
}

/// Exclusive ownership of one key's computation.
///
/// Dropping an unsettled token fails the claim with
/// [`CacheError::Cancelled`], so a cancelled task never leaves the key stuck
/// in flight.
pub struct ClaimToken {
    key: String,
    id: u64,
    cache: VerdictCache,
    settled: bool,
}

impl ClaimToken {
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for ClaimToken {
    fn drop(&mut self) {
        if !self.settled {
            debug!(cache_key = %self.key, "Claim dropped unsettled, releasing waiters");
            self.cache
                .settle(&self.key, self.id, Err(CacheError::Cancelled));
        }
    }
}

impl VerdictCache {
    pub fn new(config: VerdictCacheConfig) -> Self {
        let capacity = NonZeroUsize::new(config.capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Arc::new(Inner {
                config,
                state: Mutex::new(CacheState {
                    entries: LruCache::new(capacity),
                    inflight: HashMap::new(),
                    next_token_id: 1,
                }),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, CacheState> {
        // A panic while holding the lock cannot leave the maps half-updated
        // in a way that matters more than losing the scan, keep going.
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Looks up `key`, joining or starting its computation on a miss.
    pub fn claim(&self, key: &str) -> Reservation {
        let now = Instant::now();
        let mut state = self.lock();
        state.prune_expired(self.inner.config.ttl, now);

        if let Some(entry) = state.entries.get(key) {
            let verdict = entry.verdict.clone();
            drop(state);
            metrics::record_cache_lookup("hit");
            return Reservation::Ready(verdict);
        }

        if let Some(inflight) = state.inflight.get(key) {
            let rx = inflight.tx.subscribe();
            drop(state);
            metrics::record_cache_lookup("pending");
            return Reservation::Pending(VerdictWaiter {
                key: key.to_string(),
                rx,
            });
        }

        let id = state.next_token_id;
        state.next_token_id += 1;
        let (tx, _rx) = watch::channel(None);
        state
            .inflight
            .insert(key.to_string(), InFlight { token_id: id, tx });
        drop(state);

        metrics::record_cache_lookup("miss");
        Reservation::Owner(ClaimToken {
            key: key.to_string(),
            id,
            cache: self.clone(),
            settled: false,
        })
    }

    /// Stores `verdict` for the token's key and wakes every waiter with it.
    pub fn resolve(&self, mut token: ClaimToken, verdict: Verdict) {
        token.settled = true;
        self.settle(&token.key, token.id, Ok(verdict));
    }

    /// Wakes every waiter with `error`. Nothing is cached, so the key can be
    /// claimed again straight away.
    pub fn fail(&self, mut token: ClaimToken, error: CacheError) {
        token.settled = true;
        self.settle(&token.key, token.id, Err(error));
    }

    fn settle(&self, key: &str, token_id: u64, outcome: Result<Verdict, CacheError>) {
        let now = Instant::now();
        let mut state = self.lock();

        let owned = matches!(state.inflight.get(key), Some(f) if f.token_id == token_id);
        if !owned {
            drop(state);
            debug_assert!(
                false,
                "settled cache key {key} with a token that does not own it"
            );
            warn!(cache_key = %key, "Ignoring settle from a token that does not own the key");
            return;
        }

        let Some(inflight) = state.inflight.remove(key) else {
            return;
        };
        if let Ok(verdict) = &outcome {
            state.entries.put(
                key.to_string(),
                CacheEntry {
                    timestamp: now,
                    verdict: verdict.clone(),
                },
            );
        }
        state.prune_expired(self.inner.config.ttl, now);
        drop(state);

        inflight.tx.send_replace(Some(outcome));
    }

    /// True when a settled, unexpired entry exists. Does not touch recency.
    pub fn contains(&self, key: &str) -> bool {
        let now = Instant::now();
        let state = self.lock();
        state
            .entries
            .peek(key)
            .is_some_and(|entry| now.duration_since(entry.timestamp) < self.inner.config.ttl)
    }

    /// Number of settled entries after expiry.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        let mut state = self.lock();
        state.prune_expired(self.inner.config.ttl, now);
        state.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of keys currently being computed.
    pub fn inflight_len(&self) -> usize {
        self.lock().inflight.len()
    }
}

impl Default for VerdictCache {
    fn default() -> Self {
        Self::new(VerdictCacheConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_cache(capacity: usize, ttl_secs: u64) -> VerdictCache {
        VerdictCache::new(VerdictCacheConfig {
            capacity,
            ttl: Duration::from_secs(ttl_secs),
        })
    }

    fn owner(cache: &VerdictCache, key: &str) -> ClaimToken {
        match cache.claim(key) {
            Reservation::Owner(token) => token,
            other => panic!("expected ownership of {key}, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_single_flight_one_owner_many_waiters() {
        let cache = VerdictCache::default();
        let token = owner(&cache, "url::a");

        let mut waiters = Vec::new();
        for _ in 0..8 {
            match cache.claim("url::a") {
                Reservation::Pending(w) => waiters.push(tokio::spawn(w.wait())),
                other => panic!("expected pending, got {other:?}"),
            }
        }
        assert_eq!(cache.inflight_len(), 1);

        let verdict = Verdict::flagged("explicit", "classifier", 0.93);
        cache.resolve(token, verdict.clone());

        for waiter in waiters {
            assert_eq!(waiter.await.unwrap(), Ok(verdict.clone()));
        }
        assert_eq!(cache.inflight_len(), 0);
        assert!(matches!(cache.claim("url::a"), Reservation::Ready(v) if v == verdict));
    }

    #[tokio::test]
    async fn test_fail_releases_waiters_and_is_not_cached() {
        let cache = VerdictCache::default();
        let token = owner(&cache, "url::b");
        let waiter = match cache.claim("url::b") {
            Reservation::Pending(w) => w,
            other => panic!("expected pending, got {other:?}"),
        };

        cache.fail(token, CacheError::failed("http 500"));

        assert_eq!(waiter.wait().await, Err(CacheError::failed("http 500")));
        assert!(!cache.contains("url::b"));
        assert!(matches!(cache.claim("url::b"), Reservation::Owner(_)));
    }

    #[tokio::test]
    async fn test_dropped_token_cancels_claim() {
        let cache = VerdictCache::default();
        let token = owner(&cache, "url::c");
        let waiter = match cache.claim("url::c") {
            Reservation::Pending(w) => w,
            other => panic!("expected pending, got {other:?}"),
        };

        drop(token);

        assert_eq!(waiter.wait().await, Err(CacheError::Cancelled));
        assert_eq!(cache.inflight_len(), 0);
        assert!(matches!(cache.claim("url::c"), Reservation::Owner(_)));
    }

    #[tokio::test]
    async fn test_waiter_after_resolve_sees_value() {
        let cache = VerdictCache::default();
        let token = owner(&cache, "k");
        let waiter = match cache.claim("k") {
            Reservation::Pending(w) => w,
            other => panic!("expected pending, got {other:?}"),
        };
        cache.resolve(token, Verdict::clean("clean"));
        // Outcome was sent before the waiter started awaiting
        assert_eq!(waiter.wait().await.unwrap().reason, "clean");
    }

    #[tokio::test(start_paused = true)]
    async fn test_entries_expire_after_ttl_even_when_read() {
        let cache = small_cache(16, 60);
        let token = owner(&cache, "k");
        cache.resolve(token, Verdict::clean("ok"));

        tokio::time::advance(Duration::from_secs(45)).await;
        assert!(matches!(cache.claim("k"), Reservation::Ready(_)));

        // The read above must not have refreshed the timestamp
        tokio::time::advance(Duration::from_secs(15)).await;
        assert!(!cache.contains("k"));
        assert!(matches!(cache.claim("k"), Reservation::Owner(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_expiry_is_checked_lazily_on_every_access() {
        let cache = small_cache(16, 10);
        for key in ["a", "b", "c"] {
            let token = owner(&cache, key);
            cache.resolve(token, Verdict::clean("ok"));
        }
        assert_eq!(cache.len(), 3);

        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn test_capacity_evicts_least_recently_touched() {
        let cache = small_cache(3, 600);
        for key in ["a", "b", "c"] {
            let token = owner(&cache, key);
            cache.resolve(token, Verdict::clean(key));
        }

        // Touch "a" so "b" becomes the oldest
        assert!(matches!(cache.claim("a"), Reservation::Ready(_)));

        let token = owner(&cache, "d");
        cache.resolve(token, Verdict::clean("d"));

        assert_eq!(cache.len(), 3);
        assert!(cache.contains("a"));
        assert!(!cache.contains("b"));
        assert!(cache.contains("c"));
        assert!(cache.contains("d"));
    }

    #[test]
    fn test_inserting_more_than_capacity_keeps_exactly_capacity() {
        let cache = small_cache(5, 600);
        for i in 0..12 {
            let key = format!("k{i}");
            let token = owner(&cache, &key);
            cache.resolve(token, Verdict::clean("ok"));
        }
        assert_eq!(cache.len(), 5);
        for i in 7..12 {
            assert!(cache.contains(&format!("k{i}")));
        }
    }

    #[tokio::test]
    async fn test_concurrent_claims_elect_exactly_one_owner() {
        let cache = VerdictCache::default();
        let mut handles = Vec::new();
        for _ in 0..32 {
            let cache = cache.clone();
            handles.push(tokio::spawn(async move {
                match cache.claim("hash::abc") {
                    Reservation::Owner(token) => {
                        tokio::task::yield_now().await;
                        cache.resolve(token, Verdict::clean("owner"));
                        (true, "owner".to_string())
                    }
                    Reservation::Pending(w) => (false, w.wait().await.unwrap().reason),
                    Reservation::Ready(v) => (false, v.reason),
                }
            }));
        }

        let mut owners = 0;
        for handle in handles {
            let (is_owner, reason) = handle.await.unwrap();
            owners += is_owner as usize;
            assert_eq!(reason, "owner");
        }
        assert_eq!(owners, 1);
    }
}
