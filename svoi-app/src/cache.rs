//! Expiring key/value cache with request coalescing.
//!
//! One instance is shared by every worker. `get_or_fill` guarantees at most
//! one in-flight fill per key: concurrent callers for the same key wait for
//! the leader and receive its result, success or failure.

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Error)]
pub enum CacheError {
    #[error("fill failed: {0:#}")]
    Fill(Arc<anyhow::Error>),

    #[error("fill for {0:?} was abandoned before completing")]
    Abandoned(String),
}

type FillResult<V> = Result<V, CacheError>;

struct CacheEntry<V> {
    value: V,
    expires_at: Option<Instant>,
}

impl<V> CacheEntry<V> {
    fn new(value: V, ttl: Option<Duration>) -> Self {
        Self {
            value,
            // Zero TTL means the entry lives until deleted.
            expires_at: ttl
                .filter(|ttl| !ttl.is_zero())
                .map(|ttl| Instant::now() + ttl),
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

pub struct CoalescingCache<V> {
    entries: DashMap<String, CacheEntry<V>>,
    inflight: DashMap<String, watch::Receiver<Option<FillResult<V>>>>,
}

impl<V> Default for CoalescingCache<V>
where
    V: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<V> CoalescingCache<V>
where
    V: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            inflight: DashMap::new(),
        }
    }

    pub fn get(&self, key: &str) -> Option<V> {
        let now = Instant::now();
        let entry = self.entries.get(key)?;
        if entry.is_expired(now) {
            drop(entry);
            self.entries.remove_if(key, |_, e| e.is_expired(now));
            return None;
        }
        Some(entry.value.clone())
    }

    pub fn set(&self, key: &str, value: V, ttl: Option<Duration>) {
        self.entries
            .insert(key.to_string(), CacheEntry::new(value, ttl));
    }

    /// Insert only when no live entry exists. Returns whether the value was
    /// stored; atomic with respect to concurrent `add`/`set` on the same key.
    pub fn add(&self, key: &str, value: V, ttl: Option<Duration>) -> bool {
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if !occupied.get().is_expired(Instant::now()) {
                    return false;
                }
                occupied.insert(CacheEntry::new(value, ttl));
                true
            }
            Entry::Vacant(vacant) => {
                vacant.insert(CacheEntry::new(value, ttl));
                true
            }
        }
    }

    pub fn delete(&self, key: &str) -> bool {
        self.entries.remove(key).is_some()
    }

    /// Delete `key` only while its current value satisfies `pred`; atomic
    /// with respect to a concurrent `add`/`set` replacing the value.
    pub fn delete_if(&self, key: &str, pred: impl FnOnce(&V) -> bool) -> bool {
        self.entries.remove_if(key, |_, e| pred(&e.value)).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Remove every expired entry; returns how many were dropped.
    pub fn evict_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, e| !e.is_expired(now));
        before.saturating_sub(self.entries.len())
    }

    /// Return the cached value or run `fill` to produce it.
    ///
    /// Among concurrent callers for one key only the first runs `fill`; the
    /// rest wait and share its outcome. Failures are not cached, so the next
    /// caller after a failed fill tries again.
    pub async fn get_or_fill<F, Fut>(
        &self,
        key: &str,
        ttl: Option<Duration>,
        fill: F,
    ) -> FillResult<V>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<V>>,
    {
        if let Some(value) = self.get(key) {
            return Ok(value);
        }

        let leader = match self.inflight.entry(key.to_string()) {
            Entry::Occupied(occupied) => Err(occupied.get().clone()),
            Entry::Vacant(vacant) => {
                // The previous leader stores its value before leaving the
                // in-flight map, so a second look here cannot miss it.
                if let Some(value) = self.get(key) {
                    return Ok(value);
                }
                let (tx, rx) = watch::channel(None);
                vacant.insert(rx);
                Ok(tx)
            }
        };

        match leader {
            Ok(tx) => {
                let guard = InflightGuard {
                    inflight: &self.inflight,
                    key,
                };
                let result = fill().await.map_err(|e| CacheError::Fill(Arc::new(e)));
                if let Ok(value) = &result {
                    self.set(key, value.clone(), ttl);
                }
                drop(guard);
                // No receivers left is fine: nobody was waiting.
                let _ = tx.send(Some(result.clone()));
                result
            }
            Err(mut rx) => {
                tracing::debug!(key, "waiting for in-flight fill");
                let outcome = rx.wait_for(Option::is_some).await;
                match outcome {
                    Ok(shared) => shared
                        .clone()
                        .unwrap_or_else(|| Err(CacheError::Abandoned(key.to_string()))),
                    Err(_) => Err(CacheError::Abandoned(key.to_string())),
                }
            }
        }
    }

    /// Periodically evict expired entries until `cancel` fires.
    pub fn spawn_sweeper(
        self: Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let evicted = self.evict_expired();
                        if evicted > 0 {
                            tracing::debug!(evicted, remaining = self.len(), "evicted expired cache entries");
                        }
                    }
                }
            }
        })
    }
}

/// Removes the in-flight marker even when the leader's future is dropped
/// mid-fill; waiters then observe a closed channel.
struct InflightGuard<'a, V> {
    inflight: &'a DashMap<String, watch::Receiver<Option<FillResult<V>>>>,
    key: &'a str,
}

impl<V> Drop for InflightGuard<'_, V> {
    fn drop(&mut self) {
        self.inflight.remove(self.key);
    }
}
