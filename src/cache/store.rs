//! Object storage.
//!
//! [`Storage`] is the pluggable interface the engine talks to;
//! [`MemoryStorage`] is the in-memory implementation. Each URL maps to the
//! list of its stored variants, newest last. Objects are handed out as
//! `Arc<CacheObject>`, so a reader keeps a consistent snapshot even if the
//! object is replaced or evicted while the response is being formatted.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;
use tracing::debug;

use super::key::CacheKey;
use super::object::{CacheObject, ObjectState};
use crate::http::Headers;

/// Why a stale object can still be used.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Staleness {
    /// Within grace: serve now, refresh in the background.
    Grace,
    /// Within keep: revalidate synchronously, conditionally if possible.
    Keep,
}

/// Result of a store lookup.
#[derive(Debug, Clone)]
pub enum Lookup {
    Fresh(Arc<CacheObject>),
    Stale(Arc<CacheObject>, Staleness),
    /// A live hit-for-miss marker: fetch without coalescing.
    HitForMiss(Arc<CacheObject>),
    Miss,
}

/// Concurrent key to object table.
///
/// Implementations must be safe to call from many tasks at once and must
/// never expose a partially written object: inserts replace whole `Arc`s.
pub trait Storage: Send + Sync {
    /// Finds the newest live variant of `key` selected by `request_headers`.
    ///
    /// `grace_cap` limits each object's grace window for this lookup only.
    fn lookup(
        &self,
        key: &CacheKey,
        request_headers: &Headers,
        now: Instant,
        grace_cap: Option<Duration>,
    ) -> Lookup;

    /// Stores `object`, displacing every variant `request_headers` would
    /// have selected.
    fn insert(&self, key: CacheKey, object: Arc<CacheObject>, request_headers: &Headers);

    /// Removes the variants of `key` selected by `request_headers`.
    fn invalidate(&self, key: &CacheKey, request_headers: &Headers) -> bool;

    /// Removes every variant of `key`.
    fn evict(&self, key: &CacheKey) -> bool;

    /// Drops objects whose retention window has elapsed. Returns how many
    /// were removed.
    fn sweep(&self, now: Instant) -> usize;

    /// Number of stored objects, markers included.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// In-memory [`Storage`] on a sharded [`DashMap`].
///
/// Locking is per shard, so lookups and inserts for unrelated keys do not
/// contend.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    entries: DashMap<CacheKey, Vec<Arc<CacheObject>>>,
    objects: AtomicUsize,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drops expired variants of `key`, and the key itself once empty.
    fn prune(&self, key: &CacheKey, now: Instant) {
        let mut removed = 0;
        if let Some(mut variants) = self.entries.get_mut(key) {
            let before = variants.len();
            variants.retain(|o| !o.is_expired(now));
            removed = before - variants.len();
        }
        self.entries.remove_if(key, |_, variants| variants.is_empty());
        if removed > 0 {
            self.objects.fetch_sub(removed, Ordering::Relaxed);
            debug!(key = %key, removed, "pruned expired objects");
        }
    }
}

impl Storage for MemoryStorage {
    fn lookup(
        &self,
        key: &CacheKey,
        request_headers: &Headers,
        now: Instant,
        grace_cap: Option<Duration>,
    ) -> Lookup {
        let mut saw_expired = false;
        let mut found = Lookup::Miss;

        if let Some(variants) = self.entries.get(key) {
            for object in variants.iter().rev() {
                let state = object.state_at(now, grace_cap);
                if object.is_expired(now) {
                    saw_expired = true;
                }
                if !object.variant().matches(request_headers) {
                    continue;
                }
                let hit = match (state, object.is_hit_for_miss()) {
                    (ObjectState::Expired, _) => continue,
                    (ObjectState::Fresh, true) => Lookup::HitForMiss(Arc::clone(object)),
                    (_, true) => continue,
                    (ObjectState::Fresh, false) => Lookup::Fresh(Arc::clone(object)),
                    (ObjectState::Grace, false) => {
                        Lookup::Stale(Arc::clone(object), Staleness::Grace)
                    }
                    (ObjectState::Keep, false) => Lookup::Stale(Arc::clone(object), Staleness::Keep),
                };
                found = hit;
                break;
            }
        }

        // The read guard is gone; safe to take the shard's write lock.
        if saw_expired {
            self.prune(key, now);
        }
        found
    }

    fn insert(&self, key: CacheKey, object: Arc<CacheObject>, request_headers: &Headers) {
        let mut variants = self.entries.entry(key).or_default();
        let before = variants.len();
        variants.retain(|o| !o.variant().matches(request_headers));
        let displaced = before - variants.len();
        self.objects.fetch_add(1, Ordering::Relaxed);
        variants.push(object);
        debug!(key = %variants.key(), displaced, variants = variants.len(), "object inserted");
        drop(variants);
        self.objects.fetch_sub(displaced, Ordering::Relaxed);
    }

    fn invalidate(&self, key: &CacheKey, request_headers: &Headers) -> bool {
        let mut removed = 0;
        if let Some(mut variants) = self.entries.get_mut(key) {
            let before = variants.len();
            variants.retain(|o| !o.variant().matches(request_headers));
            removed = before - variants.len();
        }
        self.entries.remove_if(key, |_, variants| variants.is_empty());
        if removed > 0 {
            self.objects.fetch_sub(removed, Ordering::Relaxed);
            debug!(key = %key, removed, "variants invalidated");
        }
        removed > 0
    }

    fn evict(&self, key: &CacheKey) -> bool {
        match self.entries.remove(key) {
            Some((_, variants)) => {
                self.objects.fetch_sub(variants.len(), Ordering::Relaxed);
                debug!(key = %key, removed = variants.len(), "key evicted");
                true
            }
            None => false,
        }
    }

    fn sweep(&self, now: Instant) -> usize {
        let mut removed = 0;
        self.entries.retain(|_, variants| {
            let before = variants.len();
            variants.retain(|o| !o.is_expired(now));
            removed += before - variants.len();
            !variants.is_empty()
        });
        if removed > 0 {
            self.objects.fetch_sub(removed, Ordering::Relaxed);
            debug!(removed, remaining = self.len(), "sweep finished");
        }
        removed
    }

    fn len(&self) -> usize {
        self.objects.load(Ordering::Relaxed)
    }
}
