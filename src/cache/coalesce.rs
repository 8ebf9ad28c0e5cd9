//! Request coalescing.
//!
//! At most one fetch per key is in flight. The first requester becomes the
//! leader and holds a [`FetchGuard`]; everyone arriving while it runs gets a
//! [`Subscription`] and awaits the leader's published result on a
//! `tokio::sync::watch` channel. A leader that goes away without publishing
//! (error path, cancelled task) wakes its followers with nothing, and they
//! decide for themselves what to do next.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::watch;
use tracing::debug;

use super::key::CacheKey;

struct Flight<T> {
    id: u64,
    rx: watch::Receiver<Option<T>>,
}

/// Registry of in-flight fetches, keyed by [`CacheKey`].
///
/// Cloning is cheap and clones share the registry.
pub struct Coalescer<T> {
    flights: Arc<DashMap<CacheKey, Flight<T>>>,
    refreshes: Arc<DashMap<CacheKey, ()>>,
    next_id: Arc<AtomicU64>,
}

impl<T> Clone for Coalescer<T> {
    fn clone(&self) -> Self {
        Self {
            flights: Arc::clone(&self.flights),
            refreshes: Arc::clone(&self.refreshes),
            next_id: Arc::clone(&self.next_id),
        }
    }
}

impl<T> Default for Coalescer<T> {
    fn default() -> Self {
        Self {
            flights: Arc::new(DashMap::new()),
            refreshes: Arc::new(DashMap::new()),
            next_id: Arc::new(AtomicU64::new(0)),
        }
    }
}

/// Role handed out by [`Coalescer::join`].
pub enum Join<T> {
    Leader(FetchGuard<T>),
    Follower(Subscription<T>),
}

impl<T: Clone + Send + Sync + 'static> Coalescer<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers interest in `key`: leads a new fetch if none is running,
    /// otherwise subscribes to the running one.
    ///
    /// # Examples
    ///
    /// ```
    /// use edgecache::cache::{CacheKey, Coalescer, Join};
    /// use edgecache::http::{Method, Request};
    ///
    /// # #[tokio::main(flavor = "current_thread")]
    /// # async fn main() {
    /// let key = CacheKey::from_request(&Request::new(Method::Get, "/")).unwrap();
    /// let coalescer: Coalescer<u32> = Coalescer::new();
    ///
    /// let Join::Leader(guard) = coalescer.join(&key) else { unreachable!() };
    /// let Join::Follower(sub) = coalescer.join(&key) else { unreachable!() };
    ///
    /// guard.publish(7);
    /// assert_eq!(sub.wait().await, Some(7));
    /// assert_eq!(coalescer.in_flight(), 0);
    /// # }
    /// ```
    pub fn join(&self, key: &CacheKey) -> Join<T> {
        match self.flights.entry(key.clone()) {
            Entry::Occupied(flight) => Join::Follower(Subscription {
                rx: flight.get().rx.clone(),
            }),
            Entry::Vacant(slot) => {
                let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                let (tx, rx) = watch::channel(None);
                slot.insert(Flight { id, rx });
                debug!(key = %key, flight = id, "fetch registered");
                Join::Leader(FetchGuard {
                    key: key.clone(),
                    id,
                    tx: Some(tx),
                    flights: Arc::clone(&self.flights),
                })
            }
        }
    }

    /// Number of fetches currently in flight.
    pub fn in_flight(&self) -> usize {
        self.flights.len()
    }

    /// Claims the single background-refresh slot for `key`, or returns
    /// `None` if a refresh is already running.
    pub fn try_refresh(&self, key: &CacheKey) -> Option<RefreshGuard> {
        match self.refreshes.entry(key.clone()) {
            Entry::Occupied(_) => None,
            Entry::Vacant(slot) => {
                slot.insert(());
                Some(RefreshGuard {
                    key: key.clone(),
                    refreshes: Arc::clone(&self.refreshes),
                })
            }
        }
    }
}

/// Leadership of an in-flight fetch. Publish the result, or drop the guard
/// to release waiters empty-handed.
pub struct FetchGuard<T> {
    key: CacheKey,
    id: u64,
    tx: Option<watch::Sender<Option<T>>>,
    flights: Arc<DashMap<CacheKey, Flight<T>>>,
}

impl<T> FetchGuard<T> {
    /// Wakes every follower with `value` and retires the flight.
    pub fn publish(mut self, value: T) {
        if let Some(tx) = self.tx.take() {
            tx.send_replace(Some(value));
            self.retire();
        }
    }

    fn retire(&self) {
        self.flights.remove_if(&self.key, |_, flight| flight.id == self.id);
    }
}

impl<T> Drop for FetchGuard<T> {
    fn drop(&mut self) {
        if let Some(tx) = self.tx.take() {
            // Unregister first so woken followers cannot rejoin this flight.
            self.retire();
            drop(tx);
            debug!(key = %self.key, flight = self.id, "fetch abandoned without result");
        }
    }
}

/// A follower's view of someone else's fetch.
pub struct Subscription<T> {
    rx: watch::Receiver<Option<T>>,
}

impl<T: Clone> Subscription<T> {
    /// Waits for the leader. `None` means the leader gave up.
    pub async fn wait(mut self) -> Option<T> {
        loop {
            if let Some(value) = self.rx.borrow_and_update().clone() {
                return Some(value);
            }
            if self.rx.changed().await.is_err() {
                return self.rx.borrow().clone();
            }
        }
    }
}

/// The background-refresh slot for one key, released on drop.
pub struct RefreshGuard {
    key: CacheKey,
    refreshes: Arc<DashMap<CacheKey, ()>>,
}

impl Drop for RefreshGuard {
    fn drop(&mut self) {
        self.refreshes.remove(&self.key);
    }
}
