//! Stored response snapshots and their lifecycle windows.

use std::time::Duration;

use bytes::Bytes;
use tokio::time::Instant;

use super::freshness::Freshness;
use super::key::Variant;
use crate::http::{Headers, Response, StatusCode};

/// Whether, and how, a backend response may be stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cacheability {
    Cacheable,
    /// Stored only as an empty marker that sends later misses straight to
    /// the backend without coalescing.
    HitForMiss,
    Uncacheable,
}

/// Validators used to build conditional revalidation requests.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Validators {
    pub etag: Option<String>,
    pub last_modified: Option<String>,
}

impl Validators {
    pub fn from_headers(headers: &Headers) -> Self {
        Self {
            etag: headers.get("etag").map(str::to_owned),
            last_modified: headers.get("last-modified").map(str::to_owned),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.etag.is_none() && self.last_modified.is_none()
    }
}

/// Where an object's age falls within its retention window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectState {
    /// Within TTL: deliverable as is.
    Fresh,
    /// Past TTL but within grace: deliverable while revalidated in the background.
    Grace,
    /// Past grace but within keep: usable only as a validation basis.
    Keep,
    /// Past the whole window.
    Expired,
}

/// An immutable snapshot of a backend response.
///
/// Objects are shared behind `Arc`; a revalidation inserts a new object
/// rather than mutating an existing one, so a reader never observes a
/// half-updated response. The body is a [`Bytes`] handle, so handing it to
/// a client is a reference-count bump.
#[derive(Debug, Clone)]
pub struct CacheObject {
    status: StatusCode,
    headers: Headers,
    body: Bytes,
    inserted_at: Instant,
    initial_age: Duration,
    ttl: Duration,
    grace: Duration,
    keep: Duration,
    vary: Vec<String>,
    variant: Variant,
    validators: Validators,
    cacheability: Cacheability,
}

impl CacheObject {
    /// Seals a response into an object inserted at `now`.
    pub fn new(response: Response, freshness: &Freshness, variant: Variant, now: Instant) -> Self {
        let (status, headers, body) = response.into_parts();
        let vary = super::key::vary_names(&headers);
        let validators = Validators::from_headers(&headers);
        Self {
            status,
            headers,
            body,
            inserted_at: now,
            initial_age: freshness.initial_age(),
            ttl: freshness.ttl(),
            grace: freshness.grace(),
            keep: freshness.keep(),
            vary,
            variant,
            validators,
            cacheability: freshness.cacheability(),
        }
    }

    /// Creates an empty hit-for-miss marker living for `ttl`.
    pub fn hit_for_miss_marker(ttl: Duration, variant: Variant, now: Instant) -> Self {
        Self {
            status: StatusCode::OK,
            headers: Headers::new(),
            body: Bytes::new(),
            inserted_at: now,
            initial_age: Duration::ZERO,
            ttl,
            grace: Duration::ZERO,
            keep: Duration::ZERO,
            vary: Vec::new(),
            variant,
            validators: Validators::default(),
            cacheability: Cacheability::HitForMiss,
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn grace(&self) -> Duration {
        self.grace
    }

    pub fn keep(&self) -> Duration {
        self.keep
    }

    pub fn vary(&self) -> &[String] {
        &self.vary
    }

    pub fn variant(&self) -> &Variant {
        &self.variant
    }

    pub fn validators(&self) -> &Validators {
        &self.validators
    }

    pub fn cacheability(&self) -> Cacheability {
        self.cacheability
    }

    pub fn is_hit_for_miss(&self) -> bool {
        self.cacheability == Cacheability::HitForMiss
    }

    /// Time spent in the store, excluding any age reported by the backend.
    pub fn resident_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.inserted_at)
    }

    /// Current age: backend-reported age plus time resident in the store.
    pub fn age(&self, now: Instant) -> Duration {
        self.initial_age.saturating_add(self.resident_for(now))
    }

    /// TTL left at `now`; zero once stale.
    pub fn remaining_ttl(&self, now: Instant) -> Duration {
        self.ttl.saturating_sub(self.resident_for(now))
    }

    /// Full retention window: TTL, grace and keep.
    pub fn retention(&self) -> Duration {
        self.ttl.saturating_add(self.grace).saturating_add(self.keep)
    }

    /// Evaluates the lifecycle state at `now`, with grace limited to
    /// `grace_cap` when a request supplied one.
    ///
    /// # Examples
    ///
    /// ```
    /// use std::time::Duration;
    /// use edgecache::cache::{CacheObject, ObjectState, Variant};
    /// use tokio::time::Instant;
    ///
    /// let now = Instant::now();
    /// let marker = CacheObject::hit_for_miss_marker(Duration::from_secs(5), Variant::default(), now);
    /// assert_eq!(marker.state_at(now, None), ObjectState::Fresh);
    /// assert_eq!(marker.state_at(now + Duration::from_secs(5), None), ObjectState::Expired);
    /// ```
    pub fn state_at(&self, now: Instant, grace_cap: Option<Duration>) -> ObjectState {
        let resident = self.resident_for(now);
        let grace = grace_cap.map_or(self.grace, |cap| cap.min(self.grace));
        let grace_end = self.ttl.saturating_add(grace);
        if resident < self.ttl {
            ObjectState::Fresh
        } else if resident < grace_end {
            ObjectState::Grace
        } else if resident < grace_end.saturating_add(self.keep) {
            ObjectState::Keep
        } else {
            ObjectState::Expired
        }
    }

    /// Returns `true` once the full retention window has elapsed.
    pub fn is_expired(&self, now: Instant) -> bool {
        self.resident_for(now) >= self.retention()
    }

    /// Builds a client response sharing this object's body.
    pub fn to_response(&self) -> Response {
        Response::from_parts(self.status, self.headers.clone(), self.body.clone())
    }
}
