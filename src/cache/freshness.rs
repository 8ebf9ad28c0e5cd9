//! Freshness lifetime, grace and keep computation.
//!
//! [`compute`] derives the windows from a backend response; policy hooks may
//! then adjust them, after which [`Freshness::settle`] applies the rules that
//! must hold whatever the hooks did.

use std::time::Duration;

use chrono::{DateTime, Utc};

use super::object::Cacheability;
use crate::config::Config;
use crate::http::{CacheControl, Headers, StatusCode, date::parse_http_date};

/// Everything [`compute`] looks at.
#[derive(Debug, Clone, Copy)]
pub struct FreshnessInput<'a> {
    pub status: StatusCode,
    pub headers: &'a Headers,
    /// The client request carried `Authorization` or `Cookie` and no hook
    /// allowed caching it.
    pub credentialed: bool,
    pub grace_cap: Option<Duration>,
    /// Wall-clock time the response was received, for `Expires` without `Date`.
    pub now: DateTime<Utc>,
}

/// Lifecycle windows and storage decision for one backend response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Freshness {
    ttl: Duration,
    grace: Duration,
    keep: Duration,
    initial_age: Duration,
    cacheability: Cacheability,
    /// Grace came from `stale-while-revalidate` or a hook rather than the
    /// configured default.
    explicit_grace: bool,
}

impl Freshness {
    /// Windows chosen outright, e.g. by a policy.
    pub fn new(ttl: Duration, grace: Duration, keep: Duration, cacheability: Cacheability) -> Self {
        Self {
            ttl,
            grace,
            keep,
            initial_age: Duration::ZERO,
            cacheability,
            explicit_grace: true,
        }
    }

    fn rejected(cacheability: Cacheability, keep: Duration, initial_age: Duration) -> Self {
        Self {
            ttl: Duration::ZERO,
            grace: Duration::ZERO,
            keep,
            initial_age,
            cacheability,
            explicit_grace: false,
        }
    }

    /// Age the backend reported via the `Age` header.
    #[must_use]
    pub fn with_initial_age(mut self, age: Duration) -> Self {
        self.initial_age = age;
        self
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

    pub fn initial_age(&self) -> Duration {
        self.initial_age
    }

    pub fn cacheability(&self) -> Cacheability {
        self.cacheability
    }

    pub fn set_ttl(&mut self, ttl: Duration) {
        self.ttl = ttl;
    }

    pub fn set_grace(&mut self, grace: Duration) {
        self.grace = grace;
        self.explicit_grace = true;
    }

    pub fn set_keep(&mut self, keep: Duration) {
        self.keep = keep;
    }

    pub fn set_cacheability(&mut self, cacheability: Cacheability) {
        self.cacheability = cacheability;
    }

    /// Applies the rules that hold regardless of hook adjustments:
    ///
    /// - grace never exceeds the request's grace cap;
    /// - a zero TTL with explicit grace gets `grace_only_ttl` so the object is
    ///   retained for its grace window;
    /// - a zero TTL without grace is kept only as a validation basis, which
    ///   needs validators and a keep window; anything else is uncacheable.
    pub fn settle(&mut self, grace_cap: Option<Duration>, has_validators: bool, config: &Config) {
        if let Some(cap) = grace_cap {
            self.grace = self.grace.min(cap);
        }
        if self.cacheability != Cacheability::Cacheable || !self.ttl.is_zero() {
            return;
        }
        if self.explicit_grace && !self.grace.is_zero() {
            self.ttl = config.grace_only_ttl;
        } else if has_validators && !self.keep.is_zero() {
            self.grace = Duration::ZERO;
        } else {
            self.cacheability = Cacheability::Uncacheable;
        }
    }
}

/// Computes TTL, grace, keep and cacheability for a backend response.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use chrono::Utc;
/// use edgecache::cache::{Cacheability, FreshnessInput, compute};
/// use edgecache::config::Config;
/// use edgecache::http::{Headers, StatusCode};
///
/// let mut headers = Headers::new();
/// headers.insert("Cache-Control", "max-age=1, stale-while-revalidate=10");
///
/// let freshness = compute(
///     FreshnessInput {
///         status: StatusCode::OK,
///         headers: &headers,
///         credentialed: false,
///         grace_cap: Some(Duration::from_secs(1)),
///         now: Utc::now(),
///     },
///     &Config::default(),
/// );
/// assert_eq!(freshness.ttl(), Duration::from_secs(1));
/// assert_eq!(freshness.grace(), Duration::from_secs(1));
/// assert_eq!(freshness.cacheability(), Cacheability::Cacheable);
/// ```
pub fn compute(input: FreshnessInput<'_>, config: &Config) -> Freshness {
    let headers = input.headers;
    let cc = CacheControl::from_headers(headers);
    let age = header_age(headers);
    let keep = config.default_keep;

    if cc.no_store {
        return Freshness::rejected(Cacheability::HitForMiss, Duration::ZERO, age);
    }
    if input.credentialed || cc.private || headers.tokens("vary").any(|v| v == "*") {
        return Freshness::rejected(Cacheability::Uncacheable, Duration::ZERO, age);
    }
    if cc.no_cache {
        return Freshness::rejected(Cacheability::Cacheable, keep, age);
    }

    let ttl = match cc.s_maxage.or(cc.max_age) {
        Some(lifetime) => lifetime.saturating_sub(age),
        None => match headers.get("expires") {
            Some(expires) => expires_lifetime(expires, headers, input.now).saturating_sub(age),
            None if input.status.is_heuristically_cacheable() => config.default_ttl,
            None => Duration::ZERO,
        },
    };

    let (grace, explicit_grace) = match cc.stale_while_revalidate {
        Some(swr) => (swr, true),
        None => (config.default_grace, false),
    };

    let mut freshness = Freshness {
        ttl,
        grace,
        keep,
        initial_age: age,
        cacheability: Cacheability::Cacheable,
        explicit_grace,
    };
    if let Some(cap) = input.grace_cap {
        freshness.grace = freshness.grace.min(cap);
    }
    freshness
}

/// `Expires` minus `Date` (or `now` when `Date` is missing or invalid).
/// An unparsable `Expires` means already expired.
fn expires_lifetime(expires: &str, headers: &Headers, now: DateTime<Utc>) -> Duration {
    let Some(expires) = parse_http_date(expires) else {
        return Duration::ZERO;
    };
    let date = headers
        .get("date")
        .and_then(parse_http_date)
        .unwrap_or(now);
    (expires - date).to_std().unwrap_or(Duration::ZERO)
}

fn header_age(headers: &Headers) -> Duration {
    headers
        .get("age")
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map_or(Duration::ZERO, Duration::from_secs)
}
