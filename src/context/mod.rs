//! Per-request context threaded through every policy phase.
//!
//! The engine creates one [`Context`] per client request. Hooks read and
//! mutate it: they may rewrite the request, cap grace, lift the credential
//! bypass, and leave notes for later phases in [`Locals`].

use std::{collections::HashMap, time::Duration};

use crate::http::Request;

/// Free-form string side channel between phases.
///
/// The engine itself writes `cache-status` (`hit`, `miss` or `pass`) and,
/// on pass, `pass-reason`.
#[derive(Default, Debug, Clone)]
pub struct Locals {
    map: HashMap<String, String>,
}

impl Locals {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.map.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.map.get(key).map(String::as_str)
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.map.remove(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.map.contains_key(key)
    }
}

/// Why a request bypassed the cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PassReason {
    /// The method is not GET or HEAD; carries the method name.
    Method(String),
    Authorization,
    Cookie,
    Other,
}

impl PassReason {
    /// Derives the reason for passing `request`, checking the method first,
    /// then `Authorization`, then `Cookie`.
    pub fn classify(request: &Request) -> Self {
        if !request.method().is_cacheable() {
            Self::Method(request.method().as_str().to_owned())
        } else if request.headers().contains("authorization") {
            Self::Authorization
        } else if request.headers().contains("cookie") {
            Self::Cookie
        } else {
            Self::Other
        }
    }

    /// The RFC 9211 `detail` parameter value.
    pub fn detail(&self) -> &str {
        match self {
            Self::Method(name) => name,
            Self::Authorization => "AUTHORIZATION",
            Self::Cookie => "COOKIE",
            Self::Other => "OTHER",
        }
    }
}

/// Outcome of a request with respect to the cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheStatus {
    Hit,
    Miss,
    Pass(PassReason),
}

impl CacheStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Hit => "hit",
            Self::Miss => "miss",
            Self::Pass(_) => "pass",
        }
    }

    /// Renders an RFC 9211 `Cache-Status` field value for the named cache.
    ///
    /// # Examples
    ///
    /// ```
    /// use edgecache::context::{CacheStatus, PassReason};
    ///
    /// assert_eq!(CacheStatus::Hit.header_value("edge"), "edge; hit");
    /// assert_eq!(CacheStatus::Miss.header_value("edge"), "edge; fwd=miss");
    /// assert_eq!(
    ///     CacheStatus::Pass(PassReason::Method("POST".into())).header_value("edge"),
    ///     "edge; fwd=method; detail=POST"
    /// );
    /// assert_eq!(
    ///     CacheStatus::Pass(PassReason::Cookie).header_value("edge"),
    ///     "edge; fwd=bypass; detail=COOKIE"
    /// );
    /// ```
    pub fn header_value(&self, cache_name: &str) -> String {
        match self {
            Self::Hit => format!("{cache_name}; hit"),
            Self::Miss => format!("{cache_name}; fwd=miss"),
            Self::Pass(reason @ PassReason::Method(_)) => {
                format!("{cache_name}; fwd=method; detail={}", reason.detail())
            }
            Self::Pass(reason) => {
                format!("{cache_name}; fwd=bypass; detail={}", reason.detail())
            }
        }
    }
}

/// Per-request state handed to every policy hook.
#[derive(Debug)]
pub struct Context {
    request: Request,
    /// Request-scoped cap on grace (`req.grace`), set during receive.
    pub grace_cap: Option<Duration>,
    /// Cache responses to requests carrying `Authorization` or `Cookie`.
    pub allow_credentials: bool,
    locals: Locals,
    cache_status: Option<CacheStatus>,
    object_ttl: Duration,
}

impl Context {
    pub fn new(request: Request) -> Self {
        Self {
            request,
            grace_cap: None,
            allow_credentials: false,
            locals: Locals::new(),
            cache_status: None,
            object_ttl: Duration::ZERO,
        }
    }

    pub fn request(&self) -> &Request {
        &self.request
    }

    pub fn request_mut(&mut self) -> &mut Request {
        &mut self.request
    }

    pub fn locals(&self) -> &Locals {
        &self.locals
    }

    pub fn locals_mut(&mut self) -> &mut Locals {
        &mut self.locals
    }

    pub fn cache_status(&self) -> Option<&CacheStatus> {
        self.cache_status.as_ref()
    }

    /// Records the cache outcome and mirrors it into [`Locals`].
    pub fn set_cache_status(&mut self, status: CacheStatus) {
        self.locals.insert("cache-status", status.as_str());
        match &status {
            CacheStatus::Pass(reason) => self.locals.insert("pass-reason", reason.detail()),
            _ => {
                self.locals.remove("pass-reason");
            }
        }
        self.cache_status = Some(status);
    }

    /// Remaining TTL of the delivered object; zero for passes and fetch errors.
    pub fn object_ttl(&self) -> Duration {
        self.object_ttl
    }

    pub(crate) fn set_object_ttl(&mut self, ttl: Duration) {
        self.object_ttl = ttl;
    }
}
