//! Cache keys and Vary-selected request variants.

use std::fmt;

use crate::http::{Headers, Method, Request};

/// Identifies a URL in the object store.
///
/// HEAD requests share the GET key: the engine always fetches and stores the
/// full GET representation and strips the body on delivery. Header-dependent
/// selection between variants of the same URL is done by [`Variant`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    method: Method,
    scheme: String,
    host: String,
    path: String,
    query: Option<String>,
}

impl CacheKey {
    /// Derives the key for `request`, or `None` if its method is not cacheable.
    ///
    /// # Examples
    ///
    /// ```
    /// use edgecache::cache::CacheKey;
    /// use edgecache::http::{Method, Request};
    ///
    /// let get = Request::new(Method::Get, "/a?b=1").with_header("Host", "example.com");
    /// let head = Request::new(Method::Head, "/a?b=1").with_header("Host", "example.com");
    /// assert_eq!(CacheKey::from_request(&get), CacheKey::from_request(&head));
    /// assert!(CacheKey::from_request(&Request::new(Method::Post, "/a")).is_none());
    /// ```
    pub fn from_request(request: &Request) -> Option<Self> {
        if !request.method().is_cacheable() {
            return None;
        }
        Some(Self {
            method: Method::Get,
            scheme: request.scheme().to_owned(),
            host: request.host().unwrap_or_default().to_owned(),
            path: request.path().to_owned(),
            query: request.query_string().map(str::to_owned),
        })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn path(&self) -> &str {
        &self.path
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}://{}{}", self.method, self.scheme, self.host, self.path)?;
        if let Some(q) = &self.query {
            write!(f, "?{q}")?;
        }
        Ok(())
    }
}

/// Returns the lowercase header names listed in a response's `Vary` fields,
/// deduplicated, in order of first appearance.
pub fn vary_names(headers: &Headers) -> Vec<String> {
    let mut names: Vec<String> = Vec::new();
    for token in headers.tokens("vary") {
        let name = token.to_ascii_lowercase();
        if !names.contains(&name) {
            names.push(name);
        }
    }
    names
}

/// The request header values a stored object was selected by.
///
/// Captured from the request that caused the fetch, restricted to the names
/// in the response's `Vary` set. An absent header is recorded as `None` and
/// only matches requests that also lack it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Variant {
    fields: Vec<(String, Option<String>)>,
    wildcard: bool,
}

impl Variant {
    /// Records `request_headers` values for each name in `vary`.
    pub fn capture(vary: &[String], request_headers: &Headers) -> Self {
        let mut variant = Self::default();
        for name in vary {
            if name == "*" {
                variant.wildcard = true;
                continue;
            }
            variant
                .fields
                .push((name.clone(), request_headers.get_joined(name)));
        }
        variant
    }

    /// Returns `true` if `request_headers` select this variant.
    ///
    /// `Vary: *` never matches.
    pub fn matches(&self, request_headers: &Headers) -> bool {
        !self.wildcard
            && self
                .fields
                .iter()
                .all(|(name, value)| request_headers.get_joined(name) == *value)
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty() && !self.wildcard
    }
}
