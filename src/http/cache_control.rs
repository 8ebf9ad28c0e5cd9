//! `Cache-Control` response directive parsing (RFC 9111 §5.2).

use std::time::Duration;

use super::Headers;

/// The `Cache-Control` directives the engine acts on.
///
/// Numeric directives hold `None` when absent *or* malformed: a
/// `stale-while-revalidate` without a valid number is ignored rather than
/// read as zero. When a directive appears more than once the first
/// occurrence wins.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use edgecache::http::{CacheControl, Headers};
///
/// let mut headers = Headers::new();
/// headers.insert("Cache-Control", "public, max-age=60, stale-while-revalidate");
///
/// let cc = CacheControl::from_headers(&headers);
/// assert_eq!(cc.max_age, Some(Duration::from_secs(60)));
/// assert_eq!(cc.stale_while_revalidate, None);
/// assert!(!cc.no_store);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheControl {
    pub max_age: Option<Duration>,
    pub s_maxage: Option<Duration>,
    pub stale_while_revalidate: Option<Duration>,
    pub no_store: bool,
    pub no_cache: bool,
    pub private: bool,
}

impl CacheControl {
    /// Parses every `Cache-Control` field in `headers`.
    pub fn from_headers(headers: &Headers) -> Self {
        let mut cc = Self::default();
        for directive in headers.tokens("cache-control") {
            cc.apply(directive);
        }
        cc
    }

    /// Parses a single field value.
    pub fn parse(value: &str) -> Self {
        let mut cc = Self::default();
        for directive in value.split(',').map(str::trim).filter(|d| !d.is_empty()) {
            cc.apply(directive);
        }
        cc
    }

    fn apply(&mut self, directive: &str) {
        let (name, value) = match directive.split_once('=') {
            Some((n, v)) => (n.trim(), Some(v.trim())),
            None => (directive, None),
        };

        match name.to_ascii_lowercase().as_str() {
            "max-age" => first(&mut self.max_age, value),
            "s-maxage" => first(&mut self.s_maxage, value),
            "stale-while-revalidate" => first(&mut self.stale_while_revalidate, value),
            "no-store" => self.no_store = true,
            "no-cache" => self.no_cache = true,
            "private" => self.private = true,
            _ => {}
        }
    }
}

fn first(slot: &mut Option<Duration>, value: Option<&str>) {
    if slot.is_none() {
        *slot = value.and_then(parse_seconds);
    }
}

/// Delta-seconds: ASCII digits only, optionally quoted.
fn parse_seconds(raw: &str) -> Option<Duration> {
    let digits = raw
        .strip_prefix('"')
        .and_then(|s| s.strip_suffix('"'))
        .unwrap_or(raw);
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    // Values beyond u64 saturate instead of being rejected (RFC 9111 §1.2.2).
    Some(Duration::from_secs(digits.parse().unwrap_or(u64::MAX)))
}
