//! Client conditional requests answered from cache.

use crate::http::{Headers, Response, StatusCode, date::parse_http_date};

/// Returns `true` when the client's validators show it already holds the
/// representation described by `response_headers`.
///
/// `If-None-Match` takes precedence; `If-Modified-Since` is only consulted
/// when it is absent.
///
/// # Examples
///
/// ```
/// use edgecache::delivery::conditional::is_not_modified;
/// use edgecache::http::Headers;
///
/// let mut request = Headers::new();
/// request.insert("If-None-Match", "\"a\", W/\"1234\"");
/// let mut response = Headers::new();
/// response.insert("ETag", "\"1234\"");
/// assert!(is_not_modified(&request, &response));
/// ```
pub fn is_not_modified(request_headers: &Headers, response_headers: &Headers) -> bool {
    if let Some(candidates) = request_headers.get_joined("if-none-match") {
        let Some(etag) = response_headers.get("etag") else {
            return candidates.trim() == "*";
        };
        return candidates
            .split(',')
            .map(str::trim)
            .any(|candidate| candidate == "*" || weak_eq(candidate, etag));
    }

    let since = request_headers
        .get("if-modified-since")
        .and_then(parse_http_date);
    let modified = response_headers
        .get("last-modified")
        .and_then(parse_http_date);
    match (since, modified) {
        (Some(since), Some(modified)) => modified <= since,
        _ => false,
    }
}

/// Weak entity-tag comparison: opaque tags equal once `W/` is ignored.
fn weak_eq(a: &str, b: &str) -> bool {
    let strip = |tag: &str| tag.trim().trim_start_matches("W/").to_owned();
    strip(a) == strip(b)
}

/// Turns a full response into the matching `304 Not Modified`.
pub fn not_modified(mut response: Response) -> Response {
    response.set_status(StatusCode::NOT_MODIFIED);
    response.set_content(bytes::Bytes::new());
    let headers = response.headers_mut();
    for name in ["content-length", "content-range", "transfer-encoding"] {
        headers.remove(name);
    }
    response
}
