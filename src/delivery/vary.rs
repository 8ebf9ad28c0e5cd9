//! `Vary` maintenance.

use crate::http::Headers;

/// Adds `name` to the response's `Vary` list unless it is already named
/// (or the list is `*`). Existing values are preserved and merged into a
/// single field.
///
/// # Examples
///
/// ```
/// use edgecache::delivery::vary::append;
/// use edgecache::http::Headers;
///
/// let mut headers = Headers::new();
/// headers.insert("Vary", "Accept-Encoding");
/// append(&mut headers, "Origin");
/// append(&mut headers, "origin");
/// assert_eq!(headers.get("vary"), Some("Accept-Encoding, Origin"));
/// ```
pub fn append(headers: &mut Headers, name: &str) {
    let mut names: Vec<String> = headers.tokens("vary").map(str::to_owned).collect();
    if names.iter().any(|n| n == "*" || n.eq_ignore_ascii_case(name)) {
        return;
    }
    names.push(name.to_owned());
    headers.remove("vary");
    headers.insert("Vary", names.join(", "));
}

/// Ensures CORS responses vary on `Origin`. Returns `true` when any
/// `Access-Control-Allow-*` header is present.
pub fn vary_on_origin_for_cors(headers: &mut Headers) -> bool {
    let cors = headers
        .iter()
        .any(|(name, _)| name.to_ascii_lowercase().starts_with("access-control-allow-"));
    if cors {
        append(headers, "Origin");
    }
    cors
}
