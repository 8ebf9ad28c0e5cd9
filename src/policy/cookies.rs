//! Cookie filtering for requests that should stay cacheable.

use crate::http::Request;

/// Removes every cookie from `request` except those named in `keep`.
///
/// Multiple `Cookie` fields are merged into one. When nothing survives the
/// header is removed entirely, so the request no longer counts as carrying
/// cookies.
///
/// # Examples
///
/// ```
/// use edgecache::http::{Method, Request};
/// use edgecache::policy::cookies::retain_only;
///
/// let mut request = Request::new(Method::Get, "/")
///     .with_header("Cookie", "a=b=3; __prerender_bypass=1; foo=bar=2");
/// retain_only(&mut request, &["__prerender_bypass", "__n-p-d"]);
/// assert_eq!(request.headers().get("cookie"), Some("__prerender_bypass=1"));
///
/// let mut request = Request::new(Method::Get, "/").with_header("Cookie", "foo=bar");
/// retain_only(&mut request, &["__prerender_bypass"]);
/// assert!(!request.headers().contains("cookie"));
/// ```
pub fn retain_only(request: &mut Request, keep: &[&str]) {
    let Some(cookies) = request.headers().get_joined("cookie") else {
        return;
    };

    let kept: Vec<&str> = cookies
        .split(';')
        .map(str::trim)
        .filter(|pair| {
            let name = pair.split_once('=').map_or(*pair, |(name, _)| name);
            !pair.is_empty() && keep.contains(&name.trim())
        })
        .collect();

    let headers = request.headers_mut();
    if kept.is_empty() {
        headers.remove("cookie");
    } else {
        headers.set("Cookie", kept.join("; "));
    }
}
