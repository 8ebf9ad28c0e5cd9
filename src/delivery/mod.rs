//! Delivery pipeline.
//!
//! Turns a stored object (or a response fetched on the lookup path) into the
//! response a particular client gets: conditional `304`s, gunzip for clients
//! without gzip, byte ranges, `Age`, `Accept-Ranges` and HEAD handling.
//! Passed responses never come through here.

use std::time::Duration;

use tracing::warn;

use crate::http::{Method, Request, Response, StatusCode};

pub mod conditional;
pub mod encoding;
pub mod range;
pub mod vary;

/// Per-client finishing of a lookup-path response.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use edgecache::delivery::Delivery;
/// use edgecache::http::{Method, Request, Response, StatusCode};
///
/// let request = Request::new(Method::Get, "/").with_header("Range", "bytes=0-1");
/// let response = Delivery::new(&request)
///     .cached(Duration::from_secs(3))
///     .finish(Response::new(StatusCode::OK).body("hello"));
///
/// assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
/// assert_eq!(response.headers().get("age"), Some("3"));
/// assert_eq!(response.headers().get("accept-ranges"), Some("bytes"));
/// assert_eq!(response.content().as_ref(), b"he");
/// ```
#[derive(Debug, Clone, Copy)]
pub struct Delivery<'a> {
    request: &'a Request,
    age: Option<Duration>,
    gunzip: bool,
}

impl<'a> Delivery<'a> {
    pub fn new(request: &'a Request) -> Self {
        Self {
            request,
            age: None,
            gunzip: false,
        }
    }

    /// Marks the response as served from a stored object of the given age.
    #[must_use]
    pub fn cached(mut self, age: Duration) -> Self {
        self.age = Some(age);
        self
    }

    /// Decompress gzip bodies for clients that do not accept gzip.
    #[must_use]
    pub fn gunzip(mut self, enabled: bool) -> Self {
        self.gunzip = enabled;
        self
    }

    pub fn finish(self, mut response: Response) -> Response {
        let request_headers = self.request.headers();

        if let Some(age) = self.age {
            response.headers_mut().set("Age", age.as_secs().to_string());
        }

        if response.status() == StatusCode::OK
            && conditional::is_not_modified(request_headers, response.headers())
        {
            response = conditional::not_modified(response);
        } else {
            if self.gunzip && !encoding::accepts_gzip(request_headers) {
                if let Err(error) = encoding::decompress(&mut response) {
                    warn!(path = self.request.path(), %error, "gunzip failed, delivering encoded body");
                }
            }
            response = range::apply(response, request_headers.get("range"));
        }

        if self.age.is_some()
            && matches!(
                response.status(),
                StatusCode::OK | StatusCode::PARTIAL_CONTENT | StatusCode::NOT_MODIFIED
            )
        {
            response.headers_mut().set("Accept-Ranges", "bytes");
        }

        if *self.request.method() == Method::Head {
            head(&mut response);
        }
        response
    }
}

/// Strips the body of a HEAD response, advertising the length it would have had.
pub fn head(response: &mut Response) {
    if response.content().is_empty() {
        return;
    }
    let len = response.content().len();
    response.headers_mut().set("Content-Length", len.to_string());
    response.set_content(bytes::Bytes::new());
}
