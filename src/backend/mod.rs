//! The origin collaborator.
//!
//! The engine only needs something that turns a [`BackendRequest`] into a
//! [`Response`]. [`HttpBackend`] speaks HTTP/1.1 over TCP; [`backend_fn`]
//! wraps an async closure, which is how tests and embedders plug in an
//! in-process origin.

use std::future::Future;
use std::pin::Pin;

use bytes::Bytes;
use thiserror::Error;

use crate::http::{Headers, Method, Request, Response};

pub mod http;

pub use self::http::HttpBackend;

/// Heap-allocated, type-erased future returned by [`Backend::fetch`].
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Failures that prevent a backend response from being received at all.
///
/// A response that *was* received, whatever its status, is not an error.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed backend response: {0}")]
    Malformed(String),

    #[error("backend unavailable: {0}")]
    Unavailable(String),
}

/// A request on its way to the origin.
#[derive(Debug, Clone)]
pub struct BackendRequest {
    method: Method,
    target: String,
    headers: Headers,
    body: Bytes,
    background: bool,
    conditional: bool,
}

impl BackendRequest {
    /// Copies method, target, headers and body from a client request.
    pub fn from_request(request: &Request) -> Self {
        Self {
            method: request.method().clone(),
            target: request.target(),
            headers: request.headers().clone(),
            body: request.body().clone(),
            background: false,
            conditional: false,
        }
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn set_method(&mut self, method: Method) {
        self.method = method;
    }

    /// Path and query, as sent on the request line.
    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut Headers {
        &mut self.headers
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// `true` for grace-triggered refreshes no client is waiting on.
    pub fn is_background(&self) -> bool {
        self.background
    }

    /// `true` when the engine attached validators from a stored object.
    pub fn is_conditional(&self) -> bool {
        self.conditional
    }

    pub(crate) fn set_background(&mut self, background: bool) {
        self.background = background;
    }

    pub(crate) fn set_conditional(&mut self, conditional: bool) {
        self.conditional = conditional;
    }
}

/// An origin server.
pub trait Backend: Send + Sync + 'static {
    /// Sends `request` and resolves to whatever the origin answered.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError`] when no response could be obtained.
    fn fetch(&self, request: BackendRequest) -> BoxFuture<'_, Result<Response, BackendError>>;
}

/// [`Backend`] adapter for async closures; see [`backend_fn`].
pub struct FnBackend<F>(F);

/// Wraps an async closure as a [`Backend`].
///
/// # Examples
///
/// ```
/// use edgecache::backend::{Backend, BackendError, BackendRequest, backend_fn};
/// use edgecache::http::{Method, Request, Response, StatusCode};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let origin = backend_fn(|req: BackendRequest| async move {
///     Ok::<_, BackendError>(
///         Response::new(StatusCode::OK).body(format!("you asked for {}", req.target())),
///     )
/// });
///
/// let request = BackendRequest::from_request(&Request::new(Method::Get, "/x"));
/// let response = origin.fetch(request).await.unwrap();
/// assert_eq!(response.content().as_ref(), b"you asked for /x");
/// # }
/// ```
pub fn backend_fn<F, Fut>(f: F) -> FnBackend<F>
where
    F: Fn(BackendRequest) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Response, BackendError>> + Send + 'static,
{
    FnBackend(f)
}

impl<F, Fut> Backend for FnBackend<F>
where
    F: Fn(BackendRequest) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Response, BackendError>> + Send + 'static,
{
    fn fetch(&self, request: BackendRequest) -> BoxFuture<'_, Result<Response, BackendError>> {
        Box::pin((self.0)(request))
    }
}
