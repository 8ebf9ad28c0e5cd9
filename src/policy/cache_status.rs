//! RFC 9211 `Cache-Status` and `X-Cache` annotation.

use super::{
    BackendContext, BackendResponseAction, DefaultPolicy, Policy, PolicyError, ReceiveAction,
};
use crate::backend::BackendRequest;
use crate::cache::CacheObject;
use crate::context::Context;
use crate::engine::FetchError;
use crate::http::Response;

/// Wraps another policy and, on delivery, reports how the request was
/// served: `Cache-Status: <name>; hit` (or `fwd=miss`, `fwd=method`,
/// `fwd=bypass` with a `detail`) and `X-Cache: hit|miss|pass`.
///
/// # Examples
///
/// ```
/// use edgecache::policy::{CacheStatusPolicy, DefaultPolicy};
///
/// let policy = CacheStatusPolicy::new("edge");
/// let wrapped = CacheStatusPolicy::wrap("edge", DefaultPolicy);
/// assert_eq!(policy.name(), wrapped.name());
/// ```
#[derive(Debug, Clone)]
pub struct CacheStatusPolicy<P = DefaultPolicy> {
    name: String,
    inner: P,
}

impl CacheStatusPolicy<DefaultPolicy> {
    pub fn new(name: impl Into<String>) -> Self {
        Self::wrap(name, DefaultPolicy)
    }
}

impl<P: Policy> CacheStatusPolicy<P> {
    pub fn wrap(name: impl Into<String>, inner: P) -> Self {
        Self {
            name: name.into(),
            inner,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl<P: Policy> Policy for CacheStatusPolicy<P> {
    fn on_receive(&self, ctx: &mut Context) -> Result<ReceiveAction, PolicyError> {
        self.inner.on_receive(ctx)
    }

    fn on_hit(&self, ctx: &mut Context, object: &CacheObject) -> Result<(), PolicyError> {
        self.inner.on_hit(ctx, object)
    }

    fn on_miss(&self, ctx: &mut Context) -> Result<(), PolicyError> {
        self.inner.on_miss(ctx)
    }

    fn on_pass(&self, ctx: &mut Context) -> Result<(), PolicyError> {
        self.inner.on_pass(ctx)
    }

    fn on_backend_fetch(&self, bereq: &mut BackendRequest) -> Result<(), PolicyError> {
        self.inner.on_backend_fetch(bereq)
    }

    fn on_backend_response(
        &self,
        ctx: &mut BackendContext<'_>,
    ) -> Result<BackendResponseAction, PolicyError> {
        self.inner.on_backend_response(ctx)
    }

    fn on_backend_error(
        &self,
        ctx: &mut Context,
        error: &FetchError,
    ) -> Result<Response, PolicyError> {
        self.inner.on_backend_error(ctx, error)
    }

    fn on_deliver(&self, ctx: &mut Context, response: &mut Response) -> Result<(), PolicyError> {
        self.inner.on_deliver(ctx, response)?;
        if let Some(status) = ctx.cache_status() {
            let headers = response.headers_mut();
            headers.set("Cache-Status", status.header_value(&self.name));
            headers.set("X-Cache", status.as_str());
        }
        Ok(())
    }
}
