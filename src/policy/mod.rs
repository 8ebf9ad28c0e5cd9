//! Policy hooks.
//!
//! A [`Policy`] is consulted at fixed phases of every request. Each method
//! has a default that implements the builtin behaviour (see [`builtin`]),
//! so an implementation overrides only the phases it cares about and can
//! fall back to the builtin logic explicitly.
//!
//! | Phase | Method | Decides |
//! |---|---|---|
//! | receive | [`Policy::on_receive`] | lookup, pass or synthetic response |
//! | hit / miss / pass | [`Policy::on_hit`], [`Policy::on_miss`], [`Policy::on_pass`] | annotations |
//! | backend fetch | [`Policy::on_backend_fetch`] | backend request rewrites |
//! | backend response | [`Policy::on_backend_response`] | freshness, gzip, abandon |
//! | backend error | [`Policy::on_backend_error`] | the error response |
//! | deliver | [`Policy::on_deliver`] | final client response |
//!
//! Hooks run inside a panic guard: a panic or a [`PolicyError`] is handled
//! like an unreachable backend and never unwinds into the engine.

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::time::Duration;

use thiserror::Error;

use crate::backend::BackendRequest;
use crate::cache::{CacheObject, Cacheability, Freshness};
use crate::context::Context;
use crate::engine::FetchError;
use crate::http::{Request, Response};

pub mod builtin;
pub mod cache_status;
pub mod cookies;

pub use cache_status::CacheStatusPolicy;

/// Error a hook returns to abort the current phase.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct PolicyError(String);

impl PolicyError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// The phase a hook ran in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Receive,
    Hit,
    Miss,
    Pass,
    BackendFetch,
    BackendResponse,
    BackendError,
    Deliver,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Receive => "receive",
            Self::Hit => "hit",
            Self::Miss => "miss",
            Self::Pass => "pass",
            Self::BackendFetch => "backend_fetch",
            Self::BackendResponse => "backend_response",
            Self::BackendError => "backend_error",
            Self::Deliver => "deliver",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of the receive phase.
#[derive(Debug)]
pub enum ReceiveAction {
    Lookup,
    Pass,
    /// Answer directly without touching cache or backend.
    Synthesize(Response),
}

/// Outcome of the backend-response phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendResponseAction {
    /// Continue with the (possibly mutated) response.
    Deliver,
    /// Discard the response. For a background refresh the stale object stays
    /// authoritative; a client waiting on the fetch gets a backend error.
    Abandon,
}

/// The backend response under construction, as exposed to
/// [`Policy::on_backend_response`].
#[derive(Debug)]
pub struct Beresp {
    response: Response,
    freshness: Freshness,
    do_gzip: bool,
}

impl Beresp {
    pub(crate) fn new(response: Response, freshness: Freshness) -> Self {
        Self {
            response,
            freshness,
            do_gzip: false,
        }
    }

    pub fn response(&self) -> &Response {
        &self.response
    }

    pub fn response_mut(&mut self) -> &mut Response {
        &mut self.response
    }

    pub fn freshness(&self) -> &Freshness {
        &self.freshness
    }

    pub fn ttl(&self) -> Duration {
        self.freshness.ttl()
    }

    pub fn set_ttl(&mut self, ttl: Duration) {
        self.freshness.set_ttl(ttl);
    }

    pub fn grace(&self) -> Duration {
        self.freshness.grace()
    }

    pub fn set_grace(&mut self, grace: Duration) {
        self.freshness.set_grace(grace);
    }

    pub fn keep(&self) -> Duration {
        self.freshness.keep()
    }

    pub fn set_keep(&mut self, keep: Duration) {
        self.freshness.set_keep(keep);
    }

    pub fn cacheability(&self) -> Cacheability {
        self.freshness.cacheability()
    }

    /// Marks the response uncacheable. It is recorded as a hit-for-miss
    /// marker, living for the current TTL when positive.
    pub fn mark_uncacheable(&mut self) {
        self.freshness.set_cacheability(Cacheability::HitForMiss);
    }

    pub fn do_gzip(&self) -> bool {
        self.do_gzip
    }

    /// Requests gzip compression before the body is stored.
    pub fn set_do_gzip(&mut self, enabled: bool) {
        self.do_gzip = enabled;
    }

    pub(crate) fn into_parts(self) -> (Response, Freshness, bool) {
        (self.response, self.freshness, self.do_gzip)
    }
}

/// Everything visible to [`Policy::on_backend_response`].
#[derive(Debug)]
pub struct BackendContext<'a> {
    request: &'a Request,
    bereq: &'a BackendRequest,
    beresp: Beresp,
}

impl<'a> BackendContext<'a> {
    pub(crate) fn new(request: &'a Request, bereq: &'a BackendRequest, beresp: Beresp) -> Self {
        Self {
            request,
            bereq,
            beresp,
        }
    }

    /// The client request that caused the fetch.
    pub fn request(&self) -> &Request {
        self.request
    }

    /// The request as sent to the backend.
    pub fn bereq(&self) -> &BackendRequest {
        self.bereq
    }

    pub fn beresp(&self) -> &Beresp {
        &self.beresp
    }

    pub fn beresp_mut(&mut self) -> &mut Beresp {
        &mut self.beresp
    }

    pub(crate) fn into_beresp(self) -> Beresp {
        self.beresp
    }
}

/// Per-phase decision points.
///
/// # Examples
///
/// A policy that caps grace for every request and keeps 5xx responses from
/// replacing anything, falling back to the builtin receive logic:
///
/// ```
/// use std::time::Duration;
/// use edgecache::context::Context;
/// use edgecache::policy::{
///     BackendContext, BackendResponseAction, Policy, PolicyError, ReceiveAction, builtin,
/// };
///
/// struct ShortGrace;
///
/// impl Policy for ShortGrace {
///     fn on_receive(&self, ctx: &mut Context) -> Result<ReceiveAction, PolicyError> {
///         ctx.grace_cap = Some(Duration::from_secs(1));
///         Ok(builtin::receive(ctx))
///     }
///
///     fn on_backend_response(
///         &self,
///         ctx: &mut BackendContext<'_>,
///     ) -> Result<BackendResponseAction, PolicyError> {
///         if ctx.beresp().response().status().is_server_error() {
///             return Ok(BackendResponseAction::Abandon);
///         }
///         Ok(BackendResponseAction::Deliver)
///     }
/// }
/// ```
pub trait Policy: Send + Sync + 'static {
    fn on_receive(&self, ctx: &mut Context) -> Result<ReceiveAction, PolicyError> {
        Ok(builtin::receive(ctx))
    }

    fn on_hit(&self, _ctx: &mut Context, _object: &CacheObject) -> Result<(), PolicyError> {
        Ok(())
    }

    fn on_miss(&self, _ctx: &mut Context) -> Result<(), PolicyError> {
        Ok(())
    }

    fn on_pass(&self, _ctx: &mut Context) -> Result<(), PolicyError> {
        Ok(())
    }

    /// Last chance to rewrite the request sent to the backend.
    fn on_backend_fetch(&self, _bereq: &mut BackendRequest) -> Result<(), PolicyError> {
        Ok(())
    }

    fn on_backend_response(
        &self,
        ctx: &mut BackendContext<'_>,
    ) -> Result<BackendResponseAction, PolicyError> {
        Ok(builtin::backend_response(ctx))
    }

    /// Produces the client response when no backend response could be used.
    fn on_backend_error(
        &self,
        _ctx: &mut Context,
        error: &FetchError,
    ) -> Result<Response, PolicyError> {
        Ok(builtin::backend_error(error))
    }

    fn on_deliver(&self, _ctx: &mut Context, _response: &mut Response) -> Result<(), PolicyError> {
        Ok(())
    }
}

/// Builtin behaviour only.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultPolicy;

impl Policy for DefaultPolicy {}

/// Runs a hook, turning errors and panics into [`FetchError::Policy`].
pub(crate) fn guarded<T>(
    phase: Phase,
    hook: impl FnOnce() -> Result<T, PolicyError>,
) -> Result<T, FetchError> {
    match panic::catch_unwind(AssertUnwindSafe(hook)) {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(error)) => Err(FetchError::Policy {
            phase,
            message: error.to_string(),
        }),
        Err(payload) => {
            let message = payload
                .downcast_ref::<&str>()
                .map(|s| (*s).to_owned())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "hook panicked".to_owned());
            Err(FetchError::Policy {
                phase,
                message: format!("panic: {message}"),
            })
        }
    }
}
