//! The caching engine.
//!
//! [`Engine::handle`] runs one client request through the phases:
//!
//! 1. **receive**: the policy picks lookup, pass or a synthetic answer;
//! 2. **lookup**: fresh objects are hits; objects in grace are hits that
//!    also start one background refresh; objects in keep, and misses, wait
//!    on a single coalesced fetch; hit-for-miss markers fetch on their own;
//! 3. **fetch**: the backend response is run through freshness and the
//!    backend-response hook, then stored, recorded as a marker, or handed
//!    over uncached;
//! 4. **deliver**: 304s, ranges, gunzip, `Age`, then the deliver hook.
//!
//! Shared state is limited to the [`Storage`] and the in-flight registry,
//! both keyed and sharded, so unrelated keys never contend.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::backend::{Backend, BackendError};
use crate::cache::{
    CacheKey, CacheObject, Coalescer, FetchGuard, Join, Lookup, MemoryStorage, Staleness, Storage,
};
use crate::config::{Config, ConfigError};
use crate::context::{CacheStatus, Context, PassReason};
use crate::delivery::{self, Delivery};
use crate::http::{Method, Request, Response};
use crate::policy::{DefaultPolicy, Phase, Policy, ReceiveAction, builtin, guarded};

mod fetch;
#[cfg(test)]
mod tests;

use fetch::{FetchJob, Fetched};

/// Why no usable backend response was obtained.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    #[error("backend unreachable: {0}")]
    Unreachable(String),

    #[error("backend did not answer within {0:?}")]
    Timeout(Duration),

    #[error("backend answered 304 to an unconditional request")]
    UnexpectedNotModified,

    #[error("backend response abandoned by policy")]
    Abandoned,

    #[error("{phase} hook failed: {message}")]
    Policy { phase: Phase, message: String },
}

impl From<BackendError> for FetchError {
    fn from(error: BackendError) -> Self {
        Self::Unreachable(error.to_string())
    }
}

/// What a coalesced fetch hands its followers.
#[derive(Debug, Clone)]
enum Published {
    Stored(Arc<CacheObject>),
    /// Nothing was stored: followers fetch for themselves.
    Uncacheable,
    Failed(FetchError),
}

/// The HTTP caching engine.
///
/// Cloning is cheap; clones share storage, configuration and the in-flight
/// registry.
///
/// # Examples
///
/// ```
/// use edgecache::backend::{BackendError, BackendRequest, backend_fn};
/// use edgecache::engine::Engine;
/// use edgecache::http::{Method, Request, Response, StatusCode};
/// use edgecache::policy::CacheStatusPolicy;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let origin = backend_fn(|_req: BackendRequest| async {
///     Ok::<_, BackendError>(
///         Response::new(StatusCode::OK)
///             .header("Cache-Control", "max-age=60")
///             .body("hello"),
///     )
/// });
/// let engine = Engine::builder(origin)
///     .policy(CacheStatusPolicy::new("edge"))
///     .build()
///     .unwrap();
///
/// let first = engine.handle(Request::new(Method::Get, "/")).await;
/// let second = engine.handle(Request::new(Method::Get, "/")).await;
/// assert_eq!(first.headers().get("cache-status"), Some("edge; fwd=miss"));
/// assert_eq!(second.headers().get("cache-status"), Some("edge; hit"));
/// assert_eq!(second.content().as_ref(), b"hello");
/// # }
/// ```
#[derive(Clone)]
pub struct Engine {
    inner: Arc<Inner>,
}

struct Inner {
    backend: Arc<dyn Backend>,
    policy: Arc<dyn Policy>,
    storage: Arc<dyn Storage>,
    config: Config,
    coalescer: Coalescer<Published>,
}

/// Assembles an [`Engine`]; see [`Engine::builder`].
pub struct EngineBuilder {
    backend: Arc<dyn Backend>,
    config: Config,
    policy: Arc<dyn Policy>,
    storage: Arc<dyn Storage>,
}

impl EngineBuilder {
    #[must_use]
    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    #[must_use]
    pub fn policy(mut self, policy: impl Policy) -> Self {
        self.policy = Arc::new(policy);
        self
    }

    #[must_use]
    pub fn storage(mut self, storage: impl Storage + 'static) -> Self {
        self.storage = Arc::new(storage);
        self
    }

    /// # Errors
    ///
    /// Returns [`ConfigError`] when the configuration does not validate.
    pub fn build(self) -> Result<Engine, ConfigError> {
        self.config.validate()?;
        info!(
            default_ttl = ?self.config.default_ttl,
            default_grace = ?self.config.default_grace,
            default_keep = ?self.config.default_keep,
            "cache engine ready"
        );
        Ok(Engine {
            inner: Arc::new(Inner {
                backend: self.backend,
                policy: self.policy,
                storage: self.storage,
                config: self.config,
                coalescer: Coalescer::new(),
            }),
        })
    }
}

impl Engine {
    /// Starts building an engine in front of `backend`, with the default
    /// configuration, [`DefaultPolicy`] and a [`MemoryStorage`].
    pub fn builder(backend: impl Backend) -> EngineBuilder {
        EngineBuilder {
            backend: Arc::new(backend),
            config: Config::default(),
            policy: Arc::new(DefaultPolicy),
            storage: Arc::new(MemoryStorage::new()),
        }
    }

    /// Serves one client request. Never fails: backend and hook failures
    /// become error responses.
    pub async fn handle(&self, request: Request) -> Response {
        let mut ctx = Context::new(request);
        let response = self.inner.process(&mut ctx).await;
        self.inner.deliver(&mut ctx, response)
    }

    /// The key `request` would be looked up under, if it is cacheable at all.
    pub fn cache_key(&self, request: &Request) -> Option<CacheKey> {
        CacheKey::from_request(request)
    }

    /// Drops every stored variant of `key`.
    pub fn invalidate(&self, key: &CacheKey) -> bool {
        self.inner.storage.evict(key)
    }

    /// Removes objects past their retention window now.
    pub fn sweep(&self) -> usize {
        self.inner.storage.sweep(Instant::now())
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn storage(&self) -> &dyn Storage {
        self.inner.storage.as_ref()
    }

    /// Sweeps every `sweep_interval` until the last clone of the engine is
    /// dropped.
    pub fn spawn_sweeper(&self) -> JoinHandle<()> {
        let engine = Arc::downgrade(&self.inner);
        let period = self.inner.config.sweep_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(inner) = engine.upgrade() else {
                    debug!("engine dropped, sweeper exiting");
                    break;
                };
                let removed = inner.storage.sweep(Instant::now());
                if removed > 0 {
                    debug!(removed, "sweeper removed expired objects");
                }
            }
        })
    }
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("objects", &self.inner.storage.len())
            .field("in_flight", &self.inner.coalescer.in_flight())
            .field("config", &self.inner.config)
            .finish()
    }
}

fn carries_credentials(request: &Request) -> bool {
    request.headers().contains("authorization") || request.headers().contains("cookie")
}

impl Inner {
    async fn process(self: &Arc<Self>, ctx: &mut Context) -> Response {
        let action = match guarded(Phase::Receive, || self.policy.on_receive(ctx)) {
            Ok(action) => action,
            Err(error) => return self.backend_error(ctx, None, &error),
        };
        match action {
            ReceiveAction::Synthesize(response) => response,
            ReceiveAction::Pass => self.pass(ctx).await,
            ReceiveAction::Lookup => match CacheKey::from_request(ctx.request()) {
                Some(key) => self.lookup(ctx, key).await,
                None => self.pass(ctx).await,
            },
        }
    }

    async fn pass(&self, ctx: &mut Context) -> Response {
        let reason = PassReason::classify(ctx.request());
        debug!(path = ctx.request().path(), reason = reason.detail(), "pass");
        ctx.set_cache_status(CacheStatus::Pass(reason));
        if let Err(error) = guarded(Phase::Pass, || self.policy.on_pass(ctx)) {
            return self.backend_error(ctx, None, &error);
        }
        let outcome = self.fetch(FetchJob::pass(ctx.request())).await;
        match outcome {
            Ok(Fetched::Transient(response)) => response,
            Ok(Fetched::Stored(object)) => object.to_response(),
            Err(error) => self.backend_error(ctx, None, &error),
        }
    }

    async fn lookup(self: &Arc<Self>, ctx: &mut Context, key: CacheKey) -> Response {
        let credentialed = !ctx.allow_credentials && carries_credentials(ctx.request());
        let mut missed = false;
        let mut restarts = 0;

        loop {
            let now = Instant::now();
            let found = self
                .storage
                .lookup(&key, ctx.request().headers(), now, ctx.grace_cap);
            let stale = match found {
                Lookup::Fresh(object) => return self.hit(ctx, &object, now),
                Lookup::Stale(object, Staleness::Grace) => {
                    self.refresh_in_background(ctx, &key, &object, credentialed);
                    return self.hit(ctx, &object, now);
                }
                Lookup::Stale(object, Staleness::Keep) => Some(object),
                Lookup::HitForMiss(_) => {
                    debug!(key = %key, "hit-for-miss, fetching uncoalesced");
                    if let Err(error) = self.enter_miss(ctx, &mut missed) {
                        return self.backend_error(ctx, Some(&key), &error);
                    }
                    return self.fetch_for(ctx, &key, None, credentialed).await;
                }
                Lookup::Miss => None,
            };
            if let Err(error) = self.enter_miss(ctx, &mut missed) {
                return self.backend_error(ctx, Some(&key), &error);
            }

            let subscription = match self.coalescer.join(&key) {
                Join::Leader(guard) => {
                    return self
                        .lead(ctx, &key, guard, stale.as_deref(), credentialed)
                        .await;
                }
                Join::Follower(subscription) => subscription,
            };
            debug!(key = %key, "waiting on in-flight fetch");
            match subscription.wait().await {
                Some(Published::Stored(object))
                    if object.variant().matches(ctx.request().headers()) =>
                {
                    return self.from_object(ctx, &object, Instant::now());
                }
                Some(Published::Failed(error)) => {
                    return self.backend_error(ctx, Some(&key), &error);
                }
                Some(Published::Uncacheable) => {
                    return self.fetch_for(ctx, &key, None, credentialed).await;
                }
                Some(Published::Stored(_)) | None => {
                    restarts += 1;
                    if restarts > self.config.max_restarts {
                        debug!(key = %key, restarts, "restart limit reached, fetching uncoalesced");
                        return self
                            .fetch_for(ctx, &key, stale.as_deref(), credentialed)
                            .await;
                    }
                    debug!(key = %key, restarts, "restarting lookup");
                }
            }
        }
    }

    /// Marks the request as a miss and runs the miss hook, once per request.
    fn enter_miss(&self, ctx: &mut Context, entered: &mut bool) -> Result<(), FetchError> {
        if std::mem::replace(entered, true) {
            return Ok(());
        }
        ctx.set_cache_status(CacheStatus::Miss);
        guarded(Phase::Miss, || self.policy.on_miss(ctx))
    }

    fn hit(&self, ctx: &mut Context, object: &CacheObject, now: Instant) -> Response {
        ctx.set_cache_status(CacheStatus::Hit);
        if let Err(error) = guarded(Phase::Hit, || self.policy.on_hit(ctx, object)) {
            return self.backend_error(ctx, None, &error);
        }
        self.from_object(ctx, object, now)
    }

    /// Leads the coalesced fetch for `key` and publishes its outcome.
    async fn lead(
        &self,
        ctx: &mut Context,
        key: &CacheKey,
        guard: FetchGuard<Published>,
        stale: Option<&CacheObject>,
        credentialed: bool,
    ) -> Response {
        let job = FetchJob::lookup(key, ctx.request(), ctx.grace_cap, credentialed).with_stale(stale);
        let outcome = self.fetch(job).await;
        guard.publish(match &outcome {
            Ok(Fetched::Stored(object)) => Published::Stored(Arc::clone(object)),
            Ok(Fetched::Transient(_)) => Published::Uncacheable,
            Err(error) => Published::Failed(error.clone()),
        });
        self.respond(ctx, key, outcome)
    }

    /// A fetch of this request's own, outside the coalescer.
    async fn fetch_for(
        &self,
        ctx: &mut Context,
        key: &CacheKey,
        stale: Option<&CacheObject>,
        credentialed: bool,
    ) -> Response {
        let job = FetchJob::lookup(key, ctx.request(), ctx.grace_cap, credentialed).with_stale(stale);
        let outcome = self.fetch(job).await;
        self.respond(ctx, key, outcome)
    }

    fn respond(
        &self,
        ctx: &mut Context,
        key: &CacheKey,
        outcome: Result<Fetched, FetchError>,
    ) -> Response {
        match outcome {
            Ok(Fetched::Stored(object)) => self.from_object(ctx, &object, Instant::now()),
            Ok(Fetched::Transient(response)) => {
                ctx.set_object_ttl(Duration::ZERO);
                Delivery::new(ctx.request())
                    .gunzip(self.config.gzip_support)
                    .finish(response)
            }
            Err(error) => self.backend_error(ctx, Some(key), &error),
        }
    }

    fn from_object(&self, ctx: &mut Context, object: &CacheObject, now: Instant) -> Response {
        ctx.set_object_ttl(object.remaining_ttl(now));
        Delivery::new(ctx.request())
            .cached(object.age(now))
            .gunzip(self.config.gzip_support)
            .finish(object.to_response())
    }

    /// Starts the single background refresh for `key`, unless one is running.
    fn refresh_in_background(
        self: &Arc<Self>,
        ctx: &Context,
        key: &CacheKey,
        stale: &Arc<CacheObject>,
        credentialed: bool,
    ) {
        let Some(slot) = self.coalescer.try_refresh(key) else {
            debug!(key = %key, "background refresh already running");
            return;
        };
        debug!(key = %key, "starting background refresh");

        let inner = Arc::clone(self);
        let key = key.clone();
        let request = ctx.request().clone();
        let stale = Arc::clone(stale);
        let grace_cap = ctx.grace_cap;
        tokio::spawn(async move {
            let _slot = slot;
            let job = FetchJob::lookup(&key, &request, grace_cap, credentialed)
                .with_stale(Some(&stale))
                .background();
            match inner.fetch(job).await {
                Ok(_) => debug!(key = %key, "background refresh finished"),
                Err(FetchError::Abandoned) => {
                    warn!(key = %key, "background refresh abandoned, stale object kept");
                }
                Err(error) => warn!(key = %key, %error, "background refresh failed"),
            }
        });
    }

    fn backend_error(
        &self,
        ctx: &mut Context,
        key: Option<&CacheKey>,
        error: &FetchError,
    ) -> Response {
        match key {
            Some(key) => warn!(key = %key, %error, "fetch failed"),
            None => warn!(path = ctx.request().path(), %error, "request failed"),
        }
        ctx.set_object_ttl(Duration::ZERO);
        let mut response =
            match guarded(Phase::BackendError, || self.policy.on_backend_error(ctx, error)) {
                Ok(response) => response,
                Err(hook_error) => {
                    warn!(error = %hook_error, "backend error hook failed, using builtin response");
                    builtin::backend_error(error)
                }
            };
        if *ctx.request().method() == Method::Head {
            delivery::head(&mut response);
        }
        response
    }

    fn deliver(&self, ctx: &mut Context, mut response: Response) -> Response {
        match guarded(Phase::Deliver, || self.policy.on_deliver(ctx, &mut response)) {
            Ok(()) => response,
            Err(error) => {
                warn!(path = ctx.request().path(), %error, "deliver hook failed");
                builtin::backend_error(&error)
            }
        }
    }
}
