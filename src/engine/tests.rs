//! End-to-end scenarios against an in-process origin under a paused clock.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::{Instant, advance, sleep};

use super::*;
use crate::backend::{BackendError, BackendRequest, backend_fn};
use crate::http::StatusCode;
use crate::policy::{
    BackendContext, BackendResponseAction, CacheStatusPolicy, PolicyError, cookies,
};

const ZERO: Duration = Duration::ZERO;

fn ms(n: u64) -> Duration {
    Duration::from_millis(n)
}

fn secs(n: u64) -> Duration {
    Duration::from_secs(n)
}

/// Counts and records every backend request.
#[derive(Clone, Default)]
struct Origin {
    calls: Arc<AtomicUsize>,
    seen: Arc<Mutex<Vec<BackendRequest>>>,
}

impl Origin {
    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// The `n`th backend request, counting from 1.
    fn request(&self, n: usize) -> BackendRequest {
        self.seen.lock().unwrap()[n - 1].clone()
    }
}

fn origin<F>(latency: Duration, respond: F) -> (impl Backend, Origin)
where
    F: Fn(&BackendRequest, usize) -> Response + Send + Sync + 'static,
{
    let origin = Origin::default();
    let state = origin.clone();
    let backend = backend_fn(move |req: BackendRequest| {
        let n = state.calls.fetch_add(1, Ordering::SeqCst) + 1;
        let response = respond(&req, n);
        state.seen.lock().unwrap().push(req);
        async move {
            if !latency.is_zero() {
                sleep(latency).await;
            }
            Ok::<_, BackendError>(response)
        }
    });
    (backend, origin)
}

fn tag(req: &BackendRequest) -> String {
    req.headers().get("x-request").unwrap_or_default().to_owned()
}

/// `200` echoing `X-Request` as `X-Response`.
fn ok(req: &BackendRequest, cache_control: &str) -> Response {
    let response = Response::new(StatusCode::OK).header("X-Response", tag(req));
    if cache_control.is_empty() {
        response
    } else {
        response.header("Cache-Control", cache_control)
    }
}

/// Status taken from the request's `X-Status-Code`.
fn requested_status(req: &BackendRequest) -> Response {
    let status = req
        .headers()
        .get("x-status-code")
        .and_then(|s| s.parse::<u16>().ok())
        .and_then(StatusCode::from_u16)
        .unwrap_or(StatusCode::OK);
    Response::new(status).header("X-Response", tag(req))
}

fn get(tag: &str) -> Request {
    Request::new(Method::Get, "/resource")
        .with_header("Host", "example.test")
        .with_header("X-Request", tag)
}

fn x_response(response: &Response) -> &str {
    response.headers().get("x-response").unwrap_or_default()
}

/// No default TTL or grace, so only explicit freshness caches.
fn config() -> Config {
    Config::default()
        .with_default_ttl(ZERO)
        .with_default_grace(ZERO)
}

/// Routes engine logs to the test output; filter with `RUST_LOG`.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn build(backend: impl Backend, config: Config, policy: impl Policy) -> Engine {
    init_tracing();
    Engine::builder(backend)
        .config(config)
        .policy(policy)
        .build()
        .unwrap()
}

/// Lets spawned background refreshes with an instant origin finish.
async fn let_background_run() {
    sleep(ms(1)).await;
}

// ---- policies --------------------------------------------------------------

struct GraceCap(Duration);

impl Policy for GraceCap {
    fn on_receive(&self, ctx: &mut Context) -> Result<ReceiveAction, PolicyError> {
        ctx.grace_cap = Some(self.0);
        Ok(builtin::receive(ctx))
    }
}

/// Caps grace at 1s but hands every response a 100ms TTL and 10s grace.
struct CappedHookWindows;

impl Policy for CappedHookWindows {
    fn on_receive(&self, ctx: &mut Context) -> Result<ReceiveAction, PolicyError> {
        ctx.grace_cap = Some(secs(1));
        Ok(builtin::receive(ctx))
    }

    fn on_backend_response(
        &self,
        ctx: &mut BackendContext<'_>,
    ) -> Result<BackendResponseAction, PolicyError> {
        ctx.beresp_mut().set_ttl(ms(100));
        ctx.beresp_mut().set_grace(secs(10));
        Ok(BackendResponseAction::Deliver)
    }
}

struct CacheServerErrors {
    uncacheable: bool,
}

impl Policy for CacheServerErrors {
    fn on_backend_response(
        &self,
        ctx: &mut BackendContext<'_>,
    ) -> Result<BackendResponseAction, PolicyError> {
        if ctx.beresp().response().status().is_server_error() {
            let beresp = ctx.beresp_mut();
            beresp.set_ttl(secs(1));
            beresp.set_grace(secs(10));
            if self.uncacheable {
                beresp.mark_uncacheable();
            }
        }
        Ok(BackendResponseAction::Deliver)
    }
}

struct AdoptEverything;

impl Policy for AdoptEverything {
    fn on_backend_response(
        &self,
        _ctx: &mut BackendContext<'_>,
    ) -> Result<BackendResponseAction, PolicyError> {
        Ok(BackendResponseAction::Deliver)
    }
}

struct AllowCredentials;

impl Policy for AllowCredentials {
    fn on_receive(&self, ctx: &mut Context) -> Result<ReceiveAction, PolicyError> {
        ctx.allow_credentials = true;
        Ok(builtin::receive(ctx))
    }
}

struct ReportObjectTtl {
    pass: bool,
}

impl Policy for ReportObjectTtl {
    fn on_receive(&self, ctx: &mut Context) -> Result<ReceiveAction, PolicyError> {
        if self.pass {
            return Ok(ReceiveAction::Pass);
        }
        Ok(builtin::receive(ctx))
    }

    fn on_deliver(&self, ctx: &mut Context, response: &mut Response) -> Result<(), PolicyError> {
        response
            .headers_mut()
            .set("X-Obj-Ttl", ctx.object_ttl().as_secs_f64().to_string());
        Ok(())
    }
}

struct Gzip;

impl Policy for Gzip {
    fn on_backend_response(
        &self,
        ctx: &mut BackendContext<'_>,
    ) -> Result<BackendResponseAction, PolicyError> {
        ctx.beresp_mut().set_do_gzip(true);
        Ok(builtin::backend_response(ctx))
    }
}

#[derive(Default, Clone)]
struct RecordErrors {
    errors: Arc<Mutex<Vec<FetchError>>>,
}

impl Policy for RecordErrors {
    fn on_backend_error(
        &self,
        _ctx: &mut Context,
        error: &FetchError,
    ) -> Result<Response, PolicyError> {
        self.errors.lock().unwrap().push(error.clone());
        Ok(Response::new(StatusCode::BAD_GATEWAY).body(error.to_string()))
    }
}

struct PanicOnBoom;

impl Policy for PanicOnBoom {
    fn on_backend_response(
        &self,
        ctx: &mut BackendContext<'_>,
    ) -> Result<BackendResponseAction, PolicyError> {
        if ctx.request().headers().get("x-request") == Some("boom") {
            panic!("boom");
        }
        Ok(builtin::backend_response(ctx))
    }
}

struct RetainCookies;

impl Policy for RetainCookies {
    fn on_receive(&self, ctx: &mut Context) -> Result<ReceiveAction, PolicyError> {
        cookies::retain_only(ctx.request_mut(), &["__prerender_bypass", "__n-p-d"]);
        Ok(builtin::receive(ctx))
    }
}

struct Synthesize;

impl Policy for Synthesize {
    fn on_receive(&self, _ctx: &mut Context) -> Result<ReceiveAction, PolicyError> {
        Ok(ReceiveAction::Synthesize(
            Response::new(StatusCode::NO_CONTENT).header("X-Synthetic", "1"),
        ))
    }
}

/// Notes the receive-time path in locals and echoes it plus the cache
/// outcome on delivery.
struct EchoLocals;

impl Policy for EchoLocals {
    fn on_receive(&self, ctx: &mut Context) -> Result<ReceiveAction, PolicyError> {
        let path = ctx.request().path().to_owned();
        ctx.locals_mut().insert("received-path", path);
        Ok(builtin::receive(ctx))
    }

    fn on_deliver(&self, ctx: &mut Context, response: &mut Response) -> Result<(), PolicyError> {
        let locals = ctx.locals();
        let note = format!(
            "{} {}",
            locals.get("received-path").unwrap_or_default(),
            locals.get("cache-status").unwrap_or_default()
        );
        response.headers_mut().set("X-Locals", note);
        Ok(())
    }
}

// ---- freshness -------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn max_age_is_a_hit_until_it_elapses() {
    let (backend, origin) = origin(ZERO, |req, _| ok(req, "max-age=2"));
    let engine = build(backend, config(), CacheStatusPolicy::new("my-cache"));

    let r = engine.handle(get("foo")).await;
    assert_eq!(x_response(&r), "foo");
    assert_eq!(r.headers().get("cache-status"), Some("my-cache; fwd=miss"));
    assert_eq!(r.headers().get("x-cache"), Some("miss"));

    advance(secs(1)).await;
    let r = engine.handle(get("bar")).await;
    assert_eq!(x_response(&r), "foo");
    assert_eq!(r.headers().get("cache-status"), Some("my-cache; hit"));
    assert_eq!(r.headers().get("x-cache"), Some("hit"));
    assert_eq!(r.headers().get("age"), Some("1"));

    advance(ms(1500)).await;
    let r = engine.handle(get("buzz")).await;
    assert_eq!(x_response(&r), "buzz");
    assert_eq!(origin.calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn missing_cache_control_uses_default_ttl() {
    let (backend, origin) = origin(ZERO, |req, _| ok(req, ""));
    let engine = build(backend, config().with_default_ttl(secs(1)), DefaultPolicy);

    assert_eq!(x_response(&engine.handle(get("foo")).await), "foo");
    advance(ms(500)).await;
    assert_eq!(x_response(&engine.handle(get("bar")).await), "foo");
    advance(ms(600)).await;
    assert_eq!(x_response(&engine.handle(get("buzz")).await), "buzz");
    assert_eq!(origin.calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn not_found_is_cached_by_default() {
    let (backend, origin) = origin(ZERO, |req, _| {
        Response::new(StatusCode::NOT_FOUND).header("X-Response", tag(req))
    });
    let engine = build(backend, config().with_default_ttl(secs(60)), DefaultPolicy);

    engine.handle(get("foo")).await;
    let r = engine.handle(get("bar")).await;
    assert_eq!(r.status(), StatusCode::NOT_FOUND);
    assert_eq!(x_response(&r), "foo");
    assert_eq!(origin.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn server_error_without_freshness_is_never_cached() {
    let (backend, origin) = origin(ZERO, |req, _| {
        Response::new(StatusCode::INTERNAL_SERVER_ERROR).header("X-Response", tag(req))
    });
    let engine = build(backend, config().with_default_ttl(secs(60)), DefaultPolicy);

    assert_eq!(x_response(&engine.handle(get("foo")).await), "foo");
    let r = engine.handle(get("bar")).await;
    assert_eq!(r.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(x_response(&r), "bar");
    assert_eq!(origin.calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn no_cache_response_is_refetched() {
    let (backend, origin) = origin(ZERO, |req, _| ok(req, "no-cache"));
    let engine = build(backend, config(), DefaultPolicy);

    assert_eq!(x_response(&engine.handle(get("foo")).await), "foo");
    assert_eq!(x_response(&engine.handle(get("bar")).await), "bar");
    assert_eq!(origin.calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn request_cache_control_is_ignored() {
    let (backend, origin) = origin(ZERO, |req, _| ok(req, ""));
    let engine = build(backend, config().with_default_ttl(secs(1)), DefaultPolicy);

    engine.handle(get("foo")).await;
    advance(ms(100)).await;
    let r = engine
        .handle(get("bar").with_header("Cache-Control", "max-age=0, no-cache"))
        .await;
    assert_eq!(x_response(&r), "foo");
    assert_eq!(origin.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn private_response_with_swr_is_not_stored() {
    let (backend, origin) = origin(ZERO, |req, _| ok(req, "private, stale-while-revalidate=1"));
    let engine = build(backend, config(), DefaultPolicy);

    assert_eq!(x_response(&engine.handle(get("foo")).await), "foo");
    advance(ms(200)).await;
    assert_eq!(x_response(&engine.handle(get("bar")).await), "bar");
    advance(ms(1100)).await;
    assert_eq!(x_response(&engine.handle(get("buzz")).await), "buzz");
    assert_eq!(origin.calls(), 3);
}

#[tokio::test(start_paused = true)]
async fn oversized_bodies_are_delivered_but_not_stored() {
    let (backend, origin) =
        origin(ZERO, |req, _| ok(req, "max-age=60").body("far too large"));
    let engine = build(backend, config().with_max_object_size(4), DefaultPolicy);

    assert_eq!(engine.handle(get("foo")).await.content().as_ref(), b"far too large");
    engine.handle(get("bar")).await;
    assert_eq!(origin.calls(), 2);
    assert!(engine.storage().is_empty());
}

// ---- grace and background refresh -------------------------------------------

#[tokio::test(start_paused = true)]
async fn stale_while_revalidate_serves_stale_and_refreshes() {
    let (backend, origin) = origin(ms(500), |req, _| ok(req, "max-age=1, stale-while-revalidate=10"));
    let engine = build(backend, config(), DefaultPolicy);

    assert_eq!(x_response(&engine.handle(get("foo")).await), "foo");

    advance(ms(1500)).await;
    let start = Instant::now();
    let r = engine.handle(get("bar")).await;
    assert!(start.elapsed() < ms(100));
    assert_eq!(x_response(&r), "foo");

    // The refresh lands after the origin's latency.
    sleep(ms(600)).await;
    assert_eq!(origin.calls(), 2);
    assert_eq!(x_response(&engine.handle(get("x")).await), "bar");

    // Past the refreshed object's TTL and grace: synchronous again.
    advance(secs(12)).await;
    let start = Instant::now();
    let r = engine.handle(get("buzz")).await;
    assert!(start.elapsed() >= ms(500));
    assert_eq!(x_response(&r), "buzz");
    assert_eq!(origin.calls(), 3);
}

#[tokio::test(start_paused = true)]
async fn one_background_refresh_per_key() {
    let (backend, origin) = origin(secs(1), |req, _| ok(req, "max-age=1, stale-while-revalidate=10"));
    let engine = build(backend, config(), DefaultPolicy);

    engine.handle(get("foo")).await;
    advance(ms(1500)).await;
    for tag in ["a", "b", "c"] {
        assert_eq!(x_response(&engine.handle(get(tag)).await), "foo");
    }
    sleep(ms(1100)).await;
    assert_eq!(origin.calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn grace_only_response_is_retained_for_its_grace() {
    let (backend, origin) = origin(ZERO, |req, _| ok(req, "stale-while-revalidate=1"));
    let engine = build(backend, config(), DefaultPolicy);

    assert_eq!(x_response(&engine.handle(get("foo")).await), "foo");
    advance(ms(200)).await;
    assert_eq!(x_response(&engine.handle(get("bar")).await), "foo");
    let_background_run().await;
    advance(ms(1100)).await;
    assert_eq!(x_response(&engine.handle(get("buzz")).await), "buzz");
    assert_eq!(origin.calls(), 3);
}

#[tokio::test(start_paused = true)]
async fn grace_cap_limits_hook_grace() {
    let (backend, origin) = origin(ZERO, |req, _| ok(req, ""));
    let engine = build(backend, config(), CappedHookWindows);

    assert_eq!(x_response(&engine.handle(get("foo")).await), "foo");
    advance(ms(200)).await;
    assert_eq!(x_response(&engine.handle(get("bar")).await), "foo");
    let_background_run().await;
    advance(ms(1200)).await;
    assert_eq!(x_response(&engine.handle(get("buzz")).await), "buzz");
    assert_eq!(origin.calls(), 3);
}

#[tokio::test(start_paused = true)]
async fn grace_cap_limits_stale_while_revalidate() {
    let (backend, origin) = origin(ZERO, |req, _| ok(req, "max-age=1, stale-while-revalidate=10"));
    let engine = build(backend, config(), GraceCap(secs(1)));

    assert_eq!(x_response(&engine.handle(get("foo")).await), "foo");
    advance(ms(1200)).await;
    assert_eq!(x_response(&engine.handle(get("bar")).await), "foo");
    let_background_run().await;
    advance(ms(2200)).await;
    assert_eq!(x_response(&engine.handle(get("buzz")).await), "buzz");
    assert_eq!(origin.calls(), 3);
}

#[tokio::test(start_paused = true)]
async fn background_server_error_keeps_graced_object() {
    let (backend, origin) = origin(ZERO, |req, _| requested_status(req));
    let config = config()
        .with_default_ttl(secs(1))
        .with_default_grace(secs(5));
    let engine = build(backend, config, DefaultPolicy);

    let r = engine.handle(get("foo").with_header("X-Status-Code", "200")).await;
    assert_eq!(r.status(), StatusCode::OK);

    advance(ms(1100)).await;
    for tag in ["baz", "boo"] {
        let r = engine.handle(get(tag).with_header("X-Status-Code", "500")).await;
        assert_eq!(r.status(), StatusCode::OK);
        assert_eq!(x_response(&r), "foo");
        let_background_run().await;
    }
    assert_eq!(origin.calls(), 3);
}

#[tokio::test(start_paused = true)]
async fn adopted_background_server_error_replaces_object() {
    let (backend, origin) = origin(ZERO, |req, _| requested_status(req));
    let config = config()
        .with_default_ttl(secs(1))
        .with_default_grace(secs(5));
    let engine = build(backend, config, AdoptEverything);

    engine.handle(get("1").with_header("X-Status-Code", "200")).await;
    advance(ms(1100)).await;

    let r = engine.handle(get("2").with_header("X-Status-Code", "500")).await;
    assert_eq!((r.status(), x_response(&r)), (StatusCode::OK, "1"));
    let_background_run().await;

    for tag in ["3", "4"] {
        let r = engine.handle(get(tag).with_header("X-Status-Code", "500")).await;
        assert_eq!((r.status(), x_response(&r)), (StatusCode::INTERNAL_SERVER_ERROR, tag));
    }
    assert_eq!(origin.calls(), 4);
}

// ---- policy-driven cacheability --------------------------------------------

#[tokio::test(start_paused = true)]
async fn hook_ttl_on_server_error_is_cached() {
    let (backend, origin) = origin(ZERO, |req, _| {
        Response::new(StatusCode::INTERNAL_SERVER_ERROR).header("X-Response", tag(req))
    });
    let engine = build(backend, config(), CacheServerErrors { uncacheable: false });

    engine.handle(get("foo")).await;
    let r = engine.handle(get("bar")).await;
    assert_eq!((r.status(), x_response(&r)), (StatusCode::INTERNAL_SERVER_ERROR, "foo"));
    assert_eq!(origin.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn hook_marking_uncacheable_is_hit_for_miss() {
    let (backend, origin) = origin(ZERO, |req, _| {
        Response::new(StatusCode::INTERNAL_SERVER_ERROR).header("X-Response", tag(req))
    });
    let engine = build(backend, config(), CacheServerErrors { uncacheable: true });

    assert_eq!(x_response(&engine.handle(get("foo")).await), "foo");
    assert_eq!(x_response(&engine.handle(get("bar")).await), "bar");
    assert_eq!(origin.calls(), 2);
    assert_eq!(engine.storage().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn pass_in_receive_bypasses_cache_with_zero_object_ttl() {
    let (backend, origin) = origin(ZERO, |req, _| ok(req, "max-age=10, stale-while-revalidate=30"));
    let engine = build(backend, config(), ReportObjectTtl { pass: true });

    let r = engine.handle(get("foo")).await;
    assert_eq!(r.headers().get("x-obj-ttl"), Some("0"));
    assert!(!r.headers().contains("accept-ranges"));
    assert_eq!(x_response(&engine.handle(get("bar")).await), "bar");
    assert_eq!(origin.calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn lookup_reports_remaining_object_ttl() {
    let (backend, _origin) = origin(ZERO, |req, _| ok(req, "max-age=10, stale-while-revalidate=30"));
    let engine = build(backend, config(), ReportObjectTtl { pass: false });

    let r = engine.handle(get("foo")).await;
    let ttl: f64 = r.headers().get("x-obj-ttl").unwrap().parse().unwrap();
    assert_eq!(r.status(), StatusCode::OK);
    assert!(ttl > 0.0 && ttl <= 10.0);
}

#[tokio::test(start_paused = true)]
async fn synthesized_response_touches_neither_cache_nor_backend() {
    let (backend, origin) = origin(ZERO, |req, _| ok(req, "max-age=10"));
    let engine = build(backend, config(), Synthesize);

    let r = engine.handle(get("foo")).await;
    assert_eq!(r.status(), StatusCode::NO_CONTENT);
    assert_eq!(r.headers().get("x-synthetic"), Some("1"));
    assert_eq!(origin.calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn locals_carry_notes_between_phases() {
    let (backend, _origin) = origin(ZERO, |req, _| ok(req, "max-age=60"));
    let engine = build(backend, config(), EchoLocals);

    let r = engine.handle(get("foo")).await;
    assert_eq!(r.headers().get("x-locals"), Some("/resource miss"));
    let r = engine.handle(get("bar")).await;
    assert_eq!(r.headers().get("x-locals"), Some("/resource hit"));
}

// ---- pass and credentials --------------------------------------------------

#[tokio::test(start_paused = true)]
async fn unsafe_methods_and_credentials_pass() {
    let (backend, origin) = origin(ZERO, |req, _| ok(req, "max-age=60"));
    let engine = build(backend, config(), CacheStatusPolicy::new("my-cache"));

    let post = Request::new(Method::Post, "/resource").with_header("X-Request", "p");
    let r = engine.handle(post).await;
    assert_eq!(r.headers().get("cache-status"), Some("my-cache; fwd=method; detail=POST"));
    assert_eq!(r.headers().get("x-cache"), Some("pass"));
    assert!(!r.headers().contains("accept-ranges"));

    let auth = || get("a").with_header("Authorization", "Basic Zm9vOmJhcg==");
    let r = engine.handle(auth()).await;
    assert_eq!(
        r.headers().get("cache-status"),
        Some("my-cache; fwd=bypass; detail=AUTHORIZATION")
    );
    engine.handle(auth()).await;

    let r = engine.handle(get("c").with_header("Cookie", "session=1")).await;
    assert_eq!(r.headers().get("cache-status"), Some("my-cache; fwd=bypass; detail=COOKIE"));

    assert_eq!(origin.calls(), 4);
    assert!(engine.storage().is_empty());
}

#[tokio::test(start_paused = true)]
async fn allowing_credentials_enables_caching() {
    let (backend, origin) = origin(ZERO, |req, _| ok(req, "max-age=60"));
    let engine = build(backend, config(), AllowCredentials);

    engine.handle(get("foo").with_header("Cookie", "a=1")).await;
    let r = engine.handle(get("bar").with_header("Cookie", "a=1")).await;
    assert_eq!(x_response(&r), "foo");
    assert_eq!(origin.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn cookie_filter_keeps_requests_cacheable() {
    let (backend, origin) = origin(ZERO, |req, _| {
        ok(req, "max-age=60").header("X-Cookie", req.headers().get("cookie").unwrap_or_default())
    });
    let engine = build(backend, config(), RetainCookies);

    engine.handle(get("foo").with_header("Cookie", "foo=bar")).await;
    let r = engine.handle(get("bar").with_header("Cookie", "a=b=3; c=3")).await;
    assert_eq!(x_response(&r), "foo");
    assert_eq!(origin.calls(), 1);

    let r = engine
        .handle(get("np").with_header("Cookie", "foo=bar; __n-p-d=1"))
        .await;
    assert_eq!(x_response(&r), "np");
    assert_eq!(r.headers().get("x-cookie"), Some("__n-p-d=1"));
    assert_eq!(origin.calls(), 2);
}

// ---- coalescing and hit-for-miss ---------------------------------------------

#[tokio::test(start_paused = true)]
async fn concurrent_misses_are_coalesced() {
    let (backend, origin) = origin(secs(1), |req, _| ok(req, "max-age=60"));
    let engine = build(backend, config(), DefaultPolicy);

    let start = Instant::now();
    let tasks: Vec<_> = (0..5)
        .map(|i| {
            let engine = engine.clone();
            tokio::spawn(async move { engine.handle(get(&i.to_string())).await })
        })
        .collect();
    let mut bodies = Vec::new();
    for task in tasks {
        bodies.push(x_response(&task.await.unwrap()).to_owned());
    }

    assert!(start.elapsed() < ms(1500));
    assert_eq!(origin.calls(), 1);
    assert!(bodies.iter().all(|b| *b == bodies[0]));
}

#[tokio::test(start_paused = true)]
async fn no_store_records_hit_for_miss_without_coalescing() {
    let (backend, origin) = origin(secs(1), |req, _| ok(req, "no-store"));
    let engine = build(backend, config(), DefaultPolicy);

    let start = Instant::now();
    engine.handle(get("first")).await;
    assert_eq!(start.elapsed(), secs(1));
    assert_eq!(engine.storage().len(), 1);

    let start = Instant::now();
    let tasks: Vec<_> = (0..5)
        .map(|i| {
            let engine = engine.clone();
            tokio::spawn(async move { engine.handle(get(&i.to_string())).await })
        })
        .collect();
    for (i, task) in tasks.into_iter().enumerate() {
        assert_eq!(x_response(&task.await.unwrap()), i.to_string());
    }

    // Parallel, not serialized, and not collapsed.
    assert!(start.elapsed() < ms(1500));
    assert_eq!(origin.calls(), 6);
}

#[tokio::test(start_paused = true)]
async fn coalesced_followers_share_the_leaders_failure() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let backend = backend_fn(move |_req: BackendRequest| {
        counter.fetch_add(1, Ordering::SeqCst);
        async {
            sleep(secs(1)).await;
            Err::<Response, _>(BackendError::Unavailable("connection refused".into()))
        }
    });
    let engine = build(backend, config(), DefaultPolicy);

    let tasks: Vec<_> = (0..3)
        .map(|_| {
            let engine = engine.clone();
            tokio::spawn(async move { engine.handle(get("x")).await })
        })
        .collect();
    for task in tasks {
        assert_eq!(task.await.unwrap().status(), StatusCode::SERVICE_UNAVAILABLE);
    }
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn follower_of_another_variant_restarts_its_lookup() {
    let (backend, origin) = origin(secs(1), |req, _| {
        ok(req, "max-age=60")
            .header("Vary", "Accept-Language")
            .header(
                "Content-Language",
                req.headers().get("accept-language").unwrap_or_default(),
            )
    });
    let engine = build(backend, config(), DefaultPolicy);

    let spawn = |lang: &'static str| {
        let engine = engine.clone();
        tokio::spawn(async move {
            engine
                .handle(get(lang).with_header("Accept-Language", lang))
                .await
        })
    };
    let (en, de) = (spawn("en"), spawn("de"));
    let en = en.await.unwrap();
    let de = de.await.unwrap();
    assert_eq!(en.headers().get("content-language"), Some("en"));
    assert_eq!(de.headers().get("content-language"), Some("de"));
    assert_eq!(origin.calls(), 2);

    let r = engine.handle(get("again").with_header("Accept-Language", "en")).await;
    assert_eq!(x_response(&r), "en");
    assert_eq!(origin.calls(), 2);
}

// ---- revalidation ------------------------------------------------------------

fn revalidating_origin(
    validator: &'static str,
    value: &'static str,
    condition: &'static str,
) -> (impl Backend, Origin) {
    origin(ZERO, move |req, n| {
        let status = if n == 1 {
            StatusCode::OK
        } else if req.headers().get(condition) == Some(value) {
            StatusCode::NOT_MODIFIED
        } else {
            StatusCode::OK
        };
        let response = Response::new(status)
            .header("X-Response", tag(req))
            .header(validator, value);
        if status == StatusCode::OK {
            response.body("foo")
        } else {
            response
        }
    })
}

#[tokio::test(start_paused = true)]
async fn etag_revalidation_keeps_the_stored_body() {
    let (backend, origin) = revalidating_origin("ETag", "1234", "if-none-match");
    let config = config()
        .with_default_ttl(secs(1))
        .with_default_keep(secs(5));
    let engine = build(backend, config, DefaultPolicy);

    let r = engine.handle(get("1")).await;
    assert_eq!((x_response(&r), r.content().as_ref()), ("1", &b"foo"[..]));
    assert!(origin.request(1).headers().get("if-none-match").is_none());

    advance(ms(1100)).await;
    let r = engine.handle(get("2")).await;
    assert_eq!(r.status(), StatusCode::OK);
    assert_eq!((x_response(&r), r.content().as_ref()), ("2", &b"foo"[..]));
    assert_eq!(origin.request(2).headers().get("if-none-match"), Some("1234"));
    assert!(origin.request(2).is_conditional());

    advance(ms(200)).await;
    let r = engine.handle(get("3")).await;
    assert_eq!((x_response(&r), r.content().as_ref()), ("2", &b"foo"[..]));
    assert_eq!(origin.calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn last_modified_revalidation_keeps_the_stored_body() {
    let modified = "Sun, 06 Nov 1994 08:49:37 GMT";
    let (backend, origin) = revalidating_origin("Last-Modified", modified, "if-modified-since");
    let config = config()
        .with_default_ttl(secs(1))
        .with_default_keep(secs(5));
    let engine = build(backend, config, DefaultPolicy);

    engine.handle(get("1")).await;
    advance(ms(1100)).await;
    let r = engine.handle(get("2")).await;
    assert_eq!((x_response(&r), r.content().as_ref()), ("2", &b"foo"[..]));
    assert_eq!(origin.request(2).headers().get("if-modified-since"), Some(modified));

    advance(ms(200)).await;
    assert_eq!(x_response(&engine.handle(get("3")).await), "2");
    assert_eq!(origin.calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn not_modified_to_unconditional_request_is_backend_error() {
    let (backend, _origin) = origin(ZERO, |_, _| Response::new(StatusCode::NOT_MODIFIED));
    let errors = RecordErrors::default();
    let engine = build(backend, config(), errors.clone());

    let r = engine.handle(get("foo")).await;
    assert_eq!(r.status(), StatusCode::BAD_GATEWAY);
    assert_eq!(*errors.errors.lock().unwrap(), [FetchError::UnexpectedNotModified]);

    let (backend, _origin) = origin(ZERO, |_, _| Response::new(StatusCode::NOT_MODIFIED));
    let engine = build(backend, config(), DefaultPolicy);
    let r = engine.handle(get("foo")).await;
    assert_eq!(r.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(r.content().as_ref(), builtin::BACKEND_ERROR_BODY.as_bytes());
}

#[tokio::test(start_paused = true)]
async fn passed_not_modified_requires_a_conditional_request() {
    let (backend, origin) = origin(ZERO, |_, _| Response::new(StatusCode::NOT_MODIFIED));
    let engine = build(backend, config(), DefaultPolicy);

    let post = Request::new(Method::Post, "/p").with_header("Host", "example.test");
    assert_eq!(engine.handle(post).await.status(), StatusCode::SERVICE_UNAVAILABLE);

    let authorized = || get("a").with_header("Authorization", "Basic Zm9vOmJhcg==");
    let r = engine.handle(authorized()).await;
    assert_eq!(r.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(r.content().as_ref(), builtin::BACKEND_ERROR_BODY.as_bytes());

    let r = engine
        .handle(authorized().with_header("If-None-Match", "\"1\""))
        .await;
    assert_eq!(r.status(), StatusCode::NOT_MODIFIED);
    assert_eq!(origin.calls(), 3);
}

// ---- delivery ----------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn client_conditional_request_is_answered_from_cache() {
    let (backend, origin) = origin(ZERO, |req, _| {
        ok(req, "max-age=100").header("ETag", "\"1234\"").body("foo")
    });
    let engine = build(backend, config(), DefaultPolicy);

    let r = engine
        .handle(get("1").with_header("If-None-Match", "\"1234\""))
        .await;
    assert_eq!(r.status(), StatusCode::NOT_MODIFIED);
    assert!(r.content().is_empty());
    assert!(origin.request(1).headers().get("if-none-match").is_none());

    let r = engine.handle(get("2")).await;
    assert_eq!((r.status(), r.content().as_ref()), (StatusCode::OK, &b"foo"[..]));
    assert_eq!(origin.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn range_requests_are_served_from_the_full_object() {
    let (backend, origin) = origin(ZERO, |req, _| ok(req, "max-age=100").body("foo"));
    let engine = build(backend, config(), DefaultPolicy);

    let r = engine.handle(get("1").with_header("Range", "bytes=1-2")).await;
    assert_eq!(r.status(), StatusCode::PARTIAL_CONTENT);
    assert_eq!(r.content().as_ref(), b"oo");
    assert_eq!(r.headers().get("accept-ranges"), Some("bytes"));
    assert!(origin.request(1).headers().get("range").is_none());

    let r = engine.handle(get("2").with_header("Range", "bytes=0..")).await;
    assert_eq!((r.status(), x_response(&r)), (StatusCode::OK, "1"));
    assert_eq!(r.content().as_ref(), b"foo");

    let r = engine.handle(get("3").with_header("Range", "bytes=0-1")).await;
    assert_eq!(r.headers().get("content-range"), Some("bytes 0-1/3"));
    assert_eq!(origin.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn cors_responses_vary_on_origin() {
    let (backend, origin) = origin(ZERO, |req, _| {
        ok(req, "max-age=300, stale-while-revalidate=30")
            .header(
                "Access-Control-Allow-Origin",
                req.headers().get("origin").unwrap_or_default(),
            )
            .header("Vary", "Accept-Encoding")
    });
    let engine = build(backend, config(), DefaultPolicy);
    let from = |site: &str| get(site).with_header("Origin", site);

    for site in ["https://a", "https://b", "https://a"] {
        let r = engine.handle(from(site)).await;
        assert_eq!(r.headers().get("access-control-allow-origin"), Some(site));
        assert_eq!(r.headers().get("vary"), Some("Accept-Encoding, Origin"));
    }
    assert_eq!(origin.calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn do_gzip_compresses_once_and_gunzips_for_plain_clients() {
    let (backend, origin) = origin(ZERO, |req, _| ok(req, "max-age=60").body(vec![0u8; 1024]));
    let engine = build(backend, config(), CacheStatusPolicy::wrap("my-cache", Gzip));

    let r = engine
        .handle(get("foo").with_header("Accept-Encoding", "gzip"))
        .await;
    assert_eq!(r.headers().get("content-encoding"), Some("gzip"));
    assert_eq!(r.headers().get("x-cache"), Some("miss"));
    assert!(!r.content().is_empty() && r.content().len() < 1024);
    assert_eq!(origin.request(1).headers().get("accept-encoding"), Some("gzip"));

    let r = engine.handle(get("bar")).await;
    assert_eq!(r.headers().get("x-cache"), Some("hit"));
    assert!(!r.headers().contains("content-encoding"));
    assert_eq!(r.content().as_ref(), &[0u8; 1024][..]);
    assert_eq!(origin.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn head_is_fetched_as_get_and_shares_the_object() {
    let (backend, origin) = origin(ZERO, |req, _| ok(req, "max-age=60").body("foo"));
    let engine = build(backend, config(), DefaultPolicy);

    let head = Request::new(Method::Head, "/resource")
        .with_header("Host", "example.test")
        .with_header("X-Request", "h");
    let r = engine.handle(head).await;
    assert!(r.content().is_empty());
    assert_eq!(r.headers().get("content-length"), Some("3"));
    assert_eq!(origin.request(1).method(), &Method::Get);

    let r = engine.handle(get("g")).await;
    assert_eq!((x_response(&r), r.content().as_ref()), ("h", &b"foo"[..]));
    assert_eq!(origin.calls(), 1);
}

// ---- failures ------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn unreachable_backend_goes_through_error_hook() {
    let backend = backend_fn(|_req: BackendRequest| async {
        Err::<Response, _>(BackendError::Unavailable("connection refused".into()))
    });
    let errors = RecordErrors::default();
    let engine = build(backend, config(), errors.clone());

    let r = engine.handle(get("foo")).await;
    assert_eq!(r.status(), StatusCode::BAD_GATEWAY);
    assert!(String::from_utf8_lossy(r.content()).contains("connection refused"));
    assert!(matches!(
        errors.errors.lock().unwrap().as_slice(),
        [FetchError::Unreachable(_)]
    ));
}

#[tokio::test(start_paused = true)]
async fn slow_backend_times_out() {
    let (backend, _origin) = origin(secs(5), |req, _| ok(req, "max-age=60"));
    let errors = RecordErrors::default();
    let engine = build(backend, config().with_backend_timeout(secs(2)), errors.clone());

    let start = Instant::now();
    let r = engine.handle(get("foo")).await;
    assert_eq!(start.elapsed(), secs(2));
    assert_eq!(r.status(), StatusCode::BAD_GATEWAY);
    assert_eq!(*errors.errors.lock().unwrap(), [FetchError::Timeout(secs(2))]);
}

#[tokio::test(start_paused = true)]
async fn panicking_hook_is_a_backend_error() {
    let (backend, origin) = origin(ZERO, |req, _| ok(req, "max-age=60"));
    let engine = build(backend, config(), PanicOnBoom);

    let r = engine.handle(get("boom")).await;
    assert_eq!(r.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert!(engine.storage().is_empty());

    let r = engine.handle(get("fine")).await;
    assert_eq!((r.status(), x_response(&r)), (StatusCode::OK, "fine"));
    assert_eq!(origin.calls(), 2);
}

// ---- maintenance ---------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn invalidate_forces_a_refetch() {
    let (backend, origin) = origin(ZERO, |req, _| ok(req, "max-age=60"));
    let engine = build(backend, config(), DefaultPolicy);

    engine.handle(get("foo")).await;
    let key = engine.cache_key(&get("any")).unwrap();
    assert!(engine.invalidate(&key));
    assert_eq!(x_response(&engine.handle(get("bar")).await), "bar");
    assert_eq!(origin.calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn sweeper_removes_expired_objects_and_stops_with_the_engine() {
    let (backend, _origin) = origin(ZERO, |req, _| ok(req, "max-age=1"));
    let engine = build(backend, config().with_sweep_interval(secs(1)), DefaultPolicy);

    engine.handle(get("foo")).await;
    assert_eq!(engine.storage().len(), 1);

    let sweeper = engine.spawn_sweeper();
    sleep(ms(2500)).await;
    assert!(engine.storage().is_empty());

    drop(engine);
    let stopped = tokio::time::timeout(secs(5), sweeper).await;
    assert!(matches!(stopped, Ok(Ok(()))));
}

#[test]
fn invalid_config_is_rejected() {
    let (backend, _origin) = origin(ZERO, |req, _| ok(req, ""));
    let result = Engine::builder(backend)
        .config(Config::default().with_max_object_size(0))
        .build();
    assert!(matches!(
        result,
        Err(ConfigError::Zero { field: "max_object_size" })
    ));
}
