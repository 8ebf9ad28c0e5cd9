//! Backend fetches: building the backend request, interpreting the
//! response, and committing the outcome to storage.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::{FetchError, Inner};
use crate::backend::BackendRequest;
use crate::cache::{
    CacheKey, CacheObject, Cacheability, Freshness, FreshnessInput, Validators, Variant, compute,
    vary_names,
};
use crate::delivery::{encoding, vary};
use crate::http::{Headers, Method, Request, Response, StatusCode};
use crate::policy::{BackendContext, BackendResponseAction, Beresp, Phase, guarded};

/// Connection-scoped fields that never travel through a cache.
const HOP_BY_HOP: [&str; 7] = [
    "connection",
    "keep-alive",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Fields a `304` may not overwrite on the stored object.
const NOT_MERGED: [&str; 4] = [
    "content-length",
    "content-encoding",
    "content-range",
    "transfer-encoding",
];

/// One backend fetch and what it is for.
pub(super) struct FetchJob<'a> {
    /// `None` for passes, which are never stored.
    key: Option<&'a CacheKey>,
    request: &'a Request,
    grace_cap: Option<Duration>,
    credentialed: bool,
    /// Object being revalidated; its validators make the fetch conditional.
    stale: Option<&'a CacheObject>,
    background: bool,
}

impl<'a> FetchJob<'a> {
    pub(super) fn pass(request: &'a Request) -> Self {
        Self {
            key: None,
            request,
            grace_cap: None,
            credentialed: false,
            stale: None,
            background: false,
        }
    }

    pub(super) fn lookup(
        key: &'a CacheKey,
        request: &'a Request,
        grace_cap: Option<Duration>,
        credentialed: bool,
    ) -> Self {
        Self {
            key: Some(key),
            request,
            grace_cap,
            credentialed,
            stale: None,
            background: false,
        }
    }

    #[must_use]
    pub(super) fn with_stale(mut self, stale: Option<&'a CacheObject>) -> Self {
        self.stale = stale;
        self
    }

    #[must_use]
    pub(super) fn background(mut self) -> Self {
        self.background = true;
        self
    }
}

/// Outcome of a successful fetch.
pub(super) enum Fetched {
    /// Inserted into storage.
    Stored(Arc<CacheObject>),
    /// Delivered to the requester only.
    Transient(Response),
}

impl Inner {
    pub(super) async fn fetch(&self, job: FetchJob<'_>) -> Result<Fetched, FetchError> {
        let mut bereq = self.backend_request(&job);
        guarded(Phase::BackendFetch, || self.policy.on_backend_fetch(&mut bereq))?;
        let conditional = bereq.headers().contains("if-none-match")
            || bereq.headers().contains("if-modified-since");

        let mut response = self.send(bereq.clone()).await?;
        strip_hop_by_hop(response.headers_mut());

        if response.status() == StatusCode::NOT_MODIFIED {
            if !conditional {
                return Err(FetchError::UnexpectedNotModified);
            }
            match job.stale.filter(|_| job.key.is_some()) {
                Some(stale) => {
                    debug!(path = job.request.path(), "revalidated with 304");
                    response = merge_not_modified(stale, response);
                }
                // A pass, or validators that came from a hook rather than
                // from a stored object: the 304 belongs to the client.
                None => return Ok(Fetched::Transient(response)),
            }
        }

        vary::vary_on_origin_for_cors(response.headers_mut());
        if job.key.is_some() {
            response.headers_mut().remove("content-length");
        }
        let freshness = compute(
            FreshnessInput {
                status: response.status(),
                headers: response.headers(),
                credentialed: job.credentialed,
                grace_cap: job.grace_cap,
                now: Utc::now(),
            },
            &self.config,
        );
        if job.key.is_some() {
            response.headers_mut().remove("age");
        }

        let mut ctx = BackendContext::new(job.request, &bereq, Beresp::new(response, freshness));
        let action = guarded(Phase::BackendResponse, || {
            self.policy.on_backend_response(&mut ctx)
        })?;
        if action == BackendResponseAction::Abandon {
            return Err(FetchError::Abandoned);
        }
        let (response, freshness, do_gzip) = ctx.into_beresp().into_parts();

        match job.key {
            Some(key) => Ok(self.commit(key, &job, response, freshness, do_gzip)),
            None => Ok(Fetched::Transient(response)),
        }
    }

    fn backend_request(&self, job: &FetchJob<'_>) -> BackendRequest {
        let mut bereq = BackendRequest::from_request(job.request);
        bereq.set_background(job.background);
        if job.key.is_none() {
            return bereq;
        }

        // Always fetch the full representation; ranges and client
        // conditionals are answered from the stored object.
        if *bereq.method() == Method::Head {
            bereq.set_method(Method::Get);
        }
        let headers = bereq.headers_mut();
        for name in ["range", "if-range", "if-none-match", "if-modified-since"] {
            headers.remove(name);
        }
        if self.config.gzip_support {
            headers.set("Accept-Encoding", "gzip");
        }

        if let Some(validators) = job.stale.map(CacheObject::validators) {
            if let Some(etag) = &validators.etag {
                headers.set("If-None-Match", etag.as_str());
            }
            if let Some(modified) = &validators.last_modified {
                headers.set("If-Modified-Since", modified.as_str());
            }
            bereq.set_conditional(!validators.is_empty());
        }
        bereq
    }

    async fn send(&self, bereq: BackendRequest) -> Result<Response, FetchError> {
        let timeout = self.config.backend_timeout;
        match tokio::time::timeout(timeout, self.backend.fetch(bereq)).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(FetchError::Timeout(timeout)),
        }
    }

    /// Stores, marks or discards a fetched response according to its
    /// settled freshness.
    fn commit(
        &self,
        key: &CacheKey,
        job: &FetchJob<'_>,
        mut response: Response,
        mut freshness: Freshness,
        do_gzip: bool,
    ) -> Fetched {
        let has_validators = !Validators::from_headers(response.headers()).is_empty();
        freshness.settle(job.grace_cap, has_validators, &self.config);
        let request_headers = job.request.headers();

        if freshness.cacheability() == Cacheability::Cacheable {
            if do_gzip {
                match encoding::compress(&mut response) {
                    Ok(true) => debug!(key = %key, size = response.content().len(), "body compressed"),
                    Ok(false) => {}
                    Err(error) => warn!(key = %key, %error, "gzip failed, storing uncompressed"),
                }
            }
            if response.content().len() > self.config.max_object_size {
                debug!(key = %key, size = response.content().len(), "object too large, not stored");
                return Fetched::Transient(response);
            }
        }

        let variant = Variant::capture(&vary_names(response.headers()), request_headers);
        let now = Instant::now();
        match freshness.cacheability() {
            Cacheability::Cacheable => {
                let object = Arc::new(CacheObject::new(response, &freshness, variant, now));
                debug!(
                    key = %key,
                    status = object.status().as_u16(),
                    ttl = ?object.ttl(),
                    grace = ?object.grace(),
                    keep = ?object.keep(),
                    background = job.background,
                    "object stored"
                );
                self.storage
                    .insert(key.clone(), Arc::clone(&object), request_headers);
                Fetched::Stored(object)
            }
            Cacheability::HitForMiss => {
                let ttl = if freshness.ttl().is_zero() {
                    self.config.hit_for_miss_ttl
                } else {
                    freshness.ttl()
                };
                debug!(key = %key, ttl = ?ttl, "hit-for-miss recorded");
                let marker = CacheObject::hit_for_miss_marker(ttl, variant, now);
                self.storage.insert(key.clone(), Arc::new(marker), request_headers);
                Fetched::Transient(response)
            }
            Cacheability::Uncacheable => {
                debug!(key = %key, status = response.status().as_u16(), "response not cacheable");
                self.storage.invalidate(key, request_headers);
                Fetched::Transient(response)
            }
        }
    }
}

fn strip_hop_by_hop(headers: &mut Headers) {
    let listed: Vec<String> = headers
        .tokens("connection")
        .map(str::to_ascii_lowercase)
        .collect();
    for name in HOP_BY_HOP {
        headers.remove(name);
    }
    for name in &listed {
        headers.remove(name);
    }
}

/// The stored object refreshed with the end-to-end fields of a `304`; body
/// and status stay.
fn merge_not_modified(stale: &CacheObject, update: Response) -> Response {
    let mut merged = stale.to_response();
    let (_, fields, _) = update.into_parts();
    let target = merged.headers_mut();
    let mut replaced: Vec<String> = Vec::new();
    for (name, value) in fields.iter() {
        let lower = name.to_ascii_lowercase();
        if NOT_MERGED.contains(&lower.as_str()) {
            continue;
        }
        if !replaced.contains(&lower) {
            target.remove(&lower);
            replaced.push(lower);
        }
        target.insert(name, value);
    }
    merged
}
