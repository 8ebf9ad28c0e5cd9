//! # edgecache
//!
//! An in-memory HTTP response cache that sits in front of an origin.
//!
//! Each stored object carries a TTL, a grace window (served stale while one
//! background refresh runs) and a keep window (held for conditional
//! revalidation). Concurrent misses on a key share one backend fetch;
//! responses that must not be shared leave a hit-for-miss marker so later
//! requests skip coalescing. A [`Policy`] hooks every phase.
//!
//! ## Quick Start
//!
//! ```rust
//! use edgecache::backend::{BackendError, BackendRequest, backend_fn};
//! use edgecache::http::{Method, Request, Response, StatusCode};
//! use edgecache::policy::CacheStatusPolicy;
//! use edgecache::Engine;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let origin = backend_fn(|_req: BackendRequest| async {
//!     Ok::<_, BackendError>(
//!         Response::new(StatusCode::OK)
//!             .header("Cache-Control", "max-age=60, stale-while-revalidate=30")
//!             .body("Hello, World!"),
//!     )
//! });
//!
//! let engine = Engine::builder(origin)
//!     .policy(CacheStatusPolicy::new("edge"))
//!     .build()
//!     .expect("default config is valid");
//!
//! let request = || Request::new(Method::Get, "/").with_header("Host", "example.com");
//! let first = engine.handle(request()).await;
//! let second = engine.handle(request()).await;
//!
//! assert_eq!(first.headers().get("cache-status"), Some("edge; fwd=miss"));
//! assert_eq!(second.headers().get("cache-status"), Some("edge; hit"));
//! # }
//! ```

// ── Wire types ───────────────────────────────────────────────────────────────
pub mod http;

// ── Engine and its collaborators ─────────────────────────────────────────────
pub mod backend;
pub mod cache;
pub mod config;
pub mod context;
pub mod delivery;
pub mod engine;
pub mod policy;

// ── Convenience re-exports ────────────────────────────────────────────────────
pub use backend::{Backend, BackendError, HttpBackend};
pub use config::{Config, ConfigError};
pub use context::{CacheStatus, Context};
pub use engine::{Engine, EngineBuilder, FetchError};
pub use http::{Headers, Method, Request, Response, StatusCode};
pub use policy::{DefaultPolicy, Policy};
