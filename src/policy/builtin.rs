//! Builtin decisions, used by the default [`Policy`](super::Policy) methods
//! and callable from custom policies.

use tracing::debug;

use super::{BackendContext, BackendResponseAction, ReceiveAction};
use crate::context::Context;
use crate::engine::FetchError;
use crate::http::{Response, StatusCode};

/// Body of the synthetic response sent when the backend cannot be used.
pub const BACKEND_ERROR_BODY: &str = "Backend fetch failed";

/// Looks up GET and HEAD requests; passes everything else, and requests
/// carrying `Authorization` or `Cookie` unless
/// [`Context::allow_credentials`] is set.
pub fn receive(ctx: &Context) -> ReceiveAction {
    let request = ctx.request();
    if !request.method().is_cacheable() {
        return ReceiveAction::Pass;
    }
    let credentialed =
        request.headers().contains("authorization") || request.headers().contains("cookie");
    if credentialed && !ctx.allow_credentials {
        return ReceiveAction::Pass;
    }
    ReceiveAction::Lookup
}

/// Abandons background refreshes answered with a server error, so a graced
/// object is not replaced by an error page; delivers everything else.
pub fn backend_response(ctx: &BackendContext<'_>) -> BackendResponseAction {
    let status = ctx.beresp().response().status();
    if ctx.bereq().is_background() && status.is_server_error() {
        debug!(status = status.as_u16(), "abandoning background 5xx");
        return BackendResponseAction::Abandon;
    }
    BackendResponseAction::Deliver
}

/// A `503 Service Unavailable` with a plain-text explanation.
pub fn backend_error(_error: &FetchError) -> Response {
    Response::new(StatusCode::SERVICE_UNAVAILABLE)
        .header("Content-Type", "text/plain; charset=utf-8")
        .header("Retry-After", "5")
        .body(BACKEND_ERROR_BODY)
}
