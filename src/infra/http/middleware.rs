//! Request correlation and the warning-sink response logger.

use std::time::Instant;

use axum::{
    body::Body,
    http::{HeaderMap, HeaderName, HeaderValue, Request},
    middleware::Next,
    response::Response,
};
use tracing::{error, warn};
use uuid::Uuid;

use crate::application::error::ErrorReport;

use super::proxy::ConnectionInfo;

pub const REQUEST_ID_HEADER: HeaderName = HeaderName::from_static("x-request-id");
const MAX_REQUEST_ID_LEN: usize = 64;

#[derive(Debug, Clone)]
pub struct RequestContext {
    pub request_id: String,
}

impl RequestContext {
    /// Keeps a well-formed upstream `x-request-id`, otherwise mints a new one.
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let request_id = headers
            .get(&REQUEST_ID_HEADER)
            .and_then(|value| value.to_str().ok())
            .filter(|value| is_valid_request_id(value))
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        Self { request_id }
    }
}

fn is_valid_request_id(value: &str) -> bool {
    !value.is_empty()
        && value.len() <= MAX_REQUEST_ID_LEN
        && value
            .bytes()
            .all(|byte| byte.is_ascii_alphanumeric() || byte == b'-' || byte == b'_')
}

pub async fn set_request_context(mut request: Request<Body>, next: Next) -> Response {
    let ctx = RequestContext::from_headers(request.headers());
    request.extensions_mut().insert(ctx.clone());

    let mut response = next.run(request).await;
    if let Ok(value) = HeaderValue::from_str(&ctx.request_id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    response.extensions_mut().insert(ctx);
    response
}

/// Logs every 4xx at `warn` and every 5xx at `error`, with the handler's error chain.
pub async fn log_responses(request: Request<Body>, next: Next) -> Response {
    let started = Instant::now();
    let method = request.method().clone();
    let uri = request.uri().clone();
    let extensions = request.extensions();
    let request_id = extensions
        .get::<RequestContext>()
        .map(|ctx| ctx.request_id.clone())
        .unwrap_or_default();
    let client = extensions
        .get::<ConnectionInfo>()
        .and_then(|info| info.remote_addr)
        .map(|addr| addr.ip().to_string())
        .unwrap_or_default();

    let mut response = next.run(request).await;
    let status = response.status();
    if !status.is_client_error() && !status.is_server_error() {
        return response;
    }

    let (source, chain) = response
        .extensions_mut()
        .remove::<ErrorReport>()
        .map(|report| (report.source, report.messages))
        .unwrap_or(("unknown", Vec::new()));
    let detail = chain
        .first()
        .map(String::as_str)
        .unwrap_or("no diagnostic available");
    let elapsed_ms = elapsed_millis(started);

    if status.is_server_error() {
        error!(
            target = "truss::http::response",
            status = status.as_u16(),
            %method,
            path = uri.path(),
            elapsed_ms,
            source,
            detail,
            ?chain,
            request_id,
            client,
            "request failed",
        );
    } else {
        warn!(
            target = "truss::http::response",
            status = status.as_u16(),
            %method,
            path = uri.path(),
            elapsed_ms,
            source,
            detail,
            request_id,
            client,
            "client request error",
        );
    }

    response
}

fn elapsed_millis(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}
