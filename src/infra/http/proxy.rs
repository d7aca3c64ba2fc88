//! Reverse-proxy adapter honouring `X-Forwarded-*` headers from trusted hops.

use std::{
    convert::Infallible,
    net::{IpAddr, SocketAddr},
};

use axum::{
    Router,
    body::Body,
    extract::{ConnectInfo, FromRequestParts, State},
    http::{Extensions, HeaderMap, HeaderName, HeaderValue, Request, Uri, header, request::Parts},
    middleware::{self, Next},
    response::Response,
};
use tracing::trace;

use crate::app::Application;
use crate::config::ProxySettings;

const X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");
const X_FORWARDED_PROTO: HeaderName = HeaderName::from_static("x-forwarded-proto");
const X_FORWARDED_HOST: HeaderName = HeaderName::from_static("x-forwarded-host");
const X_FORWARDED_PORT: HeaderName = HeaderName::from_static("x-forwarded-port");
const X_FORWARDED_PREFIX: HeaderName = HeaderName::from_static("x-forwarded-prefix");

/// Connection data as seen by handlers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub remote_addr: Option<SocketAddr>,
    pub scheme: String,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub prefix: String,
}

impl ConnectionInfo {
    /// Reads the connection as delivered by the listener, ignoring forwarded headers.
    pub fn observe(uri: &Uri, headers: &HeaderMap, extensions: &Extensions) -> Self {
        let remote_addr = extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| *addr);
        let scheme = uri.scheme_str().unwrap_or("http").to_string();
        let host = headers
            .get(header::HOST)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string)
            .or_else(|| uri.authority().map(|authority| authority.to_string()));
        let port = host.as_deref().and_then(host_port);

        Self {
            remote_addr,
            scheme,
            host,
            port,
            prefix: String::new(),
        }
    }

    /// Prefixes an application path with the externally visible mount point.
    pub fn external_path(&self, path: &str) -> String {
        format!("{}{}", self.prefix, path)
    }
}

/// The connection before the proxy adapter rewrote it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OriginalConnection(pub ConnectionInfo);

impl<S> FromRequestParts<S> for ConnectionInfo
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(parts
            .extensions
            .get::<ConnectionInfo>()
            .cloned()
            .unwrap_or_else(|| ConnectionInfo::observe(&parts.uri, &parts.headers, &parts.extensions)))
    }
}

/// Rewrites trust-sensitive request data using the configured number of proxy hops per header.
///
/// A hop count of zero ignores the header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProxyFix {
    pub x_for: usize,
    pub x_proto: usize,
    pub x_host: usize,
    pub x_port: usize,
    pub x_prefix: usize,
}

impl Default for ProxyFix {
    fn default() -> Self {
        Self {
            x_for: 1,
            x_proto: 1,
            x_host: 1,
            x_port: 0,
            x_prefix: 0,
        }
    }
}

impl ProxyFix {
    pub fn from_settings(settings: &ProxySettings) -> Self {
        Self {
            x_for: settings.x_for,
            x_proto: settings.x_proto,
            x_host: settings.x_host,
            x_port: settings.x_port,
            x_prefix: settings.x_prefix,
        }
    }

    /// Replaces the application's entry point with the adapter.
    pub fn wrap(self, app: &mut Application) {
        app.wrap_entry_point(move |router| self.layer(router));
    }

    /// Applies the adapter directly to a finished router.
    pub fn layer(self, router: Router) -> Router {
        router.layer(middleware::from_fn_with_state(self, rewrite_request))
    }

    pub fn rewrite(&self, headers: &HeaderMap, original: &ConnectionInfo) -> ConnectionInfo {
        let mut info = original.clone();

        if let Some(ip) = trusted_value(headers, &X_FORWARDED_FOR, self.x_for)
            .and_then(|value| value.parse::<IpAddr>().ok())
        {
            let port = original.remote_addr.map(|addr| addr.port()).unwrap_or(0);
            info.remote_addr = Some(SocketAddr::new(ip, port));
        }

        if let Some(proto) = trusted_value(headers, &X_FORWARDED_PROTO, self.x_proto) {
            info.scheme = proto.to_ascii_lowercase();
        }

        if let Some(host) = trusted_value(headers, &X_FORWARDED_HOST, self.x_host) {
            info.port = host_port(&host);
            info.host = Some(host);
        }

        if let Some(port) = trusted_value(headers, &X_FORWARDED_PORT, self.x_port)
            .and_then(|value| value.parse::<u16>().ok())
        {
            info.host = info
                .host
                .as_deref()
                .map(|host| format!("{}:{port}", strip_port(host)));
            info.port = Some(port);
        }

        if let Some(prefix) = trusted_value(headers, &X_FORWARDED_PREFIX, self.x_prefix) {
            info.prefix = prefix.trim_end_matches('/').to_string();
        }

        info
    }
}

async fn rewrite_request(
    State(fix): State<ProxyFix>,
    mut request: Request<Body>,
    next: Next,
) -> Response {
    let original = ConnectionInfo::observe(request.uri(), request.headers(), request.extensions());
    let rewritten = fix.rewrite(request.headers(), &original);

    if rewritten.host != original.host {
        if let Some(value) = rewritten
            .host
            .as_deref()
            .and_then(|host| HeaderValue::from_str(host).ok())
        {
            request.headers_mut().insert(header::HOST, value);
        }
    }
    if rewritten.remote_addr != original.remote_addr {
        if let Some(addr) = rewritten.remote_addr {
            request.extensions_mut().insert(ConnectInfo(addr));
        }
    }

    trace!(
        target = "truss::http::proxy",
        remote_addr = ?rewritten.remote_addr,
        scheme = %rewritten.scheme,
        host = ?rewritten.host,
        "connection rewritten"
    );

    request.extensions_mut().insert(OriginalConnection(original));
    request.extensions_mut().insert(rewritten);
    next.run(request).await
}

/// The value appended by the `hops`-th proxy counted from the server, if that many were present.
pub fn trusted_value(headers: &HeaderMap, name: &HeaderName, hops: usize) -> Option<String> {
    if hops == 0 {
        return None;
    }
    let values: Vec<&str> = headers
        .get_all(name)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .collect();
    if values.len() < hops {
        return None;
    }
    Some(values[values.len() - hops].to_string())
}

fn host_port(host: &str) -> Option<u16> {
    let (_, port) = host.rsplit_once(':')?;
    if host.ends_with(']') {
        return None;
    }
    port.parse().ok()
}

fn strip_port(host: &str) -> &str {
    match host.rsplit_once(':') {
        Some((name, port)) if !host.ends_with(']') && port.parse::<u16>().is_ok() => name,
        _ => host,
    }
}
