mod common;

use std::{net::SocketAddr, sync::Arc};

use axum::{
    Json, Router,
    body::Body,
    extract::ConnectInfo,
    http::{HeaderMap, Request, StatusCode, header},
    routing::get,
};
use serde_json::{Value, json};
use tower::ServiceExt;

use common::{InMemoryUsers, body_string, extensions, location, settings, settings_from};
use truss::{
    app::{Application, Blueprint, create_app, create_base_app, register_blueprints},
    config::Settings,
    infra::http::proxy::{ConnectionInfo, OriginalConnection},
};

async fn echo_connection(
    connection: ConnectionInfo,
    original: Option<axum::Extension<OriginalConnection>>,
    headers: HeaderMap,
) -> Json<Value> {
    Json(json!({
        "remote": connection.remote_addr.map(|addr| addr.ip().to_string()),
        "scheme": connection.scheme,
        "host": connection.host,
        "port": connection.port,
        "prefix": connection.prefix,
        "host_header": headers.get(header::HOST).and_then(|value| value.to_str().ok()),
        "original_remote": original
            .and_then(|axum::Extension(OriginalConnection(info))| info.remote_addr)
            .map(|addr| addr.ip().to_string()),
    }))
}

fn with_echo(mut app: Application) -> Router {
    let blueprint = Blueprint::new("echo").route("/echo", "connection", get(echo_connection));
    app.register_blueprint(blueprint, "/").expect("echo mounted");
    app.into_router()
}

fn full_router(settings: &Settings) -> Router {
    let set = extensions(Arc::new(InMemoryUsers::default()));
    with_echo(create_app(settings, &set).expect("full app"))
}

fn unwrapped_router(settings: &Settings) -> Router {
    let set = extensions(Arc::new(InMemoryUsers::default()));
    let app = create_base_app(settings, &set).expect("base app");
    with_echo(register_blueprints(app).expect("routes registered"))
}

fn request(uri: &str, forwarded: &[(&str, &str)]) -> Request<Body> {
    let mut builder = Request::builder()
        .uri(uri)
        .header(header::HOST, "internal:5000");
    for (name, value) in forwarded {
        builder = builder.header(*name, *value);
    }
    let mut request = builder.body(Body::empty()).unwrap();
    request
        .extensions_mut()
        .insert(ConnectInfo(SocketAddr::from(([10, 0, 0, 2], 41000))));
    request
}

async fn connection_json(router: Router, request: Request<Body>) -> Value {
    let response = router.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    serde_json::from_str(&body_string(response).await).expect("json body")
}

#[tokio::test]
async fn forwarded_headers_from_one_hop_are_applied() {
    let body = connection_json(
        full_router(&settings(false)),
        request(
            "/echo",
            &[
                ("x-forwarded-for", "203.0.113.50, 198.51.100.7"),
                ("x-forwarded-proto", "https"),
                ("x-forwarded-host", "example.com"),
            ],
        ),
    )
    .await;

    assert_eq!(body["remote"], "198.51.100.7");
    assert_eq!(body["scheme"], "https");
    assert_eq!(body["host"], "example.com");
    assert_eq!(body["host_header"], "example.com");
    assert_eq!(body["original_remote"], "10.0.0.2");
}

#[tokio::test]
async fn port_and_prefix_are_ignored_by_default() {
    let body = connection_json(
        full_router(&settings(false)),
        request(
            "/echo",
            &[
                ("x-forwarded-port", "8443"),
                ("x-forwarded-prefix", "/app"),
            ],
        ),
    )
    .await;

    assert_eq!(body["host"], "internal:5000");
    assert_eq!(body["port"], 5000);
    assert_eq!(body["prefix"], "");
}

#[tokio::test]
async fn requests_without_forwarded_headers_match_the_unwrapped_app() {
    let settings = settings(false);
    let wrapped = connection_json(full_router(&settings), request("/echo", &[])).await;
    let unwrapped = connection_json(unwrapped_router(&settings), request("/echo", &[])).await;

    assert_eq!(wrapped["remote"], unwrapped["remote"]);
    assert_eq!(wrapped["scheme"], unwrapped["scheme"]);
    assert_eq!(wrapped["host"], unwrapped["host"]);
    assert_eq!(wrapped["port"], unwrapped["port"]);
    assert_eq!(wrapped["prefix"], unwrapped["prefix"]);
    assert_eq!(wrapped["host_header"], unwrapped["host_header"]);
    assert_eq!(unwrapped["original_remote"], Value::Null);
}

#[tokio::test]
async fn unwrapped_app_ignores_forwarded_headers() {
    let body = connection_json(
        unwrapped_router(&settings(false)),
        request(
            "/echo",
            &[
                ("x-forwarded-for", "198.51.100.7"),
                ("x-forwarded-host", "example.com"),
            ],
        ),
    )
    .await;

    assert_eq!(body["remote"], "10.0.0.2");
    assert_eq!(body["host"], "internal:5000");
}

#[tokio::test]
async fn trusted_prefix_is_applied_to_login_redirects() {
    let router = full_router(&settings_from("[proxy]\nx_prefix = 1"));
    let response = router
        .oneshot(request("/me", &[("x-forwarded-prefix", "/app/")]))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::SEE_OTHER);
    assert_eq!(location(&response), "/app/login?next=%2Fapp%2Fme");
}
