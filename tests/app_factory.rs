mod common;

use std::sync::Arc;

use axum::{http::StatusCode, routing::get};
use tower::ServiceExt;

use common::{InMemoryUsers, body_string, extensions, get as get_request, settings, settings_from};
use truss::{
    app::{Blueprint, ExtensionSet, create_app, create_base_app, register_blueprints},
    application::error::AppError,
    infra::{
        http::{admin::AdminExtension, auth::LoginState, debug_toolbar::DebugToolbar},
        tasks::create_task_queue,
    },
};

const MAIN_ENDPOINTS: [(&str, &str); 7] = [
    ("main.index", "/"),
    ("main.login", "/login"),
    ("main.logout", "/logout"),
    ("main.me", "/me"),
    ("main.account", "/account"),
    ("main.change_password", "/account/password"),
    ("main.health", "/_health/db"),
];

#[tokio::test]
async fn base_app_without_debug_binds_core_extensions_only() {
    let set = extensions(Arc::new(InMemoryUsers::default()));
    let app = create_base_app(&settings(false), &set).expect("base app");

    assert_eq!(
        app.bound_extensions(),
        ["database", "password_hasher", "login_manager"]
    );
    assert!(!app.is_bound("admin"));
    assert!(!app.is_bound("debug_toolbar"));
    assert!(app.url_map().is_empty());
    assert!(app.log_sink().is_some());
    assert!(!app.json().is_pretty());
}

#[tokio::test]
async fn base_app_with_debug_binds_admin_and_toolbar() {
    let set = extensions(Arc::new(InMemoryUsers::default()));
    let app = create_base_app(&settings(true), &set).expect("base app");

    for name in ["database", "password_hasher", "admin", "debug_toolbar", "login_manager"] {
        assert!(app.is_bound(name), "{name} should be bound");
    }
    assert_eq!(app.url_for("admin.users"), Some("/admin/users"));
    assert_eq!(app.url_for("debug_toolbar.panel"), Some("/_debug"));
    assert!(app.json().is_pretty());
}

#[tokio::test]
async fn base_app_copies_settings_into_config_map() {
    let set = extensions(Arc::new(InMemoryUsers::default()));
    let app = create_base_app(&settings(true), &set).expect("base app");
    let config = app.config();

    assert_eq!(config.get_bool("DEBUG"), Some(true));
    assert_eq!(config.get_str("LOGIN_VIEW"), Some("main.login"));
    assert_eq!(config.get_str("SESSION_COOKIE_NAME"), Some("session"));
    assert!(config.get("SECRET_KEY").is_none());
}

#[tokio::test]
async fn apps_from_one_extension_set_keep_separate_state() {
    let set = extensions(Arc::new(InMemoryUsers::default()));
    let first = create_base_app(
        &settings_from("[auth]\nlogin_message = \"first\""),
        &set,
    )
    .expect("first app");
    let second = create_base_app(
        &settings_from("[auth]\nlogin_message = \"second\""),
        &set,
    )
    .expect("second app");

    let first_login = first.extension::<Arc<LoginState>>().expect("login state");
    let second_login = second.extension::<Arc<LoginState>>().expect("login state");
    assert!(!Arc::ptr_eq(first_login, second_login));
    assert_eq!(first_login.login_message, "first");
    assert_eq!(second_login.login_message, "second");
    assert_eq!(first.config().get_str("LOGIN_MESSAGE"), Some("first"));
    assert_eq!(second.config().get_str("LOGIN_MESSAGE"), Some("second"));
}

#[tokio::test]
async fn register_blueprints_mounts_main_routes() {
    let set = extensions(Arc::new(InMemoryUsers::default()));
    let app = create_base_app(&settings(false), &set).expect("base app");
    let app = register_blueprints(app).expect("routes registered");

    let routes: Vec<_> = app
        .url_map()
        .entries()
        .iter()
        .map(|entry| (entry.endpoint.as_str(), entry.path.as_str()))
        .collect();
    assert_eq!(routes, MAIN_ENDPOINTS);
    assert!(
        app.url_map()
            .entries()
            .iter()
            .all(|entry| entry.blueprint == "main")
    );
    assert_eq!(app.blueprints(), ["main"]);
}

#[tokio::test]
async fn registering_blueprints_twice_fails() {
    let set = extensions(Arc::new(InMemoryUsers::default()));
    let app = create_base_app(&settings(false), &set).expect("base app");
    let app = register_blueprints(app).expect("routes registered");

    let error = register_blueprints(app).err().expect("second registration fails");
    assert!(matches!(error, AppError::BlueprintAlreadyRegistered(name) if name == "main"));
}

#[tokio::test]
async fn conflicting_paths_are_rejected_without_partial_mounts() {
    let set = extensions(Arc::new(InMemoryUsers::default()));
    let app = create_base_app(&settings(false), &set).expect("base app");
    let mut app = register_blueprints(app).expect("routes registered");

    let blueprint = Blueprint::new("extra")
        .route("/extra", "page", get(|| async { "extra" }))
        .route("/login", "login", get(|| async { "shadow" }));
    let error = app.register_blueprint(blueprint, "/").expect_err("conflict");

    match error {
        AppError::RouteConflict { path, endpoint } => {
            assert_eq!(path, "/login");
            assert_eq!(endpoint, "main.login");
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert!(app.url_for("extra.page").is_none());
    assert!(!app.blueprints().iter().any(|name| name == "extra"));
}

#[tokio::test]
async fn binding_an_extension_twice_fails() {
    let set = extensions(Arc::new(InMemoryUsers::default()));
    let mut app = create_base_app(&settings(false), &set).expect("base app");

    let error = app.bind(&set.passwords).expect_err("already bound");
    assert!(matches!(error, AppError::ExtensionAlreadyBound("password_hasher")));
}

#[tokio::test]
async fn config_init_creates_warn_log_directory() {
    let dir = std::env::temp_dir().join(format!("truss-warn-{}", uuid::Uuid::new_v4()));
    let set = extensions(Arc::new(InMemoryUsers::default()));
    let settings = settings_from(&format!(
        "[logging]\nwarn_log_dir = \"{}\"",
        dir.display().to_string().replace('\\', "/")
    ));

    let app = create_base_app(&settings, &set).expect("base app");

    assert!(dir.is_dir());
    assert_eq!(
        app.log_sink().map(|sink| sink.directory.clone()),
        Some(Some(dir.clone()))
    );
    let _ = std::fs::remove_dir_all(dir);
}

#[tokio::test]
async fn task_queue_configuration_covers_app_configuration() {
    let settings = settings(false);
    let set = extensions(Arc::new(InMemoryUsers::default()));
    let app = create_base_app(&settings, &set).expect("base app");
    let queue = create_task_queue(&settings).expect("task queue");

    assert_eq!(queue.broker_url(), settings.broker_url);
    assert!(queue.conf().contains_all(app.config()));
}

#[tokio::test]
async fn full_app_serves_index_and_not_found() {
    let set = extensions(Arc::new(InMemoryUsers::default()));
    let router = create_app(&settings(false), &set)
        .expect("full app")
        .into_router();

    let response = router.clone().oneshot(get_request("/")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(body_string(response).await.contains("Hello, Guest"));

    let response = router.oneshot(get_request("/missing")).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn health_is_unavailable_without_a_pool() {
    let set = extensions(Arc::new(InMemoryUsers::default()));
    let router = create_app(&settings(false), &set)
        .expect("full app")
        .into_router();

    let response = router.oneshot(get_request("/_health/db")).await.unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn debug_toolbar_records_requests() {
    let set = extensions(Arc::new(InMemoryUsers::default()));
    let router = create_app(&settings(true), &set)
        .expect("full app")
        .into_router();

    let response = router.clone().oneshot(get_request("/")).await.unwrap();
    assert!(response.headers().contains_key("x-debug-elapsed-ms"));

    let response = router
        .oneshot(get_request("/_debug/requests"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(!response.headers().contains_key("x-debug-elapsed-ms"));
    let records: serde_json::Value =
        serde_json::from_str(&body_string(response).await).expect("json body");
    let paths: Vec<_> = records
        .as_array()
        .expect("array")
        .iter()
        .filter_map(|record| record["path"].as_str())
        .collect();
    assert_eq!(paths, ["/"]);
}

#[tokio::test]
async fn admin_mount_and_toolbar_capacity_are_configurable() {
    let set = ExtensionSet {
        admin: AdminExtension::mounted_at("/manage"),
        debug_toolbar: DebugToolbar::default().with_capacity(1),
        ..extensions(Arc::new(InMemoryUsers::default()))
    };
    let app = create_app(&settings(true), &set).expect("full app");
    assert_eq!(app.url_for("admin.index"), Some("/manage"));
    assert_eq!(app.url_for("admin.users"), Some("/manage/users"));
    let router = app.into_router();

    let response = router.clone().oneshot(get_request("/admin/users")).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    router.clone().oneshot(get_request("/")).await.unwrap();

    let response = router
        .oneshot(get_request("/_debug/requests"))
        .await
        .unwrap();
    let records: serde_json::Value =
        serde_json::from_str(&body_string(response).await).expect("json body");
    let paths: Vec<_> = records
        .as_array()
        .expect("array")
        .iter()
        .filter_map(|record| record["path"].as_str())
        .collect();
    assert_eq!(paths, ["/"]);
}

#[derive(Clone, Default)]
struct CapturedLog(Arc<std::sync::Mutex<Vec<u8>>>);

impl std::io::Write for CapturedLog {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[tokio::test]
async fn assembly_log_reports_the_debug_flag() {
    for debug in [false, true] {
        let captured = CapturedLog::default();
        let writer = captured.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::INFO)
            .with_ansi(false)
            .with_writer(move || writer.clone())
            .finish();

        let set = extensions(Arc::new(InMemoryUsers::default()));
        tracing::subscriber::with_default(subscriber, || {
            create_base_app(&settings(debug), &set).expect("base app");
        });

        let output = String::from_utf8(captured.0.lock().unwrap().clone()).unwrap();
        let line = output
            .lines()
            .find(|line| line.contains("application assembled"))
            .expect("assembly is logged");
        assert!(line.contains(&format!("debug={debug}")), "{line}");
    }
}
