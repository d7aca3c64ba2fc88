//! Application factories: base assembly, route registration and the full entry point.

use std::sync::Arc;

use tracing::info;

use crate::{
    application::{error::AppError, json::JsonEncoder, passwords::PasswordHasher},
    infra::{
        db::Database,
        http::{
            admin::AdminExtension, auth::LoginManager, debug_toolbar::DebugToolbar,
            proxy::ProxyFix, site,
        },
        telemetry::LogSink,
    },
};

use super::{AppConfig, Application, ConfigMap};

/// Extension singletons owned by the composition root and bound by [`create_base_app`].
#[derive(Default)]
pub struct ExtensionSet {
    pub database: Database,
    pub passwords: PasswordHasher,
    pub login_manager: LoginManager,
    pub admin: AdminExtension,
    pub debug_toolbar: DebugToolbar,
}

/// Builds an application from `config` and binds the shared extensions.
///
/// Admin UI and debug toolbar are bound only when `debug` is enabled.
pub fn create_base_app<C>(config: &C, extensions: &ExtensionSet) -> Result<Application, AppError>
where
    C: AppConfig + ?Sized,
{
    let settings = Arc::new(config.settings().clone());
    let mut app = Application::new(settings)?;

    let merged = ConfigMap::from_settings(app.settings());
    app.config_mut().update(&merged);
    config.init_app(&mut app)?;

    let warn_log_dir = app.settings().logging.warn_log_dir.clone();
    app.attach_log_sink(LogSink::warnings(warn_log_dir));

    app.bind(&extensions.database)?;
    app.bind(&extensions.passwords)?;

    let debug_enabled = app.settings().debug;
    if debug_enabled {
        app.bind(&extensions.admin)?;
        app.bind(&extensions.debug_toolbar)?;
    }

    app.bind(&extensions.login_manager)?;
    app.set_json_encoder(JsonEncoder::new(debug_enabled));

    info!(
        target = "truss::app::create_base_app",
        debug = debug_enabled,
        extensions = ?app.bound_extensions(),
        "application assembled"
    );
    Ok(app)
}

/// Mounts the `main` blueprint at `/`.
pub fn register_blueprints(mut app: Application) -> Result<Application, AppError> {
    app.register_blueprint(site::blueprint(), "/")?;
    Ok(app)
}

/// Base assembly, then routes, then the proxy adapter around the entry point.
pub fn create_app<C>(config: &C, extensions: &ExtensionSet) -> Result<Application, AppError>
where
    C: AppConfig + ?Sized,
{
    let app = create_base_app(config, extensions)?;
    let mut app = register_blueprints(app)?;
    let proxy = ProxyFix::from_settings(&app.settings().proxy);
    proxy.wrap(&mut app);
    Ok(app)
}
