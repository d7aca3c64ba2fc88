//! Application object, extension registry and factories.

mod blueprint;
mod config_map;
mod extension;
mod factory;
mod state;

pub use blueprint::{Blueprint, RouteEntry, UrlMap, join_path};
pub use config_map::ConfigMap;
pub use extension::{AppConfig, Extension};
pub use factory::{ExtensionSet, create_app, create_base_app, register_blueprints};
pub use state::AppState;

use std::sync::Arc;

use axum::{Router, http::Extensions, middleware};
use axum_extra::extract::cookie::Key;
use secrecy::ExposeSecret;
use tracing::debug;

use crate::{
    application::{error::AppError, json::JsonEncoder},
    config::{MIN_SECRET_KEY_LEN, Settings},
    infra::{
        http::{
            middleware::{log_responses, set_request_context},
            not_found,
        },
        telemetry::LogSink,
    },
};

/// Layers a finalised route set with state-aware middleware.
pub type RequestHook = Box<dyn FnOnce(Router<AppState>, &AppState) -> Router<AppState> + Send>;

/// Replaces the servable entry point, e.g. with a proxy adapter.
pub type EntryPointWrapper = Box<dyn FnOnce(Router) -> Router + Send>;

/// The web application under assembly.
///
/// Extensions and blueprints are attached while the application is mutable;
/// [`Application::into_router`] consumes it into a servable [`Router`].
pub struct Application {
    settings: Arc<Settings>,
    config: ConfigMap,
    extensions: Extensions,
    bound: Vec<&'static str>,
    blueprints: Vec<String>,
    routes: Router<AppState>,
    url_map: UrlMap,
    hooks: Vec<RequestHook>,
    wrappers: Vec<EntryPointWrapper>,
    json: JsonEncoder,
    log_sink: Option<LogSink>,
    session_key: Key,
}

impl Application {
    pub fn new(settings: Arc<Settings>) -> Result<Self, AppError> {
        let secret = settings.secret_key.expose_secret();
        if secret.len() < MIN_SECRET_KEY_LEN {
            return Err(AppError::validation(format!(
                "secret key must be at least {MIN_SECRET_KEY_LEN} bytes"
            )));
        }
        let session_key = Key::derive_from(secret.as_bytes());

        Ok(Self {
            settings,
            config: ConfigMap::new(),
            extensions: Extensions::new(),
            bound: Vec::new(),
            blueprints: Vec::new(),
            routes: Router::new(),
            url_map: UrlMap::default(),
            hooks: Vec::new(),
            wrappers: Vec::new(),
            json: JsonEncoder::default(),
            log_sink: None,
            session_key,
        })
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn config(&self) -> &ConfigMap {
        &self.config
    }

    pub fn config_mut(&mut self) -> &mut ConfigMap {
        &mut self.config
    }

    /// Binds an extension, failing if one with the same name is already bound.
    pub fn bind(&mut self, extension: &dyn Extension) -> Result<(), AppError> {
        let name = extension.name();
        if self.is_bound(name) {
            return Err(AppError::ExtensionAlreadyBound(name));
        }
        extension.init_app(self)?;
        self.bound.push(name);
        debug!(target = "truss::app", extension = name, "extension bound");
        Ok(())
    }

    pub fn is_bound(&self, name: &str) -> bool {
        self.bound.contains(&name)
    }

    pub fn bound_extensions(&self) -> &[&'static str] {
        &self.bound
    }

    /// Stores per-application state produced by an extension, returning any previous value.
    pub fn insert_extension<T: Clone + Send + Sync + 'static>(&mut self, value: T) -> Option<T> {
        self.extensions.insert(value)
    }

    pub fn extension<T: Send + Sync + 'static>(&self) -> Option<&T> {
        self.extensions.get::<T>()
    }

    pub fn require_extension<T: Send + Sync + 'static>(
        &self,
        name: &'static str,
    ) -> Result<&T, AppError> {
        self.extension::<T>().ok_or(AppError::ExtensionMissing(name))
    }

    /// Mounts every route of `blueprint` under `prefix`.
    ///
    /// Nothing is mounted when the blueprint name, a path or an endpoint is already taken.
    pub fn register_blueprint(
        &mut self,
        blueprint: Blueprint,
        prefix: &str,
    ) -> Result<(), AppError> {
        let (name, routes) = blueprint.into_routes();
        if self.blueprints.contains(&name) {
            return Err(AppError::BlueprintAlreadyRegistered(name));
        }

        let mut staged = UrlMap::default();
        for route in &routes {
            let path = join_path(prefix, &route.path);
            let endpoint = format!("{name}.{}", route.endpoint);
            if let Some(existing) = self
                .url_map
                .by_path(&path)
                .or_else(|| staged.by_path(&path))
            {
                return Err(AppError::RouteConflict {
                    path,
                    endpoint: existing.endpoint.clone(),
                });
            }
            if let Some(existing) = self
                .url_map
                .by_endpoint(&endpoint)
                .or_else(|| staged.by_endpoint(&endpoint))
            {
                return Err(AppError::RouteConflict {
                    path: existing.path.clone(),
                    endpoint,
                });
            }
            staged.push(RouteEntry {
                blueprint: name.clone(),
                endpoint,
                path,
            });
        }

        let mut router = std::mem::replace(&mut self.routes, Router::new());
        for (entry, route) in staged.entries().iter().zip(routes) {
            router = router.route(&entry.path, route.handler);
            self.url_map.push(entry.clone());
        }
        self.routes = router;
        self.blueprints.push(name);
        Ok(())
    }

    pub fn blueprints(&self) -> &[String] {
        &self.blueprints
    }

    pub fn url_map(&self) -> &UrlMap {
        &self.url_map
    }

    pub fn url_for(&self, endpoint: &str) -> Option<&str> {
        self.url_map.path_for(endpoint)
    }

    /// Registers middleware around the routes; later hooks run outside earlier ones.
    pub fn add_request_hook<F>(&mut self, hook: F)
    where
        F: FnOnce(Router<AppState>, &AppState) -> Router<AppState> + Send + 'static,
    {
        self.hooks.push(Box::new(hook));
    }

    /// Wraps the finished entry point; wrappers always run outside every request hook.
    pub fn wrap_entry_point<F>(&mut self, wrapper: F)
    where
        F: FnOnce(Router) -> Router + Send + 'static,
    {
        self.wrappers.push(Box::new(wrapper));
    }

    pub fn attach_log_sink(&mut self, sink: LogSink) {
        self.log_sink = Some(sink);
    }

    pub fn log_sink(&self) -> Option<&LogSink> {
        self.log_sink.as_ref()
    }

    pub fn set_json_encoder(&mut self, json: JsonEncoder) {
        self.json = json;
    }

    pub fn json(&self) -> JsonEncoder {
        self.json
    }

    /// Finalises the application into a servable router.
    pub fn into_router(self) -> Router {
        let Self {
            settings,
            config,
            extensions,
            bound,
            routes,
            url_map,
            hooks,
            wrappers,
            json,
            log_sink,
            session_key,
            ..
        } = self;

        let state = AppState::new(
            settings, config, url_map, json, extensions, bound, session_key,
        );

        let mut router = routes.fallback(not_found);
        for hook in hooks {
            router = hook(router, &state);
        }
        if log_sink.is_some() {
            router = router.layer(middleware::from_fn(log_responses));
        }
        let mut router = router
            .layer(middleware::from_fn(set_request_context))
            .with_state(state);

        for wrapper in wrappers {
            router = wrapper(router);
        }
        router
    }
}
