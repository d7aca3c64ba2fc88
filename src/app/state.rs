use std::sync::Arc;

use axum::{extract::FromRef, http::Extensions};
use axum_extra::extract::cookie::Key;

use crate::{
    application::{error::AppError, json::JsonEncoder},
    config::Settings,
};

use super::{blueprint::UrlMap, config_map::ConfigMap};

/// Shared router state produced when an [`Application`](super::Application) is finalised.
#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub config: Arc<ConfigMap>,
    pub url_map: Arc<UrlMap>,
    pub json: JsonEncoder,
    extensions: Arc<Extensions>,
    bound: Arc<[&'static str]>,
    session_key: Key,
}

impl AppState {
    pub(crate) fn new(
        settings: Arc<Settings>,
        config: ConfigMap,
        url_map: UrlMap,
        json: JsonEncoder,
        extensions: Extensions,
        bound: Vec<&'static str>,
        session_key: Key,
    ) -> Self {
        Self {
            settings,
            config: Arc::new(config),
            url_map: Arc::new(url_map),
            json,
            extensions: Arc::new(extensions),
            bound: bound.into(),
            session_key,
        }
    }

    pub fn extension<T: Send + Sync + 'static>(&self) -> Option<&T> {
        self.extensions.get::<T>()
    }

    pub fn require_extension<T: Send + Sync + 'static>(
        &self,
        name: &'static str,
    ) -> Result<&T, AppError> {
        self.extension::<T>()
            .ok_or(AppError::ExtensionMissing(name))
    }

    pub fn is_bound(&self, name: &str) -> bool {
        self.bound.contains(&name)
    }

    pub fn bound_extensions(&self) -> &[&'static str] {
        &self.bound
    }

    pub fn url_for(&self, endpoint: &str) -> Option<&str> {
        self.url_map.path_for(endpoint)
    }
}

impl FromRef<AppState> for Key {
    fn from_ref(state: &AppState) -> Self {
        state.session_key.clone()
    }
}
