use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::Value;

use crate::config::{LogFormat, Settings};

/// Flat runtime settings dictionary keyed by `UPPER_SNAKE` names.
///
/// Derived from [`Settings`]; secrets never enter the map.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct ConfigMap {
    entries: BTreeMap<String, Value>,
}

impl ConfigMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_settings(settings: &Settings) -> Self {
        let mut map = Self::new();
        map.insert("DEBUG", settings.debug);
        map.insert("BROKER_URL", settings.broker_url.as_str());
        map.insert("SERVER_ADDR", settings.server.addr.to_string());

        map.insert("LOG_LEVEL", settings.logging.level.to_string());
        map.insert(
            "LOG_JSON",
            matches!(settings.logging.format, LogFormat::Json),
        );
        map.insert(
            "WARN_LOG_DIR",
            settings
                .logging
                .warn_log_dir
                .as_ref()
                .map(|dir| Value::from(dir.display().to_string()))
                .unwrap_or(Value::Null),
        );

        map.insert("DATABASE_URL", settings.database.url.as_str());
        map.insert(
            "DATABASE_MAX_CONNECTIONS",
            settings.database.max_connections.get(),
        );

        let auth = &settings.auth;
        map.insert("LOGIN_VIEW", auth.login_view.as_str());
        map.insert("REFRESH_VIEW", auth.refresh_view.as_str());
        map.insert("LOGIN_MESSAGE", auth.login_message.as_str());
        map.insert("REFRESH_MESSAGE", auth.refresh_message.as_str());
        map.insert("SESSION_COOKIE_NAME", auth.session_cookie.as_str());
        map.insert("FRESH_SECONDS", auth.fresh_for.as_secs());

        map.insert("PASSWORD_MEMORY_KIB", settings.passwords.memory_kib.get());
        map.insert("PASSWORD_ITERATIONS", settings.passwords.iterations.get());
        map.insert("PASSWORD_PARALLELISM", settings.passwords.parallelism.get());

        let proxy = settings.proxy;
        map.insert("PROXY_X_FOR", proxy.x_for);
        map.insert("PROXY_X_PROTO", proxy.x_proto);
        map.insert("PROXY_X_HOST", proxy.x_host);
        map.insert("PROXY_X_PORT", proxy.x_port);
        map.insert("PROXY_X_PREFIX", proxy.x_prefix);

        map.insert("TASK_CONCURRENCY", settings.tasks.concurrency.get());
        map.insert("TASK_MAX_ATTEMPTS", settings.tasks.max_attempts.get());
        map
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.entries.insert(key.into(), value.into())
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries.get(key)
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.get(key).and_then(Value::as_bool)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(Value::as_str)
    }

    /// Bulk update: every entry of `other` overwrites or extends this map.
    pub fn update(&mut self, other: &ConfigMap) {
        for (key, value) in &other.entries {
            self.entries.insert(key.clone(), value.clone());
        }
    }

    /// True when every key of `other` is present here with an equal value.
    pub fn contains_all(&self, other: &ConfigMap) -> bool {
        other
            .entries
            .iter()
            .all(|(key, value)| self.entries.get(key) == Some(value))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.entries.iter().map(|(key, value)| (key.as_str(), value))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
