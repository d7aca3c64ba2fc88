//! Named route groups and the application route table.

use axum::routing::MethodRouter;
use serde::Serialize;

use super::state::AppState;

/// A named collection of path → handler mappings, mounted under a prefix.
pub struct Blueprint {
    name: String,
    routes: Vec<BlueprintRoute>,
}

pub(crate) struct BlueprintRoute {
    pub(crate) path: String,
    pub(crate) endpoint: String,
    pub(crate) handler: MethodRouter<AppState>,
}

impl Blueprint {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            routes: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Adds `handler` at `path`; the endpoint is addressed as `<blueprint>.<endpoint>`.
    pub fn route(
        mut self,
        path: &str,
        endpoint: &str,
        handler: MethodRouter<AppState>,
    ) -> Self {
        self.routes.push(BlueprintRoute {
            path: path.to_string(),
            endpoint: endpoint.to_string(),
            handler,
        });
        self
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    pub(crate) fn into_routes(self) -> (String, Vec<BlueprintRoute>) {
        (self.name, self.routes)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RouteEntry {
    pub blueprint: String,
    pub endpoint: String,
    pub path: String,
}

/// Route table of an application, in registration order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct UrlMap {
    entries: Vec<RouteEntry>,
}

impl UrlMap {
    pub fn entries(&self) -> &[RouteEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn path_for(&self, endpoint: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|entry| entry.endpoint == endpoint)
            .map(|entry| entry.path.as_str())
    }

    pub fn by_path(&self, path: &str) -> Option<&RouteEntry> {
        self.entries.iter().find(|entry| entry.path == path)
    }

    pub fn by_endpoint(&self, endpoint: &str) -> Option<&RouteEntry> {
        self.entries.iter().find(|entry| entry.endpoint == endpoint)
    }

    pub(crate) fn push(&mut self, entry: RouteEntry) {
        self.entries.push(entry);
    }
}

/// Joins a mount prefix and a blueprint-relative path into an absolute route path.
pub fn join_path(prefix: &str, path: &str) -> String {
    let prefix = prefix.trim_matches('/');
    let path = path.trim_matches('/');
    match (prefix.is_empty(), path.is_empty()) {
        (true, true) => "/".to_string(),
        (true, false) => format!("/{path}"),
        (false, true) => format!("/{prefix}"),
        (false, false) => format!("/{prefix}/{path}"),
    }
}
