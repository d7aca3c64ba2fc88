//! Debug toolbar: per-application request history and a configuration panel.

use std::{collections::VecDeque, sync::Arc, time::Instant};

use axum::{
    body::Body,
    extract::State,
    http::{HeaderValue, Request, StatusCode},
    middleware::{self, Next},
    response::{Html, Response},
    routing::get,
};
use serde::Serialize;
use time::OffsetDateTime;
use tokio::sync::Mutex;

use crate::{
    app::{AppState, Application, Blueprint, Extension},
    application::error::{AppError, HttpError},
    presentation::views::{ToolbarRow, ToolbarTemplate, render_template},
};

const DEFAULT_MOUNT: &str = "/_debug";
const DEFAULT_CAPACITY: usize = 50;
pub const ELAPSED_HEADER: &str = "x-debug-elapsed-ms";

#[derive(Debug, Clone, Serialize)]
pub struct RequestRecord {
    pub method: String,
    pub path: String,
    pub status: u16,
    pub elapsed_ms: u128,
    #[serde(with = "time::serde::rfc3339")]
    pub at: OffsetDateTime,
}

/// Bounded history of recent requests, newest last.
#[derive(Clone)]
pub struct ToolbarHistory {
    capacity: usize,
    mount: String,
    records: Arc<Mutex<VecDeque<RequestRecord>>>,
}

impl ToolbarHistory {
    pub fn new(capacity: usize, mount: impl Into<String>) -> Self {
        Self {
            capacity: capacity.max(1),
            mount: mount.into(),
            records: Arc::new(Mutex::new(VecDeque::new())),
        }
    }

    pub async fn push(&self, record: RequestRecord) {
        let mut records = self.records.lock().await;
        while records.len() >= self.capacity {
            records.pop_front();
        }
        records.push_back(record);
    }

    pub async fn snapshot(&self) -> Vec<RequestRecord> {
        self.records.lock().await.iter().cloned().collect()
    }

    fn is_own_path(&self, path: &str) -> bool {
        path == self.mount || path.starts_with(&format!("{}/", self.mount))
    }
}

pub struct DebugToolbar {
    mount: String,
    capacity: usize,
}

impl Default for DebugToolbar {
    fn default() -> Self {
        Self {
            mount: DEFAULT_MOUNT.to_string(),
            capacity: DEFAULT_CAPACITY,
        }
    }
}

impl DebugToolbar {
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }
}

impl Extension for DebugToolbar {
    fn name(&self) -> &'static str {
        "debug_toolbar"
    }

    fn init_app(&self, app: &mut Application) -> Result<(), AppError> {
        let history = ToolbarHistory::new(self.capacity, self.mount.clone());
        app.insert_extension(history.clone());

        let blueprint = Blueprint::new("debug_toolbar")
            .route("/", "panel", get(panel))
            .route("/requests", "requests", get(requests));
        app.register_blueprint(blueprint, &self.mount)?;

        app.add_request_hook(move |router, _state| {
            router.layer(middleware::from_fn_with_state(history, record_request))
        });
        Ok(())
    }
}

async fn record_request(
    State(history): State<ToolbarHistory>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let path = request.uri().path().to_string();
    if history.is_own_path(&path) {
        return next.run(request).await;
    }

    let method = request.method().to_string();
    let start = Instant::now();
    let mut response = next.run(request).await;
    let elapsed_ms = start.elapsed().as_millis();

    if let Ok(value) = HeaderValue::from_str(&elapsed_ms.to_string()) {
        response.headers_mut().insert(ELAPSED_HEADER, value);
    }
    history
        .push(RequestRecord {
            method,
            path,
            status: response.status().as_u16(),
            elapsed_ms,
            at: OffsetDateTime::now_utc(),
        })
        .await;
    response
}

fn history(state: &AppState) -> Result<&ToolbarHistory, HttpError> {
    state.extension::<ToolbarHistory>().ok_or_else(|| {
        HttpError::new(
            "infra::http::debug_toolbar",
            StatusCode::INTERNAL_SERVER_ERROR,
            "Internal server error",
            "debug toolbar is not bound to this application",
        )
    })
}

async fn panel(State(state): State<AppState>) -> Result<Html<String>, HttpError> {
    let records = history(&state)?.snapshot().await;
    render_template(ToolbarTemplate {
        config: state
            .config
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect(),
        requests: records
            .into_iter()
            .rev()
            .map(|record| ToolbarRow {
                method: record.method,
                path: record.path,
                status: record.status,
                elapsed_ms: record.elapsed_ms,
            })
            .collect(),
    })
}

async fn requests(State(state): State<AppState>) -> Result<Response, HttpError> {
    let records = history(&state)?.snapshot().await;
    state.json.response(StatusCode::OK, &records)
}
