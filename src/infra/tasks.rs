//! Task-queue client backed by the apalis Postgres broker.

use apalis_sql::{Config as ApalisSqlConfig, postgres::PostgresStorage};
use sqlx::postgres::{PgPool, PgPoolOptions};
use time::OffsetDateTime;
use tracing::{debug, info};

use crate::{
    app::ConfigMap,
    application::{error::AppError, tasks::Task},
    config::{self, Settings},
    infra::error::InfraError,
};

const TASK_QUEUE_NAME: &str = "truss";
const DEFAULT_MAX_ATTEMPTS: i32 = 5;
const DEFAULT_PRIORITY: i32 = 0;

/// Client submitting tasks to the broker at `broker_url`.
///
/// Its configuration starts empty and is filled through [`TaskQueue::update_conf`].
#[derive(Clone)]
pub struct TaskQueue {
    name: String,
    broker_url: String,
    conf: ConfigMap,
    pool: PgPool,
}

impl TaskQueue {
    pub fn new(name: impl Into<String>, broker_url: &str) -> Result<Self, InfraError> {
        let pool = PgPoolOptions::new()
            .max_connections(2)
            .connect_lazy(broker_url)?;
        Ok(Self {
            name: name.into(),
            broker_url: broker_url.to_string(),
            conf: ConfigMap::new(),
            pool,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn broker_url(&self) -> &str {
        &self.broker_url
    }

    pub fn conf(&self) -> &ConfigMap {
        &self.conf
    }

    pub fn update_conf(&mut self, conf: &ConfigMap) {
        self.conf.update(conf);
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn max_attempts(&self) -> i32 {
        self.conf
            .get("TASK_MAX_ATTEMPTS")
            .and_then(|value| value.as_i64())
            .and_then(|value| i32::try_from(value).ok())
            .unwrap_or(DEFAULT_MAX_ATTEMPTS)
    }

    /// Submits `task` for immediate execution, returning the broker-assigned id.
    pub async fn enqueue<T: Task>(&self, task: &T) -> Result<String, InfraError> {
        let payload = serde_json::to_value(task)
            .map_err(|err| InfraError::task_queue(format!("failed to encode task: {err}")))?;
        let kind = T::KIND.as_str();

        let id: String = sqlx::query_scalar(
            "SELECT (apalis.push_job($1, $2::json, $3, $4, $5, $6)).id",
        )
        .bind(kind)
        .bind(payload)
        .bind("Pending")
        .bind(OffsetDateTime::now_utc())
        .bind(self.max_attempts())
        .bind(DEFAULT_PRIORITY)
        .fetch_one(&self.pool)
        .await
        .map_err(|err| InfraError::task_queue(err.to_string()))?;

        metrics::counter!("truss_tasks_enqueued_total", "kind" => kind).increment(1);
        debug!(target = "truss::infra::tasks", kind, id = %id, "task enqueued");
        Ok(id)
    }

    /// Worker-side storage for tasks of type `T`.
    pub fn storage<T: Task>(&self) -> PostgresStorage<T> {
        PostgresStorage::new_with_config(self.pool.clone(), ApalisSqlConfig::new(T::KIND.as_str()))
    }

    /// Installs the broker schema.
    pub async fn setup(&self) -> Result<(), InfraError> {
        PostgresStorage::<()>::setup(&self.pool)
            .await
            .map_err(|err| InfraError::task_queue(err.to_string()))
    }
}

/// Builds a task-queue client whose configuration holds every application setting.
///
/// The configuration is derived from `settings` alone; no application is assembled.
pub fn create_task_queue(settings: &Settings) -> Result<TaskQueue, AppError> {
    let mut queue = TaskQueue::new(TASK_QUEUE_NAME, &settings.broker_url)?;
    queue.update_conf(&ConfigMap::from_settings(settings));
    info!(
        target = "truss::infra::tasks",
        name = queue.name(),
        "task queue client configured"
    );
    Ok(queue)
}

/// [`create_task_queue`] over the default configuration files and environment.
pub fn create_default_task_queue() -> Result<TaskQueue, AppError> {
    let settings = config::load_default()?;
    create_task_queue(&settings)
}
