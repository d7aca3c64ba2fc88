//! Background tasks submitted through the task queue and processed by `truss worker`.

use std::{fmt, sync::Arc};

use apalis::prelude::{Data, Error as ApalisError};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use time::OffsetDateTime;
use tracing::info;

use crate::application::repos::{LoginRecord, UsersRepo};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskKind {
    RecordLogin,
}

impl TaskKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RecordLogin => "record_login",
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A payload with a fixed queue namespace.
pub trait Task: Serialize + DeserializeOwned + Send + Sync + Unpin + 'static {
    const KIND: TaskKind;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordLoginTask {
    pub user_id: i64,
    #[serde(with = "time::serde::rfc3339")]
    pub at: OffsetDateTime,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_addr: Option<String>,
}

impl Task for RecordLoginTask {
    const KIND: TaskKind = TaskKind::RecordLogin;
}

impl From<RecordLoginTask> for LoginRecord {
    fn from(task: RecordLoginTask) -> Self {
        LoginRecord {
            user_id: task.user_id,
            at: task.at,
            remote_addr: task.remote_addr,
        }
    }
}

/// Shared context handed to task workers.
#[derive(Clone)]
pub struct TaskContext {
    pub users: Arc<dyn UsersRepo>,
}

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Convert any error into an [`ApalisError::Failed`].
pub fn job_failed<E>(err: E) -> ApalisError
where
    E: std::error::Error + Send + Sync + 'static,
{
    let boxed: BoxError = Box::new(err);
    ApalisError::Failed(Arc::new(boxed))
}

pub async fn process_record_login_task(
    task: RecordLoginTask,
    context: Data<TaskContext>,
) -> Result<(), ApalisError> {
    let user_id = task.user_id;
    context
        .users
        .record_login(task.into())
        .await
        .map_err(job_failed)?;

    metrics::counter!("truss_tasks_processed_total", "kind" => TaskKind::RecordLogin.as_str())
        .increment(1);
    info!(
        target = "truss::tasks::record_login",
        user_id,
        "login recorded"
    );
    Ok(())
}
