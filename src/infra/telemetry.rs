use std::{path::PathBuf, sync::Once};

use metrics::{Unit, describe_counter};
use tokio::task::JoinHandle;
use tracing::level_filters::LevelFilter;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
};

use crate::config::{LogFormat, LoggingSettings};

use super::error::InfraError;

const WARN_LOG_FILE_PREFIX: &str = "truss.warn.log";

static METRIC_DESCRIPTIONS: Once = Once::new();

/// Warning-and-above sink attached to an application.
///
/// Events at `level` or more severe are written to the rolling file in `directory`
/// once [`init`] has installed the subscriber; without a directory they only reach
/// the primary formatter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogSink {
    pub level: LevelFilter,
    pub directory: Option<PathBuf>,
}

impl LogSink {
    pub fn warnings(directory: Option<PathBuf>) -> Self {
        Self {
            level: LevelFilter::WARN,
            directory,
        }
    }
}

/// Install a global tracing subscriber using the provided logging settings.
///
/// The returned guard flushes the warning log file and must be held until shutdown.
pub fn init(logging: &LoggingSettings) -> Result<Option<WorkerGuard>, InfraError> {
    describe_metrics();

    let env_filter = EnvFilter::builder()
        .with_default_directive(logging.level.into())
        .from_env_lossy();

    let fmt_layer = match logging.format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .with_target(true)
            .boxed(),
        LogFormat::Compact => fmt::layer().compact().with_target(true).boxed(),
    };

    let (warn_layer, guard) = match logging.warn_log_dir.as_ref() {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            let appender = tracing_appender::rolling::daily(dir, WARN_LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .with_ansi(false)
                .with_target(true)
                .with_writer(writer)
                .with_filter(LevelFilter::WARN);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(ErrorLayer::default())
        .with(fmt_layer)
        .with(warn_layer)
        .try_init()
        .map_err(|err| {
            InfraError::telemetry(format!("failed to install tracing subscriber: {err}"))
        })?;

    Ok(guard)
}

/// Run blocking work on the blocking pool inside the caller's span.
pub fn spawn_blocking_with_tracing<F, R>(f: F) -> JoinHandle<R>
where
    F: FnOnce() -> R + Send + 'static,
    R: Send + 'static,
{
    let current_span = tracing::Span::current();
    tokio::task::spawn_blocking(move || current_span.in_scope(f))
}

fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            "truss_login_total",
            Unit::Count,
            "Password login attempts, labelled by outcome."
        );
        describe_counter!(
            "truss_tasks_enqueued_total",
            Unit::Count,
            "Tasks submitted to the task queue, labelled by kind."
        );
        describe_counter!(
            "truss_tasks_processed_total",
            Unit::Count,
            "Tasks completed by the worker, labelled by kind."
        );
    });
}
