pub mod admin;
pub mod auth;
pub mod debug_toolbar;
pub mod middleware;
pub mod proxy;
pub mod site;

use axum::http::{StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use sqlx::Error as SqlxError;
use tokio::signal;
use tracing::{info, warn};

use crate::application::error::ErrorReport;
use crate::presentation::views::render_not_found_response;

fn db_health_response(result: Result<(), SqlxError>) -> Response {
    match result {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(err) => {
            let mut response = StatusCode::SERVICE_UNAVAILABLE.into_response();
            ErrorReport::from_error(
                "infra::http::db_health",
                StatusCode::SERVICE_UNAVAILABLE,
                &err,
            )
            .attach(&mut response);
            response
        }
    }
}

/// Fallback for paths no blueprint claims.
pub async fn not_found(uri: Uri) -> Response {
    render_not_found_response(uri.path())
}

/// Resolves on Ctrl+C or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            warn!(error = %err, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                warn!(error = %err, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!(target = "truss::http", "signal received, starting graceful shutdown");
}
