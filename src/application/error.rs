use std::error::Error as StdError;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error;

use crate::{
    application::{passwords::PasswordError, repos::RepoError},
    config::LoadError,
    domain::error::DomainError,
    infra::error::InfraError,
};

#[derive(Debug, Clone)]
pub struct ErrorReport {
    pub source: &'static str,
    pub status: StatusCode,
    pub messages: Vec<String>,
}

impl ErrorReport {
    pub fn from_error(source: &'static str, status: StatusCode, error: &dyn StdError) -> Self {
        let mut messages = vec![error.to_string()];
        let mut current = error.source();
        while let Some(inner) = current {
            messages.push(inner.to_string());
            current = inner.source();
        }
        Self {
            source,
            status,
            messages,
        }
    }

    pub fn from_message(
        source: &'static str,
        status: StatusCode,
        message: impl Into<String>,
    ) -> Self {
        Self {
            source,
            status,
            messages: vec![message.into()],
        }
    }

    pub fn attach(self, response: &mut Response) {
        response.extensions_mut().insert(self);
    }
}

/// Handler error carrying a public message and an internal report for the response logger.
#[derive(Debug)]
pub struct HttpError {
    status: StatusCode,
    public_message: &'static str,
    report: ErrorReport,
}

impl HttpError {
    pub fn new(
        source: &'static str,
        status: StatusCode,
        public_message: &'static str,
        detail: impl Into<String>,
    ) -> Self {
        let report = ErrorReport::from_message(source, status, detail);
        Self {
            status,
            public_message,
            report,
        }
    }

    pub fn from_error(
        source: &'static str,
        status: StatusCode,
        public_message: &'static str,
        error: &dyn StdError,
    ) -> Self {
        let report = ErrorReport::from_error(source, status, error);
        Self {
            status,
            public_message,
            report,
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }
}

impl IntoResponse for HttpError {
    fn into_response(self) -> Response {
        let mut response = (self.status, self.public_message).into_response();
        self.report.attach(&mut response);
        response
    }
}

impl From<RepoError> for HttpError {
    fn from(error: RepoError) -> Self {
        let (status, public_message) = match &error {
            RepoError::NotFound => (StatusCode::NOT_FOUND, "Resource not found"),
            RepoError::Duplicate { .. } => (StatusCode::CONFLICT, "Resource already exists"),
            RepoError::InvalidInput { .. } => {
                (StatusCode::BAD_REQUEST, "Request could not be processed")
            }
            RepoError::Timeout => (
                StatusCode::SERVICE_UNAVAILABLE,
                "Service temporarily unavailable",
            ),
            RepoError::Persistence(_) | RepoError::Integrity { .. } => {
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error")
            }
        };
        HttpError::from_error(
            "application::error::repo_error_to_http_error",
            status,
            public_message,
            &error,
        )
    }
}

impl From<PasswordError> for HttpError {
    fn from(error: PasswordError) -> Self {
        HttpError::from_error(
            "application::error::password_error_to_http_error",
            StatusCode::INTERNAL_SERVER_ERROR,
            "Internal server error",
            &error,
        )
    }
}

impl From<DomainError> for HttpError {
    fn from(error: DomainError) -> Self {
        HttpError::from_error(
            "application::error::domain_error_to_http_error",
            StatusCode::BAD_REQUEST,
            "Request could not be processed",
            &error,
        )
    }
}

#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Config(#[from] LoadError),
    #[error(transparent)]
    Domain(#[from] DomainError),
    #[error(transparent)]
    Infra(#[from] InfraError),
    #[error(transparent)]
    Repo(#[from] RepoError),
    #[error(transparent)]
    Password(#[from] PasswordError),
    #[error("extension `{0}` is already bound to this application")]
    ExtensionAlreadyBound(&'static str),
    #[error("extension `{0}` is not bound to this application")]
    ExtensionMissing(&'static str),
    #[error("blueprint `{0}` is already registered")]
    BlueprintAlreadyRegistered(String),
    #[error("route `{path}` is already registered by `{endpoint}`")]
    RouteConflict { path: String, endpoint: String },
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("unexpected error: {0}")]
    Unexpected(String),
}

impl AppError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn unexpected(message: impl Into<String>) -> Self {
        Self::Unexpected(message.into())
    }

    fn status_code(&self) -> StatusCode {
        match self {
            AppError::Domain(_) | AppError::Validation(_) => StatusCode::BAD_REQUEST,
            AppError::Repo(RepoError::NotFound) => StatusCode::NOT_FOUND,
            AppError::Repo(RepoError::Duplicate { .. }) => StatusCode::CONFLICT,
            AppError::Infra(InfraError::Database { .. })
            | AppError::Infra(InfraError::TaskQueue { .. })
            | AppError::Repo(RepoError::Timeout) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn presentation_message(&self) -> &'static str {
        match self {
            AppError::Domain(_) | AppError::Validation(_) => "Request could not be processed",
            AppError::Repo(RepoError::NotFound) => "Resource not found",
            AppError::Repo(RepoError::Duplicate { .. }) => "Resource already exists",
            AppError::Infra(InfraError::Database { .. })
            | AppError::Infra(InfraError::TaskQueue { .. })
            | AppError::Repo(RepoError::Timeout) => "Service temporarily unavailable",
            AppError::Config(_)
            | AppError::Infra(InfraError::Configuration { .. })
            | AppError::ExtensionAlreadyBound(_)
            | AppError::ExtensionMissing(_)
            | AppError::BlueprintAlreadyRegistered(_)
            | AppError::RouteConflict { .. } => "Service misconfigured",
            _ => "Unexpected error occurred",
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let message = self.presentation_message();
        let report = ErrorReport::from_error("application::error::AppError", status, &self);
        let mut response = (status, message).into_response();
        report.attach(&mut response);
        response
    }
}
