use thiserror::Error;

#[derive(Debug, Error)]
pub enum DomainError {
    #[error("invalid `{field}`: {message}")]
    InvalidField {
        field: &'static str,
        message: String,
    },
    #[error("user account `{username}` is disabled")]
    InactiveAccount { username: String },
}

impl DomainError {
    pub fn invalid(field: &'static str, message: impl Into<String>) -> Self {
        Self::InvalidField {
            field,
            message: message.into(),
        }
    }

    pub fn inactive(username: impl Into<String>) -> Self {
        Self::InactiveAccount {
            username: username.into(),
        }
    }
}
