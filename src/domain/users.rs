//! User accounts and the principal attached to a request.

use serde::Serialize;
use time::OffsetDateTime;

use super::error::DomainError;

pub const MIN_PASSWORD_LEN: usize = 8;
const MAX_USERNAME_LEN: usize = 64;
const DEFAULT_ANONYMOUS_NAME: &str = "Guest";

/// Persisted account row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    pub id: i64,
    pub username: String,
    pub password_hash: String,
    pub active: bool,
    pub created_at: OffsetDateTime,
    pub last_login_at: Option<OffsetDateTime>,
    pub last_login_ip: Option<String>,
}

impl User {
    /// Identifier stored in the session cookie.
    pub fn session_id(&self) -> String {
        self.id.to_string()
    }

    pub fn view(&self) -> UserView {
        UserView {
            id: self.id,
            username: self.username.clone(),
            active: self.active,
            created_at: self.created_at,
            last_login_at: self.last_login_at,
        }
    }
}

/// Identity used when no user is logged in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Anonymous {
    pub display_name: String,
}

impl Default for Anonymous {
    fn default() -> Self {
        Self {
            display_name: DEFAULT_ANONYMOUS_NAME.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Principal {
    Authenticated(User),
    Anonymous(Anonymous),
}

impl Principal {
    pub fn is_authenticated(&self) -> bool {
        matches!(self, Self::Authenticated(_))
    }

    pub fn display_name(&self) -> &str {
        match self {
            Self::Authenticated(user) => user.username.as_str(),
            Self::Anonymous(anonymous) => anonymous.display_name.as_str(),
        }
    }
}

/// Public projection of a user, without credentials.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UserView {
    pub id: i64,
    pub username: String,
    pub active: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_login_at: Option<OffsetDateTime>,
}

pub fn validate_username(username: &str) -> Result<String, DomainError> {
    let trimmed = username.trim();
    if trimmed.is_empty() {
        return Err(DomainError::invalid("username", "must not be empty"));
    }
    if trimmed.len() > MAX_USERNAME_LEN {
        return Err(DomainError::invalid(
            "username",
            format!("must be at most {MAX_USERNAME_LEN} characters"),
        ));
    }
    if !trimmed
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
    {
        return Err(DomainError::invalid(
            "username",
            "may only contain ASCII letters, digits, `_`, `-` and `.`",
        ));
    }
    Ok(trimmed.to_ascii_lowercase())
}

pub fn validate_password(password: &str) -> Result<(), DomainError> {
    if password.chars().count() < MIN_PASSWORD_LEN {
        return Err(DomainError::invalid(
            "password",
            format!("must be at least {MIN_PASSWORD_LEN} characters"),
        ));
    }
    Ok(())
}
