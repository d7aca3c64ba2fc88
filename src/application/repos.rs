//! Repository traits describing persistence adapters.

use async_trait::async_trait;
use thiserror::Error;
use time::OffsetDateTime;

use crate::domain::users::User;

#[derive(Debug, Error)]
pub enum RepoError {
    #[error("persistence error: {0}")]
    Persistence(String),
    #[error("duplicate record violates unique constraint `{constraint}`")]
    Duplicate { constraint: String },
    #[error("resource not found")]
    NotFound,
    #[error("invalid input: {message}")]
    InvalidInput { message: String },
    #[error("integrity error: {message}")]
    Integrity { message: String },
    #[error("database timeout")]
    Timeout,
}

impl RepoError {
    pub fn from_persistence(err: impl std::fmt::Display) -> Self {
        Self::Persistence(err.to_string())
    }
}

#[derive(Debug, Clone)]
pub struct NewUser {
    pub username: String,
    pub password_hash: String,
}

/// Login audit written after a successful password login.
#[derive(Debug, Clone)]
pub struct LoginRecord {
    pub user_id: i64,
    pub at: OffsetDateTime,
    pub remote_addr: Option<String>,
}

#[async_trait]
pub trait UsersRepo: Send + Sync {
    async fn find_user(&self, id: i64) -> Result<Option<User>, RepoError>;

    async fn find_user_by_username(&self, username: &str) -> Result<Option<User>, RepoError>;

    async fn list_users(&self) -> Result<Vec<User>, RepoError>;

    async fn create_user(&self, params: NewUser) -> Result<User, RepoError>;

    async fn update_password_hash(&self, id: i64, password_hash: &str) -> Result<(), RepoError>;

    async fn record_login(&self, record: LoginRecord) -> Result<(), RepoError>;
}

/// User-lookup callback used by the login manager: resolves a session identifier to an account.
///
/// Identifiers that are not integers resolve to `None` rather than an error.
pub async fn load_user(users: &dyn UsersRepo, id: &str) -> Result<Option<User>, RepoError> {
    let Ok(id) = id.trim().parse::<i64>() else {
        return Ok(None);
    };
    users.find_user(id).await
}
