use async_trait::async_trait;
use time::OffsetDateTime;

use crate::application::repos::{LoginRecord, NewUser, RepoError, UsersRepo};
use crate::domain::users::User;

use super::{PostgresRepositories, map_sqlx_error};

const USER_COLUMNS: &str =
    "id, username, password_hash, active, created_at, last_login_at, last_login_ip";

#[derive(Debug, sqlx::FromRow)]
struct UserRow {
    id: i64,
    username: String,
    password_hash: String,
    active: bool,
    created_at: OffsetDateTime,
    last_login_at: Option<OffsetDateTime>,
    last_login_ip: Option<String>,
}

impl From<UserRow> for User {
    fn from(row: UserRow) -> Self {
        User {
            id: row.id,
            username: row.username,
            password_hash: row.password_hash,
            active: row.active,
            created_at: row.created_at,
            last_login_at: row.last_login_at,
            last_login_ip: row.last_login_ip,
        }
    }
}

#[async_trait]
impl UsersRepo for PostgresRepositories {
    async fn find_user(&self, id: i64) -> Result<Option<User>, RepoError> {
        let row = sqlx::query_as::<_, UserRow>(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(self.pool())
        .await
        .map_err(map_sqlx_error)?;

        Ok(row.map(User::from))
    }

    async fn find_user_by_username(&self, username: &str) -> Result<Option<User>, RepoError> {
        let row = sqlx::query_as::<_, UserRow>(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE username = $1"
        ))
        .bind(username)
        .fetch_optional(self.pool())
        .await
        .map_err(map_sqlx_error)?;

        Ok(row.map(User::from))
    }

    async fn list_users(&self) -> Result<Vec<User>, RepoError> {
        let rows = sqlx::query_as::<_, UserRow>(&format!(
            "SELECT {USER_COLUMNS} FROM users ORDER BY id"
        ))
        .fetch_all(self.pool())
        .await
        .map_err(map_sqlx_error)?;

        Ok(rows.into_iter().map(User::from).collect())
    }

    async fn create_user(&self, params: NewUser) -> Result<User, RepoError> {
        let row = sqlx::query_as::<_, UserRow>(&format!(
            "INSERT INTO users (username, password_hash) VALUES ($1, $2) RETURNING {USER_COLUMNS}"
        ))
        .bind(&params.username)
        .bind(&params.password_hash)
        .fetch_one(self.pool())
        .await
        .map_err(map_sqlx_error)?;

        Ok(row.into())
    }

    async fn update_password_hash(&self, id: i64, password_hash: &str) -> Result<(), RepoError> {
        let result = sqlx::query("UPDATE users SET password_hash = $2 WHERE id = $1")
            .bind(id)
            .bind(password_hash)
            .execute(self.pool())
            .await
            .map_err(map_sqlx_error)?;

        if result.rows_affected() == 0 {
            return Err(RepoError::NotFound);
        }
        Ok(())
    }

    async fn record_login(&self, record: LoginRecord) -> Result<(), RepoError> {
        let result = sqlx::query(
            "UPDATE users SET last_login_at = $2, last_login_ip = $3 WHERE id = $1",
        )
        .bind(record.user_id)
        .bind(record.at)
        .bind(record.remote_addr)
        .execute(self.pool())
        .await
        .map_err(map_sqlx_error)?;

        if result.rows_affected() == 0 {
            return Err(RepoError::NotFound);
        }
        Ok(())
    }
}
