//! Postgres-backed repository implementations and the `database` extension.

mod users;
mod util;

pub use util::map_sqlx_error;

use std::{sync::Arc, time::Duration};

use sqlx::{
    postgres::{PgPool, PgPoolOptions},
    query,
};
use tracing::info;

use crate::app::{Application, Extension};
use crate::application::{error::AppError, repos::UsersRepo};
use crate::config::DatabaseSettings;
use crate::infra::error::InfraError;

const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone)]
pub struct PostgresRepositories {
    pool: Arc<PgPool>,
}

impl PostgresRepositories {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn connect(url: &str, max_connections: u32) -> Result<PgPool, sqlx::Error> {
        Self::pool_options(max_connections).connect(url).await
    }

    /// Builds a pool that opens connections on first use.
    pub fn connect_lazy(settings: &DatabaseSettings) -> Result<PgPool, sqlx::Error> {
        Self::pool_options(settings.max_connections.get()).connect_lazy(&settings.url)
    }

    fn pool_options(max_connections: u32) -> PgPoolOptions {
        PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(ACQUIRE_TIMEOUT)
    }

    pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::Error> {
        sqlx::migrate!("./migrations")
            .run(pool)
            .await
            .map_err(Into::into)
    }

    pub async fn health_check(&self) -> Result<(), sqlx::Error> {
        query("SELECT 1").execute(self.pool()).await.map(|_| ())
    }
}

enum DatabaseSource {
    Settings,
    Repository(Arc<dyn UsersRepo>),
}

/// Binds the application's database handle.
///
/// By default a lazy pool is built from the application's `database` settings and
/// published both as [`PostgresRepositories`] and as `Arc<dyn UsersRepo>`.
pub struct Database {
    source: DatabaseSource,
}

impl Default for Database {
    fn default() -> Self {
        Self {
            source: DatabaseSource::Settings,
        }
    }
}

impl Database {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serves users from `users` instead of opening a pool.
    pub fn from_repository(users: Arc<dyn UsersRepo>) -> Self {
        Self {
            source: DatabaseSource::Repository(users),
        }
    }
}

impl Extension for Database {
    fn name(&self) -> &'static str {
        "database"
    }

    fn init_app(&self, app: &mut Application) -> Result<(), AppError> {
        match &self.source {
            DatabaseSource::Settings => {
                let settings = &app.settings().database;
                let pool =
                    PostgresRepositories::connect_lazy(settings).map_err(InfraError::from)?;
                let repositories = Arc::new(PostgresRepositories::new(pool));
                let users: Arc<dyn UsersRepo> = repositories.clone();
                info!(
                    target = "truss::infra::db",
                    max_connections = settings.max_connections.get(),
                    "database pool configured"
                );
                app.insert_extension(repositories);
                app.insert_extension(users);
            }
            DatabaseSource::Repository(users) => {
                app.insert_extension(users.clone());
            }
        }
        Ok(())
    }
}
