//! Admin UI bound in debug mode.

use std::sync::Arc;

use axum::{extract::State, http::StatusCode, response::Html, routing::get};
use time::format_description::well_known::Rfc3339;

use crate::{
    app::{AppState, Application, Blueprint, Extension},
    application::{
        error::{AppError, HttpError},
        repos::UsersRepo,
    },
    presentation::views::{AdminIndexTemplate, AdminUserRow, AdminUsersTemplate, render_template},
};

use super::auth::LoginRequired;

const DEFAULT_MOUNT: &str = "/admin";

/// Mounts the `admin` blueprint; pages require a logged-in user.
pub struct AdminExtension {
    mount: String,
}

impl Default for AdminExtension {
    fn default() -> Self {
        Self {
            mount: DEFAULT_MOUNT.to_string(),
        }
    }
}

impl AdminExtension {
    pub fn mounted_at(mount: impl Into<String>) -> Self {
        Self {
            mount: mount.into(),
        }
    }
}

impl Extension for AdminExtension {
    fn name(&self) -> &'static str {
        "admin"
    }

    fn init_app(&self, app: &mut Application) -> Result<(), AppError> {
        let blueprint = Blueprint::new("admin")
            .route("/", "index", get(admin_index))
            .route("/users", "users", get(admin_users));
        app.register_blueprint(blueprint, &self.mount)
    }
}

async fn admin_index(
    State(state): State<AppState>,
    LoginRequired(_user): LoginRequired,
) -> Result<Html<String>, HttpError> {
    render_template(AdminIndexTemplate {
        extensions: state
            .bound_extensions()
            .iter()
            .map(|name| name.to_string())
            .collect(),
        routes: state
            .url_map
            .entries()
            .iter()
            .map(|entry| (entry.endpoint.clone(), entry.path.clone()))
            .collect(),
        users_path: state.url_for("admin.users").unwrap_or("/").to_string(),
    })
}

async fn admin_users(
    State(state): State<AppState>,
    LoginRequired(_user): LoginRequired,
) -> Result<Html<String>, HttpError> {
    let users = state
        .extension::<Arc<dyn UsersRepo>>()
        .ok_or_else(|| {
            HttpError::new(
                "infra::http::admin::admin_users",
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal server error",
                "database extension is not bound",
            )
        })?
        .list_users()
        .await?;

    let rows = users
        .into_iter()
        .map(|user| AdminUserRow {
            id: user.id,
            username: user.username,
            active: user.active,
            last_login_at: user
                .last_login_at
                .and_then(|at| at.format(&Rfc3339).ok()),
        })
        .collect();

    render_template(AdminUsersTemplate { users: rows })
}
