use askama::{Error as AskamaError, Template};
use axum::{
    http::StatusCode,
    response::{Html, IntoResponse, Response},
};
use thiserror::Error;

use crate::application::error::{ErrorReport, HttpError};

#[derive(Debug, Error)]
#[error("{public_message}")]
pub struct TemplateRenderError {
    pub(crate) source: &'static str,
    pub(crate) public_message: &'static str,
    #[source]
    pub(crate) error: AskamaError,
}

impl TemplateRenderError {
    pub fn new(source: &'static str, public_message: &'static str, error: AskamaError) -> Self {
        Self {
            source,
            public_message,
            error,
        }
    }
}

impl From<TemplateRenderError> for HttpError {
    fn from(err: TemplateRenderError) -> Self {
        let TemplateRenderError {
            source,
            public_message,
            error,
        } = err;

        HttpError::from_error(
            source,
            StatusCode::INTERNAL_SERVER_ERROR,
            public_message,
            &error,
        )
    }
}

pub fn render_template<T: Template>(template: T) -> Result<Html<String>, HttpError> {
    template.render().map(Html).map_err(|err| {
        TemplateRenderError::new(
            "presentation::views::render_template",
            "Template rendering failed",
            err,
        )
        .into()
    })
}

pub fn render_template_response<T: Template>(template: T, status: StatusCode) -> Response {
    match render_template(template) {
        Ok(html) => (status, html).into_response(),
        Err(err) => err.into_response(),
    }
}

pub fn render_not_found_response(path: &str) -> Response {
    let mut response = render_template_response(
        NotFoundTemplate {
            path: path.to_string(),
        },
        StatusCode::NOT_FOUND,
    );
    ErrorReport::from_message(
        "presentation::views::render_not_found_response",
        StatusCode::NOT_FOUND,
        format!("no route matches `{path}`"),
    )
    .attach(&mut response);
    response
}

#[derive(Template)]
#[template(path = "not_found.html")]
pub struct NotFoundTemplate {
    pub path: String,
}

#[derive(Template)]
#[template(path = "index.html")]
pub struct IndexTemplate {
    pub display_name: String,
    pub authenticated: bool,
    pub login_path: String,
    pub logout_path: String,
    pub account_path: String,
}

#[derive(Template)]
#[template(path = "login.html")]
pub struct LoginTemplate {
    pub action: String,
    pub next: String,
    pub flash: Option<String>,
}

#[derive(Template)]
#[template(path = "account.html")]
pub struct AccountTemplate {
    pub username: String,
    pub created_at: String,
    pub last_login_at: Option<String>,
    pub last_login_ip: Option<String>,
    pub change_password_path: String,
    pub flash: Option<String>,
}

pub struct AdminUserRow {
    pub id: i64,
    pub username: String,
    pub active: bool,
    pub last_login_at: Option<String>,
}

#[derive(Template)]
#[template(path = "admin/index.html")]
pub struct AdminIndexTemplate {
    pub extensions: Vec<String>,
    pub routes: Vec<(String, String)>,
    pub users_path: String,
}

#[derive(Template)]
#[template(path = "admin/users.html")]
pub struct AdminUsersTemplate {
    pub users: Vec<AdminUserRow>,
}

pub struct ToolbarRow {
    pub method: String,
    pub path: String,
    pub status: u16,
    pub elapsed_ms: u128,
}

#[derive(Template)]
#[template(path = "debug/toolbar.html")]
pub struct ToolbarTemplate {
    pub config: Vec<(String, String)>,
    pub requests: Vec<ToolbarRow>,
}
