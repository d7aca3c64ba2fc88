//! The `main` blueprint.

use std::sync::Arc;

use axum::{
    Form,
    extract::{Query, State},
    http::StatusCode,
    response::{Html, IntoResponse, Redirect, Response},
    routing::{get, post},
};
use axum_extra::extract::cookie::SignedCookieJar;
use secrecy::Secret;
use serde::Deserialize;
use time::{OffsetDateTime, format_description::well_known::Rfc3339};
use tracing::{info, warn};

use crate::{
    app::{AppState, Blueprint},
    application::{
        error::HttpError,
        passwords::Passwords,
        repos::{LoginRecord, UsersRepo},
        tasks::RecordLoginTask,
    },
    domain::{
        error::DomainError,
        users::{User, validate_password, validate_username},
    },
    infra::{db::PostgresRepositories, tasks::TaskQueue},
    presentation::views::{AccountTemplate, IndexTemplate, LoginTemplate, render_template},
};

use super::{
    auth::{
        CurrentUser, FreshLoginRequired, LoginRequired, is_safe_redirect, login_state, set_flash,
        take_flash,
    },
    db_health_response,
    proxy::ConnectionInfo,
};

const SOURCE: &str = "infra::http::site";
const INVALID_CREDENTIALS: &str = "Invalid username or password.";
const ACCOUNT_DISABLED: &str = "This account is disabled.";
const PASSWORD_CHANGED: &str = "Your password has been updated.";
const PASSWORD_REJECTED: &str = "Current password is incorrect.";

pub fn blueprint() -> Blueprint {
    Blueprint::new("main")
        .route("/", "index", get(index))
        .route("/login", "login", get(login_form).post(login_submit))
        .route("/logout", "logout", get(logout).post(logout))
        .route("/me", "me", get(me))
        .route("/account", "account", get(account))
        .route("/account/password", "change_password", post(change_password))
        .route("/_health/db", "health", get(health))
}

fn path_for(state: &AppState, endpoint: &str) -> String {
    state.url_for(endpoint).unwrap_or("/").to_string()
}

fn users_repo(state: &AppState) -> Result<&Arc<dyn UsersRepo>, HttpError> {
    state
        .require_extension::<Arc<dyn UsersRepo>>("database")
        .map_err(|err| {
            HttpError::from_error(
                SOURCE,
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal server error",
                &err,
            )
        })
}

fn passwords(state: &AppState) -> Result<&Arc<Passwords>, HttpError> {
    state
        .require_extension::<Arc<Passwords>>("password_hasher")
        .map_err(|err| {
            HttpError::from_error(
                SOURCE,
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal server error",
                &err,
            )
        })
}

fn format_timestamp(at: OffsetDateTime) -> String {
    at.format(&Rfc3339).unwrap_or_else(|_| at.to_string())
}

async fn index(
    State(state): State<AppState>,
    current: CurrentUser,
    connection: ConnectionInfo,
) -> Result<Html<String>, HttpError> {
    render_template(IndexTemplate {
        display_name: current.principal.display_name().to_string(),
        authenticated: current.principal.is_authenticated(),
        login_path: connection.external_path(&path_for(&state, "main.login")),
        logout_path: connection.external_path(&path_for(&state, "main.logout")),
        account_path: connection.external_path(&path_for(&state, "main.account")),
    })
}

#[derive(Debug, Default, Deserialize)]
struct NextQuery {
    next: Option<String>,
}

async fn login_form(
    State(state): State<AppState>,
    connection: ConnectionInfo,
    jar: SignedCookieJar,
    Query(query): Query<NextQuery>,
) -> Result<(SignedCookieJar, Html<String>), HttpError> {
    let (jar, flash) = take_flash(jar);
    let html = render_template(LoginTemplate {
        action: connection.external_path(&path_for(&state, "main.login")),
        next: query.next.unwrap_or_default(),
        flash,
    })?;
    Ok((jar, html))
}

#[derive(Deserialize)]
struct LoginForm {
    username: String,
    password: String,
    #[serde(default)]
    next: Option<String>,
}

async fn login_submit(
    State(state): State<AppState>,
    connection: ConnectionInfo,
    jar: SignedCookieJar,
    Form(form): Form<LoginForm>,
) -> Result<Response, HttpError> {
    let login = login_state(&state)?;
    let users = users_repo(&state)?;
    let passwords = passwords(&state)?;

    let retry = |jar: SignedCookieJar, message: &str, next: Option<&str>| {
        let mut location = connection.external_path(&path_for(&state, "main.login"));
        if let Some(next) = next.filter(|next| is_safe_redirect(next)) {
            let encoded: String = url::form_urlencoded::byte_serialize(next.as_bytes()).collect();
            location.push_str("?next=");
            location.push_str(&encoded);
        }
        (set_flash(jar, message), Redirect::to(&location)).into_response()
    };

    let user = match validate_username(&form.username) {
        Ok(username) => users.find_user_by_username(&username).await?,
        Err(_) => None,
    };
    let password = Secret::new(form.password);
    let Some(user) = user else {
        passwords.verify_dummy_blocking(password).await?;
        metrics::counter!("truss_login_total", "outcome" => "unknown_user").increment(1);
        return Ok(retry(jar, INVALID_CREDENTIALS, form.next.as_deref()));
    };

    let verified = passwords
        .verify_blocking(password, user.password_hash.clone())
        .await?;
    if !verified {
        metrics::counter!("truss_login_total", "outcome" => "bad_password").increment(1);
        return Ok(retry(jar, INVALID_CREDENTIALS, form.next.as_deref()));
    }
    if !user.active {
        let refusal = DomainError::inactive(&user.username);
        warn!(
            target = "truss::http::site::login",
            user_id = user.id,
            error = %refusal,
            "login refused"
        );
        metrics::counter!("truss_login_total", "outcome" => "inactive").increment(1);
        return Ok(retry(jar, ACCOUNT_DISABLED, form.next.as_deref()));
    }

    let remote_addr = connection.remote_addr.map(|addr| addr.ip().to_string());
    record_login(&state, users.as_ref(), &user, remote_addr).await?;
    metrics::counter!("truss_login_total", "outcome" => "success").increment(1);
    info!(
        target = "truss::http::site::login",
        user_id = user.id,
        "user logged in"
    );

    let jar = login.login(jar, &user);
    let target = form
        .next
        .filter(|next| is_safe_redirect(next))
        .unwrap_or_else(|| connection.external_path(&path_for(&state, "main.index")));
    Ok((jar, Redirect::to(&target)).into_response())
}

/// Hands the login audit to the task queue when one is attached, otherwise writes it inline.
async fn record_login(
    state: &AppState,
    users: &dyn UsersRepo,
    user: &User,
    remote_addr: Option<String>,
) -> Result<(), HttpError> {
    let task = RecordLoginTask {
        user_id: user.id,
        at: OffsetDateTime::now_utc(),
        remote_addr,
    };

    if let Some(queue) = state.extension::<Arc<TaskQueue>>() {
        match queue.enqueue(&task).await {
            Ok(_) => return Ok(()),
            Err(err) => warn!(
                target = "truss::http::site::login",
                error = %err,
                "task queue unavailable; recording login inline"
            ),
        }
    }

    users.record_login(LoginRecord::from(task)).await?;
    Ok(())
}

async fn logout(
    State(state): State<AppState>,
    connection: ConnectionInfo,
    jar: SignedCookieJar,
) -> Result<(SignedCookieJar, Redirect), HttpError> {
    let login = login_state(&state)?;
    let jar = login.logout(jar);
    let target = connection.external_path(&path_for(&state, "main.index"));
    Ok((jar, Redirect::to(&target)))
}

async fn me(
    State(state): State<AppState>,
    LoginRequired(user): LoginRequired,
) -> Result<Response, HttpError> {
    state.json.response(StatusCode::OK, &user.view())
}

async fn account(
    State(state): State<AppState>,
    connection: ConnectionInfo,
    FreshLoginRequired(user): FreshLoginRequired,
    jar: SignedCookieJar,
) -> Result<(SignedCookieJar, Html<String>), HttpError> {
    let (jar, flash) = take_flash(jar);
    let html = render_template(AccountTemplate {
        username: user.username.clone(),
        created_at: format_timestamp(user.created_at),
        last_login_at: user.last_login_at.map(format_timestamp),
        last_login_ip: user.last_login_ip.clone(),
        change_password_path: connection
            .external_path(&path_for(&state, "main.change_password")),
        flash,
    })?;
    Ok((jar, html))
}

#[derive(Deserialize)]
struct ChangePasswordForm {
    current_password: String,
    new_password: String,
}

async fn change_password(
    State(state): State<AppState>,
    connection: ConnectionInfo,
    FreshLoginRequired(user): FreshLoginRequired,
    jar: SignedCookieJar,
    Form(form): Form<ChangePasswordForm>,
) -> Result<Response, HttpError> {
    let users = users_repo(&state)?;
    let passwords = passwords(&state)?;
    let account_path = connection.external_path(&path_for(&state, "main.account"));

    let verified = passwords
        .verify_blocking(
            Secret::new(form.current_password),
            user.password_hash.clone(),
        )
        .await?;
    if !verified {
        let jar = set_flash(jar, PASSWORD_REJECTED);
        return Ok((jar, Redirect::to(&account_path)).into_response());
    }

    validate_password(&form.new_password)?;
    let hash = passwords
        .hash_blocking(Secret::new(form.new_password))
        .await?;
    users.update_password_hash(user.id, &hash).await?;
    info!(
        target = "truss::http::site::change_password",
        user_id = user.id,
        "password changed"
    );

    let jar = set_flash(jar, PASSWORD_CHANGED);
    Ok((jar, Redirect::to(&account_path)).into_response())
}

async fn health(State(state): State<AppState>) -> Response {
    match state.extension::<Arc<PostgresRepositories>>() {
        Some(repositories) => db_health_response(repositories.health_check().await),
        None => HttpError::new(
            "infra::http::db_health",
            StatusCode::SERVICE_UNAVAILABLE,
            "Service temporarily unavailable",
            "no database pool is bound to this application",
        )
        .into_response(),
    }
}
