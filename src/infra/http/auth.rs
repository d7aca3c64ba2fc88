//! Login manager: session cookies, the current principal and access guards.

use std::{future::Future, pin::Pin, sync::Arc, time::Duration};

use axum::{
    extract::{FromRef, FromRequestParts},
    http::{StatusCode, request::Parts},
    response::{IntoResponse, Redirect, Response},
};
use axum_extra::extract::cookie::{Cookie, Key, SameSite, SignedCookieJar};
use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::debug;

use crate::{
    app::{AppState, Application, Extension},
    application::{
        error::{AppError, HttpError},
        repos::{RepoError, UsersRepo, load_user},
    },
    domain::users::{Anonymous, Principal, User},
};

use super::proxy::ConnectionInfo;

pub const FLASH_COOKIE: &str = "_flash";

type LoadUserFuture = Pin<Box<dyn Future<Output = Result<Option<User>, RepoError>> + Send>>;

/// Resolves a session identifier to a user.
pub type UserLoader = Arc<dyn Fn(String) -> LoadUserFuture + Send + Sync>;

/// Binds per-application login configuration built from the `auth` settings.
///
/// Unless a loader is supplied, users are resolved through the bound database.
#[derive(Default)]
pub struct LoginManager {
    anonymous: Anonymous,
    user_loader: Option<UserLoader>,
}

impl LoginManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_anonymous(mut self, anonymous: Anonymous) -> Self {
        self.anonymous = anonymous;
        self
    }

    pub fn with_user_loader<F, Fut>(mut self, loader: F) -> Self
    where
        F: Fn(String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Option<User>, RepoError>> + Send + 'static,
    {
        self.user_loader = Some(Arc::new(move |id| -> LoadUserFuture { Box::pin(loader(id)) }));
        self
    }
}

impl Extension for LoginManager {
    fn name(&self) -> &'static str {
        "login_manager"
    }

    fn init_app(&self, app: &mut Application) -> Result<(), AppError> {
        let user_loader = match self.user_loader.as_ref() {
            Some(loader) => loader.clone(),
            None => {
                let users = app
                    .require_extension::<Arc<dyn UsersRepo>>("database")?
                    .clone();
                let loader: UserLoader = Arc::new(move |id: String| -> LoadUserFuture {
                    let users = users.clone();
                    Box::pin(async move { load_user(users.as_ref(), &id).await })
                });
                loader
            }
        };

        let auth = &app.settings().auth;
        let state = LoginState {
            login_view: auth.login_view.clone(),
            refresh_view: auth.refresh_view.clone(),
            login_message: auth.login_message.clone(),
            refresh_message: auth.refresh_message.clone(),
            session_cookie: auth.session_cookie.clone(),
            fresh_for: auth.fresh_for,
            anonymous: self.anonymous.clone(),
            user_loader,
        };
        app.insert_extension(Arc::new(state));
        Ok(())
    }
}

/// Login configuration owned by one application.
#[derive(Clone)]
pub struct LoginState {
    pub login_view: String,
    pub refresh_view: String,
    pub login_message: String,
    pub refresh_message: String,
    pub session_cookie: String,
    pub fresh_for: Duration,
    pub anonymous: Anonymous,
    user_loader: UserLoader,
}

impl LoginState {
    pub async fn load_user(&self, id: &str) -> Result<Option<User>, RepoError> {
        (self.user_loader)(id.to_string()).await
    }

    /// Stores a fresh session for `user`.
    pub fn login(&self, jar: SignedCookieJar, user: &User) -> SignedCookieJar {
        let session = Session::fresh(user.session_id(), OffsetDateTime::now_utc());
        jar.add(
            Cookie::build((self.session_cookie.clone(), session.encode()))
                .path("/")
                .http_only(true)
                .same_site(SameSite::Lax),
        )
    }

    pub fn logout(&self, jar: SignedCookieJar) -> SignedCookieJar {
        jar.remove(Cookie::build((self.session_cookie.clone(), "")).path("/"))
    }
}

/// Session payload kept in the signed session cookie.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub user_id: String,
    pub fresh: bool,
    pub issued_at: i64,
}

impl Session {
    pub fn fresh(user_id: String, now: OffsetDateTime) -> Self {
        Self {
            user_id,
            fresh: true,
            issued_at: now.unix_timestamp(),
        }
    }

    /// Fresh sessions stay fresh for `window` after the password login.
    pub fn is_fresh(&self, now: OffsetDateTime, window: Duration) -> bool {
        let age = now.unix_timestamp() - self.issued_at;
        let window = i64::try_from(window.as_secs()).unwrap_or(i64::MAX);
        self.fresh && (0..window).contains(&age)
    }

    pub fn encode(&self) -> String {
        let json = serde_json::to_vec(self).unwrap_or_default();
        URL_SAFE_NO_PAD.encode(json)
    }

    pub fn decode(value: &str) -> Option<Self> {
        let bytes = URL_SAFE_NO_PAD.decode(value).ok()?;
        serde_json::from_slice(&bytes).ok()
    }
}

pub fn set_flash(jar: SignedCookieJar, message: &str) -> SignedCookieJar {
    jar.add(
        Cookie::build((FLASH_COOKIE, URL_SAFE_NO_PAD.encode(message)))
            .path("/")
            .http_only(true),
    )
}

/// Reads and clears the pending flash message.
pub fn take_flash(jar: SignedCookieJar) -> (SignedCookieJar, Option<String>) {
    let message = jar
        .get(FLASH_COOKIE)
        .and_then(|cookie| URL_SAFE_NO_PAD.decode(cookie.value()).ok())
        .and_then(|bytes| String::from_utf8(bytes).ok());
    match message {
        Some(message) => (
            jar.remove(Cookie::build(FLASH_COOKIE).path("/")),
            Some(message),
        ),
        None => (jar, None),
    }
}

/// Accepts only same-site absolute paths as post-login targets.
///
/// Browsers drop tabs and newlines from URLs, so `/\t/host` would resolve to
/// `//host`; any control or whitespace character rejects the target.
pub fn is_safe_redirect(target: &str) -> bool {
    target.starts_with('/')
        && !target.starts_with("//")
        && !target.contains('\\')
        && !target
            .chars()
            .any(|ch| ch.is_control() || ch.is_whitespace())
}

pub(crate) fn login_state(state: &AppState) -> Result<&Arc<LoginState>, HttpError> {
    state.extension::<Arc<LoginState>>().ok_or_else(|| {
        HttpError::new(
            "infra::http::auth::login_state",
            StatusCode::INTERNAL_SERVER_ERROR,
            "Internal server error",
            "login manager is not bound to this application",
        )
    })
}

/// The principal of the current request, resolved once per request.
#[derive(Debug, Clone)]
pub struct CurrentUser {
    pub principal: Principal,
    pub session: Option<Session>,
}

impl FromRequestParts<AppState> for CurrentUser {
    type Rejection = HttpError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        if let Some(current) = parts.extensions.get::<CurrentUser>() {
            return Ok(current.clone());
        }

        let login = login_state(state)?;
        let jar = SignedCookieJar::from_headers(&parts.headers, Key::from_ref(state));
        let session = jar
            .get(&login.session_cookie)
            .and_then(|cookie| Session::decode(cookie.value()));

        let user = match session.as_ref() {
            Some(session) => login.load_user(&session.user_id).await?,
            None => None,
        };
        let principal = match user {
            Some(user) if user.active => Principal::Authenticated(user),
            _ => Principal::Anonymous(login.anonymous.clone()),
        };

        let current = CurrentUser { principal, session };
        parts.extensions.insert(current.clone());
        Ok(current)
    }
}

/// Requires an authenticated user; anonymous requests are sent to the login view.
#[derive(Debug, Clone)]
pub struct LoginRequired(pub User);

impl FromRequestParts<AppState> for LoginRequired {
    type Rejection = Response;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let current = CurrentUser::from_request_parts(parts, state)
            .await
            .map_err(IntoResponse::into_response)?;
        match current.principal {
            Principal::Authenticated(user) => Ok(LoginRequired(user)),
            Principal::Anonymous(_) => Err(deny(parts, state, Denial::Login).await),
        }
    }
}

/// Requires a user whose password login happened within the freshness window.
#[derive(Debug, Clone)]
pub struct FreshLoginRequired(pub User);

impl FromRequestParts<AppState> for FreshLoginRequired {
    type Rejection = Response;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let LoginRequired(user) = LoginRequired::from_request_parts(parts, state).await?;
        let login = login_state(state).map_err(IntoResponse::into_response)?;
        let now = OffsetDateTime::now_utc();
        let fresh = parts
            .extensions
            .get::<CurrentUser>()
            .and_then(|current| current.session.as_ref())
            .is_some_and(|session| session.is_fresh(now, login.fresh_for));

        if fresh {
            Ok(FreshLoginRequired(user))
        } else {
            Err(deny(parts, state, Denial::Refresh).await)
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Denial {
    Login,
    Refresh,
}

async fn deny(parts: &mut Parts, state: &AppState, denial: Denial) -> Response {
    let login = match login_state(state) {
        Ok(login) => login,
        Err(err) => return err.into_response(),
    };
    let (view, message) = match denial {
        Denial::Login => (&login.login_view, &login.login_message),
        Denial::Refresh => (&login.refresh_view, &login.refresh_message),
    };

    let Some(target) = state.url_for(view) else {
        return HttpError::new(
            "infra::http::auth::deny",
            StatusCode::UNAUTHORIZED,
            "Unauthorized",
            format!("login view `{view}` is not registered"),
        )
        .into_response();
    };

    let connection = match ConnectionInfo::from_request_parts(parts, state).await {
        Ok(connection) => connection,
        Err(never) => match never {},
    };
    let requested = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let next: String =
        url::form_urlencoded::byte_serialize(connection.external_path(requested).as_bytes())
            .collect();
    let location = format!("{}?next={next}", connection.external_path(target));

    debug!(
        target = "truss::http::auth",
        ?denial,
        location = %location,
        "access denied"
    );

    let jar = SignedCookieJar::from_headers(&parts.headers, Key::from_ref(state));
    let jar = set_flash(jar, message);
    (jar, Redirect::to(&location)).into_response()
}
