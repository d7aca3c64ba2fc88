#![allow(dead_code)]

use std::{num::NonZeroU32, sync::Arc};

use async_trait::async_trait;
use axum::{
    body::{Body, to_bytes},
    http::{Request, Response, header},
};
use secrecy::Secret;
use time::OffsetDateTime;
use tokio::sync::Mutex;

use truss::{
    app::ExtensionSet,
    application::{
        passwords::Passwords,
        repos::{LoginRecord, NewUser, RepoError, UsersRepo},
    },
    config::{PasswordSettings, Settings, load_from_toml},
    domain::users::User,
    infra::db::Database,
};

pub const SECRET: &str = "integration-test-secret-0123456789abcdef";

pub fn settings_from(extra: &str) -> Settings {
    load_from_toml(&format!(
        r#"
        secret_key = "{SECRET}"
        {extra}

        [passwords]
        memory_kib = 64
        iterations = 1
        parallelism = 1
        "#
    ))
    .expect("valid test settings")
}

pub fn settings(debug: bool) -> Settings {
    settings_from(&format!("debug = {debug}"))
}

pub fn passwords() -> Passwords {
    Passwords::new(&PasswordSettings {
        memory_kib: NonZeroU32::new(64).unwrap(),
        iterations: NonZeroU32::new(1).unwrap(),
        parallelism: NonZeroU32::new(1).unwrap(),
    })
    .unwrap()
}

#[derive(Default)]
pub struct InMemoryUsers {
    users: Mutex<Vec<User>>,
    logins: Mutex<Vec<LoginRecord>>,
}

impl InMemoryUsers {
    pub async fn insert(&self, username: &str, password: &str, active: bool) -> User {
        let hash = passwords()
            .hash(&Secret::new(password.to_string()))
            .unwrap();
        let mut users = self.users.lock().await;
        let user = User {
            id: users.len() as i64 + 1,
            username: username.to_string(),
            password_hash: hash,
            active,
            created_at: OffsetDateTime::now_utc(),
            last_login_at: None,
            last_login_ip: None,
        };
        users.push(user.clone());
        user
    }

    pub async fn logins(&self) -> Vec<LoginRecord> {
        self.logins.lock().await.clone()
    }

    pub async fn get(&self, id: i64) -> Option<User> {
        self.users
            .lock()
            .await
            .iter()
            .find(|user| user.id == id)
            .cloned()
    }
}

#[async_trait]
impl UsersRepo for InMemoryUsers {
    async fn find_user(&self, id: i64) -> Result<Option<User>, RepoError> {
        Ok(self.get(id).await)
    }

    async fn find_user_by_username(&self, username: &str) -> Result<Option<User>, RepoError> {
        Ok(self
            .users
            .lock()
            .await
            .iter()
            .find(|user| user.username == username)
            .cloned())
    }

    async fn list_users(&self) -> Result<Vec<User>, RepoError> {
        Ok(self.users.lock().await.clone())
    }

    async fn create_user(&self, params: NewUser) -> Result<User, RepoError> {
        let mut users = self.users.lock().await;
        if users.iter().any(|user| user.username == params.username) {
            return Err(RepoError::Duplicate {
                constraint: "users_username_key".into(),
            });
        }
        let user = User {
            id: users.len() as i64 + 1,
            username: params.username,
            password_hash: params.password_hash,
            active: true,
            created_at: OffsetDateTime::now_utc(),
            last_login_at: None,
            last_login_ip: None,
        };
        users.push(user.clone());
        Ok(user)
    }

    async fn update_password_hash(&self, id: i64, password_hash: &str) -> Result<(), RepoError> {
        let mut users = self.users.lock().await;
        let user = users
            .iter_mut()
            .find(|user| user.id == id)
            .ok_or(RepoError::NotFound)?;
        user.password_hash = password_hash.to_string();
        Ok(())
    }

    async fn record_login(&self, record: LoginRecord) -> Result<(), RepoError> {
        let mut users = self.users.lock().await;
        let user = users
            .iter_mut()
            .find(|user| user.id == record.user_id)
            .ok_or(RepoError::NotFound)?;
        user.last_login_at = Some(record.at);
        user.last_login_ip = record.remote_addr.clone();
        self.logins.lock().await.push(record);
        Ok(())
    }
}

pub fn extensions(users: Arc<InMemoryUsers>) -> ExtensionSet {
    ExtensionSet {
        database: Database::from_repository(users),
        ..ExtensionSet::default()
    }
}

pub async fn body_string(response: Response<Body>) -> String {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

/// `name=value` pairs of every `Set-Cookie` header, for replay in a `Cookie` header.
pub fn cookie_pairs(response: &Response<Body>) -> Vec<String> {
    response
        .headers()
        .get_all(header::SET_COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .filter_map(|value| value.split(';').next())
        .map(|pair| pair.trim().to_string())
        .collect()
}

pub fn set_cookie_named<'a>(response: &'a Response<Body>, name: &str) -> Option<&'a str> {
    let prefix = format!("{name}=");
    response
        .headers()
        .get_all(header::SET_COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .find(|value| value.starts_with(&prefix))
}

pub fn location(response: &Response<Body>) -> &str {
    response
        .headers()
        .get(header::LOCATION)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
}

pub fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

pub fn get_with_cookies(uri: &str, cookies: &[String]) -> Request<Body> {
    Request::builder()
        .uri(uri)
        .header(header::COOKIE, cookies.join("; "))
        .body(Body::empty())
        .unwrap()
}

pub fn post_form(uri: &str, body: &str, cookies: &[String]) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded");
    if !cookies.is_empty() {
        builder = builder.header(header::COOKIE, cookies.join("; "));
    }
    builder.body(Body::from(body.to_string())).unwrap()
}
