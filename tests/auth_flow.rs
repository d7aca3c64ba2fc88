mod common;

use std::sync::Arc;

use axum::{Router, http::StatusCode, response::IntoResponse};
use axum_extra::extract::cookie::{Cookie, Key, SignedCookieJar};
use time::OffsetDateTime;
use tower::ServiceExt;

use common::{
    InMemoryUsers, SECRET, body_string, cookie_pairs, extensions, get, get_with_cookies,
    location, post_form, set_cookie_named, settings,
};
use truss::{
    app::{ExtensionSet, create_app},
    application::{passwords::Passwords, repos::RepoError},
    domain::users::{Anonymous, User},
    infra::http::auth::{LoginManager, Session},
};

const PASSWORD: &str = "correct-horse-battery";

async fn app_with_user(debug: bool) -> (Router, Arc<InMemoryUsers>) {
    let users = Arc::new(InMemoryUsers::default());
    users.insert("alice", PASSWORD, true).await;
    users.insert("mallory", PASSWORD, false).await;
    let router = create_app(&settings(debug), &extensions(users.clone()))
        .expect("full app")
        .into_router();
    (router, users)
}

async fn log_in(router: &Router, username: &str, password: &str) -> Vec<String> {
    let response = router
        .clone()
        .oneshot(post_form(
            "/login",
            &format!("username={username}&password={password}"),
            &[],
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SEE_OTHER);
    assert_eq!(location(&response), "/");
    cookie_pairs(&response)
        .into_iter()
        .filter(|pair| pair.starts_with("session="))
        .collect()
}

fn signed_session_cookie(session: &Session) -> Vec<String> {
    let jar = SignedCookieJar::new(Key::derive_from(SECRET.as_bytes()))
        .add(Cookie::new("session", session.encode()));
    cookie_pairs(&jar.into_response())
}

#[tokio::test]
async fn anonymous_request_is_redirected_to_login_with_flash() {
    let (router, _) = app_with_user(false).await;

    let response = router.clone().oneshot(get("/me")).await.unwrap();
    assert_eq!(response.status(), StatusCode::SEE_OTHER);
    assert_eq!(location(&response), "/login?next=%2Fme");
    assert!(set_cookie_named(&response, "_flash").is_some());

    let flash = cookie_pairs(&response);
    let response = router
        .oneshot(get_with_cookies("/login?next=%2Fme", &flash))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let removal = set_cookie_named(&response, "_flash").expect("flash cleared");
    assert!(removal.contains("Max-Age=0"));
    assert!(
        body_string(response)
            .await
            .contains("You do not have access to that page.")
    );
}

#[tokio::test]
async fn successful_login_sets_session_and_records_login() {
    let (router, users) = app_with_user(false).await;

    let response = router
        .clone()
        .oneshot(post_form(
            "/login",
            &format!("username=Alice&password={PASSWORD}&next=%2Fme"),
            &[],
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SEE_OTHER);
    assert_eq!(location(&response), "/me");
    let session = set_cookie_named(&response, "session").expect("session cookie");
    assert!(session.contains("HttpOnly"));
    let cookies = cookie_pairs(&response);

    let response = router
        .clone()
        .oneshot(get_with_cookies("/me", &cookies))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body: serde_json::Value =
        serde_json::from_str(&body_string(response).await).expect("json body");
    assert_eq!(body["username"], "alice");
    assert!(body.get("password_hash").is_none());

    let logins = users.logins().await;
    assert_eq!(logins.len(), 1);
    assert_eq!(logins[0].user_id, 1);
    assert!(users.get(1).await.expect("user").last_login_at.is_some());

    let response = router
        .oneshot(get_with_cookies("/", &cookies))
        .await
        .unwrap();
    assert!(body_string(response).await.contains("Hello, alice"));
}

#[tokio::test]
async fn unsafe_next_targets_fall_back_to_index() {
    let (router, _) = app_with_user(false).await;

    for next in [
        "%2F%2Fevil.example",
        "https%3A%2F%2Fevil.example",
        "%2F%09%2Fevil.example",
        "%2F%0A%2Fevil.example",
        "%2Fa%0D%0AX-Injected%3A+1",
    ] {
        let response = router
            .clone()
            .oneshot(post_form(
                "/login",
                &format!("username=alice&password={PASSWORD}&next={next}"),
                &[],
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SEE_OTHER, "next={next}");
        assert_eq!(location(&response), "/", "next={next}");
        assert!(response.headers().get("x-injected").is_none());
    }
}

#[tokio::test]
async fn unknown_and_malformed_usernames_still_run_a_password_verification() {
    let users = Arc::new(InMemoryUsers::default());
    users.insert("alice", PASSWORD, true).await;
    let app = create_app(&settings(false), &extensions(users.clone())).expect("full app");
    let passwords = app
        .extension::<Arc<Passwords>>()
        .cloned()
        .expect("password hasher bound");
    let router = app.into_router();

    let mut expected = passwords.verifications();
    for form in [
        "username=alice&password=wrong-password",
        "username=nobody&password=wrong-password",
        "username=%21%21&password=wrong-password",
    ] {
        let response = router
            .clone()
            .oneshot(post_form("/login", form, &[]))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SEE_OTHER, "{form}");
        assert_eq!(location(&response), "/login", "{form}");

        expected += 1;
        assert_eq!(passwords.verifications(), expected, "{form}");
    }
}

#[tokio::test]
async fn wrong_password_and_unknown_user_share_one_message() {
    let (router, users) = app_with_user(false).await;

    for form in [
        "username=alice&password=wrong-password&next=%2Fme",
        "username=nobody&password=wrong-password&next=%2Fme",
    ] {
        let response = router
            .clone()
            .oneshot(post_form("/login", form, &[]))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SEE_OTHER);
        assert_eq!(location(&response), "/login?next=%2Fme");
        assert!(set_cookie_named(&response, "session").is_none());

        let flash = cookie_pairs(&response);
        let response = router
            .clone()
            .oneshot(get_with_cookies("/login", &flash))
            .await
            .unwrap();
        assert!(
            body_string(response)
                .await
                .contains("Invalid username or password.")
        );
    }
    assert!(users.logins().await.is_empty());
}

#[tokio::test]
async fn inactive_accounts_cannot_log_in() {
    let (router, _) = app_with_user(false).await;

    let response = router
        .clone()
        .oneshot(post_form(
            "/login",
            &format!("username=mallory&password={PASSWORD}"),
            &[],
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SEE_OTHER);
    assert_eq!(location(&response), "/login");
    assert!(set_cookie_named(&response, "session").is_none());

    let flash = cookie_pairs(&response);
    let response = router
        .oneshot(get_with_cookies("/login", &flash))
        .await
        .unwrap();
    assert!(body_string(response).await.contains("This account is disabled."));
}

#[tokio::test]
async fn account_requires_a_fresh_login() {
    let (router, _) = app_with_user(false).await;

    let fresh = log_in(&router, "alice", PASSWORD).await;
    let response = router
        .clone()
        .oneshot(get_with_cookies("/account", &fresh))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(body_string(response).await.contains("<h1>alice</h1>"));

    let stale = signed_session_cookie(&Session {
        user_id: "1".into(),
        fresh: false,
        issued_at: OffsetDateTime::now_utc().unix_timestamp(),
    });
    let response = router
        .clone()
        .oneshot(get_with_cookies("/account", &stale))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SEE_OTHER);
    assert_eq!(location(&response), "/login?next=%2Faccount");

    let flash = cookie_pairs(&response);
    let response = router
        .clone()
        .oneshot(get_with_cookies("/login", &flash))
        .await
        .unwrap();
    assert!(
        body_string(response)
            .await
            .contains("Please reauthenticate to access this page.")
    );

    let response = router
        .oneshot(get_with_cookies("/me", &stale))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn tampered_session_cookie_is_anonymous() {
    let (router, _) = app_with_user(false).await;
    let forged = Session::fresh("1".into(), OffsetDateTime::now_utc());

    let response = router
        .oneshot(get_with_cookies(
            "/me",
            &[format!("session={}", forged.encode())],
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SEE_OTHER);
}

#[tokio::test]
async fn logout_clears_the_session() {
    let (router, _) = app_with_user(false).await;
    let session = log_in(&router, "alice", PASSWORD).await;

    let response = router
        .clone()
        .oneshot(post_form("/logout", "", &session))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SEE_OTHER);
    assert_eq!(location(&response), "/");
    let removal = set_cookie_named(&response, "session").expect("session removed");
    assert!(removal.contains("Max-Age=0"));
}

#[tokio::test]
async fn password_change_takes_effect_on_next_login() {
    let (router, users) = app_with_user(false).await;
    let session = log_in(&router, "alice", PASSWORD).await;
    let old_hash = users.get(1).await.expect("user").password_hash;

    let response = router
        .clone()
        .oneshot(post_form(
            "/account/password",
            &format!("current_password={PASSWORD}&new_password=another-secret-1"),
            &session,
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SEE_OTHER);
    assert_eq!(location(&response), "/account");
    assert_ne!(users.get(1).await.expect("user").password_hash, old_hash);

    let renewed = log_in(&router, "alice", "another-secret-1").await;
    assert_eq!(renewed.len(), 1);
}

#[tokio::test]
async fn wrong_current_password_keeps_the_old_hash() {
    let (router, users) = app_with_user(false).await;
    let session = log_in(&router, "alice", PASSWORD).await;
    let old_hash = users.get(1).await.expect("user").password_hash;

    let response = router
        .oneshot(post_form(
            "/account/password",
            "current_password=not-my-password&new_password=another-secret-1",
            &session,
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SEE_OTHER);
    assert!(set_cookie_named(&response, "_flash").is_some());
    assert_eq!(users.get(1).await.expect("user").password_hash, old_hash);
}

#[tokio::test]
async fn admin_pages_require_login() {
    let (router, _) = app_with_user(true).await;

    let response = router.clone().oneshot(get("/admin/users")).await.unwrap();
    assert_eq!(response.status(), StatusCode::SEE_OTHER);
    assert_eq!(location(&response), "/login?next=%2Fadmin%2Fusers");

    let session = log_in(&router, "alice", PASSWORD).await;
    let response = router
        .oneshot(get_with_cookies("/admin/users", &session))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_string(response).await;
    assert!(body.contains("alice"));
    assert!(body.contains("mallory"));
}

#[tokio::test]
async fn custom_loader_and_anonymous_identity_replace_the_defaults() {
    let users = Arc::new(InMemoryUsers::default());
    users.insert("alice", PASSWORD, true).await;
    let loaded = User {
        username: "loaded-by-callback".into(),
        ..users.get(1).await.expect("user")
    };
    let set = ExtensionSet {
        login_manager: LoginManager::new()
            .with_anonymous(Anonymous {
                display_name: "Visitor".into(),
            })
            .with_user_loader(move |id| {
                let user = (id == "1").then(|| loaded.clone());
                async move { Ok::<_, RepoError>(user) }
            }),
        ..extensions(users.clone())
    };
    let router = create_app(&settings(false), &set)
        .expect("full app")
        .into_router();

    let response = router.clone().oneshot(get("/")).await.unwrap();
    assert!(body_string(response).await.contains("Hello, Visitor"));

    let cookies = log_in(&router, "alice", PASSWORD).await;
    let response = router
        .clone()
        .oneshot(get_with_cookies("/me", &cookies))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body: serde_json::Value =
        serde_json::from_str(&body_string(response).await).expect("json body");
    assert_eq!(body["username"], "loaded-by-callback");

    let unknown = signed_session_cookie(&Session::fresh("99".into(), OffsetDateTime::now_utc()));
    let response = router
        .oneshot(get_with_cookies("/", &unknown))
        .await
        .unwrap();
    assert!(body_string(response).await.contains("Hello, Visitor"));
}
