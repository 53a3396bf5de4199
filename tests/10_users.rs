mod common;

use anyhow::Result;
use axum::http::{Method, StatusCode};
use serde_json::json;

use common::TestApp;
use tsuru_api::config::AppConfig;

#[tokio::test]
async fn register_login_and_resolve_token() -> Result<()> {
    let app = TestApp::new()?;

    let res = app
        .json(
            Method::POST,
            "/users",
            None,
            json!({"email": "nobody@globo.com", "password": "123456"}),
        )
        .await?;
    assert_eq!(res.status, StatusCode::CREATED, "{}", res.text());

    let res = app
        .json(
            Method::POST,
            "/users/nobody@globo.com/tokens",
            None,
            json!({"password": "123456"}),
        )
        .await?;
    assert_eq!(res.status, StatusCode::OK, "{}", res.text());
    let token = res.json()?["token"]
        .as_str()
        .map(str::to_string)
        .expect("token in login response");
    assert!(!token.is_empty());

    let resolved = app.state.auth.resolve(&format!("bearer {}", token)).await?;
    assert_eq!(resolved.user_name(), "nobody@globo.com");

    let res = app.get("/users/info", &token).await?;
    assert_eq!(res.status, StatusCode::OK);
    assert_eq!(res.json()?["Email"], "nobody@globo.com");
    Ok(())
}

#[tokio::test]
async fn registration_is_audited_without_the_password() -> Result<()> {
    let app = TestApp::new()?;
    let res = app
        .form(
            Method::POST,
            "/users",
            None,
            "email=audited@example.com&password=s3cr3t!",
        )
        .await?;
    assert_eq!(res.status, StatusCode::CREATED);

    let events = app.events().await?;
    let evt = events
        .iter()
        .find(|e| e.kind.name == "user.create")
        .expect("user.create event");
    assert!(!evt.running);
    let start = evt.start_custom_data.clone().unwrap_or_default().to_string();
    assert!(start.contains("audited@example.com"), "{}", start);
    assert!(!start.contains("s3cr3t!"), "{}", start);
    assert!(start.contains("*****"), "{}", start);
    Ok(())
}

#[tokio::test]
async fn duplicate_and_invalid_users_are_rejected() -> Result<()> {
    let app = TestApp::new()?;
    app.user("taken@example.com").await?;

    let res = app
        .form(
            Method::POST,
            "/users",
            None,
            "email=taken@example.com&password=123456",
        )
        .await?;
    assert_eq!(res.status, StatusCode::CONFLICT);

    let res = app
        .form(Method::POST, "/users", None, "email=not-an-email&password=123456")
        .await?;
    assert_eq!(res.status, StatusCode::BAD_REQUEST);

    let res = app
        .form(Method::POST, "/users", None, "email=short@example.com&password=123")
        .await?;
    assert_eq!(res.status, StatusCode::BAD_REQUEST);
    Ok(())
}

#[tokio::test]
async fn wrong_password_is_unauthorized() -> Result<()> {
    let app = TestApp::new()?;
    app.user("someone@example.com").await?;
    let res = app
        .form(
            Method::POST,
            "/users/someone@example.com/tokens",
            None,
            "password=wrong-one",
        )
        .await?;
    assert_eq!(res.status, StatusCode::UNAUTHORIZED);
    assert!(res.text().ends_with('\n'));
    Ok(())
}

#[tokio::test]
async fn registration_disabled_needs_user_create() -> Result<()> {
    let mut config: AppConfig = common::test_config();
    config.auth.user_registration = false;
    let app = TestApp::with_config(config)?;

    let res = app
        .form(Method::POST, "/users", None, "email=new@example.com&password=123456")
        .await?;
    assert_eq!(res.status, StatusCode::UNAUTHORIZED, "{}", res.text());

    let admin = app.admin().await?;
    let res = app
        .form(
            Method::POST,
            "/users",
            Some(&admin),
            "email=new@example.com&password=123456",
        )
        .await?;
    assert_eq!(res.status, StatusCode::CREATED, "{}", res.text());
    Ok(())
}

#[tokio::test]
async fn logout_invalidates_the_token() -> Result<()> {
    let app = TestApp::new()?;
    let token = app.user("leaving@example.com").await?;

    let res = app.delete("/users/tokens", &token).await?;
    assert_eq!(res.status, StatusCode::OK);

    let res = app.get("/users/info", &token).await?;
    assert_eq!(res.status, StatusCode::UNAUTHORIZED);
    Ok(())
}

#[tokio::test]
async fn password_reset_mails_a_token() -> Result<()> {
    let app = TestApp::new()?;
    app.user("forgetful@example.com").await?;

    let res = app
        .call(
            Method::POST,
            "/users/forgetful@example.com/password",
            None,
            None,
            axum::body::Body::empty(),
        )
        .await?;
    assert_eq!(res.status, StatusCode::OK, "{}", res.text());
    let sent = app.mailer.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].to, "forgetful@example.com");
    Ok(())
}
