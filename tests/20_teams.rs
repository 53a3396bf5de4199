mod common;

use anyhow::Result;
use axum::http::{Method, StatusCode};

use common::TestApp;
use tsuru_api::permission::Context;
use tsuru_api::storage::Repository;

#[tokio::test]
async fn teams_list_shows_held_permissions() -> Result<()> {
    let app = TestApp::new()?;
    app.team("tsuruteam").await?;
    app.team("otherteam").await?;

    let token = app
        .user_with("creator@example.com", &[("app.create", Context::team("tsuruteam"))])
        .await?;
    let res = app.get("/teams", &token).await?;
    assert_eq!(res.status, StatusCode::OK, "{}", res.text());
    let teams = res.json()?;
    let teams = teams.as_array().expect("list of teams");
    assert_eq!(teams.len(), 1);
    assert_eq!(teams[0]["name"], "tsuruteam");
    assert_eq!(teams[0]["permissions"], serde_json::json!(["app.create"]));

    let nobody = app.user("nobody@example.com").await?;
    let res = app.get("/teams", &nobody).await?;
    assert_eq!(res.status, StatusCode::NO_CONTENT);
    Ok(())
}

#[tokio::test]
async fn create_team_and_refuse_duplicates() -> Result<()> {
    let app = TestApp::new()?;
    let token = app.user_with("lead@example.com", &[("team.create", Context::Global)]).await?;

    let res = app
        .form(Method::POST, "/teams", Some(&token), "name=platform")
        .await?;
    assert_eq!(res.status, StatusCode::CREATED, "{}", res.text());

    let res = app
        .form(Method::POST, "/teams", Some(&token), "name=platform")
        .await?;
    assert_eq!(res.status, StatusCode::CONFLICT);

    let res = app
        .form(Method::POST, "/teams", Some(&token), "name=Not%20Valid")
        .await?;
    assert_eq!(res.status, StatusCode::BAD_REQUEST);
    Ok(())
}

#[tokio::test]
async fn team_with_apps_cannot_be_removed() -> Result<()> {
    let app = TestApp::new()?;
    app.team("busy").await?;
    app.app("myapp", "busy").await?;
    let admin = app.admin().await?;

    let res = app.delete("/teams/busy", &admin).await?;
    assert_eq!(res.status, StatusCode::FORBIDDEN, "{}", res.text());
    assert!(app.state.storage.teams.find("busy").await?.is_some());

    app.team("idle").await?;
    let res = app.delete("/teams/idle", &admin).await?;
    assert_eq!(res.status, StatusCode::OK, "{}", res.text());
    Ok(())
}

#[tokio::test]
async fn requests_without_token_are_unauthorized() -> Result<()> {
    let app = TestApp::new()?;
    let res = app
        .call(Method::GET, "/teams", None, None, axum::body::Body::empty())
        .await?;
    assert_eq!(res.status, StatusCode::UNAUTHORIZED);

    let res = app.get("/teams", "not-a-real-token").await?;
    assert_eq!(res.status, StatusCode::UNAUTHORIZED);
    Ok(())
}
