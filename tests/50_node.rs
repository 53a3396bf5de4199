mod common;

use anyhow::Result;
use axum::http::{Method, StatusCode};
use common::TestApp;
use tsuru_api::event::TargetType;

#[tokio::test]
async fn invalid_autoscale_rule_fails_and_is_recorded() -> Result<()> {
    let app = TestApp::new()?;
    let admin = app.admin().await?;

    let res = app
        .form(
            Method::POST,
            "/node/autoscale/rules",
            Some(&admin),
            "MetadataFilter=pool1&Enabled=true&ScaleDownRatio=0.9&MaxMemoryRatio=2.0",
        )
        .await?;
    assert_eq!(res.status, StatusCode::INTERNAL_SERVER_ERROR);
    assert!(
        res.text()
            .contains("scale down ratio needs to be greater than 1.0"),
        "{}",
        res.text()
    );

    let events = app.events().await?;
    let evt = events
        .iter()
        .find(|e| e.kind.name == "node.autoscale.update")
        .expect("rule event");
    assert_eq!(evt.target.target_type, TargetType::Pool);
    assert_eq!(evt.target.value, "pool1");
    assert!(evt.end_time.is_some());
    assert!(evt
        .error
        .contains("scale down ratio needs to be greater than 1.0"));

    let res = app.get("/autoscale/rules", &admin).await?;
    assert_eq!(res.status, StatusCode::NO_CONTENT);
    Ok(())
}

#[tokio::test]
async fn autoscale_rules_are_stored_and_removed() -> Result<()> {
    let app = TestApp::new()?;
    let admin = app.admin().await?;

    let res = app
        .form(
            Method::POST,
            "/autoscale/rules",
            Some(&admin),
            "MetadataFilter=pool1&Enabled=true&ScaleDownRatio=1.5&MaxMemoryRatio=0.9",
        )
        .await?;
    assert_eq!(res.status, StatusCode::OK, "{}", res.text());

    let res = app.get("/node/autoscale/rules", &admin).await?;
    assert_eq!(res.status, StatusCode::OK);
    let rules = res.json()?;
    assert_eq!(rules[0]["MetadataFilter"], "pool1");
    assert_eq!(rules[0]["ScaleDownRatio"], 1.5);

    let res = app.delete("/autoscale/rules/pool1", &admin).await?;
    assert_eq!(res.status, StatusCode::OK);
    let res = app.get("/autoscale/rules", &admin).await?;
    assert_eq!(res.status, StatusCode::NO_CONTENT);
    Ok(())
}

#[tokio::test]
async fn autoscale_run_is_streamed_and_listed() -> Result<()> {
    let app = TestApp::new()?;
    let admin = app.admin().await?;

    let res = app
        .call(
            Method::POST,
            "/autoscale/run",
            Some(&admin),
            None,
            axum::body::Body::empty(),
        )
        .await?;
    assert_eq!(res.status, StatusCode::OK);
    let frames = res.frames()?;
    assert!(frames.iter().all(|f| f.error.is_empty()), "{:?}", frames);
    assert!(frames
        .iter()
        .any(|f| f.message.contains("autoscale cycle finished")));

    let res = app.get("/autoscale", &admin).await?;
    assert_eq!(res.status, StatusCode::OK);
    let history = res.json()?;
    assert_eq!(history[0]["Kind"]["Name"], "node.autoscale.update.run");
    Ok(())
}

#[tokio::test]
async fn autoscale_requires_permission() -> Result<()> {
    let app = TestApp::new()?;
    let token = app.user("nobody@example.com").await?;

    let res = app.get("/autoscale/config", &token).await?;
    assert_eq!(res.status, StatusCode::FORBIDDEN);
    let res = app
        .form(
            Method::POST,
            "/autoscale/rules",
            Some(&token),
            "MetadataFilter=pool1&ScaleDownRatio=1.5",
        )
        .await?;
    assert_eq!(res.status, StatusCode::FORBIDDEN);
    let events = app.events().await?;
    assert!(events.iter().all(|e| !e.kind.name.starts_with("node.")));
    Ok(())
}
