mod common;

use anyhow::Result;
use axum::http::{header, Method, StatusCode};
use base64::Engine;
use common::{FakeBackend, TestApp};
use tsuru_api::event::TargetType;
use tsuru_api::storage::Repository;

#[tokio::test]
async fn bound_instance_is_refused_then_removed_with_unbindall() -> Result<()> {
    let backend = FakeBackend::start().await?;
    let app = TestApp::new()?;
    let admin = app.admin().await?;
    app.team("tsuruteam").await?;
    app.app("foo-bar", "tsuruteam").await?;
    app.service("mongodb", &backend.url, "tsuruteam").await?;
    app.instance("mongodb", "my-mongo", "tsuruteam", &["foo-bar"])
        .await?;

    let res = app
        .delete("/services/mongodb/instances/my-mongo", &admin)
        .await?;
    assert_eq!(res.status, StatusCode::BAD_REQUEST, "{}", res.text());
    assert!(res.text().contains("foo-bar"), "{}", res.text());
    assert!(backend.recorded().is_empty());

    let res = app
        .delete("/services/mongodb/instances/my-mongo?unbindall=true", &admin)
        .await?;
    assert_eq!(res.status, StatusCode::OK);
    assert_eq!(
        res.header("content-type"),
        Some("application/x-json-stream")
    );
    let frames = res.frames()?;
    assert!(frames.iter().all(|f| f.error.is_empty()), "{:?}", frames);
    assert!(frames
        .iter()
        .any(|f| f.message.contains(r#"Unbind app "foo-bar""#)));
    assert!(frames
        .iter()
        .any(|f| f.message.contains("service instance successfully removed")));

    let gone = app
        .state
        .storage
        .service_instances
        .find("mongodb/my-mongo")
        .await?;
    assert!(gone.is_none());

    let calls = backend.recorded();
    assert!(calls
        .iter()
        .any(|c| c.method == Method::DELETE && c.path.ends_with("/bind-app")));
    assert!(calls
        .iter()
        .any(|c| c.method == Method::DELETE && c.path == "/resources/my-mongo"));
    Ok(())
}

#[tokio::test]
async fn unbound_instance_removal_answers_plain_text() -> Result<()> {
    let backend = FakeBackend::start().await?;
    let app = TestApp::new()?;
    let admin = app.admin().await?;
    app.team("tsuruteam").await?;
    app.service("redis", &backend.url, "tsuruteam").await?;
    app.instance("redis", "cache", "tsuruteam", &[]).await?;

    let res = app.delete("/services/redis/instances/cache", &admin).await?;
    assert_eq!(res.status, StatusCode::OK);
    assert_eq!(res.text(), "service instance successfully removed\n");
    Ok(())
}

#[tokio::test]
async fn service_proxy_forwards_with_service_credentials() -> Result<()> {
    let backend = FakeBackend::start_with(StatusCode::OK, "proxied").await?;
    let app = TestApp::new()?;
    let admin = app.admin().await?;
    app.team("tsuruteam").await?;
    app.service("myservice", &backend.url, "tsuruteam").await?;

    let res = app
        .form(
            Method::POST,
            "/services/proxy/service/myservice?callback=/mypath",
            Some(&admin),
            "my=awesome&body=1",
        )
        .await?;
    assert_eq!(res.status, StatusCode::OK, "{}", res.text());
    assert_eq!(res.text(), "proxied");

    let calls = backend.recorded();
    assert_eq!(calls.len(), 1);
    let call = &calls[0];
    assert_eq!(call.method, Method::POST);
    assert_eq!(call.path, "/mypath");
    assert_eq!(call.query, None);
    assert_eq!(&call.body[..], b"my=awesome&body=1");

    let expected = format!(
        "Basic {}",
        base64::engine::general_purpose::STANDARD.encode("myservice:abcde")
    );
    let auth = call
        .headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());
    assert_eq!(auth, Some(expected.as_str()));
    assert_eq!(
        call.headers.get("X-Tsuru-User").and_then(|v| v.to_str().ok()),
        Some("admin@example.com")
    );
    assert!(call.headers.contains_key("X-Tsuru-Eventid"));

    let events = app.events().await?;
    let evt = events
        .iter()
        .find(|e| e.kind.name == "service.update.proxy")
        .expect("proxy event");
    assert_eq!(evt.target.target_type, TargetType::Service);
    assert_eq!(evt.target.value, "myservice");
    assert!(evt.end_time.is_some());
    assert!(evt.error.is_empty());

    let data = evt.start_custom_data.clone().expect("custom data");
    let fields = data.as_array().expect("field list");
    assert_eq!(fields[0]["name"], "method");
    assert_eq!(fields[0]["value"], "POST");
    let names: Vec<&str> = fields.iter().filter_map(|f| f["name"].as_str()).collect();
    for name in ["callback", "my", "body"] {
        assert!(names.contains(&name), "missing {} in {:?}", name, names);
    }
    Ok(())
}

#[tokio::test]
async fn service_proxy_get_is_not_audited() -> Result<()> {
    let backend = FakeBackend::start().await?;
    let app = TestApp::new()?;
    let admin = app.admin().await?;
    app.team("tsuruteam").await?;
    app.service("myservice", &backend.url, "tsuruteam").await?;

    let res = app
        .get("/services/proxy/service/myservice?callback=/status&verbose=1", &admin)
        .await?;
    assert_eq!(res.status, StatusCode::OK);
    let calls = backend.recorded();
    assert_eq!(calls[0].path, "/status");
    assert_eq!(calls[0].query.as_deref(), Some("verbose=1"));

    let events = app.events().await?;
    assert!(events.iter().all(|e| e.kind.name != "service.update.proxy"));
    Ok(())
}

#[tokio::test]
async fn instance_creation_reaches_the_back_end() -> Result<()> {
    let backend = FakeBackend::start_with(StatusCode::CREATED, "").await?;
    let app = TestApp::new()?;
    let admin = app.admin().await?;
    app.team("tsuruteam").await?;
    app.service("mysql", &backend.url, "tsuruteam").await?;

    let res = app
        .form(
            Method::POST,
            "/services/mysql/instances",
            Some(&admin),
            "name=db1&owner=tsuruteam&description=main",
        )
        .await?;
    assert_eq!(res.status, StatusCode::CREATED, "{}", res.text());

    let calls = backend.recorded();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].method, Method::POST);
    assert_eq!(calls[0].path, "/resources");
    assert!(String::from_utf8_lossy(&calls[0].body).contains("name=db1"));

    let stored = app
        .state
        .storage
        .service_instances
        .get("mysql/db1")
        .await?;
    assert_eq!(stored.team_owner, "tsuruteam");
    assert_eq!(stored.description, "main");
    Ok(())
}
