mod common;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use axum::http::{Method, StatusCode};
use serde_json::json;

use common::{test_config, TestApp};
use tsuru_api::event::{AllowedPermission, Opts, Owner, OwnerType, Target, TargetType};
use tsuru_api::permission::scheme::{APP_READ_EVENTS, EVENT_CANCEL};
use tsuru_api::permission::Context;
use tsuru_api::services::LocalProvisioner;
use tsuru_api::storage::Repository;

fn user_owner(name: &str) -> Owner {
    Owner {
        owner_type: OwnerType::User,
        name: name.to_string(),
    }
}

#[tokio::test]
async fn concurrent_autoscale_change_is_refused_while_app_is_locked() -> Result<()> {
    let app = TestApp::new()?;
    app.team("tsuruteam").await?;
    app.app("myapp", "tsuruteam").await?;
    let admin = app.admin().await?;

    let in_flight = app
        .state
        .journal
        .new_event(Opts {
            target: Some(Target::app("myapp")),
            kind: Some("app.update.unit.autoscale.add".into()),
            owner: Some(user_owner("first@example.com")),
            allowed: AllowedPermission::new(APP_READ_EVENTS, vec![Context::app("myapp")]),
            ..Default::default()
        })
        .await?;

    let body = json!({"process": "p1", "minUnits": 2, "maxUnits": 10, "averageCPU": "600m"});
    let res = app
        .json(
            Method::PUT,
            "/apps/myapp/units/autoscale",
            Some(&admin),
            body.clone(),
        )
        .await?;
    assert_eq!(res.status, StatusCode::CONFLICT, "{}", res.text());
    let message = res.text();
    assert!(message.contains("app.update.unit.autoscale.add"), "{}", message);
    assert!(message.contains("first@example.com"), "{}", message);

    in_flight.done(None).await?;

    let res = app
        .json(Method::PUT, "/apps/myapp/units/autoscale", Some(&admin), body)
        .await?;
    assert_eq!(res.status, StatusCode::OK, "{}", res.text());

    let stored = app.state.storage.apps.get("myapp").await?;
    assert_eq!(stored.autoscale.len(), 1);
    assert_eq!(stored.autoscale[0].process, "p1");
    assert_eq!(stored.autoscale[0].min_units, 2);
    assert_eq!(stored.autoscale[0].max_units, 10);
    assert_eq!(stored.autoscale[0].average_cpu, "600m");
    Ok(())
}

#[tokio::test]
async fn every_request_event_is_finalized() -> Result<()> {
    let app = TestApp::new()?;
    app.team("tsuruteam").await?;
    app.app("myapp", "tsuruteam").await?;
    let admin = app.admin().await?;

    let res = app
        .form(
            Method::POST,
            "/apps/myapp/units/autoscale",
            Some(&admin),
            "process=web&minUnits=5&maxUnits=1&averageCPU=50%25",
        )
        .await?;
    assert_eq!(res.status, StatusCode::BAD_REQUEST, "{}", res.text());

    let events = app.events().await?;
    assert!(!events.is_empty());
    assert!(events.iter().all(|e| !e.running));
    let failed = events
        .iter()
        .find(|e| e.kind.name == "app.update.unit.autoscale.add")
        .expect("autoscale event");
    assert!(!failed.error.is_empty());
    Ok(())
}

#[tokio::test]
async fn events_are_listed_only_for_readers() -> Result<()> {
    let app = TestApp::new()?;
    app.team("team-a").await?;
    app.team("team-b").await?;
    app.app("app-a", "team-a").await?;
    app.app("app-b", "team-b").await?;
    let admin = app.admin().await?;

    for name in ["app-a", "app-b"] {
        let res = app
            .form(
                Method::POST,
                &format!("/apps/{}/units/autoscale", name),
                Some(&admin),
                "process=web&minUnits=1&maxUnits=2&averageCPU=600m",
            )
            .await?;
        assert_eq!(res.status, StatusCode::OK, "{}", res.text());
    }

    let reader = app
        .user_with("reader@example.com", &[("app.read.events", Context::app("app-a"))])
        .await?;
    let res = app.get("/events?target.type=app", &reader).await?;
    assert_eq!(res.status, StatusCode::OK, "{}", res.text());
    let events = res.json()?;
    let targets: Vec<&str> = events
        .as_array()
        .expect("event list")
        .iter()
        .filter_map(|e| e["Target"]["Value"].as_str())
        .collect();
    assert_eq!(targets, vec!["app-a"]);

    let outsider = app.user("outsider@example.com").await?;
    let res = app.get("/events", &outsider).await?;
    assert_eq!(res.status, StatusCode::NO_CONTENT);

    let res = app.get("/events?kindtype=bogus", &reader).await?;
    assert_eq!(res.status, StatusCode::BAD_REQUEST);
    Ok(())
}

#[tokio::test]
async fn cancel_a_running_event() -> Result<()> {
    let app = TestApp::new()?;
    let admin = app.admin().await?;

    let evt = app
        .state
        .journal
        .new_event(Opts {
            target: Some(Target::new(TargetType::Pool, "pool1")),
            kind: Some("node.autoscale.update.run".into()),
            owner: Some(user_owner("admin@example.com")),
            cancelable: true,
            allowed: AllowedPermission::new("node.autoscale.read", vec![]),
            allowed_cancel: AllowedPermission::new(EVENT_CANCEL, vec![]),
            ..Default::default()
        })
        .await?;
    let uri = format!("/events/{}/cancel", evt.id());

    let res = app.form(Method::POST, &uri, Some(&admin), "").await?;
    assert_eq!(res.status, StatusCode::BAD_REQUEST);
    assert_eq!(res.text(), "reason is mandatory\n");

    let res = app
        .form(Method::POST, &uri, Some(&admin), "reason=taking+too+long")
        .await?;
    assert_eq!(res.status, StatusCode::NO_CONTENT, "{}", res.text());
    assert!(evt.is_canceled().await?);

    let res = app
        .form(Method::POST, &uri, Some(&admin), "reason=again")
        .await?;
    assert_eq!(res.status, StatusCode::BAD_REQUEST);

    let res = app.get(&format!("/events/{}", evt.id()), &admin).await?;
    assert_eq!(res.status, StatusCode::OK);
    let data = res.json()?;
    assert_eq!(data["CancelInfo"]["Reason"], "taking too long");
    assert_eq!(data["Running"], true);

    let res = app.get("/events/not-a-uuid", &admin).await?;
    assert_eq!(res.status, StatusCode::BAD_REQUEST);
    Ok(())
}

#[tokio::test]
async fn event_kinds_are_listed() -> Result<()> {
    let app = TestApp::new()?;
    let admin = app.admin().await?;
    let res = app
        .form(Method::POST, "/teams", Some(&admin), "name=kinds-team")
        .await?;
    assert_eq!(res.status, StatusCode::CREATED, "{}", res.text());

    let res = app.get("/events/kinds", &admin).await?;
    assert_eq!(res.status, StatusCode::OK);
    let kinds = res.json()?;
    assert!(kinds
        .as_array()
        .expect("kind list")
        .iter()
        .any(|k| k["Name"] == "team.create"));
    Ok(())
}

#[tokio::test]
async fn abandoned_request_still_finalizes_its_event() -> Result<()> {
    let provisioner = Arc::new(LocalProvisioner::new().with_delay(Duration::from_secs(5)));
    let app = TestApp::customized(test_config(), |b| b.provisioner(provisioner.clone()))?;
    app.team("tsuruteam").await?;
    app.app("myapp", "tsuruteam").await?;
    let admin = app.admin().await?;

    let body = json!({"process": "web", "minUnits": 1, "maxUnits": 3, "averageCPU": "500m"});
    let request = app.json(Method::PUT, "/apps/myapp/units/autoscale", Some(&admin), body);
    assert!(tokio::time::timeout(Duration::from_millis(300), request).await.is_err());

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    let evt = loop {
        let events = app.events().await?;
        let evt = events
            .into_iter()
            .find(|e| e.kind.name == "app.update.unit.autoscale.add")
            .expect("autoscale event");
        if !evt.running || tokio::time::Instant::now() >= deadline {
            break evt;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    };
    assert!(!evt.running);
    assert_eq!(evt.error, "event finalized without an explicit outcome");
    assert!(provisioner.calls().is_empty());
    Ok(())
}
