mod common;

use anyhow::Result;
use axum::http::{Method, StatusCode};
use serde_json::Value;

use common::TestApp;
use tsuru_api::storage::Repository;

const CREDENTIALS: &str = "cacert=ca-s3cr3t&clientcert=cert-s3cr3t&clientkey=key-s3cr3t";

fn field<'a>(data: &'a Value, name: &str) -> Option<&'a Value> {
    data.as_array()?
        .iter()
        .find(|f| f["name"] == name)
        .map(|f| &f["value"])
}

#[tokio::test]
async fn cluster_credentials_stay_out_of_events() -> Result<()> {
    let app = TestApp::new()?;
    let admin = app.admin().await?;

    let body = format!("name=c1&provisioner=local&default=true&{CREDENTIALS}");
    let res = app
        .form(Method::POST, "/provisioner/clusters", Some(&admin), &body)
        .await?;
    assert_eq!(res.status, StatusCode::OK, "{}", res.text());

    let body = format!("name=c1&provisioner=local&default=true&{}", CREDENTIALS.replace("s3cr3t", "n3w"));
    let res = app
        .form(Method::PUT, "/provisioner/clusters/c1", Some(&admin), &body)
        .await?;
    assert_eq!(res.status, StatusCode::OK, "{}", res.text());
    assert_eq!(app.state.storage.clusters.get("c1").await?.clientkey, "key-n3w");

    let events = app.events().await?;
    for kind in ["cluster.create", "cluster.update"] {
        let evt = events
            .iter()
            .find(|e| e.kind.name == kind)
            .unwrap_or_else(|| panic!("missing {kind} event"));
        let data = evt.start_custom_data.as_ref().expect("recorded input");
        for secret in ["cacert", "clientcert", "clientkey"] {
            assert_eq!(field(data, secret), Some(&Value::from("*****")), "{kind} {secret}");
        }
        let raw = data.to_string();
        assert!(!raw.contains("s3cr3t") && !raw.contains("n3w"), "{raw}");
        assert_eq!(field(data, "provisioner"), Some(&Value::from("local")));
    }
    Ok(())
}

#[tokio::test]
async fn cluster_reads_hide_the_client_key() -> Result<()> {
    let app = TestApp::new()?;
    let admin = app.admin().await?;
    let body = format!("name=c1&provisioner=local&default=true&{CREDENTIALS}");
    let res = app
        .form(Method::POST, "/provisioner/clusters", Some(&admin), &body)
        .await?;
    assert_eq!(res.status, StatusCode::OK, "{}", res.text());

    let res = app.get("/provisioner/clusters", &admin).await?;
    assert_eq!(res.status, StatusCode::OK);
    let clusters = res.json()?;
    assert_eq!(clusters[0]["name"], "c1");
    assert_eq!(clusters[0]["clientkey"], "");
    assert_eq!(clusters[0]["cacert"], "ca-s3cr3t");

    let res = app.get("/provisioner/clusters/c1", &admin).await?;
    assert_eq!(res.status, StatusCode::OK);
    let cluster = res.json()?;
    assert_eq!(cluster["clientkey"], "");
    assert!(!res.text().contains("key-s3cr3t"));
    Ok(())
}

#[tokio::test]
async fn cluster_needs_default_or_pools() -> Result<()> {
    let app = TestApp::new()?;
    let admin = app.admin().await?;

    let res = app
        .form(Method::POST, "/provisioner/clusters", Some(&admin), "name=c1&provisioner=local")
        .await?;
    assert_eq!(res.status, StatusCode::BAD_REQUEST);
    assert!(app.state.storage.clusters.find("c1").await?.is_none());
    assert!(app.events().await?.iter().all(|e| e.kind.name != "cluster.create"));
    Ok(())
}
