#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Result};
use axum::{
    body::{to_bytes, Body, Bytes},
    extract::Request,
    http::{header, HeaderMap, Method, StatusCode},
    Router,
};
use parking_lot::Mutex;
use serde_json::Value;
use tower::ServiceExt;

use tsuru_api::auth::MemoryMailer;
use tsuru_api::config::{AppConfig, Environment};
use tsuru_api::event::{EventData, EventStore, Filter};
use tsuru_api::permission::scheme::registry;
use tsuru_api::permission::{Context, Role, RoleInstance};
use tsuru_api::state::{AppState, AppStateBuilder};
use tsuru_api::storage::models::{App, Pool, Service, ServiceInstance, Team};
use tsuru_api::storage::Repository;
use tsuru_api::stream::{parse_frames, JsonMessage};

pub const PASSWORD: &str = "123456";

pub fn test_config() -> AppConfig {
    let mut config = AppConfig::for_environment(Environment::Development);
    config.events.app_lock_retry_millis = 200;
    config.api.keepalive_interval_secs = 1;
    config.api.proxy_timeout_secs = 5;
    config
}

pub struct TestApp {
    pub state: AppState,
    pub router: Router,
    pub mailer: Arc<MemoryMailer>,
}

impl TestApp {
    pub fn new() -> Result<Self> {
        Self::with_config(test_config())
    }

    pub fn with_config(config: AppConfig) -> Result<Self> {
        Self::customized(config, |builder| builder)
    }

    /// Container with collaborators swapped in by `customize`.
    pub fn customized(
        config: AppConfig,
        customize: impl FnOnce(AppStateBuilder) -> AppStateBuilder,
    ) -> Result<Self> {
        let mailer = Arc::new(MemoryMailer::new());
        let builder = AppState::builder(config)
            .mailer(mailer.clone())
            .webhooks(false);
        let state = customize(builder).build()?;
        let router = tsuru_api::app(state.clone());
        Ok(Self {
            state,
            router,
            mailer,
        })
    }

    pub async fn send(&self, request: Request) -> Result<TestResponse> {
        let response = self.router.clone().oneshot(request).await?;
        let status = response.status();
        let headers = response.headers().clone();
        let body = to_bytes(response.into_body(), usize::MAX).await?;
        Ok(TestResponse {
            status,
            headers,
            body,
        })
    }

    pub async fn call(
        &self,
        method: Method,
        uri: &str,
        token: Option<&str>,
        content_type: Option<&str>,
        body: impl Into<Body>,
    ) -> Result<TestResponse> {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(token) = token {
            builder = builder.header(header::AUTHORIZATION, format!("bearer {}", token));
        }
        if let Some(content_type) = content_type {
            builder = builder.header(header::CONTENT_TYPE, content_type);
        }
        self.send(builder.body(body.into())?).await
    }

    pub async fn get(&self, uri: &str, token: &str) -> Result<TestResponse> {
        self.call(Method::GET, uri, Some(token), None, Body::empty())
            .await
    }

    pub async fn delete(&self, uri: &str, token: &str) -> Result<TestResponse> {
        self.call(Method::DELETE, uri, Some(token), None, Body::empty())
            .await
    }

    pub async fn form(
        &self,
        method: Method,
        uri: &str,
        token: Option<&str>,
        body: &str,
    ) -> Result<TestResponse> {
        self.call(
            method,
            uri,
            token,
            Some("application/x-www-form-urlencoded"),
            body.to_string(),
        )
        .await
    }

    pub async fn json(
        &self,
        method: Method,
        uri: &str,
        token: Option<&str>,
        body: Value,
    ) -> Result<TestResponse> {
        self.call(
            method,
            uri,
            token,
            Some("application/json"),
            body.to_string(),
        )
        .await
    }

    /// Register a user and log it in, returning the token value.
    pub async fn user(&self, email: &str) -> Result<String> {
        let scheme = self.state.auth.scheme();
        scheme.create(email, PASSWORD).await?;
        Ok(scheme.login(email, PASSWORD).await?)
    }

    /// Register a user holding each `(scheme, context)` through a
    /// dedicated role.
    pub async fn user_with(&self, email: &str, grants: &[(&str, Context)]) -> Result<String> {
        let token = self.user(email).await?;
        for (scheme, context) in grants {
            self.grant(email, scheme, context).await?;
        }
        Ok(token)
    }

    pub async fn grant(&self, email: &str, scheme: &str, context: &Context) -> Result<()> {
        let role_name = format!("{}-{}-{}", email, scheme, context.value());
        let mut role = Role::new(&role_name, context.context_type().as_str(), "")?;
        role.add_permissions(registry(), &[scheme.to_string()])?;
        self.state.storage.roles.insert(role).await?;

        let mut user = self.state.storage.users.get(email).await?;
        user.roles.push(RoleInstance::new(role_name, context.value()));
        self.state.storage.users.update(user).await?;
        Ok(())
    }

    pub async fn admin(&self) -> Result<String> {
        self.user_with("admin@example.com", &[("*", Context::Global)]).await
    }

    pub async fn team(&self, name: &str) -> Result<()> {
        self.state
            .storage
            .teams
            .insert(Team {
                name: name.to_string(),
                tags: vec![],
                created_by: String::new(),
            })
            .await?;
        Ok(())
    }

    pub async fn pool(&self, name: &str) -> Result<()> {
        self.state
            .storage
            .pools
            .insert(Pool {
                name: name.to_string(),
                public: true,
                ..Default::default()
            })
            .await?;
        Ok(())
    }

    pub async fn app(&self, name: &str, team: &str) -> Result<()> {
        self.state
            .storage
            .apps
            .insert(App {
                name: name.to_string(),
                team_owner: team.to_string(),
                teams: vec![team.to_string()],
                ..Default::default()
            })
            .await?;
        Ok(())
    }

    pub async fn service(&self, name: &str, endpoint: &str, team: &str) -> Result<Service> {
        let mut service = Service {
            name: name.to_string(),
            username: name.to_string(),
            password: "abcde".to_string(),
            owner_teams: vec![team.to_string()],
            ..Default::default()
        };
        service
            .endpoints
            .insert("production".to_string(), endpoint.to_string());
        self.state.storage.services.insert(service.clone()).await?;
        Ok(service)
    }

    pub async fn instance(
        &self,
        service: &str,
        name: &str,
        team: &str,
        apps: &[&str],
    ) -> Result<()> {
        self.state
            .storage
            .service_instances
            .insert(ServiceInstance {
                service_name: service.to_string(),
                name: name.to_string(),
                team_owner: team.to_string(),
                teams: vec![team.to_string()],
                apps: apps.iter().map(|a| a.to_string()).collect(),
                ..Default::default()
            })
            .await?;
        Ok(())
    }

    /// Every stored event, newest first.
    pub async fn events(&self) -> Result<Vec<EventData>> {
        Ok(self.state.journal.store().list(&Filter::default()).await?)
    }
}

#[derive(Debug)]
pub struct TestResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl TestResponse {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn json(&self) -> Result<Value> {
        serde_json::from_slice(&self.body)
            .with_context(|| format!("body is not JSON: {}", self.text()))
    }

    pub fn frames(&self) -> Result<Vec<JsonMessage>> {
        Ok(parse_frames(&self.body)?)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }
}

/// A request as seen by the fake back end.
#[derive(Debug, Clone)]
pub struct Recorded {
    pub method: Method,
    pub path: String,
    pub query: Option<String>,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// Service back end bound to a free local port that accepts everything
/// and records what it received.
pub struct FakeBackend {
    pub url: String,
    pub calls: Arc<Mutex<Vec<Recorded>>>,
}

impl FakeBackend {
    pub async fn start() -> Result<Self> {
        Self::start_with(StatusCode::OK, "").await
    }

    pub async fn start_with(status: StatusCode, reply: &'static str) -> Result<Self> {
        Self::spawn(status, reply, 0).await
    }

    /// Answer the first `failures` requests with a 500, then 200.
    pub async fn flaky(failures: usize) -> Result<Self> {
        Self::spawn(StatusCode::OK, "", failures).await
    }

    async fn spawn(status: StatusCode, reply: &'static str, failures: usize) -> Result<Self> {
        let port = portpicker::pick_unused_port().context("failed to pick free port")?;
        let addr = SocketAddr::from(([127, 0, 0, 1], port));
        let calls: Arc<Mutex<Vec<Recorded>>> = Arc::new(Mutex::new(Vec::new()));

        let recorder = calls.clone();
        let app = Router::new().fallback(move |request: Request| {
            let recorder = recorder.clone();
            async move {
                let (parts, body) = request.into_parts();
                let body = to_bytes(body, usize::MAX).await.unwrap_or_default();
                let status = {
                    let mut calls = recorder.lock();
                    calls.push(Recorded {
                        method: parts.method,
                        path: parts.uri.path().to_string(),
                        query: parts.uri.query().map(str::to_string),
                        headers: parts.headers,
                        body,
                    });
                    if calls.len() <= failures {
                        StatusCode::INTERNAL_SERVER_ERROR
                    } else {
                        status
                    }
                };
                (status, reply)
            }
        });

        let listener = tokio::net::TcpListener::bind(addr).await?;
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });

        Ok(Self {
            url: format!("http://{}", addr),
            calls,
        })
    }

    pub fn recorded(&self) -> Vec<Recorded> {
        self.calls.lock().clone()
    }

    /// Wait until at least `count` requests arrived or `timeout` passes.
    pub async fn wait_for(&self, count: usize, timeout: Duration) -> Vec<Recorded> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let calls = self.recorded();
            if calls.len() >= count || tokio::time::Instant::now() >= deadline {
                return calls;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }
}

/// Serve the router on a real socket for tests that need one.
pub async fn serve(app: &TestApp) -> Result<String> {
    let port = portpicker::pick_unused_port().context("failed to pick free port")?;
    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let router = app.router.clone();
    tokio::spawn(async move {
        let _ = axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await;
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    Ok(format!("http://{}", addr))
}
