use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use reqwest::header::{HeaderName, HeaderValue, CONTENT_TYPE, USER_AGENT};
use reqwest::Method;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Semaphore};
use tracing::{debug, error, warn};

use super::journal::EventHook;
use super::EventData;
use crate::config::EventConfig;
use crate::metrics;
use crate::storage::models::Webhook;
use crate::storage::Repository;

pub const USER_AGENT_VALUE: &str = "tsuru-webhook-client/1.0";

const QUEUE_SIZE: usize = 1000;
const BASE_BACKOFF: Duration = Duration::from_millis(100);

static PLACEHOLDER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{\{\s*\.([A-Za-z0-9_.]*)\s*\}\}").expect("valid placeholder regex"));

#[derive(Debug, Clone)]
pub struct DispatcherSettings {
    pub workers: usize,
    pub max_retries: u32,
    pub timeout: Duration,
}

impl From<&EventConfig> for DispatcherSettings {
    fn from(config: &EventConfig) -> Self {
        Self {
            workers: config.webhook_workers.max(1),
            max_retries: config.webhook_max_retries,
            timeout: Duration::from_secs(config.webhook_timeout_secs.max(1)),
        }
    }
}

/// Whether `hook` subscribes to the finished event `evt`.
pub fn hook_matches(hook: &Webhook, evt: &EventData) -> bool {
    let filter = &hook.event_filter;
    let targets = || std::iter::once(&evt.target).chain(evt.extra_targets.iter().map(|t| &t.target));

    if !filter.target_types.is_empty()
        && !targets().any(|t| filter.target_types.iter().any(|ft| ft == t.target_type.as_str()))
    {
        return false;
    }
    if !filter.target_values.is_empty()
        && !targets().any(|t| filter.target_values.contains(&t.value))
    {
        return false;
    }
    if !filter.kind_types.is_empty() {
        let kind_type = match evt.kind.kind_type {
            super::KindType::Permission => "permission",
            super::KindType::Internal => "internal",
        };
        if !filter.kind_types.iter().any(|k| k == kind_type) {
            return false;
        }
    }
    if !filter.kind_names.is_empty() && !filter.kind_names.contains(&evt.kind.name) {
        return false;
    }
    if filter.error_only && !evt.is_error() {
        return false;
    }
    if filter.success_only && evt.is_error() {
        return false;
    }
    true
}

/// Expand `{{.Field.Sub}}` placeholders against the event document.
pub fn render_body(template: &str, evt: &EventData) -> String {
    let doc = match serde_json::to_value(evt) {
        Ok(doc) => doc,
        Err(e) => {
            warn!("unable to encode event {} for webhook body: {}", evt.unique_id, e);
            return template.to_string();
        }
    };
    PLACEHOLDER_RE
        .replace_all(template, |caps: &Captures| {
            let mut current = &doc;
            for segment in caps[1].split('.').filter(|s| !s.is_empty()) {
                match current.get(segment) {
                    Some(next) => current = next,
                    None => return String::new(),
                }
            }
            match current {
                Value::String(s) => s.clone(),
                Value::Null => String::new(),
                other => other.to_string(),
            }
        })
        .into_owned()
}

/// HTTP clients reused across deliveries, one per TLS and proxy setting.
#[derive(Default)]
struct Clients {
    cache: Mutex<HashMap<(bool, String), reqwest::Client>>,
}

impl Clients {
    fn for_hook(&self, hook: &Webhook) -> anyhow::Result<reqwest::Client> {
        let key = (hook.insecure, hook.proxy_url.clone());
        if let Some(client) = self.cache.lock().get(&key) {
            return Ok(client.clone());
        }
        let mut builder = reqwest::Client::builder();
        if hook.insecure {
            builder = builder.danger_accept_invalid_certs(true);
        }
        if !hook.proxy_url.is_empty() {
            builder = builder.proxy(reqwest::Proxy::all(&hook.proxy_url)?);
        }
        let client = builder.build()?;
        Ok(self.cache.lock().entry(key).or_insert(client).clone())
    }
}

/// Delivers finished events to subscribed webhooks in the background.
pub struct WebhookDispatcher {
    tx: mpsc::Sender<EventData>,
}

impl WebhookDispatcher {
    pub fn start(hooks: Arc<dyn Repository<Webhook>>, settings: DispatcherSettings) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(QUEUE_SIZE);
        tokio::spawn(run(rx, hooks, settings));
        Arc::new(Self { tx })
    }
}

#[async_trait]
impl EventHook for WebhookDispatcher {
    async fn on_done(&self, evt: &EventData) {
        match self.tx.try_send(evt.clone()) {
            Ok(()) => metrics::webhook_queued(),
            Err(e) => warn!("webhook queue unavailable, dropping event {}: {}", evt.unique_id, e),
        }
    }
}

async fn run(
    mut rx: mpsc::Receiver<EventData>,
    hooks: Arc<dyn Repository<Webhook>>,
    settings: DispatcherSettings,
) {
    let permits = Arc::new(Semaphore::new(settings.workers));
    let clients = Arc::new(Clients::default());
    while let Some(evt) = rx.recv().await {
        metrics::webhook_dequeued();
        let matching: Vec<Webhook> = match hooks.list().await {
            Ok(all) => all.into_iter().filter(|h| hook_matches(h, &evt)).collect(),
            Err(e) => {
                error!("unable to list webhooks for event {}: {}", evt.unique_id, e);
                continue;
            }
        };
        let evt = Arc::new(evt);
        for hook in matching {
            let Ok(permit) = permits.clone().acquire_owned().await else {
                return;
            };
            let evt = evt.clone();
            let settings = settings.clone();
            let clients = clients.clone();
            tokio::spawn(async move {
                deliver_with_retry(&clients, &hook, &evt, &settings).await;
                drop(permit);
            });
        }
    }
    debug!("webhook dispatcher stopped");
}

async fn deliver_with_retry(
    clients: &Clients,
    hook: &Webhook,
    evt: &EventData,
    settings: &DispatcherSettings,
) {
    let mut attempt = 0;
    loop {
        let started = Instant::now();
        let result = deliver(clients, hook, evt, settings.timeout).await;
        metrics::webhook_call(started.elapsed(), result.is_err());
        match result {
            Ok(()) => return,
            Err(e) if attempt < settings.max_retries => {
                let backoff = BASE_BACKOFF * 2u32.saturating_pow(attempt);
                warn!(
                    "webhook {:?} failed for event {} (attempt {}): {}",
                    hook.name,
                    evt.unique_id,
                    attempt + 1,
                    e
                );
                tokio::time::sleep(backoff).await;
                attempt += 1;
            }
            Err(e) => {
                error!(
                    "error calling webhook {:?} for event {}: {}",
                    hook.name, evt.unique_id, e
                );
                return;
            }
        }
    }
}

async fn deliver(
    clients: &Clients,
    hook: &Webhook,
    evt: &EventData,
    timeout: Duration,
) -> anyhow::Result<()> {
    let method_name = if hook.method.is_empty() {
        "POST".to_string()
    } else {
        hook.method.to_uppercase()
    };
    let method = Method::from_bytes(method_name.as_bytes())?;

    let client = clients.for_hook(hook)?;
    let mut request = client.request(method.clone(), &hook.url).timeout(timeout);
    let mut has_user_agent = false;
    for (name, values) in &hook.headers {
        let name = HeaderName::from_bytes(name.as_bytes())?;
        has_user_agent |= name == USER_AGENT;
        for value in values {
            request = request.header(name.clone(), HeaderValue::from_str(value)?);
        }
    }
    if !has_user_agent {
        request = request.header(USER_AGENT, USER_AGENT_VALUE);
    }

    if !hook.body.is_empty() {
        request = request.body(render_body(&hook.body, evt));
    } else if method == Method::POST || method == Method::PUT || method == Method::PATCH {
        request = request
            .header(CONTENT_TYPE, "application/json")
            .body(serde_json::to_vec(evt)?);
    }

    let response = request.send().await?;
    let status = response.status().as_u16();
    if !(200..400).contains(&status) {
        let body = response.text().await.unwrap_or_default();
        anyhow::bail!("invalid status code calling hook: {}: {}", status, body);
    }
    Ok(())
}
