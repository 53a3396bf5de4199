use async_trait::async_trait;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use reqwest::{Method, StatusCode};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use tracing::debug;
use uuid::Uuid;

use super::ServiceError;
use crate::metrics;
use crate::storage::models::{Service, ServiceInstance};

/// Caller identity forwarded to service back ends.
#[derive(Debug, Clone, Default)]
pub struct RequestMeta {
    pub user: String,
    pub event_id: Option<Uuid>,
    pub request_id: Option<(String, String)>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServicePlan {
    pub name: String,
    #[serde(default)]
    pub description: String,
}

/// Client for the REST API every service back end implements.
#[async_trait]
pub trait ServiceBackend: Send + Sync {
    async fn create(
        &self,
        service: &Service,
        instance: &ServiceInstance,
        meta: &RequestMeta,
    ) -> Result<(), ServiceError>;

    async fn update(
        &self,
        service: &Service,
        instance: &ServiceInstance,
        meta: &RequestMeta,
    ) -> Result<(), ServiceError>;

    async fn destroy(
        &self,
        service: &Service,
        instance: &ServiceInstance,
        meta: &RequestMeta,
    ) -> Result<(), ServiceError>;

    /// Bind an app and return the environment variables it should receive.
    async fn bind_app(
        &self,
        service: &Service,
        instance: &ServiceInstance,
        app: &str,
        meta: &RequestMeta,
    ) -> Result<BTreeMap<String, String>, ServiceError>;

    async fn unbind_app(
        &self,
        service: &Service,
        instance: &ServiceInstance,
        app: &str,
        meta: &RequestMeta,
    ) -> Result<(), ServiceError>;

    async fn bind_job(
        &self,
        service: &Service,
        instance: &ServiceInstance,
        job: &str,
        meta: &RequestMeta,
    ) -> Result<BTreeMap<String, String>, ServiceError>;

    async fn unbind_job(
        &self,
        service: &Service,
        instance: &ServiceInstance,
        job: &str,
        meta: &RequestMeta,
    ) -> Result<(), ServiceError>;

    async fn status(
        &self,
        service: &Service,
        instance: &ServiceInstance,
        meta: &RequestMeta,
    ) -> Result<String, ServiceError>;

    async fn plans(&self, service: &Service, meta: &RequestMeta)
        -> Result<Vec<ServicePlan>, ServiceError>;
}

/// Form-encoded HTTP client authenticated with the service's credentials.
#[derive(Clone)]
pub struct HttpServiceBackend {
    client: reqwest::Client,
}

impl HttpServiceBackend {
    pub fn new(timeout: Duration) -> Result<Self, ServiceError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }

    fn url(service: &Service, path: &str) -> Result<String, ServiceError> {
        let endpoint = service.production_endpoint().ok_or_else(|| {
            ServiceError::Validation(format!("service {:?} has no production endpoint", service.name))
        })?;
        Ok(format!(
            "{}/{}",
            endpoint.trim_end_matches('/'),
            path.trim_matches('/')
        ))
    }

    async fn issue(
        &self,
        service: &Service,
        method: Method,
        path: &str,
        params: &[(String, String)],
        meta: &RequestMeta,
    ) -> Result<reqwest::Response, ServiceError> {
        let url = Self::url(service, path)?;
        let encoded = url::form_urlencoded::Serializer::new(String::new())
            .extend_pairs(params)
            .finish();
        debug!("{} {} on service {}", method, url, service.name);

        let mut request = if method == Method::GET {
            let url = if encoded.is_empty() {
                url
            } else {
                format!("{}?{}", url, encoded)
            };
            self.client.request(method, url)
        } else {
            self.client
                .request(method, url)
                .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
                .body(encoded)
        };
        request = request
            .header(ACCEPT, "application/json")
            .basic_auth(&service.username, Some(&service.password));
        if !meta.user.is_empty() {
            request = request.header("X-Tsuru-User", &meta.user);
        }
        if let Some(id) = meta.event_id {
            request = request.header("X-Tsuru-Eventid", id.simple().to_string());
        }
        if let Some((name, value)) = &meta.request_id {
            request = request.header(name.as_str(), value.as_str());
        }
        let started = Instant::now();
        let result = request.send().await;
        metrics::service_request(&service.name, started.elapsed(), result.is_err());
        Ok(result?)
    }

    async fn error_from(response: reqwest::Response) -> ServiceError {
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        ServiceError::Upstream {
            status,
            message: format!("invalid response: {} (code: {})", body.trim(), status),
        }
    }

    fn instance_params(instance: &ServiceInstance, meta: &RequestMeta) -> Vec<(String, String)> {
        let mut params = vec![
            ("name".to_string(), instance.name.clone()),
            ("user".to_string(), meta.user.clone()),
            ("team".to_string(), instance.team_owner.clone()),
            ("description".to_string(), instance.description.clone()),
        ];
        if !instance.plan_name.is_empty() {
            params.push(("plan".to_string(), instance.plan_name.clone()));
        }
        if !instance.pool.is_empty() {
            params.push(("pool".to_string(), instance.pool.clone()));
        }
        for tag in &instance.tags {
            params.push(("tag".to_string(), tag.clone()));
        }
        for (k, v) in &instance.parameters {
            params.push((format!("parameters.{}", k), v.clone()));
        }
        params
    }

    async fn bind(
        &self,
        service: &Service,
        instance: &ServiceInstance,
        param: &str,
        consumer: &str,
        meta: &RequestMeta,
    ) -> Result<BTreeMap<String, String>, ServiceError> {
        let path = format!("/resources/{}/bind-app", instance.identifier());
        let params = vec![(param.to_string(), consumer.to_string())];
        let response = self.issue(service, Method::POST, &path, &params, meta).await?;
        match response.status() {
            s if s.is_success() => {
                let body = response.bytes().await?;
                if body.iter().all(u8::is_ascii_whitespace) {
                    return Ok(BTreeMap::new());
                }
                serde_json::from_slice(&body).map_err(|e| {
                    ServiceError::Validation(format!("invalid bind response from service: {}", e))
                })
            }
            StatusCode::NOT_FOUND => Err(ServiceError::NotFound(
                "Instance not found in the service back end".to_string(),
            )),
            StatusCode::PRECONDITION_FAILED => Err(ServiceError::Precondition(
                "You cannot bind any app to this service instance because it is not ready yet."
                    .to_string(),
            )),
            _ => Err(Self::error_from(response).await),
        }
    }

    async fn unbind(
        &self,
        service: &Service,
        instance: &ServiceInstance,
        param: &str,
        consumer: &str,
        meta: &RequestMeta,
    ) -> Result<(), ServiceError> {
        let path = format!("/resources/{}/bind-app", instance.identifier());
        let params = vec![(param.to_string(), consumer.to_string())];
        let response = self.issue(service, Method::DELETE, &path, &params, meta).await?;
        match response.status() {
            s if s.is_success() => Ok(()),
            StatusCode::NOT_FOUND => Err(ServiceError::NotFound(
                "Instance not found in the service back end".to_string(),
            )),
            _ => Err(Self::error_from(response).await),
        }
    }
}

#[async_trait]
impl ServiceBackend for HttpServiceBackend {
    async fn create(
        &self,
        service: &Service,
        instance: &ServiceInstance,
        meta: &RequestMeta,
    ) -> Result<(), ServiceError> {
        let params = Self::instance_params(instance, meta);
        let response = self
            .issue(service, Method::POST, "/resources", &params, meta)
            .await?;
        match response.status() {
            s if s.is_success() => Ok(()),
            StatusCode::CONFLICT => Err(ServiceError::Conflict(
                "Instance name already exists in the service back end.".to_string(),
            )),
            _ => Err(Self::error_from(response).await),
        }
    }

    async fn update(
        &self,
        service: &Service,
        instance: &ServiceInstance,
        meta: &RequestMeta,
    ) -> Result<(), ServiceError> {
        let path = format!("/resources/{}", instance.identifier());
        let params = Self::instance_params(instance, meta);
        let response = self.issue(service, Method::PUT, &path, &params, meta).await?;
        match response.status() {
            s if s.is_success() => Ok(()),
            StatusCode::NOT_FOUND => Err(ServiceError::NotFound(
                "Instance not found in the service back end".to_string(),
            )),
            _ => Err(Self::error_from(response).await),
        }
    }

    async fn destroy(
        &self,
        service: &Service,
        instance: &ServiceInstance,
        meta: &RequestMeta,
    ) -> Result<(), ServiceError> {
        let path = format!("/resources/{}", instance.identifier());
        let response = self.issue(service, Method::DELETE, &path, &[], meta).await?;
        match response.status() {
            s if s.is_success() => Ok(()),
            StatusCode::NOT_FOUND => Err(ServiceError::NotFound(
                "Instance not found in the service back end".to_string(),
            )),
            _ => Err(Self::error_from(response).await),
        }
    }

    async fn bind_app(
        &self,
        service: &Service,
        instance: &ServiceInstance,
        app: &str,
        meta: &RequestMeta,
    ) -> Result<BTreeMap<String, String>, ServiceError> {
        self.bind(service, instance, "app-name", app, meta).await
    }

    async fn unbind_app(
        &self,
        service: &Service,
        instance: &ServiceInstance,
        app: &str,
        meta: &RequestMeta,
    ) -> Result<(), ServiceError> {
        self.unbind(service, instance, "app-name", app, meta).await
    }

    async fn bind_job(
        &self,
        service: &Service,
        instance: &ServiceInstance,
        job: &str,
        meta: &RequestMeta,
    ) -> Result<BTreeMap<String, String>, ServiceError> {
        self.bind(service, instance, "job-name", job, meta).await
    }

    async fn unbind_job(
        &self,
        service: &Service,
        instance: &ServiceInstance,
        job: &str,
        meta: &RequestMeta,
    ) -> Result<(), ServiceError> {
        self.unbind(service, instance, "job-name", job, meta).await
    }

    async fn status(
        &self,
        service: &Service,
        instance: &ServiceInstance,
        meta: &RequestMeta,
    ) -> Result<String, ServiceError> {
        let path = format!("/resources/{}/status", instance.identifier());
        let response = self.issue(service, Method::GET, &path, &[], meta).await?;
        match response.status() {
            StatusCode::OK => Ok(response.text().await?),
            StatusCode::ACCEPTED => Ok("pending".to_string()),
            StatusCode::NO_CONTENT => Ok("up".to_string()),
            _ => Err(Self::error_from(response).await),
        }
    }

    async fn plans(
        &self,
        service: &Service,
        meta: &RequestMeta,
    ) -> Result<Vec<ServicePlan>, ServiceError> {
        let response = self
            .issue(service, Method::GET, "/resources/plans", &[], meta)
            .await?;
        if !response.status().is_success() {
            return Err(Self::error_from(response).await);
        }
        Ok(response.json().await?)
    }
}

/// Back end kept in process; records calls and answers from a table of plans.
#[derive(Default)]
pub struct MemoryServiceBackend {
    calls: parking_lot::Mutex<Vec<String>>,
    plans: Vec<ServicePlan>,
    envs: BTreeMap<String, String>,
}

impl MemoryServiceBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_plans(mut self, plans: Vec<ServicePlan>) -> Self {
        self.plans = plans;
        self
    }

    /// Environment returned by every bind.
    pub fn with_envs(mut self, envs: BTreeMap<String, String>) -> Self {
        self.envs = envs;
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    fn record(&self, call: String) {
        self.calls.lock().push(call);
    }
}

#[async_trait]
impl ServiceBackend for MemoryServiceBackend {
    async fn create(
        &self,
        service: &Service,
        instance: &ServiceInstance,
        _meta: &RequestMeta,
    ) -> Result<(), ServiceError> {
        self.record(format!("create {}/{}", service.name, instance.name));
        Ok(())
    }

    async fn update(
        &self,
        service: &Service,
        instance: &ServiceInstance,
        _meta: &RequestMeta,
    ) -> Result<(), ServiceError> {
        self.record(format!("update {}/{}", service.name, instance.name));
        Ok(())
    }

    async fn destroy(
        &self,
        service: &Service,
        instance: &ServiceInstance,
        _meta: &RequestMeta,
    ) -> Result<(), ServiceError> {
        self.record(format!("destroy {}/{}", service.name, instance.name));
        Ok(())
    }

    async fn bind_app(
        &self,
        service: &Service,
        instance: &ServiceInstance,
        app: &str,
        _meta: &RequestMeta,
    ) -> Result<BTreeMap<String, String>, ServiceError> {
        self.record(format!("bind-app {}/{} {}", service.name, instance.name, app));
        Ok(self.envs.clone())
    }

    async fn unbind_app(
        &self,
        service: &Service,
        instance: &ServiceInstance,
        app: &str,
        _meta: &RequestMeta,
    ) -> Result<(), ServiceError> {
        self.record(format!("unbind-app {}/{} {}", service.name, instance.name, app));
        Ok(())
    }

    async fn bind_job(
        &self,
        service: &Service,
        instance: &ServiceInstance,
        job: &str,
        _meta: &RequestMeta,
    ) -> Result<BTreeMap<String, String>, ServiceError> {
        self.record(format!("bind-job {}/{} {}", service.name, instance.name, job));
        Ok(self.envs.clone())
    }

    async fn unbind_job(
        &self,
        service: &Service,
        instance: &ServiceInstance,
        job: &str,
        _meta: &RequestMeta,
    ) -> Result<(), ServiceError> {
        self.record(format!("unbind-job {}/{} {}", service.name, instance.name, job));
        Ok(())
    }

    async fn status(
        &self,
        _service: &Service,
        _instance: &ServiceInstance,
        _meta: &RequestMeta,
    ) -> Result<String, ServiceError> {
        Ok("up".to_string())
    }

    async fn plans(
        &self,
        _service: &Service,
        _meta: &RequestMeta,
    ) -> Result<Vec<ServicePlan>, ServiceError> {
        Ok(self.plans.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_joins_endpoint_and_path() {
        let mut service = Service {
            name: "mysql".into(),
            ..Default::default()
        };
        assert!(HttpServiceBackend::url(&service, "/resources").is_err());
        service
            .endpoints
            .insert("production".into(), "http://mysql.example.com/".into());
        assert_eq!(
            HttpServiceBackend::url(&service, "/resources/db1/").unwrap(),
            "http://mysql.example.com/resources/db1"
        );
    }

    #[test]
    fn test_instance_params_include_tags_and_parameters() {
        let mut instance = ServiceInstance {
            name: "db1".into(),
            team_owner: "acme".into(),
            tags: vec!["a".into(), "b".into()],
            ..Default::default()
        };
        instance.parameters.insert("size".into(), "large".into());
        let meta = RequestMeta {
            user: "me@example.com".into(),
            ..Default::default()
        };
        let params = HttpServiceBackend::instance_params(&instance, &meta);
        assert!(params.contains(&("tag".to_string(), "b".to_string())));
        assert!(params.contains(&("parameters.size".to_string(), "large".to_string())));
        assert!(params.contains(&("user".to_string(), "me@example.com".to_string())));
    }
}
