use axum::body::Body;
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use axum::response::Response;
use bytes::Bytes;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::storage::models::{Service, ServiceInstance};

/// Instance sub-paths only reachable through dedicated endpoints, except for GET.
const RESERVED_INSTANCE_PATHS: &[&str] = &["", "bind", "bind-app", "unbind", "status"];

const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("invalid proxy path")]
    InvalidPath,

    #[error("proxy request {method} {path:?} is forbidden")]
    Forbidden { method: String, path: String },

    #[error("service {0:?} has no production endpoint")]
    NoEndpoint(String),

    #[error("invalid proxy url: {0}")]
    InvalidUrl(String),

    #[error("failed to reach service: {0}")]
    Transport(String),
}

/// The inbound request, as forwarded.
#[derive(Debug, Clone)]
pub struct ProxyRequest {
    pub method: Method,
    pub query: Vec<(String, String)>,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// Audit and tracing values attached to the forwarded request.
#[derive(Debug, Clone, Default)]
pub struct ProxyContext {
    pub user: Option<String>,
    pub event_id: Option<Uuid>,
    pub request_id: Option<(HeaderName, String)>,
}

/// Lexically normalize a path: always rooted, no `.`/`..`, no repeated slashes.
pub fn clean_path(path: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            s => parts.push(s),
        }
    }
    format!("/{}", parts.join("/"))
}

/// Path under the back end used for an instance proxy call.
pub fn instance_path(
    instance: &ServiceInstance,
    request_path: &str,
    method: &Method,
) -> Result<String, ProxyError> {
    let prefix = format!("/resources/{}", instance.identifier());
    let mut clean = clean_path(&format!("/{}", request_path));
    if clean == "/" {
        clean = prefix.clone();
    }

    let relative = if clean == prefix || clean.starts_with(&format!("{}/", prefix)) {
        clean[prefix.len()..].trim_matches('/').to_string()
    } else {
        if request_path.starts_with(&prefix) && clean != request_path {
            return Err(ProxyError::InvalidPath);
        }
        clean.trim_matches('/').to_string()
    };

    if *method != Method::GET && RESERVED_INSTANCE_PATHS.contains(&relative.as_str()) {
        return Err(ProxyError::Forbidden {
            method: method.to_string(),
            path: relative,
        });
    }
    Ok(format!("{}/{}", prefix, relative))
}

/// Query string forwarded upstream: routing and callback parameters removed.
pub fn forwarded_query(pairs: &[(String, String)]) -> String {
    let mut serializer = url::form_urlencoded::Serializer::new(String::new());
    let mut any = false;
    for (k, v) in pairs {
        if k == "callback" || k.starts_with(':') {
            continue;
        }
        serializer.append_pair(k, v);
        any = true;
    }
    if any {
        format!("?{}", serializer.finish())
    } else {
        String::new()
    }
}

fn is_hop_by_hop(name: &HeaderName) -> bool {
    HOP_BY_HOP.contains(&name.as_str())
}

/// Forwards calls to service back ends with the service's own credentials.
#[derive(Clone)]
pub struct ServiceProxy {
    client: reqwest::Client,
}

impl ServiceProxy {
    pub fn new(timeout: Duration) -> Result<Self, ProxyError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| ProxyError::Transport(e.to_string()))?;
        Ok(Self { client })
    }

    /// Service-level proxy: `callback` is taken relative to the endpoint root.
    pub async fn proxy_service(
        &self,
        service: &Service,
        callback: &str,
        request: ProxyRequest,
        ctx: &ProxyContext,
    ) -> Result<Response, ProxyError> {
        let path = clean_path(callback);
        if path == "/" {
            return Err(ProxyError::InvalidPath);
        }
        self.forward(service, &path, request, ctx).await
    }

    pub async fn proxy_instance(
        &self,
        service: &Service,
        instance: &ServiceInstance,
        request_path: &str,
        request: ProxyRequest,
        ctx: &ProxyContext,
    ) -> Result<Response, ProxyError> {
        let path = instance_path(instance, request_path, &request.method)?;
        self.forward(service, &path, request, ctx).await
    }

    async fn forward(
        &self,
        service: &Service,
        path: &str,
        request: ProxyRequest,
        ctx: &ProxyContext,
    ) -> Result<Response, ProxyError> {
        let endpoint = service
            .production_endpoint()
            .ok_or_else(|| ProxyError::NoEndpoint(service.name.clone()))?;
        let raw = format!(
            "{}/{}{}",
            endpoint.trim_end_matches('/'),
            path.trim_matches('/'),
            forwarded_query(&request.query)
        );
        let url = url::Url::parse(&raw).map_err(|e| ProxyError::InvalidUrl(format!("{}: {}", raw, e)))?;

        let mut headers = HeaderMap::new();
        for (name, value) in request.headers.iter() {
            if name == axum::http::header::AUTHORIZATION
                || name == axum::http::header::HOST
                || name == axum::http::header::CONTENT_LENGTH
                || is_hop_by_hop(name)
            {
                continue;
            }
            headers.append(name.clone(), value.clone());
        }
        if let Some(user) = &ctx.user {
            if let Ok(value) = HeaderValue::from_str(user) {
                headers.insert("X-Tsuru-User", value);
            }
        }
        if let Some(id) = ctx.event_id {
            if let Ok(value) = HeaderValue::from_str(&id.simple().to_string()) {
                headers.insert("X-Tsuru-Eventid", value);
            }
        }
        if let Some((name, id)) = &ctx.request_id {
            if let Ok(value) = HeaderValue::from_str(id) {
                headers.insert(name.clone(), value);
            }
        }

        debug!("proxying {} {} for service {}", request.method, url, service.name);
        let upstream = self
            .client
            .request(request.method, url)
            .headers(headers)
            .basic_auth(&service.username, Some(&service.password))
            .body(request.body)
            .send()
            .await
            .map_err(|e| ProxyError::Transport(e.to_string()))?;

        let status = StatusCode::from_u16(upstream.status().as_u16())
            .unwrap_or(StatusCode::BAD_GATEWAY);
        if status.is_server_error() {
            warn!("service {} answered proxy call with {}", service.name, status);
        }

        let mut response = Response::builder().status(status);
        if let Some(out) = response.headers_mut() {
            for (name, value) in upstream.headers() {
                if !is_hop_by_hop(name) && name != axum::http::header::CONTENT_LENGTH {
                    out.append(name.clone(), value.clone());
                }
            }
        }
        response
            .body(Body::from_stream(upstream.bytes_stream()))
            .map_err(|e| ProxyError::Transport(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instance() -> ServiceInstance {
        ServiceInstance {
            service_name: "mysql".into(),
            name: "db1".into(),
            ..Default::default()
        }
    }

    #[test]
    fn test_clean_path() {
        assert_eq!(clean_path("/a/./b//c/"), "/a/b/c");
        assert_eq!(clean_path("/a/../../b"), "/b");
        assert_eq!(clean_path(""), "/");
        assert_eq!(clean_path(".."), "/");
    }

    #[test]
    fn test_instance_path_rewrites_relative_callbacks() {
        let inst = instance();
        assert_eq!(
            instance_path(&inst, "/custom/action", &Method::POST).unwrap(),
            "/resources/db1/custom/action"
        );
        assert_eq!(
            instance_path(&inst, "/resources/db1/custom", &Method::PUT).unwrap(),
            "/resources/db1/custom"
        );
        assert_eq!(instance_path(&inst, "", &Method::GET).unwrap(), "/resources/db1/");
    }

    #[test]
    fn test_instance_path_rejects_traversal() {
        let inst = instance();
        assert!(matches!(
            instance_path(&inst, "/resources/db1/../../etc", &Method::GET),
            Err(ProxyError::InvalidPath)
        ));
    }

    #[test]
    fn test_instance_path_reserved_for_writes() {
        let inst = instance();
        for path in ["/bind-app", "/status", "/resources/db1/bind", "/"] {
            let err = instance_path(&inst, path, &Method::POST).unwrap_err();
            assert!(matches!(err, ProxyError::Forbidden { .. }), "{path}");
        }
        assert!(instance_path(&inst, "/status", &Method::GET).is_ok());
        assert_eq!(
            instance_path(&inst, "/bind-app", &Method::DELETE)
                .unwrap_err()
                .to_string(),
            "proxy request DELETE \"bind-app\" is forbidden"
        );
    }

    #[test]
    fn test_forwarded_query_drops_internal_params() {
        let pairs = vec![
            ("callback".to_string(), "/x".to_string()),
            (":service".to_string(), "foo".to_string()),
            ("a".to_string(), "1 2".to_string()),
        ];
        assert_eq!(forwarded_query(&pairs), "?a=1+2");
        assert_eq!(forwarded_query(&pairs[..2]), "");
    }
}
