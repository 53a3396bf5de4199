use axum::{
    extract::Request,
    http::{HeaderName, HeaderValue},
    middleware::Next,
    response::Response,
};

/// Client versions this API speaks to.
pub const SUPPORTED_VERSIONS: [(&str, &str); 3] = [
    ("supported-tsuru", "1.0.1"),
    ("supported-crane", "1.0.0"),
    ("supported-tsuru-admin", "1.0.0"),
];

pub async fn version_headers_middleware(request: Request, next: Next) -> Response {
    let mut response = next.run(request).await;
    let headers = response.headers_mut();
    for (name, version) in SUPPORTED_VERSIONS {
        headers.insert(
            HeaderName::from_static(name),
            HeaderValue::from_static(version),
        );
    }
    response
}
