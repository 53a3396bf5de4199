use axum::{
    extract::{Request, State},
    http::{HeaderName, HeaderValue},
    middleware::Next,
    response::Response,
};
use uuid::Uuid;

use crate::state::AppState;

/// Request id and the header it travels in.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestId {
    pub header: String,
    pub value: String,
}

/// Tag every request with an id under the configured header, minting one
/// when the client sent none, and echo it on the response.
pub async fn request_id_middleware(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Response {
    let Some(name) = state.config.api.request_id_header.clone() else {
        return next.run(request).await;
    };
    let Ok(header) = HeaderName::from_bytes(name.as_bytes()) else {
        return next.run(request).await;
    };

    let value = match request.headers().get(&header).and_then(|v| v.to_str().ok()) {
        Some(v) if !v.is_empty() => v.to_string(),
        _ => Uuid::new_v4().to_string(),
    };
    if let Ok(header_value) = HeaderValue::from_str(&value) {
        request.headers_mut().insert(header.clone(), header_value.clone());
        request.extensions_mut().insert(RequestId {
            header: name,
            value,
        });
        let mut response = next.run(request).await;
        response.headers_mut().insert(header, header_value);
        return response;
    }
    next.run(request).await
}
