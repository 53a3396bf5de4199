use axum::{
    async_trait,
    extract::{ConnectInfo, FromRequestParts, Request, State},
    http::{header::AUTHORIZATION, request::Parts},
    middleware::Next,
    response::Response,
};
use std::net::SocketAddr;
use tracing::debug;

use super::request_id::RequestId;
use crate::auth::Token;
use crate::error::ApiError;
use crate::state::AppState;

/// Resolve the `Authorization` header into a [`Token`] request extension.
///
/// An invalid or unknown token is ignored here; handlers that need an
/// identity reject the request through [`AuthToken`].
pub async fn token_middleware(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Response {
    let header = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    if let Some(header) = header {
        match state.auth.resolve(&header).await {
            Ok(token) => {
                request.extensions_mut().insert(token);
            }
            Err(e) => debug!("ignoring authorization header: {}", e),
        }
    }

    next.run(request).await
}

/// Identity of an authenticated request. Rejects with 401 when absent.
#[derive(Debug, Clone)]
pub struct AuthToken(pub Token);

#[async_trait]
impl<S> FromRequestParts<S> for AuthToken
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<Token>()
            .cloned()
            .map(AuthToken)
            .ok_or_else(|| ApiError::unauthorized("You must provide a valid Authorization header"))
    }
}

/// Identity of the request when one was presented.
#[derive(Debug, Clone)]
pub struct MaybeToken(pub Option<Token>);

#[async_trait]
impl<S> FromRequestParts<S> for MaybeToken
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(MaybeToken(parts.extensions.get::<Token>().cloned()))
    }
}

/// Source address of the request: the first `X-Forwarded-For` hop, else the peer.
#[derive(Debug, Clone, Default)]
pub struct ClientAddr(pub Option<String>);

#[async_trait]
impl<S> FromRequestParts<S> for ClientAddr
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let addr = parts
            .headers
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .or_else(|| {
                parts
                    .extensions
                    .get::<ConnectInfo<SocketAddr>>()
                    .map(|ConnectInfo(addr)| addr.ip().to_string())
            });
        Ok(ClientAddr(addr))
    }
}

/// Authenticated identity plus the request metadata recorded on events.
#[derive(Debug, Clone)]
pub struct Caller {
    pub token: Token,
    pub remote_addr: Option<String>,
    pub request_id: Option<(String, String)>,
}

#[async_trait]
impl<S> FromRequestParts<S> for Caller
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let AuthToken(token) = AuthToken::from_request_parts(parts, state).await?;
        let ClientAddr(remote_addr) = ClientAddr::from_request_parts(parts, state).await?;
        let request_id = parts
            .extensions
            .get::<RequestId>()
            .map(|r| (r.header.clone(), r.value.clone()));
        Ok(Caller {
            token,
            remote_addr,
            request_id,
        })
    }
}
