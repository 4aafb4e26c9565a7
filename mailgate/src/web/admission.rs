//! API-key middleware.
//!
//! Every `/api` route is authenticated. Only sends are charged against the
//! key's hourly quota.

use axum::{
    extract::{Request, State},
    middleware::Next,
    response::Response,
};

use super::handlers::AppState;
use crate::error::GatewayError;

pub const API_KEY_HEADER: &str = "X-API-Key";

fn raw_key(request: &Request) -> Option<String> {
    request
        .headers()
        .get(API_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

/// Authenticate the caller and hand the resolved
/// [`Credential`](crate::credentials::Credential) to the handler through
/// request extensions.
pub async fn require_api_key(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response, GatewayError> {
    let credential = state.gateway.authenticate(raw_key(&request).as_deref()).await?;
    request.extensions_mut().insert(credential);

    Ok(next.run(request).await)
}

/// Like [`require_api_key`], and also charges one request to the key's quota.
pub async fn require_send_quota(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response, GatewayError> {
    let credential = state.gateway.admit(raw_key(&request).as_deref()).await?;
    request.extensions_mut().insert(credential);

    Ok(next.run(request).await)
}
