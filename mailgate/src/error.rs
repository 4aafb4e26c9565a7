//! Gateway error taxonomy and its HTTP mapping.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;
use tracing::error;

use crate::events::ParseError;
use crate::provider::ProviderError;
use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("API key required")]
    MissingApiKey,

    #[error("Invalid API key")]
    InvalidApiKey,

    #[error("Rate limit exceeded")]
    RateLimited,

    #[error("Invalid webhook signature")]
    InvalidSignature,

    #[error("{0}")]
    Validation(String),

    #[error("Failed to send email: {0}")]
    Provider(#[from] ProviderError),

    #[error("Invalid webhook payload")]
    Parse(#[from] ParseError),

    #[error("{0} not found")]
    NotFound(&'static str),

    #[error("storage error: {0}")]
    Store(#[from] StoreError),
}

impl GatewayError {
    pub fn validation(msg: impl Into<String>) -> Self {
        GatewayError::Validation(msg.into())
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayError::MissingApiKey
            | GatewayError::InvalidApiKey
            | GatewayError::InvalidSignature => StatusCode::UNAUTHORIZED,
            GatewayError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            GatewayError::Validation(_) | GatewayError::Parse(_) => StatusCode::BAD_REQUEST,
            GatewayError::Provider(_) => StatusCode::BAD_GATEWAY,
            GatewayError::NotFound(_) => StatusCode::NOT_FOUND,
            GatewayError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Error body returned by every endpoint.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            error!(error = %self, status = status.as_u16(), "request_failed");
        }

        let message = match &self {
            // Storage details stay in the logs.
            GatewayError::Store(_) => "Internal server error".to_string(),
            other => other.to_string(),
        };

        (status, Json(ErrorResponse { error: message })).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(GatewayError::MissingApiKey.status_code(), StatusCode::UNAUTHORIZED);
        assert_eq!(GatewayError::InvalidApiKey.status_code(), StatusCode::UNAUTHORIZED);
        assert_eq!(GatewayError::RateLimited.status_code(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(
            GatewayError::validation("bad").status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            GatewayError::Parse(ParseError::new("eof")).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            GatewayError::Provider(ProviderError::Rejected("nope".into())).status_code(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(GatewayError::NotFound("Email").status_code(), StatusCode::NOT_FOUND);
        assert_eq!(
            GatewayError::Store(StoreError::Backend("x".into())).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_error_display() {
        assert_eq!(GatewayError::RateLimited.to_string(), "Rate limit exceeded");
        assert_eq!(GatewayError::NotFound("Webhook").to_string(), "Webhook not found");
        assert_eq!(
            GatewayError::validation("Either html_body or plain_body is required").to_string(),
            "Either html_body or plain_body is required"
        );
    }
}
