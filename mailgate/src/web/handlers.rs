//! Endpoint handlers.
//!
//! Handlers only translate between HTTP and [`Gateway`] calls. Errors are
//! rendered by [`GatewayError`]'s `IntoResponse`.

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{
        rejection::{JsonRejection, PathRejection},
        Path, Query, State,
    },
    http::{HeaderMap, StatusCode},
    Extension, Json,
};
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::credentials::Credential;
use crate::error::GatewayError;
use crate::gateway::{Gateway, MessageView};
use crate::model::{ApiKey, MessageStatus, WebhookSubscription};
use crate::sender::{SendReceipt, SendRequest};
use crate::store::{MessagePage, MessageQuery};
use crate::subscriptions::{CreateSubscription, CreatedSubscription};

/// Header carrying the inbound provider webhook signature.
pub const POSTAL_SIGNATURE_HEADER: &str = "X-Postal-Signature";

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub gateway: Arc<Gateway>,
    /// Quota for keys created without an explicit one.
    pub default_rate_limit: u32,
}

impl AppState {
    pub fn new(gateway: Gateway, default_rate_limit: u32) -> Self {
        Self {
            gateway: Arc::new(gateway),
            default_rate_limit,
        }
    }
}

fn json_body<T>(payload: Result<Json<T>, JsonRejection>) -> Result<T, GatewayError> {
    payload
        .map(|Json(body)| body)
        .map_err(|rejection| GatewayError::validation(rejection.body_text()))
}

fn path_id(id: Result<Path<Uuid>, PathRejection>) -> Result<Uuid, GatewayError> {
    id.map(|Path(id)| id)
        .map_err(|rejection| GatewayError::validation(rejection.body_text()))
}

// =============================================================================
// Health Check
// =============================================================================

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
}

pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

// =============================================================================
// Send
// =============================================================================

pub async fn send_email(
    State(state): State<AppState>,
    Extension(credential): Extension<Credential>,
    payload: Result<Json<SendRequest>, JsonRejection>,
) -> Result<Json<SendReceipt>, GatewayError> {
    let request = json_body(payload)?;
    let receipt = state.gateway.send(&credential, &request).await?;
    Ok(Json(receipt))
}

// =============================================================================
// Postal Webhook
// =============================================================================

#[derive(Debug, Serialize, Deserialize)]
pub struct WebhookResponse {
    pub message: String,
}

/// Postal event callback.
///
/// Well-formed events always get a 200 so Postal does not retry them,
/// including events for messages this gateway never sent.
pub async fn postal_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<WebhookResponse>, GatewayError> {
    let signature = headers
        .get(POSTAL_SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok());

    let outcome = state.gateway.ingest_provider_event(&body, signature).await?;
    info!(
        body_length = body.len(),
        outcome = outcome.message(),
        "postal_webhook_handled"
    );

    Ok(Json(WebhookResponse {
        message: outcome.message().to_string(),
    }))
}

// =============================================================================
// Messages
// =============================================================================

#[derive(Debug, Default, Deserialize)]
pub struct ListMessagesParams {
    pub status: Option<String>,
    pub recipient: Option<String>,
    pub page: Option<u32>,
    pub limit: Option<u32>,
}

impl ListMessagesParams {
    fn into_query(self) -> Result<MessageQuery, GatewayError> {
        let status = match self.status.as_deref().filter(|s| !s.is_empty()) {
            Some(name) => Some(
                MessageStatus::parse(name)
                    .ok_or_else(|| GatewayError::validation(format!("unknown status: {}", name)))?,
            ),
            None => None,
        };
        Ok(MessageQuery {
            status,
            recipient: self.recipient,
            page: self.page,
            limit: self.limit,
        })
    }
}

pub async fn list_messages(
    State(state): State<AppState>,
    Extension(credential): Extension<Credential>,
    Query(params): Query<ListMessagesParams>,
) -> Result<Json<MessagePage>, GatewayError> {
    let query = params.into_query()?;
    Ok(Json(state.gateway.list_messages(&credential, &query).await?))
}

pub async fn get_message(
    State(state): State<AppState>,
    Extension(credential): Extension<Credential>,
    id: Result<Path<Uuid>, PathRejection>,
) -> Result<Json<MessageView>, GatewayError> {
    let id = path_id(id)?;
    Ok(Json(state.gateway.message_details(&credential, id).await?))
}

// =============================================================================
// Webhook Subscriptions
// =============================================================================

pub async fn list_webhooks(
    State(state): State<AppState>,
    Extension(credential): Extension<Credential>,
) -> Result<Json<Vec<WebhookSubscription>>, GatewayError> {
    Ok(Json(
        state
            .gateway
            .subscriptions()
            .list(credential.tenant_id)
            .await?,
    ))
}

pub async fn create_webhook(
    State(state): State<AppState>,
    Extension(credential): Extension<Credential>,
    payload: Result<Json<CreateSubscription>, JsonRejection>,
) -> Result<(StatusCode, Json<CreatedSubscription>), GatewayError> {
    let request = json_body(payload)?;
    let created = state
        .gateway
        .subscriptions()
        .create(credential.tenant_id, &request)
        .await?;
    Ok((StatusCode::CREATED, Json(created)))
}

pub async fn delete_webhook(
    State(state): State<AppState>,
    Extension(credential): Extension<Credential>,
    id: Result<Path<Uuid>, PathRejection>,
) -> Result<Json<WebhookResponse>, GatewayError> {
    let id = path_id(id)?;
    state
        .gateway
        .subscriptions()
        .delete(credential.tenant_id, id)
        .await?;
    Ok(Json(WebhookResponse {
        message: "Webhook deleted".to_string(),
    }))
}

// =============================================================================
// API Keys
// =============================================================================

#[derive(Debug, Default, Deserialize)]
pub struct CreateApiKeyRequest {
    #[serde(default)]
    pub name: String,
    pub rate_limit: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
pub struct UpdateApiKeyRequest {
    pub name: Option<String>,
    pub rate_limit: Option<u32>,
}

/// The raw key is only ever returned here.
#[derive(Debug, Serialize)]
pub struct CreatedApiKey {
    #[serde(flatten)]
    pub api_key: ApiKey,
    pub key: String,
}

pub async fn list_api_keys(
    State(state): State<AppState>,
    Extension(credential): Extension<Credential>,
) -> Result<Json<Vec<ApiKey>>, GatewayError> {
    Ok(Json(
        state
            .gateway
            .credentials()
            .list(credential.tenant_id)
            .await?,
    ))
}

pub async fn create_api_key(
    State(state): State<AppState>,
    Extension(credential): Extension<Credential>,
    payload: Result<Json<CreateApiKeyRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<CreatedApiKey>), GatewayError> {
    let request = json_body(payload)?;
    let (api_key, key) = state
        .gateway
        .credentials()
        .create(
            credential.tenant_id,
            &request.name,
            request.rate_limit.unwrap_or(state.default_rate_limit),
        )
        .await?;
    Ok((StatusCode::CREATED, Json(CreatedApiKey { api_key, key })))
}

pub async fn update_api_key(
    State(state): State<AppState>,
    Extension(credential): Extension<Credential>,
    id: Result<Path<Uuid>, PathRejection>,
    payload: Result<Json<UpdateApiKeyRequest>, JsonRejection>,
) -> Result<Json<ApiKey>, GatewayError> {
    let id = path_id(id)?;
    let request = json_body(payload)?;
    let updated = state
        .gateway
        .credentials()
        .update(
            credential.tenant_id,
            id,
            request.name.as_deref(),
            request.rate_limit,
        )
        .await?;
    Ok(Json(updated))
}

pub async fn revoke_api_key(
    State(state): State<AppState>,
    Extension(credential): Extension<Credential>,
    id: Result<Path<Uuid>, PathRejection>,
) -> Result<Json<WebhookResponse>, GatewayError> {
    let id = path_id(id)?;
    state
        .gateway
        .credentials()
        .revoke(credential.tenant_id, id)
        .await?;
    Ok(Json(WebhookResponse {
        message: "API key revoked".to_string(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_list_params_parse_status() {
        let params = ListMessagesParams {
            status: Some("Delivered".to_string()),
            ..Default::default()
        };
        assert_eq!(params.into_query().unwrap().status, Some(MessageStatus::Delivered));

        let params = ListMessagesParams {
            status: Some("lost".to_string()),
            ..Default::default()
        };
        assert!(matches!(params.into_query(), Err(GatewayError::Validation(_))));

        let params = ListMessagesParams {
            status: Some(String::new()),
            ..Default::default()
        };
        assert_eq!(params.into_query().unwrap().status, None);
    }
}
