//! Postal HTTP API client.
//!
//! Every call is a JSON `POST` authenticated with the server-level
//! `X-Server-API-Key` header. Postal signals application errors with a 2xx
//! response whose `status` is not `"success"`.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{info, warn};

use super::{MailProvider, OutboundEmail, ProviderError, ProviderMessage, SubmitReceipt};

const SEND_MESSAGE_PATH: &str = "/api/v1/send/message";
const GET_MESSAGE_PATH: &str = "/api/v1/messages/message";

/// Response envelope shared by all Postal endpoints.
#[derive(Debug, Deserialize)]
struct Envelope {
    status: String,
    #[serde(default)]
    data: Value,
    #[serde(default)]
    messages: Vec<String>,
}

impl Envelope {
    fn is_success(&self) -> bool {
        self.status == "success"
    }

    fn into_rejection(self) -> ProviderError {
        let detail = self
            .data
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string)
            .or_else(|| (!self.messages.is_empty()).then(|| self.messages.join("; ")))
            .unwrap_or(self.status);
        ProviderError::Rejected(detail)
    }
}

#[derive(Debug, Deserialize)]
struct SendData {
    #[serde(default)]
    message_id: String,
    #[serde(default)]
    messages: BTreeMap<String, RecipientInfo>,
}

#[derive(Debug, Deserialize)]
struct RecipientInfo {
    id: Value,
}

fn id_to_string(id: &Value) -> Option<String> {
    match id {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Postal API client. Cheap to clone; the underlying connection pool is shared.
#[derive(Clone)]
pub struct PostalClient {
    base_url: String,
    api_key: String,
    client: Client,
}

impl PostalClient {
    /// Build a client whose every request is bounded by `timeout`.
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, ProviderError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            client,
        })
    }

    async fn do_request(&self, path: &str, body: &Value) -> Result<Envelope, ProviderError> {
        let url = format!("{}{}", self.base_url, path);

        let response = self
            .client
            .post(&url)
            .header("X-Server-API-Key", &self.api_key)
            .json(body)
            .send()
            .await?;

        let status = response.status();
        let text = response.text().await?;

        if status.as_u16() >= 400 {
            warn!(
                path = path,
                status_code = status.as_u16(),
                body_length = text.len(),
                "postal_request_failed"
            );
            return Err(ProviderError::Status {
                status: status.as_u16(),
                body: text,
            });
        }

        serde_json::from_str(&text).map_err(|e| ProviderError::Decode(e.to_string()))
    }
}

#[async_trait]
impl MailProvider for PostalClient {
    async fn send_email(&self, email: &OutboundEmail) -> Result<SubmitReceipt, ProviderError> {
        let body = serde_json::to_value(email).map_err(|e| ProviderError::Decode(e.to_string()))?;
        let envelope = self.do_request(SEND_MESSAGE_PATH, &body).await?;

        if !envelope.is_success() {
            return Err(envelope.into_rejection());
        }

        let data: SendData =
            serde_json::from_value(envelope.data).map_err(|e| ProviderError::Decode(e.to_string()))?;

        let recipients = data
            .messages
            .iter()
            .filter_map(|(addr, info)| id_to_string(&info.id).map(|id| (addr.clone(), id)))
            .collect();

        info!(
            provider_message_id = %data.message_id,
            recipients = email.to.len(),
            "postal_message_accepted"
        );

        Ok(SubmitReceipt {
            provider_message_id: data.message_id,
            recipients,
        })
    }

    async fn get_message(&self, provider_message_id: &str) -> Result<ProviderMessage, ProviderError> {
        let envelope = self
            .do_request(GET_MESSAGE_PATH, &json!({ "id": provider_message_id }))
            .await?;

        if !envelope.is_success() {
            return Err(envelope.into_rejection());
        }

        serde_json::from_value(envelope.data).map_err(|e| ProviderError::Decode(e.to_string()))
    }
}
