//! Outbound mail provider seam.
//!
//! The gateway talks to its mail transfer provider only through
//! [`MailProvider`]. [`PostalClient`] is the production implementation.

pub mod postal;

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use postal::PostalClient;

#[derive(Debug, Error)]
pub enum ProviderError {
    /// Transport failure (connect, timeout, TLS).
    #[error("failed to execute request: {0}")]
    Http(#[from] reqwest::Error),

    /// The provider answered with an HTTP error status.
    #[error("provider returned status {status}: {body}")]
    Status { status: u16, body: String },

    /// The provider answered 2xx but refused the request.
    #[error("provider API error: {0}")]
    Rejected(String),

    /// The response body could not be decoded.
    #[error("failed to decode response: {0}")]
    Decode(String),
}

/// An email as submitted to the provider. Empty optional parts are omitted
/// from the wire payload.
#[derive(Debug, Clone, Default, Serialize)]
pub struct OutboundEmail {
    pub to: Vec<String>,
    pub from: String,
    pub subject: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub html_body: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plain_body: Option<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
}

/// Provider acknowledgement of an accepted send.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubmitReceipt {
    pub provider_message_id: String,
    /// Per-recipient provider ids, keyed by recipient address.
    pub recipients: BTreeMap<String, String>,
}

impl SubmitReceipt {
    /// The provider's id for one recipient, matched case-insensitively.
    pub fn recipient_id(&self, address: &str) -> Option<&str> {
        self.recipients
            .iter()
            .find(|(addr, _)| addr.eq_ignore_ascii_case(address))
            .map(|(_, id)| id.as_str())
    }
}

/// Provider-side view of a message.
///
/// Postal reports `status` either as a bare string or as an object with a
/// `status` field, depending on the expansions requested.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProviderMessage {
    #[serde(default)]
    pub id: Option<serde_json::Value>,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub status: Option<serde_json::Value>,
}

impl ProviderMessage {
    pub fn status_name(&self) -> Option<&str> {
        match self.status.as_ref()? {
            serde_json::Value::String(s) => Some(s.as_str()),
            serde_json::Value::Object(map) => map.get("status").and_then(|v| v.as_str()),
            _ => None,
        }
    }
}

#[async_trait]
pub trait MailProvider: Send + Sync {
    async fn send_email(&self, email: &OutboundEmail) -> Result<SubmitReceipt, ProviderError>;

    async fn get_message(&self, provider_message_id: &str) -> Result<ProviderMessage, ProviderError>;
}
