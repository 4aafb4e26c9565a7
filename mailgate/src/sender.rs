//! Outbound send path.
//!
//! A validated request is submitted to the provider once. Each recipient then
//! gets its own [`Message`] row, all sharing one client message id. Row
//! persistence is best-effort: a storage failure is logged and the send still
//! reports success, because the provider has already accepted it.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use lettre::Address;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::error::GatewayError;
use crate::model::{Message, MessageStatus, TenantId};
use crate::provider::{MailProvider, OutboundEmail, SubmitReceipt};
use crate::store::MessageRepository;

/// Body of `POST /api/send`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SendRequest {
    #[serde(default)]
    pub to: Vec<String>,
    #[serde(default)]
    pub from: String,
    #[serde(default)]
    pub subject: String,
    #[serde(default)]
    pub html_body: Option<String>,
    #[serde(default)]
    pub plain_body: Option<String>,
    #[serde(default)]
    pub headers: Option<BTreeMap<String, String>>,
}

/// Response of a successful send.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct SendReceipt {
    pub message_id: Uuid,
    pub postal_message_id: String,
    pub status: MessageStatus,
}

/// Parse an address the way it will be handed to the provider.
fn parse_address(field: &str, address: &str) -> Result<Address, GatewayError> {
    address
        .parse::<Address>()
        .map_err(|e| GatewayError::validation(format!("invalid {} address {}: {}", field, address, e)))
}

fn non_empty(body: &Option<String>) -> Option<String> {
    body.as_ref().filter(|b| !b.is_empty()).cloned()
}

impl SendRequest {
    pub fn validate(&self) -> Result<(), GatewayError> {
        if self.to.is_empty() {
            return Err(GatewayError::validation("to is required"));
        }
        for recipient in &self.to {
            parse_address("recipient", recipient)?;
        }
        if self.from.is_empty() {
            return Err(GatewayError::validation("from is required"));
        }
        parse_address("from", &self.from)?;
        if self.subject.is_empty() {
            return Err(GatewayError::validation("subject is required"));
        }
        if non_empty(&self.html_body).is_none() && non_empty(&self.plain_body).is_none() {
            return Err(GatewayError::validation(
                "Either html_body or plain_body is required",
            ));
        }
        Ok(())
    }

    fn to_outbound(&self) -> OutboundEmail {
        OutboundEmail {
            to: self.to.clone(),
            from: self.from.clone(),
            subject: self.subject.clone(),
            html_body: non_empty(&self.html_body),
            plain_body: non_empty(&self.plain_body),
            headers: self.headers.clone().unwrap_or_default(),
        }
    }
}

#[derive(Clone)]
pub struct MessageSender {
    provider: Arc<dyn MailProvider>,
    messages: Arc<dyn MessageRepository>,
}

impl MessageSender {
    pub fn new(provider: Arc<dyn MailProvider>, messages: Arc<dyn MessageRepository>) -> Self {
        Self { provider, messages }
    }

    /// Validate, submit and record a send on behalf of `tenant_id`.
    pub async fn send(
        &self,
        tenant_id: TenantId,
        request: &SendRequest,
    ) -> Result<SendReceipt, GatewayError> {
        request.validate()?;

        let client_message_id = Uuid::new_v4();
        info!(
            tenant_id = %tenant_id,
            message_id = %client_message_id,
            recipients = request.to.len(),
            "send_submitting"
        );

        match self.provider.send_email(&request.to_outbound()).await {
            Ok(receipt) => {
                self.record(tenant_id, client_message_id, request, Ok(&receipt))
                    .await;
                info!(
                    tenant_id = %tenant_id,
                    message_id = %client_message_id,
                    provider_message_id = %receipt.provider_message_id,
                    "send_accepted"
                );
                Ok(SendReceipt {
                    message_id: client_message_id,
                    postal_message_id: receipt.provider_message_id,
                    status: MessageStatus::Sent,
                })
            }
            Err(e) => {
                warn!(
                    tenant_id = %tenant_id,
                    message_id = %client_message_id,
                    error = %e,
                    "send_provider_failed"
                );
                self.record(tenant_id, client_message_id, request, Err(e.to_string()))
                    .await;
                Err(GatewayError::Provider(e))
            }
        }
    }

    /// Write one row per recipient. Failures are logged only.
    async fn record(
        &self,
        tenant_id: TenantId,
        client_message_id: Uuid,
        request: &SendRequest,
        outcome: Result<&SubmitReceipt, String>,
    ) {
        let now = Utc::now();
        for recipient in &request.to {
            let (status, provider_message_id, provider_recipient_id, error_message) = match &outcome {
                Ok(receipt) => (
                    MessageStatus::Sent,
                    Some(receipt.provider_message_id.clone()).filter(|id| !id.is_empty()),
                    receipt.recipient_id(recipient).map(str::to_string),
                    None,
                ),
                Err(msg) => (MessageStatus::Failed, None, None, Some(msg.clone())),
            };

            let row = Message {
                id: Uuid::new_v4(),
                tenant_id,
                client_message_id,
                provider_message_id,
                provider_recipient_id,
                from: request.from.clone(),
                to: recipient.clone(),
                subject: request.subject.clone(),
                status,
                error_message,
                opened_at: None,
                clicked_at: None,
                bounced_at: None,
                delivered_at: None,
                created_at: now,
                updated_at: now,
                deleted_at: None,
            };

            if let Err(e) = self.messages.create(row).await {
                error!(
                    error = %e,
                    message_id = %client_message_id,
                    recipient = %recipient,
                    "send_log_failed"
                );
            }
        }
    }
}
