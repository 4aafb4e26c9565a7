//! The gateway's operations, wired together.
//!
//! [`Gateway`] owns every service and is what the HTTP layer calls into.
//! It holds no state of its own beyond its collaborators.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::credentials::{Credential, CredentialStore};
use crate::dispatch::WebhookDispatcher;
use crate::error::GatewayError;
use crate::events::lifecycle::{ApplyOutcome, FanOutPolicy, StatusLifecycle};
use crate::events::{normalizer, signature};
use crate::model::{EventKind, Message, MessageStatus};
use crate::provider::MailProvider;
use crate::ratelimit::{RateLimiter, WindowPolicy};
use crate::sender::{MessageSender, SendReceipt, SendRequest};
use crate::store::{
    ApiKeyRepository, CounterStore, MessagePage, MessageQuery, MessageRepository,
    SubscriptionRepository,
};
use crate::subscriptions::SubscriptionService;

/// Collaborators and settings a [`Gateway`] is built from.
pub struct GatewayDeps {
    pub api_keys: Arc<dyn ApiKeyRepository>,
    pub messages: Arc<dyn MessageRepository>,
    pub subscriptions: Arc<dyn SubscriptionRepository>,
    pub counters: Arc<dyn CounterStore>,
    pub provider: Arc<dyn MailProvider>,
    pub dispatcher: WebhookDispatcher,
    pub rate_limit_window: Duration,
    pub window_policy: WindowPolicy,
    pub fan_out_policy: FanOutPolicy,
    /// When set, inbound provider webhooks must carry a valid signature.
    pub inbound_webhook_secret: Option<String>,
}

/// What happened to an inbound provider event. Every variant is a success
/// from the provider's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    MissingMessageId,
    UnknownMessage,
    Processed,
}

impl IngestOutcome {
    pub fn message(&self) -> &'static str {
        match self {
            IngestOutcome::MissingMessageId => "No message ID in payload",
            IngestOutcome::UnknownMessage => "Email log not found",
            IngestOutcome::Processed => "Webhook processed",
        }
    }
}

/// A stored message with the provider's live status laid over it.
#[derive(Debug, Clone, Serialize)]
pub struct MessageView {
    #[serde(flatten)]
    pub message: Message,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider_status: Option<String>,
}

#[derive(Clone)]
pub struct Gateway {
    credentials: CredentialStore,
    limiter: RateLimiter,
    sender: MessageSender,
    lifecycle: StatusLifecycle,
    dispatcher: WebhookDispatcher,
    subscriptions: SubscriptionService,
    messages: Arc<dyn MessageRepository>,
    provider: Arc<dyn MailProvider>,
    inbound_webhook_secret: Option<String>,
}

impl Gateway {
    pub fn new(deps: GatewayDeps) -> Self {
        let inbound_webhook_secret =
            if signature::is_signature_verification_enabled(&deps.inbound_webhook_secret) {
                deps.inbound_webhook_secret
            } else {
                None
            };
        Self {
            credentials: CredentialStore::new(deps.api_keys),
            limiter: RateLimiter::new(deps.counters, deps.rate_limit_window, deps.window_policy),
            sender: MessageSender::new(deps.provider.clone(), deps.messages.clone()),
            lifecycle: StatusLifecycle::new(deps.messages.clone(), deps.fan_out_policy),
            dispatcher: deps.dispatcher,
            subscriptions: SubscriptionService::new(deps.subscriptions),
            messages: deps.messages,
            provider: deps.provider,
            inbound_webhook_secret,
        }
    }

    pub fn credentials(&self) -> &CredentialStore {
        &self.credentials
    }

    pub fn subscriptions(&self) -> &SubscriptionService {
        &self.subscriptions
    }

    /// Resolve a raw API key to the identity it acts as.
    pub async fn authenticate(&self, raw_key: Option<&str>) -> Result<Credential, GatewayError> {
        let raw_key = raw_key
            .map(str::trim)
            .filter(|k| !k.is_empty())
            .ok_or(GatewayError::MissingApiKey)?;

        let credential = self
            .credentials
            .resolve(raw_key)
            .await?
            .ok_or(GatewayError::InvalidApiKey)?;

        self.credentials.touch(&credential).await;
        Ok(credential)
    }

    /// Authenticate a send request and charge it against the key's quota.
    pub async fn admit(&self, raw_key: Option<&str>) -> Result<Credential, GatewayError> {
        let credential = self.authenticate(raw_key).await?;

        if !self
            .limiter
            .allow(credential.api_key_id, credential.rate_limit_per_hour)
            .await
        {
            info!(
                tenant_id = %credential.tenant_id,
                api_key_id = %credential.api_key_id,
                key_prefix = %credential.key_prefix,
                limit = credential.rate_limit_per_hour,
                "request_rate_limited"
            );
            return Err(GatewayError::RateLimited);
        }

        debug!(
            tenant_id = %credential.tenant_id,
            api_key_id = %credential.api_key_id,
            "request_admitted"
        );
        Ok(credential)
    }

    pub async fn send(
        &self,
        credential: &Credential,
        request: &SendRequest,
    ) -> Result<SendReceipt, GatewayError> {
        self.sender.send(credential.tenant_id, request).await
    }

    /// Handle one inbound provider webhook.
    ///
    /// Unresolvable events are accepted so the provider does not retry them.
    /// Forwarding to subscribers is queued and never awaited here.
    pub async fn ingest_provider_event(
        &self,
        body: &[u8],
        provided_signature: Option<&str>,
    ) -> Result<IngestOutcome, GatewayError> {
        if let Some(secret) = &self.inbound_webhook_secret {
            let valid = provided_signature
                .map(|sig| signature::verify_signature(body, sig, secret))
                .unwrap_or(false);
            if !valid {
                warn!(
                    has_signature = provided_signature.is_some(),
                    "provider_webhook_signature_rejected"
                );
                return Err(GatewayError::InvalidSignature);
            }
        }

        let event = normalizer::parse(body)?;
        info!(
            kind = %event.kind,
            provider_message_id = %event.provider_message_id,
            provider_event_id = event.provider_event_id.as_deref().unwrap_or(""),
            "provider_webhook_received"
        );

        match self.lifecycle.apply(&event).await? {
            ApplyOutcome::MissingMessageId => Ok(IngestOutcome::MissingMessageId),
            ApplyOutcome::UnknownMessage => Ok(IngestOutcome::UnknownMessage),
            ApplyOutcome::Applied { tenant_id, .. } => {
                if event.kind != EventKind::Unknown {
                    self.dispatcher.dispatch(tenant_id, event);
                }
                Ok(IngestOutcome::Processed)
            }
        }
    }

    pub async fn list_messages(
        &self,
        credential: &Credential,
        query: &MessageQuery,
    ) -> Result<MessagePage, GatewayError> {
        Ok(self.messages.list(credential.tenant_id, query).await?)
    }

    /// Look up one message, refreshing its status from the provider when
    /// possible. The stored row is not modified.
    pub async fn message_details(
        &self,
        credential: &Credential,
        id: Uuid,
    ) -> Result<MessageView, GatewayError> {
        let mut message = self
            .messages
            .find_by_id(credential.tenant_id, id)
            .await?
            .ok_or(GatewayError::NotFound("Email"))?;

        let mut provider_status = None;
        if let Some(provider_id) = message.provider_message_id.clone() {
            match self.provider.get_message(&provider_id).await {
                Ok(details) => {
                    provider_status = details.status_name().map(str::to_string);
                    if let Some(status) = provider_status.as_deref().and_then(MessageStatus::parse) {
                        message.status = status;
                    }
                }
                Err(e) => {
                    warn!(
                        message_id = %id,
                        provider_message_id = %provider_id,
                        error = %e,
                        "provider_status_refresh_failed"
                    );
                }
            }
        }

        Ok(MessageView {
            message,
            provider_status,
        })
    }
}
