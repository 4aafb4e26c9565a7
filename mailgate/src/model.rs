//! Domain types shared by the admission path and the event pipeline.
//!
//! Every persisted entity carries its owning [`TenantId`] and a `deleted_at`
//! tombstone. Tombstones are filtered by the repositories in [`crate::store`],
//! never by callers.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// =============================================================================
// Tenant
// =============================================================================

/// Identity of the account that owns keys, messages and subscriptions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TenantId(pub Uuid);

impl TenantId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TenantId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for TenantId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s.trim()).map(Self)
    }
}

// =============================================================================
// API keys
// =============================================================================

/// A tenant's API key. Only the SHA-256 hash of the key material is kept.
#[derive(Debug, Clone, Serialize)]
pub struct ApiKey {
    pub id: Uuid,
    pub tenant_id: TenantId,
    pub name: String,
    #[serde(skip_serializing)]
    pub key_hash: String,
    /// First 8 characters of the raw key, for display.
    pub key_prefix: String,
    pub rate_limit_per_hour: u32,
    pub last_used_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    #[serde(skip)]
    pub deleted_at: Option<DateTime<Utc>>,
}

/// Field-level update for an [`ApiKey`]. `None` leaves a field untouched.
#[derive(Debug, Clone, Default)]
pub struct ApiKeyPatch {
    pub name: Option<String>,
    pub rate_limit_per_hour: Option<u32>,
    pub last_used_at: Option<DateTime<Utc>>,
}

impl ApiKey {
    pub fn apply_patch(&mut self, patch: &ApiKeyPatch) {
        if let Some(name) = &patch.name {
            self.name = name.clone();
        }
        if let Some(limit) = patch.rate_limit_per_hour {
            self.rate_limit_per_hour = limit;
        }
        if let Some(at) = patch.last_used_at {
            self.last_used_at = Some(at);
        }
    }
}

// =============================================================================
// Messages
// =============================================================================

/// Primary delivery status of a message.
///
/// `opened` and `clicked` are not statuses; they are timestamps layered on
/// top of whatever the primary status is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Queued,
    Sent,
    Delivered,
    Bounced,
    Failed,
}

impl MessageStatus {
    pub const ALL: [MessageStatus; 5] = [
        MessageStatus::Queued,
        MessageStatus::Sent,
        MessageStatus::Delivered,
        MessageStatus::Bounced,
        MessageStatus::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MessageStatus::Queued => "queued",
            MessageStatus::Sent => "sent",
            MessageStatus::Delivered => "delivered",
            MessageStatus::Bounced => "bounced",
            MessageStatus::Failed => "failed",
        }
    }

    /// Parse a status name, case-insensitively. Unknown names yield `None`.
    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|s| s.as_str().eq_ignore_ascii_case(name.trim()))
    }
}

impl fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One recipient's copy of a send.
///
/// A send to N recipients produces N rows sharing `client_message_id` and
/// `provider_message_id`. `provider_recipient_id` is the provider's
/// per-recipient identifier when it reported one.
#[derive(Debug, Clone, Serialize)]
pub struct Message {
    pub id: Uuid,
    pub tenant_id: TenantId,
    pub client_message_id: Uuid,
    pub provider_message_id: Option<String>,
    pub provider_recipient_id: Option<String>,
    pub from: String,
    pub to: String,
    pub subject: String,
    pub status: MessageStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub opened_at: Option<DateTime<Utc>>,
    pub clicked_at: Option<DateTime<Utc>>,
    pub bounced_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip)]
    pub deleted_at: Option<DateTime<Utc>>,
}

/// Field-level update for a [`Message`], produced by the status lifecycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessagePatch {
    pub status: Option<MessageStatus>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub bounced_at: Option<DateTime<Utc>>,
    pub opened_at: Option<DateTime<Utc>>,
    pub clicked_at: Option<DateTime<Utc>>,
}

impl MessagePatch {
    pub fn is_empty(&self) -> bool {
        *self == MessagePatch::default()
    }
}

impl Message {
    /// Whether this row answers to the given provider identifier.
    pub fn matches_provider_id(&self, id: &str) -> bool {
        self.provider_message_id.as_deref() == Some(id)
            || self.provider_recipient_id.as_deref() == Some(id)
    }

    pub fn apply_patch(&mut self, patch: &MessagePatch) {
        if patch.is_empty() {
            return;
        }
        if let Some(status) = patch.status {
            self.status = status;
        }
        if let Some(at) = patch.delivered_at {
            self.delivered_at = Some(at);
        }
        if let Some(at) = patch.bounced_at {
            self.bounced_at = Some(at);
        }
        if let Some(at) = patch.opened_at {
            self.opened_at = Some(at);
        }
        if let Some(at) = patch.clicked_at {
            self.clicked_at = Some(at);
        }
        self.updated_at = Utc::now();
    }
}

// =============================================================================
// Delivery events
// =============================================================================

/// Canonical event kind, independent of the provider's naming.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Sent,
    Delivered,
    Bounced,
    Failed,
    Opened,
    Clicked,
    Unknown,
}

impl EventKind {
    /// Map a Postal event name onto a canonical kind. Exact, case-sensitive.
    pub fn from_provider(name: &str) -> Self {
        match name {
            "MessageSent" => EventKind::Sent,
            "MessageDelivered" => EventKind::Delivered,
            "MessageBounced" => EventKind::Bounced,
            "MessageFailed" => EventKind::Failed,
            "MessageOpened" => EventKind::Opened,
            "MessageLinkClicked" => EventKind::Clicked,
            _ => EventKind::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Sent => "sent",
            EventKind::Delivered => "delivered",
            EventKind::Bounced => "bounced",
            EventKind::Failed => "failed",
            EventKind::Opened => "opened",
            EventKind::Clicked => "clicked",
            EventKind::Unknown => "unknown",
        }
    }

    /// Parse a canonical name as used in subscription filters.
    /// `unknown` is not subscribable and is rejected.
    pub fn parse_filter_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "sent" => Some(EventKind::Sent),
            "delivered" => Some(EventKind::Delivered),
            "bounced" => Some(EventKind::Bounced),
            "failed" => Some(EventKind::Failed),
            "opened" => Some(EventKind::Opened),
            "clicked" => Some(EventKind::Clicked),
            _ => None,
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A normalized provider event. Transient: only its effect on a
/// [`Message`] is stored.
#[derive(Debug, Clone, PartialEq)]
pub struct DeliveryEvent {
    pub kind: EventKind,
    /// Empty when the provider payload carried no identifier.
    pub provider_message_id: String,
    pub occurred_at: DateTime<Utc>,
    pub provider_event_id: Option<String>,
    pub raw_payload: serde_json::Value,
}

impl DeliveryEvent {
    pub fn has_message_id(&self) -> bool {
        !self.provider_message_id.is_empty()
    }
}

// =============================================================================
// Webhook subscriptions
// =============================================================================

/// A tenant endpoint that receives forwarded delivery events.
#[derive(Debug, Clone, Serialize)]
pub struct WebhookSubscription {
    pub id: Uuid,
    pub tenant_id: TenantId,
    pub url: String,
    /// Empty means every forwardable kind.
    pub event_filter: BTreeSet<EventKind>,
    #[serde(skip_serializing)]
    pub secret: String,
    pub is_active: bool,
    pub last_triggered_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    #[serde(skip)]
    pub deleted_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default)]
pub struct SubscriptionPatch {
    pub is_active: Option<bool>,
    pub last_triggered_at: Option<DateTime<Utc>>,
}

impl WebhookSubscription {
    /// Whether an event of `kind` should be forwarded to this endpoint.
    pub fn accepts(&self, kind: EventKind) -> bool {
        kind != EventKind::Unknown
            && (self.event_filter.is_empty() || self.event_filter.contains(&kind))
    }

    pub fn apply_patch(&mut self, patch: &SubscriptionPatch) {
        if let Some(active) = patch.is_active {
            self.is_active = active;
        }
        if let Some(at) = patch.last_triggered_at {
            self.last_triggered_at = Some(at);
        }
    }
}
