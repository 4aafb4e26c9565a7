//! Forward job format.
//!
//! A [`ForwardJob`] is fully prepared before it leaves the dispatcher: the
//! body is serialized and signed once, so the bytes a subscriber verifies are
//! exactly the bytes that were signed, whichever sink carries the job.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::model::{DeliveryEvent, EventKind, TenantId};

/// Queue name for forward jobs when the AMQP sink is enabled.
pub const FORWARD_QUEUE: &str = "webhook_forwards";

/// Canonical event body POSTed to subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForwardPayload {
    pub event: EventKind,
    pub message_id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider_event_id: Option<String>,
    /// The provider's own `payload` object, passed through untouched.
    pub data: Value,
}

impl ForwardPayload {
    pub fn from_event(event: &DeliveryEvent) -> Self {
        Self {
            event: event.kind,
            message_id: event.provider_message_id.clone(),
            timestamp: event.occurred_at,
            provider_event_id: event.provider_event_id.clone(),
            data: event
                .raw_payload
                .get("payload")
                .cloned()
                .unwrap_or(Value::Null),
        }
    }
}

/// One signed delivery to one subscription.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardJob {
    pub job_id: Uuid,
    pub tenant_id: TenantId,
    pub subscription_id: Uuid,
    pub url: String,
    pub event: EventKind,
    /// Serialized [`ForwardPayload`].
    pub body: String,
    /// Hex HMAC-SHA256 of `body` under the subscription's secret.
    pub signature: String,
}
