//! Canonical per-message status lifecycle.
//!
//! Primary status moves `queued → sent → {delivered, bounced, failed}`.
//! Opens and clicks are timestamps layered on top and never change the
//! primary status. Transitions are applied as given; concurrent events for
//! the same message are last-write-wins.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::model::{DeliveryEvent, EventKind, Message, MessagePatch, MessageStatus, TenantId};
use crate::store::{MessageRepository, StoreError};

/// The field changes an event kind implies, stamped with `now`.
///
/// `Sent` and `Unknown` produce an empty patch: the row already exists from
/// send time, and unrecognized events are accepted without effect.
pub fn transition(kind: EventKind, now: DateTime<Utc>) -> MessagePatch {
    match kind {
        EventKind::Delivered => MessagePatch {
            status: Some(MessageStatus::Delivered),
            delivered_at: Some(now),
            ..Default::default()
        },
        EventKind::Bounced => MessagePatch {
            status: Some(MessageStatus::Bounced),
            bounced_at: Some(now),
            ..Default::default()
        },
        EventKind::Failed => MessagePatch {
            status: Some(MessageStatus::Failed),
            ..Default::default()
        },
        EventKind::Opened => MessagePatch {
            opened_at: Some(now),
            ..Default::default()
        },
        EventKind::Clicked => MessagePatch {
            clicked_at: Some(now),
            ..Default::default()
        },
        EventKind::Sent | EventKind::Unknown => MessagePatch::default(),
    }
}

/// Which rows an event updates when several share one provider id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FanOutPolicy {
    /// Only the oldest matching row.
    #[default]
    FirstMatch,
    /// Every matching row.
    AllMatches,
}

impl FanOutPolicy {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "first" | "first_match" => Some(FanOutPolicy::FirstMatch),
            "all" | "all_matches" => Some(FanOutPolicy::AllMatches),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FanOutPolicy::FirstMatch => "first",
            FanOutPolicy::AllMatches => "all",
        }
    }
}

/// Result of applying one event.
#[derive(Debug, Clone)]
pub enum ApplyOutcome {
    /// The event carried no message id. Nothing was looked up.
    MissingMessageId,
    /// No live row answers to the id.
    UnknownMessage,
    /// Matching rows were found. `updated` holds them after the transition,
    /// which for a no-op kind is simply their current state.
    Applied {
        tenant_id: TenantId,
        updated: Vec<Message>,
    },
}

#[derive(Clone)]
pub struct StatusLifecycle {
    messages: Arc<dyn MessageRepository>,
    policy: FanOutPolicy,
}

impl StatusLifecycle {
    pub fn new(messages: Arc<dyn MessageRepository>, policy: FanOutPolicy) -> Self {
        Self { messages, policy }
    }

    pub fn policy(&self) -> FanOutPolicy {
        self.policy
    }

    /// Apply `event` to the message rows it names.
    pub async fn apply(&self, event: &DeliveryEvent) -> Result<ApplyOutcome, StoreError> {
        if !event.has_message_id() {
            return Ok(ApplyOutcome::MissingMessageId);
        }

        let mut matches = self
            .messages
            .find_by_provider_id(&event.provider_message_id)
            .await?;
        if matches.is_empty() {
            debug!(
                provider_message_id = %event.provider_message_id,
                kind = %event.kind,
                "lifecycle_unknown_message"
            );
            return Ok(ApplyOutcome::UnknownMessage);
        }
        if self.policy == FanOutPolicy::FirstMatch {
            matches.truncate(1);
        }

        let tenant_id = matches[0].tenant_id;
        let patch = transition(event.kind, Utc::now());
        if patch.is_empty() {
            return Ok(ApplyOutcome::Applied {
                tenant_id,
                updated: matches,
            });
        }

        let mut updated = Vec::with_capacity(matches.len());
        for row in matches {
            // A row deleted between lookup and update is skipped.
            if let Some(row) = self
                .messages
                .update(row.tenant_id, row.id, patch.clone())
                .await?
            {
                info!(
                    tenant_id = %row.tenant_id,
                    message_id = %row.id,
                    kind = %event.kind,
                    status = %row.status,
                    "lifecycle_transition_applied"
                );
                updated.push(row);
            }
        }

        Ok(ApplyOutcome::Applied { tenant_id, updated })
    }
}
