//! Postal webhook envelope → [`DeliveryEvent`].
//!
//! Postal posts `{event, timestamp, uuid, payload}`. Only well-formedness is
//! checked; an envelope with no recognizable message id still parses and
//! carries an empty id.

use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

use crate::model::{DeliveryEvent, EventKind};

/// The inbound body was not a usable JSON envelope.
#[derive(Debug, Error)]
#[error("malformed webhook payload: {reason}")]
pub struct ParseError {
    reason: String,
}

impl ParseError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }
}

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(default)]
    event: String,
    #[serde(default)]
    timestamp: Value,
    #[serde(default)]
    uuid: Option<String>,
    #[serde(default)]
    payload: Value,
}

/// Parse raw webhook bytes.
pub fn parse(raw: &[u8]) -> Result<DeliveryEvent, ParseError> {
    let value: Value = serde_json::from_slice(raw).map_err(|e| ParseError::new(e.to_string()))?;
    if !value.is_object() {
        return Err(ParseError::new("expected a JSON object"));
    }

    let envelope: Envelope =
        serde_json::from_value(value.clone()).map_err(|e| ParseError::new(e.to_string()))?;

    Ok(DeliveryEvent {
        kind: EventKind::from_provider(&envelope.event),
        provider_message_id: extract_message_id(&envelope.payload),
        occurred_at: parse_timestamp(&envelope.timestamp).unwrap_or_else(Utc::now),
        provider_event_id: envelope.uuid.filter(|u| !u.is_empty()),
        raw_payload: value,
    })
}

/// Message identifier from an event payload.
///
/// Tries `payload.message_id` first, then `payload.message.id`. Returns an
/// empty string when neither is present.
pub fn extract_message_id(payload: &Value) -> String {
    if let Some(id) = payload.get("message_id").and_then(scalar_id) {
        return id;
    }
    payload
        .get("message")
        .and_then(|m| m.get("id"))
        .and_then(scalar_id)
        .unwrap_or_default()
}

fn scalar_id(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Postal sends a unix timestamp with fractional seconds; RFC 3339 strings
/// are accepted too.
fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::Number(n) => {
            let secs = n.as_f64()?;
            if !secs.is_finite() || secs < 0.0 {
                return None;
            }
            let whole = secs.trunc() as i64;
            let nanos = ((secs - secs.trunc()) * 1e9) as u32;
            Utc.timestamp_opt(whole, nanos).single()
        }
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|dt| dt.with_timezone(&Utc)),
        _ => None,
    }
}
