//! Outbound webhook fan-out.
//!
//! ```text
//! ingest → WebhookDispatcher (bounded channel) → ForwardSink → Forwarder → subscriber
//!                                                    │
//!                                                    └─ amqp: webhook_forwards queue → consumer → Forwarder
//! ```
//!
//! Ingestion only enqueues. Everything after the channel runs in the
//! background, and each forward is an independent task.

pub mod consumer;
pub mod dispatcher;
pub mod forwarder;
pub mod publisher;
pub mod sink;
pub mod types;

pub use dispatcher::{prepare_jobs, WebhookDispatcher};
pub use forwarder::{ForwardError, Forwarder, ForwarderConfig};
pub use publisher::Publisher;
pub use sink::{DirectSink, ForwardSink};
pub use types::{ForwardJob, ForwardPayload, FORWARD_QUEUE};
