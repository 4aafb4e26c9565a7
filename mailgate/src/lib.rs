//! Mailgate - multi-tenant email gateway in front of Postal.
//!
//! ## Architecture
//!
//! ```text
//! POST /api/send        → admission (API key + rate limit) → MessageSender → Postal
//! POST /webhooks/postal → normalizer → status lifecycle → WebhookDispatcher → subscribers
//! ```
//!
//! Storage is reached only through the traits in [`store`]; the rate-limit
//! counter lives in Redis when configured.

pub mod config;
pub mod credentials;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod gateway;
pub mod model;
pub mod provider;
pub mod ratelimit;
pub mod sender;
pub mod store;
pub mod subscriptions;
pub mod web;

// Re-export commonly used types
pub use config::{Config, ForwardQueueMode};
pub use credentials::{Credential, CredentialStore};
pub use dispatch::{DirectSink, ForwardSink, Forwarder, ForwarderConfig, Publisher, WebhookDispatcher};
pub use error::GatewayError;
pub use events::FanOutPolicy;
pub use gateway::{Gateway, GatewayDeps, IngestOutcome};
pub use provider::{MailProvider, PostalClient};
pub use ratelimit::RateLimiter;
pub use store::WindowPolicy;
pub use web::{router, AppState};
