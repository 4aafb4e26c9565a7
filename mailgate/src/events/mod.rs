//! Inbound provider event pipeline: parse, verify, apply.

pub mod lifecycle;
pub mod normalizer;
pub mod signature;

pub use lifecycle::{transition, ApplyOutcome, FanOutPolicy, StatusLifecycle};
pub use normalizer::{parse, ParseError};
pub use signature::{sign_payload, verify_signature};
