//! mtls-relay common library
//!
//! Shared types for the mutual-TLS relay and the processes that drive it:
//!
//! - Control protocol messages and correlated responses
//! - Control channel framing (line-delimited or length-prefixed JSON)
//! - Per-operation TLS client identities built from PEM credentials
//! - Runtime configuration
//!
//! # Features
//!
//! - **Correlation ids**: every response echoes the id of the message that produced it
//! - **Credential hygiene**: PEM material is wrapped so it never reaches a log or a response
//! - **Explicit trust model**: server certificate verification is a configuration choice,
//!   disabled by default

/// Runtime configuration
pub mod config;

/// Control channel framing
pub mod codec;

/// TLS client identities
pub mod identity;

/// Control protocol definitions
pub mod protocol;

// Re-export commonly used types for convenience
pub use codec::{ControlCodec, InboundFrame};
pub use config::{Framing, PeerVerification, RelayConfig, TransportKind};
pub use identity::{IdentityContext, IdentityError, TrustPolicy};
pub use protocol::{
    ControlMessage, ControlResponse, CorrelationId, Credentials, FramePayload, MessageKind, RequestOutcome, Secret,
};
