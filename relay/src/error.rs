use std::fmt;

use mtls_relay_common::{
    protocol::{DecodeError, DecodeReason},
    CorrelationId, IdentityError,
};
use tokio_tungstenite::tungstenite;

/// Failures reaching or talking to a remote endpoint.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("{}", error_chain(.0))]
    Http(#[from] reqwest::Error),
    #[error("{}", error_chain(.0))]
    WebSocket(#[from] tungstenite::Error),
}

/// Renders an error followed by its sources, `outer: inner: root`.
fn error_chain(error: &dyn std::error::Error) -> String {
    let mut rendered = error.to_string();
    let mut source = error.source();
    while let Some(cause) = source {
        let cause_text = cause.to_string();
        if !rendered.ends_with(&cause_text) {
            rendered.push_str(": ");
            rendered.push_str(&cause_text);
        }
        source = cause.source();
    }
    rendered
}

/// Everything that can go wrong while handling one control message.
///
/// Each variant is reported to the parent as an error response carrying the
/// id of the message that caused it.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("Status code was not success ({status}) : {body}")]
    ProtocolStatus { status: u16, body: String },

    #[error("No open websocket with id {0}")]
    SessionNotFound(CorrelationId),

    #[error("{0}")]
    MalformedMessage(String),

    #[error("Invalid message type: {0}")]
    UnknownMessageType(String),

    #[error("Invalid client identity: {0}")]
    InvalidIdentity(#[from] IdentityError),

    #[error("Invalid JSON in response body: {0}")]
    InvalidBody(#[source] serde_json::Error),

    #[error("{0}")]
    Unhandled(String),
}

impl RelayError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RelayError::Transport(_) => ErrorKind::Transport,
            RelayError::ProtocolStatus { .. } => ErrorKind::ProtocolStatus,
            RelayError::SessionNotFound(_) => ErrorKind::SessionNotFound,
            RelayError::MalformedMessage(_) | RelayError::UnknownMessageType(_) | RelayError::InvalidIdentity(_) => {
                ErrorKind::MalformedMessage
            }
            RelayError::InvalidBody(_) => ErrorKind::Transport,
            RelayError::Unhandled(_) => ErrorKind::Unhandled,
        }
    }
}

impl From<reqwest::Error> for RelayError {
    fn from(e: reqwest::Error) -> Self {
        RelayError::Transport(e.into())
    }
}

impl From<tungstenite::Error> for RelayError {
    fn from(e: tungstenite::Error) -> Self {
        RelayError::Transport(e.into())
    }
}

impl From<DecodeError> for RelayError {
    fn from(e: DecodeError) -> Self {
        match e.reason {
            DecodeReason::UnknownType(tag) => RelayError::UnknownMessageType(tag),
            reason => RelayError::MalformedMessage(reason.to_string()),
        }
    }
}

/// Coarse classification used for logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Transport,
    ProtocolStatus,
    SessionNotFound,
    MalformedMessage,
    Unhandled,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Transport => "transport",
            ErrorKind::ProtocolStatus => "protocol_status",
            ErrorKind::SessionNotFound => "session_not_found",
            ErrorKind::MalformedMessage => "malformed_message",
            ErrorKind::Unhandled => "unhandled",
        };
        f.write_str(name)
    }
}
