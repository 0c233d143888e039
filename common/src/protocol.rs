//! Control channel message types.
//!
//! Inbound records are JSON objects tagged by a `type` field and carrying a
//! caller-chosen `id`. Outbound records echo that `id` so the parent can
//! demultiplex concurrent requests and sessions over one channel.

use std::fmt;

use serde::{ser::SerializeMap, Deserialize, Serialize, Serializer};
use serde_json::{Map, Value};

/// Replacement text written in place of credential fields.
pub const REDACTED: &str = "***REDACTED***";

const SENSITIVE_FIELDS: [&str; 2] = ["certPem", "keyPem"];

/// Caller-chosen token linking a request or session to its responses.
///
/// The parent may use JSON numbers or strings; either is echoed back verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CorrelationId {
    /// Numeric id
    Number(serde_json::Number),
    /// String id
    Text(String),
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CorrelationId::Number(n) => write!(f, "{n}"),
            CorrelationId::Text(s) => f.write_str(s),
        }
    }
}

impl From<CorrelationId> for Value {
    fn from(id: CorrelationId) -> Self {
        match id {
            CorrelationId::Number(n) => Value::Number(n),
            CorrelationId::Text(s) => Value::String(s),
        }
    }
}

impl From<u64> for CorrelationId {
    fn from(value: u64) -> Self {
        CorrelationId::Number(value.into())
    }
}

impl From<&str> for CorrelationId {
    fn from(value: &str) -> Self {
        CorrelationId::Text(value.to_owned())
    }
}

impl From<String> for CorrelationId {
    fn from(value: String) -> Self {
        CorrelationId::Text(value)
    }
}

/// PEM text that must never be echoed or logged.
#[derive(Clone, PartialEq, Eq, Deserialize)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Borrow the cleartext. Callers must not log the result.
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(REDACTED)
    }
}

/// Certificate and private key supplied with a single message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    /// PEM-encoded certificate chain, leaf first
    pub cert_pem: Secret,
    /// PEM-encoded private key
    pub key_pem:  Secret,
}

impl Credentials {
    fn from_pair(cert_pem: Option<Secret>, key_pem: Option<Secret>) -> Result<Option<Self>, DecodeReason> {
        match (cert_pem, key_pem) {
            (Some(cert_pem), Some(key_pem)) => Ok(Some(Self { cert_pem, key_pem })),
            (None, None) => Ok(None),
            _ => Err(DecodeReason::IncompleteCredentials),
        }
    }
}

/// The `type` tags understood by the relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    /// One-shot HTTPS request
    Fetch,
    /// Open a streaming session
    WebSocket,
    /// Terminate a streaming session
    WebSocketClose,
}

impl MessageKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            MessageKind::Fetch => "fetch",
            MessageKind::WebSocket => "websocket",
            MessageKind::WebSocketClose => "websocket_close",
        }
    }

    pub fn parse(tag: &str) -> Option<Self> {
        match tag {
            "fetch" => Some(MessageKind::Fetch),
            "websocket" => Some(MessageKind::WebSocket),
            "websocket_close" => Some(MessageKind::WebSocketClose),
            _ => None,
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A one-shot HTTP(S) request.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchRequest {
    pub id:          CorrelationId,
    pub url:         String,
    /// Upper-cased method, `GET` when the parent omitted it
    pub method:      String,
    /// Request body text; non-string JSON bodies are carried as their JSON text
    pub body:        Option<String>,
    pub credentials: Option<Credentials>,
}

/// Request to open a streaming session under `id`.
#[derive(Debug, Clone, PartialEq)]
pub struct WebSocketOpen {
    pub id:          CorrelationId,
    pub url:         String,
    pub credentials: Option<Credentials>,
}

/// Request to terminate the streaming session registered under `id`.
#[derive(Debug, Clone, PartialEq)]
pub struct WebSocketClose {
    pub id: CorrelationId,
}

/// A decoded inbound control message.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlMessage {
    Fetch(FetchRequest),
    WebSocketOpen(WebSocketOpen),
    WebSocketClose(WebSocketClose),
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct FetchFields {
    url:      String,
    #[serde(default)]
    method:   Option<String>,
    #[serde(default)]
    body:     Option<Value>,
    #[serde(default)]
    cert_pem: Option<Secret>,
    #[serde(default)]
    key_pem:  Option<Secret>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WebSocketFields {
    url:      String,
    #[serde(default)]
    cert_pem: Option<Secret>,
    #[serde(default)]
    key_pem:  Option<Secret>,
}

impl ControlMessage {
    /// Decode one control record from its JSON text.
    pub fn decode(raw: &str) -> Result<Self, DecodeError> {
        let value: Value = serde_json::from_str(raw)
            .map_err(|e| DecodeError::new(None, None, DecodeReason::Syntax(e.to_string())))?;
        Self::from_value(value)
    }

    /// Decode one control record from an already parsed JSON value.
    pub fn from_value(value: Value) -> Result<Self, DecodeError> {
        let Value::Object(fields) = value else {
            return Err(DecodeError::new(None, None, DecodeReason::NotAnObject));
        };
        let raw_id = fields.get("id").filter(|id| !id.is_null()).cloned();
        Self::from_fields(fields).map_err(|mut e| {
            e.raw_id = raw_id;
            e
        })
    }

    fn from_fields(fields: Map<String, Value>) -> Result<Self, DecodeError> {
        let id = match fields.get("id") {
            None | Some(Value::Null) => None,
            Some(raw_id) => Some(
                CorrelationId::deserialize(raw_id)
                    .map_err(|_| {
                        let tag = fields.get("type").and_then(Value::as_str).map(str::to_owned);
                        DecodeError::new(None, tag, DecodeReason::InvalidId(raw_id.to_string()))
                    })?,
            ),
        };

        let tag = match fields.get("type") {
            Some(Value::String(tag)) => tag.clone(),
            Some(other) => {
                return Err(DecodeError::new(id, None, DecodeReason::InvalidType(other.to_string())));
            }
            None => return Err(DecodeError::new(id, None, DecodeReason::MissingType)),
        };

        let Some(kind) = MessageKind::parse(&tag) else {
            return Err(DecodeError::new(id, Some(tag.clone()), DecodeReason::UnknownType(tag)));
        };

        let Some(id) = id else {
            return Err(DecodeError::new(None, Some(tag), DecodeReason::MissingId));
        };

        let invalid = |id: &CorrelationId, e: serde_json::Error| {
            DecodeError::new(
                Some(id.clone()),
                Some(kind.as_str().to_owned()),
                DecodeReason::InvalidFields {
                    kind:   kind.as_str(),
                    detail: e.to_string(),
                },
            )
        };
        let with_context =
            |id: &CorrelationId, reason: DecodeReason| DecodeError::new(Some(id.clone()), Some(kind.as_str().to_owned()), reason);

        let fields = Value::Object(fields);
        match kind {
            MessageKind::Fetch => {
                let wire: FetchFields = serde_json::from_value(fields).map_err(|e| invalid(&id, e))?;
                let credentials =
                    Credentials::from_pair(wire.cert_pem, wire.key_pem).map_err(|r| with_context(&id, r))?;
                let body = match wire.body {
                    None => None,
                    Some(Value::String(text)) => Some(text),
                    Some(other) => Some(other.to_string()),
                };
                Ok(ControlMessage::Fetch(FetchRequest {
                    id,
                    url: wire.url,
                    method: wire
                        .method
                        .map(|m| m.to_ascii_uppercase())
                        .unwrap_or_else(|| "GET".to_owned()),
                    body,
                    credentials,
                }))
            }
            MessageKind::WebSocket => {
                let wire: WebSocketFields = serde_json::from_value(fields).map_err(|e| invalid(&id, e))?;
                let credentials =
                    Credentials::from_pair(wire.cert_pem, wire.key_pem).map_err(|r| with_context(&id, r))?;
                Ok(ControlMessage::WebSocketOpen(WebSocketOpen {
                    id,
                    url: wire.url,
                    credentials,
                }))
            }
            MessageKind::WebSocketClose => Ok(ControlMessage::WebSocketClose(WebSocketClose { id })),
        }
    }

    pub fn id(&self) -> &CorrelationId {
        match self {
            ControlMessage::Fetch(m) => &m.id,
            ControlMessage::WebSocketOpen(m) => &m.id,
            ControlMessage::WebSocketClose(m) => &m.id,
        }
    }

    pub fn kind(&self) -> MessageKind {
        match self {
            ControlMessage::Fetch(_) => MessageKind::Fetch,
            ControlMessage::WebSocketOpen(_) => MessageKind::WebSocket,
            ControlMessage::WebSocketClose(_) => MessageKind::WebSocketClose,
        }
    }
}

/// Why an inbound record could not be decoded.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeReason {
    #[error("Invalid JSON: {0}")]
    Syntax(String),
    #[error("Message must be a JSON object")]
    NotAnObject,
    #[error("Message has no type")]
    MissingType,
    #[error("Message type must be a string, got {0}")]
    InvalidType(String),
    #[error("Invalid message type: {0}")]
    UnknownType(String),
    #[error("Message has no id")]
    MissingId,
    #[error("Invalid message id: {0}")]
    InvalidId(String),
    #[error("Invalid {kind} message: {detail}")]
    InvalidFields { kind: &'static str, detail: String },
    #[error("certPem and keyPem must be supplied together")]
    IncompleteCredentials,
}

/// A decode failure along with whatever correlation context could be recovered.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{reason}")]
pub struct DecodeError {
    /// The message id, when it was readable
    pub id:     Option<CorrelationId>,
    /// The `id` field exactly as sent, even when it is not a valid id
    pub raw_id: Option<Value>,
    /// The raw `type` tag, when it was readable
    pub tag:    Option<String>,
    pub reason: DecodeReason,
}

impl DecodeError {
    fn new(id: Option<CorrelationId>, tag: Option<String>, reason: DecodeReason) -> Self {
        Self {
            id,
            raw_id: None,
            tag,
            reason,
        }
    }

    /// The id to echo on the error response, `null` when none was sent.
    pub fn echo_id(&self) -> Value {
        self.raw_id.clone().unwrap_or(Value::Null)
    }
}

/// Result of a successful one-shot request.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum RequestOutcome {
    /// Decoded `application/json` body
    Json(Value),
    /// Raw body text for any other content type
    Text(String),
}

/// One inbound frame from a streaming session, passed through unmodified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FramePayload {
    Text(String),
    Binary(Vec<u8>),
}

impl Serialize for FramePayload {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            FramePayload::Text(text) => serializer.serialize_str(text),
            // Same shape a Node.js parent gets for a serialized Buffer.
            FramePayload::Binary(bytes) => {
                let mut map = serializer.serialize_map(Some(2))?;
                map.serialize_entry("type", "Buffer")?;
                map.serialize_entry("data", bytes)?;
                map.end()
            }
        }
    }
}

/// An outbound record, always carrying the id of the message that produced it.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlResponse {
    FetchResult {
        id:      CorrelationId,
        payload: RequestOutcome,
    },
    WebSocketFrame {
        id:      CorrelationId,
        payload: FramePayload,
    },
    OperationError {
        /// The triggering record's `id` as sent, `null` when it had none
        id:      Value,
        /// The `type` of the triggering record
        kind:    Option<String>,
        message: String,
    },
}

impl ControlResponse {
    pub fn error(id: impl Into<Value>, kind: Option<String>, message: impl fmt::Display) -> Self {
        ControlResponse::OperationError {
            id: id.into(),
            kind,
            message: message.to_string(),
        }
    }

    /// The id this response is correlated with, as it goes on the wire.
    pub fn id(&self) -> Value {
        match self {
            ControlResponse::FetchResult { id, .. } | ControlResponse::WebSocketFrame { id, .. } => id.clone().into(),
            ControlResponse::OperationError { id, .. } => id.clone(),
        }
    }
}

impl Serialize for ControlResponse {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(3))?;
        match self {
            ControlResponse::FetchResult { id, payload } => {
                map.serialize_entry("id", id)?;
                map.serialize_entry("type", MessageKind::Fetch.as_str())?;
                map.serialize_entry("response", payload)?;
            }
            ControlResponse::WebSocketFrame { id, payload } => {
                map.serialize_entry("id", id)?;
                map.serialize_entry("type", MessageKind::WebSocket.as_str())?;
                map.serialize_entry("message", payload)?;
            }
            ControlResponse::OperationError { id, kind, message } => {
                map.serialize_entry("id", id)?;
                map.serialize_entry("type", kind)?;
                map.serialize_entry("error", message)?;
            }
        }
        map.end()
    }
}

/// Copy of `value` with credential fields replaced by [`REDACTED`].
pub fn redact(value: &Value) -> Value {
    match value {
        Value::Object(fields) => Value::Object(redact_fields(fields)),
        other => other.clone(),
    }
}

fn redact_fields(fields: &Map<String, Value>) -> Map<String, Value> {
    fields
        .iter()
        .map(|(key, value)| {
            if SENSITIVE_FIELDS.contains(&key.as_str()) {
                (key.clone(), Value::String(REDACTED.to_owned()))
            } else {
                (key.clone(), value.clone())
            }
        })
        .collect()
}
