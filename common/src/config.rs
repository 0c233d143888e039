use std::{env, fmt, path::PathBuf, str::FromStr, time::Duration};

use crate::codec::DEFAULT_MAX_FRAME_LENGTH;

const FRAMING_ENV: &str = "MTLS_RELAY_FRAMING";
const TRANSPORT_ENV: &str = "MTLS_RELAY_TRANSPORT";
const CA_BUNDLE_ENV: &str = "MTLS_RELAY_CA_BUNDLE";
const OUTBOUND_CAPACITY_ENV: &str = "MTLS_RELAY_OUTBOUND_CAPACITY";
const MAX_FRAME_BYTES_ENV: &str = "MTLS_RELAY_MAX_FRAME_BYTES";

/// Environment variable through which a Node.js parent hands over its IPC socket.
pub const NODE_CHANNEL_FD_ENV: &str = "NODE_CHANNEL_FD";

const DEFAULT_OUTBOUND_CAPACITY: usize = 256;
const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Errors raised while reading configuration values.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {name}: expected {expected}")]
    InvalidValue {
        name:     &'static str,
        value:    String,
        expected: &'static str,
    },
}

/// How records are delimited on the control channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Framing {
    /// One JSON record per line
    #[default]
    Lines,
    /// `u32` little-endian length prefix followed by the JSON payload
    LengthDelimited,
}

impl FromStr for Framing {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "lines" | "ndjson" => Ok(Framing::Lines),
            "length-delimited" | "length_delimited" => Ok(Framing::LengthDelimited),
            _ => Err(ConfigError::InvalidValue {
                name:     FRAMING_ENV,
                value:    s.to_owned(),
                expected: "lines | length-delimited",
            }),
        }
    }
}

impl fmt::Display for Framing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Framing::Lines => f.write_str("lines"),
            Framing::LengthDelimited => f.write_str("length-delimited"),
        }
    }
}

/// Where the control channel comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransportKind {
    /// `NodeIpc` when `NODE_CHANNEL_FD` is set, `Stdio` otherwise
    #[default]
    Auto,
    /// stdin / stdout
    Stdio,
    /// The socket inherited through `NODE_CHANNEL_FD`
    NodeIpc,
}

impl TransportKind {
    /// Resolve `Auto` against the current environment.
    pub fn resolve(self) -> Self {
        match self {
            TransportKind::Auto if env::var_os(NODE_CHANNEL_FD_ENV).is_some() => TransportKind::NodeIpc,
            TransportKind::Auto => TransportKind::Stdio,
            other => other,
        }
    }
}

impl FromStr for TransportKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(TransportKind::Auto),
            "stdio" => Ok(TransportKind::Stdio),
            "node-ipc" | "node_ipc" => Ok(TransportKind::NodeIpc),
            _ => Err(ConfigError::InvalidValue {
                name:     TRANSPORT_ENV,
                value:    s.to_owned(),
                expected: "auto | stdio | node-ipc",
            }),
        }
    }
}

/// Whether the relay checks the certificate presented by the remote peer.
///
/// The relay's operating assumption is that endpoints are pinned by the
/// parent, so verification is `Disabled` unless a CA bundle is configured.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum PeerVerification {
    /// Accept any server certificate
    #[default]
    Disabled,
    /// Verify server certificates against the PEM bundle at this path
    CaBundle(PathBuf),
}

impl PeerVerification {
    pub fn is_enabled(&self) -> bool {
        matches!(self, PeerVerification::CaBundle(_))
    }
}

/// Runtime configuration for the relay.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Control channel framing
    pub framing:           Framing,
    /// Control channel transport
    pub transport:         TransportKind,
    /// Server certificate policy for outbound connections
    pub peer_verification: PeerVerification,
    /// Capacity of the outbound response queue
    pub outbound_capacity: usize,
    /// Largest accepted control record, in bytes
    pub max_frame_length:  usize,
    /// How long in-flight responses may take to drain after the parent goes away
    pub shutdown_grace:    Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            framing:           Framing::default(),
            transport:         TransportKind::default(),
            peer_verification: PeerVerification::default(),
            outbound_capacity: DEFAULT_OUTBOUND_CAPACITY,
            max_frame_length:  DEFAULT_MAX_FRAME_LENGTH,
            shutdown_grace:    DEFAULT_SHUTDOWN_GRACE,
        }
    }
}

impl RelayConfig {
    /// Creates a configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates configuration from `MTLS_RELAY_*` environment variables,
    /// falling back to defaults for anything unset.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::new();

        if let Ok(framing) = env::var(FRAMING_ENV) {
            config.framing = framing.parse()?;
        }
        if let Ok(transport) = env::var(TRANSPORT_ENV) {
            config.transport = transport.parse()?;
        }
        if let Some(path) = env::var_os(CA_BUNDLE_ENV).filter(|p| !p.is_empty()) {
            config.peer_verification = PeerVerification::CaBundle(PathBuf::from(path));
        }
        if let Ok(capacity) = env::var(OUTBOUND_CAPACITY_ENV) {
            config.outbound_capacity = parse_positive(OUTBOUND_CAPACITY_ENV, &capacity)?;
        }
        if let Ok(max) = env::var(MAX_FRAME_BYTES_ENV) {
            config.max_frame_length = parse_positive(MAX_FRAME_BYTES_ENV, &max)?;
        }

        Ok(config)
    }

    /// Set the control channel framing
    pub fn with_framing(mut self, framing: Framing) -> Self {
        self.framing = framing;
        self
    }

    /// Set the control channel transport
    pub fn with_transport(mut self, transport: TransportKind) -> Self {
        self.transport = transport;
        self
    }

    /// Set the server certificate policy
    pub fn with_peer_verification(mut self, peer_verification: PeerVerification) -> Self {
        self.peer_verification = peer_verification;
        self
    }

    /// Set the outbound queue capacity (at least 1)
    pub fn with_outbound_capacity(mut self, capacity: usize) -> Self {
        self.outbound_capacity = capacity.max(1);
        self
    }

    /// Set the largest accepted control record
    pub fn with_max_frame_length(mut self, max_frame_length: usize) -> Self {
        self.max_frame_length = max_frame_length;
        self
    }

    /// Set the drain period used at shutdown
    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }
}

fn parse_positive(name: &'static str, value: &str) -> Result<usize, ConfigError> {
    value
        .trim()
        .parse::<usize>()
        .ok()
        .filter(|n| *n > 0)
        .ok_or_else(|| ConfigError::InvalidValue {
            name,
            value: value.to_owned(),
            expected: "a positive integer",
        })
}
