use std::env;

use anyhow::{bail, Context, Result};
use mtls_relay_common::{config::NODE_CHANNEL_FD_ENV, Framing, RelayConfig, TransportKind};
use tokio::io::{AsyncRead, AsyncWrite};

/// Serialization mode a Node.js parent announces for its IPC channel.
const NODE_SERIALIZATION_ENV: &str = "NODE_CHANNEL_SERIALIZATION_MODE";

pub type ControlReader = Box<dyn AsyncRead + Send + Unpin>;
pub type ControlWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Both halves of the control channel and the framing it speaks.
pub struct ControlChannel {
    pub reader:  ControlReader,
    pub writer:  ControlWriter,
    pub framing: Framing,
}

/// Open the control channel selected by `config`.
pub fn open(config: &RelayConfig) -> Result<ControlChannel> {
    match config.transport.resolve() {
        TransportKind::NodeIpc => open_node_ipc(),
        TransportKind::Stdio | TransportKind::Auto => {
            tracing::info!("Control channel: stdio ({})", config.framing);
            Ok(ControlChannel {
                reader:  Box::new(tokio::io::stdin()),
                writer:  Box::new(tokio::io::stdout()),
                framing: config.framing,
            })
        }
    }
}

#[cfg(unix)]
fn open_node_ipc() -> Result<ControlChannel> {
    use std::os::unix::{io::FromRawFd, net::UnixStream};

    let raw_fd = env::var(NODE_CHANNEL_FD_ENV).with_context(|| format!("{NODE_CHANNEL_FD_ENV} is not set"))?;
    let fd: i32 = raw_fd
        .trim()
        .parse()
        .with_context(|| format!("Invalid {NODE_CHANNEL_FD_ENV}: {raw_fd:?}"))?;

    if let Ok(mode) = env::var(NODE_SERIALIZATION_ENV) {
        if mode != "json" {
            bail!("Unsupported IPC serialization mode {mode:?}, the relay must be forked with serialization 'json'");
        }
    }

    // SAFETY: the parent hands this descriptor to us and nothing else in the
    // process opens or closes it, so we take sole ownership here.
    let stream = unsafe { UnixStream::from_raw_fd(fd) };
    stream
        .set_nonblocking(true)
        .context("Failed to make IPC channel non-blocking")?;
    let stream = tokio::net::UnixStream::from_std(stream).context("Failed to register IPC channel")?;
    let (reader, writer) = stream.into_split();

    tracing::info!("Control channel: Node.js IPC on fd {}", fd);
    Ok(ControlChannel {
        reader:  Box::new(reader),
        writer:  Box::new(writer),
        framing: Framing::Lines,
    })
}

#[cfg(not(unix))]
fn open_node_ipc() -> Result<ControlChannel> {
    bail!("Node.js IPC channels are only supported on Unix platforms")
}
