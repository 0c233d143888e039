//! mtls-relay
//!
//! A child process that performs mutual-TLS HTTPS requests and WebSocket
//! sessions on behalf of its parent. The parent sends JSON control records
//! over one channel (stdio or an inherited Node.js IPC socket); every
//! response and every streamed frame comes back on the same channel tagged
//! with the `id` of the record that caused it.
//!
//! # Example
//!
//! ```no_run
//! use mtls_relay::Relay;
//! use mtls_relay_common::RelayConfig;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let relay = Relay::new(RelayConfig::from_env()?)?;
//! relay.serve(tokio::io::stdin(), tokio::io::stdout()).await?;
//! # Ok(())
//! # }
//! ```

pub mod channel;
pub mod dispatcher;
pub mod error;
pub mod executor;
pub mod logging;
pub mod registry;
pub mod session;

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use mtls_relay_common::{
    codec::CodecError, ControlCodec, ControlResponse, Framing, IdentityError, InboundFrame, RelayConfig,
    TrustPolicy,
};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::mpsc,
};
use tokio_util::codec::{FramedRead, FramedWrite};

pub use dispatcher::Dispatcher;
pub use error::{ErrorKind, RelayError};
pub use registry::SessionRegistry;

/// The relay: one control channel, any number of concurrent operations.
#[derive(Debug)]
pub struct Relay {
    config:   RelayConfig,
    trust:    TrustPolicy,
    registry: SessionRegistry,
}

impl Relay {
    /// Creates a relay, loading the CA bundle if peer verification is enabled.
    pub fn new(config: RelayConfig) -> Result<Self, IdentityError> {
        let trust = TrustPolicy::load(&config.peer_verification)?;
        Ok(Self {
            config,
            trust,
            registry: SessionRegistry::new(),
        })
    }

    /// Live streaming sessions.
    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    /// Open the configured control channel and serve it until the parent goes away.
    pub async fn run(&self) -> Result<()> {
        let channel = channel::open(&self.config).context("Failed to open control channel")?;
        self.serve_framed(channel.reader, channel.writer, channel.framing)
            .await
    }

    /// Serve control records read from `reader`, writing responses to `writer`,
    /// using the configured framing.
    ///
    /// Returns once `reader` reaches end of input: every live session is
    /// terminated and queued responses get the shutdown grace period to drain.
    pub async fn serve<R, W>(&self, reader: R, writer: W) -> Result<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        self.serve_framed(reader, writer, self.config.framing).await
    }

    async fn serve_framed<R, W>(&self, reader: R, writer: W, framing: Framing) -> Result<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let max_frame_length = self.config.max_frame_length;
        let (outbound, responses) = mpsc::channel(self.config.outbound_capacity);
        let sink = FramedWrite::new(writer, ControlCodec::new(framing, max_frame_length));
        let mut writer_task = tokio::spawn(write_responses(responses, sink));

        let dispatcher = Dispatcher::new(
            self.trust.clone(),
            self.registry.clone(),
            outbound,
            self.config.outbound_capacity,
        );
        let mut frames = FramedRead::new(reader, ControlCodec::new(framing, max_frame_length));

        tracing::info!("✓ Relay ready, waiting for control messages");

        let result = loop {
            tokio::select! {
                frame = frames.next() => match frame {
                    Some(Ok(InboundFrame::Message(text))) => {
                        if text.trim().is_empty() {
                            continue;
                        }
                        dispatcher.dispatch(&text).await;
                    }
                    Some(Ok(InboundFrame::Rejected(fault))) => {
                        tracing::error!("Dropped inbound control record: {}", fault);
                    }
                    Some(Err(e)) => break Err(anyhow::Error::new(e).context("Control channel read failed")),
                    None => {
                        tracing::info!("Control channel closed by parent, shutting down");
                        break Ok(());
                    }
                },
                written = &mut writer_task => {
                    // The writer only stops early when the channel is broken.
                    self.registry.close_all();
                    return match written {
                        Ok(Err(e)) => Err(anyhow::Error::new(e).context("Control channel write failed")),
                        Ok(Ok(())) => Ok(()),
                        Err(e) => Err(anyhow::anyhow!("Writer task failed: {e}")),
                    };
                }
            }
        };

        let terminated = self.registry.close_all();
        if terminated > 0 {
            tracing::info!("Terminated {} open session(s)", terminated);
        }
        drop(dispatcher);

        match tokio::time::timeout(self.config.shutdown_grace, &mut writer_task).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(e))) => tracing::error!("Failed to flush responses: {}", e),
            Ok(Err(e)) => tracing::error!("Writer task failed: {}", e),
            Err(_) => {
                tracing::warn!(
                    "Responses still pending after {:?}, abandoning them",
                    self.config.shutdown_grace
                );
                writer_task.abort();
            }
        }

        result
    }
}

async fn write_responses<W>(
    mut responses: mpsc::Receiver<ControlResponse>,
    mut sink: FramedWrite<W, ControlCodec>,
) -> Result<(), CodecError>
where
    W: AsyncWrite + Unpin,
{
    while let Some(response) = responses.recv().await {
        let encoded = match serde_json::to_string(&response) {
            Ok(encoded) => encoded,
            Err(e) => {
                tracing::error!("Failed to encode response for {}: {}", response.id(), e);
                continue;
            }
        };
        tracing::info!("Sending message: {}", encoded);
        sink.send(encoded).await?;
    }
    sink.close().await
}
