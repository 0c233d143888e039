use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{builder::RangedU64ValueParser, Parser};
use mtls_relay::{logging, Relay};
use mtls_relay_common::{Framing, PeerVerification, RelayConfig, TransportKind};

#[derive(Parser)]
#[command(name = "mtls-relay")]
#[command(about = "Mutual-TLS request and WebSocket relay driven over a parent control channel")]
#[command(version)]
struct Args {
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Append log records to this file instead of stderr
    #[arg(long, env = "MTLS_RELAY_LOG_FILE")]
    log_file: Option<PathBuf>,

    /// Control channel framing: lines | length-delimited
    #[arg(long)]
    framing: Option<Framing>,

    /// Control channel transport: auto | stdio | node-ipc
    #[arg(long)]
    transport: Option<TransportKind>,

    /// Verify server certificates against this PEM bundle
    #[arg(long)]
    ca_bundle: Option<PathBuf>,

    /// Capacity of the outbound response queue
    #[arg(long, value_parser = RangedU64ValueParser::<usize>::new().range(1..))]
    outbound_capacity: Option<usize>,

    /// Largest accepted control record, in bytes
    #[arg(long, value_parser = RangedU64ValueParser::<usize>::new().range(1..))]
    max_frame_bytes: Option<usize>,
}

impl Args {
    fn apply(&self, mut config: RelayConfig) -> RelayConfig {
        if let Some(framing) = self.framing {
            config = config.with_framing(framing);
        }
        if let Some(transport) = self.transport {
            config = config.with_transport(transport);
        }
        if let Some(path) = &self.ca_bundle {
            config = config.with_peer_verification(PeerVerification::CaBundle(path.clone()));
        }
        if let Some(capacity) = self.outbound_capacity {
            config = config.with_outbound_capacity(capacity);
        }
        if let Some(max) = self.max_frame_bytes {
            config = config.with_max_frame_length(max);
        }
        config
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    logging::init_logging(&args.log_level, args.log_file.as_deref())?;

    let config = args.apply(RelayConfig::from_env().context("Invalid relay configuration")?);

    tracing::info!("Starting mtls-relay {} (pid {})", env!("CARGO_PKG_VERSION"), std::process::id());
    match &config.peer_verification {
        PeerVerification::Disabled => tracing::warn!(
            "Server certificate verification is disabled; any certificate presented by a remote endpoint is accepted"
        ),
        PeerVerification::CaBundle(path) => tracing::info!("Verifying server certificates against {:?}", path),
    }

    let relay = Relay::new(config).context("Failed to initialise relay")?;
    relay.run().await?;

    tracing::info!("mtls-relay stopped");
    Ok(())
}
