//! Shared helpers for the relay integration tests.
#![allow(dead_code)]

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use mtls_relay::{Relay, SessionRegistry};
use mtls_relay_common::RelayConfig;
use serde_json::Value;
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, Lines, ReadHalf, WriteHalf},
    task::JoinHandle,
};
use tracing::{level_filters::LevelFilter, Event, Level, Subscriber};
use tracing_subscriber::{
    layer::{Context, SubscriberExt},
    util::SubscriberInitExt,
    Layer,
};

pub const CLIENT_CERT: &str = include_str!("../../../certs/test/client.pem");
pub const CLIENT_KEY: &str = include_str!("../../../certs/test/client.key.pem");
pub const SERVER_CERT: &str = include_str!("../../../certs/test/server.pem");
pub const SERVER_KEY: &str = include_str!("../../../certs/test/server.key.pem");
pub const ROOT_CA: &str = include_str!("../../../certs/test/root-ca.pem");
pub const ROOT_CA_PATH: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/../certs/test/root-ca.pem");

const RESPONSE_TIMEOUT: Duration = Duration::from_secs(10);

/// A relay served over an in-memory pipe, driven like a parent process would.
pub struct RelayHarness {
    requests:  WriteHalf<DuplexStream>,
    responses: Lines<BufReader<ReadHalf<DuplexStream>>>,
    registry:  SessionRegistry,
    task:      JoinHandle<anyhow::Result<()>>,
}

impl RelayHarness {
    pub fn start() -> Self {
        Self::with_config(RelayConfig::new())
    }

    pub fn with_config(config: RelayConfig) -> Self {
        let relay = Relay::new(config).unwrap();
        let registry = relay.registry().clone();

        let (parent, child) = tokio::io::duplex(1 << 20);
        let (child_read, child_write) = tokio::io::split(child);
        let (parent_read, parent_write) = tokio::io::split(parent);

        let task = tokio::spawn(async move { relay.serve(child_read, child_write).await });

        Self {
            requests: parent_write,
            responses: BufReader::new(parent_read).lines(),
            registry,
            task,
        }
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub async fn send(&mut self, message: Value) {
        self.send_raw(&message.to_string()).await;
    }

    pub async fn send_raw(&mut self, line: &str) {
        self.requests.write_all(line.as_bytes()).await.unwrap();
        self.requests.write_all(b"\n").await.unwrap();
        self.requests.flush().await.unwrap();
    }

    pub async fn recv(&mut self) -> Value {
        let line = tokio::time::timeout(RESPONSE_TIMEOUT, self.responses.next_line())
            .await
            .expect("timed out waiting for a response")
            .unwrap()
            .expect("relay closed the channel");
        serde_json::from_str(&line).unwrap()
    }

    /// Assert nothing else arrives within `wait`.
    pub async fn assert_silent(&mut self, wait: Duration) {
        if let Ok(line) = tokio::time::timeout(wait, self.responses.next_line()).await {
            panic!("unexpected response: {line:?}");
        }
    }

    /// Close the parent side and wait for the relay to finish.
    pub async fn shutdown(mut self) -> anyhow::Result<()> {
        self.requests.shutdown().await.unwrap();
        drop(self.requests);
        tokio::time::timeout(RESPONSE_TIMEOUT, self.task)
            .await
            .expect("relay did not shut down")
            .unwrap()
    }
}

/// Poll `condition` until it holds or the response timeout elapses.
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + RESPONSE_TIMEOUT;
    while !condition() {
        assert!(tokio::time::Instant::now() < deadline, "condition not reached in time");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// A captured tracing event.
#[derive(Clone, Debug)]
pub struct CapturedEvent {
    pub level:   Level,
    pub message: String,
    pub fields:  Vec<(String, String)>,
}

/// In-memory store of everything logged while the capture guard is alive.
#[derive(Clone, Default)]
pub struct CapturedLogs {
    events: Arc<Mutex<Vec<CapturedEvent>>>,
}

impl CapturedLogs {
    pub fn events(&self) -> Vec<CapturedEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn has_event(&self, level: Level, message_contains: &str) -> bool {
        self.events
            .lock()
            .unwrap()
            .iter()
            .any(|e| e.level == level && e.message.contains(message_contains))
    }

    /// True if any message or field value contains `needle`.
    pub fn mentions(&self, needle: &str) -> bool {
        self.events.lock().unwrap().iter().any(|e| {
            e.message.contains(needle) || e.fields.iter().any(|(_, value)| value.contains(needle))
        })
    }
}

struct CaptureLayer {
    logs: CapturedLogs,
}

struct FieldVisitor {
    message: String,
    fields:  Vec<(String, String)>,
}

impl tracing::field::Visit for FieldVisitor {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        let value = format!("{value:?}");
        if field.name() == "message" {
            self.message = value;
        } else {
            self.fields.push((field.name().to_owned(), value));
        }
    }

    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        if field.name() == "message" {
            value.clone_into(&mut self.message);
        } else {
            self.fields.push((field.name().to_owned(), value.to_owned()));
        }
    }
}

impl<S: Subscriber> Layer<S> for CaptureLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let mut visitor = FieldVisitor {
            message: String::new(),
            fields:  Vec::new(),
        };
        event.record(&mut visitor);

        self.logs.events.lock().unwrap().push(CapturedEvent {
            level:   *event.metadata().level(),
            message: visitor.message,
            fields:  visitor.fields,
        });
    }
}

/// Capture every event logged on this thread while the guard is alive.
///
/// Tests using this must run on a current-thread runtime so spawned relay
/// tasks log on the same thread.
pub fn capture_logs() -> (CapturedLogs, tracing::subscriber::DefaultGuard) {
    let logs = CapturedLogs::default();
    let subscriber = tracing_subscriber::registry()
        .with(CaptureLayer { logs: logs.clone() })
        .with(LevelFilter::TRACE);
    (logs, subscriber.set_default())
}
