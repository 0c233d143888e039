//! Streaming sessions.
//!
//! Each session runs in its own task and reports to its owner through an
//! event channel: `Opened`, any number of `Frame`s in network order, then at
//! most one terminal `Error` or `Closed`. The task does not connect until the
//! owner releases its start gate, so the owner can register the session first.

use futures_util::StreamExt;
use mtls_relay_common::{CorrelationId, FramePayload, IdentityContext};
use tokio::{
    net::TcpStream,
    sync::{mpsc, oneshot},
    task::AbortHandle,
};
use tokio_tungstenite::{
    connect_async_tls_with_config,
    tungstenite::{self, protocol::CloseFrame, Message},
    Connector, MaybeTlsStream, WebSocketStream,
};
use url::Url;

use crate::error::RelayError;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Lifecycle of a streaming session. `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Open,
    Closed,
}

/// What a session reports to its owner.
#[derive(Debug)]
pub enum SessionEvent {
    /// Handshake completed
    Opened,
    /// One inbound data frame, unmodified
    Frame(FramePayload),
    /// Connect or transport failure; the session is over
    Error(RelayError),
    /// The connection ended without a transport error
    Closed { code: Option<u16>, reason: String },
}

/// Map an `http(s)` URL onto its WebSocket equivalent.
pub fn websocket_url(raw: &str) -> Result<Url, RelayError> {
    let mut url = Url::parse(raw).map_err(|e| RelayError::MalformedMessage(format!("Invalid URL {raw:?}: {e}")))?;
    let scheme = match url.scheme() {
        "https" | "wss" => "wss",
        "http" | "ws" => "ws",
        other => {
            return Err(RelayError::MalformedMessage(format!(
                "Unsupported scheme for websocket: {other}"
            )))
        }
    };
    if url.scheme() != scheme {
        url.set_scheme(scheme)
            .map_err(|()| RelayError::MalformedMessage(format!("Cannot rewrite scheme of {raw:?}")))?;
    }
    Ok(url)
}

/// A spawned session task that has not been allowed to connect yet.
#[derive(Debug)]
pub struct PendingSession {
    abort:  AbortHandle,
    gate:   oneshot::Sender<()>,
    events: mpsc::Receiver<SessionEvent>,
}

impl PendingSession {
    /// Spawn the task for a session on `url` authenticated with `identity`.
    ///
    /// `capacity` bounds how many events may queue before the network read
    /// waits on the consumer.
    pub fn spawn(id: CorrelationId, url: Url, identity: IdentityContext, capacity: usize) -> Self {
        let (gate_tx, gate_rx) = oneshot::channel();
        let (events_tx, events_rx) = mpsc::channel(capacity.max(1));
        let task = tokio::spawn(run_session(id, url, identity, gate_rx, events_tx));
        Self {
            abort:  task.abort_handle(),
            gate:   gate_tx,
            events: events_rx,
        }
    }

    /// Handle that terminates the session task, and with it the connection.
    pub fn abort_handle(&self) -> AbortHandle {
        self.abort.clone()
    }

    /// Let the session connect and hand back its event stream.
    pub fn start(self) -> mpsc::Receiver<SessionEvent> {
        // The task only goes away before the gate opens if it was aborted.
        let _ = self.gate.send(());
        self.events
    }
}

async fn run_session(
    id: CorrelationId,
    url: Url,
    identity: IdentityContext,
    gate: oneshot::Receiver<()>,
    events: mpsc::Sender<SessionEvent>,
) {
    if gate.await.is_err() {
        tracing::debug!("Session {} dropped before it was started", id);
        return;
    }

    tracing::info!(
        "Session {} connecting to {} (client certificate: {})",
        id,
        url,
        identity.fingerprint().unwrap_or("none")
    );

    let connector = Connector::Rustls(identity.tls_config());
    let ws = match connect_async_tls_with_config(url.as_str(), None, false, Some(connector)).await {
        Ok((ws, _response)) => ws,
        Err(e) => {
            let _ = events.send(SessionEvent::Error(e.into())).await;
            return;
        }
    };

    tracing::info!("✓ Session {} open", id);
    if events.send(SessionEvent::Opened).await.is_err() {
        return;
    }

    let terminal = pump_frames(ws, &events).await;
    let _ = events.send(terminal).await;
}

/// Forward data frames until the connection ends, returning the terminal event.
async fn pump_frames(mut ws: WsStream, events: &mpsc::Sender<SessionEvent>) -> SessionEvent {
    let mut close_frame: Option<CloseFrame> = None;

    while let Some(message) = ws.next().await {
        let payload = match message {
            Ok(Message::Text(text)) => FramePayload::Text(text.as_str().to_owned()),
            Ok(Message::Binary(bytes)) => FramePayload::Binary(bytes.to_vec()),
            Ok(Message::Close(frame)) => {
                close_frame = frame;
                continue;
            }
            Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_)) => continue,
            Err(tungstenite::Error::ConnectionClosed) => break,
            Err(e) => return SessionEvent::Error(e.into()),
        };

        if events.send(SessionEvent::Frame(payload)).await.is_err() {
            break;
        }
    }

    match close_frame {
        Some(frame) => SessionEvent::Closed {
            code:   Some(u16::from(frame.code)),
            reason: frame.reason.as_str().to_owned(),
        },
        None => SessionEvent::Closed {
            code:   None,
            reason: String::new(),
        },
    }
}

#[cfg(test)]
mod tests {
    use futures_util::SinkExt;
    use mtls_relay_common::TrustPolicy;
    use tokio::net::TcpListener;
    use tokio_tungstenite::{accept_async, tungstenite::protocol::frame::coding::CloseCode};

    use super::*;
    use crate::error::ErrorKind;

    fn anonymous() -> IdentityContext {
        IdentityContext::anonymous(&TrustPolicy::AcceptAny).unwrap()
    }

    #[test]
    fn rewrites_http_schemes() {
        assert_eq!(websocket_url("https://a/ws").unwrap().as_str(), "wss://a/ws");
        assert_eq!(websocket_url("http://a:8080/x?y=1").unwrap().as_str(), "ws://a:8080/x?y=1");
        assert_eq!(websocket_url("wss://a/ws").unwrap().as_str(), "wss://a/ws");
        assert_eq!(websocket_url("ws://a/ws").unwrap().as_str(), "ws://a/ws");
    }

    #[test]
    fn rejects_other_schemes() {
        let err = websocket_url("ftp://a/x").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MalformedMessage);
        assert!(websocket_url("nonsense").is_err());
    }

    #[tokio::test]
    async fn delivers_frames_in_order_then_close() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            ws.send(Message::text("hello")).await.unwrap();
            ws.send(Message::binary(vec![1u8, 2, 3])).await.unwrap();
            ws.send(Message::text("world")).await.unwrap();
            ws.close(Some(CloseFrame {
                code:   CloseCode::Normal,
                reason: "bye".into(),
            }))
            .await
            .unwrap();
            while ws.next().await.is_some() {}
        });

        let url = websocket_url(&format!("http://{addr}/")).unwrap();
        let mut events = PendingSession::spawn(CorrelationId::from(3), url, anonymous(), 8).start();

        assert!(matches!(events.recv().await, Some(SessionEvent::Opened)));
        assert!(matches!(events.recv().await, Some(SessionEvent::Frame(FramePayload::Text(t))) if t == "hello"));
        assert!(matches!(events.recv().await, Some(SessionEvent::Frame(FramePayload::Binary(b))) if b == [1, 2, 3]));
        assert!(matches!(events.recv().await, Some(SessionEvent::Frame(FramePayload::Text(t))) if t == "world"));
        match events.recv().await {
            Some(SessionEvent::Closed { code, reason }) => {
                assert_eq!(code, Some(1000));
                assert_eq!(reason, "bye");
            }
            other => panic!("expected close, got {other:?}"),
        }
        assert!(events.recv().await.is_none());
    }

    #[tokio::test]
    async fn failed_connect_is_reported_as_error() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let url = websocket_url(&format!("https://127.0.0.1:{port}/ws")).unwrap();
        let mut events = PendingSession::spawn(CorrelationId::from(1), url, anonymous(), 8).start();

        match events.recv().await {
            Some(SessionEvent::Error(err)) => assert_eq!(err.kind(), ErrorKind::Transport),
            other => panic!("expected error, got {other:?}"),
        }
        assert!(events.recv().await.is_none());
    }

    #[tokio::test]
    async fn does_not_connect_until_started() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let url = websocket_url(&format!("http://{addr}/")).unwrap();
        let pending = PendingSession::spawn(CorrelationId::from(5), url, anonymous(), 8);

        let early = tokio::time::timeout(std::time::Duration::from_millis(100), listener.accept()).await;
        assert!(early.is_err(), "session connected before its gate was opened");

        pending.abort_handle().abort();
        let mut events = pending.start();
        assert!(events.recv().await.is_none());
    }
}
