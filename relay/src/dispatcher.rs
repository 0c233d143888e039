use mtls_relay_common::{
    protocol::{redact, FetchRequest, WebSocketClose, WebSocketOpen},
    ControlMessage, ControlResponse, CorrelationId, IdentityContext, MessageKind, RequestOutcome, TrustPolicy,
};
use serde_json::Value;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::{
    error::RelayError,
    executor::RequestExecutor,
    registry::{SessionHandle, SessionRegistry},
    session::{websocket_url, PendingSession, SessionEvent, SessionState},
};

/// Routes inbound control messages and produces correlated responses.
///
/// Handling one message never fails the dispatcher: every fault becomes an
/// error response carrying the message's id. Fetches and session I/O run in
/// their own tasks, so a slow remote never delays the next message.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    trust:            TrustPolicy,
    executor:         RequestExecutor,
    registry:         SessionRegistry,
    outbound:         mpsc::Sender<ControlResponse>,
    session_capacity: usize,
}

impl Dispatcher {
    pub fn new(
        trust: TrustPolicy,
        registry: SessionRegistry,
        outbound: mpsc::Sender<ControlResponse>,
        session_capacity: usize,
    ) -> Self {
        Self {
            trust,
            executor: RequestExecutor::new(),
            registry,
            outbound,
            session_capacity,
        }
    }

    /// Handle the JSON text of one inbound control record.
    pub async fn dispatch(&self, raw: &str) {
        let value: Value = match serde_json::from_str(raw) {
            Ok(value) => value,
            Err(e) => {
                tracing::error!("Received unparseable message ({} bytes): {}", raw.len(), e);
                let error = RelayError::MalformedMessage(format!("Invalid JSON: {e}"));
                report(&self.outbound, Value::Null, None, error).await;
                return;
            }
        };

        tracing::info!("Received message: {}", redact(&value));

        let message = match ControlMessage::from_value(value) {
            Ok(message) => message,
            Err(e) => {
                let (id, tag) = (e.echo_id(), e.tag.clone());
                report(&self.outbound, id, tag, e.into()).await;
                return;
            }
        };

        match message {
            ControlMessage::Fetch(request) => self.fetch(request),
            ControlMessage::WebSocketOpen(open) => self.open_session(open).await,
            ControlMessage::WebSocketClose(close) => self.close_session(close).await,
        }
    }

    fn fetch(&self, request: FetchRequest) {
        let id = request.id.clone();
        let outbound = self.outbound.clone();
        let task = tokio::spawn(run_fetch(self.executor.clone(), self.trust.clone(), request));

        tokio::spawn(async move {
            match task.await {
                Ok(Ok(payload)) => send(&outbound, ControlResponse::FetchResult { id, payload }).await,
                Ok(Err(e)) => report(&outbound, id, Some(MessageKind::Fetch.as_str().into()), e).await,
                Err(e) => {
                    let error = RelayError::Unhandled(format!("Request task failed: {e}"));
                    report(&outbound, id, Some(MessageKind::Fetch.as_str().into()), error).await;
                }
            }
        });
    }

    async fn open_session(&self, open: WebSocketOpen) {
        let WebSocketOpen { id, url, credentials } = open;

        let prepared = websocket_url(&url).and_then(|url| {
            let identity = IdentityContext::new(credentials.as_ref(), &self.trust)?;
            Ok((url, identity))
        });
        let (url, identity) = match prepared {
            Ok(prepared) => prepared,
            Err(e) => {
                report(&self.outbound, id, Some(MessageKind::WebSocket.as_str().into()), e).await;
                return;
            }
        };

        let pending = PendingSession::spawn(id.clone(), url, identity, self.session_capacity);
        let generation = self
            .registry
            .insert(id.clone(), SessionHandle::new(pending.abort_handle()));
        let events = pending.start();

        tokio::spawn(deliver_events(
            id,
            generation,
            events,
            self.registry.clone(),
            self.outbound.clone(),
        ));
    }

    async fn close_session(&self, close: WebSocketClose) {
        if let Err(e) = self.registry.close(&close.id) {
            report(
                &self.outbound,
                close.id,
                Some(MessageKind::WebSocketClose.as_str().into()),
                e,
            )
            .await;
        }
    }
}

async fn run_fetch(
    executor: RequestExecutor,
    trust: TrustPolicy,
    request: FetchRequest,
) -> Result<RequestOutcome, RelayError> {
    let identity = IdentityContext::new(request.credentials.as_ref(), &trust)?;
    executor
        .execute(&request.url, &request.method, request.body, &identity)
        .await
}

/// Forward one session's events to the parent until the session ends, then
/// drop its registry entry.
///
/// Events that arrive after the session was closed or replaced are dropped.
async fn deliver_events(
    id: CorrelationId,
    generation: Uuid,
    mut events: mpsc::Receiver<SessionEvent>,
    registry: SessionRegistry,
    outbound: mpsc::Sender<ControlResponse>,
) {
    while let Some(event) = events.recv().await {
        if !registry.is_current(&id, generation) {
            tracing::debug!("Dropping {:?} for session {} after it was closed", event, id);
            continue;
        }

        match event {
            SessionEvent::Opened => {
                registry.set_state(&id, generation, SessionState::Open);
            }
            SessionEvent::Frame(payload) => {
                send(&outbound, ControlResponse::WebSocketFrame { id: id.clone(), payload }).await;
            }
            SessionEvent::Error(e) => {
                registry.set_state(&id, generation, SessionState::Closed);
                report(&outbound, id.clone(), Some(MessageKind::WebSocket.as_str().into()), e).await;
            }
            SessionEvent::Closed { code, reason } => {
                registry.set_state(&id, generation, SessionState::Closed);
                match code {
                    Some(code) => tracing::info!("Session {} closed by remote: code {} reason {:?}", id, code, reason),
                    None => tracing::info!("Session {} closed by remote without a close frame", id),
                }
            }
        }
    }

    if registry.remove_if_current(&id, generation) {
        tracing::debug!("Session {} removed from registry", id);
    }
}

async fn report(
    outbound: &mpsc::Sender<ControlResponse>,
    id: impl Into<Value>,
    kind: Option<String>,
    error: RelayError,
) {
    let id = id.into();
    if id.is_null() {
        tracing::error!("{} error handling message without id: {}", error.kind(), error);
    } else {
        tracing::error!("{} error handling message {}: {}", error.kind(), id, error);
    }
    send(outbound, ControlResponse::error(id, kind, &error)).await;
}

async fn send(outbound: &mpsc::Sender<ControlResponse>, response: ControlResponse) {
    if let Err(e) = outbound.send(response).await {
        tracing::warn!("Control channel closed, dropping response for {}", e.0.id());
    }
}

#[cfg(test)]
mod tests {
    use mtls_relay_common::FramePayload;
    use serde_json::json;
    use wiremock::{matchers::method, Mock, MockServer, ResponseTemplate};

    use super::*;

    fn dispatcher() -> (Dispatcher, SessionRegistry, mpsc::Receiver<ControlResponse>) {
        let (tx, rx) = mpsc::channel(16);
        let registry = SessionRegistry::new();
        (Dispatcher::new(TrustPolicy::AcceptAny, registry.clone(), tx, 16), registry, rx)
    }

    async fn next_json(rx: &mut mpsc::Receiver<ControlResponse>) -> Value {
        serde_json::to_value(rx.recv().await.unwrap()).unwrap()
    }

    #[tokio::test]
    async fn unknown_type_names_the_tag() {
        let (dispatcher, _, mut rx) = dispatcher();
        dispatcher.dispatch(r#"{"type":"bogus","id":4}"#).await;
        assert_eq!(
            next_json(&mut rx).await,
            json!({"id": 4, "type": "bogus", "error": "Invalid message type: bogus"})
        );
    }

    #[tokio::test]
    async fn unparseable_input_is_reported_without_id() {
        let (dispatcher, _, mut rx) = dispatcher();
        dispatcher.dispatch("{not json").await;
        let response = next_json(&mut rx).await;
        assert_eq!(response["id"], Value::Null);
        assert_eq!(response["type"], Value::Null);
        assert!(response["error"].as_str().unwrap().starts_with("Invalid JSON"));
    }

    #[tokio::test]
    async fn unusable_ids_are_echoed_as_sent() {
        let (dispatcher, _, mut rx) = dispatcher();

        dispatcher.dispatch(r#"{"type":"fetch","id":true,"url":"https://a"}"#).await;
        let response = next_json(&mut rx).await;
        assert_eq!(response["id"], json!(true));
        assert_eq!(response["type"], "fetch");

        dispatcher.dispatch(r#"{"type":"websocket_close","id":{"a":1}}"#).await;
        let response = next_json(&mut rx).await;
        assert_eq!(response["id"], json!({"a": 1}));
        assert_eq!(response["type"], "websocket_close");
    }

    #[tokio::test]
    async fn closing_unknown_session_is_an_error() {
        let (dispatcher, _, mut rx) = dispatcher();
        dispatcher.dispatch(r#"{"type":"websocket_close","id":"nope"}"#).await;
        assert_eq!(
            next_json(&mut rx).await,
            json!({"id": "nope", "type": "websocket_close", "error": "No open websocket with id nope"})
        );
    }

    #[tokio::test]
    async fn malformed_fetch_keeps_its_id() {
        let (dispatcher, _, mut rx) = dispatcher();
        dispatcher
            .dispatch(r#"{"type":"fetch","id":9,"url":"https://a","keyPem":"secret"}"#)
            .await;
        let response = next_json(&mut rx).await;
        assert_eq!(response["id"], 9);
        assert_eq!(response["type"], "fetch");
        assert!(!response.to_string().contains("secret"));
    }

    #[tokio::test]
    async fn fetch_results_are_correlated() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": true})))
            .mount(&server)
            .await;

        let (dispatcher, _, mut rx) = dispatcher();
        let message = json!({"type": "fetch", "id": 1, "url": server.uri(), "method": "GET"});
        dispatcher.dispatch(&message.to_string()).await;
        assert_eq!(
            next_json(&mut rx).await,
            json!({"id": 1, "type": "fetch", "response": {"ok": true}})
        );
    }

    #[tokio::test]
    async fn bad_websocket_url_is_reported() {
        let (dispatcher, registry, mut rx) = dispatcher();
        dispatcher
            .dispatch(r#"{"type":"websocket","id":3,"url":"ftp://a/ws"}"#)
            .await;
        let response = next_json(&mut rx).await;
        assert_eq!(response["id"], 3);
        assert_eq!(response["type"], "websocket");
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn frames_for_a_replaced_session_are_dropped() {
        let registry = SessionRegistry::new();
        let id = CorrelationId::from(7);
        let idle = tokio::spawn(std::future::pending::<()>());
        let current = registry.insert(id.clone(), SessionHandle::new(idle.abort_handle()));

        let (events_tx, events_rx) = mpsc::channel(4);
        let (out_tx, mut out_rx) = mpsc::channel(4);
        events_tx
            .send(SessionEvent::Frame(FramePayload::Text("late".into())))
            .await
            .unwrap();
        drop(events_tx);

        deliver_events(id.clone(), Uuid::new_v4(), events_rx, registry.clone(), out_tx).await;

        assert!(out_rx.recv().await.is_none());
        assert!(registry.is_current(&id, current));
    }

    #[tokio::test]
    async fn terminated_session_leaves_the_registry() {
        let registry = SessionRegistry::new();
        let id = CorrelationId::from(8);
        let idle = tokio::spawn(std::future::pending::<()>());
        let generation = registry.insert(id.clone(), SessionHandle::new(idle.abort_handle()));

        let (events_tx, events_rx) = mpsc::channel(4);
        let (out_tx, mut out_rx) = mpsc::channel(4);
        events_tx.send(SessionEvent::Opened).await.unwrap();
        events_tx
            .send(SessionEvent::Frame(FramePayload::Text("hi".into())))
            .await
            .unwrap();
        events_tx
            .send(SessionEvent::Closed {
                code:   Some(1000),
                reason: "done".into(),
            })
            .await
            .unwrap();
        drop(events_tx);

        deliver_events(id.clone(), generation, events_rx, registry.clone(), out_tx).await;

        assert_eq!(
            serde_json::to_value(out_rx.recv().await.unwrap()).unwrap(),
            json!({"id": 8, "type": "websocket", "message": "hi"})
        );
        assert!(out_rx.recv().await.is_none());
        assert!(!registry.contains(&id));
    }
}
