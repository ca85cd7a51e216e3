//! End-to-end flows across both handlers, a shared store and the local
//! delivery table.

use async_trait::async_trait;
use futures_util::{SinkExt, Stream, StreamExt};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use wsrelay_core::{encode_message, Client, Message};
use wsrelay_server::config::{parse, Overrides, ServerConfig};
use wsrelay_server::delivery::{Delivery, DeliveryError, LocalConnections};
use wsrelay_server::handler::{
    BackendHandler, BackendOutcome, GatewayEvent, GatewayHandler, HandlerError,
};
use wsrelay_server::invoke::{InvokeError, Invoker};
use wsrelay_server::routes::RoutingMap;
use wsrelay_server::server::RelayServer;
use wsrelay_server::store::{DirKv, KvStore, MemoryKv, RoutingStore};

#[derive(Default)]
struct RecordingInvoker {
    calls: Mutex<Vec<(String, Value)>>,
}

#[async_trait]
impl Invoker for RecordingInvoker {
    async fn invoke_async(&self, function: &str, payload: Vec<u8>) -> Result<(), InvokeError> {
        let body = serde_json::from_slice(&payload).map_err(|e| InvokeError::Transport(e.to_string()))?;
        self.calls.lock().await.push((function.to_string(), body));
        Ok(())
    }
}

/// Counts pushes and forwards them to the real local table.
struct CountingDelivery {
    inner: Arc<LocalConnections>,
    attempts: Mutex<usize>,
}

#[async_trait]
impl Delivery for CountingDelivery {
    async fn push(&self, client: &Client, data: &[u8]) -> Result<(), DeliveryError> {
        *self.attempts.lock().await += 1;
        self.inner.push(client, data).await
    }
}

struct Relay {
    store: RoutingStore,
    gateway: GatewayHandler,
    backend: BackendHandler,
    connections: Arc<LocalConnections>,
    delivery: Arc<CountingDelivery>,
    invoker: Arc<RecordingInvoker>,
}

impl Relay {
    fn new(kv: Arc<dyn KvStore>) -> Self {
        let store = RoutingStore::new(kv);
        let connections = Arc::new(LocalConnections::new());
        let delivery = Arc::new(CountingDelivery {
            inner: connections.clone(),
            attempts: Mutex::new(0),
        });
        let invoker = Arc::new(RecordingInvoker::default());
        let routes: RoutingMap = [("report", "report")].into_iter().collect();
        Self {
            gateway: GatewayHandler::new(store.clone(), invoker.clone(), Arc::new(routes)),
            backend: BackendHandler::new(store.clone(), delivery.clone()),
            store,
            connections,
            delivery,
            invoker,
        }
    }

    async fn connect(&self, id: &str) -> (Client, mpsc::Receiver<Vec<u8>>) {
        let client = Client::new(id, "example.com", "prod");
        let rx = self.connections.register(id).await;
        let status = self.gateway.respond(&GatewayEvent::connect(&client)).await;
        assert_eq!(status.status_code, 200);
        (client, rx)
    }

    async fn send(&self, client: &Client, msg: &Message) -> u16 {
        let body = String::from_utf8(encode_message(msg).unwrap()).unwrap();
        self.gateway
            .respond(&GatewayEvent::message(client, body))
            .await
            .status_code
    }

    async fn disconnect(&self, client: &Client) {
        self.connections.unregister(&client.connection_id).await;
        let status = self.gateway.respond(&GatewayEvent::disconnect(client)).await;
        assert_eq!(status.status_code, 200);
    }
}

#[tokio::test]
async fn publish_reaches_all_subscribers() {
    let relay = Relay::new(Arc::new(MemoryKv::new()));
    let (a, mut rx_a) = relay.connect("A").await;
    let (b, mut rx_b) = relay.connect("B").await;
    let (_c, mut rx_c) = relay.connect("C").await;

    assert_eq!(relay.send(&a, &Message::subscribe(["orders"])).await, 200);
    assert_eq!(relay.send(&b, &Message::subscribe(["orders"])).await, 200);

    let outcome = relay
        .backend
        .handle(Message::publish("orders", json!({"id": 1})))
        .await
        .unwrap();
    assert!(matches!(outcome, BackendOutcome::Published(r) if r.delivered == 2));

    assert_eq!(rx_a.recv().await.unwrap(), br#"{"id":1}"#);
    assert_eq!(rx_b.recv().await.unwrap(), br#"{"id":1}"#);
    assert!(rx_c.try_recv().is_err());
}

#[tokio::test]
async fn request_response_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let relay = Relay::new(Arc::new(DirKv::open(dir.path()).unwrap()));
    let (a, mut rx_a) = relay.connect("A").await;

    let status = relay
        .send(&a, &Message::request("report.generate", "abc123", json!({"month": 5})))
        .await;
    assert_eq!(status, 200);

    let calls = relay.invoker.calls.lock().await.clone();
    assert_eq!(calls.len(), 1);
    let (function, body) = &calls[0];
    assert_eq!(function, "report");
    assert_eq!(body["connection_id"], "A");
    assert_eq!(body["inbox"], "abc123");
    assert_eq!(body["payload"], json!({"month": 5}));

    let response = Message::response("A", "abc123", json!({"rows": 3}));
    relay.backend.handle(response.clone()).await.unwrap();
    assert_eq!(rx_a.recv().await.unwrap(), br#"{"rows":3}"#);

    let err = relay.backend.handle(response).await.unwrap_err();
    assert!(matches!(err, HandlerError::RequestNotFound { .. }));
    assert!(rx_a.try_recv().is_err());
}

#[tokio::test]
async fn long_subject_on_directory_store() {
    let dir = tempfile::tempdir().unwrap();
    let relay = Relay::new(Arc::new(DirKv::open(dir.path()).unwrap()));
    let (a, mut rx_a) = relay.connect("0123456789abcdef0123456789abcdef").await;
    let subject = "s".repeat(100);

    assert_eq!(relay.send(&a, &Message::subscribe([subject.clone()])).await, 200);
    assert_eq!(relay.store.subscriptions_of(&a.connection_id).await.unwrap().len(), 1);

    relay
        .backend
        .handle(Message::publish(subject, json!("hi")))
        .await
        .unwrap();
    assert_eq!(rx_a.recv().await.unwrap(), br#""hi""#);
}

#[tokio::test]
async fn disconnect_stops_delivery() {
    let relay = Relay::new(Arc::new(MemoryKv::new()));
    let (a, _rx) = relay.connect("A").await;
    relay.send(&a, &Message::subscribe(["x"])).await;
    relay
        .send(&a, &Message::request("report.daily", "i1", json!(null)))
        .await;
    relay.disconnect(&a).await;

    relay
        .backend
        .handle(Message::publish("x", json!("ping")))
        .await
        .unwrap();
    assert_eq!(*relay.delivery.attempts.lock().await, 0);
    assert!(relay.store.pending_requests_of("A").await.unwrap().is_empty());
}

#[tokio::test]
async fn vanished_socket_is_pruned_on_publish() {
    let relay = Relay::new(Arc::new(MemoryKv::new()));
    let (a, rx_a) = relay.connect("A").await;
    let (b, mut rx_b) = relay.connect("B").await;
    relay.send(&a, &Message::subscribe(["x"])).await;
    relay.send(&b, &Message::subscribe(["x"])).await;

    // Socket gone without a DISCONNECT event.
    drop(rx_a);
    relay.connections.unregister("A").await;

    let outcome = relay
        .backend
        .handle(Message::publish("x", json!(1)))
        .await
        .unwrap();
    match outcome {
        BackendOutcome::Published(report) => {
            assert_eq!(report.delivered, 1);
            assert_eq!(report.gone, vec!["A".to_string()]);
        }
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(rx_b.recv().await.unwrap(), b"1");

    let remaining = relay.store.find_subscribers("x").await.unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].client.connection_id, "B");
}

#[tokio::test]
async fn unknown_api_is_rejected_without_state() {
    let relay = Relay::new(Arc::new(MemoryKv::new()));
    let (a, _rx) = relay.connect("A").await;
    let status = relay
        .send(&a, &Message::request("billing.charge", "i1", json!({})))
        .await;
    assert_eq!(status, 500);
    assert!(relay.invoker.calls.lock().await.is_empty());
    assert!(relay.store.pending_requests_of("A").await.unwrap().is_empty());
}

async fn next_text<S>(ws: &mut S) -> Option<String>
where
    S: Stream<Item = Result<WsMessage, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    loop {
        match ws.next().await? {
            Ok(WsMessage::Text(t)) => return Some(t),
            Ok(WsMessage::Close(_)) | Err(_) => return None,
            Ok(_) => continue,
        }
    }
}

#[tokio::test]
async fn server_relays_publish_over_websockets() {
    let file = parse("[server]\nport = 0\nbackend_port = 0").unwrap();
    let config = ServerConfig::resolve(file, Overrides::default());
    let listening = RelayServer::new(config, Arc::new(MemoryKv::new()))
        .start()
        .await
        .unwrap();

    let client_url = format!("ws://127.0.0.1:{}", listening.client_addr.port());
    let backend_url = format!("ws://127.0.0.1:{}", listening.backend_addr.port());
    let (mut client, _) = tokio_tungstenite::connect_async(client_url).await.unwrap();
    let (mut backend, _) = tokio_tungstenite::connect_async(backend_url).await.unwrap();

    let subscribe = String::from_utf8(encode_message(&Message::subscribe(["news"])).unwrap()).unwrap();
    client.send(WsMessage::Text(subscribe)).await.unwrap();

    let publish =
        String::from_utf8(encode_message(&Message::publish("news", json!({"h": "hi"}))).unwrap())
            .unwrap();

    // The subscribe is handled in its own task; publish until it lands.
    let mut received = None;
    for _ in 0..50 {
        backend.send(WsMessage::Text(publish.clone())).await.unwrap();
        let ack: Value = serde_json::from_str(&next_text(&mut backend).await.unwrap()).unwrap();
        assert_eq!(ack["statusCode"], 200);

        if let Ok(Some(text)) =
            tokio::time::timeout(Duration::from_millis(100), next_text(&mut client)).await
        {
            received = Some(text);
            break;
        }
    }
    assert_eq!(received.as_deref(), Some(r#"{"h":"hi"}"#));

    backend
        .send(WsMessage::Text(r#"{"type":"Subscribe","subjects":["x"]}"#.into()))
        .await
        .unwrap();
    let ack: Value = serde_json::from_str(&next_text(&mut backend).await.unwrap()).unwrap();
    assert_eq!(ack["statusCode"], 500);

    listening.shutdown();
}
