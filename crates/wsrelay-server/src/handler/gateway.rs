//! Gateway event handler: one client WebSocket event per call.
//!
//! | Event | Action |
//! |---|---|
//! | `CONNECT` | accept |
//! | `DISCONNECT` | remove every subscription and pending request of the connection |
//! | `MESSAGE` `Subscribe` / `Unsubscribe` | add / remove one subscription per subject, stopping at the first error |
//! | `MESSAGE` `Request` | record the pending request, then dispatch the mapped function with the connection id attached |
//! | `MESSAGE` anything else | `UnsupportedMessageType` |

use super::{status_code, HandlerResult};
use crate::invoke::Invoker;
use crate::routes::RoutingMap;
use crate::store::RoutingStore;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};
use wsrelay_core::messages::{RequestPayload, SubjectsPayload};
use wsrelay_core::{decode_message, encode_message, Client, Message, RelayError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum GatewayEventType {
    Connect,
    Disconnect,
    Message,
}

/// One lifecycle event as delivered by the WebSocket gateway.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayEvent {
    pub event_type: GatewayEventType,
    pub connection_id: String,
    pub domain_name: String,
    pub stage: String,
    #[serde(default)]
    pub body: String,
}

impl GatewayEvent {
    pub fn connect(client: &Client) -> Self {
        Self::new(GatewayEventType::Connect, client, String::new())
    }

    pub fn disconnect(client: &Client) -> Self {
        Self::new(GatewayEventType::Disconnect, client, String::new())
    }

    pub fn message(client: &Client, body: impl Into<String>) -> Self {
        Self::new(GatewayEventType::Message, client, body.into())
    }

    fn new(event_type: GatewayEventType, client: &Client, body: String) -> Self {
        Self {
            event_type,
            connection_id: client.connection_id.clone(),
            domain_name: client.domain.clone(),
            stage: client.stage.clone(),
            body,
        }
    }

    /// The connection this event came from.
    pub fn client(&self) -> Client {
        Client::new(&self.connection_id, &self.domain_name, &self.stage)
    }
}

/// What the transport gets back: 200 on success, 500 on any failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayResponse {
    pub status_code: u16,
}

pub struct GatewayHandler {
    store: RoutingStore,
    invoker: Arc<dyn Invoker>,
    routes: Arc<RoutingMap>,
}

impl GatewayHandler {
    pub fn new(store: RoutingStore, invoker: Arc<dyn Invoker>, routes: Arc<RoutingMap>) -> Self {
        Self {
            store,
            invoker,
            routes,
        }
    }

    /// Handle one event and map the outcome to a transport status.
    pub async fn respond(&self, event: &GatewayEvent) -> GatewayResponse {
        let result = self.handle(event).await;
        if let Err(ref e) = result {
            warn!(
                connection_id = %event.connection_id,
                event = ?event.event_type,
                error = %e,
                "gateway event failed"
            );
        }
        GatewayResponse {
            status_code: status_code(&result),
        }
    }

    pub async fn handle(&self, event: &GatewayEvent) -> HandlerResult<()> {
        match event.event_type {
            GatewayEventType::Connect => {
                debug!(connection_id = %event.connection_id, "connect");
                Ok(())
            }
            GatewayEventType::Disconnect => {
                self.store.remove_connection(&event.connection_id).await?;
                Ok(())
            }
            GatewayEventType::Message => {
                let client = event.client();
                match decode_message(event.body.as_bytes())? {
                    Message::Subscribe(p) => self.subscribe(&client, &p).await,
                    Message::Unsubscribe(p) => self.unsubscribe(&client, &p).await,
                    Message::Request(p) => self.request(&client, p).await,
                    msg @ (Message::Response(_) | Message::Publish(_)) => {
                        Err(RelayError::UnsupportedMessageType(msg.kind().to_string()).into())
                    }
                }
            }
        }
    }

    async fn subscribe(&self, client: &Client, p: &SubjectsPayload) -> HandlerResult<()> {
        for subject in p.all() {
            self.store.add_subscription(client, subject).await?;
            info!(connection_id = %client.connection_id, subject = %subject, "subscribed");
        }
        Ok(())
    }

    async fn unsubscribe(&self, client: &Client, p: &SubjectsPayload) -> HandlerResult<()> {
        for subject in p.all() {
            self.store
                .remove_subscription(&client.connection_id, subject)
                .await?;
            info!(connection_id = %client.connection_id, subject = %subject, "unsubscribed");
        }
        Ok(())
    }

    /// Record the pending request before dispatching, so the record exists
    /// however quickly the reply arrives.
    async fn request(&self, client: &Client, mut p: RequestPayload) -> HandlerResult<()> {
        let function = self.routes.resolve(&p.uri)?.to_string();
        let pending = self.store.add_request(client, &p.inbox).await?;

        p.connection_id = Some(client.connection_id.clone());
        let forwarded = encode_message(&Message::Request(p))?;

        if let Err(e) = self.invoker.invoke_async(&function, forwarded).await {
            if let Err(cleanup) = self.store.remove_request(&pending).await {
                warn!(
                    connection_id = %client.connection_id,
                    inbox = %pending.inbox,
                    error = %cleanup,
                    "could not drop request after failed dispatch"
                );
            }
            return Err(e.into());
        }

        info!(
            connection_id = %client.connection_id,
            inbox = %pending.inbox,
            function = %function,
            "request dispatched"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::HandlerError;
    use crate::invoke::InvokeError;
    use crate::store::{KvStore, MemoryKv, StoreError, StoreResult, Table};
    use async_trait::async_trait;
    use serde_json::json;
    use tokio::sync::Mutex;

    #[derive(Default)]
    struct RecordingInvoker {
        calls: Mutex<Vec<(String, Vec<u8>)>>,
        fail: bool,
    }

    #[async_trait]
    impl Invoker for RecordingInvoker {
        async fn invoke_async(&self, function: &str, payload: Vec<u8>) -> Result<(), InvokeError> {
            self.calls.lock().await.push((function.to_string(), payload));
            if self.fail {
                Err(InvokeError::Rejected {
                    function: function.to_string(),
                    status: 429,
                })
            } else {
                Ok(())
            }
        }
    }

    /// Fails every write to the reverse subscription index.
    struct BrokenReverseIndex(MemoryKv);

    #[async_trait]
    impl KvStore for BrokenReverseIndex {
        async fn get(&self, table: Table, key: &str) -> StoreResult<Vec<u8>> {
            self.0.get(table, key).await
        }
        async fn put(&self, table: Table, key: &str, value: Vec<u8>) -> StoreResult<()> {
            if table == Table::SubscriptionsByConnection {
                return Err(StoreError::Backend("unavailable".into()));
            }
            self.0.put(table, key, value).await
        }
        async fn delete(&self, table: Table, key: &str) -> StoreResult<()> {
            self.0.delete(table, key).await
        }
        async fn scan_prefix(
            &self,
            table: Table,
            prefix: &str,
        ) -> StoreResult<Vec<(String, Vec<u8>)>> {
            self.0.scan_prefix(table, prefix).await
        }
        fn backend_name(&self) -> &'static str {
            "broken"
        }
    }

    /// Accepts writes; fails every delete (recording the key) and every scan.
    #[derive(Default)]
    struct FailingRemovals {
        inner: MemoryKv,
        deletes: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl KvStore for FailingRemovals {
        async fn get(&self, table: Table, key: &str) -> StoreResult<Vec<u8>> {
            self.inner.get(table, key).await
        }
        async fn put(&self, table: Table, key: &str, value: Vec<u8>) -> StoreResult<()> {
            self.inner.put(table, key, value).await
        }
        async fn delete(&self, _table: Table, key: &str) -> StoreResult<()> {
            self.deletes.lock().await.push(key.to_string());
            Err(StoreError::Backend("unavailable".into()))
        }
        async fn scan_prefix(
            &self,
            _table: Table,
            _prefix: &str,
        ) -> StoreResult<Vec<(String, Vec<u8>)>> {
            Err(StoreError::Backend("unavailable".into()))
        }
        fn backend_name(&self) -> &'static str {
            "failing-removals"
        }
    }

    fn client(id: &str) -> Client {
        Client::new(id, "example.com", "prod")
    }

    fn routes() -> Arc<RoutingMap> {
        Arc::new([("report", "report")].into_iter().collect())
    }

    fn handler(invoker: Arc<RecordingInvoker>) -> (GatewayHandler, RoutingStore) {
        let store = RoutingStore::new(Arc::new(MemoryKv::new()));
        (GatewayHandler::new(store.clone(), invoker, routes()), store)
    }

    fn body(msg: &Message) -> String {
        String::from_utf8(encode_message(msg).unwrap()).unwrap()
    }

    #[tokio::test]
    async fn connect_is_accepted() {
        let (h, _) = handler(Arc::default());
        let resp = h.respond(&GatewayEvent::connect(&client("c1"))).await;
        assert_eq!(resp.status_code, 200);
    }

    #[tokio::test]
    async fn subscribe_then_unsubscribe() {
        let (h, store) = handler(Arc::default());
        let c1 = client("c1");

        h.handle(&GatewayEvent::message(&c1, body(&Message::subscribe(["a", "b"]))))
            .await
            .unwrap();
        assert_eq!(store.subscriptions_of("c1").await.unwrap().len(), 2);

        h.handle(&GatewayEvent::message(&c1, body(&Message::unsubscribe(["a"]))))
            .await
            .unwrap();
        let left = store.subscriptions_of("c1").await.unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].subject, "b");
    }

    #[tokio::test]
    async fn single_subject_field_is_accepted() {
        let (h, store) = handler(Arc::default());
        h.handle(&GatewayEvent::message(
            &client("c1"),
            r#"{"type":"Subscribe","subject":"orders"}"#,
        ))
        .await
        .unwrap();
        assert_eq!(store.find_subscribers("orders").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn subscribe_stops_at_first_store_error() {
        let kv = Arc::new(BrokenReverseIndex(MemoryKv::new()));
        let store = RoutingStore::new(kv.clone());
        let h = GatewayHandler::new(store, Arc::new(RecordingInvoker::default()), routes());

        let err = h
            .handle(&GatewayEvent::message(
                &client("c1"),
                body(&Message::subscribe(["a", "b"])),
            ))
            .await
            .unwrap_err();
        assert!(matches!(err, HandlerError::Store(_)));

        // First subject's forward key was written, the second subject never attempted.
        assert!(kv.0.get(Table::SubscriptionsBySubject, "a_c1").await.is_ok());
        assert!(kv
            .0
            .get(Table::SubscriptionsBySubject, "b_c1")
            .await
            .unwrap_err()
            .is_not_found());
    }

    #[tokio::test]
    async fn unsubscribe_stops_at_first_store_error() {
        let kv = Arc::new(FailingRemovals::default());
        let store = RoutingStore::new(kv.clone());
        let h = GatewayHandler::new(store, Arc::new(RecordingInvoker::default()), routes());
        let c1 = client("c1");
        h.handle(&GatewayEvent::message(&c1, body(&Message::subscribe(["a", "b"]))))
            .await
            .unwrap();

        let err = h
            .handle(&GatewayEvent::message(&c1, body(&Message::unsubscribe(["a", "b"]))))
            .await
            .unwrap_err();
        assert!(matches!(err, HandlerError::Store(_)));

        assert_eq!(kv.deletes.lock().await.as_slice(), ["a_c1".to_string()]);
        assert!(kv.inner.get(Table::SubscriptionsBySubject, "b_c1").await.is_ok());
        assert!(kv.inner.get(Table::SubscriptionsByConnection, "c1_b").await.is_ok());
    }

    #[tokio::test]
    async fn disconnect_store_failure_is_500() {
        let kv = Arc::new(FailingRemovals::default());
        let h = GatewayHandler::new(
            RoutingStore::new(kv),
            Arc::new(RecordingInvoker::default()),
            routes(),
        );
        let resp = h.respond(&GatewayEvent::disconnect(&client("c1"))).await;
        assert_eq!(resp.status_code, 500);
    }

    #[tokio::test]
    async fn request_records_then_dispatches_with_connection_id() {
        let invoker = Arc::new(RecordingInvoker::default());
        let (h, store) = handler(invoker.clone());
        let c1 = client("c1");

        let msg = Message::request("report.generate", "abc123", json!({"month": 5}));
        h.handle(&GatewayEvent::message(&c1, body(&msg))).await.unwrap();

        assert!(store.find_request("c1", "abc123").await.is_ok());
        let calls = invoker.calls.lock().await;
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, "report");
        match decode_message(&calls[0].1).unwrap() {
            Message::Request(p) => {
                assert_eq!(p.connection_id.as_deref(), Some("c1"));
                assert_eq!(p.inbox, "abc123");
                assert_eq!(p.payload, json!({"month": 5}));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn unmapped_request_writes_nothing() {
        let invoker = Arc::new(RecordingInvoker::default());
        let (h, store) = handler(invoker.clone());

        let msg = Message::request("billing.charge", "i1", json!(null));
        let err = h
            .handle(&GatewayEvent::message(&client("c1"), body(&msg)))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            HandlerError::Protocol(RelayError::MissingFunctionMapping(_))
        ));
        assert!(store.pending_requests_of("c1").await.unwrap().is_empty());
        assert!(invoker.calls.lock().await.is_empty());
    }

    #[tokio::test]
    async fn failed_dispatch_drops_pending_request() {
        let invoker = Arc::new(RecordingInvoker {
            fail: true,
            ..Default::default()
        });
        let (h, store) = handler(invoker);

        let msg = Message::request("report.generate", "i1", json!(null));
        let resp = h.respond(&GatewayEvent::message(&client("c1"), body(&msg))).await;
        assert_eq!(resp.status_code, 500);
        assert!(store.find_request("c1", "i1").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn backend_kinds_and_unknown_types_are_unsupported() {
        let (h, _) = handler(Arc::default());
        let c1 = client("c1");

        for raw in [
            body(&Message::publish("x", json!(1))),
            body(&Message::response("c1", "i", json!(1))),
            r#"{"type":"Ping"}"#.to_string(),
        ] {
            let err = h.handle(&GatewayEvent::message(&c1, raw)).await.unwrap_err();
            assert!(err.is_unsupported_message_type(), "got {err}");
        }
    }

    #[tokio::test]
    async fn malformed_body_fails_with_500() {
        let (h, _) = handler(Arc::default());
        let resp = h
            .respond(&GatewayEvent::message(&client("c1"), "{nope"))
            .await;
        assert_eq!(resp.status_code, 500);
    }

    #[tokio::test]
    async fn disconnect_cleans_up() {
        let (h, store) = handler(Arc::default());
        let c1 = client("c1");
        h.handle(&GatewayEvent::message(&c1, body(&Message::subscribe(["x"]))))
            .await
            .unwrap();
        h.handle(&GatewayEvent::message(
            &c1,
            body(&Message::request("report.a", "i1", json!(null))),
        ))
        .await
        .unwrap();

        h.handle(&GatewayEvent::disconnect(&c1)).await.unwrap();
        assert!(store.find_subscribers("x").await.unwrap().is_empty());
        assert!(store.pending_requests_of("c1").await.unwrap().is_empty());
    }

    #[test]
    fn event_wire_shape() {
        let ev: GatewayEvent = serde_json::from_str(
            r#"{"eventType":"MESSAGE","connectionId":"c1","domainName":"d","stage":"s","body":"{}"}"#,
        )
        .unwrap();
        assert_eq!(ev.event_type, GatewayEventType::Message);
        assert_eq!(ev.client(), Client::new("c1", "d", "s"));
        let resp = serde_json::to_string(&GatewayResponse { status_code: 200 }).unwrap();
        assert_eq!(resp, r#"{"statusCode":200}"#);
    }
}
