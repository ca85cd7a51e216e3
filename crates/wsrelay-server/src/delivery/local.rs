//! Outbound channels of the connections this process holds open.
//!
//! Each accepted WebSocket registers a bounded `mpsc` channel drained by its
//! socket loop. Pushing never waits: a full queue is a transport error and
//! the frame is dropped.

use super::{Delivery, DeliveryError};
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::{mpsc, RwLock};
use tracing::debug;
use wsrelay_core::Client;

/// Outbound queue depth per connection.
const OUTBOUND_QUEUE: usize = 256;

#[derive(Debug, Default)]
pub struct LocalConnections {
    senders: RwLock<HashMap<String, mpsc::Sender<Vec<u8>>>>,
}

impl LocalConnections {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection and return the receiver its socket loop drains.
    pub async fn register(&self, connection_id: &str) -> mpsc::Receiver<Vec<u8>> {
        let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE);
        self.senders
            .write()
            .await
            .insert(connection_id.to_string(), tx);
        debug!(connection_id = %connection_id, "connection registered");
        rx
    }

    pub async fn unregister(&self, connection_id: &str) {
        if self.senders.write().await.remove(connection_id).is_some() {
            debug!(connection_id = %connection_id, "connection unregistered");
        }
    }

    pub async fn count(&self) -> usize {
        self.senders.read().await.len()
    }
}

#[async_trait]
impl Delivery for LocalConnections {
    async fn push(&self, client: &Client, data: &[u8]) -> Result<(), DeliveryError> {
        let senders = self.senders.read().await;
        let Some(tx) = senders.get(&client.connection_id) else {
            return Err(DeliveryError::Gone(client.connection_id.clone()));
        };
        tx.try_send(data.to_vec()).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                DeliveryError::Transport(format!("outbound queue full: {}", client.connection_id))
            }
            mpsc::error::TrySendError::Closed(_) => {
                DeliveryError::Gone(client.connection_id.clone())
            }
        })
    }
}

/// Random connection identifier (16 bytes, hex).
pub fn generate_connection_id() -> String {
    use rand::Rng;
    let mut rng = rand::thread_rng();
    let bytes: Vec<u8> = (0..16).map(|_| rng.gen()).collect();
    hex::encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(id: &str) -> Client {
        Client::new(id, "localhost", "local")
    }

    #[tokio::test]
    async fn push_reaches_registered_connection() {
        let conns = LocalConnections::new();
        let mut rx = conns.register("c1").await;
        conns.push(&client("c1"), b"hello").await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), b"hello");
    }

    #[tokio::test]
    async fn unknown_connection_is_gone() {
        let conns = LocalConnections::new();
        let err = conns.push(&client("nobody"), b"x").await.unwrap_err();
        assert!(err.is_gone());
    }

    #[tokio::test]
    async fn dropped_receiver_is_gone() {
        let conns = LocalConnections::new();
        drop(conns.register("c1").await);
        let err = conns.push(&client("c1"), b"x").await.unwrap_err();
        assert!(err.is_gone());
    }

    #[tokio::test]
    async fn full_queue_is_transport_error() {
        let conns = LocalConnections::new();
        let _rx = conns.register("c1").await;
        for _ in 0..OUTBOUND_QUEUE {
            conns.push(&client("c1"), b"x").await.unwrap();
        }
        let err = conns.push(&client("c1"), b"x").await.unwrap_err();
        assert!(!err.is_gone());
    }

    #[tokio::test]
    async fn unregister_removes() {
        let conns = LocalConnections::new();
        let _rx = conns.register("c1").await;
        assert_eq!(conns.count().await, 1);
        conns.unregister("c1").await;
        assert_eq!(conns.count().await, 0);
    }

    #[test]
    fn connection_ids_are_unique_hex() {
        let a = generate_connection_id();
        let b = generate_connection_id();
        assert_eq!(a.len(), 32);
        assert_ne!(a, b);
    }
}
