//! Connection registry and pending-request registry.
//!
//! Stores subscriptions indexed both by subject (for fan-out) and by
//! connection (for cleanup), and pending RPC requests indexed by
//! connection and inbox.

use super::{KvStore, StoreError, StoreResult, Table};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};
use wsrelay_core::routing::{forward_key, request_key, reverse_key, scan_prefix};
use wsrelay_core::{Client, PendingRequest, Subscription};

/// What a connection cleanup removed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionCleanup {
    pub subscriptions: usize,
    pub requests: usize,
}

/// Logical routing API over a [`KvStore`].
///
/// Holds no state of its own; cloning is cheap and every call goes to the
/// backend.
#[derive(Clone)]
pub struct RoutingStore {
    kv: Arc<dyn KvStore>,
}

impl RoutingStore {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }

    /// The underlying backend.
    pub fn kv(&self) -> &Arc<dyn KvStore> {
        &self.kv
    }

    // ── Subscriptions ───────────────────────────────────────────────

    /// Record `client`'s interest in `subject`.
    ///
    /// Writes the forward key, then the reverse key. A failure on the
    /// second write leaves a forward-only half-pair.
    pub async fn add_subscription(&self, client: &Client, subject: &str) -> StoreResult<()> {
        let sub = Subscription::new(client.clone(), subject);
        let value = encode(&sub)?;
        self.kv
            .put(Table::SubscriptionsBySubject, &sub.forward_key(), value.clone())
            .await?;
        self.kv
            .put(Table::SubscriptionsByConnection, &sub.reverse_key(), value)
            .await?;
        debug!(connection_id = %client.connection_id, subject = %subject, "subscription added");
        Ok(())
    }

    /// Drop one subscription. Absent keys are not an error.
    ///
    /// Deletes the forward key first, so a failure part-way leaves a
    /// reverse-only half-pair.
    pub async fn remove_subscription(&self, connection_id: &str, subject: &str) -> StoreResult<()> {
        self.kv
            .delete(Table::SubscriptionsBySubject, &forward_key(subject, connection_id))
            .await?;
        self.kv
            .delete(Table::SubscriptionsByConnection, &reverse_key(connection_id, subject))
            .await?;
        debug!(connection_id = %connection_id, subject = %subject, "subscription removed");
        Ok(())
    }

    /// All subscribers of `subject`.
    pub async fn find_subscribers(&self, subject: &str) -> StoreResult<Vec<Subscription>> {
        let records: Vec<Subscription> = self
            .scan(Table::SubscriptionsBySubject, &scan_prefix(subject))
            .await?;
        Ok(records.into_iter().filter(|s| s.subject == subject).collect())
    }

    /// All subscriptions held by `connection_id`.
    pub async fn subscriptions_of(&self, connection_id: &str) -> StoreResult<Vec<Subscription>> {
        let records: Vec<Subscription> = self
            .scan(Table::SubscriptionsByConnection, &scan_prefix(connection_id))
            .await?;
        Ok(records
            .into_iter()
            .filter(|s| s.client.connection_id == connection_id)
            .collect())
    }

    /// Remove every subscription and pending request of `connection_id`.
    ///
    /// Stops at the first store error; whatever was removed before it
    /// stays removed.
    pub async fn remove_connection(&self, connection_id: &str) -> StoreResult<ConnectionCleanup> {
        let mut cleanup = ConnectionCleanup::default();

        for sub in self.subscriptions_of(connection_id).await? {
            self.remove_subscription(connection_id, &sub.subject).await?;
            cleanup.subscriptions += 1;
        }

        for req in self.pending_requests_of(connection_id).await? {
            self.remove_request(&req).await?;
            cleanup.requests += 1;
        }

        info!(
            connection_id = %connection_id,
            subscriptions = cleanup.subscriptions,
            requests = cleanup.requests,
            "connection cleaned up"
        );
        Ok(cleanup)
    }

    // ── Pending requests ────────────────────────────────────────────

    /// Record an in-flight request. Re-adding the same inbox overwrites.
    pub async fn add_request(&self, client: &Client, inbox: &str) -> StoreResult<PendingRequest> {
        let req = PendingRequest::new(client.clone(), inbox);
        self.kv
            .put(Table::PendingRequests, &req.key(), encode(&req)?)
            .await?;
        debug!(connection_id = %client.connection_id, inbox = %inbox, "request pending");
        Ok(req)
    }

    /// Look up a pending request; [`StoreError::NotFound`] if absent.
    pub async fn find_request(&self, connection_id: &str, inbox: &str) -> StoreResult<PendingRequest> {
        let key = request_key(connection_id, inbox);
        let data = self.kv.get(Table::PendingRequests, &key).await?;
        decode(Table::PendingRequests, &key, &data)
    }

    pub async fn remove_request(&self, request: &PendingRequest) -> StoreResult<()> {
        self.kv.delete(Table::PendingRequests, &request.key()).await?;
        debug!(
            connection_id = %request.client.connection_id,
            inbox = %request.inbox,
            "request removed"
        );
        Ok(())
    }

    /// All pending requests of `connection_id`.
    pub async fn pending_requests_of(&self, connection_id: &str) -> StoreResult<Vec<PendingRequest>> {
        let records: Vec<PendingRequest> = self
            .scan(Table::PendingRequests, &scan_prefix(connection_id))
            .await?;
        Ok(records
            .into_iter()
            .filter(|r| r.client.connection_id == connection_id)
            .collect())
    }

    /// Prefix scan decoding each record. Undecodable records are skipped.
    async fn scan<T: DeserializeOwned>(&self, table: Table, prefix: &str) -> StoreResult<Vec<T>> {
        let entries = self.kv.scan_prefix(table, prefix).await?;
        let mut out = Vec::with_capacity(entries.len());
        for (key, data) in entries {
            match decode(table, &key, &data) {
                Ok(record) => out.push(record),
                Err(e) => warn!(error = %e, "skipping undecodable record"),
            }
        }
        Ok(out)
    }
}

fn encode<T: Serialize>(record: &T) -> StoreResult<Vec<u8>> {
    serde_json::to_vec(record).map_err(|e| StoreError::Backend(format!("encode failed: {e}")))
}

pub(super) fn decode<T: DeserializeOwned>(table: Table, key: &str, data: &[u8]) -> StoreResult<T> {
    serde_json::from_slice(data).map_err(|e| StoreError::Corrupt {
        table,
        key: key.to_string(),
        reason: e.to_string(),
    })
}
