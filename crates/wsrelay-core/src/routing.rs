//! Routing records persisted by the store, and the keys they live under.
//!
//! A [`Subscription`] is stored twice: under its forward key
//! (`subject_connection`) for fan-out lookups and under its reverse key
//! (`connection_subject`) for connection cleanup. A [`PendingRequest`] is
//! stored once under `connection_inbox`.

use serde::{Deserialize, Serialize};

/// Separator between the two halves of every store key.
pub const KEY_SEPARATOR: char = '_';

/// A live WebSocket connection and the coordinates needed to push to it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Client {
    pub connection_id: String,
    pub domain: String,
    pub stage: String,
}

impl Client {
    pub fn new(
        connection_id: impl Into<String>,
        domain: impl Into<String>,
        stage: impl Into<String>,
    ) -> Self {
        Self {
            connection_id: connection_id.into(),
            domain: domain.into(),
            stage: stage.into(),
        }
    }
}

/// A client's interest in a subject.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Subscription {
    pub client: Client,
    pub subject: String,
}

impl Subscription {
    pub fn new(client: Client, subject: impl Into<String>) -> Self {
        Self {
            client,
            subject: subject.into(),
        }
    }

    pub fn forward_key(&self) -> String {
        forward_key(&self.subject, &self.client.connection_id)
    }

    pub fn reverse_key(&self) -> String {
        reverse_key(&self.client.connection_id, &self.subject)
    }
}

/// An in-flight RPC call awaiting its reply.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PendingRequest {
    pub client: Client,
    pub inbox: String,
}

impl PendingRequest {
    pub fn new(client: Client, inbox: impl Into<String>) -> Self {
        Self {
            client,
            inbox: inbox.into(),
        }
    }

    pub fn key(&self) -> String {
        request_key(&self.client.connection_id, &self.inbox)
    }
}

fn join(head: &str, tail: &str) -> String {
    let mut key = String::with_capacity(head.len() + 1 + tail.len());
    key.push_str(head);
    key.push(KEY_SEPARATOR);
    key.push_str(tail);
    key
}

/// `subject_connection`
pub fn forward_key(subject: &str, connection_id: &str) -> String {
    join(subject, connection_id)
}

/// `connection_subject`
pub fn reverse_key(connection_id: &str, subject: &str) -> String {
    join(connection_id, subject)
}

/// `connection_inbox`
pub fn request_key(connection_id: &str, inbox: &str) -> String {
    join(connection_id, inbox)
}

/// Scan prefix selecting every key whose head is `head`.
///
/// Heads may themselves contain the separator, so a scan on `a` also
/// returns keys for head `a_b`; callers filter decoded records by exact
/// field equality.
pub fn scan_prefix(head: &str) -> String {
    let mut prefix = String::with_capacity(head.len() + 1);
    prefix.push_str(head);
    prefix.push(KEY_SEPARATOR);
    prefix
}
