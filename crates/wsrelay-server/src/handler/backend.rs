//! Backend message handler: one `Response` or `Publish` per call.
//!
//! A `Response` is matched to its pending request by `(connection_id,
//! inbox)`, pushed to that connection, and the pending record dropped once
//! the push succeeds. A `Publish` is pushed to every current subscriber of
//! its subject.
//!
//! A push that fails with [`DeliveryError::Gone`] means the client left
//! without a clean disconnect. When stale pruning is on, that connection's
//! subscriptions and pending requests are removed on the spot. During a
//! publish a gone subscriber never stops the fan-out; other delivery
//! failures are handled per [`FanoutPolicy`].

use super::{HandlerError, HandlerResult};
use crate::delivery::{Delivery, DeliveryError};
use crate::store::RoutingStore;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};
use wsrelay_core::messages::{PublishPayload, ResponsePayload};
use wsrelay_core::{decode_message, encode_payload, Message, RelayError};

/// What a publish does when a push to one subscriber fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum FanoutPolicy {
    /// Stop at the first failure; later subscribers get nothing from this
    /// publish.
    #[default]
    #[serde(rename = "abort")]
    AbortOnFirstError,
    /// Try every subscriber, then report all failures together.
    #[serde(rename = "continue")]
    ContinueAndAggregate,
}

impl std::str::FromStr for FanoutPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "abort" => Ok(FanoutPolicy::AbortOnFirstError),
            "continue" => Ok(FanoutPolicy::ContinueAndAggregate),
            other => Err(format!("unknown fan-out policy: {other} (expected abort or continue)")),
        }
    }
}

/// Result of a completed publish.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FanoutReport {
    pub delivered: usize,
    /// Subscribers found gone (and pruned, if pruning is on).
    pub gone: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendOutcome {
    Responded { connection_id: String, inbox: String },
    Published(FanoutReport),
}

pub struct BackendHandler {
    store: RoutingStore,
    delivery: Arc<dyn Delivery>,
    policy: FanoutPolicy,
    prune_stale: bool,
}

impl BackendHandler {
    /// Handler with the default fan-out policy and stale pruning on.
    pub fn new(store: RoutingStore, delivery: Arc<dyn Delivery>) -> Self {
        Self {
            store,
            delivery,
            policy: FanoutPolicy::default(),
            prune_stale: true,
        }
    }

    pub fn with_fanout_policy(mut self, policy: FanoutPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_stale_pruning(mut self, enabled: bool) -> Self {
        self.prune_stale = enabled;
        self
    }

    /// Decode and handle one raw backend message.
    pub async fn handle_bytes(&self, data: &[u8]) -> HandlerResult<BackendOutcome> {
        self.handle(decode_message(data)?).await
    }

    pub async fn handle(&self, msg: Message) -> HandlerResult<BackendOutcome> {
        match msg {
            Message::Response(p) => self.respond(p).await,
            Message::Publish(p) => self.publish(p).await.map(BackendOutcome::Published),
            msg @ (Message::Subscribe(_) | Message::Unsubscribe(_) | Message::Request(_)) => {
                Err(RelayError::UnsupportedMessageType(msg.kind().to_string()).into())
            }
        }
    }

    async fn respond(&self, p: ResponsePayload) -> HandlerResult<BackendOutcome> {
        let request = match self.store.find_request(&p.connection_id, &p.inbox).await {
            Ok(r) => r,
            Err(e) if e.is_not_found() => {
                warn!(
                    connection_id = %p.connection_id,
                    inbox = %p.inbox,
                    "response has no pending request"
                );
                return Err(HandlerError::RequestNotFound {
                    connection_id: p.connection_id,
                    inbox: p.inbox,
                });
            }
            Err(e) => return Err(e.into()),
        };

        let data = encode_payload(&p.payload)?;
        if let Err(e) = self.delivery.push(&request.client, &data).await {
            self.on_delivery_failure(&request.client.connection_id, &e).await;
            return Err(e.into());
        }
        self.store.remove_request(&request).await?;

        info!(
            connection_id = %request.client.connection_id,
            inbox = %request.inbox,
            bytes = data.len(),
            "response delivered"
        );
        Ok(BackendOutcome::Responded {
            connection_id: request.client.connection_id,
            inbox: request.inbox,
        })
    }

    async fn publish(&self, p: PublishPayload) -> HandlerResult<FanoutReport> {
        let subscribers = self.store.find_subscribers(&p.subject).await?;
        let mut report = FanoutReport::default();
        if subscribers.is_empty() {
            debug!(subject = %p.subject, "publish with no subscribers");
            return Ok(report);
        }

        let data = encode_payload(&p.payload)?;
        let mut failed = Vec::new();

        for sub in &subscribers {
            let connection_id = &sub.client.connection_id;
            match self.delivery.push(&sub.client, &data).await {
                Ok(()) => report.delivered += 1,
                Err(e) if e.is_gone() => {
                    self.on_delivery_failure(connection_id, &e).await;
                    report.gone.push(connection_id.clone());
                }
                Err(e) => {
                    warn!(
                        subject = %p.subject,
                        connection_id = %connection_id,
                        error = %e,
                        "publish delivery failed"
                    );
                    match self.policy {
                        FanoutPolicy::AbortOnFirstError => return Err(e.into()),
                        FanoutPolicy::ContinueAndAggregate => failed.push((connection_id.clone(), e)),
                    }
                }
            }
        }

        if !failed.is_empty() {
            return Err(HandlerError::FanoutIncomplete {
                subject: p.subject,
                delivered: report.delivered,
                failed,
            });
        }

        info!(
            subject = %p.subject,
            subscribers = subscribers.len(),
            delivered = report.delivered,
            gone = report.gone.len(),
            "published"
        );
        Ok(report)
    }

    /// Prune a connection whose push reported it gone. Pruning errors are
    /// logged, not returned; the delivery error is what the caller reports.
    async fn on_delivery_failure(&self, connection_id: &str, err: &DeliveryError) {
        if !err.is_gone() || !self.prune_stale {
            return;
        }
        warn!(connection_id = %connection_id, "pruning stale connection");
        if let Err(e) = self.store.remove_connection(connection_id).await {
            warn!(connection_id = %connection_id, error = %e, "stale connection prune failed");
        }
    }
}
