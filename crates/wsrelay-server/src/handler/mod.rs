//! Per-invocation entry points.
//!
//! - **[`gateway`]**: one client WebSocket lifecycle event per call
//!   (connect, disconnect, message).
//! - **[`backend`]**: one backend-originated `Response` or `Publish` per
//!   call.
//!
//! Neither handler keeps state between calls; everything they need to
//! remember lives in the [`crate::store::RoutingStore`].
//!
//! # Data Flow
//!
//! ```text
//! client frame
//!   → GatewayHandler::handle
//!     → RoutingStore (subscribe / unsubscribe / add_request)
//!     → Invoker::invoke_async (Request only)
//! business function output
//!   → BackendHandler::handle
//!     → RoutingStore (find_request / find_subscribers)
//!     → Delivery::push → client(s)
//! ```

use crate::delivery::DeliveryError;
use crate::invoke::InvokeError;
use crate::store::StoreError;
use thiserror::Error;
use wsrelay_core::RelayError;

pub mod backend;
pub mod gateway;

pub use backend::{BackendHandler, BackendOutcome, FanoutPolicy, FanoutReport};
pub use gateway::{GatewayEvent, GatewayEventType, GatewayHandler, GatewayResponse};

#[derive(Debug, Error)]
pub enum HandlerError {
    #[error(transparent)]
    Protocol(#[from] RelayError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Delivery(#[from] DeliveryError),

    #[error(transparent)]
    Invoke(#[from] InvokeError),

    #[error("request not found: connection {connection_id} inbox {inbox}")]
    RequestNotFound {
        connection_id: String,
        inbox: String,
    },

    #[error("fan-out on {subject} incomplete: {delivered} delivered, {} failed", .failed.len())]
    FanoutIncomplete {
        subject: String,
        delivered: usize,
        failed: Vec<(String, DeliveryError)>,
    },
}

impl HandlerError {
    /// Transport status reported for this failure.
    pub fn status_code(&self) -> u16 {
        500
    }

    pub fn is_unsupported_message_type(&self) -> bool {
        matches!(self, HandlerError::Protocol(RelayError::UnsupportedMessageType(_)))
    }
}

pub type HandlerResult<T> = Result<T, HandlerError>;

/// Status reported to the transport for a handler result.
pub fn status_code<T>(result: &HandlerResult<T>) -> u16 {
    match result {
        Ok(_) => 200,
        Err(e) => e.status_code(),
    }
}
