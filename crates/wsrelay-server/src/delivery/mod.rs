//! Delivery primitive: push bytes to one live connection.
//!
//! - **[`local`]**: the emulator's own sockets, addressed through an
//!   in-process table of outbound channels.
//! - **[`http`]**: a gateway management endpoint
//!   (`POST {domain}/{stage}/@connections/{id}`), for handlers running
//!   outside the process that owns the sockets.
//!
//! Both report a vanished connection as [`DeliveryError::Gone`] so the
//! backend handler can tell it apart from a transient failure.

use async_trait::async_trait;
use thiserror::Error;
use wsrelay_core::Client;

pub mod http;
pub mod local;

pub use http::HttpDelivery;
pub use local::LocalConnections;

#[derive(Debug, Error)]
pub enum DeliveryError {
    /// The connection no longer exists.
    #[error("connection gone: {0}")]
    Gone(String),

    #[error("delivery transport error: {0}")]
    Transport(String),
}

impl DeliveryError {
    pub fn is_gone(&self) -> bool {
        matches!(self, DeliveryError::Gone(_))
    }
}

#[async_trait]
pub trait Delivery: Send + Sync {
    /// Write `data` to `client`'s connection.
    async fn push(&self, client: &Client, data: &[u8]) -> Result<(), DeliveryError>;
}
