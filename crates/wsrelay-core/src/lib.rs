//! wsrelay-core: Shared protocol library for the WebSocket relay.
//!
//! Provides the JSON message envelope, the routing records persisted by the
//! store (clients, subscriptions, pending requests) and their key layout.

pub mod codec;
pub mod error;
pub mod messages;
pub mod routing;

// Re-export commonly used items at crate root.
pub use codec::{decode_message, encode_message, encode_payload};
pub use error::{RelayError, RelayResult};
pub use messages::{Message, MsgKind};
pub use routing::{Client, PendingRequest, Subscription};
