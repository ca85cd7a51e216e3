//! wsrelay-server: connection-routing pub/sub and RPC relay for stateless
//! WebSocket backends.
//!
//! Clients hold WebSocket connections to a managed gateway; every event on
//! those connections, and every message a business function sends back, is
//! handled by a fresh invocation with no memory of the previous one. The
//! [`store::RoutingStore`] is the only shared state: it maps subjects to
//! subscribed connections and `(connection, inbox)` pairs to pending
//! requests.
//!
//! - [`handler::GatewayHandler`]: client connect / disconnect / message.
//! - [`handler::BackendHandler`]: backend `Response` / `Publish`.
//! - [`delivery`]: pushing bytes to a connection.
//! - [`invoke`]: fire-and-forget dispatch of business functions.
//! - [`server::RelayServer`]: single-process gateway for local use.

pub mod config;
pub mod delivery;
pub mod handler;
pub mod invoke;
pub mod routes;
pub mod server;
pub mod store;
pub mod transport;
