//! Control channel between clients and the relay.
//!
//! Every message is addressed by transport id, the short-lived identifier the relay assigns to
//! each connection. [`relay::SignalingRelay`] routes messages in-process or over WebSocket,
//! [`websocket::WebSocketSignaling`] is the client side of the WebSocket transport.

pub mod message;
pub mod relay;
pub mod websocket;

use async_trait::async_trait;

use crate::error::Error;
use message::ClientMessage;

/// Outgoing half of a signaling connection.
#[async_trait]
pub trait SignalingSender: Send + Sync {
    async fn send(&self, message: ClientMessage) -> Result<(), Error>;
}
