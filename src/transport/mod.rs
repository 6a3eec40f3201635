//! Transport layer for rendezvous-core
//!
//! Handles the WebSocket connection to the signaling relay.

pub mod relay;

pub use relay::{RelayClient, RelayEvent, WebSocketRelay};
