//! rendezvous-core - WebRTC negotiation over a signaling relay
//!
//! Registers with a rendezvous relay over WebSocket, negotiates a peer
//! connection with whichever peer the relay pairs us with, and keeps
//! reconnecting within a bounded number of attempts.

pub mod config;
pub mod media;
pub mod negotiation;
pub mod transport;

// Re-exports
pub use config::{Config, IceServerConfig, ReconnectPolicy};
pub use media::{LocalTrack, MediaCapture};
pub use negotiation::{
    ChannelKey, ChannelPayload, Collaborators, NegotiationError, NegotiationHandler, SessionPhase, SignalingMessage,
    Supervisor, SupervisorHandle,
};
pub use transport::{RelayClient, RelayEvent, WebSocketRelay};
