//! Peer connection negotiation
//!
//! This module drives a WebRTC connection attempt over a signaling relay:
//! - Relay frame parsing and formatting
//! - Offer/answer and trickle ICE exchange
//! - Data channel tracking
//! - Reconnection supervision

pub mod data_channel;
pub mod events;
pub mod handler;
pub mod peer_connection;
pub mod rtc;
pub mod session;
pub mod signaling;
pub mod supervisor;

#[cfg(test)]
pub(crate) mod mock;

pub use data_channel::{ChannelKey, ChannelOrigin, ChannelPayload, ChannelRegistry, ChannelState, DataChannel};
pub use events::{IceConnectionState, IceGatheringState, PeerConnectionState, PeerEvent, PeerEventSink, RemoteTrack};
pub use handler::NegotiationHandler;
pub use peer_connection::{PeerConnection, PeerConnectionFactory};
pub use rtc::WebRtcFactory;
pub use session::{Session, SessionPhase};
pub use signaling::{IceCandidate, SdpKind, SessionDescription, SignalingMessage};
pub use supervisor::{Collaborators, Supervisor, SupervisorHandle};

use std::error::Error;
use std::fmt;

/// Negotiation-related errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NegotiationError {
    /// Relay transport failure
    Relay(String),
    /// Malformed or unrecognized relay frame
    Parse(String),
    /// Session description generation or application failed
    Sdp(String),
    /// Remote ICE candidate rejected
    Ice(String),
    /// Data channel error
    DataChannel(String),
    /// Peer connection creation or teardown failed
    ConnectionFailed(String),
    /// Local media could not be attached
    Media(String),
    /// Error reported by the relay (`ERROR <reason>`)
    Remote(String),
    /// A negotiation step did not finish in time
    Timeout(String),
    /// Connection attempts exceeded the configured limit
    AttemptsExhausted { attempts: u32, limit: u32 },
    /// Invalid configuration
    Config(String),
}

impl NegotiationError {
    /// Whether this error abandons the current connection attempt
    pub fn abandons_attempt(&self) -> bool {
        matches!(
            self,
            NegotiationError::Sdp(_)
                | NegotiationError::ConnectionFailed(_)
                | NegotiationError::Timeout(_)
        )
    }
}

impl fmt::Display for NegotiationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NegotiationError::Relay(msg) => write!(f, "Relay error: {}", msg),
            NegotiationError::Parse(msg) => write!(f, "Signaling parse error: {}", msg),
            NegotiationError::Sdp(msg) => write!(f, "SDP error: {}", msg),
            NegotiationError::Ice(msg) => write!(f, "ICE error: {}", msg),
            NegotiationError::DataChannel(msg) => write!(f, "DataChannel error: {}", msg),
            NegotiationError::ConnectionFailed(msg) => write!(f, "Connection failed: {}", msg),
            NegotiationError::Media(msg) => write!(f, "Media error: {}", msg),
            NegotiationError::Remote(reason) => write!(f, "ERROR: {}", reason),
            NegotiationError::Timeout(step) => write!(f, "Timed out waiting for {}", step),
            NegotiationError::AttemptsExhausted { attempts, limit } => write!(
                f,
                "Too many connection attempts ({} of {}), aborting",
                attempts, limit
            ),
            NegotiationError::Config(msg) => write!(f, "Invalid configuration: {}", msg),
        }
    }
}

impl Error for NegotiationError {}
