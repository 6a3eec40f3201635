//! Notifications flowing from the peer connection into the session driver
//!
//! Every notification is tagged with the generation of the peer connection
//! that produced it, so the driver can drop callbacks from a connection that
//! has already been replaced.

use super::data_channel::{ChannelKey, ChannelPayload, DataChannel};
use super::signaling::{IceCandidate, SessionDescription};
use super::NegotiationError;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;
use webrtc::track::track_remote::TrackRemote;

/// Peer connection state as reported by the primitive
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// ICE transport state as reported by the primitive
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IceConnectionState {
    New,
    Checking,
    Connected,
    Completed,
    Disconnected,
    Failed,
    Closed,
}

/// ICE candidate gathering state as reported by the primitive
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IceGatheringState {
    New,
    Gathering,
    Complete,
}

/// A media track announced by the remote peer
#[derive(Clone)]
pub struct RemoteTrack {
    pub id: String,
    pub stream_id: String,
    /// `audio` or `video`
    pub kind: String,
    /// Readable track, when the primitive exposes one
    pub track: Option<Arc<TrackRemote>>,
}

impl fmt::Debug for RemoteTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteTrack")
            .field("id", &self.id)
            .field("stream_id", &self.stream_id)
            .field("kind", &self.kind)
            .finish()
    }
}

/// Data channel lifecycle notification
#[derive(Debug, Clone)]
pub enum ChannelEvent {
    Open,
    Message(ChannelPayload),
    Error(String),
    Closed,
}

/// Notification emitted by a peer connection
pub enum PeerEvent {
    ConnectionState(PeerConnectionState),
    IceConnectionState(IceConnectionState),
    IceGatheringState(IceGatheringState),
    /// A discovered local candidate; `None` once gathering is complete
    LocalCandidate(Option<IceCandidate>),
    /// The remote peer opened a data channel
    DataChannel(Arc<dyn DataChannel>),
    Channel(ChannelKey, ChannelEvent),
    RemoteTrack(RemoteTrack),
}

impl fmt::Debug for PeerEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerEvent::ConnectionState(s) => write!(f, "ConnectionState({:?})", s),
            PeerEvent::IceConnectionState(s) => write!(f, "IceConnectionState({:?})", s),
            PeerEvent::IceGatheringState(s) => write!(f, "IceGatheringState({:?})", s),
            PeerEvent::LocalCandidate(c) => write!(f, "LocalCandidate({:?})", c),
            PeerEvent::DataChannel(ch) => write!(f, "DataChannel({})", ch.key()),
            PeerEvent::Channel(key, ev) => write!(f, "Channel({}, {:?})", key, ev),
            PeerEvent::RemoteTrack(t) => write!(f, "RemoteTrack({:?})", t),
        }
    }
}

/// Caller requests delivered through a `SupervisorHandle`
#[derive(Debug)]
pub(crate) enum Command {
    Shutdown,
    Stop,
    OpenChannel(String),
    Send(ChannelKey, ChannelPayload),
}

/// Everything the session driver reacts to besides relay events
#[derive(Debug)]
pub(crate) enum Event {
    Peer { generation: u64, event: PeerEvent },
    LocalDescription {
        generation: u64,
        result: Result<SessionDescription, NegotiationError>,
    },
    /// Reconnect timer fired; carries the timer's sequence number
    ReconnectDue(u64),
    Command(Command),
}

/// Handler registration target handed to a peer connection factory.
///
/// Cloned into every primitive callback; emitting never blocks.
#[derive(Clone)]
pub struct PeerEventSink {
    generation: u64,
    tx: mpsc::UnboundedSender<Event>,
}

impl PeerEventSink {
    pub(crate) fn new(generation: u64, tx: mpsc::UnboundedSender<Event>) -> Self {
        Self { generation, tx }
    }

    /// Generation of the peer connection this sink belongs to
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Forward a notification to the driver. Dropped silently once the
    /// driver has stopped.
    pub fn emit(&self, event: PeerEvent) {
        let _ = self.tx.send(Event::Peer {
            generation: self.generation,
            event,
        });
    }
}
