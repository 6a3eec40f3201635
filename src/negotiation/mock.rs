//! In-memory collaborators for tests
//!
//! Deterministic stand-ins for the relay, the peer connection primitive and
//! the caller's handler. Every call is recorded so tests can assert on what
//! the session did without any network I/O.

use super::data_channel::{ChannelKey, ChannelPayload, DataChannel};
use super::events::{PeerEventSink, RemoteTrack};
use super::handler::NegotiationHandler;
use super::peer_connection::{PeerConnection, PeerConnectionFactory};
use super::session::SessionPhase;
use super::signaling::{IceCandidate, SdpKind, SessionDescription};
use super::NegotiationError;
use crate::config::IceServerConfig;
use crate::media::LocalTrack;
use crate::transport::{RelayClient, RelayEvent};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Data channel that records what was sent on it
pub struct MockDataChannel {
    key: ChannelKey,
    sent: Mutex<Vec<ChannelPayload>>,
    closed: AtomicBool,
}

impl MockDataChannel {
    pub fn new(key: ChannelKey) -> Arc<Self> {
        Arc::new(Self {
            key,
            sent: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        })
    }

    pub fn sent(&self) -> Vec<ChannelPayload> {
        self.sent.lock().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DataChannel for MockDataChannel {
    fn key(&self) -> &ChannelKey {
        &self.key
    }

    async fn send(&self, payload: ChannelPayload) -> Result<(), NegotiationError> {
        if self.is_closed() {
            return Err(NegotiationError::DataChannel(format!("{} is closed", self.key)));
        }
        self.sent.lock().push(payload);
        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

#[derive(Default)]
struct PeerLog {
    offers: usize,
    answers: usize,
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    candidates: Vec<IceCandidate>,
    channels: Vec<Arc<MockDataChannel>>,
    tracks: usize,
    closed: bool,
}

/// Peer connection that produces canned SDP and records every call.
///
/// The committed local description differs from the generated one, and
/// candidates are refused until a remote description is set.
pub struct MockPeerConnection {
    generation: u64,
    reject_remote: Arc<AtomicBool>,
    stall_offers: Arc<AtomicBool>,
    log: Mutex<PeerLog>,
}

impl MockPeerConnection {
    pub fn offers(&self) -> usize {
        self.log.lock().offers
    }

    pub fn answers(&self) -> usize {
        self.log.lock().answers
    }

    pub fn local_description_committed(&self) -> Option<SessionDescription> {
        self.log.lock().local.clone()
    }

    pub fn remote_description(&self) -> Option<SessionDescription> {
        self.log.lock().remote.clone()
    }

    pub fn candidates(&self) -> Vec<IceCandidate> {
        self.log.lock().candidates.clone()
    }

    pub fn channel_labels(&self) -> Vec<String> {
        self.log.lock().channels.iter().map(|c| c.key().label.clone()).collect()
    }

    pub fn channel(&self, index: usize) -> Arc<MockDataChannel> {
        self.log.lock().channels[index].clone()
    }

    pub fn tracks(&self) -> usize {
        self.log.lock().tracks
    }

    pub fn is_closed(&self) -> bool {
        self.log.lock().closed
    }
}

#[async_trait]
impl PeerConnection for MockPeerConnection {
    async fn create_offer(&self) -> Result<SessionDescription, NegotiationError> {
        if self.stall_offers.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        let mut log = self.log.lock();
        log.offers += 1;
        Ok(SessionDescription::offer(format!(
            "v=0\r\no=mock {} offer\r\n",
            self.generation
        )))
    }

    async fn create_answer(&self) -> Result<SessionDescription, NegotiationError> {
        let mut log = self.log.lock();
        match log.remote {
            Some(ref remote) if remote.kind == SdpKind::Offer => {}
            _ => return Err(NegotiationError::Sdp("no remote offer to answer".to_string())),
        }
        log.answers += 1;
        Ok(SessionDescription::answer(format!(
            "v=0\r\no=mock {} answer\r\n",
            self.generation
        )))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), NegotiationError> {
        let committed = SessionDescription {
            kind: desc.kind,
            sdp: format!("{}a=committed\r\n", desc.sdp),
        };
        self.log.lock().local = Some(committed);
        Ok(())
    }

    async fn local_description(&self) -> Option<SessionDescription> {
        self.log.lock().local.clone()
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), NegotiationError> {
        if self.reject_remote.load(Ordering::SeqCst) {
            return Err(NegotiationError::Sdp("remote description rejected".to_string()));
        }
        self.log.lock().remote = Some(desc);
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), NegotiationError> {
        let mut log = self.log.lock();
        if log.remote.is_none() {
            return Err(NegotiationError::Ice("remote description not set".to_string()));
        }
        log.candidates.push(candidate);
        Ok(())
    }

    async fn create_data_channel(&self, label: &str) -> Result<Arc<dyn DataChannel>, NegotiationError> {
        let channel = MockDataChannel::new(ChannelKey::local(label));
        self.log.lock().channels.push(channel.clone());
        Ok(channel)
    }

    async fn add_track(&self, _track: LocalTrack) -> Result<(), NegotiationError> {
        self.log.lock().tracks += 1;
        Ok(())
    }

    async fn close(&self) -> Result<(), NegotiationError> {
        self.log.lock().closed = true;
        Ok(())
    }
}

#[derive(Default)]
struct FactoryState {
    peers: Vec<Arc<MockPeerConnection>>,
    sinks: Vec<PeerEventSink>,
}

/// Factory handing out `MockPeerConnection`s and keeping their sinks
pub struct MockFactory {
    state: Mutex<FactoryState>,
    reject_remote: Arc<AtomicBool>,
    stall_offers: Arc<AtomicBool>,
}

impl MockFactory {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(FactoryState::default()),
            reject_remote: Arc::new(AtomicBool::new(false)),
            stall_offers: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Make every peer connection, existing or future, refuse remote
    /// descriptions
    pub fn reject_remote_descriptions(&self) {
        self.reject_remote.store(true, Ordering::SeqCst);
    }

    /// Make `create_offer` never complete
    pub fn stall_offers(&self) {
        self.stall_offers.store(true, Ordering::SeqCst);
    }

    pub fn created(&self) -> usize {
        self.state.lock().peers.len()
    }

    pub fn peer(&self, index: usize) -> Arc<MockPeerConnection> {
        self.state.lock().peers[index].clone()
    }

    /// Sink handed to the `index`th peer connection, for injecting
    /// primitive callbacks
    pub fn sink(&self, index: usize) -> PeerEventSink {
        self.state.lock().sinks[index].clone()
    }
}

#[async_trait]
impl PeerConnectionFactory for MockFactory {
    async fn create(
        &self,
        _ice_servers: &[IceServerConfig],
        events: PeerEventSink,
    ) -> Result<Arc<dyn PeerConnection>, NegotiationError> {
        let peer = Arc::new(MockPeerConnection {
            generation: events.generation(),
            reject_remote: self.reject_remote.clone(),
            stall_offers: self.stall_offers.clone(),
            log: Mutex::new(PeerLog::default()),
        });
        let mut state = self.state.lock();
        state.peers.push(peer.clone());
        state.sinks.push(events);
        Ok(peer)
    }
}

#[derive(Default)]
struct RelayLog {
    connects: usize,
    sent: Vec<String>,
    closes: usize,
    events: Option<mpsc::UnboundedSender<RelayEvent>>,
}

/// Relay that records frames instead of sending them.
///
/// Cloning shares the log, so a test can keep one clone while the
/// supervisor owns another.
#[derive(Clone, Default)]
pub struct MockRelay {
    log: Arc<Mutex<RelayLog>>,
}

impl MockRelay {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connects(&self) -> usize {
        self.log.lock().connects
    }

    pub fn sent(&self) -> Vec<String> {
        self.log.lock().sent.clone()
    }

    pub fn closes(&self) -> usize {
        self.log.lock().closes
    }

    /// Deliver a relay event as if the connection produced it
    pub fn emit(&self, event: RelayEvent) {
        if let Some(ref events) = self.log.lock().events {
            let _ = events.send(event);
        }
    }
}

impl RelayClient for MockRelay {
    fn connect(&mut self, events: mpsc::UnboundedSender<RelayEvent>) {
        let mut log = self.log.lock();
        log.connects += 1;
        log.events = Some(events);
    }

    fn send(&mut self, frame: String) {
        self.log.lock().sent.push(frame);
    }

    fn close(&mut self) {
        self.log.lock().closes += 1;
    }
}

/// Handler that records every hook as a short string
#[derive(Default)]
pub struct RecordingHandler {
    calls: Mutex<Vec<String>>,
}

impl RecordingHandler {
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    /// Number of recorded calls starting with `prefix`
    pub fn count(&self, prefix: &str) -> usize {
        self.calls.lock().iter().filter(|c| c.starts_with(prefix)).count()
    }

    fn record(&self, call: String) {
        self.calls.lock().push(call);
    }
}

impl NegotiationHandler for RecordingHandler {
    fn on_prepare(&self) {
        self.record("prepare".to_string());
    }

    fn on_prepare_fail(&self, error: &NegotiationError) {
        self.record(format!("prepare_fail:{}", error));
    }

    fn on_connect(&self) {
        self.record("connect".to_string());
    }

    fn on_close(&self) {
        self.record("close".to_string());
    }

    fn on_error(&self, error: &NegotiationError) {
        self.record(format!("error:{}", error));
    }

    fn on_message(&self, raw: &str) {
        self.record(format!("message:{}", raw));
    }

    fn on_open(&self, peer_id: &str) {
        self.record(format!("open:{}", peer_id));
    }

    fn on_remote_track(&self, track: &RemoteTrack) {
        self.record(format!("remote_track:{}", track.id));
    }

    fn on_state_change(&self, phase: SessionPhase) {
        self.record(format!("state:{:?}", phase));
    }

    fn on_channel_open(&self, key: &ChannelKey) {
        self.record(format!("channel_open:{}", key));
    }

    fn on_channel_close(&self, key: &ChannelKey) {
        self.record(format!("channel_close:{}", key));
    }
}
