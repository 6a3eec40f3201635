//! Negotiation session
//!
//! Drives one peer connection attempt:
//! - Lazily creates the peer connection on the first negotiation frame
//! - Produces offers/answers and forwards the committed description
//! - Exchanges trickled ICE candidates
//! - Tracks data channels of the active connection
//!
//! All state is owned by the supervisor's driver task. Notifications from
//! the peer connection carry a generation number, and anything from a
//! generation other than the active one is dropped before it touches state.

use super::data_channel::{ChannelKey, ChannelPayload, ChannelRegistry};
use super::events::{Event, IceConnectionState, IceGatheringState, PeerConnectionState, PeerEvent, PeerEventSink};
use super::handler::NegotiationHandler;
use super::peer_connection::{produce_local_description, with_timeout, PeerConnection, PeerConnectionFactory};
use super::signaling::{IceCandidate, SdpKind, SessionDescription, SignalingMessage};
use super::NegotiationError;
use crate::config::{Config, IceServerConfig};
use crate::media::MediaCapture;
use crate::transport::RelayClient;
use log::{debug, error, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Session state for the current attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    /// No peer connection yet
    Idle,
    /// Peer connection created, nothing exchanged
    Connecting,
    /// Descriptions being exchanged
    Negotiating,
    Connected,
    /// Attempt abandoned or transport failed
    Failed,
}

/// Per-session copy of the negotiation settings
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub ice_servers: Vec<IceServerConfig>,
    pub stop_local_ice: bool,
    pub data_channel_label: String,
    pub negotiation_timeout: Option<Duration>,
    pub opus_stereo: bool,
}

impl From<&Config> for SessionSettings {
    fn from(config: &Config) -> Self {
        Self {
            ice_servers: config.ice_servers.clone(),
            stop_local_ice: config.session.stop_local_ice,
            data_channel_label: config.session.data_channel_label.clone(),
            negotiation_timeout: config.session.negotiation_timeout(),
            opus_stereo: config.session.opus_stereo,
        }
    }
}

/// Collaborators lent to the session for one handler call
pub(crate) struct SessionContext<'a> {
    pub relay: &'a mut dyn RelayClient,
    pub factory: &'a dyn PeerConnectionFactory,
    pub handler: &'a dyn NegotiationHandler,
    pub capture: Option<&'a dyn MediaCapture>,
    pub events: &'a mpsc::UnboundedSender<Event>,
}

/// Negotiation attempt for a single remote peer
pub struct Session {
    local_id: String,
    settings: SessionSettings,
    generation: u64,
    phase: SessionPhase,
    registered: bool,
    connection_state: Option<PeerConnectionState>,
    ice_connection_state: Option<IceConnectionState>,
    ice_gathering_state: Option<IceGatheringState>,
    local_ice_completed: bool,
    withheld_candidates: Vec<IceCandidate>,
    local_description_requested: bool,
    remote_description_applied: bool,
    media_attached: bool,
    peer: Option<Arc<dyn PeerConnection>>,
    channels: ChannelRegistry,
}

impl Session {
    /// Create an idle session. `generation` is the last generation used by
    /// the session this one replaces, so numbers never repeat.
    pub fn new(local_id: String, settings: SessionSettings, generation: u64) -> Self {
        Self {
            local_id,
            settings,
            generation,
            phase: SessionPhase::Idle,
            registered: false,
            connection_state: None,
            ice_connection_state: None,
            ice_gathering_state: None,
            local_ice_completed: false,
            withheld_candidates: Vec::new(),
            local_description_requested: false,
            remote_description_applied: false,
            media_attached: false,
            peer: None,
            channels: ChannelRegistry::new(),
        }
    }

    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    pub fn is_active(&self) -> bool {
        self.peer.is_some()
    }

    pub fn is_registered(&self) -> bool {
        self.registered
    }

    pub fn connection_state(&self) -> Option<PeerConnectionState> {
        self.connection_state
    }

    pub fn ice_connection_state(&self) -> Option<IceConnectionState> {
        self.ice_connection_state
    }

    pub fn ice_gathering_state(&self) -> Option<IceGatheringState> {
        self.ice_gathering_state
    }

    pub fn local_ice_completed(&self) -> bool {
        self.local_ice_completed
    }

    pub fn channels(&self) -> &ChannelRegistry {
        &self.channels
    }

    fn is_current(&self, generation: u64) -> bool {
        self.peer.is_some() && generation == self.generation
    }

    fn set_phase(&mut self, phase: SessionPhase, handler: &dyn NegotiationHandler) {
        if self.phase != phase {
            debug!("Session {} phase: {:?} -> {:?}", self.local_id, self.phase, phase);
            self.phase = phase;
            handler.on_state_change(phase);
        }
    }

    /// Create a fresh peer connection, tearing down the previous one first
    pub(crate) async fn start(
        &mut self,
        ctx: &mut SessionContext<'_>,
    ) -> Result<Arc<dyn PeerConnection>, NegotiationError> {
        self.close_peer(ctx.capture).await;

        self.generation += 1;
        self.connection_state = None;
        self.ice_connection_state = None;
        self.ice_gathering_state = None;
        self.local_ice_completed = false;

        info!(
            "Session {} creating peer connection (generation {})",
            self.local_id, self.generation
        );
        let sink = PeerEventSink::new(self.generation, ctx.events.clone());
        let peer = with_timeout(
            "peer connection setup",
            self.settings.negotiation_timeout,
            ctx.factory.create(&self.settings.ice_servers, sink),
        )
        .await?;

        self.peer = Some(peer.clone());
        self.set_phase(SessionPhase::Connecting, ctx.handler);
        Ok(peer)
    }

    /// Make sure a peer connection exists. Returns `true` when this call
    /// created it.
    pub(crate) async fn ensure_active(
        &mut self,
        first: Option<&SignalingMessage>,
        ctx: &mut SessionContext<'_>,
    ) -> Result<bool, NegotiationError> {
        if self.peer.is_some() {
            return Ok(false);
        }

        if let Some(msg) = first {
            if !matches!(msg, SignalingMessage::SessionDescription(_) | SignalingMessage::OfferRequest) {
                warn!("First negotiation message was not a session description");
            }
        }

        let peer = self.start(ctx).await?;

        if let Err(e) = self
            .channels
            .register_local(peer.as_ref(), &self.settings.data_channel_label)
            .await
        {
            warn!("Failed to open data channel {}: {}", self.settings.data_channel_label, e);
            ctx.handler.on_error(&e);
        }

        if let Some(capture) = ctx.capture {
            self.attach_media(peer.as_ref(), capture, ctx.handler).await;
        }

        Ok(true)
    }

    async fn attach_media(
        &mut self,
        peer: &dyn PeerConnection,
        capture: &dyn MediaCapture,
        handler: &dyn NegotiationHandler,
    ) {
        let tracks = match capture.acquire().await {
            Ok(tracks) => tracks,
            Err(e) => {
                error!("Failed to acquire local media: {}", e);
                handler.on_error(&e);
                return;
            }
        };
        self.media_attached = true;

        for track in tracks {
            if let Err(e) = peer.add_track(track).await {
                warn!("Failed to attach local track: {}", e);
                handler.on_error(&e);
            }
        }
        debug!("Local media attached to generation {}", self.generation);
    }

    /// Handle one relay text frame
    pub(crate) async fn on_relay_message(&mut self, raw: &str, ctx: &mut SessionContext<'_>) {
        let message = match SignalingMessage::parse(raw) {
            Ok(message) => message,
            Err(e) => {
                warn!("Ignoring relay frame: {}", e);
                return;
            }
        };

        match message {
            SignalingMessage::Hello { peer_id } => {
                self.registered = true;
                let peer_id = if peer_id.is_empty() { self.local_id.clone() } else { peer_id };
                info!("Registered with relay as {}", peer_id);
                ctx.handler.on_open(&peer_id);
            }

            SignalingMessage::Error { reason } => {
                let err = NegotiationError::Remote(reason);
                error!("Relay reported {}", err);
                ctx.handler.on_error(&err);
                self.shutdown(ctx);
            }

            SignalingMessage::OfferRequest => {
                match self.ensure_active(Some(&SignalingMessage::OfferRequest), ctx).await {
                    Ok(true) => self.produce_offer(ctx),
                    Ok(false) => debug!("Offer requested while a peer connection is active, ignoring"),
                    Err(e) => self.report(e, ctx).await,
                }
            }

            SignalingMessage::SessionDescription(desc) => {
                let first = SignalingMessage::SessionDescription(desc.clone());
                if let Err(e) = self.ensure_active(Some(&first), ctx).await {
                    self.report(e, ctx).await;
                    return;
                }
                self.apply_remote_description(desc, ctx).await;
            }

            SignalingMessage::IceCandidate(candidate) => {
                let first = SignalingMessage::IceCandidate(candidate.clone());
                if let Err(e) = self.ensure_active(Some(&first), ctx).await {
                    self.report(e, ctx).await;
                    return;
                }
                self.apply_remote_candidate(candidate, ctx).await;
            }
        }
    }

    async fn apply_remote_description(&mut self, desc: SessionDescription, ctx: &mut SessionContext<'_>) {
        let Some(peer) = self.peer.clone() else {
            // ensure_active just created one; nothing to apply to otherwise
            return;
        };

        let kind = desc.kind;
        info!("Applying remote {} (generation {})", kind.as_str(), self.generation);
        let applied = with_timeout(
            "remote description",
            self.settings.negotiation_timeout,
            peer.set_remote_description(desc),
        )
        .await;

        match applied {
            Ok(()) => {
                self.remote_description_applied = true;
                self.set_phase(SessionPhase::Negotiating, ctx.handler);
                if kind == SdpKind::Offer {
                    self.produce_answer(ctx);
                }
            }
            Err(e) => self.report(e, ctx).await,
        }
    }

    async fn apply_remote_candidate(&mut self, candidate: IceCandidate, ctx: &mut SessionContext<'_>) {
        let Some(peer) = self.peer.clone() else {
            return;
        };

        if !self.remote_description_applied {
            debug!("Remote candidate arrived before the remote description");
        }

        let added = with_timeout(
            "remote candidate",
            self.settings.negotiation_timeout,
            peer.add_ice_candidate(candidate),
        )
        .await;

        if let Err(e) = added {
            warn!("Remote candidate rejected: {}", e);
            self.report(e, ctx).await;
        }
    }

    pub(crate) fn produce_offer(&mut self, ctx: &mut SessionContext<'_>) {
        self.spawn_local_description(SdpKind::Offer, ctx);
    }

    pub(crate) fn produce_answer(&mut self, ctx: &mut SessionContext<'_>) {
        self.spawn_local_description(SdpKind::Answer, ctx);
    }

    /// Generate → commit → report back through the event queue. At most
    /// once per generation.
    fn spawn_local_description(&mut self, kind: SdpKind, ctx: &mut SessionContext<'_>) {
        let Some(peer) = self.peer.clone() else {
            debug!("No peer connection, not producing local {}", kind.as_str());
            return;
        };
        if self.local_description_requested {
            debug!(
                "Local description already produced for generation {}, skipping {}",
                self.generation,
                kind.as_str()
            );
            return;
        }
        self.local_description_requested = true;

        let generation = self.generation;
        let events = ctx.events.clone();
        let limit = self.settings.negotiation_timeout;
        let opus_stereo = self.settings.opus_stereo;
        tokio::spawn(async move {
            let result = produce_local_description(peer, kind == SdpKind::Answer, limit, opus_stereo).await;
            let _ = events.send(Event::LocalDescription { generation, result });
        });
    }

    /// Completion of a spawned offer/answer
    pub(crate) async fn on_local_description(
        &mut self,
        generation: u64,
        result: Result<SessionDescription, NegotiationError>,
        ctx: &mut SessionContext<'_>,
    ) {
        if !self.is_current(generation) {
            debug!(
                "Dropping local description from generation {} (active {})",
                generation, self.generation
            );
            return;
        }

        match result {
            Ok(desc) => {
                info!("Sending local {} to relay", desc.kind.as_str());
                self.send_message(&SignalingMessage::SessionDescription(desc), ctx);
                self.set_phase(SessionPhase::Negotiating, ctx.handler);
            }
            Err(e) => self.report(e, ctx).await,
        }
    }

    /// Primitive notification
    pub(crate) async fn on_peer_event(&mut self, generation: u64, event: PeerEvent, ctx: &mut SessionContext<'_>) {
        if !self.is_current(generation) {
            debug!(
                "Dropping {:?} from stale peer connection (generation {}, active {})",
                event, generation, self.generation
            );
            return;
        }

        match event {
            PeerEvent::ConnectionState(state) => {
                info!("Session {} connection state: {:?}", self.local_id, state);
                self.connection_state = Some(state);
                match state {
                    PeerConnectionState::Connected => self.set_phase(SessionPhase::Connected, ctx.handler),
                    PeerConnectionState::Failed => self.set_phase(SessionPhase::Failed, ctx.handler),
                    _ => {}
                }
            }
            PeerEvent::IceConnectionState(state) => {
                debug!("Session {} ICE connection state: {:?}", self.local_id, state);
                self.ice_connection_state = Some(state);
            }
            PeerEvent::IceGatheringState(state) => {
                debug!("Session {} ICE gathering state: {:?}", self.local_id, state);
                self.ice_gathering_state = Some(state);
            }
            PeerEvent::LocalCandidate(candidate) => self.on_local_candidate(candidate, ctx),
            PeerEvent::DataChannel(channel) => self.channels.on_remote_channel(channel),
            PeerEvent::Channel(key, event) => {
                self.channels.on_channel_event(key, event, ctx.handler).await;
            }
            PeerEvent::RemoteTrack(track) => {
                info!("Remote {} track {} (stream {})", track.kind, track.id, track.stream_id);
                ctx.handler.on_remote_track(&track);
            }
        }
    }

    /// Trickle a discovered local candidate, or buffer it until gathering
    /// completes when local trickling is withheld
    pub(crate) fn on_local_candidate(&mut self, candidate: Option<IceCandidate>, ctx: &mut SessionContext<'_>) {
        match candidate {
            None => {
                self.local_ice_completed = true;
                info!("Local ICE gathering complete");
                for candidate in std::mem::take(&mut self.withheld_candidates) {
                    self.send_message(&SignalingMessage::IceCandidate(candidate), ctx);
                }
            }
            Some(candidate) => {
                if self.settings.stop_local_ice && !self.local_ice_completed {
                    self.withheld_candidates.push(candidate);
                } else {
                    self.send_message(&SignalingMessage::IceCandidate(candidate), ctx);
                }
            }
        }
    }

    /// Open an extra local data channel on the active connection
    pub(crate) async fn open_channel(&mut self, label: &str, ctx: &mut SessionContext<'_>) {
        let Some(peer) = self.peer.clone() else {
            warn!("No active peer connection, cannot open data channel {}", label);
            return;
        };
        if let Err(e) = self.channels.register_local(peer.as_ref(), label).await {
            ctx.handler.on_error(&e);
        }
    }

    pub(crate) async fn send(&self, key: &ChannelKey, payload: ChannelPayload) -> Result<(), NegotiationError> {
        self.channels.send(key, payload).await
    }

    /// Clear connection state and close the relay. The peer connection goes
    /// away when the supervisor replaces this session on relay close.
    pub(crate) fn shutdown(&mut self, ctx: &mut SessionContext<'_>) {
        info!("Shutting down session {}", self.local_id);
        self.connection_state = None;
        ctx.relay.close();
    }

    fn send_message(&self, message: &SignalingMessage, ctx: &mut SessionContext<'_>) {
        match message.to_frame() {
            Ok(frame) => ctx.relay.send(frame),
            Err(e) => warn!("Failed to encode signaling message: {}", e),
        }
    }

    /// Surface a negotiation error; abandon the attempt when the error calls
    /// for it. Never triggers a reconnect.
    async fn report(&mut self, err: NegotiationError, ctx: &mut SessionContext<'_>) {
        ctx.handler.on_error(&err);
        if err.abandons_attempt() {
            error!("Abandoning connection attempt (generation {}): {}", self.generation, err);
            self.set_phase(SessionPhase::Failed, ctx.handler);
            self.close_peer(ctx.capture).await;
        }
    }

    async fn close_peer(&mut self, capture: Option<&dyn MediaCapture>) {
        self.channels.close_all().await;
        if let Some(peer) = self.peer.take() {
            debug!("Closing peer connection (generation {})", self.generation);
            if let Err(e) = peer.close().await {
                warn!("Failed to close peer connection: {}", e);
            }
        }
        if self.media_attached {
            self.media_attached = false;
            if let Some(capture) = capture {
                capture.release();
            }
        }
        self.withheld_candidates.clear();
        self.local_description_requested = false;
        self.remote_description_applied = false;
    }

    /// Tear down the peer connection, its channels and local media
    pub(crate) async fn teardown(mut self, capture: Option<&dyn MediaCapture>) {
        if self.peer.is_some() {
            info!("Tearing down session {} (generation {})", self.local_id, self.generation);
        }
        self.close_peer(capture).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::negotiation::data_channel::ChannelState;
    use crate::negotiation::events::ChannelEvent;
    use crate::negotiation::mock::{MockFactory, MockRelay, RecordingHandler};

    struct Harness {
        session: Session,
        relay: MockRelay,
        factory: MockFactory,
        handler: RecordingHandler,
        events_tx: mpsc::UnboundedSender<Event>,
        events_rx: mpsc::UnboundedReceiver<Event>,
    }

    impl Harness {
        fn new(config: &Config) -> Self {
            let (events_tx, events_rx) = mpsc::unbounded_channel();
            Self {
                session: Session::new("7".to_string(), SessionSettings::from(config), 0),
                relay: MockRelay::new(),
                factory: MockFactory::new(),
                handler: RecordingHandler::default(),
                events_tx,
                events_rx,
            }
        }

        async fn frame(&mut self, raw: &str) {
            let mut ctx = SessionContext {
                relay: &mut self.relay,
                factory: &self.factory,
                handler: &self.handler,
                capture: None,
                events: &self.events_tx,
            };
            self.session.on_relay_message(raw, &mut ctx).await;
        }

        async fn peer_event(&mut self, generation: u64, event: PeerEvent) {
            let mut ctx = SessionContext {
                relay: &mut self.relay,
                factory: &self.factory,
                handler: &self.handler,
                capture: None,
                events: &self.events_tx,
            };
            self.session.on_peer_event(generation, event, &mut ctx).await;
        }

        /// Let spawned offer/answer tasks finish and feed their results back
        async fn settle(&mut self) {
            for _ in 0..8 {
                tokio::task::yield_now().await;
            }
            while let Ok(event) = self.events_rx.try_recv() {
                let mut ctx = SessionContext {
                    relay: &mut self.relay,
                    factory: &self.factory,
                    handler: &self.handler,
                    capture: None,
                    events: &self.events_tx,
                };
                match event {
                    Event::LocalDescription { generation, result } => {
                        self.session.on_local_description(generation, result, &mut ctx).await
                    }
                    Event::Peer { generation, event } => {
                        self.session.on_peer_event(generation, event, &mut ctx).await
                    }
                    _ => {}
                }
            }
        }
    }

    fn candidate(n: u32) -> IceCandidate {
        IceCandidate {
            candidate: format!("candidate:{} 1 udp 2122260223 10.0.0.{} 5000 typ host", n, n),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
        }
    }

    #[tokio::test]
    async fn hello_registers_without_peer_connection() {
        let mut h = Harness::new(&Config::default());
        h.frame("HELLO 42").await;

        assert!(h.session.is_registered());
        assert!(!h.session.is_active());
        assert_eq!(h.factory.created(), 0);
        assert_eq!(h.handler.calls(), vec!["open:42".to_string()]);
    }

    #[tokio::test]
    async fn offer_request_creates_one_connection_and_one_offer() {
        let mut h = Harness::new(&Config::default());
        h.frame("OFFER_REQUEST").await;
        h.settle().await;

        assert_eq!(h.factory.created(), 1);
        assert_eq!(h.factory.peer(0).channel_labels(), vec!["ch0".to_string()]);
        assert_eq!(h.factory.peer(0).offers(), 1);

        let sent = h.relay.sent();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].starts_with(r#"{"sdp":{"type":"offer""#));
        assert!(sent[0].contains("a=committed"));
        assert_eq!(h.session.phase(), SessionPhase::Negotiating);
    }

    #[tokio::test]
    async fn repeated_offer_request_does_not_offer_twice() {
        let mut h = Harness::new(&Config::default());
        h.frame("OFFER_REQUEST").await;
        h.frame("OFFER_REQUEST").await;
        h.settle().await;
        h.frame("OFFER_REQUEST").await;
        h.settle().await;

        assert_eq!(h.factory.created(), 1);
        assert_eq!(h.factory.peer(0).offers(), 1);
        assert_eq!(h.relay.sent().len(), 1);
    }

    #[tokio::test]
    async fn remote_offer_is_answered_once() {
        let mut h = Harness::new(&Config::default());
        h.frame(r#"{"sdp":{"type":"offer","sdp":"v=0 remote"}}"#).await;
        h.frame(r#"{"sdp":{"type":"offer","sdp":"v=0 remote again"}}"#).await;
        h.settle().await;

        assert_eq!(h.factory.created(), 1);
        assert_eq!(h.factory.peer(0).answers(), 1);
        let sent = h.relay.sent();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].starts_with(r#"{"sdp":{"type":"answer""#));
    }

    #[tokio::test]
    async fn remote_answer_needs_no_local_action() {
        let mut h = Harness::new(&Config::default());
        h.frame("OFFER_REQUEST").await;
        h.settle().await;
        h.frame(r#"{"sdp":{"type":"answer","sdp":"v=0 remote"}}"#).await;
        h.settle().await;

        assert_eq!(h.factory.peer(0).answers(), 0);
        assert_eq!(h.relay.sent().len(), 1);
        assert_eq!(h.factory.peer(0).remote_description().map(|d| d.kind), Some(SdpKind::Answer));
    }

    #[tokio::test]
    async fn candidate_before_description_lazily_creates_connection() {
        let mut h = Harness::new(&Config::default());
        h.frame(r#"{"ice":{"candidate":"candidate:1 1 udp 1 10.0.0.1 5000 typ host","sdpMid":"0","sdpMLineIndex":0}}"#)
            .await;

        assert_eq!(h.factory.created(), 1);
        assert!(h.session.is_active());
        // the mock rejects candidates without a remote description; that is
        // reported but the attempt survives
        assert_eq!(h.handler.count("error:ICE error"), 1);
        assert_eq!(h.session.phase(), SessionPhase::Connecting);

        h.frame(r#"{"sdp":{"type":"offer","sdp":"v=0"}}"#).await;
        h.frame(r#"{"ice":{"candidate":"candidate:2 1 udp 1 10.0.0.2 5000 typ host","sdpMid":"0","sdpMLineIndex":0}}"#)
            .await;
        assert_eq!(h.factory.created(), 1);
        assert_eq!(h.factory.peer(0).candidates().len(), 1);
    }

    #[tokio::test]
    async fn error_frame_reports_and_closes_relay() {
        let mut h = Harness::new(&Config::default());
        h.frame("ERROR overloaded").await;

        assert_eq!(h.handler.calls(), vec!["error:ERROR: overloaded".to_string()]);
        assert_eq!(h.relay.closes(), 1);
        assert_eq!(h.session.connection_state(), None);
    }

    #[tokio::test]
    async fn garbage_frames_are_ignored() {
        let mut h = Harness::new(&Config::default());
        h.frame("SESSION_OK").await;
        h.frame("{not json").await;
        h.frame(r#"{"pong": 3}"#).await;

        assert_eq!(h.factory.created(), 0);
        assert!(h.handler.calls().is_empty());
        assert!(h.relay.sent().is_empty());
    }

    #[tokio::test]
    async fn rejected_remote_description_abandons_attempt() {
        let mut h = Harness::new(&Config::default());
        h.factory.reject_remote_descriptions();
        h.frame(r#"{"sdp":{"type":"offer","sdp":"v=0"}}"#).await;
        h.settle().await;

        assert_eq!(h.session.phase(), SessionPhase::Failed);
        assert!(!h.session.is_active());
        assert!(h.factory.peer(0).is_closed());
        assert_eq!(h.handler.count("error:SDP error"), 1);
        assert!(h.relay.sent().is_empty());
        assert_eq!(h.relay.closes(), 0);
    }

    #[tokio::test]
    async fn local_candidates_trickle_immediately_by_default() {
        let mut h = Harness::new(&Config::default());
        h.frame("OFFER_REQUEST").await;
        h.settle().await;
        let generation = h.session.generation();

        h.peer_event(generation, PeerEvent::LocalCandidate(Some(candidate(1)))).await;
        h.peer_event(generation, PeerEvent::LocalCandidate(None)).await;

        let sent = h.relay.sent();
        assert_eq!(sent.len(), 2);
        assert!(sent[1].starts_with(r#"{"ice":{"candidate":"candidate:1"#));
        assert!(h.session.local_ice_completed());
    }

    #[tokio::test]
    async fn withheld_candidates_flush_when_gathering_completes() {
        let mut config = Config::default();
        config.session.stop_local_ice = true;
        let mut h = Harness::new(&config);
        h.frame("OFFER_REQUEST").await;
        h.settle().await;
        let generation = h.session.generation();

        h.peer_event(generation, PeerEvent::LocalCandidate(Some(candidate(1)))).await;
        h.peer_event(generation, PeerEvent::LocalCandidate(Some(candidate(2)))).await;
        assert_eq!(h.relay.sent().len(), 1);

        h.peer_event(generation, PeerEvent::LocalCandidate(None)).await;
        let sent = h.relay.sent();
        assert_eq!(sent.len(), 3);
        assert!(sent[1].contains("candidate:1 "));
        assert!(sent[2].contains("candidate:2 "));

        h.peer_event(generation, PeerEvent::LocalCandidate(Some(candidate(3)))).await;
        assert_eq!(h.relay.sent().len(), 4);
    }

    #[tokio::test]
    async fn stale_generation_does_not_touch_state() {
        let mut h = Harness::new(&Config::default());
        h.frame("OFFER_REQUEST").await;
        h.settle().await;
        let old_generation = h.session.generation();

        // a rejected description abandons generation 1; the next frame
        // lazily starts generation 2
        h.factory.reject_remote_descriptions();
        h.frame(r#"{"sdp":{"type":"answer","sdp":"v=0"}}"#).await;
        h.frame("OFFER_REQUEST").await;
        assert_eq!(h.factory.created(), 2);
        assert!(h.session.generation() > old_generation);

        h.peer_event(old_generation, PeerEvent::ConnectionState(PeerConnectionState::Connected))
            .await;
        h.peer_event(old_generation, PeerEvent::LocalCandidate(Some(candidate(9))))
            .await;

        assert_eq!(h.session.connection_state(), None);
        assert_ne!(h.session.phase(), SessionPhase::Connected);
        assert!(h.relay.sent().iter().all(|frame| !frame.contains("candidate:9")));
    }

    #[tokio::test]
    async fn connection_state_drives_phase() {
        let mut h = Harness::new(&Config::default());
        h.frame("OFFER_REQUEST").await;
        h.settle().await;
        let generation = h.session.generation();

        h.peer_event(generation, PeerEvent::IceGatheringState(IceGatheringState::Gathering)).await;
        h.peer_event(generation, PeerEvent::IceConnectionState(IceConnectionState::Checking)).await;
        h.peer_event(generation, PeerEvent::ConnectionState(PeerConnectionState::Connected)).await;

        assert_eq!(h.session.phase(), SessionPhase::Connected);
        assert_eq!(h.session.ice_gathering_state(), Some(IceGatheringState::Gathering));
        assert_eq!(h.session.ice_connection_state(), Some(IceConnectionState::Checking));
        assert!(h.handler.calls().contains(&"state:Connected".to_string()));
    }

    #[tokio::test]
    async fn local_channel_opens_through_peer_events() {
        let mut h = Harness::new(&Config::default());
        h.frame("OFFER_REQUEST").await;
        h.settle().await;
        let generation = h.session.generation();
        let key = ChannelKey::local("ch0");

        assert_eq!(h.session.channels().state(&key), Some(ChannelState::Pending));
        h.peer_event(generation, PeerEvent::Channel(key.clone(), ChannelEvent::Open)).await;
        assert_eq!(h.session.channels().state(&key), Some(ChannelState::Open));

        h.peer_event(generation, PeerEvent::Channel(key.clone(), ChannelEvent::Closed)).await;
        assert_eq!(h.session.channels().state(&key), None);
    }

    #[tokio::test]
    async fn teardown_closes_peer_and_channels() {
        let mut h = Harness::new(&Config::default());
        h.frame("OFFER_REQUEST").await;
        h.settle().await;

        let peer = h.factory.peer(0);
        let session = std::mem::replace(
            &mut h.session,
            Session::new("7".to_string(), SessionSettings::from(&Config::default()), 1),
        );
        session.teardown(None).await;

        assert!(peer.is_closed());
        assert!(peer.channel(0).is_closed());
    }
}
