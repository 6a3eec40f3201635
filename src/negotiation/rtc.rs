//! webrtc-rs backed peer connections
//!
//! Builds `RTCPeerConnection`s from the configured ICE servers and forwards
//! every primitive callback into the session's `PeerEventSink`.

use super::data_channel::{ChannelKey, ChannelOrigin, ChannelPayload, DataChannel};
use super::events::{
    ChannelEvent, IceConnectionState, IceGatheringState, PeerConnectionState, PeerEvent, PeerEventSink,
    RemoteTrack,
};
use super::peer_connection::{PeerConnection, PeerConnectionFactory};
use super::signaling::{IceCandidate, SdpKind, SessionDescription};
use super::NegotiationError;
use crate::config::IceServerConfig;
use crate::media::LocalTrack;
use async_trait::async_trait;
use log::{debug, warn};
use std::sync::Arc;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_gatherer_state::RTCIceGathererState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_remote::TrackRemote;

impl From<RTCPeerConnectionState> for PeerConnectionState {
    fn from(state: RTCPeerConnectionState) -> Self {
        match state {
            RTCPeerConnectionState::Unspecified | RTCPeerConnectionState::New => PeerConnectionState::New,
            RTCPeerConnectionState::Connecting => PeerConnectionState::Connecting,
            RTCPeerConnectionState::Connected => PeerConnectionState::Connected,
            RTCPeerConnectionState::Disconnected => PeerConnectionState::Disconnected,
            RTCPeerConnectionState::Failed => PeerConnectionState::Failed,
            RTCPeerConnectionState::Closed => PeerConnectionState::Closed,
        }
    }
}

impl From<RTCIceConnectionState> for IceConnectionState {
    fn from(state: RTCIceConnectionState) -> Self {
        match state {
            RTCIceConnectionState::Unspecified | RTCIceConnectionState::New => IceConnectionState::New,
            RTCIceConnectionState::Checking => IceConnectionState::Checking,
            RTCIceConnectionState::Connected => IceConnectionState::Connected,
            RTCIceConnectionState::Completed => IceConnectionState::Completed,
            RTCIceConnectionState::Disconnected => IceConnectionState::Disconnected,
            RTCIceConnectionState::Failed => IceConnectionState::Failed,
            RTCIceConnectionState::Closed => IceConnectionState::Closed,
        }
    }
}

impl From<RTCIceGathererState> for IceGatheringState {
    fn from(state: RTCIceGathererState) -> Self {
        match state {
            RTCIceGathererState::Unspecified | RTCIceGathererState::New => IceGatheringState::New,
            RTCIceGathererState::Gathering => IceGatheringState::Gathering,
            RTCIceGathererState::Complete | RTCIceGathererState::Closed => IceGatheringState::Complete,
        }
    }
}

fn to_rtc_description(desc: SessionDescription) -> Result<RTCSessionDescription, NegotiationError> {
    let result = match desc.kind {
        SdpKind::Offer => RTCSessionDescription::offer(desc.sdp),
        SdpKind::Answer => RTCSessionDescription::answer(desc.sdp),
    };
    result.map_err(|e| NegotiationError::Sdp(format!("Invalid SDP {}: {}", desc.kind.as_str(), e)))
}

fn from_rtc_description(desc: RTCSessionDescription) -> Result<SessionDescription, NegotiationError> {
    match desc.sdp_type {
        RTCSdpType::Offer => Ok(SessionDescription::offer(desc.sdp)),
        RTCSdpType::Answer | RTCSdpType::Pranswer => Ok(SessionDescription::answer(desc.sdp)),
        other => Err(NegotiationError::Sdp(format!("Unsupported description type {}", other))),
    }
}

fn to_candidate(candidate: &RTCIceCandidate) -> Option<IceCandidate> {
    match candidate.to_json() {
        Ok(init) => Some(IceCandidate {
            candidate: init.candidate,
            sdp_mid: init.sdp_mid,
            sdp_mline_index: init.sdp_mline_index,
        }),
        Err(e) => {
            warn!("Failed to serialize local ICE candidate: {}", e);
            None
        }
    }
}

/// Creates webrtc-rs peer connections with the default codecs and
/// interceptors
#[derive(Debug, Default, Clone, Copy)]
pub struct WebRtcFactory;

impl WebRtcFactory {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl PeerConnectionFactory for WebRtcFactory {
    async fn create(
        &self,
        ice_servers: &[IceServerConfig],
        events: PeerEventSink,
    ) -> Result<Arc<dyn PeerConnection>, NegotiationError> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| NegotiationError::ConnectionFailed(format!("Failed to register codecs: {}", e)))?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine).map_err(|e| {
            NegotiationError::ConnectionFailed(format!("Failed to register interceptors: {}", e))
        })?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let ice_servers = ice_servers
            .iter()
            .map(|server| RTCIceServer {
                urls: server.urls.clone(),
                username: server.username.clone().unwrap_or_default(),
                credential: server.credential.clone().unwrap_or_default(),
                ..Default::default()
            })
            .collect();

        let rtc_config = RTCConfiguration {
            ice_servers,
            ..Default::default()
        };

        let pc = api
            .new_peer_connection(rtc_config)
            .await
            .map_err(|e| NegotiationError::ConnectionFailed(format!("Failed to create peer connection: {}", e)))?;
        let pc = Arc::new(pc);

        register_handlers(&pc, &events);
        debug!("Created peer connection for generation {}", events.generation());

        Ok(Arc::new(WebRtcPeerConnection { pc, events }))
    }
}

fn register_handlers(pc: &Arc<RTCPeerConnection>, events: &PeerEventSink) {
    let sink = events.clone();
    pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
        sink.emit(PeerEvent::ConnectionState(state.into()));
        Box::pin(async {})
    }));

    let sink = events.clone();
    pc.on_ice_connection_state_change(Box::new(move |state: RTCIceConnectionState| {
        sink.emit(PeerEvent::IceConnectionState(state.into()));
        Box::pin(async {})
    }));

    let sink = events.clone();
    pc.on_ice_gathering_state_change(Box::new(move |state: RTCIceGathererState| {
        sink.emit(PeerEvent::IceGatheringState(state.into()));
        Box::pin(async {})
    }));

    let sink = events.clone();
    pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
        match candidate {
            Some(candidate) => {
                if let Some(candidate) = to_candidate(&candidate) {
                    sink.emit(PeerEvent::LocalCandidate(Some(candidate)));
                }
            }
            None => sink.emit(PeerEvent::LocalCandidate(None)),
        }
        Box::pin(async {})
    }));

    let sink = events.clone();
    pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
        let channel = wire_channel(dc, ChannelOrigin::Remote, &sink);
        sink.emit(PeerEvent::DataChannel(channel));
        Box::pin(async {})
    }));

    let sink = events.clone();
    pc.on_track(Box::new(
        move |track: Arc<TrackRemote>, _receiver: Arc<RTCRtpReceiver>, _transceiver: Arc<RTCRtpTransceiver>| {
            sink.emit(PeerEvent::RemoteTrack(RemoteTrack {
                id: track.id(),
                stream_id: track.stream_id(),
                kind: track.kind().to_string(),
                track: Some(track),
            }));
            Box::pin(async {})
        },
    ));
}

/// Forward a data channel's callbacks to the sink under its registry key
fn wire_channel(dc: Arc<RTCDataChannel>, origin: ChannelOrigin, events: &PeerEventSink) -> Arc<dyn DataChannel> {
    let key = ChannelKey {
        origin,
        label: dc.label().to_string(),
    };

    let sink = events.clone();
    let open_key = key.clone();
    dc.on_open(Box::new(move || {
        sink.emit(PeerEvent::Channel(open_key, ChannelEvent::Open));
        Box::pin(async {})
    }));

    let sink = events.clone();
    let message_key = key.clone();
    dc.on_message(Box::new(move |msg: DataChannelMessage| {
        let payload = if msg.is_string {
            ChannelPayload::Text(String::from_utf8_lossy(&msg.data).into_owned())
        } else {
            ChannelPayload::Binary(msg.data)
        };
        sink.emit(PeerEvent::Channel(message_key.clone(), ChannelEvent::Message(payload)));
        Box::pin(async {})
    }));

    let sink = events.clone();
    let error_key = key.clone();
    dc.on_error(Box::new(move |err: webrtc::Error| {
        sink.emit(PeerEvent::Channel(error_key.clone(), ChannelEvent::Error(err.to_string())));
        Box::pin(async {})
    }));

    let sink = events.clone();
    let close_key = key.clone();
    dc.on_close(Box::new(move || {
        sink.emit(PeerEvent::Channel(close_key.clone(), ChannelEvent::Closed));
        Box::pin(async {})
    }));

    Arc::new(WebRtcDataChannel { key, dc })
}

struct WebRtcDataChannel {
    key: ChannelKey,
    dc: Arc<RTCDataChannel>,
}

#[async_trait]
impl DataChannel for WebRtcDataChannel {
    fn key(&self) -> &ChannelKey {
        &self.key
    }

    async fn send(&self, payload: ChannelPayload) -> Result<(), NegotiationError> {
        let sent = match payload {
            ChannelPayload::Text(text) => self.dc.send_text(text).await,
            ChannelPayload::Binary(data) => self.dc.send(&data).await,
        };
        sent.map(|_| ())
            .map_err(|e| NegotiationError::DataChannel(format!("Failed to send on {}: {}", self.key, e)))
    }

    async fn close(&self) {
        if let Err(e) = self.dc.close().await {
            debug!("Data channel {} close: {}", self.key, e);
        }
    }
}

struct WebRtcPeerConnection {
    pc: Arc<RTCPeerConnection>,
    events: PeerEventSink,
}

#[async_trait]
impl PeerConnection for WebRtcPeerConnection {
    async fn create_offer(&self) -> Result<SessionDescription, NegotiationError> {
        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(|e| NegotiationError::Sdp(format!("Failed to create offer: {}", e)))?;
        from_rtc_description(offer)
    }

    async fn create_answer(&self) -> Result<SessionDescription, NegotiationError> {
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|e| NegotiationError::Sdp(format!("Failed to create answer: {}", e)))?;
        from_rtc_description(answer)
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), NegotiationError> {
        let desc = to_rtc_description(desc)?;
        self.pc
            .set_local_description(desc)
            .await
            .map_err(|e| NegotiationError::Sdp(format!("Failed to set local description: {}", e)))
    }

    async fn local_description(&self) -> Option<SessionDescription> {
        let desc = self.pc.local_description().await?;
        from_rtc_description(desc).ok()
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), NegotiationError> {
        let desc = to_rtc_description(desc)?;
        self.pc
            .set_remote_description(desc)
            .await
            .map_err(|e| NegotiationError::Sdp(format!("Failed to set remote description: {}", e)))
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), NegotiationError> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: None,
        };
        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(|e| NegotiationError::Ice(format!("Failed to add ICE candidate: {}", e)))
    }

    async fn create_data_channel(&self, label: &str) -> Result<Arc<dyn DataChannel>, NegotiationError> {
        let dc = self
            .pc
            .create_data_channel(label, None)
            .await
            .map_err(|e| NegotiationError::DataChannel(format!("Failed to create data channel: {}", e)))?;
        Ok(wire_channel(dc, ChannelOrigin::Local, &self.events))
    }

    async fn add_track(&self, track: LocalTrack) -> Result<(), NegotiationError> {
        self.pc
            .add_track(track)
            .await
            .map(|_sender| ())
            .map_err(|e| NegotiationError::Media(format!("Failed to add track: {}", e)))
    }

    async fn close(&self) -> Result<(), NegotiationError> {
        self.pc
            .close()
            .await
            .map_err(|e| NegotiationError::ConnectionFailed(format!("Failed to close connection: {}", e)))
    }
}
