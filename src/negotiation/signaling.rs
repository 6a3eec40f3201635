//! Relay signaling protocol
//!
//! Text frames exchanged with the rendezvous relay:
//! - `HELLO <peer_id>` registration
//! - `ERROR <reason>` relay failures
//! - `OFFER_REQUEST` asking this side to send an offer
//! - `{"sdp": {"type": "offer"|"answer", "sdp": "..."}}`
//! - `{"ice": {"candidate": "...", "sdpMid": ..., "sdpMLineIndex": ...}}`

use super::NegotiationError;
use serde::{Deserialize, Serialize};

const HELLO: &str = "HELLO";
const ERROR: &str = "ERROR";
const OFFER_REQUEST: &str = "OFFER_REQUEST";

/// Session description kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

impl SdpKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SdpKind::Offer => "offer",
            SdpKind::Answer => "answer",
        }
    }
}

/// SDP payload as carried in the `sdp` envelope
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self { kind: SdpKind::Offer, sdp: sdp.into() }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self { kind: SdpKind::Answer, sdp: sdp.into() }
    }
}

/// ICE candidate as carried in the `ice` envelope
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default)]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default)]
    pub sdp_mline_index: Option<u16>,
}

/// A parsed relay frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalingMessage {
    /// Registration acknowledgement (or our own registration when sent)
    Hello { peer_id: String },
    /// Relay-side failure
    Error { reason: String },
    /// Remote peer wants us to produce an offer
    OfferRequest,
    /// Remote offer or answer
    SessionDescription(SessionDescription),
    /// Remote trickled candidate
    IceCandidate(IceCandidate),
}

#[derive(Deserialize)]
struct InboundEnvelope {
    #[serde(default)]
    sdp: Option<SessionDescription>,
    #[serde(default)]
    ice: Option<IceCandidate>,
}

#[derive(Serialize)]
#[serde(rename_all = "lowercase")]
enum OutboundEnvelope<'a> {
    Sdp(&'a SessionDescription),
    Ice(&'a IceCandidate),
}

impl SignalingMessage {
    /// Parse a relay text frame.
    ///
    /// Plain-text commands are matched on their leading token; anything
    /// starting with `{` is treated as a JSON negotiation payload.
    pub fn parse(text: &str) -> Result<Self, NegotiationError> {
        let text = text.trim();

        if let Some(rest) = strip_command(text, HELLO) {
            return Ok(SignalingMessage::Hello { peer_id: rest.to_string() });
        }

        if let Some(rest) = strip_command(text, ERROR) {
            return Ok(SignalingMessage::Error { reason: rest.to_string() });
        }

        if strip_command(text, OFFER_REQUEST).is_some() {
            return Ok(SignalingMessage::OfferRequest);
        }

        if text.starts_with('{') {
            let envelope: InboundEnvelope = serde_json::from_str(text)
                .map_err(|e| NegotiationError::Parse(format!("Invalid JSON frame: {}", e)))?;
            if let Some(sdp) = envelope.sdp {
                return Ok(SignalingMessage::SessionDescription(sdp));
            }
            if let Some(ice) = envelope.ice {
                return Ok(SignalingMessage::IceCandidate(ice));
            }
            return Err(NegotiationError::Parse(format!(
                "Unknown JSON frame: {}",
                preview(text)
            )));
        }

        Err(NegotiationError::Parse(format!("Unknown frame: {}", preview(text))))
    }

    /// Format this message as a relay text frame
    pub fn to_frame(&self) -> Result<String, NegotiationError> {
        match self {
            SignalingMessage::Hello { peer_id } => Ok(format!("{} {}", HELLO, peer_id)),
            SignalingMessage::Error { reason } => Ok(format!("{} {}", ERROR, reason)),
            SignalingMessage::OfferRequest => Ok(OFFER_REQUEST.to_string()),
            SignalingMessage::SessionDescription(desc) => encode(&OutboundEnvelope::Sdp(desc)),
            SignalingMessage::IceCandidate(candidate) => encode(&OutboundEnvelope::Ice(candidate)),
        }
    }
}

fn encode(envelope: &OutboundEnvelope<'_>) -> Result<String, NegotiationError> {
    serde_json::to_string(envelope)
        .map_err(|e| NegotiationError::Parse(format!("Failed to serialize frame: {}", e)))
}

/// Match `command` as the first whitespace-delimited token of `text`.
fn strip_command<'a>(text: &'a str, command: &str) -> Option<&'a str> {
    let rest = text.strip_prefix(command)?;
    if rest.is_empty() {
        return Some(rest);
    }
    if rest.starts_with(char::is_whitespace) {
        return Some(rest.trim());
    }
    None
}

fn preview(text: &str) -> &str {
    match text.char_indices().nth(50) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}
