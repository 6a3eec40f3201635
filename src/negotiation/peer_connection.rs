//! Peer connection capability
//!
//! The session orchestrates a peer connection through this interface and
//! never touches the ICE/DTLS machinery behind it. Notifications travel the
//! other way through the `PeerEventSink` handed to the factory.

use super::data_channel::DataChannel;
use super::events::PeerEventSink;
use super::signaling::{IceCandidate, SessionDescription};
use super::NegotiationError;
use crate::config::IceServerConfig;
use crate::media::LocalTrack;
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

#[async_trait]
pub trait PeerConnection: Send + Sync {
    async fn create_offer(&self) -> Result<SessionDescription, NegotiationError>;

    async fn create_answer(&self) -> Result<SessionDescription, NegotiationError>;

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), NegotiationError>;

    /// The committed local description, which may differ from the one
    /// that was generated
    async fn local_description(&self) -> Option<SessionDescription>;

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), NegotiationError>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), NegotiationError>;

    /// Create a data channel whose lifecycle events are reported to this
    /// connection's sink
    async fn create_data_channel(&self, label: &str) -> Result<Arc<dyn DataChannel>, NegotiationError>;

    async fn add_track(&self, track: LocalTrack) -> Result<(), NegotiationError>;

    async fn close(&self) -> Result<(), NegotiationError>;
}

/// Creates peer connections wired to a notification sink
#[async_trait]
pub trait PeerConnectionFactory: Send + Sync {
    async fn create(
        &self,
        ice_servers: &[IceServerConfig],
        events: PeerEventSink,
    ) -> Result<Arc<dyn PeerConnection>, NegotiationError>;
}

/// Bound a negotiation step by `limit`, when one is configured
pub(crate) async fn with_timeout<T, F>(
    step: &str,
    limit: Option<Duration>,
    fut: F,
) -> Result<T, NegotiationError>
where
    F: Future<Output = Result<T, NegotiationError>>,
{
    match limit {
        Some(limit) => tokio::time::timeout(limit, fut)
            .await
            .map_err(|_| NegotiationError::Timeout(step.to_string()))?,
        None => fut.await,
    }
}

/// Append `params` to the `a=fmtp` line of every payload type whose
/// `a=rtpmap` encoding is `codec`
pub fn add_codec_params(sdp: &str, codec: &str, params: &[(&str, &str)]) -> String {
    let suffix = params
        .iter()
        .map(|(key, value)| format!("{}={}", key, value))
        .collect::<Vec<_>>()
        .join(";");

    let payload_types: Vec<&str> = sdp
        .lines()
        .filter_map(|line| {
            let (pt, encoding) = line.strip_prefix("a=rtpmap:")?.split_once(' ')?;
            let name = encoding.split('/').next()?;
            name.eq_ignore_ascii_case(codec).then_some(pt)
        })
        .collect();

    if suffix.is_empty() || payload_types.is_empty() {
        return sdp.to_string();
    }

    sdp.split('\n')
        .map(|line| {
            let (body, cr) = match line.strip_suffix('\r') {
                Some(body) => (body, "\r"),
                None => (line, ""),
            };
            let is_target = body
                .strip_prefix("a=fmtp:")
                .and_then(|rest| rest.split_once(' '))
                .map_or(false, |(pt, _)| payload_types.contains(&pt));
            if is_target {
                format!("{};{}{}", body, suffix, cr)
            } else {
                line.to_string()
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Generate a local description, commit it and read back what was committed
pub(crate) async fn produce_local_description(
    peer: Arc<dyn PeerConnection>,
    answer: bool,
    limit: Option<Duration>,
    opus_stereo: bool,
) -> Result<SessionDescription, NegotiationError> {
    let mut generated = if answer {
        with_timeout("answer generation", limit, peer.create_answer()).await?
    } else {
        with_timeout("offer generation", limit, peer.create_offer()).await?
    };

    if opus_stereo {
        generated.sdp = add_codec_params(&generated.sdp, "opus", &[("stereo", "1"), ("sprop-stereo", "1")]);
    }

    with_timeout(
        "local description commit",
        limit,
        peer.set_local_description(generated.clone()),
    )
    .await?;

    Ok(peer.local_description().await.unwrap_or(generated))
}
