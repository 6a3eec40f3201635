//! Caller-facing hooks

use super::data_channel::{ChannelKey, ChannelPayload};
use super::events::RemoteTrack;
use super::session::SessionPhase;
use super::NegotiationError;

/// Hooks invoked by the supervisor and session.
///
/// All methods default to no-ops except `on_channel_message`, which
/// echoes the payload back so a bare handler still answers liveness
/// checks.
pub trait NegotiationHandler: Send + Sync {
    /// About to attempt a relay connection
    fn on_prepare(&self) {}

    /// Attempt limit exceeded; no further retries will happen
    fn on_prepare_fail(&self, _error: &NegotiationError) {}

    /// Relay connection opened
    fn on_connect(&self) {}

    /// Relay connection closed
    fn on_close(&self) {}

    fn on_error(&self, _error: &NegotiationError) {}

    /// Raw relay text frame, before it is parsed
    fn on_message(&self, _raw: &str) {}

    /// Relay acknowledged registration
    fn on_open(&self, _peer_id: &str) {}

    fn on_remote_track(&self, _track: &RemoteTrack) {}

    fn on_state_change(&self, _phase: SessionPhase) {}

    fn on_channel_open(&self, _key: &ChannelKey) {}

    /// Returns the reply to send back on the same channel, if any
    fn on_channel_message(&self, _key: &ChannelKey, payload: &ChannelPayload) -> Option<ChannelPayload> {
        Some(payload.clone())
    }

    fn on_channel_close(&self, _key: &ChannelKey) {}
}
