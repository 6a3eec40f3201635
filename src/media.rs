//! Local media capture seam
//!
//! The negotiation core never inspects media; it only asks the capture
//! collaborator for tracks when a peer connection is created and tells it
//! to release them when that connection is torn down.

use crate::negotiation::NegotiationError;
use async_trait::async_trait;
use std::sync::Arc;
use webrtc::track::track_local::TrackLocal;

/// A local track ready to be attached to a peer connection
pub type LocalTrack = Arc<dyn TrackLocal + Send + Sync>;

#[async_trait]
pub trait MediaCapture: Send + Sync {
    /// Acquire the tracks to send to the remote peer
    async fn acquire(&self) -> Result<Vec<LocalTrack>, NegotiationError>;

    /// Release the capture device
    fn release(&self);
}
