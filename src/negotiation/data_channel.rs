//! Data channel tracking
//!
//! Keeps the auxiliary channels of one peer connection, whether opened by
//! this side right after the connection is created or announced by the
//! remote peer, and routes their lifecycle events to the caller.

use super::events::ChannelEvent;
use super::handler::NegotiationHandler;
use super::peer_connection::PeerConnection;
use super::NegotiationError;
use async_trait::async_trait;
use bytes::Bytes;
use log::{debug, info, warn};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Which side opened a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelOrigin {
    Local,
    Remote,
}

/// Registry key. Both peers usually open a channel with the same label,
/// so the label alone is not unique.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChannelKey {
    pub origin: ChannelOrigin,
    pub label: String,
}

impl ChannelKey {
    pub fn local(label: &str) -> Self {
        Self { origin: ChannelOrigin::Local, label: label.to_string() }
    }

    pub fn remote(label: &str) -> Self {
        Self { origin: ChannelOrigin::Remote, label: label.to_string() }
    }
}

impl fmt::Display for ChannelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.origin {
            ChannelOrigin::Local => write!(f, "local:{}", self.label),
            ChannelOrigin::Remote => write!(f, "remote:{}", self.label),
        }
    }
}

/// Channel message, typed by the transport's string/binary flag
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelPayload {
    Text(String),
    Binary(Bytes),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Pending,
    Open,
    Closed,
}

/// A data channel owned by a peer connection
#[async_trait]
pub trait DataChannel: Send + Sync {
    fn key(&self) -> &ChannelKey;

    async fn send(&self, payload: ChannelPayload) -> Result<(), NegotiationError>;

    async fn close(&self);
}

struct ChannelEntry {
    channel: Arc<dyn DataChannel>,
    state: ChannelState,
}

/// Channels of the active peer connection
#[derive(Default)]
pub struct ChannelRegistry {
    channels: HashMap<ChannelKey, ChannelEntry>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a channel on `peer` and start tracking it
    pub async fn register_local(
        &mut self,
        peer: &dyn PeerConnection,
        label: &str,
    ) -> Result<ChannelKey, NegotiationError> {
        let channel = peer.create_data_channel(label).await?;
        let key = channel.key().clone();
        debug!("Registered local data channel {}", key);
        self.track(channel);
        Ok(key)
    }

    /// Track a channel the remote peer opened
    pub fn on_remote_channel(&mut self, channel: Arc<dyn DataChannel>) {
        info!("Remote peer opened data channel {}", channel.key());
        self.track(channel);
    }

    fn track(&mut self, channel: Arc<dyn DataChannel>) {
        let key = channel.key().clone();
        if self.channels.contains_key(&key) {
            warn!("Data channel {} registered twice, replacing", key);
        }
        self.channels.insert(
            key,
            ChannelEntry {
                channel,
                state: ChannelState::Pending,
            },
        );
    }

    /// Apply a lifecycle event to the channel it names
    pub async fn on_channel_event(
        &mut self,
        key: ChannelKey,
        event: ChannelEvent,
        handler: &dyn NegotiationHandler,
    ) {
        let Some(entry) = self.channels.get_mut(&key) else {
            debug!("Event for untracked data channel {}: {:?}", key, event);
            return;
        };

        match event {
            ChannelEvent::Open => {
                entry.state = ChannelState::Open;
                info!("Data channel {} open", key);
                handler.on_channel_open(&key);
            }
            ChannelEvent::Message(payload) => {
                if let Some(reply) = handler.on_channel_message(&key, &payload) {
                    if let Err(e) = entry.channel.send(reply).await {
                        warn!("Failed to reply on data channel {}: {}", key, e);
                    }
                }
            }
            ChannelEvent::Error(msg) => {
                warn!("Data channel {} error: {}", key, msg);
                handler.on_error(&NegotiationError::DataChannel(format!("{}: {}", key, msg)));
            }
            ChannelEvent::Closed => {
                entry.state = ChannelState::Closed;
                self.channels.remove(&key);
                info!("Data channel {} closed", key);
                handler.on_channel_close(&key);
            }
        }
    }

    /// Send a caller payload on a tracked channel
    pub async fn send(&self, key: &ChannelKey, payload: ChannelPayload) -> Result<(), NegotiationError> {
        let entry = self
            .channels
            .get(key)
            .ok_or_else(|| NegotiationError::DataChannel(format!("Unknown data channel {}", key)))?;
        if entry.state != ChannelState::Open {
            return Err(NegotiationError::DataChannel(format!("Data channel {} not open", key)));
        }
        entry.channel.send(payload).await
    }

    pub fn state(&self, key: &ChannelKey) -> Option<ChannelState> {
        self.channels.get(key).map(|entry| entry.state)
    }

    pub fn keys(&self) -> Vec<ChannelKey> {
        self.channels.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    /// Close and forget every channel; used when the peer connection is torn down
    pub async fn close_all(&mut self) {
        if !self.channels.is_empty() {
            debug!("Closing {} data channel(s)", self.channels.len());
        }
        for (_, entry) in self.channels.drain() {
            entry.channel.close().await;
        }
    }
}
