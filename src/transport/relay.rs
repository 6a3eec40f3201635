//! Relay client
//!
//! One logical WebSocket connection to the rendezvous relay. Frames sent
//! while the socket is not open are queued and flushed, in order, as soon
//! as the handshake completes.

use futures::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::Message;

/// Relay connection lifecycle and traffic
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayEvent {
    Open,
    Message(String),
    Error(String),
    Closed,
}

/// Text channel to the rendezvous relay
pub trait RelayClient: Send {
    /// Start connecting; lifecycle and inbound frames are reported on `events`
    fn connect(&mut self, events: mpsc::UnboundedSender<RelayEvent>);

    /// Send a text frame, queueing it while the connection is not open
    fn send(&mut self, frame: String);

    /// Close the connection. A `Closed` event follows.
    fn close(&mut self);
}

#[derive(Default)]
struct RelayState {
    writer: Option<mpsc::UnboundedSender<Message>>,
    queue: VecDeque<String>,
}

/// WebSocket relay client
pub struct WebSocketRelay {
    /// Relay address (ws:// or wss://)
    address: String,
    state: Arc<Mutex<RelayState>>,
    events: Option<mpsc::UnboundedSender<RelayEvent>>,
    task: Option<JoinHandle<()>>,
}

impl WebSocketRelay {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            state: Arc::new(Mutex::new(RelayState::default())),
            events: None,
            task: None,
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Number of frames waiting for the connection to open
    pub fn queued(&self) -> usize {
        self.state.lock().queue.len()
    }
}

impl RelayClient for WebSocketRelay {
    fn connect(&mut self, events: mpsc::UnboundedSender<RelayEvent>) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        self.state.lock().writer = None;
        self.events = Some(events.clone());

        info!("Connecting to relay {}", self.address);
        let address = self.address.clone();
        let state = self.state.clone();
        self.task = Some(tokio::spawn(run_connection(address, state, events)));
    }

    fn send(&mut self, frame: String) {
        let mut state = self.state.lock();
        let delivered = match state.writer {
            Some(ref writer) => writer.send(Message::Text(frame.clone())).is_ok(),
            None => false,
        };
        if delivered {
            debug!("Relay send: {}", frame);
            return;
        }

        state.writer = None;
        state.queue.push_back(frame);
        debug!("Relay not open, queued frame ({} queued)", state.queue.len());
    }

    fn close(&mut self) {
        let mut state = self.state.lock();
        state.queue.clear();
        if let Some(writer) = state.writer.take() {
            debug!("Closing relay connection");
            let _ = writer.send(Message::Close(None));
            return;
        }
        drop(state);

        // Still handshaking: nothing will report the close for us
        if let Some(task) = self.task.take() {
            task.abort();
            if let Some(ref events) = self.events {
                let _ = events.send(RelayEvent::Closed);
            }
        }
    }
}

impl Drop for WebSocketRelay {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

async fn run_connection(
    address: String,
    state: Arc<Mutex<RelayState>>,
    events: mpsc::UnboundedSender<RelayEvent>,
) {
    let stream = match tokio_tungstenite::connect_async(address.as_str()).await {
        Ok((stream, _response)) => stream,
        Err(e) => {
            error!("Relay connection to {} failed: {}", address, e);
            let _ = events.send(RelayEvent::Error(e.to_string()));
            let _ = events.send(RelayEvent::Closed);
            return;
        }
    };

    info!("Relay connection to {} opened", address);
    let (mut write, mut read) = stream.split();
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Message>();

    {
        let mut state = state.lock();
        if !state.queue.is_empty() {
            debug!("Flushing {} queued relay frame(s)", state.queue.len());
        }
        while let Some(frame) = state.queue.pop_front() {
            let _ = outbound_tx.send(Message::Text(frame));
        }
        state.writer = Some(outbound_tx);
    }
    let _ = events.send(RelayEvent::Open);

    let writer_handle = tokio::spawn(async move {
        while let Some(msg) = outbound_rx.recv().await {
            let closing = matches!(msg, Message::Close(_));
            if write.send(msg).await.is_err() || closing {
                break;
            }
        }
    });

    while let Some(msg) = read.next().await {
        match msg {
            Ok(Message::Text(text)) => {
                debug!("Relay received: {}", text);
                let _ = events.send(RelayEvent::Message(text));
            }
            Ok(Message::Binary(data)) => {
                debug!("Ignoring binary relay frame: {} bytes", data.len());
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                warn!("Relay connection error: {}", e);
                let _ = events.send(RelayEvent::Error(e.to_string()));
                break;
            }
        }
    }

    state.lock().writer = None;
    writer_handle.abort();
    info!("Relay connection to {} closed", address);
    let _ = events.send(RelayEvent::Closed);
}
