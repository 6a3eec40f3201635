//! Reconnection supervisor
//!
//! Owns the relay client and the current session, and runs the single
//! driver loop every event goes through:
//! - relay lifecycle and inbound frames
//! - peer connection notifications
//! - completed offer/answer tasks
//! - the reconnect timer
//! - caller commands from a `SupervisorHandle`
//!
//! Attempts are bounded by `relay.reconnects`; the counter resets whenever
//! the relay opens. At most one reconnect is ever pending.

use super::data_channel::{ChannelKey, ChannelPayload};
use super::events::{Command, Event};
use super::handler::NegotiationHandler;
use super::peer_connection::PeerConnectionFactory;
use super::rtc::WebRtcFactory;
use super::session::{Session, SessionContext, SessionSettings};
use super::signaling::SignalingMessage;
use super::NegotiationError;
use crate::config::{Config, ReconnectPolicy};
use crate::media::MediaCapture;
use crate::transport::{RelayClient, RelayEvent, WebSocketRelay};
use log::{debug, error, info, warn};
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Lend the supervisor's collaborators to the session
macro_rules! session_ctx {
    ($sup:expr) => {
        SessionContext {
            relay: $sup.relay.as_mut(),
            factory: &*$sup.factory,
            handler: &*$sup.handler,
            capture: $sup.capture.as_deref(),
            events: &$sup.events_tx,
        }
    };
}

/// Everything a supervisor talks to
pub struct Collaborators {
    pub relay: Box<dyn RelayClient>,
    pub factory: Arc<dyn PeerConnectionFactory>,
    pub handler: Arc<dyn NegotiationHandler>,
    pub capture: Option<Arc<dyn MediaCapture>>,
}

/// Caller side of a running supervisor.
///
/// Every method returns `false` once the supervisor has stopped.
#[derive(Clone)]
pub struct SupervisorHandle {
    tx: mpsc::UnboundedSender<Event>,
}

impl SupervisorHandle {
    fn command(&self, command: Command) -> bool {
        self.tx.send(Event::Command(command)).is_ok()
    }

    /// Close the relay; the resulting relay close tears the session down
    /// and schedules a reconnect as usual
    pub fn shutdown(&self) -> bool {
        self.command(Command::Shutdown)
    }

    /// Tear everything down and make `run` return without reconnecting
    pub fn stop(&self) -> bool {
        self.command(Command::Stop)
    }

    /// Open an extra data channel on the active peer connection
    pub fn open_channel(&self, label: impl Into<String>) -> bool {
        self.command(Command::OpenChannel(label.into()))
    }

    /// Send on an open data channel
    pub fn send(&self, key: ChannelKey, payload: ChannelPayload) -> bool {
        self.command(Command::Send(key, payload))
    }
}

struct PendingReconnect {
    seq: u64,
    task: JoinHandle<()>,
}

pub struct Supervisor {
    policy: ReconnectPolicy,
    settings: SessionSettings,
    relay: Box<dyn RelayClient>,
    factory: Arc<dyn PeerConnectionFactory>,
    handler: Arc<dyn NegotiationHandler>,
    capture: Option<Arc<dyn MediaCapture>>,
    session: Session,
    attempts: u32,
    reconnect: Option<PendingReconnect>,
    reconnect_seq: u64,
    relay_tx: mpsc::UnboundedSender<RelayEvent>,
    relay_rx: mpsc::UnboundedReceiver<RelayEvent>,
    events_tx: mpsc::UnboundedSender<Event>,
    events_rx: mpsc::UnboundedReceiver<Event>,
}

/// Random relay id in `10..9000`
fn generate_peer_id() -> String {
    (uuid::Uuid::new_v4().as_u128() % 8990 + 10).to_string()
}

impl Supervisor {
    pub fn new(config: &Config, collaborators: Collaborators) -> Self {
        let local_id = config.session.peer_id.clone().unwrap_or_else(generate_peer_id);
        let settings = SessionSettings::from(config);
        let (relay_tx, relay_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        Self {
            policy: config.reconnect_policy(),
            session: Session::new(local_id, settings.clone(), 0),
            settings,
            relay: collaborators.relay,
            factory: collaborators.factory,
            handler: collaborators.handler,
            capture: collaborators.capture,
            attempts: 0,
            reconnect: None,
            reconnect_seq: 0,
            relay_tx,
            relay_rx,
            events_tx,
            events_rx,
        }
    }

    /// Supervisor over a WebSocket relay and webrtc-rs peer connections
    pub fn websocket(config: &Config, handler: Arc<dyn NegotiationHandler>) -> Self {
        Self::new(
            config,
            Collaborators {
                relay: Box::new(WebSocketRelay::new(config.relay.address.clone())),
                factory: Arc::new(WebRtcFactory::new()),
                handler,
                capture: None,
            },
        )
    }

    pub fn handle(&self) -> SupervisorHandle {
        SupervisorHandle {
            tx: self.events_tx.clone(),
        }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Attempts since the relay last opened
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn reconnect_pending(&self) -> bool {
        self.reconnect.is_some()
    }

    /// Connect and process events until stopped or out of attempts
    pub async fn run(mut self) -> Result<(), NegotiationError> {
        info!("Starting negotiation as peer {}", self.session.local_id());
        self.prepare()?;

        loop {
            if let ControlFlow::Break(result) = self.next().await {
                return result;
            }
        }
    }

    async fn next(&mut self) -> ControlFlow<Result<(), NegotiationError>> {
        tokio::select! {
            Some(event) = self.relay_rx.recv() => {
                self.on_relay_event(event).await;
                ControlFlow::Continue(())
            }
            Some(event) = self.events_rx.recv() => self.on_event(event).await,
            else => ControlFlow::Break(Ok(())),
        }
    }

    /// Start one relay connection attempt
    pub(crate) fn prepare(&mut self) -> Result<(), NegotiationError> {
        self.handler.on_prepare();
        self.attempts += 1;

        if self.attempts > self.policy.max_attempts {
            let err = NegotiationError::AttemptsExhausted {
                attempts: self.attempts,
                limit: self.policy.max_attempts,
            };
            error!("{}", err);
            self.cancel_reconnect();
            self.handler.on_prepare_fail(&err);
            return Err(err);
        }

        info!(
            "Connecting to relay (attempt {} of {})",
            self.attempts, self.policy.max_attempts
        );
        self.relay.connect(self.relay_tx.clone());
        Ok(())
    }

    async fn on_relay_event(&mut self, event: RelayEvent) {
        match event {
            RelayEvent::Open => {
                info!("Relay open, registering as {}", self.session.local_id());
                self.attempts = 0;
                self.cancel_reconnect();
                self.handler.on_connect();

                let hello = SignalingMessage::Hello {
                    peer_id: self.session.local_id().to_string(),
                };
                match hello.to_frame() {
                    Ok(frame) => self.relay.send(frame),
                    Err(e) => warn!("Failed to encode registration: {}", e),
                }
            }

            RelayEvent::Message(text) => {
                self.handler.on_message(&text);
                let mut ctx = session_ctx!(self);
                self.session.on_relay_message(&text, &mut ctx).await;
            }

            RelayEvent::Error(msg) => {
                let err = NegotiationError::Relay(msg);
                warn!("{}", err);
                self.handler.on_error(&err);
                self.schedule_reconnect(self.policy.backoff_on_error);
            }

            RelayEvent::Closed => {
                info!("Relay closed");
                self.replace_session().await;
                self.handler.on_close();
                self.schedule_reconnect(self.policy.backoff_on_close);
            }
        }
    }

    async fn on_event(&mut self, event: Event) -> ControlFlow<Result<(), NegotiationError>> {
        match event {
            Event::Peer { generation, event } => {
                let mut ctx = session_ctx!(self);
                self.session.on_peer_event(generation, event, &mut ctx).await;
            }

            Event::LocalDescription { generation, result } => {
                let mut ctx = session_ctx!(self);
                self.session.on_local_description(generation, result, &mut ctx).await;
            }

            Event::ReconnectDue(seq) => {
                if self.reconnect.as_ref().map(|pending| pending.seq) != Some(seq) {
                    debug!("Ignoring cancelled reconnect timer {}", seq);
                    return ControlFlow::Continue(());
                }
                self.reconnect = None;
                if let Err(e) = self.prepare() {
                    return ControlFlow::Break(Err(e));
                }
            }

            Event::Command(Command::Shutdown) => {
                let mut ctx = session_ctx!(self);
                self.session.shutdown(&mut ctx);
            }

            Event::Command(Command::Stop) => {
                info!("Stopping negotiation");
                self.cancel_reconnect();
                self.replace_session().await;
                self.relay.close();
                return ControlFlow::Break(Ok(()));
            }

            Event::Command(Command::OpenChannel(label)) => {
                let mut ctx = session_ctx!(self);
                self.session.open_channel(&label, &mut ctx).await;
            }

            Event::Command(Command::Send(key, payload)) => {
                if let Err(e) = self.session.send(&key, payload).await {
                    warn!("{}", e);
                    self.handler.on_error(&e);
                }
            }
        }
        ControlFlow::Continue(())
    }

    /// Replace the session wholesale and tear the old one down
    async fn replace_session(&mut self) {
        let next = Session::new(
            self.session.local_id().to_string(),
            self.settings.clone(),
            self.session.generation(),
        );
        let old = std::mem::replace(&mut self.session, next);
        old.teardown(self.capture.as_deref()).await;
    }

    fn schedule_reconnect(&mut self, delay: Duration) {
        if self.reconnect.is_some() {
            debug!("Reconnect already scheduled");
            return;
        }

        self.reconnect_seq += 1;
        let seq = self.reconnect_seq;
        let events = self.events_tx.clone();
        info!("Reconnecting to relay in {:?}", delay);

        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = events.send(Event::ReconnectDue(seq));
        });
        self.reconnect = Some(PendingReconnect { seq, task });
    }

    fn cancel_reconnect(&mut self) {
        if let Some(pending) = self.reconnect.take() {
            debug!("Cancelling pending reconnect");
            pending.task.abort();
        }
    }

    /// Drain everything queued without blocking. Returns the loop's result
    /// if an event ended it.
    #[cfg(test)]
    pub(crate) async fn settle(&mut self) -> Option<Result<(), NegotiationError>> {
        loop {
            for _ in 0..8 {
                tokio::task::yield_now().await;
            }

            let mut progressed = false;
            while let Ok(event) = self.relay_rx.try_recv() {
                progressed = true;
                self.on_relay_event(event).await;
            }
            while let Ok(event) = self.events_rx.try_recv() {
                progressed = true;
                if let ControlFlow::Break(result) = self.on_event(event).await {
                    return Some(result);
                }
            }

            if !progressed {
                return None;
            }
        }
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        self.cancel_reconnect();
    }
}
