//! Message bus between sessions.
//!
//! [`Transport`] is the narrow seam every session speaks through: send a
//! message, register a receiver, leave. Implementations are swappable —
//! an in-memory [`LoopbackBus`] for same-process collaboration and tests,
//! a WebSocket client (`crate::client`), and a [`ReadOnlyTransport`]
//! decorator for observer clients.
//!
//! The coordinating side is a *sequencer*: content messages are accepted
//! only when built on the current chain tip. A rejected sender is not
//! notified — it catches up from the winner's broadcast, transforms its
//! pending work and resends. This single acceptance rule is what turns
//! concurrent optimistic edits into one total order every replica agrees
//! on.
//!
//! Reference: Kleppmann, Chapter 5 — Replication

use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;

use gridsync_core::{ClientId, RevisionId};

use crate::protocol::StateUpdateMessage;
use crate::revision::INITIAL_SERVER_REVISION_ID;

/// Transport failures a session must survive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The link is down. Buffer and resend; never surface to the user.
    Disconnected,
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "client disconnected from transport"),
        }
    }
}

impl std::error::Error for TransportError {}

/// Bidirectional pub/sub channel between sessions.
///
/// FIFO per sender; no other ordering guarantee. Receivers get messages
/// on the channel returned by `register` and stop receiving after
/// `leave` — a departed subscriber is never re-triggered.
pub trait Transport: Send + Sync {
    fn send(&self, message: StateUpdateMessage) -> Result<(), TransportError>;
    fn register(&self, client_id: ClientId) -> mpsc::UnboundedReceiver<StateUpdateMessage>;
    fn leave(&self, client_id: ClientId);
}

/// Chain-validation state shared by every sequencer implementation.
///
/// Accepts a content message only if it was built on the current tip,
/// advances the tip, and keeps the accepted history so late joiners can
/// fast-forward. A snapshot resets the history to itself.
#[derive(Debug)]
pub(crate) struct SequencerState {
    server_revision_id: RevisionId,
    history: Vec<StateUpdateMessage>,
}

impl SequencerState {
    pub fn new() -> Self {
        Self {
            server_revision_id: INITIAL_SERVER_REVISION_ID,
            history: Vec::new(),
        }
    }

    pub fn server_revision_id(&self) -> RevisionId {
        self.server_revision_id
    }

    pub fn history(&self) -> &[StateUpdateMessage] {
        &self.history
    }

    /// Validate a message. Returns the message to broadcast, or `None`
    /// when the message is stale and must be dropped.
    pub fn accept(&mut self, message: StateUpdateMessage) -> Option<StateUpdateMessage> {
        if message.is_presence() {
            return Some(message);
        }
        let based_on = message.based_on()?;
        let next = message.chain_id()?;
        if based_on != self.server_revision_id {
            log::debug!(
                "sequencer dropped message based on {based_on} (tip is {})",
                self.server_revision_id
            );
            return None;
        }
        self.server_revision_id = next;
        if matches!(message, StateUpdateMessage::Snapshot { .. }) {
            // History before the snapshot no longer exists.
            self.history = vec![message];
            Some(StateUpdateMessage::snapshot_created(next, based_on))
        } else {
            self.history.push(message.clone());
            Some(message)
        }
    }
}

struct BusInner {
    sequencer: SequencerState,
    subscribers: Vec<(ClientId, mpsc::UnboundedSender<StateUpdateMessage>)>,
    /// When present, sends are parked here instead of being sequenced —
    /// an open concurrency window.
    held: Option<Vec<StateUpdateMessage>>,
    offline: bool,
}

/// In-memory sequencer connecting sessions in one process.
///
/// Also the test double: `pause`/`resume` opens a concurrency window
/// (messages sent inside are sequenced together on resume, in send
/// order), and `set_offline` simulates a dead link.
pub struct LoopbackBus {
    inner: Mutex<BusInner>,
}

impl LoopbackBus {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(BusInner {
                sequencer: SequencerState::new(),
                subscribers: Vec::new(),
                held: None,
                offline: false,
            }),
        }
    }

    /// Open a concurrency window: messages are parked until `resume`.
    pub fn pause(&self) {
        let mut inner = self.inner.lock().expect("bus lock poisoned");
        if inner.held.is_none() {
            inner.held = Some(Vec::new());
        }
    }

    /// Close the window and sequence the parked messages in send order.
    pub fn resume(&self) {
        let mut inner = self.inner.lock().expect("bus lock poisoned");
        if let Some(held) = inner.held.take() {
            for message in held {
                Self::sequence(&mut inner, message);
            }
        }
    }

    /// Simulate losing (or regaining) the link for every sender.
    pub fn set_offline(&self, offline: bool) {
        self.inner.lock().expect("bus lock poisoned").offline = offline;
    }

    /// Accepted content history, for fast-forwarding a late joiner.
    pub fn initial_messages(&self) -> Vec<StateUpdateMessage> {
        self.inner
            .lock()
            .expect("bus lock poisoned")
            .sequencer
            .history()
            .to_vec()
    }

    pub fn server_revision_id(&self) -> RevisionId {
        self.inner
            .lock()
            .expect("bus lock poisoned")
            .sequencer
            .server_revision_id()
    }

    fn sequence(inner: &mut BusInner, message: StateUpdateMessage) {
        if let Some(out) = inner.sequencer.accept(message) {
            inner
                .subscribers
                .retain(|(_, tx)| tx.send(out.clone()).is_ok());
        }
    }
}

impl Default for LoopbackBus {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for LoopbackBus {
    fn send(&self, message: StateUpdateMessage) -> Result<(), TransportError> {
        let mut inner = self.inner.lock().expect("bus lock poisoned");
        if inner.offline {
            return Err(TransportError::Disconnected);
        }
        if let Some(held) = &mut inner.held {
            held.push(message);
            return Ok(());
        }
        Self::sequence(&mut inner, message);
        Ok(())
    }

    fn register(&self, client_id: ClientId) -> mpsc::UnboundedReceiver<StateUpdateMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner
            .lock()
            .expect("bus lock poisoned")
            .subscribers
            .push((client_id, tx));
        rx
    }

    fn leave(&self, client_id: ClientId) {
        self.inner
            .lock()
            .expect("bus lock poisoned")
            .subscribers
            .retain(|(id, _)| *id != client_id);
    }
}

/// Observer transport: presence goes through, content is silently
/// dropped. Gives a client live cursors without write access.
pub struct ReadOnlyTransport {
    inner: Arc<dyn Transport>,
}

impl ReadOnlyTransport {
    pub fn new(inner: Arc<dyn Transport>) -> Self {
        Self { inner }
    }
}

impl Transport for ReadOnlyTransport {
    fn send(&self, message: StateUpdateMessage) -> Result<(), TransportError> {
        if message.is_presence() {
            self.inner.send(message)
        } else {
            log::debug!("read-only transport dropped a content message");
            Ok(())
        }
    }

    fn register(&self, client_id: ClientId) -> mpsc::UnboundedReceiver<StateUpdateMessage> {
        self.inner.register(client_id)
    }

    fn leave(&self, client_id: ClientId) {
        self.inner.leave(client_id)
    }
}
