//! Reconnection recovery: buffered, in-order resend of content messages.
//!
//! Every outbound content message enters the queue before the first send
//! attempt and leaves only on its acknowledgment echo. A dead link
//! (`TransportError::Disconnected`) is swallowed — the message stays
//! buffered and the next flush retries, so no separate reconnect signal
//! exists. At most one message is in flight: the next is sent only after
//! the head is acknowledged, preserving causal order across an outage.

use std::collections::VecDeque;
use std::sync::Arc;

use gridsync_core::RevisionId;

use crate::protocol::StateUpdateMessage;
use crate::transport::{Transport, TransportError};

pub struct ResendQueue {
    transport: Arc<dyn Transport>,
    queue: VecDeque<StateUpdateMessage>,
    in_flight: bool,
}

impl ResendQueue {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            queue: VecDeque::new(),
            in_flight: false,
        }
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn in_flight(&self) -> bool {
        self.in_flight
    }

    pub fn contains(&self, id: RevisionId) -> bool {
        self.queue.iter().any(|m| m.chain_id() == Some(id))
    }

    /// Buffer a content message for delivery. Duplicates (same chain id,
    /// e.g. a resubmission after reconnect) are ignored.
    pub fn enqueue(&mut self, message: StateUpdateMessage) {
        match message.chain_id() {
            Some(id) if self.contains(id) => {
                log::debug!("message {id} already buffered, skipping duplicate");
            }
            Some(_) => self.queue.push_back(message),
            None => {
                log::debug!("presence messages are not buffered for resend");
            }
        }
    }

    /// Try to put the head on the wire. A disconnect is swallowed; the
    /// head stays buffered for the next flush.
    pub fn flush(&mut self) {
        if self.in_flight {
            return;
        }
        let Some(head) = self.queue.front() else {
            return;
        };
        match self.transport.send(head.clone()) {
            Ok(()) => self.in_flight = true,
            Err(TransportError::Disconnected) => {
                log::debug!(
                    "transport down, {} message(s) buffered for resend",
                    self.queue.len()
                );
            }
        }
    }

    /// The head message was echoed back by the network: release it. The
    /// caller rebases the remaining messages onto the new chain tip and
    /// flushes — sending them as-is would carry a stale base.
    pub fn acknowledge(&mut self, id: RevisionId) -> bool {
        if self.queue.front().and_then(|m| m.chain_id()) != Some(id) {
            return false;
        }
        self.queue.pop_front();
        self.in_flight = false;
        if !self.queue.is_empty() {
            log::info!("replaying {} buffered message(s)", self.queue.len());
        }
        true
    }

    /// The chain advanced past our in-flight send (it lost a race and was
    /// dropped by the sequencer); the head must be sent again.
    pub fn mark_rejected(&mut self) {
        self.in_flight = false;
    }

    /// Drop a buffered message whose revision no longer exists.
    pub fn remove(&mut self, id: RevisionId) -> bool {
        let head_matches = self.queue.front().and_then(|m| m.chain_id()) == Some(id);
        let before = self.queue.len();
        self.queue.retain(|m| m.chain_id() != Some(id));
        if head_matches {
            self.in_flight = false;
        }
        before != self.queue.len()
    }

    /// Patch every buffered message in place (rebasing onto a new chain
    /// tip, replacing transformed commands).
    pub fn rewrite(&mut self, mut patch: impl FnMut(&mut StateUpdateMessage)) {
        for message in &mut self.queue {
            patch(message);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &StateUpdateMessage> {
        self.queue.iter()
    }

    pub fn clear(&mut self) {
        self.queue.clear();
        self.in_flight = false;
    }
}
