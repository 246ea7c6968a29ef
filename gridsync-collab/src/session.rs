//! The per-client session: optimistic local application, outgoing and
//! incoming revision handling, selective undo/redo, presence.
//!
//! ## State machine
//!
//! ```text
//!            save()                 own echo
//!   IDLE ─────────────► PENDING ───────────────► IDLE
//!    │                                            ▲
//!    │ undo()/redo()          own echo            │
//!    └───────────────► WAITING_UNDO_REDO ─────────┘
//! ```
//!
//! While `PENDING` or `WAITING_UNDO_REDO`, new local commands are refused
//! with `WaitingSessionConfirmation` — the caller retries, nothing is
//! queued behind its back. The exception is a dead link: a send that
//! fails with `Disconnected` leaves the session free to keep editing;
//! the buffered revisions drain one ack at a time once the link returns.
//!
//! Remote revisions are reconciled remote-wins: pending local work is
//! rolled back, the remote batch applied, pending work transformed and
//! replayed, then the (rebased) head of the resend queue goes out again.

use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::mpsc;
use uuid::Uuid;

use gridsync_core::{
    CancelledReason, ClientId, Command, CommandResult, RevisionId, Workbook,
};

use crate::presence::{Client, ClientPosition, ClientRegistry, Debounce, MOVE_DEBOUNCE_WINDOW};
use crate::protocol::{self, StateUpdateMessage, PROTOCOL_VERSION};
use crate::recovery::ResendQueue;
use crate::revision::{Revision, RevisionLog};
use crate::transport::Transport;

/// Where the session sits between a local request and its network echo.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConcurrencyState {
    Idle,
    Pending,
    WaitingUndoRedo,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HistoryKind {
    Undo,
    Redo,
}

#[derive(Debug, Clone, Copy)]
struct HistoryRequest {
    next_revision_id: RevisionId,
    target: RevisionId,
    kind: HistoryKind,
}

/// Notifications for the host application.
#[derive(Debug, Clone)]
pub enum CollabEvent {
    RemoteRevisionApplied {
        client_id: ClientId,
        commands: Vec<Command>,
    },
    RevisionAcknowledged {
        revision_id: RevisionId,
    },
    RevisionUndone {
        revision_id: RevisionId,
    },
    RevisionRedone {
        revision_id: RevisionId,
    },
    ClientJoined {
        client: Client,
        position: ClientPosition,
    },
    ClientMoved {
        client: Client,
        position: ClientPosition,
    },
    ClientLeft {
        client_id: ClientId,
    },
    /// Protocol desync: the host should rebuild this replica from a fresh
    /// snapshot (see `Model::resync_from`).
    UnexpectedRevisionId {
        server_revision_id: RevisionId,
    },
    SnapshotApplied {
        revision_id: RevisionId,
    },
}

pub struct Session {
    client: Client,
    transport: Arc<dyn Transport>,
    log: RevisionLog,
    resend: ResendQueue,
    history_request: Option<HistoryRequest>,
    undo_stack: Vec<RevisionId>,
    redo_stack: Vec<RevisionId>,
    registry: ClientRegistry,
    local_position: Option<ClientPosition>,
    move_debounce: Debounce<ClientPosition>,
    /// Chain ids already handled; redelivery is a no-op.
    processed: HashSet<RevisionId>,
    events: mpsc::UnboundedSender<CollabEvent>,
    event_rx: Option<mpsc::UnboundedReceiver<CollabEvent>>,
    joined: bool,
    left: bool,
    replaying: bool,
}

impl Session {
    pub fn new(client: Client, transport: Arc<dyn Transport>) -> Self {
        let (events, event_rx) = mpsc::unbounded_channel();
        Self {
            client,
            transport: transport.clone(),
            log: RevisionLog::new(),
            resend: ResendQueue::new(transport),
            history_request: None,
            undo_stack: Vec::new(),
            redo_stack: Vec::new(),
            registry: ClientRegistry::new(),
            local_position: None,
            move_debounce: Debounce::new(MOVE_DEBOUNCE_WINDOW),
            processed: HashSet::new(),
            events,
            event_rx: Some(event_rx),
            joined: false,
            left: false,
            replaying: false,
        }
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn server_revision_id(&self) -> RevisionId {
        self.log.server_revision_id()
    }

    pub fn state(&self) -> ConcurrencyState {
        if self.history_request.is_some() {
            ConcurrencyState::WaitingUndoRedo
        } else if self.resend.in_flight() {
            ConcurrencyState::Pending
        } else {
            ConcurrencyState::Idle
        }
    }

    pub fn connected_clients(&self) -> &ClientRegistry {
        &self.registry
    }

    pub fn pending_revision_count(&self) -> usize {
        self.resend.len()
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::UnboundedReceiver<CollabEvent>> {
        self.event_rx.take()
    }

    fn is_waiting(&self) -> bool {
        self.state() != ConcurrencyState::Idle
    }

    fn emit(&self, event: CollabEvent) {
        if self.replaying {
            return;
        }
        let _ = self.events.send(event);
    }

    // ── Local requests ──────────────────────────────────────────────

    /// Apply a command batch optimistically and put it on the wire as one
    /// atomic revision.
    pub fn save(&mut self, workbook: &mut Workbook, commands: Vec<Command>) -> CommandResult {
        if self.left || self.is_waiting() {
            return CommandResult::cancelled(CancelledReason::WaitingSessionConfirmation);
        }
        if commands.is_empty() {
            return CommandResult::cancelled(CancelledReason::EmptyCommandBatch);
        }

        let mut changes = Vec::new();
        for command in &commands {
            match workbook.apply(command) {
                Ok(ch) => changes.extend(ch),
                Err(reasons) => {
                    workbook.revert_changes(&changes);
                    return CommandResult::Cancelled(reasons);
                }
            }
        }

        let id = Uuid::new_v4();
        self.log
            .append(Revision::new(id, self.client.id, commands.clone()), changes, false);
        self.undo_stack.push(id);
        self.redo_stack.clear();

        self.resend.enqueue(StateUpdateMessage::remote_revision(
            id,
            self.log.server_revision_id(),
            self.client.id,
            commands,
        ));
        self.resend.flush();
        CommandResult::Success
    }

    /// Request an undo of the local client's most recent active revision.
    /// Nothing is applied until the network echoes the request back.
    pub fn undo(&mut self) -> CommandResult {
        if self.left || self.is_waiting() {
            return CommandResult::cancelled(CancelledReason::WaitingSessionConfirmation);
        }
        let Some(target) = self.undo_stack.pop() else {
            return CommandResult::cancelled(CancelledReason::EmptyUndoStack);
        };
        let next = Uuid::new_v4();
        self.history_request = Some(HistoryRequest {
            next_revision_id: next,
            target,
            kind: HistoryKind::Undo,
        });
        self.resend.enqueue(StateUpdateMessage::revision_undone(
            next,
            self.log.server_revision_id(),
            target,
        ));
        self.resend.flush();
        CommandResult::Success
    }

    /// Request a redo of the most recently undone local revision.
    pub fn redo(&mut self) -> CommandResult {
        if self.left || self.is_waiting() {
            return CommandResult::cancelled(CancelledReason::WaitingSessionConfirmation);
        }
        let Some(target) = self.redo_stack.pop() else {
            return CommandResult::cancelled(CancelledReason::EmptyRedoStack);
        };
        let next = Uuid::new_v4();
        self.history_request = Some(HistoryRequest {
            next_revision_id: next,
            target,
            kind: HistoryKind::Redo,
        });
        self.resend.enqueue(StateUpdateMessage::revision_redone(
            next,
            self.log.server_revision_id(),
            target,
        ));
        self.resend.flush();
        CommandResult::Success
    }

    /// Request log compaction: ship the full current state, after which
    /// history before it no longer exists anywhere.
    pub fn snapshot(&mut self, workbook: &Workbook) -> CommandResult {
        if self.left || self.is_waiting() {
            return CommandResult::cancelled(CancelledReason::WaitingSessionConfirmation);
        }
        if self.log.has_pending() || !self.resend.is_empty() {
            return CommandResult::cancelled(CancelledReason::PendingLocalRevisions);
        }
        let data = match protocol::encode_snapshot_data(&workbook.export_data()) {
            Ok(data) => data,
            Err(e) => {
                log::error!("snapshot encoding failed: {e}");
                return CommandResult::cancelled(CancelledReason::SnapshotEncodingFailed);
            }
        };
        let next = Uuid::new_v4();
        self.resend.enqueue(StateUpdateMessage::snapshot(
            next,
            self.log.server_revision_id(),
            data,
        ));
        self.resend.flush();
        CommandResult::Success
    }

    // ── Presence ────────────────────────────────────────────────────

    /// Announce this client to the document.
    pub fn join(&mut self, workbook: &Workbook) {
        if self.left {
            return;
        }
        self.joined = true;
        let position = self.local_position.unwrap_or_else(|| ClientPosition {
            client_id: self.client.id,
            sheet_id: workbook.sheets().first().map(|s| s.id).unwrap_or_default(),
            col: 0,
            row: 0,
        });
        self.local_position = Some(position);
        self.registry.upsert(self.client.clone(), Some(position));
        // Presence is lossy by design: a failed send is not retried.
        let _ = self
            .transport
            .send(StateUpdateMessage::client_joined(self.client.clone(), position));
    }

    /// Record a local cursor move. Debounced: within one window only the
    /// latest position goes out, when `flush_presence` fires.
    pub fn move_cursor(&mut self, position: ClientPosition) {
        if self.left {
            return;
        }
        let position = ClientPosition {
            client_id: self.client.id,
            ..position
        };
        self.local_position = Some(position);
        self.registry.upsert(self.client.clone(), Some(position));
        self.move_debounce.push(position);
    }

    /// Send the debounced cursor move if its deadline has passed.
    pub fn flush_presence(&mut self) {
        if self.left {
            return;
        }
        if let Some(position) = self.move_debounce.poll() {
            let _ = self
                .transport
                .send(StateUpdateMessage::client_moved(self.client.clone(), position));
        }
    }

    /// Deadline of the pending cursor broadcast, for pump loops that want
    /// to sleep exactly until it is due.
    pub fn presence_deadline(&self) -> Option<tokio::time::Instant> {
        self.move_debounce.deadline()
    }

    /// Leave the document. The session broadcasts its departure, stops
    /// listening, and permanently ignores any further input.
    pub fn leave(&mut self) {
        if self.left {
            return;
        }
        self.move_debounce.cancel();
        let _ = self
            .transport
            .send(StateUpdateMessage::client_left(self.client.id));
        self.transport.leave(self.client.id);
        self.left = true;
    }

    // ── Incoming messages ───────────────────────────────────────────

    /// Fast-forward a fresh replica through recorded history. Malformed
    /// or out-of-chain messages are skipped; nothing panics and no events
    /// are emitted.
    pub fn fast_forward(&mut self, workbook: &mut Workbook, messages: Vec<StateUpdateMessage>) {
        self.replaying = true;
        for message in messages {
            self.handle_message(workbook, message);
        }
        self.replaying = false;
    }

    pub fn handle_message(&mut self, workbook: &mut Workbook, message: StateUpdateMessage) {
        if self.left {
            return;
        }
        if message.version() != PROTOCOL_VERSION {
            log::warn!(
                "ignoring message with unrecognized protocol version {}",
                message.version()
            );
            return;
        }
        if let Some(chain_id) = message.chain_id() {
            if self.processed.contains(&chain_id) {
                log::debug!("duplicate delivery of {chain_id} ignored");
                return;
            }
        }
        match message {
            StateUpdateMessage::ClientJoined {
                client, position, ..
            } => self.on_client_joined(client, position),
            StateUpdateMessage::ClientMoved {
                client, position, ..
            } => {
                if client.id == self.client.id {
                    return;
                }
                self.registry.upsert(client.clone(), Some(position));
                self.emit(CollabEvent::ClientMoved { client, position });
            }
            StateUpdateMessage::ClientLeft { client_id, .. } => {
                if client_id == self.client.id {
                    return;
                }
                self.registry.remove(client_id);
                self.emit(CollabEvent::ClientLeft { client_id });
            }
            StateUpdateMessage::RemoteRevision {
                next_revision_id,
                server_revision_id,
                client_id,
                commands,
                ..
            } => self.on_remote_revision(
                workbook,
                next_revision_id,
                server_revision_id,
                client_id,
                commands,
            ),
            StateUpdateMessage::RevisionUndone {
                next_revision_id,
                server_revision_id,
                undone_revision_id,
                ..
            } => self.on_history_message(
                workbook,
                next_revision_id,
                server_revision_id,
                undone_revision_id,
                HistoryKind::Undo,
            ),
            StateUpdateMessage::RevisionRedone {
                next_revision_id,
                server_revision_id,
                redone_revision_id,
                ..
            } => self.on_history_message(
                workbook,
                next_revision_id,
                server_revision_id,
                redone_revision_id,
                HistoryKind::Redo,
            ),
            StateUpdateMessage::Snapshot {
                next_revision_id,
                data,
                ..
            } => self.on_snapshot_data(workbook, next_revision_id, &data),
            StateUpdateMessage::SnapshotCreated {
                next_revision_id,
                server_revision_id,
                ..
            } => self.on_snapshot_created(workbook, next_revision_id, server_revision_id),
        }
    }

    fn on_client_joined(&mut self, client: Client, position: ClientPosition) {
        if client.id == self.client.id {
            return;
        }
        self.registry.upsert(client.clone(), Some(position));
        self.emit(CollabEvent::ClientJoined { client, position });
        // Introduce ourselves so the newcomer sees our cursor without
        // waiting for our next move.
        if self.joined && !self.replaying {
            if let Some(position) = self.local_position {
                let _ = self
                    .transport
                    .send(StateUpdateMessage::client_moved(self.client.clone(), position));
            }
        }
    }

    fn on_remote_revision(
        &mut self,
        workbook: &mut Workbook,
        next_revision_id: RevisionId,
        server_revision_id: RevisionId,
        client_id: ClientId,
        commands: Vec<Command>,
    ) {
        if server_revision_id != self.log.server_revision_id() {
            self.report_desync(server_revision_id);
            return;
        }
        self.processed.insert(next_revision_id);

        // A message under our own client id is the local echo — unless the
        // revision is not in the log at all, which happens when recorded
        // history of a previous session of ours is replayed: that one is
        // applied like any remote revision.
        if client_id == self.client.id && self.log.contains(next_revision_id) {
            // Local echo: already applied optimistically, no replay.
            self.log.acknowledge(next_revision_id);
            self.log.set_server_revision_id(next_revision_id);
            self.resend.acknowledge(next_revision_id);
            // Messages buffered behind the acknowledged one still carry
            // the old base; rebase before the next goes out.
            self.rebase_buffered(workbook);
            self.resend.flush();
            self.emit(CollabEvent::RevisionAcknowledged {
                revision_id: next_revision_id,
            });
            return;
        }

        let outcome = self.log.insert_remote(
            workbook,
            Revision::new(next_revision_id, client_id, commands.clone()),
        );
        self.drop_revisions(&outcome.dropped_pending);
        self.log.set_server_revision_id(next_revision_id);

        // Anything we had in flight was built on the old tip and lost the
        // race at the sequencer; rebase the buffer and send again.
        self.resend.mark_rejected();
        self.rebase_buffered(workbook);
        self.resend.flush();

        if outcome.applied {
            self.emit(CollabEvent::RemoteRevisionApplied { client_id, commands });
        }
    }

    fn on_history_message(
        &mut self,
        workbook: &mut Workbook,
        next_revision_id: RevisionId,
        server_revision_id: RevisionId,
        target: RevisionId,
        kind: HistoryKind,
    ) {
        if server_revision_id != self.log.server_revision_id() {
            self.report_desync(server_revision_id);
            return;
        }
        self.processed.insert(next_revision_id);

        let own = self
            .history_request
            .map(|r| r.next_revision_id == next_revision_id)
            .unwrap_or(false);

        let outcome = match kind {
            HistoryKind::Undo => self.log.undo(workbook, target),
            HistoryKind::Redo => self.log.redo(workbook, target),
        };
        if let Some(dropped) = &outcome {
            self.drop_revisions(dropped);
        }
        self.log.set_server_revision_id(next_revision_id);

        if own {
            self.history_request = None;
            self.resend.acknowledge(next_revision_id);
            match kind {
                HistoryKind::Undo => self.redo_stack.push(target),
                HistoryKind::Redo => self.undo_stack.push(target),
            }
        } else {
            self.resend.mark_rejected();
        }
        self.rebase_buffered(workbook);
        self.resend.flush();

        match outcome {
            Some(_) => self.emit(match kind {
                HistoryKind::Undo => CollabEvent::RevisionUndone { revision_id: target },
                HistoryKind::Redo => CollabEvent::RevisionRedone { revision_id: target },
            }),
            // Target already dropped by a concurrent structural change:
            // silent, the deletion that caused it already explains it.
            None => log::debug!("history request for {target} was a no-op"),
        }
    }

    fn on_snapshot_data(&mut self, workbook: &mut Workbook, next_revision_id: RevisionId, data: &[u8]) {
        match protocol::decode_snapshot_data(data) {
            Ok(data) => {
                self.processed.insert(next_revision_id);
                *workbook = Workbook::from_data(data);
                self.reset_history(next_revision_id);
                self.emit(CollabEvent::SnapshotApplied {
                    revision_id: next_revision_id,
                });
            }
            Err(e) => log::warn!("ignoring malformed snapshot payload: {e}"),
        }
    }

    fn on_snapshot_created(
        &mut self,
        workbook: &mut Workbook,
        next_revision_id: RevisionId,
        server_revision_id: RevisionId,
    ) {
        if server_revision_id != self.log.server_revision_id() {
            self.report_desync(server_revision_id);
            return;
        }
        self.processed.insert(next_revision_id);

        // Pending work was built on history that no longer exists. It is
        // reverted and lost — the accepted cost of compaction.
        let dropped = self.log.take_pending(workbook);
        if !dropped.is_empty() {
            log::info!(
                "snapshot discarded {} pending local revision(s)",
                dropped.len()
            );
        }
        self.reset_history(next_revision_id);
        self.emit(CollabEvent::SnapshotApplied {
            revision_id: next_revision_id,
        });
    }

    /// Forget all collaboration state (log, buffers, stacks) ahead of a
    /// full resync. Presence and identity survive.
    pub fn reset(&mut self) {
        self.log = RevisionLog::new();
        self.resend.clear();
        self.history_request = None;
        self.undo_stack.clear();
        self.redo_stack.clear();
        self.processed.clear();
    }

    fn reset_history(&mut self, server_revision_id: RevisionId) {
        self.log.snapshot(server_revision_id);
        self.resend.clear();
        self.history_request = None;
        self.undo_stack.clear();
        self.redo_stack.clear();
    }

    fn drop_revisions(&mut self, dropped: &[RevisionId]) {
        for id in dropped {
            self.resend.remove(*id);
            self.undo_stack.retain(|r| r != id);
            self.redo_stack.retain(|r| r != id);
        }
    }

    /// Rebase every buffered outbound message onto the current chain tip,
    /// refreshing transformed commands (and snapshot payloads) in place.
    fn rebase_buffered(&mut self, workbook: &Workbook) {
        if self.resend.is_empty() {
            return;
        }
        let server = self.log.server_revision_id();
        let snapshot_data = if self
            .resend
            .iter()
            .any(|m| matches!(m, StateUpdateMessage::Snapshot { .. }))
        {
            protocol::encode_snapshot_data(&workbook.export_data()).ok()
        } else {
            None
        };
        let log = &self.log;
        self.resend.rewrite(|message| {
            message.set_based_on(server);
            match message {
                StateUpdateMessage::RemoteRevision {
                    next_revision_id,
                    commands,
                    ..
                } => {
                    if let Some(current) = log.commands_of(*next_revision_id) {
                        *commands = current.to_vec();
                    }
                }
                StateUpdateMessage::Snapshot { data, .. } => {
                    if let Some(fresh) = &snapshot_data {
                        *data = fresh.clone();
                    }
                }
                _ => {}
            }
        });
    }

    fn report_desync(&mut self, server_revision_id: RevisionId) {
        if self.replaying {
            // Initial-message replay skips unexpected entries silently.
            return;
        }
        log::warn!(
            "unexpected revision id: message based on {server_revision_id}, local tip {}",
            self.log.server_revision_id()
        );
        self.emit(CollabEvent::UnexpectedRevisionId { server_revision_id });
    }
}
