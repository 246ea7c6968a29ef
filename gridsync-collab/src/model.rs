//! Host-facing façade: one document replica plus its session.
//!
//! The host dispatches commands, pumps incoming messages, and reads
//! events. Message delivery and handling both run to completion per
//! message — there is no partial application of a revision.

use std::sync::Arc;

use tokio::sync::mpsc;

use gridsync_core::{
    CancelledReason, Command, CommandResult, RevisionId, Workbook, WorkbookData,
};

use crate::presence::{Client, ClientPosition, ClientRegistry};
use crate::protocol::StateUpdateMessage;
use crate::session::{CollabEvent, ConcurrencyState, Session};
use crate::transport::Transport;

pub struct ModelConfig {
    pub client: Client,
    pub transport: Arc<dyn Transport>,
    /// Base state of the replica, usually a snapshot export.
    pub data: WorkbookData,
    /// Recorded history to fast-forward through before listening live.
    /// Malformed or out-of-chain entries are skipped, never fatal.
    pub initial_messages: Vec<StateUpdateMessage>,
}

pub struct Model {
    workbook: Workbook,
    session: Session,
    incoming: mpsc::UnboundedReceiver<StateUpdateMessage>,
}

impl Model {
    pub fn new(config: ModelConfig) -> Self {
        let incoming = config.transport.register(config.client.id);
        let mut workbook = Workbook::from_data(config.data);
        let mut session = Session::new(config.client, config.transport);
        session.fast_forward(&mut workbook, config.initial_messages);
        Self {
            workbook,
            session,
            incoming,
        }
    }

    // ── Document API ────────────────────────────────────────────────

    /// Dispatch one command as its own atomic revision.
    pub fn dispatch(&mut self, command: Command) -> CommandResult {
        self.dispatch_batch(vec![command])
    }

    /// Dispatch a batch of commands as one atomic revision: applied,
    /// transformed, undone and replayed as a single unit.
    pub fn dispatch_batch(&mut self, commands: Vec<Command>) -> CommandResult {
        self.session.save(&mut self.workbook, commands)
    }

    /// Dry-run validation, including session availability.
    pub fn can_dispatch(&self, command: &Command) -> CommandResult {
        if self.session.state() != ConcurrencyState::Idle {
            return CommandResult::cancelled(CancelledReason::WaitingSessionConfirmation);
        }
        self.workbook.check(command)
    }

    pub fn export_data(&self) -> WorkbookData {
        self.workbook.export_data()
    }

    pub fn workbook(&self) -> &Workbook {
        &self.workbook
    }

    pub fn undo(&mut self) -> CommandResult {
        self.session.undo()
    }

    pub fn redo(&mut self) -> CommandResult {
        self.session.redo()
    }

    /// Compact the shared revision log into the current state.
    pub fn snapshot(&mut self) -> CommandResult {
        self.session.snapshot(&self.workbook)
    }

    // ── Presence API ────────────────────────────────────────────────

    pub fn join(&mut self) {
        self.session.join(&self.workbook);
    }

    pub fn move_cursor(&mut self, position: ClientPosition) {
        self.session.move_cursor(position);
    }

    pub fn leave(&mut self) {
        self.session.leave();
    }

    pub fn connected_clients(&self) -> &ClientRegistry {
        self.session.connected_clients()
    }

    // ── Pump ────────────────────────────────────────────────────────

    /// Drain and handle every message already delivered by the transport.
    /// Returns how many messages were handled.
    pub fn process_incoming(&mut self) -> usize {
        let mut handled = 0;
        while let Ok(message) = self.incoming.try_recv() {
            self.session.handle_message(&mut self.workbook, message);
            handled += 1;
        }
        handled
    }

    /// Await the next message and handle it. Returns `false` once the
    /// transport side is gone.
    pub async fn process_next(&mut self) -> bool {
        match self.incoming.recv().await {
            Some(message) => {
                self.session.handle_message(&mut self.workbook, message);
                true
            }
            None => false,
        }
    }

    /// Fire the debounced cursor broadcast if it is due.
    pub fn flush_presence(&mut self) {
        self.session.flush_presence();
    }

    /// Deadline of the pending cursor broadcast, if one is armed.
    pub fn presence_deadline(&self) -> Option<tokio::time::Instant> {
        self.session.presence_deadline()
    }

    // ── Introspection / recovery ────────────────────────────────────

    pub fn client(&self) -> &Client {
        self.session.client()
    }

    pub fn state(&self) -> ConcurrencyState {
        self.session.state()
    }

    pub fn server_revision_id(&self) -> RevisionId {
        self.session.server_revision_id()
    }

    pub fn pending_revision_count(&self) -> usize {
        self.session.pending_revision_count()
    }

    pub fn take_event_rx(&mut self) -> Option<mpsc::UnboundedReceiver<CollabEvent>> {
        self.session.take_event_rx()
    }

    /// Rebuild the replica after a protocol desync
    /// (`CollabEvent::UnexpectedRevisionId`): fresh base state, then a
    /// replay of the authoritative history. Local pending work is lost.
    pub fn resync_from(&mut self, data: WorkbookData, messages: Vec<StateUpdateMessage>) {
        log::info!("resynchronizing replica from {} message(s)", messages.len());
        self.workbook = Workbook::from_data(data);
        self.session.reset();
        self.session.fast_forward(&mut self.workbook, messages);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::LoopbackBus;
    use gridsync_core::CellPosition;
    use uuid::Uuid;

    fn update(sheet_id: Uuid, col: u32, row: u32, content: &str) -> Command {
        Command::UpdateCell {
            sheet_id,
            position: CellPosition::new(col, row),
            content: content.into(),
        }
    }

    fn model_on(bus: &Arc<LoopbackBus>, data: WorkbookData, name: &str) -> Model {
        Model::new(ModelConfig {
            client: Client::new(name),
            transport: bus.clone() as Arc<dyn Transport>,
            data,
            initial_messages: bus.initial_messages(),
        })
    }

    #[tokio::test]
    async fn test_dispatch_and_export() {
        let bus = Arc::new(LoopbackBus::new());
        let sheet = Uuid::new_v4();
        let mut model = model_on(&bus, WorkbookData::single_sheet(sheet), "Alice");

        assert!(model.dispatch(update(sheet, 0, 0, "hello")).is_successful());
        let data = model.export_data();
        assert_eq!(
            data.sheets[0].cells[&CellPosition::new(0, 0)].content,
            "hello"
        );
    }

    #[tokio::test]
    async fn test_late_joiner_fast_forwards_through_history() {
        let bus = Arc::new(LoopbackBus::new());
        let sheet = Uuid::new_v4();
        let data = WorkbookData::single_sheet(sheet);

        let mut alice = model_on(&bus, data.clone(), "Alice");
        assert!(alice.dispatch(update(sheet, 0, 0, "first")).is_successful());
        alice.process_incoming();
        assert!(alice.dispatch(update(sheet, 1, 0, "second")).is_successful());
        alice.process_incoming();

        // Bob starts from the same base and replays the recorded history.
        let bob = model_on(&bus, data, "Bob");
        assert_eq!(bob.export_data(), alice.export_data());
        assert_eq!(bob.server_revision_id(), alice.server_revision_id());
    }

    #[tokio::test]
    async fn test_malformed_initial_messages_are_skipped() {
        let bus = Arc::new(LoopbackBus::new());
        let sheet = Uuid::new_v4();
        let data = WorkbookData::single_sheet(sheet);

        let mut alice = model_on(&bus, data.clone(), "Alice");
        assert!(alice.dispatch(update(sheet, 0, 0, "good")).is_successful());
        alice.process_incoming();

        let mut messages = bus.initial_messages();
        // An out-of-chain revision and a bogus snapshot payload.
        messages.push(StateUpdateMessage::remote_revision(
            Uuid::new_v4(),
            Uuid::new_v4(),
            Uuid::new_v4(),
            vec![update(sheet, 5, 5, "stale")],
        ));
        messages.push(StateUpdateMessage::snapshot(
            Uuid::new_v4(),
            Uuid::new_v4(),
            vec![0xDE, 0xAD],
        ));

        let bob = Model::new(ModelConfig {
            client: Client::new("Bob"),
            transport: bus.clone() as Arc<dyn Transport>,
            data,
            initial_messages: messages,
        });
        assert_eq!(bob.export_data(), alice.export_data());
    }

    #[tokio::test]
    async fn test_can_dispatch_reports_busy_session() {
        let bus = Arc::new(LoopbackBus::new());
        let sheet = Uuid::new_v4();
        let mut model = model_on(&bus, WorkbookData::single_sheet(sheet), "Alice");

        assert!(model.can_dispatch(&update(sheet, 0, 0, "x")).is_successful());
        assert!(model.dispatch(update(sheet, 0, 0, "x")).is_successful());
        assert_eq!(
            model.can_dispatch(&update(sheet, 1, 0, "y")).reasons(),
            &[CancelledReason::WaitingSessionConfirmation]
        );

        model.process_incoming();
        assert!(model.can_dispatch(&update(sheet, 1, 0, "y")).is_successful());
    }

    #[tokio::test]
    async fn test_resync_rebuilds_from_authoritative_history() {
        let bus = Arc::new(LoopbackBus::new());
        let sheet = Uuid::new_v4();
        let data = WorkbookData::single_sheet(sheet);

        let mut alice = model_on(&bus, data.clone(), "Alice");
        assert!(alice.dispatch(update(sheet, 2, 2, "truth")).is_successful());
        alice.process_incoming();

        let mut bob = model_on(&bus, data.clone(), "Bob");
        // Simulate divergence, then recover through resync.
        bob.resync_from(data, bus.initial_messages());
        assert_eq!(bob.export_data(), alice.export_data());
        assert_eq!(bob.server_revision_id(), alice.server_revision_id());
    }
}
