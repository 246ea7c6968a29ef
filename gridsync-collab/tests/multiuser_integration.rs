//! End-to-end convergence tests: several models sharing one sequencer,
//! concurrency windows, disconnects, undo races and snapshot compaction.

use std::sync::Arc;

use uuid::Uuid;

use gridsync_collab::{
    Client, CollabEvent, LoopbackBus, Model, ModelConfig, ReadOnlyTransport, Session,
    StateUpdateMessage, Transport,
};
use gridsync_core::{
    CellPosition, Command, CommandResult, InsertPosition, SheetId, Workbook, WorkbookData,
};

fn update(sheet_id: SheetId, col: u32, row: u32, content: &str) -> Command {
    Command::UpdateCell {
        sheet_id,
        position: CellPosition::new(col, row),
        content: content.into(),
    }
}

fn add_columns(sheet_id: SheetId, base: u32, quantity: u32) -> Command {
    Command::AddColumns {
        sheet_id,
        base,
        position: InsertPosition::Before,
        quantity,
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

fn setup(names: &[&str]) -> (Arc<LoopbackBus>, Vec<Model>, SheetId) {
    let bus = Arc::new(LoopbackBus::new());
    let sheet_id = Uuid::new_v4();
    let data = WorkbookData::single_sheet(sheet_id);
    let models = names.iter().map(|n| model_on(&bus, data.clone(), n)).collect();
    (bus, models, sheet_id)
}

/// Pump every model until the whole network is quiescent.
fn flush(models: &mut [Model]) {
    loop {
        let handled: usize = models.iter_mut().map(|m| m.process_incoming()).sum();
        if handled == 0 {
            break;
        }
    }
}

/// Every replica exports identical data and agrees on the log position.
fn assert_synchronized(models: &[Model]) {
    let reference = models[0].export_data();
    let tip = models[0].server_revision_id();
    for model in &models[1..] {
        assert_eq!(
            model.export_data(),
            reference,
            "replica {} diverged",
            model.client().name
        );
        assert_eq!(model.server_revision_id(), tip);
    }
}

fn cell_content(model: &Model, sheet_id: SheetId, col: u32, row: u32) -> Option<String> {
    model
        .workbook()
        .sheet(sheet_id)
        .and_then(|s| s.cell(CellPosition::new(col, row)))
        .map(|c| c.content.clone())
}

#[tokio::test]
async fn test_sequential_edits_converge() {
    let (_bus, mut models, sheet) = setup(&["Alice", "Bob"]);

    assert!(models[0].dispatch(update(sheet, 0, 0, "from alice")).is_successful());
    flush(&mut models);
    assert!(models[1].dispatch(update(sheet, 1, 0, "from bob")).is_successful());
    flush(&mut models);

    assert_synchronized(&models);
    assert_eq!(cell_content(&models[0], sheet, 0, 0).as_deref(), Some("from alice"));
    assert_eq!(cell_content(&models[0], sheet, 1, 0).as_deref(), Some("from bob"));
}

#[tokio::test]
async fn test_concurrent_edits_last_in_canonical_order_wins() {
    let (bus, mut models, sheet) = setup(&["Alice", "Bob"]);

    bus.pause();
    assert!(models[0].dispatch(update(sheet, 0, 0, "hello Bob")).is_successful());
    assert!(models[1].dispatch(update(sheet, 0, 0, "Hi Alice")).is_successful());
    // Each replica optimistically shows its own value inside the window.
    assert_eq!(cell_content(&models[0], sheet, 0, 0).as_deref(), Some("hello Bob"));
    assert_eq!(cell_content(&models[1], sheet, 0, 0).as_deref(), Some("Hi Alice"));

    bus.resume();
    flush(&mut models);

    // Alice won the race, so Bob's rebased revision lands last.
    assert_synchronized(&models);
    assert_eq!(cell_content(&models[0], sheet, 0, 0).as_deref(), Some("Hi Alice"));
}

#[tokio::test]
async fn test_concurrent_column_insert_and_cell_edit() {
    let (bus, mut models, sheet) = setup(&["Alice", "Bob"]);

    bus.pause();
    assert!(models[0].dispatch(add_columns(sheet, 0, 1)).is_successful());
    assert!(models[1].dispatch(update(sheet, 1, 0, "payload")).is_successful());
    bus.resume();
    flush(&mut models);

    // Bob's B1 edit lands in C1 after the column insert.
    assert_synchronized(&models);
    assert_eq!(cell_content(&models[0], sheet, 2, 0).as_deref(), Some("payload"));
    assert_eq!(cell_content(&models[0], sheet, 1, 0), None);
}

#[tokio::test]
async fn test_offline_revisions_resend_in_order() {
    let (bus, mut models, sheet) = setup(&["Alice", "Bob"]);
    let mut bob_events = models[1].take_event_rx().unwrap();

    bus.set_offline(true);
    for (col, text) in [(0, "a"), (1, "b"), (2, "c")] {
        assert!(models[0].dispatch(update(sheet, col, 0, text)).is_successful());
    }
    assert_eq!(models[0].pending_revision_count(), 3);

    bus.set_offline(false);
    // No reconnect signal exists: the next outgoing attempt drains the
    // buffer, one acknowledgment at a time.
    assert!(models[0].dispatch(update(sheet, 3, 0, "d")).is_successful());
    flush(&mut models);

    assert_synchronized(&models);
    assert_eq!(models[0].pending_revision_count(), 0);

    let mut applied = Vec::new();
    while let Ok(event) = bob_events.try_recv() {
        if let CollabEvent::RemoteRevisionApplied { commands, .. } = event {
            for command in commands {
                if let Command::UpdateCell { content, .. } = command {
                    applied.push(content);
                }
            }
        }
    }
    assert_eq!(applied, vec!["a", "b", "c", "d"]);
}

#[tokio::test]
async fn test_undo_redo_inverse_law() {
    let (_bus, mut models, sheet) = setup(&["Alice", "Bob"]);
    let pristine = models[0].export_data();

    assert!(models[0].dispatch(update(sheet, 2, 2, "payload")).is_successful());
    flush(&mut models);
    let with_edit = models[0].export_data();

    assert!(models[0].undo().is_successful());
    flush(&mut models);
    assert_eq!(models[0].export_data(), pristine);
    assert_synchronized(&models);

    assert!(models[0].redo().is_successful());
    flush(&mut models);
    assert_eq!(models[0].export_data(), with_edit);
    assert_synchronized(&models);
}

#[tokio::test]
async fn test_undo_only_touches_own_revisions() {
    let (_bus, mut models, sheet) = setup(&["Alice", "Bob"]);

    assert!(models[0].dispatch(update(sheet, 0, 0, "alice")).is_successful());
    flush(&mut models);
    assert!(models[1].dispatch(update(sheet, 1, 0, "bob")).is_successful());
    flush(&mut models);

    // Alice undoes: her own revision goes, Bob's survives.
    assert!(models[0].undo().is_successful());
    flush(&mut models);

    assert_synchronized(&models);
    assert_eq!(cell_content(&models[1], sheet, 0, 0), None);
    assert_eq!(cell_content(&models[1], sheet, 1, 0).as_deref(), Some("bob"));
}

#[tokio::test]
async fn test_undo_race_drops_dependent_revision_only() {
    let (bus, mut models, sheet) = setup(&["Alice", "Bob", "Carol"]);

    // Alice inserts a column; everyone applies it.
    assert!(models[0].dispatch(add_columns(sheet, 0, 1)).is_successful());
    flush(&mut models);

    bus.pause();
    // Alice undoes the insert while Bob edits inside the inserted column
    // and Carol edits far away.
    assert!(models[0].undo().is_successful());
    assert!(models[1].dispatch(update(sheet, 0, 0, "doomed")).is_successful());
    assert!(models[2].dispatch(update(sheet, 5, 5, "survivor")).is_successful());
    bus.resume();
    flush(&mut models);

    assert_synchronized(&models);
    // Bob's edit depended on the undone insert: dropped in full, silently.
    for model in &models {
        assert_eq!(cell_content(model, sheet, 0, 0), None, "{}", model.client().name);
    }
    // Carol's edit shifted back with the removed column.
    assert_eq!(cell_content(&models[0], sheet, 4, 5).as_deref(), Some("survivor"));
    assert_eq!(models[1].pending_revision_count(), 0);
}

#[tokio::test]
async fn test_undo_of_already_dropped_revision_is_silent() {
    let (bus, mut models, sheet) = setup(&["Alice", "Bob"]);

    // A second sheet lets the first be deleted.
    let second = Uuid::new_v4();
    assert!(models[0]
        .dispatch(Command::CreateSheet {
            sheet_id: second,
            name: "Second".into(),
            index: 1,
        })
        .is_successful());
    flush(&mut models);

    bus.pause();
    // Bob's edit races with Alice deleting the sheet under it.
    assert!(models[0].dispatch(Command::DeleteSheet { sheet_id: sheet }).is_successful());
    assert!(models[1].dispatch(update(sheet, 0, 0, "orphan")).is_successful());
    bus.resume();
    flush(&mut models);
    assert_synchronized(&models);

    // Bob's revision was dropped; his undo stack skips straight past it.
    let result = models[1].undo();
    assert_eq!(
        result,
        CommandResult::cancelled(gridsync_core::CancelledReason::EmptyUndoStack)
    );
}

#[tokio::test]
async fn test_snapshot_compacts_and_serves_late_joiners() {
    let (bus, mut models, sheet) = setup(&["Alice", "Bob"]);

    assert!(models[0].dispatch(update(sheet, 0, 0, "kept")).is_successful());
    flush(&mut models);

    assert!(models[0].snapshot().is_successful());
    flush(&mut models);
    assert_synchronized(&models);

    // The bus history collapsed to the snapshot itself.
    let history = bus.initial_messages();
    assert_eq!(history.len(), 1);
    assert!(matches!(history[0], StateUpdateMessage::Snapshot { .. }));

    // A late joiner bootstraps from the snapshot alone.
    let carol = model_on(&bus, WorkbookData::single_sheet(sheet), "Carol");
    assert_eq!(carol.export_data(), models[0].export_data());
    assert_eq!(carol.server_revision_id(), models[0].server_revision_id());

    // Editing continues on the new baseline.
    assert!(models[0].dispatch(update(sheet, 1, 0, "after")).is_successful());
    flush(&mut models);
    assert_synchronized(&models);
}

#[tokio::test]
async fn test_snapshot_race_rejects_concurrent_revision() {
    let (bus, mut models, sheet) = setup(&["Alice", "Bob"]);

    assert!(models[0].dispatch(update(sheet, 0, 0, "base")).is_successful());
    flush(&mut models);

    bus.pause();
    assert!(models[0].snapshot().is_successful());
    assert!(models[1].dispatch(update(sheet, 1, 0, "too late")).is_successful());
    // Bob sees his edit locally while the race is still open.
    assert_eq!(cell_content(&models[1], sheet, 1, 0).as_deref(), Some("too late"));
    bus.resume();
    flush(&mut models);

    // The snapshot cut history from under the revision: it is rejected
    // and Bob's optimistic edit is rolled back, not merged.
    assert_synchronized(&models);
    for model in &models {
        assert_eq!(cell_content(model, sheet, 1, 0), None, "{}", model.client().name);
    }
    assert_eq!(cell_content(&models[0], sheet, 0, 0).as_deref(), Some("base"));
    assert_eq!(models[1].pending_revision_count(), 0);
}

#[tokio::test]
async fn test_duplicate_initial_messages_apply_once() {
    let (bus, mut models, sheet) = setup(&["Alice"]);
    let base_cols = models[0].workbook().sheet(sheet).unwrap().col_count;

    assert!(models[0].dispatch(add_columns(sheet, 0, 1)).is_successful());
    flush(&mut models);

    // The same history delivered twice: replay must be idempotent.
    let mut doubled = bus.initial_messages();
    doubled.extend(bus.initial_messages());
    let bob = Model::new(ModelConfig {
        client: Client::new("Bob"),
        transport: bus.clone() as Arc<dyn Transport>,
        data: WorkbookData::single_sheet(sheet),
        initial_messages: doubled,
    });

    assert_eq!(bob.workbook().sheet(sheet).unwrap().col_count, base_cols + 1);
    assert_eq!(bob.export_data(), models[0].export_data());
}

#[tokio::test]
async fn test_duplicate_live_delivery_is_noop() {
    let bus = Arc::new(LoopbackBus::new());
    let sheet = Uuid::new_v4();
    let mut workbook = Workbook::from_data(WorkbookData::single_sheet(sheet));
    let base_cols = workbook.sheet(sheet).unwrap().col_count;
    let mut session = Session::new(Client::new("Alice"), bus as Arc<dyn Transport>);

    let message = StateUpdateMessage::remote_revision(
        Uuid::new_v4(),
        session.server_revision_id(),
        Uuid::new_v4(),
        vec![add_columns(sheet, 0, 1)],
    );
    session.handle_message(&mut workbook, message.clone());
    session.handle_message(&mut workbook, message);

    assert_eq!(workbook.sheet(sheet).unwrap().col_count, base_cols + 1);
}

#[tokio::test]
async fn test_read_only_observer_gets_content_but_writes_nothing() {
    let (bus, mut models, sheet) = setup(&["Alice"]);

    let observer_transport = Arc::new(ReadOnlyTransport::new(bus.clone() as Arc<dyn Transport>));
    let mut observer = Model::new(ModelConfig {
        client: Client::new("Observer"),
        transport: observer_transport as Arc<dyn Transport>,
        data: WorkbookData::single_sheet(sheet),
        initial_messages: bus.initial_messages(),
    });
    observer.join();
    models[0].join();
    flush(&mut models);
    observer.process_incoming();
    models[0].process_incoming();

    // Presence crossed the filter in both directions.
    assert!(models[0]
        .connected_clients()
        .all()
        .iter()
        .any(|c| c.client.name == "Observer"));
    assert!(observer
        .connected_clients()
        .all()
        .iter()
        .any(|c| c.client.name == "Alice"));

    // Observer output is filtered: its edit never reaches Alice.
    assert!(observer.dispatch(update(sheet, 0, 0, "illicit")).is_successful());
    flush(&mut models);
    models[0].process_incoming();
    assert_eq!(cell_content(&models[0], sheet, 0, 0), None);

    // Content still flows inward.
    assert!(models[0].dispatch(update(sheet, 1, 0, "official")).is_successful());
    flush(&mut models);
    observer.process_incoming();
    assert_eq!(cell_content(&observer, sheet, 1, 0).as_deref(), Some("official"));
}

#[tokio::test]
async fn test_many_clients_randomized_rounds_converge() {
    let (bus, mut models, sheet) = setup(&["A", "B", "C", "D"]);

    // Several rounds of concurrent writes across distinct cells.
    for round in 0..5u32 {
        bus.pause();
        for (i, model) in models.iter_mut().enumerate() {
            let cmd = update(sheet, i as u32, round, &format!("r{round}c{i}"));
            assert!(model.dispatch(cmd).is_successful());
        }
        bus.resume();
        flush(&mut models);
    }

    assert_synchronized(&models);
    // Every write survived: all cells are disjoint.
    for round in 0..5u32 {
        for i in 0..4u32 {
            assert_eq!(
                cell_content(&models[0], sheet, i, round).as_deref(),
                Some(format!("r{round}c{i}").as_str())
            );
        }
    }
}
