//! Presence tests: join/move/leave across models, and the debounced
//! cursor broadcast driven by a paused virtual clock.

use std::sync::Arc;

use uuid::Uuid;

use gridsync_collab::{
    Client, ClientPosition, LoopbackBus, Model, ModelConfig, StateUpdateMessage, Transport,
    MOVE_DEBOUNCE_WINDOW,
};
use gridsync_core::{SheetId, WorkbookData};

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

fn flush(models: &mut [Model]) {
    loop {
        let handled: usize = models.iter_mut().map(|m| m.process_incoming()).sum();
        if handled == 0 {
            break;
        }
    }
}

fn position(client_id: Uuid, sheet_id: SheetId, col: u32, row: u32) -> ClientPosition {
    ClientPosition {
        client_id,
        sheet_id,
        col,
        row,
    }
}

#[tokio::test]
async fn test_join_exchanges_positions_both_ways() {
    let (_bus, mut models, _sheet) = setup(&["Alice", "Bob"]);

    models[0].join();
    flush(&mut models);
    models[1].join();
    flush(&mut models);

    // Both ends know both clients: the join broadcast one way, the
    // introduction reply the other.
    for model in &models {
        let names: Vec<String> = model
            .connected_clients()
            .all()
            .iter()
            .map(|c| c.client.name.clone())
            .collect();
        assert_eq!(names, vec!["Alice", "Bob"], "seen by {}", model.client().name);
        assert_eq!(model.connected_clients().positions().len(), 2);
    }
}

#[tokio::test(start_paused = true)]
async fn test_rapid_moves_collapse_to_one_broadcast() {
    let (bus, mut models, sheet) = setup(&["Alice", "Bob"]);
    // A raw subscriber counts what actually crosses the wire.
    let mut wire = bus.register(Uuid::new_v4());

    models[0].join();
    models[1].join();
    flush(&mut models);
    while wire.try_recv().is_ok() {}

    let alice_id = models[0].client().id;
    for col in 0..20 {
        models[0].move_cursor(position(alice_id, sheet, col, 3));
        models[0].flush_presence();
    }
    assert!(wire.try_recv().is_err(), "window still open, nothing sent");

    tokio::time::advance(MOVE_DEBOUNCE_WINDOW + std::time::Duration::from_millis(1)).await;
    models[0].flush_presence();
    flush(&mut models);

    let mut moves = 0;
    let mut last_col = None;
    while let Ok(message) = wire.try_recv() {
        if let StateUpdateMessage::ClientMoved { position, .. } = message {
            moves += 1;
            last_col = Some(position.col);
        }
    }
    assert_eq!(moves, 1, "one broadcast per debounce window");
    assert_eq!(last_col, Some(19), "latest position wins");

    // Bob tracked the final position.
    let seen = models[1].connected_clients().get(alice_id).unwrap();
    assert_eq!(seen.position.unwrap().col, 19);
}

#[tokio::test(start_paused = true)]
async fn test_moves_in_separate_windows_all_broadcast() {
    let (bus, mut models, sheet) = setup(&["Alice"]);
    let mut wire = bus.register(Uuid::new_v4());
    models[0].join();
    flush(&mut models);
    while wire.try_recv().is_ok() {}

    let alice_id = models[0].client().id;
    for col in 0..3 {
        models[0].move_cursor(position(alice_id, sheet, col, 0));
        tokio::time::advance(MOVE_DEBOUNCE_WINDOW + std::time::Duration::from_millis(1)).await;
        models[0].flush_presence();
    }

    let mut moves = 0;
    while let Ok(message) = wire.try_recv() {
        if matches!(message, StateUpdateMessage::ClientMoved { .. }) {
            moves += 1;
        }
    }
    assert_eq!(moves, 3);
}

#[tokio::test]
async fn test_leave_removes_client_and_stops_handlers() {
    let (_bus, mut models, _sheet) = setup(&["Alice", "Bob"]);

    models[0].join();
    models[1].join();
    flush(&mut models);
    assert_eq!(models[0].connected_clients().len(), 2);

    models[1].leave();
    flush(&mut models);

    // Alice dropped Bob and his cursor with him.
    assert_eq!(models[0].connected_clients().len(), 1);
    let bob_id = models[1].client().id;
    assert!(models[0].connected_clients().get(bob_id).is_none());

    // A departed session never reacts again, even to join traffic.
    let before = models[1].connected_clients().len();
    models[0].join();
    flush(&mut models);
    assert_eq!(models[1].connected_clients().len(), before);
}

#[tokio::test]
async fn test_newcomer_learns_existing_cursor_positions() {
    let (bus, mut models, sheet) = setup(&["Alice"]);

    models[0].join();
    flush(&mut models);
    // Alice parks her cursor somewhere meaningful.
    let alice_id = models[0].client().id;
    models[0].move_cursor(position(alice_id, sheet, 7, 9));
    flush(&mut models);

    // Bob joins later; Alice introduces herself with her live position.
    let mut bob = model_on(&bus, WorkbookData::single_sheet(sheet), "Bob");
    bob.join();
    flush(&mut models);
    bob.process_incoming();

    let seen = bob.connected_clients().get(models[0].client().id).unwrap();
    let seen_position = seen.position.unwrap();
    assert_eq!((seen_position.col, seen_position.row), (7, 9));
}
