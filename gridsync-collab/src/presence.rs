//! Client presence: who is connected and where their cursor is.
//!
//! Cursor moves are the chattiest message on the wire, so local moves go
//! through a [`Debounce`] window: within one window only the latest
//! position survives, and exactly one `ClientMoved` goes out when the
//! deadline fires. The deadline uses `tokio::time::Instant`, which tests
//! drive with a paused virtual clock instead of real timers.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use gridsync_core::{ClientId, SheetId};

/// How long a burst of cursor moves is coalesced before one goes out.
pub const MOVE_DEBOUNCE_WINDOW: Duration = Duration::from_millis(80);

/// Stable identity of one connected participant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Client {
    pub id: ClientId,
    pub name: String,
    /// Opaque host-app payload (avatar URL, team, ...). Not interpreted.
    pub custom_data: Option<serde_json::Value>,
}

impl Client {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: ClientId::new_v4(),
            name: name.into(),
            custom_data: None,
        }
    }

    /// Create with explicit id (for testing).
    pub fn with_id(id: ClientId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            custom_data: None,
        }
    }
}

/// Ephemeral cursor location of one client.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ClientPosition {
    pub client_id: ClientId,
    pub sheet_id: SheetId,
    pub col: u32,
    pub row: u32,
}

/// A connected client together with its last known position.
#[derive(Debug, Clone)]
pub struct ConnectedClient {
    pub client: Client,
    pub position: Option<ClientPosition>,
}

/// Registry of every client currently in the document.
#[derive(Debug, Default)]
pub struct ClientRegistry {
    clients: HashMap<ClientId, ConnectedClient>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or refresh a client, replacing its position.
    pub fn upsert(&mut self, client: Client, position: Option<ClientPosition>) {
        self.clients
            .insert(client.id, ConnectedClient { client, position });
    }

    pub fn remove(&mut self, client_id: ClientId) -> Option<ConnectedClient> {
        self.clients.remove(&client_id)
    }

    pub fn get(&self, client_id: ClientId) -> Option<&ConnectedClient> {
        self.clients.get(&client_id)
    }

    pub fn contains(&self, client_id: ClientId) -> bool {
        self.clients.contains_key(&client_id)
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    /// Connected clients, sorted by name for stable iteration.
    pub fn all(&self) -> Vec<&ConnectedClient> {
        let mut clients: Vec<_> = self.clients.values().collect();
        clients.sort_by(|a, b| a.client.name.cmp(&b.client.name));
        clients
    }

    /// Every known cursor position.
    pub fn positions(&self) -> Vec<ClientPosition> {
        self.clients.values().filter_map(|c| c.position).collect()
    }
}

/// Trailing-edge debounce with an explicit, pollable deadline.
///
/// The first push arms a deadline one window away; later pushes within
/// the window only replace the value. `poll` fires at most once per
/// armed window.
#[derive(Debug)]
pub struct Debounce<T> {
    window: Duration,
    pending: Option<T>,
    deadline: Option<Instant>,
}

impl<T> Debounce<T> {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            pending: None,
            deadline: None,
        }
    }

    /// Record a value; arms the deadline if none is armed.
    pub fn push(&mut self, value: T) {
        if self.deadline.is_none() {
            self.deadline = Some(Instant::now() + self.window);
        }
        self.pending = Some(value);
    }

    /// Take the latest value if the deadline has passed.
    pub fn poll(&mut self) -> Option<T> {
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => {
                self.deadline = None;
                self.pending.take()
            }
            _ => None,
        }
    }

    /// The armed deadline, if any (for schedulers that want to sleep).
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Drop the pending value and disarm.
    pub fn cancel(&mut self) {
        self.deadline = None;
        self.pending = None;
    }

    pub fn is_armed(&self) -> bool {
        self.deadline.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn position(client_id: ClientId, col: u32) -> ClientPosition {
        ClientPosition {
            client_id,
            sheet_id: Uuid::new_v4(),
            col,
            row: 0,
        }
    }

    #[test]
    fn test_registry_upsert_and_remove() {
        let mut registry = ClientRegistry::new();
        let alice = Client::new("Alice");
        let id = alice.id;

        registry.upsert(alice, Some(position(id, 3)));
        assert!(registry.contains(id));
        assert_eq!(registry.positions().len(), 1);

        let removed = registry.remove(id).unwrap();
        assert_eq!(removed.client.name, "Alice");
        assert!(registry.is_empty());
    }

    #[test]
    fn test_registry_sorted_listing() {
        let mut registry = ClientRegistry::new();
        registry.upsert(Client::new("Zoe"), None);
        registry.upsert(Client::new("Alice"), None);
        let names: Vec<_> = registry.all().iter().map(|c| c.client.name.as_str()).collect();
        assert_eq!(names, vec!["Alice", "Zoe"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_debounce_holds_until_deadline() {
        let mut debounce = Debounce::new(Duration::from_millis(80));
        debounce.push(1u32);
        assert!(debounce.poll().is_none());

        tokio::time::advance(Duration::from_millis(81)).await;
        assert_eq!(debounce.poll(), Some(1));
        assert!(!debounce.is_armed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_debounce_keeps_only_latest_value() {
        let mut debounce = Debounce::new(Duration::from_millis(80));
        for value in 0..10u32 {
            debounce.push(value);
        }
        tokio::time::advance(Duration::from_millis(81)).await;
        assert_eq!(debounce.poll(), Some(9));
        // The window is spent: nothing further to emit.
        assert_eq!(debounce.poll(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_debounce_rearms_after_firing() {
        let mut debounce = Debounce::new(Duration::from_millis(80));
        debounce.push(1u32);
        tokio::time::advance(Duration::from_millis(81)).await;
        assert_eq!(debounce.poll(), Some(1));

        debounce.push(2u32);
        assert!(debounce.poll().is_none());
        tokio::time::advance(Duration::from_millis(81)).await;
        assert_eq!(debounce.poll(), Some(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_debounce_cancel() {
        let mut debounce = Debounce::new(Duration::from_millis(80));
        debounce.push(1u32);
        debounce.cancel();
        tokio::time::advance(Duration::from_millis(200)).await;
        assert_eq!(debounce.poll(), None);
    }
}
