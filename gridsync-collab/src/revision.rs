//! The shared revision log: ordered history plus local pending work.
//!
//! Entries are ordered [acknowledged..., pending...]. Remote revisions are
//! inserted at the pending boundary: pending work is mechanically reverted,
//! the remote batch applied, then pending revisions are transformed
//! (remote wins) and reapplied. A pending revision whose batch transforms
//! to empty is dropped in full — its optimistic effect simply disappears.
//!
//! Selective undo works the same way: check out the document to just
//! before the target, deactivate it, transform everything after it against
//! the target's structural inverse, and replay.

use uuid::Uuid;

use gridsync_core::{ClientId, Command, RevisionId, StateChange, Workbook};

use crate::transform::{invert_for_transform, transform_revision};

/// The log position every replica starts from.
pub const INITIAL_SERVER_REVISION_ID: RevisionId = Uuid::nil();

/// An immutable, atomic batch of commands from one client.
#[derive(Debug, Clone, PartialEq)]
pub struct Revision {
    pub id: RevisionId,
    pub client_id: ClientId,
    pub commands: Vec<Command>,
}

impl Revision {
    pub fn new(id: RevisionId, client_id: ClientId, commands: Vec<Command>) -> Self {
        Self {
            id,
            client_id,
            commands,
        }
    }
}

#[derive(Debug)]
struct LogEntry {
    revision: Revision,
    /// Recorded changes from the last time this entry was applied.
    /// Empty while the entry is inactive (undone) or checked out.
    changes: Vec<StateChange>,
    undone: bool,
    acknowledged: bool,
}

/// Outcome of inserting a remote revision.
#[derive(Debug, Default)]
pub struct RemoteInsertOutcome {
    pub applied: bool,
    /// Local pending revisions dropped because they transformed to empty.
    pub dropped_pending: Vec<RevisionId>,
}

#[derive(Debug, Default)]
pub struct RevisionLog {
    entries: Vec<LogEntry>,
    server_revision_id: RevisionId,
}

impl RevisionLog {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            server_revision_id: INITIAL_SERVER_REVISION_ID,
        }
    }

    pub fn server_revision_id(&self) -> RevisionId {
        self.server_revision_id
    }

    pub fn set_server_revision_id(&mut self, id: RevisionId) {
        self.server_revision_id = id;
    }

    pub fn contains(&self, id: RevisionId) -> bool {
        self.entries.iter().any(|e| e.revision.id == id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn commands_of(&self, id: RevisionId) -> Option<&[Command]> {
        self.entries
            .iter()
            .find(|e| e.revision.id == id)
            .map(|e| e.revision.commands.as_slice())
    }

    /// Whether a revision is present and active (not undone).
    pub fn is_active(&self, id: RevisionId) -> bool {
        self.entries
            .iter()
            .any(|e| e.revision.id == id && !e.undone)
    }

    fn position(&self, id: RevisionId) -> Option<usize> {
        self.entries.iter().position(|e| e.revision.id == id)
    }

    fn first_pending_index(&self) -> usize {
        self.entries
            .iter()
            .position(|e| !e.acknowledged)
            .unwrap_or(self.entries.len())
    }

    pub fn has_pending(&self) -> bool {
        self.entries.iter().any(|e| !e.acknowledged)
    }

    pub fn pending_revisions(&self) -> Vec<&Revision> {
        self.entries
            .iter()
            .filter(|e| !e.acknowledged)
            .map(|e| &e.revision)
            .collect()
    }

    /// Append a revision whose changes were already applied to the
    /// document (the optimistic local path). Duplicate ids and empty
    /// batches are rejected: redelivery must be a no-op.
    pub fn append(&mut self, revision: Revision, changes: Vec<StateChange>, acknowledged: bool) -> bool {
        if revision.commands.is_empty() {
            return false;
        }
        if self.contains(revision.id) {
            log::debug!("revision {} already in log, ignoring duplicate", revision.id);
            return false;
        }
        self.entries.push(LogEntry {
            revision,
            changes,
            undone: false,
            acknowledged,
        });
        true
    }

    /// Mark a pending local revision as acknowledged by the network.
    pub fn acknowledge(&mut self, id: RevisionId) -> bool {
        match self.entries.iter_mut().find(|e| e.revision.id == id) {
            Some(entry) => {
                entry.acknowledged = true;
                true
            }
            None => false,
        }
    }

    /// Insert a remote revision at the canonical position, transforming
    /// local pending work to assume the remote batch already happened.
    pub fn insert_remote(&mut self, workbook: &mut Workbook, revision: Revision) -> RemoteInsertOutcome {
        if revision.commands.is_empty() || self.contains(revision.id) {
            return RemoteInsertOutcome::default();
        }
        let split = self.first_pending_index();

        // Roll pending optimistic work back, newest first.
        for entry in self.entries[split..].iter_mut().rev() {
            workbook.revert_changes(&entry.changes);
            entry.changes.clear();
        }

        // Apply the remote batch on the confirmed state.
        let (mut changes, failed) = apply_batch(workbook, &revision.commands);
        if failed {
            // Every replica evaluates the same deterministic replay, so a
            // rejection here is identical everywhere. Keep the id known,
            // inactive.
            workbook.revert_changes(&changes);
            changes.clear();
            log::warn!("remote revision {} rejected by dispatch, dropping", revision.id);
        }
        let executed = revision.commands.clone();
        self.entries.insert(
            split,
            LogEntry {
                revision,
                changes,
                undone: failed,
                acknowledged: true,
            },
        );

        let dropped_pending = self.reapply_from(workbook, split + 1, &executed);
        RemoteInsertOutcome {
            applied: !failed,
            dropped_pending,
        }
    }

    /// Revert the document to just before `revision_id`. Recorded changes
    /// of the reverted suffix are cleared until the next replay.
    pub fn checkout_before(&mut self, workbook: &mut Workbook, revision_id: RevisionId) -> Option<usize> {
        let idx = self.position(revision_id)?;
        for entry in self.entries[idx..].iter_mut().rev() {
            workbook.revert_changes(&entry.changes);
            entry.changes.clear();
        }
        Some(idx)
    }

    /// Selectively undo one revision. Returns `None` (a silent no-op) when
    /// the target is unknown or already inactive — e.g. it was dropped by
    /// a concurrent structural deletion.
    pub fn undo(&mut self, workbook: &mut Workbook, target: RevisionId) -> Option<Vec<RevisionId>> {
        let idx = self.position(target)?;
        if self.entries[idx].undone {
            return None;
        }
        let inverse: Vec<Command> = self.entries[idx]
            .revision
            .commands
            .iter()
            .flat_map(invert_for_transform)
            .collect();

        self.checkout_before(workbook, target)?;
        self.entries[idx].undone = true;
        let dropped = self.reapply_from(workbook, idx + 1, &inverse);
        Some(dropped)
    }

    /// Reactivate a previously undone revision. Silent no-op when the
    /// target is unknown or still active.
    pub fn redo(&mut self, workbook: &mut Workbook, target: RevisionId) -> Option<Vec<RevisionId>> {
        let idx = self.position(target)?;
        if !self.entries[idx].undone {
            return None;
        }

        // The undone entry holds no changes; only the suffix after it does.
        for entry in self.entries[idx + 1..].iter_mut().rev() {
            workbook.revert_changes(&entry.changes);
            entry.changes.clear();
        }

        let commands = self.entries[idx].revision.commands.clone();
        let (changes, failed) = apply_batch(workbook, &commands);
        if failed {
            workbook.revert_changes(&changes);
            let dropped = self.reapply_from(workbook, idx + 1, &[]);
            return Some(dropped);
        }
        self.entries[idx].undone = false;
        self.entries[idx].changes = changes;

        let dropped = self.reapply_from(workbook, idx + 1, &commands);
        Some(dropped)
    }

    /// Revert and remove every pending revision, returning their ids.
    /// Used when a snapshot discards the history they were built on.
    pub fn take_pending(&mut self, workbook: &mut Workbook) -> Vec<RevisionId> {
        let split = self.first_pending_index();
        for entry in self.entries[split..].iter().rev() {
            workbook.revert_changes(&entry.changes);
        }
        self.entries
            .drain(split..)
            .map(|e| e.revision.id)
            .collect()
    }

    /// One-shot garbage collection: drop all history, the given id is the
    /// new ground truth the next revision must chain from.
    pub fn snapshot(&mut self, server_revision_id: RevisionId) {
        log::info!(
            "compacting revision log ({} entries) into snapshot {server_revision_id}",
            self.entries.len()
        );
        self.entries.clear();
        self.server_revision_id = server_revision_id;
    }

    /// Fold every active revision into `workbook`, in log order, without
    /// touching recorded changes. Deterministic by construction.
    pub fn replay_onto(&self, workbook: &mut Workbook) {
        for entry in self.entries.iter().filter(|e| !e.undone) {
            for command in &entry.revision.commands {
                if let Err(reasons) = workbook.apply(command) {
                    log::warn!("replay skipped a command: {reasons:?}");
                }
            }
        }
    }

    /// Re-apply entries from `start`, optionally transforming them against
    /// `executed` first. Entries whose batch transforms to empty (or is
    /// rejected by dispatch) are removed; their ids are returned.
    fn reapply_from(
        &mut self,
        workbook: &mut Workbook,
        start: usize,
        executed: &[Command],
    ) -> Vec<RevisionId> {
        let mut dropped = Vec::new();
        let mut idx = start;
        while idx < self.entries.len() {
            let commands = if executed.is_empty() {
                self.entries[idx].revision.commands.clone()
            } else {
                match transform_revision(&self.entries[idx].revision.commands, executed) {
                    Some(commands) => commands,
                    None => {
                        let id = self.entries[idx].revision.id;
                        log::debug!("revision {id} transformed to empty, dropping");
                        dropped.push(id);
                        self.entries.remove(idx);
                        continue;
                    }
                }
            };

            if self.entries[idx].undone {
                // Keep inactive entries coordinate-consistent for a later
                // redo, but do not apply them.
                self.entries[idx].revision.commands = commands;
                idx += 1;
                continue;
            }

            let (changes, failed) = apply_batch(workbook, &commands);
            if failed {
                workbook.revert_changes(&changes);
                let id = self.entries[idx].revision.id;
                log::debug!("revision {id} no longer applies, dropping");
                dropped.push(id);
                self.entries.remove(idx);
                continue;
            }
            self.entries[idx].revision.commands = commands;
            self.entries[idx].changes = changes;
            idx += 1;
        }
        dropped
    }
}

/// Apply a batch atomically-per-command, reporting whether any command was
/// rejected. On rejection the caller reverts the partial changes.
fn apply_batch(workbook: &mut Workbook, commands: &[Command]) -> (Vec<StateChange>, bool) {
    let mut changes = Vec::new();
    for command in commands {
        match workbook.apply(command) {
            Ok(ch) => changes.extend(ch),
            Err(reasons) => {
                log::warn!("command rejected during replay: {reasons:?}");
                return (changes, true);
            }
        }
    }
    (changes, false)
}
