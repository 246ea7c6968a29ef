//! The closed set of document mutation commands.
//!
//! Commands are the unit of replication: a revision is an atomic batch of
//! them, and the conflict-resolution transforms in `gridsync-collab` are an
//! exhaustive match over this enum. Extending the command set is a
//! compile-time change on purpose — the transform matrix must stay total.

use serde::{Deserialize, Serialize};

use crate::{CellPosition, SheetId, Zone};

/// Where newly inserted rows/columns land relative to the base element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InsertPosition {
    Before,
    After,
}

/// One atomic document mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Command {
    UpdateCell {
        sheet_id: SheetId,
        position: CellPosition,
        content: String,
    },
    ClearCell {
        sheet_id: SheetId,
        position: CellPosition,
    },
    AddColumns {
        sheet_id: SheetId,
        base: u32,
        position: InsertPosition,
        quantity: u32,
    },
    RemoveColumns {
        sheet_id: SheetId,
        columns: Vec<u32>,
    },
    AddRows {
        sheet_id: SheetId,
        base: u32,
        position: InsertPosition,
        quantity: u32,
    },
    RemoveRows {
        sheet_id: SheetId,
        rows: Vec<u32>,
    },
    CreateSheet {
        sheet_id: SheetId,
        name: String,
        index: usize,
    },
    DeleteSheet {
        sheet_id: SheetId,
    },
    RenameSheet {
        sheet_id: SheetId,
        name: String,
    },
    DuplicateSheet {
        sheet_id: SheetId,
        new_sheet_id: SheetId,
        name: String,
    },
    AddMerge {
        sheet_id: SheetId,
        zone: Zone,
    },
    RemoveMerge {
        sheet_id: SheetId,
        zone: Zone,
    },
}

impl Command {
    /// The sheet this command operates on.
    pub fn sheet_id(&self) -> SheetId {
        match self {
            Command::UpdateCell { sheet_id, .. }
            | Command::ClearCell { sheet_id, .. }
            | Command::AddColumns { sheet_id, .. }
            | Command::RemoveColumns { sheet_id, .. }
            | Command::AddRows { sheet_id, .. }
            | Command::RemoveRows { sheet_id, .. }
            | Command::CreateSheet { sheet_id, .. }
            | Command::DeleteSheet { sheet_id }
            | Command::RenameSheet { sheet_id, .. }
            | Command::DuplicateSheet { sheet_id, .. }
            | Command::AddMerge { sheet_id, .. }
            | Command::RemoveMerge { sheet_id, .. } => *sheet_id,
        }
    }

    /// Structural commands change the coordinate space other commands
    /// reference and therefore force transformation of concurrent work.
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            Command::AddColumns { .. }
                | Command::RemoveColumns { .. }
                | Command::AddRows { .. }
                | Command::RemoveRows { .. }
                | Command::CreateSheet { .. }
                | Command::DeleteSheet { .. }
                | Command::DuplicateSheet { .. }
        )
    }
}

/// Why a command was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CancelledReason {
    InvalidSheetId,
    TargetOutOfRange,
    InvalidQuantity,
    DuplicateSheetId,
    DuplicateSheetName,
    InvalidSheetName,
    NotEnoughSheets,
    MergeOverlaps,
    MergeNotFound,
    /// A local revision or history request is awaiting its network echo.
    WaitingSessionConfirmation,
    EmptyUndoStack,
    EmptyRedoStack,
    /// Snapshot refused while local revisions are still unacknowledged.
    PendingLocalRevisions,
    EmptyCommandBatch,
    SnapshotEncodingFailed,
}

/// Outcome of validating or dispatching a command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandResult {
    Success,
    Cancelled(Vec<CancelledReason>),
}

impl CommandResult {
    pub fn cancelled(reason: CancelledReason) -> Self {
        CommandResult::Cancelled(vec![reason])
    }

    pub fn is_successful(&self) -> bool {
        matches!(self, CommandResult::Success)
    }

    pub fn reasons(&self) -> &[CancelledReason] {
        match self {
            CommandResult::Success => &[],
            CommandResult::Cancelled(reasons) => reasons,
        }
    }
}
