//! # gridsync-core — spreadsheet document replica
//!
//! The local, single-owner side of a collaborative spreadsheet: a workbook
//! of sheets, the closed set of mutation commands, and the change-recording
//! dispatch used by the revision engine in `gridsync-collab`.
//!
//! Every mutation goes through [`Workbook::apply`], which validates the
//! command and returns the list of [`changes::StateChange`] triples it
//! produced. Reverting those triples in reverse order restores the previous
//! state exactly, which is what makes selective undo and optimistic
//! rollback mechanical instead of command-specific.

pub mod changes;
pub mod command;
pub mod document;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use changes::StateChange;
pub use command::{CancelledReason, Command, CommandResult, InsertPosition};
pub use document::{Sheet, Workbook, WorkbookData};

/// Stable identifier of a sheet within a workbook.
pub type SheetId = Uuid;
/// Stable identifier of a connected client.
pub type ClientId = Uuid;
/// Identifier of one revision in the shared log.
pub type RevisionId = Uuid;

/// Zero-based cell coordinates within a sheet.
///
/// Ordered column-major so a `BTreeMap<CellPosition, Cell>` iterates
/// deterministically, which keeps exports byte-stable across replicas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CellPosition {
    pub col: u32,
    pub row: u32,
}

impl CellPosition {
    pub fn new(col: u32, row: u32) -> Self {
        Self { col, row }
    }
}

/// One cell. Content is an opaque string (formula source or literal);
/// evaluation happens elsewhere.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cell {
    pub content: String,
}

impl Cell {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
        }
    }
}

/// Inclusive rectangular range of cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Zone {
    pub left: u32,
    pub top: u32,
    pub right: u32,
    pub bottom: u32,
}

impl Zone {
    /// Build a normalized zone from any two opposite corners.
    pub fn new(left: u32, top: u32, right: u32, bottom: u32) -> Self {
        Self {
            left: left.min(right),
            top: top.min(bottom),
            right: left.max(right),
            bottom: top.max(bottom),
        }
    }

    pub fn contains(&self, position: CellPosition) -> bool {
        position.col >= self.left
            && position.col <= self.right
            && position.row >= self.top
            && position.row <= self.bottom
    }

    pub fn overlaps(&self, other: &Zone) -> bool {
        self.left <= other.right
            && other.left <= self.right
            && self.top <= other.bottom
            && other.top <= self.bottom
    }

    pub fn is_single_cell(&self) -> bool {
        self.left == self.right && self.top == self.bottom
    }
}
