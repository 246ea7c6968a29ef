//! Value-typed state transitions recorded by dispatch.
//!
//! A `StateChange` is a (path, old value, new value) triple. Applying a
//! recorded list in order reproduces a mutation; reverting it in reverse
//! order restores the prior state bit-for-bit. The revision log leans on
//! this to check out arbitrary points of history without command-specific
//! undo code.

use serde::{Deserialize, Serialize};

use crate::{Cell, CellPosition, Sheet, SheetId, Zone};

/// One primitive state transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StateChange {
    /// Cell created, overwritten or removed. `None` means "no cell".
    Cell {
        sheet_id: SheetId,
        position: CellPosition,
        old: Option<Cell>,
        new: Option<Cell>,
    },
    /// Sheet dimensions changed (column count, row count).
    GridSize {
        sheet_id: SheetId,
        old: (u32, u32),
        new: (u32, u32),
    },
    /// Merge zone added (`added == true`) or removed.
    Merge {
        sheet_id: SheetId,
        zone: Zone,
        added: bool,
    },
    /// Sheet inserted (`old == None`) or deleted (`new == None`) at `index`.
    Sheet {
        index: usize,
        old: Option<Box<Sheet>>,
        new: Option<Box<Sheet>>,
    },
    SheetName {
        sheet_id: SheetId,
        old: String,
        new: String,
    },
}
