//! The workbook replica: validation, change-recording dispatch, export.
//!
//! Dispatch is split in two: [`Workbook::check`] is a side-effect-free
//! dry run, [`Workbook::apply`] validates then mutates. All mutation is
//! funneled through [`Workbook::apply_change`] so every applied command
//! leaves behind a mechanical undo log.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::changes::StateChange;
use crate::command::{CancelledReason, Command, CommandResult, InsertPosition};
use crate::{Cell, CellPosition, SheetId, Zone};

pub const DEFAULT_COL_COUNT: u32 = 26;
pub const DEFAULT_ROW_COUNT: u32 = 100;

/// One sheet of the workbook.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sheet {
    pub id: SheetId,
    pub name: String,
    pub col_count: u32,
    pub row_count: u32,
    pub cells: BTreeMap<CellPosition, Cell>,
    pub merges: Vec<Zone>,
}

impl Sheet {
    pub fn new(id: SheetId, name: impl Into<String>, col_count: u32, row_count: u32) -> Self {
        Self {
            id,
            name: name.into(),
            col_count,
            row_count,
            cells: BTreeMap::new(),
            merges: Vec::new(),
        }
    }

    pub fn cell(&self, position: CellPosition) -> Option<&Cell> {
        self.cells.get(&position)
    }

    fn in_bounds(&self, position: CellPosition) -> bool {
        position.col < self.col_count && position.row < self.row_count
    }

    fn zone_in_bounds(&self, zone: &Zone) -> bool {
        zone.right < self.col_count && zone.bottom < self.row_count
    }
}

/// Serializable snapshot of a whole workbook.
///
/// Deterministic: sheet order is explicit and cells iterate in
/// `BTreeMap` order, so two converged replicas export equal values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkbookData {
    pub sheets: Vec<Sheet>,
}

impl WorkbookData {
    /// A workbook with a single empty sheet under the given id.
    pub fn single_sheet(sheet_id: SheetId) -> Self {
        Self {
            sheets: vec![Sheet::new(
                sheet_id,
                "Sheet1",
                DEFAULT_COL_COUNT,
                DEFAULT_ROW_COUNT,
            )],
        }
    }
}

impl Default for WorkbookData {
    fn default() -> Self {
        Self::single_sheet(SheetId::new_v4())
    }
}

#[derive(Clone, Copy)]
enum Axis {
    Col,
    Row,
}

impl Axis {
    fn of(self, position: CellPosition) -> u32 {
        match self {
            Axis::Col => position.col,
            Axis::Row => position.row,
        }
    }

    fn shifted(self, position: CellPosition, track: u32) -> CellPosition {
        match self {
            Axis::Col => CellPosition::new(track, position.row),
            Axis::Row => CellPosition::new(position.col, track),
        }
    }

    fn span(self, zone: &Zone) -> (u32, u32) {
        match self {
            Axis::Col => (zone.left, zone.right),
            Axis::Row => (zone.top, zone.bottom),
        }
    }

    fn with_span(self, zone: &Zone, min: u32, max: u32) -> Zone {
        match self {
            Axis::Col => Zone::new(min, zone.top, max, zone.bottom),
            Axis::Row => Zone::new(zone.left, min, zone.right, max),
        }
    }
}

/// The document replica owned by one client.
#[derive(Debug, Clone, PartialEq)]
pub struct Workbook {
    sheets: Vec<Sheet>,
}

impl Workbook {
    pub fn from_data(data: WorkbookData) -> Self {
        Self { sheets: data.sheets }
    }

    pub fn export_data(&self) -> WorkbookData {
        WorkbookData {
            sheets: self.sheets.clone(),
        }
    }

    pub fn sheets(&self) -> &[Sheet] {
        &self.sheets
    }

    pub fn sheet(&self, sheet_id: SheetId) -> Option<&Sheet> {
        self.sheets.iter().find(|s| s.id == sheet_id)
    }

    fn sheet_mut(&mut self, sheet_id: SheetId) -> Option<&mut Sheet> {
        self.sheets.iter_mut().find(|s| s.id == sheet_id)
    }

    fn sheet_index(&self, sheet_id: SheetId) -> Option<usize> {
        self.sheets.iter().position(|s| s.id == sheet_id)
    }

    fn name_taken(&self, name: &str, except: Option<SheetId>) -> bool {
        self.sheets
            .iter()
            .any(|s| s.name == name && Some(s.id) != except)
    }

    /// Dry-run validation. Never mutates.
    pub fn check(&self, command: &Command) -> CommandResult {
        let mut reasons = Vec::new();
        match command {
            Command::UpdateCell {
                sheet_id, position, ..
            }
            | Command::ClearCell { sheet_id, position } => match self.sheet(*sheet_id) {
                None => reasons.push(CancelledReason::InvalidSheetId),
                Some(sheet) if !sheet.in_bounds(*position) => {
                    reasons.push(CancelledReason::TargetOutOfRange)
                }
                _ => {}
            },
            Command::AddColumns {
                sheet_id,
                base,
                quantity,
                ..
            } => match self.sheet(*sheet_id) {
                None => reasons.push(CancelledReason::InvalidSheetId),
                Some(sheet) => {
                    if *quantity == 0 {
                        reasons.push(CancelledReason::InvalidQuantity);
                    }
                    if *base >= sheet.col_count {
                        reasons.push(CancelledReason::TargetOutOfRange);
                    }
                }
            },
            Command::AddRows {
                sheet_id,
                base,
                quantity,
                ..
            } => match self.sheet(*sheet_id) {
                None => reasons.push(CancelledReason::InvalidSheetId),
                Some(sheet) => {
                    if *quantity == 0 {
                        reasons.push(CancelledReason::InvalidQuantity);
                    }
                    if *base >= sheet.row_count {
                        reasons.push(CancelledReason::TargetOutOfRange);
                    }
                }
            },
            Command::RemoveColumns { sheet_id, columns } => match self.sheet(*sheet_id) {
                None => reasons.push(CancelledReason::InvalidSheetId),
                Some(sheet) => {
                    let mut removed = columns.clone();
                    removed.sort_unstable();
                    removed.dedup();
                    if removed.is_empty() || removed.len() as u32 >= sheet.col_count {
                        reasons.push(CancelledReason::InvalidQuantity);
                    }
                    if removed.iter().any(|c| *c >= sheet.col_count) {
                        reasons.push(CancelledReason::TargetOutOfRange);
                    }
                }
            },
            Command::RemoveRows { sheet_id, rows } => match self.sheet(*sheet_id) {
                None => reasons.push(CancelledReason::InvalidSheetId),
                Some(sheet) => {
                    let mut removed = rows.clone();
                    removed.sort_unstable();
                    removed.dedup();
                    if removed.is_empty() || removed.len() as u32 >= sheet.row_count {
                        reasons.push(CancelledReason::InvalidQuantity);
                    }
                    if removed.iter().any(|r| *r >= sheet.row_count) {
                        reasons.push(CancelledReason::TargetOutOfRange);
                    }
                }
            },
            Command::CreateSheet {
                sheet_id,
                name,
                index,
            } => {
                if self.sheet(*sheet_id).is_some() {
                    reasons.push(CancelledReason::DuplicateSheetId);
                }
                if name.trim().is_empty() {
                    reasons.push(CancelledReason::InvalidSheetName);
                } else if self.name_taken(name, None) {
                    reasons.push(CancelledReason::DuplicateSheetName);
                }
                if *index > self.sheets.len() {
                    reasons.push(CancelledReason::TargetOutOfRange);
                }
            }
            Command::DeleteSheet { sheet_id } => {
                if self.sheet(*sheet_id).is_none() {
                    reasons.push(CancelledReason::InvalidSheetId);
                } else if self.sheets.len() == 1 {
                    reasons.push(CancelledReason::NotEnoughSheets);
                }
            }
            Command::RenameSheet { sheet_id, name } => {
                if self.sheet(*sheet_id).is_none() {
                    reasons.push(CancelledReason::InvalidSheetId);
                }
                if name.trim().is_empty() {
                    reasons.push(CancelledReason::InvalidSheetName);
                } else if self.name_taken(name, Some(*sheet_id)) {
                    reasons.push(CancelledReason::DuplicateSheetName);
                }
            }
            Command::DuplicateSheet {
                sheet_id,
                new_sheet_id,
                name,
            } => {
                if self.sheet(*sheet_id).is_none() {
                    reasons.push(CancelledReason::InvalidSheetId);
                }
                if self.sheet(*new_sheet_id).is_some() {
                    reasons.push(CancelledReason::DuplicateSheetId);
                }
                if name.trim().is_empty() {
                    reasons.push(CancelledReason::InvalidSheetName);
                } else if self.name_taken(name, None) {
                    reasons.push(CancelledReason::DuplicateSheetName);
                }
            }
            Command::AddMerge { sheet_id, zone } => match self.sheet(*sheet_id) {
                None => reasons.push(CancelledReason::InvalidSheetId),
                Some(sheet) => {
                    if !sheet.zone_in_bounds(zone) {
                        reasons.push(CancelledReason::TargetOutOfRange);
                    }
                    if sheet.merges.iter().any(|m| m.overlaps(zone)) {
                        reasons.push(CancelledReason::MergeOverlaps);
                    }
                }
            },
            Command::RemoveMerge { sheet_id, zone } => match self.sheet(*sheet_id) {
                None => reasons.push(CancelledReason::InvalidSheetId),
                Some(sheet) => {
                    if !sheet.merges.contains(zone) {
                        reasons.push(CancelledReason::MergeNotFound);
                    }
                }
            },
        }
        if reasons.is_empty() {
            CommandResult::Success
        } else {
            CommandResult::Cancelled(reasons)
        }
    }

    /// Validate and apply one command, returning the recorded changes.
    ///
    /// Mutates only on success.
    pub fn apply(&mut self, command: &Command) -> Result<Vec<StateChange>, Vec<CancelledReason>> {
        if let CommandResult::Cancelled(reasons) = self.check(command) {
            return Err(reasons);
        }
        let mut changes = Vec::new();
        match command {
            Command::UpdateCell {
                sheet_id,
                position,
                content,
            } => {
                let old = self.sheet(*sheet_id).and_then(|s| s.cell(*position)).cloned();
                let new = if content.is_empty() {
                    None
                } else {
                    Some(Cell::new(content.clone()))
                };
                if old != new {
                    self.record(
                        &mut changes,
                        StateChange::Cell {
                            sheet_id: *sheet_id,
                            position: *position,
                            old,
                            new,
                        },
                    );
                }
            }
            Command::ClearCell { sheet_id, position } => {
                if let Some(old) = self.sheet(*sheet_id).and_then(|s| s.cell(*position)).cloned() {
                    self.record(
                        &mut changes,
                        StateChange::Cell {
                            sheet_id: *sheet_id,
                            position: *position,
                            old: Some(old),
                            new: None,
                        },
                    );
                }
            }
            Command::AddColumns {
                sheet_id,
                base,
                position,
                quantity,
            } => {
                let pivot = insert_pivot(*base, *position);
                self.insert_tracks(*sheet_id, pivot, *quantity, Axis::Col, &mut changes);
            }
            Command::AddRows {
                sheet_id,
                base,
                position,
                quantity,
            } => {
                let pivot = insert_pivot(*base, *position);
                self.insert_tracks(*sheet_id, pivot, *quantity, Axis::Row, &mut changes);
            }
            Command::RemoveColumns { sheet_id, columns } => {
                self.remove_tracks(*sheet_id, columns, Axis::Col, &mut changes);
            }
            Command::RemoveRows { sheet_id, rows } => {
                self.remove_tracks(*sheet_id, rows, Axis::Row, &mut changes);
            }
            Command::CreateSheet {
                sheet_id,
                name,
                index,
            } => {
                let sheet = Sheet::new(*sheet_id, name.clone(), DEFAULT_COL_COUNT, DEFAULT_ROW_COUNT);
                self.record(
                    &mut changes,
                    StateChange::Sheet {
                        index: *index,
                        old: None,
                        new: Some(Box::new(sheet)),
                    },
                );
            }
            Command::DeleteSheet { sheet_id } => {
                if let Some(index) = self.sheet_index(*sheet_id) {
                    let sheet = self.sheets[index].clone();
                    self.record(
                        &mut changes,
                        StateChange::Sheet {
                            index,
                            old: Some(Box::new(sheet)),
                            new: None,
                        },
                    );
                }
            }
            Command::RenameSheet { sheet_id, name } => {
                if let Some(old) = self.sheet(*sheet_id).map(|s| s.name.clone()) {
                    if old != *name {
                        self.record(
                            &mut changes,
                            StateChange::SheetName {
                                sheet_id: *sheet_id,
                                old,
                                new: name.clone(),
                            },
                        );
                    }
                }
            }
            Command::DuplicateSheet {
                sheet_id,
                new_sheet_id,
                name,
            } => {
                if let Some(index) = self.sheet_index(*sheet_id) {
                    let mut copy = self.sheets[index].clone();
                    copy.id = *new_sheet_id;
                    copy.name = name.clone();
                    self.record(
                        &mut changes,
                        StateChange::Sheet {
                            index: index + 1,
                            old: None,
                            new: Some(Box::new(copy)),
                        },
                    );
                }
            }
            Command::AddMerge { sheet_id, zone } => {
                self.record(
                    &mut changes,
                    StateChange::Merge {
                        sheet_id: *sheet_id,
                        zone: *zone,
                        added: true,
                    },
                );
            }
            Command::RemoveMerge { sheet_id, zone } => {
                self.record(
                    &mut changes,
                    StateChange::Merge {
                        sheet_id: *sheet_id,
                        zone: *zone,
                        added: false,
                    },
                );
            }
        }
        Ok(changes)
    }

    fn insert_tracks(
        &mut self,
        sheet_id: SheetId,
        pivot: u32,
        quantity: u32,
        axis: Axis,
        changes: &mut Vec<StateChange>,
    ) {
        let sheet = match self.sheet(sheet_id) {
            Some(s) => s,
            None => return,
        };
        let old_size = (sheet.col_count, sheet.row_count);
        let new_size = match axis {
            Axis::Col => (sheet.col_count + quantity, sheet.row_count),
            Axis::Row => (sheet.col_count, sheet.row_count + quantity),
        };
        self.record(
            changes,
            StateChange::GridSize {
                sheet_id,
                old: old_size,
                new: new_size,
            },
        );

        // Shift cells at or past the pivot, highest track first so each
        // move lands on a vacant position.
        let mut moved: Vec<(CellPosition, Cell)> = self
            .sheet(sheet_id)
            .map(|s| {
                s.cells
                    .iter()
                    .filter(|(p, _)| axis.of(**p) >= pivot)
                    .map(|(p, c)| (*p, c.clone()))
                    .collect()
            })
            .unwrap_or_default();
        moved.sort_by_key(|(p, _)| std::cmp::Reverse(axis.of(*p)));
        for (position, cell) in moved {
            let target = axis.shifted(position, axis.of(position) + quantity);
            self.record(
                changes,
                StateChange::Cell {
                    sheet_id,
                    position,
                    old: Some(cell.clone()),
                    new: None,
                },
            );
            self.record(
                changes,
                StateChange::Cell {
                    sheet_id,
                    position: target,
                    old: None,
                    new: Some(cell),
                },
            );
        }

        let merges = self.sheet(sheet_id).map(|s| s.merges.clone()).unwrap_or_default();
        for zone in merges {
            let (min, max) = axis.span(&zone);
            let shifted = if min >= pivot {
                Some(axis.with_span(&zone, min + quantity, max + quantity))
            } else if max >= pivot {
                // Insertion inside a merge widens it.
                Some(axis.with_span(&zone, min, max + quantity))
            } else {
                None
            };
            if let Some(new_zone) = shifted {
                self.record(
                    changes,
                    StateChange::Merge {
                        sheet_id,
                        zone,
                        added: false,
                    },
                );
                self.record(
                    changes,
                    StateChange::Merge {
                        sheet_id,
                        zone: new_zone,
                        added: true,
                    },
                );
            }
        }
    }

    fn remove_tracks(
        &mut self,
        sheet_id: SheetId,
        tracks: &[u32],
        axis: Axis,
        changes: &mut Vec<StateChange>,
    ) {
        let mut removed = tracks.to_vec();
        removed.sort_unstable();
        removed.dedup();
        if removed.is_empty() {
            return;
        }
        let shift = |track: u32| track - removed.iter().filter(|r| **r < track).count() as u32;

        // Drop cells on removed tracks, then compact the survivors,
        // lowest track first so each move lands on a vacant position.
        let mut cells: Vec<(CellPosition, Cell)> = self
            .sheet(sheet_id)
            .map(|s| s.cells.iter().map(|(p, c)| (*p, c.clone())).collect())
            .unwrap_or_default();
        cells.sort_by_key(|(p, _)| axis.of(*p));
        for (position, cell) in &cells {
            if removed.binary_search(&axis.of(*position)).is_ok() {
                self.record(
                    changes,
                    StateChange::Cell {
                        sheet_id,
                        position: *position,
                        old: Some(cell.clone()),
                        new: None,
                    },
                );
            }
        }
        for (position, cell) in &cells {
            let track = axis.of(*position);
            if removed.binary_search(&track).is_ok() {
                continue;
            }
            let new_track = shift(track);
            if new_track != track {
                let target = axis.shifted(*position, new_track);
                self.record(
                    changes,
                    StateChange::Cell {
                        sheet_id,
                        position: *position,
                        old: Some(cell.clone()),
                        new: None,
                    },
                );
                self.record(
                    changes,
                    StateChange::Cell {
                        sheet_id,
                        position: target,
                        old: None,
                        new: Some(cell.clone()),
                    },
                );
            }
        }

        let merges = self.sheet(sheet_id).map(|s| s.merges.clone()).unwrap_or_default();
        for zone in merges {
            let (min, max) = axis.span(&zone);
            let new_min = min - removed.iter().filter(|r| **r < min).count() as u32;
            let new_max = max - removed.iter().filter(|r| **r <= max).count() as u32;
            if new_max < new_min {
                // Every track of the merge is gone.
                self.record(
                    changes,
                    StateChange::Merge {
                        sheet_id,
                        zone,
                        added: false,
                    },
                );
            } else if (new_min, new_max) != (min, max) {
                self.record(
                    changes,
                    StateChange::Merge {
                        sheet_id,
                        zone,
                        added: false,
                    },
                );
                self.record(
                    changes,
                    StateChange::Merge {
                        sheet_id,
                        zone: axis.with_span(&zone, new_min, new_max),
                        added: true,
                    },
                );
            }
        }

        if let Some(sheet) = self.sheet(sheet_id) {
            let old_size = (sheet.col_count, sheet.row_count);
            let new_size = match axis {
                Axis::Col => (sheet.col_count - removed.len() as u32, sheet.row_count),
                Axis::Row => (sheet.col_count, sheet.row_count - removed.len() as u32),
            };
            self.record(
                changes,
                StateChange::GridSize {
                    sheet_id,
                    old: old_size,
                    new: new_size,
                },
            );
        }
    }

    fn record(&mut self, changes: &mut Vec<StateChange>, change: StateChange) {
        self.apply_change(&change);
        changes.push(change);
    }

    /// Mechanically apply one recorded change.
    pub fn apply_change(&mut self, change: &StateChange) {
        match change {
            StateChange::Cell {
                sheet_id,
                position,
                new,
                ..
            } => {
                if let Some(sheet) = self.sheet_mut(*sheet_id) {
                    match new {
                        Some(cell) => {
                            sheet.cells.insert(*position, cell.clone());
                        }
                        None => {
                            sheet.cells.remove(position);
                        }
                    }
                }
            }
            StateChange::GridSize { sheet_id, new, .. } => {
                if let Some(sheet) = self.sheet_mut(*sheet_id) {
                    sheet.col_count = new.0;
                    sheet.row_count = new.1;
                }
            }
            StateChange::Merge {
                sheet_id,
                zone,
                added,
            } => {
                if let Some(sheet) = self.sheet_mut(*sheet_id) {
                    if *added {
                        sheet.merges.push(*zone);
                    } else {
                        sheet.merges.retain(|m| m != zone);
                    }
                }
            }
            StateChange::Sheet { index, new, .. } => match new {
                Some(sheet) => {
                    let at = (*index).min(self.sheets.len());
                    self.sheets.insert(at, (**sheet).clone());
                }
                None => {
                    if *index < self.sheets.len() {
                        self.sheets.remove(*index);
                    } else {
                        log::warn!("sheet removal at index {index} out of range, skipped");
                    }
                }
            },
            StateChange::SheetName { sheet_id, new, .. } => {
                if let Some(sheet) = self.sheet_mut(*sheet_id) {
                    sheet.name = new.clone();
                }
            }
        }
    }

    /// Mechanically revert one recorded change.
    pub fn revert_change(&mut self, change: &StateChange) {
        match change {
            StateChange::Cell {
                sheet_id,
                position,
                old,
                ..
            } => {
                if let Some(sheet) = self.sheet_mut(*sheet_id) {
                    match old {
                        Some(cell) => {
                            sheet.cells.insert(*position, cell.clone());
                        }
                        None => {
                            sheet.cells.remove(position);
                        }
                    }
                }
            }
            StateChange::GridSize { sheet_id, old, .. } => {
                if let Some(sheet) = self.sheet_mut(*sheet_id) {
                    sheet.col_count = old.0;
                    sheet.row_count = old.1;
                }
            }
            StateChange::Merge {
                sheet_id,
                zone,
                added,
            } => {
                if let Some(sheet) = self.sheet_mut(*sheet_id) {
                    if *added {
                        sheet.merges.retain(|m| m != zone);
                    } else {
                        sheet.merges.push(*zone);
                    }
                }
            }
            StateChange::Sheet { index, old, .. } => match old {
                Some(sheet) => {
                    let at = (*index).min(self.sheets.len());
                    self.sheets.insert(at, (**sheet).clone());
                }
                None => {
                    if *index < self.sheets.len() {
                        self.sheets.remove(*index);
                    }
                }
            },
            StateChange::SheetName { sheet_id, old, .. } => {
                if let Some(sheet) = self.sheet_mut(*sheet_id) {
                    sheet.name = old.clone();
                }
            }
        }
    }

    /// Revert a recorded change list, newest change first.
    pub fn revert_changes(&mut self, changes: &[StateChange]) {
        for change in changes.iter().rev() {
            self.revert_change(change);
        }
    }
}

/// Track index where an insertion actually lands.
pub fn insert_pivot(base: u32, position: InsertPosition) -> u32 {
    match position {
        InsertPosition::Before => base,
        InsertPosition::After => base + 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn workbook() -> (Workbook, SheetId) {
        let sheet_id = Uuid::new_v4();
        (
            Workbook::from_data(WorkbookData::single_sheet(sheet_id)),
            sheet_id,
        )
    }

    fn update(sheet_id: SheetId, col: u32, row: u32, content: &str) -> Command {
        Command::UpdateCell {
            sheet_id,
            position: CellPosition::new(col, row),
            content: content.into(),
        }
    }

    #[test]
    fn test_update_and_clear_cell() {
        let (mut wb, sheet_id) = workbook();
        wb.apply(&update(sheet_id, 1, 2, "hello")).unwrap();
        assert_eq!(
            wb.sheet(sheet_id).unwrap().cell(CellPosition::new(1, 2)),
            Some(&Cell::new("hello"))
        );

        wb.apply(&Command::ClearCell {
            sheet_id,
            position: CellPosition::new(1, 2),
        })
        .unwrap();
        assert!(wb.sheet(sheet_id).unwrap().cell(CellPosition::new(1, 2)).is_none());
    }

    #[test]
    fn test_empty_content_clears_cell() {
        let (mut wb, sheet_id) = workbook();
        wb.apply(&update(sheet_id, 0, 0, "x")).unwrap();
        wb.apply(&update(sheet_id, 0, 0, "")).unwrap();
        assert!(wb.sheet(sheet_id).unwrap().cells.is_empty());
    }

    #[test]
    fn test_update_out_of_range_rejected() {
        let (mut wb, sheet_id) = workbook();
        let err = wb.apply(&update(sheet_id, 500, 0, "x")).unwrap_err();
        assert_eq!(err, vec![CancelledReason::TargetOutOfRange]);
    }

    #[test]
    fn test_unknown_sheet_rejected() {
        let (wb, _) = workbook();
        let result = wb.check(&update(Uuid::new_v4(), 0, 0, "x"));
        assert_eq!(result.reasons(), &[CancelledReason::InvalidSheetId]);
    }

    #[test]
    fn test_add_columns_shifts_cells() {
        let (mut wb, sheet_id) = workbook();
        wb.apply(&update(sheet_id, 1, 0, "B1")).unwrap();
        wb.apply(&update(sheet_id, 3, 0, "D1")).unwrap();

        wb.apply(&Command::AddColumns {
            sheet_id,
            base: 1,
            position: InsertPosition::Before,
            quantity: 2,
        })
        .unwrap();

        let sheet = wb.sheet(sheet_id).unwrap();
        assert_eq!(sheet.col_count, DEFAULT_COL_COUNT + 2);
        assert!(sheet.cell(CellPosition::new(1, 0)).is_none());
        assert_eq!(sheet.cell(CellPosition::new(3, 0)), Some(&Cell::new("B1")));
        assert_eq!(sheet.cell(CellPosition::new(5, 0)), Some(&Cell::new("D1")));
    }

    #[test]
    fn test_add_columns_after_leaves_base_in_place() {
        let (mut wb, sheet_id) = workbook();
        wb.apply(&update(sheet_id, 2, 0, "C1")).unwrap();
        wb.apply(&Command::AddColumns {
            sheet_id,
            base: 2,
            position: InsertPosition::After,
            quantity: 1,
        })
        .unwrap();
        let sheet = wb.sheet(sheet_id).unwrap();
        assert_eq!(sheet.cell(CellPosition::new(2, 0)), Some(&Cell::new("C1")));
    }

    #[test]
    fn test_remove_columns_drops_and_compacts() {
        let (mut wb, sheet_id) = workbook();
        wb.apply(&update(sheet_id, 0, 0, "A1")).unwrap();
        wb.apply(&update(sheet_id, 2, 0, "C1")).unwrap();
        wb.apply(&update(sheet_id, 4, 0, "E1")).unwrap();

        wb.apply(&Command::RemoveColumns {
            sheet_id,
            columns: vec![2, 1],
        })
        .unwrap();

        let sheet = wb.sheet(sheet_id).unwrap();
        assert_eq!(sheet.col_count, DEFAULT_COL_COUNT - 2);
        assert_eq!(sheet.cell(CellPosition::new(0, 0)), Some(&Cell::new("A1")));
        assert_eq!(sheet.cell(CellPosition::new(2, 0)), Some(&Cell::new("E1")));
        assert_eq!(sheet.cells.len(), 2);
    }

    #[test]
    fn test_remove_rows_shifts_merges() {
        let (mut wb, sheet_id) = workbook();
        wb.apply(&Command::AddMerge {
            sheet_id,
            zone: Zone::new(0, 4, 2, 6),
        })
        .unwrap();
        wb.apply(&Command::RemoveRows {
            sheet_id,
            rows: vec![0, 5],
        })
        .unwrap();
        let sheet = wb.sheet(sheet_id).unwrap();
        assert_eq!(sheet.merges, vec![Zone::new(0, 3, 2, 4)]);
    }

    #[test]
    fn test_remove_all_merge_rows_drops_merge() {
        let (mut wb, sheet_id) = workbook();
        wb.apply(&Command::AddMerge {
            sheet_id,
            zone: Zone::new(0, 2, 1, 3),
        })
        .unwrap();
        wb.apply(&Command::RemoveRows {
            sheet_id,
            rows: vec![2, 3],
        })
        .unwrap();
        assert!(wb.sheet(sheet_id).unwrap().merges.is_empty());
    }

    #[test]
    fn test_insert_inside_merge_widens_it() {
        let (mut wb, sheet_id) = workbook();
        wb.apply(&Command::AddMerge {
            sheet_id,
            zone: Zone::new(1, 0, 3, 0),
        })
        .unwrap();
        wb.apply(&Command::AddColumns {
            sheet_id,
            base: 2,
            position: InsertPosition::Before,
            quantity: 1,
        })
        .unwrap();
        assert_eq!(wb.sheet(sheet_id).unwrap().merges, vec![Zone::new(1, 0, 4, 0)]);
    }

    #[test]
    fn test_overlapping_merge_rejected() {
        let (mut wb, sheet_id) = workbook();
        wb.apply(&Command::AddMerge {
            sheet_id,
            zone: Zone::new(0, 0, 2, 2),
        })
        .unwrap();
        let err = wb
            .apply(&Command::AddMerge {
                sheet_id,
                zone: Zone::new(2, 2, 4, 4),
            })
            .unwrap_err();
        assert_eq!(err, vec![CancelledReason::MergeOverlaps]);
    }

    #[test]
    fn test_create_delete_sheet() {
        let (mut wb, first) = workbook();
        let second = Uuid::new_v4();
        wb.apply(&Command::CreateSheet {
            sheet_id: second,
            name: "Budget".into(),
            index: 1,
        })
        .unwrap();
        assert_eq!(wb.sheets().len(), 2);

        wb.apply(&Command::DeleteSheet { sheet_id: first }).unwrap();
        assert_eq!(wb.sheets().len(), 1);
        assert_eq!(wb.sheets()[0].id, second);
    }

    #[test]
    fn test_cannot_delete_last_sheet() {
        let (mut wb, sheet_id) = workbook();
        let err = wb.apply(&Command::DeleteSheet { sheet_id }).unwrap_err();
        assert_eq!(err, vec![CancelledReason::NotEnoughSheets]);
    }

    #[test]
    fn test_duplicate_sheet_copies_content() {
        let (mut wb, sheet_id) = workbook();
        wb.apply(&update(sheet_id, 0, 0, "head")).unwrap();
        let copy_id = Uuid::new_v4();
        wb.apply(&Command::DuplicateSheet {
            sheet_id,
            new_sheet_id: copy_id,
            name: "Sheet1 (copy)".into(),
        })
        .unwrap();

        let copy = wb.sheet(copy_id).unwrap();
        assert_eq!(copy.cell(CellPosition::new(0, 0)), Some(&Cell::new("head")));
        assert_eq!(wb.sheets()[1].id, copy_id);
    }

    #[test]
    fn test_duplicate_sheet_name_rejected() {
        let (mut wb, _sheet_id) = workbook();
        let err = wb
            .apply(&Command::CreateSheet {
                sheet_id: Uuid::new_v4(),
                name: "Sheet1".into(),
                index: 0,
            })
            .unwrap_err();
        assert_eq!(err, vec![CancelledReason::DuplicateSheetName]);
    }

    #[test]
    fn test_revert_changes_restores_prior_state() {
        let (mut wb, sheet_id) = workbook();
        wb.apply(&update(sheet_id, 1, 1, "keep")).unwrap();
        let before = wb.export_data();

        let mut recorded = Vec::new();
        for command in [
            update(sheet_id, 1, 1, "overwritten"),
            Command::AddColumns {
                sheet_id,
                base: 0,
                position: InsertPosition::Before,
                quantity: 3,
            },
            Command::AddMerge {
                sheet_id,
                zone: Zone::new(0, 0, 1, 1),
            },
            Command::RenameSheet {
                sheet_id,
                name: "Renamed".into(),
            },
        ] {
            recorded.extend(wb.apply(&command).unwrap());
        }
        assert_ne!(wb.export_data(), before);

        wb.revert_changes(&recorded);
        assert_eq!(wb.export_data(), before);
    }

    #[test]
    fn test_revert_structural_delete_restores_sheet() {
        let (mut wb, sheet_id) = workbook();
        wb.apply(&update(sheet_id, 3, 3, "payload")).unwrap();
        wb.apply(&Command::CreateSheet {
            sheet_id: Uuid::new_v4(),
            name: "Other".into(),
            index: 1,
        })
        .unwrap();
        let before = wb.export_data();

        let changes = wb.apply(&Command::DeleteSheet { sheet_id }).unwrap();
        assert!(wb.sheet(sheet_id).is_none());
        wb.revert_changes(&changes);
        assert_eq!(wb.export_data(), before);
    }

    #[test]
    fn test_check_does_not_mutate() {
        let (wb, sheet_id) = workbook();
        let before = wb.export_data();
        let _ = wb.check(&update(sheet_id, 0, 0, "x"));
        assert_eq!(wb.export_data(), before);
    }
}
