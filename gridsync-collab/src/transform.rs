//! Command transformation: rewriting a command so it stays valid after a
//! concurrent command has already been applied.
//!
//! `transform(cmd, executed)` answers: "the canonical log applied
//! `executed` before you — what does your command become?" Unrelated
//! commands pass through untouched. Coordinate-bearing commands shift
//! across structural inserts/removals. Commands referencing a deleted
//! sheet are dropped, and a drop is total: a revision is atomic, so one
//! dropped command drops the whole batch.
//!
//! The matrix is an exhaustive match over the closed command enum —
//! adding a command kind fails compilation until every pairing is
//! decided.
//!
//! Reference: Ellis & Gibbs, Concurrency Control in Groupware Systems

use gridsync_core::document::insert_pivot;
use gridsync_core::{CellPosition, Command, InsertPosition, SheetId, Zone};

#[derive(Clone, Copy, PartialEq)]
enum Dimension {
    Col,
    Row,
}

/// Transform `cmd` to apply after `executed`. `None` drops the command.
pub fn transform(cmd: &Command, executed: &Command) -> Option<Command> {
    match executed {
        Command::DeleteSheet { sheet_id } => {
            if cmd.sheet_id() == *sheet_id {
                None
            } else {
                Some(cmd.clone())
            }
        }
        Command::CreateSheet { sheet_id, name, .. } => {
            transform_against_created_sheet(cmd, *sheet_id, name)
        }
        Command::DuplicateSheet {
            new_sheet_id, name, ..
        } => transform_against_created_sheet(cmd, *new_sheet_id, name),
        Command::AddColumns {
            sheet_id,
            base,
            position,
            quantity,
        } => transform_against_insertion(
            cmd,
            *sheet_id,
            insert_pivot(*base, *position),
            *quantity,
            Dimension::Col,
        ),
        Command::AddRows {
            sheet_id,
            base,
            position,
            quantity,
        } => transform_against_insertion(
            cmd,
            *sheet_id,
            insert_pivot(*base, *position),
            *quantity,
            Dimension::Row,
        ),
        Command::RemoveColumns { sheet_id, columns } => {
            transform_against_removal(cmd, *sheet_id, columns, Dimension::Col)
        }
        Command::RemoveRows { sheet_id, rows } => {
            transform_against_removal(cmd, *sheet_id, rows, Dimension::Row)
        }
        Command::AddMerge { sheet_id, zone } => match cmd {
            // The earlier of two overlapping merges wins.
            Command::AddMerge {
                sheet_id: s,
                zone: z,
            } if s == sheet_id && z.overlaps(zone) => None,
            _ => Some(cmd.clone()),
        },
        Command::RemoveMerge { sheet_id, zone } => match cmd {
            // Removing an already-removed merge is a no-op.
            Command::RemoveMerge {
                sheet_id: s,
                zone: z,
            } if s == sheet_id && z == zone => None,
            _ => Some(cmd.clone()),
        },
        Command::UpdateCell { .. } | Command::ClearCell { .. } | Command::RenameSheet { .. } => {
            // Content edits never invalidate concurrent work; the later
            // write in canonical order simply lands last.
            Some(cmd.clone())
        }
    }
}

/// Fold a command through a sequence of already-executed commands.
pub fn transform_through(cmd: &Command, executed: &[Command]) -> Option<Command> {
    let mut current = cmd.clone();
    for ex in executed {
        current = transform(&current, ex)?;
    }
    Some(current)
}

/// Transform a whole revision. Revisions are atomic: if any command is
/// dropped the batch is dropped, never partially applied.
pub fn transform_revision(commands: &[Command], executed: &[Command]) -> Option<Vec<Command>> {
    let mut out = Vec::with_capacity(commands.len());
    for cmd in commands {
        out.push(transform_through(cmd, executed)?);
    }
    if out.is_empty() {
        None
    } else {
        Some(out)
    }
}

/// The structural inverse of a command, for transforming work that was
/// built on top of a revision that is being undone. Content edits have no
/// structural footprint and invert to nothing — their state is restored
/// mechanically from the recorded changes.
pub fn invert_for_transform(cmd: &Command) -> Vec<Command> {
    match cmd {
        Command::AddColumns {
            sheet_id,
            base,
            position,
            quantity,
        } => {
            let pivot = insert_pivot(*base, *position);
            vec![Command::RemoveColumns {
                sheet_id: *sheet_id,
                columns: (pivot..pivot + quantity).collect(),
            }]
        }
        Command::AddRows {
            sheet_id,
            base,
            position,
            quantity,
        } => {
            let pivot = insert_pivot(*base, *position);
            vec![Command::RemoveRows {
                sheet_id: *sheet_id,
                rows: (pivot..pivot + quantity).collect(),
            }]
        }
        Command::RemoveColumns { sheet_id, columns } => {
            let mut removed = columns.clone();
            removed.sort_unstable();
            removed.dedup();
            removed
                .into_iter()
                .map(|col| Command::AddColumns {
                    sheet_id: *sheet_id,
                    base: col,
                    position: InsertPosition::Before,
                    quantity: 1,
                })
                .collect()
        }
        Command::RemoveRows { sheet_id, rows } => {
            let mut removed = rows.clone();
            removed.sort_unstable();
            removed.dedup();
            removed
                .into_iter()
                .map(|row| Command::AddRows {
                    sheet_id: *sheet_id,
                    base: row,
                    position: InsertPosition::Before,
                    quantity: 1,
                })
                .collect()
        }
        Command::CreateSheet { sheet_id, .. } => vec![Command::DeleteSheet {
            sheet_id: *sheet_id,
        }],
        Command::DuplicateSheet { new_sheet_id, .. } => vec![Command::DeleteSheet {
            sheet_id: *new_sheet_id,
        }],
        Command::AddMerge { sheet_id, zone } => vec![Command::RemoveMerge {
            sheet_id: *sheet_id,
            zone: *zone,
        }],
        Command::RemoveMerge { sheet_id, zone } => vec![Command::AddMerge {
            sheet_id: *sheet_id,
            zone: *zone,
        }],
        Command::UpdateCell { .. }
        | Command::ClearCell { .. }
        | Command::DeleteSheet { .. }
        | Command::RenameSheet { .. } => Vec::new(),
    }
}

fn transform_against_created_sheet(
    cmd: &Command,
    created_id: SheetId,
    created_name: &str,
) -> Option<Command> {
    match cmd {
        Command::CreateSheet {
            sheet_id,
            name,
            index,
        } => {
            if *sheet_id == created_id {
                return None;
            }
            if name == created_name {
                return Some(Command::CreateSheet {
                    sheet_id: *sheet_id,
                    name: format!("{name}~"),
                    index: *index,
                });
            }
            Some(cmd.clone())
        }
        Command::DuplicateSheet {
            sheet_id,
            new_sheet_id,
            name,
        } => {
            if *new_sheet_id == created_id {
                return None;
            }
            if name == created_name {
                return Some(Command::DuplicateSheet {
                    sheet_id: *sheet_id,
                    new_sheet_id: *new_sheet_id,
                    name: format!("{name}~"),
                });
            }
            Some(cmd.clone())
        }
        Command::RenameSheet { sheet_id, name } if name == created_name => {
            Some(Command::RenameSheet {
                sheet_id: *sheet_id,
                name: format!("{name}~"),
            })
        }
        _ => Some(cmd.clone()),
    }
}

fn shift_position(position: CellPosition, dim: Dimension, track: u32) -> CellPosition {
    match dim {
        Dimension::Col => CellPosition::new(track, position.row),
        Dimension::Row => CellPosition::new(position.col, track),
    }
}

fn track_of(position: CellPosition, dim: Dimension) -> u32 {
    match dim {
        Dimension::Col => position.col,
        Dimension::Row => position.row,
    }
}

fn zone_span(zone: &Zone, dim: Dimension) -> (u32, u32) {
    match dim {
        Dimension::Col => (zone.left, zone.right),
        Dimension::Row => (zone.top, zone.bottom),
    }
}

fn zone_with_span(zone: &Zone, dim: Dimension, min: u32, max: u32) -> Zone {
    match dim {
        Dimension::Col => Zone::new(min, zone.top, max, zone.bottom),
        Dimension::Row => Zone::new(zone.left, min, zone.right, max),
    }
}

fn transform_against_insertion(
    cmd: &Command,
    sheet_id: SheetId,
    pivot: u32,
    quantity: u32,
    dim: Dimension,
) -> Option<Command> {
    if cmd.sheet_id() != sheet_id {
        return Some(cmd.clone());
    }
    let shift = |track: u32| if track >= pivot { track + quantity } else { track };
    match cmd {
        Command::UpdateCell {
            sheet_id,
            position,
            content,
        } => Some(Command::UpdateCell {
            sheet_id: *sheet_id,
            position: shift_position(*position, dim, shift(track_of(*position, dim))),
            content: content.clone(),
        }),
        Command::ClearCell { sheet_id, position } => Some(Command::ClearCell {
            sheet_id: *sheet_id,
            position: shift_position(*position, dim, shift(track_of(*position, dim))),
        }),
        Command::AddColumns {
            sheet_id,
            base,
            position,
            quantity: q,
        } if dim == Dimension::Col => Some(Command::AddColumns {
            sheet_id: *sheet_id,
            base: shift(*base),
            position: *position,
            quantity: *q,
        }),
        Command::AddRows {
            sheet_id,
            base,
            position,
            quantity: q,
        } if dim == Dimension::Row => Some(Command::AddRows {
            sheet_id: *sheet_id,
            base: shift(*base),
            position: *position,
            quantity: *q,
        }),
        Command::RemoveColumns { sheet_id, columns } if dim == Dimension::Col => {
            Some(Command::RemoveColumns {
                sheet_id: *sheet_id,
                columns: columns.iter().map(|c| shift(*c)).collect(),
            })
        }
        Command::RemoveRows { sheet_id, rows } if dim == Dimension::Row => {
            Some(Command::RemoveRows {
                sheet_id: *sheet_id,
                rows: rows.iter().map(|r| shift(*r)).collect(),
            })
        }
        Command::AddMerge { sheet_id, zone } | Command::RemoveMerge { sheet_id, zone } => {
            let (min, max) = zone_span(zone, dim);
            let new_zone = if min >= pivot {
                zone_with_span(zone, dim, min + quantity, max + quantity)
            } else if max >= pivot {
                zone_with_span(zone, dim, min, max + quantity)
            } else {
                *zone
            };
            Some(match cmd {
                Command::AddMerge { sheet_id, .. } => Command::AddMerge {
                    sheet_id: *sheet_id,
                    zone: new_zone,
                },
                _ => Command::RemoveMerge {
                    sheet_id: *sheet_id,
                    zone: new_zone,
                },
            })
        }
        _ => Some(cmd.clone()),
    }
}

fn transform_against_removal(
    cmd: &Command,
    sheet_id: SheetId,
    tracks: &[u32],
    dim: Dimension,
) -> Option<Command> {
    if cmd.sheet_id() != sheet_id {
        return Some(cmd.clone());
    }
    let mut removed = tracks.to_vec();
    removed.sort_unstable();
    removed.dedup();
    let dropped = |track: u32| removed.binary_search(&track).is_ok();
    let shift = |track: u32| track - removed.iter().filter(|r| **r < track).count() as u32;

    match cmd {
        Command::UpdateCell {
            sheet_id,
            position,
            content,
        } => {
            let track = track_of(*position, dim);
            if dropped(track) {
                return None;
            }
            Some(Command::UpdateCell {
                sheet_id: *sheet_id,
                position: shift_position(*position, dim, shift(track)),
                content: content.clone(),
            })
        }
        Command::ClearCell { sheet_id, position } => {
            let track = track_of(*position, dim);
            if dropped(track) {
                return None;
            }
            Some(Command::ClearCell {
                sheet_id: *sheet_id,
                position: shift_position(*position, dim, shift(track)),
            })
        }
        Command::AddColumns {
            sheet_id,
            base,
            position,
            quantity,
        } if dim == Dimension::Col => {
            if dropped(*base) {
                return None;
            }
            Some(Command::AddColumns {
                sheet_id: *sheet_id,
                base: shift(*base),
                position: *position,
                quantity: *quantity,
            })
        }
        Command::AddRows {
            sheet_id,
            base,
            position,
            quantity,
        } if dim == Dimension::Row => {
            if dropped(*base) {
                return None;
            }
            Some(Command::AddRows {
                sheet_id: *sheet_id,
                base: shift(*base),
                position: *position,
                quantity: *quantity,
            })
        }
        Command::RemoveColumns { sheet_id, columns } if dim == Dimension::Col => {
            let surviving: Vec<u32> = columns
                .iter()
                .filter(|c| !dropped(**c))
                .map(|c| shift(*c))
                .collect();
            if surviving.is_empty() {
                return None;
            }
            Some(Command::RemoveColumns {
                sheet_id: *sheet_id,
                columns: surviving,
            })
        }
        Command::RemoveRows { sheet_id, rows } if dim == Dimension::Row => {
            let surviving: Vec<u32> = rows
                .iter()
                .filter(|r| !dropped(**r))
                .map(|r| shift(*r))
                .collect();
            if surviving.is_empty() {
                return None;
            }
            Some(Command::RemoveRows {
                sheet_id: *sheet_id,
                rows: surviving,
            })
        }
        Command::AddMerge { sheet_id, zone } | Command::RemoveMerge { sheet_id, zone } => {
            let (min, max) = zone_span(zone, dim);
            let new_min = min - removed.iter().filter(|r| **r < min).count() as u32;
            let new_max = max - removed.iter().filter(|r| **r <= max).count() as u32;
            if new_max < new_min {
                // Every track the merge covered was removed.
                return None;
            }
            let new_zone = zone_with_span(zone, dim, new_min, new_max);
            Some(match cmd {
                Command::AddMerge { sheet_id, .. } => Command::AddMerge {
                    sheet_id: *sheet_id,
                    zone: new_zone,
                },
                _ => Command::RemoveMerge {
                    sheet_id: *sheet_id,
                    zone: new_zone,
                },
            })
        }
        _ => Some(cmd.clone()),
    }
}
