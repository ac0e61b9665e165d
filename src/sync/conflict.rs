//! Conflict resolution.
//!
//! A conflict exists only when the remote change token differs from the
//! last-recorded one AND the local task is dirty. This module is the pure
//! decision function for that case; it performs no I/O, so every outcome is
//! unit-testable.

use serde::{Deserialize, Serialize};

use crate::constants::CONFLICT_COPY_SUFFIX;
use crate::remote::TaskFields;

/// Configured strategy for resolving dual-change conflicts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConflictStrategy {
    /// Remote version replaces local; the pending push is dropped.
    ServerWins,
    /// Local version is kept and (re-)pushed; remote version discarded.
    LocalWins,
    /// Field-level three-way merge; local wins per field when both changed.
    #[default]
    Merge,
    /// Remote version overwrites the original; the local version survives
    /// as a new duplicate task queued for create.
    KeepBoth,
}

/// Outcome of resolving one conflicted task.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// Overwrite local with the remote version and clear the dirty flag.
    TakeRemote,
    /// Keep the local fields; advance the stored token and push again.
    KeepLocal,
    /// Write the merged fields locally and push them.
    Merged(TaskFields),
    /// Overwrite the original with the remote version and create this
    /// duplicate (carrying the local fields) as a new task.
    KeepBoth { duplicate: TaskFields },
}

/// Per-field three-way pick. With a base: an unchanged side yields to the
/// changed side, and local wins when both changed. Without a base, changes
/// cannot be attributed, so local wins wherever the sides differ.
fn pick<T: Clone + PartialEq>(local: &T, remote: &T, base: Option<&T>) -> T {
    match base {
        Some(base) => {
            if local == base {
                remote.clone()
            } else {
                local.clone()
            }
        }
        None => local.clone(),
    }
}

fn merge_fields(local: &TaskFields, remote: &TaskFields, base: Option<&TaskFields>) -> TaskFields {
    TaskFields {
        content: pick(&local.content, &remote.content, base.map(|b| &b.content)),
        description: pick(&local.description, &remote.description, base.map(|b| &b.description)),
        is_completed: pick(&local.is_completed, &remote.is_completed, base.map(|b| &b.is_completed)),
        priority: pick(&local.priority, &remote.priority, base.map(|b| &b.priority)),
        due_date: pick(&local.due_date, &remote.due_date, base.map(|b| &b.due_date)),
        start_date: pick(&local.start_date, &remote.start_date, base.map(|b| &b.start_date)),
        labels: pick(&local.labels, &remote.labels, base.map(|b| &b.labels)),
    }
}

/// Resolve a dual-change conflict. `base` is the field snapshot from the
/// last common sync point, when one exists.
pub fn resolve(
    strategy: ConflictStrategy,
    local: &TaskFields,
    remote: &TaskFields,
    base: Option<&TaskFields>,
) -> Resolution {
    match strategy {
        ConflictStrategy::ServerWins => Resolution::TakeRemote,
        ConflictStrategy::LocalWins => Resolution::KeepLocal,
        ConflictStrategy::Merge => Resolution::Merged(merge_fields(local, remote, base)),
        ConflictStrategy::KeepBoth => {
            let mut duplicate = local.clone();
            duplicate.content.push_str(CONFLICT_COPY_SUFFIX);
            Resolution::KeepBoth { duplicate }
        }
    }
}
