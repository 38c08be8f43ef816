//! The Update Propagator.
//!
//! Translates base row transitions into view mutations:
//!
//! | before      | after       | mutations                   |
//! |-------------|-------------|-----------------------------|
//! | absent      | absent      | none                        |
//! | absent      | present(K)  | insert K                    |
//! | present(K)  | absent      | delete K                    |
//! | present(K1) | present(K2) | delete K1, insert K2        |
//! | present(K)  | present(K)  | update K if content changed |

use std::collections::BTreeMap;

use basalt_types::Timestamp;
use tracing::trace;

use crate::liveness::{LivenessInfo, resolve};
use crate::mutation::{PartitionUpdate, RowDiff, ViewMutation, ViewRow};
use crate::row::{BaseRowState, Cell};
use crate::schema::ViewDefinition;
use crate::skip::can_skip;

/// Computes the view mutations for one base row transition.
///
/// `timestamp` is the timestamp of the base write that caused the
/// transition; deletions it implies are written at least that late.
pub fn propagate(
    view: &ViewDefinition,
    before: Option<&BaseRowState>,
    after: Option<&BaseRowState>,
    timestamp: Timestamp,
    now: Timestamp,
) -> Vec<ViewMutation> {
    let before = before.and_then(|row| resolve(view, row, now));
    let after = after.and_then(|row| resolve(view, row, now));

    match (before, after) {
        (None, None) => Vec::new(),
        (None, Some(after)) => vec![ViewMutation::Insert {
            key: after.key,
            row: after.row,
        }],
        (Some(before), None) => vec![ViewMutation::Delete {
            timestamp: deletion_timestamp(&before.liveness, timestamp),
            key: before.key,
        }],
        (Some(before), Some(after)) if before.key != after.key => vec![
            ViewMutation::Delete {
                timestamp: deletion_timestamp(&before.liveness, timestamp),
                key: before.key,
            },
            ViewMutation::Insert {
                key: after.key,
                row: after.row,
            },
        ],
        (Some(before), Some(after)) => {
            if before.row == after.row {
                return Vec::new();
            }
            let mut mutations = Vec::with_capacity(2);
            // A partial base deletion removes data the merge below cannot
            // take back; purge it first.
            if let Some(purge) = purged_timestamp(&before.row, &after.row) {
                mutations.push(ViewMutation::Delete {
                    key: before.key,
                    timestamp: purge,
                });
            }
            mutations.push(ViewMutation::Update {
                key: after.key,
                row: after.row,
            });
            mutations
        }
    }
}

/// Propagates one diff, consulting the skip check first.
pub fn propagate_diff(view: &ViewDefinition, diff: &RowDiff, now: Timestamp) -> Vec<ViewMutation> {
    if can_skip(view, diff, now) {
        return Vec::new();
    }
    propagate(
        view,
        diff.before.as_ref(),
        diff.after.as_ref(),
        diff.timestamp,
        now,
    )
}

/// Propagates every row of a (possibly multi-row) base update.
///
/// Rows are processed in chunks of `chunk_size`; chunking bounds the work
/// between trace points and never changes the result.
pub fn propagate_update(
    view: &ViewDefinition,
    update: &PartitionUpdate,
    now: Timestamp,
    chunk_size: usize,
) -> Vec<ViewMutation> {
    let rows: Vec<&RowDiff> = update.rows().collect();
    let mut mutations = Vec::new();
    for (index, chunk) in rows.chunks(chunk_size.max(1)).enumerate() {
        let before = mutations.len();
        for diff in chunk {
            mutations.extend(propagate_diff(view, diff, now));
        }
        trace!(
            view = view.name(),
            partition = %update.partition_key,
            chunk = index,
            rows = chunk.len(),
            mutations = mutations.len() - before,
            "propagated chunk"
        );
    }
    mutations
}

/// A deletion shadows the liveness the row was shown with, and is never
/// older than the write that caused it.
fn deletion_timestamp(liveness: &LivenessInfo, timestamp: Timestamp) -> Timestamp {
    liveness.timestamp.max(timestamp)
}

/// Newest timestamp among the marker and cells `before` had that `after`
/// no longer carries, if any.
fn purged_timestamp(before: &ViewRow, after: &ViewRow) -> Option<Timestamp> {
    let lost_marker = match (before.marker, after.marker) {
        (Some(marker), None) => Some(marker.timestamp),
        _ => None,
    };
    let lost_cells = lost(&before.cells, &after.cells);
    let lost_virtual = lost(&before.virtual_cells, &after.virtual_cells);
    lost_marker.into_iter().chain(lost_cells).chain(lost_virtual).max()
}

fn lost<'a>(
    before: &'a BTreeMap<String, Cell>,
    after: &'a BTreeMap<String, Cell>,
) -> impl Iterator<Item = Timestamp> + 'a {
    before
        .iter()
        .filter(|(column, _)| !after.contains_key(*column))
        .map(|(_, cell)| cell.timestamp())
}
