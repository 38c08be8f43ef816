//! The Liveness Resolver: whether a base row appears in a view, under which
//! key, and with what liveness.

use std::collections::BTreeMap;

use basalt_types::{Expiry, Timestamp};

use crate::mutation::{ViewKey, ViewRow};
use crate::row::{BaseRowState, Cell, ClusteringKey, PartitionKey, RowMarker};
use crate::schema::{ColumnKind, ViewColumn, ViewDefinition};
use crate::value::Value;

/// Timestamp and expiry attached to a resolved view row.
///
/// `timestamp` is the write that makes the row visible: the marker's, or the
/// newest live cell's when the row has no marker. Deletions of the row are
/// issued no earlier than it, so a later reappearance can lift them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LivenessInfo {
    pub timestamp: Timestamp,
    pub expiry: Option<Expiry>,
}

/// A base row as it should appear in a view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedRow {
    pub key: ViewKey,
    pub liveness: LivenessInfo,
    pub row: ViewRow,
}

/// Resolves `row` under `view` at `now`.
///
/// Returns `None` when the base row is dead, when any view key column has
/// no live value, or when the view's filter rejects the row.
pub fn resolve(view: &ViewDefinition, row: &BaseRowState, now: Timestamp) -> Option<ResolvedRow> {
    if !row.is_live(now) {
        return None;
    }

    let partition_key = view
        .partition_key()
        .iter()
        .map(|column| key_component(column, row, now))
        .collect::<Option<Vec<_>>>()?;
    let clustering_key = view
        .clustering_key()
        .iter()
        .map(|column| key_component(column, row, now))
        .collect::<Option<Vec<_>>>()?;

    // Restrictions only ever name view key columns.
    for term in view.comparisons() {
        let value = view
            .key_columns()
            .position(|c| c.name == term.column)
            .and_then(|i| partition_key.iter().chain(&clustering_key).nth(i));
        if !term.matches(value) {
            return None;
        }
    }

    let mut view_row = ViewRow::default();
    for column in view.selected() {
        if let Some(cell) = row.cell(&column.name) {
            view_row.cells.insert(column.name.clone(), cell.clone());
        }
    }

    let expiry = match view.regular_key_column() {
        Some(key_column) => {
            // The promoted column alone decides whether the view row lives.
            let cell = row.cell(key_column)?;
            view_row.marker = Some(RowMarker {
                timestamp: cell.timestamp(),
                expiry: cell.expiry(),
            });
            cell.expiry()
        }
        None => {
            view_row.marker = row.marker.filter(|m| m.is_live(now));
            view_row.virtual_cells = virtual_cells(view, row);
            view_row.marker.and_then(|m| m.expiry)
        }
    };

    // The row lives as of its marker; without one, as of its newest live
    // cell.
    let timestamp = view_row.marker.map(|m| m.timestamp).or_else(|| {
        view_row
            .cells
            .values()
            .chain(view_row.virtual_cells.values())
            .filter(|c| c.is_live(now))
            .map(Cell::timestamp)
            .max()
    })?;

    Some(ResolvedRow {
        key: ViewKey {
            partition_key: PartitionKey::new(partition_key),
            clustering_key: ClusteringKey::new(clustering_key),
        },
        liveness: LivenessInfo { timestamp, expiry },
        row: view_row,
    })
}

/// Whether a stored view row is visible at `now`.
///
/// A view keyed by a promoted base column lives exactly as long as its
/// marker; otherwise any live marker, cell or liveness cell keeps it, the
/// same way the base row is kept alive.
pub fn view_row_is_live(view: &ViewDefinition, row: &ViewRow, now: Timestamp) -> bool {
    let marker_live = row.marker.is_some_and(|m| m.is_live(now));
    if view.regular_key_column().is_some() {
        return marker_live;
    }
    marker_live
        || row.cells.values().any(|c| c.is_live(now))
        || row.virtual_cells.values().any(|c| c.is_live(now))
}

/// Zero-width copies of the unselected cells, tombstones included, so the
/// view row can outlive its marker exactly as long as the base row does.
fn virtual_cells(view: &ViewDefinition, row: &BaseRowState) -> BTreeMap<String, Cell> {
    view.unselected()
        .iter()
        .filter_map(|column| {
            let cell = match row.cell(column)? {
                Cell::Live {
                    timestamp, expiry, ..
                } => Cell::Live {
                    value: Value::empty(),
                    timestamp: *timestamp,
                    expiry: *expiry,
                },
                dead @ Cell::Dead { .. } => dead.clone(),
            };
            Some((column.clone(), cell))
        })
        .collect()
}

fn key_component(column: &ViewColumn, row: &BaseRowState, now: Timestamp) -> Option<Value> {
    match (column.base_kind, column.base_index) {
        (ColumnKind::PartitionKey, Some(i)) => row.partition_key.components().get(i).cloned(),
        (ColumnKind::Clustering, Some(i)) => row.clustering_key.components().get(i).cloned(),
        _ => row.live_value(&column.name, now).cloned(),
    }
}
