//! Base change descriptions consumed by the propagator and the view
//! mutations it produces.

use std::collections::BTreeMap;
use std::fmt::{self, Display};

use basalt_types::Timestamp;
use serde::{Deserialize, Serialize};

use crate::row::{BaseRowState, Cell, ClusteringKey, PartitionKey, RowMarker, merge_cell};
use crate::tombstone::RangeTombstone;

// ============================================================================
// Base Changes
// ============================================================================

/// Before/after state of one base row, as reported by the write path.
///
/// `after` already reflects conflict resolution with existing data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowDiff {
    pub partition_key: PartitionKey,
    pub clustering_key: ClusteringKey,
    pub before: Option<BaseRowState>,
    pub after: Option<BaseRowState>,
    pub timestamp: Timestamp,
}

impl RowDiff {
    pub fn new(
        before: Option<BaseRowState>,
        after: Option<BaseRowState>,
        timestamp: Timestamp,
    ) -> Self {
        let (partition_key, clustering_key) = before
            .as_ref()
            .or(after.as_ref())
            .map(|row| (row.partition_key.clone(), row.clustering_key.clone()))
            .unwrap_or_default();
        Self {
            partition_key,
            clustering_key,
            before,
            after,
            timestamp,
        }
    }
}

/// One logical base modification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BaseChange {
    /// Insert or update of a single row.
    Upsert(RowDiff),
    /// Row tombstone.
    DeleteRow(RowDiff),
    /// Range tombstone, with every row it affected.
    DeleteRange {
        range: RangeTombstone,
        affected: Vec<RowDiff>,
    },
    /// Partition tombstone, with every row it affected.
    DeletePartition {
        deletion: Timestamp,
        affected: Vec<RowDiff>,
    },
}

impl BaseChange {
    pub fn rows(&self) -> &[RowDiff] {
        match self {
            BaseChange::Upsert(diff) | BaseChange::DeleteRow(diff) => std::slice::from_ref(diff),
            BaseChange::DeleteRange { affected, .. }
            | BaseChange::DeletePartition { affected, .. } => affected,
        }
    }
}

/// All changes one statement (or batch) made to one base partition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionUpdate {
    pub partition_key: PartitionKey,
    pub changes: Vec<BaseChange>,
}

impl PartitionUpdate {
    pub fn new(partition_key: PartitionKey) -> Self {
        Self {
            partition_key,
            changes: Vec::new(),
        }
    }

    pub fn with_change(mut self, change: BaseChange) -> Self {
        self.changes.push(change);
        self
    }

    /// Every row diff in the update, in order.
    pub fn rows(&self) -> impl Iterator<Item = &RowDiff> {
        self.changes.iter().flat_map(BaseChange::rows)
    }

    pub fn row_count(&self) -> usize {
        self.changes.iter().map(|c| c.rows().len()).sum()
    }
}

// ============================================================================
// View Rows and Mutations
// ============================================================================

/// Primary key of a view row.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ViewKey {
    pub partition_key: PartitionKey,
    pub clustering_key: ClusteringKey,
}

impl Display for ViewKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.partition_key, self.clustering_key)
    }
}

/// Content of a view row.
///
/// `virtual_cells` are zero-width liveness cells mirroring the unselected
/// base columns of views without a promoted key column, so the view row
/// lives exactly as long as the base row.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ViewRow {
    pub marker: Option<RowMarker>,
    pub cells: BTreeMap<String, Cell>,
    pub virtual_cells: BTreeMap<String, Cell>,
}

impl ViewRow {
    /// Newest timestamp in the row.
    pub fn max_timestamp(&self) -> Option<Timestamp> {
        self.marker
            .map(|m| m.timestamp)
            .into_iter()
            .chain(self.cells.values().map(Cell::timestamp))
            .chain(self.virtual_cells.values().map(Cell::timestamp))
            .max()
    }

    /// Merges `other` into this row under last-write-wins.
    pub fn merge(&mut self, other: &ViewRow) {
        if let Some(incoming) = other.marker {
            if self.marker.is_none_or(|m| incoming.supersedes(&m)) {
                self.marker = Some(incoming);
            }
        }
        merge_cells(&mut self.cells, &other.cells);
        merge_cells(&mut self.virtual_cells, &other.virtual_cells);
    }

    /// Removes data a deletion at `deletion` shadows.
    #[must_use]
    pub fn shadowed_by(mut self, deletion: Timestamp) -> Self {
        if self.marker.is_some_and(|m| m.timestamp <= deletion) {
            self.marker = None;
        }
        self.cells.retain(|_, c| c.timestamp() > deletion);
        self.virtual_cells.retain(|_, c| c.timestamp() > deletion);
        self
    }
}

fn merge_cells(into: &mut BTreeMap<String, Cell>, from: &BTreeMap<String, Cell>) {
    for (column, cell) in from {
        let mut slot = into.remove(column);
        merge_cell(&mut slot, cell.clone());
        if let Some(cell) = slot {
            into.insert(column.clone(), cell);
        }
    }
}

/// A write against a view table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ViewMutation {
    /// A row that was absent under the view now exists at `key`.
    Insert { key: ViewKey, row: ViewRow },
    /// The row at `key` stays but its content changed.
    Update { key: ViewKey, row: ViewRow },
    /// Shadowable row deletion: a later insert whose marker is newer than
    /// `timestamp` lifts it.
    Delete { key: ViewKey, timestamp: Timestamp },
}

impl ViewMutation {
    pub fn key(&self) -> &ViewKey {
        match self {
            ViewMutation::Insert { key, .. }
            | ViewMutation::Update { key, .. }
            | ViewMutation::Delete { key, .. } => key,
        }
    }

    pub fn is_delete(&self) -> bool {
        matches!(self, ViewMutation::Delete { .. })
    }
}
