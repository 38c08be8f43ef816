//! Cells, row markers and base row state.

use std::collections::BTreeMap;
use std::fmt::{self, Display};

use basalt_types::{Expiry, Timestamp};
use serde::{Deserialize, Serialize};

use crate::value::Value;

// ============================================================================
// Keys
// ============================================================================

/// Partition key components, in partition-key column order.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct PartitionKey(Vec<Value>);

impl PartitionKey {
    pub fn new(components: Vec<Value>) -> Self {
        Self(components)
    }

    pub fn components(&self) -> &[Value] {
        &self.0
    }
}

impl From<Vec<Value>> for PartitionKey {
    fn from(components: Vec<Value>) -> Self {
        Self(components)
    }
}

impl Display for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_components(f, &self.0)
    }
}

/// Clustering key components, in clustering column order.
///
/// The derived ordering is plain ascending; use a
/// [`ClusteringComparator`](crate::tombstone::ClusteringComparator) for
/// table order.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct ClusteringKey(Vec<Value>);

impl ClusteringKey {
    pub fn new(components: Vec<Value>) -> Self {
        Self(components)
    }

    pub fn empty() -> Self {
        Self(Vec::new())
    }

    pub fn components(&self) -> &[Value] {
        &self.0
    }
}

impl From<Vec<Value>> for ClusteringKey {
    fn from(components: Vec<Value>) -> Self {
        Self(components)
    }
}

impl Display for ClusteringKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_components(f, &self.0)
    }
}

fn write_components(f: &mut fmt::Formatter<'_>, values: &[Value]) -> fmt::Result {
    write!(f, "(")?;
    for (i, v) in values.iter().enumerate() {
        if i > 0 {
            write!(f, ", ")?;
        }
        write!(f, "{v}")?;
    }
    write!(f, ")")
}

// ============================================================================
// Cells
// ============================================================================

/// A single column's state: a live value or a cell tombstone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Cell {
    Live {
        value: Value,
        timestamp: Timestamp,
        expiry: Option<Expiry>,
    },
    Dead {
        timestamp: Timestamp,
    },
}

impl Cell {
    pub fn live(value: impl Into<Value>, timestamp: Timestamp) -> Self {
        Cell::Live {
            value: value.into(),
            timestamp,
            expiry: None,
        }
    }

    pub fn expiring(value: impl Into<Value>, timestamp: Timestamp, expiry: Expiry) -> Self {
        Cell::Live {
            value: value.into(),
            timestamp,
            expiry: Some(expiry),
        }
    }

    pub fn tombstone(timestamp: Timestamp) -> Self {
        Cell::Dead { timestamp }
    }

    pub fn timestamp(&self) -> Timestamp {
        match self {
            Cell::Live { timestamp, .. } | Cell::Dead { timestamp } => *timestamp,
        }
    }

    pub fn expiry(&self) -> Option<Expiry> {
        match self {
            Cell::Live { expiry, .. } => *expiry,
            Cell::Dead { .. } => None,
        }
    }

    pub fn is_live(&self, now: Timestamp) -> bool {
        match self {
            Cell::Live { expiry, .. } => !expiry.is_some_and(|e| e.is_expired(now)),
            Cell::Dead { .. } => false,
        }
    }

    /// The value if the cell is live at `now`.
    pub fn value_at(&self, now: Timestamp) -> Option<&Value> {
        match self {
            Cell::Live { value, .. } if self.is_live(now) => Some(value),
            _ => None,
        }
    }

    /// Last-write-wins: true if `self` should replace `other`.
    ///
    /// Higher timestamps win. On a tie a tombstone beats a live cell, a
    /// later expiry beats an earlier one, and then the larger value wins, so
    /// replicas always settle on the same cell.
    pub fn supersedes(&self, other: &Cell) -> bool {
        match self.timestamp().cmp(&other.timestamp()) {
            std::cmp::Ordering::Greater => true,
            std::cmp::Ordering::Less => false,
            std::cmp::Ordering::Equal => match (self, other) {
                (Cell::Dead { .. }, Cell::Live { .. }) => true,
                (Cell::Live { .. }, Cell::Dead { .. }) | (Cell::Dead { .. }, Cell::Dead { .. }) => {
                    false
                }
                (
                    Cell::Live {
                        value: a,
                        expiry: ea,
                        ..
                    },
                    Cell::Live {
                        value: b,
                        expiry: eb,
                        ..
                    },
                ) => {
                    let expiry_rank = |e: &Option<Expiry>| e.map_or(Timestamp::from_micros(i64::MAX), |e| e.expires_at);
                    (expiry_rank(ea), a) > (expiry_rank(eb), b)
                }
            },
        }
    }
}

/// Merges `incoming` into `slot` under last-write-wins.
pub fn merge_cell(slot: &mut Option<Cell>, incoming: Cell) {
    match slot {
        Some(existing) if !incoming.supersedes(existing) => {}
        _ => *slot = Some(incoming),
    }
}

/// Row liveness independent of any column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowMarker {
    pub timestamp: Timestamp,
    pub expiry: Option<Expiry>,
}

impl RowMarker {
    pub fn new(timestamp: Timestamp) -> Self {
        Self {
            timestamp,
            expiry: None,
        }
    }

    pub fn expiring(timestamp: Timestamp, expiry: Expiry) -> Self {
        Self {
            timestamp,
            expiry: Some(expiry),
        }
    }

    pub fn is_live(&self, now: Timestamp) -> bool {
        !self.expiry.is_some_and(|e| e.is_expired(now))
    }

    /// Same rule as [`Cell::supersedes`].
    pub fn supersedes(&self, other: &RowMarker) -> bool {
        let rank = |m: &RowMarker| {
            (
                m.timestamp,
                m.expiry
                    .map_or(Timestamp::from_micros(i64::MAX), |e| e.expires_at),
            )
        };
        rank(self) > rank(other)
    }
}

// ============================================================================
// Base Row State
// ============================================================================

/// One logical base row as seen after conflict resolution.
///
/// Cells include tombstones so a consumer can tell "deleted at T" from
/// "never written". Static columns are never part of a row state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BaseRowState {
    pub partition_key: PartitionKey,
    pub clustering_key: ClusteringKey,
    pub marker: Option<RowMarker>,
    pub cells: BTreeMap<String, Cell>,
}

impl BaseRowState {
    pub fn new(partition_key: PartitionKey, clustering_key: ClusteringKey) -> Self {
        Self {
            partition_key,
            clustering_key,
            marker: None,
            cells: BTreeMap::new(),
        }
    }

    pub fn with_marker(mut self, marker: RowMarker) -> Self {
        self.marker = Some(marker);
        self
    }

    pub fn with_cell(mut self, column: impl Into<String>, cell: Cell) -> Self {
        self.cells.insert(column.into(), cell);
        self
    }

    /// A row is live iff it has a live marker or at least one live cell.
    pub fn is_live(&self, now: Timestamp) -> bool {
        self.has_live_marker(now) || self.cells.values().any(|c| c.is_live(now))
    }

    pub fn has_live_marker(&self, now: Timestamp) -> bool {
        self.marker.is_some_and(|m| m.is_live(now))
    }

    pub fn cell(&self, column: &str) -> Option<&Cell> {
        self.cells.get(column)
    }

    /// The column's value if its cell is live at `now`.
    pub fn live_value(&self, column: &str, now: Timestamp) -> Option<&Value> {
        self.cells.get(column).and_then(|c| c.value_at(now))
    }

    /// Newest timestamp anywhere in the row.
    pub fn max_timestamp(&self) -> Option<Timestamp> {
        self.marker
            .map(|m| m.timestamp)
            .into_iter()
            .chain(self.cells.values().map(Cell::timestamp))
            .max()
    }

    /// Removes everything a deletion at `deletion` shadows.
    #[must_use]
    pub fn shadowed_by(mut self, deletion: Option<Timestamp>) -> Self {
        let Some(deletion) = deletion else {
            return self;
        };
        if self.marker.is_some_and(|m| m.timestamp <= deletion) {
            self.marker = None;
        }
        self.cells.retain(|_, cell| cell.timestamp() > deletion);
        self
    }

    /// Merges a newer write into this row under last-write-wins.
    pub fn merge(&mut self, other: &BaseRowState) {
        if let Some(incoming) = other.marker {
            if self.marker.is_none_or(|m| incoming.supersedes(&m)) {
                self.marker = Some(incoming);
            }
        }
        for (column, cell) in &other.cells {
            let mut slot = self.cells.remove(column);
            merge_cell(&mut slot, cell.clone());
            if let Some(cell) = slot {
                self.cells.insert(column.clone(), cell);
            }
        }
    }

    /// True if nothing at all is recorded for the row.
    pub fn is_empty(&self) -> bool {
        self.marker.is_none() && self.cells.is_empty()
    }
}
