//! Stored state of one view row and how view mutations fold into it.

use basalt_types::Timestamp;
use serde::{Deserialize, Serialize};

use crate::liveness::view_row_is_live;
use crate::mutation::{ViewMutation, ViewRow};
use crate::schema::ViewDefinition;

/// One view row as the view table stores it.
///
/// `shadowed_at` is the newest shadowable deletion applied to the key. Data
/// no newer than it has already been purged; an incoming row is clipped to
/// it unless its marker is newer, in which case the deletion is lifted and
/// the incoming row replaces whatever the deletion left behind.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ViewRowState {
    pub row: ViewRow,
    pub shadowed_at: Option<Timestamp>,
}

impl ViewRowState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Folds a mutation into the row. Applying the same sequence of
    /// mutations again leaves the state unchanged.
    pub fn apply(&mut self, mutation: &ViewMutation) {
        match mutation {
            ViewMutation::Delete { timestamp, .. } => self.delete(*timestamp),
            ViewMutation::Insert { row, .. } | ViewMutation::Update { row, .. } => {
                self.upsert(row.clone());
            }
        }
    }

    fn delete(&mut self, deletion: Timestamp) {
        self.row = std::mem::take(&mut self.row).shadowed_by(deletion);
        self.shadowed_at = Some(self.shadowed_at.map_or(deletion, |d| d.max(deletion)));
    }

    fn upsert(&mut self, incoming: ViewRow) {
        match self.shadowed_at {
            Some(deletion) if incoming.marker.is_some_and(|m| m.timestamp > deletion) => {
                // Leftovers newer than the deletion belong to the row's
                // previous life; the incoming row is its complete content.
                self.shadowed_at = None;
                self.row = incoming;
            }
            Some(deletion) => self.row.merge(&incoming.shadowed_by(deletion)),
            None => self.row.merge(&incoming),
        }
    }

    pub fn is_live(&self, view: &ViewDefinition, now: Timestamp) -> bool {
        view_row_is_live(view, &self.row, now)
    }

    /// True if the state carries nothing worth keeping.
    pub fn is_empty(&self) -> bool {
        self.row == ViewRow::default() && self.shadowed_at.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mutation::ViewKey;
    use crate::row::{Cell, ClusteringKey, PartitionKey, RowMarker};
    use crate::value::Value;

    fn ts(micros: i64) -> Timestamp {
        Timestamp::from_micros(micros)
    }

    fn key() -> ViewKey {
        ViewKey {
            partition_key: PartitionKey::new(vec![Value::Int(1)]),
            clustering_key: ClusteringKey::empty(),
        }
    }

    fn row(marker: i64, cell: i64) -> ViewRow {
        let mut row = ViewRow {
            marker: Some(RowMarker::new(ts(marker))),
            ..ViewRow::default()
        };
        row.cells.insert("v".to_string(), Cell::live("x", ts(cell)));
        row
    }

    #[test]
    fn newer_marker_lifts_a_shadowable_deletion() {
        let mut state = ViewRowState::new();
        state.apply(&ViewMutation::Insert {
            key: key(),
            row: row(1, 1),
        });
        state.apply(&ViewMutation::Delete {
            key: key(),
            timestamp: ts(5),
        });
        assert!(state.row.marker.is_none());
        assert!(state.row.cells.is_empty());

        // The cell predates the deletion but comes back with the new marker.
        state.apply(&ViewMutation::Insert {
            key: key(),
            row: row(6, 1),
        });
        assert_eq!(state.shadowed_at, None);
        assert!(state.row.cells.contains_key("v"));
    }

    #[test]
    fn lifted_deletion_drops_data_from_the_previous_life() {
        let mut state = ViewRowState::new();
        state.apply(&ViewMutation::Insert {
            key: key(),
            row: row(1, 9),
        });
        // The cell written at 9 outlives the deletion at 5.
        state.apply(&ViewMutation::Delete {
            key: key(),
            timestamp: ts(5),
        });
        assert!(state.row.cells.contains_key("v"));

        let reinserted = ViewRow {
            marker: Some(RowMarker::new(ts(12))),
            ..ViewRow::default()
        };
        state.apply(&ViewMutation::Insert {
            key: key(),
            row: reinserted.clone(),
        });

        assert_eq!(state.row, reinserted);
        assert_eq!(state.shadowed_at, None);
    }

    #[test]
    fn older_marker_stays_shadowed() {
        let mut state = ViewRowState::new();
        state.apply(&ViewMutation::Delete {
            key: key(),
            timestamp: ts(5),
        });
        state.apply(&ViewMutation::Insert {
            key: key(),
            row: row(4, 9),
        });

        assert!(state.row.marker.is_none());
        assert!(state.row.cells.contains_key("v"));
        assert_eq!(state.shadowed_at, Some(ts(5)));
    }

    #[test]
    fn replaying_a_sequence_is_idempotent() {
        let mutations = [
            ViewMutation::Insert {
                key: key(),
                row: row(1, 1),
            },
            ViewMutation::Delete {
                key: key(),
                timestamp: ts(5),
            },
            ViewMutation::Insert {
                key: key(),
                row: row(6, 2),
            },
        ];
        let mut state = ViewRowState::new();
        mutations.iter().for_each(|m| state.apply(m));
        let once = state.clone();
        mutations.iter().for_each(|m| state.apply(m));

        assert_eq!(state, once);
    }
}
