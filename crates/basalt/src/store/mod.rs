//! Reference storage for base and view tables.
//!
//! Base tables live in memory; view tables add a flushed JSON segment and a
//! row cache so reads can be served from disk.

mod base;
mod cache;
mod view;

use std::collections::BTreeMap;

use basalt_types::Timestamp;
use basalt_view::{BaseRowState, BaseSchema, Value, ViewDefinition, ViewKey, ViewRow};

pub use base::{BaseTable, BaseWrite, StagedWrite};
pub use view::{StagedRows, ViewTable};

/// Per-read options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReadOptions {
    /// Read flushed rows from disk even when they are cached.
    pub bypass_cache: bool,
}

impl ReadOptions {
    pub fn bypass_cache() -> Self {
        Self { bypass_cache: true }
    }
}

/// A row as a reader sees it: key columns and live regular columns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Row {
    columns: BTreeMap<String, Value>,
}

impl Row {
    pub fn get(&self, column: &str) -> Option<&Value> {
        self.columns.get(column)
    }

    pub fn columns(&self) -> &BTreeMap<String, Value> {
        &self.columns
    }

    pub(crate) fn from_view(view: &ViewDefinition, key: &ViewKey, row: &ViewRow, now: Timestamp) -> Self {
        let key_values = key
            .partition_key
            .components()
            .iter()
            .chain(key.clustering_key.components());
        let mut columns: BTreeMap<String, Value> = view
            .key_columns()
            .zip(key_values)
            .map(|(column, value)| (column.name.clone(), value.clone()))
            .collect();
        for column in view.selected() {
            if let Some(value) = row.cells.get(&column.name).and_then(|c| c.value_at(now)) {
                columns.insert(column.name.clone(), value.clone());
            }
        }
        Self { columns }
    }

    pub(crate) fn from_base(schema: &BaseSchema, row: &BaseRowState, now: Timestamp) -> Self {
        let key_values = row
            .partition_key
            .components()
            .iter()
            .chain(row.clustering_key.components());
        let mut columns: BTreeMap<String, Value> = schema
            .partition_key()
            .chain(schema.clustering_key())
            .zip(key_values)
            .map(|(column, value)| (column.name.clone(), value.clone()))
            .collect();
        for (name, cell) in &row.cells {
            if let Some(value) = cell.value_at(now) {
                columns.insert(name.clone(), value.clone());
            }
        }
        Self { columns }
    }
}
