//! Catalog state.
//!
//! The kernel keeps the base tables and the views bound to them. State
//! transitions take ownership and return a new state (builder pattern).

use std::collections::BTreeMap;

use basalt_types::{TableId, ViewId};
use serde::{Deserialize, Serialize};

use crate::schema::{BaseSchema, ViewDefinition};

// ============================================================================
// View Metadata
// ============================================================================

/// A registered view and the base table it derives from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewMetadata {
    pub view_id: ViewId,
    pub base_table: TableId,
    pub definition: ViewDefinition,
}

// ============================================================================
// Catalog State
// ============================================================================

/// The kernel's in-memory catalog.
///
/// Methods that change the state take ownership of `self`, mutate, and
/// return `self`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct State {
    tables: BTreeMap<TableId, BaseSchema>,
    table_name_index: BTreeMap<String, TableId>,
    next_table_id: TableId,

    views: BTreeMap<ViewId, ViewMetadata>,
    view_name_index: BTreeMap<String, ViewId>,
    next_view_id: ViewId,
}

impl State {
    /// Creates a new empty state.
    pub fn new() -> Self {
        Self::default()
    }

    /// True if a table or a view already uses `name`.
    pub fn name_in_use(&self, name: &str) -> bool {
        self.table_name_index.contains_key(name) || self.view_name_index.contains_key(name)
    }

    // ========================================================================
    // Table Management
    // ========================================================================

    pub fn table_exists(&self, id: &TableId) -> bool {
        self.tables.contains_key(id)
    }

    pub fn get_table(&self, id: &TableId) -> Option<&BaseSchema> {
        self.tables.get(id)
    }

    pub fn table_by_name(&self, name: &str) -> Option<&BaseSchema> {
        self.table_name_index
            .get(name)
            .and_then(|id| self.tables.get(id))
    }

    pub fn tables(&self) -> &BTreeMap<TableId, BaseSchema> {
        &self.tables
    }

    pub fn table_count(&self) -> usize {
        self.tables.len()
    }

    /// Returns the next table ID that will be allocated.
    pub fn next_table_id(&self) -> TableId {
        self.next_table_id
    }

    /// Adds or replaces a table.
    ///
    /// Internal to the kernel - external code should use `apply_committed`.
    pub(crate) fn with_table(mut self, schema: BaseSchema) -> Self {
        let id = schema.table_id;
        if self.next_table_id <= id {
            self.next_table_id = id + TableId::new(1);
        }
        self.table_name_index.insert(schema.name.clone(), id);
        self.tables.insert(id, schema);
        self
    }

    pub(crate) fn without_table(mut self, id: TableId) -> Self {
        if let Some(schema) = self.tables.remove(&id) {
            self.table_name_index.remove(&schema.name);
        }
        self
    }

    // ========================================================================
    // View Management
    // ========================================================================

    pub fn view_exists(&self, id: &ViewId) -> bool {
        self.views.contains_key(id)
    }

    pub fn get_view(&self, id: &ViewId) -> Option<&ViewMetadata> {
        self.views.get(id)
    }

    pub fn view_by_name(&self, name: &str) -> Option<&ViewMetadata> {
        self.view_name_index
            .get(name)
            .and_then(|id| self.views.get(id))
    }

    pub fn views(&self) -> &BTreeMap<ViewId, ViewMetadata> {
        &self.views
    }

    /// Views derived from `table`, in view ID order.
    pub fn views_of(&self, table: TableId) -> impl Iterator<Item = &ViewMetadata> {
        self.views.values().filter(move |v| v.base_table == table)
    }

    pub fn view_count(&self) -> usize {
        self.views.len()
    }

    /// Returns the next view ID that will be allocated.
    pub fn next_view_id(&self) -> ViewId {
        self.next_view_id
    }

    pub(crate) fn with_view(mut self, meta: ViewMetadata) -> Self {
        let id = meta.view_id;
        if self.next_view_id <= id {
            self.next_view_id = id + ViewId::new(1);
        }
        self.view_name_index
            .insert(meta.definition.name().to_string(), id);
        self.views.insert(id, meta);
        self
    }

    pub(crate) fn without_view(mut self, id: ViewId) -> Self {
        if let Some(meta) = self.views.remove(&id) {
            self.view_name_index.remove(meta.definition.name());
        }
        self
    }
}
