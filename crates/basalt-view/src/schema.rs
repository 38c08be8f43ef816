//! Base table schemas and the Schema Projector.
//!
//! [`project`] turns a base schema plus a [`ViewSpec`] into a validated
//! [`ViewDefinition`]. All validation happens before anything is registered,
//! so a rejected view never leaves a partial definition behind.

use std::collections::{BTreeMap, BTreeSet};

use basalt_types::{TableId, Ttl};
use serde::{Deserialize, Serialize};

use crate::error::{SchemaError, ViewError};
use crate::filter::{FilterOp, FilterTerm, Operand};
use crate::tombstone::ClusteringComparator;
use crate::value::DataType;

// ============================================================================
// Base Schema
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnKind {
    PartitionKey,
    Clustering,
    Regular,
    Static,
}

impl ColumnKind {
    pub fn is_primary_key(self) -> bool {
        matches!(self, ColumnKind::PartitionKey | ColumnKind::Clustering)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClusteringOrder {
    #[default]
    Asc,
    Desc,
}

impl ClusteringOrder {
    pub fn reversed(self) -> Self {
        match self {
            ClusteringOrder::Asc => ClusteringOrder::Desc,
            ClusteringOrder::Desc => ClusteringOrder::Asc,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDef {
    pub name: String,
    pub data_type: DataType,
    pub kind: ColumnKind,
}

/// Schema of a base table: ordered partition key, ordered clustering key,
/// regular and static columns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BaseSchema {
    pub table_id: TableId,
    pub name: String,
    columns: Vec<ColumnDef>,
    clustering_order: BTreeMap<String, ClusteringOrder>,
    pub comment: String,
    pub default_ttl: Option<Ttl>,
}

impl BaseSchema {
    pub fn builder(table_id: TableId, name: impl Into<String>) -> BaseSchemaBuilder {
        BaseSchemaBuilder {
            table_id,
            name: name.into(),
            partition_key: Vec::new(),
            clustering: Vec::new(),
            others: Vec::new(),
            comment: String::new(),
            default_ttl: None,
        }
    }

    pub fn columns(&self) -> &[ColumnDef] {
        &self.columns
    }

    pub fn column(&self, name: &str) -> Option<&ColumnDef> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn partition_key(&self) -> impl Iterator<Item = &ColumnDef> {
        self.columns_of(ColumnKind::PartitionKey)
    }

    pub fn clustering_key(&self) -> impl Iterator<Item = &ColumnDef> {
        self.columns_of(ColumnKind::Clustering)
    }

    pub fn regular_columns(&self) -> impl Iterator<Item = &ColumnDef> {
        self.columns_of(ColumnKind::Regular)
    }

    pub fn static_columns(&self) -> impl Iterator<Item = &ColumnDef> {
        self.columns_of(ColumnKind::Static)
    }

    fn columns_of(&self, kind: ColumnKind) -> impl Iterator<Item = &ColumnDef> {
        self.columns.iter().filter(move |c| c.kind == kind)
    }

    /// Primary key column names: partition key then clustering key.
    pub fn primary_key(&self) -> Vec<&str> {
        self.partition_key()
            .chain(self.clustering_key())
            .map(|c| c.name.as_str())
            .collect()
    }

    pub fn clustering_order(&self, column: &str) -> Option<ClusteringOrder> {
        self.clustering_order.get(column).copied()
    }

    /// Comparator for this table's clustering keys.
    pub fn comparator(&self) -> ClusteringComparator {
        ClusteringComparator::new(
            self.clustering_key()
                .map(|c| self.clustering_order(&c.name).unwrap_or_default())
                .collect(),
        )
    }

    pub fn with_comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = comment.into();
        self
    }

    pub fn with_default_ttl(mut self, ttl: Option<Ttl>) -> Self {
        self.default_ttl = ttl;
        self
    }

    /// Adds a regular column. Existing names are rejected.
    pub fn with_regular_column(
        mut self,
        name: impl Into<String>,
        data_type: DataType,
    ) -> Result<Self, SchemaError> {
        let name = name.into();
        if self.column(&name).is_some() {
            return Err(SchemaError::DuplicateColumn(name));
        }
        self.columns.push(ColumnDef {
            name,
            data_type,
            kind: ColumnKind::Regular,
        });
        Ok(self)
    }

    /// Drops a non-key column.
    pub fn without_column(mut self, name: &str) -> Result<Self, SchemaError> {
        let column = self
            .column(name)
            .ok_or_else(|| SchemaError::UnknownColumn(name.to_string()))?;
        if column.kind.is_primary_key() {
            return Err(SchemaError::IncompatibleAlteration {
                column: name.to_string(),
                reason: "primary key columns cannot be dropped".to_string(),
            });
        }
        self.columns.retain(|c| c.name != name);
        Ok(self)
    }
}

pub struct BaseSchemaBuilder {
    table_id: TableId,
    name: String,
    partition_key: Vec<ColumnDef>,
    clustering: Vec<(ColumnDef, ClusteringOrder)>,
    others: Vec<ColumnDef>,
    comment: String,
    default_ttl: Option<Ttl>,
}

impl BaseSchemaBuilder {
    pub fn partition_key(mut self, name: impl Into<String>, data_type: DataType) -> Self {
        self.partition_key.push(ColumnDef {
            name: name.into(),
            data_type,
            kind: ColumnKind::PartitionKey,
        });
        self
    }

    pub fn clustering(
        mut self,
        name: impl Into<String>,
        data_type: DataType,
        order: ClusteringOrder,
    ) -> Self {
        self.clustering.push((
            ColumnDef {
                name: name.into(),
                data_type,
                kind: ColumnKind::Clustering,
            },
            order,
        ));
        self
    }

    pub fn regular(mut self, name: impl Into<String>, data_type: DataType) -> Self {
        self.others.push(ColumnDef {
            name: name.into(),
            data_type,
            kind: ColumnKind::Regular,
        });
        self
    }

    pub fn static_column(mut self, name: impl Into<String>, data_type: DataType) -> Self {
        self.others.push(ColumnDef {
            name: name.into(),
            data_type,
            kind: ColumnKind::Static,
        });
        self
    }

    pub fn comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = comment.into();
        self
    }

    pub fn default_ttl(mut self, ttl: Ttl) -> Self {
        self.default_ttl = Some(ttl);
        self
    }

    pub fn build(self) -> Result<BaseSchema, SchemaError> {
        if self.partition_key.is_empty() {
            return Err(SchemaError::EmptyPartitionKey);
        }

        let mut clustering_order = BTreeMap::new();
        let mut columns = self.partition_key;
        for (column, order) in self.clustering {
            clustering_order.insert(column.name.clone(), order);
            columns.push(column);
        }
        columns.extend(self.others);

        let mut seen = BTreeSet::new();
        for column in &columns {
            if !seen.insert(column.name.as_str()) {
                return Err(SchemaError::DuplicateColumn(column.name.clone()));
            }
            if column.kind.is_primary_key() && !column.data_type.can_be_key() {
                return Err(SchemaError::InvalidKeyType {
                    column: column.name.clone(),
                    data_type: column.data_type.to_string(),
                });
            }
        }

        Ok(BaseSchema {
            table_id: self.table_id,
            name: self.name,
            columns,
            clustering_order,
            comment: self.comment,
            default_ttl: self.default_ttl,
        })
    }
}

// ============================================================================
// ViewSpec
// ============================================================================

/// Whether a base write waits for its view updates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateMode {
    Synchronous,
    #[default]
    Asynchronous,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Selection {
    /// Every regular column of the base, including ones added later.
    Wildcard,
    Columns(Vec<String>),
}

/// An unvalidated `CREATE MATERIALIZED VIEW` request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewSpec {
    pub name: String,
    pub selection: Selection,
    pub filter: Vec<FilterTerm>,
    pub partition_key: Vec<String>,
    pub clustering_key: Vec<String>,
    pub clustering_order: Vec<(String, ClusteringOrder)>,
    /// `None` leaves the choice to the runtime's configured default.
    pub update_mode: Option<UpdateMode>,
}

impl ViewSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            selection: Selection::Wildcard,
            filter: Vec::new(),
            partition_key: Vec::new(),
            clustering_key: Vec::new(),
            clustering_order: Vec::new(),
            update_mode: None,
        }
    }

    pub fn with_selection<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.selection = Selection::Columns(columns.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_partition_key<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.partition_key = columns.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_clustering_key<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.clustering_key = columns.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_filter(mut self, term: FilterTerm) -> Self {
        self.filter.push(term);
        self
    }

    /// Adds `IS NOT NULL` for each column.
    pub fn with_not_null<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.filter
            .extend(columns.into_iter().map(FilterTerm::is_not_null));
        self
    }

    /// Adds `IS NOT NULL` for every view key column.
    pub fn with_key_not_null(self) -> Self {
        let keys: Vec<String> = self
            .partition_key
            .iter()
            .chain(&self.clustering_key)
            .cloned()
            .collect();
        self.with_not_null(keys)
    }

    pub fn with_order(mut self, column: impl Into<String>, order: ClusteringOrder) -> Self {
        self.clustering_order.push((column.into(), order));
        self
    }

    pub fn with_update_mode(mut self, mode: UpdateMode) -> Self {
        self.update_mode = Some(mode);
        self
    }

    fn key_columns(&self) -> impl Iterator<Item = &String> {
        self.partition_key.iter().chain(&self.clustering_key)
    }
}

// ============================================================================
// View Definition
// ============================================================================

/// A column of the view, with the kind it has in the base table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewColumn {
    pub name: String,
    pub data_type: DataType,
    pub base_kind: ColumnKind,
    /// Position within the base partition or clustering key.
    pub base_index: Option<usize>,
    pub order: ClusteringOrder,
}

/// A validated view: its key, selection, filter and update mode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewDefinition {
    name: String,
    base_table: TableId,
    base_primary_key: Vec<String>,
    partition_key: Vec<ViewColumn>,
    clustering_key: Vec<ViewColumn>,
    selected: Vec<ViewColumn>,
    unselected: Vec<String>,
    comparisons: Vec<FilterTerm>,
    regular_key_column: Option<String>,
    update_mode: UpdateMode,
    spec: ViewSpec,
}

impl ViewDefinition {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn base_table(&self) -> TableId {
        self.base_table
    }

    pub fn partition_key(&self) -> &[ViewColumn] {
        &self.partition_key
    }

    pub fn clustering_key(&self) -> &[ViewColumn] {
        &self.clustering_key
    }

    pub fn key_columns(&self) -> impl Iterator<Item = &ViewColumn> {
        self.partition_key.iter().chain(&self.clustering_key)
    }

    /// Selected columns that are not part of the view key.
    pub fn selected(&self) -> &[ViewColumn] {
        &self.selected
    }

    /// Base regular columns the view neither selects nor keys on.
    pub fn unselected(&self) -> &[String] {
        &self.unselected
    }

    /// Comparison terms of the filter (`IS NOT NULL` guards excluded).
    pub fn comparisons(&self) -> &[FilterTerm] {
        &self.comparisons
    }

    /// The base regular column promoted into the view key, if any.
    pub fn regular_key_column(&self) -> Option<&str> {
        self.regular_key_column.as_deref()
    }

    pub fn update_mode(&self) -> UpdateMode {
        self.update_mode
    }

    pub fn spec(&self) -> &ViewSpec {
        &self.spec
    }

    pub fn with_update_mode(mut self, mode: UpdateMode) -> Self {
        self.update_mode = mode;
        self.spec.update_mode = Some(mode);
        self
    }

    pub fn is_key_column(&self, column: &str) -> bool {
        self.key_columns().any(|c| c.name == column)
    }

    pub fn is_selected(&self, column: &str) -> bool {
        self.selected.iter().any(|c| c.name == column)
    }

    pub fn is_filter_column(&self, column: &str) -> bool {
        self.comparisons.iter().any(|t| t.column == column)
    }

    /// True if a change to `column` can change the view's content.
    pub fn is_relevant(&self, column: &str) -> bool {
        self.is_key_column(column) || self.is_selected(column) || self.is_filter_column(column)
    }

    /// Comparator for the view's clustering keys, honouring its own order.
    pub fn comparator(&self) -> ClusteringComparator {
        ClusteringComparator::new(self.clustering_key.iter().map(|c| c.order).collect())
    }

    /// Re-validates the view against an altered base schema.
    ///
    /// Comment and default-TTL changes and new regular columns are accepted.
    /// Dropping or retyping a column the view uses, or changing the base
    /// primary key, is rejected.
    pub fn rebind(&self, base: &BaseSchema) -> Result<ViewDefinition, ViewError> {
        if base.table_id != self.base_table {
            return Err(ViewError::TableNotFound(base.table_id));
        }

        let new_primary_key = base.primary_key();
        if new_primary_key != self.base_primary_key {
            return Err(SchemaError::IncompatibleAlteration {
                column: new_primary_key.join(", "),
                reason: format!(
                    "view '{}' depends on base primary key ({})",
                    self.name,
                    self.base_primary_key.join(", ")
                ),
            }
            .into());
        }

        let used = self
            .key_columns()
            .chain(&self.selected)
            .map(|c| (c.name.as_str(), Some((&c.data_type, c.base_kind))))
            .chain(self.comparisons.iter().map(|t| (t.column.as_str(), None)));
        for (name, expected) in used {
            let Some(column) = base.column(name) else {
                return Err(SchemaError::IncompatibleAlteration {
                    column: name.to_string(),
                    reason: format!("column is used by view '{}'", self.name),
                }
                .into());
            };
            if let Some((data_type, kind)) = expected {
                if &column.data_type != data_type || column.kind != kind {
                    return Err(SchemaError::IncompatibleAlteration {
                        column: name.to_string(),
                        reason: format!(
                            "view '{}' requires {data_type} {kind:?}, found {} {:?}",
                            self.name, column.data_type, column.kind
                        ),
                    }
                    .into());
                }
            }
        }

        project(base, &self.spec)
    }
}

// ============================================================================
// Schema Projector
// ============================================================================

/// Validates `spec` against `base` and derives the view definition.
///
/// Checks run in a fixed order so the first reported error is stable:
/// bind markers, unknown columns, static columns, key shape, `IS NOT NULL`
/// guards, remaining filter terms, and finally the clustering order clause.
pub fn project(base: &BaseSchema, spec: &ViewSpec) -> Result<ViewDefinition, ViewError> {
    // Bound parameters cannot be part of a stored view definition.
    if let Some(term) = spec.filter.iter().find(|t| t.has_bind_marker()) {
        return Err(ViewError::UnsupportedExpression(format!(
            "bind markers are not allowed in a view filter: {term}"
        )));
    }

    let selection: Vec<&String> = match &spec.selection {
        Selection::Wildcard => Vec::new(),
        Selection::Columns(columns) => columns.iter().collect(),
    };

    let referenced = selection
        .iter()
        .copied()
        .chain(spec.key_columns())
        .chain(spec.filter.iter().map(|t| &t.column));
    let mut referenced_defs = Vec::new();
    for name in referenced {
        let column = base
            .column(name)
            .ok_or_else(|| SchemaError::UnknownColumn(name.clone()))?;
        referenced_defs.push(column);
    }

    if let Some(column) = referenced_defs
        .iter()
        .find(|c| c.kind == ColumnKind::Static)
    {
        return Err(SchemaError::StaticColumn(column.name.clone()).into());
    }

    if spec.partition_key.is_empty() {
        return Err(SchemaError::EmptyPartitionKey.into());
    }
    let mut seen = BTreeSet::new();
    for name in spec.key_columns() {
        if !seen.insert(name.as_str()) {
            return Err(SchemaError::DuplicateColumn(name.clone()).into());
        }
    }
    let mut seen = BTreeSet::new();
    for name in &selection {
        if !seen.insert(name.as_str()) {
            return Err(SchemaError::DuplicateColumn((*name).clone()).into());
        }
    }

    for name in base.primary_key() {
        if !spec.key_columns().any(|k| k == name) {
            return Err(SchemaError::MissingBasePrimaryKeyColumn(name.to_string()).into());
        }
    }

    let regular_keys: Vec<String> = spec
        .key_columns()
        .filter(|name| base.column(name).is_some_and(|c| c.kind == ColumnKind::Regular))
        .cloned()
        .collect();
    if regular_keys.len() > 1 {
        return Err(SchemaError::MultipleRegularKeyColumns(regular_keys).into());
    }
    for name in &regular_keys {
        if let Some(column) = base.column(name) {
            if !column.data_type.can_be_key() {
                return Err(SchemaError::InvalidKeyType {
                    column: name.clone(),
                    data_type: column.data_type.to_string(),
                }
                .into());
            }
        }
    }

    // Every key column needs a NOT NULL guard, base primary key columns
    // included.
    for name in spec.key_columns() {
        let guarded = spec
            .filter
            .iter()
            .any(|t| &t.column == name && t.is_not_null_guard());
        if !guarded {
            return Err(SchemaError::MissingNotNull(name.clone()).into());
        }
    }

    let mut comparisons = Vec::new();
    for term in &spec.filter {
        validate_filter_term(base, spec, term)?;
        if !term.is_not_null_guard() {
            comparisons.push(term.clone());
        }
    }

    let mut ordered = BTreeSet::new();
    for (name, _) in &spec.clustering_order {
        if !spec.clustering_key.contains(name) {
            let reason = if spec.partition_key.contains(name) {
                "column is part of the view partition key"
            } else if base.column(name).is_some() {
                "column is not a clustering column of the view"
            } else {
                "column is not declared"
            };
            return Err(SchemaError::InvalidClusteringOrder {
                column: name.clone(),
                reason: reason.to_string(),
            }
            .into());
        }
        if !ordered.insert(name.as_str()) {
            return Err(SchemaError::InvalidClusteringOrder {
                column: name.clone(),
                reason: "order specified more than once".to_string(),
            }
            .into());
        }
    }

    let view_column = |name: &String| -> Result<ViewColumn, ViewError> {
        let column = base
            .column(name)
            .ok_or_else(|| SchemaError::UnknownColumn(name.clone()))?;
        let explicit = spec
            .clustering_order
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, order)| *order);
        let base_index = match column.kind {
            ColumnKind::PartitionKey => base.partition_key().position(|c| &c.name == name),
            ColumnKind::Clustering => base.clustering_key().position(|c| &c.name == name),
            ColumnKind::Regular | ColumnKind::Static => None,
        };
        Ok(ViewColumn {
            name: name.clone(),
            data_type: column.data_type.clone(),
            base_kind: column.kind,
            base_index,
            order: explicit
                .or_else(|| base.clustering_order(name))
                .unwrap_or_default(),
        })
    };

    let partition_key = spec
        .partition_key
        .iter()
        .map(view_column)
        .collect::<Result<Vec<_>, _>>()?;
    let clustering_key = spec
        .clustering_key
        .iter()
        .map(view_column)
        .collect::<Result<Vec<_>, _>>()?;

    let is_key = |name: &str| spec.key_columns().any(|k| k == name);
    let selected_names: Vec<String> = match &spec.selection {
        Selection::Wildcard => base.regular_columns().map(|c| c.name.clone()).collect(),
        Selection::Columns(columns) => columns
            .iter()
            .filter(|name| base.column(name).is_some_and(|c| c.kind == ColumnKind::Regular))
            .cloned()
            .collect(),
    };
    let selected = base
        .regular_columns()
        .filter(|c| selected_names.contains(&c.name) && !is_key(&c.name))
        .map(|c| view_column(&c.name))
        .collect::<Result<Vec<_>, _>>()?;
    let unselected = base
        .regular_columns()
        .filter(|c| !selected_names.contains(&c.name) && !is_key(&c.name))
        .map(|c| c.name.clone())
        .collect();

    Ok(ViewDefinition {
        name: spec.name.clone(),
        base_table: base.table_id,
        base_primary_key: base.primary_key().into_iter().map(String::from).collect(),
        partition_key,
        clustering_key,
        selected,
        unselected,
        comparisons,
        regular_key_column: regular_keys.into_iter().next(),
        update_mode: spec.update_mode.unwrap_or_default(),
        spec: spec.clone(),
    })
}

fn validate_filter_term(
    base: &BaseSchema,
    spec: &ViewSpec,
    term: &FilterTerm,
) -> Result<(), ViewError> {
    match (&term.op, &term.operand) {
        (FilterOp::IsNot, Operand::Null) => {
            if !spec.key_columns().any(|k| k == &term.column) {
                return Err(ViewError::UnsupportedExpression(format!(
                    "'{term}' is only supported on view primary key columns"
                )));
            }
            Ok(())
        }
        (FilterOp::IsNot, _) => Err(ViewError::UnsupportedExpression(format!(
            "'{term}': IS NOT only supports NULL"
        ))),
        (_, Operand::Null) => Err(ViewError::UnsupportedExpression(format!(
            "'{term}': cannot compare a column with NULL"
        ))),
        (_, Operand::Literal(literal)) => {
            let Some(column) = base.column(&term.column) else {
                return Err(SchemaError::UnknownColumn(term.column.clone()).into());
            };
            if !spec.key_columns().any(|k| k == &term.column) {
                return Err(ViewError::UnsupportedExpression(format!(
                    "'{term}': only view primary key columns can be restricted"
                )));
            }
            if !column.data_type.can_be_key() {
                return Err(ViewError::UnsupportedExpression(format!(
                    "'{term}': {} columns cannot be filtered",
                    column.data_type
                )));
            }
            let integer_widths = matches!(column.data_type, DataType::Int | DataType::BigInt)
                && literal.as_bigint().is_some();
            if !literal.is_compatible_with(&column.data_type) && !integer_widths {
                return Err(ViewError::UnsupportedExpression(format!(
                    "'{term}': literal does not match column type {}",
                    column.data_type
                )));
            }
            Ok(())
        }
        (_, Operand::Bind(_)) => Err(ViewError::UnsupportedExpression(format!(
            "bind markers are not allowed in a view filter: {term}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;
    use test_case::test_case;

    fn base() -> BaseSchema {
        BaseSchema::builder(TableId::new(1), "t")
            .partition_key("p", DataType::Int)
            .clustering("c", DataType::Int, ClusteringOrder::Desc)
            .clustering("d", DataType::Int, ClusteringOrder::Asc)
            .regular("v", DataType::Text)
            .regular("w", DataType::Int)
            .regular("li", DataType::List(Box::new(DataType::Int)))
            .static_column("s", DataType::Int)
            .build()
            .expect("valid base schema")
    }

    fn spec_by_v() -> ViewSpec {
        ViewSpec::new("mv")
            .with_partition_key(["v"])
            .with_clustering_key(["p", "c", "d"])
            .with_key_not_null()
    }

    #[test]
    fn wildcard_selects_regular_columns_but_not_statics() {
        let view = project(&base(), &spec_by_v()).expect("view should project");
        let selected: Vec<&str> = view.selected().iter().map(|c| c.name.as_str()).collect();
        assert_eq!(selected, vec!["w", "li"]);
        assert_eq!(view.regular_key_column(), Some("v"));
        assert!(view.unselected().is_empty());
    }

    #[test]
    fn explicit_selection_leaves_the_rest_unselected() {
        let spec = spec_by_v().with_selection(["v", "p", "c", "d", "w"]);
        let view = project(&base(), &spec).expect("view should project");
        assert!(view.is_selected("w"));
        assert!(!view.is_selected("li"));
        assert_eq!(view.unselected(), ["li".to_string()]);
    }

    #[test_case(spec_by_v().with_selection(["s"]), SchemaError::StaticColumn("s".into()); "static in selection")]
    #[test_case(
        ViewSpec::new("mv").with_partition_key(["s"]).with_clustering_key(["p", "c", "d"]).with_key_not_null(),
        SchemaError::StaticColumn("s".into());
        "static in key"
    )]
    #[test_case(
        ViewSpec::new("mv").with_partition_key(["v"]).with_clustering_key(["p", "c", "d"]).with_not_null(["v", "p", "c"]),
        SchemaError::MissingNotNull("d".into());
        "missing not null on base clustering column"
    )]
    #[test_case(
        ViewSpec::new("mv").with_partition_key(["v"]).with_clustering_key(["p", "c"]).with_key_not_null(),
        SchemaError::MissingBasePrimaryKeyColumn("d".into());
        "base key column missing"
    )]
    #[test_case(
        ViewSpec::new("mv").with_partition_key(["v"]).with_clustering_key(["w", "p", "c", "d"]).with_key_not_null(),
        SchemaError::MultipleRegularKeyColumns(vec!["v".into(), "w".into()]);
        "two regular key columns"
    )]
    #[test_case(spec_by_v().with_selection(["nope"]), SchemaError::UnknownColumn("nope".into()); "unknown column")]
    #[test_case(
        spec_by_v().with_order("v", ClusteringOrder::Desc),
        SchemaError::InvalidClusteringOrder { column: "v".into(), reason: "column is part of the view partition key".into() };
        "order on partition key"
    )]
    #[test_case(
        spec_by_v().with_order("w", ClusteringOrder::Desc),
        SchemaError::InvalidClusteringOrder { column: "w".into(), reason: "column is not a clustering column of the view".into() };
        "order on non key column"
    )]
    #[test_case(
        spec_by_v().with_order("zz", ClusteringOrder::Desc),
        SchemaError::InvalidClusteringOrder { column: "zz".into(), reason: "column is not declared".into() };
        "order on undeclared column"
    )]
    fn rejected_view_specs(spec: ViewSpec, expected: SchemaError) {
        assert_eq!(project(&base(), &spec), Err(ViewError::Schema(expected)));
    }

    #[test]
    fn bind_markers_are_rejected_before_anything_else() {
        // The selection also names a static column; the bind marker wins.
        let spec = spec_by_v()
            .with_selection(["s"])
            .with_filter(FilterTerm::new("w", FilterOp::Eq, Operand::Bind(None)));
        assert!(matches!(
            project(&base(), &spec),
            Err(ViewError::UnsupportedExpression(_))
        ));
    }

    #[test_case(FilterTerm::compare("w", FilterOp::IsNot, 42); "is not a value")]
    #[test_case(FilterTerm::is_not_null("w"); "is not null on non key column")]
    #[test_case(FilterTerm::new("w", FilterOp::Eq, Operand::Null); "equals null")]
    #[test_case(FilterTerm::eq("c", "text"); "type mismatch")]
    #[test_case(FilterTerm::eq("w", 3); "restriction on non key column")]
    #[test_case(FilterTerm::eq("li", Value::List(vec![])); "filter on list")]
    fn unsupported_filter_terms_are_errors(term: FilterTerm) {
        let spec = spec_by_v().with_filter(term);
        assert!(matches!(
            project(&base(), &spec),
            Err(ViewError::UnsupportedExpression(_))
        ));
    }

    #[test]
    fn comparison_filters_are_kept() {
        let spec = spec_by_v().with_filter(FilterTerm::compare("c", FilterOp::Gte, 10));
        let view = project(&base(), &spec).expect("view should project");
        assert_eq!(view.comparisons().len(), 1);
        assert!(view.is_filter_column("c"));
        assert!(!view.is_relevant("li") || view.is_selected("li"));
    }

    #[test]
    fn clustering_order_defaults_to_base_order_and_accepts_a_subset() {
        let inherited = project(&base(), &spec_by_v()).expect("view should project");
        let orders: Vec<ClusteringOrder> =
            inherited.clustering_key().iter().map(|c| c.order).collect();
        assert_eq!(
            orders,
            vec![
                ClusteringOrder::Asc,
                ClusteringOrder::Desc,
                ClusteringOrder::Asc
            ]
        );

        let partial = spec_by_v().with_order("c", ClusteringOrder::Asc);
        let view = project(&base(), &partial).expect("view should project");
        let orders: Vec<ClusteringOrder> = view.clustering_key().iter().map(|c| c.order).collect();
        assert_eq!(
            orders,
            vec![
                ClusteringOrder::Asc,
                ClusteringOrder::Asc,
                ClusteringOrder::Asc
            ]
        );
    }

    #[test]
    fn rebind_accepts_comment_and_new_columns() {
        let spec = ViewSpec::new("mv")
            .with_partition_key(["p"])
            .with_clustering_key(["c", "d"])
            .with_key_not_null();
        let view = project(&base(), &spec).expect("view should project");
        let altered = base()
            .with_comment("renamed")
            .with_regular_column("extra", DataType::BigInt)
            .expect("column is new");

        let rebound = view.rebind(&altered).expect("alteration is compatible");
        assert!(rebound.is_selected("extra"));
    }

    #[test]
    fn rebind_rejects_dropping_a_used_column() {
        let view = project(&base(), &spec_by_v()).expect("view should project");
        let altered = base().without_column("v").expect("v is a regular column");

        assert!(matches!(
            view.rebind(&altered),
            Err(ViewError::Schema(SchemaError::IncompatibleAlteration { .. }))
        ));
    }

    #[test]
    fn rebind_rejects_retyping_a_used_column() {
        let view = project(&base(), &spec_by_v()).expect("view should project");
        let altered = base()
            .without_column("w")
            .and_then(|b| b.with_regular_column("w", DataType::Text))
            .expect("alteration builds");

        assert!(matches!(
            view.rebind(&altered),
            Err(ViewError::Schema(SchemaError::IncompatibleAlteration { .. }))
        ));
    }

    #[test]
    fn builder_rejects_duplicates_and_empty_partition_keys() {
        let duplicate = BaseSchema::builder(TableId::new(1), "t")
            .partition_key("p", DataType::Int)
            .regular("p", DataType::Int)
            .build();
        assert_eq!(duplicate, Err(SchemaError::DuplicateColumn("p".into())));

        let empty = BaseSchema::builder(TableId::new(1), "t")
            .regular("v", DataType::Int)
            .build();
        assert_eq!(empty, Err(SchemaError::EmptyPartitionKey));
    }
}
