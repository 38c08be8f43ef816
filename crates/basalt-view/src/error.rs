//! Error taxonomy for view maintenance.
//!
//! Every error here is surfaced synchronously to the caller that caused it.
//! Nothing in this crate retries; retry policy belongs to the runtime.

use basalt_types::{TableId, ViewId};
use thiserror::Error;

/// Errors produced while validating or applying a view definition.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchemaError {
    #[error("static column '{0}' cannot be used in a materialized view")]
    StaticColumn(String),

    #[error("primary key column '{0}' is not restricted with 'IS NOT NULL'")]
    MissingNotNull(String),

    #[error("invalid clustering order for '{column}': {reason}")]
    InvalidClusteringOrder { column: String, reason: String },

    #[error("undefined column name '{0}'")]
    UnknownColumn(String),

    #[error("view primary key must include base primary key column '{0}'")]
    MissingBasePrimaryKeyColumn(String),

    #[error("cannot include more than one non-primary key column in view primary key: {0:?}")]
    MultipleRegularKeyColumns(Vec<String>),

    #[error("duplicate column '{0}'")]
    DuplicateColumn(String),

    #[error("column '{column}' of type {data_type} cannot be part of a primary key")]
    InvalidKeyType { column: String, data_type: String },

    #[error("a partition key must contain at least one column")]
    EmptyPartitionKey,

    #[error("cannot alter column '{column}': {reason}")]
    IncompatibleAlteration { column: String, reason: String },
}

/// Top-level error for the view engine.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ViewError {
    #[error(transparent)]
    Schema(#[from] SchemaError),

    #[error("unsupported expression: {0}")]
    UnsupportedExpression(String),

    #[error("invalid bind value: {0}")]
    InvalidBind(String),

    #[error("key component '{column}' is {size} bytes, larger than the {limit} byte limit")]
    OversizedKey {
        column: String,
        size: usize,
        limit: usize,
    },

    #[error("table with id {0} not found")]
    TableNotFound(TableId),

    #[error("view with id {0} not found")]
    ViewNotFound(ViewId),

    #[error("table '{0}' already exists")]
    TableAlreadyExists(String),

    #[error("view '{0}' already exists")]
    ViewAlreadyExists(String),

    #[error("table {table_id} still has materialized views: {views:?}")]
    TableHasViews { table_id: TableId, views: Vec<String> },
}
