//! # basalt-view: Functional core of `Basalt` materialized views
//!
//! This crate decides what a view must contain. It receives base schemas,
//! view definitions and base row transitions, and produces view mutations
//! and catalog effects for the runtime to execute.
//!
//! ## Key Principles
//!
//! - **No IO**: Nothing here touches disk, network, or any external resource
//! - **No clocks**: The caller passes `now` and write timestamps in
//! - **No randomness**: Same input always produces same output
//! - **Pure functions**: `propagate(view, before, after) -> mutations`
//!
//! ## Architecture
//!
//! - [`schema`]: Schema Projector (`project`, `ViewDefinition::rebind`)
//! - [`liveness`]: Liveness Resolver (`resolve`, `view_row_is_live`)
//! - [`propagate`]: Update Propagator (`propagate`, `propagate_update`)
//! - [`skip`]: Skip Optimizer (`can_skip`)
//! - [`builder`]: View Builder (`ViewBuildTask`, `BaseScan`, `BuildProgress`)
//! - [`unset`]: Unset-Marker Policy (`normalize_update`, `normalize_select`)
//! - [`view_row`]: How view mutations fold into stored view rows
//! - [`kernel`]: The catalog `apply_committed` state machine
//!
//! ## Example
//!
//! ```ignore
//! use basalt_view::{project, propagate};
//!
//! let view = project(&base_schema, &view_spec)?;
//! let mutations = propagate(&view, before.as_ref(), after.as_ref(), write_ts, now);
//! // Runtime applies mutations to the view table...
//! ```

pub mod builder;
pub mod command;
pub mod effects;
pub mod error;
pub mod filter;
pub mod kernel;
pub mod liveness;
pub mod mutation;
pub mod propagate;
pub mod row;
pub mod schema;
pub mod skip;
pub mod state;
pub mod tombstone;
pub mod unset;
pub mod value;
pub mod view_row;

#[cfg(test)]
mod tests;

// Re-export commonly used items
pub use builder::{BaseScan, BuildProgress, BuildStats, ScanFragment, ViewBuildTask};
pub use command::Command;
pub use effects::Effect;
pub use error::{SchemaError, ViewError};
pub use filter::{FilterOp, FilterTerm, Operand};
pub use kernel::{apply_committed, apply_committed_batch};
pub use liveness::{LivenessInfo, ResolvedRow, resolve, view_row_is_live};
pub use mutation::{BaseChange, PartitionUpdate, RowDiff, ViewKey, ViewMutation, ViewRow};
pub use propagate::{propagate, propagate_diff, propagate_update};
pub use row::{BaseRowState, Cell, ClusteringKey, PartitionKey, RowMarker};
pub use schema::{
    BaseSchema, ClusteringOrder, ColumnDef, ColumnKind, Selection, UpdateMode, ViewDefinition,
    ViewSpec, project,
};
pub use skip::can_skip;
pub use state::{State, ViewMetadata};
pub use tombstone::{Bound, ClusteringComparator, RangeDeletionContext, RangeTombstone};
pub use unset::{
    Assignment, BoundValue, ColumnOp, Expr, NormalizedSelect, NormalizedUpdate, SelectStatement,
    Term, UpdateStatement, normalize_select, normalize_update,
};
pub use value::{DataType, Value};
pub use view_row::ViewRowState;
