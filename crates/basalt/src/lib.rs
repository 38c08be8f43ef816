//! # Basalt
//!
//! Materialized view maintenance for a wide-column store.
//!
//! Basalt keeps derived tables ("views") consistent with the base tables
//! they are keyed from. Every base write is diffed against the row it
//! replaces and turned into view inserts, updates and deletes; new views
//! are backfilled from existing data in bounded, resumable steps.
//!
//! - **Pure core** - `basalt-view` decides what a view must contain
//! - **Imperative shell** - this crate stores rows and executes effects
//! - **Synchronous or asynchronous** - per view, switchable at runtime
//! - **Resumable builds** - checkpoints survive restarts
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                           Basalt                             │
//! │  ┌─────────┐   ┌─────────────┐   ┌─────────┐   ┌──────────┐  │
//! │  │  Base   │ → │  Propagate  │ → │  Queue  │ → │   View   │  │
//! │  │ (write) │   │ (pure diff) │   │ (async) │   │ (tables) │  │
//! │  └─────────┘   └─────────────┘   └─────────┘   └──────────┘  │
//! │        └────────→  View Builder (resumable) ──────→┘          │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Quick Start
//!
//! ```ignore
//! use basalt::{Basalt, ReadOptions};
//! use basalt_config::BasaltConfig;
//!
//! let db = Basalt::open(&BasaltConfig::load()?)?;
//! db.create_table(schema)?;
//! db.create_view("users", ViewSpec::new("users_by_email")
//!     .with_partition_key(["email"])
//!     .with_clustering_key(["id"])
//!     .with_key_not_null())?;
//!
//! db.insert("users", [("id", Value::Int(1)), ("email", Value::from("a@b.c"))])?;
//! db.process_queue()?;
//! let rows = db.scan_view("users_by_email", ReadOptions::default())?;
//! ```
//!
//! # Modules
//!
//! - **API**: [`Basalt`], [`WriteOptions`], [`ReadOptions`]
//! - **Storage**: [`BaseTable`], [`ViewTable`], build bookkeeping
//! - **Background**: [`PropagationQueue`], and with the `broadcast` feature
//!   `ViewWorker` and `ViewEvents`

mod database;
mod error;
mod events;
mod progress;
mod queue;
mod store;
mod telemetry;
#[cfg(feature = "broadcast")]
mod worker;

// API
pub use database::{Basalt, BuildReport, WriteOptions};
pub use error::{BasaltError, Result};
pub use events::ViewEvent;
pub use telemetry::init_tracing;

// Storage
pub use progress::{BuildProgressStore, BuiltViews};
pub use store::{BaseTable, BaseWrite, ReadOptions, Row, StagedRows, StagedWrite, ViewTable};

// Background maintenance
pub use queue::{PendingUpdate, PropagationQueue, PushResult};

#[cfg(feature = "broadcast")]
pub use events::ViewEvents;
#[cfg(feature = "broadcast")]
pub use worker::ViewWorker;

// Re-export the view engine's vocabulary
pub use basalt_types::{Expiry, MAX_KEY_COMPONENT_SIZE, TableId, Timestamp, Ttl, ViewId};
pub use basalt_view::{
    BaseRowState, BaseSchema, Bound, BoundValue, BuildStats, Cell, ClusteringKey,
    ClusteringOrder, Command, DataType, FilterOp, FilterTerm, Operand, PartitionKey,
    RangeTombstone, RowMarker, SchemaError, SelectStatement, State, Term, UpdateMode,
    UpdateStatement, Value, ViewError, ViewKey, ViewSpec,
};
