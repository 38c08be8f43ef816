//! Effects produced by the kernel and the view builder.
//!
//! Effects represent side effects that the runtime must execute after a
//! command is applied or a build step runs. The core is pure - it produces
//! effects but never executes them directly.

use basalt_types::{TableId, ViewId};
use serde::{Deserialize, Serialize};

use crate::builder::BuildProgress;
use crate::mutation::ViewMutation;
use crate::row::PartitionKey;
use crate::schema::BaseSchema;
use crate::state::ViewMetadata;

/// An effect to be executed by the runtime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Effect {
    // ========================================================================
    // Catalog Effects
    // ========================================================================
    /// Persist base table metadata after CREATE TABLE or ALTER TABLE.
    TableMetadataWrite(BaseSchema),

    /// Remove base table metadata and data after DROP TABLE.
    TableMetadataDrop(TableId),

    /// Persist view metadata after CREATE VIEW, an update-mode change, or a
    /// base schema alteration that rebound the view.
    ViewMetadataWrite(ViewMetadata),

    /// Remove view metadata and every row of the view after DROP VIEW.
    ViewMetadataDrop(ViewId),

    // ========================================================================
    // Build Effects
    // ========================================================================
    /// Start backfilling a newly created view.
    StartViewBuild(ViewId),

    /// Stop future build steps of a view. A step already running finishes
    /// and its output is discarded.
    CancelViewBuild(ViewId),

    /// Persist a checkpoint of a suspended partition scan.
    PersistBuildProgress(BuildProgress),

    /// A partition is fully built; its checkpoint is no longer needed.
    ClearBuildProgress {
        view_id: ViewId,
        partition_key: PartitionKey,
    },

    /// Every base partition has been scanned.
    MarkViewBuilt(ViewId),

    // ========================================================================
    // View Data Effects
    // ========================================================================
    /// Apply mutations to a view table, in order.
    ApplyViewMutations {
        view_id: ViewId,
        mutations: Vec<ViewMutation>,
    },
}
