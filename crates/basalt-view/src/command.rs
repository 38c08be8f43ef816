//! Catalog commands applied by the kernel.

use basalt_types::{TableId, ViewId};
use serde::{Deserialize, Serialize};

use crate::schema::{BaseSchema, UpdateMode, ViewSpec};

/// A catalog change submitted to [`crate::kernel::apply_committed`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Command {
    // ========================================================================
    // Base Table Commands
    // ========================================================================
    /// Registers a base table under `schema.table_id`.
    CreateTable { schema: BaseSchema },

    /// Replaces a base table's schema. Every view of the table must accept
    /// the new schema or nothing changes.
    AlterTable { schema: BaseSchema },

    /// Removes a base table. Rejected while views depend on it.
    DropTable { table_id: TableId },

    // ========================================================================
    // View Commands
    // ========================================================================
    /// Validates `spec` against the base table and registers the view.
    CreateView {
        view_id: ViewId,
        base_table: TableId,
        spec: ViewSpec,
    },

    /// Switches a view between synchronous and asynchronous updates.
    AlterViewMode { view_id: ViewId, mode: UpdateMode },

    /// Removes a view and stops its build.
    DropView { view_id: ViewId },
}

impl Command {
    pub fn create_table(schema: BaseSchema) -> Self {
        Command::CreateTable { schema }
    }

    pub fn create_view(view_id: ViewId, base_table: TableId, spec: ViewSpec) -> Self {
        Command::CreateView {
            view_id,
            base_table,
            spec,
        }
    }
}
