//! The kernel - pure functional core of the `Basalt` catalog.
//!
//! The kernel applies committed catalog commands to produce a new state and
//! effects. It is completely pure: no IO, no clocks, no randomness.
//!
//! # Example
//!
//! ```ignore
//! let state = State::new();
//! let cmd = Command::create_table(schema);
//!
//! let (new_state, effects) = apply_committed(state, cmd)?;
//! // Runtime executes effects...
//! ```

use tracing::debug;

use crate::command::Command;
use crate::effects::Effect;
use crate::error::{SchemaError, ViewError};
use crate::schema::project;
use crate::state::{State, ViewMetadata};

/// Applies a committed command to the state, producing new state and effects.
///
/// A rejected command returns the error and nothing else: the caller keeps
/// its previous state, so a failed `CreateView` never leaves a
/// half-registered view behind.
pub fn apply_committed(state: State, cmd: Command) -> Result<(State, Vec<Effect>), ViewError> {
    let mut effects = Vec::new();

    match cmd {
        // ====================================================================
        // Base Table Commands
        // ====================================================================
        Command::CreateTable { schema } => {
            let table_id = schema.table_id;

            // Precondition: ID and name are unused
            if state.table_exists(&table_id) || state.name_in_use(&schema.name) {
                return Err(ViewError::TableAlreadyExists(schema.name));
            }

            effects.push(Effect::TableMetadataWrite(schema.clone()));
            let new_state = state.with_table(schema);

            // Postcondition: table now exists
            debug_assert!(new_state.table_exists(&table_id));

            Ok((new_state, effects))
        }

        Command::AlterTable { schema } => {
            let table_id = schema.table_id;

            // Precondition: table must exist
            let current = state
                .get_table(&table_id)
                .ok_or(ViewError::TableNotFound(table_id))?;
            if current.name != schema.name {
                return Err(SchemaError::IncompatibleAlteration {
                    column: schema.name,
                    reason: "tables cannot be renamed".to_string(),
                }
                .into());
            }

            // Every view must accept the new schema before anything changes.
            let rebound = state
                .views_of(table_id)
                .map(|view| {
                    view.definition.rebind(&schema).map(|definition| ViewMetadata {
                        definition,
                        ..view.clone()
                    })
                })
                .collect::<Result<Vec<_>, _>>()?;

            debug!(table_id = %table_id, views = rebound.len(), "altering base table");

            effects.push(Effect::TableMetadataWrite(schema.clone()));
            let mut new_state = state.with_table(schema);
            for view in rebound {
                effects.push(Effect::ViewMetadataWrite(view.clone()));
                new_state = new_state.with_view(view);
            }

            // Postcondition: one table write plus one write per view
            debug_assert_eq!(effects.len(), 1 + new_state.views_of(table_id).count());

            Ok((new_state, effects))
        }

        Command::DropTable { table_id } => {
            // Precondition: table must exist
            if !state.table_exists(&table_id) {
                return Err(ViewError::TableNotFound(table_id));
            }

            // Precondition: no view depends on it
            let views: Vec<String> = state
                .views_of(table_id)
                .map(|v| v.definition.name().to_string())
                .collect();
            if !views.is_empty() {
                return Err(ViewError::TableHasViews { table_id, views });
            }

            effects.push(Effect::TableMetadataDrop(table_id));
            let new_state = state.without_table(table_id);

            // Postcondition: table no longer exists
            debug_assert!(!new_state.table_exists(&table_id));

            Ok((new_state, effects))
        }

        // ====================================================================
        // View Commands
        // ====================================================================
        Command::CreateView {
            view_id,
            base_table,
            spec,
        } => {
            // Precondition: base table must exist
            let base = state
                .get_table(&base_table)
                .ok_or(ViewError::TableNotFound(base_table))?;

            // Precondition: ID and name are unused
            if state.view_exists(&view_id) || state.name_in_use(&spec.name) {
                return Err(ViewError::ViewAlreadyExists(spec.name));
            }

            // Validation happens before any effect exists.
            let definition = project(base, &spec)?;
            let meta = ViewMetadata {
                view_id,
                base_table,
                definition,
            };

            effects.push(Effect::ViewMetadataWrite(meta.clone()));
            effects.push(Effect::StartViewBuild(view_id));

            // Postcondition: metadata write precedes the build
            debug_assert_eq!(effects.len(), 2);

            let new_state = state.with_view(meta);
            debug_assert!(new_state.view_exists(&view_id));

            Ok((new_state, effects))
        }

        Command::AlterViewMode { view_id, mode } => {
            // Precondition: view must exist
            let meta = state
                .get_view(&view_id)
                .ok_or(ViewError::ViewNotFound(view_id))?
                .clone();

            let meta = ViewMetadata {
                definition: meta.definition.with_update_mode(mode),
                ..meta
            };
            effects.push(Effect::ViewMetadataWrite(meta.clone()));
            let new_state = state.with_view(meta);

            // Postcondition: mode is applied
            debug_assert_eq!(
                new_state
                    .get_view(&view_id)
                    .map(|v| v.definition.update_mode()),
                Some(mode)
            );

            Ok((new_state, effects))
        }

        Command::DropView { view_id } => {
            // Precondition: view must exist
            if !state.view_exists(&view_id) {
                return Err(ViewError::ViewNotFound(view_id));
            }

            // Cancel first so no build step writes after the drop.
            effects.push(Effect::CancelViewBuild(view_id));
            effects.push(Effect::ViewMetadataDrop(view_id));

            let new_state = state.without_view(view_id);

            // Postcondition: view no longer exists
            debug_assert!(!new_state.view_exists(&view_id));

            Ok((new_state, effects))
        }
    }
}

/// Applies commands in order, all or nothing.
///
/// On the first error the original state is discarded along with the
/// partial progress; callers keep their own copy if they need it.
pub fn apply_committed_batch(
    state: State,
    commands: impl IntoIterator<Item = Command>,
) -> Result<(State, Vec<Effect>), ViewError> {
    let mut state = state;
    let mut effects = Vec::new();
    for cmd in commands {
        let (next, produced) = apply_committed(state, cmd)?;
        state = next;
        effects.extend(produced);
    }
    Ok((state, effects))
}
