//! Unit tests for basalt-view
//!
//! Everything here is pure (no IO), so every code path can be tested
//! without mocks.

use basalt_types::{Expiry, TableId, Timestamp, Ttl, ViewId};

use crate::command::Command;
use crate::effects::Effect;
use crate::error::{SchemaError, ViewError};
use crate::kernel::{apply_committed, apply_committed_batch};
use crate::liveness::{resolve, view_row_is_live};
use crate::mutation::{BaseChange, PartitionUpdate, RowDiff, ViewKey, ViewMutation};
use crate::propagate::{propagate, propagate_update};
use crate::row::{BaseRowState, Cell, ClusteringKey, PartitionKey, RowMarker};
use crate::schema::{BaseSchema, ClusteringOrder, UpdateMode, ViewDefinition, ViewSpec, project};
use crate::state::State;
use crate::value::{DataType, Value};
use crate::view_row::ViewRowState;

// ============================================================================
// Test Helpers
// ============================================================================

fn ts(micros: i64) -> Timestamp {
    Timestamp::from_micros(micros)
}

fn now() -> Timestamp {
    ts(1_000)
}

fn test_table_id() -> TableId {
    TableId::new(1)
}

/// `t (p int, c int, v text, w int, u int, PRIMARY KEY (p, c))`
fn test_base() -> BaseSchema {
    BaseSchema::builder(test_table_id(), "t")
        .partition_key("p", DataType::Int)
        .clustering("c", DataType::Int, ClusteringOrder::Asc)
        .regular("v", DataType::Text)
        .regular("w", DataType::Int)
        .regular("u", DataType::Int)
        .build()
        .expect("valid schema")
}

/// View keyed by the base regular column `v`.
fn by_v_spec() -> ViewSpec {
    ViewSpec::new("by_v")
        .with_selection(["w"])
        .with_partition_key(["v"])
        .with_clustering_key(["p", "c"])
        .with_key_not_null()
}

/// View with the base key, selecting only `w`.
fn mirror_spec() -> ViewSpec {
    ViewSpec::new("mirror")
        .with_selection(["w"])
        .with_partition_key(["p"])
        .with_clustering_key(["c"])
        .with_key_not_null()
}

fn by_v() -> ViewDefinition {
    project(&test_base(), &by_v_spec()).expect("view should project")
}

fn mirror() -> ViewDefinition {
    project(&test_base(), &mirror_spec()).expect("view should project")
}

fn row(p: i32, c: i32) -> BaseRowState {
    BaseRowState::new(
        PartitionKey::new(vec![Value::Int(p)]),
        ClusteringKey::new(vec![Value::Int(c)]),
    )
}

fn inserted_row(p: i32, c: i32, at: i64) -> BaseRowState {
    row(p, c).with_marker(RowMarker::new(ts(at)))
}

fn state_with_test_table() -> State {
    let (state, _) = apply_committed(State::new(), Command::create_table(test_base()))
        .expect("failed to create test table");
    state
}

fn state_with_test_view() -> State {
    let (state, _) = apply_committed(
        state_with_test_table(),
        Command::create_view(ViewId::new(1), test_table_id(), by_v_spec()),
    )
    .expect("failed to create test view");
    state
}

// ============================================================================
// Catalog Kernel Tests
// ============================================================================

#[test]
fn create_table_on_empty_state_succeeds() {
    let (state, effects) =
        apply_committed(State::new(), Command::create_table(test_base())).expect("table created");

    assert!(state.table_exists(&test_table_id()));
    assert_eq!(state.next_table_id(), TableId::new(2));
    assert_eq!(effects, vec![Effect::TableMetadataWrite(test_base())]);
}

#[test]
fn create_duplicate_table_fails() {
    let result = apply_committed(state_with_test_table(), Command::create_table(test_base()));
    assert!(matches!(result, Err(ViewError::TableAlreadyExists(name)) if name == "t"));
}

#[test]
fn create_view_writes_metadata_then_starts_build() {
    let (state, effects) = apply_committed(
        state_with_test_table(),
        Command::create_view(ViewId::new(1), test_table_id(), by_v_spec()),
    )
    .expect("view created");

    assert!(state.view_exists(&ViewId::new(1)));
    assert_eq!(effects.len(), 2);
    assert!(matches!(&effects[0], Effect::ViewMetadataWrite(meta) if meta.definition == by_v()));
    assert_eq!(effects[1], Effect::StartViewBuild(ViewId::new(1)));
}

#[test]
fn rejected_view_leaves_no_trace() {
    let state = state_with_test_table();
    let bad = ViewSpec::new("bad")
        .with_partition_key(["v"])
        .with_clustering_key(["p", "c"]);

    let result = apply_committed(
        state.clone(),
        Command::create_view(ViewId::new(1), test_table_id(), bad),
    );

    assert_eq!(
        result.unwrap_err(),
        ViewError::Schema(SchemaError::MissingNotNull("v".to_string()))
    );
    assert_eq!(state.view_count(), 0);
    assert!(state.view_by_name("bad").is_none());
}

#[test]
fn view_name_cannot_shadow_a_table() {
    let spec = ViewSpec {
        name: "t".to_string(),
        ..by_v_spec()
    };
    let result = apply_committed(
        state_with_test_table(),
        Command::create_view(ViewId::new(1), test_table_id(), spec),
    );
    assert!(matches!(result, Err(ViewError::ViewAlreadyExists(_))));
}

#[test]
fn drop_table_with_views_is_rejected() {
    let result = apply_committed(
        state_with_test_view(),
        Command::DropTable {
            table_id: test_table_id(),
        },
    );
    assert_eq!(
        result.unwrap_err(),
        ViewError::TableHasViews {
            table_id: test_table_id(),
            views: vec!["by_v".to_string()],
        }
    );
}

#[test]
fn drop_view_cancels_build_before_dropping() {
    let (state, effects) = apply_committed(
        state_with_test_view(),
        Command::DropView {
            view_id: ViewId::new(1),
        },
    )
    .expect("view dropped");

    assert!(!state.view_exists(&ViewId::new(1)));
    assert_eq!(
        effects,
        vec![
            Effect::CancelViewBuild(ViewId::new(1)),
            Effect::ViewMetadataDrop(ViewId::new(1)),
        ]
    );

    let (state, _) = apply_committed(
        state,
        Command::DropTable {
            table_id: test_table_id(),
        },
    )
    .expect("table without views can be dropped");
    assert_eq!(state.table_count(), 0);
}

#[test]
fn alter_view_mode_rewrites_metadata() {
    let (state, effects) = apply_committed(
        state_with_test_view(),
        Command::AlterViewMode {
            view_id: ViewId::new(1),
            mode: UpdateMode::Synchronous,
        },
    )
    .expect("mode altered");

    let meta = state.get_view(&ViewId::new(1)).expect("view exists");
    assert_eq!(meta.definition.update_mode(), UpdateMode::Synchronous);
    assert_eq!(effects, vec![Effect::ViewMetadataWrite(meta.clone())]);
}

#[test]
fn comment_change_rebinds_views() {
    let altered = test_base().with_comment("now with a comment");
    let (state, effects) =
        apply_committed(state_with_test_view(), Command::AlterTable { schema: altered.clone() })
            .expect("comment change accepted");

    assert_eq!(state.get_table(&test_table_id()), Some(&altered));
    assert_eq!(effects.len(), 2);
    assert_eq!(
        state.get_view(&ViewId::new(1)).map(|v| &v.definition),
        Some(&by_v())
    );
}

#[test]
fn dropping_a_column_the_view_uses_is_rejected_atomically() {
    let state = state_with_test_view();
    let altered = test_base().without_column("w").expect("w exists");

    let result = apply_committed(state.clone(), Command::AlterTable { schema: altered });

    assert!(matches!(
        result,
        Err(ViewError::Schema(SchemaError::IncompatibleAlteration { column, .. })) if column == "w"
    ));
    assert_eq!(state.get_table(&test_table_id()), Some(&test_base()));
}

#[test]
fn batch_applies_every_command_or_fails() {
    let commands = vec![
        Command::create_table(test_base()),
        Command::create_view(ViewId::new(1), test_table_id(), by_v_spec()),
        Command::create_view(ViewId::new(2), test_table_id(), mirror_spec()),
    ];
    let (state, effects) = apply_committed_batch(State::new(), commands).expect("batch applies");

    assert_eq!(state.view_count(), 2);
    assert_eq!(state.views_of(test_table_id()).count(), 2);
    assert_eq!(state.next_view_id(), ViewId::new(3));
    assert_eq!(effects.len(), 5);

    let failing = vec![
        Command::create_table(test_base()),
        Command::create_table(test_base()),
    ];
    assert!(apply_committed_batch(State::new(), failing).is_err());
}

// ============================================================================
// Liveness Resolver Tests
// ============================================================================

#[test]
fn null_view_key_column_hides_the_row() {
    let view = by_v();
    let without_v = inserted_row(123, 0, 1);
    assert!(resolve(&view, &without_v, now()).is_none());

    let with_v = without_v.with_cell("v", Cell::live("cat", ts(2)));
    let resolved = resolve(&view, &with_v, now()).expect("row should appear");
    assert_eq!(resolved.key.to_string(), "('cat')(123, 0)");

    let nulled = with_v.with_cell("v", Cell::tombstone(ts(3)));
    assert!(resolve(&view, &nulled, now()).is_none());
}

#[test]
fn row_kept_alive_by_one_cell_appears_in_key_only_view() {
    let spec = ViewSpec::new("keys")
        .with_selection(["p", "c"])
        .with_partition_key(["p"])
        .with_clustering_key(["c"])
        .with_key_not_null();
    let view = project(&test_base(), &spec).expect("view should project");

    // No marker: only the unselected cell keeps the base row alive.
    let base = row(1, 1).with_cell("u", Cell::live(5, ts(3)));
    let resolved = resolve(&view, &base, now()).expect("row should appear");

    assert!(resolved.row.marker.is_none());
    assert!(resolved.row.cells.is_empty());
    assert_eq!(resolved.row.virtual_cells.len(), 1);
    assert!(view_row_is_live(&view, &resolved.row, now()));
    assert_eq!(resolved.liveness.timestamp, ts(3));
}

#[test]
fn promoted_column_alone_decides_liveness() {
    let view = by_v();
    let expiry = Expiry::new(Ttl::from_secs(1), ts(0));
    let base = inserted_row(1, 1, 9)
        .with_cell("v", Cell::expiring("cat", ts(5), expiry))
        .with_cell("w", Cell::live(3, ts(7)));

    let resolved = resolve(&view, &base, ts(10)).expect("row should appear");
    let marker = resolved.row.marker.expect("promoted column sets the marker");
    assert_eq!(marker.timestamp, ts(5));
    assert_eq!(resolved.liveness.expiry, Some(expiry));
    // The promoted column's write, not the newer selected one.
    assert_eq!(resolved.liveness.timestamp, ts(5));

    // Once the key cell expires the view row is gone, even though the
    // selected cell lives on.
    assert!(!view_row_is_live(&view, &resolved.row, ts(2_000_000)));
}

#[test]
fn comparison_filter_on_key_column() {
    let spec = mirror_spec().with_filter(crate::filter::FilterTerm::compare(
        "c",
        crate::filter::FilterOp::Gte,
        10,
    ));
    let view = project(&test_base(), &spec).expect("view should project");

    assert!(resolve(&view, &inserted_row(1, 9, 1), now()).is_none());
    assert!(resolve(&view, &inserted_row(1, 10, 1), now()).is_some());
}

// ============================================================================
// Update Propagator Tests
// ============================================================================

#[test]
fn absent_to_absent_is_a_no_op() {
    let view = by_v();
    let before = inserted_row(1, 1, 1);
    let after = before.clone().with_cell("w", Cell::live(3, ts(2)));
    assert!(propagate(&view, Some(&before), Some(&after), ts(2), now()).is_empty());
}

#[test]
fn key_change_deletes_old_and_inserts_new() {
    let view = by_v();
    let before = inserted_row(1, 1, 1).with_cell("v", Cell::live("a", ts(1)));
    let after = inserted_row(1, 1, 1).with_cell("v", Cell::live("b", ts(4)));

    let mutations = propagate(&view, Some(&before), Some(&after), ts(4), now());

    assert_eq!(mutations.len(), 2);
    assert!(
        matches!(&mutations[0], ViewMutation::Delete { key, timestamp } if key.to_string() == "('a')(1, 1)" && *timestamp == ts(4))
    );
    assert!(
        matches!(&mutations[1], ViewMutation::Insert { key, .. } if key.to_string() == "('b')(1, 1)")
    );
}

#[test]
fn selected_change_updates_in_place() {
    let view = by_v();
    let before = inserted_row(1, 1, 1).with_cell("v", Cell::live("a", ts(1)));
    let after = before.clone().with_cell("w", Cell::live(7, ts(3)));

    let mutations = propagate(&view, Some(&before), Some(&after), ts(3), now());

    assert_eq!(mutations.len(), 1);
    let ViewMutation::Update { row, .. } = &mutations[0] else {
        panic!("expected an update, got {mutations:?}");
    };
    assert_eq!(row.cells.get("w"), Some(&Cell::live(7, ts(3))));
}

#[test]
fn row_deletion_is_written_at_the_deleting_write() {
    let view = mirror();
    let before = inserted_row(1, 1, 1).with_cell("w", Cell::live(7, ts(3)));

    let mutations = propagate(&view, Some(&before), None, ts(5), now());

    assert_eq!(mutations.len(), 1);
    assert!(matches!(mutations[0], ViewMutation::Delete { timestamp, .. } if timestamp == ts(5)));
}

#[test]
fn reinsert_after_a_row_deletion_is_visible_despite_newer_tombstones() {
    let view = mirror();
    let first = inserted_row(1, 1, 10).with_cell("w", Cell::tombstone(ts(100)));
    let deleted = first.clone().shadowed_by(Some(ts(50)));
    let mut reinserted = deleted.clone();
    reinserted.merge(&inserted_row(1, 1, 60));

    let mut stored = ViewRowState::new();
    for (before, after, at) in [
        (None, Some(&first), ts(10)),
        (Some(&first), Some(&deleted), ts(50)),
        (Some(&deleted), Some(&reinserted), ts(60)),
    ] {
        for mutation in propagate(&view, before, after, at, now()) {
            stored.apply(&mutation);
        }
    }

    assert!(stored.is_live(&view, now()));
}

#[test]
fn key_flipped_back_reappears_despite_a_newer_selected_write() {
    let view = by_v();
    // `w` carries a client timestamp far ahead of the key writes.
    let first = inserted_row(1, 1, 10)
        .with_cell("v", Cell::live("a", ts(10)))
        .with_cell("w", Cell::live(2, ts(100)));
    let to_b = first.clone().with_cell("v", Cell::live("b", ts(20)));
    let back_to_a = to_b.clone().with_cell("v", Cell::live("a", ts(30)));

    let mut store: std::collections::BTreeMap<ViewKey, ViewRowState> =
        std::collections::BTreeMap::new();
    for (before, after, at) in [
        (None, &first, ts(10)),
        (Some(&first), &to_b, ts(20)),
        (Some(&to_b), &back_to_a, ts(30)),
    ] {
        for mutation in propagate(&view, before, Some(after), at, now()) {
            store.entry(mutation.key().clone()).or_default().apply(&mutation);
        }
    }

    let live: Vec<String> = store
        .iter()
        .filter(|(_, state)| state.is_live(&view, now()))
        .map(|(key, state)| {
            assert_eq!(state.row.cells.get("w"), Some(&Cell::live(2, ts(100))));
            key.to_string()
        })
        .collect();
    assert_eq!(live, vec!["('a')(1, 1)".to_string()]);
}

#[test]
fn partial_deletion_purges_lost_data_before_updating() {
    let view = mirror();
    // A row deletion at 5 removed the marker and `w`, but `u` survived.
    let before = inserted_row(1, 1, 2)
        .with_cell("w", Cell::live(7, ts(3)))
        .with_cell("u", Cell::live(1, ts(9)));
    let after = before.clone().shadowed_by(Some(ts(5)));

    let mutations = propagate(&view, Some(&before), Some(&after), ts(5), now());

    assert_eq!(mutations.len(), 2);
    assert!(matches!(mutations[0], ViewMutation::Delete { timestamp, .. } if timestamp == ts(3)));

    let mut stored = ViewRowState::new();
    let resolved = resolve(&view, &before, now()).expect("before is visible");
    stored.apply(&ViewMutation::Insert {
        key: resolved.key,
        row: resolved.row,
    });
    mutations.iter().for_each(|m| stored.apply(m));

    assert!(stored.row.marker.is_none());
    assert!(!stored.row.cells.contains_key("w"));
    assert!(stored.is_live(&view, now()));
}

#[test]
fn unselected_changes_in_a_large_batch_produce_nothing() {
    let view = by_v();
    let mut update = PartitionUpdate::new(PartitionKey::new(vec![Value::Int(1)]));
    for c in 0..200 {
        let before = inserted_row(1, c, 1).with_cell("v", Cell::live("a", ts(1)));
        let after = before.clone().with_cell("u", Cell::live(c, ts(2)));
        update = update.with_change(BaseChange::Upsert(RowDiff::new(
            Some(before),
            Some(after),
            ts(2),
        )));
    }
    let before = inserted_row(1, 200, 1).with_cell("v", Cell::live("a", ts(1)));
    let after = before.clone().with_cell("w", Cell::live(42, ts(2)));
    update = update.with_change(BaseChange::Upsert(RowDiff::new(
        Some(before),
        Some(after),
        ts(2),
    )));

    let mutations = propagate_update(&view, &update, now(), 100);

    assert_eq!(update.row_count(), 201);
    assert_eq!(mutations.len(), 1);
    assert_eq!(mutations[0].key().to_string(), "('a')(1, 200)");
}

#[test]
fn partition_deletion_reaches_every_affected_row() {
    let view = by_v();
    let affected: Vec<RowDiff> = (0..250)
        .map(|c| {
            let before = inserted_row(1, c, 1).with_cell("v", Cell::live(format!("v{c}"), ts(1)));
            RowDiff::new(Some(before), None, ts(5))
        })
        .collect();
    let update = PartitionUpdate::new(PartitionKey::new(vec![Value::Int(1)])).with_change(
        BaseChange::DeletePartition {
            deletion: ts(5),
            affected,
        },
    );

    let mutations = propagate_update(&view, &update, now(), 100);

    assert_eq!(mutations.len(), 250);
    assert!(mutations.iter().all(ViewMutation::is_delete));
}

// ============================================================================
// Property Tests
// ============================================================================

mod proptests {
    use super::*;
    use crate::skip::can_skip;
    use proptest::prelude::*;

    fn cell() -> impl Strategy<Value = Option<Cell>> {
        prop_oneof![
            Just(None),
            (0i32..3, 1i64..20).prop_map(|(v, t)| Some(Cell::live(v, ts(t)))),
            (1i64..20).prop_map(|t| Some(Cell::tombstone(ts(t)))),
        ]
    }

    fn text_cell() -> impl Strategy<Value = Option<Cell>> {
        prop_oneof![
            Just(None),
            (0u8..3, 1i64..20).prop_map(|(v, t)| Some(Cell::live(format!("k{v}"), ts(t)))),
            (1i64..20).prop_map(|t| Some(Cell::tombstone(ts(t)))),
        ]
    }

    fn base_row() -> impl Strategy<Value = BaseRowState> {
        (
            prop::option::of(1i64..20),
            text_cell(),
            cell(),
            cell(),
        )
            .prop_map(|(marker, v, w, u)| {
                let mut row = row(1, 1);
                row.marker = marker.map(|t| RowMarker::new(ts(t)));
                for (name, cell) in [("v", v), ("w", w), ("u", u)] {
                    if let Some(cell) = cell {
                        row.cells.insert(name.to_string(), cell);
                    }
                }
                row
            })
    }

    /// What a reader can observe of a view for one base row.
    fn visible(view: &ViewDefinition, row: &BaseRowState) -> Option<(String, Option<Value>)> {
        let resolved = resolve(view, row, now())?;
        let w = resolved
            .row
            .cells
            .get("w")
            .and_then(|c| c.value_at(now()))
            .cloned();
        Some((resolved.key.to_string(), w))
    }

    /// Applies mutations to a map of stored view rows.
    fn apply(
        store: &mut std::collections::BTreeMap<crate::mutation::ViewKey, ViewRowState>,
        mutations: &[ViewMutation],
    ) {
        for mutation in mutations {
            store.entry(mutation.key().clone()).or_default().apply(mutation);
        }
    }

    proptest! {
        #[test]
        fn skipped_writes_never_change_what_the_view_shows(
            before in base_row(),
            after in base_row(),
        ) {
            for view in [by_v(), mirror()] {
                let diff = RowDiff::new(Some(before.clone()), Some(after.clone()), ts(20));
                if can_skip(&view, &diff, now()) {
                    prop_assert_eq!(visible(&view, &before), visible(&view, &after));
                }
            }
        }

        #[test]
        fn view_matches_base_after_any_transition(
            first in base_row(),
            write in base_row(),
            deletion in prop::option::of(1i64..20),
        ) {
            let mut second = first.clone();
            second.merge(&write);
            let second = second.shadowed_by(deletion.map(ts));

            for view in [by_v(), mirror()] {
                let mut store = std::collections::BTreeMap::new();
                apply(&mut store, &propagate(&view, None, Some(&first), ts(20), now()));
                let mutations = propagate(&view, Some(&first), Some(&second), ts(20), now());
                apply(&mut store, &mutations);

                let live: Vec<_> = store
                    .iter()
                    .filter(|(_, state)| state.is_live(&view, now()))
                    .map(|(key, _)| key.clone())
                    .collect();
                let expected: Vec<_> = resolve(&view, &second, now())
                    .map(|r| r.key)
                    .into_iter()
                    .collect();
                prop_assert_eq!(live, expected);

                // At-least-once delivery: replaying the batch changes nothing.
                let once = store.clone();
                apply(&mut store, &mutations);
                prop_assert_eq!(store, once);
            }
        }
    }
}
