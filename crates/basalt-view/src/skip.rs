//! Cheap check for base writes that cannot change a view.

use basalt_types::Timestamp;

use crate::mutation::RowDiff;
use crate::row::{BaseRowState, RowMarker};
use crate::schema::ViewDefinition;

/// True if `diff` provably leaves `view` unchanged.
///
/// The check is conservative: `false` only means the propagator has to
/// look. A skip requires that the row keeps the same live, non-expiring
/// marker on both sides and that every column the write touched is
/// irrelevant to the view. While that marker lives it keeps the view row
/// alive on its own, so liveness cells left stale by a skipped write cannot
/// change what the view shows; the next propagated change rewrites them.
pub fn can_skip(view: &ViewDefinition, diff: &RowDiff, now: Timestamp) -> bool {
    let (before, after) = match (&diff.before, &diff.after) {
        (None, None) => return true,
        (Some(before), Some(after)) => (before, after),
        _ => return false,
    };

    let before_live = before.is_live(now);
    if before_live != after.is_live(now) {
        return false;
    }
    if !before_live {
        return true;
    }

    if before.marker != after.marker || !is_durable(before.marker, now) {
        return false;
    }

    changed_columns(before, after).all(|column| !view.is_relevant(column))
}

fn is_durable(marker: Option<RowMarker>, now: Timestamp) -> bool {
    marker.is_some_and(|m| m.expiry.is_none() && m.is_live(now))
}

fn changed_columns<'a>(
    before: &'a BaseRowState,
    after: &'a BaseRowState,
) -> impl Iterator<Item = &'a str> {
    let removed_or_changed = before
        .cells
        .iter()
        .filter(|(column, cell)| after.cells.get(*column) != Some(cell))
        .map(|(column, _)| column.as_str());
    let added = after
        .cells
        .keys()
        .filter(|column| !before.cells.contains_key(*column))
        .map(String::as_str);
    removed_or_changed.chain(added)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::row::{Cell, ClusteringKey, PartitionKey};
    use crate::schema::{BaseSchema, ViewSpec, project};
    use crate::value::{DataType, Value};
    use basalt_types::{Expiry, TableId, Ttl};

    fn ts(micros: i64) -> Timestamp {
        Timestamp::from_micros(micros)
    }

    fn view() -> ViewDefinition {
        let base = BaseSchema::builder(TableId::new(1), "t")
            .partition_key("k", DataType::Int)
            .regular("v", DataType::Int)
            .regular("u", DataType::Int)
            .build()
            .expect("valid schema");
        let spec = ViewSpec::new("mv")
            .with_selection(["k", "v"])
            .with_partition_key(["k"])
            .with_key_not_null();
        project(&base, &spec).expect("view should project")
    }

    fn row(marker: Option<RowMarker>) -> BaseRowState {
        let row = BaseRowState::new(
            PartitionKey::new(vec![Value::Int(1)]),
            ClusteringKey::empty(),
        )
        .with_cell("v", Cell::live(1, ts(1)));
        match marker {
            Some(marker) => row.with_marker(marker),
            None => row,
        }
    }

    fn diff(before: BaseRowState, after: BaseRowState) -> RowDiff {
        RowDiff::new(Some(before), Some(after), ts(5))
    }

    #[test]
    fn unselected_change_with_durable_marker_is_skipped() {
        let marker = Some(RowMarker::new(ts(1)));
        let before = row(marker);
        let after = row(marker).with_cell("u", Cell::live(9, ts(5)));
        assert!(can_skip(&view(), &diff(before, after), ts(10)));
    }

    #[test]
    fn selected_change_is_never_skipped() {
        let marker = Some(RowMarker::new(ts(1)));
        let before = row(marker);
        let after = row(marker).with_cell("v", Cell::live(2, ts(5)));
        assert!(!can_skip(&view(), &diff(before, after), ts(10)));
    }

    #[test]
    fn unselected_change_without_marker_is_not_skipped() {
        let before = row(None);
        let after = row(None).with_cell("u", Cell::live(9, ts(5)));
        assert!(!can_skip(&view(), &diff(before, after), ts(10)));
    }

    #[test]
    fn expiring_marker_is_not_trusted() {
        let expiry = Expiry::new(Ttl::from_secs(60), ts(1));
        let marker = Some(RowMarker::expiring(ts(1), expiry));
        let before = row(marker);
        let after = row(marker).with_cell("u", Cell::tombstone(ts(5)));
        assert!(!can_skip(&view(), &diff(before, after), ts(10)));
    }

    #[test]
    fn creation_and_removal_are_never_skipped() {
        let view = view();
        let present = row(Some(RowMarker::new(ts(1))));
        assert!(!can_skip(
            &view,
            &RowDiff::new(None, Some(present.clone()), ts(1)),
            ts(10)
        ));
        assert!(!can_skip(
            &view,
            &RowDiff::new(Some(present), None, ts(1)),
            ts(10)
        ));
        assert!(can_skip(&view, &RowDiff::new(None, None, ts(1)), ts(10)));
    }
}
