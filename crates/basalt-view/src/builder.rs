//! The View Builder: backfills a view from existing base partitions in
//! bounded, resumable steps.
//!
//! Each step reads at most `batch_size` rows. A step that stops inside a
//! partition emits a [`BuildProgress`] checkpoint holding the last clustering
//! position and the [`RangeDeletionContext`] open there; the next step seeks
//! past that position and shadows rows with the saved context merged with
//! the deletions the base reports there, so a tombstone straddling the
//! suspension point, or written while the build was suspended, never lets a
//! deleted row back into the view.
//!
//! A finished partition keeps a checkpoint at its last row until the whole
//! build is done, so a restarted build does not scan it again.

use std::collections::{BTreeMap, VecDeque};

use basalt_types::{MAX_KEY_COMPONENT_SIZE, Timestamp, ViewId};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::effects::Effect;
use crate::liveness::resolve;
use crate::mutation::{ViewKey, ViewMutation};
use crate::row::{BaseRowState, ClusteringKey, PartitionKey};
use crate::schema::ViewDefinition;
use crate::tombstone::{ClusteringComparator, RangeDeletionContext, RangeTombstone};

/// Default number of base rows read per build step.
pub const DEFAULT_BUILD_BATCH_SIZE: usize = 128;

// ============================================================================
// Partition Scan
// ============================================================================

/// One item of a base partition scan, in clustering order.
///
/// Tombstones are reported where they open, before the rows they cover;
/// rows are reported unfiltered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanFragment {
    PartitionDeletion(Timestamp),
    RangeTombstone(RangeTombstone),
    Row(BaseRowState),
}

/// Read access to a snapshot of the base table.
pub trait BaseScan {
    /// Every base partition, in a stable order.
    fn partitions(&self) -> Vec<PartitionKey>;

    /// Scans one partition in clustering order.
    ///
    /// With `after`, only rows strictly after that clustering position are
    /// returned. The partition deletion and every range tombstone that has
    /// not closed by `after` are still reported, ahead of the rows, so
    /// deletions written since a checkpoint reach the resumed scan.
    fn read_partition(
        &self,
        partition_key: &PartitionKey,
        after: Option<&ClusteringKey>,
    ) -> Box<dyn Iterator<Item = ScanFragment> + '_>;
}

// ============================================================================
// Progress
// ============================================================================

/// Checkpoint of a partition scan: where it stopped and which tombstones
/// were open there.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildProgress {
    pub view_id: ViewId,
    pub partition_key: PartitionKey,
    pub last_position: ClusteringKey,
    pub context: RangeDeletionContext,
}

/// Counters for one view build.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildStats {
    pub steps: u64,
    pub rows_scanned: u64,
    pub rows_built: u64,
    /// Rows left out because a view key component exceeded the size limit.
    pub rows_oversized: u64,
    pub partitions_built: u64,
}

#[derive(Debug, Clone)]
struct Cursor {
    partition_key: PartitionKey,
    last_position: Option<ClusteringKey>,
    context: RangeDeletionContext,
}

impl Cursor {
    fn fresh(partition_key: PartitionKey) -> Self {
        Self {
            partition_key,
            last_position: None,
            context: RangeDeletionContext::new(),
        }
    }
}

impl From<BuildProgress> for Cursor {
    fn from(progress: BuildProgress) -> Self {
        Self {
            partition_key: progress.partition_key,
            last_position: Some(progress.last_position),
            context: progress.context,
        }
    }
}

// ============================================================================
// Build Task
// ============================================================================

/// Backfill of one view.
///
/// The task is single-owner: whoever drives it holds it exclusively while a
/// step runs, so no two steps ever advance the same partition.
#[derive(Debug, Clone)]
pub struct ViewBuildTask {
    view_id: ViewId,
    view: ViewDefinition,
    base_comparator: ClusteringComparator,
    batch_size: usize,
    max_key_size: usize,
    pending: Option<VecDeque<PartitionKey>>,
    saved: BTreeMap<PartitionKey, BuildProgress>,
    current: Option<Cursor>,
    completed: Vec<PartitionKey>,
    stats: BuildStats,
    finished: bool,
}

impl ViewBuildTask {
    pub fn new(view_id: ViewId, view: ViewDefinition, base_comparator: ClusteringComparator) -> Self {
        Self {
            view_id,
            view,
            base_comparator,
            batch_size: DEFAULT_BUILD_BATCH_SIZE,
            max_key_size: MAX_KEY_COMPONENT_SIZE,
            pending: None,
            saved: BTreeMap::new(),
            current: None,
            completed: Vec::new(),
            stats: BuildStats::default(),
            finished: false,
        }
    }

    /// Rows read per step; zero is treated as one.
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_max_key_size(mut self, max_key_size: usize) -> Self {
        self.max_key_size = max_key_size;
        self
    }

    /// Resumes partitions from earlier checkpoints. Partitions without one
    /// are rebuilt from the start, which is safe because view writes are
    /// idempotent.
    pub fn with_progress(mut self, progress: impl IntoIterator<Item = BuildProgress>) -> Self {
        for checkpoint in progress {
            if checkpoint.view_id == self.view_id {
                self.saved.insert(checkpoint.partition_key.clone(), checkpoint);
            }
        }
        self
    }

    pub fn view_id(&self) -> ViewId {
        self.view_id
    }

    pub fn view(&self) -> &ViewDefinition {
        &self.view
    }

    /// Replaces the view definition, e.g. after a base schema alteration.
    pub fn set_view(&mut self, view: ViewDefinition) {
        self.view = view;
    }

    pub fn stats(&self) -> BuildStats {
        self.stats
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Runs one step of at most `batch_size` rows.
    ///
    /// Returns the effects to execute in order: the view inserts first, then
    /// checkpoint bookkeeping, and `MarkViewBuilt` once every partition that
    /// existed when the build started has been scanned. The step that scans
    /// the last row also finishes the build.
    pub fn step(&mut self, scan: &dyn BaseScan, now: Timestamp) -> Vec<Effect> {
        if self.finished {
            return Vec::new();
        }
        let pending = self
            .pending
            .get_or_insert_with(|| scan.partitions().into_iter().collect());
        debug!(view_id = %self.view_id, partitions = pending.len(), "view build step");

        self.stats.steps += 1;
        let mut mutations = Vec::new();
        let mut bookkeeping = Vec::new();
        let mut budget = self.batch_size;

        while budget > 0 {
            let Some(mut cursor) = self.next_cursor() else {
                self.finish(&mut bookkeeping);
                break;
            };

            let exhausted = self.scan_partition(scan, &mut cursor, &mut budget, &mut mutations, now);
            if exhausted {
                self.stats.partitions_built += 1;
                if let Some(last_position) = cursor.last_position {
                    bookkeeping.push(Effect::PersistBuildProgress(BuildProgress {
                        view_id: self.view_id,
                        partition_key: cursor.partition_key.clone(),
                        last_position,
                        context: cursor.context,
                    }));
                }
                self.completed.push(cursor.partition_key);
            } else {
                if let Some(last_position) = cursor.last_position.clone() {
                    debug!(
                        view_id = %self.view_id,
                        partition = %cursor.partition_key,
                        position = %last_position,
                        open_tombstones = cursor.context.open_ranges().len(),
                        "view build suspended"
                    );
                    bookkeeping.push(Effect::PersistBuildProgress(BuildProgress {
                        view_id: self.view_id,
                        partition_key: cursor.partition_key.clone(),
                        last_position,
                        context: cursor.context.clone(),
                    }));
                }
                self.current = Some(cursor);
            }
        }
        if !self.finished
            && self.current.is_none()
            && self.pending.as_ref().is_some_and(VecDeque::is_empty)
        {
            self.finish(&mut bookkeeping);
        }

        let mut effects = Vec::with_capacity(bookkeeping.len() + 1);
        if !mutations.is_empty() {
            effects.push(Effect::ApplyViewMutations {
                view_id: self.view_id,
                mutations,
            });
        }
        effects.extend(bookkeeping);
        effects
    }

    fn finish(&mut self, bookkeeping: &mut Vec<Effect>) {
        self.finished = true;
        debug!(
            view_id = %self.view_id,
            rows = self.stats.rows_built,
            oversized = self.stats.rows_oversized,
            "view build scanned every partition"
        );
        let view_id = self.view_id;
        bookkeeping.extend(
            self.completed
                .drain(..)
                .map(|partition_key| Effect::ClearBuildProgress { view_id, partition_key }),
        );
        bookkeeping.push(Effect::MarkViewBuilt(view_id));
    }

    fn next_cursor(&mut self) -> Option<Cursor> {
        if let Some(cursor) = self.current.take() {
            return Some(cursor);
        }
        let partition_key = self.pending.as_mut()?.pop_front()?;
        Some(match self.saved.remove(&partition_key) {
            Some(progress) => Cursor::from(progress),
            None => Cursor::fresh(partition_key),
        })
    }

    /// Scans from the cursor until the budget runs out or the partition
    /// ends. Returns true when the partition is exhausted.
    fn scan_partition(
        &mut self,
        scan: &dyn BaseScan,
        cursor: &mut Cursor,
        budget: &mut usize,
        mutations: &mut Vec<ViewMutation>,
        now: Timestamp,
    ) -> bool {
        let mut fragments = scan
            .read_partition(&cursor.partition_key, cursor.last_position.as_ref())
            .peekable();

        while let Some(fragment) = fragments.next() {
            match fragment {
                ScanFragment::PartitionDeletion(deletion) => {
                    cursor.context = cursor.context.with_partition_deletion(deletion);
                }
                ScanFragment::RangeTombstone(range) => {
                    cursor.context = cursor.context.open(range);
                }
                ScanFragment::Row(row) => {
                    let position = row.clustering_key.clone();
                    cursor.context = cursor
                        .context
                        .close_ended_before(position.components(), &self.base_comparator);
                    let deletion = cursor
                        .context
                        .deletion_at(position.components(), &self.base_comparator);
                    cursor.last_position = Some(position);

                    self.stats.rows_scanned += 1;
                    if let Some(mutation) = self.build_row(row.shadowed_by(deletion), now) {
                        self.stats.rows_built += 1;
                        mutations.push(mutation);
                    }

                    *budget -= 1;
                    if *budget == 0 {
                        return fragments.peek().is_none();
                    }
                }
            }
        }
        true
    }

    fn build_row(&mut self, row: BaseRowState, now: Timestamp) -> Option<ViewMutation> {
        let resolved = resolve(&self.view, &row, now)?;
        if let Some((column, size)) = oversized_component(&self.view, &resolved.key, self.max_key_size)
        {
            self.stats.rows_oversized += 1;
            warn!(
                view_id = %self.view_id,
                view = self.view.name(),
                partition = %row.partition_key,
                column,
                size,
                limit = self.max_key_size,
                "skipping base row: view key component too large"
            );
            return None;
        }
        Some(ViewMutation::Insert {
            key: resolved.key,
            row: resolved.row,
        })
    }
}

/// The first view key component larger than `limit`, with its size.
pub fn oversized_component<'a>(
    view: &'a ViewDefinition,
    key: &ViewKey,
    limit: usize,
) -> Option<(&'a str, usize)> {
    let components = key
        .partition_key
        .components()
        .iter()
        .chain(key.clustering_key.components());
    view.key_columns()
        .zip(components)
        .map(|(column, value)| (column.name.as_str(), value.serialized_size()))
        .find(|(_, size)| *size > limit)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::row::{Cell, RowMarker};
    use crate::schema::{BaseSchema, ClusteringOrder, ViewSpec, project};
    use crate::tombstone::Bound;
    use crate::value::{DataType, Value};
    use basalt_types::TableId;

    /// Base partitions held as pre-sorted fragment lists.
    struct FragmentScan {
        comparator: ClusteringComparator,
        partitions: BTreeMap<PartitionKey, Vec<ScanFragment>>,
    }

    impl BaseScan for FragmentScan {
        fn partitions(&self) -> Vec<PartitionKey> {
            self.partitions.keys().cloned().collect()
        }

        fn read_partition(
            &self,
            partition_key: &PartitionKey,
            after: Option<&ClusteringKey>,
        ) -> Box<dyn Iterator<Item = ScanFragment> + '_> {
            let fragments = self.partitions.get(partition_key).into_iter().flatten();
            let after = after.cloned();
            Box::new(fragments.filter(move |fragment| {
                let Some(after) = &after else {
                    return true;
                };
                match fragment {
                    ScanFragment::PartitionDeletion(_) => true,
                    ScanFragment::RangeTombstone(range) => {
                        !range.ends_before(after.components(), &self.comparator)
                    }
                    ScanFragment::Row(row) => {
                        self.comparator
                            .compare(row.clustering_key.components(), after.components())
                            .is_gt()
                    }
                }
            }).cloned())
        }
    }

    fn ts(micros: i64) -> Timestamp {
        Timestamp::from_micros(micros)
    }

    fn base() -> BaseSchema {
        BaseSchema::builder(TableId::new(1), "t")
            .partition_key("p", DataType::Int)
            .clustering("c", DataType::Int, ClusteringOrder::Asc)
            .regular("v", DataType::Text)
            .build()
            .expect("valid schema")
    }

    fn view_by_v() -> ViewDefinition {
        let spec = ViewSpec::new("by_v")
            .with_partition_key(["v"])
            .with_clustering_key(["p", "c"])
            .with_key_not_null();
        project(&base(), &spec).expect("view should project")
    }

    fn row(p: i32, c: i32, v: &str) -> ScanFragment {
        ScanFragment::Row(
            BaseRowState::new(
                PartitionKey::new(vec![Value::Int(p)]),
                ClusteringKey::new(vec![Value::Int(c)]),
            )
            .with_marker(RowMarker::new(ts(1)))
            .with_cell("v", Cell::live(v, ts(1))),
        )
    }

    fn scan(partitions: Vec<(i32, Vec<ScanFragment>)>) -> FragmentScan {
        FragmentScan {
            comparator: base().comparator(),
            partitions: partitions
                .into_iter()
                .map(|(p, fragments)| (PartitionKey::new(vec![Value::Int(p)]), fragments))
                .collect(),
        }
    }

    fn inserted(effects: &[Effect]) -> Vec<ViewMutation> {
        effects
            .iter()
            .filter_map(|e| match e {
                Effect::ApplyViewMutations { mutations, .. } => Some(mutations.clone()),
                _ => None,
            })
            .flatten()
            .collect()
    }

    fn run_to_completion(task: &mut ViewBuildTask, scan: &FragmentScan) -> Vec<Effect> {
        let mut effects = Vec::new();
        while !task.is_finished() {
            effects.extend(task.step(scan, ts(100)));
        }
        effects
    }

    #[test]
    fn tombstone_opened_before_a_suspension_still_shadows_after_it() {
        let scan = scan(vec![(
            1,
            vec![
                row(1, 0, "a"),
                ScanFragment::RangeTombstone(RangeTombstone::new(
                    Bound::Inclusive(vec![Value::Int(1)]),
                    Bound::Inclusive(vec![Value::Int(3)]),
                    ts(5),
                )),
                row(1, 1, "b"),
                row(1, 2, "c"),
                row(1, 3, "d"),
                row(1, 4, "e"),
            ],
        )]);
        let mut task = ViewBuildTask::new(ViewId::new(1), view_by_v(), base().comparator())
            .with_batch_size(2);

        let effects = run_to_completion(&mut task, &scan);
        let keys: Vec<String> = inserted(&effects)
            .iter()
            .map(|m| m.key().partition_key.to_string())
            .collect();

        assert_eq!(keys, vec!["('a')", "('e')"]);
        assert!(effects.iter().any(|e| matches!(e, Effect::PersistBuildProgress(_))));
        assert_eq!(effects.last(), Some(&Effect::MarkViewBuilt(ViewId::new(1))));
    }

    #[test]
    fn resumed_task_replays_the_saved_context() {
        let fragments = vec![
            ScanFragment::PartitionDeletion(ts(5)),
            row(1, 0, "a"),
            row(1, 1, "b"),
        ];
        let scan = scan(vec![(1, fragments)]);

        let mut first = ViewBuildTask::new(ViewId::new(1), view_by_v(), base().comparator())
            .with_batch_size(1);
        let effects = first.step(&scan, ts(100));
        let checkpoint = effects
            .iter()
            .find_map(|e| match e {
                Effect::PersistBuildProgress(progress) => Some(progress.clone()),
                _ => None,
            })
            .expect("first step should suspend");
        assert_eq!(checkpoint.context.partition_deletion(), Some(ts(5)));

        // A fresh task, as after a restart.
        let mut resumed = ViewBuildTask::new(ViewId::new(1), view_by_v(), base().comparator())
            .with_progress([checkpoint]);
        let effects = run_to_completion(&mut resumed, &scan);
        assert!(inserted(&effects).is_empty());
        assert_eq!(resumed.stats().rows_scanned, 1);
    }

    #[test]
    fn deletion_written_during_a_suspension_shadows_the_rest() {
        let before = scan(vec![(1, vec![row(1, 0, "a"), row(1, 1, "b")])]);
        let mut task = ViewBuildTask::new(ViewId::new(1), view_by_v(), base().comparator())
            .with_batch_size(1);
        let first = task.step(&before, ts(100));
        assert_eq!(inserted(&first).len(), 1);

        let after = scan(vec![(
            1,
            vec![
                ScanFragment::PartitionDeletion(ts(5)),
                row(1, 0, "a"),
                row(1, 1, "b"),
            ],
        )]);
        let rest = run_to_completion(&mut task, &after);

        assert!(inserted(&rest).is_empty());
        assert_eq!(task.stats().rows_scanned, 2);
    }

    #[test]
    fn a_step_reads_one_batch_however_large_the_partition() {
        struct EndlessPartition;

        impl BaseScan for EndlessPartition {
            fn partitions(&self) -> Vec<PartitionKey> {
                vec![PartitionKey::new(vec![Value::Int(1)])]
            }

            fn read_partition(
                &self,
                _partition_key: &PartitionKey,
                after: Option<&ClusteringKey>,
            ) -> Box<dyn Iterator<Item = ScanFragment> + '_> {
                let start = match after.map(|key| &key.components()[0]) {
                    Some(Value::Int(c)) => c + 1,
                    _ => 0,
                };
                Box::new((start..).map(|c| row(1, c, "a")))
            }
        }

        let mut task = ViewBuildTask::new(ViewId::new(1), view_by_v(), base().comparator())
            .with_batch_size(4);
        let first = task.step(&EndlessPartition, ts(100));
        let second = task.step(&EndlessPartition, ts(100));

        assert_eq!(inserted(&first).len(), 4);
        assert_eq!(inserted(&second).len(), 4);
        assert_eq!(task.stats().rows_scanned, 8);
        assert!(!task.is_finished());
    }

    #[test]
    fn oversized_key_rows_are_counted_and_skipped() {
        let big = "x".repeat(70_000);
        let scan = scan(vec![(1, vec![row(1, 0, &big), row(1, 1, "ok")])]);
        let mut task = ViewBuildTask::new(ViewId::new(1), view_by_v(), base().comparator());

        let effects = run_to_completion(&mut task, &scan);

        assert_eq!(inserted(&effects).len(), 1);
        assert_eq!(task.stats().rows_oversized, 1);
        assert_eq!(task.stats().rows_built, 1);
    }

    #[test]
    fn every_partition_is_cleared_before_the_view_is_marked_built() {
        let scan = scan(vec![
            (1, vec![row(1, 0, "a")]),
            (2, vec![row(2, 0, "b")]),
            (3, Vec::new()),
        ]);
        let mut task = ViewBuildTask::new(ViewId::new(7), view_by_v(), base().comparator());

        let effects = run_to_completion(&mut task, &scan);
        let cleared = effects
            .iter()
            .filter(|e| matches!(e, Effect::ClearBuildProgress { .. }))
            .count();

        assert_eq!(cleared, 3);
        assert_eq!(task.stats().partitions_built, 3);
        assert!(task.step(&scan, ts(100)).is_empty());
    }

    #[test]
    fn finished_partitions_are_not_rescanned_after_a_restart() {
        let scan = scan(vec![(1, vec![row(1, 0, "a")]), (2, vec![row(2, 0, "b")])]);

        let mut first = ViewBuildTask::new(ViewId::new(1), view_by_v(), base().comparator())
            .with_batch_size(1);
        let effects = first.step(&scan, ts(100));
        assert!(!first.is_finished());
        let checkpoints: Vec<BuildProgress> = effects
            .iter()
            .filter_map(|e| match e {
                Effect::PersistBuildProgress(progress) => Some(progress.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(checkpoints.len(), 1);

        let mut resumed = ViewBuildTask::new(ViewId::new(1), view_by_v(), base().comparator())
            .with_batch_size(1)
            .with_progress(checkpoints);
        let effects = resumed.step(&scan, ts(100));

        assert!(resumed.is_finished());
        assert_eq!(resumed.stats().rows_scanned, 1);
        assert_eq!(inserted(&effects).len(), 1);
        assert_eq!(effects.last(), Some(&Effect::MarkViewBuilt(ViewId::new(1))));
    }
}
