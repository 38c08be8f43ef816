//! In-memory base table.
//!
//! Rows are kept raw, exactly as written, next to the row, range and
//! partition tombstones of their partition. Reads shadow rows on the fly,
//! the way a storage engine merges data with tombstones during a read, so
//! a partition scan can report both the rows and the deletions covering
//! them.

use std::collections::{BTreeMap, VecDeque};

use basalt_types::Timestamp;
use basalt_view::{
    BaseChange, BaseRowState, BaseScan, BaseSchema, Bound, ClusteringComparator, ClusteringKey,
    PartitionKey, PartitionUpdate, RangeTombstone, RowDiff, ScanFragment,
};

/// One modification of a base table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BaseWrite {
    /// Merges the row's marker and cells into the stored row.
    Upsert(BaseRowState),
    DeleteRow {
        partition_key: PartitionKey,
        clustering_key: ClusteringKey,
        timestamp: Timestamp,
    },
    DeleteRange {
        partition_key: PartitionKey,
        range: RangeTombstone,
    },
    DeletePartition {
        partition_key: PartitionKey,
        timestamp: Timestamp,
    },
}

impl BaseWrite {
    pub fn partition_key(&self) -> &PartitionKey {
        match self {
            BaseWrite::Upsert(row) => &row.partition_key,
            BaseWrite::DeleteRow { partition_key, .. }
            | BaseWrite::DeleteRange { partition_key, .. }
            | BaseWrite::DeletePartition { partition_key, .. } => partition_key,
        }
    }
}

#[derive(Debug, Clone, Default)]
struct BasePartition {
    deletion: Option<Timestamp>,
    ranges: Vec<RangeTombstone>,
    /// Raw rows, sorted by the table's clustering order.
    rows: Vec<BaseRowState>,
}

impl BasePartition {
    fn deletion_at(&self, key: &ClusteringKey, cmp: &ClusteringComparator) -> Option<Timestamp> {
        self.ranges
            .iter()
            .filter(|range| range.covers(key.components(), cmp))
            .map(|range| range.deletion)
            .chain(self.deletion)
            .max()
    }

    fn position(&self, key: &ClusteringKey, cmp: &ClusteringComparator) -> Result<usize, usize> {
        self.rows
            .binary_search_by(|row| cmp.compare(row.clustering_key.components(), key.components()))
    }

    /// The row as a read sees it, or `None` if nothing of it survives.
    fn visible(&self, raw: &BaseRowState, cmp: &ClusteringComparator) -> Option<BaseRowState> {
        let row = raw
            .clone()
            .shadowed_by(self.deletion_at(&raw.clustering_key, cmp));
        (!row.is_empty()).then_some(row)
    }

    fn row(&self, key: &ClusteringKey, cmp: &ClusteringComparator) -> Option<BaseRowState> {
        let index = self.position(key, cmp).ok()?;
        self.visible(&self.rows[index], cmp)
    }

    fn upsert(&mut self, write: &BaseRowState, cmp: &ClusteringComparator) -> RowDiff {
        let before = self.row(&write.clustering_key, cmp);
        match self.position(&write.clustering_key, cmp) {
            Ok(index) => self.rows[index].merge(write),
            Err(index) => self.rows.insert(index, write.clone()),
        }
        let after = self.row(&write.clustering_key, cmp);
        let timestamp = write.max_timestamp().unwrap_or(Timestamp::MIN);
        RowDiff::new(before, after, timestamp)
    }

    /// Adds a range tombstone and reports every row it changed.
    fn delete_range(&mut self, range: RangeTombstone, cmp: &ClusteringComparator) -> Vec<RowDiff> {
        let covered: Vec<(ClusteringKey, Option<BaseRowState>)> = self
            .rows
            .iter()
            .filter(|row| range.covers(row.clustering_key.components(), cmp))
            .map(|row| (row.clustering_key.clone(), self.visible(row, cmp)))
            .collect();
        let deletion = range.deletion;
        self.ranges.push(range);
        self.diffs(covered, deletion, cmp)
    }

    fn delete_partition(&mut self, deletion: Timestamp, cmp: &ClusteringComparator) -> Vec<RowDiff> {
        let covered: Vec<(ClusteringKey, Option<BaseRowState>)> = self
            .rows
            .iter()
            .map(|row| (row.clustering_key.clone(), self.visible(row, cmp)))
            .collect();
        self.deletion = Some(self.deletion.map_or(deletion, |d| d.max(deletion)));
        self.diffs(covered, deletion, cmp)
    }

    fn diffs(
        &self,
        covered: Vec<(ClusteringKey, Option<BaseRowState>)>,
        deletion: Timestamp,
        cmp: &ClusteringComparator,
    ) -> Vec<RowDiff> {
        covered
            .into_iter()
            .filter_map(|(key, before)| {
                let before = before?;
                let after = self.row(&key, cmp);
                (after.as_ref() != Some(&before)).then(|| RowDiff::new(Some(before), after, deletion))
            })
            .collect()
    }
}

/// A set of writes applied to copies of the partitions they touch, not yet
/// visible to readers.
#[derive(Debug)]
pub struct StagedWrite {
    partitions: BTreeMap<PartitionKey, BasePartition>,
    /// One update per statement, in statement order.
    pub updates: Vec<PartitionUpdate>,
}

/// One base table.
#[derive(Debug, Clone)]
pub struct BaseTable {
    schema: BaseSchema,
    comparator: ClusteringComparator,
    partitions: BTreeMap<PartitionKey, BasePartition>,
}

impl BaseTable {
    pub fn new(schema: BaseSchema) -> Self {
        Self {
            comparator: schema.comparator(),
            schema,
            partitions: BTreeMap::new(),
        }
    }

    pub fn schema(&self) -> &BaseSchema {
        &self.schema
    }

    pub fn comparator(&self) -> &ClusteringComparator {
        &self.comparator
    }

    /// Installs an altered schema. The primary key never changes under an
    /// accepted alteration, so stored rows stay in order.
    pub fn set_schema(&mut self, schema: BaseSchema) {
        self.comparator = schema.comparator();
        self.schema = schema;
    }

    /// The row as a read at this moment sees it.
    pub fn row(&self, partition_key: &PartitionKey, clustering_key: &ClusteringKey) -> Option<BaseRowState> {
        self.partitions
            .get(partition_key)?
            .row(clustering_key, &self.comparator)
    }

    /// Visible rows of one partition, in clustering order.
    pub fn partition_rows(&self, partition_key: &PartitionKey) -> Vec<BaseRowState> {
        let Some(partition) = self.partitions.get(partition_key) else {
            return Vec::new();
        };
        partition
            .rows
            .iter()
            .filter_map(|row| partition.visible(row, &self.comparator))
            .collect()
    }

    /// Computes the effect of `writes` without applying them.
    ///
    /// Writes are applied in order, so a later write sees the earlier ones;
    /// consecutive writes to the same partition share one update.
    pub fn stage(&self, writes: &[BaseWrite]) -> StagedWrite {
        let mut partitions: BTreeMap<PartitionKey, BasePartition> = BTreeMap::new();
        let mut updates: Vec<PartitionUpdate> = Vec::new();

        for write in writes {
            let partition_key = write.partition_key().clone();
            let partition = partitions.entry(partition_key.clone()).or_insert_with(|| {
                self.partitions
                    .get(&partition_key)
                    .cloned()
                    .unwrap_or_default()
            });
            let change = match write {
                BaseWrite::Upsert(row) => BaseChange::Upsert(partition.upsert(row, &self.comparator)),
                BaseWrite::DeleteRow {
                    clustering_key,
                    timestamp,
                    ..
                } => {
                    let point = clustering_key.components().to_vec();
                    let range = RangeTombstone::new(
                        Bound::Inclusive(point.clone()),
                        Bound::Inclusive(point),
                        *timestamp,
                    );
                    let before = partition.row(clustering_key, &self.comparator);
                    partition.ranges.push(range);
                    let after = partition.row(clustering_key, &self.comparator);
                    BaseChange::DeleteRow(RowDiff::new(before, after, *timestamp))
                }
                BaseWrite::DeleteRange { range, .. } => BaseChange::DeleteRange {
                    range: range.clone(),
                    affected: partition.delete_range(range.clone(), &self.comparator),
                },
                BaseWrite::DeletePartition { timestamp, .. } => BaseChange::DeletePartition {
                    deletion: *timestamp,
                    affected: partition.delete_partition(*timestamp, &self.comparator),
                },
            };

            match updates.last_mut() {
                Some(last) if last.partition_key == partition_key => last.changes.push(change),
                _ => updates.push(PartitionUpdate::new(partition_key).with_change(change)),
            }
        }

        StagedWrite {
            partitions,
            updates,
        }
    }

    /// Makes staged writes visible.
    pub fn commit(&mut self, staged: StagedWrite) {
        self.partitions.extend(staged.partitions);
    }

    /// Number of partitions holding any data or tombstone.
    pub fn partition_count(&self) -> usize {
        self.partitions.len()
    }
}

impl BaseScan for BaseTable {
    fn partitions(&self) -> Vec<PartitionKey> {
        self.partitions.keys().cloned().collect()
    }

    fn read_partition(
        &self,
        partition_key: &PartitionKey,
        after: Option<&ClusteringKey>,
    ) -> Box<dyn Iterator<Item = ScanFragment> + '_> {
        let Some(partition) = self.partitions.get(partition_key) else {
            return Box::new(std::iter::empty());
        };
        let cmp = &self.comparator;

        let mut queued: VecDeque<ScanFragment> =
            partition.deletion.map(ScanFragment::PartitionDeletion).into_iter().collect();
        let (start, mut pending): (usize, Vec<&RangeTombstone>) = match after {
            None => (0, partition.ranges.iter().collect()),
            Some(after) => {
                // A resumed scan starts with every deletion in force at the
                // resume position, including ones written since the
                // checkpoint.
                let (open, later): (Vec<_>, Vec<_>) = partition
                    .ranges
                    .iter()
                    .filter(|range| !range.ends_before(after.components(), cmp))
                    .partition(|range| !range.starts_after(after.components(), cmp));
                queued.extend(open.into_iter().cloned().map(ScanFragment::RangeTombstone));
                let start = match partition.position(after, cmp) {
                    Ok(index) => index + 1,
                    Err(index) => index,
                };
                (start, later)
            }
        };

        let mut rows = partition.rows[start..].iter();
        Box::new(std::iter::from_fn(move || {
            if queued.is_empty() {
                match rows.next() {
                    Some(row) => {
                        // A tombstone is reported where it opens, before the
                        // rows it covers.
                        let key = row.clustering_key.components();
                        let (opened, rest): (Vec<_>, Vec<_>) = std::mem::take(&mut pending)
                            .into_iter()
                            .partition(|range| range.starts_at_or_before(key, cmp));
                        pending = rest;
                        queued.extend(opened.into_iter().cloned().map(ScanFragment::RangeTombstone));
                        queued.push_back(ScanFragment::Row(row.clone()));
                    }
                    None => queued.extend(
                        pending.drain(..).cloned().map(ScanFragment::RangeTombstone),
                    ),
                }
            }
            queued.pop_front()
        }))
    }
}
