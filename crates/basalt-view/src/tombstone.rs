//! Range and partition deletions, and the deletion context a partition scan
//! threads from row to row.

use std::cmp::Ordering;

use basalt_types::Timestamp;
use serde::{Deserialize, Serialize};

use crate::schema::ClusteringOrder;
use crate::value::Value;

// ============================================================================
// Clustering Comparator
// ============================================================================

/// Orders clustering keys (or key prefixes) according to per-column order.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ClusteringComparator {
    orders: Vec<ClusteringOrder>,
}

impl ClusteringComparator {
    pub fn new(orders: Vec<ClusteringOrder>) -> Self {
        Self { orders }
    }

    pub fn orders(&self) -> &[ClusteringOrder] {
        &self.orders
    }

    /// Compares two keys component by component. When one is a prefix of the
    /// other they compare equal; bounds use this to cover whole prefixes.
    pub fn compare_prefix(&self, a: &[Value], b: &[Value]) -> Ordering {
        for (i, (x, y)) in a.iter().zip(b).enumerate() {
            let ordering = x.cmp(y);
            let ordering = match self.orders.get(i).copied().unwrap_or_default() {
                ClusteringOrder::Asc => ordering,
                ClusteringOrder::Desc => ordering.reverse(),
            };
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        Ordering::Equal
    }

    /// Total order over full keys; shorter keys sort first on a shared prefix.
    pub fn compare(&self, a: &[Value], b: &[Value]) -> Ordering {
        self.compare_prefix(a, b).then_with(|| a.len().cmp(&b.len()))
    }
}

// ============================================================================
// Range Tombstones
// ============================================================================

/// One end of a clustering range, expressed as a key prefix.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Bound {
    Unbounded,
    Inclusive(Vec<Value>),
    Exclusive(Vec<Value>),
}

/// Deletion of every row whose clustering key falls between `start` and
/// `end` (in clustering order) written at or before `deletion`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RangeTombstone {
    pub start: Bound,
    pub end: Bound,
    pub deletion: Timestamp,
}

impl RangeTombstone {
    pub fn new(start: Bound, end: Bound, deletion: Timestamp) -> Self {
        Self {
            start,
            end,
            deletion,
        }
    }

    /// True if `key` is at or after the start bound.
    pub fn starts_at_or_before(&self, key: &[Value], cmp: &ClusteringComparator) -> bool {
        match &self.start {
            Bound::Unbounded => true,
            Bound::Inclusive(prefix) => cmp.compare_prefix(key, prefix) != Ordering::Less,
            Bound::Exclusive(prefix) => cmp.compare_prefix(key, prefix) == Ordering::Greater,
        }
    }

    /// True if the range has closed before reaching `key`.
    pub fn ends_before(&self, key: &[Value], cmp: &ClusteringComparator) -> bool {
        match &self.end {
            Bound::Unbounded => false,
            Bound::Inclusive(prefix) => cmp.compare_prefix(key, prefix) == Ordering::Greater,
            Bound::Exclusive(prefix) => cmp.compare_prefix(key, prefix) != Ordering::Less,
        }
    }

    pub fn covers(&self, key: &[Value], cmp: &ClusteringComparator) -> bool {
        self.starts_at_or_before(key, cmp) && !self.ends_before(key, cmp)
    }

    /// True if the range opens strictly after `key`, i.e. a scan resuming
    /// after `key` has not seen it yet.
    pub fn starts_after(&self, key: &[Value], cmp: &ClusteringComparator) -> bool {
        match &self.start {
            Bound::Unbounded => false,
            Bound::Inclusive(prefix) => cmp.compare_prefix(prefix, key) == Ordering::Greater,
            Bound::Exclusive(prefix) => cmp.compare_prefix(prefix, key) != Ordering::Less,
        }
    }
}

// ============================================================================
// Range Deletion Context
// ============================================================================

/// The deletions open at some clustering position of a partition scan.
///
/// This is an immutable value: every transition returns a new context. A
/// suspended view build persists it and the resumed build starts from it,
/// so a tombstone opened before the suspension point still shadows the rows
/// after it.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RangeDeletionContext {
    partition_deletion: Option<Timestamp>,
    open: Vec<RangeTombstone>,
}

impl RangeDeletionContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn partition_deletion(&self) -> Option<Timestamp> {
        self.partition_deletion
    }

    pub fn open_ranges(&self) -> &[RangeTombstone] {
        &self.open
    }

    pub fn is_empty(&self) -> bool {
        self.partition_deletion.is_none() && self.open.is_empty()
    }

    #[must_use]
    pub fn with_partition_deletion(&self, deletion: Timestamp) -> Self {
        let mut next = self.clone();
        next.partition_deletion = Some(
            next.partition_deletion
                .map_or(deletion, |existing| existing.max(deletion)),
        );
        next
    }

    #[must_use]
    pub fn open(&self, range: RangeTombstone) -> Self {
        let mut next = self.clone();
        if !next.open.contains(&range) {
            next.open.push(range);
        }
        next
    }

    /// Drops ranges that closed before `key`.
    #[must_use]
    pub fn close_ended_before(&self, key: &[Value], cmp: &ClusteringComparator) -> Self {
        let mut next = self.clone();
        next.open.retain(|range| !range.ends_before(key, cmp));
        next
    }

    /// The newest deletion covering `key`, if any.
    pub fn deletion_at(&self, key: &[Value], cmp: &ClusteringComparator) -> Option<Timestamp> {
        self.open
            .iter()
            .filter(|range| range.covers(key, cmp))
            .map(|range| range.deletion)
            .chain(self.partition_deletion)
            .max()
    }
}
