//! View table: a memtable of recent view rows over at most one flushed
//! segment on disk.
//!
//! Every key in the memtable holds the full row state, read-modify-written
//! from the segment when first touched after a flush, so the memtable always
//! wins over the segment. The segment holds one JSON entry per line; an
//! in-memory index of line extents lets a point read fetch a single entry.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{ErrorKind, Read, Seek, SeekFrom};
use std::path::PathBuf;

use basalt_types::{Timestamp, ViewId};
use basalt_view::{ClusteringComparator, ViewDefinition, ViewKey, ViewMutation, ViewRowState};
use tracing::debug;

use super::cache::RowCache;
use super::{ReadOptions, Row};
use crate::error::Result;
use crate::progress::write_atomic;

const SEGMENT_FILE: &str = "segment.jsonl";
const CACHE_CAPACITY: usize = 1024;

/// Byte range of one segment entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Extent {
    offset: u64,
    len: usize,
}

/// Row states folded from view mutations, not yet visible to readers.
#[derive(Debug, Default)]
pub struct StagedRows {
    rows: BTreeMap<ViewKey, ViewRowState>,
}

/// Stored rows of one view.
#[derive(Debug)]
pub struct ViewTable {
    view_id: ViewId,
    dir: PathBuf,
    memtable: BTreeMap<ViewKey, ViewRowState>,
    /// Where each flushed key sits in the segment. Empty before the first
    /// flush.
    index: BTreeMap<ViewKey, Extent>,
    cache: RowCache<ViewKey, ViewRowState>,
}

impl ViewTable {
    /// Creates an empty view table whose segment lives under `dir`.
    pub fn new(view_id: ViewId, dir: impl Into<PathBuf>) -> Self {
        Self {
            view_id,
            dir: dir.into(),
            memtable: BTreeMap::new(),
            index: BTreeMap::new(),
            cache: RowCache::new(CACHE_CAPACITY),
        }
    }

    pub fn view_id(&self) -> ViewId {
        self.view_id
    }

    fn segment_path(&self) -> PathBuf {
        self.dir.join(SEGMENT_FILE)
    }

    /// Applies one view mutation. Re-applying it changes nothing.
    pub fn apply(&mut self, mutation: &ViewMutation) -> Result<()> {
        let staged = self.stage(std::slice::from_ref(mutation))?;
        self.install(staged);
        Ok(())
    }

    /// Folds `mutations`, in order, into copies of the rows they touch.
    ///
    /// Reading those rows is the only fallible part of applying mutations;
    /// the table is unchanged until [`ViewTable::install`].
    pub fn stage<'a>(
        &mut self,
        mutations: impl IntoIterator<Item = &'a ViewMutation>,
    ) -> Result<StagedRows> {
        let mut staged = StagedRows::default();
        for mutation in mutations {
            let key = mutation.key();
            if !staged.rows.contains_key(key) {
                let current = match self.memtable.get(key) {
                    Some(state) => state.clone(),
                    None => self.load(key, ReadOptions::default())?.unwrap_or_default(),
                };
                staged.rows.insert(key.clone(), current);
            }
            if let Some(state) = staged.rows.get_mut(key) {
                state.apply(mutation);
            }
        }
        Ok(staged)
    }

    /// Makes staged rows visible.
    pub fn install(&mut self, staged: StagedRows) {
        for (key, state) in staged.rows {
            self.cache.remove(&key);
            self.memtable.insert(key, state);
        }
    }

    /// Every visible row, in view order: partition key, then the view's
    /// clustering order.
    pub fn scan(
        &mut self,
        view: &ViewDefinition,
        now: Timestamp,
        options: ReadOptions,
    ) -> Result<Vec<Row>> {
        let mut merged = self.read_segment()?;
        if !options.bypass_cache {
            // A cached full read warms point lookups.
            for (key, state) in merged.iter().take(CACHE_CAPACITY) {
                self.cache.insert(key.clone(), state.clone());
            }
        }
        merged.extend(self.memtable.iter().map(|(k, v)| (k.clone(), v.clone())));

        let mut rows: Vec<(ViewKey, ViewRowState)> = merged
            .into_iter()
            .filter(|(_, state)| state.is_live(view, now))
            .collect();
        let comparator = view.comparator();
        rows.sort_by(|(a, _), (b, _)| view_order(&comparator, a, b));
        Ok(rows
            .into_iter()
            .map(|(key, state)| Row::from_view(view, &key, &state.row, now))
            .collect())
    }

    /// Point lookup by view key.
    pub fn get(
        &mut self,
        view: &ViewDefinition,
        key: &ViewKey,
        now: Timestamp,
        options: ReadOptions,
    ) -> Result<Option<Row>> {
        let state = match self.memtable.get(key) {
            Some(state) => Some(state.clone()),
            None => self.load(key, options)?,
        };
        Ok(state
            .filter(|state| state.is_live(view, now))
            .map(|state| Row::from_view(view, key, &state.row, now)))
    }

    /// Writes the memtable into the segment and empties it.
    pub fn flush(&mut self) -> Result<usize> {
        if self.memtable.is_empty() {
            return Ok(0);
        }
        let mut merged = self.read_segment()?;
        let flushed = self.memtable.len();
        // A scan may have cached the segment's old state for these keys.
        for key in self.memtable.keys() {
            self.cache.remove(key);
        }
        merged.append(&mut self.memtable);
        merged.retain(|_, state| !state.is_empty());

        let mut bytes = Vec::new();
        let mut index = BTreeMap::new();
        for entry in &merged {
            let offset = bytes.len() as u64;
            serde_json::to_writer(&mut bytes, &entry)?;
            index.insert(
                entry.0.clone(),
                Extent {
                    offset,
                    len: bytes.len() - offset as usize,
                },
            );
            bytes.push(b'\n');
        }
        fs::create_dir_all(&self.dir)?;
        write_atomic(&self.segment_path(), &bytes)?;
        self.index = index;
        debug!(view_id = %self.view_id, rows = merged.len(), flushed, "view segment written");
        Ok(flushed)
    }

    /// Deletes the segment directory.
    pub fn destroy(self) -> Result<()> {
        match fs::remove_dir_all(&self.dir) {
            Err(e) if e.kind() != ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }

    fn load(&mut self, key: &ViewKey, options: ReadOptions) -> Result<Option<ViewRowState>> {
        let Some(extent) = self.index.get(key).copied() else {
            return Ok(None);
        };
        if !options.bypass_cache {
            if let Some(hit) = self.cache.get(key) {
                return Ok(Some(hit));
            }
        }
        let state = self.read_entry(extent)?;
        self.cache.insert(key.clone(), state.clone());
        Ok(Some(state))
    }

    fn read_entry(&self, extent: Extent) -> Result<ViewRowState> {
        let mut file = File::open(self.segment_path())?;
        file.seek(SeekFrom::Start(extent.offset))?;
        let mut bytes = vec![0; extent.len];
        file.read_exact(&mut bytes)?;
        let (_, state): (ViewKey, ViewRowState) = serde_json::from_slice(&bytes)?;
        Ok(state)
    }

    fn read_segment(&self) -> Result<BTreeMap<ViewKey, ViewRowState>> {
        if self.index.is_empty() {
            return Ok(BTreeMap::new());
        }
        let bytes = fs::read(self.segment_path())?;
        serde_json::Deserializer::from_slice(&bytes)
            .into_iter::<(ViewKey, ViewRowState)>()
            .map(|entry| entry.map_err(Into::into))
            .collect()
    }
}

/// Orders rows the way [`ViewTable::scan`] returns them.
fn view_order(comparator: &ClusteringComparator, a: &ViewKey, b: &ViewKey) -> Ordering {
    a.partition_key.cmp(&b.partition_key).then_with(|| {
        comparator.compare(a.clustering_key.components(), b.clustering_key.components())
    })
}
