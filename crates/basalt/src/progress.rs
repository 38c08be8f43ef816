//! Durable view build bookkeeping: per-partition checkpoints of running
//! builds, and the set of views whose build has finished.
//!
//! Both are small JSON files rewritten whole on every change.

use std::collections::BTreeSet;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use basalt_types::ViewId;
use basalt_view::{BuildProgress, PartitionKey};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::Result;

fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    write_atomic(path, &serde_json::to_vec(value)?)
}

/// Replaces `path` with `bytes` via a rename, so readers never see a
/// partial file.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    fs::write(&tmp, bytes)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

fn read_json<T: DeserializeOwned + Default>(path: &Path) -> Result<T> {
    match fs::read(path) {
        Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(T::default()),
        Err(e) => Err(e.into()),
    }
}

// ============================================================================
// Build Progress
// ============================================================================

/// Checkpoints of suspended view builds, one per (view, base partition).
#[derive(Debug)]
pub struct BuildProgressStore {
    path: PathBuf,
    entries: Vec<BuildProgress>,
}

impl BuildProgressStore {
    /// Opens the store, reading any checkpoints already on disk.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let entries = read_json(&path)?;
        Ok(Self { path, entries })
    }

    /// Records a checkpoint, replacing the previous one for its partition.
    pub fn save(&mut self, progress: BuildProgress) -> Result<()> {
        match self.entries.iter_mut().find(|p| {
            p.view_id == progress.view_id && p.partition_key == progress.partition_key
        }) {
            Some(existing) => *existing = progress,
            None => self.entries.push(progress),
        }
        self.persist()
    }

    /// Checkpoints of one view.
    pub fn load(&self, view_id: ViewId) -> Vec<BuildProgress> {
        self.entries
            .iter()
            .filter(|p| p.view_id == view_id)
            .cloned()
            .collect()
    }

    /// Drops the checkpoint of a fully built partition.
    pub fn remove(&mut self, view_id: ViewId, partition_key: &PartitionKey) -> Result<()> {
        let before = self.entries.len();
        self.entries
            .retain(|p| !(p.view_id == view_id && &p.partition_key == partition_key));
        if self.entries.len() == before {
            return Ok(());
        }
        self.persist()
    }

    /// Drops every checkpoint of a view.
    pub fn remove_view(&mut self, view_id: ViewId) -> Result<()> {
        let before = self.entries.len();
        self.entries.retain(|p| p.view_id != view_id);
        if self.entries.len() == before {
            return Ok(());
        }
        self.persist()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn persist(&self) -> Result<()> {
        write_json(&self.path, &self.entries)
    }
}

// ============================================================================
// Built Views
// ============================================================================

/// Views whose build has completed.
#[derive(Debug)]
pub struct BuiltViews {
    path: PathBuf,
    views: BTreeSet<ViewId>,
}

impl BuiltViews {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let views = read_json(&path)?;
        Ok(Self { path, views })
    }

    pub fn mark_built(&mut self, view_id: ViewId) -> Result<()> {
        if self.views.insert(view_id) {
            write_json(&self.path, &self.views)?;
        }
        Ok(())
    }

    pub fn is_built(&self, view_id: ViewId) -> bool {
        self.views.contains(&view_id)
    }

    pub fn remove(&mut self, view_id: ViewId) -> Result<()> {
        if self.views.remove(&view_id) {
            write_json(&self.path, &self.views)?;
        }
        Ok(())
    }
}
