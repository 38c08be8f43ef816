//! Main entry point for Basalt.
//!
//! The `Basalt` struct owns the catalog, the base and view tables, and the
//! view maintenance machinery around them: the write path that propagates
//! base changes into views, the queue of asynchronous view updates, and the
//! view builds that backfill new views.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use basalt_config::{BasaltConfig, Paths, ViewsConfig};
use basalt_types::{Expiry, TableId, Timestamp, Ttl, ViewId};
use basalt_view::builder::oversized_component;
use basalt_view::{
    BaseRowState, BaseSchema, Bound, BoundValue, BuildStats, Cell, ClusteringKey, ColumnDef,
    ColumnKind, ColumnOp, Command, DataType, Effect, PartitionKey, RangeTombstone, RowMarker,
    SchemaError, SelectStatement, State, UpdateMode, UpdateStatement, Value, ViewBuildTask, ViewError,
    ViewKey, ViewMetadata, ViewMutation, ViewSpec, apply_committed, normalize_select,
    normalize_update, propagate_update,
};
use tracing::{debug, info, warn};

use crate::error::{BasaltError, Result};
use crate::events::ViewEvent;
#[cfg(feature = "broadcast")]
use crate::events::ViewEvents;
use crate::progress::{BuildProgressStore, BuiltViews};
use crate::queue::{PendingUpdate, PropagationQueue, PushResult};
use crate::store::{BaseTable, BaseWrite, ReadOptions, Row, ViewTable};

/// Timestamp and TTL of a write.
///
/// Without a timestamp the write uses the current time; without a TTL it
/// uses the table's default TTL.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteOptions {
    pub timestamp: Option<Timestamp>,
    pub ttl: Option<Ttl>,
}

impl WriteOptions {
    pub fn at(timestamp: Timestamp) -> Self {
        Self {
            timestamp: Some(timestamp),
            ttl: None,
        }
    }

    pub fn with_ttl(mut self, ttl: Ttl) -> Self {
        self.ttl = Some(ttl);
        self
    }
}

/// Outcome of one pass over the running view builds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BuildReport {
    /// Builds that ran a step.
    pub stepped: usize,
    /// Builds that finished during this pass.
    pub finished: usize,
}

enum StepOutcome {
    Idle,
    Stepped,
    Finished,
}

/// State behind the `Basalt` handle.
#[derive(Debug)]
pub(crate) struct BasaltInner {
    config: ViewsConfig,
    data_dir: PathBuf,

    /// Catalog state machine.
    state: State,

    tables: BTreeMap<TableId, BaseTable>,
    views: BTreeMap<ViewId, ViewTable>,

    /// Running and finished builds.
    builds: BTreeMap<ViewId, ViewBuildTask>,
    progress: BuildProgressStore,
    built: BuiltViews,

    queue: PropagationQueue,

    /// Timestamp of the last write that asked for the current time.
    last_write: Option<Timestamp>,

    #[cfg(feature = "broadcast")]
    events: ViewEvents,
}

impl BasaltInner {
    fn table_id(&self, name: &str) -> Result<TableId> {
        self.state
            .table_by_name(name)
            .map(|schema| schema.table_id)
            .ok_or_else(|| BasaltError::TableNotFound(name.to_string()))
    }

    fn schema(&self, name: &str) -> Result<BaseSchema> {
        self.state
            .table_by_name(name)
            .cloned()
            .ok_or_else(|| BasaltError::TableNotFound(name.to_string()))
    }

    fn view(&self, name: &str) -> Result<&ViewMetadata> {
        self.state
            .view_by_name(name)
            .ok_or_else(|| BasaltError::ViewNotFound(name.to_string()))
    }

    fn next_timestamp(&mut self) -> Timestamp {
        let timestamp = Timestamp::now_monotonic(self.last_write);
        self.last_write = Some(timestamp);
        timestamp
    }

    /// Applies a catalog command: the kernel decides, then its effects run.
    fn submit(&mut self, command: Command) -> Result<()> {
        let (new_state, effects) = apply_committed(self.state.clone(), command)?;
        self.state = new_state;
        self.execute_effects(effects)
    }

    /// Executes effects produced by the kernel and by view builds.
    pub(crate) fn execute_effects(&mut self, effects: Vec<Effect>) -> Result<()> {
        for effect in effects {
            match effect {
                Effect::TableMetadataWrite(schema) => {
                    debug!(table_id = %schema.table_id, table = %schema.name, "table metadata written");
                    match self.tables.get_mut(&schema.table_id) {
                        Some(table) => table.set_schema(schema),
                        None => {
                            self.tables.insert(schema.table_id, BaseTable::new(schema));
                        }
                    }
                }
                Effect::TableMetadataDrop(table_id) => {
                    self.tables.remove(&table_id);
                    info!(%table_id, "table dropped");
                }
                Effect::ViewMetadataWrite(meta) => self.write_view_metadata(&meta)?,
                Effect::ViewMetadataDrop(view_id) => {
                    if let Some(table) = self.views.remove(&view_id) {
                        table.destroy()?;
                    }
                    info!(%view_id, "view dropped");
                    self.notify(ViewEvent::Dropped { view_id });
                }
                Effect::StartViewBuild(view_id) => self.start_build(view_id)?,
                Effect::CancelViewBuild(view_id) => {
                    self.builds.remove(&view_id);
                    self.progress.remove_view(view_id)?;
                    self.built.remove(view_id)?;
                    let discarded = self.queue.discard_view(view_id);
                    debug!(%view_id, discarded, "view build cancelled");
                }
                Effect::PersistBuildProgress(progress) => {
                    debug!(
                        view_id = %progress.view_id,
                        partition = %progress.partition_key,
                        position = %progress.last_position,
                        "saving view build progress"
                    );
                    self.progress.save(progress)?;
                }
                Effect::ClearBuildProgress {
                    view_id,
                    partition_key,
                } => self.progress.remove(view_id, &partition_key)?,
                Effect::MarkViewBuilt(view_id) => {
                    self.built.mark_built(view_id)?;
                    info!(%view_id, "view build finished");
                    self.notify(ViewEvent::Built { view_id });
                }
                Effect::ApplyViewMutations {
                    view_id,
                    mutations,
                } => apply_mutations(&mut self.views, view_id, &mutations)?,
            }
        }
        Ok(())
    }

    fn write_view_metadata(&mut self, meta: &ViewMetadata) -> Result<()> {
        let view_id = meta.view_id;
        let name = meta.definition.name();
        if !self.views.contains_key(&view_id) {
            let dir = Paths::segment_dir(&self.data_dir, name);
            self.views.insert(view_id, ViewTable::new(view_id, dir));
            info!(%view_id, view = name, base_table = %meta.base_table, "view created");
            self.notify(ViewEvent::Created {
                view_id,
                name: name.to_string(),
            });
            return Ok(());
        }

        debug!(%view_id, view = name, mode = ?meta.definition.update_mode(), "view metadata written");
        if let Some(task) = self.builds.get_mut(&view_id) {
            task.set_view(meta.definition.clone());
        }
        // Updates already queued for the view land before any synchronous one.
        if meta.definition.update_mode() == UpdateMode::Synchronous && !self.queue.is_empty() {
            self.drain_queue()?;
        }
        Ok(())
    }

    fn start_build(&mut self, view_id: ViewId) -> Result<()> {
        let meta = self
            .state
            .get_view(&view_id)
            .cloned()
            .ok_or(ViewError::ViewNotFound(view_id))?;
        // A view with this ID never existed before, so anything recorded
        // for it is stale.
        self.progress.remove_view(view_id)?;
        self.built.remove(view_id)?;

        let task = self.new_build_task(&meta)?;
        info!(%view_id, view = meta.definition.name(), "starting view build");
        self.builds.insert(view_id, task);
        Ok(())
    }

    fn new_build_task(&self, meta: &ViewMetadata) -> Result<ViewBuildTask> {
        let base = self.tables.get(&meta.base_table).ok_or_else(|| {
            BasaltError::internal(format!("no storage for table {}", meta.base_table))
        })?;
        Ok(
            ViewBuildTask::new(meta.view_id, meta.definition.clone(), base.comparator().clone())
                .with_batch_size(self.config.build_batch_size)
                .with_max_key_size(self.config.max_key_size),
        )
    }

    /// Applies base writes to one table and maintains its views.
    ///
    /// View updates for every view are computed and checked first; a write
    /// that would give any view an oversized key changes nothing.
    fn write(&mut self, table_id: TableId, writes: &[BaseWrite]) -> Result<()> {
        let now = Timestamp::now();
        let table = self.tables.get(&table_id).ok_or_else(|| {
            BasaltError::internal(format!("no storage for table {table_id}"))
        })?;
        let staged = table.stage(writes);

        let limit = self.config.max_key_size;
        let mut pending = Vec::new();
        for meta in self.state.views_of(table_id) {
            let view = &meta.definition;
            for update in &staged.updates {
                let mutations =
                    propagate_update(view, update, now, self.config.propagation_chunk_size);
                if mutations.is_empty() {
                    continue;
                }
                for mutation in mutations.iter().filter(|m| !m.is_delete()) {
                    if let Some((column, size)) = oversized_component(view, mutation.key(), limit)
                    {
                        warn!(
                            view = view.name(),
                            column,
                            size,
                            limit,
                            "rejecting base write: view key component too large"
                        );
                        return Err(ViewError::OversizedKey {
                            column: column.to_string(),
                            size,
                            limit,
                        }
                        .into());
                    }
                }
                pending.push((
                    view.update_mode(),
                    PendingUpdate {
                        view_id: meta.view_id,
                        partition_key: update.partition_key.clone(),
                        mutations,
                    },
                ));
            }
        }

        // Make room before committing, so a stalled queue rejects the write
        // instead of leaving the views behind.
        let queued = pending
            .iter()
            .filter(|(mode, _)| *mode == UpdateMode::Asynchronous)
            .count();
        if queued > self.queue.remaining() {
            self.drain_queue()?;
        }
        // The queue is empty now, so applying everything inline keeps order.
        let overflow = queued > self.queue.remaining();
        if overflow {
            warn!(
                queued,
                remaining = self.queue.remaining(),
                "view update queue is full, forcing view updates to be synchronous"
            );
        }

        let mut inline: BTreeMap<ViewId, Vec<ViewMutation>> = BTreeMap::new();
        let mut deferred = Vec::new();
        for (mode, update) in pending {
            if mode == UpdateMode::Synchronous || overflow {
                inline.entry(update.view_id).or_default().extend(update.mutations);
            } else {
                deferred.push(update);
            }
        }

        // Reading the view rows is the last step that can fail; it happens
        // before the base write becomes visible.
        let mut staged_views = Vec::with_capacity(inline.len());
        for (view_id, mutations) in &inline {
            match self.views.get_mut(view_id) {
                Some(view) => staged_views.push((*view_id, view.stage(mutations)?)),
                None => debug!(%view_id, "view no longer exists, dropping its updates"),
            }
        }
        for update in deferred {
            if let PushResult::Backpressure(update) = self.queue.try_push(update) {
                return Err(BasaltError::internal(format!(
                    "view update queue refused an update for view {} after making room",
                    update.view_id
                )));
            }
        }

        if let Some(table) = self.tables.get_mut(&table_id) {
            table.commit(staged);
        }
        for (view_id, rows) in staged_views {
            if let Some(view) = self.views.get_mut(&view_id) {
                view.install(rows);
            }
        }
        Ok(())
    }

    fn drain_queue(&mut self) -> Result<usize> {
        let views = &mut self.views;
        let applied = self
            .queue
            .drain(|update| apply_mutations(views, update.view_id, &update.mutations))?;
        if applied > 0 {
            debug!(applied, "applied queued view updates");
        }
        Ok(applied)
    }

    #[cfg(feature = "broadcast")]
    fn notify(&self, event: ViewEvent) {
        self.events.send(event);
    }

    #[cfg(not(feature = "broadcast"))]
    #[allow(clippy::unused_self)]
    fn notify(&self, _event: ViewEvent) {}
}

fn apply_mutations(
    views: &mut BTreeMap<ViewId, ViewTable>,
    view_id: ViewId,
    mutations: &[ViewMutation],
) -> Result<()> {
    let Some(table) = views.get_mut(&view_id) else {
        debug!(%view_id, mutations = mutations.len(), "view no longer exists, dropping its updates");
        return Ok(());
    };
    for mutation in mutations {
        table.apply(mutation)?;
    }
    Ok(())
}

fn update_mode(mode: basalt_config::UpdateMode) -> UpdateMode {
    match mode {
        basalt_config::UpdateMode::Synchronous => UpdateMode::Synchronous,
        basalt_config::UpdateMode::Asynchronous => UpdateMode::Asynchronous,
    }
}

// ============================================================================
// Statement Helpers
// ============================================================================

/// Resolves key restrictions into the partition key and a clustering prefix.
fn key_prefix(
    schema: &BaseSchema,
    restrictions: &[(String, Value)],
) -> Result<(PartitionKey, Vec<Value>)> {
    for (column, _) in restrictions {
        match schema.column(column) {
            None => return Err(ViewError::from(SchemaError::UnknownColumn(column.clone())).into()),
            Some(def) if !def.kind.is_primary_key() => {
                return Err(BasaltError::InvalidRequest(format!(
                    "non primary key column '{column}' cannot be restricted"
                )));
            }
            Some(_) => {}
        }
    }
    let lookup = |def: &ColumnDef| -> Result<Option<Value>> {
        let Some((_, value)) = restrictions.iter().find(|(column, _)| *column == def.name) else {
            return Ok(None);
        };
        check_type(def, value)?;
        Ok(Some(value.clone()))
    };

    let mut partition = Vec::new();
    for def in schema.partition_key() {
        let value = lookup(def)?.ok_or_else(|| {
            BasaltError::InvalidRequest(format!(
                "missing value for partition key column '{}'",
                def.name
            ))
        })?;
        partition.push(value);
    }

    let mut prefix = Vec::new();
    let mut gap: Option<&str> = None;
    for def in schema.clustering_key() {
        match (lookup(def)?, gap) {
            (Some(_), Some(missing)) => {
                return Err(BasaltError::InvalidRequest(format!(
                    "clustering column '{}' is restricted but preceding column '{missing}' is not",
                    def.name
                )));
            }
            (Some(value), None) => prefix.push(value),
            (None, _) => gap = gap.or(Some(def.name.as_str())),
        }
    }
    Ok((PartitionKey::new(partition), prefix))
}

/// Resolves a full primary key.
fn primary_key(
    schema: &BaseSchema,
    restrictions: &[(String, Value)],
) -> Result<(PartitionKey, ClusteringKey)> {
    let (partition_key, prefix) = key_prefix(schema, restrictions)?;
    if let Some(missing) = schema.clustering_key().nth(prefix.len()) {
        return Err(BasaltError::InvalidRequest(format!(
            "missing value for clustering column '{}'",
            missing.name
        )));
    }
    Ok((partition_key, ClusteringKey::new(prefix)))
}

fn check_type(def: &ColumnDef, value: &Value) -> Result<()> {
    if value.is_compatible_with(&def.data_type) {
        return Ok(());
    }
    Err(BasaltError::InvalidRequest(format!(
        "value {value} is not valid for column '{}' of type {}",
        def.name, def.data_type
    )))
}

/// The column a statement may assign: a regular column of the table.
fn writable_column<'a>(schema: &'a BaseSchema, column: &str) -> Result<&'a ColumnDef> {
    let def = schema
        .column(column)
        .ok_or_else(|| ViewError::from(SchemaError::UnknownColumn(column.to_string())))?;
    match def.kind {
        ColumnKind::Regular => Ok(def),
        ColumnKind::Static => Err(BasaltError::InvalidRequest(format!(
            "static column '{column}' cannot be written"
        ))),
        ColumnKind::PartitionKey | ColumnKind::Clustering => Err(BasaltError::InvalidRequest(
            format!("primary key column '{column}' cannot be assigned"),
        )),
    }
}

fn written(value: Value, timestamp: Timestamp, expiry: Option<Expiry>) -> Cell {
    match expiry {
        Some(expiry) => Cell::expiring(value, timestamp, expiry),
        None => Cell::live(value, timestamp),
    }
}

// ============================================================================
// Basalt
// ============================================================================

/// A Basalt database.
///
/// Cloning is cheap; clones share the same database.
///
/// # Example
///
/// ```ignore
/// use basalt::{Basalt, ReadOptions};
/// use basalt_config::BasaltConfig;
///
/// let db = Basalt::open(&BasaltConfig::testing("./data"))?;
/// db.create_table(schema)?;
/// db.create_view("t", ViewSpec::new("by_v").with_partition_key(["v"])
///     .with_clustering_key(["p"]).with_key_not_null())?;
/// db.run_builds()?;
///
/// db.insert("t", [("p", Value::Int(1)), ("v", Value::from("cat"))])?;
/// let rows = db.scan_view("by_v", ReadOptions::default())?;
/// ```
#[derive(Debug, Clone)]
pub struct Basalt {
    inner: Arc<RwLock<BasaltInner>>,
}

impl Basalt {
    /// Opens a database in `config.database.data_dir`, creating the directory
    /// if needed. Build bookkeeping left by an earlier process is read back.
    pub fn open(config: &BasaltConfig) -> Result<Self> {
        config.validate()?;
        let data_dir = config.database.data_dir.clone();
        std::fs::create_dir_all(&data_dir)?;

        let progress = BuildProgressStore::open(Paths::build_progress_file(&data_dir))?;
        let built = BuiltViews::open(Paths::built_views_file(&data_dir))?;
        let queue = PropagationQueue::new(
            config.views.queue_capacity,
            config.views.max_apply_attempts,
        );
        info!(
            data_dir = %data_dir.display(),
            saved_checkpoints = progress.len(),
            "opened database"
        );

        let inner = BasaltInner {
            config: config.views.clone(),
            data_dir,
            state: State::new(),
            tables: BTreeMap::new(),
            views: BTreeMap::new(),
            builds: BTreeMap::new(),
            progress,
            built,
            queue,
            last_write: None,
            #[cfg(feature = "broadcast")]
            events: ViewEvents::default(),
        };
        Ok(Self {
            inner: Arc::new(RwLock::new(inner)),
        })
    }

    fn read_lock(&self) -> Result<RwLockReadGuard<'_, BasaltInner>> {
        self.inner
            .read()
            .map_err(|_| BasaltError::internal("lock poisoned"))
    }

    fn write_lock(&self) -> Result<RwLockWriteGuard<'_, BasaltInner>> {
        self.inner
            .write()
            .map_err(|_| BasaltError::internal("lock poisoned"))
    }

    // ========================================================================
    // Catalog
    // ========================================================================

    /// Submits a catalog command to the kernel and executes its effects.
    pub fn submit(&self, command: Command) -> Result<()> {
        self.write_lock()?.submit(command)
    }

    /// The catalog as it stands.
    pub fn catalog(&self) -> Result<State> {
        Ok(self.read_lock()?.state.clone())
    }

    pub fn create_table(&self, schema: BaseSchema) -> Result<TableId> {
        let table_id = schema.table_id;
        self.submit(Command::create_table(schema))?;
        Ok(table_id)
    }

    /// Replaces a table's schema. Rejected unless every view of the table
    /// accepts it.
    pub fn alter_table(&self, schema: BaseSchema) -> Result<()> {
        self.submit(Command::AlterTable { schema })
    }

    pub fn drop_table(&self, name: &str) -> Result<()> {
        let mut inner = self.write_lock()?;
        let table_id = inner.table_id(name)?;
        inner.submit(Command::DropTable { table_id })
    }

    /// Creates a view of `table` and starts building it. A spec without an
    /// update mode gets the configured default.
    pub fn create_view(&self, table: &str, mut spec: ViewSpec) -> Result<ViewId> {
        let mut inner = self.write_lock()?;
        let base_table = inner.table_id(table)?;
        if spec.update_mode.is_none() {
            spec.update_mode = Some(update_mode(inner.config.default_update_mode));
        }
        let view_id = inner.state.next_view_id();
        inner.submit(Command::create_view(view_id, base_table, spec))?;
        Ok(view_id)
    }

    pub fn alter_view_mode(&self, name: &str, mode: UpdateMode) -> Result<()> {
        let mut inner = self.write_lock()?;
        let view_id = inner.view(name)?.view_id;
        inner.submit(Command::AlterViewMode { view_id, mode })
    }

    /// Drops a view. Its build stops and its queued updates are discarded.
    pub fn drop_view(&self, name: &str) -> Result<()> {
        let mut inner = self.write_lock()?;
        let view_id = inner.view(name)?.view_id;
        inner.submit(Command::DropView { view_id })
    }

    // ========================================================================
    // Writes
    // ========================================================================

    /// Applies one base write and maintains the table's views.
    pub fn write(&self, table: &str, write: BaseWrite) -> Result<()> {
        self.write_batch(table, vec![write])
    }

    /// Applies base writes in order as one batch. Either every write is
    /// applied or none is.
    pub fn write_batch(&self, table: &str, writes: Vec<BaseWrite>) -> Result<()> {
        let mut inner = self.write_lock()?;
        let schema = inner.schema(table)?;
        let partition_width = schema.partition_key().count();
        if let Some(bad) = writes
            .iter()
            .find(|w| w.partition_key().components().len() != partition_width)
        {
            return Err(BasaltError::InvalidRequest(format!(
                "partition key {} does not match table '{table}'",
                bad.partition_key()
            )));
        }
        inner.write(schema.table_id, &writes)
    }

    /// `INSERT`: writes a row marker and the given cells.
    pub fn insert<I, S>(&self, table: &str, columns: I) -> Result<()>
    where
        I: IntoIterator<Item = (S, Value)>,
        S: Into<String>,
    {
        self.insert_with(table, columns, WriteOptions::default())
    }

    pub fn insert_with<I, S>(&self, table: &str, columns: I, options: WriteOptions) -> Result<()>
    where
        I: IntoIterator<Item = (S, Value)>,
        S: Into<String>,
    {
        let mut inner = self.write_lock()?;
        let schema = inner.schema(table)?;

        let (key, cells): (Vec<(String, Value)>, Vec<(String, Value)>) = columns
            .into_iter()
            .map(|(column, value)| (column.into(), value))
            .partition(|(column, _)| {
                schema
                    .column(column)
                    .is_some_and(|def| def.kind.is_primary_key())
            });
        let (partition_key, clustering_key) = primary_key(&schema, &key)?;

        let now = Timestamp::now();
        let timestamp = match options.timestamp {
            Some(timestamp) => timestamp,
            None => inner.next_timestamp(),
        };
        let expiry = options
            .ttl
            .or(schema.default_ttl)
            .map(|ttl| Expiry::new(ttl, now));

        let marker = match expiry {
            Some(expiry) => RowMarker::expiring(timestamp, expiry),
            None => RowMarker::new(timestamp),
        };
        let mut row = BaseRowState::new(partition_key, clustering_key).with_marker(marker);
        for (column, value) in cells {
            check_type(writable_column(&schema, &column)?, &value)?;
            row = row.with_cell(column, written(value, timestamp, expiry));
        }
        inner.write(schema.table_id, &[BaseWrite::Upsert(row)])
    }

    /// `UPDATE`, with unset bind values resolved first. An update left with
    /// no assignment writes nothing.
    pub fn update(&self, table: &str, stmt: &UpdateStatement, values: &[BoundValue]) -> Result<()> {
        let mut inner = self.write_lock()?;
        let schema = inner.schema(table)?;
        let update = normalize_update(stmt, values, schema.default_ttl)?;
        if update.ops.is_empty() {
            debug!(table, "update assigns no column, nothing to write");
            return Ok(());
        }
        let (partition_key, clustering_key) = primary_key(&schema, &update.key)?;

        let now = Timestamp::now();
        let timestamp = match update.timestamp {
            Some(timestamp) => timestamp,
            None => inner.next_timestamp(),
        };
        let expiry = update.ttl.map(|ttl| Expiry::new(ttl, now));
        let current = inner
            .tables
            .get(&schema.table_id)
            .and_then(|t| t.row(&partition_key, &clustering_key));
        let current_value = |column: &str| {
            current
                .as_ref()
                .and_then(|row| row.live_value(column, now))
                .cloned()
        };

        let mut row = BaseRowState::new(partition_key, clustering_key);
        for (column, op) in update.ops {
            let def = writable_column(&schema, &column)?;
            let cell = match op {
                ColumnOp::Set(value) => {
                    check_type(def, &value)?;
                    written(value, timestamp, expiry)
                }
                ColumnOp::Delete => Cell::tombstone(timestamp),
                ColumnOp::CounterAdd(delta) => {
                    if def.data_type != DataType::Counter {
                        return Err(BasaltError::InvalidRequest(format!(
                            "cannot increment non-counter column '{column}'"
                        )));
                    }
                    let total = current_value(&column)
                        .and_then(|v| v.as_bigint())
                        .unwrap_or(0)
                        .saturating_add(delta);
                    Cell::live(Value::Counter(total), timestamp)
                }
                ColumnOp::ListAppend(items) => {
                    let mut list = current_value(&column)
                        .and_then(|v| v.as_list().map(<[Value]>::to_vec))
                        .unwrap_or_default();
                    list.extend(items);
                    let value = Value::List(list);
                    check_type(def, &value)?;
                    written(value, timestamp, expiry)
                }
            };
            row = row.with_cell(column, cell);
        }
        inner.write(schema.table_id, &[BaseWrite::Upsert(row)])
    }

    /// `DELETE`: a full primary key deletes the row, a clustering prefix
    /// deletes that range, and a bare partition key deletes the partition.
    pub fn delete<I, S>(&self, table: &str, key: I) -> Result<()>
    where
        I: IntoIterator<Item = (S, Value)>,
        S: Into<String>,
    {
        let mut inner = self.write_lock()?;
        let schema = inner.schema(table)?;
        let key: Vec<(String, Value)> = key
            .into_iter()
            .map(|(column, value)| (column.into(), value))
            .collect();
        let (partition_key, prefix) = key_prefix(&schema, &key)?;
        let timestamp = inner.next_timestamp();

        let write = if prefix.is_empty() {
            BaseWrite::DeletePartition {
                partition_key,
                timestamp,
            }
        } else if prefix.len() == schema.clustering_key().count() {
            BaseWrite::DeleteRow {
                partition_key,
                clustering_key: ClusteringKey::new(prefix),
                timestamp,
            }
        } else {
            BaseWrite::DeleteRange {
                partition_key,
                range: RangeTombstone::new(
                    Bound::Inclusive(prefix.clone()),
                    Bound::Inclusive(prefix),
                    timestamp,
                ),
            }
        };
        inner.write(schema.table_id, &[write])
    }

    // ========================================================================
    // Reads
    // ========================================================================

    /// `SELECT` from one base partition, optionally narrowed by a
    /// clustering prefix.
    pub fn select(&self, table: &str, stmt: &SelectStatement, values: &[BoundValue]) -> Result<Vec<Row>> {
        let inner = self.read_lock()?;
        let schema = inner.schema(table)?;
        let select = normalize_select(stmt, values)?;
        let (partition_key, prefix) = key_prefix(&schema, &select.restrictions)?;

        let now = Timestamp::now();
        let Some(base) = inner.tables.get(&schema.table_id) else {
            return Ok(Vec::new());
        };
        Ok(base
            .partition_rows(&partition_key)
            .into_iter()
            .filter(|row| row.is_live(now))
            .filter(|row| row.clustering_key.components().starts_with(&prefix))
            .take(select.limit.unwrap_or(usize::MAX))
            .map(|row| Row::from_base(&schema, &row, now))
            .collect())
    }

    /// Every live row of a view, in view order.
    pub fn scan_view(&self, name: &str, options: ReadOptions) -> Result<Vec<Row>> {
        let mut inner = self.write_lock()?;
        let meta = inner.view(name)?.clone();
        let table = inner
            .views
            .get_mut(&meta.view_id)
            .ok_or_else(|| BasaltError::internal(format!("no storage for view {name}")))?;
        table.scan(&meta.definition, Timestamp::now(), options)
    }

    /// Point lookup of one view row.
    pub fn get_view_row(&self, name: &str, key: &ViewKey, options: ReadOptions) -> Result<Option<Row>> {
        let mut inner = self.write_lock()?;
        let meta = inner.view(name)?.clone();
        let table = inner
            .views
            .get_mut(&meta.view_id)
            .ok_or_else(|| BasaltError::internal(format!("no storage for view {name}")))?;
        table.get(&meta.definition, key, Timestamp::now(), options)
    }

    /// Writes every view's recent rows to its segment on disk. Returns the
    /// number of rows written.
    pub fn flush(&self) -> Result<usize> {
        let mut inner = self.write_lock()?;
        let mut flushed = 0;
        for table in inner.views.values_mut() {
            flushed += table.flush()?;
        }
        debug!(flushed, "flushed view tables");
        Ok(flushed)
    }

    // ========================================================================
    // Background Maintenance
    // ========================================================================

    /// Applies queued asynchronous view updates, oldest first. Returns how
    /// many were applied.
    pub fn process_queue(&self) -> Result<usize> {
        self.write_lock()?.drain_queue()
    }

    /// Asynchronous view updates not yet applied.
    pub fn pending_updates(&self) -> Result<usize> {
        Ok(self.read_lock()?.queue.len())
    }

    /// Runs one step of every unfinished view build.
    pub fn step_builds(&self) -> Result<BuildReport> {
        let running: Vec<ViewId> = self
            .read_lock()?
            .builds
            .iter()
            .filter(|(_, task)| !task.is_finished())
            .map(|(view_id, _)| *view_id)
            .collect();

        let mut report = BuildReport::default();
        for view_id in running {
            match self.step_view(view_id)? {
                StepOutcome::Idle => {}
                StepOutcome::Stepped => report.stepped += 1,
                StepOutcome::Finished => {
                    report.stepped += 1;
                    report.finished += 1;
                }
            }
        }
        Ok(report)
    }

    /// Steps every build until none has work left.
    pub fn run_builds(&self) -> Result<()> {
        while self.step_builds()?.stepped > 0 {}
        Ok(())
    }

    /// Runs one step of one view's build. Returns true once the build is
    /// finished.
    pub fn step_build(&self, name: &str) -> Result<bool> {
        let view_id = self.read_lock()?.view(name)?.view_id;
        match self.step_view(view_id)? {
            StepOutcome::Finished => Ok(true),
            StepOutcome::Stepped => Ok(false),
            StepOutcome::Idle => self.is_built(name),
        }
    }

    /// Steps a build against the live base table. A step reads at most one
    /// batch of rows, so the lock is held for a bounded time.
    fn step_view(&self, view_id: ViewId) -> Result<StepOutcome> {
        let mut guard = self.write_lock()?;
        let inner = &mut *guard;
        let Some(task) = inner.builds.get_mut(&view_id) else {
            return Ok(StepOutcome::Idle);
        };
        if task.is_finished() {
            return Ok(StepOutcome::Idle);
        }
        let base_table = task.view().base_table();
        let table = inner.tables.get(&base_table).ok_or_else(|| {
            BasaltError::internal(format!("no storage for table {base_table}"))
        })?;

        let effects = task.step(table, Timestamp::now());
        let finished = task.is_finished();
        let stats = task.stats();

        inner.execute_effects(effects)?;
        inner.notify(ViewEvent::BuildProgressed {
            view_id,
            rows_scanned: stats.rows_scanned,
            rows_built: stats.rows_built,
        });

        Ok(if finished {
            StepOutcome::Finished
        } else {
            StepOutcome::Stepped
        })
    }

    /// Replaces a view's build with one resumed from its saved checkpoints,
    /// the way a restarted process picks it up. Does nothing for a built
    /// view.
    pub fn restart_build(&self, name: &str) -> Result<()> {
        let mut inner = self.write_lock()?;
        let meta = inner.view(name)?.clone();
        let view_id = meta.view_id;
        if inner.built.is_built(view_id) {
            return Ok(());
        }

        let checkpoints = inner.progress.load(view_id);
        info!(%view_id, view = name, checkpoints = checkpoints.len(), "resuming view build");
        let task = inner.new_build_task(&meta)?.with_progress(checkpoints);
        inner.builds.insert(view_id, task);
        Ok(())
    }

    pub fn is_built(&self, name: &str) -> Result<bool> {
        let inner = self.read_lock()?;
        let view_id = inner.view(name)?.view_id;
        Ok(inner.built.is_built(view_id))
    }

    /// Counters of the view's current build, if it has one.
    pub fn build_stats(&self, name: &str) -> Result<Option<BuildStats>> {
        let inner = self.read_lock()?;
        let view_id = inner.view(name)?.view_id;
        Ok(inner
            .builds
            .get(&view_id)
            .map(ViewBuildTask::stats))
    }

    /// Receives view lifecycle events sent after this call.
    #[cfg(feature = "broadcast")]
    pub fn subscribe(&self) -> Result<tokio::sync::broadcast::Receiver<ViewEvent>> {
        Ok(self.read_lock()?.events.subscribe())
    }
}
