//! Unit of work over one SQLite transaction.
//!
//! # Responsibility
//! - Track every instance loaded or persisted through the session in an
//!   identity map keyed by (table, id).
//! - Reconcile tracked state with the database on flush: minimal UPDATEs of
//!   dirty instances, deferred DELETEs, version checks.
//! - Own lock acquisition and the stale-after-bulk bookkeeping.
//!
//! # Invariants
//! - At most one tracked instance exists per (table, id).
//! - `BeforeInsert` fires exactly once per persisted instance; `BeforeUpdate`
//!   fires on every flush that finds the instance dirty.
//! - Lazy references created by this session resolve only while the session
//!   is open and has not been cleared since.
//! - A session holds the database write lock from open to commit or rollback.
//! - Deferred DELETEs run in the order `remove` was called.
//! - Pessimistic lock rows written by a session are deleted at its commit.

use super::error::{OrmError, OrmResult};
use super::lifecycle::{Clock, LifecycleEvent, Listeners, SystemClock};
use super::managed::Managed;
use super::mapping::{Entity, EntityMeta, LoadContext, Metamodel, RowData};
use super::query::plan::{QueryKind, QueryPlan, RenderedSelect};
use super::query::{Args, BulkMode, TypedQuery};
use crate::config::{FlushMode, OrmConfig};
use crate::db::DbError;
use log::{debug, info, warn};
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, Row, Transaction, TransactionBehavior};
use std::any::Any;
use std::collections::HashMap;
use std::rc::{Rc, Weak};
use std::time::Instant;
use uuid::Uuid;

/// Loads a fetch-joined relation target into the identity map.
pub(crate) type FetchLoader =
    for<'s, 'c> fn(&'s mut Session<'c>, RowData) -> OrmResult<Box<dyn Any>>;

pub(crate) fn load_fetched<T: Entity>(
    session: &mut Session<'_>,
    row: RowData,
) -> OrmResult<Box<dyn Any>> {
    let handle = session.register_loaded::<T>(row, HashMap::new(), false)?;
    Ok(Box::new(handle))
}

/// Liveness token handed to lazy references; replaced on `clear`, dropped at
/// commit or rollback.
#[derive(Debug)]
pub(crate) struct SessionMarker;

/// Lock requested for an instance or for every row a query returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum LockMode {
    #[default]
    None,
    /// Verify the version at flush even when the instance is clean.
    Optimistic,
    /// Increment the version at flush even when the instance is clean.
    OptimisticForceIncrement,
    /// Hold the database write lock until the session ends.
    PessimisticWrite,
}

/// Statements issued by one session, by kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub queries: u64,
    pub inserts: u64,
    pub updates: u64,
    pub deletes: u64,
}

type Key = (&'static str, i64);

/// Type-erased view of a tracked `Managed<T>`.
trait Tracked {
    fn meta(&self) -> &'static EntityMeta;
    fn as_any(&self) -> &dyn Any;
    fn row(&self) -> OrmResult<RowData>;
    fn version(&self) -> OrmResult<Option<i64>>;
    fn set_version(&self, version: i64) -> OrmResult<()>;
    fn fire(&self, listeners: &Listeners, event: LifecycleEvent) -> OrmResult<()>;
}

impl<T: Entity> Tracked for Managed<T> {
    fn meta(&self) -> &'static EntityMeta {
        T::meta()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn row(&self) -> OrmResult<RowData> {
        self.read()?.write_row()
    }

    fn version(&self) -> OrmResult<Option<i64>> {
        Ok(self.read()?.version())
    }

    fn set_version(&self, version: i64) -> OrmResult<()> {
        self.write()?.set_version(version);
        Ok(())
    }

    fn fire(&self, listeners: &Listeners, event: LifecycleEvent) -> OrmResult<()> {
        listeners.fire(event, &mut *self.write()?);
        Ok(())
    }
}

struct Entry {
    handle: Box<dyn Tracked>,
    /// Last persisted state; `None` for read-only instances.
    snapshot: Option<RowData>,
    removed: bool,
    lock: LockMode,
    /// Set by bulk statements against the entity's table.
    stale: bool,
}

impl Entry {
    fn typed<T: Entity>(&self) -> Option<Managed<T>> {
        self.handle.as_any().downcast_ref::<Managed<T>>().cloned()
    }

    fn is<T: Entity>(&self, entity: &Managed<T>) -> bool {
        self.handle
            .as_any()
            .downcast_ref::<Managed<T>>()
            .is_some_and(|handle| handle.ptr_eq(entity))
    }
}

/// Opens sessions that share configuration and lifecycle listeners.
#[derive(Debug)]
pub struct SessionFactory {
    config: OrmConfig,
    metamodel: Metamodel,
    listeners: Rc<Listeners>,
}

impl SessionFactory {
    pub fn new(config: OrmConfig, metamodel: Metamodel, listeners: Listeners) -> Self {
        Self {
            config,
            metamodel,
            listeners: Rc::new(listeners),
        }
    }

    pub fn config(&self) -> &OrmConfig {
        &self.config
    }

    pub fn metamodel(&self) -> &Metamodel {
        &self.metamodel
    }

    /// Begins a write transaction on `conn` and wraps it in a new session.
    ///
    /// The database write lock is taken here, so a second writer waits up to
    /// `lock_timeout` for the current holder to commit or roll back.
    ///
    /// # Errors
    /// - `LockTimeout` when another connection keeps the write lock past
    ///   `lock_timeout`.
    pub fn open_session<'c>(&self, conn: &'c mut Connection) -> OrmResult<Session<'c>> {
        let tx = match conn.transaction_with_behavior(TransactionBehavior::Immediate) {
            Ok(tx) => tx,
            Err(err) => {
                let err = DbError::from(err);
                if !err.is_busy() {
                    return Err(err.into());
                }
                warn!(
                    "event=session_open module=session status=error error_code=lock_timeout timeout_ms={}",
                    self.config.lock_timeout.as_millis()
                );
                return Err(OrmError::LockTimeout {
                    entity: "database",
                    id: None,
                });
            }
        };
        let id = Uuid::new_v4();
        debug!("event=session_open module=session status=ok session_id={id}");
        Ok(Session {
            tx,
            id,
            marker: Rc::new(SessionMarker),
            config: self.config.clone(),
            listeners: Rc::clone(&self.listeners),
            entries: HashMap::new(),
            order: Vec::new(),
            removals: Vec::new(),
            stats: SessionStats::default(),
            opened_at: Instant::now(),
        })
    }
}

/// One unit of work. Not safe for use by more than one caller at a time.
pub struct Session<'conn> {
    tx: Transaction<'conn>,
    id: Uuid,
    marker: Rc<SessionMarker>,
    config: OrmConfig,
    listeners: Rc<Listeners>,
    entries: HashMap<Key, Entry>,
    order: Vec<Key>,
    /// Keys in the order `remove` was called; deletes flush in this order.
    removals: Vec<Key>,
    stats: SessionStats,
    opened_at: Instant,
}

impl<'conn> Session<'conn> {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn stats(&self) -> SessionStats {
        self.stats
    }

    pub fn config(&self) -> &OrmConfig {
        &self.config
    }

    /// The transaction's connection, for statements outside the mapper.
    pub fn connection(&self) -> &Connection {
        &self.tx
    }

    /// Starts a query built from a compiled plan.
    pub fn query<'s>(&'s mut self, plan: &'s QueryPlan) -> TypedQuery<'s, 'conn> {
        TypedQuery::new(self, plan)
    }

    /// Makes a transient instance persistent with an immediate INSERT.
    ///
    /// Persisting a tracked instance is a no-op (and cancels a pending
    /// removal).
    ///
    /// # Errors
    /// - `Detached` when the instance has an id but is not tracked here.
    /// - `TransientReference` when a relation points at an unsaved instance.
    pub fn persist<T: Entity>(&mut self, entity: &Managed<T>) -> OrmResult<()> {
        let meta = T::meta();
        if let Some(id) = entity.read()?.id() {
            let key = (meta.table, id);
            return match self.entries.get_mut(&key) {
                Some(entry) if entry.is(entity) => {
                    entry.removed = false;
                    self.removals.retain(|queued| *queued != key);
                    Ok(())
                }
                _ => Err(OrmError::Detached {
                    entity: meta.name,
                    id,
                    operation: "persist",
                }),
            };
        }

        self.listeners
            .fire(LifecycleEvent::BeforeInsert, &mut *entity.write()?);
        let row = entity.read()?.write_row()?;

        let mut columns = Vec::with_capacity(row.len() + 1);
        let mut values = Vec::with_capacity(row.len() + 1);
        for (column, value) in row.columns() {
            columns.push(column);
            values.push(value.clone());
        }
        if let Some(version) = meta.version {
            columns.push(version.column);
            values.push(Value::Integer(0));
        }
        let sql = if columns.is_empty() {
            format!("INSERT INTO {} DEFAULT VALUES", meta.table)
        } else {
            format!(
                "INSERT INTO {} ({}) VALUES ({})",
                meta.table,
                columns.join(", "),
                vec!["?"; columns.len()].join(", ")
            )
        };
        debug!("event=sql module=session status=start kind=insert entity={} sql=\"{sql}\"", meta.name);
        self.tx.execute(&sql, params_from_iter(values.iter()))?;
        let id = self.tx.last_insert_rowid();
        {
            let mut instance = entity.write()?;
            instance.assign_id(id);
            if meta.is_versioned() {
                instance.set_version(0);
            }
        }
        self.stats.inserts += 1;
        self.track((meta.table, id), Box::new(entity.clone()), Some(row));
        Ok(())
    }

    /// Copies a detached instance's state onto the tracked instance with the
    /// same identity and returns the tracked one.
    ///
    /// A transient instance is persisted and returned as is.
    ///
    /// # Errors
    /// - `NotFound` when no row has the instance's id.
    /// - `StaleVersion` when the detached version differs from the stored one.
    pub fn merge<T: Entity>(&mut self, entity: &Managed<T>) -> OrmResult<Managed<T>> {
        let meta = T::meta();
        let id = entity.read()?.id();
        let Some(id) = id else {
            self.persist(entity)?;
            return Ok(entity.clone());
        };
        if self
            .entries
            .get(&(meta.table, id))
            .is_some_and(|entry| entry.is(entity))
        {
            return Ok(entity.clone());
        }

        let managed = self.find::<T>(id)?.ok_or(OrmError::NotFound {
            entity: meta.name,
            id,
        })?;
        let detached_version = entity.read()?.version();
        let current_version = managed.read()?.version();
        if meta.is_versioned() && detached_version != current_version {
            warn!(
                "event=merge module=session status=error entity={} id={id} error_code=stale_version",
                meta.name
            );
            return Err(OrmError::StaleVersion {
                entity: meta.name,
                id,
                expected_version: detached_version,
            });
        }

        let mut row = entity.read()?.write_row()?;
        row.put(meta.id_column, id);
        if let (Some(version), Some(current)) = (meta.version, current_version) {
            row.put(version.column, current);
        }
        let mut ctx = LoadContext::new(Rc::downgrade(&self.marker), HashMap::new());
        let mut merged = T::read_row(&row, &mut ctx)?;
        merged.keep_unmapped(&*managed.read()?);
        *managed.write()? = merged;
        T::attach_relations(&managed)?;
        Ok(managed)
    }

    /// Looks an instance up by id, consulting the identity map first.
    ///
    /// Returns `Ok(None)` when no row exists or the instance was removed in
    /// this session.
    pub fn find<T: Entity>(&mut self, id: i64) -> OrmResult<Option<Managed<T>>> {
        let meta = T::meta();
        if let Some(entry) = self.entries.get(&(meta.table, id)) {
            if entry.removed {
                return Ok(None);
            }
            if entry.stale {
                return Err(OrmError::EvictionRequired {
                    entity: meta.name,
                    id,
                });
            }
            return Ok(entry.typed::<T>());
        }

        match self.select_row(meta, id)? {
            Some(row) => self.register_loaded::<T>(row, HashMap::new(), false).map(Some),
            None => Ok(None),
        }
    }

    /// `find` followed by `lock`.
    pub fn find_with_lock<T: Entity>(
        &mut self,
        id: i64,
        mode: LockMode,
    ) -> OrmResult<Option<Managed<T>>> {
        let found = self.find::<T>(id)?;
        if let Some(handle) = &found {
            self.lock(handle, mode)?;
        }
        Ok(found)
    }

    /// Like `find`, but a missing row is an error.
    pub fn get_reference<T: Entity>(&mut self, id: i64) -> OrmResult<Managed<T>> {
        self.find::<T>(id)?.ok_or(OrmError::NotFound {
            entity: T::meta().name,
            id,
        })
    }

    /// Schedules a DELETE for the next flush. Removing a transient instance
    /// does nothing. Deletes run in the order instances were removed.
    ///
    /// # Errors
    /// - `Detached` when the instance is not tracked by this session.
    pub fn remove<T: Entity>(&mut self, entity: &Managed<T>) -> OrmResult<()> {
        let meta = T::meta();
        let Some(id) = entity.read()?.id() else {
            return Ok(());
        };
        let key = (meta.table, id);
        match self.entries.get_mut(&key) {
            Some(entry) if entry.is(entity) => {
                entry.removed = true;
                if !self.removals.contains(&key) {
                    self.removals.push(key);
                }
                Ok(())
            }
            _ => Err(OrmError::Detached {
                entity: meta.name,
                id,
                operation: "remove",
            }),
        }
    }

    /// Reloads a tracked instance from its row, discarding in-memory changes
    /// and any stale mark.
    pub fn refresh<T: Entity>(&mut self, entity: &Managed<T>) -> OrmResult<()> {
        let meta = T::meta();
        let id = self.tracked_id(entity, "refresh")?;
        let row = self.select_row(meta, id)?.ok_or(OrmError::NotFound {
            entity: meta.name,
            id,
        })?;
        let mut ctx = LoadContext::new(Rc::downgrade(&self.marker), HashMap::new());
        let mut fresh = T::read_row(&row, &mut ctx)?;
        fresh.keep_unmapped(&*entity.read()?);
        let snapshot = fresh.write_row()?;
        *entity.write()? = fresh;
        T::attach_relations(entity)?;
        if let Some(entry) = self.entries.get_mut(&(meta.table, id)) {
            entry.stale = false;
            if entry.snapshot.is_some() {
                entry.snapshot = Some(snapshot);
            }
        }
        Ok(())
    }

    /// Stops tracking one instance; pending changes to it are dropped.
    pub fn evict<T: Entity>(&mut self, entity: &Managed<T>) -> OrmResult<()> {
        let Some(id) = entity.read()?.id() else {
            return Ok(());
        };
        let key = (T::meta().table, id);
        if self.entries.get(&key).is_some_and(|entry| entry.is(entity)) {
            self.untrack(&[key]);
        }
        Ok(())
    }

    /// Detaches every tracked instance. Unflushed changes are dropped and
    /// unresolved lazy references handed out so far stop resolving.
    pub fn clear(&mut self) {
        let detached = self.entries.len();
        self.entries.clear();
        self.order.clear();
        self.removals.clear();
        self.marker = Rc::new(SessionMarker);
        debug!(
            "event=session_clear module=session status=ok session_id={} detached={detached}",
            self.id
        );
    }

    /// Returns whether `entity` is tracked here and not removed.
    pub fn contains<T: Entity>(&self, entity: &Managed<T>) -> bool {
        let Some(id) = entity.read().ok().and_then(|instance| instance.id()) else {
            return false;
        };
        self.entries
            .get(&(T::meta().table, id))
            .is_some_and(|entry| entry.is(entity) && !entry.removed)
    }

    /// Applies a lock to a tracked instance. Stronger modes replace weaker ones.
    ///
    /// # Errors
    /// - `NotVersioned` for optimistic modes on unversioned entities.
    /// - `LockTimeout` when the database write lock is not granted in time.
    pub fn lock<T: Entity>(&mut self, entity: &Managed<T>, mode: LockMode) -> OrmResult<()> {
        let meta = T::meta();
        let id = self.tracked_id(entity, "lock")?;
        match mode {
            LockMode::None => {}
            LockMode::Optimistic | LockMode::OptimisticForceIncrement => {
                if !meta.is_versioned() {
                    return Err(OrmError::NotVersioned(meta.name));
                }
            }
            LockMode::PessimisticWrite => self.acquire_write_lock(meta, id)?,
        }
        if let Some(entry) = self.entries.get_mut(&(meta.table, id)) {
            entry.lock = entry.lock.max(mode);
        }
        Ok(())
    }

    /// Writes pending changes: updates of dirty instances first, then deletes
    /// in removal order.
    pub fn flush(&mut self) -> OrmResult<()> {
        let keys = self.order.clone();
        for key in &keys {
            self.flush_entry(*key)?;
        }
        let removals = self.removals.clone();
        let mut deleted = Vec::new();
        for key in &removals {
            if self.flush_removal(*key)? {
                deleted.push(*key);
            }
        }
        if !deleted.is_empty() {
            self.untrack(&deleted);
        }
        Ok(())
    }

    /// Flushes, releases pessimistic lock rows and commits.
    pub fn commit(mut self) -> OrmResult<()> {
        self.flush()?;
        self.tx.execute(
            "DELETE FROM entity_locks WHERE session_id = ?1",
            [self.id.to_string()],
        )?;
        let Self {
            tx,
            id,
            stats,
            opened_at,
            ..
        } = self;
        tx.commit()?;
        info!(
            "event=session_commit module=session status=ok session_id={id} queries={} inserts={} updates={} deletes={} duration_ms={}",
            stats.queries,
            stats.inserts,
            stats.updates,
            stats.deletes,
            opened_at.elapsed().as_millis()
        );
        Ok(())
    }

    /// Discards every pending write and the tracked state.
    pub fn rollback(self) -> OrmResult<()> {
        let Self { tx, id, opened_at, .. } = self;
        tx.rollback()?;
        info!(
            "event=session_rollback module=session status=ok session_id={id} duration_ms={}",
            opened_at.elapsed().as_millis()
        );
        Ok(())
    }

    pub(crate) fn is_origin_of(&self, origin: &Weak<SessionMarker>) -> bool {
        origin
            .upgrade()
            .is_some_and(|marker| Rc::ptr_eq(&marker, &self.marker))
    }

    /// Resolves a lazy reference without flushing.
    pub(crate) fn load_reference<T: Entity>(&mut self, id: i64) -> OrmResult<Option<Managed<T>>> {
        self.find::<T>(id)
    }

    /// Flushes when the session runs in `FlushMode::Auto`.
    pub(crate) fn flush_before_query(&mut self) -> OrmResult<()> {
        if self.config.flush_mode == FlushMode::Auto {
            self.flush()?;
        }
        Ok(())
    }

    /// Runs a select and maps every row.
    pub(crate) fn fetch_rows<R>(
        &mut self,
        sql: &str,
        values: &[Value],
        map: impl FnMut(&Row<'_>) -> rusqlite::Result<R>,
    ) -> OrmResult<Vec<R>> {
        debug!("event=sql module=session status=start kind=query sql=\"{sql}\"");
        let mut stmt = self.tx.prepare(sql)?;
        let rows = stmt
            .query_map(params_from_iter(values.iter()), map)?
            .collect::<rusqlite::Result<Vec<R>>>()?;
        self.stats.queries += 1;
        Ok(rows)
    }

    /// Hydrates a rendered entity select, fetch-joined relations included.
    pub(crate) fn load_entities<T: Entity>(
        &mut self,
        rendered: &RenderedSelect,
        read_only: bool,
    ) -> OrmResult<Vec<Managed<T>>> {
        let meta = T::meta();
        let fetches = rendered.fetches.clone();
        let rows = self.fetch_rows(&rendered.sql, &rendered.values, |row| {
            let root = RowData::read(row, 0, meta)?;
            let mut offset = meta.select_columns().len();
            let mut fetched = Vec::with_capacity(fetches.len());
            for relation in &fetches {
                let target = (relation.target)();
                fetched.push(RowData::read(row, offset, target)?);
                offset += target.select_columns().len();
            }
            Ok((root, fetched))
        })?;

        let mut loaded = Vec::with_capacity(rows.len());
        for (root, fetched) in rows {
            let Some(root) = root else {
                continue;
            };
            let mut prefetched: HashMap<&'static str, Box<dyn Any>> = HashMap::new();
            for (relation, data) in fetches.iter().zip(fetched) {
                if let Some(data) = data {
                    let target = (relation.fetch)(self, data)?;
                    prefetched.insert(relation.name, target);
                }
            }
            loaded.push(self.register_loaded::<T>(root, prefetched, read_only)?);
        }
        Ok(loaded)
    }

    /// Executes a bulk UPDATE/DELETE after flushing, then marks or clears
    /// the instances it may have invalidated.
    pub(crate) fn execute_bulk(
        &mut self,
        plan: &QueryPlan,
        args: &Args,
        mode: BulkMode,
    ) -> OrmResult<usize> {
        self.flush()?;
        let (sql, values) = plan.render_bulk(args)?;
        debug!("event=sql module=session status=start kind=bulk sql=\"{sql}\"");
        let affected = self.tx.execute(&sql, params_from_iter(values.iter()))?;
        if plan.kind == QueryKind::BulkUpdate {
            self.stats.updates += 1;
        } else {
            self.stats.deletes += 1;
        }

        match mode {
            BulkMode::ClearAfter => self.clear(),
            BulkMode::MarkStale => {
                let table = plan.root.table;
                let mut stale = 0usize;
                for ((entry_table, _), entry) in &mut self.entries {
                    if *entry_table == table {
                        entry.stale = true;
                        stale += 1;
                    }
                }
                if stale > 0 {
                    warn!(
                        "event=bulk_statement module=session status=ok entity={} affected={affected} stale_instances={stale} hint=clear_evict_or_refresh",
                        plan.root.name
                    );
                }
            }
        }
        Ok(affected)
    }

    fn register_loaded<T: Entity>(
        &mut self,
        row: RowData,
        prefetched: HashMap<&'static str, Box<dyn Any>>,
        read_only: bool,
    ) -> OrmResult<Managed<T>> {
        let meta = T::meta();
        let id = row.i64(meta.id_column)?;
        if let Some(entry) = self.entries.get(&(meta.table, id)) {
            if entry.stale {
                return Err(OrmError::EvictionRequired {
                    entity: meta.name,
                    id,
                });
            }
            let handle = entry.typed::<T>().ok_or_else(|| {
                OrmError::InvalidData(format!("{}#{id} is tracked with another type", meta.name))
            })?;
            {
                let instance = handle.read()?;
                for (relation, target) in &prefetched {
                    instance.prefill(relation, &**target)?;
                }
            }
            return Ok(handle);
        }

        let mut ctx = LoadContext::new(Rc::downgrade(&self.marker), prefetched);
        let entity = T::read_row(&row, &mut ctx)?;
        let snapshot = if read_only {
            None
        } else {
            Some(entity.write_row()?)
        };
        let handle = Managed::new(entity);
        self.track((meta.table, id), Box::new(handle.clone()), snapshot);
        T::attach_relations(&handle)?;
        Ok(handle)
    }

    fn select_row(&mut self, meta: &'static EntityMeta, id: i64) -> OrmResult<Option<RowData>> {
        let sql = format!(
            "SELECT {} FROM {} WHERE {} = ?",
            meta.select_columns().join(", "),
            meta.table,
            meta.id_column
        );
        let rows = self.fetch_rows(&sql, &[Value::Integer(id)], |row| RowData::read(row, 0, meta))?;
        Ok(rows.into_iter().flatten().next())
    }

    fn track(&mut self, key: Key, handle: Box<dyn Tracked>, snapshot: Option<RowData>) {
        let entry = Entry {
            handle,
            snapshot,
            removed: false,
            lock: LockMode::None,
            stale: false,
        };
        if self.entries.insert(key, entry).is_none() {
            self.order.push(key);
        }
    }

    fn untrack(&mut self, keys: &[Key]) {
        for key in keys {
            self.entries.remove(key);
        }
        self.order.retain(|key| !keys.contains(key));
        self.removals.retain(|key| !keys.contains(key));
    }

    fn tracked_id<T: Entity>(&self, entity: &Managed<T>, operation: &'static str) -> OrmResult<i64> {
        let meta = T::meta();
        let Some(id) = entity.read()?.id() else {
            return Err(OrmError::InvalidQueryUsage(format!(
                "cannot {operation} a transient {}",
                meta.name
            )));
        };
        match self.entries.get(&(meta.table, id)) {
            Some(entry) if entry.is(entity) && entry.removed => Err(OrmError::EntityRemoved {
                entity: meta.name,
                id,
            }),
            Some(entry) if entry.is(entity) => Ok(id),
            _ => Err(OrmError::Detached {
                entity: meta.name,
                id,
                operation,
            }),
        }
    }

    fn acquire_write_lock(&mut self, meta: &'static EntityMeta, id: i64) -> OrmResult<()> {
        let result = self.tx.execute(
            "INSERT OR REPLACE INTO entity_locks (entity_table, row_id, session_id, locked_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![meta.table, id, self.id.to_string(), SystemClock.now_millis()],
        );
        match result {
            Ok(_) => {
                debug!(
                    "event=lock_acquire module=session status=ok entity={} id={id} mode=pessimistic_write",
                    meta.name
                );
                Ok(())
            }
            Err(err) => {
                let err = DbError::from(err);
                if err.is_busy() {
                    warn!(
                        "event=lock_acquire module=session status=error entity={} id={id} error_code=lock_timeout",
                        meta.name
                    );
                    Err(OrmError::LockTimeout {
                        entity: meta.name,
                        id: Some(id),
                    })
                } else {
                    Err(err.into())
                }
            }
        }
    }

    fn flush_entry(&mut self, key: Key) -> OrmResult<()> {
        let Self {
            tx,
            entries,
            listeners,
            stats,
            ..
        } = self;
        let Some(entry) = entries.get_mut(&key) else {
            return Ok(());
        };
        if entry.removed {
            return Ok(());
        }
        let Some(snapshot) = entry.snapshot.as_ref() else {
            return Ok(());
        };
        let meta = entry.handle.meta();
        let id = key.1;

        if entry.handle.row()?.changed_columns(snapshot, meta).is_empty() {
            return check_clean_version(tx, entry, meta, id, stats);
        }
        if entry.stale {
            return Err(OrmError::EvictionRequired {
                entity: meta.name,
                id,
            });
        }

        entry.handle.fire(listeners, LifecycleEvent::BeforeUpdate)?;
        let row = entry.handle.row()?;
        let changed = row.changed_columns(snapshot, meta);
        let version = entry.handle.version()?;

        let mut assignments: Vec<String> = changed.iter().map(|column| format!("{column} = ?")).collect();
        let mut values: Vec<Value> = changed
            .iter()
            .map(|column| row.get(column).cloned().unwrap_or(Value::Null))
            .collect();
        if let Some(version_attr) = meta.version {
            assignments.push(format!("{0} = {0} + 1", version_attr.column));
        }
        let mut sql = format!(
            "UPDATE {} SET {} WHERE {} = ?",
            meta.table,
            assignments.join(", "),
            meta.id_column
        );
        values.push(Value::Integer(id));
        if let (Some(version_attr), Some(expected)) = (meta.version, version) {
            sql.push_str(&format!(" AND {} = ?", version_attr.column));
            values.push(Value::Integer(expected));
        }

        debug!(
            "event=sql module=session status=start kind=update entity={} id={id} columns={} sql=\"{sql}\"",
            meta.name,
            changed.join(",")
        );
        let affected = tx.execute(&sql, params_from_iter(values.iter()))?;
        if affected == 0 {
            warn!(
                "event=flush module=session status=error entity={} id={id} error_code=stale_version",
                meta.name
            );
            return Err(OrmError::StaleVersion {
                entity: meta.name,
                id,
                expected_version: version,
            });
        }
        if let (Some(_), Some(expected)) = (meta.version, version) {
            entry.handle.set_version(expected + 1)?;
            if entry.lock == LockMode::OptimisticForceIncrement {
                entry.lock = LockMode::Optimistic;
            }
        }
        entry.snapshot = Some(row);
        stats.updates += 1;
        Ok(())
    }

    fn flush_removal(&mut self, key: Key) -> OrmResult<bool> {
        let Some(entry) = self.entries.get(&key) else {
            return Ok(false);
        };
        if !entry.removed {
            return Ok(false);
        }
        let meta = entry.handle.meta();
        let version = entry.handle.version()?;
        let id = key.1;

        let mut sql = format!("DELETE FROM {} WHERE {} = ?", meta.table, meta.id_column);
        let mut values = vec![Value::Integer(id)];
        if let (Some(version_attr), Some(expected)) = (meta.version, version) {
            sql.push_str(&format!(" AND {} = ?", version_attr.column));
            values.push(Value::Integer(expected));
        }
        debug!(
            "event=sql module=session status=start kind=delete entity={} id={id} sql=\"{sql}\"",
            meta.name
        );
        let affected = self.tx.execute(&sql, params_from_iter(values.iter()))?;
        if affected == 0 {
            return Err(OrmError::StaleVersion {
                entity: meta.name,
                id,
                expected_version: version,
            });
        }
        self.stats.deletes += 1;
        Ok(true)
    }
}

/// Version handling for an instance with no pending changes.
fn check_clean_version(
    tx: &Transaction<'_>,
    entry: &mut Entry,
    meta: &'static EntityMeta,
    id: i64,
    stats: &mut SessionStats,
) -> OrmResult<()> {
    let Some(version_attr) = meta.version else {
        return Ok(());
    };
    let expected = entry.handle.version()?;
    match entry.lock {
        LockMode::Optimistic => {
            let sql = format!(
                "SELECT {} FROM {} WHERE {} = ?1",
                version_attr.column, meta.table, meta.id_column
            );
            let stored: Option<i64> = tx
                .query_row(&sql, [id], |row| row.get(0))
                .map(Some)
                .or_else(|err| match err {
                    rusqlite::Error::QueryReturnedNoRows => Ok(None),
                    other => Err(other),
                })?;
            stats.queries += 1;
            if stored.is_none() || stored != expected {
                return Err(OrmError::StaleVersion {
                    entity: meta.name,
                    id,
                    expected_version: expected,
                });
            }
            Ok(())
        }
        LockMode::OptimisticForceIncrement => {
            let Some(current) = expected else {
                return Ok(());
            };
            let sql = format!(
                "UPDATE {0} SET {1} = {1} + 1 WHERE {2} = ?1 AND {1} = ?2",
                meta.table, version_attr.column, meta.id_column
            );
            let affected = tx.execute(&sql, [id, current])?;
            if affected == 0 {
                return Err(OrmError::StaleVersion {
                    entity: meta.name,
                    id,
                    expected_version: expected,
                });
            }
            entry.handle.set_version(current + 1)?;
            entry.lock = LockMode::Optimistic;
            stats.updates += 1;
            Ok(())
        }
        LockMode::None | LockMode::PessimisticWrite => Ok(()),
    }
}
