//! The database handle and its transaction capabilities.
//!
//! [`Db`] owns the allocator behind a reader-writer lock and serializes
//! writers: at most one [`WriteTransaction`] exists per database, enforced
//! with a condition variable (and a timeout surface for `LockTimeout`).
//! Read transactions bind to a snapshot `(version, top ref)` and pin it in
//! the reader registry so the allocator never reuses space the snapshot
//! can still reach.
//!
//! Read and write transactions are distinct types: mutating calls simply
//! do not exist on a read handle.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex, RwLock};
use tracing::{debug, info, warn};

use tarn_alloc::{AllocOptions, Durability, SlabAlloc};
use tarn_error::{Result, TarnError};
use tarn_types::{
    ColKey, ColumnAttr, DataType, Mixed, ObjKey, Ref, TableKey, VersionId,
};

use crate::group::{Group, HistoryInfo, TableInfo};
use crate::table::{self, CascadeNotification};
use crate::history;

/// Database configuration.
#[derive(Clone)]
pub struct DbOptions {
    /// Commit durability (syncs on/off).
    pub durability: Durability,
    /// File growth granularity in bytes.
    pub growth: usize,
    /// Optional 32-byte encryption key for the allocator's cipher seam.
    pub encryption_key: Option<[u8; 32]>,
    /// How long `begin_write` waits for the write lock. `None` waits
    /// forever.
    pub write_lock_timeout: Option<Duration>,
    /// When set, commits record changeset blobs under this history type.
    pub history_type: Option<i64>,
}

impl Default for DbOptions {
    fn default() -> Self {
        Self {
            durability: Durability::Full,
            growth: 4096,
            encryption_key: None,
            write_lock_timeout: None,
            history_type: None,
        }
    }
}

impl std::fmt::Debug for DbOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DbOptions")
            .field("durability", &self.durability)
            .field("growth", &self.growth)
            .field("encrypted", &self.encryption_key.is_some())
            .field("write_lock_timeout", &self.write_lock_timeout)
            .field("history_type", &self.history_type)
            .finish()
    }
}

/// Cascade handler type registered on the database.
///
/// Runs synchronously inside the write transaction, with the storage lock
/// held: the handler must not call back into the database.
pub type CascadeFn = Box<dyn FnMut(&CascadeNotification) + Send>;

/// Schema-change handler, fired after a commit that changed the schema.
pub type SchemaChangedFn = Box<dyn FnMut() + Send>;

/// Observer fired after every commit with the published version. Used by
/// the query notifier coordinator.
pub type CommitObserverFn = Box<dyn Fn(VersionId) + Send>;

struct DbState {
    /// Latest committed version.
    version: VersionId,
    /// Latest committed top ref.
    top_ref: Ref,
    writer_active: bool,
    /// Pinned snapshot versions with their pin counts.
    readers: BTreeMap<u64, usize>,
}

/// Shared state behind every handle.
pub struct DbInner {
    alloc: RwLock<SlabAlloc>,
    state: Mutex<DbState>,
    write_cv: Condvar,
    cascade_handler: Mutex<Option<CascadeFn>>,
    schema_handler: Mutex<Option<SchemaChangedFn>>,
    commit_observers: Mutex<Vec<CommitObserverFn>>,
    options: DbOptions,
}

/// An open database.
#[derive(Clone)]
pub struct Db {
    inner: Arc<DbInner>,
}

impl std::fmt::Debug for Db {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("Db")
            .field("version", &state.version)
            .field("top_ref", &state.top_ref)
            .field("writer_active", &state.writer_active)
            .finish_non_exhaustive()
    }
}

impl Db {
    fn from_alloc(mut alloc: SlabAlloc, options: DbOptions) -> Result<Self> {
        let (group, free) = Group::load(&alloc, alloc.top_ref())?;
        alloc.load_free_space(free);
        let version = group.version;
        let top_ref = alloc.top_ref();
        let needs_upgrade = alloc.needs_upgrade();

        let db = Self {
            inner: Arc::new(DbInner {
                alloc: RwLock::new(alloc),
                state: Mutex::new(DbState {
                    version,
                    top_ref,
                    writer_active: false,
                    readers: BTreeMap::new(),
                }),
                write_cv: Condvar::new(),
                cascade_handler: Mutex::new(None),
                schema_handler: Mutex::new(None),
                commit_observers: Mutex::new(Vec::new()),
                options,
            }),
        };

        // In-place format upgrade: rewrite the snapshot under the current
        // format and commit it as a fresh version.
        if needs_upgrade {
            info!("upgrading database file format in place");
            let txn = db.begin_write()?;
            txn.commit()?;
        }
        Ok(db)
    }

    /// Open (or create) a database file.
    pub fn open(path: &Path, options: DbOptions) -> Result<Self> {
        let alloc = SlabAlloc::attach_file(
            path,
            &AllocOptions {
                growth: options.growth,
                durability: options.durability,
                encryption_key: options.encryption_key,
            },
        )?;
        Self::from_alloc(alloc, options)
    }

    /// Open a fresh in-memory database.
    pub fn open_in_memory(options: DbOptions) -> Result<Self> {
        Self::from_alloc(SlabAlloc::new_scratch(), options)
    }

    /// Open a read-only database over a memory buffer.
    pub fn open_buffer(buf: Vec<u8>, options: DbOptions) -> Result<Self> {
        Self::from_alloc(SlabAlloc::attach_buffer(buf)?, options)
    }

    /// The latest committed version.
    #[must_use]
    pub fn version(&self) -> VersionId {
        self.inner.state.lock().version
    }

    /// Register the cascade handler delivered before removals execute.
    pub fn set_cascade_handler(&self, handler: Option<CascadeFn>) {
        *self.inner.cascade_handler.lock() = handler;
    }

    /// Register the handler fired after commits that changed the schema.
    pub fn set_schema_change_handler(&self, handler: Option<SchemaChangedFn>) {
        *self.inner.schema_handler.lock() = handler;
    }

    /// Register an observer fired after every commit.
    pub fn add_commit_observer(&self, observer: CommitObserverFn) {
        self.inner.commit_observers.lock().push(observer);
    }

    /// Begin a read transaction bound to the latest committed snapshot.
    pub fn begin_read(&self) -> Result<ReadTransaction> {
        let (version, top_ref) = {
            let mut state = self.inner.state.lock();
            let v = state.version;
            *state.readers.entry(v.0).or_insert(0) += 1;
            (v, state.top_ref)
        };
        let alloc = self.inner.alloc.read();
        let (group, _) = Group::load(&alloc, top_ref)?;
        drop(alloc);
        Ok(ReadTransaction {
            db: Arc::clone(&self.inner),
            version,
            group,
        })
    }

    /// Begin a frozen transaction: an immutable snapshot view that is safe
    /// to share across threads.
    pub fn freeze(&self) -> Result<FrozenTransaction> {
        Ok(FrozenTransaction(self.begin_read()?))
    }

    /// Begin the (single) write transaction, waiting for the configured
    /// timeout.
    pub fn begin_write(&self) -> Result<WriteTransaction> {
        {
            let mut state = self.inner.state.lock();
            if state.writer_active {
                match self.inner.options.write_lock_timeout {
                    Some(timeout) => {
                        let deadline = std::time::Instant::now() + timeout;
                        while state.writer_active {
                            if self
                                .inner
                                .write_cv
                                .wait_until(&mut state, deadline)
                                .timed_out()
                            {
                                warn!(?timeout, "write lock acquisition timed out");
                                return Err(TarnError::LockTimeout {
                                    millis: u64::try_from(timeout.as_millis())
                                        .unwrap_or(u64::MAX),
                                });
                            }
                        }
                    }
                    None => {
                        while state.writer_active {
                            self.inner.write_cv.wait(&mut state);
                        }
                    }
                }
            }
            state.writer_active = true;
        }

        let (version, top_ref) = {
            let state = self.inner.state.lock();
            (state.version, state.top_ref)
        };
        let new_version = version.next();
        let mut alloc = self.inner.alloc.write();
        if let Err(err) = alloc.begin_write(new_version) {
            drop(alloc);
            self.release_writer();
            return Err(err);
        }
        let group = match Group::load(&alloc, top_ref) {
            Ok((g, _)) => g,
            Err(err) => {
                drop(alloc);
                self.release_writer();
                return Err(err);
            }
        };
        drop(alloc);
        debug!(version = %new_version, "write transaction started");
        Ok(WriteTransaction {
            db: Arc::clone(&self.inner),
            group,
            version: new_version,
            old_top: top_ref,
            schema_dirty: false,
            finished: false,
        })
    }

    fn release_writer(&self) {
        let mut state = self.inner.state.lock();
        state.writer_active = false;
        drop(state);
        self.inner.write_cv.notify_one();
    }
}

fn unpin(inner: &DbInner, version: VersionId) {
    let mut state = inner.state.lock();
    if let Some(count) = state.readers.get_mut(&version.0) {
        *count -= 1;
        if *count == 0 {
            state.readers.remove(&version.0);
        }
    }
}

// ---------------------------------------------------------------------------
// Read transactions
// ---------------------------------------------------------------------------

/// A read-only view of one committed snapshot.
pub struct ReadTransaction {
    db: Arc<DbInner>,
    version: VersionId,
    group: Group,
}

impl ReadTransaction {
    /// The bound snapshot version.
    #[must_use]
    pub fn version(&self) -> VersionId {
        self.version
    }

    /// The schema registry at the bound snapshot.
    #[must_use]
    pub fn group(&self) -> &Group {
        &self.group
    }

    /// Re-bind to the latest committed snapshot.
    pub fn advance(&mut self) -> Result<()> {
        let (version, top_ref) = {
            let mut state = self.db.state.lock();
            let v = state.version;
            *state.readers.entry(v.0).or_insert(0) += 1;
            (v, state.top_ref)
        };
        let alloc = self.db.alloc.read();
        let group = Group::load(&alloc, top_ref)?.0;
        drop(alloc);
        unpin(&self.db, self.version);
        self.version = version;
        self.group = group;
        Ok(())
    }

    /// Run `f` with the allocator and group of this snapshot.
    pub fn with_parts<T>(&self, f: impl FnOnce(&SlabAlloc, &Group) -> Result<T>) -> Result<T> {
        let alloc = self.db.alloc.read();
        f(&alloc, &self.group)
    }

    /// Table lookup by name.
    pub fn table_by_name(&self, name: &str) -> Result<TableKey> {
        Ok(self.group.table_by_name(name)?.key)
    }

    /// Table metadata.
    pub fn table_info(&self, tk: TableKey) -> Result<&TableInfo> {
        self.group.table(tk)
    }

    /// Number of rows (tombstones included).
    pub fn row_count(&self, tk: TableKey) -> Result<u64> {
        self.with_parts(|alloc, group| table::row_count(alloc, group, tk))
    }

    /// Read one value.
    pub fn get_value(&self, tk: TableKey, key: ObjKey, col: ColKey) -> Result<Mixed> {
        self.with_parts(|alloc, group| table::get_value(alloc, group, tk, key, col))
    }

    /// All elements of a collection.
    pub fn list_get_all(&self, tk: TableKey, key: ObjKey, col: ColKey) -> Result<Vec<Mixed>> {
        self.with_parts(|alloc, group| table::list_get_all(alloc, group, tk, key, col))
    }

    /// Whether the object exists at this snapshot.
    pub fn object_exists(&self, tk: TableKey, key: ObjKey) -> Result<bool> {
        self.with_parts(|alloc, group| table::object_exists(alloc, group, tk, key))
    }

    /// Look up an object by primary key.
    pub fn find_by_primary_key(&self, tk: TableKey, pk: &Mixed) -> Result<Option<ObjKey>> {
        self.with_parts(|alloc, group| table::find_by_primary_key(alloc, group, tk, pk))
    }

    /// Every row key, in key order.
    pub fn object_keys(&self, tk: TableKey) -> Result<Vec<ObjKey>> {
        self.with_parts(|alloc, group| {
            let mut keys = Vec::new();
            table::for_each_key(alloc, group, tk, &mut |k| keys.push(k))?;
            Ok(keys)
        })
    }
}

impl Drop for ReadTransaction {
    fn drop(&mut self) {
        unpin(&self.db, self.version);
    }
}

/// An immutable snapshot view, shareable across threads.
///
/// Frozen transactions never advance; their lifetime pins the snapshot's
/// space exactly like a read transaction's does.
pub struct FrozenTransaction(ReadTransaction);

impl std::ops::Deref for FrozenTransaction {
    type Target = ReadTransaction;

    fn deref(&self) -> &ReadTransaction {
        &self.0
    }
}

// ---------------------------------------------------------------------------
// Write transactions
// ---------------------------------------------------------------------------

/// The single active write transaction.
pub struct WriteTransaction {
    db: Arc<DbInner>,
    group: Group,
    version: VersionId,
    old_top: Ref,
    schema_dirty: bool,
    finished: bool,
}

impl std::fmt::Debug for WriteTransaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteTransaction")
            .field("version", &self.version)
            .field("schema_dirty", &self.schema_dirty)
            .field("finished", &self.finished)
            .finish()
    }
}

impl WriteTransaction {
    /// The version this transaction will commit as.
    #[must_use]
    pub fn version(&self) -> VersionId {
        self.version
    }

    /// The (mutable) schema registry.
    #[must_use]
    pub fn group(&self) -> &Group {
        &self.group
    }

    /// Run `f` with exclusive access to the allocator and group.
    pub fn with_parts_mut<T>(
        &mut self,
        f: impl FnOnce(&mut SlabAlloc, &mut Group) -> Result<T>,
    ) -> Result<T> {
        let mut alloc = self.db.alloc.write();
        f(&mut alloc, &mut self.group)
    }

    /// Read-side helper mirroring [`ReadTransaction::with_parts`].
    pub fn with_parts<T>(&self, f: impl FnOnce(&SlabAlloc, &Group) -> Result<T>) -> Result<T> {
        let alloc = self.db.alloc.read();
        f(&alloc, &self.group)
    }

    // -- schema ------------------------------------------------------------

    /// Create an empty table.
    pub fn add_table(&mut self, name: &str) -> Result<TableKey> {
        self.schema_dirty = true;
        self.with_parts_mut(|alloc, group| table::add_table(alloc, group, name))
    }

    /// Create a table with an indexed primary-key column.
    pub fn add_table_with_primary_key(
        &mut self,
        name: &str,
        pk_name: &str,
        pk_type: DataType,
        nullable: bool,
    ) -> Result<TableKey> {
        self.schema_dirty = true;
        self.with_parts_mut(|alloc, group| {
            table::add_table_with_primary_key(alloc, group, name, pk_name, pk_type, nullable)
        })
    }

    /// Remove a table (fails while link columns still target it).
    pub fn remove_table(&mut self, tk: TableKey) -> Result<()> {
        self.schema_dirty = true;
        self.with_parts_mut(|alloc, group| table::remove_table(alloc, group, tk))
    }

    /// Rename a table.
    pub fn rename_table(&mut self, tk: TableKey, new_name: &str) -> Result<()> {
        self.schema_dirty = true;
        self.with_parts_mut(|_, group| group.rename_table(tk, new_name))
    }

    /// Add a scalar or scalar-collection column.
    pub fn add_column(
        &mut self,
        tk: TableKey,
        name: &str,
        dt: DataType,
        attrs: ColumnAttr,
    ) -> Result<ColKey> {
        self.schema_dirty = true;
        self.with_parts_mut(|alloc, group| table::add_column(alloc, group, tk, name, dt, attrs))
    }

    /// Add a link or link-list column.
    pub fn add_column_link(
        &mut self,
        tk: TableKey,
        name: &str,
        list: bool,
        target: TableKey,
        strong: bool,
    ) -> Result<ColKey> {
        self.schema_dirty = true;
        self.with_parts_mut(|alloc, group| {
            table::add_column_link(alloc, group, tk, name, list, target, strong)
        })
    }

    /// Remove a column.
    pub fn remove_column(&mut self, tk: TableKey, col: ColKey) -> Result<()> {
        self.schema_dirty = true;
        self.with_parts_mut(|alloc, group| table::remove_column(alloc, group, tk, col))
    }

    /// Build a search index over a column; returns the updated key.
    pub fn add_search_index(&mut self, tk: TableKey, col: ColKey) -> Result<ColKey> {
        self.schema_dirty = true;
        self.with_parts_mut(|alloc, group| table::add_search_index(alloc, group, tk, col))
    }

    /// Drop a column's search index; returns the updated key.
    pub fn remove_search_index(&mut self, tk: TableKey, col: ColKey) -> Result<ColKey> {
        self.schema_dirty = true;
        self.with_parts_mut(|alloc, group| table::remove_search_index(alloc, group, tk, col))
    }

    // -- objects -----------------------------------------------------------

    /// Create an object with the next sequential key.
    pub fn create_object(&mut self, tk: TableKey) -> Result<ObjKey> {
        self.with_parts_mut(|alloc, group| table::create_object(alloc, group, tk))
    }

    /// Create an object with a caller-chosen key.
    pub fn create_object_with_key(&mut self, tk: TableKey, key: ObjKey) -> Result<ObjKey> {
        self.with_parts_mut(|alloc, group| table::create_object_with_key(alloc, group, tk, key))
    }

    /// Create an object identified by primary key.
    pub fn create_object_with_primary_key(&mut self, tk: TableKey, pk: &Mixed) -> Result<ObjKey> {
        self.with_parts_mut(|alloc, group| {
            table::create_object_with_primary_key(alloc, group, tk, pk)
        })
    }

    /// Remove an object, cascading through strong links. The registered
    /// cascade handler observes the set before execution.
    pub fn remove_object(&mut self, tk: TableKey, key: ObjKey) -> Result<()> {
        let mut handler = self.db.cascade_handler.lock().take();
        let result = self.with_parts_mut(|alloc, group| {
            let h = handler
                .as_mut()
                .map(|h| h.as_mut() as &mut dyn FnMut(&CascadeNotification));
            table::remove_object(alloc, group, tk, key, h)
        });
        *self.db.cascade_handler.lock() = handler;
        result
    }

    /// Soft-delete into a tombstone that retains the primary key.
    pub fn invalidate_object(&mut self, tk: TableKey, key: ObjKey) -> Result<ObjKey> {
        self.with_parts_mut(|alloc, group| table::invalidate_object(alloc, group, tk, key))
    }

    /// Write one value.
    pub fn set_value(&mut self, tk: TableKey, key: ObjKey, col: ColKey, value: &Mixed) -> Result<()> {
        self.with_parts_mut(|alloc, group| table::set_value(alloc, group, tk, key, col, value))
    }

    /// Insert a collection element.
    pub fn list_insert(
        &mut self,
        tk: TableKey,
        key: ObjKey,
        col: ColKey,
        pos: u64,
        value: &Mixed,
    ) -> Result<()> {
        self.with_parts_mut(|alloc, group| {
            table::list_insert(alloc, group, tk, key, col, pos, value)
        })
    }

    /// Remove a collection element.
    pub fn list_erase(&mut self, tk: TableKey, key: ObjKey, col: ColKey, pos: u64) -> Result<()> {
        self.with_parts_mut(|alloc, group| table::list_erase(alloc, group, tk, key, col, pos))
    }

    // -- read-your-writes mirrors ------------------------------------------

    /// Read one value (sees this transaction's own writes).
    pub fn get_value(&self, tk: TableKey, key: ObjKey, col: ColKey) -> Result<Mixed> {
        self.with_parts(|alloc, group| table::get_value(alloc, group, tk, key, col))
    }

    /// All elements of a collection.
    pub fn list_get_all(&self, tk: TableKey, key: ObjKey, col: ColKey) -> Result<Vec<Mixed>> {
        self.with_parts(|alloc, group| table::list_get_all(alloc, group, tk, key, col))
    }

    /// Number of rows.
    pub fn row_count(&self, tk: TableKey) -> Result<u64> {
        self.with_parts(|alloc, group| table::row_count(alloc, group, tk))
    }

    /// Whether the object exists.
    pub fn object_exists(&self, tk: TableKey, key: ObjKey) -> Result<bool> {
        self.with_parts(|alloc, group| table::object_exists(alloc, group, tk, key))
    }

    /// Look up an object by primary key.
    pub fn find_by_primary_key(&self, tk: TableKey, pk: &Mixed) -> Result<Option<ObjKey>> {
        self.with_parts(|alloc, group| table::find_by_primary_key(alloc, group, tk, pk))
    }

    /// Every row key, in key order.
    pub fn object_keys(&self, tk: TableKey) -> Result<Vec<ObjKey>> {
        self.with_parts(|alloc, group| {
            let mut keys = Vec::new();
            table::for_each_key(alloc, group, tk, &mut |k| keys.push(k))?;
            Ok(keys)
        })
    }

    /// Table lookup by name.
    pub fn table_by_name(&self, name: &str) -> Result<TableKey> {
        Ok(self.group.table_by_name(name)?.key)
    }

    /// Table metadata.
    pub fn table_info(&self, tk: TableKey) -> Result<&TableInfo> {
        self.group.table(tk)
    }

    // -- lifecycle ---------------------------------------------------------

    /// Commit, recording `changeset` in the history when one is configured.
    pub fn commit_with_changeset(mut self, changeset: Option<&[u8]>) -> Result<VersionId> {
        let oldest_live = {
            let state = self.db.state.lock();
            state
                .readers
                .keys()
                .next()
                .copied()
                .map_or(self.version, VersionId)
        };

        let version = self.version;
        let top_ref = {
            let mut alloc = self.db.alloc.write();
            alloc.consolidate_free_space(oldest_live);

            // Sync histories record the changesets the sync layer hands
            // in; commits without one (schema bootstraps, resets) leave
            // the history untouched.
            if let Some(history_type) = self.db.options.history_type {
                let mut h = self.group.history.unwrap_or(HistoryInfo {
                    history_type,
                    root: Ref::NONE,
                    schema_version: 0,
                    file_ident: 0,
                    evacuation_point: 0,
                });
                if h.root.is_none() {
                    h.root = history::create(&mut alloc, version)?;
                }
                if let Some(changeset) = changeset {
                    h.root = history::append(&mut alloc, h.root, changeset)?;
                }
                self.group.history = Some(h);
            }

            self.group.version = version;
            let top_ref = self.group.serialize(&mut alloc, self.old_top)?;
            alloc.commit(top_ref)?;
            top_ref
        };

        {
            let mut state = self.db.state.lock();
            state.version = version;
            state.top_ref = top_ref;
            state.writer_active = false;
        }
        self.db.write_cv.notify_one();
        self.finished = true;
        info!(version = %version, top = %top_ref, "commit published");

        if self.schema_dirty {
            if let Some(handler) = self.db.schema_handler.lock().as_mut() {
                handler();
            }
        }
        for observer in self.db.commit_observers.lock().iter() {
            observer(version);
        }
        Ok(version)
    }

    /// Commit the transaction and publish a new snapshot version.
    pub fn commit(self) -> Result<VersionId> {
        self.commit_with_changeset(None)
    }

    /// Discard every change made by this transaction.
    pub fn rollback(mut self) {
        self.rollback_inner();
    }

    fn rollback_inner(&mut self) {
        if self.finished {
            return;
        }
        {
            let mut alloc = self.db.alloc.write();
            alloc.rollback();
        }
        {
            let mut state = self.db.state.lock();
            state.writer_active = false;
        }
        self.db.write_cv.notify_one();
        self.finished = true;
        debug!(version = %self.version, "write transaction rolled back");
    }
}

impl Drop for WriteTransaction {
    fn drop(&mut self) {
        self.rollback_inner();
    }
}
