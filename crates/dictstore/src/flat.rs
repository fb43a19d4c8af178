//! Single-file dictionary store.
//!
//! The whole table lives in memory while the store is open and is persisted
//! as one snapshot file, rewritten atomically on close when anything changed.
//! No write-ahead log: a crash loses everything since the last close.

use std::fmt;
use std::fs;
use std::ops::Bound;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info};

use dictstore_api::{
    Db, DbAccessor, DbClass, DbError, DbResult, DbState, OrderedSource, PrefixCursor, Record,
    Transactional,
};
use dictstore_engine::format::{check_entry_size, MAX_KEY_SIZE, MAX_VALUE_SIZE};
use dictstore_engine::{read_snapshot, write_snapshot, EngineError, EngineResult, Table};

use crate::error::db_error;
use crate::namespace::{self, DATA, META};

/// Settings for [`FlatDb`].
#[derive(Debug, Clone)]
pub struct FlatOptions {
    /// Create an empty file on read-write open if none exists.
    pub create_if_missing: bool,
}

impl Default for FlatOptions {
    fn default() -> Self {
        Self { create_if_missing: true }
    }
}

/// The in-memory table of one open.
struct FlatTable {
    data: RwLock<Table>,
    closed: AtomicBool,
    dirty: AtomicBool,
}

impl FlatTable {
    fn new(data: Table) -> Self {
        Self { data: RwLock::new(data), closed: AtomicBool::new(false), dirty: AtomicBool::new(false) }
    }

    fn persist(&self, path: &Path) -> EngineResult<u64> {
        let data = self.data.read();
        write_snapshot(path, 0, data.iter().map(|(k, v)| (k.as_slice(), v.as_slice())))
    }
}

/// Cursor source over one key space of a [`FlatTable`].
struct FlatSource {
    table: Arc<FlatTable>,
    namespace: u8,
}

impl OrderedSource for FlatSource {
    fn first_from(&self, from: Bound<&[u8]>) -> DbResult<Option<Record>> {
        if self.table.closed.load(Ordering::Acquire) {
            return Err(DbError::CursorInvalidated);
        }
        let bound = namespace::physical_bound(self.namespace, from);
        let data = self.table.data.read();
        let found = data
            .range::<[u8], _>((namespace::borrow_bound(&bound), Bound::Unbounded))
            .next()
            .and_then(|(key, value)| {
                namespace::logical_key(self.namespace, key).map(|logical| (logical.to_vec(), value.clone()))
            });
        Ok(found)
    }
}

impl fmt::Debug for FlatSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlatSource").field("namespace", &self.namespace).finish()
    }
}

/// Dictionary store persisted as a single snapshot file.
pub struct FlatDb {
    state: DbState,
    options: FlatOptions,
    table: RwLock<Option<Arc<FlatTable>>>,
}

impl FlatDb {
    pub fn new(file_path: impl Into<PathBuf>, name: &str, options: FlatOptions) -> Self {
        Self { state: DbState::new(name, file_path), options, table: RwLock::new(None) }
    }

    fn err(&self, err: EngineError) -> DbError {
        db_error(&self.state, err)
    }

    fn loaded_table(&self) -> DbResult<Arc<FlatTable>> {
        self.table
            .read()
            .as_ref()
            .cloned()
            .ok_or_else(|| DbError::NotLoaded { name: self.state.name().to_string() })
    }

    fn create_parent(&self) -> DbResult<()> {
        match self.state.file_path().parent() {
            Some(parent) if !parent.as_os_str().is_empty() => fs::create_dir_all(parent)
                .map_err(|e| self.err(EngineError::io(parent, e, "Failed to create store directory"))),
            _ => Ok(()),
        }
    }

    fn open_with(&self, readonly: bool) -> DbResult<()> {
        self.state.check_openable()?;
        let path = self.state.file_path();
        let mut slot = self.table.write();
        if slot.is_some() {
            return Err(DbError::AlreadyOpen { name: self.state.name().to_string() });
        }

        if !path.is_file() {
            if readonly || !self.options.create_if_missing {
                return Err(DbError::Missing { path: path.to_path_buf() });
            }
            self.create_parent()?;
            write_snapshot(path, 0, std::iter::empty()).map_err(|e| self.err(e))?;
            info!(store = self.state.name(), path = %path.display(), "created empty store");
        }

        let snapshot = read_snapshot(path).map_err(|e| self.err(e))?;
        let table: Table = snapshot.entries.into_iter().collect();
        let records = table.len();
        *slot = Some(Arc::new(FlatTable::new(table)));
        self.state.mark_open(readonly);
        info!(store = self.state.name(), readonly, records, "store opened");
        Ok(())
    }

    fn read(&self, ns: u8, key: &[u8]) -> DbResult<Option<Vec<u8>>> {
        self.state.check_readable()?;
        let table = self.loaded_table()?;
        let value = table.data.read().get(&namespace::physical_key(ns, key)).cloned();
        Ok(value)
    }

    fn write(&self, ns: u8, key: &[u8], value: &[u8]) -> DbResult<()> {
        self.state.check_writable()?;
        let table = self.loaded_table()?;
        let key = namespace::physical_key(ns, key);
        check_entry_size(&key, value, MAX_KEY_SIZE, MAX_VALUE_SIZE).map_err(|e| self.err(e))?;
        table.data.write().insert(key, value.to_vec());
        table.dirty.store(true, Ordering::Release);
        Ok(())
    }

    fn cursor(&self, ns: u8, prefix: &[u8]) -> DbResult<Box<dyn DbAccessor>> {
        self.state.check_readable()?;
        let table = self.loaded_table()?;
        Ok(Box::new(PrefixCursor::new(FlatSource { table, namespace: ns }, prefix)))
    }
}

impl fmt::Debug for FlatDb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlatDb")
            .field("name", &self.state.name())
            .field("path", &self.state.file_path())
            .field("loaded", &self.state.loaded())
            .field("disabled", &self.state.disabled())
            .finish()
    }
}

impl Db for FlatDb {
    fn state(&self) -> &DbState {
        &self.state
    }

    fn exists(&self) -> bool {
        self.state.file_path().is_file()
    }

    fn remove(&self) -> DbResult<()> {
        self.state.check_closed()?;
        let path = self.state.file_path();
        if !path.is_file() {
            return Err(DbError::Missing { path: path.to_path_buf() });
        }
        fs::remove_file(path).map_err(|e| self.err(EngineError::io(path, e, "Failed to remove store")))?;
        info!(store = self.state.name(), path = %path.display(), "store removed");
        Ok(())
    }

    fn open(&self) -> DbResult<()> {
        self.open_with(false)
    }

    fn open_read_only(&self) -> DbResult<()> {
        self.open_with(true)
    }

    /// Persists a dirty table before releasing it. If that fails the store
    /// stays loaded with its writes intact, and `close` can be retried.
    fn close(&self) -> DbResult<()> {
        let mut slot = self.table.write();
        let Some(table) = slot.as_ref() else {
            return Ok(());
        };

        if !self.state.readonly() && table.dirty.load(Ordering::Acquire) {
            let records = table.persist(self.state.file_path()).map_err(|e| self.err(e))?;
            table.dirty.store(false, Ordering::Release);
            debug!(store = self.state.name(), records, "table persisted");
        }

        table.closed.store(true, Ordering::Release);
        slot.take();
        self.state.mark_closed();
        info!(store = self.state.name(), "store closed");
        Ok(())
    }

    fn backup(&self, snapshot: &Path) -> DbResult<()> {
        self.state.check_readable()?;
        let table = self.loaded_table()?;
        let records = table.persist(snapshot).map_err(|e| self.err(e))?;
        info!(store = self.state.name(), snapshot = %snapshot.display(), records, "backup written");
        Ok(())
    }

    fn restore(&self, snapshot: &Path) -> DbResult<()> {
        self.state.check_closed()?;
        let snap = read_snapshot(snapshot).map_err(|e| self.err(e))?;
        self.create_parent()?;
        let records = write_snapshot(
            self.state.file_path(),
            0,
            snap.entries.iter().map(|(k, v)| (k.as_slice(), v.as_slice())),
        )
        .map_err(|e| self.err(e))?;
        info!(store = self.state.name(), snapshot = %snapshot.display(), records, "store restored");
        Ok(())
    }

    fn meta_fetch(&self, key: &[u8]) -> DbResult<Option<Vec<u8>>> {
        self.read(META, key)
    }

    fn meta_update(&self, key: &[u8], value: &[u8]) -> DbResult<()> {
        self.write(META, key, value)
    }

    fn query_metadata(&self) -> DbResult<Box<dyn DbAccessor>> {
        self.cursor(META, &[])
    }

    fn query(&self, prefix: &[u8]) -> DbResult<Box<dyn DbAccessor>> {
        self.cursor(DATA, prefix)
    }

    fn fetch(&self, key: &[u8]) -> DbResult<Option<Vec<u8>>> {
        self.read(DATA, key)
    }

    fn update(&self, key: &[u8], value: &[u8]) -> DbResult<()> {
        self.write(DATA, key, value)
    }

    fn erase(&self, key: &[u8]) -> DbResult<bool> {
        self.state.check_writable()?;
        let table = self.loaded_table()?;
        let removed = table.data.write().remove(&namespace::physical_key(DATA, key)).is_some();
        if removed {
            table.dirty.store(true, Ordering::Release);
        }
        Ok(removed)
    }
}

/// Flat stores have no transactions; every call reports `Unsupported`.
impl Transactional for FlatDb {}

impl DbClass for FlatDb {
    const EXTENSION: &'static str = ".flat";
    type Options = FlatOptions;

    fn create(file_path: PathBuf, name: &str, options: FlatOptions) -> Self {
        Self::new(file_path, name, options)
    }
}
