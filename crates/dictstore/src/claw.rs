//! `Db` implementation on top of `ClawEngine`.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info, warn};

use dictstore_api::{
    Db, DbAccessor, DbClass, DbError, DbResult, DbState, Recoverable, Transactional,
};
use dictstore_engine::format::check_entry_size;
use dictstore_engine::{ClawEngine, Config, EngineStats, OpenMode, ENGINE_VERSION};

use crate::cursor::{ClawCursor, EngineSource};
use crate::error::db_error;
use crate::namespace::{self, DATA, META};
use crate::tx::{Staged, TxBuffer};

/// Metadata key holding the store's logical name.
pub const META_DB_NAME: &[u8] = b"/db_name";

/// Metadata key holding the engine version that initialized the store.
pub const META_ENGINE_VERSION: &[u8] = b"/engine_version";

/// Directory-backed dictionary store.
///
/// Each successful open owns a fresh engine; cursors hold a clone of it, so
/// closing the store turns every outstanding cursor into a
/// `CursorInvalidated` error on its next step.
pub struct ClawDb {
    state: DbState,
    config: Config,
    engine: RwLock<Option<Arc<ClawEngine>>>,
    tx: RwLock<Option<TxBuffer>>,
}

impl ClawDb {
    pub fn new(file_path: impl Into<PathBuf>, name: &str, config: Config) -> Self {
        Self {
            state: DbState::new(name, file_path),
            config,
            engine: RwLock::new(None),
            tx: RwLock::new(None),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Fold the log into a fresh base file now instead of waiting for close.
    pub fn checkpoint(&self) -> DbResult<()> {
        let engine = self.writable_engine()?;
        engine.checkpoint().map(|_| ()).map_err(|e| self.err(e))
    }

    /// Rewrite data files whose dead space passes the configured ratio.
    /// Returns the bytes reclaimed.
    pub fn compact(&self) -> DbResult<u64> {
        let engine = self.writable_engine()?;
        let results = engine.compact().map_err(|e| self.err(e))?;
        Ok(results.iter().map(|r| r.bytes_saved()).sum())
    }

    /// Make every write so far durable, regardless of `Config::sync_writes`.
    pub fn sync(&self) -> DbResult<()> {
        let engine = self.writable_engine()?;
        engine.sync().map_err(|e| self.err(e))
    }

    /// Engine counters, or `None` while closed.
    pub fn stats(&self) -> Option<EngineStats> {
        self.engine.read().as_ref().map(|engine| engine.stats())
    }

    fn err(&self, err: dictstore_engine::EngineError) -> DbError {
        db_error(&self.state, err)
    }

    fn loaded_engine(&self) -> DbResult<Arc<ClawEngine>> {
        self.engine
            .read()
            .as_ref()
            .cloned()
            .ok_or_else(|| DbError::NotLoaded { name: self.state.name().to_string() })
    }

    fn readable_engine(&self) -> DbResult<Arc<ClawEngine>> {
        self.state.check_readable()?;
        self.loaded_engine()
    }

    fn writable_engine(&self) -> DbResult<Arc<ClawEngine>> {
        self.state.check_writable()?;
        self.loaded_engine()
    }

    fn open_with(&self, mode: OpenMode) -> DbResult<()> {
        self.state.check_openable()?;
        let mut slot = self.engine.write();
        if slot.is_some() {
            return Err(DbError::AlreadyOpen { name: self.state.name().to_string() });
        }
        let engine = ClawEngine::open(self.state.file_path(), self.config.clone(), mode)
            .map_err(|e| self.err(e))?;
        *slot = Some(Arc::new(engine));
        self.state.mark_open(mode == OpenMode::ReadOnly);
        info!(store = self.state.name(), ?mode, "store opened");
        Ok(())
    }

    fn read(&self, ns: u8, key: &[u8]) -> DbResult<Option<Vec<u8>>> {
        let engine = self.readable_engine()?;
        let key = namespace::physical_key(ns, key);
        if let Some(buffer) = self.tx.read().as_ref() {
            match buffer.lookup(&key) {
                Staged::Value(value) => return Ok(Some(value.to_vec())),
                Staged::Erased => return Ok(None),
                Staged::Untouched => {}
            }
        }
        engine.get(&key).map_err(|e| self.err(e))
    }

    /// Apply or stage one mutation. `value == None` erases. Returns whether
    /// the key existed beforehand.
    fn write(&self, ns: u8, key: &[u8], value: Option<&[u8]>) -> DbResult<bool> {
        let engine = self.writable_engine()?;
        let key = namespace::physical_key(ns, key);

        let mut tx = self.tx.write();
        if let Some(buffer) = tx.as_mut() {
            if let Err(err) = check_entry_size(
                &key,
                value.unwrap_or(&[]),
                self.config.max_key_size,
                self.config.max_value_size,
            ) {
                buffer.poison(err.to_string());
                return Err(self.err(err));
            }
            let existed = match buffer.lookup(&key) {
                Staged::Value(_) => true,
                Staged::Erased => false,
                Staged::Untouched => engine.contains_key(&key).map_err(|e| self.err(e))?,
            };
            match value {
                Some(value) => buffer.put(key, value.to_vec()),
                None => buffer.erase(key),
            }
            return Ok(existed);
        }
        drop(tx);

        let result = match value {
            Some(value) => engine.put(&key, value).map(|_| true),
            None => engine.delete(&key),
        };
        result.map_err(|e| self.err(e))
    }

    fn cursor(&self, ns: u8, prefix: &[u8]) -> DbResult<Box<dyn DbAccessor>> {
        let engine = self.readable_engine()?;
        Ok(Box::new(ClawCursor::new(EngineSource::new(engine, ns), prefix)))
    }
}

impl fmt::Debug for ClawDb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClawDb")
            .field("name", &self.state.name())
            .field("path", &self.state.file_path())
            .field("loaded", &self.state.loaded())
            .field("readonly", &self.state.readonly())
            .field("disabled", &self.state.disabled())
            .field("in_transaction", &self.in_transaction())
            .finish()
    }
}

impl Db for ClawDb {
    fn state(&self) -> &DbState {
        &self.state
    }

    fn exists(&self) -> bool {
        ClawEngine::exists(self.state.file_path())
    }

    fn remove(&self) -> DbResult<()> {
        self.state.check_closed()?;
        ClawEngine::destroy(self.state.file_path()).map_err(|e| self.err(e))
    }

    fn open(&self) -> DbResult<()> {
        self.open_with(OpenMode::ReadWrite)
    }

    fn open_read_only(&self) -> DbResult<()> {
        self.open_with(OpenMode::ReadOnly)
    }

    fn close(&self) -> DbResult<()> {
        if let Some(buffer) = self.tx.write().take() {
            warn!(store = self.state.name(), staged = buffer.len(), "closing store with open transaction, aborting it");
        }
        let Some(engine) = self.engine.write().take() else {
            return Ok(());
        };
        self.state.mark_closed();
        let result = engine.close().map_err(|e| self.err(e));
        info!(store = self.state.name(), "store closed");
        result
    }

    fn backup(&self, snapshot: &Path) -> DbResult<()> {
        let engine = self.readable_engine()?;
        let records = engine.snapshot_to(snapshot).map_err(|e| self.err(e))?;
        info!(store = self.state.name(), snapshot = %snapshot.display(), records, "backup written");
        Ok(())
    }

    fn restore(&self, snapshot: &Path) -> DbResult<()> {
        self.state.check_closed()?;
        let records = ClawEngine::restore(self.state.file_path(), snapshot).map_err(|e| self.err(e))?;
        info!(store = self.state.name(), snapshot = %snapshot.display(), records, "store restored");
        Ok(())
    }

    fn create_metadata(&self) -> DbResult<()> {
        let name = self.state.name().as_bytes();
        if self.meta_fetch(META_DB_NAME)?.as_deref() != Some(name) {
            self.meta_update(META_DB_NAME, name)?;
        }
        if self.meta_fetch(META_ENGINE_VERSION)?.is_none() {
            self.meta_update(META_ENGINE_VERSION, ENGINE_VERSION.as_bytes())?;
        }
        Ok(())
    }

    fn meta_fetch(&self, key: &[u8]) -> DbResult<Option<Vec<u8>>> {
        self.read(META, key)
    }

    fn meta_update(&self, key: &[u8], value: &[u8]) -> DbResult<()> {
        self.write(META, key, Some(value)).map(|_| ())
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
        self.write(DATA, key, Some(value)).map(|_| ())
    }

    fn erase(&self, key: &[u8]) -> DbResult<bool> {
        self.write(DATA, key, None)
    }

    fn as_transactional(&self) -> Option<&dyn Transactional> {
        Some(self)
    }

    fn as_recoverable(&self) -> Option<&dyn Recoverable> {
        Some(self)
    }
}

impl Transactional for ClawDb {
    fn begin_transaction(&self) -> DbResult<()> {
        self.state.check_writable()?;
        let mut tx = self.tx.write();
        if tx.is_some() {
            return Err(DbError::TransactionActive);
        }
        *tx = Some(TxBuffer::new());
        debug!(store = self.state.name(), "transaction started");
        Ok(())
    }

    fn commit_transaction(&self) -> DbResult<()> {
        let mut tx = self.tx.write();
        if tx.is_none() {
            return Err(DbError::NoTransaction);
        }
        let engine = self.writable_engine()?;
        let Some(buffer) = tx.take() else {
            return Err(DbError::NoTransaction);
        };

        if let Some(reason) = buffer.poisoned() {
            warn!(store = self.state.name(), reason, "aborting poisoned transaction");
            return Err(DbError::TransactionAborted { reason: reason.to_string() });
        }
        let ops = buffer.into_ops();
        let staged = ops.len();
        engine.apply_batch(&ops).map_err(|e| {
            warn!(store = self.state.name(), error = %e, "transaction commit failed");
            DbError::TransactionAborted { reason: e.to_string() }
        })?;
        debug!(store = self.state.name(), ops = staged, "transaction committed");
        Ok(())
    }

    fn abort_transaction(&self) -> DbResult<()> {
        let buffer = self.tx.write().take().ok_or(DbError::NoTransaction)?;
        debug!(store = self.state.name(), discarded = buffer.len(), "transaction aborted");
        Ok(())
    }

    fn in_transaction(&self) -> bool {
        self.tx.read().is_some()
    }
}

impl Recoverable for ClawDb {
    fn recover(&self) -> DbResult<()> {
        self.state.check_closed()?;
        let report = ClawEngine::salvage(self.state.file_path()).map_err(|e| DbError::RecoveryFailed {
            name: self.state.name().to_string(),
            reason: e.to_string(),
        })?;
        info!(
            store = self.state.name(),
            kept = report.kept,
            damaged_regions = report.damaged_regions,
            "store recovered"
        );
        Ok(())
    }
}

impl DbClass for ClawDb {
    const EXTENSION: &'static str = ".claw";
    type Options = Config;

    fn create(file_path: PathBuf, name: &str, options: Config) -> Self {
        Self::new(file_path, name, options)
    }
}
