//! The store contract.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{error, info, warn};

use crate::accessor::DbAccessor;
use crate::capability::{Recoverable, Transactional};
use crate::error::{DbError, DbResult};

/// Identity and lifecycle flags of one store.
///
/// `disabled` is independent of `loaded` and `readonly` and takes precedence
/// over both. The flags are plain atomics: disabling a store is a cooperative,
/// in-process signal only.
#[derive(Debug)]
pub struct DbState {
    name: String,
    file_path: PathBuf,
    loaded: AtomicBool,
    readonly: AtomicBool,
    disabled: AtomicBool,
}

impl DbState {
    pub fn new(name: impl Into<String>, file_path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            file_path: file_path.into(),
            loaded: AtomicBool::new(false),
            readonly: AtomicBool::new(false),
            disabled: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn file_path(&self) -> &Path {
        &self.file_path
    }

    pub fn loaded(&self) -> bool {
        self.loaded.load(Ordering::Acquire)
    }

    pub fn readonly(&self) -> bool {
        self.readonly.load(Ordering::Acquire)
    }

    pub fn disabled(&self) -> bool {
        self.disabled.load(Ordering::Acquire)
    }

    pub fn disable(&self) {
        self.disabled.store(true, Ordering::Release);
    }

    pub fn enable(&self) {
        self.disabled.store(false, Ordering::Release);
    }

    /// Record a successful open.
    pub fn mark_open(&self, readonly: bool) {
        self.readonly.store(readonly, Ordering::Release);
        self.loaded.store(true, Ordering::Release);
    }

    pub fn mark_closed(&self) {
        self.loaded.store(false, Ordering::Release);
        self.readonly.store(false, Ordering::Release);
    }

    /// Gate for queries and point reads: disabled, then not loaded.
    pub fn check_readable(&self) -> DbResult<()> {
        if self.disabled() {
            return Err(DbError::Disabled { name: self.name.clone() });
        }
        if !self.loaded() {
            return Err(DbError::NotLoaded { name: self.name.clone() });
        }
        Ok(())
    }

    /// Gate for mutations: disabled, then not loaded, then read-only.
    pub fn check_writable(&self) -> DbResult<()> {
        self.check_readable()?;
        if self.readonly() {
            return Err(DbError::ReadOnly { name: self.name.clone() });
        }
        Ok(())
    }

    /// Gate for operations on the backing storage that need the store closed.
    pub fn check_closed(&self) -> DbResult<()> {
        if self.loaded() {
            return Err(DbError::StillOpen { name: self.name.clone() });
        }
        Ok(())
    }

    /// Gate for `open` / `open_read_only`.
    pub fn check_openable(&self) -> DbResult<()> {
        if self.loaded() {
            return Err(DbError::AlreadyOpen { name: self.name.clone() });
        }
        Ok(())
    }
}

/// One logical key-value database.
///
/// Data records and metadata records live in separate key spaces. Every
/// query and CRUD call passes the [`DbState`] gate before any backend I/O.
/// All methods take `&self`; backends serialize their writers internally.
pub trait Db: Send + Sync {
    fn state(&self) -> &DbState;

    fn name(&self) -> &str {
        self.state().name()
    }

    fn file_path(&self) -> &Path {
        self.state().file_path()
    }

    fn loaded(&self) -> bool {
        self.state().loaded()
    }

    fn readonly(&self) -> bool {
        self.state().readonly()
    }

    fn disabled(&self) -> bool {
        self.state().disabled()
    }

    /// Take the store out of service without closing it.
    fn disable(&self) {
        self.state().disable();
    }

    fn enable(&self) {
        self.state().enable();
    }

    /// Whether backing storage is present. Needs no open store.
    fn exists(&self) -> bool;

    /// Delete the backing storage. Fails while loaded or when nothing exists.
    fn remove(&self) -> DbResult<()>;

    fn open(&self) -> DbResult<()>;

    fn open_read_only(&self) -> DbResult<()>;

    /// Release all resources and invalidate outstanding cursors. A no-op when
    /// not loaded.
    fn close(&self) -> DbResult<()>;

    /// Write a self-contained copy of the committed state to `snapshot`.
    fn backup(&self, snapshot: &Path) -> DbResult<()>;

    /// Replace the backing storage with a snapshot. The store must be closed.
    /// On failure the old storage is left untouched.
    fn restore(&self, snapshot: &Path) -> DbResult<()>;

    /// Initialize the metadata key space. Idempotent.
    fn create_metadata(&self) -> DbResult<()> {
        Ok(())
    }

    fn meta_fetch(&self, key: &[u8]) -> DbResult<Option<Vec<u8>>>;

    fn meta_update(&self, key: &[u8], value: &[u8]) -> DbResult<()>;

    /// Cursor over every metadata record.
    fn query_metadata(&self) -> DbResult<Box<dyn DbAccessor>>;

    /// Cursor over every data record.
    fn query_all(&self) -> DbResult<Box<dyn DbAccessor>> {
        self.query(&[])
    }

    /// Cursor over data records whose key starts with `prefix`.
    fn query(&self, prefix: &[u8]) -> DbResult<Box<dyn DbAccessor>>;

    fn fetch(&self, key: &[u8]) -> DbResult<Option<Vec<u8>>>;

    /// Insert or overwrite.
    fn update(&self, key: &[u8], value: &[u8]) -> DbResult<()>;

    /// Delete by exact key. `Ok(false)` if the key was absent.
    fn erase(&self, key: &[u8]) -> DbResult<bool>;

    fn as_transactional(&self) -> Option<&dyn Transactional> {
        None
    }

    fn as_recoverable(&self) -> Option<&dyn Recoverable> {
        None
    }
}

/// Open `db` read-write, repairing it once if it reports corruption.
///
/// A failed repair is terminal: the store is disabled so callers route
/// around it until it is restored or rebuilt.
pub fn open_or_recover(db: &dyn Db) -> DbResult<()> {
    let err = match db.open() {
        Ok(()) => return Ok(()),
        Err(err) => err,
    };
    if !err.is_corruption() {
        return Err(err);
    }
    let Some(recoverable) = db.as_recoverable() else {
        return Err(err);
    };

    warn!(store = db.name(), error = %err, "store corrupted, attempting recovery");
    if let Err(recover_err) = recoverable.recover() {
        error!(store = db.name(), error = %recover_err, "recovery failed, disabling store");
        db.disable();
        return Err(recover_err);
    }
    info!(store = db.name(), "store recovered");
    db.open()
}
