//! Core storage engine.
//!
//! `ClawEngine` combines an ordered RAM table with a crash-safe WAL, a
//! background trickle engine flushing dirty entries to data files, and
//! checkpoints that fold everything into a single base file.
//!
//! **Read path**: RAM-first (ordered `BTreeMap` behind a `RwLock`)
//! **Write path**: WAL-first, then RAM, then mark dirty for trickle
//! **Load path**: newest base, then newer data files, then WAL from the base's floor
//!
//! Lock order is WAL → data file writer → RAM table.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard, RwLock};
use tracing::{debug, info, warn};

use crate::compaction::{compact_store, CompactionResult};
use crate::config::Config;
use crate::datafile::DataFileReader;
use crate::error::{EngineError, EngineResult};
use crate::format::{check_entry_size, Operation};
use crate::layout::StoreLayout;
use crate::platform_durability::{sync_dir, FileLock, LockMode};
use crate::snapshot::{read_snapshot, write_snapshot};
use crate::trickle::{start_trickle, DirtySet, TrickleHandle, WriterSlot};
use crate::wal::{BatchOp, WalReader, WalWriter};

/// The RAM table: byte-wise ordered keys.
pub type Table = BTreeMap<Vec<u8>, Vec<u8>>;

/// How a store is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    ReadWrite,
    ReadOnly,
}

/// What loading a store found on disk.
#[derive(Debug, Default)]
pub struct LoadReport {
    /// Records read from the base file
    pub base_records: usize,
    /// Data files applied on top of the base
    pub data_files: usize,
    /// WAL entries replayed
    pub wal_entries: usize,
    /// One description per damaged region
    pub damage: Vec<String>,
    /// Files that ended in an incomplete record
    pub torn_tails: usize,
    /// Transactions dropped because their commit never reached disk
    pub discarded_batches: usize,
}

/// Outcome of `ClawEngine::salvage`.
#[derive(Debug)]
pub struct SalvageReport {
    /// Live keys written to the fresh base
    pub kept: usize,
    /// Damaged regions skipped
    pub damaged_regions: usize,
    pub torn_tails: usize,
    pub discarded_batches: usize,
    /// Old files deleted after the fresh base was installed
    pub removed_files: usize,
}

/// Point-in-time counters.
#[derive(Debug, Clone, Default)]
pub struct EngineStats {
    pub entries: usize,
    pub dirty: usize,
    pub total_flushed: u64,
    pub trickle_cycles: u64,
    pub wal_sequence: u64,
}

/// Core storage engine: ordered RAM table + WAL + trickle flush + checkpoints.
///
/// All public methods take `&self`. Readers share the table's read lock;
/// writers serialize through the WAL mutex and hold it across their RAM update
/// so the log order and the table agree.
pub struct ClawEngine {
    layout: StoreLayout,
    config: Config,
    mode: OpenMode,
    data: Arc<RwLock<Table>>,
    /// `None` for read-only engines and after close
    wal: Mutex<Option<WalWriter>>,
    dirty: Arc<DirtySet>,
    writer: WriterSlot,
    trickle: Mutex<Option<TrickleHandle>>,
    lock: Mutex<Option<FileLock>>,
    closed: AtomicBool,
}

impl std::fmt::Debug for ClawEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClawEngine")
            .field("root", &self.layout.root())
            .field("mode", &self.mode)
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl ClawEngine {
    /// Open a store directory.
    ///
    /// Read-write opens take an exclusive lock, create the store when it is
    /// missing and `Config::create_if_missing` is set, start a new WAL file and
    /// optionally the trickle thread. Read-only opens take a shared lock and
    /// never write.
    ///
    /// Any damaged file fails the open with `EngineError::Corrupted`; see
    /// `salvage`. A torn tail is the normal crash signature and is tolerated.
    pub fn open<P: AsRef<Path>>(path: P, config: Config, mode: OpenMode) -> EngineResult<Self> {
        config.validate().map_err(EngineError::InvalidConfig)?;
        let layout = StoreLayout::new(path.as_ref());

        if !layout.exists() {
            if mode == OpenMode::ReadOnly || !config.create_if_missing {
                return Err(EngineError::NotFound { path: layout.root().to_path_buf() });
            }
            info!(path = %layout.root().display(), "creating store");
        }
        if mode == OpenMode::ReadWrite {
            layout.create_dirs()?;
        }

        let lock_mode = match mode {
            OpenMode::ReadWrite => LockMode::Exclusive,
            OpenMode::ReadOnly => LockMode::Shared,
        };
        let lock = FileLock::acquire(&layout.lock_path(), lock_mode)?;

        let (table, report) = load_state(&layout, true)?;
        if let Some(first) = report.damage.first() {
            return Err(EngineError::Corrupted {
                path: layout.root().to_path_buf(),
                regions: report.damage.len(),
                first: first.clone(),
            });
        }
        info!(
            path = %layout.root().display(),
            ?mode,
            entries = table.len(),
            base_records = report.base_records,
            data_files = report.data_files,
            wal_entries = report.wal_entries,
            torn_tails = report.torn_tails,
            "store opened"
        );

        let wal = match mode {
            OpenMode::ReadWrite => Some(WalWriter::new(layout.wal_dir(), config.wal_rotation_size_bytes)?),
            OpenMode::ReadOnly => None,
        };

        let engine = Self {
            layout,
            config,
            mode,
            data: Arc::new(RwLock::new(table)),
            wal: Mutex::new(wal),
            dirty: Arc::new(DirtySet::new()),
            writer: Arc::new(Mutex::new(None)),
            trickle: Mutex::new(None),
            lock: Mutex::new(Some(lock)),
            closed: AtomicBool::new(false),
        };

        if mode == OpenMode::ReadWrite && engine.config.enable_trickle {
            engine.start_trickle()?;
        }
        Ok(engine)
    }

    /// Whether a store directory exists at `path`.
    pub fn exists<P: AsRef<Path>>(path: P) -> bool {
        StoreLayout::new(path.as_ref()).exists()
    }

    /// Delete a store directory. Fails if it is missing or locked.
    pub fn destroy<P: AsRef<Path>>(path: P) -> EngineResult<()> {
        let layout = StoreLayout::new(path.as_ref());
        if !layout.exists() {
            return Err(EngineError::NotFound { path: layout.root().to_path_buf() });
        }
        drop(FileLock::acquire(&layout.lock_path(), LockMode::Exclusive)?);
        std::fs::remove_dir_all(layout.root())
            .map_err(|e| EngineError::io(layout.root(), e, "Failed to remove store"))?;
        info!(path = %layout.root().display(), "store removed");
        Ok(())
    }

    /// Replace a closed store's contents with a snapshot.
    ///
    /// The snapshot is validated first; an invalid one leaves the store
    /// untouched. Installation is a single rename of a new base whose WAL floor
    /// lies past every existing WAL file. Returns the number of records restored.
    pub fn restore<P: AsRef<Path>>(path: P, snapshot: &Path) -> EngineResult<u64> {
        let snap = read_snapshot(snapshot)?;
        let layout = StoreLayout::new(path.as_ref());
        layout.create_dirs()?;
        let _lock = FileLock::acquire(&layout.lock_path(), LockMode::Exclusive)?;

        let base_seq = layout.max_data_sequence()? + 1;
        let floor = next_wal_sequence(&layout)?;
        let count = write_snapshot(
            &layout.base_path(base_seq),
            floor,
            snap.entries.iter().map(|(k, v)| (k.as_slice(), v.as_slice())),
        )?;
        let removed = remove_superseded(&layout, base_seq, floor)?;

        info!(
            path = %layout.root().display(),
            snapshot = %snapshot.display(),
            records = count,
            removed_files = removed,
            "store restored from snapshot"
        );
        Ok(count)
    }

    /// Rebuild a closed store from whatever can still be read.
    ///
    /// Damaged regions are skipped, the surviving state is written as a fresh
    /// base and every other file is deleted.
    pub fn salvage<P: AsRef<Path>>(path: P) -> EngineResult<SalvageReport> {
        let layout = StoreLayout::new(path.as_ref());
        if !layout.exists() {
            return Err(EngineError::NotFound { path: layout.root().to_path_buf() });
        }
        layout.create_dirs()?;
        let _lock = FileLock::acquire(&layout.lock_path(), LockMode::Exclusive)?;

        let (table, load) = load_state(&layout, false)?;
        let base_seq = layout.max_data_sequence()? + 1;
        let floor = next_wal_sequence(&layout)?;
        write_snapshot(
            &layout.base_path(base_seq),
            floor,
            table.iter().map(|(k, v)| (k.as_slice(), v.as_slice())),
        )?;
        let removed_files = remove_superseded(&layout, base_seq, floor)? + remove_leftovers(&layout)?;

        let report = SalvageReport {
            kept: table.len(),
            damaged_regions: load.damage.len(),
            torn_tails: load.torn_tails,
            discarded_batches: load.discarded_batches,
            removed_files,
        };
        if report.damaged_regions > 0 {
            warn!(path = %layout.root().display(), ?report, "store salvaged with data loss");
        } else {
            info!(path = %layout.root().display(), ?report, "store salvaged");
        }
        Ok(report)
    }

    /// Start the background trickle engine.
    ///
    /// Not starting trickle is valid; the WAL provides crash safety regardless.
    pub fn start_trickle(&self) -> EngineResult<()> {
        self.ensure_writable()?;
        let mut trickle = self.trickle.lock();
        if trickle.is_some() {
            return Ok(());
        }
        *trickle = Some(start_trickle(
            self.layout.clone(),
            Arc::clone(&self.data),
            Arc::clone(&self.dirty),
            Arc::clone(&self.writer),
            self.config.clone(),
        )?);
        Ok(())
    }

    /// Stop the background trickle engine, waiting for its final flush.
    pub fn stop_trickle(&self) {
        if let Some(handle) = self.trickle.lock().take() {
            handle.shutdown();
        }
    }

    /// Get value for key from RAM. Never touches disk.
    pub fn get(&self, key: &[u8]) -> EngineResult<Option<Vec<u8>>> {
        self.ensure_open()?;
        Ok(self.data.read().get(key).cloned())
    }

    pub fn contains_key(&self, key: &[u8]) -> EngineResult<bool> {
        self.ensure_open()?;
        Ok(self.data.read().contains_key(key))
    }

    /// First record whose key lies after `from` (ordered by bytes).
    pub fn seek(&self, from: Bound<&[u8]>) -> EngineResult<Option<(Vec<u8>, Vec<u8>)>> {
        self.ensure_open()?;
        let data = self.data.read();
        Ok(data
            .range::<[u8], _>((from, Bound::Unbounded))
            .next()
            .map(|(k, v)| (k.clone(), v.clone())))
    }

    /// Put key-value pair.
    ///
    /// WRITE ORDERING:
    /// 1. WAL append (synced when `Config::sync_writes`)
    /// 2. RAM insert
    /// 3. Mark dirty for trickle
    ///
    /// If the WAL write fails, RAM is never modified.
    pub fn put(&self, key: &[u8], value: &[u8]) -> EngineResult<()> {
        self.check_size(key, value)?;
        let mut wal = self.wal_guard()?;
        let writer = wal.as_mut().ok_or(EngineError::ReadOnly)?;
        if self.config.sync_writes {
            writer.append_durable(key, value, Operation::Put)?;
        } else {
            writer.append_fast(key, value, Operation::Put)?;
        }
        self.data.write().insert(key.to_vec(), value.to_vec());
        drop(wal);
        self.dirty.mark(key);
        Ok(())
    }

    /// Delete a key. Returns `false` without logging anything if it was absent.
    pub fn delete(&self, key: &[u8]) -> EngineResult<bool> {
        let mut wal = self.wal_guard()?;
        let writer = wal.as_mut().ok_or(EngineError::ReadOnly)?;
        if !self.data.read().contains_key(key) {
            return Ok(false);
        }
        if self.config.sync_writes {
            writer.append_durable(key, &[], Operation::Delete)?;
        } else {
            writer.append_fast(key, &[], Operation::Delete)?;
        }
        self.data.write().remove(key);
        drop(wal);
        self.dirty.mark(key);
        Ok(true)
    }

    /// Apply a batch atomically: framed in the WAL, synced once, and applied
    /// to RAM under a single write lock.
    pub fn apply_batch(&self, ops: &[BatchOp]) -> EngineResult<()> {
        for op in ops {
            self.check_size(&op.key, op.value.as_deref().unwrap_or(&[]))?;
        }
        let mut wal = self.wal_guard()?;
        let writer = wal.as_mut().ok_or(EngineError::ReadOnly)?;
        if ops.is_empty() {
            return Ok(());
        }
        let batch_id = writer.append_batch(ops)?;
        {
            let mut data = self.data.write();
            for op in ops {
                match &op.value {
                    Some(value) => {
                        data.insert(op.key.clone(), value.clone());
                    }
                    None => {
                        data.remove(&op.key);
                    }
                }
            }
        }
        drop(wal);
        for op in ops {
            self.dirty.mark(&op.key);
        }
        debug!(batch_id, ops = ops.len(), "batch applied");
        Ok(())
    }

    /// Make every WAL write so far durable.
    pub fn sync(&self) -> EngineResult<()> {
        let wal = self.wal_guard()?;
        match wal.as_ref() {
            Some(writer) => writer.sync(),
            None => Ok(()),
        }
    }

    /// Write the current state to a standalone snapshot file.
    ///
    /// Writers are held off for the duration so the snapshot is one
    /// consistent state. Returns the number of records written.
    pub fn snapshot_to(&self, path: &Path) -> EngineResult<u64> {
        self.ensure_open()?;
        let data = self.data.read();
        let count = write_snapshot(path, 0, data.iter().map(|(k, v)| (k.as_slice(), v.as_slice())))?;
        info!(path = %path.display(), records = count, "snapshot taken");
        Ok(count)
    }

    /// Fold the WAL and all data files into a new base file.
    pub fn checkpoint(&self) -> EngineResult<u64> {
        self.ensure_writable()?;
        self.checkpoint_inner()
    }

    fn checkpoint_inner(&self) -> EngineResult<u64> {
        let mut wal = self.wal.lock();
        let Some(wal_writer) = wal.as_mut() else {
            return Err(EngineError::ReadOnly);
        };
        let mut slot = self.writer.lock();

        let floor = wal_writer.start_new_file()?;
        if let Some(old) = slot.take() {
            old.sync()?;
        }
        let base_seq = self.layout.max_data_sequence()? + 1;
        let count = {
            let data = self.data.read();
            write_snapshot(
                &self.layout.base_path(base_seq),
                floor,
                data.iter().map(|(k, v)| (k.as_slice(), v.as_slice())),
            )?
        };
        self.dirty.drain();
        let removed = remove_superseded(&self.layout, base_seq, floor)?;

        info!(
            path = %self.layout.root().display(),
            base = base_seq,
            wal_floor = floor,
            records = count,
            removed_files = removed,
            "checkpoint complete"
        );
        Ok(count)
    }

    /// Compact data files whose dead space passes `Config::compaction_trigger_ratio`.
    pub fn compact(&self) -> EngineResult<Vec<CompactionResult>> {
        self.ensure_writable()?;
        let slot = self.writer.lock();
        let active = slot.as_ref().map(|w| w.sequence());
        compact_store(&self.layout, self.config.compaction_trigger_ratio, active)
    }

    /// Close the engine: stop trickle, checkpoint when configured, release the lock.
    ///
    /// Safe to call more than once. Every later call on this engine fails
    /// with `EngineError::Closed`.
    pub fn close(&self) -> EngineResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.stop_trickle();

        let result = if self.mode == OpenMode::ReadWrite {
            if self.config.checkpoint_on_close {
                self.checkpoint_inner().map(|_| ())
            } else {
                self.flush_writers()
            }
        } else {
            Ok(())
        };

        self.wal.lock().take();
        self.writer.lock().take();
        self.lock.lock().take();
        info!(path = %self.layout.root().display(), "store closed");
        result
    }

    fn flush_writers(&self) -> EngineResult<()> {
        if let Some(writer) = self.wal.lock().as_ref() {
            writer.sync()?;
        }
        if let Some(writer) = self.writer.lock().as_ref() {
            writer.sync()?;
        }
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn mode(&self) -> OpenMode {
        self.mode
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn path(&self) -> &Path {
        self.layout.root()
    }

    /// Number of key-value pairs in RAM.
    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.read().is_empty()
    }

    pub fn stats(&self) -> EngineStats {
        EngineStats {
            entries: self.len(),
            dirty: self.dirty.len(),
            total_flushed: self.dirty.flushed(),
            trickle_cycles: self.dirty.cycles(),
            wal_sequence: self.wal.lock().as_ref().map_or(0, |w| w.sequence()),
        }
    }

    fn ensure_open(&self) -> EngineResult<()> {
        if self.is_closed() {
            return Err(EngineError::Closed);
        }
        Ok(())
    }

    fn ensure_writable(&self) -> EngineResult<()> {
        self.ensure_open()?;
        if self.mode == OpenMode::ReadOnly {
            return Err(EngineError::ReadOnly);
        }
        Ok(())
    }

    fn wal_guard(&self) -> EngineResult<MutexGuard<'_, Option<WalWriter>>> {
        self.ensure_writable()?;
        let guard = self.wal.lock();
        if guard.is_none() {
            return Err(EngineError::Closed);
        }
        Ok(guard)
    }

    fn check_size(&self, key: &[u8], value: &[u8]) -> EngineResult<()> {
        check_entry_size(key, value, self.config.max_key_size, self.config.max_value_size)
    }
}

impl Drop for ClawEngine {
    fn drop(&mut self) {
        self.stop_trickle();
        if !self.is_closed() {
            if let Err(e) = self.flush_writers() {
                warn!(error = %e, "failed to sync store on drop");
            }
        }
    }
}

/// Rebuild the RAM table from disk.
///
/// Strict loads fail on an unreadable base; tolerant loads fall back to older
/// bases and record the damage instead.
fn load_state(layout: &StoreLayout, strict: bool) -> EngineResult<(Table, LoadReport)> {
    let mut table = Table::new();
    let mut report = LoadReport::default();

    let mut base_seq = 0;
    let mut floor = 0;
    for (seq, path) in layout.base_files()?.into_iter().rev() {
        match read_snapshot(&path) {
            Ok(snap) => {
                report.base_records = snap.entries.len();
                table.extend(snap.entries);
                base_seq = seq;
                floor = snap.wal_floor;
                break;
            }
            Err(e) if strict => return Err(e),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "skipping unreadable base file");
                report.damage.push(e.to_string());
            }
        }
    }

    for (seq, path) in layout.data_files()? {
        if seq <= base_seq {
            continue;
        }
        let scan = DataFileReader::scan(&path)?;
        report.data_files += 1;
        report.damage.extend(scan.damage);
        if scan.torn {
            report.torn_tails += 1;
        }
        for entry in scan.entries {
            if entry.is_tombstone {
                table.remove(&entry.key);
            } else {
                table.insert(entry.key, entry.value);
            }
        }
    }

    let recovery = WalReader::new(layout.wal_dir()).recover(floor)?;
    report.wal_entries = recovery.entries.len();
    report.damage.extend(recovery.damage);
    report.torn_tails += recovery.torn_tails;
    report.discarded_batches = recovery.discarded_batches;
    for entry in recovery.entries {
        match entry.operation {
            Operation::Put => {
                table.insert(entry.key, entry.value);
            }
            Operation::Delete => {
                table.remove(&entry.key);
            }
            Operation::BatchBegin | Operation::BatchCommit => {}
        }
    }

    Ok((table, report))
}

fn next_wal_sequence(layout: &StoreLayout) -> EngineResult<u64> {
    Ok(layout.wal_files()?.last().map_or(1, |(seq, _)| seq + 1))
}

/// Delete base and data files older than `base_seq` and WAL files below `floor`.
fn remove_superseded(layout: &StoreLayout, base_seq: u64, floor: u64) -> EngineResult<usize> {
    let mut stale: Vec<PathBuf> = Vec::new();
    for (seq, path) in layout.base_files()?.into_iter().chain(layout.data_files()?) {
        if seq < base_seq {
            stale.push(path);
        }
    }
    for (seq, path) in layout.wal_files()? {
        if seq < floor {
            stale.push(path);
        }
    }

    for path in &stale {
        std::fs::remove_file(path)
            .map_err(|e| EngineError::io(path, e, "Failed to remove superseded file"))?;
    }
    sync_dir(&layout.data_dir())?;
    sync_dir(&layout.wal_dir())?;
    Ok(stale.len())
}

/// Delete interrupted `.tmp` and `.compact` files.
fn remove_leftovers(layout: &StoreLayout) -> EngineResult<usize> {
    let dir = layout.data_dir();
    let entries = std::fs::read_dir(&dir)
        .map_err(|e| EngineError::io(&dir, e, "Failed to read data directory"))?;
    let mut removed = 0;
    for entry in entries.flatten() {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name.ends_with(".tmp") || name.ends_with(".compact") {
            std::fs::remove_file(entry.path())
                .map_err(|e| EngineError::io(entry.path(), e, "Failed to remove leftover file"))?;
            removed += 1;
        }
    }
    Ok(removed)
}
