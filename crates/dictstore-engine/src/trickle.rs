//! Background flush of dirty keys into data files.
//!
//! A dedicated thread wakes on the configured cadence and appends the current
//! value of every key written since the last cycle, or a tombstone if the key
//! is gone. Nothing is evicted: the RAM table stays authoritative and the data
//! files only shorten the log replay after a crash.
//!
//! Every few cycles it also compacts data files whose dead space passes the
//! configured ratio.

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use hashbrown::HashSet;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, warn};

use crate::compaction::compact_store;
use crate::config::Config;
use crate::datafile::DataFileWriter;
use crate::engine::Table;
use crate::error::{EngineError, EngineResult};
use crate::layout::StoreLayout;

/// Run compaction after this many trickle cycles.
const COMPACTION_EVERY_CYCLES: u64 = 8;

/// Data file writer shared by the trickle thread, checkpoint and compaction.
/// `None` until the next flush needs a file.
pub type WriterSlot = Arc<Mutex<Option<DataFileWriter>>>;

/// Keys written in RAM since the last flush, plus flush counters.
#[derive(Default)]
pub struct DirtySet {
    keys: Mutex<HashSet<Vec<u8>>>,
    flushed: AtomicU64,
    cycles: AtomicU64,
}

impl DirtySet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark(&self, key: &[u8]) {
        self.keys.lock().insert(key.to_vec());
    }

    /// Empty the set and hand back what it held.
    pub fn drain(&self) -> HashSet<Vec<u8>> {
        std::mem::take(&mut *self.keys.lock())
    }

    pub fn len(&self) -> usize {
        self.keys.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.lock().is_empty()
    }

    /// Records written by all cycles so far.
    pub fn flushed(&self) -> u64 {
        self.flushed.load(Ordering::Relaxed)
    }

    pub fn cycles(&self) -> u64 {
        self.cycles.load(Ordering::Relaxed)
    }

    fn finish_cycle(&self, written: u64) {
        self.flushed.fetch_add(written, Ordering::Relaxed);
        self.cycles.fetch_add(1, Ordering::Relaxed);
    }
}

/// Owner of the trickle thread. Dropping it stops the thread after one last
/// flush.
pub struct TrickleHandle {
    shutdown: Arc<AtomicBool>,
    thread: Option<thread::JoinHandle<()>>,
}

impl TrickleHandle {
    /// Request graceful shutdown and wait for the final flush.
    pub fn shutdown(mut self) {
        self.stop();
    }

    pub fn is_running(&self) -> bool {
        self.thread.as_ref().is_some_and(|h| !h.is_finished())
    }

    fn stop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        if let Some(handle) = self.thread.take() {
            if handle.join().is_err() {
                error!("trickle thread panicked");
            }
        }
    }
}

impl Drop for TrickleHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Spawn the trickle thread for one open store.
///
/// A cycle drains the dirty set, copies each key's current value (absent keys
/// become tombstones) and appends them to the shared data file writer with a
/// single sync at the end.
pub fn start_trickle(
    layout: StoreLayout,
    data: Arc<RwLock<Table>>,
    dirty: Arc<DirtySet>,
    writer: WriterSlot,
    config: Config,
) -> EngineResult<TrickleHandle> {
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_flag = Arc::clone(&shutdown);
    let root = layout.root().to_path_buf();

    let thread = thread::Builder::new()
        .name("dictstore-trickle".to_string())
        .spawn(move || trickle_loop(layout, data, dirty, writer, config, shutdown_flag))
        .map_err(|e| EngineError::io(root, e, "Failed to spawn trickle thread"))?;

    Ok(TrickleHandle { shutdown, thread: Some(thread) })
}

fn trickle_loop(
    layout: StoreLayout,
    data: Arc<RwLock<Table>>,
    dirty: Arc<DirtySet>,
    writer: WriterSlot,
    config: Config,
    shutdown: Arc<AtomicBool>,
) {
    let data_dir = layout.data_dir();
    let poll = config.trickle_cadence.min(Duration::from_millis(100));

    loop {
        let wake_time = Instant::now() + config.trickle_cadence;
        while Instant::now() < wake_time && !shutdown.load(Ordering::Acquire) {
            thread::sleep(poll);
        }
        let stopping = shutdown.load(Ordering::Acquire);

        if let Err(e) = flush_dirty(&data, &dirty, &writer, &data_dir) {
            error!(error = %e, "trickle flush failed");
        }
        if stopping {
            return;
        }

        if dirty.cycles() % COMPACTION_EVERY_CYCLES == 0 {
            let guard = writer.lock();
            let active = guard.as_ref().map(|w| w.sequence());
            if let Err(e) = compact_store(&layout, config.compaction_trigger_ratio, active) {
                warn!(error = %e, "background compaction failed");
            }
        }
    }
}

/// Execute one flush cycle. Returns the number of records written.
///
/// Keys that fail to write are re-marked dirty for the next cycle.
pub fn flush_dirty(
    data: &RwLock<Table>,
    dirty: &DirtySet,
    writer: &Mutex<Option<DataFileWriter>>,
    data_dir: &Path,
) -> EngineResult<u64> {
    let mut slot = writer.lock();
    let dirty_keys = dirty.drain();
    if dirty_keys.is_empty() {
        dirty.finish_cycle(0);
        return Ok(0);
    }

    // Copy values under a short read lock; the I/O happens without it.
    let to_flush: Vec<(Vec<u8>, Option<Vec<u8>>)> = {
        let data = data.read();
        dirty_keys
            .into_iter()
            .map(|key| {
                let value = data.get(&key).cloned();
                (key, value)
            })
            .collect()
    };

    if slot.is_none() {
        match DataFileWriter::new(data_dir) {
            Ok(w) => *slot = Some(w),
            Err(e) => {
                for (key, _) in &to_flush {
                    dirty.mark(key);
                }
                return Err(e);
            }
        }
    }
    let Some(out) = slot.as_mut() else {
        return Ok(0);
    };

    let mut flushed = 0u64;
    for (key, value) in &to_flush {
        let result = match value {
            Some(val) => out.write_entry(key, val),
            None => out.write_tombstone(key),
        };
        match result {
            Ok(_) => flushed += 1,
            Err(e) => {
                warn!(key_len = key.len(), error = %e, "failed to flush key");
                dirty.mark(key);
            }
        }
    }

    if let Err(e) = out.sync() {
        for (key, _) in &to_flush {
            dirty.mark(key);
        }
        return Err(e);
    }

    dirty.finish_cycle(flushed);
    if flushed > 0 {
        debug!(flushed, file = %out.current_path().display(), "trickle flushed entries");
    }
    Ok(flushed)
}
