//! Write-ahead log.
//!
//! Every mutation is framed, appended and (unless the caller opted out)
//! synced before the RAM table changes, so a crash can only lose writes the
//! caller was never told succeeded. Files are named `wal-<seq>.claw` and roll
//! over at the configured size.
//!
//! Batches are framed by `BatchBegin` / `BatchCommit` markers and synced once.
//! Replay only surfaces a batch whose commit marker made it to disk.

use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, error, warn};

use crate::error::{EngineError, EngineResult};
use crate::format::{
    deserialize_entry, serialize_entry, serialize_marker, Operation, WalEntry, HEADER_SIZE,
    MAGIC_ARRAY,
};
use crate::layout::{file_name, list_sequenced, WAL_PREFIX};
use crate::platform_durability::durable_sync;

/// One mutation inside an atomic batch. `None` deletes the key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchOp {
    pub key: Vec<u8>,
    pub value: Option<Vec<u8>>,
}

/// Appends frames to the newest WAL file.
///
/// Callers apply a mutation to RAM only after the append (and its sync, when
/// one is due) has returned.
pub struct WalWriter {
    file: File,
    path: PathBuf,
    /// Bytes written to the current file
    size: u64,
    wal_dir: PathBuf,
    sequence: u64,
    rotation_size: u64,
    next_batch_id: u64,
    /// A failed append could not be cut off; the next append starts a new file.
    abandoned: bool,
    #[cfg(test)]
    fail_next_sync: bool,
}

impl WalWriter {
    /// Always starts a fresh file one past the highest existing sequence, so
    /// new entries never land behind a torn tail left by a crash.
    pub fn new<P: AsRef<Path>>(wal_dir: P, rotation_size: u64) -> EngineResult<Self> {
        let wal_dir = wal_dir.as_ref().to_path_buf();

        std::fs::create_dir_all(&wal_dir)
            .map_err(|e| EngineError::io(&wal_dir, e, "Failed to create WAL directory"))?;

        let sequence = list_sequenced(&wal_dir, WAL_PREFIX)?
            .last()
            .map(|(seq, _)| seq + 1)
            .unwrap_or(1);
        let path = wal_dir.join(file_name(WAL_PREFIX, sequence));
        let file = open_append(&path)?;

        Ok(Self {
            file,
            path,
            size: 0,
            wal_dir,
            sequence,
            rotation_size,
            next_batch_id: 1,
            abandoned: false,
            #[cfg(test)]
            fail_next_sync: false,
        })
    }

    /// Append one entry and sync it.
    pub fn append_durable(&mut self, key: &[u8], value: &[u8], op: Operation) -> EngineResult<()> {
        let frame = serialize_entry(key, value, op)?;
        self.append(&frame, true)
    }

    /// Append one entry without syncing; it is durable after the next `sync()`.
    pub fn append_fast(&mut self, key: &[u8], value: &[u8], op: Operation) -> EngineResult<()> {
        let frame = serialize_entry(key, value, op)?;
        self.append(&frame, false)
    }

    /// Append a whole batch framed by markers, with a single sync at the end.
    ///
    /// Returns the batch id written into the markers.
    pub fn append_batch(&mut self, ops: &[BatchOp]) -> EngineResult<u64> {
        let batch_id = self.next_batch_id;
        self.next_batch_id += 1;

        // Serialize everything up front so a size error writes nothing
        let mut buffer = serialize_marker(Operation::BatchBegin, batch_id)?;
        for op in ops {
            let entry = match &op.value {
                Some(value) => serialize_entry(&op.key, value, Operation::Put)?,
                None => serialize_entry(&op.key, &[], Operation::Delete)?,
            };
            buffer.extend_from_slice(&entry);
        }
        buffer.extend_from_slice(&serialize_marker(Operation::BatchCommit, batch_id)?);

        self.append(&buffer, true)?;
        Ok(batch_id)
    }

    /// Write `bytes` and optionally sync them. Either everything lands or the
    /// file is cut back to where it was, so a failed append never replays.
    fn append(&mut self, bytes: &[u8], sync: bool) -> EngineResult<()> {
        if self.abandoned || (self.size > 0 && self.size + bytes.len() as u64 > self.rotation_size) {
            self.rotate()?;
        }

        let start = self.size;
        let mut result = self
            .file
            .write_all(bytes)
            .map_err(|e| EngineError::io(&self.path, e, "WAL write failed"));
        if result.is_ok() && sync {
            result = self.sync_appended();
        }

        match result {
            Ok(()) => {
                self.size += bytes.len() as u64;
                Ok(())
            }
            Err(err) => {
                self.cut_back(start);
                Err(err)
            }
        }
    }

    fn sync_appended(&mut self) -> EngineResult<()> {
        #[cfg(test)]
        {
            if std::mem::take(&mut self.fail_next_sync) {
                let injected = std::io::Error::new(std::io::ErrorKind::Other, "injected sync failure");
                return Err(EngineError::io(&self.path, injected, "WAL sync failed"));
            }
        }
        self.sync()
    }

    fn cut_back(&mut self, len: u64) {
        let cut = self.file.set_len(len).and_then(|()| durable_sync(&self.file));
        match cut {
            Ok(()) => debug!(path = %self.path.display(), len, "rolled back failed WAL append"),
            Err(e) => {
                error!(path = %self.path.display(), error = %e, "cannot roll back failed WAL append, abandoning file");
                self.abandoned = true;
            }
        }
    }

    /// Rotate to a new WAL file. Syncs current file before switching.
    fn rotate(&mut self) -> EngineResult<()> {
        if self.abandoned {
            warn!(path = %self.path.display(), "leaving abandoned WAL file");
        } else {
            durable_sync(&self.file)
                .map_err(|e| EngineError::io(&self.path, e, "WAL sync before rotation failed"))?;
        }

        self.sequence += 1;
        let new_path = self.wal_dir.join(file_name(WAL_PREFIX, self.sequence));
        self.file = open_append(&new_path)?;
        self.path = new_path;
        self.size = 0;
        self.abandoned = false;

        debug!(path = %self.path.display(), "rotated WAL");
        Ok(())
    }

    /// Close the current file and continue in a new one. Returns the new
    /// sequence; every file below it is complete and synced.
    pub fn start_new_file(&mut self) -> EngineResult<u64> {
        self.rotate()?;
        Ok(self.sequence)
    }

    pub fn current_path(&self) -> &Path {
        &self.path
    }

    pub fn current_size(&self) -> u64 {
        self.size
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Sync the current WAL file without writing any entry.
    /// Call this after a run of `append_fast` writes to make them all durable at once.
    pub fn sync(&self) -> EngineResult<()> {
        durable_sync(&self.file).map_err(|e| EngineError::io(&self.path, e, "WAL sync failed"))
    }
}

fn open_append(path: &Path) -> EngineResult<File> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| EngineError::io(path, e, "Failed to open WAL file"))
}

/// Outcome of replaying the WAL.
#[derive(Debug, Default)]
pub struct WalRecovery {
    /// Committed `Put` / `Delete` entries in log order
    pub entries: Vec<WalEntry>,
    /// One description per region that failed validation
    pub damage: Vec<String>,
    /// Files that ended in an incomplete entry
    pub torn_tails: usize,
    /// Batches whose commit marker never reached disk
    pub discarded_batches: usize,
}

/// Reads WAL files back at open and during salvage.
pub struct WalReader {
    wal_dir: PathBuf,
}

impl WalReader {
    pub fn new<P: AsRef<Path>>(wal_dir: P) -> Self {
        Self { wal_dir: wal_dir.as_ref().to_path_buf() }
    }

    /// Replay every WAL file with sequence >= `floor`.
    ///
    /// A frame that fails its magic or checksum is recorded as damage and the
    /// scan resumes at the next magic. An incomplete frame ends the file: that
    /// is where the writer crashed.
    ///
    /// A batch is always written into a single file, so batch markers are
    /// resolved file by file.
    pub fn recover(&self, floor: u64) -> EngineResult<WalRecovery> {
        let mut recovery = WalRecovery::default();

        for (seq, path) in list_sequenced(&self.wal_dir, WAL_PREFIX)? {
            if seq < floor {
                continue;
            }
            let mut raw = Vec::new();
            self.read_file(&path, &mut raw, &mut recovery)?;
            resolve_batches(raw, &mut recovery);
        }

        Ok(recovery)
    }

    fn read_file(&self, path: &Path, out: &mut Vec<WalEntry>, recovery: &mut WalRecovery) -> EngineResult<()> {
        let mut buffer = Vec::new();
        File::open(path)
            .and_then(|mut file| file.read_to_end(&mut buffer))
            .map_err(|e| EngineError::io(path, e, "Failed to read WAL file for recovery"))?;

        let mut pos = 0;
        while pos < buffer.len() {
            match next_frame(&buffer[pos..]) {
                Frame::Entry(entry, len) => {
                    out.push(entry);
                    pos += len;
                }
                Frame::Torn { needed } => {
                    warn!(path = %path.display(), offset = pos, needed, available = buffer.len() - pos, "torn write at end of WAL file");
                    recovery.torn_tails += 1;
                    break;
                }
                Frame::Damaged(reason) => {
                    warn!(path = %path.display(), offset = pos, %reason, "damaged WAL entry, resyncing");
                    recovery.damage.push(format!("{}: offset {pos}: {reason}", path.display()));
                    match resync(&buffer, pos + 1) {
                        Some(next) => pos = next,
                        None => break,
                    }
                }
            }
        }
        Ok(())
    }
}

/// Outcome of decoding the frame at the start of a buffer.
enum Frame {
    Entry(WalEntry, usize),
    Torn { needed: usize },
    Damaged(String),
}

fn next_frame(rest: &[u8]) -> Frame {
    let Some(header) = rest.get(..HEADER_SIZE) else {
        return Frame::Torn { needed: HEADER_SIZE };
    };
    if header[..4] != MAGIC_ARRAY {
        return Frame::Damaged("bad magic".to_string());
    }
    let mut len_bytes = [0u8; 4];
    len_bytes.copy_from_slice(&header[4..8]);
    let total = HEADER_SIZE + u32::from_le_bytes(len_bytes) as usize;
    let Some(frame) = rest.get(..total) else {
        return Frame::Torn { needed: total };
    };
    match deserialize_entry(frame) {
        Ok(entry) => Frame::Entry(entry, total),
        Err(e) => Frame::Damaged(e.to_string()),
    }
}

/// Keep plain entries and committed batches; drop unfinished batches.
fn resolve_batches(raw: Vec<WalEntry>, recovery: &mut WalRecovery) {
    let mut pending: Option<(u64, Vec<WalEntry>)> = None;

    for entry in raw {
        match entry.operation {
            Operation::BatchBegin => {
                if pending.is_some() {
                    recovery.discarded_batches += 1;
                }
                pending = Some((entry.batch_id().unwrap_or(0), Vec::new()));
            }
            Operation::BatchCommit => match pending.take() {
                Some((id, ops)) if Some(id) == entry.batch_id() => recovery.entries.extend(ops),
                Some(_) => recovery.discarded_batches += 1,
                None => debug!("commit marker without a matching begin"),
            },
            Operation::Put | Operation::Delete => match pending.as_mut() {
                Some((_, ops)) => ops.push(entry),
                None => recovery.entries.push(entry),
            },
        }
    }

    if pending.is_some() {
        recovery.discarded_batches += 1;
        warn!("discarding uncommitted batch at end of WAL");
    }
}

/// Offset of the next magic at or after `from`.
fn resync(buffer: &[u8], from: usize) -> Option<usize> {
    buffer
        .get(from..)?
        .windows(MAGIC_ARRAY.len())
        .position(|w| w == MAGIC_ARRAY)
        .map(|i| from + i)
}
