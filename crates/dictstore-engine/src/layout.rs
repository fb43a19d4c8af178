//! On-disk layout of a store directory.
//!
//! ```text
//! <store>/
//!   LOCK
//!   wal/wal-<seq:016x>.claw
//!   data/base-<seq:016x>.claw     checkpoint, snapshot format
//!   data/data-<seq:016x>.claw     trickle output
//! ```
//!
//! Base and data files share one sequence counter so their relative age is
//! always known.

use std::path::{Path, PathBuf};

use crate::error::{EngineError, EngineResult};

pub const WAL_PREFIX: &str = "wal-";
pub const DATA_PREFIX: &str = "data-";
pub const BASE_PREFIX: &str = "base-";
pub const FILE_SUFFIX: &str = ".claw";
pub const LOCK_FILE: &str = "LOCK";

/// Paths making up one store.
#[derive(Debug, Clone)]
pub struct StoreLayout {
    root: PathBuf,
}

impl StoreLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn wal_dir(&self) -> PathBuf {
        self.root.join("wal")
    }

    pub fn data_dir(&self) -> PathBuf {
        self.root.join("data")
    }

    pub fn lock_path(&self) -> PathBuf {
        self.root.join(LOCK_FILE)
    }

    pub fn exists(&self) -> bool {
        self.root.is_dir()
    }

    /// Create the root, `wal/` and `data/` directories.
    pub fn create_dirs(&self) -> EngineResult<()> {
        for dir in [self.wal_dir(), self.data_dir()] {
            std::fs::create_dir_all(&dir)
                .map_err(|e| EngineError::io(&dir, e, "Failed to create store directory"))?;
        }
        Ok(())
    }

    pub fn base_path(&self, seq: u64) -> PathBuf {
        self.data_dir().join(file_name(BASE_PREFIX, seq))
    }

    pub fn data_path(&self, seq: u64) -> PathBuf {
        self.data_dir().join(file_name(DATA_PREFIX, seq))
    }

    pub fn wal_path(&self, seq: u64) -> PathBuf {
        self.wal_dir().join(file_name(WAL_PREFIX, seq))
    }

    pub fn wal_files(&self) -> EngineResult<Vec<(u64, PathBuf)>> {
        list_sequenced(&self.wal_dir(), WAL_PREFIX)
    }

    pub fn data_files(&self) -> EngineResult<Vec<(u64, PathBuf)>> {
        list_sequenced(&self.data_dir(), DATA_PREFIX)
    }

    pub fn base_files(&self) -> EngineResult<Vec<(u64, PathBuf)>> {
        list_sequenced(&self.data_dir(), BASE_PREFIX)
    }

    /// Highest sequence used by any base or data file (0 if none).
    pub fn max_data_sequence(&self) -> EngineResult<u64> {
        let data = self.data_files()?;
        let base = self.base_files()?;
        Ok(data.iter().chain(base.iter()).map(|(seq, _)| *seq).max().unwrap_or(0))
    }
}

pub fn file_name(prefix: &str, seq: u64) -> String {
    format!("{}{:016x}{}", prefix, seq, FILE_SUFFIX)
}

/// Parse `<prefix><hex><suffix>` into its sequence number.
pub fn parse_sequence(name: &str, prefix: &str) -> Option<u64> {
    let hex = name.strip_prefix(prefix)?.strip_suffix(FILE_SUFFIX)?;
    u64::from_str_radix(hex, 16).ok()
}

/// List `<prefix>*.claw` files in `dir`, sorted by sequence. A missing
/// directory lists as empty.
pub fn list_sequenced(dir: &Path, prefix: &str) -> EngineResult<Vec<(u64, PathBuf)>> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(EngineError::io(dir, e, "Failed to read directory")),
    };

    let mut files = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| EngineError::io(dir, e, "Failed to read directory entry"))?;
        if let Some(seq) = entry.file_name().to_str().and_then(|n| parse_sequence(n, prefix)) {
            files.push((seq, entry.path()));
        }
    }
    files.sort_by_key(|(seq, _)| *seq);
    Ok(files)
}
