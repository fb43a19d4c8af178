//! Data file compaction.
//!
//! Each trickle cycle appends a fresh copy of every dirty key, so a data file
//! fills up with superseded values. Compacting a file rewrites it with only
//! the last record per key.
//!
//! A tombstone may still be shadowing a record in an older file, so tombstones
//! are only dropped from the oldest data file when no base file exists.
//!
//! The rewrite goes to `<file>.compact`, is synced, renamed over the original
//! and the directory is synced. A crash leaves either the old file or the new
//! one in place; a stray `.compact` file is removed on open.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use hashbrown::HashMap;
use tracing::info;

use crate::datafile::{encode_record, DataEntry, DataFileReader};
use crate::error::{EngineError, EngineResult};
use crate::layout::StoreLayout;
use crate::platform_durability::{durable_sync, sync_dir};

/// What compacting one file achieved.
#[derive(Debug)]
pub struct CompactionResult {
    /// Path to the compacted file
    pub file_path: PathBuf,
    /// Records before compaction
    pub original_entries: usize,
    /// Number of entries kept after compaction
    pub live_entries: usize,
    /// Number of entries removed (stale overwrites, plus tombstones when allowed)
    pub removed_entries: usize,
    /// Original file size in bytes
    pub original_bytes: u64,
    /// Compacted file size in bytes
    pub compacted_bytes: u64,
}

impl CompactionResult {
    /// Fraction of the original records that were dropped.
    pub fn dead_space_ratio(&self) -> f64 {
        if self.original_entries == 0 {
            return 0.0;
        }
        self.removed_entries as f64 / self.original_entries as f64
    }

    /// Space saved in bytes.
    pub fn bytes_saved(&self) -> u64 {
        self.original_bytes.saturating_sub(self.compacted_bytes)
    }
}

/// Last record per key, in original write order.
fn surviving(entries: Vec<DataEntry>, drop_tombstones: bool) -> Vec<DataEntry> {
    let mut latest: HashMap<Vec<u8>, DataEntry> = HashMap::with_capacity(entries.len());
    latest.extend(entries.into_iter().map(|e| (e.key.clone(), e)));
    let mut kept: Vec<DataEntry> = latest
        .into_values()
        .filter(|e| !(drop_tombstones && e.is_tombstone))
        .collect();
    kept.sort_by_key(|e| e.offset);
    kept
}

/// Rewrite one data file in place, keeping only live records.
pub fn compact_file(file_path: &Path, drop_tombstones: bool) -> EngineResult<CompactionResult> {
    let original_bytes = fs::metadata(file_path)
        .map_err(|e| EngineError::io(file_path, e, "Failed to stat file for compaction"))?
        .len();

    let report = DataFileReader::scan(file_path)?;
    let original_entries = report.entries.len();
    let live = surviving(report.entries, drop_tombstones);
    let live_entries = live.len();

    let compact_path = file_path.with_extension("claw.compact");
    {
        let mut out = fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&compact_path)
            .map_err(|e| EngineError::io(&compact_path, e, "Failed to create compact file"))?;

        for entry in &live {
            let record = encode_record(&entry.key, &entry.value, entry.is_tombstone)?;
            out.write_all(&record)
                .map_err(|e| EngineError::io(&compact_path, e, "Failed to write compacted entry"))?;
        }

        durable_sync(&out)
            .map_err(|e| EngineError::io(&compact_path, e, "Failed to sync compacted file"))?;
    }

    let compacted_bytes = fs::metadata(&compact_path)
        .map_err(|e| EngineError::io(&compact_path, e, "Failed to stat compacted file"))?
        .len();

    fs::rename(&compact_path, file_path)
        .map_err(|e| EngineError::io(file_path, e, "Failed to rename compacted file"))?;
    if let Some(parent) = file_path.parent() {
        sync_dir(parent)?;
    }

    Ok(CompactionResult {
        file_path: file_path.to_path_buf(),
        original_entries,
        live_entries,
        removed_entries: original_entries - live_entries,
        original_bytes,
        compacted_bytes,
    })
}

/// Check if a data file's dead space ratio reaches `threshold`.
pub fn needs_compaction(file_path: &Path, threshold: f64, drop_tombstones: bool) -> EngineResult<bool> {
    let entries = DataFileReader::scan(file_path)?.entries;
    if entries.is_empty() {
        return Ok(false);
    }
    let total = entries.len();
    let live = surviving(entries, drop_tombstones).len();
    let dead_ratio = 1.0 - (live as f64 / total as f64);
    Ok(dead_ratio >= threshold)
}

/// Compact every data file of a store whose dead space reaches `threshold`.
///
/// Files with a sequence at or above `active_sequence` are being appended to
/// and are skipped.
pub fn compact_store(
    layout: &StoreLayout,
    threshold: f64,
    active_sequence: Option<u64>,
) -> EngineResult<Vec<CompactionResult>> {
    let has_base = !layout.base_files()?.is_empty();
    let data_files = layout.data_files()?;
    let oldest = data_files.first().map(|(seq, _)| *seq);

    let mut results = Vec::new();
    for (seq, file_path) in data_files {
        if active_sequence.is_some_and(|active| seq >= active) {
            continue;
        }
        let drop_tombstones = !has_base && Some(seq) == oldest;
        if needs_compaction(&file_path, threshold, drop_tombstones)? {
            let result = compact_file(&file_path, drop_tombstones)?;
            info!(
                path = %file_path.display(),
                before = result.original_entries,
                after = result.live_entries,
                bytes_saved = result.bytes_saved(),
                "compacted data file"
            );
            results.push(result);
        }
    }

    Ok(results)
}
