//! Snapshot files
//!
//! One self-contained file holding a full committed state. Base files written
//! by checkpoint use this format, as do backups.
//!
//! Layout:
//!   [0..4]   magic:     "DSNP"
//!   [4..8]   version:   u32 LE
//!   [8..16]  wal_floor: u64 LE - first WAL sequence not folded into this state
//!   records             data file records, never tombstones
//!   footer   count: u64 LE, checksum: u32 LE (CRC32C of the record region), 4 zero bytes
//!
//! Reads are strict: any damage fails the whole file.

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::datafile::{encode_record, scan_records};
use crate::error::{EngineError, EngineResult};
use crate::platform_durability::{durable_sync, sync_dir};

pub const SNAPSHOT_MAGIC: [u8; 4] = *b"DSNP";
pub const SNAPSHOT_VERSION: u32 = 1;
pub const SNAPSHOT_HEADER_SIZE: usize = 16;
pub const SNAPSHOT_FOOTER_SIZE: usize = 16;

/// A fully validated snapshot.
#[derive(Debug, Default)]
pub struct Snapshot {
    pub wal_floor: u64,
    pub entries: Vec<(Vec<u8>, Vec<u8>)>,
}

/// Write `entries` to `path` atomically: temp file, sync, rename, directory sync.
///
/// Returns the number of records written.
pub fn write_snapshot<'a, I>(path: &Path, wal_floor: u64, entries: I) -> EngineResult<u64>
where
    I: IntoIterator<Item = (&'a [u8], &'a [u8])>,
{
    let tmp_path = tmp_path_for(path);
    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(&tmp_path)
        .map_err(|e| EngineError::io(&tmp_path, e, "Failed to create snapshot file"))?;

    let result = write_body(&tmp_path, file, wal_floor, entries);
    let count = match result {
        Ok(count) => count,
        Err(e) => {
            let _ = fs::remove_file(&tmp_path);
            return Err(e);
        }
    };

    if let Err(e) = fs::rename(&tmp_path, path) {
        let _ = fs::remove_file(&tmp_path);
        return Err(EngineError::io(path, e, "Failed to rename snapshot into place"));
    }
    if let Some(parent) = path.parent() {
        sync_dir(parent)?;
    }

    debug!(path = %path.display(), records = count, wal_floor, "snapshot written");
    Ok(count)
}

fn write_body<'a, I>(path: &Path, file: File, wal_floor: u64, entries: I) -> EngineResult<u64>
where
    I: IntoIterator<Item = (&'a [u8], &'a [u8])>,
{
    let mut out = BufWriter::new(file);
    let write_err = |e| EngineError::io(path, e, "Snapshot write failed");

    let mut header = [0u8; SNAPSHOT_HEADER_SIZE];
    header[0..4].copy_from_slice(&SNAPSHOT_MAGIC);
    header[4..8].copy_from_slice(&SNAPSHOT_VERSION.to_le_bytes());
    header[8..16].copy_from_slice(&wal_floor.to_le_bytes());
    out.write_all(&header).map_err(write_err)?;

    let mut count = 0u64;
    let mut checksum = 0u32;
    for (key, value) in entries {
        let record = encode_record(key, value, false)?;
        checksum = crc32c::crc32c_append(checksum, &record);
        out.write_all(&record).map_err(write_err)?;
        count += 1;
    }

    let mut footer = [0u8; SNAPSHOT_FOOTER_SIZE];
    footer[0..8].copy_from_slice(&count.to_le_bytes());
    footer[8..12].copy_from_slice(&checksum.to_le_bytes());
    out.write_all(&footer).map_err(write_err)?;

    let file = out
        .into_inner()
        .map_err(|e| EngineError::io(path, e.into_error(), "Snapshot flush failed"))?;
    durable_sync(&file).map_err(|e| EngineError::io(path, e, "Snapshot durable_sync failed"))?;
    Ok(count)
}

/// Read and validate a snapshot.
pub fn read_snapshot(path: &Path) -> EngineResult<Snapshot> {
    let mut file = File::open(path).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            EngineError::NotFound { path: path.to_path_buf() }
        } else {
            EngineError::io(path, e, "Failed to open snapshot")
        }
    })?;
    let mut buf = Vec::new();
    file.read_to_end(&mut buf)
        .map_err(|e| EngineError::io(path, e, "Failed to read snapshot"))?;

    if buf.len() < SNAPSHOT_HEADER_SIZE + SNAPSHOT_FOOTER_SIZE {
        return Err(EngineError::TornWrite {
            path: path.to_path_buf(),
            expected_size: (SNAPSHOT_HEADER_SIZE + SNAPSHOT_FOOTER_SIZE) as u32,
            available_bytes: buf.len() as u64,
            offset: 0,
        });
    }

    if buf[0..4] != SNAPSHOT_MAGIC {
        let mut found_bytes = [0u8; 4];
        found_bytes.copy_from_slice(&buf[0..4]);
        return Err(EngineError::NoMagicFound { path: path.to_path_buf(), offset: 0, found_bytes });
    }
    let version = u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]);
    if version != SNAPSHOT_VERSION {
        return Err(EngineError::UnsupportedVersion {
            path: path.to_path_buf(),
            found: version,
            expected: SNAPSHOT_VERSION,
        });
    }
    let mut floor_bytes = [0u8; 8];
    floor_bytes.copy_from_slice(&buf[8..16]);
    let wal_floor = u64::from_le_bytes(floor_bytes);

    let footer_start = buf.len() - SNAPSHOT_FOOTER_SIZE;
    let body = &buf[SNAPSHOT_HEADER_SIZE..footer_start];
    let footer = &buf[footer_start..];

    let mut count_bytes = [0u8; 8];
    count_bytes.copy_from_slice(&footer[0..8]);
    let expected_count = u64::from_le_bytes(count_bytes);
    let expected_crc = u32::from_le_bytes([footer[8], footer[9], footer[10], footer[11]]);

    let actual_crc = crc32c::crc32c(body);
    if actual_crc != expected_crc {
        return Err(EngineError::ChecksumMismatch {
            path: path.to_path_buf(),
            expected: expected_crc,
            actual: actual_crc,
            offset: SNAPSHOT_HEADER_SIZE as u64,
        });
    }

    let report = scan_records(body, SNAPSHOT_HEADER_SIZE as u64, path);
    if let Some(first) = report.damage.first() {
        return Err(EngineError::Corrupted {
            path: path.to_path_buf(),
            regions: report.damage.len(),
            first: first.clone(),
        });
    }
    if report.torn || report.entries.len() as u64 != expected_count {
        return Err(EngineError::WalCorrupted {
            path: path.to_path_buf(),
            offset: SNAPSHOT_HEADER_SIZE as u64,
            reason: format!(
                "footer declares {} records, found {}",
                expected_count,
                report.entries.len()
            ),
        });
    }

    let entries = report
        .entries
        .into_iter()
        .filter(|e| !e.is_tombstone)
        .map(|e| (e.key, e.value))
        .collect();
    Ok(Snapshot { wal_floor, entries })
}

fn tmp_path_for(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}
