//! Checksummed record files.
//!
//! The trickle thread appends dirty keys to `data-<seq>.claw` files. Every
//! record is a 24-byte header, the key, then the value. Base and snapshot
//! files reuse the same record encoding for their body.

use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::error::{EngineError, EngineResult};
use crate::format::{check_entry_size, MAGIC_ARRAY, MAX_KEY_SIZE, MAX_VALUE_SIZE};
use crate::layout::{file_name, list_sequenced, BASE_PREFIX, DATA_PREFIX};
use crate::platform_durability::durable_sync;

/// Size of the fixed header in front of every record.
pub const DATA_HEADER_SIZE: usize = 24;

const TOMBSTONE: u8 = 0x01;

/// Data files roll over once they would pass this size.
const ROTATE_AT: u64 = 256 * 1024 * 1024;

/// Fixed header of an on-disk record.
///
/// ```text
/// 0..4    magic "CLAW"
/// 4..6    key length, u16 LE
/// 6..10   value length, u32 LE
/// 10..14  CRC32C over key then value, u32 LE
/// 14      flags (bit 0: tombstone)
/// 15..24  zero
/// ```
#[derive(Debug, Clone, Copy)]
struct RecordHeader {
    key_len: usize,
    value_len: usize,
    checksum: u32,
    tombstone: bool,
}

impl RecordHeader {
    fn write_to(&self, out: &mut Vec<u8>) {
        let start = out.len();
        out.extend_from_slice(&MAGIC_ARRAY);
        out.extend_from_slice(&(self.key_len as u16).to_le_bytes());
        out.extend_from_slice(&(self.value_len as u32).to_le_bytes());
        out.extend_from_slice(&self.checksum.to_le_bytes());
        out.push(if self.tombstone { TOMBSTONE } else { 0 });
        out.resize(start + DATA_HEADER_SIZE, 0);
    }

    /// `None` when the magic is wrong or the lengths are out of range.
    fn parse(raw: &[u8]) -> Option<Self> {
        if raw.get(..4)? != MAGIC_ARRAY {
            return None;
        }
        let key_len = u16::from_le_bytes(raw.get(4..6)?.try_into().ok()?) as usize;
        let value_len = u32::from_le_bytes(raw.get(6..10)?.try_into().ok()?) as usize;
        if key_len > MAX_KEY_SIZE || value_len > MAX_VALUE_SIZE {
            return None;
        }
        Some(Self {
            key_len,
            value_len,
            checksum: u32::from_le_bytes(raw.get(10..14)?.try_into().ok()?),
            tombstone: raw.get(14)? & TOMBSTONE != 0,
        })
    }
}

/// A record read from a data, base or snapshot file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataEntry {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    pub offset: u64,
    pub is_tombstone: bool,
}

fn record_checksum(key: &[u8], value: &[u8]) -> u32 {
    crc32c::crc32c_append(crc32c::crc32c(key), value)
}

/// Encode one record. Tombstones carry no value bytes.
pub fn encode_record(key: &[u8], value: &[u8], tombstone: bool) -> EngineResult<Vec<u8>> {
    check_entry_size(key, value, MAX_KEY_SIZE, MAX_VALUE_SIZE)?;
    let value: &[u8] = if tombstone { &[] } else { value };

    let mut out = Vec::with_capacity(DATA_HEADER_SIZE + key.len() + value.len());
    RecordHeader {
        key_len: key.len(),
        value_len: value.len(),
        checksum: record_checksum(key, value),
        tombstone,
    }
    .write_to(&mut out);
    out.extend_from_slice(key);
    out.extend_from_slice(value);
    Ok(out)
}

/// Result of scanning a run of records.
#[derive(Debug, Default)]
pub struct ScanReport {
    pub entries: Vec<DataEntry>,
    /// One description per region that failed validation
    pub damage: Vec<String>,
    /// The run ended in an incomplete record
    pub torn: bool,
}

/// Scan every record in `buf`. `base_offset` is the file offset of `buf[0]`
/// and only affects reported offsets.
///
/// Damaged records are skipped by resynchronising on the next magic.
pub fn scan_records(buf: &[u8], base_offset: u64, path: &Path) -> ScanReport {
    let mut report = ScanReport::default();
    let mut pos = 0usize;

    while pos < buf.len() {
        let at = base_offset + pos as u64;
        let Some(raw) = buf.get(pos..pos + DATA_HEADER_SIZE) else {
            report.torn = true;
            break;
        };

        let problem = match RecordHeader::parse(raw) {
            None => format!("{}: bad record header at offset {at}", path.display()),
            Some(header) => {
                let body = pos + DATA_HEADER_SIZE;
                let split = body + header.key_len;
                let Some(value) = buf.get(split..split + header.value_len) else {
                    report.torn = true;
                    break;
                };
                let key = &buf[body..split];
                let actual = record_checksum(key, value);
                if actual == header.checksum {
                    report.entries.push(DataEntry {
                        key: key.to_vec(),
                        value: value.to_vec(),
                        offset: at,
                        is_tombstone: header.tombstone,
                    });
                    pos = split + header.value_len;
                    continue;
                }
                format!(
                    "{}: checksum mismatch at offset {at} (stored 0x{:08x}, computed 0x{actual:08x})",
                    path.display(),
                    header.checksum
                )
            }
        };

        report.damage.push(problem);
        match next_magic(buf, pos + 1) {
            Some(next) => pos = next,
            None => break,
        }
    }

    report
}

fn next_magic(buf: &[u8], from: usize) -> Option<usize> {
    buf.get(from..)?
        .windows(MAGIC_ARRAY.len())
        .position(|w| w == MAGIC_ARRAY)
        .map(|i| from + i)
}

/// Writes records to data files with CRC32C checksums.
pub struct DataFileWriter {
    file: File,
    path: PathBuf,
    size: u64,
    data_dir: PathBuf,
    sequence: u64,
}

impl DataFileWriter {
    /// Create a new data file one past the highest base or data sequence.
    pub fn new(data_dir: &Path) -> EngineResult<Self> {
        std::fs::create_dir_all(data_dir)
            .map_err(|e| EngineError::io(data_dir, e, "Failed to create data directory"))?;

        let max_seq = list_sequenced(data_dir, DATA_PREFIX)?
            .into_iter()
            .chain(list_sequenced(data_dir, BASE_PREFIX)?)
            .map(|(seq, _)| seq)
            .max()
            .unwrap_or(0);

        let sequence = max_seq + 1;
        let path = data_dir.join(file_name(DATA_PREFIX, sequence));
        let file = open_append(&path)?;

        Ok(Self { file, path, size: 0, data_dir: data_dir.to_path_buf(), sequence })
    }

    /// Write a key-value record. Returns the byte offset where it was written.
    pub fn write_entry(&mut self, key: &[u8], value: &[u8]) -> EngineResult<u64> {
        self.write_internal(key, value, false)
    }

    /// Write a tombstone (deletion marker). Returns byte offset.
    pub fn write_tombstone(&mut self, key: &[u8]) -> EngineResult<u64> {
        self.write_internal(key, &[], true)
    }

    fn write_internal(&mut self, key: &[u8], value: &[u8], tombstone: bool) -> EngineResult<u64> {
        let record = encode_record(key, value, tombstone)?;

        if self.size > 0 && self.size + record.len() as u64 > ROTATE_AT {
            self.rotate()?;
        }

        let offset = self.size;
        self.file
            .write_all(&record)
            .map_err(|e| EngineError::io(&self.path, e, "Data file write failed"))?;
        self.size += record.len() as u64;
        Ok(offset)
    }

    /// Make everything written so far durable.
    pub fn sync(&self) -> EngineResult<()> {
        durable_sync(&self.file)
            .map_err(|e| EngineError::io(&self.path, e, "Data file durable_sync failed"))
    }

    pub fn current_size(&self) -> u64 {
        self.size
    }

    pub fn current_path(&self) -> &Path {
        &self.path
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Rotate to a new data file.
    pub fn rotate(&mut self) -> EngineResult<()> {
        self.sync()?;

        self.sequence += 1;
        let new_path = self.data_dir.join(file_name(DATA_PREFIX, self.sequence));
        self.file = open_append(&new_path)?;
        self.path = new_path;
        self.size = 0;
        Ok(())
    }
}

fn open_append(path: &Path) -> EngineResult<File> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| EngineError::io(path, e, "Failed to open data file"))
}

/// Reads data files with CRC32C verification.
pub struct DataFileReader;

impl DataFileReader {
    /// Scan all records from a data file.
    pub fn scan(file_path: &Path) -> EngineResult<ScanReport> {
        let mut file = File::open(file_path)
            .map_err(|e| EngineError::io(file_path, e, "Failed to open data file for scan"))?;
        let mut buf = Vec::new();
        file.read_to_end(&mut buf)
            .map_err(|e| EngineError::io(file_path, e, "Failed to read data file"))?;

        let report = scan_records(&buf, 0, file_path);
        if !report.damage.is_empty() {
            warn!(path = %file_path.display(), regions = report.damage.len(), "damaged records in data file");
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Seek, SeekFrom};
    use tempfile::TempDir;

    fn find_data_file(dir: &Path) -> PathBuf {
        list_sequenced(dir, DATA_PREFIX).unwrap()
            .into_iter()
            .map(|(_, p)| p)
            .next()
            .expect("No data file found")
    }

    #[test]
    fn test_write_then_scan() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("data");
        let mut writer = DataFileWriter::new(&dir).unwrap();

        writer.write_entry(b"k1", b"v1").unwrap();
        writer.write_entry(b"k2", b"v2").unwrap();
        writer.write_tombstone(b"k3").unwrap();
        let offset = writer.write_entry(b"k4", b"v4").unwrap();
        writer.sync().unwrap();

        let report = DataFileReader::scan(&find_data_file(&dir)).unwrap();
        let entries = report.entries;

        assert_eq!(entries.len(), 4);
        assert_eq!(entries[0].key, b"k1");
        assert!(!entries[0].is_tombstone);
        assert_eq!(entries[2].key, b"k3");
        assert!(entries[2].is_tombstone);
        assert!(entries[2].value.is_empty());
        assert_eq!(entries[3].offset, offset);
        assert!(report.damage.is_empty());
        assert!(!report.torn);
    }

    #[test]
    fn test_checksum_damage_is_reported() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("data");
        let mut writer = DataFileWriter::new(&dir).unwrap();

        let offset = writer.write_entry(b"key", b"value").unwrap();
        writer.write_entry(b"next", b"value").unwrap();
        writer.sync().unwrap();
        let file = find_data_file(&dir);

        {
            let mut f = OpenOptions::new().write(true).open(&file).unwrap();
            f.seek(SeekFrom::Start(offset + DATA_HEADER_SIZE as u64 + 3)).unwrap();
            f.write_all(&[0xFF]).unwrap();
        }

        let report = DataFileReader::scan(&file).unwrap();
        assert_eq!(report.damage.len(), 1);
        assert_eq!(report.entries.len(), 1);
        assert_eq!(report.entries[0].key, b"next");
    }

    #[test]
    fn test_truncated_record_is_torn() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("data");
        let mut writer = DataFileWriter::new(&dir).unwrap();
        writer.write_entry(b"whole", b"record").unwrap();
        writer.write_entry(b"partial", b"record").unwrap();
        writer.sync().unwrap();

        let file = find_data_file(&dir);
        let data = std::fs::read(&file).unwrap();
        std::fs::write(&file, &data[..data.len() - 3]).unwrap();

        let report = DataFileReader::scan(&file).unwrap();
        assert_eq!(report.entries.len(), 1);
        assert!(report.torn);
        assert!(report.damage.is_empty());
    }

    #[test]
    fn test_sequence_continues_past_base_files() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("data");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join(file_name(BASE_PREFIX, 7)), b"").unwrap();

        let writer = DataFileWriter::new(&dir).unwrap();
        assert_eq!(writer.sequence(), 8);
    }

    #[test]
    fn test_oversized_rejected() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("data");
        let mut writer = DataFileWriter::new(&dir).unwrap();

        let big_key = vec![0xAA; MAX_KEY_SIZE + 1];
        assert!(matches!(
            writer.write_entry(&big_key, b"v"),
            Err(EngineError::OversizedEntry { .. })
        ));
        assert_eq!(writer.current_size(), 0);
    }
}
