//! Binary format definitions for WAL entries
//!
//! All WAL entries follow a consistent format:
//! ChunkHeader (32 bytes) + key_len(u16) + value_len(u32) + operation(u8) + padding(u8) + key_bytes + value_bytes
//!
//! Batch markers (`BatchBegin` / `BatchCommit`) use the same layout with an
//! empty key and an 8-byte little-endian batch id as the value.

use std::path::PathBuf;

use crate::error::{EngineError, EngineResult};

/// Magic bytes as a byte array for comparison: 'C','L','A','W'
pub const MAGIC_ARRAY: [u8; 4] = [0x43, 0x4C, 0x41, 0x57];

/// Hard ceiling on key size in bytes; `Config::max_key_size` may be lower
pub const MAX_KEY_SIZE: usize = 4096;

/// Hard ceiling on value size in bytes (32MB)
pub const MAX_VALUE_SIZE: usize = 32 * 1024 * 1024;

/// Header size in bytes
pub const HEADER_SIZE: usize = 32;

/// WAL operation types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Operation {
    /// Insert or update a key-value pair
    Put = 1,
    /// Delete a key
    Delete = 2,
    /// Start of an atomic batch
    BatchBegin = 3,
    /// End of an atomic batch; entries since `BatchBegin` become visible
    BatchCommit = 4,
}

impl Operation {
    fn from_u8(byte: u8) -> Option<Self> {
        match byte {
            1 => Some(Operation::Put),
            2 => Some(Operation::Delete),
            3 => Some(Operation::BatchBegin),
            4 => Some(Operation::BatchCommit),
            _ => None,
        }
    }

    /// True for `BatchBegin` / `BatchCommit`.
    pub fn is_marker(self) -> bool {
        matches!(self, Operation::BatchBegin | Operation::BatchCommit)
    }
}

/// The 32-byte frame in front of every WAL payload.
///
/// ```text
/// 0..4    magic "CLAW"
/// 4..8    payload length, u32 LE
/// 8..12   CRC32C of the payload, u32 LE
/// 12      operation
/// 13..32  zero
/// ```
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct ChunkHeader {
    pub magic: [u8; 4],
    pub length: u32,
    pub checksum: u32,
    pub entry_type: u8,
    pub reserved: [u8; 3],
    pub _padding: [u8; 16],
}

/// One decoded WAL record.
#[derive(Debug, Clone)]
pub struct WalEntry {
    pub header: ChunkHeader,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    pub operation: Operation,
}

impl WalEntry {
    /// Batch id carried by a marker entry.
    pub fn batch_id(&self) -> Option<u64> {
        if !self.operation.is_marker() {
            return None;
        }
        let id: [u8; 8] = self.value.as_slice().try_into().ok()?;
        Some(u64::from_le_bytes(id))
    }
}

fn le_u32(bytes: &[u8]) -> u32 {
    u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

impl ChunkHeader {
    pub fn new(length: u32, checksum: u32, entry_type: Operation) -> Self {
        Self {
            magic: MAGIC_ARRAY,
            length,
            checksum,
            entry_type: entry_type as u8,
            reserved: [0; 3],
            _padding: [0; 16],
        }
    }

    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut out = [0u8; HEADER_SIZE];
        out[..4].copy_from_slice(&self.magic);
        out[4..8].copy_from_slice(&self.length.to_le_bytes());
        out[8..12].copy_from_slice(&self.checksum.to_le_bytes());
        out[12] = self.entry_type;
        out[13..16].copy_from_slice(&self.reserved);
        out
    }

    pub fn from_bytes(bytes: &[u8; HEADER_SIZE]) -> Self {
        let mut padding = [0u8; 16];
        padding.copy_from_slice(&bytes[16..]);
        Self {
            magic: [bytes[0], bytes[1], bytes[2], bytes[3]],
            length: le_u32(&bytes[4..8]),
            checksum: le_u32(&bytes[8..12]),
            entry_type: bytes[12],
            reserved: [bytes[13], bytes[14], bytes[15]],
            _padding: padding,
        }
    }
}

/// Reject keys and values above the hard format ceilings.
pub fn check_entry_size(key: &[u8], value: &[u8], max_key: usize, max_value: usize) -> EngineResult<()> {
    if key.len() > max_key {
        return Err(EngineError::OversizedEntry {
            entry_size: key.len() as u64,
            max_size: max_key as u64,
            component: "key".to_string(),
        });
    }
    if value.len() > max_value {
        return Err(EngineError::OversizedEntry {
            entry_size: value.len() as u64,
            max_size: max_value as u64,
            component: "value".to_string(),
        });
    }
    Ok(())
}

/// Frame `key` and `value` as one WAL entry.
pub fn serialize_entry(key: &[u8], value: &[u8], op: Operation) -> EngineResult<Vec<u8>> {
    check_entry_size(key, value, MAX_KEY_SIZE, MAX_VALUE_SIZE)?;

    let payload_len = PAYLOAD_PREFIX + key.len() + value.len();
    let mut out = vec![0u8; HEADER_SIZE];
    out.reserve(payload_len);
    out.extend_from_slice(&(key.len() as u16).to_le_bytes());
    out.extend_from_slice(&(value.len() as u32).to_le_bytes());
    out.extend_from_slice(&[op as u8, 0]);
    out.extend_from_slice(key);
    out.extend_from_slice(value);

    let checksum = crc32c::crc32c(&out[HEADER_SIZE..]);
    let header = ChunkHeader::new(payload_len as u32, checksum, op);
    out[..HEADER_SIZE].copy_from_slice(&header.to_bytes());
    Ok(out)
}

/// Serialize a batch marker carrying `batch_id`.
pub fn serialize_marker(op: Operation, batch_id: u64) -> EngineResult<Vec<u8>> {
    serialize_entry(&[], &batch_id.to_le_bytes(), op)
}

/// Payload fields in front of key and value: key_len u16, value_len u32, op, pad.
const PAYLOAD_PREFIX: usize = 8;

fn corrupted(offset: usize, reason: String) -> EngineError {
    EngineError::WalCorrupted { path: PathBuf::from("<buffer>"), offset: offset as u64, reason }
}

/// Decode one WAL entry from the front of `data`.
///
/// Offsets in the returned errors are relative to `data`; callers that know
/// the file and position rewrite them.
pub fn deserialize_entry(data: &[u8]) -> EngineResult<WalEntry> {
    let Some(frame) = data.get(..HEADER_SIZE) else {
        return Err(corrupted(0, format!("entry too short: {} of {} header bytes", data.len(), HEADER_SIZE)));
    };
    let mut header_bytes = [0u8; HEADER_SIZE];
    header_bytes.copy_from_slice(frame);
    let header = ChunkHeader::from_bytes(&header_bytes);

    if header.magic != MAGIC_ARRAY {
        return Err(EngineError::NoMagicFound {
            path: PathBuf::from("<buffer>"),
            offset: 0,
            found_bytes: header.magic,
        });
    }

    let body = &data[HEADER_SIZE..];
    let Some(payload) = body.get(..header.length as usize) else {
        return Err(EngineError::TornWrite {
            path: PathBuf::from("<buffer>"),
            expected_size: header.length,
            available_bytes: body.len() as u64,
            offset: HEADER_SIZE as u64,
        });
    };

    let actual = crc32c::crc32c(payload);
    if actual != header.checksum {
        return Err(EngineError::ChecksumMismatch {
            path: PathBuf::from("<buffer>"),
            expected: header.checksum,
            actual,
            offset: HEADER_SIZE as u64,
        });
    }

    let (key, value, operation) = decode_payload(payload)?;
    Ok(WalEntry { header, key, value, operation })
}

fn decode_payload(payload: &[u8]) -> EngineResult<(Vec<u8>, Vec<u8>, Operation)> {
    if payload.len() < PAYLOAD_PREFIX {
        return Err(corrupted(HEADER_SIZE, "payload shorter than its length fields".to_string()));
    }
    let key_len = u16::from_le_bytes([payload[0], payload[1]]) as usize;
    let value_len = le_u32(&payload[2..6]) as usize;
    let operation = Operation::from_u8(payload[6])
        .ok_or_else(|| corrupted(HEADER_SIZE + 6, format!("unknown operation {}", payload[6])))?;

    let key_end = PAYLOAD_PREFIX + key_len;
    let value_end = key_end + value_len;
    if payload.len() < value_end {
        return Err(corrupted(
            HEADER_SIZE,
            format!("payload of {} bytes cannot hold key({}) + value({})", payload.len(), key_len, value_len),
        ));
    }
    Ok((payload[PAYLOAD_PREFIX..key_end].to_vec(), payload[key_end..value_end].to_vec(), operation))
}
