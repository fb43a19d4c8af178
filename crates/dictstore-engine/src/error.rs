//! Error types for engine operations
//!
//! Every engine failure is an `EngineError`. Variants carry the file and
//! offset involved so recovery tooling can report exactly what it skipped.

use std::path::PathBuf;

use thiserror::Error;

/// Engine error types with detailed context
#[derive(Debug, Clone, Error)]
pub enum EngineError {
    /// I/O operation failed
    #[error("I/O error{}: {message} ({kind})", fmt_path(.path))]
    Io {
        /// The file path where the error occurred
        path: Option<PathBuf>,
        /// The underlying I/O error kind
        kind: std::io::ErrorKind,
        /// Human-readable description
        message: String,
    },

    /// A log or data record is structurally invalid
    #[error("WAL corrupted in {} at offset {offset}: {reason}", .path.display())]
    WalCorrupted {
        path: PathBuf,
        offset: u64,
        reason: String,
    },

    /// Checksum verification failed
    #[error(
        "Checksum mismatch in {} at offset {offset}: expected 0x{expected:08x}, got 0x{actual:08x}",
        .path.display()
    )]
    ChecksumMismatch {
        path: PathBuf,
        expected: u32,
        actual: u32,
        offset: u64,
    },

    /// Torn write detected (partial write at end of file)
    #[error(
        "Torn write in {} at offset {offset}: expected {expected_size} bytes, only {available_bytes} available",
        .path.display()
    )]
    TornWrite {
        path: PathBuf,
        expected_size: u32,
        available_bytes: u64,
        offset: u64,
    },

    /// Entry size exceeds maximum allowed
    #[error("Entry {component} too large: {entry_size} bytes exceeds limit of {max_size} bytes")]
    OversizedEntry {
        entry_size: u64,
        max_size: u64,
        /// Whether it's the key or value that's oversized
        component: String,
    },

    /// Magic bytes not found at expected location
    #[error(
        "Magic bytes not found in {} at offset {offset}: found {:02x}{:02x}{:02x}{:02x}",
        .path.display(), .found_bytes[0], .found_bytes[1], .found_bytes[2], .found_bytes[3]
    )]
    NoMagicFound {
        path: PathBuf,
        offset: u64,
        found_bytes: [u8; 4],
    },

    /// Snapshot or base file written by an unknown format version
    #[error("Unsupported format version {found} in {} (expected {expected})", .path.display())]
    UnsupportedVersion {
        path: PathBuf,
        found: u32,
        expected: u32,
    },

    /// Strict open found damaged files; `salvage` may repair them
    #[error("Store at {} is corrupted: {regions} damaged region(s), first: {first}", .path.display())]
    Corrupted {
        path: PathBuf,
        regions: usize,
        first: String,
    },

    /// Another process holds a conflicting lock on the store
    #[error("Store at {} is locked by another process", .path.display())]
    Locked { path: PathBuf },

    /// Backing storage does not exist
    #[error("Store not found at {}", .path.display())]
    NotFound { path: PathBuf },

    /// Mutation attempted on an engine opened read-only
    #[error("Engine is read-only")]
    ReadOnly,

    /// Operation attempted after `close()`
    #[error("Engine is closed")]
    Closed,

    /// `Config::validate` rejected the configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

fn fmt_path(path: &Option<PathBuf>) -> String {
    match path {
        Some(path) => format!(" in {}", path.display()),
        None => String::new(),
    }
}

impl EngineError {
    /// Wrap an I/O error with the path it happened on.
    pub fn io(path: impl Into<PathBuf>, err: std::io::Error, what: &str) -> Self {
        EngineError::Io {
            path: Some(path.into()),
            kind: err.kind(),
            message: format!("{}: {}", what, err),
        }
    }

    /// True for errors that indicate damaged on-disk state.
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            EngineError::WalCorrupted { .. }
                | EngineError::ChecksumMismatch { .. }
                | EngineError::TornWrite { .. }
                | EngineError::NoMagicFound { .. }
                | EngineError::UnsupportedVersion { .. }
                | EngineError::Corrupted { .. }
        )
    }
}

/// Convert std::io::Error to EngineError::Io
impl From<std::io::Error> for EngineError {
    fn from(err: std::io::Error) -> Self {
        EngineError::Io {
            path: None,
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

/// Result type alias for engine operations
pub type EngineResult<T> = Result<T, EngineError>;
