//! dictstore engine: RAM-first ordered key-value storage
//!
//! The reference storage engine behind the `.claw` backend. RAM is the
//! primary working surface; an SSD-backed write-ahead log provides crash
//! safety and checkpoints keep the log short.
//!
//! # Architecture
//!
//! - **Read path**: serve directly from an ordered RAM table
//! - **Write path**: WAL-first, then RAM update
//! - **Trickle engine**: background flush from RAM to CRC32C data files
//! - **Checkpoint**: fold WAL and data files into one base file
//! - **Salvage**: rebuild a damaged store from whatever still verifies
//!
//! The engine knows nothing about stores, cursors or transactions; those
//! live in the `dictstore` crate.

pub mod compaction;
pub mod config;
pub mod datafile;
pub mod engine;
pub mod error;
pub mod format;
pub mod layout;
pub mod platform_durability;
pub mod snapshot;
pub mod trickle;
pub mod wal;

pub use compaction::CompactionResult;
pub use config::Config;
pub use engine::{ClawEngine, EngineStats, LoadReport, OpenMode, SalvageReport, Table};
pub use error::{EngineError, EngineResult};
pub use snapshot::{read_snapshot, write_snapshot, Snapshot};
pub use wal::BatchOp;

/// Engine version recorded in store metadata.
pub const ENGINE_VERSION: &str = env!("CARGO_PKG_VERSION");
