//! Configuration management for the engine
//!
//! Provides presets for different hardware classes and builder-style
//! setters for custom configurations.

use std::time::Duration;

use crate::format::{MAX_KEY_SIZE, MAX_VALUE_SIZE};

/// Engine configuration with tier presets
#[derive(Debug, Clone)]
pub struct Config {
    /// WAL file rotation threshold (bytes)
    pub wal_rotation_size_bytes: u64,
    /// Compaction trigger: compact when dead space ratio exceeds this
    pub compaction_trigger_ratio: f64,
    /// Background trickle flush cadence
    pub trickle_cadence: Duration,
    /// Start the trickle thread on read-write open
    pub enable_trickle: bool,
    /// fsync the WAL on every single write (batches always sync once at commit)
    pub sync_writes: bool,
    /// Fold the WAL into a fresh base file when the store is closed
    pub checkpoint_on_close: bool,
    /// Create the store directory on read-write open if it is missing
    pub create_if_missing: bool,
    /// Maximum key size in bytes
    pub max_key_size: usize,
    /// Maximum value size in bytes
    pub max_value_size: usize,
}

impl Config {
    /// Server-class: large dictionaries, frequent rebuilds
    pub fn server() -> Self {
        Self {
            wal_rotation_size_bytes: 64 * 1024 * 1024,
            compaction_trigger_ratio: 0.3,
            trickle_cadence: Duration::from_secs(12),
            enable_trickle: true,
            sync_writes: true,
            checkpoint_on_close: true,
            create_if_missing: true,
            max_key_size: 1024,
            max_value_size: 16 * 1024 * 1024,
        }
    }

    /// Desktop-class: user dictionaries on a laptop SSD
    pub fn desktop() -> Self {
        Self {
            wal_rotation_size_bytes: 16 * 1024 * 1024,
            compaction_trigger_ratio: 0.25,
            trickle_cadence: Duration::from_secs(15),
            enable_trickle: true,
            sync_writes: true,
            checkpoint_on_close: true,
            create_if_missing: true,
            max_key_size: 512,
            max_value_size: 4 * 1024 * 1024,
        }
    }

    /// Mobile-class: flash storage, writes are batched
    pub fn mobile() -> Self {
        Self {
            wal_rotation_size_bytes: 4 * 1024 * 1024,
            compaction_trigger_ratio: 0.2,
            trickle_cadence: Duration::from_secs(30),
            enable_trickle: false,
            sync_writes: false,
            checkpoint_on_close: true,
            create_if_missing: true,
            max_key_size: 256,
            max_value_size: 1024 * 1024,
        }
    }

    pub fn with_trickle(mut self, enabled: bool, cadence: Duration) -> Self {
        self.enable_trickle = enabled;
        self.trickle_cadence = cadence;
        self
    }

    pub fn with_sync_writes(mut self, sync: bool) -> Self {
        self.sync_writes = sync;
        self
    }

    pub fn with_checkpoint_on_close(mut self, checkpoint: bool) -> Self {
        self.checkpoint_on_close = checkpoint;
        self
    }

    pub fn with_create_if_missing(mut self, create: bool) -> Self {
        self.create_if_missing = create;
        self
    }

    pub fn with_wal_rotation_size(mut self, bytes: u64) -> Self {
        self.wal_rotation_size_bytes = bytes;
        self
    }

    pub fn with_limits(mut self, max_key_size: usize, max_value_size: usize) -> Self {
        self.max_key_size = max_key_size;
        self.max_value_size = max_value_size;
        self
    }

    /// Validate all configuration parameters
    pub fn validate(&self) -> Result<(), String> {
        if self.wal_rotation_size_bytes < 64 * 1024 {
            return Err("wal_rotation_size_bytes must be >= 64KB".into());
        }
        if self.compaction_trigger_ratio <= 0.0 || self.compaction_trigger_ratio >= 1.0 {
            return Err("compaction_trigger_ratio must be in (0.0, 1.0)".into());
        }
        if self.trickle_cadence.as_millis() == 0 {
            return Err("trickle_cadence must be > 0".into());
        }
        if self.max_key_size == 0 || self.max_key_size > MAX_KEY_SIZE {
            return Err(format!("max_key_size must be in [1, {}]", MAX_KEY_SIZE));
        }
        if self.max_value_size == 0 || self.max_value_size > MAX_VALUE_SIZE {
            return Err(format!("max_value_size must be in [1, {}]", MAX_VALUE_SIZE));
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self { Self::desktop() }
}
