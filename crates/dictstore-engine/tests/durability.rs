//! Crash and damage scenarios against a real store directory.

use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::Duration;

use tempfile::TempDir;

use dictstore_engine::layout::StoreLayout;
use dictstore_engine::{BatchOp, ClawEngine, Config, EngineError, OpenMode};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Size of a batch marker record on disk: header + fixed payload + batch id.
const MARKER_SIZE: u64 = 32 + 8 + 8;

fn quiet() -> Config {
    Config::mobile().with_checkpoint_on_close(false)
}

fn only_wal_file(path: &Path) -> PathBuf {
    let files = StoreLayout::new(path).wal_files().unwrap();
    assert_eq!(files.len(), 1, "expected a single WAL file");
    files[0].1.clone()
}

fn truncate_by(file: &Path, bytes: u64) {
    let len = fs::metadata(file).unwrap().len();
    OpenOptions::new().write(true).open(file).unwrap().set_len(len - bytes).unwrap();
}

fn open_rw(path: &Path) -> ClawEngine {
    ClawEngine::open(path, quiet(), OpenMode::ReadWrite).unwrap()
}

// ---------------------------------------------------------------------------
// Write-ahead log
// ---------------------------------------------------------------------------

#[test]
fn test_torn_tail_is_tolerated() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("store");
    {
        let engine = open_rw(&path);
        engine.put(b"first", b"complete").unwrap();
        engine.put(b"second", b"half written").unwrap();
        engine.close().unwrap();
    }
    truncate_by(&only_wal_file(&path), 5);

    let engine = open_rw(&path);
    assert_eq!(engine.get(b"first").unwrap(), Some(b"complete".to_vec()));
    assert_eq!(engine.get(b"second").unwrap(), None);
}

#[test]
fn test_batch_without_commit_is_discarded() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("store");
    {
        let engine = open_rw(&path);
        engine.put(b"before", b"kept").unwrap();
        engine
            .apply_batch(&[
                BatchOp { key: b"x".to_vec(), value: Some(b"1".to_vec()) },
                BatchOp { key: b"before".to_vec(), value: None },
            ])
            .unwrap();
        engine.close().unwrap();
    }
    // Lose exactly the commit marker, as if the process died before writing it.
    truncate_by(&only_wal_file(&path), MARKER_SIZE);

    let engine = open_rw(&path);
    assert_eq!(engine.get(b"before").unwrap(), Some(b"kept".to_vec()));
    assert_eq!(engine.get(b"x").unwrap(), None);
}

#[test]
fn test_damaged_log_fails_open_until_salvaged() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("store");
    {
        let engine = open_rw(&path);
        engine.put(b"k1", b"v1").unwrap();
        engine.put(b"k2", b"v2").unwrap();
        engine.put(b"k3", b"v3").unwrap();
        engine.close().unwrap();
    }
    let wal = only_wal_file(&path);
    let mut bytes = fs::read(&wal).unwrap();
    bytes[40] ^= 0x5A;
    fs::write(&wal, bytes).unwrap();

    let err = ClawEngine::open(&path, quiet(), OpenMode::ReadWrite).unwrap_err();
    assert!(matches!(err, EngineError::Corrupted { .. }), "{err}");
    assert!(err.is_corruption());

    let report = ClawEngine::salvage(&path).unwrap();
    assert_eq!(report.kept, 2);
    assert!(report.damaged_regions >= 1);

    let layout = StoreLayout::new(&path);
    assert!(layout.wal_files().unwrap().is_empty());
    assert_eq!(layout.base_files().unwrap().len(), 1);

    let engine = ClawEngine::open(&path, quiet(), OpenMode::ReadOnly).unwrap();
    assert_eq!(engine.get(b"k1").unwrap(), None);
    assert_eq!(engine.get(b"k2").unwrap(), Some(b"v2".to_vec()));
    assert_eq!(engine.get(b"k3").unwrap(), Some(b"v3".to_vec()));
}

#[test]
fn test_salvage_of_clean_store_loses_nothing() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("store");
    {
        let engine = open_rw(&path);
        for i in 0..20u32 {
            engine.put(format!("k{i:02}").as_bytes(), &i.to_le_bytes()).unwrap();
        }
        engine.close().unwrap();
    }
    let report = ClawEngine::salvage(&path).unwrap();
    assert_eq!(report.kept, 20);
    assert_eq!(report.damaged_regions, 0);
    assert_eq!(open_rw(&path).len(), 20);
}

// ---------------------------------------------------------------------------
// Data files and checkpoints
// ---------------------------------------------------------------------------

#[test]
fn test_trickled_state_survives_crash() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("store");
    let config = quiet().with_trickle(true, Duration::from_millis(10));
    {
        let engine = ClawEngine::open(&path, config.clone(), OpenMode::ReadWrite).unwrap();
        for i in 0..30u32 {
            engine.put(format!("k{i:02}").as_bytes(), b"v").unwrap();
        }
        engine.delete(b"k00").unwrap();
        std::thread::sleep(Duration::from_millis(100));
        assert!(engine.stats().total_flushed > 0);
        // dropped without close
    }
    assert!(!StoreLayout::new(&path).data_files().unwrap().is_empty());

    let engine = ClawEngine::open(&path, config, OpenMode::ReadWrite).unwrap();
    assert_eq!(engine.len(), 29);
    assert_eq!(engine.get(b"k00").unwrap(), None);
    engine.close().unwrap();
}

#[test]
fn test_reopen_cycles_with_checkpoints() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("store");
    let config = quiet().with_checkpoint_on_close(true);
    for round in 0..5u32 {
        let engine = ClawEngine::open(&path, config.clone(), OpenMode::ReadWrite).unwrap();
        assert_eq!(engine.len(), round as usize);
        engine.put(format!("round{round}").as_bytes(), b"done").unwrap();
        engine.close().unwrap();
    }
    let layout = StoreLayout::new(&path);
    assert_eq!(layout.base_files().unwrap().len(), 1);
    assert!(layout.wal_files().unwrap().len() <= 1);
}

#[test]
fn test_restore_replaces_everything() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("store");
    let snapshot = dir.path().join("store.snap");
    {
        let engine = open_rw(&path);
        engine.put(b"a", b"1").unwrap();
        engine.snapshot_to(&snapshot).unwrap();
        engine.put(b"b", b"2").unwrap();
        engine.delete(b"a").unwrap();
        engine.close().unwrap();
    }
    assert_eq!(ClawEngine::restore(&path, &snapshot).unwrap(), 1);

    let engine = open_rw(&path);
    assert_eq!(engine.get(b"a").unwrap(), Some(b"1".to_vec()));
    assert_eq!(engine.get(b"b").unwrap(), None);
    assert_eq!(engine.len(), 1);
}
