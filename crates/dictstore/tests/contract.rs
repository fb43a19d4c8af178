//! Contract compliance: every check here runs against both backends.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use proptest::prelude::*;
use tempfile::TempDir;

use dictstore::{ClawDb, FlatDb, FlatOptions};
use dictstore_api::{open_or_recover, Db, DbAccessor, DbError, Record};
use dictstore_engine::Config;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

type Make = fn(&Path) -> Box<dyn Db>;

fn claw_config() -> Config {
    Config::mobile().with_checkpoint_on_close(false)
}

fn make_claw(dir: &Path) -> Box<dyn Db> {
    Box::new(ClawDb::new(dir.join("store.claw"), "store", claw_config()))
}

fn make_flat(dir: &Path) -> Box<dyn Db> {
    Box::new(FlatDb::new(dir.join("store.flat"), "store", FlatOptions::default()))
}

const BACKENDS: [(&str, Make); 2] = [("claw", make_claw), ("flat", make_flat)];

/// Run `check` once per backend against a fresh, unopened store.
fn for_each_backend(check: impl Fn(&str, &dyn Db, &Path)) {
    for (label, make) in BACKENDS {
        let dir = TempDir::new().unwrap();
        let db = make(dir.path());
        check(label, db.as_ref(), dir.path());
        db.close().unwrap();
    }
}

fn drain(cursor: &mut dyn DbAccessor) -> Vec<Record> {
    let mut out = Vec::new();
    while let Some(record) = cursor.next_record().unwrap() {
        out.push(record);
    }
    out
}

fn rec(key: &str, value: &str) -> Record {
    (key.as_bytes().to_vec(), value.as_bytes().to_vec())
}

fn fill(db: &dyn Db, pairs: &[(&str, &str)]) {
    for (key, value) in pairs {
        db.update(key.as_bytes(), value.as_bytes()).unwrap();
    }
}

// ---------------------------------------------------------------------------
// Queries
// ---------------------------------------------------------------------------

#[test]
fn test_prefix_scenario() {
    for_each_backend(|label, db, _| {
        db.open().unwrap();
        fill(db, &[("a/1", "x"), ("a/2", "y"), ("b/1", "z")]);

        let mut scoped = db.query(b"a/").unwrap();
        assert_eq!(drain(scoped.as_mut()), vec![rec("a/1", "x"), rec("a/2", "y")], "{label}");
        assert!(scoped.exhausted());

        let mut all = db.query_all().unwrap();
        assert_eq!(
            drain(all.as_mut()),
            vec![rec("a/1", "x"), rec("a/2", "y"), rec("b/1", "z")],
            "{label}"
        );
    });
}

#[test]
fn test_jump_and_reset() {
    for_each_backend(|label, db, _| {
        db.open().unwrap();
        fill(db, &[("a/1", "x"), ("a/3", "y"), ("b/1", "z")]);
        let mut cursor = db.query(b"a/").unwrap();

        assert!(cursor.jump(b"a/2").unwrap(), "{label}");
        assert_eq!(cursor.next_record().unwrap(), Some(rec("a/3", "y")));

        // A key below the prefix lands on the first matching record.
        assert!(cursor.jump(b"").unwrap());
        assert_eq!(cursor.next_record().unwrap(), Some(rec("a/1", "x")));

        // Past the prefix range: exhausted, and it stays that way.
        assert!(!cursor.jump(b"a/4").unwrap());
        assert!(cursor.exhausted());
        assert!(!cursor.jump(b"a/1").unwrap());
        assert_eq!(cursor.next_record().unwrap(), None);
        assert!(cursor.exhausted());

        cursor.reset();
        assert!(!cursor.exhausted());
        assert_eq!(drain(cursor.as_mut()).len(), 2, "{label}");
    });
}

#[test]
fn test_metadata_key_space() {
    for_each_backend(|label, db, _| {
        db.open().unwrap();
        db.create_metadata().unwrap();
        db.create_metadata().unwrap();
        db.meta_update(b"format", b"2").unwrap();
        db.update(b"word", b"def").unwrap();

        assert_eq!(db.meta_fetch(b"format").unwrap(), Some(b"2".to_vec()), "{label}");
        assert_eq!(db.fetch(b"format").unwrap(), None, "{label}");
        assert_eq!(db.meta_fetch(b"word").unwrap(), None, "{label}");

        let meta = drain(db.query_metadata().unwrap().as_mut());
        assert!(meta.contains(&rec("format", "2")), "{label}");
        assert!(!meta.iter().any(|(key, _)| key == b"word"), "{label}");
        assert_eq!(drain(db.query_all().unwrap().as_mut()), vec![rec("word", "def")], "{label}");
    });
}

#[test]
fn test_point_operations() {
    for_each_backend(|label, db, _| {
        db.open().unwrap();
        assert_eq!(db.fetch(b"k").unwrap(), None, "{label}");
        db.update(b"k", b"1").unwrap();
        db.update(b"k", b"2").unwrap();
        assert_eq!(db.fetch(b"k").unwrap(), Some(b"2".to_vec()), "{label}");
        assert!(db.erase(b"k").unwrap(), "{label}");
        assert!(!db.erase(b"k").unwrap(), "{label}");
        assert_eq!(db.fetch(b"k").unwrap(), None, "{label}");
    });
}

// ---------------------------------------------------------------------------
// Gates
// ---------------------------------------------------------------------------

#[test]
fn test_not_loaded_refuses_everything() {
    for_each_backend(|label, db, _| {
        assert!(matches!(db.fetch(b"k"), Err(DbError::NotLoaded { .. })), "{label}");
        assert!(matches!(db.update(b"k", b"v"), Err(DbError::NotLoaded { .. })), "{label}");
        assert!(matches!(db.erase(b"k"), Err(DbError::NotLoaded { .. })), "{label}");
        assert!(matches!(db.meta_fetch(b"k"), Err(DbError::NotLoaded { .. })), "{label}");
        assert!(db.query_all().is_err(), "{label}");
        db.close().unwrap();
    });
}

#[test]
fn test_disable_takes_precedence() {
    for_each_backend(|label, db, dir| {
        db.open().unwrap();
        db.update(b"k", b"v").unwrap();
        db.close().unwrap();
        db.open_read_only().unwrap();
        db.disable();

        let disabled = |r: Result<(), DbError>| matches!(r, Err(DbError::Disabled { .. }));
        assert!(disabled(db.fetch(b"k").map(|_| ())), "{label}");
        assert!(disabled(db.update(b"k", b"v")), "{label}");
        assert!(disabled(db.erase(b"k").map(|_| ())), "{label}");
        assert!(disabled(db.meta_fetch(b"k").map(|_| ())), "{label}");
        assert!(disabled(db.meta_update(b"k", b"v")), "{label}");
        assert!(disabled(db.query(b"").map(|_| ())), "{label}");
        assert!(disabled(db.query_metadata().map(|_| ())), "{label}");
        assert!(disabled(db.backup(&dir.join("snap")).map(|_| ())), "{label}");
        assert!(db.loaded() && db.readonly(), "{label}");

        db.enable();
        assert_eq!(db.fetch(b"k").unwrap(), Some(b"v".to_vec()), "{label}");
        assert!(matches!(db.update(b"k", b"w"), Err(DbError::ReadOnly { .. })), "{label}");
    });
}

#[test]
fn test_disable_takes_precedence_over_not_loaded() {
    for_each_backend(|label, db, dir| {
        db.disable();
        assert!(!db.loaded(), "{label}");

        let disabled = |r: Result<(), DbError>| matches!(r, Err(DbError::Disabled { .. }));
        assert!(disabled(db.fetch(b"k").map(|_| ())), "{label}");
        assert!(disabled(db.update(b"k", b"v")), "{label}");
        assert!(disabled(db.erase(b"k").map(|_| ())), "{label}");
        assert!(disabled(db.meta_fetch(b"k").map(|_| ())), "{label}");
        assert!(disabled(db.meta_update(b"k", b"v")), "{label}");
        assert!(disabled(db.query(b"").map(|_| ())), "{label}");
        assert!(disabled(db.query_metadata().map(|_| ())), "{label}");
        assert!(disabled(db.backup(&dir.join("snap")).map(|_| ())), "{label}");

        db.enable();
        assert!(matches!(db.fetch(b"k"), Err(DbError::NotLoaded { .. })), "{label}");
    });
}

#[test]
fn test_cursor_survives_disable() {
    for_each_backend(|label, db, _| {
        db.open().unwrap();
        fill(db, &[("a", "1"), ("b", "2")]);
        let mut cursor = db.query_all().unwrap();
        assert_eq!(cursor.next_record().unwrap(), Some(rec("a", "1")));

        db.disable();
        assert_eq!(cursor.next_record().unwrap(), Some(rec("b", "2")), "{label}");
        assert_eq!(cursor.next_record().unwrap(), None, "{label}");
        db.enable();
    });
}

// ---------------------------------------------------------------------------
// Lifecycle
// ---------------------------------------------------------------------------

#[test]
fn test_close_invalidates_cursors() {
    for_each_backend(|label, db, _| {
        db.open().unwrap();
        fill(db, &[("a", "1"), ("b", "2")]);
        let mut cursor = db.query_all().unwrap();
        assert!(cursor.next_record().unwrap().is_some());

        db.close().unwrap();
        db.close().unwrap();
        assert_eq!(cursor.next_record(), Err(DbError::CursorInvalidated), "{label}");
        assert!(matches!(cursor.jump(b"a"), Err(DbError::CursorInvalidated)), "{label}");
    });
}

#[test]
fn test_open_twice_is_refused() {
    for_each_backend(|label, db, _| {
        db.open().unwrap();
        assert!(matches!(db.open(), Err(DbError::AlreadyOpen { .. })), "{label}");
        assert!(db.loaded());
    });
}

#[test]
fn test_read_only_open_of_missing_store_fails() {
    for_each_backend(|label, db, _| {
        assert!(!db.exists(), "{label}");
        assert!(matches!(db.open_read_only(), Err(DbError::Missing { .. })), "{label}");
        assert!(!db.loaded(), "{label}");
    });
}

#[test]
fn test_remove() {
    for_each_backend(|label, db, _| {
        assert!(matches!(db.remove(), Err(DbError::Missing { .. })), "{label}");
        db.open().unwrap();
        db.update(b"k", b"v").unwrap();
        assert!(db.exists(), "{label}");
        assert!(matches!(db.remove(), Err(DbError::StillOpen { .. })), "{label}");

        db.close().unwrap();
        db.remove().unwrap();
        assert!(!db.exists(), "{label}");
    });
}

#[test]
fn test_reopen_sees_committed_state() {
    for_each_backend(|label, db, _| {
        db.open().unwrap();
        fill(db, &[("k1", "v1"), ("k2", "v2")]);
        db.erase(b"k1").unwrap();
        db.meta_update(b"m", b"1").unwrap();
        db.close().unwrap();

        db.open().unwrap();
        assert_eq!(db.fetch(b"k1").unwrap(), None, "{label}");
        assert_eq!(db.fetch(b"k2").unwrap(), Some(b"v2".to_vec()), "{label}");
        assert_eq!(db.meta_fetch(b"m").unwrap(), Some(b"1".to_vec()), "{label}");
    });
}

// ---------------------------------------------------------------------------
// Backup / restore
// ---------------------------------------------------------------------------

#[test]
fn test_backup_restore_round_trip() {
    for_each_backend(|label, db, dir| {
        let snapshot = dir.join("backup.snap");
        db.open().unwrap();
        fill(db, &[("a", "1"), ("b", "2")]);
        db.meta_update(b"rev", b"7").unwrap();
        db.backup(&snapshot).unwrap();

        db.update(b"a", b"changed").unwrap();
        db.update(b"c", b"3").unwrap();
        db.meta_update(b"rev", b"8").unwrap();
        assert!(matches!(db.restore(&snapshot), Err(DbError::StillOpen { .. })), "{label}");
        db.close().unwrap();

        db.restore(&snapshot).unwrap();
        db.open().unwrap();
        assert_eq!(drain(db.query_all().unwrap().as_mut()), vec![rec("a", "1"), rec("b", "2")], "{label}");
        assert_eq!(db.meta_fetch(b"rev").unwrap(), Some(b"7".to_vec()), "{label}");
    });
}

#[test]
fn test_bad_snapshot_leaves_store_untouched() {
    for_each_backend(|label, db, dir| {
        let snapshot = dir.join("garbage.snap");
        fs::write(&snapshot, vec![0xAB; 200]).unwrap();
        db.open().unwrap();
        db.update(b"k", b"v").unwrap();
        db.close().unwrap();

        assert!(db.restore(&snapshot).is_err(), "{label}");
        assert!(db.restore(&dir.join("absent.snap")).is_err(), "{label}");
        db.open().unwrap();
        assert_eq!(db.fetch(b"k").unwrap(), Some(b"v".to_vec()), "{label}");
    });
}

#[test]
fn test_backup_excludes_open_transaction() {
    let dir = TempDir::new().unwrap();
    let db = make_claw(dir.path());
    let snapshot = dir.path().join("tx.snap");
    db.open().unwrap();
    db.update(b"committed", b"1").unwrap();

    let tx = db.as_transactional().unwrap();
    tx.begin_transaction().unwrap();
    db.update(b"pending", b"2").unwrap();
    db.backup(&snapshot).unwrap();
    tx.abort_transaction().unwrap();
    db.close().unwrap();

    db.restore(&snapshot).unwrap();
    db.open().unwrap();
    assert_eq!(drain(db.query_all().unwrap().as_mut()), vec![rec("committed", "1")]);
    db.close().unwrap();
}

// ---------------------------------------------------------------------------
// Capabilities
// ---------------------------------------------------------------------------

#[test]
fn test_transaction_atomicity() {
    for_each_backend(|label, db, _| {
        db.open().unwrap();
        let Some(tx) = db.as_transactional() else {
            return;
        };
        db.update(b"k", b"v0").unwrap();

        tx.begin_transaction().unwrap();
        assert!(tx.in_transaction(), "{label}");
        db.update(b"k", b"v1").unwrap();
        db.update(b"k", b"v2").unwrap();
        tx.commit_transaction().unwrap();
        assert_eq!(db.fetch(b"k").unwrap(), Some(b"v2".to_vec()), "{label}");

        tx.begin_transaction().unwrap();
        db.update(b"k", b"v3").unwrap();
        db.update(b"fresh", b"x").unwrap();
        tx.abort_transaction().unwrap();
        assert!(!tx.in_transaction(), "{label}");
        assert_eq!(db.fetch(b"k").unwrap(), Some(b"v2".to_vec()), "{label}");
        assert_eq!(db.fetch(b"fresh").unwrap(), None, "{label}");
    });
}

#[test]
fn test_committed_transaction_survives_reopen() {
    let dir = TempDir::new().unwrap();
    let db = make_claw(dir.path());
    db.open().unwrap();
    let tx = db.as_transactional().unwrap();
    tx.begin_transaction().unwrap();
    fill(db.as_ref(), &[("x", "1"), ("y", "2")]);
    tx.commit_transaction().unwrap();
    db.close().unwrap();

    db.open_read_only().unwrap();
    assert_eq!(drain(db.query_all().unwrap().as_mut()), vec![rec("x", "1"), rec("y", "2")]);
    db.close().unwrap();
}

fn first_wal_file(store: &Path) -> PathBuf {
    let mut files: Vec<PathBuf> = fs::read_dir(store.join("wal"))
        .unwrap()
        .map(|entry| entry.unwrap().path())
        .collect();
    files.sort();
    files.remove(0)
}

#[test]
fn test_open_or_recover_repairs_damaged_log() {
    let dir = TempDir::new().unwrap();
    let db = make_claw(dir.path());
    db.open().unwrap();
    fill(db.as_ref(), &[("k1", "v1"), ("k2", "v2")]);
    db.close().unwrap();

    // Flip a payload byte of the first logged record.
    let wal = first_wal_file(db.file_path());
    let mut bytes = fs::read(&wal).unwrap();
    bytes[40] ^= 0xFF;
    fs::write(&wal, bytes).unwrap();

    assert!(db.open().unwrap_err().is_corruption());
    assert!(!db.loaded());

    open_or_recover(db.as_ref()).unwrap();
    assert!(db.loaded());
    assert!(!db.disabled());
    assert_eq!(db.fetch(b"k1").unwrap(), None);
    assert_eq!(db.fetch(b"k2").unwrap(), Some(b"v2".to_vec()));
    db.close().unwrap();
}

#[test]
fn test_open_or_recover_without_capability() {
    let dir = TempDir::new().unwrap();
    let db = make_flat(dir.path());
    fs::write(db.file_path(), vec![0u8; 64]).unwrap();

    let err = open_or_recover(db.as_ref()).unwrap_err();
    assert!(err.is_corruption());
    assert!(db.as_recoverable().is_none());
    assert!(!db.disabled());
}

// ---------------------------------------------------------------------------
// Properties
// ---------------------------------------------------------------------------

fn key_strategy() -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(0u8..4, 0..5)
}

fn model_strategy() -> impl Strategy<Value = BTreeMap<Vec<u8>, Vec<u8>>> {
    prop::collection::btree_map(key_strategy(), prop::collection::vec(any::<u8>(), 0..4), 0..32)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// Cursors yield exactly the matching records, strictly ascending.
    #[test]
    fn prop_prefix_and_order(model in model_strategy(), prefix in prop::collection::vec(0u8..4, 0..3)) {
        for (label, make) in BACKENDS {
            let dir = TempDir::new().unwrap();
            let db = make(dir.path());
            db.open().unwrap();
            for (key, value) in &model {
                db.update(key, value).unwrap();
            }

            let got = drain(db.query(&prefix).unwrap().as_mut());
            let expected: Vec<Record> = model
                .iter()
                .filter(|(key, _)| key.starts_with(&prefix))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            prop_assert!(got.iter().all(|(key, _)| key.starts_with(&prefix)), "{}", label);
            prop_assert!(got.windows(2).all(|pair| pair[0].0 < pair[1].0), "{}", label);
            prop_assert_eq!(got, expected);
            db.close().unwrap();
        }
    }

    /// `jump(k)` lands on the smallest matching key >= k, or exhausts.
    #[test]
    fn prop_jump(
        model in model_strategy(),
        prefix in prop::collection::vec(0u8..4, 0..2),
        target in key_strategy(),
    ) {
        for (label, make) in BACKENDS {
            let dir = TempDir::new().unwrap();
            let db = make(dir.path());
            db.open().unwrap();
            for (key, value) in &model {
                db.update(key, value).unwrap();
            }

            let expected = model
                .range(target.clone()..)
                .find(|(key, _)| key.starts_with(&prefix))
                .map(|(k, v)| (k.clone(), v.clone()));
            let mut cursor = db.query(&prefix).unwrap();
            prop_assert_eq!(cursor.jump(&target).unwrap(), expected.is_some(), "{}", label);
            prop_assert_eq!(cursor.exhausted(), expected.is_none());
            prop_assert_eq!(cursor.next_record().unwrap(), expected);

            // Exhaustion is sticky until reset.
            while cursor.next_record().unwrap().is_some() {}
            prop_assert!(cursor.exhausted());
            prop_assert_eq!(cursor.next_record().unwrap(), None);
            prop_assert!(cursor.exhausted());
            cursor.reset();
            prop_assert!(!cursor.exhausted());
            db.close().unwrap();
        }
    }
}
