//! Round-trip behavior of the public API against a real environment.

use lynxdb::{DbFlags, Env, EnvOptions, Error, WriteFlags};
use tempfile::TempDir;

fn open_env() -> (TempDir, Env) {
    let dir = TempDir::new().unwrap();
    let env = EnvOptions::new()
        .map_size(10 << 20)
        .open(dir.path())
        .unwrap();
    (dir, env)
}

#[test]
fn put_commit_get_roundtrip() {
    let (_dir, env) = open_env();

    let mut txn = env.begin_rw_txn().unwrap();
    let db = txn.open_db(None, DbFlags::empty()).unwrap();
    txn.put(db, b"alpha", b"1", WriteFlags::empty()).unwrap();
    txn.put(db, b"bravo", b"2", WriteFlags::empty()).unwrap();
    txn.commit().unwrap();

    let txn = env.begin_ro_txn().unwrap();
    assert_eq!(txn.get(db, b"alpha").unwrap(), Some(&b"1"[..]));
    assert_eq!(txn.get(db, b"bravo").unwrap(), Some(&b"2"[..]));
    assert_eq!(txn.get(db, b"charlie").unwrap(), None);
}

#[test]
fn put_then_get_within_one_txn() {
    let (_dir, env) = open_env();

    let mut txn = env.begin_rw_txn().unwrap();
    let db = txn.open_db(None, DbFlags::empty()).unwrap();
    txn.put(db, b"k", b"v", WriteFlags::empty()).unwrap();
    assert_eq!(txn.get(db, b"k").unwrap(), Some(&b"v"[..]));
    txn.abort();

    // Aborted writes leave no trace.
    let txn = env.begin_ro_txn().unwrap();
    assert_eq!(txn.get(db, b"k").unwrap(), None);
}

#[test]
fn delete_then_get_is_absent() {
    let (_dir, env) = open_env();

    let mut txn = env.begin_rw_txn().unwrap();
    let db = txn.open_db(None, DbFlags::empty()).unwrap();
    txn.put(db, b"k", b"v", WriteFlags::empty()).unwrap();
    txn.del(db, b"k", None).unwrap();
    assert_eq!(txn.get(db, b"k").unwrap(), None);
    assert!(matches!(txn.del(db, b"k", None), Err(Error::NotFound)));
    txn.commit().unwrap();
}

#[test]
fn overwrite_replaces_the_value() {
    let (_dir, env) = open_env();

    let mut txn = env.begin_rw_txn().unwrap();
    let db = txn.open_db(None, DbFlags::empty()).unwrap();
    txn.put(db, b"k", b"old", WriteFlags::empty()).unwrap();
    txn.put(db, b"k", b"new-and-longer", WriteFlags::empty())
        .unwrap();
    txn.commit().unwrap();

    let txn = env.begin_ro_txn().unwrap();
    assert_eq!(txn.get(db, b"k").unwrap(), Some(&b"new-and-longer"[..]));
    assert_eq!(txn.db_stat(db).unwrap().entries, 1);
}

#[test]
fn no_overwrite_reports_key_exist() {
    let (_dir, env) = open_env();

    let mut txn = env.begin_rw_txn().unwrap();
    let db = txn.open_db(None, DbFlags::empty()).unwrap();
    txn.put(db, b"k", b"v", WriteFlags::empty()).unwrap();
    assert!(matches!(
        txn.put(db, b"k", b"other", WriteFlags::NO_OVERWRITE),
        Err(Error::KeyExist)
    ));
    // The transaction stays usable after the benign failure.
    assert_eq!(txn.get(db, b"k").unwrap(), Some(&b"v"[..]));
    txn.commit().unwrap();
}

#[test]
fn forward_and_reverse_scans_mirror() {
    let (_dir, env) = open_env();

    let mut txn = env.begin_rw_txn().unwrap();
    let db = txn.open_db(None, DbFlags::empty()).unwrap();
    for i in 0..500u32 {
        let key = format!("key{i:05}");
        let value = format!("value{i}");
        txn.put(db, key.as_bytes(), value.as_bytes(), WriteFlags::empty())
            .unwrap();
    }
    txn.commit().unwrap();

    let txn = env.begin_ro_txn().unwrap();
    let mut forward = Vec::new();
    let mut cursor = txn.cursor(db).unwrap();
    let mut entry = cursor.first().unwrap();
    while let Some((k, v)) = entry {
        forward.push((k.to_vec(), v.to_vec()));
        entry = cursor.next().unwrap();
    }

    let mut reverse = Vec::new();
    let mut cursor = txn.cursor(db).unwrap();
    let mut entry = cursor.last().unwrap();
    while let Some((k, v)) = entry {
        reverse.push((k.to_vec(), v.to_vec()));
        entry = cursor.prev().unwrap();
    }

    assert_eq!(forward.len(), 500);
    reverse.reverse();
    assert_eq!(forward, reverse);
    assert!(forward.windows(2).all(|w| w[0].0 < w[1].0));
}

#[test]
fn cursor_set_range_finds_next_key() {
    let (_dir, env) = open_env();

    let mut txn = env.begin_rw_txn().unwrap();
    let db = txn.open_db(None, DbFlags::empty()).unwrap();
    for key in [b"bb".as_slice(), b"dd", b"ff"] {
        txn.put(db, key, b"v", WriteFlags::empty()).unwrap();
    }
    txn.commit().unwrap();

    let txn = env.begin_ro_txn().unwrap();
    let mut cursor = txn.cursor(db).unwrap();
    let (key, _) = cursor.set_range(b"cc").unwrap().unwrap();
    assert_eq!(key, b"dd");
    assert!(cursor.set_range(b"zz").unwrap().is_none());
    assert!(cursor.set(b"cc").unwrap().is_none());
    assert!(cursor.set(b"ff").unwrap().is_some());
}

#[test]
fn named_databases_are_independent() {
    let (_dir, env) = open_env();

    let mut txn = env.begin_rw_txn().unwrap();
    let first = txn.open_db(Some("first"), DbFlags::CREATE).unwrap();
    let second = txn.open_db(Some("second"), DbFlags::CREATE).unwrap();
    txn.put(first, b"k", b"from-first", WriteFlags::empty())
        .unwrap();
    txn.put(second, b"k", b"from-second", WriteFlags::empty())
        .unwrap();
    txn.commit().unwrap();

    let mut txn = env.begin_ro_txn().unwrap();
    let first = txn.open_db(Some("first"), DbFlags::empty()).unwrap();
    let second = txn.open_db(Some("second"), DbFlags::empty()).unwrap();
    assert_eq!(txn.get(first, b"k").unwrap(), Some(&b"from-first"[..]));
    assert_eq!(txn.get(second, b"k").unwrap(), Some(&b"from-second"[..]));
}

#[test]
fn named_database_survives_reopen() {
    let dir = TempDir::new().unwrap();
    {
        let env = EnvOptions::new().open(dir.path()).unwrap();
        let mut txn = env.begin_rw_txn().unwrap();
        let db = txn
            .open_db(Some("persistent"), DbFlags::CREATE)
            .unwrap();
        txn.put(db, b"k", b"v", WriteFlags::empty()).unwrap();
        txn.commit().unwrap();
    }
    let env = EnvOptions::new().open(dir.path()).unwrap();
    let mut txn = env.begin_ro_txn().unwrap();
    let db = txn.open_db(Some("persistent"), DbFlags::empty()).unwrap();
    assert_eq!(txn.get(db, b"k").unwrap(), Some(&b"v"[..]));
}

#[test]
fn missing_named_database_is_not_found() {
    let (_dir, env) = open_env();
    let mut txn = env.begin_ro_txn().unwrap();
    assert!(matches!(
        txn.open_db(Some("nope"), DbFlags::empty()),
        Err(Error::NotFound)
    ));
}

#[test]
fn drop_db_removes_the_name_record() {
    let (_dir, env) = open_env();

    let mut txn = env.begin_rw_txn().unwrap();
    let db = txn.open_db(Some("doomed"), DbFlags::CREATE).unwrap();
    for i in 0..100u32 {
        txn.put(db, &i.to_be_bytes(), b"v", WriteFlags::empty())
            .unwrap();
    }
    txn.commit().unwrap();

    let mut txn = env.begin_rw_txn().unwrap();
    let db = txn.open_db(Some("doomed"), DbFlags::empty()).unwrap();
    txn.drop_db(db, true).unwrap();
    txn.commit().unwrap();

    let mut txn = env.begin_ro_txn().unwrap();
    assert!(matches!(
        txn.open_db(Some("doomed"), DbFlags::empty()),
        Err(Error::NotFound)
    ));
}

#[test]
fn clear_db_keeps_the_handle() {
    let (_dir, env) = open_env();

    let mut txn = env.begin_rw_txn().unwrap();
    let db = txn.open_db(None, DbFlags::empty()).unwrap();
    for i in 0..50u32 {
        txn.put(db, &i.to_be_bytes(), b"v", WriteFlags::empty())
            .unwrap();
    }
    txn.clear_db(db).unwrap();
    txn.put(db, b"fresh", b"v", WriteFlags::empty()).unwrap();
    txn.commit().unwrap();

    let txn = env.begin_ro_txn().unwrap();
    assert_eq!(txn.db_stat(db).unwrap().entries, 1);
    assert_eq!(txn.get(db, b"fresh").unwrap(), Some(&b"v"[..]));
}

#[test]
fn reserve_returns_writable_slice() {
    let (_dir, env) = open_env();

    let mut txn = env.begin_rw_txn().unwrap();
    let db = txn.open_db(None, DbFlags::empty()).unwrap();
    {
        let slice = txn
            .put_reserve(db, b"k", 4, WriteFlags::empty())
            .unwrap();
        slice.copy_from_slice(b"data");
    }
    txn.commit().unwrap();

    let txn = env.begin_ro_txn().unwrap();
    assert_eq!(txn.get(db, b"k").unwrap(), Some(&b"data"[..]));
}

#[test]
fn append_mode_accepts_only_ascending_keys() {
    let (_dir, env) = open_env();

    let mut txn = env.begin_rw_txn().unwrap();
    let db = txn.open_db(None, DbFlags::empty()).unwrap();
    txn.put(db, b"a", b"1", WriteFlags::APPEND).unwrap();
    txn.put(db, b"b", b"2", WriteFlags::APPEND).unwrap();
    assert!(matches!(
        txn.put(db, b"aa", b"3", WriteFlags::APPEND),
        Err(Error::KeyExist)
    ));
    txn.commit().unwrap();

    let txn = env.begin_ro_txn().unwrap();
    assert_eq!(txn.db_stat(db).unwrap().entries, 2);
}

#[test]
fn cursor_delete_parks_on_successor() {
    let (_dir, env) = open_env();

    let mut txn = env.begin_rw_txn().unwrap();
    let db = txn.open_db(None, DbFlags::empty()).unwrap();
    for key in [b"a".as_slice(), b"b", b"c"] {
        txn.put(db, key, b"v", WriteFlags::empty()).unwrap();
    }
    {
        let mut cursor = txn.cursor_mut(db).unwrap();
        cursor.set(b"b").unwrap().unwrap();
        cursor.del(false).unwrap();
        assert!(cursor.get_current().unwrap().is_none());
        let (key, _) = cursor.next().unwrap().unwrap();
        assert_eq!(key, b"c");
    }
    txn.commit().unwrap();

    let txn = env.begin_ro_txn().unwrap();
    assert_eq!(txn.get(db, b"b").unwrap(), None);
    assert_eq!(txn.db_stat(db).unwrap().entries, 2);
}

#[test]
fn verify_passes_after_mixed_workload() {
    let (_dir, env) = open_env();

    let mut txn = env.begin_rw_txn().unwrap();
    let db = txn.open_db(None, DbFlags::empty()).unwrap();
    for i in 0..1000u32 {
        let key = format!("key{i:05}");
        txn.put(db, key.as_bytes(), &vec![7u8; 100], WriteFlags::empty())
            .unwrap();
    }
    txn.commit().unwrap();

    let mut txn = env.begin_rw_txn().unwrap();
    for i in (0..1000u32).step_by(3) {
        let key = format!("key{i:05}");
        txn.del(db, key.as_bytes(), None).unwrap();
    }
    txn.commit().unwrap();

    let report = env.verify().unwrap();
    assert_eq!(report.unreferenced, 0);
    assert_eq!(report.txnid, 2);
}

#[test]
fn env_copy_preserves_contents() {
    let (_dir, env) = open_env();
    let copy_dir = TempDir::new().unwrap();
    let copy_path = copy_dir.path().join("copy.lynx");

    let mut txn = env.begin_rw_txn().unwrap();
    let db = txn.open_db(None, DbFlags::empty()).unwrap();
    for i in 0..200u32 {
        let key = format!("key{i:04}");
        txn.put(db, key.as_bytes(), b"value", WriteFlags::empty())
            .unwrap();
    }
    txn.commit().unwrap();

    env.copy_to(&copy_path, false).unwrap();
    drop(env);

    let copied = EnvOptions::new()
        .flags(lynxdb::EnvFlags::NO_SUB_DIR)
        .open(&copy_path)
        .unwrap();
    let txn = copied.begin_ro_txn().unwrap();
    assert_eq!(txn.db_stat(db).unwrap().entries, 200);
    assert_eq!(txn.get(db, b"key0150").unwrap(), Some(&b"value"[..]));
}

#[test]
fn env_copy_compact_rewrites_and_preserves_order() {
    let (_dir, env) = open_env();
    let copy_dir = TempDir::new().unwrap();

    let mut txn = env.begin_rw_txn().unwrap();
    let main = txn.open_db(None, DbFlags::empty()).unwrap();
    let named = txn.open_db(Some("extra"), DbFlags::CREATE).unwrap();
    for i in 0..100u32 {
        let key = format!("key{i:04}");
        txn.put(main, key.as_bytes(), b"m", WriteFlags::empty())
            .unwrap();
        txn.put(named, key.as_bytes(), b"n", WriteFlags::empty())
            .unwrap();
    }
    txn.commit().unwrap();

    env.copy_to(copy_dir.path(), true).unwrap();
    drop(env);

    let copied = EnvOptions::new().open(copy_dir.path()).unwrap();
    let mut txn = copied.begin_ro_txn().unwrap();
    let main = txn.open_db(None, DbFlags::empty()).unwrap();
    let named = txn.open_db(Some("extra"), DbFlags::empty()).unwrap();
    assert_eq!(txn.get(main, b"key0042").unwrap(), Some(&b"m"[..]));
    assert_eq!(txn.get(named, b"key0042").unwrap(), Some(&b"n"[..]));
}
