//! Duplicate-sort databases: sorted multi-values, sub-page to sub-tree
//! promotion, duplicate cursor operations, fixed-size packing.

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

fn value16(i: u32) -> Vec<u8> {
    format!("value-{i:010}").into_bytes()
}

#[test]
fn two_hundred_duplicates_iterate_sorted_exactly_once() {
    let (_dir, env) = open_env();

    let mut txn = env.begin_rw_txn().unwrap();
    let db = txn.open_db(Some("dups"), DbFlags::DUP_SORT | DbFlags::CREATE).unwrap();
    // Insert in a scrambled order so the sort is the engine's doing.
    for i in 0..200u32 {
        let scrambled = (i * 37) % 200;
        txn.put(db, b"k", &value16(scrambled), WriteFlags::empty())
            .unwrap();
    }
    txn.commit().unwrap();

    let txn = env.begin_ro_txn().unwrap();
    assert_eq!(txn.db_stat(db).unwrap().entries, 200);

    // The sub-page must have been promoted to a sub-tree along the way;
    // externally the sequence is simply all 200 values in order.
    let mut cursor = txn.cursor(db).unwrap();
    let mut seen = Vec::new();
    let (_, first) = cursor.set(b"k").unwrap().unwrap();
    seen.push(first.to_vec());
    while let Some((_, value)) = cursor.next_dup().unwrap() {
        seen.push(value.to_vec());
    }
    assert_eq!(seen.len(), 200);
    assert!(seen.windows(2).all(|w| w[0] < w[1]));
    for (i, value) in seen.iter().enumerate() {
        assert_eq!(value, &value16(i as u32));
    }

    let mut cursor = txn.cursor(db).unwrap();
    cursor.set(b"k").unwrap().unwrap();
    assert_eq!(cursor.count().unwrap(), 200);

    // Plain get returns the first duplicate.
    assert_eq!(txn.get(db, b"k").unwrap(), Some(value16(0).as_slice()));
}

#[test]
fn small_duplicate_sets_stay_embedded_and_sorted() {
    let (_dir, env) = open_env();

    let mut txn = env.begin_rw_txn().unwrap();
    let db = txn.open_db(Some("d"), DbFlags::DUP_SORT | DbFlags::CREATE).unwrap();
    for value in [b"c".as_slice(), b"a", b"b"] {
        txn.put(db, b"k", value, WriteFlags::empty()).unwrap();
    }
    txn.commit().unwrap();

    let txn = env.begin_ro_txn().unwrap();
    let mut cursor = txn.cursor(db).unwrap();
    let (_, v) = cursor.set(b"k").unwrap().unwrap();
    assert_eq!(v, b"a");
    assert_eq!(cursor.next_dup().unwrap().unwrap().1, b"b");
    assert_eq!(cursor.next_dup().unwrap().unwrap().1, b"c");
    assert!(cursor.next_dup().unwrap().is_none());
    assert_eq!(cursor.count().unwrap(), 3);
}

#[test]
fn no_dup_data_rejects_existing_value() {
    let (_dir, env) = open_env();

    let mut txn = env.begin_rw_txn().unwrap();
    let db = txn.open_db(Some("d"), DbFlags::DUP_SORT | DbFlags::CREATE).unwrap();
    txn.put(db, b"k", b"v1", WriteFlags::empty()).unwrap();
    txn.put(db, b"k", b"v2", WriteFlags::empty()).unwrap();
    assert!(matches!(
        txn.put(db, b"k", b"v1", WriteFlags::NO_DUP_DATA),
        Err(Error::KeyExist)
    ));
    // A fresh value is still welcome.
    txn.put(db, b"k", b"v3", WriteFlags::NO_DUP_DATA).unwrap();
    txn.commit().unwrap();
}

#[test]
fn deleting_one_duplicate_leaves_the_rest() {
    let (_dir, env) = open_env();

    let mut txn = env.begin_rw_txn().unwrap();
    let db = txn.open_db(Some("d"), DbFlags::DUP_SORT | DbFlags::CREATE).unwrap();
    for value in [b"a".as_slice(), b"b", b"c"] {
        txn.put(db, b"k", value, WriteFlags::empty()).unwrap();
    }
    txn.del(db, b"k", Some(b"b")).unwrap();
    assert!(matches!(
        txn.del(db, b"k", Some(b"b")),
        Err(Error::NotFound)
    ));
    txn.commit().unwrap();

    let txn = env.begin_ro_txn().unwrap();
    assert_eq!(txn.db_stat(db).unwrap().entries, 2);
    let mut cursor = txn.cursor(db).unwrap();
    cursor.set(b"k").unwrap().unwrap();
    assert_eq!(cursor.count().unwrap(), 2);
}

#[test]
fn deleting_the_key_removes_every_duplicate() {
    let (_dir, env) = open_env();

    let mut txn = env.begin_rw_txn().unwrap();
    let db = txn.open_db(Some("d"), DbFlags::DUP_SORT | DbFlags::CREATE).unwrap();
    for i in 0..150u32 {
        txn.put(db, b"k", &value16(i), WriteFlags::empty()).unwrap();
    }
    txn.put(db, b"other", b"v", WriteFlags::empty()).unwrap();
    txn.del(db, b"k", None).unwrap();
    txn.commit().unwrap();

    let txn = env.begin_ro_txn().unwrap();
    assert_eq!(txn.get(db, b"k").unwrap(), None);
    assert_eq!(txn.db_stat(db).unwrap().entries, 1);
    drop(txn);

    assert_eq!(env.verify().unwrap().unreferenced, 0);
}

#[test]
fn get_both_and_range_position_on_values() {
    let (_dir, env) = open_env();

    let mut txn = env.begin_rw_txn().unwrap();
    let db = txn.open_db(Some("d"), DbFlags::DUP_SORT | DbFlags::CREATE).unwrap();
    for value in [b"aa".as_slice(), b"cc", b"ee"] {
        txn.put(db, b"k", value, WriteFlags::empty()).unwrap();
    }
    txn.commit().unwrap();

    let txn = env.begin_ro_txn().unwrap();
    let mut cursor = txn.cursor(db).unwrap();
    assert!(cursor.get_both(b"k", b"cc").unwrap().is_some());
    assert!(cursor.get_both(b"k", b"bb").unwrap().is_none());
    let (_, value) = cursor.get_both_range(b"k", b"bb").unwrap().unwrap();
    assert_eq!(value, b"cc");
    assert!(cursor.get_both_range(b"k", b"ff").unwrap().is_none());
}

#[test]
fn next_nodup_skips_to_following_keys() {
    let (_dir, env) = open_env();

    let mut txn = env.begin_rw_txn().unwrap();
    let db = txn.open_db(Some("d"), DbFlags::DUP_SORT | DbFlags::CREATE).unwrap();
    for key in [b"k1".as_slice(), b"k2", b"k3"] {
        for value in [b"a".as_slice(), b"b"] {
            txn.put(db, key, value, WriteFlags::empty()).unwrap();
        }
    }
    txn.commit().unwrap();

    let txn = env.begin_ro_txn().unwrap();
    let mut cursor = txn.cursor(db).unwrap();
    let (key, value) = cursor.first().unwrap().unwrap();
    assert_eq!((key, value), (&b"k1"[..], &b"a"[..]));
    let (key, value) = cursor.next_nodup().unwrap().unwrap();
    assert_eq!((key, value), (&b"k2"[..], &b"a"[..]));
    let (key, value) = cursor.next_nodup().unwrap().unwrap();
    assert_eq!((key, value), (&b"k3"[..], &b"a"[..]));
    assert!(cursor.next_nodup().unwrap().is_none());

    // And back: the previous key's last duplicate.
    let (key, value) = cursor.prev_nodup().unwrap().unwrap();
    assert_eq!((key, value), (&b"k2"[..], &b"b"[..]));
}

#[test]
fn dup_fixed_put_multiple_and_get_multiple() {
    let (_dir, env) = open_env();

    let mut txn = env.begin_rw_txn().unwrap();
    let db = txn
        .open_db(
            Some("fixed"),
            DbFlags::DUP_SORT | DbFlags::DUP_FIXED | DbFlags::CREATE,
        )
        .unwrap();

    let mut packed = Vec::new();
    for i in 0..64u64 {
        packed.extend_from_slice(&i.to_be_bytes());
    }
    {
        let mut cursor = txn.cursor_mut(db).unwrap();
        let stored = cursor.put_multiple(b"k", &packed, 8).unwrap();
        assert_eq!(stored, 64);
    }
    txn.commit().unwrap();

    let txn = env.begin_ro_txn().unwrap();
    assert_eq!(txn.db_stat(db).unwrap().entries, 64);

    let mut cursor = txn.cursor(db).unwrap();
    cursor.set(b"k").unwrap().unwrap();
    let (_, run) = cursor.get_multiple().unwrap().unwrap();
    assert_eq!(run.len() % 8, 0);
    assert!(!run.is_empty());
    // The first packed item is the smallest value.
    assert_eq!(&run[..8], &0u64.to_be_bytes());

    let mut total = run.len() / 8;
    while let Some((_, run)) = cursor.next_multiple().unwrap() {
        total += run.len() / 8;
    }
    assert_eq!(total, 64);
}

#[test]
fn dup_fixed_rejects_mismatched_sizes() {
    let (_dir, env) = open_env();

    let mut txn = env.begin_rw_txn().unwrap();
    let db = txn
        .open_db(
            Some("fixed"),
            DbFlags::DUP_SORT | DbFlags::DUP_FIXED | DbFlags::CREATE,
        )
        .unwrap();
    txn.put(db, b"k", b"12345678", WriteFlags::empty()).unwrap();
    txn.put(db, b"k", b"23456789", WriteFlags::empty()).unwrap();
    assert!(matches!(
        txn.put(db, b"k", b"short", WriteFlags::empty()),
        Err(Error::BadValSize)
    ));
    txn.commit().unwrap();
}

#[test]
fn reverse_dup_orders_values_backwards() {
    let (_dir, env) = open_env();

    let mut txn = env.begin_rw_txn().unwrap();
    let db = txn
        .open_db(
            Some("rev"),
            DbFlags::DUP_SORT | DbFlags::REVERSE_DUP | DbFlags::CREATE,
        )
        .unwrap();
    for value in [b"xa".as_slice(), b"yb", b"zc"] {
        txn.put(db, b"k", value, WriteFlags::empty()).unwrap();
    }
    txn.commit().unwrap();

    let txn = env.begin_ro_txn().unwrap();
    let mut cursor = txn.cursor(db).unwrap();
    // Reverse byte order compares from the last byte: "xa" < "yb" < "zc".
    let (_, first) = cursor.set(b"k").unwrap().unwrap();
    assert_eq!(first, b"xa");
    assert_eq!(cursor.next_dup().unwrap().unwrap().1, b"yb");
    assert_eq!(cursor.next_dup().unwrap().unwrap().1, b"zc");
}
