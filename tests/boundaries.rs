//! Size and capacity edges: key bounds, the inline/overflow threshold,
//! map exhaustion, dirty-list spilling.

use lynxdb::{DbFlags, Env, EnvOptions, Error, WriteFlags, MAX_KEY_SIZE};
use tempfile::TempDir;

fn open_env(map_size: usize) -> (TempDir, Env) {
    let dir = TempDir::new().unwrap();
    let env = EnvOptions::new().map_size(map_size).open(dir.path()).unwrap();
    (dir, env)
}

#[test]
fn key_at_the_size_bound_works_one_over_fails() {
    let (_dir, env) = open_env(10 << 20);

    let mut txn = env.begin_rw_txn().unwrap();
    let db = txn.open_db(None, DbFlags::empty()).unwrap();

    let max_key = vec![b'k'; MAX_KEY_SIZE];
    txn.put(db, &max_key, b"v", WriteFlags::empty()).unwrap();
    assert_eq!(txn.get(db, &max_key).unwrap(), Some(&b"v"[..]));

    let too_long = vec![b'k'; MAX_KEY_SIZE + 1];
    assert!(matches!(
        txn.put(db, &too_long, b"v", WriteFlags::empty()),
        Err(Error::BadValSize)
    ));
    assert!(matches!(
        txn.put(db, b"", b"v", WriteFlags::empty()),
        Err(Error::BadValSize)
    ));
    txn.commit().unwrap();
}

#[test]
fn value_crosses_from_inline_to_overflow() {
    let (_dir, env) = open_env(10 << 20);

    let mut txn = env.begin_rw_txn().unwrap();
    let db = txn.open_db(None, DbFlags::empty()).unwrap();

    // With a one-byte key the largest inline value is 2028 bytes; one
    // byte more moves the value to an overflow run.
    txn.put(db, b"a", &vec![1u8; 2028], WriteFlags::empty())
        .unwrap();
    assert_eq!(txn.db_stat(db).unwrap().overflow_pages, 0);

    txn.put(db, b"b", &vec![2u8; 2030], WriteFlags::empty())
        .unwrap();
    assert_eq!(txn.db_stat(db).unwrap().overflow_pages, 1);
    txn.commit().unwrap();

    let txn = env.begin_ro_txn().unwrap();
    assert_eq!(txn.get(db, b"a").unwrap().unwrap().len(), 2028);
    assert_eq!(txn.get(db, b"b").unwrap().unwrap().len(), 2030);
}

#[test]
fn large_values_span_multiple_overflow_pages() {
    let (_dir, env) = open_env(10 << 20);

    let mut txn = env.begin_rw_txn().unwrap();
    let db = txn.open_db(None, DbFlags::empty()).unwrap();
    let value: Vec<u8> = (0..100_000u32).map(|i| i as u8).collect();
    txn.put(db, b"big", &value, WriteFlags::empty()).unwrap();
    txn.commit().unwrap();

    let txn = env.begin_ro_txn().unwrap();
    assert_eq!(txn.get(db, b"big").unwrap(), Some(value.as_slice()));
    let stat = txn.db_stat(db).unwrap();
    assert_eq!(stat.overflow_pages, 100_016u64.div_ceil(4096));
    drop(txn);

    // Overwriting frees the old run.
    let mut txn = env.begin_rw_txn().unwrap();
    txn.put(db, b"big", b"tiny", WriteFlags::empty()).unwrap();
    txn.commit().unwrap();
    let txn = env.begin_ro_txn().unwrap();
    assert_eq!(txn.db_stat(db).unwrap().overflow_pages, 0);
    drop(txn);
    assert_eq!(env.verify().unwrap().unreferenced, 0);
}

#[test]
fn allocation_past_the_map_fails_with_map_full() {
    // 64 KiB map: sixteen pages, two of them meta.
    let (_dir, env) = open_env(64 << 10);

    let mut txn = env.begin_rw_txn().unwrap();
    let db = txn.open_db(None, DbFlags::empty()).unwrap();
    txn.put(db, b"seed", b"v", WriteFlags::empty()).unwrap();
    txn.commit().unwrap();

    let mut filled = 0u32;
    loop {
        let mut txn = env.begin_rw_txn().unwrap();
        let key = format!("fill{filled:04}");
        match txn.put(db, key.as_bytes(), &vec![0u8; 3000], WriteFlags::empty()) {
            Ok(()) => match txn.commit() {
                Ok(()) => {
                    filled += 1;
                    assert!(filled < 100, "map never filled");
                }
                // Exhaustion may also surface while the commit writes the
                // free-page ledger.
                Err(Error::MapFull) => break,
                Err(e) => panic!("unexpected commit error: {e}"),
            },
            Err(Error::MapFull) => {
                txn.abort();
                break;
            }
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert!(filled > 0, "nothing fit before the map filled");

    // Everything committed before the failure is intact.
    let txn = env.begin_ro_txn().unwrap();
    assert_eq!(txn.get(db, b"seed").unwrap(), Some(&b"v"[..]));
    assert_eq!(txn.db_stat(db).unwrap().entries as u32, filled + 1);
}

#[test]
fn failed_operation_poisons_the_transaction() {
    let (_dir, env) = open_env(64 << 10);

    let mut txn = env.begin_rw_txn().unwrap();
    let db = txn.open_db(None, DbFlags::empty()).unwrap();
    let mut hit_full = false;
    for i in 0..100u32 {
        let key = format!("fill{i:04}");
        if txn
            .put(db, key.as_bytes(), &vec![0u8; 3000], WriteFlags::empty())
            .is_err()
        {
            hit_full = true;
            break;
        }
    }
    assert!(hit_full);
    // After a structural failure only abort is acceptable.
    assert!(matches!(
        txn.put(db, b"more", b"v", WriteFlags::empty()),
        Err(Error::BadTxn)
    ));
    assert!(matches!(txn.commit(), Err(Error::BadTxn)));
}

#[test]
fn dirty_list_pressure_spills_and_commits_correctly() {
    let dir = TempDir::new().unwrap();
    let env = EnvOptions::new()
        .map_size(32 << 20)
        .max_dirty_pages(64)
        .open(dir.path())
        .unwrap();

    let mut txn = env.begin_rw_txn().unwrap();
    let db = txn.open_db(None, DbFlags::empty()).unwrap();
    for i in 0..2000u32 {
        let key = format!("key{i:06}");
        txn.put(db, key.as_bytes(), &vec![5u8; 512], WriteFlags::empty())
            .unwrap();
    }
    txn.commit().unwrap();

    let txn = env.begin_ro_txn().unwrap();
    assert_eq!(txn.db_stat(db).unwrap().entries, 2000);
    for i in (0..2000u32).step_by(97) {
        let key = format!("key{i:06}");
        assert_eq!(txn.get(db, key.as_bytes()).unwrap(), Some(&[5u8; 512][..]));
    }
    drop(txn);
    assert_eq!(env.verify().unwrap().unreferenced, 0);
}

#[test]
fn map_size_request_below_existing_is_ignored() {
    let dir = TempDir::new().unwrap();
    {
        let env = EnvOptions::new()
            .map_size(8 << 20)
            .open(dir.path())
            .unwrap();
        let mut txn = env.begin_rw_txn().unwrap();
        let db = txn.open_db(None, DbFlags::empty()).unwrap();
        txn.put(db, b"k", b"v", WriteFlags::empty()).unwrap();
        txn.commit().unwrap();
    }
    let env = EnvOptions::new()
        .map_size(1 << 20)
        .open(dir.path())
        .unwrap();
    assert_eq!(env.info().unwrap().map_size, 8 << 20);
}
