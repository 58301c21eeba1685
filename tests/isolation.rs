//! Snapshot isolation between concurrent readers and the writer.

use lynxdb::{DbFlags, Env, EnvFlags, EnvOptions, WriteFlags};
use tempfile::TempDir;

fn open_env() -> (TempDir, Env) {
    let dir = TempDir::new().unwrap();
    // NO_TLS lets one test thread hold several read transactions.
    let env = EnvOptions::new()
        .map_size(10 << 20)
        .flags(EnvFlags::NO_TLS)
        .open(dir.path())
        .unwrap();
    (dir, env)
}

#[test]
fn reader_keeps_its_snapshot_across_a_commit() {
    let (_dir, env) = open_env();

    let mut txn = env.begin_rw_txn().unwrap();
    let db = txn.open_db(None, DbFlags::empty()).unwrap();
    txn.commit().unwrap();

    let reader = env.begin_ro_txn().unwrap();
    assert_eq!(reader.get(db, b"x").unwrap(), None);

    let mut writer = env.begin_rw_txn().unwrap();
    writer.put(db, b"x", b"v1", WriteFlags::empty()).unwrap();
    writer.commit().unwrap();

    // The old snapshot still reads as before the commit.
    assert_eq!(reader.get(db, b"x").unwrap(), None);

    // A fresh snapshot observes the commit.
    let fresh = env.begin_ro_txn().unwrap();
    assert_eq!(fresh.get(db, b"x").unwrap(), Some(&b"v1"[..]));
}

#[test]
fn writes_are_invisible_until_commit_returns() {
    let (_dir, env) = open_env();

    let mut writer = env.begin_rw_txn().unwrap();
    let db = writer.open_db(None, DbFlags::empty()).unwrap();
    writer.put(db, b"k", b"v", WriteFlags::empty()).unwrap();

    let reader = env.begin_ro_txn().unwrap();
    assert_eq!(reader.get(db, b"k").unwrap(), None);
    drop(reader);

    writer.commit().unwrap();
    let reader = env.begin_ro_txn().unwrap();
    assert_eq!(reader.get(db, b"k").unwrap(), Some(&b"v"[..]));
}

#[test]
fn reset_and_renew_advance_the_snapshot() {
    let (_dir, env) = open_env();

    let mut txn = env.begin_rw_txn().unwrap();
    let db = txn.open_db(None, DbFlags::empty()).unwrap();
    txn.commit().unwrap();

    let mut reader = env.begin_ro_txn().unwrap();
    assert_eq!(reader.get(db, b"k").unwrap(), None);
    reader.reset();

    let mut writer = env.begin_rw_txn().unwrap();
    writer.put(db, b"k", b"v", WriteFlags::empty()).unwrap();
    writer.commit().unwrap();

    reader.renew().unwrap();
    assert_eq!(reader.get(db, b"k").unwrap(), Some(&b"v"[..]));
}

#[test]
fn reset_reader_rejects_reads_until_renewed() {
    let (_dir, env) = open_env();
    let mut reader = env.begin_ro_txn().unwrap();
    let db = reader.open_db(None, DbFlags::empty()).unwrap();
    reader.reset();
    assert!(reader.get(db, b"k").is_err());
    reader.renew().unwrap();
    assert_eq!(reader.get(db, b"k").unwrap(), None);
}

#[test]
fn txn_ids_are_strictly_monotonic() {
    use lynxdb::Transaction;

    let (_dir, env) = open_env();
    let mut last = 0;
    for i in 0..5u32 {
        let mut txn = env.begin_rw_txn().unwrap();
        let db = txn.open_db(None, DbFlags::empty()).unwrap();
        txn.put(db, &i.to_be_bytes(), b"v", WriteFlags::empty())
            .unwrap();
        let id = txn.id();
        assert!(id > last);
        last = id;
        txn.commit().unwrap();
    }
    assert_eq!(env.info().unwrap().last_txnid, last);
}

#[test]
fn readers_in_threads_do_not_block_the_writer() {
    let (_dir, env) = open_env();

    let mut txn = env.begin_rw_txn().unwrap();
    let db = txn.open_db(None, DbFlags::empty()).unwrap();
    txn.put(db, b"shared", b"0", WriteFlags::empty()).unwrap();
    txn.commit().unwrap();

    std::thread::scope(|scope| {
        for _ in 0..4 {
            scope.spawn(|| {
                for _ in 0..50 {
                    let txn = env.begin_ro_txn().unwrap();
                    let value = txn.get(db, b"shared").unwrap().unwrap();
                    assert!(!value.is_empty());
                }
            });
        }
        scope.spawn(|| {
            for i in 1..=20u32 {
                let mut txn = env.begin_rw_txn().unwrap();
                txn.put(
                    db,
                    b"shared",
                    i.to_string().as_bytes(),
                    WriteFlags::empty(),
                )
                .unwrap();
                txn.commit().unwrap();
            }
        });
    });

    let txn = env.begin_ro_txn().unwrap();
    assert_eq!(txn.get(db, b"shared").unwrap(), Some(&b"20"[..]));
}
