//! Free-page reclamation: space released by old snapshots is reused once
//! no reader can still observe them.

use lynxdb::{DbFlags, EnvOptions, WriteFlags};
use tempfile::TempDir;

#[test]
fn file_growth_is_bounded_by_reclamation() {
    let dir = TempDir::new().unwrap();
    let env = EnvOptions::new()
        .map_size(64 << 20)
        .open(dir.path())
        .unwrap();

    let value = vec![0xABu8; 512];

    let mut txn = env.begin_rw_txn().unwrap();
    let db = txn.open_db(None, DbFlags::empty()).unwrap();
    txn.commit().unwrap();

    // Ten batches of a thousand inserts.
    for batch in 0..10u32 {
        let mut txn = env.begin_rw_txn().unwrap();
        for i in 0..1000u32 {
            let key = format!("k{:04}", batch * 1000 + i);
            txn.put(db, key.as_bytes(), &value, WriteFlags::empty())
                .unwrap();
        }
        txn.commit().unwrap();
    }

    let peak = env.info().unwrap().last_pgno;

    // Ten batches of deletes in the same order.
    for batch in 0..10u32 {
        let mut txn = env.begin_rw_txn().unwrap();
        for i in 0..1000u32 {
            let key = format!("k{:04}", batch * 1000 + i);
            txn.del(db, key.as_bytes(), None).unwrap();
        }
        txn.commit().unwrap();
    }

    // Deleting churns copy-on-write pages, but reclamation must keep the
    // file from running away.
    let last = env.info().unwrap().last_pgno;
    assert!(
        last <= peak * 2,
        "file grew from {peak} to {last} pages; reclamation failed"
    );

    let txn = env.begin_ro_txn().unwrap();
    assert_eq!(txn.db_stat(db).unwrap().entries, 0);
    drop(txn);

    assert_eq!(env.verify().unwrap().unreferenced, 0);
}

#[test]
fn rewriting_one_key_reuses_pages() {
    let dir = TempDir::new().unwrap();
    let env = EnvOptions::new()
        .map_size(4 << 20)
        .open(dir.path())
        .unwrap();

    let value = vec![1u8; 256];
    // Far more commits than the map could hold without reuse.
    for i in 0..2000u32 {
        let mut txn = env.begin_rw_txn().unwrap();
        let db = txn.open_db(None, DbFlags::empty()).unwrap();
        txn.put(db, b"hot", &value, WriteFlags::empty()).unwrap();
        txn.put(db, &i.to_be_bytes(), b"x", WriteFlags::empty())
            .unwrap();
        txn.del(db, &i.to_be_bytes(), None).unwrap();
        txn.commit().unwrap();
    }

    let info = env.info().unwrap();
    assert!(
        info.last_pgno < 200,
        "expected a small file, got {} pages",
        info.last_pgno
    );
}

#[test]
fn pinned_snapshot_delays_reuse_until_released() {
    let dir = TempDir::new().unwrap();
    let env = EnvOptions::new()
        .map_size(16 << 20)
        .open(dir.path())
        .unwrap();

    let mut txn = env.begin_rw_txn().unwrap();
    let db = txn.open_db(None, DbFlags::empty()).unwrap();
    for i in 0..500u32 {
        txn.put(db, &i.to_be_bytes(), &[9u8; 200], WriteFlags::empty())
            .unwrap();
    }
    txn.commit().unwrap();

    // Pin the snapshot, then delete everything under it.
    let pinned = env.begin_ro_txn().unwrap();

    let mut txn = env.begin_rw_txn().unwrap();
    for i in 0..500u32 {
        txn.del(db, &i.to_be_bytes(), None).unwrap();
    }
    txn.commit().unwrap();

    // The pinned snapshot still reads every key.
    for i in (0..500u32).step_by(50) {
        assert!(pinned.get(db, &i.to_be_bytes()).unwrap().is_some());
    }
    drop(pinned);

    // With the snapshot released, the next commits recycle its pages.
    let before = env.info().unwrap().last_pgno;
    for round in 0..20u32 {
        let mut txn = env.begin_rw_txn().unwrap();
        txn.put(db, &round.to_be_bytes(), &[7u8; 200], WriteFlags::empty())
            .unwrap();
        txn.commit().unwrap();
    }
    let after = env.info().unwrap().last_pgno;
    assert!(
        after <= before + 4,
        "pages were not recycled: {before} -> {after}"
    );
}
