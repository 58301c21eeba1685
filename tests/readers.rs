//! Reader-table behavior across threads and processes: slot accounting,
//! stale-reader detection, capacity limits.

use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use lynxdb::{DbFlags, EnvFlags, EnvOptions, Error, WriteFlags};
use tempfile::TempDir;

#[test]
fn reader_list_reports_active_snapshots() {
    let dir = TempDir::new().unwrap();
    let env = EnvOptions::new().open(dir.path()).unwrap();

    assert!(env.reader_list().is_empty());
    let txn = env.begin_ro_txn().unwrap();
    let readers = env.reader_list();
    assert_eq!(readers.len(), 1);
    assert_eq!(readers[0].pid, std::process::id());
    assert_eq!(readers[0].txnid, 0);
    drop(txn);
}

#[test]
fn reader_table_capacity_is_enforced() {
    let dir = TempDir::new().unwrap();
    let env = EnvOptions::new()
        .max_readers(2)
        .flags(EnvFlags::NO_TLS)
        .open(dir.path())
        .unwrap();

    let _a = env.begin_ro_txn().unwrap();
    let _b = env.begin_ro_txn().unwrap();
    assert!(matches!(env.begin_ro_txn(), Err(Error::ReadersFull)));
    drop(_a);
    let _c = env.begin_ro_txn().unwrap();
}

#[test]
fn second_read_txn_on_one_thread_needs_no_tls() {
    let dir = TempDir::new().unwrap();
    let env = EnvOptions::new().open(dir.path()).unwrap();

    let _first = env.begin_ro_txn().unwrap();
    // The thread's slot is busy; a second transaction on it is a misuse.
    assert!(matches!(env.begin_ro_txn(), Err(Error::BadRslot)));
}

#[test]
fn reader_check_is_idempotent() {
    let dir = TempDir::new().unwrap();
    let env = EnvOptions::new().open(dir.path()).unwrap();
    let _txn = env.begin_ro_txn().unwrap();
    assert_eq!(env.reader_check().unwrap(), 0);
    assert_eq!(env.reader_check().unwrap(), 0);
}

/// Child half of the kill test: registers a reader and blocks until the
/// parent kills the process. Runs only when re-invoked by
/// `stale_reader_from_killed_process_is_reclaimed`.
#[test]
fn child_reader_holds_snapshot() {
    let Ok(path) = std::env::var("LYNX_CHILD_ENV") else {
        return;
    };
    let env = EnvOptions::new().open(&path).unwrap();
    let _txn = env.begin_ro_txn().unwrap();
    std::fs::write(format!("{path}/child-ready"), b"r").unwrap();
    std::thread::sleep(Duration::from_secs(600));
}

#[test]
fn stale_reader_from_killed_process_is_reclaimed() {
    let dir = TempDir::new().unwrap();
    let env = EnvOptions::new()
        .map_size(16 << 20)
        .open(dir.path())
        .unwrap();

    let mut txn = env.begin_rw_txn().unwrap();
    let db = txn.open_db(None, DbFlags::empty()).unwrap();
    for i in 0..200u32 {
        txn.put(db, &i.to_be_bytes(), &[3u8; 128], WriteFlags::empty())
            .unwrap();
    }
    txn.commit().unwrap();

    // Re-invoke this test binary to register a reader in another process,
    // then kill it without any cleanup.
    let exe = std::env::current_exe().unwrap();
    let mut child = Command::new(exe)
        .args(["child_reader_holds_snapshot", "--exact", "--nocapture"])
        .env("LYNX_CHILD_ENV", dir.path().to_str().unwrap())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .unwrap();

    let ready = dir.path().join("child-ready");
    let deadline = Instant::now() + Duration::from_secs(30);
    while !ready.exists() {
        assert!(Instant::now() < deadline, "child never registered");
        std::thread::sleep(Duration::from_millis(20));
    }
    assert!(env
        .reader_list()
        .iter()
        .any(|r| r.pid != std::process::id()));

    child.kill().unwrap();
    child.wait().unwrap();

    let dead = env.reader_check().unwrap();
    assert!(dead >= 1, "killed reader was not detected");
    assert_eq!(env.reader_check().unwrap(), 0);
    assert!(env
        .reader_list()
        .iter()
        .all(|r| r.pid == std::process::id()));

    // With the stale pin gone, commits reclaim its pages again.
    let before = env.info().unwrap().last_pgno;
    for round in 0..10u32 {
        let mut txn = env.begin_rw_txn().unwrap();
        txn.put(db, &round.to_be_bytes(), &[4u8; 128], WriteFlags::empty())
            .unwrap();
        txn.commit().unwrap();
    }
    let after = env.info().unwrap().last_pgno;
    assert!(after <= before + 4, "pages still pinned: {before} -> {after}");
}

#[test]
fn two_processes_share_one_environment() {
    // Writer in this process, verification read in a child via the CLI
    // path is covered elsewhere; here a second process opens the same
    // environment and reads committed data.
    let dir = TempDir::new().unwrap();
    {
        let env = EnvOptions::new().open(dir.path()).unwrap();
        let mut txn = env.begin_rw_txn().unwrap();
        let db = txn.open_db(None, DbFlags::empty()).unwrap();
        txn.put(db, b"shared", b"hello", WriteFlags::empty())
            .unwrap();
        txn.commit().unwrap();
    }

    let exe = std::env::current_exe().unwrap();
    let status = Command::new(exe)
        .args(["child_reads_committed_value", "--exact", "--nocapture"])
        .env("LYNX_CHILD_READ_ENV", dir.path().to_str().unwrap())
        .status()
        .unwrap();
    assert!(status.success());
}

/// Child half of `two_processes_share_one_environment`.
#[test]
fn child_reads_committed_value() {
    let Ok(path) = std::env::var("LYNX_CHILD_READ_ENV") else {
        return;
    };
    let env = EnvOptions::new().open(&path).unwrap();
    let mut txn = env.begin_ro_txn().unwrap();
    let db = txn.open_db(None, DbFlags::empty()).unwrap();
    assert_eq!(txn.get(db, b"shared").unwrap(), Some(&b"hello"[..]));
}
