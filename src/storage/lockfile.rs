//! # Lock File and Reader Table
//!
//! The lock file is the shared-memory substrate for everything readers and
//! writers need to coordinate without touching the data file: a 64-byte
//! header followed by one cache-line-sized slot per potential reader.
//!
//! ```text
//! Offset  Size  Field
//! ------  ----  --------------------------------------------
//! 0       8     magic
//! 8       4     format tag
//! 12      4     high-water reader count       (atomic)
//! 16      8     latest committed txnid        (atomic)
//! 24      40    reserved
//! 64      64*N  reader slots
//! ```
//!
//! Each slot: owning pid (4), pad (4), owning tid (8), observed txnid (8),
//! padding to 64 bytes so two readers never share a cache line. A slot is
//! free when its pid is zero and idle when its txnid is [`TXNID_IDLE`].
//! After the claim, a slot is written only by its owning thread; everyone
//! else reads it with relaxed loads (a stale value only delays
//! reclamation, spec-permitted).
//!
//! ## Locks
//!
//! Three kinds of `fcntl` record locks live on this file, at ranges that
//! cannot collide with each other:
//!
//! - **liveness**: each process holds a shared lock at `offset = pid` for
//!   the life of its environment handle. `reader_check` probes foreign
//!   pids with a non-blocking exclusive lock; success proves the owner is
//!   dead and its slots are reclaimed.
//! - **writer / reader mutexes**: exclusive locks at reserved high
//!   offsets. POSIX record locks do not exclude threads of the owning
//!   process, so each is paired with an in-process `parking_lot` mutex
//!   held for the same span. The kernel drops a dead owner's record locks,
//!   which is what makes writer-death recoverable without a robust-mutex
//!   protocol.
//! - **init**: an exclusive probe at another reserved offset decides which
//!   process formats a fresh table; everyone holds it shared afterwards so
//!   the table cannot be re-formatted while in use.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::io::AsRawFd;
use std::path::Path;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use memmap2::MmapMut;
use parking_lot::{Mutex, MutexGuard};

use crate::error::{Error, Result};

const LOCK_MAGIC: u64 = 0x4C59_4E58_4C4F_434B;
const LOCK_FORMAT: u32 = 1;

const HEADER_SIZE: usize = 64;
const SLOT_SIZE: usize = 64;

const OFF_MAGIC: usize = 0;
const OFF_FORMAT: usize = 8;
const OFF_NUM_READERS: usize = 12;
const OFF_LAST_TXNID: usize = 16;

const SLOT_OFF_PID: usize = 0;
const SLOT_OFF_TID: usize = 8;
const SLOT_OFF_TXNID: usize = 16;

/// Slot txnid stamp meaning "registered but not in a transaction".
pub const TXNID_IDLE: u64 = u64::MAX;

/// Byte ranges for the control locks, far above any plausible pid.
const LOCK_RANGE_INIT: i64 = 1 << 62;
const LOCK_RANGE_WRITER: i64 = (1 << 62) + 1;
const LOCK_RANGE_READER: i64 = (1 << 62) + 2;

/// One row of `reader_list`.
#[derive(Debug, Clone, Copy)]
pub struct ReaderSlotInfo {
    pub slot: usize,
    pub pid: u32,
    pub tid: u64,
    pub txnid: u64,
}

pub(crate) struct LockFile {
    file: File,
    map: MmapMut,
    max_readers: usize,
    pid: u32,
    /// In-process halves of the cross-process mutexes.
    writer_mutex: Mutex<()>,
    reader_mutex: Mutex<()>,
}

/// Held for the duration of a write transaction.
pub(crate) struct WriterLock<'a> {
    lockfile: &'a LockFile,
    _guard: MutexGuard<'a, ()>,
}

impl Drop for WriterLock<'_> {
    fn drop(&mut self) {
        let _ = self
            .lockfile
            .record_lock(LOCK_RANGE_WRITER, 1, libc::F_UNLCK, true);
    }
}

impl LockFile {
    /// Open the lock file, formatting the reader table when this process
    /// wins the exclusive probe.
    pub fn open(path: &Path, max_readers: usize) -> Result<LockFile> {
        debug_assert!(max_readers > 0);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        let lockfile_len = (HEADER_SIZE + max_readers * SLOT_SIZE) as u64;
        let this = {
            // Exclusive probe decides the initializer.
            let exclusive = record_lock_fd(
                file.as_raw_fd(),
                LOCK_RANGE_INIT,
                1,
                libc::F_WRLCK,
                false,
            )?;
            if exclusive {
                file.set_len(lockfile_len)?;
            } else {
                // Wait for the initializer, then size the table from the
                // file: the creator's max_readers wins.
                record_lock_fd(file.as_raw_fd(), LOCK_RANGE_INIT, 1, libc::F_RDLCK, true)?;
            }
            let len = file.metadata()?.len() as usize;
            if len < HEADER_SIZE + SLOT_SIZE {
                return Err(Error::Invalid);
            }
            let max_readers = (len - HEADER_SIZE) / SLOT_SIZE;

            // SAFETY: shared mutable map over a file all parties access
            // only through atomics (slots, header counters) or under the
            // reader mutex (slot claims); plain fields are written once by
            // the initializer while it holds the exclusive init lock.
            let map = unsafe { MmapMut::map_mut(&file)? };

            let mut this = LockFile {
                file,
                map,
                max_readers,
                pid: std::process::id(),
                writer_mutex: Mutex::new(()),
                reader_mutex: Mutex::new(()),
            };

            if exclusive {
                this.format();
                // Downgrade to shared: the table stays valid while anyone
                // holds the init range.
                this.record_lock(LOCK_RANGE_INIT, 1, libc::F_RDLCK, true)?;
            } else {
                this.check_format()?;
            }
            this
        };

        // Liveness lock at our own pid offset, held until close.
        this.record_lock(this.pid as i64, 1, libc::F_RDLCK, true)?;
        Ok(this)
    }

    fn format(&mut self) {
        self.map[..HEADER_SIZE].fill(0);
        let slots_end = HEADER_SIZE + self.max_readers * SLOT_SIZE;
        self.map[HEADER_SIZE..slots_end].fill(0);
        self.map[OFF_MAGIC..OFF_MAGIC + 8].copy_from_slice(&LOCK_MAGIC.to_le_bytes());
        self.map[OFF_FORMAT..OFF_FORMAT + 4].copy_from_slice(&LOCK_FORMAT.to_le_bytes());
    }

    fn check_format(&self) -> Result<()> {
        let magic = u64::from_le_bytes(self.map[OFF_MAGIC..OFF_MAGIC + 8].try_into().unwrap());
        if magic != LOCK_MAGIC {
            return Err(Error::Invalid);
        }
        let format =
            u32::from_le_bytes(self.map[OFF_FORMAT..OFF_FORMAT + 4].try_into().unwrap());
        if format != LOCK_FORMAT {
            return Err(Error::VersionMismatch);
        }
        Ok(())
    }

    pub fn max_readers(&self) -> usize {
        self.max_readers
    }

    fn atomic_u32(&self, offset: usize) -> &AtomicU32 {
        debug_assert!(offset % 4 == 0 && offset + 4 <= self.map.len());
        // SAFETY: the map outlives the returned reference, the offset is
        // 4-aligned (the map itself is page-aligned), and every accessor of
        // this word goes through the same atomic view.
        unsafe { &*(self.map.as_ptr().add(offset) as *const AtomicU32) }
    }

    fn atomic_u64(&self, offset: usize) -> &AtomicU64 {
        debug_assert!(offset % 8 == 0 && offset + 8 <= self.map.len());
        // SAFETY: as above, with 8-byte alignment.
        unsafe { &*(self.map.as_ptr().add(offset) as *const AtomicU64) }
    }

    fn slot_base(&self, slot: usize) -> usize {
        HEADER_SIZE + slot * SLOT_SIZE
    }

    fn slot_pid(&self, slot: usize) -> &AtomicU32 {
        self.atomic_u32(self.slot_base(slot) + SLOT_OFF_PID)
    }

    fn slot_tid(&self, slot: usize) -> &AtomicU64 {
        self.atomic_u64(self.slot_base(slot) + SLOT_OFF_TID)
    }

    fn slot_txnid(&self, slot: usize) -> &AtomicU64 {
        self.atomic_u64(self.slot_base(slot) + SLOT_OFF_TXNID)
    }

    /// Latest committed txnid as published by writers.
    pub fn last_txnid(&self) -> u64 {
        self.atomic_u64(OFF_LAST_TXNID).load(Ordering::Acquire)
    }

    /// Advance the published txnid (monotonic; replay after recovery uses
    /// the same path).
    pub fn publish_txnid(&self, txnid: u64) {
        self.atomic_u64(OFF_LAST_TXNID)
            .fetch_max(txnid, Ordering::Release);
    }

    pub fn num_readers(&self) -> usize {
        self.atomic_u32(OFF_NUM_READERS).load(Ordering::Relaxed) as usize
    }

    /// Claim a free slot for `(pid, tid)`.
    pub fn claim_slot(&self, tid: u64) -> Result<usize> {
        let _in_process = self.reader_mutex.lock();
        self.record_lock(LOCK_RANGE_READER, 1, libc::F_WRLCK, true)?;
        let result = self.claim_slot_locked(tid);
        let _ = self.record_lock(LOCK_RANGE_READER, 1, libc::F_UNLCK, true);
        result
    }

    fn claim_slot_locked(&self, tid: u64) -> Result<usize> {
        for slot in 0..self.max_readers {
            if self.slot_pid(slot).load(Ordering::Relaxed) == 0 {
                self.slot_txnid(slot).store(TXNID_IDLE, Ordering::Relaxed);
                self.slot_tid(slot).store(tid, Ordering::Relaxed);
                self.slot_pid(slot).store(self.pid, Ordering::Release);
                self.atomic_u32(OFF_NUM_READERS)
                    .fetch_max(slot as u32 + 1, Ordering::Relaxed);
                return Ok(slot);
            }
        }
        Err(Error::ReadersFull)
    }

    /// Stamp the snapshot a reader is about to observe.
    pub fn stamp_slot(&self, slot: usize, txnid: u64) {
        self.slot_txnid(slot).store(txnid, Ordering::Release);
    }

    /// Return a slot to "registered, idle".
    pub fn idle_slot(&self, slot: usize) {
        self.slot_txnid(slot).store(TXNID_IDLE, Ordering::Release);
    }

    /// Release a slot entirely (thread exit or `NO_TLS` transaction end).
    pub fn release_slot(&self, slot: usize) {
        self.slot_txnid(slot).store(TXNID_IDLE, Ordering::Relaxed);
        self.slot_pid(slot).store(0, Ordering::Release);
    }

    pub fn slot_stamp(&self, slot: usize) -> u64 {
        self.slot_txnid(slot).load(Ordering::Acquire)
    }

    /// Oldest live snapshot: the minimum stamped txnid over all registered
    /// slots, floored by `newest` (the txnid just before the current write
    /// transaction). Takes no lock; a racing stamp can only make the
    /// result staler, which delays reclamation but never un-pins a page.
    pub fn oldest_snapshot(&self, newest: u64) -> u64 {
        let mut oldest = newest;
        for slot in 0..self.num_readers().min(self.max_readers) {
            if self.slot_pid(slot).load(Ordering::Acquire) != 0 {
                let stamp = self.slot_txnid(slot).load(Ordering::Acquire);
                if stamp < oldest {
                    oldest = stamp;
                }
            }
        }
        oldest
    }

    pub fn reader_list(&self) -> Vec<ReaderSlotInfo> {
        let mut out = Vec::new();
        for slot in 0..self.num_readers().min(self.max_readers) {
            let pid = self.slot_pid(slot).load(Ordering::Acquire);
            if pid != 0 {
                out.push(ReaderSlotInfo {
                    slot,
                    pid,
                    tid: self.slot_tid(slot).load(Ordering::Relaxed),
                    txnid: self.slot_txnid(slot).load(Ordering::Relaxed),
                });
            }
        }
        out
    }

    /// Clear slots owned by dead processes; returns how many slots were
    /// reclaimed. A second call right after the first finds nothing.
    pub fn reader_check(&self) -> Result<usize> {
        let used = self.num_readers().min(self.max_readers);
        let mut dead_pids: Vec<u32> = Vec::new();
        for slot in 0..used {
            let pid = self.slot_pid(slot).load(Ordering::Acquire);
            if pid == 0 || pid == self.pid || dead_pids.contains(&pid) {
                continue;
            }
            // A live owner holds a shared liveness lock at its pid offset,
            // so winning an exclusive probe there proves it is gone.
            if self.record_lock(pid as i64, 1, libc::F_WRLCK, false)? {
                let _ = self.record_lock(pid as i64, 1, libc::F_UNLCK, true);
                dead_pids.push(pid);
            }
        }
        if dead_pids.is_empty() {
            return Ok(0);
        }

        let _in_process = self.reader_mutex.lock();
        self.record_lock(LOCK_RANGE_READER, 1, libc::F_WRLCK, true)?;
        let mut cleared = 0;
        for slot in 0..used {
            let pid = self.slot_pid(slot).load(Ordering::Acquire);
            if pid != 0 && dead_pids.contains(&pid) {
                self.release_slot(slot);
                cleared += 1;
            }
        }
        let _ = self.record_lock(LOCK_RANGE_READER, 1, libc::F_UNLCK, true);
        tracing::debug!(cleared, "reclaimed reader slots from dead processes");
        Ok(cleared)
    }

    /// Acquire the single-writer lock (blocking). Returns a guard whose
    /// drop releases the cross-process half; the in-process half releases
    /// with the embedded `MutexGuard`.
    pub fn lock_writer(&self) -> Result<WriterLock<'_>> {
        let guard = self.writer_mutex.lock();
        self.record_lock(LOCK_RANGE_WRITER, 1, libc::F_WRLCK, true)?;
        Ok(WriterLock {
            lockfile: self,
            _guard: guard,
        })
    }

    fn record_lock(&self, start: i64, len: i64, kind: libc::c_int, wait: bool) -> Result<bool> {
        record_lock_fd(self.file.as_raw_fd(), start, len, kind, wait).map_err(Error::from)
    }
}

fn record_lock_fd(
    fd: libc::c_int,
    start: i64,
    len: i64,
    kind: libc::c_int,
    wait: bool,
) -> io::Result<bool> {
    let mut lock: libc::flock = unsafe { std::mem::zeroed() };
    lock.l_type = kind as libc::c_short;
    lock.l_whence = libc::SEEK_SET as libc::c_short;
    lock.l_start = start;
    lock.l_len = len;
    let cmd = if wait { libc::F_SETLKW } else { libc::F_SETLK };
    // SAFETY: plain fcntl locking call on an owned descriptor with an
    // initialized flock struct.
    let rc = unsafe { libc::fcntl(fd, cmd, &lock) };
    if rc == 0 {
        return Ok(true);
    }
    let err = io::Error::last_os_error();
    match err.raw_os_error() {
        Some(libc::EACCES) | Some(libc::EAGAIN) if !wait => Ok(false),
        _ => Err(err),
    }
}
