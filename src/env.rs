//! # Environment
//!
//! The [`Env`] owns everything a database path maps to: the data file and
//! its shared read-only map, the lock file with the reader table, the
//! database-handle registry, and the sticky failure flag. Transactions
//! borrow the environment, so it outlives every snapshot taken from it.
//!
//! ## Open sequence
//!
//! 1. Open the lock file and probe for exclusivity; the winner formats
//!    the reader table, everyone else validates it. Each process then
//!    holds its liveness record lock for the life of the handle.
//! 2. Open the data file, writing the two initial meta pages when the
//!    file is fresh; read both metas, validate magic and version, and
//!    pick the one with the larger transaction id (the older one under
//!    `PREV_SNAPSHOT`).
//! 3. Map the file read-only and shared at the full map size, and advise
//!    the kernel per the readahead flag.
//! 4. Replay the picked transaction id into the reader-table header so a
//!    table formatted after a crash agrees with the data file.
//!
//! A process-local registry refuses to open the same data file twice in
//! one process: reader-slot bookkeeping is keyed by (pid, tid), and two
//! environments over one path would corrupt each other's view of it.
//!
//! ## Fatality
//!
//! A failed meta write (or any failure where the on-disk state is
//! unknowable) sets the panic flag; every subsequent call returns
//! [`Error::Panic`] until the environment is reopened, which recovers the
//! last fully committed snapshot.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::OnceLock;

use hashbrown::{HashMap, HashSet};
use parking_lot::{Mutex, RwLock};

use crate::btree::ops;
use crate::compare::Comparator;
use crate::db::{Dbi, DbiRegistry, EnvInfo, Stat};
use crate::error::{Error, Result};
use crate::flags::{DbFlags, EnvFlags};
use crate::storage::{
    DataFile, LockFile, Meta, ReaderSlotInfo, CORE_DBS, MAIN_DBI, META_SIZE, NUM_META_PAGES,
    PAGE_HDR_SIZE, PAGE_SIZE, TXNID_IDLE,
};
use crate::txn::{tree_ref, RoTxn, RwTxn, Transaction, TreeRef, WriterGuard};

const DEFAULT_MAP_SIZE: usize = 1 << 20;
const DEFAULT_MAX_READERS: usize = 126;
const DEFAULT_MAX_DBS: usize = 8;
const DEFAULT_MAX_DIRTY_PAGES: usize = 1 << 16;

const DATA_FILE_NAME: &str = "data.lynx";
const LOCK_FILE_NAME: &str = "lock.lynx";
const LOCK_SUFFIX: &str = "-lock";

/// Pages copied per batch by [`Env::copy_to`].
const COPY_BATCH_PAGES: u64 = 1024;

fn open_paths() -> &'static Mutex<HashSet<PathBuf>> {
    static OPEN: OnceLock<Mutex<HashSet<PathBuf>>> = OnceLock::new();
    OPEN.get_or_init(|| Mutex::new(HashSet::new()))
}

/// Builder for opening an [`Env`].
#[derive(Debug, Clone)]
pub struct EnvOptions {
    map_size: usize,
    max_readers: usize,
    max_dbs: usize,
    max_dirty_pages: usize,
    flags: EnvFlags,
}

impl Default for EnvOptions {
    fn default() -> Self {
        Self::new()
    }
}

impl EnvOptions {
    pub fn new() -> EnvOptions {
        EnvOptions {
            map_size: DEFAULT_MAP_SIZE,
            max_readers: DEFAULT_MAX_READERS,
            max_dbs: DEFAULT_MAX_DBS,
            max_dirty_pages: DEFAULT_MAX_DIRTY_PAGES,
            flags: EnvFlags::empty(),
        }
    }

    /// Size of the data map in bytes; rounded up to a page multiple.
    /// This is the hard ceiling on database size.
    pub fn map_size(mut self, bytes: usize) -> EnvOptions {
        self.map_size = bytes;
        self
    }

    /// Capacity of the reader table (only honored by the process that
    /// creates the lock file).
    pub fn max_readers(mut self, readers: usize) -> EnvOptions {
        self.max_readers = readers;
        self
    }

    /// Number of named databases that may be opened.
    pub fn max_dbs(mut self, dbs: usize) -> EnvOptions {
        self.max_dbs = dbs;
        self
    }

    /// Cap on dirty pages a write transaction may hold before spilling;
    /// exceeding it after a spill fails the transaction with `TxnFull`.
    pub fn max_dirty_pages(mut self, pages: usize) -> EnvOptions {
        self.max_dirty_pages = pages;
        self
    }

    pub fn flags(mut self, flags: EnvFlags) -> EnvOptions {
        self.flags = flags;
        self
    }

    /// Open (or create) the environment at `path`.
    pub fn open<P: AsRef<Path>>(self, path: P) -> Result<Env> {
        Env::open(path.as_ref(), self)
    }
}

/// An open database environment.
pub struct Env {
    data: DataFile,
    lockfile: Option<LockFile>,
    flags: EnvFlags,
    max_dirty_pages: usize,
    registry: RwLock<DbiRegistry>,
    /// Thread-id to reader-slot binding (unless `NO_TLS`).
    thread_slots: Mutex<HashMap<u64, usize>>,
    /// Writer serialization for `NO_LOCK` environments.
    nolock_writer: Mutex<()>,
    panicked: AtomicBool,
    /// Canonical data-file path, the key in the open-path registry.
    data_path: PathBuf,
    path: PathBuf,
}

impl Env {
    fn open(path: &Path, options: EnvOptions) -> Result<Env> {
        let flags = options.flags;
        let read_only = flags.contains(EnvFlags::READ_ONLY);

        let (data_path, lock_path) = if flags.contains(EnvFlags::NO_SUB_DIR) {
            let mut lock = path.as_os_str().to_owned();
            lock.push(LOCK_SUFFIX);
            (path.to_path_buf(), PathBuf::from(lock))
        } else {
            if !read_only {
                std::fs::create_dir_all(path)?;
            }
            (path.join(DATA_FILE_NAME), path.join(LOCK_FILE_NAME))
        };

        let lockfile = if flags.contains(EnvFlags::NO_LOCK) {
            None
        } else {
            Some(LockFile::open(&lock_path, options.max_readers.max(1))?)
        };

        // Floor: the two meta pages plus room for a minimal tree.
        let map_size = options
            .map_size
            .next_multiple_of(PAGE_SIZE)
            .max(16 * PAGE_SIZE);
        let data = DataFile::open(&data_path, map_size, read_only)?;

        if flags.contains(EnvFlags::NO_READAHEAD) {
            data.advise_random();
        }

        // One environment per data file per process.
        let data_path = data_path.canonicalize()?;
        if !open_paths().lock().insert(data_path.clone()) {
            return Err(Error::Incompatible);
        }

        let env = Env {
            data,
            lockfile,
            flags,
            max_dirty_pages: options.max_dirty_pages.max(64),
            registry: RwLock::new(DbiRegistry::new(options.max_dbs, DbFlags::empty())),
            thread_slots: Mutex::new(HashMap::new()),
            nolock_writer: Mutex::new(()),
            panicked: AtomicBool::new(false),
            data_path,
            path: path.to_path_buf(),
        };

        let meta = env.pick_meta()?;
        *env.registry.write() = DbiRegistry::new(options.max_dbs, meta.dbs[1].flags());
        if let Some(lockfile) = &env.lockfile {
            lockfile.publish_txnid(meta.txnid());
        }

        tracing::debug!(
            path = %env.path.display(),
            txnid = meta.txnid(),
            last_pgno = meta.last_pgno(),
            map_size = env.data.map_size(),
            "opened environment"
        );
        Ok(env)
    }

    /// Path the environment was opened with.
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn env_flags(&self) -> EnvFlags {
        self.flags
    }

    /// Begin a read-only snapshot transaction.
    pub fn begin_ro_txn(&self) -> Result<RoTxn<'_>> {
        RoTxn::begin(self)
    }

    /// Begin the write transaction, blocking until the previous writer
    /// (in any process) finishes.
    pub fn begin_rw_txn(&self) -> Result<RwTxn<'_>> {
        RwTxn::begin(self)
    }

    /// Flush the data file. With `NO_SYNC` environments a `force` sync is
    /// the only durability point.
    pub fn sync(&self, force: bool) -> Result<()> {
        self.check_alive()?;
        if self.flags.contains(EnvFlags::READ_ONLY) {
            return Ok(());
        }
        if force || !self.flags.contains(EnvFlags::NO_SYNC) {
            self.data.sync_data()?;
        }
        Ok(())
    }

    /// Statistics of the main database at the newest snapshot.
    pub fn stat(&self) -> Result<Stat> {
        self.check_alive()?;
        let meta = self.pick_meta()?;
        let db = &meta.dbs[1];
        Ok(Stat {
            page_size: PAGE_SIZE as u32,
            depth: db.depth() as u32,
            branch_pages: db.branch_pages(),
            leaf_pages: db.leaf_pages(),
            overflow_pages: db.overflow_pages(),
            entries: db.entries(),
        })
    }

    pub fn info(&self) -> Result<EnvInfo> {
        self.check_alive()?;
        let meta = self.pick_meta()?;
        let (max_readers, num_readers) = match &self.lockfile {
            Some(lockfile) => (lockfile.max_readers() as u32, lockfile.num_readers() as u32),
            None => (0, 0),
        };
        Ok(EnvInfo {
            map_size: self.data.map_size() as u64,
            last_pgno: meta.last_pgno(),
            last_txnid: meta.txnid(),
            max_readers,
            num_readers,
        })
    }

    /// Registered readers, for diagnostics.
    pub fn reader_list(&self) -> Vec<ReaderSlotInfo> {
        match &self.lockfile {
            Some(lockfile) => lockfile.reader_list(),
            None => Vec::new(),
        }
    }

    /// Close a named database handle, freeing its registry slot. The
    /// caller must guarantee no live transaction still uses the handle;
    /// like the classic C API this is inherently unsynchronized.
    pub fn close_db(&self, dbi: Dbi) {
        self.registry_unregister(dbi);
    }

    /// Clear reader slots held by dead processes; returns how many were
    /// reclaimed.
    pub fn reader_check(&self) -> Result<usize> {
        self.check_alive()?;
        match &self.lockfile {
            Some(lockfile) => lockfile.reader_check(),
            None => Ok(0),
        }
    }

    /// Copy the environment to `path`: a page-exact snapshot copy, or a
    /// compacted rewrite through the read API.
    pub fn copy_to<P: AsRef<Path>>(&self, path: P, compact: bool) -> Result<()> {
        self.check_alive()?;
        if compact {
            self.copy_compact(path.as_ref())
        } else {
            self.copy_plain(path.as_ref())
        }
    }

    fn copy_plain(&self, target: &Path) -> Result<()> {
        use std::os::unix::fs::FileExt;

        let txn = self.begin_ro_txn()?;
        let (free_db, main_db) = txn.core_dbs()?;
        let last_pgno = txn.last_pgno();

        let file = std::fs::File::create(target)?;
        let mut meta = Meta::new(self.data.map_size() as u64);
        meta.dbs[0] = free_db;
        meta.dbs[1] = main_db;
        meta.set_last_pgno(last_pgno);
        meta.set_txnid(txn.id());
        for slot in 0..NUM_META_PAGES {
            let mut page = vec![0u8; PAGE_SIZE];
            crate::storage::PageHeader::init(
                &mut page,
                slot,
                crate::flags::PageFlags::META,
            );
            use zerocopy::IntoBytes;
            page[PAGE_HDR_SIZE..PAGE_HDR_SIZE + META_SIZE].copy_from_slice(meta.as_bytes());
            file.write_all_at(&page, slot * PAGE_SIZE as u64)?;
        }

        let mut pgno = NUM_META_PAGES;
        while pgno <= last_pgno {
            let count = (last_pgno - pgno + 1).min(COPY_BATCH_PAGES);
            let bytes = self.data.pages(pgno, count)?;
            file.write_all_at(bytes, pgno * PAGE_SIZE as u64)?;
            pgno += count;
        }
        file.sync_all()?;
        Ok(())
    }

    fn copy_compact(&self, target: &Path) -> Result<()> {
        let mut src = self.begin_ro_txn()?;
        let (_, main_db) = src.core_dbs()?;

        let dst_env = EnvOptions::new()
            .map_size(self.data.map_size())
            .max_dbs(self.registry.read().len().saturating_sub(CORE_DBS).max(1))
            .flags(self.flags & EnvFlags::NO_SUB_DIR)
            .open(target)?;
        let mut dst = dst_env.begin_rw_txn()?;
        if !main_db.flags().is_empty() {
            dst.force_main_flags(main_db.flags());
            dst_env.registry.write().set_main_flags(main_db.flags());
        }

        // Walk the main database once: name records spawn a per-database
        // copy, everything else is copied verbatim.
        let main_tree = tree_ref(&src, MAIN_DBI)?;
        let mut names: Vec<String> = Vec::new();
        {
            let mut cursor = src.cursor(MAIN_DBI)?;
            let mut entry = cursor.first()?;
            while let Some((key, value)) = entry {
                match ops::tree_get_descriptor(&src, &main_tree, key) {
                    Ok(Some(_)) => {
                        names.push(String::from_utf8_lossy(key).into_owned());
                    }
                    Ok(None) | Err(Error::Incompatible) => {
                        dst.put(MAIN_DBI, key, value, crate::flags::WriteFlags::empty())?;
                    }
                    Err(e) => return Err(e),
                }
                entry = cursor.next()?;
            }
        }

        for name in names {
            let src_dbi = src.open_db(Some(&name), DbFlags::empty())?;
            let src_flags = src.db_flags(src_dbi)?;
            let dst_dbi = dst.open_db(Some(&name), src_flags | DbFlags::CREATE)?;
            let mut cursor = src.cursor(src_dbi)?;
            let mut entry = cursor.first()?;
            while let Some((key, value)) = entry {
                dst.put(dst_dbi, key, value, crate::flags::WriteFlags::empty())?;
                entry = cursor.next()?;
            }
        }

        dst.commit()?;
        Ok(())
    }

    /// Walk the newest snapshot and check its structural invariants:
    /// every page below `last_pgno` is referenced exactly once (by some
    /// tree, an overflow run, or a free-list record), and every branch
    /// page orders its separators.
    pub fn verify(&self) -> Result<VerifyReport> {
        use crate::storage::{FREE_DBI, NUM_META_PAGES as FIRST_PGNO};

        self.check_alive()?;
        let mut txn = self.begin_ro_txn()?;
        let mut seen: HashSet<u64> = HashSet::new();
        let mut report = VerifyReport::default();

        let free_tree = tree_ref(&txn, FREE_DBI)?;
        verify_tree(&txn, &free_tree, &mut seen, &mut report)?;
        let main_tree = tree_ref(&txn, MAIN_DBI)?;
        verify_tree(&txn, &main_tree, &mut seen, &mut report)?;

        // Named databases hang off main-database records.
        let names: Vec<Vec<u8>> = {
            let mut names = Vec::new();
            let mut cursor = txn.cursor(MAIN_DBI)?;
            let mut entry = cursor.first()?;
            while let Some((key, _)) = entry {
                if matches!(
                    ops::tree_get_descriptor(&txn, &main_tree, key),
                    Ok(Some(_))
                ) {
                    names.push(key.to_vec());
                }
                entry = cursor.next()?;
            }
            names
        };
        for name in names {
            let name = String::from_utf8_lossy(&name).into_owned();
            let dbi = txn.open_db(Some(&name), DbFlags::empty())?;
            let tree = tree_ref(&txn, dbi)?;
            verify_tree(&txn, &tree, &mut seen, &mut report)?;
        }

        // Pages parked in free-list records are the other legal owners.
        {
            let mut cursor = txn.cursor(FREE_DBI)?;
            let mut entry = cursor.first()?;
            while let Some((_, value)) = entry {
                if value.len() < 8 {
                    return Err(Error::Corrupted);
                }
                let count = u64::from_le_bytes(value[..8].try_into().unwrap()) as usize;
                if value.len() < 8 + count * 8 {
                    return Err(Error::Corrupted);
                }
                for chunk in value[8..8 + count * 8].chunks_exact(8) {
                    let pgno = u64::from_le_bytes(chunk.try_into().unwrap());
                    if !seen.insert(pgno) {
                        return Err(Error::Corrupted);
                    }
                    report.free_list_pages += 1;
                }
                entry = cursor.next()?;
            }
        }

        let last_pgno = txn.last_pgno();
        report.last_pgno = last_pgno;
        report.txnid = txn.id();
        for &pgno in &seen {
            if pgno < FIRST_PGNO || pgno > last_pgno {
                return Err(Error::Corrupted);
            }
        }
        let total = last_pgno + 1 - FIRST_PGNO;
        report.unreferenced = total - seen.len() as u64;
        Ok(report)
    }

    // -- crate-internal surface ---------------------------------------------

    pub(crate) fn check_alive(&self) -> Result<()> {
        if self.panicked.load(Ordering::Acquire) {
            return Err(Error::Panic);
        }
        Ok(())
    }

    pub(crate) fn set_panic(&self) {
        self.panicked.store(true, Ordering::Release);
    }

    pub(crate) fn data(&self) -> &DataFile {
        &self.data
    }

    pub(crate) fn flags(&self) -> EnvFlags {
        self.flags
    }

    pub(crate) fn max_dirty_pages(&self) -> usize {
        self.max_dirty_pages
    }

    /// Pick the authoritative meta: the valid one with the larger
    /// transaction id, or the older one under `PREV_SNAPSHOT`. A torn or
    /// corrupt slot simply loses the election.
    pub(crate) fn pick_meta(&self) -> Result<Meta> {
        let a = self.data.read_meta_slot(0);
        let b = self.data.read_meta_slot(1);
        let prefer_older = self.flags.contains(EnvFlags::PREV_SNAPSHOT);
        match (a, b) {
            (Ok(a), Ok(b)) => {
                let newer_is_b = b.txnid() > a.txnid();
                Ok(if newer_is_b != prefer_older { b } else { a })
            }
            (Ok(meta), Err(_)) | (Err(_), Ok(meta)) => Ok(meta),
            (Err(e), Err(_)) => Err(e),
        }
    }

    pub(crate) fn comparators(&self, dbi: Dbi) -> Result<(Comparator, Comparator, DbFlags)> {
        let registry = self.registry.read();
        let entry = registry.entry(dbi)?;
        Ok((entry.key_cmp, entry.dup_cmp, entry.flags))
    }

    /// Install a caller-supplied key comparator for one database handle.
    /// Must be set before the first access through the handle in any
    /// transaction, and identically in every process using the file.
    pub fn set_db_compare(&self, dbi: Dbi, cmp: crate::compare::CompareFn) -> Result<()> {
        let mut registry = self.registry.write();
        let mut entry = registry.entry(dbi)?.clone();
        entry.key_cmp = Comparator::Custom(cmp);
        registry.replace(dbi, entry)
    }

    /// Install a caller-supplied duplicate comparator.
    pub fn set_db_dup_compare(&self, dbi: Dbi, cmp: crate::compare::CompareFn) -> Result<()> {
        let mut registry = self.registry.write();
        let mut entry = registry.entry(dbi)?.clone();
        entry.dup_cmp = Comparator::Custom(cmp);
        registry.replace(dbi, entry)
    }

    pub(crate) fn registry_len(&self) -> usize {
        self.registry.read().len()
    }

    pub(crate) fn registry_lookup(&self, name: &str) -> Option<Dbi> {
        self.registry.read().lookup(name)
    }

    pub(crate) fn registry_register(&self, name: &str, flags: DbFlags) -> Result<Dbi> {
        self.registry.write().register(name, flags)
    }

    pub(crate) fn registry_unregister(&self, dbi: Dbi) {
        self.registry.write().unregister(dbi);
    }

    pub(crate) fn registry_set_main_flags(&self, flags: DbFlags) {
        self.registry.write().set_main_flags(flags);
    }

    pub(crate) fn registry_name(&self, dbi: Dbi) -> Result<Option<String>> {
        Ok(self.registry.read().entry(dbi)?.name.clone())
    }

    pub(crate) fn registry_named(&self) -> Vec<(Dbi, String)> {
        let registry = self.registry.read();
        (CORE_DBS..registry.len())
            .filter_map(|index| {
                let dbi = Dbi(index as u32);
                registry
                    .entry(dbi)
                    .ok()
                    .and_then(|entry| entry.name.clone())
                    .map(|name| (dbi, name))
            })
            .collect()
    }

    /// Bind a reader slot for the calling thread: the cached slot unless
    /// `NO_TLS`, in which case a fresh one per transaction.
    pub(crate) fn bind_reader_slot(&self) -> Result<(Option<usize>, bool)> {
        let Some(lockfile) = &self.lockfile else {
            return Ok((None, false));
        };
        let tid = current_tid();
        if self.flags.contains(EnvFlags::NO_TLS) {
            let slot = lockfile.claim_slot(tid)?;
            return Ok((Some(slot), true));
        }
        let mut slots = self.thread_slots.lock();
        if let Some(&slot) = slots.get(&tid) {
            if lockfile.slot_stamp(slot) != TXNID_IDLE {
                // The thread already has a live read transaction on this
                // slot.
                return Err(Error::BadRslot);
            }
            return Ok((Some(slot), false));
        }
        let slot = lockfile.claim_slot(tid)?;
        slots.insert(tid, slot);
        Ok((Some(slot), false))
    }

    pub(crate) fn lockfile_stamp_slot(&self, slot: usize, txnid: u64) {
        if let Some(lockfile) = &self.lockfile {
            lockfile.stamp_slot(slot, txnid);
        }
    }

    pub(crate) fn lockfile_idle_slot(&self, slot: usize) {
        if let Some(lockfile) = &self.lockfile {
            lockfile.idle_slot(slot);
        }
    }

    pub(crate) fn lockfile_release_slot(&self, slot: usize) {
        if let Some(lockfile) = &self.lockfile {
            lockfile.release_slot(slot);
        }
    }

    pub(crate) fn lockfile_publish_txnid(&self, txnid: u64) {
        if let Some(lockfile) = &self.lockfile {
            lockfile.publish_txnid(txnid);
        }
    }

    pub(crate) fn lock_writer(&self) -> Result<WriterGuard<'_>> {
        match &self.lockfile {
            Some(lockfile) => Ok(WriterGuard::Lockfile(lockfile.lock_writer()?)),
            None => Ok(WriterGuard::Local(self.nolock_writer.lock())),
        }
    }

    /// Oldest snapshot any registered reader might still observe, floored
    /// at the snapshot the current write transaction started from.
    pub(crate) fn oldest_snapshot(&self, write_txnid: u64) -> u64 {
        let newest = write_txnid.saturating_sub(1);
        match &self.lockfile {
            Some(lockfile) => lockfile.oldest_snapshot(newest),
            None => newest,
        }
    }
}

impl Drop for Env {
    fn drop(&mut self) {
        open_paths().lock().remove(&self.data_path);
        tracing::debug!(path = %self.path.display(), "closed environment");
    }
}

fn current_tid() -> u64 {
    // SAFETY: pthread_self has no preconditions.
    unsafe { libc::pthread_self() as u64 }
}

/// Result of [`Env::verify`].
#[derive(Debug, Default, Clone, Copy)]
pub struct VerifyReport {
    pub txnid: u64,
    pub last_pgno: u64,
    pub branch_pages: u64,
    pub leaf_pages: u64,
    pub overflow_pages: u64,
    pub free_list_pages: u64,
    pub entries: u64,
    /// Pages below `last_pgno` owned by nothing; a leak, not corruption.
    pub unreferenced: u64,
}

fn verify_tree(
    txn: &RoTxn<'_>,
    tree: &TreeRef,
    seen: &mut HashSet<u64>,
    report: &mut VerifyReport,
) -> Result<()> {
    use crate::storage::PGNO_INVALID;
    if tree.db.root() == PGNO_INVALID {
        return Ok(());
    }
    verify_page(txn, tree, tree.db.root(), seen, report)
}

fn verify_page(
    txn: &RoTxn<'_>,
    tree: &TreeRef,
    pgno: u64,
    seen: &mut HashSet<u64>,
    report: &mut VerifyReport,
) -> Result<()> {
    use crate::flags::NodeFlags;
    use crate::storage::{validate_page, Db, PageView, PGNO_INVALID};

    if !seen.insert(pgno) {
        return Err(Error::Corrupted);
    }

    enum Descend {
        Children(Vec<u64>),
        Subs(Vec<Db>),
    }
    let descend = {
        let view = PageView::new(txn.page_bytes(pgno)?);
        validate_page(view.bytes(), pgno)?;
        let num = view.num_keys();
        let ksize = if view.is_leaf2() {
            tree.db.leaf2_ksize()
        } else {
            0
        };

        // Separator / key ordering within the page. Branch index 0 holds
        // the anonymous separator and stays out of the comparison.
        let first = if view.is_branch() { 2 } else { 1 };
        for i in first..num {
            let a = view.key(i - 1, ksize)?;
            let b = view.key(i, ksize)?;
            if tree.key_cmp.compare(a, b) != std::cmp::Ordering::Less {
                return Err(Error::Corrupted);
            }
        }

        if view.is_branch() {
            report.branch_pages += 1;
            let mut children = Vec::with_capacity(num);
            for i in 0..num {
                children.push(view.node(i)?.child_pgno());
            }
            Descend::Children(children)
        } else {
            report.leaf_pages += 1;
            let mut subs = Vec::new();
            if view.is_leaf2() {
                report.entries += num as u64;
            } else {
                for i in 0..num {
                    let node = view.node(i)?;
                    let flags = node.flags();
                    if flags.contains(NodeFlags::BIG_DATA) {
                        let opgno = node.overflow_pgno()?;
                        let run = txn.overflow_bytes(opgno)?;
                        let count = (run.len() / PAGE_SIZE) as u64;
                        for page in opgno..opgno + count {
                            if !seen.insert(page) {
                                return Err(Error::Corrupted);
                            }
                        }
                        report.overflow_pages += count;
                        report.entries += 1;
                    } else if flags.contains(NodeFlags::DUP_DATA) {
                        if flags.contains(NodeFlags::SUB_DATA) {
                            let db = Db::from_bytes(node.data()?)?;
                            if db.root() == PGNO_INVALID {
                                return Err(Error::Corrupted);
                            }
                            subs.push(db);
                        } else {
                            let sub = PageView::new(node.data()?);
                            report.entries += sub.num_keys() as u64;
                        }
                    } else {
                        report.entries += 1;
                    }
                }
            }
            Descend::Subs(subs)
        }
    };

    match descend {
        Descend::Children(children) => {
            for child in children {
                verify_page(txn, tree, child, seen, report)?;
            }
        }
        Descend::Subs(subs) => {
            for db in subs {
                let sub = ops::sub_tree_ref(tree, db);
                // Sub-tree pages count toward the owning tree but keep
                // their own entry total in the descriptor.
                let before = report.entries;
                verify_page(txn, &sub, db.root(), seen, report)?;
                let counted = report.entries - before;
                if counted != db.entries() {
                    return Err(Error::Corrupted);
                }
            }
        }
    }
    Ok(())
}
