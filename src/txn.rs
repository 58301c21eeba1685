//! # Transactions
//!
//! Two transaction types share one snapshot model:
//!
//! - [`RoTxn`] pins a committed snapshot by stamping a reader slot with the
//!   meta transaction id it observed. Everything it reads comes straight
//!   from the shared map; it takes no locks after begin and never blocks
//!   the writer.
//! - [`RwTxn`] is the single writer. It holds the writer lock for its whole
//!   life, mutates exclusively through copy-on-write into private dirty
//!   buffers, and commits by flushing those buffers, syncing, and flipping
//!   the meta page. Until that flip, no reader can observe anything it did;
//!   after a failed commit the previous meta is still authoritative.
//!
//! ## Dirty-page accounting
//!
//! Dirty pages live in a `BTreeMap` keyed by page number, which makes the
//! commit flush naturally sorted and lets physically adjacent pages
//! coalesce into gathered writes. The map is bounded: when it approaches
//! the cap, roughly an eighth of it is spilled, written to the pages'
//! final offsets early and dropped from memory. Spilling never changes
//! committed state (the meta still points at the old tree) and a spilled
//! page that is touched again is simply read back.
//!
//! ## Page reclamation
//!
//! Pages freed by this transaction are recorded in the free-page database
//! under this transaction's id at commit. Allocation prefers, in order:
//! loose pages freed earlier in the same transaction, the reclaimed pool
//! harvested from free-DB records older than the oldest live reader, and
//! finally the file tail. The reclaimed pool and harvest cursor reset when
//! the transaction ends, so an abort can never leak or double-use a page.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::io::IoSlice;

use parking_lot::MutexGuard;

use crate::btree::ops;
use crate::compare::Comparator;
use crate::cursor::{RoCursor, RwCursor};
use crate::db::{Dbi, Stat};
use crate::env::Env;
use crate::error::{Error, Result};
use crate::flags::{DbFlags, EnvFlags, PageFlags, WriteFlags};
use crate::storage::{
    merge_descending, take_contiguous_run, Db, Meta, PageHeader, WriterLock, CORE_DBS, FREE_DBI,
    MAIN_DBI, PAGE_SIZE,
};

/// Buffers per gathered flush write.
const FLUSH_BATCH: usize = 64;

/// Convergence bound for the free-list save loop.
const FREELIST_SAVE_ROUNDS: usize = 16;

mod private {
    pub trait Sealed {}
    impl Sealed for super::RoTxn<'_> {}
    impl Sealed for super::RwTxn<'_> {}
}

/// Read surface shared by both transaction types. The hidden methods are
/// the crate-internal page-resolution hooks the tree code runs on.
pub trait Transaction: private::Sealed {
    /// Snapshot (read) or working (write) transaction id.
    fn id(&self) -> u64;

    #[doc(hidden)]
    fn env_ref(&self) -> &Env;
    #[doc(hidden)]
    fn db_ref(&self, dbi: Dbi) -> Result<Db>;
    #[doc(hidden)]
    fn page_bytes(&self, pgno: u64) -> Result<&[u8]>;
    #[doc(hidden)]
    fn overflow_bytes(&self, pgno: u64) -> Result<&[u8]>;
}

/// Tree context resolved once per operation: descriptor plus comparators.
#[derive(Debug, Clone, Copy)]
pub(crate) struct TreeRef {
    pub dbi: Dbi,
    pub db: Db,
    pub flags: DbFlags,
    pub key_cmp: Comparator,
    pub dup_cmp: Comparator,
    /// Duplicate sub-tree: keys are values, ordered by `dup_cmp`.
    pub sub: bool,
}

pub(crate) fn tree_ref<T: Transaction + ?Sized>(txn: &T, dbi: Dbi) -> Result<TreeRef> {
    let db = txn.db_ref(dbi)?;
    let (key_cmp, dup_cmp, flags) = txn.env_ref().comparators(dbi)?;
    Ok(TreeRef {
        dbi,
        db,
        flags,
        key_cmp,
        dup_cmp,
        sub: false,
    })
}

// ---------------------------------------------------------------------------
// Read-only transactions
// ---------------------------------------------------------------------------

/// A read-only snapshot transaction.
pub struct RoTxn<'env> {
    env: &'env Env,
    txnid: u64,
    dbs: Vec<Option<Db>>,
    slot: Option<usize>,
    /// `NO_TLS` slots are released at end instead of parked idle.
    own_slot: bool,
    next_pgno: u64,
    active: bool,
}

impl<'env> RoTxn<'env> {
    pub(crate) fn begin(env: &'env Env) -> Result<RoTxn<'env>> {
        env.check_alive()?;

        let (slot, own_slot) = env.bind_reader_slot()?;
        let meta = stamp_snapshot(env, slot)?;

        let mut txn = RoTxn {
            env,
            txnid: meta.txnid(),
            dbs: snapshot_core_dbs(env, &meta),
            slot,
            own_slot,
            next_pgno: meta.last_pgno() + 1,
            active: true,
        };
        load_named_dbs(&mut txn)?;
        Ok(txn)
    }

    /// Look up a key. For duplicate-sort databases this returns the first
    /// duplicate in order.
    pub fn get(&self, dbi: Dbi, key: &[u8]) -> Result<Option<&[u8]>> {
        self.check_active()?;
        let tree = tree_ref(self, dbi)?;
        ops::tree_get(self, &tree, key)
    }

    /// Open a named database visible in this snapshot, or the main
    /// database for `None`.
    pub fn open_db(&mut self, name: Option<&str>, flags: DbFlags) -> Result<Dbi> {
        self.check_active()?;
        if flags.contains(DbFlags::CREATE) {
            return Err(Error::Io(std::io::ErrorKind::PermissionDenied.into()));
        }
        open_db_common(self, name, flags, |_| Err(Error::NotFound))
    }

    /// Statistics of one database as of this snapshot.
    pub fn db_stat(&self, dbi: Dbi) -> Result<Stat> {
        self.check_active()?;
        Ok(stat_of(&self.db_ref(dbi)?))
    }

    /// Flags a database was created with.
    pub fn db_flags(&self, dbi: Dbi) -> Result<DbFlags> {
        self.check_active()?;
        Ok(self.db_ref(dbi)?.flags())
    }

    /// Open a read cursor over one database.
    pub fn cursor(&self, dbi: Dbi) -> Result<RoCursor<'_, Self>> {
        self.check_active()?;
        RoCursor::new(self, dbi)
    }

    /// Release the snapshot but keep the reader slot for [`Self::renew`].
    pub fn reset(&mut self) {
        if self.active {
            if let Some(slot) = self.slot {
                self.env.lockfile_idle_slot(slot);
            }
            self.active = false;
        }
    }

    /// Re-arm a reset transaction against the newest snapshot.
    pub fn renew(&mut self) -> Result<()> {
        if self.active {
            return Err(Error::BadTxn);
        }
        self.env.check_alive()?;
        let meta = stamp_snapshot(self.env, self.slot)?;
        self.txnid = meta.txnid();
        self.dbs = snapshot_core_dbs(self.env, &meta);
        self.next_pgno = meta.last_pgno() + 1;
        self.active = true;
        load_named_dbs(self)?;
        Ok(())
    }

    /// Abort. Aborting twice (or after `reset`) is a no-op.
    pub fn abort(self) {}

    /// The environment this transaction reads.
    pub fn env(&self) -> &'env Env {
        self.env
    }

    pub(crate) fn core_dbs(&self) -> Result<(Db, Db)> {
        Ok((self.db_ref(FREE_DBI)?, self.db_ref(MAIN_DBI)?))
    }

    pub(crate) fn last_pgno(&self) -> u64 {
        self.next_pgno - 1
    }

    fn check_active(&self) -> Result<()> {
        self.env.check_alive()?;
        if !self.active {
            return Err(Error::BadTxn);
        }
        Ok(())
    }
}

impl Drop for RoTxn<'_> {
    fn drop(&mut self) {
        if let Some(slot) = self.slot {
            if self.own_slot {
                self.env.lockfile_release_slot(slot);
            } else {
                self.env.lockfile_idle_slot(slot);
            }
        }
    }
}

impl Transaction for RoTxn<'_> {
    fn id(&self) -> u64 {
        self.txnid
    }

    fn env_ref(&self) -> &Env {
        self.env
    }

    fn db_ref(&self, dbi: Dbi) -> Result<Db> {
        self.dbs
            .get(dbi.index())
            .and_then(|db| *db)
            .ok_or(Error::BadDbi)
    }

    fn page_bytes(&self, pgno: u64) -> Result<&[u8]> {
        if pgno >= self.next_pgno {
            return Err(Error::PageNotFound);
        }
        self.env.data().page(pgno)
    }

    fn overflow_bytes(&self, pgno: u64) -> Result<&[u8]> {
        if pgno >= self.next_pgno {
            return Err(Error::PageNotFound);
        }
        read_overflow_from_map(self.env, pgno)
    }
}

fn read_overflow_from_map(env: &Env, pgno: u64) -> Result<&[u8]> {
    let first = env.data().page(pgno)?;
    let header = PageHeader::from_bytes(first);
    if !header.flags().contains(PageFlags::OVERFLOW) {
        return Err(Error::Corrupted);
    }
    let count = header.overflow_pages() as u64;
    env.data().pages(pgno, count)
}

/// Stamp the reader slot with the snapshot we are about to use, re-reading
/// the meta until the stamp and the meta agree so a concurrent commit can
/// never leave us pinned on an unprotected snapshot.
fn stamp_snapshot(env: &Env, slot: Option<usize>) -> Result<Meta> {
    loop {
        let meta = env.pick_meta()?;
        match slot {
            Some(slot) => {
                env.lockfile_stamp_slot(slot, meta.txnid());
                let again = env.pick_meta()?;
                if again.txnid() == meta.txnid() {
                    return Ok(meta);
                }
            }
            None => return Ok(meta),
        }
    }
}

fn snapshot_core_dbs(env: &Env, meta: &Meta) -> Vec<Option<Db>> {
    let len = env.registry_len().max(CORE_DBS);
    let mut dbs = vec![None; len];
    dbs[FREE_DBI.index()] = Some(meta.dbs[0]);
    dbs[MAIN_DBI.index()] = Some(meta.dbs[1]);
    dbs
}

fn stat_of(db: &Db) -> Stat {
    Stat {
        page_size: PAGE_SIZE as u32,
        depth: db.depth() as u32,
        branch_pages: db.branch_pages(),
        leaf_pages: db.leaf_pages(),
        overflow_pages: db.overflow_pages(),
        entries: db.entries(),
    }
}

// ---------------------------------------------------------------------------
// Write transactions
// ---------------------------------------------------------------------------

pub(crate) enum WriterGuard<'env> {
    Lockfile(WriterLock<'env>),
    /// `NO_LOCK` environments still serialize writers within the process.
    Local(#[allow(dead_code)] MutexGuard<'env, ()>),
}

/// The single write transaction of an environment.
pub struct RwTxn<'env> {
    env: &'env Env,
    guard: Option<WriterGuard<'env>>,
    txnid: u64,
    pub(crate) dbs: Vec<Option<Db>>,
    pub(crate) db_dirty: Vec<bool>,
    new_dbis: Vec<Dbi>,
    pub(crate) dirty: BTreeMap<u64, Box<[u8]>>,
    pub(crate) spilled: BTreeSet<u64>,
    pub(crate) free_pages: Vec<u64>,
    pub(crate) loose: Vec<u64>,
    pool: Vec<u64>,
    last_reclaimed: u64,
    pub(crate) next_pgno: u64,
    no_harvest: bool,
    poisoned: bool,
    done: bool,
}

impl<'env> RwTxn<'env> {
    pub(crate) fn begin(env: &'env Env) -> Result<RwTxn<'env>> {
        env.check_alive()?;
        if env.flags().contains(EnvFlags::READ_ONLY) {
            return Err(Error::Io(std::io::ErrorKind::PermissionDenied.into()));
        }

        let guard = env.lock_writer()?;
        // The meta cannot move while we hold the writer lock.
        let meta = env.pick_meta()?;
        let txnid = meta.txnid() + 1;

        let len = env.registry_len().max(CORE_DBS);
        let mut txn = RwTxn {
            env,
            guard: Some(guard),
            txnid,
            dbs: snapshot_core_dbs(env, &meta),
            db_dirty: vec![false; len],
            new_dbis: Vec::new(),
            dirty: BTreeMap::new(),
            spilled: BTreeSet::new(),
            free_pages: Vec::new(),
            loose: Vec::new(),
            pool: Vec::new(),
            last_reclaimed: 0,
            next_pgno: meta.last_pgno() + 1,
            no_harvest: false,
            poisoned: false,
            done: false,
        };
        load_named_dbs_rw(&mut txn)?;
        Ok(txn)
    }

    /// Look up a key (sees this transaction's own uncommitted writes).
    pub fn get(&self, dbi: Dbi, key: &[u8]) -> Result<Option<&[u8]>> {
        self.check_usable()?;
        let tree = tree_ref(self, dbi)?;
        ops::tree_get(self, &tree, key)
    }

    /// Store a key/value pair.
    pub fn put(&mut self, dbi: Dbi, key: &[u8], data: &[u8], flags: WriteFlags) -> Result<()> {
        self.check_usable()?;
        if flags
            .intersects(WriteFlags::RESERVE | WriteFlags::CURRENT | WriteFlags::MULTIPLE)
        {
            return Err(Error::Incompatible);
        }
        self.write_op(|txn| {
            ops::tree_put(txn, dbi, key, ops::ValueSource::Bytes(data), flags).map(|_| ())
        })
    }

    /// Reserve space for a value and return the writable slice; the caller
    /// fills it before the next operation on this transaction.
    pub fn put_reserve(
        &mut self,
        dbi: Dbi,
        key: &[u8],
        len: usize,
        flags: WriteFlags,
    ) -> Result<&mut [u8]> {
        self.check_usable()?;
        if flags.contains(WriteFlags::CURRENT) {
            return Err(Error::Incompatible);
        }
        let location = self.write_op(|txn| {
            ops::tree_put(
                txn,
                dbi,
                key,
                ops::ValueSource::Reserve(len),
                flags | WriteFlags::RESERVE,
            )
        })?;
        self.resolve_reserve(location)
    }

    pub(crate) fn resolve_reserve(&mut self, location: ops::PutLocation) -> Result<&mut [u8]> {
        match location {
            ops::PutLocation::Inline { pgno, idx } => {
                let page = self.page_mut(pgno)?;
                crate::storage::PageMut::new(page).data_mut(idx)
            }
            ops::PutLocation::Overflow { pgno, len } => {
                let buf = self.page_run_mut(pgno)?;
                Ok(&mut buf[crate::storage::PAGE_HDR_SIZE..crate::storage::PAGE_HDR_SIZE + len])
            }
        }
    }

    /// Delete a key, or one duplicate of a key when `value` is given.
    pub fn del(&mut self, dbi: Dbi, key: &[u8], value: Option<&[u8]>) -> Result<()> {
        self.check_usable()?;
        self.write_op(|txn| ops::tree_del(txn, dbi, key, value))
    }

    /// Open (or with `CREATE`, create) a database.
    pub fn open_db(&mut self, name: Option<&str>, flags: DbFlags) -> Result<Dbi> {
        self.check_usable()?;
        open_db_common(self, name, flags, |txn| {
            // Creation path: claim a registry slot and a fresh descriptor;
            // the name record is written into the main database at commit.
            let name = name.expect("create only reaches here for named databases");
            let dbi = txn.env.registry_register(name, flags)?;
            grow_db_tables(txn, dbi);
            // For DUP_FIXED the key stride stays zero until the first
            // stored duplicate fixes it.
            txn.dbs[dbi.index()] = Some(Db::new(flags));
            txn.db_dirty[dbi.index()] = true;
            txn.new_dbis.push(dbi);
            Ok(dbi)
        })
    }

    /// Delete every entry of a database, keeping the handle usable.
    pub fn clear_db(&mut self, dbi: Dbi) -> Result<()> {
        self.check_usable()?;
        self.write_op(|txn| ops::tree_clear(txn, dbi))
    }

    /// Delete every entry and, for named databases, the database itself.
    pub fn drop_db(&mut self, dbi: Dbi, delete: bool) -> Result<()> {
        self.check_usable()?;
        if dbi.index() < CORE_DBS && delete {
            return Err(Error::Incompatible);
        }
        self.write_op(|txn| {
            ops::tree_clear(txn, dbi)?;
            if delete {
                let name = txn
                    .env
                    .registry_name(dbi)?
                    .ok_or(Error::BadDbi)?;
                match ops::tree_del(txn, MAIN_DBI, name.as_bytes(), None) {
                    Ok(()) | Err(Error::NotFound) => {}
                    Err(e) => return Err(e),
                }
                txn.dbs[dbi.index()] = None;
                txn.db_dirty[dbi.index()] = false;
                txn.env.registry_unregister(dbi);
            }
            Ok(())
        })
    }

    pub fn db_stat(&self, dbi: Dbi) -> Result<Stat> {
        self.check_usable()?;
        Ok(stat_of(&self.db_ref(dbi)?))
    }

    pub fn db_flags(&self, dbi: Dbi) -> Result<DbFlags> {
        self.check_usable()?;
        Ok(self.db_ref(dbi)?.flags())
    }

    /// Open a read cursor over one database.
    pub fn cursor(&self, dbi: Dbi) -> Result<RoCursor<'_, Self>> {
        self.check_usable()?;
        RoCursor::new(self, dbi)
    }

    /// Open a write cursor. The cursor borrows the transaction mutably, so
    /// only one write cursor can exist at a time and no other cursor can
    /// observe a structural change half-done.
    pub fn cursor_mut(&mut self, dbi: Dbi) -> Result<RwCursor<'_, 'env>> {
        self.check_usable()?;
        RwCursor::new(self, dbi)
    }

    /// Commit: flush dirty pages, sync, flip the meta.
    pub fn commit(mut self) -> Result<()> {
        if self.poisoned {
            self.cleanup();
            return Err(Error::BadTxn);
        }
        let result = self.commit_inner();
        if result.is_err() {
            // Failed commits roll back wholesale; registry entries created
            // by this transaction go with them.
            self.cleanup();
        } else {
            self.done = true;
            self.guard = None;
        }
        result
    }

    /// Abort, discarding every change.
    pub fn abort(self) {}

    /// The environment this transaction writes.
    pub fn env(&self) -> &'env Env {
        self.env
    }

    fn commit_inner(&mut self) -> Result<()> {
        let env = self.env;

        // Step 1: descriptors of changed named databases become records in
        // the main database.
        for index in CORE_DBS..self.dbs.len() {
            if !self.db_dirty[index] {
                continue;
            }
            let Some(db) = self.dbs[index] else { continue };
            let name = env
                .registry_name(Dbi(index as u32))?
                .ok_or(Error::BadDbi)?;
            ops::tree_put_descriptor(self, name.as_bytes(), &db)?;
        }

        // Step 2: the freed-page ledger for this snapshot.
        self.save_freelist()?;

        // Step 3: dirty pages, sorted and coalesced.
        self.flush_dirty()?;

        // Step 4: make the data durable before publishing it.
        if !env.flags().contains(EnvFlags::NO_SYNC) {
            env.data().sync_data()?;
        }

        // Step 5: flip the meta. Failure here is fatal for the
        // environment: we cannot know how much of the meta hit the disk.
        let mut meta = Meta::new(env.data().map_size() as u64);
        meta.dbs[0] = self.dbs[FREE_DBI.index()].ok_or(Error::Problem("free db missing"))?;
        meta.dbs[1] = self.dbs[MAIN_DBI.index()].ok_or(Error::Problem("main db missing"))?;
        meta.set_last_pgno(self.next_pgno - 1);
        meta.set_txnid(self.txnid);
        let durable = !env
            .flags()
            .intersects(EnvFlags::NO_SYNC | EnvFlags::NO_META_SYNC);
        if let Err(e) = env.data().write_meta(self.txnid & 1, &meta, durable) {
            env.set_panic();
            tracing::warn!(error = %e, "meta write failed; environment is now fatal");
            return Err(Error::Panic);
        }

        // Step 6: publish for future readers, then the writer lock drops.
        env.lockfile_publish_txnid(self.txnid);
        tracing::debug!(
            txnid = self.txnid,
            dirty = self.dirty.len(),
            spilled = self.spilled.len(),
            freed = self.free_pages.len(),
            last_pgno = self.next_pgno - 1,
            "committed"
        );
        Ok(())
    }

    fn save_freelist(&mut self) -> Result<()> {
        self.no_harvest = true;

        // Records whose pages were merged into the pool are consumed;
        // delete them before writing ours.
        while self.last_reclaimed > 0 {
            let Some((key, _)) = ops::tree_first_owned(self, FREE_DBI)? else {
                break;
            };
            let id = decode_txnid_key(&key)?;
            if id > self.last_reclaimed {
                break;
            }
            ops::tree_del(self, FREE_DBI, &key, None)?;
        }

        // Writing the record itself frees pages, so the record is written
        // in two steps: reserve slack space first, then fill it once the
        // list has settled. A same-size reserve rewrites the record in
        // place and frees nothing, which is what makes this converge.
        let key = self.txnid.to_ne_bytes();
        let mut capacity = self.free_page_count() + 32;
        for _ in 0..FREELIST_SAVE_ROUNDS {
            let list = self.collect_free_list()?;
            if list.is_empty() {
                match ops::tree_del(self, FREE_DBI, &key, None) {
                    Ok(()) | Err(Error::NotFound) => {}
                    Err(e) => return Err(e),
                }
                if self.free_page_count() == 0 {
                    return Ok(());
                }
                continue;
            }
            if list.len() > capacity {
                capacity = list.len() + 32;
                continue;
            }
            let location = ops::tree_put(
                self,
                FREE_DBI,
                &key,
                ops::ValueSource::Reserve(8 * (capacity + 1)),
                WriteFlags::empty(),
            )?;
            let settled = self.collect_free_list()?;
            if settled.len() > capacity {
                capacity = settled.len() + 32;
                continue;
            }
            let slice = self.resolve_reserve(location)?;
            slice.fill(0);
            slice[..8].copy_from_slice(&(settled.len() as u64).to_le_bytes());
            for (chunk, pgno) in slice[8..].chunks_exact_mut(8).zip(&settled) {
                chunk.copy_from_slice(&pgno.to_le_bytes());
            }
            self.loose.clear();
            return Ok(());
        }
        Err(Error::Problem("free-list save did not converge"))
    }

    fn free_page_count(&self) -> usize {
        self.free_pages.len() + self.loose.len() + self.pool.len()
    }

    fn collect_free_list(&self) -> Result<Vec<u64>> {
        let mut list =
            Vec::with_capacity(self.free_pages.len() + self.loose.len() + self.pool.len());
        list.extend_from_slice(&self.free_pages);
        list.extend_from_slice(&self.loose);
        // Harvested but unspent pages stay free; folding them into our
        // record re-parks them under this snapshot id.
        list.extend_from_slice(&self.pool);
        list.sort_unstable_by(|a, b| b.cmp(a));
        if list.windows(2).any(|w| w[0] == w[1]) {
            return Err(Error::Corrupted);
        }
        Ok(list)
    }

    fn flush_dirty(&mut self) -> Result<()> {
        for buf in self.dirty.values_mut() {
            PageHeader::from_bytes_mut(buf).remove_flags(PageFlags::DIRTY);
        }

        let mut batch: Vec<IoSlice<'_>> = Vec::with_capacity(FLUSH_BATCH);
        let mut batch_start = 0u64;
        let mut expected_next = 0u64;
        for (&pgno, buf) in &self.dirty {
            let span = (buf.len() / PAGE_SIZE) as u64;
            if !batch.is_empty() && (pgno != expected_next || batch.len() == FLUSH_BATCH) {
                self.env.data().write_pages_at(batch_start, &batch)?;
                batch.clear();
            }
            if batch.is_empty() {
                batch_start = pgno;
            }
            batch.push(IoSlice::new(buf));
            expected_next = pgno + span;
        }
        if !batch.is_empty() {
            self.env.data().write_pages_at(batch_start, &batch)?;
        }
        Ok(())
    }

    fn cleanup(&mut self) {
        if self.done {
            return;
        }
        self.done = true;
        for dbi in self.new_dbis.drain(..) {
            self.env.registry_unregister(dbi);
        }
        self.guard = None;
    }

    fn check_usable(&self) -> Result<()> {
        self.env.check_alive()?;
        if self.poisoned || self.done {
            return Err(Error::BadTxn);
        }
        Ok(())
    }

    /// Run a mutation, poisoning the transaction on structural failure.
    pub(crate) fn write_op<R>(
        &mut self,
        op: impl FnOnce(&mut Self) -> Result<R>,
    ) -> Result<R> {
        match op(self) {
            Ok(value) => Ok(value),
            Err(e) => {
                if e.poisons_txn() {
                    self.poisoned = true;
                }
                Err(e)
            }
        }
    }

    // -- dirty page plumbing -------------------------------------------------

    pub(crate) fn is_dirty(&self, pgno: u64) -> bool {
        self.dirty.contains_key(&pgno)
    }

    pub(crate) fn is_spilled(&self, pgno: u64) -> bool {
        self.spilled.contains(&pgno)
    }

    /// Mutable bytes of a dirty page (first page of a run).
    pub(crate) fn page_mut(&mut self, pgno: u64) -> Result<&mut [u8]> {
        let buf = self
            .dirty
            .get_mut(&pgno)
            .ok_or(Error::Problem("page_mut on a clean page"))?;
        Ok(&mut buf[..PAGE_SIZE])
    }

    /// Mutable bytes of a whole dirty run.
    pub(crate) fn page_run_mut(&mut self, pgno: u64) -> Result<&mut [u8]> {
        self.dirty
            .get_mut(&pgno)
            .map(|buf| &mut buf[..])
            .ok_or(Error::Problem("page_run_mut on a clean page"))
    }

    /// Allocate page numbers only; the caller decides what buffer (if any)
    /// backs them.
    pub(crate) fn alloc_pgno(&mut self, count: u64) -> Result<u64> {
        debug_assert!(count >= 1);
        if !self.no_harvest {
            if count == 1 {
                if let Some(pgno) = self.loose.pop() {
                    return Ok(pgno);
                }
            }
            loop {
                if let Some(pgno) = take_contiguous_run(&mut self.pool, count as usize) {
                    return Ok(pgno);
                }
                if !self.harvest_once()? {
                    break;
                }
            }
        }
        if self.next_pgno + count > self.env.data().num_pages() {
            return Err(Error::MapFull);
        }
        let pgno = self.next_pgno;
        self.next_pgno += count;
        Ok(pgno)
    }

    /// Allocate a zeroed dirty run and hand back its first page number.
    pub(crate) fn alloc_dirty(&mut self, count: u64) -> Result<u64> {
        self.require_dirty_room(count as usize)?;
        let pgno = self.alloc_pgno(count)?;
        let buf = vec![0u8; count as usize * PAGE_SIZE].into_boxed_slice();
        self.dirty.insert(pgno, buf);
        Ok(pgno)
    }

    /// Bring an existing page into the dirty set under a new page number,
    /// freeing the old one. Returns the new page number.
    pub(crate) fn shadow_page(&mut self, pgno: u64) -> Result<u64> {
        debug_assert!(!self.is_dirty(pgno));
        self.require_dirty_room(1)?;
        if self.is_spilled(pgno) {
            self.unspill(pgno)?;
            return Ok(pgno);
        }
        let new_pgno = self.alloc_pgno(1)?;
        let mut buf = self.env.data().page(pgno)?.to_vec().into_boxed_slice();
        {
            let header = PageHeader::from_bytes_mut(&mut buf);
            header.set_pgno(new_pgno);
            header.insert_flags(PageFlags::DIRTY);
        }
        self.dirty.insert(new_pgno, buf);
        self.free_run(pgno, 1);
        Ok(new_pgno)
    }

    fn unspill(&mut self, pgno: u64) -> Result<()> {
        self.spilled.remove(&pgno);
        let mut buf = self.env.data().page(pgno)?.to_vec().into_boxed_slice();
        PageHeader::from_bytes_mut(&mut buf).insert_flags(PageFlags::DIRTY);
        self.dirty.insert(pgno, buf);
        Ok(())
    }

    /// Record a run of pages as freed by this transaction.
    pub(crate) fn free_run(&mut self, pgno: u64, count: u64) {
        if self.dirty.remove(&pgno).is_some() || self.spilled.remove(&pgno) {
            // Pages this transaction itself allocated can be recycled
            // immediately.
            for i in 0..count {
                self.loose.push(pgno + i);
            }
        } else {
            for i in 0..count {
                self.free_pages.push(pgno + i);
            }
        }
    }

    /// Hard cap check for allocations made while a tree operation holds
    /// a path; spilling here could evict a page the operation is still
    /// pointing at, so this never spills.
    fn require_dirty_room(&self, need: usize) -> Result<()> {
        if self.dirty.len() + need > self.env.max_dirty_pages() {
            return Err(Error::TxnFull);
        }
        Ok(())
    }

    /// Called at operation entry, before any path is held: spill when the
    /// estimated page need would overrun the cap.
    pub(crate) fn ensure_dirty_room(&mut self, need: usize) -> Result<()> {
        let cap = self.env.max_dirty_pages();
        if self.dirty.len() + need <= cap {
            return Ok(());
        }
        self.spill(need)?;
        if self.dirty.len() + need > cap {
            return Err(Error::TxnFull);
        }
        Ok(())
    }

    /// Write an eighth of the dirty list (more when the incoming need is
    /// larger) to its final offsets and drop the buffers. Root pages stay
    /// pinned; a spilled page that gets touched again is read back by
    /// [`Self::shadow_page`].
    fn spill(&mut self, need: usize) -> Result<()> {
        let mut roots = BTreeSet::new();
        for db in self.dbs.iter().flatten() {
            roots.insert(db.root());
        }
        let cap = self.env.max_dirty_pages();
        let excess = (self.dirty.len() + need).saturating_sub(cap);
        let target = excess.max(self.dirty.len() / 8).max(1);
        let victims: Vec<u64> = self
            .dirty
            .iter()
            .filter(|(pgno, buf)| buf.len() == PAGE_SIZE && !roots.contains(pgno))
            .map(|(&pgno, _)| pgno)
            .take(target)
            .collect();
        for pgno in &victims {
            let mut buf = self
                .dirty
                .remove(pgno)
                .ok_or(Error::Problem("spill victim vanished"))?;
            PageHeader::from_bytes_mut(&mut buf).remove_flags(PageFlags::DIRTY);
            self.env
                .data()
                .write_pages_at(*pgno, &[IoSlice::new(&buf)])?;
            self.spilled.insert(*pgno);
        }
        tracing::trace!(spilled = victims.len(), "spilled dirty pages");
        Ok(())
    }

    fn harvest_once(&mut self) -> Result<bool> {
        let oldest = self.env.oldest_snapshot(self.txnid);
        let start = self.last_reclaimed + 1;
        if start >= oldest {
            return Ok(false);
        }
        let Some((key, value)) =
            ops::tree_seek_range_owned(self, FREE_DBI, &start.to_ne_bytes())?
        else {
            return Ok(false);
        };
        let id = decode_txnid_key(&key)?;
        if id >= oldest {
            return Ok(false);
        }
        let pages = decode_free_record(&value)?;
        tracing::trace!(record = id, pages = pages.len(), "reclaimed free record");
        merge_descending(&mut self.pool, &pages)?;
        self.last_reclaimed = id;
        Ok(true)
    }

    pub(crate) fn set_db(&mut self, dbi: Dbi, db: Db) {
        self.dbs[dbi.index()] = Some(db);
        self.db_dirty[dbi.index()] = true;
    }

    /// Stamp the main database of a fresh target environment with the
    /// source ordering flags during a compacting copy.
    pub(crate) fn force_main_flags(&mut self, flags: DbFlags) {
        self.dbs[MAIN_DBI.index()] = Some(Db::new(flags));
    }
}

impl Drop for RwTxn<'_> {
    fn drop(&mut self) {
        self.cleanup();
    }
}

impl Transaction for RwTxn<'_> {
    fn id(&self) -> u64 {
        self.txnid
    }

    fn env_ref(&self) -> &Env {
        self.env
    }

    fn db_ref(&self, dbi: Dbi) -> Result<Db> {
        self.dbs
            .get(dbi.index())
            .and_then(|db| *db)
            .ok_or(Error::BadDbi)
    }

    fn page_bytes(&self, pgno: u64) -> Result<&[u8]> {
        if let Some(buf) = self.dirty.get(&pgno) {
            return Ok(&buf[..PAGE_SIZE]);
        }
        if pgno >= self.next_pgno {
            return Err(Error::PageNotFound);
        }
        self.env.data().page(pgno)
    }

    fn overflow_bytes(&self, pgno: u64) -> Result<&[u8]> {
        if let Some(buf) = self.dirty.get(&pgno) {
            return Ok(buf);
        }
        if pgno >= self.next_pgno {
            return Err(Error::PageNotFound);
        }
        read_overflow_from_map(self.env, pgno)
    }
}

// ---------------------------------------------------------------------------
// Shared open/load helpers
// ---------------------------------------------------------------------------

fn grow_db_tables(txn: &mut RwTxn<'_>, dbi: Dbi) {
    let needed = dbi.index() + 1;
    if txn.dbs.len() < needed {
        txn.dbs.resize(needed, None);
        txn.db_dirty.resize(needed, false);
    }
}

trait DbTableAccess {
    fn db_table(&mut self) -> &mut Vec<Option<Db>>;

    /// Apply ordering flags to an as-yet empty main database. Only the
    /// write transaction can.
    fn try_set_main_flags(&mut self, _flags: DbFlags) -> bool {
        false
    }
}

impl DbTableAccess for RoTxn<'_> {
    fn db_table(&mut self) -> &mut Vec<Option<Db>> {
        &mut self.dbs
    }
}

impl DbTableAccess for RwTxn<'_> {
    fn db_table(&mut self) -> &mut Vec<Option<Db>> {
        &mut self.dbs
    }

    fn try_set_main_flags(&mut self, flags: DbFlags) -> bool {
        let main = self.dbs[MAIN_DBI.index()];
        let empty = main
            .map_or(true, |db| db.root() == crate::storage::PGNO_INVALID && db.entries() == 0);
        if !empty {
            return false;
        }
        self.set_db(MAIN_DBI, Db::new(flags));
        self.env.registry_set_main_flags(flags);
        true
    }
}

fn open_db_common<T>(
    txn: &mut T,
    name: Option<&str>,
    flags: DbFlags,
    create: impl FnOnce(&mut T) -> Result<Dbi>,
) -> Result<Dbi>
where
    T: Transaction + DbTableAccess,
{
    let Some(name) = name else {
        let db = txn.db_ref(MAIN_DBI)?;
        let requested = flags.persistent();
        if !requested.is_empty() && requested != db.flags() && !txn.try_set_main_flags(requested)
        {
            return Err(Error::Incompatible);
        }
        return Ok(MAIN_DBI);
    };

    // Known handle?
    if let Some(dbi) = txn.env_ref().registry_lookup(name) {
        let loaded = txn
            .db_table()
            .get(dbi.index())
            .copied()
            .flatten()
            .is_some();
        if !loaded {
            match load_one_named_db(txn, name)? {
                Some(db) => {
                    check_db_flags(&db, flags)?;
                    let table = txn.db_table();
                    if table.len() <= dbi.index() {
                        table.resize(dbi.index() + 1, None);
                    }
                    table[dbi.index()] = Some(db);
                }
                None if flags.contains(DbFlags::CREATE) => return create(txn),
                None => return Err(Error::NotFound),
            }
        } else {
            let db = txn.db_ref(dbi)?;
            check_db_flags(&db, flags)?;
        }
        return Ok(dbi);
    }

    // Unknown name: consult the main database of this snapshot.
    match load_one_named_db(txn, name)? {
        Some(db) => {
            if !flags.persistent().is_empty() && flags.persistent() != db.flags() {
                return Err(Error::Incompatible);
            }
            let dbi = txn.env_ref().registry_register(name, db.flags())?;
            let table = txn.db_table();
            if table.len() <= dbi.index() {
                table.resize(dbi.index() + 1, None);
            }
            table[dbi.index()] = Some(db);
            Ok(dbi)
        }
        None if flags.contains(DbFlags::CREATE) => create(txn),
        None => Err(Error::NotFound),
    }
}

fn check_db_flags(db: &Db, requested: DbFlags) -> Result<()> {
    let requested = requested.persistent();
    if !requested.is_empty() && requested != db.flags() {
        return Err(Error::Incompatible);
    }
    Ok(())
}

fn load_one_named_db<T: Transaction>(txn: &T, name: &str) -> Result<Option<Db>> {
    let tree = tree_ref(txn, MAIN_DBI)?;
    ops::tree_get_descriptor(txn, &tree, name.as_bytes())
}

fn load_named_dbs(txn: &mut RoTxn<'_>) -> Result<()> {
    let names = txn.env.registry_named();
    let mut loaded = Vec::new();
    for (dbi, name) in names {
        if let Some(db) = load_one_named_db(txn, &name)? {
            loaded.push((dbi, db));
        }
    }
    for (dbi, db) in loaded {
        if txn.dbs.len() <= dbi.index() {
            txn.dbs.resize(dbi.index() + 1, None);
        }
        txn.dbs[dbi.index()] = Some(db);
    }
    Ok(())
}

fn load_named_dbs_rw(txn: &mut RwTxn<'_>) -> Result<()> {
    let names = txn.env.registry_named();
    let mut loaded = Vec::new();
    for (dbi, name) in names {
        if let Some(db) = load_one_named_db(txn, &name)? {
            loaded.push((dbi, db));
        }
    }
    for (dbi, db) in loaded {
        grow_db_tables(txn, dbi);
        txn.dbs[dbi.index()] = Some(db);
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Free-record codec
// ---------------------------------------------------------------------------

/// Records are `[count][pgno...]`, possibly with reserved slack after the
/// counted entries.
fn decode_free_record(bytes: &[u8]) -> Result<Vec<u64>> {
    if bytes.len() < 8 {
        return Err(Error::Corrupted);
    }
    let count = u64::from_le_bytes(bytes[..8].try_into().unwrap()) as usize;
    if bytes.len() < 8 + count * 8 {
        return Err(Error::Corrupted);
    }
    let mut pages = Vec::with_capacity(count);
    for chunk in bytes[8..8 + count * 8].chunks_exact(8) {
        pages.push(u64::from_le_bytes(chunk.try_into().unwrap()));
    }
    Ok(pages)
}

fn decode_txnid_key(key: &[u8]) -> Result<u64> {
    key.try_into()
        .map(u64::from_ne_bytes)
        .map_err(|_| Error::Corrupted)
}
