//! # Cursors
//!
//! A cursor is a saved tree position: the root-to-leaf path plus, for
//! duplicate-sort databases, an inner position into the current key's
//! value storage (embedded sub-page or promoted sub-tree). Moving the
//! cursor re-resolves pages through the transaction on every step, so a
//! position is always read against the transaction's own view.
//!
//! Two flavors exist, and the borrow they take is the concurrency story:
//!
//! - [`RoCursor`] borrows its transaction immutably. Any number may be
//!   open at once, over read or write transactions, and while one exists
//!   the borrow checker forbids every structural change that could
//!   invalidate it.
//! - [`RwCursor`] borrows the write transaction mutably, so it is the
//!   only cursor alive while it writes. After a structural change it
//!   re-seeks its own saved key, which is what keeps the classic
//!   contract: a delete leaves the cursor parked so the following `next`
//!   yields the entry that now occupies the deleted slot.

use crate::btree::ops::{self, DupShape, Goal, SeekResult, ValueSource};
use crate::btree::Path;
use crate::db::Dbi;
use crate::error::{Error, Result};
use crate::flags::{DbFlags, WriteFlags};
use crate::storage::{Db, PageView};
use crate::txn::{tree_ref, RwTxn, Transaction, TreeRef};

/// Inner duplicate position.
enum SubPos {
    /// Index into the embedded sub-page.
    Page { idx: usize },
    /// Path into the promoted sub-tree.
    Tree { db: Db, path: Path },
}

/// Position state shared by both cursor types.
struct CursorInner {
    path: Path,
    initialized: bool,
    eof: bool,
    /// Set after a delete so the next `next` call reports the entry that
    /// slid into the deleted slot.
    del_pending: bool,
    sub: Option<SubPos>,
}

impl CursorInner {
    fn new() -> CursorInner {
        CursorInner {
            path: Path::new(),
            initialized: false,
            eof: false,
            del_pending: false,
            sub: None,
        }
    }
}

type Pair<'t> = Option<(&'t [u8], &'t [u8])>;

// ---------------------------------------------------------------------------
// Generic movement over (transaction, tree, inner state)
// ---------------------------------------------------------------------------

fn leaf_num_keys<T: Transaction + ?Sized>(txn: &T, path: &Path) -> Result<usize> {
    let leaf = path.leaf().ok_or(Error::Corrupted)?;
    Ok(PageView::new(txn.page_bytes(leaf.pgno)?).num_keys())
}

/// Advance a path to the next leaf entry.
fn path_next<T: Transaction + ?Sized>(txn: &T, tree: &TreeRef, path: &mut Path) -> Result<bool> {
    let num = leaf_num_keys(txn, path)?;
    let leaf = path.leaf_mut().ok_or(Error::Corrupted)?;
    if leaf.idx + 1 < num {
        leaf.idx += 1;
        return Ok(true);
    }
    ops::move_sibling(txn, tree, path, true)
}

/// Step a path back to the previous leaf entry.
fn path_prev<T: Transaction + ?Sized>(txn: &T, tree: &TreeRef, path: &mut Path) -> Result<bool> {
    let leaf = path.leaf_mut().ok_or(Error::Corrupted)?;
    if leaf.idx > 0 {
        leaf.idx -= 1;
        return Ok(true);
    }
    ops::move_sibling(txn, tree, path, false)
}

/// Establish the duplicate position for the entry the path points at.
fn init_sub<T: Transaction + ?Sized>(
    txn: &T,
    tree: &TreeRef,
    inner: &mut CursorInner,
    first: bool,
) -> Result<()> {
    inner.sub = None;
    if !tree.flags.contains(DbFlags::DUP_SORT) {
        return Ok(());
    }
    let leaf = inner.path.leaf().ok_or(Error::Corrupted)?;
    let view = PageView::new(txn.page_bytes(leaf.pgno)?);
    match ops::dup_shape(&view, leaf.idx)? {
        DupShape::Single => {}
        DupShape::SubPage => {
            let node = view.node(leaf.idx)?;
            let sub = PageView::new(node.data()?);
            let idx = if first { 0 } else { sub.num_keys() - 1 };
            inner.sub = Some(SubPos::Page { idx });
        }
        DupShape::SubDb(db) => {
            let sub = ops::sub_tree_ref(tree, db);
            let mut path = Path::new();
            let goal = if first { Goal::First } else { Goal::Last };
            match ops::descend(txn, &sub, goal, &mut path)? {
                SeekResult::At { .. } => {}
                SeekResult::Empty => return Err(Error::Corrupted),
            }
            inner.sub = Some(SubPos::Tree { db, path });
        }
    }
    Ok(())
}

/// The key the cursor is on.
fn current_key<'t, T: Transaction + ?Sized>(
    txn: &'t T,
    tree: &TreeRef,
    inner: &CursorInner,
) -> Result<&'t [u8]> {
    let leaf = inner.path.leaf().ok_or(Error::Corrupted)?;
    let view = PageView::new(txn.page_bytes(leaf.pgno)?);
    view.key(leaf.idx, tree.db.leaf2_ksize())
}

/// The value at the cursor, honoring the duplicate position.
fn current_value<'t, T: Transaction + ?Sized>(
    txn: &'t T,
    tree: &TreeRef,
    inner: &CursorInner,
) -> Result<&'t [u8]> {
    let leaf = inner.path.leaf().ok_or(Error::Corrupted)?;
    let bytes = txn.page_bytes(leaf.pgno)?;
    match &inner.sub {
        None => ops::leaf_value(txn, tree, bytes, leaf.idx),
        Some(SubPos::Page { idx }) => {
            let view = PageView::new(bytes);
            let node = view.node(leaf.idx)?;
            let sub = PageView::new(node.data()?);
            let ksize = if sub.is_leaf2() {
                tree.db.leaf2_ksize()
            } else {
                0
            };
            sub.key(*idx, ksize)
        }
        Some(SubPos::Tree { db, path }) => {
            let sub_leaf = path.leaf().ok_or(Error::Corrupted)?;
            let view = PageView::new(txn.page_bytes(sub_leaf.pgno)?);
            view.key(sub_leaf.idx, db.leaf2_ksize())
        }
    }
}

fn current_pair<'t, T: Transaction + ?Sized>(
    txn: &'t T,
    tree: &TreeRef,
    inner: &CursorInner,
) -> Result<Pair<'t>> {
    Ok(Some((
        current_key(txn, tree, inner)?,
        current_value(txn, tree, inner)?,
    )))
}

/// Advance the duplicate position only.
fn sub_next<T: Transaction + ?Sized>(
    txn: &T,
    tree: &TreeRef,
    inner: &mut CursorInner,
) -> Result<bool> {
    match &mut inner.sub {
        None => Ok(false),
        Some(SubPos::Page { idx }) => {
            let leaf = inner.path.leaf().ok_or(Error::Corrupted)?;
            let view = PageView::new(txn.page_bytes(leaf.pgno)?);
            let node = view.node(leaf.idx)?;
            let num = PageView::new(node.data()?).num_keys();
            if *idx + 1 < num {
                *idx += 1;
                Ok(true)
            } else {
                Ok(false)
            }
        }
        Some(SubPos::Tree { db, path }) => {
            let sub = ops::sub_tree_ref(tree, *db);
            path_next(txn, &sub, path)
        }
    }
}

fn sub_prev<T: Transaction + ?Sized>(
    txn: &T,
    tree: &TreeRef,
    inner: &mut CursorInner,
) -> Result<bool> {
    match &mut inner.sub {
        None => Ok(false),
        Some(SubPos::Page { idx }) => {
            if *idx > 0 {
                *idx -= 1;
                Ok(true)
            } else {
                Ok(false)
            }
        }
        Some(SubPos::Tree { db, path }) => {
            let sub = ops::sub_tree_ref(tree, *db);
            path_prev(txn, &sub, path)
        }
    }
}

/// Seek the duplicate position to `value` (`exact`) or the first
/// duplicate `>= value`.
fn sub_seek<T: Transaction + ?Sized>(
    txn: &T,
    tree: &TreeRef,
    inner: &mut CursorInner,
    value: &[u8],
    exact: bool,
) -> Result<bool> {
    if inner.sub.is_none() {
        let stored = current_value(txn, tree, inner)?;
        let ord = tree.dup_cmp.compare(stored, value);
        return Ok(if exact { ord.is_eq() } else { ord.is_ge() });
    }
    match &mut inner.sub {
        None => Ok(false),
        Some(SubPos::Page { idx }) => {
            let leaf = inner.path.leaf().ok_or(Error::Corrupted)?;
            let view = PageView::new(txn.page_bytes(leaf.pgno)?);
            let node = view.node(leaf.idx)?;
            let sub = PageView::new(node.data()?);
            let ksize = if sub.is_leaf2() {
                tree.db.leaf2_ksize()
            } else {
                0
            };
            let (found, was_exact) =
                crate::btree::search_leaf(sub, tree.dup_cmp, value, ksize)?;
            if found >= sub.num_keys() || (exact && !was_exact) {
                return Ok(false);
            }
            *idx = found;
            Ok(true)
        }
        Some(SubPos::Tree { db, path }) => {
            let sub = ops::sub_tree_ref(tree, *db);
            match ops::descend(txn, &sub, Goal::Key(value), path)? {
                SeekResult::Empty => Ok(false),
                SeekResult::At { exact: was_exact } => {
                    if exact {
                        return Ok(was_exact);
                    }
                    let num = leaf_num_keys(txn, path)?;
                    let leaf = path.leaf().ok_or(Error::Corrupted)?;
                    if leaf.idx >= num {
                        return ops::move_sibling(txn, &sub, path, true);
                    }
                    Ok(true)
                }
            }
        }
    }
}

/// Number of duplicates under the current key.
fn dup_count<T: Transaction + ?Sized>(
    txn: &T,
    tree: &TreeRef,
    inner: &CursorInner,
) -> Result<u64> {
    let leaf = inner.path.leaf().ok_or(Error::Corrupted)?;
    let view = PageView::new(txn.page_bytes(leaf.pgno)?);
    if !tree.flags.contains(DbFlags::DUP_SORT) {
        return Ok(1);
    }
    match ops::dup_shape(&view, leaf.idx)? {
        DupShape::Single => Ok(1),
        DupShape::SubPage => {
            let node = view.node(leaf.idx)?;
            Ok(PageView::new(node.data()?).num_keys() as u64)
        }
        DupShape::SubDb(db) => Ok(db.entries()),
    }
}

// Shared op implementations: every public cursor method funnels through
// one of these so RoCursor and RwCursor cannot drift apart.

fn op_first<'t, T: Transaction + ?Sized>(
    txn: &'t T,
    tree: &TreeRef,
    inner: &mut CursorInner,
) -> Result<Pair<'t>> {
    inner.del_pending = false;
    match ops::descend(txn, tree, Goal::First, &mut inner.path)? {
        SeekResult::Empty => {
            inner.initialized = false;
            inner.eof = true;
            Ok(None)
        }
        SeekResult::At { exact } => {
            if !exact {
                inner.initialized = false;
                inner.eof = true;
                return Ok(None);
            }
            inner.initialized = true;
            inner.eof = false;
            init_sub(txn, tree, inner, true)?;
            current_pair(txn, tree, inner)
        }
    }
}

fn op_last<'t, T: Transaction + ?Sized>(
    txn: &'t T,
    tree: &TreeRef,
    inner: &mut CursorInner,
) -> Result<Pair<'t>> {
    inner.del_pending = false;
    match ops::descend(txn, tree, Goal::Last, &mut inner.path)? {
        SeekResult::Empty => {
            inner.initialized = false;
            inner.eof = true;
            Ok(None)
        }
        SeekResult::At { exact } => {
            if !exact {
                inner.initialized = false;
                inner.eof = true;
                return Ok(None);
            }
            inner.initialized = true;
            inner.eof = false;
            init_sub(txn, tree, inner, false)?;
            current_pair(txn, tree, inner)
        }
    }
}

fn op_next<'t, T: Transaction + ?Sized>(
    txn: &'t T,
    tree: &TreeRef,
    inner: &mut CursorInner,
) -> Result<Pair<'t>> {
    if !inner.initialized {
        return op_first(txn, tree, inner);
    }
    if inner.eof {
        return Ok(None);
    }
    if inner.del_pending {
        // The deletion already advanced us onto the successor.
        inner.del_pending = false;
        return current_pair(txn, tree, inner);
    }
    if sub_next(txn, tree, inner)? {
        return current_pair(txn, tree, inner);
    }
    if path_next(txn, tree, &mut inner.path)? {
        init_sub(txn, tree, inner, true)?;
        return current_pair(txn, tree, inner);
    }
    inner.eof = true;
    Ok(None)
}

fn op_prev<'t, T: Transaction + ?Sized>(
    txn: &'t T,
    tree: &TreeRef,
    inner: &mut CursorInner,
) -> Result<Pair<'t>> {
    if !inner.initialized {
        return op_last(txn, tree, inner);
    }
    inner.del_pending = false;
    if inner.eof {
        inner.eof = false;
        return current_pair(txn, tree, inner);
    }
    if sub_prev(txn, tree, inner)? {
        return current_pair(txn, tree, inner);
    }
    if path_prev(txn, tree, &mut inner.path)? {
        init_sub(txn, tree, inner, false)?;
        return current_pair(txn, tree, inner);
    }
    inner.initialized = false;
    Ok(None)
}

fn op_set<'t, T: Transaction + ?Sized>(
    txn: &'t T,
    tree: &TreeRef,
    inner: &mut CursorInner,
    key: &[u8],
) -> Result<Pair<'t>> {
    inner.del_pending = false;
    match ops::descend(txn, tree, Goal::Key(key), &mut inner.path)? {
        SeekResult::At { exact: true } => {
            inner.initialized = true;
            inner.eof = false;
            init_sub(txn, tree, inner, true)?;
            current_pair(txn, tree, inner)
        }
        _ => {
            inner.initialized = false;
            Ok(None)
        }
    }
}

fn op_set_range<'t, T: Transaction + ?Sized>(
    txn: &'t T,
    tree: &TreeRef,
    inner: &mut CursorInner,
    key: &[u8],
) -> Result<Pair<'t>> {
    inner.del_pending = false;
    match ops::descend(txn, tree, Goal::Key(key), &mut inner.path)? {
        SeekResult::Empty => {
            inner.initialized = false;
            inner.eof = true;
            Ok(None)
        }
        SeekResult::At { .. } => {
            let num = leaf_num_keys(txn, &inner.path)?;
            let leaf = inner.path.leaf().ok_or(Error::Corrupted)?;
            if leaf.idx >= num && !ops::move_sibling(txn, tree, &mut inner.path, true)? {
                inner.initialized = false;
                inner.eof = true;
                return Ok(None);
            }
            inner.initialized = true;
            inner.eof = false;
            init_sub(txn, tree, inner, true)?;
            current_pair(txn, tree, inner)
        }
    }
}

fn op_get_both<'t, T: Transaction + ?Sized>(
    txn: &'t T,
    tree: &TreeRef,
    inner: &mut CursorInner,
    key: &[u8],
    value: &[u8],
    exact: bool,
) -> Result<Pair<'t>> {
    if !tree.flags.contains(DbFlags::DUP_SORT) {
        return Err(Error::Incompatible);
    }
    if op_set(txn, tree, inner, key)?.is_none() {
        return Ok(None);
    }
    if !sub_seek(txn, tree, inner, value, exact)? {
        inner.initialized = false;
        return Ok(None);
    }
    current_pair(txn, tree, inner)
}

/// Packed run of fixed-size duplicates in the current container,
/// starting at the current duplicate position.
fn op_multiple<'t, T: Transaction + ?Sized>(
    txn: &'t T,
    tree: &TreeRef,
    inner: &mut CursorInner,
) -> Result<Pair<'t>> {
    if !tree.flags.contains(DbFlags::DUP_FIXED) {
        return Err(Error::Incompatible);
    }
    let ksize = tree.db.leaf2_ksize();
    if ksize == 0 {
        // No duplicate has been stored yet, so the single value stands
        // alone.
        return current_pair(txn, tree, inner);
    }
    let key = current_key(txn, tree, inner)?;
    let leaf = inner.path.leaf().ok_or(Error::Corrupted)?;
    let bytes = txn.page_bytes(leaf.pgno)?;
    match &mut inner.sub {
        None => current_pair(txn, tree, inner),
        Some(SubPos::Page { idx }) => {
            let view = PageView::new(bytes);
            let node = view.node(leaf.idx)?;
            let sub = PageView::new(node.data()?);
            let num = sub.num_keys();
            let start = *idx;
            let run = &sub.bytes()[crate::storage::PAGE_HDR_SIZE + start * ksize
                ..crate::storage::PAGE_HDR_SIZE + num * ksize];
            *idx = num.saturating_sub(1);
            Ok(Some((key, run)))
        }
        Some(SubPos::Tree { path, .. }) => {
            let sub_leaf = path.leaf().ok_or(Error::Corrupted)?;
            let view = PageView::new(txn.page_bytes(sub_leaf.pgno)?);
            let num = view.num_keys();
            let start = sub_leaf.idx;
            let run = &view.bytes()[crate::storage::PAGE_HDR_SIZE + start * ksize
                ..crate::storage::PAGE_HDR_SIZE + num * ksize];
            if let Some(entry) = path.leaf_mut() {
                entry.idx = num.saturating_sub(1);
            }
            Ok(Some((key, run)))
        }
    }
}

// ---------------------------------------------------------------------------
// Read-only cursor
// ---------------------------------------------------------------------------

/// Iterating cursor over one database of a transaction.
pub struct RoCursor<'t, T: Transaction + ?Sized> {
    txn: &'t T,
    tree: TreeRef,
    inner: CursorInner,
}

impl<'t, T: Transaction + ?Sized> RoCursor<'t, T> {
    pub(crate) fn new(txn: &'t T, dbi: Dbi) -> Result<RoCursor<'t, T>> {
        let tree = tree_ref(txn, dbi)?;
        Ok(RoCursor {
            txn,
            tree,
            inner: CursorInner::new(),
        })
    }

    /// Position at the first entry.
    pub fn first(&mut self) -> Result<Pair<'t>> {
        op_first(self.txn, &self.tree, &mut self.inner)
    }

    /// Position at the last entry.
    pub fn last(&mut self) -> Result<Pair<'t>> {
        op_last(self.txn, &self.tree, &mut self.inner)
    }

    /// Next entry (next duplicate first in DUP_SORT databases).
    pub fn next(&mut self) -> Result<Pair<'t>> {
        op_next(self.txn, &self.tree, &mut self.inner)
    }

    /// Previous entry.
    pub fn prev(&mut self) -> Result<Pair<'t>> {
        op_prev(self.txn, &self.tree, &mut self.inner)
    }

    /// Position at `key` exactly.
    pub fn set(&mut self, key: &[u8]) -> Result<Pair<'t>> {
        op_set(self.txn, &self.tree, &mut self.inner, key)
    }

    /// Position at the first key `>= key`.
    pub fn set_range(&mut self, key: &[u8]) -> Result<Pair<'t>> {
        op_set_range(self.txn, &self.tree, &mut self.inner, key)
    }

    /// Entry at the current position.
    pub fn get_current(&mut self) -> Result<Pair<'t>> {
        if !self.inner.initialized || self.inner.eof || self.inner.del_pending {
            return Ok(None);
        }
        current_pair(self.txn, &self.tree, &self.inner)
    }

    /// Position at `key` with exactly `value` among its duplicates.
    pub fn get_both(&mut self, key: &[u8], value: &[u8]) -> Result<Pair<'t>> {
        op_get_both(self.txn, &self.tree, &mut self.inner, key, value, true)
    }

    /// Position at `key` with the first duplicate `>= value`.
    pub fn get_both_range(&mut self, key: &[u8], value: &[u8]) -> Result<Pair<'t>> {
        op_get_both(self.txn, &self.tree, &mut self.inner, key, value, false)
    }

    /// First duplicate of the current key.
    pub fn first_dup(&mut self) -> Result<Pair<'t>> {
        self.require_position()?;
        init_sub(self.txn, &self.tree, &mut self.inner, true)?;
        current_pair(self.txn, &self.tree, &self.inner)
    }

    /// Last duplicate of the current key.
    pub fn last_dup(&mut self) -> Result<Pair<'t>> {
        self.require_position()?;
        init_sub(self.txn, &self.tree, &mut self.inner, false)?;
        current_pair(self.txn, &self.tree, &self.inner)
    }

    /// Next duplicate of the current key, `None` at the end of the run.
    pub fn next_dup(&mut self) -> Result<Pair<'t>> {
        self.require_position()?;
        if sub_next(self.txn, &self.tree, &mut self.inner)? {
            return current_pair(self.txn, &self.tree, &self.inner);
        }
        Ok(None)
    }

    /// Previous duplicate of the current key.
    pub fn prev_dup(&mut self) -> Result<Pair<'t>> {
        self.require_position()?;
        if sub_prev(self.txn, &self.tree, &mut self.inner)? {
            return current_pair(self.txn, &self.tree, &self.inner);
        }
        Ok(None)
    }

    /// First duplicate of the next key.
    pub fn next_nodup(&mut self) -> Result<Pair<'t>> {
        if !self.inner.initialized {
            return self.first();
        }
        if self.inner.eof {
            return Ok(None);
        }
        if path_next(self.txn, &self.tree, &mut self.inner.path)? {
            init_sub(self.txn, &self.tree, &mut self.inner, true)?;
            return current_pair(self.txn, &self.tree, &self.inner);
        }
        self.inner.eof = true;
        Ok(None)
    }

    /// Last duplicate of the previous key.
    pub fn prev_nodup(&mut self) -> Result<Pair<'t>> {
        if !self.inner.initialized {
            return self.last();
        }
        if self.inner.eof {
            self.inner.eof = false;
            return current_pair(self.txn, &self.tree, &self.inner);
        }
        if path_prev(self.txn, &self.tree, &mut self.inner.path)? {
            init_sub(self.txn, &self.tree, &mut self.inner, false)?;
            return current_pair(self.txn, &self.tree, &self.inner);
        }
        self.inner.initialized = false;
        Ok(None)
    }

    /// Number of duplicates under the current key.
    pub fn count(&mut self) -> Result<u64> {
        self.require_position()?;
        dup_count(self.txn, &self.tree, &self.inner)
    }

    /// Packed duplicates from the current position (DUP_FIXED only).
    pub fn get_multiple(&mut self) -> Result<Pair<'t>> {
        self.require_position()?;
        op_multiple(self.txn, &self.tree, &mut self.inner)
    }

    /// Packed duplicates of the next sub-tree leaf (DUP_FIXED only).
    pub fn next_multiple(&mut self) -> Result<Pair<'t>> {
        self.require_position()?;
        if !sub_next(self.txn, &self.tree, &mut self.inner)? {
            return Ok(None);
        }
        op_multiple(self.txn, &self.tree, &mut self.inner)
    }

    /// Packed duplicates of the previous sub-tree leaf (DUP_FIXED only).
    pub fn prev_multiple(&mut self) -> Result<Pair<'t>> {
        self.require_position()?;
        if !sub_prev(self.txn, &self.tree, &mut self.inner)? {
            return Ok(None);
        }
        // Rewind to the start of the leaf the step landed in.
        if let Some(SubPos::Tree { path, .. }) = &mut self.inner.sub {
            if let Some(entry) = path.leaf_mut() {
                entry.idx = 0;
            }
        } else if let Some(SubPos::Page { idx }) = &mut self.inner.sub {
            *idx = 0;
        }
        op_multiple(self.txn, &self.tree, &mut self.inner)
    }

    fn require_position(&self) -> Result<()> {
        if !self.inner.initialized || self.inner.eof {
            return Err(Error::BadTxn);
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Write cursor
// ---------------------------------------------------------------------------

/// Cursor with write access; exclusively borrows its transaction.
pub struct RwCursor<'t, 'env> {
    txn: &'t mut RwTxn<'env>,
    dbi: Dbi,
    inner: CursorInner,
}

impl<'t, 'env> RwCursor<'t, 'env> {
    pub(crate) fn new(txn: &'t mut RwTxn<'env>, dbi: Dbi) -> Result<RwCursor<'t, 'env>> {
        // Validate the handle eagerly.
        tree_ref(&*txn, dbi)?;
        Ok(RwCursor {
            txn,
            dbi,
            inner: CursorInner::new(),
        })
    }

    fn tree(&self) -> Result<TreeRef> {
        tree_ref(&*self.txn, self.dbi)
    }

    pub fn first(&mut self) -> Result<Pair<'_>> {
        let tree = self.tree()?;
        op_first(&*self.txn, &tree, &mut self.inner)
    }

    pub fn last(&mut self) -> Result<Pair<'_>> {
        let tree = self.tree()?;
        op_last(&*self.txn, &tree, &mut self.inner)
    }

    pub fn next(&mut self) -> Result<Pair<'_>> {
        let tree = self.tree()?;
        op_next(&*self.txn, &tree, &mut self.inner)
    }

    pub fn prev(&mut self) -> Result<Pair<'_>> {
        let tree = self.tree()?;
        op_prev(&*self.txn, &tree, &mut self.inner)
    }

    pub fn set(&mut self, key: &[u8]) -> Result<Pair<'_>> {
        let tree = self.tree()?;
        op_set(&*self.txn, &tree, &mut self.inner, key)
    }

    pub fn set_range(&mut self, key: &[u8]) -> Result<Pair<'_>> {
        let tree = self.tree()?;
        op_set_range(&*self.txn, &tree, &mut self.inner, key)
    }

    pub fn get_current(&mut self) -> Result<Pair<'_>> {
        if !self.inner.initialized || self.inner.eof || self.inner.del_pending {
            return Ok(None);
        }
        let tree = self.tree()?;
        current_pair(&*self.txn, &tree, &self.inner)
    }

    pub fn get_both(&mut self, key: &[u8], value: &[u8]) -> Result<Pair<'_>> {
        let tree = self.tree()?;
        op_get_both(&*self.txn, &tree, &mut self.inner, key, value, true)
    }

    pub fn get_both_range(&mut self, key: &[u8], value: &[u8]) -> Result<Pair<'_>> {
        let tree = self.tree()?;
        op_get_both(&*self.txn, &tree, &mut self.inner, key, value, false)
    }

    pub fn next_dup(&mut self) -> Result<Pair<'_>> {
        let tree = self.tree()?;
        if sub_next(&*self.txn, &tree, &mut self.inner)? {
            return current_pair(&*self.txn, &tree, &self.inner);
        }
        Ok(None)
    }

    pub fn count(&mut self) -> Result<u64> {
        if !self.inner.initialized || self.inner.eof {
            return Err(Error::BadTxn);
        }
        let tree = self.tree()?;
        dup_count(&*self.txn, &tree, &self.inner)
    }

    /// Store an entry through the cursor; the cursor ends up positioned
    /// on the stored entry.
    pub fn put(&mut self, key: &[u8], value: &[u8], flags: WriteFlags) -> Result<()> {
        if flags.contains(WriteFlags::RESERVE) || flags.contains(WriteFlags::MULTIPLE) {
            return Err(Error::Incompatible);
        }
        let dbi = self.dbi;
        if flags.contains(WriteFlags::CURRENT) {
            return self.put_current(key, value);
        }
        self.txn.write_op(|txn| {
            ops::tree_put(
                txn,
                dbi,
                key,
                ValueSource::Bytes(value),
                flags - WriteFlags::CURRENT,
            )
            .map(|_| ())
        })?;
        self.reseek(key, Some(value))
    }

    /// Replace the entry at the cursor position.
    fn put_current(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        if !self.inner.initialized || self.inner.eof {
            return Err(Error::BadTxn);
        }
        let tree = self.tree()?;
        let current = current_key(&*self.txn, &tree, &self.inner)?.to_vec();
        if !key.is_empty() && !tree.key_cmp.compare(key, &current).is_eq() {
            return Err(Error::Incompatible);
        }
        let dbi = self.dbi;
        if tree.flags.contains(DbFlags::DUP_SORT) {
            let old = current_value(&*self.txn, &tree, &self.inner)?.to_vec();
            self.txn.write_op(|txn| {
                ops::tree_del(txn, dbi, &current, Some(&old))?;
                ops::tree_put(
                    txn,
                    dbi,
                    &current,
                    ValueSource::Bytes(value),
                    WriteFlags::empty(),
                )
                .map(|_| ())
            })?;
        } else {
            self.txn.write_op(|txn| {
                ops::tree_put(
                    txn,
                    dbi,
                    &current,
                    ValueSource::Bytes(value),
                    WriteFlags::empty(),
                )
                .map(|_| ())
            })?;
        }
        self.reseek(&current, Some(value))
    }

    /// Delete the entry at the cursor position; with `all_duplicates`,
    /// every duplicate of the current key.
    pub fn del(&mut self, all_duplicates: bool) -> Result<()> {
        if !self.inner.initialized || self.inner.eof || self.inner.del_pending {
            return Err(Error::BadTxn);
        }
        let tree = self.tree()?;
        let key = current_key(&*self.txn, &tree, &self.inner)?.to_vec();
        let dup_value = if tree.flags.contains(DbFlags::DUP_SORT) && !all_duplicates {
            Some(current_value(&*self.txn, &tree, &self.inner)?.to_vec())
        } else {
            None
        };
        let dbi = self.dbi;
        self.txn
            .write_op(|txn| ops::tree_del(txn, dbi, &key, dup_value.as_deref()))?;

        // Park on the successor so the following `next` yields it.
        let tree = self.tree()?;
        let found = if let Some(old) = &dup_value {
            match op_get_both(&*self.txn, &tree, &mut self.inner, &key, old, false)? {
                Some(_) => true,
                // No duplicate at-or-after the deleted one. If the key
                // survived, the successor is the next key; otherwise
                // whatever now sorts at the key's position.
                None => match op_set(&*self.txn, &tree, &mut self.inner, &key)? {
                    Some(_) => {
                        if path_next(&*self.txn, &tree, &mut self.inner.path)? {
                            init_sub(&*self.txn, &tree, &mut self.inner, true)?;
                            true
                        } else {
                            false
                        }
                    }
                    None => op_set_range(&*self.txn, &tree, &mut self.inner, &key)?.is_some(),
                },
            }
        } else {
            op_set_range(&*self.txn, &tree, &mut self.inner, &key)?.is_some()
        };
        if found {
            self.inner.del_pending = true;
        } else {
            self.inner.initialized = true;
            self.inner.eof = true;
        }
        Ok(())
    }

    /// Store many fixed-size duplicates from one packed buffer; returns
    /// how many were processed.
    pub fn put_multiple(&mut self, key: &[u8], data: &[u8], size: usize) -> Result<u64> {
        let tree = self.tree()?;
        if !tree.flags.contains(DbFlags::DUP_FIXED) || size == 0 || data.len() % size != 0 {
            return Err(Error::Incompatible);
        }
        let dbi = self.dbi;
        let count = (data.len() / size) as u64;
        self.txn.write_op(|txn| {
            for chunk in data.chunks_exact(size) {
                ops::tree_put(txn, dbi, key, ValueSource::Bytes(chunk), WriteFlags::empty())?;
            }
            Ok(())
        })?;
        self.reseek(key, None)?;
        Ok(count)
    }

    /// Re-establish a coherent position after a structural change.
    fn reseek(&mut self, key: &[u8], value: Option<&[u8]>) -> Result<()> {
        let tree = self.tree()?;
        let found = match value {
            Some(value) if tree.flags.contains(DbFlags::DUP_SORT) => {
                op_get_both(&*self.txn, &tree, &mut self.inner, key, value, true)?.is_some()
            }
            _ => op_set(&*self.txn, &tree, &mut self.inner, key)?.is_some(),
        };
        if !found {
            // The entry must exist right after we stored it.
            return Err(Error::Problem("cursor lost its entry after a write"));
        }
        Ok(())
    }
}
