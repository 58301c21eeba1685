//! # Tree Operations
//!
//! Search, insert, delete, split, merge and rebalance, plus the
//! duplicate-value machinery (embedded sub-pages and promoted sub-trees)
//! and the page walks the cursor layer builds on.
//!
//! Write operations follow one discipline: descend to the position, then
//! copy-on-write the whole path ([`touch`]), then mutate only dirty pages.
//! Structural changes (split, merge, steal, root collapse) rebuild pages
//! from an owned scratch copy of their node list instead of shuffling
//! bytes in place; after such a change the path that led there is stale
//! and callers that keep a cursor re-seek by key.

use zerocopy::IntoBytes;

use crate::btree::{search_branch, search_leaf, Path};
use crate::db::Dbi;
use crate::error::{Error, Result};
use crate::flags::{DbFlags, NodeFlags, PageFlags, WriteFlags};
use crate::storage::{
    node_footprint, overflow_pages_for, Db, NodePayload, PageHeader, PageMut, PageView,
    FILL_THRESHOLD, MAIN_DBI, MAX_KEY_SIZE, NODE_MAX, PAGE_HDR_SIZE, PAGE_SIZE, PGNO_INVALID,
};
use crate::txn::{tree_ref, RwTxn, Transaction, TreeRef};

/// What a `put` stores.
pub(crate) enum ValueSource<'a> {
    Bytes(&'a [u8]),
    /// Zero-filled space the caller writes afterwards.
    Reserve(usize),
}

impl ValueSource<'_> {
    pub(crate) fn len(&self) -> usize {
        match self {
            ValueSource::Bytes(bytes) => bytes.len(),
            ValueSource::Reserve(len) => *len,
        }
    }
}

/// Where a `put` landed, for resolving `RESERVE` slices.
#[derive(Debug, Clone, Copy)]
pub(crate) enum PutLocation {
    Inline { pgno: u64, idx: usize },
    Overflow { pgno: u64, len: usize },
}

/// Outcome of a descent.
#[derive(Debug, Clone, Copy)]
pub(crate) enum SeekResult {
    /// The tree has no root.
    Empty,
    /// Path filled down to a leaf; `exact` only meaningful for key goals.
    At { exact: bool },
}

#[derive(Clone, Copy)]
pub(crate) enum Goal<'a> {
    Key(&'a [u8]),
    First,
    Last,
}

// ---------------------------------------------------------------------------
// Descent and reads
// ---------------------------------------------------------------------------

pub(crate) fn descend<T: Transaction + ?Sized>(
    txn: &T,
    tree: &TreeRef,
    goal: Goal<'_>,
    path: &mut Path,
) -> Result<SeekResult> {
    path.clear();
    let mut pgno = tree.db.root();
    if pgno == PGNO_INVALID {
        return Ok(SeekResult::Empty);
    }
    loop {
        let view = PageView::new(txn.page_bytes(pgno)?);
        if view.is_branch() {
            let idx = match goal {
                Goal::Key(key) => search_branch(view, tree.key_cmp, key)?,
                Goal::First => 0,
                Goal::Last => view.num_keys() - 1,
            };
            let child = view.node(idx)?.child_pgno();
            path.push(pgno, idx)?;
            pgno = child;
        } else if view.is_leaf() {
            let num = view.num_keys();
            let (idx, exact) = match goal {
                Goal::Key(key) => {
                    search_leaf(view, tree.key_cmp, key, tree.db.leaf2_ksize())?
                }
                Goal::First => (0, num > 0),
                Goal::Last => (num.saturating_sub(1), num > 0),
            };
            path.push(pgno, idx)?;
            return Ok(SeekResult::At { exact });
        } else {
            return Err(Error::Corrupted);
        }
    }
}

/// Step the leaf position to the adjacent leaf in `forward` direction,
/// descending the edge of the nearest ancestor with another child.
pub(crate) fn move_sibling<T: Transaction + ?Sized>(
    txn: &T,
    tree: &TreeRef,
    path: &mut Path,
    forward: bool,
) -> Result<bool> {
    let mut level = path.len();
    while level > 1 {
        let parent = path.entries[level - 2];
        let pview = PageView::new(txn.page_bytes(parent.pgno)?);
        let num = pview.num_keys();
        let next_idx = if forward {
            (parent.idx + 1 < num).then_some(parent.idx + 1)
        } else {
            parent.idx.checked_sub(1)
        };
        if let Some(idx) = next_idx {
            let child = pview.node(idx)?.child_pgno();
            path.entries.truncate(level - 1);
            path.entries[level - 2].idx = idx;
            descend_edge(txn, tree, path, child, forward)?;
            return Ok(true);
        }
        level -= 1;
    }
    Ok(false)
}

fn descend_edge<T: Transaction + ?Sized>(
    txn: &T,
    _tree: &TreeRef,
    path: &mut Path,
    mut pgno: u64,
    leftmost: bool,
) -> Result<()> {
    loop {
        let view = PageView::new(txn.page_bytes(pgno)?);
        let idx = if leftmost {
            0
        } else {
            view.num_keys().saturating_sub(1)
        };
        path.push(pgno, idx)?;
        if !view.is_branch() {
            return Ok(());
        }
        pgno = view.node(idx)?.child_pgno();
    }
}

/// Resolve the value of the leaf node at `idx`, following overflow runs
/// and descending into duplicate storage (first duplicate in order).
pub(crate) fn leaf_value<'t, T: Transaction + ?Sized>(
    txn: &'t T,
    tree: &TreeRef,
    leaf_bytes: &'t [u8],
    idx: usize,
) -> Result<&'t [u8]> {
    let view = PageView::new(leaf_bytes);
    if view.is_leaf2() {
        // Sub-tree leaves: the key is the value.
        return view.leaf2_key(idx, tree.db.leaf2_ksize());
    }
    let node = view.node(idx)?;
    let flags = node.flags();
    if flags.contains(NodeFlags::BIG_DATA) {
        let run = txn.overflow_bytes(node.overflow_pgno()?)?;
        let size = node.data_size();
        if PAGE_HDR_SIZE + size > run.len() {
            return Err(Error::Corrupted);
        }
        return Ok(&run[PAGE_HDR_SIZE..PAGE_HDR_SIZE + size]);
    }
    if flags.contains(NodeFlags::DUP_DATA) {
        if flags.contains(NodeFlags::SUB_DATA) {
            let db = Db::from_bytes(node.data()?)?;
            return sub_edge_value(txn, tree, db, true);
        }
        let sub = PageView::new(node.data()?);
        return sub.key(0, sub_leaf2_ksize(&sub, tree));
    }
    node.data()
}

/// First or last value of a promoted duplicate sub-tree.
pub(crate) fn sub_edge_value<'t, T: Transaction + ?Sized>(
    txn: &'t T,
    tree: &TreeRef,
    db: Db,
    first: bool,
) -> Result<&'t [u8]> {
    let sub = sub_tree_ref(tree, db);
    let mut path = Path::new();
    let goal = if first { Goal::First } else { Goal::Last };
    match descend(txn, &sub, goal, &mut path)? {
        SeekResult::Empty => Err(Error::Corrupted),
        SeekResult::At { .. } => {
            let leaf = path.leaf().ok_or(Error::Corrupted)?;
            let view = PageView::new(txn.page_bytes(leaf.pgno)?);
            if view.num_keys() == 0 {
                return Err(Error::Corrupted);
            }
            view.key(leaf.idx, sub.db.leaf2_ksize())
        }
    }
}

pub(crate) fn sub_tree_ref(tree: &TreeRef, db: Db) -> TreeRef {
    TreeRef {
        dbi: tree.dbi,
        db,
        flags: DbFlags::empty(),
        key_cmp: tree.dup_cmp,
        dup_cmp: tree.dup_cmp,
        sub: true,
    }
}

fn sub_leaf2_ksize(sub: &PageView<'_>, tree: &TreeRef) -> usize {
    if sub.is_leaf2() {
        tree.db.leaf2_ksize()
    } else {
        0
    }
}

pub(crate) fn tree_get<'t, T: Transaction + ?Sized>(
    txn: &'t T,
    tree: &TreeRef,
    key: &[u8],
) -> Result<Option<&'t [u8]>> {
    let mut path = Path::new();
    match descend(txn, tree, Goal::Key(key), &mut path)? {
        SeekResult::At { exact: true } => {
            let leaf = path.leaf().ok_or(Error::Corrupted)?;
            let bytes = txn.page_bytes(leaf.pgno)?;
            leaf_value(txn, tree, bytes, leaf.idx).map(Some)
        }
        _ => Ok(None),
    }
}

/// Load the descriptor of a named database from its name record.
pub(crate) fn tree_get_descriptor<T: Transaction + ?Sized>(
    txn: &T,
    main: &TreeRef,
    name: &[u8],
) -> Result<Option<Db>> {
    let mut path = Path::new();
    match descend(txn, main, Goal::Key(name), &mut path)? {
        SeekResult::At { exact: true } => {
            let leaf = path.leaf().ok_or(Error::Corrupted)?;
            let view = PageView::new(txn.page_bytes(leaf.pgno)?);
            let node = view.node(leaf.idx)?;
            if !node.flags().contains(NodeFlags::SUB_DATA)
                || node.flags().contains(NodeFlags::DUP_DATA)
            {
                return Err(Error::Incompatible);
            }
            Db::from_bytes(node.data()?).map(Some)
        }
        _ => Ok(None),
    }
}

/// Owned (key, value) at or after `key`; used by the free-list harvester.
pub(crate) fn tree_seek_range_owned<T: Transaction + ?Sized>(
    txn: &T,
    dbi: Dbi,
    key: &[u8],
) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
    let tree = tree_ref(txn, dbi)?;
    let mut path = Path::new();
    if matches!(
        descend(txn, &tree, Goal::Key(key), &mut path)?,
        SeekResult::Empty
    ) {
        return Ok(None);
    }
    let leaf = path.leaf().ok_or(Error::Corrupted)?;
    let num = PageView::new(txn.page_bytes(leaf.pgno)?).num_keys();
    if leaf.idx >= num && !move_sibling(txn, &tree, &mut path, true)? {
        return Ok(None);
    }
    read_owned_pair(txn, &tree, &path).map(Some)
}

/// Owned first (key, value); used by the free-list save loop.
pub(crate) fn tree_first_owned<T: Transaction + ?Sized>(
    txn: &T,
    dbi: Dbi,
) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
    let tree = tree_ref(txn, dbi)?;
    let mut path = Path::new();
    match descend(txn, &tree, Goal::First, &mut path)? {
        SeekResult::At { exact: true } => read_owned_pair(txn, &tree, &path).map(Some),
        _ => Ok(None),
    }
}

fn read_owned_pair<T: Transaction + ?Sized>(
    txn: &T,
    tree: &TreeRef,
    path: &Path,
) -> Result<(Vec<u8>, Vec<u8>)> {
    let leaf = path.leaf().ok_or(Error::Corrupted)?;
    let bytes = txn.page_bytes(leaf.pgno)?;
    let view = PageView::new(bytes);
    let key = view.key(leaf.idx, tree.db.leaf2_ksize())?.to_vec();
    let value = leaf_value(txn, tree, bytes, leaf.idx)?.to_vec();
    Ok((key, value))
}

// ---------------------------------------------------------------------------
// Copy-on-write
// ---------------------------------------------------------------------------

/// Shadow every page on the path that is not yet this transaction's own,
/// rewriting the parent child pointers (or the root) as page numbers move.
pub(crate) fn touch(txn: &mut RwTxn<'_>, tree: &mut TreeRef, path: &mut Path) -> Result<()> {
    for level in 0..path.len() {
        let pgno = path.entries[level].pgno;
        if txn.is_dirty(pgno) {
            continue;
        }
        let new_pgno = txn.shadow_page(pgno)?;
        if new_pgno == pgno {
            continue;
        }
        if level == 0 {
            tree.db.set_root(new_pgno);
        } else {
            let parent = path.entries[level - 1];
            let bytes = txn.page_mut(parent.pgno)?;
            PageMut::new(bytes).set_child_pgno(parent.idx, new_pgno)?;
        }
        path.entries[level].pgno = new_pgno;
    }
    Ok(())
}

/// Shadow a page reached from a known parent slot rather than the cursor
/// path (sibling pages during rebalance).
fn shadow_child(
    txn: &mut RwTxn<'_>,
    parent_pgno: u64,
    idx_in_parent: usize,
    child: u64,
) -> Result<u64> {
    if txn.is_dirty(child) {
        return Ok(child);
    }
    let new_pgno = txn.shadow_page(child)?;
    if new_pgno != child {
        let bytes = txn.page_mut(parent_pgno)?;
        PageMut::new(bytes).set_child_pgno(idx_in_parent, new_pgno)?;
    }
    Ok(new_pgno)
}

// ---------------------------------------------------------------------------
// Put
// ---------------------------------------------------------------------------

pub(crate) fn tree_put(
    txn: &mut RwTxn<'_>,
    dbi: Dbi,
    key: &[u8],
    value: ValueSource<'_>,
    flags: WriteFlags,
) -> Result<PutLocation> {
    let mut tree = tree_ref(txn, dbi)?;
    let mut path = Path::new();
    let location = put_at(txn, &mut tree, &mut path, key, value, flags, NodeFlags::empty())?;
    txn.set_db(dbi, tree.db);
    Ok(location)
}

/// Store a named-database descriptor record in the main database.
pub(crate) fn tree_put_descriptor(txn: &mut RwTxn<'_>, name: &[u8], db: &Db) -> Result<()> {
    let mut tree = tree_ref(txn, MAIN_DBI)?;
    let mut path = Path::new();
    put_at(
        txn,
        &mut tree,
        &mut path,
        name,
        ValueSource::Bytes(db.as_bytes()),
        WriteFlags::empty(),
        NodeFlags::SUB_DATA,
    )?;
    txn.set_db(MAIN_DBI, tree.db);
    Ok(())
}

pub(crate) fn put_at(
    txn: &mut RwTxn<'_>,
    tree: &mut TreeRef,
    path: &mut Path,
    key: &[u8],
    value: ValueSource<'_>,
    flags: WriteFlags,
    extra_nflags: NodeFlags,
) -> Result<PutLocation> {
    validate_put(tree, key, &value)?;
    if !tree.sub {
        // Sub-tree puts run inside an outer operation that already
        // reserved room; spilling here would evict held pages.
        let reserve = overflow_pages_for(value.len()) as usize;
        txn.ensure_dirty_room(2 * tree.db.depth() as usize + 8 + reserve)?;
    }

    let dupsort = tree.flags.contains(DbFlags::DUP_SORT) && extra_nflags.is_empty();
    let append = flags.contains(WriteFlags::APPEND);

    let goal = if append { Goal::Last } else { Goal::Key(key) };
    let seek = descend(txn, tree, goal, path)?;

    let (insert_idx, exact, append_bias) = match seek {
        SeekResult::Empty => {
            new_root_leaf(txn, tree)?;
            path.clear();
            path.push(tree.db.root(), 0)?;
            (0, false, false)
        }
        SeekResult::At { exact } if append => {
            let leaf = path.leaf().ok_or(Error::Corrupted)?;
            if !exact {
                // Empty leaf can only be an empty root.
                (0, false, false)
            } else {
                let view = PageView::new(txn.page_bytes(leaf.pgno)?);
                let last = view.key(leaf.idx, tree.db.leaf2_ksize())?;
                match tree.key_cmp.compare(key, last) {
                    std::cmp::Ordering::Greater => (leaf.idx + 1, false, true),
                    std::cmp::Ordering::Equal => (leaf.idx, true, false),
                    std::cmp::Ordering::Less => return Err(Error::KeyExist),
                }
            }
        }
        SeekResult::At { exact } => {
            let leaf = path.leaf().ok_or(Error::Corrupted)?;
            (leaf.idx, exact, false)
        }
    };
    if let Some(entry) = path.leaf_mut() {
        entry.idx = insert_idx;
    }

    touch(txn, tree, path)?;

    if exact {
        if flags.contains(WriteFlags::NO_OVERWRITE) {
            return Err(Error::KeyExist);
        }
        if append && !flags.contains(WriteFlags::APPEND_DUP) {
            return Err(Error::KeyExist);
        }
        if dupsort {
            return dup_put(txn, tree, path, key, value, flags);
        }
        return overwrite_at(txn, tree, path, key, value, extra_nflags);
    }

    let location = insert_fresh(txn, tree, path, insert_idx, key, value, extra_nflags, append_bias)?;
    tree.db.add_entries(1);
    Ok(location)
}

fn validate_put(tree: &TreeRef, key: &[u8], value: &ValueSource<'_>) -> Result<()> {
    if key.is_empty() || key.len() > MAX_KEY_SIZE {
        return Err(Error::BadValSize);
    }
    let vlen = value.len();
    if tree.sub {
        // Sub-tree keys are duplicate values; data is always empty.
        debug_assert_eq!(vlen, 0);
        let ksize = tree.db.leaf2_ksize();
        if ksize > 0 && key.len() != ksize {
            return Err(Error::BadValSize);
        }
        return Ok(());
    }
    if tree.flags.contains(DbFlags::DUP_SORT) {
        if vlen > MAX_KEY_SIZE {
            return Err(Error::BadValSize);
        }
        let ksize = tree.db.leaf2_ksize();
        if tree.flags.contains(DbFlags::DUP_FIXED) && ksize > 0 && vlen != ksize {
            return Err(Error::BadValSize);
        }
        if matches!(value, ValueSource::Reserve(_)) {
            return Err(Error::Incompatible);
        }
    } else if vlen > u32::MAX as usize - PAGE_SIZE {
        return Err(Error::BadValSize);
    }
    Ok(())
}

fn new_root_leaf(txn: &mut RwTxn<'_>, tree: &mut TreeRef) -> Result<()> {
    let pgno = txn.alloc_dirty(1)?;
    let mut flags = PageFlags::LEAF | PageFlags::DIRTY;
    if tree.sub && tree.db.leaf2_ksize() > 0 {
        flags |= PageFlags::LEAF2;
    }
    let bytes = txn.page_mut(pgno)?;
    PageHeader::init(bytes, pgno, flags);
    tree.db.set_root(pgno);
    tree.db.set_depth(1);
    tree.db.add_leaf_pages(1);
    Ok(())
}

/// Insert a brand-new node at `idx` of the path's leaf, splitting as
/// needed. Returns the final location of the inserted node.
#[allow(clippy::too_many_arguments)]
fn insert_fresh(
    txn: &mut RwTxn<'_>,
    tree: &mut TreeRef,
    path: &mut Path,
    idx: usize,
    key: &[u8],
    value: ValueSource<'_>,
    extra_nflags: NodeFlags,
    append_bias: bool,
) -> Result<PutLocation> {
    let leaf = path.leaf().ok_or(Error::Corrupted)?;
    let is_leaf2 = PageView::new(txn.page_bytes(leaf.pgno)?).is_leaf2();

    if is_leaf2 {
        let inserted = {
            let bytes = txn.page_mut(leaf.pgno)?;
            PageMut::new(bytes).leaf2_insert(idx, key)
        };
        return match inserted {
            Ok(()) => Ok(PutLocation::Inline {
                pgno: leaf.pgno,
                idx,
            }),
            Err(Error::PageFull) => {
                let node = OwnedNode {
                    key: key.to_vec(),
                    data: Vec::new(),
                    flags: NodeFlags::empty(),
                    data_size_override: None,
                    child: 0,
                };
                let (pgno, idx) = split_insert(txn, tree, path, path.len() - 1, node, idx, append_bias)?;
                Ok(PutLocation::Inline { pgno, idx })
            }
            Err(e) => Err(e),
        };
    }

    // Values too big for a node go to an overflow run; the node keeps the
    // run's first page number.
    let vlen = value.len();
    let mut nflags = extra_nflags;
    let mut overflow_loc = None;
    let (payload_bytes, payload): (Vec<u8>, NodePayload<'_>) =
        if node_footprint(key.len(), vlen) > NODE_MAX {
            let count = overflow_pages_for(vlen);
            let opgno = txn.alloc_dirty(count)?;
            {
                let run = txn.page_run_mut(opgno)?;
                PageHeader::init(run, opgno, PageFlags::OVERFLOW | PageFlags::DIRTY);
                PageHeader::from_bytes_mut(run).set_overflow_pages(count as u32);
                if let ValueSource::Bytes(bytes) = &value {
                    run[PAGE_HDR_SIZE..PAGE_HDR_SIZE + vlen].copy_from_slice(bytes);
                }
            }
            tree.db.add_overflow_pages(count as i64);
            nflags |= NodeFlags::BIG_DATA;
            overflow_loc = Some(PutLocation::Overflow {
                pgno: opgno,
                len: vlen,
            });
            // The node's data-size field still records the value length.
            (opgno.to_le_bytes().to_vec(), NodePayload::Overflow(opgno))
        } else {
            match value {
                ValueSource::Bytes(bytes) => (bytes.to_vec(), NodePayload::Inline(bytes)),
                ValueSource::Reserve(len) => (vec![0u8; len], NodePayload::Reserve(len)),
            }
        };

    let inserted = {
        let bytes = txn.page_mut(leaf.pgno)?;
        PageMut::new(bytes).insert_node(idx, key, &payload, nflags)
    };
    match inserted {
        Ok(()) => {
            if nflags.contains(NodeFlags::BIG_DATA) {
                fix_overflow_size(txn, leaf.pgno, idx, vlen)?;
                return Ok(overflow_loc.unwrap());
            }
            Ok(PutLocation::Inline {
                pgno: leaf.pgno,
                idx,
            })
        }
        Err(Error::PageFull) => {
            let node = OwnedNode {
                key: key.to_vec(),
                data: payload_bytes,
                flags: nflags,
                data_size_override: nflags.contains(NodeFlags::BIG_DATA).then_some(vlen),
                child: 0,
            };
            let (pgno, idx) = split_insert(txn, tree, path, path.len() - 1, node, idx, append_bias)?;
            if nflags.contains(NodeFlags::BIG_DATA) {
                fix_overflow_size(txn, pgno, idx, vlen)?;
                return Ok(overflow_loc.unwrap());
            }
            Ok(PutLocation::Inline { pgno, idx })
        }
        Err(e) => Err(e),
    }
}

/// A `BIG_DATA` node's data-size field records the overflow value length,
/// not the 8 bytes stored inline; patch it after insertion.
fn fix_overflow_size(txn: &mut RwTxn<'_>, pgno: u64, idx: usize, vlen: usize) -> Result<()> {
    let bytes = txn.page_mut(pgno)?;
    patch_data_size(bytes, idx, vlen)
}

/// Replace the value of an existing non-duplicate key.
fn overwrite_at(
    txn: &mut RwTxn<'_>,
    tree: &mut TreeRef,
    path: &mut Path,
    key: &[u8],
    value: ValueSource<'_>,
    extra_nflags: NodeFlags,
) -> Result<PutLocation> {
    let leaf = path.leaf().ok_or(Error::Corrupted)?;
    let (old_flags, old_size, old_overflow) = {
        let view = PageView::new(txn.page_bytes(leaf.pgno)?);
        let node = view.node(leaf.idx)?;
        let flags = node.flags();
        let overflow = flags
            .contains(NodeFlags::BIG_DATA)
            .then(|| node.overflow_pgno())
            .transpose()?;
        (flags, node.data_size(), overflow)
    };

    if old_flags.contains(NodeFlags::DUP_DATA) {
        return Err(Error::Incompatible);
    }

    let vlen = value.len();
    let new_inline = node_footprint(key.len(), vlen) <= NODE_MAX;

    // Same-size inline replacement happens in place.
    if new_inline && old_overflow.is_none() && old_size == vlen {
        if let ValueSource::Bytes(bytes) = &value {
            let page = txn.page_mut(leaf.pgno)?;
            PageMut::new(page).overwrite_data(leaf.idx, bytes)?;
        }
        return Ok(PutLocation::Inline {
            pgno: leaf.pgno,
            idx: leaf.idx,
        });
    }

    // A same-size overflow value whose run this transaction already owns
    // is rewritten inside the run.
    if let Some(opgno) = old_overflow {
        if !new_inline && old_size == vlen && txn.is_dirty(opgno) {
            if let ValueSource::Bytes(bytes) = &value {
                let run = txn.page_run_mut(opgno)?;
                run[PAGE_HDR_SIZE..PAGE_HDR_SIZE + vlen].copy_from_slice(bytes);
            }
            return Ok(PutLocation::Overflow {
                pgno: opgno,
                len: vlen,
            });
        }
    }

    if let Some(opgno) = old_overflow {
        free_overflow(txn, tree, opgno)?;
    }
    {
        let page = txn.page_mut(leaf.pgno)?;
        PageMut::new(page).delete_node(leaf.idx)?;
    }
    insert_fresh(txn, tree, path, leaf.idx, key, value, extra_nflags, false)
}

fn free_overflow(txn: &mut RwTxn<'_>, tree: &mut TreeRef, pgno: u64) -> Result<()> {
    let count = {
        let bytes = txn.page_bytes(pgno)?;
        let header = PageHeader::from_bytes(bytes);
        if !header.flags().contains(PageFlags::OVERFLOW) {
            return Err(Error::Corrupted);
        }
        header.overflow_pages() as u64
    };
    txn.free_run(pgno, count);
    tree.db.add_overflow_pages(-(count as i64));
    Ok(())
}

// ---------------------------------------------------------------------------
// Split
// ---------------------------------------------------------------------------

#[derive(Clone)]
struct OwnedNode {
    key: Vec<u8>,
    data: Vec<u8>,
    flags: NodeFlags,
    /// `BIG_DATA` nodes carry the value length here, not `data.len()`.
    data_size_override: Option<usize>,
    child: u64,
}

fn collect_nodes(view: PageView<'_>, leaf2_ksize: usize) -> Result<Vec<OwnedNode>> {
    let num = view.num_keys();
    let mut nodes = Vec::with_capacity(num + 1);
    for i in 0..num {
        if view.is_leaf2() {
            nodes.push(OwnedNode {
                key: view.leaf2_key(i, leaf2_ksize)?.to_vec(),
                data: Vec::new(),
                flags: NodeFlags::empty(),
                data_size_override: None,
                child: 0,
            });
        } else {
            let node = view.node(i)?;
            if view.is_branch() {
                nodes.push(OwnedNode {
                    key: node.key().to_vec(),
                    data: Vec::new(),
                    flags: NodeFlags::empty(),
                    data_size_override: None,
                    child: node.child_pgno(),
                });
            } else {
                let flags = node.flags();
                // Overflow references store 8 bytes but size the value.
                let (data, data_size_override) = if flags.contains(NodeFlags::BIG_DATA) {
                    (
                        node.overflow_pgno()?.to_le_bytes().to_vec(),
                        Some(node.data_size()),
                    )
                } else {
                    (node.data()?.to_vec(), None)
                };
                nodes.push(OwnedNode {
                    key: node.key().to_vec(),
                    data,
                    flags,
                    data_size_override,
                    child: 0,
                });
            }
        }
    }
    Ok(nodes)
}

fn rebuild_page(
    buf: &mut [u8],
    pgno: u64,
    flags: PageFlags,
    nodes: &[OwnedNode],
    is_branch: bool,
) -> Result<()> {
    PageHeader::init(buf, pgno, flags);
    let mut page = PageMut::new(buf);
    for (i, node) in nodes.iter().enumerate() {
        if flags.contains(PageFlags::LEAF2) {
            page.leaf2_insert(i, &node.key)?;
        } else if is_branch {
            page.insert_node(i, &node.key, &NodePayload::Child(node.child), NodeFlags::empty())?;
        } else {
            page.insert_node(i, &node.key, &NodePayload::Inline(&node.data), node.flags)?;
            if let Some(size) = node.data_size_override {
                patch_data_size(page.bytes_mut(), i, size)?;
            }
        }
    }
    Ok(())
}

fn patch_data_size(bytes: &mut [u8], idx: usize, size: usize) -> Result<()> {
    let at = PAGE_HDR_SIZE + idx * 2;
    let off = u16::from_le_bytes([bytes[at], bytes[at + 1]]) as usize;
    bytes[off..off + 2].copy_from_slice(&((size & 0xffff) as u16).to_le_bytes());
    bytes[off + 2..off + 4].copy_from_slice(&((size >> 16) as u16).to_le_bytes());
    Ok(())
}

/// Split the page at `level`, inserting `new_node` at `insert_idx`.
/// Exactly one separator is promoted per split; the parent may split
/// recursively. Returns the inserted node's final (page, index). The path
/// is stale afterwards.
fn split_insert(
    txn: &mut RwTxn<'_>,
    tree: &mut TreeRef,
    path: &mut Path,
    level: usize,
    new_node: OwnedNode,
    insert_idx: usize,
    append_bias: bool,
) -> Result<(u64, usize)> {
    let entry = path.entries[level];
    let (page_flags, is_branch) = {
        let view = PageView::new(txn.page_bytes(entry.pgno)?);
        (view.flags(), view.is_branch())
    };
    let leaf2_ksize = if page_flags.contains(PageFlags::LEAF2) {
        tree.db.leaf2_ksize()
    } else {
        0
    };

    let mut nodes = {
        let view = PageView::new(txn.page_bytes(entry.pgno)?);
        collect_nodes(view, leaf2_ksize)?
    };
    nodes.insert(insert_idx, new_node);
    let total = nodes.len();

    // Ordered appends split at the insertion point so the left page stays
    // full; a key landing on the last slot gets the same treatment.
    let split_idx = if append_bias || insert_idx + 1 == total {
        insert_idx
    } else {
        total / 2
    }
    .clamp(1, total - 1);

    let right_pgno = txn.alloc_dirty(1)?;
    let mut separator = nodes[split_idx].key.clone();
    if is_branch {
        nodes[split_idx].key.clear();
    }

    {
        let buf = txn.page_mut(entry.pgno)?;
        rebuild_page(buf, entry.pgno, page_flags | PageFlags::DIRTY, &nodes[..split_idx], is_branch)?;
    }
    {
        let buf = txn.page_mut(right_pgno)?;
        rebuild_page(buf, right_pgno, page_flags | PageFlags::DIRTY, &nodes[split_idx..], is_branch)?;
    }
    if is_branch {
        tree.db.add_branch_pages(1);
    } else {
        tree.db.add_leaf_pages(1);
    }

    if level == 0 {
        let root_pgno = txn.alloc_dirty(1)?;
        {
            let buf = txn.page_mut(root_pgno)?;
            PageHeader::init(buf, root_pgno, PageFlags::BRANCH | PageFlags::DIRTY);
            let mut page = PageMut::new(buf);
            page.insert_node(0, b"", &NodePayload::Child(entry.pgno), NodeFlags::empty())?;
            page.insert_node(1, &separator, &NodePayload::Child(right_pgno), NodeFlags::empty())?;
        }
        tree.db.set_root(root_pgno);
        tree.db.bump_depth(1);
        tree.db.add_branch_pages(1);
    } else {
        let parent = path.entries[level - 1];
        let parent_idx = parent.idx + 1;
        let inserted = {
            let buf = txn.page_mut(parent.pgno)?;
            PageMut::new(buf).insert_node(
                parent_idx,
                &separator,
                &NodePayload::Child(right_pgno),
                NodeFlags::empty(),
            )
        };
        match inserted {
            Ok(()) => {}
            Err(Error::PageFull) => {
                let sep_node = OwnedNode {
                    key: std::mem::take(&mut separator),
                    data: Vec::new(),
                    flags: NodeFlags::empty(),
                    data_size_override: None,
                    child: right_pgno,
                };
                split_insert(txn, tree, path, level - 1, sep_node, parent_idx, false)?;
            }
            Err(e) => return Err(e),
        }
    }

    Ok(if insert_idx >= split_idx {
        (right_pgno, insert_idx - split_idx)
    } else {
        (entry.pgno, insert_idx)
    })
}

// ---------------------------------------------------------------------------
// Delete and rebalance
// ---------------------------------------------------------------------------

pub(crate) fn tree_del(
    txn: &mut RwTxn<'_>,
    dbi: Dbi,
    key: &[u8],
    value: Option<&[u8]>,
) -> Result<()> {
    let mut tree = tree_ref(txn, dbi)?;
    let mut path = Path::new();
    match descend(txn, &tree, Goal::Key(key), &mut path)? {
        SeekResult::At { exact: true } => {}
        _ => return Err(Error::NotFound),
    }
    txn.ensure_dirty_room(2 * tree.db.depth() as usize + 8)?;
    touch(txn, &mut tree, &mut path)?;
    let dup_value = if tree.flags.contains(DbFlags::DUP_SORT) {
        value
    } else {
        None
    };
    del_at(txn, &mut tree, &mut path, dup_value)?;
    txn.set_db(dbi, tree.db);
    Ok(())
}

/// Delete at the (already touched) leaf position: one duplicate when
/// `dup_value` is given, the whole key otherwise.
pub(crate) fn del_at(
    txn: &mut RwTxn<'_>,
    tree: &mut TreeRef,
    path: &mut Path,
    dup_value: Option<&[u8]>,
) -> Result<()> {
    let leaf = path.leaf().ok_or(Error::Corrupted)?;

    enum Shape {
        Leaf2,
        Plain { value: Vec<u8>, overflow: Option<u64> },
        SubPage { bytes: Vec<u8> },
        SubDb { db: Db },
    }
    let shape = {
        let view = PageView::new(txn.page_bytes(leaf.pgno)?);
        if view.is_leaf2() {
            Shape::Leaf2
        } else {
            let node = view.node(leaf.idx)?;
            let flags = node.flags();
            if flags.contains(NodeFlags::DUP_DATA) {
                if flags.contains(NodeFlags::SUB_DATA) {
                    Shape::SubDb {
                        db: Db::from_bytes(node.data()?)?,
                    }
                } else {
                    Shape::SubPage {
                        bytes: node.data()?.to_vec(),
                    }
                }
            } else {
                let overflow = flags
                    .contains(NodeFlags::BIG_DATA)
                    .then(|| node.overflow_pgno())
                    .transpose()?;
                Shape::Plain {
                    value: if overflow.is_some() {
                        Vec::new()
                    } else {
                        node.data()?.to_vec()
                    },
                    overflow,
                }
            }
        }
    };

    match (shape, dup_value) {
        (Shape::Leaf2, _) => {
            remove_leaf_entry(txn, tree, path)?;
            tree.db.add_entries(-1);
        }
        (Shape::Plain { value, .. }, Some(dup)) => {
            if !tree.dup_cmp.compare(&value, dup).is_eq() {
                return Err(Error::NotFound);
            }
            remove_leaf_entry(txn, tree, path)?;
            tree.db.add_entries(-1);
        }
        (Shape::Plain { overflow, .. }, None) => {
            if let Some(opgno) = overflow {
                free_overflow(txn, tree, opgno)?;
            }
            remove_leaf_entry(txn, tree, path)?;
            tree.db.add_entries(-1);
        }
        (Shape::SubPage { bytes }, Some(dup)) => {
            let shrunk = {
                let sub = PageView::new(&bytes);
                let ksize = sub_leaf2_ksize(&sub, tree);
                let (idx, exact) = search_leaf(sub, tree.dup_cmp, dup, ksize)?;
                if !exact {
                    return Err(Error::NotFound);
                }
                if sub.num_keys() == 1 {
                    None
                } else {
                    let mut values = collect_subpage_values(&sub, ksize)?;
                    values.remove(idx);
                    Some(build_subpage(&values, ksize)?)
                }
            };
            match shrunk {
                None => remove_leaf_entry(txn, tree, path)?,
                Some(shrunk) => {
                    let key = current_key_owned(txn, tree, path)?;
                    replace_node_data(txn, tree, path, &key, &shrunk, NodeFlags::DUP_DATA)?;
                }
            }
            tree.db.add_entries(-1);
        }
        (Shape::SubDb { db }, Some(dup)) => {
            let mut sub = sub_tree_ref(tree, db);
            let mut sub_path = Path::new();
            match descend(txn, &sub, Goal::Key(dup), &mut sub_path)? {
                SeekResult::At { exact: true } => {}
                _ => return Err(Error::NotFound),
            }
            touch(txn, &mut sub, &mut sub_path)?;
            del_at(txn, &mut sub, &mut sub_path, None)?;
            tree.db.add_entries(-1);
            if sub.db.root() == PGNO_INVALID {
                remove_leaf_entry(txn, tree, path)?;
            } else {
                let page = txn.page_mut(leaf.pgno)?;
                PageMut::new(page).overwrite_data(leaf.idx, sub.db.as_bytes())?;
            }
        }
        (Shape::SubPage { bytes }, None) => {
            let count = PageView::new(&bytes).num_keys() as i64;
            remove_leaf_entry(txn, tree, path)?;
            tree.db.add_entries(-count);
        }
        (Shape::SubDb { db }, None) => {
            let entries = db.entries() as i64;
            let sub = sub_tree_ref(tree, db);
            free_tree_pages(txn, &sub)?;
            remove_leaf_entry(txn, tree, path)?;
            tree.db.add_entries(-entries);
        }
    }
    Ok(())
}

fn current_key_owned(txn: &RwTxn<'_>, tree: &TreeRef, path: &Path) -> Result<Vec<u8>> {
    let leaf = path.leaf().ok_or(Error::Corrupted)?;
    let view = PageView::new(txn.page_bytes(leaf.pgno)?);
    Ok(view.key(leaf.idx, tree.db.leaf2_ksize())?.to_vec())
}

/// Borrow every value stored in a duplicate sub-page, in order.
fn collect_subpage_values<'a>(
    sub: &PageView<'a>,
    leaf2_ksize: usize,
) -> Result<Vec<&'a [u8]>> {
    let num = sub.num_keys();
    let mut values = Vec::with_capacity(num + 1);
    for i in 0..num {
        values.push(sub.key(i, leaf2_ksize)?);
    }
    Ok(values)
}

/// Remove the node (or packed key) at the path position, then rebalance.
fn remove_leaf_entry(txn: &mut RwTxn<'_>, tree: &mut TreeRef, path: &mut Path) -> Result<()> {
    let leaf = path.leaf().ok_or(Error::Corrupted)?;
    {
        let bytes = txn.page_mut(leaf.pgno)?;
        let mut page = PageMut::new(bytes);
        if page.view().is_leaf2() {
            let ksize = tree.db.leaf2_ksize();
            page.leaf2_delete(leaf.idx, ksize)?;
        } else {
            page.delete_node(leaf.idx)?;
        }
    }
    let top = path.len() - 1;
    rebalance(txn, tree, path, top)
}

fn rebalance(
    txn: &mut RwTxn<'_>,
    tree: &mut TreeRef,
    path: &mut Path,
    level: usize,
) -> Result<()> {
    let entry = path.entries[level];
    let (is_branch, num, fill) = {
        let view = PageView::new(txn.page_bytes(entry.pgno)?);
        (view.is_branch(), view.num_keys(), view.fill_ratio())
    };

    if level == 0 {
        if is_branch && num == 1 {
            // The root has a single child: pull the tree down one level.
            let child = {
                let view = PageView::new(txn.page_bytes(entry.pgno)?);
                view.node(0)?.child_pgno()
            };
            txn.free_run(entry.pgno, 1);
            tree.db.set_root(child);
            tree.db.bump_depth(-1);
            tree.db.add_branch_pages(-1);
            path.entries[0] = crate::btree::PathEntry {
                pgno: child,
                idx: 0,
            };
            return rebalance(txn, tree, path, 0);
        }
        if !is_branch && num == 0 {
            txn.free_run(entry.pgno, 1);
            tree.db.set_root(PGNO_INVALID);
            tree.db.set_depth(0);
            tree.db.add_leaf_pages(-1);
        }
        return Ok(());
    }

    let min_keys = if is_branch { 2 } else { 1 };
    if fill >= FILL_THRESHOLD && num >= min_keys {
        return Ok(());
    }

    let parent_entry = path.entries[level - 1];
    let (from_left, sib_parent_idx) = if parent_entry.idx > 0 {
        (true, parent_entry.idx - 1)
    } else {
        (false, parent_entry.idx + 1)
    };
    let (sib_pgno, separator) = {
        let pview = PageView::new(txn.page_bytes(parent_entry.pgno)?);
        if sib_parent_idx >= pview.num_keys() {
            // Only child; the root case above will deal with the parent.
            return Ok(());
        }
        let right_idx = if from_left {
            parent_entry.idx
        } else {
            sib_parent_idx
        };
        (
            pview.node(sib_parent_idx)?.child_pgno(),
            pview.node(right_idx)?.key().to_vec(),
        )
    };
    let sib_pgno = shadow_child(txn, parent_entry.pgno, sib_parent_idx, sib_pgno)?;

    let usable = PAGE_SIZE - PAGE_HDR_SIZE;
    let (sib_num, sib_used, sib_fill) = {
        let view = PageView::new(txn.page_bytes(sib_pgno)?);
        (
            view.num_keys(),
            usable - view.free_space(),
            view.fill_ratio(),
        )
    };
    let my_used = {
        let view = PageView::new(txn.page_bytes(entry.pgno)?);
        usable - view.free_space()
    };

    let merge_extra = if is_branch {
        2 + node_footprint(separator.len(), 0)
    } else {
        0
    };
    if my_used + sib_used + merge_extra <= usable {
        merge_pages(txn, tree, path, level, sib_pgno, from_left, separator)
    } else if sib_num > min_keys && sib_fill >= FILL_THRESHOLD {
        steal_node(txn, tree, path, level, sib_pgno, from_left, separator, sib_parent_idx)
    } else {
        // Neither merge nor donation is possible; leave the page light.
        Ok(())
    }
}

fn merge_pages(
    txn: &mut RwTxn<'_>,
    tree: &mut TreeRef,
    path: &mut Path,
    level: usize,
    sib_pgno: u64,
    from_left: bool,
    separator: Vec<u8>,
) -> Result<()> {
    let entry = path.entries[level];
    let parent_entry = path.entries[level - 1];
    let (left_pgno, right_pgno, right_parent_idx) = if from_left {
        (sib_pgno, entry.pgno, parent_entry.idx)
    } else {
        (entry.pgno, sib_pgno, parent_entry.idx + 1)
    };

    let (page_flags, is_branch, leaf2_ksize) = {
        let view = PageView::new(txn.page_bytes(left_pgno)?);
        let leaf2_ksize = if view.is_leaf2() {
            tree.db.leaf2_ksize()
        } else {
            0
        };
        (view.flags(), view.is_branch(), leaf2_ksize)
    };

    let mut nodes = {
        let view = PageView::new(txn.page_bytes(left_pgno)?);
        collect_nodes(view, leaf2_ksize)?
    };
    let mut right_nodes = {
        let view = PageView::new(txn.page_bytes(right_pgno)?);
        collect_nodes(view, leaf2_ksize)?
    };
    if is_branch {
        // The right page's first child regains its separator from the
        // parent as its key.
        if let Some(first) = right_nodes.first_mut() {
            first.key = separator;
        }
    }
    nodes.append(&mut right_nodes);

    {
        let buf = txn.page_mut(left_pgno)?;
        rebuild_page(buf, left_pgno, page_flags | PageFlags::DIRTY, &nodes, is_branch)?;
    }
    txn.free_run(right_pgno, 1);
    if is_branch {
        tree.db.add_branch_pages(-1);
    } else {
        tree.db.add_leaf_pages(-1);
    }

    {
        let buf = txn.page_mut(parent_entry.pgno)?;
        PageMut::new(buf).delete_node(right_parent_idx)?;
    }
    if from_left {
        path.entries[level - 1].idx -= 1;
    }
    path.entries[level].pgno = left_pgno;
    rebalance(txn, tree, path, level - 1)
}

#[allow(clippy::too_many_arguments)]
fn steal_node(
    txn: &mut RwTxn<'_>,
    tree: &mut TreeRef,
    path: &mut Path,
    level: usize,
    sib_pgno: u64,
    from_left: bool,
    separator: Vec<u8>,
    sib_parent_idx: usize,
) -> Result<()> {
    let entry = path.entries[level];
    let parent_entry = path.entries[level - 1];

    let (page_flags, is_branch, leaf2_ksize) = {
        let view = PageView::new(txn.page_bytes(entry.pgno)?);
        let leaf2_ksize = if view.is_leaf2() {
            tree.db.leaf2_ksize()
        } else {
            0
        };
        (view.flags(), view.is_branch(), leaf2_ksize)
    };

    let mut my_nodes = {
        let view = PageView::new(txn.page_bytes(entry.pgno)?);
        collect_nodes(view, leaf2_ksize)?
    };
    let mut sib_nodes = {
        let view = PageView::new(txn.page_bytes(sib_pgno)?);
        collect_nodes(view, leaf2_ksize)?
    };

    let (update_parent_idx, new_separator) = if from_left {
        let mut moved = sib_nodes.pop().ok_or(Error::Corrupted)?;
        let new_separator = moved.key.clone();
        if is_branch {
            // Our old first child gets the old separator as its key; the
            // moved child becomes the new anonymous first node.
            if let Some(first) = my_nodes.first_mut() {
                first.key = separator;
            }
            moved.key = Vec::new();
        }
        my_nodes.insert(0, moved);
        (parent_entry.idx, new_separator)
    } else {
        let mut moved = sib_nodes.remove(0);
        if is_branch {
            moved.key = separator;
        }
        my_nodes.push(moved);
        let new_separator = if is_branch {
            let first = sib_nodes.first_mut().ok_or(Error::Corrupted)?;
            std::mem::take(&mut first.key)
        } else {
            sib_nodes.first().ok_or(Error::Corrupted)?.key.clone()
        };
        (sib_parent_idx, new_separator)
    };

    {
        let buf = txn.page_mut(entry.pgno)?;
        rebuild_page(buf, entry.pgno, page_flags | PageFlags::DIRTY, &my_nodes, is_branch)?;
    }
    {
        let buf = txn.page_mut(sib_pgno)?;
        rebuild_page(buf, sib_pgno, page_flags | PageFlags::DIRTY, &sib_nodes, is_branch)?;
    }

    update_branch_key(txn, tree, path, level - 1, update_parent_idx, &new_separator)
}

/// Replace the key of a branch node, splitting the page when the longer
/// key no longer fits.
fn update_branch_key(
    txn: &mut RwTxn<'_>,
    tree: &mut TreeRef,
    path: &mut Path,
    level: usize,
    idx: usize,
    key: &[u8],
) -> Result<()> {
    let pgno = path.entries[level].pgno;
    let child = {
        let view = PageView::new(txn.page_bytes(pgno)?);
        view.node(idx)?.child_pgno()
    };
    let result = {
        let buf = txn.page_mut(pgno)?;
        let mut page = PageMut::new(buf);
        page.delete_node(idx)?;
        page.insert_node(idx, key, &NodePayload::Child(child), NodeFlags::empty())
    };
    match result {
        Ok(()) => Ok(()),
        Err(Error::PageFull) => {
            let node = OwnedNode {
                key: key.to_vec(),
                data: Vec::new(),
                flags: NodeFlags::empty(),
                data_size_override: None,
                child,
            };
            split_insert(txn, tree, path, level, node, idx, false).map(|_| ())
        }
        Err(e) => Err(e),
    }
}

// ---------------------------------------------------------------------------
// Duplicate values
// ---------------------------------------------------------------------------

/// Shape of duplicate storage behind a leaf node.
pub(crate) enum DupShape {
    /// Single plain value.
    Single,
    /// Embedded sub-page.
    SubPage,
    /// Promoted sub-tree.
    SubDb(Db),
}

pub(crate) fn dup_shape(view: &PageView<'_>, idx: usize) -> Result<DupShape> {
    let node = view.node(idx)?;
    let flags = node.flags();
    if flags.contains(NodeFlags::DUP_DATA) {
        if flags.contains(NodeFlags::SUB_DATA) {
            Ok(DupShape::SubDb(Db::from_bytes(node.data()?)?))
        } else {
            Ok(DupShape::SubPage)
        }
    } else {
        Ok(DupShape::Single)
    }
}

/// Insert a duplicate value under an existing key (path points at the
/// touched leaf node).
fn dup_put(
    txn: &mut RwTxn<'_>,
    tree: &mut TreeRef,
    path: &mut Path,
    key: &[u8],
    value: ValueSource<'_>,
    flags: WriteFlags,
) -> Result<PutLocation> {
    let ValueSource::Bytes(value) = value else {
        return Err(Error::Incompatible);
    };
    let leaf = path.leaf().ok_or(Error::Corrupted)?;
    let no_dup = flags.contains(WriteFlags::NO_DUP_DATA);
    let location = PutLocation::Inline {
        pgno: leaf.pgno,
        idx: leaf.idx,
    };

    enum Shape {
        Plain(Vec<u8>),
        SubPage(Vec<u8>),
        SubDb(Db),
    }
    let shape = {
        let view = PageView::new(txn.page_bytes(leaf.pgno)?);
        match dup_shape(&view, leaf.idx)? {
            DupShape::Single => Shape::Plain(view.node(leaf.idx)?.data()?.to_vec()),
            DupShape::SubPage => Shape::SubPage(view.node(leaf.idx)?.data()?.to_vec()),
            DupShape::SubDb(db) => Shape::SubDb(db),
        }
    };

    match shape {
        Shape::Plain(old) => {
            match tree.dup_cmp.compare(value, &old) {
                std::cmp::Ordering::Equal => {
                    if no_dup {
                        return Err(Error::KeyExist);
                    }
                    return Ok(location);
                }
                std::cmp::Ordering::Less if flags.contains(WriteFlags::APPEND_DUP) => {
                    return Err(Error::KeyExist);
                }
                _ => {}
            }
            let fixed = tree.flags.contains(DbFlags::DUP_FIXED);
            if fixed && old.len() != value.len() {
                return Err(Error::BadValSize);
            }
            if fixed && tree.db.leaf2_ksize() == 0 {
                tree.db.set_leaf2_ksize(value.len());
            }
            let mut values = vec![old.as_slice(), value];
            values.sort_by(|a, b| tree.dup_cmp.compare(a, b));
            let leaf2_ksize = if fixed { value.len() } else { 0 };
            let subpage = build_subpage(&values, leaf2_ksize)?;
            if node_footprint(key.len(), subpage.len()) > NODE_MAX {
                let db = promote_values(txn, &values, leaf2_ksize)?;
                replace_node_data(
                    txn,
                    tree,
                    path,
                    key,
                    db.as_bytes(),
                    NodeFlags::DUP_DATA | NodeFlags::SUB_DATA,
                )?;
            } else {
                replace_node_data(txn, tree, path, key, &subpage, NodeFlags::DUP_DATA)?;
            }
            tree.db.add_entries(1);
            Ok(location)
        }
        Shape::SubPage(bytes) => {
            enum Grown {
                InPlace(Vec<u8>),
                Promote(Vec<Vec<u8>>),
            }
            let grown = {
                let sub = PageView::new(&bytes);
                let ksize = sub_leaf2_ksize(&sub, tree);
                let (idx, exact) = search_leaf(sub, tree.dup_cmp, value, ksize)?;
                if exact {
                    if no_dup {
                        return Err(Error::KeyExist);
                    }
                    return Ok(location);
                }
                if flags.contains(WriteFlags::APPEND_DUP) && idx < sub.num_keys() {
                    return Err(Error::KeyExist);
                }
                if ksize > 0 && value.len() != ksize {
                    return Err(Error::BadValSize);
                }
                let mut values = collect_subpage_values(&sub, ksize)?;
                values.insert(idx, value);
                let rebuilt = build_subpage(&values, ksize)?;
                if node_footprint(key.len(), rebuilt.len()) > NODE_MAX {
                    Grown::Promote(values.iter().map(|v| v.to_vec()).collect())
                } else {
                    Grown::InPlace(rebuilt)
                }
            };
            let ksize = if PageView::new(&bytes).is_leaf2() {
                tree.db.leaf2_ksize()
            } else {
                0
            };
            match grown {
                Grown::InPlace(rebuilt) => {
                    replace_node_data(txn, tree, path, key, &rebuilt, NodeFlags::DUP_DATA)?;
                }
                Grown::Promote(values) => {
                    let borrowed: Vec<&[u8]> = values.iter().map(Vec::as_slice).collect();
                    let db = promote_values(txn, &borrowed, ksize)?;
                    replace_node_data(
                        txn,
                        tree,
                        path,
                        key,
                        db.as_bytes(),
                        NodeFlags::DUP_DATA | NodeFlags::SUB_DATA,
                    )?;
                }
            }
            tree.db.add_entries(1);
            Ok(location)
        }
        Shape::SubDb(db) => {
            let mut sub = sub_tree_ref(tree, db);
            let mut sub_path = Path::new();
            let mut sub_flags = WriteFlags::NO_OVERWRITE;
            if flags.contains(WriteFlags::APPEND_DUP) {
                sub_flags |= WriteFlags::APPEND;
            }
            match put_at(
                txn,
                &mut sub,
                &mut sub_path,
                value,
                ValueSource::Bytes(&[]),
                sub_flags,
                NodeFlags::empty(),
            ) {
                Ok(_) => {
                    tree.db.add_entries(1);
                    let page = txn.page_mut(leaf.pgno)?;
                    PageMut::new(page).overwrite_data(leaf.idx, sub.db.as_bytes())?;
                    Ok(location)
                }
                Err(Error::KeyExist) => {
                    // Root may have moved before the collision surfaced.
                    let page = txn.page_mut(leaf.pgno)?;
                    PageMut::new(page).overwrite_data(leaf.idx, sub.db.as_bytes())?;
                    if no_dup || flags.contains(WriteFlags::APPEND_DUP) {
                        Err(Error::KeyExist)
                    } else {
                        Ok(location)
                    }
                }
                Err(e) => Err(e),
            }
        }
    }
}

/// Build a duplicate sub-page holding `values` in sorted order.
pub(crate) fn build_subpage(values: &[&[u8]], leaf2_ksize: usize) -> Result<Vec<u8>> {
    let size = if leaf2_ksize > 0 {
        PAGE_HDR_SIZE + values.len() * leaf2_ksize
    } else {
        PAGE_HDR_SIZE
            + values
                .iter()
                .map(|v| 2 + node_footprint(v.len(), 0))
                .sum::<usize>()
    };
    let mut flags = PageFlags::LEAF | PageFlags::SUB_PAGE;
    if leaf2_ksize > 0 {
        flags |= PageFlags::LEAF2;
    }
    let mut bytes = vec![0u8; size];
    PageHeader::init(&mut bytes, 0, flags);
    let mut page = PageMut::new(&mut bytes);
    for (i, value) in values.iter().enumerate() {
        if leaf2_ksize > 0 {
            page.leaf2_insert(i, value)?;
        } else {
            page.insert_node(i, value, &NodePayload::Inline(&[]), NodeFlags::empty())?;
        }
    }
    Ok(bytes)
}

/// Move sub-page values into a freshly allocated sub-tree root.
fn promote_values(txn: &mut RwTxn<'_>, values: &[&[u8]], leaf2_ksize: usize) -> Result<Db> {
    let pgno = txn.alloc_dirty(1)?;
    let mut flags = PageFlags::LEAF | PageFlags::DIRTY;
    if leaf2_ksize > 0 {
        flags |= PageFlags::LEAF2;
    }
    {
        let buf = txn.page_mut(pgno)?;
        PageHeader::init(buf, pgno, flags);
        let mut page = PageMut::new(buf);
        for (i, value) in values.iter().enumerate() {
            if leaf2_ksize > 0 {
                page.leaf2_insert(i, value)?;
            } else {
                page.insert_node(i, value, &NodePayload::Inline(&[]), NodeFlags::empty())?;
            }
        }
    }
    let mut db = Db::new(DbFlags::empty());
    db.set_leaf2_ksize(leaf2_ksize);
    db.set_root(pgno);
    db.set_depth(1);
    db.add_leaf_pages(1);
    db.add_entries(values.len() as i64);
    Ok(db)
}

/// Swap the data of the node at the path position for `data`, splitting
/// the leaf when the larger node no longer fits.
fn replace_node_data(
    txn: &mut RwTxn<'_>,
    tree: &mut TreeRef,
    path: &mut Path,
    key: &[u8],
    data: &[u8],
    nflags: NodeFlags,
) -> Result<()> {
    let leaf = path.leaf().ok_or(Error::Corrupted)?;
    let inserted = {
        let bytes = txn.page_mut(leaf.pgno)?;
        let mut page = PageMut::new(bytes);
        page.delete_node(leaf.idx)?;
        page.insert_node(leaf.idx, key, &NodePayload::Inline(data), nflags)
    };
    match inserted {
        Ok(()) => Ok(()),
        Err(Error::PageFull) => {
            let node = OwnedNode {
                key: key.to_vec(),
                data: data.to_vec(),
                flags: nflags,
                data_size_override: None,
                child: 0,
            };
            split_insert(txn, tree, path, path.len() - 1, node, leaf.idx, false).map(|_| ())
        }
        Err(e) => Err(e),
    }
}

// ---------------------------------------------------------------------------
// Whole-tree removal
// ---------------------------------------------------------------------------

/// Free every page of a tree (overflow runs and duplicate sub-trees
/// included) and reset its descriptor.
pub(crate) fn tree_clear(txn: &mut RwTxn<'_>, dbi: Dbi) -> Result<()> {
    let tree = tree_ref(txn, dbi)?;
    free_tree_pages(txn, &tree)?;
    let mut fresh = Db::new(tree.db.flags());
    fresh.set_leaf2_ksize(tree.db.leaf2_ksize());
    txn.set_db(dbi, fresh);
    Ok(())
}

fn free_tree_pages(txn: &mut RwTxn<'_>, tree: &TreeRef) -> Result<()> {
    if tree.db.root() == PGNO_INVALID {
        return Ok(());
    }
    let mut stack = vec![tree.db.root()];
    while let Some(pgno) = stack.pop() {
        enum Found {
            Children(Vec<u64>),
            LeafRefs {
                overflows: Vec<u64>,
                sub_roots: Vec<u64>,
            },
        }
        let found = {
            let view = PageView::new(txn.page_bytes(pgno)?);
            if view.is_branch() {
                let mut children = Vec::with_capacity(view.num_keys());
                for i in 0..view.num_keys() {
                    children.push(view.node(i)?.child_pgno());
                }
                Found::Children(children)
            } else if view.is_leaf2() {
                Found::LeafRefs {
                    overflows: Vec::new(),
                    sub_roots: Vec::new(),
                }
            } else {
                let mut overflows = Vec::new();
                let mut sub_roots = Vec::new();
                for i in 0..view.num_keys() {
                    let node = view.node(i)?;
                    let flags = node.flags();
                    if flags.contains(NodeFlags::BIG_DATA) {
                        overflows.push(node.overflow_pgno()?);
                    } else if flags.contains(NodeFlags::SUB_DATA)
                        && flags.contains(NodeFlags::DUP_DATA)
                    {
                        let db = Db::from_bytes(node.data()?)?;
                        if db.root() != PGNO_INVALID {
                            sub_roots.push(db.root());
                        }
                    }
                }
                Found::LeafRefs {
                    overflows,
                    sub_roots,
                }
            }
        };
        match found {
            Found::Children(children) => stack.extend(children),
            Found::LeafRefs {
                overflows,
                sub_roots,
            } => {
                for opgno in overflows {
                    let count = {
                        let bytes = txn.page_bytes(opgno)?;
                        PageHeader::from_bytes(bytes).overflow_pages() as u64
                    };
                    txn.free_run(opgno, count);
                }
                stack.extend(sub_roots);
            }
        }
        txn.free_run(pgno, 1);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compare::Comparator;

    #[test]
    fn subpage_holds_sorted_values() {
        let values: Vec<&[u8]> = vec![b"aa", b"bb", b"cc"];
        let bytes = build_subpage(&values, 0).unwrap();
        let view = PageView::new(&bytes);
        assert!(view.flags().contains(PageFlags::SUB_PAGE));
        assert_eq!(view.num_keys(), 3);
        assert_eq!(view.node(1).unwrap().key(), b"bb");
        assert_eq!(view.node(2).unwrap().data_size(), 0);
    }

    #[test]
    fn subpage_rebuild_inserts_in_order() {
        let values: Vec<&[u8]> = vec![b"aa", b"cc"];
        let bytes = build_subpage(&values, 0).unwrap();
        let mut values = collect_subpage_values(&PageView::new(&bytes), 0).unwrap();
        values.insert(1, b"bb");
        let grown = build_subpage(&values, 0).unwrap();
        let view = PageView::new(&grown);
        assert_eq!(view.num_keys(), 3);
        assert_eq!(view.node(0).unwrap().key(), b"aa");
        assert_eq!(view.node(1).unwrap().key(), b"bb");
        assert_eq!(view.node(2).unwrap().key(), b"cc");
        assert_eq!(view.free_space(), 0);
    }

    #[test]
    fn fixed_width_subpage_uses_packed_keys() {
        let values: Vec<&[u8]> = vec![b"x1", b"x2"];
        let bytes = build_subpage(&values, 2).unwrap();
        let view = PageView::new(&bytes);
        assert!(view.is_leaf2());
        assert_eq!(view.leaf2_key(0, 2).unwrap(), b"x1");
        assert_eq!(bytes.len(), PAGE_HDR_SIZE + 4);
    }

    #[test]
    fn subpage_rebuild_after_removal_is_tight() {
        let values: Vec<&[u8]> = vec![b"aa", b"bb", b"cc"];
        let bytes = build_subpage(&values, 0).unwrap();
        let mut values = collect_subpage_values(&PageView::new(&bytes), 0).unwrap();
        values.remove(1);
        let shrunk = build_subpage(&values, 0).unwrap();
        assert!(shrunk.len() < bytes.len());
        let view = PageView::new(&shrunk);
        assert_eq!(view.num_keys(), 2);
        assert_eq!(view.node(1).unwrap().key(), b"cc");
        assert_eq!(
            search_leaf(view, Comparator::Lexicographic, b"cc", 0).unwrap(),
            (1, true)
        );
    }
}
