//! # B+tree
//!
//! Tree operations work on a *path*: the stack of (page number, index)
//! pairs from the root down to a position in a leaf, at most
//! [`MAX_DEPTH`](crate::storage::MAX_DEPTH) deep. Reads resolve pages
//! through the owning transaction (dirty buffer first, shared map
//! otherwise); writes copy-on-write every page along the path before
//! mutating, so a transaction only ever edits pages it allocated itself.
//!
//! Branch pages keep their first node's key empty: it stands for
//! "everything below the first separator" and is never compared. A probe
//! larger than every separator therefore lands on the rightmost child.
//!
//! Splits rebuild both halves from an owned copy of the node list (a
//! scratch ordering, not in-place juggling), promote exactly one
//! separator, and recurse into the parent when it is full too. Deletes
//! rebalance when a page falls under a quarter full or loses its minimum
//! key count: merge with a sibling when both fit on one page, otherwise
//! steal one node and fix the separator.
//!
//! Duplicate-sort databases store a key's values as a sorted miniature
//! page embedded in the leaf node until it outgrows the node bound, at
//! which point the values are promoted into their own sub-tree whose
//! 48-byte descriptor replaces the embedded page. Both shapes reuse this
//! module's page codec and (for the sub-tree) the same tree operations
//! with the duplicate comparator as the key order.

pub(crate) mod ops;

use smallvec::SmallVec;

use crate::compare::Comparator;
use crate::error::Result;
use crate::storage::{PageView, MAX_DEPTH};

/// One level of a cursor path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PathEntry {
    pub pgno: u64,
    pub idx: usize,
}

/// Root-to-leaf position stack.
#[derive(Debug, Clone, Default)]
pub(crate) struct Path {
    pub entries: SmallVec<[PathEntry; MAX_DEPTH]>,
}

impl Path {
    pub fn new() -> Path {
        Path::default()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn push(&mut self, pgno: u64, idx: usize) -> Result<()> {
        if self.entries.len() >= MAX_DEPTH {
            return Err(crate::error::Error::CursorFull);
        }
        self.entries.push(PathEntry { pgno, idx });
        Ok(())
    }

    pub fn leaf(&self) -> Option<PathEntry> {
        self.entries.last().copied()
    }

    pub fn leaf_mut(&mut self) -> Option<&mut PathEntry> {
        self.entries.last_mut()
    }
}

/// Lower-bound search in a leaf (or leaf2) page: the first index whose key
/// is `>=` the probe, and whether it is an exact match.
pub(crate) fn search_leaf(
    view: PageView<'_>,
    cmp: Comparator,
    key: &[u8],
    leaf2_ksize: usize,
) -> Result<(usize, bool)> {
    let num = view.num_keys();
    let mut lo = 0usize;
    let mut hi = num;
    while lo < hi {
        let mid = (lo + hi) / 2;
        let probe = view.key(mid, leaf2_ksize)?;
        match cmp.compare(probe, key) {
            std::cmp::Ordering::Less => lo = mid + 1,
            _ => hi = mid,
        }
    }
    let exact = lo < num && cmp.compare(view.key(lo, leaf2_ksize)?, key).is_eq();
    Ok((lo, exact))
}

/// Child index to follow in a branch page: the last separator `<=` the
/// probe. Index 0 carries the empty "smallest-below" separator and is
/// skipped by the search.
pub(crate) fn search_branch(view: PageView<'_>, cmp: Comparator, key: &[u8]) -> Result<usize> {
    let num = view.num_keys();
    debug_assert!(num >= 1);
    let mut lo = 1usize;
    let mut hi = num;
    while lo < hi {
        let mid = (lo + hi) / 2;
        let probe = view.node(mid)?.key();
        match cmp.compare(probe, key) {
            std::cmp::Ordering::Greater => hi = mid,
            _ => lo = mid + 1,
        }
    }
    Ok(lo - 1)
}
