//! # Storage Layer
//!
//! Everything below the B+tree: the page-addressed data file and its
//! read-only shared map, the two-page meta rotation, the lock file with the
//! cross-process reader table, and the free-page lists.
//!
//! ## File layout
//!
//! ```text
//! data file                     lock file
//! ┌──────────────────┐          ┌─────────────────────────┐
//! │ page 0: meta A   │          │ header (64 B)           │
//! ├──────────────────┤          ├─────────────────────────┤
//! │ page 1: meta B   │          │ reader slot 0 (64 B)    │
//! ├──────────────────┤          ├─────────────────────────┤
//! │ page 2..: b+tree,│          │ reader slot 1 (64 B)    │
//! │ overflow, free-db│          │ ...                     │
//! └──────────────────┘          └─────────────────────────┘
//! ```
//!
//! Pages are 4 KiB. A committing transaction writes its dirty pages with
//! positioned writes, syncs, and then rewrites exactly one of the two meta
//! pages (`txnid & 1`); the meta with the larger transaction id is
//! authoritative on open. Readers access pages through a single shared
//! read-only map sized to `map_size`; the file is extended (sparsely) to
//! that size when the environment is created, so the map never needs to be
//! remade and a reader can never fault past the end of the file.
//!
//! ## Safety model
//!
//! Snapshot isolation is what makes the shared map sound: a writer only
//! ever writes to pages that no live snapshot can reach (freshly allocated
//! tail pages, or pages whose freeing transaction is older than every
//! registered reader), so the bytes under a reader's `&[u8]` never change
//! while the reader's transaction is live. The meta flip is the only
//! mutation of shared state readers race with, and they validate and pick
//! by transaction id.

mod datafile;
mod freelist;
mod lockfile;
mod meta;
mod page;

pub(crate) use datafile::DataFile;
pub(crate) use freelist::{merge_descending, take_contiguous_run};
pub(crate) use lockfile::{LockFile, WriterLock, TXNID_IDLE};
pub(crate) use meta::{Db, Meta, META_SIZE};
pub(crate) use page::{
    node_footprint, overflow_pages_for, validate_page, NodePayload, PageHeader, PageMut,
    PageView,
};
pub use lockfile::ReaderSlotInfo;

/// Page size in bytes. Fixed at build time like the rest of the format.
pub const PAGE_SIZE: usize = 4096;

/// Bytes of page header before the slot table.
pub const PAGE_HDR_SIZE: usize = 16;

/// Minimum number of keys on a non-root page.
pub const MIN_KEYS: usize = 2;

/// Largest node (header + key + inline value) a regular page accepts;
/// anything bigger moves its value to an overflow run. Sized so `MIN_KEYS`
/// nodes and their slots always fit.
pub const NODE_MAX: usize = (((PAGE_SIZE - PAGE_HDR_SIZE) / MIN_KEYS) & !1) - 2;

/// Hard bound on key length (and on fixed-size duplicate values).
pub const MAX_KEY_SIZE: usize = 511;

/// Sentinel page number for an empty tree root.
pub const PGNO_INVALID: u64 = u64::MAX;

/// The two fixed meta pages.
pub const NUM_META_PAGES: u64 = 2;

/// Maximum tree depth a cursor stack can hold.
pub const MAX_DEPTH: usize = 32;

/// Per-mille page fill below which delete triggers a rebalance.
pub const FILL_THRESHOLD: usize = 250;

/// Reserved database slots: the free-page database and the main database.
pub const CORE_DBS: usize = 2;
pub const FREE_DBI: crate::db::Dbi = crate::db::Dbi(0);
pub const MAIN_DBI: crate::db::Dbi = crate::db::Dbi(1);
