//! # lynxdb: embedded memory-mapped B+tree key/value store
//!
//! lynxdb stores ordered maps from byte-string keys to byte-string values
//! in a single memory-mapped file, with full ACID semantics: a
//! copy-on-write B+tree, a two-page meta rotation that commits snapshots
//! atomically, and a cross-process reader table giving writers the oldest
//! live snapshot without ever blocking readers.
//!
//! ## Quick start
//!
//! ```no_run
//! use lynxdb::{DbFlags, EnvOptions, WriteFlags};
//!
//! # fn main() -> lynxdb::Result<()> {
//! let env = EnvOptions::new().map_size(10 << 20).open("./db")?;
//!
//! let mut txn = env.begin_rw_txn()?;
//! let db = txn.open_db(None, DbFlags::empty())?;
//! txn.put(db, b"alpha", b"1", WriteFlags::empty())?;
//! txn.commit()?;
//!
//! let txn = env.begin_ro_txn()?;
//! let value = txn.get(db, b"alpha")?;
//! assert_eq!(value, Some(&b"1"[..]));
//! # Ok(())
//! # }
//! ```
//!
//! ## Concurrency model
//!
//! Exactly one write transaction exists at a time across every process
//! sharing the environment; readers run fully in parallel and never block
//! the writer (or each other). Readers pin the snapshot they started on
//! by stamping a slot in the shared reader table; pages reachable from a
//! pinned snapshot are never reused until the snapshot is released.
//!
//! Writers mutate through copy-on-write: every change lands on freshly
//! allocated pages, the commit flushes them, syncs, and flips one of the
//! two meta pages. A crash at any point leaves the previous meta (and
//! therefore a fully consistent snapshot) authoritative.
//!
//! ## Module map
//!
//! - `env`: environment lifecycle, meta election, copy
//! - `txn`: read snapshots and the single-writer transaction engine
//! - `btree`: tree operations, splits, rebalancing, duplicate storage
//! - `cursor`: positional iteration over one database
//! - `storage`: page codec, data file, lock file, free-page lists

mod btree;
mod compare;
mod cursor;
mod db;
mod env;
mod error;
mod flags;
mod storage;
mod txn;

pub use compare::{Comparator, CompareFn};
pub use cursor::{RoCursor, RwCursor};
pub use db::{Dbi, EnvInfo, Stat};
pub use env::{Env, EnvOptions, VerifyReport};
pub use error::{Error, Result};
pub use flags::{DbFlags, EnvFlags, WriteFlags};
pub use storage::{ReaderSlotInfo, MAX_KEY_SIZE, PAGE_SIZE};
pub use txn::{RoTxn, RwTxn, Transaction};
