//! # Error Types
//!
//! Every fallible operation in lynxdb returns [`Result<T>`], an alias for
//! `std::result::Result<T, Error>`. The variants mirror the on-disk engine's
//! failure taxonomy: conditions a caller is expected to match on
//! (`KeyExist`, `MapFull`, `ReadersFull`, ...) are distinct variants rather
//! than strings, and OS-level failures pass through as [`Error::Io`].
//!
//! Two variants deserve special mention:
//!
//! - [`Error::Panic`]: the environment detected a failure it cannot recover
//!   from in-process (a meta-page write failed half way, or the writer lock
//!   owner died inside this process). The flag is sticky: every subsequent
//!   call on the environment returns `Panic` until it is closed and
//!   reopened, at which point the previous committed snapshot is recovered.
//! - [`Error::Corrupted`]: a page or node failed structural validation.
//!   Within a write transaction this also poisons the transaction; only
//!   abort is valid afterwards.

use std::io;

use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Failure taxonomy of the storage engine.
#[derive(Debug, Error)]
pub enum Error {
    /// Key/value pair already exists (`NO_OVERWRITE`/`NO_DUP_DATA`/`APPEND`).
    #[error("key/value pair already exists")]
    KeyExist,

    /// No matching key/value pair found where one was required.
    #[error("no matching key/value pair found")]
    NotFound,

    /// A page number resolved outside the allocated file region.
    #[error("requested page not found")]
    PageNotFound,

    /// A page or node failed structural validation.
    #[error("database file is corrupted")]
    Corrupted,

    /// The environment is in an unrecoverable state; close and reopen.
    #[error("fatal environment error, close and reopen")]
    Panic,

    /// Data-format version of the file does not match this build.
    #[error("database format version mismatch")]
    VersionMismatch,

    /// The file is not a lynxdb data file.
    #[error("file is not a valid database file")]
    Invalid,

    /// Allocation would exceed `map_size`.
    #[error("environment map size limit reached")]
    MapFull,

    /// `max_dbs` named databases are already open.
    #[error("environment max-dbs limit reached")]
    DbsFull,

    /// All reader-table slots are in use.
    #[error("environment max-readers limit reached")]
    ReadersFull,

    /// No thread slot could be bound for this reader thread.
    #[error("thread-local reader slots exhausted")]
    TlsFull,

    /// The transaction accumulated too many dirty pages.
    #[error("transaction has too many dirty pages")]
    TxnFull,

    /// Cursor stack exceeded the maximum tree depth.
    #[error("cursor stack depth exceeded")]
    CursorFull,

    /// A node did not fit even after splitting.
    #[error("page has insufficient space")]
    PageFull,

    /// The data file grew beyond this environment's map.
    #[error("database grew beyond the environment map size")]
    MapResized,

    /// Operation is incompatible with the database's flags.
    #[error("operation incompatible with database flags")]
    Incompatible,

    /// A reader-table slot was reused inconsistently.
    #[error("invalid reuse of a reader table slot")]
    BadRslot,

    /// Transaction is poisoned or otherwise unusable for this call.
    #[error("transaction cannot be used for this operation")]
    BadTxn,

    /// Key or value size is unsupported (zero, over the bound, or a
    /// fixed-size mismatch).
    #[error("unsupported size of key or value")]
    BadValSize,

    /// The database handle was closed or changed unexpectedly.
    #[error("database handle changed unexpectedly")]
    BadDbi,

    /// Unexpected internal condition; indicates a bug, not user error.
    #[error("unexpected internal failure: {0}")]
    Problem(&'static str),

    /// Pass-through of operating-system errors.
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl Error {
    /// Whether the error poisons the owning write transaction.
    pub(crate) fn poisons_txn(&self) -> bool {
        matches!(
            self,
            Error::Corrupted
                | Error::Panic
                | Error::PageNotFound
                | Error::PageFull
                | Error::TxnFull
                | Error::MapFull
                | Error::Problem(_)
                | Error::Io(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_exist_is_not_poisoning() {
        assert!(!Error::KeyExist.poisons_txn());
        assert!(!Error::NotFound.poisons_txn());
    }

    #[test]
    fn structural_errors_poison() {
        assert!(Error::Corrupted.poisons_txn());
        assert!(Error::MapFull.poisons_txn());
        assert!(Error::TxnFull.poisons_txn());
    }

    #[test]
    fn io_errors_convert() {
        let err: Error = io::Error::from(io::ErrorKind::PermissionDenied).into();
        assert!(matches!(err, Error::Io(_)));
    }
}
