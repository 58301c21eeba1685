//! # Flag Sets
//!
//! All user-visible option sets are `bitflags` types so they round-trip
//! through the on-disk format unchanged: database flags are persisted
//! verbatim in the `Db` descriptor, environment and write flags are
//! process-local.

use bitflags::bitflags;

bitflags! {
    /// Environment open flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct EnvFlags: u32 {
        /// Treat the open path as the data file itself; the lock file gets a
        /// `-lock` suffix instead of living inside a directory.
        const NO_SUB_DIR = 0x0000_4000;
        /// Skip `fdatasync` after flushing dirty pages at commit.
        const NO_SYNC = 0x0001_0000;
        /// Open the environment read-only; write transactions fail.
        const READ_ONLY = 0x0002_0000;
        /// Write the meta page without the synchronous descriptor.
        const NO_META_SYNC = 0x0004_0000;
        /// Accepted for compatibility; dirty pages always use private
        /// buffers in this engine.
        const WRITE_MAP = 0x0008_0000;
        /// Accepted for compatibility; implies nothing beyond `NO_SYNC`
        /// here.
        const MAP_ASYNC = 0x0010_0000;
        /// Do not bind reader slots to threads; each read transaction
        /// claims and releases its own slot.
        const NO_TLS = 0x0020_0000;
        /// Skip the lock file entirely. Caller manages exclusion.
        const NO_LOCK = 0x0040_0000;
        /// Advise the OS against readahead on the data map.
        const NO_READAHEAD = 0x0080_0000;
        /// Accepted for compatibility; fresh page buffers are always
        /// zero-initialized.
        const NO_MEM_INIT = 0x0100_0000;
        /// Open the environment at the previous (older) meta snapshot.
        const PREV_SNAPSHOT = 0x0200_0000;
        /// Accepted for compatibility; the map address is never pinned.
        const FIXED_MAP = 0x0000_0001;
    }
}

bitflags! {
    /// Per-database flags. The low 16 bits are persisted in the database
    /// descriptor; `CREATE` is call-time only.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct DbFlags: u32 {
        /// Compare keys in reverse byte order.
        const REVERSE_KEY = 0x02;
        /// Allow multiple sorted values per key.
        const DUP_SORT = 0x04;
        /// Keys are native-endian unsigned integers (4 or 8 bytes).
        const INTEGER_KEY = 0x08;
        /// All duplicate values have the same size (enables packed pages
        /// and the `*_MULTIPLE` cursor operations). Implies `DUP_SORT`.
        const DUP_FIXED = 0x10;
        /// Duplicate values are native-endian unsigned integers.
        const INTEGER_DUP = 0x20;
        /// Compare duplicate values in reverse byte order.
        const REVERSE_DUP = 0x40;
        /// Create the named database if it does not exist.
        const CREATE = 0x4_0000;
    }
}

impl DbFlags {
    /// Flags stored in the on-disk descriptor.
    pub(crate) const PERSISTENT: DbFlags = DbFlags::from_bits_truncate(0xffff);

    pub(crate) fn persistent(self) -> DbFlags {
        self & Self::PERSISTENT
    }
}

bitflags! {
    /// Flags for `put` and `cursor.put`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct WriteFlags: u32 {
        /// Do not overwrite an existing key; the existing pair is left
        /// intact and `KeyExist` is returned.
        const NO_OVERWRITE = 0x10;
        /// In a `DUP_SORT` database, do not add the value if it is already
        /// present for the key.
        const NO_DUP_DATA = 0x20;
        /// Replace the pair at the cursor position (cursor puts only).
        const CURRENT = 0x40;
        /// Reserve space for the value and return the uninitialized slice
        /// instead of copying caller bytes.
        const RESERVE = 0x1_0000;
        /// The key sorts after every existing key; fail with `KeyExist`
        /// otherwise. Skips the descent comparison work.
        const APPEND = 0x2_0000;
        /// `APPEND` for duplicate values of a single key.
        const APPEND_DUP = 0x4_0000;
        /// Store multiple `DUP_FIXED` values from one contiguous buffer.
        const MULTIPLE = 0x8_0000;
    }
}

bitflags! {
    /// On-disk page flags (`PageHeader::flags`).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct PageFlags: u16 {
        const BRANCH = 0x01;
        const LEAF = 0x02;
        const OVERFLOW = 0x04;
        const META = 0x08;
        /// Dirty in the current write transaction (cleared at flush).
        const DIRTY = 0x10;
        /// Packed fixed-width keys, no node headers.
        const LEAF2 = 0x20;
        /// Embedded duplicate-value sub-page inside a leaf node.
        const SUB_PAGE = 0x40;
        /// Freed earlier in the same transaction, available for reuse.
        const LOOSE = 0x4000;
        /// Pinned against spilling.
        const KEEP = 0x8000;
    }
}

bitflags! {
    /// Node flags within leaf pages.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct NodeFlags: u16 {
        /// Value lives on an overflow run; node data is the 8-byte first
        /// page number.
        const BIG_DATA = 0x01;
        /// Node data is a database descriptor (named database record or
        /// promoted duplicate sub-tree).
        const SUB_DATA = 0x02;
        /// Node data is an embedded duplicate sub-page.
        const DUP_DATA = 0x04;
    }
}
