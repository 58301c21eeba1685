//! # Meta Pages and Database Descriptors
//!
//! Pages 0 and 1 each hold one [`Meta`] body right after the page header.
//! A commit with transaction id `t` rewrites meta slot `t & 1`, so the two
//! slots alternate and the previous committed snapshot always survives a
//! torn write: on open both slots are validated and the one with the larger
//! transaction id wins (the older one under `PREV_SNAPSHOT`).
//!
//! A [`Db`] descriptor is the 48-byte root record of one B+tree: its flags,
//! depth, page counts, entry count and root page. The meta embeds two of
//! them (the free-page database and the main database); named databases
//! store theirs as the value of their name record in the main database.

use zerocopy::little_endian::{U16, U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use super::{PAGE_HDR_SIZE, PGNO_INVALID};
use crate::error::{Error, Result};
use crate::flags::DbFlags;

/// File magic, also an endianness witness: a byte-swapped build reads a
/// different value and rejects the file.
pub const MAGIC: u32 = 0x4C59_4E58;

/// Data-format version.
pub const VERSION: u32 = 1;

pub const META_SIZE: usize = std::mem::size_of::<Meta>();

/// B+tree descriptor.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct Db {
    /// Key stride of `LEAF2` pages; zero unless `DUP_FIXED`.
    leaf2_ksize: U32,
    flags: U16,
    depth: U16,
    branch_pages: U64,
    leaf_pages: U64,
    overflow_pages: U64,
    entries: U64,
    root: U64,
}

const _: () = assert!(std::mem::size_of::<Db>() == 48);

impl Db {
    pub fn new(flags: DbFlags) -> Db {
        Db {
            leaf2_ksize: U32::new(0),
            flags: U16::new(flags.persistent().bits() as u16),
            depth: U16::new(0),
            branch_pages: U64::new(0),
            leaf_pages: U64::new(0),
            overflow_pages: U64::new(0),
            entries: U64::new(0),
            root: U64::new(PGNO_INVALID),
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Db> {
        Db::read_from_bytes(bytes).map_err(|_| Error::Corrupted)
    }

    pub fn flags(&self) -> DbFlags {
        DbFlags::from_bits_truncate(self.flags.get() as u32)
    }

    pub fn leaf2_ksize(&self) -> usize {
        self.leaf2_ksize.get() as usize
    }

    pub fn set_leaf2_ksize(&mut self, ksize: usize) {
        self.leaf2_ksize = U32::new(ksize as u32);
    }

    pub fn depth(&self) -> u16 {
        self.depth.get()
    }

    pub fn set_depth(&mut self, depth: u16) {
        self.depth = U16::new(depth);
    }

    pub fn bump_depth(&mut self, delta: i16) {
        self.depth = U16::new((self.depth.get() as i16 + delta) as u16);
    }

    pub fn root(&self) -> u64 {
        self.root.get()
    }

    pub fn set_root(&mut self, root: u64) {
        self.root = U64::new(root);
    }

    pub fn entries(&self) -> u64 {
        self.entries.get()
    }

    pub fn add_entries(&mut self, delta: i64) {
        self.entries = U64::new((self.entries.get() as i64 + delta) as u64);
    }

    pub fn branch_pages(&self) -> u64 {
        self.branch_pages.get()
    }

    pub fn leaf_pages(&self) -> u64 {
        self.leaf_pages.get()
    }

    pub fn overflow_pages(&self) -> u64 {
        self.overflow_pages.get()
    }

    pub fn add_branch_pages(&mut self, delta: i64) {
        self.branch_pages = U64::new((self.branch_pages.get() as i64 + delta) as u64);
    }

    pub fn add_leaf_pages(&mut self, delta: i64) {
        self.leaf_pages = U64::new((self.leaf_pages.get() as i64 + delta) as u64);
    }

    pub fn add_overflow_pages(&mut self, delta: i64) {
        self.overflow_pages = U64::new((self.overflow_pages.get() as i64 + delta) as u64);
    }
}

/// Meta page body.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct Meta {
    magic: U32,
    version: U32,
    /// Reserved for a pinned map address; always zero in this engine.
    fixed_addr: U64,
    map_size: U64,
    /// Free-page database, then main database.
    pub dbs: [Db; 2],
    last_pgno: U64,
    txnid: U64,
}

const _: () = assert!(META_SIZE == 136);

impl Meta {
    pub fn new(map_size: u64) -> Meta {
        Meta {
            magic: U32::new(MAGIC),
            version: U32::new(VERSION),
            fixed_addr: U64::new(0),
            map_size: U64::new(map_size),
            dbs: [
                Db::new(DbFlags::INTEGER_KEY),
                Db::new(DbFlags::empty()),
            ],
            last_pgno: U64::new(super::NUM_META_PAGES - 1),
            txnid: U64::new(0),
        }
    }

    /// Decode and validate a meta body read from a meta page.
    pub fn from_page(page: &[u8]) -> Result<Meta> {
        if page.len() < PAGE_HDR_SIZE + META_SIZE {
            return Err(Error::Invalid);
        }
        let meta = Meta::read_from_bytes(&page[PAGE_HDR_SIZE..PAGE_HDR_SIZE + META_SIZE])
            .map_err(|_| Error::Invalid)?;
        meta.validate()?;
        Ok(meta)
    }

    pub fn validate(&self) -> Result<()> {
        if self.magic.get() != MAGIC {
            return Err(Error::Invalid);
        }
        if self.version.get() != VERSION {
            return Err(Error::VersionMismatch);
        }
        Ok(())
    }

    pub fn map_size(&self) -> u64 {
        self.map_size.get()
    }

    pub fn set_map_size(&mut self, map_size: u64) {
        self.map_size = U64::new(map_size);
    }

    pub fn last_pgno(&self) -> u64 {
        self.last_pgno.get()
    }

    pub fn set_last_pgno(&mut self, last_pgno: u64) {
        self.last_pgno = U64::new(last_pgno);
    }

    pub fn txnid(&self) -> u64 {
        self.txnid.get()
    }

    pub fn set_txnid(&mut self, txnid: u64) {
        self.txnid = U64::new(txnid);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::PAGE_SIZE;

    #[test]
    fn fresh_meta_validates() {
        let meta = Meta::new(1 << 20);
        assert!(meta.validate().is_ok());
        assert_eq!(meta.txnid(), 0);
        assert_eq!(meta.last_pgno(), 1);
        assert_eq!(meta.dbs[1].root(), PGNO_INVALID);
    }

    #[test]
    fn meta_roundtrips_through_page_bytes() {
        let mut page = vec![0u8; PAGE_SIZE];
        let mut meta = Meta::new(1 << 20);
        meta.set_txnid(41);
        meta.set_last_pgno(99);
        page[PAGE_HDR_SIZE..PAGE_HDR_SIZE + META_SIZE].copy_from_slice(meta.as_bytes());

        let read = Meta::from_page(&page).unwrap();
        assert_eq!(read.txnid(), 41);
        assert_eq!(read.last_pgno(), 99);
        assert_eq!(read.map_size(), 1 << 20);
    }

    #[test]
    fn bad_magic_is_invalid() {
        let mut page = vec![0u8; PAGE_SIZE];
        let meta = Meta::new(1 << 20);
        page[PAGE_HDR_SIZE..PAGE_HDR_SIZE + META_SIZE].copy_from_slice(meta.as_bytes());
        page[PAGE_HDR_SIZE] ^= 0xFF;
        assert!(matches!(Meta::from_page(&page), Err(Error::Invalid)));
    }

    #[test]
    fn version_mismatch_is_distinct() {
        let mut page = vec![0u8; PAGE_SIZE];
        let meta = Meta::new(1 << 20);
        page[PAGE_HDR_SIZE..PAGE_HDR_SIZE + META_SIZE].copy_from_slice(meta.as_bytes());
        page[PAGE_HDR_SIZE + 4] = 0xFF;
        assert!(matches!(
            Meta::from_page(&page),
            Err(Error::VersionMismatch)
        ));
    }

    #[test]
    fn descriptor_accounting() {
        let mut db = Db::new(DbFlags::DUP_SORT);
        db.add_entries(10);
        db.add_entries(-3);
        db.add_leaf_pages(2);
        db.bump_depth(1);
        assert_eq!(db.entries(), 7);
        assert_eq!(db.leaf_pages(), 2);
        assert_eq!(db.depth(), 1);
        assert_eq!(db.flags(), DbFlags::DUP_SORT);
    }
}
