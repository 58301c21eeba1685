//! # Database Handles
//!
//! A [`Dbi`] is a small integer naming one B+tree in the environment.
//! Slots 0 and 1 are reserved for the free-page database and the main
//! (unnamed) database; named databases claim slots from 2 upward, bounded
//! by `max_dbs`. The environment keeps a process-wide registry mapping
//! names to slots so handles stay valid across transactions, the way the
//! original C API keeps `MDB_dbi` values stable.
//!
//! A named database is stored as a record in the main database: its key is
//! the name, its value the 48-byte descriptor, and the node carries the
//! sub-database flag so plain data records cannot be confused with it.

use hashbrown::HashMap;

use crate::compare::Comparator;
use crate::error::{Error, Result};
use crate::flags::DbFlags;
use crate::storage::CORE_DBS;

/// Handle to one database in an environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Dbi(pub(crate) u32);

impl Dbi {
    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

/// Per-database statistics.
#[derive(Debug, Clone, Copy, Default)]
pub struct Stat {
    /// Page size in bytes.
    pub page_size: u32,
    /// Depth of the B+tree.
    pub depth: u32,
    /// Number of branch pages.
    pub branch_pages: u64,
    /// Number of leaf pages.
    pub leaf_pages: u64,
    /// Number of overflow pages.
    pub overflow_pages: u64,
    /// Number of entries (duplicates counted individually).
    pub entries: u64,
}

/// Environment-wide information.
#[derive(Debug, Clone, Copy)]
pub struct EnvInfo {
    /// Size of the data map in bytes.
    pub map_size: u64,
    /// Highest page number ever allocated.
    pub last_pgno: u64,
    /// Transaction id of the newest committed snapshot.
    pub last_txnid: u64,
    /// Capacity of the reader table.
    pub max_readers: u32,
    /// High-water count of used reader slots.
    pub num_readers: u32,
}

#[derive(Debug, Clone)]
pub(crate) struct DbiEntry {
    pub name: Option<String>,
    pub flags: DbFlags,
    pub key_cmp: Comparator,
    pub dup_cmp: Comparator,
}

impl DbiEntry {
    pub fn new(name: Option<String>, flags: DbFlags) -> DbiEntry {
        DbiEntry {
            name,
            key_cmp: Comparator::for_keys(flags),
            dup_cmp: Comparator::for_dups(flags),
            flags: flags.persistent(),
        }
    }
}

/// Name-to-handle registry shared by all transactions of one environment.
pub(crate) struct DbiRegistry {
    entries: Vec<Option<DbiEntry>>,
    by_name: HashMap<String, u32>,
    max_dbs: usize,
}

impl DbiRegistry {
    pub fn new(max_dbs: usize, main_flags: DbFlags) -> DbiRegistry {
        let mut entries = Vec::with_capacity(CORE_DBS + max_dbs);
        entries.push(Some(DbiEntry::new(None, DbFlags::INTEGER_KEY)));
        entries.push(Some(DbiEntry::new(None, main_flags)));
        DbiRegistry {
            entries,
            by_name: HashMap::new(),
            max_dbs,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn entry(&self, dbi: Dbi) -> Result<&DbiEntry> {
        self.entries
            .get(dbi.index())
            .and_then(|slot| slot.as_ref())
            .ok_or(Error::BadDbi)
    }

    pub fn lookup(&self, name: &str) -> Option<Dbi> {
        self.by_name.get(name).copied().map(Dbi)
    }

    /// Register a named database, claiming the next free slot.
    pub fn register(&mut self, name: &str, flags: DbFlags) -> Result<Dbi> {
        if let Some(dbi) = self.lookup(name) {
            return Ok(dbi);
        }
        let free = self.entries.iter().skip(CORE_DBS).position(Option::is_none);
        let index = match free {
            Some(at) => CORE_DBS + at,
            None => {
                if self.entries.len() - CORE_DBS >= self.max_dbs {
                    return Err(Error::DbsFull);
                }
                self.entries.push(None);
                self.entries.len() - 1
            }
        };
        self.entries[index] = Some(DbiEntry::new(Some(name.to_string()), flags));
        self.by_name.insert(name.to_string(), index as u32);
        Ok(Dbi(index as u32))
    }

    /// Drop a named entry (aborted creator, or `drop(delete=true)`).
    pub fn unregister(&mut self, dbi: Dbi) {
        if dbi.index() < CORE_DBS {
            return;
        }
        if let Some(entry) = self.entries.get_mut(dbi.index()).and_then(Option::take) {
            if let Some(name) = entry.name {
                self.by_name.remove(&name);
            }
        }
    }

    /// Replace the flags of the main database once its first tree is
    /// created with explicit ordering flags.
    pub fn set_main_flags(&mut self, flags: DbFlags) {
        self.entries[1] = Some(DbiEntry::new(None, flags));
    }

    /// Swap in a modified entry (custom comparators).
    pub fn replace(&mut self, dbi: Dbi, entry: DbiEntry) -> Result<()> {
        let slot = self.entries.get_mut(dbi.index()).ok_or(Error::BadDbi)?;
        if slot.is_none() {
            return Err(Error::BadDbi);
        }
        *slot = Some(entry);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn core_slots_are_preassigned() {
        let registry = DbiRegistry::new(4, DbFlags::empty());
        assert_eq!(registry.len(), CORE_DBS);
        assert!(registry.entry(Dbi(0)).is_ok());
        assert!(registry.entry(Dbi(1)).is_ok());
        assert!(matches!(registry.entry(Dbi(2)), Err(Error::BadDbi)));
    }

    #[test]
    fn register_assigns_stable_slots() {
        let mut registry = DbiRegistry::new(4, DbFlags::empty());
        let a = registry.register("alpha", DbFlags::empty()).unwrap();
        let b = registry.register("bravo", DbFlags::DUP_SORT).unwrap();
        assert_eq!(a, Dbi(2));
        assert_eq!(b, Dbi(3));
        assert_eq!(registry.register("alpha", DbFlags::empty()).unwrap(), a);
        assert_eq!(registry.lookup("bravo"), Some(b));
    }

    #[test]
    fn max_dbs_is_enforced() {
        let mut registry = DbiRegistry::new(1, DbFlags::empty());
        registry.register("only", DbFlags::empty()).unwrap();
        assert!(matches!(
            registry.register("more", DbFlags::empty()),
            Err(Error::DbsFull)
        ));
    }

    #[test]
    fn unregister_frees_the_slot_for_reuse() {
        let mut registry = DbiRegistry::new(2, DbFlags::empty());
        let a = registry.register("alpha", DbFlags::empty()).unwrap();
        registry.unregister(a);
        assert_eq!(registry.lookup("alpha"), None);
        let b = registry.register("bravo", DbFlags::empty()).unwrap();
        assert_eq!(b, a);
    }

    #[test]
    fn dup_comparator_follows_flags() {
        let entry = DbiEntry::new(Some("d".into()), DbFlags::DUP_SORT | DbFlags::INTEGER_DUP);
        assert_eq!(entry.dup_cmp, Comparator::Integer);
        assert_eq!(entry.key_cmp, Comparator::Lexicographic);
    }
}
