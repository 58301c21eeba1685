//! # Page and Node Codec
//!
//! Every 4 KiB page starts with a 16-byte header. Branch and leaf pages are
//! slotted: a table of 2-byte node offsets grows up from the header while
//! the node heap grows down from the end, and the `lower`/`upper` header
//! fields track the free-space bounds between them. Overflow pages reuse
//! the same two fields as a single 32-bit page count (a union in the
//! on-disk format; the accessors here assert the flag bits before reading
//! either view).
//!
//! ## Page header (16 bytes)
//!
//! ```text
//! Offset  Size  Field   Description
//! ------  ----  ------  ----------------------------------------
//! 0       8     pgno    Page number (consistency check on decode)
//! 8       2     flags   BRANCH | LEAF | OVERFLOW | META | LEAF2 | ...
//! 10      2     lower   Offset where free space begins
//! 12      2     upper   Offset where free space ends
//! 14      2     pad     Reserved
//! ```
//!
//! For `OVERFLOW` pages, bytes 10..14 hold the run length in pages.
//!
//! ## Node layout (8-byte header, 2-byte aligned)
//!
//! ```text
//! +-------+-------+--------+--------+=========+=========+
//! | lo    | hi    | flags  | ksize  | key     | data    |
//! | 2 B   | 2 B   | 2 B    | 2 B    | ksize B | leaf    |
//! +-------+-------+--------+--------+=========+=========+
//! ```
//!
//! On a leaf, `lo | hi << 16` is the data size and `flags` are
//! [`NodeFlags`]. On a branch there is no data; the three fields together
//! encode a 48-bit child page number (`lo | hi << 16 | flags << 32`).
//!
//! `LEAF2` pages drop the node headers and the slot table entirely: they
//! pack fixed-width keys at a constant stride, which is what the
//! duplicate-fixed sub-trees use.
//!
//! The same codec serves real pages and the embedded duplicate sub-pages:
//! a sub-page is just a miniature page (its `lower`/`upper` relative to the
//! sub-page start) stored as node data inside a leaf.

use zerocopy::little_endian::{U16, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use super::{PAGE_HDR_SIZE, PAGE_SIZE};
use crate::error::{Error, Result};
use crate::flags::{NodeFlags, PageFlags};

/// Size of a node header in bytes.
pub(crate) const NODE_HDR_SIZE: usize = 8;

/// Size of one slot-table entry.
pub(crate) const SLOT_SIZE: usize = 2;

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct PageHeader {
    pgno: U64,
    flags: U16,
    lower: U16,
    upper: U16,
    pad: U16,
}

const _: () = assert!(std::mem::size_of::<PageHeader>() == PAGE_HDR_SIZE);

impl PageHeader {
    pub fn init(page: &mut [u8], pgno: u64, flags: PageFlags) {
        let len = page.len();
        let header = Self::from_bytes_mut(page);
        header.pgno = U64::new(pgno);
        header.flags = U16::new(flags.bits());
        header.lower = U16::new(PAGE_HDR_SIZE as u16);
        header.upper = U16::new(len as u16);
        header.pad = U16::new(0);
    }

    pub fn from_bytes(data: &[u8]) -> &Self {
        debug_assert!(data.len() >= PAGE_HDR_SIZE);
        Self::ref_from_bytes(&data[..PAGE_HDR_SIZE]).expect("16-byte unaligned header")
    }

    pub fn from_bytes_mut(data: &mut [u8]) -> &mut Self {
        debug_assert!(data.len() >= PAGE_HDR_SIZE);
        Self::mut_from_bytes(&mut data[..PAGE_HDR_SIZE]).expect("16-byte unaligned header")
    }

    pub fn pgno(&self) -> u64 {
        self.pgno.get()
    }

    pub fn set_pgno(&mut self, pgno: u64) {
        self.pgno = U64::new(pgno);
    }

    pub fn flags(&self) -> PageFlags {
        PageFlags::from_bits_truncate(self.flags.get())
    }

    pub fn set_flags(&mut self, flags: PageFlags) {
        self.flags = U16::new(flags.bits());
    }

    pub fn insert_flags(&mut self, flags: PageFlags) {
        self.set_flags(self.flags() | flags);
    }

    pub fn remove_flags(&mut self, flags: PageFlags) {
        self.set_flags(self.flags() - flags);
    }

    pub fn lower(&self) -> usize {
        debug_assert!(!self.flags().contains(PageFlags::OVERFLOW));
        self.lower.get() as usize
    }

    pub fn upper(&self) -> usize {
        debug_assert!(!self.flags().contains(PageFlags::OVERFLOW));
        self.upper.get() as usize
    }

    pub fn set_bounds(&mut self, lower: usize, upper: usize) {
        self.lower = U16::new(lower as u16);
        self.upper = U16::new(upper as u16);
    }

    /// Run length of an overflow chain, stored over the free-space bounds.
    pub fn overflow_pages(&self) -> u32 {
        debug_assert!(self.flags().contains(PageFlags::OVERFLOW));
        self.lower.get() as u32 | (self.upper.get() as u32) << 16
    }

    pub fn set_overflow_pages(&mut self, pages: u32) {
        debug_assert!(self.flags().contains(PageFlags::OVERFLOW));
        self.lower = U16::new((pages & 0xffff) as u16);
        self.upper = U16::new((pages >> 16) as u16);
    }
}

/// Pages needed for an overflow run holding `size` value bytes.
pub fn overflow_pages_for(size: usize) -> u64 {
    ((PAGE_HDR_SIZE + size + PAGE_SIZE - 1) / PAGE_SIZE) as u64
}

/// Even-aligned footprint of a node with the given key and data sizes.
pub(crate) fn node_footprint(ksize: usize, dsize: usize) -> usize {
    (NODE_HDR_SIZE + ksize + dsize + 1) & !1
}

/// Read-only view over the bytes of a page (or embedded sub-page).
#[derive(Clone, Copy)]
pub struct PageView<'a> {
    data: &'a [u8],
}

impl<'a> PageView<'a> {
    pub fn new(data: &'a [u8]) -> PageView<'a> {
        debug_assert!(data.len() >= PAGE_HDR_SIZE);
        PageView { data }
    }

    pub fn bytes(&self) -> &'a [u8] {
        self.data
    }

    pub fn header(&self) -> &'a PageHeader {
        PageHeader::from_bytes(self.data)
    }

    pub fn flags(&self) -> PageFlags {
        self.header().flags()
    }

    pub fn is_leaf(&self) -> bool {
        self.flags().contains(PageFlags::LEAF)
    }

    pub fn is_branch(&self) -> bool {
        self.flags().contains(PageFlags::BRANCH)
    }

    pub fn is_leaf2(&self) -> bool {
        self.flags().contains(PageFlags::LEAF2)
    }

    pub fn is_overflow(&self) -> bool {
        self.flags().contains(PageFlags::OVERFLOW)
    }

    /// Number of nodes (or packed keys) on the page.
    pub fn num_keys(&self) -> usize {
        (self.header().lower() - PAGE_HDR_SIZE) / SLOT_SIZE
    }

    pub fn free_space(&self) -> usize {
        let header = self.header();
        header.upper().saturating_sub(header.lower())
    }

    /// Per-mille fill factor, the rebalance criterion.
    pub fn fill_ratio(&self) -> usize {
        let usable = self.data.len() - PAGE_HDR_SIZE;
        1000 * (usable - self.free_space()) / usable
    }

    fn slot(&self, index: usize) -> usize {
        let off = PAGE_HDR_SIZE + index * SLOT_SIZE;
        u16::from_le_bytes([self.data[off], self.data[off + 1]]) as usize
    }

    /// Decode the node at `index`, validating its bounds.
    pub fn node(&self, index: usize) -> Result<NodeView<'a>> {
        if index >= self.num_keys() || self.is_leaf2() {
            return Err(Error::Corrupted);
        }
        let offset = self.slot(index);
        if offset + NODE_HDR_SIZE > self.data.len() {
            return Err(Error::Corrupted);
        }
        let node = NodeView {
            data: self.data,
            offset,
        };
        if offset + NODE_HDR_SIZE + node.ksize() > self.data.len() {
            return Err(Error::Corrupted);
        }
        Ok(node)
    }

    /// Packed key access for `LEAF2` pages.
    pub fn leaf2_key(&self, index: usize, ksize: usize) -> Result<&'a [u8]> {
        if !self.is_leaf2() || index >= self.num_keys() {
            return Err(Error::Corrupted);
        }
        let start = PAGE_HDR_SIZE + index * ksize;
        if start + ksize > self.data.len() {
            return Err(Error::Corrupted);
        }
        Ok(&self.data[start..start + ksize])
    }

    /// Key at `index` regardless of page kind (branch keys included).
    pub fn key(&self, index: usize, leaf2_ksize: usize) -> Result<&'a [u8]> {
        if self.is_leaf2() {
            self.leaf2_key(index, leaf2_ksize)
        } else {
            Ok(self.node(index)?.key())
        }
    }

}

/// One node inside a slotted page.
#[derive(Clone, Copy)]
pub struct NodeView<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> NodeView<'a> {
    fn field(&self, at: usize) -> u16 {
        u16::from_le_bytes([self.data[self.offset + at], self.data[self.offset + at + 1]])
    }

    pub fn flags(&self) -> NodeFlags {
        NodeFlags::from_bits_truncate(self.field(4))
    }

    pub fn ksize(&self) -> usize {
        self.field(6) as usize
    }

    pub fn key(&self) -> &'a [u8] {
        let start = self.offset + NODE_HDR_SIZE;
        &self.data[start..start + self.ksize()]
    }

    /// Inline data size (leaf nodes only).
    pub fn data_size(&self) -> usize {
        self.field(0) as usize | (self.field(2) as usize) << 16
    }

    /// Inline data bytes (leaf nodes only; for `BIG_DATA` this is the
    /// 8-byte overflow page number).
    pub fn data(&self) -> Result<&'a [u8]> {
        let start = self.offset + NODE_HDR_SIZE + self.ksize();
        let size = self.data_size();
        if start + size > self.data.len() {
            return Err(Error::Corrupted);
        }
        Ok(&self.data[start..start + size])
    }

    /// 48-bit child page number (branch nodes only).
    pub fn child_pgno(&self) -> u64 {
        self.field(0) as u64 | (self.field(2) as u64) << 16 | (self.field(4) as u64) << 32
    }

    /// First page of the overflow run holding this node's value. The
    /// node stores 8 bytes of page number while its data-size field
    /// records the value length, so this reads the raw bytes directly.
    pub fn overflow_pgno(&self) -> Result<u64> {
        debug_assert!(self.flags().contains(NodeFlags::BIG_DATA));
        let start = self.offset + NODE_HDR_SIZE + self.ksize();
        if start + 8 > self.data.len() {
            return Err(Error::Corrupted);
        }
        Ok(u64::from_le_bytes(
            self.data[start..start + 8].try_into().unwrap(),
        ))
    }

    /// Even-aligned bytes this node occupies in the heap.
    pub fn footprint(&self, is_branch: bool) -> usize {
        if is_branch {
            node_footprint(self.ksize(), 0)
        } else {
            node_footprint(self.ksize(), self.data_size())
        }
    }
}

/// What a new node stores as data.
pub enum NodePayload<'a> {
    /// Inline value bytes.
    Inline(&'a [u8]),
    /// Reserve `usize` zeroed bytes; the caller fills them afterwards.
    Reserve(usize),
    /// 8-byte first page number of an overflow run.
    Overflow(u64),
    /// No data: branch node for the given child page.
    Child(u64),
}

impl NodePayload<'_> {
    fn data_size(&self) -> usize {
        match self {
            NodePayload::Inline(data) => data.len(),
            NodePayload::Reserve(len) => *len,
            NodePayload::Overflow(_) => 8,
            NodePayload::Child(_) => 0,
        }
    }
}

/// Mutable view over the bytes of a page (or embedded sub-page).
pub struct PageMut<'a> {
    data: &'a mut [u8],
}

impl<'a> PageMut<'a> {
    pub fn new(data: &'a mut [u8]) -> PageMut<'a> {
        debug_assert!(data.len() >= PAGE_HDR_SIZE);
        PageMut { data }
    }

    pub fn init(data: &'a mut [u8], pgno: u64, flags: PageFlags) -> PageMut<'a> {
        PageHeader::init(data, pgno, flags);
        PageMut { data }
    }

    pub fn view(&self) -> PageView<'_> {
        PageView::new(self.data)
    }

    pub fn header_mut(&mut self) -> &mut PageHeader {
        PageHeader::from_bytes_mut(self.data)
    }

    pub fn bytes_mut(&mut self) -> &mut [u8] {
        self.data
    }

    /// Insert a node at `index`, shifting the slot table.
    pub fn insert_node(
        &mut self,
        index: usize,
        key: &[u8],
        payload: &NodePayload<'_>,
        node_flags: NodeFlags,
    ) -> Result<()> {
        let view = self.view();
        debug_assert!(!view.is_leaf2());
        let num = view.num_keys();
        if index > num {
            return Err(Error::Corrupted);
        }
        let dsize = payload.data_size();
        let footprint = node_footprint(key.len(), dsize);
        let header = view.header();
        let (lower, upper) = (header.lower(), header.upper());
        if upper - lower < SLOT_SIZE + footprint {
            return Err(Error::PageFull);
        }

        let node_off = upper - footprint;

        // Open the slot at `index`.
        let slot_at = PAGE_HDR_SIZE + index * SLOT_SIZE;
        let slot_end = PAGE_HDR_SIZE + num * SLOT_SIZE;
        self.data.copy_within(slot_at..slot_end, slot_at + SLOT_SIZE);
        self.data[slot_at..slot_at + SLOT_SIZE]
            .copy_from_slice(&(node_off as u16).to_le_bytes());

        // Node header.
        let (lo, hi, flags_field) = match payload {
            NodePayload::Child(pgno) => (
                (*pgno & 0xffff) as u16,
                (*pgno >> 16 & 0xffff) as u16,
                (*pgno >> 32 & 0xffff) as u16,
            ),
            _ => (
                (dsize & 0xffff) as u16,
                (dsize >> 16 & 0xffff) as u16,
                node_flags.bits(),
            ),
        };
        self.data[node_off..node_off + 2].copy_from_slice(&lo.to_le_bytes());
        self.data[node_off + 2..node_off + 4].copy_from_slice(&hi.to_le_bytes());
        self.data[node_off + 4..node_off + 6].copy_from_slice(&flags_field.to_le_bytes());
        self.data[node_off + 6..node_off + 8]
            .copy_from_slice(&(key.len() as u16).to_le_bytes());

        // Key and data.
        let key_at = node_off + NODE_HDR_SIZE;
        self.data[key_at..key_at + key.len()].copy_from_slice(key);
        let data_at = key_at + key.len();
        match payload {
            NodePayload::Inline(bytes) => {
                self.data[data_at..data_at + bytes.len()].copy_from_slice(bytes);
            }
            NodePayload::Reserve(len) => {
                self.data[data_at..data_at + len].fill(0);
            }
            NodePayload::Overflow(pgno) => {
                self.data[data_at..data_at + 8].copy_from_slice(&pgno.to_le_bytes());
            }
            NodePayload::Child(_) => {}
        }

        self.header_mut().set_bounds(lower + SLOT_SIZE, node_off);
        Ok(())
    }

    /// Remove the node at `index`, compacting the heap.
    pub fn delete_node(&mut self, index: usize) -> Result<()> {
        let view = self.view();
        debug_assert!(!view.is_leaf2());
        let num = view.num_keys();
        if index >= num {
            return Err(Error::Corrupted);
        }
        let is_branch = view.is_branch();
        let node = view.node(index)?;
        let node_off = node.offset;
        let footprint = node.footprint(is_branch);
        let upper = view.header().upper();
        let lower = view.header().lower();

        // Slide the heap below the hole up by `footprint` and fix the slot
        // offsets that pointed into the moved region.
        for i in 0..num {
            if i == index {
                continue;
            }
            let slot_at = PAGE_HDR_SIZE + i * SLOT_SIZE;
            let off =
                u16::from_le_bytes([self.data[slot_at], self.data[slot_at + 1]]) as usize;
            if off < node_off {
                self.data[slot_at..slot_at + SLOT_SIZE]
                    .copy_from_slice(&((off + footprint) as u16).to_le_bytes());
            }
        }
        self.data.copy_within(upper..node_off, upper + footprint);

        // Close the slot gap.
        let slot_at = PAGE_HDR_SIZE + index * SLOT_SIZE;
        let slot_end = PAGE_HDR_SIZE + num * SLOT_SIZE;
        self.data.copy_within(slot_at + SLOT_SIZE..slot_end, slot_at);

        self.header_mut()
            .set_bounds(lower - SLOT_SIZE, upper + footprint);
        Ok(())
    }

    /// Overwrite the inline data of the node at `index` with same-size
    /// bytes.
    pub fn overwrite_data(&mut self, index: usize, bytes: &[u8]) -> Result<()> {
        let view = self.view();
        let node = view.node(index)?;
        if node.data_size() != bytes.len() {
            return Err(Error::Problem("in-place overwrite with size change"));
        }
        let at = node.offset + NODE_HDR_SIZE + node.ksize();
        self.data[at..at + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    /// Mutable inline data of the node at `index`.
    pub fn data_mut(self, index: usize) -> Result<&'a mut [u8]> {
        let view = self.view();
        let node = view.node(index)?;
        let at = node.offset + NODE_HDR_SIZE + node.ksize();
        let size = node.data_size();
        if at + size > self.data.len() {
            return Err(Error::Corrupted);
        }
        Ok(&mut self.data[at..at + size])
    }

    /// Point the branch node at `index` at a different child page.
    pub fn set_child_pgno(&mut self, index: usize, pgno: u64) -> Result<()> {
        let view = self.view();
        debug_assert!(view.is_branch());
        let node = view.node(index)?;
        let off = node.offset;
        self.data[off..off + 2].copy_from_slice(&((pgno & 0xffff) as u16).to_le_bytes());
        self.data[off + 2..off + 4]
            .copy_from_slice(&((pgno >> 16 & 0xffff) as u16).to_le_bytes());
        self.data[off + 4..off + 6]
            .copy_from_slice(&((pgno >> 32 & 0xffff) as u16).to_le_bytes());
        Ok(())
    }

    /// Insert a packed key into a `LEAF2` page at `index`.
    pub fn leaf2_insert(&mut self, index: usize, key: &[u8]) -> Result<()> {
        let view = self.view();
        debug_assert!(view.is_leaf2());
        let num = view.num_keys();
        let ksize = key.len();
        if index > num {
            return Err(Error::Corrupted);
        }
        if view.free_space() < ksize {
            return Err(Error::PageFull);
        }
        let at = PAGE_HDR_SIZE + index * ksize;
        let end = PAGE_HDR_SIZE + num * ksize;
        self.data.copy_within(at..end, at + ksize);
        self.data[at..at + ksize].copy_from_slice(key);
        let header = self.header_mut();
        let (lower, upper) = (header.lower(), header.upper());
        header.set_bounds(lower + SLOT_SIZE, upper - (ksize - SLOT_SIZE));
        Ok(())
    }

    /// Remove the packed key at `index` from a `LEAF2` page.
    pub fn leaf2_delete(&mut self, index: usize, ksize: usize) -> Result<()> {
        let view = self.view();
        debug_assert!(view.is_leaf2());
        let num = view.num_keys();
        if index >= num {
            return Err(Error::Corrupted);
        }
        let at = PAGE_HDR_SIZE + index * ksize;
        let end = PAGE_HDR_SIZE + num * ksize;
        self.data.copy_within(at + ksize..end, at);
        let header = self.header_mut();
        let (lower, upper) = (header.lower(), header.upper());
        header.set_bounds(lower - SLOT_SIZE, upper + (ksize - SLOT_SIZE));
        Ok(())
    }
}

/// Structural validation used by page decode and the verifier.
pub fn validate_page(data: &[u8], expected_pgno: u64) -> Result<()> {
    if data.len() < PAGE_HDR_SIZE {
        return Err(Error::Corrupted);
    }
    let header = PageHeader::from_bytes(data);
    if header.pgno() != expected_pgno {
        return Err(Error::Corrupted);
    }
    let flags = header.flags();
    let kind_bits = flags
        & (PageFlags::BRANCH | PageFlags::LEAF | PageFlags::OVERFLOW | PageFlags::META);
    if kind_bits.bits().count_ones() != 1 {
        return Err(Error::Corrupted);
    }
    if !flags.contains(PageFlags::OVERFLOW) && !flags.contains(PageFlags::META) {
        let (lower, upper) = (header.lower(), header.upper());
        if lower < PAGE_HDR_SIZE || lower > upper || upper > data.len() {
            return Err(Error::Corrupted);
        }
    }
    Ok(())
}
