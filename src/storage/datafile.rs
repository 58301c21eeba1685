//! # Data File
//!
//! Owns the data file and its single read-only shared map. All reads go
//! through the map; all writes go through positioned writes on the file
//! descriptor, so the map never needs remapping and readers keep stable
//! `&[u8]` views for the life of their snapshot.
//!
//! Two descriptors are kept: the plain one for bulk dirty-page writes
//! (followed by one `fdatasync`), and an `O_DSYNC` one reserved for the
//! meta page so the snapshot flip is durable the moment the write returns.
//!
//! The file is extended (sparsely) to the full map size when the
//! environment is created or grown, which keeps the map from ever faulting
//! past end-of-file.

use std::fs::{File, OpenOptions};
use std::io::{self, IoSlice};
use std::os::unix::fs::{FileExt, OpenOptionsExt};
use std::os::unix::io::AsRawFd;
use std::path::Path;

use memmap2::{Mmap, MmapOptions};

use super::{Meta, PageHeader, META_SIZE, PAGE_HDR_SIZE, PAGE_SIZE};
use crate::error::{Error, Result};
use crate::flags::PageFlags;

/// Upper bound on buffers per gathered write.
const MAX_WRITE_VECS: usize = 64;

pub(crate) struct DataFile {
    file: File,
    /// `O_DSYNC` descriptor for meta writes; absent when read-only.
    sync_file: Option<File>,
    map: Mmap,
    map_size: usize,
    read_only: bool,
}

impl DataFile {
    /// Open (or create) the data file and map `map_size` bytes of it.
    ///
    /// A fresh file gets its two initial meta pages written before the map
    /// is created. An existing file keeps its recorded map size when that
    /// is larger than the requested one.
    pub fn open(path: &Path, requested_size: usize, read_only: bool) -> Result<DataFile> {
        let file = OpenOptions::new()
            .read(true)
            .write(!read_only)
            .create(!read_only)
            .open(path)?;

        let file_len = file.metadata()?.len();
        let mut map_size = requested_size;

        if file_len == 0 {
            if read_only {
                return Err(Error::Invalid);
            }
            write_initial_metas(&file, map_size as u64)?;
        } else {
            // Respect a larger recorded map size so an old environment is
            // never opened with a window smaller than its own pages.
            let meta = read_newest_meta(&file)?;
            map_size = map_size.max(meta.map_size() as usize);
        }

        if !read_only && file.metadata()?.len() < map_size as u64 {
            file.set_len(map_size as u64)?;
        }
        if read_only {
            map_size = map_size.min(file.metadata()?.len() as usize);
        }

        // SAFETY: mapping a file we just opened. The single-writer protocol
        // guarantees nothing rewrites bytes a live snapshot can reach, and
        // the map length never exceeds the file length, so no reader can
        // fault or observe torn tree pages. Meta pages are the exception
        // and are re-validated on every read.
        let map = unsafe { MmapOptions::new().len(map_size).map(&file)? };

        let sync_file = if read_only {
            None
        } else {
            Some(
                OpenOptions::new()
                    .write(true)
                    .custom_flags(libc::O_DSYNC)
                    .open(path)?,
            )
        };

        Ok(DataFile {
            file,
            sync_file,
            map,
            map_size,
            read_only,
        })
    }

    pub fn map_size(&self) -> usize {
        self.map_size
    }

    pub fn num_pages(&self) -> u64 {
        (self.map_size / PAGE_SIZE) as u64
    }

    /// `count` contiguous pages starting at `pgno`, straight from the map.
    pub fn pages(&self, pgno: u64, count: u64) -> Result<&[u8]> {
        let end = pgno.checked_add(count).ok_or(Error::PageNotFound)?;
        if end > self.num_pages() || count == 0 {
            return Err(Error::PageNotFound);
        }
        let start = pgno as usize * PAGE_SIZE;
        Ok(&self.map[start..start + count as usize * PAGE_SIZE])
    }

    pub fn page(&self, pgno: u64) -> Result<&[u8]> {
        self.pages(pgno, 1)
    }

    /// Gathered positioned write of contiguous page buffers starting at
    /// `pgno`. Buffers must be page-multiples.
    pub fn write_pages_at(&self, pgno: u64, bufs: &[IoSlice<'_>]) -> Result<()> {
        debug_assert!(!self.read_only);
        debug_assert!(bufs.len() <= MAX_WRITE_VECS);
        let offset = pgno * PAGE_SIZE as u64;
        let total: usize = bufs.iter().map(|b| b.len()).sum();

        // SAFETY: the iovec array and every buffer it points at are live
        // for the duration of the call; pwritev does not retain them.
        let written = unsafe {
            libc::pwritev(
                self.file.as_raw_fd(),
                bufs.as_ptr() as *const libc::iovec,
                bufs.len() as libc::c_int,
                offset as i64,
            )
        };
        if written < 0 {
            return Err(io::Error::last_os_error().into());
        }
        let written = written as usize;
        if written == total {
            return Ok(());
        }

        // Short write: finish the remainder buffer by buffer.
        let mut pos = offset + written as u64;
        let mut skip = written;
        for buf in bufs {
            if skip >= buf.len() {
                skip -= buf.len();
                continue;
            }
            self.file.write_all_at(&buf[skip..], pos)?;
            pos += (buf.len() - skip) as u64;
            skip = 0;
        }
        Ok(())
    }

    pub fn sync_data(&self) -> Result<()> {
        // SAFETY: plain fdatasync on an owned descriptor.
        let rc = unsafe { libc::fdatasync(self.file.as_raw_fd()) };
        if rc != 0 {
            return Err(io::Error::last_os_error().into());
        }
        Ok(())
    }

    /// Read one meta slot through the file descriptor (not the map), so a
    /// concurrent flip is seen at whatever order the kernel serializes.
    pub fn read_meta_slot(&self, slot: u64) -> Result<Meta> {
        let mut page = vec![0u8; PAGE_SIZE];
        self.file.read_exact_at(&mut page, slot * PAGE_SIZE as u64)?;
        Meta::from_page(&page)
    }

    /// Write a meta body into its slot. `durable` selects the `O_DSYNC`
    /// descriptor.
    pub fn write_meta(&self, slot: u64, meta: &Meta, durable: bool) -> Result<()> {
        use zerocopy::IntoBytes;
        debug_assert!(slot < super::NUM_META_PAGES);
        let offset = slot * PAGE_SIZE as u64 + PAGE_HDR_SIZE as u64;
        let fd = if durable {
            self.sync_file.as_ref().ok_or(Error::Panic)?
        } else {
            &self.file
        };
        fd.write_all_at(meta.as_bytes(), offset)?;
        Ok(())
    }

    /// Advise the kernel against readahead over the map.
    pub fn advise_random(&self) {
        // SAFETY: the range is exactly the live mapping; MADV_RANDOM is a
        // hint and cannot invalidate it.
        unsafe {
            libc::madvise(
                self.map.as_ptr() as *mut libc::c_void,
                self.map_size,
                libc::MADV_RANDOM,
            );
        }
    }
}

fn write_initial_metas(file: &File, map_size: u64) -> io::Result<()> {
    for slot in 0..super::NUM_META_PAGES {
        let mut page = vec![0u8; PAGE_SIZE];
        PageHeader::init(&mut page, slot, PageFlags::META);
        let meta = Meta::new(map_size);
        use zerocopy::IntoBytes;
        page[PAGE_HDR_SIZE..PAGE_HDR_SIZE + META_SIZE].copy_from_slice(meta.as_bytes());
        file.write_all_at(&page, slot * PAGE_SIZE as u64)?;
    }
    file.sync_data()
}

fn read_newest_meta(file: &File) -> Result<Meta> {
    let mut newest: Option<Meta> = None;
    for slot in 0..super::NUM_META_PAGES {
        let mut page = vec![0u8; PAGE_SIZE];
        if file.read_exact_at(&mut page, slot * PAGE_SIZE as u64).is_err() {
            continue;
        }
        if let Ok(meta) = Meta::from_page(&page) {
            if newest.map_or(true, |m| meta.txnid() > m.txnid()) {
                newest = Some(meta);
            }
        }
    }
    newest.ok_or(Error::Invalid)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn create_writes_both_metas() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data.lynx");
        let data = DataFile::open(&path, 1 << 20, false).unwrap();

        let m0 = data.read_meta_slot(0).unwrap();
        let m1 = data.read_meta_slot(1).unwrap();
        assert_eq!(m0.txnid(), 0);
        assert_eq!(m1.txnid(), 0);
        assert_eq!(data.num_pages(), (1 << 20) / PAGE_SIZE as u64);
    }

    #[test]
    fn file_is_extended_sparsely_to_map_size() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data.lynx");
        let _data = DataFile::open(&path, 1 << 20, false).unwrap();
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 1 << 20);
    }

    #[test]
    fn meta_flip_is_visible_through_map_reads() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data.lynx");
        let data = DataFile::open(&path, 1 << 20, false).unwrap();

        let mut meta = data.read_meta_slot(1).unwrap();
        meta.set_txnid(1);
        meta.set_last_pgno(5);
        data.write_meta(1, &meta, true).unwrap();

        let read = data.read_meta_slot(1).unwrap();
        assert_eq!(read.txnid(), 1);
        assert_eq!(read.last_pgno(), 5);
    }

    #[test]
    fn page_writes_show_up_in_the_map() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data.lynx");
        let data = DataFile::open(&path, 1 << 20, false).unwrap();

        let mut page = vec![0u8; PAGE_SIZE];
        PageHeader::init(&mut page, 7, PageFlags::LEAF);
        page[100] = 0xAB;
        data.write_pages_at(7, &[IoSlice::new(&page)]).unwrap();

        let read = data.page(7).unwrap();
        assert_eq!(read[100], 0xAB);
        assert_eq!(PageHeader::from_bytes(read).pgno(), 7);
    }

    #[test]
    fn gathered_write_covers_multiple_pages() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data.lynx");
        let data = DataFile::open(&path, 1 << 20, false).unwrap();

        let a = vec![0x11u8; PAGE_SIZE];
        let b = vec![0x22u8; PAGE_SIZE];
        data.write_pages_at(10, &[IoSlice::new(&a), IoSlice::new(&b)])
            .unwrap();

        assert_eq!(data.page(10).unwrap()[0], 0x11);
        assert_eq!(data.page(11).unwrap()[0], 0x22);
    }

    #[test]
    fn out_of_range_page_is_not_found() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data.lynx");
        let data = DataFile::open(&path, 1 << 20, false).unwrap();
        let last = data.num_pages();
        assert!(matches!(data.page(last), Err(Error::PageNotFound)));
    }

    #[test]
    fn reopen_keeps_recorded_map_size() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data.lynx");
        drop(DataFile::open(&path, 1 << 20, false).unwrap());

        // A smaller request must not shrink the window.
        let data = DataFile::open(&path, 1 << 16, false).unwrap();
        assert_eq!(data.map_size(), 1 << 20);
    }
}
