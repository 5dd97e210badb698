//! # Pager
//!
//! Owns the database file and turns a transaction's worth of page writes
//! into one atomic, durable commit.
//!
//! ## Staging
//!
//! Between commits the pager accumulates page images in memory:
//!
//! - **Appended** pages occupy fresh pointers past the durable end of the
//!   file (`flushed`, `flushed + 1`, ...).
//! - **Recycled** pages are staged onto pointers below `flushed` that the
//!   free list handed back for reuse. Until commit, the staged image
//!   shadows whatever the map holds for that pointer.
//!
//! `get` serves staged pages transparently, so the tree and the free list
//! can read back anything they wrote in the current transaction.
//!
//! ## Commit Sequence
//!
//! ```text
//! 1. extend the file to cover all appended pages (geometric growth)
//! 2. extend the chunked mmap over the new file size
//! 3. copy every staged page into its mapped slot
//! 4. fsync                      <- staged data is on disk, master still old
//! 5. pwrite the master page     <- the atomic commit point
//! 6. advance flushed, drop staging
//! 7. fsync                      <- master is on disk
//! ```
//!
//! The master page is written with a positioned write on the file
//! descriptor, not through the map: a 40-byte mmap store has no atomicity
//! guarantee, while the recovery protocol only has to tolerate torn
//! *sector*-level writes, which the signature and bounds checks catch.
//!
//! An error anywhere before step 5 leaves `flushed` and the staging lists
//! untouched; the caller discards the staged pages and the previous state
//! remains current on disk and in memory. An error in step 7 is reported,
//! but the new state is already canonical.
//!
//! ## File Growth
//!
//! Growing by `max(1, pages/8)` until the target is covered bounds the
//! number of metadata updates at roughly one per 12.5% of file growth, the
//! same amortization the mmap chunks use in the address space.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;

use eyre::{bail, ensure, Result, WrapErr};
use zerocopy::IntoBytes;

use super::{ChunkedMmap, MasterPage, PAGE_SIZE};

#[derive(Debug)]
pub struct Pager {
    file: File,
    mmap: ChunkedMmap,
    file_size: u64,
    flushed: u64,
    appended: Vec<Vec<u8>>,
    reused: HashMap<u64, Vec<u8>>,
    master_written: bool,
    #[cfg(test)]
    pub(crate) fail_data_sync: bool,
}

impl Pager {
    /// Opens or creates the database file and loads the master page.
    /// Returns the pager plus the recovered root and free-list head.
    pub fn open<P: AsRef<Path>>(path: P, mmap_reserve: usize) -> Result<(Self, u64, u64)> {
        let path = path.as_ref();

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)
            .wrap_err_with(|| format!("failed to open database file '{}'", path.display()))?;

        let file_size = file
            .metadata()
            .wrap_err_with(|| format!("failed to stat '{}'", path.display()))?
            .len();

        ensure!(
            file_size % PAGE_SIZE as u64 == 0,
            "database file '{}' size {} is not a multiple of page size {}",
            path.display(),
            file_size,
            PAGE_SIZE
        );

        let mmap = ChunkedMmap::map(&file, file_size, mmap_reserve)?;

        let mut pager = Self {
            file,
            mmap,
            file_size,
            flushed: 1,
            appended: Vec::new(),
            reused: HashMap::new(),
            master_written: false,
            #[cfg(test)]
            fail_data_sync: false,
        };

        if file_size == 0 {
            // Fresh file: page 0 is reserved for the master page, which is
            // written on the first commit.
            return Ok((pager, 0, 0));
        }

        let file_pages = file_size / PAGE_SIZE as u64;
        let (root, used, freelist_head) = {
            let master = MasterPage::from_bytes(pager.mmap.page(0)?, file_pages)?;
            (master.root(), master.used(), master.freelist_head())
        };
        pager.flushed = used;

        Ok((pager, root, freelist_head))
    }

    /// Number of durable pages; equals the master page's `used` field.
    pub fn flushed(&self) -> u64 {
        self.flushed
    }

    /// Dereferences a page pointer, serving staged images before the map.
    pub fn get(&self, ptr: u64) -> Result<&[u8]> {
        ensure!(ptr != 0, "page 0 is the master page, not addressable");

        if let Some(page) = self.reused.get(&ptr) {
            return Ok(page);
        }
        if ptr < self.flushed {
            return self.mmap.page(ptr);
        }

        let staged = (ptr - self.flushed) as usize;
        match self.appended.get(staged) {
            Some(page) => Ok(page),
            None => bail!(
                "page {} out of range (flushed={}, staged={})",
                ptr,
                self.flushed,
                self.appended.len()
            ),
        }
    }

    /// Stages a page at a fresh pointer past the durable end of the file.
    pub fn append(&mut self, page: Vec<u8>) -> Result<u64> {
        ensure!(
            page.len() == PAGE_SIZE,
            "staged page must be {} bytes, got {}",
            PAGE_SIZE,
            page.len()
        );

        let ptr = self.flushed + self.appended.len() as u64;
        self.appended.push(page);
        Ok(ptr)
    }

    /// Stages a page onto a recycled pointer below the durable end.
    pub fn write_at(&mut self, ptr: u64, page: Vec<u8>) -> Result<()> {
        ensure!(
            page.len() == PAGE_SIZE,
            "staged page must be {} bytes, got {}",
            PAGE_SIZE,
            page.len()
        );
        ensure!(
            ptr != 0 && ptr < self.flushed,
            "recycled pointer {} not in 1..{}",
            ptr,
            self.flushed
        );

        self.reused.insert(ptr, page);
        Ok(())
    }

    /// Mutable access to a page staged in the current transaction.
    pub fn staged_mut(&mut self, ptr: u64) -> Result<&mut [u8]> {
        if let Some(page) = self.reused.get_mut(&ptr) {
            return Ok(page);
        }
        if ptr >= self.flushed {
            let staged = (ptr - self.flushed) as usize;
            if let Some(page) = self.appended.get_mut(staged) {
                return Ok(page);
            }
        }
        bail!("page {} is not staged in this transaction", ptr)
    }

    /// Discards all staged pages. The durable state is unaffected.
    pub fn rollback(&mut self) {
        self.appended.clear();
        self.reused.clear();
    }

    /// Whether the last `commit` call reached the master-page write. Past
    /// that point the new state is canonical even if commit returned an
    /// error from the final fsync.
    pub fn master_written(&self) -> bool {
        self.master_written
    }

    /// The two-phase durable write; see the module docs for the sequence.
    pub fn commit(&mut self, root: u64, freelist_head: u64) -> Result<()> {
        self.master_written = false;

        let target = self.flushed + self.appended.len() as u64;
        self.extend_file(target)?;
        self.mmap.extend(&self.file, target)?;

        for (i, page) in self.appended.iter().enumerate() {
            let slot = self.mmap.page_mut(self.flushed + i as u64)?;
            slot.copy_from_slice(page);
        }
        for (&ptr, page) in &self.reused {
            let slot = self.mmap.page_mut(ptr)?;
            slot.copy_from_slice(page);
        }

        #[cfg(test)]
        if self.fail_data_sync {
            bail!("injected fsync failure before master write");
        }
        self.file
            .sync_all()
            .wrap_err("fsync before master write failed")?;

        // The commit point. A positioned write on the descriptor, not a
        // store through the map: mmap writes have no atomicity guarantee.
        let master = MasterPage::new(root, target, freelist_head);
        self.file
            .write_all_at(master.as_bytes(), 0)
            .wrap_err("master page write failed")?;
        self.master_written = true;

        self.flushed = target;
        self.appended.clear();
        self.reused.clear();

        self.file
            .sync_all()
            .wrap_err("fsync after master write failed")?;

        Ok(())
    }

    fn extend_file(&mut self, target: u64) -> Result<()> {
        let mut pages = self.file_size / PAGE_SIZE as u64;
        if pages >= target {
            return Ok(());
        }

        while pages < target {
            pages += (pages / 8).max(1);
        }

        let new_size = pages * PAGE_SIZE as u64;
        self.file
            .set_len(new_size)
            .wrap_err_with(|| format!("failed to extend file to {} bytes", new_size))?;
        self.file_size = new_size;

        Ok(())
    }
}
