//! # Chunked Memory Map
//!
//! Memory-mapped access to the database file through a growing list of
//! fixed mappings instead of a single remapped region.
//!
//! ## Why Chunks?
//!
//! A single `mmap` that is unmapped and recreated on growth invalidates
//! every outstanding pointer into the old region. Keeping each mapping
//! alive for the lifetime of the handle sidesteps that entirely: growth
//! appends a new chunk covering the bytes past the current mapped total,
//! and addresses inside old chunks stay valid until `ChunkedMmap` is
//! dropped.
//!
//! ## Growth Policy
//!
//! The initial chunk reserves at least the requested minimum (64 MiB by
//! default), rounded up to a power of two that covers the current file
//! size. Each extension maps a chunk as large as everything mapped so far,
//! doubling the total. Mapped bytes may extend past the end of the file;
//! they are only dereferenced for offsets below the file size, which the
//! pager guarantees by extending the file before copying pages in.
//!
//! ## Safety
//!
//! The usual mmap hazards are contained the same way the rest of the crate
//! contains them:
//!
//! - `page(&self)` and `page_mut(&mut self)` go through the borrow checker,
//!   so no page reference survives a call that could add chunks.
//! - The file is owned by the single-writer store for its whole lifetime;
//!   no other process rewrites it underneath the map.

use std::fs::File;

use eyre::{bail, Result, WrapErr};
use memmap2::{MmapMut, MmapOptions};

use super::PAGE_SIZE;

#[derive(Debug)]
pub struct ChunkedMmap {
    chunks: Vec<MmapMut>,
    total: usize,
}

impl ChunkedMmap {
    /// Maps the initial chunk. `reserve` is the smallest acceptable mapping;
    /// the actual size is the next power of two covering the file.
    pub fn map(file: &File, file_size: u64, reserve: usize) -> Result<Self> {
        let mut len = reserve.max(PAGE_SIZE).next_power_of_two();
        while (len as u64) < file_size {
            len *= 2;
        }

        // SAFETY: MmapMut::map_mut is unsafe because the mapping can be
        // invalidated by external file modification. This is safe because:
        // 1. The store holds the file exclusively from open to close
        // 2. The mapping may exceed the file size, but callers only touch
        //    offsets below it (the pager extends the file first)
        // 3. The chunk lives as long as the ChunkedMmap that owns it
        let chunk = unsafe {
            MmapOptions::new()
                .len(len)
                .map_mut(file)
                .wrap_err("failed to memory-map database file")?
        };

        Ok(Self {
            chunks: vec![chunk],
            total: len,
        })
    }

    /// Ensures at least `pages` pages are covered by mappings, appending
    /// doubling chunks as needed. Existing chunks are never remapped.
    pub fn extend(&mut self, file: &File, pages: u64) -> Result<()> {
        let needed = pages as usize * PAGE_SIZE;
        while self.total < needed {
            // SAFETY: same justification as in `map`; the new chunk covers
            // [total, 2*total) and is dereferenced only below the file size.
            let chunk = unsafe {
                MmapOptions::new()
                    .offset(self.total as u64)
                    .len(self.total)
                    .map_mut(file)
                    .wrap_err_with(|| {
                        format!("failed to extend memory map past {} bytes", self.total)
                    })?
            };
            self.chunks.push(chunk);
            self.total *= 2;
        }
        Ok(())
    }

    pub fn page(&self, ptr: u64) -> Result<&[u8]> {
        let (chunk, offset) = self.locate(ptr)?;
        Ok(&self.chunks[chunk][offset..offset + PAGE_SIZE])
    }

    pub fn page_mut(&mut self, ptr: u64) -> Result<&mut [u8]> {
        let (chunk, offset) = self.locate(ptr)?;
        Ok(&mut self.chunks[chunk][offset..offset + PAGE_SIZE])
    }

    /// Total pages covered by the mappings (not the file size).
    pub fn pages(&self) -> u64 {
        (self.total / PAGE_SIZE) as u64
    }

    fn locate(&self, ptr: u64) -> Result<(usize, usize)> {
        let mut start = 0u64;
        for (i, chunk) in self.chunks.iter().enumerate() {
            let end = start + (chunk.len() / PAGE_SIZE) as u64;
            if ptr < end {
                return Ok((i, (ptr - start) as usize * PAGE_SIZE));
            }
            start = end;
        }
        bail!("page {} beyond mapped region ({} pages)", ptr, start)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::OpenOptions;
    use tempfile::tempdir;

    fn create_file(pages: usize) -> (tempfile::TempDir, File) {
        let dir = tempdir().unwrap();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(dir.path().join("test.db"))
            .unwrap();
        file.set_len((pages * PAGE_SIZE) as u64).unwrap();
        (dir, file)
    }

    #[test]
    fn map_rounds_reserve_up_to_power_of_two() {
        let (_dir, file) = create_file(4);

        let mmap = ChunkedMmap::map(&file, 4 * PAGE_SIZE as u64, 3 * PAGE_SIZE).unwrap();

        assert_eq!(mmap.pages(), 4);
    }

    #[test]
    fn map_covers_file_larger_than_reserve() {
        let (_dir, file) = create_file(16);

        let mmap = ChunkedMmap::map(&file, 16 * PAGE_SIZE as u64, PAGE_SIZE).unwrap();

        assert!(mmap.pages() >= 16);
    }

    #[test]
    fn extend_doubles_until_covered() {
        let (_dir, file) = create_file(2);
        let mut mmap = ChunkedMmap::map(&file, 2 * PAGE_SIZE as u64, PAGE_SIZE).unwrap();
        assert_eq!(mmap.pages(), 2);

        file.set_len((9 * PAGE_SIZE) as u64).unwrap();
        mmap.extend(&file, 9).unwrap();

        assert!(mmap.pages() >= 9);
        assert_eq!(mmap.pages(), 16);
    }

    #[test]
    fn pages_read_back_across_chunk_boundary() {
        let (_dir, file) = create_file(2);
        let mut mmap = ChunkedMmap::map(&file, 2 * PAGE_SIZE as u64, PAGE_SIZE).unwrap();

        file.set_len((4 * PAGE_SIZE) as u64).unwrap();
        mmap.extend(&file, 4).unwrap();

        for ptr in 0..4u64 {
            let fill = 0x10 + ptr as u8;
            mmap.page_mut(ptr).unwrap().fill(fill);
        }
        for ptr in 0..4u64 {
            let fill = 0x10 + ptr as u8;
            assert!(mmap.page(ptr).unwrap().iter().all(|&b| b == fill));
        }
    }

    #[test]
    fn page_beyond_mapping_is_an_error() {
        let (_dir, file) = create_file(2);
        let mmap = ChunkedMmap::map(&file, 2 * PAGE_SIZE as u64, PAGE_SIZE).unwrap();

        let result = mmap.page(100);

        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("beyond mapped"));
    }
}
