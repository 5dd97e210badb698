//! # Storage Module
//!
//! The foundational layer of the store: a page-addressed file accessed
//! through a growing list of memory-mapped chunks, a staging pager that
//! turns a batch of page writes into one atomic commit, and a persistent
//! free list that recycles pages released by copy-on-write updates.
//!
//! ## Page Addressing
//!
//! The file is an array of fixed 4096-byte pages. A page is identified by
//! its zero-based index in the file, carried everywhere as a `u64` pointer.
//! Pointer 0 is the master page and is never handed out by the allocator;
//! `0` therefore doubles as the nil pointer in on-disk links.
//!
//! ```text
//! Offset 0:      Page 0   master page (magic, root, used, free-list head)
//! Offset 4096:   Page 1   tree node or free-list node
//! Offset 8192:   Page 2   ...
//! ```
//!
//! ## Page Kinds
//!
//! Every non-master page starts with a 2-byte little-endian kind tag:
//!
//! - **Internal** (1): B+tree internal node
//! - **Leaf** (2): B+tree leaf node
//! - **Free** (3): free-list node
//!
//! ## Durability Model
//!
//! Mutations never touch reachable pages in place. New page images are
//! staged in memory by the `Pager` and only become part of the store when
//! `commit` has copied them into the map, fsynced the file, and atomically
//! rewritten the master page. A crash at any point leaves either the old or
//! the new master page on disk, and with it either the old or the new store
//! state.
//!
//! ## Module Organization
//!
//! - `master`: master-page layout and validation
//! - `mmap`: chunked memory map over the database file
//! - `pager`: page staging and the two-phase commit
//! - `freelist`: persistent LIFO of reusable page pointers

mod freelist;
mod master;
mod mmap;
mod pager;

pub use freelist::{FreeList, FREE_LIST_CAP, FREE_LIST_HEADER};
pub use master::{MasterPage, MASTER_MAGIC, MASTER_SIZE};
pub use mmap::ChunkedMmap;
pub use pager::Pager;

use eyre::bail;

pub const PAGE_SIZE: usize = 4096;

/// Kind tag stored in the first two bytes of every non-master page.
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageKind {
    Internal = 1,
    Leaf = 2,
    Free = 3,
}

impl PageKind {
    pub fn from_u16(raw: u16) -> eyre::Result<Self> {
        match raw {
            1 => Ok(PageKind::Internal),
            2 => Ok(PageKind::Leaf),
            3 => Ok(PageKind::Free),
            _ => bail!("unknown page kind {raw:#06x}"),
        }
    }
}
