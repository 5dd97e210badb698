//! # B+Tree Module
//!
//! The ordered byte-string map at the heart of the store, implemented as a
//! copy-on-write B+tree over fixed-size pages.
//!
//! ## Copy-on-Write Discipline
//!
//! No reachable page is ever edited in place. Every mutation rewrites the
//! spine from the touched leaf up to the root, allocating new pages for
//! the rewritten nodes and reporting the old spine's pointers as freed.
//! The new root only becomes visible when the pager commits, which is what
//! makes each update atomic across crashes.
//!
//! ## Page Access
//!
//! The tree does no I/O of its own. It reaches pages through the
//! [`NodeStore`] trait, whose one production implementation binds the
//! pager and the free list together (recycled pointers are preferred over
//! fresh ones). Tests substitute an in-memory map.
//!
//! - `node`: on-page node format and the staging buffer for oversized
//!   intermediate nodes
//! - `tree`: the insert/delete/lookup algorithms

mod node;
mod tree;

pub use node::{Node, NodeBuf, NODE_HEADER};
pub use tree::{lookup, BTree};

use eyre::Result;

use crate::storage::PAGE_SIZE;

pub const MAX_KEY_SIZE: usize = 1000;
pub const MAX_VALUE_SIZE: usize = 3000;

// A node holding one maximum-size entry must still fit a page.
const _: () =
    assert!(NODE_HEADER + 8 + 2 + 4 + MAX_KEY_SIZE + MAX_VALUE_SIZE <= PAGE_SIZE);

/// Read-only page access, enough for lookups.
pub trait PageRead {
    fn page(&self, ptr: u64) -> Result<&[u8]>;
}

/// Page access for mutations: owned copies to rewrite, allocation of new
/// page images, and collection of freed pointers.
pub trait NodeStore: PageRead {
    /// Owned copy of a page, detached from the store's borrows.
    fn read(&self, ptr: u64) -> Result<NodeBuf> {
        Ok(NodeBuf::from_page(self.page(ptr)?.to_vec()))
    }

    /// Places a finished node on a new page and returns its pointer.
    fn alloc(&mut self, node: NodeBuf) -> Result<u64>;

    /// Records that the page at `ptr` leaves the reachable set when the
    /// current mutation commits.
    fn free(&mut self, ptr: u64);
}
