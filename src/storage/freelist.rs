//! # Free List
//!
//! Persistent tracking of pages released by copy-on-write updates, so
//! later updates can reuse them instead of growing the file forever.
//!
//! ## Node Layout
//!
//! The list is a head-first chain of `Free` pages:
//!
//! ```text
//! Offset  Size    Field
//! ------  ------  ----------------------------------------
//! 0       2       kind tag (Free)
//! 2       2       size: pointers stored in this node
//! 4       8       next: pointer of the next node (0 = none)
//! 12      8       total: list length, meaningful in the head node only
//! 20      8*size  pointers, oldest first
//! ```
//!
//! Each node holds up to `FREE_LIST_CAP` pointers. The `total` field of
//! non-head nodes is stale by design; only the head's is rewritten.
//!
//! ## Self-Hosting Allocation
//!
//! The update that records freed pages needs pages of its own to store
//! them. Taking those from the pager would grow the file on every delete;
//! taking them from the list being updated risks a bootstrap cycle.
//! `update` resolves this the same way it pops: it consumes the head nodes
//! it is about to rewrite, reuses pointers *stored in them* as backing
//! pages for the rebuilt prefix, and folds the consumed nodes' own
//! pointers back into the freed set. Pointers reused as backing pages this
//! way were free in the previous durable state, so staging over them never
//! damages what a crash would recover.
//!
//! ## Ordering
//!
//! The list behaves as a LIFO: `get_nth(0)` is the most recently freed
//! pointer still available, which biases reuse toward pages that are warm
//! in the page cache.

use eyre::{ensure, Result};
use zerocopy::little_endian::{U16, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use super::{PageKind, Pager, PAGE_SIZE};

pub const FREE_LIST_HEADER: usize = 20;
pub const FREE_LIST_CAP: usize = (PAGE_SIZE - FREE_LIST_HEADER) / 8;

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
struct FreeNodeHeader {
    kind: U16,
    size: U16,
    next: U64,
    total: U64,
}

const _: () = assert!(std::mem::size_of::<FreeNodeHeader>() == FREE_LIST_HEADER);

impl FreeNodeHeader {
    fn from_page(page: &[u8]) -> Result<&Self> {
        ensure!(
            page.len() >= FREE_LIST_HEADER,
            "buffer too small for FreeNodeHeader: {} < {}",
            page.len(),
            FREE_LIST_HEADER
        );
        let header = Self::ref_from_bytes(&page[..FREE_LIST_HEADER])
            .map_err(|e| eyre::eyre!("failed to parse FreeNodeHeader: {:?}", e))?;
        ensure!(
            header.kind.get() == PageKind::Free as u16,
            "page is not a free-list node (kind {:#06x})",
            header.kind.get()
        );
        Ok(header)
    }
}

fn entry(page: &[u8], i: usize) -> u64 {
    let offset = FREE_LIST_HEADER + i * 8;
    u64::from_le_bytes(page[offset..offset + 8].try_into().unwrap())
}

fn make_node(ptrs: &[u64], next: u64) -> Vec<u8> {
    debug_assert!(ptrs.len() <= FREE_LIST_CAP);

    let mut page = vec![0u8; PAGE_SIZE];
    let header = FreeNodeHeader {
        kind: U16::new(PageKind::Free as u16),
        size: U16::new(ptrs.len() as u16),
        next: U64::new(next),
        total: U64::new(0),
    };
    page[..FREE_LIST_HEADER].copy_from_slice(header.as_bytes());
    for (i, &ptr) in ptrs.iter().enumerate() {
        let offset = FREE_LIST_HEADER + i * 8;
        page[offset..offset + 8].copy_from_slice(&ptr.to_le_bytes());
    }
    page
}

/// The in-memory handle is a single pointer; everything else lives on
/// pages managed through the pager.
#[derive(Debug)]
pub struct FreeList {
    head: u64,
}

impl FreeList {
    pub fn new(head: u64) -> Self {
        Self { head }
    }

    pub fn head(&self) -> u64 {
        self.head
    }

    pub(crate) fn set_head(&mut self, head: u64) {
        self.head = head;
    }

    /// Number of reusable pointers on the list.
    pub fn total(&self, pager: &Pager) -> Result<u64> {
        if self.head == 0 {
            return Ok(0);
        }
        let page = pager.get(self.head)?;
        Ok(FreeNodeHeader::from_page(page)?.total.get())
    }

    /// Returns the `topn`-th pointer counting from the most recently
    /// freed end. Precondition: `topn < total()`.
    pub fn get_nth(&self, pager: &Pager, topn: usize) -> Result<u64> {
        ensure!(
            (topn as u64) < self.total(pager)?,
            "free-list index {} out of range",
            topn
        );

        let mut node = self.head;
        let mut topn = topn;
        loop {
            let page = pager.get(node)?;
            let header = FreeNodeHeader::from_page(page)?;
            let size = header.size.get() as usize;
            if topn < size {
                return Ok(entry(page, size - topn - 1));
            }
            topn -= size;
            node = header.next.get();
            ensure!(node != 0, "free-list chain ended before index");
        }
    }

    /// Removes the top `popn` pointers and appends `freed`. Consumed chain
    /// nodes donate their own pointers as backing storage for the rebuilt
    /// prefix, so the update never allocates from the list it is editing.
    pub fn update(&mut self, pager: &mut Pager, popn: usize, freed: Vec<u64>) -> Result<()> {
        ensure!(
            (popn as u64) <= self.total(pager)?,
            "cannot pop {} pointers from the free list",
            popn
        );
        if popn == 0 && freed.is_empty() {
            return Ok(());
        }
        // A transaction that reuses pages always frees its old spine.
        ensure!(
            !freed.is_empty(),
            "free-list pop without freed pages breaks the rebuild invariant"
        );

        let mut freed = freed;
        let mut popn = popn;
        let mut total = self.total(pager)?;
        let mut reuse: Vec<u64> = Vec::new();

        // Consume head nodes until the pointers harvested for reuse can
        // host every freed pointer, or the chain runs out.
        while self.head != 0 && reuse.len() * FREE_LIST_CAP < freed.len() {
            let (size, next, entries) = {
                let page = pager.get(self.head)?;
                let header = FreeNodeHeader::from_page(page)?;
                let size = header.size.get() as usize;
                let entries: Vec<u64> = (0..size).map(|i| entry(page, i)).collect();
                (size, header.next.get(), entries)
            };

            // The node page itself is now free.
            freed.push(self.head);

            if popn >= size {
                popn -= size;
            } else {
                let mut remain = size - popn;
                popn = 0;
                while remain > 0 && reuse.len() * FREE_LIST_CAP < freed.len() + remain {
                    remain -= 1;
                    reuse.push(entries[remain]);
                }
                for &ptr in &entries[..remain] {
                    freed.push(ptr);
                }
            }

            total -= size as u64;
            self.head = next;
        }

        ensure!(
            reuse.len() * FREE_LIST_CAP >= freed.len() || self.head == 0,
            "free-list rebuild ran out of reusable pages"
        );

        let new_total = total + freed.len() as u64;
        self.push(pager, freed, reuse)?;

        // Only the head node's total is authoritative; fix it up in place
        // on the staged page.
        let page = pager.staged_mut(self.head)?;
        let offset = 12;
        page[offset..offset + 8].copy_from_slice(&new_total.to_le_bytes());

        Ok(())
    }

    /// Collects every chain page and every stored pointer, for integrity
    /// checks: the two sets plus the reachable tree partition the file.
    pub fn walk(&self, pager: &Pager) -> Result<(Vec<u64>, Vec<u64>)> {
        let mut chain = Vec::new();
        let mut entries = Vec::new();
        let mut node = self.head;
        while node != 0 {
            chain.push(node);
            let page = pager.get(node)?;
            let header = FreeNodeHeader::from_page(page)?;
            for i in 0..header.size.get() as usize {
                entries.push(entry(page, i));
            }
            node = header.next.get();
            ensure!(
                chain.len() <= pager.flushed() as usize,
                "free-list chain forms a cycle"
            );
        }
        Ok((chain, entries))
    }

    fn push(&mut self, pager: &mut Pager, freed: Vec<u64>, reuse: Vec<u64>) -> Result<()> {
        let mut rest = &freed[..];
        let mut reuse = reuse.into_iter();

        while !rest.is_empty() {
            let size = rest.len().min(FREE_LIST_CAP);
            let page = make_node(&rest[..size], self.head);
            rest = &rest[size..];

            match reuse.next() {
                Some(ptr) => {
                    pager.write_at(ptr, page)?;
                    self.head = ptr;
                }
                None => {
                    self.head = pager.append(page)?;
                }
            }
        }

        ensure!(
            reuse.next().is_none(),
            "free-list rebuild left reusable pages unconsumed"
        );
        Ok(())
    }
}
