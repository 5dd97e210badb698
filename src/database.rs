//! # Database
//!
//! The public face of the store and the binding layer between the three
//! core subsystems. Each mutation runs the same orchestration:
//!
//! ```text
//! 1. copy-on-write tree mutation, collecting freed pointers and
//!    preferring recycled pages over fresh ones
//! 2. fold the freed pointers into the free list
//! 3. pager commit: staged pages -> fsync -> master page -> fsync
//! ```
//!
//! `set` and `del` return only once the commit has made the change
//! durable. If anything fails before the master-page write, the staged
//! pages, the free-list head, and the root are rolled back so the
//! pre-mutation state stays current and the operation can be retried. A
//! failure after the master write is reported, but the new state is
//! already canonical on disk.
//!
//! ## Single Writer
//!
//! One mutation runs at a time; `set` and `del` take `&mut self` and the
//! borrow checker enforces the rest. Readers run between mutations and
//! borrow pages straight out of the map.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use eyre::{bail, ensure, Result};

use crate::btree::{self, BTree, Node, NodeBuf, NodeStore, PageRead};
use crate::storage::{FreeList, PageKind, Pager, PAGE_SIZE};

const DEFAULT_MMAP_RESERVE: usize = 64 << 20;

#[derive(Debug)]
pub struct Database {
    pager: Pager,
    freelist: FreeList,
    root: u64,
}

/// Open-time configuration, in the builder style.
#[derive(Debug, Default)]
pub struct DatabaseBuilder {
    path: Option<PathBuf>,
    mmap_reserve: usize,
}

impl DatabaseBuilder {
    pub fn path<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.path = Some(path.as_ref().to_path_buf());
        self
    }

    /// Minimum bytes of address space reserved by the initial mapping.
    /// The default of 64 MiB avoids chunk churn for typical files.
    pub fn mmap_reserve(mut self, bytes: usize) -> Self {
        self.mmap_reserve = bytes;
        self
    }

    pub fn open(self) -> Result<Database> {
        let path = match self.path {
            Some(path) => path,
            None => bail!("no database path configured"),
        };
        let reserve = if self.mmap_reserve == 0 {
            DEFAULT_MMAP_RESERVE
        } else {
            self.mmap_reserve
        };

        let (pager, root, freelist_head) = Pager::open(&path, reserve)?;
        Ok(Database {
            pager,
            freelist: FreeList::new(freelist_head),
            root,
        })
    }
}

impl PageRead for Pager {
    fn page(&self, ptr: u64) -> Result<&[u8]> {
        self.get(ptr)
    }
}

/// Per-mutation page allocator: recycled pointers first, fresh ones after.
/// Collects the pop count and the freed set for the free-list update that
/// runs before commit.
struct TxPages<'a> {
    pager: &'a mut Pager,
    freelist: &'a FreeList,
    popped: usize,
    freed: Vec<u64>,
}

impl PageRead for TxPages<'_> {
    fn page(&self, ptr: u64) -> Result<&[u8]> {
        self.pager.get(ptr)
    }
}

impl NodeStore for TxPages<'_> {
    fn alloc(&mut self, node: NodeBuf) -> Result<u64> {
        let page = node.into_page();
        if (self.popped as u64) < self.freelist.total(self.pager)? {
            let ptr = self.freelist.get_nth(self.pager, self.popped)?;
            self.popped += 1;
            self.pager.write_at(ptr, page)?;
            Ok(ptr)
        } else {
            self.pager.append(page)
        }
    }

    fn free(&mut self, ptr: u64) {
        self.freed.push(ptr);
    }
}

impl Database {
    pub fn builder() -> DatabaseBuilder {
        DatabaseBuilder::default()
    }

    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::builder().path(path).open()
    }

    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        btree::lookup(&self.pager, self.root, key)
    }

    /// Adds or overwrites a key. Durable on return.
    pub fn set(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        let old_head = self.freelist.head();

        let mut tx = TxPages {
            pager: &mut self.pager,
            freelist: &self.freelist,
            popped: 0,
            freed: Vec::new(),
        };
        let mut tree = BTree::new(&mut tx, self.root);
        let inserted = tree.insert(key, value);
        let new_root = tree.root();
        let (popped, freed) = (tx.popped, tx.freed);

        if let Err(e) = inserted {
            self.pager.rollback();
            return Err(e);
        }
        self.commit_mutation(new_root, old_head, popped, freed)
    }

    /// Removes a key; returns whether it was present. Durable on return
    /// when a removal happened.
    pub fn del(&mut self, key: &[u8]) -> Result<bool> {
        let old_head = self.freelist.head();

        let mut tx = TxPages {
            pager: &mut self.pager,
            freelist: &self.freelist,
            popped: 0,
            freed: Vec::new(),
        };
        let mut tree = BTree::new(&mut tx, self.root);
        let deleted = tree.delete(key);
        let new_root = tree.root();
        let (popped, freed) = (tx.popped, tx.freed);

        match deleted {
            Ok(true) => {}
            Ok(false) => return Ok(false),
            Err(e) => {
                self.pager.rollback();
                return Err(e);
            }
        }
        self.commit_mutation(new_root, old_head, popped, freed)?;
        Ok(true)
    }

    pub fn close(self) {}

    /// Total pages in the store, including the master page.
    pub fn used_pages(&self) -> u64 {
        self.pager.flushed()
    }

    /// Pointers currently available for reuse on the free list.
    pub fn free_pages(&self) -> Result<u64> {
        self.freelist.total(&self.pager)
    }

    pub fn root_ptr(&self) -> u64 {
        self.root
    }

    fn commit_mutation(
        &mut self,
        new_root: u64,
        old_head: u64,
        popped: usize,
        freed: Vec<u64>,
    ) -> Result<()> {
        if let Err(e) = self.freelist.update(&mut self.pager, popped, freed) {
            self.freelist.set_head(old_head);
            self.pager.rollback();
            return Err(e);
        }

        match self.pager.commit(new_root, self.freelist.head()) {
            Ok(()) => {
                self.root = new_root;
                Ok(())
            }
            Err(e) if self.pager.master_written() => {
                // The commit point was reached; the new state is canonical
                // even though the trailing fsync failed.
                self.root = new_root;
                Err(e)
            }
            Err(e) => {
                self.freelist.set_head(old_head);
                self.pager.rollback();
                Err(e)
            }
        }
    }

    /// Full structural audit: every invariant the on-disk state promises.
    ///
    /// - tree pages, free-list pages, and free pointers are disjoint and,
    ///   with the master page, account for every page in the file
    /// - keys within each node are strictly increasing
    /// - each child's first key equals its parent's key for it
    /// - all leaves sit at the same depth
    /// - no node exceeds a page
    pub fn check(&self) -> Result<()> {
        let used = self.pager.flushed();
        let mut seen: HashSet<u64> = HashSet::new();

        if self.root != 0 {
            let mut leaf_depth: Option<usize> = None;
            let mut stack: Vec<(u64, Vec<u8>, usize)> = vec![(self.root, Vec::new(), 0)];
            while let Some((ptr, first_key, depth)) = stack.pop() {
                ensure!(
                    ptr != 0 && ptr < used,
                    "tree pointer {} outside the file ({} pages)",
                    ptr,
                    used
                );
                ensure!(seen.insert(ptr), "page {} reached twice", ptr);

                let node = Node::from_page(self.pager.get(ptr)?);
                ensure!(
                    node.nbytes() <= PAGE_SIZE,
                    "node {} overflows a page",
                    ptr
                );
                ensure!(
                    node.key_at(0) == &first_key[..],
                    "node {} first key disagrees with its parent",
                    ptr
                );
                for i in 1..node.nkeys() {
                    ensure!(
                        node.key_at(i - 1) < node.key_at(i),
                        "node {} keys out of order at index {}",
                        ptr,
                        i
                    );
                }

                match node.kind()? {
                    PageKind::Leaf => match leaf_depth {
                        None => leaf_depth = Some(depth),
                        Some(expected) => {
                            ensure!(depth == expected, "leaves at unequal depths")
                        }
                    },
                    PageKind::Internal => {
                        ensure!(node.nkeys() > 0, "empty internal node {}", ptr);
                        for i in 0..node.nkeys() {
                            stack.push((node.ptr_at(i), node.key_at(i).to_vec(), depth + 1));
                        }
                    }
                    PageKind::Free => bail!("free-list page {} reachable from the root", ptr),
                }
            }
        }

        let (chain, entries) = self.freelist.walk(&self.pager)?;
        for &ptr in &chain {
            ensure!(ptr < used, "free-list page {} outside the file", ptr);
            ensure!(seen.insert(ptr), "free-list page {} also reachable", ptr);
        }
        for &ptr in &entries {
            ensure!(
                ptr != 0 && ptr < used,
                "free pointer {} outside the file",
                ptr
            );
            ensure!(seen.insert(ptr), "free pointer {} also in use", ptr);
        }
        ensure!(
            self.freelist.total(&self.pager)? == entries.len() as u64,
            "free-list total {} disagrees with its contents {}",
            self.freelist.total(&self.pager)?,
            entries.len()
        );

        ensure!(
            1 + seen.len() as u64 == used,
            "page accounting mismatch: 1 master + {} tracked != {} used",
            seen.len(),
            used
        );
        Ok(())
    }
}
