//! # Copy-on-Write Tree Operations
//!
//! ## Insert
//!
//! Insertion recurses from the root. Each level rewrites its node into a
//! staging buffer that may temporarily exceed one page; on the way back up
//! the parent splits the child's result into one to three page-sized
//! nodes and links them in place of the old child. If the root itself
//! splits, a new internal root is created over the pieces.
//!
//! ## Split
//!
//! A node that fits a page passes through untouched. Otherwise the split
//! point starts at half the keys and is nudged until the right half fits a
//! page; the left half almost always fits too, except when a near
//! page-sized entry crowds it, in which case the left half is split once
//! more. The result is 1, 2, or 3 nodes, each within a page.
//!
//! ## Delete
//!
//! Deletion recurses the same way but nodes only shrink, so instead of
//! splitting, the parent checks whether the shrunken child should merge
//! with a sibling: a child at or below a quarter page merges left (or
//! right) whenever the combined node fits one page. At the root, an
//! internal node left with a single child is collapsed into that child,
//! trimming a level.
//!
//! ## Freed Pointers
//!
//! Every rewritten or merged-away page is reported through
//! `NodeStore::free`. The store accumulates them for the free list; the
//! tree itself never reuses or reads a freed pointer within the same
//! mutation.

use eyre::{bail, ensure, Result};
use smallvec::SmallVec;

use crate::storage::{PageKind, PAGE_SIZE};

use super::node::{Node, NodeBuf, NODE_HEADER};
use super::{NodeStore, PageRead, MAX_KEY_SIZE, MAX_VALUE_SIZE};

/// Result of a split pass: one to three page-sized nodes.
type Split = SmallVec<[NodeBuf; 3]>;

#[derive(Debug)]
pub struct BTree<'s, S: NodeStore> {
    store: &'s mut S,
    root: u64,
}

impl<'s, S: NodeStore> BTree<'s, S> {
    pub fn new(store: &'s mut S, root: u64) -> Self {
        Self { store, root }
    }

    /// Root pointer after the operations performed so far.
    pub fn root(&self) -> u64 {
        self.root
    }

    pub fn lookup(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        lookup(&*self.store, self.root, key)
    }

    /// Adds or overwrites a key.
    pub fn insert(&mut self, key: &[u8], val: &[u8]) -> Result<()> {
        check_key(key)?;
        ensure!(
            val.len() <= MAX_VALUE_SIZE,
            "value length {} exceeds maximum {}",
            val.len(),
            MAX_VALUE_SIZE
        );

        if self.root == 0 {
            // First entry: a root leaf whose index 0 carries the empty
            // sentinel key, so lookups always have a bounding key.
            let mut root = NodeBuf::new(1);
            root.set_header(PageKind::Leaf, 2);
            root.append_kv(0, 0, b"", b"");
            root.append_kv(1, 0, key, val);
            self.root = self.store.alloc(root)?;
            return Ok(());
        }

        let node = self.store.read(self.root)?;
        self.store.free(self.root);

        let grown = tree_insert(self.store, node, key, val)?;
        let mut split = node_split3(grown)?;

        if split.len() == 1 {
            self.root = self.store.alloc(split.remove(0))?;
        } else {
            let mut root = NodeBuf::new(1);
            root.set_header(PageKind::Internal, split.len() as u16);
            for (i, child) in split.drain(..).enumerate() {
                let first = child.view().key_at(0).to_vec();
                let ptr = self.store.alloc(child)?;
                root.append_kv(i as u16, ptr, &first, b"");
            }
            self.root = self.store.alloc(root)?;
        }
        Ok(())
    }

    /// Removes a key; returns whether it was present.
    pub fn delete(&mut self, key: &[u8]) -> Result<bool> {
        check_key(key)?;

        if self.root == 0 {
            return Ok(false);
        }

        let node = self.store.read(self.root)?;
        let updated = match tree_delete(self.store, node, key)? {
            Some(updated) => updated,
            None => return Ok(false),
        };
        self.store.free(self.root);

        let collapse = {
            let v = updated.view();
            if v.kind()? == PageKind::Internal && v.nkeys() == 1 {
                Some(v.ptr_at(0))
            } else {
                None
            }
        };
        self.root = match collapse {
            // The root has a single child left: trim a level. The child
            // pointer is already a page of this mutation's new spine.
            Some(child) => child,
            None => self.store.alloc(updated)?,
        };
        Ok(true)
    }
}

/// Descends from `root` to the bounding leaf entry, zero-copy.
pub fn lookup<P: PageRead + ?Sized>(pages: &P, root: u64, key: &[u8]) -> Result<Option<Vec<u8>>> {
    check_key(key)?;

    if root == 0 {
        return Ok(None);
    }

    let mut ptr = root;
    loop {
        let node = Node::from_page(pages.page(ptr)?);
        let idx = node.lookup_le(key);
        match node.kind()? {
            PageKind::Leaf => {
                if node.key_at(idx) == key {
                    return Ok(Some(node.val_at(idx).to_vec()));
                }
                return Ok(None);
            }
            PageKind::Internal => ptr = node.ptr_at(idx),
            PageKind::Free => bail!("free-list page {} reached from the tree root", ptr),
        }
    }
}

fn check_key(key: &[u8]) -> Result<()> {
    ensure!(!key.is_empty(), "keys must not be empty");
    ensure!(
        key.len() <= MAX_KEY_SIZE,
        "key length {} exceeds maximum {}",
        key.len(),
        MAX_KEY_SIZE
    );
    Ok(())
}

/// Inserts into the subtree rooted at `node`, returning the rewritten
/// node. The result may exceed one page; the caller splits it.
fn tree_insert<S: NodeStore>(store: &mut S, node: NodeBuf, key: &[u8], val: &[u8]) -> Result<NodeBuf> {
    let mut new = NodeBuf::new(2);
    let v = node.view();
    let idx = v.lookup_le(key);

    match v.kind()? {
        PageKind::Leaf => {
            if v.key_at(idx) == key {
                leaf_update(&mut new, v, idx, key, val);
            } else {
                leaf_insert(&mut new, v, idx + 1, key, val);
            }
        }
        PageKind::Internal => {
            let kptr = v.ptr_at(idx);
            let child = store.read(kptr)?;
            store.free(kptr);

            let grown = tree_insert(store, child, key, val)?;
            let split = node_split3(grown)?;
            node_replace_kid_n(store, &mut new, v, idx, split)?;
        }
        PageKind::Free => bail!("free-list page reached from the tree root"),
    }
    Ok(new)
}

/// Deletes from the subtree rooted at `node`. `None` means the key was
/// not found and nothing was touched.
fn tree_delete<S: NodeStore>(store: &mut S, node: NodeBuf, key: &[u8]) -> Result<Option<NodeBuf>> {
    let v = node.view();
    let idx = v.lookup_le(key);

    match v.kind()? {
        PageKind::Leaf => {
            if v.key_at(idx) != key {
                return Ok(None);
            }
            let mut new = NodeBuf::new(1);
            leaf_delete(&mut new, v, idx);
            Ok(Some(new))
        }
        PageKind::Internal => node_delete(store, v, idx, key),
        PageKind::Free => bail!("free-list page reached from the tree root"),
    }
}

fn node_delete<S: NodeStore>(
    store: &mut S,
    node: Node<'_>,
    idx: u16,
    key: &[u8],
) -> Result<Option<NodeBuf>> {
    let kptr = node.ptr_at(idx);
    let child = store.read(kptr)?;
    let updated = match tree_delete(store, child, key)? {
        Some(updated) => updated,
        None => return Ok(None),
    };
    store.free(kptr);

    let mut new = NodeBuf::new(1);
    match should_merge(store, node, idx, &updated)? {
        Some((MergeDir::Left, sibling)) => {
            let mut merged = NodeBuf::new(1);
            node_merge(&mut merged, sibling.view(), updated.view())?;
            store.free(node.ptr_at(idx - 1));
            let first = merged.view().key_at(0).to_vec();
            let merged_ptr = store.alloc(merged)?;
            node_replace_2kid(&mut new, node, idx - 1, merged_ptr, &first);
        }
        Some((MergeDir::Right, sibling)) => {
            let mut merged = NodeBuf::new(1);
            node_merge(&mut merged, updated.view(), sibling.view())?;
            store.free(node.ptr_at(idx + 1));
            let first = merged.view().key_at(0).to_vec();
            let merged_ptr = store.alloc(merged)?;
            node_replace_2kid(&mut new, node, idx, merged_ptr, &first);
        }
        None => {
            ensure!(updated.nkeys() > 0, "delete left an empty node");
            let mut kids = Split::new();
            kids.push(updated);
            node_replace_kid_n(store, &mut new, node, idx, kids)?;
        }
    }
    Ok(Some(new))
}

fn leaf_insert(new: &mut NodeBuf, old: Node<'_>, idx: u16, key: &[u8], val: &[u8]) {
    new.set_header(PageKind::Leaf, old.nkeys() + 1);
    new.append_range(old, 0, 0, idx);
    new.append_kv(idx, 0, key, val);
    new.append_range(old, idx + 1, idx, old.nkeys() - idx);
}

fn leaf_update(new: &mut NodeBuf, old: Node<'_>, idx: u16, key: &[u8], val: &[u8]) {
    new.set_header(PageKind::Leaf, old.nkeys());
    new.append_range(old, 0, 0, idx);
    new.append_kv(idx, 0, key, val);
    new.append_range(old, idx + 1, idx + 1, old.nkeys() - idx - 1);
}

fn leaf_delete(new: &mut NodeBuf, old: Node<'_>, idx: u16) {
    new.set_header(PageKind::Leaf, old.nkeys() - 1);
    new.append_range(old, 0, 0, idx);
    new.append_range(old, idx, idx + 1, old.nkeys() - idx - 1);
}

/// Rebuilds `old` with the entry at `idx` replaced by the split results,
/// allocating a page per result node.
fn node_replace_kid_n<S: NodeStore>(
    store: &mut S,
    new: &mut NodeBuf,
    old: Node<'_>,
    idx: u16,
    kids: Split,
) -> Result<()> {
    let inc = kids.len() as u16;
    new.set_header(PageKind::Internal, old.nkeys() + inc - 1);
    new.append_range(old, 0, 0, idx);
    for (i, kid) in kids.into_iter().enumerate() {
        let first = kid.view().key_at(0).to_vec();
        let ptr = store.alloc(kid)?;
        new.append_kv(idx + i as u16, ptr, &first, b"");
    }
    new.append_range(old, idx + inc, idx + 1, old.nkeys() - (idx + 1));
    Ok(())
}

/// Rebuilds `old` with the two entries at `idx`, `idx + 1` replaced by
/// one entry for their merged child.
fn node_replace_2kid(new: &mut NodeBuf, old: Node<'_>, idx: u16, ptr: u64, key: &[u8]) {
    new.set_header(PageKind::Internal, old.nkeys() - 1);
    new.append_range(old, 0, 0, idx);
    new.append_kv(idx, ptr, key, b"");
    new.append_range(old, idx + 1, idx + 2, old.nkeys() - idx - 2);
}

fn node_merge(new: &mut NodeBuf, left: Node<'_>, right: Node<'_>) -> Result<()> {
    new.set_header(left.kind()?, left.nkeys() + right.nkeys());
    new.append_range(left, 0, 0, left.nkeys());
    new.append_range(right, left.nkeys(), 0, right.nkeys());
    Ok(())
}

enum MergeDir {
    Left,
    Right,
}

/// A shrunken child merges with a sibling when it is at or below a
/// quarter page and the combination still fits one page.
fn should_merge<S: NodeStore>(
    store: &S,
    node: Node<'_>,
    idx: u16,
    updated: &NodeBuf,
) -> Result<Option<(MergeDir, NodeBuf)>> {
    if updated.nbytes() > PAGE_SIZE / 4 {
        return Ok(None);
    }

    if idx > 0 {
        let sibling = store.read(node.ptr_at(idx - 1))?;
        if sibling.nbytes() + updated.nbytes() - NODE_HEADER <= PAGE_SIZE {
            return Ok(Some((MergeDir::Left, sibling)));
        }
    }
    if idx + 1 < node.nkeys() {
        let sibling = store.read(node.ptr_at(idx + 1))?;
        if sibling.nbytes() + updated.nbytes() - NODE_HEADER <= PAGE_SIZE {
            return Ok(Some((MergeDir::Right, sibling)));
        }
    }
    Ok(None)
}

/// Splits an oversized node into page-sized pieces.
fn node_split3(node: NodeBuf) -> Result<Split> {
    let mut out = Split::new();
    if node.nbytes() <= PAGE_SIZE {
        out.push(node);
        return Ok(out);
    }

    let (left, right) = node_split2(&node)?;
    if left.nbytes() <= PAGE_SIZE {
        out.push(left);
        out.push(right);
        return Ok(out);
    }

    // One near page-sized entry kept the left half oversized; cut again.
    let (leftmost, middle) = node_split2(&left)?;
    ensure!(
        leftmost.nbytes() <= PAGE_SIZE,
        "three-way split still overflows a page"
    );
    out.push(leftmost);
    out.push(middle);
    out.push(right);
    Ok(out)
}

/// Cuts a node in two around half its KV bytes. The right half always
/// fits one page; the left half usually does, and the caller handles the
/// exception.
fn node_split2(node: &NodeBuf) -> Result<(NodeBuf, NodeBuf)> {
    let v = node.view();
    let nkeys = v.nkeys();
    ensure!(nkeys >= 2, "cannot split a node with {} keys", nkeys);

    let left_bytes = |n: u16| NODE_HEADER + 10 * n as usize + v.offset_at(n) as usize;
    let right_bytes = |n: u16| v.nbytes() - left_bytes(n) + NODE_HEADER;

    let mut nleft = nkeys / 2;
    while nleft > 1 && left_bytes(nleft) > PAGE_SIZE {
        nleft -= 1;
    }
    while nleft + 1 < nkeys && right_bytes(nleft) > PAGE_SIZE {
        nleft += 1;
    }

    let kind = v.kind()?;
    let mut left = NodeBuf::new(2);
    left.set_header(kind, nleft);
    left.append_range(v, 0, 0, nleft);

    let mut right = NodeBuf::new(1);
    right.set_header(kind, nkeys - nleft);
    right.append_range(v, 0, nleft, nkeys - nleft);
    ensure!(right.nbytes() <= PAGE_SIZE, "split right half overflows a page");

    Ok((left, right))
}
