//! Copy-on-write B-tree over byte-string keys.
//!
//! Every operation runs against a transaction's page view through the
//! [`PageSource`]/[`PageStoreMut`] traits. Mutations never touch a published
//! page: the write path shadows each page on the descent into a private
//! copy, so a new root page number falls out of every structural change and
//! old roots stay valid for readers still holding them.

pub mod cursor;
pub mod node;
pub mod overflow;

pub use cursor::RangeScan;

use std::sync::Arc;

use bytes::Bytes;

use crate::types::{PageId, Result, VellumError};

use node::{Branch, Leaf, LeafEntry, Node, ValueRef};

/// Read access to a transaction's view of the page store.
pub trait PageSource {
    /// The database page size.
    fn page_size(&self) -> u32;
    /// The database checksum salt.
    fn salt(&self) -> u64;
    /// Returns the page image visible to this transaction.
    fn view(&self, id: PageId) -> Result<Arc<[u8]>>;

    /// Decodes the page as a B-tree node.
    fn node(&self, id: PageId) -> Result<Node> {
        node::decode(&self.view(id)?, self.page_size())
    }
}

/// Write access to a write transaction's private page set.
pub trait PageStoreMut: PageSource {
    /// Allocates a fresh page number for this transaction.
    fn allocate(&mut self) -> Result<PageId>;
    /// Releases a page; it becomes reusable once no snapshot needs it.
    fn free_page(&mut self, id: PageId);
    /// Whether the page is already a private copy of this transaction.
    fn is_shadowed(&self, id: PageId) -> bool;
    /// Stores a finished page image into the transaction's dirty set.
    fn put_image(&mut self, id: PageId, image: Vec<u8>);

    /// Returns the page number a new image of `id` must be written to:
    /// `id` itself when already shadowed, otherwise a fresh copy-on-write
    /// target while the original is freed to older snapshots.
    fn rewrite(&mut self, id: PageId) -> Result<PageId> {
        if self.is_shadowed(id) {
            Ok(id)
        } else {
            self.free_page(id);
            self.allocate()
        }
    }

    /// Encodes and stores a node image at `id`.
    fn put_node(&mut self, id: PageId, node: &Node) -> Result<()> {
        let image = node.encode(id, self.page_size(), self.salt())?;
        self.put_image(id, image);
        Ok(())
    }
}

/// Version stamp following `current`: 1 for a fresh entry, wrapping past
/// 65535 back to 1 so that 0 stays reserved for "no entry".
pub fn next_version(current: u16) -> u16 {
    if current == u16::MAX {
        1
    } else {
        current + 1
    }
}

/// Longest key accepted, as a fraction of the page size; keeps branch
/// fan-out reasonable.
pub fn max_key_len(page_size: u32) -> usize {
    page_size as usize / 16
}

/// Point lookup.
pub fn get<S: PageSource>(src: &S, root: PageId, key: &[u8]) -> Result<Option<Bytes>> {
    let Some((entry, _)) = find_entry(src, root, key)? else {
        return Ok(None);
    };
    Ok(Some(read_value(src, &entry.value)?))
}

/// Returns the key's version stamp, or 0 when no entry exists.
pub fn read_version<S: PageSource>(src: &S, root: PageId, key: &[u8]) -> Result<u16> {
    Ok(find_entry(src, root, key)?
        .map(|(entry, _)| entry.version)
        .unwrap_or(0))
}

fn find_entry<S: PageSource>(
    src: &S,
    root: PageId,
    key: &[u8],
) -> Result<Option<(LeafEntry, PageId)>> {
    if root.is_null() {
        return Ok(None);
    }
    let mut id = root;
    loop {
        match src.node(id)? {
            Node::Branch(branch) => id = branch.children[branch.child_for(key)],
            Node::Leaf(mut leaf) => {
                return Ok(match leaf.search(key) {
                    Ok(idx) => Some((leaf.entries.swap_remove(idx), id)),
                    Err(_) => None,
                })
            }
        }
    }
}

pub(crate) fn read_value<S: PageSource + ?Sized>(src: &S, value: &ValueRef) -> Result<Bytes> {
    match value {
        ValueRef::Inline(bytes) => Ok(Bytes::from(bytes.clone())),
        ValueRef::Overflow { head, len } => overflow::read_chain(src, *head, *len),
    }
}

/// Result of a [`put`].
#[derive(Debug, Clone, Copy)]
pub struct PutOutcome {
    /// Root of the tree after the write.
    pub root: PageId,
    /// Whether a new entry was created (as opposed to overwritten).
    pub inserted: bool,
}

/// Inserts or overwrites `key`. A fresh entry starts at version 1, an
/// overwrite bumps the stamp by one (65535 wraps to 1).
pub fn put<S: PageStoreMut>(
    store: &mut S,
    root: PageId,
    key: &[u8],
    value: &[u8],
) -> Result<PutOutcome> {
    if key.is_empty() {
        return Err(VellumError::Invalid("key must not be empty"));
    }
    if key.len() > max_key_len(store.page_size()) {
        return Err(VellumError::Invalid("key exceeds maximum length"));
    }
    let value = overflow::build_value(store, value)?;
    if root.is_null() {
        let leaf = Leaf {
            entries: vec![LeafEntry {
                key: key.to_vec(),
                version: 1,
                value,
            }],
        };
        let id = store.allocate()?;
        store.put_node(id, &Node::Leaf(leaf))?;
        return Ok(PutOutcome {
            root: id,
            inserted: true,
        });
    }
    match put_rec(store, root, key, value)? {
        Descent::Replaced { id, inserted } => Ok(PutOutcome { root: id, inserted }),
        Descent::Split {
            left,
            right,
            sep,
            inserted,
        } => {
            let branch = Branch {
                children: vec![left, right],
                seps: vec![sep],
            };
            let id = store.allocate()?;
            store.put_node(id, &Node::Branch(branch))?;
            Ok(PutOutcome { root: id, inserted })
        }
    }
}

enum Descent {
    Replaced {
        id: PageId,
        inserted: bool,
    },
    Split {
        left: PageId,
        right: PageId,
        sep: Vec<u8>,
        inserted: bool,
    },
}

fn put_rec<S: PageStoreMut>(
    store: &mut S,
    id: PageId,
    key: &[u8],
    value: ValueRef,
) -> Result<Descent> {
    match store.node(id)? {
        Node::Leaf(mut leaf) => {
            let inserted = match leaf.search(key) {
                Ok(idx) => {
                    let version = next_version(leaf.entries[idx].version);
                    leaf.entries[idx].version = version;
                    let old = std::mem::replace(&mut leaf.entries[idx].value, value);
                    if let ValueRef::Overflow { head, .. } = old {
                        overflow::free_chain(store, head)?;
                    }
                    false
                }
                Err(idx) => {
                    leaf.entries.insert(
                        idx,
                        LeafEntry {
                            key: key.to_vec(),
                            version: 1,
                            value,
                        },
                    );
                    true
                }
            };
            if leaf.fits(store.page_size()) {
                let new_id = store.rewrite(id)?;
                store.put_node(new_id, &Node::Leaf(leaf))?;
                Ok(Descent::Replaced {
                    id: new_id,
                    inserted,
                })
            } else {
                let (right, sep) = leaf.split();
                let left_id = store.rewrite(id)?;
                let right_id = store.allocate()?;
                store.put_node(left_id, &Node::Leaf(leaf))?;
                store.put_node(right_id, &Node::Leaf(right))?;
                Ok(Descent::Split {
                    left: left_id,
                    right: right_id,
                    sep,
                    inserted,
                })
            }
        }
        Node::Branch(mut branch) => {
            let slot = branch.child_for(key);
            let child = branch.children[slot];
            match put_rec(store, child, key, value)? {
                Descent::Replaced { id: new_child, inserted } => {
                    branch.children[slot] = new_child;
                    let new_id = store.rewrite(id)?;
                    store.put_node(new_id, &Node::Branch(branch))?;
                    Ok(Descent::Replaced {
                        id: new_id,
                        inserted,
                    })
                }
                Descent::Split {
                    left,
                    right,
                    sep,
                    inserted,
                } => {
                    branch.children[slot] = left;
                    branch.seps.insert(slot, sep);
                    branch.children.insert(slot + 1, right);
                    if branch.fits(store.page_size()) {
                        let new_id = store.rewrite(id)?;
                        store.put_node(new_id, &Node::Branch(branch))?;
                        Ok(Descent::Replaced {
                            id: new_id,
                            inserted,
                        })
                    } else {
                        let (right_branch, promoted) = branch.split();
                        let left_id = store.rewrite(id)?;
                        let right_id = store.allocate()?;
                        store.put_node(left_id, &Node::Branch(branch))?;
                        store.put_node(right_id, &Node::Branch(right_branch))?;
                        Ok(Descent::Split {
                            left: left_id,
                            right: right_id,
                            sep: promoted,
                            inserted,
                        })
                    }
                }
            }
        }
    }
}

/// Result of a [`delete`].
#[derive(Debug, Clone, Copy)]
pub struct DeleteOutcome {
    /// Root of the tree after the delete.
    pub root: PageId,
    /// Whether an entry was removed.
    pub deleted: bool,
}

/// Removes `key` if present. The entry disappears entirely: a later
/// `read_version` returns 0, indistinguishable from a key never written.
pub fn delete<S: PageStoreMut>(store: &mut S, root: PageId, key: &[u8]) -> Result<DeleteOutcome> {
    if root.is_null() {
        return Ok(DeleteOutcome {
            root,
            deleted: false,
        });
    }
    let Some(new_root) = delete_rec(store, root, key)? else {
        return Ok(DeleteOutcome {
            root,
            deleted: false,
        });
    };
    // Collapse the root: an empty leaf empties the tree, a branch left with
    // a single child loses a level.
    let root = match store.node(new_root)? {
        Node::Leaf(leaf) if leaf.entries.is_empty() => {
            store.free_page(new_root);
            PageId::NULL
        }
        Node::Branch(branch) if branch.seps.is_empty() => {
            store.free_page(new_root);
            branch.children[0]
        }
        _ => new_root,
    };
    Ok(DeleteOutcome {
        root,
        deleted: true,
    })
}

fn delete_rec<S: PageStoreMut>(store: &mut S, id: PageId, key: &[u8]) -> Result<Option<PageId>> {
    match store.node(id)? {
        Node::Leaf(mut leaf) => match leaf.search(key) {
            Err(_) => Ok(None),
            Ok(idx) => {
                let removed = leaf.entries.remove(idx);
                if let ValueRef::Overflow { head, .. } = removed.value {
                    overflow::free_chain(store, head)?;
                }
                let new_id = store.rewrite(id)?;
                store.put_node(new_id, &Node::Leaf(leaf))?;
                Ok(Some(new_id))
            }
        },
        Node::Branch(mut branch) => {
            let slot = branch.child_for(key);
            let Some(new_child) = delete_rec(store, branch.children[slot], key)? else {
                return Ok(None);
            };
            branch.children[slot] = new_child;
            rebalance(store, &mut branch, slot)?;
            let new_id = store.rewrite(id)?;
            store.put_node(new_id, &Node::Branch(branch))?;
            Ok(Some(new_id))
        }
    }
}

/// Restores the occupancy bound for `parent.children[slot]` after a delete:
/// merge with a neighbor when the combined node fits, otherwise shift one
/// entry over. Skipped when shifting would grow the parent past a page (the
/// occupancy bound is a maintenance target, not an invariant the root obeys
/// either).
fn rebalance<S: PageStoreMut>(store: &mut S, parent: &mut Branch, slot: usize) -> Result<()> {
    let page_size = store.page_size();
    if !store.node(parent.children[slot])?.is_underfull(page_size) {
        return Ok(());
    }
    if parent.children.len() < 2 {
        return Ok(());
    }
    let left_idx = if slot + 1 < parent.children.len() {
        slot
    } else {
        slot - 1
    };
    let left_id = parent.children[left_idx];
    let right_id = parent.children[left_idx + 1];
    match (store.node(left_id)?, store.node(right_id)?) {
        (Node::Leaf(mut left), Node::Leaf(mut right)) => {
            let merged = left.used_bytes() + right.used_bytes() - node::NODE_HDR_LEN;
            if merged <= node::payload_capacity(page_size) {
                left.entries.append(&mut right.entries);
                let new_left = store.rewrite(left_id)?;
                store.put_node(new_left, &Node::Leaf(left))?;
                store.free_page(right_id);
                parent.children[left_idx] = new_left;
                parent.children.remove(left_idx + 1);
                parent.seps.remove(left_idx);
            } else {
                if left.used_bytes() < right.used_bytes() {
                    left.entries.push(right.entries.remove(0));
                } else {
                    let moved = left.entries.pop().expect("donor leaf is non-empty");
                    right.entries.insert(0, moved);
                }
                let sep = right.entries[0].key.clone();
                if !parent_fits_with_sep(parent, left_idx, &sep, page_size) {
                    return Ok(());
                }
                let new_left = store.rewrite(left_id)?;
                let new_right = store.rewrite(right_id)?;
                store.put_node(new_left, &Node::Leaf(left))?;
                store.put_node(new_right, &Node::Leaf(right))?;
                parent.children[left_idx] = new_left;
                parent.children[left_idx + 1] = new_right;
                parent.seps[left_idx] = sep;
            }
        }
        (Node::Branch(mut left), Node::Branch(mut right)) => {
            let sep = parent.seps[left_idx].clone();
            let merged = left.used_bytes() + right.used_bytes() - node::NODE_HDR_LEN
                + node::BRANCH_CELL_FIXED
                + sep.len();
            if merged <= node::payload_capacity(page_size) {
                left.seps.push(sep);
                left.seps.append(&mut right.seps);
                left.children.append(&mut right.children);
                let new_left = store.rewrite(left_id)?;
                store.put_node(new_left, &Node::Branch(left))?;
                store.free_page(right_id);
                parent.children[left_idx] = new_left;
                parent.children.remove(left_idx + 1);
                parent.seps.remove(left_idx);
            } else {
                let new_sep;
                if left.used_bytes() < right.used_bytes() {
                    left.seps.push(sep);
                    left.children.push(right.children.remove(0));
                    new_sep = right.seps.remove(0);
                } else {
                    right.seps.insert(0, sep);
                    let moved = left.children.pop().expect("donor branch is non-empty");
                    right.children.insert(0, moved);
                    new_sep = left.seps.pop().expect("donor branch keeps a separator");
                }
                if !parent_fits_with_sep(parent, left_idx, &new_sep, page_size) {
                    return Ok(());
                }
                let new_left = store.rewrite(left_id)?;
                let new_right = store.rewrite(right_id)?;
                store.put_node(new_left, &Node::Branch(left))?;
                store.put_node(new_right, &Node::Branch(right))?;
                parent.children[left_idx] = new_left;
                parent.children[left_idx + 1] = new_right;
                parent.seps[left_idx] = new_sep;
            }
        }
        _ => return Err(VellumError::Corruption("sibling nodes of differing kinds")),
    }
    Ok(())
}

fn parent_fits_with_sep(parent: &Branch, sep_idx: usize, new_sep: &[u8], page_size: u32) -> bool {
    let used = parent.used_bytes() - parent.seps[sep_idx].len() + new_sep.len();
    used <= node::payload_capacity(page_size)
}
