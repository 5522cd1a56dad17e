//! Lazy in-order range scans.
//!
//! The cursor keeps the branch descent stack from the root to the current
//! leaf and resumes across leaf boundaries by advancing through the stack.
//! Stored sibling pointers would go stale the moment a neighbor is
//! copy-on-written into a new page, so the path itself is the only sound way
//! to navigate a snapshot. The scan is bounded to the transaction that
//! created it and ends once the upper bound (inclusive) is passed.

use bytes::Bytes;
use smallvec::SmallVec;

use crate::types::{PageId, Result};

use super::node::{Branch, Leaf, Node};
use super::{read_value, PageSource};

/// Iterator over `(key, value)` pairs in key order.
pub struct RangeScan<'s, S: PageSource> {
    src: &'s S,
    /// Branches on the path, each with the child index currently descended.
    stack: SmallVec<[(Branch, usize); 8]>,
    /// Current leaf and the index of the next entry to yield.
    leaf: Option<(Leaf, usize)>,
    /// Inclusive upper bound; `None` scans to the end of the tree.
    high: Option<Vec<u8>>,
    finished: bool,
}

impl<'s, S: PageSource> RangeScan<'s, S> {
    /// Positions a scan at the first key not below `low`.
    pub fn new(src: &'s S, root: PageId, low: &[u8], high: Option<Vec<u8>>) -> Result<Self> {
        let mut scan = Self {
            src,
            stack: SmallVec::new(),
            leaf: None,
            high,
            finished: false,
        };
        if root.is_null() {
            scan.finished = true;
            return Ok(scan);
        }
        let mut id = root;
        loop {
            match src.node(id)? {
                Node::Branch(branch) => {
                    let slot = branch.child_for(low);
                    id = branch.children[slot];
                    scan.stack.push((branch, slot));
                }
                Node::Leaf(leaf) => {
                    let pos = match leaf.search(low) {
                        Ok(idx) | Err(idx) => idx,
                    };
                    scan.leaf = Some((leaf, pos));
                    return Ok(scan);
                }
            }
        }
    }

    /// Moves to the leftmost leaf under the next unvisited child on the
    /// stack. Returns `false` when the tree is exhausted.
    fn advance_leaf(&mut self) -> Result<bool> {
        self.leaf = None;
        let mut next = None;
        while let Some((branch, slot)) = self.stack.last_mut() {
            if *slot + 1 < branch.children.len() {
                *slot += 1;
                next = Some(branch.children[*slot]);
                break;
            }
            self.stack.pop();
        }
        let Some(mut id) = next else {
            return Ok(false);
        };
        loop {
            match self.src.node(id)? {
                Node::Branch(branch) => {
                    id = branch.children[0];
                    self.stack.push((branch, 0));
                }
                Node::Leaf(leaf) => {
                    self.leaf = Some((leaf, 0));
                    return Ok(true);
                }
            }
        }
    }

    fn step(&mut self) -> Result<Option<(Bytes, Bytes)>> {
        loop {
            if self.finished {
                return Ok(None);
            }
            let Some((leaf, pos)) = self.leaf.as_mut() else {
                self.finished = true;
                return Ok(None);
            };
            if *pos >= leaf.entries.len() {
                if !self.advance_leaf()? {
                    self.finished = true;
                    return Ok(None);
                }
                continue;
            }
            let entry = &leaf.entries[*pos];
            if let Some(high) = &self.high {
                if entry.key.as_slice() > high.as_slice() {
                    self.finished = true;
                    return Ok(None);
                }
            }
            let key = Bytes::from(entry.key.clone());
            let value = read_value(self.src, &entry.value)?;
            *pos += 1;
            return Ok(Some((key, value)));
        }
    }
}

impl<'s, S: PageSource> Iterator for RangeScan<'s, S> {
    type Item = Result<(Bytes, Bytes)>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.step() {
            Ok(Some(pair)) => Some(Ok(pair)),
            Ok(None) => None,
            Err(err) => {
                self.finished = true;
                Some(Err(err))
            }
        }
    }
}
