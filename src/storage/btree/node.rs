//! On-disk B-tree node layout.
//!
//! Nodes are decoded to an owned in-memory form, mutated, and re-encoded
//! into a fresh page image. Every mutation lands in a private copy-on-write
//! page anyway, so there is nothing to gain from in-place cell surgery and
//! the decoded form keeps split and merge logic straightforward.
//!
//! Payload layout (after the 32-byte page header, big-endian):
//!
//! ```text
//! count: u16 | reserved: u16 | leftmost_child: u64 | reserved: u32 | cells…
//! ```
//!
//! Leaf cell: `key_len:u16 | version:u16 | tag:u8 | key | value-part`, where
//! the value part is `value_len:u32 | bytes` for an inline value (tag 0) or
//! `head:u64 | total_len:u64` for an overflow chain (tag 1).
//! Branch cell: `sep_len:u16 | child:u64 | sep`; `leftmost_child` holds the
//! child preceding the first separator, so a branch with N separators has
//! N+1 children.

use std::convert::TryInto;

use crate::types::page::{self, PageHeader, PageKind, PAGE_HDR_LEN};
use crate::types::{PageId, Result, VellumError};

/// Fixed bytes at the start of a node payload.
pub const NODE_HDR_LEN: usize = 16;

const LEAF_CELL_FIXED: usize = 5;
const INLINE_VALUE_FIXED: usize = 4;
const OVERFLOW_VALUE_FIXED: usize = 16;
pub(crate) const BRANCH_CELL_FIXED: usize = 10;

const TAG_INLINE: u8 = 0;
const TAG_OVERFLOW: u8 = 1;

/// Bytes available to node payloads in one page.
pub fn payload_capacity(page_size: u32) -> usize {
    page_size as usize - PAGE_HDR_LEN
}

/// A leaf entry's value: inline bytes or a reference to an overflow chain.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ValueRef {
    /// Value bytes stored in the leaf cell.
    Inline(Vec<u8>),
    /// Value bytes stored in an overflow page chain.
    Overflow {
        /// First page of the chain.
        head: PageId,
        /// Total value length in bytes.
        len: u64,
    },
}

impl ValueRef {
    fn cell_bytes(&self) -> usize {
        match self {
            ValueRef::Inline(bytes) => INLINE_VALUE_FIXED + bytes.len(),
            ValueRef::Overflow { .. } => OVERFLOW_VALUE_FIXED,
        }
    }
}

/// One key-value entry in a leaf, with its version stamp.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LeafEntry {
    /// The entry's key.
    pub key: Vec<u8>,
    /// Write counter: 1 on first write, wrapping 65535 back to 1.
    pub version: u16,
    /// The entry's value.
    pub value: ValueRef,
}

impl LeafEntry {
    /// Encoded size of this entry's cell.
    pub fn cell_size(&self) -> usize {
        LEAF_CELL_FIXED + self.key.len() + self.value.cell_bytes()
    }
}

/// Decoded leaf node.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Leaf {
    /// Entries in strictly increasing key order.
    pub entries: Vec<LeafEntry>,
}

impl Leaf {
    /// Encoded payload size of the node.
    pub fn used_bytes(&self) -> usize {
        NODE_HDR_LEN + self.entries.iter().map(LeafEntry::cell_size).sum::<usize>()
    }

    /// Whether the node encodes into one page.
    pub fn fits(&self, page_size: u32) -> bool {
        self.used_bytes() <= payload_capacity(page_size)
    }

    /// Whether the node is below the minimum occupancy bound.
    pub fn is_underfull(&self, page_size: u32) -> bool {
        self.used_bytes() < payload_capacity(page_size) / 4
    }

    /// Binary search for `key`.
    pub fn search(&self, key: &[u8]) -> std::result::Result<usize, usize> {
        self.entries.binary_search_by(|e| e.key.as_slice().cmp(key))
    }

    /// Splits off the upper half (by encoded size) into a new leaf and
    /// returns it with the separator key: the first key of the right half.
    pub fn split(&mut self) -> (Leaf, Vec<u8>) {
        debug_assert!(self.entries.len() >= 2);
        let total: usize = self.entries.iter().map(LeafEntry::cell_size).sum();
        let mut acc = 0usize;
        let mut split_at = self.entries.len() - 1;
        for (idx, entry) in self.entries.iter().enumerate() {
            acc += entry.cell_size();
            if acc * 2 >= total {
                split_at = idx + 1;
                break;
            }
        }
        let split_at = split_at.clamp(1, self.entries.len() - 1);
        let right_entries = self.entries.split_off(split_at);
        let sep = right_entries[0].key.clone();
        (Leaf { entries: right_entries }, sep)
    }
}

/// Decoded branch node. `children` always holds `seps.len() + 1` pages;
/// child `i` covers keys below `seps[i]`, the last child covers the rest.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Branch {
    /// Child page numbers.
    pub children: Vec<PageId>,
    /// Separator keys partitioning the children.
    pub seps: Vec<Vec<u8>>,
}

impl Branch {
    /// Encoded payload size of the node.
    pub fn used_bytes(&self) -> usize {
        NODE_HDR_LEN
            + self
                .seps
                .iter()
                .map(|sep| BRANCH_CELL_FIXED + sep.len())
                .sum::<usize>()
    }

    /// Whether the node encodes into one page.
    pub fn fits(&self, page_size: u32) -> bool {
        self.used_bytes() <= payload_capacity(page_size)
    }

    /// Whether the node is below the minimum occupancy bound.
    pub fn is_underfull(&self, page_size: u32) -> bool {
        self.used_bytes() < payload_capacity(page_size) / 4
    }

    /// Index of the child that may contain `key`.
    pub fn child_for(&self, key: &[u8]) -> usize {
        match self.seps.binary_search_by(|sep| sep.as_slice().cmp(key)) {
            Ok(idx) => idx + 1,
            Err(idx) => idx,
        }
    }

    /// Splits the branch around its size midpoint, returning the right half
    /// and the promoted separator (which belongs to neither half).
    pub fn split(&mut self) -> (Branch, Vec<u8>) {
        debug_assert!(self.seps.len() >= 3);
        let total: usize = self.seps.iter().map(|s| BRANCH_CELL_FIXED + s.len()).sum();
        let mut acc = 0usize;
        let mut mid = self.seps.len() / 2;
        for (idx, sep) in self.seps.iter().enumerate() {
            acc += BRANCH_CELL_FIXED + sep.len();
            if acc * 2 >= total {
                mid = idx;
                break;
            }
        }
        let mid = mid.clamp(1, self.seps.len() - 2);
        let right_seps = self.seps.split_off(mid + 1);
        let promoted = self.seps.pop().expect("split leaves the promoted separator");
        let right_children = self.children.split_off(mid + 1);
        (
            Branch {
                children: right_children,
                seps: right_seps,
            },
            promoted,
        )
    }
}

/// A decoded B-tree node.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Node {
    /// Leaf node holding entries.
    Leaf(Leaf),
    /// Branch node holding separators and children.
    Branch(Branch),
}

impl Node {
    /// Whether the node is below the minimum occupancy bound.
    pub fn is_underfull(&self, page_size: u32) -> bool {
        match self {
            Node::Leaf(leaf) => leaf.is_underfull(page_size),
            Node::Branch(branch) => branch.is_underfull(page_size),
        }
    }

    /// Encodes the node into a checksummed page image.
    pub fn encode(&self, page_no: PageId, page_size: u32, salt: u64) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; page_size as usize];
        let (kind, count) = match self {
            Node::Leaf(leaf) => (PageKind::BTreeLeaf, leaf.entries.len()),
            Node::Branch(branch) => (PageKind::BTreeBranch, branch.seps.len()),
        };
        if count > u16::MAX as usize {
            return Err(VellumError::Invalid("node entry count overflow"));
        }
        let header = PageHeader::new(page_no, kind, page_size, salt)?;
        header.encode(&mut buf[..PAGE_HDR_LEN])?;

        let payload = &mut buf[PAGE_HDR_LEN..];
        payload[0..2].copy_from_slice(&(count as u16).to_be_bytes());
        let mut cursor = NODE_HDR_LEN;
        match self {
            Node::Leaf(leaf) => {
                for entry in &leaf.entries {
                    cursor = encode_leaf_cell(payload, cursor, entry, page_size)?;
                }
            }
            Node::Branch(branch) => {
                if branch.children.len() != branch.seps.len() + 1 {
                    return Err(VellumError::Invalid("branch child count out of step"));
                }
                payload[4..12].copy_from_slice(&branch.children[0].0.to_be_bytes());
                for (sep, child) in branch.seps.iter().zip(branch.children.iter().skip(1)) {
                    cursor = encode_branch_cell(payload, cursor, sep, *child, page_size)?;
                }
            }
        }
        page::seal(&mut buf, page_no, salt)?;
        Ok(buf)
    }
}

fn encode_leaf_cell(
    payload: &mut [u8],
    mut cursor: usize,
    entry: &LeafEntry,
    _page_size: u32,
) -> Result<usize> {
    let cell = entry.cell_size();
    if cursor + cell > payload.len() {
        return Err(VellumError::Invalid("leaf exceeds page capacity"));
    }
    if entry.key.len() > u16::MAX as usize {
        return Err(VellumError::Invalid("key too long for cell encoding"));
    }
    payload[cursor..cursor + 2].copy_from_slice(&(entry.key.len() as u16).to_be_bytes());
    payload[cursor + 2..cursor + 4].copy_from_slice(&entry.version.to_be_bytes());
    cursor += LEAF_CELL_FIXED - 1;
    match &entry.value {
        ValueRef::Inline(bytes) => {
            payload[cursor] = TAG_INLINE;
            cursor += 1;
            payload[cursor..cursor + entry.key.len()].copy_from_slice(&entry.key);
            cursor += entry.key.len();
            payload[cursor..cursor + 4].copy_from_slice(&(bytes.len() as u32).to_be_bytes());
            cursor += 4;
            payload[cursor..cursor + bytes.len()].copy_from_slice(bytes);
            cursor += bytes.len();
        }
        ValueRef::Overflow { head, len } => {
            payload[cursor] = TAG_OVERFLOW;
            cursor += 1;
            payload[cursor..cursor + entry.key.len()].copy_from_slice(&entry.key);
            cursor += entry.key.len();
            payload[cursor..cursor + 8].copy_from_slice(&head.0.to_be_bytes());
            payload[cursor + 8..cursor + 16].copy_from_slice(&len.to_be_bytes());
            cursor += 16;
        }
    }
    Ok(cursor)
}

fn encode_branch_cell(
    payload: &mut [u8],
    mut cursor: usize,
    sep: &[u8],
    child: PageId,
    _page_size: u32,
) -> Result<usize> {
    let cell = BRANCH_CELL_FIXED + sep.len();
    if cursor + cell > payload.len() {
        return Err(VellumError::Invalid("branch exceeds page capacity"));
    }
    if sep.len() > u16::MAX as usize {
        return Err(VellumError::Invalid("separator too long for cell encoding"));
    }
    payload[cursor..cursor + 2].copy_from_slice(&(sep.len() as u16).to_be_bytes());
    payload[cursor + 2..cursor + 10].copy_from_slice(&child.0.to_be_bytes());
    cursor += BRANCH_CELL_FIXED;
    payload[cursor..cursor + sep.len()].copy_from_slice(sep);
    cursor += sep.len();
    Ok(cursor)
}

/// Decodes a node from a page image whose checksum has already been
/// verified. The page kind selects leaf or branch; anything else is
/// corruption.
pub fn decode(buf: &[u8], page_size: u32) -> Result<Node> {
    let header = PageHeader::decode(buf)?;
    if buf.len() < page_size as usize {
        return Err(VellumError::Corruption("node page truncated"));
    }
    let payload = &buf[PAGE_HDR_LEN..page_size as usize];
    let count = u16::from_be_bytes(payload[0..2].try_into().unwrap()) as usize;
    match header.kind {
        PageKind::BTreeLeaf => decode_leaf(payload, count).map(Node::Leaf),
        PageKind::BTreeBranch => decode_branch(payload, count).map(Node::Branch),
        _ => Err(VellumError::Corruption("expected a btree page")),
    }
}

fn decode_leaf(payload: &[u8], count: usize) -> Result<Leaf> {
    let mut entries = Vec::with_capacity(count);
    let mut cursor = NODE_HDR_LEN;
    for _ in 0..count {
        let fixed = payload
            .get(cursor..cursor + LEAF_CELL_FIXED)
            .ok_or(VellumError::Corruption("leaf cell header out of bounds"))?;
        let key_len = u16::from_be_bytes(fixed[0..2].try_into().unwrap()) as usize;
        let version = u16::from_be_bytes(fixed[2..4].try_into().unwrap());
        let tag = fixed[4];
        cursor += LEAF_CELL_FIXED;
        let key = payload
            .get(cursor..cursor + key_len)
            .ok_or(VellumError::Corruption("leaf key out of bounds"))?
            .to_vec();
        cursor += key_len;
        let value = match tag {
            TAG_INLINE => {
                let len_bytes = payload
                    .get(cursor..cursor + 4)
                    .ok_or(VellumError::Corruption("inline value length out of bounds"))?;
                let value_len = u32::from_be_bytes(len_bytes.try_into().unwrap()) as usize;
                cursor += 4;
                let bytes = payload
                    .get(cursor..cursor + value_len)
                    .ok_or(VellumError::Corruption("inline value out of bounds"))?
                    .to_vec();
                cursor += value_len;
                ValueRef::Inline(bytes)
            }
            TAG_OVERFLOW => {
                let raw = payload
                    .get(cursor..cursor + 16)
                    .ok_or(VellumError::Corruption("overflow reference out of bounds"))?;
                let head = PageId(u64::from_be_bytes(raw[0..8].try_into().unwrap()));
                let len = u64::from_be_bytes(raw[8..16].try_into().unwrap());
                cursor += 16;
                if head.is_null() {
                    return Err(VellumError::Corruption("null overflow chain head"));
                }
                ValueRef::Overflow { head, len }
            }
            _ => return Err(VellumError::Corruption("unknown leaf value tag")),
        };
        if let Some(prev) = entries.last() {
            let prev: &LeafEntry = prev;
            if prev.key.as_slice() >= key.as_slice() {
                return Err(VellumError::Corruption("leaf keys out of order"));
            }
        }
        entries.push(LeafEntry { key, version, value });
    }
    Ok(Leaf { entries })
}

fn decode_branch(payload: &[u8], count: usize) -> Result<Branch> {
    let leftmost = PageId(u64::from_be_bytes(payload[4..12].try_into().unwrap()));
    if leftmost.is_null() {
        return Err(VellumError::Corruption("branch has null leftmost child"));
    }
    let mut children = Vec::with_capacity(count + 1);
    let mut seps = Vec::with_capacity(count);
    children.push(leftmost);
    let mut cursor = NODE_HDR_LEN;
    for _ in 0..count {
        let fixed = payload
            .get(cursor..cursor + BRANCH_CELL_FIXED)
            .ok_or(VellumError::Corruption("branch cell header out of bounds"))?;
        let sep_len = u16::from_be_bytes(fixed[0..2].try_into().unwrap()) as usize;
        let child = PageId(u64::from_be_bytes(fixed[2..10].try_into().unwrap()));
        if child.is_null() {
            return Err(VellumError::Corruption("branch has null child"));
        }
        cursor += BRANCH_CELL_FIXED;
        let sep = payload
            .get(cursor..cursor + sep_len)
            .ok_or(VellumError::Corruption("branch separator out of bounds"))?
            .to_vec();
        cursor += sep_len;
        if let Some(prev) = seps.last() {
            let prev: &Vec<u8> = prev;
            if prev.as_slice() >= sep.as_slice() {
                return Err(VellumError::Corruption("branch separators out of order"));
            }
        }
        seps.push(sep);
        children.push(child);
    }
    Ok(Branch { children, seps })
}
