//! Free-space tracking: in-memory extent cache and the persisted free-list
//! page chain.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::convert::TryInto;

use crate::types::page::{self, PageHeader, PageKind, PAGE_HDR_LEN};
use crate::types::{PageId, Result, VellumError};

/// A run of consecutive free pages.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Extent {
    /// First page of the run.
    pub start: PageId,
    /// Number of pages in the run.
    pub len: u32,
}

impl Extent {
    /// Builds an extent covering `len` pages starting at `start`.
    pub fn new(start: PageId, len: u32) -> Self {
        Self { start, len }
    }

    /// Absorbs `other` when it begins exactly where this extent ends.
    pub fn coalesce_with(&mut self, other: &Extent) -> bool {
        if self.start.0 + self.len as u64 == other.start.0 {
            self.len += other.len;
            true
        } else {
            false
        }
    }

    /// Iterates over every page number in the extent.
    pub fn iter_pages(&self) -> impl Iterator<Item = PageId> + '_ {
        (0..self.len).map(move |off| PageId(self.start.0 + off as u64))
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
struct HeapExtent {
    start: PageId,
    len: u32,
}

impl Ord for HeapExtent {
    fn cmp(&self, other: &Self) -> Ordering {
        self.len
            .cmp(&other.len)
            .then_with(|| other.start.0.cmp(&self.start.0))
    }
}

impl PartialOrd for HeapExtent {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl From<Extent> for HeapExtent {
    fn from(extent: Extent) -> Self {
        HeapExtent {
            start: extent.start,
            len: extent.len,
        }
    }
}

/// Pool of reusable pages, kept as coalesced extents. Allocation pops from
/// the largest extent to keep long runs available for overflow chains.
#[derive(Clone, Default, Debug)]
pub struct FreeCache {
    extents: Vec<Extent>,
    heap: BinaryHeap<HeapExtent>,
}

impl FreeCache {
    /// Builds a cache from raw extents, sorting and coalescing them.
    pub fn from_extents(extents: Vec<Extent>) -> Self {
        let mut cache = Self {
            extents,
            heap: BinaryHeap::new(),
        };
        cache.rebuild();
        cache
    }

    /// The current coalesced extents, ordered by start page.
    pub fn extents(&self) -> &[Extent] {
        &self.extents
    }

    /// Total number of reusable pages.
    pub fn pages(&self) -> u64 {
        self.extents.iter().map(|e| e.len as u64).sum()
    }

    /// Takes one page from the pool, or `None` when it is empty.
    pub fn pop(&mut self) -> Option<PageId> {
        let mut extent = self.heap.pop()?;
        let chosen = extent.start;
        if let Ok(pos) = self
            .extents
            .binary_search_by_key(&extent.start.0, |e| e.start.0)
        {
            if extent.len > 1 {
                self.extents[pos].start.0 += 1;
                self.extents[pos].len -= 1;
                extent.start.0 += 1;
                extent.len -= 1;
                self.heap.push(extent);
            } else {
                self.extents.remove(pos);
            }
            Some(chosen)
        } else {
            // Heap out of step with the extent list; rebuild and retry.
            self.heap.push(extent);
            self.rebuild();
            self.pop()
        }
    }

    /// Adds extents to the pool.
    pub fn extend(&mut self, mut extents: Vec<Extent>) {
        if extents.is_empty() {
            return;
        }
        self.extents.append(&mut extents);
        self.rebuild();
    }

    fn rebuild(&mut self) {
        if self.extents.is_empty() {
            self.heap.clear();
            return;
        }
        self.extents.sort_by(|a, b| a.start.0.cmp(&b.start.0));
        let mut merged: Vec<Extent> = Vec::with_capacity(self.extents.len());
        for extent in self.extents.drain(..) {
            if extent.len == 0 {
                continue;
            }
            if let Some(last) = merged.last_mut() {
                if last.coalesce_with(&extent) {
                    continue;
                }
            }
            merged.push(extent);
        }
        self.heap = BinaryHeap::from(
            merged
                .iter()
                .copied()
                .map(HeapExtent::from)
                .collect::<Vec<_>>(),
        );
        self.extents = merged;
    }
}

const FREE_PAGE_FIXED: usize = 16;
const FREE_ENTRY_LEN: usize = 16;

/// Number of extent records one free-list page can hold.
pub fn free_page_capacity(page_size: usize) -> usize {
    let payload = page_size
        .checked_sub(PAGE_HDR_LEN)
        .expect("page size smaller than header");
    payload.saturating_sub(FREE_PAGE_FIXED) / FREE_ENTRY_LEN
}

/// Decoded free-list chain page.
pub struct FreePage {
    /// Next page in the chain, null at the tail.
    pub next: PageId,
    /// Extent records stored in this page.
    pub extents: Vec<Extent>,
}

/// Decodes and validates one free-list chain page.
pub fn read_free_page(buf: &[u8], page_no: PageId, page_size: u32, salt: u64) -> Result<FreePage> {
    let header = page::verify(buf, page_no, page_size, salt)?;
    if header.kind != PageKind::FreeList {
        return Err(VellumError::Corruption("free page kind mismatch"));
    }
    let payload = &buf[PAGE_HDR_LEN..page_size as usize];
    let next = PageId(u64::from_be_bytes(payload[0..8].try_into().unwrap()));
    let count = u32::from_be_bytes(payload[8..12].try_into().unwrap()) as usize;
    if payload[12..16] != [0; 4] {
        return Err(VellumError::Corruption("free page reserved non-zero"));
    }
    if count > free_page_capacity(page_size as usize) {
        return Err(VellumError::Corruption("free page count exceeds capacity"));
    }
    let mut extents = Vec::with_capacity(count);
    for i in 0..count {
        let off = FREE_PAGE_FIXED + i * FREE_ENTRY_LEN;
        let start = PageId(u64::from_be_bytes(
            payload[off..off + 8].try_into().unwrap(),
        ));
        let len = u32::from_be_bytes(payload[off + 8..off + 12].try_into().unwrap());
        if len == 0 {
            return Err(VellumError::Corruption("free page extent of length zero"));
        }
        extents.push(Extent::new(start, len));
    }
    Ok(FreePage { next, extents })
}

/// Encodes one free-list chain page into a checksummed page image.
pub fn write_free_page(
    page_no: PageId,
    page_size: u32,
    salt: u64,
    next: PageId,
    extents: &[Extent],
) -> Result<Vec<u8>> {
    if extents.len() > free_page_capacity(page_size as usize) {
        return Err(VellumError::Invalid("too many extents for free page"));
    }
    let mut buf = vec![0u8; page_size as usize];
    let header = PageHeader::new(page_no, PageKind::FreeList, page_size, salt)?;
    header.encode(&mut buf[..PAGE_HDR_LEN])?;
    let payload = &mut buf[PAGE_HDR_LEN..];
    payload[..8].copy_from_slice(&next.0.to_be_bytes());
    payload[8..12].copy_from_slice(&(extents.len() as u32).to_be_bytes());
    for (idx, extent) in extents.iter().enumerate() {
        let off = FREE_PAGE_FIXED + idx * FREE_ENTRY_LEN;
        payload[off..off + 8].copy_from_slice(&extent.start.0.to_be_bytes());
        payload[off + 8..off + 12].copy_from_slice(&extent.len.to_be_bytes());
    }
    page::seal(&mut buf, page_no, salt)?;
    Ok(buf)
}
