//! Overflow chains for values too large to inline in a leaf.
//!
//! A chain is a singly linked list of `Overflow` pages, each holding a
//! `next` pointer, a chunk length and the chunk bytes. The leaf entry keeps
//! the head page and the total value length.

use std::convert::TryInto;

use bytes::Bytes;

use crate::types::page::{self, PageHeader, PageKind, PAGE_HDR_LEN};
use crate::types::{PageId, Result, VellumError};

use super::{PageSource, PageStoreMut};
use super::node::ValueRef;

const OVERFLOW_HDR_LEN: usize = 16;

/// Largest value stored inline in a leaf; longer values go to a chain.
pub fn inline_threshold(page_size: u32) -> usize {
    page_size as usize / 4
}

/// Value bytes one overflow page can hold.
pub fn chunk_capacity(page_size: u32) -> usize {
    page_size as usize - PAGE_HDR_LEN - OVERFLOW_HDR_LEN
}

/// Prepares a value for storage: inline when small, otherwise written out
/// as a fresh overflow chain.
pub fn build_value<S: PageStoreMut>(store: &mut S, value: &[u8]) -> Result<ValueRef> {
    let page_size = store.page_size();
    if value.len() <= inline_threshold(page_size) {
        return Ok(ValueRef::Inline(value.to_vec()));
    }
    let chunk = chunk_capacity(page_size);
    let chunks: Vec<&[u8]> = value.chunks(chunk).collect();
    let mut ids = Vec::with_capacity(chunks.len());
    for _ in 0..chunks.len() {
        ids.push(store.allocate()?);
    }
    for (idx, part) in chunks.iter().enumerate().rev() {
        let next = ids.get(idx + 1).copied().unwrap_or(PageId::NULL);
        let image = encode_overflow_page(ids[idx], page_size, store.salt(), next, part)?;
        store.put_image(ids[idx], image);
    }
    Ok(ValueRef::Overflow {
        head: ids[0],
        len: value.len() as u64,
    })
}

/// Materializes a chain into contiguous bytes, validating the total length.
pub fn read_chain<S: PageSource + ?Sized>(store: &S, head: PageId, len: u64) -> Result<Bytes> {
    let max_pages = len / chunk_capacity(store.page_size()) as u64 + 1;
    let mut out = Vec::with_capacity(len as usize);
    let mut cursor = head;
    let mut pages = 0u64;
    while !cursor.is_null() {
        pages += 1;
        if pages > max_pages {
            return Err(VellumError::Corruption("overflow chain longer than value"));
        }
        let image = store.view(cursor)?;
        let (next, chunk) = decode_overflow_page(&image, store.page_size())?;
        out.extend_from_slice(chunk);
        cursor = next;
    }
    if out.len() as u64 != len {
        return Err(VellumError::Corruption("overflow chain length mismatch"));
    }
    Ok(Bytes::from(out))
}

/// Frees every page of a chain.
pub fn free_chain<S: PageStoreMut>(store: &mut S, head: PageId) -> Result<()> {
    let mut cursor = head;
    let mut released = Vec::new();
    while !cursor.is_null() {
        if released.contains(&cursor) {
            return Err(VellumError::Corruption("overflow chain contains a cycle"));
        }
        let image = store.view(cursor)?;
        let (next, _) = decode_overflow_page(&image, store.page_size())?;
        released.push(cursor);
        cursor = next;
    }
    for id in released {
        store.free_page(id);
    }
    Ok(())
}

fn encode_overflow_page(
    page_no: PageId,
    page_size: u32,
    salt: u64,
    next: PageId,
    chunk: &[u8],
) -> Result<Vec<u8>> {
    if chunk.len() > chunk_capacity(page_size) {
        return Err(VellumError::Invalid("overflow chunk exceeds page capacity"));
    }
    let mut buf = vec![0u8; page_size as usize];
    let header = PageHeader::new(page_no, PageKind::Overflow, page_size, salt)?;
    header.encode(&mut buf[..PAGE_HDR_LEN])?;
    let payload = &mut buf[PAGE_HDR_LEN..];
    payload[0..8].copy_from_slice(&next.0.to_be_bytes());
    payload[8..12].copy_from_slice(&(chunk.len() as u32).to_be_bytes());
    payload[OVERFLOW_HDR_LEN..OVERFLOW_HDR_LEN + chunk.len()].copy_from_slice(chunk);
    page::seal(&mut buf, page_no, salt)?;
    Ok(buf)
}

fn decode_overflow_page(buf: &[u8], page_size: u32) -> Result<(PageId, &[u8])> {
    let header = PageHeader::decode(buf)?;
    if header.kind != PageKind::Overflow {
        return Err(VellumError::Corruption("expected an overflow page"));
    }
    if buf.len() < page_size as usize {
        return Err(VellumError::Corruption("overflow page truncated"));
    }
    let payload = &buf[PAGE_HDR_LEN..page_size as usize];
    let next = PageId(u64::from_be_bytes(payload[0..8].try_into().unwrap()));
    let chunk_len = u32::from_be_bytes(payload[8..12].try_into().unwrap()) as usize;
    if chunk_len > chunk_capacity(page_size) {
        return Err(VellumError::Corruption("overflow chunk length out of range"));
    }
    Ok((next, &payload[OVERFLOW_HDR_LEN..OVERFLOW_HDR_LEN + chunk_len]))
}
