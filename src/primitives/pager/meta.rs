//! Environment metadata: the small fixed record that makes commits atomic.
//!
//! The metadata record holds the committed tree catalog (names and root
//! pages), the last committed transaction number, the free-list head and the
//! allocation high-water mark. It is double-buffered across pages 0 and 1:
//! each commit writes the record for transaction N into slot `N % 2`, so a
//! torn metadata write can only damage the slot being written while the
//! other slot still holds the previous committed record. Opening picks the
//! valid slot with the highest transaction number.

use std::convert::TryInto;
use std::ops::Range;

use rand::rngs::OsRng;
use rand::RngCore;

use crate::primitives::io::FileIo;
use crate::types::page::{
    self, PageHeader, PageKind, MIN_PAGE_SIZE, PAGE_FORMAT_VERSION, PAGE_HDR_LEN,
};
use crate::types::{PageId, Result, TxId, VellumError};

/// Number of metadata slots at the front of the data file.
pub const META_SLOTS: u64 = 2;
/// First page number available to data.
pub const FIRST_DATA_PAGE: u64 = META_SLOTS;
/// Maximum number of named trees in one environment.
pub const MAX_TREES: usize = 32;
/// Maximum byte length of a tree name.
pub const MAX_TREE_NAME_LEN: usize = 48;

const META_SALT: Range<usize> = PAGE_HDR_LEN..PAGE_HDR_LEN + 8;
const META_PAGE_SIZE: Range<usize> = PAGE_HDR_LEN + 8..PAGE_HDR_LEN + 12;
const META_FORMAT_VERSION: Range<usize> = PAGE_HDR_LEN + 12..PAGE_HDR_LEN + 14;
const META_RESERVED: Range<usize> = PAGE_HDR_LEN + 14..PAGE_HDR_LEN + 16;
const META_LAST_TXID: Range<usize> = PAGE_HDR_LEN + 16..PAGE_HDR_LEN + 24;
const META_FREE_HEAD: Range<usize> = PAGE_HDR_LEN + 24..PAGE_HDR_LEN + 32;
const META_NEXT_PAGE: Range<usize> = PAGE_HDR_LEN + 32..PAGE_HDR_LEN + 40;
const META_TREE_COUNT: Range<usize> = PAGE_HDR_LEN + 40..PAGE_HDR_LEN + 42;
const META_RESERVED_2: Range<usize> = PAGE_HDR_LEN + 42..PAGE_HDR_LEN + 48;
const META_CATALOG: usize = PAGE_HDR_LEN + 48;
const CATALOG_ENTRY_LEN: usize = 1 + MAX_TREE_NAME_LEN + 8 + 8;

/// One named tree in the catalog.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TreeEntry {
    /// The tree's name, unique within the environment.
    pub name: String,
    /// Root page of the tree; null while the tree is empty.
    pub root: PageId,
    /// Number of live entries in the tree.
    pub len: u64,
}

/// The environment metadata record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Meta {
    /// Page size the database was created with.
    pub page_size: u32,
    /// Per-database checksum salt.
    pub salt: u64,
    /// On-disk format version.
    pub format_version: u16,
    /// Last committed transaction number.
    pub last_txid: TxId,
    /// Head of the persisted free-list chain; null when empty.
    pub free_head: PageId,
    /// Allocation high-water mark: the next never-used page number.
    pub next_page: PageId,
    /// Tree catalog.
    pub trees: Vec<TreeEntry>,
}

impl Meta {
    /// The metadata slot the record for `txid` is written to.
    pub fn slot_for(txid: TxId) -> PageId {
        PageId(txid.0 % META_SLOTS)
    }

    /// Looks up a catalog entry by name.
    pub fn tree_slot(&self, name: &str) -> Option<usize> {
        self.trees.iter().position(|t| t.name == name)
    }
}

/// Creates a fresh metadata record and writes it to both slots.
pub fn create_meta(io: &dyn FileIo, page_size: u32) -> Result<Meta> {
    let mut rng = OsRng;
    let meta = Meta {
        page_size,
        salt: rng.next_u64(),
        format_version: PAGE_FORMAT_VERSION,
        last_txid: TxId(0),
        free_head: PageId::NULL,
        next_page: PageId(FIRST_DATA_PAGE),
        trees: Vec::new(),
    };
    for slot in 0..META_SLOTS {
        let image = encode_meta_page(&meta, PageId(slot))?;
        io.write_at(slot * page_size as u64, &image)?;
    }
    io.sync_all()?;
    Ok(meta)
}

/// Loads the metadata from an existing database: reads both slots and keeps
/// the valid record with the highest transaction number.
///
/// `fallback_page_size` is only used to locate slot 1 when slot 0 is too
/// damaged to reveal the real page size.
pub fn load_meta(io: &dyn FileIo, fallback_page_size: u32) -> Result<Meta> {
    let page_size = sniff_page_size(io).unwrap_or(fallback_page_size);
    let mut best: Option<Meta> = None;
    for slot in 0..META_SLOTS {
        let mut buf = vec![0u8; page_size as usize];
        if io.read_at(slot * page_size as u64, &mut buf).is_err() {
            continue;
        }
        let Ok(meta) = read_meta_page(&buf, PageId(slot)) else {
            continue;
        };
        match &best {
            Some(current) if current.last_txid >= meta.last_txid => {}
            _ => best = Some(meta),
        }
    }
    best.ok_or(VellumError::Corruption("no valid metadata slot"))
}

fn sniff_page_size(io: &dyn FileIo) -> Option<u32> {
    let mut hdr = [0u8; PAGE_HDR_LEN];
    io.read_at(0, &mut hdr).ok()?;
    let header = PageHeader::decode(&hdr).ok()?;
    if header.page_size >= MIN_PAGE_SIZE {
        Some(header.page_size)
    } else {
        None
    }
}

/// Encodes the metadata record into a checksummed page image for `slot`.
pub fn encode_meta_page(meta: &Meta, slot: PageId) -> Result<Vec<u8>> {
    if meta.trees.len() > MAX_TREES {
        return Err(VellumError::Invalid("tree catalog overflow"));
    }
    let page_size = meta.page_size as usize;
    if page_size < META_CATALOG + MAX_TREES * CATALOG_ENTRY_LEN {
        return Err(VellumError::Invalid("page size too small for catalog"));
    }
    let mut buf = vec![0u8; page_size];
    let header = PageHeader::new(slot, PageKind::Meta, meta.page_size, meta.salt)?;
    header.encode(&mut buf[..PAGE_HDR_LEN])?;
    buf[META_SALT].copy_from_slice(&meta.salt.to_be_bytes());
    buf[META_PAGE_SIZE].copy_from_slice(&meta.page_size.to_be_bytes());
    buf[META_FORMAT_VERSION].copy_from_slice(&meta.format_version.to_be_bytes());
    buf[META_LAST_TXID].copy_from_slice(&meta.last_txid.0.to_be_bytes());
    buf[META_FREE_HEAD].copy_from_slice(&meta.free_head.0.to_be_bytes());
    buf[META_NEXT_PAGE].copy_from_slice(&meta.next_page.0.to_be_bytes());
    buf[META_TREE_COUNT].copy_from_slice(&(meta.trees.len() as u16).to_be_bytes());
    for (idx, tree) in meta.trees.iter().enumerate() {
        let name = tree.name.as_bytes();
        if name.is_empty() || name.len() > MAX_TREE_NAME_LEN {
            return Err(VellumError::Invalid("tree name length out of range"));
        }
        let off = META_CATALOG + idx * CATALOG_ENTRY_LEN;
        buf[off] = name.len() as u8;
        buf[off + 1..off + 1 + name.len()].copy_from_slice(name);
        let tail = off + 1 + MAX_TREE_NAME_LEN;
        buf[tail..tail + 8].copy_from_slice(&tree.root.0.to_be_bytes());
        buf[tail + 8..tail + 16].copy_from_slice(&tree.len.to_be_bytes());
    }
    page::seal(&mut buf, slot, meta.salt)?;
    Ok(buf)
}

/// Decodes and validates a metadata page image read from `slot`.
pub fn read_meta_page(buf: &[u8], slot: PageId) -> Result<Meta> {
    let header = PageHeader::decode(buf)?;
    if header.kind != PageKind::Meta {
        return Err(VellumError::Corruption("meta page has wrong kind"));
    }
    let header = page::verify(buf, slot, header.page_size, header.salt)?;
    let salt = u64::from_be_bytes(buf[META_SALT].try_into().unwrap());
    let page_size = u32::from_be_bytes(buf[META_PAGE_SIZE].try_into().unwrap());
    if salt != header.salt || page_size != header.page_size {
        return Err(VellumError::Corruption("meta record disagrees with header"));
    }
    let format_version = u16::from_be_bytes(buf[META_FORMAT_VERSION].try_into().unwrap());
    if format_version != PAGE_FORMAT_VERSION {
        return Err(VellumError::Corruption("unsupported meta format version"));
    }
    if buf[META_RESERVED].iter().any(|b| *b != 0) || buf[META_RESERVED_2].iter().any(|b| *b != 0) {
        return Err(VellumError::Corruption("meta reserved field non-zero"));
    }
    let last_txid = TxId(u64::from_be_bytes(buf[META_LAST_TXID].try_into().unwrap()));
    let free_head = PageId(u64::from_be_bytes(buf[META_FREE_HEAD].try_into().unwrap()));
    let next_page = PageId(u64::from_be_bytes(buf[META_NEXT_PAGE].try_into().unwrap()));
    if next_page.0 < FIRST_DATA_PAGE {
        return Err(VellumError::Corruption("meta high-water mark below data pages"));
    }
    let tree_count = u16::from_be_bytes(buf[META_TREE_COUNT].try_into().unwrap()) as usize;
    if tree_count > MAX_TREES {
        return Err(VellumError::Corruption("meta tree count exceeds maximum"));
    }
    let mut trees = Vec::with_capacity(tree_count);
    for idx in 0..tree_count {
        let off = META_CATALOG + idx * CATALOG_ENTRY_LEN;
        let name_len = buf[off] as usize;
        if name_len == 0 || name_len > MAX_TREE_NAME_LEN {
            return Err(VellumError::Corruption("meta tree name length out of range"));
        }
        let name = std::str::from_utf8(&buf[off + 1..off + 1 + name_len])
            .map_err(|_| VellumError::Corruption("meta tree name not utf-8"))?
            .to_owned();
        let tail = off + 1 + MAX_TREE_NAME_LEN;
        let root = PageId(u64::from_be_bytes(buf[tail..tail + 8].try_into().unwrap()));
        let len = u64::from_be_bytes(buf[tail + 8..tail + 16].try_into().unwrap());
        trees.push(TreeEntry { name, root, len });
    }
    Ok(Meta {
        page_size,
        salt,
        format_version,
        last_txid,
        free_head,
        next_page,
        trees,
    })
}
