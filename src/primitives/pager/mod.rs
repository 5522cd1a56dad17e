//! The page store: fixed-size page access over a backing [`FileIo`].
//!
//! All reads validate the page header and checksum; a page that cannot be
//! validated is never trusted. Committed pages are immutable until freed and
//! reclaimed, so a small LRU cache of page images stays coherent: the only
//! writes that ever change a page's bytes go through
//! [`Pager::apply_page_image`], which refreshes the cache entry.

mod freelist;
mod meta;

pub use freelist::{
    free_page_capacity, read_free_page, write_free_page, Extent, FreeCache, FreePage,
};
pub use meta::{
    create_meta, encode_meta_page, load_meta, read_meta_page, Meta, TreeEntry, FIRST_DATA_PAGE,
    MAX_TREES, MAX_TREE_NAME_LEN, META_SLOTS,
};

use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;
use parking_lot::Mutex;

use crate::primitives::io::FileIo;
use crate::types::{page, PageId, Result, VellumError};

/// Default number of page images kept in the read cache.
pub const DEFAULT_CACHE_PAGES: usize = 1024;

/// Checksum-verifying page store over a backing file or memory region.
pub struct Pager {
    io: Box<dyn FileIo>,
    page_size: u32,
    salt: u64,
    cache: Mutex<LruCache<PageId, Arc<[u8]>>>,
}

impl Pager {
    /// Builds a pager over `io` for a database with the given geometry.
    pub fn new(io: Box<dyn FileIo>, page_size: u32, salt: u64, cache_pages: usize) -> Self {
        let cache_pages = NonZeroUsize::new(cache_pages)
            .unwrap_or_else(|| NonZeroUsize::new(DEFAULT_CACHE_PAGES).unwrap());
        Self {
            io,
            page_size,
            salt,
            cache: Mutex::new(LruCache::new(cache_pages)),
        }
    }

    /// The page size of the underlying database.
    pub fn page_size(&self) -> u32 {
        self.page_size
    }

    /// The database checksum salt.
    pub fn salt(&self) -> u64 {
        self.salt
    }

    /// Access to the backing store, for metadata bootstrap and recovery.
    pub fn io(&self) -> &dyn FileIo {
        self.io.as_ref()
    }

    /// Reads and validates a page, serving repeated reads from the cache.
    pub fn read_page(&self, id: PageId) -> Result<Arc<[u8]>> {
        if let Some(data) = self.cache.lock().get(&id) {
            return Ok(data.clone());
        }
        let mut buf = vec![0u8; self.page_size as usize];
        self.io
            .read_at(page_offset(id, self.page_size)?, &mut buf)
            .map_err(|err| match err {
                VellumError::Io(io) if io.kind() == std::io::ErrorKind::UnexpectedEof => {
                    VellumError::Corruption("page read past end of store")
                }
                other => other,
            })?;
        page::verify(&buf, id, self.page_size, self.salt)?;
        let data: Arc<[u8]> = buf.into();
        self.cache.lock().put(id, data.clone());
        Ok(data)
    }

    /// Writes a committed page image into the store at its page slot and
    /// refreshes the cache. The image must be exactly one page long.
    pub fn apply_page_image(&self, id: PageId, data: &[u8]) -> Result<()> {
        if data.len() != self.page_size as usize {
            return Err(VellumError::Invalid("page image size mismatch"));
        }
        self.io.write_at(page_offset(id, self.page_size)?, data)?;
        let image: Arc<[u8]> = data.to_vec().into();
        self.cache.lock().put(id, image);
        Ok(())
    }

    /// Forces applied pages durable.
    pub fn sync(&self) -> Result<()> {
        self.io.sync_all()
    }

    /// Walks the persisted free-list chain starting at `head`, returning the
    /// reusable extents and the chain's own page numbers.
    pub fn load_free_list(&self, head: PageId) -> Result<(Vec<Extent>, Vec<PageId>)> {
        let mut extents = Vec::new();
        let mut chain = Vec::new();
        let mut cursor = head;
        while !cursor.is_null() {
            if chain.contains(&cursor) {
                return Err(VellumError::Corruption("free-list chain contains a cycle"));
            }
            let image = self.read_page(cursor)?;
            let free_page = read_free_page(&image, cursor, self.page_size, self.salt)?;
            chain.push(cursor);
            extents.extend(free_page.extents);
            cursor = free_page.next;
        }
        Ok((extents, chain))
    }
}

fn page_offset(id: PageId, page_size: u32) -> Result<u64> {
    id.0.checked_mul(page_size as u64)
        .ok_or(VellumError::Invalid("page offset overflow"))
}
