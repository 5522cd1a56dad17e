//! Read and write transactions.
//!
//! A [`ReadTxn`] pins the committed metadata record it was opened against
//! and reads only pages reachable from that snapshot; it never blocks and is
//! never blocked. A [`WriteTxn`] owns the environment's single write slot
//! and accumulates a private set of copy-on-write page images; nothing it
//! does is observable anywhere until [`WriteTxn::commit`] publishes the new
//! metadata, and dropping it uncommitted leaves no trace.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use tracing::debug;

use crate::primitives::concurrency::{ReaderGuard, WriteSlotGuard};
use crate::primitives::pager::{
    encode_meta_page, free_page_capacity, write_free_page, Extent, FreeCache, Meta, TreeEntry,
    MAX_TREES, MAX_TREE_NAME_LEN,
};
use crate::storage::btree::{self, PageSource, PageStoreMut, RangeScan};
use crate::types::{PageId, Result, TxId, VellumError};

use super::{Env, Tree};

/// Lifecycle state of a write transaction.
///
/// The state machine is `Open -> {Committed | RolledBack}`, terminal either
/// way. Both transitions consume the transaction value, so operating on a
/// terminated transaction is unrepresentable rather than a runtime error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxState {
    /// Transaction accepts operations.
    Open,
    /// Changes were durably published.
    Committed,
    /// Changes were discarded.
    RolledBack,
}

/// A read-only transaction over an immutable snapshot.
pub struct ReadTxn<'env> {
    env: &'env Env,
    meta: Arc<Meta>,
    _reader: ReaderGuard,
}

impl<'env> ReadTxn<'env> {
    pub(super) fn new(env: &'env Env, meta: Arc<Meta>, reader: ReaderGuard) -> Self {
        Self {
            env,
            meta,
            _reader: reader,
        }
    }

    /// The committed transaction number this snapshot observes.
    pub fn txid(&self) -> TxId {
        self.meta.last_txid
    }

    /// Looks up a named tree in the snapshot's catalog.
    pub fn open_tree(&self, name: &str) -> Option<Tree> {
        self.meta.tree_slot(name).map(|slot| Tree { slot })
    }

    /// Point lookup.
    pub fn get(&self, tree: &Tree, key: &[u8]) -> Result<Option<Bytes>> {
        let root = tree_entry(&self.meta, tree)?.root;
        btree::get(self, root, key)
    }

    /// Returns the key's version stamp, or 0 when the snapshot has no entry.
    pub fn read_version(&self, tree: &Tree, key: &[u8]) -> Result<u16> {
        let root = tree_entry(&self.meta, tree)?.root;
        btree::read_version(self, root, key)
    }

    /// Iterates over `low..=high` in key order.
    pub fn scan_range(
        &self,
        tree: &Tree,
        low: &[u8],
        high: &[u8],
    ) -> Result<RangeScan<'_, Self>> {
        let root = tree_entry(&self.meta, tree)?.root;
        RangeScan::new(self, root, low, Some(high.to_vec()))
    }

    /// Iterates over the whole tree in key order.
    pub fn scan(&self, tree: &Tree) -> Result<RangeScan<'_, Self>> {
        let root = tree_entry(&self.meta, tree)?.root;
        RangeScan::new(self, root, &[], None)
    }

    /// Number of entries in the tree.
    pub fn len(&self, tree: &Tree) -> Result<u64> {
        Ok(tree_entry(&self.meta, tree)?.len)
    }

    /// Whether the tree has no entries.
    pub fn is_empty(&self, tree: &Tree) -> Result<bool> {
        Ok(self.len(tree)? == 0)
    }
}

impl PageSource for ReadTxn<'_> {
    fn page_size(&self) -> u32 {
        self.env.pager.page_size()
    }

    fn salt(&self) -> u64 {
        self.env.pager.salt()
    }

    fn view(&self, id: PageId) -> Result<Arc<[u8]>> {
        self.env.read_committed_page(id)
    }
}

/// A read-write transaction holding the environment's write slot.
pub struct WriteTxn<'env> {
    env: &'env Env,
    _slot: WriteSlotGuard<'env>,
    meta: Meta,
    free: FreeCache,
    dirty: HashMap<PageId, Arc<[u8]>>,
    freed: Vec<PageId>,
    state: TxState,
    mutated: bool,
    failed: bool,
}

impl<'env> WriteTxn<'env> {
    pub(super) fn new(
        env: &'env Env,
        slot: WriteSlotGuard<'env>,
        meta: Meta,
        free: FreeCache,
    ) -> Self {
        debug!(base_txid = meta.last_txid.0, "write transaction started");
        Self {
            env,
            _slot: slot,
            meta,
            free,
            dirty: HashMap::new(),
            freed: Vec::new(),
            state: TxState::Open,
            mutated: false,
            failed: false,
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> TxState {
        self.state
    }

    /// Opens a named tree, creating its catalog entry if missing.
    pub fn create_tree(&mut self, name: &str) -> Result<Tree> {
        if let Some(slot) = self.meta.tree_slot(name) {
            return Ok(Tree { slot });
        }
        if name.is_empty() || name.len() > MAX_TREE_NAME_LEN {
            return Err(VellumError::Invalid("tree name length out of range"));
        }
        if self.meta.trees.len() >= MAX_TREES {
            return Err(VellumError::Invalid("tree catalog full"));
        }
        let slot = self.meta.trees.len();
        self.meta.trees.push(TreeEntry {
            name: name.to_owned(),
            root: PageId::NULL,
            len: 0,
        });
        self.mutated = true;
        Ok(Tree { slot })
    }

    /// Looks up a named tree without creating it.
    pub fn open_tree(&self, name: &str) -> Option<Tree> {
        self.meta.tree_slot(name).map(|slot| Tree { slot })
    }

    /// Inserts or overwrites `key`. The entry's version stamp becomes 1 for
    /// a fresh key and is bumped by one on overwrite (65535 wraps to 1).
    pub fn put(&mut self, tree: &Tree, key: &[u8], value: &[u8]) -> Result<()> {
        let root = tree_entry(&self.meta, tree)?.root;
        let outcome = match btree::put(self, root, key, value) {
            Ok(outcome) => outcome,
            Err(err) => {
                // A failed mutation may leave half-built pages in the
                // private set; the transaction can only be rolled back.
                self.failed = true;
                return Err(err);
            }
        };
        let entry = &mut self.meta.trees[tree.slot];
        entry.root = outcome.root;
        if outcome.inserted {
            entry.len += 1;
        }
        self.mutated = true;
        Ok(())
    }

    /// Removes `key`, returning whether an entry existed. Afterwards the
    /// key reads as never written: `get` is `None`, `read_version` is 0.
    pub fn delete(&mut self, tree: &Tree, key: &[u8]) -> Result<bool> {
        let root = tree_entry(&self.meta, tree)?.root;
        let outcome = match btree::delete(self, root, key) {
            Ok(outcome) => outcome,
            Err(err) => {
                self.failed = true;
                return Err(err);
            }
        };
        if outcome.deleted {
            let entry = &mut self.meta.trees[tree.slot];
            entry.root = outcome.root;
            entry.len -= 1;
            self.mutated = true;
        }
        Ok(outcome.deleted)
    }

    /// Point lookup observing this transaction's own uncommitted writes.
    pub fn get(&self, tree: &Tree, key: &[u8]) -> Result<Option<Bytes>> {
        let root = tree_entry(&self.meta, tree)?.root;
        btree::get(self, root, key)
    }

    /// Returns the key's version stamp as visible inside this transaction:
    /// uncommitted bumps included, 0 when no entry exists.
    pub fn read_version(&self, tree: &Tree, key: &[u8]) -> Result<u16> {
        let root = tree_entry(&self.meta, tree)?.root;
        btree::read_version(self, root, key)
    }

    /// Iterates over `low..=high` in key order, uncommitted writes included.
    pub fn scan_range(
        &self,
        tree: &Tree,
        low: &[u8],
        high: &[u8],
    ) -> Result<RangeScan<'_, Self>> {
        let root = tree_entry(&self.meta, tree)?.root;
        RangeScan::new(self, root, low, Some(high.to_vec()))
    }

    /// Iterates over the whole tree in key order.
    pub fn scan(&self, tree: &Tree) -> Result<RangeScan<'_, Self>> {
        let root = tree_entry(&self.meta, tree)?.root;
        RangeScan::new(self, root, &[], None)
    }

    /// Number of entries in the tree as of this transaction.
    pub fn len(&self, tree: &Tree) -> Result<u64> {
        Ok(tree_entry(&self.meta, tree)?.len)
    }

    /// Whether the tree has no entries.
    pub fn is_empty(&self, tree: &Tree) -> Result<bool> {
        Ok(self.len(tree)? == 0)
    }

    /// Commits the transaction: journal, apply, publish. On success every
    /// change becomes visible to transactions opened afterwards; on failure
    /// before the journal flush nothing is published anywhere.
    pub fn commit(mut self) -> Result<()> {
        self.do_commit()
    }

    /// Discards the transaction. Equivalent to dropping it.
    pub fn rollback(mut self) {
        self.state = TxState::RolledBack;
        debug!("write transaction rolled back");
    }

    fn do_commit(&mut self) -> Result<()> {
        if self.failed {
            return Err(VellumError::Invalid(
                "transaction aborted by an earlier write failure",
            ));
        }
        if !self.mutated {
            self.state = TxState::Committed;
            return Ok(());
        }
        let txid = self.meta.last_txid.next();

        let (_, old_chain) = self.env.pager.load_free_list(self.meta.free_head)?;
        let mut newly_freed = std::mem::take(&mut self.freed);

        self.write_free_list(&old_chain, &mut newly_freed)?;
        self.meta.last_txid = txid;

        let slot = Meta::slot_for(txid);
        let meta_image = encode_meta_page(&self.meta, slot)?;

        let mut pages: Vec<(PageId, Arc<[u8]>)> =
            self.dirty.iter().map(|(id, image)| (*id, image.clone())).collect();
        pages.sort_unstable_by_key(|(id, _)| *id);

        {
            let mut wal = self.env.wal.lock();
            let journaled: Result<()> = (|| {
                for (id, image) in &pages {
                    wal.append_page_frame(*id, txid, image)?;
                }
                wal.append_commit_frame(slot, txid, &meta_image)?;
                wal.sync()
            })();
            if let Err(err) = journaled {
                // Nothing of this transaction is durable. Checkpoint to
                // discard the partial record so the next commit cannot pair
                // its commit frame with these orphaned page frames.
                if self.env.pager.sync().is_err() || wal.reset().is_err() {
                    self.env.wedge();
                }
                return Err(err);
            }

            // The journal record is durable: from here the transaction is
            // committed and a failure only loses the in-process state, never
            // the data. Recovery replays the record on the next open.
            for (id, image) in &pages {
                if let Err(err) = self.env.pager.apply_page_image(*id, image) {
                    self.env.wedge();
                    return Err(err);
                }
            }
            if let Err(err) = self.env.pager.apply_page_image(slot, &meta_image) {
                self.env.wedge();
                return Err(err);
            }

            let wal_size = wal.size().unwrap_or(0);
            if wal_size > self.env.options.checkpoint_after_bytes {
                if let Err(err) = self.env.pager.sync().and_then(|()| wal.reset()) {
                    self.env.wedge();
                    return Err(err);
                }
                debug!(txid = txid.0, wal_size, "journal checkpointed after commit");
            }
        }

        {
            let mut state = self.env.state.lock();
            state.free = std::mem::take(&mut self.free);
            state
                .pending
                .push_back((txid, newly_freed.iter().map(|&p| Extent::new(p, 1)).collect()));
            state.meta = Arc::new(self.meta.clone());
        }
        self.state = TxState::Committed;
        debug!(
            txid = txid.0,
            pages = pages.len(),
            freed = newly_freed.len(),
            "transaction committed"
        );
        Ok(())
    }

    /// Serializes the post-commit free set (this transaction's working pool,
    /// the environment's reclamation queue and the pages freed just now)
    /// into the free-list chain.
    ///
    /// The previous chain's pages are rewritten in place: they belong to no
    /// reader snapshot (only the committed metadata points at them, and only
    /// environment open walks them), and the rewrite goes through the
    /// journal like every other page. Reusing them keeps the chain from
    /// consuming a fresh tail page per commit; extra pages, when the chain
    /// grows, come from the file tail so the set being serialized stays
    /// stable.
    fn write_free_list(&mut self, old_chain: &[PageId], newly_freed: &mut Vec<PageId>) -> Result<()> {
        let page_size = self.env.pager.page_size();
        let salt = self.env.pager.salt();

        let mut base: Vec<Extent> = self.free.extents().to_vec();
        {
            let state = self.env.state.lock();
            for (_, extents) in &state.pending {
                base.extend(extents.iter().copied());
            }
        }
        base.extend(newly_freed.iter().map(|&p| Extent::new(p, 1)));

        // Chain length bound: assume every old chain page that is not
        // reused must itself be recorded as free.
        let capacity = free_page_capacity(page_size as usize);
        let mut probe = base.clone();
        probe.extend(old_chain.iter().map(|&p| Extent::new(p, 1)));
        let worst = FreeCache::from_extents(probe);
        let needed = worst.extents().len().div_ceil(capacity);

        if needed == 0 {
            self.meta.free_head = PageId::NULL;
            return Ok(());
        }
        let reuse = needed.min(old_chain.len());
        let mut chain: Vec<PageId> = old_chain[..reuse].to_vec();
        for _ in reuse..needed {
            chain.push(self.allocate_tail()?);
        }
        let leftovers = &old_chain[reuse..];
        base.extend(leftovers.iter().map(|&p| Extent::new(p, 1)));
        newly_freed.extend_from_slice(leftovers);

        let persist = FreeCache::from_extents(base);
        let extents = persist.extents();
        debug_assert!(extents.len().div_ceil(capacity) <= chain.len());

        for (idx, page) in chain.iter().enumerate() {
            let lo = (idx * capacity).min(extents.len());
            let hi = ((idx + 1) * capacity).min(extents.len());
            let next = chain.get(idx + 1).copied().unwrap_or(PageId::NULL);
            let image = write_free_page(*page, page_size, salt, next, &extents[lo..hi])?;
            self.dirty.insert(*page, image.into());
        }
        self.meta.free_head = chain[0];
        Ok(())
    }

    fn allocate_tail(&mut self) -> Result<PageId> {
        if let Some(limit) = self.env.options.max_pages {
            if self.meta.next_page.0 >= limit {
                return Err(VellumError::Capacity("page limit reached"));
            }
        }
        let id = self.meta.next_page;
        self.meta.next_page = PageId(id.0 + 1);
        Ok(id)
    }
}

impl PageSource for WriteTxn<'_> {
    fn page_size(&self) -> u32 {
        self.env.pager.page_size()
    }

    fn salt(&self) -> u64 {
        self.env.pager.salt()
    }

    fn view(&self, id: PageId) -> Result<Arc<[u8]>> {
        if let Some(image) = self.dirty.get(&id) {
            return Ok(image.clone());
        }
        self.env.read_committed_page(id)
    }
}

impl PageStoreMut for WriteTxn<'_> {
    fn allocate(&mut self) -> Result<PageId> {
        if let Some(id) = self.free.pop() {
            return Ok(id);
        }
        self.allocate_tail()
    }

    fn free_page(&mut self, id: PageId) {
        // A page allocated by this very transaction carries no published
        // state; dropping its private image keeps it out of the journal.
        self.dirty.remove(&id);
        self.freed.push(id);
    }

    fn is_shadowed(&self, id: PageId) -> bool {
        self.dirty.contains_key(&id)
    }

    fn put_image(&mut self, id: PageId, image: Vec<u8>) {
        self.dirty.insert(id, image.into());
    }
}

impl Drop for WriteTxn<'_> {
    fn drop(&mut self) {
        if self.state == TxState::Open {
            debug!("write transaction dropped without commit; rolled back");
        }
    }
}

fn tree_entry<'m>(meta: &'m Meta, tree: &Tree) -> Result<&'m TreeEntry> {
    meta.trees
        .get(tree.slot)
        .ok_or(VellumError::Invalid("unknown tree handle"))
}
