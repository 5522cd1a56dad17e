//! The storage environment: open/close lifecycle, crash recovery and
//! transaction handout.

mod transaction;

pub use transaction::{ReadTxn, TxState, WriteTxn};

use std::collections::VecDeque;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::primitives::concurrency::{ReaderTable, WriteSlot};
use crate::primitives::io::{FileIo, MemIo, StdFileIo};
use crate::primitives::pager::{
    create_meta, load_meta, Extent, FreeCache, Meta, Pager, DEFAULT_CACHE_PAGES, FIRST_DATA_PAGE,
};
use crate::primitives::wal::Wal;
use crate::types::page::{DEFAULT_PAGE_SIZE, MAX_PAGE_SIZE, MIN_PAGE_SIZE};
use crate::types::{PageId, Result, TxId, VellumError};

/// Handle to a named tree in the environment's catalog.
///
/// Handles are cheap indexes into the catalog; a handle stays valid for the
/// lifetime of the environment once the creating transaction committed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tree {
    pub(crate) slot: usize,
}

/// Configuration for opening an environment.
#[derive(Clone, Debug)]
pub struct Options {
    /// Page size in bytes for a freshly created database. An existing
    /// database keeps the size it was created with.
    pub page_size: u32,
    /// Number of page images held in the read cache.
    pub cache_pages: usize,
    /// Hard limit on the number of pages; `None` is unbounded. Reaching the
    /// limit fails the allocating write transaction with a capacity error.
    pub max_pages: Option<u64>,
    /// Whether commits fsync the journal before applying. Turning this off
    /// trades durability of the latest commits for speed; consistency is
    /// unaffected.
    pub sync: bool,
    /// Journal size that triggers a checkpoint after commit.
    pub checkpoint_after_bytes: u64,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            cache_pages: DEFAULT_CACHE_PAGES,
            max_pages: None,
            sync: true,
            checkpoint_after_bytes: 8 * 1024 * 1024,
        }
    }
}

impl Options {
    fn validate(&self) -> Result<()> {
        if !self.page_size.is_power_of_two()
            || !(MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&self.page_size)
        {
            return Err(VellumError::Invalid(
                "page size must be a power of two between 4 KiB and 64 KiB",
            ));
        }
        if self.cache_pages == 0 {
            return Err(VellumError::Invalid("cache must hold at least one page"));
        }
        if self.checkpoint_after_bytes == 0 {
            return Err(VellumError::Invalid("checkpoint threshold must be non-zero"));
        }
        if let Some(limit) = self.max_pages {
            if limit <= FIRST_DATA_PAGE {
                return Err(VellumError::Invalid("page limit leaves no data pages"));
            }
        }
        Ok(())
    }
}

pub(crate) struct EnvState {
    pub(crate) meta: Arc<Meta>,
    pub(crate) free: FreeCache,
    /// Pages freed by a committed transaction, queued until every open
    /// snapshot has advanced past it.
    pub(crate) pending: VecDeque<(TxId, Vec<Extent>)>,
}

/// An open storage environment: one page store, one journal, one tree
/// catalog. Clone-free; share it by reference (it is `Sync`).
pub struct Env {
    pub(crate) pager: Pager,
    pub(crate) wal: Mutex<Wal>,
    pub(crate) state: Mutex<EnvState>,
    pub(crate) readers: ReaderTable,
    pub(crate) write_slot: WriteSlot,
    pub(crate) options: Options,
    wedged: AtomicBool,
}

impl Env {
    /// Opens or creates a database at `path`. Recovery from the journal runs
    /// silently here; afterwards the environment is indistinguishable from
    /// one where the last completed commit was the final operation.
    pub fn open(path: impl AsRef<Path>, options: Options) -> Result<Env> {
        let path = path.as_ref();
        let io = StdFileIo::open(path)?;
        let wal_io = StdFileIo::open(wal_path(path))?;
        let env = Self::bootstrap(Box::new(io), Box::new(wal_io), options)?;
        info!(
            path = %path.display(),
            page_size = env.pager.page_size(),
            last_txid = env.state.lock().meta.last_txid.0,
            "environment opened"
        );
        Ok(env)
    }

    /// Creates a memory-only environment; contents vanish on drop.
    pub fn open_memory(options: Options) -> Result<Env> {
        Self::bootstrap(Box::new(MemIo::new()), Box::new(MemIo::new()), options)
    }

    fn bootstrap(io: Box<dyn FileIo>, wal_io: Box<dyn FileIo>, options: Options) -> Result<Env> {
        options.validate()?;
        let mut meta = if io.is_empty()? {
            create_meta(io.as_ref(), options.page_size)?
        } else {
            load_meta(io.as_ref(), options.page_size)?
        };
        if !meta.page_size.is_power_of_two()
            || !(MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&meta.page_size)
        {
            return Err(VellumError::Corruption("stored page size out of range"));
        }
        let pager = Pager::new(io, meta.page_size, meta.salt, options.cache_pages);
        let mut wal = Wal::open(wal_io, meta.page_size, options.sync)?;

        // Recovery: reapply journaled records not yet reflected in the page
        // store and adopt the newest journaled metadata. Reapplying an
        // already-applied record rewrites identical bytes, so a crash during
        // a previous recovery pass changes nothing.
        let summary = wal.replay(|id, image| pager.apply_page_image(id, image))?;
        if let Some(replayed) = summary.meta {
            if replayed.salt != meta.salt {
                return Err(VellumError::Corruption("journal belongs to another database"));
            }
            if replayed.last_txid >= meta.last_txid {
                meta = replayed;
            }
        }
        if summary.frames_applied > 0 {
            pager.sync()?;
            info!(
                transactions = summary.transactions,
                frames = summary.frames_applied,
                last_txid = meta.last_txid.0,
                "journal recovery applied"
            );
        }
        // Reset unconditionally: a torn or uncommitted tail must not linger,
        // or a reissued transaction number could adopt its orphaned frames.
        wal.reset()?;

        let (extents, _chain) = pager.load_free_list(meta.free_head)?;
        let free = FreeCache::from_extents(extents);
        Ok(Env {
            pager,
            wal: Mutex::new(wal),
            state: Mutex::new(EnvState {
                meta: Arc::new(meta),
                free,
                pending: VecDeque::new(),
            }),
            readers: ReaderTable::new(),
            write_slot: WriteSlot::new(),
            options,
            wedged: AtomicBool::new(false),
        })
    }

    /// Begins a read transaction against the current committed snapshot.
    /// Never blocks and never observes later commits.
    pub fn begin_read(&self) -> Result<ReadTxn<'_>> {
        self.check_usable()?;
        let state = self.state.lock();
        let meta = state.meta.clone();
        // Registration happens under the state lock: a snapshot must be
        // pinned before the writer can next compute the reclamation horizon.
        let reader = self.readers.register(meta.last_txid);
        drop(state);
        debug!(snapshot = meta.last_txid.0, "read transaction started");
        Ok(ReadTxn::new(self, meta, reader))
    }

    /// Begins the write transaction, blocking until the single write slot is
    /// free. Also the point where pages freed by old-enough transactions
    /// return to the allocation pool.
    pub fn begin_write(&self) -> Result<WriteTxn<'_>> {
        self.check_usable()?;
        let slot = self.write_slot.acquire();
        self.check_usable()?;
        let mut state = self.state.lock();
        let horizon = self.readers.oldest().unwrap_or(state.meta.last_txid);
        let mut reclaimed = Vec::new();
        while let Some((freed_tx, _)) = state.pending.front() {
            if *freed_tx > horizon {
                break;
            }
            let (_, extents) = state.pending.pop_front().expect("front exists");
            reclaimed.extend(extents);
        }
        if !reclaimed.is_empty() {
            state.free.extend(reclaimed);
        }
        let meta = (*state.meta).clone();
        let free = state.free.clone();
        drop(state);
        Ok(WriteTxn::new(self, slot, meta, free))
    }

    /// Forces applied pages durable and truncates the journal. Runs
    /// implicitly when the journal outgrows the configured threshold and on
    /// drop; exposed for callers that want a quiescent file.
    pub fn checkpoint(&self) -> Result<()> {
        self.check_usable()?;
        let mut wal = self.wal.lock();
        self.pager.sync()?;
        wal.reset()?;
        debug!("checkpoint complete");
        Ok(())
    }

    /// Number of open read snapshots.
    pub fn active_readers(&self) -> usize {
        self.readers.active()
    }

    /// The last committed transaction number.
    pub fn last_txid(&self) -> TxId {
        self.state.lock().meta.last_txid
    }

    /// Reads a committed page for a transaction. A page that fails
    /// validation disables the whole environment: no partial read is
    /// trusted and no repair is attempted.
    pub(crate) fn read_committed_page(&self, id: PageId) -> Result<Arc<[u8]>> {
        match self.pager.read_page(id) {
            Err(err @ VellumError::Corruption(_)) => {
                self.wedge();
                Err(err)
            }
            other => other,
        }
    }

    pub(crate) fn wedge(&self) {
        self.wedged.store(true, Ordering::SeqCst);
        warn!("environment disabled after unrecoverable damage; reopen to recover");
    }

    fn check_usable(&self) -> Result<()> {
        if self.wedged.load(Ordering::SeqCst) {
            return Err(VellumError::Corruption(
                "environment disabled by an earlier failure; reopen to recover",
            ));
        }
        Ok(())
    }
}

impl Drop for Env {
    fn drop(&mut self) {
        if !self.wedged.load(Ordering::SeqCst) {
            if let Err(err) = self.checkpoint() {
                warn!(error = %err, "checkpoint on close failed; journal left for recovery");
            }
        }
    }
}

fn wal_path(path: &Path) -> PathBuf {
    let mut os_string: OsString = path.as_os_str().to_owned();
    os_string.push(".wal");
    PathBuf::from(os_string)
}
