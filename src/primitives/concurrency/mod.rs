//! Concurrency gates for the single-writer, multi-reader transaction model.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};

use crate::types::TxId;

/// The single-owner permit required to hold an open write transaction.
///
/// There is exactly one slot per environment; acquiring it blocks until the
/// current holder commits or rolls back. With only one lock in the system
/// there is nothing to deadlock against.
#[derive(Default)]
pub struct WriteSlot {
    gate: Mutex<()>,
}

/// Guard representing ownership of the write slot.
pub struct WriteSlotGuard<'a> {
    _guard: MutexGuard<'a, ()>,
}

impl WriteSlot {
    /// Creates an unheld write slot.
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquires the slot, blocking until it is free.
    pub fn acquire(&self) -> WriteSlotGuard<'_> {
        WriteSlotGuard {
            _guard: self.gate.lock(),
        }
    }

    /// Attempts to acquire the slot without blocking.
    pub fn try_acquire(&self) -> Option<WriteSlotGuard<'_>> {
        self.gate
            .try_lock()
            .map(|guard| WriteSlotGuard { _guard: guard })
    }
}

/// Registry of open read snapshots, keyed by the transaction number each
/// snapshot was taken at.
///
/// Page reclamation is gated on this table: a page freed by transaction N
/// may be reused only once every registered snapshot is at N or later.
#[derive(Default, Clone)]
pub struct ReaderTable {
    inner: Arc<Mutex<BTreeMap<TxId, usize>>>,
}

/// Registration of one open read snapshot; released on drop.
pub struct ReaderGuard {
    table: Arc<Mutex<BTreeMap<TxId, usize>>>,
    txid: TxId,
}

impl ReaderTable {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a snapshot taken at `txid`.
    pub fn register(&self, txid: TxId) -> ReaderGuard {
        let mut table = self.inner.lock();
        *table.entry(txid).or_insert(0) += 1;
        ReaderGuard {
            table: self.inner.clone(),
            txid,
        }
    }

    /// Returns the oldest registered snapshot, or `None` when no readers
    /// are open.
    pub fn oldest(&self) -> Option<TxId> {
        self.inner.lock().keys().next().copied()
    }

    /// Number of currently open snapshots.
    pub fn active(&self) -> usize {
        self.inner.lock().values().sum()
    }
}

impl ReaderGuard {
    /// The snapshot this registration pins.
    pub fn txid(&self) -> TxId {
        self.txid
    }
}

impl Drop for ReaderGuard {
    fn drop(&mut self) {
        let mut table = self.table.lock();
        if let Some(count) = table.get_mut(&self.txid) {
            *count -= 1;
            if *count == 0 {
                table.remove(&self.txid);
            }
        }
    }
}
