//! Low-level primitives for building the storage engine.
//!
//! Positioned file I/O, the single-writer/reader-table concurrency gates,
//! the write-ahead journal and the paging subsystem.

/// Concurrency gates: the single-owner write slot and the reader table.
pub mod concurrency;

/// Positioned I/O over a file or an in-memory region.
pub mod io;

/// Paging subsystem: page store, environment metadata, free-space tracking.
pub mod pager;

/// Write-ahead journal for durable, crash-recoverable commits.
pub mod wal;
