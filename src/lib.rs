//! Embedded transactional key-value storage engine.
//!
//! Vellum stores ordered byte-string trees in fixed-size copy-on-write pages.
//! A single writer and any number of readers run concurrently: readers pin an
//! immutable snapshot and never block, the writer publishes each commit
//! atomically after journaling it to a write-ahead log. Every tree entry
//! carries a 16-bit version stamp that callers can use for optimistic
//! concurrency control.

#![warn(missing_docs)]
#![forbid(unsafe_code)]

pub mod db;
pub mod primitives;
pub mod storage;
pub mod types;

pub use db::{Env, Options, ReadTxn, Tree, TxState, WriteTxn};
pub use types::{PageId, Result, TxId, VellumError};
