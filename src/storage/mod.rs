//! Ordered storage structures built on the paging subsystem.

/// Copy-on-write B-tree over byte-string keys.
pub mod btree;
