//! Low-level primitives the undo layer is built on.
//!
//! Includes byte codecs, the page cache, the redo log, mini-transactions
//! and file-space allocation.

/// Byte-level utilities and encoding/decoding.
///
/// Fixed-width big-endian fields, varints and a parsing cursor.
pub mod bytes;

/// File-space management.
///
/// Extent reservations, file segments and page allocation.
pub mod fsp;

/// Mini-transactions.
///
/// Scoped groups of page latches and logged mutations that commit atomically.
pub mod mtr;

/// Page cache.
///
/// Resident page images behind per-page reader/writer latches.
pub mod pager;

/// Redo logging for crash recovery.
///
/// Typed page records grouped and checksummed per mini-transaction.
pub mod wal;
