//! Undo-log segment management for a page-based transactional storage engine.
//!
//! Undo logs live in file segments owned by rollback segments. Each rollback
//! segment keeps a slot table, per-kind active and cached handle lists and a
//! durable history list of committed update logs waiting for purge. All page
//! changes go through mini-transactions that produce redo.

#![warn(missing_docs)]

pub mod logging;
pub mod primitives;
pub mod storage;
pub mod testkit;
pub mod types;

pub use storage::metrics::{CounterMetrics, NoopMetrics, UndoMetrics};
pub use storage::options::UndoOptions;
pub use storage::undo::{
    DictOp, PurgeLimit, RecordType, RollbackSegment, TrxUndoRequest, UndoEnv, UndoKind, UndoLog,
    UndoRef, UndoState, Xid,
};
pub use types::{Result, UndoError};
