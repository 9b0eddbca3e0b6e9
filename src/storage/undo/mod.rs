//! Undo segments, rollback segments and history lists.
//!
//! Every durable change goes through an [`Mtr`]; bookkeeping for a rollback
//! segment sits behind its mutex, which is always taken before any page
//! latch. Appending records and preparing a log take only that log's own
//! lock while they wait on page latches. Lock order: log lock, rollback
//! segment mutex, page latches.

use std::fmt;
use std::sync::Arc;

use crate::primitives::fsp::FileSpace;
use crate::primitives::mtr::Mtr;
use crate::primitives::pager::BufferPool;
use crate::primitives::wal::RedoLog;
use crate::storage::metrics::{self, UndoMetrics};
use crate::storage::options::UndoOptions;
use crate::types::{Result, UndoError};

pub mod flst;
pub mod history;
pub mod layout;
pub mod lifecycle;
pub mod log;
pub mod navigator;
pub mod page;
pub mod record;
pub mod recovery;
pub mod rseg;
pub mod tablespace;
pub mod truncate;

pub use history::{HistoryEntry, HistoryHead, PurgeLimit};
pub use lifecycle::TrxUndoRequest;
pub use log::{DictOp, UndoKind, UndoLog, UndoRef, UndoState, Xid};
pub use navigator::{LogLocator, RecPos, RecordNavigator};
pub use page::RecordType;
pub use recovery::{replay, ReplayStats};
pub use rseg::{RollbackSegment, RsegStats};
pub use tablespace::TablespaceTruncator;

/// Shared services every undo operation runs against.
#[derive(Clone)]
pub struct UndoEnv {
    /// Page cache.
    pub pool: Arc<BufferPool>,
    /// Redo log committed mini-transactions append to.
    pub redo: Arc<RedoLog>,
    /// Page allocator.
    pub fsp: Arc<dyn FileSpace>,
    /// Tunables.
    pub options: UndoOptions,
    /// Observability hooks.
    pub metrics: Arc<dyn UndoMetrics>,
}

impl UndoEnv {
    /// Builds an environment after validating `options` against the pool.
    pub fn new(
        pool: Arc<BufferPool>,
        redo: Arc<RedoLog>,
        fsp: Arc<dyn FileSpace>,
        options: UndoOptions,
    ) -> Result<Self> {
        options.validate()?;
        if pool.page_size() != options.page_size as usize {
            return Err(UndoError::Invalid("buffer pool page size differs from options"));
        }
        Ok(Self {
            pool,
            redo,
            fsp,
            options,
            metrics: metrics::noop(),
        })
    }

    /// Replaces the metrics sink.
    pub fn with_metrics(mut self, metrics: Arc<dyn UndoMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Starts a logged mini-transaction.
    pub fn mtr(&self) -> Mtr<'_> {
        Mtr::start(&self.pool, &self.redo)
    }
}

impl fmt::Debug for UndoEnv {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UndoEnv")
            .field("pool", &self.pool)
            .field("redo", &self.redo)
            .field("options", &self.options)
            .finish()
    }
}
