//! Ready-made undo environments for tests and benchmarks.

use std::sync::Arc;

use crate::primitives::fsp::MemFileSpace;
use crate::primitives::pager::BufferPool;
use crate::primitives::wal::RedoLog;
use crate::storage::metrics::CounterMetrics;
use crate::storage::options::UndoOptions;
use crate::storage::undo::{RollbackSegment, TrxUndoRequest, UndoEnv, UndoKind, UndoRef};
use crate::types::{Lsn, PageAddr, PageNo, Result, SpaceId, TrxId};

/// Tablespace every fixture places its rollback segment in.
pub const TEST_SPACE: SpaceId = SpaceId(1);
/// Page size fixtures use unless told otherwise.
pub const TEST_PAGE_SIZE: u32 = 4096;
/// Pages per extent of the fixture allocator.
pub const TEST_PAGES_PER_EXTENT: u32 = 4;
/// Default tablespace size in pages.
pub const TEST_SPACE_PAGES: u32 = 4096;

/// A pool, redo log, allocator, counters and one rollback segment.
pub struct Fixture {
    /// Environment shared by every operation.
    pub env: UndoEnv,
    /// Allocator, kept concrete for inspection.
    pub fsp: Arc<MemFileSpace>,
    /// Counters wired into `env`.
    pub metrics: Arc<CounterMetrics>,
    /// Rollback segment under test.
    pub rseg: RollbackSegment,
}

impl Fixture {
    /// Persistent rollback segment with 4 KiB pages.
    pub fn new() -> Result<Self> {
        Self::build(UndoOptions::new().page_size(TEST_PAGE_SIZE), TEST_SPACE_PAGES, true)
    }

    /// Rollback segment whose mutations produce no redo.
    pub fn temporary() -> Result<Self> {
        Self::build(UndoOptions::new().page_size(TEST_PAGE_SIZE), TEST_SPACE_PAGES, false)
    }

    /// Persistent rollback segment with custom options and tablespace size.
    pub fn with_options(options: UndoOptions, space_pages: u32) -> Result<Self> {
        Self::build(options, space_pages, true)
    }

    fn build(options: UndoOptions, space_pages: u32, persistent: bool) -> Result<Self> {
        let pool = Arc::new(BufferPool::new(options.page_size as usize));
        let redo = Arc::new(RedoLog::new(Lsn(0)));
        let fsp = Arc::new(MemFileSpace::new(TEST_PAGES_PER_EXTENT));
        fsp.add_space(TEST_SPACE, space_pages);
        let metrics = Arc::new(CounterMetrics::default());
        let env = UndoEnv::new(pool, redo, fsp.clone(), options)?.with_metrics(metrics.clone());
        let rseg = RollbackSegment::create(&env, 0, TEST_SPACE, persistent)?;
        Ok(Self {
            env,
            fsp,
            metrics,
            rseg,
        })
    }

    /// Page cache.
    pub fn pool(&self) -> &BufferPool {
        &self.env.pool
    }

    /// Redo log.
    pub fn redo(&self) -> &RedoLog {
        &self.env.redo
    }

    /// Assigns a plain undo log of `kind` to `trx_id`.
    pub fn assign(&self, kind: UndoKind, trx_id: TrxId) -> Result<UndoRef> {
        self.rseg
            .assign_undo(&self.env, kind, &TrxUndoRequest::new(trx_id))
    }

    /// Rebuilds the rollback segment from its pages, as at startup.
    pub fn reopen(&self) -> Result<RollbackSegment> {
        RollbackSegment::open(
            &self.env,
            self.rseg.id(),
            self.rseg.space(),
            self.rseg.header_page(),
            self.rseg.is_persistent(),
        )
    }

    /// Copy of a page in the fixture tablespace.
    pub fn page(&self, page_no: PageNo) -> Option<Vec<u8>> {
        self.env.pool.snapshot(PageAddr::new(TEST_SPACE, page_no))
    }
}
