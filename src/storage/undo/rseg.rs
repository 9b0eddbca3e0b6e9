//! Rollback segments: a slot table plus four in-memory handle lists.

use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;

use parking_lot::{lock_api::ArcMutexGuard, Mutex, MutexGuard, RawMutex};
use tracing::{debug, info};

use crate::primitives::mtr::Mtr;
use crate::primitives::pager::LatchMode;
use crate::types::{PageAddr, PageNo, Result, SpaceId, UndoError};

use super::flst::{self, ListBase};
use super::history::HistoryHead;
use super::layout::{
    self, fil, FsegAt, ListBaseAt, LogHeaderView, RsegHeaderView, SegHeaderView, UndoField,
    UndoPageView,
};
use super::log::{UndoKind, UndoLog, UndoRef, UndoState};
use super::navigator::{self, LogLocator};
use super::UndoEnv;

/// Bookkeeping guarded by the rollback segment mutex.
pub(crate) struct RsegInner {
    pub(crate) page_no: PageNo,
    pub(crate) insert_list: VecDeque<UndoLog>,
    pub(crate) insert_cached: VecDeque<UndoLog>,
    pub(crate) update_list: VecDeque<UndoLog>,
    pub(crate) update_cached: VecDeque<UndoLog>,
    pub(crate) curr_size: u32,
    pub(crate) max_size: u32,
    pub(crate) oldest: Option<HistoryHead>,
}

impl RsegInner {
    pub(crate) fn active(&mut self, kind: UndoKind) -> &mut VecDeque<UndoLog> {
        match kind {
            UndoKind::Insert => &mut self.insert_list,
            UndoKind::Update => &mut self.update_list,
        }
    }

    pub(crate) fn cached(&mut self, kind: UndoKind) -> &mut VecDeque<UndoLog> {
        match kind {
            UndoKind::Insert => &mut self.insert_cached,
            UndoKind::Update => &mut self.update_cached,
        }
    }

    pub(crate) fn position(&self, undo: UndoRef) -> Option<usize> {
        let list = match undo.kind {
            UndoKind::Insert => &self.insert_list,
            UndoKind::Update => &self.update_list,
        };
        list.iter().position(|log| log.id == undo.id)
    }

    pub(crate) fn active_log(&mut self, undo: UndoRef) -> Result<&mut UndoLog> {
        let pos = self
            .position(undo)
            .ok_or(UndoError::Invalid("undo log is not active in this rollback segment"))?;
        Ok(&mut self.active(undo.kind)[pos])
    }

    pub(crate) fn take_active(&mut self, undo: UndoRef) -> Result<UndoLog> {
        let pos = self
            .position(undo)
            .ok_or(UndoError::Invalid("undo log is not active in this rollback segment"))?;
        self.active(undo.kind)
            .remove(pos)
            .ok_or(UndoError::Invalid("undo log is not active in this rollback segment"))
    }

    fn all_logs(&self) -> impl Iterator<Item = &UndoLog> {
        self.insert_list
            .iter()
            .chain(self.insert_cached.iter())
            .chain(self.update_list.iter())
            .chain(self.update_cached.iter())
    }

    fn clear_lists(&mut self) {
        self.insert_list.clear();
        self.insert_cached.clear();
        self.update_list.clear();
        self.update_cached.clear();
    }
}

/// Counts and sizes of one rollback segment.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct RsegStats {
    /// Handles on the insert-active list.
    pub insert_active: usize,
    /// Handles on the insert-cached list.
    pub insert_cached: usize,
    /// Handles on the update-active list.
    pub update_active: usize,
    /// Handles on the update-cached list.
    pub update_cached: usize,
    /// Pages accounted to the rollback segment.
    pub curr_size: u32,
    /// Size cap in pages.
    pub max_size: u32,
}

/// A rollback segment: up to `N_SLOTS` undo segments and a history list.
pub struct RollbackSegment {
    id: u32,
    space: SpaceId,
    persistent: bool,
    inner: Mutex<RsegInner>,
}

impl RollbackSegment {
    /// Creates a rollback segment header in `space` and opens it.
    pub fn create(env: &UndoEnv, id: u32, space: SpaceId, persistent: bool) -> Result<Self> {
        let mut mtr = env.mtr();
        if !persistent {
            mtr.set_no_redo();
        }
        let page_no = Self::create_header(env, &mut mtr, space, env.options.rseg_max_size)?;
        mtr.commit();
        info!(rseg = id, space = space.0, page = page_no.0, "rseg.created");
        Self::open(env, id, space, page_no, persistent)
    }

    /// Writes a fresh rollback segment header page and returns its number.
    pub(crate) fn create_header(
        env: &UndoEnv,
        mtr: &mut Mtr<'_>,
        space: SpaceId,
        max_size: u32,
    ) -> Result<PageNo> {
        let (fseg, page_no) = env.fsp.create_segment(mtr, space)?;
        let addr = PageAddr::new(space, page_no);
        layout::write(mtr, addr, UndoField::FilPageType, fil::TYPE_SYS as u64);
        layout::write_fseg_header(mtr, addr, FsegAt::RollbackSegment, fseg);
        layout::write(mtr, addr, UndoField::RsegMaxSize, max_size as u64);
        layout::write(mtr, addr, UndoField::RsegHistorySize, 0);
        flst::init(mtr, ListBase::new(addr, ListBaseAt::RsegHistory));
        for slot in 0..env.options.n_slots() {
            layout::write(mtr, addr, UndoField::RsegSlot(slot), PageNo::NULL.0 as u64);
        }
        Ok(page_no)
    }

    /// Opens an existing rollback segment, rebuilding every handle from its slots.
    pub fn open(
        env: &UndoEnv,
        id: u32,
        space: SpaceId,
        page_no: PageNo,
        persistent: bool,
    ) -> Result<Self> {
        let rseg = Self {
            id,
            space,
            persistent,
            inner: Mutex::new(RsegInner {
                page_no,
                insert_list: VecDeque::new(),
                insert_cached: VecDeque::new(),
                update_list: VecDeque::new(),
                update_cached: VecDeque::new(),
                curr_size: 1,
                max_size: 0,
                oldest: None,
            }),
        };
        rseg.lists_init(env)?;
        Ok(rseg)
    }

    fn lists_init(&self, env: &UndoEnv) -> Result<()> {
        let mut inner = self.inner.lock();
        let mut mtr = env.mtr();
        let hdr = PageAddr::new(self.space, inner.page_no);
        mtr.latch(hdr, LatchMode::Shared)?;
        let (max_size, history_size, slots) = {
            let view = RsegHeaderView::new(mtr.page(hdr));
            let slots: Vec<(usize, PageNo)> = (0..env.options.n_slots())
                .map(|n| (n, view.slot(n)))
                .filter(|(_, page)| !page.is_null())
                .collect();
            (view.max_size(), view.history_size(), slots)
        };
        inner.max_size = max_size;
        let mut total = 0u32;
        let mut cached = 0i64;
        for (slot, page_no) in &slots {
            let undo = load_undo_log(&mut mtr, self.space, *slot, *page_no)?;
            total += undo.size;
            let kind = undo.kind;
            if undo.state == UndoState::Cached {
                cached += 1;
                inner.cached(kind).push_back(undo);
            } else {
                inner.active(kind).push_back(undo);
            }
        }
        inner.curr_size = 1 + history_size + total;
        inner.oldest = super::history::read_oldest(&mut mtr, self.space, inner.page_no)?;
        drop(mtr);
        env.metrics.slots_used(slots.len() as i64);
        env.metrics.slots_cached(cached);
        debug!(
            rseg = self.id,
            slots = slots.len(),
            curr_size = inner.curr_size,
            "rseg.lists_init"
        );
        Ok(())
    }

    /// Rollback segment id.
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Tablespace holding the rollback segment.
    pub fn space(&self) -> SpaceId {
        self.space
    }

    /// Whether mutations produce redo.
    pub fn is_persistent(&self) -> bool {
        self.persistent
    }

    /// Current header page.
    pub fn header_page(&self) -> PageNo {
        self.inner.lock().page_no
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, RsegInner> {
        self.inner.lock()
    }

    /// Locks one active log. The rollback segment mutex is only held to find
    /// the handle, not while waiting.
    pub(crate) fn lock_log(&self, undo: UndoRef) -> Result<ArcMutexGuard<RawMutex, ()>> {
        let op_lock = {
            let mut inner = self.lock();
            Arc::clone(&inner.active_log(undo)?.op_lock)
        };
        Ok(op_lock.lock_arc())
    }

    pub(crate) fn mtr<'e>(&self, env: &'e UndoEnv) -> Mtr<'e> {
        let mut mtr = env.mtr();
        if !self.persistent {
            mtr.set_no_redo();
        }
        mtr
    }

    /// List lengths and size counters.
    pub fn stats(&self) -> RsegStats {
        let inner = self.inner.lock();
        RsegStats {
            insert_active: inner.insert_list.len(),
            insert_cached: inner.insert_cached.len(),
            update_active: inner.update_list.len(),
            update_cached: inner.update_cached.len(),
            curr_size: inner.curr_size,
            max_size: inner.max_size,
        }
    }

    /// Copy of an active handle.
    pub fn undo_log(&self, undo: UndoRef) -> Option<UndoLog> {
        let inner = self.inner.lock();
        inner.position(undo).map(|pos| match undo.kind {
            UndoKind::Insert => inner.insert_list[pos].clone(),
            UndoKind::Update => inner.update_list[pos].clone(),
        })
    }

    /// Copies of every handle on all four lists.
    pub fn undo_logs(&self) -> Vec<UndoLog> {
        self.inner.lock().all_logs().cloned().collect()
    }

    /// Header page of the segment in slot `n`.
    pub fn slot(&self, env: &UndoEnv, n: usize) -> Result<PageNo> {
        let inner = self.inner.lock();
        let mut mtr = env.mtr();
        let hdr = PageAddr::new(self.space, inner.page_no);
        mtr.latch(hdr, LatchMode::Shared)?;
        Ok(RsegHeaderView::new(mtr.page(hdr)).slot(n))
    }

    /// Verifies slot uniqueness, cached sizes, slot-to-handle mapping and
    /// the size accounting identity.
    pub fn check_invariants(&self, env: &UndoEnv) -> Result<()> {
        let inner = self.inner.lock();
        let mut mtr = env.mtr();
        let hdr = PageAddr::new(self.space, inner.page_no);
        mtr.latch(hdr, LatchMode::Shared)?;
        let view = RsegHeaderView::new(mtr.page(hdr));

        let mut ids = HashSet::new();
        let mut total = 0u32;
        for undo in inner.all_logs() {
            if !ids.insert(undo.id) {
                return Err(UndoError::Corruption("undo slot id used twice"));
            }
            if view.slot(undo.id) != undo.hdr_page_no {
                return Err(UndoError::Corruption("undo slot does not match handle"));
            }
            total += undo.size;
        }
        if inner.insert_cached.iter().chain(&inner.update_cached).any(|u| u.size != 1) {
            return Err(UndoError::Corruption("cached undo segment larger than one page"));
        }
        let occupied = (0..env.options.n_slots()).filter(|n| !view.slot(*n).is_null()).count();
        if occupied != ids.len() {
            return Err(UndoError::Corruption("occupied slot without a handle"));
        }
        if inner.curr_size != 1 + view.history_size() + total {
            return Err(UndoError::Corruption("rollback segment size accounting drift"));
        }
        Ok(())
    }

    /// Sets the free flag or the header page of slot `n`.
    pub(crate) fn write_slot(
        &self,
        mtr: &mut Mtr<'_>,
        inner: &RsegInner,
        n: usize,
        page_no: PageNo,
    ) -> Result<()> {
        let hdr = PageAddr::new(self.space, inner.page_no);
        mtr.latch(hdr, LatchMode::Exclusive)?;
        layout::write(mtr, hdr, UndoField::RsegSlot(n), page_no.0 as u64);
        Ok(())
    }

    /// First free slot, if any.
    pub(crate) fn find_free_slot(
        &self,
        env: &UndoEnv,
        mtr: &mut Mtr<'_>,
        inner: &RsegInner,
    ) -> Result<Option<usize>> {
        let hdr = PageAddr::new(self.space, inner.page_no);
        mtr.latch(hdr, LatchMode::Exclusive)?;
        let view = RsegHeaderView::new(mtr.page(hdr));
        Ok((0..env.options.n_slots()).find(|n| view.slot(*n).is_null()))
    }

    /// Resets all in-memory state after the tablespace was rebuilt.
    pub(crate) fn reset_after_truncate(
        &self,
        env: &UndoEnv,
        inner: &mut RsegInner,
        page_no: PageNo,
        max_size: u32,
        history_size: u32,
    ) {
        assert!(
            inner.insert_list.is_empty() && inner.update_list.is_empty(),
            "tablespace truncated under active undo logs"
        );
        let cached = (inner.insert_cached.len() + inner.update_cached.len()) as i64;
        env.metrics.slots_cached(-cached);
        env.metrics.slots_used(-cached);
        inner.clear_lists();
        inner.page_no = page_no;
        inner.max_size = max_size;
        inner.curr_size = history_size + 1;
        inner.oldest = None;
    }
}

/// Rebuilds a handle from the segment whose first page is `page_no`.
fn load_undo_log(mtr: &mut Mtr<'_>, space: SpaceId, id: usize, page_no: PageNo) -> Result<UndoLog> {
    let addr = PageAddr::new(space, page_no);
    mtr.latch(addr, LatchMode::Shared)?;
    let page = mtr.page(addr);
    let page_view = UndoPageView::new(page);
    let seg = SegHeaderView::new(page);
    let offset = seg.last_log();
    if offset == 0 {
        page_view.validate_bounds()?;
    } else {
        page_view.validate()?;
    }
    let kind = page_view.kind()?;
    let state = seg.state()?;
    if offset == 0 {
        // Only a cached segment whose sole log was discarded has no header.
        if state != UndoState::Cached {
            return Err(UndoError::Corruption("undo segment without a log header"));
        }
        let mut undo = UndoLog::new(id, kind, 0, None, space, page_no, 0);
        undo.state = state;
        undo.size = seg.page_list_len();
        return Ok(undo);
    }
    let log = LogHeaderView::new(page, offset);
    let xid = if log.xid_exists() {
        Some(log.xid()?)
    } else {
        None
    };
    let mut undo = UndoLog::new(id, kind, log.trx_id(), xid, space, page_no, offset);
    undo.state = state;
    undo.dict_operation = log.dict_trans();
    undo.table_id = log.table_id();
    undo.size = seg.page_list_len();
    let last = seg.page_list_last().page_no;

    if state != UndoState::ToFree {
        undo.last_page_no = last;
        undo.top_page_no = last;
        let last_addr = PageAddr::new(space, last);
        mtr.latch(last_addr, LatchMode::Shared)?;
        let locator = LogLocator::new(space, page_no, offset);
        match navigator::page_last_rec(mtr.page(last_addr), last, locator) {
            Some(rec) => {
                undo.empty = false;
                undo.top_offset = rec;
                undo.top_undo_no = navigator::record_undo_no(mtr.page(last_addr), rec)?;
            }
            None => undo.empty = true,
        }
    }
    Ok(undo)
}

impl fmt::Debug for RollbackSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RollbackSegment")
            .field("id", &self.id)
            .field("space", &self.space)
            .field("persistent", &self.persistent)
            .field("stats", &self.stats())
            .finish()
    }
}
