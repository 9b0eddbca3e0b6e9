//! Assigning undo logs to transactions and retiring them at commit.

use tracing::{debug, warn};

use crate::primitives::fsp::{ExtentReservation, FsegRef};
use crate::primitives::mtr::Mtr;
use crate::primitives::pager::LatchMode;
use crate::types::{PageAddr, PageNo, Result, TrxId, TrxNo, UndoError};

use super::flst::{self, ListBase, ListNode};
use super::history::HistoryHead;
use super::layout::{
    self, FsegAt, ListBaseAt, ListNodeAt, SegHeaderView, UndoField, UndoPageView,
    HEADER_REGION_END,
};
use super::log::{DictOp, UndoKind, UndoLog, UndoRef, UndoState, Xid};
use super::page;
use super::rseg::{RollbackSegment, RsegInner};
use super::UndoEnv;

/// What a transaction asks for when it needs an undo log.
#[derive(Clone, Debug, Default)]
pub struct TrxUndoRequest {
    /// Transaction id written into the log header.
    pub trx_id: TrxId,
    /// XID carried by the transaction, if any.
    pub xid: Option<Xid>,
    /// Dictionary operation the transaction performs.
    pub dict_op: DictOp,
}

impl TrxUndoRequest {
    /// Request for an ordinary transaction.
    pub fn new(trx_id: TrxId) -> Self {
        Self {
            trx_id,
            ..Self::default()
        }
    }

    /// Attaches an XID.
    pub fn with_xid(mut self, xid: Xid) -> Self {
        self.xid = Some(xid);
        self
    }

    /// Marks the transaction as a dictionary operation.
    pub fn with_dict_op(mut self, dict_op: DictOp) -> Self {
        self.dict_op = dict_op;
        self
    }
}

impl RollbackSegment {
    /// Gives a transaction an undo log of `kind`, reusing a cached segment
    /// when one is available and creating a new segment otherwise.
    ///
    /// # Errors
    /// - [`UndoError::TooManyConcurrentTransactions`] when every slot is taken
    /// - [`UndoError::OutOfFileSpace`] when the size cap or the tablespace is exhausted
    /// - [`UndoError::OutOfMemory`] when the handle cannot be allocated
    pub fn assign_undo(
        &self,
        env: &UndoEnv,
        kind: UndoKind,
        req: &TrxUndoRequest,
    ) -> Result<UndoRef> {
        let mut inner = self.lock();
        inner
            .active(kind)
            .try_reserve(1)
            .map_err(|_| UndoError::OutOfMemory)?;

        let mut mtr = self.mtr(env);
        let mut undo = match self.reuse_cached(env, &mut mtr, &mut inner, kind, req)? {
            Some(undo) => undo,
            None => self.create_undo(env, &mut mtr, &mut inner, kind, req)?,
        };

        if self.is_persistent() {
            if let Some(table_id) = req.dict_op.table_id() {
                let addr = PageAddr::new(self.space(), undo.hdr_page_no);
                page::mark_dict_operation(&mut mtr, addr, undo.hdr_offset, table_id);
                undo.dict_operation = true;
                undo.table_id = table_id;
            }
        }
        mtr.commit();

        let undo_ref = undo.undo_ref();
        inner.active(kind).push_front(undo);
        Ok(undo_ref)
    }

    fn reuse_cached(
        &self,
        env: &UndoEnv,
        mtr: &mut Mtr<'_>,
        inner: &mut RsegInner,
        kind: UndoKind,
        req: &TrxUndoRequest,
    ) -> Result<Option<UndoLog>> {
        let Some(mut undo) = inner.cached(kind).pop_front() else {
            return Ok(None);
        };
        assert_eq!(undo.size, 1, "cached undo segment {} spans pages", undo.id);
        let addr = PageAddr::new(self.space(), undo.hdr_page_no);
        let offset = match write_reused_header(mtr, addr, kind, req.trx_id) {
            Ok(offset) => offset,
            Err(err) => {
                inner.cached(kind).push_front(undo);
                return Err(err);
            }
        };
        undo.init_for_reuse(req.trx_id, req.xid.clone(), offset);
        env.metrics.slots_cached(-1);
        debug!(
            rseg = self.id(),
            slot = undo.id,
            ?kind,
            trx_id = req.trx_id,
            offset,
            "undo.reuse"
        );
        Ok(Some(undo))
    }

    fn create_undo(
        &self,
        env: &UndoEnv,
        mtr: &mut Mtr<'_>,
        inner: &mut RsegInner,
        kind: UndoKind,
        req: &TrxUndoRequest,
    ) -> Result<UndoLog> {
        if inner.curr_size == inner.max_size {
            return Err(UndoError::OutOfFileSpace);
        }
        inner.curr_size += 1;
        let created = self.create_segment(env, mtr, inner, kind, req);
        if created.is_err() {
            inner.curr_size -= 1;
        }
        created
    }

    fn create_segment(
        &self,
        env: &UndoEnv,
        mtr: &mut Mtr<'_>,
        inner: &RsegInner,
        kind: UndoKind,
        req: &TrxUndoRequest,
    ) -> Result<UndoLog> {
        let Some(id) = self.find_free_slot(env, mtr, inner)? else {
            warn!(rseg = self.id(), slots = env.options.n_slots(), "undo.slots_exhausted");
            return Err(UndoError::TooManyConcurrentTransactions);
        };
        let _reservation = ExtentReservation::acquire(
            env.fsp.as_ref(),
            self.space(),
            env.options.segment_create_extents,
        )?;
        let (fseg, page_no) = env.fsp.create_segment(mtr, self.space())?;
        let offset = match self.format_segment(mtr, inner, kind, id, (fseg, page_no), req.trx_id) {
            Ok(offset) => offset,
            Err(err) => {
                // The pages roll back with the mtr; the allocator does not.
                while !env.fsp.free_segment_step(mtr, fseg, false)? {}
                return Err(err);
            }
        };

        env.metrics.slots_used(1);
        env.metrics.page_allocated();
        debug!(
            rseg = self.id(),
            slot = id,
            ?kind,
            page = page_no.0,
            trx_id = req.trx_id,
            "undo.create"
        );
        Ok(UndoLog::new(
            id,
            kind,
            req.trx_id,
            req.xid.clone(),
            self.space(),
            page_no,
            offset,
        ))
    }

    /// Lays out the first page of a new segment, claims slot `id` and writes
    /// the first log header. Returns the header offset.
    fn format_segment(
        &self,
        mtr: &mut Mtr<'_>,
        inner: &RsegInner,
        kind: UndoKind,
        id: usize,
        (fseg, page_no): (FsegRef, PageNo),
        trx_id: TrxId,
    ) -> Result<u16> {
        let addr = PageAddr::new(self.space(), page_no);
        page::page_init(mtr, addr, kind);
        layout::write(mtr, addr, UndoField::PageFree, HEADER_REGION_END as u64);
        layout::write(mtr, addr, UndoField::SegLastLog, 0);
        layout::write_fseg_header(mtr, addr, FsegAt::UndoSegment, fseg);
        let pages = ListBase::new(addr, ListBaseAt::SegPageList);
        flst::init(mtr, pages);
        flst::add_last(mtr, pages, ListNode::new(addr, ListNodeAt::UndoPage))?;
        self.write_slot(mtr, inner, id, page_no)?;

        let offset = page::header_create(mtr, addr, trx_id)?;
        page::add_space_for_xid(mtr, addr, offset)?;
        Ok(offset)
    }

    /// Grows an active log's segment by one page and returns it.
    pub fn add_page(&self, env: &UndoEnv, undo: UndoRef) -> Result<PageNo> {
        let _log = self.lock_log(undo)?;
        let mut inner = self.lock();
        self.add_page_locked(env, &mut inner, undo)
    }

    pub(crate) fn add_page_locked(
        &self,
        env: &UndoEnv,
        inner: &mut RsegInner,
        undo: UndoRef,
    ) -> Result<PageNo> {
        if inner.curr_size == inner.max_size {
            return Err(UndoError::OutOfFileSpace);
        }
        let (hdr_page_no, last_page_no, kind) = {
            let log = inner.active_log(undo)?;
            (log.hdr_page_no, log.last_page_no, log.kind)
        };
        let _reservation = ExtentReservation::acquire(
            env.fsp.as_ref(),
            self.space(),
            env.options.page_add_extents,
        )?;

        let mut mtr = self.mtr(env);
        let hdr = PageAddr::new(self.space(), hdr_page_no);
        mtr.latch(hdr, LatchMode::Exclusive)?;
        let fseg = SegHeaderView::new(mtr.page(hdr)).fseg();
        let new_page = env.fsp.alloc_page(&mut mtr, fseg, last_page_no.next())?;
        let addr = PageAddr::new(self.space(), new_page);
        page::page_init(&mut mtr, addr, kind);
        let linked = flst::add_last(
            &mut mtr,
            ListBase::new(hdr, ListBaseAt::SegPageList),
            ListNode::new(addr, ListNodeAt::UndoPage),
        );
        if let Err(err) = linked {
            env.fsp.free_page(&mut mtr, fseg, new_page)?;
            return Err(err);
        }
        mtr.commit();

        let log = inner.active_log(undo)?;
        log.size += 1;
        log.last_page_no = new_page;
        inner.curr_size += 1;
        env.metrics.page_allocated();
        debug!(rseg = self.id(), slot = undo.id, page = new_page.0, "undo.add_page");
        Ok(new_page)
    }

    /// Decides the state a log ends in when its transaction commits and
    /// writes it to the segment header.
    pub fn set_state_at_finish(&self, env: &UndoEnv, undo: UndoRef) -> Result<UndoState> {
        let _log = self.lock_log(undo)?;
        let mut inner = self.lock();
        let mut mtr = self.mtr(env);
        let state = self.finish_locked(env, &mut mtr, &mut inner, undo)?;
        mtr.commit();
        Ok(state)
    }

    fn finish_locked(
        &self,
        env: &UndoEnv,
        mtr: &mut Mtr<'_>,
        inner: &mut RsegInner,
        undo: UndoRef,
    ) -> Result<UndoState> {
        let log = inner.active_log(undo)?;
        let addr = PageAddr::new(self.space(), log.hdr_page_no);
        mtr.latch(addr, LatchMode::Exclusive)?;
        let free = UndoPageView::new(mtr.page(addr)).free() as usize;
        let state = if log.size == 1 && free < env.options.effective_reuse_limit() {
            UndoState::Cached
        } else if log.kind == UndoKind::Insert || !self.is_persistent() {
            UndoState::ToFree
        } else {
            UndoState::ToPurge
        };
        log.transition(state);
        layout::write(mtr, addr, UndoField::SegState, state as u64);
        Ok(state)
    }

    /// Moves an active log to `Prepared` and records its XID.
    pub fn prepare(&self, env: &UndoEnv, undo: UndoRef, xid: Xid) -> Result<()> {
        let _log = self.lock_log(undo)?;
        let (hdr_page_no, hdr_offset) = self.checked_header(undo, UndoState::Prepared)?;
        let mut mtr = self.mtr(env);
        let addr = PageAddr::new(self.space(), hdr_page_no);
        mtr.latch(addr, LatchMode::Exclusive)?;
        page::write_xid(&mut mtr, addr, hdr_offset, &xid);
        layout::write(&mut mtr, addr, UndoField::SegState, UndoState::Prepared as u64);
        mtr.commit();

        let mut inner = self.lock();
        let log = inner.active_log(undo)?;
        log.transition(UndoState::Prepared);
        log.xid = Some(xid);
        Ok(())
    }

    /// Returns a prepared log to `Active`, as when an XA rollback begins.
    pub fn unprepare(&self, env: &UndoEnv, undo: UndoRef) -> Result<()> {
        let _log = self.lock_log(undo)?;
        let (hdr_page_no, _) = self.checked_header(undo, UndoState::Active)?;
        let mut mtr = self.mtr(env);
        let addr = PageAddr::new(self.space(), hdr_page_no);
        mtr.latch(addr, LatchMode::Exclusive)?;
        layout::write(&mut mtr, addr, UndoField::SegState, UndoState::Active as u64);
        mtr.commit();

        self.lock().active_log(undo)?.transition(UndoState::Active);
        Ok(())
    }

    /// Header position of an active log about to move to `to`.
    ///
    /// # Panics
    /// Panics when the lifecycle forbids the move.
    fn checked_header(&self, undo: UndoRef, to: UndoState) -> Result<(PageNo, u16)> {
        let mut inner = self.lock();
        let log = inner.active_log(undo)?;
        assert!(
            log.state.can_transition(to),
            "illegal undo state transition {:?} -> {:?} for slot {}",
            log.state,
            to,
            log.id
        );
        Ok((log.hdr_page_no, log.hdr_offset))
    }

    /// Retires a finished log that never enters the history list: insert
    /// logs, and every log of a temporary rollback segment.
    pub fn commit_cleanup(&self, env: &UndoEnv, undo: UndoRef) -> Result<()> {
        if undo.kind == UndoKind::Update && self.is_persistent() {
            return Err(UndoError::Invalid("persistent update logs retire through history"));
        }
        let _log = self.lock_log(undo)?;
        let mut inner = self.lock();
        let state = inner.active_log(undo)?.state;
        match state {
            UndoState::Cached => {
                let log = inner.take_active(undo)?;
                inner.cached(undo.kind).push_front(log);
                env.metrics.slots_cached(1);
            }
            UndoState::ToFree => {
                let log = inner.active_log(undo)?.clone();
                self.seg_free(env, &inner, &log)?;
                inner.take_active(undo)?;
                inner.curr_size -= log.size;
                env.metrics.slots_used(-1);
                for _ in 0..log.size {
                    env.metrics.page_freed();
                }
            }
            other => panic!("commit cleanup of undo slot {} in state {other:?}", undo.id),
        }
        debug!(rseg = self.id(), slot = undo.id, ?state, "undo.commit_cleanup");
        Ok(())
    }

    /// Links a finished update log into the history list, then caches the
    /// segment or releases its slot.
    pub fn update_cleanup(&self, env: &UndoEnv, undo: UndoRef, trx_no: TrxNo) -> Result<()> {
        self.ensure_history_bound(undo)?;
        let _log = self.lock_log(undo)?;
        let mut inner = self.lock();
        let mut mtr = self.mtr(env);
        let (state, head) = self.history_step(&mut mtr, &mut inner, undo, trx_no)?;
        mtr.commit();
        self.detach_after_history(env, &mut inner, undo, state, head)
    }

    /// Finishes an update log and links it into history in one mini-transaction.
    pub fn commit_update(&self, env: &UndoEnv, undo: UndoRef, trx_no: TrxNo) -> Result<UndoState> {
        self.ensure_history_bound(undo)?;
        let _log = self.lock_log(undo)?;
        let mut inner = self.lock();
        let before = inner.active_log(undo)?.state;
        let mut mtr = self.mtr(env);
        let stepped = self
            .finish_locked(env, &mut mtr, &mut inner, undo)
            .and_then(|_| self.history_step(&mut mtr, &mut inner, undo, trx_no));
        match stepped {
            Ok((state, head)) => {
                mtr.commit();
                self.detach_after_history(env, &mut inner, undo, state, head)?;
                Ok(state)
            }
            Err(err) => {
                drop(mtr);
                // The page images were restored; bring the handle back in line.
                inner.active_log(undo)?.state = before;
                Err(err)
            }
        }
    }

    fn ensure_history_bound(&self, undo: UndoRef) -> Result<()> {
        if undo.kind != UndoKind::Update || !self.is_persistent() {
            return Err(UndoError::Invalid("only persistent update logs enter history"));
        }
        Ok(())
    }

    fn history_step(
        &self,
        mtr: &mut Mtr<'_>,
        inner: &mut RsegInner,
        undo: UndoRef,
        trx_no: TrxNo,
    ) -> Result<(UndoState, HistoryHead)> {
        let log = inner.active_log(undo)?.clone();
        assert!(
            matches!(log.state, UndoState::Cached | UndoState::ToPurge),
            "update cleanup of undo slot {} in state {:?}",
            log.id,
            log.state
        );
        let head = self.append_to_history(mtr, inner, &log, trx_no)?;
        if log.state == UndoState::ToPurge {
            self.write_slot(mtr, inner, log.id, PageNo::NULL)?;
        }
        Ok((log.state, head))
    }

    fn detach_after_history(
        &self,
        env: &UndoEnv,
        inner: &mut RsegInner,
        undo: UndoRef,
        state: UndoState,
        head: HistoryHead,
    ) -> Result<()> {
        self.publish_history_head(env, inner, head);
        let log = inner.take_active(undo)?;
        if state == UndoState::Cached {
            inner.cached(undo.kind).push_front(log);
            env.metrics.slots_cached(1);
        } else {
            env.metrics.slots_used(-1);
        }
        debug!(rseg = self.id(), slot = undo.id, ?state, "undo.update_cleanup");
        Ok(())
    }

    /// Undoes the latest log header of a one-page update segment and caches
    /// the segment.
    ///
    /// # Panics
    /// Panics when the segment spans more than one page.
    pub fn discard_latest_update_undo(&self, env: &UndoEnv, undo: UndoRef) -> Result<()> {
        let _log = self.lock_log(undo)?;
        let mut inner = self.lock();
        let log = inner.active_log(undo)?;
        assert!(
            log.kind == UndoKind::Update && log.size == 1,
            "discard of undo slot {} needs a one-page update segment",
            log.id
        );
        let addr = PageAddr::new(self.space(), log.hdr_page_no);
        let mut mtr = self.mtr(env);
        mtr.latch(addr, LatchMode::Exclusive)?;
        page::discard_latest(&mut mtr, addr)?;
        let last_log = SegHeaderView::new(mtr.page(addr)).last_log();
        mtr.commit();

        log.transition(UndoState::Cached);
        log.hdr_offset = last_log;
        log.empty = true;
        log.top_offset = 0;
        log.top_undo_no = 0;
        let log = inner.take_active(undo)?;
        inner.update_cached.push_front(log);
        env.metrics.slots_cached(1);
        debug!(rseg = self.id(), slot = undo.id, "undo.discard_latest");
        Ok(())
    }

    /// Drops the handles of prepared and still-active logs without touching
    /// their pages, as at shutdown. Returns how many were dropped.
    pub fn free_prepared(&self) -> usize {
        let mut inner = self.lock();
        let mut dropped = 0;
        for kind in [UndoKind::Insert, UndoKind::Update] {
            let list = inner.active(kind);
            let before = list.len();
            list.retain(|log| !matches!(log.state, UndoState::Prepared | UndoState::Active));
            dropped += before - list.len();
        }
        debug!(rseg = self.id(), dropped, "undo.free_prepared");
        dropped
    }

    /// Frees a whole segment outside the history list, one step per
    /// mini-transaction, clearing its slot in the last step.
    fn seg_free(&self, env: &UndoEnv, inner: &RsegInner, log: &UndoLog) -> Result<()> {
        let hdr = PageAddr::new(self.space(), log.hdr_page_no);
        loop {
            let mut mtr = self.mtr(env);
            mtr.latch(PageAddr::new(self.space(), inner.page_no), LatchMode::Exclusive)?;
            mtr.latch(hdr, LatchMode::Exclusive)?;
            let fseg = SegHeaderView::new(mtr.page(hdr)).fseg();
            let header_only = env.fsp.segment_pages(fseg) == Some(1);
            if header_only {
                self.write_slot(&mut mtr, inner, log.id, PageNo::NULL)?;
            }
            let finished = env.fsp.free_segment_step(&mut mtr, fseg, false)?;
            debug_assert_eq!(finished, header_only, "segment freed out of step");
            mtr.commit();
            if finished {
                return Ok(());
            }
        }
    }
}

/// Writes a fresh log header on a cached segment's only page.
fn write_reused_header(
    mtr: &mut Mtr<'_>,
    addr: PageAddr,
    kind: UndoKind,
    trx_id: TrxId,
) -> Result<u16> {
    mtr.latch(addr, LatchMode::Exclusive)?;
    let offset = match kind {
        UndoKind::Insert => page::header_reuse(mtr, addr, trx_id)?,
        UndoKind::Update => page::header_create(mtr, addr, trx_id)?,
    };
    page::add_space_for_xid(mtr, addr, offset)?;
    Ok(offset)
}
