//! Removing records from either end of an undo log.
//!
//! Only whole pages are freed. The header page is never freed here: at the
//! tail its free offset is rewound, at the head its log start is advanced.
//! Both loops run one mini-transaction per page under the rollback segment
//! lock, so a crash leaves a prefix of the work durable.

use tracing::debug;

use crate::primitives::mtr::Mtr;
use crate::primitives::pager::LatchMode;
use crate::types::{PageAddr, PageNo, Result, UndoError, UndoNo};

use super::flst::{self, ListBase, ListNode};
use super::layout::{self, ListBaseAt, ListNodeAt, SegHeaderView, UndoField};
use super::log::{UndoLog, UndoRef};
use super::navigator::{self, LogLocator, RecordNavigator};
use super::rseg::{RollbackSegment, RsegInner};
use super::UndoEnv;

impl RollbackSegment {
    /// Frees a non-header page of the segment starting at `hdr_page_no`.
    ///
    /// Returns the segment's new last page. With `in_history`, the page was
    /// accounted to the history size, which shrinks by one.
    pub(crate) fn free_undo_page(
        &self,
        env: &UndoEnv,
        mtr: &mut Mtr<'_>,
        inner: &mut RsegInner,
        hdr_page_no: PageNo,
        page_no: PageNo,
        in_history: bool,
    ) -> Result<PageNo> {
        assert_ne!(hdr_page_no, page_no, "undo header page freed as a data page");
        let hdr = PageAddr::new(self.space(), hdr_page_no);
        let page = PageAddr::new(self.space(), page_no);
        if in_history {
            mtr.latch(PageAddr::new(self.space(), inner.page_no), LatchMode::Exclusive)?;
        }
        mtr.latch(hdr, LatchMode::Exclusive)?;
        mtr.latch(page, LatchMode::Exclusive)?;

        if in_history {
            let rseg_hdr = PageAddr::new(self.space(), inner.page_no);
            let hist = layout::read(mtr, rseg_hdr, UndoField::RsegHistorySize);
            if hist == 0 {
                return Err(UndoError::Corruption("history size underflow"));
            }
            layout::write(mtr, rseg_hdr, UndoField::RsegHistorySize, hist - 1);
        }
        let fseg = SegHeaderView::new(mtr.page(hdr)).fseg();
        flst::remove(
            mtr,
            ListBase::new(hdr, ListBaseAt::SegPageList),
            ListNode::new(page, ListNodeAt::UndoPage),
        )?;
        let last = SegHeaderView::new(mtr.page(hdr)).page_list_last().page_no;
        // Not undone when the mtr is dropped: every check comes first.
        env.fsp.free_page(mtr, fseg, page_no)?;
        inner.curr_size -= 1;
        env.metrics.page_freed();
        Ok(last)
    }

    /// Drops every record with `undo_no >= limit` from the tail of an active log.
    pub fn truncate_end(&self, env: &UndoEnv, undo: UndoRef, limit: UndoNo) -> Result<()> {
        let _log = self.lock_log(undo)?;
        let mut inner = self.lock();
        let mut handle = inner.active_log(undo)?.clone();
        let result = self.truncate_end_locked(env, &mut inner, &mut handle, limit);
        // Pages freed before a failure stay freed; keep the handle in step.
        *inner.active_log(undo)? = handle;
        result
    }

    fn truncate_end_locked(
        &self,
        env: &UndoEnv,
        inner: &mut RsegInner,
        handle: &mut UndoLog,
        limit: UndoNo,
    ) -> Result<()> {
        let locator = LogLocator::new(handle.space, handle.hdr_page_no, handle.hdr_offset);
        loop {
            let mut mtr = self.mtr(env);
            let hdr = PageAddr::new(self.space(), handle.hdr_page_no);
            let last = PageAddr::new(self.space(), handle.last_page_no);
            mtr.latch(hdr, LatchMode::Exclusive)?;
            mtr.latch(last, LatchMode::Exclusive)?;

            let mut trunc_here = None;
            let mut survivor = false;
            let mut rec = navigator::page_last_rec(mtr.page(last), last.page_no, locator);
            while let Some(at) = rec {
                if navigator::record_undo_no(mtr.page(last), at)? < limit {
                    survivor = true;
                    break;
                }
                trunc_here = Some(at);
                rec = navigator::page_prev_rec(mtr.page(last), at, last.page_no, locator);
            }

            if survivor || last.page_no == handle.hdr_page_no {
                if let Some(at) = trunc_here {
                    layout::write(&mut mtr, last, UndoField::PageFree, at as u64);
                }
                mtr.commit();
                break;
            }

            handle.last_page_no =
                self.free_undo_page(env, &mut mtr, inner, handle.hdr_page_no, last.page_no, false)?;
            handle.size -= 1;
            mtr.commit();
        }
        self.refresh_top(env, handle)?;
        debug!(rseg = self.id(), slot = handle.id, limit, size = handle.size, "undo.truncate_end");
        Ok(())
    }

    fn refresh_top(&self, env: &UndoEnv, handle: &mut UndoLog) -> Result<()> {
        let locator = LogLocator::new(handle.space, handle.hdr_page_no, handle.hdr_offset);
        let nav = RecordNavigator::new(locator, LatchMode::Shared);
        let mut mtr = self.mtr(env);
        match nav.last_on_page(&mut mtr, handle.last_page_no)? {
            Some(rec) => {
                handle.empty = false;
                handle.top_page_no = rec.page_no;
                handle.top_offset = rec.offset;
                handle.top_undo_no = nav.undo_no(&mtr, rec)?;
            }
            None => {
                handle.empty = true;
                handle.top_page_no = handle.hdr_page_no;
                handle.top_offset = 0;
                handle.top_undo_no = 0;
            }
        }
        Ok(())
    }

    /// Drops every record with `undo_no < limit` from the head of a log in
    /// the history list. A `limit` of 0 does nothing.
    pub fn truncate_start(
        &self,
        env: &UndoEnv,
        hdr_page_no: PageNo,
        hdr_offset: u16,
        limit: UndoNo,
    ) -> Result<()> {
        let mut inner = self.lock();
        self.truncate_start_locked(env, &mut inner, hdr_page_no, hdr_offset, limit)
    }

    pub(crate) fn truncate_start_locked(
        &self,
        env: &UndoEnv,
        inner: &mut RsegInner,
        hdr_page_no: PageNo,
        hdr_offset: u16,
        limit: UndoNo,
    ) -> Result<()> {
        if limit == 0 {
            return Ok(());
        }
        let locator = LogLocator::new(self.space(), hdr_page_no, hdr_offset);
        let nav = RecordNavigator::new(locator, LatchMode::Exclusive);
        let mut freed = 0u32;
        loop {
            let mut mtr = self.mtr(env);
            // The history size lives on the rseg header, latched ahead of undo pages.
            mtr.latch(PageAddr::new(self.space(), inner.page_no), LatchMode::Exclusive)?;
            let Some(first) = nav.first(&mut mtr)? else {
                break;
            };
            let page = PageAddr::new(self.space(), first.page_no);
            let last = navigator::page_last_rec(mtr.page(page), first.page_no, locator)
                .ok_or(UndoError::Corruption("undo page with a first record but no last"))?;
            if navigator::record_undo_no(mtr.page(page), last)? >= limit {
                break;
            }
            if first.page_no == hdr_page_no {
                empty_header_page(&mut mtr, locator);
            } else {
                self.free_undo_page(env, &mut mtr, inner, hdr_page_no, first.page_no, true)?;
                freed += 1;
            }
            mtr.commit();
        }
        debug!(
            rseg = self.id(),
            page = hdr_page_no.0,
            offset = hdr_offset,
            limit,
            freed,
            "undo.truncate_start"
        );
        Ok(())
    }
}

/// Advances the log's start past every record it has on its header page.
fn empty_header_page(mtr: &mut Mtr<'_>, log: LogLocator) {
    let hdr = PageAddr::new(log.space, log.hdr_page_no);
    let end = navigator::page_end(mtr.page(hdr), log.hdr_page_no, log);
    layout::write(mtr, hdr, UndoField::LogStart(log.hdr_offset), end as u64);
}
