//! The history list of committed update logs awaiting purge.
//!
//! New entries go to the front of the list on the rollback segment header;
//! purge consumes from the back, which always holds the smallest trx no.

use tracing::debug;

use crate::primitives::mtr::Mtr;
use crate::primitives::pager::LatchMode;
use crate::types::{FilAddr, PageAddr, PageNo, Result, SpaceId, TrxId, TrxNo, UndoError, UndoNo};

use super::flst::{self, ListBase, ListNode};
use super::layout::{
    self, log_hdr_of_history_node, ListBaseAt, ListNodeAt, LogHeaderView, RsegHeaderView,
    SegHeaderView, UndoField,
};
use super::log::{UndoLog, UndoState};
use super::rseg::{RollbackSegment, RsegInner};
use super::UndoEnv;

/// Oldest history entry of a rollback segment, cached for purge.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct HistoryHead {
    /// Header page of the log.
    pub page_no: PageNo,
    /// Log header offset.
    pub offset: u16,
    /// Commit number of the log.
    pub trx_no: TrxNo,
    /// Whether the log delete-marks any row.
    pub del_marks: bool,
}

/// One history list entry as read from disk.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct HistoryEntry {
    /// Header page of the log.
    pub page_no: PageNo,
    /// Log header offset.
    pub offset: u16,
    /// Transaction that wrote the log.
    pub trx_id: TrxId,
    /// Commit number of the log.
    pub trx_no: TrxNo,
    /// Whether the log delete-marks any row.
    pub del_marks: bool,
}

/// Purge position: everything strictly before it may be discarded.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct PurgeLimit {
    /// Logs with a smaller commit number are removed entirely.
    pub trx_no: TrxNo,
    /// Within the log at `trx_no`, records below this undo number are removed.
    pub undo_no: UndoNo,
}

fn history_base(space: SpaceId, rseg_page: PageNo) -> ListBase {
    ListBase::new(PageAddr::new(space, rseg_page), ListBaseAt::RsegHistory)
}

fn head_at(mtr: &mut Mtr<'_>, space: SpaceId, node: FilAddr) -> Result<HistoryHead> {
    let addr = PageAddr::new(space, node.page_no);
    mtr.latch(addr, LatchMode::Shared)?;
    let offset = log_hdr_of_history_node(node.boffset);
    let log = LogHeaderView::new(mtr.page(addr), offset);
    Ok(HistoryHead {
        page_no: node.page_no,
        offset,
        trx_no: log.trx_no(),
        del_marks: log.del_marks(),
    })
}

/// Reads the oldest entry of the history list rooted on `rseg_page`.
pub fn read_oldest(
    mtr: &mut Mtr<'_>,
    space: SpaceId,
    rseg_page: PageNo,
) -> Result<Option<HistoryHead>> {
    let hdr = PageAddr::new(space, rseg_page);
    mtr.latch(hdr, LatchMode::Shared)?;
    let last = RsegHeaderView::new(mtr.page(hdr)).history_last();
    if last.is_null() {
        return Ok(None);
    }
    head_at(mtr, space, last).map(Some)
}

impl RollbackSegment {
    /// Links the latest log of `undo` at the newest end of the history list.
    ///
    /// A segment that is not being cached hands its pages over to the history
    /// size. The caller clears the slot and, once `mtr` commits, passes the
    /// returned entry to [`RollbackSegment::publish_history_head`].
    pub(crate) fn append_to_history(
        &self,
        mtr: &mut Mtr<'_>,
        inner: &RsegInner,
        undo: &UndoLog,
        trx_no: TrxNo,
    ) -> Result<HistoryHead> {
        let rseg_hdr = PageAddr::new(self.space(), inner.page_no);
        let undo_hdr = PageAddr::new(self.space(), undo.hdr_page_no);
        mtr.latch(rseg_hdr, LatchMode::Exclusive)?;
        mtr.latch(undo_hdr, LatchMode::Exclusive)?;

        if undo.state != UndoState::Cached {
            let hist = layout::read(mtr, rseg_hdr, UndoField::RsegHistorySize);
            layout::write(mtr, rseg_hdr, UndoField::RsegHistorySize, hist + undo.size as u64);
        }
        flst::add_first(
            mtr,
            history_base(self.space(), inner.page_no),
            ListNode::new(undo_hdr, ListNodeAt::LogHistory(undo.hdr_offset)),
        )?;
        layout::write(mtr, undo_hdr, UndoField::LogTrxNo(undo.hdr_offset), trx_no);
        if !undo.del_marks {
            layout::write(mtr, undo_hdr, UndoField::LogDelMarks(undo.hdr_offset), 0);
        }
        debug!(
            rseg = self.id(),
            slot = undo.id,
            trx_no,
            state = ?undo.state,
            "undo.history_append"
        );
        Ok(HistoryHead {
            page_no: undo.hdr_page_no,
            offset: undo.hdr_offset,
            trx_no,
            del_marks: undo.del_marks,
        })
    }

    /// Records a committed history append in memory.
    pub(crate) fn publish_history_head(
        &self,
        env: &UndoEnv,
        inner: &mut RsegInner,
        head: HistoryHead,
    ) {
        if inner.oldest.is_none() {
            inner.oldest = Some(head);
        }
        env.metrics.history_appended();
    }

    /// Number of logs in the history list.
    pub fn history_len(&self, env: &UndoEnv) -> Result<u32> {
        let inner = self.lock();
        let mut mtr = self.mtr(env);
        let hdr = PageAddr::new(self.space(), inner.page_no);
        mtr.latch(hdr, LatchMode::Shared)?;
        Ok(RsegHeaderView::new(mtr.page(hdr)).history_len())
    }

    /// Pages accounted to logs in the history list.
    pub fn history_size(&self, env: &UndoEnv) -> Result<u32> {
        let inner = self.lock();
        let mut mtr = self.mtr(env);
        let hdr = PageAddr::new(self.space(), inner.page_no);
        mtr.latch(hdr, LatchMode::Shared)?;
        Ok(RsegHeaderView::new(mtr.page(hdr)).history_size())
    }

    /// Oldest entry purge would process next.
    pub fn oldest_history(&self) -> Option<HistoryHead> {
        self.lock().oldest
    }

    /// Every history entry, newest first.
    pub fn history_entries(&self, env: &UndoEnv) -> Result<Vec<HistoryEntry>> {
        let inner = self.lock();
        let mut mtr = self.mtr(env);
        let base = history_base(self.space(), inner.page_no);
        mtr.latch(base.page, LatchMode::Shared)?;
        let mut out = Vec::with_capacity(flst::len(&mtr, base) as usize);
        let mut node = flst::first(&mtr, base);
        while !node.is_null() {
            let addr = PageAddr::new(self.space(), node.page_no);
            mtr.latch(addr, LatchMode::Shared)?;
            let offset = log_hdr_of_history_node(node.boffset);
            let log = LogHeaderView::new(mtr.page(addr), offset);
            out.push(HistoryEntry {
                page_no: node.page_no,
                offset,
                trx_id: log.trx_id(),
                trx_no: log.trx_no(),
                del_marks: log.del_marks(),
            });
            node = flst::next_of(&mtr, self.space(), node);
        }
        Ok(out)
    }

    /// Removes history entries older than `limit`, oldest first.
    ///
    /// A log committed before `limit.trx_no` is unlinked; when it is the last
    /// log of a segment waiting for purge, the whole segment is freed. The log
    /// committed at exactly `limit.trx_no` loses its records below
    /// `limit.undo_no`. Returns the number of entries removed.
    pub fn truncate_history(&self, env: &UndoEnv, limit: PurgeLimit) -> Result<usize> {
        let mut inner = self.lock();
        let mut removed = 0usize;
        let result = self.truncate_history_locked(env, &mut inner, limit, &mut removed);
        let mut mtr = self.mtr(env);
        inner.oldest = read_oldest(&mut mtr, self.space(), inner.page_no)?;
        drop(mtr);
        debug!(rseg = self.id(), removed, limit = ?limit, "undo.truncate_history");
        result.map(|()| removed)
    }

    fn truncate_history_locked(
        &self,
        env: &UndoEnv,
        inner: &mut RsegInner,
        limit: PurgeLimit,
        removed: &mut usize,
    ) -> Result<()> {
        loop {
            let mut mtr = self.mtr(env);
            let rseg_hdr = PageAddr::new(self.space(), inner.page_no);
            mtr.latch(rseg_hdr, LatchMode::Exclusive)?;
            let last = RsegHeaderView::new(mtr.page(rseg_hdr)).history_last();
            if last.is_null() {
                return Ok(());
            }
            let undo_hdr = PageAddr::new(self.space(), last.page_no);
            let offset = log_hdr_of_history_node(last.boffset);
            mtr.latch(undo_hdr, LatchMode::Exclusive)?;
            let (trx_no, next_log, state) = {
                let page = mtr.page(undo_hdr);
                let log = LogHeaderView::new(page, offset);
                (log.trx_no(), log.next_log(), SegHeaderView::new(page).state()?)
            };

            if trx_no >= limit.trx_no {
                drop(mtr);
                if trx_no == limit.trx_no {
                    self.truncate_start_locked(env, inner, last.page_no, offset, limit.undo_no)?;
                }
                return Ok(());
            }

            if state == UndoState::ToPurge && next_log == 0 {
                drop(mtr);
                self.free_history_segment(env, inner, last.page_no, offset)?;
            } else {
                flst::remove(
                    &mut mtr,
                    history_base(self.space(), inner.page_no),
                    ListNode::new(undo_hdr, ListNodeAt::LogHistory(offset)),
                )?;
                mtr.commit();
            }
            *removed += 1;
        }
    }

    /// Frees a purged segment: data pages step by step, then the header
    /// page together with its history entry.
    fn free_history_segment(
        &self,
        env: &UndoEnv,
        inner: &mut RsegInner,
        hdr_page_no: PageNo,
        offset: u16,
    ) -> Result<()> {
        let rseg_hdr = PageAddr::new(self.space(), inner.page_no);
        let undo_hdr = PageAddr::new(self.space(), hdr_page_no);
        let seg_size = {
            let mut mtr = self.mtr(env);
            mtr.latch(undo_hdr, LatchMode::Shared)?;
            SegHeaderView::new(mtr.page(undo_hdr)).page_list_len()
        };

        loop {
            let mut mtr = self.mtr(env);
            mtr.latch(rseg_hdr, LatchMode::Exclusive)?;
            mtr.latch(undo_hdr, LatchMode::Exclusive)?;
            let fseg = SegHeaderView::new(mtr.page(undo_hdr)).fseg();
            let done = env.fsp.free_segment_step(&mut mtr, fseg, true)?;
            mtr.commit();
            if done {
                break;
            }
        }

        let mut mtr = self.mtr(env);
        mtr.latch(rseg_hdr, LatchMode::Exclusive)?;
        mtr.latch(undo_hdr, LatchMode::Exclusive)?;
        let fseg = SegHeaderView::new(mtr.page(undo_hdr)).fseg();
        flst::remove(
            &mut mtr,
            history_base(self.space(), inner.page_no),
            ListNode::new(undo_hdr, ListNodeAt::LogHistory(offset)),
        )?;
        let hist = layout::read(&mtr, rseg_hdr, UndoField::RsegHistorySize);
        let hist = hist
            .checked_sub(seg_size as u64)
            .ok_or(UndoError::Corruption("history size underflow"))?;
        layout::write(&mut mtr, rseg_hdr, UndoField::RsegHistorySize, hist);
        while !env.fsp.free_segment_step(&mut mtr, fseg, false)? {}
        mtr.commit();

        inner.curr_size -= seg_size;
        for _ in 0..seg_size {
            env.metrics.page_freed();
        }
        debug!(rseg = self.id(), page = hdr_page_no.0, pages = seg_size, "undo.segment_purged");
        Ok(())
    }
}
