//! Appending undo records to an active log.

use tracing::trace;

use crate::primitives::pager::LatchMode;
use crate::types::{PageAddr, Result, UndoError, UndoNo};

use super::layout::{page_records_limit, PAGE_RECORDS_START};
use super::log::{UndoRef, UndoState};
use super::navigator::RecPos;
use super::page::{self, RecordType, RECORD_FRAMING};
use super::rseg::RollbackSegment;
use super::UndoEnv;

impl RollbackSegment {
    /// Appends a record to the newest page of an active log, growing the
    /// segment by a page when the record does not fit.
    pub fn append_record(
        &self,
        env: &UndoEnv,
        undo: UndoRef,
        rec_type: RecordType,
        undo_no: UndoNo,
        payload: &[u8],
    ) -> Result<RecPos> {
        let body = page::encode_record_body(rec_type, undo_no, payload);
        let capacity = page_records_limit(env.options.page_size as usize) - PAGE_RECORDS_START;
        if body.len() + RECORD_FRAMING > capacity {
            return Err(UndoError::Invalid("undo record larger than a page"));
        }

        let _log = self.lock_log(undo)?;
        let (state, mut last_page_no) = {
            let mut inner = self.lock();
            let log = inner.active_log(undo)?;
            (log.state, log.last_page_no)
        };
        if state != UndoState::Active {
            return Err(UndoError::Invalid("records are only appended to active logs"));
        }

        let fits = {
            let mut mtr = self.mtr(env);
            let addr = PageAddr::new(self.space(), last_page_no);
            mtr.latch(addr, LatchMode::Shared)?;
            page::record_fits(mtr.page(addr), body.len())
        };
        if !fits {
            let mut inner = self.lock();
            last_page_no = self.add_page_locked(env, &mut inner, undo)?;
        }

        let mut mtr = self.mtr(env);
        let addr = PageAddr::new(self.space(), last_page_no);
        mtr.latch(addr, LatchMode::Exclusive)?;
        let offset = page::insert_record(&mut mtr, addr, body)?;
        mtr.commit();

        let mut inner = self.lock();
        let log = inner.active_log(undo)?;
        log.empty = false;
        log.top_page_no = last_page_no;
        log.top_offset = offset;
        log.top_undo_no = undo_no;
        if rec_type == RecordType::DeleteMark {
            log.del_marks = true;
        }
        drop(inner);
        trace!(
            rseg = self.id(),
            slot = undo.id,
            page = last_page_no.0,
            offset,
            undo_no,
            "undo.append_record"
        );
        Ok(RecPos {
            page_no: last_page_no,
            offset,
        })
    }
}
