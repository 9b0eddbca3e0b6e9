//! Walking the records of one undo log, within a page and across pages.
//!
//! Records are framed as `next:u16 | type:u8 | undo_no:varint | payload |
//! start:u16`. Within a page, a log's records lie between [`page_start`] and
//! [`page_end`]; pages are chained through the segment's page list.

use crate::primitives::bytes::{mach, var};
use crate::primitives::mtr::Mtr;
use crate::primitives::pager::LatchMode;
use crate::types::{PageAddr, PageNo, Result, SpaceId, UndoError, UndoNo};

use super::layout::{LogHeaderView, UndoPageView};
use super::page::{RecordType, RECORD_FRAMING};

/// Identifies one undo log: its segment's first page and header offset.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct LogLocator {
    /// Tablespace of the segment.
    pub space: SpaceId,
    /// First page of the segment.
    pub hdr_page_no: PageNo,
    /// Offset of the log header.
    pub hdr_offset: u16,
}

impl LogLocator {
    /// Builds a locator.
    pub fn new(space: SpaceId, hdr_page_no: PageNo, hdr_offset: u16) -> Self {
        Self {
            space,
            hdr_page_no,
            hdr_offset,
        }
    }

    fn hdr_addr(&self) -> PageAddr {
        PageAddr::new(self.space, self.hdr_page_no)
    }
}

/// Position of a record.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RecPos {
    /// Page holding the record.
    pub page_no: PageNo,
    /// Offset of the record's first byte.
    pub offset: u16,
}

/// First record offset of the log on `page`.
pub fn page_start(page: &[u8], page_no: PageNo, log: LogLocator) -> u16 {
    if page_no == log.hdr_page_no {
        LogHeaderView::new(page, log.hdr_offset).log_start()
    } else {
        UndoPageView::new(page).start()
    }
}

/// One past the last record offset of the log on `page`.
pub fn page_end(page: &[u8], page_no: PageNo, log: LogLocator) -> u16 {
    if page_no == log.hdr_page_no {
        match LogHeaderView::new(page, log.hdr_offset).next_log() {
            0 => UndoPageView::new(page).free(),
            next => next,
        }
    } else {
        UndoPageView::new(page).free()
    }
}

/// First record of the log on `page`.
pub fn page_first_rec(page: &[u8], page_no: PageNo, log: LogLocator) -> Option<u16> {
    let start = page_start(page, page_no, log);
    (start != page_end(page, page_no, log)).then_some(start)
}

/// Last record of the log on `page`.
pub fn page_last_rec(page: &[u8], page_no: PageNo, log: LogLocator) -> Option<u16> {
    let start = page_start(page, page_no, log);
    let end = page_end(page, page_no, log);
    (start != end).then(|| mach::read_u16(page, end as usize - 2))
}

/// Record after `rec` on the same page.
pub fn page_next_rec(page: &[u8], rec: u16, page_no: PageNo, log: LogLocator) -> Option<u16> {
    let next = mach::read_u16(page, rec as usize);
    (next != page_end(page, page_no, log)).then_some(next)
}

/// Record before `rec` on the same page.
pub fn page_prev_rec(page: &[u8], rec: u16, page_no: PageNo, log: LogLocator) -> Option<u16> {
    (rec != page_start(page, page_no, log)).then(|| mach::read_u16(page, rec as usize - 2))
}

/// Undo number stored in the record at `rec`.
pub fn record_undo_no(page: &[u8], rec: u16) -> Result<UndoNo> {
    let mut off = rec as usize + 3;
    var::decode_u64(page, &mut off)
}

/// Type, undo number and payload of the record at `rec`.
pub fn record_parts(page: &[u8], rec: u16) -> Result<(RecordType, UndoNo, &[u8])> {
    let start = rec as usize;
    let next = mach::read_u16(page, start) as usize;
    if next < start + RECORD_FRAMING || next > page.len() {
        return Err(UndoError::Corruption("undo record framing out of range"));
    }
    let rec_type = RecordType::try_from(page[start + 2])?;
    let mut off = start + 3;
    let undo_no = var::decode_u64(page, &mut off)?;
    let end = next - 2;
    if off > end {
        return Err(UndoError::Corruption("undo record shorter than its header"));
    }
    Ok((rec_type, undo_no, &page[off..end]))
}

/// Cursor-free navigation over one log, latching pages in `mode`.
#[derive(Clone, Copy, Debug)]
pub struct RecordNavigator {
    log: LogLocator,
    mode: LatchMode,
}

impl RecordNavigator {
    /// Navigator over `log` that latches visited pages in `mode`.
    pub fn new(log: LogLocator, mode: LatchMode) -> Self {
        Self { log, mode }
    }

    /// The log walked.
    pub fn log(&self) -> LogLocator {
        self.log
    }

    fn addr(&self, page_no: PageNo) -> PageAddr {
        PageAddr::new(self.log.space, page_no)
    }

    /// First record of the log.
    pub fn first(&self, mtr: &mut Mtr<'_>) -> Result<Option<RecPos>> {
        let hdr = self.log.hdr_addr();
        mtr.latch(hdr, self.mode)?;
        if let Some(offset) = page_first_rec(mtr.page(hdr), hdr.page_no, self.log) {
            return Ok(Some(RecPos {
                page_no: hdr.page_no,
                offset,
            }));
        }
        self.first_on_next_page(mtr, hdr.page_no)
    }

    /// Last record of the log on `page_no`, without leaving the page.
    pub fn last_on_page(&self, mtr: &mut Mtr<'_>, page_no: PageNo) -> Result<Option<RecPos>> {
        let addr = self.addr(page_no);
        mtr.latch(addr, self.mode)?;
        Ok(page_last_rec(mtr.page(addr), page_no, self.log).map(|offset| RecPos { page_no, offset }))
    }

    /// Record following `rec`, crossing to the next page if needed.
    pub fn next(&self, mtr: &mut Mtr<'_>, rec: RecPos) -> Result<Option<RecPos>> {
        let addr = self.addr(rec.page_no);
        mtr.latch(addr, self.mode)?;
        if let Some(offset) = page_next_rec(mtr.page(addr), rec.offset, rec.page_no, self.log) {
            return Ok(Some(RecPos {
                page_no: rec.page_no,
                offset,
            }));
        }
        self.first_on_next_page(mtr, rec.page_no)
    }

    /// Record preceding `rec`, crossing to the previous page if needed.
    pub fn prev(&self, mtr: &mut Mtr<'_>, rec: RecPos) -> Result<Option<RecPos>> {
        let addr = self.addr(rec.page_no);
        mtr.latch(addr, self.mode)?;
        if let Some(offset) = page_prev_rec(mtr.page(addr), rec.offset, rec.page_no, self.log) {
            return Ok(Some(RecPos {
                page_no: rec.page_no,
                offset,
            }));
        }
        if rec.page_no == self.log.hdr_page_no {
            return Ok(None);
        }
        let prev = UndoPageView::new(mtr.page(addr)).prev_page();
        if prev.is_null() {
            return Ok(None);
        }
        self.last_on_page(mtr, prev.page_no)
    }

    fn first_on_next_page(&self, mtr: &mut Mtr<'_>, page_no: PageNo) -> Result<Option<RecPos>> {
        let addr = self.addr(page_no);
        if page_no == self.log.hdr_page_no
            && LogHeaderView::new(mtr.page(addr), self.log.hdr_offset).next_log() != 0
        {
            // An older log on a shared header page never continues onto later pages.
            return Ok(None);
        }
        let next = UndoPageView::new(mtr.page(addr)).next_page();
        if next.is_null() {
            return Ok(None);
        }
        let next_addr = self.addr(next.page_no);
        mtr.latch(next_addr, self.mode)?;
        Ok(page_first_rec(mtr.page(next_addr), next.page_no, self.log).map(|offset| RecPos {
            page_no: next.page_no,
            offset,
        }))
    }

    /// Undo number of the record at `rec`; its page must be latched.
    pub fn undo_no(&self, mtr: &Mtr<'_>, rec: RecPos) -> Result<UndoNo> {
        record_undo_no(mtr.page(self.addr(rec.page_no)), rec.offset)
    }

    /// Type, undo number and payload of the record at `rec`.
    pub fn record(&self, mtr: &Mtr<'_>, rec: RecPos) -> Result<(RecordType, UndoNo, Vec<u8>)> {
        let (rec_type, undo_no, payload) =
            record_parts(mtr.page(self.addr(rec.page_no)), rec.offset)?;
        Ok((rec_type, undo_no, payload.to_vec()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::undo::log::UndoKind;
    use crate::testkit::Fixture;

    fn collect_forward(fx: &Fixture, nav: RecordNavigator) -> Result<Vec<UndoNo>> {
        let mut mtr = fx.env.mtr();
        let mut out = Vec::new();
        let mut rec = nav.first(&mut mtr)?;
        while let Some(at) = rec {
            out.push(nav.undo_no(&mtr, at)?);
            rec = nav.next(&mut mtr, at)?;
        }
        Ok(out)
    }

    #[test]
    fn walks_records_across_pages_both_ways() -> Result<()> {
        let fx = Fixture::new()?;
        let undo = fx.assign(UndoKind::Insert, 1)?;
        let mut last = None;
        for undo_no in 0..6u64 {
            let payload = vec![undo_no as u8; 1500];
            let at = fx
                .rseg
                .append_record(&fx.env, undo, RecordType::Insert, undo_no, &payload)?;
            last = Some(at);
        }
        let log = fx.rseg.undo_log(undo).expect("active");
        assert_eq!(log.size, 3);
        let nav = RecordNavigator::new(
            LogLocator::new(log.space, log.hdr_page_no, log.hdr_offset),
            LatchMode::Shared,
        );
        assert_eq!(collect_forward(&fx, nav)?, (0..6).collect::<Vec<_>>());

        let mut mtr = fx.env.mtr();
        let mut backward = Vec::new();
        let mut rec = last;
        while let Some(at) = rec {
            let (rec_type, undo_no, payload) = nav.record(&mtr, at)?;
            assert_eq!(rec_type, RecordType::Insert);
            assert_eq!(payload, vec![undo_no as u8; 1500]);
            backward.push(undo_no);
            rec = nav.prev(&mut mtr, at)?;
        }
        assert_eq!(backward, vec![5, 4, 3, 2, 1, 0]);
        Ok(())
    }

    #[test]
    fn older_log_on_shared_page_stops_at_next_header() -> Result<()> {
        let fx = Fixture::new()?;
        let first = fx.assign(UndoKind::Update, 1)?;
        fx.rseg
            .append_record(&fx.env, first, RecordType::UpdateExisting, 0, b"a")?;
        fx.rseg
            .append_record(&fx.env, first, RecordType::UpdateExisting, 1, b"b")?;
        let older = fx.rseg.undo_log(first).expect("active");
        fx.rseg.commit_update(&fx.env, first, 2)?;

        let second = fx.assign(UndoKind::Update, 3)?;
        fx.rseg
            .append_record(&fx.env, second, RecordType::DeleteMark, 0, b"c")?;
        let newer = fx.rseg.undo_log(second).expect("active");
        assert_eq!(newer.hdr_page_no, older.hdr_page_no);

        let old_nav = RecordNavigator::new(
            LogLocator::new(older.space, older.hdr_page_no, older.hdr_offset),
            LatchMode::Shared,
        );
        assert_eq!(collect_forward(&fx, old_nav)?, vec![0, 1]);
        let new_nav = RecordNavigator::new(
            LogLocator::new(newer.space, newer.hdr_page_no, newer.hdr_offset),
            LatchMode::Shared,
        );
        assert_eq!(collect_forward(&fx, new_nav)?, vec![0]);
        Ok(())
    }

    #[test]
    fn empty_log_has_no_records() -> Result<()> {
        let fx = Fixture::new()?;
        let undo = fx.assign(UndoKind::Insert, 1)?;
        let log = fx.rseg.undo_log(undo).expect("active");
        let nav = RecordNavigator::new(
            LogLocator::new(log.space, log.hdr_page_no, log.hdr_offset),
            LatchMode::Shared,
        );
        let mut mtr = fx.env.mtr();
        assert_eq!(nav.first(&mut mtr)?, None);
        assert_eq!(nav.last_on_page(&mut mtr, log.hdr_page_no)?, None);
        Ok(())
    }

    #[test]
    fn malformed_record_is_corruption() {
        let mut page = vec![0u8; 4096];
        mach::write_u16(&mut page, 300, 301);
        assert!(matches!(
            record_parts(&page, 300),
            Err(UndoError::Corruption(_))
        ));
        mach::write_u16(&mut page, 300, 320);
        page[302] = 99;
        assert!(record_parts(&page, 300).is_err());
    }
}
