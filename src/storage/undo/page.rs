//! Undo page mutations.
//!
//! Composite mutations have a byte-level `apply_*` routine used both by the
//! live path (through [`Mtr::apply_logged`]) and by recovery replay, so a
//! replayed record reproduces exactly the bytes the live path wrote.

use crate::primitives::bytes::{mach, var};
use crate::primitives::mtr::Mtr;
use crate::primitives::wal::RedoRecord;
use crate::types::{PageAddr, Result, TableId, TrxId, UndoError, UndoNo};

use super::layout::{
    self, fil, log_hdr, page_records_limit, UndoField, HEADER_CREATE_MARGIN, HEADER_REGION_END,
    PAGE_RECORDS_START,
};
use super::log::{UndoKind, UndoState, Xid};

/// Record type byte stored after a record's next-offset.
#[repr(u8)]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum RecordType {
    /// Fresh insert.
    Insert = 11,
    /// Update of an existing row.
    UpdateExisting = 12,
    /// Delete mark of an existing row.
    DeleteMark = 14,
}

impl TryFrom<u8> for RecordType {
    type Error = UndoError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            11 => Ok(RecordType::Insert),
            12 => Ok(RecordType::UpdateExisting),
            14 => Ok(RecordType::DeleteMark),
            _ => Err(UndoError::Corruption("unknown undo record type")),
        }
    }
}

/// Framing bytes around a record body: next offset and start offset.
pub const RECORD_FRAMING: usize = 4;

/// Encodes a record body: type byte, undo number, payload.
pub fn encode_record_body(rec_type: RecordType, undo_no: UndoNo, payload: &[u8]) -> Vec<u8> {
    let mut body = Vec::with_capacity(1 + var::MAX_LEN + payload.len());
    body.push(rec_type as u8);
    var::encode_u64(undo_no, &mut body);
    body.extend_from_slice(payload);
    body
}

/// Sets up an undo page of `kind` with no records.
pub fn apply_page_init(page: &mut [u8], kind: u16) {
    layout::set(page, UndoField::FilPageType, fil::TYPE_UNDO_LOG as u64);
    layout::set(page, UndoField::PageType, kind as u64);
    layout::set(page, UndoField::PageStart, PAGE_RECORDS_START as u64);
    layout::set(page, UndoField::PageFree, PAGE_RECORDS_START as u64);
}

/// Appends a log header at the page's free offset and returns its offset.
pub fn apply_header_create(page: &mut [u8], trx_id: TrxId) -> Result<u16> {
    let free = layout::get(page, UndoField::PageFree) as usize;
    if free + log_hdr::XA_HDR_SIZE >= page.len() - HEADER_CREATE_MARGIN {
        return Err(UndoError::Corruption("no room for a new undo log header"));
    }
    let new_free = (free + log_hdr::OLD_HDR_SIZE) as u64;
    let hdr = free as u16;
    layout::set(page, UndoField::PageStart, new_free);
    layout::set(page, UndoField::PageFree, new_free);
    layout::set(page, UndoField::SegState, UndoState::Active as u64);

    let prev_log = layout::get(page, UndoField::SegLastLog) as u16;
    if prev_log != 0 {
        layout::set(page, UndoField::LogNextLog(prev_log), free as u64);
    }
    layout::set(page, UndoField::SegLastLog, free as u64);

    layout::set(page, UndoField::LogDelMarks(hdr), 1);
    layout::set(page, UndoField::LogTrxId(hdr), trx_id);
    layout::set(page, UndoField::LogStart(hdr), new_free);
    layout::set(page, UndoField::LogXidExists(hdr), 0);
    layout::set(page, UndoField::LogDictTrans(hdr), 0);
    layout::set(page, UndoField::LogNextLog(hdr), 0);
    layout::set(page, UndoField::LogPrevLog(hdr), prev_log as u64);
    Ok(hdr)
}

/// Re-initializes the single insert-undo header of a cached segment.
pub fn apply_header_reuse(page: &mut [u8], trx_id: TrxId) -> Result<u16> {
    if layout::get(page, UndoField::PageType) != UndoKind::Insert as u64 {
        return Err(UndoError::Corruption("header reuse on a non-insert undo page"));
    }
    let hdr = HEADER_REGION_END as u16;
    let new_free = (HEADER_REGION_END + log_hdr::OLD_HDR_SIZE) as u64;
    layout::set(page, UndoField::PageStart, new_free);
    layout::set(page, UndoField::PageFree, new_free);
    layout::set(page, UndoField::SegState, UndoState::Active as u64);

    layout::set(page, UndoField::LogTrxId(hdr), trx_id);
    layout::set(page, UndoField::LogStart(hdr), new_free);
    layout::set(page, UndoField::LogXidExists(hdr), 0);
    layout::set(page, UndoField::LogDictTrans(hdr), 0);
    Ok(hdr)
}

/// Drops the latest log header and makes the previous one current again.
pub fn apply_discard_latest(page: &mut [u8]) -> Result<()> {
    let hdr = layout::get(page, UndoField::SegLastLog) as u16;
    if hdr == 0 {
        return Err(UndoError::Corruption("discard on a page without log headers"));
    }
    let prev = layout::get(page, UndoField::LogPrevLog(hdr)) as u16;
    if prev != 0 {
        let prev_start = layout::get(page, UndoField::LogStart(prev));
        layout::set(page, UndoField::PageStart, prev_start);
        layout::set(page, UndoField::LogNextLog(prev), 0);
    }
    layout::set(page, UndoField::PageFree, hdr as u64);
    layout::set(page, UndoField::SegState, UndoState::Cached as u64);
    layout::set(page, UndoField::SegLastLog, prev as u64);
    Ok(())
}

/// Appends a framed record at the free offset and returns its offset.
pub fn apply_record_insert(page: &mut [u8], body: &[u8]) -> Result<u16> {
    let free = layout::get(page, UndoField::PageFree) as usize;
    let end = free + RECORD_FRAMING + body.len();
    if end > page_records_limit(page.len()) {
        return Err(UndoError::Corruption("undo record overflows page"));
    }
    mach::write_u16(page, free, end as u16);
    page[free + 2..free + 2 + body.len()].copy_from_slice(body);
    mach::write_u16(page, end - 2, free as u16);
    layout::set(page, UndoField::PageFree, end as u64);
    Ok(free as u16)
}

/// Returns true when a record with `body_len` body bytes fits on the page.
pub fn record_fits(page: &[u8], body_len: usize) -> bool {
    let free = layout::get(page, UndoField::PageFree) as usize;
    free + RECORD_FRAMING + body_len <= page_records_limit(page.len())
}

/// Initializes an undo page, logged as one record.
pub fn page_init(mtr: &mut Mtr<'_>, addr: PageAddr, kind: UndoKind) {
    mtr.apply_logged(
        RedoRecord::UndoInit {
            page: addr,
            kind: kind as u16,
        },
        |page| apply_page_init(page, kind as u16),
    );
}

/// Creates a log header, logged as one record.
pub fn header_create(mtr: &mut Mtr<'_>, addr: PageAddr, trx_id: TrxId) -> Result<u16> {
    mtr.apply_logged(RedoRecord::UndoHdrCreate { page: addr, trx_id }, |page| {
        apply_header_create(page, trx_id)
    })
}

/// Reuses an insert-undo header, logged as one record.
pub fn header_reuse(mtr: &mut Mtr<'_>, addr: PageAddr, trx_id: TrxId) -> Result<u16> {
    mtr.apply_logged(RedoRecord::UndoHdrReuse { page: addr, trx_id }, |page| {
        apply_header_reuse(page, trx_id)
    })
}

/// Discards the latest log header, logged as one record.
pub fn discard_latest(mtr: &mut Mtr<'_>, addr: PageAddr) -> Result<()> {
    mtr.apply_logged(RedoRecord::UndoHdrDiscard { page: addr }, apply_discard_latest)
}

/// Appends a record body, logged as one record.
pub fn insert_record(mtr: &mut Mtr<'_>, addr: PageAddr, body: Vec<u8>) -> Result<u16> {
    let record = RedoRecord::UndoInsert {
        page: addr,
        body: body.clone(),
    };
    mtr.apply_logged(record, |page| apply_record_insert(page, &body))
}

/// Extends the log header just created at `hdr` with the XA area.
pub fn add_space_for_xid(mtr: &mut Mtr<'_>, addr: PageAddr, hdr: u16) -> Result<()> {
    let free = layout::read(mtr, addr, UndoField::PageFree) as usize;
    if free != hdr as usize + log_hdr::OLD_HDR_SIZE {
        return Err(UndoError::Corruption("log header is not the newest on its page"));
    }
    let new_free = (free + log_hdr::XA_HDR_SIZE - log_hdr::OLD_HDR_SIZE) as u64;
    layout::write(mtr, addr, UndoField::PageStart, new_free);
    layout::write(mtr, addr, UndoField::PageFree, new_free);
    layout::write(mtr, addr, UndoField::LogStart(hdr), new_free);
    Ok(())
}

/// Records an XID in the log header and raises its exists flag.
pub fn write_xid(mtr: &mut Mtr<'_>, addr: PageAddr, hdr: u16, xid: &Xid) {
    layout::write(mtr, addr, UndoField::LogXidExists(hdr), 1);
    layout::write(
        mtr,
        addr,
        UndoField::LogXaFormat(hdr),
        xid.format_id as u32 as u64,
    );
    layout::write(mtr, addr, UndoField::LogXaTridLen(hdr), xid.gtrid_length as u64);
    layout::write(mtr, addr, UndoField::LogXaBqualLen(hdr), xid.bqual_length as u64);
    layout::write_xa_data(mtr, addr, hdr, &xid.data);
}

/// Flags the log as a dictionary operation on `table_id`.
pub fn mark_dict_operation(mtr: &mut Mtr<'_>, addr: PageAddr, hdr: u16, table_id: TableId) {
    layout::write(mtr, addr, UndoField::LogDictTrans(hdr), 1);
    layout::write(mtr, addr, UndoField::LogTableId(hdr), table_id);
}
