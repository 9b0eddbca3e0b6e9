//! Byte-exact layout of undo pages and rollback segment header pages.
//!
//! All multi-byte fields are big-endian. Reads go through the typed views in
//! this module; durable writes go through [`write`] so that every change is
//! logged by the mini-transaction. Offsets are only visible to this module
//! and to [`super::flst`].

use crate::primitives::bytes::mach;
use crate::primitives::fsp::FsegRef;
use crate::primitives::mtr::Mtr;
use crate::types::{FilAddr, PageAddr, PageNo, Result, SpaceId, TableId, TrxId, TrxNo, UndoError};

use super::log::{UndoKind, UndoState, Xid};

pub use crate::primitives::pager::fil;

/// File address and list node formats.
pub mod flst_fmt {
    /// Page number inside an address.
    pub const ADDR_PAGE: usize = 0;
    /// Byte offset inside an address.
    pub const ADDR_BYTE: usize = 4;
    /// Encoded address size.
    pub const ADDR_SIZE: usize = 6;

    /// List length in a base node.
    pub const BASE_LEN: usize = 0;
    /// First node address in a base node.
    pub const BASE_FIRST: usize = 4;
    /// Last node address in a base node.
    pub const BASE_LAST: usize = BASE_FIRST + ADDR_SIZE;
    /// Size of a base node.
    pub const BASE_NODE_SIZE: usize = 16;

    /// Previous node address in a node.
    pub const NODE_PREV: usize = 0;
    /// Next node address in a node.
    pub const NODE_NEXT: usize = ADDR_SIZE;
    /// Size of a node.
    pub const NODE_SIZE: usize = 2 * ADDR_SIZE;
}

/// File segment header format.
pub mod fseg_fmt {
    /// Tablespace id.
    pub const HDR_SPACE: usize = 0;
    /// Segment inode page; holds the segment number here.
    pub const HDR_PAGE_NO: usize = 4;
    /// Segment inode offset.
    pub const HDR_OFFSET: usize = 8;
    /// Encoded header size.
    pub const HEADER_SIZE: usize = 10;
}

/// Undo page header, present on every undo page.
pub mod page_hdr {
    use super::{fil, flst_fmt};

    /// Start of the header.
    pub const BASE: usize = fil::PAGE_DATA;
    /// Undo kind (2 bytes).
    pub const TYPE: usize = 0;
    /// Offset of the latest log's first record on this page (2 bytes).
    pub const START: usize = 2;
    /// First free byte on the page (2 bytes).
    pub const FREE: usize = 4;
    /// Node in the segment's page list.
    pub const NODE: usize = 6;
    /// Header size.
    pub const SIZE: usize = NODE + flst_fmt::NODE_SIZE;
}

/// Undo segment header, present on the first page of a segment.
pub mod seg_hdr {
    use super::{flst_fmt, fseg_fmt, page_hdr};

    /// Start of the header.
    pub const BASE: usize = page_hdr::BASE + page_hdr::SIZE;
    /// Segment state (2 bytes).
    pub const STATE: usize = 0;
    /// Offset of the latest log header (2 bytes).
    pub const LAST_LOG: usize = 2;
    /// File segment header.
    pub const FSEG_HEADER: usize = 4;
    /// Base node of the segment's page list.
    pub const PAGE_LIST: usize = FSEG_HEADER + fseg_fmt::HEADER_SIZE;
    /// Header size.
    pub const SIZE: usize = PAGE_LIST + flst_fmt::BASE_NODE_SIZE;
}

/// Undo log header, relative to the header's offset on its page.
pub mod log_hdr {
    use super::flst_fmt;

    /// Creating transaction id (8 bytes).
    pub const TRX_ID: usize = 0;
    /// Commit number once in history (8 bytes).
    pub const TRX_NO: usize = 8;
    /// Whether the log may contain delete marks (2 bytes).
    pub const DEL_MARKS: usize = 16;
    /// Offset of the log's first record (2 bytes).
    pub const LOG_START: usize = 18;
    /// XID present flag (1 byte).
    pub const XID_EXISTS: usize = 20;
    /// Dictionary operation flag (1 byte).
    pub const DICT_TRANS: usize = 21;
    /// Table id of a dictionary operation (8 bytes).
    pub const TABLE_ID: usize = 22;
    /// Offset of the next log header on this page, 0 if none (2 bytes).
    pub const NEXT_LOG: usize = 30;
    /// Offset of the previous log header on this page, 0 if none (2 bytes).
    pub const PREV_LOG: usize = 32;
    /// Node in the rollback segment history list.
    pub const HISTORY_NODE: usize = 34;
    /// Header size without the XA area.
    pub const OLD_HDR_SIZE: usize = HISTORY_NODE + flst_fmt::NODE_SIZE;
    /// XA format id (4 bytes).
    pub const XA_FORMAT: usize = OLD_HDR_SIZE;
    /// XA global transaction id length (4 bytes).
    pub const XA_TRID_LEN: usize = XA_FORMAT + 4;
    /// XA branch qualifier length (4 bytes).
    pub const XA_BQUAL_LEN: usize = XA_TRID_LEN + 4;
    /// XA data.
    pub const XA_XID: usize = XA_BQUAL_LEN + 4;
    /// Header size with the XA area.
    pub const XA_HDR_SIZE: usize = XA_XID + super::XIDDATASIZE;
}

/// Rollback segment header.
pub mod rseg_hdr {
    use super::{fil, flst_fmt, fseg_fmt};

    /// Start of the header.
    pub const BASE: usize = fil::PAGE_DATA;
    /// Size cap in pages (4 bytes).
    pub const MAX_SIZE: usize = 0;
    /// Pages held by logs in history (4 bytes).
    pub const HISTORY_SIZE: usize = 4;
    /// History list base node.
    pub const HISTORY: usize = 8;
    /// File segment header.
    pub const FSEG_HEADER: usize = HISTORY + flst_fmt::BASE_NODE_SIZE;
    /// Undo slot array.
    pub const UNDO_SLOTS: usize = FSEG_HEADER + fseg_fmt::HEADER_SIZE;
    /// Size of one slot.
    pub const SLOT_SIZE: usize = 4;
}

/// Maximum XA data length.
pub const XIDDATASIZE: usize = 128;
/// First byte after the segment header on a segment's first page.
pub const HEADER_REGION_END: usize = seg_hdr::BASE + seg_hdr::SIZE;
/// First record byte on pages that carry no segment header.
pub const PAGE_RECORDS_START: usize = page_hdr::BASE + page_hdr::SIZE;
/// Space kept free past a new log header's XA area.
pub const HEADER_CREATE_MARGIN: usize = 100;

/// Fixed-width field width.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Width {
    /// One byte.
    B1,
    /// Two bytes.
    B2,
    /// Four bytes.
    B4,
    /// Eight bytes.
    B8,
}

/// Every fixed-width header field written by the undo layer.
///
/// Log-header variants carry the header's offset on its page.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum UndoField {
    /// FIL page type.
    FilPageType,
    /// Undo page kind.
    PageType,
    /// Undo page start.
    PageStart,
    /// Undo page free.
    PageFree,
    /// Segment state.
    SegState,
    /// Latest log header offset.
    SegLastLog,
    /// Log trx id.
    LogTrxId(u16),
    /// Log trx no.
    LogTrxNo(u16),
    /// Log delete-marks flag.
    LogDelMarks(u16),
    /// Log first record offset.
    LogStart(u16),
    /// Log XID flag.
    LogXidExists(u16),
    /// Log dictionary flag.
    LogDictTrans(u16),
    /// Log table id.
    LogTableId(u16),
    /// Next log header offset.
    LogNextLog(u16),
    /// Previous log header offset.
    LogPrevLog(u16),
    /// XA format id.
    LogXaFormat(u16),
    /// XA gtrid length.
    LogXaTridLen(u16),
    /// XA bqual length.
    LogXaBqualLen(u16),
    /// Rollback segment size cap.
    RsegMaxSize,
    /// Rollback segment history size.
    RsegHistorySize,
    /// Rollback segment slot.
    RsegSlot(usize),
}

impl UndoField {
    /// Absolute byte offset on the page.
    pub const fn offset(self) -> usize {
        match self {
            UndoField::FilPageType => fil::PAGE_TYPE,
            UndoField::PageType => page_hdr::BASE + page_hdr::TYPE,
            UndoField::PageStart => page_hdr::BASE + page_hdr::START,
            UndoField::PageFree => page_hdr::BASE + page_hdr::FREE,
            UndoField::SegState => seg_hdr::BASE + seg_hdr::STATE,
            UndoField::SegLastLog => seg_hdr::BASE + seg_hdr::LAST_LOG,
            UndoField::LogTrxId(h) => h as usize + log_hdr::TRX_ID,
            UndoField::LogTrxNo(h) => h as usize + log_hdr::TRX_NO,
            UndoField::LogDelMarks(h) => h as usize + log_hdr::DEL_MARKS,
            UndoField::LogStart(h) => h as usize + log_hdr::LOG_START,
            UndoField::LogXidExists(h) => h as usize + log_hdr::XID_EXISTS,
            UndoField::LogDictTrans(h) => h as usize + log_hdr::DICT_TRANS,
            UndoField::LogTableId(h) => h as usize + log_hdr::TABLE_ID,
            UndoField::LogNextLog(h) => h as usize + log_hdr::NEXT_LOG,
            UndoField::LogPrevLog(h) => h as usize + log_hdr::PREV_LOG,
            UndoField::LogXaFormat(h) => h as usize + log_hdr::XA_FORMAT,
            UndoField::LogXaTridLen(h) => h as usize + log_hdr::XA_TRID_LEN,
            UndoField::LogXaBqualLen(h) => h as usize + log_hdr::XA_BQUAL_LEN,
            UndoField::RsegMaxSize => rseg_hdr::BASE + rseg_hdr::MAX_SIZE,
            UndoField::RsegHistorySize => rseg_hdr::BASE + rseg_hdr::HISTORY_SIZE,
            UndoField::RsegSlot(n) => rseg_hdr::BASE + rseg_hdr::UNDO_SLOTS + n * rseg_hdr::SLOT_SIZE,
        }
    }

    /// Field width.
    pub const fn width(self) -> Width {
        match self {
            UndoField::LogXidExists(_) | UndoField::LogDictTrans(_) => Width::B1,
            UndoField::FilPageType
            | UndoField::PageType
            | UndoField::PageStart
            | UndoField::PageFree
            | UndoField::SegState
            | UndoField::SegLastLog
            | UndoField::LogDelMarks(_)
            | UndoField::LogStart(_)
            | UndoField::LogNextLog(_)
            | UndoField::LogPrevLog(_) => Width::B2,
            UndoField::LogXaFormat(_)
            | UndoField::LogXaTridLen(_)
            | UndoField::LogXaBqualLen(_)
            | UndoField::RsegMaxSize
            | UndoField::RsegHistorySize
            | UndoField::RsegSlot(_) => Width::B4,
            UndoField::LogTrxId(_) | UndoField::LogTrxNo(_) | UndoField::LogTableId(_) => {
                Width::B8
            }
        }
    }
}

/// Reads a field from a page image.
pub fn get(page: &[u8], field: UndoField) -> u64 {
    let off = field.offset();
    match field.width() {
        Width::B1 => mach::read_u8(page, off) as u64,
        Width::B2 => mach::read_u16(page, off) as u64,
        Width::B4 => mach::read_u32(page, off) as u64,
        Width::B8 => mach::read_u64(page, off),
    }
}

/// Writes a field into a page image without logging. Only for replay routines.
pub(crate) fn set(page: &mut [u8], field: UndoField, value: u64) {
    let off = field.offset();
    match field.width() {
        Width::B1 => mach::write_u8(page, off, value as u8),
        Width::B2 => mach::write_u16(page, off, value as u16),
        Width::B4 => mach::write_u32(page, off, value as u32),
        Width::B8 => mach::write_u64(page, off, value),
    }
}

/// Reads a field from a page latched by `mtr`.
pub fn read(mtr: &Mtr<'_>, addr: PageAddr, field: UndoField) -> u64 {
    get(mtr.page(addr), field)
}

/// Writes and logs a field on a page latched exclusively by `mtr`.
pub fn write(mtr: &mut Mtr<'_>, addr: PageAddr, field: UndoField, value: u64) {
    let off = field.offset();
    match field.width() {
        Width::B1 => mtr.write_u8(addr, off, value as u8),
        Width::B2 => mtr.write_u16(addr, off, value as u16),
        Width::B4 => mtr.write_u32(addr, off, value as u32),
        Width::B8 => mtr.write_u64(addr, off, value),
    }
}

/// Writes and logs the XA data blob of a log header.
pub fn write_xa_data(mtr: &mut Mtr<'_>, addr: PageAddr, hdr: u16, data: &[u8; XIDDATASIZE]) {
    mtr.write_bytes(addr, hdr as usize + log_hdr::XA_XID, data);
}

/// Where a file segment header lives on its page.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FsegAt {
    /// In an undo segment header.
    UndoSegment,
    /// In a rollback segment header.
    RollbackSegment,
}

impl FsegAt {
    const fn offset(self) -> usize {
        match self {
            FsegAt::UndoSegment => seg_hdr::BASE + seg_hdr::FSEG_HEADER,
            FsegAt::RollbackSegment => rseg_hdr::BASE + rseg_hdr::FSEG_HEADER,
        }
    }
}

/// Writes and logs a file segment header.
pub fn write_fseg_header(mtr: &mut Mtr<'_>, addr: PageAddr, at: FsegAt, fseg: FsegRef) {
    let base = at.offset();
    mtr.write_u32(addr, base + fseg_fmt::HDR_SPACE, fseg.space.0);
    mtr.write_u32(addr, base + fseg_fmt::HDR_PAGE_NO, fseg.id);
    mtr.write_u16(addr, base + fseg_fmt::HDR_OFFSET, 0);
}

/// Decodes a file segment header.
pub fn read_fseg_header(page: &[u8], at: FsegAt) -> FsegRef {
    let base = at.offset();
    FsegRef {
        space: SpaceId(mach::read_u32(page, base + fseg_fmt::HDR_SPACE)),
        id: mach::read_u32(page, base + fseg_fmt::HDR_PAGE_NO),
    }
}

/// Durable list base nodes.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ListBaseAt {
    /// A segment's page list, on its first page.
    SegPageList,
    /// A rollback segment's history list.
    RsegHistory,
}

impl ListBaseAt {
    /// Absolute offset of the base node.
    pub const fn offset(self) -> usize {
        match self {
            ListBaseAt::SegPageList => seg_hdr::BASE + seg_hdr::PAGE_LIST,
            ListBaseAt::RsegHistory => rseg_hdr::BASE + rseg_hdr::HISTORY,
        }
    }
}

/// Durable list nodes.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ListNodeAt {
    /// An undo page's node in its segment's page list.
    UndoPage,
    /// A log header's node in the history list.
    LogHistory(u16),
}

impl ListNodeAt {
    /// Absolute offset of the node.
    pub const fn offset(self) -> usize {
        match self {
            ListNodeAt::UndoPage => page_hdr::BASE + page_hdr::NODE,
            ListNodeAt::LogHistory(h) => h as usize + log_hdr::HISTORY_NODE,
        }
    }
}

/// Log header offset owning a history node at `boffset`.
pub const fn log_hdr_of_history_node(boffset: u16) -> u16 {
    boffset - log_hdr::HISTORY_NODE as u16
}

/// Last byte offset usable by records on a page.
pub const fn page_records_limit(page_size: usize) -> usize {
    page_size - fil::PAGE_DATA_END
}

fn read_addr(page: &[u8], off: usize) -> FilAddr {
    FilAddr::new(
        PageNo(mach::read_u32(page, off + flst_fmt::ADDR_PAGE)),
        mach::read_u16(page, off + flst_fmt::ADDR_BYTE),
    )
}

/// Read-only view of an undo page header.
#[derive(Clone, Copy)]
pub struct UndoPageView<'a> {
    page: &'a [u8],
}

impl<'a> UndoPageView<'a> {
    /// Wraps a page image.
    pub fn new(page: &'a [u8]) -> Self {
        Self { page }
    }

    /// Undo kind stored in the header.
    pub fn kind(&self) -> Result<UndoKind> {
        UndoKind::try_from(get(self.page, UndoField::PageType) as u16)
    }

    /// Start offset of the latest log's records on this page.
    pub fn start(&self) -> u16 {
        get(self.page, UndoField::PageStart) as u16
    }

    /// First free byte.
    pub fn free(&self) -> u16 {
        get(self.page, UndoField::PageFree) as u16
    }

    /// Previous page in the segment's page list.
    pub fn prev_page(&self) -> FilAddr {
        read_addr(self.page, ListNodeAt::UndoPage.offset() + flst_fmt::NODE_PREV)
    }

    /// Next page in the segment's page list.
    pub fn next_page(&self) -> FilAddr {
        read_addr(self.page, ListNodeAt::UndoPage.offset() + flst_fmt::NODE_NEXT)
    }

    /// Checks `start <= free <= page_size` and the page type.
    pub fn validate(&self) -> Result<()> {
        self.validate_bounds()?;
        if self.start() > self.free() {
            return Err(UndoError::Corruption("undo page start/free out of order"));
        }
        Ok(())
    }

    /// Checks `free <= page_size` and the page type. A header page whose only
    /// log was discarded keeps a stale start, so only this much applies to it.
    pub fn validate_bounds(&self) -> Result<()> {
        self.kind()?;
        if self.free() as usize > self.page.len() {
            return Err(UndoError::Corruption("undo page free beyond page end"));
        }
        if get(self.page, UndoField::FilPageType) as u16 != fil::TYPE_UNDO_LOG {
            return Err(UndoError::Corruption("page is not an undo log page"));
        }
        Ok(())
    }
}

/// Read-only view of an undo segment header.
#[derive(Clone, Copy)]
pub struct SegHeaderView<'a> {
    page: &'a [u8],
}

impl<'a> SegHeaderView<'a> {
    /// Wraps a segment's first page.
    pub fn new(page: &'a [u8]) -> Self {
        Self { page }
    }

    /// Durable segment state.
    pub fn state(&self) -> Result<UndoState> {
        UndoState::try_from(get(self.page, UndoField::SegState) as u16)
    }

    /// Offset of the latest log header, 0 if none.
    pub fn last_log(&self) -> u16 {
        get(self.page, UndoField::SegLastLog) as u16
    }

    /// File segment owning the pages.
    pub fn fseg(&self) -> FsegRef {
        read_fseg_header(self.page, FsegAt::UndoSegment)
    }

    /// Number of pages in the segment.
    pub fn page_list_len(&self) -> u32 {
        mach::read_u32(
            self.page,
            ListBaseAt::SegPageList.offset() + flst_fmt::BASE_LEN,
        )
    }

    /// Last page of the segment.
    pub fn page_list_last(&self) -> FilAddr {
        read_addr(
            self.page,
            ListBaseAt::SegPageList.offset() + flst_fmt::BASE_LAST,
        )
    }
}

/// Read-only view of one log header.
#[derive(Clone, Copy)]
pub struct LogHeaderView<'a> {
    page: &'a [u8],
    offset: u16,
}

impl<'a> LogHeaderView<'a> {
    /// Wraps the header at `offset`.
    pub fn new(page: &'a [u8], offset: u16) -> Self {
        Self { page, offset }
    }

    /// Header offset on the page.
    pub fn offset(&self) -> u16 {
        self.offset
    }

    /// Creating transaction.
    pub fn trx_id(&self) -> TrxId {
        get(self.page, UndoField::LogTrxId(self.offset))
    }

    /// Commit number.
    pub fn trx_no(&self) -> TrxNo {
        get(self.page, UndoField::LogTrxNo(self.offset))
    }

    /// Delete-marks flag.
    pub fn del_marks(&self) -> bool {
        get(self.page, UndoField::LogDelMarks(self.offset)) != 0
    }

    /// First record offset.
    pub fn log_start(&self) -> u16 {
        get(self.page, UndoField::LogStart(self.offset)) as u16
    }

    /// XID present flag.
    pub fn xid_exists(&self) -> bool {
        get(self.page, UndoField::LogXidExists(self.offset)) != 0
    }

    /// Dictionary operation flag.
    pub fn dict_trans(&self) -> bool {
        get(self.page, UndoField::LogDictTrans(self.offset)) != 0
    }

    /// Table of a dictionary operation.
    pub fn table_id(&self) -> TableId {
        get(self.page, UndoField::LogTableId(self.offset))
    }

    /// Next log header on the page, 0 if this is the latest.
    pub fn next_log(&self) -> u16 {
        get(self.page, UndoField::LogNextLog(self.offset)) as u16
    }

    /// Previous log header on the page, 0 if this is the oldest.
    pub fn prev_log(&self) -> u16 {
        get(self.page, UndoField::LogPrevLog(self.offset)) as u16
    }

    /// Previous (newer) entry of the history list.
    pub fn history_prev(&self) -> FilAddr {
        read_addr(
            self.page,
            ListNodeAt::LogHistory(self.offset).offset() + flst_fmt::NODE_PREV,
        )
    }

    /// Next (older) entry of the history list.
    pub fn history_next(&self) -> FilAddr {
        read_addr(
            self.page,
            ListNodeAt::LogHistory(self.offset).offset() + flst_fmt::NODE_NEXT,
        )
    }

    /// Decodes the XA area. Meaningful only when [`Self::xid_exists`].
    pub fn xid(&self) -> Result<Xid> {
        let format_id = get(self.page, UndoField::LogXaFormat(self.offset)) as u32 as i32;
        let gtrid_length = get(self.page, UndoField::LogXaTridLen(self.offset)) as u32;
        let bqual_length = get(self.page, UndoField::LogXaBqualLen(self.offset)) as u32;
        let start = self.offset as usize + log_hdr::XA_XID;
        let mut data = [0u8; XIDDATASIZE];
        data.copy_from_slice(&self.page[start..start + XIDDATASIZE]);
        Xid::from_parts(format_id, gtrid_length, bqual_length, data)
    }
}

/// Read-only view of a rollback segment header.
#[derive(Clone, Copy)]
pub struct RsegHeaderView<'a> {
    page: &'a [u8],
}

impl<'a> RsegHeaderView<'a> {
    /// Wraps a rollback segment header page.
    pub fn new(page: &'a [u8]) -> Self {
        Self { page }
    }

    /// Size cap in pages.
    pub fn max_size(&self) -> u32 {
        get(self.page, UndoField::RsegMaxSize) as u32
    }

    /// Pages held by logs in history.
    pub fn history_size(&self) -> u32 {
        get(self.page, UndoField::RsegHistorySize) as u32
    }

    /// Number of entries in the history list.
    pub fn history_len(&self) -> u32 {
        mach::read_u32(
            self.page,
            ListBaseAt::RsegHistory.offset() + flst_fmt::BASE_LEN,
        )
    }

    /// Newest history entry.
    pub fn history_first(&self) -> FilAddr {
        read_addr(
            self.page,
            ListBaseAt::RsegHistory.offset() + flst_fmt::BASE_FIRST,
        )
    }

    /// Oldest history entry.
    pub fn history_last(&self) -> FilAddr {
        read_addr(
            self.page,
            ListBaseAt::RsegHistory.offset() + flst_fmt::BASE_LAST,
        )
    }

    /// Header page of the segment in slot `n`, [`PageNo::NULL`] when free.
    pub fn slot(&self, n: usize) -> PageNo {
        PageNo(get(self.page, UndoField::RsegSlot(n)) as u32)
    }

    /// File segment of the rollback segment header.
    pub fn fseg(&self) -> FsegRef {
        read_fseg_header(self.page, FsegAt::RollbackSegment)
    }
}
