//! In-memory undo log handles and their lifecycle state machine.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::types::{PageNo, Result, SpaceId, TableId, TrxId, UndoError, UndoNo};

use super::layout::XIDDATASIZE;

/// Which change class a segment records.
#[repr(u16)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum UndoKind {
    /// Inserts only; discardable right after commit.
    Insert = 1,
    /// Updates and deletes; retained in history until purged.
    Update = 2,
}

impl TryFrom<u16> for UndoKind {
    type Error = UndoError;

    fn try_from(value: u16) -> Result<Self> {
        match value {
            1 => Ok(UndoKind::Insert),
            2 => Ok(UndoKind::Update),
            _ => Err(UndoError::Corruption("unknown undo page type")),
        }
    }
}

/// Durable segment state.
#[repr(u16)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum UndoState {
    /// Owned by a running transaction.
    Active = 1,
    /// One page, committed, kept for reuse.
    Cached = 2,
    /// Insert log committed; the segment is released at cleanup.
    ToFree = 3,
    /// Update log committed; the segment is released by purge.
    ToPurge = 4,
    /// Owned by an XA-prepared transaction.
    Prepared = 5,
}

impl TryFrom<u16> for UndoState {
    type Error = UndoError;

    fn try_from(value: u16) -> Result<Self> {
        match value {
            1 => Ok(UndoState::Active),
            2 => Ok(UndoState::Cached),
            3 => Ok(UndoState::ToFree),
            4 => Ok(UndoState::ToPurge),
            5 => Ok(UndoState::Prepared),
            _ => Err(UndoError::Corruption("unknown undo segment state")),
        }
    }
}

impl UndoState {
    /// Whether the lifecycle allows moving from `self` to `to`.
    pub const fn can_transition(self, to: UndoState) -> bool {
        use UndoState::*;
        matches!(
            (self, to),
            (Active, Prepared)
                | (Active, Cached)
                | (Active, ToFree)
                | (Active, ToPurge)
                | (Prepared, Active)
                | (Prepared, Cached)
                | (Prepared, ToFree)
                | (Prepared, ToPurge)
                | (Cached, Active)
        )
    }
}

/// X/Open XA transaction identifier.
#[derive(Clone, PartialEq, Eq)]
pub struct Xid {
    /// Format id; -1 marks a null XID.
    pub format_id: i32,
    /// Length of the global transaction id prefix of `data`.
    pub gtrid_length: u32,
    /// Length of the branch qualifier following the gtrid.
    pub bqual_length: u32,
    /// gtrid followed by bqual, zero padded.
    pub data: [u8; XIDDATASIZE],
}

impl Xid {
    /// Builds an XID from its components.
    pub fn new(format_id: i32, gtrid: &[u8], bqual: &[u8]) -> Result<Self> {
        if gtrid.len() > 64 || bqual.len() > 64 {
            return Err(UndoError::Invalid("xid component longer than 64 bytes"));
        }
        let mut data = [0u8; XIDDATASIZE];
        data[..gtrid.len()].copy_from_slice(gtrid);
        data[gtrid.len()..gtrid.len() + bqual.len()].copy_from_slice(bqual);
        Ok(Self {
            format_id,
            gtrid_length: gtrid.len() as u32,
            bqual_length: bqual.len() as u32,
            data,
        })
    }

    /// Rebuilds an XID read from a log header.
    pub fn from_parts(
        format_id: i32,
        gtrid_length: u32,
        bqual_length: u32,
        data: [u8; XIDDATASIZE],
    ) -> Result<Self> {
        if gtrid_length as usize + bqual_length as usize > XIDDATASIZE {
            return Err(UndoError::Corruption("xid lengths exceed data area"));
        }
        Ok(Self {
            format_id,
            gtrid_length,
            bqual_length,
            data,
        })
    }

    /// Global transaction id bytes.
    pub fn gtrid(&self) -> &[u8] {
        &self.data[..self.gtrid_length as usize]
    }

    /// Branch qualifier bytes.
    pub fn bqual(&self) -> &[u8] {
        let start = self.gtrid_length as usize;
        &self.data[start..start + self.bqual_length as usize]
    }
}

impl fmt::Debug for Xid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Xid")
            .field("format_id", &self.format_id)
            .field("gtrid", &String::from_utf8_lossy(self.gtrid()))
            .field("bqual", &String::from_utf8_lossy(self.bqual()))
            .finish()
    }
}

/// Dictionary operation a transaction performs, if any.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum DictOp {
    /// Ordinary transaction.
    #[default]
    None,
    /// Index creation or removal; recorded with table id 0.
    Index,
    /// Table-level operation on the given table.
    Table(TableId),
}

impl DictOp {
    /// Table id written into the log header.
    pub fn table_id(self) -> Option<TableId> {
        match self {
            DictOp::None => None,
            DictOp::Index => Some(0),
            DictOp::Table(id) => Some(id),
        }
    }
}

/// Key a transaction uses to address its undo log in a rollback segment.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct UndoRef {
    /// Slot id.
    pub id: usize,
    /// Log kind.
    pub kind: UndoKind,
}

/// In-memory handle of one undo segment and its latest log.
#[derive(Clone, Debug)]
pub struct UndoLog {
    /// Slot id in the rollback segment.
    pub id: usize,
    /// Change class.
    pub kind: UndoKind,
    /// Lifecycle state.
    pub state: UndoState,
    /// Owning transaction.
    pub trx_id: TrxId,
    /// XID once prepared, or carried from the transaction.
    pub xid: Option<Xid>,
    /// Whether the log belongs to a dictionary operation.
    pub dict_operation: bool,
    /// Table of the dictionary operation.
    pub table_id: TableId,
    /// Whether any record delete-marks a row.
    pub del_marks: bool,
    /// Tablespace of the segment.
    pub space: SpaceId,
    /// First page of the segment.
    pub hdr_page_no: PageNo,
    /// Offset of the latest log header on the first page.
    pub hdr_offset: u16,
    /// Last page of the segment.
    pub last_page_no: PageNo,
    /// Pages in the segment.
    pub size: u32,
    /// Whether the latest log holds no records.
    pub empty: bool,
    /// Page of the newest record.
    pub top_page_no: PageNo,
    /// Offset of the newest record.
    pub top_offset: u16,
    /// Undo number of the newest record.
    pub top_undo_no: UndoNo,
    /// Serializes work on this log's pages. Taken before the rollback
    /// segment mutex, never while holding it.
    pub(crate) op_lock: Arc<Mutex<()>>,
}

impl UndoLog {
    /// Handle for a freshly created segment.
    pub fn new(
        id: usize,
        kind: UndoKind,
        trx_id: TrxId,
        xid: Option<Xid>,
        space: SpaceId,
        page_no: PageNo,
        offset: u16,
    ) -> Self {
        Self {
            id,
            kind,
            state: UndoState::Active,
            trx_id,
            xid,
            dict_operation: false,
            table_id: 0,
            del_marks: false,
            space,
            hdr_page_no: page_no,
            hdr_offset: offset,
            last_page_no: page_no,
            size: 1,
            empty: true,
            top_page_no: page_no,
            top_offset: 0,
            top_undo_no: 0,
            op_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Resets a cached handle for a new owner.
    pub fn init_for_reuse(&mut self, trx_id: TrxId, xid: Option<Xid>, offset: u16) {
        assert_eq!(self.size, 1, "only one-page segments are reused");
        self.transition(UndoState::Active);
        self.trx_id = trx_id;
        self.xid = xid;
        self.dict_operation = false;
        self.table_id = 0;
        self.del_marks = false;
        self.hdr_offset = offset;
        self.empty = true;
        self.top_page_no = self.hdr_page_no;
        self.top_offset = 0;
        self.top_undo_no = 0;
    }

    /// Moves to `to`, enforcing the lifecycle table.
    ///
    /// # Panics
    /// Panics on a transition the lifecycle does not allow.
    pub fn transition(&mut self, to: UndoState) {
        assert!(
            self.state.can_transition(to),
            "illegal undo state transition {:?} -> {:?} for slot {}",
            self.state,
            to,
            self.id
        );
        self.state = to;
    }

    /// Key addressing this handle.
    pub fn undo_ref(&self) -> UndoRef {
        UndoRef {
            id: self.id,
            kind: self.kind,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle() -> UndoLog {
        UndoLog::new(3, UndoKind::Update, 42, None, SpaceId(1), PageNo(9), 86)
    }

    #[test]
    fn transition_table() {
        use UndoState::*;
        let all = [Active, Cached, ToFree, ToPurge, Prepared];
        let allowed: Vec<(UndoState, UndoState)> = all
            .iter()
            .flat_map(|a| all.iter().map(move |b| (*a, *b)))
            .filter(|(a, b)| a.can_transition(*b))
            .collect();
        assert_eq!(allowed.len(), 9);
        assert!(!ToFree.can_transition(Active) && !ToFree.can_transition(Cached));
        assert!(!Cached.can_transition(ToFree));
        assert!(!ToPurge.can_transition(Active));
    }

    #[test]
    #[should_panic(expected = "illegal undo state transition")]
    fn illegal_transition_panics() {
        let mut undo = handle();
        undo.transition(UndoState::ToPurge);
        undo.transition(UndoState::Active);
    }

    #[test]
    fn reuse_resets_fields() {
        let mut undo = handle();
        undo.dict_operation = true;
        undo.table_id = 11;
        undo.empty = false;
        undo.top_undo_no = 8;
        undo.transition(UndoState::Cached);
        undo.init_for_reuse(77, None, 318);
        assert_eq!(undo.state, UndoState::Active);
        assert_eq!(undo.trx_id, 77);
        assert!(!undo.dict_operation);
        assert!(undo.empty);
        assert_eq!(undo.hdr_offset, 318);
        assert_eq!(undo.top_undo_no, 0);
    }

    #[test]
    fn xid_components() -> Result<()> {
        let xid = Xid::new(1, b"global", b"branch")?;
        assert_eq!(xid.gtrid(), b"global");
        assert_eq!(xid.bqual(), b"branch");
        assert!(Xid::new(1, &[0u8; 65], b"").is_err());
        assert!(Xid::from_parts(1, 100, 100, [0u8; XIDDATASIZE]).is_err());
        Ok(())
    }

    #[test]
    fn codes_roundtrip_and_reject_unknown() {
        assert_eq!(UndoState::try_from(4).unwrap(), UndoState::ToPurge);
        assert!(UndoState::try_from(0).is_err());
        assert_eq!(UndoKind::try_from(2).unwrap(), UndoKind::Update);
        assert!(UndoKind::try_from(3).is_err());
    }
}
