#![forbid(unsafe_code)]
//! Logical redo log: typed page records grouped per committed mini-transaction.
//!
//! A group is framed as `len:u32 | crc32:u32 | payload`, where the checksum
//! covers the group's start LSN and payload. Each record in the payload is
//! `type:u8 | space:varint | page:varint | body`.

use std::fmt;

use parking_lot::Mutex;
use tracing::debug;

use crate::primitives::bytes::{buf::Cursor, var};
use crate::types::{
    redo_crc32, verify_redo_crc32, Lsn, PageAddr, PageNo, Result, SpaceId, TrxId, UndoError,
};

const GROUP_HEADER_LEN: usize = 8;

/// Tag byte of each redo record kind.
#[repr(u8)]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum RedoType {
    /// One-byte field write.
    Write1 = 1,
    /// Two-byte field write.
    Write2 = 2,
    /// Four-byte field write.
    Write4 = 4,
    /// Eight-byte field write.
    Write8 = 8,
    /// Undo record appended at the page's free offset.
    UndoInsert = 20,
    /// Undo page initialized with a kind.
    UndoInit = 22,
    /// Latest log header discarded.
    UndoHdrDiscard = 23,
    /// Insert-undo header reused in place.
    UndoHdrReuse = 24,
    /// New log header created at the page's free offset.
    UndoHdrCreate = 25,
    /// Whole file page zeroed and stamped.
    InitFilePage = 29,
    /// Byte string written at an offset.
    WriteString = 30,
}

impl TryFrom<u8> for RedoType {
    type Error = UndoError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(RedoType::Write1),
            2 => Ok(RedoType::Write2),
            4 => Ok(RedoType::Write4),
            8 => Ok(RedoType::Write8),
            20 => Ok(RedoType::UndoInsert),
            22 => Ok(RedoType::UndoInit),
            23 => Ok(RedoType::UndoHdrDiscard),
            24 => Ok(RedoType::UndoHdrReuse),
            25 => Ok(RedoType::UndoHdrCreate),
            29 => Ok(RedoType::InitFilePage),
            30 => Ok(RedoType::WriteString),
            _ => Err(UndoError::Corruption("unknown redo record type")),
        }
    }
}

/// One page-level redo record.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum RedoRecord {
    /// `page[offset] = value`.
    Write1 {
        /// Target page.
        page: PageAddr,
        /// Byte offset.
        offset: u16,
        /// Value written.
        value: u8,
    },
    /// Big-endian u16 write.
    Write2 {
        /// Target page.
        page: PageAddr,
        /// Byte offset.
        offset: u16,
        /// Value written.
        value: u16,
    },
    /// Big-endian u32 write.
    Write4 {
        /// Target page.
        page: PageAddr,
        /// Byte offset.
        offset: u16,
        /// Value written.
        value: u32,
    },
    /// Big-endian u64 write.
    Write8 {
        /// Target page.
        page: PageAddr,
        /// Byte offset.
        offset: u16,
        /// Value written.
        value: u64,
    },
    /// Raw byte string write.
    WriteString {
        /// Target page.
        page: PageAddr,
        /// Byte offset.
        offset: u16,
        /// Bytes written.
        bytes: Vec<u8>,
    },
    /// Zero the page and stamp its identity.
    InitFilePage {
        /// Target page.
        page: PageAddr,
    },
    /// Initialize an undo page of the given kind.
    UndoInit {
        /// Target page.
        page: PageAddr,
        /// Undo kind tag.
        kind: u16,
    },
    /// Create a log header at the page's free offset.
    UndoHdrCreate {
        /// Segment header page.
        page: PageAddr,
        /// Owning transaction.
        trx_id: TrxId,
    },
    /// Reuse the single insert-undo header of the page.
    UndoHdrReuse {
        /// Segment header page.
        page: PageAddr,
        /// Owning transaction.
        trx_id: TrxId,
    },
    /// Discard the latest log header of the page.
    UndoHdrDiscard {
        /// Segment header page.
        page: PageAddr,
    },
    /// Append a framed undo record at the page's free offset.
    UndoInsert {
        /// Target page.
        page: PageAddr,
        /// Record body without its trailing and leading offsets.
        body: Vec<u8>,
    },
}

impl RedoRecord {
    /// Page the record applies to.
    pub fn page(&self) -> PageAddr {
        match self {
            RedoRecord::Write1 { page, .. }
            | RedoRecord::Write2 { page, .. }
            | RedoRecord::Write4 { page, .. }
            | RedoRecord::Write8 { page, .. }
            | RedoRecord::WriteString { page, .. }
            | RedoRecord::InitFilePage { page }
            | RedoRecord::UndoInit { page, .. }
            | RedoRecord::UndoHdrCreate { page, .. }
            | RedoRecord::UndoHdrReuse { page, .. }
            | RedoRecord::UndoHdrDiscard { page }
            | RedoRecord::UndoInsert { page, .. } => *page,
        }
    }

    /// Record tag.
    pub fn kind(&self) -> RedoType {
        match self {
            RedoRecord::Write1 { .. } => RedoType::Write1,
            RedoRecord::Write2 { .. } => RedoType::Write2,
            RedoRecord::Write4 { .. } => RedoType::Write4,
            RedoRecord::Write8 { .. } => RedoType::Write8,
            RedoRecord::WriteString { .. } => RedoType::WriteString,
            RedoRecord::InitFilePage { .. } => RedoType::InitFilePage,
            RedoRecord::UndoInit { .. } => RedoType::UndoInit,
            RedoRecord::UndoHdrCreate { .. } => RedoType::UndoHdrCreate,
            RedoRecord::UndoHdrReuse { .. } => RedoType::UndoHdrReuse,
            RedoRecord::UndoHdrDiscard { .. } => RedoType::UndoHdrDiscard,
            RedoRecord::UndoInsert { .. } => RedoType::UndoInsert,
        }
    }

    /// Appends the encoded record to `out`.
    pub fn encode(&self, out: &mut Vec<u8>) {
        let page = self.page();
        out.push(self.kind() as u8);
        var::encode_u64(page.space.0 as u64, out);
        var::encode_u64(page.page_no.0 as u64, out);
        match self {
            RedoRecord::Write1 { offset, value, .. } => {
                out.extend_from_slice(&offset.to_be_bytes());
                out.push(*value);
            }
            RedoRecord::Write2 { offset, value, .. } => {
                out.extend_from_slice(&offset.to_be_bytes());
                var::encode_u64(*value as u64, out);
            }
            RedoRecord::Write4 { offset, value, .. } => {
                out.extend_from_slice(&offset.to_be_bytes());
                var::encode_u64(*value as u64, out);
            }
            RedoRecord::Write8 { offset, value, .. } => {
                out.extend_from_slice(&offset.to_be_bytes());
                var::encode_u64(*value, out);
            }
            RedoRecord::WriteString { offset, bytes, .. } => {
                out.extend_from_slice(&offset.to_be_bytes());
                out.extend_from_slice(&(bytes.len() as u16).to_be_bytes());
                out.extend_from_slice(bytes);
            }
            RedoRecord::UndoInit { kind, .. } => var::encode_u64(*kind as u64, out),
            RedoRecord::UndoHdrCreate { trx_id, .. } | RedoRecord::UndoHdrReuse { trx_id, .. } => {
                var::encode_u64(*trx_id, out)
            }
            RedoRecord::UndoInsert { body, .. } => {
                out.extend_from_slice(&(body.len() as u16).to_be_bytes());
                out.extend_from_slice(body);
            }
            RedoRecord::InitFilePage { .. } | RedoRecord::UndoHdrDiscard { .. } => {}
        }
    }

    /// Parses one record from the cursor.
    pub fn decode(cur: &mut Cursor<'_>) -> Result<Self> {
        let kind = RedoType::try_from(cur.u8()?)?;
        let space = u32::try_from(cur.var_u64()?)
            .map_err(|_| UndoError::Corruption("redo space id out of range"))?;
        let page_no = u32::try_from(cur.var_u64()?)
            .map_err(|_| UndoError::Corruption("redo page number out of range"))?;
        let page = PageAddr::new(SpaceId(space), PageNo(page_no));
        let record = match kind {
            RedoType::Write1 => RedoRecord::Write1 {
                page,
                offset: cur.u16()?,
                value: cur.u8()?,
            },
            RedoType::Write2 => RedoRecord::Write2 {
                page,
                offset: cur.u16()?,
                value: narrow(cur.var_u64()?)?,
            },
            RedoType::Write4 => RedoRecord::Write4 {
                page,
                offset: cur.u16()?,
                value: narrow(cur.var_u64()?)?,
            },
            RedoType::Write8 => RedoRecord::Write8 {
                page,
                offset: cur.u16()?,
                value: cur.var_u64()?,
            },
            RedoType::WriteString => {
                let offset = cur.u16()?;
                let len = cur.u16()? as usize;
                RedoRecord::WriteString {
                    page,
                    offset,
                    bytes: cur.take(len)?.to_vec(),
                }
            }
            RedoType::InitFilePage => RedoRecord::InitFilePage { page },
            RedoType::UndoInit => RedoRecord::UndoInit {
                page,
                kind: narrow(cur.var_u64()?)?,
            },
            RedoType::UndoHdrCreate => RedoRecord::UndoHdrCreate {
                page,
                trx_id: cur.var_u64()?,
            },
            RedoType::UndoHdrReuse => RedoRecord::UndoHdrReuse {
                page,
                trx_id: cur.var_u64()?,
            },
            RedoType::UndoHdrDiscard => RedoRecord::UndoHdrDiscard { page },
            RedoType::UndoInsert => {
                let len = cur.u16()? as usize;
                RedoRecord::UndoInsert {
                    page,
                    body: cur.take(len)?.to_vec(),
                }
            }
        };
        Ok(record)
    }
}

fn narrow<T: TryFrom<u64>>(v: u64) -> Result<T> {
    T::try_from(v).map_err(|_| UndoError::Corruption("redo value exceeds field width"))
}

/// Records of one committed mini-transaction.
#[derive(Clone, Debug)]
pub struct RedoGroup {
    /// LSN at which the group starts.
    pub start_lsn: Lsn,
    /// Records in write order.
    pub records: Vec<RedoRecord>,
}

/// Counters describing appended redo.
#[derive(Clone, Debug, Default)]
pub struct RedoStats {
    /// Groups appended.
    pub groups: u64,
    /// Records appended.
    pub records: u64,
    /// Bytes appended including framing.
    pub bytes: u64,
}

struct RedoState {
    buf: Vec<u8>,
    base_lsn: Lsn,
    stats: RedoStats,
}

/// Append-only redo buffer shared by all mini-transactions.
pub struct RedoLog {
    state: Mutex<RedoState>,
}

impl RedoLog {
    /// Creates an empty log starting at `start_lsn`.
    pub fn new(start_lsn: Lsn) -> Self {
        Self {
            state: Mutex::new(RedoState {
                buf: Vec::new(),
                base_lsn: start_lsn,
                stats: RedoStats::default(),
            }),
        }
    }

    /// LSN the next group will be written at.
    pub fn current_lsn(&self) -> Lsn {
        let state = self.state.lock();
        Lsn(state.base_lsn.0 + state.buf.len() as u64)
    }

    /// Appends the records as one atomic group and returns its start LSN.
    pub fn append_group(&self, records: &[RedoRecord]) -> Lsn {
        let mut payload = Vec::new();
        for record in records {
            record.encode(&mut payload);
        }
        let mut state = self.state.lock();
        let start = Lsn(state.base_lsn.0 + state.buf.len() as u64);
        let crc = redo_crc32(start.0, &payload);
        state
            .buf
            .extend_from_slice(&(payload.len() as u32).to_be_bytes());
        state.buf.extend_from_slice(&crc.to_be_bytes());
        state.buf.extend_from_slice(&payload);
        state.stats.groups += 1;
        state.stats.records += records.len() as u64;
        state.stats.bytes += (GROUP_HEADER_LEN + payload.len()) as u64;
        debug!(
            lsn = start.0,
            records = records.len(),
            bytes = payload.len(),
            "redo.append_group"
        );
        start
    }

    /// Decodes every group, verifying checksums.
    pub fn groups(&self) -> Result<Vec<RedoGroup>> {
        let state = self.state.lock();
        decode_groups(&state.buf, state.base_lsn)
    }

    /// Copy of the raw log bytes.
    pub fn raw_bytes(&self) -> Vec<u8> {
        self.state.lock().buf.clone()
    }

    /// Snapshot of the append counters.
    pub fn stats(&self) -> RedoStats {
        self.state.lock().stats.clone()
    }
}

impl fmt::Debug for RedoLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("RedoLog")
            .field("base_lsn", &state.base_lsn)
            .field("len", &state.buf.len())
            .finish()
    }
}

/// Decodes framed groups from raw log bytes written from `base_lsn` on.
pub fn decode_groups(bytes: &[u8], base_lsn: Lsn) -> Result<Vec<RedoGroup>> {
    let mut groups = Vec::new();
    let mut cur = Cursor::new(bytes);
    while !cur.is_empty() {
        let start_lsn = Lsn(base_lsn.0 + cur.off as u64);
        let len = cur.u32()? as usize;
        let stored_crc = cur.u32()?;
        let payload = cur
            .take(len)
            .map_err(|_| UndoError::Corruption("redo group truncated"))?;
        if !verify_redo_crc32(start_lsn.0, payload, stored_crc) {
            return Err(UndoError::Corruption("redo group crc mismatch"));
        }
        let mut body = Cursor::new(payload);
        let mut records = Vec::new();
        while !body.is_empty() {
            records.push(RedoRecord::decode(&mut body)?);
        }
        groups.push(RedoGroup { start_lsn, records });
    }
    Ok(groups)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page(n: u32) -> PageAddr {
        PageAddr::new(SpaceId(4), PageNo(n))
    }

    #[test]
    fn groups_roundtrip_with_lsns() -> Result<()> {
        let log = RedoLog::new(Lsn(100));
        let first = vec![
            RedoRecord::InitFilePage { page: page(3) },
            RedoRecord::UndoInit {
                page: page(3),
                kind: 2,
            },
            RedoRecord::Write2 {
                page: page(3),
                offset: 56,
                value: 86,
            },
        ];
        let second = vec![
            RedoRecord::UndoHdrCreate {
                page: page(3),
                trx_id: 0x1_0000_0001,
            },
            RedoRecord::WriteString {
                page: page(3),
                offset: 144,
                bytes: b"xid".to_vec(),
            },
            RedoRecord::UndoInsert {
                page: page(7),
                body: vec![11, 0, 1, 2],
            },
        ];
        let lsn_a = log.append_group(&first);
        let lsn_b = log.append_group(&second);
        assert_eq!(lsn_a, Lsn(100));
        assert!(lsn_b > lsn_a);
        let groups = log.groups()?;
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].records, first);
        assert_eq!(groups[1].records, second);
        assert_eq!(groups[1].start_lsn, lsn_b);
        assert_eq!(log.stats().records, 6);
        Ok(())
    }

    #[test]
    fn flipped_byte_is_detected() {
        let log = RedoLog::new(Lsn(0));
        log.append_group(&[RedoRecord::Write8 {
            page: page(1),
            offset: 86,
            value: 42,
        }]);
        let mut raw = log.raw_bytes();
        let last = raw.len() - 1;
        raw[last] ^= 0xff;
        assert!(matches!(
            decode_groups(&raw, Lsn(0)),
            Err(UndoError::Corruption(_))
        ));
    }

    #[test]
    fn unknown_type_is_rejected() {
        let mut cur = Cursor::new(&[99, 0, 0]);
        assert!(RedoRecord::decode(&mut cur).is_err());
    }
}
