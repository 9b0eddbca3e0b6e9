//! Redo replay for undo and rollback segment pages.
//!
//! Composite records run the same byte routines the live path ran through
//! [`Mtr::apply_logged`](crate::primitives::mtr::Mtr::apply_logged), so a
//! replayed page matches the page the logging mini-transaction produced.

use tracing::{debug, info};

use crate::primitives::bytes::mach;
use crate::primitives::pager::{stamp_identity, BufferPool, LatchMode};
use crate::primitives::wal::{RedoLog, RedoRecord, RedoType};
use crate::types::{Lsn, Result, UndoError};

use super::page;

/// What a replay pass did.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ReplayStats {
    /// Groups applied.
    pub groups: usize,
    /// Records applied.
    pub records: usize,
    /// Pages initialized from scratch.
    pub pages_initialized: usize,
    /// LSN just past the last applied group.
    pub end_lsn: Lsn,
}

/// Applies every group in `redo` to `pool`, in log order.
pub fn replay(redo: &RedoLog, pool: &BufferPool) -> Result<ReplayStats> {
    let mut stats = ReplayStats::default();
    for group in redo.groups()? {
        for record in &group.records {
            apply(pool, record)?;
            if record.kind() == RedoType::InitFilePage {
                stats.pages_initialized += 1;
            }
            stats.records += 1;
        }
        stats.groups += 1;
        debug!(lsn = group.start_lsn.0, records = group.records.len(), "recovery.group");
    }
    stats.end_lsn = redo.current_lsn();
    info!(
        groups = stats.groups,
        records = stats.records,
        end_lsn = stats.end_lsn.0,
        "recovery.replayed"
    );
    Ok(stats)
}

/// Applies one record to its page.
pub fn apply(pool: &BufferPool, record: &RedoRecord) -> Result<()> {
    let addr = record.page();
    if let RedoRecord::InitFilePage { .. } = record {
        pool.create(addr);
    }
    let mut latch = pool.latch(addr, LatchMode::Exclusive)?;
    let data = latch.data_mut();
    match record {
        RedoRecord::Write1 { offset, value, .. } => mach::write_u8(data, *offset as usize, *value),
        RedoRecord::Write2 { offset, value, .. } => {
            mach::write_u16(data, *offset as usize, *value)
        }
        RedoRecord::Write4 { offset, value, .. } => {
            mach::write_u32(data, *offset as usize, *value)
        }
        RedoRecord::Write8 { offset, value, .. } => {
            mach::write_u64(data, *offset as usize, *value)
        }
        RedoRecord::WriteString { offset, bytes, .. } => {
            let start = *offset as usize;
            let target = data
                .get_mut(start..start + bytes.len())
                .ok_or(UndoError::Corruption("redo string write past page end"))?;
            target.copy_from_slice(bytes);
        }
        RedoRecord::InitFilePage { .. } => stamp_identity(data, addr),
        RedoRecord::UndoInit { kind, .. } => page::apply_page_init(data, *kind),
        RedoRecord::UndoHdrCreate { trx_id, .. } => {
            page::apply_header_create(data, *trx_id)?;
        }
        RedoRecord::UndoHdrReuse { trx_id, .. } => {
            page::apply_header_reuse(data, *trx_id)?;
        }
        RedoRecord::UndoHdrDiscard { .. } => page::apply_discard_latest(data)?,
        RedoRecord::UndoInsert { body, .. } => {
            page::apply_record_insert(data, body)?;
        }
    }
    Ok(())
}
