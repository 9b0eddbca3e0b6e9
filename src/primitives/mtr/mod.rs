#![forbid(unsafe_code)]
//! Mini-transactions: bounded, atomic groups of page mutations.
//!
//! An [`Mtr`] latches pages into its memo, mutates them, and collects one
//! redo record per mutation. `commit` appends the records to the redo log as
//! a single group and releases the latches. Dropping an uncommitted `Mtr`
//! restores every page image it modified before releasing its latches.

use smallvec::SmallVec;
use tracing::{debug, trace};

use crate::primitives::bytes::mach;
use crate::primitives::pager::{stamp_identity, BufferPool, LatchMode, PageLatch};
use crate::primitives::wal::{RedoLog, RedoRecord};
use crate::types::{Lsn, PageAddr, Result};

/// Whether committed mutations produce redo.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LogMode {
    /// Every mutation is logged.
    All,
    /// Mutations are applied but never logged (temporary or rebuilt data).
    NoRedo,
}

struct MemoSlot {
    addr: PageAddr,
    latch: PageLatch,
    before: Option<Box<[u8]>>,
}

/// A mini-transaction over a [`BufferPool`].
pub struct Mtr<'a> {
    pool: &'a BufferPool,
    redo: &'a RedoLog,
    log_mode: LogMode,
    memo: SmallVec<[MemoSlot; 4]>,
    records: Vec<RedoRecord>,
    committed: bool,
}

impl<'a> Mtr<'a> {
    /// Starts a mini-transaction.
    pub fn start(pool: &'a BufferPool, redo: &'a RedoLog) -> Self {
        Self {
            pool,
            redo,
            log_mode: LogMode::All,
            memo: SmallVec::new(),
            records: Vec::new(),
            committed: false,
        }
    }

    /// Disables redo for the rest of this mini-transaction.
    pub fn set_no_redo(&mut self) {
        self.log_mode = LogMode::NoRedo;
    }

    /// Current log mode.
    pub fn log_mode(&self) -> LogMode {
        self.log_mode
    }

    /// Page cache the mini-transaction operates on.
    pub fn pool(&self) -> &'a BufferPool {
        self.pool
    }

    /// Page size of the underlying cache.
    pub fn page_size(&self) -> usize {
        self.pool.page_size()
    }

    /// Latches a page. Re-latching a page already in the memo is a no-op.
    ///
    /// # Panics
    /// Panics when asked to upgrade a shared latch to exclusive.
    pub fn latch(&mut self, addr: PageAddr, mode: LatchMode) -> Result<()> {
        if let Some(slot) = self.memo.iter().find(|slot| slot.addr == addr) {
            assert!(
                !(mode == LatchMode::Exclusive && slot.latch.mode() == LatchMode::Shared),
                "page {addr} latched shared, cannot upgrade to exclusive"
            );
            return Ok(());
        }
        let latch = self.pool.latch(addr, mode)?;
        self.memo.push(MemoSlot {
            addr,
            latch,
            before: None,
        });
        Ok(())
    }

    /// Returns true when the page is in the memo.
    pub fn is_latched(&self, addr: PageAddr) -> bool {
        self.memo.iter().any(|slot| slot.addr == addr)
    }

    /// Returns a latched page image.
    ///
    /// # Panics
    /// Panics when the page is not latched by this mini-transaction.
    pub fn page(&self, addr: PageAddr) -> &[u8] {
        self.memo
            .iter()
            .find(|slot| slot.addr == addr)
            .unwrap_or_else(|| panic!("page {addr} not latched by this mini-transaction"))
            .latch
            .data()
    }

    fn page_mut(&mut self, addr: PageAddr) -> &mut [u8] {
        let slot = self
            .memo
            .iter_mut()
            .find(|slot| slot.addr == addr)
            .unwrap_or_else(|| panic!("page {addr} not latched by this mini-transaction"));
        assert_eq!(
            slot.latch.mode(),
            LatchMode::Exclusive,
            "page {addr} written under a shared latch"
        );
        if slot.before.is_none() {
            slot.before = Some(slot.latch.data().to_vec().into_boxed_slice());
        }
        slot.latch.data_mut()
    }

    fn log(&mut self, record: RedoRecord) {
        if self.log_mode == LogMode::All {
            trace!(page = %record.page(), kind = ?record.kind(), "mtr.log");
            self.records.push(record);
        }
    }

    /// Reads a u8 from a latched page.
    pub fn read_u8(&self, addr: PageAddr, offset: usize) -> u8 {
        mach::read_u8(self.page(addr), offset)
    }

    /// Reads a u16 from a latched page.
    pub fn read_u16(&self, addr: PageAddr, offset: usize) -> u16 {
        mach::read_u16(self.page(addr), offset)
    }

    /// Reads a u32 from a latched page.
    pub fn read_u32(&self, addr: PageAddr, offset: usize) -> u32 {
        mach::read_u32(self.page(addr), offset)
    }

    /// Reads a u64 from a latched page.
    pub fn read_u64(&self, addr: PageAddr, offset: usize) -> u64 {
        mach::read_u64(self.page(addr), offset)
    }

    /// Writes and logs a u8.
    pub fn write_u8(&mut self, addr: PageAddr, offset: usize, value: u8) {
        mach::write_u8(self.page_mut(addr), offset, value);
        self.log(RedoRecord::Write1 {
            page: addr,
            offset: offset as u16,
            value,
        });
    }

    /// Writes and logs a u16.
    pub fn write_u16(&mut self, addr: PageAddr, offset: usize, value: u16) {
        mach::write_u16(self.page_mut(addr), offset, value);
        self.log(RedoRecord::Write2 {
            page: addr,
            offset: offset as u16,
            value,
        });
    }

    /// Writes and logs a u32.
    pub fn write_u32(&mut self, addr: PageAddr, offset: usize, value: u32) {
        mach::write_u32(self.page_mut(addr), offset, value);
        self.log(RedoRecord::Write4 {
            page: addr,
            offset: offset as u16,
            value,
        });
    }

    /// Writes and logs a u64.
    pub fn write_u64(&mut self, addr: PageAddr, offset: usize, value: u64) {
        mach::write_u64(self.page_mut(addr), offset, value);
        self.log(RedoRecord::Write8 {
            page: addr,
            offset: offset as u16,
            value,
        });
    }

    /// Writes and logs a byte string.
    pub fn write_bytes(&mut self, addr: PageAddr, offset: usize, bytes: &[u8]) {
        self.page_mut(addr)[offset..offset + bytes.len()].copy_from_slice(bytes);
        self.log(RedoRecord::WriteString {
            page: addr,
            offset: offset as u16,
            bytes: bytes.to_vec(),
        });
    }

    /// Makes a page resident, latches it exclusively, zeroes it and logs the init.
    pub fn init_file_page(&mut self, addr: PageAddr) -> Result<()> {
        self.pool.create(addr);
        self.latch(addr, LatchMode::Exclusive)?;
        stamp_identity(self.page_mut(addr), addr);
        self.log(RedoRecord::InitFilePage { page: addr });
        Ok(())
    }

    /// Applies a composite page mutation and logs it as one typed record.
    ///
    /// `apply` must be the same routine recovery runs for `record`.
    pub fn apply_logged<T>(
        &mut self,
        record: RedoRecord,
        apply: impl FnOnce(&mut [u8]) -> T,
    ) -> T {
        let out = apply(self.page_mut(record.page()));
        self.log(record);
        out
    }

    /// Commits: appends the redo group and releases latches.
    ///
    /// Returns the group's LSN, or `None` when nothing was logged.
    pub fn commit(mut self) -> Option<Lsn> {
        self.committed = true;
        let records = std::mem::take(&mut self.records);
        if records.is_empty() {
            return None;
        }
        Some(self.redo.append_group(&records))
    }
}

impl Drop for Mtr<'_> {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        let mut restored = 0usize;
        for slot in self.memo.iter_mut() {
            if let Some(before) = slot.before.take() {
                slot.latch.data_mut().copy_from_slice(&before);
                restored += 1;
            }
        }
        if restored > 0 {
            debug!(pages = restored, "mtr.rollback");
        }
    }
}
