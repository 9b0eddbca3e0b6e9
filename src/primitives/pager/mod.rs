#![forbid(unsafe_code)]
//! In-memory page cache with per-page reader/writer latches.

mod frame;

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use parking_lot::{
    lock_api::{ArcRwLockReadGuard, ArcRwLockWriteGuard},
    RawRwLock, RwLock,
};
use tracing::trace;

use crate::types::{PageAddr, PageNo, Result, SpaceId, UndoError};

pub(crate) use frame::stamp_identity;
use frame::Frame;

pub mod fil {
    //! Generic file page header shared by every page kind.

    /// Page number stamp (4 bytes).
    pub const PAGE_OFFSET: usize = 4;
    /// Page type (2 bytes).
    pub const PAGE_TYPE: usize = 24;
    /// Tablespace id stamp (4 bytes).
    pub const PAGE_SPACE_ID: usize = 34;
    /// First byte available to the page kind.
    pub const PAGE_DATA: usize = 38;
    /// Trailer reserved at the end of every page.
    pub const PAGE_DATA_END: usize = 8;

    /// Page type of undo log pages.
    pub const TYPE_UNDO_LOG: u16 = 2;
    /// Page type of system pages such as rollback segment headers.
    pub const TYPE_SYS: u16 = 6;
}

/// Latch mode requested when fetching a page.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LatchMode {
    /// Many readers may hold the page at once.
    Shared,
    /// One writer, no readers.
    Exclusive,
}

/// A held page latch. Dropping it releases the latch.
pub enum PageLatch {
    /// Shared latch over the page image.
    Shared(ArcRwLockReadGuard<RawRwLock, Box<[u8]>>),
    /// Exclusive latch over the page image.
    Exclusive(ArcRwLockWriteGuard<RawRwLock, Box<[u8]>>),
}

impl PageLatch {
    /// Mode the latch was acquired in.
    pub fn mode(&self) -> LatchMode {
        match self {
            PageLatch::Shared(_) => LatchMode::Shared,
            PageLatch::Exclusive(_) => LatchMode::Exclusive,
        }
    }

    /// Returns the page image.
    pub fn data(&self) -> &[u8] {
        match self {
            PageLatch::Shared(guard) => guard,
            PageLatch::Exclusive(guard) => guard,
        }
    }

    /// Returns the page image for mutation.
    ///
    /// # Panics
    /// Panics when the latch is shared.
    pub fn data_mut(&mut self) -> &mut [u8] {
        match self {
            PageLatch::Exclusive(guard) => guard,
            PageLatch::Shared(_) => panic!("page mutated under a shared latch"),
        }
    }
}

impl fmt::Debug for PageLatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageLatch")
            .field("mode", &self.mode())
            .finish()
    }
}

/// Resident pages keyed by `(space, page_no)`.
///
/// Pages are created on allocation and stay resident until their tablespace
/// is dropped; there is no eviction.
pub struct BufferPool {
    page_size: usize,
    frames: RwLock<HashMap<PageAddr, Arc<Frame>>>,
}

impl BufferPool {
    /// Creates an empty pool of `page_size`-byte pages.
    pub fn new(page_size: usize) -> Self {
        Self {
            page_size,
            frames: RwLock::new(HashMap::new()),
        }
    }

    /// Size of every page in bytes.
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Makes a zeroed page resident if it is not already.
    pub fn create(&self, addr: PageAddr) {
        let mut frames = self.frames.write();
        frames
            .entry(addr)
            .or_insert_with(|| Arc::new(Frame::new(addr, self.page_size)));
    }

    /// Returns true when the page is resident.
    pub fn contains(&self, addr: PageAddr) -> bool {
        self.frames.read().contains_key(&addr)
    }

    /// Latches a resident page, blocking until the latch is granted.
    pub fn latch(&self, addr: PageAddr, mode: LatchMode) -> Result<PageLatch> {
        let frame = self
            .frames
            .read()
            .get(&addr)
            .cloned()
            .ok_or(UndoError::Corruption("page not resident"))?;
        frame.note_latch();
        trace!(page = %addr, ?mode, "pager.latch");
        Ok(match mode {
            LatchMode::Shared => PageLatch::Shared(frame.buf.read_arc()),
            LatchMode::Exclusive => PageLatch::Exclusive(frame.buf.write_arc()),
        })
    }

    /// Copies a page image under a shared latch.
    pub fn snapshot(&self, addr: PageAddr) -> Option<Vec<u8>> {
        let latch = self.latch(addr, LatchMode::Shared).ok()?;
        Some(latch.data().to_vec())
    }

    /// Resident page numbers of a tablespace in ascending order.
    pub fn pages_in_space(&self, space: SpaceId) -> Vec<PageNo> {
        let mut pages: Vec<PageNo> = self
            .frames
            .read()
            .keys()
            .filter(|addr| addr.space == space)
            .map(|addr| addr.page_no)
            .collect();
        pages.sort();
        pages
    }

    /// Drops every page of a tablespace.
    pub fn drop_space(&self, space: SpaceId) {
        self.frames.write().retain(|addr, _| addr.space != space);
    }

    /// Total number of latch acquisitions on a page since it became resident.
    pub fn latch_count(&self, addr: PageAddr) -> u64 {
        self.frames
            .read()
            .get(&addr)
            .map(|frame| frame.latch_count.load(Ordering::Relaxed))
            .unwrap_or(0)
    }
}

impl fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferPool")
            .field("page_size", &self.page_size)
            .field("resident", &self.frames.read().len())
            .finish()
    }
}
