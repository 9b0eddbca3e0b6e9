#![forbid(unsafe_code)]
//! File-space management: extent reservations, file segments and page allocation.

use std::collections::{BTreeSet, HashMap};
use std::fmt;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::primitives::mtr::Mtr;
use crate::primitives::pager::LatchMode;
use crate::types::{PageAddr, PageNo, Result, SpaceId, UndoError};

/// Identity of a file segment as recorded in its on-page header.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct FsegRef {
    /// Tablespace owning the segment.
    pub space: SpaceId,
    /// Segment number within the tablespace.
    pub id: u32,
}

/// Allocator the undo layer draws pages from.
///
/// Allocation methods latch and initialize the returned page inside `mtr`.
/// Freeing methods latch the freed pages exclusively, so they wait for
/// readers holding shared latches.
pub trait FileSpace: Send + Sync {
    /// Reserves `n` free extents for an upcoming allocation.
    fn reserve_free_extents(&self, space: SpaceId, n: u32) -> Result<()>;

    /// Returns a reservation taken by [`FileSpace::reserve_free_extents`].
    fn release_free_extents(&self, space: SpaceId, n: u32);

    /// Creates a file segment and returns it with its first page.
    fn create_segment(&self, mtr: &mut Mtr<'_>, space: SpaceId) -> Result<(FsegRef, PageNo)>;

    /// Allocates a page in the segment, preferring `hint`.
    fn alloc_page(&self, mtr: &mut Mtr<'_>, fseg: FsegRef, hint: PageNo) -> Result<PageNo>;

    /// Frees one page of the segment.
    fn free_page(&self, mtr: &mut Mtr<'_>, fseg: FsegRef, page_no: PageNo) -> Result<()>;

    /// Frees part of a segment. Returns true once the work is complete:
    /// every page is freed, or with `keep_header` every page but the first.
    fn free_segment_step(&self, mtr: &mut Mtr<'_>, fseg: FsegRef, keep_header: bool)
        -> Result<bool>;

    /// Number of pages the segment currently owns, `None` if it does not exist.
    fn segment_pages(&self, fseg: FsegRef) -> Option<usize>;

    /// Forgets every allocation in the tablespace and resizes it.
    fn truncate_space(&self, space: SpaceId, size_pages: u32) -> Result<()>;
}

/// Reservation released when dropped.
pub struct ExtentReservation<'f> {
    fsp: &'f dyn FileSpace,
    space: SpaceId,
    n: u32,
}

impl<'f> ExtentReservation<'f> {
    /// Reserves `n` extents in `space`.
    pub fn acquire(fsp: &'f dyn FileSpace, space: SpaceId, n: u32) -> Result<Self> {
        fsp.reserve_free_extents(space, n)?;
        Ok(Self { fsp, space, n })
    }
}

impl Drop for ExtentReservation<'_> {
    fn drop(&mut self) {
        self.fsp.release_free_extents(self.space, self.n);
    }
}

/// Pages at the start of every tablespace that are never handed out.
pub const RESERVED_PAGES: u32 = 3;
/// Non-header pages released per [`FileSpace::free_segment_step`] call.
pub const FREE_STEP_PAGES: usize = 4;

#[derive(Debug)]
struct SegmentState {
    header: PageNo,
    pages: BTreeSet<PageNo>,
}

#[derive(Debug)]
struct SpaceState {
    size: u32,
    high_water: u32,
    free: BTreeSet<PageNo>,
    reserved_extents: u32,
    segments: HashMap<u32, SegmentState>,
    next_segment: u32,
}

impl SpaceState {
    fn new(size: u32) -> Self {
        Self {
            size,
            high_water: RESERVED_PAGES,
            free: BTreeSet::new(),
            reserved_extents: 0,
            segments: HashMap::new(),
            next_segment: 1,
        }
    }

    fn free_pages(&self) -> u32 {
        self.size.saturating_sub(self.high_water) + self.free.len() as u32
    }

    fn take_page(&mut self, hint: PageNo) -> Option<PageNo> {
        if self.free.remove(&hint) {
            return Some(hint);
        }
        if hint.0 == self.high_water && self.high_water < self.size {
            self.high_water += 1;
            return Some(hint);
        }
        if let Some(page) = self.free.pop_first() {
            return Some(page);
        }
        if self.high_water < self.size {
            let page = PageNo(self.high_water);
            self.high_water += 1;
            return Some(page);
        }
        None
    }
}

/// In-memory [`FileSpace`] with extent-granular reservations.
pub struct MemFileSpace {
    pages_per_extent: u32,
    spaces: Mutex<HashMap<SpaceId, SpaceState>>,
}

impl MemFileSpace {
    /// Creates an allocator with the given extent size.
    pub fn new(pages_per_extent: u32) -> Self {
        assert!(pages_per_extent > 0, "extent must hold at least one page");
        Self {
            pages_per_extent,
            spaces: Mutex::new(HashMap::new()),
        }
    }

    /// Registers a tablespace of `size_pages` pages.
    pub fn add_space(&self, space: SpaceId, size_pages: u32) {
        self.spaces.lock().insert(space, SpaceState::new(size_pages));
    }

    /// Pages neither allocated nor reserved for the file header.
    pub fn free_pages(&self, space: SpaceId) -> u32 {
        self.spaces
            .lock()
            .get(&space)
            .map(SpaceState::free_pages)
            .unwrap_or(0)
    }

    /// Number of live segments in the tablespace.
    pub fn segment_count(&self, space: SpaceId) -> usize {
        self.spaces
            .lock()
            .get(&space)
            .map(|state| state.segments.len())
            .unwrap_or(0)
    }

    /// Extents currently reserved.
    pub fn reserved_extents(&self, space: SpaceId) -> u32 {
        self.spaces
            .lock()
            .get(&space)
            .map(|state| state.reserved_extents)
            .unwrap_or(0)
    }

    fn release_pages(&self, fseg: FsegRef, pages: &[PageNo], drop_segment: bool) -> Result<()> {
        let mut spaces = self.spaces.lock();
        let state = spaces
            .get_mut(&fseg.space)
            .ok_or(UndoError::Invalid("unknown tablespace"))?;
        let segment = state
            .segments
            .get_mut(&fseg.id)
            .ok_or(UndoError::Corruption("file segment does not exist"))?;
        for page in pages {
            if !segment.pages.remove(page) {
                return Err(UndoError::Corruption("page not owned by file segment"));
            }
        }
        if drop_segment {
            state.segments.remove(&fseg.id);
        }
        state.free.extend(pages.iter().copied());
        Ok(())
    }
}

impl FileSpace for MemFileSpace {
    fn reserve_free_extents(&self, space: SpaceId, n: u32) -> Result<()> {
        let mut spaces = self.spaces.lock();
        let state = spaces
            .get_mut(&space)
            .ok_or(UndoError::Invalid("unknown tablespace"))?;
        let available = state.free_pages() / self.pages_per_extent;
        if available < state.reserved_extents + n {
            warn!(space = space.0, requested = n, available, "fsp.reserve_failed");
            return Err(UndoError::OutOfFileSpace);
        }
        state.reserved_extents += n;
        Ok(())
    }

    fn release_free_extents(&self, space: SpaceId, n: u32) {
        if let Some(state) = self.spaces.lock().get_mut(&space) {
            state.reserved_extents = state.reserved_extents.saturating_sub(n);
        }
    }

    fn create_segment(&self, mtr: &mut Mtr<'_>, space: SpaceId) -> Result<(FsegRef, PageNo)> {
        let (fseg, page_no) = {
            let mut spaces = self.spaces.lock();
            let state = spaces
                .get_mut(&space)
                .ok_or(UndoError::Invalid("unknown tablespace"))?;
            let hint = PageNo(state.high_water);
            let page_no = state.take_page(hint).ok_or(UndoError::OutOfFileSpace)?;
            let id = state.next_segment;
            state.next_segment += 1;
            state.segments.insert(
                id,
                SegmentState {
                    header: page_no,
                    pages: BTreeSet::from([page_no]),
                },
            );
            (FsegRef { space, id }, page_no)
        };
        mtr.init_file_page(PageAddr::new(space, page_no))?;
        debug!(space = space.0, segment = fseg.id, page = page_no.0, "fsp.create_segment");
        Ok((fseg, page_no))
    }

    fn alloc_page(&self, mtr: &mut Mtr<'_>, fseg: FsegRef, hint: PageNo) -> Result<PageNo> {
        let page_no = {
            let mut spaces = self.spaces.lock();
            let state = spaces
                .get_mut(&fseg.space)
                .ok_or(UndoError::Invalid("unknown tablespace"))?;
            if !state.segments.contains_key(&fseg.id) {
                return Err(UndoError::Corruption("file segment does not exist"));
            }
            let page_no = state.take_page(hint).ok_or(UndoError::OutOfFileSpace)?;
            if let Some(segment) = state.segments.get_mut(&fseg.id) {
                segment.pages.insert(page_no);
            }
            page_no
        };
        mtr.init_file_page(PageAddr::new(fseg.space, page_no))?;
        Ok(page_no)
    }

    fn free_page(&self, mtr: &mut Mtr<'_>, fseg: FsegRef, page_no: PageNo) -> Result<()> {
        mtr.latch(PageAddr::new(fseg.space, page_no), LatchMode::Exclusive)?;
        self.release_pages(fseg, &[page_no], false)
    }

    fn free_segment_step(
        &self,
        mtr: &mut Mtr<'_>,
        fseg: FsegRef,
        keep_header: bool,
    ) -> Result<bool> {
        let (header, victims) = {
            let spaces = self.spaces.lock();
            let segment = spaces
                .get(&fseg.space)
                .and_then(|state| state.segments.get(&fseg.id))
                .ok_or(UndoError::Corruption("file segment does not exist"))?;
            let victims: Vec<PageNo> = segment
                .pages
                .iter()
                .rev()
                .filter(|page| **page != segment.header)
                .take(FREE_STEP_PAGES)
                .copied()
                .collect();
            (segment.header, victims)
        };
        if victims.is_empty() {
            if keep_header {
                return Ok(true);
            }
            mtr.latch(PageAddr::new(fseg.space, header), LatchMode::Exclusive)?;
            self.release_pages(fseg, &[header], true)?;
            debug!(space = fseg.space.0, segment = fseg.id, "fsp.segment_freed");
            return Ok(true);
        }
        for page in &victims {
            mtr.latch(PageAddr::new(fseg.space, *page), LatchMode::Exclusive)?;
        }
        self.release_pages(fseg, &victims, false)?;
        let remaining = self.segment_pages(fseg).unwrap_or(0);
        Ok(keep_header && remaining == 1)
    }

    fn segment_pages(&self, fseg: FsegRef) -> Option<usize> {
        self.spaces
            .lock()
            .get(&fseg.space)
            .and_then(|state| state.segments.get(&fseg.id))
            .map(|segment| segment.pages.len())
    }

    fn truncate_space(&self, space: SpaceId, size_pages: u32) -> Result<()> {
        if size_pages <= RESERVED_PAGES {
            return Err(UndoError::Invalid("truncated tablespace too small"));
        }
        let mut spaces = self.spaces.lock();
        if !spaces.contains_key(&space) {
            return Err(UndoError::Invalid("unknown tablespace"));
        }
        spaces.insert(space, SpaceState::new(size_pages));
        Ok(())
    }
}

impl fmt::Debug for MemFileSpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemFileSpace")
            .field("pages_per_extent", &self.pages_per_extent)
            .field("spaces", &self.spaces.lock().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::primitives::pager::BufferPool;
    use crate::primitives::wal::RedoLog;
    use crate::types::Lsn;

    const SPACE: SpaceId = SpaceId(7);

    #[test]
    fn reservation_respects_free_extents() -> Result<()> {
        let fsp = MemFileSpace::new(4);
        fsp.add_space(SPACE, RESERVED_PAGES + 8);
        {
            let _a = ExtentReservation::acquire(&fsp, SPACE, 1)?;
            let _b = ExtentReservation::acquire(&fsp, SPACE, 1)?;
            assert!(matches!(
                ExtentReservation::acquire(&fsp, SPACE, 1),
                Err(UndoError::OutOfFileSpace)
            ));
            assert_eq!(fsp.reserved_extents(SPACE), 2);
        }
        assert_eq!(fsp.reserved_extents(SPACE), 0);
        Ok(())
    }

    #[test]
    fn segment_alloc_and_stepwise_free() -> Result<()> {
        let pool = BufferPool::new(4096);
        let redo = RedoLog::new(Lsn(0));
        let fsp = MemFileSpace::new(4);
        fsp.add_space(SPACE, 64);
        let mut mtr = Mtr::start(&pool, &redo);
        let (fseg, header) = fsp.create_segment(&mut mtr, SPACE)?;
        let mut last = header;
        for _ in 0..9 {
            last = fsp.alloc_page(&mut mtr, fseg, last.next())?;
        }
        mtr.commit();
        assert_eq!(fsp.segment_pages(fseg), Some(10));
        assert_eq!(last, PageNo(header.0 + 9));

        let mut steps = 0;
        loop {
            let mut mtr = Mtr::start(&pool, &redo);
            let done = fsp.free_segment_step(&mut mtr, fseg, true)?;
            mtr.commit();
            steps += 1;
            if done {
                break;
            }
        }
        assert!(steps > 1);
        assert_eq!(fsp.segment_pages(fseg), Some(1));

        let mut mtr = Mtr::start(&pool, &redo);
        while !fsp.free_segment_step(&mut mtr, fseg, false)? {}
        mtr.commit();
        assert_eq!(fsp.segment_pages(fseg), None);
        assert_eq!(fsp.free_pages(SPACE), 64 - RESERVED_PAGES);
        Ok(())
    }

    #[test]
    fn allocation_fails_when_space_is_full() -> Result<()> {
        let pool = BufferPool::new(4096);
        let redo = RedoLog::new(Lsn(0));
        let fsp = MemFileSpace::new(1);
        fsp.add_space(SPACE, RESERVED_PAGES + 1);
        let mut mtr = Mtr::start(&pool, &redo);
        let (fseg, header) = fsp.create_segment(&mut mtr, SPACE)?;
        assert!(matches!(
            fsp.alloc_page(&mut mtr, fseg, header.next()),
            Err(UndoError::OutOfFileSpace)
        ));
        Ok(())
    }

    #[test]
    fn freeing_foreign_page_is_corruption() -> Result<()> {
        let pool = BufferPool::new(4096);
        let redo = RedoLog::new(Lsn(0));
        let fsp = MemFileSpace::new(4);
        fsp.add_space(SPACE, 32);
        let mut mtr = Mtr::start(&pool, &redo);
        let (a, _) = fsp.create_segment(&mut mtr, SPACE)?;
        let (_, b_header) = fsp.create_segment(&mut mtr, SPACE)?;
        assert!(matches!(
            fsp.free_page(&mut mtr, a, b_header),
            Err(UndoError::Corruption(_))
        ));
        Ok(())
    }
}
