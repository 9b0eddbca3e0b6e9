//! Durable doubly-linked lists threaded through pages.
//!
//! A base node holds the length and the first/last node addresses; each node
//! holds prev/next addresses. Every page touched is latched exclusively in
//! the caller's mini-transaction, and every write is logged.

use crate::primitives::mtr::Mtr;
use crate::primitives::pager::LatchMode;
use crate::types::{FilAddr, PageAddr, PageNo, Result, SpaceId, UndoError};

use super::layout::flst_fmt::{
    ADDR_BYTE, ADDR_PAGE, BASE_FIRST, BASE_LAST, BASE_LEN, NODE_NEXT, NODE_PREV,
};
use super::layout::{ListBaseAt, ListNodeAt};

/// A base node located on a page.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ListBase {
    /// Page holding the base node.
    pub page: PageAddr,
    /// Which base node.
    pub at: ListBaseAt,
}

/// A list node located on a page.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ListNode {
    /// Page holding the node.
    pub page: PageAddr,
    /// Which node.
    pub at: ListNodeAt,
}

impl ListBase {
    /// Base node `at` on `page`.
    pub fn new(page: PageAddr, at: ListBaseAt) -> Self {
        Self { page, at }
    }
}

impl ListNode {
    /// Node `at` on `page`.
    pub fn new(page: PageAddr, at: ListNodeAt) -> Self {
        Self { page, at }
    }

    fn offset(self) -> usize {
        self.at.offset()
    }

    fn fil_addr(self) -> FilAddr {
        FilAddr::new(self.page.page_no, self.offset() as u16)
    }
}

fn read_addr(mtr: &Mtr<'_>, page: PageAddr, off: usize) -> FilAddr {
    FilAddr::new(
        PageNo(mtr.read_u32(page, off + ADDR_PAGE)),
        mtr.read_u16(page, off + ADDR_BYTE),
    )
}

fn write_addr(mtr: &mut Mtr<'_>, page: PageAddr, off: usize, addr: FilAddr) {
    mtr.write_u32(page, off + ADDR_PAGE, addr.page_no.0);
    mtr.write_u16(page, off + ADDR_BYTE, addr.boffset);
}

fn page_of(space: SpaceId, addr: FilAddr) -> PageAddr {
    PageAddr::new(space, addr.page_no)
}

/// Initializes an empty list.
pub fn init(mtr: &mut Mtr<'_>, base: ListBase) {
    let off = base.at.offset();
    mtr.write_u32(base.page, off + BASE_LEN, 0);
    write_addr(mtr, base.page, off + BASE_FIRST, FilAddr::NULL);
    write_addr(mtr, base.page, off + BASE_LAST, FilAddr::NULL);
}

/// Number of nodes.
pub fn len(mtr: &Mtr<'_>, base: ListBase) -> u32 {
    mtr.read_u32(base.page, base.at.offset() + BASE_LEN)
}

/// First node address.
pub fn first(mtr: &Mtr<'_>, base: ListBase) -> FilAddr {
    read_addr(mtr, base.page, base.at.offset() + BASE_FIRST)
}

/// Last node address.
pub fn last(mtr: &Mtr<'_>, base: ListBase) -> FilAddr {
    read_addr(mtr, base.page, base.at.offset() + BASE_LAST)
}

/// Address of the node after the node at `(page, boffset)`; the page must be latched.
pub fn next_of(mtr: &Mtr<'_>, space: SpaceId, node: FilAddr) -> FilAddr {
    read_addr(mtr, page_of(space, node), node.boffset as usize + NODE_NEXT)
}

/// Address of the node before the node at `(page, boffset)`; the page must be latched.
pub fn prev_of(mtr: &Mtr<'_>, space: SpaceId, node: FilAddr) -> FilAddr {
    read_addr(mtr, page_of(space, node), node.boffset as usize + NODE_PREV)
}

fn set_len(mtr: &mut Mtr<'_>, base: ListBase, len: u32) {
    mtr.write_u32(base.page, base.at.offset() + BASE_LEN, len);
}

fn add_to_empty(mtr: &mut Mtr<'_>, base: ListBase, node: ListNode) {
    let off = base.at.offset();
    write_addr(mtr, base.page, off + BASE_FIRST, node.fil_addr());
    write_addr(mtr, base.page, off + BASE_LAST, node.fil_addr());
    write_addr(mtr, node.page, node.offset() + NODE_PREV, FilAddr::NULL);
    write_addr(mtr, node.page, node.offset() + NODE_NEXT, FilAddr::NULL);
    set_len(mtr, base, 1);
}

/// Appends `node` after the current last node.
pub fn add_last(mtr: &mut Mtr<'_>, base: ListBase, node: ListNode) -> Result<()> {
    mtr.latch(base.page, LatchMode::Exclusive)?;
    mtr.latch(node.page, LatchMode::Exclusive)?;
    let n = len(mtr, base);
    if n == 0 {
        add_to_empty(mtr, base, node);
        return Ok(());
    }
    let old_last = last(mtr, base);
    let old_last_page = page_of(base.page.space, old_last);
    mtr.latch(old_last_page, LatchMode::Exclusive)?;
    write_addr(mtr, node.page, node.offset() + NODE_PREV, old_last);
    write_addr(mtr, node.page, node.offset() + NODE_NEXT, FilAddr::NULL);
    write_addr(
        mtr,
        old_last_page,
        old_last.boffset as usize + NODE_NEXT,
        node.fil_addr(),
    );
    write_addr(mtr, base.page, base.at.offset() + BASE_LAST, node.fil_addr());
    set_len(mtr, base, n + 1);
    Ok(())
}

/// Prepends `node` before the current first node.
pub fn add_first(mtr: &mut Mtr<'_>, base: ListBase, node: ListNode) -> Result<()> {
    mtr.latch(base.page, LatchMode::Exclusive)?;
    mtr.latch(node.page, LatchMode::Exclusive)?;
    let n = len(mtr, base);
    if n == 0 {
        add_to_empty(mtr, base, node);
        return Ok(());
    }
    let old_first = first(mtr, base);
    let old_first_page = page_of(base.page.space, old_first);
    mtr.latch(old_first_page, LatchMode::Exclusive)?;
    write_addr(mtr, node.page, node.offset() + NODE_PREV, FilAddr::NULL);
    write_addr(mtr, node.page, node.offset() + NODE_NEXT, old_first);
    write_addr(
        mtr,
        old_first_page,
        old_first.boffset as usize + NODE_PREV,
        node.fil_addr(),
    );
    write_addr(mtr, base.page, base.at.offset() + BASE_FIRST, node.fil_addr());
    set_len(mtr, base, n + 1);
    Ok(())
}

/// Unlinks `node` from the list.
pub fn remove(mtr: &mut Mtr<'_>, base: ListBase, node: ListNode) -> Result<()> {
    mtr.latch(base.page, LatchMode::Exclusive)?;
    mtr.latch(node.page, LatchMode::Exclusive)?;
    let n = len(mtr, base);
    if n == 0 {
        return Err(UndoError::Corruption("remove from empty file list"));
    }
    let space = base.page.space;
    let prev = read_addr(mtr, node.page, node.offset() + NODE_PREV);
    let next = read_addr(mtr, node.page, node.offset() + NODE_NEXT);

    if prev.is_null() {
        write_addr(mtr, base.page, base.at.offset() + BASE_FIRST, next);
    } else {
        let prev_page = page_of(space, prev);
        mtr.latch(prev_page, LatchMode::Exclusive)?;
        write_addr(mtr, prev_page, prev.boffset as usize + NODE_NEXT, next);
    }

    if next.is_null() {
        write_addr(mtr, base.page, base.at.offset() + BASE_LAST, prev);
    } else {
        let next_page = page_of(space, next);
        mtr.latch(next_page, LatchMode::Exclusive)?;
        write_addr(mtr, next_page, next.boffset as usize + NODE_PREV, prev);
    }

    set_len(mtr, base, n - 1);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::primitives::pager::BufferPool;
    use crate::primitives::wal::RedoLog;
    use crate::types::Lsn;

    fn addr(n: u32) -> PageAddr {
        PageAddr::new(SpaceId(2), PageNo(n))
    }

    fn collect(mtr: &Mtr<'_>, base: ListBase) -> Vec<u32> {
        let mut out = Vec::new();
        let mut cur = first(mtr, base);
        while !cur.is_null() {
            out.push(cur.page_no.0);
            cur = next_of(mtr, SpaceId(2), cur);
        }
        out
    }

    #[test]
    fn add_and_remove_keep_links_consistent() -> Result<()> {
        let pool = BufferPool::new(4096);
        let redo = RedoLog::new(Lsn(0));
        let mut mtr = Mtr::start(&pool, &redo);
        for n in 3..8 {
            mtr.init_file_page(addr(n))?;
        }
        let base = ListBase::new(addr(3), ListBaseAt::SegPageList);
        init(&mut mtr, base);
        add_last(&mut mtr, base, ListNode::new(addr(3), ListNodeAt::UndoPage))?;
        add_last(&mut mtr, base, ListNode::new(addr(4), ListNodeAt::UndoPage))?;
        add_last(&mut mtr, base, ListNode::new(addr(5), ListNodeAt::UndoPage))?;
        add_first(&mut mtr, base, ListNode::new(addr(6), ListNodeAt::UndoPage))?;
        assert_eq!(collect(&mtr, base), vec![6, 3, 4, 5]);
        assert_eq!(len(&mtr, base), 4);

        remove(&mut mtr, base, ListNode::new(addr(3), ListNodeAt::UndoPage))?;
        remove(&mut mtr, base, ListNode::new(addr(5), ListNodeAt::UndoPage))?;
        assert_eq!(collect(&mtr, base), vec![6, 4]);
        assert_eq!(last(&mtr, base).page_no, PageNo(4));
        assert_eq!(prev_of(&mtr, SpaceId(2), last(&mtr, base)).page_no, PageNo(6));

        remove(&mut mtr, base, ListNode::new(addr(6), ListNodeAt::UndoPage))?;
        remove(&mut mtr, base, ListNode::new(addr(4), ListNodeAt::UndoPage))?;
        assert_eq!(len(&mtr, base), 0);
        assert!(first(&mtr, base).is_null());
        assert!(last(&mtr, base).is_null());
        assert!(remove(&mut mtr, base, ListNode::new(addr(7), ListNodeAt::UndoPage)).is_err());
        Ok(())
    }
}
