use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use super::fil;
use crate::primitives::bytes::mach;
use crate::types::PageAddr;

/// One resident page image behind a reader/writer latch.
pub struct Frame {
    pub addr: PageAddr,
    pub buf: Arc<RwLock<Box<[u8]>>>,
    pub latch_count: AtomicU64,
}

impl Frame {
    pub fn new(addr: PageAddr, page_size: usize) -> Self {
        let mut image = vec![0u8; page_size].into_boxed_slice();
        stamp_identity(&mut image, addr);
        Self {
            addr,
            buf: Arc::new(RwLock::new(image)),
            latch_count: AtomicU64::new(0),
        }
    }

    pub fn note_latch(&self) {
        self.latch_count.fetch_add(1, Ordering::Relaxed);
    }
}

/// Zeroes a page image and writes its identity into the FIL header.
pub(crate) fn stamp_identity(image: &mut [u8], addr: PageAddr) {
    image.fill(0);
    mach::write_u32(image, fil::PAGE_OFFSET, addr.page_no.0);
    mach::write_u32(image, fil::PAGE_SPACE_ID, addr.space.0);
}
