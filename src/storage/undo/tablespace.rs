//! Rebuilding an undo tablespace in place.

use tracing::info;

use crate::types::{PageAddr, Result, SpaceId, UndoError};

use super::layout::RsegHeaderView;
use super::rseg::RollbackSegment;
use super::UndoEnv;

/// Shrinks an undo tablespace and recreates the rollback segments it hosts.
///
/// Every rollback segment in the space must be idle: no active or prepared
/// logs. Cached segments are forgotten along with their pages.
#[derive(Debug)]
pub struct TablespaceTruncator<'e> {
    env: &'e UndoEnv,
    space: SpaceId,
    size_pages: u32,
}

impl<'e> TablespaceTruncator<'e> {
    /// Truncator that resizes `space` to `size_pages`.
    pub fn new(env: &'e UndoEnv, space: SpaceId, size_pages: u32) -> Self {
        Self {
            env,
            space,
            size_pages,
        }
    }

    /// Truncates the tablespace. `rsegs` must be every rollback segment it holds.
    pub fn truncate(&self, rsegs: &[&RollbackSegment]) -> Result<()> {
        if rsegs.iter().any(|rseg| rseg.space() != self.space) {
            return Err(UndoError::Invalid("rollback segment outside the truncated tablespace"));
        }
        let mut ordered: Vec<&RollbackSegment> = rsegs.to_vec();
        ordered.sort_by_key(|rseg| rseg.id());
        let mut guards: Vec<_> = ordered.iter().map(|rseg| rseg.lock()).collect();
        if guards
            .iter()
            .any(|inner| !inner.insert_list.is_empty() || !inner.update_list.is_empty())
        {
            return Err(UndoError::Invalid("tablespace holds active undo logs"));
        }

        self.env.fsp.truncate_space(self.space, self.size_pages)?;
        self.env.pool.drop_space(self.space);

        for (rseg, inner) in ordered.iter().zip(guards.iter_mut()) {
            let mut mtr = self.env.mtr();
            mtr.set_no_redo();
            let page_no = RollbackSegment::create_header(
                self.env,
                &mut mtr,
                self.space,
                self.env.options.rseg_max_size,
            )?;
            let (max_size, history_size) = {
                let view = RsegHeaderView::new(mtr.page(PageAddr::new(self.space, page_no)));
                (view.max_size(), view.history_size())
            };
            mtr.commit();
            rseg.reset_after_truncate(self.env, inner, page_no, max_size, history_size);
        }
        info!(
            space = self.space.0,
            size_pages = self.size_pages,
            rsegs = ordered.len(),
            "undo.tablespace_truncated"
        );
        Ok(())
    }
}
