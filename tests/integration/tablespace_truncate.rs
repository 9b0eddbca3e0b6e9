//! Shrinking an undo tablespace that hosts several rollback segments.

#![allow(missing_docs)]

use undoseg::storage::undo::TablespaceTruncator;
use undoseg::testkit::{Fixture, TEST_SPACE};
use undoseg::{PurgeLimit, RecordType, Result, RollbackSegment, UndoError, UndoKind};

fn busy_history(fx: &Fixture, rseg: &RollbackSegment, base: u64) -> Result<()> {
    for n in 0..4u64 {
        let undo = rseg.assign_undo(
            &fx.env,
            UndoKind::Update,
            &undoseg::TrxUndoRequest::new(base + n),
        )?;
        for undo_no in 0..n * 2 {
            rseg.append_record(&fx.env, undo, RecordType::UpdateExisting, undo_no, &[9; 1500])?;
        }
        rseg.commit_update(&fx.env, undo, base + n)?;
    }
    Ok(())
}

#[test]
fn every_rseg_in_the_space_is_rebuilt() -> Result<()> {
    let fx = Fixture::new()?;
    let second = RollbackSegment::create(&fx.env, 1, TEST_SPACE, true)?;
    busy_history(&fx, &fx.rseg, 100)?;
    busy_history(&fx, &second, 200)?;
    assert!(fx.pool().pages_in_space(TEST_SPACE).len() > 10);

    TablespaceTruncator::new(&fx.env, TEST_SPACE, 32).truncate(&[&second, &fx.rseg])?;

    assert_eq!(fx.pool().pages_in_space(TEST_SPACE).len(), 2);
    assert_ne!(fx.rseg.header_page(), second.header_page());
    for rseg in [&fx.rseg, &second] {
        let stats = rseg.stats();
        assert_eq!(stats.curr_size, 1);
        assert_eq!(stats.insert_cached + stats.update_cached, 0);
        assert_eq!(rseg.history_len(&fx.env)?, 0);
        rseg.check_invariants(&fx.env)?;
    }

    busy_history(&fx, &second, 300)?;
    second.truncate_history(
        &fx.env,
        PurgeLimit {
            trx_no: u64::MAX,
            undo_no: 0,
        },
    )?;
    second.check_invariants(&fx.env)?;
    fx.rseg.check_invariants(&fx.env)
}

#[test]
fn active_log_anywhere_blocks_truncation() -> Result<()> {
    let fx = Fixture::new()?;
    let second = RollbackSegment::create(&fx.env, 1, TEST_SPACE, true)?;
    busy_history(&fx, &fx.rseg, 1)?;
    let live = second.assign_undo(&fx.env, UndoKind::Insert, &undoseg::TrxUndoRequest::new(50))?;
    let header = fx.rseg.header_page();
    let history = fx.rseg.history_len(&fx.env)?;

    let err = TablespaceTruncator::new(&fx.env, TEST_SPACE, 32)
        .truncate(&[&fx.rseg, &second])
        .unwrap_err();
    assert!(matches!(err, UndoError::Invalid(_)));
    assert_eq!(fx.rseg.header_page(), header);
    assert_eq!(fx.rseg.history_len(&fx.env)?, history);
    assert!(second.undo_log(live).is_some());
    fx.rseg.check_invariants(&fx.env)?;
    second.check_invariants(&fx.env)
}
