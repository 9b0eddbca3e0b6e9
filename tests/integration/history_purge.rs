//! History list maintenance: appending committed update logs and purging them.

#![allow(missing_docs)]

use undoseg::testkit::{Fixture, TEST_SPACE};
use undoseg::{PurgeLimit, RecordType, Result, UndoKind, UndoState};

fn commit_update(fx: &Fixture, trx_id: u64, trx_no: u64, records: u64) -> Result<UndoState> {
    let undo = fx.assign(UndoKind::Update, trx_id)?;
    let payload = vec![0x33; 1500];
    for undo_no in 0..records {
        fx.rseg
            .append_record(&fx.env, undo, RecordType::DeleteMark, undo_no, &payload)?;
    }
    fx.rseg.commit_update(&fx.env, undo, trx_no)
}

#[test]
fn purge_consumes_history_in_commit_order() -> Result<()> {
    let fx = Fixture::new()?;
    assert_eq!(commit_update(&fx, 1, 10, 0)?, UndoState::Cached);
    assert_eq!(commit_update(&fx, 2, 11, 5)?, UndoState::ToPurge);
    assert_eq!(commit_update(&fx, 3, 12, 1)?, UndoState::Cached);
    assert_eq!(commit_update(&fx, 4, 13, 4)?, UndoState::ToPurge);
    assert_eq!(fx.rseg.history_len(&fx.env)?, 4);
    assert_eq!(fx.metrics.snapshot().history_appends, 4);
    fx.rseg.check_invariants(&fx.env)?;

    let trx_nos: Vec<u64> = fx
        .rseg
        .history_entries(&fx.env)?
        .iter()
        .map(|e| e.trx_no)
        .collect();
    assert_eq!(trx_nos, vec![13, 12, 11, 10]);

    let removed = fx.rseg.truncate_history(
        &fx.env,
        PurgeLimit {
            trx_no: 12,
            undo_no: 0,
        },
    )?;
    assert_eq!(removed, 2);
    assert_eq!(fx.rseg.oldest_history().map(|h| h.trx_no), Some(12));
    fx.rseg.check_invariants(&fx.env)?;

    let removed = fx.rseg.truncate_history(
        &fx.env,
        PurgeLimit {
            trx_no: u64::MAX,
            undo_no: 0,
        },
    )?;
    assert_eq!(removed, 2);
    assert_eq!(fx.rseg.history_len(&fx.env)?, 0);
    assert_eq!(fx.rseg.history_size(&fx.env)?, 0);
    assert_eq!(fx.rseg.oldest_history(), None);
    let stats = fx.rseg.stats();
    assert_eq!(stats.curr_size, 1 + stats.update_cached as u32);
    fx.rseg.check_invariants(&fx.env)
}

#[test]
fn purge_below_the_oldest_entry_is_a_no_op() -> Result<()> {
    let fx = Fixture::new()?;
    commit_update(&fx, 1, 20, 5)?;
    let before = fx.rseg.history_entries(&fx.env)?;
    let removed = fx.rseg.truncate_history(&fx.env, PurgeLimit::default())?;
    assert_eq!(removed, 0);
    assert_eq!(fx.rseg.history_entries(&fx.env)?, before);
    Ok(())
}

#[test]
fn purge_returns_every_page_to_the_tablespace() -> Result<()> {
    let fx = Fixture::new()?;
    let free_pages = fx.fsp.free_pages(TEST_SPACE);
    let segments = fx.fsp.segment_count(TEST_SPACE);
    for trx in 1..=8u64 {
        assert_eq!(commit_update(&fx, trx, trx, 3)?, UndoState::ToPurge);
    }
    assert!(fx.rseg.undo_logs().is_empty());
    assert_eq!(fx.rseg.history_size(&fx.env)?, 16);

    fx.rseg.truncate_history(
        &fx.env,
        PurgeLimit {
            trx_no: u64::MAX,
            undo_no: 0,
        },
    )?;
    assert_eq!(fx.rseg.stats().curr_size, 1);
    assert_eq!(fx.fsp.free_pages(TEST_SPACE), free_pages);
    assert_eq!(fx.fsp.segment_count(TEST_SPACE), segments);
    let snap = fx.metrics.snapshot();
    assert_eq!(snap.pages_allocated, snap.pages_freed);
    fx.rseg.check_invariants(&fx.env)
}
