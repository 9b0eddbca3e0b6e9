//! Tail and head truncation of undo logs, and record navigation at log ends.

#![allow(missing_docs)]

use proptest::prelude::*;
use undoseg::primitives::pager::LatchMode;
use undoseg::storage::undo::{LogLocator, RecordNavigator};
use undoseg::testkit::Fixture;
use undoseg::types::UndoNo;
use undoseg::{RecordType, Result, UndoKind, UndoLog, UndoRef, UndoState};

fn navigator(log: &UndoLog) -> RecordNavigator {
    RecordNavigator::new(
        LogLocator::new(log.space, log.hdr_page_no, log.hdr_offset),
        LatchMode::Shared,
    )
}

fn undo_nos(fx: &Fixture, log: &UndoLog) -> Result<Vec<UndoNo>> {
    let nav = navigator(log);
    let mut mtr = fx.env.mtr();
    let mut out = Vec::new();
    let mut rec = nav.first(&mut mtr)?;
    while let Some(at) = rec {
        out.push(nav.undo_no(&mtr, at)?);
        rec = nav.next(&mut mtr, at)?;
    }
    Ok(out)
}

fn fill(fx: &Fixture, undo: UndoRef, count: u64, payload_len: usize) -> Result<()> {
    let payload = vec![0x42; payload_len];
    for undo_no in 0..count {
        fx.rseg
            .append_record(&fx.env, undo, RecordType::UpdateExisting, undo_no, &payload)?;
    }
    Ok(())
}

#[test]
fn head_truncation_frees_whole_pages_only() -> Result<()> {
    let fx = Fixture::new()?;
    let undo = fx.assign(UndoKind::Update, 1)?;
    // Two records per page: [0, 1 | 2, 3].
    fill(&fx, undo, 4, 1800)?;
    let log = fx.rseg.undo_log(undo).expect("active");
    assert_eq!(log.size, 2);
    assert_eq!(fx.rseg.commit_update(&fx.env, undo, 10)?, UndoState::ToPurge);
    assert_eq!(fx.rseg.history_size(&fx.env)?, 2);

    fx.rseg
        .truncate_start(&fx.env, log.hdr_page_no, log.hdr_offset, 2)?;
    assert_eq!(undo_nos(&fx, &log)?, vec![2, 3]);
    assert_eq!(fx.rseg.history_size(&fx.env)?, 2);
    assert_eq!(fx.rseg.stats().curr_size, 3);

    fx.rseg
        .truncate_start(&fx.env, log.hdr_page_no, log.hdr_offset, 4)?;
    assert_eq!(undo_nos(&fx, &log)?, Vec::<UndoNo>::new());
    assert_eq!(fx.rseg.history_size(&fx.env)?, 1);
    assert_eq!(fx.rseg.stats().curr_size, 2);
    fx.rseg.check_invariants(&fx.env)
}

#[test]
fn navigator_stops_at_both_ends_of_a_page() -> Result<()> {
    let fx = Fixture::new()?;
    let undo = fx.assign(UndoKind::Update, 1)?;
    fill(&fx, undo, 3, 16)?;
    let log = fx.rseg.undo_log(undo).expect("active");
    assert_eq!(log.size, 1);

    let nav = navigator(&log);
    let mut mtr = fx.env.mtr();
    let first = nav.first(&mut mtr)?.expect("first record");
    let last = nav
        .last_on_page(&mut mtr, log.hdr_page_no)?
        .expect("last record");
    assert_eq!(nav.prev(&mut mtr, first)?, None);
    assert_eq!(nav.next(&mut mtr, last)?, None);
    assert_eq!(nav.undo_no(&mtr, first)?, 0);
    assert_eq!(nav.undo_no(&mtr, last)?, 2);
    Ok(())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn tail_truncation_is_idempotent(
        count in 0u64..12,
        payload_len in 1usize..1600,
        limit in 0u64..15,
    ) {
        let fx = Fixture::new().unwrap();
        let undo = fx.assign(UndoKind::Update, 1).unwrap();
        fill(&fx, undo, count, payload_len).unwrap();

        fx.rseg.truncate_end(&fx.env, undo, limit).unwrap();
        let once = fx.rseg.undo_log(undo).unwrap();
        let curr_size = fx.rseg.stats().curr_size;
        let kept = undo_nos(&fx, &once).unwrap();
        prop_assert_eq!(kept, (0..count.min(limit)).collect::<Vec<_>>());

        fx.rseg.truncate_end(&fx.env, undo, limit).unwrap();
        let twice = fx.rseg.undo_log(undo).unwrap();
        prop_assert_eq!(twice.size, once.size);
        prop_assert_eq!(twice.last_page_no, once.last_page_no);
        prop_assert_eq!(twice.top_offset, once.top_offset);
        prop_assert_eq!(fx.rseg.stats().curr_size, curr_size);
        prop_assert!(fx.rseg.check_invariants(&fx.env).is_ok());
    }
}
