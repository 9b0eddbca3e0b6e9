//! Undo segment lifecycle through the public API.
//!
//! Covers assignment, caching and reuse, the startup scan, slot exhaustion
//! and XA preparation.

#![allow(missing_docs)]

use undoseg::storage::undo::layout::{log_hdr, LogHeaderView, UndoPageView, HEADER_REGION_END};
use undoseg::testkit::{Fixture, TEST_SPACE};
use undoseg::{
    DictOp, RecordType, Result, TrxUndoRequest, UndoError, UndoKind, UndoState, Xid,
};

const FIRST_RECORD: u16 = (HEADER_REGION_END + log_hdr::XA_HDR_SIZE) as u16;

#[test]
fn startup_scan_restores_headers() -> Result<()> {
    let fx = Fixture::new()?;
    let xid = Xid::new(3, b"coordinator-17", b"branch-2")?;
    let prepared = fx.assign(UndoKind::Update, 41)?;
    fx.rseg
        .append_record(&fx.env, prepared, RecordType::UpdateExisting, 0, b"before")?;
    fx.rseg.prepare(&fx.env, prepared, xid.clone())?;
    let plain = fx.assign(UndoKind::Insert, 42)?;

    let reopened = fx.reopen()?;
    let restored = reopened.undo_log(prepared).expect("prepared log restored");
    assert_eq!(restored.kind, UndoKind::Update);
    assert_eq!(restored.state, UndoState::Prepared);
    assert_eq!(restored.trx_id, 41);
    assert_eq!(restored.xid.as_ref(), Some(&xid));

    let restored = reopened.undo_log(plain).expect("insert log restored");
    assert_eq!(restored.kind, UndoKind::Insert);
    assert_eq!(restored.state, UndoState::Active);
    assert_eq!(restored.trx_id, 42);
    assert!(restored.xid.is_none());
    assert!(restored.empty);
    reopened.check_invariants(&fx.env)
}

#[test]
fn cached_handles_span_one_page_and_slots_are_unique() -> Result<()> {
    let fx = Fixture::new()?;
    let mut refs = Vec::new();
    for trx_id in 1..=24u64 {
        let kind = if trx_id % 2 == 0 {
            UndoKind::Insert
        } else {
            UndoKind::Update
        };
        let undo = fx.assign(kind, trx_id)?;
        let rec_type = match kind {
            UndoKind::Insert => RecordType::Insert,
            UndoKind::Update => RecordType::UpdateExisting,
        };
        for undo_no in 0..trx_id % 4 {
            fx.rseg
                .append_record(&fx.env, undo, rec_type, undo_no, &[7; 1200])?;
        }
        refs.push(undo);
    }
    for (n, undo) in refs.into_iter().enumerate() {
        match undo.kind {
            UndoKind::Insert => {
                fx.rseg.set_state_at_finish(&fx.env, undo)?;
                fx.rseg.commit_cleanup(&fx.env, undo)?;
            }
            UndoKind::Update => {
                fx.rseg.commit_update(&fx.env, undo, n as u64 + 100)?;
            }
        }
    }

    let logs = fx.rseg.undo_logs();
    let mut ids: Vec<usize> = logs.iter().map(|log| log.id).collect();
    ids.sort_unstable();
    ids.dedup();
    assert_eq!(ids.len(), logs.len());
    assert!(logs
        .iter()
        .filter(|log| log.state == UndoState::Cached)
        .all(|log| log.size == 1));
    fx.rseg.check_invariants(&fx.env)?;
    fx.reopen()?.check_invariants(&fx.env)
}

#[test]
fn slot_exhaustion_changes_nothing() -> Result<()> {
    let fx = Fixture::new()?;
    for trx_id in 0..fx.env.options.n_slots() as u64 {
        fx.assign(UndoKind::Update, trx_id + 1)?;
    }
    let stats = fx.rseg.stats();
    let metrics = fx.metrics.snapshot();
    let free_pages = fx.fsp.free_pages(TEST_SPACE);

    for kind in [UndoKind::Insert, UndoKind::Update] {
        let err = fx.assign(kind, 1_000_000).unwrap_err();
        assert!(matches!(err, UndoError::TooManyConcurrentTransactions));
    }
    assert_eq!(fx.rseg.stats(), stats);
    assert_eq!(fx.metrics.snapshot(), metrics);
    assert_eq!(fx.fsp.free_pages(TEST_SPACE), free_pages);
    assert_eq!(fx.fsp.reserved_extents(TEST_SPACE), 0);
    Ok(())
}

#[test]
fn insert_reuse_resets_page_and_flags() -> Result<()> {
    let fx = Fixture::new()?;
    let req = TrxUndoRequest::new(5).with_dict_op(DictOp::Index);
    let undo = fx.rseg.assign_undo(&fx.env, UndoKind::Insert, &req)?;
    for undo_no in 0..3 {
        fx.rseg
            .append_record(&fx.env, undo, RecordType::Insert, undo_no, b"row image")?;
    }
    fx.rseg.prepare(&fx.env, undo, Xid::new(0, b"g", b"b")?)?;
    assert_eq!(fx.rseg.set_state_at_finish(&fx.env, undo)?, UndoState::Cached);
    fx.rseg.commit_cleanup(&fx.env, undo)?;

    let reused = fx.assign(UndoKind::Insert, 6)?;
    let log = fx.rseg.undo_log(reused).expect("reused handle");
    let page = fx.page(log.hdr_page_no).expect("header page");
    let view = UndoPageView::new(&page);
    assert_eq!(view.start(), FIRST_RECORD);
    assert_eq!(view.free(), FIRST_RECORD);
    let hdr = LogHeaderView::new(&page, log.hdr_offset);
    assert!(!hdr.dict_trans());
    assert!(!hdr.xid_exists());
    assert_eq!(hdr.trx_id(), 6);
    Ok(())
}

#[test]
fn config_file_drives_reuse_limit() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("undo.toml");
    std::fs::write(&path, "page_size = 4096\nreuse_limit = 400\n")?;
    let options = undoseg::UndoOptions::load(&path)?;
    assert_eq!(options.effective_reuse_limit(), 400);

    let fx = Fixture::with_options(options, 1024)?;
    let undo = fx.assign(UndoKind::Insert, 1)?;
    fx.rseg
        .append_record(&fx.env, undo, RecordType::Insert, 0, &[1; 200])?;
    assert_eq!(fx.rseg.set_state_at_finish(&fx.env, undo)?, UndoState::ToFree);
    Ok(())
}
