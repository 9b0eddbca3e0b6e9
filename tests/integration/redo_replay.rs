//! Redo replay reproduces undo pages, and abandoned mini-transactions leave
//! no trace.

#![allow(missing_docs)]

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use undoseg::primitives::pager::{BufferPool, LatchMode};
use undoseg::storage::undo::layout::{self, UndoField};
use undoseg::storage::undo::replay;
use undoseg::testkit::{Fixture, TEST_PAGE_SIZE, TEST_SPACE};
use undoseg::types::PageAddr;
use undoseg::{PurgeLimit, RecordType, Result, UndoKind, UndoRef, UndoState};

fn assert_same_pages(live: &BufferPool, replayed: &BufferPool) {
    let pages = live.pages_in_space(TEST_SPACE);
    assert_eq!(pages, replayed.pages_in_space(TEST_SPACE));
    for page_no in pages {
        let addr = PageAddr::new(TEST_SPACE, page_no);
        assert!(
            live.snapshot(addr) == replayed.snapshot(addr),
            "page {page_no} differs after replay"
        );
    }
}

fn retire(fx: &Fixture, undo: UndoRef, trx_no: u64) -> Result<()> {
    match undo.kind {
        UndoKind::Insert => {
            fx.rseg.set_state_at_finish(&fx.env, undo)?;
            fx.rseg.commit_cleanup(&fx.env, undo)
        }
        UndoKind::Update => fx.rseg.commit_update(&fx.env, undo, trx_no).map(|_| ()),
    }
}

#[test]
fn random_workload_replays_byte_for_byte() -> Result<()> {
    let fx = Fixture::new()?;
    let mut rng = ChaCha8Rng::seed_from_u64(0x5eed);
    let mut live: Vec<(UndoRef, u64)> = Vec::new();
    let mut trx = 0u64;

    for _ in 0..400 {
        match rng.gen_range(0..10) {
            0..=1 => {
                trx += 1;
                let kind = if rng.gen_bool(0.5) {
                    UndoKind::Insert
                } else {
                    UndoKind::Update
                };
                live.push((fx.assign(kind, trx)?, 0));
            }
            2..=6 if !live.is_empty() => {
                let at = rng.gen_range(0..live.len());
                let (undo, next) = &mut live[at];
                let len = rng.gen_range(1..900);
                let rec_type = match undo.kind {
                    UndoKind::Insert => RecordType::Insert,
                    UndoKind::Update => RecordType::UpdateExisting,
                };
                fx.rseg
                    .append_record(&fx.env, *undo, rec_type, *next, &vec![trx as u8; len])?;
                *next += 1;
            }
            7 if !live.is_empty() => {
                let at = rng.gen_range(0..live.len());
                let (undo, next) = &mut live[at];
                let limit = rng.gen_range(0..=*next);
                fx.rseg.truncate_end(&fx.env, *undo, limit)?;
                *next = limit;
            }
            8 if !live.is_empty() => {
                let (undo, _) = live.swap_remove(rng.gen_range(0..live.len()));
                trx += 1;
                retire(&fx, undo, trx)?;
            }
            9 => {
                let purge_to = rng.gen_range(0..=trx);
                fx.rseg.truncate_history(
                    &fx.env,
                    PurgeLimit {
                        trx_no: purge_to,
                        undo_no: rng.gen_range(0..4),
                    },
                )?;
            }
            _ => {}
        }
    }
    fx.rseg.check_invariants(&fx.env)?;

    let replayed = BufferPool::new(TEST_PAGE_SIZE as usize);
    let stats = replay(fx.redo(), &replayed)?;
    assert_eq!(stats.groups as u64, fx.redo().stats().groups);
    assert_same_pages(fx.pool(), &replayed);
    Ok(())
}

#[test]
fn dropped_mini_transaction_changes_nothing() -> Result<()> {
    let fx = Fixture::new()?;
    let undo = fx.assign(UndoKind::Update, 1)?;
    fx.rseg
        .append_record(&fx.env, undo, RecordType::UpdateExisting, 0, b"kept")?;
    let page_no = fx.rseg.undo_log(undo).expect("active").hdr_page_no;
    let addr = PageAddr::new(TEST_SPACE, page_no);
    let image = fx.page(page_no).expect("resident");
    let lsn = fx.redo().current_lsn();

    {
        let mut mtr = fx.env.mtr();
        mtr.latch(addr, LatchMode::Exclusive)?;
        layout::write(&mut mtr, addr, UndoField::SegState, UndoState::ToFree as u64);
        layout::write(&mut mtr, addr, UndoField::PageFree, 4000);
    }

    assert_eq!(fx.page(page_no), Some(image));
    assert_eq!(fx.redo().current_lsn(), lsn);
    fx.rseg.check_invariants(&fx.env)?;

    let replayed = BufferPool::new(TEST_PAGE_SIZE as usize);
    replay(fx.redo(), &replayed)?;
    assert_same_pages(fx.pool(), &replayed);
    Ok(())
}
