//! Concurrent assignment, commit and purge against one rollback segment.
//!
//! Worker threads run independent transactions while a purge thread trims
//! the history list; the size accounting must hold at every checkpoint and
//! after the dust settles.

#![allow(missing_docs)]

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use undoseg::testkit::Fixture;
use undoseg::{PurgeLimit, RecordType, Result, UndoKind, UndoState};

const WORKERS: usize = 4;
const TRANSACTIONS_PER_WORKER: usize = 150;

fn run_transaction(fx: &Fixture, rng: &mut ChaCha8Rng, trx_ids: &AtomicU64) -> Result<()> {
    let trx_id = trx_ids.fetch_add(1, Ordering::Relaxed);
    let kind = if rng.gen_bool(0.4) {
        UndoKind::Insert
    } else {
        UndoKind::Update
    };
    let undo = fx.assign(kind, trx_id)?;
    let records = rng.gen_range(0..8u64);
    for undo_no in 0..records {
        let rec_type = match kind {
            UndoKind::Insert => RecordType::Insert,
            UndoKind::Update if rng.gen_bool(0.3) => RecordType::DeleteMark,
            UndoKind::Update => RecordType::UpdateExisting,
        };
        let payload = vec![trx_id as u8; rng.gen_range(1..1200)];
        fx.rseg
            .append_record(&fx.env, undo, rec_type, undo_no, &payload)?;
    }
    if records > 0 && rng.gen_bool(0.2) {
        fx.rseg
            .truncate_end(&fx.env, undo, rng.gen_range(0..records))?;
    }
    match kind {
        UndoKind::Insert => {
            fx.rseg.set_state_at_finish(&fx.env, undo)?;
            fx.rseg.commit_cleanup(&fx.env, undo)?;
        }
        UndoKind::Update => {
            let trx_no = trx_ids.fetch_add(1, Ordering::Relaxed);
            let state = fx.rseg.commit_update(&fx.env, undo, trx_no)?;
            assert!(matches!(state, UndoState::Cached | UndoState::ToPurge));
        }
    }
    Ok(())
}

#[test]
fn size_accounting_survives_concurrent_traffic() -> Result<()> {
    let fx = Arc::new(Fixture::new()?);
    let trx_ids = Arc::new(AtomicU64::new(1));
    let done = Arc::new(AtomicBool::new(false));
    let start = Arc::new(Barrier::new(WORKERS + 1));

    let workers: Vec<_> = (0..WORKERS)
        .map(|n| {
            let fx = Arc::clone(&fx);
            let trx_ids = Arc::clone(&trx_ids);
            let start = Arc::clone(&start);
            thread::spawn(move || -> Result<()> {
                let mut rng = ChaCha8Rng::seed_from_u64(0xC0FFEE + n as u64);
                start.wait();
                for _ in 0..TRANSACTIONS_PER_WORKER {
                    run_transaction(&fx, &mut rng, &trx_ids)?;
                }
                Ok(())
            })
        })
        .collect();

    let purger = {
        let fx = Arc::clone(&fx);
        let trx_ids = Arc::clone(&trx_ids);
        let done = Arc::clone(&done);
        let start = Arc::clone(&start);
        thread::spawn(move || -> Result<usize> {
            start.wait();
            let mut passes = 0;
            while !done.load(Ordering::Acquire) {
                let horizon = trx_ids.load(Ordering::Relaxed).saturating_sub(20);
                fx.rseg.truncate_history(
                    &fx.env,
                    PurgeLimit {
                        trx_no: horizon,
                        undo_no: 1,
                    },
                )?;
                fx.rseg.check_invariants(&fx.env)?;
                passes += 1;
                thread::yield_now();
            }
            Ok(passes)
        })
    };

    for worker in workers {
        worker.join().expect("worker panicked")?;
    }
    done.store(true, Ordering::Release);
    let passes = purger.join().expect("purger panicked")?;
    assert!(passes > 0);

    fx.rseg.check_invariants(&fx.env)?;
    fx.rseg.truncate_history(
        &fx.env,
        PurgeLimit {
            trx_no: u64::MAX,
            undo_no: 0,
        },
    )?;
    assert_eq!(fx.rseg.history_size(&fx.env)?, 0);
    let stats = fx.rseg.stats();
    assert_eq!(stats.insert_active + stats.update_active, 0);
    assert_eq!(
        stats.curr_size as usize,
        1 + stats.insert_cached + stats.update_cached
    );
    fx.rseg.check_invariants(&fx.env)?;
    fx.reopen()?.check_invariants(&fx.env)
}
