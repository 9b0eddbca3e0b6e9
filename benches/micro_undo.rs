#![forbid(unsafe_code)]

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use undoseg::testkit::Fixture;
use undoseg::{PurgeLimit, RecordType, UndoKind};

const RECORDS_PER_TRX: u64 = 16;

fn micro_undo(c: &mut Criterion) {
    let mut group = c.benchmark_group("micro/undo");
    group.sample_size(30);
    for payload_len in [64usize, 512] {
        let mut harness = UndoHarness::new(payload_len);
        group.throughput(Throughput::Elements(RECORDS_PER_TRX));
        group.bench_with_input(
            BenchmarkId::new("insert_trx", payload_len),
            &payload_len,
            |b, _| {
                b.iter(|| harness.insert_trx());
            },
        );
        group.bench_with_input(
            BenchmarkId::new("update_trx_purge", payload_len),
            &payload_len,
            |b, _| {
                b.iter(|| harness.update_trx_and_purge());
            },
        );
    }
    group.finish();
}

struct UndoHarness {
    fx: Fixture,
    payload: Vec<u8>,
    trx: u64,
}

impl UndoHarness {
    fn new(payload_len: usize) -> Self {
        Self {
            fx: Fixture::new().expect("fixture"),
            payload: vec![0xCD; payload_len],
            trx: 0,
        }
    }

    fn fill(&mut self, kind: UndoKind, rec_type: RecordType) -> undoseg::UndoRef {
        self.trx += 1;
        let undo = self.fx.assign(kind, self.trx).expect("assign");
        for undo_no in 0..RECORDS_PER_TRX {
            self.fx
                .rseg
                .append_record(&self.fx.env, undo, rec_type, undo_no, &self.payload)
                .expect("append");
        }
        undo
    }

    fn insert_trx(&mut self) {
        let undo = self.fill(UndoKind::Insert, RecordType::Insert);
        let fx = &self.fx;
        fx.rseg.set_state_at_finish(&fx.env, undo).expect("finish");
        fx.rseg.commit_cleanup(&fx.env, undo).expect("cleanup");
    }

    fn update_trx_and_purge(&mut self) {
        let undo = self.fill(UndoKind::Update, RecordType::UpdateExisting);
        let fx = &self.fx;
        fx.rseg
            .commit_update(&fx.env, undo, self.trx)
            .expect("commit");
        fx.rseg
            .truncate_history(
                &fx.env,
                PurgeLimit {
                    trx_no: self.trx + 1,
                    undo_no: 0,
                },
            )
            .expect("purge");
    }
}

criterion_group!(benches, micro_undo);
criterion_main!(benches);
