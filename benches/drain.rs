use criterion::{black_box, BatchSize, BenchmarkId, Criterion};
use criterion::{criterion_group, criterion_main};

use journal_bridge::{AsyncJournal, JournalConfig, OpenMode, SyntheticReader};

const ENTRIES_PER_ITER: u64 = 10_000;

fn bench_drain(c: &mut Criterion) {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("runtime");

    let mut group = c.benchmark_group("drain");
    for &capacity in &[1_usize, 64, 256] {
        group.bench_with_input(
            BenchmarkId::from_parameter(capacity),
            &capacity,
            |b, &capacity| {
                b.iter_batched(
                    || {
                        runtime.block_on(async {
                            let (reader, control) = SyntheticReader::new().expect("reader");
                            control.preload(ENTRIES_PER_ITER).expect("preload");
                            let config = JournalConfig::default().with_capacity(capacity);
                            let journal =
                                AsyncJournal::with_config(reader, config).expect("journal");
                            journal.open(OpenMode::System).await.expect("open");
                            journal
                        })
                    },
                    |journal| {
                        runtime.block_on(async {
                            let entries = journal.entries().expect("entries");
                            while let Some(entry) = entries.next().await.expect("next") {
                                black_box(entry);
                            }
                        })
                    },
                    BatchSize::LargeInput,
                );
            },
        );
    }
    group.finish();
}

criterion_group!(benches, bench_drain);
criterion_main!(benches);
