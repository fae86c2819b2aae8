use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion};
use rate_relay::{
    DataSet, DispatchResult, HistoryCache, Observation, RateBuffer, RateSource, RateTransform,
    SeriesIdentity, Timestamp, Value, ValueKind,
};

const SERIES: usize = 1_000;

fn series(i: usize) -> SeriesIdentity {
    SeriesIdentity::new(format!("host{}", i % 16), "interface", "counter")
        .with_plugin_instance(format!("eth{}", i))
}

fn buffer() -> RateBuffer {
    let source: Arc<dyn RateSource> = Arc::new(HistoryCache::new());
    let buffer = RateBuffer::new("bench", RateTransform::new(source, "rate"));
    buffer.register();
    buffer
}

fn bench_accept(c: &mut Criterion) {
    let ds = DataSet::single("counter", ValueKind::Counter);
    let identities: Vec<SeriesIdentity> = (0..SERIES).map(series).collect();

    c.bench_function("accept_1k_series", |b| {
        let buffer = buffer();
        let mut tick: i64 = 0;
        b.iter(|| {
            tick += 1;
            for (i, id) in identities.iter().enumerate() {
                let obs = Observation::single(
                    id.clone(),
                    Timestamp::from_secs(tick * 10),
                    Value::Counter((tick as u64) * 1_000 + i as u64),
                );
                black_box(buffer.accept(&ds, &obs).ok());
            }
            let _ = buffer.drain(&|_: &Observation| -> DispatchResult<()> { Ok(()) });
        })
    });
}

fn bench_drain(c: &mut Criterion) {
    let ds = DataSet::single("counter", ValueKind::Counter);

    c.bench_function("drain_1k_pending", |b| {
        b.iter_batched(
            || {
                let buffer = buffer();
                for i in 0..SERIES {
                    for (secs, value) in [(0, 0u64), (10, 500)] {
                        let obs = Observation::single(series(i), Timestamp::from_secs(secs), Value::Counter(value));
                        let _ = buffer.accept(&ds, &obs);
                    }
                }
                buffer
            },
            |buffer| {
                let sink = |obs: &Observation| -> DispatchResult<()> {
                    black_box(obs);
                    Ok(())
                };
                black_box(buffer.drain(&sink).ok())
            },
            BatchSize::SmallInput,
        )
    });
}

criterion_group!(benches, bench_accept, bench_drain);
criterion_main!(benches);
