// benches/perf_harness_bench.rs

//! Benchmarks the closed-loop perf harness itself against a trivial no-op
//! service, at a few thread counts, to track the harness's own overhead.

use criterion::{Criterion, criterion_group, criterion_main};
use nuproc::perf::{PerfConfig, run};
use tokio::runtime::Runtime;

fn bench_config(threads: usize) -> PerfConfig {
    PerfConfig {
        threads,
        target_mops: 0.5,
        duration_us: 100_000,
        warmup_us: 10_000,
        miss_ddl_thresh_us: 2_000,
        percentiles: vec![50.0, 99.0, 99.9],
        timeseries_bucket_us: 20_000,
    }
}

pub fn bench_noop_service(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("perf_harness_noop_service");

    for threads in [1usize, 4, 16] {
        group.bench_function(format!("threads_{threads}"), |b| {
            b.to_async(&rt)
                .iter(|| async move { run(bench_config(threads), || async {}, None).await });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_noop_service);
criterion_main!(benches);
