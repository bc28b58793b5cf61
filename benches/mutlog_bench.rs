//! Mutation log append + flush throughput benchmarking.

use std::path::Path;
use std::time::Duration;

use replog::{Gpid, MutationData, MutationLog, MutationLogOptions, ReplogError};

use bytes::Bytes;

use rand::Rng;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};

use tokio::runtime::Runtime;

static BATCHES: [usize; 3] = [1, 8, 64];
static SIZES: [usize; 3] = [64, 4096, 64 * 1024];

async fn open_log(dir: &str) -> Result<MutationLog, ReplogError> {
    if Path::new(dir).exists() {
        std::fs::remove_dir_all(dir)?;
    }
    MutationLog::open(
        "bench",
        Path::new(dir),
        MutationLogOptions::default(),
        |_, _| Ok(()),
    )
    .await
}

/// Appends one batch of mutations and waits for the logger to write it.
async fn append_batch(
    log: &mut MutationLog,
    next_decree: &mut i64,
    batch: usize,
    payload: &Bytes,
) -> Result<(), ReplogError> {
    for _ in 0..batch {
        *next_decree += 1;
        let mut data = MutationData::new(
            Gpid::new(1, 0),
            1,
            *next_decree,
            *next_decree - 1,
            vec![payload.clone()],
        );
        log.append(&mut data)?;
    }
    log.flush(*next_decree as u64)?;
    log.get_result().await?;
    Ok(())
}

fn mutlog_bench_group(c: &mut Criterion) {
    let mut group = c.benchmark_group("mutlog_bench");
    group
        .sample_size(30)
        .warm_up_time(Duration::from_millis(100))
        .measurement_time(Duration::from_secs(4));

    let runtime = match Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => panic!("cannot start tokio runtime: {}", e),
    };

    for size in SIZES {
        let payload: Bytes = rand::thread_rng()
            .sample_iter(rand::distributions::Standard)
            .take(size)
            .collect::<Vec<u8>>()
            .into();

        for batch in BATCHES {
            let dir = format!("/tmp/bench-replog-{}-{}", size, batch);
            let mut log = match runtime.block_on(open_log(&dir)) {
                Ok(log) => log,
                Err(e) => panic!("cannot open log '{}': {}", dir, e),
            };
            let mut next_decree = 0;

            group.bench_with_input(
                BenchmarkId::from_parameter(format!("{}x{}", size, batch)),
                &batch,
                |b, &batch| {
                    b.iter(|| {
                        runtime.block_on(append_batch(
                            &mut log,
                            &mut next_decree,
                            batch,
                            &payload,
                        ))
                    });
                },
            );
        }
    }

    group.finish();
}

criterion_group!(benches, mutlog_bench_group);
criterion_main!(benches);
