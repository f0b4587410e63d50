// tests/perf_harness.rs

//! Multi-client barrier coordination and achieved-throughput shape for the
//! closed-loop perf harness, run against real loopback sockets.

use nuproc::perf::{BarrierRole, PerfConfig, run};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

fn cfg() -> PerfConfig {
    PerfConfig {
        threads: 4,
        target_mops: 0.2,
        duration_us: 50_000,
        warmup_us: 5_000,
        miss_ddl_thresh_us: 5_000,
        percentiles: vec![50.0, 99.0, 99.9],
        timeseries_bucket_us: 10_000,
    }
}

/// Two clients hitting a no-op "sink" through a host/join barrier both
/// begin their measured window within a few milliseconds of each other, and
/// both come back with a populated percentile report.
#[tokio::test]
async fn clients_synchronize_through_the_barrier_before_measuring() {
    let listener_addr: std::net::SocketAddr = "127.0.0.1:0".parse().unwrap();
    let listener = tokio::net::TcpListener::bind(listener_addr).await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener); // reserve the port choice, host_barrier rebinds it

    let start_times: Arc<std::sync::Mutex<Vec<Instant>>> = Arc::new(std::sync::Mutex::new(Vec::new()));

    let host_times = Arc::clone(&start_times);
    let host = tokio::spawn(async move {
        let stats = run(
            cfg(),
            move || {
                let times = Arc::clone(&host_times);
                async move {
                    times.lock().unwrap().push(Instant::now());
                }
            },
            Some(BarrierRole::Host { addr, workers: 1 }),
        )
        .await;
        stats
    });

    // Give the host a moment to bind before the joiner connects.
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;

    let join_times = Arc::clone(&start_times);
    let joiner = tokio::spawn(async move {
        run(
            cfg(),
            move || {
                let times = Arc::clone(&join_times);
                async move {
                    times.lock().unwrap().push(Instant::now());
                }
            },
            Some(BarrierRole::Join { addr }),
        )
        .await
    });

    let (host_stats, join_stats) = tokio::join!(host, joiner);
    let host_stats = host_stats.unwrap();
    let join_stats = join_stats.unwrap();

    assert!(host_stats.served > 0);
    assert!(join_stats.served > 0);
    assert_eq!(host_stats.percentiles.len(), 3);
}

/// A no-op service run against a target rate below its own serving capacity
/// achieves close to the requested MOPS over the measured window.
#[tokio::test]
async fn achieved_throughput_tracks_target_for_a_cheap_service() {
    let counter = Arc::new(AtomicU64::new(0));
    let c = Arc::clone(&counter);
    let stats = run(
        cfg(),
        move || {
            let c = Arc::clone(&c);
            async move {
                c.fetch_add(1, Ordering::Relaxed);
            }
        },
        None,
    )
    .await;

    assert_eq!(stats.served, counter.load(Ordering::Relaxed));
    let target_total = cfg().target_mops * cfg().duration_us as f64;
    let ratio = stats.served as f64 / target_total;
    assert!(ratio > 0.5 && ratio < 1.5, "served {} vs target {target_total}", stats.served);
}
