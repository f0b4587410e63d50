// src/perf/mod.rs

//! Closed-loop Poisson workload generator (spec §4.11): pre-generated
//! exponential arrivals, an optional warmup pass, an optional multi-client
//! TCP barrier, a miss-deadline drop policy, and percentile/timeseries
//! statistics over the measured service latencies.

use rand::Rng;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info};

/// Parameters for one harness run. `target_mops` is the aggregate request
/// rate in millions of operations per second across all `threads`.
#[derive(Debug, Clone)]
pub struct PerfConfig {
    pub threads: usize,
    pub target_mops: f64,
    pub duration_us: u64,
    pub warmup_us: u64,
    pub miss_ddl_thresh_us: u64,
    /// Percentiles to report, e.g. `[50.0, 90.0, 99.0, 99.9]`.
    pub percentiles: Vec<f64>,
    /// Width of each timeseries bucket, in microseconds.
    pub timeseries_bucket_us: u64,
}

impl Default for PerfConfig {
    fn default() -> Self {
        Self {
            threads: 1,
            target_mops: 1.0,
            duration_us: 1_000_000,
            warmup_us: 0,
            miss_ddl_thresh_us: 1_000,
            percentiles: vec![50.0, 90.0, 99.0, 99.9],
            timeseries_bucket_us: 100_000,
        }
    }
}

/// Coordinates a multi-node run so every worker starts its measured window
/// at the same instant: one node hosts, the rest join.
pub enum BarrierRole {
    Host { addr: SocketAddr, workers: usize },
    Join { addr: SocketAddr },
}

async fn host_barrier(addr: SocketAddr, workers: usize) -> std::io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, workers, "perf barrier host waiting for workers");
    let mut joined = Vec::with_capacity(workers);
    for _ in 0..workers {
        let (mut stream, _) = listener.accept().await?;
        stream.read_u8().await?;
        joined.push(stream);
    }
    for mut stream in joined {
        stream.write_u8(1).await?;
    }
    Ok(())
}

async fn join_barrier(addr: SocketAddr) -> std::io::Result<()> {
    let mut stream = TcpStream::connect(addr).await?;
    stream.write_u8(1).await?;
    stream.read_u8().await?;
    Ok(())
}

async fn run_barrier(role: BarrierRole) -> std::io::Result<()> {
    match role {
        BarrierRole::Host { addr, workers } => host_barrier(addr, workers).await,
        BarrierRole::Join { addr } => join_barrier(addr).await,
    }
}

/// One served request's timing, relative to the measured window's start.
#[derive(Debug, Clone, Copy)]
pub struct SampleRecord {
    pub absolute_us: u64,
    pub relative_us: u64,
    pub duration_us: u64,
}

#[derive(Debug, Clone)]
pub struct IntervalStats {
    pub start_us: u64,
    pub percentiles: Vec<(f64, f64)>,
    pub count: usize,
}

#[derive(Debug, Clone)]
pub struct PerfStats {
    pub average_us: f64,
    pub percentiles: Vec<(f64, f64)>,
    pub timeseries: Vec<IntervalStats>,
    pub achieved_mops: f64,
    pub served: u64,
    pub dropped: u64,
}

/// Pre-generates exponential inter-arrival times (mean `threads /
/// target_mops` microseconds, per spec §4.11 step 1) until their sum would
/// exceed `window_us`, returning the cumulative arrival schedule.
fn generate_arrivals(threads: usize, target_mops: f64, window_us: u64) -> Vec<u64> {
    let mean_us = threads as f64 / target_mops;
    let mut rng = rand::thread_rng();
    let mut arrivals = Vec::new();
    let mut t = 0f64;
    loop {
        let u: f64 = rng.gen_range(f64::EPSILON..1.0);
        t += -mean_us * u.ln();
        if t as u64 > window_us {
            break;
        }
        arrivals.push(t as u64);
    }
    arrivals
}

fn percentile(sorted: &[u64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let rank = (p / 100.0 * (sorted.len() - 1) as f64).round() as usize;
    sorted[rank.min(sorted.len() - 1)] as f64
}

fn summarize(records: &[SampleRecord], cfg: &PerfConfig, window_us: u64, dropped: u64) -> PerfStats {
    let mut durations: Vec<u64> = records.iter().map(|r| r.duration_us).collect();
    durations.sort_unstable();
    let average_us = if durations.is_empty() {
        0.0
    } else {
        durations.iter().sum::<u64>() as f64 / durations.len() as f64
    };
    let percentiles = cfg
        .percentiles
        .iter()
        .map(|&p| (p, percentile(&durations, p)))
        .collect();

    let mut timeseries = Vec::new();
    if cfg.timeseries_bucket_us > 0 {
        let num_buckets = (window_us / cfg.timeseries_bucket_us).max(1);
        for bucket in 0..num_buckets {
            let start = bucket * cfg.timeseries_bucket_us;
            let end = start + cfg.timeseries_bucket_us;
            let mut bucket_durations: Vec<u64> = records
                .iter()
                .filter(|r| r.relative_us >= start && r.relative_us < end)
                .map(|r| r.duration_us)
                .collect();
            bucket_durations.sort_unstable();
            let percentiles = cfg
                .percentiles
                .iter()
                .map(|&p| (p, percentile(&bucket_durations, p)))
                .collect();
            timeseries.push(IntervalStats {
                start_us: start,
                percentiles,
                count: bucket_durations.len(),
            });
        }
    }

    let achieved_mops = records.len() as f64 / window_us.max(1) as f64;
    PerfStats {
        average_us,
        percentiles,
        timeseries,
        achieved_mops,
        served: records.len() as u64,
        dropped,
    }
}

/// Runs the closed-loop harness. `serve` is invoked once per scheduled
/// arrival that isn't dropped for missing its deadline; its wall-clock
/// duration becomes that request's `duration_us`.
pub async fn run<F, Fut>(cfg: PerfConfig, serve: F, barrier: Option<BarrierRole>) -> PerfStats
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = ()> + Send,
{
    let serve = Arc::new(serve);

    if cfg.warmup_us > 0 {
        debug!(warmup_us = cfg.warmup_us, "perf harness warmup pass");
        run_window(&cfg, Arc::clone(&serve), cfg.warmup_us).await;
    }

    if let Some(role) = barrier
        && let Err(e) = run_barrier(role).await
    {
        tracing::warn!("perf barrier failed: {e}, proceeding unsynchronized");
    }

    let (records, dropped) = run_window(&cfg, serve, cfg.duration_us).await;
    summarize(&records, &cfg, cfg.duration_us, dropped)
}

/// Runs one measured window across `cfg.threads` tasks, returning the
/// served samples and a count of arrivals dropped for missing their
/// deadline by more than `cfg.miss_ddl_thresh_us` (the miss-deadline drop
/// policy, spec §4.11).
async fn run_window<F, Fut>(cfg: &PerfConfig, serve: Arc<F>, window_us: u64) -> (Vec<SampleRecord>, u64)
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = ()> + Send,
{
    let start = tokio::time::Instant::now();
    let mut handles = Vec::with_capacity(cfg.threads);
    for _ in 0..cfg.threads {
        let arrivals = generate_arrivals(cfg.threads, cfg.target_mops, window_us);
        let serve = Arc::clone(&serve);
        let miss_thresh = cfg.miss_ddl_thresh_us;
        handles.push(tokio::spawn(async move {
            let mut records = Vec::with_capacity(arrivals.len());
            let mut dropped = 0u64;
            for relative_us in arrivals {
                let deadline = start + Duration::from_micros(relative_us);
                let now = tokio::time::Instant::now();
                if now > deadline {
                    let late_by = (now - deadline).as_micros() as u64;
                    if late_by > miss_thresh {
                        dropped += 1;
                        continue;
                    }
                } else {
                    tokio::time::sleep_until(deadline).await;
                }
                let call_start = tokio::time::Instant::now();
                serve().await;
                let duration_us = call_start.elapsed().as_micros() as u64;
                records.push(SampleRecord {
                    absolute_us: call_start.duration_since(start).as_micros() as u64,
                    relative_us,
                    duration_us,
                });
            }
            (records, dropped)
        }));
    }

    let mut all = Vec::new();
    let mut total_dropped = 0u64;
    for h in handles {
        if let Ok((mut records, dropped)) = h.await {
            all.append(&mut records);
            total_dropped += dropped;
        }
    }
    (all, total_dropped)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arrivals_are_monotonic_and_bounded() {
        let arrivals = generate_arrivals(4, 1.0, 10_000);
        for w in arrivals.windows(2) {
            assert!(w[1] >= w[0]);
        }
        assert!(arrivals.iter().all(|&t| t <= 10_000));
    }

    #[tokio::test]
    async fn run_serves_requests_and_reports_stats() {
        let cfg = PerfConfig {
            threads: 2,
            target_mops: 0.05,
            duration_us: 20_000,
            warmup_us: 0,
            miss_ddl_thresh_us: 5_000,
            percentiles: vec![50.0, 99.0],
            timeseries_bucket_us: 10_000,
        };
        let stats = run(cfg, || async {}, None).await;
        assert!(stats.served > 0);
        assert!(stats.average_us >= 0.0);
        assert_eq!(stats.percentiles.len(), 2);
    }
}
