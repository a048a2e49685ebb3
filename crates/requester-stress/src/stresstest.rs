use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use requester_service::Engine;
use requester_service::config::EngineConfig;
use sketches_ddsketch::DDSketch;
use tokio::sync::Semaphore;

use crate::workloads::{Counters, SyntheticRequest, Workload, WorkloadsConfig};

/// What a single workload achieved during the stresstest.
pub struct WorkloadReport {
    pub concurrency: usize,
    pub distinct_ids: usize,
    /// Time from submission until each request learned its outcome.
    pub task_durations: DDSketch,
    pub runs: usize,
    pub shared: usize,
    pub failures: usize,
}

pub async fn perform_stresstest(
    engine_config: EngineConfig,
    workloads: WorkloadsConfig,
    duration: Duration,
) -> Result<()> {
    let engine = Arc::new(Engine::from_config(&engine_config));

    let reports = run_workloads(&engine, workloads, duration).await?;
    engine.stop().await;

    for (i, report) in reports.iter().enumerate() {
        print_report(i, report, duration);
    }
    println!();
    println!("{engine:?}");

    Ok(())
}

/// Runs all workloads concurrently against `engine` until `duration` has passed.
pub async fn run_workloads(
    engine: &Arc<Engine<SyntheticRequest>>,
    workloads: WorkloadsConfig,
    duration: Duration,
) -> Result<Vec<WorkloadReport>> {
    let start = Instant::now();
    let deadline = tokio::time::Instant::from_std(start + duration);

    let mut tasks = Vec::with_capacity(workloads.workloads.len());
    for (i, workload) in workloads.workloads.into_iter().enumerate() {
        let engine = Arc::clone(engine);
        tasks.push(tokio::spawn(run_workload(engine, i, workload, deadline)));
    }

    let mut reports = Vec::with_capacity(tasks.len());
    for task in futures::future::join_all(tasks).await {
        reports.push(task.context("workload task failed")?);
    }
    Ok(reports)
}

async fn run_workload(
    engine: Arc<Engine<SyntheticRequest>>,
    index: usize,
    workload: Workload,
    deadline: tokio::time::Instant,
) -> WorkloadReport {
    let concurrency = workload.concurrency.get();
    let counters = Arc::new(Counters::default());
    let task_durations = Arc::new(Mutex::new(DDSketch::default()));
    let semaphore = Arc::new(Semaphore::new(concurrency));

    // See <https://docs.rs/tokio/latest/tokio/time/struct.Sleep.html#examples>
    let sleep = tokio::time::sleep_until(deadline);
    tokio::pin!(sleep);

    loop {
        if deadline.elapsed() > Duration::ZERO {
            break;
        }
        tokio::select! {
            permit = semaphore.clone().acquire_owned() => {
                let Ok(permit) = permit else { break };
                let (request, done) = workload.make_request(index, &counters);
                let task_durations = Arc::clone(&task_durations);
                let task_start = Instant::now();

                engine.add_request(request).await;
                tokio::spawn(async move {
                    // the outcome only goes missing if the engine dropped the request
                    if done.await.is_ok() {
                        task_durations.lock().unwrap().add(task_start.elapsed().as_secs_f64());
                    }
                    drop(permit);
                });
            }
            _ = &mut sleep => {
                break;
            }
        }
    }

    // by acquiring *all* the permits, we wait for all outstanding requests to finish
    let _permits = semaphore.acquire_many(concurrency as u32).await;

    let task_durations = std::mem::take(&mut *task_durations.lock().unwrap());
    WorkloadReport {
        concurrency,
        distinct_ids: workload.distinct_ids.get(),
        task_durations,
        runs: counters.runs.load(Ordering::Relaxed),
        shared: counters.shared.load(Ordering::Relaxed),
        failures: counters.failures.load(Ordering::Relaxed),
    }
}

fn print_report(index: usize, report: &WorkloadReport, duration: Duration) {
    let WorkloadReport {
        concurrency,
        distinct_ids,
        task_durations,
        runs,
        shared,
        failures,
    } = report;

    let ops = task_durations.count();
    let ops_ps = ops as f64 / duration.as_secs_f64();
    println!(
        "Workload {index} (concurrency: {concurrency}, IDs: {distinct_ids}): {ops} operations, {ops_ps:.2} ops/s"
    );
    if ops == 0 {
        return;
    }

    let avg = Duration::from_secs_f64(task_durations.sum().unwrap_or_default() / ops as f64);
    let p50 = quantile(task_durations, 0.5);
    let p90 = quantile(task_durations, 0.9);
    let p99 = quantile(task_durations, 0.99);
    println!("  avg: {avg:.2?}; p50: {p50:.2?}; p90: {p90:.2?}; p99: {p99:.2?}");
    println!("  runs: {runs}; shared: {shared}; failures: {failures}");
}

fn quantile(sketch: &DDSketch, q: f64) -> Duration {
    let secs = sketch.quantile(q).ok().flatten().unwrap_or_default();
    Duration::from_secs_f64(secs.max(0.0))
}
