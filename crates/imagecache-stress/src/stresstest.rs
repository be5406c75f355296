use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use imagecache::caching::CacheError;
use imagecache::config::Config as ImageCacheConfig;
use imagecache::service::ImageCache;
use imagecache::types::ResourceKey;
use imagecache_test::ImageServer;
use sentry::SentryFutureExt;
use sketches_ddsketch::DDSketch;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::workloads::WorkloadsConfig;

/// How long a request that is going to be cancelled runs before the cancellation.
const CANCEL_AFTER: Duration = Duration::from_millis(1);

#[derive(Default)]
struct Outcomes {
    durations: DDSketch,
    cancelled: usize,
    failed: usize,
}

pub async fn perform_stresstest(
    mut service_config: ImageCacheConfig,
    workloads: WorkloadsConfig,
    duration: Duration,
) -> Result<()> {
    // keep the cache directory out of the user's cache unless configured otherwise
    let cache_dir = tempfile::tempdir().context("failed to create cache directory")?;
    if service_config.cache_dir.is_none() {
        service_config.cache_dir = Some(cache_dir.path().to_owned());
    }

    let server = ImageServer::new();
    let cache =
        ImageCache::from_config(&service_config).context("failed to create image cache")?;

    // run the workloads concurrently
    let mut tasks = Vec::with_capacity(workloads.workloads.len());
    for (index, workload) in workloads.workloads.into_iter().enumerate() {
        let start = Instant::now();
        let deadline = tokio::time::Instant::from_std(start + duration);
        let cache = cache.clone();
        let workload = Arc::new(workload);
        let base_url = server.url("/");

        let task = tokio::spawn(async move {
            let concurrency = workload.concurrency.max(1);
            let outcomes = Arc::new(Mutex::new(Outcomes::default()));
            let semaphore = Arc::new(Semaphore::new(concurrency));
            let mut issued = 0;

            // See <https://docs.rs/tokio/latest/tokio/time/struct.Sleep.html#examples>
            let sleep = tokio::time::sleep_until(deadline);
            tokio::pin!(sleep);

            loop {
                if deadline.elapsed() > Duration::ZERO {
                    break;
                }
                tokio::select! {
                    permit = semaphore.clone().acquire_owned() => {
                        let op = issued;
                        issued += 1;
                        let key = ResourceKey::from(format!("{base_url}{}", workload.image_path(index, op)));
                        let cancel = CancellationToken::new();
                        if workload.should_cancel(op) {
                            let cancel = cancel.clone();
                            tokio::spawn(async move {
                                tokio::time::sleep(CANCEL_AFTER).await;
                                cancel.cancel();
                            });
                        }

                        let cache = cache.clone();
                        let outcomes = Arc::clone(&outcomes);
                        let task_start = Instant::now();

                        let hub = sentry::Hub::new_from_top(sentry::Hub::current());
                        let ctx = sentry::TransactionContext::new("stresstest", "stresstest");
                        let transaction = hub.start_transaction(ctx);

                        let future = async move {
                            let result = cache.resolve_with(&key, &cancel).await;

                            transaction.finish();

                            let mut outcomes = outcomes.lock().unwrap();
                            match result {
                                Ok(_) => outcomes.durations.add(task_start.elapsed().as_secs_f64()),
                                Err(CacheError::Cancelled) => outcomes.cancelled += 1,
                                Err(_) => outcomes.failed += 1,
                            }

                            drop(permit);
                        };
                        let future = future.bind_hub(hub);

                        tokio::spawn(future);
                    }
                    _ = &mut sleep => {
                        break;
                    }
                }
            }

            // by acquiring *all* the semaphores, we essentially wait for all outstanding tasks to finish
            let _permits = semaphore.acquire_many(concurrency as u32).await;

            let outcomes = std::mem::take(&mut *outcomes.lock().unwrap());
            (concurrency, outcomes)
        });
        tasks.push(task);
    }

    let finished_tasks = futures::future::join_all(tasks).await;

    for (i, task) in finished_tasks.into_iter().enumerate() {
        let (concurrency, outcomes) = task.context("workload panicked")?;
        let Outcomes {
            durations,
            cancelled,
            failed,
        } = outcomes;

        let ops = durations.count();
        let ops_ps = ops as f32 / duration.as_secs_f32();
        println!("Workload {i} (concurrency: {concurrency}): {ops} operations, {ops_ps:.2} ops/s");
        println!("  cancelled: {cancelled}; failed: {failed}");

        if ops > 0 {
            let avg = Duration::from_secs_f64(durations.sum().unwrap_or(0.0) / ops as f64);
            let quantile = |q| {
                let secs = durations.quantile(q).ok().flatten().unwrap_or(0.0);
                Duration::from_secs_f64(secs)
            };
            let (p50, p90, p99) = (quantile(0.5), quantile(0.9), quantile(0.99));
            println!("  avg: {avg:.2?}; p50: {p50:.2?}; p90: {p90:.2?}; p99: {p99:.2?}");
        }
    }

    println!();
    println!("Network fetches: {}", server.accesses());

    Ok(())
}
