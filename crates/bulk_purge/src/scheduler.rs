//! Bounded-concurrency scheduling of admitted delete batches.
//!
//! One task owns a `FuturesUnordered` of at most `width` units. A unit holds
//! its slot while it negotiates admission (sample, decide, sleep, resample)
//! and then while it deletes; the first unit to finish frees its slot for the
//! next bucket from the generator. Generation and the in-flight units are
//! polled together, so a unit starts as soon as its bucket is cut. Nothing is
//! spawned, so the in-flight set needs no lock.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use futures_util::stream::{FuturesUnordered, StreamExt};
use serde::Serialize;
use tokio::time::Instant;

use crate::admission;
use crate::bucketing::{Bucket, BucketGenerator};
use crate::executor::{DeleteExecutor, DeletionTask, ExecutionResult};
use crate::store::SessionContext;
use crate::telemetry::TelemetrySampler;

/// Default pool width: one slot per core, never fewer than four.
pub fn default_width() -> usize {
    let cores = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    cores.max(crate::config::MIN_CONCURRENCY)
}

/// Totals for one scheduler run.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct RunTotals {
    pub buckets: u64,
    pub records: u64,
    pub deleted: u64,
    pub failed_buckets: u64,
    pub throttled_waits: u64,
    /// Most executor invocations observed running at once.
    pub peak_in_flight: usize,
}

#[derive(Default)]
struct Gauges {
    executing: AtomicUsize,
    peak_executing: AtomicUsize,
    throttled: AtomicU64,
}

impl Gauges {
    fn enter(&self) -> ExecutingGuard<'_> {
        let now = self.executing.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_executing.fetch_max(now, Ordering::SeqCst);
        ExecutingGuard { gauges: self }
    }
}

struct ExecutingGuard<'a> {
    gauges: &'a Gauges,
}

impl Drop for ExecutingGuard<'_> {
    fn drop(&mut self) {
        self.gauges.executing.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct TaskScheduler {
    sampler: TelemetrySampler,
    executor: DeleteExecutor,
    session: Arc<SessionContext>,
    width: usize,
    progress_interval: Option<Duration>,
}

impl TaskScheduler {
    pub fn new(
        sampler: TelemetrySampler,
        executor: DeleteExecutor,
        session: Arc<SessionContext>,
        width: usize,
    ) -> Self {
        Self {
            sampler,
            executor,
            session,
            width: width.max(1),
            progress_interval: None,
        }
    }

    /// Log a running summary at most once per `interval`.
    pub fn with_progress_interval(mut self, interval: Option<Duration>) -> Self {
        self.progress_interval = interval.filter(|d| !d.is_zero());
        self
    }

    pub fn width(&self) -> usize {
        self.width
    }

    /// Drain `generator`, calling `on_result` as each bucket finishes.
    ///
    /// Per-bucket delete failures are reported through the result and do not
    /// stop the run. Generation or telemetry failures stop submission; units
    /// already in flight are allowed to finish before the error is returned.
    pub async fn run<F>(
        &self,
        generator: &mut BucketGenerator,
        mut on_result: F,
    ) -> anyhow::Result<RunTotals>
    where
        F: FnMut(&ExecutionResult),
    {
        let gauges = Gauges::default();
        let mut totals = RunTotals::default();
        let mut units = FuturesUnordered::new();
        let mut fatal: Option<anyhow::Error> = None;
        let mut exhausted = false;
        let started = Instant::now();
        let mut last_progress = started;

        loop {
            let can_fill = fatal.is_none() && !exhausted && units.len() < self.width;
            // Pulling the next bucket is polled alongside the in-flight units,
            // so a slow row stream never stalls admission or deletes. Dropping
            // an unfinished `next_bucket` loses nothing: rows are buffered in
            // the generator as they arrive.
            tokio::select! {
                next = generator.next_bucket(), if can_fill => match next {
                    Ok(Some(bucket)) => {
                        totals.buckets += 1;
                        totals.records += bucket.size as u64;
                        units.push(self.run_unit(bucket, &gauges));
                    }
                    Ok(None) => exhausted = true,
                    Err(err) => fatal = Some(err),
                },
                Some(outcome) = units.next(), if !units.is_empty() => {
                    match outcome {
                        Ok(result) => {
                            totals.deleted += result.deleted_count;
                            if !result.is_ok() {
                                totals.failed_buckets += 1;
                            }
                            on_result(&result);
                        }
                        Err(err) => {
                            if fatal.is_none() {
                                fatal = Some(err);
                            } else {
                                tracing::warn!(error = %format!("{err:#}"), "additional unit failure while stopping");
                            }
                        }
                    }

                    if let Some(interval) = self.progress_interval {
                        if last_progress.elapsed() >= interval {
                            last_progress = Instant::now();
                            tracing::info!(
                                buckets = totals.buckets,
                                deleted = totals.deleted,
                                failed = totals.failed_buckets,
                                in_flight = units.len(),
                                elapsed = %humantime::format_duration(round_secs(started.elapsed())),
                                "purge progress"
                            );
                        }
                    }
                }
                else => break,
            }
        }

        totals.throttled_waits = gauges.throttled.load(Ordering::SeqCst);
        totals.peak_in_flight = gauges.peak_executing.load(Ordering::SeqCst);
        match fatal {
            Some(err) => Err(err),
            None => Ok(totals),
        }
    }

    async fn run_unit(&self, bucket: Bucket, gauges: &Gauges) -> anyhow::Result<ExecutionResult> {
        let ordinal = bucket.ordinal;
        loop {
            let snapshot = self
                .sampler
                .sample()
                .await
                .with_context(|| format!("telemetry for batch {ordinal}"))?;
            let decision = {
                let mut rng = rand::thread_rng();
                admission::decide(&snapshot, &mut rng)
            };
            if decision.is_proceed() {
                break;
            }
            gauges.throttled.fetch_add(1, Ordering::SeqCst);
            tracing::info!(
                bucket = ordinal,
                reason = decision.reason().unwrap_or_default(),
                delay_ms = decision.delay().as_millis() as u64,
                "batch {ordinal} awaiting scheduling due to back pressure"
            );
            tokio::time::sleep(decision.delay()).await;
        }

        let _executing = gauges.enter();
        let task = DeletionTask {
            bucket,
            session: self.session.clone(),
        };
        Ok(self.executor.execute(&task).await)
    }
}

fn round_secs(d: Duration) -> Duration {
    Duration::from_secs(d.as_secs())
}
