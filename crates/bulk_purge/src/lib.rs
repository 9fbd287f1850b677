//! Congestion-aware bulk deletion for document stores.
//!
//! A purge streams the records matching a filter in fixed-size buckets,
//! admits each bucket only when the store's resource counters allow it, and
//! deletes admitted buckets through a bounded pool. With the safeguard on
//! (the default) every delete runs in a transaction that is rolled back, so a
//! run reports what it would remove without removing anything.

use std::sync::Arc;

use anyhow::Context;
use serde::Serialize;

pub mod admission;
pub mod bucketing;
pub mod config;
pub mod document;
pub mod error;
pub mod executor;
pub mod fjall_store;
pub mod memory;
pub mod scheduler;
pub mod store;
pub mod telemetry;
pub mod verifier;

pub use admission::AdmissionDecision;
pub use bucketing::{Bucket, BucketGenerator};
pub use config::PurgeConfig;
pub use error::StoreError;
pub use executor::{DeleteExecutor, DeletionTask, ExecutionResult};
pub use fjall_store::{FjallStore, FjallStoreConfig};
pub use memory::MemoryStore;
pub use scheduler::{RunTotals, TaskScheduler};
pub use store::{DocumentStore, Filter, Namespace, RecordId, SessionContext};
pub use telemetry::{CongestionSnapshot, TelemetrySampler, UtilizationStatus};
pub use verifier::Verification;

/// Outcome of one purge.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct PurgeReport {
    /// Records still matching the filter after the run.
    pub residual: u64,
    pub buckets: u64,
    /// Records matched when the run started.
    pub matched: u64,
    /// Sum of per-bucket counts reported by the store. In simulate mode this
    /// is what would have been removed.
    pub deleted_reported: u64,
    pub failed_buckets: u64,
    pub throttled_waits: u64,
    pub simulated: bool,
}

/// Run one purge against `store`.
pub async fn run(store: Arc<dyn DocumentStore>, config: &PurgeConfig) -> anyhow::Result<PurgeReport> {
    config.validate().context("invalid purge configuration")?;

    let ns = config.namespace();
    let session = Arc::new(config.session_context());
    let width = config.concurrency_width();
    tracing::info!(
        namespace = %ns,
        filter = %config.filter,
        safeguard = config.safeguard,
        bucket_size = config.bucket_size,
        width,
        "purging {ns} where {} (safeguard {})",
        config.filter,
        if config.safeguard { "on" } else { "off" }
    );

    let mut generator =
        BucketGenerator::open(store.as_ref(), &ns, &config.bucket_query(), &session).await?;

    let sampler = TelemetrySampler::new(store.clone(), config.telemetry);
    let executor =
        DeleteExecutor::new(store.clone(), ns.clone()).with_transient_retries(config.transient_retries);
    let scheduler = TaskScheduler::new(sampler, executor, session.clone(), width)
        .with_progress_interval(config.progress_interval);

    let simulate = session.simulate;
    let totals = scheduler
        .run(&mut generator, |result| match &result.error {
            None if simulate => tracing::info!(
                bucket = result.bucket_ordinal,
                deleted = result.deleted_count,
                "batch {} would delete {} documents",
                result.bucket_ordinal,
                result.deleted_count
            ),
            None => tracing::info!(
                bucket = result.bucket_ordinal,
                deleted = result.deleted_count,
                "batch {} deleted {} documents",
                result.bucket_ordinal,
                result.deleted_count
            ),
            Some(err) => tracing::warn!(
                bucket = result.bucket_ordinal,
                deleted = result.deleted_count,
                error = %err,
                "batch {} failed",
                result.bucket_ordinal
            ),
        })
        .await
        .with_context(|| format!("purge of {ns} aborted"))?;

    if totals.buckets == 0 {
        tracing::info!(namespace = %ns, "no matching documents");
    }

    let verification = verifier::verify(
        store.as_ref(),
        &ns,
        &config.filter,
        config.collation.as_deref(),
        simulate,
    )
    .await?;
    Ok(PurgeReport {
        residual: verification.residual,
        buckets: totals.buckets,
        matched: totals.records,
        deleted_reported: totals.deleted,
        failed_buckets: totals.failed_buckets,
        throttled_waits: totals.throttled_waits,
        simulated: verification.simulated,
    })
}
