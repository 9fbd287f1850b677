//! Bucket generation over the store's windowed row stream.
//!
//! The store numbers matching records by ascending sort key and tags each
//! row with its bucket id, the running count inside that bucket, and the
//! bucket's final size. A bucket is complete exactly when its running count
//! reaches that size, so buckets are cut in one forward pass without ever
//! counting the whole match set. Only the bucket being assembled is held in
//! memory.

use anyhow::Context;
use futures_util::StreamExt;
use serde_json::Value;

use crate::store::{BucketQuery, BucketRow, DocumentStore, Namespace, RecordId, RowStream, SessionContext};

/// A bounded batch of record ids deleted together.
#[derive(Clone, Debug, PartialEq)]
pub struct Bucket {
    /// 1-based position in generation order.
    pub ordinal: u64,
    pub record_ids: Vec<RecordId>,
    pub size: usize,
    /// Records emitted so far, this bucket included.
    pub cumulative_count: u64,
    /// Sort-key value of the first and last record.
    pub first_key: Value,
    pub last_key: Value,
}

struct PendingBucket {
    bucket_id: u64,
    total: u64,
    ids: Vec<RecordId>,
    first_key: Value,
}

/// Lazy, forward-only sequence of [`Bucket`]s.
///
/// Restartable only by opening a new generator.
pub struct BucketGenerator {
    rows: RowStream,
    limit: u64,
    pending: Option<PendingBucket>,
    last_bucket_id: u64,
    cumulative: u64,
    exhausted: bool,
}

impl BucketGenerator {
    /// Open the windowed row stream for `query` and wrap it.
    pub async fn open(
        store: &dyn DocumentStore,
        ns: &Namespace,
        query: &BucketQuery,
        session: &SessionContext,
    ) -> anyhow::Result<Self> {
        anyhow::ensure!(query.bucket_size > 0, "bucket size must be > 0");
        let rows = store
            .bucket_rows(ns, query, session)
            .await
            .with_context(|| format!("open bucket stream on {ns}"))?;
        Ok(Self::from_rows(rows, query.bucket_size))
    }

    pub fn from_rows(rows: RowStream, bucket_size: usize) -> Self {
        Self {
            rows,
            limit: bucket_size.max(1) as u64,
            pending: None,
            last_bucket_id: 0,
            cumulative: 0,
            exhausted: false,
        }
    }

    /// Records emitted in completed buckets so far.
    pub fn emitted(&self) -> u64 {
        self.cumulative
    }

    /// Next complete bucket, or `None` once the match set is exhausted.
    ///
    /// Store errors and rows that break the windowing contract are fatal.
    ///
    /// Cancel safe: rows of a partly assembled bucket stay in the generator,
    /// so a dropped call resumes where it left off.
    pub async fn next_bucket(&mut self) -> anyhow::Result<Option<Bucket>> {
        if self.exhausted {
            return Ok(None);
        }
        loop {
            let row = match self.rows.next().await {
                Some(Ok(row)) => row,
                Some(Err(err)) => {
                    self.exhausted = true;
                    return Err(err).context("bucket generation failed");
                }
                None => {
                    self.exhausted = true;
                    if let Some(pending) = self.pending.take() {
                        anyhow::bail!(
                            "row stream ended inside bucket {} ({} of {} rows)",
                            pending.bucket_id,
                            pending.ids.len(),
                            pending.total
                        );
                    }
                    return Ok(None);
                }
            };
            if let Some(bucket) = self.accept(row)? {
                return Ok(Some(bucket));
            }
        }
    }

    fn accept(&mut self, row: BucketRow) -> anyhow::Result<Option<Bucket>> {
        anyhow::ensure!(
            row.bucket_total >= 1 && row.bucket_total <= self.limit,
            "bucket {} reports size {} outside 1..={}",
            row.bucket_id,
            row.bucket_total,
            self.limit
        );

        if let Some(pending) = &self.pending {
            anyhow::ensure!(
                row.bucket_id == pending.bucket_id
                    && row.running_count == pending.ids.len() as u64 + 1
                    && row.bucket_total == pending.total,
                "row {} out of sequence: bucket {} running {} while assembling bucket {} at {}",
                row.record_id,
                row.bucket_id,
                row.running_count,
                pending.bucket_id,
                pending.ids.len()
            );
        } else {
            anyhow::ensure!(
                row.bucket_id == self.last_bucket_id + 1 && row.running_count == 1,
                "row {} opens bucket {} at running count {}; expected bucket {} at 1",
                row.record_id,
                row.bucket_id,
                row.running_count,
                self.last_bucket_id + 1
            );
            self.pending = Some(PendingBucket {
                bucket_id: row.bucket_id,
                total: row.bucket_total,
                ids: Vec::with_capacity(row.bucket_total as usize),
                first_key: row.sort_value.clone(),
            });
        }

        let complete = match self.pending.as_mut() {
            Some(pending) => {
                pending.ids.push(row.record_id);
                row.running_count == pending.total
            }
            None => false,
        };
        if !complete {
            return Ok(None);
        }
        let Some(done) = self.pending.take() else {
            return Ok(None);
        };
        self.last_bucket_id = done.bucket_id;
        self.cumulative += done.ids.len() as u64;
        Ok(Some(Bucket {
            ordinal: done.bucket_id,
            size: done.ids.len(),
            record_ids: done.ids,
            cumulative_count: self.cumulative,
            first_key: done.first_key,
            last_key: row.sort_value,
        }))
    }
}
