//! The store seam: everything the purge engine consumes from the backing
//! document store.
//!
//! The engine treats the store as an opaque connection. It needs five
//! capabilities:
//! 1. filtered, sorted, windowed bucket rows (`bucket_rows`)
//! 2. batch delete by id set (`delete_ids`)
//! 3. begin/commit/abort transactions (`begin_transaction`, simulate mode only)
//! 4. administrative resource counters (`server_status`)
//! 5. session options, carried in [`SessionContext`]

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::StoreError;

/// Opaque record identifier.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(pub String);

impl RecordId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// `database.collection` target of a purge.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Namespace {
    pub database: String,
    pub collection: String,
}

impl Namespace {
    pub fn new(database: impl Into<String>, collection: impl Into<String>) -> Self {
        Self {
            database: database.into(),
            collection: collection.into(),
        }
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.database, self.collection)
    }
}

/// Predicate selecting the records to purge.
///
/// The engine never evaluates a filter; it only reads the leading field name
/// to pick the sort key. Field order is preserved as written.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Filter(Map<String, Value>);

impl Filter {
    /// Filter matching every record.
    pub fn match_all() -> Self {
        Self(Map::new())
    }

    pub fn from_map(map: Map<String, Value>) -> Self {
        Self(map)
    }

    /// Parse a JSON object such as `{"status": "expired"}`.
    pub fn from_json_str(raw: &str) -> anyhow::Result<Self> {
        let value: Value = serde_json::from_str(raw)
            .map_err(|err| anyhow::anyhow!("filter is not valid JSON: {err}"))?;
        match value {
            Value::Object(map) => Ok(Self(map)),
            other => anyhow::bail!("filter must be a JSON object, got {other}"),
        }
    }

    pub fn is_match_all(&self) -> bool {
        self.0.is_empty()
    }

    /// Leading field name, used as the sort key for bucketing.
    ///
    /// Top-level operators (`$and`, ...) never name a field, so they are skipped.
    pub fn sort_key(&self) -> Option<&str> {
        self.0
            .keys()
            .map(String::as_str)
            .find(|key| !key.starts_with('$'))
    }

    pub fn fields(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }
}

impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match serde_json::to_string(&self.0) {
            Ok(json) => f.write_str(&json),
            Err(_) => f.write_str("<unprintable filter>"),
        }
    }
}

/// Query handed to the store for bucket generation.
#[derive(Clone, Debug)]
pub struct BucketQuery {
    pub filter: Filter,
    pub bucket_size: usize,
    /// Index hint passed through to the store's planner.
    pub hint: Option<String>,
    /// Collation passed through to the store's comparison rules.
    pub collation: Option<String>,
}

/// One matched record annotated by the store's windowed aggregation.
///
/// Records are numbered 1..N by ascending `(sort key, id)`;
/// `bucket_id = ceil(ordinal / bucket_size)`, `running_count` counts rows
/// within the bucket so far and `bucket_total` is the bucket's final size.
#[derive(Clone, Debug, PartialEq)]
pub struct BucketRow {
    pub record_id: RecordId,
    pub sort_value: Value,
    pub bucket_id: u64,
    pub running_count: u64,
    pub bucket_total: u64,
}

pub type RowStream = BoxStream<'static, Result<BucketRow, StoreError>>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ReadMode {
    Primary,
    PrimaryPreferred,
    Secondary,
    SecondaryPreferred,
    Nearest,
}

/// Which replicas serve reads, optionally narrowed by tag sets.
///
/// Tag sets are tried in order; an empty set matches any node.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadPreference {
    pub mode: ReadMode,
    pub tag_sets: Vec<BTreeMap<String, String>>,
}

impl ReadPreference {
    /// Prefer analytics-tagged secondaries, then any secondary, then the primary.
    pub fn analytics_offload() -> Self {
        let mut analytics = BTreeMap::new();
        analytics.insert("nodeType".to_string(), "ANALYTICS".to_string());
        Self {
            mode: ReadMode::SecondaryPreferred,
            tag_sets: vec![analytics, BTreeMap::new()],
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadConcern {
    Local,
    Available,
    Majority,
    Snapshot,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteConcern {
    Majority,
    Nodes(u32),
}

/// Session options shared read-only by every task in a run.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionContext {
    pub causal_consistency: bool,
    pub read_preference: ReadPreference,
    pub read_concern: ReadConcern,
    pub write_concern: WriteConcern,
    /// Run every delete inside a transaction that is always aborted.
    pub simulate: bool,
}

impl SessionContext {
    pub fn new(simulate: bool) -> Self {
        Self {
            causal_consistency: true,
            read_preference: ReadPreference::analytics_offload(),
            read_concern: ReadConcern::Majority,
            write_concern: WriteConcern::Majority,
            simulate,
        }
    }
}

/// Eviction thresholds as configured inside the store, in percent.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct EvictionThresholds {
    pub target_pct: f64,
    pub trigger_pct: f64,
    pub dirty_target_pct: f64,
    pub dirty_trigger_pct: f64,
    pub updates_target_pct: f64,
    pub updates_trigger_pct: f64,
}

/// Raw administrative counters. Every field is optional: older servers and
/// restricted roles omit some of them.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RawCounters {
    pub cache_bytes_in_use: Option<u64>,
    pub cache_bytes_max: Option<u64>,
    pub cache_dirty_bytes: Option<u64>,
    pub cache_update_bytes: Option<u64>,
    pub read_tickets_out: Option<u64>,
    pub read_tickets_total: Option<u64>,
    pub write_tickets_out: Option<u64>,
    pub write_tickets_total: Option<u64>,
    /// Duration of the running (or most recent) checkpoint.
    pub checkpoint_running_ms: Option<u64>,
    /// Configured interval between checkpoints.
    pub checkpoint_interval_ms: Option<u64>,
    pub replication_lag_ms: Option<u64>,
    pub heap_allocated_bytes: Option<u64>,
    pub heap_fragmented_bytes: Option<u64>,
    pub eviction: Option<EvictionThresholds>,
}

/// Connection to the backing document store.
#[async_trait]
pub trait DocumentStore: Send + Sync + 'static {
    /// Stream every record matching `query.filter`, windowed into buckets of
    /// `query.bucket_size`. The match set is fixed when the stream opens.
    async fn bucket_rows(
        &self,
        ns: &Namespace,
        query: &BucketQuery,
        session: &SessionContext,
    ) -> Result<RowStream, StoreError>;

    /// Delete the given ids in one batched statement; returns the number removed.
    async fn delete_ids(
        &self,
        ns: &Namespace,
        ids: &[RecordId],
        session: &SessionContext,
    ) -> Result<u64, StoreError>;

    async fn begin_transaction(
        &self,
        session: &SessionContext,
    ) -> Result<Box<dyn StoreTransaction>, StoreError>;

    /// Count records matching `filter` under the same collation rules as
    /// [`bucket_rows`](Self::bucket_rows).
    async fn count_matching(
        &self,
        ns: &Namespace,
        filter: &Filter,
        collation: Option<&str>,
        read_concern: ReadConcern,
    ) -> Result<u64, StoreError>;

    async fn server_status(&self) -> Result<RawCounters, StoreError>;
}

/// An open multi-statement transaction. Dropping it without `commit` discards
/// staged writes.
#[async_trait]
pub trait StoreTransaction: Send {
    async fn delete_ids(&mut self, ns: &Namespace, ids: &[RecordId]) -> Result<u64, StoreError>;

    async fn commit(self: Box<Self>) -> Result<(), StoreError>;

    async fn abort(self: Box<Self>) -> Result<(), StoreError>;
}
