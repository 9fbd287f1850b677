//! Single-node document store on a fjall keyspace.
//!
//! Each `database.collection` maps to one partition named
//! `{database}__{collection}`; keys are record ids and values are JSON
//! documents. Keyspace reads, batch commits and journal syncs run on the
//! blocking pool so concurrent batches overlap. Concurrency tickets are
//! semaphores held across that work, so the telemetry sampler sees real slot
//! pressure, and host memory comes from `sysinfo`.
//!
//! Bucket rows come from one of two paths. A match-all filter, or one led by
//! `_id` under simple collation, is already in key order: the partition is
//! scanned one bucket at a time and only that bucket is held in memory. Any
//! other sort key has no index to walk, so the matching `(sort value, id)`
//! pairs are collected and sorted before windowing; that path holds one
//! entry per matching record.

use std::collections::{HashMap, HashSet};
use std::ops::Bound;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use fjall::{Keyspace, PartitionCreateOptions, PartitionHandle, PersistMode};
use futures_util::stream::{self, StreamExt};
use serde_json::{Map, Value};
use sysinfo::{Pid, System};
use tokio::sync::Semaphore;
use tracing::warn;

use crate::document::{self, Collation};
use crate::error::StoreError;
use crate::store::{
    BucketQuery, BucketRow, DocumentStore, Filter, Namespace, RawCounters, ReadConcern, RecordId,
    RowStream, SessionContext, StoreTransaction, WriteConcern,
};

/// Tuning for a [`FjallStore`].
#[derive(Clone, Debug)]
pub struct FjallStoreConfig {
    pub path: PathBuf,
    pub cache_size_bytes: u64,
    pub max_write_buffer_bytes: u64,
    pub max_journal_bytes: u64,
    pub read_tickets: usize,
    pub write_tickets: usize,
}

impl FjallStoreConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            cache_size_bytes: 64 * 1024 * 1024,
            max_write_buffer_bytes: 64 * 1024 * 1024,
            max_journal_bytes: 512 * 1024 * 1024,
            read_tickets: 128,
            write_tickets: 128,
        }
    }
}

#[derive(Clone)]
pub struct FjallStore {
    keyspace: Arc<Keyspace>,
    partitions: Arc<RwLock<HashMap<String, PartitionHandle>>>,
    read_tickets: Arc<Semaphore>,
    write_tickets: Arc<Semaphore>,
    system: Arc<Mutex<System>>,
    config: FjallStoreConfig,
}

fn valid_name_part(part: &str) -> bool {
    !part.is_empty()
        && part
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

fn partition_name(ns: &Namespace) -> Result<String, StoreError> {
    if !valid_name_part(&ns.database) || !valid_name_part(&ns.collection) {
        return Err(StoreError::InvalidNamespace(ns.to_string()));
    }
    Ok(format!("{}__{}", ns.database, ns.collection))
}

fn decode_id(key: &[u8]) -> Result<RecordId, StoreError> {
    String::from_utf8(key.to_vec())
        .map(RecordId)
        .map_err(|err| StoreError::Storage(format!("record id is not utf-8: {err}")))
}

fn sort_value(id: &RecordId, doc: &Map<String, Value>, sort_key: Option<&str>) -> Value {
    match sort_key {
        Some(field) => document::lookup(id, doc, field),
        None => Value::Null,
    }
}

/// True when ascending `(sort value, id)` order equals partition key order.
fn key_ordered(filter: &Filter, collation: Collation) -> bool {
    match filter.sort_key() {
        None => true,
        Some("_id") => collation == Collation::Simple,
        Some(_) => false,
    }
}

/// Run keyspace work on the blocking pool.
async fn run_blocking<T, F>(work: F) -> Result<T, StoreError>
where
    F: FnOnce() -> Result<T, StoreError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|err| StoreError::Storage(format!("keyspace task failed: {err}")))?
}

/// One bucket's worth of matches from a key-ordered scan.
struct ScanPage {
    matches: Vec<(Value, RecordId)>,
    /// Last key visited, matching or not.
    last_key: Option<Vec<u8>>,
    exhausted: bool,
}

impl FjallStore {
    pub fn open(config: FjallStoreConfig) -> anyhow::Result<Self> {
        use anyhow::Context;

        std::fs::create_dir_all(&config.path)
            .with_context(|| format!("create store dir {}", config.path.display()))?;
        let keyspace = fjall::Config::new(&config.path)
            .cache_size(config.cache_size_bytes)
            .max_write_buffer_size(config.max_write_buffer_bytes)
            .max_journaling_size(config.max_journal_bytes)
            .open()
            .context("open fjall keyspace")?;
        Ok(Self {
            keyspace: Arc::new(keyspace),
            partitions: Arc::new(RwLock::new(HashMap::new())),
            read_tickets: Arc::new(Semaphore::new(config.read_tickets.max(1))),
            write_tickets: Arc::new(Semaphore::new(config.write_tickets.max(1))),
            system: Arc::new(Mutex::new(System::new())),
            config,
        })
    }

    fn partition(&self, ns: &Namespace) -> Result<PartitionHandle, StoreError> {
        let name = partition_name(ns)?;
        {
            let guard = self
                .partitions
                .read()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if let Some(handle) = guard.get(&name) {
                return Ok(handle.clone());
            }
        }
        let handle = self
            .keyspace
            .open_partition(&name, PartitionCreateOptions::default())?;
        self.partitions
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(name, handle.clone());
        Ok(handle)
    }

    /// Insert or replace documents in one batch.
    pub fn insert_many<I>(&self, ns: &Namespace, docs: I) -> Result<usize, StoreError>
    where
        I: IntoIterator<Item = (String, Map<String, Value>)>,
    {
        let partition = self.partition(ns)?;
        let mut batch = self.keyspace.batch();
        let mut inserted = 0usize;
        for (id, doc) in docs {
            let bytes = serde_json::to_vec(&doc)?;
            batch.insert(&partition, id.into_bytes(), bytes);
            inserted += 1;
        }
        batch.commit()?;
        self.keyspace.persist(PersistMode::SyncAll)?;
        Ok(inserted)
    }

    pub fn len(&self, ns: &Namespace) -> Result<usize, StoreError> {
        let partition = self.partition(ns)?;
        let mut n = 0usize;
        for item in partition.iter() {
            item?;
            n += 1;
        }
        Ok(n)
    }

    fn candidates(
        &self,
        ns: &Namespace,
        filter: &Filter,
        collation: Collation,
    ) -> Result<Vec<(Value, RecordId)>, StoreError> {
        let partition = self.partition(ns)?;
        let sort_key = filter.sort_key();
        let mut out = Vec::new();
        for item in partition.iter() {
            let (key, value) = item?;
            let id = decode_id(&key)?;
            let doc: Map<String, Value> = serde_json::from_slice(&value)?;
            if document::matches(&id, &doc, filter, collation)? {
                out.push((sort_value(&id, &doc, sort_key), id));
            }
        }
        Ok(out)
    }

    fn count(&self, ns: &Namespace, filter: &Filter, collation: Collation) -> Result<u64, StoreError> {
        let partition = self.partition(ns)?;
        let mut n = 0u64;
        for item in partition.iter() {
            let (key, value) = item?;
            let id = decode_id(&key)?;
            let doc: Map<String, Value> = serde_json::from_slice(&value)?;
            if document::matches(&id, &doc, filter, collation)? {
                n += 1;
            }
        }
        Ok(n)
    }

    /// Scan forward from just past `after` until `limit` records match.
    fn scan_page(
        &self,
        ns: &Namespace,
        filter: &Filter,
        collation: Collation,
        after: Option<Vec<u8>>,
        limit: usize,
    ) -> Result<ScanPage, StoreError> {
        let partition = self.partition(ns)?;
        let sort_key = filter.sort_key();
        let range: (Bound<Vec<u8>>, Bound<Vec<u8>>) = match after {
            Some(key) => (Bound::Excluded(key), Bound::Unbounded),
            None => (Bound::Unbounded, Bound::Unbounded),
        };
        let mut page = ScanPage {
            matches: Vec::with_capacity(limit),
            last_key: None,
            exhausted: true,
        };
        for item in partition.range(range) {
            let (key, value) = item?;
            let id = decode_id(&key)?;
            page.last_key = Some(key.to_vec());
            let doc: Map<String, Value> = serde_json::from_slice(&value)?;
            if document::matches(&id, &doc, filter, collation)? {
                page.matches.push((sort_value(&id, &doc, sort_key), id));
                if page.matches.len() >= limit {
                    page.exhausted = false;
                    break;
                }
            }
        }
        Ok(page)
    }

    fn existing(&self, partition: &PartitionHandle, ids: &[RecordId]) -> Result<Vec<RecordId>, StoreError> {
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            if partition.contains_key(id.as_str().as_bytes())? {
                out.push(id.clone());
            }
        }
        Ok(out)
    }

    fn remove_batch(
        &self,
        partition: &PartitionHandle,
        ids: &[RecordId],
        write_concern: WriteConcern,
    ) -> Result<u64, StoreError> {
        let existing = self.existing(partition, ids)?;
        if existing.is_empty() {
            return Ok(0);
        }
        let mut batch = self.keyspace.batch();
        for id in &existing {
            batch.remove(partition, id.as_str().as_bytes().to_vec());
        }
        batch.commit()?;
        // A single node is its own majority; journal it before acknowledging.
        if write_concern == WriteConcern::Majority {
            self.keyspace.persist(PersistMode::SyncAll)?;
        }
        Ok(existing.len() as u64)
    }

    fn tickets_out(sem: &Semaphore, total: usize) -> u64 {
        total.saturating_sub(sem.available_permits()) as u64
    }

    fn host_memory(&self) -> (Option<u64>, Option<u64>) {
        let mut system = self
            .system
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        system.refresh_memory();
        let pid = Pid::from(std::process::id() as usize);
        let rss = if system.refresh_process(pid) {
            system.process(pid).map(|proc| proc.memory())
        } else {
            None
        };
        let total = Some(system.total_memory()).filter(|total| *total > 0);
        (rss, total)
    }
}

/// Cursor state of a key-ordered bucket scan.
struct KeyScan {
    store: FjallStore,
    ns: Namespace,
    filter: Filter,
    collation: Collation,
    bucket_size: usize,
    cursor: Option<Vec<u8>>,
    bucket_id: u64,
    done: bool,
}

impl KeyScan {
    async fn next_page(&self) -> Result<ScanPage, StoreError> {
        let _ticket = self
            .store
            .read_tickets
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| StoreError::Storage("read tickets closed".to_string()))?;
        let store = self.store.clone();
        let ns = self.ns.clone();
        let filter = self.filter.clone();
        let collation = self.collation;
        let cursor = self.cursor.clone();
        let limit = self.bucket_size;
        run_blocking(move || store.scan_page(&ns, &filter, collation, cursor, limit)).await
    }

    fn into_rows(self) -> RowStream {
        stream::unfold(self, |mut scan| async move {
            if scan.done {
                return None;
            }
            let page = match scan.next_page().await {
                Ok(page) => page,
                Err(err) => {
                    scan.done = true;
                    return Some((vec![Err(err)], scan));
                }
            };
            scan.done = page.exhausted;
            scan.cursor = page.last_key;
            if page.matches.is_empty() {
                return None;
            }
            scan.bucket_id += 1;
            let bucket_id = scan.bucket_id;
            let total = page.matches.len() as u64;
            let rows = page
                .matches
                .into_iter()
                .enumerate()
                .map(|(idx, (sort_value, record_id))| {
                    Ok(BucketRow {
                        record_id,
                        sort_value,
                        bucket_id,
                        running_count: idx as u64 + 1,
                        bucket_total: total,
                    })
                })
                .collect::<Vec<_>>();
            Some((rows, scan))
        })
        .flat_map(stream::iter)
        .boxed()
    }
}

#[async_trait]
impl DocumentStore for FjallStore {
    async fn bucket_rows(
        &self,
        ns: &Namespace,
        query: &BucketQuery,
        _session: &SessionContext,
    ) -> Result<RowStream, StoreError> {
        let collation = Collation::parse(query.collation.as_deref())?;
        partition_name(ns)?;
        if let Some(hint) = query.hint.as_deref() {
            tracing::debug!(hint, "fjall store has no secondary indexes; ignoring hint");
        }
        if key_ordered(&query.filter, collation) {
            return Ok(KeyScan {
                store: self.clone(),
                ns: ns.clone(),
                filter: query.filter.clone(),
                collation,
                bucket_size: query.bucket_size.max(1),
                cursor: None,
                bucket_id: 0,
                done: false,
            }
            .into_rows());
        }

        let _ticket = self
            .read_tickets
            .acquire()
            .await
            .map_err(|_| StoreError::Storage("read tickets closed".to_string()))?;
        let store = self.clone();
        let ns = ns.clone();
        let filter = query.filter.clone();
        let candidates = run_blocking(move || store.candidates(&ns, &filter, collation)).await?;
        let rows = document::window_rows(candidates, query.bucket_size, collation);
        Ok(stream::iter(rows.into_iter().map(Ok)).boxed())
    }

    async fn delete_ids(
        &self,
        ns: &Namespace,
        ids: &[RecordId],
        session: &SessionContext,
    ) -> Result<u64, StoreError> {
        let _ticket = self
            .write_tickets
            .acquire()
            .await
            .map_err(|_| StoreError::Storage("write tickets closed".to_string()))?;
        let store = self.clone();
        let ns = ns.clone();
        let ids = ids.to_vec();
        let write_concern = session.write_concern;
        run_blocking(move || {
            let partition = store.partition(&ns)?;
            store.remove_batch(&partition, &ids, write_concern)
        })
        .await
    }

    async fn begin_transaction(
        &self,
        session: &SessionContext,
    ) -> Result<Box<dyn StoreTransaction>, StoreError> {
        Ok(Box::new(FjallTransaction {
            store: self.clone(),
            write_concern: session.write_concern,
            staged: HashMap::new(),
        }))
    }

    async fn count_matching(
        &self,
        ns: &Namespace,
        filter: &Filter,
        collation: Option<&str>,
        _read_concern: ReadConcern,
    ) -> Result<u64, StoreError> {
        let collation = Collation::parse(collation)?;
        let _ticket = self
            .read_tickets
            .acquire()
            .await
            .map_err(|_| StoreError::Storage("read tickets closed".to_string()))?;
        let store = self.clone();
        let ns = ns.clone();
        let filter = filter.clone();
        run_blocking(move || store.count(&ns, &filter, collation)).await
    }

    async fn server_status(&self) -> Result<RawCounters, StoreError> {
        let (rss, total) = self.host_memory();
        // Express the write buffer against the host total so its ratio to
        // `cache_bytes_max` equals its fill of the configured buffer.
        let buffer_max = self.config.max_write_buffer_bytes.max(1);
        let dirty = self
            .keyspace
            .write_buffer_size()
            .saturating_mul(total.unwrap_or(buffer_max))
            / buffer_max;
        let read_total = self.config.read_tickets.max(1);
        let write_total = self.config.write_tickets.max(1);
        Ok(RawCounters {
            cache_bytes_in_use: rss,
            cache_bytes_max: total,
            cache_dirty_bytes: Some(dirty),
            read_tickets_out: Some(Self::tickets_out(&self.read_tickets, read_total)),
            read_tickets_total: Some(read_total as u64),
            write_tickets_out: Some(Self::tickets_out(&self.write_tickets, write_total)),
            write_tickets_total: Some(write_total as u64),
            ..RawCounters::default()
        })
    }
}

/// Staged deletes over a [`FjallStore`], applied as one batch on commit.
struct FjallTransaction {
    store: FjallStore,
    write_concern: WriteConcern,
    staged: HashMap<Namespace, HashSet<RecordId>>,
}

#[async_trait]
impl StoreTransaction for FjallTransaction {
    async fn delete_ids(&mut self, ns: &Namespace, ids: &[RecordId]) -> Result<u64, StoreError> {
        let _ticket = self
            .store
            .write_tickets
            .acquire()
            .await
            .map_err(|_| StoreError::Storage("write tickets closed".to_string()))?;
        let store = self.store.clone();
        let target = ns.clone();
        let ids = ids.to_vec();
        let existing = run_blocking(move || {
            let partition = store.partition(&target)?;
            store.existing(&partition, &ids)
        })
        .await?;
        let staged = self.staged.entry(ns.clone()).or_default();
        Ok(existing.into_iter().filter(|id| staged.insert(id.clone())).count() as u64)
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let FjallTransaction {
            store,
            write_concern,
            staged,
        } = *self;
        let _ticket = store
            .write_tickets
            .acquire()
            .await
            .map_err(|_| StoreError::Storage("write tickets closed".to_string()))?;
        let writer = store.clone();
        run_blocking(move || {
            for (ns, ids) in staged {
                let partition = writer.partition(&ns)?;
                let ids = ids.into_iter().collect::<Vec<_>>();
                writer.remove_batch(&partition, &ids, write_concern)?;
            }
            Ok(())
        })
        .await
    }

    async fn abort(self: Box<Self>) -> Result<(), StoreError> {
        if !self.staged.is_empty() {
            warn!(
                namespaces = self.staged.len(),
                "discarding staged deletes on transaction abort"
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("test doc must be an object"),
        }
    }

    #[test]
    fn partition_names_reject_separators() {
        assert_eq!(
            partition_name(&Namespace::new("app", "events")).unwrap(),
            "app__events"
        );
        assert!(partition_name(&Namespace::new("app.x", "events")).is_err());
        assert!(partition_name(&Namespace::new("app", "")).is_err());
    }

    #[tokio::test]
    async fn delete_and_count_round_trip_through_fjall() {
        let dir = tempfile::tempdir().unwrap();
        let store = FjallStore::open(FjallStoreConfig::new(dir.path())).unwrap();
        let ns = Namespace::new("app", "events");
        store
            .insert_many(
                &ns,
                (0..20).map(|i| (format!("e{i:03}"), doc(json!({"kind": i % 2})))),
            )
            .unwrap();

        let odd = Filter::from_json_str(r#"{"kind": 1}"#).unwrap();
        assert_eq!(
            store.count_matching(&ns, &odd, None, ReadConcern::Local).await.unwrap(),
            10
        );

        let ids = vec![RecordId::new("e001"), RecordId::new("e003"), RecordId::new("nope")];
        let removed = store
            .delete_ids(&ns, &ids, &SessionContext::new(false))
            .await
            .unwrap();
        assert_eq!(removed, 2);
        assert_eq!(store.len(&ns).unwrap(), 18);
    }

    #[tokio::test]
    async fn status_reports_ticket_totals() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = FjallStoreConfig::new(dir.path());
        config.write_tickets = 8;
        let store = FjallStore::open(config).unwrap();
        let status = store.server_status().await.unwrap();
        assert_eq!(status.write_tickets_total, Some(8));
        assert_eq!(status.write_tickets_out, Some(0));
        assert!(status.cache_update_bytes.is_none());
    }

    fn seeded(dir: &tempfile::TempDir, n: usize) -> (FjallStore, Namespace) {
        let store = FjallStore::open(FjallStoreConfig::new(dir.path())).unwrap();
        let ns = Namespace::new("app", "events");
        store
            .insert_many(
                &ns,
                (0..n).map(|i| {
                    let status = if i % 2 == 0 { "Expired" } else { "active" };
                    (format!("e{i:04}"), doc(json!({"seq": i, "status": status})))
                }),
            )
            .unwrap();
        (store, ns)
    }

    async fn collect_rows(store: &FjallStore, ns: &Namespace, filter: &str, size: usize) -> Vec<BucketRow> {
        let query = BucketQuery {
            filter: Filter::from_json_str(filter).unwrap(),
            bucket_size: size,
            hint: None,
            collation: None,
        };
        store
            .bucket_rows(ns, &query, &SessionContext::new(false))
            .await
            .unwrap()
            .map(|row| row.unwrap())
            .collect()
            .await
    }

    #[tokio::test]
    async fn key_ordered_scan_windows_one_bucket_at_a_time() {
        let dir = tempfile::tempdir().unwrap();
        let (store, ns) = seeded(&dir, 250);

        let rows = collect_rows(&store, &ns, "{}", 100).await;
        assert_eq!(rows.len(), 250);
        let mut totals = rows
            .iter()
            .map(|r| (r.bucket_id, r.bucket_total))
            .collect::<Vec<_>>();
        totals.dedup();
        assert_eq!(totals, vec![(1, 100), (2, 100), (3, 50)]);
        assert!(rows.windows(2).all(|w| w[0].record_id < w[1].record_id));
        assert_eq!(rows[99].running_count, 100);
        assert_eq!(rows[100].running_count, 1);
    }

    #[tokio::test]
    async fn key_ordered_scan_ends_cleanly_on_a_full_bucket() {
        let dir = tempfile::tempdir().unwrap();
        let (store, ns) = seeded(&dir, 200);
        let rows = collect_rows(&store, &ns, "{}", 100).await;
        assert_eq!(rows.len(), 200);
        assert_eq!(rows.last().map(|r| r.bucket_id), Some(2));
    }

    #[tokio::test]
    async fn id_led_filter_matches_sorted_path() {
        let dir = tempfile::tempdir().unwrap();
        let (store, ns) = seeded(&dir, 120);

        let keyed = collect_rows(&store, &ns, r#"{"_id": {"$gte": "e0030"}, "seq": {"$lt": 100}}"#, 16).await;
        assert_eq!(keyed.len(), 70);
        assert_eq!(keyed[0].record_id, RecordId::new("e0030"));

        let candidates = store
            .candidates(
                &ns,
                &Filter::from_json_str(r#"{"_id": {"$gte": "e0030"}, "seq": {"$lt": 100}}"#).unwrap(),
                Collation::Simple,
            )
            .unwrap();
        assert_eq!(keyed, document::window_rows(candidates, 16, Collation::Simple));
    }

    #[tokio::test]
    async fn count_honours_collation() {
        let dir = tempfile::tempdir().unwrap();
        let (store, ns) = seeded(&dir, 10);
        let filter = Filter::from_json_str(r#"{"status": "EXPIRED"}"#).unwrap();
        assert_eq!(
            store.count_matching(&ns, &filter, None, ReadConcern::Available).await.unwrap(),
            0
        );
        assert_eq!(
            store
                .count_matching(&ns, &filter, Some("case_insensitive"), ReadConcern::Available)
                .await
                .unwrap(),
            5
        );
    }

    #[tokio::test]
    async fn concurrent_deletes_each_hold_a_write_ticket() {
        let dir = tempfile::tempdir().unwrap();
        let (store, ns) = seeded(&dir, 20);
        let session = SessionContext::new(false);
        let a = (0..10).map(|i| RecordId::new(format!("e{i:04}"))).collect::<Vec<_>>();
        let b = (10..20).map(|i| RecordId::new(format!("e{i:04}"))).collect::<Vec<_>>();

        let mut first = Box::pin(store.delete_ids(&ns, &a, &session));
        let mut second = Box::pin(store.delete_ids(&ns, &b, &session));
        assert!(futures_util::poll!(&mut first).is_pending());
        assert!(futures_util::poll!(&mut second).is_pending());
        let status = store.server_status().await.unwrap();
        assert_eq!(status.write_tickets_out, Some(2));

        assert_eq!(first.await.unwrap(), 10);
        assert_eq!(second.await.unwrap(), 10);
        assert_eq!(store.len(&ns).unwrap(), 0);
    }
}
