//! In-process document store.
//!
//! Collections live in a `RwLock<HashMap<..>>` of ordered maps. Besides
//! serving as the reference backend, it exposes knobs used to drive the engine
//! through congestion and failure paths: scripted status counters, delete
//! latency, injected transient failures, and a gauge of concurrent deletes.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};
use serde_json::{Map, Value};

use crate::document::{self, Collation};
use crate::error::StoreError;
use crate::store::{
    BucketQuery, DocumentStore, Filter, Namespace, RawCounters, ReadConcern, RecordId, RowStream,
    SessionContext, StoreTransaction,
};

type Collection = BTreeMap<RecordId, Map<String, Value>>;

/// What `server_status` answers.
#[derive(Clone, Debug)]
enum StatusMode {
    Counters(RawCounters),
    Unsupported,
    Failing(String),
}

struct MemoryInner {
    collections: RwLock<HashMap<Namespace, Collection>>,
    status: RwLock<StatusMode>,
    /// Counters served before falling back to `status`, one per call.
    scripted: Mutex<VecDeque<RawCounters>>,
    status_calls: AtomicU64,
    delete_latency: RwLock<Duration>,
    transient_failures: AtomicU32,
    deletes_in_flight: AtomicUsize,
    peak_deletes_in_flight: AtomicUsize,
    delete_calls: AtomicU64,
}

/// Shared handle to an in-memory store; clones see the same data.
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<MemoryInner>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MemoryInner {
                collections: RwLock::new(HashMap::new()),
                status: RwLock::new(StatusMode::Counters(RawCounters::default())),
                scripted: Mutex::new(VecDeque::new()),
                status_calls: AtomicU64::new(0),
                delete_latency: RwLock::new(Duration::ZERO),
                transient_failures: AtomicU32::new(0),
                deletes_in_flight: AtomicUsize::new(0),
                peak_deletes_in_flight: AtomicUsize::new(0),
                delete_calls: AtomicU64::new(0),
            }),
        }
    }

    fn read_collections(&self) -> RwLockReadGuard<'_, HashMap<Namespace, Collection>> {
        self.inner
            .collections
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write_collections(&self) -> RwLockWriteGuard<'_, HashMap<Namespace, Collection>> {
        self.inner
            .collections
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn insert(&self, ns: &Namespace, id: impl Into<String>, doc: Map<String, Value>) {
        self.write_collections()
            .entry(ns.clone())
            .or_default()
            .insert(RecordId::new(id), doc);
    }

    pub fn insert_many<I>(&self, ns: &Namespace, docs: I)
    where
        I: IntoIterator<Item = (String, Map<String, Value>)>,
    {
        let mut guard = self.write_collections();
        let coll = guard.entry(ns.clone()).or_default();
        for (id, doc) in docs {
            coll.insert(RecordId::new(id), doc);
        }
    }

    pub fn len(&self, ns: &Namespace) -> usize {
        self.read_collections()
            .get(ns)
            .map(BTreeMap::len)
            .unwrap_or(0)
    }

    pub fn is_empty(&self, ns: &Namespace) -> bool {
        self.len(ns) == 0
    }

    pub fn contains(&self, ns: &Namespace, id: &str) -> bool {
        self.read_collections()
            .get(ns)
            .is_some_and(|coll| coll.contains_key(&RecordId::new(id)))
    }

    /// Steady-state counters returned by `server_status`.
    pub fn set_counters(&self, counters: RawCounters) {
        *self
            .inner
            .status
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = StatusMode::Counters(counters);
    }

    /// Counters returned by the next calls, in order, before the steady state resumes.
    pub fn script_counters<I>(&self, sequence: I)
    where
        I: IntoIterator<Item = RawCounters>,
    {
        let mut guard = self
            .inner
            .scripted
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        guard.extend(sequence);
    }

    /// Make `server_status` answer as an older server without the command.
    pub fn set_status_unsupported(&self) {
        *self
            .inner
            .status
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = StatusMode::Unsupported;
    }

    /// Make `server_status` fail outright.
    pub fn set_status_failing(&self, message: impl Into<String>) {
        *self
            .inner
            .status
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = StatusMode::Failing(message.into());
    }

    pub fn set_delete_latency(&self, latency: Duration) {
        *self
            .inner
            .delete_latency
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = latency;
    }

    /// The next `n` delete statements fail with a transient error.
    pub fn fail_next_deletes(&self, n: u32) {
        self.inner.transient_failures.store(n, Ordering::SeqCst);
    }

    pub fn status_calls(&self) -> u64 {
        self.inner.status_calls.load(Ordering::SeqCst)
    }

    pub fn delete_calls(&self) -> u64 {
        self.inner.delete_calls.load(Ordering::SeqCst)
    }

    /// Highest number of delete statements observed running at once.
    pub fn peak_deletes_in_flight(&self) -> usize {
        self.inner.peak_deletes_in_flight.load(Ordering::SeqCst)
    }

    /// Shared prologue of every delete statement: gauge, latency, injected faults.
    async fn enter_delete(&self) -> Result<DeleteGauge, StoreError> {
        self.inner.delete_calls.fetch_add(1, Ordering::SeqCst);
        let now = self.inner.deletes_in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.inner
            .peak_deletes_in_flight
            .fetch_max(now, Ordering::SeqCst);
        let gauge = DeleteGauge {
            inner: self.inner.clone(),
        };

        let latency = *self
            .inner
            .delete_latency
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let injected = self
            .inner
            .transient_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if injected {
            return Err(StoreError::Transient(
                "write conflict during delete".to_string(),
            ));
        }
        Ok(gauge)
    }

    fn existing(&self, ns: &Namespace, ids: &[RecordId]) -> Result<Vec<RecordId>, StoreError> {
        let guard = self.read_collections();
        let Some(coll) = guard.get(ns) else {
            return Ok(Vec::new());
        };
        Ok(ids
            .iter()
            .filter(|id| coll.contains_key(*id))
            .cloned()
            .collect())
    }

    fn remove(&self, ns: &Namespace, ids: &[RecordId]) -> Result<u64, StoreError> {
        let mut guard = self.write_collections();
        let Some(coll) = guard.get_mut(ns) else {
            return Ok(0);
        };
        let removed = ids.iter().filter(|id| coll.remove(*id).is_some()).count();
        Ok(removed as u64)
    }

    fn candidates(
        &self,
        ns: &Namespace,
        filter: &Filter,
        collation: Collation,
    ) -> Result<Vec<(Value, RecordId)>, StoreError> {
        let guard = self.read_collections();
        let Some(coll) = guard.get(ns) else {
            return Ok(Vec::new());
        };
        let sort_key = filter.sort_key();
        let mut out = Vec::new();
        for (id, doc) in coll {
            if document::matches(id, doc, filter, collation)? {
                let sort_value = match sort_key {
                    Some(key) => document::lookup(id, doc, key),
                    None => Value::Null,
                };
                out.push((sort_value, id.clone()));
            }
        }
        Ok(out)
    }
}

/// Decrements the in-flight delete gauge when the statement finishes.
struct DeleteGauge {
    inner: Arc<MemoryInner>,
}

impl Drop for DeleteGauge {
    fn drop(&mut self) {
        self.inner.deletes_in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn bucket_rows(
        &self,
        ns: &Namespace,
        query: &BucketQuery,
        _session: &SessionContext,
    ) -> Result<RowStream, StoreError> {
        let collation = Collation::parse(query.collation.as_deref())?;
        let candidates = self.candidates(ns, &query.filter, collation)?;
        let rows = document::window_rows(candidates, query.bucket_size, collation);
        Ok(stream::iter(rows.into_iter().map(Ok)).boxed())
    }

    async fn delete_ids(
        &self,
        ns: &Namespace,
        ids: &[RecordId],
        _session: &SessionContext,
    ) -> Result<u64, StoreError> {
        let _gauge = self.enter_delete().await?;
        self.remove(ns, ids)
    }

    async fn begin_transaction(
        &self,
        _session: &SessionContext,
    ) -> Result<Box<dyn StoreTransaction>, StoreError> {
        Ok(Box::new(MemoryTransaction {
            store: self.clone(),
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
        Ok(self.candidates(ns, filter, collation)?.len() as u64)
    }

    async fn server_status(&self) -> Result<RawCounters, StoreError> {
        self.inner.status_calls.fetch_add(1, Ordering::SeqCst);
        let scripted = self
            .inner
            .scripted
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .pop_front();
        if let Some(counters) = scripted {
            return Ok(counters);
        }
        let mode = self
            .inner
            .status
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        match mode {
            StatusMode::Counters(counters) => Ok(counters),
            StatusMode::Unsupported => Err(StoreError::Unsupported(
                "serverStatus wiredTiger section".to_string(),
            )),
            StatusMode::Failing(msg) => Err(StoreError::Storage(msg)),
        }
    }
}

/// Transaction over a [`MemoryStore`]: deletes are staged and only applied on commit.
struct MemoryTransaction {
    store: MemoryStore,
    staged: HashMap<Namespace, HashSet<RecordId>>,
}

#[async_trait]
impl StoreTransaction for MemoryTransaction {
    async fn delete_ids(&mut self, ns: &Namespace, ids: &[RecordId]) -> Result<u64, StoreError> {
        let _gauge = self.store.enter_delete().await?;
        let existing = self.store.existing(ns, ids)?;
        let staged = self.staged.entry(ns.clone()).or_default();
        let mut removed = 0u64;
        for id in existing {
            if staged.insert(id) {
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        for (ns, ids) in &self.staged {
            let ids = ids.iter().cloned().collect::<Vec<_>>();
            self.store.remove(ns, &ids)?;
        }
        Ok(())
    }

    async fn abort(self: Box<Self>) -> Result<(), StoreError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ns() -> Namespace {
        Namespace::new("app", "events")
    }

    fn seeded(n: usize) -> MemoryStore {
        let store = MemoryStore::new();
        store.insert_many(
            &ns(),
            (0..n).map(|i| {
                let Value::Object(doc) = json!({"seq": i, "status": "expired"}) else {
                    unreachable!()
                };
                (format!("doc-{i:05}"), doc)
            }),
        );
        store
    }

    #[tokio::test]
    async fn aborted_transaction_leaves_documents_in_place() {
        let store = seeded(10);
        let ids = (0..5)
            .map(|i| RecordId::new(format!("doc-{i:05}")))
            .collect::<Vec<_>>();
        let mut txn = store
            .begin_transaction(&SessionContext::new(true))
            .await
            .unwrap();
        assert_eq!(txn.delete_ids(&ns(), &ids).await.unwrap(), 5);
        // Staged ids are not counted twice inside one transaction.
        assert_eq!(txn.delete_ids(&ns(), &ids).await.unwrap(), 0);
        txn.abort().await.unwrap();
        assert_eq!(store.len(&ns()), 10);
    }

    #[tokio::test]
    async fn committed_transaction_applies_deletes() {
        let store = seeded(10);
        let ids = vec![RecordId::new("doc-00001"), RecordId::new("missing")];
        let mut txn = store
            .begin_transaction(&SessionContext::new(false))
            .await
            .unwrap();
        assert_eq!(txn.delete_ids(&ns(), &ids).await.unwrap(), 1);
        txn.commit().await.unwrap();
        assert_eq!(store.len(&ns()), 9);
        assert!(!store.contains(&ns(), "doc-00001"));
    }

    #[tokio::test]
    async fn injected_transient_failures_are_consumed() {
        let store = seeded(3);
        store.fail_next_deletes(1);
        let ids = vec![RecordId::new("doc-00000")];
        let session = SessionContext::new(false);
        let err = store.delete_ids(&ns(), &ids, &session).await.unwrap_err();
        assert!(err.is_transient());
        assert_eq!(store.delete_ids(&ns(), &ids, &session).await.unwrap(), 1);
        assert_eq!(store.delete_calls(), 2);
    }

    #[tokio::test]
    async fn scripted_counters_precede_steady_state() {
        let store = MemoryStore::new();
        store.set_counters(RawCounters {
            cache_bytes_in_use: Some(1),
            ..RawCounters::default()
        });
        store.script_counters([RawCounters {
            cache_bytes_in_use: Some(99),
            ..RawCounters::default()
        }]);
        assert_eq!(store.server_status().await.unwrap().cache_bytes_in_use, Some(99));
        assert_eq!(store.server_status().await.unwrap().cache_bytes_in_use, Some(1));
        assert_eq!(store.status_calls(), 2);
    }

    #[tokio::test]
    async fn writes_survive_a_poisoned_collection_lock() {
        let store = seeded(3);
        let inner = store.inner.clone();
        let panicked = std::thread::spawn(move || {
            let _guard = inner.collections.write().unwrap();
            panic!("writer died holding the lock");
        })
        .join();
        assert!(panicked.is_err());
        assert!(store.inner.collections.is_poisoned());

        let Value::Object(doc) = json!({"seq": 3}) else {
            unreachable!()
        };
        store.insert(&ns(), "doc-00003", doc);
        assert_eq!(store.len(&ns()), 4);
        assert!(store.contains(&ns(), "doc-00003"));

        let ids = vec![RecordId::new("doc-00000")];
        let removed = store
            .delete_ids(&ns(), &ids, &SessionContext::new(false))
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert_eq!(store.len(&ns()), 3);
    }
}
