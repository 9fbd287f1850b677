//! Delete execution for one admitted bucket.

use std::sync::Arc;

use serde::Serialize;

use crate::bucketing::Bucket;
use crate::error::StoreError;
use crate::store::{DocumentStore, Namespace, SessionContext};

/// One admitted unit of work.
#[derive(Clone, Debug)]
pub struct DeletionTask {
    pub bucket: Bucket,
    pub session: Arc<SessionContext>,
}

/// Outcome of one bucket. A failed bucket carries the error text and the
/// count the store reported before failing (usually zero).
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ExecutionResult {
    pub bucket_ordinal: u64,
    pub deleted_count: u64,
    pub error: Option<String>,
    pub attempts: u32,
}

impl ExecutionResult {
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

#[derive(Clone)]
pub struct DeleteExecutor {
    store: Arc<dyn DocumentStore>,
    ns: Namespace,
    transient_retries: u32,
}

impl DeleteExecutor {
    pub fn new(store: Arc<dyn DocumentStore>, ns: Namespace) -> Self {
        Self {
            store,
            ns,
            transient_retries: 0,
        }
    }

    /// Rerun a bucket up to `retries` more times when the store reports a
    /// transient transaction error.
    pub fn with_transient_retries(mut self, retries: u32) -> Self {
        self.transient_retries = retries;
        self
    }

    pub fn namespace(&self) -> &Namespace {
        &self.ns
    }

    /// Delete every id in the bucket. Never fails: store errors are logged and
    /// folded into the result so the run carries on with the next bucket.
    pub async fn execute(&self, task: &DeletionTask) -> ExecutionResult {
        let ordinal = task.bucket.ordinal;
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            let outcome = if task.session.simulate {
                self.simulate_once(task).await
            } else {
                self.store
                    .delete_ids(&self.ns, &task.bucket.record_ids, &task.session)
                    .await
                    .map_err(|err| (0, err))
            };
            match outcome {
                Ok(deleted) => {
                    return ExecutionResult {
                        bucket_ordinal: ordinal,
                        deleted_count: deleted,
                        error: None,
                        attempts,
                    };
                }
                Err((_, err)) if err.is_transient() && attempts <= self.transient_retries => {
                    tracing::debug!(
                        bucket = ordinal,
                        attempt = attempts,
                        error = %err,
                        "transient delete failure; retrying bucket"
                    );
                }
                Err((partial, err)) => {
                    tracing::warn!(
                        bucket = ordinal,
                        attempts,
                        error = %err,
                        "delete failed for batch {ordinal}"
                    );
                    return ExecutionResult {
                        bucket_ordinal: ordinal,
                        deleted_count: partial,
                        error: Some(err.to_string()),
                        attempts,
                    };
                }
            }
        }
    }

    /// Run the delete inside a transaction and always abort it.
    async fn simulate_once(&self, task: &DeletionTask) -> Result<u64, (u64, StoreError)> {
        let mut txn = self
            .store
            .begin_transaction(&task.session)
            .await
            .map_err(|err| (0, err))?;
        let deleted = txn.delete_ids(&self.ns, &task.bucket.record_ids).await;
        if let Err(err) = txn.abort().await {
            tracing::warn!(
                bucket = task.bucket.ordinal,
                error = %err,
                "abort of simulated delete failed"
            );
        }
        deleted.map_err(|err| (0, err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;
    use crate::store::RecordId;
    use serde_json::{json, Value};

    fn ns() -> Namespace {
        Namespace::new("app", "sessions")
    }

    fn seeded(n: usize) -> MemoryStore {
        let store = MemoryStore::new();
        store.insert_many(
            &ns(),
            (0..n).map(|i| {
                let Value::Object(doc) = json!({"n": i}) else {
                    unreachable!()
                };
                (format!("s{i:03}"), doc)
            }),
        );
        store
    }

    fn task(ids: &[&str], simulate: bool) -> DeletionTask {
        let record_ids = ids.iter().map(|id| RecordId::new(*id)).collect::<Vec<_>>();
        DeletionTask {
            bucket: Bucket {
                ordinal: 1,
                size: record_ids.len(),
                record_ids,
                cumulative_count: ids.len() as u64,
                first_key: Value::Null,
                last_key: Value::Null,
            },
            session: Arc::new(SessionContext::new(simulate)),
        }
    }

    #[tokio::test]
    async fn real_mode_deletes_and_is_idempotent() {
        let store = seeded(5);
        let exec = DeleteExecutor::new(Arc::new(store.clone()), ns());
        let t = task(&["s000", "s001", "s002"], false);

        let first = exec.execute(&t).await;
        assert_eq!(first.deleted_count, 3);
        assert!(first.is_ok());
        assert_eq!(store.len(&ns()), 2);

        let second = exec.execute(&t).await;
        assert_eq!(second.deleted_count, 0);
        assert!(second.is_ok());
        assert_eq!(store.len(&ns()), 2);
    }

    #[tokio::test]
    async fn simulate_mode_reports_count_but_keeps_documents() {
        let store = seeded(4);
        let exec = DeleteExecutor::new(Arc::new(store.clone()), ns());
        let result = exec.execute(&task(&["s000", "s001", "s009"], true)).await;
        assert_eq!(result.deleted_count, 2);
        assert!(result.is_ok());
        assert_eq!(store.len(&ns()), 4);
    }

    #[tokio::test]
    async fn failure_is_folded_into_result() {
        let store = seeded(3);
        store.fail_next_deletes(1);
        let exec = DeleteExecutor::new(Arc::new(store.clone()), ns());
        let result = exec.execute(&task(&["s000"], false)).await;
        assert_eq!(result.deleted_count, 0);
        assert_eq!(result.attempts, 1);
        assert!(result.error.as_deref().unwrap().contains("transient"));
        assert_eq!(store.len(&ns()), 3);
    }

    #[tokio::test]
    async fn transient_failures_are_retried_when_enabled() {
        let store = seeded(3);
        store.fail_next_deletes(2);
        let exec = DeleteExecutor::new(Arc::new(store.clone()), ns()).with_transient_retries(2);
        let result = exec.execute(&task(&["s000", "s001"], false)).await;
        assert!(result.is_ok());
        assert_eq!(result.attempts, 3);
        assert_eq!(result.deleted_count, 2);
        assert_eq!(store.len(&ns()), 1);
    }

    #[tokio::test]
    async fn retries_are_bounded() {
        let store = seeded(3);
        store.fail_next_deletes(5);
        let exec = DeleteExecutor::new(Arc::new(store.clone()), ns()).with_transient_retries(1);
        let result = exec.execute(&task(&["s000"], false)).await;
        assert!(!result.is_ok());
        assert_eq!(result.attempts, 2);
    }
}
