//! End-to-end purges against the in-memory store.
//!
//! Each test seeds a collection, runs `bulk_purge::run` with a given config,
//! and checks the returned report together with what is left in the store.

mod common;

use std::sync::Arc;
use std::time::Duration;

use bulk_purge::store::DocumentStore;
use bulk_purge::PurgeConfig;
use common::{capture_logs, expired_count, live_config, memory_store, ns};

fn shared(store: &bulk_purge::MemoryStore) -> Arc<dyn DocumentStore> {
    Arc::new(store.clone())
}

#[tokio::test]
async fn live_purge_removes_only_matching_documents() {
    let store = memory_store(300);
    let config = live_config(r#"{"status": "expired"}"#, 50, 4);

    let report = bulk_purge::run(shared(&store), &config).await.unwrap();

    let expected = expired_count(300) as u64;
    assert_eq!(report.residual, 0);
    assert_eq!(report.deleted_reported, expected);
    assert_eq!(report.matched, expected);
    assert_eq!(report.buckets, expected.div_ceil(50));
    assert_eq!(report.failed_buckets, 0);
    assert!(!report.simulated);
    assert_eq!(store.len(&ns()) as u64, 300 - expected);
    assert!(store.contains(&ns(), "sess-000000"));
    assert!(!store.contains(&ns(), "sess-000001"));
}

#[tokio::test]
async fn two_hundred_fifty_matches_make_three_buckets() {
    let store = memory_store(250);
    let (logs, _guard) = capture_logs();

    let report = bulk_purge::run(shared(&store), &live_config("{}", 100, 4))
        .await
        .unwrap();

    assert_eq!(report.buckets, 3);
    assert_eq!(report.deleted_reported, 250);
    assert_eq!(report.residual, 0);
    let logs = logs.contents();
    assert!(logs.contains("batch 1 deleted 100 documents"), "{logs}");
    assert!(logs.contains("batch 2 deleted 100 documents"), "{logs}");
    assert!(logs.contains("batch 3 deleted 50 documents"), "{logs}");
}

#[tokio::test]
async fn no_matches_reports_zero_and_says_so() {
    let store = memory_store(40);
    let (logs, _guard) = capture_logs();

    let report = bulk_purge::run(shared(&store), &live_config(r#"{"status": "archived"}"#, 100, 4))
        .await
        .unwrap();

    assert_eq!(report.buckets, 0);
    assert_eq!(report.residual, 0);
    assert_eq!(report.deleted_reported, 0);
    assert_eq!(store.delete_calls(), 0);
    assert_eq!(store.len(&ns()), 40);
    let logs = logs.contents();
    assert!(logs.contains("no matching documents"), "{logs}");
    assert!(logs.contains("0 documents matching the filter remain"), "{logs}");
}

#[tokio::test]
async fn safeguard_leaves_every_document_in_place() {
    let store = memory_store(500);
    let mut config = PurgeConfig::new("shop", "sessions");
    config.concurrency = Some(4);
    assert!(config.safeguard);
    let (logs, _guard) = capture_logs();

    let report = bulk_purge::run(shared(&store), &config).await.unwrap();

    assert!(report.simulated);
    assert_eq!(report.residual, 500);
    assert_eq!(report.deleted_reported, 500);
    assert_eq!(report.buckets, 5);
    assert_eq!(store.len(&ns()), 500);
    let logs = logs.contents();
    assert!(logs.contains("safeguard on"), "{logs}");
    assert!(logs.contains("batch 1 would delete 100 documents"), "{logs}");
    assert!(logs.contains("nothing was removed"), "{logs}");
}

#[tokio::test]
async fn second_run_finds_nothing_left() {
    let store = memory_store(120);
    let config = live_config(r#"{"status": "expired"}"#, 25, 4);

    let first = bulk_purge::run(shared(&store), &config).await.unwrap();
    let second = bulk_purge::run(shared(&store), &config).await.unwrap();

    assert_eq!(first.residual, 0);
    assert_eq!(second.buckets, 0);
    assert_eq!(second.deleted_reported, 0);
    assert_eq!(store.len(&ns()), 120 - expired_count(120));
}

#[tokio::test]
async fn case_insensitive_purge_deletes_and_recounts_under_the_same_collation() {
    let store = memory_store(90);
    let mut config = live_config(r#"{"status": "EXPIRED"}"#, 20, 4);
    config.collation = Some("case_insensitive".to_string());

    let report = bulk_purge::run(shared(&store), &config).await.unwrap();

    let expected = expired_count(90) as u64;
    assert_eq!(report.matched, expected);
    assert_eq!(report.deleted_reported, expected);
    assert_eq!(report.residual, 0);
    assert_eq!(store.len(&ns()) as u64, 90 - expected);
}

#[tokio::test]
async fn case_insensitive_simulation_reports_every_match_as_residual() {
    let store = memory_store(90);
    let mut config = live_config(r#"{"status": "EXPIRED"}"#, 20, 4);
    config.safeguard = true;
    config.collation = Some("case_insensitive".to_string());

    let report = bulk_purge::run(shared(&store), &config).await.unwrap();

    let expected = expired_count(90) as u64;
    assert!(report.simulated);
    assert_eq!(report.matched, expected);
    assert_eq!(report.residual, expected);
    assert_eq!(store.len(&ns()), 90);
}

#[tokio::test(start_paused = true)]
async fn width_four_caps_concurrent_deletes() {
    let store = memory_store(100);
    store.set_delete_latency(Duration::from_millis(50));

    let report = bulk_purge::run(shared(&store), &live_config("{}", 10, 4))
        .await
        .unwrap();

    assert_eq!(report.buckets, 10);
    assert_eq!(report.residual, 0);
    assert!(store.peak_deletes_in_flight() <= 4, "peak {}", store.peak_deletes_in_flight());
    assert!(store.peak_deletes_in_flight() > 1);
}

#[tokio::test(start_paused = true)]
async fn saturated_cache_defers_batches() {
    let store = memory_store(20);
    store.set_counters(common::idle_counters());
    store.script_counters([common::saturated_cache(), common::saturated_cache()]);
    let (logs, _guard) = capture_logs();

    let report = bulk_purge::run(shared(&store), &live_config("{}", 10, 1))
        .await
        .unwrap();

    assert_eq!(report.throttled_waits, 2);
    assert_eq!(report.residual, 0);
    let logs = logs.contents();
    assert!(
        logs.contains("batch 1 awaiting scheduling due to back pressure"),
        "{logs}"
    );
}

#[tokio::test]
async fn failed_bucket_is_reported_and_run_continues() {
    let store = memory_store(60);
    store.fail_next_deletes(1);

    let report = bulk_purge::run(shared(&store), &live_config("{}", 20, 1))
        .await
        .unwrap();

    assert_eq!(report.buckets, 3);
    assert_eq!(report.failed_buckets, 1);
    assert_eq!(report.deleted_reported, 40);
    assert_eq!(report.residual, 20);
}

#[tokio::test]
async fn transient_retries_recover_failed_bucket() {
    let store = memory_store(60);
    store.fail_next_deletes(2);
    let mut config = live_config("{}", 20, 1);
    config.transient_retries = 2;

    let report = bulk_purge::run(shared(&store), &config).await.unwrap();

    assert_eq!(report.failed_buckets, 0);
    assert_eq!(report.residual, 0);
}

#[tokio::test]
async fn telemetry_failure_aborts_run() {
    let store = memory_store(60);
    store.set_status_failing("admin command rejected");

    let err = bulk_purge::run(shared(&store), &live_config("{}", 20, 2))
        .await
        .unwrap_err();

    assert!(format!("{err:#}").contains("admin command rejected"));
    assert_eq!(store.len(&ns()), 60);
}

#[tokio::test]
async fn unsupported_telemetry_falls_back_to_defaults() {
    let store = memory_store(30);
    store.set_status_unsupported();

    let report = bulk_purge::run(shared(&store), &live_config("{}", 10, 2))
        .await
        .unwrap();

    assert_eq!(report.residual, 0);
    assert_eq!(report.throttled_waits, 0);
}

#[tokio::test]
async fn invalid_filter_is_fatal() {
    let store = memory_store(10);
    let err = bulk_purge::run(shared(&store), &live_config(r#"{"seq": {"$regex": "1"}}"#, 10, 1))
        .await
        .unwrap_err();
    assert!(format!("{err:#}").contains("$regex"), "{err:#}");
    assert_eq!(store.len(&ns()), 10);
}

#[tokio::test]
async fn invalid_config_is_rejected_before_touching_the_store() {
    let store = memory_store(10);
    let mut config = live_config("{}", 10, 1);
    config.bucket_size = 0;
    assert!(bulk_purge::run(shared(&store), &config).await.is_err());
    assert_eq!(store.status_calls(), 0);
}
