//! Shared helpers for integration tests.

#![allow(dead_code)]

use std::io::Write;
use std::sync::{Arc, Mutex};

use bulk_purge::store::{Namespace, RawCounters};
use bulk_purge::{MemoryStore, PurgeConfig};
use serde_json::{json, Map, Value};
use tracing_subscriber::fmt::MakeWriter;

pub fn ns() -> Namespace {
    Namespace::new("shop", "sessions")
}

/// One synthetic document; every third one is still active.
pub fn doc(i: usize) -> Map<String, Value> {
    let status = if i % 3 == 0 { "active" } else { "expired" };
    match json!({"seq": i, "status": status, "user": format!("u{}", i % 17)}) {
        Value::Object(map) => map,
        _ => unreachable!(),
    }
}

pub fn docs(n: usize) -> impl Iterator<Item = (String, Map<String, Value>)> {
    (0..n).map(|i| (format!("sess-{i:06}"), doc(i)))
}

pub fn expired_count(n: usize) -> usize {
    (0..n).filter(|i| i % 3 != 0).count()
}

pub fn memory_store(n: usize) -> MemoryStore {
    let store = MemoryStore::new();
    store.insert_many(&ns(), docs(n));
    store
}

/// Config for a real (non-simulated) purge of the test namespace.
pub fn live_config(filter: &str, bucket_size: usize, width: usize) -> PurgeConfig {
    let mut config = PurgeConfig::new("shop", "sessions");
    config.filter = bulk_purge::Filter::from_json_str(filter).unwrap();
    config.safeguard = false;
    config.bucket_size = bucket_size;
    config.concurrency = Some(width);
    config
}

pub fn idle_counters() -> RawCounters {
    RawCounters {
        cache_bytes_in_use: Some(10),
        cache_bytes_max: Some(100),
        cache_dirty_bytes: Some(1),
        cache_update_bytes: Some(0),
        read_tickets_out: Some(1),
        read_tickets_total: Some(128),
        write_tickets_out: Some(1),
        write_tickets_total: Some(128),
        checkpoint_running_ms: Some(0),
        checkpoint_interval_ms: Some(60_000),
        ..RawCounters::default()
    }
}

pub fn saturated_cache() -> RawCounters {
    RawCounters {
        cache_bytes_in_use: Some(97),
        ..idle_counters()
    }
}

/// In-memory sink for formatted log lines.
#[derive(Clone, Default)]
pub struct LogBuffer(Arc<Mutex<Vec<u8>>>);

impl LogBuffer {
    pub fn contents(&self) -> String {
        let guard = self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        String::from_utf8_lossy(&guard).into_owned()
    }
}

pub struct LogWriter(Arc<Mutex<Vec<u8>>>);

impl Write for LogWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let mut guard = self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        guard.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for LogBuffer {
    type Writer = LogWriter;

    fn make_writer(&'a self) -> Self::Writer {
        LogWriter(self.0.clone())
    }
}

/// Capture engine logs on the current thread until the guard drops.
pub fn capture_logs() -> (LogBuffer, tracing::subscriber::DefaultGuard) {
    let buffer = LogBuffer::default();
    let subscriber = tracing_subscriber::fmt()
        .with_ansi(false)
        .with_max_level(tracing::Level::INFO)
        .with_writer(buffer.clone())
        .finish();
    let guard = tracing::subscriber::set_default(subscriber);
    (buffer, guard)
}
